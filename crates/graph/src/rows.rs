//! Typed rows returned by the graph query surface
//!
//! Enum-valued edge properties (severity, rule type, constraint type) stay as
//! raw strings here; the engine parses them and drops records that violate
//! schema invariants, recording the drop in its trace.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use cpq_core::verdict::FeatureOption;

/// An environmental stressor hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressorRow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    /// Name of the application/environment node the stressor was reached from
    pub source_context: Option<String>,
}

/// One causal rule edge (NEUTRALIZED_BY or DEMANDS_TRAIT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalRuleRow {
    pub rule_type: String,
    pub trait_id: String,
    pub trait_name: String,
    pub stressor_id: String,
    pub stressor_name: String,
    pub severity: String,
    pub explanation: Option<String>,
}

/// A product family with its full trait closure (batched query)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductFamilyRow {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub selection_priority: i64,
    #[serde(default)]
    pub direct_trait_ids: Vec<String>,
    #[serde(default)]
    pub material_trait_ids: Vec<String>,
    #[serde(default)]
    pub all_trait_ids: Vec<String>,
}

/// A trait on a product family, with its provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitRow {
    pub id: String,
    pub name: String,
    /// `direct` or the providing material code
    pub source: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// A Playbook parameter (gate requirement or clarification)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterRow {
    pub param_id: String,
    pub name: String,
    pub property_key: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub question: String,
    pub unit: Option<String>,
    /// Clarification rule that demanded this parameter, when contextual
    pub rule_name: Option<String>,
}

/// A logic gate with its data requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicGateRow {
    pub gate_id: String,
    pub gate_name: String,
    #[serde(default)]
    pub condition_logic: String,
    #[serde(default)]
    pub physics_explanation: String,
    pub stressor_id: String,
    pub stressor_name: String,
    pub context_id: Option<String>,
    #[serde(default)]
    pub params: Vec<ParameterRow>,
}

/// A hard constraint on a resolved parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardConstraintRow {
    pub id: String,
    pub property_key: String,
    pub operator: String,
    pub value: f64,
    #[serde(default)]
    pub error_msg: String,
}

/// An installation constraint with family-level context properties
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallationConstraintRow {
    pub id: String,
    pub constraint_type: String,
    pub severity: String,
    #[serde(default)]
    pub error_msg: String,
    pub operator: Option<String>,
    /// COMPUTED_FORMULA: which dimension the formula applies to
    pub dimension_key: Option<String>,
    /// Context key providing the compared input value
    pub input_key: Option<String>,
    /// CROSS_NODE_THRESHOLD / CROSS_PROPERTY_COMPARE: property on the related node
    pub cross_property: Option<String>,
    /// CROSS_PROPERTY_COMPARE: relationship from the family to the related node
    pub cross_rel_type: Option<String>,
    /// CROSS_PROPERTY_COMPARE: property used to select the related node
    pub cross_node_match_property: Option<String>,
    /// Context key whose value selects the related node
    pub comparison_key: Option<String>,
    /// CROSS_NODE_THRESHOLD: context key naming the material to check
    pub material_context_key: Option<String>,
    /// CONTEXT_MATCH: context key holding the required value
    pub context_match_key: Option<String>,
    /// SET_MEMBERSHIP: explicit valid set on the constraint
    #[serde(default)]
    pub valid_set: Vec<String>,
    // Family-level properties joined in for the handlers
    pub service_access_factor: Option<f64>,
    pub service_access_type: Option<String>,
    #[serde(default)]
    pub allowed_environments: Vec<String>,
    /// CONTEXT_MATCH: the product-side property value (e.g. corrosion class)
    pub product_property_value: Option<String>,
}

/// A dependency rule (assembly mandate)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRuleRow {
    pub id: String,
    pub dependency_type: String,
    #[serde(default)]
    pub description: String,
    pub upstream_trait_id: String,
    pub upstream_trait_name: String,
    pub downstream_trait_id: String,
    pub downstream_trait_name: String,
    pub stressor_id: String,
    pub stressor_name: String,
    pub protector_family_id: Option<String>,
    pub protector_family_name: Option<String>,
}

/// Optimization strategy for a family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRow {
    pub id: String,
    pub name: String,
    pub sort_property: Option<String>,
    pub sort_order: Option<String>,
    pub primary_axis: Option<String>,
    pub secondary_axis: Option<String>,
    pub expansion_unit: Option<String>,
    pub description: Option<String>,
}

/// Capacity rating of a family's module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRuleRow {
    pub id: String,
    pub module_descriptor: String,
    pub input_requirement: String,
    pub output_rating: f64,
    pub assumption: Option<String>,
    pub description: Option<String>,
    pub capacity_per_component: Option<f64>,
    pub component_count_key: Option<String>,
}

/// A variable feature with its options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableFeatureRow {
    pub feature_id: String,
    pub feature_name: String,
    pub parameter_name: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub why_needed: String,
    pub default_value: Option<String>,
    #[serde(default)]
    pub auto_resolve: bool,
    #[serde(default)]
    pub options: Vec<FeatureOption>,
}

/// A sized module variant of a family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionModuleRow {
    pub id: String,
    pub width_mm: i64,
    pub height_mm: i64,
    pub reference_airflow_m3h: Option<i64>,
    #[serde(default)]
    pub label: String,
}

/// Parametric weight model of a dimension module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleWeightRow {
    pub unit_weight_kg: f64,
    pub weight_per_mm_length: Option<f64>,
    pub reference_length_mm: Option<i64>,
}

/// Product-code template of a family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFormatRow {
    pub fmt: Option<String>,
    pub default_frame_depth: Option<i64>,
}

/// Accessory compatibility verdict from the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryCompatRow {
    pub accessory_code: String,
    pub accessory_name: String,
    pub product_family_id: String,
    /// ALLOWED | BLOCKED | NOT_ALLOWED | UNKNOWN
    pub status: String,
    pub reason: Option<String>,
    #[serde(default)]
    pub compatible_alternatives: Vec<String>,
}

/// A known accessory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryRow {
    pub id: String,
    pub code: String,
    pub name: String,
}

/// An application node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A product family offered as an alternative in a violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAltRow {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub selection_priority: i64,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// A material on the same product crossing a threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialAltRow {
    pub material_code: String,
    pub material_name: String,
    pub threshold_value: f64,
}

/// A family with a higher-rated capacity module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityAltRow {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub selection_priority: i64,
    pub output_rating: f64,
    pub description: Option<String>,
}

/// A related-node value crossing a threshold (variant alternatives)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantThresholdRow {
    pub variant_value: serde_json::Value,
    pub threshold: f64,
}
