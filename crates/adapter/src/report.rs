//! Presentation-layer report types

use serde::{Deserialize, Serialize};

use cpq_core::{AccessoryValidation, MissingParameter, Severity, TraceStep};

/// Application context detected for the query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationMatch {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub matched_keyword: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Required material capability expressed as a corrosion class, not a
/// specific material: the retriever resolves to the product's available
/// materials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialRequirement {
    pub corrosion_class: String,
    pub description: String,
    pub reason: String,
}

/// Categorized warning surfaced to the UI and the response LLM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskType {
    TraitVeto,
    TraitGap,
    TraitNeutralization,
    HardConstraintOverride,
    GateValidationRequired,
    GateFired,
    AccessoryBlocked,
    InstallationBlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWarning {
    pub risk_name: String,
    pub risk_type: RiskType,
    pub severity: Severity,
    pub description: String,
    pub consequence: String,
    pub mitigation: String,
    pub graph_path: String,
}

/// A question the response LLM must surface before finalizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub param_id: String,
    pub param_name: String,
    pub property_key: String,
    pub question_text: String,
    pub priority: i64,
    pub triggered_by: Option<String>,
}

/// Automatic substitution record (never emitted for assemblies)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductPivot {
    pub original_product: String,
    pub pivoted_to: String,
    pub reason: String,
    pub physics_explanation: String,
    pub required_feature: String,
}

/// Aggregate suitability view
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuitabilityResult {
    pub is_suitable: bool,
    #[serde(default)]
    pub warnings: Vec<RiskWarning>,
    #[serde(default)]
    pub required_materials: Vec<MaterialRequirement>,
}

/// Complete reasoning report handed to the presentation layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphReasoningReport {
    pub application: Option<ApplicationMatch>,
    pub suitability: SuitabilityResult,
    #[serde(default)]
    pub clarifications: Vec<ClarificationQuestion>,
    #[serde(default)]
    pub variable_features: Vec<MissingParameter>,
    #[serde(default)]
    pub accessory_compatibility: Vec<AccessoryValidation>,
    pub product_pivot: Option<ProductPivot>,
    #[serde(default)]
    pub reasoning_steps: Vec<TraceStep>,
}
