//! Read surface over the knowledge graph

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::GraphResult;
use crate::rows::*;

/// Typed, read-mostly operations over the knowledge graph
///
/// The engine depends only on this trait; concrete query strings are backend
/// detail. All operations tolerate a cold graph: an empty result is an empty
/// shape, never an error.
#[async_trait]
pub trait GraphReader: Send + Sync {
    /// Stressors whose keyword list intersects the query tokens
    async fn get_stressors_by_keywords(&self, keywords: &[String])
        -> GraphResult<Vec<StressorRow>>;

    /// Stressors reachable from an application/environment via
    /// `IS_A*0..5` then `EXPOSES_TO`
    async fn get_stressors_for_application(&self, app_id: &str)
        -> GraphResult<Vec<StressorRow>>;

    /// An environment id plus all its `IS_A` ancestors
    async fn resolve_environment_hierarchy(&self, env_id: &str) -> GraphResult<Vec<String>>;

    /// Environment keyword tables for Scribe prompt enrichment
    async fn get_environment_keywords(&self) -> GraphResult<BTreeMap<String, Vec<String>>>;

    /// All application nodes (Scribe prompt enrichment)
    async fn get_all_applications(&self) -> GraphResult<Vec<ApplicationRow>>;

    /// NEUTRALIZED_BY and DEMANDS_TRAIT edges touching the given stressors
    async fn get_causal_rules_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<CausalRuleRow>>;

    /// Batched: every product family with direct + material-provided traits
    async fn get_all_product_families_with_traits(&self)
        -> GraphResult<Vec<ProductFamilyRow>>;

    /// Traits of one family with provenance
    async fn get_product_traits(&self, family: &str) -> GraphResult<Vec<TraitRow>>;

    async fn get_hard_constraints(&self, family: &str) -> GraphResult<Vec<HardConstraintRow>>;

    async fn get_installation_constraints(
        &self,
        family: &str,
    ) -> GraphResult<Vec<InstallationConstraintRow>>;

    async fn get_variable_features(&self, family: &str)
        -> GraphResult<Vec<VariableFeatureRow>>;

    async fn get_capacity_rules(&self, family: &str) -> GraphResult<Vec<CapacityRuleRow>>;

    async fn get_optimization_strategy(&self, family: &str)
        -> GraphResult<Option<StrategyRow>>;

    async fn get_logic_gates_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<LogicGateRow>>;

    async fn get_gates_triggered_by_context(
        &self,
        context_ids: &[String],
    ) -> GraphResult<Vec<LogicGateRow>>;

    async fn get_dependency_rules_for_stressors(
        &self,
        stressor_ids: &[String],
    ) -> GraphResult<Vec<DependencyRuleRow>>;

    /// Parameters globally required for a family
    async fn get_required_parameters(&self, family: &str) -> GraphResult<Vec<ParameterRow>>;

    /// Parameters demanded by clarification rules active for an application
    async fn get_contextual_clarifications(
        &self,
        application_id: &str,
        family: Option<&str>,
    ) -> GraphResult<Vec<ParameterRow>>;

    /// Module variants of a family, highest-rated first
    async fn get_available_dimension_modules(
        &self,
        family: &str,
    ) -> GraphResult<Vec<DimensionModuleRow>>;

    /// Catalog airflow rating for a WxH variant of a family
    async fn get_reference_airflow_for_dimensions(
        &self,
        width_mm: i64,
        height_mm: i64,
        family: Option<&str>,
    ) -> GraphResult<Option<i64>>;

    /// Exact-variant weight (`{family}-{W}x{H}[-{L}]` naming)
    async fn get_variant_weight(
        &self,
        variant_name: &str,
        housing_length: Option<i64>,
    ) -> GraphResult<Option<f64>>;

    /// Parametric weight model fallback
    async fn get_dimension_module_weight(
        &self,
        width_mm: i64,
        height_mm: i64,
    ) -> GraphResult<Option<ModuleWeightRow>>;

    async fn get_product_family_code_format(
        &self,
        family: &str,
    ) -> GraphResult<Option<CodeFormatRow>>;

    async fn get_accessory_compatibility(
        &self,
        accessory_code: &str,
        family: &str,
    ) -> GraphResult<AccessoryCompatRow>;

    async fn get_all_accessory_codes(&self) -> GraphResult<Vec<AccessoryRow>>;

    /// Numeric property of a material available on a family
    async fn get_material_property(
        &self,
        family: &str,
        material_code: &str,
        property: &str,
    ) -> GraphResult<Option<f64>>;

    /// Property on a node related to the family via `rel_type`, selected by
    /// `match_prop == match_val`
    async fn get_related_node_property(
        &self,
        family: &str,
        rel_type: &str,
        match_prop: &str,
        match_val: &serde_json::Value,
        target_prop: &str,
    ) -> GraphResult<Option<serde_json::Value>>;

    /// Related nodes whose `threshold_prop >= min_threshold`
    async fn find_compatible_variants(
        &self,
        family: &str,
        rel_type: &str,
        match_prop: &str,
        threshold_prop: &str,
        min_threshold: f64,
    ) -> GraphResult<Vec<VariantThresholdRow>>;

    async fn find_alternatives_for_space_constraint(
        &self,
        blocked_family: &str,
        dimension_key: &str,
        available_space: f64,
        dim_value: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>>;

    async fn find_alternatives_for_environment_constraint(
        &self,
        blocked_family: &str,
        env_chain: &[String],
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>>;

    async fn find_material_alternatives_for_threshold(
        &self,
        family: &str,
        cross_property: &str,
        required_value: f64,
    ) -> GraphResult<Vec<MaterialAltRow>>;

    async fn find_other_products_for_material_threshold(
        &self,
        blocked_family: &str,
        cross_property: &str,
        required_value: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<ProductAltRow>>;

    async fn find_products_with_higher_capacity(
        &self,
        blocked_family: &str,
        module_descriptor: &str,
        min_output_rating: f64,
        required_trait_ids: &[String],
    ) -> GraphResult<Vec<CapacityAltRow>>;
}
