//! Engine verdict types
//!
//! The verdict is the complete, immutable result of one pass through the
//! reasoning pipeline. Downstream consumers (the report adapter, the prompt
//! injection builder, the session state) read from it only through these
//! fields; there is no side channel.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity carried by rule edges and violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

impl Severity {
    /// Parse a severity string from a graph edge, if valid
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRITICAL" => Some(Severity::Critical),
            "WARNING" => Some(Severity::Warning),
            "INFO" => Some(Severity::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// How a stressor was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Keyword,
    ApplicationLink,
    EnvironmentLink,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::Keyword => write!(f, "keyword"),
            DetectionMethod::ApplicationLink => write!(f, "application_link"),
            DetectionMethod::EnvironmentLink => write!(f, "environment_link"),
        }
    }
}

/// An environmental attack vector found in the query or its context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedStressor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub detection_method: DetectionMethod,
    /// 1.0 for exact keyword match, 0.9 for application/environment link
    pub confidence: f64,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    /// Application or environment name the stressor was reached through
    pub source_context: Option<String>,
}

/// Causal rule shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    /// The environment requires this capability
    DemandsTrait,
    /// This capability is defeated in this environment
    NeutralizedBy,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::DemandsTrait => write!(f, "DEMANDS_TRAIT"),
            RuleKind::NeutralizedBy => write!(f, "NEUTRALIZED_BY"),
        }
    }
}

/// A physics rule active for the detected stressor set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalRule {
    pub rule_type: RuleKind,
    pub stressor_id: String,
    pub stressor_name: String,
    pub trait_id: String,
    pub trait_name: String,
    pub severity: Severity,
    pub explanation: String,
}

/// Trait coverage of one candidate product family
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraitMatch {
    pub product_family_id: String,
    pub product_family_name: String,
    #[serde(default)]
    pub selection_priority: i64,
    /// Trait ids demanded and present on the candidate
    #[serde(default)]
    pub traits_present: Vec<String>,
    /// Trait ids demanded but absent
    #[serde(default)]
    pub traits_missing: Vec<String>,
    /// Trait ids present but neutralized by an active stressor
    #[serde(default)]
    pub traits_neutralized: Vec<String>,
    /// |present| / max(1, |demanded|), in [0, 1]
    #[serde(default)]
    pub coverage_score: f64,
    #[serde(default)]
    pub vetoed: bool,
    #[serde(default)]
    pub veto_reasons: Vec<String>,
}

/// Role of a stage in a multi-stage assembly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageRole {
    Protector,
    Target,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageRole::Protector => write!(f, "PROTECTOR"),
            StageRole::Target => write!(f, "TARGET"),
        }
    }
}

impl StageRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROTECTOR" => Some(StageRole::Protector),
            "TARGET" => Some(StageRole::Target),
            _ => None,
        }
    }
}

/// One stage of a multi-stage assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyStage {
    pub role: StageRole,
    pub product_family_id: String,
    pub product_family_name: String,
    pub provides_trait_id: String,
    pub provides_trait_name: String,
    pub reason: String,
}

/// Evaluation state of a logic gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Fired,
    ValidationRequired,
    Deferred,
    Inactive,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Fired => write!(f, "FIRED"),
            GateState::ValidationRequired => write!(f, "VALIDATION_REQUIRED"),
            GateState::Deferred => write!(f, "DEFERRED"),
            GateState::Inactive => write!(f, "INACTIVE"),
        }
    }
}

/// A parameter a gate needs before it can evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateParameter {
    pub param_id: String,
    pub name: String,
    pub property_key: String,
    pub question: String,
    pub unit: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

/// Result of evaluating one logic gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub gate_id: String,
    pub gate_name: String,
    pub state: GateState,
    pub stressor_id: String,
    pub stressor_name: String,
    pub physics_explanation: String,
    #[serde(default)]
    pub missing_parameters: Vec<GateParameter>,
}

/// A hard constraint auto-correction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintOverride {
    pub item_id: String,
    pub property_key: String,
    pub operator: String,
    pub original_value: f64,
    pub corrected_value: f64,
    pub error_msg: String,
}

/// An option of a variable feature
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureOption {
    pub value: String,
    pub name: String,
    #[serde(default)]
    pub display_label: String,
    #[serde(default)]
    pub benefit: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_recommended: bool,
    pub min_required_housing_length: Option<i64>,
    pub length_offset_mm: Option<i64>,
}

/// A variable feature the user has not resolved yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingParameter {
    pub feature_id: String,
    pub feature_name: String,
    pub parameter_name: String,
    pub question: String,
    pub why_needed: String,
    #[serde(default)]
    pub options: Vec<FeatureOption>,
}

/// Accessory compatibility outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessoryStatus {
    /// Explicit allow edge in the graph
    Allowed,
    /// Explicit deny edge
    Blocked,
    /// No edge either way (default-deny)
    NotAllowed,
    /// Accessory id not present in the graph
    Unknown,
}

impl fmt::Display for AccessoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessoryStatus::Allowed => write!(f, "ALLOWED"),
            AccessoryStatus::Blocked => write!(f, "BLOCKED"),
            AccessoryStatus::NotAllowed => write!(f, "NOT_ALLOWED"),
            AccessoryStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Result of validating one requested accessory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryValidation {
    pub product_family_id: String,
    pub accessory_code: String,
    pub accessory_name: String,
    pub is_compatible: bool,
    pub status: AccessoryStatus,
    pub reason: Option<String>,
    #[serde(default)]
    pub compatible_alternatives: Vec<String>,
}

/// Closed set of installation constraint kinds
///
/// The set is known at compile time from the schema; dispatch is over this
/// enum, not a runtime string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintType {
    SetMembership,
    ComputedFormula,
    CrossNodeThreshold,
    CrossPropertyCompare,
    ContextMatch,
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintType::SetMembership => write!(f, "SET_MEMBERSHIP"),
            ConstraintType::ComputedFormula => write!(f, "COMPUTED_FORMULA"),
            ConstraintType::CrossNodeThreshold => write!(f, "CROSS_NODE_THRESHOLD"),
            ConstraintType::CrossPropertyCompare => write!(f, "CROSS_PROPERTY_COMPARE"),
            ConstraintType::ContextMatch => write!(f, "CONTEXT_MATCH"),
        }
    }
}

impl ConstraintType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SET_MEMBERSHIP" => Some(ConstraintType::SetMembership),
            "COMPUTED_FORMULA" => Some(ConstraintType::ComputedFormula),
            "CROSS_NODE_THRESHOLD" => Some(ConstraintType::CrossNodeThreshold),
            "CROSS_PROPERTY_COMPARE" => Some(ConstraintType::CrossPropertyCompare),
            "CONTEXT_MATCH" => Some(ConstraintType::ContextMatch),
            _ => None,
        }
    }
}

/// A verified alternative offered next to a violation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlternativeProduct {
    pub product_family_id: String,
    pub product_family_name: String,
    pub why_it_works: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AlternativeProduct {
    /// Whether this alternative is the blocked product in a different material
    pub fn is_material_change(&self) -> bool {
        self.details
            .get("is_material_change")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// One violated installation constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationViolation {
    pub constraint_id: String,
    pub constraint_type: ConstraintType,
    pub severity: Severity,
    pub error_msg: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub alternatives: Vec<AlternativeProduct>,
}

/// Capacity calculation for the recommended family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityCalculation {
    pub input_value: f64,
    pub input_requirement: String,
    pub output_rating: f64,
    pub modules_needed: i64,
    pub module_descriptor: String,
    pub assumption: Option<String>,
    pub description: Option<String>,
}

/// Module grid arrangement from the sizing phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingArrangement {
    pub selected_module_id: String,
    pub selected_module_label: String,
    pub selected_module_width: i64,
    pub selected_module_height: i64,
    pub reference_airflow_per_module: i64,
    pub modules_needed: i64,
    pub horizontal_count: i64,
    pub vertical_count: i64,
    pub effective_width: i64,
    pub effective_height: i64,
    pub max_width_mm: Option<i64>,
    pub max_height_mm: Option<i64>,
    #[serde(default)]
    pub width_constrained: bool,
    #[serde(default)]
    pub height_constrained: bool,
}

/// A clarification question to surface to the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationItem {
    pub param_id: String,
    pub param_name: String,
    pub property_key: String,
    pub question: String,
    pub priority: i64,
    pub unit: Option<String>,
    /// Rule name when triggered by a contextual clarification rule
    pub triggered_by: Option<String>,
}

/// Application context carried on the verdict when detection went through one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationContext {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// One structured record of a pipeline phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub stage: String,
    pub summary: String,
    pub details: Option<serde_json::Value>,
}

impl TraceStep {
    pub fn new(stage: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            summary: summary.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Complete result of one reasoning pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineVerdict {
    #[serde(default)]
    pub detected_stressors: Vec<DetectedStressor>,
    #[serde(default)]
    pub active_causal_rules: Vec<CausalRule>,
    #[serde(default)]
    pub ranked_products: Vec<TraitMatch>,
    pub recommended_product: Option<TraitMatch>,
    #[serde(default)]
    pub vetoed_products: Vec<TraitMatch>,

    #[serde(default)]
    pub is_assembly: bool,
    #[serde(default)]
    pub assembly: Vec<AssemblyStage>,
    pub assembly_rationale: Option<String>,

    #[serde(default)]
    pub has_veto: bool,
    pub auto_pivot_to: Option<String>,
    pub auto_pivot_name: Option<String>,
    pub veto_reason: Option<String>,

    #[serde(default)]
    pub gate_evaluations: Vec<GateEvaluation>,
    #[serde(default)]
    pub constraint_overrides: Vec<ConstraintOverride>,
    pub capacity_calculation: Option<CapacityCalculation>,
    #[serde(default)]
    pub capacity_alternatives: Vec<AlternativeProduct>,
    pub sizing_arrangement: Option<SizingArrangement>,
    #[serde(default)]
    pub missing_parameters: Vec<MissingParameter>,
    #[serde(default)]
    pub accessory_validations: Vec<AccessoryValidation>,
    #[serde(default)]
    pub installation_violations: Vec<InstallationViolation>,
    #[serde(default)]
    pub has_installation_block: bool,
    #[serde(default)]
    pub clarification_questions: Vec<ClarificationItem>,
    #[serde(default)]
    pub reasoning_trace: Vec<TraceStep>,
    pub application_match: Option<ApplicationContext>,
}

impl EngineVerdict {
    /// Whether every ranked candidate is vetoed (nothing left to recommend)
    pub fn all_candidates_vetoed(&self) -> bool {
        !self.ranked_products.is_empty() && self.ranked_products.iter().all(|m| m.vetoed)
    }

    /// Append a trace step
    pub fn trace(&mut self, step: TraceStep) {
        self.reasoning_trace.push(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_parse_rejects_unknown() {
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("FATAL"), None);
    }

    #[test]
    fn test_constraint_type_roundtrip() {
        for s in [
            "SET_MEMBERSHIP",
            "COMPUTED_FORMULA",
            "CROSS_NODE_THRESHOLD",
            "CROSS_PROPERTY_COMPARE",
            "CONTEXT_MATCH",
        ] {
            let ct = ConstraintType::parse(s).unwrap();
            assert_eq!(ct.to_string(), s);
        }
    }

    #[test]
    fn test_all_candidates_vetoed() {
        let mut v = EngineVerdict::default();
        assert!(!v.all_candidates_vetoed());

        v.ranked_products = vec![
            TraitMatch {
                vetoed: true,
                ..Default::default()
            },
            TraitMatch {
                vetoed: true,
                ..Default::default()
            },
        ];
        assert!(v.all_candidates_vetoed());

        v.ranked_products[1].vetoed = false;
        assert!(!v.all_candidates_vetoed());
    }

    #[test]
    fn test_material_change_flag() {
        let mut alt = AlternativeProduct::default();
        assert!(!alt.is_material_change());
        alt.details
            .insert("is_material_change".into(), serde_json::json!(true));
        assert!(alt.is_material_change());
    }

    #[test]
    fn test_verdict_serde_roundtrip() {
        let mut v = EngineVerdict::default();
        v.has_veto = true;
        v.veto_reason = Some("missing grease pre-filtration".into());
        v.reasoning_trace.push(TraceStep::new("veto", "1 product vetoed"));
        let json = serde_json::to_string(&v).unwrap();
        let back: EngineVerdict = serde_json::from_str(&json).unwrap();
        assert!(back.has_veto);
        assert_eq!(back.reasoning_trace.len(), 1);
    }
}
