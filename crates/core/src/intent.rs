//! Semantic intent extracted from a user utterance
//!
//! Produced by the Scribe adapter (LLM-first, regex fallback). All fields are
//! optional-by-default: an empty intent is the degraded-mode result and the
//! pipeline must keep working with it.

use serde::{Deserialize, Serialize};

/// A numeric value with its unit and surrounding context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericConstraint {
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub context: String,
}

/// A reference to a quote entity (tag) in the utterance
///
/// `same_as` / `double` are derived-action markers: the entity copies (or
/// doubles) the numeric fields of the referent after parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityReference {
    pub id: String,
    #[serde(default)]
    pub entity_type: String,
    pub code: Option<String>,
    pub role: Option<String>,
    pub same_as: Option<String>,
    pub double: Option<String>,
    pub filter_width: Option<i64>,
    pub filter_height: Option<i64>,
    pub filter_depth: Option<i64>,
    pub housing_length: Option<i64>,
    pub airflow_m3h: Option<i64>,
    pub quantity: Option<i64>,
}

/// A verb/target pair extracted from the utterance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScribeAction {
    pub verb: String,
    #[serde(default)]
    pub target: String,
    pub value: Option<serde_json::Value>,
}

/// Structured intent for one conversational turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticIntent {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub numeric_constraints: Vec<NumericConstraint>,
    #[serde(default)]
    pub entity_references: Vec<EntityReference>,
    #[serde(default)]
    pub actions: Vec<ScribeAction>,
    #[serde(default)]
    pub action_intent: String,
    #[serde(default)]
    pub context_keywords: Vec<String>,
    pub material: Option<String>,
    pub project_name: Option<String>,
    #[serde(default)]
    pub accessories: Vec<String>,
    /// `APP_…` id when the utterance maps to a known application
    pub detected_application: Option<String>,
    /// `ENV_…` id when the utterance names an installation environment
    pub installation_environment: Option<String>,
    #[serde(default)]
    pub has_specific_constraint: bool,
    /// Diagnostics from derived-action resolution (dropped cycles etc.)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl SemanticIntent {
    /// The degraded-mode result: nothing extracted
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no field carries information
    pub fn is_empty(&self) -> bool {
        self.numeric_constraints.is_empty()
            && self.entity_references.is_empty()
            && self.actions.is_empty()
            && self.context_keywords.is_empty()
            && self.material.is_none()
            && self.project_name.is_none()
            && self.accessories.is_empty()
            && self.detected_application.is_none()
            && self.installation_environment.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_intent_is_empty() {
        assert!(SemanticIntent::empty().is_empty());
    }

    #[test]
    fn test_intent_with_material_is_not_empty() {
        let intent = SemanticIntent {
            material: Some("RF".into()),
            ..Default::default()
        };
        assert!(!intent.is_empty());
    }

    #[test]
    fn test_intent_deserializes_with_missing_fields() {
        let intent: SemanticIntent =
            serde_json::from_str(r#"{"language": "en", "material": "RF"}"#).unwrap();
        assert_eq!(intent.language, "en");
        assert_eq!(intent.material.as_deref(), Some("RF"));
        assert!(intent.entity_references.is_empty());
    }
}
