//! Per-request engine context
//!
//! Carries tokens resolved upstream of the reasoning pipeline: detected
//! application/environment ids and the numeric/string parameters known so far
//! (session state plus current-turn extraction).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Inputs the engine reads besides the raw query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineContext {
    /// `APP_…` id from intent extraction, if any
    pub detected_application: Option<String>,
    /// `ENV_…` id from intent extraction, if any
    pub installation_environment: Option<String>,
    /// Material code locked or requested so far
    pub material: Option<String>,
    /// Accessory codes requested so far
    #[serde(default)]
    pub accessories: Vec<String>,
    /// Resolved parameters keyed by property_key (filter dims, airflow,
    /// max_width_mm, gate answers, …)
    #[serde(default)]
    pub resolved: BTreeMap<String, serde_json::Value>,
}

impl EngineContext {
    /// Numeric view of a resolved parameter
    pub fn resolved_number(&self, key: &str) -> Option<f64> {
        match self.resolved.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String view of a resolved parameter
    pub fn resolved_str(&self, key: &str) -> Option<String> {
        match self.resolved.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Whether a parameter is present (any non-null value)
    pub fn has(&self, key: &str) -> bool {
        self.resolved
            .get(key)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }

    pub fn set_number(&mut self, key: impl Into<String>, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.resolved.insert(key.into(), serde_json::Value::Number(n));
        }
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.resolved
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Context ids for gate triggering (application + environment)
    pub fn context_ids(&self) -> Vec<String> {
        self.detected_application
            .iter()
            .chain(self.installation_environment.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_number_parses_strings() {
        let mut ctx = EngineContext::default();
        ctx.set_str("chlorine_ppm", "0.5");
        assert_eq!(ctx.resolved_number("chlorine_ppm"), Some(0.5));

        ctx.set_number("airflow_m3h", 3000.0);
        assert_eq!(ctx.resolved_number("airflow_m3h"), Some(3000.0));
    }

    #[test]
    fn test_context_ids_order() {
        let ctx = EngineContext {
            detected_application: Some("APP_POOL".into()),
            installation_environment: Some("ENV_INDOOR".into()),
            ..Default::default()
        };
        assert_eq!(ctx.context_ids(), vec!["APP_POOL", "ENV_INDOOR"]);
    }

    #[test]
    fn test_has_ignores_null() {
        let mut ctx = EngineContext::default();
        ctx.resolved.insert("x".into(), serde_json::Value::Null);
        assert!(!ctx.has("x"));
        ctx.set_number("x", 1.0);
        assert!(ctx.has("x"));
    }
}
