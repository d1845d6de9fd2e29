//! Merge-only tag field updates
//!
//! A patch carries only the fields present in the current turn; `None` never
//! erases an existing value. Shared between the cumulative state and the
//! session store so both layers apply identical merge semantics.

use serde::{Deserialize, Serialize};

use crate::verdict::StageRole;

/// Partial update for one tag unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagPatch {
    pub filter_width: Option<i64>,
    pub filter_height: Option<i64>,
    pub filter_depth: Option<i64>,
    pub housing_width: Option<i64>,
    pub housing_height: Option<i64>,
    pub housing_length: Option<i64>,
    pub airflow_m3h: Option<i64>,
    pub product_family: Option<String>,
    pub product_code: Option<String>,
    pub weight_kg: Option<f64>,
    pub quantity: Option<i64>,
    pub modules_needed: Option<i64>,
    pub material_override: Option<String>,
    pub assembly_role: Option<StageRole>,
    pub assembly_group_id: Option<String>,
    /// Turn number the data arrived on
    pub source_turn: Option<i64>,
}

impl TagPatch {
    /// Patch with only filter dimensions
    pub fn dimensions(width: i64, height: i64, depth: Option<i64>) -> Self {
        Self {
            filter_width: Some(width),
            filter_height: Some(height),
            filter_depth: depth,
            ..Default::default()
        }
    }

    /// True when every field is `None`
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patch_is_empty() {
        assert!(TagPatch::default().is_empty());
        assert!(!TagPatch::dimensions(600, 600, None).is_empty());
    }
}
