//! One product-selection unit of the quote

use serde::{Deserialize, Serialize};

use cpq_config::TenantConfig;
use cpq_core::{StageRole, TagPatch};

/// Specification for a single tag (one room, one duct, one position)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagSpecification {
    pub tag_id: String,

    // Filter dimensions (user input)
    pub filter_width: Option<i64>,
    pub filter_height: Option<i64>,
    pub filter_depth: Option<i64>,

    // Housing dimensions (derived)
    pub housing_width: Option<i64>,
    pub housing_height: Option<i64>,
    pub housing_length: Option<i64>,

    pub airflow_m3h: Option<i64>,

    pub product_family: Option<String>,
    pub product_code: Option<String>,

    #[serde(default = "default_one")]
    pub quantity: i64,
    pub weight_kg: Option<f64>,

    // Multi-module aggregation (from the sizing arrangement)
    #[serde(default = "default_one")]
    pub modules_needed: i64,
    pub total_weight_kg: Option<f64>,
    pub total_airflow_m3h: Option<i64>,
    /// Catalog rated capacity per module
    pub rated_airflow_m3h: Option<i64>,

    /// Per-tag override when the locked material is unavailable for this family
    pub material_override: Option<String>,

    pub assembly_role: Option<StageRole>,
    pub assembly_group_id: Option<String>,

    #[serde(default)]
    pub is_complete: bool,
    #[serde(default)]
    pub missing_params: Vec<String>,
}

fn default_one() -> i64 {
    1
}

impl TagSpecification {
    pub fn new(tag_id: impl Into<String>) -> Self {
        Self {
            tag_id: tag_id.into(),
            quantity: 1,
            modules_needed: 1,
            ..Default::default()
        }
    }

    /// Housing size as a `WxH` string, when both dimensions are known
    pub fn housing_size_string(&self) -> Option<String> {
        match (self.housing_width, self.housing_height) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        }
    }

    /// Apply a merge-only patch: fields carrying `None` never blank a value
    pub fn apply_patch(&mut self, patch: &TagPatch) {
        macro_rules! merge {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field.clone();
                }
            };
        }
        merge!(filter_width);
        merge!(filter_height);
        merge!(filter_depth);
        merge!(housing_width);
        merge!(housing_height);
        merge!(housing_length);
        merge!(airflow_m3h);
        merge!(product_family);
        merge!(product_code);
        merge!(weight_kg);
        merge!(material_override);
        merge!(assembly_role);
        merge!(assembly_group_id);
        if let Some(q) = patch.quantity {
            self.quantity = q;
        }
        if let Some(m) = patch.modules_needed {
            self.modules_needed = m;
        }
    }

    /// Map filter dimensions to standard housing sizes, then normalize
    /// orientation
    pub fn compute_housing_from_filter(&mut self, cfg: &TenantConfig) {
        if let Some(fw) = self.filter_width {
            self.housing_width = Some(cfg.map_dimension(fw));
        }
        if let Some(fh) = self.filter_height {
            self.housing_height = Some(cfg.map_dimension(fh));
        }
        self.normalize_orientation(cfg.orientation_threshold);
    }

    /// For small modular housings the larger dimension is always the height.
    /// Larger modules are left alone: the sizing engine owns their
    /// orientation against spatial constraints.
    pub fn normalize_orientation(&mut self, threshold: i64) {
        let (Some(w), Some(h)) = (self.housing_width, self.housing_height) else {
            return;
        };
        if w <= threshold && h <= threshold && w > h {
            self.housing_width = Some(h);
            self.housing_height = Some(w);
            if let (Some(fw), Some(fh)) = (self.filter_width, self.filter_height) {
                if fw > fh {
                    self.filter_width = Some(fh);
                    self.filter_height = Some(fw);
                }
            }
        }
    }

    /// Derive housing length from filter depth. Never overrides an explicit
    /// length.
    pub fn compute_housing_length_from_depth(&mut self, cfg: &TenantConfig) {
        if self.housing_length.is_some() {
            return;
        }
        let Some(depth) = self.filter_depth else {
            return;
        };
        self.housing_length = Some(cfg.derive_housing_length(depth, self.product_family.as_deref()));
    }

    /// Recompute completeness and the missing-parameter list
    pub fn check_completeness(&mut self) -> bool {
        let mut missing = Vec::new();
        if self.housing_width.is_none() || self.housing_height.is_none() {
            if self.filter_width.is_none() || self.filter_height.is_none() {
                missing.push("filter_dimensions".to_string());
            }
        }
        if self.housing_length.is_none() && self.filter_depth.is_none() {
            missing.push("filter_depth".to_string());
        }
        if self.airflow_m3h.is_none() {
            missing.push("airflow".to_string());
        }
        self.missing_params = missing;
        self.is_complete = self.missing_params.is_empty()
            && self.housing_width.is_some()
            && self.housing_height.is_some()
            && self.housing_length.is_some();
        self.is_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TenantConfig {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tenants/hvac_filtration/config.yaml");
        TenantConfig::load(&path).unwrap()
    }

    #[test]
    fn test_dimension_map_known_values() {
        let cfg = cfg();
        for (filter, housing) in [
            (287, 300),
            (305, 300),
            (300, 300),
            (592, 600),
            (610, 600),
            (600, 600),
            (495, 500),
            (500, 500),
        ] {
            let mut tag = TagSpecification::new("t1");
            tag.filter_width = Some(filter);
            tag.filter_height = Some(filter);
            tag.compute_housing_from_filter(&cfg);
            assert_eq!(tag.housing_width, Some(housing), "filter {filter}");
            assert_eq!(tag.housing_height, Some(housing));
        }
    }

    #[test]
    fn test_dimension_map_passthrough_unknown() {
        let cfg = cfg();
        let mut tag = TagSpecification::new("t1");
        tag.filter_width = Some(450);
        tag.filter_height = Some(450);
        tag.compute_housing_from_filter(&cfg);
        assert_eq!(tag.housing_width, Some(450));
        assert_eq!(tag.housing_height, Some(450));
    }

    #[test]
    fn test_orientation_swap_small_modules() {
        let cfg = cfg();
        let mut tag = TagSpecification::new("t1");
        tag.filter_width = Some(610);
        tag.filter_height = Some(305);
        tag.compute_housing_from_filter(&cfg);
        // Mapped to 600x300, then swapped so the larger dim is the height
        assert_eq!(tag.housing_width, Some(300));
        assert_eq!(tag.housing_height, Some(600));
        // Filter dims swap together with housing dims
        assert_eq!(tag.filter_width, Some(305));
        assert_eq!(tag.filter_height, Some(610));
    }

    #[test]
    fn test_orientation_no_swap_large_modules() {
        let cfg = cfg();
        let mut tag = TagSpecification::new("t1");
        tag.filter_width = Some(900);
        tag.filter_height = Some(600);
        tag.compute_housing_from_filter(&cfg);
        assert_eq!(tag.housing_width, Some(900));
        assert_eq!(tag.housing_height, Some(600));
    }

    #[test]
    fn test_orientation_square_untouched() {
        let cfg = cfg();
        let mut tag = TagSpecification::new("t1");
        tag.filter_width = Some(600);
        tag.filter_height = Some(600);
        tag.compute_housing_from_filter(&cfg);
        assert_eq!(tag.housing_width, Some(600));
        assert_eq!(tag.housing_height, Some(600));
    }

    #[test]
    fn test_depth_to_length_breakpoints() {
        let cfg = cfg();
        for (depth, length) in [
            (100, 550),
            (150, 550),
            (292, 550),
            (293, 750),
            (400, 750),
            (450, 750),
            (451, 900),
            (500, 900),
            (600, 900),
        ] {
            let mut tag = TagSpecification::new("t1");
            tag.filter_depth = Some(depth);
            tag.compute_housing_length_from_depth(&cfg);
            assert_eq!(tag.housing_length, Some(length), "depth {depth}");
        }
    }

    #[test]
    fn test_no_depth_no_derivation() {
        let cfg = cfg();
        let mut tag = TagSpecification::new("t1");
        tag.compute_housing_length_from_depth(&cfg);
        assert_eq!(tag.housing_length, None);
    }

    #[test]
    fn test_explicit_length_not_overridden() {
        let cfg = cfg();
        let mut tag = TagSpecification::new("t1");
        tag.filter_depth = Some(292);
        tag.housing_length = Some(900);
        tag.compute_housing_length_from_depth(&cfg);
        assert_eq!(tag.housing_length, Some(900));
    }

    #[test]
    fn test_completeness_requires_all_housing_dims() {
        let mut tag = TagSpecification::new("t1");
        tag.housing_width = Some(600);
        tag.housing_height = Some(600);
        tag.airflow_m3h = Some(3000);
        assert!(!tag.check_completeness());
        assert!(tag.missing_params.contains(&"filter_depth".to_string()));

        tag.housing_length = Some(550);
        assert!(tag.check_completeness());
        assert!(tag.missing_params.is_empty());
    }
}
