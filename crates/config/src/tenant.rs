//! Tenant domain configuration
//!
//! Everything domain-specific lives here, parsed from the tenant YAML file.
//! The core crates contain no product names, material codes, or keyword
//! tables: they read these tables through the typed accessors below.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// One material with its aliases and corrosion rating
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialEntry {
    pub code: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub corrosion_class: String,
}

/// One depth→length derivation breakpoint
///
/// `max_depth: null` marks the catch-all rule; rules are evaluated in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LengthRule {
    pub max_depth: Option<i64>,
    pub length: i64,
}

/// Keyword → product family inference hint for the Scribe fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductHint {
    pub product_family: String,
    pub keywords: Vec<String>,
}

/// Keyword → accessory code hint for the Scribe fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryHint {
    pub code: String,
    pub keywords: Vec<String>,
}

/// Prompt templates consumed by the Scribe adapter and orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTemplates {
    /// Scribe system prompt; `{env_mapping}` / `{app_mapping}` placeholders
    /// are filled from graph keyword tables at startup
    #[serde(default)]
    pub scribe_system: String,
    /// Customer-facing system prompt for the downstream response LLM
    #[serde(default)]
    pub customer_system: String,
    #[serde(default)]
    pub judge_system: String,
    /// Judge user prompt; `{conversation}` / `{product_card}` placeholders
    #[serde(default)]
    pub judge_user: String,
}

/// Parsed tenant configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub domain_id: String,
    pub company: String,

    pub product_families: Vec<String>,
    #[serde(default)]
    pub default_product_family: String,

    pub material_codes: Vec<String>,
    pub material_hierarchy: Vec<MaterialEntry>,
    pub default_material: String,

    /// Filter dimension → standard housing dimension
    pub dimension_mapping: BTreeMap<i64, i64>,
    /// Orientation normalization applies only when both dims are ≤ this
    #[serde(default = "default_orientation_threshold")]
    pub orientation_threshold: i64,
    /// Per-family depth→length breakpoints
    pub housing_length_derivation: BTreeMap<String, Vec<LengthRule>>,

    /// Tag fields synchronized across assembly siblings
    pub assembly_shared_properties: Vec<String>,

    // Fallback extraction tables (used when the Scribe LLM is degraded)
    #[serde(default)]
    pub fallback_application_keywords: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub fallback_environment_terms: Vec<String>,
    #[serde(default)]
    pub fallback_environment_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub fallback_env_to_app_inference: BTreeMap<String, String>,

    // Scribe hint tables
    #[serde(default)]
    pub scribe_product_inference: Vec<ProductHint>,
    #[serde(default)]
    pub scribe_connection_types: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub connection_length_offsets: BTreeMap<String, i64>,
    #[serde(default)]
    pub scribe_material_hints: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub scribe_accessory_hints: Vec<AccessoryHint>,

    #[serde(default)]
    pub prompts: PromptTemplates,
}

fn default_orientation_threshold() -> i64 {
    600
}

impl TenantConfig {
    /// Load and validate a tenant configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        let cfg: TenantConfig =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate structural invariants; called on every load
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.product_families.is_empty() {
            return Err(ConfigError::MissingField("product_families".into()));
        }
        if self.default_product_family.is_empty() {
            return Err(ConfigError::MissingField("default_product_family".into()));
        }
        if !self.material_codes.contains(&self.default_material) {
            return Err(ConfigError::InvalidValue {
                field: "default_material".into(),
                message: format!("{} is not in material_codes", self.default_material),
            });
        }
        for entry in &self.material_hierarchy {
            if entry.code.is_empty() || entry.corrosion_class.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "material_hierarchy".into(),
                    message: "code and corrosion_class are required".into(),
                });
            }
        }
        // Dimension mapping must be monotone: a larger filter dimension never
        // maps to a smaller housing than a smaller filter dimension does.
        let mut prev: Option<(i64, i64)> = None;
        for (&filter, &housing) in &self.dimension_mapping {
            if let Some((pf, ph)) = prev {
                if housing < ph {
                    return Err(ConfigError::InvalidValue {
                        field: "dimension_mapping".into(),
                        message: format!(
                            "non-monotonic: {pf}→{ph} but {filter}→{housing}"
                        ),
                    });
                }
            }
            prev = Some((filter, housing));
        }
        for (family, rules) in &self.housing_length_derivation {
            if rules.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "housing_length_derivation".into(),
                    message: format!("{family} has no rules"),
                });
            }
            if rules.last().unwrap().max_depth.is_some() {
                return Err(ConfigError::InvalidValue {
                    field: "housing_length_derivation".into(),
                    message: format!("{family} lacks a catch-all rule (max_depth: null)"),
                });
            }
        }
        if !self.default_product_family.is_empty()
            && !self
                .housing_length_derivation
                .contains_key(&self.default_product_family)
        {
            return Err(ConfigError::InvalidValue {
                field: "default_product_family".into(),
                message: "no derivation table for default family".into(),
            });
        }
        Ok(())
    }

    /// Map a filter dimension to the standard housing dimension
    ///
    /// Unknown dimensions pass through unchanged.
    pub fn map_dimension(&self, filter_dim: i64) -> i64 {
        self.dimension_mapping
            .get(&filter_dim)
            .copied()
            .unwrap_or(filter_dim)
    }

    /// Derive housing length from filter depth for a family
    ///
    /// Falls back to the default family table when the family has none.
    /// This is the single source of truth: both the cumulative state and the
    /// session store call it, so the two paths cannot diverge.
    pub fn derive_housing_length(&self, filter_depth: i64, family: Option<&str>) -> i64 {
        let rules = family
            .and_then(|f| self.housing_length_derivation.get(f))
            .unwrap_or_else(|| {
                self.housing_length_derivation
                    .get(&self.default_product_family)
                    .expect("validated: default family table exists")
            });
        for rule in rules {
            match rule.max_depth {
                Some(max) if filter_depth <= max => return rule.length,
                Some(_) => continue,
                None => return rule.length,
            }
        }
        rules.last().expect("validated: non-empty").length
    }

    /// Normalize a material code or alias to its canonical code
    pub fn normalize_material(&self, input: &str) -> Option<String> {
        let upper = input.trim().to_uppercase();
        for entry in &self.material_hierarchy {
            if entry.code == upper {
                return Some(entry.code.clone());
            }
            if entry.aliases.iter().any(|a| a.to_uppercase() == upper) {
                return Some(entry.code.clone());
            }
        }
        None
    }

    /// Corrosion class of a material code
    pub fn corrosion_class(&self, code: &str) -> Option<&str> {
        self.material_hierarchy
            .iter()
            .find(|m| m.code == code)
            .map(|m| m.corrosion_class.as_str())
    }

    /// Pinned reference line, e.g. `FZ=C3, AZ=C4, ZM=C5, RF=C5, SF=C5.1`
    pub fn corrosion_reference_line(&self) -> String {
        self.material_hierarchy
            .iter()
            .map(|m| format!("{}={}", m.code, m.corrosion_class))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Length offset added to the housing length for a connection type
    pub fn connection_length_offset(&self, connection: &str) -> i64 {
        self.connection_length_offsets
            .get(connection)
            .copied()
            .unwrap_or(0)
    }
}

static TENANT_CACHE: OnceCell<Arc<TenantConfig>> = OnceCell::new();

/// Install the process-wide tenant config (first call wins)
pub fn init_tenant_cache(cfg: TenantConfig) -> Arc<TenantConfig> {
    TENANT_CACHE.get_or_init(|| Arc::new(cfg)).clone()
}

/// The cached tenant config, if installed
pub fn cached_tenant() -> Option<Arc<TenantConfig>> {
    TENANT_CACHE.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_config_path() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tenants/hvac_filtration/config.yaml")
    }

    fn load_default() -> TenantConfig {
        TenantConfig::load(&workspace_config_path()).expect("default tenant config loads")
    }

    #[test]
    fn test_default_tenant_loads_and_validates() {
        let cfg = load_default();
        assert_eq!(cfg.domain_id, "hvac_filtration");
        assert!(cfg.product_families.contains(&"GDB".to_string()));
        assert_eq!(cfg.default_material, "FZ");
        assert_eq!(cfg.orientation_threshold, 600);
    }

    #[test]
    fn test_dimension_mapping_values() {
        let cfg = load_default();
        assert_eq!(cfg.map_dimension(287), 300);
        assert_eq!(cfg.map_dimension(305), 300);
        assert_eq!(cfg.map_dimension(592), 600);
        assert_eq!(cfg.map_dimension(610), 600);
        assert_eq!(cfg.map_dimension(495), 500);
        assert_eq!(cfg.map_dimension(900), 900);
        // Unknown passes through
        assert_eq!(cfg.map_dimension(450), 450);
    }

    #[test]
    fn test_housing_length_breakpoints() {
        let cfg = load_default();
        assert_eq!(cfg.derive_housing_length(292, Some("GDB")), 550);
        assert_eq!(cfg.derive_housing_length(293, Some("GDB")), 750);
        assert_eq!(cfg.derive_housing_length(450, Some("GDB")), 750);
        assert_eq!(cfg.derive_housing_length(451, Some("GDB")), 900);
        // GDMI has its own table
        assert_eq!(cfg.derive_housing_length(450, Some("GDMI")), 600);
        assert_eq!(cfg.derive_housing_length(451, Some("GDMI")), 850);
        // GDC
        assert_eq!(cfg.derive_housing_length(300, Some("GDC")), 750);
        assert_eq!(cfg.derive_housing_length(451, Some("GDC")), 900);
        // Unknown family falls back to the default family table
        assert_eq!(cfg.derive_housing_length(200, Some("PFF")), 550);
        assert_eq!(cfg.derive_housing_length(200, None), 550);
    }

    #[test]
    fn test_material_aliases() {
        let cfg = load_default();
        assert_eq!(cfg.normalize_material("RF").as_deref(), Some("RF"));
        assert_eq!(cfg.normalize_material("stainless").as_deref(), Some("RF"));
        assert_eq!(cfg.normalize_material("rostfri").as_deref(), Some("RF"));
        assert_eq!(cfg.normalize_material("nierdzewna").as_deref(), Some("RF"));
        assert_eq!(cfg.normalize_material("galvanized").as_deref(), Some("FZ"));
        assert_eq!(cfg.normalize_material("titanium"), None);
    }

    #[test]
    fn test_corrosion_reference_line() {
        let cfg = load_default();
        assert_eq!(
            cfg.corrosion_reference_line(),
            "FZ=C3, AZ=C4, ZM=C5, RF=C5, SF=C5.1"
        );
    }

    #[test]
    fn test_assembly_shared_properties() {
        let cfg = load_default();
        for p in ["filter_width", "filter_height", "airflow_m3h"] {
            assert!(cfg.assembly_shared_properties.contains(&p.to_string()));
        }
        // housing_length is per-stage and must not be synced
        assert!(!cfg
            .assembly_shared_properties
            .contains(&"housing_length".to_string()));
    }

    #[test]
    fn test_fallback_tables() {
        let cfg = load_default();
        assert_eq!(
            cfg.fallback_environment_mapping.get("rooftop").map(String::as_str),
            Some("ENV_ROOFTOP")
        );
        assert_eq!(
            cfg.fallback_env_to_app_inference
                .get("ENV_POOL")
                .map(String::as_str),
            Some("APP_POOL")
        );
        assert!(cfg
            .fallback_application_keywords
            .get("hospital")
            .map(|kws| kws.iter().any(|k| k == "hospital"))
            .unwrap_or(false));
    }

    #[test]
    fn test_connection_length_offset() {
        let cfg = load_default();
        assert_eq!(cfg.connection_length_offset("F"), 50);
        assert_eq!(cfg.connection_length_offset("PG"), 0);
    }

    #[test]
    fn test_missing_catchall_rule_rejected() {
        let mut cfg = load_default();
        cfg.housing_length_derivation.insert(
            "BAD".into(),
            vec![LengthRule {
                max_depth: Some(100),
                length: 550,
            }],
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_default_material_rejected() {
        let mut cfg = load_default();
        cfg.default_material = "XX".into();
        assert!(cfg.validate().is_err());
    }
}
