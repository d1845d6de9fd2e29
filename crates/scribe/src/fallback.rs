//! Regex fallback extraction
//!
//! Runs when the Scribe LLM is degraded, and fills gaps the LLM left. Every
//! keyword table comes from tenant config; no domain strings live here.

use regex::Regex;

use cpq_config::TenantConfig;
use cpq_core::{EntityReference, SemanticIntent};

/// Config-driven regex extractor
pub struct FallbackExtractor {
    tag_pattern: Regex,
    dim_pattern: Regex,
    airflow_pattern: Regex,
    depth_pattern: Regex,
    duct_patterns: Vec<Regex>,
    project_patterns: Vec<Regex>,
    comma_thousands: Regex,
    space_thousands: Regex,
    dot_thousands: Regex,
    config: std::sync::Arc<TenantConfig>,
}

impl FallbackExtractor {
    pub fn new(config: std::sync::Arc<TenantConfig>) -> Self {
        Self {
            tag_pattern: Regex::new(
                r"(?i)(?:tag|item|pos(?:ition)?)\s*[:#-]?\s*(\w+)[:\-\s]+(\d{2,4})[x×X](\d{2,4})(?:[x×X](\d{2,4}))?",
            )
            .expect("static pattern"),
            dim_pattern: Regex::new(r"(\d{2,4})[x×X](\d{2,4})(?:[x×X](\d{2,4}))?(?:\s*mm)?")
                .expect("static pattern"),
            airflow_pattern: Regex::new(r"(?i)(\d{3,6})\s*(?:m³/h|m3/h|m³|m3h|cbm|cubic)")
                .expect("static pattern"),
            depth_pattern: Regex::new(r"(?i)(?:depth|deep|djup)\s*:?\s*(\d{2,4})\s*mm")
                .expect("static pattern"),
            duct_patterns: vec![
                Regex::new(r"[Øø⌀]\s*(\d{2,4})\s*(?:mm)?").expect("static pattern"),
                Regex::new(r"(?i)(\d{2,4})\s*mm\s+(?:round|circular)\s+(?:ducts?|connections?|pipes?)")
                    .expect("static pattern"),
                Regex::new(
                    r"(?i)(?:round|circular)\s+(?:ducts?|connections?|pipes?)\s*\(?(\d{2,4})\s*(?:mm)?",
                )
                .expect("static pattern"),
                Regex::new(r"(?i)(\d{2,4})\s*mm\s+diameter\s+(?:round|circular)?\s*(?:ducts?|pipes?)")
                    .expect("static pattern"),
            ],
            project_patterns: vec![
                Regex::new(r"(?i)(?:project|projekt)\s+([A-Z][A-Za-z0-9]+)").expect("static pattern"),
                Regex::new(r"([A-Z][A-Za-z0-9]+)\s+(?i:project)").expect("static pattern"),
            ],
            comma_thousands: Regex::new(r"(\d{1,3}),(\d{3})\b").expect("static pattern"),
            space_thousands: Regex::new(r"(\d{1,3}) (\d{3})\b").expect("static pattern"),
            dot_thousands: Regex::new(r"(\d{1,3})\.(\d{3})\b").expect("static pattern"),
            config,
        }
    }

    /// Collapse thousand separators (comma, space, dot) without touching
    /// dimension strings like `600x600`
    pub fn normalize_numbers(&self, text: &str) -> String {
        let text = self.comma_thousands.replace_all(text, "$1$2");
        let text = self.space_thousands.replace_all(&text, "$1$2");
        self.dot_thousands.replace_all(&text, "$1$2").into_owned()
    }

    /// Full fallback pass over an utterance
    pub fn extract(&self, utterance: &str) -> SemanticIntent {
        let mut intent = SemanticIntent {
            language: "en".to_string(),
            ..Default::default()
        };
        intent.entity_references = self.extract_tags(utterance);
        intent.material = self.extract_material(utterance);
        intent.project_name = self.extract_project(utterance);
        intent.accessories = self.extract_accessories(utterance);
        let (env, app) = self.infer_context(utterance);
        intent.installation_environment = env;
        intent.detected_application = app;
        intent.has_specific_constraint = !intent.entity_references.is_empty();
        intent
    }

    /// Tag/dimension extraction: `Tag 5684: 305x610x150` or bare `WxH[xD]`
    pub fn extract_tags(&self, utterance: &str) -> Vec<EntityReference> {
        let normalized = self.normalize_numbers(utterance);
        let mut tags = Vec::new();

        for caps in self.tag_pattern.captures_iter(&normalized) {
            tags.push(EntityReference {
                id: caps[1].to_string(),
                entity_type: "tag".to_string(),
                filter_width: caps[2].parse().ok(),
                filter_height: caps[3].parse().ok(),
                filter_depth: caps.get(4).and_then(|m| m.as_str().parse().ok()),
                ..Default::default()
            });
        }

        if tags.is_empty() {
            for (i, caps) in self.dim_pattern.captures_iter(&normalized).enumerate() {
                tags.push(EntityReference {
                    id: format!("item_{}", i + 1),
                    entity_type: "tag".to_string(),
                    filter_width: caps[1].parse().ok(),
                    filter_height: caps[2].parse().ok(),
                    filter_depth: caps.get(3).and_then(|m| m.as_str().parse().ok()),
                    ..Default::default()
                });
            }
        }

        // A standalone "depth 292mm" attaches to the first tag missing one
        if let Some(caps) = self.depth_pattern.captures(&normalized) {
            let depth: Option<i64> = caps[1].parse().ok();
            if let Some(tag) = tags.iter_mut().find(|t| t.filter_depth.is_none()) {
                tag.filter_depth = depth;
            }
        }

        for (i, caps) in self.airflow_pattern.captures_iter(&normalized).enumerate() {
            let airflow: Option<i64> = caps[1].parse().ok();
            if let Some(tag) = tags.get_mut(i) {
                tag.airflow_m3h = airflow;
            } else if i == 0 && tags.is_empty() {
                tags.push(EntityReference {
                    id: "item_1".to_string(),
                    entity_type: "tag".to_string(),
                    airflow_m3h: airflow,
                    ..Default::default()
                });
            }
        }
        tags
    }

    /// Material via tenant hint tables with word boundaries
    pub fn extract_material(&self, utterance: &str) -> Option<String> {
        let lower = utterance.to_lowercase();
        for (code, keywords) in &self.config.scribe_material_hints {
            for keyword in keywords {
                let pattern = format!(r"\b{}\b", regex::escape(&keyword.to_lowercase()));
                if Regex::new(&pattern)
                    .map(|re| re.is_match(&lower))
                    .unwrap_or(false)
                {
                    return Some(code.clone());
                }
            }
        }
        None
    }

    pub fn extract_project(&self, utterance: &str) -> Option<String> {
        for pattern in &self.project_patterns {
            if let Some(caps) = pattern.captures(utterance) {
                return Some(caps[1].to_string());
            }
        }
        None
    }

    /// Accessories: round-duct diameters plus tenant hint keywords
    pub fn extract_accessories(&self, utterance: &str) -> Vec<String> {
        let mut accessories = Vec::new();
        for pattern in &self.duct_patterns {
            for caps in pattern.captures_iter(utterance) {
                let acc = format!("Round duct Ø{}mm", &caps[1]);
                if !accessories.contains(&acc) {
                    accessories.push(acc);
                }
            }
        }
        let lower = utterance.to_lowercase();
        for hint in &self.config.scribe_accessory_hints {
            if hint
                .keywords
                .iter()
                .any(|k| lower.contains(&k.to_lowercase()))
                && !accessories.contains(&hint.code)
            {
                accessories.push(hint.code.clone());
            }
        }
        accessories
    }

    /// Environment/application inference from tenant keyword tables
    pub fn infer_context(&self, utterance: &str) -> (Option<String>, Option<String>) {
        let lower = utterance.to_lowercase();

        let environment = self
            .config
            .fallback_environment_terms
            .iter()
            .find(|term| lower.contains(term.as_str()))
            .and_then(|term| self.config.fallback_environment_mapping.get(term))
            .cloned();

        let mut application = environment
            .as_ref()
            .and_then(|env| self.config.fallback_env_to_app_inference.get(env))
            .cloned();
        if application.is_none() {
            for (key, keywords) in &self.config.fallback_application_keywords {
                if keywords.iter().any(|k| lower.contains(k.as_str())) {
                    application = Some(format!("APP_{}", key.to_uppercase()));
                    break;
                }
            }
        }
        (environment, application)
    }

    /// Product family mentioned verbatim in the utterance
    pub fn detect_family(&self, utterance: &str) -> Option<String> {
        let upper = utterance.to_uppercase();
        // Longest names first so GDC-FLEX wins over GDC
        let mut families = self.config.product_families.clone();
        families.sort_by_key(|f| std::cmp::Reverse(f.len()));
        families.into_iter().find(|f| upper.contains(f.as_str()))
    }

    /// Connection type via tenant keyword tables, with its length offset
    pub fn detect_connection(&self, utterance: &str) -> Option<(String, i64)> {
        let lower = utterance.to_lowercase();
        for (code, keywords) in &self.config.scribe_connection_types {
            if keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
                return Some((code.clone(), self.config.connection_length_offset(code)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn extractor() -> FallbackExtractor {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tenants/hvac_filtration/config.yaml");
        FallbackExtractor::new(Arc::new(TenantConfig::load(&path).unwrap()))
    }

    #[test]
    fn test_tagged_dimensions() {
        let ex = extractor();
        let tags = ex.extract_tags("Tag 5684: 305x610x150, Tag 7889: 610x610x292");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].id, "5684");
        assert_eq!(tags[0].filter_width, Some(305));
        assert_eq!(tags[0].filter_depth, Some(150));
        assert_eq!(tags[1].id, "7889");
        assert_eq!(tags[1].filter_depth, Some(292));
    }

    #[test]
    fn test_bare_dimensions_get_item_ids() {
        let ex = extractor();
        let tags = ex.extract_tags("600x600 filter, depth 292mm, 3000 m³/h");
        assert_eq!(tags[0].id, "item_1");
        assert_eq!(tags[0].filter_width, Some(600));
        assert_eq!(tags[0].filter_depth, Some(292));
        assert_eq!(tags[0].airflow_m3h, Some(3000));
    }

    #[test]
    fn test_airflow_thousand_separators() {
        let ex = extractor();
        for text in ["25,000 m³/h", "25 000 m3/h", "25.000 m3h"] {
            let tags = ex.extract_tags(text);
            assert_eq!(tags[0].airflow_m3h, Some(25_000), "{text}");
        }
    }

    #[test]
    fn test_decimal_not_mangled() {
        let ex = extractor();
        // 0.5 must not be treated as a thousands separator
        assert_eq!(ex.normalize_numbers("0.5 ppm"), "0.5 ppm");
        assert_eq!(ex.normalize_numbers("6.000 m3/h"), "6000 m3/h");
    }

    #[test]
    fn test_material_extraction() {
        let ex = extractor();
        assert_eq!(ex.extract_material("need stainless steel housing").as_deref(), Some("RF"));
        assert_eq!(ex.extract_material("galvanized please").as_deref(), Some("FZ"));
        assert_eq!(ex.extract_material("zinkmagnesium version").as_deref(), Some("ZM"));
        assert_eq!(ex.extract_material("no material here"), None);
        // 'rf' must not match inside 'airflow'
        assert_eq!(ex.extract_material("what airflow do you support"), None);
    }

    #[test]
    fn test_project_extraction() {
        let ex = extractor();
        assert_eq!(
            ex.extract_project("Offer for project Nordhavn please").as_deref(),
            Some("Nordhavn")
        );
        assert_eq!(
            ex.extract_project("The Riverside project needs filters").as_deref(),
            Some("Riverside")
        );
    }

    #[test]
    fn test_accessory_extraction() {
        let ex = extractor();
        let accs = ex.extract_accessories("with Ø500mm round duct and quick release locks");
        assert!(accs.contains(&"Round duct Ø500mm".to_string()));
        assert!(accs.contains(&"EXL".to_string()));
    }

    #[test]
    fn test_context_inference() {
        let ex = extractor();
        let (env, app) = ex.infer_context("filters for a rooftop installation");
        assert_eq!(env.as_deref(), Some("ENV_ROOFTOP"));
        assert_eq!(app, None);

        let (env, app) = ex.infer_context("pool facility ventilation");
        assert_eq!(env.as_deref(), Some("ENV_POOL"));
        assert_eq!(app.as_deref(), Some("APP_POOL"));

        let (env, app) = ex.infer_context("for a hospital ward");
        assert_eq!(env.as_deref(), Some("ENV_HOSPITAL"));
        assert_eq!(app.as_deref(), Some("APP_HOSPITAL"));
    }

    #[test]
    fn test_family_detection_prefers_longest() {
        let ex = extractor();
        assert_eq!(ex.detect_family("I need GDB for this").as_deref(), Some("GDB"));
        assert_eq!(ex.detect_family("quote a GDC-FLEX unit").as_deref(), Some("GDC-FLEX"));
        assert_eq!(ex.detect_family("no family"), None);
    }

    #[test]
    fn test_connection_detection_with_offset() {
        let ex = extractor();
        let (code, offset) = ex.detect_connection("with flange connection").unwrap();
        assert_eq!(code, "F");
        assert_eq!(offset, 50);
    }
}
