//! Scribe orchestration: LLM-first extraction with regex gap-filling

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use cpq_config::TenantConfig;
use cpq_core::SemanticIntent;
use cpq_graph::GraphReader;

use crate::backend::{ChatMessage, LlmBackend};
use crate::fallback::FallbackExtractor;
use crate::parse::parse_intent;

/// Extraction result with degradation marker for the reasoning trace
#[derive(Debug, Clone)]
pub struct ScribeExtraction {
    pub intent: SemanticIntent,
    /// True when the LLM path failed and regex stood in
    pub degraded: bool,
}

/// The Scribe adapter
pub struct ScribeExtractor {
    backend: Arc<dyn LlmBackend>,
    tenant: Arc<TenantConfig>,
    fallback: FallbackExtractor,
    timeout: Duration,
    /// System prompt enriched from graph keyword tables, built once
    cached_prompt: Mutex<Option<String>>,
}

impl ScribeExtractor {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        tenant: Arc<TenantConfig>,
        timeout: Duration,
    ) -> Self {
        let fallback = FallbackExtractor::new(Arc::clone(&tenant));
        Self {
            backend,
            tenant,
            fallback,
            timeout,
            cached_prompt: Mutex::new(None),
        }
    }

    pub fn fallback(&self) -> &FallbackExtractor {
        &self.fallback
    }

    /// Build (and cache) the system prompt, filling the `{env_mapping}` and
    /// `{app_mapping}` placeholders from graph keyword tables
    pub async fn system_prompt(&self, reader: &dyn GraphReader) -> String {
        if let Some(prompt) = self.cached_prompt.lock().clone() {
            return prompt;
        }

        let env_mapping = match reader.get_environment_keywords().await {
            Ok(map) if !map.is_empty() => map
                .iter()
                .map(|(env_id, keywords)| {
                    let kws = keywords
                        .iter()
                        .map(|k| format!("\"{k}\""))
                        .collect::<Vec<_>>()
                        .join(" / ");
                    format!("    {kws} -> {{\"installation_environment\": \"{env_id}\"}}")
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => {
                tracing::warn!("environment keywords unavailable, using tenant fallback mapping");
                self.tenant
                    .fallback_environment_mapping
                    .iter()
                    .map(|(term, env_id)| {
                        format!("    \"{term}\" -> {{\"installation_environment\": \"{env_id}\"}}")
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        let app_mapping = match reader.get_all_applications().await {
            Ok(apps) if !apps.is_empty() => apps
                .iter()
                .filter(|a| !a.keywords.is_empty())
                .map(|a| {
                    let kws = a
                        .keywords
                        .iter()
                        .map(|k| format!("\"{k}\""))
                        .collect::<Vec<_>>()
                        .join(" / ");
                    format!("    {kws} -> {{\"detected_application\": \"{}\"}}", a.id)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            _ => "    (no application data available)".to_string(),
        };

        let prompt = self
            .tenant
            .prompts
            .scribe_system
            .replace("{env_mapping}", &env_mapping)
            .replace("{app_mapping}", &app_mapping);
        *self.cached_prompt.lock() = Some(prompt.clone());
        prompt
    }

    /// Extract intent for one utterance
    ///
    /// The LLM runs first under a per-call timeout; regex fills any gaps.
    /// When the LLM path fails entirely, the regex intent stands alone and
    /// `degraded` is set for the trace.
    pub async fn extract(
        &self,
        utterance: &str,
        state_summary: &str,
        recent_turns: &str,
        reader: &dyn GraphReader,
    ) -> ScribeExtraction {
        let regex_intent = self.fallback.extract(utterance);

        let system = self.system_prompt(reader).await;
        let user = format!(
            "CURRENT PROJECT STATE:\n{state_summary}\n\nRECENT TURNS:\n{recent_turns}\n\nUSER MESSAGE:\n{utterance}"
        );
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        let llm_intent =
            match tokio::time::timeout(self.timeout, self.backend.generate(&messages)).await {
                Ok(Ok(text)) => parse_intent(&text),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "scribe degraded: LLM call failed");
                    None
                }
                Err(_) => {
                    tracing::warn!("scribe degraded: LLM call timed out");
                    None
                }
            };

        match llm_intent {
            Some(mut intent) => {
                merge_gaps(&mut intent, regex_intent);
                ScribeExtraction {
                    intent,
                    degraded: false,
                }
            }
            None => ScribeExtraction {
                intent: regex_intent,
                degraded: true,
            },
        }
    }
}

/// Fill fields the LLM left empty from the regex pass. The LLM result wins
/// wherever it said anything.
fn merge_gaps(intent: &mut SemanticIntent, regex: SemanticIntent) {
    if intent.entity_references.is_empty() {
        intent.entity_references = regex.entity_references;
    }
    if intent.material.is_none() {
        intent.material = regex.material;
    }
    if intent.project_name.is_none() {
        intent.project_name = regex.project_name;
    }
    if intent.accessories.is_empty() {
        intent.accessories = regex.accessories;
    }
    if intent.detected_application.is_none() {
        intent.detected_application = regex.detected_application;
    }
    if intent.installation_environment.is_none() {
        intent.installation_environment = regex.installation_environment;
    }
    if intent.context_keywords.is_empty() {
        intent.context_keywords = regex.context_keywords;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cpq_graph::MemoryGraph;

    use crate::ScribeError;

    struct CannedBackend {
        response: Option<String>,
    }

    #[async_trait]
    impl LlmBackend for CannedBackend {
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<String, ScribeError> {
            match &self.response {
                Some(text) => Ok(text.clone()),
                None => Err(ScribeError::Timeout),
            }
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    fn tenant() -> Arc<TenantConfig> {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/tenants/hvac_filtration/config.yaml");
        Arc::new(TenantConfig::load(&path).unwrap())
    }

    fn extractor(response: Option<&str>) -> ScribeExtractor {
        ScribeExtractor::new(
            Arc::new(CannedBackend {
                response: response.map(String::from),
            }),
            tenant(),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_llm_intent_wins_with_regex_gap_fill() {
        let ex = extractor(Some(
            r#"{"language": "en", "material": "RF", "action_intent": "select"}"#,
        ));
        let graph = MemoryGraph::new();
        let result = ex
            .extract("need RF filters, 600x600x292", "(empty state)", "", &graph)
            .await;
        assert!(!result.degraded);
        assert_eq!(result.intent.material.as_deref(), Some("RF"));
        // Dimensions came from the regex gap fill
        assert_eq!(result.intent.entity_references.len(), 1);
        assert_eq!(result.intent.entity_references[0].filter_width, Some(600));
    }

    #[tokio::test]
    async fn test_llm_failure_degrades_to_regex() {
        let ex = extractor(None);
        let graph = MemoryGraph::new();
        let result = ex
            .extract(
                "stainless housing 600x600x292, 3000 m3/h",
                "(empty state)",
                "",
                &graph,
            )
            .await;
        assert!(result.degraded);
        assert_eq!(result.intent.material.as_deref(), Some("RF"));
        assert_eq!(result.intent.entity_references[0].airflow_m3h, Some(3000));
    }

    #[tokio::test]
    async fn test_unparseable_response_degrades() {
        let ex = extractor(Some("I am sorry, I cannot help with that."));
        let graph = MemoryGraph::new();
        let result = ex
            .extract("galvanized 300x600", "(empty state)", "", &graph)
            .await;
        assert!(result.degraded);
        assert_eq!(result.intent.material.as_deref(), Some("FZ"));
    }

    #[tokio::test]
    async fn test_system_prompt_enriched_from_graph() {
        let ex = extractor(Some("{}"));
        let graph = MemoryGraph::new();
        graph.add_node(
            "Environment",
            "ENV_POOL",
            serde_json::json!({"name": "Pool", "keywords": ["pool", "swimming"]}),
        );
        graph.add_node(
            "Application",
            "APP_POOL",
            serde_json::json!({"name": "Swimming Pool", "keywords": ["pool"]}),
        );
        let prompt = ex.system_prompt(&graph).await;
        assert!(prompt.contains("ENV_POOL"));
        assert!(prompt.contains("APP_POOL"));
        // Second call is served from the cache
        let again = ex.system_prompt(&graph).await;
        assert_eq!(prompt, again);
    }
}
