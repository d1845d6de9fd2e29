//! The per-turn pipeline

use std::sync::Arc;

use cpq_adapter::{prompt_injection, GraphReasoningReport, VerdictAdapter};
use cpq_config::TenantConfig;
use cpq_core::{EngineContext, EngineVerdict, SemanticIntent, TagPatch, TraceStep};
use cpq_engine::TraitBasedEngine;
use cpq_graph::{family_short_name, GraphReader};
use cpq_scribe::ScribeExtractor;
use cpq_session::SessionStore;
use cpq_state::TechnicalState;

/// Result of one conversational turn
#[derive(Debug)]
pub struct TurnOutcome {
    pub verdict: EngineVerdict,
    pub report: GraphReasoningReport,
    /// Engine verdict rendered for the response LLM; pair with
    /// `state_after.to_prompt_context()` for the full injection
    pub prompt_injection: String,
    pub state_after: TechnicalState,
}

/// The in-process engine API
pub struct Configurator {
    store: Arc<SessionStore>,
    reader: Arc<dyn GraphReader>,
    scribe: ScribeExtractor,
    engine: TraitBasedEngine,
    adapter: VerdictAdapter,
    tenant: Arc<TenantConfig>,
    recent_turns: usize,
}

impl Configurator {
    pub fn new(
        store: Arc<SessionStore>,
        reader: Arc<dyn GraphReader>,
        scribe: ScribeExtractor,
        tenant: Arc<TenantConfig>,
        recent_turns: usize,
    ) -> Self {
        let engine = TraitBasedEngine::new(Arc::clone(&reader));
        Self {
            store,
            reader,
            scribe,
            engine,
            adapter: VerdictAdapter::new(),
            tenant,
            recent_turns,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Process one user turn. The whole lifecycle runs under the session
    /// lock; a concurrent turn on the same session waits and is rejected
    /// past the threshold.
    pub async fn process_turn(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<TurnOutcome, cpq_core::Error> {
        let _guard = self.store.lock_session(session_id).await?;
        self.store.ensure_session(session_id, "default").await?;

        let mut state =
            TechnicalState::load_from_graph(&self.store, session_id, Arc::clone(&self.tenant))
                .await?;

        let last_turn = self
            .store
            .get_recent_turns(session_id, 1)
            .await?
            .last()
            .map(|t| t.turn_number)
            .unwrap_or(0);
        let turn_number = last_turn + 1;
        state.turn_count = turn_number;
        self.store
            .store_turn(session_id, "user", user_message, turn_number)
            .await?;

        // Intent extraction (LLM-first, regex fallback)
        let history = self
            .store
            .get_recent_turns(session_id, self.recent_turns)
            .await?
            .iter()
            .map(|t| format!("{}: {}", t.role, t.message))
            .collect::<Vec<_>>()
            .join("\n");
        let extraction = self
            .scribe
            .extract(
                user_message,
                &state.to_compact_summary(),
                &history,
                self.reader.as_ref(),
            )
            .await;

        self.merge_intent(&mut state, &extraction.intent, user_message);

        // Reason
        let context = self.build_context(&state, &extraction.intent);
        let hint = state.detected_family.clone();
        let mut verdict = self
            .engine
            .process_query(user_message, hint.as_deref(), &context)
            .await;
        if extraction.degraded {
            verdict.trace(TraceStep::new("scribe", "scribe degraded"));
        }

        self.apply_verdict(&mut state, &verdict).await;

        // Persist; a graph failure here aborts the turn (§7)
        state.persist_to_graph(&self.store, session_id).await?;

        let report = self.adapter.adapt(&verdict);
        let injection = prompt_injection(&verdict);
        Ok(TurnOutcome {
            verdict,
            report,
            prompt_injection: injection,
            state_after: state,
        })
    }

    /// Record the externally generated assistant response
    pub async fn record_assistant_turn(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<(), cpq_core::Error> {
        let last_turn = self
            .store
            .get_recent_turns(session_id, 1)
            .await?
            .last()
            .map(|t| t.turn_number)
            .unwrap_or(0);
        self.store
            .store_turn(session_id, "assistant", message, last_turn + 1)
            .await?;
        Ok(())
    }

    /// Merge extracted intent into the cumulative state
    fn merge_intent(&self, state: &mut TechnicalState, intent: &SemanticIntent, utterance: &str) {
        if let Some(project) = &intent.project_name {
            state.set_project(project);
        }
        if let Some(material) = &intent.material {
            state.lock_material(material);
        }
        for accessory in &intent.accessories {
            if !state.accessories.contains(accessory) {
                state.accessories.push(accessory.clone());
            }
        }
        if let Some(app) = &intent.detected_application {
            state
                .resolved_params
                .insert("detected_application".into(), app.clone());
        }
        if let Some(env) = &intent.installation_environment {
            state
                .resolved_params
                .insert("installation_environment".into(), env.clone());
        }

        // A pending clarification consumes a bare numeric answer
        if let Some(pending) = state.pending_clarification.clone() {
            if intent.entity_references.is_empty() {
                if let Some(number) = first_number(utterance) {
                    state.resolved_params.insert(pending.clone(), number);
                    state.pending_clarification = None;
                }
            }
        }
        for constraint in &intent.numeric_constraints {
            let ctx = constraint.context.to_lowercase();
            if ctx.contains("max") && ctx.contains("width") {
                state
                    .resolved_params
                    .insert("max_width_mm".into(), constraint.value.to_string());
            } else if ctx.contains("max") && ctx.contains("height") {
                state
                    .resolved_params
                    .insert("max_height_mm".into(), constraint.value.to_string());
            } else if ctx.contains("space") || ctx.contains("clearance") {
                state
                    .resolved_params
                    .insert("available_space_mm".into(), constraint.value.to_string());
            }
        }

        if let Some((connection, offset)) = self.scribe.fallback().detect_connection(utterance) {
            state
                .resolved_params
                .insert("connection_type".into(), connection);
            if offset != 0 {
                state
                    .resolved_params
                    .insert("connection_length_offset".into(), offset.to_string());
            }
        }

        if state.detected_family.is_none() {
            if let Some(family) = self.scribe.fallback().detect_family(utterance) {
                state.detected_family = Some(family);
            }
        }

        for (index, entity) in intent.entity_references.iter().enumerate() {
            let tag_id = if entity.id.is_empty() {
                format!("item_{}", index + 1)
            } else {
                entity.id.clone()
            };
            let patch = TagPatch {
                filter_width: entity.filter_width,
                filter_height: entity.filter_height,
                filter_depth: entity.filter_depth,
                housing_length: entity.housing_length,
                airflow_m3h: entity.airflow_m3h,
                quantity: entity.quantity,
                product_family: entity.code.clone(),
                ..Default::default()
            };
            if !patch.is_empty() {
                state.merge_tag(&tag_id, patch);
            }
        }
    }

    /// Assemble the engine context from cumulative state plus this turn
    fn build_context(&self, state: &TechnicalState, intent: &SemanticIntent) -> EngineContext {
        let mut context = EngineContext {
            detected_application: intent
                .detected_application
                .clone()
                .or_else(|| state.resolved_params.get("detected_application").cloned()),
            installation_environment: intent
                .installation_environment
                .clone()
                .or_else(|| state.resolved_params.get("installation_environment").cloned()),
            material: state.locked_material.clone().or(intent.material.clone()),
            accessories: state.accessories.clone(),
            ..Default::default()
        };
        for (key, value) in &state.resolved_params {
            match value.parse::<f64>() {
                Ok(number) => context.set_number(key, number),
                Err(_) => context.set_str(key, value.clone()),
            }
        }
        if let Some(material) = &context.material {
            context.set_str("material", material.clone());
        }
        // The primary tag supplies the numeric parameters the physics phases
        // compare against.
        if let Some(tag) = state.tags.values().next() {
            if let Some(airflow) = tag.airflow_m3h {
                context.set_number("airflow_m3h", airflow as f64);
            }
            if let Some(length) = tag.housing_length {
                context.set_number("housing_length", length as f64);
            }
            if let Some(depth) = tag.filter_depth {
                context.set_number("filter_depth", depth as f64);
            }
            if let Some(width) = tag.housing_width {
                context.set_number("housing_width", width as f64);
            }
            if let Some(height) = tag.housing_height {
                context.set_number("housing_height", height as f64);
            }
        }
        context
    }

    /// Fold verdict outcomes back into the cumulative state
    async fn apply_verdict(&self, state: &mut TechnicalState, verdict: &EngineVerdict) {
        // Veto persistence: continuation turns must remember the veto
        for vetoed in &verdict.vetoed_products {
            if !state.vetoed_families.contains(&vetoed.product_family_id) {
                state.vetoed_families.push(vetoed.product_family_id.clone());
            }
        }

        if verdict.is_assembly && !verdict.has_installation_block {
            let base_tag = state
                .tags
                .keys()
                .find(|id| !id.contains("_stage_"))
                .cloned()
                .unwrap_or_else(|| "item_1".to_string());
            state.create_assembly_tags(&verdict.assembly, &base_tag);
            if let (Some(group), Some(rationale)) =
                (state.assembly_group.as_mut(), verdict.assembly_rationale.clone())
            {
                group.rationale = rationale;
            }
        } else if let Some(pivot_id) = &verdict.auto_pivot_to {
            state.detected_family = Some(family_short_name(pivot_id).to_string());
        } else if state.detected_family.is_none() {
            if let Some(rec) = &verdict.recommended_product {
                state.detected_family =
                    Some(family_short_name(&rec.product_family_id).to_string());
            }
        }

        if let Some(capacity) = &verdict.capacity_calculation {
            if capacity.modules_needed > 1 {
                let tag_ids: Vec<String> = state.tags.keys().cloned().collect();
                if let Some(first) = tag_ids.first() {
                    state.merge_tag(
                        first,
                        TagPatch {
                            modules_needed: Some(capacity.modules_needed),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        // What to ask next: suppressed entirely under an installation block
        state.pending_clarification = if verdict.has_installation_block {
            None
        } else {
            verdict
                .clarification_questions
                .first()
                .map(|q| q.property_key.clone())
                .or_else(|| {
                    verdict
                        .gate_evaluations
                        .iter()
                        .flat_map(|g| g.missing_parameters.iter())
                        .map(|p| p.property_key.clone())
                        .next()
                })
        };

        state.enrich_with_weights(self.reader.as_ref()).await;
        for warning in state.verify_material_codes() {
            tracing::warn!("{warning}");
        }
    }
}

fn first_number(text: &str) -> Option<String> {
    let mut number = String::new();
    let mut seen_digit = false;
    for c in text.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            seen_digit = true;
        } else if c == '.' && seen_digit && !number.contains('.') {
            number.push(c);
        } else if seen_digit {
            break;
        }
    }
    if seen_digit {
        Some(number.trim_end_matches('.').to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::first_number;

    #[test]
    fn test_first_number_extraction() {
        assert_eq!(first_number("0.5 ppm").as_deref(), Some("0.5"));
        assert_eq!(first_number("about 550 mm").as_deref(), Some("550"));
        assert_eq!(first_number("no numbers"), None);
        assert_eq!(first_number("550.").as_deref(), Some("550"));
    }
}
