//! Trait-based reasoning pipeline
//!
//! `process_query` runs a fixed, phase-ordered pipeline over a graph
//! snapshot. Phases communicate only through the verdict under construction;
//! each phase appends a trace step. No phase panics on well-formed input:
//! graph degradation and schema violations become diagnostic breadcrumbs on
//! a partial verdict.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::json;

use cpq_core::{
    AccessoryStatus, AccessoryValidation, AlternativeProduct, ApplicationContext, AssemblyStage,
    CapacityCalculation, CausalRule, ClarificationItem, ConstraintOverride, DetectedStressor,
    DetectionMethod, EngineContext, EngineVerdict, GateEvaluation, GateParameter, GateState,
    MissingParameter, RuleKind, Severity, StageRole, TraceStep, TraitMatch,
};
use cpq_graph::{
    family_short_name, GraphError, GraphReader, LogicGateRow, ProductFamilyRow,
};

use crate::gates::evaluate_condition;
use crate::installation::evaluate_constraint;
use crate::sizing::{arrange_modules, modules_needed};

/// The reasoning engine
pub struct TraitBasedEngine {
    reader: Arc<dyn GraphReader>,
}

impl TraitBasedEngine {
    pub fn new(reader: Arc<dyn GraphReader>) -> Self {
        Self { reader }
    }

    /// Run the full pipeline for one query
    pub async fn process_query(
        &self,
        query: &str,
        product_hint: Option<&str>,
        context: &EngineContext,
    ) -> EngineVerdict {
        let mut verdict = EngineVerdict::default();
        // Working copy of the resolved parameters; hard-constraint overrides
        // correct values here for the downstream phases.
        let mut resolved = context.clone();

        // Phase 1: stressor detection
        self.detect_stressors(query, context, &mut verdict).await;

        // Phase 2: causal rules
        self.load_causal_rules(&mut verdict).await;

        // Phase 3: trait matching over all candidates
        let candidates = self.load_candidates(&mut verdict).await;
        self.match_traits(&candidates, &mut verdict);

        // Phase 4: veto
        self.check_vetoes(&mut verdict);

        // Phase 5: ranking and auto-pivot
        self.rank_and_pivot(product_hint, &mut verdict);

        // Phase 6: assembly construction (alternative to pivot)
        self.build_assembly(&candidates, product_hint, &mut verdict)
            .await;

        // Phase 7: hard constraints auto-correct resolved values
        self.apply_hard_constraints(&mut resolved, &mut verdict).await;

        // Phase 8: logic gates
        self.evaluate_gates(&resolved, &mut verdict).await;

        // Phase 9: capacity
        self.calculate_capacity(&resolved, &mut verdict).await;

        // Phase 10: sizing arrangement
        self.arrange_sizing(&resolved, &mut verdict).await;

        // Phase 11: variance check (variable features)
        self.check_missing_parameters(&mut resolved, &mut verdict)
            .await;

        // Phase 12: accessory validation
        self.validate_accessories(context, &mut verdict).await;

        // Phase 13: installation constraints
        self.check_installation(product_hint, &resolved, &mut verdict)
            .await;

        // Phase 14: clarification assembly
        self.collect_clarifications(&resolved, &mut verdict).await;

        verdict
    }

    fn degraded(verdict: &mut EngineVerdict, stage: &str, err: &GraphError) {
        if err.is_retryable() {
            verdict.trace(TraceStep::new(stage, "graph degraded"));
        } else {
            verdict.trace(TraceStep::new(
                stage,
                format!("graph error, phase skipped: {err}"),
            ));
        }
        tracing::warn!(stage, error = %err, "phase degraded");
    }

    // -----------------------------------------------------------------
    // Phase 1: stressor detection
    // -----------------------------------------------------------------

    async fn detect_stressors(
        &self,
        query: &str,
        context: &EngineContext,
        verdict: &mut EngineVerdict,
    ) {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
            .map(String::from)
            .collect();

        let mut detected: BTreeMap<String, DetectedStressor> = BTreeMap::new();
        let mut record = |stressor: DetectedStressor| {
            match detected.get(&stressor.id) {
                Some(existing) if existing.confidence >= stressor.confidence => {}
                _ => {
                    detected.insert(stressor.id.clone(), stressor);
                }
            }
        };

        if !tokens.is_empty() {
            match self.reader.get_stressors_by_keywords(&tokens).await {
                Ok(rows) => {
                    for row in rows {
                        if row.id.is_empty() {
                            verdict.trace(TraceStep::new(
                                "stressor_detection",
                                "dropped stressor record without id",
                            ));
                            continue;
                        }
                        record(DetectedStressor {
                            id: row.id,
                            name: row.name,
                            description: row.description,
                            category: row.category,
                            detection_method: DetectionMethod::Keyword,
                            confidence: 1.0,
                            matched_keywords: row.matched_keywords,
                            source_context: None,
                        });
                    }
                }
                Err(e) => Self::degraded(verdict, "stressor_detection", &e),
            }
        }

        for (ctx_id, method) in [
            (
                context.detected_application.as_deref(),
                DetectionMethod::ApplicationLink,
            ),
            (
                context.installation_environment.as_deref(),
                DetectionMethod::EnvironmentLink,
            ),
        ] {
            let Some(ctx_id) = ctx_id else { continue };
            match self.reader.get_stressors_for_application(ctx_id).await {
                Ok(rows) => {
                    for row in rows {
                        if row.id.is_empty() {
                            continue;
                        }
                        record(DetectedStressor {
                            id: row.id,
                            name: row.name,
                            description: row.description,
                            category: row.category,
                            detection_method: method,
                            confidence: 0.9,
                            matched_keywords: Vec::new(),
                            source_context: row.source_context,
                        });
                    }
                }
                Err(e) => Self::degraded(verdict, "stressor_detection", &e),
            }
        }

        verdict.detected_stressors = detected.into_values().collect();

        if let Some(app_id) = &context.detected_application {
            let name = verdict
                .detected_stressors
                .iter()
                .filter(|s| s.detection_method == DetectionMethod::ApplicationLink)
                .find_map(|s| s.source_context.clone())
                .unwrap_or_else(|| app_id.trim_start_matches("APP_").to_string());
            verdict.application_match = Some(ApplicationContext {
                id: app_id.clone(),
                name,
                keywords: Vec::new(),
            });
        }

        let names: Vec<&str> = verdict
            .detected_stressors
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        verdict.trace(
            TraceStep::new(
                "stressor_detection",
                if names.is_empty() {
                    "no environmental stressors detected".to_string()
                } else {
                    format!("detected {}: {}", names.len(), names.join(", "))
                },
            )
            .with_details(json!({"count": verdict.detected_stressors.len()})),
        );
    }

    // -----------------------------------------------------------------
    // Phase 2: causal rules
    // -----------------------------------------------------------------

    async fn load_causal_rules(&self, verdict: &mut EngineVerdict) {
        let ids: Vec<String> = verdict
            .detected_stressors
            .iter()
            .map(|s| s.id.clone())
            .collect();
        if ids.is_empty() {
            verdict.trace(TraceStep::new("causal_rules", "no active stressors"));
            return;
        }
        let rows = match self.reader.get_causal_rules_for_stressors(&ids).await {
            Ok(rows) => rows,
            Err(e) => {
                Self::degraded(verdict, "causal_rules", &e);
                return;
            }
        };

        let mut rules = Vec::new();
        for row in rows {
            let Some(severity) = Severity::parse(&row.severity) else {
                verdict.trace(TraceStep::new(
                    "causal_rules",
                    format!(
                        "dropped rule {}→{} with invalid severity '{}'",
                        row.stressor_id, row.trait_id, row.severity
                    ),
                ));
                continue;
            };
            let rule_type = match row.rule_type.as_str() {
                "DEMANDS_TRAIT" => RuleKind::DemandsTrait,
                "NEUTRALIZED_BY" => RuleKind::NeutralizedBy,
                other => {
                    verdict.trace(TraceStep::new(
                        "causal_rules",
                        format!("dropped rule with unknown type '{other}'"),
                    ));
                    continue;
                }
            };
            let explanation = row.explanation.unwrap_or_else(|| match rule_type {
                RuleKind::DemandsTrait => {
                    format!("{} requires {}", row.stressor_name, row.trait_name)
                }
                RuleKind::NeutralizedBy => {
                    format!("{} is neutralized by {}", row.trait_name, row.stressor_name)
                }
            });
            rules.push(CausalRule {
                rule_type,
                stressor_id: row.stressor_id,
                stressor_name: row.stressor_name,
                trait_id: row.trait_id,
                trait_name: row.trait_name,
                severity,
                explanation,
            });
        }
        let critical = rules.iter().filter(|r| r.severity == Severity::Critical).count();
        verdict.trace(TraceStep::new(
            "causal_rules",
            format!("{} rules active ({critical} critical)", rules.len()),
        ));
        verdict.active_causal_rules = rules;
    }

    // -----------------------------------------------------------------
    // Phase 3: trait matching
    // -----------------------------------------------------------------

    async fn load_candidates(&self, verdict: &mut EngineVerdict) -> Vec<ProductFamilyRow> {
        match self.reader.get_all_product_families_with_traits().await {
            Ok(rows) => rows
                .into_iter()
                .filter(|r| {
                    if r.product_id.is_empty() {
                        verdict.trace(TraceStep::new(
                            "trait_matching",
                            "dropped product family record without id",
                        ));
                        false
                    } else {
                        true
                    }
                })
                .collect(),
            Err(e) => {
                Self::degraded(verdict, "trait_matching", &e);
                Vec::new()
            }
        }
    }

    fn demanded_trait_ids(verdict: &EngineVerdict) -> BTreeSet<String> {
        verdict
            .active_causal_rules
            .iter()
            .filter(|r| r.rule_type == RuleKind::DemandsTrait)
            .map(|r| r.trait_id.clone())
            .collect()
    }

    fn match_traits(&self, candidates: &[ProductFamilyRow], verdict: &mut EngineVerdict) {
        let required = Self::demanded_trait_ids(verdict);
        let neutralized_traits: BTreeSet<&String> = verdict
            .active_causal_rules
            .iter()
            .filter(|r| r.rule_type == RuleKind::NeutralizedBy)
            .map(|r| &r.trait_id)
            .collect();

        let mut matches = Vec::new();
        for candidate in candidates {
            let all: BTreeSet<&String> = candidate.all_trait_ids.iter().collect();
            let present: Vec<String> = required.iter().filter(|t| all.contains(t)).cloned().collect();
            let missing: Vec<String> = required.iter().filter(|t| !all.contains(t)).cloned().collect();
            let neutralized: Vec<String> = candidate
                .all_trait_ids
                .iter()
                .filter(|t| neutralized_traits.contains(t))
                .cloned()
                .collect();
            let coverage = present.len() as f64 / required.len().max(1) as f64;
            matches.push(TraitMatch {
                product_family_id: candidate.product_id.clone(),
                product_family_name: candidate.product_name.clone(),
                selection_priority: candidate.selection_priority,
                traits_present: present,
                traits_missing: missing,
                traits_neutralized: neutralized,
                coverage_score: coverage,
                vetoed: false,
                veto_reasons: Vec::new(),
            });
        }
        verdict.trace(TraceStep::new(
            "trait_matching",
            format!(
                "scored {} candidates against {} demanded traits",
                matches.len(),
                required.len()
            ),
        ));
        verdict.ranked_products = matches;
    }

    // -----------------------------------------------------------------
    // Phase 4: veto
    // -----------------------------------------------------------------

    fn check_vetoes(&self, verdict: &mut EngineVerdict) {
        let rules = verdict.active_causal_rules.clone();
        for candidate in verdict.ranked_products.iter_mut() {
            let mut reasons = Vec::new();
            let mut warning_hits = 0usize;
            for rule in &rules {
                let hit = match rule.rule_type {
                    RuleKind::DemandsTrait => candidate.traits_missing.contains(&rule.trait_id),
                    RuleKind::NeutralizedBy => {
                        candidate.traits_neutralized.contains(&rule.trait_id)
                    }
                };
                if !hit {
                    continue;
                }
                if rule.severity == Severity::Critical {
                    reasons.push(rule.explanation.clone());
                } else {
                    warning_hits += 1;
                }
            }
            // Non-critical violations lower coverage but never veto
            if warning_hits > 0 {
                candidate.coverage_score =
                    (candidate.coverage_score - 0.1 * warning_hits as f64).max(0.0);
            }
            if !reasons.is_empty() {
                candidate.vetoed = true;
                candidate.veto_reasons = reasons;
            }
        }
        let vetoed: Vec<TraitMatch> = verdict
            .ranked_products
            .iter()
            .filter(|m| m.vetoed)
            .cloned()
            .collect();
        if !vetoed.is_empty() {
            verdict.trace(TraceStep::new(
                "veto",
                format!(
                    "vetoed: {}",
                    vetoed
                        .iter()
                        .map(|m| m.product_family_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }
        verdict.vetoed_products = vetoed;
    }

    // -----------------------------------------------------------------
    // Phase 5: ranking and pivot
    // -----------------------------------------------------------------

    fn matches_hint(candidate: &TraitMatch, hint: &str) -> bool {
        let hint = hint.to_uppercase();
        candidate.product_family_name.to_uppercase() == hint
            || candidate.product_family_id.to_uppercase().ends_with(&format!("_{hint}"))
    }

    fn rank_and_pivot(&self, product_hint: Option<&str>, verdict: &mut EngineVerdict) {
        let mut eligible: Vec<TraitMatch> = verdict
            .ranked_products
            .iter()
            .filter(|m| !m.vetoed)
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.coverage_score
                .partial_cmp(&a.coverage_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.selection_priority.cmp(&b.selection_priority))
        });

        if let Some(hint) = product_hint {
            if let Some(pos) = eligible.iter().position(|m| Self::matches_hint(m, hint)) {
                let pinned = eligible.remove(pos);
                eligible.insert(0, pinned);
            }
        }

        verdict.recommended_product = eligible.first().cloned();

        if let Some(hint) = product_hint {
            let hinted_veto = verdict
                .vetoed_products
                .iter()
                .find(|m| Self::matches_hint(m, hint))
                .cloned();
            if let (Some(hinted), Some(top)) = (hinted_veto, eligible.first()) {
                verdict.has_veto = true;
                verdict.auto_pivot_to = Some(top.product_family_id.clone());
                verdict.auto_pivot_name = Some(top.product_family_name.clone());
                verdict.veto_reason = Some(hinted.veto_reasons.join("; "));
                verdict.trace(TraceStep::new(
                    "ranking",
                    format!(
                        "{} vetoed, pivoting to {}",
                        hinted.product_family_name, top.product_family_name
                    ),
                ));
            }
        }

        if let Some(rec) = &verdict.recommended_product {
            verdict.trace(TraceStep::new(
                "ranking",
                format!(
                    "recommended {} (coverage {:.0}%)",
                    rec.product_family_name,
                    rec.coverage_score * 100.0
                ),
            ));
        } else {
            verdict.trace(TraceStep::new("ranking", "no eligible candidate"));
        }
    }

    // -----------------------------------------------------------------
    // Phase 6: assembly construction
    // -----------------------------------------------------------------

    async fn build_assembly(
        &self,
        candidates: &[ProductFamilyRow],
        product_hint: Option<&str>,
        verdict: &mut EngineVerdict,
    ) {
        if !verdict.has_veto {
            return;
        }
        let Some(hint) = product_hint else { return };
        let Some(hinted) = verdict
            .vetoed_products
            .iter()
            .find(|m| Self::matches_hint(m, hint))
            .cloned()
        else {
            return;
        };

        let stressor_ids: Vec<String> = verdict
            .detected_stressors
            .iter()
            .map(|s| s.id.clone())
            .collect();
        let rules = match self
            .reader
            .get_dependency_rules_for_stressors(&stressor_ids)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                Self::degraded(verdict, "assembly", &e);
                return;
            }
        };

        for rule in rules {
            if rule.dependency_type != "MANDATES_PROTECTION" {
                continue;
            }
            let hinted_candidate = candidates
                .iter()
                .find(|c| c.product_id == hinted.product_family_id);
            let provides_downstream = hinted_candidate
                .map(|c| c.all_trait_ids.contains(&rule.downstream_trait_id))
                .unwrap_or(false);
            let veto_involves_rule = hinted.traits_missing.contains(&rule.upstream_trait_id)
                || hinted.traits_neutralized.contains(&rule.downstream_trait_id);
            if !provides_downstream || !veto_involves_rule {
                continue;
            }

            // Protector: named on the rule, or any candidate carrying the
            // upstream trait directly.
            let protector = rule
                .protector_family_id
                .as_ref()
                .and_then(|id| candidates.iter().find(|c| &c.product_id == id))
                .or_else(|| {
                    candidates
                        .iter()
                        .find(|c| c.direct_trait_ids.contains(&rule.upstream_trait_id))
                });
            let Some(protector) = protector else { continue };

            verdict.assembly = vec![
                AssemblyStage {
                    role: StageRole::Protector,
                    product_family_id: protector.product_id.clone(),
                    product_family_name: protector.product_name.clone(),
                    provides_trait_id: rule.upstream_trait_id.clone(),
                    provides_trait_name: rule.upstream_trait_name.clone(),
                    reason: rule.description.clone(),
                },
                AssemblyStage {
                    role: StageRole::Target,
                    product_family_id: hinted.product_family_id.clone(),
                    product_family_name: hinted.product_family_name.clone(),
                    provides_trait_id: rule.downstream_trait_id.clone(),
                    provides_trait_name: rule.downstream_trait_name.clone(),
                    reason: format!(
                        "Primary stage protected by {}",
                        protector.product_name
                    ),
                },
            ];
            verdict.is_assembly = true;
            verdict.assembly_rationale = Some(rule.description.clone());
            // An assembly resolves the veto: keep the user's product as the
            // target instead of pivoting away from it.
            verdict.auto_pivot_to = None;
            verdict.auto_pivot_name = None;
            verdict.veto_reason = None;
            verdict.recommended_product = Some(hinted.clone());
            verdict.trace(TraceStep::new(
                "assembly",
                format!(
                    "built {} (PROTECTOR) + {} (TARGET): {}",
                    protector.product_name, hinted.product_family_name, rule.description
                ),
            ));
            return;
        }
    }

    // -----------------------------------------------------------------
    // Phase 7: hard constraints
    // -----------------------------------------------------------------

    async fn apply_hard_constraints(
        &self,
        resolved: &mut EngineContext,
        verdict: &mut EngineVerdict,
    ) {
        let Some(family) = verdict
            .recommended_product
            .as_ref()
            .map(|m| m.product_family_id.clone())
        else {
            return;
        };
        let rows = match self.reader.get_hard_constraints(&family).await {
            Ok(rows) => rows,
            Err(e) => {
                Self::degraded(verdict, "hard_constraints", &e);
                return;
            }
        };
        for row in rows {
            let Some(value) = resolved.resolved_number(&row.property_key) else {
                continue;
            };
            let satisfied = match row.operator.as_str() {
                ">=" => value >= row.value,
                ">" => value > row.value,
                "<=" => value <= row.value,
                "<" => value < row.value,
                "==" => (value - row.value).abs() < f64::EPSILON,
                other => {
                    verdict.trace(TraceStep::new(
                        "hard_constraints",
                        format!("dropped constraint {} with unknown operator '{other}'", row.id),
                    ));
                    continue;
                }
            };
            if satisfied {
                continue;
            }
            // Overrides never veto: the value is corrected and annotated.
            resolved.set_number(&row.property_key, row.value);
            verdict.trace(TraceStep::new(
                "hard_constraints",
                format!(
                    "{} auto-corrected {} -> {}",
                    row.property_key, value, row.value
                ),
            ));
            verdict.constraint_overrides.push(ConstraintOverride {
                item_id: family.clone(),
                property_key: row.property_key,
                operator: row.operator,
                original_value: value,
                corrected_value: row.value,
                error_msg: row.error_msg,
            });
        }
    }

    // -----------------------------------------------------------------
    // Phase 8: logic gates
    // -----------------------------------------------------------------

    async fn evaluate_gates(&self, resolved: &EngineContext, verdict: &mut EngineVerdict) {
        let stressor_ids: Vec<String> = verdict
            .detected_stressors
            .iter()
            .map(|s| s.id.clone())
            .collect();

        let mut gates: Vec<LogicGateRow> = Vec::new();
        match self.reader.get_logic_gates_for_stressors(&stressor_ids).await {
            Ok(rows) => gates.extend(rows),
            Err(e) => Self::degraded(verdict, "logic_gates", &e),
        }
        match self
            .reader
            .get_gates_triggered_by_context(&resolved.context_ids())
            .await
        {
            Ok(rows) => {
                for row in rows {
                    if !gates.iter().any(|g| g.gate_id == row.gate_id) {
                        gates.push(row);
                    }
                }
            }
            Err(e) => Self::degraded(verdict, "logic_gates", &e),
        }
        if gates.is_empty() {
            return;
        }

        let all_blocked = verdict.all_candidates_vetoed();
        let vars: BTreeMap<String, f64> = resolved
            .resolved
            .keys()
            .filter_map(|k| resolved.resolved_number(k).map(|v| (k.clone(), v)))
            .collect();

        for gate in gates {
            let missing: Vec<GateParameter> = gate
                .params
                .iter()
                .filter(|p| !resolved.has(&p.property_key))
                .map(|p| GateParameter {
                    param_id: p.param_id.clone(),
                    name: p.name.clone(),
                    property_key: p.property_key.clone(),
                    question: p.question.clone(),
                    unit: p.unit.clone(),
                    priority: p.priority,
                })
                .collect();

            let (state, missing) = if all_blocked {
                // Clarification is pointless until the product question
                // settles.
                (GateState::Deferred, missing)
            } else if !missing.is_empty() {
                (GateState::ValidationRequired, missing)
            } else {
                match evaluate_condition(&gate.condition_logic, &vars) {
                    Ok(true) => (GateState::Fired, Vec::new()),
                    Ok(false) => (GateState::Inactive, Vec::new()),
                    Err(e) => {
                        // A type error never throws: the gate degrades to
                        // VALIDATION_REQUIRED naming the offending key.
                        let key = e
                            .offending_key()
                            .unwrap_or(&gate.condition_logic)
                            .to_string();
                        verdict.trace(TraceStep::new(
                            "logic_gates",
                            format!("gate {} condition error: {e}", gate.gate_name),
                        ));
                        (
                            GateState::ValidationRequired,
                            vec![GateParameter {
                                param_id: String::new(),
                                name: key.clone(),
                                property_key: key,
                                question: format!(
                                    "Please provide a numeric value for gate '{}'",
                                    gate.gate_name
                                ),
                                unit: None,
                                priority: 1,
                            }],
                        )
                    }
                }
            };

            verdict.trace(TraceStep::new(
                "logic_gates",
                format!("gate {} -> {state}", gate.gate_name),
            ));
            verdict.gate_evaluations.push(GateEvaluation {
                gate_id: gate.gate_id,
                gate_name: gate.gate_name,
                state,
                stressor_id: gate.stressor_id,
                stressor_name: gate.stressor_name,
                physics_explanation: gate.physics_explanation,
                missing_parameters: missing,
            });
        }
    }

    // -----------------------------------------------------------------
    // Phase 9: capacity
    // -----------------------------------------------------------------

    async fn calculate_capacity(&self, resolved: &EngineContext, verdict: &mut EngineVerdict) {
        let Some(family) = verdict
            .recommended_product
            .as_ref()
            .map(|m| m.product_family_id.clone())
        else {
            return;
        };
        let Some(input_value) = resolved.resolved_number("airflow_m3h") else {
            return;
        };
        let rules = match self.reader.get_capacity_rules(&family).await {
            Ok(rules) => rules,
            Err(e) => {
                Self::degraded(verdict, "capacity", &e);
                return;
            }
        };
        let Some(rule) = rules.into_iter().find(|r| r.output_rating > 0.0) else {
            return;
        };

        let needed = modules_needed(input_value, rule.output_rating);
        verdict.trace(TraceStep::new(
            "capacity",
            format!(
                "{input_value} {} / {} per module = {needed} module(s)",
                rule.input_requirement, rule.output_rating
            ),
        ));
        verdict.capacity_calculation = Some(CapacityCalculation {
            input_value,
            input_requirement: rule.input_requirement.clone(),
            output_rating: rule.output_rating,
            modules_needed: needed,
            module_descriptor: rule.module_descriptor.clone(),
            assumption: rule.assumption.clone(),
            description: rule.description.clone(),
        });

        if needed > 1 {
            let required: Vec<String> = Self::demanded_trait_ids(verdict).into_iter().collect();
            match self
                .reader
                .find_products_with_higher_capacity(
                    &family,
                    &rule.module_descriptor,
                    rule.output_rating,
                    &required,
                )
                .await
            {
                Ok(alts) => {
                    verdict.capacity_alternatives = alts
                        .into_iter()
                        .map(|alt| AlternativeProduct {
                            product_family_id: alt.product_id,
                            product_family_name: alt.product_name,
                            why_it_works: format!(
                                "Handles {} {} per module{}",
                                alt.output_rating,
                                rule.input_requirement,
                                alt.description
                                    .map(|d| format!(" ({d})"))
                                    .unwrap_or_default()
                            ),
                            details: BTreeMap::new(),
                        })
                        .collect();
                }
                Err(e) => Self::degraded(verdict, "capacity", &e),
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase 10: sizing arrangement
    // -----------------------------------------------------------------

    async fn arrange_sizing(&self, resolved: &EngineContext, verdict: &mut EngineVerdict) {
        let Some(family) = verdict
            .recommended_product
            .as_ref()
            .map(|m| m.product_family_id.clone())
        else {
            return;
        };
        let Some(airflow) = resolved.resolved_number("airflow_m3h") else {
            return;
        };
        let modules = match self.reader.get_available_dimension_modules(&family).await {
            Ok(modules) => modules,
            Err(e) => {
                Self::degraded(verdict, "sizing", &e);
                return;
            }
        };
        if modules.is_empty() {
            return;
        }

        let max_width = resolved.resolved_number("max_width_mm").map(|v| v as i64);
        let max_height = resolved.resolved_number("max_height_mm").map(|v| v as i64);

        // Best-rated module that respects the per-module bounds
        let module = modules.iter().find(|m| {
            max_width.map_or(true, |max| m.width_mm <= max)
                && max_height.map_or(true, |max| m.height_mm <= max)
                && m.reference_airflow_m3h.unwrap_or(0) > 0
        });
        let Some(module) = module else {
            verdict.trace(TraceStep::new(
                "sizing",
                "no module variant fits the spatial constraints",
            ));
            return;
        };

        let needed = modules_needed(airflow, module.reference_airflow_m3h.unwrap_or(0) as f64);
        let strategy = self
            .reader
            .get_optimization_strategy(&family)
            .await
            .ok()
            .flatten();

        match arrange_modules(module, needed, strategy.as_ref(), max_width, max_height) {
            Some(arrangement) => {
                verdict.trace(TraceStep::new(
                    "sizing",
                    format!(
                        "{} x {} = {}x{}mm effective",
                        arrangement.horizontal_count,
                        arrangement.vertical_count,
                        arrangement.effective_width,
                        arrangement.effective_height
                    ),
                ));
                verdict.sizing_arrangement = Some(arrangement);
            }
            None => {
                verdict.trace(TraceStep::new(
                    "sizing",
                    format!("{needed} module(s) do not fit inside the given limits"),
                ));
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase 11: variance check
    // -----------------------------------------------------------------

    async fn check_missing_parameters(
        &self,
        resolved: &mut EngineContext,
        verdict: &mut EngineVerdict,
    ) {
        let Some(family) = verdict
            .recommended_product
            .as_ref()
            .map(|m| m.product_family_id.clone())
        else {
            return;
        };
        let features = match self.reader.get_variable_features(&family).await {
            Ok(features) => features,
            Err(e) => {
                Self::degraded(verdict, "variance_check", &e);
                return;
            }
        };

        let resolved_keys: BTreeSet<String> =
            resolved.resolved.keys().map(|k| k.to_lowercase()).collect();
        let has_length = resolved_keys.contains("housing_length")
            || resolved_keys.contains("filter_depth")
            || resolved_keys.contains("length");
        let has_airflow = resolved_keys.contains("airflow_m3h") || resolved_keys.contains("airflow");

        for feature in features {
            let param_key = if feature.parameter_name.is_empty() {
                feature.feature_name.to_lowercase().replace(' ', "_")
            } else {
                feature.parameter_name.to_lowercase()
            };
            let mut is_resolved = resolved_keys.contains(&param_key);
            // Derivable parameters count as resolved
            if param_key.contains("length") && has_length {
                is_resolved = true;
            }
            if param_key.contains("airflow") && has_airflow {
                is_resolved = true;
            }
            if is_resolved {
                continue;
            }

            if feature.auto_resolve {
                if let Some(default) = &feature.default_value {
                    resolved.set_str(&param_key, default.clone());
                    verdict.trace(TraceStep::new(
                        "variance_check",
                        format!("{} auto-resolved to '{default}'", feature.feature_name),
                    ));
                    continue;
                }
            }

            verdict.missing_parameters.push(MissingParameter {
                feature_id: feature.feature_id,
                feature_name: feature.feature_name,
                parameter_name: param_key,
                question: feature.question,
                why_needed: feature.why_needed,
                options: feature.options,
            });
        }
        if !verdict.missing_parameters.is_empty() {
            verdict.trace(TraceStep::new(
                "variance_check",
                format!(
                    "{} unresolved feature(s): {}",
                    verdict.missing_parameters.len(),
                    verdict
                        .missing_parameters
                        .iter()
                        .map(|m| m.feature_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }
    }

    // -----------------------------------------------------------------
    // Phase 12: accessory validation
    // -----------------------------------------------------------------

    async fn validate_accessories(&self, context: &EngineContext, verdict: &mut EngineVerdict) {
        let Some(family) = verdict
            .recommended_product
            .as_ref()
            .map(|m| m.product_family_id.clone())
        else {
            return;
        };
        for code in &context.accessories {
            let row = match self.reader.get_accessory_compatibility(code, &family).await {
                Ok(row) => row,
                Err(e) => {
                    Self::degraded(verdict, "accessory_validation", &e);
                    continue;
                }
            };
            let status = match row.status.as_str() {
                "ALLOWED" => AccessoryStatus::Allowed,
                "BLOCKED" => AccessoryStatus::Blocked,
                "NOT_ALLOWED" => AccessoryStatus::NotAllowed,
                "UNKNOWN" => AccessoryStatus::Unknown,
                other => {
                    verdict.trace(TraceStep::new(
                        "accessory_validation",
                        format!("dropped accessory record with unknown status '{other}'"),
                    ));
                    continue;
                }
            };
            let is_compatible = status == AccessoryStatus::Allowed;
            verdict.trace(TraceStep::new(
                "accessory_validation",
                format!("{code} -> {status}"),
            ));
            verdict.accessory_validations.push(AccessoryValidation {
                product_family_id: row.product_family_id,
                accessory_code: row.accessory_code,
                accessory_name: row.accessory_name,
                is_compatible,
                status,
                reason: row.reason,
                compatible_alternatives: row.compatible_alternatives,
            });
        }
    }

    // -----------------------------------------------------------------
    // Phase 13: installation constraints
    // -----------------------------------------------------------------

    async fn check_installation(
        &self,
        product_hint: Option<&str>,
        resolved: &EngineContext,
        verdict: &mut EngineVerdict,
    ) {
        // The hinted product is the one under discussion even when vetoed:
        // an installation block on it must surface, not vanish behind a
        // pivot.
        let family = product_hint
            .map(String::from)
            .or_else(|| {
                verdict
                    .recommended_product
                    .as_ref()
                    .map(|m| family_short_name(&m.product_family_id).to_string())
            });
        let Some(family) = family else { return };

        let rows = match self.reader.get_installation_constraints(&family).await {
            Ok(rows) => rows,
            Err(e) => {
                Self::degraded(verdict, "installation", &e);
                return;
            }
        };
        let required: Vec<String> = Self::demanded_trait_ids(verdict).into_iter().collect();

        for row in rows {
            match evaluate_constraint(self.reader.as_ref(), &row, &family, resolved, &required)
                .await
            {
                Ok(Some(violation)) => {
                    verdict.trace(TraceStep::new(
                        "installation",
                        format!(
                            "{} violated ({}): {}",
                            violation.constraint_id, violation.severity, violation.error_msg
                        ),
                    ));
                    if violation.severity == Severity::Critical {
                        verdict.has_installation_block = true;
                    }
                    verdict.installation_violations.push(violation);
                }
                Ok(None) => {}
                Err(schema_err) => {
                    verdict.trace(TraceStep::new("installation", schema_err));
                }
            }
        }

        if verdict.has_installation_block {
            // Product selection must settle before any substitution is
            // offered; pivots are masked by a blocking violation.
            verdict.auto_pivot_to = None;
            verdict.auto_pivot_name = None;
        }
    }

    // -----------------------------------------------------------------
    // Phase 14: clarification assembly
    // -----------------------------------------------------------------

    async fn collect_clarifications(&self, resolved: &EngineContext, verdict: &mut EngineVerdict) {
        let Some(family) = verdict
            .recommended_product
            .as_ref()
            .map(|m| m.product_family_id.clone())
        else {
            return;
        };

        let mut items: Vec<ClarificationItem> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut push = |rows: Vec<cpq_graph::ParameterRow>, items: &mut Vec<ClarificationItem>, seen: &mut BTreeSet<String>| {
            for row in rows {
                if row.param_id.is_empty() || seen.contains(&row.param_id) {
                    continue;
                }
                if resolved.has(&row.property_key) {
                    continue;
                }
                seen.insert(row.param_id.clone());
                items.push(ClarificationItem {
                    param_id: row.param_id,
                    param_name: row.name,
                    property_key: row.property_key,
                    question: row.question,
                    priority: row.priority,
                    unit: row.unit,
                    triggered_by: row.rule_name,
                });
            }
        };

        match self.reader.get_required_parameters(&family).await {
            Ok(rows) => push(rows, &mut items, &mut seen),
            Err(e) => Self::degraded(verdict, "clarifications", &e),
        }
        if let Some(app_id) = resolved
            .detected_application
            .as_deref()
            .or(resolved.installation_environment.as_deref())
        {
            match self
                .reader
                .get_contextual_clarifications(app_id, Some(family_short_name(&family)))
                .await
            {
                Ok(rows) => push(rows, &mut items, &mut seen),
                Err(e) => Self::degraded(verdict, "clarifications", &e),
            }
        }

        items.sort_by_key(|i| i.priority);
        if !items.is_empty() {
            verdict.trace(TraceStep::new(
                "clarifications",
                format!("{} parameter(s) need clarification", items.len()),
            ));
        }
        verdict.clarification_questions = items;
    }
}
