//! Prompt-injection serialization
//!
//! The section ordering and labels here are a hidden contract with the
//! downstream response LLM; golden tests pin presence and order. Sections in
//! fixed order: substitution, multi-stage, installation, logic gates,
//! constraint overrides, capacity, variance check, accessories, reasoning
//! summary. Suppression rules:
//! 1. an installation block hides MULTI-STAGE, SUBSTITUTION, and every
//!    clarification demand;
//! 2. a fully vetoed lineup defers gate questions;
//! 3. an assembly replaces the substitution section;
//! 4. SET_MEMBERSHIP violations drop same-product material-swap
//!    alternatives (the product itself is what was blocked).

use cpq_core::{ConstraintType, EngineVerdict, GateState, Severity};

/// Render the verdict as the injection block for the response LLM.
/// An empty verdict renders as the empty string.
pub fn prompt_injection(verdict: &EngineVerdict) -> String {
    let mut sections: Vec<String> = Vec::new();
    let blocked = verdict.has_installation_block;

    // 1. Substitution (veto pivot): hidden by assemblies and blocks
    if verdict.has_veto && !verdict.is_assembly && !blocked {
        if let Some(pivot_name) = &verdict.auto_pivot_name {
            let original = verdict
                .vetoed_products
                .first()
                .map(|m| m.product_family_name.as_str())
                .unwrap_or("the requested product");
            let mut lines = vec![
                "## AUTOMATIC PRODUCT SUBSTITUTION (ENGINEERING VETO)".to_string(),
                format!("**ORIGINAL REQUEST:** {original} - VETOED"),
                format!("**SUBSTITUTED WITH:** {pivot_name}"),
            ];
            if let Some(reason) = &verdict.veto_reason {
                lines.push(format!("**REASON:** {reason}"));
            }
            lines.push(String::new());
            lines.push("THE SYSTEM HAS ALREADY SWITCHED THE PRODUCT. You MUST:".into());
            lines.push(format!(
                "1. ACKNOWLEDGE: 'I cannot offer {original} for this application.'"
            ));
            lines.push(format!(
                "2. CONFIRM: 'I have selected {pivot_name} instead.'"
            ));
            lines.push(format!(
                "3. PROCEED with questions about {pivot_name} (NOT {original})"
            ));
            sections.push(lines.join("\n"));
        }
    }

    // 2. Multi-stage assembly: hidden by blocks
    if verdict.is_assembly && !verdict.assembly.is_empty() && !blocked {
        let mut lines = vec!["## MULTI-STAGE SYSTEM REQUIRED".to_string()];
        if let Some(rationale) = &verdict.assembly_rationale {
            lines.push(format!("**Rationale:** {rationale}"));
        }
        for (i, stage) in verdict.assembly.iter().enumerate() {
            lines.push(format!(
                "- Stage {} ({}): **{}** provides {} - {}",
                i + 1,
                stage.role,
                stage.product_family_name,
                stage.provides_trait_name,
                stage.reason
            ));
        }
        lines.push("ALL stages MUST be included in the final recommendation.".into());
        lines.push("Each stage gets its own product card with shared dimensions and airflow.".into());
        sections.push(lines.join("\n"));
    }

    // 3. Installation constraints
    if !verdict.installation_violations.is_empty() {
        let mut lines = Vec::new();
        let any_critical = verdict
            .installation_violations
            .iter()
            .any(|v| v.severity == Severity::Critical);
        if any_critical {
            lines.push("## INSTALLATION CONSTRAINT: BLOCKED".to_string());
            lines.push(
                "This configuration is physically invalid. You MUST refuse it and explain why."
                    .into(),
            );
        } else {
            lines.push("## INSTALLATION ADVISORIES".to_string());
        }
        for violation in &verdict.installation_violations {
            lines.push(format!(
                "- [{}] {} ({})",
                violation.severity, violation.error_msg, violation.constraint_type
            ));
            if !violation.details.is_empty() {
                let details = violation
                    .details
                    .iter()
                    .map(|(k, v)| format!("{k}={}", render_value(v)))
                    .collect::<Vec<_>>()
                    .join("; ");
                lines.push(format!("  Details: {details}"));
            }
            // Suppression rule 4: a SET_MEMBERSHIP block vetoes the product
            // itself, so offering it again in another material is nonsense.
            let drop_material_swaps =
                violation.constraint_type == ConstraintType::SetMembership;
            for alt in &violation.alternatives {
                if drop_material_swaps && alt.is_material_change() {
                    continue;
                }
                lines.push(format!(
                    "  ALTERNATIVE: **{}** - {}",
                    alt.product_family_name, alt.why_it_works
                ));
            }
        }
        sections.push(lines.join("\n"));
    }

    // 4. Logic gates
    if !verdict.gate_evaluations.is_empty() {
        let defer_all = verdict.all_candidates_vetoed();
        let mut lines = vec!["## LOGIC GATE CHECKS".to_string()];
        for gate in &verdict.gate_evaluations {
            let deferred = defer_all || gate.state == GateState::Deferred;
            match gate.state {
                GateState::Fired => {
                    lines.push(format!(
                        "- Gate {}: FIRED - {}",
                        gate.gate_name, gate.physics_explanation
                    ));
                    if !blocked {
                        lines.push("  This rule is NON-NEGOTIABLE.".into());
                    }
                }
                GateState::Inactive => {
                    lines.push(format!("- Gate {}: INACTIVE", gate.gate_name));
                }
                GateState::ValidationRequired | GateState::Deferred => {
                    let keys = gate
                        .missing_parameters
                        .iter()
                        .map(|p| p.property_key.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    lines.push(format!(
                        "- Gate {}: VALIDATION_REQUIRED - needs: {keys}",
                        gate.gate_name
                    ));
                    if deferred {
                        lines.push(
                            "  Deferred until the product selection is resolved.".into(),
                        );
                    } else if !blocked {
                        for param in &gate.missing_parameters {
                            lines.push(format!(
                                "  YOU MUST ask for {}: {}",
                                param.property_key, param.question
                            ));
                        }
                    }
                }
            }
        }
        sections.push(lines.join("\n"));
    }

    // 5. Hard constraint overrides
    if !verdict.constraint_overrides.is_empty() {
        let mut lines = vec!["## HARD CONSTRAINT OVERRIDES".to_string()];
        for or in &verdict.constraint_overrides {
            lines.push(format!(
                "- {} auto-corrected: {} -> {} (must be {} {}). {}",
                or.property_key,
                or.original_value,
                or.corrected_value,
                or.operator,
                or.corrected_value,
                or.error_msg
            ));
        }
        lines.push("Use the corrected values. Do not revert them.".into());
        sections.push(lines.join("\n"));
    }

    // 6. Capacity
    if let Some(capacity) = &verdict.capacity_calculation {
        let mut lines = vec!["## CAPACITY CALCULATION".to_string()];
        lines.push(format!(
            "- Requirement: {} {} / {} per {} module = **{} module(s)**",
            capacity.input_value,
            capacity.input_requirement,
            capacity.output_rating,
            capacity.module_descriptor,
            capacity.modules_needed
        ));
        if let Some(assumption) = &capacity.assumption {
            lines.push(format!("- Assumption: {assumption}"));
        }
        if let Some(sizing) = &verdict.sizing_arrangement {
            lines.push(format!(
                "- Arrangement: {}W x {}H of {} = {}x{}mm effective",
                sizing.horizontal_count,
                sizing.vertical_count,
                sizing.selected_module_label,
                sizing.effective_width,
                sizing.effective_height
            ));
        }
        for alt in &verdict.capacity_alternatives {
            lines.push(format!(
                "- ALTERNATIVE: **{}** - {}",
                alt.product_family_name, alt.why_it_works
            ));
        }
        sections.push(lines.join("\n"));
    }

    // 7. Variance check: clarification demands are hidden by blocks
    if !verdict.missing_parameters.is_empty() && !blocked {
        let mut lines =
            vec!["## UNRESOLVED VARIABLE FEATURES (MUST ASK BEFORE FINAL ANSWER)".to_string()];
        for missing in &verdict.missing_parameters {
            lines.push(format!("### {}", missing.feature_name));
            lines.push(format!("- Parameter: `{}`", missing.parameter_name));
            lines.push(format!("- Question: {}", missing.question));
            if !missing.why_needed.is_empty() {
                lines.push(format!("- Why needed: {}", missing.why_needed));
            }
            for option in &missing.options {
                let label = if option.display_label.is_empty() {
                    &option.name
                } else {
                    &option.display_label
                };
                let mut line = format!("  - `{}`: {label}", option.value);
                if option.is_recommended {
                    line.push_str(" (RECOMMENDED)");
                }
                if option.is_default {
                    line.push_str(" (default)");
                }
                lines.push(line);
                if !option.benefit.is_empty() {
                    lines.push(format!("    Benefit: {}", option.benefit));
                }
            }
        }
        lines.push("Do NOT give a final product code until ALL features above are resolved.".into());
        sections.push(lines.join("\n"));
    }

    // 8. Accessories
    let blocked_accessories: Vec<_> = verdict
        .accessory_validations
        .iter()
        .filter(|a| !a.is_compatible)
        .collect();
    if !blocked_accessories.is_empty() {
        let mut lines = vec!["## INCOMPATIBLE ACCESSORIES".to_string()];
        for acc in blocked_accessories {
            lines.push(format!(
                "- {} ({}): {} - {}",
                acc.accessory_code,
                acc.accessory_name,
                acc.status,
                acc.reason
                    .clone()
                    .unwrap_or_else(|| "no compatibility relationship in engineering data".into())
            ));
            if !acc.compatible_alternatives.is_empty() {
                lines.push(format!(
                    "  Compatible alternatives: {}",
                    acc.compatible_alternatives.join(", ")
                ));
            }
        }
        lines.push("REJECT these combinations and offer the alternatives.".into());
        sections.push(lines.join("\n"));
    }

    // 9. Reasoning summary
    if !verdict.reasoning_trace.is_empty() {
        let mut lines = vec!["## REASONING SUMMARY".to_string()];
        for step in &verdict.reasoning_trace {
            lines.push(format!("- [{}] {}", step.stage, step.summary));
        }
        sections.push(lines.join("\n"));
    }

    sections.join("\n\n")
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use cpq_core::{
        AlternativeProduct, AssemblyStage, CapacityCalculation, ConstraintOverride,
        GateEvaluation, GateParameter, InstallationViolation, StageRole, TraitMatch,
    };

    fn gate(state: GateState) -> GateEvaluation {
        GateEvaluation {
            gate_id: "G1".into(),
            gate_name: "Chlorine Gate".into(),
            state,
            stressor_id: "STR_CHLORINE".into(),
            stressor_name: "Chlorine".into(),
            physics_explanation: "Grease blocks filter pores rapidly".into(),
            missing_parameters: vec![GateParameter {
                param_id: "P1".into(),
                name: "Chlorine concentration".into(),
                property_key: "chlorine_ppm".into(),
                question: "What is the chlorine level?".into(),
                unit: Some("ppm".into()),
                priority: 1,
            }],
        }
    }

    fn critical_violation(alternatives: Vec<AlternativeProduct>) -> InstallationViolation {
        let mut details = BTreeMap::new();
        details.insert("environment".into(), serde_json::json!("outdoor"));
        details.insert("product".into(), serde_json::json!("GDB"));
        InstallationViolation {
            constraint_id: "IC_GDB_ENV".into(),
            constraint_type: ConstraintType::SetMembership,
            severity: Severity::Critical,
            error_msg: "GDB not valid for outdoor installation".into(),
            details,
            alternatives,
        }
    }

    #[test]
    fn test_empty_verdict_renders_empty_string() {
        assert_eq!(prompt_injection(&EngineVerdict::default()), "");
    }

    #[test]
    fn test_substitution_section() {
        let mut v = EngineVerdict::default();
        v.has_veto = true;
        v.veto_reason = Some("GDC cannot handle particle filtration".into());
        v.auto_pivot_name = Some("GDB".into());
        v.vetoed_products = vec![TraitMatch {
            product_family_name: "GDC".into(),
            vetoed: true,
            ..Default::default()
        }];
        let text = prompt_injection(&v);
        assert!(text.contains("SUBSTITUTION"));
        assert!(text.contains("VETOED"));
        assert!(text.contains("GDB"));
        assert!(text.contains("GDC cannot handle particle filtration"));
    }

    #[test]
    fn test_substitution_suppressed_by_block() {
        let mut v = EngineVerdict::default();
        v.has_veto = true;
        v.veto_reason = Some("Wrong product".into());
        v.auto_pivot_name = Some("GDB".into());
        v.installation_violations = vec![critical_violation(vec![])];
        v.has_installation_block = true;
        let text = prompt_injection(&v);
        assert!(!text.contains("SUBSTITUTION"));
        assert!(text.contains("BLOCKED"));
    }

    #[test]
    fn test_assembly_section_and_suppression() {
        let mut v = EngineVerdict::default();
        v.is_assembly = true;
        v.assembly_rationale = Some("Protective pre-stage for grease".into());
        v.assembly = vec![
            AssemblyStage {
                role: StageRole::Protector,
                product_family_id: "FAM_GDP".into(),
                product_family_name: "GDP".into(),
                provides_trait_id: "T1".into(),
                provides_trait_name: "Grease protection".into(),
                reason: "Pre-filters grease particles".into(),
            },
            AssemblyStage {
                role: StageRole::Target,
                product_family_id: "FAM_GDB".into(),
                product_family_name: "GDB".into(),
                provides_trait_id: "T2".into(),
                provides_trait_name: "Particle filtration".into(),
                reason: "Main particle filtration stage".into(),
            },
        ];
        let text = prompt_injection(&v);
        assert!(text.contains("MULTI-STAGE"));
        assert!(text.contains("GDP"));
        assert!(text.contains("GDB"));
        assert!(text.contains("PROTECTOR"));
        assert!(text.contains("TARGET"));
        assert!(text.contains("Protective pre-stage for grease"));

        // Suppressed by an installation block
        v.installation_violations = vec![critical_violation(vec![])];
        v.has_installation_block = true;
        let text = prompt_injection(&v);
        assert!(!text.contains("MULTI-STAGE"));
        assert!(text.contains("BLOCKED"));
    }

    #[test]
    fn test_installation_block_with_alternatives() {
        let alt = AlternativeProduct {
            product_family_id: "FAM_GDR".into(),
            product_family_name: "GDR".into(),
            why_it_works: "Designed for outdoor environments".into(),
            details: BTreeMap::new(),
        };
        let mut v = EngineVerdict::default();
        v.installation_violations = vec![critical_violation(vec![alt])];
        v.has_installation_block = true;
        let text = prompt_injection(&v);
        assert!(text.contains("BLOCKED"));
        assert!(text.contains("GDB not valid"));
        assert!(text.contains("outdoor"));
        assert!(text.contains("ALTERNATIVE"));
        assert!(text.contains("GDR"));
    }

    #[test]
    fn test_material_swap_alternatives_stripped_for_set_membership() {
        let mut swap_details = BTreeMap::new();
        swap_details.insert("is_material_change".into(), serde_json::json!(true));
        swap_details.insert("material_code".into(), serde_json::json!("RF"));
        let material_swap = AlternativeProduct {
            product_family_id: "FAM_GDB".into(),
            product_family_name: "GDB".into(),
            why_it_works: "With RF material".into(),
            details: swap_details,
        };
        let other = AlternativeProduct {
            product_family_id: "FAM_GDR".into(),
            product_family_name: "GDR".into(),
            why_it_works: "Outdoor-rated product".into(),
            details: BTreeMap::new(),
        };
        let mut v = EngineVerdict::default();
        v.installation_violations = vec![critical_violation(vec![material_swap, other])];
        v.has_installation_block = true;
        let text = prompt_injection(&v);
        assert!(text.contains("GDR"));
        let swap_lines: Vec<&str> = text
            .lines()
            .filter(|l| l.contains("GDB") && l.contains("With RF"))
            .collect();
        assert!(swap_lines.is_empty(), "material swap must be stripped");
    }

    #[test]
    fn test_gate_validation_required_demands_parameter() {
        let mut v = EngineVerdict::default();
        v.gate_evaluations = vec![gate(GateState::ValidationRequired)];
        let text = prompt_injection(&v);
        assert!(text.contains("LOGIC GATE"));
        assert!(text.contains("Chlorine Gate"));
        assert!(text.contains("VALIDATION_REQUIRED"));
        assert!(text.contains("chlorine_ppm"));
        assert!(text.contains("MUST ask"));
    }

    #[test]
    fn test_gate_fired_shows_physics() {
        let mut v = EngineVerdict::default();
        v.gate_evaluations = vec![gate(GateState::Fired)];
        let text = prompt_injection(&v);
        assert!(text.contains("FIRED"));
        assert!(text.contains("blocks filter pores"));
        assert!(text.contains("NON-NEGOTIABLE"));
    }

    #[test]
    fn test_gates_deferred_when_all_candidates_vetoed() {
        let mut v = EngineVerdict::default();
        v.ranked_products = vec![
            TraitMatch {
                product_family_id: "FAM_GDB".into(),
                vetoed: true,
                ..Default::default()
            },
            TraitMatch {
                product_family_id: "FAM_GDP".into(),
                vetoed: true,
                ..Default::default()
            },
        ];
        v.gate_evaluations = vec![gate(GateState::ValidationRequired)];
        let text = prompt_injection(&v);
        assert!(text.contains("Deferred"));
        assert!(!text.contains("MUST ask"));
    }

    #[test]
    fn test_constraint_override_section() {
        let mut v = EngineVerdict::default();
        v.constraint_overrides = vec![ConstraintOverride {
            item_id: "FAM_GDB".into(),
            property_key: "housing_length".into(),
            operator: ">=".into(),
            original_value: 400.0,
            corrected_value: 550.0,
            error_msg: "Minimum housing length for this depth".into(),
        }];
        let text = prompt_injection(&v);
        assert!(text.contains("CONSTRAINT OVERRIDE") || text.contains("OVERRIDE"));
        assert!(text.contains("housing_length"));
        assert!(text.contains("400"));
        assert!(text.contains("550"));
    }

    #[test]
    fn test_capacity_section() {
        let mut v = EngineVerdict::default();
        v.capacity_calculation = Some(CapacityCalculation {
            input_value: 6000.0,
            input_requirement: "m³/h".into(),
            output_rating: 3400.0,
            modules_needed: 2,
            module_descriptor: "600x600".into(),
            assumption: Some("1.5 m/s face velocity".into()),
            description: None,
        });
        let text = prompt_injection(&v);
        assert!(text.contains("CAPACITY"));
        assert!(text.contains("6000"));
        assert!(text.contains("3400"));
        assert!(text.contains("2"));
    }

    #[test]
    fn test_section_order_is_stable() {
        let mut v = EngineVerdict::default();
        v.is_assembly = true;
        v.assembly = vec![AssemblyStage {
            role: StageRole::Protector,
            product_family_id: "FAM_GDP".into(),
            product_family_name: "GDP".into(),
            provides_trait_id: "T".into(),
            provides_trait_name: "Grease".into(),
            reason: String::new(),
        }];
        v.gate_evaluations = vec![gate(GateState::Fired)];
        v.constraint_overrides = vec![ConstraintOverride {
            item_id: "FAM_GDB".into(),
            property_key: "housing_length".into(),
            operator: ">=".into(),
            original_value: 400.0,
            corrected_value: 550.0,
            error_msg: String::new(),
        }];
        v.capacity_calculation = Some(CapacityCalculation {
            input_value: 6000.0,
            input_requirement: "m³/h".into(),
            output_rating: 3400.0,
            modules_needed: 2,
            module_descriptor: "600x600".into(),
            assumption: None,
            description: None,
        });
        v.reasoning_trace.push(cpq_core::TraceStep::new("ranking", "ok"));
        let text = prompt_injection(&v);

        let multi = text.find("MULTI-STAGE").unwrap();
        let gates = text.find("LOGIC GATE").unwrap();
        let overrides = text.find("OVERRIDE").unwrap();
        let capacity = text.find("CAPACITY").unwrap();
        let summary = text.find("REASONING SUMMARY").unwrap();
        assert!(multi < gates && gates < overrides && overrides < capacity && capacity < summary);
    }
}
