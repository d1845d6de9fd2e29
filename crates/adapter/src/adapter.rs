//! EngineVerdict → GraphReasoningReport transform

use cpq_core::{EngineVerdict, GateState, RuleKind, Severity};

use crate::report::{
    ApplicationMatch, ClarificationQuestion, GraphReasoningReport, MaterialRequirement,
    ProductPivot, RiskType, RiskWarning, SuitabilityResult,
};

/// Pure functional adapter
#[derive(Debug, Default)]
pub struct VerdictAdapter;

impl VerdictAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Convert an engine verdict into the presentation report
    pub fn adapt(&self, verdict: &EngineVerdict) -> GraphReasoningReport {
        GraphReasoningReport {
            application: self.map_application(verdict),
            suitability: self.map_suitability(verdict),
            clarifications: self.map_clarifications(verdict),
            variable_features: verdict.missing_parameters.clone(),
            accessory_compatibility: verdict.accessory_validations.clone(),
            product_pivot: self.map_pivot(verdict),
            reasoning_steps: verdict.reasoning_trace.clone(),
        }
    }

    fn map_application(&self, verdict: &EngineVerdict) -> Option<ApplicationMatch> {
        if let Some(app) = &verdict.application_match {
            return Some(ApplicationMatch {
                id: app.id.clone(),
                name: app.name.clone(),
                keywords: app.keywords.clone(),
                matched_keyword: app
                    .keywords
                    .first()
                    .cloned()
                    .unwrap_or_else(|| app.name.clone()),
                confidence: 1.0,
            });
        }
        // Fall back to a stressor reached through an application link
        verdict
            .detected_stressors
            .iter()
            .find(|s| s.source_context.is_some())
            .map(|s| {
                let name = s.source_context.clone().unwrap_or_default();
                ApplicationMatch {
                    id: name.to_uppercase().replace(' ', "_"),
                    name,
                    keywords: s.matched_keywords.clone(),
                    matched_keyword: s
                        .matched_keywords
                        .first()
                        .cloned()
                        .unwrap_or_else(|| s.name.clone()),
                    confidence: s.confidence,
                }
            })
    }

    fn map_suitability(&self, verdict: &EngineVerdict) -> SuitabilityResult {
        let mut warnings = Vec::new();

        for vetoed in &verdict.vetoed_products {
            for reason in &vetoed.veto_reasons {
                warnings.push(RiskWarning {
                    risk_name: format!("Engineering Veto: {}", vetoed.product_family_name),
                    risk_type: RiskType::TraitVeto,
                    severity: Severity::Critical,
                    description: reason.clone(),
                    consequence: format!(
                        "{} cannot safely operate in this environment",
                        vetoed.product_family_name
                    ),
                    mitigation: verdict
                        .auto_pivot_name
                        .as_ref()
                        .map(|name| format!("Use {name}"))
                        .unwrap_or_else(|| "Select a product with the required traits".into()),
                    graph_path: format!(
                        "(Stressor)-[:DEMANDS_TRAIT]->(Trait) NOT IN ({})-[:HAS_TRAIT]->()",
                        vetoed.product_family_name
                    ),
                });
            }
        }

        if let Some(rec) = &verdict.recommended_product {
            for trait_id in &rec.traits_missing {
                let rule = verdict.active_causal_rules.iter().find(|r| {
                    r.rule_type == RuleKind::DemandsTrait && &r.trait_id == trait_id
                });
                if let Some(rule) = rule {
                    if rule.severity != Severity::Critical {
                        warnings.push(RiskWarning {
                            risk_name: format!("Gap: {}", rule.trait_name),
                            risk_type: RiskType::TraitGap,
                            severity: rule.severity,
                            description: rule.explanation.clone(),
                            consequence: format!(
                                "{} does not provide {} (needed for {})",
                                rec.product_family_name, rule.trait_name, rule.stressor_name
                            ),
                            mitigation: "Consider products with this trait".into(),
                            graph_path: format!(
                                "({})-[:DEMANDS_TRAIT]->({})",
                                rule.stressor_id, rule.trait_id
                            ),
                        });
                    }
                }
            }
            for trait_id in &rec.traits_neutralized {
                let rule = verdict.active_causal_rules.iter().find(|r| {
                    r.rule_type == RuleKind::NeutralizedBy && &r.trait_id == trait_id
                });
                if let Some(rule) = rule {
                    warnings.push(RiskWarning {
                        risk_name: format!("Neutralized: {}", rule.trait_name),
                        risk_type: RiskType::TraitNeutralization,
                        severity: rule.severity,
                        description: rule.explanation.clone(),
                        consequence: format!(
                            "{}'s {} is rendered ineffective by {}",
                            rec.product_family_name, rule.trait_name, rule.stressor_name
                        ),
                        mitigation: "Consider alternative technology".into(),
                        graph_path: format!(
                            "({})-[:NEUTRALIZED_BY]->({})",
                            rule.trait_id, rule.stressor_id
                        ),
                    });
                }
            }
        }

        for gate in &verdict.gate_evaluations {
            match gate.state {
                GateState::ValidationRequired => {
                    let keys: Vec<&str> = gate
                        .missing_parameters
                        .iter()
                        .map(|p| p.property_key.as_str())
                        .collect();
                    warnings.push(RiskWarning {
                        risk_name: format!("Gate: {}", gate.gate_name),
                        risk_type: RiskType::GateValidationRequired,
                        severity: Severity::Info,
                        description: format!(
                            "Gate {} requires data before evaluation: {}",
                            gate.gate_name,
                            keys.join(", ")
                        ),
                        consequence: "Cannot confirm or deny the physics constraint without this data"
                            .into(),
                        mitigation: "Provide the requested parameters".into(),
                        graph_path: format!(
                            "(LogicGate:{})-[:MONITORS]->(Stressor:{})",
                            gate.gate_id, gate.stressor_id
                        ),
                    });
                }
                GateState::Fired => {
                    warnings.push(RiskWarning {
                        risk_name: format!("Gate: {}", gate.gate_name),
                        risk_type: RiskType::GateFired,
                        severity: Severity::Critical,
                        description: gate.physics_explanation.clone(),
                        consequence: format!(
                            "Physics constraint confirmed by {}",
                            gate.stressor_name
                        ),
                        mitigation: "Non-negotiable: follow the engineering recommendation".into(),
                        graph_path: format!(
                            "(LogicGate:{})-[:MONITORS]->(Stressor:{})",
                            gate.gate_id, gate.stressor_id
                        ),
                    });
                }
                GateState::Deferred | GateState::Inactive => {}
            }
        }

        for or in &verdict.constraint_overrides {
            warnings.push(RiskWarning {
                risk_name: format!("Constraint: {}", or.property_key),
                risk_type: RiskType::HardConstraintOverride,
                severity: Severity::Warning,
                description: or.error_msg.clone(),
                consequence: format!(
                    "{} auto-corrected from {} to {}",
                    or.property_key, or.original_value, or.corrected_value
                ),
                mitigation: "Value auto-corrected to meet physical requirements".into(),
                graph_path: format!(
                    "(ProductFamily:{})-[:HAS_HARD_CONSTRAINT]->(HardConstraint:{})",
                    or.item_id, or.property_key
                ),
            });
        }

        for acc in &verdict.accessory_validations {
            if acc.is_compatible {
                continue;
            }
            let alternatives = if acc.compatible_alternatives.is_empty() {
                "None listed".to_string()
            } else {
                acc.compatible_alternatives.join(", ")
            };
            warnings.push(RiskWarning {
                risk_name: format!("Accessory: {}", acc.accessory_code),
                risk_type: RiskType::AccessoryBlocked,
                severity: Severity::Critical,
                description: format!(
                    "{} ({}) is NOT compatible with {}",
                    acc.accessory_code, acc.accessory_name, acc.product_family_id
                ),
                consequence: acc
                    .reason
                    .clone()
                    .unwrap_or_else(|| "No explicit compatibility in engineering data".into()),
                mitigation: format!("Compatible alternatives: {alternatives}"),
                graph_path: format!(
                    "({})-[:HAS_COMPATIBLE_ACCESSORY]-/->({})",
                    acc.product_family_id, acc.accessory_code
                ),
            });
        }

        for violation in &verdict.installation_violations {
            let alternatives: Vec<&str> = violation
                .alternatives
                .iter()
                .take(3)
                .map(|a| a.product_family_name.as_str())
                .collect();
            let mitigation = if alternatives.is_empty() {
                "Reconfigure installation space, product, or material to satisfy the constraint"
                    .to_string()
            } else {
                format!("Verified alternatives: {}", alternatives.join(", "))
            };
            warnings.push(RiskWarning {
                risk_name: format!("Installation: {}", violation.constraint_id),
                risk_type: RiskType::InstallationBlocked,
                severity: violation.severity,
                description: violation.error_msg.clone(),
                consequence: format!(
                    "Constraint type: {}. {}",
                    violation.constraint_type,
                    violation
                        .details
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
                mitigation,
                graph_path: format!(
                    "(ProductFamily)-[:HAS_INSTALLATION_CONSTRAINT]->({})",
                    violation.constraint_id
                ),
            });
        }

        // An assembly resolves the veto: the product is suitable with its
        // protector. An installation block overrides everything.
        let is_suitable =
            (verdict.is_assembly || !verdict.has_veto) && !verdict.has_installation_block;

        SuitabilityResult {
            is_suitable,
            warnings,
            required_materials: self.map_material_requirements(verdict),
        }
    }

    /// DEMANDS_TRAIT edges on corrosion traits become class requirements
    fn map_material_requirements(&self, verdict: &EngineVerdict) -> Vec<MaterialRequirement> {
        let mut seen = std::collections::BTreeSet::new();
        let mut requirements = Vec::new();
        for rule in &verdict.active_causal_rules {
            if rule.rule_type != RuleKind::DemandsTrait {
                continue;
            }
            let Some(class) = corrosion_class_from_trait(&rule.trait_id) else {
                continue;
            };
            if !seen.insert(class.clone()) {
                continue;
            }
            requirements.push(MaterialRequirement {
                corrosion_class: class.clone(),
                description: format!("Any material rated {class} or higher"),
                reason: format!("{}: {}", rule.stressor_name, rule.explanation),
            });
        }
        requirements
    }

    /// Clarifications: suppressed entirely under an installation block;
    /// otherwise engine clarifications plus the data demands of
    /// validation-required gates.
    fn map_clarifications(&self, verdict: &EngineVerdict) -> Vec<ClarificationQuestion> {
        if verdict.has_installation_block {
            return Vec::new();
        }
        let mut seen = std::collections::BTreeSet::new();
        let mut questions: Vec<ClarificationQuestion> = verdict
            .clarification_questions
            .iter()
            .map(|q| {
                seen.insert(q.property_key.clone());
                ClarificationQuestion {
                    param_id: q.param_id.clone(),
                    param_name: q.param_name.clone(),
                    property_key: q.property_key.clone(),
                    question_text: q.question.clone(),
                    priority: q.priority,
                    triggered_by: q.triggered_by.clone(),
                }
            })
            .collect();
        for gate in &verdict.gate_evaluations {
            if gate.state != GateState::ValidationRequired {
                continue;
            }
            for param in &gate.missing_parameters {
                if !seen.insert(param.property_key.clone()) {
                    continue;
                }
                questions.push(ClarificationQuestion {
                    param_id: param.param_id.clone(),
                    param_name: param.name.clone(),
                    property_key: param.property_key.clone(),
                    question_text: param.question.clone(),
                    priority: param.priority,
                    triggered_by: Some(gate.gate_name.clone()),
                });
            }
        }
        questions.sort_by_key(|q| q.priority);
        questions
    }

    /// Pivot record; an assembly keeps the user's product and emits none
    fn map_pivot(&self, verdict: &EngineVerdict) -> Option<ProductPivot> {
        if verdict.is_assembly || verdict.has_installation_block {
            return None;
        }
        if !verdict.has_veto {
            return None;
        }
        let pivoted_to = verdict.auto_pivot_name.clone()?;
        let original = verdict
            .vetoed_products
            .first()
            .map(|m| m.product_family_name.clone())
            .unwrap_or_else(|| "Unknown".into());
        let physics: Vec<&str> = verdict
            .active_causal_rules
            .iter()
            .filter(|r| r.severity == Severity::Critical)
            .take(3)
            .map(|r| r.explanation.as_str())
            .collect();
        let required_feature = verdict
            .recommended_product
            .as_ref()
            .map(|rec| rec.traits_present.iter().take(2).cloned().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        Some(ProductPivot {
            original_product: original,
            pivoted_to,
            reason: verdict.veto_reason.clone().unwrap_or_else(|| "Engineering veto".into()),
            physics_explanation: if physics.is_empty() {
                verdict.veto_reason.clone().unwrap_or_default()
            } else {
                physics.join("; ")
            },
            required_feature,
        })
    }
}

/// `TRAIT_CORROSION_C5` → `C5`; `TRAIT_CORROSION_RESISTANCE_C5M` → `C5M`
fn corrosion_class_from_trait(trait_id: &str) -> Option<String> {
    if !trait_id.to_uppercase().contains("CORROSION") {
        return None;
    }
    trait_id
        .rsplit('_')
        .next()
        .filter(|seg| {
            seg.len() >= 2
                && seg.starts_with('C')
                && seg.chars().nth(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
        })
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpq_core::{
        CausalRule, ConstraintType, GateEvaluation, GateParameter, InstallationViolation,
        TraitMatch,
    };

    fn demand_rule(trait_id: &str, severity: Severity) -> CausalRule {
        CausalRule {
            rule_type: RuleKind::DemandsTrait,
            stressor_id: "STR_X".into(),
            stressor_name: "X".into(),
            trait_id: trait_id.into(),
            trait_name: trait_id.into(),
            severity,
            explanation: format!("{trait_id} required"),
        }
    }

    #[test]
    fn test_corrosion_class_parsing() {
        assert_eq!(corrosion_class_from_trait("TRAIT_CORROSION_C5").as_deref(), Some("C5"));
        assert_eq!(
            corrosion_class_from_trait("TRAIT_CORROSION_RESISTANCE_C5M").as_deref(),
            Some("C5M")
        );
        assert_eq!(corrosion_class_from_trait("TRAIT_GREASE_PRE"), None);
    }

    #[test]
    fn test_veto_becomes_critical_warning() {
        let mut verdict = EngineVerdict::default();
        verdict.vetoed_products = vec![TraitMatch {
            product_family_name: "GDC".into(),
            vetoed: true,
            veto_reasons: vec!["carbon neutralized by grease".into()],
            ..Default::default()
        }];
        verdict.has_veto = true;
        let report = VerdictAdapter::new().adapt(&verdict);
        let veto: Vec<_> = report
            .suitability
            .warnings
            .iter()
            .filter(|w| w.risk_type == RiskType::TraitVeto)
            .collect();
        assert_eq!(veto.len(), 1);
        assert_eq!(veto[0].severity, Severity::Critical);
        assert!(!report.suitability.is_suitable);
    }

    #[test]
    fn test_assembly_is_suitable_and_has_no_pivot() {
        let mut verdict = EngineVerdict::default();
        verdict.has_veto = true;
        verdict.is_assembly = true;
        verdict.auto_pivot_name = None;
        let report = VerdictAdapter::new().adapt(&verdict);
        assert!(report.suitability.is_suitable);
        assert!(report.product_pivot.is_none());
    }

    #[test]
    fn test_pivot_mapped_when_not_assembly() {
        let mut verdict = EngineVerdict::default();
        verdict.has_veto = true;
        verdict.auto_pivot_name = Some("GDMI".into());
        verdict.auto_pivot_to = Some("FAM_GDMI".into());
        verdict.veto_reason = Some("no thermal insulation".into());
        verdict.vetoed_products = vec![TraitMatch {
            product_family_name: "GDB".into(),
            vetoed: true,
            ..Default::default()
        }];
        let report = VerdictAdapter::new().adapt(&verdict);
        let pivot = report.product_pivot.expect("pivot mapped");
        assert_eq!(pivot.original_product, "GDB");
        assert_eq!(pivot.pivoted_to, "GDMI");
    }

    #[test]
    fn test_corrosion_demand_becomes_material_requirement() {
        let mut verdict = EngineVerdict::default();
        verdict.active_causal_rules =
            vec![demand_rule("TRAIT_CORROSION_C5", Severity::Critical)];
        let report = VerdictAdapter::new().adapt(&verdict);
        assert_eq!(report.suitability.required_materials.len(), 1);
        assert_eq!(report.suitability.required_materials[0].corrosion_class, "C5");
    }

    #[test]
    fn test_gate_states_map_to_warnings_and_clarifications() {
        let mut verdict = EngineVerdict::default();
        verdict.gate_evaluations = vec![GateEvaluation {
            gate_id: "G1".into(),
            gate_name: "Chlorine Gate".into(),
            state: GateState::ValidationRequired,
            stressor_id: "STR_CHLORINE".into(),
            stressor_name: "Chlorine".into(),
            physics_explanation: String::new(),
            missing_parameters: vec![GateParameter {
                param_id: "P1".into(),
                name: "Chlorine concentration".into(),
                property_key: "chlorine_ppm".into(),
                question: "What is the chlorine level?".into(),
                unit: Some("ppm".into()),
                priority: 1,
            }],
        }];
        let report = VerdictAdapter::new().adapt(&verdict);
        assert!(report
            .suitability
            .warnings
            .iter()
            .any(|w| w.risk_type == RiskType::GateValidationRequired
                && w.severity == Severity::Info));
        assert!(report
            .clarifications
            .iter()
            .any(|q| q.property_key == "chlorine_ppm"));
    }

    #[test]
    fn test_installation_block_suppresses_clarifications() {
        let mut verdict = EngineVerdict::default();
        verdict.has_installation_block = true;
        verdict.installation_violations = vec![InstallationViolation {
            constraint_id: "IC1".into(),
            constraint_type: ConstraintType::SetMembership,
            severity: Severity::Critical,
            error_msg: "not rated for outdoor".into(),
            details: Default::default(),
            alternatives: Vec::new(),
        }];
        verdict.gate_evaluations = vec![GateEvaluation {
            gate_id: "G1".into(),
            gate_name: "Gate".into(),
            state: GateState::ValidationRequired,
            stressor_id: "S".into(),
            stressor_name: "S".into(),
            physics_explanation: String::new(),
            missing_parameters: vec![],
        }];
        verdict.has_veto = true;
        verdict.auto_pivot_name = Some("GDMI".into());
        let report = VerdictAdapter::new().adapt(&verdict);
        assert!(report.clarifications.is_empty());
        assert!(report.product_pivot.is_none());
        assert!(!report.suitability.is_suitable);
        assert!(report
            .suitability
            .warnings
            .iter()
            .any(|w| w.risk_type == RiskType::InstallationBlocked));
    }
}
