//! Installation constraint evaluation
//!
//! The constraint kinds form a closed set known at compile time; dispatch is
//! over [`ConstraintType`], not a string-keyed handler table. Each handler
//! returns at most one violation plus verified alternatives; alternative
//! searches are trait-qualified when the surrounding veto demanded traits.

use std::collections::BTreeMap;

use serde_json::Value;

use cpq_core::{
    AlternativeProduct, ConstraintType, EngineContext, InstallationViolation, Severity,
};
use cpq_graph::{family_short_name, GraphReader, InstallationConstraintRow};

/// Evaluate one installation constraint against the request context
pub async fn evaluate_constraint(
    reader: &dyn GraphReader,
    row: &InstallationConstraintRow,
    family: &str,
    context: &EngineContext,
    required_trait_ids: &[String],
) -> Result<Option<InstallationViolation>, String> {
    let Some(constraint_type) = ConstraintType::parse(&row.constraint_type) else {
        return Err(format!(
            "constraint {} has unknown type '{}'",
            row.id, row.constraint_type
        ));
    };
    let Some(severity) = Severity::parse(&row.severity) else {
        return Err(format!(
            "constraint {} has invalid severity '{}'",
            row.id, row.severity
        ));
    };

    let violation = match constraint_type {
        ConstraintType::SetMembership => {
            set_membership(reader, row, family, context, required_trait_ids).await
        }
        ConstraintType::ComputedFormula => {
            computed_formula(reader, row, family, context, required_trait_ids).await
        }
        ConstraintType::CrossNodeThreshold => {
            cross_node_threshold(reader, row, family, context, required_trait_ids).await
        }
        ConstraintType::CrossPropertyCompare => {
            cross_property_compare(reader, row, family, context).await
        }
        ConstraintType::ContextMatch => context_match(reader, row, family, context).await,
    };

    Ok(violation.map(|(details, alternatives)| InstallationViolation {
        constraint_id: row.id.clone(),
        constraint_type,
        severity,
        error_msg: row.error_msg.clone(),
        details,
        alternatives,
    }))
}

type Hit = (BTreeMap<String, Value>, Vec<AlternativeProduct>);

/// A property value (usually the installation environment) must belong to
/// the constraint's valid set. The requested environment expands upward
/// through IS_A before the membership check: a kitchen is still indoors.
async fn set_membership(
    reader: &dyn GraphReader,
    row: &InstallationConstraintRow,
    family: &str,
    context: &EngineContext,
    required_trait_ids: &[String],
) -> Option<Hit> {
    let key = row.input_key.as_deref()?;
    let requested = context.resolved_str(key).or_else(|| {
        if key == "installation_environment" {
            context.installation_environment.clone()
        } else {
            None
        }
    })?;

    let valid: Vec<String> = if row.valid_set.is_empty() {
        row.allowed_environments.clone()
    } else {
        row.valid_set.clone()
    };
    if valid.is_empty() {
        return None;
    }

    let chain = reader
        .resolve_environment_hierarchy(&requested)
        .await
        .unwrap_or_else(|_| vec![requested.clone()]);
    if chain.iter().any(|env| valid.contains(env)) {
        return None;
    }

    let mut details = BTreeMap::new();
    details.insert("requested".into(), Value::String(requested.clone()));
    details.insert(
        "environment_chain".into(),
        Value::Array(chain.iter().cloned().map(Value::String).collect()),
    );
    details.insert(
        "allowed".into(),
        Value::Array(valid.iter().cloned().map(Value::String).collect()),
    );
    details.insert(
        "product".into(),
        Value::String(family_short_name(family).to_string()),
    );

    let alternatives = reader
        .find_alternatives_for_environment_constraint(family, &chain, required_trait_ids)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|alt| AlternativeProduct {
            product_family_id: alt.product_id,
            product_family_name: alt.product_name,
            why_it_works: format!("Rated for {requested} installation"),
            details: alt.details,
        })
        .collect();

    Some((details, alternatives))
}

/// `required = dim_value × (1 + service_access_factor)` must fit the
/// available space
async fn computed_formula(
    reader: &dyn GraphReader,
    row: &InstallationConstraintRow,
    family: &str,
    context: &EngineContext,
    required_trait_ids: &[String],
) -> Option<Hit> {
    let dim_key = row.dimension_key.as_deref()?;
    let input_key = row.input_key.as_deref()?;
    let dim_value = context.resolved_number(dim_key)?;
    let available = context.resolved_number(input_key)?;
    let factor = row.service_access_factor?;

    let required = dim_value * (1.0 + factor);
    if required <= available {
        return None;
    }

    let mut details = BTreeMap::new();
    details.insert(dim_key.to_string(), Value::from(dim_value));
    details.insert("service_access_factor".into(), Value::from(factor));
    details.insert("required_space_mm".into(), Value::from(required));
    details.insert("available_space_mm".into(), Value::from(available));
    if let Some(access) = &row.service_access_type {
        details.insert("service_access_type".into(), Value::String(access.clone()));
    }

    let alternatives = reader
        .find_alternatives_for_space_constraint(
            family,
            dim_key.trim_end_matches("_mm"),
            available,
            dim_value,
            required_trait_ids,
        )
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|alt| {
            let needed = alt
                .details
                .get("required_space_mm")
                .and_then(Value::as_f64)
                .unwrap_or_default();
            AlternativeProduct {
                product_family_id: alt.product_id,
                product_family_name: alt.product_name,
                why_it_works: format!("Needs only {needed:.0} mm of service space"),
                details: alt.details,
            }
        })
        .collect();

    Some((details, alternatives))
}

/// A property on the related material must reach the measured threshold.
/// Alternatives come in two prongs: other materials on the same product,
/// then other families with a qualifying material.
async fn cross_node_threshold(
    reader: &dyn GraphReader,
    row: &InstallationConstraintRow,
    family: &str,
    context: &EngineContext,
    required_trait_ids: &[String],
) -> Option<Hit> {
    let property = row.cross_property.as_deref()?;
    let input_key = row.input_key.as_deref()?;
    let required = context.resolved_number(input_key)?;
    let material = row
        .material_context_key
        .as_deref()
        .and_then(|key| context.resolved_str(key))
        .or_else(|| context.material.clone())?;

    let actual = reader
        .get_material_property(family, &material, property)
        .await
        .ok()
        .flatten();
    if matches!(actual, Some(value) if value >= required) {
        return None;
    }

    let mut details = BTreeMap::new();
    details.insert("material".into(), Value::String(material.clone()));
    details.insert(property.to_string(), Value::from(actual.unwrap_or(0.0)));
    details.insert("required".into(), Value::from(required));

    let mut alternatives: Vec<AlternativeProduct> = reader
        .find_material_alternatives_for_threshold(family, property, required)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|mat| {
            let mut details = BTreeMap::new();
            details.insert("is_material_change".into(), Value::Bool(true));
            details.insert("material_code".into(), Value::String(mat.material_code.clone()));
            details.insert("threshold_value".into(), Value::from(mat.threshold_value));
            AlternativeProduct {
                product_family_id: cpq_graph::family_id(family),
                product_family_name: format!(
                    "{} in {}",
                    family_short_name(family),
                    mat.material_code
                ),
                why_it_works: format!(
                    "{} withstands {:.1} (needs {:.1})",
                    mat.material_name, mat.threshold_value, required
                ),
                details,
            }
        })
        .collect();

    let other_products = reader
        .find_other_products_for_material_threshold(family, property, required, required_trait_ids)
        .await
        .unwrap_or_default();
    alternatives.extend(other_products.into_iter().map(|alt| AlternativeProduct {
        product_family_id: alt.product_id,
        product_family_name: alt.product_name,
        why_it_works: format!("Offers materials rated for {required:.1}"),
        details: alt.details,
    }));

    Some((details, alternatives))
}

/// Two properties on related nodes compared by the constraint operator
async fn cross_property_compare(
    reader: &dyn GraphReader,
    row: &InstallationConstraintRow,
    family: &str,
    context: &EngineContext,
) -> Option<Hit> {
    let rel_type = row.cross_rel_type.as_deref()?;
    let match_prop = row.cross_node_match_property.as_deref()?;
    let target_prop = row.cross_property.as_deref()?;
    let comparison_key = row.comparison_key.as_deref()?;
    let input_key = row.input_key.as_deref()?;

    let match_val = context.resolved.get(comparison_key)?.clone();
    let input = context.resolved_number(input_key)?;

    let related = reader
        .get_related_node_property(family, rel_type, match_prop, &match_val, target_prop)
        .await
        .ok()
        .flatten()
        .and_then(|v| v.as_f64())?;

    let operator = row.operator.as_deref().unwrap_or(">=");
    let satisfied = match operator {
        ">=" => related >= input,
        ">" => related > input,
        "<=" => related <= input,
        "<" => related < input,
        "==" => (related - input).abs() < f64::EPSILON,
        _ => return None,
    };
    if satisfied {
        return None;
    }

    let mut details = BTreeMap::new();
    details.insert(target_prop.to_string(), Value::from(related));
    details.insert(input_key.to_string(), Value::from(input));
    details.insert("operator".into(), Value::String(operator.to_string()));

    let alternatives = reader
        .find_compatible_variants(family, rel_type, match_prop, target_prop, input)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|variant| {
            let mut details = BTreeMap::new();
            details.insert(match_prop.to_string(), variant.variant_value.clone());
            details.insert(target_prop.to_string(), Value::from(variant.threshold));
            AlternativeProduct {
                product_family_id: cpq_graph::family_id(family),
                product_family_name: format!(
                    "{} variant {}",
                    family_short_name(family),
                    variant.variant_value
                ),
                why_it_works: format!("Provides {target_prop} of {:.0}", variant.threshold),
                details,
            }
        })
        .collect();

    Some((details, alternatives))
}

/// A context requirement (e.g. demanded corrosion class) must not exceed the
/// product's own rating
async fn context_match(
    reader: &dyn GraphReader,
    row: &InstallationConstraintRow,
    family: &str,
    context: &EngineContext,
) -> Option<Hit> {
    let key = row.context_match_key.as_deref()?;
    let required = context.resolved_str(key)?;
    let product_value = row.product_property_value.clone()?;

    let required_rank = corrosion_rank(&required)?;
    let product_rank = corrosion_rank(&product_value)?;
    if product_rank >= required_rank {
        return None;
    }

    let mut details = BTreeMap::new();
    details.insert("required".into(), Value::String(required.clone()));
    details.insert("product_rating".into(), Value::String(product_value));

    // Materials with a sufficient numeric rank, best first
    let alternatives = reader
        .find_material_alternatives_for_threshold(family, "corrosion_rank", required_rank)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|mat| {
            let mut details = BTreeMap::new();
            details.insert("is_material_change".into(), Value::Bool(true));
            details.insert("material_code".into(), Value::String(mat.material_code.clone()));
            AlternativeProduct {
                product_family_id: cpq_graph::family_id(family),
                product_family_name: format!(
                    "{} in {}",
                    family_short_name(family),
                    mat.material_code
                ),
                why_it_works: format!("{} is rated {required} or better", mat.material_name),
                details,
            }
        })
        .collect();

    Some((details, alternatives))
}

/// Numeric ordering of corrosion classes: C3 < C4 < C5 < C5.1
fn corrosion_rank(class: &str) -> Option<f64> {
    class.trim().trim_start_matches(['C', 'c']).parse().ok()
}
