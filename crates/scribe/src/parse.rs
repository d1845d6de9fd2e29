//! Intent parsing and derived-action resolution

use std::collections::{HashMap, HashSet};

use cpq_core::SemanticIntent;

use crate::repair::repair_json;

/// Parse (repairing if needed) an LLM response into a `SemanticIntent`
///
/// Returns `None` when the payload cannot be made parseable: the caller
/// must fall back to regex extraction.
pub fn parse_intent(raw: &str) -> Option<SemanticIntent> {
    if raw.trim().is_empty() {
        return None;
    }
    let repaired = repair_json(raw);
    match serde_json::from_str::<SemanticIntent>(&repaired) {
        Ok(mut intent) => {
            resolve_derived_actions(&mut intent);
            Some(intent)
        }
        Err(e) => {
            tracing::warn!(error = %e, "scribe response unparseable after repair");
            None
        }
    }
}

/// Resolve `same_as` / `double` entity references
///
/// `same_as: item_N` copies the referent's missing numeric fields;
/// `double: item_N` copies dimensions and doubles the airflow. Chains are
/// followed to their origin; a reference cycle is broken deterministically
/// by dropping the link and recording a diagnostic. Identity is never
/// guessed from context.
pub fn resolve_derived_actions(intent: &mut SemanticIntent) {
    let by_id: HashMap<String, usize> = intent
        .entity_references
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect();

    let mut diagnostics = Vec::new();
    for idx in 0..intent.entity_references.len() {
        let link = {
            let entity = &intent.entity_references[idx];
            entity
                .same_as
                .clone()
                .map(|r| (r, false))
                .or_else(|| entity.double.clone().map(|r| (r, true)))
        };
        let Some((mut referent_id, is_double)) = link else {
            continue;
        };

        // Follow the chain to its origin, watching for cycles.
        let own_id = intent.entity_references[idx].id.clone();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(own_id.clone());
        let resolved = loop {
            if visited.contains(&referent_id) {
                break None;
            }
            visited.insert(referent_id.clone());
            let Some(&ref_idx) = by_id.get(&referent_id) else {
                break None;
            };
            let referent = &intent.entity_references[ref_idx];
            match referent.same_as.clone().or_else(|| referent.double.clone()) {
                Some(next) => referent_id = next,
                None => break Some(ref_idx),
            }
        };

        let Some(ref_idx) = resolved else {
            let entity = &mut intent.entity_references[idx];
            diagnostics.push(format!(
                "dropped unresolvable reference on {own_id} (cycle or unknown referent)"
            ));
            entity.same_as = None;
            entity.double = None;
            continue;
        };

        let source = intent.entity_references[ref_idx].clone();
        let entity = &mut intent.entity_references[idx];
        if entity.filter_width.is_none() {
            entity.filter_width = source.filter_width;
        }
        if entity.filter_height.is_none() {
            entity.filter_height = source.filter_height;
        }
        if entity.filter_depth.is_none() {
            entity.filter_depth = source.filter_depth;
        }
        if entity.housing_length.is_none() {
            entity.housing_length = source.housing_length;
        }
        if entity.airflow_m3h.is_none() {
            entity.airflow_m3h = source.airflow_m3h.map(|a| if is_double { a * 2 } else { a });
        }
        if entity.quantity.is_none() {
            entity.quantity = source.quantity;
        }
    }

    intent.diagnostics.extend(diagnostics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpq_core::EntityReference;

    fn entity(id: &str) -> EntityReference {
        EntityReference {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_full_intent() {
        let raw = r#"{
            "language": "en",
            "numeric_constraints": [{"value": 3000, "unit": "m3/h", "context": "airflow"}],
            "entity_references": [
                {"id": "item_1", "filter_width": 600, "filter_height": 600, "filter_depth": 292, "airflow_m3h": 3000}
            ],
            "action_intent": "select",
            "material": "RF",
            "detected_application": "APP_HOSPITAL",
            "has_specific_constraint": true
        }"#;
        let intent = parse_intent(raw).unwrap();
        assert_eq!(intent.material.as_deref(), Some("RF"));
        assert_eq!(intent.entity_references.len(), 1);
        assert_eq!(intent.entity_references[0].filter_width, Some(600));
    }

    #[test]
    fn test_parse_empty_returns_none() {
        assert!(parse_intent("").is_none());
        assert!(parse_intent("I could not extract anything").is_none());
    }

    #[test]
    fn test_same_as_copies_fields() {
        let mut intent = SemanticIntent::default();
        let mut item1 = entity("item_1");
        item1.filter_width = Some(600);
        item1.filter_height = Some(600);
        item1.airflow_m3h = Some(3000);
        let mut item2 = entity("item_2");
        item2.same_as = Some("item_1".into());
        intent.entity_references = vec![item1, item2];

        resolve_derived_actions(&mut intent);
        let item2 = &intent.entity_references[1];
        assert_eq!(item2.filter_width, Some(600));
        assert_eq!(item2.airflow_m3h, Some(3000));
        assert!(intent.diagnostics.is_empty());
    }

    #[test]
    fn test_double_doubles_airflow() {
        let mut intent = SemanticIntent::default();
        let mut item1 = entity("item_1");
        item1.filter_width = Some(600);
        item1.airflow_m3h = Some(3000);
        let mut item2 = entity("item_2");
        item2.double = Some("item_1".into());
        intent.entity_references = vec![item1, item2];

        resolve_derived_actions(&mut intent);
        let item2 = &intent.entity_references[1];
        assert_eq!(item2.airflow_m3h, Some(6000));
        assert_eq!(item2.filter_width, Some(600));
    }

    #[test]
    fn test_chain_resolves_to_origin() {
        let mut intent = SemanticIntent::default();
        let mut item1 = entity("item_1");
        item1.airflow_m3h = Some(1000);
        let mut item2 = entity("item_2");
        item2.same_as = Some("item_1".into());
        let mut item3 = entity("item_3");
        item3.same_as = Some("item_2".into());
        intent.entity_references = vec![item1, item2, item3];

        resolve_derived_actions(&mut intent);
        assert_eq!(intent.entity_references[2].airflow_m3h, Some(1000));
    }

    #[test]
    fn test_cycle_dropped_with_diagnostic() {
        let mut intent = SemanticIntent::default();
        let mut item1 = entity("item_1");
        item1.same_as = Some("item_2".into());
        let mut item2 = entity("item_2");
        item2.same_as = Some("item_1".into());
        intent.entity_references = vec![item1, item2];

        resolve_derived_actions(&mut intent);
        assert!(intent.entity_references[0].same_as.is_none());
        assert!(intent.entity_references[1].same_as.is_none());
        assert_eq!(intent.diagnostics.len(), 2);
        assert!(intent.diagnostics[0].contains("dropped"));
    }

    #[test]
    fn test_unknown_referent_dropped() {
        let mut intent = SemanticIntent::default();
        let mut item1 = entity("item_1");
        item1.same_as = Some("item_9".into());
        intent.entity_references = vec![item1];

        resolve_derived_actions(&mut intent);
        assert!(intent.entity_references[0].same_as.is_none());
        assert_eq!(intent.diagnostics.len(), 1);
    }

    #[test]
    fn test_existing_fields_not_overwritten() {
        let mut intent = SemanticIntent::default();
        let mut item1 = entity("item_1");
        item1.filter_width = Some(600);
        item1.airflow_m3h = Some(3000);
        let mut item2 = entity("item_2");
        item2.same_as = Some("item_1".into());
        item2.airflow_m3h = Some(5000);
        intent.entity_references = vec![item1, item2];

        resolve_derived_actions(&mut intent);
        // Its own airflow wins; only missing fields are copied
        assert_eq!(intent.entity_references[1].airflow_m3h, Some(5000));
        assert_eq!(intent.entity_references[1].filter_width, Some(600));
    }
}
