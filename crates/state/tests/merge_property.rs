//! Randomized merge-order property
//!
//! The merge rule is load-bearing: a field, once set, is never replaced by
//! null, and the final state equals the union of non-null assignments up to
//! re-derivation, regardless of the order patches arrive in.

use std::sync::Arc;

use proptest::prelude::*;

use cpq_config::TenantConfig;
use cpq_core::TagPatch;
use cpq_state::TechnicalState;

fn tenant() -> Arc<TenantConfig> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../config/tenants/hvac_filtration/config.yaml");
    Arc::new(TenantConfig::load(&path).unwrap())
}

#[derive(Debug, Clone)]
struct Assignment {
    filter_width: i64,
    filter_height: i64,
    filter_depth: i64,
    airflow: i64,
    quantity: i64,
}

fn assignment_strategy() -> impl Strategy<Value = Assignment> {
    (
        prop_oneof![Just(287i64), Just(305), Just(495), Just(592), Just(610), 200..1200i64],
        prop_oneof![Just(287i64), Just(305), Just(495), Just(592), Just(610), 200..1200i64],
        100..700i64,
        500..20_000i64,
        1..10i64,
    )
        .prop_map(|(filter_width, filter_height, filter_depth, airflow, quantity)| Assignment {
            filter_width,
            filter_height,
            filter_depth,
            airflow,
            quantity,
        })
}

/// Split an assignment into single-field patches, one per field
fn patches_of(a: &Assignment) -> Vec<TagPatch> {
    vec![
        TagPatch {
            filter_width: Some(a.filter_width),
            ..Default::default()
        },
        TagPatch {
            filter_height: Some(a.filter_height),
            ..Default::default()
        },
        TagPatch {
            filter_depth: Some(a.filter_depth),
            ..Default::default()
        },
        TagPatch {
            airflow_m3h: Some(a.airflow),
            ..Default::default()
        },
        TagPatch {
            quantity: Some(a.quantity),
            ..Default::default()
        },
    ]
}

proptest! {
    #[test]
    fn merge_order_is_irrelevant_and_none_never_erases(
        a in assignment_strategy(),
        rot in 0usize..5,
        reverse in any::<bool>(),
        empty_positions in proptest::collection::vec(0usize..6, 0..4),
    ) {
        let cfg = tenant();
        let mut patches = patches_of(&a);
        patches.rotate_left(rot);
        if reverse {
            patches.reverse();
        }

        let mut state = TechnicalState::new(cfg.clone());
        for (i, patch) in patches.iter().enumerate() {
            state.merge_tag("item_1", patch.clone());
            // Interleave empty patches anywhere; they must never erase
            if empty_positions.contains(&i) {
                state.merge_tag("item_1", TagPatch::default());
            }
        }
        state.merge_tag("item_1", TagPatch::default());

        let tag = &state.tags["item_1"];

        // Orientation normalization may swap filter dims as a pair, so
        // compare as a set.
        let mut got = [tag.filter_width.unwrap(), tag.filter_height.unwrap()];
        let mut want = [a.filter_width, a.filter_height];
        got.sort_unstable();
        want.sort_unstable();
        prop_assert_eq!(got, want);
        prop_assert_eq!(tag.filter_depth, Some(a.filter_depth));
        prop_assert_eq!(tag.airflow_m3h, Some(a.airflow));
        prop_assert_eq!(tag.quantity, a.quantity);

        // Re-derivation: housing dims are the mapped filter dims up to the
        // orientation swap, and length follows the depth table.
        let mut housing = [tag.housing_width.unwrap(), tag.housing_height.unwrap()];
        let mut mapped = [
            cfg.map_dimension(a.filter_width),
            cfg.map_dimension(a.filter_height),
        ];
        housing.sort_unstable();
        mapped.sort_unstable();
        prop_assert_eq!(housing, mapped);
        let (hw, hh) = (tag.housing_width.unwrap(), tag.housing_height.unwrap());
        if hw <= cfg.orientation_threshold && hh <= cfg.orientation_threshold {
            prop_assert!(hh >= hw, "small modules keep the larger dim vertical");
        }
        prop_assert_eq!(
            tag.housing_length,
            Some(cfg.derive_housing_length(a.filter_depth, None))
        );

        // Completeness invariant: complete implies all housing dims present
        if tag.is_complete {
            prop_assert!(tag.housing_width.is_some());
            prop_assert!(tag.housing_height.is_some());
            prop_assert!(tag.housing_length.is_some());
        }
    }
}
