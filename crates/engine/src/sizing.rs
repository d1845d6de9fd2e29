//! Capacity math and module grid arrangement

use cpq_core::SizingArrangement;
use cpq_graph::{DimensionModuleRow, StrategyRow};

/// Modules needed to satisfy a requirement at a per-module rating
pub fn modules_needed(input_value: f64, output_rating: f64) -> i64 {
    if output_rating <= 0.0 {
        return 1;
    }
    (input_value / output_rating).ceil().max(1.0) as i64
}

/// Pick a horizontal × vertical grid of base modules that covers
/// `modules_needed` and honors the user's spatial constraints.
///
/// The arrangement minimizing the strategy's primary axis wins, then the
/// secondary axis. Returns `None` when no grid fits inside the constraints.
pub fn arrange_modules(
    module: &DimensionModuleRow,
    modules_needed: i64,
    strategy: Option<&StrategyRow>,
    max_width_mm: Option<i64>,
    max_height_mm: Option<i64>,
) -> Option<SizingArrangement> {
    if module.width_mm <= 0 || module.height_mm <= 0 || modules_needed < 1 {
        return None;
    }

    let max_horizontal = match max_width_mm {
        Some(max) => (max / module.width_mm).max(0),
        None => modules_needed,
    };
    let max_vertical = match max_height_mm {
        Some(max) => (max / module.height_mm).max(0),
        None => modules_needed,
    };
    if max_horizontal == 0 || max_vertical == 0 {
        return None;
    }

    let primary_is_width = strategy
        .and_then(|s| s.primary_axis.as_deref())
        .map(|axis| axis.eq_ignore_ascii_case("width"))
        .unwrap_or(true);

    // Minimize the primary axis count first, then the secondary.
    let mut chosen: Option<(i64, i64)> = None;
    if primary_is_width {
        for horizontal in 1..=max_horizontal {
            let vertical = div_ceil(modules_needed, horizontal);
            if vertical <= max_vertical {
                chosen = Some((horizontal, vertical));
                break;
            }
        }
    } else {
        for vertical in 1..=max_vertical {
            let horizontal = div_ceil(modules_needed, vertical);
            if horizontal <= max_horizontal {
                chosen = Some((horizontal, vertical));
                break;
            }
        }
    }
    let (horizontal, vertical) = chosen?;

    Some(SizingArrangement {
        selected_module_id: module.id.clone(),
        selected_module_label: module.label.clone(),
        selected_module_width: module.width_mm,
        selected_module_height: module.height_mm,
        reference_airflow_per_module: module.reference_airflow_m3h.unwrap_or(0),
        modules_needed,
        horizontal_count: horizontal,
        vertical_count: vertical,
        effective_width: horizontal * module.width_mm,
        effective_height: vertical * module.height_mm,
        max_width_mm,
        max_height_mm,
        width_constrained: max_width_mm.is_some(),
        height_constrained: max_height_mm.is_some(),
    })
}

fn div_ceil(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> DimensionModuleRow {
        DimensionModuleRow {
            id: "PV_600x600".into(),
            width_mm: 600,
            height_mm: 600,
            reference_airflow_m3h: Some(3400),
            label: "1/1 module".into(),
        }
    }

    #[test]
    fn test_modules_needed_ceiling() {
        assert_eq!(modules_needed(6000.0, 3400.0), 2);
        assert_eq!(modules_needed(3400.0, 3400.0), 1);
        assert_eq!(modules_needed(3401.0, 3400.0), 2);
        assert_eq!(modules_needed(500.0, 3400.0), 1);
    }

    #[test]
    fn test_unconstrained_arrangement_minimizes_primary_axis() {
        let a = arrange_modules(&module(), 2, None, None, None).unwrap();
        // Default primary axis is width: the narrowest grid covering 2 wins
        assert!(a.horizontal_count * a.vertical_count >= 2);
        assert_eq!(a.horizontal_count, 1);
        assert_eq!(a.vertical_count, 2);
    }

    #[test]
    fn test_width_constraint_forces_vertical_stack() {
        // 700 mm of width fits one 600 mm module per row
        let a = arrange_modules(&module(), 4, None, Some(700), None).unwrap();
        assert_eq!(a.horizontal_count, 1);
        assert_eq!(a.vertical_count, 4);
        assert_eq!(a.effective_width, 600);
        assert_eq!(a.effective_height, 2400);
        assert!(a.width_constrained);
    }

    #[test]
    fn test_height_constraint_bounds_vertical() {
        let a = arrange_modules(&module(), 4, None, None, Some(1300)).unwrap();
        // Only two rows fit; minimal width that still covers 4 modules is 2
        assert_eq!(a.vertical_count, 2);
        assert_eq!(a.horizontal_count, 2);
    }

    #[test]
    fn test_impossible_constraints_return_none() {
        assert!(arrange_modules(&module(), 2, None, Some(500), None).is_none());
        assert!(arrange_modules(&module(), 9, None, Some(1200), Some(1200)).is_none());
    }

    #[test]
    fn test_height_primary_axis() {
        let strategy = StrategyRow {
            id: "s".into(),
            name: "tall first".into(),
            sort_property: None,
            sort_order: None,
            primary_axis: Some("height".into()),
            secondary_axis: Some("width".into()),
            expansion_unit: None,
            description: None,
        };
        let a = arrange_modules(&module(), 4, Some(&strategy), Some(2400), Some(2400)).unwrap();
        // Minimizing the height first: one row of four
        assert_eq!(a.vertical_count, 1);
        assert_eq!(a.horizontal_count, 4);
    }
}
