use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::DropError;

/// Maximum bound parameters per statement on the reference target store.
pub const DEFAULT_PARAMETER_CEILING: usize = 2100;

/// Per-statement parameter budget of the target store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchLimits {
    pub parameter_ceiling: usize,
    /// Parameters held back from the ceiling.
    pub safety_margin: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            parameter_ceiling: DEFAULT_PARAMETER_CEILING,
            safety_margin: 0,
        }
    }
}

impl BatchLimits {
    #[must_use]
    pub fn usable_parameters(&self) -> usize {
        self.parameter_ceiling.saturating_sub(self.safety_margin)
    }
}

/// Largest row count whose bound parameters fit in one statement.
///
/// # Errors
/// Returns [`DropError::Configuration`] when not even a single row fits.
pub fn rows_per_batch(columns_per_row: usize, limits: &BatchLimits) -> Result<usize, DropError> {
    if columns_per_row == 0 {
        return Err(DropError::Configuration(
            "columns per row must be positive".to_string(),
        ));
    }
    let rows = limits.usable_parameters() / columns_per_row;
    if rows == 0 {
        return Err(DropError::Configuration(format!(
            "parameter ceiling {} (margin {}) cannot fit one row of {columns_per_row} columns",
            limits.parameter_ceiling, limits.safety_margin
        )));
    }
    Ok(rows)
}

/// Splits `total` rows into consecutive ranges of at most `rows_per_batch`.
#[must_use]
pub fn chunk_ranges(total: usize, rows_per_batch: usize) -> Vec<Range<usize>> {
    if rows_per_batch == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(rows_per_batch)
        .map(|start| start..(start + rows_per_batch).min(total))
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn must_rows(columns: usize, limits: &BatchLimits) -> usize {
        match rows_per_batch(columns, limits) {
            Ok(value) => value,
            Err(err) => panic!("expected rows per batch: {err}"),
        }
    }

    #[test]
    fn reference_ceiling_row_counts() {
        let limits = BatchLimits::default();
        assert_eq!(must_rows(6, &limits), 350);
        assert_eq!(must_rows(10, &limits), 210);
    }

    #[test]
    fn margin_is_subtracted_before_division() {
        let limits = BatchLimits {
            parameter_ceiling: 2100,
            safety_margin: 100,
        };
        assert_eq!(must_rows(10, &limits), 200);
    }

    #[test]
    fn too_small_ceiling_is_a_configuration_error() {
        let limits = BatchLimits {
            parameter_ceiling: 9,
            safety_margin: 0,
        };
        assert!(matches!(
            rows_per_batch(10, &limits),
            Err(DropError::Configuration(_))
        ));
        assert!(rows_per_batch(0, &limits).is_err());
    }

    #[test]
    fn chunk_ranges_cover_total_in_order() {
        assert_eq!(chunk_ranges(7, 3), vec![0..3, 3..6, 6..7]);
        assert!(chunk_ranges(0, 3).is_empty());
    }

    proptest! {
        #[test]
        fn every_chunk_respects_the_ceiling(
            ceiling in 1_usize..5000,
            margin in 0_usize..200,
            columns in 1_usize..16,
            total in 0_usize..5000,
        ) {
            let limits = BatchLimits { parameter_ceiling: ceiling, safety_margin: margin };
            if let Ok(rows) = rows_per_batch(columns, &limits) {
                let ranges = chunk_ranges(total, rows);
                let mut covered = 0;
                for range in &ranges {
                    prop_assert!(range.len() * columns <= ceiling.saturating_sub(margin));
                    prop_assert_eq!(range.start, covered);
                    covered = range.end;
                }
                prop_assert_eq!(covered, total);
            }
        }
    }
}
