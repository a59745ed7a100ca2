use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DropConfig;
use crate::tier::Tier;

const PREVIEW_STEP: u32 = 10;
const PREVIEW_FIRST_LEVEL: u32 = 10;
const PREVIEW_END_LEVEL: u32 = 150;

/// Effective probability of every enabled tier at one actor level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateRow {
    pub level: u32,
    pub probabilities: BTreeMap<Tier, f64>,
}

/// Preview of effective probabilities by actor level.
///
/// Without a degradation rule the table covers levels 10 to 140 in steps of
/// 10. With a rule it starts at the threshold and steps by 10 below 150,
/// always including the threshold itself.
#[must_use]
pub fn probability_table(config: &DropConfig) -> Vec<RateRow> {
    let levels: Vec<u32> = match &config.degradation {
        None => (PREVIEW_FIRST_LEVEL..PREVIEW_END_LEVEL)
            .step_by(PREVIEW_STEP as usize)
            .collect(),
        Some(rule) => {
            let mut levels: Vec<u32> = (rule.threshold_level..PREVIEW_END_LEVEL)
                .step_by(PREVIEW_STEP as usize)
                .collect();
            if levels.is_empty() {
                levels.push(rule.threshold_level);
            }
            levels
        }
    };

    levels
        .into_iter()
        .map(|level| RateRow {
            level,
            probabilities: config
                .planned_tiers()
                .into_iter()
                .filter_map(|tier| {
                    config
                        .effective_probability(tier, level)
                        .map(|probability| (tier, probability))
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DegradationRule;

    #[test]
    fn flat_table_spans_ten_to_one_forty() {
        let rows = probability_table(&DropConfig::default());
        let levels: Vec<u32> = rows.iter().map(|row| row.level).collect();
        assert_eq!(levels, (1..=14).map(|step| step * 10).collect::<Vec<_>>());
        assert!(rows
            .iter()
            .all(|row| (row.probabilities[&Tier::Moon] - 0.005).abs() < f64::EPSILON));
    }

    #[test]
    fn degraded_table_starts_at_threshold() {
        let config = DropConfig {
            degradation: Some(DegradationRule {
                threshold_level: 95,
                factor: 0.9,
            }),
            ..DropConfig::default()
        };
        let rows = probability_table(&config);

        let levels: Vec<u32> = rows.iter().map(|row| row.level).collect();
        assert_eq!(levels, vec![95, 105, 115, 125, 135, 145]);
        assert!((rows[0].probabilities[&Tier::Star] - 0.01).abs() < 1e-12);
        assert!((rows[1].probabilities[&Tier::Star] - 0.01 * 0.9_f64.powi(10)).abs() < 1e-12);
    }

    #[test]
    fn threshold_beyond_preview_range_is_still_listed() {
        let config = DropConfig {
            degradation: Some(DegradationRule {
                threshold_level: 200,
                factor: 0.5,
            }),
            ..DropConfig::default()
        };
        let levels: Vec<u32> = probability_table(&config).iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![200]);
    }
}
