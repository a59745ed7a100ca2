use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tier::Tier;
use crate::DropError;

/// Degraded probabilities never fall below this share of the base value.
pub const PROBABILITY_FLOOR_RATIO: f64 = 0.01;

pub const DEFAULT_LEVEL_DISTANCE: u32 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One group per (actor, tier).
    #[default]
    Owner,
    /// One group per (tier, level); read-compatibility only.
    Legacy,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Legacy => "legacy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegionMode {
    #[default]
    Mixed,
    Separated,
}

impl RegionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mixed => "mixed",
            Self::Separated => "separated",
        }
    }
}

/// Level-based probability reduction for actors above `threshold_level`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DegradationRule {
    pub threshold_level: u32,
    pub factor: f64,
}

impl DegradationRule {
    /// Effective probability for an actor at `level`.
    ///
    /// The factor compounds once per level above the threshold and the
    /// result is floored at [`PROBABILITY_FLOOR_RATIO`] of `base`.
    #[must_use]
    pub fn apply(&self, base: f64, level: u32) -> f64 {
        if level <= self.threshold_level {
            return base;
        }
        let steps = i32::try_from(level - self.threshold_level).unwrap_or(i32::MAX);
        let degraded = base * self.factor.powi(steps);
        degraded.max(base * PROBABILITY_FLOOR_RATIO)
    }

    /// # Errors
    /// Returns [`DropError::Validation`] when the factor is outside `(0, 1)`.
    pub fn validate(&self) -> Result<(), DropError> {
        if !self.factor.is_finite() || self.factor <= 0.0 || self.factor >= 1.0 {
            return Err(DropError::Validation(format!(
                "degradation factor must be in (0, 1), got {}",
                self.factor
            )));
        }
        Ok(())
    }
}

/// Resolved drop configuration handed to the planner at call time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DropConfig {
    pub enabled_tiers: BTreeSet<Tier>,
    pub probability_per_tier: BTreeMap<Tier, f64>,
    pub level_distance: u32,
    #[serde(default)]
    pub degradation: Option<DegradationRule>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub region_mode: RegionMode,
}

impl Default for DropConfig {
    fn default() -> Self {
        Self {
            enabled_tiers: Tier::ALL.into_iter().collect(),
            probability_per_tier: Self::default_probabilities(),
            level_distance: DEFAULT_LEVEL_DISTANCE,
            degradation: None,
            strategy: Strategy::Owner,
            region_mode: RegionMode::Mixed,
        }
    }
}

impl DropConfig {
    #[must_use]
    pub fn default_probabilities() -> BTreeMap<Tier, f64> {
        BTreeMap::from([(Tier::Star, 0.01), (Tier::Moon, 0.005), (Tier::Sun, 0.001)])
    }

    /// Decodes and validates a JSON configuration document.
    ///
    /// # Errors
    /// Returns [`DropError::Validation`] for malformed or out-of-range input.
    pub fn from_json(value: &Value) -> Result<Self, DropError> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| DropError::Validation(format!("invalid drop configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`DropError::Validation`] when any enabled tier lacks a
    /// probability in `(0, 1]` or the degradation rule is invalid.
    pub fn validate(&self) -> Result<(), DropError> {
        for tier in &self.enabled_tiers {
            let Some(probability) = self.probability_per_tier.get(tier).copied() else {
                return Err(DropError::Validation(format!(
                    "enabled tier {tier} has no configured probability"
                )));
            };
            if !probability.is_finite() || probability <= 0.0 || probability > 1.0 {
                return Err(DropError::Validation(format!(
                    "probability for tier {tier} must be in (0, 1], got {probability}"
                )));
            }
        }
        if let Some(rule) = &self.degradation {
            rule.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_enabled(&self, tier: Tier) -> bool {
        self.enabled_tiers.contains(&tier)
    }

    /// Enabled tiers in fixed planning order.
    #[must_use]
    pub fn planned_tiers(&self) -> Vec<Tier> {
        Tier::ALL
            .into_iter()
            .filter(|tier| self.is_enabled(*tier))
            .collect()
    }

    /// Configured probability for an enabled tier after degradation.
    #[must_use]
    pub fn effective_probability(&self, tier: Tier, actor_level: u32) -> Option<f64> {
        if !self.is_enabled(tier) {
            return None;
        }
        let base = self.probability_per_tier.get(&tier).copied()?;
        Some(match &self.degradation {
            Some(rule) => rule.apply(base, actor_level),
            None => base,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-12
    }

    #[test]
    fn degradation_compounds_and_floors() {
        let rule = DegradationRule {
            threshold_level: 100,
            factor: 0.5,
        };

        assert!(approx(rule.apply(0.01, 90), 0.01));
        assert!(approx(rule.apply(0.01, 100), 0.01));
        assert!(approx(rule.apply(0.01, 101), 0.005));
        assert!(approx(rule.apply(0.01, 102), 0.0025));
        assert!(approx(rule.apply(0.01, 130), 0.0001));
    }

    #[test]
    fn from_json_accepts_minimal_document() {
        let config = match DropConfig::from_json(&json!({
            "enabled_tiers": ["star", "sun"],
            "probability_per_tier": {"star": 0.02, "sun": 0.001},
            "level_distance": 5
        })) {
            Ok(value) => value,
            Err(err) => panic!("expected config to decode: {err}"),
        };

        assert_eq!(config.planned_tiers(), vec![Tier::Star, Tier::Sun]);
        assert_eq!(config.strategy, Strategy::Owner);
        assert_eq!(config.region_mode, RegionMode::Mixed);
        assert!(config.degradation.is_none());
        assert_eq!(config.effective_probability(Tier::Moon, 50), None);
    }

    #[test]
    fn from_json_rejects_out_of_range_values() {
        let cases = [
            json!({
                "enabled_tiers": ["star"],
                "probability_per_tier": {"star": 0.0},
                "level_distance": 10
            }),
            json!({
                "enabled_tiers": ["star"],
                "probability_per_tier": {"star": 1.5},
                "level_distance": 10
            }),
            json!({
                "enabled_tiers": ["moon"],
                "probability_per_tier": {"star": 0.5},
                "level_distance": 10
            }),
            json!({
                "enabled_tiers": ["star"],
                "probability_per_tier": {"star": 0.5},
                "level_distance": -1
            }),
            json!({
                "enabled_tiers": ["star"],
                "probability_per_tier": {"star": 0.5},
                "level_distance": 10,
                "degradation": {"threshold_level": 50, "factor": 1.0}
            }),
        ];

        for case in cases {
            match DropConfig::from_json(&case) {
                Err(DropError::Validation(_)) => {}
                other => panic!("expected validation error for {case}, got {other:?}"),
            }
        }
    }

    #[test]
    fn disabled_tier_probability_is_not_validated() {
        let mut config = DropConfig::default();
        config.enabled_tiers.remove(&Tier::Sun);
        config.probability_per_tier.insert(Tier::Sun, 7.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_enabled_set_is_valid() {
        let config = DropConfig {
            enabled_tiers: BTreeSet::new(),
            ..DropConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.planned_tiers().is_empty());
    }
}
