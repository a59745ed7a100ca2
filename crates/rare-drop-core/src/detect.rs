//! Inference rules for recovering a previously applied configuration.
//!
//! The store adapter gathers [`DetectionEvidence`] from live rows; everything
//! here is pure so the heuristics can be tested without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::{DropConfig, RegionMode, Strategy};
use crate::naming::{GroupName, NamingScheme};
use crate::tier::Tier;

/// Upper bound on groups inspected when recovering the distance.
pub const DEFAULT_DETECTION_SAMPLE: usize = 50;

/// Most frequent value; ties go to the smallest.
#[must_use]
pub fn mode_of(values: &[u32]) -> Option<u32> {
    let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(*value).or_default() += 1;
    }
    let mut best: Option<(u32, usize)> = None;
    for (value, count) in counts {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((value, count)),
        }
    }
    best.map(|(value, _)| value)
}

/// Probability carried by the most rows, compared by exact value; ties go to
/// the smallest.
#[must_use]
pub fn probability_mode(values: &[(f64, u64)]) -> Option<f64> {
    let mut counts: HashMap<u64, u64> = HashMap::new();
    for (value, rows) in values {
        *counts.entry(value.to_bits()).or_default() += rows;
    }
    counts
        .into_iter()
        .map(|(bits, count)| (f64::from_bits(bits), count))
        .max_by(|(left, left_count), (right, right_count)| {
            left_count
                .cmp(right_count)
                .then_with(|| right.total_cmp(left))
        })
        .map(|(value, _)| value)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DetectionConfidence {
    /// Every sampled value agreed.
    Consistent,
    /// Values disagreed; modes were reported.
    Mixed,
    /// Part of the configuration could not be recovered; defaults substituted.
    Inconclusive,
}

impl DetectionConfidence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consistent => "consistent",
            Self::Mixed => "mixed",
            Self::Inconclusive => "inconclusive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedConfig {
    pub config: DropConfig,
    pub scheme: NamingScheme,
    pub confidence: DetectionConfidence,
    pub managed_groups: usize,
    pub distance_samples: usize,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectionReport {
    NotDetected,
    Detected(DetectedConfig),
}

/// One distinct (group, probability) pair and how many assignment rows carry it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservedAssignment {
    pub name: GroupName,
    pub probability: f64,
    pub rows: u64,
}

/// Raw observations gathered from the assignment table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionEvidence {
    pub assignments: Vec<ObservedAssignment>,
    /// Managed-prefix names that did not parse under either scheme.
    pub unparsed_names: usize,
    /// Per-group maximum absolute level deviation for the sampled groups.
    pub deviations: Vec<u32>,
}

impl DetectionEvidence {
    /// Distinct group names by scheme, in name order.
    #[must_use]
    pub fn names(&self) -> BTreeSet<GroupName> {
        self.assignments.iter().map(|observed| observed.name).collect()
    }

    /// Scheme shared by most distinct names; ties favour the owner scheme.
    #[must_use]
    pub fn dominant_scheme(&self) -> Option<NamingScheme> {
        let names = self.names();
        if names.is_empty() {
            return None;
        }
        let owner = names
            .iter()
            .filter(|name| name.scheme() == NamingScheme::OwnerBucket)
            .count();
        if owner * 2 >= names.len() {
            Some(NamingScheme::OwnerBucket)
        } else {
            Some(NamingScheme::LegacyLevelBucket)
        }
    }

    /// Turns observations into a report, substituting defaults where needed.
    #[must_use]
    pub fn conclude(&self) -> DetectionReport {
        let Some(scheme) = self.dominant_scheme() else {
            return DetectionReport::NotDetected;
        };
        let names = self.names();
        let defaults = DropConfig::default();
        let mut notes = Vec::new();
        let mut confidence = DetectionConfidence::Consistent;

        let mut by_tier: BTreeMap<Tier, Vec<(f64, u64)>> = BTreeMap::new();
        for observed in &self.assignments {
            by_tier
                .entry(observed.name.tier())
                .or_default()
                .push((observed.probability, observed.rows));
        }
        let mut probability_per_tier = defaults.probability_per_tier.clone();
        for (tier, values) in &by_tier {
            let Some(mode) = probability_mode(values) else {
                continue;
            };
            if values
                .iter()
                .any(|(value, _)| value.to_bits() != mode.to_bits())
            {
                confidence = DetectionConfidence::Mixed;
                notes.push(format!(
                    "tier {tier} has non-uniform probabilities; reporting the mode {mode}"
                ));
            }
            probability_per_tier.insert(*tier, mode);
        }

        if names.iter().any(|name| name.scheme() != scheme) {
            confidence = DetectionConfidence::Mixed;
            notes.push("both naming schemes are present".to_string());
        }
        if self.unparsed_names > 0 {
            confidence = DetectionConfidence::Mixed;
            notes.push(format!(
                "{} managed group names did not parse",
                self.unparsed_names
            ));
        }

        let level_distance = match mode_of(&self.deviations) {
            Some(distance) => {
                if self.deviations.iter().any(|value| *value != distance) {
                    confidence = DetectionConfidence::Mixed;
                    notes.push(format!(
                        "sampled level deviations disagree; reporting the mode {distance}"
                    ));
                }
                distance
            }
            None => {
                confidence = DetectionConfidence::Inconclusive;
                notes.push(format!(
                    "no level deviation could be sampled; using default distance {}",
                    defaults.level_distance
                ));
                defaults.level_distance
            }
        };

        let region_mode = if names.iter().any(|name| name.region().is_some()) {
            RegionMode::Separated
        } else {
            RegionMode::Mixed
        };
        let strategy = match scheme {
            NamingScheme::OwnerBucket => Strategy::Owner,
            NamingScheme::LegacyLevelBucket => Strategy::Legacy,
        };

        DetectionReport::Detected(DetectedConfig {
            config: DropConfig {
                enabled_tiers: by_tier.keys().copied().collect(),
                probability_per_tier,
                level_distance,
                degradation: None,
                strategy,
                region_mode,
            },
            scheme,
            confidence,
            managed_groups: names.len(),
            distance_samples: self.deviations.len(),
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::tier::Region;

    fn owner(tier: Tier, owner_id: i64) -> GroupName {
        GroupName::OwnerBucket {
            tier,
            owner_id,
            region: None,
        }
    }

    fn observed(name: GroupName, probability: f64, rows: u64) -> ObservedAssignment {
        ObservedAssignment {
            name,
            probability,
            rows,
        }
    }

    fn legacy(tier: Tier, level: u32, region: Option<Region>) -> GroupName {
        GroupName::LegacyLevelBucket {
            tier,
            level,
            region,
        }
    }

    fn must_detected(report: DetectionReport) -> DetectedConfig {
        match report {
            DetectionReport::Detected(value) => value,
            DetectionReport::NotDetected => panic!("expected a detected configuration"),
        }
    }

    #[test]
    fn mode_prefers_most_frequent_then_smallest() {
        assert_eq!(mode_of(&[10, 10, 9, 11]), Some(10));
        assert_eq!(mode_of(&[12, 8]), Some(8));
        assert_eq!(mode_of(&[]), None);
        assert_eq!(probability_mode(&[(0.5, 1), (0.01, 2)]), Some(0.01));
        assert_eq!(probability_mode(&[(0.2, 1), (0.1, 1)]), Some(0.1));
        assert_eq!(probability_mode(&[(0.2, 1), (0.1, 1), (0.2, 1)]), Some(0.2));
    }

    #[test]
    fn empty_evidence_reports_not_detected() {
        assert_eq!(
            DetectionEvidence::default().conclude(),
            DetectionReport::NotDetected
        );
    }

    #[test]
    fn uniform_owner_evidence_is_consistent() {
        let evidence = DetectionEvidence {
            assignments: vec![
                observed(owner(Tier::Star, 1), 0.01, 1),
                observed(owner(Tier::Star, 2), 0.01, 1),
                observed(owner(Tier::Sun, 1), 0.001, 1),
            ],
            unparsed_names: 0,
            deviations: vec![10, 10, 10],
        };

        let detected = must_detected(evidence.conclude());
        assert_eq!(detected.confidence, DetectionConfidence::Consistent);
        assert_eq!(detected.scheme, NamingScheme::OwnerBucket);
        assert_eq!(detected.config.level_distance, 10);
        assert_eq!(detected.config.planned_tiers(), vec![Tier::Star, Tier::Sun]);
        assert_eq!(detected.config.region_mode, RegionMode::Mixed);
        assert_eq!(detected.managed_groups, 3);
    }

    #[test]
    fn missing_deviations_fall_back_to_default_distance() {
        let evidence = DetectionEvidence {
            assignments: vec![observed(owner(Tier::Moon, 4), 0.2, 1)],
            unparsed_names: 0,
            deviations: Vec::new(),
        };

        let detected = must_detected(evidence.conclude());
        assert_eq!(detected.confidence, DetectionConfidence::Inconclusive);
        assert_eq!(detected.config.level_distance, 10);
        assert_eq!(detected.notes.len(), 1);
    }

    #[test]
    fn region_suffix_and_mixed_probabilities_are_reported() {
        let evidence = DetectionEvidence {
            assignments: vec![
                observed(legacy(Tier::Star, 40, Some(Region::Europe)), 0.01, 1),
                observed(legacy(Tier::Star, 50, Some(Region::China)), 0.02, 1),
                observed(legacy(Tier::Star, 60, Some(Region::China)), 0.02, 1),
            ],
            unparsed_names: 0,
            deviations: vec![5, 5],
        };

        let detected = must_detected(evidence.conclude());
        assert_eq!(detected.scheme, NamingScheme::LegacyLevelBucket);
        assert_eq!(detected.config.strategy, Strategy::Legacy);
        assert_eq!(detected.config.region_mode, RegionMode::Separated);
        assert_eq!(detected.confidence, DetectionConfidence::Mixed);
        assert_eq!(detected.config.probability_per_tier[&Tier::Star], 0.02);
    }

    #[test]
    fn probability_mode_is_weighted_by_assignment_rows() {
        let evidence = DetectionEvidence {
            assignments: vec![
                observed(legacy(Tier::Star, 50, None), 0.01, 20),
                observed(legacy(Tier::Star, 60, None), 0.02, 1),
                observed(legacy(Tier::Star, 70, None), 0.02, 1),
            ],
            unparsed_names: 0,
            deviations: vec![10],
        };

        let detected = must_detected(evidence.conclude());
        assert_eq!(detected.config.probability_per_tier[&Tier::Star], 0.01);
        assert_eq!(detected.confidence, DetectionConfidence::Mixed);
    }

    #[test]
    fn report_serializes_with_status_tag() {
        let value = match serde_json::to_value(DetectionReport::NotDetected) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(value, serde_json::json!({"status": "not_detected"}));
    }
}
