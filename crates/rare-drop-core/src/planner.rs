//! Group Planner: pure mapping from (catalog, configuration) to a plan.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{Actor, Catalog, RareItem};
use crate::config::{DropConfig, RegionMode, Strategy};
use crate::naming::GroupName;
use crate::tier::{Region, Tier};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DropGroup {
    pub name: GroupName,
    pub member_item_ids: Vec<i64>,
    /// Relative weight shared by every member.
    pub member_select_weight: f64,
}

impl DropGroup {
    fn from_members(name: GroupName, member_item_ids: Vec<i64>) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let member_select_weight = 1.0 / member_item_ids.len() as f64;
        Self {
            name,
            member_item_ids,
            member_select_weight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub actor_id: i64,
    pub group: GroupName,
    pub drop_probability: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub groups: Vec<DropGroup>,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TierSummary {
    pub tier: Option<Tier>,
    pub groups: usize,
    pub member_rows: usize,
    pub assignments: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlanSummary {
    pub per_tier: Vec<TierSummary>,
    pub groups: usize,
    pub member_rows: usize,
    pub assignments: usize,
}

impl Plan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.assignments.is_empty()
    }

    /// Number of group-definition rows, one per member.
    #[must_use]
    pub fn member_row_count(&self) -> usize {
        self.groups.iter().map(|group| group.member_item_ids.len()).sum()
    }

    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut per_tier: BTreeMap<Tier, TierSummary> = BTreeMap::new();
        for group in &self.groups {
            let entry = per_tier.entry(group.name.tier()).or_default();
            entry.groups += 1;
            entry.member_rows += group.member_item_ids.len();
        }
        for assignment in &self.assignments {
            per_tier.entry(assignment.group.tier()).or_default().assignments += 1;
        }

        PlanSummary {
            per_tier: per_tier
                .into_iter()
                .map(|(tier, mut summary)| {
                    summary.tier = Some(tier);
                    summary
                })
                .collect(),
            groups: self.groups.len(),
            member_rows: self.member_row_count(),
            assignments: self.assignments.len(),
        }
    }
}

/// Computes the plan for `config` over `catalog`.
///
/// The result is deterministic: actors are visited by ascending id, tiers in
/// [`Tier::ALL`] order, and members are ordered by required level then id.
/// An empty set of enabled tiers yields an empty plan.
#[must_use]
pub fn plan_drops(catalog: &Catalog, config: &DropConfig) -> Plan {
    match config.strategy {
        Strategy::Owner => plan_by_owner(catalog, config),
        Strategy::Legacy => plan_by_level(catalog, config),
    }
}

fn plan_by_owner(catalog: &Catalog, config: &DropConfig) -> Plan {
    let tiers = config.planned_tiers();
    let mut plan = Plan::default();

    for actor in &catalog.actors {
        for tier in &tiers {
            let Some(probability) = config.effective_probability(*tier, actor.level) else {
                continue;
            };
            let members: Vec<i64> = items_in_window(
                catalog.items_of(*tier),
                actor.level,
                config.level_distance,
            )
            .iter()
            .filter(|item| region_matches(config.region_mode, item.region, actor.region))
            .map(|item| item.id)
            .collect();
            if members.is_empty() {
                continue;
            }

            let name = GroupName::OwnerBucket {
                tier: *tier,
                owner_id: actor.id,
                region: region_suffix(config.region_mode, actor.region),
            };
            plan.groups.push(DropGroup::from_members(name, members));
            plan.assignments.push(Assignment {
                actor_id: actor.id,
                group: name,
                drop_probability: probability,
            });
        }
    }

    plan
}

fn plan_by_level(catalog: &Catalog, config: &DropConfig) -> Plan {
    let mut plan = Plan::default();

    for tier in config.planned_tiers() {
        let mut buckets: BTreeMap<(u32, Option<Region>), Vec<i64>> = BTreeMap::new();
        for item in catalog.items_of(tier) {
            let region = region_suffix(config.region_mode, item.region);
            buckets
                .entry((item.required_level, region))
                .or_default()
                .push(item.id);
        }

        for ((level, region), members) in buckets {
            let name = GroupName::LegacyLevelBucket {
                tier,
                level,
                region,
            };
            let mut assigned = false;
            for actor in eligible_actors(&catalog.actors, level, config, region) {
                let Some(probability) = config.effective_probability(tier, actor.level) else {
                    continue;
                };
                plan.assignments.push(Assignment {
                    actor_id: actor.id,
                    group: name,
                    drop_probability: probability,
                });
                assigned = true;
            }
            if assigned {
                plan.groups.push(DropGroup::from_members(name, members));
            }
        }
    }

    plan
}

fn eligible_actors<'a>(
    actors: &'a [Actor],
    level: u32,
    config: &'a DropConfig,
    region: Option<Region>,
) -> impl Iterator<Item = &'a Actor> + 'a {
    actors.iter().filter(move |actor| {
        let same_region = match region {
            Some(wanted) => wanted == actor.region,
            None => true,
        };
        same_region && actor.level.abs_diff(level) <= config.level_distance
    })
}

/// Items whose required level is within `distance` of `level`; `items` must be
/// sorted by required level.
fn items_in_window(items: &[RareItem], level: u32, distance: u32) -> &[RareItem] {
    let low = level.saturating_sub(distance);
    let high = level.saturating_add(distance);
    let start = items.partition_point(|item| item.required_level < low);
    let end = items.partition_point(|item| item.required_level <= high);
    &items[start..end.max(start)]
}

fn region_matches(mode: RegionMode, item: Region, actor: Region) -> bool {
    match mode {
        RegionMode::Mixed => true,
        RegionMode::Separated => item == actor,
    }
}

fn region_suffix(mode: RegionMode, region: Region) -> Option<Region> {
    match mode {
        RegionMode::Mixed => None,
        RegionMode::Separated => Some(region),
    }
}
