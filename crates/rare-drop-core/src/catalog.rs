use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tier::{Region, Tier};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RareItem {
    pub id: i64,
    pub codename: String,
    pub tier: Tier,
    pub required_level: u32,
    pub region: Region,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Actor {
    pub id: i64,
    pub codename: String,
    pub level: u32,
    pub region: Region,
}

/// Read-only planning universe, loaded fresh for every run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Catalog {
    pub items: BTreeMap<Tier, Vec<RareItem>>,
    pub actors: Vec<Actor>,
}

impl Catalog {
    /// Builds a catalog, partitioning items by tier and sorting every
    /// collection so planning does not depend on read order.
    #[must_use]
    pub fn new(items: Vec<RareItem>, mut actors: Vec<Actor>) -> Self {
        let mut partitioned: BTreeMap<Tier, Vec<RareItem>> = BTreeMap::new();
        for item in items {
            partitioned.entry(item.tier).or_default().push(item);
        }
        for bucket in partitioned.values_mut() {
            bucket.sort_by(|left, right| {
                left.required_level
                    .cmp(&right.required_level)
                    .then(left.id.cmp(&right.id))
            });
        }
        actors.sort_by_key(|actor| actor.id);
        Self {
            items: partitioned,
            actors,
        }
    }

    /// Items of `tier`, ordered by required level then id.
    #[must_use]
    pub fn items_of(&self, tier: Tier) -> &[RareItem] {
        self.items.get(&tier).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }
}
