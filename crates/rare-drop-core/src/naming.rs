//! Group naming scheme shared by the planner, the writer and the detector.
//!
//! Two schemes coexist in live data:
//! - legacy level buckets: `RARE_<tier>_LVL_<level>[_<region>]`
//! - owner buckets: `RARE_<tier>_MOB_<actorId>[_<region>]`
//!
//! [`GroupName::parse`] accepts both and is the exact inverse of `Display`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::tier::{Region, Tier};
use crate::DropError;

pub const GROUP_PREFIX: &str = "RARE";
const LEVEL_KIND: &str = "LVL";
const OWNER_KIND: &str = "MOB";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NamingScheme {
    LegacyLevelBucket,
    OwnerBucket,
}

impl NamingScheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LegacyLevelBucket => "legacy_level_bucket",
            Self::OwnerBucket => "owner_bucket",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GroupName {
    LegacyLevelBucket {
        tier: Tier,
        level: u32,
        region: Option<Region>,
    },
    OwnerBucket {
        tier: Tier,
        owner_id: i64,
        region: Option<Region>,
    },
}

impl GroupName {
    #[must_use]
    pub fn tier(&self) -> Tier {
        match self {
            Self::LegacyLevelBucket { tier, .. } | Self::OwnerBucket { tier, .. } => *tier,
        }
    }

    #[must_use]
    pub fn region(&self) -> Option<Region> {
        match self {
            Self::LegacyLevelBucket { region, .. } | Self::OwnerBucket { region, .. } => *region,
        }
    }

    #[must_use]
    pub fn scheme(&self) -> NamingScheme {
        match self {
            Self::LegacyLevelBucket { .. } => NamingScheme::LegacyLevelBucket,
            Self::OwnerBucket { .. } => NamingScheme::OwnerBucket,
        }
    }

    /// Parses either scheme. Returns `None` for anything that is not a
    /// canonical encoding.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split('_');
        if parts.next()? != GROUP_PREFIX {
            return None;
        }
        let tier = Tier::from_code(parts.next()?)?;
        let kind = parts.next()?;
        let key = parts.next()?;
        let region = match parts.next() {
            Some(code) => Some(Region::parse_code(code)?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }

        let parsed = match kind {
            LEVEL_KIND => Self::LegacyLevelBucket {
                tier,
                level: parse_canonical_u32(key)?,
                region,
            },
            OWNER_KIND => Self::OwnerBucket {
                tier,
                owner_id: parse_canonical_i64(key)?,
                region,
            },
            _ => return None,
        };
        Some(parsed)
    }

    /// Strict variant of [`GroupName::parse`] for callers that need a reason.
    ///
    /// # Errors
    /// Returns [`DropError::Naming`] when the name is not a managed group name.
    pub fn parse_strict(raw: &str) -> Result<Self, DropError> {
        Self::parse(raw).ok_or_else(|| {
            DropError::Naming(format!("not a managed rare drop group name: {raw}"))
        })
    }

    /// True for any name under the reserved prefix, parseable or not.
    #[must_use]
    pub fn is_managed(raw: &str) -> bool {
        raw.starts_with(GROUP_PREFIX) && raw[GROUP_PREFIX.len()..].starts_with('_')
    }

    /// `LIKE` pattern (with `\` as escape) selecting every managed name.
    #[must_use]
    pub fn managed_like_pattern() -> String {
        format!("{GROUP_PREFIX}\\_%")
    }
}

impl Display for GroupName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LegacyLevelBucket { tier, level, .. } => {
                write!(f, "{GROUP_PREFIX}_{}_{LEVEL_KIND}_{level}", tier.code())?;
            }
            Self::OwnerBucket { tier, owner_id, .. } => {
                write!(f, "{GROUP_PREFIX}_{}_{OWNER_KIND}_{owner_id}", tier.code())?;
            }
        }
        if let Some(region) = self.region() {
            write!(f, "_{}", region.code())?;
        }
        Ok(())
    }
}

impl Serialize for GroupName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid group name: {raw}")))
    }
}

fn parse_canonical_u32(raw: &str) -> Option<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if raw.len() > 1 && raw.starts_with('0') {
        return None;
    }
    raw.parse().ok()
}

fn parse_canonical_i64(raw: &str) -> Option<i64> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if raw.starts_with('-') && digits == "0" {
        return None;
    }
    raw.parse().ok()
}
