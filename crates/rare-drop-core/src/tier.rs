use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Rare item category, recognized by a `_<code>_RARE` codename fragment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Star,
    Moon,
    Sun,
}

impl Tier {
    pub const ALL: [Self; 3] = [Self::Star, Self::Moon, Self::Sun];

    /// Single-letter code used in codenames and group names.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Star => "A",
            Self::Moon => "B",
            Self::Sun => "C",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Star),
            "B" => Some(Self::Moon),
            "C" => Some(Self::Sun),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Star => "star",
            Self::Moon => "moon",
            Self::Sun => "sun",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "star" => Some(Self::Star),
            "moon" => Some(Self::Moon),
            "sun" => Some(Self::Sun),
            _ => None,
        }
    }

    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Star => "Seal of Star",
            Self::Moon => "Seal of Moon",
            Self::Sun => "Seal of Sun",
        }
    }

    /// Codename fragment that marks an item as belonging to this tier.
    #[must_use]
    pub fn codename_marker(self) -> String {
        format!("_{}_RARE", self.code())
    }

    /// `LIKE` pattern (with `\` as escape) that selects this tier's items.
    #[must_use]
    pub fn codename_like_pattern(self) -> String {
        format!("%\\_{}\\_RARE%", self.code())
    }

    /// Recognizes the tier of an item codename, if any.
    #[must_use]
    pub fn from_codename(codename: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| codename.contains(&tier.codename_marker()))
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic region derived from the catalog `Country` column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    China,
    Europe,
    Other(i64),
}

impl Region {
    #[must_use]
    pub fn from_country(country: i64) -> Self {
        match country {
            0 | 3 => Self::China,
            1 => Self::Europe,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn code(self) -> String {
        match self {
            Self::China => "CN".to_string(),
            Self::Europe => "EU".to_string(),
            Self::Other(country) => format!("R{country}"),
        }
    }

    /// Parses a canonical region code. `R0`, `R1` and `R3` are rejected
    /// because those countries always encode as `CN`/`EU`.
    #[must_use]
    pub fn parse_code(code: &str) -> Option<Self> {
        match code {
            "CN" => Some(Self::China),
            "EU" => Some(Self::Europe),
            _ => {
                let number = code.strip_prefix('R')?;
                let digits = number.strip_prefix('-').unwrap_or(number);
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                if digits.starts_with('0') && (digits.len() > 1 || digits.len() < number.len()) {
                    return None;
                }
                let country: i64 = number.parse().ok()?;
                match Self::from_country(country) {
                    Self::Other(value) => Some(Self::Other(value)),
                    _ => None,
                }
            }
        }
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_recognized_from_codename_marker() {
        assert_eq!(
            Tier::from_codename("ITEM_CH_SWORD_11_A_RARE"),
            Some(Tier::Star)
        );
        assert_eq!(Tier::from_codename("ITEM_EU_AXE_08_C_RARE"), Some(Tier::Sun));
        assert_eq!(Tier::from_codename("ITEM_CH_SWORD_11"), None);
        assert_eq!(Tier::from_codename("ITEM_A_RAREISH"), None);
    }

    #[test]
    fn region_codes_are_canonical() {
        assert_eq!(Region::from_country(0), Region::China);
        assert_eq!(Region::from_country(3), Region::China);
        assert_eq!(Region::from_country(1), Region::Europe);
        assert_eq!(Region::from_country(2).code(), "R2");

        assert_eq!(Region::parse_code("R2"), Some(Region::Other(2)));
        assert_eq!(Region::parse_code("R0"), None);
        assert_eq!(Region::parse_code("R3"), None);
        assert_eq!(Region::parse_code("R02"), None);
        assert_eq!(Region::parse_code("R"), None);
        assert_eq!(Region::parse_code("XX"), None);
    }

    #[test]
    fn wide_country_values_keep_their_code() {
        assert_eq!(Region::from_country(300).code(), "R300");
        assert_eq!(Region::from_country(-2).code(), "R-2");
        assert_eq!(Region::parse_code("R300"), Some(Region::Other(300)));
        assert_eq!(Region::parse_code("R-2"), Some(Region::Other(-2)));
        assert_eq!(Region::parse_code("R-0"), None);
        assert_eq!(Region::parse_code("R-"), None);
    }

    #[test]
    fn like_pattern_escapes_underscores() {
        assert_eq!(Tier::Moon.codename_like_pattern(), "%\\_B\\_RARE%");
    }
}
