//! Region parsing and geographic preference tiers.
//!
//! Marketplace geolocations come in a few shapes: `US-CA`, `US`, or
//! `California, US`. All of them parse into a [`Region`] made of a country
//! code and an optional sub-region.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{SchedulerConfig, ScoringWeights};

/// A country with an optional sub-region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    country: String,
    subregion: Option<String>,
}

impl Region {
    /// Parse a geolocation string. Returns `None` for empty input.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let (country, subregion) = if let Some((place, country)) = input.rsplit_once(',') {
            (country, Some(place))
        } else if let Some((country, sub)) = input.split_once('-') {
            (country, Some(sub))
        } else {
            (input, None)
        };

        let country = country.trim().to_ascii_uppercase();
        if country.is_empty() {
            return None;
        }
        let subregion = subregion
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty());

        Some(Self { country, subregion })
    }

    /// Country code.
    #[must_use]
    pub fn country(&self) -> &str {
        &self.country
    }

    /// Sub-region, if any.
    #[must_use]
    pub fn subregion(&self) -> Option<&str> {
        self.subregion.as_deref()
    }

    /// Whether `other` lies inside this region.
    ///
    /// A country-level region contains all of its sub-regions.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.country == other.country
            && match (&self.subregion, &other.subregion) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subregion {
            Some(sub) => write!(f, "{}-{sub}", self.country),
            None => write!(f, "{}", self.country),
        }
    }
}

/// Land or short-haul neighbours, by country code.
const NEIGHBORS: &[(&str, &str)] = &[
    ("US", "CA"),
    ("US", "MX"),
    ("DE", "FR"),
    ("DE", "NL"),
    ("DE", "BE"),
    ("DE", "AT"),
    ("DE", "CH"),
    ("DE", "PL"),
    ("DE", "CZ"),
    ("DE", "DK"),
    ("DE", "LU"),
    ("FR", "BE"),
    ("FR", "ES"),
    ("FR", "IT"),
    ("FR", "CH"),
    ("FR", "LU"),
    ("FR", "GB"),
    ("GB", "IE"),
    ("NL", "BE"),
    ("ES", "PT"),
    ("IT", "CH"),
    ("IT", "AT"),
    ("AT", "CH"),
    ("AT", "CZ"),
    ("PL", "CZ"),
    ("SE", "NO"),
    ("SE", "FI"),
    ("SE", "DK"),
    ("NO", "FI"),
    ("EE", "FI"),
    ("JP", "KR"),
    ("SG", "MY"),
    ("AU", "NZ"),
];

/// Whether two countries are neighbours.
#[must_use]
pub fn are_neighbors(a: &str, b: &str) -> bool {
    NEIGHBORS
        .iter()
        .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
}

/// How well an offer's location fits the configured preferences, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegionTier {
    /// Inside a preferred region.
    Exact,
    /// Same country as a preferred region.
    Country,
    /// Neighbouring country of a preferred region.
    Neighbor,
    /// Inside a fallback region.
    Fallback,
    /// None of the above.
    Outside,
    /// No preferred regions are configured.
    Unscored,
}

impl RegionTier {
    /// Geography term for this tier.
    #[must_use]
    pub fn weight(self, weights: &ScoringWeights) -> f64 {
        match self {
            Self::Exact => weights.region_exact,
            Self::Country => weights.region_country,
            Self::Neighbor => weights.region_neighbor,
            Self::Fallback => weights.region_fallback,
            Self::Outside => weights.region_outside_penalty,
            Self::Unscored => 0.0,
        }
    }
}

fn parse_all(regions: &[String]) -> impl Iterator<Item = Region> + '_ {
    regions.iter().filter_map(|r| Region::parse(r))
}

/// Classify an offer geolocation against the preferred and fallback regions.
#[must_use]
pub fn region_tier(geolocation: &str, config: &SchedulerConfig) -> RegionTier {
    if parse_all(&config.preferred_regions).next().is_none() {
        return RegionTier::Unscored;
    }
    let Some(offer) = Region::parse(geolocation) else {
        return RegionTier::Outside;
    };

    let best = parse_all(&config.preferred_regions)
        .filter_map(|pref| {
            if pref.contains(&offer) {
                Some(RegionTier::Exact)
            } else if pref.country == offer.country {
                Some(RegionTier::Country)
            } else if are_neighbors(&pref.country, &offer.country) {
                Some(RegionTier::Neighbor)
            } else {
                None
            }
        })
        .min();

    best.unwrap_or_else(|| {
        if parse_all(&config.fallback_regions).any(|f| f.contains(&offer)) {
            RegionTier::Fallback
        } else {
            RegionTier::Outside
        }
    })
}

/// Whether an offer geolocation falls in a blocked region.
#[must_use]
pub fn is_blocked(geolocation: &str, config: &SchedulerConfig) -> bool {
    Region::parse(geolocation)
        .is_some_and(|offer| parse_all(&config.blocked_regions).any(|b| b.contains(&offer)))
}
