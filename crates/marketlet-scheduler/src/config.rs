//! Scheduling constraints and scoring weights.

use marketlet_market::SearchCriteria;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScheduleError};

/// Constraints and preferences for one scheduling decision.
///
/// Built from operator defaults plus pod annotation overrides, then passed
/// by reference to every scoring call of that decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Requested GPU model.
    pub gpu_type: String,
    /// Acceptable alternatives, most preferred first.
    pub gpu_fallbacks: Vec<String>,
    /// Minimum number of GPUs.
    pub min_num_gpus: u32,
    /// Price ceiling in USD per hour.
    pub max_price: f64,
    /// Minimum host reliability (0 to 1).
    pub min_reliability: f64,
    /// Minimum memory per GPU in gigabytes.
    pub min_gpu_memory_gb: f64,
    /// Minimum downstream bandwidth in Mbps.
    pub min_inet_down_mbps: f64,
    /// Minimum upstream bandwidth in Mbps.
    pub min_inet_up_mbps: f64,
    /// Downstream bandwidth above which an offer earns the bandwidth bonus.
    pub bandwidth_bonus_mbps: f64,
    /// Preferred regions, e.g. `US-CA` or `DE`.
    pub preferred_regions: Vec<String>,
    /// Acceptable regions that earn a small bonus.
    pub fallback_regions: Vec<String>,
    /// Regions that are never used.
    pub blocked_regions: Vec<String>,
    /// Only consider verified hosts.
    pub verified_only: bool,
    /// Hosts listed for less than this many hours are penalised.
    pub min_host_uptime_hours: f64,
    /// Restrict the marketplace search itself to preferred and fallback countries.
    pub restrict_search_to_regions: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            gpu_type: "RTX 4090".to_string(),
            gpu_fallbacks: Vec::new(),
            min_num_gpus: 1,
            max_price: 1.0,
            min_reliability: 0.95,
            min_gpu_memory_gb: 0.0,
            min_inet_down_mbps: 100.0,
            min_inet_up_mbps: 50.0,
            bandwidth_bonus_mbps: 500.0,
            preferred_regions: Vec::new(),
            fallback_regions: Vec::new(),
            blocked_regions: Vec::new(),
            verified_only: false,
            min_host_uptime_hours: 72.0,
            restrict_search_to_regions: false,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for values that cannot produce a decision.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty GPU type, a non-finite or negative
    /// price ceiling, or a reliability outside `0..=1`.
    pub fn validate(&self) -> Result<()> {
        if self.gpu_type.trim().is_empty() {
            return Err(ScheduleError::InvalidConfig("gpu_type is empty".to_string()));
        }
        if !self.max_price.is_finite() || self.max_price < 0.0 {
            return Err(ScheduleError::InvalidConfig(format!(
                "max_price must be a non-negative number, got {}",
                self.max_price
            )));
        }
        if !(0.0..=1.0).contains(&self.min_reliability) {
            return Err(ScheduleError::InvalidConfig(format!(
                "min_reliability must be within 0..=1, got {}",
                self.min_reliability
            )));
        }
        Ok(())
    }

    /// GPU models to search for: the requested type followed by its fallbacks.
    #[must_use]
    pub fn accepted_gpus(&self) -> Vec<String> {
        let mut gpus = vec![self.gpu_type.clone()];
        for fallback in &self.gpu_fallbacks {
            if !gpus.iter().any(|g| g.eq_ignore_ascii_case(fallback)) {
                gpus.push(fallback.clone());
            }
        }
        gpus
    }

    /// Marketplace filters equivalent to the hard constraints.
    #[must_use]
    pub fn search_criteria(&self) -> SearchCriteria {
        let regions = if self.restrict_search_to_regions {
            self.preferred_regions
                .iter()
                .chain(&self.fallback_regions)
                .filter_map(|r| crate::geo::Region::parse(r))
                .map(|r| r.country().to_string())
                .fold(Vec::new(), |mut acc, c| {
                    if !acc.contains(&c) {
                        acc.push(c);
                    }
                    acc
                })
        } else {
            Vec::new()
        };

        SearchCriteria {
            gpu_names: self.accepted_gpus(),
            min_num_gpus: self.min_num_gpus,
            min_gpu_memory_gb: (self.min_gpu_memory_gb > 0.0).then_some(self.min_gpu_memory_gb),
            max_price_per_hour: Some(self.max_price),
            min_reliability: (self.min_reliability > 0.0).then_some(self.min_reliability),
            min_inet_down_mbps: (self.min_inet_down_mbps > 0.0).then_some(self.min_inet_down_mbps),
            min_inet_up_mbps: (self.min_inet_up_mbps > 0.0).then_some(self.min_inet_up_mbps),
            regions,
            verified_only: self.verified_only,
            rentable_only: true,
        }
    }
}

/// Coefficients of each scoring term.
///
/// | weight                   | default |
/// |--------------------------|---------|
/// | `price`                  | 1.0     |
/// | `reliability`            | 1.0     |
/// | `gpu`                    | 1.0     |
/// | `gpu_exact_bonus`        | 0.5     |
/// | `region_exact`           | 1.0     |
/// | `region_country`         | 0.6     |
/// | `region_neighbor`        | 0.3     |
/// | `region_fallback`        | 0.1     |
/// | `region_outside_penalty` | -0.5    |
/// | `bandwidth`              | 0.2     |
/// | `verified`               | 0.2     |
/// | `immature_host_penalty`  | -0.3    |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Weight of the normalised price saving.
    pub price: f64,
    /// Weight of host reliability.
    pub reliability: f64,
    /// Credit for an accepted GPU.
    pub gpu: f64,
    /// Extra credit for the exact requested GPU.
    pub gpu_exact_bonus: f64,
    /// Offer inside a preferred region.
    pub region_exact: f64,
    /// Offer in the country of a preferred region.
    pub region_country: f64,
    /// Offer in a country neighbouring a preferred region.
    pub region_neighbor: f64,
    /// Offer in a fallback region.
    pub region_fallback: f64,
    /// Offer anywhere else (negative).
    pub region_outside_penalty: f64,
    /// Bonus for bandwidth above the bonus floor.
    pub bandwidth: f64,
    /// Bonus for verified hosts.
    pub verified: f64,
    /// Penalty for hosts below the maturity threshold (negative).
    pub immature_host_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            price: 1.0,
            reliability: 1.0,
            gpu: 1.0,
            gpu_exact_bonus: 0.5,
            region_exact: 1.0,
            region_country: 0.6,
            region_neighbor: 0.3,
            region_fallback: 0.1,
            region_outside_penalty: -0.5,
            bandwidth: 0.2,
            verified: 0.2,
            immature_host_penalty: -0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_configs() {
        let mut config = SchedulerConfig {
            gpu_type: " ".to_string(),
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());

        config.gpu_type = "A100".to_string();
        config.max_price = f64::NAN;
        assert!(config.validate().is_err());

        config.max_price = 0.5;
        config.min_reliability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepted_gpus_dedupes_in_order() {
        let config = SchedulerConfig {
            gpu_type: "RTX 4090".to_string(),
            gpu_fallbacks: vec![
                "RTX 3090".to_string(),
                "rtx 4090".to_string(),
                "A6000".to_string(),
            ],
            ..SchedulerConfig::default()
        };
        assert_eq!(config.accepted_gpus(), vec!["RTX 4090", "RTX 3090", "A6000"]);
    }

    #[test]
    fn search_criteria_regions_only_when_restricted() {
        let mut config = SchedulerConfig {
            preferred_regions: vec!["US-CA".to_string(), "US-TX".to_string()],
            fallback_regions: vec!["CA".to_string()],
            max_price: 0.4,
            ..SchedulerConfig::default()
        };
        assert!(config.search_criteria().regions.is_empty());

        config.restrict_search_to_regions = true;
        let criteria = config.search_criteria();
        assert_eq!(criteria.regions, vec!["US", "CA"]);
        assert_eq!(criteria.max_price_per_hour, Some(0.4));
    }

    #[test]
    fn weights_deserialize_partially() {
        let weights: ScoringWeights = serde_json::from_str(r#"{"price": 2.0}"#).unwrap();
        assert!((weights.price - 2.0).abs() < f64::EPSILON);
        assert_eq!(weights.gpu_exact_bonus, ScoringWeights::default().gpu_exact_bonus);
    }
}
