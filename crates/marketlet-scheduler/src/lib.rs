//! Offer selection for marketlet.
//!
//! Ranking is a pure function of the offers returned by a marketplace search,
//! a [`SchedulerConfig`] and a set of [`ScoringWeights`]. Offers that fail a
//! hard constraint (GPU, price ceiling, reliability, memory, bandwidth,
//! blocked region, verification) are dropped; the rest are scored as the sum
//! of a price, reliability, GPU, geography, bandwidth and verification term.
//!
//! # Example
//!
//! ```
//! use marketlet_scheduler::{select_best_instance, SchedulerConfig, ScoringWeights};
//!
//! let config = SchedulerConfig {
//!     gpu_type: "RTX 4090".to_string(),
//!     max_price: 0.40,
//!     preferred_regions: vec!["US-CA".to_string()],
//!     ..SchedulerConfig::default()
//! };
//! let offers = Vec::new();
//! assert!(select_best_instance(&offers, &config, &ScoringWeights::default()).is_err());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod geo;
pub mod gpu;
pub mod score;

pub use config::{SchedulerConfig, ScoringWeights};
pub use error::{Result, ScheduleError};
pub use geo::{region_tier, Region, RegionTier};
pub use gpu::{gpu_match, GpuMatch};
pub use score::{eligible, rank_offers, score_offer, select_best_instance, InstanceScore};
