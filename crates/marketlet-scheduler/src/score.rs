//! Eligibility, scoring and ranking of offers.

use marketlet_market::Offer;
use tracing::debug;

use crate::config::{SchedulerConfig, ScoringWeights};
use crate::error::{Result, ScheduleError};
use crate::geo::{is_blocked, region_tier};
use crate::gpu::gpu_match;

/// An offer with its score and the reasons behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceScore {
    /// The scored offer.
    pub offer: Offer,
    /// Total score; higher is better.
    pub score: f64,
    /// One short note per contributing term.
    pub notes: Vec<String>,
}

/// Why an offer fails the hard constraints, or `None` if it is eligible.
#[must_use]
pub fn ineligibility(offer: &Offer, config: &SchedulerConfig) -> Option<&'static str> {
    if !gpu_match(&offer.gpu_name, config).is_accepted() {
        Some("gpu not accepted")
    } else if offer.num_gpus < config.min_num_gpus {
        Some("too few gpus")
    } else if offer.price_per_hour.is_nan() || offer.price_per_hour > config.max_price {
        Some("above price ceiling")
    } else if offer.reliability.is_nan() || offer.reliability < config.min_reliability {
        Some("below reliability minimum")
    } else if offer.gpu_memory_gb.is_nan() || offer.gpu_memory_gb < config.min_gpu_memory_gb {
        Some("not enough gpu memory")
    } else if offer.inet_down_mbps.is_nan()
        || offer.inet_up_mbps.is_nan()
        || offer.inet_down_mbps < config.min_inet_down_mbps
        || offer.inet_up_mbps < config.min_inet_up_mbps
    {
        Some("below bandwidth floor")
    } else if is_blocked(&offer.geolocation, config) {
        Some("blocked region")
    } else if config.verified_only && !offer.verified {
        Some("host not verified")
    } else {
        None
    }
}

/// Whether an offer passes every hard constraint.
#[must_use]
pub fn eligible(offer: &Offer, config: &SchedulerConfig) -> bool {
    ineligibility(offer, config).is_none()
}

/// Score an offer. Eligibility is not checked here.
#[must_use]
pub fn score_offer(offer: &Offer, config: &SchedulerConfig, weights: &ScoringWeights) -> InstanceScore {
    let mut notes = Vec::new();

    let price = if config.max_price > 0.0 {
        ((config.max_price - offer.price_per_hour) / config.max_price).max(0.0) * weights.price
    } else {
        0.0
    };
    notes.push(format!("price {:.2}/h: {price:+.3}", offer.price_per_hour));

    let reliability = offer.reliability * weights.reliability;
    notes.push(format!("reliability {:.3}: {reliability:+.3}", offer.reliability));

    let gpu_kind = gpu_match(&offer.gpu_name, config);
    let gpu = gpu_kind.weight(weights);
    notes.push(format!("gpu {} ({gpu_kind:?}): {gpu:+.3}", offer.gpu_name));

    let tier = region_tier(&offer.geolocation, config);
    let geography = tier.weight(weights);
    notes.push(format!("region {} ({tier:?}): {geography:+.3}", offer.geolocation));

    let bandwidth = if offer.inet_down_mbps > config.bandwidth_bonus_mbps {
        notes.push(format!("bandwidth {:.0} Mbps: {:+.3}", offer.inet_down_mbps, weights.bandwidth));
        weights.bandwidth
    } else {
        0.0
    };

    let mut verification = 0.0;
    if offer.verified {
        verification += weights.verified;
        notes.push(format!("verified: {:+.3}", weights.verified));
    }
    if offer.host_uptime_hours < config.min_host_uptime_hours {
        verification += weights.immature_host_penalty;
        notes.push(format!(
            "host listed {:.0}h: {:+.3}",
            offer.host_uptime_hours, weights.immature_host_penalty
        ));
    }

    InstanceScore {
        offer: offer.clone(),
        score: price + reliability + gpu + geography + bandwidth + verification,
        notes,
    }
}

/// Filter and rank offers, best first.
///
/// The sort is stable, so equal scores keep their input order.
///
/// # Errors
///
/// Returns `NoMatchingOffers` if no offer is eligible, or `InvalidConfig`
/// if the configuration fails validation.
pub fn rank_offers(
    offers: &[Offer],
    config: &SchedulerConfig,
    weights: &ScoringWeights,
) -> Result<Vec<InstanceScore>> {
    config.validate()?;

    let mut ranked: Vec<InstanceScore> = offers
        .iter()
        .filter(|offer| match ineligibility(offer, config) {
            None => true,
            Some(reason) => {
                debug!(offer_id = %offer.id, reason, "offer filtered");
                false
            }
        })
        .map(|offer| score_offer(offer, config, weights))
        .collect();

    if ranked.is_empty() {
        return Err(ScheduleError::NoMatchingOffers {
            considered: offers.len(),
        });
    }

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(ranked)
}

/// The best eligible offer.
///
/// # Errors
///
/// Same as [`rank_offers`].
pub fn select_best_instance(
    offers: &[Offer],
    config: &SchedulerConfig,
    weights: &ScoringWeights,
) -> Result<InstanceScore> {
    let mut ranked = rank_offers(offers, config, weights)?;
    let best = ranked.swap_remove(0);
    debug!(offer_id = %best.offer.id, score = best.score, "selected offer");
    Ok(best)
}
