//! GPU model matching.

use crate::config::{SchedulerConfig, ScoringWeights};

/// How an offer's GPU relates to the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMatch {
    /// The requested model.
    Exact,
    /// Another model of the same family, e.g. `RTX 4080` for `RTX 4090`.
    Family,
    /// A listed fallback from a different family.
    Fallback,
    /// Not acceptable.
    None,
}

impl GpuMatch {
    /// Whether the offer may be used at all.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        !matches!(self, Self::None)
    }

    /// GPU term for this match.
    #[must_use]
    pub fn weight(self, weights: &ScoringWeights) -> f64 {
        match self {
            Self::Exact => weights.gpu + weights.gpu_exact_bonus,
            Self::Family => 0.7 * weights.gpu,
            Self::Fallback | Self::None => 0.0,
        }
    }
}

/// Canonical spelling: upper case, single spaces, `_` treated as a space.
#[must_use]
pub fn normalize(name: &str) -> String {
    name.replace('_', " ")
        .split_whitespace()
        .map(str::to_ascii_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Family of a GPU model.
///
/// `RTX 4090` and `RTX 4080` are both `RTX 40`; `A100 SXM4` and `A100 PCIE`
/// are both `A100`.
#[must_use]
pub fn family(name: &str) -> String {
    let normalized = normalize(name);
    let mut tokens = normalized.split(' ');
    let first = tokens.next().unwrap_or_default();
    match tokens.next() {
        Some(second) if first.chars().all(|c| c.is_ascii_alphabetic()) => {
            let generation: String = second.chars().take(2).collect();
            format!("{first} {generation}")
        }
        _ => first.to_string(),
    }
}

/// Classify an offer's GPU against the requested model and fallbacks.
#[must_use]
pub fn gpu_match(offer_gpu: &str, config: &SchedulerConfig) -> GpuMatch {
    let offered = normalize(offer_gpu);
    if offered.is_empty() {
        return GpuMatch::None;
    }
    if offered == normalize(&config.gpu_type) {
        return GpuMatch::Exact;
    }
    if family(&offered) == family(&config.gpu_type) {
        return GpuMatch::Family;
    }
    if config.gpu_fallbacks.iter().any(|f| normalize(f) == offered) {
        return GpuMatch::Fallback;
    }
    GpuMatch::None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(gpu: &str, fallbacks: &[&str]) -> SchedulerConfig {
        SchedulerConfig {
            gpu_type: gpu.to_string(),
            gpu_fallbacks: fallbacks.iter().map(|s| (*s).to_string()).collect(),
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize("rtx_4090"), "RTX 4090");
        assert_eq!(normalize("  RTX   4090 "), "RTX 4090");
    }

    #[test]
    fn families() {
        assert_eq!(family("RTX 4090"), "RTX 40");
        assert_eq!(family("RTX_4080"), "RTX 40");
        assert_eq!(family("RTX 3090"), "RTX 30");
        assert_eq!(family("A100 SXM4"), "A100");
        assert_eq!(family("A100 PCIE"), "A100");
        assert_eq!(family("H100"), "H100");
    }

    #[test]
    fn match_kinds() {
        let config = config("RTX 4090", &["A6000"]);
        assert_eq!(gpu_match("rtx_4090", &config), GpuMatch::Exact);
        assert_eq!(gpu_match("RTX 4080", &config), GpuMatch::Family);
        assert_eq!(gpu_match("A6000", &config), GpuMatch::Fallback);
        assert_eq!(gpu_match("RTX 3090", &config), GpuMatch::None);
        assert_eq!(gpu_match("", &config), GpuMatch::None);
    }

    #[test]
    fn same_family_fallback_scores_as_family() {
        let config = config("RTX 4090", &["RTX 4080"]);
        let weights = ScoringWeights::default();
        let m = gpu_match("RTX 4080", &config);
        assert_eq!(m, GpuMatch::Family);
        assert!((m.weight(&weights) - 0.7).abs() < 1e-9);
        assert!((GpuMatch::Exact.weight(&weights) - 1.5).abs() < 1e-9);
        assert!(GpuMatch::Fallback.weight(&weights).abs() < 1e-9);
    }
}
