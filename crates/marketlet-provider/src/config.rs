//! Provider configuration.

use std::time::Duration;

use marketlet_market::MarketplaceConfig;
use marketlet_scheduler::{SchedulerConfig, ScoringWeights};

use crate::error::{ProviderError, Result};

/// Readiness probe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    /// Path probed on the instance.
    pub path: String,
    /// Time between probes.
    pub interval: Duration,
    /// Per-probe timeout.
    pub timeout: Duration,
    /// Consecutive failures after a success before the instance is unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Settings that shape how pods are provisioned on the virtual node.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Name of the virtual node.
    pub node_name: String,
    /// Maximum simultaneously active instances.
    pub max_active_instances: usize,
    /// Upper bound on the time from scheduling to Running.
    pub provision_timeout: Duration,
    /// Distinct offers tried per scheduling round.
    pub launch_attempts: u32,
    /// Backoff before the first launch retry.
    pub launch_backoff_base: Duration,
    /// Backoff cap between launch retries.
    pub launch_backoff_max: Duration,
    /// Interval between instance status polls while waiting for an address.
    pub instance_poll_interval: Duration,
    /// Replacements allowed after a running instance turns unhealthy.
    pub max_relaunches: u32,
    /// Readiness probe.
    pub health: HealthSettings,
    /// Attempts for an optimistic Endpoints update.
    pub endpoint_retries: u32,
    /// Scheduling constraints applied before annotation overrides.
    pub defaults: SchedulerConfig,
    /// Scoring weights.
    pub weights: ScoringWeights,
    /// Disk size for pods without a `disk-gb` annotation.
    pub default_disk_gb: u32,
    /// Container port used when the pod declares none.
    pub default_port: u16,
    /// Interval of the background reconciliation sweep.
    pub reconcile_interval: Duration,
    /// Interval of the node Ready heartbeat.
    pub heartbeat_interval: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            node_name: "marketlet".to_string(),
            max_active_instances: 8,
            provision_timeout: Duration::from_secs(900),
            launch_attempts: 3,
            launch_backoff_base: Duration::from_secs(2),
            launch_backoff_max: Duration::from_secs(30),
            instance_poll_interval: Duration::from_secs(5),
            max_relaunches: 2,
            health: HealthSettings::default(),
            endpoint_retries: 5,
            defaults: SchedulerConfig::default(),
            weights: ScoringWeights::default(),
            default_disk_gb: 40,
            default_port: 8080,
            reconcile_interval: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl ProviderSettings {
    /// Backoff before launch attempt `attempt` (0-based, first retry is 1).
    #[must_use]
    pub fn launch_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.launch_backoff_base
            .saturating_mul(factor)
            .min(self.launch_backoff_max)
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Address of the operator HTTP server.
    pub listen_addr: String,
    /// Marketplace client settings.
    pub marketplace: MarketplaceConfig,
    /// Provisioning settings.
    pub provider: ProviderSettings,
}

impl ProviderConfig {
    /// Load configuration from environment variables.
    ///
    /// The marketplace credential is read from `MARKETPLACE_API_KEY`, or from
    /// the file named by `MARKETPLACE_API_KEY_FILE` (a mounted secret).
    ///
    /// # Errors
    ///
    /// Returns `Config` if the credential is missing or the key file cannot
    /// be read, or if `SCORING_WEIGHTS` or `SCHEDULER_DEFAULTS` is not valid JSON.
    pub fn from_env() -> Result<Self> {
        let api_key = match std::env::var("MARKETPLACE_API_KEY") {
            Ok(key) => key,
            Err(_) => {
                let path = std::env::var("MARKETPLACE_API_KEY_FILE").map_err(|_| {
                    ProviderError::Config(
                        "MARKETPLACE_API_KEY or MARKETPLACE_API_KEY_FILE must be set".to_string(),
                    )
                })?;
                std::fs::read_to_string(&path)
                    .map_err(|e| ProviderError::Config(format!("reading {path}: {e}")))?
                    .trim()
                    .to_string()
            }
        };

        let base_url = std::env::var("MARKETPLACE_URL")
            .unwrap_or_else(|_| "https://console.vast.ai/api/v0".to_string());
        let mut marketplace = MarketplaceConfig::new(base_url, api_key);
        if let Some(n) = parse_env("MARKETPLACE_REQUESTS_PER_MINUTE") {
            marketplace.requests_per_minute = n;
        }
        if let Some(n) = parse_env("MARKETPLACE_BURST") {
            marketplace.burst = n;
        }
        if let Some(secs) = parse_env("MARKETPLACE_TIMEOUT_SECS") {
            marketplace.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("MARKETPLACE_MAX_RATE_WAIT_SECS") {
            marketplace.max_rate_wait = Duration::from_secs(secs);
        }

        let mut provider = ProviderSettings::default();
        if let Ok(val) = std::env::var("NODE_NAME") {
            provider.node_name = val;
        }
        if let Some(n) = parse_env("MAX_ACTIVE_INSTANCES") {
            provider.max_active_instances = n;
        }
        if let Some(secs) = parse_env("PROVISION_TIMEOUT_SECS") {
            provider.provision_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env("LAUNCH_ATTEMPTS") {
            provider.launch_attempts = n;
        }
        if let Some(n) = parse_env("MAX_RELAUNCHES") {
            provider.max_relaunches = n;
        }
        if let Ok(val) = std::env::var("HEALTH_PATH") {
            provider.health.path = val;
        }
        if let Some(secs) = parse_env("HEALTH_INTERVAL_SECS") {
            provider.health.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("HEALTH_TIMEOUT_SECS") {
            provider.health.timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_env("HEALTH_FAILURE_THRESHOLD") {
            provider.health.failure_threshold = n;
        }
        if let Some(n) = parse_env("DEFAULT_DISK_GB") {
            provider.default_disk_gb = n;
        }
        if let Some(secs) = parse_env("RECONCILE_INTERVAL_SECS") {
            provider.reconcile_interval = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("SCHEDULER_DEFAULTS") {
            provider.defaults = serde_json::from_str(&val)
                .map_err(|e| ProviderError::Config(format!("SCHEDULER_DEFAULTS: {e}")))?;
        }
        if let Ok(val) = std::env::var("DEFAULT_GPU_TYPE") {
            provider.defaults.gpu_type = val;
        }
        if let Some(price) = parse_env("DEFAULT_MAX_PRICE") {
            provider.defaults.max_price = price;
        }
        if let Ok(val) = std::env::var("DEFAULT_REGIONS") {
            provider.defaults.preferred_regions = split_list(&val);
        }
        if let Ok(val) = std::env::var("SCORING_WEIGHTS") {
            provider.weights = serde_json::from_str(&val)
                .map_err(|e| ProviderError::Config(format!("SCORING_WEIGHTS: {e}")))?;
        }

        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            marketplace,
            provider,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Split a comma-separated list, dropping empty items.
pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
