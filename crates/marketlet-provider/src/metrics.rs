//! Prometheus metrics for the provider.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{ProviderError, Result};

/// Counters, gauges and histograms exported on `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Instances successfully created.
    pub launches: IntCounter,
    /// Launches lost to another renter.
    pub offer_races: IntCounter,
    /// Terminate calls issued.
    pub terminations: IntCounter,
    /// Instances that turned unhealthy.
    pub health_failures: IntCounter,
    /// Creates rejected at the capacity ceiling.
    pub capacity_rejections: IntCounter,
    /// Pods moved to Failed.
    pub pod_failures: IntCounter,
    /// Instances currently held by pods.
    pub active_instances: IntGauge,
    /// Seconds from scheduling to Running.
    pub provisioning_seconds: Histogram,
}

impl Metrics {
    /// Create the metric set on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns `Metrics` if a metric cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace("marketlet"))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let launches = counter("instance_launches_total", "Instances created on the marketplace")?;
        let offer_races = counter("offer_races_total", "Launches that lost the offer to another renter")?;
        let terminations = counter("instance_terminations_total", "Terminate calls issued")?;
        let health_failures = counter("health_failures_total", "Instances that failed their readiness probe")?;
        let capacity_rejections = counter("capacity_rejections_total", "Pods rejected at the instance ceiling")?;
        let pod_failures = counter("pod_failures_total", "Pods moved to Failed")?;

        let active_instances = IntGauge::with_opts(
            Opts::new("active_instances", "Instances currently held by pods").namespace("marketlet"),
        )?;
        registry.register(Box::new(active_instances.clone()))?;

        let provisioning_seconds = Histogram::with_opts(
            HistogramOpts::new("provisioning_seconds", "Time from scheduling to Running")
                .namespace("marketlet")
                .buckets(vec![15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 900.0, 1800.0]),
        )?;
        registry.register(Box::new(provisioning_seconds.clone()))?;

        Ok(Self {
            registry,
            launches,
            offer_races,
            terminations,
            health_failures,
            capacity_rejections,
            pod_failures,
            active_instances,
            provisioning_seconds,
        })
    }

    /// Render every metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns `Metrics` if encoding fails.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ProviderError::Config(format!("metrics are not utf-8: {e}")))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("active_instances", &self.active_instances.get())
            .finish_non_exhaustive()
    }
}
