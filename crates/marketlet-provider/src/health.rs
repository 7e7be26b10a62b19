//! Readiness polling of running instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HealthSettings;
use crate::error::{ProviderError, Result};
use crate::lifecycle::InstanceEndpoint;

/// A single readiness check against an instance.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Whether the instance answered successfully.
    async fn check(&self, endpoint: &InstanceEndpoint) -> bool;
}

/// `GET http://{address}:{port}{path}`, healthy on any 2xx.
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    /// Build a probe from the health settings.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the HTTP client cannot be built.
    pub fn new(settings: &HealthSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create health client: {e}")))?;
        let path = if settings.path.starts_with('/') {
            settings.path.clone()
        } else {
            format!("/{}", settings.path)
        };
        Ok(Self { client, path })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, endpoint: &InstanceEndpoint) -> bool {
        let url = format!("http://{}:{}{}", endpoint.address, endpoint.port, self.path);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(%url, status = %resp.status(), "Probe returned non-success status");
                false
            }
            Err(e) => {
                debug!(%url, error = %e, "Probe request failed");
                false
            }
        }
    }
}

/// Change in an instance's readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    /// First passing probe, or recovery after `Unhealthy`.
    Healthy,
    /// The threshold of consecutive failures was reached.
    Unhealthy {
        /// Consecutive failures observed.
        failures: u32,
    },
}

/// Turns probe results into [`HealthEvent`]s.
///
/// Failures only count once the instance has passed a probe; before that
/// the provisioning deadline bounds how long the provider waits.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    healthy: bool,
    failures: u32,
}

impl HealthTracker {
    /// Tracker reporting `Unhealthy` after `threshold` failures.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            healthy: false,
            failures: 0,
        }
    }

    /// Feed one probe result.
    pub fn record(&mut self, ok: bool) -> Option<HealthEvent> {
        if ok {
            self.failures = 0;
            if self.healthy {
                return None;
            }
            self.healthy = true;
            return Some(HealthEvent::Healthy);
        }

        if !self.healthy {
            return None;
        }
        self.failures += 1;
        if self.failures < self.threshold {
            return None;
        }
        self.healthy = false;
        Some(HealthEvent::Unhealthy {
            failures: self.failures,
        })
    }
}

/// Background task probing one instance.
pub struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start probing `endpoint`. Events arrive on the returned receiver.
    ///
    /// The task stops when `cancel` (or its parent) is cancelled, when
    /// [`HealthMonitor::stop`] is called, or when the receiver is dropped.
    #[must_use]
    pub fn spawn(
        probe: Arc<dyn Probe>,
        endpoint: InstanceEndpoint,
        settings: &HealthSettings,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<HealthEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let period = settings.interval.max(Duration::from_millis(10));
        let timeout = settings.timeout;
        let mut tracker = HealthTracker::new(settings.failure_threshold);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let ok = tokio::time::timeout(timeout, probe.check(&endpoint))
                    .await
                    .unwrap_or(false);
                if let Some(event) = tracker.record(ok) {
                    if let HealthEvent::Unhealthy { failures } = event {
                        warn!(endpoint = %endpoint, failures, "Instance failed readiness probe");
                    }
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        (Self { cancel, handle }, rx)
    }

    /// Stop probing and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Health monitor task failed");
        }
    }
}

/// Probe with a switchable result for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::Probe;
    use crate::lifecycle::InstanceEndpoint;

    /// Answers every check with the current switch position.
    #[derive(Debug)]
    pub struct MockProbe {
        healthy: AtomicBool,
        checks: AtomicUsize,
    }

    impl MockProbe {
        /// Create a probe starting healthy or not.
        #[must_use]
        pub const fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                checks: AtomicUsize::new(0),
            }
        }

        /// Flip the result of later checks.
        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        /// Checks performed so far.
        #[must_use]
        pub fn checks(&self) -> usize {
            self.checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Probe for MockProbe {
        async fn check(&self, _endpoint: &InstanceEndpoint) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }
}
