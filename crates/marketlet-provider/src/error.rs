//! Error types for the provider crate.

use std::time::Duration;

use marketlet_core::{CoreError, PodKey};
use marketlet_market::MarketError;
use marketlet_scheduler::ScheduleError;
use thiserror::Error;

/// Errors that can occur while managing pods on the virtual node.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Marketplace error.
    #[error("marketplace error: {0}")]
    Market(#[from] MarketError),

    /// No offer could be selected.
    #[error("scheduling failed: {0}")]
    Schedule(#[from] ScheduleError),

    /// A provider-written identifier on the pod is malformed.
    #[error("invalid identifier: {0}")]
    Core(#[from] CoreError),

    /// The pod is not managed by this provider.
    #[error("pod not found: {0}")]
    PodNotFound(PodKey),

    /// A pod annotation could not be parsed.
    #[error("invalid annotation {key}: {message}")]
    InvalidAnnotation {
        /// Annotation key.
        key: String,
        /// What is wrong with the value.
        message: String,
    },

    /// The node is at its active instance ceiling.
    #[error("capacity exceeded: {limit} active instances")]
    CapacityExceeded {
        /// Configured ceiling.
        limit: usize,
    },

    /// The instance did not become healthy in time.
    #[error("provisioning timed out after {0:?}")]
    ProvisionTimeout(Duration),

    /// The instance failed or stopped answering its readiness probe.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// Optimistic concurrency conflict on a Kubernetes object.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Endpoints could not be updated after repeated conflicts.
    #[error("endpoints {service} still conflicting after {attempts} attempts")]
    EndpointConflict {
        /// Target service.
        service: String,
        /// Attempts made.
        attempts: u32,
    },

    /// The pod was deleted while its worker was running.
    #[error("cancelled")]
    Cancelled,

    /// A pod state change that the lifecycle does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: &'static str,
        /// Requested state.
        to: &'static str,
    },

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Kube(_) | Self::Conflict(_) | Self::EndpointConflict { .. } => true,
            Self::Market(e) => e.is_retriable(),
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::PodNotFound(_) => 404,
            Self::InvalidAnnotation { .. } | Self::Core(_) => 400,
            Self::Conflict(_) | Self::EndpointConflict { .. } | Self::InvalidTransition { .. } => {
                409
            }
            Self::CapacityExceeded { .. } => 429,
            Self::Kube(_) | Self::Market(_) | Self::ProvisionTimeout(_) => 503,
            Self::Schedule(_)
            | Self::HealthCheckFailed(_)
            | Self::Cancelled
            | Self::Metrics(_)
            | Self::Config(_) => 500,
        }
    }

    pub(crate) fn annotation(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidAnnotation {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
