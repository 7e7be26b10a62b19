//! Pod lifecycle states and their Kubernetes status.

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use marketlet_core::{InstanceId, OfferId};
use serde::{Deserialize, Serialize};

/// Address and host port where an instance serves the pod's port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEndpoint {
    /// Public address of the instance.
    pub address: String,
    /// Host port mapped to the pod's container port.
    pub port: u16,
}

impl fmt::Display for InstanceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Where a pod is in its marketplace lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PodState {
    /// Accepted, not yet scheduled.
    Pending,
    /// Searching and ranking offers.
    Scheduling,
    /// Creating an instance from a ranked offer.
    Launching {
        /// Offer being launched.
        offer_id: OfferId,
        /// Launch attempt within this scheduling round, starting at 1.
        attempt: u32,
    },
    /// Instance created, waiting for an address and a passing probe.
    Provisioning {
        /// The instance.
        instance_id: InstanceId,
    },
    /// Instance healthy and published.
    Running {
        /// The instance.
        instance_id: InstanceId,
        /// Where it serves.
        endpoint: InstanceEndpoint,
        /// When it first became healthy.
        since: DateTime<Utc>,
    },
    /// Tearing down.
    Terminating,
    /// Torn down.
    Deleted,
    /// Gave up.
    Failed {
        /// Why.
        reason: String,
    },
}

/// [`PodState`] without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PodStateKind {
    Pending,
    Scheduling,
    Launching,
    Provisioning,
    Running,
    Terminating,
    Deleted,
    Failed,
}

impl PodStateKind {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduling => "scheduling",
            Self::Launching => "launching",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PodStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a pod may move from `from` to `to`.
///
/// Every live state may move to `Terminating`; `Deleted` is final.
#[must_use]
pub const fn is_valid_transition(from: PodStateKind, to: PodStateKind) -> bool {
    use PodStateKind as K;
    matches!(
        (from, to),
        (K::Pending, K::Scheduling | K::Failed | K::Terminating)
            | (K::Scheduling, K::Launching | K::Failed | K::Terminating)
            | (
                K::Launching,
                K::Launching | K::Provisioning | K::Scheduling | K::Failed | K::Terminating
            )
            | (K::Provisioning, K::Running | K::Scheduling | K::Failed | K::Terminating)
            | (K::Running, K::Scheduling | K::Failed | K::Terminating)
            | (K::Failed | K::Terminating, K::Terminating)
            | (K::Terminating, K::Deleted)
    )
}

impl PodState {
    /// The state's kind.
    #[must_use]
    pub const fn kind(&self) -> PodStateKind {
        match self {
            Self::Pending => PodStateKind::Pending,
            Self::Scheduling => PodStateKind::Scheduling,
            Self::Launching { .. } => PodStateKind::Launching,
            Self::Provisioning { .. } => PodStateKind::Provisioning,
            Self::Running { .. } => PodStateKind::Running,
            Self::Terminating => PodStateKind::Terminating,
            Self::Deleted => PodStateKind::Deleted,
            Self::Failed { .. } => PodStateKind::Failed,
        }
    }

    /// Instance named by the state, if any.
    #[must_use]
    pub const fn instance_id(&self) -> Option<InstanceId> {
        match self {
            Self::Provisioning { instance_id } | Self::Running { instance_id, .. } => {
                Some(*instance_id)
            }
            _ => None,
        }
    }

    /// Kubernetes pod phase.
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        match self {
            Self::Pending | Self::Scheduling | Self::Launching { .. } | Self::Provisioning { .. } => {
                "Pending"
            }
            Self::Running { .. } => "Running",
            Self::Terminating | Self::Deleted => "Succeeded",
            Self::Failed { .. } => "Failed",
        }
    }

    /// Kubernetes status for a pod in this state.
    #[must_use]
    pub fn pod_status(&self, container_name: &str, image: &str, restarts: u32) -> PodStatus {
        let now = Time(Utc::now());
        let ready = matches!(self, Self::Running { .. });

        let (state, reason, message) = match self {
            Self::Pending | Self::Scheduling => (waiting("Scheduling", None), None, None),
            Self::Launching { offer_id, attempt } => (
                waiting("Launching", Some(format!("offer {offer_id}, attempt {attempt}"))),
                None,
                None,
            ),
            Self::Provisioning { instance_id } => (
                waiting("ContainerCreating", Some(format!("instance {instance_id}"))),
                None,
                None,
            ),
            Self::Running { since, .. } => (
                ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(Time(*since)),
                    }),
                    ..Default::default()
                },
                None,
                None,
            ),
            Self::Terminating | Self::Deleted => (terminated(0, "Completed", None), None, None),
            Self::Failed { reason } => (
                terminated(1, "MarketplaceError", Some(reason.clone())),
                Some("MarketplaceError".to_string()),
                Some(reason.clone()),
            ),
        };

        let pod_ip = match self {
            Self::Running { endpoint, .. } => Some(endpoint.address.clone()),
            _ => None,
        };

        let condition = |type_: &str, status: bool| PodCondition {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(now.clone()),
            ..Default::default()
        };
        let scheduled = !matches!(self, Self::Pending | Self::Scheduling);

        PodStatus {
            phase: Some(self.phase().to_string()),
            conditions: Some(vec![
                condition("PodScheduled", scheduled),
                condition("Initialized", scheduled),
                condition("ContainersReady", ready),
                condition("Ready", ready),
            ]),
            container_statuses: Some(vec![ContainerStatus {
                name: container_name.to_string(),
                image: image.to_string(),
                image_id: String::new(),
                ready,
                started: Some(ready),
                restart_count: i32::try_from(restarts).unwrap_or(i32::MAX),
                state: Some(state),
                ..Default::default()
            }]),
            pod_ip,
            reason,
            message,
            ..Default::default()
        }
    }
}

fn waiting(reason: &str, message: Option<String>) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message,
        }),
        ..Default::default()
    }
}

fn terminated(exit_code: i32, reason: &str, message: Option<String>) -> ContainerState {
    ContainerState {
        terminated: Some(ContainerStateTerminated {
            exit_code,
            reason: Some(reason.to_string()),
            message,
            finished_at: Some(Time(Utc::now())),
            ..Default::default()
        }),
        ..Default::default()
    }
}
