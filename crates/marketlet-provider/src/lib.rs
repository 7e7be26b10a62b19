//! Virtual Kubernetes node backed by a GPU marketplace.
//!
//! Pods scheduled onto the virtual node are not run locally. Each one is
//! turned into a rented marketplace instance: the provider ranks the
//! current offers, launches the best one, waits for the instance to pass
//! its readiness probe and publishes the instance's public address into
//! the pod's Service Endpoints so in-cluster clients can reach it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    Kubernetes API Server                      │
//! └───────────────────────────────────────────────────────────────┘
//!        │ pod events               ▲ status, endpoints, node
//!        ▼                          │
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        NodeProvider                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌───────────────────────┐  │
//! │  │ PodDispatch │  │  Per-pod    │  │   Reconciliation      │  │
//! │  │ (watcher)   │  │  workers    │  │   (adopt / sweep)     │  │
//! │  └─────────────┘  └─────────────┘  └───────────────────────┘  │
//! │         │                │                    │               │
//! │         ▼                ▼                    ▼               │
//! │   ┌───────────┐   ┌────────────┐      ┌──────────────┐        │
//! │   │ Registry  │   │  Health    │      │  Endpoints   │        │
//! │   │ + ceiling │   │  monitor   │      │  publisher   │        │
//! │   └───────────┘   └────────────┘      └──────────────┘        │
//! └───────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    GPU marketplace API                        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Testing
//!
//! With the `test-utils` feature, [`cluster::mock::MockCluster`] and
//! [`health::mock::MockProbe`] stand in for the API server and the
//! readiness probe, next to `marketlet_market::mock::MockMarketplace`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod annotations;
pub mod cluster;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod health;
pub mod keyed_lock;
pub mod lifecycle;
pub mod metrics;
pub mod node;
pub mod provider;
pub mod registry;
pub mod watcher;

pub use annotations::PodRequest;
pub use cluster::{ClusterClient, KubeCluster};
pub use config::{HealthSettings, ProviderConfig, ProviderSettings};
pub use endpoints::EndpointManager;
pub use error::{ProviderError, Result};
pub use health::{HealthEvent, HealthMonitor, HttpProbe, Probe};
pub use lifecycle::{InstanceEndpoint, PodState, PodStateKind};
pub use metrics::Metrics;
pub use provider::{NodeProvider, PodLifecycle, ReconcileReport};
pub use registry::{PodMapping, PodRegistry, PodView};
pub use watcher::{run_pod_watcher, PodDispatcher, PodEvent};

#[cfg(any(test, feature = "test-utils"))]
pub use cluster::mock::MockCluster;
#[cfg(any(test, feature = "test-utils"))]
pub use health::mock::MockProbe;
