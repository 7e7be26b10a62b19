//! The virtual node object and its heartbeat.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeSpec, NodeStatus, NodeSystemInfo, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::config::ProviderSettings;
use crate::error::Result;

/// Taint keeping ordinary workloads off the virtual node.
pub const TAINT_KEY: &str = "virtual-kubelet.io/provider";

/// Node object advertising the marketplace as one large node.
#[must_use]
pub fn build_node(settings: &ProviderSettings) -> Node {
    let labels = BTreeMap::from([
        ("type".to_string(), "virtual-kubelet".to_string()),
        ("kubernetes.io/role".to_string(), "agent".to_string()),
        ("kubernetes.io/hostname".to_string(), settings.node_name.clone()),
        ("kubernetes.io/os".to_string(), "linux".to_string()),
        ("marketlet.io/provider".to_string(), "marketplace".to_string()),
    ]);

    Node {
        metadata: ObjectMeta {
            name: Some(settings.node_name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: Some(vec![Taint {
                key: TAINT_KEY.to_string(),
                value: Some("marketlet".to_string()),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Capacity and a Ready condition stamped with the current time.
#[must_use]
pub fn node_status(settings: &ProviderSettings) -> NodeStatus {
    let slots = settings.max_active_instances.to_string();
    let capacity = BTreeMap::from([
        ("cpu".to_string(), Quantity((settings.max_active_instances * 16).to_string())),
        ("memory".to_string(), Quantity(format!("{}Gi", settings.max_active_instances * 64))),
        ("pods".to_string(), Quantity(slots.clone())),
        ("nvidia.com/gpu".to_string(), Quantity(slots)),
    ]);
    let now = Time(Utc::now());

    NodeStatus {
        allocatable: Some(capacity.clone()),
        capacity: Some(capacity),
        conditions: Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            reason: Some("ProviderReady".to_string()),
            message: Some("marketplace provider is ready".to_string()),
            last_heartbeat_time: Some(now.clone()),
            last_transition_time: Some(now),
        }]),
        node_info: Some(NodeSystemInfo {
            architecture: "amd64".to_string(),
            operating_system: "linux".to_string(),
            kubelet_version: concat!("marketlet-", env!("CARGO_PKG_VERSION")).to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create or update the node and publish its status.
///
/// # Errors
///
/// Returns an error if either API call fails.
pub async fn register_node(cluster: &dyn ClusterClient, settings: &ProviderSettings) -> Result<()> {
    cluster.apply_node(&build_node(settings)).await?;
    cluster
        .patch_node_status(&settings.node_name, node_status(settings))
        .await?;
    info!(node = %settings.node_name, capacity = settings.max_active_instances, "Registered virtual node");
    Ok(())
}

/// Refresh the Ready condition until cancelled.
pub async fn run_heartbeat(cluster: Arc<dyn ClusterClient>, settings: ProviderSettings, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match cluster
            .patch_node_status(&settings.node_name, node_status(&settings))
            .await
        {
            Ok(()) => debug!(node = %settings.node_name, "Node heartbeat"),
            Err(e) => warn!(node = %settings.node_name, error = %e, "Node heartbeat failed"),
        }
    }
}
