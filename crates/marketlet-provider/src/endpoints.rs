//! Publishes instance addresses into Service Endpoints.
//!
//! Each pod owns one subset of its Service's Endpoints object: a single
//! address whose `targetRef` names the pod, with the instance's mapped host
//! port. Target Services are expected to have no selector, so the cluster's
//! endpoints controller leaves these objects alone.
//!
//! Writes use optimistic concurrency: read, modify, replace at the read
//! resource version, and start over on a conflict.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference};
use kube::api::ObjectMeta;
use marketlet_core::PodKey;
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::error::{ProviderError, Result};
use crate::lifecycle::InstanceEndpoint;

/// Reads and writes Endpoints for pods on the virtual node.
pub struct EndpointManager {
    cluster: Arc<dyn ClusterClient>,
    attempts: u32,
}

impl EndpointManager {
    /// Create a manager that tries each update up to `attempts` times.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, attempts: u32) -> Self {
        Self {
            cluster,
            attempts: attempts.max(1),
        }
    }

    /// Make `endpoint` the only entry for `pod` in `service`.
    ///
    /// Creates the Endpoints object when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `EndpointConflict` if every attempt conflicted, or the
    /// underlying error for anything else.
    pub async fn publish(
        &self,
        pod: &PodKey,
        service: &str,
        endpoint: &InstanceEndpoint,
        port_name: Option<&str>,
    ) -> Result<()> {
        let namespace = pod.namespace();
        for attempt in 1..=self.attempts {
            let outcome = match self.cluster.get_endpoints(namespace, service).await? {
                Some(current) => {
                    let updated = with_pod_entry(current, pod, endpoint, port_name);
                    self.cluster.replace_endpoints(&updated).await
                }
                None => {
                    let fresh = with_pod_entry(empty(namespace, service), pod, endpoint, port_name);
                    self.cluster.create_endpoints(&fresh).await
                }
            };
            match outcome {
                Ok(()) => {
                    info!(pod = %pod, service, endpoint = %endpoint, "Published endpoint");
                    return Ok(());
                }
                Err(ProviderError::Conflict(reason)) => {
                    debug!(pod = %pod, service, attempt, reason, "Endpoints conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(pod = %pod, service, attempts = self.attempts, "Giving up on endpoints update");
        Err(ProviderError::EndpointConflict {
            service: service.to_string(),
            attempts: self.attempts,
        })
    }

    /// Remove every entry for `pod` from `service`.
    ///
    /// A missing Endpoints object, or one without entries for the pod, is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Same as [`EndpointManager::publish`].
    pub async fn unpublish(&self, pod: &PodKey, service: &str) -> Result<()> {
        let namespace = pod.namespace();
        for attempt in 1..=self.attempts {
            let Some(current) = self.cluster.get_endpoints(namespace, service).await? else {
                return Ok(());
            };
            if entries_for(&current, pod) == 0 {
                return Ok(());
            }
            match self.cluster.replace_endpoints(&without_pod(current, pod)).await {
                Ok(()) => {
                    info!(pod = %pod, service, "Removed endpoint");
                    return Ok(());
                }
                Err(ProviderError::Conflict(reason)) => {
                    debug!(pod = %pod, service, attempt, reason, "Endpoints conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(pod = %pod, service, attempts = self.attempts, "Giving up on endpoints removal");
        Err(ProviderError::EndpointConflict {
            service: service.to_string(),
            attempts: self.attempts,
        })
    }
}

fn empty(namespace: &str, service: &str) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(service.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "marketlet".to_string(),
            )])),
            ..Default::default()
        },
        subsets: None,
    }
}

fn targets(address: &EndpointAddress, pod: &PodKey) -> bool {
    address.target_ref.as_ref().is_some_and(|r| {
        r.kind.as_deref() == Some("Pod")
            && r.name.as_deref() == Some(pod.name())
            && r.namespace.as_deref() == Some(pod.namespace())
    })
}

/// Number of addresses in `endpoints` pointing at `pod`.
#[must_use]
pub fn entries_for(endpoints: &Endpoints, pod: &PodKey) -> usize {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|s| s.addresses.iter().flatten().chain(s.not_ready_addresses.iter().flatten()))
        .filter(|a| targets(a, pod))
        .count()
}

fn without_pod(mut endpoints: Endpoints, pod: &PodKey) -> Endpoints {
    let subsets = endpoints.subsets.take().unwrap_or_default();
    let kept: Vec<EndpointSubset> = subsets
        .into_iter()
        .filter_map(|mut subset| {
            for list in [&mut subset.addresses, &mut subset.not_ready_addresses] {
                if let Some(addresses) = list.as_mut() {
                    addresses.retain(|a| !targets(a, pod));
                }
            }
            let has_any = subset.addresses.as_ref().is_some_and(|a| !a.is_empty())
                || subset.not_ready_addresses.as_ref().is_some_and(|a| !a.is_empty());
            has_any.then_some(subset)
        })
        .collect();
    endpoints.subsets = (!kept.is_empty()).then_some(kept);
    endpoints
}

fn with_pod_entry(
    endpoints: Endpoints,
    pod: &PodKey,
    endpoint: &InstanceEndpoint,
    port_name: Option<&str>,
) -> Endpoints {
    let mut endpoints = without_pod(endpoints, pod);
    let subset = EndpointSubset {
        addresses: Some(vec![EndpointAddress {
            ip: endpoint.address.clone(),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.name().to_string()),
                namespace: Some(pod.namespace().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![EndpointPort {
            name: port_name.map(ToString::to_string),
            port: i32::from(endpoint.port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };
    endpoints.subsets.get_or_insert_with(Vec::new).push(subset);
    endpoints
}
