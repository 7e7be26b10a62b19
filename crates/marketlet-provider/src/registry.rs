//! In-memory record of the pods this provider owns.
//!
//! The registry is the only place that maps a pod to its instance. Worker
//! tasks and `delete_pod` coordinate through it: an instance is attached
//! only while the pod is not being deleted, and [`PodRegistry::take_instance`]
//! hands an instance out exactly once, so exactly one caller terminates it.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::PodStatus;
use marketlet_core::{InstanceId, OfferId, OwnerTag, PodKey};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::annotations::PodRequest;
use crate::error::{ProviderError, Result};
use crate::lifecycle::{is_valid_transition, InstanceEndpoint, PodState, PodStateKind};

/// An endpoint entry written to a Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedEndpoint {
    /// Service whose Endpoints hold the entry.
    pub service: String,
    /// Published address and port.
    pub endpoint: InstanceEndpoint,
}

/// Durable part of a pod's record: what must be cleaned up when it goes away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodMapping {
    /// Instance currently held by the pod.
    pub instance_id: Option<InstanceId>,
    /// Offer the instance was launched from.
    pub offer_id: Option<OfferId>,
    /// Tag on the instance label and pod annotation.
    pub owner_tag: OwnerTag,
    /// Endpoint entry published for the pod.
    pub published: Option<PublishedEndpoint>,
}

struct PodEntry {
    request: PodRequest,
    state: PodState,
    mapping: PodMapping,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    permit: Option<OwnedSemaphorePermit>,
    relaunches: u32,
    deleting: bool,
}

/// Operator view of one pod, served on `/v1/pods`.
#[derive(Debug, Clone, Serialize)]
pub struct PodView {
    /// `namespace/name`.
    pub pod: PodKey,
    /// Current state.
    #[serde(flatten)]
    pub state: PodState,
    /// Instance and endpoint bookkeeping.
    pub mapping: PodMapping,
    /// Replacements after health failures.
    pub relaunches: u32,
}

/// What `begin_delete` hands back to the deleting caller.
pub struct Deletion {
    /// Already cancelled token of the pod's worker.
    pub cancel: CancellationToken,
    /// Worker to await, if one is still registered.
    pub worker: Option<JoinHandle<()>>,
}

/// Pods owned by this provider.
#[derive(Default)]
pub struct PodRegistry {
    pods: RwLock<HashMap<PodKey, PodEntry>>,
}

impl PodRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pod in `state`. Returns `false` if the pod is already known.
    pub fn insert(
        &self,
        request: PodRequest,
        state: PodState,
        cancel: CancellationToken,
        permit: Option<OwnedSemaphorePermit>,
    ) -> bool {
        let mut pods = self.pods.write();
        if pods.contains_key(&request.key) {
            return false;
        }
        let mapping = PodMapping {
            instance_id: state.instance_id(),
            offer_id: None,
            owner_tag: request.owner_tag,
            published: None,
        };
        pods.insert(
            request.key.clone(),
            PodEntry {
                request,
                state,
                mapping,
                cancel,
                worker: None,
                permit,
                relaunches: 0,
                deleting: false,
            },
        );
        true
    }

    /// Whether the pod is known.
    #[must_use]
    pub fn contains(&self, key: &PodKey) -> bool {
        self.pods.read().contains_key(key)
    }

    /// Keys of every known pod.
    #[must_use]
    pub fn keys(&self) -> Vec<PodKey> {
        self.pods.read().keys().cloned().collect()
    }

    /// Number of known pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    /// Whether no pod is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pods.read().is_empty()
    }

    /// Record the pod's worker task.
    ///
    /// If deletion already began the handle is dropped; the worker observes
    /// its cancelled token and exits on its own.
    pub fn set_worker(&self, key: &PodKey, worker: JoinHandle<()>) {
        if let Some(entry) = self.pods.write().get_mut(key) {
            if !entry.deleting {
                entry.worker = Some(worker);
            }
        }
    }

    /// Parsed request the pod was created from.
    #[must_use]
    pub fn request(&self, key: &PodKey) -> Option<PodRequest> {
        self.pods.read().get(key).map(|e| e.request.clone())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self, key: &PodKey) -> Option<PodState> {
        self.pods.read().get(key).map(|e| e.state.clone())
    }

    /// Current mapping.
    #[must_use]
    pub fn mapping(&self, key: &PodKey) -> Option<PodMapping> {
        self.pods.read().get(key).map(|e| e.mapping.clone())
    }

    /// Move the pod to `next`.
    ///
    /// # Errors
    ///
    /// Returns `PodNotFound` for an unknown pod and `InvalidTransition` when
    /// the lifecycle does not allow the move.
    pub fn transition(&self, key: &PodKey, next: PodState) -> Result<PodStateKind> {
        let mut pods = self.pods.write();
        let entry = pods
            .get_mut(key)
            .ok_or_else(|| ProviderError::PodNotFound(key.clone()))?;
        let from = entry.state.kind();
        let to = next.kind();
        if !is_valid_transition(from, to) {
            return Err(ProviderError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        entry.state = next;
        Ok(from)
    }

    /// Record a freshly created instance as the pod's instance.
    ///
    /// Returns `false` when the pod is gone or being deleted; the caller
    /// then owns the instance and must terminate it.
    pub fn attach_instance(&self, key: &PodKey, instance_id: InstanceId, offer_id: Option<OfferId>) -> bool {
        let mut pods = self.pods.write();
        match pods.get_mut(key) {
            Some(entry) if !entry.deleting => {
                entry.mapping.instance_id = Some(instance_id);
                entry.mapping.offer_id = offer_id;
                true
            }
            _ => false,
        }
    }

    /// Detach the pod's instance so the caller can terminate it.
    pub fn take_instance(&self, key: &PodKey) -> Option<InstanceId> {
        self.pods
            .write()
            .get_mut(key)
            .and_then(|e| e.mapping.instance_id.take())
    }

    /// Record the published endpoint.
    pub fn set_published(&self, key: &PodKey, published: PublishedEndpoint) {
        if let Some(entry) = self.pods.write().get_mut(key) {
            entry.mapping.published = Some(published);
        }
    }

    /// Detach the published endpoint so the caller can remove it.
    pub fn take_published(&self, key: &PodKey) -> Option<PublishedEndpoint> {
        self.pods
            .write()
            .get_mut(key)
            .and_then(|e| e.mapping.published.take())
    }

    /// Count one relaunch and return the new total.
    pub fn record_relaunch(&self, key: &PodKey) -> u32 {
        let mut pods = self.pods.write();
        pods.get_mut(key).map_or(0, |e| {
            e.relaunches += 1;
            e.relaunches
        })
    }

    /// Mark the pod as being deleted and cancel its worker.
    ///
    /// Returns `None` if the pod is unknown or deletion already began.
    pub fn begin_delete(&self, key: &PodKey) -> Option<Deletion> {
        let mut pods = self.pods.write();
        let entry = pods.get_mut(key)?;
        if entry.deleting {
            return None;
        }
        entry.deleting = true;
        entry.cancel.cancel();
        Some(Deletion {
            cancel: entry.cancel.clone(),
            worker: entry.worker.take(),
        })
    }

    /// Whether deletion of the pod has begun.
    #[must_use]
    pub fn is_deleting(&self, key: &PodKey) -> bool {
        self.pods.read().get(key).is_some_and(|e| e.deleting)
    }

    /// Give the pod's capacity slot back. Returns whether it held one.
    pub fn release_permit(&self, key: &PodKey) -> bool {
        self.pods
            .write()
            .get_mut(key)
            .and_then(|e| e.permit.take())
            .is_some()
    }

    /// Forget the pod.
    pub fn remove(&self, key: &PodKey) -> bool {
        self.pods.write().remove(key).is_some()
    }

    /// Kubernetes status of the pod.
    #[must_use]
    pub fn pod_status(&self, key: &PodKey) -> Option<PodStatus> {
        self.pods.read().get(key).map(|e| {
            e.state
                .pod_status(&e.request.container_name, &e.request.launch.image, e.relaunches)
        })
    }

    /// Owner tags of every known pod.
    #[must_use]
    pub fn owner_tags(&self) -> HashSet<OwnerTag> {
        self.pods.read().values().map(|e| e.mapping.owner_tag).collect()
    }

    /// Pods currently holding a capacity slot.
    #[must_use]
    pub fn active(&self) -> usize {
        self.pods.read().values().filter(|e| e.permit.is_some()).count()
    }

    /// View of every pod, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PodView> {
        let mut views: Vec<PodView> = self
            .pods
            .read()
            .iter()
            .map(|(key, e)| PodView {
                pod: key.clone(),
                state: e.state.clone(),
                mapping: e.mapping.clone(),
                relaunches: e.relaunches,
            })
            .collect();
        views.sort_by(|a, b| a.pod.cmp(&b.pod));
        views
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::annotations::tests::pod;
    use crate::config::ProviderSettings;

    fn request(name: &str) -> PodRequest {
        PodRequest::from_pod(&pod(name, &[]), &ProviderSettings::default()).unwrap()
    }

    fn registry_with(name: &str) -> (PodRegistry, PodKey) {
        let registry = PodRegistry::new();
        let req = request(name);
        let key = req.key.clone();
        assert!(registry.insert(req, PodState::Pending, CancellationToken::new(), None));
        (registry, key)
    }

    #[test]
    fn insert_is_idempotent() {
        let (registry, _) = registry_with("a");
        assert!(!registry.insert(request("a"), PodState::Pending, CancellationToken::new(), None));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn transitions_are_validated() {
        let (registry, key) = registry_with("a");
        assert_eq!(registry.transition(&key, PodState::Scheduling).unwrap(), PodStateKind::Pending);
        let err = registry
            .transition(
                &key,
                PodState::Provisioning {
                    instance_id: InstanceId::new(1),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidTransition { from: "scheduling", to: "provisioning" }));
        assert!(matches!(
            registry.transition(&PodKey::new("x", "y"), PodState::Scheduling),
            Err(ProviderError::PodNotFound(_))
        ));
    }

    #[test]
    fn instance_is_taken_once() {
        let (registry, key) = registry_with("a");
        assert!(registry.attach_instance(&key, InstanceId::new(9), Some(OfferId::new(3))));
        assert_eq!(registry.take_instance(&key), Some(InstanceId::new(9)));
        assert_eq!(registry.take_instance(&key), None);
    }

    #[test]
    fn attach_refused_while_deleting() {
        let (registry, key) = registry_with("a");
        let deletion = registry.begin_delete(&key).unwrap();
        assert!(deletion.cancel.is_cancelled());
        assert!(registry.begin_delete(&key).is_none());
        assert!(!registry.attach_instance(&key, InstanceId::new(9), None));
        assert_eq!(registry.take_instance(&key), None);
    }

    #[test]
    fn permit_released_once() {
        let semaphore = Arc::new(Semaphore::new(1));
        let registry = PodRegistry::new();
        let req = request("a");
        let key = req.key.clone();
        let permit = Arc::clone(&semaphore).try_acquire_owned().unwrap();
        registry.insert(req, PodState::Pending, CancellationToken::new(), Some(permit));

        assert_eq!(semaphore.available_permits(), 0);
        assert_eq!(registry.active(), 1);
        assert!(registry.release_permit(&key));
        assert!(!registry.release_permit(&key));
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn snapshot_reports_state_and_mapping() {
        let (registry, key) = registry_with("a");
        registry.attach_instance(&key, InstanceId::new(4), None);
        let views = registry.snapshot();
        assert_eq!(views.len(), 1);
        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["pod"], "voice/a");
        assert_eq!(json["state"], "pending");
        assert_eq!(json["mapping"]["instance_id"], 4);
    }
}
