//! Pod events for the virtual node.
//!
//! Events are handled in arrival order per pod and concurrently across
//! pods: each pod with pending events gets a queue and a task draining it.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher, Config as WatcherConfig};
use kube::{Api, Client};
use marketlet_core::PodKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotations::{is_terminating, pod_key};
use crate::cluster::ClusterClient;
use crate::error::{ProviderError, Result};
use crate::provider::PodLifecycle;

/// A change to a pod bound to the node.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// Created, updated, or seen during a relist.
    Applied(Pod),
    /// Gone from the API server.
    Deleted(Pod),
}

impl PodEvent {
    fn pod(&self) -> &Pod {
        match self {
            Self::Applied(pod) | Self::Deleted(pod) => pod,
        }
    }
}

/// Routes pod events to a [`PodLifecycle`], one pod at a time.
#[derive(Clone)]
pub struct PodDispatcher {
    lifecycle: Arc<dyn PodLifecycle>,
    cluster: Arc<dyn ClusterClient>,
    queues: Arc<DashMap<PodKey, mpsc::UnboundedSender<PodEvent>>>,
}

impl PodDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(lifecycle: Arc<dyn PodLifecycle>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            lifecycle,
            cluster,
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Pods with events still queued or being handled.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.queues.len()
    }

    /// Queue an event behind earlier events for the same pod.
    pub fn dispatch(&self, event: PodEvent) {
        let Some(key) = pod_key(event.pod()) else {
            warn!("Ignoring pod event without a name");
            return;
        };
        match self.queues.entry(key.clone()) {
            Entry::Occupied(queue) => {
                // The drain task removes the queue before dropping its receiver.
                let _ = queue.get().send(event);
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(event);
                slot.insert(tx);
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.drain(key, rx).await });
            }
        }
    }

    async fn drain(&self, key: PodKey, mut rx: mpsc::UnboundedReceiver<PodEvent>) {
        loop {
            while let Ok(event) = rx.try_recv() {
                self.handle(&key, event).await;
            }
            if self.queues.remove_if(&key, |_, _| rx.is_empty()).is_some() {
                return;
            }
        }
    }

    async fn handle(&self, key: &PodKey, event: PodEvent) {
        let outcome = match event {
            PodEvent::Applied(pod) if is_terminating(&pod) => self.finish_deletion(key).await,
            PodEvent::Applied(pod) => match self.lifecycle.get_pod_status(key).await {
                Err(ProviderError::PodNotFound(_)) => self.lifecycle.create_pod(&pod).await,
                _ => self.lifecycle.update_pod(&pod).await,
            },
            PodEvent::Deleted(_) => self.lifecycle.delete_pod(key).await,
        };
        match outcome {
            Ok(()) => {}
            Err(e @ ProviderError::CapacityExceeded { .. }) => debug!(pod = %key, error = %e, "Pod waiting for capacity"),
            Err(e) => warn!(pod = %key, error = %e, "Failed to handle pod event"),
        }
    }

    /// Tear the pod down, then remove the object so the API server can
    /// finish the deletion.
    async fn finish_deletion(&self, key: &PodKey) -> Result<()> {
        self.lifecycle.delete_pod(key).await?;
        self.cluster.remove_pod(key).await
    }
}

/// Watch pods bound to `node` until cancelled.
pub async fn run_pod_watcher(client: Client, node: String, dispatcher: PodDispatcher, cancel: CancellationToken) {
    let pods: Api<Pod> = Api::all(client);
    let config = WatcherConfig::default().fields(&format!("spec.nodeName={node}"));
    let watch = watcher(pods, config);
    futures::pin_mut!(watch);

    info!(node = %node, "Starting pod watcher");

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = watch.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod))) => {
                dispatcher.dispatch(PodEvent::Applied(pod));
            }
            Some(Ok(watcher::Event::Delete(pod))) => dispatcher.dispatch(PodEvent::Deleted(pod)),
            Some(Ok(watcher::Event::Init)) => debug!("Pod watcher relisting"),
            Some(Ok(watcher::Event::InitDone)) => info!("Pod watcher synced"),
            Some(Err(e)) => error!(error = %e, "Pod watcher error, will retry"),
            None => {
                warn!("Pod watcher stream ended");
                break;
            }
        }
    }
}
