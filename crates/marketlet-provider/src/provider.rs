//! The node provider: pod lifecycle on top of the marketplace.
//!
//! Every accepted pod gets one supervised worker task. The worker searches
//! and ranks offers, launches the best one (moving down the ranking when an
//! offer is lost to another renter), waits for an address and a passing
//! readiness probe, publishes the endpoint and then watches health until
//! the pod is deleted.
//!
//! Billing safety rests on two rules. A `create_instance` call is never
//! abandoned midway: cancellation is only observed once it returns, and an
//! instance created for a pod that is already being deleted is terminated
//! by the worker itself. Every other instance is attached to its pod in the
//! [`PodRegistry`] and terminated by whoever takes it out of the registry,
//! which happens exactly once. A launch that fails after the marketplace
//! may have accepted it is followed by a lookup of the pod's label, and the
//! reconciliation sweep terminates any labelled instance its pod does not
//! hold.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use marketlet_core::{InstanceId, OfferId, OwnerTag, PodKey};
use marketlet_market::{Instance, InstanceStatus, MarketError, Marketplace, Offer};
use marketlet_scheduler::rank_offers;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::annotations::{self, claimed_owner, is_terminating, pod_key, recorded_instance, PodRequest};
use crate::cluster::ClusterClient;
use crate::config::ProviderSettings;
use crate::endpoints::EndpointManager;
use crate::error::{ProviderError, Result};
use crate::health::{HealthEvent, HealthMonitor, Probe};
use crate::keyed_lock::KeyedAsyncLock;
use crate::lifecycle::{InstanceEndpoint, PodState, PodStateKind};
use crate::metrics::Metrics;
use crate::registry::{PodRegistry, PodView, PublishedEndpoint};

/// Lifecycle operations the pod watcher drives.
#[async_trait]
pub trait PodLifecycle: Send + Sync {
    /// Accept a pod bound to the virtual node and start provisioning it.
    ///
    /// Calling this again for a known pod is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` when the node is full (the pod is queued
    /// and admitted once capacity frees) or `InvalidAnnotation` when the pod
    /// cannot be parsed (the pod is marked Failed).
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Apply a changed pod.
    ///
    /// Nothing happens unless scheduling-relevant content changed, in which
    /// case the pod is deleted and created again. At the capacity ceiling
    /// the freed slot goes to the oldest queued pod first, so the updated
    /// pod may end up queued behind it.
    ///
    /// # Errors
    ///
    /// Same as [`PodLifecycle::create_pod`].
    async fn update_pod(&self, pod: &Pod) -> Result<()>;

    /// Tear a pod down: stop its worker, remove its endpoint, terminate its
    /// instance and release its capacity. Unknown pods are ignored.
    ///
    /// # Errors
    ///
    /// Currently infallible; cleanup failures are logged and left to the
    /// reconciliation sweep.
    async fn delete_pod(&self, key: &PodKey) -> Result<()>;

    /// Kubernetes status for a pod.
    ///
    /// # Errors
    ///
    /// Returns `PodNotFound` for pods this provider does not know.
    async fn get_pod_status(&self, key: &PodKey) -> Result<PodStatus>;

    /// Every pod this provider manages.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    async fn get_pods(&self) -> Result<Vec<PodView>>;

    /// Bring the registry in line with the cluster and the marketplace.
    ///
    /// # Errors
    ///
    /// Returns an error if pods or instances cannot be listed.
    async fn reconcile(&self) -> Result<ReconcileReport>;
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Claimed pods re-attached to their running instance.
    pub adopted: usize,
    /// Unclaimed pods accepted.
    pub created: usize,
    /// Pods waiting for capacity.
    pub deferred: usize,
    /// Claimed pods whose instance is gone, marked Failed.
    pub orphaned: usize,
    /// Registry pods no longer in the cluster, torn down.
    pub removed: usize,
    /// Labelled instances with no owning pod, or not the one attached to
    /// their pod, terminated.
    pub leaked: usize,
}

struct Deferred {
    pod: Pod,
    status: PodStatus,
}

struct Inner {
    settings: ProviderSettings,
    market: Arc<dyn Marketplace>,
    cluster: Arc<dyn ClusterClient>,
    endpoints: EndpointManager,
    probe: Arc<dyn Probe>,
    registry: PodRegistry,
    locks: KeyedAsyncLock<PodKey>,
    capacity: Arc<Semaphore>,
    deferred: Mutex<VecDeque<(PodKey, Deferred)>>,
    terminal: DashMap<PodKey, PodStatus>,
    metrics: Metrics,
    root: CancellationToken,
}

/// [`PodLifecycle`] backed by a [`Marketplace`] and a [`ClusterClient`].
#[derive(Clone)]
pub struct NodeProvider {
    inner: Arc<Inner>,
}

impl NodeProvider {
    /// Create a provider.
    #[must_use]
    pub fn new(
        settings: ProviderSettings,
        market: Arc<dyn Marketplace>,
        cluster: Arc<dyn ClusterClient>,
        probe: Arc<dyn Probe>,
        metrics: Metrics,
    ) -> Self {
        let endpoints = EndpointManager::new(Arc::clone(&cluster), settings.endpoint_retries);
        let capacity = Arc::new(Semaphore::new(settings.max_active_instances));
        Self {
            inner: Arc::new(Inner {
                settings,
                market,
                cluster,
                endpoints,
                probe,
                registry: PodRegistry::new(),
                locks: KeyedAsyncLock::new(),
                capacity,
                deferred: Mutex::new(VecDeque::new()),
                terminal: DashMap::new(),
                metrics,
                root: CancellationToken::new(),
            }),
        }
    }

    /// Provisioning settings.
    #[must_use]
    pub fn settings(&self) -> &ProviderSettings {
        &self.inner.settings
    }

    /// Provider metrics.
    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Pod registry.
    #[must_use]
    pub fn registry(&self) -> &PodRegistry {
        &self.inner.registry
    }

    /// Pods waiting for capacity, oldest first.
    #[must_use]
    pub fn deferred(&self) -> Vec<PodKey> {
        self.inner.deferred.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Token cancelled on shutdown. Workers run on child tokens.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.root.clone()
    }

    /// Stop every worker. Instances are left running for the next process
    /// to adopt.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    // ========================================================================
    // Status reporting
    // ========================================================================

    fn refresh_gauge(&self) {
        let active = i64::try_from(self.inner.registry.active()).unwrap_or(i64::MAX);
        self.inner.metrics.active_instances.set(active);
    }

    async fn report(&self, key: &PodKey) {
        let Some(status) = self.inner.registry.pod_status(key) else {
            return;
        };
        if let Err(e) = self.inner.cluster.patch_pod_status(key, status).await {
            warn!(pod = %key, error = %e, "Failed to update pod status");
        }
    }

    async fn report_terminal(&self, key: &PodKey, pod: &Pod, reason: String) {
        let container = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map_or_else(|| "main".to_string(), |c| c.name.clone());
        let image = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let status = PodState::Failed { reason }.pod_status(&container, &image, 0);
        self.inner.terminal.insert(key.clone(), status.clone());
        self.inner.metrics.pod_failures.inc();
        if let Err(e) = self.inner.cluster.patch_pod_status(key, status).await {
            warn!(pod = %key, error = %e, "Failed to update pod status");
        }
    }

    async fn annotate(&self, key: &PodKey, name: &str, value: String) {
        let annotations = [(name.to_string(), value)].into_iter().collect();
        if let Err(e) = self.inner.cluster.annotate_pod(key, annotations).await {
            warn!(pod = %key, annotation = name, error = %e, "Failed to annotate pod");
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Queue a pod rejected at the ceiling. Returns `true` the first time.
    fn defer(&self, key: &PodKey, pod: &Pod, request: &PodRequest) -> bool {
        let status = PodState::Pending.pod_status(&request.container_name, &request.launch.image, 0);
        let mut deferred = self.inner.deferred.lock();
        if let Some((_, entry)) = deferred.iter_mut().find(|(k, _)| k == key) {
            entry.pod = pod.clone();
            return false;
        }
        deferred.push_back((
            key.clone(),
            Deferred {
                pod: pod.clone(),
                status,
            },
        ));
        true
    }

    fn undefer(&self, key: &PodKey) -> bool {
        let mut deferred = self.inner.deferred.lock();
        let before = deferred.len();
        deferred.retain(|(k, _)| k != key);
        deferred.len() != before
    }

    /// Admit queued pods while capacity allows.
    async fn admit_deferred(&self) {
        loop {
            if self.inner.capacity.available_permits() == 0 {
                return;
            }
            let front = self
                .inner
                .deferred
                .lock()
                .front()
                .map(|(key, entry)| (key.clone(), entry.pod.clone()));
            let Some((key, pod)) = front else {
                return;
            };
            debug!(pod = %key, "Admitting deferred pod");
            match self.create_pod(&pod).await {
                Ok(()) => {}
                // Stays at the front of the queue.
                Err(ProviderError::CapacityExceeded { .. }) => return,
                Err(e) => warn!(pod = %key, error = %e, "Deferred pod could not be admitted"),
            }
            self.undefer(&key);
        }
    }

    fn spawn_worker(&self, key: &PodKey, cancel: CancellationToken) {
        let provider = self.clone();
        let worker_key = key.clone();
        let handle = tokio::spawn(async move {
            provider.run_worker(worker_key, cancel).await;
        });
        self.inner.registry.set_worker(key, handle);
    }

    // ========================================================================
    // Worker
    // ========================================================================

    async fn run_worker(&self, key: PodKey, cancel: CancellationToken) {
        match self.drive(&key, &cancel).await {
            Ok(()) | Err(ProviderError::Cancelled) => {
                debug!(pod = %key, "Worker stopped");
            }
            Err(e) => self.fail(&key, &e).await,
        }
    }

    /// Run `fut` unless the pod is cancelled or the deadline passes first.
    ///
    /// Never used around `create_instance`.
    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        fut: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::select! {
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
            () = tokio::time::sleep_until(deadline) => {
                Err(ProviderError::ProvisionTimeout(self.inner.settings.provision_timeout))
            }
            result = fut => result,
        }
    }

    async fn drive(&self, key: &PodKey, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        let request = inner
            .registry
            .request(key)
            .ok_or_else(|| ProviderError::PodNotFound(key.clone()))?;
        let mut excluded: HashSet<OfferId> = HashSet::new();
        let mut adopted = inner.registry.state(key).and_then(|s| s.instance_id());

        loop {
            let started = Instant::now();
            let deadline = started + inner.settings.provision_timeout;

            let instance_id = match adopted.take() {
                Some(id) => id,
                None => {
                    inner.registry.transition(key, PodState::Scheduling)?;
                    self.report(key).await;
                    self.provision(key, &request, cancel, deadline, &mut excluded).await?
                }
            };

            let endpoint = self
                .await_endpoint(key, instance_id, request.port, cancel, deadline)
                .await?;
            debug!(pod = %key, instance_id = %instance_id, endpoint = %endpoint, "Instance has an address");

            let (monitor, mut events) = HealthMonitor::spawn(
                Arc::clone(&inner.probe),
                endpoint.clone(),
                &inner.settings.health,
                cancel.child_token(),
            );
            let first = self
                .bounded(cancel, deadline, async {
                    loop {
                        match events.recv().await {
                            Some(HealthEvent::Healthy) => return Ok(()),
                            Some(HealthEvent::Unhealthy { .. }) => {}
                            None => return Err(ProviderError::Cancelled),
                        }
                    }
                })
                .await;
            if let Err(e) = first {
                monitor.stop().await;
                return Err(e);
            }

            self.publish(key, &request, &endpoint).await;
            inner.registry.transition(
                key,
                PodState::Running {
                    instance_id,
                    endpoint: endpoint.clone(),
                    since: Utc::now(),
                },
            )?;
            inner
                .metrics
                .provisioning_seconds
                .observe(started.elapsed().as_secs_f64());
            self.report(key).await;
            info!(pod = %key, instance_id = %instance_id, endpoint = %endpoint, "Pod running");

            let outcome = supervise(&mut events, cancel).await;
            monitor.stop().await;
            let failures = outcome?;

            inner.metrics.health_failures.inc();
            warn!(pod = %key, instance_id = %instance_id, failures, "Instance unhealthy, replacing");
            self.unpublish(key, &request).await;
            if let Some(offer) = inner.registry.mapping(key).and_then(|m| m.offer_id) {
                excluded.insert(offer);
            }
            if let Some(id) = inner.registry.take_instance(key) {
                self.terminate(key, id).await;
            }

            let relaunches = inner.registry.record_relaunch(key);
            if relaunches > inner.settings.max_relaunches {
                return Err(ProviderError::HealthCheckFailed(format!(
                    "instance {instance_id} unhealthy after {failures} failed probes, relaunch limit reached"
                )));
            }
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
        }
    }

    /// Search, rank and launch. Returns the attached instance.
    async fn provision(
        &self,
        key: &PodKey,
        request: &PodRequest,
        cancel: &CancellationToken,
        deadline: Instant,
        excluded: &mut HashSet<OfferId>,
    ) -> Result<InstanceId> {
        let inner = &self.inner;
        let criteria = request.scheduler.search_criteria();
        let offers = self
            .bounded(cancel, deadline, async {
                inner.market.search_offers(&criteria).await.map_err(ProviderError::from)
            })
            .await?;
        let considered = offers.len();
        let offers: Vec<_> = offers.into_iter().filter(|o| !excluded.contains(&o.id)).collect();
        let ranked = rank_offers(&offers, &request.scheduler, &inner.settings.weights)?;
        if let Some(best) = ranked.first() {
            info!(
                pod = %key,
                considered,
                eligible = ranked.len(),
                best = %best.offer.id,
                score = best.score,
                "Ranked offers"
            );
        }

        let mut last_error = None;
        for (index, candidate) in ranked.iter().take(inner.settings.launch_attempts.max(1) as usize).enumerate() {
            let attempt = u32::try_from(index + 1).unwrap_or(u32::MAX);
            if attempt > 1 {
                let backoff = inner.settings.launch_backoff(attempt - 1);
                self.bounded(cancel, deadline, async {
                    tokio::time::sleep(backoff).await;
                    Ok(())
                })
                .await?;
            }
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let offer = &candidate.offer;
            inner.registry.transition(
                key,
                PodState::Launching {
                    offer_id: offer.id,
                    attempt,
                },
            )?;
            debug!(pod = %key, offer_id = %offer.id, attempt, notes = ?candidate.notes, "Launching offer");

            match inner.market.create_instance(offer, &request.launch).await {
                Ok(instance_id) => return self.launched(key, offer, instance_id).await,
                Err(MarketError::OfferUnavailable(id)) => {
                    inner.metrics.offer_races.inc();
                    info!(pod = %key, offer_id = %id, "Offer taken by another renter, trying next");
                    excluded.insert(id);
                    last_error = Some(MarketError::OfferUnavailable(id));
                }
                Err(e) => {
                    // Only a 429 proves nothing was created.
                    if !matches!(e, MarketError::RateLimited) {
                        if let Some(instance_id) = self.recover_launch(key, request, offer.id).await {
                            return self.launched(key, offer, instance_id).await;
                        }
                    }
                    if !e.is_retriable() {
                        return Err(e.into());
                    }
                    warn!(pod = %key, offer_id = %offer.id, error = %e, "Launch failed, trying next offer");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or_else(
            || ProviderError::Schedule(marketlet_scheduler::ScheduleError::NoMatchingOffers { considered }),
            ProviderError::Market,
        ))
    }

    /// Attach a freshly created instance to the pod.
    async fn launched(&self, key: &PodKey, offer: &Offer, instance_id: InstanceId) -> Result<InstanceId> {
        let inner = &self.inner;
        inner.metrics.launches.inc();
        if !inner.registry.attach_instance(key, instance_id, Some(offer.id)) {
            info!(pod = %key, instance_id = %instance_id, "Pod deleted during launch, terminating instance");
            self.terminate(key, instance_id).await;
            return Err(ProviderError::Cancelled);
        }
        inner
            .registry
            .transition(key, PodState::Provisioning { instance_id })?;
        info!(pod = %key, instance_id = %instance_id, offer_id = %offer.id, price = offer.price_per_hour, "Launched instance");
        self.annotate(key, annotations::INSTANCE_ID, instance_id.to_string()).await;
        self.report(key).await;
        Ok(instance_id)
    }

    /// Look for an instance a failed `create_instance` on `offer_id` left
    /// behind. The first live one is returned, any others are terminated.
    async fn recover_launch(&self, key: &PodKey, request: &PodRequest, offer_id: OfferId) -> Option<InstanceId> {
        let label = request.owner_tag.label();
        let instances = match self.inner.market.list_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(pod = %key, offer_id = %offer_id, error = %e, "Cannot check for an instance left by the failed launch");
                return None;
            }
        };
        let mut recovered = None;
        for instance in instances.iter().filter(|i| {
            i.label.as_deref() == Some(label.as_str())
                && i.offer_id == Some(offer_id)
                && i.status != InstanceStatus::Terminated
        }) {
            if recovered.is_none() && !instance.status.is_terminal() {
                info!(pod = %key, instance_id = %instance.id, offer_id = %offer_id, "Failed launch created an instance, keeping it");
                recovered = Some(instance.id);
            } else {
                self.terminate(key, instance.id).await;
            }
        }
        recovered
    }

    /// Poll until the instance runs and maps the pod's port.
    async fn await_endpoint(
        &self,
        key: &PodKey,
        instance_id: InstanceId,
        port: u16,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<InstanceEndpoint> {
        let inner = &self.inner;
        loop {
            let polled = self
                .bounded(cancel, deadline, async {
                    Ok(inner.market.get_instance(instance_id).await)
                })
                .await?;
            match polled {
                Ok(instance) => {
                    if let Some(endpoint) = running_endpoint(&instance, port)? {
                        return Ok(endpoint);
                    }
                }
                Err(MarketError::InstanceNotFound(_)) => {
                    return Err(ProviderError::HealthCheckFailed(format!(
                        "instance {instance_id} disappeared"
                    )));
                }
                Err(e) if e.is_retriable() => {
                    debug!(pod = %key, instance_id = %instance_id, error = %e, "Status poll failed");
                }
                Err(e) => return Err(e.into()),
            }
            let interval = inner.settings.instance_poll_interval;
            self.bounded(cancel, deadline, async {
                tokio::time::sleep(interval).await;
                Ok(())
            })
            .await?;
        }
    }

    async fn publish(&self, key: &PodKey, request: &PodRequest, endpoint: &InstanceEndpoint) {
        let Some(service) = request.service.as_deref() else {
            debug!(pod = %key, "No target service, skipping endpoint publication");
            return;
        };
        match self
            .inner
            .endpoints
            .publish(key, service, endpoint, request.port_name.as_deref())
            .await
        {
            Ok(()) => self.inner.registry.set_published(
                key,
                PublishedEndpoint {
                    service: service.to_string(),
                    endpoint: endpoint.clone(),
                },
            ),
            Err(e) => error!(pod = %key, service, error = %e, "Failed to publish endpoint"),
        }
    }

    async fn unpublish(&self, key: &PodKey, request: &PodRequest) {
        let service = self
            .inner
            .registry
            .take_published(key)
            .map(|p| p.service)
            .or_else(|| request.service.clone());
        if let Some(service) = service {
            if let Err(e) = self.inner.endpoints.unpublish(key, &service).await {
                error!(pod = %key, service, error = %e, "Failed to remove endpoint");
            }
        }
    }

    async fn terminate(&self, key: &PodKey, instance_id: InstanceId) {
        match self.inner.market.terminate_instance(instance_id).await {
            Ok(()) => {
                self.inner.metrics.terminations.inc();
                info!(pod = %key, instance_id = %instance_id, "Terminated instance");
            }
            Err(e) => error!(
                pod = %key,
                instance_id = %instance_id,
                error = %e,
                "Failed to terminate instance, leaving it to reconciliation"
            ),
        }
    }

    /// Tear down after a worker gave up and mark the pod Failed.
    async fn fail(&self, key: &PodKey, err: &ProviderError) {
        let inner = &self.inner;
        if inner.registry.is_deleting(key) {
            return;
        }
        error!(pod = %key, error = %err, "Pod failed");
        if let Some(request) = inner.registry.request(key) {
            self.unpublish(key, &request).await;
        }
        if let Some(id) = inner.registry.take_instance(key) {
            self.terminate(key, id).await;
        }
        if let Err(e) = inner.registry.transition(
            key,
            PodState::Failed {
                reason: err.to_string(),
            },
        ) {
            debug!(pod = %key, error = %e, "Pod left its state before failing");
        }
        inner.metrics.pod_failures.inc();
        self.report(key).await;
        inner.registry.release_permit(key);
        self.refresh_gauge();
        self.admit_deferred().await;
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    async fn adopt(&self, pod: &Pod, key: &PodKey, instance: &Instance) -> Result<()> {
        let _guard = self.inner.locks.lock(key).await;
        if self.inner.registry.contains(key) {
            return Ok(());
        }
        let request = PodRequest::from_pod(pod, &self.inner.settings)?;
        let permit = Arc::clone(&self.inner.capacity).try_acquire_owned().ok();
        if permit.is_none() {
            warn!(pod = %key, instance_id = %instance.id, "Adopting instance above the capacity ceiling");
        }
        let cancel = self.inner.root.child_token();
        self.inner.registry.insert(
            request,
            PodState::Provisioning {
                instance_id: instance.id,
            },
            cancel.clone(),
            permit,
        );
        self.inner.registry.attach_instance(key, instance.id, instance.offer_id);
        self.refresh_gauge();
        self.spawn_worker(key, cancel);
        info!(pod = %key, instance_id = %instance.id, "Adopted instance");
        Ok(())
    }
}

/// Wait for the first `Unhealthy` event. Returns its failure count.
async fn supervise(events: &mut mpsc::Receiver<HealthEvent>, cancel: &CancellationToken) -> Result<u32> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            event = events.recv() => match event {
                Some(HealthEvent::Unhealthy { failures }) => return Ok(failures),
                Some(HealthEvent::Healthy) => {}
                None => return Err(ProviderError::Cancelled),
            },
        }
    }
}

/// The instance's endpoint once it runs, `None` while it is starting.
fn running_endpoint(instance: &Instance, port: u16) -> Result<Option<InstanceEndpoint>> {
    match instance.status {
        InstanceStatus::Running => Ok(instance
            .endpoint_for(port)
            .map(|(address, port)| InstanceEndpoint { address, port })),
        InstanceStatus::Provisioning => Ok(None),
        InstanceStatus::Error | InstanceStatus::Terminated => Err(ProviderError::HealthCheckFailed(format!(
            "instance {} is {:?}: {}",
            instance.id,
            instance.status,
            instance.status_message.as_deref().unwrap_or("no message")
        ))),
    }
}

#[async_trait]
impl PodLifecycle for NodeProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let inner = &self.inner;
        let key = pod_key(pod).ok_or_else(|| ProviderError::annotation("metadata.name", "missing"))?;
        let guard = inner.locks.lock(&key).await;

        if inner.registry.contains(&key) || inner.terminal.contains_key(&key) {
            debug!(pod = %key, "Pod already known");
            return Ok(());
        }

        let request = match PodRequest::from_pod(pod, &inner.settings) {
            Ok(request) => request,
            Err(e) => {
                warn!(pod = %key, error = %e, "Rejecting pod");
                self.report_terminal(&key, pod, e.to_string()).await;
                return Err(e);
            }
        };

        let Ok(permit) = Arc::clone(&inner.capacity).try_acquire_owned() else {
            let limit = inner.settings.max_active_instances;
            if self.defer(&key, pod, &request) {
                inner.metrics.capacity_rejections.inc();
                info!(pod = %key, limit, "Node at capacity, pod queued");
                if let Err(e) = inner
                    .cluster
                    .patch_pod_status(&key, PodState::Pending.pod_status(&request.container_name, &request.launch.image, 0))
                    .await
                {
                    warn!(pod = %key, error = %e, "Failed to update pod status");
                }
            }
            return Err(ProviderError::CapacityExceeded { limit });
        };
        self.undefer(&key);

        let owner_tag = request.owner_tag;
        let cancel = inner.root.child_token();
        inner
            .registry
            .insert(request, PodState::Pending, cancel.clone(), Some(permit));
        self.refresh_gauge();
        if claimed_owner(pod) != Some(owner_tag) {
            self.annotate(&key, annotations::OWNER_TAG, owner_tag.to_hex()).await;
        }
        self.spawn_worker(&key, cancel);
        info!(pod = %key, owner = %owner_tag, "Accepted pod");
        drop(guard);
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<()> {
        let inner = &self.inner;
        let key = pod_key(pod).ok_or_else(|| ProviderError::annotation("metadata.name", "missing"))?;

        if inner.terminal.contains_key(&key) {
            return Ok(());
        }
        if let Some((_, queued)) = inner.deferred.lock().iter_mut().find(|(k, _)| *k == key) {
            queued.pod = pod.clone();
            return Ok(());
        }
        let Some(current) = inner.registry.request(&key) else {
            return self.create_pod(pod).await;
        };
        if matches!(PodRequest::from_pod(pod, &inner.settings), Ok(request) if request == current) {
            return Ok(());
        }

        info!(pod = %key, "Scheduling-relevant pod content changed, recreating");
        self.delete_pod(&key).await?;
        self.create_pod(pod).await
    }

    async fn delete_pod(&self, key: &PodKey) -> Result<()> {
        let inner = &self.inner;
        let guard = inner.locks.lock(key).await;

        let was_deferred = self.undefer(key);
        let was_terminal = inner.terminal.remove(key).is_some();
        let Some(deletion) = inner.registry.begin_delete(key) else {
            if !was_deferred && !was_terminal {
                debug!(pod = %key, "Delete for unknown pod ignored");
            }
            return Ok(());
        };

        if let Some(worker) = deletion.worker {
            if let Err(e) = worker.await {
                warn!(pod = %key, error = %e, "Worker ended abnormally");
            }
        }

        if let Err(e) = inner.registry.transition(key, PodState::Terminating) {
            debug!(pod = %key, error = %e, "Terminating from unexpected state");
        }
        if let Some(request) = inner.registry.request(key) {
            self.unpublish(key, &request).await;
        }
        if let Some(instance_id) = inner.registry.take_instance(key) {
            self.terminate(key, instance_id).await;
        }
        if let Err(e) = inner.registry.transition(key, PodState::Deleted) {
            debug!(pod = %key, error = %e, "Deleted from unexpected state");
        }
        inner.registry.release_permit(key);
        inner.registry.remove(key);
        self.refresh_gauge();
        info!(pod = %key, "Pod deleted");
        drop(guard);

        self.admit_deferred().await;
        Ok(())
    }

    async fn get_pod_status(&self, key: &PodKey) -> Result<PodStatus> {
        let inner = &self.inner;
        if let Some(status) = inner.registry.pod_status(key) {
            return Ok(status);
        }
        if let Some(status) = inner.terminal.get(key) {
            return Ok(status.clone());
        }
        inner
            .deferred
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, d)| d.status.clone())
            .ok_or_else(|| ProviderError::PodNotFound(key.clone()))
    }

    async fn get_pods(&self) -> Result<Vec<PodView>> {
        Ok(self.inner.registry.snapshot())
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let inner = &self.inner;
        let known_before: Vec<PodKey> = inner.registry.keys();
        let pods = inner.cluster.list_node_pods(&inner.settings.node_name).await?;
        let instances = inner.market.list_instances().await?;

        let mut by_owner: HashMap<OwnerTag, Vec<&Instance>> = HashMap::new();
        for instance in &instances {
            if let Some(tag) = instance.label.as_deref().and_then(OwnerTag::from_label) {
                by_owner.entry(tag).or_default().push(instance);
            }
        }

        let mut report = ReconcileReport::default();
        // Instances of pods known at the start are terminated through
        // delete_pod, never by the sweep.
        let mut owners: HashSet<OwnerTag> = inner.registry.owner_tags();
        let mut listed: HashSet<PodKey> = HashSet::new();

        for pod in &pods {
            let Some(key) = pod_key(pod) else { continue };
            listed.insert(key.clone());

            if is_terminating(pod) {
                self.delete_pod(&key).await?;
                if let Err(e) = inner.cluster.remove_pod(&key).await {
                    warn!(pod = %key, error = %e, "Failed to remove pod");
                }
                continue;
            }
            if inner.registry.contains(&key) || inner.terminal.contains_key(&key) {
                continue;
            }

            let Some(owner) = claimed_owner(pod) else {
                match self.create_pod(pod).await {
                    Ok(()) => report.created += 1,
                    Err(ProviderError::CapacityExceeded { .. }) => report.deferred += 1,
                    Err(e) => warn!(pod = %key, error = %e, "Failed to accept pod"),
                }
                continue;
            };
            owners.insert(owner);

            let live = |i: &&Instance| !i.status.is_terminal();
            let instance = recorded_instance(pod)
                .and_then(|id| instances.iter().find(|i| i.id == id))
                .filter(live)
                .or_else(|| by_owner.get(&owner).and_then(|list| list.iter().copied().find(live)));

            match instance {
                Some(instance) => match self.adopt(pod, &key, instance).await {
                    Ok(()) => report.adopted += 1,
                    Err(e) => {
                        warn!(pod = %key, instance_id = %instance.id, error = %e, "Failed to adopt instance");
                        self.terminate(&key, instance.id).await;
                        self.report_terminal(&key, pod, e.to_string()).await;
                    }
                },
                None => {
                    warn!(pod = %key, owner = %owner, "Claimed pod has no instance, marking failed");
                    self.report_terminal(&key, pod, "instance for this pod no longer exists".to_string())
                        .await;
                    report.orphaned += 1;
                }
            }
        }

        for key in known_before {
            if !listed.contains(&key) {
                info!(pod = %key, "Pod no longer in the cluster");
                self.delete_pod(&key).await?;
                report.removed += 1;
            }
        }
        inner.deferred.lock().retain(|(k, _)| listed.contains(k));
        inner.terminal.retain(|k, _| listed.contains(k));

        let current: HashMap<OwnerTag, PodView> = inner
            .registry
            .snapshot()
            .into_iter()
            .map(|view| (view.mapping.owner_tag, view))
            .collect();
        for (tag, list) in &by_owner {
            let keep = match current.get(tag) {
                Some(view) => match view.mapping.instance_id {
                    Some(id) => Some(id),
                    None if view.state.kind() == PodStateKind::Failed => None,
                    // A launch may be in flight.
                    None => continue,
                },
                None if owners.contains(tag) => continue,
                None => None,
            };
            for instance in list
                .iter()
                .filter(|i| i.status != InstanceStatus::Terminated && Some(i.id) != keep)
            {
                match current.get(tag) {
                    Some(view) => warn!(
                        pod = %view.pod,
                        instance_id = %instance.id,
                        "Terminating instance not attached to its pod"
                    ),
                    None => warn!(instance_id = %instance.id, owner = %tag, "Terminating instance with no owning pod"),
                }
                match inner.market.terminate_instance(instance.id).await {
                    Ok(()) => {
                        inner.metrics.terminations.inc();
                        report.leaked += 1;
                    }
                    Err(e) => error!(instance_id = %instance.id, error = %e, "Failed to terminate leaked instance"),
                }
            }
        }

        info!(
            adopted = report.adopted,
            created = report.created,
            deferred = report.deferred,
            orphaned = report.orphaned,
            removed = report.removed,
            leaked = report.leaked,
            "Reconciled"
        );
        Ok(report)
    }
}
