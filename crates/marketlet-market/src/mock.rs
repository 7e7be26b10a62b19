//! In-memory marketplace for tests.
//!
//! Enabled with the `test-utils` feature. Offers are served from a fixed
//! list, launches create instances that become `Running` after a configurable
//! number of status polls, and every call is counted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use marketlet_core::{InstanceId, OfferId};
use parking_lot::Mutex;

use crate::client::Marketplace;
use crate::error::{MarketError, Result};
use crate::types::{Instance, InstanceStatus, LaunchSpec, Offer, SearchCriteria};

/// Mock marketplace for testing.
#[derive(Debug, Default)]
pub struct MockMarketplace {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    offers: Vec<Offer>,
    raced: HashSet<OfferId>,
    leased: HashSet<OfferId>,
    instances: HashMap<InstanceId, MockInstance>,
    next_id: u64,
    create_delay: Duration,
    ready_after_polls: u32,
    address: Option<String>,
    port_base: u16,
    search_error: Option<MarketError>,
    create_error: Option<MarketError>,
    lost_create: Option<MarketError>,
    search_calls: usize,
    create_calls: usize,
    terminate_calls: HashMap<InstanceId, usize>,
    peak_live: usize,
}

#[derive(Debug, Clone)]
struct MockInstance {
    instance: Instance,
    polls: u32,
    failed: bool,
    spec: LaunchSpec,
}

impl MockMarketplace {
    /// Create a mock serving the given offers.
    #[must_use]
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            state: Mutex::new(MockState {
                offers,
                next_id: 1000,
                address: Some("198.51.100.10".to_string()),
                port_base: 40000,
                ..MockState::default()
            }),
        }
    }

    /// Delay every launch by `delay`.
    #[must_use]
    pub fn with_create_delay(self, delay: Duration) -> Self {
        self.state.lock().create_delay = delay;
        self
    }

    /// Instances report `Running` only after this many status polls.
    #[must_use]
    pub fn with_ready_after_polls(self, polls: u32) -> Self {
        self.state.lock().ready_after_polls = polls;
        self
    }

    /// Public address reported by launched instances; `None` withholds it.
    #[must_use]
    pub fn with_address(self, address: Option<&str>) -> Self {
        self.state.lock().address = address.map(str::to_string);
        self
    }

    /// Mark an offer as rented by a competitor: it is still returned by
    /// searches but launching it fails with `OfferUnavailable`.
    pub fn race_offer(&self, id: OfferId) {
        self.state.lock().raced.insert(id);
    }

    /// Make the next searches fail with `error`, or clear the failure.
    pub fn set_search_error(&self, error: Option<MarketError>) {
        self.state.lock().search_error = error;
    }

    /// Make the next launches fail with `error`, or clear the failure.
    pub fn set_create_error(&self, error: Option<MarketError>) {
        self.state.lock().create_error = error;
    }

    /// Let the next launch create its instance and then fail with `error`,
    /// as when the response to a successful request is lost.
    pub fn lose_next_create_response(&self, error: MarketError) {
        self.state.lock().lost_create = Some(error);
    }

    /// Make an instance report `Error` from now on.
    pub fn fail_instance(&self, id: InstanceId) {
        if let Some(entry) = self.state.lock().instances.get_mut(&id) {
            entry.failed = true;
        }
    }

    /// Add a running instance that exists on the account without going
    /// through a launch, serving the given container ports.
    pub fn insert_instance(&self, label: &str, ports: &[u16]) -> InstanceId {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let spec = LaunchSpec {
            image: String::new(),
            env: BTreeMap::new(),
            ports: ports.to_vec(),
            disk_gb: 0,
            args: Vec::new(),
            onstart: None,
            label: label.to_string(),
        };
        let instance = state.build_instance(id, None, &spec);
        state.instances.insert(
            id,
            MockInstance {
                instance,
                polls: u32::MAX,
                failed: false,
                spec,
            },
        );
        state.record_peak();
        id
    }

    /// Number of `search_offers` calls.
    #[must_use]
    pub fn search_calls(&self) -> usize {
        self.state.lock().search_calls
    }

    /// Number of `create_instance` calls, including failed ones.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    /// Number of `terminate_instance` calls for `id`.
    #[must_use]
    pub fn terminate_calls(&self, id: InstanceId) -> usize {
        self.state.lock().terminate_calls.get(&id).copied().unwrap_or(0)
    }

    /// Total `terminate_instance` calls.
    #[must_use]
    pub fn total_terminate_calls(&self) -> usize {
        self.state.lock().terminate_calls.values().sum()
    }

    /// Instances currently alive.
    #[must_use]
    pub fn live_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.state.lock().instances.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Highest number of simultaneously live instances seen.
    #[must_use]
    pub fn peak_live(&self) -> usize {
        self.state.lock().peak_live
    }

    /// Launch spec an instance was created with.
    #[must_use]
    pub fn launch_spec(&self, id: InstanceId) -> Option<LaunchSpec> {
        self.state.lock().instances.get(&id).map(|e| e.spec.clone())
    }

    /// Offer an instance was launched from.
    #[must_use]
    pub fn offer_of(&self, id: InstanceId) -> Option<OfferId> {
        self.state
            .lock()
            .instances
            .get(&id)
            .and_then(|e| e.instance.offer_id)
    }
}

impl MockState {
    fn allocate_id(&mut self) -> InstanceId {
        self.next_id += 1;
        InstanceId::new(self.next_id)
    }

    fn build_instance(&self, id: InstanceId, offer: Option<OfferId>, spec: &LaunchSpec) -> Instance {
        let mut ports = BTreeMap::new();
        for (i, port) in spec.ports.iter().enumerate() {
            let offset = u16::try_from(i).unwrap_or(u16::MAX);
            ports.insert(*port, self.port_base.saturating_add(offset));
        }
        Instance {
            id,
            offer_id: offer,
            label: Some(spec.label.clone()),
            public_address: self.address.clone(),
            ports,
            status: InstanceStatus::Provisioning,
            status_message: None,
            created_at: Some(Utc::now()),
        }
    }

    fn record_peak(&mut self) {
        self.peak_live = self.peak_live.max(self.instances.len());
    }
}

fn matches(offer: &Offer, criteria: &SearchCriteria) -> bool {
    (criteria.gpu_names.is_empty() || criteria.gpu_names.iter().any(|g| g == &offer.gpu_name))
        && offer.num_gpus >= criteria.min_num_gpus
        && criteria.max_price_per_hour.is_none_or(|max| offer.price_per_hour <= max)
        && criteria.min_reliability.is_none_or(|min| offer.reliability >= min)
        && criteria.min_gpu_memory_gb.is_none_or(|min| offer.gpu_memory_gb >= min)
        && (!criteria.verified_only || offer.verified)
}

#[async_trait]
impl Marketplace for MockMarketplace {
    async fn search_offers(&self, criteria: &SearchCriteria) -> Result<Vec<Offer>> {
        let mut state = self.state.lock();
        state.search_calls += 1;
        if let Some(err) = state.search_error.clone() {
            return Err(err);
        }
        Ok(state
            .offers
            .iter()
            .filter(|o| !state.leased.contains(&o.id) && matches(o, criteria))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, offer: &Offer, spec: &LaunchSpec) -> Result<InstanceId> {
        let delay = {
            let mut state = self.state.lock();
            state.create_calls += 1;
            state.create_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.create_error.clone() {
            return Err(err);
        }
        if state.raced.contains(&offer.id) || state.leased.contains(&offer.id) {
            return Err(MarketError::OfferUnavailable(offer.id));
        }

        let id = state.allocate_id();
        let instance = state.build_instance(id, Some(offer.id), spec);
        state.leased.insert(offer.id);
        state.instances.insert(
            id,
            MockInstance {
                instance,
                polls: 0,
                failed: false,
                spec: spec.clone(),
            },
        );
        state.record_peak();
        match state.lost_create.take() {
            Some(err) => Err(err),
            None => Ok(id),
        }
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Instance> {
        let mut state = self.state.lock();
        let ready_after = state.ready_after_polls;
        let entry = state
            .instances
            .get_mut(&id)
            .ok_or(MarketError::InstanceNotFound(id))?;

        entry.polls = entry.polls.saturating_add(1);
        entry.instance.status = if entry.failed {
            InstanceStatus::Error
        } else if entry.polls > ready_after {
            InstanceStatus::Running
        } else {
            InstanceStatus::Provisioning
        };
        Ok(entry.instance.clone())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let state = self.state.lock();
        let mut instances: Vec<_> = state
            .instances
            .values()
            .map(|e| e.instance.clone())
            .collect();
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }

    async fn terminate_instance(&self, id: InstanceId) -> Result<()> {
        let mut state = self.state.lock();
        *state.terminate_calls.entry(id).or_default() += 1;
        if let Some(entry) = state.instances.remove(&id) {
            if let Some(offer) = entry.instance.offer_id {
                state.leased.remove(&offer);
            }
        }
        Ok(())
    }
}
