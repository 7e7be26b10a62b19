//! End-to-end pod lifecycle against the in-memory marketplace and cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec};
use kube::api::ObjectMeta;
use marketlet_core::{InstanceId, OfferId, OwnerTag, PodKey};
use marketlet_market::mock::MockMarketplace;
use marketlet_market::{MarketError, Marketplace, Offer};
use marketlet_provider::annotations::{self, pod_key};
use marketlet_provider::endpoints::entries_for;
use marketlet_provider::{
    ClusterClient, HealthSettings, Metrics, MockCluster, MockProbe, NodeProvider, PodLifecycle, PodStateKind,
    ProviderError, ProviderSettings,
};

fn offer(id: u64, price: f64) -> Offer {
    Offer {
        id: OfferId::new(id),
        gpu_name: "RTX 4090".to_string(),
        num_gpus: 1,
        gpu_memory_gb: 24.0,
        price_per_hour: price,
        reliability: 0.99,
        geolocation: "US-CA".to_string(),
        verified: true,
        inet_down_mbps: 800.0,
        inet_up_mbps: 400.0,
        host_uptime_hours: 2000.0,
    }
}

fn offers(n: u64) -> Vec<Offer> {
    (1..=n).map(|i| offer(i, 0.20 + 0.05 * i as f64)).collect()
}

fn pod(name: &str, annotations: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("voice".to_string()),
            uid: Some(format!("uid-{name}")),
            labels: Some(BTreeMap::from([("app".to_string(), "stt".to_string())])),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("marketlet".to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                image: Some("ghcr.io/acme/stt:1.2".to_string()),
                ports: Some(vec![ContainerPort {
                    container_port: 8000,
                    name: Some("http".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn settings() -> ProviderSettings {
    ProviderSettings {
        max_active_instances: 4,
        provision_timeout: Duration::from_secs(600),
        launch_backoff_base: Duration::from_millis(10),
        launch_backoff_max: Duration::from_millis(100),
        instance_poll_interval: Duration::from_secs(1),
        max_relaunches: 2,
        health: HealthSettings {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
            failure_threshold: 2,
        },
        ..ProviderSettings::default()
    }
}

struct Harness {
    market: Arc<MockMarketplace>,
    cluster: Arc<MockCluster>,
    probe: Arc<MockProbe>,
    provider: NodeProvider,
}

impl Harness {
    fn new(market: MockMarketplace, settings: ProviderSettings) -> Self {
        let market = Arc::new(market);
        let cluster = Arc::new(MockCluster::new());
        let probe = Arc::new(MockProbe::new(true));
        let provider = NodeProvider::new(
            settings,
            Arc::clone(&market) as Arc<dyn Marketplace>,
            Arc::clone(&cluster) as Arc<dyn ClusterClient>,
            Arc::clone(&probe) as Arc<dyn marketlet_provider::Probe>,
            Metrics::new().unwrap(),
        );
        Self {
            market,
            cluster,
            probe,
            provider,
        }
    }

    /// Add the pod to the cluster and hand it to the provider.
    async fn create(&self, pod: &Pod) -> marketlet_provider::Result<PodKey> {
        self.cluster.add_pod(pod.clone());
        self.provider.create_pod(pod).await?;
        Ok(pod_key(pod).unwrap())
    }

    fn kind(&self, key: &PodKey) -> Option<PodStateKind> {
        self.provider.registry().state(key).map(|s| s.kind())
    }

    fn instance(&self, key: &PodKey) -> Option<InstanceId> {
        self.provider.registry().mapping(key).and_then(|m| m.instance_id)
    }

    async fn wait_for(&self, key: &PodKey, kind: PodStateKind) {
        wait_until(|| self.kind(key) == Some(kind)).await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn pod_runs_on_cheapest_offer_and_cleans_up() {
    let h = Harness::new(MockMarketplace::new(offers(3)).with_ready_after_polls(2), settings());
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();
    assert_eq!(h.market.offer_of(id), Some(OfferId::new(1)));

    let status = h.cluster.last_status(&key).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Running"));
    assert_eq!(status.pod_ip.as_deref(), Some("198.51.100.10"));

    let annotated = h.cluster.pod(&key).unwrap().metadata.annotations.unwrap();
    assert_eq!(annotated[annotations::INSTANCE_ID], id.to_string());
    assert!(annotated.contains_key(annotations::OWNER_TAG));
    assert_eq!(h.market.launch_spec(id).unwrap().label, OwnerTag::derive(&key, "uid-stt-0").label());

    let endpoints = h.cluster.endpoints("voice", "stt").unwrap();
    assert_eq!(entries_for(&endpoints, &key), 1);
    assert_eq!(h.provider.metrics().active_instances.get(), 1);

    h.provider.delete_pod(&key).await.unwrap();

    assert_eq!(h.market.terminate_calls(id), 1);
    assert!(h.market.live_instances().is_empty());
    assert_eq!(entries_for(&h.cluster.endpoints("voice", "stt").unwrap(), &key), 0);
    assert!(!h.provider.registry().contains(&key));
    assert_eq!(h.provider.metrics().active_instances.get(), 0);
    assert!(matches!(
        h.provider.get_pod_status(&key).await,
        Err(ProviderError::PodNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn delete_while_provisioning_terminates_once() {
    let h = Harness::new(MockMarketplace::new(offers(2)).with_ready_after_polls(10_000), settings());
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    h.wait_for(&key, PodStateKind::Provisioning).await;
    let id = h.instance(&key).unwrap();

    h.provider.delete_pod(&key).await.unwrap();
    h.provider.delete_pod(&key).await.unwrap();

    assert_eq!(h.market.terminate_calls(id), 1);
    assert_eq!(h.market.total_terminate_calls(), 1);
    assert!(h.market.live_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_during_launch_terminates_late_instance() {
    let market = MockMarketplace::new(offers(2)).with_create_delay(Duration::from_secs(30));
    let h = Harness::new(market, settings());
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    wait_until(|| h.market.create_calls() == 1).await;
    h.provider.delete_pod(&key).await.unwrap();

    assert_eq!(h.market.create_calls(), 1);
    assert_eq!(h.market.total_terminate_calls(), 1);
    assert!(h.market.live_instances().is_empty());
    assert!(!h.provider.registry().contains(&key));
}

#[tokio::test(start_paused = true)]
async fn ceiling_holds_under_concurrent_creates() {
    let h = Harness::new(
        MockMarketplace::new(offers(8)),
        ProviderSettings {
            max_active_instances: 2,
            ..settings()
        },
    );
    let pods: Vec<Pod> = (0..5).map(|i| pod(&format!("stt-{i}"), &[])).collect();
    for p in &pods {
        h.cluster.add_pod(p.clone());
    }

    let results = futures::future::join_all(pods.iter().map(|p| h.provider.create_pod(p))).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(ProviderError::CapacityExceeded { limit: 2 })))
        .count();
    assert_eq!(accepted, 2);
    assert_eq!(rejected, 3);
    assert_eq!(h.provider.deferred().len(), 3);
    assert_eq!(h.provider.metrics().capacity_rejections.get(), 3);

    let waiting = h.provider.deferred()[0].clone();
    let status = h.provider.get_pod_status(&waiting).await.unwrap();
    assert_eq!(status.phase.as_deref(), Some("Pending"));

    let running: Vec<PodKey> = h.provider.registry().keys();
    for key in &running {
        h.wait_for(key, PodStateKind::Running).await;
    }

    h.provider.delete_pod(&running[0]).await.unwrap();
    h.wait_for(&waiting, PodStateKind::Running).await;

    assert_eq!(h.provider.deferred().len(), 2);
    assert_eq!(h.provider.registry().active(), 2);
    assert!(h.market.peak_live() <= 2);
}

#[tokio::test(start_paused = true)]
async fn lost_offer_falls_back_to_next() {
    let h = Harness::new(MockMarketplace::new(offers(3)), settings());
    h.market.race_offer(OfferId::new(1));
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();
    assert_eq!(h.market.offer_of(id), Some(OfferId::new(2)));
    assert_eq!(h.market.create_calls(), 2);
    assert_eq!(h.provider.metrics().offer_races.get(), 1);
    assert_eq!(h.market.live_instances(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn no_matching_offer_fails_pod() {
    let h = Harness::new(MockMarketplace::new(offers(2)), settings());
    let key = h
        .create(&pod("stt-0", &[(annotations::GPU_TYPE, "H100")]))
        .await
        .unwrap();

    h.wait_for(&key, PodStateKind::Failed).await;
    assert_eq!(h.market.create_calls(), 0);
    assert_eq!(h.provider.registry().active(), 0);
    let status = h.cluster.last_status(&key).unwrap();
    assert_eq!(status.phase.as_deref(), Some("Failed"));
}

#[tokio::test(start_paused = true)]
async fn unhealthy_instance_is_replaced_on_another_offer() {
    let h = Harness::new(MockMarketplace::new(offers(3)), settings());
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    h.wait_for(&key, PodStateKind::Running).await;
    let first = h.instance(&key).unwrap();
    let first_offer = h.market.offer_of(first).unwrap();

    h.probe.set_healthy(false);
    wait_until(|| h.market.terminate_calls(first) == 1).await;
    h.probe.set_healthy(true);

    wait_until(|| h.kind(&key) == Some(PodStateKind::Running) && h.instance(&key) != Some(first)).await;
    let second = h.instance(&key).unwrap();
    assert_ne!(h.market.offer_of(second), Some(first_offer));
    assert_eq!(h.market.live_instances(), vec![second]);
    assert_eq!(h.provider.metrics().health_failures.get(), 1);
    assert_eq!(h.provider.get_pods().await.unwrap()[0].relaunches, 1);
    assert_eq!(entries_for(&h.cluster.endpoints("voice", "stt").unwrap(), &key), 1);
}

#[tokio::test(start_paused = true)]
async fn relaunch_limit_fails_pod() {
    let h = Harness::new(
        MockMarketplace::new(offers(3)),
        ProviderSettings {
            max_relaunches: 0,
            ..settings()
        },
    );
    let key = h.create(&pod("stt-0", &[])).await.unwrap();
    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();

    h.probe.set_healthy(false);
    h.wait_for(&key, PodStateKind::Failed).await;

    assert_eq!(h.market.terminate_calls(id), 1);
    assert!(h.market.live_instances().is_empty());
    assert_eq!(h.provider.registry().active(), 0);
    assert_eq!(entries_for(&h.cluster.endpoints("voice", "stt").unwrap(), &key), 0);
    assert_eq!(h.provider.metrics().pod_failures.get(), 1);

    // Deleting a failed pod has nothing left to terminate.
    h.provider.delete_pod(&key).await.unwrap();
    assert_eq!(h.market.total_terminate_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_pod_is_failed_without_launching() {
    let h = Harness::new(MockMarketplace::new(offers(2)), settings());
    let bad = pod("stt-0", &[(annotations::MAX_PRICE, "cheap")]);

    let err = h.create(&bad).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidAnnotation { .. }));

    let key = pod_key(&bad).unwrap();
    let status = h.provider.get_pod_status(&key).await.unwrap();
    assert_eq!(status.phase.as_deref(), Some("Failed"));
    assert_eq!(h.cluster.last_status(&key).unwrap().phase.as_deref(), Some("Failed"));

    // Repeated events are ignored.
    h.provider.update_pod(&bad).await.unwrap();
    h.provider.create_pod(&bad).await.unwrap();
    assert_eq!(h.market.search_calls(), 0);
    assert_eq!(h.market.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn irrelevant_update_keeps_instance() {
    let h = Harness::new(MockMarketplace::new(offers(3)), settings());
    let original = pod("stt-0", &[]);
    let key = h.create(&original).await.unwrap();
    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();

    let mut relabelled = original.clone();
    relabelled
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert("team".to_string(), "speech".to_string());
    h.provider.update_pod(&relabelled).await.unwrap();
    assert_eq!(h.instance(&key), Some(id));

    let repriced = pod("stt-0", &[(annotations::MAX_PRICE, "0.5")]);
    h.provider.update_pod(&repriced).await.unwrap();
    assert_eq!(h.market.terminate_calls(id), 1);
    h.wait_for(&key, PodStateKind::Running).await;
    assert_ne!(h.instance(&key), Some(id));
}

#[tokio::test(start_paused = true)]
async fn reconcile_adopts_orphans_and_sweeps() {
    let h = Harness::new(MockMarketplace::new(offers(3)), settings());

    let adopted = pod("stt-a", &[]);
    let adopted_key = pod_key(&adopted).unwrap();
    let adopted_tag = OwnerTag::derive(&adopted_key, "uid-stt-a");
    let adopted_instance = h.market.insert_instance(&adopted_tag.label(), &[8000]);
    let adopted = pod("stt-a", &[(annotations::OWNER_TAG, &adopted_tag.to_hex())]);
    h.cluster.add_pod(adopted);

    let orphan_key = PodKey::new("voice", "stt-b");
    let orphan_tag = OwnerTag::derive(&orphan_key, "uid-stt-b");
    h.cluster
        .add_pod(pod("stt-b", &[(annotations::OWNER_TAG, &orphan_tag.to_hex())]));

    let fresh = pod("stt-c", &[]);
    let fresh_key = pod_key(&fresh).unwrap();
    h.cluster.add_pod(fresh);

    let leaked_tag = OwnerTag::derive(&PodKey::new("voice", "gone"), "uid-gone");
    let leaked = h.market.insert_instance(&leaked_tag.label(), &[8000]);
    let foreign = h.market.insert_instance("someone-else", &[8000]);

    let report = h.provider.reconcile().await.unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.created, 1);
    assert_eq!(report.leaked, 1);
    assert_eq!(report.removed, 0);

    assert_eq!(h.market.terminate_calls(leaked), 1);
    assert_eq!(h.market.terminate_calls(foreign), 0);

    h.wait_for(&adopted_key, PodStateKind::Running).await;
    assert_eq!(h.instance(&adopted_key), Some(adopted_instance));
    assert_eq!(
        h.provider.get_pod_status(&orphan_key).await.unwrap().phase.as_deref(),
        Some("Failed")
    );
    h.wait_for(&fresh_key, PodStateKind::Running).await;

    // A second pass finds nothing to do.
    let again = h.provider.reconcile().await.unwrap();
    assert_eq!(again, marketlet_provider::ReconcileReport::default());
    assert_eq!(h.market.terminate_calls(adopted_instance), 0);
}

#[tokio::test(start_paused = true)]
async fn reconcile_removes_pods_gone_from_cluster() {
    let h = Harness::new(MockMarketplace::new(offers(2)), settings());
    let key = h.create(&pod("stt-0", &[])).await.unwrap();
    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();

    h.cluster.remove_pod(&key).await.unwrap();
    let report = h.provider.reconcile().await.unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(h.market.terminate_calls(id), 1);
    assert!(!h.provider.registry().contains(&key));
}

#[tokio::test(start_paused = true)]
async fn reconcile_drops_queued_pods_gone_from_cluster() {
    let h = Harness::new(
        MockMarketplace::new(offers(2)),
        ProviderSettings {
            max_active_instances: 1,
            ..settings()
        },
    );
    let running = h.create(&pod("stt-0", &[])).await.unwrap();
    h.wait_for(&running, PodStateKind::Running).await;
    let queued = pod("stt-1", &[]);
    assert!(h.create(&queued).await.is_err());
    let queued_key = pod_key(&queued).unwrap();
    assert_eq!(h.provider.deferred(), vec![queued_key.clone()]);

    h.cluster.remove_pod(&queued_key).await.unwrap();
    h.provider.reconcile().await.unwrap();
    assert!(h.provider.deferred().is_empty());

    h.provider.delete_pod(&running).await.unwrap();
    assert!(!h.provider.registry().contains(&queued_key));
    assert_eq!(h.market.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_create_response_keeps_created_instance() {
    let h = Harness::new(MockMarketplace::new(offers(3)), settings());
    h.market
        .lose_next_create_response(MarketError::Unavailable("create timed out".to_string()));
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();
    assert_eq!(h.market.create_calls(), 1);
    assert_eq!(h.market.offer_of(id), Some(OfferId::new(1)));
    assert_eq!(h.market.live_instances(), vec![id]);

    h.provider.delete_pod(&key).await.unwrap();
    assert!(h.market.live_instances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconcile_terminates_instance_not_attached_to_its_pod() {
    let h = Harness::new(MockMarketplace::new(offers(2)), settings());
    let key = h.create(&pod("stt-0", &[])).await.unwrap();
    h.wait_for(&key, PodStateKind::Running).await;
    let id = h.instance(&key).unwrap();

    let tag = OwnerTag::derive(&key, "uid-stt-0");
    let stray = h.market.insert_instance(&tag.label(), &[8000]);

    let report = h.provider.reconcile().await.unwrap();
    assert_eq!(report.leaked, 1);
    assert_eq!(h.market.terminate_calls(stray), 1);
    assert_eq!(h.market.terminate_calls(id), 0);
    assert_eq!(h.market.live_instances(), vec![id]);
    assert_eq!(h.kind(&key), Some(PodStateKind::Running));
}

#[tokio::test(start_paused = true)]
async fn provision_timeout_fails_and_terminates() {
    let h = Harness::new(
        MockMarketplace::new(offers(2)).with_ready_after_polls(1_000_000),
        ProviderSettings {
            provision_timeout: Duration::from_secs(30),
            ..settings()
        },
    );
    let key = h.create(&pod("stt-0", &[])).await.unwrap();

    h.wait_for(&key, PodStateKind::Failed).await;
    assert_eq!(h.market.create_calls(), 1);
    assert_eq!(h.market.total_terminate_calls(), 1);
    assert!(h.market.live_instances().is_empty());
    assert_eq!(h.provider.registry().active(), 0);
    assert_eq!(h.cluster.last_status(&key).unwrap().phase.as_deref(), Some("Failed"));
}

#[tokio::test(start_paused = true)]
async fn update_at_capacity_yields_slot_to_queued_pod() {
    let h = Harness::new(
        MockMarketplace::new(offers(3)),
        ProviderSettings {
            max_active_instances: 1,
            ..settings()
        },
    );
    let updated = h.create(&pod("stt-0", &[])).await.unwrap();
    h.wait_for(&updated, PodStateKind::Running).await;
    let queued = pod("stt-1", &[]);
    assert!(h.create(&queued).await.is_err());
    let queued_key = pod_key(&queued).unwrap();

    let err = h
        .provider
        .update_pod(&pod("stt-0", &[(annotations::MAX_PRICE, "0.5")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::CapacityExceeded { limit: 1 }));

    assert!(h.provider.registry().contains(&queued_key));
    assert_eq!(h.provider.deferred(), vec![updated]);
    h.wait_for(&queued_key, PodStateKind::Running).await;
    assert_eq!(h.market.live_instances().len(), 1);
}
