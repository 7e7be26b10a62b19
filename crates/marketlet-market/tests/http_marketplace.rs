//! `HttpMarketplace` against a stub marketplace server.

use std::collections::BTreeMap;
use std::time::Duration;

use marketlet_core::{InstanceId, OfferId};
use marketlet_market::{
    HttpMarketplace, InstanceStatus, LaunchSpec, MarketError, Marketplace, MarketplaceConfig,
    RetryPolicy, SearchCriteria,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpMarketplace {
    let mut config = MarketplaceConfig::new(server.uri(), "test-key");
    config.retry = RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(20));
    config.request_timeout = Duration::from_secs(2);
    HttpMarketplace::new(config).unwrap()
}

fn offer_json(id: u64, price: f64) -> serde_json::Value {
    json!({
        "id": id,
        "gpu_name": "RTX 4090",
        "num_gpus": 1,
        "gpu_ram": 24564.0,
        "dph_total": price,
        "reliability2": 0.98,
        "geolocation": "US-CA",
        "verified": true,
        "inet_down": 800.0,
        "inet_up": 400.0,
        "host_run_time": 360_000.0
    })
}

fn launch_spec() -> LaunchSpec {
    LaunchSpec {
        image: "ghcr.io/acme/stt:1.2".to_string(),
        env: BTreeMap::from([("MODEL".to_string(), "large-v3".to_string())]),
        ports: vec![8080],
        disk_gb: 40,
        args: Vec::new(),
        onstart: None,
        label: "marketlet-0123456789abcdef0123456789abcdef".to_string(),
    }
}

#[tokio::test]
async fn search_sends_filters_and_parses_offers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bundles/"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "q": { "gpu_name": { "in": ["RTX 4090"] }, "dph_total": { "lte": 0.5 } }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "offers": [offer_json(1, 0.3), offer_json(2, 0.45)] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let criteria = SearchCriteria {
        gpu_names: vec!["RTX 4090".to_string()],
        max_price_per_hour: Some(0.5),
        ..SearchCriteria::default()
    };
    let offers = client(&server).search_offers(&criteria).await.unwrap();

    assert_eq!(offers.len(), 2);
    assert_eq!(offers[0].id, OfferId::new(1));
    assert!((offers[1].price_per_hour - 0.45).abs() < 1e-9);
    assert!(offers[0].host_uptime_hours > 99.0);
}

#[tokio::test]
async fn search_retries_after_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bundles/"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bundles/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "offers": [offer_json(7, 0.2)] })))
        .mount(&server)
        .await;

    let offers = client(&server)
        .search_offers(&SearchCriteria::default())
        .await
        .unwrap();
    assert_eq!(offers[0].id, OfferId::new(7));
}

#[tokio::test]
async fn persistent_server_errors_surface_as_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bundles/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server)
        .search_offers(&SearchCriteria::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Unavailable(_)));
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instances/"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).list_instances().await.unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized));
}

#[tokio::test]
async fn create_returns_new_contract() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/asks/42/"))
        .and(body_partial_json(json!({
            "image": "ghcr.io/acme/stt:1.2",
            "disk": 40,
            "label": "marketlet-0123456789abcdef0123456789abcdef",
            "env": { "MODEL": "large-v3" }
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "success": true, "new_contract": 9001 })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let market = client(&server);
    Mock::given(method("POST"))
        .and(path("/bundles/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "offers": [offer_json(42, 0.3)] })))
        .mount(&server)
        .await;

    let offer = market
        .search_offers(&SearchCriteria::default())
        .await
        .unwrap()
        .remove(0);
    let id = market.create_instance(&offer, &launch_spec()).await.unwrap();
    assert_eq!(id, InstanceId::new(9001));
}

#[tokio::test]
async fn lost_offer_race_is_offer_unavailable_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bundles/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "offers": [offer_json(42, 0.3)] })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/asks/42/"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "success": false,
            "error": "no_such_ask",
            "msg": "Instance type is no longer available."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let market = client(&server);
    let offer = market
        .search_offers(&SearchCriteria::default())
        .await
        .unwrap()
        .remove(0);
    let err = market.create_instance(&offer, &launch_spec()).await.unwrap_err();
    assert!(matches!(err, MarketError::OfferUnavailable(id) if id == OfferId::new(42)));
}

#[tokio::test]
async fn get_instance_maps_status_and_missing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instances/9001/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": {
                "id": 9001,
                "label": "marketlet-abc",
                "public_ipaddr": "203.0.113.7",
                "ports": { "8080/tcp": [{ "HostIp": "0.0.0.0", "HostPort": "41234" }] },
                "actual_status": "running"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/instances/404/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let market = client(&server);
    let instance = market.get_instance(InstanceId::new(9001)).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(
        instance.endpoint_for(8080),
        Some(("203.0.113.7".to_string(), 41234))
    );

    let err = market.get_instance(InstanceId::new(404)).await.unwrap_err();
    assert!(matches!(err, MarketError::InstanceNotFound(_)));
}

#[tokio::test]
async fn terminate_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/instances/1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/instances/2/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let market = client(&server);
    market.terminate_instance(InstanceId::new(1)).await.unwrap();
    market.terminate_instance(InstanceId::new(2)).await.unwrap();
}

#[tokio::test]
async fn list_instances_returns_labels() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/instances/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                { "id": 1, "label": "marketlet-aa", "actual_status": "running" },
                { "id": 2, "label": null, "actual_status": "loading" }
            ]
        })))
        .mount(&server)
        .await;

    let instances = client(&server).list_instances().await.unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].label.as_deref(), Some("marketlet-aa"));
    assert_eq!(instances[1].status, InstanceStatus::Provisioning);
}
