//! Marketlet - virtual Kubernetes node backed by a GPU marketplace.
//!
//! Registers the virtual node, adopts instances left by a previous run,
//! then follows pods bound to the node until shut down.
//!
//! # HTTP Endpoints
//!
//! ## Health & Readiness
//! - `GET /health` - Liveness
//! - `GET /ready` - Ready once the node is registered and the first
//!   reconciliation finished
//! - `GET /metrics` - Prometheus metrics
//!
//! ## Operator
//! - `GET /v1/pods` - Pods managed by this node
//! - `GET /v1/pods/:namespace/:name` - Kubernetes status of one pod
//! - `POST /v1/reconcile` - Run a reconciliation pass now

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use marketlet_core::PodKey;
use marketlet_market::{HttpMarketplace, Marketplace};
use marketlet_provider::node::{register_node, run_heartbeat};
use marketlet_provider::{
    run_pod_watcher, ClusterClient, HttpProbe, KubeCluster, Metrics, NodeProvider, PodDispatcher, PodLifecycle,
    ProviderConfig, ProviderError,
};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    provider: NodeProvider,
    ready: Arc<AtomicBool>,
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "marketlet",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.provider.metrics().render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================================
// Operator Endpoints
// ============================================================================

/// Error response format.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

fn error_response(e: &ProviderError) -> axum::response::Response {
    let code = e.http_status_code();
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse {
            error: e.to_string(),
            code,
        }),
    )
        .into_response()
}

/// GET /v1/pods
async fn pods_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.provider.get_pods().await {
        Ok(pods) => Json(pods).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /v1/pods/:namespace/:name
async fn pod_status_handler(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.provider.get_pod_status(&PodKey::new(namespace, name)).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /v1/reconcile
async fn reconcile_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.provider.reconcile().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Manual reconciliation failed");
            error_response(&e)
        }
    }
}

// ============================================================================
// Router
// ============================================================================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & readiness
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        // Operator
        .route("/v1/pods", get(pods_handler))
        .route("/v1/pods/:namespace/:name", get(pod_status_handler))
        .route("/v1/reconcile", post(reconcile_handler))
        .with_state(state)
}

async fn run_reconcile_loop(provider: NodeProvider, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(provider.settings().reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already reconciled.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = provider.reconcile().await {
            tracing::error!(error = %e, "Periodic reconciliation failed");
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketlet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Marketlet");

    let config = ProviderConfig::from_env()?;
    let settings = config.provider.clone();
    tracing::info!(
        node = %settings.node_name,
        marketplace = %config.marketplace.base_url,
        max_active_instances = settings.max_active_instances,
        "Loaded configuration"
    );

    let market: Arc<dyn Marketplace> = Arc::new(HttpMarketplace::new(config.marketplace.clone())?);
    let kube_cluster = KubeCluster::new().await?;
    let client = kube_cluster.client();
    let cluster: Arc<dyn ClusterClient> = Arc::new(kube_cluster);
    tracing::info!("Connected to Kubernetes cluster");

    let probe = Arc::new(HttpProbe::new(&settings.health)?);
    let metrics = Metrics::new()?;
    let provider = NodeProvider::new(settings.clone(), market, Arc::clone(&cluster), probe, metrics);
    let cancel = provider.shutdown_token();
    let ready = Arc::new(AtomicBool::new(false));

    // Start serving health before the slower bring-up.
    let state = AppState {
        provider: provider.clone(),
        ready: Arc::clone(&ready),
    };
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    register_node(cluster.as_ref(), &settings).await?;
    let report = provider.reconcile().await?;
    tracing::info!(adopted = report.adopted, orphaned = report.orphaned, "Startup reconciliation complete");
    ready.store(true, Ordering::SeqCst);

    let dispatcher = PodDispatcher::new(Arc::new(provider.clone()), Arc::clone(&cluster));
    tokio::spawn(run_pod_watcher(client, settings.node_name.clone(), dispatcher, cancel.clone()));
    tokio::spawn(run_heartbeat(Arc::clone(&cluster), settings, cancel.clone()));
    tokio::spawn(run_reconcile_loop(provider.clone(), cancel.clone()));
    tracing::info!("Started pod watcher, heartbeat and reconciliation loop");

    shutdown_signal(cancel.clone()).await;
    provider.shutdown();
    server.await??;

    tracing::info!("Marketlet stopped");
    Ok(())
}
