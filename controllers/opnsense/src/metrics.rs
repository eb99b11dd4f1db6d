//! Prometheus metrics and the probe server.

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Controller metrics, registered on their own registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    passes: IntCounterVec,
    changes: IntCounterVec,
    managed: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let passes = IntCounterVec::new(
            Opts::new("opnsense_controller_passes_total", "Reconciliation passes by outcome"),
            &["plugin", "outcome"],
        )?;
        let changes = IntCounterVec::new(
            Opts::new("opnsense_controller_appliance_changes_total", "Records created, updated or deleted on the appliance"),
            &["plugin", "collection", "operation"],
        )?;
        let managed = IntGaugeVec::new(
            Opts::new("opnsense_controller_managed_records", "Records owned after the last successful pass"),
            &["plugin"],
        )?;

        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(changes.clone()))?;
        registry.register(Box::new(managed.clone()))?;

        Ok(Self { registry, passes, changes, managed })
    }

    pub fn record_pass(&self, plugin: &str, outcome: &str) {
        self.passes.with_label_values(&[plugin, outcome]).inc();
    }

    pub fn record_change(&self, plugin: &str, collection: &str, operation: &str) {
        self.changes.with_label_values(&[plugin, collection, operation]).inc();
    }

    pub fn set_managed(&self, plugin: &str, count: usize) {
        self.managed.with_label_values(&[plugin]).set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Text exposition of every metric.
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()).into())
    }
}

/// Tracks which plugins still have to finish their first pass attempt.
#[derive(Debug, Default)]
pub struct Readiness {
    pending: Mutex<BTreeSet<String>>,
}

impl Readiness {
    pub fn new<I, S>(plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { pending: Mutex::new(plugins.into_iter().map(Into::into).collect()) }
    }

    /// Mark a plugin as having attempted a pass, successful or not.
    pub fn attempted(&self, plugin: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.remove(plugin) && pending.is_empty() {
            info!("All plugins attempted their first pass, controller ready");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

#[derive(Clone)]
struct ProbeState {
    metrics: Metrics,
    readiness: Arc<Readiness>,
}

/// `/healthz`, `/readyz` and `/metrics`.
pub fn probe_routes(metrics: Metrics, readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(ProbeState { metrics, readiness })
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for first pass")
    }
}

async fn metrics_text(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve the probe routes until the listener fails.
pub async fn serve(addr: SocketAddr, metrics: Metrics, readiness: Arc<Readiness>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Probe server started");
    axum::serve(listener, probe_routes(metrics, readiness)).await?;
    Ok(())
}
