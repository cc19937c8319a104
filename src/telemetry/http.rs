// src/telemetry/http.rs

//! Read-only HTTP status endpoint.
//!
//! Only GET routes exist; nothing reachable here can change service state.

use std::future::Future;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::{StateManager, StateSnapshot};
use crate::telemetry::metrics::{self, ServiceMetrics};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub services: Vec<StateSnapshot>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub services: Vec<ServiceMetrics>,
    pub timestamp: DateTime<Utc>,
}

/// GET /healthz
async fn healthz() -> &'static str {
    "ok"
}

/// GET /status
async fn list_status(State(state): State<StateManager>) -> Json<StatusResponse> {
    Json(StatusResponse {
        services: state.all(),
        timestamp: Utc::now(),
    })
}

/// GET /status/{id}
async fn service_status(
    State(state): State<StateManager>,
    Path(id): Path<String>,
) -> Result<Json<StateSnapshot>, StatusCode> {
    state.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// GET /metrics
async fn list_metrics(State(state): State<StateManager>) -> Json<MetricsResponse> {
    let now = Utc::now();
    Json(MetricsResponse {
        services: metrics::collect(&state, now).into_values().collect(),
        timestamp: now,
    })
}

pub fn router(state: StateManager) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(list_status))
        .route("/status/{id}", get(service_status))
        .route("/metrics", get(list_metrics))
        .with_state(state)
}

/// Serve the status endpoint on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: StateManager,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status endpoint listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
