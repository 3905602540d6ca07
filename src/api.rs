// src/api.rs
//! Operator HTTP surface: liveness, Prometheus scrape, queue inspection.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use crate::store::Store;

const DEFAULT_FAILED_LIMIT: u32 = 50;
const MAX_FAILED_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/failed", get(queue_failed))
        .with_state(state)
}

async fn metrics(State(state): State<ApiState>) -> Response {
    match &state.metrics {
        Some(h) => h.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn queue_stats(State(state): State<ApiState>) -> Response {
    match state.store.queue().stats(Utc::now()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => storage_unavailable(e),
    }
}

#[derive(Deserialize)]
struct FailedQuery {
    limit: Option<u32>,
}

async fn queue_failed(State(state): State<ApiState>, Query(q): Query<FailedQuery>) -> Response {
    let limit = q.limit.unwrap_or(DEFAULT_FAILED_LIMIT).min(MAX_FAILED_LIMIT);
    match state.store.queue().failed(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => storage_unavailable(e),
    }
}

fn storage_unavailable(e: crate::error::StorageError) -> Response {
    tracing::error!(error = %e, "api: store query failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
