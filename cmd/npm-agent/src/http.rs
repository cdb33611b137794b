//! Debug and metrics HTTP surface (`spec.md` §6): `/npm/v1/debug/manager`, `/node-metrics`,
//! `/cluster-metrics`, `/health`, served from the same [`Agent`] the controllers share.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, Router};

use npm_controllers::Agent;
use npm_debug::DebugManagerResponse;

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/npm/v1/debug/manager", get(debug_manager))
        .route("/node-metrics", get(node_metrics))
        .route("/cluster-metrics", get(cluster_metrics))
        .route("/health", get(health))
        .with_state(agent)
}

async fn debug_manager(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    let snapshot = agent.cache.snapshot().await;
    let node_name = npm_k8s_util::types::node_name();
    Json(DebugManagerResponse::new(snapshot, node_name))
}

async fn node_metrics(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        agent.metrics.encode_node(),
    )
}

async fn cluster_metrics(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        agent.metrics.encode_cluster(),
    )
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}
