// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::application::orchestrator::Orchestrator;
use crate::application::status::{ClusterState, StatusSnapshot};
use crate::domain::cluster::ClusterId;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Read-only status surface:
/// `GET /status` returns the full snapshot, `GET /clusters/{id}` one cluster.
pub fn app(orchestrator: Arc<Orchestrator>) -> Router {
    let state = Arc::new(AppState { orchestrator });

    Router::new()
        .route("/status", get(status))
        .route("/clusters/{id}", get(cluster))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusSnapshot::capture(&state.orchestrator))
}

async fn cluster(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> impl IntoResponse {
    let id = ClusterId::new(id);
    match state.orchestrator.cluster(&id) {
        Some(cluster) => (StatusCode::OK, Json(json!(ClusterState::from(&cluster)))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Cluster {id} not found") })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::{AgentSlot, Cluster, ClusterKind};
    use crate::domain::config::OrchestratorConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn orchestrator() -> Arc<Orchestrator> {
        let orch = Arc::new(Orchestrator::new(OrchestratorConfig::default()).unwrap());
        orch.register_cluster(Cluster::new("core", "Core", ClusterKind::Core))
            .await
            .unwrap();
        orch.register_agent(&ClusterId::from("core"), AgentSlot::new("c1", ["execution"]))
            .await
            .unwrap();
        orch
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (status, body) = get_json(app(orchestrator().await), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clusters"]["core"]["kind"], "core");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_cluster_endpoint() {
        let app = app(orchestrator().await);
        let (status, body) = get_json(app.clone(), "/clusters/core").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agents"][0]["id"], "c1");

        let (status, body) = get_json(app, "/clusters/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }
}
