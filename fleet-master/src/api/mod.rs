use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/runners", get(list_runners))
        .route("/admin/handoff/{index}", post(request_handoff))
        .route("/admin/handoff", delete(cancel_handoff))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /admin/runners: last published fleet snapshot
pub async fn list_runners(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.snapshot().await)
}

/// POST /admin/handoff/:index: move leadership at the next safe cycle
pub async fn request_handoff(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
) -> impl IntoResponse {
    match state.request_handoff(index).await {
        Ok(previous) => {
            info!(runner = index, ?previous, "hand-off requested");
            Json(serde_json::json!({ "status": "pending", "target": index })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// DELETE /admin/handoff
pub async fn cancel_handoff(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.cancel_handoff().await {
        Some(index) => {
            info!(runner = index, "hand-off cancelled");
            Json(serde_json::json!({ "status": "cancelled", "target": index })).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::{Config, FileConfig};

    fn state() -> Arc<AppState> {
        let config = Config::from_sources(FileConfig::default(), |_| None).unwrap();
        AppState::new(&crate::runner::slots(&config))
    }

    async fn send(app: Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = send(router(state()), Method::GET, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_runners_returns_snapshot() {
        let (status, body) = send(router(state()), Method::GET, "/admin/runners").await;

        assert_eq!(status, StatusCode::OK);
        let snapshot: shared_types::FleetSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.slots.len(), 3);
        assert_eq!(snapshot.slots[1].unit, "jorm_runner@1.service");
    }

    #[tokio::test]
    async fn test_handoff_out_of_range_is_bad_request() {
        let state = state();
        let (status, _) = send(router(Arc::clone(&state)), Method::POST, "/admin/handoff/7").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.handoff_target().await, None);
    }

    #[tokio::test]
    async fn test_handoff_request_and_cancel() {
        let state = state();

        let (status, _) = send(router(Arc::clone(&state)), Method::POST, "/admin/handoff/2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.handoff_target().await, Some(2));

        let (status, body) = send(router(Arc::clone(&state)), Method::DELETE, "/admin/handoff").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["target"], 2);
        assert_eq!(state.handoff_target().await, None);

        let (status, _) = send(router(state), Method::DELETE, "/admin/handoff").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
