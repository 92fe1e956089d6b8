//! Minimal internal HTTP surface: `/health` for liveness probes and
//! `/snapshot` for a raw dump of State Memory. Stands in for the registry's
//! live-status surface, which is out of scope here.

use std::net::SocketAddr;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::{now_unix, SharedStateMemory};

pub fn router(state: SharedStateMemory) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/snapshot", get(snapshot))
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    ok: bool,
    ts: i64,
}

async fn health() -> impl IntoResponse {
    Json(Health { ok: true, ts: now_unix() })
}

async fn snapshot(State(state): State<SharedStateMemory>) -> impl IntoResponse {
    Json(state.get_snapshot().await)
}

pub async fn serve(state: SharedStateMemory, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind http port");

    info!(%addr, "internal http surface listening");

    axum::serve(listener, router(state)).await.expect("http server error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMemory;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_returns_ok_true() {
        let state: SharedStateMemory = Arc::new(StateMemory::new());
        let app = router(state);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json["ts"].is_i64());
    }

    #[tokio::test]
    async fn snapshot_reflects_state_memory() {
        let state: SharedStateMemory = Arc::new(StateMemory::new());
        state.update_sensor("lab1", "s1", 22.0, 55.0, 100).await;
        let app = router(state);
        let req = Request::builder().uri("/snapshot").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["lab1"]["sensors"]["s1"]["t"], 22.0);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let state: SharedStateMemory = Arc::new(StateMemory::new());
        let app = router(state);
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
