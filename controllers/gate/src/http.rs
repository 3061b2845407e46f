//! Metrics and probe endpoints.
//!
//! - `GET /metrics` Prometheus text exposition
//! - `GET /healthz` liveness
//! - `GET /leader` readiness, true once caches are synced and workers run

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::ControllerError;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub leader: Arc<AtomicBool>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/leader", get(leader))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn metrics(State(state): State<HttpState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn leader(State(state): State<HttpState>) -> Response {
    if state.leader.load(Ordering::Acquire) {
        Json(json!({ "apiserver": { "leader": "true" } })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "apiserver": { "leader": "false" } })),
        )
            .into_response()
    }
}

/// Serve until `token` is cancelled.
pub async fn serve(addr: SocketAddr, state: HttpState, token: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics and probes on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> HttpState {
        HttpState {
            metrics: Arc::new(Metrics::new().unwrap()),
            leader: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get_body(router(state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_leader_follows_flag() {
        let state = state();
        let (status, _) = get_body(router(state.clone()), "/leader").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.leader.store(true, Ordering::Release);
        let (status, body) = get_body(router(state), "/leader").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"apiserver":{"leader":"true"}}"#);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = state();
        state.metrics.set_queue_depth(2);
        let (status, body) = get_body(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("maroonedpods_queue_depth 2"));
    }
}
