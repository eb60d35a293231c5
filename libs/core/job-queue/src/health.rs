//! Health, readiness and queue monitoring endpoints.
//!
//! - `/health`, `/healthz`: liveness
//! - `/ready`, `/readyz`: broker ping
//! - `/queue/info`: waiting and dead-lettered counts
//! - `POST /queue/retry?limit=N`: replay dead-lettered messages
//! - `/metrics`: Prometheus text

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use core_config::AppInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::broker::Publisher;
use crate::metrics;
use crate::queue::Queue;

/// Shared state for the health endpoints
#[derive(Clone)]
pub struct HealthState {
    pub publisher: Arc<dyn Publisher>,
    pub app: AppInfo,
    pub queue: Queue,
}

impl HealthState {
    pub fn new(publisher: Arc<dyn Publisher>, app: AppInfo, queue: Queue) -> Self {
        Self { publisher, app, queue }
    }
}

/// Liveness response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Always OK while the process serves requests
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app.name.to_string(),
        version: state.app.version.to_string(),
    })
}

/// OK when the broker answers a ping
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.publisher.ping().await {
        Ok(true) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "broker": "ok" }
            })),
        )),
        Ok(false) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "broker": "unreachable" }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "broker": format!("error: {}", e) }
            })),
        )),
    }
}

/// Waiting and dead-lettered counts for the worker's queue
pub async fn queue_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let sizes = async {
        let size = state.publisher.get_queue_size(&state.queue, false).await?;
        let failed = state.publisher.get_queue_size(&state.queue, true).await?;
        Ok::<_, crate::error::QueueError>((size, failed))
    };

    match sizes.await {
        Ok((size, failed)) => Ok(Json(json!({
            "queue": state.queue.name(),
            "namespace": state.queue.namespace(),
            "size": size,
            "failed": failed,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("Failed to get queue size: {}", e) })),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryParams {
    /// Messages to replay; all of them when absent
    pub limit: Option<usize>,
}

/// Move dead-lettered messages back onto the queue
pub async fn retry_handler(
    State(state): State<HealthState>,
    Query(params): Query<RetryParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.publisher.retry(&state.queue, params.limit).await {
        Ok(()) => Ok(Json(json!({
            "success": true,
            "queue": state.queue.name(),
            "limit": params.limit,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Prometheus text format
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/info", get(queue_info_handler))
        .route("/queue/retry", post(retry_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockPublisher;
    use crate::error::QueueError;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(publisher: MockPublisher) -> Router {
        let app = AppInfo {
            name: "queue-worker",
            version: "0.1.0",
        };
        health_router(HealthState::new(
            Arc::new(publisher),
            app,
            Queue::with_namespace("emails", "app").unwrap(),
        ))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_app() {
        let response = router(MockPublisher::new())
            .oneshot(get_request("/healthz"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "queue-worker");
    }

    #[tokio::test]
    async fn test_ready_follows_ping() {
        let mut up = MockPublisher::new();
        up.expect_ping().returning(|| Ok(true));
        let response = router(up).oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut down = MockPublisher::new();
        down.expect_ping().returning(|| Ok(false));
        let response = router(down).oneshot(get_request("/readyz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["checks"]["broker"], "unreachable");
    }

    #[tokio::test]
    async fn test_queue_info() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_get_queue_size()
            .returning(|_, failed| Ok(if failed { 2 } else { 5 }));

        let response = router(publisher).oneshot(get_request("/queue/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["queue"], "emails");
        assert_eq!(body["size"], 5);
        assert_eq!(body["failed"], 2);
    }

    #[tokio::test]
    async fn test_queue_info_error() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_get_queue_size()
            .returning(|_, _| Err(QueueError::Connection("down".into())));

        let response = router(publisher).oneshot(get_request("/queue/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_retry_passes_limit() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_retry()
            .withf(|queue, limit| queue.name() == "emails" && *limit == Some(3))
            .times(1)
            .returning(|_, _| Ok(()));

        let request = Request::builder()
            .method("POST")
            .uri("/queue/retry?limit=3")
            .body(Body::empty())
            .unwrap();
        let response = router(publisher).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["limit"], 3);
    }
}
