//! Health and service descriptor endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::event_store::QueueStats;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub queue: QueueStats,
}

/// Queue depth is the only view of eventual outcomes, since the webhook
/// response reflects admission alone.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let timestamp = chrono::Utc::now().to_rfc3339();
    match state.store.get_stats().await {
        Ok(queue) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                timestamp,
                queue,
            }),
        ),
        Err(e) => {
            error!("Failed to read queue stats: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    timestamp,
                    queue: QueueStats::default(),
                }),
            )
        }
    }
}

pub async fn descriptor_handler() -> Json<Value> {
    Json(json!({
        "service": "patchbot",
        "version": crate::get_service_version(),
        "description": "Applies pull request review feedback with an external coding agent",
        "endpoints": [
            {
                "path": "/webhooks/github",
                "method": "POST",
                "description": "GitHub webhook receiver for pull request reviews",
                "authentication": "GitHub webhook signature (X-Hub-Signature-256)"
            },
            {
                "path": "/health",
                "method": "GET",
                "description": "Health check with queue depth",
                "authentication": "None"
            },
            {
                "path": "/",
                "method": "GET",
                "description": "Service information",
                "authentication": "None"
            }
        ]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventKind, EventStore};
    use crate::rate_limit::{RateLimitConfig, RateLimiter};
    use crate::worker::ReviewQueue;
    use axum::body::Body;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let (queue, _rx) = ReviewQueue::channel();
        Arc::new(AppState {
            webhook_secret: "s".to_string(),
            ip_allowlist: None,
            trust_proxy: false,
            rate_limiter: RateLimiter::new(RateLimitConfig::default()),
            store: Arc::new(EventStore::new_in_memory(0).unwrap()),
            queue,
        })
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let request = axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = crate::app_router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_queue() {
        let state = state();
        let a = state.store.enqueue(EventKind::Ping, Vec::new()).await.unwrap();
        let b = state.store.enqueue(EventKind::Ping, Vec::new()).await.unwrap();
        state.store.enqueue(EventKind::Ping, Vec::new()).await.unwrap();
        state.store.mark_processing(&a).await.unwrap();
        state.store.mark_processing(&b).await.unwrap();
        state.store.mark_failed(&b, "boom").await.unwrap();

        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
        assert_eq!(
            body["queue"],
            json!({"pending": 1, "processing": 1, "failed": 1})
        );
    }

    #[tokio::test]
    async fn test_descriptor() {
        let (status, body) = get(state(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "patchbot");
        assert!(body["endpoints"].as_array().unwrap().len() >= 3);
    }
}
