use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::WebhookError;
use crate::payload::{classify, Admission, EVENT_TYPE_HEADER};
use crate::signature::{self, SIGNATURE_HEADER};
use crate::AppState;

/// Largest webhook body accepted. GitHub caps deliveries at 25 MB, but review
/// events are a few kilobytes.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(rename = "eventId", skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Address the request came from, honouring `X-Forwarded-For` only when
/// the service is configured to sit behind a proxy.
fn client_ip(request: &Request, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Admission gate run before the handler: allow-list, rate limit, then
/// signature over the raw body.
async fn admit_webhook(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, WebhookError> {
    let ip = client_ip(&request, state.trust_proxy);

    if let Some(allowlist) = &state.ip_allowlist {
        let allowed = ip.is_some_and(|ip| allowlist.allows(ip));
        if !allowed {
            warn!(client = ?ip, "Rejecting webhook from address outside allow-list");
            return Err(WebhookError::Forbidden);
        }
    }

    let client_key = ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    if !state.rate_limiter.is_allowed(&client_key) {
        return Err(WebhookError::RateLimited);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| WebhookError::PayloadTooLarge)?;

    let signature_header = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    if let Err(e) = signature::verify(&bytes, signature_header, &state.webhook_secret) {
        error!(client = %client_key, "Invalid webhook signature: {}", e);
        return Err(e.into());
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    let event_type = headers.get(EVENT_TYPE_HEADER).and_then(|h| h.to_str().ok());
    let delivery = headers
        .get(DELIVERY_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("-");

    let kind = match classify(event_type, &body)? {
        Admission::Enqueue(kind) => kind,
        Admission::Ignore(reason) => {
            info!(delivery, "{}", reason);
            return Ok(Json(WebhookResponse {
                success: true,
                message: reason,
                event_id: None,
            }));
        }
    };

    // Only acknowledge once the event is durably recorded
    let event_id = state
        .store
        .enqueue(kind.clone(), body.to_vec())
        .await
        .map_err(|e| {
            error!(delivery, "Failed to record webhook event: {}", e);
            WebhookError::Internal(e.to_string())
        })?;

    info!(delivery, event_id = %event_id, kind = %kind, "Webhook accepted");
    state.queue.submit(event_id.clone());

    Ok(Json(WebhookResponse {
        success: true,
        message: "Event queued".to_string(),
        event_id: Some(event_id),
    }))
}

async fn unknown_provider(Path(provider): Path<String>) -> WebhookError {
    WebhookError::UnknownProvider(provider)
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/webhooks/github",
            post(github_webhook_handler).route_layer(middleware::from_fn_with_state(
                middleware_state,
                admit_webhook,
            )),
        )
        .route("/webhooks/:provider", post(unknown_provider))
}
