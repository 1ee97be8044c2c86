pub mod agent;
pub mod allowlist;
pub mod completion;
pub mod config;
pub mod error;
pub mod event_store;
pub mod github;
pub mod maintenance;
pub mod payload;
pub mod platform;
pub mod rate_limit;
pub mod recovery;
pub mod signature;
pub mod status;
pub mod webhook;
pub mod worker;
pub mod worktree;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::allowlist::IpAllowlist;
use crate::event_store::EventStore;
use crate::rate_limit::RateLimiter;
use crate::worker::ReviewQueue;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_service_version() -> String {
    // Explicit hash from the deployment pipeline wins over built's detection
    let hash = option_env!("PATCHBOT_GIT_HASH").or(built_info::GIT_COMMIT_HASH);
    match hash {
        Some(hash) if hash.len() >= 8 => hash[..8].to_string(),
        Some(hash) => hash.to_string(),
        None => built_info::PKG_VERSION.to_string(),
    }
}

/// Shared state for request handlers. Each instance is independent, so
/// tests can build as many as they like.
pub struct AppState {
    pub webhook_secret: String,
    pub ip_allowlist: Option<IpAllowlist>,
    pub trust_proxy: bool,
    pub rate_limiter: RateLimiter,
    pub store: Arc<EventStore>,
    pub queue: ReviewQueue,
}

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(status::descriptor_handler))
        .route("/health", get(status::health_handler))
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
