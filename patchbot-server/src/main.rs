use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use patchbot_server::agent::AgentRunner;
use patchbot_server::completion::CompletionTracker;
use patchbot_server::config::{parse_flag, Config};
use patchbot_server::event_store::EventStore;
use patchbot_server::github::GitHubClient;
use patchbot_server::maintenance::maintenance_loop;
use patchbot_server::rate_limit::RateLimiter;
use patchbot_server::recovery::recover_pending_events;
use patchbot_server::worker::{ReviewQueue, ReviewWorker, WorkerSettings};
use patchbot_server::worktree::WorktreeManager;
use patchbot_server::{app_router, get_service_version, AppState};

fn init_tracing() {
    // Read before Config so configuration errors are logged at the right level
    let level = if parse_flag(std::env::var("DEBUG").ok()) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting patchbot {}", get_service_version());

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Using event database: {}", config.event_db_path.display());
    let store = Arc::new(
        EventStore::new(&config.event_db_path, config.max_retries)
            .context("Failed to open event database")?,
    );

    let workspace = Arc::new(
        WorktreeManager::discover(&config.repo_dir, &config.worktree_dir)
            .await
            .context("Failed to locate the repository to work in")?,
    );

    let platform = Arc::new(
        GitHubClient::new(&config.github_api_url, &config.github_token)
            .context("Failed to create GitHub client")?,
    );

    let (queue, rx) = ReviewQueue::channel();

    // Queue interrupted work before anything new can arrive
    let recovered = recover_pending_events(&store, &queue)
        .await
        .context("Failed to recover pending events")?;
    if recovered > 0 {
        info!("Resuming {} event(s) from the previous run", recovered);
    }

    let worker = ReviewWorker::new(
        store.clone(),
        platform.clone(),
        CompletionTracker::new(
            platform.clone(),
            config.completion_reaction.clone(),
            config.completion_reactor.clone(),
        ),
        workspace,
        Arc::new(AgentRunner::new(config.agent.clone())),
        queue.clone(),
        WorkerSettings {
            commit_author: config.commit_author.clone(),
            auto_reply: config.auto_reply,
            retry_delay: config.retry_delay,
        },
    );
    tokio::spawn(worker.run(rx));

    let app_state = Arc::new(AppState {
        webhook_secret: config.webhook_secret.clone(),
        ip_allowlist: config.ip_allowlist.clone(),
        trust_proxy: config.trust_proxy,
        rate_limiter: RateLimiter::new(config.rate_limit.clone()),
        store,
        queue,
    });

    tokio::spawn(maintenance_loop(
        app_state.clone(),
        config.completed_retention,
    ));

    let app = app_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
