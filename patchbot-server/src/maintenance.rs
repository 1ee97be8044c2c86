use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::AppState;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodic housekeeping: prunes idle rate-limiter clients every window and
/// deletes old completed events every hour.
pub async fn maintenance_loop(state: Arc<AppState>, completed_retention: Duration) {
    let mut cleanup = interval(state.rate_limiter.window());
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut purge = interval(PURGE_INTERVAL);
    purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cleanup.tick() => state.rate_limiter.cleanup(),
            _ = purge.tick() => purge_completed(&state, completed_retention).await,
        }
    }
}

async fn purge_completed(state: &AppState, retention: Duration) {
    match state.store.purge_completed(retention).await {
        Ok(0) => {}
        Ok(purged) => info!("Purged {} completed event(s)", purged),
        Err(e) => error!("Error purging completed events: {}", e),
    }
}
