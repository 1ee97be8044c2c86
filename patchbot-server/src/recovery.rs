//! Startup recovery of interrupted work.
//!
//! Anything still `pending` or `processing` when the process starts was cut
//! short by a crash or shutdown. Steps of an attempt are not resumable, so
//! each such event is simply attempted again from the beginning. Completion
//! markers on the remote keep the repeat from redoing addressed comments.

use tracing::{info, warn};

use crate::event_store::{EventStatus, EventStore, StoreError};
use crate::worker::ReviewQueue;

/// Re-submit every unfinished event in admission order.
///
/// Must run before the HTTP listener starts so recovered events are queued
/// ahead of new deliveries.
pub async fn recover_pending_events(
    store: &EventStore,
    queue: &ReviewQueue,
) -> Result<usize, StoreError> {
    info!("Checking for unfinished events...");

    let events = store.get_pending_events().await?;
    if events.is_empty() {
        info!("No unfinished events found");
        return Ok(0);
    }

    let orphaned = events
        .iter()
        .filter(|e| e.status == EventStatus::Processing)
        .count();
    if orphaned > 0 {
        warn!(
            "{} event(s) were mid-processing when the previous instance stopped",
            orphaned
        );
    }

    for event in &events {
        info!(
            event_id = %event.id,
            kind = %event.kind,
            status = %event.status,
            retry_count = event.retry_count,
            "Re-queueing event"
        );
        queue.submit(event.id.clone());
    }

    info!("Recovered {} event(s)", events.len());
    Ok(events.len())
}
