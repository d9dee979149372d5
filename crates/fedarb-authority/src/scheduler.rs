//! # Compaction Scheduler
//!
//! A tokio task that calls [`ArbitrationAuthority::compact`] for as long as
//! the authority runs. It wakes when the next deferred decision is due or
//! after one cleanup interval, whichever is sooner, and exits when the
//! shutdown signal flips to `true` or its sender is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::authority::ArbitrationAuthority;

const MIN_WAIT: Duration = Duration::from_millis(1);

/// Spawn the compaction loop.
pub fn spawn_compaction_task(
    authority: Arc<ArbitrationAuthority>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("compaction task started");
        loop {
            let next_due = authority.compact();
            let cleanup = authority.config().snapshot().cleanup_interval;
            let wait = next_due.map_or(cleanup, |due| due.min(cleanup)).max(MIN_WAIT);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("compaction task stopped");
    })
}
