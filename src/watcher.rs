//! Change-feed watcher keeping the inactive-sensor cache current.
//!
//! Each cycle opens the store's activation-flag change feed, then loads a full
//! snapshot into the cache, then applies events as they arrive. Opening the
//! feed before the snapshot means a flag flip between the two is never lost;
//! on reconnect the snapshot is reloaded to cover events missed while the feed
//! was down.
//!
//! The cache is eventually consistent with the store: a flip becomes visible
//! to the router only once its event has been applied here.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::InactiveEntityCache;
use crate::error::{IngestError, IngestResult, StoreError};
use crate::store::{ActiveFlagChange, ActiveFlagStream, SensorStore};

/// Default wait between failed watch cycles.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Sole writer of the [`InactiveEntityCache`].
pub struct ChangeFeedWatcher {
    store: Arc<dyn SensorStore>,
    cache: Arc<InactiveEntityCache>,
    retry_interval: Duration,
    cancel: CancellationToken,
}

impl ChangeFeedWatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn SensorStore>,
        cache: Arc<InactiveEntityCache>,
        retry_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            retry_interval,
            cancel,
        }
    }

    /// Replace the cache contents with the store's current inactive set.
    pub async fn load_snapshot(&self) -> Result<usize, StoreError> {
        let ids = self.store.find_inactive_ids().await?;
        let count = ids.len();
        self.cache.load(ids);
        Ok(count)
    }

    /// Apply one change event to the cache.
    pub fn apply(&self, change: &ActiveFlagChange) {
        if change.active {
            self.cache.remove(&change.id);
        } else {
            self.cache.add(&change.id);
        }
    }

    /// Run until cancelled, retrying failed cycles forever.
    ///
    /// The cache is cleared on exit.
    pub async fn run(self) {
        info!("inactive sensor watcher starting");

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            match self.run_cycle().await {
                Err(IngestError::Cancelled) => break,
                Ok(()) => warn!(cycle, "change feed ended; reconnecting"),
                Err(e) => error!(cycle, error = %e, "error watching sensor activation changes"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        self.cache.clear();
        info!("inactive sensor watcher stopped");
    }

    async fn run_cycle(&self) -> IngestResult<()> {
        let mut feed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            feed = self.store.watch_active_flag_changes() => feed?,
        };

        let loaded = tokio::select! {
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            loaded = self.load_snapshot() => loaded?,
        };
        info!(inactive = loaded, "watching sensor activation changes");

        self.consume(&mut feed).await
    }

    async fn consume(&self, feed: &mut ActiveFlagStream) -> IngestResult<()> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                next = feed.next() => next,
            };

            match next {
                Some(Ok(change)) => {
                    info!(sensor_id = %change.id, active = change.active, "activation change detected");
                    self.apply(&change);
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}
