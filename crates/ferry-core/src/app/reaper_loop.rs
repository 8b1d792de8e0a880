//! ReaperLoop - stale claim の定期回収
//!
//! Every store access already recovers stale claims; this loop only makes
//! recovery happen when nothing else touches the store for a while.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ports::QueueStore;

/// Reaper handle.
/// - `request_shutdown()` でループが止まる（実行中の recover は完了させる）
/// - `shutdown_and_join()` で終了を待てる
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    pub fn spawn(store: Arc<dyn QueueStore>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            reaper_loop(store, interval, &mut shutdown_rx).await;
        });

        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Reaper task ended abnormally");
        }
    }
}

async fn reaper_loop(
    store: Arc<dyn QueueStore>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::debug!(interval_ms = interval.as_millis() as u64, "Reaper started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped: nobody can stop us anymore, so stop now
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        match store.recover_stale().await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "Reaper recovered stale claims"),
            Err(e) => tracing::warn!(error = %e, "Reaper pass failed"),
        }
    }

    tracing::debug!("Reaper stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::domain::{ItemId, ItemState, Metadata, StateFilter, StoreError, UploadItem};
    use crate::observability::QueueCounts;
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::queue::{InMemoryQueueStore, StoreOptions};

    /// Delegates to an in-memory store and counts reaper passes.
    struct CountingStore {
        inner: InMemoryQueueStore,
        passes: AtomicUsize,
    }

    #[async_trait]
    impl QueueStore for CountingStore {
        async fn enqueue(&self, content_ref: &str, metadata: Metadata) -> Result<ItemId, StoreError> {
            self.inner.enqueue(content_ref, metadata).await
        }
        async fn count(&self, filter: StateFilter) -> Result<usize, StoreError> {
            self.inner.count(filter).await
        }
        async fn claim_next(&self, limit: usize) -> Result<Vec<UploadItem>, StoreError> {
            self.inner.claim_next(limit).await
        }
        async fn mark_done(&self, claimed: &UploadItem) -> Result<(), StoreError> {
            self.inner.mark_done(claimed).await
        }
        async fn mark_failed(
            &self,
            claimed: &UploadItem,
            error: &str,
        ) -> Result<Option<ItemState>, StoreError> {
            self.inner.mark_failed(claimed, error).await
        }
        async fn release(&self, claimed: &UploadItem) -> Result<bool, StoreError> {
            self.inner.release(claimed).await
        }
        async fn requeue(&self, id: ItemId) -> Result<bool, StoreError> {
            self.inner.requeue(id).await
        }
        async fn purge_failed(&self) -> Result<usize, StoreError> {
            self.inner.purge_failed().await
        }
        async fn recover_stale(&self) -> Result<usize, StoreError> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            self.inner.recover_stale().await
        }
        async fn get(&self, id: ItemId) -> Result<Option<UploadItem>, StoreError> {
            self.inner.get(id).await
        }
        async fn list(&self, filter: StateFilter) -> Result<Vec<UploadItem>, StoreError> {
            self.inner.list(filter).await
        }
        async fn counts(&self) -> Result<QueueCounts, StoreError> {
            self.inner.counts().await
        }
    }

    fn counting_store(stale_after: Duration) -> (Arc<CountingStore>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let inner = InMemoryQueueStore::new(
            StoreOptions {
                stale_after,
                ..StoreOptions::default()
            },
            clock.clone(),
            ids,
        );
        let store = Arc::new(CountingStore {
            inner,
            passes: AtomicUsize::new(0),
        });
        (store, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_stale_claims_on_each_tick() {
        let (store, clock) = counting_store(Duration::from_secs(30));
        store.enqueue("a", Metadata::new()).await.unwrap();
        store.claim_next(1).await.unwrap();

        let reaper = ReaperLoop::spawn(store.clone(), Duration::from_secs(10));
        clock.advance(chrono::Duration::seconds(31));
        // first tick fires immediately, the second at t=10s
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(store.passes.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.count(StateFilter::Pending).await.unwrap(), 1);

        reaper.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_passes_after_shutdown() {
        let (store, _) = counting_store(Duration::from_secs(30));

        let reaper = ReaperLoop::spawn(store.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        reaper.shutdown_and_join().await;
        let passes = store.passes.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.passes.load(Ordering::SeqCst), passes);
    }
}
