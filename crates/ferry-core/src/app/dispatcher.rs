//! Dispatcher - drains the queue against a deadline.
//!
//! # フロー
//! 1. `QueueStore::claim_next(batch_size)` (FIFO, backoff items skipped)
//! 2. per item: check the deadline, take a concurrency permit, spawn the upload
//! 3. success -> `mark_done`, failure or panic -> `mark_failed`
//! 4. once the deadline passes: stop claiming, release unstarted claims, wait
//!    for started uploads

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::domain::{DispatchOutcome, DispatchProgress, ItemId, ItemState, UploadItem};
use crate::ports::{QueueStore, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Items claimed per `claim_next` call.
    pub batch_size: usize,

    /// Maximum uploads running at once.
    pub concurrency: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 4,
            concurrency: 2,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    options: DispatchOptions,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn QueueStore>, options: DispatchOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> DispatchOptions {
        self.options
    }

    pub async fn run(&self, deadline: Instant, uploader: Arc<dyn Uploader>) -> DispatchOutcome {
        self.run_with_progress(deadline, uploader, Arc::new(DispatchProgress::new()))
            .await
    }

    /// Like [`Dispatcher::run`], publishing counts to `progress` as uploads
    /// finish so an observer can report before the run returns.
    ///
    /// Each item is attempted at most once per run; an item that fails with a
    /// zero backoff waits for the next run.
    pub async fn run_with_progress(
        &self,
        deadline: Instant,
        uploader: Arc<dyn Uploader>,
        progress: Arc<DispatchProgress>,
    ) -> DispatchOutcome {
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let batch_size = self.options.batch_size.max(1);
        let mut uploads = JoinSet::new();
        let mut attempted: HashSet<ItemId> = HashSet::new();
        let mut held: Vec<UploadItem> = Vec::new();
        let mut timed_out = false;

        'claim: loop {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            let batch = match self.store.claim_next(batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Claim failed, ending dispatch run");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            // Already attempted this run: keep the claim until the run ends so
            // the next claim moves past them.
            let (repeats, fresh): (Vec<UploadItem>, Vec<UploadItem>) =
                batch.into_iter().partition(|item| attempted.contains(&item.id));
            held.extend(repeats);
            if fresh.is_empty() {
                continue;
            }

            let mut fresh = fresh.into_iter();
            while let Some(item) = fresh.next() {
                // 許可待ちの間に deadline を過ぎることもある
                let permit = tokio::select! {
                    permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
                    _ = tokio::time::sleep_until(deadline) => None,
                };
                let Some(permit) = permit.filter(|_| Instant::now() < deadline) else {
                    timed_out = true;
                    let unstarted: Vec<UploadItem> = std::iter::once(item).chain(fresh).collect();
                    self.release_all(unstarted.iter()).await;
                    break 'claim;
                };

                attempted.insert(item.id);
                let store = Arc::clone(&self.store);
                let uploader = Arc::clone(&uploader);
                let progress = Arc::clone(&progress);
                uploads.spawn(async move {
                    attempt(store, uploader, item, &progress).await;
                    drop(permit);
                });
            }
        }

        self.release_all(held.iter()).await;

        // Started uploads are never aborted; wait for them to settle.
        while let Some(joined) = uploads.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Upload bookkeeping task failed");
            }
        }

        let outcome = progress.snapshot(timed_out);
        tracing::info!(
            uploaded = outcome.uploaded,
            failed = outcome.failed,
            timed_out = outcome.timed_out,
            "Dispatch run finished"
        );
        outcome
    }

    async fn release_all(&self, items: impl Iterator<Item = &UploadItem>) {
        for item in items {
            if let Err(e) = self.store.release(item).await {
                // stays InFlight; staleness recovery picks it up later
                tracing::warn!(item_id = %item.id, error = %e, "Failed to release claim");
            }
        }
    }
}

/// One upload attempt plus its store bookkeeping.
///
/// The upload runs on its own task so a panic inside the uploader surfaces
/// as a `JoinError` here instead of unwinding through the dispatcher.
async fn attempt(
    store: Arc<dyn QueueStore>,
    uploader: Arc<dyn Uploader>,
    item: UploadItem,
    progress: &DispatchProgress,
) {
    let id = item.id;
    let attempt_no = item.attempts + 1;
    tracing::debug!(item_id = %id, attempt = attempt_no, content_ref = %item.content_ref, "Uploading");

    let claimed = item.clone();
    let joined = tokio::spawn(async move { uploader.upload(&item).await }).await;
    let error = match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) if e.is_panic() => Some("upload panicked".to_string()),
        Err(e) => Some(format!("upload task failed: {e}")),
    };

    match error {
        None => {
            progress.record_uploaded();
            if let Err(e) = store.mark_done(&claimed).await {
                tracing::warn!(item_id = %id, error = %e, "Uploaded but mark_done failed");
            }
        }
        Some(reason) => {
            progress.record_failed();
            match store.mark_failed(&claimed, &reason).await {
                Ok(Some(ItemState::Failed { attempts, .. })) => {
                    tracing::error!(item_id = %id, attempts, error = %reason, "Upload failed permanently");
                }
                Ok(Some(_)) => {
                    tracing::warn!(item_id = %id, attempt = attempt_no, error = %reason, "Upload failed, will retry");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(item_id = %id, error = %e, "mark_failed failed, leaving item as is");
                }
            }
        }
    }
}
