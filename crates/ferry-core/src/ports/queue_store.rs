//! QueueStore port - the single source of truth for upload items.
//!
//! # 設計原則
//! - Every state transition (claim / done / failed / release / requeue) is
//!   atomic per item.
//! - Exclusivity of a claim is decided here, not by callers holding locks.
//! - Each claim carries a fresh `claim_id`. Completion, failure and release
//!   only apply while the item is still in flight under that claim, so a
//!   late report from a claimant whose claim went stale is a no-op.
//! - Every access first recovers stale claims: an item `InFlight` for longer
//!   than the staleness grace period goes back to `Pending`.

use async_trait::async_trait;

use crate::domain::{ItemId, ItemState, Metadata, StateFilter, StoreError, UploadItem};
use crate::observability::QueueCounts;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Create a new `Pending` item.
    ///
    /// Fails with `StorageFull` when the capacity bound would be exceeded.
    async fn enqueue(&self, content_ref: &str, metadata: Metadata) -> Result<ItemId, StoreError>;

    /// Number of items in the given state.
    async fn count(&self, filter: StateFilter) -> Result<usize, StoreError>;

    /// Atomically move up to `limit` claimable items to `InFlight`.
    ///
    /// FIFO by `enqueued_at`, skipping items still in backoff. Two concurrent
    /// callers never receive the same item. An empty queue yields an empty
    /// vec, not an error. Returned items carry their `claim_id`.
    async fn claim_next(&self, limit: usize) -> Result<Vec<UploadItem>, StoreError>;

    /// Remove a completed item, as handed out by `claim_next`.
    ///
    /// Idempotent: an unknown id or a superseded claim is a no-op.
    async fn mark_done(&self, claimed: &UploadItem) -> Result<(), StoreError>;

    /// Record a failed attempt for a claimed item.
    ///
    /// Returns the resulting state, or `None` when the id is unknown or the
    /// claim no longer owns the item (no-op, `attempts` unchanged).
    async fn mark_failed(
        &self,
        claimed: &UploadItem,
        error: &str,
    ) -> Result<Option<ItemState>, StoreError>;

    /// Return a claimed-but-unstarted item to `Pending` without counting an
    /// attempt. Returns whether the claim still owned the item.
    async fn release(&self, claimed: &UploadItem) -> Result<bool, StoreError>;

    /// Manual re-enqueue: a `Failed` item goes back to `Pending` with its
    /// attempts reset. Returns whether anything changed.
    async fn requeue(&self, id: ItemId) -> Result<bool, StoreError>;

    /// Remove every `Failed` item. Returns how many were removed.
    async fn purge_failed(&self) -> Result<usize, StoreError>;

    /// Revert stale claims now. Returns how many items were recovered.
    async fn recover_stale(&self) -> Result<usize, StoreError>;

    async fn get(&self, id: ItemId) -> Result<Option<UploadItem>, StoreError>;

    /// Items in the given state, in claim order.
    async fn list(&self, filter: StateFilter) -> Result<Vec<UploadItem>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
