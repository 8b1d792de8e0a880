//! Queue module: retry policy and the two `QueueStore` implementations.

mod memory;
mod retry;
pub mod sqlite;

pub use memory::InMemoryQueueStore;
pub use retry::RetryPolicy;
pub use sqlite::SqliteQueueStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::UploadItem;

/// Limits and recovery parameters shared by every store implementation.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Maximum number of retained items (pending + in flight + failed).
    pub capacity: usize,

    /// Attempts after which an item becomes terminally `Failed`.
    pub max_attempts: u32,

    /// Staleness grace period for `InFlight` items.
    pub stale_after: Duration,

    pub retry: RetryPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_attempts: 5,
            stale_after: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreOptions {
    /// Earliest retry time after the `attempts`-th failure.
    pub(crate) fn retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        add_std(now, self.retry.next_delay(attempts))
    }

    pub(crate) fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX)
    }
}

fn add_std(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A report from a claim that no longer owns the item.
fn superseded(claimed: &UploadItem, what: &str) {
    tracing::warn!(
        item_id = %claimed.id,
        claim_id = ?claimed.claim_id,
        "Ignoring {what} from a superseded claim"
    );
}
