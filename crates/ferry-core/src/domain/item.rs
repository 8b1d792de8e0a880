//! Upload item: the unit of work held by the queue store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClaimId, ItemId};

/// Opaque key/value metadata attached at enqueue time.
///
/// Key-sorted so the persisted form is stable.
pub type Metadata = BTreeMap<String, String>;

/// Lifecycle state of an upload item.
///
/// State transitions:
/// - Pending -> InFlight -> Done (removed from the store)
/// - Pending -> InFlight -> Pending (retry with backoff, or stale/released claim)
/// - Pending -> InFlight -> Failed (max attempts reached)
/// - Failed -> Pending (manual requeue only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting to be claimed (possibly gated by `not_before`).
    Pending,

    /// Claimed by exactly one dispatcher run.
    InFlight,

    /// Terminal after `max_attempts` failures. Retained for inspection.
    Failed { attempts: u32, last_error: String },

    /// Uploaded. Never persisted: done items are deleted.
    Done,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Failed { .. } | ItemState::Done)
    }

    pub fn filter(&self) -> Option<StateFilter> {
        match self {
            ItemState::Pending => Some(StateFilter::Pending),
            ItemState::InFlight => Some(StateFilter::InFlight),
            ItemState::Failed { .. } => Some(StateFilter::Failed),
            ItemState::Done => None,
        }
    }
}

/// State selector used by `count` / `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFilter {
    Pending,
    InFlight,
    Failed,
}

impl StateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StateFilter::Pending => "pending",
            StateFilter::InFlight => "in_flight",
            StateFilter::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StateFilter::Pending),
            "in_flight" | "in-flight" => Some(StateFilter::InFlight),
            "failed" => Some(StateFilter::Failed),
            _ => None,
        }
    }
}

/// A queued upload.
///
/// This is the "single source of truth" record; stores hold it (or its
/// persisted row) and hand out clones on claim / inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: ItemId,

    /// Reference to the local payload (file path, content handle, ...).
    pub content_ref: String,

    pub metadata: Metadata,

    pub state: ItemState,

    /// Number of upload attempts made so far.
    pub attempts: u32,

    /// Most recent failure message, kept across retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Backoff gate: not claimable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// When the current claim was taken (InFlight only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Token of the current claim (InFlight only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<ClaimId>,

    pub enqueued_at: DateTime<Utc>,
}

impl UploadItem {
    pub fn new(
        id: ItemId,
        content_ref: impl Into<String>,
        metadata: Metadata,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            content_ref: content_ref.into(),
            metadata,
            state: ItemState::Pending,
            attempts: 0,
            last_error: None,
            not_before: None,
            claimed_at: None,
            claim_id: None,
            enqueued_at,
        }
    }

    pub fn matches(&self, filter: StateFilter) -> bool {
        self.state.filter() == Some(filter)
    }

    /// Claimable at `now`: pending and past any backoff gate.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == ItemState::Pending && self.not_before.is_none_or(|t| t <= now)
    }

    /// Claimed longer than `stale_after` ago, so the claimant is presumed dead.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.state == ItemState::InFlight
            && self.claimed_at.is_none_or(|t| {
                t.checked_add_signed(stale_after)
                    .is_some_and(|expires| expires <= now)
            })
    }

    /// `true` while the item is in flight under `claim`. A claim that went
    /// stale and was reclaimed by another run no longer matches.
    pub fn is_claimed_by(&self, claim: Option<ClaimId>) -> bool {
        self.state == ItemState::InFlight && claim.is_some() && self.claim_id == claim
    }

    pub fn claim(&mut self, now: DateTime<Utc>, claim_id: ClaimId) {
        self.state = ItemState::InFlight;
        self.claimed_at = Some(now);
        self.claim_id = Some(claim_id);
    }

    /// Back to Pending without counting an attempt (stale claim or release).
    pub fn unclaim(&mut self) {
        self.state = ItemState::Pending;
        self.claimed_at = None;
        self.claim_id = None;
    }

    /// Record a failed attempt and move to retry or terminal failure.
    pub fn record_failure(
        &mut self,
        error: String,
        max_attempts: u32,
        retry_at: impl FnOnce(u32) -> DateTime<Utc>,
    ) {
        self.attempts = self.attempts.saturating_add(1);
        self.claimed_at = None;
        self.claim_id = None;
        if self.attempts >= max_attempts {
            self.state = ItemState::Failed {
                attempts: self.attempts,
                last_error: error.clone(),
            };
            self.not_before = None;
        } else {
            self.state = ItemState::Pending;
            self.not_before = Some(retry_at(self.attempts));
        }
        self.last_error = Some(error);
    }

    /// Manual re-enqueue of a failed item. The only path that resets `attempts`.
    pub fn requeue(&mut self) {
        self.state = ItemState::Pending;
        self.attempts = 0;
        self.not_before = None;
        self.claimed_at = None;
        self.claim_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn claim_id() -> ClaimId {
        ClaimId::from_ulid(Ulid::new())
    }

    fn item() -> UploadItem {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        UploadItem::new(ItemId::from_ulid(Ulid::new()), "/tmp/a.jpg", Metadata::new(), t0)
    }

    #[test]
    fn new_item_is_pending_with_no_attempts() {
        let item = item();
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.is_claimable(item.enqueued_at));
    }

    #[test]
    fn failure_below_max_schedules_retry() {
        let mut item = item();
        let now = item.enqueued_at;
        item.claim(now, claim_id());
        item.record_failure("boom".into(), 3, |_| now + chrono::Duration::seconds(2));

        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.last_error.as_deref(), Some("boom"));
        assert!(!item.is_claimable(now));
        assert!(item.is_claimable(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn failure_at_max_is_terminal() {
        let mut item = item();
        let now = item.enqueued_at;
        for _ in 0..2 {
            item.claim(now, claim_id());
            item.record_failure("boom".into(), 2, |_| now);
        }
        assert_eq!(
            item.state,
            ItemState::Failed {
                attempts: 2,
                last_error: "boom".into()
            }
        );
        assert!(item.state.is_terminal());
        assert!(!item.is_claimable(now));
    }

    #[test]
    fn requeue_resets_attempts() {
        let mut item = item();
        let now = item.enqueued_at;
        item.claim(now, claim_id());
        item.record_failure("boom".into(), 1, |_| now);
        item.requeue();
        assert_eq!(item.attempts, 0);
        assert!(item.is_claimable(now));
    }

    #[test]
    fn ownership_follows_the_latest_claim() {
        let mut item = item();
        let now = item.enqueued_at;
        let first = claim_id();
        let second = claim_id();

        item.claim(now, first);
        assert!(item.is_claimed_by(Some(first)));

        item.unclaim();
        assert!(!item.is_claimed_by(Some(first)));

        item.claim(now, second);
        assert!(!item.is_claimed_by(Some(first)));
        assert!(item.is_claimed_by(Some(second)));
        assert!(!item.is_claimed_by(None));
    }

    #[rstest]
    #[case::fresh(1, false)]
    #[case::at_grace(30, true)]
    #[case::past_grace(45, true)]
    fn staleness_uses_claimed_at(#[case] elapsed_secs: i64, #[case] stale: bool) {
        let mut item = item();
        let now = item.enqueued_at;
        item.claim(now, claim_id());
        let later = now + chrono::Duration::seconds(elapsed_secs);
        assert_eq!(item.is_stale(later, chrono::Duration::seconds(30)), stale);
    }

    #[test]
    fn state_serializes_with_tag() {
        let v = serde_json::to_value(ItemState::Failed {
            attempts: 3,
            last_error: "x".into(),
        })
        .unwrap();
        assert_eq!(v["kind"], "failed");
        assert_eq!(v["attempts"], 3);
    }
}
