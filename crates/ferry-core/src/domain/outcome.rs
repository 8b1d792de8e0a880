//! Outcome model: what a dispatcher run and a wake report back.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Result of one dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub uploaded: usize,
    pub failed: usize,

    /// The deadline passed before the queue was drained.
    pub timed_out: bool,
}

impl DispatchOutcome {
    /// Map to the three-way host result.
    pub fn wake_result(&self) -> WakeResult {
        WakeResult::from_counts(self.uploaded, self.failed)
    }
}

/// The only thing the host ever sees from a wake.
///
/// Serialized as SCREAMING_SNAKE_CASE: NEW_DATA / NO_DATA / FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WakeResult {
    NewData,
    NoData,
    Failed,
}

impl WakeResult {
    /// - any upload succeeded -> NewData
    /// - nothing attempted -> NoData
    /// - attempts made, none succeeded -> Failed
    pub fn from_counts(uploaded: usize, failed: usize) -> Self {
        if uploaded > 0 {
            WakeResult::NewData
        } else if failed == 0 {
            WakeResult::NoData
        } else {
            WakeResult::Failed
        }
    }
}

/// Live counters of a dispatcher run.
///
/// Shared with the session watchdog so an early report reflects the progress
/// made so far.
#[derive(Debug, Default)]
pub struct DispatchProgress {
    uploaded: AtomicUsize,
    failed: AtomicUsize,
}

impl DispatchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_uploaded(&self) {
        self.uploaded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self, timed_out: bool) -> DispatchOutcome {
        DispatchOutcome {
            uploaded: self.uploaded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::some_uploaded(2, 3, WakeResult::NewData)]
    #[case::all_uploaded(3, 0, WakeResult::NewData)]
    #[case::nothing_attempted(0, 0, WakeResult::NoData)]
    #[case::all_failed(0, 1, WakeResult::Failed)]
    fn maps_counts_to_wake_result(
        #[case] uploaded: usize,
        #[case] failed: usize,
        #[case] expected: WakeResult,
    ) {
        assert_eq!(WakeResult::from_counts(uploaded, failed), expected);
    }

    #[test]
    fn wake_result_serializes_as_required_names() {
        let s = serde_json::to_string(&WakeResult::NewData).unwrap();
        assert_eq!(s, "\"NEW_DATA\"");
        let s = serde_json::to_string(&WakeResult::NoData).unwrap();
        assert_eq!(s, "\"NO_DATA\"");
    }

    #[test]
    fn progress_snapshot_reflects_records() {
        let progress = DispatchProgress::new();
        progress.record_uploaded();
        progress.record_uploaded();
        progress.record_failed();

        let outcome = progress.snapshot(true);
        assert_eq!(outcome.uploaded, 2);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.timed_out);
        assert_eq!(outcome.wake_result(), WakeResult::NewData);
    }
}
