//! SessionCoordinator - wake の入口
//!
//! # フロー
//! 1. `count(Pending) == 0` -> NoData（Dispatcher も uploader も触らない）
//! 2. Dispatcher を detached task で起動し、watchdog と競争させる
//! 3. 先に報告した方が勝ち（WakeReporter）、後続の報告は捨てる
//!
//! The watchdog never aborts the Dispatcher. Uploads that finish after the
//! report still update the store, they just no longer change the result.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::dispatcher::Dispatcher;
use crate::domain::{DispatchProgress, StateFilter, WakeResult};
use crate::ports::{QueueStore, Uploader};

/// Deadline used when `now + budget` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Per-wake state machine: `Idle -> Checking -> {Idle | Dispatching -> Reporting -> Idle}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Checking,
    Dispatching,
    Reporting,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Checking => "checking",
            SessionPhase::Dispatching => "dispatching",
            SessionPhase::Reporting => "reporting",
        };
        f.write_str(s)
    }
}

/// Who delivered the wake result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    Dispatcher,
    Watchdog,
}

/// Single-assignment result slot.
///
/// The first `report` wins; every later call returns `false` and its value
/// is dropped.
pub struct WakeReporter {
    slot: Mutex<Option<oneshot::Sender<WakeResult>>>,
}

impl WakeReporter {
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<WakeResult>) {
        let (tx, rx) = oneshot::channel();
        let reporter = Arc::new(Self {
            slot: Mutex::new(Some(tx)),
        });
        (reporter, rx)
    }

    pub fn report(&self, result: WakeResult, source: ReportSource) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(sender) = sender else {
            tracing::debug!(?result, ?source, "Late wake report discarded");
            return false;
        };
        // receiver gone means the wake caller stopped waiting; still "ours"
        let _ = sender.send(result);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Share of the budget held back for reporting.
    pub safety_margin_ratio: f64,
    pub min_safety_margin: Duration,
    pub max_safety_margin: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            safety_margin_ratio: 0.1,
            min_safety_margin: Duration::from_millis(500),
            max_safety_margin: Duration::from_secs(5),
        }
    }
}

impl SessionOptions {
    /// `clamp(budget * ratio, min, max)`, never more than half the budget.
    pub fn safety_margin(&self, budget: Duration) -> Duration {
        let ratio = if self.safety_margin_ratio.is_finite() {
            self.safety_margin_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let proportional = budget.mul_f64(ratio);
        let lower = self.min_safety_margin.min(self.max_safety_margin);
        proportional
            .clamp(lower, self.max_safety_margin)
            .min(budget / 2)
    }
}

pub struct SessionCoordinator {
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<Dispatcher>,
    uploader: Arc<dyn Uploader>,
    options: SessionOptions,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<Dispatcher>,
        uploader: Arc<dyn Uploader>,
        options: SessionOptions,
    ) -> Self {
        Self {
            store,
            dispatcher,
            uploader,
            options,
        }
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Handle one host wake within `budget`.
    ///
    /// Always returns exactly one result, at the latest once the budget minus
    /// the safety margin has elapsed.
    #[tracing::instrument(name = "wake", skip(self), fields(budget_ms = budget.as_millis() as u64))]
    pub async fn handle_wake(&self, budget: Duration) -> WakeResult {
        let started = Instant::now();
        enter(SessionPhase::Checking);

        let pending = match self.store.count(StateFilter::Pending).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Queue count failed");
                enter(SessionPhase::Idle);
                return WakeResult::Failed;
            }
        };
        if pending == 0 {
            tracing::info!("Queue empty, nothing to upload");
            enter(SessionPhase::Idle);
            return WakeResult::NoData;
        }

        let margin = self.options.safety_margin(budget);
        let window = budget.saturating_sub(margin);
        let deadline = started
            .checked_add(window)
            .unwrap_or_else(|| started + FAR_FUTURE);
        tracing::info!(pending, margin_ms = margin.as_millis() as u64, "Dispatching");
        enter(SessionPhase::Dispatching);

        let (reporter, result_rx) = WakeReporter::channel();
        let progress = Arc::new(DispatchProgress::new());

        // Detached: dropping the handle does not cancel the run.
        tokio::spawn({
            let dispatcher = Arc::clone(&self.dispatcher);
            let uploader = Arc::clone(&self.uploader);
            let progress = Arc::clone(&progress);
            let reporter = Arc::clone(&reporter);
            async move {
                let outcome = dispatcher
                    .run_with_progress(deadline, uploader, progress)
                    .await;
                reporter.report(outcome.wake_result(), ReportSource::Dispatcher);
            }
        });

        let watchdog = tokio::spawn({
            let progress = Arc::clone(&progress);
            let reporter = Arc::clone(&reporter);
            async move {
                tokio::time::sleep_until(deadline).await;
                let partial = progress.snapshot(true);
                if reporter.report(partial.wake_result(), ReportSource::Watchdog) {
                    tracing::warn!(
                        uploaded = partial.uploaded,
                        failed = partial.failed,
                        "Budget exhausted, reporting partial progress"
                    );
                }
            }
        });
        drop(reporter);

        // Both writers hold the reporter, so the sender is only dropped
        // unused if both tasks died.
        let result = result_rx.await.unwrap_or(WakeResult::Failed);
        watchdog.abort();

        enter(SessionPhase::Reporting);
        tracing::info!(
            ?result,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Wake finished"
        );
        enter(SessionPhase::Idle);
        result
    }
}

fn enter(phase: SessionPhase) {
    tracing::debug!(%phase, "Session phase");
}
