//! BackgroundChannel - host method channel の受け口
//!
//! Method names match what the host side sends: `getQueueCount` and
//! `processQueue`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::session::SessionCoordinator;
use crate::domain::{StateFilter, StoreError, WakeResult};
use crate::ports::QueueStore;

pub const GET_QUEUE_COUNT: &str = "getQueueCount";
pub const PROCESS_QUEUE: &str = "processQueue";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("method not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BackgroundChannel {
    store: Arc<dyn QueueStore>,
    coordinator: Arc<SessionCoordinator>,
    default_budget: Duration,
}

impl BackgroundChannel {
    pub fn new(
        store: Arc<dyn QueueStore>,
        coordinator: Arc<SessionCoordinator>,
        default_budget: Duration,
    ) -> Self {
        Self {
            store,
            coordinator,
            default_budget,
        }
    }

    /// Dispatch one host call.
    ///
    /// - `getQueueCount` -> pending count as a JSON integer
    /// - `processQueue` -> `true` when the wake uploaded something
    pub async fn invoke(&self, method: &str) -> Result<Value, ChannelError> {
        tracing::debug!(method, "Channel call");
        match method {
            GET_QUEUE_COUNT => {
                let pending = self.store.count(StateFilter::Pending).await?;
                Ok(Value::from(pending))
            }
            PROCESS_QUEUE => {
                let result = self.coordinator.handle_wake(self.default_budget).await;
                Ok(Value::Bool(result == WakeResult::NewData))
            }
            other => Err(ChannelError::NotImplemented(other.to_string())),
        }
    }
}
