//! FerryBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - config は build() の最初に validate する
//! - uploader が無ければ BuildError
//! - store を開けなければ BuildError（起動後に初めて気付く、を避ける）

use std::sync::Arc;
use std::time::Duration;

use super::channel::BackgroundChannel;
use super::dispatcher::Dispatcher;
use super::reaper_loop::ReaperLoop;
use super::session::SessionCoordinator;
use crate::config::{ConfigError, FerryConfig};
use crate::domain::{StoreError, WakeResult};
use crate::ports::{Clock, QueueStore, SystemClock, UlidGenerator, Uploader};
use crate::queue::{InMemoryQueueStore, SqliteQueueStore};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no uploader configured; call FerryBuilder::uploader() before build()")]
    MissingUploader,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open queue store: {0}")]
    Store(#[from] StoreError),
}

/// Open the store described by `config.store`.
///
/// Useful on its own for producers that only enqueue and never upload.
pub async fn open_store(
    config: &FerryConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn QueueStore>, StoreError> {
    let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
    let options = config.store_options();
    match &config.store.path {
        Some(path) => Ok(Arc::new(SqliteQueueStore::open(path, options, clock, ids).await?)),
        None => {
            tracing::warn!("No store path configured, queue will not survive restarts");
            Ok(Arc::new(InMemoryQueueStore::new(options, clock, ids)))
        }
    }
}

/// # 使用例
/// ```ignore
/// let ferry = FerryBuilder::new(config)
///     .uploader(Arc::new(MyUploader))
///     .build()
///     .await?;
/// let result = ferry.coordinator().handle_wake(budget).await;
/// ferry.shutdown().await;
/// ```
pub struct FerryBuilder {
    config: FerryConfig,
    uploader: Option<Arc<dyn Uploader>>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn QueueStore>>,
}

impl FerryBuilder {
    pub fn new(config: FerryConfig) -> Self {
        Self {
            config,
            uploader: None,
            clock: None,
            store: None,
        }
    }

    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an already opened store instead of the one in `config.store`.
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Ferry, BuildError> {
        self.config.validate()?;
        let uploader = self.uploader.ok_or(BuildError::MissingUploader)?;

        let store = match self.store {
            Some(store) => store,
            None => {
                let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
                open_store(&self.config, clock).await?
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            self.config.dispatch_options(),
        ));
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&store),
            dispatcher,
            uploader,
            self.config.session_options(),
        ));
        let channel = BackgroundChannel::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            self.config.default_budget(),
        );
        let reaper = self
            .config
            .reaper_interval()
            .map(|interval| ReaperLoop::spawn(Arc::clone(&store), interval));

        Ok(Ferry {
            store,
            coordinator,
            channel,
            reaper,
            default_budget: self.config.default_budget(),
        })
    }
}

/// A wired queue: store, coordinator, channel and an optional reaper.
pub struct Ferry {
    store: Arc<dyn QueueStore>,
    coordinator: Arc<SessionCoordinator>,
    channel: BackgroundChannel,
    reaper: Option<ReaperLoop>,
    default_budget: Duration,
}

impl Ferry {
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn channel(&self) -> &BackgroundChannel {
        &self.channel
    }

    pub fn default_budget(&self) -> Duration {
        self.default_budget
    }

    /// Shorthand for `coordinator().handle_wake(budget)`.
    pub async fn handle_wake(&self, budget: Duration) -> WakeResult {
        self.coordinator.handle_wake(budget).await
    }

    /// Stop the reaper. Uploads still running from an earlier wake keep
    /// going on their own tasks.
    pub async fn shutdown(self) {
        if let Some(reaper) = self.reaper {
            reaper.shutdown_and_join().await;
        }
        tracing::debug!("Ferry shut down");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::domain::{Metadata, StateFilter, UploadError, UploadItem};

    struct Noop;

    #[async_trait]
    impl Uploader for Noop {
        async fn upload(&self, _item: &UploadItem) -> Result<(), UploadError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn build_without_uploader_fails() {
        let result = FerryBuilder::new(FerryConfig::default()).build().await;
        assert!(matches!(result, Err(BuildError::MissingUploader)));
    }

    #[tokio::test]
    async fn build_rejects_invalid_config() {
        let mut config = FerryConfig::default();
        config.dispatch.concurrency = 0;
        let result = FerryBuilder::new(config).uploader(Arc::new(Noop)).build().await;
        assert!(matches!(result, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }

    #[tokio::test]
    async fn builds_sqlite_backed_ferry_with_reaper() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FerryConfig::default();
        config.store.path = Some(dir.path().join("queue.db"));
        config.reaper.enabled = true;

        let ferry = FerryBuilder::new(config)
            .uploader(Arc::new(Noop))
            .build()
            .await
            .unwrap();
        ferry.store().enqueue("a", Metadata::new()).await.unwrap();

        assert_eq!(
            ferry.handle_wake(Duration::from_secs(5)).await,
            WakeResult::NewData
        );
        assert_eq!(ferry.store().count(StateFilter::Pending).await.unwrap(), 0);
        ferry.shutdown().await;
    }

    #[tokio::test]
    async fn open_store_without_path_is_in_memory() {
        let store = open_store(&FerryConfig::default(), Arc::new(SystemClock))
            .await
            .unwrap();
        store.enqueue("a", Metadata::new()).await.unwrap();
        assert_eq!(store.count(StateFilter::Pending).await.unwrap(), 1);
    }
}
