//! ferry-core
//!
//! Durable background upload queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, item, outcome, errors）
//! - **ports**: 抽象化レイヤー（QueueStore, Uploader, Clock, IdGenerator）
//! - **queue**: QueueStore 実装（SQLite, in-memory）と RetryPolicy
//! - **app**: Dispatcher, SessionCoordinator, BackgroundChannel, ReaperLoop, FerryBuilder
//! - **config**: TOML 設定
//! - **observability**: queue の状態集計

pub mod app;
pub mod config;
pub mod domain;
pub mod observability;
pub mod ports;
pub mod queue;

pub use app::{Ferry, FerryBuilder};
pub use config::FerryConfig;
pub use domain::{UploadItem, WakeResult};
