//! App - アプリケーション層
//!
//! ports を組み合わせて wake の処理を実装する。
//!
//! # 主要コンポーネント
//! - **FerryBuilder / Ferry**: 構築とワイヤリング、明示的な shutdown
//! - **Dispatcher**: deadline 付きで queue を drain
//! - **SessionCoordinator**: wake の入口、watchdog、結果の一回だけの報告
//! - **BackgroundChannel**: host method channel（getQueueCount / processQueue）
//! - **ReaperLoop**: stale claim の定期回収

pub mod builder;
pub mod channel;
pub mod dispatcher;
pub mod reaper_loop;
pub mod session;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Ferry, FerryBuilder, open_store};
pub use self::channel::{BackgroundChannel, ChannelError};
pub use self::dispatcher::{DispatchOptions, Dispatcher};
pub use self::reaper_loop::ReaperLoop;
pub use self::session::{ReportSource, SessionCoordinator, SessionOptions, SessionPhase, WakeReporter};
