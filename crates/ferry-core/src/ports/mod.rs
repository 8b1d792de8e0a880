//! Ports - 抽象化レイヤー
//!
//! Each trait is a seam to something outside the core: persistence, the
//! transfer itself, time, and identity.

pub mod clock;
pub mod id_generator;
pub mod queue_store;
pub mod uploader;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::QueueStore;
pub use self::uploader::Uploader;
