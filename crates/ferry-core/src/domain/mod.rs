//! Domain model (ids, upload items, outcomes, errors).

pub mod errors;
pub mod ids;
pub mod item;
pub mod outcome;

pub use self::errors::{StoreError, UploadError};
pub use self::ids::{ClaimId, ItemId, ParseIdError};
pub use self::item::{ItemState, Metadata, StateFilter, UploadItem};
pub use self::outcome::{DispatchOutcome, DispatchProgress, WakeResult};
