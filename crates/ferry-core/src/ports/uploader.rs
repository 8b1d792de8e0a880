//! Uploader port - the actual network transfer (external collaborator).

use async_trait::async_trait;

use crate::domain::{UploadError, UploadItem};

/// Performs the transfer of one item.
///
/// The core treats this as opaque: an `Err` and a panic inside `upload` are
/// both recorded as a failed attempt.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, item: &UploadItem) -> Result<(), UploadError>;
}
