//! Demo uploader: "uploads" by copying into a local directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ferry_core::domain::{UploadError, UploadItem};
use ferry_core::ports::Uploader;

/// Metadata key naming the target file; defaults to the source file name.
pub const DESTINATION_KEY: &str = "destination";

pub struct CopyUploader {
    dest_dir: PathBuf,
}

impl CopyUploader {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
        }
    }

    fn target_for(&self, item: &UploadItem) -> Result<PathBuf, UploadError> {
        let name = match item.metadata.get(DESTINATION_KEY) {
            Some(dest) => Path::new(dest).file_name(),
            None => Path::new(&item.content_ref).file_name(),
        };
        let name = name.ok_or_else(|| {
            UploadError::new(format!("no target file name for {}", item.content_ref))
        })?;
        Ok(self.dest_dir.join(name))
    }
}

#[async_trait]
impl Uploader for CopyUploader {
    async fn upload(&self, item: &UploadItem) -> Result<(), UploadError> {
        let target = self.target_for(item)?;
        tokio::fs::create_dir_all(&self.dest_dir).await?;

        // copy then rename, so a killed process never leaves a partial target
        let mut partial = target.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        tokio::fs::copy(&item.content_ref, &partial).await?;
        tokio::fs::rename(&partial, &target).await?;
        tracing::info!(item_id = %item.id, target = %target.display(), "Copied upload");
        Ok(())
    }
}
