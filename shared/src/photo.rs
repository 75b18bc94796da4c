use std::sync::Arc;

use metrics::counter;
use tracing::{info, instrument, warn};

use crate::capabilities::{AuthGate, BlobStore, RemoteWriter};
use crate::edit::{persist_patch, WritePolicy};
use crate::error::{ErrorCategory, RemoteError, SyncError};
use crate::image_processing::{ImageBlob, ImageProcessor};
use crate::model::{DocumentPatch, PhotoChange, PhotoRef, RecordId, UnixTimeMs};

/// Storage path of an uploaded photo: `{prefix}/{record}/photo_{millis}.{ext}`.
pub fn upload_path(prefix: &str, record: &RecordId, at: UnixTimeMs, extension: &str) -> String {
    format!("{prefix}/{record}/photo_{}.{extension}", at.0)
}

/// Attach and detach of a record's photo against the remote collaborators.
#[derive(Clone)]
pub struct PhotoFlow {
    pub writer: Arc<dyn RemoteWriter>,
    pub auth: Arc<dyn AuthGate>,
    pub blobs: Arc<dyn BlobStore>,
    pub processor: Arc<ImageProcessor>,
    pub policy: WritePolicy,
    pub storage_prefix: String,
}

impl PhotoFlow {
    /// Compresses `blob` to the configured budget, uploads it and persists
    /// the new reference. Nothing is uploaded when compression fails.
    #[instrument(skip(self, blob), fields(record = %record, input_size = blob.len()))]
    pub async fn attach(&self, record: &RecordId, blob: ImageBlob) -> Result<PhotoRef, SyncError> {
        self.auth.ensure_identity().await.map_err(SyncError::Auth)?;

        let max_bytes = self.processor.config().max_output_bytes;
        let compressed = self.processor.compress(blob, max_bytes).await?;

        let path = upload_path(
            &self.storage_prefix,
            record,
            UnixTimeMs::now(),
            compressed.extension(),
        );
        let content_type = compressed.content_type_or_default();
        let url = self
            .blobs
            .upload(&path, compressed.bytes, &content_type)
            .await
            .map_err(|source| {
                counter!("photo.upload.failed").increment(1);
                SyncError::UploadFailure {
                    path: path.clone(),
                    source,
                }
            })?;

        let photo = PhotoRef::new(url.as_str()).map_err(|e| SyncError::UploadFailure {
            path: path.clone(),
            source: RemoteError::new(ErrorCategory::Unknown, e.to_string()),
        })?;

        let patch = DocumentPatch::photo(PhotoChange::Set(photo.clone()), UnixTimeMs::now());
        persist_patch(&*self.writer, &*self.auth, record, &patch, &self.policy).await?;

        info!(%path, "photo attached");
        Ok(photo)
    }

    /// Deletes the previous object on a best-effort basis, then always
    /// clears the persisted reference.
    #[instrument(skip(self), fields(record = %record))]
    pub async fn detach(
        &self,
        record: &RecordId,
        previous: Option<PhotoRef>,
    ) -> Result<(), SyncError> {
        self.auth.ensure_identity().await.map_err(SyncError::Auth)?;

        if let Some(previous) = previous {
            if let Err(source) = self.blobs.delete(previous.as_str()).await {
                let err = SyncError::DeleteFailure {
                    target: previous.to_string(),
                    source,
                };
                counter!("photo.delete.failed").increment(1);
                warn!(error = %err, "photo object not deleted");
            }
        }

        let patch = DocumentPatch::photo(PhotoChange::Clear, UnixTimeMs::now());
        persist_patch(&*self.writer, &*self.auth, record, &patch, &self.policy).await?;
        Ok(())
    }
}
