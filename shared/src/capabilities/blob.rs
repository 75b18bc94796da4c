use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::RemoteError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path` and returns the public URL of the object.
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str)
        -> Result<Url, RemoteError>;

    /// `reference` is either a URL returned by [`upload`](Self::upload) or a
    /// bare storage path.
    async fn delete(&self, reference: &str) -> Result<(), RemoteError>;
}
