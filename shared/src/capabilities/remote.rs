use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::model::{DocumentPatch, NewRecord, RecordId, RemoteChange};

/// Keeps a feed subscription alive. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to release.
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Live change notifications for the table's collection.
///
/// Implementations deliver every change to `sink` in arrival order until the
/// returned [`Subscription`] is dropped. The current contents are delivered
/// first, as `added` notifications.
#[async_trait]
pub trait RemoteFeed: Send + Sync {
    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<RemoteChange>,
    ) -> Result<Subscription, RemoteError>;
}

/// Each call is a single atomic remote operation.
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    /// Updates the given fields of an existing document. Fails when the
    /// document does not exist.
    async fn partial_update(&self, id: &RecordId, patch: &DocumentPatch)
        -> Result<(), RemoteError>;

    /// Merges the given fields into the document, creating it if needed.
    async fn merge_write(&self, id: &RecordId, patch: &DocumentPatch) -> Result<(), RemoteError>;

    /// The new id becomes visible to the table only once it is echoed back
    /// through the feed.
    async fn create(&self, record: &NewRecord) -> Result<RecordId, RemoteError>;

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError>;
}
