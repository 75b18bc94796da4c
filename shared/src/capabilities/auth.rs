use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::model::UserId;

/// Opaque identity the remote layer accepts writes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub uid: UserId,
}

#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Called before every write and upload. May sign in lazily.
    async fn ensure_identity(&self) -> Result<Principal, RemoteError>;
}
