use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image_processing::EncodingError;
use crate::model::RecordId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    NotFound,
    PermissionDenied,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient | ErrorCategory::NetworkError | ErrorCategory::Timeout
        )
    }
}

/// Failure reported by a remote collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category:?}: {message}")]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub message: String,
}

impl RemoteError {
    const MAX_MESSAGE_LENGTH: usize = 512;

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        Self { category, message }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Write,
    Persist,
    Encoding,
    Upload,
    Delete,
    Authentication,
    Remote,
    Stopped,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Write => "WRITE_FAILURE",
            Self::Persist => "PERSIST_FAILURE",
            Self::Encoding => "ENCODING_ERROR",
            Self::Upload => "UPLOAD_FAILURE",
            Self::Delete => "DELETE_FAILURE",
            Self::Authentication => "AUTH_ERROR",
            Self::Remote => "REMOTE_ERROR",
            Self::Stopped => "ENGINE_STOPPED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Partial update failed; the merge fallback has not run yet.
    #[error("partial update of {record} failed: {source}")]
    WriteFailure { record: RecordId, source: RemoteError },

    /// Partial update and every fallback attempt failed. Terminal for the edit.
    #[error("persisting {record} failed: partial update ({partial}), merge write ({merge})")]
    PersistFailure {
        record: RecordId,
        partial: RemoteError,
        merge: RemoteError,
    },

    #[error("image encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("upload to {path} failed: {source}")]
    UploadFailure { path: String, source: RemoteError },

    #[error("deleting {target} failed: {source}")]
    DeleteFailure { target: String, source: RemoteError },

    #[error("identity could not be established: {0}")]
    Auth(RemoteError),

    #[error("remote {operation} failed: {source}")]
    Remote {
        operation: &'static str,
        source: RemoteError,
    },

    #[error("table engine has stopped")]
    EngineStopped,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WriteFailure { .. } => ErrorKind::Write,
            Self::PersistFailure { .. } => ErrorKind::Persist,
            Self::Encoding(_) => ErrorKind::Encoding,
            Self::UploadFailure { .. } => ErrorKind::Upload,
            Self::DeleteFailure { .. } => ErrorKind::Delete,
            Self::Auth(_) => ErrorKind::Authentication,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::EngineStopped => ErrorKind::Stopped,
        }
    }

    /// Whether the failure is reported to the user. Delete failures are
    /// logged and absorbed; an intermediate write failure is followed by the
    /// fallback and never reaches the user on its own.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::DeleteFailure { .. } | Self::WriteFailure { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}
