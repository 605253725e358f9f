//! Error types for the replication engine.

use thiserror::Error;
use treesync_codec::CodecError;
use treesync_protocol::{FailureKind, ProtocolError};
use uuid::Uuid;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the next scheduled attempt may succeed.
        retryable: bool,
    },

    /// The transport call did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// Malformed or unexpected wire content.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The record store or peer registry failed.
    #[error("store error: {0}")]
    Store(String),

    /// No peer with this uuid is registered.
    #[error("unknown peer {0}")]
    UnknownPeer(Uuid),

    /// This node has no parent.
    #[error("no parent server defined")]
    NoParent,

    /// A mutation could not be applied to the object store.
    #[error("apply failed ({kind}): {message}")]
    Apply {
        /// Failure classification.
        kind: FailureKind,
        /// Error message.
        message: String,
    },

    /// Journal I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sending an administrator alert failed.
    #[error("notification failed: {0}")]
    Notification(String),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Classifies this error for retry accounting.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Transport { .. } | SyncError::Timeout => FailureKind::Transport,
            SyncError::Codec(CodecError::ReferentNotFound { .. }) => FailureKind::ReferentNotFound,
            SyncError::Codec(CodecError::UnsupportedPayloadType { .. }) => {
                FailureKind::UnsupportedPayload
            }
            SyncError::Codec(_) => FailureKind::Validation,
            SyncError::Store(_) | SyncError::Io(_) => FailureKind::Store,
            SyncError::Apply { kind, .. } => *kind,
            _ => FailureKind::Other,
        }
    }

    /// True for infrastructure failures that never count against a record.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::Store(_) | SyncError::Io(_) => true,
            _ => false,
        }
    }
}
