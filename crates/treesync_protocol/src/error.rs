//! Error types for the protocol crate.

use thiserror::Error;
use treesync_codec::CodecError;
use uuid::Uuid;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wire or payload codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A change record must contain at least one item.
    #[error("change record {uuid} has no items")]
    EmptyRecord {
        /// Uuid of the offending record.
        uuid: Uuid,
    },

    /// The envelope decoded but is not usable.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// A state name could not be parsed.
    #[error("unknown {kind} {name:?}")]
    UnknownName {
        /// Which enumeration was being parsed.
        kind: &'static str,
        /// The rejected name.
        name: String,
    },
}
