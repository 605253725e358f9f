//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while normalizing payloads or handling wire bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No normalizer or descriptor is registered for the type.
    #[error("unsupported payload type: {type_name}")]
    UnsupportedPayloadType {
        /// Normalized name of the unsupported type.
        type_name: String,
    },

    /// A referenced entity does not exist in the object store.
    #[error("referent not found: {entity_type} {id}")]
    ReferentNotFound {
        /// Type of the referenced entity.
        entity_type: String,
        /// Global id of the referenced entity.
        id: String,
    },

    /// The node shape does not match the declared type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// What the declared type requires.
        expected: String,
        /// What was actually present.
        found: String,
    },

    /// A field value could not be parsed.
    #[error("invalid value for {type_name}: {message}")]
    InvalidValue {
        /// Normalized name of the declared type.
        type_name: String,
        /// Description of the problem.
        message: String,
    },

    /// A payload does not match its entity descriptor.
    #[error("invalid payload for {entity_type}: {message}")]
    InvalidPayload {
        /// Entity type whose descriptor rejected the payload.
        entity_type: String,
        /// Description of the problem.
        message: String,
    },

    /// Failed to encode to wire bytes.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode wire bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// Input is larger than the decoder accepts.
    #[error("size limit exceeded: {claimed} bytes (max {max_allowed})")]
    SizeLimitExceeded {
        /// Size of the rejected input.
        claimed: u64,
        /// Largest accepted size.
        max_allowed: u64,
    },
}

impl CodecError {
    /// Create an unsupported payload type error.
    pub fn unsupported(type_name: impl Into<String>) -> Self {
        Self::UnsupportedPayloadType {
            type_name: type_name.into(),
        }
    }

    /// Create a type mismatch error.
    pub fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an invalid value error.
    pub fn invalid_value(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
