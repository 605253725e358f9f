//! CBOR wire encoding for protocol envelopes.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Largest envelope accepted from a peer (256 MiB).
pub const MAX_WIRE_BYTES: u64 = 256 * 1024 * 1024;

/// Serializes a value to CBOR bytes.
///
/// # Errors
///
/// Returns `EncodingFailed` if serialization fails.
pub fn to_wire<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(bytes)
}

/// Deserializes a value from CBOR bytes.
///
/// # Errors
///
/// Returns `SizeLimitExceeded` for oversized input and `DecodingFailed` for
/// anything that is not a well-formed encoding of `T`.
pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    let len = bytes.len() as u64;
    if len > MAX_WIRE_BYTES {
        return Err(CodecError::SizeLimitExceeded {
            claimed: len,
            max_allowed: MAX_WIRE_BYTES,
        });
    }
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}
