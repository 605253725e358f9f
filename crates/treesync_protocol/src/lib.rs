//! # treesync Protocol
//!
//! Data model and wire envelopes for treesync.
//!
//! This crate provides:
//! - `ChangeItem` / `ChangeRecord`, the replicated unit of work
//! - `RecordState`, the per-destination lifecycle of a record
//! - `Transmission`, `ImportRecord` and `TransmissionResponse`
//! - `Exchange`, the CBOR envelope that crosses the transport
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod exchange;
mod record;
mod state;
mod transmission;

pub use error::{ProtocolError, ProtocolResult};
pub use exchange::{Exchange, PROTOCOL_VERSION};
pub use record::{ChangeItem, ChangeRecord};
pub use state::{FailureKind, ItemState, RecordState, TransmissionState};
pub use transmission::{ImportRecord, Transmission, TransmissionResponse};
