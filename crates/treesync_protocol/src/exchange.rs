//! The wire envelope exchanged between peers.

use crate::error::{ProtocolError, ProtocolResult};
use crate::transmission::{Transmission, TransmissionResponse};
use serde::{Deserialize, Serialize};
use treesync_codec::{from_wire, to_wire};

/// Protocol version written into every envelope.
pub const PROTOCOL_VERSION: u16 = 1;

/// What travels over the transport.
///
/// A child opens a round with a `Transmission`; it pushes its own records
/// as a `Response` that carries its import outcomes for the parent's
/// records plus its own transmission embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exchange {
    /// A transmission.
    Transmission(Transmission),
    /// A response, possibly carrying an embedded transmission.
    Response(TransmissionResponse),
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    body: Exchange,
}

impl Exchange {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        #[derive(Serialize)]
        struct EnvelopeRef<'a> {
            version: u16,
            body: &'a Exchange,
        }
        Ok(to_wire(&EnvelopeRef {
            version: PROTOCOL_VERSION,
            body: self,
        })?)
    }

    /// Decodes from CBOR and checks record invariants.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Envelope = from_wire(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::Malformed(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        envelope.body.validate()?;
        Ok(envelope.body)
    }

    /// The transmission carried by this envelope, if any.
    pub fn transmission(&self) -> Option<&Transmission> {
        match self {
            Exchange::Transmission(tx) => Some(tx),
            Exchange::Response(response) => response.embedded.as_deref(),
        }
    }

    /// Unwraps a response.
    pub fn into_response(self) -> ProtocolResult<TransmissionResponse> {
        match self {
            Exchange::Response(response) => Ok(response),
            Exchange::Transmission(tx) => Err(ProtocolError::Malformed(format!(
                "expected a response, got transmission {}",
                tx.uuid
            ))),
        }
    }

    fn validate(&self) -> ProtocolResult<()> {
        if let Some(tx) = self.transmission() {
            for record in &tx.records {
                record.validate()?;
            }
        }
        Ok(())
    }
}
