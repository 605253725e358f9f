//! Transmissions, import records and responses.

use crate::record::ChangeRecord;
use crate::state::{FailureKind, RecordState, TransmissionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Change records moving in one direction between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmission {
    /// Identity of this envelope.
    pub uuid: Uuid,
    /// Sending server.
    pub source: Uuid,
    /// Receiving server, if known.
    pub target: Option<Uuid>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Records in creation order.
    pub records: Vec<ChangeRecord>,
    /// Asks the receiver to answer with its own pending records.
    pub requesting_reciprocal: bool,
    /// A stopped record blocks delivery; report instead of sending.
    pub max_retry_reached: bool,
    /// Records the sender has committed from the receiver and now confirms.
    #[serde(default)]
    pub confirmed_records: Vec<Uuid>,
}

impl Transmission {
    /// Creates an empty transmission.
    pub fn new(source: Uuid, target: Option<Uuid>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            source,
            target,
            timestamp: Utc::now(),
            records: Vec::new(),
            requesting_reciprocal: false,
            max_retry_reached: false,
            confirmed_records: Vec::new(),
        }
    }

    /// Creates the empty opening request of a pull round.
    pub fn request(source: Uuid, target: Uuid) -> Self {
        let mut tx = Self::new(source, Some(target));
        tx.requesting_reciprocal = true;
        tx
    }

    /// True if there are no records to deliver.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Outcome of ingesting one change record at a receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    /// The ingested record.
    pub source_record_uuid: Uuid,
    /// Outcome.
    pub state: RecordState,
    /// The sender's retry count when the record arrived.
    pub retry_count_at_receipt: u32,
    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
    /// Why the record did not commit.
    pub error_message: Option<String>,
    /// Failure classification, when the record failed.
    pub error_kind: Option<FailureKind>,
}

impl ImportRecord {
    /// Creates an outcome for the given record.
    pub fn new(record: &ChangeRecord, state: RecordState) -> Self {
        Self {
            source_record_uuid: record.uuid,
            state,
            retry_count_at_receipt: record.retry_count,
            timestamp: Utc::now(),
            error_message: None,
            error_kind: None,
        }
    }

    /// Creates a failure outcome.
    pub fn failed(
        record: &ChangeRecord,
        state: RecordState,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        let mut import = Self::new(record, state);
        import.error_kind = Some(kind);
        import.error_message = Some(message.into());
        import
    }
}

/// Reply to a transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionResponse {
    /// Uuid of the transmission this answers.
    pub uuid: Uuid,
    /// Responding server.
    pub source: Uuid,
    /// Server the response goes back to.
    pub target: Option<Uuid>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// One outcome per processed record, in order.
    pub import_records: Vec<ImportRecord>,
    /// Reverse transmission piggybacked on the response.
    pub embedded: Option<Box<Transmission>>,
    /// Overall outcome.
    pub state: TransmissionState,
}

impl TransmissionResponse {
    /// Creates a response with no outcomes.
    pub fn new(uuid: Uuid, source: Uuid, target: Option<Uuid>, state: TransmissionState) -> Self {
        Self {
            uuid,
            source,
            target,
            timestamp: Utc::now(),
            import_records: Vec::new(),
            embedded: None,
            state,
        }
    }

    /// Creates a response answering `tx`.
    pub fn answering(tx: &Transmission, responder: Uuid, state: TransmissionState) -> Self {
        Self::new(tx.uuid, responder, Some(tx.source), state)
    }

    /// Creates a response that never reached a peer.
    pub fn local(source: Uuid, target: Option<Uuid>, state: TransmissionState) -> Self {
        Self::new(Uuid::new_v4(), source, target, state)
    }

    /// Looks up the outcome for a record.
    pub fn import_for(&self, record: &Uuid) -> Option<&ImportRecord> {
        self.import_records
            .iter()
            .find(|i| i.source_record_uuid == *record)
    }

    /// True if every outcome lets the sender move on.
    pub fn all_accepted(&self) -> bool {
        self.import_records
            .iter()
            .all(|i| i.state.is_accepted_outcome())
    }
}
