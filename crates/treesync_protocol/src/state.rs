//! Lifecycle and outcome states.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a change record, per destination.
///
/// Sender side: `New` → `Sent` (or `SentAgain` on retry) → `Committed` →
/// `CommittedAndConfirmationSent`. A failed application moves the record to
/// `Failed`, and to `FailedAndStopped` once the retry ceiling is reached.
/// Receiver side outcomes are `Committed`, `AlreadyCommitted`, `Failed`,
/// `Rejected` and `NotSupposedToSync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    /// Created locally, never sent.
    New,
    /// Queued for sending.
    PendingSend,
    /// Sent once, outcome unknown.
    Sent,
    /// The transport failed before any outcome was known.
    SendFailed,
    /// Applied at the receiver.
    Committed,
    /// Applied, and the commit has been confirmed back to the sender.
    CommittedAndConfirmationSent,
    /// Application failed at the receiver; eligible for retry.
    Failed,
    /// Retry ceiling reached; blocks everything after it.
    FailedAndStopped,
    /// Sent again after an earlier attempt.
    SentAgain,
    /// Receiver had already committed this record.
    AlreadyCommitted,
    /// Filtered out for this destination.
    NotSupposedToSync,
    /// Receiver refused the record outright.
    Rejected,
}

const RECORD_STATES: [RecordState; 12] = [
    RecordState::New,
    RecordState::PendingSend,
    RecordState::Sent,
    RecordState::SendFailed,
    RecordState::Committed,
    RecordState::CommittedAndConfirmationSent,
    RecordState::Failed,
    RecordState::FailedAndStopped,
    RecordState::SentAgain,
    RecordState::AlreadyCommitted,
    RecordState::NotSupposedToSync,
    RecordState::Rejected,
];

impl RecordState {
    /// True for the committed states. Gates purge and retry eligibility.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            RecordState::Committed
                | RecordState::AlreadyCommitted
                | RecordState::CommittedAndConfirmationSent
        )
    }

    /// True while the record still has to be (re)delivered.
    pub fn is_pending(self) -> bool {
        Self::pending_states().contains(&self)
    }

    /// States in which a record is still listed for delivery.
    pub fn pending_states() -> &'static [RecordState] {
        &[
            RecordState::New,
            RecordState::PendingSend,
            RecordState::SendFailed,
            RecordState::Sent,
            RecordState::SentAgain,
            RecordState::Failed,
            RecordState::FailedAndStopped,
        ]
    }

    /// True if the record has never reached the receiver.
    pub fn is_first_send(self) -> bool {
        matches!(self, RecordState::New | RecordState::PendingSend)
    }

    /// Outcomes that let a receiver continue with the next record.
    pub fn is_accepted_outcome(self) -> bool {
        self.is_final() || self == RecordState::NotSupposedToSync
    }

    /// Every state, in declaration order.
    pub fn all() -> &'static [RecordState] {
        &RECORD_STATES
    }

    /// Wire name of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::New => "NEW",
            RecordState::PendingSend => "PENDING_SEND",
            RecordState::Sent => "SENT",
            RecordState::SendFailed => "SEND_FAILED",
            RecordState::Committed => "COMMITTED",
            RecordState::CommittedAndConfirmationSent => "COMMITTED_AND_CONFIRMATION_SENT",
            RecordState::Failed => "FAILED",
            RecordState::FailedAndStopped => "FAILED_AND_STOPPED",
            RecordState::SentAgain => "SENT_AGAIN",
            RecordState::AlreadyCommitted => "ALREADY_COMMITTED",
            RecordState::NotSupposedToSync => "NOT_SUPPOSED_TO_SYNC",
            RecordState::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RECORD_STATES
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ProtocolError::UnknownName {
                kind: "record state",
                name: s.to_string(),
            })
    }
}

/// What a change item does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    /// The entity was created.
    New,
    /// The entity was modified.
    Updated,
    /// The entity was removed.
    Deleted,
}

/// Top-level outcome of a transmission exchange, also kept per peer as its
/// last sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransmissionState {
    /// Everything was processed.
    Ok,
    /// There was nothing to exchange.
    OkNothingToDo,
    /// The exchange failed as a whole.
    Failed,
    /// The exchange ran but some records did not commit.
    FailedRecords,
    /// A stopped record blocks delivery.
    MaxRetryReached,
    /// The peer is not acceptable for this exchange.
    InvalidServer,
    /// The outbound transmission could not be built.
    TransmissionCreationFailed,
    /// The sending peer could not be identified.
    CannotFindServerWithUuid,
    /// A synchronize attempt for this peer is already running.
    ErrorCannotRunParallel,
    /// No parent is configured.
    NoParentDefined,
    /// An exchange with the peer is in flight.
    Pending,
}

impl TransmissionState {
    /// True for the two success outcomes.
    pub fn is_success(self) -> bool {
        matches!(self, TransmissionState::Ok | TransmissionState::OkNothingToDo)
    }

    /// Wire name of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            TransmissionState::Ok => "OK",
            TransmissionState::OkNothingToDo => "OK_NOTHING_TO_DO",
            TransmissionState::Failed => "FAILED",
            TransmissionState::FailedRecords => "FAILED_RECORDS",
            TransmissionState::MaxRetryReached => "MAX_RETRY_REACHED",
            TransmissionState::InvalidServer => "INVALID_SERVER",
            TransmissionState::TransmissionCreationFailed => "TRANSMISSION_CREATION_FAILED",
            TransmissionState::CannotFindServerWithUuid => "CANNOT_FIND_SERVER_WITH_UUID",
            TransmissionState::ErrorCannotRunParallel => "ERROR_CANNOT_RUN_PARALLEL",
            TransmissionState::NoParentDefined => "NO_PARENT_DEFINED",
            TransmissionState::Pending => "PENDING",
        }
    }
}

impl fmt::Display for TransmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies why a record failed to apply.
///
/// Carried on import records so the sender can decide whether the failure
/// counts against the record's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The object store rejected the mutation.
    Validation,
    /// A referenced entity is missing at the receiver.
    ReferentNotFound,
    /// A payload type is not known to the receiver.
    UnsupportedPayload,
    /// The record was produced by an incompatible database version.
    VersionMismatch,
    /// The receiver's own storage failed.
    Store,
    /// The transport failed.
    Transport,
    /// Anything else.
    Other,
}

impl FailureKind {
    /// Config name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::ReferentNotFound => "referent_not_found",
            FailureKind::UnsupportedPayload => "unsupported_payload",
            FailureKind::VersionMismatch => "version_mismatch",
            FailureKind::Store => "store",
            FailureKind::Transport => "transport",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            FailureKind::Validation,
            FailureKind::ReferentNotFound,
            FailureKind::UnsupportedPayload,
            FailureKind::VersionMismatch,
            FailureKind::Store,
            FailureKind::Transport,
            FailureKind::Other,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s.trim())
        .ok_or_else(|| ProtocolError::UnknownName {
            kind: "failure kind",
            name: s.to_string(),
        })
    }
}
