//! # TreeSync Engine
//!
//! Store-and-forward replication across a tree of servers.
//!
//! This crate provides:
//! - Change record store with per-peer delivery state
//! - Peer registry with class filters and a single-flight guard
//! - Change capture from local mutations
//! - Transmission builder and sender-side outcome handling
//! - Ingestion of incoming transmissions, relay and confirmation
//! - Two-round synchronization orchestrator (pull then push)
//! - Transmission journal, administrator alerts, periodic tasks
//!
//! ## Architecture
//!
//! Every server except the root has one parent. A child drives the
//! exchange:
//! 1. Send an empty transmission asking the parent for its pending records
//! 2. Apply the records the parent embeds in its reply, in order
//! 3. Send the outcomes back together with the child's own pending records
//!
//! Parents never initiate. A record committed at one server is stored
//! there again and travels on towards the rest of the tree.
//!
//! ## Key Invariants
//!
//! - Records are delivered to each peer in creation order
//! - A stopped record blocks every later record for that peer
//! - Re-delivering a committed record has no effect
//! - Retry counts only grow when a record is actually sent
//! - At most one synchronization per peer runs at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod capture;
mod config;
mod error;
mod ingest;
mod journal;
mod node;
mod notifier;
mod object_store;
mod orchestrator;
mod peers;
mod store;
mod tasks;
mod transport;

pub use builder::{OutcomeSummary, PreparedTransmission, SentRecord};
pub use capture::ChangeCapture;
pub use config::{PurgeConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use journal::{Journal, JOURNAL_EXTENSION};
pub use node::{SyncNode, DEFAULT_ALERT_RECIPIENT};
pub use notifier::{Alert, LogNotifier, Notifier, RecordingNotifier};
pub use object_store::{ApplyError, MemoryObjectStore, ObjectStore};
pub use orchestrator::{SyncEngine, SyncStats};
pub use peers::{
    ClassFilter, MemoryPeerRegistry, Peer, PeerKind, PeerRegistry, PeerStatus, SyncGuard,
};
pub use store::{
    ChangeRecordStore, Delivery, MemoryRecordStore, PeerDeliveryRecord, Route, StoredImport,
};
pub use tasks::{CleanupTask, PurgeReport, SyncTask, TaskHandle};
pub use transport::{ExchangeHandler, LoopbackTransport, Transport};
