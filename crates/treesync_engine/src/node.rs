//! A replication node: the components one server needs to take part in
//! the tree.

use crate::builder::SentRecord;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::journal::Journal;
use crate::notifier::{LogNotifier, Notifier};
use crate::object_store::ObjectStore;
use crate::peers::{Peer, PeerRegistry};
use crate::store::ChangeRecordStore;
use crate::transport::ExchangeHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use treesync_protocol::{ChangeRecord, Exchange};
use uuid::Uuid;

/// Recipient used when no administrator address is configured.
pub const DEFAULT_ALERT_RECIPIENT: &str = "administrator";

/// A reciprocal transmission handed to a child and not yet answered.
#[derive(Debug, Clone)]
pub(crate) struct Outstanding {
    pub(crate) transmission: Uuid,
    pub(crate) sent: Vec<SentRecord>,
}

/// One server of the replication tree.
///
/// Owns handles to the record store, peer registry and object store, and
/// answers exchanges from children through [`ExchangeHandler`].
pub struct SyncNode {
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<dyn ChangeRecordStore>,
    pub(crate) peers: Arc<dyn PeerRegistry>,
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) journal: Journal,
    pub(crate) outstanding: Mutex<HashMap<Uuid, Outstanding>>,
}

impl SyncNode {
    /// Creates a node. Alerts go to the log until a notifier is set.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ChangeRecordStore>,
        peers: Arc<dyn PeerRegistry>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let journal = Journal::new(config.journal_dir.clone());
        Self {
            config,
            store,
            peers,
            objects,
            notifier: Arc::new(LogNotifier),
            journal,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the alert channel.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// This node's configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// This node's identity.
    pub fn server_uuid(&self) -> Uuid {
        self.config.server_uuid
    }

    /// The record store.
    pub fn store(&self) -> &Arc<dyn ChangeRecordStore> {
        &self.store
    }

    /// The peer registry.
    pub fn peers(&self) -> &Arc<dyn PeerRegistry> {
        &self.peers
    }

    /// The object store.
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    /// The transmission journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Sends an administrator alert. Failures are only logged.
    pub(crate) fn alert(&self, subject: &str, body: &str) {
        let recipient = self
            .config
            .admin_email
            .as_deref()
            .unwrap_or(DEFAULT_ALERT_RECIPIENT);
        match self.notifier.alert(recipient, subject, body) {
            Ok(()) => debug!(%recipient, %subject, "alert sent"),
            Err(e) => error!(%recipient, %subject, error = %e, "failed to send alert"),
        }
    }

    /// Alerts about a record that blocks delivery to `peer`.
    pub(crate) fn alert_stopped(&self, peer: &Peer, record: &ChangeRecord, reason: &str) {
        warn!(
            record = %record.uuid,
            peer = %peer.nickname,
            retries = record.retry_count,
            "record stopped: {reason}"
        );
        let subject = format!("Synchronization with {} stopped", peer.nickname);
        let body = format!(
            "Change record {} ({}) could not be delivered to {} after {} attempts: {}.\n\
             Records created after it are held back until it is resolved.",
            record.uuid,
            record.class_list(),
            peer.nickname,
            record.retry_count,
            reason
        );
        self.alert(&subject, &body);
    }

    /// Finds the peer behind an incoming exchange.
    ///
    /// Falls back to the caller identity when the source uuid is unknown and
    /// adopts the uuid the peer announced.
    pub(crate) fn resolve_origin(&self, source: Uuid, caller: &str) -> SyncResult<Option<Peer>> {
        if let Some(peer) = self.peers.get(&source)? {
            return Ok(Some(peer));
        }
        let Some(peer) = self.peers.find_by_identity(caller)? else {
            return Ok(None);
        };
        warn!(
            peer = %peer.nickname,
            old = %peer.uuid,
            new = %source,
            "peer contacted us under a new uuid, adopting it"
        );
        self.peers.rekey(&peer.uuid, source)?;
        self.store.reassign_peer(&peer.uuid, source)?;
        self.peers.get(&source)
    }
}

impl ExchangeHandler for SyncNode {
    fn handle(&self, payload: &[u8], caller: &str) -> SyncResult<Vec<u8>> {
        let exchange = Exchange::decode(payload).map_err(|e| {
            warn!(%caller, error = %e, "rejecting undecodable exchange");
            SyncError::from(e)
        })?;
        let response = match exchange {
            Exchange::Transmission(tx) => self.ingest(&tx, caller)?,
            Exchange::Response(response) => self.accept_push(&response, caller)?,
        };
        Ok(Exchange::Response(response).encode()?)
    }
}
