//! Peer registry and the per-peer single-flight guard.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use treesync_protocol::{ChangeRecord, TransmissionState};
use uuid::Uuid;

/// Position of a peer relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKind {
    /// The single upstream server.
    Parent,
    /// A downstream server.
    Child,
}

/// Send/receive switch for an entity type or a dotted prefix of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFilter {
    /// Type name or dotted prefix ("clinical" covers "clinical.Obs").
    pub pattern: String,
    /// Records of matching types go to the peer.
    pub send: bool,
    /// Records of matching types are accepted from the peer.
    pub receive: bool,
}

impl ClassFilter {
    /// Creates a filter.
    pub fn new(pattern: impl Into<String>, send: bool, receive: bool) -> Self {
        Self {
            pattern: pattern.into(),
            send,
            receive,
        }
    }

    fn matches(&self, type_name: &str) -> bool {
        type_name == self.pattern
            || (type_name.len() > self.pattern.len()
                && type_name.starts_with(&self.pattern)
                && type_name.as_bytes()[self.pattern.len()] == b'.')
    }
}

/// A replication partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Identity of the peer's server.
    pub uuid: Uuid,
    /// Display name.
    pub nickname: String,
    /// Where the transport reaches the peer.
    pub address: String,
    /// Authenticated caller name the peer uses when contacting us.
    pub identity: String,
    /// Parent or child.
    pub kind: PeerKind,
    /// Disabled peers get no reciprocal transmissions.
    pub disabled: bool,
    /// Set while a synchronize attempt is running against this peer.
    pub in_sync_in_progress: bool,
    /// End of the last exchange.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Outcome of the last exchange.
    pub last_sync_state: Option<TransmissionState>,
    /// Per-type switches; types without a match are sent and received.
    pub class_filters: Vec<ClassFilter>,
}

impl Peer {
    /// Creates a peer.
    pub fn new(uuid: Uuid, nickname: impl Into<String>, kind: PeerKind) -> Self {
        let nickname = nickname.into();
        Self {
            uuid,
            address: format!("loopback://{nickname}"),
            identity: nickname.clone(),
            nickname,
            kind,
            disabled: false,
            in_sync_in_progress: false,
            last_sync_time: None,
            last_sync_state: None,
            class_filters: Vec::new(),
        }
    }

    /// Creates the parent peer.
    pub fn parent(uuid: Uuid, nickname: impl Into<String>) -> Self {
        Self::new(uuid, nickname, PeerKind::Parent)
    }

    /// Creates a child peer.
    pub fn child(uuid: Uuid, nickname: impl Into<String>) -> Self {
        Self::new(uuid, nickname, PeerKind::Child)
    }

    /// Sets the transport address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the caller identity.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Adds a class filter.
    pub fn with_filter(mut self, filter: ClassFilter) -> Self {
        self.class_filters.push(filter);
        self
    }

    /// Marks the peer disabled.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    fn best_filter(&self, type_name: &str) -> Option<&ClassFilter> {
        self.class_filters
            .iter()
            .filter(|f| f.matches(type_name))
            .max_by_key(|f| f.pattern.len())
    }

    /// True if records of `type_name` go to this peer.
    pub fn sends(&self, type_name: &str) -> bool {
        self.best_filter(type_name).map_or(true, |f| f.send)
    }

    /// True if records of `type_name` are accepted from this peer.
    pub fn receives(&self, type_name: &str) -> bool {
        self.best_filter(type_name).map_or(true, |f| f.receive)
    }
}

/// Administrator view of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    /// Identity.
    pub uuid: Uuid,
    /// Display name.
    pub nickname: String,
    /// Parent or child.
    pub kind: PeerKind,
    /// Disabled flag.
    pub disabled: bool,
    /// End of the last exchange.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Outcome of the last exchange.
    pub last_sync_state: Option<TransmissionState>,
    /// A synchronize attempt is running.
    pub in_sync_in_progress: bool,
}

impl From<&Peer> for PeerStatus {
    fn from(peer: &Peer) -> Self {
        Self {
            uuid: peer.uuid,
            nickname: peer.nickname.clone(),
            kind: peer.kind,
            disabled: peer.disabled,
            last_sync_time: peer.last_sync_time,
            last_sync_state: peer.last_sync_state,
            in_sync_in_progress: peer.in_sync_in_progress,
        }
    }
}

/// Durable table of known peers.
pub trait PeerRegistry: Send + Sync {
    /// Looks up a peer.
    fn get(&self, uuid: &Uuid) -> SyncResult<Option<Peer>>;

    /// The parent, if one is configured.
    fn get_parent(&self) -> SyncResult<Option<Peer>>;

    /// Looks up a peer by the identity it authenticates with.
    fn find_by_identity(&self, identity: &str) -> SyncResult<Option<Peer>>;

    /// Inserts or replaces a peer. The in-progress flag is owned by the
    /// guard and is not overwritten.
    fn save(&self, peer: Peer) -> SyncResult<()>;

    /// Replaces the uuid of a peer first contacted under an unknown uuid.
    fn rekey(&self, old: &Uuid, new: Uuid) -> SyncResult<()>;

    /// Every child, disabled ones included.
    fn children(&self) -> SyncResult<Vec<Peer>>;

    /// Atomically sets the in-progress flag. Returns false if it was set.
    fn set_in_progress(&self, uuid: &Uuid) -> SyncResult<bool>;

    /// Clears the in-progress flag.
    fn clear_in_progress(&self, uuid: &Uuid) -> SyncResult<()>;

    /// Persists the outcome of an exchange.
    fn record_outcome(
        &self,
        uuid: &Uuid,
        state: TransmissionState,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Snapshot of every peer for an administrator.
    fn status(&self) -> SyncResult<Vec<PeerStatus>>;

    /// False if every type in the record is filtered out for sending.
    fn should_send(&self, peer: &Peer, record: &ChangeRecord) -> bool {
        record.contained_classes.is_empty()
            || record.contained_classes.iter().any(|t| peer.sends(t))
    }

    /// False if every type in the record is filtered out for receipt.
    fn should_receive(&self, peer: &Peer, record: &ChangeRecord) -> bool {
        record.contained_classes.is_empty()
            || record.contained_classes.iter().any(|t| peer.receives(t))
    }
}

/// An in-memory peer registry.
#[derive(Default)]
pub struct MemoryPeerRegistry {
    peers: RwLock<HashMap<Uuid, Peer>>,
}

impl MemoryPeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `peers`.
    pub fn with_peers(peers: impl IntoIterator<Item = Peer>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.peers.write();
            for peer in peers {
                map.insert(peer.uuid, peer);
            }
        }
        registry
    }
}

impl PeerRegistry for MemoryPeerRegistry {
    fn get(&self, uuid: &Uuid) -> SyncResult<Option<Peer>> {
        Ok(self.peers.read().get(uuid).cloned())
    }

    fn get_parent(&self) -> SyncResult<Option<Peer>> {
        Ok(self
            .peers
            .read()
            .values()
            .find(|p| p.kind == PeerKind::Parent)
            .cloned())
    }

    fn find_by_identity(&self, identity: &str) -> SyncResult<Option<Peer>> {
        Ok(self
            .peers
            .read()
            .values()
            .find(|p| p.identity == identity)
            .cloned())
    }

    fn save(&self, mut peer: Peer) -> SyncResult<()> {
        let mut peers = self.peers.write();
        if let Some(existing) = peers.get(&peer.uuid) {
            peer.in_sync_in_progress = existing.in_sync_in_progress;
        }
        peers.insert(peer.uuid, peer);
        Ok(())
    }

    fn rekey(&self, old: &Uuid, new: Uuid) -> SyncResult<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(&new) {
            return Err(SyncError::store(format!("peer {new} already registered")));
        }
        let mut peer = peers.remove(old).ok_or(SyncError::UnknownPeer(*old))?;
        peer.uuid = new;
        peers.insert(new, peer);
        Ok(())
    }

    fn children(&self) -> SyncResult<Vec<Peer>> {
        let mut children: Vec<Peer> = self
            .peers
            .read()
            .values()
            .filter(|p| p.kind == PeerKind::Child)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        Ok(children)
    }

    fn set_in_progress(&self, uuid: &Uuid) -> SyncResult<bool> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(uuid).ok_or(SyncError::UnknownPeer(*uuid))?;
        if peer.in_sync_in_progress {
            return Ok(false);
        }
        peer.in_sync_in_progress = true;
        Ok(true)
    }

    fn clear_in_progress(&self, uuid: &Uuid) -> SyncResult<()> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(uuid).ok_or(SyncError::UnknownPeer(*uuid))?;
        peer.in_sync_in_progress = false;
        Ok(())
    }

    fn record_outcome(
        &self,
        uuid: &Uuid,
        state: TransmissionState,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(uuid).ok_or(SyncError::UnknownPeer(*uuid))?;
        peer.last_sync_state = Some(state);
        peer.last_sync_time = Some(at);
        Ok(())
    }

    fn status(&self) -> SyncResult<Vec<PeerStatus>> {
        let mut status: Vec<PeerStatus> = self.peers.read().values().map(PeerStatus::from).collect();
        status.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        Ok(status)
    }
}

/// Holds a peer's in-progress flag and clears it on drop.
pub struct SyncGuard {
    registry: Arc<dyn PeerRegistry>,
    peer: Uuid,
}

impl SyncGuard {
    /// Tries to take the flag. Returns `None` if another attempt holds it.
    pub fn acquire(registry: Arc<dyn PeerRegistry>, peer: Uuid) -> SyncResult<Option<Self>> {
        if registry.set_in_progress(&peer)? {
            Ok(Some(Self { registry, peer }))
        } else {
            Ok(None)
        }
    }

    /// The guarded peer.
    pub fn peer(&self) -> Uuid {
        self.peer
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registry.clear_in_progress(&self.peer) {
            tracing::error!(peer = %self.peer, error = %e, "failed to release sync guard");
        }
    }
}
