//! In-process replication trees.
//!
//! Every [`TestNode`] owns in-memory stores. [`link`] registers two nodes as
//! parent and child of each other and returns the child's engine, whose
//! transport calls straight into the parent.

use crate::fixtures::clinical_codec;
use std::sync::Arc;
use tempfile::TempDir;
use treesync_codec::EntityFields;
use treesync_engine::{
    ChangeCapture, ChangeRecordStore, LoopbackTransport, MemoryObjectStore, MemoryPeerRegistry,
    MemoryRecordStore, ObjectStore, Peer, PeerRegistry, RecordingNotifier, Route, SyncConfig,
    SyncEngine, SyncNode, SyncResult,
};
use treesync_protocol::{ItemState, RecordState};
use uuid::Uuid;

/// An entity created through [`TestNode::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    /// Global id of the entity.
    pub key: Uuid,
    /// Change record capturing the creation.
    pub record: Uuid,
}

/// One server with in-memory stores.
pub struct TestNode {
    /// Server uuid.
    pub uuid: Uuid,
    /// Nickname, also used as the authenticated identity.
    pub nickname: String,
    /// The node.
    pub node: Arc<SyncNode>,
    /// Its record store.
    pub store: Arc<MemoryRecordStore>,
    /// Its domain entities.
    pub objects: Arc<MemoryObjectStore>,
    /// Its peers.
    pub peers: Arc<MemoryPeerRegistry>,
    /// Alerts it raised.
    pub notifier: Arc<RecordingNotifier>,
    capture: ChangeCapture,
    journal: Option<TempDir>,
}

/// Builds a [`TestNode`].
pub struct TestNodeBuilder {
    nickname: String,
    config: SyncConfig,
    objects: MemoryObjectStore,
    journal: bool,
}

impl TestNodeBuilder {
    /// Adjusts the configuration.
    pub fn config(mut self, adjust: impl FnOnce(SyncConfig) -> SyncConfig) -> Self {
        self.config = adjust(self.config);
        self
    }

    /// Adds an object store validator for `entity_type`.
    pub fn validator<F>(mut self, entity_type: &str, check: F) -> Self
    where
        F: Fn(&EntityFields) -> Result<(), String> + Send + Sync + 'static,
    {
        self.objects = self.objects.with_validator(entity_type, check);
        self
    }

    /// Journals exchanges into a temporary directory.
    pub fn with_journal(mut self) -> Self {
        self.journal = true;
        self
    }

    /// Creates the node.
    pub fn build(self) -> TestNode {
        let journal = if self.journal {
            TempDir::new().ok()
        } else {
            None
        };
        let mut config = self.config;
        if let Some(dir) = &journal {
            config = config.with_journal_dir(dir.path().to_path_buf());
        }

        let uuid = config.server_uuid;
        let store = Arc::new(MemoryRecordStore::new());
        let objects = Arc::new(self.objects);
        let peers = Arc::new(MemoryPeerRegistry::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let capture = ChangeCapture::new(
            store.clone(),
            peers.clone(),
            objects.codec().clone(),
            config.database_version.clone(),
        )
        .with_creator(self.nickname.clone());
        let node = Arc::new(
            SyncNode::new(config, store.clone(), peers.clone(), objects.clone())
                .with_notifier(notifier.clone()),
        );

        TestNode {
            uuid,
            nickname: self.nickname,
            node,
            store,
            objects,
            peers,
            notifier,
            capture,
            journal,
        }
    }
}

impl TestNode {
    /// Starts building a node with the clinical codec and default settings.
    pub fn builder(nickname: &str) -> TestNodeBuilder {
        TestNodeBuilder {
            nickname: nickname.to_string(),
            config: SyncConfig::new(Uuid::new_v4()),
            objects: MemoryObjectStore::new(clinical_codec()),
            journal: false,
        }
    }

    /// A node with default settings.
    pub fn new(nickname: &str) -> Self {
        Self::builder(nickname).build()
    }

    /// Creates an entity locally and captures the change.
    pub fn create(&self, entity_type: &str, fields: EntityFields) -> SyncResult<Created> {
        let key = Uuid::new_v4();
        let item = self.capture.item(entity_type, key, ItemState::New, &fields)?;
        self.objects.apply_mutation(&item)?;
        let record = self.capture.capture(vec![item])?;
        Ok(Created { key, record })
    }

    /// Record-level state of a record: its delivery state towards the parent.
    pub fn upstream_state(&self, record: &Uuid) -> Option<RecordState> {
        self.store
            .delivery(record, Route::Upstream)
            .ok()
            .flatten()
            .map(|d| d.state)
    }

    /// Retry count of a record towards the parent.
    pub fn upstream_retries(&self, record: &Uuid) -> Option<u32> {
        self.store
            .delivery(record, Route::Upstream)
            .ok()
            .flatten()
            .map(|d| d.retry_count)
    }

    /// Delivery state of a record towards a child.
    pub fn downstream_state(&self, record: &Uuid, child: &TestNode) -> Option<RecordState> {
        self.store
            .delivery(record, Route::Downstream(child.uuid))
            .ok()
            .flatten()
            .map(|d| d.state)
    }

    /// The journal directory, when journaling.
    pub fn journal_dir(&self) -> Option<&std::path::Path> {
        self.journal.as_ref().map(TempDir::path)
    }
}

/// Makes `parent` the parent of `child` and returns the child's engine.
pub fn link(parent: &TestNode, child: &TestNode) -> Arc<SyncEngine<LoopbackTransport>> {
    let _ = parent.peers.save(
        Peer::child(child.uuid, child.nickname.as_str()).with_identity(child.nickname.as_str()),
    );
    let _ = child.peers.save(
        Peer::parent(parent.uuid, parent.nickname.as_str())
            .with_identity(parent.nickname.as_str()),
    );
    let transport = LoopbackTransport::new(parent.node.clone(), child.nickname.as_str());
    Arc::new(SyncEngine::new(child.node.clone(), transport))
}
