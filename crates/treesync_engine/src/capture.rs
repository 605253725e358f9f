//! Change capture: turns local mutations into change records.

use crate::error::SyncResult;
use crate::peers::PeerRegistry;
use crate::store::ChangeRecordStore;
use std::sync::Arc;
use tracing::debug;
use treesync_codec::{EntityFields, PayloadCodec};
use treesync_protocol::{ChangeItem, ChangeRecord, ItemState};
use uuid::Uuid;

/// Records local mutations for replication.
pub struct ChangeCapture {
    store: Arc<dyn ChangeRecordStore>,
    peers: Arc<dyn PeerRegistry>,
    codec: PayloadCodec,
    creator_id: String,
    database_version: String,
}

impl ChangeCapture {
    /// Creates a capture hook writing into `store`.
    pub fn new(
        store: Arc<dyn ChangeRecordStore>,
        peers: Arc<dyn PeerRegistry>,
        codec: PayloadCodec,
        database_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            peers,
            codec,
            creator_id: "system".into(),
            database_version: database_version.into(),
        }
    }

    /// Sets the creator stamped on captured records.
    pub fn with_creator(mut self, creator_id: impl Into<String>) -> Self {
        self.creator_id = creator_id.into();
        self
    }

    /// Builds an item for a create or update.
    pub fn item(
        &self,
        entity_type: &str,
        key: Uuid,
        state: ItemState,
        fields: &EntityFields,
    ) -> SyncResult<ChangeItem> {
        let payload = self.codec.encode_payload(entity_type, fields)?;
        Ok(ChangeItem::new(entity_type, key, state, payload))
    }

    /// Stores one transaction's items as a new record, queued for the
    /// parent and for every enabled child.
    ///
    /// # Errors
    ///
    /// Fails for an empty item list or if the store fails.
    pub fn capture(&self, items: Vec<ChangeItem>) -> SyncResult<Uuid> {
        let record = ChangeRecord::new(self.creator_id.as_str(), self.database_version.as_str(), items)?;
        let uuid = record.uuid;
        let children: Vec<Uuid> = self
            .peers
            .children()?
            .into_iter()
            .filter(|c| !c.disabled)
            .map(|c| c.uuid)
            .collect();
        debug!(record = %uuid, classes = %record.class_list(), children = children.len(), "captured change record");
        self.store.append(record, &children)?;
        Ok(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::{MemoryPeerRegistry, Peer};
    use crate::store::{MemoryRecordStore, Route};
    use treesync_codec::{EntityDescriptor, FieldType, FieldValue};
    use treesync_protocol::RecordState;

    #[test]
    fn capture_queues_for_enabled_children() {
        let (c1, c2) = (
            Peer::child(Uuid::new_v4(), "one"),
            Peer::child(Uuid::new_v4(), "two").disabled(),
        );
        let store = Arc::new(MemoryRecordStore::new());
        let peers = Arc::new(MemoryPeerRegistry::with_peers([c1.clone(), c2.clone()]));
        let codec = PayloadCodec::default()
            .with_entity(EntityDescriptor::new("Note").required("text", FieldType::Text));
        let capture = ChangeCapture::new(store.clone(), peers, codec, "1.0").with_creator("nurse");

        let mut fields = EntityFields::new();
        fields.insert("text".into(), FieldValue::Text("hello".into()));
        let item = capture.item("Note", Uuid::new_v4(), ItemState::New, &fields).unwrap();
        let uuid = capture.capture(vec![item]).unwrap();

        let stored = store.get(&uuid).unwrap().unwrap();
        assert_eq!(stored.creator_id, "nurse");
        assert_eq!(stored.state, RecordState::New);
        assert!(store.delivery(&uuid, Route::Downstream(c1.uuid)).unwrap().is_some());
        assert!(store.delivery(&uuid, Route::Downstream(c2.uuid)).unwrap().is_none());
    }

    #[test]
    fn empty_capture_fails() {
        let capture = ChangeCapture::new(
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryPeerRegistry::new()),
            PayloadCodec::default(),
            "1.0",
        );
        assert!(capture.capture(Vec::new()).is_err());
    }
}
