//! Change records and their items.

use crate::error::{ProtocolError, ProtocolResult};
use crate::state::{ItemState, RecordState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use treesync_codec::Node;
use uuid::Uuid;

/// One mutation to one entity instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeItem {
    /// Entity type tag.
    pub contained_type: String,
    /// Global id of the mutated instance.
    pub key: Uuid,
    /// What happened to the instance.
    pub state: ItemState,
    /// Normalized field values; null for deletes.
    pub payload: Node,
}

impl ChangeItem {
    /// Creates an item.
    pub fn new(contained_type: impl Into<String>, key: Uuid, state: ItemState, payload: Node) -> Self {
        Self {
            contained_type: contained_type.into(),
            key,
            state,
            payload,
        }
    }

    /// Creates a delete item with no payload.
    pub fn deleted(contained_type: impl Into<String>, key: Uuid) -> Self {
        Self::new(contained_type, key, ItemState::Deleted, Node::Null)
    }
}

/// An atomic, ordered bundle of items from one logical transaction.
///
/// The `uuid` is assigned once and kept across every hop; receivers use it
/// to recognise a record they have already committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Global identity and idempotency key.
    pub uuid: Uuid,
    /// The uuid this record had where it was first captured.
    pub original_uuid: Uuid,
    /// Who made the change.
    pub creator_id: String,
    /// Compatibility tag of the producing database.
    pub database_version: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Delivery attempts so far.
    pub retry_count: u32,
    /// Lifecycle state.
    pub state: RecordState,
    /// Distinct entity types among the items.
    pub contained_classes: BTreeSet<String>,
    items: Vec<ChangeItem>,
}

impl ChangeRecord {
    /// Creates a `New` record from its items.
    ///
    /// # Errors
    ///
    /// Returns `EmptyRecord` if `items` is empty.
    pub fn new(
        creator_id: impl Into<String>,
        database_version: impl Into<String>,
        items: Vec<ChangeItem>,
    ) -> ProtocolResult<Self> {
        let uuid = Uuid::new_v4();
        if items.is_empty() {
            return Err(ProtocolError::EmptyRecord { uuid });
        }
        let contained_classes = items.iter().map(|i| i.contained_type.clone()).collect();
        Ok(Self {
            uuid,
            original_uuid: uuid,
            creator_id: creator_id.into(),
            database_version: database_version.into(),
            timestamp: Utc::now(),
            retry_count: 0,
            state: RecordState::New,
            contained_classes,
            items,
        })
    }

    /// Items in capture order.
    pub fn items(&self) -> &[ChangeItem] {
        &self.items
    }

    /// Items in application order: creates and updates first, then deletes.
    pub fn items_for_apply(&self) -> impl Iterator<Item = &ChangeItem> {
        let upserts = self.items.iter().filter(|i| i.state != ItemState::Deleted);
        let deletes = self.items.iter().filter(|i| i.state == ItemState::Deleted);
        upserts.chain(deletes)
    }

    /// True if any item deletes an entity.
    pub fn has_deletes(&self) -> bool {
        self.items.iter().any(|i| i.state == ItemState::Deleted)
    }

    /// Checks invariants that deserialization cannot enforce.
    ///
    /// # Errors
    ///
    /// Returns `EmptyRecord` for a record without items and `Malformed` if
    /// the contained class set disagrees with the items.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.items.is_empty() {
            return Err(ProtocolError::EmptyRecord { uuid: self.uuid });
        }
        let derived: BTreeSet<&str> = self.items.iter().map(|i| i.contained_type.as_str()).collect();
        let declared: BTreeSet<&str> = self.contained_classes.iter().map(String::as_str).collect();
        if derived != declared {
            return Err(ProtocolError::Malformed(format!(
                "record {} declares classes {:?} but carries {:?}",
                self.uuid, declared, derived
            )));
        }
        Ok(())
    }

    /// Human-readable list of contained types.
    pub fn class_list(&self) -> String {
        self.contained_classes
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}
