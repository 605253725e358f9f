//! Change record store.
//!
//! One arena of change records plus an indexed table of per-child delivery
//! state. The record-level `state`/`retry_count` track delivery to the parent;
//! every child has its own [`Delivery`] row so fan-out progresses
//! independently per peer.

use crate::error::{SyncError, SyncResult};
use crate::peers::{Peer, PeerKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use treesync_protocol::{ChangeRecord, ImportRecord, ItemState, RecordState};
use uuid::Uuid;

/// Direction a record is delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// To this node's parent; uses the record-level state.
    Upstream,
    /// To the given child; uses that child's delivery row.
    Downstream(Uuid),
}

impl Route {
    /// The route used to deliver to `peer`.
    pub fn for_peer(peer: &Peer) -> Self {
        match peer.kind {
            PeerKind::Parent => Route::Upstream,
            PeerKind::Child => Route::Downstream(peer.uuid),
        }
    }
}

/// Delivery progress of one record along one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Lifecycle state.
    pub state: RecordState,
    /// Attempts so far.
    pub retry_count: u32,
}

impl Delivery {
    /// A delivery that has not been attempted.
    pub fn new() -> Self {
        Self {
            state: RecordState::New,
            retry_count: 0,
        }
    }

    /// Same retry count, different state.
    pub fn with_state(self, state: RecordState) -> Self {
        Self { state, ..self }
    }
}

impl Default for Delivery {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery row of a record towards one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDeliveryRecord {
    /// The record.
    pub record: Uuid,
    /// The child.
    pub peer: Uuid,
    /// Progress.
    pub delivery: Delivery,
}

/// An import outcome together with the peer the record came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImport {
    /// Peer that sent the record.
    pub origin: Uuid,
    /// The outcome.
    pub import: ImportRecord,
}

/// Durable table of change records, delivery rows and import outcomes.
///
/// Each method must be atomic on its own; callers do not hold locks across
/// calls.
pub trait ChangeRecordStore: Send + Sync {
    /// Stores a new record with a fresh delivery row per child.
    ///
    /// # Errors
    ///
    /// Fails if a record with the same uuid is already stored.
    fn append(&self, record: ChangeRecord, children: &[Uuid]) -> SyncResult<()>;

    /// Looks up a record. Its state reflects the upstream route.
    fn get(&self, uuid: &Uuid) -> SyncResult<Option<ChangeRecord>>;

    /// Records still to be delivered along `route`, in creation order.
    ///
    /// The returned copies carry the state and retry count of that route.
    fn list_pending(&self, route: Route, limit: usize) -> SyncResult<Vec<ChangeRecord>>;

    /// Records created at or after `since` that create or update entities.
    fn list_changed_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<ChangeRecord>>;

    /// Records created at or after `since` that delete entities.
    fn list_deleted_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<ChangeRecord>>;

    /// Delivery progress along `route`, if the record travels that way.
    fn delivery(&self, uuid: &Uuid, route: Route) -> SyncResult<Option<Delivery>>;

    /// Every delivery row of a record.
    fn deliveries(&self, uuid: &Uuid) -> SyncResult<Vec<PeerDeliveryRecord>>;

    /// Moves every delivery row of `old` to the peer now known as `new`.
    fn reassign_peer(&self, old: &Uuid, new: Uuid) -> SyncResult<usize>;

    /// Sets delivery progress along `route`.
    fn update_state(&self, uuid: &Uuid, route: Route, delivery: Delivery) -> SyncResult<()>;

    /// Removes delivered records created before `before`.
    ///
    /// A record goes when its record-level state is final or listed in
    /// `states`, and every delivery row is committed or filtered.
    fn purge_committed(&self, before: DateTime<Utc>, states: &[RecordState]) -> SyncResult<usize>;

    /// Stores the outcome of ingesting a record, replacing any earlier one.
    fn save_import(&self, origin: Uuid, import: ImportRecord) -> SyncResult<()>;

    /// Looks up the outcome for a record.
    fn get_import(&self, uuid: &Uuid) -> SyncResult<Option<StoredImport>>;

    /// Outcomes of records received from `origin` in any of `states`.
    fn list_imports(&self, origin: &Uuid, states: &[RecordState]) -> SyncResult<Vec<ImportRecord>>;

    /// Changes the state of an import outcome.
    fn update_import_state(&self, uuid: &Uuid, state: RecordState) -> SyncResult<()>;

    /// Removes import outcomes recorded before `before`.
    fn purge_imports(&self, before: DateTime<Utc>) -> SyncResult<usize>;
}

#[derive(Default)]
struct Tables {
    order: Vec<Uuid>,
    records: HashMap<Uuid, ChangeRecord>,
    deliveries: HashMap<Uuid, Vec<(Uuid, Delivery)>>,
    imports: HashMap<Uuid, StoredImport>,
    import_order: Vec<Uuid>,
}

impl Tables {
    fn delivery(&self, uuid: &Uuid, route: Route) -> Option<Delivery> {
        match route {
            Route::Upstream => self.records.get(uuid).map(|r| Delivery {
                state: r.state,
                retry_count: r.retry_count,
            }),
            Route::Downstream(peer) => self
                .deliveries
                .get(uuid)?
                .iter()
                .find(|(p, _)| *p == peer)
                .map(|(_, d)| *d),
        }
    }

    fn is_delivered(&self, uuid: &Uuid) -> bool {
        self.deliveries.get(uuid).map_or(true, |rows| {
            rows.iter().all(|(_, d)| {
                d.state.is_final() || d.state == RecordState::NotSupposedToSync
            })
        })
    }
}

/// An in-memory record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<Tables>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.tables.read().order.len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored import outcomes.
    pub fn import_count(&self) -> usize {
        self.tables.read().imports.len()
    }
}

impl ChangeRecordStore for MemoryRecordStore {
    fn append(&self, record: ChangeRecord, children: &[Uuid]) -> SyncResult<()> {
        let mut tables = self.tables.write();
        if tables.records.contains_key(&record.uuid) {
            return Err(SyncError::store(format!(
                "record {} already stored",
                record.uuid
            )));
        }
        let uuid = record.uuid;
        let rows = children.iter().map(|c| (*c, Delivery::new())).collect();
        tables.order.push(uuid);
        tables.records.insert(uuid, record);
        tables.deliveries.insert(uuid, rows);
        Ok(())
    }

    fn get(&self, uuid: &Uuid) -> SyncResult<Option<ChangeRecord>> {
        Ok(self.tables.read().records.get(uuid).cloned())
    }

    fn list_pending(&self, route: Route, limit: usize) -> SyncResult<Vec<ChangeRecord>> {
        let tables = self.tables.read();
        let pending = tables
            .order
            .iter()
            .filter_map(|uuid| {
                let delivery = tables.delivery(uuid, route)?;
                if !delivery.state.is_pending() {
                    return None;
                }
                let mut record = tables.records.get(uuid)?.clone();
                record.state = delivery.state;
                record.retry_count = delivery.retry_count;
                Some(record)
            })
            .take(limit)
            .collect();
        Ok(pending)
    }

    fn list_changed_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<ChangeRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .order
            .iter()
            .filter_map(|u| tables.records.get(u))
            .filter(|r| r.timestamp >= since)
            .filter(|r| r.items().iter().any(|i| i.state != ItemState::Deleted))
            .cloned()
            .collect())
    }

    fn list_deleted_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<ChangeRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .order
            .iter()
            .filter_map(|u| tables.records.get(u))
            .filter(|r| r.timestamp >= since && r.has_deletes())
            .cloned()
            .collect())
    }

    fn delivery(&self, uuid: &Uuid, route: Route) -> SyncResult<Option<Delivery>> {
        Ok(self.tables.read().delivery(uuid, route))
    }

    fn deliveries(&self, uuid: &Uuid) -> SyncResult<Vec<PeerDeliveryRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .deliveries
            .get(uuid)
            .map(|rows| {
                rows.iter()
                    .map(|(peer, delivery)| PeerDeliveryRecord {
                        record: *uuid,
                        peer: *peer,
                        delivery: *delivery,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn reassign_peer(&self, old: &Uuid, new: Uuid) -> SyncResult<usize> {
        let mut tables = self.tables.write();
        let mut moved = 0;
        for rows in tables.deliveries.values_mut() {
            for (peer, _) in rows.iter_mut().filter(|(p, _)| p == old) {
                *peer = new;
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn update_state(&self, uuid: &Uuid, route: Route, delivery: Delivery) -> SyncResult<()> {
        let mut tables = self.tables.write();
        match route {
            Route::Upstream => {
                let record = tables
                    .records
                    .get_mut(uuid)
                    .ok_or_else(|| SyncError::store(format!("no record {uuid}")))?;
                record.state = delivery.state;
                record.retry_count = delivery.retry_count;
            }
            Route::Downstream(peer) => {
                let row = tables
                    .deliveries
                    .get_mut(uuid)
                    .and_then(|rows| rows.iter_mut().find(|(p, _)| *p == peer))
                    .ok_or_else(|| {
                        SyncError::store(format!("no delivery of {uuid} to peer {peer}"))
                    })?;
                row.1 = delivery;
            }
        }
        Ok(())
    }

    fn purge_committed(&self, before: DateTime<Utc>, states: &[RecordState]) -> SyncResult<usize> {
        let mut tables = self.tables.write();
        let doomed: Vec<Uuid> = tables
            .order
            .iter()
            .filter(|uuid| {
                tables.records.get(uuid).map_or(false, |r| {
                    r.timestamp < before
                        && (r.state.is_final() || states.contains(&r.state))
                        && tables.is_delivered(uuid)
                })
            })
            .copied()
            .collect();

        for uuid in &doomed {
            tables.records.remove(uuid);
            tables.deliveries.remove(uuid);
        }
        tables.order.retain(|u| !doomed.contains(u));
        Ok(doomed.len())
    }

    fn save_import(&self, origin: Uuid, import: ImportRecord) -> SyncResult<()> {
        let mut tables = self.tables.write();
        let uuid = import.source_record_uuid;
        if tables
            .imports
            .insert(uuid, StoredImport { origin, import })
            .is_none()
        {
            tables.import_order.push(uuid);
        }
        Ok(())
    }

    fn get_import(&self, uuid: &Uuid) -> SyncResult<Option<StoredImport>> {
        Ok(self.tables.read().imports.get(uuid).cloned())
    }

    fn list_imports(&self, origin: &Uuid, states: &[RecordState]) -> SyncResult<Vec<ImportRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .import_order
            .iter()
            .filter_map(|u| tables.imports.get(u))
            .filter(|s| s.origin == *origin && states.contains(&s.import.state))
            .map(|s| s.import.clone())
            .collect())
    }

    fn update_import_state(&self, uuid: &Uuid, state: RecordState) -> SyncResult<()> {
        let mut tables = self.tables.write();
        let stored = tables
            .imports
            .get_mut(uuid)
            .ok_or_else(|| SyncError::store(format!("no import record for {uuid}")))?;
        stored.import.state = state;
        Ok(())
    }

    fn purge_imports(&self, before: DateTime<Utc>) -> SyncResult<usize> {
        let mut tables = self.tables.write();
        let before_count = tables.imports.len();
        tables.imports.retain(|_, s| s.import.timestamp >= before);
        let Tables {
            imports,
            import_order,
            ..
        } = &mut *tables;
        import_order.retain(|u| imports.contains_key(u));
        Ok(before_count - imports.len())
    }
}
