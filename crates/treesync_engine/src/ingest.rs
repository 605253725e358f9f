//! Ingestion of incoming transmissions.

use crate::builder::SentRecord;
use crate::error::SyncResult;
use crate::node::{Outstanding, SyncNode};
use crate::peers::Peer;
use crate::store::Route;
use chrono::Utc;
use tracing::{debug, info, warn};
use treesync_protocol::{
    ChangeItem, ChangeRecord, FailureKind, ImportRecord, RecordState, Transmission,
    TransmissionResponse, TransmissionState,
};
use uuid::Uuid;

impl SyncNode {
    /// Applies an incoming transmission, record by record.
    ///
    /// Processing stops at the first record that is neither committed nor
    /// filtered; later records get no outcome and stay pending at the
    /// sender. When the sender asks for it, the records pending for it are
    /// embedded in the response.
    ///
    /// # Errors
    ///
    /// Only infrastructure failures (record store, peer registry) are
    /// errors; record-level failures become import outcomes.
    pub fn ingest(&self, tx: &Transmission, caller: &str) -> SyncResult<TransmissionResponse> {
        let me = self.config.server_uuid;
        let Some(origin) = self.resolve_origin(tx.source, caller)? else {
            warn!(source = %tx.source, %caller, "transmission from unknown server");
            return Ok(TransmissionResponse::answering(
                tx,
                me,
                TransmissionState::CannotFindServerWithUuid,
            ));
        };

        self.peers
            .record_outcome(&origin.uuid, TransmissionState::Pending, Utc::now())?;
        self.receive_confirmations(&origin, &tx.confirmed_records)?;

        let mut response = TransmissionResponse::answering(tx, me, TransmissionState::Ok);
        for record in &tx.records {
            let import = self.ingest_record(&origin, record)?;
            let accepted = import.state.is_accepted_outcome();
            debug!(
                record = %record.uuid,
                peer = %origin.nickname,
                state = %import.state,
                "ingested record"
            );
            self.store.save_import(origin.uuid, import.clone())?;
            response.import_records.push(import);
            if !accepted {
                info!(
                    record = %record.uuid,
                    skipped = tx.records.len() - response.import_records.len(),
                    "stopping ingest after failed record"
                );
                break;
            }
        }

        response.state = if tx.max_retry_reached {
            TransmissionState::MaxRetryReached
        } else if tx.records.is_empty() {
            TransmissionState::OkNothingToDo
        } else if response.all_accepted() && response.import_records.len() == tx.records.len() {
            TransmissionState::Ok
        } else {
            TransmissionState::FailedRecords
        };

        if tx.requesting_reciprocal {
            if origin.disabled {
                info!(peer = %origin.nickname, "peer disabled, no reciprocal transmission");
            } else {
                match self.prepare_reciprocal(&origin) {
                    Ok(reverse) => response.embedded = Some(Box::new(reverse)),
                    Err(e) => {
                        warn!(peer = %origin.nickname, error = %e, "failed to build reciprocal transmission");
                        response.state = TransmissionState::TransmissionCreationFailed;
                    }
                }
            }
        }

        self.peers
            .record_outcome(&origin.uuid, response.state, Utc::now())?;
        info!(
            tx = %tx.uuid,
            peer = %origin.nickname,
            records = tx.records.len(),
            processed = response.import_records.len(),
            state = %response.state,
            "ingested transmission"
        );
        Ok(response)
    }

    /// Accepts a child's push: import outcomes for the records we handed it,
    /// plus its own records embedded.
    ///
    /// # Errors
    ///
    /// Fails on record store or peer registry errors.
    pub fn accept_push(
        &self,
        push: &TransmissionResponse,
        caller: &str,
    ) -> SyncResult<TransmissionResponse> {
        let me = self.config.server_uuid;
        let Some(origin) = self.resolve_origin(push.source, caller)? else {
            warn!(source = %push.source, %caller, "push from unknown server");
            return Ok(TransmissionResponse::new(
                push.uuid,
                me,
                Some(push.source),
                TransmissionState::CannotFindServerWithUuid,
            ));
        };
        self.journal.write_response(push);

        let route = Route::for_peer(&origin);
        let outstanding = self.outstanding.lock().remove(&origin.uuid);
        let sent = match outstanding {
            Some(o) if o.transmission == push.uuid => o.sent,
            stale => {
                if let Some(o) = stale {
                    self.restore(route, &o.sent);
                }
                self.snapshot_from_imports(route, push)?
            }
        };
        self.apply_outcomes(&origin, route, &sent, push)?;

        match push.embedded.as_deref() {
            Some(tx) => self.ingest(tx, caller),
            None => Ok(TransmissionResponse::new(
                push.uuid,
                me,
                Some(origin.uuid),
                TransmissionState::OkNothingToDo,
            )),
        }
    }

    fn ingest_record(&self, origin: &Peer, record: &ChangeRecord) -> SyncResult<ImportRecord> {
        if !self.peers.should_receive(origin, record) {
            info!(
                record = %record.uuid,
                peer = %origin.nickname,
                classes = %record.class_list(),
                "not accepting record, every type is filtered from this peer"
            );
            return Ok(ImportRecord::new(record, RecordState::NotSupposedToSync));
        }

        if record.database_version != self.config.database_version {
            return Ok(ImportRecord::failed(
                record,
                RecordState::Rejected,
                FailureKind::VersionMismatch,
                format!(
                    "record was created by database version {}, this server runs {}",
                    record.database_version, self.config.database_version
                ),
            ));
        }

        if let Some(previous) = self.store.get_import(&record.uuid)? {
            if previous.import.state.is_final() {
                return Ok(ImportRecord::new(record, RecordState::AlreadyCommitted));
            }
        }
        if self.store.get(&record.uuid)?.is_some() {
            return Ok(ImportRecord::new(record, RecordState::AlreadyCommitted));
        }

        let items: Vec<&ChangeItem> = record.items_for_apply().collect();
        match self.objects.apply_record(&items) {
            Ok(()) => {
                self.relay(origin, record)?;
                Ok(ImportRecord::new(record, RecordState::Committed))
            }
            Err(e) => {
                warn!(
                    record = %record.uuid,
                    peer = %origin.nickname,
                    retry = record.retry_count,
                    error = %e,
                    "failed to apply record"
                );
                Ok(ImportRecord::failed(record, RecordState::Failed, e.kind(), e.to_string()))
            }
        }
    }

    /// Stores a committed record so it travels on to the rest of the tree.
    fn relay(&self, origin: &Peer, record: &ChangeRecord) -> SyncResult<()> {
        let mut copy = record.clone();
        copy.retry_count = 0;
        copy.state = match self.peers.get_parent()? {
            Some(parent) if parent.uuid != origin.uuid => RecordState::New,
            _ => RecordState::AlreadyCommitted,
        };
        let children: Vec<Uuid> = self
            .peers
            .children()?
            .into_iter()
            .filter(|c| !c.disabled && c.uuid != origin.uuid)
            .map(|c| c.uuid)
            .collect();
        self.store.append(copy, &children)
    }

    fn prepare_reciprocal(&self, origin: &Peer) -> SyncResult<Transmission> {
        if let Some(stale) = self.outstanding.lock().remove(&origin.uuid) {
            debug!(peer = %origin.nickname, records = stale.sent.len(), "previous reciprocal never answered");
            self.restore(Route::for_peer(origin), &stale.sent);
        }

        let prepared = self.build_outbound(origin, self.config.max_records)?;
        self.mark_confirmed(&prepared.transmission.confirmed_records);
        self.outstanding.lock().insert(
            origin.uuid,
            Outstanding {
                transmission: prepared.transmission.uuid,
                sent: prepared.sent,
            },
        );
        Ok(prepared.transmission)
    }

    fn snapshot_from_imports(
        &self,
        route: Route,
        push: &TransmissionResponse,
    ) -> SyncResult<Vec<SentRecord>> {
        let mut sent = Vec::new();
        for import in &push.import_records {
            if let Some(current) = self.store.delivery(&import.source_record_uuid, route)? {
                sent.push(SentRecord {
                    uuid: import.source_record_uuid,
                    previous: current,
                    sent: current,
                });
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::object_store::{MemoryObjectStore, ObjectStore};
    use crate::peers::{ClassFilter, MemoryPeerRegistry, PeerRegistry};
    use crate::store::{ChangeRecordStore, MemoryRecordStore};
    use std::sync::Arc;
    use treesync_codec::{EntityDescriptor, EntityFields, FieldType, FieldValue, PayloadCodec};
    use treesync_protocol::ItemState;

    struct Fixture {
        node: SyncNode,
        store: Arc<MemoryRecordStore>,
        objects: Arc<MemoryObjectStore>,
        peers: Arc<MemoryPeerRegistry>,
        child: Peer,
        codec: PayloadCodec,
    }

    fn codec() -> PayloadCodec {
        PayloadCodec::default()
            .with_entity(EntityDescriptor::new("Patient").required("name", FieldType::Text))
            .with_entity(
                EntityDescriptor::new("Visit").required("patient", FieldType::reference("Patient")),
            )
    }

    fn fixture() -> Fixture {
        let child = Peer::child(Uuid::new_v4(), "clinic").with_identity("clinic-user");
        let store = Arc::new(MemoryRecordStore::new());
        let objects = Arc::new(MemoryObjectStore::new(codec()));
        let peers = Arc::new(MemoryPeerRegistry::with_peers([child.clone()]));
        let node = SyncNode::new(
            SyncConfig::new(Uuid::new_v4()),
            store.clone(),
            peers.clone(),
            objects.clone(),
        );
        Fixture {
            node,
            store,
            objects,
            peers,
            child,
            codec: codec(),
        }
    }

    fn patient(codec: &PayloadCodec, key: Uuid) -> ChangeRecord {
        let mut fields = EntityFields::new();
        fields.insert("name".into(), FieldValue::Text("Ana".into()));
        let payload = codec.encode_payload("Patient", &fields).unwrap();
        ChangeRecord::new("nurse", "1.0", vec![ChangeItem::new("Patient", key, ItemState::New, payload)]).unwrap()
    }

    fn visit(codec: &PayloadCodec, patient: Uuid) -> ChangeRecord {
        let mut fields = EntityFields::new();
        fields.insert("patient".into(), FieldValue::Reference(patient));
        let payload = codec.encode_payload("Visit", &fields).unwrap();
        ChangeRecord::new(
            "nurse",
            "1.0",
            vec![ChangeItem::new("Visit", Uuid::new_v4(), ItemState::New, payload)],
        )
        .unwrap()
    }

    fn transmission(f: &Fixture, records: Vec<ChangeRecord>) -> Transmission {
        let mut tx = Transmission::new(f.child.uuid, Some(f.node.server_uuid()));
        tx.records = records;
        tx
    }

    #[test]
    fn commits_in_order_and_relays() {
        let f = fixture();
        let p = Uuid::new_v4();
        let tx = transmission(&f, vec![patient(&f.codec, p), visit(&f.codec, p)]);

        let response = f.node.ingest(&tx, "clinic-user").unwrap();
        assert_eq!(response.state, TransmissionState::Ok);
        assert!(response.import_records.iter().all(|i| i.state == RecordState::Committed));
        assert_eq!(f.objects.len(), 2);

        let relayed = f.store.get(&tx.records[0].uuid).unwrap().unwrap();
        assert_eq!(relayed.state, RecordState::AlreadyCommitted);
        assert_eq!(relayed.original_uuid, tx.records[0].original_uuid);
        assert!(f
            .store
            .delivery(&relayed.uuid, Route::Downstream(f.child.uuid))
            .unwrap()
            .is_none());
        assert_eq!(
            f.peers.get(&f.child.uuid).unwrap().unwrap().last_sync_state,
            Some(TransmissionState::Ok)
        );
    }

    #[test]
    fn redelivery_is_idempotent() {
        let f = fixture();
        let tx = transmission(&f, vec![patient(&f.codec, Uuid::new_v4())]);

        f.node.ingest(&tx, "clinic-user").unwrap();
        let second = f.node.ingest(&tx, "clinic-user").unwrap();
        assert_eq!(second.import_records[0].state, RecordState::AlreadyCommitted);
        assert_eq!(f.objects.applied_count(), 1);
    }

    #[test]
    fn first_failure_stops_the_line() {
        let f = fixture();
        let p = Uuid::new_v4();
        let tx = transmission(
            &f,
            vec![
                visit(&f.codec, p),
                patient(&f.codec, p),
                patient(&f.codec, Uuid::new_v4()),
            ],
        );

        let response = f.node.ingest(&tx, "clinic-user").unwrap();
        assert_eq!(response.state, TransmissionState::FailedRecords);
        assert_eq!(response.import_records.len(), 1);
        let failed = &response.import_records[0];
        assert_eq!(failed.state, RecordState::Failed);
        assert_eq!(failed.error_kind, Some(FailureKind::ReferentNotFound));
        assert!(f.objects.is_empty());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let f = fixture();
        let mut record = patient(&f.codec, Uuid::new_v4());
        record.database_version = "0.9".into();
        let response = f.node.ingest(&transmission(&f, vec![record]), "clinic-user").unwrap();

        let import = &response.import_records[0];
        assert_eq!(import.state, RecordState::Rejected);
        assert_eq!(import.error_kind, Some(FailureKind::VersionMismatch));
        assert!(import.error_message.as_deref().unwrap().contains("0.9"));
    }

    #[test]
    fn filtered_types_are_not_applied() {
        let f = fixture();
        f.peers
            .save(f.child.clone().with_filter(ClassFilter::new("Patient", true, false)))
            .unwrap();
        let p = Uuid::new_v4();
        let response = f
            .node
            .ingest(&transmission(&f, vec![patient(&f.codec, p)]), "clinic-user")
            .unwrap();

        assert_eq!(response.import_records[0].state, RecordState::NotSupposedToSync);
        assert_eq!(response.state, TransmissionState::Ok);
        assert!(!f.objects.exists("Patient", &p));
    }

    #[test]
    fn unknown_uuid_falls_back_to_identity() {
        let f = fixture();
        let announced = Uuid::new_v4();
        let mut tx = transmission(&f, vec![]);
        tx.source = announced;

        let response = f.node.ingest(&tx, "clinic-user").unwrap();
        assert_eq!(response.state, TransmissionState::OkNothingToDo);
        assert_eq!(f.peers.get(&announced).unwrap().unwrap().nickname, "clinic");

        let mut stranger = transmission(&f, vec![]);
        stranger.source = Uuid::new_v4();
        let response = f.node.ingest(&stranger, "nobody").unwrap();
        assert_eq!(response.state, TransmissionState::CannotFindServerWithUuid);
    }

    #[test]
    fn reciprocal_request_embeds_pending_records() {
        let f = fixture();
        let local = patient(&f.codec, Uuid::new_v4());
        f.store.append(local.clone(), &[f.child.uuid]).unwrap();

        let request = Transmission::request(f.child.uuid, f.node.server_uuid());
        let response = f.node.ingest(&request, "clinic-user").unwrap();
        let embedded = response.embedded.as_deref().unwrap();
        assert_eq!(embedded.records.len(), 1);
        assert_eq!(embedded.records[0].uuid, local.uuid);
        assert_eq!(
            f.store
                .delivery(&local.uuid, Route::Downstream(f.child.uuid))
                .unwrap()
                .unwrap()
                .state,
            RecordState::Sent
        );

        // An unanswered reciprocal is undone before the next one is built.
        let again = f.node.ingest(&request, "clinic-user").unwrap();
        assert_eq!(again.embedded.unwrap().records[0].retry_count, 1);
    }

    #[test]
    fn disabled_peer_gets_nothing_back() {
        let f = fixture();
        f.peers.save(f.child.clone().disabled()).unwrap();
        let request = Transmission::request(f.child.uuid, f.node.server_uuid());
        let response = f.node.ingest(&request, "clinic-user").unwrap();
        assert!(response.embedded.is_none());
    }

    #[test]
    fn push_settles_outstanding_records() {
        let f = fixture();
        let local = patient(&f.codec, Uuid::new_v4());
        f.store.append(local.clone(), &[f.child.uuid]).unwrap();

        let request = Transmission::request(f.child.uuid, f.node.server_uuid());
        let reply = f.node.ingest(&request, "clinic-user").unwrap();
        let handed = reply.embedded.unwrap();

        let mut push = TransmissionResponse::answering(&handed, f.child.uuid, TransmissionState::Ok);
        push.import_records
            .push(ImportRecord::new(&handed.records[0], RecordState::Committed));
        let mut own = transmission(&f, vec![]);
        own.confirmed_records = vec![local.uuid];
        push.embedded = Some(Box::new(own));

        let answer = f.node.accept_push(&push, "clinic-user").unwrap();
        assert_eq!(answer.state, TransmissionState::OkNothingToDo);
        assert_eq!(
            f.store
                .delivery(&local.uuid, Route::Downstream(f.child.uuid))
                .unwrap()
                .unwrap()
                .state,
            RecordState::CommittedAndConfirmationSent
        );
    }
}
