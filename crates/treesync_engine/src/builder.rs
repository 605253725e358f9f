//! Outbound transmissions and the sender side of record outcomes.

use crate::error::SyncResult;
use crate::node::SyncNode;
use crate::peers::Peer;
use crate::store::{Delivery, Route};
use tracing::{debug, info, warn};
use treesync_protocol::{RecordState, Transmission, TransmissionResponse};
use uuid::Uuid;

/// A record packaged into a transmission, with the delivery state it had
/// before so the send can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentRecord {
    /// The record.
    pub uuid: Uuid,
    /// Delivery state before packaging.
    pub previous: Delivery,
    /// Delivery state written when packaging.
    pub sent: Delivery,
}

/// A built transmission and the bookkeeping needed to settle it.
#[derive(Debug, Clone)]
pub struct PreparedTransmission {
    /// The transmission.
    pub transmission: Transmission,
    /// Route the records travel.
    pub route: Route,
    /// Packaged records, in transmission order.
    pub sent: Vec<SentRecord>,
}

/// Counts of sender-side outcomes for one transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeSummary {
    /// Records the receiver committed.
    pub committed: usize,
    /// Records that failed and remain eligible for retry.
    pub failed: usize,
    /// Records stopped at the retry ceiling.
    pub stopped: usize,
    /// Records refused by the receiver.
    pub rejected: usize,
    /// Records the receiver never reached; restored to their previous state.
    pub reverted: usize,
}

impl OutcomeSummary {
    /// True if nothing failed, stopped or was refused.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.stopped == 0 && self.rejected == 0
    }
}

impl SyncNode {
    /// Packages the records pending for `peer` into a transmission.
    ///
    /// Records are taken in creation order. A stopped record ends the scan
    /// and empties the transmission; a filtered record is marked
    /// `NotSupposedToSync` and skipped. Every included record has its retry
    /// count raised and moves to `Sent` or `SentAgain`.
    ///
    /// # Errors
    ///
    /// Fails if the pending records cannot be listed or updated. Nothing is
    /// left half-packaged.
    pub fn build_outbound(&self, peer: &Peer, max_records: usize) -> SyncResult<PreparedTransmission> {
        let route = Route::for_peer(peer);
        let pending = self.store.list_pending(route, max_records)?;

        let mut tx = Transmission::new(self.config.server_uuid, Some(peer.uuid));
        tx.confirmed_records = self.collect_confirmations(&peer.uuid)?;
        let mut sent = Vec::new();
        let mut stopped = false;

        for mut record in pending {
            let current = Delivery {
                state: record.state,
                retry_count: record.retry_count,
            };

            if current.state == RecordState::FailedAndStopped {
                self.alert_stopped(peer, &record, "retry limit reached");
                stopped = true;
                break;
            }
            if current.state == RecordState::Failed
                && current.retry_count >= self.config.max_retry_count
            {
                if let Err(e) = self.store.update_state(
                    &record.uuid,
                    route,
                    current.with_state(RecordState::FailedAndStopped),
                ) {
                    self.restore(route, &sent);
                    return Err(e);
                }
                self.alert_stopped(peer, &record, "retry limit reached");
                stopped = true;
                break;
            }

            if !self.peers.should_send(peer, &record) {
                info!(
                    record = %record.uuid,
                    peer = %peer.nickname,
                    classes = %record.class_list(),
                    "not sending record, every type is filtered for this peer"
                );
                if let Err(e) = self.store.update_state(
                    &record.uuid,
                    route,
                    current.with_state(RecordState::NotSupposedToSync),
                ) {
                    self.restore(route, &sent);
                    return Err(e);
                }
                continue;
            }

            let next = Delivery {
                state: if current.state.is_first_send() {
                    RecordState::Sent
                } else {
                    RecordState::SentAgain
                },
                retry_count: current.retry_count + 1,
            };
            if let Err(e) = self.store.update_state(&record.uuid, route, next) {
                self.restore(route, &sent);
                return Err(e);
            }
            record.state = next.state;
            record.retry_count = next.retry_count;
            sent.push(SentRecord {
                uuid: record.uuid,
                previous: current,
                sent: next,
            });
            tx.records.push(record);
        }

        if stopped {
            self.restore(route, &sent);
            sent.clear();
            tx.records.clear();
            tx.max_retry_reached = true;
        }

        debug!(
            tx = %tx.uuid,
            peer = %peer.nickname,
            records = tx.records.len(),
            confirmations = tx.confirmed_records.len(),
            max_retry_reached = tx.max_retry_reached,
            "built transmission"
        );
        self.journal.write_transmission(&tx);
        Ok(PreparedTransmission {
            transmission: tx,
            route,
            sent,
        })
    }

    /// Puts packaged records back into the state they had before packaging.
    ///
    /// Used when the transmission never reached the peer, so no retry is
    /// charged.
    pub fn restore(&self, route: Route, sent: &[SentRecord]) {
        for record in sent {
            if let Err(e) = self.store.update_state(&record.uuid, route, record.previous) {
                warn!(record = %record.uuid, error = %e, "failed to restore record state");
            }
        }
    }

    /// Applies the receiver's import outcomes to the records it was sent.
    ///
    /// Records missing from the response were never processed and are
    /// restored. A failure at the retry ceiling stops the record and alerts
    /// an administrator, unless its kind is exempt from retry accounting.
    pub fn apply_outcomes(
        &self,
        peer: &Peer,
        route: Route,
        sent: &[SentRecord],
        response: &TransmissionResponse,
    ) -> SyncResult<OutcomeSummary> {
        let mut summary = OutcomeSummary::default();

        for record in sent {
            let Some(import) = response.import_for(&record.uuid) else {
                summary.reverted += 1;
                self.store.update_state(&record.uuid, route, record.previous)?;
                continue;
            };

            let next = match import.state {
                state if state.is_final() => {
                    summary.committed += 1;
                    record.sent.with_state(RecordState::Committed)
                }
                RecordState::Failed => {
                    let penalized = import
                        .error_kind
                        .map_or(true, |kind| !self.config.is_non_penalized(kind));
                    let retry_count = if penalized {
                        record.sent.retry_count
                    } else {
                        record.previous.retry_count
                    };
                    if penalized && retry_count >= self.config.max_retry_count {
                        summary.stopped += 1;
                        Delivery {
                            state: RecordState::FailedAndStopped,
                            retry_count,
                        }
                    } else {
                        summary.failed += 1;
                        Delivery {
                            state: RecordState::Failed,
                            retry_count,
                        }
                    }
                }
                RecordState::Rejected | RecordState::NotSupposedToSync => {
                    summary.rejected += 1;
                    record.sent.with_state(RecordState::Rejected)
                }
                other => {
                    warn!(record = %record.uuid, state = %other, "unexpected import state, treating as failure");
                    summary.failed += 1;
                    record.sent.with_state(RecordState::Failed)
                }
            };

            self.store.update_state(&record.uuid, route, next)?;
            match next.state {
                RecordState::Committed => debug!(record = %record.uuid, peer = %peer.nickname, "record committed"),
                RecordState::FailedAndStopped => {
                    let reason = import.error_message.as_deref().unwrap_or("application failed");
                    if let Some(mut stored) = self.store.get(&record.uuid)? {
                        stored.retry_count = next.retry_count;
                        self.alert_stopped(peer, &stored, reason);
                    }
                }
                state => warn!(
                    record = %record.uuid,
                    peer = %peer.nickname,
                    %state,
                    error = import.error_message.as_deref().unwrap_or(""),
                    "record not committed"
                ),
            }
        }

        info!(
            peer = %peer.nickname,
            committed = summary.committed,
            failed = summary.failed,
            stopped = summary.stopped,
            rejected = summary.rejected,
            reverted = summary.reverted,
            "applied import outcomes"
        );
        Ok(summary)
    }

    /// Records received from `origin` whose commit has not been confirmed
    /// back to it yet.
    pub(crate) fn collect_confirmations(&self, origin: &Uuid) -> SyncResult<Vec<Uuid>> {
        Ok(self
            .store
            .list_imports(
                origin,
                &[RecordState::Committed, RecordState::AlreadyCommitted],
            )?
            .into_iter()
            .map(|i| i.source_record_uuid)
            .collect())
    }

    /// Marks import outcomes as confirmed to their sender.
    pub(crate) fn mark_confirmed(&self, records: &[Uuid]) {
        for uuid in records {
            if let Err(e) = self
                .store
                .update_import_state(uuid, RecordState::CommittedAndConfirmationSent)
            {
                warn!(record = %uuid, error = %e, "failed to mark import confirmed");
            }
        }
    }

    /// Promotes our own records the peer confirms having committed.
    pub(crate) fn receive_confirmations(&self, peer: &Peer, records: &[Uuid]) -> SyncResult<usize> {
        let route = Route::for_peer(peer);
        let mut promoted = 0;
        for uuid in records {
            match self.store.delivery(uuid, route)? {
                Some(delivery) if delivery.state == RecordState::Committed => {
                    self.store.update_state(
                        uuid,
                        route,
                        delivery.with_state(RecordState::CommittedAndConfirmationSent),
                    )?;
                    promoted += 1;
                }
                _ => {}
            }
        }
        if promoted > 0 {
            debug!(peer = %peer.nickname, promoted, "confirmations received");
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::notifier::RecordingNotifier;
    use crate::object_store::MemoryObjectStore;
    use crate::peers::{ClassFilter, MemoryPeerRegistry, PeerRegistry};
    use crate::store::{ChangeRecordStore, MemoryRecordStore};
    use std::sync::Arc;
    use treesync_codec::{Node, PayloadCodec};
    use treesync_protocol::{ChangeItem, ChangeRecord, FailureKind, ImportRecord, ItemState, TransmissionState};

    struct Fixture {
        node: SyncNode,
        store: Arc<MemoryRecordStore>,
        notifier: Arc<RecordingNotifier>,
        parent: Peer,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let parent = Peer::parent(Uuid::new_v4(), "hq")
            .with_filter(ClassFilter::new("audit", false, true));
        let store = Arc::new(MemoryRecordStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let node = SyncNode::new(
            config,
            store.clone(),
            Arc::new(MemoryPeerRegistry::with_peers([parent.clone()])),
            Arc::new(MemoryObjectStore::new(PayloadCodec::default())),
        )
        .with_notifier(notifier.clone());
        Fixture {
            node,
            store,
            notifier,
            parent,
        }
    }

    fn add(store: &MemoryRecordStore, ty: &str) -> Uuid {
        let record = ChangeRecord::new(
            "admin",
            "1.0",
            vec![ChangeItem::new(ty, Uuid::new_v4(), ItemState::New, Node::Null)],
        )
        .unwrap();
        let uuid = record.uuid;
        store.append(record, &[]).unwrap();
        uuid
    }

    fn state(store: &MemoryRecordStore, uuid: &Uuid) -> Delivery {
        store.delivery(uuid, Route::Upstream).unwrap().unwrap()
    }

    fn respond(prepared: &PreparedTransmission, outcomes: &[(usize, RecordState)]) -> TransmissionResponse {
        let mut response =
            TransmissionResponse::answering(&prepared.transmission, Uuid::new_v4(), TransmissionState::Ok);
        for (index, outcome) in outcomes {
            let record = &prepared.transmission.records[*index];
            response.import_records.push(ImportRecord::new(record, *outcome));
        }
        response
    }

    #[test]
    fn builds_in_order_and_bumps_retries() {
        let f = fixture(SyncConfig::default());
        let ids: Vec<Uuid> = (0..4).map(|_| add(&f.store, "clinical.Obs")).collect();

        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        let got: Vec<Uuid> = prepared.transmission.records.iter().map(|r| r.uuid).collect();
        assert_eq!(got, ids);
        assert!(prepared.transmission.records.iter().all(|r| r.retry_count == 1));
        assert_eq!(state(&f.store, &ids[0]).state, RecordState::Sent);

        f.node.restore(prepared.route, &prepared.sent);
        let again = f.node.build_outbound(&f.parent, 50).unwrap();
        assert_eq!(again.transmission.records[0].state, RecordState::Sent);

        let third = f.node.build_outbound(&f.parent, 50).unwrap();
        assert_eq!(third.transmission.records[0].state, RecordState::SentAgain);
        assert_eq!(third.transmission.records[0].retry_count, 2);
    }

    #[test]
    fn filtered_records_are_marked_and_skipped() {
        let f = fixture(SyncConfig::default());
        let a = add(&f.store, "clinical.Obs");
        let b = add(&f.store, "audit.Log");
        let c = add(&f.store, "clinical.Obs");

        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        let got: Vec<Uuid> = prepared.transmission.records.iter().map(|r| r.uuid).collect();
        assert_eq!(got, vec![a, c]);
        assert_eq!(state(&f.store, &b).state, RecordState::NotSupposedToSync);
        assert_eq!(state(&f.store, &b).retry_count, 0);
    }

    #[test]
    fn stopped_record_blocks_everything() {
        let f = fixture(SyncConfig::default());
        let a = add(&f.store, "clinical.Obs");
        let b = add(&f.store, "clinical.Obs");
        let c = add(&f.store, "clinical.Obs");
        f.store
            .update_state(
                &b,
                Route::Upstream,
                Delivery {
                    state: RecordState::FailedAndStopped,
                    retry_count: 5,
                },
            )
            .unwrap();

        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        assert!(prepared.transmission.max_retry_reached);
        assert!(prepared.transmission.records.is_empty());
        assert_eq!(state(&f.store, &a), Delivery::new());
        assert_eq!(state(&f.store, &c), Delivery::new());
        assert_eq!(f.notifier.count(), 1);
    }

    #[test]
    fn failed_record_at_ceiling_is_promoted() {
        let f = fixture(SyncConfig::default().with_max_retry_count(2));
        let a = add(&f.store, "clinical.Obs");
        f.store
            .update_state(
                &a,
                Route::Upstream,
                Delivery {
                    state: RecordState::Failed,
                    retry_count: 2,
                },
            )
            .unwrap();

        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        assert!(prepared.transmission.max_retry_reached);
        assert_eq!(state(&f.store, &a).state, RecordState::FailedAndStopped);
    }

    #[test]
    fn outcomes_map_to_sender_states() {
        let f = fixture(SyncConfig::default());
        let ids: Vec<Uuid> = (0..5).map(|_| add(&f.store, "clinical.Obs")).collect();
        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        let response = respond(
            &prepared,
            &[
                (0, RecordState::Committed),
                (1, RecordState::AlreadyCommitted),
                (2, RecordState::NotSupposedToSync),
                (3, RecordState::Failed),
            ],
        );

        let summary = f
            .node
            .apply_outcomes(&f.parent, prepared.route, &prepared.sent, &response)
            .unwrap();
        assert_eq!(
            summary,
            OutcomeSummary {
                committed: 2,
                failed: 1,
                stopped: 0,
                rejected: 1,
                reverted: 1,
            }
        );
        assert_eq!(state(&f.store, &ids[0]).state, RecordState::Committed);
        assert_eq!(state(&f.store, &ids[1]).state, RecordState::Committed);
        assert_eq!(state(&f.store, &ids[2]).state, RecordState::Rejected);
        assert_eq!(
            state(&f.store, &ids[3]),
            Delivery {
                state: RecordState::Failed,
                retry_count: 1,
            }
        );
        assert_eq!(state(&f.store, &ids[4]), Delivery::new());
        assert!(!summary.is_clean());
    }

    #[test]
    fn non_penalized_failure_keeps_retry_count() {
        let f = fixture(SyncConfig::default().with_non_penalized_error(FailureKind::Store));
        let a = add(&f.store, "clinical.Obs");
        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        let mut response = respond(&prepared, &[]);
        response.import_records.push(ImportRecord::failed(
            &prepared.transmission.records[0],
            RecordState::Failed,
            FailureKind::Store,
            "database locked",
        ));

        f.node
            .apply_outcomes(&f.parent, prepared.route, &prepared.sent, &response)
            .unwrap();
        assert_eq!(
            state(&f.store, &a),
            Delivery {
                state: RecordState::Failed,
                retry_count: 0,
            }
        );
    }

    #[test]
    fn failure_at_ceiling_stops_and_alerts_once() {
        let f = fixture(SyncConfig::default().with_max_retry_count(1).with_admin_email("ops@example.org"));
        let a = add(&f.store, "clinical.Obs");
        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        let response = respond(&prepared, &[(0, RecordState::Failed)]);

        let summary = f
            .node
            .apply_outcomes(&f.parent, prepared.route, &prepared.sent, &response)
            .unwrap();
        assert_eq!(summary.stopped, 1);
        assert_eq!(state(&f.store, &a).state, RecordState::FailedAndStopped);

        let alerts = f.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].recipient, "ops@example.org");
        assert!(alerts[0].body.contains(&a.to_string()));
        assert!(alerts[0].body.contains("clinical.Obs"));
    }

    #[test]
    fn confirmations_promote_committed_records() {
        let f = fixture(SyncConfig::default());
        let a = add(&f.store, "clinical.Obs");
        let b = add(&f.store, "clinical.Obs");
        f.store
            .update_state(&a, Route::Upstream, Delivery::new().with_state(RecordState::Committed))
            .unwrap();

        let promoted = f.node.receive_confirmations(&f.parent, &[a, b, Uuid::new_v4()]).unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(
            state(&f.store, &a).state,
            RecordState::CommittedAndConfirmationSent
        );
        assert_eq!(state(&f.store, &b).state, RecordState::New);
    }

    #[test]
    fn transmission_carries_pending_confirmations() {
        let f = fixture(SyncConfig::default());
        let incoming = ChangeRecord::new(
            "hq",
            "1.0",
            vec![ChangeItem::new("clinical.Obs", Uuid::new_v4(), ItemState::New, Node::Null)],
        )
        .unwrap();
        f.store
            .save_import(f.parent.uuid, ImportRecord::new(&incoming, RecordState::Committed))
            .unwrap();

        let prepared = f.node.build_outbound(&f.parent, 50).unwrap();
        assert_eq!(prepared.transmission.confirmed_records, vec![incoming.uuid]);

        f.node.mark_confirmed(&prepared.transmission.confirmed_records);
        assert!(f.node.collect_confirmations(&f.parent.uuid).unwrap().is_empty());
        assert!(f.node.peers.get(&f.parent.uuid).unwrap().is_some());
    }
}
