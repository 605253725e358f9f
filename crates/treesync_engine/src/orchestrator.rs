//! Two-round synchronization of a child with its parent.
//!
//! Round one pulls: the child sends an empty transmission asking for a
//! reciprocal one and ingests whatever the parent embeds in its response.
//! Round two pushes: the child sends the outcomes of that ingest together
//! with its own pending records, and settles them from the parent's reply.

use crate::builder::OutcomeSummary;
use crate::error::{SyncError, SyncResult};
use crate::node::SyncNode;
use crate::peers::{Peer, PeerRegistry, SyncGuard};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use treesync_protocol::{Exchange, FailureKind, Transmission, TransmissionResponse, TransmissionState};
use uuid::Uuid;

/// Counters across synchronize attempts.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Attempts that completed an exchange with the parent.
    pub cycles_completed: u64,
    /// Records received from the parent.
    pub records_pulled: u64,
    /// Records sent to the parent.
    pub records_pushed: u64,
    /// Transport calls that failed.
    pub transport_failures: u64,
    /// Outcome of the last attempt.
    pub last_state: Option<TransmissionState>,
    /// Error of the last attempt, if it failed.
    pub last_error: Option<String>,
    /// When the last attempt finished.
    pub last_sync_time: Option<DateTime<Utc>>,
}

struct Cycle {
    response: TransmissionResponse,
    pulled: usize,
    pushed: usize,
}

/// Drives synchronization of a node with its parent.
pub struct SyncEngine<T: Transport> {
    node: Arc<SyncNode>,
    transport: Arc<T>,
    stats: RwLock<SyncStats>,
    consecutive_failures: AtomicU32,
}

impl<T: Transport> SyncEngine<T> {
    /// Creates an engine for `node` talking through `transport`.
    pub fn new(node: Arc<SyncNode>, transport: T) -> Self {
        Self::with_shared_transport(node, Arc::new(transport))
    }

    /// Creates an engine over a transport shared with the caller.
    pub fn with_shared_transport(node: Arc<SyncNode>, transport: Arc<T>) -> Self {
        Self {
            node,
            transport,
            stats: RwLock::new(SyncStats::default()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// The local node.
    pub fn node(&self) -> &Arc<SyncNode> {
        &self.node
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Synchronizes with the configured parent.
    ///
    /// Returns a local `NoParentDefined` response when there is no enabled
    /// parent.
    pub fn synchronize(&self) -> SyncResult<TransmissionResponse> {
        match self.node.peers.get_parent()? {
            Some(parent) if !parent.disabled => self.full_synchronize(&parent),
            Some(parent) => {
                info!(peer = %parent.nickname, "parent disabled, skipping synchronization");
                Ok(self.local(Some(parent.uuid), TransmissionState::NoParentDefined))
            }
            None => {
                debug!("no parent defined, nothing to synchronize");
                Ok(self.local(None, TransmissionState::NoParentDefined))
            }
        }
    }

    /// Runs both rounds against `parent`.
    ///
    /// A second attempt against the same parent while one is running gets a
    /// local `ErrorCannotRunParallel` response and never reaches the
    /// transport. The outcome is recorded on the parent whatever happens.
    ///
    /// # Errors
    ///
    /// Transport, decoding and store failures. Records packaged for a round
    /// that failed in transit are restored with no retry charged.
    pub fn full_synchronize(&self, parent: &Peer) -> SyncResult<TransmissionResponse> {
        let Some(guard) = SyncGuard::acquire(self.node.peers.clone(), parent.uuid)? else {
            warn!(peer = %parent.nickname, "synchronization already in progress");
            return Ok(self.local(Some(parent.uuid), TransmissionState::ErrorCannotRunParallel));
        };
        info!(peer = %parent.nickname, address = %parent.address, "starting synchronization");

        let outcome = self.run_rounds(parent);
        let state = match &outcome {
            Ok(cycle) => cycle.response.state,
            Err(e) => TransmissionState::from(e),
        };
        let now = Utc::now();
        if let Err(e) = self.node.peers.record_outcome(&parent.uuid, state, now) {
            warn!(peer = %parent.nickname, error = %e, "failed to record synchronization outcome");
        }
        drop(guard);

        let mut stats = self.stats.write();
        stats.last_state = Some(state);
        stats.last_sync_time = Some(now);
        match outcome {
            Ok(cycle) => {
                stats.cycles_completed += 1;
                stats.records_pulled += cycle.pulled as u64;
                stats.records_pushed += cycle.pushed as u64;
                stats.last_error = None;
                info!(
                    peer = %parent.nickname,
                    %state,
                    pulled = cycle.pulled,
                    pushed = cycle.pushed,
                    "synchronization finished"
                );
                Ok(cycle.response)
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());
                warn!(peer = %parent.nickname, error = %e, "synchronization failed");
                Err(e)
            }
        }
    }

    fn run_rounds(&self, parent: &Peer) -> SyncResult<Cycle> {
        let node = &self.node;
        let me = node.server_uuid();

        // Round one: pull.
        let mut request = Transmission::request(me, parent.uuid);
        request.confirmed_records = node.collect_confirmations(&parent.uuid)?;
        node.journal.write_transmission(&request);
        let reply = self.exchange(parent, &Exchange::Transmission(request.clone()))?;
        node.mark_confirmed(&request.confirmed_records);
        node.journal.write_response(&reply);

        if reply.state == TransmissionState::CannotFindServerWithUuid {
            warn!(peer = %parent.nickname, "parent does not know this server");
            return Ok(Cycle {
                response: reply,
                pulled: 0,
                pushed: 0,
            });
        }
        if reply.state == TransmissionState::TransmissionCreationFailed {
            warn!(peer = %parent.nickname, "parent could not build a transmission for us");
        }

        let pulled = match reply.embedded.as_deref() {
            Some(tx) => Some(node.ingest(tx, &parent.identity)?),
            None => None,
        };
        let pulled_count = pulled.as_ref().map_or(0, |p| p.import_records.len());
        let pulled_state = pulled.as_ref().map(|p| p.state);

        // Round two: push.
        let prepared = match node.build_outbound(parent, node.config.max_records) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(peer = %parent.nickname, error = %e, "failed to build transmission");
                return Ok(Cycle {
                    response: self.local(Some(parent.uuid), TransmissionState::TransmissionCreationFailed),
                    pulled: pulled_count,
                    pushed: 0,
                });
            }
        };
        let stopped = prepared.transmission.max_retry_reached;
        let has_outcomes = pulled.as_ref().map_or(false, |p| !p.import_records.is_empty());
        if stopped && !has_outcomes {
            return Ok(Cycle {
                response: self.local(Some(parent.uuid), TransmissionState::MaxRetryReached),
                pulled: pulled_count,
                pushed: 0,
            });
        }
        // A stopped line still returns the outcomes of what we just pulled.

        let outgoing = prepared.transmission.records.len();
        if outgoing == 0 && !has_outcomes && prepared.transmission.confirmed_records.is_empty() {
            let state = match pulled_state {
                Some(state) if state != TransmissionState::OkNothingToDo => state,
                _ => TransmissionState::OkNothingToDo,
            };
            return Ok(Cycle {
                response: self.local(Some(parent.uuid), state),
                pulled: pulled_count,
                pushed: 0,
            });
        }

        let mut push = pulled.unwrap_or_else(|| {
            TransmissionResponse::new(Uuid::new_v4(), me, Some(parent.uuid), TransmissionState::OkNothingToDo)
        });
        push.embedded = Some(Box::new(prepared.transmission.clone()));
        debug!(
            peer = %parent.nickname,
            records = outgoing,
            outcomes = push.import_records.len(),
            "pushing to parent"
        );

        let mut answer = match self.exchange(parent, &Exchange::Response(push)) {
            Ok(answer) => answer,
            Err(e) => {
                node.restore(prepared.route, &prepared.sent);
                return Err(e);
            }
        };
        node.mark_confirmed(&prepared.transmission.confirmed_records);
        node.journal.write_response(&answer);
        let summary = node.apply_outcomes(parent, prepared.route, &prepared.sent, &answer)?;

        answer.state = final_state(answer.state, pulled_state, &summary, pulled_count + outgoing);
        if stopped && answer.state != TransmissionState::CannotFindServerWithUuid {
            answer.state = TransmissionState::MaxRetryReached;
        }
        Ok(Cycle {
            response: answer,
            pulled: pulled_count,
            pushed: outgoing,
        })
    }

    /// Sends one exchange and decodes the reply.
    ///
    /// Counts consecutive transport failures and alerts once when the count
    /// reaches the retry ceiling.
    fn exchange(&self, parent: &Peer, exchange: &Exchange) -> SyncResult<TransmissionResponse> {
        let payload = exchange.encode()?;
        let result = self
            .transport
            .send(parent, &payload, self.node.config.connection_timeout)
            .and_then(|bytes| Ok(Exchange::decode(&bytes)?.into_response()?));

        match &result {
            Ok(_) => self.consecutive_failures.store(0, Ordering::SeqCst),
            Err(e) if e.kind() == FailureKind::Transport => {
                self.stats.write().transport_failures += 1;
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(peer = %parent.nickname, failures, error = %e, "transport failure");
                if failures == self.node.config.max_retry_count {
                    self.node.alert(
                        &format!("Cannot reach {}", parent.nickname),
                        &format!(
                            "{} consecutive attempts to reach {} at {} failed. Last error: {}",
                            failures, parent.nickname, parent.address, e
                        ),
                    );
                }
            }
            Err(e) => warn!(peer = %parent.nickname, error = %e, "unusable reply from parent"),
        }
        result
    }

    fn local(&self, target: Option<Uuid>, state: TransmissionState) -> TransmissionResponse {
        TransmissionResponse::local(self.node.server_uuid(), target, state)
    }
}

fn final_state(
    answer: TransmissionState,
    pulled: Option<TransmissionState>,
    pushed: &OutcomeSummary,
    moved: usize,
) -> TransmissionState {
    if answer == TransmissionState::CannotFindServerWithUuid {
        return answer;
    }
    if pulled == Some(TransmissionState::MaxRetryReached) {
        return TransmissionState::MaxRetryReached;
    }
    let pull_clean = pulled.map_or(true, TransmissionState::is_success);
    if !pull_clean || !pushed.is_clean() || !answer.is_success() {
        TransmissionState::FailedRecords
    } else if moved == 0 {
        TransmissionState::OkNothingToDo
    } else {
        TransmissionState::Ok
    }
}

impl From<&SyncError> for TransmissionState {
    /// Peer-level state recorded for an attempt that ended in `err`.
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::NoParent => TransmissionState::NoParentDefined,
            SyncError::UnknownPeer(_) => TransmissionState::CannotFindServerWithUuid,
            _ => TransmissionState::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::notifier::RecordingNotifier;
    use crate::object_store::MemoryObjectStore;
    use crate::peers::MemoryPeerRegistry;
    use crate::store::{ChangeRecordStore, MemoryRecordStore, Route};
    use crate::transport::LoopbackTransport;
    use crate::store::Delivery;
    use treesync_codec::PayloadCodec;
    use treesync_protocol::{ChangeItem, ChangeRecord, RecordState};

    struct Pair {
        parent_node: Arc<SyncNode>,
        child: SyncEngine<LoopbackTransport>,
        child_store: Arc<MemoryRecordStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn pair() -> Pair {
        let parent_uuid = Uuid::new_v4();
        let child_uuid = Uuid::new_v4();
        let parent_node = Arc::new(SyncNode::new(
            SyncConfig::new(parent_uuid),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryPeerRegistry::with_peers([Peer::child(child_uuid, "clinic")])),
            Arc::new(MemoryObjectStore::new(PayloadCodec::default())),
        ));

        let child_store = Arc::new(MemoryRecordStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let child_node = Arc::new(
            SyncNode::new(
                SyncConfig::new(child_uuid).with_max_retry_count(2),
                child_store.clone(),
                Arc::new(MemoryPeerRegistry::with_peers([Peer::parent(parent_uuid, "hq")])),
                Arc::new(MemoryObjectStore::new(PayloadCodec::default())),
            )
            .with_notifier(notifier.clone()),
        );
        let transport = LoopbackTransport::new(parent_node.clone(), "clinic");
        Pair {
            parent_node,
            child: SyncEngine::new(child_node, transport),
            child_store,
            notifier,
        }
    }

    fn add(store: &MemoryRecordStore) -> Uuid {
        let record = ChangeRecord::new(
            "nurse",
            "1.0",
            vec![ChangeItem::deleted("Patient", Uuid::new_v4())],
        )
        .unwrap();
        let uuid = record.uuid;
        store.append(record, &[]).unwrap();
        uuid
    }

    #[test]
    fn no_parent_is_reported_locally() {
        let node = Arc::new(SyncNode::new(
            SyncConfig::new(Uuid::new_v4()),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(MemoryPeerRegistry::new()),
            Arc::new(MemoryObjectStore::new(PayloadCodec::default())),
        ));
        let transport = LoopbackTransport::new(node.clone(), "self");
        let engine = SyncEngine::new(node, transport);

        let response = engine.synchronize().unwrap();
        assert_eq!(response.state, TransmissionState::NoParentDefined);
        assert_eq!(engine.transport().calls(), 0);
    }

    #[test]
    fn empty_sync_is_nothing_to_do() {
        let p = pair();
        let response = p.child.synchronize().unwrap();
        assert_eq!(response.state, TransmissionState::OkNothingToDo);
        assert_eq!(p.child.transport().calls(), 1);
        assert_eq!(p.child.stats().cycles_completed, 1);
    }

    #[test]
    fn pushes_pending_records() {
        let p = pair();
        let a = add(&p.child_store);

        let response = p.child.synchronize().unwrap();
        assert_eq!(response.state, TransmissionState::Ok);
        assert_eq!(p.child.transport().calls(), 2);
        assert_eq!(
            p.child_store.delivery(&a, Route::Upstream).unwrap().unwrap().state,
            RecordState::Committed
        );
        assert!(p.parent_node.store().get(&a).unwrap().is_some());
        assert_eq!(p.child.stats().records_pushed, 1);
    }

    #[test]
    fn transport_failure_charges_no_retry() {
        let p = pair();
        let a = add(&p.child_store);

        let parent = p.child.node().peers().get_parent().unwrap().unwrap();
        p.child.transport().fail_next(1);
        let err = p.child.synchronize().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            p.child_store.delivery(&a, Route::Upstream).unwrap().unwrap(),
            Delivery::new()
        );
        let parent = p.child.node().peers().get(&parent.uuid).unwrap().unwrap();
        assert_eq!(parent.last_sync_state, Some(TransmissionState::Failed));
        assert!(!parent.in_sync_in_progress);
        assert_eq!(p.child.stats().transport_failures, 1);
    }

    #[test]
    fn repeated_transport_failures_alert_once() {
        let p = pair();
        p.child.transport().fail_next(3);
        for _ in 0..3 {
            assert!(p.child.synchronize().is_err());
        }
        assert_eq!(p.notifier.count(), 1);
        assert!(p.notifier.alerts()[0].subject.contains("hq"));
    }

    #[test]
    fn busy_parent_is_not_contacted() {
        let p = pair();
        let parent = p.child.node().peers().get_parent().unwrap().unwrap();
        let _held = SyncGuard::acquire(p.child.node().peers().clone(), parent.uuid)
            .unwrap()
            .unwrap();

        let response = p.child.full_synchronize(&parent).unwrap();
        assert_eq!(response.state, TransmissionState::ErrorCannotRunParallel);
        assert_eq!(p.child.transport().calls(), 0);
    }

    #[test]
    fn final_state_prefers_failures() {
        let clean = OutcomeSummary::default();
        let failed = OutcomeSummary {
            failed: 1,
            ..OutcomeSummary::default()
        };
        assert_eq!(
            final_state(TransmissionState::Ok, None, &clean, 3),
            TransmissionState::Ok
        );
        assert_eq!(
            final_state(TransmissionState::Ok, None, &clean, 0),
            TransmissionState::OkNothingToDo
        );
        assert_eq!(
            final_state(TransmissionState::FailedRecords, None, &failed, 3),
            TransmissionState::FailedRecords
        );
        assert_eq!(
            final_state(TransmissionState::Ok, Some(TransmissionState::FailedRecords), &clean, 1),
            TransmissionState::FailedRecords
        );
    }
}
