//! End-to-end synchronization between in-process nodes.

use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use treesync_engine::{
    ChangeRecordStore, ClassFilter, Delivery, Journal, LoopbackTransport, ObjectStore, Peer,
    PeerRegistry, Route, SyncEngine, SyncError, SyncResult, Transport,
};
use treesync_protocol::{Exchange, RecordState, TransmissionState};
use treesync_testkit::prelude::*;

fn clinical_history(node: &TestNode) -> [Created; 3] {
    let patient = node.create(PATIENT, patient_fields("Ana")).unwrap();
    let encounter = node
        .create(ENCOUNTER, encounter_fields(patient.key, "ADULTINITIAL"))
        .unwrap();
    let obs = node
        .create(OBS, obs_fields(encounter.key, "WEIGHT (KG)", 61))
        .unwrap();
    [patient, encounter, obs]
}

#[test]
fn clinical_history_commits_then_confirms() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    let engine = link(&hq, &clinic);
    let [patient, encounter, obs] = clinical_history(&clinic);

    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::Ok);
    assert!(hq.objects.exists(PATIENT, &patient.key));
    assert!(hq.objects.exists(ENCOUNTER, &encounter.key));
    assert!(hq.objects.exists(OBS, &obs.key));
    for created in [patient, encounter, obs] {
        assert_eq!(clinic.upstream_state(&created.record), Some(RecordState::Committed));
        assert_eq!(clinic.upstream_retries(&created.record), Some(1));
    }

    engine.synchronize().unwrap();
    for created in [patient, encounter, obs] {
        assert_eq!(
            clinic.upstream_state(&created.record),
            Some(RecordState::CommittedAndConfirmationSent)
        );
        let import = hq.store.get_import(&created.record).unwrap().unwrap();
        assert_eq!(import.import.state, RecordState::CommittedAndConfirmationSent);
    }

    let parent = clinic.peers.get(&hq.uuid).unwrap().unwrap();
    assert!(parent.last_sync_state.is_some());
    assert!(parent.last_sync_time.is_some());
    assert!(!parent.in_sync_in_progress);
}

#[test]
fn failing_record_stops_after_five_attempts() {
    let hq = TestNode::builder("hq")
        .validator(ENCOUNTER, |_| Err("encounter location is required".into()))
        .build();
    let clinic = TestNode::new("clinic");
    let engine = link(&hq, &clinic);
    let [patient, encounter, obs] = clinical_history(&clinic);

    for attempt in 1..=5u32 {
        let response = engine.synchronize().unwrap();
        assert_eq!(response.state, TransmissionState::FailedRecords);
        assert_eq!(clinic.upstream_retries(&encounter.record), Some(attempt));
        assert_eq!(clinic.upstream_state(&obs.record), Some(RecordState::New));
        assert_eq!(clinic.upstream_retries(&obs.record), Some(0));
    }

    assert_eq!(
        clinic.upstream_state(&encounter.record),
        Some(RecordState::FailedAndStopped)
    );
    assert!(clinic
        .upstream_state(&patient.record)
        .is_some_and(RecordState::is_final));
    assert_eq!(clinic.notifier.count(), 1);
    let alert = &clinic.notifier.alerts()[0];
    assert!(alert.body.contains(&encounter.record.to_string()));
    assert!(alert.body.contains(ENCOUNTER));
    assert!(!hq.objects.exists(OBS, &obs.key));

    // The stopped record keeps everything behind it off the wire.
    let calls = engine.transport().calls();
    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::MaxRetryReached);
    assert_eq!(engine.transport().calls(), calls + 1);
    assert_eq!(clinic.upstream_state(&obs.record), Some(RecordState::New));
}

#[test]
fn stopped_child_still_acknowledges_pulled_records() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    let engine = link(&hq, &clinic);
    let stuck = clinic.create(PATIENT, patient_fields("Ana")).unwrap();
    clinic
        .store
        .update_state(
            &stuck.record,
            Route::Upstream,
            Delivery {
                state: RecordState::FailedAndStopped,
                retry_count: 5,
            },
        )
        .unwrap();
    let from_hq = hq.create(PATIENT, patient_fields("Bo")).unwrap();

    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::MaxRetryReached);
    assert!(clinic.objects.exists(PATIENT, &from_hq.key));
    assert_eq!(
        hq.downstream_state(&from_hq.record, &clinic),
        Some(RecordState::CommittedAndConfirmationSent)
    );
    assert!(!hq.objects.exists(PATIENT, &stuck.key));

    // Nothing is left to acknowledge, so only the pull goes out.
    let calls = engine.transport().calls();
    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::MaxRetryReached);
    assert_eq!(engine.transport().calls(), calls + 1);
    assert_eq!(
        hq.downstream_state(&from_hq.record, &clinic),
        Some(RecordState::CommittedAndConfirmationSent)
    );
}

#[test]
fn redelivered_transmission_applies_once() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    link(&hq, &clinic);
    let created = clinic.create(PATIENT, patient_fields("Ana")).unwrap();

    let parent = clinic.peers.get_parent().unwrap().unwrap();
    let prepared = clinic.node.build_outbound(&parent, 50).unwrap();
    let first = hq.node.ingest(&prepared.transmission, "clinic").unwrap();
    let second = hq.node.ingest(&prepared.transmission, "clinic").unwrap();

    assert_eq!(first.import_records[0].state, RecordState::Committed);
    assert_eq!(second.import_records[0].state, RecordState::AlreadyCommitted);
    assert_eq!(hq.objects.applied_count(), 1);
    assert!(hq.objects.exists(PATIENT, &created.key));
}

#[test]
fn filtered_type_is_never_sent() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    let engine = link(&hq, &clinic);
    let parent = clinic.peers.get_parent().unwrap().unwrap();
    clinic
        .peers
        .save(parent.with_filter(ClassFilter::new(OBS, false, true)))
        .unwrap();
    let [patient, encounter, obs] = clinical_history(&clinic);

    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::Ok);
    assert_eq!(
        clinic.upstream_state(&obs.record),
        Some(RecordState::NotSupposedToSync)
    );
    assert_eq!(clinic.upstream_state(&patient.record), Some(RecordState::Committed));
    assert_eq!(clinic.upstream_state(&encounter.record), Some(RecordState::Committed));
    assert!(!hq.objects.exists(OBS, &obs.key));
}

#[test]
fn version_mismatch_is_rejected() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::builder("clinic")
        .config(|c| c.with_database_version("2.0"))
        .build();
    let engine = link(&hq, &clinic);
    let created = clinic.create(PATIENT, patient_fields("Ana")).unwrap();

    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::FailedRecords);
    assert_eq!(clinic.upstream_state(&created.record), Some(RecordState::Rejected));
    assert!(hq.objects.is_empty());
}

#[test]
fn committed_records_are_relayed_to_siblings() {
    let hq = TestNode::new("hq");
    let north = TestNode::new("north");
    let south = TestNode::new("south");
    let north_engine = link(&hq, &north);
    let south_engine = link(&hq, &south);

    let created = north.create(PATIENT, patient_fields("Ana")).unwrap();
    north_engine.synchronize().unwrap();
    assert_eq!(hq.downstream_state(&created.record, &south), Some(RecordState::New));
    assert_eq!(hq.downstream_state(&created.record, &north), None);

    let response = south_engine.synchronize().unwrap();
    assert!(response.state.is_success());
    assert!(south.objects.exists(PATIENT, &created.key));
    assert_eq!(
        south.upstream_state(&created.record),
        Some(RecordState::AlreadyCommitted)
    );
    assert_eq!(
        hq.downstream_state(&created.record, &south),
        Some(RecordState::CommittedAndConfirmationSent)
    );

    // South never echoes the record back.
    let before = hq.objects.applied_count();
    south_engine.synchronize().unwrap();
    assert_eq!(hq.objects.applied_count(), before);
}

#[test]
fn unknown_child_is_refused() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    clinic
        .peers
        .save(Peer::parent(hq.uuid, "hq").with_identity("hq"))
        .unwrap();
    let engine = SyncEngine::new(
        clinic.node.clone(),
        LoopbackTransport::new(hq.node.clone(), "stranger"),
    );
    let created = clinic.create(PATIENT, patient_fields("Ana")).unwrap();

    let response = engine.synchronize().unwrap();
    assert_eq!(response.state, TransmissionState::CannotFindServerWithUuid);
    assert_eq!(clinic.upstream_state(&created.record), Some(RecordState::New));
    assert_eq!(
        clinic.peers.get(&hq.uuid).unwrap().unwrap().last_sync_state,
        Some(TransmissionState::CannotFindServerWithUuid)
    );
}

#[test]
fn timeout_leaves_records_untouched() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::builder("clinic")
        .config(|c| c.with_connection_timeout(Duration::from_millis(20)))
        .build();
    link(&hq, &clinic);
    let engine = SyncEngine::new(
        clinic.node.clone(),
        LoopbackTransport::new(hq.node.clone(), "clinic").with_latency(Duration::from_millis(200)),
    );
    let created = clinic.create(PATIENT, patient_fields("Ana")).unwrap();

    let err = engine.synchronize().unwrap_err();
    assert!(matches!(err, SyncError::Timeout));
    assert_eq!(clinic.upstream_state(&created.record), Some(RecordState::New));
    assert_eq!(clinic.upstream_retries(&created.record), Some(0));
    let parent = clinic.peers.get(&hq.uuid).unwrap().unwrap();
    assert_eq!(parent.last_sync_state, Some(TransmissionState::Failed));
    assert!(!parent.in_sync_in_progress);
}

/// Lets the pull through and drops the push.
struct PushDropping {
    inner: LoopbackTransport,
    calls: AtomicUsize,
}

impl Transport for PushDropping {
    fn send(&self, peer: &Peer, payload: &[u8], timeout: Duration) -> SyncResult<Vec<u8>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(SyncError::transport_retryable("connection reset"));
        }
        self.inner.send(peer, payload, timeout)
    }
}

#[test]
fn failed_push_charges_no_retry() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    let healthy = link(&hq, &clinic);
    let flaky = SyncEngine::new(
        clinic.node.clone(),
        PushDropping {
            inner: LoopbackTransport::new(hq.node.clone(), "clinic"),
            calls: AtomicUsize::new(0),
        },
    );
    let created = clinic.create(PATIENT, patient_fields("Ana")).unwrap();

    assert!(flaky.synchronize().is_err());
    assert_eq!(clinic.upstream_state(&created.record), Some(RecordState::New));
    assert_eq!(clinic.upstream_retries(&created.record), Some(0));
    assert!(hq.objects.is_empty());

    healthy.synchronize().unwrap();
    assert_eq!(clinic.upstream_state(&created.record), Some(RecordState::Committed));
    assert_eq!(clinic.upstream_retries(&created.record), Some(1));
}

/// Blocks inside the first call until released.
struct Gated {
    inner: LoopbackTransport,
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
    calls: AtomicUsize,
}

impl Transport for Gated {
    fn send(&self, peer: &Peer, payload: &[u8], timeout: Duration) -> SyncResult<Vec<u8>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
        self.inner.send(peer, payload, timeout)
    }
}

#[test]
fn concurrent_attempt_does_not_reach_transport() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::new("clinic");
    link(&hq, &clinic);
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let engine = Arc::new(SyncEngine::new(
        clinic.node.clone(),
        Gated {
            inner: LoopbackTransport::new(hq.node.clone(), "clinic"),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            calls: AtomicUsize::new(0),
        },
    ));

    let first = {
        let engine = engine.clone();
        thread::spawn(move || engine.synchronize())
    };
    entered_rx.recv().unwrap();

    let second = engine.synchronize().unwrap();
    assert_eq!(second.state, TransmissionState::ErrorCannotRunParallel);
    assert_eq!(engine.transport().calls.load(Ordering::SeqCst), 1);

    release_tx.send(()).unwrap();
    let first = first.join().unwrap().unwrap();
    assert!(first.state.is_success());
}

#[test]
fn journal_records_every_exchange() {
    let hq = TestNode::new("hq");
    let clinic = TestNode::builder("clinic").with_journal().build();
    let engine = link(&hq, &clinic);
    clinic.create(PATIENT, patient_fields("Ana")).unwrap();

    engine.synchronize().unwrap();
    let files = Journal::list(clinic.journal_dir().unwrap()).unwrap();
    // Request, pull reply, outbound build, push reply.
    assert_eq!(files.len(), 4);
    let kinds: Vec<bool> = files
        .iter()
        .map(|f| matches!(Journal::read(f).unwrap(), Exchange::Transmission(_)))
        .collect();
    assert_eq!(kinds.iter().filter(|t| **t).count(), 2);
}
