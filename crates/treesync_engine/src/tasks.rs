//! Background scheduling: periodic synchronization and record cleanup.

use crate::error::{SyncError, SyncResult};
use crate::node::SyncNode;
use crate::orchestrator::SyncEngine;
use crate::transport::Transport;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use treesync_protocol::{RecordState, TransmissionResponse};

/// Handle to a running periodic task.
pub struct TaskHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Signals the task and waits for the current run to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(task = self.name, error = %e, "task ended abnormally");
        }
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown, mut stop) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(task = name, ?period, "task started");
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!(task = name, "task stopped");
    });
    TaskHandle {
        name,
        shutdown,
        join,
    }
}

/// Runs [`SyncEngine::synchronize`] on a fixed schedule.
///
/// Failures are logged; the next tick simply tries again.
pub struct SyncTask<T: Transport> {
    engine: Arc<SyncEngine<T>>,
    interval: Duration,
}

impl<T: Transport + 'static> SyncTask<T> {
    /// Creates a task running every `interval`.
    pub fn new(engine: Arc<SyncEngine<T>>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Creates a task from the node's configured interval, if any.
    pub fn from_config(engine: Arc<SyncEngine<T>>) -> Option<Self> {
        let interval = engine.node().config().sync_interval?;
        Some(Self::new(engine, interval))
    }

    /// Runs one synchronize attempt off the async runtime.
    pub async fn run_once(&self) -> SyncResult<TransmissionResponse> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.synchronize())
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }

    /// Starts the schedule.
    pub fn spawn(self) -> TaskHandle {
        let task = Arc::new(self);
        let period = task.interval;
        spawn_periodic("synchronize", period, move || {
            let task = task.clone();
            async move {
                match task.run_once().await {
                    Ok(response) => debug!(state = %response.state, "scheduled synchronization done"),
                    Err(e) => warn!(error = %e, "scheduled synchronization failed, will retry"),
                }
            }
        })
    }
}

/// Result of one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Change records removed.
    pub records: usize,
    /// Import outcomes removed.
    pub imports: usize,
}

/// Removes fully delivered records older than the purge horizon.
pub struct CleanupTask {
    node: Arc<SyncNode>,
}

impl CleanupTask {
    /// Creates a cleanup task for `node`.
    pub fn new(node: Arc<SyncNode>) -> Self {
        Self { node }
    }

    /// Purges once.
    ///
    /// # Errors
    ///
    /// Fails if the record store does.
    pub fn run(&self) -> SyncResult<PurgeReport> {
        let purge = &self.node.config().purge;
        let before = Utc::now() - purge.horizon();
        let states = if purge.states.is_empty() {
            self.default_states()?
        } else {
            purge.states.clone()
        };
        let report = PurgeReport {
            records: self.node.store().purge_committed(before, &states)?,
            imports: self.node.store().purge_imports(before)?,
        };
        info!(
            %before,
            records = report.records,
            imports = report.imports,
            "purged delivered records"
        );
        Ok(report)
    }

    /// Record-level states that count as done when none are configured.
    ///
    /// A root has nowhere to send its own records, so `New` is done there.
    /// Child delivery rows still have to be settled either way.
    fn default_states(&self) -> SyncResult<Vec<RecordState>> {
        Ok(match self.node.peers().get_parent()? {
            Some(_) => vec![RecordState::Committed, RecordState::NotSupposedToSync],
            None => vec![RecordState::New, RecordState::NotSupposedToSync],
        })
    }

    /// Starts the schedule, using the configured interval if none is given.
    ///
    /// Returns `None` when no interval is available.
    pub fn spawn(self, interval: Option<Duration>) -> Option<TaskHandle> {
        let period = interval.or(self.node.config().purge.interval)?;
        let task = Arc::new(self);
        Some(spawn_periodic("cleanup", period, move || {
            let task = task.clone();
            async move {
                let result = tokio::task::spawn_blocking(move || task.run()).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "cleanup failed"),
                    Err(e) => warn!(error = %e, "cleanup task panicked"),
                }
            }
        }))
    }
}
