//! Configuration for a replication node.

use std::path::PathBuf;
use std::time::Duration;
use treesync_protocol::{FailureKind, RecordState};
use uuid::Uuid;

/// Configuration for one node of the replication tree.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// This node's identity.
    pub server_uuid: Uuid,
    /// Compatibility tag stamped on captured records and checked on ingest.
    pub database_version: String,
    /// Deliveries allowed before a failing record is stopped.
    pub max_retry_count: u32,
    /// Maximum records per outbound transmission.
    pub max_records: usize,
    /// Failure kinds that do not count against a record's retry budget.
    pub non_penalized_errors: Vec<FailureKind>,
    /// Directory for the transmission journal.
    pub journal_dir: Option<PathBuf>,
    /// Recipient of administrator alerts.
    pub admin_email: Option<String>,
    /// Interval for automatic synchronization.
    pub sync_interval: Option<Duration>,
    /// Per-call transport timeout.
    pub connection_timeout: Duration,
    /// Retention policy for delivered records.
    pub purge: PurgeConfig,
}

impl SyncConfig {
    /// Creates a configuration for the node with the given identity.
    pub fn new(server_uuid: Uuid) -> Self {
        Self {
            server_uuid,
            database_version: "1.0".into(),
            max_retry_count: 5,
            max_records: 50,
            non_penalized_errors: Vec::new(),
            journal_dir: None,
            admin_email: None,
            sync_interval: None,
            connection_timeout: Duration::from_secs(10),
            purge: PurgeConfig::default(),
        }
    }

    /// Sets the database version tag.
    pub fn with_database_version(mut self, version: impl Into<String>) -> Self {
        self.database_version = version.into();
        self
    }

    /// Sets the retry ceiling.
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    /// Sets the maximum records per transmission.
    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }

    /// Adds a failure kind that does not consume retries.
    pub fn with_non_penalized_error(mut self, kind: FailureKind) -> Self {
        if !self.non_penalized_errors.contains(&kind) {
            self.non_penalized_errors.push(kind);
        }
        self
    }

    /// Enables the transmission journal.
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Sets the alert recipient.
    pub fn with_admin_email(mut self, email: impl Into<String>) -> Self {
        self.admin_email = Some(email.into());
        self
    }

    /// Sets the interval for automatic synchronization.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the transport timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the retention policy.
    pub fn with_purge(mut self, purge: PurgeConfig) -> Self {
        self.purge = purge;
        self
    }

    /// True if failures of this kind keep the retry count unchanged.
    pub fn is_non_penalized(&self, kind: FailureKind) -> bool {
        self.non_penalized_errors.contains(&kind)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(Uuid::nil())
    }
}

/// Retention policy for the cleanup task.
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Records older than this many days are eligible.
    pub days_back: u32,
    /// Extra record-level states that make a record eligible. When empty,
    /// a root purges `New` records and a child purges `Committed` ones.
    pub states: Vec<RecordState>,
    /// How often the cleanup task runs.
    pub interval: Option<Duration>,
}

impl PurgeConfig {
    /// Creates a policy with the given horizon.
    pub fn new(days_back: u32) -> Self {
        Self {
            days_back,
            states: Vec::new(),
            interval: None,
        }
    }

    /// Also purges records in `state`.
    pub fn with_state(mut self, state: RecordState) -> Self {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    /// Sets how often cleanup runs.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// The purge horizon.
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.days_back))
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self::new(90)
    }
}
