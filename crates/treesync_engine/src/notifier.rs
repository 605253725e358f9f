//! Administrator alerts.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Delivers alerts to an administrator.
pub trait Notifier: Send + Sync {
    /// Sends one alert.
    fn alert(&self, recipient: &str, subject: &str, body: &str) -> SyncResult<()>;
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert(&self, recipient: &str, subject: &str, body: &str) -> SyncResult<()> {
        warn!(%recipient, %subject, %body, "administrator alert");
        Ok(())
    }
}

/// An alert as it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Recipient.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
}

/// Keeps every alert in memory. For tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following alert fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Alerts sent so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Number of alerts sent so far.
    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

impl Notifier for RecordingNotifier {
    fn alert(&self, recipient: &str, subject: &str, body: &str) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Notification("mail relay unavailable".into()));
        }
        self.alerts.lock().push(Alert {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        });
        Ok(())
    }
}
