//! Transport abstraction between peers.

use crate::error::{SyncError, SyncResult};
use crate::peers::Peer;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Moves serialized exchanges to a peer and returns its reply.
///
/// Synchronous from the caller's point of view; a call that exceeds
/// `timeout` fails with [`SyncError::Timeout`].
pub trait Transport: Send + Sync {
    /// Sends `payload` to `peer` and waits for the reply.
    fn send(&self, peer: &Peer, payload: &[u8], timeout: Duration) -> SyncResult<Vec<u8>>;
}

/// Receives serialized exchanges on behalf of a node.
pub trait ExchangeHandler: Send + Sync {
    /// Handles `payload` sent by the caller authenticated as `caller`.
    fn handle(&self, payload: &[u8], caller: &str) -> SyncResult<Vec<u8>>;
}

/// A transport that calls a handler in-process.
///
/// Useful for testing without a network.
pub struct LoopbackTransport {
    handler: Arc<dyn ExchangeHandler>,
    identity: String,
    fail_next: AtomicU32,
    latency: Duration,
    calls: AtomicUsize,
}

impl LoopbackTransport {
    /// Creates a transport that reaches `handler`, authenticating as `identity`.
    pub fn new(handler: Arc<dyn ExchangeHandler>, identity: impl Into<String>) -> Self {
        Self {
            handler,
            identity: identity.into(),
            fail_next: AtomicU32::new(0),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Adds a delay to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes the next `count` calls fail without reaching the handler.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Calls attempted so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, peer: &Peer, payload: &[u8], timeout: Duration) -> SyncResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::transport_retryable(format!(
                "connection to {} refused",
                peer.address
            )));
        }

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency.min(timeout));
            if self.latency > timeout {
                return Err(SyncError::Timeout);
            }
        }

        self.handler.handle(payload, &self.identity)
    }
}
