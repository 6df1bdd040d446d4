//! The pending-request table: tracks outstanding requests awaiting a
//! reply, keyed by the per-VNic sequence number assigned when the
//! request was dispatched (SPEC_FULL §4.D.1, §5).
//!
//! Completion and cancellation both remove the entry exactly once, which
//! is what lets deadline-elapsed and connection-lost races resolve
//! safely: whichever happens first wins, the other finds nothing there.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout as tokio_timeout;

use mesh_core::Message;

use crate::error::RuntimeError;

/// `sequence -> completion channel` for requests awaiting a reply on one
/// connection. Cheap to clone; the table itself lives behind an `Arc`.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<DashMap<u32, oneshot::Sender<Message>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry for `sequence`, returning the receiver
    /// half the caller awaits. Overwrites any stale entry already at
    /// this sequence (the sequence counter wrapping back onto an entry
    /// that somehow never completed is not expected to happen in
    /// practice, but registering must never block on it).
    pub fn register(&self, sequence: u32) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(sequence, tx);
        rx
    }

    /// Complete the pending entry for `sequence` with `reply`, removing
    /// it. Returns `false` if no entry matched — SPEC_FULL §4.D.1:
    /// mismatched replies are dropped, not queued or buffered.
    pub fn complete(&self, sequence: u32, reply: Message) -> bool {
        match self.inner.remove(&sequence) {
            Some((_, tx)) => {
                // The receiver may already be gone if its deadline just
                // elapsed; that race is harmless, the reply is simply lost.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Remove the pending entry for `sequence` without completing it.
    /// Called once a caller's deadline elapses.
    pub fn cancel(&self, sequence: u32) {
        self.inner.remove(&sequence);
    }

    /// Drop every pending entry, dropping each completion sender with
    /// it. Every caller still awaiting one observes a closed channel and
    /// must translate that into `ConnectionLost` (see `await_reply`
    /// below) — this method itself does not send anything.
    pub fn fail_all(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Await `rx` until either a reply lands, the connection drops the
/// sender (`ConnectionLost`), or `deadline` elapses (`Timeout`, which
/// also removes the table entry so a late reply is silently discarded).
/// A reply whose `fail_message` is non-empty is surfaced as
/// `RemoteFailure` rather than `Ok` (SPEC_FULL §4.D.1/§4.D.3).
pub async fn await_reply(
    pending: &PendingTable,
    sequence: u32,
    rx: oneshot::Receiver<Message>,
    deadline: std::time::Duration,
) -> Result<Vec<u8>, RuntimeError> {
    match tokio_timeout(deadline, rx).await {
        Ok(Ok(reply)) if reply.fail_message.is_empty() => Ok(reply.payload),
        Ok(Ok(reply)) => Err(RuntimeError::RemoteFailure(reply.fail_message)),
        Ok(Err(_closed)) => Err(RuntimeError::ConnectionLost),
        Err(_elapsed) => {
            pending.cancel(sequence);
            Err(RuntimeError::Timeout)
        }
    }
}
