//! The transaction lifecycle state machine (SPEC_FULL §3.2, §4.D.2):
//! `Created -> Queued -> Running -> {Committed | Failed}`, with an
//! optional post-terminal `Cleanup`. Every transition stamps the
//! corresponding timestamp field, and stamps are enforced monotonically
//! non-decreasing within one transaction even if the caller's clock
//! skews backward between calls (SPEC_FULL §5).
//!
//! This module owns the state machine only; it has no notion of
//! replication or wire transport — `vnic.rs` drives one `TransactionTracker`
//! per in-flight transactional request/response and copies its fields
//! onto the `Message` it sends.

use mesh_core::TransactionState;

use crate::error::RuntimeError;

/// Seconds since the Unix epoch. `tr_timeout` is an absolute deadline in
/// these units, not a duration (SPEC_FULL §3.2).
pub fn epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Drives one transaction through its state machine and timestamps.
#[derive(Debug, Clone)]
pub struct TransactionTracker {
    state: TransactionState,
    pub created: i64,
    pub queued: i64,
    pub running: i64,
    pub end: i64,
    pub timeout: i64,
    pub err_msg: String,
}

impl TransactionTracker {
    /// `timeout` is the absolute epoch-second deadline this transaction
    /// must finish `Running` by.
    pub fn new(timeout: i64) -> Self {
        TransactionTracker {
            state: TransactionState::NotATransaction,
            created: 0,
            queued: 0,
            running: 0,
            end: 0,
            timeout,
            err_msg: String::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn create(&mut self, at: i64) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Created)?;
        self.created = at.max(self.created);
        Ok(())
    }

    pub fn queue(&mut self, at: i64) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Queued)?;
        self.queued = at.max(self.created);
        Ok(())
    }

    pub fn run(&mut self, at: i64) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Running)?;
        self.running = at.max(self.queued);
        Ok(())
    }

    pub fn commit(&mut self, at: i64) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Committed)?;
        self.end = at.max(self.running);
        Ok(())
    }

    pub fn rollback(&mut self, at: i64) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Rollback)?;
        self.end = at.max(self.running);
        Ok(())
    }

    /// Move to `Failed`, recording `err_msg`. Reachable directly from
    /// `Running` or after a `Rollback` (SPEC_FULL §4.D.2).
    pub fn fail(&mut self, at: i64, err_msg: impl Into<String>) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Failed)?;
        self.end = at.max(self.end).max(self.running);
        self.err_msg = err_msg.into();
        Ok(())
    }

    pub fn cleanup(&mut self) -> Result<(), RuntimeError> {
        self.transition(TransactionState::Cleanup)
    }

    /// Force `Failed` with a synthesized error if this transaction is
    /// still `Running` past its absolute `timeout` deadline. No-op
    /// otherwise — including when already terminal.
    pub fn enforce_timeout(&mut self, now: i64) -> Result<(), RuntimeError> {
        if self.state == TransactionState::Running && now > self.timeout {
            self.fail(now, "transaction deadline exceeded while running")?;
        }
        Ok(())
    }

    fn transition(&mut self, next: TransactionState) -> Result<(), RuntimeError> {
        use TransactionState::*;
        let allowed = matches!(
            (self.state, next),
            (NotATransaction, Created)
                | (Created, Queued)
                | (Queued, Running)
                | (Running, Committed)
                | (Running, Rollback)
                | (Running, Failed)
                | (Rollback, Failed)
                | (Committed, Cleanup)
                | (Failed, Cleanup)
        );
        if !allowed {
            return Err(RuntimeError::Protocol(format!(
                "illegal transaction transition {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}
