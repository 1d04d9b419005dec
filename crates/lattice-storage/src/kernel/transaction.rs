//! The writer transaction slot.
//!
//! One logical transaction may be open per store. The slot tracks the
//! owning thread so mutating calls from that thread join the open scope
//! while other writers block; nested explicit begins fail with
//! `TransactionMisuse`. The slot also owns the per-commit diff buffer the
//! change log normalizes into audit entries.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use lattice_core::audit::AuditOp;
use lattice_core::{GlobalId, LatticeError, LatticeResult, Value};

/// Identity carried by a replayed remote entry: the normalized audit
/// entry keeps the remote entry's global id and source timestamp instead
/// of freshly allocated ones.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteStamp {
    pub entry_global_id: GlobalId,
    pub timestamp: i64,
}

/// One recorded mutation, in mutation order.
/// `fields` carries post-write values (empty for deletes).
#[derive(Debug, Clone)]
pub(crate) struct PendingMutation {
    pub op: AuditOp,
    pub table: String,
    pub pk: i64,
    pub global_id: GlobalId,
    pub fields: Vec<(String, Value)>,
    /// Handle id that performed the write, when it came through a managed
    /// row handle. Excluded from sibling notification.
    pub initiator: Option<u64>,
    /// Collection observers whose predicate matched at op time.
    pub collection_hits: Vec<u64>,
    /// Present when this mutation replays a remote audit entry.
    pub remote: Option<RemoteStamp>,
}

#[derive(Default)]
struct GateState {
    owner: Option<ThreadId>,
    explicit: bool,
    pending: Vec<PendingMutation>,
}

/// How a mutating call entered the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteScope {
    /// Opened a fresh auto-commit transaction; the caller must commit or
    /// roll back before returning.
    Auto,
    /// Joined the thread's open explicit transaction.
    Joined,
}

pub(crate) struct TxnGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl TxnGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> LatticeResult<MutexGuard<'_, GateState>> {
        self.state.lock().map_err(|e| LatticeError::Io {
            message: format!("transaction slot poisoned: {e}"),
        })
    }

    /// Wait until the slot is free or owned by the current thread.
    fn lock_owned<'a>(&'a self) -> LatticeResult<MutexGuard<'a, GateState>> {
        let me = thread::current().id();
        let mut state = self.lock()?;
        while state.owner.is_some() && state.owner != Some(me) {
            state = self.cv.wait(state).map_err(|e| LatticeError::Io {
                message: format!("transaction slot poisoned: {e}"),
            })?;
        }
        Ok(state)
    }

    /// Open an explicit transaction for the current thread.
    pub fn begin(&self) -> LatticeResult<()> {
        let mut state = self.lock_owned()?;
        if state.explicit {
            return Err(LatticeError::TransactionMisuse {
                reason: "nested begin".to_string(),
            });
        }
        state.owner = Some(thread::current().id());
        state.explicit = true;
        Ok(())
    }

    /// Enter a write scope: join the thread's explicit transaction or
    /// claim the slot for an auto transaction.
    pub fn enter_write(&self) -> LatticeResult<WriteScope> {
        let mut state = self.lock_owned()?;
        if state.explicit {
            return Ok(WriteScope::Joined);
        }
        state.owner = Some(thread::current().id());
        Ok(WriteScope::Auto)
    }

    /// Whether the current thread owns an open transaction.
    pub fn current_thread_owns(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.owner == Some(thread::current().id()))
            .unwrap_or(false)
    }

    /// Record a mutation in the open scope.
    pub fn record(&self, mutation: PendingMutation) -> LatticeResult<()> {
        let mut state = self.lock()?;
        state.pending.push(mutation);
        Ok(())
    }

    /// Drain the diff buffer for commit. Fails with `TransactionMisuse`
    /// when `explicit` is set but the thread has no open explicit scope.
    pub fn take_pending(&self, explicit: bool) -> LatticeResult<Vec<PendingMutation>> {
        let mut state = self.lock()?;
        if explicit && !(state.explicit && state.owner == Some(thread::current().id())) {
            return Err(LatticeError::TransactionMisuse {
                reason: "commit without begin".to_string(),
            });
        }
        Ok(std::mem::take(&mut state.pending))
    }

    /// Discard the diff buffer for rollback. Same ownership check as
    /// `take_pending`.
    pub fn discard_pending(&self, explicit: bool) -> LatticeResult<()> {
        let mut state = self.lock()?;
        if explicit && !(state.explicit && state.owner == Some(thread::current().id())) {
            return Err(LatticeError::TransactionMisuse {
                reason: "rollback without begin".to_string(),
            });
        }
        state.pending.clear();
        Ok(())
    }

    /// Release the slot and wake waiting writers.
    pub fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.owner = None;
            state.explicit = false;
            state.pending.clear();
        }
        self.cv.notify_all();
    }
}
