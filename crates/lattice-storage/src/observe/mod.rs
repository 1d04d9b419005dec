//! Observation bus: row, table, and collection subscribers with
//! execution-context delivery and cross-instance coherence.
//!
//! Internal locks are held only for map lookup/update; dispatch snapshots
//! the subscriber lists first (copy-then-iterate) and never holds a lock
//! across a callback. Subscriber panics are caught and logged; they never
//! reach the writer.

pub mod registry;

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use rustc_hash::FxHashMap;
use tracing::error;

use lattice_core::audit::{AuditEntry, AuditOp};
use lattice_core::events::CollectionChange;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside an inline observer callback.
/// Kernel write entry points refuse to proceed when set.
pub(crate) fn in_observer_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

fn run_guarded(f: impl FnOnce()) {
    IN_CALLBACK.with(|c| c.set(true));
    let result = catch_unwind(AssertUnwindSafe(f));
    IN_CALLBACK.with(|c| c.set(false));
    if result.is_err() {
        error!("observer callback panicked; continuing");
    }
}

// ─── Execution contexts ─────────────────────────────────────────────────

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

struct ContextWorker {
    name: String,
    tx: Sender<Job>,
}

impl Drop for ContextWorker {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Shutdown);
    }
}

/// Where a subscriber's callbacks run.
///
/// `inline` runs on the committing thread right after durable commit; a
/// spawned context is a dedicated worker thread fed in commit order, so
/// subscribers on the same context observe events in commit order.
#[derive(Clone)]
pub struct ExecutionContext {
    worker: Option<Arc<ContextWorker>>,
}

impl ExecutionContext {
    /// Deliver on the committing thread.
    pub fn inline() -> Self {
        Self { worker: None }
    }

    /// Deliver on a dedicated named worker thread.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx) = unbounded::<Job>();
        let thread_name = format!("lattice-ctx-{name}");
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Run(f) => {
                            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                                error!("observer callback panicked; continuing");
                            }
                        }
                        Job::Shutdown => break,
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn context thread {thread_name}: {e}"));
        Self {
            worker: Some(Arc::new(ContextWorker { name, tx })),
        }
    }

    pub fn name(&self) -> &str {
        self.worker.as_ref().map(|w| w.name.as_str()).unwrap_or("inline")
    }

    fn dispatch(&self, job: Box<dyn FnOnce() + Send>) {
        match &self.worker {
            None => run_guarded(job),
            Some(worker) => {
                let _ = worker.tx.send(Job::Run(job));
            }
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::inline()
    }
}

// ─── Subscriber bookkeeping ─────────────────────────────────────────────

pub type RowObserverFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type TableObserverFn = Arc<dyn Fn(&[AuditEntry]) + Send + Sync>;
pub type CollectionObserverFn = Arc<dyn Fn(CollectionChange) + Send + Sync>;

/// Pre-lowered collection predicate: a full `SELECT 1 …` statement whose
/// final parameter is the row's primary key.
#[derive(Clone)]
pub(crate) struct EvalSql {
    pub sql: String,
    pub params: Vec<rusqlite::types::Value>,
}

pub(crate) struct HandleRef {
    pub handle_id: u64,
    pub alive: Weak<dyn Any + Send + Sync>,
}

struct RowSub {
    id: u64,
    ctx: ExecutionContext,
    cb: RowObserverFn,
    handle: Option<HandleRef>,
}

struct TableSub {
    id: u64,
    ctx: ExecutionContext,
    cb: TableObserverFn,
}

struct CollSub {
    id: u64,
    ctx: ExecutionContext,
    cb: CollectionObserverFn,
    eval: Option<EvalSql>,
}

#[derive(Default)]
struct BusState {
    rows: FxHashMap<(String, i64), Vec<RowSub>>,
    tables: FxHashMap<String, Vec<TableSub>>,
    collections: FxHashMap<String, Vec<CollSub>>,
    next_id: u64,
}

impl BusState {
    fn remove(&mut self, id: u64) {
        for subs in self.rows.values_mut() {
            subs.retain(|s| s.id != id);
        }
        for subs in self.tables.values_mut() {
            subs.retain(|s| s.id != id);
        }
        for subs in self.collections.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }
}

/// Cancellation token returned by every `observe` call. Dropping it
/// deregisters the subscription; explicit `cancel` is idempotent.
#[must_use = "dropping the token cancels the subscription"]
pub struct ObserverToken {
    id: u64,
    bus: Weak<Mutex<BusState>>,
}

impl ObserverToken {
    pub fn cancel(&self) {
        if let Some(state) = self.bus.upgrade() {
            if let Ok(mut state) = state.lock() {
                state.remove(self.id);
            }
        }
    }
}

impl Drop for ObserverToken {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ─── Commit publication ─────────────────────────────────────────────────

/// One committed mutation plus its dispatch metadata.
pub(crate) struct CommitItem {
    pub entry: AuditEntry,
    pub initiator: Option<u64>,
    pub collection_hits: Vec<u64>,
}

pub(crate) struct CommitBatch {
    pub items: Vec<CommitItem>,
}

/// The process-wide observation bus of one store.
pub struct ObservationBus {
    state: Arc<Mutex<BusState>>,
}

impl ObservationBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BusState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        f(&mut state)
    }

    pub(crate) fn observe_row(
        &self,
        table: String,
        pk: i64,
        handle: Option<HandleRef>,
        ctx: ExecutionContext,
        cb: RowObserverFn,
    ) -> ObserverToken {
        self.with_state(|state| {
            state.next_id += 1;
            let id = state.next_id;
            state
                .rows
                .entry((table, pk))
                .or_default()
                .push(RowSub { id, ctx, cb, handle });
            ObserverToken {
                id,
                bus: Arc::downgrade(&self.state),
            }
        })
    }

    pub(crate) fn observe_table(
        &self,
        table: String,
        ctx: ExecutionContext,
        cb: TableObserverFn,
    ) -> ObserverToken {
        self.with_state(|state| {
            state.next_id += 1;
            let id = state.next_id;
            state
                .tables
                .entry(table)
                .or_default()
                .push(TableSub { id, ctx, cb });
            ObserverToken {
                id,
                bus: Arc::downgrade(&self.state),
            }
        })
    }

    pub(crate) fn observe_collection(
        &self,
        table: String,
        eval: Option<EvalSql>,
        ctx: ExecutionContext,
        cb: CollectionObserverFn,
    ) -> ObserverToken {
        self.with_state(|state| {
            state.next_id += 1;
            let id = state.next_id;
            state
                .collections
                .entry(table)
                .or_default()
                .push(CollSub { id, ctx, cb, eval });
            ObserverToken {
                id,
                bus: Arc::downgrade(&self.state),
            }
        })
    }

    /// Snapshot of the collection filters for a table, used by the kernel
    /// to evaluate predicates at op time inside the transaction.
    pub(crate) fn collection_filters(&self, table: &str) -> Vec<(u64, Option<EvalSql>)> {
        self.with_state(|state| {
            state
                .collections
                .get(table)
                .map(|subs| subs.iter().map(|s| (s.id, s.eval.clone())).collect())
                .unwrap_or_default()
        })
    }

    /// Fan a committed batch out to subscribers.
    ///
    /// Order within the commit: sibling handle-bound row observers
    /// (excluding the initiator) → external row observers → table
    /// observers → collection observers.
    pub(crate) fn publish(&self, batch: CommitBatch) {
        struct RowDispatch {
            ctx: ExecutionContext,
            cb: RowObserverFn,
        }

        // Snapshot phase: collect everything to call under the lock,
        // invoke nothing until it is released.
        let mut row_dispatches: Vec<(usize, String, Vec<RowDispatch>)> = Vec::new();
        let mut table_order: Vec<String> = Vec::new();
        let mut table_subs: FxHashMap<String, Vec<(ExecutionContext, TableObserverFn)>> =
            FxHashMap::default();
        let mut coll_dispatches: Vec<(CollectionChange, ExecutionContext, CollectionObserverFn)> =
            Vec::new();

        self.with_state(|state| {
            for (index, item) in batch.items.iter().enumerate() {
                let key = (item.entry.table.clone(), item.entry.row_id);
                match item.entry.op {
                    AuditOp::Update => {
                        if let Some(subs) = state.rows.get_mut(&key) {
                            subs.retain(|s| {
                                s.handle
                                    .as_ref()
                                    .map(|h| h.alive.strong_count() > 0)
                                    .unwrap_or(true)
                            });
                            for field in &item.entry.changed_field_names {
                                // Sibling handles first, initiator excluded.
                                let mut targets = Vec::new();
                                for sub in subs.iter() {
                                    if let Some(handle) = &sub.handle {
                                        if Some(handle.handle_id) != item.initiator {
                                            targets.push(RowDispatch {
                                                ctx: sub.ctx.clone(),
                                                cb: Arc::clone(&sub.cb),
                                            });
                                        }
                                    }
                                }
                                for sub in subs.iter() {
                                    if sub.handle.is_none() {
                                        targets.push(RowDispatch {
                                            ctx: sub.ctx.clone(),
                                            cb: Arc::clone(&sub.cb),
                                        });
                                    }
                                }
                                if !targets.is_empty() {
                                    row_dispatches.push((index, field.clone(), targets));
                                }
                            }
                        }
                    }
                    AuditOp::Delete => {
                        // Subject-row deletion ends its row subscriptions.
                        state.rows.remove(&key);
                    }
                    AuditOp::Insert => {}
                }

                if !table_subs.contains_key(&item.entry.table) {
                    let subs = state
                        .tables
                        .get(&item.entry.table)
                        .map(|subs| {
                            subs.iter()
                                .map(|s| (s.ctx.clone(), Arc::clone(&s.cb)))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    table_order.push(item.entry.table.clone());
                    table_subs.insert(item.entry.table.clone(), subs);
                }

                let change = match item.entry.op {
                    AuditOp::Insert => Some(CollectionChange::Insert {
                        primary_key: item.entry.row_id,
                    }),
                    AuditOp::Delete => Some(CollectionChange::Delete {
                        primary_key: item.entry.row_id,
                    }),
                    AuditOp::Update => None,
                };
                if let Some(change) = change {
                    if let Some(subs) = state.collections.get(&item.entry.table) {
                        for sub in subs {
                            if item.collection_hits.contains(&sub.id) {
                                coll_dispatches.push((
                                    change,
                                    sub.ctx.clone(),
                                    Arc::clone(&sub.cb),
                                ));
                            }
                        }
                    }
                }
            }
        });

        // Dispatch phase, no locks held.
        for (_, field, targets) in row_dispatches {
            for target in targets {
                let cb = target.cb;
                let field = field.clone();
                target.ctx.dispatch(Box::new(move || cb(&field)));
            }
        }

        for table in table_order {
            let entries: Arc<Vec<AuditEntry>> = Arc::new(
                batch
                    .items
                    .iter()
                    .filter(|i| i.entry.table == table)
                    .map(|i| i.entry.clone())
                    .collect(),
            );
            for (ctx, cb) in table_subs.remove(&table).unwrap_or_default() {
                let entries = Arc::clone(&entries);
                ctx.dispatch(Box::new(move || cb(&entries)));
            }
        }

        for (change, ctx, cb) in coll_dispatches {
            ctx.dispatch(Box::new(move || cb(change)));
        }
    }
}

impl Default for ObservationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(table: &str, op: AuditOp, pk: i64, fields: &[&str]) -> AuditEntry {
        AuditEntry {
            sequence_id: 1,
            global_id: lattice_core::GlobalId::random(),
            table: table.to_string(),
            op,
            row_id: pk,
            global_row_id: lattice_core::GlobalId::random(),
            changed_fields: fields
                .iter()
                .map(|f| (f.to_string(), lattice_core::Value::Int(1)))
                .collect(),
            changed_field_names: fields.iter().map(|f| f.to_string()).collect(),
            timestamp: 0,
            is_from_remote: false,
            is_synchronized: false,
        }
    }

    #[test]
    fn cancelled_token_stops_delivery() {
        let bus = ObservationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let token = bus.observe_row(
            "Trip".into(),
            1,
            None,
            ExecutionContext::inline(),
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        token.cancel();
        token.cancel(); // idempotent

        bus.publish(CommitBatch {
            items: vec![CommitItem {
                entry: entry("Trip", AuditOp::Update, 1, &["name"]),
                initiator: None,
                collection_hits: vec![],
            }],
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delete_removes_row_subscriptions() {
        let bus = ObservationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _token = bus.observe_row(
            "Trip".into(),
            1,
            None,
            ExecutionContext::inline(),
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(CommitBatch {
            items: vec![CommitItem {
                entry: entry("Trip", AuditOp::Delete, 1, &[]),
                initiator: None,
                collection_hits: vec![],
            }],
        });
        bus.publish(CommitBatch {
            items: vec![CommitItem {
                entry: entry("Trip", AuditOp::Update, 1, &["name"]),
                initiator: None,
                collection_hits: vec![],
            }],
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscriber_panic_is_isolated() {
        let bus = ObservationBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _bad = bus.observe_row(
            "Trip".into(),
            1,
            None,
            ExecutionContext::inline(),
            Arc::new(|_| panic!("subscriber bug")),
        );
        let _good = bus.observe_row(
            "Trip".into(),
            1,
            None,
            ExecutionContext::inline(),
            Arc::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(CommitBatch {
            items: vec![CommitItem {
                entry: entry("Trip", AuditOp::Update, 1, &["name"]),
                initiator: None,
                collection_hits: vec![],
            }],
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
