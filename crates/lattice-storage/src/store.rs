//! The `Store` facade: opening, object lifecycle, transactions, queries,
//! observation, and the sync boundary.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use lattice_core::audit::AuditEntry;
use lattice_core::events::CollectionChange;
use lattice_core::{GlobalId, LatticeError, LatticeResult, Schema, SendableRef, StoreConfig};

use crate::audit::{log as audit_log, replay};
use crate::kernel::pool::ConnectionPool;
use crate::kernel::StorageKernel;
use crate::migrate::MigrationPlan;
use crate::observe::registry::InstanceRegistry;
use crate::observe::{EvalSql, ExecutionContext, ObservationBus, ObserverToken};
use crate::query::predicate::{lower, LowerCtx, Predicate};
use crate::query::{Query, VirtualQuery};
use crate::rows::{DynamicRow, RowState};
use crate::schema::ddl::quote_ident;
use crate::schema::registry::SchemaRegistry;

pub(crate) struct StoreShared {
    pub(crate) kernel: StorageKernel,
    pub(crate) bus: Arc<ObservationBus>,
    pub(crate) instances: InstanceRegistry,
    pub(crate) config: StoreConfig,
}

impl StoreShared {
    /// A fresh managed handle for an existing row.
    pub(crate) fn managed_row(
        self: &Arc<Self>,
        table: &str,
        pk: i64,
    ) -> LatticeResult<DynamicRow> {
        let gid = self.kernel.global_id_for(table, pk)?;
        Ok(DynamicRow::new_managed(
            Arc::clone(self),
            table.to_string(),
            pk,
            gid,
        ))
    }
}

/// An open Lattice store.
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Open or create a store; applies DDL for new tables and migrates on
    /// additive divergence. Non-additive divergence requires
    /// `open_with_plan`.
    pub fn open(config: StoreConfig, schema: Schema) -> LatticeResult<Self> {
        Self::open_inner(config, schema, None)
    }

    /// Open with a user-supplied migration plan for non-additive schema
    /// changes.
    pub fn open_with_plan(
        config: StoreConfig,
        schema: Schema,
        plan: MigrationPlan,
    ) -> LatticeResult<Self> {
        Self::open_inner(config, schema, Some(plan))
    }

    fn open_inner(
        config: StoreConfig,
        schema: Schema,
        plan: Option<MigrationPlan>,
    ) -> LatticeResult<Self> {
        let pool = if config.in_memory {
            ConnectionPool::open_in_memory()?
        } else {
            ConnectionPool::open(&config.path, config.read_pool_size)?
        };
        let registry =
            pool.with_writer(|conn| SchemaRegistry::reconcile(conn, &schema, plan.as_ref()))?;
        info!(
            tables = registry.table_names().len(),
            path = %config.path.display(),
            "store open"
        );
        let bus = Arc::new(ObservationBus::new());
        let kernel = StorageKernel::new(pool, registry, Arc::clone(&bus));
        Ok(Self {
            shared: Arc::new(StoreShared {
                kernel,
                bus,
                instances: InstanceRegistry::new(),
                config,
            }),
        })
    }

    // ── Object lifecycle ────────────────────────────────────────────────

    /// A new unmanaged row of `table` with column defaults applied.
    pub fn new_object(&self, table: &str) -> LatticeResult<DynamicRow> {
        let desc = self.shared.kernel.descriptor(table)?;
        Ok(DynamicRow::new_unmanaged(desc))
    }

    /// Insert an unmanaged row, transitioning the handle to managed in
    /// place. Returns the allocated primary key (or the conflicting row's
    /// key when an upsert constraint matched).
    pub fn insert(&self, row: &DynamicRow) -> LatticeResult<i64> {
        // Snapshot the unmanaged state first; the row lock must not be
        // held across the commit and its observer dispatch.
        let (table, global_id, fields) = {
            let state = row.inner.state.read().map_err(|e| LatticeError::Io {
                message: format!("row state poisoned: {e}"),
            })?;
            match &*state {
                RowState::Managed { table, .. } => {
                    return Err(LatticeError::TransactionMisuse {
                        reason: format!("row of '{table}' is already managed"),
                    })
                }
                RowState::Unmanaged {
                    desc,
                    global_id,
                    fields,
                } => (desc.name.clone(), *global_id, fields.clone()),
            }
        };

        let (pk, gid, _op) = self.shared.kernel.insert(
            &table,
            fields,
            Some(global_id),
            Some(row.inner.handle_id),
        )?;

        let mut state = row.inner.state.write().map_err(|e| LatticeError::Io {
            message: format!("row state poisoned: {e}"),
        })?;
        *state = RowState::Managed {
            shared: Arc::clone(&self.shared),
            table: table.clone(),
            pk,
            global_id: gid,
        };
        drop(state);
        self.shared.instances.register(
            &table,
            pk,
            row.inner.handle_id,
            Arc::downgrade(&row.inner),
        );
        Ok(pk)
    }

    /// A managed handle for the row with this primary key.
    pub fn get(&self, table: &str, pk: i64) -> LatticeResult<DynamicRow> {
        self.shared.managed_row(table, pk)
    }

    /// A managed handle resolved by global id.
    pub fn get_by_global_id(&self, table: &str, gid: GlobalId) -> LatticeResult<DynamicRow> {
        let pk = self
            .shared
            .kernel
            .pk_for_global_id(table, gid)?
            .ok_or_else(|| LatticeError::NotFound {
                table: table.to_string(),
                key: gid.to_string(),
            })?;
        self.shared.managed_row(table, pk)
    }

    /// Resolve a `SendableRef` on this context: an existing live handle
    /// when one is registered, otherwise a fresh managed handle.
    pub fn resolve(&self, sendable: &SendableRef) -> LatticeResult<DynamicRow> {
        if let Some(inner) = self
            .shared
            .instances
            .live_handle(&sendable.table, sendable.primary_key)
        {
            return Ok(DynamicRow { inner });
        }
        self.shared.managed_row(&sendable.table, sendable.primary_key)
    }

    /// Delete a row by primary key. Returns whether it existed.
    pub fn delete(&self, table: &str, pk: i64) -> LatticeResult<bool> {
        let deleted = self.shared.kernel.delete(table, pk)?;
        if deleted {
            self.shared.instances.clear_row(table, pk);
        }
        Ok(deleted)
    }

    /// Delete every row matching a predicate. Returns the count.
    pub fn delete_where(&self, table: &str, pred: &Predicate) -> LatticeResult<usize> {
        let desc = self.shared.kernel.descriptor(table)?;
        let mut ctx = LowerCtx::new(&self.shared.kernel.registry);
        let sql = lower(&mut ctx, &desc, "t", pred)?;
        self.shared.kernel.delete_where_raw(table, &sql, ctx.params)
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Begin an explicit transaction on this thread. Nested begins fail
    /// with `TransactionMisuse`.
    pub fn begin(&self) -> LatticeResult<()> {
        self.shared.kernel.begin()
    }

    /// Commit the open transaction; audit entries become durable with the
    /// data and the batch is published to observers.
    pub fn commit(&self) -> LatticeResult<()> {
        self.shared.kernel.commit()
    }

    /// Roll back the open transaction; no entries are published.
    pub fn rollback(&self) -> LatticeResult<()> {
        self.shared.kernel.rollback()
    }

    /// Closure-scoped transaction: commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Store) -> LatticeResult<T>,
    ) -> LatticeResult<T> {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// A query over all rows of `table`.
    pub fn query(&self, table: &str) -> LatticeResult<Query> {
        self.shared.kernel.descriptor(table)?;
        Ok(Query::new(Arc::clone(&self.shared), table.to_string()))
    }

    /// A virtual query across several member tables.
    pub fn virtual_query(&self, tables: &[&str]) -> LatticeResult<VirtualQuery> {
        for table in tables {
            self.shared.kernel.descriptor(table)?;
        }
        Ok(VirtualQuery::new(
            Arc::clone(&self.shared),
            tables.iter().map(|t| t.to_string()).collect(),
        ))
    }

    // ── Observation ─────────────────────────────────────────────────────

    /// Observe field mutations of one row (external subscriber; handles
    /// use `DynamicRow::observe`).
    pub fn observe_row(
        &self,
        table: &str,
        pk: i64,
        ctx: ExecutionContext,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> LatticeResult<ObserverToken> {
        self.shared.kernel.descriptor(table)?;
        Ok(self
            .shared
            .bus
            .observe_row(table.to_string(), pk, None, ctx, Arc::new(callback)))
    }

    /// Observe a table: one callback per commit with that commit's audit
    /// entries for the table.
    pub fn observe_table(
        &self,
        table: &str,
        ctx: ExecutionContext,
        callback: impl Fn(&[AuditEntry]) + Send + Sync + 'static,
    ) -> LatticeResult<ObserverToken> {
        self.shared.kernel.descriptor(table)?;
        Ok(self
            .shared
            .bus
            .observe_table(table.to_string(), ctx, Arc::new(callback)))
    }

    /// Observe membership changes of a (possibly filtered) collection.
    /// Inserts fire when the row satisfies the predicate at insert time;
    /// deletes when the pre-delete row satisfied it.
    pub fn observe_collection(
        &self,
        table: &str,
        pred: Option<Predicate>,
        ctx: ExecutionContext,
        callback: impl Fn(CollectionChange) + Send + Sync + 'static,
    ) -> LatticeResult<ObserverToken> {
        let desc = self.shared.kernel.descriptor(table)?;
        let eval = match pred {
            None => None,
            Some(pred) => {
                let mut lower_ctx = LowerCtx::new(&self.shared.kernel.registry);
                let clause = lower(&mut lower_ctx, &desc, "t", &pred)?;
                let pk_param = lower_ctx.params.len() + 1;
                Some(EvalSql {
                    sql: format!(
                        "SELECT 1 FROM {} t WHERE ({clause}) AND t.pk = ?{pk_param}",
                        quote_ident(table)
                    ),
                    params: lower_ctx.params,
                })
            }
        };
        Ok(self
            .shared
            .bus
            .observe_collection(table.to_string(), eval, ctx, Arc::new(callback)))
    }

    // ── Sync boundary ───────────────────────────────────────────────────

    /// Apply a server-sent payload: an audit-log batch (idempotent,
    /// last-write-wins) or an acknowledgement. Returns the acknowledged
    /// entry ids.
    pub fn apply_remote(&self, bytes: &[u8]) -> LatticeResult<Vec<GlobalId>> {
        replay::apply_remote(&self.shared.kernel, bytes)
    }

    /// Audit entries strictly after the entry with the given global id
    /// (all entries when `None`).
    pub fn events_after(&self, after: Option<GlobalId>) -> LatticeResult<Vec<AuditEntry>> {
        self.shared.kernel.read(|conn| {
            let seq = match after {
                None => 0,
                Some(gid) => audit_log::sequence_for(conn, gid)?.ok_or_else(|| {
                    LatticeError::NotFound {
                        table: "_lattice_audit".to_string(),
                        key: gid.to_string(),
                    }
                })?,
            };
            audit_log::entries_after(conn, seq)
        })
    }

    /// Total number of audit entries.
    pub fn audit_entry_count(&self) -> LatticeResult<u64> {
        self.shared.kernel.read(audit_log::count)
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// WAL checkpoint.
    pub fn checkpoint(&self) -> LatticeResult<()> {
        self.shared.kernel.pool.checkpoint()
    }

    /// Store file path (`None` for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.shared.kernel.pool.path()
    }

    /// The metric vector queries use when none is requested.
    pub fn vector_metric_default(&self) -> lattice_core::VectorMetric {
        self.shared.config.vector_metric_default
    }

    /// Number of live in-memory handles for a row (instance registry).
    pub fn live_handle_count(&self, table: &str, pk: i64) -> usize {
        self.shared.instances.live_count(table, pk)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.shared.kernel.pool.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_rows_are_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<Store>();
        check::<DynamicRow>();
    }
}
