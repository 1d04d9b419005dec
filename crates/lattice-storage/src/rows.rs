//! Dynamic rows: the in-memory representation of a row.
//!
//! An *unmanaged* row owns its field map (defaults applied at creation);
//! a *managed* row is bound to `(store, primary key)` and forwards every
//! access to the storage kernel, holding no field data in memory. `insert`
//! transitions Unmanaged → Managed in place; delete is terminal.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use lattice_core::schema::{ColumnKind, TableDescriptor};
use lattice_core::{GlobalId, LatticeError, LatticeResult, SendableRef, Value};

use crate::kernel::rows::{check_value, FieldMap};
use crate::observe::{ExecutionContext, HandleRef, ObserverToken};
use crate::query::predicate::{lower, LowerCtx, Predicate};
use crate::store::StoreShared;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) enum RowState {
    Unmanaged {
        desc: Arc<TableDescriptor>,
        global_id: GlobalId,
        fields: FieldMap,
    },
    Managed {
        shared: Arc<StoreShared>,
        table: String,
        pk: i64,
        global_id: GlobalId,
    },
}

pub(crate) struct RowInner {
    pub(crate) handle_id: u64,
    pub(crate) state: RwLock<RowState>,
}

impl Drop for RowInner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.read() {
            if let RowState::Managed {
                shared, table, pk, ..
            } = &*state
            {
                shared.instances.deregister(table, *pk, self.handle_id);
            }
        }
    }
}

/// A shared handle to one dynamic row. Cloning shares the handle; separate
/// `Store::get` calls produce distinct handles of the same row.
#[derive(Clone)]
pub struct DynamicRow {
    pub(crate) inner: Arc<RowInner>,
}

impl DynamicRow {
    pub(crate) fn new_unmanaged(desc: Arc<TableDescriptor>) -> Self {
        let mut fields = FieldMap::default();
        for col in &desc.columns {
            fields.insert(col.name.clone(), col.effective_default());
        }
        Self {
            inner: Arc::new(RowInner {
                handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                state: RwLock::new(RowState::Unmanaged {
                    desc,
                    global_id: GlobalId::random(),
                    fields,
                }),
            }),
        }
    }

    pub(crate) fn new_managed(
        shared: Arc<StoreShared>,
        table: String,
        pk: i64,
        global_id: GlobalId,
    ) -> Self {
        let inner = Arc::new(RowInner {
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            state: RwLock::new(RowState::Managed {
                shared: Arc::clone(&shared),
                table: table.clone(),
                pk,
                global_id,
            }),
        });
        shared
            .instances
            .register(&table, pk, inner.handle_id, Arc::downgrade(&inner));
        Self { inner }
    }

    fn state(&self) -> LatticeResult<std::sync::RwLockReadGuard<'_, RowState>> {
        self.inner.state.read().map_err(|e| LatticeError::Io {
            message: format!("row state poisoned: {e}"),
        })
    }

    pub fn table(&self) -> String {
        match &*self.state().expect("row state poisoned") {
            RowState::Unmanaged { desc, .. } => desc.name.clone(),
            RowState::Managed { table, .. } => table.clone(),
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(&*self.state().expect("row state poisoned"), RowState::Managed { .. })
    }

    pub fn primary_key(&self) -> Option<i64> {
        match &*self.state().expect("row state poisoned") {
            RowState::Unmanaged { .. } => None,
            RowState::Managed { pk, .. } => Some(*pk),
        }
    }

    pub fn global_id(&self) -> GlobalId {
        match &*self.state().expect("row state poisoned") {
            RowState::Unmanaged { global_id, .. } | RowState::Managed { global_id, .. } => {
                *global_id
            }
        }
    }

    /// A plain `(table, primary key)` value for crossing threads.
    /// `None` for unmanaged rows.
    pub fn sendable_ref(&self) -> Option<SendableRef> {
        match &*self.state().expect("row state poisoned") {
            RowState::Unmanaged { .. } => None,
            RowState::Managed { table, pk, .. } => Some(SendableRef::new(table.clone(), *pk)),
        }
    }

    /// Typed field read.
    pub fn get(&self, name: &str) -> LatticeResult<Value> {
        match &*self.state()? {
            RowState::Unmanaged { desc, fields, .. } => fields.get(name).cloned().ok_or_else(|| {
                LatticeError::schema_invalid(&desc.name, format!("unknown column '{name}'"))
            }),
            RowState::Managed {
                shared, table, pk, ..
            } => shared.kernel.get_column(table, *pk, name),
        }
    }

    /// Typed field write. On a managed row the write flows through the
    /// kernel and notifies sibling handles before external observers.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> LatticeResult<()> {
        let value = value.into();
        let mut state = self.inner.state.write().map_err(|e| LatticeError::Io {
            message: format!("row state poisoned: {e}"),
        })?;
        match &mut *state {
            RowState::Unmanaged { desc, fields, .. } => {
                let col = desc.column(name).ok_or_else(|| {
                    LatticeError::schema_invalid(&desc.name, format!("unknown column '{name}'"))
                })?;
                check_value(&desc.name, col, &value)?;
                fields.insert(name.to_string(), value);
                Ok(())
            }
            RowState::Managed {
                shared, table, pk, ..
            } => {
                let (shared, table, pk) = (Arc::clone(shared), table.clone(), *pk);
                drop(state);
                shared
                    .kernel
                    .set_column(&table, pk, name, value, Some(self.inner.handle_id))
            }
        }
    }

    /// `(name, kind, value)` triples for every declared column, link lists
    /// included.
    pub fn fields(&self) -> LatticeResult<Vec<(String, ColumnKind, Value)>> {
        match &*self.state()? {
            RowState::Unmanaged { desc, fields, .. } => Ok(desc
                .columns
                .iter()
                .map(|col| {
                    (
                        col.name.clone(),
                        col.kind.clone(),
                        fields.get(&col.name).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect()),
            RowState::Managed {
                shared, table, pk, ..
            } => {
                let desc = shared.kernel.descriptor(table)?;
                let (_, mut map) = shared.kernel.get_row(table, *pk)?;
                let mut out = Vec::with_capacity(desc.columns.len());
                for col in &desc.columns {
                    let value = if col.kind.is_list() {
                        shared.kernel.get_column(table, *pk, &col.name)?
                    } else {
                        map.remove(&col.name).unwrap_or(Value::Null)
                    };
                    out.push((col.name.clone(), col.kind.clone(), value));
                }
                Ok(out)
            }
        }
    }

    /// The row's full field map — the representation unmanaged rows carry,
    /// also used for round-trips outside the store.
    pub fn field_map(&self) -> LatticeResult<FieldMap> {
        Ok(self
            .fields()?
            .into_iter()
            .map(|(name, _, value)| (name, value))
            .collect())
    }

    /// Observe field mutations of this (managed) row. The registration
    /// holds only a weak back-reference, so observation never keeps the
    /// row alive.
    pub fn observe(
        &self,
        ctx: ExecutionContext,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> LatticeResult<ObserverToken> {
        match &*self.state()? {
            RowState::Unmanaged { desc, .. } => Err(LatticeError::query_invalid(
                &desc.name,
                "cannot observe an unmanaged row",
            )),
            RowState::Managed {
                shared, table, pk, ..
            } => {
                let alive: Arc<dyn Any + Send + Sync> = self.inner.clone();
                Ok(shared.bus.observe_row(
                    table.clone(),
                    *pk,
                    Some(HandleRef {
                        handle_id: self.inner.handle_id,
                        alive: Arc::downgrade(&alive),
                    }),
                    ctx,
                    Arc::new(callback),
                ))
            }
        }
    }

    // ── Link lists ──────────────────────────────────────────────────────

    fn with_managed<T>(
        &self,
        f: impl FnOnce(&Arc<StoreShared>, &str, i64) -> LatticeResult<T>,
    ) -> LatticeResult<T> {
        match &*self.state()? {
            RowState::Unmanaged { desc, .. } => Err(LatticeError::query_invalid(
                &desc.name,
                "link-list operations on unmanaged rows go through set(column, list)",
            )),
            RowState::Managed {
                shared, table, pk, ..
            } => f(shared, table, *pk),
        }
    }

    /// Append a target row to the end of a link list.
    pub fn append_link(&self, column: &str, target: &DynamicRow) -> LatticeResult<()> {
        let target_gid = target.global_id();
        self.with_managed(|shared, table, pk| {
            shared
                .kernel
                .append_link(table, pk, column, target_gid, Some(self.inner.handle_id))
        })
    }

    /// Remove the element at a position; returns the removed target id.
    pub fn remove_link_at(&self, column: &str, index: usize) -> LatticeResult<Option<GlobalId>> {
        self.with_managed(|shared, table, pk| {
            shared
                .kernel
                .remove_link_at(table, pk, column, index, Some(self.inner.handle_id))
        })
    }

    /// Managed handle of the target row at a position.
    pub fn link_at(&self, column: &str, index: usize) -> LatticeResult<Option<DynamicRow>> {
        self.with_managed(|shared, table, pk| {
            let Some(target_gid) = shared.kernel.link_at(table, pk, column, index)? else {
                return Ok(None);
            };
            let desc = shared.kernel.descriptor(table)?;
            let target_table = desc
                .column(column)
                .and_then(|c| c.kind.link_target())
                .ok_or_else(|| {
                    LatticeError::schema_invalid(table, format!("column '{column}' is not a link list"))
                })?
                .to_string();
            let Some(target_pk) = shared.kernel.pk_for_global_id(&target_table, target_gid)?
            else {
                return Ok(None);
            };
            Ok(Some(shared.managed_row(&target_table, target_pk)?))
        })
    }

    pub fn link_count(&self, column: &str) -> LatticeResult<usize> {
        self.with_managed(|shared, table, pk| shared.kernel.link_count(table, pk, column))
    }

    /// Position of the first occurrence of `target` in the list.
    pub fn find_link_index(
        &self,
        column: &str,
        target: &DynamicRow,
    ) -> LatticeResult<Option<usize>> {
        let target_gid = target.global_id();
        self.with_managed(|shared, table, pk| {
            shared.kernel.find_link_index(table, pk, column, target_gid)
        })
    }

    /// Positions of all elements whose target row satisfies a predicate
    /// rooted at the target table.
    pub fn find_link_indices_where(
        &self,
        column: &str,
        pred: &Predicate,
    ) -> LatticeResult<Vec<usize>> {
        self.with_managed(|shared, table, pk| {
            let desc = shared.kernel.descriptor(table)?;
            let target_table = desc
                .column(column)
                .and_then(|c| c.kind.link_target())
                .ok_or_else(|| {
                    LatticeError::schema_invalid(table, format!("column '{column}' is not a link list"))
                })?
                .to_string();
            let target_desc = shared.kernel.descriptor(&target_table)?;
            let mut ctx = LowerCtx::new(&shared.kernel.registry);
            let sql = lower(&mut ctx, &target_desc, "t", pred)?;
            shared
                .kernel
                .find_link_indices_where(table, pk, column, &sql, ctx.params)
        })
    }
}
