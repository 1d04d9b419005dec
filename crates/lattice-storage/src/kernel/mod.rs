//! Storage kernel: durable, ordered single-writer access to rows, link
//! lists, and the audit log.
//!
//! The kernel owns the connection pool and the transaction slot. Every
//! mutating operation runs inside a commit scope (the caller's explicit
//! transaction or its own auto transaction), records a diff tuple, and on
//! durable commit the normalized audit batch is appended and published to
//! the observation bus.

pub mod functions;
pub mod links;
pub mod pool;
pub mod pragmas;
pub mod rows;
pub(crate) mod transaction;

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use lattice_core::audit::{AuditEntry, AuditOp};
use lattice_core::schema::ColumnKind;
use lattice_core::{GlobalId, LatticeError, LatticeResult, Value};

use crate::audit::log as audit_log;
use crate::observe::{CommitBatch, CommitItem, EvalSql, ObservationBus};
use crate::schema::registry::SchemaRegistry;

use pool::ConnectionPool;
use rows::FieldMap;
use transaction::{PendingMutation, TxnGate, WriteScope};

pub(crate) use transaction::RemoteStamp;

pub struct StorageKernel {
    pub(crate) pool: ConnectionPool,
    pub(crate) registry: SchemaRegistry,
    pub(crate) gate: TxnGate,
    pub(crate) bus: Arc<ObservationBus>,
    last_audit_ts: Mutex<i64>,
}

impl StorageKernel {
    pub(crate) fn new(
        pool: ConnectionPool,
        registry: SchemaRegistry,
        bus: Arc<ObservationBus>,
    ) -> Self {
        Self {
            pool,
            registry,
            gate: TxnGate::new(),
            bus,
            last_audit_ts: Mutex::new(0),
        }
    }

    pub(crate) fn descriptor(
        &self,
        table: &str,
    ) -> LatticeResult<Arc<lattice_core::TableDescriptor>> {
        self.registry.descriptor(table)
    }

    /// Read routing: reads inside the current thread's open transaction go
    /// through the writer so they observe its uncommitted state; all other
    /// reads use the read pool over the WAL snapshot.
    pub(crate) fn read<F, T>(&self, f: F) -> LatticeResult<T>
    where
        F: FnOnce(&Connection) -> LatticeResult<T>,
    {
        if self.gate.current_thread_owns() {
            self.pool.with_writer(f)
        } else {
            self.pool.with_reader(f)
        }
    }

    fn guard_reentrancy(&self) -> LatticeResult<()> {
        if crate::observe::in_observer_callback() {
            return Err(LatticeError::TransactionMisuse {
                reason: "re-entrant write from an observer callback".to_string(),
            });
        }
        Ok(())
    }

    /// Run a mutating closure in a commit scope. In auto mode the scope is
    /// its own transaction: audit entries are appended and the batch
    /// published as soon as the closure succeeds.
    pub(crate) fn with_write_scope<T>(
        &self,
        f: impl FnOnce(&Connection) -> LatticeResult<T>,
    ) -> LatticeResult<T> {
        self.guard_reentrancy()?;
        match self.gate.enter_write()? {
            WriteScope::Joined => self.pool.with_writer(f),
            WriteScope::Auto => {
                let result = self.pool.with_writer(|conn| {
                    conn.execute_batch("BEGIN IMMEDIATE")?;
                    match f(conn) {
                        Ok(value) => {
                            let pending = self.gate.take_pending(false)?;
                            match self.finalize_commit(conn, pending) {
                                Ok(batch) => Ok((value, batch)),
                                Err(e) => {
                                    let _ = conn.execute_batch("ROLLBACK");
                                    Err(e)
                                }
                            }
                        }
                        Err(e) => {
                            let _ = conn.execute_batch("ROLLBACK");
                            let _ = self.gate.discard_pending(false);
                            Err(e)
                        }
                    }
                });
                self.gate.release();
                match result {
                    Ok((value, batch)) => {
                        self.bus.publish(batch);
                        Ok(value)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Normalize the diff buffer into audit entries, append them inside the
    /// open transaction, and commit. Locally originated entries get
    /// strictly increasing timestamps (clamped to the wall clock) so
    /// sequence order implies timestamp order and per-field last-write-wins
    /// stays deterministic; replayed remote entries keep their source
    /// timestamps.
    fn finalize_commit(
        &self,
        conn: &Connection,
        pending: Vec<PendingMutation>,
    ) -> LatticeResult<CommitBatch> {
        let mut last = self.last_audit_ts.lock().unwrap_or_else(|p| p.into_inner());
        let mut items = Vec::with_capacity(pending.len());
        for p in pending {
            let mut changed_fields = FxHashMap::default();
            let mut changed_field_names: SmallVec<[String; 4]> = SmallVec::new();
            for (name, value) in p.fields {
                if !changed_field_names.iter().any(|n| *n == name) {
                    changed_field_names.push(name.clone());
                }
                changed_fields.insert(name, value);
            }
            let (entry_gid, timestamp, is_from_remote) = match p.remote {
                Some(stamp) => (stamp.entry_global_id, stamp.timestamp, true),
                None => {
                    let ts = audit_log::now_ms().max(*last + 1);
                    *last = ts;
                    (GlobalId::random(), ts, false)
                }
            };
            let mut entry = AuditEntry {
                sequence_id: 0,
                global_id: entry_gid,
                table: p.table,
                op: p.op,
                row_id: p.pk,
                global_row_id: p.global_id,
                changed_fields,
                changed_field_names,
                timestamp,
                is_from_remote,
                is_synchronized: false,
            };
            audit_log::append_entry(conn, &mut entry)?;
            items.push(CommitItem {
                entry,
                initiator: p.initiator,
                collection_hits: p.collection_hits,
            });
        }
        conn.execute_batch("COMMIT")?;
        Ok(CommitBatch { items })
    }

    // ── Transactions ────────────────────────────────────────────────────

    pub(crate) fn begin(&self) -> LatticeResult<()> {
        self.guard_reentrancy()?;
        self.gate.begin()?;
        let result = self.pool.with_writer(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        });
        if result.is_err() {
            self.gate.release();
        }
        result
    }

    pub(crate) fn commit(&self) -> LatticeResult<()> {
        let pending = self.gate.take_pending(true)?;
        let result = self.pool.with_writer(|conn| {
            match self.finalize_commit(conn, pending) {
                Ok(batch) => Ok(batch),
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        });
        self.gate.release();
        match result {
            Ok(batch) => {
                self.bus.publish(batch);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn rollback(&self) -> LatticeResult<()> {
        self.gate.discard_pending(true)?;
        let result = self.pool.with_writer(|conn| {
            conn.execute_batch("ROLLBACK")?;
            Ok(())
        });
        self.gate.release();
        result
    }

    // ── Row mutations ───────────────────────────────────────────────────

    /// Insert a row. A collision on the table's `allows_upsert` constraint
    /// becomes an in-place update of the conflicting row, recorded as
    /// `update`; any other unique collision is a `ConstraintViolation`.
    pub(crate) fn insert(
        &self,
        table: &str,
        fields: FieldMap,
        preset_gid: Option<GlobalId>,
        initiator: Option<u64>,
    ) -> LatticeResult<(i64, GlobalId, AuditOp)> {
        let desc = self.descriptor(table)?;
        self.with_write_scope(|conn| {
            let gid = preset_gid.unwrap_or_else(GlobalId::random);
            if rows::pk_for_global_id(conn, table, gid)?.is_some() {
                return Err(LatticeError::ConstraintViolation {
                    table: table.to_string(),
                    columns: "global_id".to_string(),
                });
            }
            for constraint in &desc.constraints {
                if let Some(existing) =
                    rows::find_unique_collision(conn, &desc, constraint, &fields)?
                {
                    if constraint.allows_upsert {
                        debug!(table, pk = existing, "upsert collision, updating in place");
                        return self.upsert_update(conn, &desc, existing, &fields, initiator);
                    }
                    return Err(LatticeError::ConstraintViolation {
                        table: table.to_string(),
                        columns: constraint.columns.join(", "),
                    });
                }
            }

            let pk = rows::insert_row_raw(conn, &desc, gid, &fields)?;
            for col in &desc.columns {
                if col.kind.is_list() {
                    if let Some(Value::List(targets)) = fields.get(&col.name) {
                        links::replace_links(conn, &desc, col, gid, targets)?;
                    }
                }
            }

            // Inserts audit the columns whose value differs from the
            // column default.
            let mut changed = Vec::new();
            for col in &desc.columns {
                let value = fields
                    .get(&col.name)
                    .cloned()
                    .unwrap_or_else(|| col.effective_default());
                if value != col.effective_default() {
                    changed.push((col.name.clone(), value));
                }
            }

            let hits = self.eval_collection_hits(conn, table, pk)?;
            self.gate.record(PendingMutation {
                op: AuditOp::Insert,
                table: table.to_string(),
                pk,
                global_id: gid,
                fields: changed,
                initiator,
                collection_hits: hits,
                remote: None,
            })?;
            Ok((pk, gid, AuditOp::Insert))
        })
    }

    fn upsert_update(
        &self,
        conn: &Connection,
        desc: &lattice_core::TableDescriptor,
        pk: i64,
        fields: &FieldMap,
        initiator: Option<u64>,
    ) -> LatticeResult<(i64, GlobalId, AuditOp)> {
        let (gid, current) = rows::read_row(conn, desc, pk)?
            .ok_or_else(|| LatticeError::not_found(&desc.name, pk))?;

        let mut changed = Vec::new();
        let mut scalar_updates = Vec::new();
        for col in &desc.columns {
            let Some(new_value) = fields.get(&col.name) else {
                continue;
            };
            match &col.kind {
                ColumnKind::List { .. } => {
                    let Value::List(targets) = new_value else {
                        continue;
                    };
                    let before = links::link_targets(conn, desc, col, gid)?;
                    if before != *targets {
                        links::replace_links(conn, desc, col, gid, targets)?;
                        changed.push((col.name.clone(), new_value.clone()));
                    }
                }
                _ => {
                    if current.get(&col.name) != Some(new_value) {
                        scalar_updates.push((col.name.clone(), new_value.clone()));
                        changed.push((col.name.clone(), new_value.clone()));
                    }
                }
            }
        }
        if !scalar_updates.is_empty() {
            rows::update_columns(conn, desc, pk, &scalar_updates)?;
        }
        if !changed.is_empty() {
            self.gate.record(PendingMutation {
                op: AuditOp::Update,
                table: desc.name.clone(),
                pk,
                global_id: gid,
                fields: changed,
                initiator,
                collection_hits: Vec::new(),
                remote: None,
            })?;
        }
        Ok((pk, gid, AuditOp::Update))
    }

    /// Typed single-column write. Writing the current value is a complete
    /// no-op: no diff tuple, no audit entry, no notification.
    pub(crate) fn set_column(
        &self,
        table: &str,
        pk: i64,
        column: &str,
        value: Value,
        initiator: Option<u64>,
    ) -> LatticeResult<()> {
        let desc = self.descriptor(table)?;
        let col = desc
            .column(column)
            .ok_or_else(|| LatticeError::schema_invalid(table, format!("unknown column '{column}'")))?;
        self.with_write_scope(|conn| {
            let before = rows::read_column(conn, &desc, pk, col)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            if before == value {
                return Ok(());
            }
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            match &col.kind {
                ColumnKind::List { .. } => {
                    rows::check_value(table, col, &value)?;
                    let targets = match &value {
                        Value::List(targets) => targets.clone(),
                        Value::Null => Vec::new(),
                        _ => unreachable!("check_value enforces list kind"),
                    };
                    links::replace_links(conn, &desc, col, gid, &targets)?;
                }
                _ => rows::update_columns(conn, &desc, pk, &[(column.to_string(), value.clone())])?,
            }
            self.gate.record(PendingMutation {
                op: AuditOp::Update,
                table: table.to_string(),
                pk,
                global_id: gid,
                fields: vec![(column.to_string(), value)],
                initiator,
                collection_hits: Vec::new(),
                remote: None,
            })?;
            Ok(())
        })
    }

    /// Typed single-column read.
    pub(crate) fn get_column(&self, table: &str, pk: i64, column: &str) -> LatticeResult<Value> {
        let desc = self.descriptor(table)?;
        let col = desc
            .column(column)
            .ok_or_else(|| LatticeError::schema_invalid(table, format!("unknown column '{column}'")))?;
        self.read(|conn| {
            rows::read_column(conn, &desc, pk, col)?
                .ok_or_else(|| LatticeError::not_found(table, pk))
        })
    }

    /// Full-row read (lists excluded).
    pub(crate) fn get_row(&self, table: &str, pk: i64) -> LatticeResult<(GlobalId, FieldMap)> {
        let desc = self.descriptor(table)?;
        self.read(|conn| {
            rows::read_row(conn, &desc, pk)?.ok_or_else(|| LatticeError::not_found(table, pk))
        })
    }

    /// Resolve a row's global id; `NotFound` when the primary key misses.
    pub(crate) fn global_id_for(&self, table: &str, pk: i64) -> LatticeResult<GlobalId> {
        self.descriptor(table)?;
        self.read(|conn| {
            rows::row_global_id(conn, table, pk)?.ok_or_else(|| LatticeError::not_found(table, pk))
        })
    }

    pub(crate) fn pk_for_global_id(
        &self,
        table: &str,
        gid: GlobalId,
    ) -> LatticeResult<Option<i64>> {
        self.descriptor(table)?;
        self.read(|conn| rows::pk_for_global_id(conn, table, gid))
    }

    /// Delete a row. Returns whether it existed. Clears the row's link
    /// lists; collection predicates are evaluated against the pre-delete
    /// row inside the transaction.
    pub(crate) fn delete(&self, table: &str, pk: i64) -> LatticeResult<bool> {
        let desc = self.descriptor(table)?;
        self.with_write_scope(|conn| {
            let Some(gid) = rows::row_global_id(conn, table, pk)? else {
                return Ok(false);
            };
            let hits = self.eval_collection_hits(conn, table, pk)?;
            links::clear_all_links(conn, &desc, gid)?;
            rows::delete_row_raw(conn, &desc, pk)?;
            self.gate.record(PendingMutation {
                op: AuditOp::Delete,
                table: table.to_string(),
                pk,
                global_id: gid,
                fields: Vec::new(),
                initiator: None,
                collection_hits: hits,
                remote: None,
            })?;
            Ok(true)
        })
    }

    /// Delete every row matched by a pre-lowered predicate fragment
    /// (referencing the table aliased as `t`). Selection and deletion run
    /// in one commit scope.
    pub(crate) fn delete_where_raw(
        &self,
        table: &str,
        where_sql: &str,
        params: Vec<rusqlite::types::Value>,
    ) -> LatticeResult<usize> {
        let desc = self.descriptor(table)?;
        self.with_write_scope(|conn| {
            let sql = format!(
                "SELECT t.pk FROM {} t WHERE {where_sql}",
                crate::schema::ddl::quote_ident(table)
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let pks: Vec<i64> = stmt
                .query_map(rusqlite::params_from_iter(params), |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            let mut deleted = 0;
            for pk in pks {
                let Some(gid) = rows::row_global_id(conn, table, pk)? else {
                    continue;
                };
                let hits = self.eval_collection_hits(conn, table, pk)?;
                links::clear_all_links(conn, &desc, gid)?;
                rows::delete_row_raw(conn, &desc, pk)?;
                self.gate.record(PendingMutation {
                    op: AuditOp::Delete,
                    table: table.to_string(),
                    pk,
                    global_id: gid,
                    fields: Vec::new(),
                    initiator: None,
                    collection_hits: hits,
                    remote: None,
                })?;
                deleted += 1;
            }
            Ok(deleted)
        })
    }

    // ── Link-list mutations ─────────────────────────────────────────────

    fn list_column<'a>(
        &self,
        desc: &'a lattice_core::TableDescriptor,
        column: &str,
    ) -> LatticeResult<&'a lattice_core::ColumnDescriptor> {
        let col = desc.column(column).ok_or_else(|| {
            LatticeError::schema_invalid(&desc.name, format!("unknown column '{column}'"))
        })?;
        if !col.kind.is_list() {
            return Err(LatticeError::schema_invalid(
                &desc.name,
                format!("column '{column}' is not a link list"),
            ));
        }
        Ok(col)
    }

    fn record_list_update(
        &self,
        conn: &Connection,
        desc: &lattice_core::TableDescriptor,
        col: &lattice_core::ColumnDescriptor,
        pk: i64,
        gid: GlobalId,
        initiator: Option<u64>,
    ) -> LatticeResult<()> {
        let snapshot = links::link_targets(conn, desc, col, gid)?;
        self.gate.record(PendingMutation {
            op: AuditOp::Update,
            table: desc.name.clone(),
            pk,
            global_id: gid,
            fields: vec![(col.name.clone(), Value::List(snapshot))],
            initiator,
            collection_hits: Vec::new(),
            remote: None,
        })
    }

    pub(crate) fn append_link(
        &self,
        table: &str,
        pk: i64,
        column: &str,
        target: GlobalId,
        initiator: Option<u64>,
    ) -> LatticeResult<()> {
        let desc = self.descriptor(table)?;
        let col = self.list_column(&desc, column)?;
        let target_table = col.kind.link_target().unwrap_or_default().to_string();
        self.with_write_scope(|conn| {
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            if rows::pk_for_global_id(conn, &target_table, target)?.is_none() {
                return Err(LatticeError::NotFound {
                    table: target_table.clone(),
                    key: target.to_string(),
                });
            }
            links::append_link(conn, &desc, col, gid, target)?;
            self.record_list_update(conn, &desc, col, pk, gid, initiator)
        })
    }

    pub(crate) fn remove_link_at(
        &self,
        table: &str,
        pk: i64,
        column: &str,
        index: usize,
        initiator: Option<u64>,
    ) -> LatticeResult<Option<GlobalId>> {
        let desc = self.descriptor(table)?;
        let col = self.list_column(&desc, column)?;
        self.with_write_scope(|conn| {
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            let removed = links::remove_link_at(conn, &desc, col, gid, index)?;
            if removed.is_some() {
                self.record_list_update(conn, &desc, col, pk, gid, initiator)?;
            }
            Ok(removed)
        })
    }

    pub(crate) fn link_at(
        &self,
        table: &str,
        pk: i64,
        column: &str,
        index: usize,
    ) -> LatticeResult<Option<GlobalId>> {
        let desc = self.descriptor(table)?;
        let col = self.list_column(&desc, column)?;
        self.read(|conn| {
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            links::link_at(conn, &desc, col, gid, index)
        })
    }

    pub(crate) fn link_count(&self, table: &str, pk: i64, column: &str) -> LatticeResult<usize> {
        let desc = self.descriptor(table)?;
        let col = self.list_column(&desc, column)?;
        self.read(|conn| {
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            links::link_count(conn, &desc, col, gid)
        })
    }

    pub(crate) fn find_link_index(
        &self,
        table: &str,
        pk: i64,
        column: &str,
        target: GlobalId,
    ) -> LatticeResult<Option<usize>> {
        let desc = self.descriptor(table)?;
        let col = self.list_column(&desc, column)?;
        self.read(|conn| {
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            links::find_link_index(conn, &desc, col, gid, target)
        })
    }

    pub(crate) fn find_link_indices_where(
        &self,
        table: &str,
        pk: i64,
        column: &str,
        pred_sql: &str,
        pred_params: Vec<rusqlite::types::Value>,
    ) -> LatticeResult<Vec<usize>> {
        let desc = self.descriptor(table)?;
        let col = self.list_column(&desc, column)?;
        self.read(|conn| {
            let gid = rows::row_global_id(conn, table, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            links::find_link_indices_where(conn, &desc, col, gid, pred_sql, pred_params)
        })
    }

    // ── Collection predicate evaluation ─────────────────────────────────

    /// Evaluate registered collection filters against a row at op time
    /// (post-insert or pre-delete), inside the open transaction.
    pub(crate) fn eval_collection_hits(
        &self,
        conn: &Connection,
        table: &str,
        pk: i64,
    ) -> LatticeResult<Vec<u64>> {
        let mut hits = Vec::new();
        for (id, eval) in self.bus.collection_filters(table) {
            match eval {
                None => hits.push(id),
                Some(EvalSql { sql, mut params }) => {
                    params.push(rusqlite::types::Value::Integer(pk));
                    let mut stmt = conn.prepare_cached(&sql)?;
                    if stmt.exists(rusqlite::params_from_iter(params))? {
                        hits.push(id);
                    }
                }
            }
        }
        Ok(hits)
    }
}
