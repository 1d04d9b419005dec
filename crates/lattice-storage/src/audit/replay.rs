//! Remote replay: the sync collaborator's entry points into the core.
//!
//! `apply_remote` decodes a server-sent payload and applies each audit
//! entry in its own transaction with `is_from_remote` set. Replay is
//! idempotent on the entry's global id; conflicting fields resolve by
//! last-write-wins on timestamp with a global-id tie-break.

use rusqlite::Connection;
use tracing::{debug, warn};

use lattice_core::audit::{AuditEntry, AuditOp, SyncPayload};
use lattice_core::schema::{ColumnDescriptor, ColumnKind, TableDescriptor};
use lattice_core::{GlobalId, LatticeResult, Value};

use crate::kernel::links;
use crate::kernel::rows::{self, FieldMap};
use crate::kernel::transaction::PendingMutation;
use crate::kernel::{RemoteStamp, StorageKernel};

use super::log as audit_log;

/// Apply a decoded sync payload. Returns the acknowledged entry ids.
pub(crate) fn apply_remote(
    kernel: &StorageKernel,
    bytes: &[u8],
) -> LatticeResult<Vec<GlobalId>> {
    match SyncPayload::decode(bytes)? {
        SyncPayload::Ack { ids } => {
            kernel.with_write_scope(|conn| {
                let updated = audit_log::mark_synchronized(conn, &ids)?;
                debug!(acknowledged = updated, "marked audit entries synchronized");
                Ok(())
            })?;
            Ok(ids)
        }
        SyncPayload::AuditLog { entries } => {
            let mut acked = Vec::with_capacity(entries.len());
            for entry in &entries {
                apply_entry(kernel, entry)?;
                acked.push(entry.global_id);
            }
            Ok(acked)
        }
    }
}

/// Decode a wire field value for its column: link lists travel as JSON
/// strings of target ids.
fn decode_field(col: &ColumnDescriptor, value: &Value) -> LatticeResult<Value> {
    match (&col.kind, value) {
        (ColumnKind::List { .. }, Value::Text(json)) => {
            let raw: Vec<String> = serde_json::from_str(json)?;
            let mut ids = Vec::with_capacity(raw.len());
            for s in &raw {
                ids.push(GlobalId::parse(s)?);
            }
            Ok(Value::List(ids))
        }
        _ => Ok(value.clone()),
    }
}

/// Last-write-wins per field: the remote entry wins when no local mutation
/// touched the field, or when `(timestamp, globalId)` orders it later.
fn remote_wins_field(
    conn: &Connection,
    row_gid: GlobalId,
    field: &str,
    entry: &AuditEntry,
) -> LatticeResult<bool> {
    Ok(match audit_log::latest_field_stamp(conn, row_gid, field)? {
        None => true,
        Some((ts, gid)) => (entry.timestamp, entry.global_id.as_u128()) > (ts, gid.as_u128()),
    })
}

fn apply_entry(kernel: &StorageKernel, entry: &AuditEntry) -> LatticeResult<()> {
    let Ok(desc) = kernel.registry.descriptor(&entry.table) else {
        warn!(table = %entry.table, "remote entry for unknown table, skipping");
        return Ok(());
    };
    let stamp = RemoteStamp {
        entry_global_id: entry.global_id,
        timestamp: entry.timestamp,
    };

    kernel.with_write_scope(|conn| {
        // Idempotence: an already-recorded entry is a no-op.
        if audit_log::entry_exists(conn, entry.global_id)? {
            return Ok(());
        }
        match entry.op {
            AuditOp::Insert => {
                match rows::pk_for_global_id(conn, &entry.table, entry.global_row_id)? {
                    None => apply_insert(kernel, conn, &desc, entry, stamp),
                    // The row already exists on this replica; fall back to
                    // per-field resolution.
                    Some(pk) => apply_update(kernel, conn, &desc, entry, pk, stamp),
                }
            }
            AuditOp::Update => {
                match rows::pk_for_global_id(conn, &entry.table, entry.global_row_id)? {
                    Some(pk) => apply_update(kernel, conn, &desc, entry, pk, stamp),
                    None => {
                        // Deleted locally; the deletion stands.
                        debug!(table = %entry.table, "remote update for deleted row, skipping");
                        Ok(())
                    }
                }
            }
            AuditOp::Delete => {
                match rows::pk_for_global_id(conn, &entry.table, entry.global_row_id)? {
                    None => Ok(()),
                    Some(pk) => {
                        let wins = match audit_log::latest_row_stamp(conn, entry.global_row_id)? {
                            None => true,
                            Some((ts, gid)) => {
                                (entry.timestamp, entry.global_id.as_u128())
                                    > (ts, gid.as_u128())
                            }
                        };
                        if !wins {
                            debug!(table = %entry.table, "local changes outrank remote delete");
                            return Ok(());
                        }
                        let hits = kernel.eval_collection_hits(conn, &entry.table, pk)?;
                        links::clear_all_links(conn, &desc, entry.global_row_id)?;
                        rows::delete_row_raw(conn, &desc, pk)?;
                        kernel.gate.record(PendingMutation {
                            op: AuditOp::Delete,
                            table: entry.table.clone(),
                            pk,
                            global_id: entry.global_row_id,
                            fields: Vec::new(),
                            initiator: None,
                            collection_hits: hits,
                            remote: Some(stamp),
                        })
                    }
                }
            }
        }
    })
}

fn apply_insert(
    kernel: &StorageKernel,
    conn: &Connection,
    desc: &TableDescriptor,
    entry: &AuditEntry,
    stamp: RemoteStamp,
) -> LatticeResult<()> {
    let mut fields = FieldMap::default();
    let mut audited = Vec::new();
    for name in &entry.changed_field_names {
        let (Some(col), Some(value)) = (desc.column(name), entry.changed_fields.get(name)) else {
            continue;
        };
        let value = decode_field(col, value)?;
        audited.push((name.clone(), value.clone()));
        fields.insert(name.clone(), value);
    }
    let pk = rows::insert_row_raw(conn, desc, entry.global_row_id, &fields)?;
    for col in &desc.columns {
        if col.kind.is_list() {
            if let Some(Value::List(targets)) = fields.get(&col.name) {
                links::replace_links(conn, desc, col, entry.global_row_id, targets)?;
            }
        }
    }
    let hits = kernel.eval_collection_hits(conn, &entry.table, pk)?;
    kernel.gate.record(PendingMutation {
        op: AuditOp::Insert,
        table: entry.table.clone(),
        pk,
        global_id: entry.global_row_id,
        fields: audited,
        initiator: None,
        collection_hits: hits,
        remote: Some(stamp),
    })
}

fn apply_update(
    kernel: &StorageKernel,
    conn: &Connection,
    desc: &TableDescriptor,
    entry: &AuditEntry,
    pk: i64,
    stamp: RemoteStamp,
) -> LatticeResult<()> {
    let mut scalar_updates = Vec::new();
    let mut applied = Vec::new();
    for name in &entry.changed_field_names {
        let (Some(col), Some(value)) = (desc.column(name), entry.changed_fields.get(name)) else {
            continue;
        };
        if !remote_wins_field(conn, entry.global_row_id, name, entry)? {
            continue;
        }
        let value = decode_field(col, value)?;
        if col.kind.is_list() {
            if let Value::List(targets) = &value {
                links::replace_links(conn, desc, col, entry.global_row_id, targets)?;
            }
        } else {
            scalar_updates.push((name.clone(), value.clone()));
        }
        applied.push((name.clone(), value));
    }
    if !scalar_updates.is_empty() {
        rows::update_columns(conn, desc, pk, &scalar_updates)?;
    }
    if applied.is_empty() {
        debug!(table = %entry.table, "remote update fully outranked by local writes");
        return Ok(());
    }
    kernel.gate.record(PendingMutation {
        op: AuditOp::Update,
        table: entry.table.clone(),
        pk,
        global_id: entry.global_row_id,
        fields: applied,
        initiator: None,
        collection_hits: Vec::new(),
        remote: Some(stamp),
    })
}
