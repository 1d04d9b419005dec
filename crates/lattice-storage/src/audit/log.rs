//! Raw SQL operations for the `_lattice_audit` table.
//!
//! Entries are appended inside the data transaction so audit durability
//! equals data durability; sequence ids come from the autoincrement key.

use rusqlite::{params, Connection};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use lattice_core::audit::{AuditEntry, AuditOp};
use lattice_core::{GlobalId, LatticeResult, Value};

/// Current time in ms since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn encode_changed_fields(entry: &AuditEntry) -> (String, String) {
    let fields: serde_json::Map<String, serde_json::Value> = entry
        .changed_field_names
        .iter()
        .filter_map(|name| {
            entry
                .changed_fields
                .get(name)
                .map(|v| (name.clone(), v.to_tagged_json()))
        })
        .collect();
    let names: Vec<&String> = entry.changed_field_names.iter().collect();
    (
        serde_json::Value::Object(fields).to_string(),
        serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string()),
    )
}

/// Append one entry, filling in its assigned sequence id.
pub fn append_entry(conn: &Connection, entry: &mut AuditEntry) -> LatticeResult<()> {
    let (changed_fields, changed_names) = encode_changed_fields(entry);
    let mut stmt = conn.prepare_cached(
        "INSERT INTO _lattice_audit
            (globalId, \"table\", op, rowId, globalRowId, changedFields,
             changedFieldsNames, timestamp, isFromRemote, isSynchronized)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    stmt.execute(params![
        entry.global_id.to_string(),
        entry.table,
        entry.op.as_str(),
        entry.row_id,
        entry.global_row_id.to_string(),
        changed_fields,
        changed_names,
        entry.timestamp,
        entry.is_from_remote as i32,
        entry.is_synchronized as i32,
    ])?;
    entry.sequence_id = conn.last_insert_rowid() as u64;
    Ok(())
}

fn decode_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAuditRow> {
    Ok(RawAuditRow {
        sequence_id: row.get(0)?,
        global_id: row.get(1)?,
        table: row.get(2)?,
        op: row.get(3)?,
        row_id: row.get(4)?,
        global_row_id: row.get(5)?,
        changed_fields: row.get(6)?,
        changed_field_names: row.get(7)?,
        timestamp: row.get(8)?,
        is_from_remote: row.get::<_, i64>(9)? != 0,
        is_synchronized: row.get::<_, i64>(10)? != 0,
    })
}

struct RawAuditRow {
    sequence_id: i64,
    global_id: String,
    table: String,
    op: String,
    row_id: i64,
    global_row_id: String,
    changed_fields: String,
    changed_field_names: String,
    timestamp: i64,
    is_from_remote: bool,
    is_synchronized: bool,
}

impl RawAuditRow {
    fn into_entry(self) -> LatticeResult<AuditEntry> {
        let fields_json: serde_json::Value = serde_json::from_str(&self.changed_fields)?;
        let mut changed_fields = FxHashMap::default();
        if let Some(map) = fields_json.as_object() {
            for (name, tagged) in map {
                changed_fields.insert(name.clone(), Value::from_tagged_json(tagged)?);
            }
        }
        let names: Vec<String> = serde_json::from_str(&self.changed_field_names)?;
        Ok(AuditEntry {
            sequence_id: self.sequence_id as u64,
            global_id: GlobalId::parse(&self.global_id)?,
            table: self.table,
            op: AuditOp::parse(&self.op)?,
            row_id: self.row_id,
            global_row_id: GlobalId::parse(&self.global_row_id)?,
            changed_fields,
            changed_field_names: SmallVec::from_vec(names),
            timestamp: self.timestamp,
            is_from_remote: self.is_from_remote,
            is_synchronized: self.is_synchronized,
        })
    }
}

const SELECT_COLUMNS: &str = "sequenceId, globalId, \"table\", op, rowId, globalRowId, \
     changedFields, changedFieldsNames, timestamp, isFromRemote, isSynchronized";

/// Whether an entry with this global id already exists (replay idempotence).
pub fn entry_exists(conn: &Connection, gid: GlobalId) -> LatticeResult<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM _lattice_audit WHERE globalId = ?1")?;
    Ok(stmt.exists(params![gid.to_string()])?)
}

/// Resolve an entry's sequence id from its global id.
pub fn sequence_for(conn: &Connection, gid: GlobalId) -> LatticeResult<Option<u64>> {
    let mut stmt =
        conn.prepare_cached("SELECT sequenceId FROM _lattice_audit WHERE globalId = ?1")?;
    let mut rows = stmt.query(params![gid.to_string()])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => {
            let seq: i64 = row.get(0)?;
            Ok(Some(seq as u64))
        }
    }
}

/// Entries strictly after a sequence id, in sequence order.
pub fn entries_after(conn: &Connection, after: u64) -> LatticeResult<Vec<AuditEntry>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM _lattice_audit WHERE sequenceId > ?1 ORDER BY sequenceId"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let raw = stmt.query_map(params![after as i64], decode_entry)?;
    let mut out = Vec::new();
    for row in raw {
        out.push(row?.into_entry()?);
    }
    Ok(out)
}

/// Total entry count.
pub fn count(conn: &Connection) -> LatticeResult<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM _lattice_audit", [], |row| row.get(0))?;
    Ok(n as u64)
}

/// Flip `isSynchronized` for acknowledged entries. Returns how many rows
/// were updated.
pub fn mark_synchronized(conn: &Connection, ids: &[GlobalId]) -> LatticeResult<usize> {
    let mut stmt = conn
        .prepare_cached("UPDATE _lattice_audit SET isSynchronized = 1 WHERE globalId = ?1")?;
    let mut updated = 0;
    for id in ids {
        updated += stmt.execute(params![id.to_string()])?;
    }
    Ok(updated)
}

/// Timestamp and entry global id of the latest local mutation touching
/// `field` on a row, for last-write-wins resolution.
pub fn latest_field_stamp(
    conn: &Connection,
    global_row_id: GlobalId,
    field: &str,
) -> LatticeResult<Option<(i64, GlobalId)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT timestamp, globalId FROM _lattice_audit
         WHERE globalRowId = ?1 AND changedFieldsNames LIKE ?2
         ORDER BY sequenceId DESC LIMIT 1",
    )?;
    let needle = format!("%\"{field}\"%");
    let mut rows = stmt.query(params![global_row_id.to_string(), needle])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => {
            let ts: i64 = row.get(0)?;
            let gid: String = row.get(1)?;
            Ok(Some((ts, GlobalId::parse(&gid)?)))
        }
    }
}

/// Timestamp and entry global id of the latest local mutation of a row.
pub fn latest_row_stamp(
    conn: &Connection,
    global_row_id: GlobalId,
) -> LatticeResult<Option<(i64, GlobalId)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT timestamp, globalId FROM _lattice_audit
         WHERE globalRowId = ?1 ORDER BY sequenceId DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(params![global_row_id.to_string()])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => {
            let ts: i64 = row.get(0)?;
            let gid: String = row.get(1)?;
            Ok(Some((ts, GlobalId::parse(&gid)?)))
        }
    }
}
