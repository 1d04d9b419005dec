//! Link-list operations over the per-column link tables.
//!
//! Rows are keyed by parent/child global ids; `"order"` is a monotonically
//! growing insertion counter, never renumbered, so positions survive
//! removals and reopen.

use rusqlite::{params, Connection};
use rustc_hash::FxHashSet;

use lattice_core::schema::{ColumnDescriptor, ColumnKind, TableDescriptor};
use lattice_core::{GlobalId, LatticeError, LatticeResult};

use crate::schema::ddl::{link_table_name, quote_ident};

fn table_for(desc: &TableDescriptor, col: &ColumnDescriptor) -> LatticeResult<String> {
    match &col.kind {
        ColumnKind::List { target } => Ok(link_table_name(&desc.name, target, &col.name)),
        _ => Err(LatticeError::schema_invalid(
            &desc.name,
            format!("column '{}' is not a link list", col.name),
        )),
    }
}

/// Ordered target ids of one row's link list.
pub fn link_targets(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
) -> LatticeResult<Vec<GlobalId>> {
    let table = table_for(desc, col)?;
    let sql = format!(
        "SELECT rhs FROM {} WHERE lhs = ?1 ORDER BY \"order\"",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![owner.to_string()], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(GlobalId::parse(&row?)?);
    }
    Ok(out)
}

/// Append a target to the end of the list.
pub fn append_link(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
    target: GlobalId,
) -> LatticeResult<()> {
    let table = table_for(desc, col)?;
    let sql = format!(
        "INSERT INTO {} (lhs, rhs, \"order\")
         SELECT ?1, ?2, COALESCE(MAX(\"order\"), -1) + 1 FROM {} WHERE lhs = ?1",
        quote_ident(&table),
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params![owner.to_string(), target.to_string()])?;
    Ok(())
}

/// Remove the element at a position. Returns the removed target, or `None`
/// when the index is out of bounds.
pub fn remove_link_at(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
    index: usize,
) -> LatticeResult<Option<GlobalId>> {
    let table = table_for(desc, col)?;
    let sql = format!(
        "SELECT rhs, \"order\" FROM {} WHERE lhs = ?1 ORDER BY \"order\" LIMIT 1 OFFSET ?2",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let hit: Option<(String, i64)> = stmt
        .query_row(params![owner.to_string(), index as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some((rhs, order)) = hit else {
        return Ok(None);
    };
    let delete_sql = format!(
        "DELETE FROM {} WHERE lhs = ?1 AND \"order\" = ?2",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&delete_sql)?;
    stmt.execute(params![owner.to_string(), order])?;
    Ok(Some(GlobalId::parse(&rhs)?))
}

/// Target at a position.
pub fn link_at(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
    index: usize,
) -> LatticeResult<Option<GlobalId>> {
    let table = table_for(desc, col)?;
    let sql = format!(
        "SELECT rhs FROM {} WHERE lhs = ?1 ORDER BY \"order\" LIMIT 1 OFFSET ?2",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let hit: Option<String> = stmt
        .query_row(params![owner.to_string(), index as i64], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    hit.map(|s| GlobalId::parse(&s)).transpose()
}

/// Number of elements in the list.
pub fn link_count(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
) -> LatticeResult<usize> {
    let table = table_for(desc, col)?;
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE lhs = ?1",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let count: i64 = stmt.query_row(params![owner.to_string()], |row| row.get(0))?;
    Ok(count as usize)
}

/// Position of the first occurrence of `target`, if present.
pub fn find_link_index(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
    target: GlobalId,
) -> LatticeResult<Option<usize>> {
    let targets = link_targets(conn, desc, col, owner)?;
    Ok(targets.iter().position(|t| *t == target))
}

/// Positions of all elements whose target row matches a pre-lowered
/// predicate against the target table. `pred_sql` references the target
/// table aliased as `t`.
pub fn find_link_indices_where(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
    pred_sql: &str,
    pred_params: Vec<rusqlite::types::Value>,
) -> LatticeResult<Vec<usize>> {
    let target = col.kind.link_target().ok_or_else(|| {
        LatticeError::schema_invalid(&desc.name, format!("column '{}' is not a link list", col.name))
    })?;
    let sql = format!(
        "SELECT t.global_id FROM {} t WHERE {pred_sql}",
        quote_ident(target)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(pred_params), |row| {
        row.get::<_, String>(0)
    })?;
    let mut matching: FxHashSet<String> = FxHashSet::default();
    for row in rows {
        matching.insert(row?);
    }
    let targets = link_targets(conn, desc, col, owner)?;
    Ok(targets
        .iter()
        .enumerate()
        .filter(|(_, t)| matching.contains(&t.to_string()))
        .map(|(i, _)| i)
        .collect())
}

/// Replace the whole list (used by upsert, remote replay, and
/// `set` on a list column).
pub fn replace_links(
    conn: &Connection,
    desc: &TableDescriptor,
    col: &ColumnDescriptor,
    owner: GlobalId,
    targets: &[GlobalId],
) -> LatticeResult<()> {
    let table = table_for(desc, col)?;
    let clear_sql = format!("DELETE FROM {} WHERE lhs = ?1", quote_ident(&table));
    let mut stmt = conn.prepare_cached(&clear_sql)?;
    stmt.execute(params![owner.to_string()])?;
    let insert_sql = format!(
        "INSERT INTO {} (lhs, rhs, \"order\") VALUES (?1, ?2, ?3)",
        quote_ident(&table)
    );
    let mut stmt = conn.prepare_cached(&insert_sql)?;
    for (i, target) in targets.iter().enumerate() {
        stmt.execute(params![owner.to_string(), target.to_string(), i as i64])?;
    }
    Ok(())
}

/// Drop every list row owned by a deleted row.
pub fn clear_all_links(
    conn: &Connection,
    desc: &TableDescriptor,
    owner: GlobalId,
) -> LatticeResult<()> {
    for col in &desc.columns {
        if col.kind.is_list() {
            let table = table_for(desc, col)?;
            let sql = format!("DELETE FROM {} WHERE lhs = ?1", quote_ident(&table));
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(params![owner.to_string()])?;
        }
    }
    Ok(())
}
