//! Raw row I/O over `&Connection` + descriptor. The kernel facade wraps
//! these with transaction scoping, diff recording, and notification.

use rusqlite::{params, Connection};
use rustc_hash::FxHashMap;

use lattice_core::schema::{ColumnDescriptor, ColumnKind, TableDescriptor, UniqueConstraint};
use lattice_core::{GlobalId, LatticeError, LatticeResult, Value};

use crate::schema::ddl::{physical_columns, quote_ident};

/// A row's full field map (lists excluded; they live in link tables).
pub type FieldMap = FxHashMap<String, Value>;

fn select_column_list(desc: &TableDescriptor) -> String {
    let mut cols = Vec::new();
    for col in &desc.columns {
        for name in physical_columns(col) {
            cols.push(quote_ident(&name));
        }
    }
    cols.join(", ")
}

/// Decode one physical row (positional after `pk, global_id`) into a field
/// map keyed by logical column name.
fn decode_row(row: &rusqlite::Row<'_>, desc: &TableDescriptor) -> rusqlite::Result<FieldMap> {
    let mut fields = FieldMap::default();
    let mut idx = 2; // 0 = pk, 1 = global_id
    for col in &desc.columns {
        match &col.kind {
            ColumnKind::List { .. } => continue,
            ColumnKind::Geo => {
                let lat: Option<f64> = row.get(idx)?;
                let lon: Option<f64> = row.get(idx + 1)?;
                idx += 2;
                let value = match (lat, lon) {
                    (Some(lat), Some(lon)) => Value::Geo(lattice_core::GeoPoint::new(lat, lon)),
                    _ => Value::Null,
                };
                fields.insert(col.name.clone(), value);
            }
            kind => {
                let raw: rusqlite::types::Value = row.get(idx)?;
                idx += 1;
                let value = Value::from_sql_value(raw, kind).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        idx,
                        rusqlite::types::Type::Null,
                        Box::new(std::io::Error::other(e.to_string())),
                    )
                })?;
                fields.insert(col.name.clone(), value);
            }
        }
    }
    Ok(fields)
}

/// Read a full row. `None` when the primary key misses.
pub fn read_row(
    conn: &Connection,
    desc: &TableDescriptor,
    pk: i64,
) -> LatticeResult<Option<(GlobalId, FieldMap)>> {
    let sql = format!(
        "SELECT pk, global_id, {} FROM {} WHERE pk = ?1",
        select_column_list(desc),
        quote_ident(&desc.name)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![pk])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => {
            let gid: String = row.get(1)?;
            let fields = decode_row(row, desc)?;
            Ok(Some((GlobalId::parse(&gid)?, fields)))
        }
    }
}

/// Read one column of one row. `None` when the row misses.
pub fn read_column(
    conn: &Connection,
    desc: &TableDescriptor,
    pk: i64,
    column: &ColumnDescriptor,
) -> LatticeResult<Option<Value>> {
    match &column.kind {
        ColumnKind::List { .. } => {
            let gid = match row_global_id(conn, &desc.name, pk)? {
                Some(gid) => gid,
                None => return Ok(None),
            };
            let targets = super::links::link_targets(conn, desc, column, gid)?;
            Ok(Some(Value::List(targets)))
        }
        ColumnKind::Geo => {
            let lat_col = quote_ident(&format!("{}_lat", column.name));
            let lon_col = quote_ident(&format!("{}_lon", column.name));
            let sql = format!(
                "SELECT {lat_col}, {lon_col} FROM {} WHERE pk = ?1",
                quote_ident(&desc.name)
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params![pk])?;
            match rows.next()? {
                None => Ok(None),
                Some(row) => {
                    let lat: Option<f64> = row.get(0)?;
                    let lon: Option<f64> = row.get(1)?;
                    Ok(Some(match (lat, lon) {
                        (Some(lat), Some(lon)) => {
                            Value::Geo(lattice_core::GeoPoint::new(lat, lon))
                        }
                        _ => Value::Null,
                    }))
                }
            }
        }
        kind => {
            let sql = format!(
                "SELECT {} FROM {} WHERE pk = ?1",
                quote_ident(&column.name),
                quote_ident(&desc.name)
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params![pk])?;
            match rows.next()? {
                None => Ok(None),
                Some(row) => {
                    let raw: rusqlite::types::Value = row.get(0)?;
                    Ok(Some(Value::from_sql_value(raw, kind)?))
                }
            }
        }
    }
}

/// Resolve a row's global id from its primary key.
pub fn row_global_id(conn: &Connection, table: &str, pk: i64) -> LatticeResult<Option<GlobalId>> {
    let sql = format!(
        "SELECT global_id FROM {} WHERE pk = ?1",
        quote_ident(table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![pk])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => {
            let gid: String = row.get(0)?;
            Ok(Some(GlobalId::parse(&gid)?))
        }
    }
}

/// Resolve a primary key from a global id.
pub fn pk_for_global_id(
    conn: &Connection,
    table: &str,
    gid: GlobalId,
) -> LatticeResult<Option<i64>> {
    let sql = format!(
        "SELECT pk FROM {} WHERE global_id = ?1",
        quote_ident(table)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![gid.to_string()])?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => Ok(Some(row.get(0)?)),
    }
}

/// Find the row colliding with `fields` on a unique constraint, if any.
/// NULL-safe (`IS`) so nullable unique columns behave like SQL expects.
pub fn find_unique_collision(
    conn: &Connection,
    desc: &TableDescriptor,
    constraint: &UniqueConstraint,
    fields: &FieldMap,
) -> LatticeResult<Option<i64>> {
    let mut clauses = Vec::new();
    let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
    for name in &constraint.columns {
        let col = desc
            .column(name)
            .ok_or_else(|| LatticeError::schema_invalid(&desc.name, format!("unknown column '{name}'")))?;
        let value = fields.get(name).cloned().unwrap_or(Value::Null);
        match (&col.kind, &value) {
            (ColumnKind::Geo, _) | (ColumnKind::List { .. }, _) => {
                return Err(LatticeError::schema_invalid(
                    &desc.name,
                    format!("unique constraint on non-scalar column '{name}'"),
                ))
            }
            _ => {
                clauses.push(format!("{} IS ?{}", quote_ident(name), params_vec.len() + 1));
                params_vec.push(value.to_sql_value()?);
            }
        }
    }
    let sql = format!(
        "SELECT pk FROM {} WHERE {}",
        quote_ident(&desc.name),
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params_vec))?;
    match rows.next()? {
        None => Ok(None),
        Some(row) => Ok(Some(row.get(0)?)),
    }
}

/// Validate a value against a column's declared kind and nullability.
pub fn check_value(table: &str, col: &ColumnDescriptor, value: &Value) -> LatticeResult<()> {
    if value.is_null() {
        if col.nullable {
            return Ok(());
        }
        return Err(LatticeError::schema_invalid(
            table,
            format!("column '{}' is not nullable", col.name),
        ));
    }
    if !value.matches_kind(&col.kind) {
        return Err(LatticeError::schema_invalid(
            table,
            format!(
                "value of kind '{:?}' does not fit column '{}' ({:?})",
                value, col.name, col.kind
            ),
        ));
    }
    Ok(())
}

/// Insert the physical row (scalar columns only; lists are the caller's
/// job). Returns the allocated primary key.
pub fn insert_row_raw(
    conn: &Connection,
    desc: &TableDescriptor,
    gid: GlobalId,
    fields: &FieldMap,
) -> LatticeResult<i64> {
    let mut names = vec!["global_id".to_string()];
    let mut params_vec: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(gid.to_string())];
    for col in &desc.columns {
        let value = fields.get(&col.name).cloned().unwrap_or_else(|| col.effective_default());
        check_value(&desc.name, col, &value)?;
        match &col.kind {
            ColumnKind::List { .. } => continue,
            ColumnKind::Geo => {
                names.push(quote_ident(&format!("{}_lat", col.name)));
                names.push(quote_ident(&format!("{}_lon", col.name)));
                match value.as_geo() {
                    Some(p) => {
                        params_vec.push(rusqlite::types::Value::Real(p.lat));
                        params_vec.push(rusqlite::types::Value::Real(p.lon));
                    }
                    None => {
                        params_vec.push(rusqlite::types::Value::Null);
                        params_vec.push(rusqlite::types::Value::Null);
                    }
                }
            }
            _ => {
                names.push(quote_ident(&col.name));
                params_vec.push(value.to_sql_value()?);
            }
        }
    }
    let placeholders: Vec<String> = (1..=params_vec.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&desc.name),
        names.join(", "),
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(rusqlite::params_from_iter(params_vec))?;
    Ok(conn.last_insert_rowid())
}

/// Update scalar columns of one row in place.
pub fn update_columns(
    conn: &Connection,
    desc: &TableDescriptor,
    pk: i64,
    fields: &[(String, Value)],
) -> LatticeResult<()> {
    let mut sets = Vec::new();
    let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
    for (name, value) in fields {
        let col = desc
            .column(name)
            .ok_or_else(|| LatticeError::schema_invalid(&desc.name, format!("unknown column '{name}'")))?;
        check_value(&desc.name, col, value)?;
        match &col.kind {
            ColumnKind::List { .. } => continue,
            ColumnKind::Geo => {
                match value.as_geo() {
                    Some(p) => {
                        sets.push(format!(
                            "{} = ?{}",
                            quote_ident(&format!("{}_lat", name)),
                            params_vec.len() + 1
                        ));
                        params_vec.push(rusqlite::types::Value::Real(p.lat));
                        sets.push(format!(
                            "{} = ?{}",
                            quote_ident(&format!("{}_lon", name)),
                            params_vec.len() + 1
                        ));
                        params_vec.push(rusqlite::types::Value::Real(p.lon));
                    }
                    None => {
                        sets.push(format!("{} = NULL", quote_ident(&format!("{}_lat", name))));
                        sets.push(format!("{} = NULL", quote_ident(&format!("{}_lon", name))));
                    }
                }
            }
            _ => {
                sets.push(format!("{} = ?{}", quote_ident(name), params_vec.len() + 1));
                params_vec.push(value.to_sql_value()?);
            }
        }
    }
    if sets.is_empty() {
        return Ok(());
    }
    let pk_idx = params_vec.len() + 1;
    params_vec.push(rusqlite::types::Value::Integer(pk));
    let sql = format!(
        "UPDATE {} SET {} WHERE pk = ?{pk_idx}",
        quote_ident(&desc.name),
        sets.join(", ")
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let changed = stmt.execute(rusqlite::params_from_iter(params_vec))?;
    if changed == 0 {
        return Err(LatticeError::not_found(&desc.name, pk));
    }
    Ok(())
}

/// Delete the physical row. Returns whether it existed. Sidecar cleanup is
/// trigger-driven; link rows are the kernel's job.
pub fn delete_row_raw(conn: &Connection, desc: &TableDescriptor, pk: i64) -> LatticeResult<bool> {
    let sql = format!("DELETE FROM {} WHERE pk = ?1", quote_ident(&desc.name));
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(params![pk])? > 0)
}
