//! DDL synthesis: declared descriptors → physical tables, indices, link
//! tables, proximity sidecars, and the reserved metadata tables.
//!
//! Physical layout per table:
//! - `pk INTEGER PRIMARY KEY AUTOINCREMENT` — monotonic local key
//! - `global_id TEXT NOT NULL` + unique index — replica-stable id
//! - scalar columns as declared; geo columns split into `<col>_lat` /
//!   `<col>_lon`; vectors as f32 BLOBs; links as target global-id TEXT
//! - list columns live in `_<owner>_<target>_<column>(lhs, rhs, "order")`
//! - indexed geo columns mirror into `_rtree_<table>_<column>`; indexed
//!   text columns mirror into `_fts_<table>_<column>`, both trigger-synced

use rusqlite::Connection;

use lattice_core::schema::{ColumnDescriptor, ColumnKind, TableDescriptor};
use lattice_core::LatticeResult;

/// SQL for the reserved metadata tables.
pub const RESERVED_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _lattice_schema (
    "table" TEXT PRIMARY KEY,
    descriptor BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS _lattice_audit (
    sequenceId INTEGER PRIMARY KEY AUTOINCREMENT,
    globalId TEXT NOT NULL UNIQUE,
    "table" TEXT NOT NULL,
    op TEXT NOT NULL,
    rowId INTEGER NOT NULL,
    globalRowId TEXT NOT NULL,
    changedFields TEXT NOT NULL,
    changedFieldsNames TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    isFromRemote INTEGER NOT NULL DEFAULT 0,
    isSynchronized INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_lattice_audit_row ON _lattice_audit(globalRowId);
CREATE INDEX IF NOT EXISTS idx_lattice_audit_ts ON _lattice_audit(timestamp);
"#;

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Physical column names for one declared column. Geo columns split in
/// two; list columns have no physical column in the row table.
pub fn physical_columns(col: &ColumnDescriptor) -> Vec<String> {
    match &col.kind {
        ColumnKind::List { .. } => Vec::new(),
        ColumnKind::Geo => vec![format!("{}_lat", col.name), format!("{}_lon", col.name)],
        _ => vec![col.name.clone()],
    }
}

fn sql_type(kind: &ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Int => "INTEGER",
        ColumnKind::Real | ColumnKind::Geo => "REAL",
        ColumnKind::Text | ColumnKind::Link { .. } => "TEXT",
        ColumnKind::Blob | ColumnKind::Vector { .. } => "BLOB",
        ColumnKind::List { .. } => "",
    }
}

pub fn link_table_name(owner: &str, target: &str, column: &str) -> String {
    format!("_{owner}_{target}_{column}")
}

pub fn rtree_table_name(table: &str, column: &str) -> String {
    format!("_rtree_{table}_{column}")
}

pub fn fts_table_name(table: &str, column: &str) -> String {
    format!("_fts_{table}_{column}")
}

/// CREATE TABLE for a descriptor, with an overridable physical name so the
/// migration engine can build shadow tables from the same descriptor.
pub fn create_table_sql(desc: &TableDescriptor, physical_name: &str) -> String {
    let mut cols = vec![
        "pk INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "global_id TEXT NOT NULL".to_string(),
    ];
    for col in &desc.columns {
        for name in physical_columns(col) {
            let not_null = if col.nullable { "" } else { " NOT NULL" };
            cols.push(format!("{} {}{not_null}", quote_ident(&name), sql_type(&col.kind)));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote_ident(physical_name),
        cols.join(",\n    ")
    )
}

/// Secondary and constraint indices for a table.
pub fn index_sql(desc: &TableDescriptor) -> Vec<String> {
    let table = &desc.name;
    let mut out = vec![format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}(global_id)",
        quote_ident(&format!("idx_{table}_global_id")),
        quote_ident(table)
    )];
    for col in &desc.columns {
        if !col.indexed {
            continue;
        }
        // Geo and text proximity indices are sidecars; text additionally
        // keeps a B-tree index for plain comparisons.
        match &col.kind {
            ColumnKind::Geo | ColumnKind::Vector { .. } | ColumnKind::List { .. } => continue,
            _ => {}
        }
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(&format!("idx_{table}_{}", col.name)),
            quote_ident(table),
            quote_ident(&col.name)
        ));
    }
    for constraint in &desc.constraints {
        let cols: Vec<String> = constraint.columns.iter().map(|c| quote_ident(c)).collect();
        out.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(&format!("uq_{table}_{}", constraint.columns.join("_"))),
            quote_ident(table),
            cols.join(", ")
        ));
    }
    out
}

/// Link tables for list columns, keyed by parent/child global ids,
/// preserving insertion order.
pub fn link_table_sql(desc: &TableDescriptor) -> Vec<String> {
    let mut out = Vec::new();
    for col in &desc.columns {
        if let ColumnKind::List { target } = &col.kind {
            let name = link_table_name(&desc.name, target, &col.name);
            out.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (\n    lhs TEXT NOT NULL,\n    rhs TEXT NOT NULL,\n    \"order\" INTEGER NOT NULL\n)",
                quote_ident(&name)
            ));
            out.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}(lhs, \"order\")",
                quote_ident(&format!("idx_{name}_lhs")),
                quote_ident(&name)
            ));
        }
    }
    out
}

/// Proximity sidecars and their sync triggers for indexed geo/text columns.
pub fn sidecar_sql(desc: &TableDescriptor) -> Vec<String> {
    let table = &desc.name;
    let qt = quote_ident(table);
    let mut out = Vec::new();
    for col in &desc.columns {
        if !col.indexed {
            continue;
        }
        match &col.kind {
            ColumnKind::Geo => {
                let rtree = rtree_table_name(table, &col.name);
                let qr = quote_ident(&rtree);
                let lat = quote_ident(&format!("{}_lat", col.name));
                let lon = quote_ident(&format!("{}_lon", col.name));
                out.push(format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS {qr} USING rtree(id, min_lat, max_lat, min_lon, max_lon)"
                ));
                out.push(format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER INSERT ON {qt} BEGIN \
                     INSERT INTO {qr}(id, min_lat, max_lat, min_lon, max_lon) \
                     SELECT new.pk, new.{lat}, new.{lat}, new.{lon}, new.{lon} \
                     WHERE new.{lat} IS NOT NULL; END",
                    quote_ident(&format!("{rtree}_ai"))
                ));
                out.push(format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER UPDATE OF {lat}, {lon} ON {qt} BEGIN \
                     DELETE FROM {qr} WHERE id = new.pk; \
                     INSERT INTO {qr}(id, min_lat, max_lat, min_lon, max_lon) \
                     SELECT new.pk, new.{lat}, new.{lat}, new.{lon}, new.{lon} \
                     WHERE new.{lat} IS NOT NULL; END",
                    quote_ident(&format!("{rtree}_au"))
                ));
                out.push(format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER DELETE ON {qt} BEGIN \
                     DELETE FROM {qr} WHERE id = old.pk; END",
                    quote_ident(&format!("{rtree}_ad"))
                ));
            }
            ColumnKind::Text => {
                let fts = fts_table_name(table, &col.name);
                let qf = quote_ident(&fts);
                let qc = quote_ident(&col.name);
                out.push(format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS {qf} USING fts5(content)"
                ));
                out.push(format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER INSERT ON {qt} BEGIN \
                     INSERT INTO {qf}(rowid, content) VALUES (new.pk, coalesce(new.{qc}, '')); END",
                    quote_ident(&format!("{fts}_ai"))
                ));
                out.push(format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER UPDATE OF {qc} ON {qt} BEGIN \
                     UPDATE {qf} SET content = coalesce(new.{qc}, '') WHERE rowid = new.pk; END",
                    quote_ident(&format!("{fts}_au"))
                ));
                out.push(format!(
                    "CREATE TRIGGER IF NOT EXISTS {} AFTER DELETE ON {qt} BEGIN \
                     DELETE FROM {qf} WHERE rowid = old.pk; END",
                    quote_ident(&format!("{fts}_ad"))
                ));
            }
            _ => {}
        }
    }
    out
}

/// Repopulate sidecars from existing rows. Triggers only cover new
/// mutations, so the migration engine runs this after a rebuild.
pub fn sidecar_backfill_sql(desc: &TableDescriptor) -> Vec<String> {
    let table = &desc.name;
    let qt = quote_ident(table);
    let mut out = Vec::new();
    for col in &desc.columns {
        if !col.indexed {
            continue;
        }
        match &col.kind {
            ColumnKind::Geo => {
                let qr = quote_ident(&rtree_table_name(table, &col.name));
                let lat = quote_ident(&format!("{}_lat", col.name));
                let lon = quote_ident(&format!("{}_lon", col.name));
                out.push(format!(
                    "INSERT INTO {qr}(id, min_lat, max_lat, min_lon, max_lon) \
                     SELECT pk, {lat}, {lat}, {lon}, {lon} FROM {qt} WHERE {lat} IS NOT NULL"
                ));
            }
            ColumnKind::Text => {
                let qf = quote_ident(&fts_table_name(table, &col.name));
                let qc = quote_ident(&col.name);
                out.push(format!(
                    "INSERT INTO {qf}(rowid, content) SELECT pk, coalesce({qc}, '') FROM {qt}"
                ));
            }
            _ => {}
        }
    }
    out
}

/// Apply the full DDL for one table: main table, indices, link tables,
/// sidecars, triggers.
pub fn apply_table_ddl(conn: &Connection, desc: &TableDescriptor) -> LatticeResult<()> {
    conn.execute_batch(&create_table_sql(desc, &desc.name))?;
    for sql in index_sql(desc)
        .into_iter()
        .chain(link_table_sql(desc))
        .chain(sidecar_sql(desc))
    {
        conn.execute_batch(&sql)?;
    }
    Ok(())
}

/// Drop a table together with its link tables and sidecars. Triggers drop
/// with the main table.
pub fn drop_table_ddl(conn: &Connection, desc: &TableDescriptor) -> LatticeResult<()> {
    for col in &desc.columns {
        match &col.kind {
            ColumnKind::List { target } => {
                let name = link_table_name(&desc.name, target, &col.name);
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
            }
            ColumnKind::Geo if col.indexed => {
                let name = rtree_table_name(&desc.name, &col.name);
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
            }
            ColumnKind::Text if col.indexed => {
                let name = fts_table_name(&desc.name, &col.name);
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
            }
            _ => {}
        }
    }
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&desc.name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::schema::UniqueConstraint;

    fn place() -> TableDescriptor {
        TableDescriptor::new(
            "Place",
            vec![
                ColumnDescriptor::text("name").indexed(),
                ColumnDescriptor::geo("location").nullable().indexed(),
                ColumnDescriptor::vector("embedding", 3).nullable().indexed(),
                ColumnDescriptor::list("tags", "Tag"),
            ],
        )
        .with_constraint(UniqueConstraint::on("name").upsert())
    }

    fn tag() -> TableDescriptor {
        TableDescriptor::new("Tag", vec![ColumnDescriptor::text("label")])
    }

    #[test]
    fn full_ddl_applies_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(RESERVED_TABLES_SQL).unwrap();
        apply_table_ddl(&conn, &tag()).unwrap();
        apply_table_ddl(&conn, &place()).unwrap();

        for table in [
            "Place",
            "Tag",
            "_Place_Tag_tags",
            "_rtree_Place_location",
            "_fts_Place_name",
            "_lattice_schema",
            "_lattice_audit",
        ] {
            let exists: bool = conn
                .prepare("SELECT 1 FROM sqlite_master WHERE name = ?1")
                .unwrap()
                .exists([table])
                .unwrap();
            assert!(exists, "expected {table} to exist");
        }
    }

    #[test]
    fn triggers_sync_fts_and_rtree() {
        let conn = Connection::open_in_memory().unwrap();
        apply_table_ddl(&conn, &tag()).unwrap();
        apply_table_ddl(&conn, &place()).unwrap();

        conn.execute(
            "INSERT INTO \"Place\" (global_id, \"name\", \"location_lat\", \"location_lon\", \"embedding\")
             VALUES ('gid-1', 'Blue Bottle coffee', 37.77, -122.42, NULL)",
            [],
        )
        .unwrap();

        let fts_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM \"_fts_Place_name\" WHERE \"_fts_Place_name\" MATCH 'coffee'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(fts_hits, 1);

        let rtree_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"_rtree_Place_location\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rtree_rows, 1);

        conn.execute("DELETE FROM \"Place\"", []).unwrap();
        let rtree_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM \"_rtree_Place_location\"", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rtree_rows, 0);
    }

    #[test]
    fn drop_removes_sidecars() {
        let conn = Connection::open_in_memory().unwrap();
        apply_table_ddl(&conn, &tag()).unwrap();
        apply_table_ddl(&conn, &place()).unwrap();
        drop_table_ddl(&conn, &place()).unwrap();

        let exists: bool = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE name = '_rtree_Place_location'")
            .unwrap()
            .exists([])
            .unwrap();
        assert!(!exists);
    }
}
