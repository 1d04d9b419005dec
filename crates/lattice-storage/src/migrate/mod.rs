//! Migration engine: diffs old and new schemas, rewrites changed tables
//! through shadow copies, and invokes user-supplied row transforms inside
//! one logical migration transaction. Any failure rolls the whole
//! migration back.

use rusqlite::Connection;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use lattice_core::schema::diff::{ColumnChange, SchemaDiff};
use lattice_core::schema::{ColumnKind, TableDescriptor};
use lattice_core::{GlobalId, LatticeError, LatticeResult, Value};

use crate::kernel::links;
use crate::kernel::rows::{self, FieldMap};
use crate::schema::ddl;
use crate::schema::registry::{persist_descriptor, remove_descriptor};

/// Read-only view of a row under the old schema.
pub struct OldRow {
    global_id: GlobalId,
    fields: FieldMap,
    links: FxHashMap<String, Vec<GlobalId>>,
}

impl OldRow {
    pub fn global_id(&self) -> GlobalId {
        self.global_id
    }

    /// Old field value; `Null` when the column did not exist.
    pub fn get(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn link_targets(&self, name: &str) -> &[GlobalId] {
        self.links.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Write view of the row being built under the new schema, seeded with
/// same-named type-compatible columns before the transform runs.
pub struct NewRow<'a> {
    desc: &'a TableDescriptor,
    fields: FieldMap,
    links: FxHashMap<String, Vec<GlobalId>>,
}

impl NewRow<'_> {
    pub fn get(&self, name: &str) -> Value {
        self.fields.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Set a field, validated against the new descriptor.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> LatticeResult<()> {
        let value = value.into();
        let col = self.desc.column(name).ok_or_else(|| {
            LatticeError::schema_invalid(&self.desc.name, format!("unknown column '{name}'"))
        })?;
        if let ColumnKind::List { .. } = col.kind {
            match value {
                Value::List(targets) => {
                    self.links.insert(name.to_string(), targets);
                    return Ok(());
                }
                other => {
                    return Err(LatticeError::schema_invalid(
                        &self.desc.name,
                        format!("column '{name}' takes a link list, got {other:?}"),
                    ))
                }
            }
        }
        rows::check_value(&self.desc.name, col, &value)?;
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_link_targets(&mut self, name: &str, targets: Vec<GlobalId>) {
        self.links.insert(name.to_string(), targets);
    }
}

type TransformFn = Box<dyn Fn(&OldRow, &mut NewRow<'_>) -> LatticeResult<()> + Send + Sync>;

/// User-supplied plan for a non-additive migration: per-table row
/// transforms, column renames, and table wipes.
#[derive(Default)]
pub struct MigrationPlan {
    transforms: FxHashMap<String, TransformFn>,
    renames: Vec<(String, String, String)>,
    wipes: FxHashSet<String>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-table transform, invoked once per migrating row after the
    /// compatible-column seed.
    pub fn with_transform(
        mut self,
        table: impl Into<String>,
        f: impl Fn(&OldRow, &mut NewRow<'_>) -> LatticeResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.transforms.insert(table.into(), Box::new(f));
        self
    }

    /// Seed a new column from a differently named old column.
    pub fn rename_column(
        mut self,
        table: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        self.renames.push((table.into(), old.into(), new.into()));
        self
    }

    /// Drop every row of a table during the migration instead of copying.
    pub fn delete_all(mut self, table: impl Into<String>) -> Self {
        self.wipes.insert(table.into());
        self
    }

    fn rename_source<'a>(&'a self, table: &str, new_col: &str) -> Option<&'a str> {
        self.renames
            .iter()
            .find(|(t, _, n)| t == table && n == new_col)
            .map(|(_, old, _)| old.as_str())
    }
}

fn compatible(from: &ColumnKind, to: &ColumnKind) -> bool {
    from == to || matches!((from, to), (ColumnKind::Int, ColumnKind::Real))
}

fn migration_failed(table: &str, e: LatticeError) -> LatticeError {
    match e {
        already @ LatticeError::MigrationFailed { .. } => already,
        other => LatticeError::MigrationFailed {
            table: table.to_string(),
            message: other.to_string(),
        },
    }
}

/// Run the migration for a computed diff. Caller has already rejected
/// destructive diffs without a plan.
pub fn run_migration(
    conn: &Connection,
    persisted: &[TableDescriptor],
    declared: &[TableDescriptor],
    diff: &SchemaDiff,
    plan: Option<&MigrationPlan>,
) -> LatticeResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match apply(conn, persisted, declared, diff, plan) {
        Ok(()) => {
            let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
            conn.pragma_update(None, "user_version", version + 1)?;
            conn.execute_batch("COMMIT")?;
            info!("migration committed, schema version {}", version + 1);
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn apply(
    conn: &Connection,
    persisted: &[TableDescriptor],
    declared: &[TableDescriptor],
    diff: &SchemaDiff,
    plan: Option<&MigrationPlan>,
) -> LatticeResult<()> {
    for name in &diff.new_tables {
        let desc = declared
            .iter()
            .find(|t| &t.name == name)
            .expect("diff names come from the declared set");
        debug!(table = %name, "creating new table");
        ddl::apply_table_ddl(conn, desc).map_err(|e| migration_failed(name, e))?;
        persist_descriptor(conn, desc).map_err(|e| migration_failed(name, e))?;
    }

    for name in &diff.dropped_tables {
        let desc = persisted
            .iter()
            .find(|t| &t.name == name)
            .expect("diff names come from the persisted set");
        debug!(table = %name, "dropping table");
        ddl::drop_table_ddl(conn, desc).map_err(|e| migration_failed(name, e))?;
        remove_descriptor(conn, name).map_err(|e| migration_failed(name, e))?;
    }

    for table_diff in &diff.changed {
        let name = &table_diff.table;
        let old_desc = persisted
            .iter()
            .find(|t| &t.name == name)
            .expect("changed tables exist in the persisted set");
        let new_desc = declared
            .iter()
            .find(|t| &t.name == name)
            .expect("changed tables exist in the declared set");

        if table_diff.needs_rewrite() {
            rewrite_table(conn, old_desc, new_desc, plan)
                .map_err(|e| migration_failed(name, e))?;
        } else {
            reindex_table(conn, old_desc, new_desc, &table_diff.changes)
                .map_err(|e| migration_failed(name, e))?;
        }
        persist_descriptor(conn, new_desc).map_err(|e| migration_failed(name, e))?;
    }

    Ok(())
}

/// Index-only change: create or drop indices and sidecars without touching
/// row data.
fn reindex_table(
    conn: &Connection,
    old_desc: &TableDescriptor,
    new_desc: &TableDescriptor,
    changes: &[ColumnChange],
) -> LatticeResult<()> {
    // Retired unique constraints leave stale indices behind; drop them
    // before recreating the declared set.
    if changes.contains(&ColumnChange::ConstraintsChanged) {
        for constraint in &old_desc.constraints {
            conn.execute_batch(&format!(
                "DROP INDEX IF EXISTS {}",
                ddl::quote_ident(&format!(
                    "uq_{}_{}",
                    old_desc.name,
                    constraint.columns.join("_")
                ))
            ))?;
        }
    }
    for change in changes {
        if let ColumnChange::IndexedChanged { name, indexed: false } = change {
            let col = old_desc
                .column(name)
                .ok_or_else(|| LatticeError::schema_invalid(&old_desc.name, format!("unknown column '{name}'")))?;
            match col.kind {
                ColumnKind::Geo => {
                    conn.execute_batch(&format!(
                        "DROP TABLE IF EXISTS {}",
                        ddl::quote_ident(&ddl::rtree_table_name(&old_desc.name, name))
                    ))?;
                }
                ColumnKind::Text => {
                    conn.execute_batch(&format!(
                        "DROP TABLE IF EXISTS {}",
                        ddl::quote_ident(&ddl::fts_table_name(&old_desc.name, name))
                    ))?;
                    conn.execute_batch(&format!(
                        "DROP INDEX IF EXISTS {}",
                        ddl::quote_ident(&format!("idx_{}_{name}", old_desc.name))
                    ))?;
                }
                _ => {
                    conn.execute_batch(&format!(
                        "DROP INDEX IF EXISTS {}",
                        ddl::quote_ident(&format!("idx_{}_{name}", old_desc.name))
                    ))?;
                }
            }
        }
    }
    for sql in ddl::index_sql(new_desc)
        .into_iter()
        .chain(ddl::sidecar_sql(new_desc))
    {
        conn.execute_batch(&sql)?;
    }
    // Newly indexed proximity columns need their sidecars filled.
    for change in changes {
        if let ColumnChange::IndexedChanged { name, indexed: true } = change {
            let col = new_desc
                .column(name)
                .ok_or_else(|| LatticeError::schema_invalid(&new_desc.name, format!("unknown column '{name}'")))?;
            if matches!(col.kind, ColumnKind::Geo | ColumnKind::Text) {
                let narrowed = TableDescriptor {
                    name: new_desc.name.clone(),
                    columns: vec![col.clone()],
                    constraints: Vec::new(),
                };
                for sql in ddl::sidecar_backfill_sql(&narrowed) {
                    conn.execute_batch(&sql)?;
                }
            }
        }
    }
    Ok(())
}

/// Shadow-table rewrite: build the new-shape table, run each row through
/// the compatible-column seed and the optional transform, preserve global
/// ids, swap, and rebuild indices and sidecars.
fn rewrite_table(
    conn: &Connection,
    old_desc: &TableDescriptor,
    new_desc: &TableDescriptor,
    plan: Option<&MigrationPlan>,
) -> LatticeResult<()> {
    let table = &new_desc.name;
    let shadow_name = format!("_shadow_{table}");
    debug!(table = %table, "rewriting through shadow table");

    conn.execute_batch(&ddl::create_table_sql(new_desc, &shadow_name))?;
    for sql in ddl::link_table_sql(new_desc) {
        conn.execute_batch(&sql)?;
    }

    let mut shadow_desc = new_desc.clone();
    shadow_desc.name = shadow_name.clone();

    let transform = plan.and_then(|p| p.transforms.get(table));
    let wiped = plan.map(|p| p.wipes.contains(table)).unwrap_or(false);

    if !wiped {
        let sql = format!("SELECT pk FROM {} ORDER BY pk", ddl::quote_ident(table));
        let mut stmt = conn.prepare(&sql)?;
        let pks: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        for pk in pks {
            let (gid, fields) = rows::read_row(conn, old_desc, pk)?
                .ok_or_else(|| LatticeError::not_found(table, pk))?;
            let mut link_map = FxHashMap::default();
            for col in &old_desc.columns {
                if col.kind.is_list() {
                    link_map.insert(
                        col.name.clone(),
                        links::link_targets(conn, old_desc, col, gid)?,
                    );
                }
            }
            let old_row = OldRow {
                global_id: gid,
                fields,
                links: link_map,
            };

            let mut new_row = NewRow {
                desc: new_desc,
                fields: FieldMap::default(),
                links: FxHashMap::default(),
            };
            for col in &new_desc.columns {
                let source = plan
                    .and_then(|p| p.rename_source(table, &col.name))
                    .unwrap_or(&col.name);
                if col.kind.is_list() {
                    let old_col = old_desc.column(source);
                    if old_col.map(|c| c.kind.is_list()).unwrap_or(false) {
                        new_row
                            .links
                            .insert(col.name.clone(), old_row.link_targets(source).to_vec());
                    }
                    continue;
                }
                if let Some(old_col) = old_desc.column(source) {
                    if compatible(&old_col.kind, &col.kind) {
                        let mut value = old_row.get(source);
                        if matches!(
                            (&old_col.kind, &col.kind),
                            (ColumnKind::Int, ColumnKind::Real)
                        ) {
                            if let Value::Int(v) = value {
                                value = Value::Real(v as f64);
                            }
                        }
                        if !value.is_null() {
                            new_row.fields.insert(col.name.clone(), value);
                        }
                    }
                }
            }

            if let Some(f) = transform {
                f(&old_row, &mut new_row)?;
            }

            rows::insert_row_raw(conn, &shadow_desc, gid, &new_row.fields)?;
            for col in &new_desc.columns {
                if col.kind.is_list() {
                    let targets = new_row.links.remove(&col.name).unwrap_or_default();
                    links::replace_links(conn, new_desc, col, gid, &targets)?;
                }
            }
        }
    }

    // Drop old sidecars and the old table (its triggers go with it), then
    // swap the shadow in and rebuild everything derived.
    for col in &old_desc.columns {
        if !col.indexed {
            continue;
        }
        match col.kind {
            ColumnKind::Geo => {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {}",
                    ddl::quote_ident(&ddl::rtree_table_name(table, &col.name))
                ))?;
            }
            ColumnKind::Text => {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {}",
                    ddl::quote_ident(&ddl::fts_table_name(table, &col.name))
                ))?;
            }
            _ => {}
        }
    }
    for col in &old_desc.columns {
        if let ColumnKind::List { target } = &col.kind {
            let keep = new_desc
                .column(&col.name)
                .map(|c| c.kind.is_list())
                .unwrap_or(false);
            if !keep || wiped {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS {}",
                    ddl::quote_ident(&ddl::link_table_name(table, target, &col.name))
                ))?;
            }
        }
    }
    conn.execute_batch(&format!("DROP TABLE {}", ddl::quote_ident(table)))?;
    conn.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        ddl::quote_ident(&shadow_name),
        ddl::quote_ident(table)
    ))?;
    for sql in ddl::index_sql(new_desc)
        .into_iter()
        .chain(ddl::link_table_sql(new_desc))
        .chain(ddl::sidecar_sql(new_desc))
        .chain(ddl::sidecar_backfill_sql(new_desc))
    {
        conn.execute_batch(&sql)?;
    }
    Ok(())
}
