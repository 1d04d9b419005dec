//! Canonical per-table descriptors and open-time reconciliation.
//!
//! Reconciliation walks the declared tables transitively over link
//! targets, compares against the descriptors persisted in
//! `_lattice_schema`, and hands any non-empty diff to the migration
//! engine. The registry is immutable for the lifetime of an open store.

use std::collections::VecDeque;
use std::sync::Arc;

use rusqlite::{params, Connection};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use lattice_core::schema::diff::SchemaDiff;
use lattice_core::schema::TableDescriptor;
use lattice_core::{LatticeError, LatticeResult, Schema};

use crate::migrate::{run_migration, MigrationPlan};

use super::ddl;

#[derive(Debug)]
pub struct SchemaRegistry {
    tables: FxHashMap<String, Arc<TableDescriptor>>,
    order: Vec<String>,
}

impl SchemaRegistry {
    /// Descriptor lookup. Unknown tables are a query error carrying the
    /// offending name.
    pub fn descriptor(&self, table: &str) -> LatticeResult<Arc<TableDescriptor>> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| LatticeError::query_invalid(table, "unknown table"))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Table names in reconciled (BFS) order.
    pub fn table_names(&self) -> &[String] {
        &self.order
    }

    /// Run reconciliation at open: discover tables, compare with the
    /// persisted descriptors, migrate on divergence, and persist the
    /// declared shape.
    pub fn reconcile(
        conn: &Connection,
        schema: &Schema,
        plan: Option<&MigrationPlan>,
    ) -> LatticeResult<Self> {
        schema.validate()?;
        let order = discover_order(schema);

        conn.execute_batch(ddl::RESERVED_TABLES_SQL)?;

        let persisted = load_descriptors(conn)?;
        let declared: Vec<TableDescriptor> = order
            .iter()
            .filter_map(|name| schema.table(name).cloned())
            .collect();

        let diff = SchemaDiff::compute(&persisted, &declared);
        if diff.is_empty() {
            debug!("schema is up to date ({} tables)", declared.len());
        } else {
            if !diff.is_additive() && plan.is_none() {
                let table = diff
                    .changed
                    .first()
                    .map(|t| t.table.clone())
                    .or_else(|| diff.dropped_tables.first().cloned())
                    .unwrap_or_default();
                return Err(LatticeError::SchemaConflict {
                    table,
                    message: "declared schema diverges from the persisted descriptor; \
                              a migration plan is required"
                        .to_string(),
                });
            }
            info!(
                new = diff.new_tables.len(),
                dropped = diff.dropped_tables.len(),
                changed = diff.changed.len(),
                "schema divergence detected, migrating"
            );
            run_migration(conn, &persisted, &declared, &diff, plan)?;
        }

        let mut tables = FxHashMap::default();
        for table in declared {
            tables.insert(table.name.clone(), Arc::new(table));
        }
        Ok(Self { tables, order })
    }
}

/// BFS from the seed tables over link/list targets, deduped by name.
/// Validation has already guaranteed every target is declared.
fn discover_order(schema: &Schema) -> Vec<String> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    let mut order = Vec::new();
    let mut queue: VecDeque<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        order.push(name.to_string());
        if let Some(table) = schema.table(name) {
            for col in &table.columns {
                if let Some(target) = col.kind.link_target() {
                    queue.push_back(target);
                }
            }
        }
    }
    order
}

/// Load every persisted descriptor from `_lattice_schema`.
pub fn load_descriptors(conn: &Connection) -> LatticeResult<Vec<TableDescriptor>> {
    let mut stmt =
        conn.prepare("SELECT descriptor FROM _lattice_schema ORDER BY \"table\"")?;
    let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
    let mut out = Vec::new();
    for row in rows {
        let blob = row?;
        out.push(serde_json::from_slice(&blob)?);
    }
    Ok(out)
}

/// Persist (or replace) one table's descriptor.
pub fn persist_descriptor(conn: &Connection, desc: &TableDescriptor) -> LatticeResult<()> {
    let blob = serde_json::to_vec(desc)?;
    conn.execute(
        "INSERT OR REPLACE INTO _lattice_schema (\"table\", descriptor) VALUES (?1, ?2)",
        params![desc.name, blob],
    )?;
    Ok(())
}

/// Remove a dropped table's descriptor.
pub fn remove_descriptor(conn: &Connection, table: &str) -> LatticeResult<()> {
    conn.execute(
        "DELETE FROM _lattice_schema WHERE \"table\" = ?1",
        params![table],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::schema::ColumnDescriptor;

    fn open_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::kernel::pragmas::configure_connection(&conn).unwrap();
        conn
    }

    fn schema() -> Schema {
        Schema::new(vec![
            lattice_core::TableDescriptor::new(
                "Trip",
                vec![
                    ColumnDescriptor::text("name"),
                    ColumnDescriptor::int("days").indexed(),
                ],
            ),
        ])
    }

    #[test]
    fn fresh_store_creates_tables_and_persists_descriptors() {
        let conn = open_conn();
        let registry = SchemaRegistry::reconcile(&conn, &schema(), None).unwrap();
        assert!(registry.contains("Trip"));

        let persisted = load_descriptors(&conn).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].name, "Trip");

        let exists: bool = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE name = 'Trip'")
            .unwrap()
            .exists([])
            .unwrap();
        assert!(exists);
    }

    #[test]
    fn reopen_with_same_schema_is_noop() {
        let conn = open_conn();
        SchemaRegistry::reconcile(&conn, &schema(), None).unwrap();
        SchemaRegistry::reconcile(&conn, &schema(), None).unwrap();
    }

    #[test]
    fn destructive_divergence_without_plan_conflicts() {
        let conn = open_conn();
        SchemaRegistry::reconcile(&conn, &schema(), None).unwrap();

        let changed = Schema::new(vec![lattice_core::TableDescriptor::new(
            "Trip",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::real("days"),
            ],
        )]);
        let err = SchemaRegistry::reconcile(&conn, &changed, None).unwrap_err();
        assert!(matches!(err, LatticeError::SchemaConflict { .. }));
    }

    #[test]
    fn additive_divergence_migrates_automatically() {
        let conn = open_conn();
        SchemaRegistry::reconcile(&conn, &schema(), None).unwrap();

        let extended = Schema::new(vec![lattice_core::TableDescriptor::new(
            "Trip",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::int("days").indexed(),
                ColumnDescriptor::text("notes").nullable(),
            ],
        )]);
        let registry = SchemaRegistry::reconcile(&conn, &extended, None).unwrap();
        let desc = registry.descriptor("Trip").unwrap();
        assert!(desc.column("notes").is_some());
    }
}
