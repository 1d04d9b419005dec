//! Schema diff classification between the persisted and declared
//! descriptors. The migration engine consumes this.

use serde::{Deserialize, Serialize};

use super::{ColumnDescriptor, ColumnKind, TableDescriptor};

/// One classified column change within a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnChange {
    Added(ColumnDescriptor),
    Removed(String),
    TypeChanged {
        name: String,
        from: ColumnKind,
        to: ColumnKind,
    },
    /// Only the `indexed` flag flipped; handled by creating or dropping
    /// the index without rewriting rows.
    IndexedChanged { name: String, indexed: bool },
    /// The unique-constraint set changed; handled by swapping constraint
    /// indices without rewriting rows.
    ConstraintsChanged,
}

impl ColumnChange {
    /// Whether applying this change can lose data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ColumnChange::Removed(_) | ColumnChange::TypeChanged { .. }
        )
    }

    /// Whether this change forces a shadow-table rewrite.
    pub fn needs_rewrite(&self) -> bool {
        !matches!(
            self,
            ColumnChange::IndexedChanged { .. } | ColumnChange::ConstraintsChanged
        )
    }
}

/// Column changes for one surviving table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub table: String,
    pub changes: Vec<ColumnChange>,
}

impl TableDiff {
    pub fn needs_rewrite(&self) -> bool {
        self.changes.iter().any(ColumnChange::needs_rewrite)
    }
}

/// The full classification of declared vs. persisted schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub new_tables: Vec<String>,
    pub dropped_tables: Vec<String>,
    pub changed: Vec<TableDiff>,
}

impl SchemaDiff {
    /// Classify the divergence between what is on disk and what the
    /// application declares.
    pub fn compute(persisted: &[TableDescriptor], declared: &[TableDescriptor]) -> Self {
        let mut diff = SchemaDiff::default();

        for table in declared {
            match persisted.iter().find(|p| p.name == table.name) {
                None => diff.new_tables.push(table.name.clone()),
                Some(old) => {
                    let changes = diff_columns(old, table);
                    if !changes.is_empty() {
                        diff.changed.push(TableDiff {
                            table: table.name.clone(),
                            changes,
                        });
                    }
                }
            }
        }
        for old in persisted {
            if !declared.iter().any(|t| t.name == old.name) {
                diff.dropped_tables.push(old.name.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.new_tables.is_empty() && self.dropped_tables.is_empty() && self.changed.is_empty()
    }

    /// Additive diffs (new tables, added columns, index flips) migrate
    /// without a user-supplied plan; anything else needs one.
    pub fn is_additive(&self) -> bool {
        self.dropped_tables.is_empty()
            && self
                .changed
                .iter()
                .all(|t| t.changes.iter().all(|c| !c.is_destructive()))
    }
}

fn diff_columns(old: &TableDescriptor, new: &TableDescriptor) -> Vec<ColumnChange> {
    let mut changes = Vec::new();
    for col in &new.columns {
        match old.column(&col.name) {
            None => changes.push(ColumnChange::Added(col.clone())),
            Some(prev) => {
                if prev.kind != col.kind || prev.nullable != col.nullable {
                    changes.push(ColumnChange::TypeChanged {
                        name: col.name.clone(),
                        from: prev.kind.clone(),
                        to: col.kind.clone(),
                    });
                } else if prev.indexed != col.indexed {
                    changes.push(ColumnChange::IndexedChanged {
                        name: col.name.clone(),
                        indexed: col.indexed,
                    });
                }
            }
        }
    }
    for col in &old.columns {
        if new.column(&col.name).is_none() {
            changes.push(ColumnChange::Removed(col.name.clone()));
        }
    }
    if old.constraints != new.constraints {
        changes.push(ColumnChange::ConstraintsChanged);
    }
    changes
}
