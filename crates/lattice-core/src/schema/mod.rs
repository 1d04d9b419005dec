//! Schema descriptors: the canonical per-table shape the registry
//! reconciles, persists, and diffs.

pub mod diff;

use serde::{Deserialize, Serialize};

use crate::errors::{LatticeError, LatticeResult};
use crate::value::Value;

/// Reserved prefix for internal tables (`_lattice_schema`, `_lattice_audit`)
/// and index sidecars. User tables may not start with it.
pub const RESERVED_PREFIX: &str = "_lattice";

/// Distance metric for vector columns and k-NN queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorMetric {
    L2,
    #[default]
    Cosine,
    L1,
}

impl VectorMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorMetric::L2 => "l2",
            VectorMetric::Cosine => "cosine",
            VectorMetric::L1 => "l1",
        }
    }

    pub fn parse(s: &str) -> LatticeResult<Self> {
        match s {
            "l2" => Ok(VectorMetric::L2),
            "cosine" => Ok(VectorMetric::Cosine),
            "l1" => Ok(VectorMetric::L1),
            other => Err(LatticeError::Io {
                message: format!("unknown vector metric '{other}'"),
            }),
        }
    }
}

/// The physical kind of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ColumnKind {
    Int,
    Real,
    Text,
    Blob,
    /// Single reference to a row in `target`, stored as its global id.
    Link { target: String },
    /// Ordered multiset of references to rows in `target`, stored in a
    /// per-column link table.
    List { target: String },
    /// Geographic point, split into `<col>_lat` / `<col>_lon` REAL columns.
    Geo,
    /// Fixed-dimension embedding, stored as a little-endian f32 BLOB.
    /// `metric` pins the column to one distance metric; queries without an
    /// explicit metric fall back to it, then to the store default.
    Vector {
        dims: usize,
        metric: Option<VectorMetric>,
    },
}

impl ColumnKind {
    /// The link/list target table, if any.
    pub fn link_target(&self) -> Option<&str> {
        match self {
            ColumnKind::Link { target } | ColumnKind::List { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ColumnKind::List { .. })
    }
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub indexed: bool,
    pub default: Option<Value>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            indexed: false,
            default: None,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Int)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Real)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Blob)
    }

    pub fn link(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            ColumnKind::Link {
                target: target.into(),
            },
        )
        .nullable()
    }

    pub fn list(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            ColumnKind::List {
                target: target.into(),
            },
        )
    }

    pub fn geo(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Geo)
    }

    pub fn vector(name: impl Into<String>, dims: usize) -> Self {
        Self::new(name, ColumnKind::Vector { dims, metric: None })
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_metric(mut self, metric: VectorMetric) -> Self {
        if let ColumnKind::Vector { metric: m, .. } = &mut self.kind {
            *m = Some(metric);
        }
        self
    }

    /// The value a freshly created row carries for this column.
    pub fn effective_default(&self) -> Value {
        match &self.default {
            Some(v) => v.clone(),
            None if self.kind.is_list() => Value::List(Vec::new()),
            None => Value::Null,
        }
    }
}

/// A unique constraint over one or more columns. At most one constraint per
/// table may set `allows_upsert`; a colliding insert through it becomes an
/// in-place update of the conflicting row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub columns: Vec<String>,
    pub allows_upsert: bool,
}

impl UniqueConstraint {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            allows_upsert: false,
        }
    }

    pub fn on(column: impl Into<String>) -> Self {
        Self::new(vec![column.into()])
    }

    pub fn upsert(mut self) -> Self {
        self.allows_upsert = true;
        self
    }
}

/// The canonical descriptor of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub constraints: Vec<UniqueConstraint>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.into(),
            columns,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The single `allows_upsert` constraint, if declared.
    pub fn upsert_constraint(&self) -> Option<&UniqueConstraint> {
        self.constraints.iter().find(|c| c.allows_upsert)
    }

    fn validate(&self) -> LatticeResult<()> {
        if self.name.starts_with(RESERVED_PREFIX) {
            return Err(LatticeError::schema_invalid(
                &self.name,
                format!("table names starting with '{RESERVED_PREFIX}' are reserved"),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            if !seen.insert(col.name.as_str()) {
                return Err(LatticeError::schema_invalid(
                    &self.name,
                    format!("duplicate column '{}'", col.name),
                ));
            }
            if let ColumnKind::Vector { dims, .. } = &col.kind {
                if *dims == 0 {
                    return Err(LatticeError::schema_invalid(
                        &self.name,
                        format!("vector column '{}' declares zero dimensions", col.name),
                    ));
                }
            }
            if let Some(default) = &col.default {
                if !default.matches_kind(&col.kind) && !default.is_null() {
                    return Err(LatticeError::schema_invalid(
                        &self.name,
                        format!("default for column '{}' does not match its kind", col.name),
                    ));
                }
            }
        }
        let mut upserts = 0;
        for constraint in &self.constraints {
            if constraint.columns.is_empty() {
                return Err(LatticeError::schema_invalid(
                    &self.name,
                    "unique constraint with no columns",
                ));
            }
            for c in &constraint.columns {
                if self.column(c).is_none() {
                    return Err(LatticeError::schema_invalid(
                        &self.name,
                        format!("unique constraint references unknown column '{c}'"),
                    ));
                }
            }
            if constraint.allows_upsert {
                upserts += 1;
            }
        }
        if upserts > 1 {
            return Err(LatticeError::schema_invalid(
                &self.name,
                "at most one unique constraint per table may allow upsert",
            ));
        }
        Ok(())
    }
}

/// A declared schema: the seed tables an application opens a store with.
/// The registry walks link targets transitively, so every target must be
/// present here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<TableDescriptor>,
}

impl Schema {
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Registry-build validation. Fails with `SchemaInvalid` on duplicate
    /// names, unresolvable link targets, bad constraints, or a second
    /// upsert constraint.
    pub fn validate(&self) -> LatticeResult<()> {
        let mut names = std::collections::HashSet::new();
        for table in &self.tables {
            if !names.insert(table.name.as_str()) {
                return Err(LatticeError::schema_invalid(
                    &table.name,
                    "duplicate table name",
                ));
            }
            table.validate()?;
        }
        for table in &self.tables {
            for col in &table.columns {
                if let Some(target) = col.kind.link_target() {
                    if self.table(target).is_none() {
                        return Err(LatticeError::schema_invalid(
                            &table.name,
                            format!(
                                "column '{}' links to undeclared table '{target}'",
                                col.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip() -> TableDescriptor {
        TableDescriptor::new(
            "Trip",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::int("days").indexed(),
            ],
        )
    }

    #[test]
    fn valid_schema_passes() {
        let schema = Schema::new(vec![trip()]);
        schema.validate().unwrap();
    }

    #[test]
    fn unresolved_link_target_rejected() {
        let schema = Schema::new(vec![TableDescriptor::new(
            "Trip",
            vec![ColumnDescriptor::link("owner", "User")],
        )]);
        assert!(matches!(
            schema.validate(),
            Err(LatticeError::SchemaInvalid { .. })
        ));
    }

    #[test]
    fn double_upsert_constraint_rejected() {
        let table = TableDescriptor::new(
            "User",
            vec![ColumnDescriptor::text("email"), ColumnDescriptor::text("handle")],
        )
        .with_constraint(UniqueConstraint::on("email").upsert())
        .with_constraint(UniqueConstraint::on("handle").upsert());
        let schema = Schema::new(vec![table]);
        assert!(matches!(
            schema.validate(),
            Err(LatticeError::SchemaInvalid { .. })
        ));
    }

    #[test]
    fn reserved_prefix_rejected() {
        let schema = Schema::new(vec![TableDescriptor::new(
            "_lattice_private",
            vec![ColumnDescriptor::int("x")],
        )]);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn descriptor_json_roundtrip() {
        let table = trip().with_constraint(UniqueConstraint::on("name").upsert());
        let json = serde_json::to_string(&table).unwrap();
        let back: TableDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(table, back);
    }
}
