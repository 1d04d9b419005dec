//! Virtual results: one query surface over multiple tables sharing a
//! column subset, compiled to a UNION ALL that preserves per-row table
//! identity so materialization returns the correct concrete row.

use std::sync::Arc;

use lattice_core::schema::ColumnKind;
use lattice_core::{LatticeError, LatticeResult};

use crate::rows::DynamicRow;
use crate::schema::ddl::quote_ident;
use crate::store::StoreShared;

use super::predicate::{lower, LowerCtx, Predicate};

/// A row produced by a virtual query: the concrete table it came from and
/// a managed handle of that table's row type.
pub struct VirtualRow {
    pub table: String,
    pub row: DynamicRow,
}

/// A query over N member tables. Predicates and ordering are pushed into
/// every branch; referenced columns must exist in all members with the
/// same kind.
#[derive(Clone)]
pub struct VirtualQuery {
    shared: Arc<StoreShared>,
    tables: Vec<String>,
    pred: Option<Predicate>,
    orders: Vec<(String, bool)>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl VirtualQuery {
    pub(crate) fn new(shared: Arc<StoreShared>, tables: Vec<String>) -> Self {
        Self {
            shared,
            tables,
            pred: None,
            orders: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, pred: Predicate) -> Self {
        self.pred = Some(match self.pred.take() {
            Some(existing) => existing.and(pred),
            None => pred,
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.orders.push((column.into(), ascending));
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Check that every order column is shared by all members with one
    /// kind; the per-branch predicate lowering covers predicate columns.
    fn check_shared_columns(&self) -> LatticeResult<()> {
        for (column, _) in &self.orders {
            let mut kind: Option<ColumnKind> = None;
            for table in &self.tables {
                let desc = self.shared.kernel.descriptor(table)?;
                let col = desc.column(column).ok_or_else(|| {
                    LatticeError::query_invalid(
                        table,
                        format!("virtual query orders by '{column}', missing here"),
                    )
                })?;
                match &kind {
                    None => kind = Some(col.kind.clone()),
                    Some(k) if *k == col.kind => {}
                    Some(_) => {
                        return Err(LatticeError::query_invalid(
                            table,
                            format!("column '{column}' has mismatched kinds across members"),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn build(&self) -> LatticeResult<(String, Vec<rusqlite::types::Value>)> {
        if self.tables.is_empty() {
            return Err(LatticeError::query_invalid(
                "<virtual>",
                "virtual query needs at least one member table",
            ));
        }
        self.check_shared_columns()?;

        let mut ctx = LowerCtx::new(&self.shared.kernel.registry);
        let mut branches = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            let desc = self.shared.kernel.descriptor(table)?;
            let mut select = format!(
                "SELECT '{}' AS src, t.pk AS pk",
                table.replace('\'', "''")
            );
            for (i, (column, _)) in self.orders.iter().enumerate() {
                select.push_str(&format!(", t.{} AS ord_{i}", quote_ident(column)));
            }
            select.push_str(&format!(" FROM {} t", quote_ident(table)));
            if let Some(pred) = &self.pred {
                let clause = lower(&mut ctx, &desc, "t", pred)?;
                select.push_str(&format!(" WHERE {clause}"));
            }
            branches.push(select);
        }

        let mut sql = branches.join(" UNION ALL ");
        let mut order_parts: Vec<String> = self
            .orders
            .iter()
            .enumerate()
            .map(|(i, (_, ascending))| {
                format!("ord_{i} {}", if *ascending { "ASC" } else { "DESC" })
            })
            .collect();
        order_parts.push("src ASC".to_string());
        order_parts.push("pk ASC".to_string());
        sql.push_str(&format!(" ORDER BY {}", order_parts.join(", ")));

        if self.limit.is_some() || self.offset.is_some() {
            let limit = self.limit.map(|l| l as i64).unwrap_or(-1);
            let offset = self.offset.unwrap_or(0) as i64;
            let pl = {
                ctx.params.push(rusqlite::types::Value::Integer(limit));
                format!("?{}", ctx.params.len())
            };
            let po = {
                ctx.params.push(rusqlite::types::Value::Integer(offset));
                format!("?{}", ctx.params.len())
            };
            sql.push_str(&format!(" LIMIT {pl} OFFSET {po}"));
        }

        Ok((sql, ctx.params))
    }

    /// Live count across all branches.
    pub fn count(&self) -> LatticeResult<usize> {
        let (sql, params) = self.build()?;
        let wrapped = format!("SELECT COUNT(*) FROM ({sql})");
        self.shared.kernel.read(|conn| {
            let mut stmt = conn.prepare_cached(&wrapped)?;
            let n: i64 = stmt.query_row(rusqlite::params_from_iter(params.clone()), |row| {
                row.get(0)
            })?;
            Ok(n as usize)
        })
    }

    /// Materialize as concrete managed rows, interleaved per the pushed
    /// ordering.
    pub fn rows(&self) -> LatticeResult<Vec<VirtualRow>> {
        let (sql, params) = self.build()?;
        let hits: Vec<(String, i64)> = self.shared.kernel.read(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.clone()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut out = Vec::with_capacity(hits.len());
        for (table, pk) in hits {
            out.push(VirtualRow {
                row: self.shared.managed_row(&table, pk)?,
                table,
            });
        }
        Ok(out)
    }
}
