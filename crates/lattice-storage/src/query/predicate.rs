//! Typed predicate trees and their lowering to parameterized SQL.
//!
//! Predicates capture full column paths; a two-segment path traverses one
//! link and lowers to an EXISTS subquery against the target table.
//! Evaluation is always pushed to the kernel.

use lattice_core::schema::{ColumnDescriptor, ColumnKind, TableDescriptor};
use lattice_core::{GlobalId, LatticeError, LatticeResult, Value};

use crate::schema::ddl::{link_table_name, quote_ident};
use crate::schema::registry::SchemaRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// A predicate tree over one table's rows.
#[derive(Debug, Clone)]
pub enum Predicate {
    Cmp {
        path: Vec<String>,
        op: CmpOp,
        value: Value,
    },
    In {
        path: Vec<String>,
        values: Vec<Value>,
    },
    Between {
        path: Vec<String>,
        lo: Value,
        hi: Value,
    },
    Contains {
        path: Vec<String>,
        needle: Value,
    },
    StartsWith {
        path: Vec<String>,
        prefix: String,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::And(mut preds) => {
                preds.push(other);
                Predicate::And(preds)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Or(mut preds) => {
                preds.push(other);
                Predicate::Or(preds)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }
}

/// A column path in the builder: `col("days")` or `col("author.name")`.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    path: Vec<String>,
}

/// Entry point of the predicate builder.
pub fn col(path: &str) -> ColumnRef {
    ColumnRef {
        path: path.split('.').map(str::to_string).collect(),
    }
}

impl ColumnRef {
    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        Predicate::Cmp {
            path: self.path,
            op: CmpOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        Predicate::Cmp {
            path: self.path,
            op: CmpOp::Ne,
            value: value.into(),
        }
    }

    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        Predicate::Cmp {
            path: self.path,
            op: CmpOp::Lt,
            value: value.into(),
        }
    }

    pub fn le(self, value: impl Into<Value>) -> Predicate {
        Predicate::Cmp {
            path: self.path,
            op: CmpOp::Le,
            value: value.into(),
        }
    }

    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        Predicate::Cmp {
            path: self.path,
            op: CmpOp::Gt,
            value: value.into(),
        }
    }

    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        Predicate::Cmp {
            path: self.path,
            op: CmpOp::Ge,
            value: value.into(),
        }
    }

    pub fn in_values(self, values: Vec<Value>) -> Predicate {
        Predicate::In {
            path: self.path,
            values,
        }
    }

    pub fn between(self, lo: impl Into<Value>, hi: impl Into<Value>) -> Predicate {
        Predicate::Between {
            path: self.path,
            lo: lo.into(),
            hi: hi.into(),
        }
    }

    /// Substring match on text columns, membership test on link lists.
    pub fn contains(self, value: impl Into<Value>) -> Predicate {
        Predicate::Contains {
            path: self.path,
            needle: value.into(),
        }
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> Predicate {
        Predicate::StartsWith {
            path: self.path,
            prefix: prefix.into(),
        }
    }
}

// ─── Lowering ───────────────────────────────────────────────────────────

pub(crate) struct LowerCtx<'a> {
    pub registry: &'a SchemaRegistry,
    pub params: Vec<rusqlite::types::Value>,
    next_alias: usize,
}

impl<'a> LowerCtx<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            params: Vec::new(),
            next_alias: 0,
        }
    }

    pub(crate) fn bind(&mut self, value: rusqlite::types::Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn fresh_alias(&mut self) -> String {
        self.next_alias += 1;
        format!("lnk{}", self.next_alias)
    }
}

fn scalar_column<'a>(
    desc: &'a TableDescriptor,
    name: &str,
) -> LatticeResult<&'a ColumnDescriptor> {
    let col = desc
        .column(name)
        .ok_or_else(|| LatticeError::query_invalid(&desc.name, format!("unknown column '{name}'")))?;
    match col.kind {
        ColumnKind::Geo | ColumnKind::Vector { .. } => Err(LatticeError::query_invalid(
            &desc.name,
            format!("column '{name}' requires a proximity query"),
        )),
        _ => Ok(col),
    }
}

fn check_comparable(table: &str, col: &ColumnDescriptor, value: &Value) -> LatticeResult<()> {
    if value.is_null() || value.matches_kind(&col.kind) {
        return Ok(());
    }
    Err(LatticeError::query_invalid(
        table,
        format!(
            "cannot compare column '{}' ({:?}) with {:?}",
            col.name, col.kind, value
        ),
    ))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Lower a predicate to a boolean SQL fragment over `alias`.
pub(crate) fn lower(
    ctx: &mut LowerCtx<'_>,
    desc: &TableDescriptor,
    alias: &str,
    pred: &Predicate,
) -> LatticeResult<String> {
    match pred {
        Predicate::And(preds) => {
            let parts: Vec<String> = preds
                .iter()
                .map(|p| lower(ctx, desc, alias, p))
                .collect::<LatticeResult<_>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        Predicate::Or(preds) => {
            let parts: Vec<String> = preds
                .iter()
                .map(|p| lower(ctx, desc, alias, p))
                .collect::<LatticeResult<_>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        Predicate::Not(inner) => {
            let part = lower(ctx, desc, alias, inner)?;
            Ok(format!("NOT {part}"))
        }
        Predicate::Cmp { path, op, value } => {
            lower_path(ctx, desc, alias, path, &|ctx, table, col, alias| {
                check_comparable(table, col, value)?;
                let column = format!("{alias}.{}", quote_ident(&col.name));
                match (op, value) {
                    (CmpOp::Eq, Value::Null) => Ok(format!("{column} IS NULL")),
                    (CmpOp::Ne, Value::Null) => Ok(format!("{column} IS NOT NULL")),
                    _ => {
                        let p = ctx.bind(value.to_sql_value()?);
                        Ok(format!("{column} {} {p}", op.sql()))
                    }
                }
            })
        }
        Predicate::In { path, values } => {
            lower_path(ctx, desc, alias, path, &|ctx, table, col, alias| {
                let mut placeholders = Vec::with_capacity(values.len());
                for value in values {
                    check_comparable(table, col, value)?;
                    placeholders.push(ctx.bind(value.to_sql_value()?));
                }
                if placeholders.is_empty() {
                    return Ok("0".to_string());
                }
                Ok(format!(
                    "{alias}.{} IN ({})",
                    quote_ident(&col.name),
                    placeholders.join(", ")
                ))
            })
        }
        Predicate::Between { path, lo, hi } => {
            lower_path(ctx, desc, alias, path, &|ctx, table, col, alias| {
                check_comparable(table, col, lo)?;
                check_comparable(table, col, hi)?;
                let p_lo = ctx.bind(lo.to_sql_value()?);
                let p_hi = ctx.bind(hi.to_sql_value()?);
                Ok(format!(
                    "{alias}.{} BETWEEN {p_lo} AND {p_hi}",
                    quote_ident(&col.name)
                ))
            })
        }
        Predicate::Contains { path, needle } => {
            lower_path(ctx, desc, alias, path, &|ctx, table, col, alias| {
                match (&col.kind, needle) {
                    (ColumnKind::Text, Value::Text(s)) => {
                        let p = ctx.bind(rusqlite::types::Value::Text(format!(
                            "%{}%",
                            escape_like(s)
                        )));
                        Ok(format!(
                            "{alias}.{} LIKE {p} ESCAPE '\\'",
                            quote_ident(&col.name)
                        ))
                    }
                    (ColumnKind::List { .. }, Value::Link(target)) => {
                        lower_list_membership(ctx, table, col, alias, *target)
                    }
                    _ => Err(LatticeError::query_invalid(
                        table,
                        format!("'contains' does not apply to column '{}'", col.name),
                    )),
                }
            })
        }
        Predicate::StartsWith { path, prefix } => {
            lower_path(ctx, desc, alias, path, &|ctx, table, col, alias| {
                if !matches!(col.kind, ColumnKind::Text) {
                    return Err(LatticeError::query_invalid(
                        table,
                        format!("'starts_with' does not apply to column '{}'", col.name),
                    ));
                }
                let p = ctx.bind(rusqlite::types::Value::Text(format!(
                    "{}%",
                    escape_like(prefix)
                )));
                Ok(format!(
                    "{alias}.{} LIKE {p} ESCAPE '\\'",
                    quote_ident(&col.name)
                ))
            })
        }
    }
}

fn lower_list_membership(
    ctx: &mut LowerCtx<'_>,
    table: &str,
    col: &ColumnDescriptor,
    alias: &str,
    target: GlobalId,
) -> LatticeResult<String> {
    let ColumnKind::List { target: target_table } = &col.kind else {
        unreachable!("caller checked the kind");
    };
    let link = link_table_name(table, target_table, &col.name);
    let j = ctx.fresh_alias();
    let p = ctx.bind(rusqlite::types::Value::Text(target.to_string()));
    Ok(format!(
        "EXISTS (SELECT 1 FROM {} {j} WHERE {j}.lhs = {alias}.global_id AND {j}.rhs = {p})",
        quote_ident(&link)
    ))
}

type LeafLower<'f> = dyn Fn(
        &mut LowerCtx<'_>,
        &str,
        &ColumnDescriptor,
        &str,
    ) -> LatticeResult<String>
    + 'f;

/// Resolve a column path. A single segment hits this table; two segments
/// traverse one link or list column into its target table.
fn lower_path(
    ctx: &mut LowerCtx<'_>,
    desc: &TableDescriptor,
    alias: &str,
    path: &[String],
    leaf: &LeafLower<'_>,
) -> LatticeResult<String> {
    match path {
        [name] => {
            let col = scalar_column(desc, name)?;
            leaf(ctx, &desc.name, col, alias)
        }
        [head, tail] => {
            let col = desc.column(head).ok_or_else(|| {
                LatticeError::query_invalid(&desc.name, format!("unknown column '{head}'"))
            })?;
            match &col.kind {
                ColumnKind::Link { target } => {
                    let target_desc = ctx.registry.descriptor(target)?;
                    let t2 = ctx.fresh_alias();
                    let inner_col = scalar_column(&target_desc, tail)?;
                    let inner = leaf(ctx, &target_desc.name, inner_col, &t2)?;
                    Ok(format!(
                        "EXISTS (SELECT 1 FROM {} {t2} WHERE {t2}.global_id = {alias}.{} AND {inner})",
                        quote_ident(target),
                        quote_ident(head)
                    ))
                }
                ColumnKind::List { target } => {
                    let target_desc = ctx.registry.descriptor(target)?;
                    let link = link_table_name(&desc.name, target, head);
                    let j = ctx.fresh_alias();
                    let t2 = ctx.fresh_alias();
                    let inner_col = scalar_column(&target_desc, tail)?;
                    let inner = leaf(ctx, &target_desc.name, inner_col, &t2)?;
                    Ok(format!(
                        "EXISTS (SELECT 1 FROM {} {j} JOIN {} {t2} ON {t2}.global_id = {j}.rhs \
                         WHERE {j}.lhs = {alias}.global_id AND {inner})",
                        quote_ident(&link),
                        quote_ident(target)
                    ))
                }
                _ => Err(LatticeError::query_invalid(
                    &desc.name,
                    format!("column '{head}' is not a link and cannot be traversed"),
                )),
            }
        }
        _ => Err(LatticeError::query_invalid(
            &desc.name,
            "predicate paths traverse at most one link",
        )),
    }
}
