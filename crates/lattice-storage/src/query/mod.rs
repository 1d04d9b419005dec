//! Composable, typed query builder lowered to exactly one kernel select.
//!
//! Chained proximity nodes (geo nearest, vector k-NN, full-text match)
//! become one CTE per bucket yielding `(pk, distance)`, joined on primary
//! key, so a combined nearest query intersects its candidate sets in a
//! single statement. All tie-breaks are primary key ascending.

pub mod predicate;
pub mod results;
pub mod text;
pub mod union;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use lattice_core::schema::{ColumnKind, TableDescriptor, VectorMetric};
use lattice_core::value::vector_to_blob;
use lattice_core::{GeoPoint, GlobalId, LatticeError, LatticeResult, Value};

use crate::kernel::rows::FieldMap;
use crate::schema::ddl::{fts_table_name, physical_columns, quote_ident, rtree_table_name};
use crate::store::StoreShared;

pub use predicate::{col, ColumnRef, Predicate};
pub use results::{NearestMatch, QueryCancellation, ResultRow, Results};
pub use text::TextQuery;
pub use union::{VirtualQuery, VirtualRow};

use predicate::LowerCtx;

const METERS_PER_DEGREE: f64 = 111_320.0;

/// A geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// The box that encloses a circle around `center`.
    pub fn around(center: GeoPoint, radius_m: f64) -> Self {
        let dlat = radius_m / METERS_PER_DEGREE;
        let dlon = radius_m / (METERS_PER_DEGREE * center.lat.to_radians().cos().abs().max(1e-6));
        Self {
            min_lat: center.lat - dlat,
            max_lat: center.lat + dlat,
            min_lon: center.lon - dlon,
            max_lon: center.lon + dlon,
        }
    }
}

#[derive(Clone)]
enum ProximityNode {
    Geo {
        column: String,
        center: GeoPoint,
        radius_m: f64,
        limit: Option<usize>,
        sort_by_distance: bool,
    },
    Vector {
        column: String,
        query: Vec<f32>,
        k: usize,
        metric: Option<VectorMetric>,
    },
    Text {
        column: String,
        query: TextQuery,
        limit: Option<usize>,
    },
}

impl ProximityNode {
    fn column(&self) -> &str {
        match self {
            ProximityNode::Geo { column, .. }
            | ProximityNode::Vector { column, .. }
            | ProximityNode::Text { column, .. } => column,
        }
    }
}

/// An immutable query node; every chained operation returns a new node.
#[derive(Clone)]
pub struct Query {
    pub(crate) shared: Arc<StoreShared>,
    pub(crate) table: String,
    pred: Option<Predicate>,
    orders: Vec<(String, bool)>,
    distance_order: Option<String>,
    group: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    bbox: Vec<(String, GeoBounds)>,
    proximity: Vec<ProximityNode>,
}

impl Query {
    pub(crate) fn new(shared: Arc<StoreShared>, table: String) -> Self {
        Self {
            shared,
            table,
            pred: None,
            orders: Vec::new(),
            distance_order: None,
            group: None,
            limit: None,
            offset: None,
            bbox: Vec::new(),
            proximity: Vec::new(),
        }
    }

    /// AND-compose a predicate with any existing one.
    pub fn filter(mut self, pred: Predicate) -> Self {
        self.pred = Some(match self.pred.take() {
            Some(existing) => existing.and(pred),
            None => pred,
        });
        self
    }

    /// Stable ordering; equal keys tie-break on primary key ascending.
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.orders.push((column.into(), ascending));
        self
    }

    /// Choose which proximity bucket's distance drives `ORDER BY`.
    pub fn order_by_distance(mut self, column: impl Into<String>) -> Self {
        self.distance_order = Some(column.into());
        self
    }

    /// One representative row per distinct value of `column`: the first
    /// row per group under the effective order (smallest primary key when
    /// no order is requested).
    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group = Some(column.into());
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

    /// R*Tree bounding-box pre-filter; intersects with other predicates.
    pub fn within_bounds(mut self, column: impl Into<String>, bounds: GeoBounds) -> Self {
        self.bbox.push((column.into(), bounds));
        self
    }

    /// Geographic nearest: R*Tree pre-filter then haversine within
    /// `radius_m` meters of `center`.
    pub fn nearest_geo(
        mut self,
        column: impl Into<String>,
        center: GeoPoint,
        radius_m: f64,
        limit: Option<usize>,
        sort_by_distance: bool,
    ) -> Self {
        self.proximity.push(ProximityNode::Geo {
            column: column.into(),
            center,
            radius_m,
            limit,
            sort_by_distance,
        });
        self
    }

    /// Vector k-NN under the requested metric (store default when `None`).
    pub fn nearest_vector(
        mut self,
        column: impl Into<String>,
        query: Vec<f32>,
        k: usize,
        metric: Option<VectorMetric>,
    ) -> Self {
        self.proximity.push(ProximityNode::Vector {
            column: column.into(),
            query,
            k,
            metric,
        });
        self
    }

    /// Full-text match; bm25 rank is the bucket's distance.
    pub fn matching(
        mut self,
        column: impl Into<String>,
        query: impl Into<TextQuery>,
        limit: Option<usize>,
    ) -> Self {
        self.proximity.push(ProximityNode::Text {
            column: column.into(),
            query: query.into(),
            limit,
        });
        self
    }

    /// The live results of this query.
    pub fn results(&self) -> Results {
        Results::new(self.clone())
    }

    /// Execute and count. Live: re-executes against current store state.
    pub fn count(&self) -> LatticeResult<usize> {
        let plan = self.build(None, None)?;
        let sql = format!("SELECT COUNT(*) FROM ({})", plan.sql);
        self.shared.kernel.read(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let n: i64 =
                stmt.query_row(rusqlite::params_from_iter(plan.params.clone()), |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Execute with an optional extra window narrowing (used by the
    /// batched cursor), returning decoded rows.
    pub(crate) fn fetch(
        &self,
        window_limit: Option<usize>,
        window_offset: Option<usize>,
    ) -> LatticeResult<Vec<ResultRow>> {
        let desc = self.shared.kernel.descriptor(&self.table)?;
        let plan = self.build(window_limit, window_offset)?;
        self.shared.kernel.read(|conn| {
            let mut stmt = conn.prepare_cached(&plan.sql)?;
            let mut raw = stmt.query(rusqlite::params_from_iter(plan.params.clone()))?;
            let mut out = Vec::new();
            while let Some(row) = raw.next()? {
                out.push(decode_result_row(row, &desc, &plan.distance_columns)?);
            }
            Ok(out)
        })
    }

    /// Lower the builder tree to one SELECT.
    fn build(
        &self,
        window_limit: Option<usize>,
        window_offset: Option<usize>,
    ) -> LatticeResult<SelectPlan> {
        let desc = self.shared.kernel.descriptor(&self.table)?;
        let registry = &self.shared.kernel.registry;
        let mut ctx = LowerCtx::new(registry);

        // ── Proximity CTEs ──────────────────────────────────────────────
        let mut ctes: Vec<String> = Vec::new();
        let mut joins: Vec<String> = Vec::new();
        let mut distance_columns: Vec<String> = Vec::new();
        for (i, node) in self.proximity.iter().enumerate() {
            let cte = format!("prox{i}");
            let body = self.lower_proximity(&desc, &mut ctx, node)?;
            ctes.push(format!("{cte} AS ({body})"));
            joins.push(format!("JOIN {cte} ON {cte}.pk = t.pk"));
            distance_columns.push(node.column().to_string());
        }

        // ── WHERE ───────────────────────────────────────────────────────
        let mut where_parts: Vec<String> = Vec::new();
        for (column, bounds) in &self.bbox {
            where_parts.push(self.lower_bbox(&desc, &mut ctx, column, *bounds)?);
        }
        if let Some(pred) = &self.pred {
            where_parts.push(predicate::lower(&mut ctx, &desc, "t", pred)?);
        }

        // ── ORDER BY ────────────────────────────────────────────────────
        let order_terms = self.order_terms(&desc)?;

        // ── SELECT list ─────────────────────────────────────────────────
        let mut select_parts = vec![
            "t.pk AS pk".to_string(),
            "t.global_id AS global_id".to_string(),
        ];
        for column in &desc.columns {
            for name in physical_columns(column) {
                select_parts.push(format!("t.{0} AS {0}", quote_ident(&name)));
            }
        }
        for i in 0..self.proximity.len() {
            select_parts.push(format!("prox{i}.dist AS __dist_{i}"));
        }

        let with = if ctes.is_empty() {
            String::new()
        } else {
            format!("WITH {} ", ctes.join(", "))
        };
        let where_sql = if where_parts.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", where_parts.join(" AND "))
        };

        let mut sql = match &self.group {
            None => {
                let order_sql = order_by_clause(&order_terms, OrderSide::Inner);
                format!(
                    "{with}SELECT {} FROM {} t {}{}{}",
                    select_parts.join(", "),
                    quote_ident(&self.table),
                    joins.join(" "),
                    where_sql,
                    order_sql,
                )
            }
            Some(group_col) => {
                let col = desc.column(group_col).ok_or_else(|| {
                    LatticeError::query_invalid(&self.table, format!("unknown column '{group_col}'"))
                })?;
                if matches!(col.kind, ColumnKind::Geo | ColumnKind::Vector { .. } | ColumnKind::List { .. }) {
                    return Err(LatticeError::query_invalid(
                        &self.table,
                        format!("cannot group by column '{group_col}'"),
                    ));
                }
                let partition_order = if order_terms.is_empty() {
                    "t.pk ASC".to_string()
                } else {
                    order_terms
                        .iter()
                        .map(|t| format!("{} {}", t.inner, t.dir()))
                        .chain(std::iter::once("t.pk ASC".to_string()))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                let inner = format!(
                    "{with}SELECT {}, ROW_NUMBER() OVER (PARTITION BY t.{} ORDER BY {partition_order}) AS __rn \
                     FROM {} t {}{}",
                    select_parts.join(", "),
                    quote_ident(group_col),
                    quote_ident(&self.table),
                    joins.join(" "),
                    where_sql,
                );
                let projected: Vec<String> = select_parts
                    .iter()
                    .map(|p| {
                        p.rsplit(" AS ")
                            .next()
                            .unwrap_or(p)
                            .to_string()
                    })
                    .collect();
                let order_sql = order_by_clause(&order_terms, OrderSide::Outer);
                format!(
                    "SELECT {} FROM ({inner}) WHERE __rn = 1{order_sql}",
                    projected.join(", ")
                )
            }
        };

        // ── Window ──────────────────────────────────────────────────────
        // A caller-supplied window (snapshot, cursor batch) is relative to
        // the query's own limit/offset.
        let win_offset = window_offset.unwrap_or(0);
        let effective_limit = match (self.limit, window_limit) {
            (None, w) => w,
            (Some(l), None) => Some(l),
            (Some(l), Some(w)) => Some(w.min(l.saturating_sub(win_offset))),
        };
        let effective_offset = self.offset.unwrap_or(0) + win_offset;
        if effective_limit.is_some() || effective_offset > 0 {
            let limit_p = ctx.bind(rusqlite::types::Value::Integer(
                effective_limit.map(|l| l as i64).unwrap_or(-1),
            ));
            let offset_p = ctx.bind(rusqlite::types::Value::Integer(effective_offset as i64));
            sql.push_str(&format!(" LIMIT {limit_p} OFFSET {offset_p}"));
        }

        Ok(SelectPlan {
            sql,
            params: ctx.params,
            distance_columns,
        })
    }

    fn lower_proximity(
        &self,
        desc: &TableDescriptor,
        ctx: &mut LowerCtx<'_>,
        node: &ProximityNode,
    ) -> LatticeResult<String> {
        match node {
            ProximityNode::Geo {
                column,
                center,
                radius_m,
                limit,
                ..
            } => {
                self.require_indexed(desc, column, |k| matches!(k, ColumnKind::Geo), "geo")?;
                let rtree = quote_ident(&rtree_table_name(&self.table, column));
                let bounds = GeoBounds::around(*center, *radius_m);
                let plat = ctx.bind(rusqlite::types::Value::Real(center.lat));
                let plon = ctx.bind(rusqlite::types::Value::Real(center.lon));
                let pmin_lat = ctx.bind(rusqlite::types::Value::Real(bounds.min_lat));
                let pmax_lat = ctx.bind(rusqlite::types::Value::Real(bounds.max_lat));
                let pmin_lon = ctx.bind(rusqlite::types::Value::Real(bounds.min_lon));
                let pmax_lon = ctx.bind(rusqlite::types::Value::Real(bounds.max_lon));
                let pradius = ctx.bind(rusqlite::types::Value::Real(*radius_m));
                let mut sql = format!(
                    "SELECT pk, dist FROM (SELECT id AS pk, \
                     lattice_haversine({plat}, {plon}, min_lat, min_lon) AS dist FROM {rtree} \
                     WHERE min_lat >= {pmin_lat} AND max_lat <= {pmax_lat} \
                     AND min_lon >= {pmin_lon} AND max_lon <= {pmax_lon}) \
                     WHERE dist <= {pradius}"
                );
                if let Some(n) = limit {
                    let pn = ctx.bind(rusqlite::types::Value::Integer(*n as i64));
                    sql.push_str(&format!(" ORDER BY dist ASC, pk ASC LIMIT {pn}"));
                }
                Ok(sql)
            }
            ProximityNode::Vector {
                column,
                query,
                k,
                metric,
            } => {
                let col = self.require_indexed(
                    desc,
                    column,
                    |k| matches!(k, ColumnKind::Vector { .. }),
                    "vector",
                )?;
                if let ColumnKind::Vector { dims, metric: declared } = &col.kind {
                    if query.len() != *dims {
                        return Err(LatticeError::query_invalid(
                            &self.table,
                            format!(
                                "vector query has {} dimensions, column '{column}' has {dims}",
                                query.len()
                            ),
                        ));
                    }
                    let metric = metric
                        .or(*declared)
                        .unwrap_or(self.shared.config.vector_metric_default);
                    let pq = ctx.bind(rusqlite::types::Value::Blob(vector_to_blob(query)));
                    let pm =
                        ctx.bind(rusqlite::types::Value::Text(metric.as_str().to_string()));
                    let pk_limit = ctx.bind(rusqlite::types::Value::Integer(*k as i64));
                    let qc = quote_ident(column);
                    Ok(format!(
                        "SELECT t0.pk AS pk, lattice_vec_dist(t0.{qc}, {pq}, {pm}) AS dist \
                         FROM {} t0 WHERE t0.{qc} IS NOT NULL \
                         ORDER BY dist ASC, t0.pk ASC LIMIT {pk_limit}",
                        quote_ident(&self.table)
                    ))
                } else {
                    unreachable!("require_indexed checked the kind")
                }
            }
            ProximityNode::Text {
                column,
                query,
                limit,
            } => {
                self.require_indexed(desc, column, |k| matches!(k, ColumnKind::Text), "text")?;
                let fts = quote_ident(&fts_table_name(&self.table, column));
                let pq = ctx.bind(rusqlite::types::Value::Text(query.to_match_expr()));
                let mut sql = format!(
                    "SELECT rowid AS pk, bm25({fts}) AS dist FROM {fts} WHERE {fts} MATCH {pq} \
                     ORDER BY dist ASC, rowid ASC"
                );
                if let Some(n) = limit {
                    let pn = ctx.bind(rusqlite::types::Value::Integer(*n as i64));
                    sql.push_str(&format!(" LIMIT {pn}"));
                }
                Ok(sql)
            }
        }
    }

    fn lower_bbox(
        &self,
        desc: &TableDescriptor,
        ctx: &mut LowerCtx<'_>,
        column: &str,
        bounds: GeoBounds,
    ) -> LatticeResult<String> {
        self.require_indexed(desc, column, |k| matches!(k, ColumnKind::Geo), "geo")?;
        let rtree = quote_ident(&rtree_table_name(&self.table, column));
        let pmin_lat = ctx.bind(rusqlite::types::Value::Real(bounds.min_lat));
        let pmax_lat = ctx.bind(rusqlite::types::Value::Real(bounds.max_lat));
        let pmin_lon = ctx.bind(rusqlite::types::Value::Real(bounds.min_lon));
        let pmax_lon = ctx.bind(rusqlite::types::Value::Real(bounds.max_lon));
        Ok(format!(
            "t.pk IN (SELECT id FROM {rtree} WHERE min_lat >= {pmin_lat} AND max_lat <= {pmax_lat} \
             AND min_lon >= {pmin_lon} AND max_lon <= {pmax_lon})"
        ))
    }

    fn require_indexed<'d>(
        &self,
        desc: &'d TableDescriptor,
        column: &str,
        kind_ok: impl Fn(&ColumnKind) -> bool,
        expected: &str,
    ) -> LatticeResult<&'d lattice_core::ColumnDescriptor> {
        let col = desc.column(column).ok_or_else(|| {
            LatticeError::query_invalid(&self.table, format!("unknown column '{column}'"))
        })?;
        if !kind_ok(&col.kind) {
            return Err(LatticeError::query_invalid(
                &self.table,
                format!("column '{column}' is not a {expected} column"),
            ));
        }
        if !col.indexed {
            return Err(LatticeError::query_invalid(
                &self.table,
                format!("proximity query against non-indexed column '{column}'"),
            ));
        }
        Ok(col)
    }

    /// Resolve the effective ordering. Distance sorts reference the CTE
    /// expression on the inner side and the projected alias on the outer
    /// (grouped) side; the primary-key tie-break is always appended.
    fn order_terms(&self, desc: &TableDescriptor) -> LatticeResult<Vec<OrderTerm>> {
        let mut terms = Vec::new();

        if let Some(column) = &self.distance_order {
            let index = self
                .proximity
                .iter()
                .position(|n| n.column() == column)
                .ok_or_else(|| {
                    LatticeError::query_invalid(
                        &self.table,
                        format!("no proximity constraint on column '{column}' to sort by"),
                    )
                })?;
            terms.push(OrderTerm::distance(index, true));
        } else if !self.orders.is_empty() {
            for (column, ascending) in &self.orders {
                let col = desc.column(column).ok_or_else(|| {
                    LatticeError::query_invalid(&self.table, format!("unknown column '{column}'"))
                })?;
                match col.kind {
                    ColumnKind::Geo | ColumnKind::Vector { .. } | ColumnKind::List { .. } => {
                        return Err(LatticeError::query_invalid(
                            &self.table,
                            format!("cannot order by column '{column}'"),
                        ))
                    }
                    _ => {}
                }
                terms.push(OrderTerm::column(column, *ascending));
            }
        } else if !self.proximity.is_empty() {
            let index = self
                .proximity
                .iter()
                .position(|n| matches!(n, ProximityNode::Geo { sort_by_distance: true, .. }))
                .unwrap_or(0);
            terms.push(OrderTerm::distance(index, true));
        }

        terms.push(OrderTerm {
            inner: "t.pk".to_string(),
            outer: "pk".to_string(),
            ascending: true,
        });
        Ok(terms)
    }
}

struct OrderTerm {
    inner: String,
    outer: String,
    ascending: bool,
}

impl OrderTerm {
    fn column(name: &str, ascending: bool) -> Self {
        Self {
            inner: format!("t.{}", quote_ident(name)),
            outer: quote_ident(name),
            ascending,
        }
    }

    fn distance(index: usize, ascending: bool) -> Self {
        Self {
            inner: format!("prox{index}.dist"),
            outer: format!("__dist_{index}"),
            ascending,
        }
    }

    fn dir(&self) -> &'static str {
        if self.ascending {
            "ASC"
        } else {
            "DESC"
        }
    }
}

enum OrderSide {
    Inner,
    Outer,
}

fn order_by_clause(terms: &[OrderTerm], side: OrderSide) -> String {
    if terms.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = terms
        .iter()
        .map(|t| {
            let expr = match side {
                OrderSide::Inner => &t.inner,
                OrderSide::Outer => &t.outer,
            };
            format!("{expr} {}", t.dir())
        })
        .collect();
    format!(" ORDER BY {}", parts.join(", "))
}

struct SelectPlan {
    sql: String,
    params: Vec<rusqlite::types::Value>,
    distance_columns: Vec<String>,
}

/// Decode one result row: `pk, global_id, <physical columns>, distances`.
fn decode_result_row(
    row: &rusqlite::Row<'_>,
    desc: &TableDescriptor,
    distance_columns: &[String],
) -> LatticeResult<ResultRow> {
    let pk: i64 = row.get(0)?;
    let gid: String = row.get(1)?;
    let mut fields = FieldMap::default();
    let mut idx = 2;
    for column in &desc.columns {
        match &column.kind {
            ColumnKind::List { .. } => continue,
            ColumnKind::Geo => {
                let lat: Option<f64> = row.get(idx)?;
                let lon: Option<f64> = row.get(idx + 1)?;
                idx += 2;
                let value = match (lat, lon) {
                    (Some(lat), Some(lon)) => Value::Geo(GeoPoint::new(lat, lon)),
                    _ => Value::Null,
                };
                fields.insert(column.name.clone(), value);
            }
            kind => {
                let raw: rusqlite::types::Value = row.get(idx)?;
                idx += 1;
                fields.insert(column.name.clone(), Value::from_sql_value(raw, kind)?);
            }
        }
    }
    let mut distances = FxHashMap::default();
    for column in distance_columns {
        let dist: Option<f64> = row.get(idx)?;
        idx += 1;
        if let Some(dist) = dist {
            distances.insert(column.clone(), dist);
        }
    }
    Ok(ResultRow {
        primary_key: pk,
        global_id: GlobalId::parse(&gid)?,
        fields,
        distances,
    })
}
