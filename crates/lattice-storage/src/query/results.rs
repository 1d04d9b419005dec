//! Live query results: re-executing count, snapshot windows, and a
//! batched cursor that re-issues the query instead of paying per-row
//! offset cost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use lattice_core::{GlobalId, LatticeResult};

use crate::kernel::rows::FieldMap;
use crate::rows::DynamicRow;

use super::Query;

/// Cursor batch size: each fetch re-issues the query for the next window.
const CURSOR_BATCH: usize = 100;

/// One decoded result row, with the per-column distance map filled by any
/// proximity constraints the query carried.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub primary_key: i64,
    pub global_id: GlobalId,
    pub fields: FieldMap,
    pub distances: FxHashMap<String, f64>,
}

impl ResultRow {
    pub fn get(&self, name: &str) -> Option<&lattice_core::Value> {
        self.fields.get(name)
    }

    pub fn distance(&self, column: &str) -> Option<f64> {
        self.distances.get(column).copied()
    }
}

/// A (managed row, distances) pair returned by proximity queries.
pub struct NearestMatch {
    pub row: DynamicRow,
    pub distances: FxHashMap<String, f64>,
}

/// Cooperative cancellation for result iteration. Checked between cursor
/// batches; cancelling ends iteration without an error.
#[derive(Clone, Default)]
pub struct QueryCancellation {
    flag: Arc<AtomicBool>,
}

impl QueryCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A live collection: `count` and indexing re-execute against the current
/// store state.
pub struct Results {
    query: Query,
    cancellation: Option<QueryCancellation>,
}

impl Results {
    pub(crate) fn new(query: Query) -> Self {
        Self {
            query,
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, token: QueryCancellation) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Live row count at this instant.
    pub fn count(&self) -> LatticeResult<usize> {
        self.query.count()
    }

    /// Materialize one window of the current results.
    pub fn snapshot(&self, limit: usize, offset: usize) -> LatticeResult<Vec<ResultRow>> {
        self.query.fetch(Some(limit), Some(offset))
    }

    /// Materialize the whole current result set.
    pub fn all(&self) -> LatticeResult<Vec<ResultRow>> {
        self.query.fetch(None, None)
    }

    /// Row at `index` against current store state.
    pub fn at(&self, index: usize) -> LatticeResult<Option<ResultRow>> {
        Ok(self.query.fetch(Some(1), Some(index))?.into_iter().next())
    }

    pub fn first(&self) -> LatticeResult<Option<ResultRow>> {
        self.at(0)
    }

    /// Materialize as managed rows paired with their distance maps.
    pub fn nearest_matches(&self) -> LatticeResult<Vec<NearestMatch>> {
        let rows = self.all()?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(NearestMatch {
                row: self
                    .query
                    .shared
                    .managed_row(&self.query.table, row.primary_key)?,
                distances: row.distances,
            });
        }
        Ok(out)
    }

    /// Batched cursor over the current results. Each batch re-issues the
    /// query; the cancellation token is checked between batches.
    pub fn iter(&self) -> ResultsIter<'_> {
        ResultsIter {
            results: self,
            buffer: VecDeque::new(),
            fetched: 0,
            exhausted: false,
        }
    }
}

pub struct ResultsIter<'a> {
    results: &'a Results,
    buffer: VecDeque<ResultRow>,
    fetched: usize,
    exhausted: bool,
}

impl Iterator for ResultsIter<'_> {
    type Item = LatticeResult<ResultRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.buffer.pop_front() {
            return Some(Ok(row));
        }
        if self.exhausted {
            return None;
        }
        if let Some(token) = &self.results.cancellation {
            if token.is_cancelled() {
                self.exhausted = true;
                return None;
            }
        }
        let batch_size = match self.results.query.limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(self.fetched);
                if remaining == 0 {
                    self.exhausted = true;
                    return None;
                }
                remaining.min(CURSOR_BATCH)
            }
            None => CURSOR_BATCH,
        };
        match self
            .results
            .query
            .fetch(Some(batch_size), Some(self.fetched))
        {
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
            Ok(batch) => {
                if batch.len() < batch_size {
                    self.exhausted = true;
                }
                self.fetched += batch.len();
                self.buffer.extend(batch);
                self.buffer.pop_front().map(Ok)
            }
        }
    }
}
