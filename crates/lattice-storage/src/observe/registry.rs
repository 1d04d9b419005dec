//! Process-wide instance registry: `(table, primary_key)` → live managed
//! handles. Holds weak references only, so registration never keeps a row
//! alive. Handles register on transition to Managed and deregister on
//! destruction.

use std::sync::{Mutex, Weak};

use rustc_hash::FxHashMap;

use crate::rows::RowInner;

#[derive(Default)]
pub struct InstanceRegistry {
    map: Mutex<FxHashMap<(String, i64), Vec<(u64, Weak<RowInner>)>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, table: &str, pk: i64, handle_id: u64, weak: Weak<RowInner>) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.entry((table.to_string(), pk))
            .or_default()
            .push((handle_id, weak));
    }

    pub(crate) fn deregister(&self, table: &str, pk: i64, handle_id: u64) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entries) = map.get_mut(&(table.to_string(), pk)) {
            entries.retain(|(id, weak)| *id != handle_id && weak.strong_count() > 0);
            if entries.is_empty() {
                map.remove(&(table.to_string(), pk));
            }
        }
    }

    /// A live handle for the row, if any view of it is still in memory.
    pub(crate) fn live_handle(&self, table: &str, pk: i64) -> Option<std::sync::Arc<RowInner>> {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        let entries = map.get_mut(&(table.to_string(), pk))?;
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.iter().find_map(|(_, weak)| weak.upgrade())
    }

    /// Number of live handles for a row.
    pub fn live_count(&self, table: &str, pk: i64) -> usize {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        match map.get_mut(&(table.to_string(), pk)) {
            None => 0,
            Some(entries) => {
                entries.retain(|(_, weak)| weak.strong_count() > 0);
                entries.len()
            }
        }
    }

    /// Drop all registrations for a deleted row.
    pub(crate) fn clear_row(&self, table: &str, pk: i64) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&(table.to_string(), pk));
    }
}
