//! Store configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{LatticeError, LatticeResult};
use crate::schema::VectorMetric;

fn default_read_pool_size() -> usize {
    2
}

/// Configuration for opening a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the store file; journal/WAL auxiliaries are co-located.
    pub path: PathBuf,
    /// When set, `path` resolves to an ephemeral store discarded at shutdown.
    #[serde(default)]
    pub in_memory: bool,
    /// Metric used by vector queries that do not request one explicitly.
    #[serde(default)]
    pub vector_metric_default: VectorMetric,
    /// Number of read-only connections over the WAL snapshot.
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,
}

impl StoreConfig {
    /// A file-backed store at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            in_memory: false,
            vector_metric_default: VectorMetric::default(),
            read_pool_size: default_read_pool_size(),
        }
    }

    /// An ephemeral in-memory store.
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            in_memory: true,
            vector_metric_default: VectorMetric::default(),
            read_pool_size: 0,
        }
    }

    pub fn with_vector_metric(mut self, metric: VectorMetric) -> Self {
        self.vector_metric_default = metric;
        self
    }

    /// Load from a TOML file.
    pub fn from_toml_file(path: &Path) -> LatticeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| LatticeError::Io {
            message: format!("config parse: {e}"),
        })?;
        tracing::debug!(path = %path.display(), "loaded store config");
        Ok(config)
    }
}
