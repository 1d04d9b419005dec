//! # lattice-core
//!
//! Foundation crate for the Lattice object store.
//! Defines the value model, schema descriptors, error taxonomy, audit
//! records, config, events, and tracing bootstrap.
//! Every other crate in the workspace depends on this.

pub mod audit;
pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod schema;
pub mod telemetry;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use audit::{AuditEntry, AuditOp, SyncPayload};
pub use config::StoreConfig;
pub use errors::{LatticeError, LatticeResult};
pub use events::{CollectionChange, RowEvent};
pub use ids::{GlobalId, SendableRef};
pub use schema::{
    ColumnDescriptor, ColumnKind, Schema, TableDescriptor, UniqueConstraint, VectorMetric,
};
pub use value::{GeoPoint, Value};

/// Helper to convert an arbitrary storage-level message into `LatticeError::Io`.
pub fn to_io_err(msg: String) -> LatticeError {
    LatticeError::Io { message: msg }
}
