//! # lattice-storage
//!
//! SQLite persistence engine for the Lattice object store.
//! Single write connection + read pool (WAL mode); schema registry with
//! reconciliation and migrations; dynamic managed/unmanaged rows; durable
//! audit log with remote replay; observation bus with cross-instance
//! coherence; composable query engine with spatial/vector/text proximity.

pub mod audit;
pub mod kernel;
pub mod migrate;
pub mod observe;
pub mod query;
pub mod rows;
pub mod schema;
pub mod store;

pub use migrate::MigrationPlan;
pub use observe::{ExecutionContext, ObserverToken};
pub use query::{col, Query, Results, VirtualQuery};
pub use rows::DynamicRow;
pub use store::Store;
