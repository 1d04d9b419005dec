//! Row and collection event types consumed by the observation bus.

use crate::audit::AuditOp;

/// Structured event emitted by every mutating kernel operation, consumed
/// by the change log before commit returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEvent {
    pub op: AuditOp,
    pub table: String,
    pub primary_key: i64,
}

/// A membership change delivered to collection observers. Updates are not
/// surfaced here; row observers cover them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionChange {
    Insert { primary_key: i64 },
    Delete { primary_key: i64 },
}

impl CollectionChange {
    pub fn primary_key(&self) -> i64 {
        match self {
            CollectionChange::Insert { primary_key } | CollectionChange::Delete { primary_key } => {
                *primary_key
            }
        }
    }
}
