//! Identifier types: 128-bit global ids and sendable row references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{LatticeError, LatticeResult};

/// A random 128-bit identifier, unique across replicas of a store and
/// stable for the lifetime of the row (or audit entry) it names.
/// Stored on disk as hyphenated lowercase TEXT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(Uuid);

impl GlobalId {
    /// Allocate a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the on-disk TEXT representation.
    pub fn parse(s: &str) -> LatticeResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| LatticeError::Io {
                message: format!("malformed global id '{s}': {e}"),
            })
    }

    /// The raw 128-bit value, used for deterministic tie-breaks.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({})", self.0.hyphenated())
    }
}

impl FromStr for GlobalId {
    type Err = LatticeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A plain-value reference to a managed row, safe to move across threads.
///
/// Carries `(table, primary_key)` only; resolution on the destination
/// context re-acquires a managed handle from the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendableRef {
    pub table: String,
    pub primary_key: i64,
}

impl SendableRef {
    pub fn new(table: impl Into<String>, primary_key: i64) -> Self {
        Self {
            table: table.into(),
            primary_key,
        }
    }
}
