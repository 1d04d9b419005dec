//! SQLite PRAGMA configuration.
//!
//! Must be called on every connection immediately after opening.

use rusqlite::Connection;

use lattice_core::LatticeResult;

/// Prepared-statement cache capacity per connection. Generated SQL is
/// deterministic per query shape, so statement text doubles as the shape key.
pub const STATEMENT_CACHE_CAPACITY: usize = 256;

/// Configure a read-write SQLite connection:
/// - WAL for concurrent readers during writes
/// - busy_timeout for lock contention (primary concurrency mechanism)
/// - mmap for faster reads on large tables
/// - NORMAL synchronous for WAL durability trade-off
pub fn configure_connection(conn: &Connection) -> LatticeResult<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA cache_size = -8000;
        PRAGMA mmap_size = 268435456;
        PRAGMA temp_store = MEMORY;
        ",
    )?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(())
}

/// Configure a read-only connection. Same PRAGMAs plus `query_only = ON`
/// to prevent accidental writes through this connection.
pub fn configure_readonly_connection(conn: &Connection) -> LatticeResult<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        PRAGMA cache_size = -8000;
        PRAGMA mmap_size = 268435456;
        PRAGMA temp_store = MEMORY;
        PRAGMA query_only = ON;
        ",
    )?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(())
}
