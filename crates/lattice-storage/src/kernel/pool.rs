//! `ConnectionPool` — writer + read pool with round-robin selection.
//!
//! The only place in the engine that holds `Mutex<Connection>`. One writer
//! connection serializes all mutations; N read-only connections serve
//! concurrent reads against the WAL snapshot. A sibling `.lock` file holds
//! an exclusive advisory lock for the store's lifetime so a second process
//! cannot open the same file for writing.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rusqlite::Connection;

use lattice_core::{LatticeError, LatticeResult};

use super::functions::register_functions;
use super::pragmas::{configure_connection, configure_readonly_connection};

/// Connection pool: 1 writer + N readers, WAL on all connections.
#[derive(Debug)]
pub struct ConnectionPool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    read_index: AtomicUsize,
    path: Option<PathBuf>,
    // Held for the pool's lifetime; the fd closing on drop releases it.
    _file_lock: Option<fd_lock::RwLock<std::fs::File>>,
}

impl ConnectionPool {
    /// Open a file-backed pool with `read_pool_size` reader connections.
    pub fn open(path: &Path, read_pool_size: usize) -> LatticeResult<Self> {
        let open_failed = |message: String| LatticeError::OpenFailed {
            path: path.display().to_string(),
            message,
        };

        let lock_path = path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| open_failed(format!("lock file: {e}")))?;
        let mut file_lock = fd_lock::RwLock::new(lock_file);
        match file_lock.try_write() {
            Ok(guard) => {
                // Keep the advisory lock held until the pool drops and the
                // fd closes.
                std::mem::forget(guard);
            }
            Err(_) => {
                return Err(open_failed(
                    "store is locked by another process".to_string(),
                ))
            }
        }

        let writer =
            Connection::open(path).map_err(|e| open_failed(format!("writer: {e}")))?;
        configure_connection(&writer)?;
        register_functions(&writer)?;

        let mut readers = Vec::with_capacity(read_pool_size);
        for i in 0..read_pool_size {
            let reader = Connection::open_with_flags(
                path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| open_failed(format!("reader {i}: {e}")))?;
            configure_readonly_connection(&reader)?;
            register_functions(&reader)?;
            readers.push(Mutex::new(reader));
        }

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
            read_index: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
            _file_lock: Some(file_lock),
        })
    }

    /// Open an ephemeral in-memory pool. A single connection serves both
    /// roles; `with_reader` falls back to the writer.
    pub fn open_in_memory() -> LatticeResult<Self> {
        let writer = Connection::open_in_memory().map_err(|e| LatticeError::OpenFailed {
            path: ":memory:".to_string(),
            message: e.to_string(),
        })?;
        configure_connection(&writer)?;
        register_functions(&writer)?;

        Ok(Self {
            writer: Mutex::new(writer),
            readers: Vec::new(),
            read_index: AtomicUsize::new(0),
            path: None,
            _file_lock: None,
        })
    }

    /// Execute a closure with the writer connection.
    pub fn with_writer<F, T>(&self, f: F) -> LatticeResult<T>
    where
        F: FnOnce(&Connection) -> LatticeResult<T>,
    {
        let conn = self.writer.lock().map_err(|e| LatticeError::Io {
            message: format!("writer lock poisoned: {e}"),
        })?;
        f(&conn)
    }

    /// Execute a closure with a reader connection (round-robin). Falls back
    /// to the writer when no readers exist (in-memory mode).
    pub fn with_reader<F, T>(&self, f: F) -> LatticeResult<T>
    where
        F: FnOnce(&Connection) -> LatticeResult<T>,
    {
        if self.readers.is_empty() {
            return self.with_writer(f);
        }
        let index = self.read_index.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[index].lock().map_err(|e| LatticeError::Io {
            message: format!("reader lock poisoned: {e}"),
        })?;
        f(&conn)
    }

    /// WAL checkpoint on the writer connection.
    pub fn checkpoint(&self) -> LatticeResult<()> {
        self.with_writer(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Store file path (`None` for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_reads_fall_back_to_writer() {
        let pool = ConnectionPool::open_in_memory().unwrap();
        pool.with_writer(|conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER)")?;
            Ok(())
        })
        .unwrap();
        let n: i64 = pool
            .with_reader(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn second_open_of_same_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lattice");
        let _pool = ConnectionPool::open(&path, 1).unwrap();
        let err = ConnectionPool::open(&path, 1).unwrap_err();
        assert!(matches!(err, LatticeError::OpenFailed { .. }));
    }

    #[test]
    fn readers_see_committed_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.lattice");
        let pool = ConnectionPool::open(&path, 2).unwrap();
        pool.with_writer(|conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")?;
            Ok(())
        })
        .unwrap();
        let x: i64 = pool
            .with_reader(|conn| Ok(conn.query_row("SELECT x FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(x, 7);
    }
}
