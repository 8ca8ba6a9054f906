//! SQLite-backed store.
//!
//! One `kv` table keyed by `(partition, key)`, WAL mode so readers in other
//! processes don't block the writer. Each operation is a single statement in
//! auto-commit mode, which is what gives the queue its single-key atomicity.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use super::{Direction, KvStore};
use crate::error::{Error, Result};

/// How long a statement waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store backend. Owns the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        // Other processes may hold the write lock on a shared file.
        conn.busy_timeout(BUSY_TIMEOUT)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                partition   TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                PRIMARY KEY (partition, key)
            ) WITHOUT ROWID;
            ",
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::LockPoisoned(format!("sqlite connection: {e}")))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, partition: &str, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE partition = ?1 AND key = ?2",
                params![partition, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, partition: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (partition, key, value) VALUES (?1, ?2, ?3)",
            params![partition, key, value],
        )?;
        Ok(())
    }

    fn insert(&self, partition: &str, key: &str, value: &str) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO kv (partition, key, value) VALUES (?1, ?2, ?3)",
            params![partition, key, value],
        )?;
        Ok(inserted == 1)
    }

    fn remove(&self, partition: &str, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM kv WHERE partition = ?1 AND key = ?2",
            params![partition, key],
        )?;
        Ok(deleted > 0)
    }

    fn size(&self, partition: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE partition = ?1",
            params![partition],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn truncate(&self, partition: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE partition = ?1", params![partition])?;
        Ok(())
    }

    fn scan(
        &self,
        partition: &str,
        from: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let sql = match direction {
            Direction::Ascending => {
                "SELECT key, value FROM kv WHERE partition = ?1 AND key >= ?2 ORDER BY key ASC LIMIT ?3"
            }
            Direction::Descending => {
                "SELECT key, value FROM kv WHERE partition = ?1 AND key <= ?2 ORDER BY key DESC LIMIT ?3"
            }
        };

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let entries = stmt
            .query_map(params![partition, from, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}
