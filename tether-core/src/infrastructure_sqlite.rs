//! SQLite-backed CoordinationStore implementation.
//! Several processes opening the same database file coordinate through it.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! tether-core = { path = "../tether-core", features = ["sqlite"] }
//! ```

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::StoreError;
use crate::infrastructure::CoordinationStore;
use crate::types::*;

/// How long a writer waits on another process's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Tables {
    locks: String,
    queue: String,
    schema: String,
    signals: String,
}

impl Tables {
    fn new(prefix: &str) -> Self {
        Self {
            locks: format!("{prefix}_locks"),
            queue: format!("{prefix}_queue"),
            schema: format!("{prefix}_schema"),
            signals: format!("{prefix}_signals"),
        }
    }
}

/// A persistent coordination store backed by SQLite.
///
/// Uses WAL mode for concurrent read performance.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: Tables,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path. `prefix` must
    /// already be validated (see `CoordinationOptions::validate`).
    pub fn open(path: impl AsRef<Path>, prefix: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, prefix)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory(prefix: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, prefix)
    }

    fn with_connection(conn: Connection, prefix: &str) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let store = Self {
            conn: Mutex::new(conn),
            tables: Tables::new(prefix),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
        Ok(QueueEntry {
            id: row.get(0)?,
            queue: row.get(1)?,
            job_id: row.get(2)?,
            fetched_at: row.get(3)?,
        })
    }
}

impl CoordinationStore for SqliteStore {
    fn insert_lock_if_absent(
        &self,
        resource: &str,
        expire_at: u64,
    ) -> Result<Option<LockRecord>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = tx
            .query_row(
                &format!(
                    "SELECT resource, expire_at FROM {} WHERE resource = ?1",
                    self.tables.locks
                ),
                params![resource],
                |row| Ok(LockRecord::new(row.get::<_, String>(0)?, row.get(1)?)),
            )
            .optional()?;

        if existing.is_none() {
            tx.execute(
                &format!(
                    "INSERT INTO {} (resource, expire_at) VALUES (?1, ?2)",
                    self.tables.locks
                ),
                params![resource, expire_at],
            )?;
        }
        tx.commit()?;
        Ok(existing)
    }

    fn extend_lock(
        &self,
        resource: &str,
        expire_at: u64,
    ) -> Result<Option<LockRecord>, StoreError> {
        let rows = self.conn().execute(
            &format!(
                "UPDATE {} SET expire_at = ?1 WHERE resource = ?2",
                self.tables.locks
            ),
            params![expire_at, resource],
        )?;
        Ok((rows > 0).then(|| LockRecord::new(resource, expire_at)))
    }

    fn delete_lock(&self, resource: &str) -> Result<bool, StoreError> {
        let rows = self.conn().execute(
            &format!("DELETE FROM {} WHERE resource = ?1", self.tables.locks),
            params![resource],
        )?;
        Ok(rows > 0)
    }

    fn delete_expired_locks(&self, resource: &str, now: u64) -> Result<usize, StoreError> {
        let rows = self.conn().execute(
            &format!(
                "DELETE FROM {} WHERE resource = ?1 AND expire_at < ?2",
                self.tables.locks
            ),
            params![resource, now],
        )?;
        Ok(rows)
    }

    fn find_lock(&self, resource: &str) -> Result<Option<LockRecord>, StoreError> {
        let record = self
            .conn()
            .query_row(
                &format!(
                    "SELECT resource, expire_at FROM {} WHERE resource = ?1",
                    self.tables.locks
                ),
                params![resource],
                |row| Ok(LockRecord::new(row.get::<_, String>(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(record)
    }

    fn list_locks(&self) -> Result<Vec<LockRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT resource, expire_at FROM {} ORDER BY resource",
            self.tables.locks
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(LockRecord::new(row.get::<_, String>(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "INSERT INTO {} (id, queue, job_id, fetched_at) VALUES (?1, ?2, ?3, ?4)",
                self.tables.queue
            ),
            params![entry.id, entry.queue, entry.job_id, entry.fetched_at],
        )?;
        Ok(())
    }

    fn fetch_queue_entry(
        &self,
        queue: &str,
        condition: FetchCondition,
        now: u64,
    ) -> Result<Option<QueueEntry>, StoreError> {
        // A single UPDATE ... RETURNING is atomic against concurrent fetchers.
        let (predicate, cutoff) = match condition {
            FetchCondition::Unfetched => ("fetched_at IS NULL", None),
            FetchCondition::FetchedBefore { cutoff } => {
                ("fetched_at IS NOT NULL AND fetched_at < ?3", Some(cutoff))
            }
        };
        let sql = format!(
            "UPDATE {table} SET fetched_at = ?1
             WHERE seq = (SELECT seq FROM {table} WHERE queue = ?2 AND {predicate} ORDER BY seq LIMIT 1)
             RETURNING id, queue, job_id, fetched_at",
            table = self.tables.queue,
        );

        let conn = self.conn();
        let entry = match cutoff {
            Some(cutoff) => conn
                .query_row(&sql, params![now, queue, cutoff], Self::row_to_entry)
                .optional()?,
            None => conn
                .query_row(&sql, params![now, queue], Self::row_to_entry)
                .optional()?,
        };
        Ok(entry)
    }

    fn delete_queue_entry(&self, id: &str) -> Result<bool, StoreError> {
        let rows = self.conn().execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.tables.queue),
            params![id],
        )?;
        Ok(rows > 0)
    }

    fn requeue_entry(&self, id: &str) -> Result<bool, StoreError> {
        let rows = self.conn().execute(
            &format!("UPDATE {} SET fetched_at = NULL WHERE id = ?1", self.tables.queue),
            params![id],
        )?;
        Ok(rows > 0)
    }

    fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let (enqueued, fetched) = self.conn().query_row(
            &format!(
                "SELECT COALESCE(SUM(fetched_at IS NULL), 0), COALESCE(SUM(fetched_at IS NOT NULL), 0)
                 FROM {} WHERE queue = ?1",
                self.tables.queue
            ),
            params![queue],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(QueueStats {
            queue: queue.to_string(),
            enqueued: enqueued as usize,
            fetched: fetched as usize,
        })
    }

    fn schema_version(&self) -> Result<Option<SchemaVersionRecord>, StoreError> {
        let version = self
            .conn()
            .query_row(
                &format!("SELECT version FROM {} WHERE id = 1", self.tables.schema),
                [],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(version.map(|v| SchemaVersionRecord {
            version: SchemaVersion::new(v),
        }))
    }

    fn set_schema_version(&self, version: SchemaVersion) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "INSERT INTO {} (id, version) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET version = excluded.version",
                self.tables.schema
            ),
            params![version.get()],
        )?;
        Ok(())
    }

    fn set_signal(&self, key: &str) -> Result<(), StoreError> {
        self.conn().execute(
            &format!("INSERT OR IGNORE INTO {} (key) VALUES (?1)", self.tables.signals),
            params![key],
        )?;
        Ok(())
    }

    fn take_signal(&self, keys: &[String]) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut taken = None;
        for key in keys {
            let rows = tx.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.tables.signals),
                params![key],
            )?;
            if rows > 0 {
                taken = Some(key.clone());
                break;
            }
        }
        tx.commit()?;
        Ok(taken)
    }

    fn drop_data(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for table in [&self.tables.queue, &self.tables.signals, &self.tables.schema] {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn ensure_layout(&self) -> Result<(), StoreError> {
        let t = &self.tables;
        self.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {locks} (
                resource  TEXT PRIMARY KEY,
                expire_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {queue} (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT NOT NULL UNIQUE,
                queue      TEXT NOT NULL,
                job_id     TEXT NOT NULL,
                fetched_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{queue}_queue ON {queue}(queue, fetched_at);
            CREATE TABLE IF NOT EXISTS {schema} (
                id      INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {signals} (
                key TEXT PRIMARY KEY
            );",
            locks = t.locks,
            queue = t.queue,
            schema = t.schema,
            signals = t.signals,
        ))?;
        Ok(())
    }
}
