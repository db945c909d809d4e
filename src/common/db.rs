//! SQLite-backed record store shared by the data and training domains.
//!
//! Every handle owns one connection. Several handles (threads or processes)
//! may open the same file; the guards that matter live in the schema:
//!
//! - `counters` holds the durable dataset version sequence, advanced only by
//!   compare-and-set inside an `IMMEDIATE` transaction;
//! - `version_members.record_id` is a primary key, so a correction can belong
//!   to at most one dataset version;
//! - `training_runs_live_key` is a partial unique index allowing at most one
//!   pending/running/succeeded run per (model, version).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, Transaction, TransactionBehavior};

use crate::common::error::{CoreError, CoreResult};
use crate::common::time;

/// Schema version recorded in `schema_migrations`.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const BUSY_TIMEOUT_MS: u64 = 5_000;
/// Attempts made by [`SqliteStore::write`] before surfacing a conflict.
const WRITE_ATTEMPTS: u32 = 8;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS corrections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    features_json TEXT NOT NULL,
    label_json TEXT NOT NULL,
    received_ms INTEGER NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0 CHECK (consumed IN (0, 1)),
    version_id INTEGER REFERENCES dataset_versions(id)
);
CREATE INDEX IF NOT EXISTS corrections_pending ON corrections(consumed, id);

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO counters(name, value) VALUES ('dataset_version', 0);

CREATE TABLE IF NOT EXISTS dataset_versions (
    id INTEGER PRIMARY KEY,
    created_ms INTEGER NOT NULL,
    split_ratio REAL NOT NULL,
    split_seed INTEGER NOT NULL,
    record_count INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('materializing', 'ready')),
    train_path TEXT,
    valid_path TEXT,
    manifest_path TEXT,
    train_count INTEGER,
    valid_count INTEGER
);

CREATE TABLE IF NOT EXISTS version_members (
    record_id INTEGER PRIMARY KEY REFERENCES corrections(id),
    version_id INTEGER NOT NULL REFERENCES dataset_versions(id),
    position INTEGER NOT NULL,
    UNIQUE(version_id, position)
);

CREATE TABLE IF NOT EXISTS models (
    name TEXT PRIMARY KEY,
    entry_point TEXT NOT NULL,
    config_ref TEXT NOT NULL,
    registered_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS training_runs (
    run_id TEXT PRIMARY KEY,
    model_name TEXT NOT NULL,
    version_id INTEGER NOT NULL REFERENCES dataset_versions(id),
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'running', 'succeeded', 'failed', 'cancelled')),
    metrics_json TEXT NOT NULL DEFAULT '{}',
    artifact_ref TEXT,
    cause TEXT,
    created_ms INTEGER NOT NULL,
    started_ms INTEGER,
    ended_ms INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS training_runs_live_key
    ON training_runs(model_name, version_id)
    WHERE status IN ('pending', 'running', 'succeeded');
CREATE INDEX IF NOT EXISTS training_runs_by_model ON training_runs(model_name, version_id);
";

/// Durable structured-record store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Apply the schema; idempotent.
    pub fn migrate(&self) -> CoreResult<()> {
        self.write(|tx| {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_ms INTEGER NOT NULL
                );",
            )?;
            tx.execute_batch(SCHEMA_V1)?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_ms) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, time::now_ms() as i64],
            )?;
            Ok(())
        })
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::storage("store connection lock poisoned"))
    }

    /// Run a read-only closure against the connection.
    pub fn read<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> CoreResult<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one `IMMEDIATE` transaction, retrying lock contention
    /// and lost compare-and-set races. Anything else rolls back and surfaces.
    pub fn write<T, F>(&self, mut f: F) -> CoreResult<T>
    where
        F: FnMut(&Transaction<'_>) -> CoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(&mut f) {
                Err(CoreError::ConcurrencyConflict(msg)) if attempt < WRITE_ATTEMPTS => {
                    tracing::debug!(attempt, %msg, "retrying store write after conflict");
                    thread::sleep(Duration::from_millis(2u64 << attempt.min(6)));
                }
                Err(CoreError::ConcurrencyConflict(msg)) => {
                    return Err(CoreError::storage(format!(
                        "gave up after {attempt} conflicting attempts: {msg}"
                    )));
                }
                other => return other,
            }
        }
    }

    /// Single transactional attempt; conflicts are returned, not retried.
    pub fn write_once<T, F>(&self, f: &mut F) -> CoreResult<T>
    where
        F: FnMut(&Transaction<'_>) -> CoreResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        let version: i64 = store
            .read(|c| {
                Ok(c.query_row("SELECT MAX(version) FROM schema_migrations", [], |r| {
                    r.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn failed_write_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result: CoreResult<()> = store.write(|tx| {
            tx.execute(
                "UPDATE counters SET value = 99 WHERE name = 'dataset_version'",
                [],
            )?;
            Err(CoreError::invalid("abort"))
        });
        assert!(result.is_err());
        let value: i64 = store
            .read(|c| {
                Ok(c.query_row(
                    "SELECT value FROM counters WHERE name = 'dataset_version'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.sqlite3");
        drop(SqliteStore::open(&path).unwrap());
        SqliteStore::open(&path).unwrap();
    }
}
