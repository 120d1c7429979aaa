use std::sync::Mutex;

use log::info;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{KeyValueStore, KvUpdate};
use crate::error::{Result, RunTrackError};

/// SQLite-backed key-value store.
///
/// One table, one row per key. `update` runs inside a `BEGIN IMMEDIATE`
/// transaction so a read-modify-write is atomic even against another
/// connection to the same file.
pub struct SqliteStore {
    /// `None` once closed
    db: Mutex<Option<Connection>>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) a store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[SqliteStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(Some(db)),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
        "#,
        )?;
        Ok(())
    }

    fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let mut guard = self
            .db
            .lock()
            .map_err(|_| RunTrackError::storage("sqlite store lock poisoned"))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| RunTrackError::storage("sqlite store is closed"))?;
        f(conn)
    }

    fn write_value(conn: &Connection, key: &str, value: &[u8]) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%s', 'now')",
            params![key, value],
        )
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            Self::write_value(conn, key, value)?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&[u8]>) -> Result<KvUpdate>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT value FROM kv_store WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            // Dropping `tx` on error rolls back
            match f(current.as_deref())? {
                KvUpdate::Keep => {}
                KvUpdate::Set(value) => {
                    Self::write_value(&tx, key, &value)?;
                }
                KvUpdate::Remove => {
                    tx.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .db
            .lock()
            .map_err(|_| RunTrackError::storage("sqlite store lock poisoned"))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| RunTrackError::from(e))?;
            info!("[SqliteStore] Closed {}", self.db_path);
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
