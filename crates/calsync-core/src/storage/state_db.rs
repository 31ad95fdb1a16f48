//! SQLite-backed sync state.
//!
//! Provides persistent storage for:
//! - The record mapping and cursor, written together as one row
//! - Advisory pass locks with a TTL
//! - A bounded log of pass summaries

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use super::data_dir;
use crate::error::{CoreError, DatabaseError};
use crate::sync::{
    LockStore, PassSummary, PersistedState, StateStore, SyncCursor, SyncError, SyncMapping,
    SyncResult,
};

/// Pass summaries kept in `pass_log`.
const PASS_LOG_LIMIT: i64 = 200;

fn db_err(err: rusqlite::Error) -> SyncError {
    DatabaseError::from(err).into()
}

/// SQLite database for sync state.
///
/// One instance is one lock holder: locks it takes can only be released
/// through the same instance.
pub struct StateDb {
    conn: Mutex<Connection>,
    holder: String,
}

impl StateDb {
    /// Open the state database at `~/.config/calsync/calsync.db`.
    ///
    /// # Errors
    /// Returns an error if the data directory is unavailable or the database
    /// cannot be opened or migrated.
    pub fn open() -> Result<Self, CoreError> {
        let path = data_dir()?.join("calsync.db");
        Ok(Self::open_at(&path)?)
    }

    /// Open (or create) the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path).map_err(|source| DatabaseError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, DatabaseError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DatabaseError> {
        migrate(&conn).map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            holder: Uuid::new_v4().to_string(),
        })
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Store(format!("Failed to lock state database: {e}")))
    }

    /// When `key` was taken, if anyone holds it.
    pub fn lock_acquired_at(&self, key: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let millis: Option<i64> = conn
            .query_row(
                "SELECT acquired_at_ms FROM locks WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS state (
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            mapping     TEXT NOT NULL,
            cursor      TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS locks (
            key             TEXT PRIMARY KEY,
            holder          TEXT NOT NULL,
            acquired_at_ms  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pass_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at  TEXT NOT NULL,
            summary     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pass_log_started_at ON pass_log(started_at);",
    )
}

impl LockStore for StateDb {
    fn try_acquire(&self, key: &str, ttl: Duration) -> SyncResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(ttl_ms);

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let reclaimed = tx
            .execute(
                "DELETE FROM locks WHERE key = ?1 AND acquired_at_ms <= ?2",
                params![key, cutoff],
            )
            .map_err(db_err)?;
        if reclaimed > 0 {
            warn!(key, "reclaimed stale sync lock");
        }
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO locks (key, holder, acquired_at_ms) VALUES (?1, ?2, ?3)",
                params![key, self.holder, now_ms],
            )
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(inserted == 1)
    }

    fn release(&self, key: &str) -> SyncResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND holder = ?2",
            params![key, self.holder],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

impl StateStore for StateDb {
    fn load(&self) -> SyncResult<PersistedState> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row("SELECT mapping, cursor FROM state WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(db_err)?;

        match row {
            Some((mapping, cursor)) => Ok(PersistedState {
                mapping: serde_json::from_str::<SyncMapping>(&mapping)?,
                cursor: serde_json::from_str::<SyncCursor>(&cursor)?,
            }),
            None => Ok(PersistedState::default()),
        }
    }

    fn save(&self, state: &PersistedState) -> SyncResult<()> {
        let mapping = serde_json::to_string(&state.mapping)?;
        let cursor = serde_json::to_string(&state.cursor)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO state (id, mapping, cursor, updated_at)
             VALUES (1, ?1, ?2, ?3)",
            params![mapping, cursor, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        debug!(entries = state.mapping.len(), "saved sync state");
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM state", []).map_err(db_err)?;
        Ok(())
    }

    fn record_pass(&self, summary: &PassSummary) -> SyncResult<()> {
        let json = serde_json::to_string(summary)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO pass_log (started_at, summary) VALUES (?1, ?2)",
            params![summary.started_at.to_rfc3339(), json],
        )
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM pass_log WHERE id NOT IN
                (SELECT id FROM pass_log ORDER BY id DESC LIMIT ?1)",
            params![PASS_LOG_LIMIT],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn recent_passes(&self, limit: usize) -> SyncResult<Vec<PassSummary>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT summary FROM pass_log ORDER BY id DESC LIMIT ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut passes = Vec::new();
        for json in rows {
            let json = json.map_err(db_err)?;
            passes.push(serde_json::from_str(&json)?);
        }
        Ok(passes)
    }
}
