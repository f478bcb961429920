//! SQLite-backed identity store.
//!
//! Table:
//! - `members`: name, grade, secret_key, gender, rank, session_id,
//!   last_activity — natural key `(name, grade)`, indexed by session_id.
//!
//! `last_activity` is stored as TEXT: NULL (never active), the literal
//! `LOGGED_OUT` sentinel, or decimal epoch seconds.

use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;

use super::{Activity, IdentityKey, IdentityRecord, IdentityStore, StoreError, ADMIN_RANK};

/// Column value of the logged-out sentinel.
const LOGGED_OUT_SENTINEL: &str = "LOGGED_OUT";

pub struct SqliteIdentityStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteIdentityStore {
    /// Create an in-memory store (for tests).
    pub fn new() -> Self {
        let conn = rusqlite::Connection::open_in_memory()
            .expect("Failed to open in-memory SQLite for identity store");
        Self::init_tables(&conn);
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open (or create) the member database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init_tables(&conn);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &rusqlite::Connection) {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS members (
                name TEXT NOT NULL,
                grade TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                gender TEXT,
                rank TEXT,
                session_id TEXT,
                last_activity TEXT,
                PRIMARY KEY (name, grade)
            );
            CREATE INDEX IF NOT EXISTS idx_members_session ON members(session_id);",
        )
        .expect("Failed to initialize members table");
    }
}

impl Default for SqliteIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn activity_to_column(activity: Option<Activity>) -> Option<String> {
    match activity {
        None => None,
        Some(Activity::LoggedOut) => Some(LOGGED_OUT_SENTINEL.to_string()),
        Some(Activity::At(ts)) => Some(ts.to_string()),
    }
}

fn activity_from_column(value: Option<String>) -> Option<Activity> {
    let value = value?;
    if value == LOGGED_OUT_SENTINEL {
        return Some(Activity::LoggedOut);
    }
    value.parse::<u64>().ok().map(Activity::At)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IdentityRecord> {
    Ok(IdentityRecord {
        name: row.get(0)?,
        grade: row.get(1)?,
        secret_key: row.get(2)?,
        gender: row.get(3)?,
        rank: row.get(4)?,
        bound_session: row.get(5)?,
        last_activity: activity_from_column(row.get(6)?),
    })
}

const RECORD_COLUMNS: &str = "name, grade, secret_key, gender, rank, session_id, last_activity";

impl IdentityStore for SqliteIdentityStore {
    fn find_by_identity(&self, key: &IdentityKey) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM members WHERE name = ?1 AND grade = ?2"),
            rusqlite::params![key.name, key.grade],
            record_from_row,
        );

        match row {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn find_by_session(&self, session_id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM members WHERE session_id = ?1"),
            rusqlite::params![session_id],
            record_from_row,
        );

        match row {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn upsert(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO members (name, grade, secret_key, gender, rank, session_id, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name, grade) DO UPDATE SET
                secret_key = excluded.secret_key,
                gender = excluded.gender,
                rank = excluded.rank,
                session_id = excluded.session_id,
                last_activity = excluded.last_activity",
            rusqlite::params![
                record.name,
                record.grade,
                record.secret_key,
                record.gender,
                record.rank,
                record.bound_session,
                activity_to_column(record.last_activity),
            ],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    fn delete(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM members WHERE name = ?1 AND grade = ?2",
                rusqlite::params![key.name, key.grade],
            )
            .map_err(unavailable)?;
        Ok(deleted > 0)
    }

    fn admins(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM members WHERE rank = ?1"
            ))
            .map_err(unavailable)?;
        let records = stmt
            .query_map(rusqlite::params![ADMIN_RANK], record_from_row)
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;
        Ok(records)
    }
}
