//! Suspension ledger — temporary response bans per device session.
//!
//! Entries are written by an authority command or by automatic OTP-abuse
//! detection, and checked unconditionally before any other processing: a
//! suspended session cannot even issue "logout". Expired entries are
//! deleted lazily by the first check after `until` has elapsed.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use parking_lot::Mutex;

/// Result of the suspension gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    /// The session is banned; reply with the notice and do nothing else.
    Active { remaining_secs: u64, reason: String },
    /// Not suspended (any expired entry was deleted on the way out).
    Clear,
}

/// SQLite-backed ledger of active suspensions.
#[derive(Debug)]
pub struct SuspensionLedger {
    conn: Mutex<rusqlite::Connection>,
}

impl SuspensionLedger {
    /// Create an in-memory ledger (for tests).
    pub fn new() -> Self {
        let conn = rusqlite::Connection::open_in_memory()
            .expect("Failed to open in-memory SQLite for suspension ledger");
        Self::init_tables(&conn);
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open a file-backed ledger so bans survive a process restart.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init_tables(&conn);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &rusqlite::Connection) {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS suspensions (
                session_id TEXT PRIMARY KEY,
                until INTEGER NOT NULL,
                reason TEXT NOT NULL
            );",
        )
        .expect("Failed to initialize suspensions table");

        // Drop entries that expired while the process was down.
        let now = epoch_secs() as i64;
        let _ = conn.execute(
            "DELETE FROM suspensions WHERE until <= ?1",
            rusqlite::params![now],
        );
    }

    /// Suspend a session for `duration_secs`. Re-suspending overwrites.
    pub fn suspend(&self, session_id: &str, duration_secs: u64, reason: &str) {
        self.suspend_at(session_id, epoch_secs() + duration_secs, reason);
    }

    pub fn suspend_at(&self, session_id: &str, until: u64, reason: &str) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO suspensions (session_id, until, reason) VALUES (?1, ?2, ?3)",
            rusqlite::params![session_id, until as i64, reason],
        ) {
            tracing::error!(session = session_id, "Failed to record suspension: {e}");
            return;
        }
        tracing::warn!(session = session_id, reason = reason, "Session suspended");
    }

    /// The gate. Runs before any command dispatch.
    pub fn check(&self, session_id: &str) -> GateStatus {
        self.check_at(session_id, epoch_secs())
    }

    pub fn check_at(&self, session_id: &str, now: u64) -> GateStatus {
        let conn = self.conn.lock();
        let row: rusqlite::Result<(i64, String)> = conn.query_row(
            "SELECT until, reason FROM suspensions WHERE session_id = ?1",
            rusqlite::params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );

        match row {
            Ok((until, reason)) if until as u64 > now => GateStatus::Active {
                remaining_secs: until as u64 - now,
                reason,
            },
            Ok(_) => {
                // Expired: lazy delete, then let processing continue.
                let _ = conn.execute(
                    "DELETE FROM suspensions WHERE session_id = ?1",
                    rusqlite::params![session_id],
                );
                GateStatus::Clear
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => GateStatus::Clear,
            Err(e) => {
                // A broken ledger must not brick the bot; log and fail open.
                tracing::error!(session = session_id, "Suspension check failed: {e}");
                GateStatus::Clear
            }
        }
    }

    /// Admin action: lift a suspension early.
    pub fn lift(&self, session_id: &str) -> bool {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM suspensions WHERE session_id = ?1",
            rusqlite::params![session_id],
        )
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    /// Number of unexpired entries.
    pub fn active_count(&self) -> usize {
        let conn = self.conn.lock();
        let now = epoch_secs() as i64;
        conn.query_row(
            "SELECT COUNT(*) FROM suspensions WHERE until > ?1",
            rusqlite::params![now],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0) as usize
    }
}

impl Default for SuspensionLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
