//! Durable bookkeeping: the shipped-bucket log and the crash-state record.
//!
//! Both are small SQLite tables. The shipped-bucket log is the backup
//! pipeline's dedupe authority; the crash-state record lets a quick restart
//! resume sequence tracking without a redundant book reset.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

fn open_conn(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Connection::open(path).with_context(|| format!("opening state db {}", path.display()))
}

// =============================================================================
// SHIPPED-BUCKET LOG
// =============================================================================

/// `backup_info`: one row per bucket name ever shipped. A name present here
/// means the bucket has been uploaded and dropped (or is being dropped on
/// the same pass); the non-overwrite path never ships it again.
pub struct BackupLog {
    conn: Mutex<Connection>,
}

impl BackupLog {
    /// `clear` wipes the table (development runs start fresh, matching the
    /// production/development split of the state files).
    pub fn open(path: &Path, clear: bool) -> Result<Self> {
        let conn = open_conn(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS backup_info (
                col_name TEXT PRIMARY KEY,
                time TEXT NOT NULL
            )",
            [],
        )?;
        if clear {
            conn.execute("DELETE FROM backup_info", [])?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn contains(&self, col_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM backup_info WHERE col_name = ?1",
                [col_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn shipped_at(&self, col_name: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let time: Option<String> = conn
            .query_row(
                "SELECT time FROM backup_info WHERE col_name = ?1",
                [col_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(time.and_then(|t| crate::timebase::parse_iso(&t)))
    }

    /// Insert-if-absent: the non-overwrite path's at-most-once guarantee.
    pub fn record_new(&self, col_name: &str, time: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO backup_info (col_name, time) VALUES (?1, ?2)",
            params![col_name, time.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Upsert: the overwrite path refreshes the ship time on every re-ship.
    pub fn upsert(&self, col_name: &str, time: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO backup_info (col_name, time) VALUES (?1, ?2)",
            params![col_name, time.to_rfc3339()],
        )?;
        Ok(())
    }
}

// =============================================================================
// CRASH-STATE RECORD
// =============================================================================

/// Single-row snapshot written at shutdown. `None` entries mean "no event
/// yet observed" for that pair and are skipped when seeding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrashState {
    pub time: DateTime<Utc>,
    pub sequence: HashMap<String, Option<u64>>,
    pub last_match_trade_id: HashMap<String, Option<u64>>,
}

pub struct CrashStateStore {
    conn: Mutex<Connection>,
}

impl CrashStateStore {
    pub fn open(path: &Path, clear: bool) -> Result<Self> {
        let conn = open_conn(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS last_crash_info (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                time TEXT NOT NULL,
                sequence TEXT NOT NULL,
                last_match_trade_id TEXT NOT NULL
            )",
            [],
        )?;
        if clear {
            conn.execute("DELETE FROM last_crash_info", [])?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save(&self, state: &CrashState) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO last_crash_info (id, time, sequence, last_match_trade_id)
             VALUES (1, ?1, ?2, ?3)",
            params![
                state.time.to_rfc3339(),
                serde_json::to_string(&state.sequence)?,
                serde_json::to_string(&state.last_match_trade_id)?,
            ],
        )?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<CrashState>> {
        let conn = self.conn.lock();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT time, sequence, last_match_trade_id FROM last_crash_info WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((time, sequence, last_match)) = row else {
            return Ok(None);
        };
        let Some(time) = crate::timebase::parse_iso(&time) else {
            return Ok(None);
        };
        Ok(Some(CrashState {
            time,
            sequence: serde_json::from_str(&sequence)?,
            last_match_trade_id: serde_json::from_str(&last_match)?,
        }))
    }
}
