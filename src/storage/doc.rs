//! Embedded document-database backend over SQLite: one table per bucket,
//! one JSON document per row in insertion order.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::Connection;
use serde_json::Value;

use super::{matches_prefix, StorageBucket, StorageDatabase};

pub struct DocDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl DocDatabase {
    pub fn open(database_name: &str, db_path: &Path) -> Result<Self> {
        fs::create_dir_all(db_path)
            .with_context(|| format!("creating database dir {}", db_path.display()))?;
        let file = db_path.join(format!("{database_name}.db"));
        let conn = Connection::open(&file)
            .with_context(|| format!("opening document database {}", file.display()))?;
        // WAL keeps the rotator's appends cheap while the backup thread reads.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl StorageDatabase for DocDatabase {
    fn bucket(&self, name: &str) -> Result<Box<dyn StorageBucket>> {
        self.conn.lock().execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    doc TEXT NOT NULL
                )"
            ),
            [],
        )?;
        Ok(Box::new(DocBucket {
            name: name.to_string(),
            conn: Arc::clone(&self.conn),
        }))
    }

    fn list(&self, pattern: &Regex) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .filter(|n| matches_prefix(pattern, n))
            .collect();
        Ok(names)
    }

    fn export(&self, name: &str, out_dir: &Path) -> Result<PathBuf> {
        let out_path = out_dir.join(format!("{name}.json"));
        let mut out = fs::File::create(&out_path)
            .with_context(|| format!("creating export file {}", out_path.display()))?;

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT doc FROM \"{name}\" ORDER BY id"))
            .with_context(|| format!("exporting unknown bucket {name}"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let doc: String = row.get(0)?;
            out.write_all(doc.as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(out_path)
    }

    fn drop_bucket(&self, name: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(&format!("DROP TABLE IF EXISTS \"{name}\""), [])?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // checkpoint so a restart sees every row without replaying the WAL
        self.conn
            .lock()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

struct DocBucket {
    name: String,
    conn: Arc<Mutex<Connection>>,
}

impl StorageBucket for DocBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&mut self, doc: &Value) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        self.conn
            .lock()
            .execute(
                &format!("INSERT INTO \"{}\" (doc) VALUES (?1)", self.name),
                [&body],
            )
            .with_context(|| format!("appending to bucket {}", self.name))?;
        Ok(())
    }
}
