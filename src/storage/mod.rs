//! Storage backends.
//!
//! A bucket is an append-only sequence of JSON documents, one per line when
//! exported. Two interchangeable backends exist: a filesystem tree (one file
//! per bucket) and an embedded document database (one table per bucket).
//! The rotators are the only writers of their own buckets; the backup
//! pipeline is the only caller of `export`/`drop_bucket`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod doc;
pub mod fs;

pub use doc::DocDatabase;
pub use fs::FsDatabase;

/// Write capability for a single open bucket.
pub trait StorageBucket: Send {
    fn name(&self) -> &str;

    /// Append one document.
    fn insert(&mut self, doc: &Value) -> Result<()>;
}

/// Database-level capabilities: open, enumerate, export and drop buckets.
pub trait StorageDatabase: Send + Sync {
    /// Open (creating if needed) the named bucket for appending.
    fn bucket(&self, name: &str) -> Result<Box<dyn StorageBucket>>;

    /// Bucket names whose start matches `pattern`.
    fn list(&self, pattern: &Regex) -> Result<Vec<String>>;

    /// Write the bucket out as one JSON document per line and return the
    /// file path. The returned file may live inside the database tree;
    /// callers must not delete it except through `drop_bucket`.
    fn export(&self, name: &str, out_dir: &Path) -> Result<PathBuf>;

    fn drop_bucket(&self, name: &str) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Backend selector from the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    /// Filesystem tree: a directory per database, a JSON-lines file per
    /// bucket.
    Simple,
    /// Embedded document database: a table per bucket, a JSON document per
    /// row.
    Sqlite,
}

pub fn open_database(
    kind: DatabaseKind,
    database_name: &str,
    db_path: &Path,
) -> Result<Arc<dyn StorageDatabase>> {
    Ok(match kind {
        DatabaseKind::Simple => Arc::new(FsDatabase::open(database_name, db_path)?),
        DatabaseKind::Sqlite => Arc::new(DocDatabase::open(database_name, db_path)?),
    })
}

/// Anchored-at-start regex match, the filter semantics used for bucket
/// listings and backup selection.
pub(crate) fn matches_prefix(pattern: &Regex, name: &str) -> bool {
    pattern.find(name).is_some_and(|m| m.start() == 0)
}
