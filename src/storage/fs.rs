//! Filesystem storage backend: one directory per database, one JSON-lines
//! file per bucket. `export` is free because the bucket file already is the
//! export format; it is returned in place after the writer handle has been
//! dropped by the rotator swap.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use super::{matches_prefix, StorageBucket, StorageDatabase};

pub struct FsDatabase {
    root: PathBuf,
}

impl FsDatabase {
    pub fn open(database_name: &str, db_path: &Path) -> Result<Self> {
        let root = db_path.join(database_name);
        fs::create_dir_all(&root)
            .with_context(|| format!("creating database tree {}", root.display()))?;
        Ok(Self { root })
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StorageDatabase for FsDatabase {
    fn bucket(&self, name: &str) -> Result<Box<dyn StorageBucket>> {
        let path = self.bucket_path(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening bucket {}", path.display()))?;
        Ok(Box::new(FsBucket {
            name: name.to_string(),
            file,
        }))
    }

    fn list(&self, pattern: &Regex) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if matches_prefix(pattern, &name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn export(&self, name: &str, _out_dir: &Path) -> Result<PathBuf> {
        let path = self.bucket_path(name);
        if !path.is_file() {
            anyhow::bail!("bucket {name} not found in {}", self.root.display());
        }
        Ok(path)
    }

    fn drop_bucket(&self, name: &str) -> Result<()> {
        let path = self.bucket_path(name);
        fs::remove_file(&path).with_context(|| format!("dropping bucket {}", path.display()))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FsBucket {
    name: String,
    file: File,
}

impl StorageBucket for FsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&mut self, doc: &Value) -> Result<()> {
        let mut line = serde_json::to_string(doc)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("appending to bucket {}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_list_export_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db = FsDatabase::open("feed", dir.path()).unwrap();

        let mut bucket = db.bucket("full_2024_01_01_12_00_min").unwrap();
        bucket.insert(&json!({"sequence": 1})).unwrap();
        bucket.insert(&json!({"sequence": 2})).unwrap();
        drop(bucket);

        let mut other = db.bucket("orderbook_2024_01_01_12_00_min").unwrap();
        other.insert(&json!({"bids": []})).unwrap();
        drop(other);

        let full = Regex::new("full").unwrap();
        let mut listed = db.list(&full).unwrap();
        listed.sort();
        assert_eq!(listed, vec!["full_2024_01_01_12_00_min"]);

        let exported = db.export("full_2024_01_01_12_00_min", dir.path()).unwrap();
        let content = std::fs::read_to_string(&exported).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            serde_json::from_str::<Value>(lines[0]).unwrap(),
            json!({"sequence": 1})
        );

        db.drop_bucket("full_2024_01_01_12_00_min").unwrap();
        assert!(db.list(&full).unwrap().is_empty());
        assert!(db.export("full_2024_01_01_12_00_min", dir.path()).is_err());
    }

    #[test]
    fn test_list_filter_is_anchored() {
        let dir = tempfile::tempdir().unwrap();
        let db = FsDatabase::open("feed", dir.path()).unwrap();
        drop(db.bucket("full_2024_01_01_12_00_min").unwrap());
        drop(db.bucket("notfull_2024_01_01_12_00_min").unwrap());

        let listed = db.list(&Regex::new("full").unwrap()).unwrap();
        assert_eq!(listed, vec!["full_2024_01_01_12_00_min"]);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let db = FsDatabase::open("feed", dir.path()).unwrap();
        drop({
            let mut b = db.bucket("full_2024_01_01_12_00_min").unwrap();
            b.insert(&json!({"sequence": 1})).unwrap();
            b
        });
        drop({
            let mut b = db.bucket("full_2024_01_01_12_00_min").unwrap();
            b.insert(&json!({"sequence": 2})).unwrap();
            b
        });
        let exported = db.export("full_2024_01_01_12_00_min", dir.path()).unwrap();
        assert_eq!(std::fs::read_to_string(exported).unwrap().lines().count(), 2);
    }
}
