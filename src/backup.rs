//! Sealed-bucket backup pipeline.
//!
//! Invoked by a rotator after every rotation. One cycle: snapshot the set of
//! sealed buckets, then serially export, compress, ship, drop and record
//! each one. The shipped-bucket log makes the non-overwrite path
//! at-most-once across restarts; the bucket is dropped only after the ship
//! succeeded, so nothing is lost on a failed upload.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::names::parse_bucket_time;
use crate::state::BackupLog;
use crate::storage::StorageDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Aws,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    Zstd,
    Lzma,
    Lzma2,
}

impl CompressionCodec {
    fn archive_name(&self, bucket: &str) -> String {
        match self {
            Self::Zstd => format!("{bucket}.json.zst"),
            Self::Lzma | Self::Lzma2 => format!("{bucket}.json.xz"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub backup_type: BackupType,
    pub compression: CompressionCodec,
    /// Bucket-name regexes selecting the streams to ship.
    pub collections: Vec<String>,
    /// Literal bucket names re-shipped in place (at most hourly, never
    /// dropped). Empty disables the overwrite path.
    pub overwrite_collections: Vec<String>,
    pub backup_folder_path: PathBuf,
    pub backup_overwrite_folder_path: PathBuf,
    pub temp_backup_folder: PathBuf,
    pub s3_bucket_name: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_region: String,
    pub is_production: bool,
}

pub struct BackupPipeline {
    db: Arc<dyn StorageDatabase>,
    log: Arc<BackupLog>,
    cfg: BackupConfig,
    /// Process-wide: one cycle at a time across all rotators.
    cycle_lock: Mutex<()>,
}

impl BackupPipeline {
    pub fn new(db: Arc<dyn StorageDatabase>, log: Arc<BackupLog>, cfg: BackupConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            log,
            cfg,
            cycle_lock: Mutex::new(()),
        })
    }

    /// One shipment cycle. Non-blocking on the process-wide lock: if another
    /// cycle is running this one is skipped and the next rotation catches
    /// the buckets.
    pub fn run_cycle(&self) -> Result<()> {
        let Some(_guard) = self.cycle_lock.try_lock() else {
            info!("backup cycle already in progress, skipping");
            return Ok(());
        };

        self.wipe_temp();

        let candidates = self.sealed_candidates()?;
        self.ship_all(&candidates, false)?;

        if !self.cfg.overwrite_collections.is_empty() {
            let names = self.cfg.overwrite_collections.clone();
            self.ship_all(&names, true)?;
        }

        info!("backup cycle finished");
        self.wipe_temp();
        Ok(())
    }

    /// Sealed buckets: everything matching a configured prefix except the
    /// most recent per prefix, which is either `current` or the armed
    /// `next_candidate`.
    fn sealed_candidates(&self) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        for pattern in &self.cfg.collections {
            let re = Regex::new(pattern)
                .with_context(|| format!("invalid backup collection pattern {pattern}"))?;
            let mut dated: Vec<(DateTime<Utc>, String)> = self
                .db
                .list(&re)?
                .into_iter()
                .filter_map(|n| parse_bucket_time(&n).map(|t| (t, n)))
                .collect();
            dated.sort();
            dated.pop();
            candidates.extend(dated.into_iter().map(|(_, n)| n));
        }
        Ok(candidates)
    }

    fn ship_all(&self, names: &[String], overwrite: bool) -> Result<()> {
        for name in names {
            if let Err(e) = self.ship_one(name, overwrite) {
                error!(bucket = %name, error = %e, "bucket_backup_failed");
                self.wipe_temp();
                if !self.cfg.is_production {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn ship_one(&self, name: &str, overwrite: bool) -> Result<()> {
        if overwrite {
            if let Some(prev) = self.log.shipped_at(name)? {
                if Utc::now() - prev <= ChronoDuration::hours(1) {
                    return Ok(());
                }
            }
        } else if self.log.contains(name)? {
            return Ok(());
        }

        info!(bucket = %name, "exporting bucket");
        let exported = self.db.export(name, &self.cfg.temp_backup_folder)?;

        let archive_name = self.cfg.compression.archive_name(name);
        let archive_path = self.cfg.temp_backup_folder.join(&archive_name);
        compress(self.cfg.compression, &exported, &archive_path)?;

        let dest_folder = if overwrite {
            &self.cfg.backup_overwrite_folder_path
        } else {
            &self.cfg.backup_folder_path
        };
        match self.cfg.backup_type {
            BackupType::Aws => {
                let key = dest_folder.join(&archive_name).to_string_lossy().into_owned();
                self.ship_s3(&archive_path, &key)?;
                info!(bucket = %name, key = %key, "archive uploaded to s3");
            }
            BackupType::Local => {
                fs::create_dir_all(dest_folder)?;
                let dest = dest_folder.join(&archive_name);
                fs::copy(&archive_path, &dest)
                    .with_context(|| format!("copying archive to {}", dest.display()))?;
                info!(bucket = %name, dest = %dest.display(), "archive copied to backup tree");
            }
        }

        if !overwrite {
            self.db.drop_bucket(name)?;
            self.log.record_new(name, Utc::now())?;
        } else {
            self.log.upsert(name, Utc::now())?;
        }
        Ok(())
    }

    fn ship_s3(&self, archive: &Path, key: &str) -> Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(async {
            // static keys from the config file, else the default chain
            // (environment, instance role)
            let conf = if self.cfg.aws_access_key_id.is_empty() {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(aws_config::Region::new(self.cfg.aws_region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::Config::new(&shared)
            } else {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    self.cfg.aws_access_key_id.clone(),
                    self.cfg.aws_secret_access_key.clone(),
                    None,
                    None,
                    "feedvault-config",
                );
                aws_sdk_s3::Config::builder()
                    .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
                    .region(aws_sdk_s3::config::Region::new(self.cfg.aws_region.clone()))
                    .credentials_provider(credentials)
                    .build()
            };
            let client = aws_sdk_s3::Client::from_conf(conf);
            let body = aws_sdk_s3::primitives::ByteStream::from_path(archive)
                .await
                .context("reading archive for upload")?;
            client
                .put_object()
                .bucket(&self.cfg.s3_bucket_name)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("s3 put_object failed: {e}"))?;
            Ok(())
        })
    }

    /// Remove everything under the temp folder. Failures are logged, not
    /// fatal: a stray temp file never blocks the next cycle.
    fn wipe_temp(&self) {
        let temp = &self.cfg.temp_backup_folder;
        if let Err(e) = fs::create_dir_all(temp) {
            warn!(error = %e, "temp folder unavailable");
            return;
        }
        let entries = match fs::read_dir(temp) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "temp folder listing failed");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "temp cleanup failed");
            }
        }
    }
}

fn compress(codec: CompressionCodec, src: &Path, dest: &Path) -> Result<()> {
    let mut input = File::open(src).with_context(|| format!("opening export {}", src.display()))?;
    let output = File::create(dest)
        .with_context(|| format!("creating archive {}", dest.display()))?;
    match codec {
        CompressionCodec::Zstd => {
            zstd::stream::copy_encode(&mut input, output, 3)?;
        }
        CompressionCodec::Lzma | CompressionCodec::Lzma2 => {
            let mut encoder = xz2::write::XzEncoder::new(output, 9);
            std::io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsDatabase;
    use serde_json::json;

    struct Fixture {
        _data: tempfile::TempDir,
        _dest: tempfile::TempDir,
        _temp: tempfile::TempDir,
        db: Arc<dyn StorageDatabase>,
        log: Arc<BackupLog>,
        cfg: BackupConfig,
    }

    fn fixture(codec: CompressionCodec) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let db: Arc<dyn StorageDatabase> =
            Arc::new(FsDatabase::open("feed", data.path()).unwrap());
        let log =
            Arc::new(BackupLog::open(&data.path().join("backup_info.db"), false).unwrap());
        let cfg = BackupConfig {
            backup_type: BackupType::Local,
            compression: codec,
            collections: vec!["full".to_string()],
            overwrite_collections: vec![],
            backup_folder_path: dest.path().join("backups"),
            backup_overwrite_folder_path: dest.path().join("overwrite"),
            temp_backup_folder: temp.path().join("work"),
            s3_bucket_name: String::new(),
            aws_access_key_id: String::new(),
            aws_secret_access_key: String::new(),
            aws_region: "us-east-1".to_string(),
            is_production: false,
        };
        Fixture {
            _data: data,
            _dest: dest,
            _temp: temp,
            db,
            log,
            cfg,
        }
    }

    fn seed_bucket(db: &Arc<dyn StorageDatabase>, name: &str, docs: usize) {
        let mut bucket = db.bucket(name).unwrap();
        for i in 0..docs {
            bucket.insert(&json!({"sequence": i})).unwrap();
        }
    }

    #[test]
    fn test_cycle_ships_sealed_drops_and_records() {
        let f = fixture(CompressionCodec::Zstd);
        seed_bucket(&f.db, "full_2024_01_01_12_00_min", 3);
        seed_bucket(&f.db, "full_2024_01_01_12_01_min", 1);

        let pipeline = BackupPipeline::new(f.db.clone(), f.log.clone(), f.cfg.clone());
        pipeline.run_cycle().unwrap();

        // the sealed bucket shipped, the most recent one stayed
        let archive = f.cfg.backup_folder_path.join("full_2024_01_01_12_00_min.json.zst");
        assert!(archive.is_file());
        let remaining = f.db.list(&Regex::new("full").unwrap()).unwrap();
        assert_eq!(remaining, vec!["full_2024_01_01_12_01_min"]);
        assert!(f.log.contains("full_2024_01_01_12_00_min").unwrap());
        assert!(!f.log.contains("full_2024_01_01_12_01_min").unwrap());

        // archive decompresses to the exported JSON lines
        let decoded = zstd::stream::decode_all(File::open(&archive).unwrap()).unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert_eq!(text.lines().count(), 3);

        // temp folder left clean
        assert_eq!(fs::read_dir(&f.cfg.temp_backup_folder).unwrap().count(), 0);
    }

    #[test]
    fn test_recorded_bucket_is_never_reshipped() {
        let f = fixture(CompressionCodec::Zstd);
        seed_bucket(&f.db, "full_2024_01_01_12_00_min", 2);
        seed_bucket(&f.db, "full_2024_01_01_12_01_min", 1);
        f.log.record_new("full_2024_01_01_12_00_min", Utc::now()).unwrap();

        let pipeline = BackupPipeline::new(f.db.clone(), f.log.clone(), f.cfg.clone());
        pipeline.run_cycle().unwrap();

        // no export, compress, upload or drop happened for the recorded name
        assert!(!f
            .cfg
            .backup_folder_path
            .join("full_2024_01_01_12_00_min.json.zst")
            .exists());
        let mut remaining = f.db.list(&Regex::new("full").unwrap()).unwrap();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["full_2024_01_01_12_00_min", "full_2024_01_01_12_01_min"]
        );
    }

    #[test]
    fn test_most_recent_bucket_excluded_per_prefix() {
        let f = fixture(CompressionCodec::Zstd);
        seed_bucket(&f.db, "full_2024_01_01_12_00_min", 1);
        let pipeline = BackupPipeline::new(f.db.clone(), f.log.clone(), f.cfg.clone());
        pipeline.run_cycle().unwrap();
        // a lone bucket is the live one: nothing ships
        assert_eq!(
            f.db.list(&Regex::new("full").unwrap()).unwrap(),
            vec!["full_2024_01_01_12_00_min"]
        );
    }

    #[test]
    fn test_overwrite_path_reships_hourly_without_drop() {
        let mut f = fixture(CompressionCodec::Zstd);
        f.cfg.collections = vec![];
        f.cfg.overwrite_collections = vec!["full_2024_01_01_12_00_min".to_string()];
        seed_bucket(&f.db, "full_2024_01_01_12_00_min", 2);

        // fresh record: skipped
        f.log.upsert("full_2024_01_01_12_00_min", Utc::now()).unwrap();
        let pipeline = BackupPipeline::new(f.db.clone(), f.log.clone(), f.cfg.clone());
        pipeline.run_cycle().unwrap();
        assert!(!f
            .cfg
            .backup_overwrite_folder_path
            .join("full_2024_01_01_12_00_min.json.zst")
            .exists());

        // stale record: re-shipped, source kept, record refreshed
        let stale = Utc::now() - ChronoDuration::hours(2);
        f.log.upsert("full_2024_01_01_12_00_min", stale).unwrap();
        pipeline.run_cycle().unwrap();
        assert!(f
            .cfg
            .backup_overwrite_folder_path
            .join("full_2024_01_01_12_00_min.json.zst")
            .is_file());
        assert_eq!(
            f.db.list(&Regex::new("full").unwrap()).unwrap(),
            vec!["full_2024_01_01_12_00_min"]
        );
        let refreshed = f.log.shipped_at("full_2024_01_01_12_00_min").unwrap().unwrap();
        assert!(refreshed > stale);
    }

    #[test]
    fn test_xz_codec_round_trip() {
        let f = fixture(CompressionCodec::Lzma2);
        seed_bucket(&f.db, "full_2024_01_01_12_00_min", 2);
        seed_bucket(&f.db, "full_2024_01_01_12_01_min", 1);

        let pipeline = BackupPipeline::new(f.db.clone(), f.log.clone(), f.cfg.clone());
        pipeline.run_cycle().unwrap();

        let archive = f.cfg.backup_folder_path.join("full_2024_01_01_12_00_min.json.xz");
        let mut decoder = xz2::read::XzDecoder::new(File::open(&archive).unwrap());
        let mut text = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut text).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
