//! Collector configuration.
//!
//! A TOML file, re-read by the control-plane watcher every tick; secrets
//! may be supplied through the environment (`.env` is loaded at startup).
//! Every field has a default so a partial file is a valid file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backup::{BackupConfig, BackupType, CompressionCodec};
use crate::rest::RestCredentials;
use crate::snapshot::SnapshotGrid;
use crate::storage::DatabaseKind;
use crate::timebase::Interval;

/// Environment variable naming the config file; the control watcher reloads
/// from the same path.
pub const CONFIG_PATH_ENV: &str = "FEEDVAULT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "feedvault.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Subscription universe
    pub product_ids: Vec<String>,

    // Bucket cadences
    pub stream_backup_interval: Interval,
    pub snapshot_backup_interval: Interval,

    // Snapshot poller
    pub is_snapshot: bool,
    pub snapshot_interval_minutes: u32,
    pub snapshot_interval_seconds: u32,

    // Control plane
    pub update_interval: Interval,
    pub stop_program: i64,

    // Rotator overlap half-width, seconds
    pub safe_margin_interval: i64,

    // Backup pipeline
    pub backup_on: bool,
    pub backup_type: BackupType,
    pub backup_compression_type: CompressionCodec,
    pub backup_collections: Vec<String>,
    pub backup_overwrite_collections: Vec<String>,
    pub backup_folder_path: PathBuf,
    pub backup_overwrite_folder_path: PathBuf,
    pub temp_backup_folder: PathBuf,
    pub temp_folder: PathBuf,
    pub s3_bucket_name: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_region: String,

    // Storage backend
    pub database_type: DatabaseKind,
    pub database_name: String,
    pub db_path: PathBuf,

    // Exchange endpoints and credentials
    pub websocket_url: String,
    pub rest_url: String,
    pub cb_key: String,
    pub cb_secret: String,
    pub cb_passphrase: String,

    // Mode and state files
    pub is_production: bool,
    pub backup_info_db_path: PathBuf,
    pub crash_info_db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            product_ids: vec!["BTC-USD".to_string()],
            stream_backup_interval: Interval::EveryHour,
            snapshot_backup_interval: Interval::EveryHour,
            is_snapshot: false,
            snapshot_interval_minutes: 5,
            snapshot_interval_seconds: 30,
            update_interval: Interval::EveryHour,
            stop_program: 0,
            safe_margin_interval: 15,
            backup_on: true,
            backup_type: BackupType::Local,
            backup_compression_type: CompressionCodec::Zstd,
            backup_collections: vec!["full".to_string()],
            backup_overwrite_collections: vec![],
            backup_folder_path: PathBuf::from("./backups"),
            backup_overwrite_folder_path: PathBuf::from("./backups_overwrite"),
            temp_backup_folder: PathBuf::from("./tmp/backup"),
            temp_folder: PathBuf::from("./tmp"),
            s3_bucket_name: String::new(),
            aws_access_key_id: String::new(),
            aws_secret_access_key: String::new(),
            aws_region: "us-east-1".to_string(),
            database_type: DatabaseKind::Simple,
            database_name: "feedvault".to_string(),
            db_path: PathBuf::from("./data"),
            websocket_url: "wss://ws-feed.exchange.coinbase.com".to_string(),
            rest_url: "https://api.exchange.coinbase.com".to_string(),
            cb_key: String::new(),
            cb_secret: String::new(),
            cb_passphrase: String::new(),
            is_production: true,
            backup_info_db_path: PathBuf::from("./state/backup_info.db"),
            crash_info_db_path: PathBuf::from("./state/crash_info.db"),
        }
    }
}

impl Config {
    /// The config file path for this process.
    pub fn path() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from a TOML file, then let the environment override secrets.
    /// A missing file yields the defaults so a bare checkout still runs.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.is_file() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for (var, field) in [
            ("CB_KEY", &mut self.cb_key as &mut String),
            ("CB_SECRET", &mut self.cb_secret),
            ("CB_PASSPHRASE", &mut self.cb_passphrase),
            ("AWS_ACCESS_KEY_ID", &mut self.aws_access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &mut self.aws_secret_access_key),
        ] {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    *field = value;
                }
            }
        }
    }

    pub fn credentials(&self) -> RestCredentials {
        RestCredentials {
            key: self.cb_key.clone(),
            secret: self.cb_secret.clone(),
            passphrase: self.cb_passphrase.clone(),
        }
    }

    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            backup_type: self.backup_type,
            compression: self.backup_compression_type,
            collections: self.backup_collections.clone(),
            overwrite_collections: self.backup_overwrite_collections.clone(),
            backup_folder_path: self.backup_folder_path.clone(),
            backup_overwrite_folder_path: self.backup_overwrite_folder_path.clone(),
            temp_backup_folder: self.temp_backup_folder.clone(),
            s3_bucket_name: self.s3_bucket_name.clone(),
            aws_access_key_id: self.aws_access_key_id.clone(),
            aws_secret_access_key: self.aws_secret_access_key.clone(),
            aws_region: self.aws_region.clone(),
            is_production: self.is_production,
        }
    }

    /// Production polls on a minute grid; development on a second grid.
    pub fn snapshot_grid(&self) -> SnapshotGrid {
        if self.is_production {
            SnapshotGrid::Minutes(self.snapshot_interval_minutes)
        } else {
            SnapshotGrid::Seconds(self.snapshot_interval_seconds)
        }
    }
}
