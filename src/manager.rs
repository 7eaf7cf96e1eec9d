//! Collection manager: the single insert surface over the main stream
//! rotator and the optional snapshot rotator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::rotator::BucketRotator;
use crate::storage::StorageDatabase;

/// Where the event handler and the snapshot poller hand records off.
/// A trait so tests can capture forwarded records without storage.
pub trait EventSink: Send + Sync {
    fn insert(&self, doc: Value) -> Result<()>;
    fn insert_snapshot(&self, doc: Value) -> Result<()>;
}

pub struct CollectionManager {
    stream: Arc<BucketRotator>,
    snapshot: Option<Arc<BucketRotator>>,
    db: Arc<dyn StorageDatabase>,
}

impl CollectionManager {
    pub fn new(
        stream: Arc<BucketRotator>,
        snapshot: Option<Arc<BucketRotator>>,
        db: Arc<dyn StorageDatabase>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream,
            snapshot,
            db,
        })
    }

    /// Schedule the drained shutdown on every rotator.
    pub fn stop_collection(&self, stop_time: DateTime<Utc>) {
        self.stream.stop_collection(stop_time);
        if let Some(snapshot) = &self.snapshot {
            snapshot.stop_collection(stop_time);
        }
    }

    /// All rotators have seen an event past their stop time.
    pub fn is_stopped(&self) -> bool {
        let snapshot_stopped = self.snapshot.as_ref().map_or(true, |s| s.is_stopped());
        self.stream.is_stopped() && snapshot_stopped
    }

    pub fn is_backup_in_progress(&self) -> bool {
        self.stream.is_backup_in_progress()
            || self
                .snapshot
                .as_ref()
                .is_some_and(|s| s.is_backup_in_progress())
    }

    /// Wait out any in-flight backup cycle, stop the rotation loops and
    /// close the storage database.
    pub fn close(&self) -> Result<()> {
        while self.is_backup_in_progress() {
            std::thread::sleep(Duration::from_secs(5));
        }
        self.stream.request_shutdown();
        if let Some(snapshot) = &self.snapshot {
            snapshot.request_shutdown();
        }
        info!("collection manager closed");
        self.db.close()
    }
}

impl EventSink for CollectionManager {
    fn insert(&self, doc: Value) -> Result<()> {
        self.stream.insert(&doc)
    }

    fn insert_snapshot(&self, doc: Value) -> Result<()> {
        match &self.snapshot {
            Some(rotator) => rotator.insert(&doc),
            None => anyhow::bail!("snapshot stream is not enabled"),
        }
    }
}
