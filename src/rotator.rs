//! Time-bucketed collection rotation.
//!
//! Each stream owns one rotator. A background loop opens the next bucket
//! `safe_margin` seconds ahead of every wall-clock boundary; during the
//! overlap the writer routes each event by its own `time` field, and the
//! first event strictly past `fill_end` performs the swap. The swap is
//! data-driven on purpose: events inside the overlap may arrive reordered,
//! and only an event beyond the far edge of the window proves the overlap
//! traffic has drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::backup::BackupPipeline;
use crate::names::bucket_name;
use crate::storage::{StorageBucket, StorageDatabase};
use crate::timebase::{self, Interval};

struct RotState {
    current: Box<dyn StorageBucket>,
    next_candidate: Option<Box<dyn StorageBucket>>,
    boundary_time: DateTime<Utc>,
    fill_end: DateTime<Utc>,
    /// `Some(t)` while waiting for the first event at or after the
    /// `--start` instant.
    awaiting_start: Option<DateTime<Utc>>,
    /// `Some(t)` once a drained shutdown has been scheduled.
    stop_time: Option<DateTime<Utc>>,
    stopped: bool,
}

pub struct BucketRotator {
    db: Arc<dyn StorageDatabase>,
    prefix: String,
    interval: Interval,
    safe_margin: ChronoDuration,
    state: Mutex<RotState>,
    /// Signaled by the writer when the overlap ends.
    overlap_cleared: Condvar,
    backup_in_progress: Arc<AtomicBool>,
    shutdown: AtomicBool,
}

impl BucketRotator {
    /// `now` seeds the first bucket and the first boundary; the supervisor
    /// passes the wall clock.
    pub fn new(
        db: Arc<dyn StorageDatabase>,
        prefix: &str,
        interval: Interval,
        safe_margin_secs: i64,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Arc<Self>> {
        let boundary_time = interval.next_after(now);
        let safe_margin = ChronoDuration::seconds(safe_margin_secs);
        let current = db.bucket(&bucket_name(interval, prefix, now))?;
        Ok(Arc::new(Self {
            db,
            prefix: prefix.to_string(),
            interval,
            safe_margin,
            state: Mutex::new(RotState {
                current,
                next_candidate: None,
                boundary_time,
                fill_end: boundary_time + safe_margin,
                awaiting_start: start_time,
                stop_time: None,
                stopped: false,
            }),
            overlap_cleared: Condvar::new(),
            backup_in_progress: Arc::new(AtomicBool::new(false)),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Route one event. Called on the stream thread for every accepted
    /// record; storage failures are fatal and propagate to the supervisor.
    pub fn insert(&self, doc: &Value) -> Result<()> {
        let t = event_time(doc);
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if let Some(start) = st.awaiting_start {
            if t >= start {
                st.current.insert(doc)?;
                st.awaiting_start = None;
            }
            return Ok(());
        }

        if let Some(stop) = st.stop_time {
            if t < stop {
                st.current.insert(doc)?;
            } else if t > stop {
                st.stopped = true;
            }
            return Ok(());
        }

        if let Some(next) = st.next_candidate.as_mut() {
            if t < st.boundary_time {
                st.current.insert(doc)?;
            } else {
                next.insert(doc)?;
                if t > st.fill_end {
                    if let Some(next) = st.next_candidate.take() {
                        let old = std::mem::replace(&mut st.current, next);
                        debug!(
                            sealed = old.name(),
                            current = st.current.name(),
                            "bucket_swap"
                        );
                        drop(old);
                        self.overlap_cleared.notify_all();
                    }
                }
            }
            return Ok(());
        }

        st.current.insert(doc)
    }

    /// Schedule a drained shutdown: events before `stop_time` are still
    /// accepted, the first event after it flips `stopped`.
    pub fn stop_collection(&self, stop_time: DateTime<Utc>) {
        let mut st = self.state.lock();
        st.stop_time = Some(stop_time);
        info!(prefix = %self.prefix, stop_time = %stop_time, "collection_stop_scheduled");
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_backup_in_progress(&self) -> bool {
        self.backup_in_progress.load(Ordering::SeqCst)
    }

    /// Ask the rotation loop to exit after its current wait.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.overlap_cleared.notify_all();
    }

    /// Spawn the rotation loop. One named thread per stream.
    pub fn start(self: &Arc<Self>, backup: Option<Arc<BackupPipeline>>) -> JoinHandle<()> {
        let rotator = Arc::clone(self);
        thread::Builder::new()
            .name(format!("rotator-{}", self.prefix))
            .spawn(move || rotator.rotation_loop(backup))
            .expect("failed to spawn rotator thread")
    }

    fn rotation_loop(&self, backup: Option<Arc<BackupPipeline>>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let boundary = self.state.lock().boundary_time;
            let fill_start = boundary - self.safe_margin;

            timebase::sleep_until(fill_start);
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if let Err(e) = self.open_next(boundary) {
                // Without a next bucket the writer keeps appending to the
                // current one; rotation cannot make progress.
                error!(prefix = %self.prefix, error = %e, "open_next_bucket_failed");
                break;
            }

            // Minimum overlap, then wait for the writer-driven swap.
            thread::sleep(Duration::from_secs(30));
            {
                let mut st = self.state.lock();
                while st.next_candidate.is_some() && !self.shutdown.load(Ordering::Relaxed) {
                    self.overlap_cleared
                        .wait_for(&mut st, Duration::from_secs(5));
                }
            }

            let next_boundary = self.interval.advance(boundary);
            self.state.lock().boundary_time = next_boundary;
            info!(
                prefix = %self.prefix,
                boundary = %next_boundary,
                "rotation_advanced"
            );

            if let Some(pipeline) = &backup {
                self.spawn_backup(Arc::clone(pipeline));
            }
        }
    }

    /// Open the bucket for `boundary` and arm the overlap window.
    /// Exposed to the rotation loop and to tests.
    pub fn open_next(&self, boundary: DateTime<Utc>) -> Result<()> {
        let next = self.db.bucket(&bucket_name(self.interval, &self.prefix, boundary))?;
        let mut st = self.state.lock();
        st.boundary_time = boundary;
        st.fill_end = boundary + self.safe_margin;
        st.next_candidate = Some(next);
        Ok(())
    }

    fn spawn_backup(&self, pipeline: Arc<BackupPipeline>) {
        self.backup_in_progress.store(true, Ordering::SeqCst);
        let flag = Arc::clone(&self.backup_in_progress);
        let spawned = thread::Builder::new()
            .name("backup-cycle".to_string())
            .spawn(move || {
                if let Err(e) = pipeline.run_cycle() {
                    error!(error = %e, "backup_cycle_failed");
                }
                flag.store(false, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            error!(error = %e, "backup_thread_spawn_failed");
            self.backup_in_progress.store(false, Ordering::SeqCst);
        }
    }
}

/// Event placement time: the record's own `time` field, falling back to the
/// receive wall-clock for records that do not carry one.
fn event_time(doc: &Value) -> DateTime<Utc> {
    doc.get("time")
        .and_then(Value::as_str)
        .and_then(timebase::parse_iso)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsDatabase;
    use chrono::TimeZone;
    use regex::Regex;
    use serde_json::json;

    fn at(h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, mi, s).unwrap()
    }

    fn event(seq: u64, time: &str) -> Value {
        json!({"product_id": "BTC-USD", "sequence": seq, "type": "open", "time": time})
    }

    fn bucket_lines(dir: &std::path::Path, name: &str) -> Vec<Value> {
        let content = std::fs::read_to_string(dir.join("feed").join(name)).unwrap();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn fs_rotator(
        dir: &std::path::Path,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Arc<BucketRotator> {
        let db: Arc<dyn StorageDatabase> =
            Arc::new(FsDatabase::open("feed", dir).unwrap());
        BucketRotator::new(db, "full", Interval::EveryMinute, 15, start_time, now).unwrap()
    }

    #[test]
    fn test_straight_through_single_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = fs_rotator(dir.path(), None, at(12, 0, 10));

        for seq in 100..=110 {
            let t = format!("2024-01-01T12:00:{:02}.000Z", 30 + (seq - 100));
            rotator.insert(&event(seq, &t)).unwrap();
        }

        let lines = bucket_lines(dir.path(), "full_2024_01_01_12_00_min");
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0]["sequence"], json!(100));
        assert_eq!(lines[10]["sequence"], json!(110));
    }

    #[test]
    fn test_overlap_routes_by_event_time_and_swaps_past_fill_end() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = fs_rotator(dir.path(), None, at(12, 0, 10));

        // boundary 12:01:00, margin 15s, so fill_end 12:01:15
        rotator.open_next(at(12, 1, 0)).unwrap();

        rotator.insert(&event(1, "2024-01-01T12:00:59.900Z")).unwrap();
        rotator.insert(&event(2, "2024-01-01T12:01:00.500Z")).unwrap();
        // late arrival from before the boundary still lands in the old bucket
        rotator.insert(&event(3, "2024-01-01T12:00:59.950Z")).unwrap();
        // strictly past fill_end: written to the new bucket, then swap
        rotator.insert(&event(4, "2024-01-01T12:01:20.000Z")).unwrap();

        let old = bucket_lines(dir.path(), "full_2024_01_01_12_00_min");
        let new = bucket_lines(dir.path(), "full_2024_01_01_12_01_min");
        assert_eq!(
            old.iter().map(|v| v["sequence"].as_u64().unwrap()).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(
            new.iter().map(|v| v["sequence"].as_u64().unwrap()).collect::<Vec<_>>(),
            vec![2, 4]
        );

        // the overlap is over: a plain write goes to the new current
        rotator.insert(&event(5, "2024-01-01T12:01:21.000Z")).unwrap();
        assert_eq!(bucket_lines(dir.path(), "full_2024_01_01_12_01_min").len(), 3);
    }

    #[test]
    fn test_event_inside_window_does_not_swap() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = fs_rotator(dir.path(), None, at(12, 0, 10));
        rotator.open_next(at(12, 1, 0)).unwrap();

        rotator.insert(&event(1, "2024-01-01T12:01:05.000Z")).unwrap();
        // still inside [boundary, fill_end]: overlap stays armed
        rotator.insert(&event(2, "2024-01-01T12:00:58.000Z")).unwrap();
        let old = bucket_lines(dir.path(), "full_2024_01_01_12_00_min");
        assert_eq!(old.len(), 1);
    }

    #[test]
    fn test_drained_stop_accepts_before_and_stops_after() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = fs_rotator(dir.path(), None, at(12, 0, 10));

        rotator.stop_collection(at(12, 1, 0));
        rotator.insert(&event(1, "2024-01-01T12:00:59.000Z")).unwrap();
        assert!(!rotator.is_stopped());
        rotator.insert(&event(2, "2024-01-01T12:01:05.000Z")).unwrap();
        assert!(rotator.is_stopped());

        let lines = bucket_lines(dir.path(), "full_2024_01_01_12_00_min");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["sequence"], json!(1));
    }

    #[test]
    fn test_start_gate_drops_until_start_instant() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = fs_rotator(dir.path(), Some(at(12, 30, 0)), at(12, 29, 30));

        rotator.insert(&event(1, "2024-01-01T12:29:59.000Z")).unwrap();
        rotator.insert(&event(2, "2024-01-01T12:30:00.000Z")).unwrap();
        rotator.insert(&event(3, "2024-01-01T12:29:58.000Z")).unwrap();

        let lines = bucket_lines(dir.path(), "full_2024_01_01_12_29_min");
        // first event at/after the gate opens the stream; later events flow
        let seqs: Vec<u64> = lines.iter().map(|v| v["sequence"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_missing_time_falls_back_to_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn StorageDatabase> = Arc::new(FsDatabase::open("feed", dir.path()).unwrap());
        let now = Utc::now();
        let rotator =
            BucketRotator::new(db.clone(), "full", Interval::EveryMinute, 15, None, now).unwrap();
        rotator.insert(&json!({"sequence": 1})).unwrap();
        let listed = db.list(&Regex::new("full").unwrap()).unwrap();
        assert_eq!(listed.len(), 1);
    }
}
