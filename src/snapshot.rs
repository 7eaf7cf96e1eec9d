//! Order-book snapshot poller.
//!
//! Runs on its own thread, aligned to a wall-clock grid: minutes in
//! production, seconds in development. Every tick pulls a level-3 book per
//! tracked pair and forwards it to the snapshot rotator, stamped with the
//! scheduled instant rather than the receive instant so snapshot buckets
//! line up across pairs.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde_json::json;
use tracing::{error, info};

use crate::handler::StreamEventHandler;
use crate::manager::EventSink;
use crate::rest::ExchangeApi;
use crate::timebase;

/// Poll cadence on the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotGrid {
    Minutes(u32),
    Seconds(u32),
}

impl SnapshotGrid {
    /// Truncate `t` down to the grid.
    pub fn align(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let t = t.with_nanosecond(0).expect("zero nanosecond is valid");
        match self {
            Self::Minutes(m) => {
                let m = (*m).max(1);
                t.with_second(0)
                    .and_then(|t| t.with_minute(t.minute() / m * m))
                    .expect("aligned minute is valid")
            }
            Self::Seconds(s) => {
                let s = (*s).max(1);
                t.with_second(t.second() / s * s).expect("aligned second is valid")
            }
        }
    }

    pub fn step(&self) -> ChronoDuration {
        match self {
            Self::Minutes(m) => ChronoDuration::minutes((*m).max(1) as i64),
            Self::Seconds(s) => ChronoDuration::seconds((*s).max(1) as i64),
        }
    }

    /// First scheduled instant strictly after `now`.
    pub fn first_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.align(now) + self.step()
    }
}

pub fn spawn_poller(
    api: Arc<dyn ExchangeApi>,
    sink: Arc<dyn EventSink>,
    handler: Arc<StreamEventHandler>,
    grid: SnapshotGrid,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("snapshot-poller".to_string())
        .spawn(move || poll_loop(api, sink, handler, grid))
        .expect("failed to spawn snapshot poller thread")
}

fn poll_loop(
    api: Arc<dyn ExchangeApi>,
    sink: Arc<dyn EventSink>,
    handler: Arc<StreamEventHandler>,
    grid: SnapshotGrid,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build snapshot runtime");

    let mut scheduled = grid.first_after(Utc::now());
    loop {
        timebase::sleep_until(scheduled);

        let pairs = handler.current_pairs();
        info!(?pairs, at = %scheduled, "snapshot poll started");
        let stamp = scheduled.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        for product_id in pairs {
            match rt.block_on(api.order_book(&product_id)) {
                Ok(mut book) => {
                    book["time"] = json!(stamp);
                    book["product_id"] = json!(product_id);
                    if let Err(e) = sink.insert_snapshot(book) {
                        error!(product_id, error = %e, "snapshot persist failed");
                    }
                }
                Err(e) => error!(product_id, error = %e, "snapshot fetch failed"),
            }
        }

        // skip any deadlines that slid past while polling
        scheduled = scheduled + grid.step();
        let now = Utc::now();
        while scheduled <= now {
            scheduled = scheduled + grid.step();
        }
    }
}
