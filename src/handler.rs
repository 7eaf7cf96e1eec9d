//! Stream event handler: per-pair sequence continuity and gap repair.
//!
//! Every inbound frame passes through `on_event`. Sequence numbers are
//! strictly increasing per pair; a gap triggers a book reset (fresh level-3
//! REST snapshot) plus a trade back-fill, and the back-filled trades are
//! deduplicated against the live `match` stream via `last_match_trade_id`.
//! REST repair blocks the stream thread for the duration of the calls,
//! which is fine: nothing useful can be processed while the book is torn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::manager::EventSink;
use crate::rest::ExchangeApi;
use crate::timebase;

/// Sequence-continuity state for one subscribed pair. `None` means no event
/// observed yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairTracker {
    pub last_sequence: Option<u64>,
    pub last_match_trade_id: Option<u64>,
    pub gap_recovering: bool,
}

struct PacketRate {
    count: u64,
    since: Instant,
}

pub struct StreamEventHandler {
    sink: Arc<dyn EventSink>,
    api: Arc<dyn ExchangeApi>,
    tracker: RwLock<HashMap<String, PairTracker>>,
    ingress_count: AtomicU64,
    packet_rate: Mutex<PacketRate>,
}

impl StreamEventHandler {
    pub fn new(
        sink: Arc<dyn EventSink>,
        api: Arc<dyn ExchangeApi>,
        product_ids: &[String],
    ) -> Arc<Self> {
        let tracker = product_ids
            .iter()
            .map(|p| (p.clone(), PairTracker::default()))
            .collect();
        Arc::new(Self {
            sink,
            api,
            tracker: RwLock::new(tracker),
            ingress_count: AtomicU64::new(0),
            packet_rate: Mutex::new(PacketRate {
                count: 0,
                since: Instant::now(),
            }),
        })
    }

    /// Process one inbound frame.
    pub async fn on_event(&self, event: Value) -> Result<()> {
        self.ingress_count.fetch_add(1, Ordering::Relaxed);
        self.packet_rate.lock().count += 1;

        let Some(product_id) = event.get("product_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let product_id = product_id.to_string();

        let last = {
            let tracker = self.tracker.read();
            // a pair we are not subscribed to (just removed, or foreign)
            let Some(pair) = tracker.get(&product_id) else {
                return Ok(());
            };
            pair.last_sequence
        };

        let Some(last) = last else {
            self.reset_book(&product_id).await?;
            return Ok(());
        };

        // frames without a sequence (status, heartbeats) carry no book state
        let Some(sequence) = event.get("sequence").and_then(Value::as_u64) else {
            return Ok(());
        };
        if sequence < last {
            // duplicate or pre-reset backlog
            return Ok(());
        }
        if sequence > last + 1 {
            self.on_gap(&product_id, last, sequence).await?;
            if let Some(pair) = self.tracker.write().get_mut(&product_id) {
                pair.gap_recovering = true;
            }
            return Ok(());
        }

        if event.get("type").and_then(Value::as_str) == Some("match") {
            let trade_id = event.get("trade_id").and_then(Value::as_u64);
            let mut tracker = self.tracker.write();
            if let Some(pair) = tracker.get_mut(&product_id) {
                if pair.gap_recovering {
                    if let (Some(trade_id), Some(covered)) = (trade_id, pair.last_match_trade_id) {
                        if trade_id <= covered {
                            // already persisted by the back-fill
                            return Ok(());
                        }
                    }
                    pair.gap_recovering = false;
                }
                if trade_id.is_some() {
                    pair.last_match_trade_id = trade_id;
                }
            }
        }

        self.sink.insert(event)?;

        if let Some(pair) = self.tracker.write().get_mut(&product_id) {
            pair.last_sequence = Some(sequence);
        }
        Ok(())
    }

    /// Discard the locally inferred book for `product_id`: persist a fresh
    /// level-3 snapshot and restart sequence tracking from it.
    async fn reset_book(&self, product_id: &str) -> Result<()> {
        let mut book = self.api.order_book(product_id).await?;
        book["time"] = json!(timebase::now_iso());
        book["product_id"] = json!(product_id);
        let sequence = book.get("sequence").and_then(Value::as_u64);
        self.sink.insert(book)?;
        if let Some(pair) = self.tracker.write().get_mut(product_id) {
            pair.last_sequence = sequence;
        }
        info!(product_id, sequence, "book reset");
        Ok(())
    }

    async fn on_gap(&self, product_id: &str, gap_start: u64, gap_end: u64) -> Result<()> {
        self.reset_book(product_id).await?;
        self.fetch_missing_trades(product_id).await?;

        let packet_rate = {
            let mut rate = self.packet_rate.lock();
            let per_sec = rate.count as f64 / (rate.since.elapsed().as_secs_f64() + 1.0);
            rate.count = 0;
            rate.since = Instant::now();
            per_sec
        };
        let resumed_at = self
            .tracker
            .read()
            .get(product_id)
            .and_then(|p| p.last_sequence);
        warn!(
            product_id,
            gap_start,
            gap_end,
            resumed_at,
            packet_rate,
            "sequence gap, book re-initialized"
        );
        Ok(())
    }

    /// Pull the trades the gap swallowed. The endpoint returns newest-first;
    /// the kept prefix is everything newer than the last match seen live.
    async fn fetch_missing_trades(&self, product_id: &str) -> Result<()> {
        let covered = {
            let tracker = self.tracker.read();
            match tracker.get(product_id).and_then(|p| p.last_match_trade_id) {
                Some(id) => id,
                None => return Ok(()),
            }
        };

        let trades = self.api.trades(product_id).await?;
        let missing: Vec<Value> = trades
            .into_iter()
            .take_while(|t| {
                t.get("trade_id")
                    .and_then(Value::as_u64)
                    .is_some_and(|id| id > covered)
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let newest = missing[0].get("trade_id").and_then(Value::as_u64);
        info!(product_id, covered, newest, "missing trades back-filled");
        if let Some(pair) = self.tracker.write().get_mut(product_id) {
            pair.last_match_trade_id = newest;
        }
        self.sink.insert(json!({
            "product_id": product_id,
            "trades": missing,
        }))
    }

    // -- control-plane operations -------------------------------------------

    /// Add fresh trackers for newly configured pairs. Runs before the
    /// subscribe frame goes out so their first events are not dropped as
    /// unknown.
    pub fn extend_pairs(&self, product_ids: &[String]) {
        let mut tracker = self.tracker.write();
        for p in product_ids {
            tracker.entry(p.clone()).or_default();
        }
    }

    pub fn retire_pairs(&self, product_ids: &[String]) {
        let mut tracker = self.tracker.write();
        for p in product_ids {
            tracker.remove(p);
        }
    }

    pub fn current_pairs(&self) -> Vec<String> {
        self.tracker.read().keys().cloned().collect()
    }

    // -- crash-state seeding ------------------------------------------------

    /// Resume tracking after a quick restart; only pairs still configured
    /// are seeded.
    pub fn seed_sequence(&self, product_id: &str, sequence: u64) {
        if let Some(pair) = self.tracker.write().get_mut(product_id) {
            pair.last_sequence = Some(sequence);
        }
    }

    pub fn seed_last_match(&self, product_id: &str, trade_id: u64) {
        if let Some(pair) = self.tracker.write().get_mut(product_id) {
            pair.last_match_trade_id = Some(trade_id);
        }
    }

    pub fn sequences(&self) -> HashMap<String, Option<u64>> {
        self.tracker
            .read()
            .iter()
            .map(|(p, t)| (p.clone(), t.last_sequence))
            .collect()
    }

    pub fn last_match_ids(&self) -> HashMap<String, Option<u64>> {
        self.tracker
            .read()
            .iter()
            .map(|(p, t)| (p.clone(), t.last_match_trade_id))
            .collect()
    }

    pub fn ingress_count(&self) -> u64 {
        self.ingress_count.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn pair(&self, product_id: &str) -> PairTracker {
        self.tracker.read()[product_id]
    }
}

/// Snapshot of the crash-relevant tracker state, taken at shutdown.
pub fn crash_state_of(handler: &StreamEventHandler, time: DateTime<Utc>) -> crate::state::CrashState {
    crate::state::CrashState {
        time,
        sequence: handler.sequences(),
        last_match_trade_id: handler.last_match_ids(),
    }
}
