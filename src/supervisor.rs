//! Supervisor: owns the connection loop and every shared handle.
//!
//! There is no package-level mutable state; the `Runtime` struct is built
//! once at startup and explicit handles are passed to each thread. The
//! connection loop reconnects on `Restart` errors with capped exponential
//! backoff and escalates `Fatal` errors to the crash path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::handler::{crash_state_of, StreamEventHandler};
use crate::manager::CollectionManager;
use crate::state::CrashStateStore;
use crate::stream::{StreamClient, StreamCommand, StreamError};

/// A crash-state record older than this is stale: the book has moved too
/// far for seeded sequences to be useful.
const CRASH_STATE_MAX_AGE_MINS: i64 = 5;

// =============================================================================
// RECONNECT BACKOFF
// =============================================================================

/// Capped exponential backoff for websocket restarts. A connection that
/// survived at least 10 seconds reconnects without sleeping; the delay is
/// left where the schedule last put it.
#[derive(Debug)]
pub struct ReconnectBackoff {
    delay: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_secs(1),
        }
    }

    /// How long to sleep before the next attempt, given how long the failed
    /// connection lived.
    pub fn next_delay(&mut self, connection_lifetime: Duration) -> Duration {
        if connection_lifetime < Duration::from_secs(10) {
            let current = self.delay;
            self.delay = (self.delay * 2).min(Duration::from_secs(60));
            current
        } else {
            Duration::ZERO
        }
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

pub struct Runtime {
    pub manager: Arc<CollectionManager>,
    pub handler: Arc<StreamEventHandler>,
    pub crash_store: Arc<CrashStateStore>,
    pub commands: UnboundedSender<StreamCommand>,
}

impl Runtime {
    /// Resume sequence tracking from the last shutdown when it happened
    /// recently enough for the numbers to still be meaningful.
    pub fn seed_from_crash_state(&self) -> Result<()> {
        let Some(state) = self.crash_store.load()? else {
            return Ok(());
        };
        let age = Utc::now() - state.time;
        if age > ChronoDuration::minutes(CRASH_STATE_MAX_AGE_MINS) {
            info!(saved_at = %state.time, "crash state too old, starting clean");
            return Ok(());
        }
        for (product_id, sequence) in &state.sequence {
            if let Some(sequence) = sequence {
                self.handler.seed_sequence(product_id, *sequence);
            }
        }
        for (product_id, trade_id) in &state.last_match_trade_id {
            if let Some(trade_id) = trade_id {
                self.handler.seed_last_match(product_id, *trade_id);
            }
        }
        info!(saved_at = %state.time, "tracker seeded from crash state");
        Ok(())
    }

    /// Drain and persist on the way out. Used by both signal paths and the
    /// top-level crash handler.
    pub fn exit_cleanup(&self) {
        let _ = self.commands.send(StreamCommand::Stop);
        if let Err(e) = self.manager.close() {
            error!(error = %e, "manager close failed during exit");
        }
        let state = crash_state_of(&self.handler, Utc::now());
        if let Err(e) = self.crash_store.save(&state) {
            error!(error = %e, "crash state save failed during exit");
        }
        info!("exit cleanup complete");
    }

    /// The main stream loop: rebuild the client and reconnect until a
    /// commanded stop (`Ok`) or a fatal error.
    pub async fn connection_loop(
        &self,
        websocket_url: &str,
        subscribe_message: Value,
        commands: &mut UnboundedReceiver<StreamCommand>,
    ) -> Result<()> {
        let mut backoff = ReconnectBackoff::new();
        loop {
            let attempt_started = Instant::now();
            let client = StreamClient::new(
                websocket_url,
                subscribe_message.clone(),
                Arc::clone(&self.handler),
            );
            match client.run(commands).await {
                Ok(()) => {
                    info!("stream client stopped");
                    return Ok(());
                }
                Err(StreamError::Restart(reason)) => {
                    warn!(reason, "restarting stream client");
                    let delay = backoff.next_delay(attempt_started.elapsed());
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(StreamError::Fatal(e)) => return Err(e),
            }
        }
    }
}

/// INT/TERM/QUIT drain and exit 0; HUP/USR1/USR2 are treated as crash
/// signals and exit 1.
pub fn spawn_signal_handlers(runtime: Arc<Runtime>) {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::quit(),
    ] {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let Ok(mut sig) = signal(kind) else { return };
            sig.recv().await;
            info!("termination signal received, draining");
            runtime.exit_cleanup();
            std::process::exit(0);
        });
    }

    for kind in [
        SignalKind::hangup(),
        SignalKind::user_defined1(),
        SignalKind::user_defined2(),
    ] {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let Ok(mut sig) = signal(kind) else { return };
            sig.recv().await;
            error!("crash signal received");
            runtime.exit_cleanup();
            std::process::exit(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::EventSink;
    use crate::rest::ExchangeApi;
    use crate::state::CrashState;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct NullSink;

    impl EventSink for NullSink {
        fn insert(&self, _doc: Value) -> Result<()> {
            Ok(())
        }
        fn insert_snapshot(&self, _doc: Value) -> Result<()> {
            Ok(())
        }
    }

    struct NullApi;

    #[async_trait]
    impl ExchangeApi for NullApi {
        async fn order_book(&self, _product_id: &str) -> Result<Value> {
            anyhow::bail!("not used")
        }
        async fn trades(&self, _product_id: &str) -> Result<Vec<Value>> {
            anyhow::bail!("not used")
        }
    }

    #[test]
    fn test_backoff_doubles_on_quick_failures_and_caps() {
        let mut backoff = ReconnectBackoff::new();
        let quick = Duration::from_secs(2);
        let expected = [1u64, 2, 4, 8, 16, 32, 60, 60];
        for secs in expected {
            assert_eq!(backoff.next_delay(quick), Duration::from_secs(secs));
        }
    }

    #[test]
    fn test_backoff_holds_after_stable_connection() {
        let mut backoff = ReconnectBackoff::new();
        let quick = Duration::from_secs(1);
        backoff.next_delay(quick);
        backoff.next_delay(quick);
        // a long-lived connection reconnects immediately
        assert_eq!(backoff.next_delay(Duration::from_secs(3600)), Duration::ZERO);
        // but the schedule is not reset: the next quick failure keeps climbing
        assert_eq!(backoff.next_delay(quick), Duration::from_secs(4));
    }

    fn test_runtime(
        crash_store: Arc<CrashStateStore>,
        product_ids: &[String],
    ) -> (Runtime, UnboundedReceiver<StreamCommand>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn crate::storage::StorageDatabase> =
            Arc::new(crate::storage::FsDatabase::open("feed", dir.path()).unwrap());
        let rotator = crate::rotator::BucketRotator::new(
            db.clone(),
            "full",
            crate::timebase::Interval::EveryMinute,
            15,
            None,
            Utc::now(),
        )
        .unwrap();
        let manager = CollectionManager::new(rotator, None, db);
        let handler = StreamEventHandler::new(Arc::new(NullSink), Arc::new(NullApi), product_ids);
        (
            Runtime {
                manager,
                handler,
                crash_store,
                commands: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_fresh_crash_state_seeds_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(CrashStateStore::open(&dir.path().join("crash.db"), false).unwrap());
        let mut sequence = HashMap::new();
        sequence.insert("BTC-USD".to_string(), Some(110u64));
        sequence.insert("ETH-USD".to_string(), None);
        let mut last_match = HashMap::new();
        last_match.insert("BTC-USD".to_string(), Some(42u64));
        store
            .save(&CrashState {
                time: Utc::now() - ChronoDuration::minutes(2),
                sequence,
                last_match_trade_id: last_match,
            })
            .unwrap();

        let (runtime, _rx) = test_runtime(store, &["BTC-USD".to_string(), "ETH-USD".to_string()]);
        runtime.seed_from_crash_state().unwrap();

        let seeded = runtime.handler.sequences();
        assert_eq!(seeded["BTC-USD"], Some(110));
        // the bottom entry stays unseeded so the first event still resets
        assert_eq!(seeded["ETH-USD"], None);
        assert_eq!(runtime.handler.last_match_ids()["BTC-USD"], Some(42));
    }

    #[test]
    fn test_stale_crash_state_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(CrashStateStore::open(&dir.path().join("crash.db"), false).unwrap());
        let mut sequence = HashMap::new();
        sequence.insert("BTC-USD".to_string(), Some(110u64));
        store
            .save(&CrashState {
                time: Utc::now() - ChronoDuration::minutes(10),
                sequence,
                last_match_trade_id: HashMap::new(),
            })
            .unwrap();

        let (runtime, _rx) = test_runtime(store, &["BTC-USD".to_string()]);
        runtime.seed_from_crash_state().unwrap();
        assert_eq!(runtime.handler.sequences()["BTC-USD"], None);
    }
}
