//! Control-plane watcher.
//!
//! The only mutator of the subscription set and the only initiator of a
//! drained shutdown. Wakes 15 seconds before each `update_interval` tick,
//! reloads the configuration, and either schedules the stop, or applies the
//! subscription delta in two phases: tracker first (so the new pair's first
//! events are not dropped as unknown), then the subscribe frame exactly at
//! the tick.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::handler::StreamEventHandler;
use crate::manager::CollectionManager;
use crate::stream::{subscribe_frame, StreamCommand};
use crate::timebase::{self, Interval};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SubscriptionDelta {
    pub fn compute(previous: &[String], current: &[String]) -> Self {
        let prev: HashSet<&String> = previous.iter().collect();
        let cur: HashSet<&String> = current.iter().collect();
        let mut added: Vec<String> = cur.difference(&prev).map(|s| (*s).clone()).collect();
        let mut removed: Vec<String> = prev.difference(&cur).map(|s| (*s).clone()).collect();
        added.sort();
        removed.sort();
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn spawn_watcher(
    config_path: PathBuf,
    update_interval: Interval,
    initial_product_ids: Vec<String>,
    handler: Arc<StreamEventHandler>,
    manager: Arc<CollectionManager>,
    commands: UnboundedSender<StreamCommand>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("config-watcher".to_string())
        .spawn(move || {
            watch_loop(
                config_path,
                update_interval,
                initial_product_ids,
                handler,
                manager,
                commands,
            )
        })
        .expect("failed to spawn config watcher thread")
}

fn watch_loop(
    config_path: PathBuf,
    update_interval: Interval,
    initial_product_ids: Vec<String>,
    handler: Arc<StreamEventHandler>,
    manager: Arc<CollectionManager>,
    commands: UnboundedSender<StreamCommand>,
) {
    let mut prev_product_ids = initial_product_ids;
    let mut next_tick = update_interval.next_after(Utc::now());

    loop {
        next_tick = update_interval.advance(next_tick);
        timebase::sleep_until(next_tick - ChronoDuration::seconds(15));

        let config = match Config::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous state");
                continue;
            }
        };
        let current_product_ids = config.product_ids.clone();
        let delta = SubscriptionDelta::compute(&prev_product_ids, &current_product_ids);

        if config.stop_program > 0 {
            drained_shutdown(&manager, &commands, next_tick);
        } else if !delta.added.is_empty() {
            handler.extend_pairs(&delta.added);
            timebase::sleep_until(next_tick);
            if commands
                .send(StreamCommand::Send(subscribe_frame(&delta.added, true)))
                .is_err()
            {
                warn!("stream command channel closed");
            }
            info!(added = ?delta.added, "product ids added");
        } else if !delta.removed.is_empty() {
            handler.retire_pairs(&delta.removed);
            timebase::sleep_until(next_tick);
            if commands
                .send(StreamCommand::Send(subscribe_frame(&delta.removed, false)))
                .is_err()
            {
                warn!("stream command channel closed");
            }
            info!(removed = ?delta.removed, "product ids removed");
        }

        prev_product_ids = current_product_ids;
    }
}

/// The operator set `stop_program`: drain everything with `time` before the
/// tick, let in-flight backups finish, then leave.
fn drained_shutdown(
    manager: &CollectionManager,
    commands: &UnboundedSender<StreamCommand>,
    stop_time: chrono::DateTime<Utc>,
) -> ! {
    info!(stop_time = %stop_time, "drained shutdown requested");

    while manager.is_backup_in_progress() {
        thread::sleep(Duration::from_secs(30));
    }

    manager.stop_collection(stop_time);
    while !manager.is_stopped() {
        thread::sleep(Duration::from_secs(10));
    }
    thread::sleep(Duration::from_secs(5));

    while manager.is_backup_in_progress() {
        thread::sleep(Duration::from_secs(30));
    }

    let _ = commands.send(StreamCommand::Stop);
    if let Err(e) = manager.close() {
        error!(error = %e, "storage close failed during drained shutdown");
    }
    info!("stopped by operator");
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_delta_added_and_removed() {
        let delta = SubscriptionDelta::compute(
            &ids(&["BTC-USD", "LTC-USD"]),
            &ids(&["BTC-USD", "ETH-USD"]),
        );
        assert_eq!(delta.added, ids(&["ETH-USD"]));
        assert_eq!(delta.removed, ids(&["LTC-USD"]));
    }

    #[test]
    fn test_delta_empty_when_unchanged() {
        let delta = SubscriptionDelta::compute(&ids(&["BTC-USD"]), &ids(&["BTC-USD"]));
        assert!(delta.is_empty());
    }

    #[test]
    fn test_delta_ignores_ordering() {
        let delta = SubscriptionDelta::compute(
            &ids(&["A", "B", "C"]),
            &ids(&["C", "B", "A"]),
        );
        assert!(delta.is_empty());
    }
}
