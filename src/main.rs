//! feedvault - continuous exchange market-data collector
//!
//! Subscribes to the full order-book channel, keeps per-pair sequence
//! continuity, persists events into rotating time buckets, and ships sealed
//! buckets to the backup destination. The control-plane watcher applies
//! subscription changes and drained shutdowns from the config file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};

use feedvault::backup::BackupPipeline;
use feedvault::config::Config;
use feedvault::control::spawn_watcher;
use feedvault::handler::StreamEventHandler;
use feedvault::manager::CollectionManager;
use feedvault::rest::FeedRestClient;
use feedvault::rotator::BucketRotator;
use feedvault::snapshot::spawn_poller;
use feedvault::state::{BackupLog, CrashStateStore};
use feedvault::storage::open_database;
use feedvault::stream::subscribe_frame;
use feedvault::supervisor::{spawn_signal_handlers, Runtime};
use feedvault::{timebase, EventSink, ExchangeApi};

#[derive(Parser, Debug)]
#[command(name = "feedvault")]
#[command(about = "Continuous exchange market-data collector")]
struct Args {
    /// Defer the first accepted event until this ISO-8601 instant
    #[arg(long = "start")]
    start: Option<String>,
}

#[tokio::main]
async fn main() {
    load_env();
    init_tracing();

    if let Err(e) = run().await {
        error!(error = ?e, "collector crashed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("feedvault starting");

    let args = Args::parse();
    let start_time: Option<DateTime<Utc>> = match &args.start {
        Some(raw) => Some(
            timebase::parse_iso(raw)
                .with_context(|| format!("invalid --start timestamp {raw}"))?,
        ),
        None => None,
    };

    let config_path = Config::path();
    let config = Config::load(&config_path)?;

    std::fs::create_dir_all(&config.temp_folder)?;
    std::fs::create_dir_all(&config.temp_backup_folder)?;

    // State stores; development runs start from clean tables.
    let clear = !config.is_production;
    let backup_log = Arc::new(BackupLog::open(&config.backup_info_db_path, clear)?);
    let crash_store = Arc::new(CrashStateStore::open(&config.crash_info_db_path, clear)?);

    // Storage and rotators.
    let db = open_database(config.database_type, &config.database_name, &config.db_path)?;
    let now = Utc::now();
    let stream_rotator = BucketRotator::new(
        db.clone(),
        "full",
        config.stream_backup_interval,
        config.safe_margin_interval,
        start_time,
        now,
    )?;
    let snapshot_rotator = if config.is_snapshot {
        Some(BucketRotator::new(
            db.clone(),
            "orderbook",
            config.snapshot_backup_interval,
            config.safe_margin_interval,
            start_time,
            now,
        )?)
    } else {
        None
    };
    let manager = CollectionManager::new(stream_rotator.clone(), snapshot_rotator.clone(), db.clone());

    let pipeline = config
        .backup_on
        .then(|| BackupPipeline::new(db.clone(), backup_log.clone(), config.backup_config()));
    stream_rotator.start(pipeline.clone());
    if let Some(snapshot_rotator) = &snapshot_rotator {
        snapshot_rotator.start(pipeline.clone());
    }

    // Exchange surfaces and the event handler.
    let api: Arc<dyn ExchangeApi> =
        Arc::new(FeedRestClient::new(&config.rest_url, config.credentials()));
    let sink: Arc<dyn EventSink> = manager.clone();
    let handler = StreamEventHandler::new(sink.clone(), api.clone(), &config.product_ids);

    let (commands_tx, mut commands_rx) = tokio::sync::mpsc::unbounded_channel();
    let runtime = Arc::new(Runtime {
        manager: manager.clone(),
        handler: handler.clone(),
        crash_store: crash_store.clone(),
        commands: commands_tx.clone(),
    });

    runtime.seed_from_crash_state()?;
    spawn_signal_handlers(runtime.clone());

    if config.is_snapshot {
        spawn_poller(api.clone(), sink, handler.clone(), config.snapshot_grid());
    }

    // Hold the first connection until just before the requested start.
    if let Some(start) = start_time {
        let lead_in = start - ChronoDuration::seconds(5);
        if lead_in > Utc::now() {
            info!(start = %start, "waiting for start instant");
            tokio::time::sleep((lead_in - Utc::now()).to_std().unwrap_or_default()).await;
        }
    }

    spawn_watcher(
        config_path,
        config.update_interval,
        config.product_ids.clone(),
        handler.clone(),
        manager.clone(),
        commands_tx,
    );

    info!(product_ids = ?config.product_ids, "stream starting");
    let subscribe = subscribe_frame(&config.product_ids, true);
    let result = runtime
        .connection_loop(&config.websocket_url, subscribe, &mut commands_rx)
        .await;
    if result.is_err() {
        runtime.exit_cleanup();
    }
    result
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the manifest dir (common when running with --manifest-path)
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
