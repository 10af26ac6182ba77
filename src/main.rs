//! Health-check coordinator daemon.
//!
//! ```text
//!   config (TOML + env) ──▶ Services ──┬─▶ stale session reaper ──┐
//!          │                           ├─▶ gauge publisher ──────┤
//!          ▼                           │                         ▼
//!   config watcher ──▶ ArcSwap ────────┘                 SQLite store
//!                                                (credentials, proxies,
//!                                                 node_status, live_updates)
//! ```
//!
//! Check execution is embedded by library users through
//! `CheckScheduler` with their own `CheckExecutor`; this daemon keeps the
//! shared bookkeeping healthy: lost checks are timed out, abandoned
//! credential holds are returned, and pool gauges are exported.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use health_check_pool::config::loader::load_config;
use health_check_pool::config::watcher::{apply_updates, ConfigWatcher};
use health_check_pool::coordinator::{publish_gauges, StaleSessionReaper};
use health_check_pool::lifecycle::shutdown::drain_with_timeout;
use health_check_pool::lifecycle::signals::wait_for_signal;
use health_check_pool::observability::{logging, metrics};
use health_check_pool::{Services, Shutdown};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hc-coordinator")]
#[command(about = "Health-check credential, proxy and node status coordinator", long_about = None)]
struct Args {
    /// TOML configuration file; environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    logging::init(&config.observability.log_level);
    tracing::info!("hc-coordinator v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        database = %config.database.path.display(),
        poll_interval_ms = config.pool.poll_interval_ms,
        max_wait_ms = config.pool.max_wait_ms,
        max_concurrent_checks = config.checks.max_concurrent_checks,
        transition_policy = ?config.status.transition_policy,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let reap_interval = config.checks.reap_interval();
    let services = Services::start(config)?;
    let shutdown = Shutdown::new();
    let mut tasks = tokio::task::JoinSet::new();

    // Keep the watcher alive until exit.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => {
                    tasks.spawn(apply_updates(services.config.clone(), updates, shutdown.subscribe()));
                    Some(handle)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        }
        None => None,
    };

    let reaper = StaleSessionReaper::new(
        services.pool.clone(),
        services.tracker.clone(),
        services.config.clone(),
    );
    tasks.spawn(reaper.run(shutdown.subscribe()));
    tasks.spawn(publish_gauges(
        services.pool.clone(),
        services.tracker.clone(),
        reap_interval,
        shutdown.subscribe(),
    ));

    wait_for_signal().await;
    tracing::info!(subscribers = shutdown.receiver_count(), "Shutting down");
    shutdown.trigger();

    let drained = drain_with_timeout(
        async {
            while tasks.join_next().await.is_some() {}
        },
        SHUTDOWN_GRACE,
    )
    .await;

    match services.pool.pool_status().await {
        Ok(status) => tracing::info!(
            used_capacity = status.used_capacity,
            available_capacity = status.available_capacity,
            "Credential pool at shutdown"
        ),
        Err(e) => tracing::warn!(error = %e, "Could not read pool status at shutdown"),
    }
    for (session_id, username) in services.pool.ledger().snapshot() {
        tracing::warn!(session_id = %session_id, username = %username, "Credential still held at shutdown");
    }

    tracing::info!(clean = drained, "Shutdown complete");
    Ok(())
}
