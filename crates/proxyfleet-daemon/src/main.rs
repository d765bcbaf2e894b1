//! proxyfleet Daemon
//!
//! The daemon supervises the local proxy engine, keeps every registered
//! remote node converged with the persisted user set, and accounts
//! traffic into hour-bucketed usage counters.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use proxyfleet_core::engine::ConfigResolver;
use proxyfleet_daemon::engine::{EngineProcess, Readiness};
use proxyfleet_daemon::monitor::{MonitorIntervals, spawn_monitors};
use proxyfleet_daemon::orchestration::Orchestrator;
use proxyfleet_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "proxyfleet-daemon")]
#[command(version, about = "proxyfleet daemon - proxy-engine fleet supervisor")]
struct Args {
    /// Database file path
    #[arg(long, env = "PROXYFLEET_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Engine config file (JSON), the base document merged with user accounts
    #[arg(long, env = "PROXYFLEET_CONFIG")]
    config_path: PathBuf,

    /// Path to the proxy engine binary
    #[arg(long, default_value = "xray", env = "PROXYFLEET_ENGINE_BIN")]
    engine_bin: PathBuf,

    /// Extra argument passed to the engine binary (repeatable)
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Loopback port for the injected engine control API
    #[arg(long, default_value_t = 62099, env = "PROXYFLEET_API_PORT")]
    api_port: u16,

    /// Inbound tag that lends its port and TLS parameters to inbounds
    /// configured without a port
    #[arg(long, env = "PROXYFLEET_FALLBACK_INBOUND_TAG")]
    fallback_inbound_tag: Option<String>,

    /// Seconds to wait for the engine control API after spawning
    #[arg(long, default_value_t = 15, env = "PROXYFLEET_STARTUP_DEADLINE")]
    startup_deadline: u64,

    /// Seconds between local engine liveness checks
    #[arg(long, default_value_t = 15, env = "PROXYFLEET_LIVENESS_INTERVAL")]
    liveness_interval: u64,

    /// Seconds between node reconciliation sweeps
    #[arg(long, default_value_t = 15, env = "PROXYFLEET_RECONCILE_INTERVAL")]
    reconcile_interval: u64,

    /// Seconds between per-user usage accounting sweeps
    #[arg(long, default_value_t = 10, env = "PROXYFLEET_USER_USAGE_INTERVAL")]
    user_usage_interval: u64,

    /// Seconds between node usage accounting sweeps
    #[arg(long, default_value_t = 10, env = "PROXYFLEET_NODE_USAGE_INTERVAL")]
    node_usage_interval: u64,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "PROXYFLEET_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PROXYFLEET_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("proxyfleet_daemon={0},proxyfleet_core={0}", args.log_level);
    proxyfleet_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = %args.engine_bin.display(),
        api_port = args.api_port,
        "Starting proxyfleet-daemon"
    );

    let db = if let Some(path) = &args.db_path {
        info!(path = %path.display(), "Opening database");
        Database::open(path).await?
    } else {
        let default_path = default_db_path()?;
        info!(path = %default_path.display(), "Opening database (default path)");
        Database::open(&default_path).await?
    };

    let raw_config = tokio::fs::read_to_string(&args.config_path).await?;
    let resolver = ConfigResolver::new(args.api_port, args.fallback_inbound_tag.clone());
    let mut base_config = resolver.parse(&raw_config)?;
    resolver.resolve(&mut base_config)?;
    resolver.inject_control_plane(&mut base_config);
    info!(
        inbounds = base_config.profiles().len(),
        "Engine config resolved"
    );

    let engine = Arc::new(EngineProcess::new(
        args.engine_bin.clone(),
        args.engine_args.clone(),
        Readiness::ApiProbe {
            port: args.api_port,
            deadline: Duration::from_secs(args.startup_deadline),
        },
    ));
    let orchestrator = Arc::new(Orchestrator::new(db, resolver, base_config, engine)?);

    // A failed initial start is retried by the liveness monitor.
    if let Err(e) = orchestrator.start_local_engine().await {
        warn!(error = %e, "Initial engine start failed");
    }
    Arc::clone(&orchestrator).connect_all().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let intervals = MonitorIntervals {
        liveness: Duration::from_secs(args.liveness_interval),
        reconcile: Duration::from_secs(args.reconcile_interval),
        user_usage: Duration::from_secs(args.user_usage_interval),
        node_usage: Duration::from_secs(args.node_usage_interval),
    };
    let monitor_handles = spawn_monitors(Arc::clone(&orchestrator), intervals, shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so the engine child process does not
    // accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Daemon ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for handle in monitor_handles {
        let _ = handle.await;
    }
    if let Err(e) = orchestrator.stop_local_engine().await {
        warn!(error = %e, "Engine stop on shutdown failed");
    }

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: ~/.proxyfleet/daemon.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".proxyfleet").join("daemon.db"))
}
