use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use perfcap::config::{Config, ConfigOverrides};
use perfcap::engine::{Engine, EngineDeps};
use perfcap::store::Store;

/// Scenario-based performance capture for a single host.
#[derive(Parser)]
#[command(name = "perfcap", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path of the store the run is written to.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Master sampling interval in seconds.
    #[arg(long)]
    interval: Option<f64>,

    /// Executable name to monitor; repeatable.
    #[arg(long = "process")]
    processes: Vec<String>,

    /// Capture disk throughput counters.
    #[arg(long)]
    disk: bool,

    /// Capture network byte counters.
    #[arg(long)]
    network: bool,

    /// Capture a database inventory snapshot at run open.
    #[arg(long)]
    db_counters: bool,

    /// Connection string for the database inventory snapshot.
    #[arg(long)]
    db_connection: Option<String>,

    /// Connection string for DMV sampling; enables the sampler.
    #[arg(long)]
    dmv_connection: Option<String>,

    /// DMV polling interval in seconds.
    #[arg(long)]
    dmv_interval: Option<f64>,

    /// Scenario label recorded on the run.
    #[arg(long)]
    scenario: Option<String>,

    /// Free-form notes recorded on the run.
    #[arg(long)]
    notes: Option<String>,

    /// Capture duration (e.g. "90s", "10m"); runs until interrupt when
    /// absent.
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database_path: self.db.clone(),
            sample_interval: self.interval.map(Duration::from_secs_f64),
            process_names: self.processes.clone(),
            enable_disk_metrics: self.disk,
            enable_network_metrics: self.network,
            enable_db_counters: self.db_counters,
            sql_connection_string: None,
            db_connection_string: self.db_connection.clone(),
            scenario: self.scenario.clone(),
            notes: self.notes.clone(),
            duration: self.duration,
            dmv_sample_interval: self.dmv_interval.map(Duration::from_secs_f64),
            dmv_connection_string: self.dmv_connection.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("perfcap {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    cfg.apply_overrides(&cli.overrides());
    cfg.validate()?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting perfcap",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let store = Arc::new(Store::open(&cfg.database_path).context("opening store")?);

    let duration = cfg.duration;
    let deps = EngineDeps::production(&cfg);

    let mut engine = Engine::new(cfg, store, deps);
    engine.start().await?;

    let cancel = engine.cancellation();

    // The run ends on interrupt, on the configured duration, or on a fatal
    // error inside the engine, whichever comes first.
    tokio::select! {
        _ = interrupted() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = bounded(duration) => {
            tracing::info!("capture duration elapsed, shutting down");
        }
        _ = cancel.cancelled() => {}
    }

    engine.stop().await?;

    tracing::info!("perfcap stopped");

    Ok(())
}

async fn interrupted() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Completes when the optional capture duration elapses; pends forever
/// without one.
async fn bounded(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
