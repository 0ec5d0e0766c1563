use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coturn_exporter::agent::Agent;
use coturn_exporter::config::Config;
use tracing_subscriber::{fmt, EnvFilter};

/// Prometheus exporter for coturn allocation and traffic events.
#[derive(Parser)]
#[command(name = "coturn-exporter", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// The address to listen on for HTTP requests (overrides metrics.addr).
    #[arg(long)]
    listen_address: Option<String>,

    /// The redis server used as the coturn statsdb (overrides redis.url).
    #[arg(long)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
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

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("coturn-exporter {}", version::full());
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

    if let Some(addr) = cli.listen_address {
        cfg.metrics.addr = addr;
    }
    if let Some(url) = cli.redis_url {
        cfg.redis.url = url;
    }
    cfg.validate().context("validating configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting coturn-exporter",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                let _ = shutdown_tx.send(());
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await?;

    tracing::info!("coturn-exporter stopped");

    Ok(())
}
