//! crownd - crown evaluation daemon.
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use crown_core::Config;
use crownd::{Daemon, DaemonConfig, DEFAULT_PORT};
use eyre::WrapErr;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "crownd", about = "Crown evaluation daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Config file (overrides .crown/config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Judging service base URL
    #[arg(long, env = "CROWND_JUDGE_URL")]
    judge_url: Option<String>,
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    let mut config = Config::discover(&cwd).wrap_err("failed to load .crown/config")?;
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config file {}", path.display()))?;
    }
    if let Some(url) = &cli.judge_url {
        config.judge_base_url = url.clone();
    }
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = DaemonConfig {
        port: cli.port,
        crown: load_config(&cli)?,
        ..Default::default()
    };
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                    }
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down");
                    daemon.shutdown();
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    daemon.shutdown();
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = daemon.run() => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    daemon.shutdown();
                }
            }
        }

        Ok(())
    })
}
