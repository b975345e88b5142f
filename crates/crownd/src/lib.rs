//! crownd - crown evaluation daemon.
//!
//! Library components for the daemon process: persistence, worker execution,
//! diff collection, judging, git landing and the HTTP API.

pub mod diff;
pub mod evaluator;
pub mod git;
pub mod integrations;
pub mod judge;
pub mod server;
pub mod storage;
pub mod watchdog;
pub mod worker;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use crown_core::Config;
use diff::DiffCollector;
use evaluator::CrownEvaluator;
use integrations::{EnvCredentials, HttpSummarizer};
use judge::JudgeRouter;
use server::AppState;
use storage::{Storage, StorageError};
use thiserror::Error;
use tracing::{error, info};
use watchdog::{Watchdog, WatchdogConfig};
use worker::{LocalWorkerRegistry, WorkerRegistry};
use workflow::GitWorkflow;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("judge setup failed: {0}")]
    Judge(#[from] judge::TransportError),
    #[error("http client setup failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error: {0}")]
    Server(String),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    pub port: u16,
    /// Bearer token for the HTTP API.
    pub auth_token: Option<String>,
    pub crown: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("CROWND_AUTH_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            crown: Config::default(),
        }
    }
}

/// Default database path (~/.local/share/crownd/crownd.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("crownd").join("crownd.db")
}

/// Wire an evaluator over `storage` and `registry`.
pub fn build_evaluator(
    storage: Arc<Storage>,
    registry: Arc<dyn WorkerRegistry>,
    config: &Config,
) -> Result<CrownEvaluator, DaemonError> {
    let collector = DiffCollector::new(Arc::clone(&registry), config);
    let router = JudgeRouter::from_config(Arc::clone(&registry), config)?;
    let summarizer = Arc::new(HttpSummarizer::new(config)?);
    let workflow = GitWorkflow::new(
        storage.clone(),
        storage.clone(),
        registry,
        Arc::new(EnvCredentials),
        config,
    );
    Ok(CrownEvaluator::new(
        storage, collector, router, summarizer, workflow,
    ))
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    registry: Arc<LocalWorkerRegistry>,
    evaluator: Arc<CrownEvaluator>,
    watchdog: Arc<Watchdog>,
}

impl Daemon {
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let registry = Arc::new(LocalWorkerRegistry::new());
        let evaluator = build_evaluator(Arc::clone(&storage), registry.clone(), &config.crown)?;
        let watchdog = Arc::new(Watchdog::new(
            Arc::clone(&storage),
            WatchdogConfig::from_config(&config.crown),
        ));

        Ok(Self {
            config,
            storage,
            registry,
            evaluator: Arc::new(evaluator),
            watchdog,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Serve the HTTP API and run the watchdog until the server exits.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!("crownd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("judge: {}", self.config.crown.judge_base_url);
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let watchdog = Arc::clone(&self.watchdog);
        let watchdog_handle = tokio::spawn(async move { watchdog.run().await });

        let state = Arc::new(AppState {
            storage: Arc::clone(&self.storage),
            registry: Arc::clone(&self.registry),
            evaluator: Arc::clone(&self.evaluator),
            stall_timeout: self.config.crown.stall_timeout(),
            auth_token: self.config.auth_token.clone(),
        });
        let result = server::start_server(state, self.config.port).await;

        watchdog_handle.abort();
        result.map_err(|e| {
            error!("HTTP server error: {}", e);
            DaemonError::Server(e.to_string())
        })
    }

    /// Signal background loops to stop.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.watchdog.shutdown();
    }
}
