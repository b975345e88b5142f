//! Remote command execution inside connected workers.
//!
//! A worker is the sandbox hosting one run's workspace. The evaluator never
//! holds worker connections itself; it asks a [`WorkerRegistry`] for the
//! currently connected workers and sends each an [`ExecRequest`]. Delivery is
//! at most once: nothing at this layer retries.

use async_trait::async_trait;
use crown_core::Id;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured from each of stdout and stderr.
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("worker disconnected: {0}")]
    Disconnected(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// A command to run inside a worker.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Working directory. Relative paths resolve against the worker root.
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }

    pub fn with_cwd(mut self, cwd: Option<String>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for logging and URL extraction.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Execution channel to one worker.
#[async_trait]
pub trait RemoteExecutor: Send + Sync + std::fmt::Debug {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput>;
}

/// A worker as seen by the registry.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub run_id: Id,
    pub connected: bool,
    pub handle: Arc<dyn RemoteExecutor>,
}

/// Source of worker connections. Owned outside the evaluator.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    async fn connected_workers(&self) -> Vec<WorkerInfo>;
}

/// Find the connected worker for `run_id`.
pub async fn worker_for_run(
    registry: &dyn WorkerRegistry,
    run_id: &Id,
) -> Option<Arc<dyn RemoteExecutor>> {
    registry
        .connected_workers()
        .await
        .into_iter()
        .find(|w| w.connected && &w.run_id == run_id)
        .map(|w| w.handle)
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Keep reading to drain the pipe but discard
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

async fn collect_output(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    stream: &str,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(err))) => {
            warn!(stream, error = %err, "output capture failed");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(stream, error = %err, "output task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!(stream, "output capture timed out");
            Vec::new()
        }
    }
}

/// A worker whose workspace is a directory on this host.
#[derive(Debug, Clone)]
pub struct LocalWorker {
    root: PathBuf,
}

impl LocalWorker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_cwd(&self, cwd: Option<&str>) -> PathBuf {
        match cwd {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => self.root.join(dir),
            None => self.root.clone(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for LocalWorker {
    async fn exec(&self, request: ExecRequest) -> Result<ExecOutput> {
        let cwd = self.resolve_cwd(request.cwd.as_deref());
        debug!(command = %request.command, cwd = %cwd.display(), "exec in worker");

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&cwd)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
            command: request.command.clone(),
            message: e.to_string(),
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let status = match timeout(request.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed out command");
                }
                return Err(ExecError::Timeout(request.timeout));
            }
        };

        let stdout = collect_output(stdout_task, "stdout").await;
        let stderr = collect_output(stderr_task, "stderr").await;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// In-process registry of local workers, keyed by run id.
///
/// Workers are registered over the HTTP API when a run's sandbox comes up and
/// removed when it goes away.
#[derive(Debug, Default)]
pub struct LocalWorkerRegistry {
    workers: RwLock<HashMap<Id, Arc<LocalWorker>>>,
}

impl LocalWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the worker for `run_id`.
    pub async fn register(&self, run_id: Id, root: impl Into<PathBuf>) {
        let worker = Arc::new(LocalWorker::new(root));
        self.workers.write().await.insert(run_id, worker);
    }

    /// Returns `true` if a worker was registered for `run_id`.
    pub async fn remove(&self, run_id: &Id) -> bool {
        self.workers.write().await.remove(run_id).is_some()
    }

    /// Registered workers as `(run_id, root)` pairs, sorted by run id.
    pub async fn list(&self) -> Vec<(Id, PathBuf)> {
        let mut entries: Vec<(Id, PathBuf)> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(id, w)| (id.clone(), w.root().to_path_buf()))
            .collect();
        entries.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        entries
    }
}

#[async_trait]
impl WorkerRegistry for LocalWorkerRegistry {
    async fn connected_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .read()
            .await
            .iter()
            .map(|(run_id, worker)| WorkerInfo {
                run_id: run_id.clone(),
                connected: true,
                handle: Arc::clone(worker) as Arc<dyn RemoteExecutor>,
            })
            .collect();
        workers.sort_by(|a, b| a.run_id.0.cmp(&b.run_id.0));
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let worker = LocalWorker::new(dir.path());

        let out = worker
            .exec(ExecRequest::shell("echo hello; echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn exec_passes_env_and_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let worker = LocalWorker::new(dir.path());

        let out = worker
            .exec(
                ExecRequest::shell("printf '%s' \"$GREETING\"; pwd")
                    .with_env("GREETING", "hi there")
                    .with_cwd(Some("sub".to_string())),
            )
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.starts_with("hi there"));
        assert!(out.stdout.trim_end().ends_with("sub"));
    }

    #[tokio::test]
    async fn exec_times_out() {
        let dir = TempDir::new().unwrap();
        let worker = LocalWorker::new(dir.path());

        let result = worker
            .exec(ExecRequest::shell("sleep 5").with_timeout(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(ExecError::Timeout(_))));
    }

    #[tokio::test]
    async fn exec_reports_missing_binary() {
        let dir = TempDir::new().unwrap();
        let worker = LocalWorker::new(dir.path());

        let result = worker
            .exec(ExecRequest::new("definitely-not-a-real-binary-xyz", vec![]))
            .await;
        assert!(matches!(result, Err(ExecError::Spawn { .. })));
    }

    #[tokio::test]
    async fn registry_register_find_and_remove() {
        let dir = TempDir::new().unwrap();
        let registry = LocalWorkerRegistry::new();
        let run_id = Id::new();

        assert!(worker_for_run(&registry, &run_id).await.is_none());

        registry.register(run_id.clone(), dir.path()).await;
        assert_eq!(registry.connected_workers().await.len(), 1);
        assert!(worker_for_run(&registry, &run_id).await.is_some());
        assert_eq!(registry.list().await[0].1, dir.path());

        assert!(registry.remove(&run_id).await);
        assert!(!registry.remove(&run_id).await);
        assert!(worker_for_run(&registry, &run_id).await.is_none());
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = ExecOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_code: 0,
        };
        assert_eq!(out.combined(), "a\nb");
    }
}
