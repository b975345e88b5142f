//! Candidate diff collection.
//!
//! Runs a fixed script in the run's worker that prints everything the run
//! changed: committed and uncommitted changes against the merge base with the
//! remote default branch (or `HEAD` when there is none), plus untracked files.
//! Every failure degrades to `None`.

use crate::git::shell_quote;
use crate::worker::{worker_for_run, ExecRequest, WorkerRegistry};
use crown_core::{Config, Id};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DIFF_SCRIPT: &str = r#"git rev-parse --is-inside-work-tree >/dev/null 2>&1 || exit 1
if git rev-parse --verify -q HEAD >/dev/null; then
  base=$(git merge-base HEAD "refs/remotes/$remote/HEAD" 2>/dev/null) || base=HEAD
  git -c core.quotePath=false --no-pager diff --no-color --no-ext-diff "$base" || exit 1
fi
git ls-files -z --others --exclude-standard |
  xargs -0 sh -c 'for f; do git -c core.quotePath=false --no-pager diff --no-color --no-index -- /dev/null "$f"; done' sh
exit 0
"#;

/// Render the collection script for `remote`.
pub fn diff_script(remote: &str) -> String {
    format!("remote={}\n{DIFF_SCRIPT}", shell_quote(remote))
}

/// Collects diffs from the workers of completed runs.
#[derive(Clone)]
pub struct DiffCollector {
    registry: Arc<dyn WorkerRegistry>,
    cwd: Option<String>,
    remote: String,
    timeout: Duration,
}

impl std::fmt::Debug for DiffCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffCollector")
            .field("cwd", &self.cwd)
            .field("remote", &self.remote)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DiffCollector {
    pub fn new(registry: Arc<dyn WorkerRegistry>, config: &Config) -> Self {
        Self {
            registry,
            cwd: config.worker_workspace_dir.clone(),
            remote: config.git_remote.clone(),
            timeout: config.diff_timeout(),
        }
    }

    /// Diff for `run_id`, or `None` if the worker is gone, the script fails,
    /// or there are no changes.
    pub async fn collect(&self, run_id: &Id) -> Option<String> {
        let Some(worker) = worker_for_run(self.registry.as_ref(), run_id).await else {
            debug!(run_id = %run_id, "no connected worker for diff collection");
            return None;
        };

        let request = ExecRequest::shell(diff_script(&self.remote))
            .with_cwd(self.cwd.clone())
            .with_timeout(self.timeout);

        match worker.exec(request).await {
            Ok(output) if output.success() => {
                let diff = output.stdout.trim();
                if diff.is_empty() {
                    None
                } else {
                    Some(diff.to_string())
                }
            }
            Ok(output) => {
                warn!(
                    run_id = %run_id,
                    exit_code = output.exit_code,
                    stderr = %output.stderr.trim(),
                    "diff collection failed"
                );
                None
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "diff collection failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use crate::worker::{ExecOutput, LocalWorker, LocalWorkerRegistry, RemoteExecutor, WorkerInfo};
    use async_trait::async_trait;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
    }

    async fn collector_for(root: &Path) -> (DiffCollector, Id) {
        let registry = Arc::new(LocalWorkerRegistry::new());
        let run_id = Id::new();
        registry.register(run_id.clone(), root).await;
        (DiffCollector::new(registry, &Config::default()), run_id)
    }

    #[tokio::test]
    async fn collects_tracked_and_untracked_changes() {
        let (_dir, work) = setup_test_repo();
        std::fs::write(work.join("README.md"), "# Changed").unwrap();
        std::fs::write(work.join("new file.txt"), "fresh").unwrap();

        let (collector, run_id) = collector_for(&work).await;
        let diff = collector.collect(&run_id).await.unwrap();
        assert!(diff.contains("+# Changed"));
        assert!(diff.contains("new file.txt"));
        assert!(diff.contains("+fresh"));
    }

    #[tokio::test]
    async fn untracked_files_with_unusual_names_are_collected() {
        let (_dir, work) = setup_test_repo();
        std::fs::write(work.join("café.txt"), "bonjour").unwrap();
        std::fs::write(work.join("say \"hi\".txt"), "hello").unwrap();

        let (collector, run_id) = collector_for(&work).await;
        let diff = collector.collect(&run_id).await.unwrap();
        assert!(diff.contains("+bonjour"));
        assert!(diff.contains("+hello"));
        assert!(diff.contains("café.txt"));
    }

    #[tokio::test]
    async fn includes_commits_since_remote_default_branch() {
        let (_dir, work) = setup_test_repo();
        git(&work, &["update-ref", "refs/remotes/origin/main", "HEAD"]);
        git(
            &work,
            &["symbolic-ref", "refs/remotes/origin/HEAD", "refs/remotes/origin/main"],
        );
        std::fs::write(work.join("lib.rs"), "fn committed() {}").unwrap();
        git(&work, &["add", "."]);
        git(&work, &["commit", "-m", "agent work"]);

        let (collector, run_id) = collector_for(&work).await;
        let diff = collector.collect(&run_id).await.unwrap();
        assert!(diff.contains("+fn committed() {}"));
    }

    #[tokio::test]
    async fn clean_repo_yields_none() {
        let (_dir, work) = setup_test_repo();
        let (collector, run_id) = collector_for(&work).await;
        assert!(collector.collect(&run_id).await.is_none());
    }

    #[tokio::test]
    async fn non_repo_yields_none() {
        let dir = TempDir::new().unwrap();
        let (collector, run_id) = collector_for(dir.path()).await;
        assert!(collector.collect(&run_id).await.is_none());
    }

    #[tokio::test]
    async fn missing_worker_yields_none() {
        let registry = Arc::new(LocalWorkerRegistry::new());
        let collector = DiffCollector::new(registry, &Config::default());
        assert!(collector.collect(&Id::new()).await.is_none());
    }

    #[tokio::test]
    async fn slow_script_is_cut_off_by_diff_timeout() {
        let (dir, work) = setup_test_repo();
        std::fs::write(work.join("slow.txt"), "slow").unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        // A `git` shim that stalls before delegating.
        let shim = bin.join("git");
        let real_git = String::from_utf8(
            Command::new("sh")
                .args(["-c", "command -v git"])
                .output()
                .unwrap()
                .stdout,
        )
        .unwrap();
        std::fs::write(
            &shim,
            format!("#!/bin/sh\nsleep 30\nexec {} \"$@\"\n", real_git.trim()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let run_id = Id::new();
        let worker = PathWorker {
            inner: LocalWorker::new(&work),
            bin,
        };
        let registry = Arc::new(SingleRegistry(WorkerInfo {
            run_id: run_id.clone(),
            connected: true,
            handle: Arc::new(worker),
        }));
        let config = Config {
            diff_timeout_sec: 1,
            ..Config::default()
        };
        let collector = DiffCollector::new(registry, &config);

        let started = std::time::Instant::now();
        assert!(collector.collect(&run_id).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    /// Local worker with `bin` prepended to PATH.
    #[derive(Debug)]
    struct PathWorker {
        inner: LocalWorker,
        bin: std::path::PathBuf,
    }

    #[async_trait]
    impl RemoteExecutor for PathWorker {
        async fn exec(&self, request: ExecRequest) -> crate::worker::Result<ExecOutput> {
            let path = format!(
                "{}:{}",
                self.bin.display(),
                std::env::var("PATH").unwrap_or_default()
            );
            self.inner.exec(request.with_env("PATH", path)).await
        }
    }

    struct SingleRegistry(WorkerInfo);

    #[async_trait]
    impl WorkerRegistry for SingleRegistry {
        async fn connected_workers(&self) -> Vec<WorkerInfo> {
            vec![self.0.clone()]
        }
    }

    #[test]
    fn script_binds_remote_quoted() {
        let script = diff_script("up'stream");
        assert!(script.starts_with(r"remote='up'\''stream'"));
    }
}
