//! Landing the crowned run: commit, push, and optionally open a pull request.
//!
//! Runs inside the winning run's worker. The land script's per-step policy is
//! enforced by the script itself (see [`crate::git`]); this module executes
//! it, reads back which steps ran, and handles the pull request step.

use crate::git::{self, parse_pr_url, parse_step_report, StepReport, StepStatus};
use crate::integrations::CredentialsProvider;
use crate::storage::{SettingsStore, TaskStore};
use crate::worker::{worker_for_run, ExecError, ExecRequest, WorkerRegistry};
use crown_core::events::{EventPayload, LandFinishedPayload};
use crown_core::{prompt, Config, Id, Task, TaskRun};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("no connected worker for run {0}")]
    NoWorker(String),
    #[error(transparent)]
    Script(#[from] git::GitScriptError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Outcome of the pull request step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PullRequestOutcome {
    /// Not attempted; `reason` says which gate was closed.
    Skipped { reason: String },
    Created { url: Option<String> },
    Failed { output: String },
}

/// What happened when landing one run.
#[derive(Debug, Clone, Serialize)]
pub struct LandReport {
    pub run_id: Id,
    pub branch: Option<String>,
    /// Set when landing was skipped entirely.
    pub skipped: Option<String>,
    pub steps: Vec<StepReport>,
    pub pull_request: PullRequestOutcome,
}

impl LandReport {
    fn skipped(run_id: &Id, reason: &str) -> Self {
        Self {
            run_id: run_id.clone(),
            branch: None,
            skipped: Some(reason.to_string()),
            steps: Vec::new(),
            pull_request: PullRequestOutcome::Skipped {
                reason: reason.to_string(),
            },
        }
    }

    pub fn pushed(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.name == "push" && s.status == StepStatus::Ok)
    }

    /// First step that failed, if any.
    pub fn failed_step(&self) -> Option<&'static str> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| s.name)
    }

    pub fn pull_request_url(&self) -> Option<&str> {
        match &self.pull_request {
            PullRequestOutcome::Created { url } => url.as_deref(),
            _ => None,
        }
    }
}

/// Drives the land script and pull request creation for a crowned run.
pub struct GitWorkflow {
    store: Arc<dyn TaskStore>,
    settings: Arc<dyn SettingsStore>,
    registry: Arc<dyn WorkerRegistry>,
    credentials: Arc<dyn CredentialsProvider>,
    cwd: Option<String>,
    remote: String,
    git_timeout: Duration,
    pr_timeout: Duration,
    auto_pr_default: bool,
}

impl std::fmt::Debug for GitWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitWorkflow")
            .field("cwd", &self.cwd)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl GitWorkflow {
    pub fn new(
        store: Arc<dyn TaskStore>,
        settings: Arc<dyn SettingsStore>,
        registry: Arc<dyn WorkerRegistry>,
        credentials: Arc<dyn CredentialsProvider>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            settings,
            registry,
            credentials,
            cwd: config.worker_workspace_dir.clone(),
            remote: config.git_remote.clone(),
            git_timeout: config.git_timeout(),
            pr_timeout: config.pr_timeout(),
            auto_pr_default: config.auto_pr_default,
        }
    }

    /// Commit and push `run`'s changes to its branch, then open a pull
    /// request when a token is available and the team allows it.
    pub async fn land(
        &self,
        run: &TaskRun,
        task: &Task,
        agent_name: &str,
        commit_message: &str,
    ) -> Result<LandReport> {
        let Some(branch) = run.branch_name.as_deref().filter(|b| !b.trim().is_empty()) else {
            warn!(run_id = %run.id, "crowned run has no branch, skipping land");
            return Ok(LandReport::skipped(&run.id, "run has no branch"));
        };

        let worker = worker_for_run(self.registry.as_ref(), &run.id)
            .await
            .ok_or_else(|| WorkflowError::NoWorker(run.id.to_string()))?;

        let script = git::build_land_script(branch, commit_message, &self.remote)?;
        let output = worker
            .exec(
                ExecRequest::shell(script.render())
                    .with_cwd(self.cwd.clone())
                    .with_timeout(self.git_timeout),
            )
            .await?;
        let steps = parse_step_report(&script, &output.stdout);

        let mut report = LandReport {
            run_id: run.id.clone(),
            branch: Some(branch.to_string()),
            skipped: None,
            steps,
            pull_request: PullRequestOutcome::Skipped {
                reason: "push did not succeed".to_string(),
            },
        };

        if report.pushed() {
            info!(run_id = %run.id, branch, agent = agent_name, "pushed crowned run");
            report.pull_request = self.open_pull_request(run, task, branch, &*worker).await;
        } else {
            warn!(
                run_id = %run.id,
                branch,
                failed_step = report.failed_step().unwrap_or("unknown"),
                stderr = %output.stderr.trim(),
                "land script did not push"
            );
        }

        self.record(task, &report).await;
        Ok(report)
    }

    async fn open_pull_request(
        &self,
        run: &TaskRun,
        task: &Task,
        branch: &str,
        worker: &dyn crate::worker::RemoteExecutor,
    ) -> PullRequestOutcome {
        let Some(token) = self.credentials.token().await else {
            return PullRequestOutcome::Skipped {
                reason: "no hosting token".to_string(),
            };
        };

        let auto_pr = match self.settings.get_settings(&task.team).await {
            Ok(Some(settings)) => settings.auto_pr_enabled,
            Ok(None) => self.auto_pr_default,
            Err(err) => {
                warn!(team = %task.team, error = %err, "failed to read workspace settings");
                false
            }
        };
        if !auto_pr {
            return PullRequestOutcome::Skipped {
                reason: "auto PR disabled".to_string(),
            };
        }

        let title = task
            .pr_title
            .clone()
            .unwrap_or_else(|| prompt::pr_title(&task.text));
        let body = task
            .pr_description
            .clone()
            .unwrap_or_else(|| task.text.clone());

        let script = match git::build_pr_script(branch, &title, &body) {
            Ok(s) => s,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "cannot build pull request script");
                return PullRequestOutcome::Failed {
                    output: err.to_string(),
                };
            }
        };

        let request = ExecRequest::shell(script.render())
            .with_cwd(self.cwd.clone())
            .with_env("GH_TOKEN", token)
            .with_timeout(self.pr_timeout);
        let output = match worker.exec(request).await {
            Ok(o) => o,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "pull request creation failed");
                return PullRequestOutcome::Failed {
                    output: err.to_string(),
                };
            }
        };

        let created = parse_step_report(&script, &output.stdout)
            .iter()
            .any(|s| s.status == StepStatus::Ok);
        if !created {
            warn!(run_id = %run.id, stderr = %output.stderr.trim(), "pull request creation failed");
            return PullRequestOutcome::Failed {
                output: output.combined(),
            };
        }

        let url = parse_pr_url(&output.combined());
        match &url {
            Some(url) => {
                info!(run_id = %run.id, url = %url, "opened pull request");
                if let Err(err) = self.store.update_run_pull_request_url(&run.id, url).await {
                    warn!(run_id = %run.id, error = %err, "failed to persist pull request url");
                }
            }
            None => warn!(run_id = %run.id, "pull request created but no url in output"),
        }
        PullRequestOutcome::Created { url }
    }

    async fn record(&self, task: &Task, report: &LandReport) {
        let payload = EventPayload::LandFinished(LandFinishedPayload {
            run_id: report.run_id.clone(),
            branch: report.branch.clone(),
            success: report.pushed(),
            pull_request_url: report.pull_request_url().map(str::to_string),
            failed_step: report.failed_step().map(str::to_string),
        });
        if let Err(err) = self
            .store
            .append_event(&task.id, Some(&report.run_id), &payload)
            .await
        {
            warn!(task_id = %task.id, error = %err, "failed to append land event");
        }
    }
}
