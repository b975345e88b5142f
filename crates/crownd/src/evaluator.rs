//! Crown evaluation: pick one winner among a task's completed runs.
//!
//! Evaluation is guarded by a store-level compare-and-set on the task's
//! evaluation status, followed by a check for an existing crown record. There
//! is no in-process lock; concurrent triggers for the same task are resolved
//! by the store.
//!
//! Pipeline: lock, double check, gather completed runs, build candidates
//! (diffs collected concurrently), judge, select, persist, then best-effort
//! downstream work (summary comment, PR metadata, commit message, landing).

use crate::diff::DiffCollector;
use crate::integrations::CommitSummarizer;
use crate::judge::{AuthContext, JudgeRequest, JudgeRouter};
use crate::storage::{StorageError, TaskStore};
use crate::workflow::GitWorkflow;
use crown_core::events::{
    EvaluationFailedPayload, EvaluationStartedPayload, EventPayload, WinnerSelectedPayload,
};
use crown_core::prompt::{self, build_judge_prompt, prepare_diff, NO_CHANGES};
use crown_core::verdict::select_winner;
use crown_core::{Candidate, Id, RunStatus, Selection, Task, TaskRun};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Minimum number of completed runs worth comparing.
pub const MIN_CANDIDATES: usize = 2;

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, EvaluatorError>;

/// Input to [`CrownEvaluator::evaluate_crown`].
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub task_id: Id,
    pub team: String,
    /// Run whose completion triggered the evaluation.
    pub crown_run_id: Option<Id>,
    /// Diff captured for `crown_run_id` at completion time.
    pub precollected_diff: Option<String>,
    pub auth: Option<AuthContext>,
}

impl EvaluationRequest {
    pub fn new(task_id: Id, team: impl Into<String>) -> Self {
        Self {
            task_id,
            team: team.into(),
            crown_run_id: None,
            precollected_diff: None,
            auth: None,
        }
    }
}

/// Result of an evaluation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Another evaluation holds the lock.
    LockNotAcquired,
    /// A crown record already exists.
    AlreadyEvaluated,
    InsufficientCandidates { completed: usize },
    Crowned {
        run_id: Id,
        reason: String,
        /// True when the judge's answer could not be used.
        fallback: bool,
    },
}

/// State carried from a successful selection into downstream work.
struct Crowning {
    task: Task,
    winner: TaskRun,
    candidates: Vec<Candidate>,
    selection: Selection,
}

/// Evaluates tasks and lands the winner.
pub struct CrownEvaluator {
    store: Arc<dyn TaskStore>,
    collector: DiffCollector,
    router: JudgeRouter,
    summarizer: Arc<dyn CommitSummarizer>,
    workflow: GitWorkflow,
}

impl std::fmt::Debug for CrownEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrownEvaluator")
            .field("collector", &self.collector)
            .field("router", &self.router)
            .field("workflow", &self.workflow)
            .finish_non_exhaustive()
    }
}

impl CrownEvaluator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        collector: DiffCollector,
        router: JudgeRouter,
        summarizer: Arc<dyn CommitSummarizer>,
        workflow: GitWorkflow,
    ) -> Self {
        Self {
            store,
            collector,
            router,
            summarizer,
            workflow,
        }
    }

    /// Evaluate `request.task_id` at most once.
    ///
    /// Errors before the winner is persisted mark the task with
    /// `Crown evaluation failed: ...` and are returned. Downstream failures
    /// are logged only.
    pub async fn evaluate_crown(&self, request: EvaluationRequest) -> Result<Outcome> {
        let task_id = request.task_id.clone();

        if !self.store.try_begin_evaluation(&task_id).await? {
            info!(task_id = %task_id, "evaluation already in progress");
            return Ok(Outcome::LockNotAcquired);
        }

        match self.evaluate_locked(&request).await {
            Ok((outcome, Some(crowning))) => {
                self.downstream(&crowning).await;
                Ok(outcome)
            }
            Ok((outcome, None)) => Ok(outcome),
            Err(err) => {
                let message = format!("Crown evaluation failed: {err}");
                error!(task_id = %task_id, error = %err, "crown evaluation failed");
                if let Err(status_err) = self
                    .store
                    .set_task_error_status(&task_id, Some(&message))
                    .await
                {
                    error!(task_id = %task_id, error = %status_err, "failed to record evaluation error");
                }
                self.emit(
                    &task_id,
                    None,
                    EventPayload::EvaluationFailed(EvaluationFailedPayload {
                        task_id: task_id.clone(),
                        message,
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn evaluate_locked(
        &self,
        request: &EvaluationRequest,
    ) -> Result<(Outcome, Option<Crowning>)> {
        let task_id = &request.task_id;

        if self.store.get_crown_evaluation(task_id).await?.is_some() {
            debug!(task_id = %task_id, "task already crowned");
            self.release_crowned(task_id).await;
            return Ok((Outcome::AlreadyEvaluated, None));
        }

        let task = self.store.get_task(task_id).await?;
        let completed: Vec<TaskRun> = self
            .store
            .list_runs_for_task(task_id)
            .await?
            .into_iter()
            .filter(|r| r.status == RunStatus::Completed)
            .collect();

        if completed.len() < MIN_CANDIDATES {
            info!(
                task_id = %task_id,
                completed = completed.len(),
                "not enough completed runs to evaluate"
            );
            self.store.set_task_error_status(task_id, None).await?;
            return Ok((
                Outcome::InsufficientCandidates {
                    completed: completed.len(),
                },
                None,
            ));
        }

        self.emit(
            task_id,
            None,
            EventPayload::EvaluationStarted(EvaluationStartedPayload {
                task_id: task_id.clone(),
                candidate_count: completed.len(),
            }),
        )
        .await;

        let candidates = self.build_candidates(&completed, request).await;
        let run_ids: Vec<Id> = candidates.iter().map(|c| c.run_id.clone()).collect();
        let judge_prompt = build_judge_prompt(&task.text, &candidates);

        let verdict = self
            .router
            .judge(&JudgeRequest {
                prompt: &judge_prompt,
                team: &request.team,
                crown_run_id: request.crown_run_id.as_ref(),
                candidate_run_ids: &run_ids,
                auth: request.auth.as_ref(),
            })
            .await;

        let selection = select_winner(verdict.as_ref(), candidates.len());
        if let Some(cause) = &selection.fallback {
            warn!(task_id = %task_id, cause = ?cause, "falling back to first candidate");
        }
        let winner = completed[selection.index].clone();

        match self
            .store
            .set_crown_winner(task_id, &winner.id, &selection.reason)
            .await
        {
            Ok(_) => {}
            Err(StorageError::AlreadyCrowned(_)) => {
                warn!(task_id = %task_id, "crown record appeared during evaluation");
                self.release_crowned(task_id).await;
                return Ok((Outcome::AlreadyEvaluated, None));
            }
            Err(err) => return Err(err.into()),
        }
        self.release_crowned(task_id).await;

        info!(
            task_id = %task_id,
            run_id = %winner.id,
            agent = %winner.agent_name,
            fallback = selection.fallback.is_some(),
            "crowned run"
        );
        self.emit(
            task_id,
            Some(&winner.id),
            EventPayload::WinnerSelected(WinnerSelectedPayload {
                task_id: task_id.clone(),
                run_id: winner.id.clone(),
                agent_name: winner.agent_name.clone(),
                reason: selection.reason.clone(),
                fallback: selection.fallback.is_some(),
            }),
        )
        .await;

        let outcome = Outcome::Crowned {
            run_id: winner.id.clone(),
            reason: selection.reason.clone(),
            fallback: selection.fallback.is_some(),
        };
        Ok((
            outcome,
            Some(Crowning {
                task,
                winner,
                candidates,
                selection,
            }),
        ))
    }

    /// Clear the evaluation status of a task that has a crown record. The
    /// record is authoritative, so a failure here is logged and not raised.
    async fn release_crowned(&self, task_id: &Id) {
        if let Err(err) = self.store.set_task_error_status(task_id, None).await {
            warn!(task_id = %task_id, error = %err, "failed to clear evaluation status of crowned task");
        }
    }

    /// One candidate per completed run, in run order. All diffs are awaited
    /// before returning.
    async fn build_candidates(
        &self,
        completed: &[TaskRun],
        request: &EvaluationRequest,
    ) -> Vec<Candidate> {
        let diffs = join_all(completed.iter().map(|run| async move {
            let precollected = request
                .precollected_diff
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .filter(|_| request.crown_run_id.as_ref() == Some(&run.id));
            match precollected {
                Some(diff) => Some(diff.to_string()),
                None => self.collector.collect(&run.id).await,
            }
        }))
        .await;

        completed
            .iter()
            .zip(diffs)
            .enumerate()
            .map(|(index, (run, diff))| Candidate {
                index,
                run_id: run.id.clone(),
                agent_name: run.agent_name.clone(),
                exit_code: run.exit_code,
                diff: prepare_diff(diff.as_deref()),
            })
            .collect()
    }

    async fn downstream(&self, crowning: &Crowning) {
        let Crowning {
            task,
            winner,
            candidates,
            selection,
        } = crowning;
        let fallback = selection.fallback.is_some();

        match self.store.has_system_comment(&task.id).await {
            Ok(true) => debug!(task_id = %task.id, "summary comment already present"),
            Ok(false) => {
                let body = prompt::summary_comment(
                    &winner.agent_name,
                    &selection.reason,
                    candidates.len(),
                    fallback,
                );
                if let Err(err) = self.store.add_system_comment(&task.id, &body).await {
                    warn!(task_id = %task.id, error = %err, "failed to add summary comment");
                }
            }
            Err(err) => warn!(task_id = %task.id, error = %err, "failed to check comments"),
        }

        let title = prompt::pr_title(&task.text);
        let description = prompt::pr_description(
            &task.text,
            &winner.agent_name,
            &selection.reason,
            candidates.len(),
        );
        if let Err(err) = self.store.set_pull_request_title(&task.id, &title).await {
            warn!(task_id = %task.id, error = %err, "failed to persist PR title");
        }
        if let Err(err) = self
            .store
            .set_pull_request_description(&task.id, &description)
            .await
        {
            warn!(task_id = %task.id, error = %err, "failed to persist PR description");
        }

        let winner_diff = &candidates[selection.index].diff;
        let summary = if winner_diff == NO_CHANGES {
            None
        } else {
            self.summarizer.summarize(&task.text, winner_diff).await
        };
        let commit_message = summary
            .unwrap_or_else(|| prompt::default_commit_message(&task.text, &winner.agent_name));

        let mut landing_task = task.clone();
        landing_task.pr_title = Some(title);
        landing_task.pr_description = Some(description);

        match self
            .workflow
            .land(winner, &landing_task, &winner.agent_name, &commit_message)
            .await
        {
            Ok(report) => info!(
                task_id = %task.id,
                run_id = %winner.id,
                pushed = report.pushed(),
                pull_request = report.pull_request_url().unwrap_or("none"),
                "land finished"
            ),
            Err(err) => warn!(task_id = %task.id, run_id = %winner.id, error = %err, "land failed"),
        }
    }

    async fn emit(&self, task_id: &Id, run_id: Option<&Id>, payload: EventPayload) {
        if let Err(err) = self.store.append_event(task_id, run_id, &payload).await {
            warn!(task_id = %task_id, error = %err, "failed to append event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::setup_test_repo;
    use crate::integrations::CredentialsProvider;
    use crate::judge::{JudgeTransport, TransportError};
    use crate::storage::tests::{create_test_storage, TestStorage};
    use crate::storage::{SettingsStore, Storage};
    use crate::worker::{LocalWorkerRegistry, WorkerRegistry};
    use async_trait::async_trait;
    use crown_core::events::EventPayload;
    use crown_core::prompt::TRUNCATION_MARKER;
    use crown_core::verdict::EVALUATION_FAILED_REASON;
    use crown_core::{
        CrownEvaluation, EvaluationStatus, Event, TaskComment, Verdict, WorkspaceSettings,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Judge that returns a fixed verdict and records prompts.
    struct StubJudge {
        verdict: Option<Verdict>,
        prompts: Mutex<Vec<String>>,
    }

    impl StubJudge {
        fn new(verdict: Option<(i64, &str)>) -> Arc<Self> {
            Arc::new(Self {
                verdict: verdict.map(|(winner, reason)| Verdict {
                    winner,
                    reason: reason.to_string(),
                }),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl JudgeTransport for Arc<StubJudge> {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn judge(&self, request: &JudgeRequest<'_>) -> crate::judge::Result<Verdict> {
            self.prompts.lock().unwrap().push(request.prompt.to_string());
            self.verdict
                .clone()
                .ok_or_else(|| TransportError::Unavailable("stub".to_string()))
        }
    }

    struct NoSummary;

    #[async_trait]
    impl CommitSummarizer for NoSummary {
        async fn summarize(&self, _task_text: &str, _diff: &str) -> Option<String> {
            None
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl CredentialsProvider for NoCredentials {
        async fn token(&self) -> Option<String> {
            None
        }
    }

    /// Delegating store with a scripted lock and mutation counting.
    struct ScriptedStore {
        inner: Storage,
        lock_grants: AtomicUsize,
        fail_winner: bool,
        fail_clear: bool,
        mutations: AtomicUsize,
    }

    impl ScriptedStore {
        fn new(inner: Storage, lock_grants: usize, fail_winner: bool) -> Self {
            Self {
                inner,
                lock_grants: AtomicUsize::new(lock_grants),
                fail_winner,
                fail_clear: false,
                mutations: AtomicUsize::new(0),
            }
        }

        /// Fail every attempt to clear the evaluation status.
        fn failing_clear(mut self) -> Self {
            self.fail_clear = true;
            self
        }

        fn mutated(&self) {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TaskStore for ScriptedStore {
        async fn get_task(&self, task_id: &Id) -> crate::storage::Result<Task> {
            self.inner.get_task(task_id).await
        }

        async fn list_runs_for_task(&self, task_id: &Id) -> crate::storage::Result<Vec<TaskRun>> {
            self.inner.list_runs_for_task(task_id).await
        }

        async fn get_crown_evaluation(
            &self,
            task_id: &Id,
        ) -> crate::storage::Result<Option<CrownEvaluation>> {
            self.inner.get_crown_evaluation(task_id).await
        }

        async fn try_begin_evaluation(&self, task_id: &Id) -> crate::storage::Result<bool> {
            let granted = self
                .lock_grants
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if granted {
                self.mutated();
                self.inner.try_begin_evaluation(task_id).await?;
            }
            Ok(granted)
        }

        async fn set_crown_winner(
            &self,
            task_id: &Id,
            run_id: &Id,
            reason: &str,
        ) -> crate::storage::Result<CrownEvaluation> {
            self.mutated();
            if self.fail_winner {
                return Err(StorageError::Io("disk full".to_string()));
            }
            self.inner.set_crown_winner(task_id, run_id, reason).await
        }

        async fn set_task_error_status(
            &self,
            task_id: &Id,
            message: Option<&str>,
        ) -> crate::storage::Result<()> {
            self.mutated();
            if self.fail_clear && message.is_none() {
                return Err(StorageError::Io("database is locked".to_string()));
            }
            self.inner.set_task_error_status(task_id, message).await
        }

        async fn set_pull_request_title(&self, task_id: &Id, title: &str) -> crate::storage::Result<()> {
            self.mutated();
            self.inner.set_pull_request_title(task_id, title).await
        }

        async fn set_pull_request_description(
            &self,
            task_id: &Id,
            description: &str,
        ) -> crate::storage::Result<()> {
            self.mutated();
            self.inner
                .set_pull_request_description(task_id, description)
                .await
        }

        async fn update_run_pull_request_url(&self, run_id: &Id, url: &str) -> crate::storage::Result<()> {
            self.mutated();
            self.inner.update_run_pull_request_url(run_id, url).await
        }

        async fn has_system_comment(&self, task_id: &Id) -> crate::storage::Result<bool> {
            self.inner.has_system_comment(task_id).await
        }

        async fn add_system_comment(
            &self,
            task_id: &Id,
            body: &str,
        ) -> crate::storage::Result<TaskComment> {
            self.mutated();
            self.inner.add_system_comment(task_id, body).await
        }

        async fn append_event(
            &self,
            task_id: &Id,
            run_id: Option<&Id>,
            payload: &EventPayload,
        ) -> crate::storage::Result<Event> {
            self.mutated();
            self.inner.append_event(task_id, run_id, payload).await
        }
    }

    struct Harness {
        ts: TestStorage,
        registry: Arc<LocalWorkerRegistry>,
        judge: Arc<StubJudge>,
        task: Task,
        runs: Vec<TaskRun>,
        _repos: Vec<tempfile::TempDir>,
    }

    impl Harness {
        /// `diffs[i]` is written into run i's worker; `None` means no worker.
        async fn new(diffs: &[Option<&str>], verdict: Option<(i64, &str)>) -> Self {
            let ts = create_test_storage().await;
            let registry = Arc::new(LocalWorkerRegistry::new());
            let task = Task::new("team-a", "Add a greeting module");
            ts.storage.insert_task(&task).await.unwrap();

            let mut runs = Vec::new();
            let mut repos = Vec::new();
            for (i, diff) in diffs.iter().enumerate() {
                let run = TaskRun::new(task.id.clone(), format!("agent-{i}"), None);
                ts.storage.insert_run(&run).await.unwrap();
                let run = ts.storage.complete_run(&run.id, Some(0)).await.unwrap();
                if let Some(content) = diff {
                    let (dir, work) = setup_test_repo();
                    std::fs::write(work.join("greeting.txt"), content).unwrap();
                    registry.register(run.id.clone(), &work).await;
                    repos.push(dir);
                }
                runs.push(run);
            }

            Self {
                ts,
                registry,
                judge: StubJudge::new(verdict),
                task,
                runs,
                _repos: repos,
            }
        }

        fn evaluator_with_store(&self, store: Arc<dyn TaskStore>) -> CrownEvaluator {
            let config = crown_core::Config::default();
            let registry: Arc<dyn WorkerRegistry> = self.registry.clone();
            let settings: Arc<dyn SettingsStore> = Arc::new(self.ts.storage.clone());
            let judge: Arc<StubJudge> = Arc::clone(&self.judge);
            let transports: Vec<Box<dyn JudgeTransport>> = vec![Box::new(judge)];
            CrownEvaluator::new(
                Arc::clone(&store),
                DiffCollector::new(Arc::clone(&registry), &config),
                JudgeRouter::new(transports),
                Arc::new(NoSummary),
                GitWorkflow::new(store, settings, registry, Arc::new(NoCredentials), &config),
            )
        }

        fn evaluator(&self) -> CrownEvaluator {
            self.evaluator_with_store(Arc::new(self.ts.storage.clone()))
        }

        fn request(&self) -> EvaluationRequest {
            EvaluationRequest::new(self.task.id.clone(), "team-a")
        }
    }

    #[tokio::test]
    async fn three_runs_judge_picks_third() {
        let h = Harness::new(
            &[Some("hello from zero"), None, Some("hello from two")],
            Some((2, "best")),
        )
        .await;

        let outcome = h.evaluator().evaluate_crown(h.request()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Crowned {
                run_id: h.runs[2].id.clone(),
                reason: "best".to_string(),
                fallback: false,
            }
        );

        let eval = h
            .ts
            .storage
            .get_crown_evaluation(&h.task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.winner_run_id, h.runs[2].id);
        assert_eq!(eval.reason, "best");

        let runs = h.ts.storage.list_runs_for_task(&h.task.id).await.unwrap();
        assert!(!runs[0].crowned);
        assert!(!runs[1].crowned);
        assert!(runs[2].crowned);
        assert_eq!(runs[2].crown_reason.as_deref(), Some("best"));
        assert!(runs[0].crown_reason.is_none());

        let prompt = h.judge.last_prompt();
        assert!(prompt.contains("+hello from zero"));
        assert!(prompt.contains("+hello from two"));
        assert!(prompt.contains("\"gitDiff\": \"No changes detected\""));

        let task = h.ts.storage.get_task(&h.task.id).await.unwrap();
        assert_eq!(task.crown_status, EvaluationStatus::Idle);
        assert_eq!(task.pr_title.as_deref(), Some("Add a greeting module"));
        assert!(h.ts.storage.has_system_comment(&h.task.id).await.unwrap());

        let events: Vec<String> = h
            .ts
            .storage
            .list_events(&h.task.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(events, vec!["EVALUATION_STARTED", "WINNER_SELECTED"]);
    }

    #[tokio::test]
    async fn out_of_range_index_falls_back_to_first() {
        let h = Harness::new(&[None, None, None], Some((3, "phantom"))).await;

        let outcome = h.evaluator().evaluate_crown(h.request()).await.unwrap();
        match outcome {
            Outcome::Crowned {
                run_id,
                reason,
                fallback,
            } => {
                assert_eq!(run_id, h.runs[0].id);
                assert!(reason.contains("invalid index 3"));
                assert!(fallback);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_judge_falls_back_to_first() {
        let h = Harness::new(&[None, None], None).await;

        h.evaluator().evaluate_crown(h.request()).await.unwrap();
        let eval = h
            .ts
            .storage
            .get_crown_evaluation(&h.task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(eval.winner_run_id, h.runs[0].id);
        assert_eq!(eval.reason, EVALUATION_FAILED_REASON);
    }

    #[tokio::test]
    async fn single_completed_run_is_insufficient() {
        let h = Harness::new(&[None], Some((0, "only"))).await;
        let pending = TaskRun::new(h.task.id.clone(), "slow", None);
        h.ts.storage.insert_run(&pending).await.unwrap();

        let outcome = h.evaluator().evaluate_crown(h.request()).await.unwrap();
        assert_eq!(outcome, Outcome::InsufficientCandidates { completed: 1 });
        assert!(h
            .ts
            .storage
            .get_crown_evaluation(&h.task.id)
            .await
            .unwrap()
            .is_none());
        let task = h.ts.storage.get_task(&h.task.id).await.unwrap();
        assert_eq!(task.crown_status, EvaluationStatus::Idle);
        assert!(h.judge.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_evaluation_short_circuits() {
        let h = Harness::new(&[None, None], Some((1, "second"))).await;
        let evaluator = h.evaluator();

        evaluator.evaluate_crown(h.request()).await.unwrap();
        let outcome = evaluator.evaluate_crown(h.request()).await.unwrap();
        assert_eq!(outcome, Outcome::AlreadyEvaluated);
        assert_eq!(h.judge.prompts.lock().unwrap().len(), 1);
        let task = h.ts.storage.get_task(&h.task.id).await.unwrap();
        assert_eq!(task.crown_status, EvaluationStatus::Idle);
    }

    #[tokio::test]
    async fn contended_lock_returns_without_mutation() {
        let h = Harness::new(&[None, None], Some((0, "first"))).await;
        let store = Arc::new(ScriptedStore::new(h.ts.storage.clone(), 1, false));
        let evaluator = h.evaluator_with_store(store.clone());

        let first = evaluator.evaluate_crown(h.request()).await.unwrap();
        assert!(matches!(first, Outcome::Crowned { .. }));
        let before = store.mutations.load(Ordering::SeqCst);

        let second = evaluator.evaluate_crown(h.request()).await.unwrap();
        assert_eq!(second, Outcome::LockNotAcquired);
        assert_eq!(store.mutations.load(Ordering::SeqCst), before);
        assert_eq!(h.judge.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_evaluations_crown_once() {
        let h = Harness::new(&[Some("a"), Some("b"), None], Some((1, "b wins"))).await;
        let evaluator = Arc::new(h.evaluator());

        let (a, b) = tokio::join!(
            evaluator.evaluate_crown(h.request()),
            evaluator.evaluate_crown(h.request())
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Crowned { .. }))
                .count(),
            1
        );

        let runs = h.ts.storage.list_runs_for_task(&h.task.id).await.unwrap();
        assert_eq!(runs.iter().filter(|r| r.crowned).count(), 1);
        assert!(runs[1].crowned);
    }

    #[tokio::test]
    async fn precollected_diff_is_used_for_crown_run() {
        let h = Harness::new(&[None, None], Some((0, "ok"))).await;
        let long = "x".repeat(6_000);
        let mut request = h.request();
        request.crown_run_id = Some(h.runs[1].id.clone());
        request.precollected_diff = Some(long);

        h.evaluator().evaluate_crown(request).await.unwrap();
        let prompt = h.judge.last_prompt();
        let expected = format!("{}{TRUNCATION_MARKER}", "x".repeat(5_000));
        let expected_json = serde_json::to_string(&expected).unwrap();
        assert!(prompt.contains(&expected_json));
        assert!(!prompt.contains(&"x".repeat(5_001)));
    }

    #[tokio::test]
    async fn empty_precollected_diff_is_ignored() {
        let h = Harness::new(&[Some("from worker"), None], Some((0, "ok"))).await;
        let mut request = h.request();
        request.crown_run_id = Some(h.runs[0].id.clone());
        request.precollected_diff = Some("   ".to_string());

        h.evaluator().evaluate_crown(request).await.unwrap();
        assert!(h.judge.last_prompt().contains("+from worker"));
    }

    #[tokio::test]
    async fn persistence_failure_marks_task_error() {
        let h = Harness::new(&[None, None], Some((0, "ok"))).await;
        let store = Arc::new(ScriptedStore::new(h.ts.storage.clone(), 1, true));
        let evaluator = h.evaluator_with_store(store);

        let result = evaluator.evaluate_crown(h.request()).await;
        assert!(result.is_err());

        let task = h.ts.storage.get_task(&h.task.id).await.unwrap();
        let message = task.crown_status.error_message().unwrap().to_string();
        assert!(message.starts_with("Crown evaluation failed: "));
        assert!(message.contains("disk full"));
        assert!(h
            .ts
            .storage
            .get_crown_evaluation(&h.task.id)
            .await
            .unwrap()
            .is_none());

        let events = h.ts.storage.list_events(&h.task.id).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "EVALUATION_FAILED");
    }

    #[tokio::test]
    async fn status_clear_failure_after_crowning_keeps_winner() {
        let h = Harness::new(&[Some("one"), Some("two")], Some((1, "second is better"))).await;
        let store = Arc::new(ScriptedStore::new(h.ts.storage.clone(), 1, false).failing_clear());
        let evaluator = h.evaluator_with_store(store);

        let outcome = evaluator.evaluate_crown(h.request()).await.unwrap();
        assert!(matches!(outcome, Outcome::Crowned { ref run_id, .. } if *run_id == h.runs[1].id));

        let task = h.ts.storage.get_task(&h.task.id).await.unwrap();
        assert!(task.crown_status.error_message().is_none());
        let evaluation = h
            .ts
            .storage
            .get_crown_evaluation(&h.task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(evaluation.winner_run_id, h.runs[1].id);
        assert!(h.ts.storage.has_system_comment(&h.task.id).await.unwrap());

        let events = h.ts.storage.list_events(&h.task.id).await.unwrap();
        assert!(events.iter().all(|e| e.event_type != "EVALUATION_FAILED"));
    }

    #[tokio::test]
    async fn failed_evaluation_can_be_retried() {
        let h = Harness::new(&[None, None], Some((1, "retry"))).await;
        h.ts.storage
            .set_task_error_status(&h.task.id, Some("Crown evaluation failed: earlier"))
            .await
            .unwrap();

        let outcome = h.evaluator().evaluate_crown(h.request()).await.unwrap();
        assert!(matches!(outcome, Outcome::Crowned { .. }));
    }

    #[tokio::test]
    async fn existing_system_comment_is_not_duplicated() {
        let h = Harness::new(&[None, None], Some((0, "ok"))).await;
        h.ts.storage
            .add_system_comment(&h.task.id, "earlier summary")
            .await
            .unwrap();

        h.evaluator().evaluate_crown(h.request()).await.unwrap();
        let comments = h.ts.storage.list_comments(&h.task.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].body, "earlier summary");
        // Settings are untouched by evaluation.
        assert_eq!(
            h.ts.storage.get_settings("team-a").await.unwrap(),
            None::<WorkspaceSettings>
        );
    }
}
