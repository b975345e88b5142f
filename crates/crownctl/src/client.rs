//! HTTP client for the crownd daemon.

use std::path::Path;

use crown_core::types::{
    CrownEvaluation, EvaluationStatus, Id, Task, TaskComment, TaskRun, WorkspaceSettings,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: crownd\n  → or set CROWND_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check CROWND_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("daemon not ready after {timeout_ms}ms at {addr}\n  → ensure crownd is running\n  → check CROWND_TOKEN if auth is enabled")]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    team: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task: Task,
}

/// Response from GET /tasks/{id}.
#[derive(Debug, Deserialize)]
pub struct TaskDetail {
    pub task: Task,
    pub runs: Vec<TaskRun>,
    pub comments: Vec<TaskComment>,
}

#[derive(Debug, Serialize)]
struct AddRunRequest<'a> {
    agent_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: TaskRun,
}

#[derive(Debug, Serialize)]
struct CompleteRunRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    judge_auth: Option<&'a str>,
}

/// Response from POST /runs/{id}/complete.
#[derive(Debug, Deserialize)]
pub struct CompletedRun {
    pub run: TaskRun,
    pub evaluation_triggered: bool,
}

#[derive(Debug, Serialize)]
struct TriggerCrownRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    crown_run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    judge_auth: Option<&'a str>,
}

/// Result of an explicit crown trigger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CrownOutcome {
    LockNotAcquired,
    AlreadyEvaluated,
    InsufficientCandidates {
        completed: usize,
    },
    Crowned {
        run_id: Id,
        reason: String,
        fallback: bool,
    },
}

#[derive(Debug, Deserialize)]
struct TriggerCrownResponse {
    outcome: CrownOutcome,
}

/// Response from GET /tasks/{id}/crown.
#[derive(Debug, Deserialize)]
pub struct CrownStatus {
    pub task_id: Id,
    pub status: EvaluationStatus,
    pub evaluation: Option<CrownEvaluation>,
    pub stalled: bool,
}

#[derive(Debug, Serialize)]
struct RegisterWorkerRequest<'a> {
    run_id: &'a str,
    root: &'a Path,
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    settings: WorkspaceSettings,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for the daemon readiness check.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for crownd.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    /// Probe `/health`. `Err` means the daemon could not be reached.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon with exponential backoff starting at 200ms.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS)
            .await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }

                    eprintln!(
                        "waiting for daemon at {} (retrying in {}ms)",
                        self.base_url, backoff_ms
                    );

                    let remaining = timeout_ms.saturating_sub(elapsed);
                    tokio::time::sleep(std::time::Duration::from_millis(
                        backoff_ms.min(remaining),
                    ))
                    .await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| "unknown error".to_string());

        if status == 404 {
            return ClientError::NotFound(message);
        }
        ClientError::HttpError { status, message }
    }

    /// Send a request and decode a JSON body.
    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Send a request that returns no body.
    async fn send_empty(&self, request: reqwest::RequestBuilder) -> Result<(), ClientError> {
        let response = request.headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// POST /tasks
    pub async fn create_task(&self, team: &str, text: &str) -> Result<Task, ClientError> {
        let body: TaskResponse = self
            .send(
                self.http
                    .post(self.url("/tasks"))
                    .json(&CreateTaskRequest { team, text }),
            )
            .await?;
        Ok(body.task)
    }

    /// GET /tasks/{id}
    pub async fn get_task(&self, task_id: &str) -> Result<TaskDetail, ClientError> {
        self.send(
            self.http
                .get(self.url(&format!("/tasks/{}", urlencoding::encode(task_id)))),
        )
        .await
    }

    /// POST /tasks/{id}/runs
    pub async fn add_run(
        &self,
        task_id: &str,
        agent_name: &str,
        branch_name: Option<&str>,
    ) -> Result<TaskRun, ClientError> {
        let body: RunResponse = self
            .send(
                self.http
                    .post(self.url(&format!("/tasks/{}/runs", urlencoding::encode(task_id))))
                    .json(&AddRunRequest {
                        agent_name,
                        branch_name,
                    }),
            )
            .await?;
        Ok(body.run)
    }

    /// POST /runs/{id}/complete
    pub async fn complete_run(
        &self,
        run_id: &str,
        exit_code: Option<i32>,
        diff: Option<&str>,
        judge_auth: Option<&str>,
    ) -> Result<CompletedRun, ClientError> {
        self.send(
            self.http
                .post(self.url(&format!("/runs/{}/complete", urlencoding::encode(run_id))))
                .json(&CompleteRunRequest {
                    exit_code,
                    diff,
                    judge_auth,
                }),
        )
        .await
    }

    /// POST /tasks/{id}/crown
    pub async fn crown(
        &self,
        task_id: &str,
        crown_run_id: Option<&str>,
        judge_auth: Option<&str>,
    ) -> Result<CrownOutcome, ClientError> {
        let body: TriggerCrownResponse = self
            .send(
                self.http
                    .post(self.url(&format!("/tasks/{}/crown", urlencoding::encode(task_id))))
                    .json(&TriggerCrownRequest {
                        crown_run_id,
                        judge_auth,
                    }),
            )
            .await?;
        Ok(body.outcome)
    }

    /// GET /tasks/{id}/crown
    pub async fn crown_status(&self, task_id: &str) -> Result<CrownStatus, ClientError> {
        self.send(
            self.http
                .get(self.url(&format!("/tasks/{}/crown", urlencoding::encode(task_id)))),
        )
        .await
    }

    /// POST /workers
    pub async fn register_worker(&self, run_id: &str, root: &Path) -> Result<(), ClientError> {
        self.send_empty(
            self.http
                .post(self.url("/workers"))
                .json(&RegisterWorkerRequest { run_id, root }),
        )
        .await
    }

    /// DELETE /workers/{run_id}
    pub async fn remove_worker(&self, run_id: &str) -> Result<(), ClientError> {
        self.send_empty(
            self.http
                .delete(self.url(&format!("/workers/{}", urlencoding::encode(run_id)))),
        )
        .await
    }

    /// PUT /settings/{team}
    pub async fn put_settings(
        &self,
        team: &str,
        settings: WorkspaceSettings,
    ) -> Result<WorkspaceSettings, ClientError> {
        let body: SettingsResponse = self
            .send(
                self.http
                    .put(self.url(&format!("/settings/{}", urlencoding::encode(team))))
                    .json(&settings),
            )
            .await?;
        Ok(body.settings)
    }
}
