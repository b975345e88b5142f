//! HTTP control plane for crownd.
//!
//! Local-only REST API: tasks, runs, worker registration, crown triggers and
//! team settings. Optional bearer auth on every route except `/health`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use crown_core::{
    CrownEvaluation, EvaluationStatus, Event, Id, RunStatus, Task, TaskComment, TaskRun,
    WorkspaceSettings,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::evaluator::{CrownEvaluator, EvaluationRequest, EvaluatorError, Outcome, MIN_CANDIDATES};
use crate::judge::AuthContext;
use crate::storage::{Storage, StorageError, TaskStore};
use crate::worker::LocalWorkerRegistry;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub registry: Arc<LocalWorkerRegistry>,
    pub evaluator: Arc<CrownEvaluator>,
    pub stall_timeout: Duration,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/runs", post(add_run))
        .route("/tasks/{id}/crown", post(trigger_crown).get(crown_status))
        .route("/tasks/{id}/events", get(list_events))
        .route("/runs/{id}/status", post(update_run_status))
        .route("/runs/{id}/complete", post(complete_run))
        .route("/workers", post(register_worker).get(list_workers))
        .route("/workers/{run_id}", delete(remove_worker))
        .route("/settings/{team}", put(put_settings))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server on 127.0.0.1.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(context: &str, err: StorageError) -> ApiError {
    match err {
        StorageError::TaskNotFound(_) | StorageError::RunNotFound(_) => {
            warn!("{}: {}", context, err);
            api_error(StatusCode::NOT_FOUND, err.to_string())
        }
        err => {
            error!("{}: {}", context, err);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}: {}", context, err),
            )
        }
    }
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
        None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
    }
}

// --- Request/Response types ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub team: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    pub task: Task,
    pub runs: Vec<TaskRun>,
    pub comments: Vec<TaskComment>,
}

#[derive(Debug, Deserialize)]
pub struct AddRunRequest {
    pub agent_name: String,
    #[serde(default)]
    pub branch_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: TaskRun,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRunStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRunRequest {
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Diff captured by the worker when the run finished.
    #[serde(default)]
    pub diff: Option<String>,
    /// Header value forwarded to the judging service.
    #[serde(default)]
    pub judge_auth: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteRunResponse {
    pub run: TaskRun,
    pub evaluation_triggered: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerCrownRequest {
    #[serde(default)]
    pub crown_run_id: Option<String>,
    #[serde(default)]
    pub judge_auth: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerCrownResponse {
    pub outcome: Outcome,
}

#[derive(Debug, Serialize)]
pub struct CrownStatusResponse {
    pub task_id: Id,
    pub status: EvaluationStatus,
    pub evaluation: Option<CrownEvaluation>,
    /// Lock held past the stall timeout with no crown record.
    pub stalled: bool,
}

#[derive(Debug, Serialize)]
struct EventData {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    event_type: String,
    timestamp: i64,
    payload: serde_json::Value,
}

impl From<&Event> for EventData {
    fn from(event: &Event) -> Self {
        let payload: serde_json::Value =
            serde_json::from_str(&event.payload_json).unwrap_or(serde_json::Value::Null);
        EventData {
            id: event.id.to_string(),
            run_id: event.run_id.as_ref().map(|id| id.to_string()),
            event_type: event.event_type.clone(),
            timestamp: event.timestamp.timestamp_millis(),
            payload,
        }
    }
}

#[derive(Debug, Serialize)]
struct ListEventsResponse {
    events: Vec<EventData>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub run_id: String,
    /// Working tree the worker executes commands in.
    pub root: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct WorkerEntry {
    pub run_id: Id,
    pub root: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ListWorkersResponse {
    pub workers: Vec<WorkerEntry>,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub team: String,
    pub settings: WorkspaceSettings,
}

fn auth_context(value: Option<String>) -> Option<AuthContext> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|header_value| AuthContext { header_value })
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /tasks
async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    if req.team.trim().is_empty() || req.text.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "team and text must not be empty",
        ));
    }

    let task = Task::new(req.team, req.text);
    state
        .storage
        .insert_task(&task)
        .await
        .map_err(|e| storage_error("failed to create task", e))?;

    info!(task_id = %task.id, team = %task.team, "created task");
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    let task = state
        .storage
        .get_task(&task_id)
        .await
        .map_err(|e| storage_error("failed to load task", e))?;
    let runs = state
        .storage
        .list_runs_for_task(&task_id)
        .await
        .map_err(|e| storage_error("failed to list runs", e))?;
    let comments = state
        .storage
        .list_comments(&task_id)
        .await
        .map_err(|e| storage_error("failed to list comments", e))?;

    Ok(Json(TaskDetailResponse {
        task,
        runs,
        comments,
    }))
}

/// POST /tasks/{id}/runs
async fn add_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<AddRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    if req.agent_name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "agent_name must not be empty"));
    }

    let branch = req.branch_name.filter(|b| !b.trim().is_empty());
    let run = TaskRun::new(Id::from_string(id), req.agent_name, branch);
    state
        .storage
        .insert_run(&run)
        .await
        .map_err(|e| storage_error("failed to add run", e))?;

    info!(task_id = %run.task_id, run_id = %run.id, agent = %run.agent_name, "added run");
    Ok((StatusCode::CREATED, Json(RunResponse { run })))
}

/// POST /runs/{id}/status
async fn update_run_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateRunStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let status = RunStatus::parse(&req.status).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("unknown run status: {}", req.status),
        )
    })?;

    let run_id = Id::from_string(id);
    state
        .storage
        .update_run_status(&run_id, status)
        .await
        .map_err(|e| storage_error("failed to update run", e))?;

    info!(run_id = %run_id, status = status.as_str(), "updated run status");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /runs/{id}/complete
///
/// Once the task has enough completed runs and no crown record, evaluation
/// starts in the background with this run as the crown run.
async fn complete_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<CompleteRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(id);
    let run = state
        .storage
        .complete_run(&run_id, req.exit_code)
        .await
        .map_err(|e| storage_error("failed to complete run", e))?;
    info!(run_id = %run.id, exit_code = ?run.exit_code, "run completed");

    let task = state
        .storage
        .get_task(&run.task_id)
        .await
        .map_err(|e| storage_error("failed to load task", e))?;
    let completed = state
        .storage
        .list_runs_for_task(&task.id)
        .await
        .map_err(|e| storage_error("failed to list runs", e))?
        .iter()
        .filter(|r| r.status == RunStatus::Completed)
        .count();
    let crowned = state
        .storage
        .get_crown_evaluation(&task.id)
        .await
        .map_err(|e| storage_error("failed to load crown record", e))?
        .is_some();

    let evaluation_triggered = completed >= MIN_CANDIDATES && !crowned;
    if evaluation_triggered {
        let request = EvaluationRequest {
            task_id: task.id.clone(),
            team: task.team.clone(),
            crown_run_id: Some(run.id.clone()),
            precollected_diff: req.diff,
            auth: auth_context(req.judge_auth),
        };
        let evaluator = Arc::clone(&state.evaluator);
        tokio::spawn(async move {
            let task_id = request.task_id.clone();
            match evaluator.evaluate_crown(request).await {
                Ok(outcome) => info!(task_id = %task_id, outcome = ?outcome, "background evaluation finished"),
                Err(e) => error!(task_id = %task_id, error = %e, "background evaluation failed"),
            }
        });
    }

    Ok(Json(CompleteRunResponse {
        run,
        evaluation_triggered,
    }))
}

/// POST /tasks/{id}/crown - Evaluate now and return the outcome.
async fn trigger_crown(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<TriggerCrownRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    let task = state
        .storage
        .get_task(&task_id)
        .await
        .map_err(|e| storage_error("failed to load task", e))?;

    let request = EvaluationRequest {
        task_id: task.id,
        team: task.team,
        crown_run_id: req.crown_run_id.map(Id::from_string),
        precollected_diff: None,
        auth: auth_context(req.judge_auth),
    };

    let outcome = state
        .evaluator
        .evaluate_crown(request)
        .await
        .map_err(|e| match e {
            EvaluatorError::Storage(err) => storage_error("crown evaluation failed", err),
        })?;

    Ok(Json(TriggerCrownResponse { outcome }))
}

/// GET /tasks/{id}/crown
async fn crown_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    let task = state
        .storage
        .get_task(&task_id)
        .await
        .map_err(|e| storage_error("failed to load task", e))?;
    let evaluation = state
        .storage
        .get_crown_evaluation(&task_id)
        .await
        .map_err(|e| storage_error("failed to load crown record", e))?;

    let stalled = evaluation.is_none() && task.evaluation_stalled(Utc::now(), state.stall_timeout);

    Ok(Json(CrownStatusResponse {
        task_id: task.id,
        status: task.crown_status,
        evaluation,
        stalled,
    }))
}

/// GET /tasks/{id}/events
async fn list_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let task_id = Id::from_string(id);
    state
        .storage
        .get_task(&task_id)
        .await
        .map_err(|e| storage_error("failed to load task", e))?;
    let events = state
        .storage
        .list_events(&task_id)
        .await
        .map_err(|e| storage_error("failed to list events", e))?;

    Ok(Json(ListEventsResponse {
        events: events.iter().map(EventData::from).collect(),
    }))
}

/// POST /workers - Attach a local working tree to a run.
async fn register_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    if !req.root.is_dir() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("worker root is not a directory: {}", req.root.display()),
        ));
    }

    let run_id = Id::from_string(req.run_id);
    state
        .storage
        .get_run(&run_id)
        .await
        .map_err(|e| storage_error("failed to load run", e))?;

    state.registry.register(run_id.clone(), req.root.clone()).await;
    info!(run_id = %run_id, root = %req.root.display(), "registered worker");
    Ok((
        StatusCode::CREATED,
        Json(WorkerEntry {
            run_id,
            root: req.root,
        }),
    ))
}

/// DELETE /workers/{run_id}
async fn remove_worker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(run_id);
    if state.registry.remove(&run_id).await {
        info!(run_id = %run_id, "removed worker");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no worker for run: {}", run_id),
        ))
    }
}

/// GET /workers
async fn list_workers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let workers = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|(run_id, root)| WorkerEntry { run_id, root })
        .collect();
    Ok(Json(ListWorkersResponse { workers }))
}

/// PUT /settings/{team}
async fn put_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(team): Path<String>,
    Json(settings): Json<WorkspaceSettings>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    state
        .storage
        .put_settings(&team, settings)
        .await
        .map_err(|e| storage_error("failed to save settings", e))?;

    info!(team = %team, auto_pr = settings.auto_pr_enabled, "updated workspace settings");
    Ok(Json(SettingsResponse { team, settings }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tower::ServiceExt;

    async fn create_test_app(auth_token: Option<&str>) -> (Router, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let registry = Arc::new(LocalWorkerRegistry::new());
        let evaluator = crate::build_evaluator(
            Arc::clone(&storage),
            registry.clone(),
            &crown_core::Config::default(),
        )
        .unwrap();

        let state = Arc::new(AppState {
            storage,
            registry,
            evaluator: Arc::new(evaluator),
            stall_timeout: Duration::from_secs(900),
            auth_token: auth_token.map(str::to_string),
        });
        (create_router(state), dir)
    }

    #[tokio::test]
    async fn health_check_skips_auth() {
        let (app, _dir) = create_test_app(Some("secret")).await;

        let response: Response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn auth_is_enforced_when_configured() {
        let (app, _dir) = create_test_app(Some("secret")).await;

        let response: Response = app
            .clone()
            .oneshot(Request::builder().uri("/workers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response: Response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/workers")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/workers")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_task_rejects_empty_text() {
        let (app, _dir) = create_test_app(None).await;

        let body = serde_json::json!({ "team": "core", "text": "  " });
        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_run_status_is_bad_request() {
        let (app, _dir) = create_test_app(None).await;

        let body = serde_json::json!({ "status": "exploded" });
        let response: Response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs/missing/status")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn crown_status_for_missing_task_is_not_found() {
        let (app, _dir) = create_test_app(None).await;

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/tasks/nope/crown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
