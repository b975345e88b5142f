//! SQLite storage module for the crown daemon.
//!
//! Persists tasks, runs, the write-once crown record, comments, workspace
//! settings, and the per-task audit log. The evaluator only sees this through
//! the [`TaskStore`] and [`SettingsStore`] traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crown_core::{
    events::EventPayload, CrownEvaluation, EvaluationStatus, Event, Id, RunStatus, Task,
    TaskComment, TaskRun, WorkspaceSettings, SYSTEM_AUTHOR,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

const TASKS_COLUMNS: &str = "id, team, text, pr_title, pr_description, crown_status, \
    crown_error, crown_started_at, created_at, updated_at";

const RUNS_COLUMNS: &str = "id, task_id, agent_name, status, exit_code, branch_name, \
    crowned, crown_reason, pull_request_url, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("task already has a crown evaluation: {0}")]
    AlreadyCrowned(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Task and run operations the evaluator and workflow driver depend on.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: &Id) -> Result<Task>;

    async fn list_runs_for_task(&self, task_id: &Id) -> Result<Vec<TaskRun>>;

    async fn get_crown_evaluation(&self, task_id: &Id) -> Result<Option<CrownEvaluation>>;

    /// Atomically move the task to `in_progress` unless it already is.
    /// Returns `false` when another evaluation holds the lock.
    async fn try_begin_evaluation(&self, task_id: &Id) -> Result<bool>;

    /// Record the winner: the crown record and the run's crowned flag and
    /// reason are written together or not at all.
    async fn set_crown_winner(
        &self,
        task_id: &Id,
        run_id: &Id,
        reason: &str,
    ) -> Result<CrownEvaluation>;

    /// Set the task's error status, or clear it back to idle with `None`.
    async fn set_task_error_status(&self, task_id: &Id, message: Option<&str>) -> Result<()>;

    async fn set_pull_request_title(&self, task_id: &Id, title: &str) -> Result<()>;

    async fn set_pull_request_description(&self, task_id: &Id, description: &str) -> Result<()>;

    async fn update_run_pull_request_url(&self, run_id: &Id, url: &str) -> Result<()>;

    async fn has_system_comment(&self, task_id: &Id) -> Result<bool>;

    async fn add_system_comment(&self, task_id: &Id, body: &str) -> Result<TaskComment>;

    async fn append_event(
        &self,
        task_id: &Id,
        run_id: Option<&Id>,
        payload: &EventPayload,
    ) -> Result<Event>;
}

/// Per-team workspace settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// `None` when the team has never stored settings.
    async fn get_settings(&self, team: &str) -> Result<Option<WorkspaceSettings>>;
}

/// Storage backend for the daemon.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task operations ---

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, team, text, pr_title, pr_description, crown_status,
                               crown_error, crown_started_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(task.id.as_ref())
        .bind(&task.team)
        .bind(&task.text)
        .bind(&task.pr_title)
        .bind(&task.pr_description)
        .bind(task.crown_status.as_str())
        .bind(task.crown_status.error_message())
        .bind(task.crown_started_at.map(|t| t.timestamp_millis()))
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Tasks whose evaluation lock was taken before `started_before` and that
    /// still have no crown record.
    pub async fn list_stalled_evaluations(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASKS_COLUMNS} FROM tasks t \
             WHERE t.crown_status = 'in_progress' AND t.crown_started_at < ?1 \
             AND NOT EXISTS (SELECT 1 FROM crown_evaluations e WHERE e.task_id = t.id) \
             ORDER BY t.crown_started_at ASC"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(started_before.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(TaskRow::into_task).collect())
    }

    // --- Run operations ---

    pub async fn insert_run(&self, run: &TaskRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_runs (id, task_id, agent_name, status, exit_code, branch_name,
                                   crowned, crown_reason, pull_request_url, created_at, updated_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
            WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ?2)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.task_id.as_ref())
        .bind(&run.agent_name)
        .bind(run.status.as_str())
        .bind(run.exit_code)
        .bind(&run.branch_name)
        .bind(run.crowned)
        .bind(&run.crown_reason)
        .bind(&run.pull_request_url)
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(run.task_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<TaskRun> {
        let query = format!("SELECT {RUNS_COLUMNS} FROM task_runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        Ok(row.into_run())
    }

    pub async fn update_run_status(&self, id: &Id, status: RunStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query("UPDATE task_runs SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Mark a run completed with its exit code.
    pub async fn complete_run(&self, id: &Id, exit_code: Option<i32>) -> Result<TaskRun> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE task_runs SET status = 'completed', exit_code = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(exit_code)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        self.get_run(id).await
    }

    // --- Comment operations ---

    pub async fn list_comments(&self, task_id: &Id) -> Result<Vec<TaskComment>> {
        let rows = sqlx::query_as::<_, CommentRow>(
            "SELECT id, task_id, author, body, created_at FROM task_comments \
             WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CommentRow::into_comment).collect())
    }

    // --- Event operations ---

    pub async fn list_events(&self, task_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, task_id, run_id, type, ts, payload_json FROM events \
             WHERE task_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    // --- Settings operations ---

    pub async fn put_settings(&self, team: &str, settings: WorkspaceSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspace_settings (team, auto_pr_enabled, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(team) DO UPDATE SET auto_pr_enabled = excluded.auto_pr_enabled, \
             updated_at = excluded.updated_at",
        )
        .bind(team)
        .bind(settings.auto_pr_enabled)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task_field(&self, task_id: &Id, column: &str, value: &str) -> Result<()> {
        let query = format!("UPDATE tasks SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        let result = sqlx::query(&query)
            .bind(value)
            .bind(Utc::now().timestamp_millis())
            .bind(task_id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for Storage {
    async fn get_task(&self, task_id: &Id) -> Result<Task> {
        let query = format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(task_id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(task_id.to_string()))?;
        Ok(row.into_task())
    }

    async fn list_runs_for_task(&self, task_id: &Id) -> Result<Vec<TaskRun>> {
        let query = format!(
            "SELECT {RUNS_COLUMNS} FROM task_runs WHERE task_id = ?1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(task_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    async fn get_crown_evaluation(&self, task_id: &Id) -> Result<Option<CrownEvaluation>> {
        let row = sqlx::query_as::<_, EvaluationRow>(
            "SELECT task_id, winner_run_id, reason, evaluated_at FROM crown_evaluations WHERE task_id = ?1",
        )
        .bind(task_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(EvaluationRow::into_evaluation))
    }

    async fn try_begin_evaluation(&self, task_id: &Id) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET crown_status = 'in_progress', crown_error = NULL, \
             crown_started_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND crown_status != 'in_progress'",
        )
        .bind(now)
        .bind(task_id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "held by someone else" from "no such task".
        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?1")
            .bind(task_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StorageError::TaskNotFound(task_id.to_string())),
        }
    }

    async fn set_crown_winner(
        &self,
        task_id: &Id,
        run_id: &Id,
        reason: &str,
    ) -> Result<CrownEvaluation> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO crown_evaluations (task_id, winner_run_id, reason, evaluated_at) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(task_id.as_ref())
        .bind(run_id.as_ref())
        .bind(reason)
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if let sqlx::Error::Database(db) = &err {
                if db.is_unique_violation() {
                    return Err(StorageError::AlreadyCrowned(task_id.to_string()));
                }
            }
            return Err(err.into());
        }

        let result = sqlx::query(
            "UPDATE task_runs SET crowned = 1, crown_reason = ?1, updated_at = ?2 \
             WHERE id = ?3 AND task_id = ?4",
        )
        .bind(reason)
        .bind(now.timestamp_millis())
        .bind(run_id.as_ref())
        .bind(task_id.as_ref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the crown record.
            return Err(StorageError::RunNotFound(run_id.to_string()));
        }

        tx.commit().await?;

        Ok(CrownEvaluation {
            task_id: task_id.clone(),
            winner_run_id: run_id.clone(),
            reason: reason.to_string(),
            evaluated_at: DateTime::from_timestamp_millis(now.timestamp_millis())
                .unwrap_or(now),
        })
    }

    async fn set_task_error_status(&self, task_id: &Id, message: Option<&str>) -> Result<()> {
        let status = match message {
            Some(msg) => EvaluationStatus::Error(msg.to_string()),
            None => EvaluationStatus::Idle,
        };
        let result = sqlx::query(
            "UPDATE tasks SET crown_status = ?1, crown_error = ?2, crown_started_at = NULL, \
             updated_at = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .bind(task_id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn set_pull_request_title(&self, task_id: &Id, title: &str) -> Result<()> {
        self.update_task_field(task_id, "pr_title", title).await
    }

    async fn set_pull_request_description(&self, task_id: &Id, description: &str) -> Result<()> {
        self.update_task_field(task_id, "pr_description", description)
            .await
    }

    async fn update_run_pull_request_url(&self, run_id: &Id, url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE task_runs SET pull_request_url = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(url)
        .bind(Utc::now().timestamp_millis())
        .bind(run_id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn has_system_comment(&self, task_id: &Id) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM task_comments WHERE task_id = ?1 AND author = ?2",
        )
        .bind(task_id.as_ref())
        .bind(SYSTEM_AUTHOR)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 > 0)
    }

    async fn add_system_comment(&self, task_id: &Id, body: &str) -> Result<TaskComment> {
        let comment = TaskComment {
            id: Id::new(),
            task_id: task_id.clone(),
            author: SYSTEM_AUTHOR.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO task_comments (id, task_id, author, body, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(comment.id.as_ref())
        .bind(comment.task_id.as_ref())
        .bind(&comment.author)
        .bind(&comment.body)
        .bind(comment.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(comment)
    }

    async fn append_event(
        &self,
        task_id: &Id,
        run_id: Option<&Id>,
        payload: &EventPayload,
    ) -> Result<Event> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, task_id, run_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.as_ref())
        .bind(task_id.as_ref())
        .bind(run_id.map(AsRef::<str>::as_ref))
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id,
            task_id: task_id.clone(),
            run_id: run_id.cloned(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }
}

#[async_trait]
impl SettingsStore for Storage {
    async fn get_settings(&self, team: &str) -> Result<Option<WorkspaceSettings>> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT auto_pr_enabled FROM workspace_settings WHERE team = ?1")
                .bind(team)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(auto_pr_enabled,)| WorkspaceSettings { auto_pr_enabled }))
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    team: String,
    text: String,
    pr_title: Option<String>,
    pr_description: Option<String>,
    crown_status: String,
    crown_error: Option<String>,
    crown_started_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Task {
        Task {
            id: Id::from_string(self.id),
            team: self.team,
            text: self.text,
            pr_title: self.pr_title,
            pr_description: self.pr_description,
            crown_status: EvaluationStatus::from_parts(&self.crown_status, self.crown_error),
            crown_started_at: self
                .crown_started_at
                .and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    task_id: String,
    agent_name: String,
    status: String,
    exit_code: Option<i32>,
    branch_name: Option<String>,
    crowned: bool,
    crown_reason: Option<String>,
    pull_request_url: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn into_run(self) -> TaskRun {
        TaskRun {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            agent_name: self.agent_name,
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed),
            exit_code: self.exit_code,
            branch_name: self.branch_name,
            crowned: self.crowned,
            crown_reason: self.crown_reason,
            pull_request_url: self.pull_request_url,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EvaluationRow {
    task_id: String,
    winner_run_id: String,
    reason: String,
    evaluated_at: i64,
}

impl EvaluationRow {
    fn into_evaluation(self) -> CrownEvaluation {
        CrownEvaluation {
            task_id: Id::from_string(self.task_id),
            winner_run_id: Id::from_string(self.winner_run_id),
            reason: self.reason,
            evaluated_at: DateTime::from_timestamp_millis(self.evaluated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: String,
    task_id: String,
    author: String,
    body: String,
    created_at: i64,
}

impl CommentRow {
    fn into_comment(self) -> TaskComment {
        TaskComment {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            author: self.author,
            body: self.body,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    task_id: String,
    run_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            run_id: self.run_id.map(Id::from_string),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}
