//! Core types for crown evaluation.
//!
//! Tasks, the runs that attempt them, and the write-once crown record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tasks, runs, comments, and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Lifecycle status of a single agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Evaluation status of a task.
///
/// `InProgress` doubles as the evaluation lock. `Error` keeps the failure
/// message so a retry can tell "never attempted" from "attempted and failed".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum EvaluationStatus {
    #[default]
    Idle,
    InProgress,
    Error(String),
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Error(_) => "error",
        }
    }

    /// Rebuild from the stored `(state, message)` column pair.
    pub fn from_parts(state: &str, message: Option<String>) -> Self {
        match state {
            "in_progress" => Self::InProgress,
            "error" => Self::Error(message.unwrap_or_default()),
            _ => Self::Idle,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}

// --- Core Types ---

/// A unit of user-requested work attempted by one or more agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    /// Team (workspace) the task belongs to; keys workspace settings.
    pub team: String,
    /// Task description given to every agent.
    pub text: String,
    pub pr_title: Option<String>,
    pub pr_description: Option<String>,
    pub crown_status: EvaluationStatus,
    /// When the current evaluation lock was taken; `None` unless in progress.
    pub crown_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(team: impl Into<String>, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            team: team.into(),
            text: text.into(),
            pr_title: None,
            pr_description: None,
            crown_status: EvaluationStatus::Idle,
            crown_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the evaluation lock has been held longer than `timeout`.
    ///
    /// Callers still need to check that no crown record exists.
    pub fn evaluation_stalled(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        if self.crown_status != EvaluationStatus::InProgress {
            return false;
        }
        let Some(started) = self.crown_started_at else {
            return false;
        };
        let elapsed = now.signed_duration_since(started);
        elapsed.to_std().is_ok_and(|e| e > timeout)
    }
}

/// One agent's attempt at a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Id,
    pub task_id: Id,
    pub agent_name: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    /// Branch the run's changes land on (assigned by the caller).
    pub branch_name: Option<String>,
    /// Set once, by the evaluator, on the winning run.
    pub crowned: bool,
    pub crown_reason: Option<String>,
    pub pull_request_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn new(task_id: Id, agent_name: impl Into<String>, branch_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            task_id,
            agent_name: agent_name.into(),
            status: RunStatus::Pending,
            exit_code: None,
            branch_name,
            crowned: false,
            crown_reason: None,
            pull_request_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The durable record of a task's winner. Created at most once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrownEvaluation {
    pub task_id: Id,
    pub winner_run_id: Id,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Judge-facing projection of a completed run, rebuilt on every evaluation.
///
/// `index` is positional and is the value the judge returns; the run id never
/// goes through the judge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub index: usize,
    pub run_id: Id,
    pub agent_name: String,
    pub exit_code: Option<i32>,
    pub diff: String,
}

/// Per-team settings consulted by the landing workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    pub auto_pr_enabled: bool,
}

/// A comment attached to a task. `author == "system"` marks generated comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskComment {
    pub id: Id,
    pub task_id: Id,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Author used for comments generated by the daemon.
pub const SYSTEM_AUTHOR: &str = "system";

/// An event in the per-task audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub task_id: Id,
    /// Associated run (optional).
    pub run_id: Option<Id>,
    /// Event type name (e.g., `EVALUATION_STARTED`, `WINNER_SELECTED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// JSON payload with event-specific data.
    pub payload_json: String,
}
