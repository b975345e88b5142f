//! Event types for the per-task audit log.

use crate::types::Id;
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    EvaluationStarted,
    WinnerSelected,
    EvaluationFailed,
    /// Post-crown landing finished (successfully or not).
    LandFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EvaluationStarted => "EVALUATION_STARTED",
            Self::WinnerSelected => "WINNER_SELECTED",
            Self::EvaluationFailed => "EVALUATION_FAILED",
            Self::LandFinished => "LAND_FINISHED",
        }
    }
}

/// Payload for EVALUATION_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationStartedPayload {
    pub task_id: Id,
    pub candidate_count: usize,
}

/// Payload for WINNER_SELECTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerSelectedPayload {
    pub task_id: Id,
    pub run_id: Id,
    pub agent_name: String,
    pub reason: String,
    /// True when the first candidate was picked without a usable verdict.
    pub fallback: bool,
}

/// Payload for EVALUATION_FAILED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationFailedPayload {
    pub task_id: Id,
    pub message: String,
}

/// Payload for LAND_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandFinishedPayload {
    pub run_id: Id,
    pub branch: Option<String>,
    pub success: bool,
    pub pull_request_url: Option<String>,
    /// Name of the first aborting step, if any.
    pub failed_step: Option<String>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    EvaluationStarted(EvaluationStartedPayload),
    WinnerSelected(WinnerSelectedPayload),
    EvaluationFailed(EvaluationFailedPayload),
    LandFinished(LandFinishedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::EvaluationStarted(_) => EventType::EvaluationStarted,
            Self::WinnerSelected(_) => EventType::WinnerSelected,
            Self::EvaluationFailed(_) => EventType::EvaluationFailed,
            Self::LandFinished(_) => EventType::LandFinished,
        }
    }

    /// Run the event concerns, when it concerns one.
    pub fn run_id(&self) -> Option<&Id> {
        match self {
            Self::WinnerSelected(p) => Some(&p.run_id),
            Self::LandFinished(p) => Some(&p.run_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
