//! Judge verdict parsing and winner selection.
//!
//! The judge answers with a JSON object naming a candidate by position:
//! `{"winner": 2, "reason": "..."}` (`winnerIndex` is accepted as an alias).
//! Models often wrap the object in prose or code fences, so the outermost
//! `{...}` span is tried when the whole output is not valid JSON.
//!
//! Selection never fails: a missing or out-of-range verdict falls back to the
//! first candidate with a reason that records why.

use serde::{Deserialize, Serialize};

/// Reason recorded when the judge could not be reached or answered garbage.
pub const EVALUATION_FAILED_REASON: &str = "Selected first implementation (evaluation failed)";

/// Reason used when the judge returned a winner without explanation.
pub const MISSING_REASON: &str = "No reason provided by judge";

/// A parsed judge answer. `winner` is signed so a negative index can be
/// reported as invalid rather than rejected as unparseable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(alias = "winnerIndex")]
    pub winner: i64,
    #[serde(default)]
    pub reason: String,
}

/// Why the first candidate was picked instead of the judge's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCause {
    /// No verdict at all (judge unreachable or unparseable).
    EvaluationFailed,
    /// The verdict named an index outside the candidate list.
    InvalidIndex(i64),
}

/// The outcome of applying a verdict to a candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub index: usize,
    pub reason: String,
    pub fallback: Option<FallbackCause>,
}

/// Parse judge output into a verdict.
///
/// # Example
/// ```
/// use crown_core::verdict::parse_verdict;
///
/// let v = parse_verdict(r#"{"winner": 1, "reason": "cleaner"}"#).unwrap();
/// assert_eq!(v.winner, 1);
///
/// let v = parse_verdict("Here you go:\n```json\n{\"winnerIndex\": 0}\n```").unwrap();
/// assert_eq!(v.winner, 0);
///
/// assert!(parse_verdict("I could not decide").is_none());
/// ```
pub fn parse_verdict(output: &str) -> Option<Verdict> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(verdict) = serde_json::from_str::<Verdict>(trimmed) {
        return Some(normalize(verdict));
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Verdict>(&trimmed[start..=end])
        .ok()
        .map(normalize)
}

fn normalize(mut verdict: Verdict) -> Verdict {
    let reason = verdict.reason.trim();
    verdict.reason = if reason.is_empty() {
        MISSING_REASON.to_string()
    } else {
        reason.to_string()
    };
    verdict
}

/// Apply a verdict to `candidate_count` candidates.
///
/// Callers guarantee `candidate_count >= 1`; index 0 is always a valid
/// fallback.
pub fn select_winner(verdict: Option<&Verdict>, candidate_count: usize) -> Selection {
    let Some(verdict) = verdict else {
        return Selection {
            index: 0,
            reason: EVALUATION_FAILED_REASON.to_string(),
            fallback: Some(FallbackCause::EvaluationFailed),
        };
    };

    match usize::try_from(verdict.winner) {
        Ok(index) if index < candidate_count => Selection {
            index,
            reason: verdict.reason.clone(),
            fallback: None,
        },
        _ => Selection {
            index: 0,
            reason: format!(
                "Selected first implementation (judge returned invalid index {})",
                verdict.winner
            ),
            fallback: Some(FallbackCause::InvalidIndex(verdict.winner)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let v = parse_verdict(r#"{"winner": 2, "reason": "best"}"#).unwrap();
        assert_eq!(v.winner, 2);
        assert_eq!(v.reason, "best");
    }

    #[test]
    fn parses_camel_case_alias() {
        let v = parse_verdict(r#"{"winnerIndex": 1, "reason": "tests pass"}"#).unwrap();
        assert_eq!(v.winner, 1);
    }

    #[test]
    fn parses_object_embedded_in_prose() {
        let output = "After review:\n{\"winner\": 0, \"reason\": \"only one compiles\"}\nThanks.";
        let v = parse_verdict(output).unwrap();
        assert_eq!(v.winner, 0);
        assert_eq!(v.reason, "only one compiles");
    }

    #[test]
    fn missing_reason_gets_placeholder() {
        let v = parse_verdict(r#"{"winner": 0}"#).unwrap();
        assert_eq!(v.reason, MISSING_REASON);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_verdict("").is_none());
        assert!(parse_verdict("   ").is_none());
        assert!(parse_verdict("no json here").is_none());
        assert!(parse_verdict("} backwards {").is_none());
        assert!(parse_verdict(r#"{"reason": "no winner"}"#).is_none());
        assert!(parse_verdict(r#"{"winner": "two"}"#).is_none());
    }

    #[test]
    fn select_uses_valid_index() {
        let v = Verdict {
            winner: 2,
            reason: "best".into(),
        };
        let s = select_winner(Some(&v), 3);
        assert_eq!(s.index, 2);
        assert_eq!(s.reason, "best");
        assert!(s.fallback.is_none());
    }

    #[test]
    fn select_falls_back_on_index_equal_to_len() {
        let v = Verdict {
            winner: 3,
            reason: "best".into(),
        };
        let s = select_winner(Some(&v), 3);
        assert_eq!(s.index, 0);
        assert_eq!(s.fallback, Some(FallbackCause::InvalidIndex(3)));
        assert!(s.reason.contains("invalid index 3"));
    }

    #[test]
    fn select_falls_back_on_negative_index() {
        let v = Verdict {
            winner: -1,
            reason: "best".into(),
        };
        let s = select_winner(Some(&v), 2);
        assert_eq!(s.index, 0);
        assert_eq!(s.fallback, Some(FallbackCause::InvalidIndex(-1)));
    }

    #[test]
    fn select_falls_back_without_verdict() {
        let s = select_winner(None, 2);
        assert_eq!(s.index, 0);
        assert_eq!(s.reason, EVALUATION_FAILED_REASON);
        assert_eq!(s.fallback, Some(FallbackCause::EvaluationFailed));
    }
}
