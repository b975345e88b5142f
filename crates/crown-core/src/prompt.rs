//! Prompt and message assembly for crown evaluation.
//!
//! Everything here is pure string building so the same inputs always
//! produce the same judge prompt.

use crate::types::Candidate;
use serde::Serialize;

/// Maximum characters of a candidate diff shown to the judge.
pub const MAX_DIFF_CHARS: usize = 5_000;

/// Appended after a truncated diff.
pub const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Stands in for an absent or empty diff so the judge never sees an empty field.
pub const NO_CHANGES: &str = "No changes detected";

/// Maximum length of a derived pull request title.
pub const MAX_TITLE_CHARS: usize = 72;

/// Truncate a diff to [`MAX_DIFF_CHARS`] characters (not bytes).
pub fn truncate_diff(diff: &str) -> String {
    match diff.char_indices().nth(MAX_DIFF_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &diff[..cut]),
        None => diff.to_string(),
    }
}

/// Normalize a collected diff for the judge: sentinel when missing, bounded otherwise.
pub fn prepare_diff(diff: Option<&str>) -> String {
    match diff {
        Some(d) if !d.trim().is_empty() => truncate_diff(d),
        _ => NO_CHANGES.to_string(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JudgeCandidate<'a> {
    index: usize,
    agent_name: &'a str,
    git_diff: &'a str,
}

/// Build the judge prompt.
///
/// Candidates are embedded as a JSON array so diff content cannot be confused
/// with the surrounding instructions.
pub fn build_judge_prompt(task_text: &str, candidates: &[Candidate]) -> String {
    let entries: Vec<JudgeCandidate<'_>> = candidates
        .iter()
        .map(|c| JudgeCandidate {
            index: c.index,
            agent_name: &c.agent_name,
            git_diff: &c.diff,
        })
        .collect();
    // Serializing borrowed strings and integers cannot fail.
    let implementations =
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string());
    let last_index = candidates.len().saturating_sub(1);

    format!(
        r#"You are an expert reviewer evaluating competing implementations of the same task.

## Task

{task_text}

## Implementations

Each implementation is identified by its `index`. `gitDiff` holds the changes it made.

{implementations}

## Criteria

1. Correctness: does the change do what the task asks, without bugs?
2. Completeness: is the task fully addressed?
3. Code quality and best practices: is the change clean and maintainable?
4. Prefer implementations with real changes over ones reporting "{NO_CHANGES}".

## Response Format

Respond with a single JSON object and nothing else:
{{"winner": <index from 0 to {last_index}>, "reason": "<one or two sentences>"}}"#
    )
}

/// Build the prompt sent to the commit summarizer.
pub fn build_summary_prompt(task_text: &str, diff: &str) -> String {
    format!(
        r#"Write a git commit message for the change below.

Task: {task_text}

First line: imperative summary under 72 characters. Then a blank line and a
short body describing what changed. Output only the commit message.

{diff}"#
    )
}

/// Commit message used when no summary is available.
pub fn default_commit_message(task_text: &str, agent_name: &str) -> String {
    format!(
        "{}\n\nImplemented by {agent_name}. Selected as the best of several attempts.",
        pr_title(task_text)
    )
}

/// Derive a pull request title from the first non-empty line of the task text.
pub fn pr_title(task_text: &str) -> String {
    let first = task_text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Crowned implementation");
    match first.char_indices().nth(MAX_TITLE_CHARS) {
        Some((cut, _)) => format!("{}...", first[..cut].trim_end()),
        None => first.to_string(),
    }
}

/// Pull request body for the crowned run.
pub fn pr_description(task_text: &str, agent_name: &str, reason: &str, candidate_count: usize) -> String {
    format!(
        "## Task\n\n{task_text}\n\n## Selection\n\n\
         Implemented by **{agent_name}**, selected from {candidate_count} candidate implementations.\n\n\
         > {reason}\n"
    )
}

/// Body of the system comment posted once a winner is recorded.
pub fn summary_comment(agent_name: &str, reason: &str, candidate_count: usize, fallback: bool) -> String {
    let mut body = format!(
        "Crowned **{agent_name}** out of {candidate_count} completed implementations.\n\n{reason}"
    );
    if fallback {
        body.push_str("\n\nThe judge did not return a usable verdict; the first implementation was selected.");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;

    fn candidate(index: usize, agent: &str, diff: &str) -> Candidate {
        Candidate {
            index,
            run_id: Id::new(),
            agent_name: agent.to_string(),
            exit_code: Some(0),
            diff: diff.to_string(),
        }
    }

    #[test]
    fn long_diff_is_cut_to_limit_plus_marker() {
        let diff = "x".repeat(6_000);
        let out = truncate_diff(&diff);
        assert_eq!(out, format!("{}{TRUNCATION_MARKER}", "x".repeat(5_000)));
    }

    #[test]
    fn short_diff_is_unmodified() {
        let diff = "y".repeat(4_000);
        assert_eq!(truncate_diff(&diff), diff);
    }

    #[test]
    fn diff_at_exact_limit_is_unmodified() {
        let diff = "z".repeat(MAX_DIFF_CHARS);
        assert_eq!(truncate_diff(&diff), diff);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let diff = "é".repeat(5_001);
        let out = truncate_diff(&diff);
        assert!(out.starts_with(&"é".repeat(5_000)));
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.chars().count(), 5_000 + TRUNCATION_MARKER.chars().count());
    }

    #[test]
    fn missing_or_blank_diff_becomes_sentinel() {
        assert_eq!(prepare_diff(None), NO_CHANGES);
        assert_eq!(prepare_diff(Some("")), NO_CHANGES);
        assert_eq!(prepare_diff(Some("  \n\t")), NO_CHANGES);
        assert_eq!(prepare_diff(Some("+a")), "+a");
    }

    #[test]
    fn judge_prompt_embeds_candidates_as_json() {
        let candidates = vec![
            candidate(0, "claude", "+fn a() {}"),
            candidate(1, "codex", NO_CHANGES),
        ];
        let prompt = build_judge_prompt("Add a function", &candidates);
        assert!(prompt.contains("Add a function"));
        assert!(prompt.contains("\"agentName\": \"claude\""));
        assert!(prompt.contains("\"gitDiff\": \"+fn a() {}\""));
        assert!(prompt.contains("\"index\": 1"));
        assert!(prompt.contains("from 0 to 1"));
    }

    #[test]
    fn judge_prompt_is_deterministic() {
        let candidates = vec![candidate(0, "a", "+1"), candidate(1, "b", "+2")];
        assert_eq!(
            build_judge_prompt("t", &candidates),
            build_judge_prompt("t", &candidates)
        );
    }

    #[test]
    fn judge_prompt_escapes_diff_content() {
        let candidates = vec![candidate(0, "a", "line \"quoted\"\n}")];
        let prompt = build_judge_prompt("t", &candidates);
        assert!(prompt.contains(r#"line \"quoted\"\n}"#));
    }

    #[test]
    fn pr_title_uses_first_line_and_truncates() {
        assert_eq!(pr_title("\n  Fix login bug \nmore detail"), "Fix login bug");
        let long = "a".repeat(100);
        let title = pr_title(&long);
        assert_eq!(title, format!("{}...", "a".repeat(MAX_TITLE_CHARS)));
        assert_eq!(pr_title(""), "Crowned implementation");
    }

    #[test]
    fn default_commit_message_names_agent() {
        let msg = default_commit_message("Fix login bug", "claude");
        assert!(msg.starts_with("Fix login bug\n\n"));
        assert!(msg.contains("claude"));
    }

    #[test]
    fn summary_comment_mentions_fallback() {
        assert!(!summary_comment("a", "r", 2, false).contains("did not return"));
        assert!(summary_comment("a", "r", 2, true).contains("did not return"));
    }
}
