//! Output rendering for crownctl.

use crate::client::{CompletedRun, CrownOutcome, CrownStatus, TaskDetail};
use crown_core::types::{EvaluationStatus, RunStatus, Task, TaskRun};

pub fn print_task_created(task: &Task) {
    println!("Created task: {}", task.id);
    println!("  Team:   {}", task.team);
    println!("  Title:  {}", truncate(first_line(&task.text), 60));
}

pub fn print_run_added(run: &TaskRun) {
    println!("Added run: {}", run.id);
    println!("  Agent:  {}", run.agent_name);
    if let Some(ref branch) = run.branch_name {
        println!("  Branch: {}", branch);
    }
}

pub fn print_run_completed(done: &CompletedRun) {
    let exit = done
        .run
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("Completed run: {} (exit {})", done.run.id, exit);
    if done.evaluation_triggered {
        println!("  Crown evaluation started in the background.");
    }
}

/// Print a task with its runs and comments.
pub fn print_task_details(detail: &TaskDetail) {
    let task = &detail.task;
    println!("Task: {}", task.id);
    println!();
    println!("  Team:      {}", task.team);
    println!("  Crown:     {}", format_evaluation(&task.crown_status));
    if let Some(ref title) = task.pr_title {
        println!("  PR Title:  {}", title);
    }
    println!("  Created:   {}", format_time(&task.created_at));
    println!();
    for line in task.text.lines() {
        println!("    {}", line);
    }

    if !detail.runs.is_empty() {
        println!();
        println!("  Runs:");
        println!(
            "    {:<36}  {:<16}  {:<10}  {:<5}  {:<7}",
            "ID", "AGENT", "STATUS", "EXIT", "CROWNED"
        );
        println!("    {}", "-".repeat(82));
        for run in &detail.runs {
            let exit_code = run
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "    {:<36}  {:<16}  {:<10}  {:<5}  {:<7}",
                run.id.0,
                truncate(&run.agent_name, 16),
                format_status(run.status),
                exit_code,
                if run.crowned { "yes" } else { "" },
            );
            if let Some(ref url) = run.pull_request_url {
                println!("      PR: {}", url);
            }
        }
    }

    for comment in &detail.comments {
        println!();
        println!("  [{}] {}", comment.author, format_time(&comment.created_at));
        for line in comment.body.lines() {
            println!("    {}", line);
        }
    }
}

pub fn print_outcome(outcome: &CrownOutcome) {
    println!("{}", describe_outcome(outcome));
}

pub fn describe_outcome(outcome: &CrownOutcome) -> String {
    match outcome {
        CrownOutcome::LockNotAcquired => "Evaluation already in progress.".to_string(),
        CrownOutcome::AlreadyEvaluated => "Task already has a crowned run.".to_string(),
        CrownOutcome::InsufficientCandidates { completed } => format!(
            "Not enough completed runs to evaluate ({} completed, 2 needed).",
            completed
        ),
        CrownOutcome::Crowned {
            run_id,
            reason,
            fallback,
        } => {
            let note = if *fallback { " (fallback)" } else { "" };
            format!("Crowned {}{}: {}", run_id, note, reason)
        }
    }
}

pub fn print_crown_status(status: &CrownStatus) {
    println!("Task:    {}", status.task_id);
    println!("Status:  {}", format_evaluation(&status.status));
    if status.stalled {
        println!("Warning: evaluation appears stalled");
    }
    if let Some(ref eval) = status.evaluation {
        println!("Winner:  {}", eval.winner_run_id);
        println!("Reason:  {}", eval.reason);
        println!("At:      {}", format_time(&eval.evaluated_at));
    }
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "PENDING",
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
    }
}

fn format_evaluation(status: &EvaluationStatus) -> String {
    match status {
        EvaluationStatus::Idle => "IDLE".to_string(),
        EvaluationStatus::InProgress => "IN_PROGRESS".to_string(),
        EvaluationStatus::Error(message) => format!("ERROR ({})", message),
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn first_line(text: &str) -> &str {
    text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars.saturating_sub(3)) {
        Some((cut, _)) if s.chars().count() > max_chars => format!("{}...", &s[..cut]),
        _ => s.to_string(),
    }
}
