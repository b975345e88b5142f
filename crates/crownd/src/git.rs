//! Shell script construction for landing a run's changes.
//!
//! Scripts are built from a [`ShellScript`]: variable bindings, here-documents,
//! and an ordered list of [`ScriptStep`]s. Untrusted strings only ever enter
//! the script as single-quoted variable bindings or here-document bodies;
//! step commands reference them as `"$name"`. Each step is wrapped in a guard
//! that prints a status marker and, for [`OnFailure::Abort`], exits. Step
//! output is sent to stderr, so stdout carries only the markers.
//!
//! Building is pure. Execution happens in a worker via [`crate::worker`].

use thiserror::Error;

/// Prefix of the status line printed after each step.
pub const STEP_MARKER: &str = "__CROWN_STEP__";

const HEREDOC_BASE: &str = "CROWN_EOF";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GitScriptError {
    #[error("{0} contains a NUL byte")]
    NulByte(&'static str),
    #[error("branch name is empty")]
    EmptyBranch,
}

pub type Result<T> = std::result::Result<T, GitScriptError>;

/// What the script does when a step's command fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Stop; later steps do not run and the script exits non-zero.
    Abort,
    /// Record the failure and run the next step.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    pub name: &'static str,
    /// Shell text. May reference bound variables, never raw input.
    pub command: String,
    pub on_failure: OnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HereDoc {
    /// Variable that will hold the temp file path.
    var: &'static str,
    content: String,
}

/// A script assembled from quoted bindings, here-documents and guarded steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellScript {
    bindings: Vec<(&'static str, String)>,
    heredocs: Vec<HereDoc>,
    steps: Vec<ScriptStep>,
}

/// Quote `value` for POSIX sh: wrap in single quotes, close-escape-reopen
/// around embedded single quotes.
///
/// ```
/// use crownd::git::shell_quote;
///
/// assert_eq!(shell_quote("it's"), r"'it'\''s'");
/// assert_eq!(shell_quote("$HOME"), "'$HOME'");
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Pick a here-document delimiter that no line of `content` equals.
pub fn heredoc_delimiter(content: &str) -> String {
    let mut delimiter = HEREDOC_BASE.to_string();
    let mut n = 0;
    while content.split('\n').any(|line| line == delimiter) {
        n += 1;
        delimiter = format!("{HEREDOC_BASE}_{n}");
    }
    delimiter
}

impl ShellScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name='value'` in the preamble.
    pub fn bind(&mut self, name: &'static str, value: &str, field: &'static str) -> Result<()> {
        if value.contains('\0') {
            return Err(GitScriptError::NulByte(field));
        }
        self.bindings.push((name, value.to_string()));
        Ok(())
    }

    /// Write `content` to a fresh temp file whose path is bound to `var`.
    /// The file is removed when the script exits.
    pub fn heredoc(&mut self, var: &'static str, content: &str, field: &'static str) -> Result<()> {
        if content.contains('\0') {
            return Err(GitScriptError::NulByte(field));
        }
        self.heredocs.push(HereDoc {
            var,
            content: content.to_string(),
        });
        Ok(())
    }

    pub fn step(&mut self, name: &'static str, command: impl Into<String>, on_failure: OnFailure) {
        self.steps.push(ScriptStep {
            name,
            command: command.into(),
            on_failure,
        });
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    /// Render to a single `sh` program.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for (name, value) in &self.bindings {
            out.push_str(&format!("{name}={}\n", shell_quote(value)));
        }

        for doc in &self.heredocs {
            out.push_str(&format!("{}=$(mktemp) || exit 1\n", doc.var));
        }
        if !self.heredocs.is_empty() {
            let files: Vec<String> = self
                .heredocs
                .iter()
                .map(|d| format!("\"${}\"", d.var))
                .collect();
            out.push_str(&format!("trap 'rm -f {}' EXIT\n", files.join(" ")));
        }
        for doc in &self.heredocs {
            let delimiter = heredoc_delimiter(&doc.content);
            out.push_str(&format!("cat > \"${}\" <<'{delimiter}'\n", doc.var));
            out.push_str(&doc.content);
            if !doc.content.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&delimiter);
            out.push('\n');
        }

        for step in &self.steps {
            let name = step.name;
            out.push_str("if {\n");
            out.push_str(&step.command);
            out.push_str("\n} 1>&2; then\n");
            out.push_str(&format!("  echo \"{STEP_MARKER} {name} ok\"\n"));
            out.push_str("else\n");
            out.push_str(&format!("  echo \"{STEP_MARKER} {name} failed\"\n"));
            if step.on_failure == OnFailure::Abort {
                out.push_str("  exit 1\n");
            }
            out.push_str("fi\n");
        }

        out
    }
}

/// Status of one step after running a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StepReport {
    pub name: &'static str,
    pub status: StepStatus,
}

/// Match the status markers in `stdout` against the script's steps.
///
/// A marker must be a whole line. When a step reports more than once the last
/// line wins, since the guard always prints after the command returns.
pub fn parse_step_report(script: &ShellScript, stdout: &str) -> Vec<StepReport> {
    let mut seen: Vec<(&str, StepStatus)> = Vec::new();
    for line in stdout.lines() {
        let Some(rest) = line.strip_prefix(STEP_MARKER) else {
            continue;
        };
        let parts: Vec<&str> = rest.split(' ').collect();
        let ["", name, status] = parts.as_slice() else {
            continue;
        };
        let status = match *status {
            "ok" => StepStatus::Ok,
            "failed" => StepStatus::Failed,
            _ => continue,
        };
        seen.push((*name, status));
    }

    script
        .steps()
        .iter()
        .map(|step| StepReport {
            name: step.name,
            status: seen
                .iter()
                .rev()
                .find(|(name, _)| *name == step.name)
                .map_or(StepStatus::NotRun, |(_, s)| *s),
        })
        .collect()
}

/// Build the script that stages, commits and pushes a run's changes to
/// `branch` on `remote`.
///
/// Steps and their failure policy:
/// validate, stage, commit, pull and push abort; checkout continues.
pub fn build_land_script(branch: &str, message: &str, remote: &str) -> Result<ShellScript> {
    if branch.trim().is_empty() {
        return Err(GitScriptError::EmptyBranch);
    }

    let mut script = ShellScript::new();
    script.bind("branch", branch, "branch name")?;
    script.bind("remote", remote, "remote name")?;
    script.heredoc("msg_file", message, "commit message")?;

    script.step(
        "validate",
        r#"git check-ref-format --branch "$branch" >/dev/null"#,
        OnFailure::Abort,
    );
    script.step("stage", "git add -A", OnFailure::Abort);
    script.step(
        "checkout",
        r#"git checkout -b "$branch" 2>/dev/null || git checkout "$branch""#,
        OnFailure::Continue,
    );
    script.step(
        "commit",
        r#"if git diff --cached --quiet; then
  echo "nothing to commit"
else
  git commit --cleanup=verbatim -F "$msg_file"
fi"#,
        OnFailure::Abort,
    );
    script.step(
        "pull",
        r#"if git ls-remote --exit-code "$remote" "refs/heads/$branch" >/dev/null 2>&1; then
  git pull --rebase "$remote" "$branch"
fi"#,
        OnFailure::Abort,
    );
    script.step("push", r#"git push -u "$remote" "$branch""#, OnFailure::Abort);

    Ok(script)
}

/// Build the script that opens a pull request for `branch` with `gh`.
pub fn build_pr_script(branch: &str, title: &str, body: &str) -> Result<ShellScript> {
    if branch.trim().is_empty() {
        return Err(GitScriptError::EmptyBranch);
    }

    let mut script = ShellScript::new();
    script.bind("branch", branch, "branch name")?;
    script.bind("title", title, "pull request title")?;
    script.heredoc("body_file", body, "pull request body")?;
    script.step(
        "pr",
        r#"gh pr create --title "$title" --body-file "$body_file" --head "$branch""#,
        OnFailure::Continue,
    );
    Ok(script)
}

/// Extract the pull request URL from `gh pr create` output.
pub fn parse_pr_url(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_end_matches(|c: char| matches!(c, '.' | ',' | ')' | '"' | '\'')))
        .find(|token| token.starts_with("https://") && token.contains("/pull/"))
        .map(str::to_string)
}
