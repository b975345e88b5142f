//! crownctl - CLI client for crownd.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use crown_core::types::WorkspaceSettings;
use std::path::PathBuf;

/// CLI client for the crownd evaluation daemon.
#[derive(Parser)]
#[command(name = "crownctl")]
#[command(about = "Control plane for crownd")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "CROWND_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "CROWND_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Manage agent runs
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },

    /// Attach or detach run working trees
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Evaluate a task now and print the outcome
    Crown {
        /// Task ID
        task_id: String,

        /// Run whose completion prompted the evaluation
        #[arg(long)]
        run: Option<String>,

        /// Header value forwarded to the judging service
        #[arg(long, env = "CROWN_JUDGE_AUTH")]
        judge_auth: Option<String>,
    },

    /// Show crown evaluation status for a task
    Status {
        /// Task ID
        task_id: String,
    },

    /// Team settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task
    Create {
        /// Team slug or id
        #[arg(long)]
        team: String,

        /// Task description
        text: String,
    },

    /// Show a task with its runs and comments
    Show {
        /// Task ID
        task_id: String,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Add an agent run to a task
    Add {
        /// Task ID
        task_id: String,

        /// Agent name
        #[arg(long)]
        agent: String,

        /// Branch the run works on
        #[arg(long)]
        branch: Option<String>,
    },

    /// Mark a run completed
    Complete {
        /// Run ID
        run_id: String,

        /// Agent exit code
        #[arg(long)]
        exit_code: Option<i32>,

        /// File holding the run's diff
        #[arg(long)]
        diff_file: Option<PathBuf>,

        /// Header value forwarded to the judging service
        #[arg(long, env = "CROWN_JUDGE_AUTH")]
        judge_auth: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Register a working tree for a run
    Register {
        /// Run ID
        run_id: String,

        /// Working tree path (defaults to current directory)
        #[arg(default_value = ".")]
        root: PathBuf,
    },

    /// Remove a run's worker
    Remove {
        /// Run ID
        run_id: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Set team settings
    Set {
        /// Team slug or id
        team: String,

        /// Open pull requests for crowned runs
        #[arg(long, action = clap::ArgAction::Set)]
        auto_pr: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7710".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Task { command } => match command {
            TaskCommand::Create { team, text } => task_create(&client, &team, &text).await,
            TaskCommand::Show { task_id } => task_show(&client, &task_id).await,
        },
        Command::Run { command } => match command {
            RunCommand::Add {
                task_id,
                agent,
                branch,
            } => run_add(&client, &task_id, &agent, branch.as_deref()).await,
            RunCommand::Complete {
                run_id,
                exit_code,
                diff_file,
                judge_auth,
            } => run_complete(&client, &run_id, exit_code, diff_file, judge_auth.as_deref()).await,
        },
        Command::Worker { command } => match command {
            WorkerCommand::Register { run_id, root } => {
                worker_register(&client, &run_id, root).await
            }
            WorkerCommand::Remove { run_id } => worker_remove(&client, &run_id).await,
        },
        Command::Crown {
            task_id,
            run,
            judge_auth,
        } => crown(&client, &task_id, run.as_deref(), judge_auth.as_deref()).await,
        Command::Status { task_id } => status(&client, &task_id).await,
        Command::Settings { command } => match command {
            SettingsCommand::Set { team, auto_pr } => settings_set(&client, &team, auto_pr).await,
        },
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn task_create(client: &Client, team: &str, text: &str) -> Result<(), ClientError> {
    let task = client.create_task(team, text).await?;
    render::print_task_created(&task);
    Ok(())
}

async fn task_show(client: &Client, task_id: &str) -> Result<(), ClientError> {
    let detail = client.get_task(task_id).await?;
    render::print_task_details(&detail);
    Ok(())
}

async fn run_add(
    client: &Client,
    task_id: &str,
    agent: &str,
    branch: Option<&str>,
) -> Result<(), ClientError> {
    let run = client.add_run(task_id, agent, branch).await?;
    render::print_run_added(&run);
    Ok(())
}

async fn run_complete(
    client: &Client,
    run_id: &str,
    exit_code: Option<i32>,
    diff_file: Option<PathBuf>,
    judge_auth: Option<&str>,
) -> Result<(), ClientError> {
    let diff = diff_file
        .map(|path| {
            std::fs::read_to_string(&path)
                .map_err(|e| ClientError::IoError(format!("{}: {}", path.display(), e)))
        })
        .transpose()?;
    let done = client
        .complete_run(run_id, exit_code, diff.as_deref(), judge_auth)
        .await?;
    render::print_run_completed(&done);
    Ok(())
}

async fn worker_register(client: &Client, run_id: &str, root: PathBuf) -> Result<(), ClientError> {
    let root = root
        .canonicalize()
        .map_err(|e| ClientError::IoError(format!("{}: {}", root.display(), e)))?;
    client.register_worker(run_id, &root).await?;
    println!("Registered worker for run {} at {}", run_id, root.display());
    Ok(())
}

async fn worker_remove(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.remove_worker(run_id).await?;
    println!("Removed worker for run {}", run_id);
    Ok(())
}

async fn crown(
    client: &Client,
    task_id: &str,
    run_id: Option<&str>,
    judge_auth: Option<&str>,
) -> Result<(), ClientError> {
    let outcome = client.crown(task_id, run_id, judge_auth).await?;
    render::print_outcome(&outcome);
    Ok(())
}

async fn status(client: &Client, task_id: &str) -> Result<(), ClientError> {
    let status = client.crown_status(task_id).await?;
    render::print_crown_status(&status);
    Ok(())
}

async fn settings_set(client: &Client, team: &str, auto_pr: bool) -> Result<(), ClientError> {
    let settings = client
        .put_settings(
            team,
            WorkspaceSettings {
                auto_pr_enabled: auto_pr,
            },
        )
        .await?;
    println!(
        "Updated {}: auto PR {}",
        team,
        if settings.auto_pr_enabled { "on" } else { "off" }
    );
    Ok(())
}
