// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator entry point - CLI for both orchestrator and child modes.
//!
//! The same executable serves as the orchestrator and as the spawned child:
//! `--child-mode` / `--reader-mode` flip it into the IPC client role. The
//! environment mirrors (`CODI_CHILD_MODE`, `CODI_READER_MODE`,
//! `CODI_SOCKET_PATH`, `CODI_CHILD_ID`) are honored as fallbacks so child
//! code can bootstrap before arg parsing.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};

use codi_orchestrator::child::script::ScriptedRunner;
use codi_orchestrator::child::{ChildError, ChildOptions, ChildSession};
use codi_orchestrator::ipc::ToolConfirmation;
use codi_orchestrator::orchestrator::{Orchestrator, OrchestratorEvent};
use codi_orchestrator::permissions::{PermissionPrompt, PromptFn};
use codi_orchestrator::types::{
    default_socket_path, ChildKind, OrchestratorConfig, ReaderConfig, WorkerConfig,
};
use codi_orchestrator::ConfirmationResult;

/// Codi multi-agent orchestrator.
#[derive(Parser)]
#[command(name = "codi-orchestrator")]
#[command(author, version, about = "Spawn and supervise isolated coding-agent workers", long_about = None)]
struct Cli {
    /// Run as an orchestrator-managed worker (child mode)
    #[arg(long)]
    child_mode: bool,

    /// Run as a read-only reader child
    #[arg(long)]
    reader_mode: bool,

    /// IPC endpoint path
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Identity to send in the handshake (child mode)
    #[arg(long)]
    child_id: Option<String>,

    /// Initial task prompt (child mode)
    #[arg(long)]
    child_task: Option<String>,

    /// Model override
    #[arg(long, env = "CODI_MODEL")]
    model: Option<String>,

    /// Provider override
    #[arg(long, env = "CODI_PROVIDER")]
    provider: Option<String>,

    /// Comma-separated tool names pre-approved for this child
    #[arg(long)]
    auto_approve: Option<String>,

    /// Spawn a worker for each task (orchestrator mode)
    #[arg(short, long)]
    task: Vec<String>,

    /// Spawn a reader for each task (orchestrator mode)
    #[arg(long)]
    reader: Vec<String>,

    /// Maximum concurrent workers
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    /// Base branch for worker workspaces
    #[arg(long, default_value = "main")]
    base_branch: String,

    /// Directory to create worktrees in (defaults to a sibling of the repo)
    #[arg(long)]
    worktree_dir: Option<PathBuf>,

    /// Prefix for worktree branch and directory names
    #[arg(long, default_value = "codi-")]
    worktree_prefix: String,

    /// Keep workspaces on exit
    #[arg(long)]
    no_cleanup: bool,

    /// Restart cap for crashed children
    #[arg(long, default_value_t = 2)]
    max_restarts: u32,

    /// Approve all tool operations without prompting
    #[arg(short = 'y', long)]
    yes: bool,

    /// Output format for the final summary
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    output_format: OutputFormat,

    /// Suppress live event output
    #[arg(short, long)]
    quiet: bool,
}

/// Output format for the final summary.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let child_mode = cli.child_mode || env_flag("CODI_CHILD_MODE");
    let reader_mode = cli.reader_mode || env_flag("CODI_READER_MODE");

    if child_mode || reader_mode {
        return run_child(cli, reader_mode).await;
    }

    run_orchestrator(cli).await
}

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v == "true").unwrap_or(false)
}

// ============================================================================
// Child mode
// ============================================================================

async fn run_child(cli: Cli, reader_mode: bool) -> anyhow::Result<()> {
    let socket_path = cli
        .socket_path
        .or_else(|| std::env::var("CODI_SOCKET_PATH").ok().map(PathBuf::from))
        .ok_or_else(|| anyhow::anyhow!("child mode requires --socket-path"))?;
    let child_id = cli
        .child_id
        .or_else(|| std::env::var("CODI_CHILD_ID").ok())
        .ok_or_else(|| anyhow::anyhow!("child mode requires --child-id"))?;

    let options = ChildOptions {
        socket_path,
        child_id,
        task: cli.child_task.unwrap_or_default(),
        kind: if reader_mode {
            ChildKind::Reader
        } else {
            ChildKind::Worker
        },
        model: cli.model,
        provider: cli.provider,
        auto_approve: cli
            .auto_approve
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    match ChildSession::run(options, &ScriptedRunner::new()).await {
        Ok(_) | Err(ChildError::Cancelled) => Ok(()),
        Err(e) => {
            eprintln!("{}", format!("child error: {e}").red());
            std::process::exit(1);
        }
    }
}

// ============================================================================
// Orchestrator mode
// ============================================================================

/// Terminal operator prompt: y approve, n deny, a approve-always,
/// s approve-session.
struct TerminalPrompt;

#[async_trait::async_trait]
impl PermissionPrompt for TerminalPrompt {
    async fn on_permission_request(
        &self,
        child_id: &str,
        confirmation: &ToolConfirmation,
    ) -> ConfirmationResult {
        println!(
            "\n{} worker {} wants to run {}",
            "permission:".yellow().bold(),
            child_id.bright_white(),
            confirmation.tool_name.bright_magenta()
        );
        println!("  {}", confirmation.description);
        if let Ok(input) = serde_json::to_string_pretty(&confirmation.input) {
            for line in input.lines() {
                println!("  {}", line.dimmed());
            }
        }
        print!("{}", "approve? [y/n/a=always/s=session] ".cyan());
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        if reader.read_line(&mut line).await.is_err() {
            return ConfirmationResult::Deny;
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => ConfirmationResult::Approve,
            "a" | "always" => ConfirmationResult::ApproveAlways,
            "s" | "session" => ConfirmationResult::ApproveSession,
            _ => ConfirmationResult::Deny,
        }
    }
}

async fn run_orchestrator(cli: Cli) -> anyhow::Result<()> {
    if cli.task.is_empty() && cli.reader.is_empty() {
        eprintln!("No tasks given. Use --task/-t (worker) or --reader (reader); see --help.");
        return Ok(());
    }

    let repo_root = std::env::current_dir()?;
    let child_executable = std::env::current_exe()?;

    let config = OrchestratorConfig {
        socket_path: cli.socket_path.unwrap_or_else(default_socket_path),
        max_workers: cli.max_workers.max(1),
        worktree_dir: cli.worktree_dir,
        worktree_prefix: cli.worktree_prefix,
        base_branch: cli.base_branch,
        cleanup_on_exit: !cli.no_cleanup,
        max_restarts: cli.max_restarts,
        repo_root,
        child_executable,
    };

    let prompt: Arc<dyn PermissionPrompt> = if cli.yes {
        Arc::new(PromptFn(|_: &str, _: &ToolConfirmation| {
            ConfirmationResult::Approve
        }))
    } else {
        Arc::new(TerminalPrompt)
    };

    let mut orchestrator = Orchestrator::new(config).with_permission_prompt(prompt);
    orchestrator.start().await?;

    // Live event stream for the terminal.
    if let Some(mut events) = orchestrator.take_event_receiver() {
        let quiet = cli.quiet;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if quiet {
                    continue;
                }
                match event {
                    OrchestratorEvent::WorkerStarted { id, .. } => {
                        println!("{} {}", "started".green(), id);
                    }
                    OrchestratorEvent::WorkerStatus { id, state, current_tool, .. } => {
                        match current_tool {
                            Some(tool) => println!("{} {} {} ({})", "status".blue(), id, state, tool),
                            None => println!("{} {} {}", "status".blue(), id, state),
                        }
                    }
                    OrchestratorEvent::WorkerCompleted { id, result, .. } => {
                        println!("{} {}: {}", "done".green().bold(), id, result.response);
                    }
                    OrchestratorEvent::WorkerFailed { id, error, .. } => {
                        println!("{} {}: {}", "failed".red().bold(), id, error);
                    }
                    OrchestratorEvent::PermissionRequest { id, confirmation, .. } => {
                        println!(
                            "{} {} requests {}",
                            "permission".yellow(),
                            id,
                            confirmation.tool_name
                        );
                    }
                    OrchestratorEvent::AllCompleted { .. } => {}
                }
            }
        });
    }

    for (i, task) in cli.task.iter().enumerate() {
        let id = format!("worker-{}", i + 1);
        let config = WorkerConfig::new(&id, task);
        if let Err(e) = orchestrator.spawn_worker(config).await {
            eprintln!("{}", format!("failed to spawn {id}: {e}").red());
        }
    }
    for (i, task) in cli.reader.iter().enumerate() {
        let id = format!("reader-{}", i + 1);
        if let Err(e) = orchestrator.spawn_reader(ReaderConfig::new(&id, task)).await {
            eprintln!("{}", format!("failed to spawn {id}: {e}").red());
        }
    }

    let results = orchestrator.wait_all().await;
    let workers = orchestrator.get_workers().await;
    orchestrator.stop().await?;

    match cli.output_format {
        OutputFormat::Json => {
            let summary = serde_json::json!({
                "results": results,
                "workers": workers,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            println!();
            for (snapshot, result) in workers.iter().zip(results.iter()) {
                let marker = if result.success {
                    "ok".green().bold()
                } else {
                    "failed".red().bold()
                };
                println!(
                    "{} {} [{}] {}",
                    marker,
                    snapshot.id.bright_white(),
                    snapshot.state,
                    result.response
                );
            }
        }
    }

    Ok(())
}
