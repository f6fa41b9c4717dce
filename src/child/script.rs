// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted task runner.
//!
//! A line-oriented interpreter that drives the full child protocol from the
//! task text itself. The binary's child mode uses it when no agent loop is
//! embedded, and the integration suite uses it to script end-to-end
//! scenarios against real processes.
//!
//! Directives, one per line (or `;`-separated):
//!
//! ```text
//! say <text>              emit a log line
//! status <state>          report a lifecycle state (thinking, executing_tool, idle)
//! progress <0-100>        report progress
//! tokens <n>              add to the token counter
//! ask <tool> [json]       permission round-trip; denial is remembered
//! sleep <ms>              pause
//! crash-once              exit the process abruptly on the first run only
//! die                     exit the process abruptly
//! fail <text>             report task_error and stop
//! done [text]             finish (success unless a denial happened)
//! ```
//!
//! Task text that starts with no known directive is treated as
//! `say <task>; done`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::ipc::{LogLevel, ToolConfirmation};
use crate::types::{WorkerResult, WorkerStatus};

use super::{ChildContext, ChildError, TaskRunner};

/// Marker file `crash-once` leaves behind in the working directory.
const CRASH_MARKER: &str = ".codi-crashed";

/// Line-oriented scripted runner; see the module docs for the directives.
#[derive(Debug, Default)]
pub struct ScriptedRunner;

impl ScriptedRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, task: &str, ctx: &ChildContext) -> Result<WorkerResult, ChildError> {
        let steps: Vec<&str> = task
            .split(['\n', ';'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if !steps.iter().any(|s| is_directive(s)) {
            // Not a script: echo the task and finish.
            ctx.log(LogLevel::Text, task).await?;
            return Ok(WorkerResult::success(format!("Completed task: {task}")));
        }

        let mut denied_tools: Vec<String> = Vec::new();

        for step in steps {
            if ctx.is_cancelled() {
                return Err(ChildError::Cancelled);
            }
            debug!("script step: {step}");

            let (directive, rest) = split_directive(step);
            match directive {
                "say" => {
                    ctx.log(LogLevel::Text, rest).await?;
                }
                "status" => {
                    if let Some(status) = parse_status(rest) {
                        ctx.set_status(status).await?;
                    }
                }
                "progress" => {
                    if let Ok(progress) = rest.trim().parse::<u8>() {
                        ctx.set_progress(progress).await?;
                    }
                }
                "tokens" => {
                    if let Ok(tokens) = rest.trim().parse::<u64>() {
                        ctx.add_tokens(tokens);
                    }
                }
                "ask" => {
                    let (tool, input) = split_directive(rest);
                    if tool.is_empty() {
                        continue;
                    }
                    let input = if input.is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(input)
                            .unwrap_or_else(|_| serde_json::json!({ "raw": input }))
                    };

                    let verdict = ctx
                        .confirm(ToolConfirmation {
                            tool_name: tool.to_string(),
                            input,
                            description: format!("Execute tool: {tool}"),
                        })
                        .await?;

                    if verdict.is_approved() {
                        ctx.set_tool_status(WorkerStatus::ExecutingTool, tool).await?;
                        ctx.count_tool_call();
                        ctx.log(LogLevel::Tool, &format!("{tool}: ok")).await?;
                        ctx.set_status(WorkerStatus::Thinking).await?;
                    } else {
                        ctx.log(LogLevel::Warn, &format!("{tool}: permission denied"))
                            .await?;
                        denied_tools.push(tool.to_string());
                    }
                }
                "sleep" => {
                    if let Ok(ms) = rest.trim().parse::<u64>() {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                }
                "crash-once" => {
                    let marker = std::path::Path::new(CRASH_MARKER);
                    if !marker.exists() {
                        std::fs::write(marker, "1")?;
                        std::process::exit(17);
                    }
                    ctx.log(LogLevel::Info, "resumed after crash").await?;
                }
                "die" => {
                    std::process::exit(17);
                }
                "fail" => {
                    return Err(ChildError::TaskFailed(if rest.is_empty() {
                        "scripted failure".to_string()
                    } else {
                        rest.to_string()
                    }));
                }
                "done" => {
                    return Ok(finish(rest, &denied_tools));
                }
                _ => {
                    ctx.log(LogLevel::Text, step).await?;
                }
            }
        }

        Ok(finish("", &denied_tools))
    }
}

fn finish(text: &str, denied_tools: &[String]) -> WorkerResult {
    if denied_tools.is_empty() {
        WorkerResult::success(if text.is_empty() { "done" } else { text })
    } else {
        WorkerResult::failure(format!(
            "finished with denied tools: {}",
            denied_tools.join(", ")
        ))
    }
}

fn split_directive(step: &str) -> (&str, &str) {
    match step.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (step, ""),
    }
}

fn is_directive(step: &str) -> bool {
    let (head, _) = split_directive(step);
    matches!(
        head,
        "say" | "status" | "progress" | "tokens" | "ask" | "sleep" | "crash-once" | "die"
            | "fail" | "done"
    )
}

fn parse_status(s: &str) -> Option<WorkerStatus> {
    match s.trim() {
        "idle" => Some(WorkerStatus::Idle),
        "thinking" => Some(WorkerStatus::Thinking),
        "executing_tool" => Some(WorkerStatus::ExecutingTool),
        _ => None,
    }
}
