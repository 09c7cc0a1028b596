//! Delegated code-change executor.
//!
//! The executor is a child process: prompt in, a JSONL event stream out. The
//! stream is decoded at this boundary into a closed sum type with an
//! `Unknown` variant for forward compatibility; the only hard contract is
//! the exit code and the final event carrying commit metadata.

use serde_json::Value;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Longest string retained in sanitized tool input.
const MAX_STRING_LEN: usize = 2_000;
/// Deepest nesting retained in sanitized tool input.
const MAX_DEPTH: usize = 8;
const TRUNCATED: &str = "[truncated]";

/// One event on the executor's stdout stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Connected,
    AssistantMessage { text: String },
    ToolUse { name: String, input: Value },
    ToolResult { name: String, ok: bool },
    Error { message: String },
    Completed { commit_sha: Option<String>, files_changed: Option<u64> },
    /// An event kind this version doesn't know; carried, not dropped.
    Unknown { kind: String },
}

impl ExecutorEvent {
    /// Decode one stream line. Non-JSON lines (the executor may log freely)
    /// yield `None`; JSON with an unrecognized tag yields `Unknown`.
    pub fn decode(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let kind = value.get("type")?.as_str()?.to_string();
        let event = match kind.as_str() {
            "connected" => Self::Connected,
            "assistant_message" => Self::AssistantMessage {
                text: value.get("text").and_then(Value::as_str).unwrap_or_default().into(),
            },
            "tool_use" => Self::ToolUse {
                name: value.get("name").and_then(Value::as_str).unwrap_or_default().into(),
                input: sanitize_tool_input(
                    value.get("input").cloned().unwrap_or(Value::Null),
                ),
            },
            "tool_result" => Self::ToolResult {
                name: value.get("name").and_then(Value::as_str).unwrap_or_default().into(),
                ok: value.get("ok").and_then(Value::as_bool).unwrap_or(true),
            },
            "error" => Self::Error {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown executor error")
                    .into(),
            },
            "completed" => Self::Completed {
                commit_sha: value
                    .get("commit_sha")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                files_changed: value.get("files_changed").and_then(Value::as_u64),
            },
            _ => Self::Unknown { kind },
        };
        Some(event)
    }
}

/// Cap strings, bound nesting, and replace anything past the depth limit
/// with a placeholder so a hostile or buggy tool payload can't blow up logs
/// or memory.
pub fn sanitize_tool_input(value: Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String(TRUNCATED.into());
    }
    match value {
        Value::String(s) => {
            if s.chars().count() > MAX_STRING_LEN {
                let mut capped: String = s.chars().take(MAX_STRING_LEN).collect();
                capped.push('…');
                Value::String(capped)
            } else {
                Value::String(s)
            }
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| sanitize_at(v, depth + 1)).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter().map(|(k, v)| (k, sanitize_at(v, depth + 1))).collect(),
        ),
        other => other,
    }
}

/// How to invoke the delegated executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { program: "forge-executor".into(), args: vec!["--stream-json".into()] }
    }
}

/// What the executor run produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOutcome {
    pub exit_ok: bool,
    pub commit_sha: Option<String>,
    pub files_changed: Option<u64>,
    pub event_count: usize,
    pub errors: Vec<String>,
}

/// Spawn the executor in `workspace`, feed it the prompt on stdin, and fold
/// its event stream into an outcome.
pub async fn run_executor(
    config: &ExecutorConfig,
    workspace: &Path,
    prompt: &str,
) -> io::Result<ExecutorOutcome> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .current_dir(workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let mut outcome = ExecutorOutcome::default();
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(event) = ExecutorEvent::decode(&line) else { continue };
            outcome.event_count += 1;
            match event {
                ExecutorEvent::Completed { commit_sha, files_changed } => {
                    outcome.commit_sha = commit_sha;
                    outcome.files_changed = files_changed;
                }
                ExecutorEvent::Error { message } => {
                    tracing::warn!(error = %message, "executor reported an error");
                    outcome.errors.push(message);
                }
                ExecutorEvent::ToolUse { name, .. } => {
                    tracing::debug!(tool = %name, "executor tool use");
                }
                ExecutorEvent::Unknown { kind } => {
                    tracing::debug!(kind = %kind, "unknown executor event");
                }
                _ => {}
            }
        }
    }

    let status = child.wait().await?;
    outcome.exit_ok = status.success();
    Ok(outcome)
}
