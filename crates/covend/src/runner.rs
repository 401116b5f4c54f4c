//! Agent runner & process manager (spec Section 4.6).
//!
//! [`AgentRunner`] is the abstract interface the engine's agent executor
//! talks to: "spawn the configured agent binary with a prompt, inside a
//! worktree, and return captured output + exit code" (spec 4.6).
//! [`ProcessAgentRunner`] is the only implementation: it shells out to a
//! configurable binary (generalizing the teacher's hardcoded `claude`
//! invocation in `runner.rs`), enforces at-most-one live process per
//! `step_task_id`, and republishes every captured line through the
//! `on_line` callback so the caller can forward it to the event broker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AgentRunnerError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to read agent output: {0}")]
    Io(#[source] std::io::Error),

    #[error("agent step {0} timed out")]
    Timeout(String),

    #[error("agent step {0} was cancelled")]
    Cancelled(String),

    #[error("no live process for step {0}")]
    NotRunning(String),

    #[error("a process is already running for step {0}")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, AgentRunnerError>;

/// Which bucket a captured output line belongs to, per the structured
/// sub-event contract in spec 4.3.1 ("tokens and tool-call events observed
/// in the stream are written to the workflow log").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLineKind {
    Text,
    Thinking,
    ToolCall,
    ToolResult,
}

impl AgentLineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }

    /// A line is a recognized sub-event only if it parses as a JSON object
    /// carrying a `type` key matching one of the three known kinds;
    /// anything else (including malformed JSON) passes through as `Text`.
    fn classify(line: &str) -> Self {
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line.trim()) else {
            return Self::Text;
        };
        match obj.get("type").and_then(Value::as_str) {
            Some("thinking") => Self::Thinking,
            Some("tool_call") => Self::ToolCall,
            Some("tool_result") => Self::ToolResult,
            _ => Self::Text,
        }
    }
}

/// The parsed result of the agent output contract (spec 4.3: "a final JSON
/// block with keys `{success, summary, outputs?, error?}`").
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub summary: String,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

/// Scans `output` from the end for the last line that parses as a JSON
/// object carrying both `success` (bool) and `summary` (string). Absence
/// of such a block is itself a failure outcome (spec 4.3: "Absence of a
/// valid block -> step result success=false").
fn extract_outcome(output: &str, exit_code: Option<i32>) -> AgentOutcome {
    for line in output.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        let (Some(success), Some(summary)) = (
            obj.get("success").and_then(Value::as_bool),
            obj.get("summary").and_then(Value::as_str),
        ) else {
            continue;
        };
        return AgentOutcome {
            success,
            summary: summary.to_string(),
            outputs: obj.get("outputs").cloned(),
            error: obj
                .get("error")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            exit_code,
        };
    }
    AgentOutcome {
        success: false,
        summary: "agent produced no trailing JSON output block".to_string(),
        outputs: None,
        error: Some("missing or malformed agent output contract".to_string()),
        exit_code,
    }
}

/// Inputs to a single agent invocation.
pub struct SpawnRequest<'a> {
    pub step_task_id: &'a str,
    pub worktree: &'a Path,
    pub prompt: &'a str,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    /// Called once per captured stdout/stderr line, before the process
    /// exits. Must not block for long — it typically forwards to the
    /// event broker's bounded channel.
    pub on_line: &'a (dyn Fn(AgentLineKind, &str) + Send + Sync),
}

/// The abstract agent runner interface (spec 4.6). Returns a boxed future
/// rather than an `async fn` so the trait stays object-safe — the engine
/// holds an `Arc<dyn AgentRunner>`.
pub trait AgentRunner: Send + Sync {
    fn spawn<'a>(&'a self, request: SpawnRequest<'a>) -> BoxFuture<'a, Result<AgentOutcome>>;

    /// Best-effort kill of a live process for `step_task_id`. A no-op if
    /// none is running.
    fn kill<'a>(&'a self, step_task_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Whether a process is currently tracked for `step_task_id`.
    fn is_running<'a>(&'a self, step_task_id: &'a str) -> BoxFuture<'a, bool>;
}

struct ProcessEntry {
    pid: Option<u32>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Default [`AgentRunner`] implementation: spawns the configured agent
/// binary as a child process. Generalizes the teacher's `Runner`, which
/// always invoked `claude -p --dangerously-skip-permissions --model
/// <model> <prompt>`, into "invoke the configured agent binary with the
/// configured base arguments, then the prompt".
pub struct ProcessAgentRunner {
    agent_bin: String,
    base_args: Vec<String>,
    processes: Arc<Mutex<HashMap<String, Arc<ProcessEntry>>>>,
}

impl ProcessAgentRunner {
    pub fn new(agent_bin: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            agent_bin: agent_bin.into(),
            base_args,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for ProcessAgentRunner {
    fn default() -> Self {
        Self::new("claude", vec!["-p".to_string()])
    }
}

impl AgentRunner for ProcessAgentRunner {
    fn spawn<'a>(&'a self, request: SpawnRequest<'a>) -> BoxFuture<'a, Result<AgentOutcome>> {
        Box::pin(async move {
            {
                let guard = self.processes.lock().await;
                if guard.contains_key(request.step_task_id) {
                    return Err(AgentRunnerError::AlreadyRunning(
                        request.step_task_id.to_string(),
                    ));
                }
            }

            let mut command = Command::new(&self.agent_bin);
            command
                .args(&self.base_args)
                .arg(request.prompt)
                .current_dir(request.worktree)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = command.spawn().map_err(AgentRunnerError::Spawn)?;
            let pid = child.id();
            let stdout = child.stdout.take().expect("piped stdout");
            let stderr = child.stderr.take().expect("piped stderr");

            let (kill_tx, mut kill_rx) = oneshot::channel();
            let entry = Arc::new(ProcessEntry {
                pid,
                kill_tx: Mutex::new(Some(kill_tx)),
            });
            self.processes
                .lock()
                .await
                .insert(request.step_task_id.to_string(), Arc::clone(&entry));

            let captured = Mutex::new(String::new());

            let outcome = tokio::select! {
                (_, _, status) = async {
                    tokio::join!(
                        drain_lines(stdout, &captured, request.on_line),
                        drain_lines(stderr, &captured, request.on_line),
                        child.wait(),
                    )
                } => {
                    let status = status.map_err(AgentRunnerError::Io)?;
                    let output = captured.lock().await.clone();
                    Ok(extract_outcome(&output, status.code()))
                }
                () = tokio::time::sleep(request.timeout) => {
                    let _ = child.kill().await;
                    Err(AgentRunnerError::Timeout(request.step_task_id.to_string()))
                }
                () = request.cancel.cancelled() => {
                    let _ = child.kill().await;
                    Err(AgentRunnerError::Cancelled(request.step_task_id.to_string()))
                }
                _ = &mut kill_rx => {
                    let _ = child.kill().await;
                    Err(AgentRunnerError::Cancelled(request.step_task_id.to_string()))
                }
            };

            self.processes.lock().await.remove(request.step_task_id);
            debug!(step_task_id = request.step_task_id, pid, "agent process finished");
            outcome
        })
    }

    fn kill<'a>(&'a self, step_task_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let entry = {
                let guard = self.processes.lock().await;
                guard.get(step_task_id).cloned()
            };
            match entry {
                Some(entry) => {
                    if let Some(tx) = entry.kill_tx.lock().await.take() {
                        let _ = tx.send(());
                    }
                    Ok(())
                }
                None => Err(AgentRunnerError::NotRunning(step_task_id.to_string())),
            }
        })
    }

    fn is_running<'a>(&'a self, step_task_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.processes.lock().await.contains_key(step_task_id) })
    }
}

/// Reads `reader` line by line until EOF, classifying and forwarding each
/// line through `on_line` and appending it to the shared capture buffer
/// used for the trailing-JSON-block scan once the process exits.
async fn drain_lines<R>(reader: R, captured: &Mutex<String>, on_line: &(dyn Fn(AgentLineKind, &str) + Send + Sync))
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let kind = AgentLineKind::classify(&line);
        on_line(kind, &line);
        let mut buf = captured.lock().await;
        buf.push_str(&line);
        buf.push('\n');
    }
}

/// Checks OS-level liveness of a PID via `kill -0`, used on resume to
/// decide whether a `step_task_id` recorded with a PID in the `agents`
/// bucket is still running after a daemon restart (spec 4.6: "if a
/// `step_task_id` is still live (PID exists), the engine attaches and
/// waits rather than re-spawning"). The in-process registry above cannot
/// answer this across a restart since it is rebuilt empty; this is the
/// cross-process fallback.
pub fn is_pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Render the system prompt for an agent step: the resolved spell body is
/// the whole prompt (spec 4.3.1: "renders a system prompt template
/// composing `{workflow, step, bead, spell_content}` with the rendered
/// spell" — in practice the spell body *is* that composition, since the
/// spell template already has access to the full workflow context).
pub fn step_task_id(task_id: &str, step_index: i64) -> String {
    format!("{task_id}-step-{step_index}")
}

#[allow(dead_code)]
fn _agent_binary_path(bin: &str) -> PathBuf {
    PathBuf::from(bin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_known_sub_event_types() {
        assert_eq!(
            AgentLineKind::classify(r#"{"type":"thinking","text":"hm"}"#),
            AgentLineKind::Thinking
        );
        assert_eq!(
            AgentLineKind::classify(r#"{"type":"tool_call","name":"grep"}"#),
            AgentLineKind::ToolCall
        );
        assert_eq!(AgentLineKind::classify("plain text line"), AgentLineKind::Text);
        assert_eq!(
            AgentLineKind::classify(r#"{"type":"unknown"}"#),
            AgentLineKind::Text
        );
    }

    #[test]
    fn extract_outcome_finds_trailing_json_block() {
        let output = "doing stuff\nmore stuff\n{\"success\": true, \"summary\": \"done\", \"outputs\": {\"x\": 1}}\n";
        let outcome = extract_outcome(output, Some(0));
        assert!(outcome.success);
        assert_eq!(outcome.summary, "done");
        assert_eq!(outcome.outputs.unwrap()["x"], 1);
    }

    #[test]
    fn extract_outcome_fails_without_a_block() {
        let outcome = extract_outcome("no json here\njust text\n", Some(0));
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn extract_outcome_prefers_the_last_block() {
        let output = "{\"success\": false, \"summary\": \"first\"}\nsome log noise\n{\"success\": true, \"summary\": \"second\"}\n";
        let outcome = extract_outcome(output, Some(0));
        assert!(outcome.success);
        assert_eq!(outcome.summary, "second");
    }

    #[test]
    fn step_task_id_is_composite() {
        assert_eq!(step_task_id("t1", 2), "t1-step-2");
    }

    #[tokio::test]
    async fn process_agent_runner_captures_output_and_succeeds() {
        let runner = ProcessAgentRunner::new("sh", vec!["-c".to_string()]);
        let dir = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = Arc::clone(&lines);
        let on_line = move |_kind: AgentLineKind, line: &str| {
            let lines_clone = Arc::clone(&lines_clone);
            let line = line.to_string();
            tokio::spawn(async move { lines_clone.lock().await.push(line) });
        };

        let script = r#"echo hello; echo '{"success": true, "summary": "ok"}'"#;
        let outcome = runner
            .spawn(SpawnRequest {
                step_task_id: "t1-step-0",
                worktree: dir.path(),
                prompt: script,
                timeout: Duration::from_secs(5),
                cancel,
                on_line: &on_line,
            })
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.summary, "ok");
        assert!(!runner.is_running("t1-step-0").await);
    }

    #[tokio::test]
    async fn process_agent_runner_times_out() {
        let runner = ProcessAgentRunner::new("sh", vec!["-c".to_string()]);
        let dir = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let on_line = |_kind: AgentLineKind, _line: &str| {};

        let result = runner
            .spawn(SpawnRequest {
                step_task_id: "t1-step-1",
                worktree: dir.path(),
                prompt: "sleep 5",
                timeout: Duration::from_millis(50),
                cancel,
                on_line: &on_line,
            })
            .await;

        assert!(matches!(result, Err(AgentRunnerError::Timeout(_))));
    }
}
