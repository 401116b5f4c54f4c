//! covenctl - CLI client for covend.
//!
//! Talks to the daemon's Unix control socket (see `covend/src/server.rs`
//! for the routes). Every subcommand prints the daemon's JSON response
//! pretty-printed to stdout; errors go to stderr with exit code 1.

mod client;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use eyre::{Result, WrapErr};

/// Control-plane CLI for the covend workflow daemon.
#[derive(Debug, Parser)]
#[command(name = "covenctl", version, about = "Control plane for covend")]
struct Cli {
    /// Workspace root whose `.coven/covend.sock` to talk to.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check whether covend is reachable and report its uptime.
    Health,
    /// Dump the full in-memory state snapshot (tasks, agents, workflows).
    State,
    /// Request a graceful daemon shutdown.
    Shutdown,

    /// Create a task from JSON on stdin or a literal --json value.
    Create {
        #[arg(long)]
        json: Option<String>,
    },
    /// Create many tasks at once from a JSON array on stdin or --json.
    Bulk {
        #[arg(long)]
        json: Option<String>,
    },
    /// List all open tasks.
    List,
    /// Show one task.
    Show { task_id: String },
    /// Patch a task's fields (title/body/task_type/status/priority/grimoire_hint).
    Patch {
        task_id: String,
        #[arg(long)]
        json: String,
    },
    /// Delete a task and its subtree.
    Delete { task_id: String },
    /// Claim a task for an agent id.
    Claim { task_id: String, agent_id: String },
    /// Release a claimed task back to open.
    Release { task_id: String },
    /// Mark a task complete.
    Complete { task_id: String },
    /// Mark a task blocked.
    Block { task_id: String },
    /// Add tags to a task.
    Tag { task_id: String, tags: Vec<String> },
    /// Remove tags from a task.
    Untag { task_id: String, tags: Vec<String> },
    /// Move a task under a new parent.
    Reparent { task_id: String, new_parent_id: String },
    /// List a task's children.
    Children { task_id: String },
    /// Show a task's claim/status history.
    History { task_id: String },

    /// List workflows.
    Workflows,
    /// Show one workflow, including its available actions.
    Workflow { task_id: String },
    /// Print a workflow's event log as newline-delimited JSON.
    Log { task_id: String },
    /// Cancel a running workflow.
    Cancel { task_id: String },
    /// Retry a blocked or failed workflow.
    Retry { task_id: String },
    /// Approve a pending merge.
    ApproveMerge { task_id: String },
    /// Reject a pending merge, sending the workflow back to blocked.
    RejectMerge { task_id: String },

    /// Print an agent's captured output, optionally starting from a line offset.
    Output {
        step_task_id: String,
        #[arg(long)]
        since: Option<usize>,
    },
    /// Answer a pending question raised by a running workflow.
    Answer { question_id: String, answer: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = cli
        .workspace
        .canonicalize()
        .wrap_err_with(|| format!("workspace {} does not exist", cli.workspace.display()))?;
    let client = Client::new(&workspace);

    let result = dispatch(&client, cli.command).await;
    match result {
        Ok(value) => {
            print_value(value);
            Ok(())
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn print_value(value: serde_json::Value) {
    if value.is_null() {
        return;
    }
    match value.as_str() {
        Some(s) => println!("{s}"),
        None => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())),
    }
}

async fn dispatch(client: &Client, command: Command) -> Result<serde_json::Value, ClientError> {
    use Command::*;
    match command {
        Health => client.health().await,
        State => client.state().await,
        Shutdown => client.shutdown().await.map(|_| serde_json::Value::Null),

        Create { json } => {
            let body = parse_task_body(json)?;
            client.create_task(&body).await
        }
        Bulk { json } => {
            let body = parse_task_body(json)?;
            client.bulk_create_tasks(&body).await
        }
        List => client.list_tasks().await,
        Show { task_id } => client.get_task(&task_id).await,
        Patch { task_id, json } => {
            let body: serde_json::Value =
                serde_json::from_str(&json).map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            client.patch_task(&task_id, &body).await
        }
        Delete { task_id } => client.delete_task(&task_id).await.map(|_| serde_json::Value::Null),
        Claim { task_id, agent_id } => client.claim_task(&task_id, &agent_id).await,
        Release { task_id } => client.release_task(&task_id).await,
        Complete { task_id } => client.complete_task(&task_id).await,
        Block { task_id } => client.block_task(&task_id).await,
        Tag { task_id, tags } => client.add_tags(&task_id, &tags).await,
        Untag { task_id, tags } => client.remove_tags(&task_id, &tags).await,
        Reparent { task_id, new_parent_id } => client.reparent_task(&task_id, &new_parent_id).await,
        Children { task_id } => client.children(&task_id).await,
        History { task_id } => client.history(&task_id).await,

        Workflows => client.list_workflows().await,
        Workflow { task_id } => client.get_workflow(&task_id).await,
        Log { task_id } => client.workflow_log(&task_id).await.map(serde_json::Value::String),
        Cancel { task_id } => client.cancel_workflow(&task_id).await.map(|_| serde_json::Value::Null),
        Retry { task_id } => client.retry_workflow(&task_id).await.map(|_| serde_json::Value::Null),
        ApproveMerge { task_id } => client.approve_merge(&task_id).await.map(|_| serde_json::Value::Null),
        RejectMerge { task_id } => client.reject_merge(&task_id).await.map(|_| serde_json::Value::Null),

        Output { step_task_id, since } => client.agent_output(&step_task_id, since).await,
        Answer { question_id, answer } => client.answer_question(&question_id, &answer).await,
    }
}

/// Reads the task body to create from `--json`, falling back to stdin so
/// `covenctl create < task.json` works the way the daemon's own bulk-import
/// tooling is expected to.
fn parse_task_body(json: Option<String>) -> Result<serde_json::Value, ClientError> {
    let raw = match json {
        Some(s) => s,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            buf
        }
    };
    serde_json::from_str(&raw).map_err(|e| ClientError::InvalidResponse(e.to_string()))
}
