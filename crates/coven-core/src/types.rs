//! Core data types for the Coven daemon.
//!
//! These types mirror the data model in spec Section 3: tasks (beads),
//! grimoires/spells, workflow state, agents, and events. Persistence lives
//! in `covend::storage`; this crate only owns the shapes and their
//! invariants that can be checked without I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Opaque identifier used for tasks, agents, workflows, and events.
///
/// Generated with UUIDv7 so identifiers sort lexicographically by creation
/// time, which keeps the `children` and `events` indices roughly ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Task lifecycle status (spec Section 3, Task/bead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    PendingMerge,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::PendingMerge => "pending_merge",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "pending_merge" => Ok(Self::PendingMerge),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of work ("bead"). See spec Section 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub parent_id: Option<Id>,
    /// Depth in the parent/child tree; root tasks have depth 0.
    pub depth: u32,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    /// 0 (highest) through 4 (lowest); see spec Section 9(b).
    pub priority: u8,
    pub tags: BTreeSet<String>,
    pub grimoire_hint: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Invariant: `claimed_by` is set iff `status == InProgress`.
    pub fn claim_invariant_holds(&self) -> bool {
        matches!(self.status, TaskStatus::InProgress) == self.claimed_by.is_some()
    }
}

/// Grimoire step kind (spec Section 3, Grimoire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Agent,
    Script,
    Loop,
    Merge,
}

/// What happens when a `script` step exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    Fail,
    Continue,
    Block,
}

/// What happens when a `script` step exits zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    Continue,
    ExitLoop,
}

/// What happens when a `loop` step exhausts `max_iterations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    Fail,
    Block,
    Continue,
}

/// A single grimoire step as parsed from YAML.
///
/// Only the fields relevant to `step.type` are populated; the grimoire
/// loader validates that the required type-specific fields are present
/// (spec Section 4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Duration string (e.g. `"5m"`, `"2h"`); defaults applied by the loader.
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub output: Option<String>,

    // agent
    #[serde(default)]
    pub spell: Option<String>,
    #[serde(default)]
    pub input: Option<String>,

    // script
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub on_fail: Option<OnFail>,
    #[serde(default)]
    pub on_success: Option<OnSuccess>,

    // loop
    #[serde(default)]
    pub steps: Option<Vec<StepDef>>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub on_max_iterations: Option<OnMaxIterations>,

    // merge
    #[serde(default)]
    pub require_review: Option<bool>,
}

/// A named, ordered workflow definition (spec Section 3, Grimoire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grimoire {
    pub name: String,
    pub steps: Vec<StepDef>,
}

/// Step transition chosen after a step finishes (spec Section 4.3 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Continue,
    ExitLoop,
    Block,
    Fail,
}

impl StepAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::ExitLoop => "exit_loop",
            Self::Block => "block",
            Self::Fail => "fail",
        }
    }
}

/// Workflow lifecycle status (spec Section 3, WorkflowState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Blocked,
    Completed,
    Failed,
    PendingMerge,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PendingMerge => "pending_merge",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "pending_merge" => Ok(Self::PendingMerge),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Outcome recorded for a completed or skipped step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub success: bool,
    pub skipped: bool,
    /// Raw textual output of the step (agent summary / script stdout+stderr).
    pub output: String,
    pub exit_code: Option<i32>,
    /// Parsed `outputs` object, if the step produced valid structured output.
    pub outputs: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub action: StepAction,
}

/// Snapshot of loop position, captured so a crash can resume mid-loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    /// Index path into the grimoire's step tree identifying the loop step.
    pub step_path: Vec<usize>,
    pub iteration: u32,
    /// `previous` as it was when the loop was first entered.
    pub loop_entry: Option<serde_json::Value>,
}

/// Persisted state for one workflow execution (spec Section 3, WorkflowState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: Id,
    pub task_id: Id,
    pub grimoire_name: String,
    pub worktree_path: String,
    pub status: WorkflowStatus,
    /// Index of the last completed top-level step, or -1 if none yet.
    pub current_step: i64,
    pub completed_steps: std::collections::BTreeMap<String, StepResult>,
    pub step_outputs: std::collections::BTreeMap<String, serde_json::Value>,
    pub loop_state: Option<LoopState>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub blocked_reason: Option<String>,
}

/// Agent subprocess lifecycle status (spec Section 3, Agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// A supervised agent (or script) subprocess record (spec Section 3, Agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub task_id: Id,
    /// Composite id: `{task_id}-step-{n}`.
    pub step_task_id: String,
    pub pid: Option<u32>,
    pub worktree: String,
    pub status: AgentStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub output_file: String,
}

/// An entry in the `events` bucket (spec Section 3, Event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Id,
    pub event_type: String,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A question raised by an agent step that blocks on a human answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Id,
    pub task_id: Id,
    pub workflow_id: Id,
    pub step_name: String,
    pub prompt: String,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

/// A single history (audit trail) entry for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: Id,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for s in ["open", "in_progress", "pending_merge", "blocked", "closed"] {
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn claim_invariant_detects_violation() {
        let task = Task {
            id: Id::new(),
            parent_id: None,
            depth: 0,
            title: "t".into(),
            body: String::new(),
            task_type: "feature".into(),
            status: TaskStatus::InProgress,
            priority: 2,
            tags: BTreeSet::new(),
            grimoire_hint: None,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        assert!(!task.claim_invariant_holds());
    }

    #[test]
    fn workflow_status_terminal_set() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Blocked.is_terminal());
        assert!(!WorkflowStatus::PendingMerge.is_terminal());
    }

    #[test]
    fn step_def_deserializes_script_step() {
        let yaml = r#"
name: run-tests
type: script
command: "npm test"
on_fail: block
on_success: exit_loop
"#;
        let step: StepDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.name, "run-tests");
        assert_eq!(step.step_type, StepType::Script);
        assert_eq!(step.command.as_deref(), Some("npm test"));
        assert_eq!(step.on_fail, Some(OnFail::Block));
    }
}
