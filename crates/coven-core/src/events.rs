//! Event vocabulary for the broker/SSE layer (spec Section 4.7).
//!
//! Every event the daemon emits carries a dotted type name, the id of the
//! entity it concerns, a timestamp, and a JSON payload. [`EventKind`] is the
//! closed set of type names; the `*Payload` structs are the typed bodies
//! serialized into [`crate::types::EventRecord::payload`].

use crate::types::{EventRecord, Id, StepResult, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of event type names (spec Section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateSnapshot,
    TasksUpdated,
    AgentStarted,
    AgentOutput,
    AgentCompleted,
    AgentFailed,
    AgentKilled,
    AgentQuestion,
    WorkflowStarted,
    WorkflowStepStarted,
    WorkflowStepCompleted,
    WorkflowLoopIteration,
    WorkflowBlocked,
    WorkflowMergePending,
    WorkflowCompleted,
    WorkflowCancelled,
    Heartbeat,
}

impl EventKind {
    /// The wire name used as both the `events` table's `event_type` column
    /// and the SSE frame's `event:` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateSnapshot => "state.snapshot",
            Self::TasksUpdated => "tasks.updated",
            Self::AgentStarted => "agent.started",
            Self::AgentOutput => "agent.output",
            Self::AgentCompleted => "agent.completed",
            Self::AgentFailed => "agent.failed",
            Self::AgentKilled => "agent.killed",
            Self::AgentQuestion => "agent.question",
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowStepStarted => "workflow.step.started",
            Self::WorkflowStepCompleted => "workflow.step.completed",
            Self::WorkflowLoopIteration => "workflow.loop.iteration",
            Self::WorkflowBlocked => "workflow.blocked",
            Self::WorkflowMergePending => "workflow.merge_pending",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// A snapshot of daemon-wide state, sent to every new SSE subscriber before
/// any incremental events (spec Section 4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshotPayload {
    pub tasks: Vec<Task>,
    pub agents: Vec<crate::types::AgentRecord>,
    pub workflows: Vec<crate::types::WorkflowState>,
}

/// One or more tasks changed; sent instead of re-sending a full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksUpdatedPayload {
    pub task_ids: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStartedPayload {
    pub task_id: Id,
    pub step_task_id: String,
    pub pid: Option<u32>,
}

/// A single captured line of agent stdout/stderr, or a parsed sub-event
/// (`kind` is `"thinking"`, `"tool_call"`, or `"tool_result"` when the line
/// carried a structured JSON object; otherwise `"text"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub task_id: Id,
    pub step_task_id: String,
    pub kind: String,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCompletedPayload {
    pub task_id: Id,
    pub step_task_id: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailedPayload {
    pub task_id: Id,
    pub step_task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKilledPayload {
    pub task_id: Id,
    pub step_task_id: String,
}

/// An agent step raised a question and is blocked waiting on an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQuestionPayload {
    pub task_id: Id,
    pub workflow_id: Id,
    pub question_id: Id,
    pub step_name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartedPayload {
    pub workflow_id: Id,
    pub task_id: Id,
    pub grimoire_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepStartedPayload {
    pub workflow_id: Id,
    pub step_name: String,
    pub step_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepCompletedPayload {
    pub workflow_id: Id,
    pub step_name: String,
    pub result: StepResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLoopIterationPayload {
    pub workflow_id: Id,
    pub step_name: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowBlockedPayload {
    pub workflow_id: Id,
    pub task_id: Id,
    pub reason: String,
    /// Conflicting file paths, populated when the block came from a merge
    /// preview that found conflicts; empty for every other blocked reason.
    #[serde(default)]
    pub conflict_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMergePendingPayload {
    pub workflow_id: Id,
    pub task_id: Id,
    pub diff_summary: String,
    pub changed_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCompletedPayload {
    pub workflow_id: Id,
    pub task_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCancelledPayload {
    pub workflow_id: Id,
    pub task_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub now: DateTime<Utc>,
}

/// A fully-formed event ready for persistence and broadcast. Constructed by
/// subsystems via the `for_*` helpers below, which pin `kind` to the payload
/// type so a mismatched pair cannot be built.
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub id: Id,
    pub kind: EventKind,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl BrokerEvent {
    pub fn new(kind: EventKind, entity_id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            id: Id::new(),
            kind,
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload)
                .expect("event payload types always serialize"),
        }
    }

    /// Convert to the durable row persisted in the `events` bucket.
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            id: self.id.clone(),
            event_type: self.kind.as_str().to_string(),
            entity_id: self.entity_id.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
        }
    }
}

impl From<&EventRecord> for BrokerEvent {
    fn from(record: &EventRecord) -> Self {
        let kind = match record.event_type.as_str() {
            "state.snapshot" => EventKind::StateSnapshot,
            "tasks.updated" => EventKind::TasksUpdated,
            "agent.started" => EventKind::AgentStarted,
            "agent.output" => EventKind::AgentOutput,
            "agent.completed" => EventKind::AgentCompleted,
            "agent.failed" => EventKind::AgentFailed,
            "agent.killed" => EventKind::AgentKilled,
            "agent.question" => EventKind::AgentQuestion,
            "workflow.started" => EventKind::WorkflowStarted,
            "workflow.step.started" => EventKind::WorkflowStepStarted,
            "workflow.step.completed" => EventKind::WorkflowStepCompleted,
            "workflow.loop.iteration" => EventKind::WorkflowLoopIteration,
            "workflow.blocked" => EventKind::WorkflowBlocked,
            "workflow.merge_pending" => EventKind::WorkflowMergePending,
            "workflow.completed" => EventKind::WorkflowCompleted,
            "workflow.cancelled" => EventKind::WorkflowCancelled,
            _ => EventKind::Heartbeat,
        };
        Self {
            id: record.id.clone(),
            kind,
            entity_id: record.entity_id.clone(),
            timestamp: record.timestamp,
            payload: record.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_as_str() {
        assert_eq!(EventKind::StateSnapshot.as_str(), "state.snapshot");
        assert_eq!(EventKind::WorkflowStepCompleted.as_str(), "workflow.step.completed");
        assert_eq!(EventKind::Heartbeat.as_str(), "heartbeat");
    }

    #[test]
    fn broker_event_serializes_payload_to_value() {
        let ev = BrokerEvent::new(
            EventKind::AgentStarted,
            "t1",
            AgentStartedPayload {
                task_id: Id::new(),
                step_task_id: "t1-step-0".into(),
                pid: Some(123),
            },
        );
        assert_eq!(ev.payload["step_task_id"], "t1-step-0");
        assert_eq!(ev.kind.as_str(), "agent.started");
    }

    #[test]
    fn record_round_trips_back_to_broker_event() {
        let ev = BrokerEvent::new(EventKind::Heartbeat, "daemon", HeartbeatPayload { now: Utc::now() });
        let record = ev.to_record();
        let back = BrokerEvent::from(&record);
        assert_eq!(back.kind.as_str(), "heartbeat");
        assert_eq!(back.entity_id, "daemon");
    }
}
