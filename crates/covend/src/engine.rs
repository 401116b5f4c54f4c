//! Workflow engine & step executors (spec Section 4.3, 4.3.1, 4.4).
//!
//! One [`Engine`] instance is shared by the whole daemon; it owns a table
//! of in-flight [`WorkflowHandle`]s (one per active workflow) and drives
//! each workflow's step list to completion as its own `tokio::task`, the
//! same "one cooperative task per active workflow" shape the teacher uses
//! for runs (`Daemon::run`/`process_run`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coven_core::events::{
    AgentCompletedPayload, AgentFailedPayload, AgentOutputPayload, AgentStartedPayload,
    WorkflowBlockedPayload, WorkflowCancelledPayload, WorkflowCompletedPayload,
    WorkflowLoopIterationPayload, WorkflowMergePendingPayload, WorkflowStartedPayload,
    WorkflowStepCompletedPayload, WorkflowStepStartedPayload,
};
use coven_core::template::{render, IncludeResolver, NoIncludes};
use coven_core::{
    grimoire, spell, BrokerEvent, EventKind, Grimoire, GrimoireError, Id, LoopState, OnFail,
    OnMaxIterations, OnSuccess, SpellError, StepAction, StepDef, StepResult, StepType, Task,
    TaskStatus, TemplateError, WhenError, WorkflowState, WorkflowStatus,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::EventBroker;
use crate::runner::{self, AgentLineKind, AgentRunner, AgentRunnerError, SpawnRequest};
use crate::store::{Store, StoreError, TaskPatch};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Grimoire(#[from] GrimoireError),
    #[error(transparent)]
    Spell(#[from] SpellError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    When(#[from] WhenError),
    #[error(transparent)]
    AgentRunner(#[from] AgentRunnerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no running workflow for task {0}")]
    NotRunning(String),
    #[error("a workflow is already running for task {0}")]
    AlreadyRunning(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A handle the engine keeps for each in-flight workflow, used by the
/// scheduler's `cancel` action.
struct WorkflowHandle {
    cancel: CancellationToken,
}

/// What happened at the end of one step, or one step list (spec 4.3 step 6).
enum StepOutcome {
    Continue,
    ExitLoop,
    /// A plain block, e.g. a merge preview with conflicts, or an
    /// `on_max_iterations: block` loop. Carries any associated file list
    /// (conflicting paths), empty when not applicable.
    Block(String, Vec<String>),
    /// A `merge` step whose preview found no conflicts but needs
    /// `require_review` sign-off (spec 4.3.1). Distinct from `Block` so
    /// `settle` routes it to `pending_merge`, never to plain `blocked`.
    BlockMergePending(String, Vec<String>),
    Fail(String),
    Cancelled,
}

/// What happened at the end of an entire step list (top-level grimoire, or
/// a loop body). `Continue` only escapes a loop body; at the top level it
/// means every step ran to completion.
enum ListOutcome {
    Completed,
    ExitLoop,
    Block(String, Vec<String>),
    BlockMergePending(String, Vec<String>),
    Fail(String),
    Cancelled,
}

/// Drives workflow execution. Holds no workflow state of its own between
/// calls — all durable state lives in the [`Store`]; this only tracks the
/// live `CancellationToken` for each in-flight workflow so `/cancel` has
/// something to fire.
pub struct Engine {
    store: Arc<Store>,
    broker: Arc<EventBroker>,
    agent_runner: Arc<dyn AgentRunner>,
    workspace_root: PathBuf,
    handles: AsyncMutex<BTreeMap<String, WorkflowHandle>>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<EventBroker>,
        agent_runner: Arc<dyn AgentRunner>,
        workspace_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self { store, broker, agent_runner, workspace_root, handles: AsyncMutex::new(BTreeMap::new()) })
    }

    /// Start a freshly-claimed workflow, spawning its driver task (spec
    /// 4.5 reconciliation step 2.d: "Hand off to the engine in a new
    /// cooperative task").
    pub async fn start(self: &Arc<Self>, task: Task, state: WorkflowState, grimoire: Grimoire, worktree: PathBuf) -> Result<()> {
        self.spawn_driver(task, state, grimoire, worktree).await
    }

    /// Resume a workflow found `running` at startup (spec 4.3 Resume):
    /// reload its grimoire and re-enter the driver from `current_step+1`.
    pub async fn resume(self: &Arc<Self>, task: Task, state: WorkflowState) -> Result<()> {
        let grimoire = grimoire::load(&self.workspace_root, &state.grimoire_name)?;
        let worktree = PathBuf::from(&state.worktree_path);
        self.spawn_driver(task, state, grimoire, worktree).await
    }

    async fn spawn_driver(self: &Arc<Self>, task: Task, state: WorkflowState, grimoire: Grimoire, worktree: PathBuf) -> Result<()> {
        let task_id = task.id.0.clone();
        let cancel = CancellationToken::new();
        {
            let mut handles = self.handles.lock().await;
            if handles.contains_key(&task_id) {
                return Err(EngineError::AlreadyRunning(task_id));
            }
            handles.insert(task_id.clone(), WorkflowHandle { cancel: cancel.clone() });
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.clone().drive(task, state, grimoire, worktree, cancel).await;
            engine.handles.lock().await.remove(&task_id);
        });
        Ok(())
    }

    /// Best-effort cancellation of a running workflow (spec 4.5
    /// "Cancellation semantics").
    pub async fn cancel(&self, task_id: &Id) -> Result<()> {
        let handles = self.handles.lock().await;
        match handles.get(task_id.as_ref()) {
            Some(handle) => {
                handle.cancel.cancel();
                Ok(())
            }
            None => Err(EngineError::NotRunning(task_id.to_string())),
        }
    }

    pub async fn is_running(&self, task_id: &Id) -> bool {
        self.handles.lock().await.contains_key(task_id.as_ref())
    }

    /// The full per-workflow driver loop: run the grimoire's top-level step
    /// list, then settle the terminal workflow/task state.
    async fn drive(self: Arc<Self>, task: Task, mut state: WorkflowState, grimoire: Grimoire, worktree: PathBuf, cancel: CancellationToken) {
        if state.current_step < 0 {
            self.broker
                .publish(BrokerEvent::new(
                    EventKind::WorkflowStarted,
                    task.id.as_ref(),
                    WorkflowStartedPayload {
                        workflow_id: state.workflow_id.clone(),
                        task_id: task.id.clone(),
                        grimoire_name: state.grimoire_name.clone(),
                    },
                ))
                .await
                .ok();
        }

        let start_index = usize::try_from(state.current_step + 1).unwrap_or(0);
        let mut ctx = RunContext::restore(&task, &state);

        let outcome = self
            .execute_list(&grimoire.steps, start_index, &mut ctx, &mut state, &task, &worktree, &cancel, true)
            .await;

        self.settle(task, state, worktree, outcome).await;
    }

    /// Apply the terminal transition implied by `outcome` to the workflow
    /// and task records (spec 4.3 step 6 / spec 4.5 reconciliation).
    async fn settle(&self, task: Task, mut state: WorkflowState, worktree: PathBuf, outcome: ListOutcome) {
        state.updated_at = Utc::now();
        match outcome {
            ListOutcome::Completed | ListOutcome::ExitLoop => {
                state.status = WorkflowStatus::Completed;
                if let Err(err) = self.store.save_workflow(&state).await {
                    warn!(%err, task_id = %task.id, "failed to persist completed workflow");
                }
                // spec 9(a): allow direct close when no merge step blocked first.
                if self
                    .store
                    .patch_task(&task.id, &TaskPatch { status: Some(TaskStatus::Closed), ..Default::default() })
                    .await
                    .is_ok()
                {
                    crate::worktree::destroy(&self.workspace_root, task.id.as_ref());
                }
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowCompleted,
                        task.id.as_ref(),
                        WorkflowCompletedPayload { workflow_id: state.workflow_id.clone(), task_id: task.id.clone() },
                    ))
                    .await
                    .ok();
            }
            ListOutcome::Block(reason, conflict_files) => {
                state.status = WorkflowStatus::Blocked;
                state.blocked_reason = Some(reason.clone());
                self.store.save_workflow(&state).await.ok();
                self.store
                    .patch_task(&task.id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
                    .await
                    .ok();
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowBlocked,
                        task.id.as_ref(),
                        WorkflowBlockedPayload {
                            workflow_id: state.workflow_id.clone(),
                            task_id: task.id.clone(),
                            reason,
                            conflict_files,
                        },
                    ))
                    .await
                    .ok();
            }
            ListOutcome::BlockMergePending(reason, changed_files) => {
                state.status = WorkflowStatus::PendingMerge;
                state.blocked_reason = Some(reason.clone());
                self.store.save_workflow(&state).await.ok();
                self.store
                    .patch_task(&task.id, &TaskPatch { status: Some(TaskStatus::PendingMerge), ..Default::default() })
                    .await
                    .ok();
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowMergePending,
                        task.id.as_ref(),
                        WorkflowMergePendingPayload {
                            workflow_id: state.workflow_id.clone(),
                            task_id: task.id.clone(),
                            diff_summary: reason,
                            changed_files,
                        },
                    ))
                    .await
                    .ok();
            }
            ListOutcome::Fail(error) => {
                state.status = WorkflowStatus::Failed;
                state.error = Some(error.clone());
                self.store.save_workflow(&state).await.ok();
                self.store
                    .patch_task(&task.id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
                    .await
                    .ok();
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowBlocked,
                        task.id.as_ref(),
                        WorkflowBlockedPayload {
                            workflow_id: state.workflow_id.clone(),
                            task_id: task.id.clone(),
                            reason: error,
                            conflict_files: Vec::new(),
                        },
                    ))
                    .await
                    .ok();
            }
            ListOutcome::Cancelled => {
                state.status = WorkflowStatus::Cancelled;
                self.store.save_workflow(&state).await.ok();
                // `release`, not `patch_task`, so `claimed_by`/`claimed_at` are
                // cleared along with the status (spec Section 3 claim invariant).
                self.store.release(&task.id).await.ok();
                // Worktree is retained for inspection until GC (spec 4.5).
                let _ = &worktree;
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowCancelled,
                        task.id.as_ref(),
                        WorkflowCancelledPayload { workflow_id: state.workflow_id.clone(), task_id: task.id.clone() },
                    ))
                    .await
                    .ok();
            }
        }
    }

    /// Execute `steps[start_index..]` in order (spec 4.3.1 loop executor,
    /// and the top-level driver, share this). `top_level` gates whether
    /// `current_step`/`loop_state` are persisted to [`WorkflowState`] —
    /// only the outermost call's position is resumable per spec Section 3
    /// ("current_step: index of the last completed *top-level* step").
    #[allow(clippy::too_many_arguments)]
    fn execute_list<'a>(
        &'a self,
        steps: &'a [StepDef],
        start_index: usize,
        ctx: &'a mut RunContext,
        state: &'a mut WorkflowState,
        task: &'a Task,
        worktree: &'a Path,
        cancel: &'a CancellationToken,
        top_level: bool,
    ) -> BoxFuture<'a, ListOutcome> {
        Box::pin(async move {
            for (index, step) in steps.iter().enumerate().skip(start_index) {
                if cancel.is_cancelled() {
                    return ListOutcome::Cancelled;
                }

                let outcome = self.execute_step(step, ctx, state, task, worktree, cancel).await;

                if top_level {
                    state.current_step = index as i64;
                    self.store.save_workflow(state).await.ok();
                }

                match outcome {
                    StepOutcome::Continue => continue,
                    StepOutcome::ExitLoop => return ListOutcome::ExitLoop,
                    StepOutcome::Block(reason, files) => return ListOutcome::Block(reason, files),
                    StepOutcome::BlockMergePending(reason, files) => {
                        return ListOutcome::BlockMergePending(reason, files)
                    }
                    StepOutcome::Fail(error) => return ListOutcome::Fail(error),
                    StepOutcome::Cancelled => return ListOutcome::Cancelled,
                }
            }
            ListOutcome::Completed
        })
    }

    /// Run one step per the per-step algorithm (spec 4.3).
    async fn execute_step(&self, step: &StepDef, ctx: &mut RunContext, state: &mut WorkflowState, task: &Task, worktree: &Path, cancel: &CancellationToken) -> StepOutcome {
        if let Some(when) = &step.when {
            match coven_core::template::eval_strict_bool(when, &ctx.value()) {
                Ok(true) => {}
                Ok(false) => {
                    let result = StepResult {
                        step_name: step.name.clone(),
                        success: true,
                        skipped: true,
                        output: String::new(),
                        exit_code: None,
                        outputs: None,
                        started_at: Utc::now(),
                        ended_at: Utc::now(),
                        action: StepAction::Continue,
                    };
                    ctx.bind(step, &result);
                    state.completed_steps.insert(step.name.clone(), result);
                    return StepOutcome::Continue;
                }
                Err(err) => return StepOutcome::Fail(format!("step {:?}: when clause failed: {err}", step.name)),
            }
        }

        self.broker
            .publish(BrokerEvent::new(
                EventKind::WorkflowStepStarted,
                task.id.as_ref(),
                WorkflowStepStartedPayload {
                    workflow_id: state.workflow_id.clone(),
                    step_name: step.name.clone(),
                    step_index: state.current_step,
                },
            ))
            .await
            .ok();

        let timeout = grimoire::step_timeout(step);
        let started_at = Utc::now();

        let result = match step.step_type {
            StepType::Script => self.run_script(step, ctx, task, worktree, timeout, cancel).await,
            StepType::Agent => self.run_agent(step, ctx, state, task, worktree, timeout, cancel).await,
            StepType::Loop => {
                return self.run_loop(step, ctx, state, task, worktree, cancel).await;
            }
            StepType::Merge => self.run_merge(step, worktree).await,
        };

        let (result, action) = match result {
            Ok((result, action)) => (result, action),
            Err(err) => return StepOutcome::Fail(format!("step {:?}: {err}", step.name)),
        };

        let mut result = result;
        result.started_at = started_at;
        result.ended_at = Utc::now();
        result.action = action;

        self.broker
            .publish(BrokerEvent::new(
                EventKind::WorkflowStepCompleted,
                task.id.as_ref(),
                WorkflowStepCompletedPayload {
                    workflow_id: state.workflow_id.clone(),
                    step_name: step.name.clone(),
                    result: result.clone(),
                },
            ))
            .await
            .ok();

        ctx.bind(step, &result);
        state.completed_steps.insert(step.name.clone(), result.clone());
        if let Some(binding) = &step.output {
            state.step_outputs.insert(binding.clone(), ctx.lookup_binding(binding));
        }
        state.step_outputs.insert(step.name.clone(), ctx.lookup_binding(&step.name));

        if cancel.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        match action {
            StepAction::Continue => StepOutcome::Continue,
            StepAction::ExitLoop => StepOutcome::ExitLoop,
            StepAction::Block if step.step_type == StepType::Merge => {
                // spec 4.3.1: conflicts always settle to `blocked`, carrying
                // the conflict file list; only a clean-but-unreviewed merge
                // settles to `pending_merge`.
                let conflicts = result
                    .outputs
                    .as_ref()
                    .and_then(|o| o.get("conflicts"))
                    .and_then(|v| v.as_array())
                    .map(|files| files.iter().filter_map(|f| f.as_str().map(str::to_string)).collect::<Vec<_>>());
                match conflicts {
                    Some(files) => StepOutcome::Block(result.output, files),
                    None => {
                        let changed_files = result
                            .outputs
                            .as_ref()
                            .and_then(|o| o.get("changed_files"))
                            .and_then(|v| v.as_array())
                            .map(|files| {
                                files.iter().filter_map(|f| f.as_str().map(str::to_string)).collect::<Vec<_>>()
                            })
                            .unwrap_or_default();
                        StepOutcome::BlockMergePending(result.output, changed_files)
                    }
                }
            }
            StepAction::Block => StepOutcome::Block(result.output, Vec::new()),
            StepAction::Fail => StepOutcome::Fail(result.output),
        }
    }

    /// Script executor (spec 4.3.1).
    async fn run_script(&self, step: &StepDef, ctx: &RunContext, task: &Task, worktree: &Path, timeout: Duration, cancel: &CancellationToken) -> Result<(StepResult, StepAction)> {
        let command_template = step.command.as_deref().unwrap_or_default();
        let rendered = render(command_template, &ctx.value(), &NoIncludes, &shell_escape_value)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&rendered).current_dir(worktree).kill_on_drop(true);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;

        let wait = async { child.wait_with_output().await };
        tokio::pin!(wait);

        let output = tokio::select! {
            res = &mut wait => res?,
            () = tokio::time::sleep(timeout) => {
                return Ok((
                    StepResult {
                        step_name: step.name.clone(),
                        success: false,
                        skipped: false,
                        output: "timed out".to_string(),
                        exit_code: None,
                        outputs: None,
                        started_at: Utc::now(),
                        ended_at: Utc::now(),
                        action: StepAction::Fail,
                    },
                    on_fail_action(step, true),
                ));
            }
            () = cancel.cancelled() => {
                return Ok((
                    StepResult {
                        step_name: step.name.clone(),
                        success: false,
                        skipped: false,
                        output: "cancelled".to_string(),
                        exit_code: None,
                        outputs: None,
                        started_at: Utc::now(),
                        ended_at: Utc::now(),
                        action: StepAction::Fail,
                    },
                    StepAction::Fail,
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let success = output.status.success();
        let action = if success { on_success_action(step) } else { on_fail_action(step, false) };

        Ok((
            StepResult {
                step_name: step.name.clone(),
                success,
                skipped: false,
                output: combined,
                exit_code: output.status.code(),
                outputs: None,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                action: StepAction::Continue,
            },
            action,
        ))
    }

    /// Agent executor (spec 4.3.1, 4.6).
    async fn run_agent(&self, step: &StepDef, ctx: &mut RunContext, state: &WorkflowState, task: &Task, worktree: &Path, timeout: Duration, cancel: &CancellationToken) -> Result<(StepResult, StepAction)> {
        let spell_ref = step.spell.as_deref().unwrap_or_default();

        if let Some(input_template) = &step.input {
            let rendered_input = render(input_template, &ctx.value(), &NoIncludes, &|s| s.to_string())?;
            ctx.set_input(rendered_input);
        }

        let prompt = spell::render(&self.workspace_root, spell_ref, &ctx.value())?;

        let step_index = state.current_step.max(0) + 1;
        let step_task_id = runner::step_task_id(task.id.as_ref(), step_index);
        let output_file = self
            .workspace_root
            .join(".coven")
            .join("output")
            .join(format!("{step_task_id}.jsonl"));
        if let Some(parent) = output_file.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let agent = coven_core::AgentRecord {
            task_id: task.id.clone(),
            step_task_id: step_task_id.clone(),
            pid: None,
            worktree: worktree.display().to_string(),
            status: coven_core::AgentStatus::Starting,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            error: None,
            output_file: output_file.display().to_string(),
        };
        self.store.upsert_agent(&agent).await.ok();
        self.broker
            .publish(BrokerEvent::new(
                EventKind::AgentStarted,
                task.id.as_ref(),
                AgentStartedPayload { task_id: task.id.clone(), step_task_id: step_task_id.clone(), pid: None },
            ))
            .await
            .ok();

        let broker = Arc::clone(&self.broker);
        let task_id = task.id.clone();
        let line_step_task_id = step_task_id.clone();
        let output_file_for_lines = output_file.clone();
        let on_line = move |kind: AgentLineKind, line: &str| {
            let broker = Arc::clone(&broker);
            let task_id = task_id.clone();
            let step_task_id = line_step_task_id.clone();
            let line = line.to_string();
            let output_file = output_file_for_lines.clone();
            tokio::spawn(async move {
                append_output_line(&output_file, &line).await.ok();
                broker
                    .publish(BrokerEvent::new(
                        EventKind::AgentOutput,
                        task_id.as_ref(),
                        AgentOutputPayload { task_id, step_task_id, kind: kind.as_str().to_string(), line },
                    ))
                    .await
                    .ok();
            });
        };

        let spawn_result = self
            .agent_runner
            .spawn(SpawnRequest {
                step_task_id: &step_task_id,
                worktree,
                prompt: &prompt,
                timeout,
                cancel: cancel.clone(),
                on_line: &on_line,
            })
            .await;

        let (result, action, agent_status, agent_error) = match spawn_result {
            Ok(outcome) => {
                let action = if outcome.success { StepAction::Continue } else { StepAction::Fail };
                (
                    StepResult {
                        step_name: step.name.clone(),
                        success: outcome.success,
                        skipped: false,
                        output: outcome.summary,
                        exit_code: outcome.exit_code,
                        outputs: outcome.outputs,
                        started_at: Utc::now(),
                        ended_at: Utc::now(),
                        action: StepAction::Continue,
                    },
                    action,
                    coven_core::AgentStatus::Completed,
                    outcome.error,
                )
            }
            Err(AgentRunnerError::Cancelled(_)) => (
                StepResult {
                    step_name: step.name.clone(),
                    success: false,
                    skipped: false,
                    output: "cancelled".to_string(),
                    exit_code: None,
                    outputs: None,
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    action: StepAction::Continue,
                },
                StepAction::Fail,
                coven_core::AgentStatus::Killed,
                Some("cancelled".to_string()),
            ),
            Err(err) => (
                StepResult {
                    step_name: step.name.clone(),
                    success: false,
                    skipped: false,
                    output: err.to_string(),
                    exit_code: None,
                    outputs: None,
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    action: StepAction::Continue,
                },
                on_fail_action(step, true),
                coven_core::AgentStatus::Failed,
                Some(err.to_string()),
            ),
        };

        let mut agent = agent;
        agent.status = agent_status;
        agent.ended_at = Some(Utc::now());
        agent.exit_code = result.exit_code;
        agent.error = agent_error.clone();
        self.store.upsert_agent(&agent).await.ok();

        let event = if result.success {
            BrokerEvent::new(
                EventKind::AgentCompleted,
                task.id.as_ref(),
                AgentCompletedPayload { task_id: task.id.clone(), step_task_id: step_task_id.clone(), exit_code: result.exit_code },
            )
        } else {
            BrokerEvent::new(
                EventKind::AgentFailed,
                task.id.as_ref(),
                AgentFailedPayload {
                    task_id: task.id.clone(),
                    step_task_id: step_task_id.clone(),
                    error: agent_error.unwrap_or_default(),
                },
            )
        };
        self.broker.publish(event).await.ok();

        Ok((result, action))
    }

    /// Loop executor (spec 4.3.1).
    async fn run_loop(&self, step: &StepDef, ctx: &mut RunContext, state: &mut WorkflowState, task: &Task, worktree: &Path, cancel: &CancellationToken) -> StepOutcome {
        let Some(inner_steps) = &step.steps else {
            return StepOutcome::Fail(format!("loop step {:?} has no nested steps", step.name));
        };
        let max_iterations = grimoire::max_iterations(step);

        let resume_iteration = state
            .loop_state
            .as_ref()
            .filter(|ls| ls.step_path == [usize::MAX])
            .map_or(0, |ls| ls.iteration);

        ctx.enter_loop();
        let mut iteration = resume_iteration;

        loop {
            if cancel.is_cancelled() {
                ctx.exit_loop();
                return StepOutcome::Cancelled;
            }
            if iteration >= max_iterations {
                break;
            }

            state.loop_state = Some(LoopState {
                step_path: vec![usize::MAX],
                iteration,
                loop_entry: ctx.loop_entry(),
            });
            self.store.save_workflow(state).await.ok();

            self.broker
                .publish(BrokerEvent::new(
                    EventKind::WorkflowLoopIteration,
                    task.id.as_ref(),
                    WorkflowLoopIterationPayload { workflow_id: state.workflow_id.clone(), step_name: step.name.clone(), iteration },
                ))
                .await
                .ok();

            let outcome = self.execute_list(inner_steps, 0, ctx, state, task, worktree, cancel, false).await;
            match outcome {
                ListOutcome::ExitLoop => {
                    ctx.exit_loop();
                    state.loop_state = None;
                    return StepOutcome::ExitLoop;
                }
                ListOutcome::Block(reason, files) => {
                    ctx.exit_loop();
                    return StepOutcome::Block(reason, files);
                }
                ListOutcome::BlockMergePending(reason, files) => {
                    ctx.exit_loop();
                    return StepOutcome::BlockMergePending(reason, files);
                }
                ListOutcome::Fail(error) => {
                    ctx.exit_loop();
                    return StepOutcome::Fail(error);
                }
                ListOutcome::Cancelled => {
                    ctx.exit_loop();
                    return StepOutcome::Cancelled;
                }
                ListOutcome::Completed => {}
            }

            iteration += 1;
        }

        ctx.exit_loop();
        state.loop_state = None;
        let reason = format!("Max iterations ({max_iterations}) reached for loop {:?}", step.name);
        match grimoire::step_def_on_max_iterations(step) {
            OnMaxIterations::Continue => StepOutcome::Continue,
            OnMaxIterations::Fail => StepOutcome::Fail(reason),
            OnMaxIterations::Block => StepOutcome::Block(reason, Vec::new()),
        }
    }

    /// Merge executor (spec 4.3.1). The actual final merge (on
    /// `approve-merge`) is performed by the scheduler, not here — this only
    /// prepares the review payload and decides whether review is required.
    async fn run_merge(&self, step: &StepDef, worktree: &Path) -> Result<(StepResult, StepAction)> {
        let base_branch = crate::git::detect_default_branch(&self.workspace_root).unwrap_or_else(|_| "main".to_string());
        let preview = crate::git::merge_preview(worktree, &base_branch)?;

        if !preview.conflicts.is_empty() {
            let summary = format!("merge conflicts in: {}", preview.conflicts.join(", "));
            return Ok((
                StepResult {
                    step_name: step.name.clone(),
                    success: false,
                    skipped: false,
                    output: summary,
                    exit_code: None,
                    outputs: Some(serde_json::json!({ "conflicts": preview.conflicts })),
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    action: StepAction::Continue,
                },
                StepAction::Block,
            ));
        }

        if grimoire::require_review(step) {
            let changed: Vec<String> = preview.changed_files.iter().map(|f| f.path.clone()).collect();
            let summary = format!("{} file(s) changed, awaiting review", changed.len());
            return Ok((
                StepResult {
                    step_name: step.name.clone(),
                    success: true,
                    skipped: false,
                    output: summary,
                    exit_code: None,
                    outputs: Some(serde_json::json!({
                        "diff": preview.diff,
                        "changed_files": changed,
                    })),
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    action: StepAction::Continue,
                },
                StepAction::Block,
            ));
        }

        Ok((
            StepResult {
                step_name: step.name.clone(),
                success: true,
                skipped: false,
                output: "merge ready, no review required".to_string(),
                exit_code: None,
                outputs: None,
                started_at: Utc::now(),
                ended_at: Utc::now(),
                action: StepAction::Continue,
            },
            StepAction::Continue,
        ))
    }
}

fn on_fail_action(step: &StepDef, _timed_out: bool) -> StepAction {
    match step.on_fail.unwrap_or(OnFail::Fail) {
        OnFail::Fail => StepAction::Fail,
        OnFail::Continue => StepAction::Continue,
        OnFail::Block => StepAction::Block,
    }
}

fn on_success_action(step: &StepDef) -> StepAction {
    match step.on_success.unwrap_or(OnSuccess::Continue) {
        OnSuccess::Continue => StepAction::Continue,
        OnSuccess::ExitLoop => StepAction::ExitLoop,
    }
}

/// Shell-escape a rendered path value by default (spec 4.3 step 2: "`raw`
/// permits unescaped interpolation explicitly" — everything else goes
/// through here). Testable property 6: `bead.id = "x; rm -rf /"` renders
/// as a single quoted argument.
fn shell_escape_value(s: &str) -> String {
    shell_escape::escape(std::borrow::Cow::Borrowed(s)).into_owned()
}

async fn append_output_line(path: &Path, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// The live workflow context (spec 4.3, 4.4): `bead`, `previous`,
/// `loop_entry`, and a flat map of step/binding names to their rendered
/// JSON outputs.
struct RunContext {
    bead: Value,
    previous: Value,
    loop_entry_stack: Vec<Value>,
    input: Value,
    bindings: serde_json::Map<String, Value>,
}

impl RunContext {
    fn restore(task: &Task, state: &WorkflowState) -> Self {
        let mut bindings = serde_json::Map::new();
        for (name, value) in &state.step_outputs {
            bindings.insert(name.clone(), value.clone());
        }
        let previous = state
            .completed_steps
            .values()
            .max_by_key(|r| r.ended_at)
            .map(step_result_to_value)
            .unwrap_or(Value::Null);
        let loop_entry_stack = state
            .loop_state
            .as_ref()
            .and_then(|ls| ls.loop_entry.clone())
            .map(|v| vec![v])
            .unwrap_or_default();
        Self {
            bead: serde_json::to_value(task).unwrap_or(Value::Null),
            previous,
            loop_entry_stack,
            input: Value::Null,
            bindings,
        }
    }

    fn value(&self) -> Value {
        let mut map = self.bindings.clone();
        map.insert("bead".to_string(), self.bead.clone());
        map.insert("previous".to_string(), self.previous.clone());
        map.insert("loop_entry".to_string(), self.loop_entry_stack.last().cloned().unwrap_or(Value::Null));
        map.insert("input".to_string(), self.input.clone());
        Value::Object(map)
    }

    fn set_input(&mut self, rendered: String) {
        self.input = Value::String(rendered);
    }

    fn bind(&mut self, step: &StepDef, result: &StepResult) {
        let value = step_result_to_value(result);
        self.previous = value.clone();
        self.bindings.insert(step.name.clone(), value.clone());
        if let Some(binding) = &step.output {
            self.bindings.insert(binding.clone(), value);
        }
    }

    fn lookup_binding(&self, name: &str) -> Value {
        self.bindings.get(name).cloned().unwrap_or(Value::Null)
    }

    fn enter_loop(&mut self) {
        self.loop_entry_stack.push(self.previous.clone());
    }

    fn exit_loop(&mut self) {
        self.loop_entry_stack.pop();
    }

    fn loop_entry(&self) -> Option<Value> {
        self.loop_entry_stack.last().cloned()
    }
}

/// The binding value exposed for a completed step (spec 4.4: `success`,
/// `failed`, `output`, `exit_code`, `status`, `outputs.*`).
fn step_result_to_value(result: &StepResult) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("success".to_string(), Value::Bool(result.success));
    obj.insert("failed".to_string(), Value::Bool(!result.success));
    obj.insert("output".to_string(), Value::String(result.output.clone()));
    obj.insert(
        "exit_code".to_string(),
        result.exit_code.map(Value::from).unwrap_or(Value::Null),
    );
    let status = if result.skipped { "skipped" } else if result.success { "success" } else { "failed" };
    obj.insert("status".to_string(), Value::String(status.to_string()));
    if let Some(outputs) = &result.outputs {
        obj.insert("outputs".to_string(), outputs.clone());
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EventBroker;
    use crate::runner::ProcessAgentRunner;
    use crate::store::Store;
    use chrono::Utc as ChronoUtc;
    use coven_core::{Id, TaskStatus};
    use std::collections::{BTreeMap, BTreeSet};
    use std::process::Command as StdCommand;

    async fn new_store() -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::new(&dir.path().join("coven.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        (Arc::new(store), dir)
    }

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            StdCommand::new("git").args(args).current_dir(dir).output().unwrap();
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "t@t.com"]);
        run(&["config", "user.name", "T"]);
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
    }

    fn task(id: Id) -> Task {
        let now = ChronoUtc::now();
        Task {
            id,
            parent_id: None,
            depth: 0,
            title: "Add login".into(),
            body: String::new(),
            task_type: "feature".into(),
            status: TaskStatus::InProgress,
            priority: 2,
            tags: BTreeSet::new(),
            grimoire_hint: None,
            claimed_by: Some("agent-1".into()),
            claimed_at: Some(now),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn fresh_state(task_id: Id, grimoire_name: &str, worktree: &Path) -> WorkflowState {
        WorkflowState {
            workflow_id: Id::new(),
            task_id,
            grimoire_name: grimoire_name.to_string(),
            worktree_path: worktree.display().to_string(),
            status: WorkflowStatus::Running,
            current_step: -1,
            completed_steps: BTreeMap::new(),
            step_outputs: BTreeMap::new(),
            loop_state: None,
            started_at: ChronoUtc::now(),
            updated_at: ChronoUtc::now(),
            error: None,
            blocked_reason: None,
        }
    }

    #[tokio::test]
    async fn e1_happy_path_completes_and_closes_task() {
        let (store, _store_dir) = new_store().await;
        let repo_dir = tempfile::TempDir::new().unwrap();
        init_repo(repo_dir.path());

        let broker = Arc::new(EventBroker::new(Arc::clone(&store)));
        let agent_runner: Arc<dyn AgentRunner> = Arc::new(ProcessAgentRunner::new(
            "sh",
            vec!["-c".to_string()],
        ));
        let engine = Engine::new(Arc::clone(&store), Arc::clone(&broker), agent_runner, repo_dir.path().to_path_buf());

        let t = task(Id::new());
        store.create_task(&t).await.unwrap();

        let grimoire_yaml = "steps:\n\
            - name: implement\n  type: agent\n  spell: \"say {\\\"success\\\": true, \\\"summary\\\": \\\"done\\\"}\"\n  output: implement\n\
            - name: quality\n  type: script\n  command: \"exit 0\"\n  on_success: exit_loop\n\
            - name: merge\n  type: merge\n  require_review: false\n";
        let grimoire = coven_core::grimoire::parse(grimoire_yaml, "e1").unwrap();

        let agent_runner2: Arc<dyn AgentRunner> = Arc::new(ShellEchoRunner);
        let engine = Engine::new(store.clone(), broker, agent_runner2, repo_dir.path().to_path_buf());

        let state = fresh_state(t.id.clone(), "e1", repo_dir.path());
        engine.start(t.clone(), state, grimoire, repo_dir.path().to_path_buf()).await.unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !engine.is_running(&t.id).await {
                break;
            }
        }

        let updated = store.get_task(&t.id).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Closed);
    }

    /// A minimal [`AgentRunner`] that always reports success without
    /// shelling out, so agent-step tests don't depend on an external agent
    /// binary being installed.
    struct ShellEchoRunner;

    impl AgentRunner for ShellEchoRunner {
        fn spawn<'a>(&'a self, request: SpawnRequest<'a>) -> BoxFuture<'a, runner::Result<runner::AgentOutcome>> {
            Box::pin(async move {
                (request.on_line)(AgentLineKind::Text, "working");
                Ok(runner::AgentOutcome {
                    success: true,
                    summary: "done".to_string(),
                    outputs: None,
                    error: None,
                    exit_code: Some(0),
                })
            })
        }

        fn kill<'a>(&'a self, _step_task_id: &'a str) -> BoxFuture<'a, runner::Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn is_running<'a>(&'a self, _step_task_id: &'a str) -> BoxFuture<'a, bool> {
            Box::pin(async { false })
        }
    }

    #[tokio::test]
    async fn e2_quality_loop_exhausts_and_blocks() {
        let (store, _dir) = new_store().await;
        let repo_dir = tempfile::TempDir::new().unwrap();
        init_repo(repo_dir.path());

        let broker = Arc::new(EventBroker::new(Arc::clone(&store)));
        let agent_runner: Arc<dyn AgentRunner> = Arc::new(ShellEchoRunner);
        let engine = Engine::new(Arc::clone(&store), broker, agent_runner, repo_dir.path().to_path_buf());

        let t = task(Id::new());
        store.create_task(&t).await.unwrap();

        let grimoire = coven_core::grimoire::load(repo_dir.path(), "quality-loop").unwrap();
        let mut custom = grimoire.clone();
        if let Some(StepDef { max_iterations, .. }) = custom.steps.iter_mut().find(|s| s.step_type == StepType::Loop) {
            *max_iterations = Some(3);
        }

        let state = fresh_state(t.id.clone(), "quality-loop", repo_dir.path());
        engine.start(t.clone(), state, custom, repo_dir.path().to_path_buf()).await.unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !engine.is_running(&t.id).await {
                break;
            }
        }

        let updated = store.get_task(&t.id).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Blocked);
        let workflow = store.load_workflow(&t.id).await.unwrap();
        assert!(workflow.blocked_reason.unwrap().contains("Max iterations (3) reached"));
    }

    #[tokio::test]
    async fn e3_merge_conflict_blocks_rather_than_pending_merge() {
        let (store, _dir) = new_store().await;
        let repo_dir = tempfile::TempDir::new().unwrap();
        init_repo(repo_dir.path());

        let run = |args: &[&str]| {
            StdCommand::new("git").args(args).current_dir(repo_dir.path()).output().unwrap();
        };
        run(&["checkout", "-b", "task-branch"]);
        std::fs::write(repo_dir.path().join("README.md"), "task change").unwrap();
        run(&["commit", "-am", "task change"]);
        run(&["checkout", "main"]);
        std::fs::write(repo_dir.path().join("README.md"), "main change").unwrap();
        run(&["commit", "-am", "main change"]);
        run(&["checkout", "task-branch"]);

        let broker = Arc::new(EventBroker::new(Arc::clone(&store)));
        let mut events = broker.subscribe();
        let agent_runner: Arc<dyn AgentRunner> = Arc::new(ShellEchoRunner);
        let engine = Engine::new(Arc::clone(&store), Arc::clone(&broker), agent_runner, repo_dir.path().to_path_buf());

        let t = task(Id::new());
        store.create_task(&t).await.unwrap();

        let grimoire_yaml = "steps:\n  - name: merge\n    type: merge\n    require_review: false\n";
        let grimoire = coven_core::grimoire::parse(grimoire_yaml, "e3").unwrap();

        let state = fresh_state(t.id.clone(), "e3", repo_dir.path());
        engine.start(t.clone(), state, grimoire, repo_dir.path().to_path_buf()).await.unwrap();

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !engine.is_running(&t.id).await {
                break;
            }
        }

        let updated = store.get_task(&t.id).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Blocked);
        let workflow = store.load_workflow(&t.id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Blocked);
        assert!(workflow.blocked_reason.unwrap().contains("merge conflicts"));

        let mut saw_conflict_files = false;
        while let Ok(event) = events.try_recv() {
            if event.kind == EventKind::WorkflowBlocked {
                let payload: WorkflowBlockedPayload = serde_json::from_value(event.payload).unwrap();
                if !payload.conflict_files.is_empty() {
                    saw_conflict_files = true;
                }
            }
        }
        assert!(saw_conflict_files, "expected WorkflowBlocked to carry the conflicting file list");
    }

    #[test]
    fn step_result_to_value_exposes_outputs() {
        let result = StepResult {
            step_name: "s".into(),
            success: true,
            skipped: false,
            output: "ok".into(),
            exit_code: Some(0),
            outputs: Some(serde_json::json!({"k": "v"})),
            started_at: ChronoUtc::now(),
            ended_at: ChronoUtc::now(),
            action: StepAction::Continue,
        };
        let value = step_result_to_value(&result);
        assert_eq!(value["outputs"]["k"], "v");
        assert_eq!(value["status"], "success");
    }

    #[test]
    fn shell_escape_value_quotes_dangerous_input() {
        let escaped = shell_escape_value("x; rm -rf /");
        assert!(escaped.starts_with('\''));
        assert!(escaped.contains("rm -rf /"));
    }
}
