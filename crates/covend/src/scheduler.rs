//! Scheduler (spec Section 4.5).
//!
//! Owns the reconciliation loop that picks up ready tasks, resolves their
//! grimoire, claims them, creates their worktree, and hands the workflow
//! off to the [`Engine`]; the periodic stale-claim and retention sweeps;
//! and the user-triggered actions the HTTP boundary exposes
//! (`cancel`/`retry`/`approve-merge`/`reject-merge`).
//!
//! Concurrency is gated by counting workflows the store reports as
//! `running` or `pending_merge` rather than a `Semaphore` permit held
//! across the engine's spawned driver task: the engine, not the scheduler,
//! owns a workflow's lifetime once started (spec Section 4.3), so there is
//! no single call frame in which to hold a permit for "the duration of the
//! workflow." Re-deriving the active count from persisted `WorkflowState`
//! on every tick keeps the invariant in spec Section 5 ("at most
//! `max_concurrency` workflows in running or pending_merge+active state")
//! anchored to the same durable state the rest of the daemon trusts,
//! instead of a second, driftable counter.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use coven_core::events::TasksUpdatedPayload;
use coven_core::{
    grimoire, BrokerEvent, Config, EventKind, GrimoireError, Id, Task, TaskStatus, WorkflowState,
    WorkflowStatus,
};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::EventBroker;
use crate::engine::{Engine, EngineError};
use crate::git::{self, GitError};
use crate::matcher::{MatcherError, MatcherPipeline, Resolution};
use crate::store::{Store, StoreError, TaskPatch};
use crate::worktree;

/// `claimed_by` recorded by the scheduler itself, distinct from any agent
/// or user id, so `history` entries and `AlreadyClaimed` errors read
/// clearly in the audit trail.
pub const SCHEDULER_AGENT_ID: &str = "system:scheduler";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error(transparent)]
    Grimoire(#[from] GrimoireError),
    #[error("task {0} has no pending_merge workflow to act on")]
    NotPendingMerge(String),
    #[error("task {0} is not blocked or failed and cannot be retried")]
    NotRetryable(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

pub struct Scheduler {
    store: Arc<Store>,
    broker: Arc<EventBroker>,
    engine: Arc<Engine>,
    workspace_root: PathBuf,
    config: Config,
    base_branch: String,
    /// Serializes "pick a candidate, transactionally claim it" across
    /// concurrent reconciliation ticks and API-triggered actions (e.g. a
    /// manual `retry` racing the background tick) — spec Section 4.5.
    claim_lock: AsyncMutex<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        broker: Arc<EventBroker>,
        engine: Arc<Engine>,
        workspace_root: PathBuf,
        config: Config,
    ) -> Arc<Self> {
        let base_branch =
            git::detect_default_branch(&workspace_root).unwrap_or_else(|_| "main".to_string());
        Arc::new(Self {
            store,
            broker,
            engine,
            workspace_root,
            config,
            base_branch,
            claim_lock: AsyncMutex::new(()),
        })
    }

    /// Runs the reconciliation loop, stale-claim sweep, and retention sweep
    /// as three independently-ticking timers until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut reconcile_ticker = tokio::time::interval(self.config.reconciliation_interval);
        let mut stale_ticker = tokio::time::interval(self.config.stale_claim_sweep_interval);
        // Retention has no dedicated spec constant; a coarse hourly sweep is
        // frequent enough for day-granularity retention windows.
        let mut retention_ticker = tokio::time::interval(std::time::Duration::from_secs(3600));

        loop {
            tokio::select! {
                _ = reconcile_ticker.tick() => {
                    if let Err(err) = self.reconcile_once().await {
                        warn!(%err, "reconciliation tick failed");
                    }
                }
                _ = stale_ticker.tick() => {
                    if let Err(err) = self.sweep_stale_claims().await {
                        warn!(%err, "stale-claim sweep failed");
                    }
                }
                _ = retention_ticker.tick() => {
                    if let Err(err) = self.sweep_retention().await {
                        warn!(%err, "retention sweep failed");
                    }
                }
                () = cancel.cancelled() => {
                    info!("scheduler loop stopped");
                    return;
                }
            }
        }
    }

    /// One reconciliation tick (spec Section 4.5, steps 1-2): list ready
    /// tasks ordered `(priority asc, created_at asc)`, and up to the free
    /// slot count, resolve + claim + start each.
    pub async fn reconcile_once(&self) -> Result<()> {
        let free_slots = self.free_slots().await?;
        if free_slots == 0 {
            return Ok(());
        }

        let matcher = MatcherPipeline::load(&self.workspace_root)?;
        let _lock = self.claim_lock.lock().await;

        let candidates = self.store.list_ready_tasks().await?;
        let mut started = 0usize;
        for task in candidates {
            if started >= free_slots {
                break;
            }
            if self.try_start(&task, &matcher).await? {
                started += 1;
            }
        }
        Ok(())
    }

    async fn free_slots(&self) -> Result<usize> {
        let workflows = self.store.list_workflows().await?;
        let active = workflows
            .iter()
            .filter(|w| matches!(w.status, WorkflowStatus::Running | WorkflowStatus::PendingMerge))
            .count();
        Ok(self.config.max_concurrency.saturating_sub(active))
    }

    /// Resolve `task`'s grimoire, claim it, create its worktree, and hand
    /// off to the engine. Returns `Ok(false)` (not an error) when another
    /// claimant won the race or the task's grimoire reference is invalid —
    /// either way this candidate is simply skipped this tick.
    async fn try_start(&self, task: &Task, matcher: &MatcherPipeline) -> Result<bool> {
        let grimoire_name = self.resolve_grimoire_name(task, matcher).await?;
        let loaded = match grimoire::load(&self.workspace_root, &grimoire_name) {
            Ok(g) => g,
            Err(err) => {
                warn!(task_id = %task.id, grimoire = %grimoire_name, %err, "grimoire failed to load, blocking task");
                self.store
                    .patch_task(&task.id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
                    .await?;
                return Ok(false);
            }
        };

        let claimed = match self.store.claim(&task.id, SCHEDULER_AGENT_ID).await {
            Ok(t) => t,
            Err(StoreError::AlreadyClaimed { .. } | StoreError::InvalidStatus(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let worktree_path = match worktree::create(&self.workspace_root, task.id.as_ref(), &self.base_branch) {
            Ok(p) => p,
            Err(err) => {
                warn!(task_id = %task.id, %err, "worktree creation failed, rolling back claim");
                // spec 4.5.2.c: roll back the claim and mark the task blocked.
                self.store.release(&task.id).await?;
                self.store
                    .patch_task(&task.id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
                    .await?;
                return Ok(false);
            }
        };

        let now = Utc::now();
        let state = WorkflowState {
            workflow_id: Id::new(),
            task_id: claimed.id.clone(),
            grimoire_name,
            worktree_path: worktree_path.display().to_string(),
            status: WorkflowStatus::Running,
            current_step: -1,
            completed_steps: std::collections::BTreeMap::new(),
            step_outputs: std::collections::BTreeMap::new(),
            loop_state: None,
            started_at: now,
            updated_at: now,
            error: None,
            blocked_reason: None,
        };
        self.store.save_workflow(&state).await?;

        self.broker
            .publish(BrokerEvent::new(
                EventKind::TasksUpdated,
                claimed.id.as_ref(),
                TasksUpdatedPayload { task_ids: vec![claimed.id.clone()] },
            ))
            .await
            .ok();

        self.engine.start(claimed, state, loaded, worktree_path).await?;
        Ok(true)
    }

    /// Resolve a task's grimoire: an explicit `grimoire_hint` wins outright;
    /// otherwise the matcher pipeline runs, walking up to the parent on an
    /// `inherit: true` entry (spec Section 4.5 matcher pipeline).
    fn resolve_grimoire_name<'a>(
        &'a self,
        task: &'a Task,
        matcher: &'a MatcherPipeline,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if let Some(hint) = &task.grimoire_hint {
                return Ok(hint.clone());
            }
            match matcher.resolve_or_default(task) {
                Resolution::Grimoire(name) => Ok(name),
                Resolution::InheritFromParent => match &task.parent_id {
                    Some(parent_id) => {
                        let parent = self.store.get_task(parent_id).await?;
                        self.resolve_grimoire_name(&parent, matcher).await
                    }
                    None => Ok("default".to_string()),
                },
            }
        })
    }

    /// Stale-claim recovery (spec Section 4.1, E5): runs on its own timer
    /// in addition to the startup sweep the daemon performs before the
    /// scheduler loop starts.
    pub async fn sweep_stale_claims(&self) -> Result<()> {
        let released = self.store.release_stale_claims(self.config.claim_timeout).await?;
        if !released.is_empty() {
            info!(count = released.len(), "released stale claims");
            self.broker
                .publish(BrokerEvent::new(
                    EventKind::TasksUpdated,
                    "scheduler",
                    TasksUpdatedPayload { task_ids: released },
                ))
                .await
                .ok();
        }
        Ok(())
    }

    /// Retention sweeps (spec Section 4.1): soft-delete closed tasks past
    /// `soft_delete_days`, hard-delete soft-deleted tasks past
    /// `retention_days`, and trim the event log past `event_retention`.
    pub async fn sweep_retention(&self) -> Result<()> {
        let soft = self.store.soft_delete_closed_before(self.config.soft_delete_days).await?;
        let hard = self.store.hard_delete_soft_deleted_before(self.config.retention_days).await?;
        let trimmed = self.broker.trim_retained(self.config.event_retention).await?;
        if soft + hard + trimmed > 0 {
            info!(soft, hard, trimmed, "retention sweep complete");
        }
        Ok(())
    }

    /// `POST /workflows/{id}/cancel` (spec Section 4.5 "Cancellation
    /// semantics"). The actual kill/settle/task-reopen happens inside the
    /// engine's driver task; this only fires the cancellation token.
    pub async fn cancel(&self, task_id: &Id) -> Result<()> {
        Ok(self.engine.cancel(task_id).await?)
    }

    /// `POST /workflows/{id}/retry` (spec Section 7: "manual retry action,
    /// user, via API"). Only `blocked` or `failed` workflows are retryable;
    /// retrying re-enters the engine driver from `current_step + 1` exactly
    /// like a crash-resume (spec Section 4.3 Resume), after re-opening the
    /// task so the claim invariant holds while the workflow re-runs.
    pub async fn retry(&self, task_id: &Id) -> Result<()> {
        let state = self.store.load_workflow(task_id).await?;
        if !matches!(state.status, WorkflowStatus::Blocked | WorkflowStatus::Failed) {
            return Err(SchedulerError::NotRetryable(task_id.to_string()));
        }

        let _lock = self.claim_lock.lock().await;
        let task = match self.store.claim(task_id, SCHEDULER_AGENT_ID).await {
            Ok(t) => t,
            Err(StoreError::AlreadyClaimed { .. }) => self.store.get_task(task_id).await?,
            Err(err) => return Err(err.into()),
        };

        let mut resumed_state = state;
        resumed_state.status = WorkflowStatus::Running;
        resumed_state.error = None;
        resumed_state.blocked_reason = None;
        resumed_state.updated_at = Utc::now();
        self.store.save_workflow(&resumed_state).await?;

        self.engine.resume(task, resumed_state).await?;
        Ok(())
    }

    /// `POST /workflows/{id}/approve-merge` (spec Section 4.3.1, last
    /// paragraph: "the merge action... is performed by the scheduler, not
    /// the executor"). Checks out the base branch, fast-forwards, and
    /// `merge --no-ff`s the worktree branch; conflicts abort the merge and
    /// leave the task `blocked` with the conflict list. On success the task
    /// closes and its worktree is removed.
    pub async fn approve_merge(&self, task_id: &Id) -> Result<()> {
        let mut state = self.store.load_workflow(task_id).await?;
        if state.status != WorkflowStatus::PendingMerge {
            return Err(SchedulerError::NotPendingMerge(task_id.to_string()));
        }

        match git::merge_no_ff(&self.workspace_root, task_id.as_ref(), &self.base_branch) {
            Ok(()) => {
                state.status = WorkflowStatus::Completed;
                state.updated_at = Utc::now();
                self.store.save_workflow(&state).await?;
                self.store
                    .patch_task(task_id, &TaskPatch { status: Some(TaskStatus::Closed), ..Default::default() })
                    .await?;
                worktree::destroy(&self.workspace_root, task_id.as_ref());
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowCompleted,
                        task_id.as_ref(),
                        coven_core::events::WorkflowCompletedPayload {
                            workflow_id: state.workflow_id.clone(),
                            task_id: task_id.clone(),
                        },
                    ))
                    .await
                    .ok();
                Ok(())
            }
            Err(GitError::MergeConflict(conflicts)) => {
                let reason = format!("merge conflicts in: {}", conflicts.join(", "));
                state.status = WorkflowStatus::Blocked;
                state.blocked_reason = Some(reason.clone());
                state.updated_at = Utc::now();
                self.store.save_workflow(&state).await?;
                self.store
                    .patch_task(task_id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
                    .await?;
                self.broker
                    .publish(BrokerEvent::new(
                        EventKind::WorkflowBlocked,
                        task_id.as_ref(),
                        coven_core::events::WorkflowBlockedPayload {
                            workflow_id: state.workflow_id.clone(),
                            task_id: task_id.clone(),
                            reason,
                            conflict_files: conflicts,
                        },
                    ))
                    .await
                    .ok();
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `POST /workflows/{id}/reject-merge`: the reviewer declined the diff.
    /// The workflow stays `blocked` (not re-queued automatically — spec
    /// Section 7: "nothing retries agent failures automatically") with the
    /// rejection recorded as the blocked reason; a human can `retry` after
    /// addressing feedback.
    pub async fn reject_merge(&self, task_id: &Id) -> Result<()> {
        let mut state = self.store.load_workflow(task_id).await?;
        if state.status != WorkflowStatus::PendingMerge {
            return Err(SchedulerError::NotPendingMerge(task_id.to_string()));
        }
        state.status = WorkflowStatus::Blocked;
        state.blocked_reason = Some("merge rejected by reviewer".to_string());
        state.updated_at = Utc::now();
        self.store.save_workflow(&state).await?;
        self.store
            .patch_task(task_id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
            .await?;
        self.broker
            .publish(BrokerEvent::new(
                EventKind::WorkflowBlocked,
                task_id.as_ref(),
                coven_core::events::WorkflowBlockedPayload {
                    workflow_id: state.workflow_id.clone(),
                    task_id: task_id.clone(),
                    reason: "merge rejected by reviewer".to_string(),
                    conflict_files: Vec::new(),
                },
            ))
            .await
            .ok();
        Ok(())
    }

    /// The actions a workflow's current status makes available, surfaced by
    /// `GET /workflows/{id}` (spec Section 6).
    pub fn available_actions(status: WorkflowStatus) -> &'static [&'static str] {
        match status {
            WorkflowStatus::Running => &["cancel"],
            WorkflowStatus::Blocked | WorkflowStatus::Failed => &["retry", "cancel"],
            WorkflowStatus::PendingMerge => &["approve-merge", "reject-merge", "cancel"],
            WorkflowStatus::Completed | WorkflowStatus::Cancelled => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{AgentRunner, AgentRunnerError, AgentOutcome, SpawnRequest};
    use std::collections::BTreeSet;
    use std::process::Command;
    use tempfile::TempDir;

    struct StubRunner;
    impl AgentRunner for StubRunner {
        fn spawn<'a>(&'a self, _req: SpawnRequest<'a>) -> BoxFuture<'a, std::result::Result<AgentOutcome, AgentRunnerError>> {
            Box::pin(async {
                Ok(AgentOutcome { success: true, summary: "ok".into(), outputs: None, error: None, exit_code: Some(0) })
            })
        }
        fn kill<'a>(&'a self, _step_task_id: &'a str) -> BoxFuture<'a, std::result::Result<(), AgentRunnerError>> {
            Box::pin(async { Ok(()) })
        }
        fn is_running<'a>(&'a self, _step_task_id: &'a str) -> BoxFuture<'a, bool> {
            Box::pin(async { false })
        }
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            Command::new("git").args(args).current_dir(dir.path()).output().unwrap();
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# test").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
        dir
    }

    async fn build_scheduler(dir: &TempDir) -> Arc<Scheduler> {
        let store = Arc::new(Store::new(&dir.path().join(".coven").join("coven.db")).await.unwrap());
        std::fs::create_dir_all(dir.path().join(".coven")).unwrap();
        store.migrate_embedded().await.unwrap();
        let broker = Arc::new(EventBroker::new(Arc::clone(&store)));
        let engine = Engine::new(Arc::clone(&store), Arc::clone(&broker), Arc::new(StubRunner), dir.path().to_path_buf());
        Scheduler::new(store, broker, engine, dir.path().to_path_buf(), Config::default())
    }

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: Id::new(),
            parent_id: None,
            depth: 0,
            title: "t".into(),
            body: String::new(),
            task_type: "feature".into(),
            status: TaskStatus::Open,
            priority: 2,
            tags: BTreeSet::new(),
            grimoire_hint: Some("default".to_string()),
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn reconcile_claims_and_starts_a_ready_task() {
        let dir = init_repo();
        let scheduler = build_scheduler(&dir).await;
        let task = sample_task();
        scheduler.store.create_task(&task).await.unwrap();

        scheduler.reconcile_once().await.unwrap();

        let reloaded = scheduler.store.get_task(&task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::InProgress);
        assert!(scheduler.store.load_workflow(&task.id).await.is_ok());
    }

    #[tokio::test]
    async fn free_slots_respects_max_concurrency() {
        let dir = init_repo();
        let scheduler = build_scheduler(&dir).await;
        assert_eq!(scheduler.free_slots().await.unwrap(), scheduler.config.max_concurrency);
    }

    #[tokio::test]
    async fn available_actions_match_workflow_status() {
        assert_eq!(Scheduler::available_actions(WorkflowStatus::Running), &["cancel"]);
        assert_eq!(Scheduler::available_actions(WorkflowStatus::PendingMerge), &["approve-merge", "reject-merge", "cancel"]);
        assert!(Scheduler::available_actions(WorkflowStatus::Completed).is_empty());
    }
}
