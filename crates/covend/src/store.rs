//! SQLite-backed unified store (spec Section 4.1).
//!
//! One embedded database file backs tasks, agents, workflows, questions,
//! events, and history. Writes that touch more than one table (claim,
//! reparent, delete-with-cascade) run inside a single `sqlx` transaction so
//! they are atomic even though SQLite is the only writer.

use chrono::{DateTime, Utc};
use coven_core::types::{
    AgentRecord, AgentStatus, EventRecord, HistoryEntry, LoopState, Question, StepResult, Task,
    TaskStatus, WorkflowState, WorkflowStatus,
};
use coven_core::Id;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("workflow not found for task: {0}")]
    WorkflowNotFound(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("question not found: {0}")]
    QuestionNotFound(String),
    #[error("task {task} is already claimed by {claimed_by}")]
    AlreadyClaimed { task: String, claimed_by: String },
    #[error("task {0} is not open")]
    InvalidStatus(String),
    #[error("reparenting {child} under {new_parent} would create a cycle")]
    WouldCreateCycle { child: String, new_parent: String },
    #[error("database file is corrupt: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const TASK_COLUMNS: &str = "id, parent_id, depth, title, body, task_type, status, priority, \
    grimoire_hint, claimed_by, claimed_at, created_at, updated_at, deleted_at";

/// Fields accepted by [`Store::patch_task`]; absent fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<u8>,
    pub grimoire_hint: Option<Option<String>>,
}

pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&db_url).await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        let rows: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check").fetch_all(&pool).await?;
        if rows.len() != 1 || rows[0].0 != "ok" {
            let detail = rows.into_iter().map(|(line,)| line).collect::<Vec<_>>().join("; ");
            return Err(StoreError::Corruption(detail));
        }

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations. Tolerates replay (duplicate
    /// column / table-exists) so startup is idempotent across restarts.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Tasks ---

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ))
        .bind(task.id.as_ref())
        .bind(task.parent_id.as_ref().map(|p| p.as_ref()))
        .bind(task.depth)
        .bind(&task.title)
        .bind(&task.body)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(&task.grimoire_hint)
        .bind(&task.claimed_by)
        .bind(task.claimed_at.map(|t| t.timestamp_millis()))
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.deleted_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await?;

        for tag in &task.tags {
            sqlx::query("INSERT INTO task_tags (task_id, tag) VALUES (?1, ?2)")
                .bind(task.id.as_ref())
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;

        let tags = self.tags_for(id).await?;
        Ok(row.into_task(tags))
    }

    async fn tags_for(&self, id: &Id) -> Result<BTreeSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT tag FROM task_tags WHERE task_id = ?1")
            .bind(id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    pub async fn list_children(&self, parent_id: &Id) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY created_at ASC"
        ))
        .bind(parent_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let tags = self.tags_for(&Id::from_string(row.id.clone())).await?;
            tasks.push(row.into_task(tags));
        }
        Ok(tasks)
    }

    /// Tasks that are `open` and whose parent (if any) is already `closed`,
    /// ordered `(priority asc, created_at asc)` per spec Section 4.5.
    pub async fn list_ready_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             WHERE t.status = 'open' AND t.deleted_at IS NULL \
             AND (t.parent_id IS NULL OR EXISTS ( \
                 SELECT 1 FROM tasks p WHERE p.id = t.parent_id AND p.status = 'closed' \
             )) \
             ORDER BY t.priority ASC, t.created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let tags = self.tags_for(&Id::from_string(row.id.clone())).await?;
            tasks.push(row.into_task(tags));
        }
        Ok(tasks)
    }

    /// All non-deleted tasks, ordered `(priority asc, created_at asc)`.
    /// Backs `GET /tasks` and the `state.snapshot` broker event; unlike
    /// [`Self::list_ready_tasks`] this has no status or ancestor filter.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL ORDER BY priority ASC, created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let tags = self.tags_for(&Id::from_string(row.id.clone())).await?;
            tasks.push(row.into_task(tags));
        }
        Ok(tasks)
    }

    pub async fn patch_task(&self, id: &Id, patch: &TaskPatch) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        if let Some(v) = &patch.title {
            task.title = v.clone();
        }
        if let Some(v) = &patch.body {
            task.body = v.clone();
        }
        if let Some(v) = &patch.task_type {
            task.task_type = v.clone();
        }
        if let Some(v) = patch.status {
            task.status = v;
        }
        if let Some(v) = patch.priority {
            task.priority = v;
        }
        if let Some(v) = patch.grimoire_hint.clone() {
            task.grimoire_hint = v;
        }
        task.updated_at = Utc::now();

        let result = sqlx::query(
            "UPDATE tasks SET title = ?1, body = ?2, task_type = ?3, status = ?4, priority = ?5, \
             grimoire_hint = ?6, updated_at = ?7 WHERE id = ?8",
        )
        .bind(&task.title)
        .bind(&task.body)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(&task.grimoire_hint)
        .bind(task.updated_at.timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(task)
    }

    pub async fn add_tags(&self, id: &Id, tags: &[String]) -> Result<()> {
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO task_tags (task_id, tag) VALUES (?1, ?2)")
                .bind(id.as_ref())
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_tags(&self, id: &Id, tags: &[String]) -> Result<()> {
        for tag in tags {
            sqlx::query("DELETE FROM task_tags WHERE task_id = ?1 AND tag = ?2")
                .bind(id.as_ref())
                .bind(tag)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete a task and cascade over its subtree (spec Section 4.1).
    pub async fn delete_task(&self, id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut stack = vec![id.to_string()];
        let mut subtree = Vec::new();
        while let Some(current) = stack.pop() {
            subtree.push(current.clone());
            let children: Vec<(String,)> =
                sqlx::query_as("SELECT id FROM tasks WHERE parent_id = ?1")
                    .bind(&current)
                    .fetch_all(&mut *tx)
                    .await?;
            stack.extend(children.into_iter().map(|(id,)| id));
        }

        for task_id in &subtree {
            sqlx::query("DELETE FROM task_tags WHERE task_id = ?1").bind(task_id).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM agents WHERE task_id = ?1").bind(task_id).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM workflows WHERE task_id = ?1").bind(task_id).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM questions WHERE task_id = ?1").bind(task_id).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM history WHERE task_id = ?1").bind(task_id).execute(&mut *tx).await?;
            sqlx::query("DELETE FROM tasks WHERE id = ?1").bind(task_id).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Atomically claim an open, unclaimed task. Re-claiming by the same
    /// agent is idempotent (spec Section 4.1).
    pub async fn claim(&self, id: &Id, agent_id: &str) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id.as_ref())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;

        if row.status == "in_progress" {
            if row.claimed_by.as_deref() == Some(agent_id) {
                tx.commit().await?;
                let tags = self.tags_for(id).await?;
                return Ok(row.into_task(tags));
            }
            return Err(StoreError::AlreadyClaimed {
                task: id.to_string(),
                claimed_by: row.claimed_by.unwrap_or_default(),
            });
        }
        if row.status != "open" {
            return Err(StoreError::InvalidStatus(id.to_string()));
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET status = 'in_progress', claimed_by = ?1, claimed_at = ?2, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(agent_id)
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        insert_history(&mut tx, id, "system", "status", Some(&row.status), Some("in_progress"), now).await?;
        insert_history(&mut tx, id, "system", "claimed_by", row.claimed_by.as_deref(), Some(agent_id), now)
            .await?;

        tx.commit().await?;
        self.get_task(id).await
    }

    /// Explicitly release a task's claim, reverting it to `open` and
    /// clearing `claimed_by`/`claimed_at` in one transaction. Used by manual
    /// `/tasks/{id}/release` and by workflow cancellation (spec Section 4.5
    /// "Cancellation semantics": "returns the task to open"), which would
    /// otherwise leave `claimed_by` set on an `open` task and violate the
    /// claim invariant in spec Section 3.
    pub async fn release(&self, id: &Id) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .bind(id.as_ref())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;

        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET status = 'open', claimed_by = NULL, claimed_at = NULL, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now.timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;

        insert_history(&mut tx, id, "system", "status", Some(&row.status), Some("open"), now).await?;
        if row.claimed_by.is_some() {
            insert_history(&mut tx, id, "system", "claimed_by", row.claimed_by.as_deref(), None, now).await?;
        }

        tx.commit().await?;
        self.get_task(id).await
    }

    /// Revert any task claimed longer than `timeout` ago back to `open`
    /// (spec Section 4.1, E5).
    pub async fn release_stale_claims(&self, timeout: std::time::Duration) -> Result<Vec<Id>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        let stale: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT id, claimed_by FROM tasks WHERE status = 'in_progress' AND claimed_at < ?1",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut released = Vec::with_capacity(stale.len());
        for (task_id, claimed_by) in stale {
            let id = Id::from_string(task_id.clone());
            let mut tx = self.pool.begin().await?;
            let now = Utc::now();
            sqlx::query(
                "UPDATE tasks SET status = 'open', claimed_by = NULL, claimed_at = NULL, updated_at = ?1 \
                 WHERE id = ?2",
            )
            .bind(now.timestamp_millis())
            .bind(&task_id)
            .execute(&mut *tx)
            .await?;
            insert_history(&mut tx, &id, "system", "status", Some("in_progress"), Some("open"), now).await?;
            insert_history(&mut tx, &id, "system", "claimed_by", claimed_by.as_deref(), None, now).await?;
            tx.commit().await?;
            released.push(id);
        }
        Ok(released)
    }

    /// Move a task under a new parent, rejecting cycles and recomputing
    /// `depth` over its subtree (spec Section 4.1, testable property 2).
    pub async fn reparent(&self, id: &Id, new_parent: &Id) -> Result<()> {
        if id == new_parent {
            return Err(StoreError::WouldCreateCycle {
                child: id.to_string(),
                new_parent: new_parent.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let mut ancestor = Some(new_parent.to_string());
        while let Some(current) = ancestor {
            if current == id.to_string() {
                return Err(StoreError::WouldCreateCycle {
                    child: id.to_string(),
                    new_parent: new_parent.to_string(),
                });
            }
            let row: Option<(Option<String>,)> =
                sqlx::query_as("SELECT parent_id FROM tasks WHERE id = ?1")
                    .bind(&current)
                    .fetch_optional(&mut *tx)
                    .await?;
            ancestor = row.and_then(|(p,)| p);
        }

        let new_parent_depth: i64 = sqlx::query_as::<_, (i64,)>("SELECT depth FROM tasks WHERE id = ?1")
            .bind(new_parent.as_ref())
            .fetch_one(&mut *tx)
            .await?
            .0;

        sqlx::query("UPDATE tasks SET parent_id = ?1, depth = ?2, updated_at = ?3 WHERE id = ?4")
            .bind(new_parent.as_ref())
            .bind(new_parent_depth + 1)
            .bind(Utc::now().timestamp_millis())
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;

        recompute_subtree_depth(&mut tx, id, new_parent_depth + 1).await?;

        tx.commit().await?;
        Ok(())
    }

    // --- History ---

    pub async fn list_history(&self, task_id: &Id) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT task_id, timestamp, actor, field, old_value, new_value FROM history \
             WHERE task_id = ?1 ORDER BY timestamp ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HistoryRow::into_entry).collect())
    }

    // --- Workflows ---

    pub async fn save_workflow(&self, state: &WorkflowState) -> Result<()> {
        let completed_steps_json = serde_json::to_string(&state.completed_steps)?;
        let step_outputs_json = serde_json::to_string(&state.step_outputs)?;
        let loop_state_json = match &state.loop_state {
            Some(l) => Some(serde_json::to_string(l)?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO workflows (task_id, workflow_id, grimoire_name, worktree_path, status, \
             current_step, completed_steps_json, step_outputs_json, loop_state_json, started_at, \
             updated_at, error, blocked_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(task_id) DO UPDATE SET \
             workflow_id = excluded.workflow_id, grimoire_name = excluded.grimoire_name, \
             worktree_path = excluded.worktree_path, status = excluded.status, \
             current_step = excluded.current_step, completed_steps_json = excluded.completed_steps_json, \
             step_outputs_json = excluded.step_outputs_json, loop_state_json = excluded.loop_state_json, \
             updated_at = excluded.updated_at, error = excluded.error, blocked_reason = excluded.blocked_reason",
        )
        .bind(state.task_id.as_ref())
        .bind(state.workflow_id.as_ref())
        .bind(&state.grimoire_name)
        .bind(&state.worktree_path)
        .bind(state.status.as_str())
        .bind(state.current_step)
        .bind(completed_steps_json)
        .bind(step_outputs_json)
        .bind(loop_state_json)
        .bind(state.started_at.timestamp_millis())
        .bind(state.updated_at.timestamp_millis())
        .bind(&state.error)
        .bind(&state.blocked_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_workflow(&self, task_id: &Id) -> Result<WorkflowState> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            "SELECT task_id, workflow_id, grimoire_name, worktree_path, status, current_step, \
             completed_steps_json, step_outputs_json, loop_state_json, started_at, updated_at, \
             error, blocked_reason FROM workflows WHERE task_id = ?1",
        )
        .bind(task_id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::WorkflowNotFound(task_id.to_string()))?;
        row.into_state()
    }

    pub async fn list_running_workflows(&self) -> Result<Vec<WorkflowState>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(
            "SELECT task_id, workflow_id, grimoire_name, worktree_path, status, current_step, \
             completed_steps_json, step_outputs_json, loop_state_json, started_at, updated_at, \
             error, blocked_reason FROM workflows WHERE status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowRow::into_state).collect()
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowState>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as(
            "SELECT task_id, workflow_id, grimoire_name, worktree_path, status, current_step, \
             completed_steps_json, step_outputs_json, loop_state_json, started_at, updated_at, \
             error, blocked_reason FROM workflows",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkflowRow::into_state).collect()
    }

    pub async fn delete_workflow(&self, task_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM workflows WHERE task_id = ?1")
            .bind(task_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Agents ---

    pub async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (task_id, step_task_id, pid, worktree, status, started_at, \
             ended_at, exit_code, error, output_file) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(step_task_id) DO UPDATE SET \
             pid = excluded.pid, status = excluded.status, ended_at = excluded.ended_at, \
             exit_code = excluded.exit_code, error = excluded.error",
        )
        .bind(agent.task_id.as_ref())
        .bind(&agent.step_task_id)
        .bind(agent.pid)
        .bind(&agent.worktree)
        .bind(agent.status.as_str())
        .bind(agent.started_at.timestamp_millis())
        .bind(agent.ended_at.map(|t| t.timestamp_millis()))
        .bind(agent.exit_code)
        .bind(&agent.error)
        .bind(&agent.output_file)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, step_task_id: &str) -> Result<AgentRecord> {
        let row = sqlx::query_as::<_, AgentRow>(
            "SELECT task_id, step_task_id, pid, worktree, status, started_at, ended_at, \
             exit_code, error, output_file FROM agents WHERE step_task_id = ?1",
        )
        .bind(step_task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::AgentNotFound(step_task_id.to_string()))?;
        row.into_record()
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT task_id, step_task_id, pid, worktree, status, started_at, ended_at, \
             exit_code, error, output_file FROM agents",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AgentRow::into_record).collect()
    }

    // --- Questions ---

    pub async fn create_question(&self, question: &Question) -> Result<()> {
        sqlx::query(
            "INSERT INTO questions (id, task_id, workflow_id, step_name, prompt, answer, \
             created_at, answered_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(question.id.as_ref())
        .bind(question.task_id.as_ref())
        .bind(question.workflow_id.as_ref())
        .bind(&question.step_name)
        .bind(&question.prompt)
        .bind(&question.answer)
        .bind(question.created_at.timestamp_millis())
        .bind(question.answered_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn answer_question(&self, id: &Id, answer: &str) -> Result<Question> {
        let now = Utc::now();
        let result = sqlx::query("UPDATE questions SET answer = ?1, answered_at = ?2 WHERE id = ?3")
            .bind(answer)
            .bind(now.timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::QuestionNotFound(id.to_string()));
        }
        self.get_question(id).await
    }

    pub async fn get_question(&self, id: &Id) -> Result<Question> {
        let row = sqlx::query_as::<_, QuestionRow>(
            "SELECT id, task_id, workflow_id, step_name, prompt, answer, created_at, answered_at \
             FROM questions WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::QuestionNotFound(id.to_string()))?;
        Ok(row.into_question())
    }

    // --- Events ---

    pub async fn append_event(&self, record: &EventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (id, event_type, entity_id, timestamp, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(record.id.as_ref())
        .bind(&record.event_type)
        .bind(&record.entity_id)
        .bind(record.timestamp.timestamp_millis())
        .bind(serde_json::to_string(&record.payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Events strictly after `last_event_id`, in emission order — used to
    /// resume an SSE stream on reconnect (spec Section 4.7, E6).
    pub async fn list_events_after(&self, last_event_id: &Id) -> Result<Vec<EventRecord>> {
        let cutoff: Option<(i64,)> = sqlx::query_as("SELECT timestamp FROM events WHERE id = ?1")
            .bind(last_event_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        let Some((cutoff_ts,)) = cutoff else {
            return self.list_events_since(DateTime::<Utc>::MIN_UTC).await;
        };
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, event_type, entity_id, timestamp, payload_json FROM events \
             WHERE timestamp > ?1 ORDER BY timestamp ASC",
        )
        .bind(cutoff_ts)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_record).collect::<serde_json::Result<_>>().map_err(Into::into)
    }

    pub async fn list_events_since(&self, since: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, event_type, entity_id, timestamp, payload_json FROM events \
             WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::into_record).collect::<serde_json::Result<_>>().map_err(Into::into)
    }

    pub async fn trim_events(&self, retention: std::time::Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // --- Retention sweeps (spec Section 4.1) ---

    pub async fn soft_delete_closed_before(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let result = sqlx::query(
            "UPDATE tasks SET deleted_at = ?1 WHERE status = 'closed' AND deleted_at IS NULL \
             AND updated_at < ?2",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn hard_delete_soft_deleted_before(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let ids: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM tasks WHERE deleted_at IS NOT NULL AND deleted_at < ?1")
                .bind(cutoff.timestamp_millis())
                .fetch_all(&self.pool)
                .await?;
        let count = ids.len() as u64;
        for (id,) in ids {
            self.delete_task(&Id::from_string(id)).await?;
        }
        Ok(count)
    }

    // --- Counters ---

    /// Allocate the next `step_task_id` sequence number for a task, e.g.
    /// `{task_id}-step-{n}` (spec Section 3, Agent).
    pub async fn next_step_sequence(&self, task_id: &Id) -> Result<u32> {
        let name = format!("step_seq:{}", task_id.as_ref());
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO counters (name, value) VALUES (?1, 0) ON CONFLICT(name) DO NOTHING")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE counters SET value = value + 1 WHERE name = ?1")
            .bind(&name)
            .execute(&mut *tx)
            .await?;
        let (value,): (i64,) = sqlx::query_as("SELECT value FROM counters WHERE name = ?1")
            .bind(&name)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(value as u32)
    }
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    task_id: &Id,
    actor: &str,
    field: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO history (task_id, timestamp, actor, field, old_value, new_value) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(task_id.as_ref())
    .bind(timestamp.timestamp_millis())
    .bind(actor)
    .bind(field)
    .bind(old_value)
    .bind(new_value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn recompute_subtree_depth(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    root: &Id,
    root_depth: i64,
) -> Result<()> {
    let mut stack = vec![(root.to_string(), root_depth)];
    while let Some((current, depth)) = stack.pop() {
        let children: Vec<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE parent_id = ?1")
            .bind(&current)
            .fetch_all(&mut **tx)
            .await?;
        for (child,) in children {
            sqlx::query("UPDATE tasks SET depth = ?1 WHERE id = ?2")
                .bind(depth + 1)
                .bind(&child)
                .execute(&mut **tx)
                .await?;
            stack.push((child, depth + 1));
        }
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    parent_id: Option<String>,
    depth: i64,
    title: String,
    body: String,
    task_type: String,
    status: String,
    priority: i64,
    grimoire_hint: Option<String>,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl TaskRow {
    fn into_task(self, tags: BTreeSet<String>) -> Task {
        Task {
            id: Id::from_string(self.id),
            parent_id: self.parent_id.map(Id::from_string),
            depth: self.depth as u32,
            title: self.title,
            body: self.body,
            task_type: self.task_type,
            status: TaskStatus::from_str(&self.status).unwrap_or(TaskStatus::Open),
            priority: self.priority as u8,
            tags,
            grimoire_hint: self.grimoire_hint,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at.and_then(DateTime::from_timestamp_millis),
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            deleted_at: self.deleted_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    task_id: String,
    timestamp: i64,
    actor: String,
    field: String,
    old_value: Option<String>,
    new_value: Option<String>,
}

impl HistoryRow {
    fn into_entry(self) -> HistoryEntry {
        HistoryEntry {
            task_id: Id::from_string(self.task_id),
            timestamp: DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default(),
            actor: self.actor,
            field: self.field,
            old_value: self.old_value,
            new_value: self.new_value,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    task_id: String,
    workflow_id: String,
    grimoire_name: String,
    worktree_path: String,
    status: String,
    current_step: i64,
    completed_steps_json: String,
    step_outputs_json: String,
    loop_state_json: Option<String>,
    started_at: i64,
    updated_at: i64,
    error: Option<String>,
    blocked_reason: Option<String>,
}

impl WorkflowRow {
    fn into_state(self) -> Result<WorkflowState> {
        let completed_steps: std::collections::BTreeMap<String, StepResult> =
            serde_json::from_str(&self.completed_steps_json)?;
        let step_outputs: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&self.step_outputs_json)?;
        let loop_state: Option<LoopState> = match self.loop_state_json {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        };

        Ok(WorkflowState {
            workflow_id: Id::from_string(self.workflow_id),
            task_id: Id::from_string(self.task_id),
            grimoire_name: self.grimoire_name,
            worktree_path: self.worktree_path,
            status: WorkflowStatus::from_str(&self.status).unwrap_or(WorkflowStatus::Failed),
            current_step: self.current_step,
            completed_steps,
            step_outputs,
            loop_state,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
            error: self.error,
            blocked_reason: self.blocked_reason,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    task_id: String,
    step_task_id: String,
    pid: Option<i64>,
    worktree: String,
    status: String,
    started_at: i64,
    ended_at: Option<i64>,
    exit_code: Option<i64>,
    error: Option<String>,
    output_file: String,
}

impl AgentRow {
    fn into_record(self) -> Result<AgentRecord> {
        Ok(AgentRecord {
            task_id: Id::from_string(self.task_id),
            step_task_id: self.step_task_id,
            pid: self.pid.map(|p| p as u32),
            worktree: self.worktree,
            status: AgentStatus::from_str(&self.status).unwrap_or(AgentStatus::Failed),
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            ended_at: self.ended_at.and_then(DateTime::from_timestamp_millis),
            exit_code: self.exit_code.map(|c| c as i32),
            error: self.error,
            output_file: self.output_file,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuestionRow {
    id: String,
    task_id: String,
    workflow_id: String,
    step_name: String,
    prompt: String,
    answer: Option<String>,
    created_at: i64,
    answered_at: Option<i64>,
}

impl QuestionRow {
    fn into_question(self) -> Question {
        Question {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            workflow_id: Id::from_string(self.workflow_id),
            step_name: self.step_name,
            prompt: self.prompt,
            answer: self.answer,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            answered_at: self.answered_at.and_then(DateTime::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    event_type: String,
    entity_id: String,
    timestamp: i64,
    payload_json: String,
}

impl EventRow {
    fn into_record(self) -> serde_json::Result<EventRecord> {
        Ok(EventRecord {
            id: Id::from_string(self.id),
            event_type: self.event_type,
            entity_id: self.entity_id,
            timestamp: DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default(),
            payload: serde_json::from_str(&self.payload_json)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coven_core::types::TaskStatus;

    fn sample_task(title: &str) -> Task {
        let now = Utc::now();
        Task {
            id: Id::new(),
            parent_id: None,
            depth: 0,
            title: title.to_string(),
            body: String::new(),
            task_type: "feature".into(),
            status: TaskStatus::Open,
            priority: 2,
            tags: BTreeSet::new(),
            grimoire_hint: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    async fn test_store() -> Store {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(&dir.path().join("coven.db")).await.unwrap();
        store.migrate_embedded().await.unwrap();
        std::mem::forget(dir);
        store
    }

    #[tokio::test]
    async fn claim_is_atomic_across_concurrent_attempts() {
        let store = std::sync::Arc::new(test_store().await);
        let task = sample_task("t1");
        store.create_task(&task).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move { store.claim(&id, &format!("agent-{i}")).await }));
        }

        let mut successes = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn reclaim_by_same_agent_is_idempotent() {
        let store = test_store().await;
        let task = sample_task("t1");
        store.create_task(&task).await.unwrap();
        store.claim(&task.id, "agent-1").await.unwrap();
        let reclaimed = store.claim(&task.id, "agent-1").await.unwrap();
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn reparent_recomputes_depth_over_subtree() {
        let store = test_store().await;
        let root = sample_task("root");
        let mid = sample_task("mid");
        let leaf = sample_task("leaf");
        let new_parent = sample_task("new-parent");
        store.create_task(&root).await.unwrap();
        store.create_task(&new_parent).await.unwrap();
        store.create_task(&mid).await.unwrap();
        store.create_task(&leaf).await.unwrap();

        store.reparent(&mid.id, &root.id).await.unwrap();
        store.reparent(&leaf.id, &mid.id).await.unwrap();
        assert_eq!(store.get_task(&leaf.id).await.unwrap().depth, 2);

        store.reparent(&mid.id, &new_parent.id).await.unwrap();
        assert_eq!(store.get_task(&mid.id).await.unwrap().depth, 1);
        assert_eq!(store.get_task(&leaf.id).await.unwrap().depth, 2);
    }

    #[tokio::test]
    async fn reparent_rejects_cycles() {
        let store = test_store().await;
        let a = sample_task("a");
        let b = sample_task("b");
        store.create_task(&a).await.unwrap();
        store.create_task(&b).await.unwrap();
        store.reparent(&b.id, &a.id).await.unwrap();

        let err = store.reparent(&a.id, &b.id).await.unwrap_err();
        assert!(matches!(err, StoreError::WouldCreateCycle { .. }));
    }

    #[tokio::test]
    async fn release_stale_claims_reverts_and_logs_history() {
        let store = test_store().await;
        let mut task = sample_task("t1");
        task.status = TaskStatus::InProgress;
        task.claimed_by = Some("agent-1".to_string());
        task.claimed_at = Some(Utc::now() - chrono::Duration::minutes(31));
        store.create_task(&task).await.unwrap();

        let released = store.release_stale_claims(std::time::Duration::from_secs(30 * 60)).await.unwrap();
        assert_eq!(released, vec![task.id.clone()]);

        let after = store.get_task(&task.id).await.unwrap();
        assert_eq!(after.status, TaskStatus::Open);
        assert!(after.claimed_by.is_none());

        let history = store.list_history(&task.id).await.unwrap();
        assert!(history.iter().any(|h| h.field == "status" && h.actor == "system"));
        assert!(history.iter().any(|h| h.field == "claimed_by" && h.actor == "system"));
    }

    #[tokio::test]
    async fn delete_task_cascades_over_subtree() {
        let store = test_store().await;
        let root = sample_task("root");
        let child = sample_task("child");
        store.create_task(&root).await.unwrap();
        store.create_task(&child).await.unwrap();
        store.reparent(&child.id, &root.id).await.unwrap();

        store.delete_task(&root.id).await.unwrap();
        assert!(store.get_task(&root.id).await.is_err());
        assert!(store.get_task(&child.id).await.is_err());
    }
}
