//! HTTP/IPC control plane (spec Section 6; expanded in section 4.8).
//!
//! The router, `AppState`, and handler shapes follow the teacher's
//! `server.rs` almost verbatim; the only structural change is the
//! transport, which binds a Unix-domain socket at `{workspace}/.coven/
//! covend.sock` instead of a TCP port, since this daemon is local-only by
//! construction rather than by an auth-token convention layered on top of
//! TCP.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use coven_core::{Id, Task, TaskStatus};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::EventBroker;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{Store, StoreError, TaskPatch};

/// Bumped whenever a response shape changes in a way clients should notice.
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub store: Arc<Store>,
    pub broker: Arc<EventBroker>,
    pub scheduler: Arc<Scheduler>,
    pub started_at: chrono::DateTime<Utc>,
    pub shutdown: CancellationToken,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/shutdown", post(shutdown))
        .route("/state", get(state_snapshot))
        .route("/events", get(stream_events))
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).patch(patch_task).delete(delete_task))
        .route("/tasks/{id}/claim", post(claim_task))
        .route("/tasks/{id}/release", post(release_task))
        .route("/tasks/{id}/complete", post(complete_task))
        .route("/tasks/{id}/block", post(block_task))
        .route("/tasks/{id}/tags", post(add_tags).delete(remove_tags))
        .route("/tasks/{id}/reparent", post(reparent_task))
        .route("/tasks/{id}/children", get(list_children))
        .route("/tasks/{id}/history", get(task_history))
        .route("/tasks/bulk", post(bulk_create_tasks))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/log", get(workflow_log))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/retry", post(retry_workflow))
        .route("/workflows/{id}/approve-merge", post(approve_merge))
        .route("/workflows/{id}/reject-merge", post(reject_merge))
        .route("/agents/{id}/output", get(agent_output))
        .route("/questions/{id}/answer", post(answer_question))
        .with_state(state)
}

/// Bind the control socket and serve until `state.shutdown` fires. Removes
/// a stale socket file left behind by an unclean exit before binding.
pub async fn serve_unix(socket_path: &Path, state: Arc<AppState>) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control socket listening");

    let shutdown = state.shutdown.clone();
    let router = create_router(state);
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn err(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: message.into() }))
}

/// Maps each subsystem error to the HTTP status spec Section 7 assigns it.
fn store_err(e: StoreError) -> ApiError {
    match e {
        StoreError::TaskNotFound(_)
        | StoreError::WorkflowNotFound(_)
        | StoreError::AgentNotFound(_)
        | StoreError::QuestionNotFound(_) => err(StatusCode::NOT_FOUND, e.to_string()),
        StoreError::AlreadyClaimed { .. } => err(StatusCode::CONFLICT, e.to_string()),
        StoreError::InvalidStatus(_) | StoreError::WouldCreateCycle { .. } => {
            err(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        StoreError::Database(_) | StoreError::Migration(_) | StoreError::Serialization(_) | StoreError::Corruption(_) => {
            error!(%e, "store error");
            err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn scheduler_err(e: SchedulerError) -> ApiError {
    match e {
        SchedulerError::Store(e) => store_err(e),
        SchedulerError::NotPendingMerge(_) | SchedulerError::NotRetryable(_) => {
            err(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        other => {
            error!(%other, "scheduler error");
            err(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "status": "ok",
        "version": DAEMON_VERSION,
        "uptime_secs": uptime,
    }))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("shutdown requested over control socket");
    state.shutdown.cancel();
    StatusCode::ACCEPTED
}

async fn state_snapshot(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.broker.snapshot().await.map_err(store_err)?;
    Ok(Json(snapshot.payload))
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    #[serde(rename = "last_event_id")]
    last_event_id: Option<String>,
}

/// `GET /events`: emits a `state.snapshot` first, then live events, honoring
/// `Last-Event-ID` (header or `?last_event_id=`) to replay anything missed
/// while disconnected (spec 4.7, E6).
async fn stream_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id);

    let replay = match &last_event_id {
        Some(id) => state.broker.replay_after(&Id::from_string(id.clone())).await.map_err(store_err)?,
        None => Vec::new(),
    };
    let snapshot = state.broker.snapshot().await.map_err(store_err)?;
    let live = state.broker.subscribe();

    let backlog = std::iter::once(snapshot).chain(replay).collect::<Vec<_>>();
    let backlog_stream = futures_util::stream::iter(backlog).map(|event| Ok(to_sse(event)));
    // `stream::unfold` over `recv()` rather than a `BroadcastStream` wrapper
    // crate: a `Lagged` error ends the stream outright, matching spec 5
    // ("slow subscribers are dropped with a disconnected event") instead of
    // silently skipping the gap.
    let live_stream = futures_util::stream::unfold(live, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((Ok(to_sse(event)), rx)),
            Err(_closed_or_lagged) => None,
        }
    });

    Ok(Sse::new(backlog_stream.chain(live_stream)).keep_alive(KeepAlive::default()))
}

fn to_sse(event: coven_core::BrokerEvent) -> SseEvent {
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(event.payload.to_string())
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default = "default_task_type", rename = "type")]
    task_type: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default = "default_priority")]
    priority: u8,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    grimoire_hint: Option<String>,
}

fn default_task_type() -> String {
    "feature".to_string()
}

fn default_priority() -> u8 {
    2
}

#[derive(Debug, Serialize)]
struct TaskResponse {
    task: Task,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let parent_id = req.parent_id.map(Id::from_string);
    let depth = match &parent_id {
        Some(parent) => state.store.get_task(parent).await.map_err(store_err)?.depth + 1,
        None => 0,
    };
    let now = Utc::now();
    let task = Task {
        id: Id::new(),
        parent_id,
        depth,
        title: req.title,
        body: req.body,
        task_type: req.task_type,
        status: TaskStatus::Open,
        priority: req.priority,
        tags: req.tags.into_iter().collect(),
        grimoire_hint: req.grimoire_hint,
        claimed_by: None,
        claimed_at: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    state.store.create_task(&task).await.map_err(store_err)?;
    publish_tasks_updated(&state, &[task.id.clone()]).await;
    Ok((StatusCode::CREATED, Json(TaskResponse { task })))
}

#[derive(Debug, Deserialize)]
struct BulkCreateRequest {
    tasks: Vec<CreateTaskRequest>,
}

async fn bulk_create_tasks(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BulkCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut created = Vec::with_capacity(req.tasks.len());
    for item in req.tasks {
        let parent_id = item.parent_id.map(Id::from_string);
        let depth = match &parent_id {
            Some(parent) => state.store.get_task(parent).await.map_err(store_err)?.depth + 1,
            None => 0,
        };
        let now = Utc::now();
        let task = Task {
            id: Id::new(),
            parent_id,
            depth,
            title: item.title,
            body: item.body,
            task_type: item.task_type,
            status: TaskStatus::Open,
            priority: item.priority,
            tags: item.tags.into_iter().collect(),
            grimoire_hint: item.grimoire_hint,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        state.store.create_task(&task).await.map_err(store_err)?;
        created.push(task.id);
    }
    let ids = created;
    publish_tasks_updated(&state, &ids).await;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "task_ids": ids }))))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.store.list_tasks().await.map_err(store_err)?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

async fn get_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let task = state.store.get_task(&Id::from_string(id)).await.map_err(store_err)?;
    Ok(Json(TaskResponse { task }))
}

#[derive(Debug, Deserialize, Default)]
struct PatchTaskRequest {
    title: Option<String>,
    body: Option<String>,
    #[serde(rename = "type")]
    task_type: Option<String>,
    status: Option<TaskStatus>,
    priority: Option<u8>,
    #[serde(default)]
    grimoire_hint: Option<Option<String>>,
}

async fn patch_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<PatchTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    let patch = TaskPatch {
        title: req.title,
        body: req.body,
        task_type: req.task_type,
        status: req.status,
        priority: req.priority,
        grimoire_hint: req.grimoire_hint,
    };
    let task = state.store.patch_task(&id, &patch).await.map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(Json(TaskResponse { task }))
}

async fn delete_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    state.store.delete_task(&id).await.map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn claim_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    let task = state.store.claim(&id, &req.agent_id).await.map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(Json(TaskResponse { task }))
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    agent_id: String,
}

async fn release_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    let task = state.store.release(&id).await.map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(Json(TaskResponse { task }))
}

/// Manual close, outside the merge workflow (e.g. a task that needed no
/// agent work).
async fn complete_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    let task = state
        .store
        .patch_task(&id, &TaskPatch { status: Some(TaskStatus::Closed), ..Default::default() })
        .await
        .map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(Json(TaskResponse { task }))
}

async fn block_task(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    let task = state
        .store
        .patch_task(&id, &TaskPatch { status: Some(TaskStatus::Blocked), ..Default::default() })
        .await
        .map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(Json(TaskResponse { task }))
}

#[derive(Debug, Deserialize)]
struct TagsRequest {
    tags: Vec<String>,
}

async fn add_tags(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<TagsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    state.store.add_tags(&id, &req.tags).await.map_err(store_err)?;
    let task = state.store.get_task(&id).await.map_err(store_err)?;
    Ok(Json(TaskResponse { task }))
}

async fn remove_tags(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<TagsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    state.store.remove_tags(&id, &req.tags).await.map_err(store_err)?;
    let task = state.store.get_task(&id).await.map_err(store_err)?;
    Ok(Json(TaskResponse { task }))
}

#[derive(Debug, Deserialize)]
struct ReparentRequest {
    new_parent_id: String,
}

async fn reparent_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<ReparentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = Id::from_string(id);
    let new_parent = Id::from_string(req.new_parent_id);
    state.store.reparent(&id, &new_parent).await.map_err(store_err)?;
    let task = state.store.get_task(&id).await.map_err(store_err)?;
    publish_tasks_updated(&state, &[id]).await;
    Ok(Json(TaskResponse { task }))
}

async fn list_children(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let children = state.store.list_children(&Id::from_string(id)).await.map_err(store_err)?;
    Ok(Json(serde_json::json!({ "tasks": children })))
}

async fn task_history(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let history = state.store.list_history(&Id::from_string(id)).await.map_err(store_err)?;
    Ok(Json(serde_json::json!({ "history": history })))
}

async fn publish_tasks_updated(state: &AppState, ids: &[Id]) {
    state
        .broker
        .publish(coven_core::BrokerEvent::new(
            coven_core::EventKind::TasksUpdated,
            ids.first().map(Id::as_ref).unwrap_or("daemon"),
            coven_core::events::TasksUpdatedPayload { task_ids: ids.to_vec() },
        ))
        .await
        .ok();
}

#[derive(Debug, Serialize)]
struct WorkflowResponse {
    #[serde(flatten)]
    state: coven_core::WorkflowState,
    available_actions: &'static [&'static str],
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let workflows = state.store.list_workflows().await.map_err(store_err)?;
    let out: Vec<WorkflowResponse> = workflows
        .into_iter()
        .map(|w| {
            let actions = Scheduler::available_actions(w.status);
            WorkflowResponse { state: w, available_actions: actions }
        })
        .collect();
    Ok(Json(serde_json::json!({ "workflows": out })))
}

async fn get_workflow(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let wf = state.store.load_workflow(&Id::from_string(id)).await.map_err(store_err)?;
    let actions = Scheduler::available_actions(wf.status);
    Ok(Json(WorkflowResponse { state: wf, available_actions: actions }))
}

/// `GET /workflows/{id}/log`: every persisted event whose `entity_id`
/// matches this task, newline-delimited (spec Section 6 layout names
/// `logs/workflows/{wf_id}.jsonl` as this data's on-disk shadow).
async fn workflow_log(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    let events = state
        .store
        .list_events_since(chrono::DateTime::<Utc>::MIN_UTC)
        .await
        .map_err(store_err)?;
    let lines: Vec<serde_json::Value> = events
        .into_iter()
        .filter(|e| e.entity_id == id)
        .map(|e| serde_json::json!({ "type": e.event_type, "timestamp": e.timestamp, "payload": e.payload }))
        .collect();
    let body = lines.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n");
    Ok(([("content-type", "application/x-ndjson")], body))
}

async fn cancel_workflow(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.cancel(&Id::from_string(id)).await.map_err(scheduler_err)?;
    Ok(StatusCode::ACCEPTED)
}

async fn retry_workflow(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.retry(&Id::from_string(id)).await.map_err(scheduler_err)?;
    Ok(StatusCode::ACCEPTED)
}

async fn approve_merge(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.approve_merge(&Id::from_string(id)).await.map_err(scheduler_err)?;
    Ok(StatusCode::ACCEPTED)
}

async fn reject_merge(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.reject_merge(&Id::from_string(id)).await.map_err(scheduler_err)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, Default)]
struct OutputQuery {
    since: Option<usize>,
}

/// `GET /agents/{id}/output?since=N`: `{id}` is an agent's `step_task_id`.
/// Output has no per-line timestamp (the agent runner writes raw captured
/// lines), so `since` counts lines already delivered rather than wall-clock
/// time — a client polls with the `next_since` it was last given.
async fn agent_output(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<OutputQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.store.get_agent(&id).await.map_err(store_err)?;
    let contents = tokio::fs::read_to_string(&agent.output_file).await.unwrap_or_default();
    let all_lines: Vec<&str> = contents.lines().collect();
    let since = query.since.unwrap_or(0).min(all_lines.len());
    let lines: Vec<&str> = all_lines[since..].to_vec();
    let next_since = all_lines.len();
    Ok(Json(serde_json::json!({ "lines": lines, "next_since": next_since, "status": agent.status })))
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    answer: String,
}

async fn answer_question(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let question = state.store.answer_question(&Id::from_string(id), &req.answer).await.map_err(store_err)?;
    Ok(Json(serde_json::json!({ "question": question })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::runner::{AgentOutcome, AgentRunner, AgentRunnerError, SpawnRequest};
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::future::BoxFuture;
    use http_body_util::BodyExt;
    use std::process::Command;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct StubRunner;
    impl AgentRunner for StubRunner {
        fn spawn<'a>(&'a self, _req: SpawnRequest<'a>) -> BoxFuture<'a, Result<AgentOutcome, AgentRunnerError>> {
            Box::pin(async { Ok(AgentOutcome { success: true, summary: "ok".into(), outputs: None, error: None, exit_code: Some(0) }) })
        }
        fn kill<'a>(&'a self, _step_task_id: &'a str) -> BoxFuture<'a, Result<(), AgentRunnerError>> {
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
        std::fs::write(dir.path().join("README.md"), "# t").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
        dir
    }

    async fn test_state(dir: &TempDir) -> Arc<AppState> {
        std::fs::create_dir_all(dir.path().join(".coven")).unwrap();
        let store = Arc::new(Store::new(&dir.path().join(".coven").join("coven.db")).await.unwrap());
        store.migrate_embedded().await.unwrap();
        let broker = Arc::new(EventBroker::new(Arc::clone(&store)));
        let engine = Engine::new(Arc::clone(&store), Arc::clone(&broker), Arc::new(StubRunner), dir.path().to_path_buf());
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&broker), engine, dir.path().to_path_buf(), coven_core::Config::default());
        Arc::new(AppState {
            store,
            broker,
            scheduler,
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = init_repo();
        let state = test_state(&dir).await;
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn create_then_get_task_round_trips() {
        let dir = init_repo();
        let state = test_state(&dir).await;
        let app = create_router(state);

        let create_body = serde_json::json!({ "title": "Add login", "type": "feature" }).to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(create_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = created["task"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(Request::builder().uri(format!("/tasks/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
