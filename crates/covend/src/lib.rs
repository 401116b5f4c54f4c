//! `covend` — the Coven daemon library (spec Sections 4, 5, 6).
//!
//! Modules are ordered leaves-first, following the control flow in spec
//! Section 2: store -> git/worktree -> runner -> broker -> engine ->
//! scheduler -> server.

pub mod broker;
pub mod engine;
pub mod git;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod worktree;

use thiserror::Error;

/// The daemon-wide error type. Each subsystem owns its own error enum;
/// this composes them for call sites (handlers, scheduler) that cross
/// subsystem boundaries.
#[derive(Debug, Error)]
pub enum CovendError {
    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Git(#[from] git::GitError),

    #[error(transparent)]
    Worktree(#[from] worktree::WorktreeError),

    #[error(transparent)]
    Grimoire(#[from] coven_core::GrimoireError),

    #[error(transparent)]
    Spell(#[from] coven_core::SpellError),

    #[error(transparent)]
    Template(#[from] coven_core::TemplateError),

    #[error(transparent)]
    When(#[from] coven_core::WhenError),

    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    #[error(transparent)]
    Scheduler(#[from] scheduler::SchedulerError),

    #[error(transparent)]
    AgentRunner(#[from] runner::AgentRunnerError),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("grimoire matcher config error: {0}")]
    MatcherConfig(String),

    #[error("config error: {0}")]
    Config(#[from] coven_core::config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("another covend is already running against this workspace (lock held on {0})")]
    AlreadyRunning(PathBuf),
}

/// Convenience alias used throughout the daemon crate.
pub type AppResult<T> = std::result::Result<T, CovendError>;

use std::path::PathBuf;
use std::sync::Arc;

use coven_core::Config;
use runner::ProcessAgentRunner;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Daemon configuration resolved from CLI flags and `.coven/config.yaml`
/// (spec Section 6).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// The workspace the daemon manages; `.coven/` lives directly under it.
    pub workspace: PathBuf,
    /// Binary invoked for `agent` steps (spec 4.6); overridable for tests
    /// and for agents other than the default.
    pub agent_bin: String,
    pub agent_base_args: Vec<String>,
}

impl DaemonConfig {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            workspace,
            agent_bin: std::env::var("COVEND_AGENT_BIN").unwrap_or_else(|_| "claude".to_string()),
            agent_base_args: vec!["-p".to_string()],
        }
    }

    fn coven_dir(&self) -> PathBuf {
        self.workspace.join(".coven")
    }

    fn socket_path(&self) -> PathBuf {
        self.coven_dir().join("covend.sock")
    }

    fn pid_path(&self) -> PathBuf {
        self.coven_dir().join("covend.pid")
    }

    fn db_path(&self) -> PathBuf {
        self.coven_dir().join("coven.db")
    }
}

/// The assembled daemon: owns every subsystem and the cancellation token
/// that coordinates graceful shutdown across them.
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<store::Store>,
    broker: Arc<broker::EventBroker>,
    engine: Arc<engine::Engine>,
    scheduler: Arc<scheduler::Scheduler>,
    daemon_config: Config,
    shutdown: CancellationToken,
    // Held for the life of the process: an advisory exclusive `flock` on
    // `covend.pid` that makes a second daemon against the same workspace
    // fail fast instead of corrupting the shared store/worktrees (spec
    // Section 6, exit code 2).
    _pid_lock: std::fs::File,
}

impl Daemon {
    /// Assemble every subsystem against `config.workspace`. Does not
    /// start any background loop — call [`Daemon::run`] for that.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        if !config.workspace.is_dir() {
            return Err(CovendError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("workspace {} does not exist", config.workspace.display()),
            )));
        }
        std::fs::create_dir_all(config.coven_dir())?;

        let pid_lock = Self::acquire_pid_lock(&config)?;

        let daemon_config = Config::load(&config.workspace)?;

        let store = Arc::new(store::Store::new(&config.db_path()).await?);
        store.migrate_embedded().await?;

        let broker = Arc::new(broker::EventBroker::new(Arc::clone(&store)));
        let agent_runner = Arc::new(ProcessAgentRunner::new(config.agent_bin.clone(), config.agent_base_args.clone()));
        let engine = engine::Engine::new(Arc::clone(&store), Arc::clone(&broker), agent_runner, config.workspace.clone());
        let scheduler = scheduler::Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&engine),
            config.workspace.clone(),
            daemon_config.clone(),
        );

        Ok(Self {
            config,
            store,
            broker,
            engine,
            scheduler,
            daemon_config,
            shutdown: CancellationToken::new(),
            _pid_lock: pid_lock,
        })
    }

    /// Opens `covend.pid`, takes a non-blocking exclusive `flock` on it, and
    /// stamps it with this process's pid — mirroring the open-then-lock-
    /// then-truncate order needed so a losing process never wipes the
    /// winner's pid out from under it. Returns [`CovendError::AlreadyRunning`]
    /// if the lock is already held.
    fn acquire_pid_lock(config: &DaemonConfig) -> AppResult<std::fs::File> {
        use fs2::FileExt;
        use std::io::Write;

        let path = config.pid_path();
        let file = std::fs::OpenOptions::new().write(true).create(true).truncate(false).open(&path)?;
        file.try_lock_exclusive().map_err(|_| CovendError::AlreadyRunning(path))?;

        let mut file = file;
        file.set_len(0)?;
        file.write_all(std::process::id().to_string().as_bytes())?;
        Ok(file)
    }

    pub fn store(&self) -> &Arc<store::Store> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<scheduler::Scheduler> {
        &self.scheduler
    }

    /// Run until `shutdown` is requested: resumes any workflow left
    /// `running` by a previous crash (spec 4.3 Resume), then drives the
    /// scheduler loop, the heartbeat, and the control socket concurrently.
    pub async fn run(&self) -> AppResult<()> {
        info!(workspace = %self.config.workspace.display(), "covend starting");

        let interrupted = self.store.list_running_workflows().await?;
        if !interrupted.is_empty() {
            info!(count = interrupted.len(), "resuming workflows interrupted by a previous crash");
        }
        for state in interrupted {
            match self.store.get_task(&state.task_id).await {
                Ok(task) => {
                    if let Err(err) = self.engine.resume(task, state).await {
                        warn!(%err, "failed to resume interrupted workflow");
                    }
                }
                Err(err) => warn!(%err, "interrupted workflow has no matching task, skipping resume"),
            }
        }

        let app_state = Arc::new(server::AppState {
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            scheduler: Arc::clone(&self.scheduler),
            started_at: chrono::Utc::now(),
            shutdown: self.shutdown.clone(),
        });

        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_shutdown = self.shutdown.clone();
        let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

        let broker = Arc::clone(&self.broker);
        let heartbeat_interval = self.daemon_config.heartbeat_interval;
        let heartbeat_shutdown = self.shutdown.clone();
        let heartbeat_task =
            tokio::spawn(async move { broker::run_heartbeat(broker, heartbeat_interval, heartbeat_shutdown).await });

        let socket_path = self.config.socket_path();
        let server_result = server::serve_unix(&socket_path, app_state).await;

        self.shutdown.cancel();
        scheduler_task.await.ok();
        heartbeat_task.await.ok();
        let _ = std::fs::remove_file(self.config.pid_path());

        server_result.map_err(CovendError::Io)
    }

    /// Signal every running loop to stop; `run` returns once they have.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }
}
