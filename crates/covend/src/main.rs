//! covend - the Coven workflow daemon.
//!
//! Turns YAML grimoires into concurrent agent runs against git worktrees.
//! See spec Section 6 for the CLI surface and control-socket layout.

use std::path::PathBuf;

use clap::Parser;
use covend::{CovendError, Daemon, DaemonConfig};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

/// Coven workflow daemon.
#[derive(Debug, Parser)]
#[command(name = "covend", version)]
struct Cli {
    /// Workspace root the daemon manages; `.coven/` lives directly under it.
    #[arg(long, value_name = "path", default_value = ".")]
    workspace: PathBuf,

    /// Run in the foreground (default; covend never daemonizes itself).
    #[arg(long, default_value_t = true)]
    foreground: bool,
}

fn main() {
    let cli = Cli::parse();
    let _ = cli.foreground;

    fmt()
        .with_env_filter(
            EnvFilter::try_from_env("COVEND_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let workspace = match cli.workspace.canonicalize() {
        Ok(path) => path,
        Err(err) => {
            error!(path = %cli.workspace.display(), %err, "workspace does not exist");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let exit_code = runtime.block_on(async move {
        let config = DaemonConfig::new(workspace);
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(err @ CovendError::AlreadyRunning(_)) => {
                error!(%err, "refusing to start");
                return 2;
            }
            Err(err) => {
                error!(%err, "failed to initialize daemon");
                return 1;
            }
        };

        tokio::select! {
            result = daemon.run() => {
                if let Err(err) = result {
                    error!(%err, "daemon exited with error");
                    return 1;
                }
                0
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT");
                daemon.shutdown();
                130
            }
        }
    });

    std::process::exit(exit_code);
}
