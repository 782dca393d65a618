// ABOUTME: vani-supervisor library: session registry, sinks, preflight and the supervisor daemon.
// ABOUTME: Re-exports for programmatic use and for the `vani` binary.

pub mod error;
pub mod init;
pub mod key;
pub mod preflight;
pub mod registry;
pub mod session;
pub mod sink;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use init::run_init;
pub use key::WorkspaceKey;
pub use preflight::{Preflight, PreflightResult};
pub use registry::SessionRegistry;
pub use session::{SessionState, SessionStatus, WorkerSession};
pub use sink::{CapturingSink, ConsoleSinks, OutputSink, SinkProvider, TerminalSink};
pub use supervisor::socket::{self, Request, Response, SocketClient, SocketCommand};
pub use supervisor::{
    CommandSpec, ExitReport, SkippedWorkspace, StartAllReport, StartOutcome, StopPolicy,
    Supervisor,
};
pub use vani_core::{Config, LaunchSettings};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Options for running the supervisor
pub struct SupervisorOptions {
    /// Path to configuration file
    pub config_path: Option<PathBuf>,
    /// Workspaces to start; the configured ones when empty
    pub workspaces: Vec<PathBuf>,
    /// Keep worker output off stderr
    pub quiet: bool,
}

/// Run the supervisor daemon until Ctrl-C or a shutdown request.
pub async fn run_supervisor(options: SupervisorOptions) -> anyhow::Result<()> {
    let config_path = options.config_path.unwrap_or_else(Config::default_path);
    let config = Arc::new(Config::load_or_default(&config_path)?);

    let sinks = ConsoleSinks::new(config.terminal_shell());
    let sinks = Arc::new(if options.quiet { sinks.silent() } else { sinks });
    let supervisor = Supervisor::new(sinks.clone(), Preflight::new(config.preflight.clone()))
        .with_stop_policy(StopPolicy::from_timeout(config.stop_timeout()));

    let dirs = if options.workspaces.is_empty() {
        config.workspaces_expanded()
    } else {
        options.workspaces
    };
    if dirs.is_empty() {
        tracing::warn!("No workspaces given, waiting for start requests");
    }
    let targets: Vec<_> = dirs
        .iter()
        .map(|dir| {
            let key = WorkspaceKey::resolve(dir);
            let launch = config.launch_for(key.as_path());
            (key, launch)
        })
        .collect();

    let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
    let socket_path = config.socket_path();
    let server = {
        let socket_path = socket_path.clone();
        tokio::spawn(async move {
            if let Err(e) = socket::run_socket_server(socket_path, cmd_tx).await {
                tracing::error!(error = %e, "Socket server error");
            }
        })
    };

    // Preflight can be slow; the socket and Ctrl-C stay live while it runs.
    let initial = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let report = supervisor.start_all(targets).await;
            for skipped in &report.skipped {
                eprintln!("[{}] not started: {}", skipped.workspace, skipped.reason);
            }
        })
    };

    loop {
        let cmd = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping agents");
                break;
            }
        };

        match cmd {
            SocketCommand::List { reply } => {
                let mut names: Vec<String> = supervisor
                    .registry()
                    .list_all()
                    .into_iter()
                    .map(|(key, _)| key.to_string())
                    .collect();
                names.sort();
                let _ = reply.send(names);
            }
            SocketCommand::Status { reply } => {
                let _ = reply.send(supervisor.status());
            }
            SocketCommand::Start { workspace, reply } => {
                // Preflight may take minutes; keep serving other commands meanwhile.
                let supervisor = supervisor.clone();
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let key = WorkspaceKey::resolve(&workspace);
                    let launch = config.launch_for(key.as_path());
                    let result = supervisor
                        .start_one(&key, &launch)
                        .await
                        .map(|_| ())
                        .map_err(anyhow::Error::from);
                    let _ = reply.send(result);
                });
            }
            SocketCommand::Stop { workspace, reply } => {
                let key = WorkspaceKey::resolve(&workspace);
                let _ = reply.send(supervisor.stop_one(&key).map_err(anyhow::Error::from));
            }
            SocketCommand::StopAll { reply } => {
                let _ = reply.send(supervisor.stop_all());
            }
            SocketCommand::Logs {
                workspace,
                lines,
                reply,
            } => {
                let key = WorkspaceKey::resolve(&workspace);
                let result = sinks
                    .captured(&key)
                    .map(|sink| sink.tail(lines))
                    .ok_or_else(|| anyhow::anyhow!("No output recorded for {key}"));
                let _ = reply.send(result);
            }
            SocketCommand::Shutdown { reply } => {
                let _ = reply.send(supervisor.stop_all());
                // Let the reply reach the client before the runtime goes away.
                tokio::time::sleep(Duration::from_millis(100)).await;
                break;
            }
        }
    }

    initial.abort();
    let stopped = supervisor.shutdown().await;
    tracing::debug!(stopped, "Agents stopped for shutdown");
    server.abort();
    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("Supervisor stopped");
    Ok(())
}
