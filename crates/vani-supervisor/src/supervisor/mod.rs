// ABOUTME: Supervisor: preflight -> spawn -> register -> stream -> unregister on exit.
// ABOUTME: Offers single and bulk start, selective and bulk stop, and status snapshots.

pub mod socket;
pub mod spawn;

pub use spawn::{CommandSpec, ExitReport, StopPolicy};

use crate::error::{Result, SupervisorError};
use crate::key::WorkspaceKey;
use crate::preflight::Preflight;
use crate::registry::SessionRegistry;
use crate::session::{SessionState, SessionStatus, WorkerSession};
use crate::sink::{OutputSink, SinkProvider};
use serde::Serialize;
use spawn::{spawn_worker, ExitWatch, ProcessEvent, ProcessEvents};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vani_core::{LaunchSettings, CREDENTIAL_ENV_VAR};

/// What `start_one` left behind.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A registered session whose output is captured.
    Tracked(Arc<WorkerSession>),
    /// Commands were sent to a visible terminal; nothing is tracked.
    Visible,
}

impl StartOutcome {
    pub fn session(&self) -> Option<&Arc<WorkerSession>> {
        match self {
            StartOutcome::Tracked(session) => Some(session),
            StartOutcome::Visible => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedWorkspace {
    pub workspace: WorkspaceKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartAllReport {
    pub started: Vec<WorkspaceKey>,
    pub skipped: Vec<SkippedWorkspace>,
}

/// Keys with a start in flight. Held from the busy check until the session is
/// registered, so two concurrent starts of one key cannot both pass preflight.
struct PendingStart {
    pending: Arc<Mutex<HashSet<WorkspaceKey>>>,
    key: WorkspaceKey,
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    sinks: Arc<dyn SinkProvider>,
    preflight: Arc<Preflight>,
    stop_policy: StopPolicy,
    pending: Arc<Mutex<HashSet<WorkspaceKey>>>,
    /// Processes sent a stop request and not yet reaped.
    stopping: Arc<Mutex<Vec<ExitWatch>>>,
}

impl Supervisor {
    pub fn new(sinks: Arc<dyn SinkProvider>, preflight: Preflight) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            sinks,
            preflight: Arc::new(preflight),
            stop_policy: StopPolicy::default(),
            pending: Arc::new(Mutex::new(HashSet::new())),
            stopping: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_stop_policy(mut self, policy: StopPolicy) -> Self {
        self.stop_policy = policy;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stop_policy(&self) -> StopPolicy {
        self.stop_policy
    }

    /// `<interpreter> <interpreter args> <entrypoint>` in the workspace, with the credential overlay.
    pub fn worker_command(&self, key: &WorkspaceKey, launch: &LaunchSettings) -> CommandSpec {
        CommandSpec::new(launch.interpreter.clone(), key.as_path())
            .args(launch.interpreter_args.iter().cloned())
            .arg(launch.entrypoint_in(key.as_path()).to_string_lossy())
            .envs(launch.worker_env())
    }

    fn claim(&self, key: &WorkspaceKey) -> Result<PendingStart> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.registry.contains(key) || !pending.insert(key.clone()) {
            return Err(SupervisorError::AlreadyRunning(key.clone()));
        }
        Ok(PendingStart {
            pending: Arc::clone(&self.pending),
            key: key.clone(),
        })
    }

    /// Start the worker for one workspace.
    ///
    /// Suspends for the dependency preflight but never for the worker itself; the
    /// worker's output and exit are handled by a background task.
    pub async fn start_one(
        &self,
        key: &WorkspaceKey,
        launch: &LaunchSettings,
    ) -> Result<StartOutcome> {
        let entrypoint = launch.entrypoint_in(key.as_path());
        if !entrypoint.is_file() {
            tracing::warn!(workspace = %key, entrypoint = %entrypoint.display(), "Agent script missing");
            return Err(SupervisorError::EntrypointMissing(entrypoint));
        }

        if launch.visible {
            return self.start_visible(key, launch);
        }

        let _claim = self.claim(key)?;
        let command = self.worker_command(key, launch);
        let sink = self.sinks.output(key);
        sink.clear();
        sink.show(false);
        sink.append_line(&format!("Starting Vani agent: {}", command.command_line()));

        if !launch.has_credential() {
            tracing::warn!(workspace = %key, "No credential configured");
            sink.append_line(&format!(
                "{CREDENTIAL_ENV_VAR} is not set; the agent may fail to authenticate."
            ));
        }

        match self
            .preflight
            .ensure(&launch.interpreter, key.as_path(), sink.as_ref(), launch.auto_install)
            .await
        {
            Ok(result) if result.ok => {
                tracing::debug!(workspace = %key, installed = result.installed, "Preflight passed");
            }
            Ok(_) => {
                sink.append_line("Aborting start due to dependency issues.");
                return Err(SupervisorError::DependencyCheckFailed(key.clone()));
            }
            Err(e) => {
                sink.append_line("Aborting start due to dependency issues.");
                return Err(e);
            }
        }

        let session = Arc::new(WorkerSession::new(key.clone(), Arc::clone(&sink)));
        self.registry.put(Arc::clone(&session))?;

        let (handle, events) = match spawn_worker(&command) {
            Ok(spawned) => spawned,
            Err(e) => {
                let report = ExitReport::spawn_failure();
                self.registry
                    .retire(&session, SessionState::Exited(report));
                tracing::error!(workspace = %key, program = %command.program, error = %e, "Failed to spawn agent");
                sink.append_line(&format!("Agent process error: {e}"));
                sink.append_line(&format!("Agent exited ({report})."));
                session.mark_finished();
                return Err(SupervisorError::Spawn {
                    program: command.program,
                    source: e,
                });
            }
        };

        let pid = handle.pid();
        if let Err(handle) = session.attach(handle) {
            // Stopped while spawning; the stop already went out to the sink.
            let exit = handle.exit_watch();
            if handle.stop(self.stop_policy) {
                self.track_stopping(exit);
            }
        }
        tracing::info!(workspace = %key, pid = ?pid, "Agent started");

        tokio::spawn(pump_events(
            Arc::clone(&self.registry),
            Arc::clone(&session),
            events,
        ));

        Ok(StartOutcome::Tracked(session))
    }

    /// Send the install and run commands to a fresh visible terminal.
    fn start_visible(&self, key: &WorkspaceKey, launch: &LaunchSettings) -> Result<StartOutcome> {
        let command = self.worker_command(key, launch);
        let terminal = self
            .sinks
            .terminal(key, &command.env)
            .map_err(|source| SupervisorError::Spawn {
                program: format!("terminal for {key}"),
                source,
            })?;
        terminal.show(true);

        if launch.auto_install && self.preflight.manifest_path(key.as_path()).is_file() {
            let install = self
                .preflight
                .install_command(&launch.interpreter, key.as_path());
            terminal.append_line(&install.command_line());
        }
        terminal.append_line(&command.command_line());

        tracing::info!(workspace = %key, "Agent started in terminal");
        Ok(StartOutcome::Visible)
    }

    /// Start every workspace in turn. A failure skips that workspace only.
    pub async fn start_all<I>(&self, workspaces: I) -> StartAllReport
    where
        I: IntoIterator<Item = (WorkspaceKey, LaunchSettings)>,
    {
        let mut report = StartAllReport::default();
        for (key, launch) in workspaces {
            match self.start_one(&key, &launch).await {
                Ok(_) => report.started.push(key),
                Err(e) => {
                    tracing::warn!(workspace = %key, error = %e, "Skipping workspace");
                    report.skipped.push(SkippedWorkspace {
                        workspace: key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            "Start all finished"
        );
        report
    }

    pub fn stop_one(&self, key: &WorkspaceKey) -> Result<()> {
        let session = self
            .registry
            .get(key)
            .ok_or_else(|| SupervisorError::NotRunning(key.clone()))?;
        if self.stop_session(&session) {
            Ok(())
        } else {
            // Exited between lookup and stop
            Err(SupervisorError::NotRunning(key.clone()))
        }
    }

    /// Stop every registered session. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let stopped = self
            .registry
            .list_all()
            .into_iter()
            .filter(|(_, session)| self.stop_session(session))
            .count();
        tracing::info!(stopped, "Stopped all agents");
        stopped
    }

    /// Killed transition, then the stop request. Does not wait for the process to die.
    fn stop_session(&self, session: &WorkerSession) -> bool {
        if !self.registry.retire(session, SessionState::Killed) {
            return false;
        }
        let exit = session.signal_stop(self.stop_policy);
        let delivered = exit.is_some();
        if let Some(exit) = exit {
            self.track_stopping(exit);
        }
        tracing::info!(workspace = %session.key(), delivered, policy = ?self.stop_policy, "Stop signal sent");
        session.sink().append_line("Sent stop signal.");
        session.mark_finished();
        true
    }

    fn track_stopping(&self, exit: ExitWatch) {
        let mut stopping = self.stopping.lock().unwrap_or_else(|e| e.into_inner());
        stopping.retain(|watch| !watch.is_done());
        stopping.push(exit);
    }

    /// Wait up to `grace` for every stopped process to be reaped.
    /// False if some were still running when the grace period ran out.
    pub async fn wait_stopped(&self, grace: Duration) -> bool {
        let stopping = std::mem::take(&mut *self.stopping.lock().unwrap_or_else(|e| e.into_inner()));
        if stopping.is_empty() {
            return true;
        }
        let waiting = stopping.len();
        let reaped = tokio::time::timeout(grace, async {
            for exit in stopping {
                exit.wait().await;
            }
        })
        .await
        .is_ok();
        if !reaped {
            tracing::warn!(waiting, ?grace, "Stopped agents still running after grace period");
        }
        reaped
    }

    /// Stop every session and wait out the stop policy's grace period for them to exit.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.stop_all();
        self.wait_stopped(self.stop_policy.shutdown_grace()).await;
        stopped
    }

    pub fn status(&self) -> Vec<SessionStatus> {
        let mut rows: Vec<SessionStatus> = self
            .registry
            .list_all()
            .into_iter()
            .map(|(_, session)| session.status())
            .collect();
        rows.sort_by(|a, b| a.workspace.cmp(&b.workspace));
        rows
    }
}

/// Feed one session's process events into its sink until the exit event.
async fn pump_events(
    registry: Arc<SessionRegistry>,
    session: Arc<WorkerSession>,
    mut events: ProcessEvents,
) {
    let sink: Arc<dyn OutputSink> = Arc::clone(session.sink());
    let mut line_open = false;

    let report = loop {
        match events.next().await {
            Some(ProcessEvent::Output { text, .. }) => {
                // A stopped session's sink may already belong to a newer run.
                if session.is_live() && !text.is_empty() {
                    sink.append(&text);
                    line_open = !text.ends_with('\n');
                }
            }
            Some(ProcessEvent::Exited(report)) => break report,
            None => {
                tracing::warn!(workspace = %session.key(), "Process events ended without exit status");
                break ExitReport {
                    code: None,
                    signal: None,
                };
            }
        }
    };

    if !registry.retire(&session, SessionState::Exited(report)) {
        tracing::debug!(workspace = %session.key(), %report, "Stopped agent exited");
        return;
    }

    tracing::info!(workspace = %session.key(), %report, "Agent exited");
    if line_open {
        sink.append("\n");
    }
    sink.append_line(&format!("Agent exited ({report})."));
    session.mark_finished();
}
