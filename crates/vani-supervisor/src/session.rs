// ABOUTME: WorkerSession: one supervised worker process bound to a workspace.
// ABOUTME: Owns the process handle and sink, and enforces Starting -> Running -> Exited/Killed.

use crate::key::WorkspaceKey;
use crate::sink::OutputSink;
use crate::supervisor::spawn::{ExitReport, ExitWatch, StopPolicy, WorkerHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running { pid: Option<u32> },
    Exited(ExitReport),
    Killed,
}

impl SessionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Running { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Running { .. } => "running",
            SessionState::Exited(_) => "exited",
            SessionState::Killed => "killed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Exited(report) => write!(f, "exited ({report})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Snapshot of a session for status listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub workspace: WorkspaceKey,
    pub session_id: String,
    pub pid: Option<u32>,
    pub state: String,
    pub started_at: DateTime<Utc>,
}

pub struct WorkerSession {
    id: Uuid,
    key: WorkspaceKey,
    sink: Arc<dyn OutputSink>,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    process: Mutex<Option<WorkerHandle>>,
    finished: watch::Sender<bool>,
}

impl WorkerSession {
    pub fn new(key: WorkspaceKey, sink: Arc<dyn OutputSink>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            key,
            sink,
            started_at: Utc::now(),
            state: Mutex::new(SessionState::Starting),
            process: Mutex::new(None),
            finished,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &WorkspaceKey {
        &self.key
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    pub fn is_live(&self) -> bool {
        self.lock_state().is_live()
    }

    pub fn pid(&self) -> Option<u32> {
        match *self.lock_state() {
            SessionState::Running { pid } => pid,
            _ => None,
        }
    }

    /// Starting -> Running, taking ownership of the process handle.
    /// Hands the handle back if the session already left `Starting`.
    pub fn attach(&self, handle: WorkerHandle) -> Result<(), WorkerHandle> {
        let mut state = self.lock_state();
        if *state != SessionState::Starting {
            return Err(handle);
        }
        *state = SessionState::Running { pid: handle.pid() };
        *self.lock_process() = Some(handle);
        Ok(())
    }

    /// Move into a terminal state. False if the session was already terminal.
    pub(crate) fn finish(&self, terminal: SessionState) -> bool {
        debug_assert!(!terminal.is_live());
        let mut state = self.lock_state();
        if !state.is_live() {
            return false;
        }
        *state = terminal;
        true
    }

    /// Give up the process handle and ask the process to stop.
    /// `None` if there was no live process to deliver the request to.
    pub(crate) fn signal_stop(&self, policy: StopPolicy) -> Option<ExitWatch> {
        let handle = self.lock_process().take()?;
        let exit = handle.exit_watch();
        handle.stop(policy).then_some(exit)
    }

    /// Wake everyone in `wait()`. Called once the terminal line has been written.
    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    /// Resolve once the session has ended and its sink has been told why.
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.finished.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.state()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        let pid = match state {
            SessionState::Running { pid } => pid,
            _ => None,
        };
        SessionStatus {
            workspace: self.key.clone(),
            session_id: self.id.to_string(),
            pid,
            state: state.to_string(),
            started_at: self.started_at,
        }
    }
}

impl fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("sink", &self.sink.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CapturingSink;
    use crate::supervisor::spawn::{spawn_worker, CommandSpec};
    use std::time::Duration;

    fn session(path: &str) -> WorkerSession {
        let key = WorkspaceKey::new(path);
        let sink = Arc::new(CapturingSink::new(key.sink_name()).silent());
        WorkerSession::new(key, sink)
    }

    #[test]
    fn test_new_session_is_starting() {
        let session = session("/ws1");
        assert_eq!(session.state(), SessionState::Starting);
        assert!(session.is_live());
        assert_eq!(session.pid(), None);
        assert_eq!(session.sink().name(), "Vani Agent: ws1");
    }

    #[test]
    fn test_terminal_states_are_final() {
        let session = session("/ws1");
        let report = ExitReport {
            code: Some(1),
            signal: None,
        };
        assert!(session.finish(SessionState::Exited(report)));
        assert!(!session.finish(SessionState::Killed));
        assert_eq!(session.state(), SessionState::Exited(report));
        assert!(!session.is_live());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Running { pid: Some(7) }.to_string(), "running");
        assert_eq!(
            SessionState::Exited(ExitReport {
                code: Some(0),
                signal: None
            })
            .to_string(),
            "exited (code=0)"
        );
    }

    #[tokio::test]
    async fn test_attach_moves_to_running() {
        let session = session("/ws1");
        let spec = CommandSpec::new("sh", std::env::temp_dir()).args(["-c", "exit 0"]);
        let (handle, _events) = spawn_worker(&spec).unwrap();
        let pid = handle.pid();

        assert!(session.attach(handle).is_ok());
        assert_eq!(session.state(), SessionState::Running { pid });
        assert_eq!(session.status().state, "running");
    }

    #[tokio::test]
    async fn test_attach_after_kill_returns_handle() {
        let session = session("/ws1");
        assert!(session.finish(SessionState::Killed));

        let spec = CommandSpec::new("sh", std::env::temp_dir()).args(["-c", "exit 0"]);
        let (handle, _events) = spawn_worker(&spec).unwrap();
        assert!(session.attach(handle).is_err());
        assert_eq!(session.state(), SessionState::Killed);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_mark_finished() {
        let session = Arc::new(session("/ws1"));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait().await })
        };

        assert!(session.finish(SessionState::Killed));
        session.mark_finished();

        let state = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, SessionState::Killed);
    }
}
