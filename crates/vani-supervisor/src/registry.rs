// ABOUTME: SessionRegistry: workspace key -> live WorkerSession.
// ABOUTME: At most one entry per key; entries leave together with their terminal transition.

use crate::error::{Result, SupervisorError};
use crate::key::WorkspaceKey;
use crate::session::{SessionState, WorkerSession};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Table of live sessions. A key is present only while its session is
/// `Starting` or `Running`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<WorkspaceKey, Arc<WorkerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkspaceKey, Arc<WorkerSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &WorkspaceKey) -> Option<Arc<WorkerSession>> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &WorkspaceKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Register a session under its key. Never replaces a live entry.
    pub fn put(&self, session: Arc<WorkerSession>) -> Result<()> {
        match self.lock().entry(session.key().clone()) {
            Entry::Occupied(entry) => Err(SupervisorError::AlreadyRunning(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Drop the entry for `key`, if any.
    pub fn remove(&self, key: &WorkspaceKey) -> Option<Arc<WorkerSession>> {
        self.lock().remove(key)
    }

    /// Snapshot of every entry; later mutations do not affect it.
    pub fn list_all(&self) -> Vec<(WorkspaceKey, Arc<WorkerSession>)> {
        self.lock()
            .iter()
            .map(|(key, session)| (key.clone(), Arc::clone(session)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Move `session` into `terminal` and drop its entry under a single lock.
    ///
    /// Returns false if the session was already terminal. An entry that belongs to
    /// a newer session for the same key is left alone.
    pub fn retire(&self, session: &WorkerSession, terminal: SessionState) -> bool {
        let mut sessions = self.lock();
        if !session.finish(terminal) {
            return false;
        }
        let owned = sessions
            .get(session.key())
            .is_some_and(|current| current.id() == session.id());
        if owned {
            sessions.remove(session.key());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CapturingSink;
    use crate::supervisor::spawn::ExitReport;

    fn session(path: &str) -> Arc<WorkerSession> {
        let key = WorkspaceKey::new(path);
        let sink = Arc::new(CapturingSink::new(key.sink_name()).silent());
        Arc::new(WorkerSession::new(key, sink))
    }

    #[test]
    fn test_put_and_get() {
        let registry = SessionRegistry::new();
        let s = session("/ws1");
        registry.put(Arc::clone(&s)).unwrap();

        let found = registry.get(&WorkspaceKey::new("/ws1")).unwrap();
        assert_eq!(found.id(), s.id());
        assert!(registry.get(&WorkspaceKey::new("/ws2")).is_none());
    }

    #[test]
    fn test_put_rejects_live_duplicate() {
        let registry = SessionRegistry::new();
        let first = session("/ws1");
        registry.put(Arc::clone(&first)).unwrap();

        let err = registry.put(session("/ws1")).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(ref k) if k.as_path().to_str() == Some("/ws1")));
        assert_eq!(registry.get(first.key()).unwrap().id(), first.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let s = session("/ws1");
        registry.put(Arc::clone(&s)).unwrap();

        assert!(registry.remove(s.key()).is_some());
        assert!(registry.remove(s.key()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_all_is_a_snapshot() {
        let registry = SessionRegistry::new();
        for path in ["/ws1", "/ws2", "/ws3"] {
            registry.put(session(path)).unwrap();
        }

        let snapshot = registry.list_all();
        for (key, _) in &snapshot {
            registry.remove(key);
        }
        assert_eq!(snapshot.len(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retire_removes_entry_with_transition() {
        let registry = SessionRegistry::new();
        let s = session("/ws1");
        registry.put(Arc::clone(&s)).unwrap();

        let report = ExitReport {
            code: Some(1),
            signal: None,
        };
        assert!(registry.retire(&s, SessionState::Exited(report)));
        assert!(registry.get(s.key()).is_none());
        assert!(!registry.retire(&s, SessionState::Killed));
    }

    #[test]
    fn test_retire_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let old = session("/ws1");
        registry.put(Arc::clone(&old)).unwrap();
        registry.remove(old.key());

        let newer = session("/ws1");
        registry.put(Arc::clone(&newer)).unwrap();

        assert!(registry.retire(&old, SessionState::Killed));
        assert_eq!(registry.get(newer.key()).unwrap().id(), newer.id());
    }

    #[test]
    fn test_concurrent_puts_register_once() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.put(session("/ws1")).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
