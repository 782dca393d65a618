// ABOUTME: Per-invocation launch bundle handed to the supervisor.
// ABOUTME: Resolves the interpreter (preferring workspace venvs) and the worker credential.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable the credential is injected under.
pub const CREDENTIAL_ENV_VAR: &str = "OPENAI_API_KEY";

/// Everything the supervisor needs to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    pub interpreter: String,
    /// Arguments placed before the entrypoint (`-u` for unbuffered output)
    pub interpreter_args: Vec<String>,
    /// Relative to the workspace unless absolute
    pub entrypoint: PathBuf,
    /// Visible terminal instead of captured output
    pub visible: bool,
    pub credential: Option<String>,
    pub auto_install: bool,
}

impl LaunchSettings {
    pub fn new(interpreter: impl Into<String>, entrypoint: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: Vec::new(),
            entrypoint: entrypoint.into(),
            visible: false,
            credential: None,
            auto_install: false,
        }
    }

    /// Full entrypoint path inside `workspace`.
    pub fn entrypoint_in(&self, workspace: &Path) -> PathBuf {
        if self.entrypoint.is_absolute() {
            self.entrypoint.clone()
        } else {
            workspace.join(&self.entrypoint)
        }
    }

    /// Variables layered over the inherited environment. Empty without a credential.
    pub fn worker_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(key) = self.credential.as_deref().filter(|k| !k.is_empty()) {
            env.insert(CREDENTIAL_ENV_VAR.to_string(), key.to_string());
        }
        env
    }

    /// True when the worker will see a credential, injected or inherited.
    pub fn has_credential(&self) -> bool {
        self.credential.as_deref().is_some_and(|k| !k.is_empty())
            || std::env::var(CREDENTIAL_ENV_VAR).is_ok_and(|k| !k.is_empty())
    }
}

/// Pick the interpreter for a workspace.
///
/// An empty or generic setting (`python`, `python3`) prefers a virtualenv in the
/// workspace, then the usual system locations. Anything else is taken as given.
pub fn resolve_interpreter(workspace: &Path, configured: &str) -> String {
    let configured = configured.trim();
    let is_generic = configured == "python" || configured == "python3";
    if !configured.is_empty() && !is_generic {
        return configured.to_string();
    }

    let candidates = [
        workspace.join(".venv").join("bin").join("python"),
        workspace.join("venv").join("bin").join("python"),
        workspace.join(".venv").join("bin").join("python3"),
        workspace.join("venv").join("bin").join("python3"),
        PathBuf::from("/usr/local/bin/python3"),
        PathBuf::from("/usr/bin/python3"),
    ];
    candidates
        .iter()
        .find(|c| c.exists())
        .map(|c| c.to_string_lossy().into_owned())
        .unwrap_or_else(|| "python3".to_string())
}

/// Read the credential from `<workspace>/.env`, if present and non-empty.
pub fn read_dotenv_credential(workspace: &Path) -> Option<String> {
    let path = workspace.join(".env");
    let entries = match dotenvy::from_path_iter(&path) {
        Ok(entries) => entries,
        Err(_) => return None,
    };
    for entry in entries {
        match entry {
            Ok((key, value)) if key == CREDENTIAL_ENV_VAR => {
                let value = value.trim();
                return (!value.is_empty()).then(|| value.to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping malformed .env line");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_interpreter_kept() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_interpreter(dir.path(), "/opt/py/bin/python3.12"),
            "/opt/py/bin/python3.12"
        );
        assert_eq!(resolve_interpreter(dir.path(), "pypy3"), "pypy3");
    }

    #[test]
    fn test_generic_interpreter_prefers_venv() {
        let dir = tempfile::tempdir().unwrap();
        let venv_bin = dir.path().join(".venv").join("bin");
        std::fs::create_dir_all(&venv_bin).unwrap();
        std::fs::write(venv_bin.join("python"), "").unwrap();

        let expected = venv_bin.join("python").to_string_lossy().into_owned();
        assert_eq!(resolve_interpreter(dir.path(), ""), expected);
        assert_eq!(resolve_interpreter(dir.path(), "python3"), expected);
    }

    #[test]
    fn test_plain_venv_after_dot_venv() {
        let dir = tempfile::tempdir().unwrap();
        let venv_bin = dir.path().join("venv").join("bin");
        std::fs::create_dir_all(&venv_bin).unwrap();
        std::fs::write(venv_bin.join("python3"), "").unwrap();

        let resolved = resolve_interpreter(dir.path(), "python");
        // A system python3 may also exist; the workspace venv still wins.
        assert_eq!(resolved, venv_bin.join("python3").to_string_lossy());
    }

    #[test]
    fn test_entrypoint_relative_and_absolute() {
        let ws = Path::new("/srv/ws1");
        let relative = LaunchSettings::new("python3", "agent.py");
        assert_eq!(relative.entrypoint_in(ws), PathBuf::from("/srv/ws1/agent.py"));

        let absolute = LaunchSettings::new("python3", "/opt/agent.py");
        assert_eq!(absolute.entrypoint_in(ws), PathBuf::from("/opt/agent.py"));
    }

    #[test]
    fn test_worker_env_injects_credential() {
        let mut launch = LaunchSettings::new("python3", "agent.py");
        assert!(launch.worker_env().is_empty());

        launch.credential = Some(String::new());
        assert!(launch.worker_env().is_empty());

        launch.credential = Some("sk-test".to_string());
        assert_eq!(
            launch.worker_env().get(CREDENTIAL_ENV_VAR).map(String::as_str),
            Some("sk-test")
        );
    }

    #[test]
    fn test_dotenv_credential() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_dotenv_credential(dir.path()), None);

        std::fs::write(
            dir.path().join(".env"),
            "OTHER=1\nOPENAI_API_KEY=\"sk-quoted\"\n",
        )
        .unwrap();
        assert_eq!(read_dotenv_credential(dir.path()).as_deref(), Some("sk-quoted"));
    }

    #[test]
    fn test_dotenv_empty_credential_is_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "OPENAI_API_KEY=\n").unwrap();
        assert_eq!(read_dotenv_credential(dir.path()), None);
    }
}
