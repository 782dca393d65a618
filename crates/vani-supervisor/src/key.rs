// ABOUTME: WorkspaceKey, the identity every session and sink is tracked under.
// ABOUTME: Wraps the workspace directory path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifies a workspace by its directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceKey(PathBuf);

impl WorkspaceKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Key for a directory as the user named it: canonicalized when it exists, so
    /// `./ws` and `/abs/ws` share one session.
    pub fn resolve(path: &Path) -> Self {
        Self(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Last path component, or the whole path when there is none (e.g. `/`).
    pub fn display_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.0.display().to_string())
    }

    /// Name of the output sink bound to this workspace.
    pub fn sink_name(&self) -> String {
        format!("Vani Agent: {}", self.display_name())
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&Path> for WorkspaceKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for WorkspaceKey {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&str> for WorkspaceKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}
