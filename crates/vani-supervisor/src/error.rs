// ABOUTME: Error types for the vani supervisor
// ABOUTME: One variant per way a start or stop request can be refused

use crate::key::WorkspaceKey;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported to the caller of a supervisor operation.
///
/// None of these affect other workspaces; a failed start leaves the registry as it was.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Agent script not found: {}", .0.display())]
    EntrypointMissing(PathBuf),

    #[error("Agent already running in {0}")]
    AlreadyRunning(WorkspaceKey),

    #[error("Failed to verify or install dependencies for {0}")]
    DependencyCheckFailed(WorkspaceKey),

    #[error("No running agent in {0}")]
    NotRunning(WorkspaceKey),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run installer: {0}")]
    Installer(#[source] std::io::Error),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
