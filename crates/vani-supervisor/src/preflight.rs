// ABOUTME: Dependency preflight run before a worker starts.
// ABOUTME: Checks required packages with the interpreter and installs from the manifest when needed.

use crate::error::{Result, SupervisorError};
use crate::sink::OutputSink;
use crate::supervisor::spawn::{run_streaming, run_to_exit, CommandSpec};
use serde::Serialize;
use std::path::{Path, PathBuf};
use vani_core::PreflightConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreflightResult {
    pub ok: bool,
    pub installed: bool,
}

/// Check-then-install for a workspace's runtime packages. Both steps are a single
/// subprocess each and complete on that process's exit.
#[derive(Debug, Clone, Default)]
pub struct Preflight {
    config: PreflightConfig,
}

impl Preflight {
    pub fn new(config: PreflightConfig) -> Self {
        Self { config }
    }

    pub fn manifest_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.config.manifest)
    }

    pub fn check_command(&self, interpreter: &str, workspace: &Path) -> CommandSpec {
        CommandSpec::new(interpreter, workspace).args(self.config.check_args())
    }

    pub fn install_command(&self, interpreter: &str, workspace: &Path) -> CommandSpec {
        CommandSpec::new(interpreter, workspace)
            .args(self.config.install_args.iter().cloned())
            .arg(self.manifest_path(workspace).to_string_lossy())
    }

    /// True iff the check process launched and exited with status 0.
    pub async fn check(&self, interpreter: &str, workspace: &Path) -> bool {
        match run_to_exit(&self.check_command(interpreter, workspace)).await {
            Ok(report) => {
                tracing::debug!(workspace = %workspace.display(), %report, "Dependency check finished");
                report.success()
            }
            Err(e) => {
                tracing::debug!(workspace = %workspace.display(), error = %e, "Dependency check could not run");
                false
            }
        }
    }

    /// Run the check and, when it fails or `auto_install` is set, the installer.
    ///
    /// A missing manifest never turns a failed check into success. Installer
    /// output is streamed to `sink` line by line.
    pub async fn ensure(
        &self,
        interpreter: &str,
        workspace: &Path,
        sink: &dyn OutputSink,
        auto_install: bool,
    ) -> Result<PreflightResult> {
        let passed = self.check(interpreter, workspace).await;
        if passed && !auto_install {
            return Ok(PreflightResult {
                ok: true,
                installed: false,
            });
        }

        let manifest = self.manifest_path(workspace);
        if !manifest.is_file() {
            sink.append_line(&format!(
                "{} not found; proceeding without auto-install.",
                self.config.manifest
            ));
            tracing::info!(workspace = %workspace.display(), passed, "No dependency manifest");
            return Ok(PreflightResult {
                ok: passed,
                installed: false,
            });
        }

        let install = self.install_command(interpreter, workspace);
        sink.append_line(&format!(
            "Installing Python dependencies: {}",
            install.command_line()
        ));
        let report = match run_streaming(&install, sink).await {
            Ok(report) => report,
            Err(e) => {
                sink.append_line(&format!("Failed to run installer: {e}"));
                tracing::warn!(workspace = %workspace.display(), error = %e, "Installer failed to launch");
                return Err(SupervisorError::Installer(e));
            }
        };

        if report.success() {
            sink.append_line("Dependencies installed successfully.");
            Ok(PreflightResult {
                ok: true,
                installed: true,
            })
        } else {
            sink.append_line(&format!("Dependency installation failed ({report})."));
            tracing::warn!(workspace = %workspace.display(), %report, "Dependency installation failed");
            Ok(PreflightResult {
                ok: false,
                installed: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CapturingSink;
    use tempfile::TempDir;

    /// Preflight driven by `sh`: the check runs `check`, the installer runs
    /// `install` and touches `installer-ran` so tests can tell whether it spawned.
    fn shell_preflight(check: &str, install: &str) -> Preflight {
        Preflight::new(PreflightConfig {
            check_args: Some(vec!["-c".to_string(), check.to_string()]),
            install_args: vec![
                "-c".to_string(),
                format!("touch installer-ran; {install}"),
            ],
            ..PreflightConfig::default()
        })
    }

    fn workspace_with_manifest() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "numpy\n").unwrap();
        dir
    }

    #[test]
    fn test_install_command_appends_manifest() {
        let preflight = Preflight::default();
        let spec = preflight.install_command("python3", Path::new("/ws1"));
        assert_eq!(
            spec.command_line(),
            "python3 -m pip install -r /ws1/requirements.txt"
        );
        assert_eq!(spec.cwd, PathBuf::from("/ws1"));
    }

    #[test]
    fn test_check_command_imports_packages() {
        let preflight = Preflight::default();
        let spec = preflight.check_command("python3", Path::new("/ws1"));
        assert_eq!(spec.args[0], "-c");
        assert!(spec.args[1].starts_with("import soundfile, sounddevice, numpy"));
    }

    #[tokio::test]
    async fn test_passing_check_without_auto_install_returns_immediately() {
        let dir = workspace_with_manifest();
        let sink = CapturingSink::new("s").silent();
        let preflight = shell_preflight("exit 0", "exit 0");

        let result = preflight.ensure("sh", dir.path(), &sink, false).await.unwrap();

        assert_eq!(
            result,
            PreflightResult {
                ok: true,
                installed: false
            }
        );
        assert!(sink.contents().is_empty());
        assert!(!dir.path().join("installer-ran").exists());
    }

    #[tokio::test]
    async fn test_failing_check_without_manifest_writes_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CapturingSink::new("s").silent();
        let preflight = shell_preflight("exit 1", "exit 0");

        let result = preflight.ensure("sh", dir.path(), &sink, true).await.unwrap();

        assert!(!result.ok);
        assert_eq!(
            sink.lines(),
            vec!["requirements.txt not found; proceeding without auto-install."]
        );
        assert!(!dir.path().join("installer-ran").exists());
    }

    #[tokio::test]
    async fn test_passing_check_with_auto_install_and_no_manifest_still_ok() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CapturingSink::new("s").silent();
        let preflight = shell_preflight("exit 0", "exit 0");

        let result = preflight.ensure("sh", dir.path(), &sink, true).await.unwrap();

        assert!(result.ok);
        assert!(!result.installed);
        assert_eq!(sink.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_check_installs_from_manifest() {
        let dir = workspace_with_manifest();
        let sink = CapturingSink::new("s").silent();
        let preflight = shell_preflight(
            "exit 1",
            "echo Collecting numpy; echo Successfully installed numpy",
        );

        let result = preflight.ensure("sh", dir.path(), &sink, false).await.unwrap();

        assert_eq!(
            result,
            PreflightResult {
                ok: true,
                installed: true
            }
        );
        let lines = sink.lines();
        assert!(lines[0].starts_with("Installing Python dependencies: sh -c"));
        assert_eq!(
            &lines[1..],
            [
                "Collecting numpy",
                "Successfully installed numpy",
                "Dependencies installed successfully."
            ]
        );
    }

    #[tokio::test]
    async fn test_installer_failure_reports_code() {
        let dir = workspace_with_manifest();
        let sink = CapturingSink::new("s").silent();
        let preflight = shell_preflight("exit 1", "echo boom >&2; exit 4");

        let result = preflight.ensure("sh", dir.path(), &sink, true).await.unwrap();

        assert!(!result.ok);
        let lines = sink.lines();
        assert!(lines.contains(&"boom".to_string()));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("Dependency installation failed (code=4).")
        );
    }

    #[tokio::test]
    async fn test_installer_launch_failure_is_an_error() {
        let dir = workspace_with_manifest();
        let sink = CapturingSink::new("s").silent();
        let preflight = Preflight::default();

        let err = preflight
            .ensure("/nonexistent/vani-python", dir.path(), &sink, true)
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::Installer(_)));
        assert!(sink
            .lines()
            .last()
            .unwrap()
            .starts_with("Failed to run installer:"));
    }

    #[tokio::test]
    async fn test_check_with_missing_interpreter_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            !Preflight::default()
                .check("/nonexistent/vani-python", dir.path())
                .await
        );
    }
}
