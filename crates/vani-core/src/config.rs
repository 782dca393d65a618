// ABOUTME: Configuration for the vani supervisor and its workers.
// ABOUTME: Loaded from a TOML file; every field has a default so the file is optional.

use crate::launch::{read_dotenv_credential, resolve_interpreter, LaunchSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_AGENT_PATH: &str = "agent.py";
pub const DEFAULT_MANIFEST: &str = "requirements.txt";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vani-supervisor.sock";

/// Dependency preflight settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreflightConfig {
    /// Packages the worker imports; the check fails if any is missing
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,

    /// Dependency manifest looked up in the workspace directory
    #[serde(default = "default_manifest")]
    pub manifest: String,

    /// Interpreter arguments for the installer; the manifest path is appended
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,

    /// Replaces the generated import check when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_args: Option<Vec<String>>,
}

fn default_packages() -> Vec<String> {
    ["soundfile", "sounddevice", "numpy"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_manifest() -> String {
    DEFAULT_MANIFEST.to_string()
}

fn default_install_args() -> Vec<String> {
    ["-m", "pip", "install", "-r"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            packages: default_packages(),
            manifest: default_manifest(),
            install_args: default_install_args(),
            check_args: None,
        }
    }
}

impl PreflightConfig {
    /// Interpreter arguments for the dependency check.
    pub fn check_args(&self) -> Vec<String> {
        if let Some(ref args) = self.check_args {
            return args.clone();
        }
        let script = if self.packages.is_empty() {
            "print(\"ok\")".to_string()
        } else {
            format!("import {}; print(\"ok\")", self.packages.join(", "))
        };
        vec!["-c".to_string(), script]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interpreter path; empty or generic ("python", "python3") prefers a workspace venv
    #[serde(default)]
    pub python_path: String,

    /// Worker entrypoint, relative to the workspace or absolute
    #[serde(default = "default_agent_path")]
    pub agent_path: String,

    /// Run workers in a visible terminal instead of capturing their output
    #[serde(default)]
    pub run_in_terminal: bool,

    /// Credential injected as OPENAI_API_KEY; falls back to the workspace .env
    #[serde(default)]
    pub openai_key: String,

    /// Install from the manifest even when the dependency check passes
    #[serde(default = "default_true")]
    pub auto_install_deps: bool,

    /// Workspace directories started by `supervise` when none are given
    #[serde(default)]
    pub workspaces: Vec<String>,

    /// Wait this long after SIGTERM before SIGKILL; unset means signal and forget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout_secs: Option<u64>,

    /// Shell used for visible terminals (defaults to $SHELL, then sh)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_shell: Option<String>,

    /// Control socket for the supervisor daemon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    #[serde(default)]
    pub preflight: PreflightConfig,
}

fn default_agent_path() -> String {
    DEFAULT_AGENT_PATH.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            python_path: String::new(),
            agent_path: default_agent_path(),
            run_in_terminal: false,
            openai_key: String::new(),
            auto_install_deps: true,
            workspaces: Vec::new(),
            stop_timeout_secs: None,
            terminal_shell: None,
            socket_path: None,
            preflight: PreflightConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load config, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Get the default config file path (~/.config/vani/vani.toml)
    pub fn default_path() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("vani")
            .join("vani.toml")
    }

    /// Configured workspaces with ~ expanded
    pub fn workspaces_expanded(&self) -> Vec<PathBuf> {
        self.workspaces
            .iter()
            .map(|w| PathBuf::from(shellexpand::tilde(w).into_owned()))
            .collect()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }

    pub fn terminal_shell(&self) -> String {
        self.terminal_shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "sh".to_string())
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs)
    }

    /// Resolve the launch bundle for one workspace directory.
    pub fn launch_for(&self, workspace: &Path) -> LaunchSettings {
        let credential = if self.openai_key.trim().is_empty() {
            read_dotenv_credential(workspace)
        } else {
            Some(self.openai_key.trim().to_string())
        };

        LaunchSettings {
            interpreter: resolve_interpreter(workspace, &self.python_path),
            interpreter_args: vec!["-u".to_string()],
            entrypoint: PathBuf::from(&self.agent_path),
            visible: self.run_in_terminal,
            credential,
            auto_install: self.auto_install_deps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            python_path = "/opt/python/bin/python3"
            agent_path = "bot/main.py"
            run_in_terminal = true
            auto_install_deps = false
            workspaces = ["~/projects/one", "/srv/two"]
            stop_timeout_secs = 5

            [preflight]
            packages = ["requests"]
        "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.python_path, "/opt/python/bin/python3");
        assert_eq!(config.agent_path, "bot/main.py");
        assert!(config.run_in_terminal);
        assert!(!config.auto_install_deps);
        assert_eq!(config.stop_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.preflight.packages, vec!["requests".to_string()]);
        assert_eq!(config.preflight.manifest, DEFAULT_MANIFEST);
    }

    #[test]
    fn test_defaults_when_fields_missing() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "workspaces = []").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.agent_path, DEFAULT_AGENT_PATH);
        assert!(config.auto_install_deps);
        assert!(!config.run_in_terminal);
        assert_eq!(config.stop_timeout(), None);
        assert_eq!(config.preflight, PreflightConfig::default());
        assert_eq!(config.socket_path(), PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.agent_path, DEFAULT_AGENT_PATH);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "workspaces = [").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vani.toml");

        let config = Config {
            workspaces: vec!["/srv/agent".to_string()],
            stop_timeout_secs: Some(3),
            ..Config::default()
        };

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.workspaces, config.workspaces);
        assert_eq!(loaded.stop_timeout_secs, Some(3));
        assert_eq!(loaded.preflight, config.preflight);
    }

    #[test]
    fn test_workspace_expansion() {
        let config = Config {
            workspaces: vec!["~/agents".to_string()],
            ..Config::default()
        };

        let expanded = config.workspaces_expanded();
        assert!(!expanded[0].to_string_lossy().contains('~'));
    }

    #[test]
    fn test_check_args_from_packages() {
        let preflight = PreflightConfig::default();
        assert_eq!(
            preflight.check_args(),
            vec![
                "-c".to_string(),
                "import soundfile, sounddevice, numpy; print(\"ok\")".to_string()
            ]
        );
    }

    #[test]
    fn test_check_args_override() {
        let preflight = PreflightConfig {
            check_args: Some(vec!["-c".to_string(), "exit 0".to_string()]),
            ..PreflightConfig::default()
        };
        assert_eq!(preflight.check_args()[1], "exit 0");
    }

    #[test]
    fn test_launch_for_prefers_configured_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "OPENAI_API_KEY=from-dotenv\n").unwrap();

        let config = Config {
            openai_key: "from-config".to_string(),
            ..Config::default()
        };
        let launch = config.launch_for(dir.path());
        assert_eq!(launch.credential.as_deref(), Some("from-config"));
        assert_eq!(launch.entrypoint, PathBuf::from(DEFAULT_AGENT_PATH));
        assert_eq!(launch.interpreter_args, vec!["-u".to_string()]);
        assert!(launch.auto_install);
    }

    #[test]
    fn test_launch_for_falls_back_to_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "OPENAI_API_KEY=\"from-dotenv\"\n").unwrap();

        let launch = Config::default().launch_for(dir.path());
        assert_eq!(launch.credential.as_deref(), Some("from-dotenv"));
    }
}
