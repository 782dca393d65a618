// ABOUTME: Shared types and configuration for the vani supervisor.
// ABOUTME: Contains config parsing and per-workspace launch resolution.

pub mod config;
pub mod launch;

pub use config::{Config, PreflightConfig};
pub use launch::{
    read_dotenv_credential, resolve_interpreter, LaunchSettings, CREDENTIAL_ENV_VAR,
};
