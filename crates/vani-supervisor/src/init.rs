// ABOUTME: Bootstrap wizard for vani configuration.
// ABOUTME: Prompts for interpreter, agent script, workspaces and run mode, then writes the config file.

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::path::Path;
use vani_core::Config;

fn prompt(input: &mut impl BufRead, out: &mut impl Write, message: &str, default: &str) -> Result<String> {
    if default.is_empty() {
        write!(out, "{}: ", message)?;
    } else {
        write!(out, "{} [{}]: ", message, default)?;
    }
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    let line = line.trim();
    if line.is_empty() {
        Ok(default.to_string())
    } else {
        Ok(line.to_string())
    }
}

fn prompt_bool(input: &mut impl BufRead, out: &mut impl Write, message: &str, default: bool) -> Result<bool> {
    let hint = if default { "Y/n" } else { "y/N" };
    let answer = prompt(input, out, &format!("{} ({})", message, hint), "")?;
    parse_bool(&answer, default)
}

fn parse_bool(answer: &str, default: bool) -> Result<bool> {
    match answer.to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "y" | "yes" | "true" => Ok(true),
        "n" | "no" | "false" => Ok(false),
        other => anyhow::bail!("Expected yes or no, got {:?}", other),
    }
}

/// Comma separated list, blanks dropped.
fn parse_list(answer: &str) -> Vec<String> {
    answer
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Ask every question, starting from `existing` for defaults.
fn build_config(input: &mut impl BufRead, out: &mut impl Write, existing: Config) -> Result<Config> {
    let python_path = prompt(
        input,
        out,
        "Python interpreter (blank to prefer a workspace venv)",
        &existing.python_path,
    )?;
    let agent_path = prompt(input, out, "Agent script", &existing.agent_path)?;
    let workspaces = prompt(
        input,
        out,
        "Workspaces (comma separated)",
        &existing.workspaces.join(", "),
    )?;
    let run_in_terminal = prompt_bool(
        input,
        out,
        "Run agents in a visible terminal",
        existing.run_in_terminal,
    )?;
    let auto_install_deps = prompt_bool(
        input,
        out,
        "Install requirements.txt before starting",
        existing.auto_install_deps,
    )?;

    Ok(Config {
        python_path,
        agent_path,
        workspaces: parse_list(&workspaces),
        run_in_terminal,
        auto_install_deps,
        ..existing
    })
}

pub fn run_init(config_path: Option<&Path>) -> Result<()> {
    println!("vani initialization\n");

    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);
    let existing = Config::load_or_default(&config_path)?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut config = build_config(&mut stdin.lock(), &mut stdout, existing)?;

    if config.openai_key.is_empty() && std::env::var(vani_core::CREDENTIAL_ENV_VAR).is_err() {
        println!(
            "\nNo {} found. Put it in each workspace's .env or enter it here.",
            vani_core::CREDENTIAL_ENV_VAR
        );
        config.openai_key = prompt(&mut stdin.lock(), &mut stdout, "API key (blank to skip)", "")?;
    }

    config
        .save(&config_path)
        .context("Failed to save configuration")?;
    println!("\nConfig written to {}", config_path.display());

    for workspace in config.workspaces_expanded() {
        if !workspace.join(&config.agent_path).is_file() {
            println!(
                "Note: {} has no {} yet",
                workspace.display(),
                config.agent_path
            );
        }
    }

    println!("\nReady to run: vani supervise");

    Ok(())
}
