// ABOUTME: vani CLI entry point.
// ABOUTME: Runs the supervisor daemon or talks to a running one over its socket.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use vani_supervisor::{run_init, run_supervisor, Config, Request, SocketClient, SupervisorOptions};

#[derive(Parser)]
#[command(name = "vani")]
#[command(about = "Run and supervise Vani voice agents, one per workspace")]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "VANI_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file interactively
    Init,
    /// Run the supervisor daemon
    Supervise {
        /// Workspaces to start (defaults to the configured list)
        workspaces: Vec<PathBuf>,
        /// Keep agent output off stderr
        #[arg(long)]
        quiet: bool,
        /// Write logs to the vani log file instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Start the agent in a workspace
    Start {
        #[arg(default_value = ".")]
        workspace: PathBuf,
    },
    /// Stop the agent in a workspace, or every agent
    Stop {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        workspace: Option<PathBuf>,
        #[arg(long)]
        all: bool,
    },
    /// List workspaces with a running agent
    List,
    /// Show every running session
    Status,
    /// Show recent agent output for a workspace
    Logs {
        #[arg(default_value = ".")]
        workspace: PathBuf,
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },
    /// Stop every agent and exit the supervisor
    Shutdown,
}

/// Client requests carry absolute paths; the daemon may run elsewhere.
fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

async fn send(config_path: Option<&Path>, request: Request) -> Result<vani_supervisor::Response> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;
    let client = SocketClient::new(config.socket_path());
    client.request(&request).await?.into_result()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match &cli.command {
        Commands::Supervise { log_file: true, .. } => vani_log::init_file("supervisor", cli.verbose),
        _ => vani_log::init(cli.verbose),
    }

    match cli.command {
        Commands::Init => run_init(config),
        Commands::Supervise {
            workspaces,
            quiet,
            log_file: _,
        } => {
            run_supervisor(SupervisorOptions {
                config_path: cli.config.clone(),
                workspaces,
                quiet,
            })
            .await
        }
        Commands::Start { workspace } => {
            let workspace = absolute(&workspace);
            send(config, Request::Start {
                workspace: workspace.clone(),
            })
            .await?;
            println!("Started agent in {}", workspace.display());
            Ok(())
        }
        Commands::Stop { all: true, .. } => {
            let response = send(config, Request::StopAll).await?;
            println!("Stopped {} agent(s)", response.stopped.unwrap_or(0));
            Ok(())
        }
        Commands::Stop { workspace, .. } => {
            let workspace = absolute(&workspace.unwrap_or_else(|| PathBuf::from(".")));
            send(config, Request::Stop {
                workspace: workspace.clone(),
            })
            .await?;
            println!("Sent stop signal to {}", workspace.display());
            Ok(())
        }
        Commands::List => {
            let response = send(config, Request::List).await?;
            let workspaces = response.workspaces.unwrap_or_default();
            if workspaces.is_empty() {
                println!("No agents running");
            }
            for workspace in workspaces {
                println!("{}", workspace);
            }
            Ok(())
        }
        Commands::Status => {
            let response = send(config, Request::Status).await?;
            let sessions = response.sessions.unwrap_or_default();
            if sessions.is_empty() {
                println!("No agents running");
            }
            for session in sessions {
                let pid = session
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<8} {}  {}  (since {})",
                    session.state,
                    pid,
                    session.workspace,
                    session.session_id,
                    session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Ok(())
        }
        Commands::Logs { workspace, lines } => {
            let response = send(config, Request::Logs {
                workspace: absolute(&workspace),
                lines,
            })
            .await?;
            for line in response.lines.unwrap_or_default() {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Shutdown => {
            let response = send(config, Request::Shutdown).await?;
            println!(
                "Supervisor shutting down, stopped {} agent(s)",
                response.stopped.unwrap_or(0)
            );
            Ok(())
        }
    }
}
