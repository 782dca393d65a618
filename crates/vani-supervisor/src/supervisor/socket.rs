// ABOUTME: Unix socket API for controlling a running supervisor.
// ABOUTME: Newline-delimited JSON requests in, one JSON response line out per request.

use crate::session::SessionStatus;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "list")]
    List,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "start")]
    Start { workspace: PathBuf },
    #[serde(rename = "stop")]
    Stop { workspace: PathBuf },
    #[serde(rename = "stop_all")]
    StopAll,
    #[serde(rename = "logs")]
    Logs { workspace: PathBuf, lines: usize },
    #[serde(rename = "shutdown")]
    Shutdown,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<usize>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Turn a failed response into an error.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(self
                .error
                .unwrap_or_else(|| "Request failed".to_string())))
        }
    }
}

/// Commands sent to the supervisor loop from socket handlers
#[derive(Debug)]
pub enum SocketCommand {
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
    Status {
        reply: oneshot::Sender<Vec<SessionStatus>>,
    },
    Start {
        workspace: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        workspace: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    StopAll {
        reply: oneshot::Sender<usize>,
    },
    Logs {
        workspace: PathBuf,
        lines: usize,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

pub async fn run_socket_server(path: PathBuf, cmd_tx: mpsc::Sender<SocketCommand>) -> Result<()> {
    // Stale socket from a previous run
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)
        .with_context(|| format!("Failed to bind socket {}", path.display()))?;
    tracing::info!(path = %path.display(), "Socket server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, cmd_tx).await {
                tracing::warn!(error = %e, "Socket connection error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, cmd_tx: mpsc::Sender<SocketCommand>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                tracing::debug!(?request, "Socket request");
                handle_request(request, &cmd_tx).await
            }
            Err(e) => Response::error(format!("Invalid request: {e}")),
        };
        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

/// Send one command and wait for its reply.
async fn ask<T>(
    cmd_tx: &mpsc::Sender<SocketCommand>,
    command: impl FnOnce(oneshot::Sender<T>) -> SocketCommand,
) -> Result<T, Response> {
    let (reply, rx) = oneshot::channel();
    if cmd_tx.send(command(reply)).await.is_err() {
        return Err(Response::error("Supervisor unavailable"));
    }
    rx.await.map_err(|_| Response::error("No response"))
}

async fn handle_request(request: Request, cmd_tx: &mpsc::Sender<SocketCommand>) -> Response {
    let outcome = match request {
        Request::List => ask(cmd_tx, |reply| SocketCommand::List { reply })
            .await
            .map(|workspaces| Response {
                workspaces: Some(workspaces),
                ..Response::ok()
            }),
        Request::Status => ask(cmd_tx, |reply| SocketCommand::Status { reply })
            .await
            .map(|sessions| Response {
                sessions: Some(sessions),
                ..Response::ok()
            }),
        Request::Start { workspace } => {
            ask(cmd_tx, |reply| SocketCommand::Start { workspace, reply })
                .await
                .map(unit_response)
        }
        Request::Stop { workspace } => {
            ask(cmd_tx, |reply| SocketCommand::Stop { workspace, reply })
                .await
                .map(unit_response)
        }
        Request::StopAll => ask(cmd_tx, |reply| SocketCommand::StopAll { reply })
            .await
            .map(|stopped| Response {
                stopped: Some(stopped),
                ..Response::ok()
            }),
        Request::Logs { workspace, lines } => ask(cmd_tx, |reply| SocketCommand::Logs {
            workspace,
            lines,
            reply,
        })
        .await
        .map(|result| match result {
            Ok(lines) => Response {
                lines: Some(lines),
                ..Response::ok()
            },
            Err(e) => Response::error(e.to_string()),
        }),
        Request::Shutdown => ask(cmd_tx, |reply| SocketCommand::Shutdown { reply })
            .await
            .map(|stopped| Response {
                stopped: Some(stopped),
                ..Response::ok()
            }),
    };

    outcome.unwrap_or_else(|failure| failure)
}

fn unit_response(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => Response::error(e.to_string()),
    }
}

/// Client side of the socket, one connection per request.
#[derive(Debug, Clone)]
pub struct SocketClient {
    path: PathBuf,
}

impl SocketClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn request(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.path).await.with_context(|| {
            format!(
                "Failed to connect to supervisor at {} (is `vani supervise` running?)",
                self.path.display()
            )
        })?;
        let (reader, mut writer) = stream.into_split();

        let request_json = serde_json::to_string(request)? + "\n";
        writer.write_all(request_json.as_bytes()).await?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.is_empty() {
            anyhow::bail!("Supervisor closed the connection without responding");
        }

        let response: Response = serde_json::from_str(&line)?;
        Ok(response)
    }
}
