// ABOUTME: Spawns child processes and turns their lifecycle into a stream of events.
// ABOUTME: Output chunks arrive in emission order, followed by exactly one exit event.

use crate::sink::OutputSink;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Exit code recorded when a worker could not be launched at all.
pub const SPAWN_FAILURE_CODE: i32 = -1;

const READ_BUFFER_SIZE: usize = 8192;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long shutdown waits for a SIGTERM'd process that has no kill deadline.
const SIGNAL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Slack on top of a graceful stop timeout, covering the kill and the reap.
const KILL_MARGIN: Duration = Duration::from_secs(1);

/// Program, arguments, working directory and environment overlay for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Shell-quoted form, suitable for typing into a terminal.
    pub fn command_line(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// How a process ended: exit code, terminating signal, or both absent when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn spawn_failure() -> Self {
        Self {
            code: Some(SPAWN_FAILURE_CODE),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "code={code}")?,
            None => write!(f, "code=null")?,
        }
        if let Some(signal) = self.signal {
            write!(f, ", signal={}", signal_name(signal))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGALRM => "SIGALRM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGSYS => "SIGSYS",
        _ => return format!("SIG{signal}"),
    };
    name.to_string()
}

#[cfg(not(unix))]
pub fn signal_name(signal: i32) -> String {
    format!("SIG{signal}")
}

/// What happens after a stop request is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Send SIGTERM and never escalate.
    #[default]
    Signal,
    /// Send SIGTERM, then SIGKILL if the process is still alive after `timeout`.
    Graceful { timeout: Duration },
}

impl StopPolicy {
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Self::Graceful { timeout },
            None => Self::Signal,
        }
    }

    /// How long a shutdown waits for processes stopped under this policy.
    pub fn shutdown_grace(&self) -> Duration {
        match self {
            Self::Signal => SIGNAL_SHUTDOWN_GRACE,
            Self::Graceful { timeout } => *timeout + KILL_MARGIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { stream: OutputStream, text: String },
    /// Sent once, after both output pipes are drained.
    Exited(ExitReport),
}

/// Resolves once the watcher has reaped the process.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitReport>>,
}

impl ExitWatch {
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The exit report, or `None` if the watcher was dropped first.
    pub async fn wait(mut self) -> Option<ExitReport> {
        self.rx.wait_for(Option::is_some).await.ok().and_then(|report| *report)
    }
}

/// Control side of a spawned process.
pub struct WorkerHandle {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<StopPolicy>>,
    exit: ExitWatch,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Ask the watcher to stop the process. False if it had already exited.
    pub fn stop(mut self, policy: StopPolicy) -> bool {
        self.stop_tx
            .take()
            .map(|tx| tx.send(policy).is_ok())
            .unwrap_or(false)
    }
}

/// Event side of a spawned process.
pub struct ProcessEvents {
    rx: mpsc::Receiver<ProcessEvent>,
}

impl ProcessEvents {
    /// Next event; `None` once the exit event has been consumed.
    pub async fn next(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

/// Spawn a process with piped stdout/stderr. Must be called inside a tokio runtime.
pub fn spawn_worker(spec: &CommandSpec) -> io::Result<(WorkerHandle, ProcessEvents)> {
    let mut child = spec
        .command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let pid = child.id();

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_output(
            stdout,
            OutputStream::Stdout,
            tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_output(
            stderr,
            OutputStream::Stderr,
            tx.clone(),
        )));
    }

    let (stop_tx, stop_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(watch_child(child, stop_rx, readers, tx, exit_tx));

    Ok((
        WorkerHandle {
            pid,
            stop_tx: Some(stop_tx),
            exit: ExitWatch { rx: exit_rx },
        },
        ProcessEvents { rx },
    ))
}

async fn watch_child(
    mut child: Child,
    stop_rx: oneshot::Receiver<StopPolicy>,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<ProcessEvent>,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(policy) = stop_rx => stop_child(&mut child, policy).await,
    };

    for reader in readers {
        let _ = reader.await;
    }

    let report = match status {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to collect exit status");
            ExitReport {
                code: None,
                signal: None,
            }
        }
    };
    exit_tx.send_replace(Some(report));
    let _ = tx.send(ProcessEvent::Exited(report)).await;
}

async fn stop_child(child: &mut Child, policy: StopPolicy) -> io::Result<ExitStatus> {
    if let Err(e) = terminate(child) {
        tracing::warn!(pid = ?child.id(), error = %e, "Failed to signal process");
    }
    match policy {
        StopPolicy::Signal => child.wait().await,
        StopPolicy::Graceful { timeout } => {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(pid = ?child.id(), ?timeout, "Process ignored stop signal, killing");
                    child.kill().await?;
                    child.wait().await
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    // Already reaped
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: `pid` is our own child and has not been reaped, so it cannot have been reused.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

async fn forward_output<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Chunks::default();
    // Keep draining after the receiver goes away so the child never blocks on a full pipe.
    let mut open = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(?stream, error = %e, "Output read failed");
                break;
            }
        };
        let text = decoder.push(&buf[..n]);
        if open && !text.is_empty() {
            open = tx.send(ProcessEvent::Output { stream, text }).await.is_ok();
        }
    }

    let rest = decoder.finish();
    if open && !rest.is_empty() {
        let _ = tx.send(ProcessEvent::Output { stream, text: rest }).await;
    }
}

/// Decodes UTF-8 across read boundaries, holding back an incomplete trailing sequence.
#[derive(Debug, Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Splits a chunked stream into complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        (!self.partial.is_empty()).then(|| std::mem::take(&mut self.partial))
    }
}

/// Run to completion with output discarded.
pub async fn run_to_exit(spec: &CommandSpec) -> io::Result<ExitReport> {
    let status = spec
        .command()
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(ExitReport::from_status(status))
}

/// Run to completion, forwarding stdout and stderr to `sink` one line at a time.
pub async fn run_streaming(spec: &CommandSpec, sink: &dyn OutputSink) -> io::Result<ExitReport> {
    let (_handle, mut events) = spawn_worker(spec)?;
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();

    while let Some(event) = events.next().await {
        match event {
            ProcessEvent::Output { stream, text } => {
                let buffer = match stream {
                    OutputStream::Stdout => &mut stdout,
                    OutputStream::Stderr => &mut stderr,
                };
                for line in buffer.push(&text) {
                    sink.append_line(&line);
                }
            }
            ProcessEvent::Exited(report) => {
                for line in [stdout.finish(), stderr.finish()].into_iter().flatten() {
                    sink.append_line(&line);
                }
                return Ok(report);
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        "process watcher stopped without an exit status",
    ))
}
