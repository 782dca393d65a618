// ABOUTME: Output sinks: named, appendable text streams bound to a workspace.
// ABOUTME: CapturingSink buffers worker output; TerminalSink forwards lines to a shell as commands.

use crate::key::WorkspaceKey;
use crate::supervisor::spawn::ExitReport;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};

/// Most recent output kept by a capturing sink.
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

/// Destination for one workspace's output.
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &str;

    fn clear(&self);

    /// Append text as-is, without adding a newline.
    fn append(&self, text: &str);

    fn append_line(&self, text: &str) {
        self.append(&format!("{text}\n"));
    }

    fn show(&self, focus: bool);
}

#[derive(Default)]
struct Capture {
    buffer: String,
    echo: bool,
    focused: bool,
    /// Echoed output not yet terminated by a newline
    partial: String,
}

/// Buffers output in memory. Once shown, complete lines are also echoed to
/// stderr as `[name] line`, so concurrent workspaces never split each other's lines.
pub struct CapturingSink {
    name: String,
    limit: usize,
    echo_on_show: bool,
    capture: Mutex<Capture>,
}

impl CapturingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limit: DEFAULT_CAPTURE_LIMIT,
            echo_on_show: true,
            capture: Mutex::new(Capture::default()),
        }
    }

    /// Never echo to stderr, even when shown.
    pub fn silent(mut self) -> Self {
        self.echo_on_show = false;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Capture> {
        self.capture.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contents(&self) -> String {
        self.lock().buffer.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().buffer.lines().map(String::from).collect()
    }

    /// Last `n` lines of the buffer.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines();
        let skip = lines.len().saturating_sub(n);
        lines.into_iter().skip(skip).collect()
    }

    pub fn is_shown(&self) -> bool {
        let capture = self.lock();
        capture.echo || capture.focused
    }

    fn echo_lines(&self, capture: &mut Capture, text: &str) {
        capture.partial.push_str(text);
        while let Some(idx) = capture.partial.find('\n') {
            let line: String = capture.partial.drain(..=idx).collect();
            eprintln!("[{}] {}", self.name, line.trim_end_matches(['\n', '\r']));
        }
    }
}

/// Drop the oldest text so at most `limit` bytes remain, cutting at a line start when possible.
fn trim_front(buffer: &mut String, limit: usize) {
    if buffer.len() <= limit {
        return;
    }
    let mut cut = buffer.len() - limit;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    let cut = match buffer[cut..].find('\n') {
        Some(nl) if cut + nl + 1 < buffer.len() => cut + nl + 1,
        _ => cut,
    };
    buffer.drain(..cut);
}

impl OutputSink for CapturingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear(&self) {
        let mut capture = self.lock();
        capture.buffer.clear();
        capture.partial.clear();
    }

    fn append(&self, text: &str) {
        let mut capture = self.lock();
        capture.buffer.push_str(text);
        trim_front(&mut capture.buffer, self.limit);
        if capture.echo {
            self.echo_lines(&mut capture, text);
        }
    }

    fn show(&self, focus: bool) {
        let mut capture = self.lock();
        capture.echo = self.echo_on_show;
        capture.focused |= focus;
    }
}

/// A visible terminal: a shell with inherited stdout/stderr whose stdin receives
/// every appended line as a command. Output is not captured.
///
/// A background task owns the shell. It writes queued commands, closes stdin once
/// the sink is closed or dropped, then reaps the shell. Must be opened inside a
/// tokio runtime.
pub struct TerminalSink {
    name: String,
    pid: Option<u32>,
    commands: Mutex<Option<mpsc::UnboundedSender<String>>>,
    exited: watch::Receiver<Option<ExitReport>>,
}

impl TerminalSink {
    pub fn open(
        name: impl Into<String>,
        shell: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> io::Result<Self> {
        let mut child = Command::new(shell)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::piped())
            .spawn()?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let name = name.into();
        tracing::debug!(terminal = %name, pid = ?pid, "Opened terminal");

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(None);
        tokio::spawn(drive_terminal(
            name.clone(),
            child,
            stdin,
            commands_rx,
            exited_tx,
        ));

        Ok(Self {
            name,
            pid,
            commands: Mutex::new(Some(commands_tx)),
            exited: exited_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stop sending commands; the shell exits once the queued ones finish.
    pub fn close(&self) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Close stdin and wait for the shell to be reaped.
    pub async fn wait(&self) -> Option<ExitReport> {
        self.close();
        let mut exited = self.exited.clone();
        exited
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|report| *report)
    }
}

async fn drive_terminal(
    name: String,
    mut child: Child,
    mut stdin: Option<ChildStdin>,
    mut commands: mpsc::UnboundedReceiver<String>,
    exited: watch::Sender<Option<ExitReport>>,
) {
    while let Some(text) = commands.recv().await {
        let Some(pipe) = stdin.as_mut() else {
            continue;
        };
        let written = match pipe.write_all(text.as_bytes()).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(terminal = %name, error = %e, "Failed to write to terminal");
            stdin = None;
        }
    }

    drop(stdin);
    let report = match child.wait().await {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => {
            tracing::warn!(terminal = %name, error = %e, "Failed to reap terminal");
            ExitReport {
                code: None,
                signal: None,
            }
        }
    };
    tracing::debug!(terminal = %name, %report, "Terminal exited");
    exited.send_replace(Some(report));
}

impl OutputSink for TerminalSink {
    fn name(&self) -> &str {
        &self.name
    }

    // A terminal's scrollback is not ours to clear.
    fn clear(&self) {}

    fn append(&self, text: &str) {
        let commands = self.commands.lock().unwrap_or_else(|e| e.into_inner());
        let queued = commands
            .as_ref()
            .is_some_and(|tx| tx.send(text.to_string()).is_ok());
        if !queued {
            tracing::warn!(terminal = %self.name, "Terminal closed, dropping command");
        }
    }

    fn show(&self, focus: bool) {
        tracing::debug!(terminal = %self.name, focus, "Terminal shown");
    }
}

/// Hands out sinks for workspaces.
pub trait SinkProvider: Send + Sync {
    /// The capturing sink for `key`. The same key always gets the same sink.
    fn output(&self, key: &WorkspaceKey) -> Arc<dyn OutputSink>;

    /// A fresh visible terminal rooted at the workspace.
    fn terminal(
        &self,
        key: &WorkspaceKey,
        env: &HashMap<String, String>,
    ) -> io::Result<Arc<dyn OutputSink>>;
}

/// Capturing sinks kept per workspace, terminals spawned through `shell`.
pub struct ConsoleSinks {
    shell: String,
    echo: bool,
    outputs: Mutex<HashMap<WorkspaceKey, Arc<CapturingSink>>>,
}

impl ConsoleSinks {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            echo: true,
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Capturing sinks never echo to stderr.
    pub fn silent(mut self) -> Self {
        self.echo = false;
        self
    }

    /// The capturing sink for `key`, if one was ever handed out.
    pub fn captured(&self, key: &WorkspaceKey) -> Option<Arc<CapturingSink>> {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn capturing(&self, key: &WorkspaceKey) -> Arc<CapturingSink> {
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs
            .entry(key.clone())
            .or_insert_with(|| {
                let sink = CapturingSink::new(key.sink_name());
                Arc::new(if self.echo { sink } else { sink.silent() })
            })
            .clone()
    }
}

impl SinkProvider for ConsoleSinks {
    fn output(&self, key: &WorkspaceKey) -> Arc<dyn OutputSink> {
        self.capturing(key)
    }

    fn terminal(
        &self,
        key: &WorkspaceKey,
        env: &HashMap<String, String>,
    ) -> io::Result<Arc<dyn OutputSink>> {
        let terminal = TerminalSink::open(key.sink_name(), &self.shell, key.as_path(), env)?;
        Ok(Arc::new(terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_append_line() {
        let sink = CapturingSink::new("Vani Agent: ws1").silent();
        sink.append("partial ");
        sink.append_line("line");
        sink.append_line("second");
        assert_eq!(sink.contents(), "partial line\nsecond\n");
        assert_eq!(sink.lines(), vec!["partial line", "second"]);
    }

    #[test]
    fn test_clear_empties_buffer() {
        let sink = CapturingSink::new("s").silent();
        sink.append_line("old run");
        sink.clear();
        sink.append_line("new run");
        assert_eq!(sink.lines(), vec!["new run"]);
    }

    #[test]
    fn test_tail_returns_last_lines() {
        let sink = CapturingSink::new("s").silent();
        for i in 0..5 {
            sink.append_line(&format!("line {i}"));
        }
        assert_eq!(sink.tail(2), vec!["line 3", "line 4"]);
        assert_eq!(sink.tail(10).len(), 5);
    }

    #[test]
    fn test_limit_trims_oldest_lines() {
        let sink = CapturingSink::new("s").silent().with_limit(12);
        sink.append_line("aaaaa");
        sink.append_line("bbbbb");
        sink.append_line("ccccc");
        assert_eq!(sink.lines(), vec!["ccccc"]);
    }

    #[test]
    fn test_trim_front_respects_char_boundaries() {
        let mut buffer = "ééééé".to_string();
        trim_front(&mut buffer, 3);
        assert!(buffer.len() <= 4);
        assert!(buffer.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_show_marks_sink_visible() {
        let sink = CapturingSink::new("s").silent();
        assert!(!sink.is_shown());
        sink.show(true);
        assert!(sink.is_shown());
    }

    #[test]
    fn test_console_sinks_reuse_sink_per_key() {
        let sinks = ConsoleSinks::new("sh").silent();
        let key = WorkspaceKey::new("/tmp/ws1");
        let first = sinks.output(&key);
        first.append_line("hello");
        let second = sinks.output(&key);
        assert_eq!(second.name(), "Vani Agent: ws1");
        assert_eq!(sinks.captured(&key).unwrap().lines(), vec!["hello"]);
        assert!(sinks.captured(&WorkspaceKey::new("/tmp/other")).is_none());
    }

    #[tokio::test]
    async fn test_terminal_runs_appended_commands() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("VANI_TEST_VALUE".to_string(), "forwarded".to_string())]);
        let terminal = TerminalSink::open("term", "sh", dir.path(), &env).unwrap();

        terminal.append_line("printf '%s' \"$VANI_TEST_VALUE\" > marker.txt");
        let report = terminal.wait().await.unwrap();

        assert!(report.success());
        let marker = std::fs::read_to_string(dir.path().join("marker.txt")).unwrap();
        assert_eq!(marker, "forwarded");
    }

    #[tokio::test]
    async fn test_terminal_drops_commands_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = TerminalSink::open("term", "sh", dir.path(), &HashMap::new()).unwrap();
        terminal.close();
        terminal.append_line("touch late.txt");
        terminal.wait().await.unwrap();
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn test_terminal_append_does_not_block_on_busy_shell() {
        let dir = tempfile::tempdir().unwrap();
        let terminal = TerminalSink::open("term", "sh", dir.path(), &HashMap::new()).unwrap();
        terminal.append_line("sleep 1");
        // Far more than a pipe buffer holds while the shell is busy.
        let filler = format!(": {}", "x".repeat(64 * 1024));
        let started = std::time::Instant::now();
        for _ in 0..8 {
            terminal.append_line(&filler);
        }
        terminal.append_line("touch done.txt");
        assert!(started.elapsed() < std::time::Duration::from_millis(500));

        terminal.wait().await.unwrap();
        assert!(dir.path().join("done.txt").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_terminals_are_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let mut pids = Vec::new();
        for _ in 0..3 {
            let terminal = TerminalSink::open("term", "sh", dir.path(), &HashMap::new()).unwrap();
            pids.push(terminal.pid().unwrap());
            terminal.append_line("true");
        }

        // A reaped process has no /proc entry; a zombie keeps one.
        for pid in pids {
            let entry = std::path::PathBuf::from(format!("/proc/{pid}"));
            let mut reaped = false;
            for _ in 0..200 {
                if !entry.exists() {
                    reaped = true;
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
            assert!(reaped, "terminal shell {pid} was never reaped");
        }
    }
}
