//! Agent process management

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agtop_core::buffer::RunLogs;
use agtop_core::run::{AgentRuntime, RunStore};

use crate::error::{Result, SupervisorError};
use crate::event::{Completion, OutputEvent, OutputStream, ProcessOutcome};
use crate::parser::{OutputParser, PlainParser};
use crate::signal;

/// How long readers may keep draining after the process exits
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Fully resolved command line for one agent subprocess
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Build the invocation for `runtime`, with the prompt as the last argument
    pub fn for_runtime(
        runtime: &AgentRuntime,
        program: &str,
        model: Option<&str>,
        prompt: &str,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut args = runtime.args(model);
        args.push(prompt.to_string());
        Self {
            program: program.to_string(),
            args,
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line as shown to the user; the prompt argument is elided
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let shown = self.args.len().saturating_sub(1);
        parts.extend(self.args.iter().take(shown).cloned());
        if !self.args.is_empty() {
            parts.push("<prompt>".to_string());
        }
        parts.join(" ")
    }
}

/// Where a run's output goes while a skill executes
#[derive(Clone)]
pub struct OutputSink {
    pub run_id: String,
    pub skill: String,
    pub store: RunStore,
    pub logs: Arc<RunLogs>,
    /// Raised on the first line read from either stream
    pub output_seen: Arc<AtomicBool>,
    pub stdout_log: Option<PathBuf>,
    pub stderr_log: Option<PathBuf>,
}

impl OutputSink {
    async fn apply(&self, event: OutputEvent, completion: &mut Option<Completion>) {
        match event {
            OutputEvent::Raw(line) => self.logs.push_line(&line),
            OutputEvent::Message(message) => self.logs.push_event(&self.skill, &message),
            OutputEvent::Detail(detail) => self.logs.push_detail(&detail),
            OutputEvent::Usage {
                tokens_in,
                tokens_out,
                cost,
            } => {
                if let Err(e) = self
                    .store
                    .append_cost(&self.run_id, &self.skill, tokens_in, tokens_out, cost)
                    .await
                {
                    warn!(run_id = %self.run_id, "Failed to record usage: {}", e);
                }
            }
            OutputEvent::Completed { success, summary } => {
                *completion = Some(Completion { success, summary });
            }
        }
    }
}

/// Represents a spawned agent process
pub struct AgentProcess {
    child: Child,
    pid: i32,
}

impl AgentProcess {
    /// Spawn a new agent process in `spec.working_dir`
    pub fn spawn(spec: &CommandSpec) -> Result<Self> {
        info!("Spawning {} in {:?}", spec.display(), spec.working_dir);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(SupervisorError::Incomplete("pid"))?;

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Start one reader per output stream
    pub fn start_output_reader(
        mut self,
        sink: OutputSink,
        parser: Box<dyn OutputParser>,
    ) -> Result<OutputReaderHandle> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(SupervisorError::Incomplete("stdout pipe"))?;

        let stderr = self
            .child
            .stderr
            .take()
            .ok_or(SupervisorError::Incomplete("stderr pipe"))?;

        let logs = Arc::clone(&sink.logs);
        let stdout_sink = sink.clone();
        let stdout_handle = tokio::spawn(async move {
            let log = stdout_sink.stdout_log.clone();
            read_stream(stdout, OutputStream::Stdout, parser, stdout_sink, log).await
        });

        let stderr_handle = tokio::spawn(async move {
            // Stderr is never structured
            let log = sink.stderr_log.clone();
            read_stream(stderr, OutputStream::Stderr, Box::new(PlainParser), sink, log).await;
        });

        Ok(OutputReaderHandle {
            child: self.child,
            pid: self.pid,
            logs,
            stdout_handle,
            stderr_handle,
        })
    }
}

/// Handle for a running process and its reader tasks
pub struct OutputReaderHandle {
    child: Child,
    pid: i32,
    logs: Arc<RunLogs>,
    stdout_handle: JoinHandle<Option<Completion>>,
    stderr_handle: JoinHandle<()>,
}

impl OutputReaderHandle {
    /// Get the process ID
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Wait for the process to complete
    pub async fn wait(mut self) -> Result<ProcessOutcome> {
        let status = self.child.wait().await?;
        Ok(self.finish(status).await)
    }

    /// Wait for the process, or stop it when `cancel` fires.
    ///
    /// Cancellation sends a graceful termination signal and escalates to a
    /// kill once `grace` has passed. The flag is true when the process was
    /// stopped by cancellation.
    pub async fn wait_or_cancel(
        mut self,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<(ProcessOutcome, bool)> {
        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        match exited {
            Some(status) => Ok((self.finish(status?).await, false)),
            None => {
                let status = self.terminate(grace).await?;
                Ok((self.finish(status).await, true))
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        debug!(pid = self.pid, "Terminating agent process");
        if let Err(e) = signal::terminate(self.pid) {
            debug!("Graceful termination failed: {}", e);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(pid = self.pid, "Process ignored termination for {:?}, killing", grace);
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    /// Join the readers; anything still blocked after the drain window is
    /// aborted so no reader outlives its process.
    async fn finish(self, status: ExitStatus) -> ProcessOutcome {
        let Self {
            logs,
            stdout_handle,
            stderr_handle,
            ..
        } = self;

        let stdout_abort = stdout_handle.abort_handle();
        let completion = match tokio::time::timeout(READER_DRAIN, stdout_handle).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(e)) => {
                reader_failed(&logs, OutputStream::Stdout, &e);
                None
            }
            Err(_) => {
                warn!("stdout still open after exit, abandoning reader");
                stdout_abort.abort();
                None
            }
        };

        let stderr_abort = stderr_handle.abort_handle();
        match tokio::time::timeout(READER_DRAIN, stderr_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => reader_failed(&logs, OutputStream::Stderr, &e),
            Err(_) => {
                warn!("stderr still open after exit, abandoning reader");
                stderr_abort.abort();
            }
        }

        ProcessOutcome {
            exit_code: status.code(),
            completion,
        }
    }
}

/// Surface a reader task that died in the run's entry view
fn reader_failed(logs: &RunLogs, kind: OutputStream, error: &dyn std::fmt::Display) {
    warn!("{} reader failed: {}", kind.as_str(), error);
    logs.push_event("agtop", &format!("{} reader failed: {}", kind.as_str(), error));
}

async fn open_log(path: Option<&Path>) -> Option<File> {
    let path = path?;
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Cannot create log directory {:?}: {}", parent, e);
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Cannot open log file {:?}: {}", path, e);
            None
        }
    }
}

/// Copy one stream line by line into the run's buffers and its log file
async fn read_stream<R>(
    stream: R,
    kind: OutputStream,
    mut parser: Box<dyn OutputParser>,
    sink: OutputSink,
    log_path: Option<PathBuf>,
) -> Option<Completion>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut tee = open_log(log_path.as_deref()).await;
    let mut completion = None;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                sink.output_seen.store(true, Ordering::Relaxed);

                // Flushed per line so an aborted reader loses nothing
                let write_error = match tee.as_mut() {
                    Some(w) => match w.write_all(&buf).await {
                        Ok(()) => w.flush().await.err(),
                        Err(e) => Some(e),
                    },
                    None => None,
                };
                if let Some(e) = write_error {
                    warn!("Log write failed, disabling {} log: {}", kind.as_str(), e);
                    tee = None;
                }

                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                debug!(run_id = %sink.run_id, "{}: {}", kind.as_str(), line);

                for event in parser.parse(line) {
                    sink.apply(event, &mut completion).await;
                }
            }
            Err(e) => {
                warn!(run_id = %sink.run_id, "{} read failed: {}", kind.as_str(), e);
                sink.logs
                    .push_event("agtop", &format!("{} read error: {}", kind.as_str(), e));
                break;
            }
        }
    }

    completion
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::parser::create_parser;
    use agtop_core::run::Run;
    use agtop_core::ChangeNotifier;
    use tempfile::TempDir;

    fn sh(script: &str, dir: &Path) -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: dir.to_path_buf(),
            env: Vec::new(),
        }
    }

    async fn sink(dir: &Path) -> OutputSink {
        let store = RunStore::new();
        store.add(Run::with_id("p1", "test")).await.unwrap();
        OutputSink {
            run_id: "p1".to_string(),
            skill: "build".to_string(),
            store,
            logs: Arc::new(RunLogs::new(100, 100, ChangeNotifier::new())),
            output_seen: Arc::new(AtomicBool::new(false)),
            stdout_log: Some(dir.join("logs/p1.stdout.log")),
            stderr_log: Some(dir.join("logs/p1.stderr.log")),
        }
    }

    #[test]
    fn test_command_spec_for_runtime() {
        let spec = CommandSpec::for_runtime(
            &AgentRuntime::ClaudeCode,
            "claude",
            Some("sonnet"),
            "fix the bug",
            "/tmp",
        );
        assert_eq!(spec.args.last().map(String::as_str), Some("fix the bug"));
        assert_eq!(
            spec.display(),
            "claude -p --output-format stream-json --verbose --model sonnet <prompt>"
        );
    }

    #[tokio::test]
    async fn test_streams_into_buffers_and_logs() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path()).await;
        let logs = Arc::clone(&sink.logs);

        let process = AgentProcess::spawn(&sh("echo one; echo two; echo oops >&2; pwd", dir.path()))
            .unwrap();
        assert!(process.pid() > 0);
        let handle = process
            .start_output_reader(sink, Box::new(PlainParser))
            .unwrap();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.succeeded());

        let lines = logs.lines();
        let stdout: Vec<_> = lines.iter().filter(|l| *l != "oops").collect();
        assert_eq!(stdout[0], "one");
        assert_eq!(stdout[1], "two");
        assert!(stdout[2].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert!(lines.contains(&"oops".to_string()));

        let out = std::fs::read_to_string(dir.path().join("logs/p1.stdout.log")).unwrap();
        assert!(out.starts_with("one\ntwo\n"));
        let err = std::fs::read_to_string(dir.path().join("logs/p1.stderr.log")).unwrap();
        assert_eq!(err, "oops\n");
    }

    #[tokio::test]
    async fn test_structured_output_updates_store() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path()).await;
        let store = sink.store.clone();
        let logs = Arc::clone(&sink.logs);

        let script = r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"total_cost_usd":0.1,"usage":{"input_tokens":10,"output_tokens":5},"result":"ok"}'"#;
        let handle = AgentProcess::spawn(&sh(script, dir.path()))
            .unwrap()
            .start_output_reader(sink, create_parser(&AgentRuntime::ClaudeCode))
            .unwrap();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(
            outcome.completion,
            Some(Completion {
                success: true,
                summary: Some("ok".to_string())
            })
        );
        let run = store.get("p1").await.unwrap();
        assert_eq!(run.tokens(), 15);
        assert_eq!(run.skill_costs[0].name, "build");

        let entries = logs.entries();
        assert_eq!(entries[0].skill, "build");
        assert_eq!(entries[0].summary, "working");
    }

    /// Hands out one line, then fails like a broken pipe
    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.sent {
                return std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                )));
            }
            self.sent = true;
            buf.put_slice(b"partial line\n");
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_becomes_entry() {
        let dir = TempDir::new().unwrap();
        let sink = sink(dir.path()).await;
        let logs = Arc::clone(&sink.logs);
        let seen = Arc::clone(&sink.output_seen);

        let completion = read_stream(
            FailingReader { sent: false },
            OutputStream::Stderr,
            Box::new(PlainParser),
            sink,
            None,
        )
        .await;

        assert!(completion.is_none());
        assert!(seen.load(Ordering::Relaxed));
        assert!(logs.lines().contains(&"partial line".to_string()));
        let entry = logs.entries().into_iter().last().unwrap();
        assert_eq!(entry.skill, "agtop");
        assert_eq!(entry.summary, "stderr read error: pipe closed");
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let handle = AgentProcess::spawn(&sh("exit 7", dir.path()))
            .unwrap()
            .start_output_reader(sink(dir.path()).await, Box::new(PlainParser))
            .unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.exit_code, Some(7));
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let spec = CommandSpec {
            program: "/definitely/not/here".to_string(),
            args: vec![],
            working_dir: dir.path().to_path_buf(),
            env: vec![],
        };
        let err = AgentProcess::spawn(&spec).err().unwrap();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let handle = AgentProcess::spawn(&sh("trap '' TERM; echo ready; sleep 30", dir.path()))
            .unwrap()
            .start_output_reader(sink(dir.path()).await, Box::new(PlainParser))
            .unwrap();

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let (outcome, cancelled) = handle
            .wait_or_cancel(token, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(cancelled);
        assert_eq!(outcome.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_wait_or_cancel_without_cancel() {
        let dir = TempDir::new().unwrap();
        let handle = AgentProcess::spawn(&sh("echo hi", dir.path()))
            .unwrap()
            .start_output_reader(sink(dir.path()).await, Box::new(PlainParser))
            .unwrap();
        let (outcome, cancelled) = handle
            .wait_or_cancel(CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!cancelled);
        assert_eq!(outcome.exit_code, Some(0));
    }
}
