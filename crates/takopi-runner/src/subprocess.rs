//! Agent subprocess lifecycle manager.
//!
//! Spawns an agent CLI in its own process group, feeds the prompt on stdin,
//! streams stdout line by line (with an armable idle timeout), drains stderr
//! into a bounded ring buffer for diagnostics, and tears the whole process
//! tree down with SIGTERM, a grace period, then SIGKILL.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors from subprocess operations.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// A stdio pipe was not available after spawning.
    #[error("failed to capture {stream} of the agent process")]
    PipeMissing { stream: &'static str },

    /// No output within the armed idle bound after session establishment.
    #[error("no agent output for {0:?}")]
    IdleTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to invoke one agent CLI.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory for the agent; inherited when unset.
    pub cwd: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Ring buffer of the last N stderr lines, filled by a background drainer.
/// Clones share the buffer, so a handle stays readable after teardown.
#[derive(Clone, Debug)]
pub(crate) struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub(crate) fn join(&self) -> String {
        #[allow(clippy::unwrap_used)]
        let lines = self.lines.lock().unwrap();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// A running agent subprocess with its stdio plumbing.
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    /// Process id at spawn time; survives reaping for group signalling.
    pid: Option<u32>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

impl AgentProcess {
    /// Spawn `spec` in its own process group with piped stdio.
    pub fn spawn(spec: &SpawnSpec, stderr_tail_lines: usize) -> Result<Self, SubprocessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop only: orderly teardown goes through `shutdown`.
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            // Own process group so the whole agent tree can be signalled
            // together.
            cmd.process_group(0);
        }

        info!(program = %spec.program.display(), args = ?spec.args, "spawning agent");
        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or(SubprocessError::PipeMissing { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SubprocessError::PipeMissing { stream: "stderr" })?;

        let stderr_tail = StderrTail::new(stderr_tail_lines.max(1));
        let tail = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(stderr = %line, "agent stderr");
                tail.push(line);
            }
        });

        Ok(Self {
            child,
            pid,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
            stderr_task: Some(stderr_task),
        })
    }

    /// Write the prompt to the agent's stdin and close it.
    pub async fn feed_prompt(&mut self, prompt: &str) -> Result<(), SubprocessError> {
        let mut stdin = self
            .child
            .stdin
            .take()
            .ok_or(SubprocessError::PipeMissing { stream: "stdin" })?;
        stdin.write_all(prompt.as_bytes()).await?;
        if !prompt.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
        drop(stdin);
        Ok(())
    }

    /// Next stdout line, or `None` at EOF. With `idle` set, a read exceeding
    /// the bound raises [`SubprocessError::IdleTimeout`]; partial lines stay
    /// buffered across reads either way.
    pub async fn next_line(
        &mut self,
        idle: Option<Duration>,
    ) -> Result<Option<String>, SubprocessError> {
        match idle {
            Some(bound) => match tokio::time::timeout(bound, self.stdout.next_line()).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(SubprocessError::IdleTimeout(bound)),
            },
            None => Ok(self.stdout.next_line().await?),
        }
    }

    /// Process id at spawn time, if the process started.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The last captured stderr lines, joined for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.join()
    }

    /// Shared handle to the stderr ring, usable after `shutdown` consumed
    /// the process.
    pub(crate) fn tail_handle(&self) -> StderrTail {
        self.stderr_tail.clone()
    }

    /// Wait for natural exit without signalling.
    pub async fn wait(&mut self) -> Result<ExitStatus, SubprocessError> {
        Ok(self.child.wait().await?)
    }

    /// Terminate the process group: SIGTERM, wait up to `grace`, then
    /// SIGKILL and wait unconditionally. Always reaps the child.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        // Already exited? Nothing to signal.
        if let Ok(Some(status)) = self.child.try_wait() {
            self.finish_stderr().await;
            return Some(status);
        }

        self.signal_group(libc_signal::SIGTERM);
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "agent exited after SIGTERM");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "error waiting for agent after SIGTERM");
                None
            }
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f64(), "agent ignored SIGTERM, killing");
                self.signal_group(libc_signal::SIGKILL);
                self.child.wait().await.ok()
            }
        };
        self.finish_stderr().await;
        status
    }

    async fn finish_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            // The drainer ends when the pipe closes; give it a moment to
            // capture the final lines.
            let _ = tokio::time::timeout(Duration::from_millis(200), task).await;
        }
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: i32) {
        let Some(pid) = self.pid else { return };
        // SAFETY: pid was obtained from our own Child handle and the process
        // was spawned with process_group(0), so -pid addresses exactly the
        // group we created. kill(2) is safe to call on an owned subprocess.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(-(pid as i32), signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, signal, error = %err, "failed to signal process group");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: i32) {
        // No process groups; fall back to killing the immediate child.
        let _ = self.child.start_kill();
    }
}

#[cfg(unix)]
mod libc_signal {
    pub use libc::{SIGKILL, SIGTERM};
}

#[cfg(not(unix))]
mod libc_signal {
    pub const SIGTERM: i32 = 15;
    pub const SIGKILL: i32 = 9;
}
