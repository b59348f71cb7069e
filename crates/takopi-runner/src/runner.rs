//! Per-agent run orchestration.
//!
//! A [`Runner`] ties one [`Engine`] to the subprocess manager, the protocol
//! translator, the event dispatcher and the session lock registry. A run
//! moves Starting → Streaming → {Completed | Cancelled | Failed}; whatever
//! the path, subprocess teardown runs and the session lock is released.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use takopi_core::config::Config;
use takopi_core::event::{EngineId, ResumeToken, RunResult, TakopiEvent};
use takopi_core::protocol::{ClaudeTranslator, CodexTranslator, PiTranslator, Translator};
use takopi_core::resume;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::EventDispatcher;
use crate::locks::{SessionGuard, SessionLockRegistry};
use crate::subprocess::{AgentProcess, SpawnSpec, SubprocessError};

/// Errors that end a run abnormally.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),

    /// The caller passed a resume token minted by a different engine.
    #[error("resume token belongs to {token}, not {engine}")]
    EngineMismatch { engine: EngineId, token: EngineId },

    /// The agent reported two different session ids within one run.
    #[error("agent reported conflicting session ids: {previous} then {current}")]
    SessionConflict { previous: String, current: String },

    /// The agent exited without ever establishing a session.
    #[error("agent exited without establishing a session: {stderr}")]
    NoSession { stderr: String },

    /// The agent exited abnormally with nothing to show.
    #[error("agent failed (exit code {code:?}): {stderr}")]
    AgentFailed { code: Option<i32>, stderr: String },

    /// The event consumer raised; already-delivered events stay delivered.
    #[error("event consumer failed: {0}")]
    Consumer(#[source] anyhow::Error),

    #[error("run cancelled")]
    Cancelled,

    #[error("run task failed: {0}")]
    Internal(String),
}

/// Per-agent seam: how to invoke the CLI and decode its stream.
pub trait Engine: Send + Sync + 'static {
    fn id(&self) -> EngineId;

    /// CLI invocation for a run. The prompt is always fed on stdin.
    fn spawn_spec(&self, resume: Option<&ResumeToken>) -> SpawnSpec;

    /// Fresh translator for one run's stdout stream.
    fn translator(&self) -> Box<dyn Translator>;

    /// Render the resume line this engine embeds in answers.
    fn format_resume(&self, token: &ResumeToken) -> String {
        resume::format_resume(token)
    }

    /// Extract this engine's resume token from arbitrary reply text.
    fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        resume::extract_resume(self.id(), text)
    }
}

/// Claude Code CLI (`claude -p --output-format stream-json`).
pub struct ClaudeEngine {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl ClaudeEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.engine_binary(EngineId::Claude),
            extra_args: config.engine_extra_args(EngineId::Claude).to_vec(),
        }
    }
}

impl Engine for ClaudeEngine {
    fn id(&self) -> EngineId {
        EngineId::Claude
    }

    fn spawn_spec(&self, resume: Option<&ResumeToken>) -> SpawnSpec {
        let mut spec = SpawnSpec::new(&self.binary)
            .arg("-p")
            .args(["--output-format", "stream-json", "--verbose"]);
        if let Some(token) = resume {
            spec = spec.args(["--resume", token.value.as_str()]);
        }
        spec.args(self.extra_args.iter().cloned())
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(ClaudeTranslator::new())
    }
}

/// Codex CLI (`codex exec --experimental-json`, prompt on stdin via `-`).
pub struct CodexEngine {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl CodexEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.engine_binary(EngineId::Codex),
            extra_args: config.engine_extra_args(EngineId::Codex).to_vec(),
        }
    }
}

impl Engine for CodexEngine {
    fn id(&self) -> EngineId {
        EngineId::Codex
    }

    fn spawn_spec(&self, resume: Option<&ResumeToken>) -> SpawnSpec {
        let mut spec = SpawnSpec::new(&self.binary).arg("exec");
        if let Some(token) = resume {
            spec = spec.args(["resume", token.value.as_str()]);
        }
        spec.arg("--experimental-json")
            .args(self.extra_args.iter().cloned())
            .arg("-")
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(CodexTranslator::new())
    }
}

/// pi coding agent (`pi --mode json`).
pub struct PiEngine {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl PiEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.engine_binary(EngineId::Pi),
            extra_args: config.engine_extra_args(EngineId::Pi).to_vec(),
        }
    }
}

impl Engine for PiEngine {
    fn id(&self) -> EngineId {
        EngineId::Pi
    }

    fn spawn_spec(&self, resume: Option<&ResumeToken>) -> SpawnSpec {
        let mut spec = SpawnSpec::new(&self.binary).args(["--mode", "json"]);
        if let Some(token) = resume {
            spec = spec.args(["--session", token.value.as_str()]);
        }
        spec.args(self.extra_args.iter().cloned())
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(PiTranslator::new())
    }
}

/// Handle to one in-flight run.
#[derive(Debug)]
pub struct RunHandle {
    events: mpsc::UnboundedReceiver<TakopiEvent>,
    cancel: CancellationToken,
    outcome: JoinHandle<Result<RunResult, RunnerError>>,
}

impl RunHandle {
    /// Events in subprocess-output order, terminated by `RunCompleted`
    /// (except on hard failure, where `join` reports the error).
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TakopiEvent> {
        &mut self.events
    }

    /// Detach the event stream, e.g. to consume it while awaiting `join`.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<TakopiEvent> {
        let (_, closed) = mpsc::unbounded_channel();
        std::mem::replace(&mut self.events, closed)
    }

    /// Request cancellation; teardown still runs to completion.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to reach a terminal state.
    pub async fn join(self) -> Result<RunResult, RunnerError> {
        match self.outcome.await {
            Ok(result) => result,
            Err(join_err) => Err(RunnerError::Internal(join_err.to_string())),
        }
    }
}

/// Orchestrates runs for one engine.
pub struct Runner {
    engine: Arc<dyn Engine>,
    locks: SessionLockRegistry,
    permits: Arc<Semaphore>,
    idle_timeout: Duration,
    grace: Duration,
    stderr_tail_lines: usize,
}

impl Runner {
    pub fn new(
        engine: Arc<dyn Engine>,
        locks: SessionLockRegistry,
        permits: Arc<Semaphore>,
        config: &Config,
    ) -> Self {
        Self {
            engine,
            locks,
            permits,
            idle_timeout: config.runner.idle_timeout(),
            grace: config.runner.terminate_grace(),
            stderr_tail_lines: config.runner.stderr_tail_lines,
        }
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine.id()
    }

    pub fn format_resume(&self, token: &ResumeToken) -> String {
        self.engine.format_resume(token)
    }

    pub fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        self.engine.extract_resume(text)
    }

    /// Start a run. Events stream through the returned handle; the terminal
    /// summary comes from `join`.
    pub fn start(
        &self,
        prompt: impl Into<String>,
        resume: Option<ResumeToken>,
    ) -> Result<RunHandle, RunnerError> {
        if let Some(token) = &resume
            && token.engine != self.engine.id()
        {
            return Err(RunnerError::EngineMismatch {
                engine: self.engine.id(),
                token: token.engine,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = RunTask {
            engine: Arc::clone(&self.engine),
            locks: self.locks.clone(),
            permits: Arc::clone(&self.permits),
            idle_timeout: self.idle_timeout,
            grace: self.grace,
            stderr_tail_lines: self.stderr_tail_lines,
            cancel: cancel.clone(),
        };
        let outcome = tokio::spawn(task.run(prompt.into(), resume, tx));
        Ok(RunHandle {
            events: rx,
            cancel,
            outcome,
        })
    }
}

struct RunTask {
    engine: Arc<dyn Engine>,
    locks: SessionLockRegistry,
    permits: Arc<Semaphore>,
    idle_timeout: Duration,
    grace: Duration,
    stderr_tail_lines: usize,
    cancel: CancellationToken,
}

/// What the read loop learned before the stream ended.
#[derive(Default)]
struct StreamState {
    established: Option<ResumeToken>,
    completed: Option<RunResult>,
    idle_expired: bool,
}

impl RunTask {
    async fn run(
        self,
        prompt: String,
        resume: Option<ResumeToken>,
        tx: mpsc::UnboundedSender<TakopiEvent>,
    ) -> Result<RunResult, RunnerError> {
        let run_id = Uuid::new_v4();
        let engine = self.engine.id();

        // Global bound on concurrent runs.
        let _permit = tokio::select! {
            () = self.cancel.cancelled() => return Err(RunnerError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| RunnerError::Cancelled)?
            }
        };

        // Resumed conversations are serialized before the subprocess exists.
        let mut session_guard: Option<SessionGuard> = match &resume {
            Some(token) => Some(tokio::select! {
                () = self.cancel.cancelled() => return Err(RunnerError::Cancelled),
                guard = self.locks.acquire(token) => guard,
            }),
            None => None,
        };

        let spec = self.engine.spawn_spec(resume.as_ref());
        let mut proc = AgentProcess::spawn(&spec, self.stderr_tail_lines)?;
        let stderr = proc.tail_handle();
        info!(%run_id, %engine, pid = ?proc.pid(), resumed = resume.is_some(), "run starting");

        let dispatcher = EventDispatcher::spawn(EventDispatcher::consumer(move |event| {
            let tx = tx.clone();
            async move {
                // A dropped receiver means the caller stopped listening;
                // that is not a run failure.
                let _ = tx.send(event);
                Ok(())
            }
        }));

        let mut translator = self.engine.translator();

        let streamed = self
            .stream(
                &mut proc,
                translator.as_mut(),
                &dispatcher,
                &mut session_guard,
                &prompt,
            )
            .await;

        // Teardown always runs, including on cancellation and errors.
        let status = match &streamed {
            Ok(state) if !state.idle_expired => {
                // Clean EOF: give the agent a moment to exit on its own.
                match tokio::time::timeout(self.grace, proc.wait()).await {
                    Ok(Ok(status)) => {
                        proc.shutdown(self.grace).await;
                        Some(status)
                    }
                    _ => proc.shutdown(self.grace).await,
                }
            }
            _ => proc.shutdown(self.grace).await,
        };
        debug!(%run_id, ?status, "agent process reaped");

        let state = match streamed {
            Ok(state) => state,
            Err(err) => {
                // Drain what was already sequenced before reporting.
                let _ = dispatcher.close().await;
                info!(%run_id, error = %err, "run ended abnormally");
                return Err(err);
            }
        };

        if let Some(result) = state.completed {
            // The agent reported its own terminal event; the exit status
            // (and any stall after it) is advisory at this point.
            dispatcher.close().await.map_err(RunnerError::Consumer)?;
            info!(%run_id, ok = result.ok, "run completed");
            return Ok(result);
        }

        if state.idle_expired {
            // Idle timeouts are only armed after establishment, so the token
            // is known here.
            let Some(token) = state.established else {
                let _ = dispatcher.close().await;
                return Err(RunnerError::Internal(
                    "idle timeout before session establishment".into(),
                ));
            };
            let result = RunResult {
                resume: token,
                answer: translator.fallback_answer(),
                ok: false,
                usage: None,
            };
            dispatcher.emit(TakopiEvent::Error {
                message: format!(
                    "no agent output for {}s, run aborted",
                    self.idle_timeout.as_secs()
                ),
            });
            dispatcher.emit(TakopiEvent::RunCompleted {
                result: result.clone(),
            });
            dispatcher.close().await.map_err(RunnerError::Consumer)?;
            warn!(%run_id, "run aborted after idle timeout");
            return Ok(result);
        }

        let exit_code = status.and_then(|s| s.code());
        let Some(token) = state.established else {
            let _ = dispatcher.close().await;
            return Err(RunnerError::NoSession {
                stderr: stderr.join(),
            });
        };

        // No terminal event from the agent. An answer makes this a soft
        // failure (or a quiet success on exit 0); silence is a hard one.
        let exit_ok = status.is_some_and(|s| s.success());
        if let Some(answer) = translator.fallback_answer() {
            let result = RunResult {
                resume: token,
                answer: Some(answer),
                ok: exit_ok,
                usage: None,
            };
            if !exit_ok {
                dispatcher.emit(TakopiEvent::Error {
                    message: format!("agent exited with code {exit_code:?}"),
                });
            }
            dispatcher.emit(TakopiEvent::RunCompleted {
                result: result.clone(),
            });
            dispatcher.close().await.map_err(RunnerError::Consumer)?;
            info!(%run_id, ok = result.ok, "run completed without terminal event");
            return Ok(result);
        }

        let _ = dispatcher.close().await;
        Err(RunnerError::AgentFailed {
            code: exit_code,
            stderr: stderr.join(),
        })
    }

    /// Feed the prompt and pump decoded lines through the translator until
    /// EOF, idle expiry, cancellation or a fatal error.
    async fn stream(
        &self,
        proc: &mut AgentProcess,
        translator: &mut dyn Translator,
        dispatcher: &EventDispatcher,
        session_guard: &mut Option<SessionGuard>,
        prompt: &str,
    ) -> Result<StreamState, RunnerError> {
        proc.feed_prompt(prompt).await?;

        let mut state = StreamState::default();
        'read: loop {
            // The idle bound is armed only once a session exists, so slow
            // agent startup is never mistaken for a stall.
            let idle = state.established.is_some().then_some(self.idle_timeout);
            let line = tokio::select! {
                () = self.cancel.cancelled() => return Err(RunnerError::Cancelled),
                line = proc.next_line(idle) => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break 'read,
                Err(SubprocessError::IdleTimeout(_)) => {
                    state.idle_expired = true;
                    break 'read;
                }
                Err(err) => return Err(err.into()),
            };

            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    // The only silently-recovered failure class.
                    warn!(error = %err, "skipping undecodable agent line");
                    continue;
                }
            };

            for event in translator.translate(&value) {
                if let TakopiEvent::SessionStarted { resume: token, .. } = &event {
                    match &state.established {
                        None => {
                            // A fresh session learns its token here; take the
                            // lock before this event reaches the consumer.
                            if session_guard.is_none() {
                                let guard = tokio::select! {
                                    () = self.cancel.cancelled() => {
                                        return Err(RunnerError::Cancelled);
                                    }
                                    guard = self.locks.acquire(token) => guard,
                                };
                                *session_guard = Some(guard);
                            }
                            state.established = Some(token.clone());
                        }
                        Some(previous) if previous == token => {}
                        Some(previous) => {
                            return Err(RunnerError::SessionConflict {
                                previous: previous.value.clone(),
                                current: token.value.clone(),
                            });
                        }
                    }
                }
                if let TakopiEvent::RunCompleted { result } = &event {
                    state.completed = Some(result.clone());
                }
                dispatcher.emit(event);
            }
        }
        Ok(state)
    }
}
