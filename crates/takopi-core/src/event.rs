//! Unified event taxonomy for coding-agent runs.
//!
//! Every supported agent CLI speaks its own line-delimited JSON protocol;
//! the translators in [`crate::protocol`] map all of them onto the types
//! here so transports only ever see one shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// The supported agent CLI engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineId {
    Claude,
    Codex,
    Pi,
}

impl EngineId {
    /// Engine name as used in commands, lock keys and resume lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Pi => "pi",
        }
    }

    /// All supported engines, in presentation order.
    pub const ALL: [Self; 3] = [Self::Claude, Self::Codex, Self::Pi];
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "pi" => Ok(Self::Pi),
            other => Err(Error::UnknownEngine(other.to_string())),
        }
    }
}

/// Opaque handle letting a new run continue a previous agent conversation.
///
/// Minted from the first `SessionStarted` event of a run and immutable from
/// then on. The `engine:value` pair is also the session-lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: EngineId,
    pub value: String,
}

impl ResumeToken {
    pub fn new(engine: EngineId, value: impl Into<String>) -> Self {
        Self {
            engine,
            value: value.into(),
        }
    }

    /// Key used by the session lock registry.
    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.engine, self.value)
    }
}

/// Classification of one observable agent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Shell command execution.
    Command,
    /// Generic tool invocation (reads, searches, MCP calls).
    Tool,
    /// File creation, edit or patch application.
    FileChange,
    /// Web search or fetch.
    WebSearch,
    /// Informational step (reasoning summaries, todo lists).
    Note,
}

/// One discrete step an agent reports during a run.
///
/// `id` is stable across the started/completed pair of the same step;
/// consumers correlate by it. Actions are not persisted anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    /// Short human-readable label (e.g. the command line or file path).
    pub title: String,
    /// Agent-specific details, passed through untouched.
    #[serde(default)]
    pub detail: serde_json::Map<String, Value>,
    /// Set on completion when the agent reports success or failure.
    #[serde(default)]
    pub ok: Option<bool>,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            detail: serde_json::Map::new(),
            ok: None,
        }
    }

    /// Attach a detail entry, returning self for chaining.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }
}

/// Token usage and cost metadata, extracted opportunistically from terminal
/// events. Absent fields default to zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl Usage {
    /// True when nothing was extracted; such a Usage is not worth reporting.
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cached_tokens == 0
            && self.cost_usd.is_none()
    }
}

/// Terminal summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Best-known token for continuing this conversation, present even on
    /// failure so the caller can offer to resume.
    pub resume: ResumeToken,
    /// Final answer text, if the agent produced one.
    pub answer: Option<String>,
    pub ok: bool,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Canonical events produced by a run, in subprocess-output order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TakopiEvent {
    /// The agent established (or resumed) its conversation. Exactly one per
    /// run; carries the freshly-minted resume token.
    SessionStarted {
        resume: ResumeToken,
        #[serde(default)]
        model: Option<String>,
    },
    ActionStarted { action: Action },
    ActionCompleted { action: Action },
    /// Informational line worth surfacing verbatim.
    Log { text: String },
    /// Agent- or runner-reported error; the run still terminates with
    /// `RunCompleted`.
    Error { message: String },
    /// Terminal event of every run. `result.resume.engine` always matches
    /// the runner that produced it.
    RunCompleted { result: RunResult },
}

impl TakopiEvent {
    /// The resume token carried by this event, if any.
    pub const fn resume(&self) -> Option<&ResumeToken> {
        match self {
            Self::SessionStarted { resume, .. } => Some(resume),
            Self::RunCompleted { result } => Some(&result.resume),
            _ => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. })
    }
}
