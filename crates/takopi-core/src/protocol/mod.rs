//! Protocol translators for the supported agent CLIs.
//!
//! Each agent emits one JSON object per line on stdout, in its own schema.
//! A translator is a per-run stateful object mapping already-decoded JSON
//! values into the unified [`TakopiEvent`] taxonomy. Translators follow the
//! tolerant reader pattern: unknown fields are ignored, unknown shapes are
//! logged at debug level and skipped, and missing optional metadata (usage,
//! cost) never fails translation. Malformed lines are the runner's problem;
//! translators only ever see valid JSON values.

use serde_json::Value;

use crate::event::{EngineId, TakopiEvent};

pub mod claude;
pub mod codex;
pub mod pi;

pub use claude::ClaudeTranslator;
pub use codex::CodexTranslator;
pub use pi::PiTranslator;

/// Per-run translator from an agent's wire schema to [`TakopiEvent`]s.
pub trait Translator: Send {
    /// The engine whose schema this translator decodes.
    fn engine(&self) -> EngineId;

    /// Map one decoded stdout line into zero or more events.
    ///
    /// Emits exactly one `SessionStarted` per run, as soon as the agent
    /// reports its session identity.
    fn translate(&mut self, raw: &Value) -> Vec<TakopiEvent>;

    /// Last assistant text captured so far, used as the answer when the
    /// agent's terminal event omits one (or never arrives).
    fn fallback_answer(&self) -> Option<String>;
}

/// Construct the translator for an engine.
pub fn translator_for(engine: EngineId) -> Box<dyn Translator> {
    match engine {
        EngineId::Claude => Box::new(ClaudeTranslator::new()),
        EngineId::Codex => Box::new(CodexTranslator::new()),
        EngineId::Pi => Box::new(PiTranslator::new()),
    }
}

/// Fetch a string field from a JSON object.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Truncate to a byte budget on a char boundary, appending an ellipsis.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i <= max)
            .last()
            .map_or(0, |(i, _)| i);
        format!("{}...", &s[..boundary])
    }
}

/// Collapse a multi-line snippet into its first line, truncated.
pub(crate) fn first_line(s: &str, max: usize) -> String {
    truncate_str(s.lines().next().unwrap_or_default().trim(), max)
}
