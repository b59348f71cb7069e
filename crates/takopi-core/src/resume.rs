//! Resume-line conventions embedded in answer text.
//!
//! Each engine advertises how to continue its conversation as a single
//! backticked line inside the reply, e.g. `` `codex resume <uuid>` ``.
//! Formatting and extraction are pure and round-trip: the value extracted
//! from a formatted line is the value that was formatted. Extraction scans
//! arbitrary reply text and takes the *last* match, since transports often
//! quote earlier resume lines when replying.

use std::sync::LazyLock;

use regex::Regex;

use crate::event::{EngineId, ResumeToken};

static CLAUDE_RESUME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"`claude --resume ([A-Za-z0-9_-]+)`").unwrap()
});

static CODEX_RESUME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"`codex resume ([A-Za-z0-9-]+)`").unwrap()
});

static PI_RESUME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"`pi --session ([^`\s]+)`").unwrap()
});

/// Render the resume line for a token, in the engine's own syntax.
pub fn format_resume(token: &ResumeToken) -> String {
    match token.engine {
        EngineId::Claude => format!("`claude --resume {}`", token.value),
        EngineId::Codex => format!("`codex resume {}`", token.value),
        EngineId::Pi => format!("`pi --session {}`", token.value),
    }
}

/// Extract a resume token for `engine` from arbitrary reply text.
///
/// Returns the last match when several resume lines appear.
pub fn extract_resume(engine: EngineId, text: &str) -> Option<ResumeToken> {
    let pattern: &Regex = match engine {
        EngineId::Claude => &CLAUDE_RESUME,
        EngineId::Codex => &CODEX_RESUME,
        EngineId::Pi => &PI_RESUME,
    };
    let value = pattern
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())?;
    Some(ResumeToken::new(engine, value))
}
