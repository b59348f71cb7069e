//! Translator for the Claude Code stream-json protocol.
//!
//! One JSON object per stdout line, discriminated by `type`:
//!
//! ```json
//! {"type":"system","subtype":"init","session_id":"...","model":"...","cwd":"..."}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."},
//!     {"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}],
//!     "stop_reason":"tool_use","usage":{...}}}
//! {"type":"user","message":{"content":[{"type":"tool_result",
//!     "tool_use_id":"toolu_1","content":"...","is_error":false}]}}
//! {"type":"result","subtype":"success","is_error":false,"result":"answer",
//!     "session_id":"...","usage":{...},"total_cost_usd":0.12}
//! ```
//!
//! Implements the tolerant reader pattern: unknown fields ignored, unknown
//! types logged at debug.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::{Translator, first_line, str_field, truncate_str};
use crate::event::{Action, ActionKind, EngineId, ResumeToken, RunResult, TakopiEvent, Usage};

/// Stateful translator for one Claude Code run.
pub struct ClaudeTranslator {
    session: Option<ResumeToken>,
    /// Actions started but not yet completed, keyed by tool_use id.
    pending: HashMap<String, Action>,
    last_text: Option<String>,
}

impl Default for ClaudeTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeTranslator {
    pub fn new() -> Self {
        Self {
            session: None,
            pending: HashMap::new(),
            last_text: None,
        }
    }

    fn handle_system(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        if str_field(raw, "subtype") != Some("init") {
            return vec![];
        }
        let Some(session_id) = str_field(raw, "session_id") else {
            warn!("claude system init without session_id");
            return vec![];
        };
        let resume = ResumeToken::new(EngineId::Claude, session_id);
        if self.session.as_ref() == Some(&resume) {
            // Duplicate init for the same session, nothing new to report.
            return vec![];
        }
        self.session = Some(resume.clone());
        vec![TakopiEvent::SessionStarted {
            resume,
            model: str_field(raw, "model").map(String::from),
        }]
    }

    fn handle_assistant(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let msg = raw.get("message").unwrap_or(raw);
        let Some(blocks) = msg.get("content").and_then(Value::as_array) else {
            return vec![];
        };

        let mut events = Vec::new();
        for block in blocks {
            match str_field(block, "type") {
                Some("text") => {
                    if let Some(text) = str_field(block, "text")
                        && !text.trim().is_empty()
                    {
                        self.last_text = Some(text.to_string());
                    }
                }
                Some("tool_use") => {
                    let (Some(id), Some(name)) = (str_field(block, "id"), str_field(block, "name"))
                    else {
                        continue;
                    };
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let action = Action::new(id, classify_tool(name), tool_title(name, &input))
                        .with_detail("tool", Value::String(name.to_string()));
                    self.pending.insert(id.to_string(), action.clone());
                    events.push(TakopiEvent::ActionStarted { action });
                }
                _ => {}
            }
        }
        events
    }

    fn handle_user(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let msg = raw.get("message").unwrap_or(raw);
        let Some(blocks) = msg.get("content").and_then(Value::as_array) else {
            return vec![];
        };

        let mut events = Vec::new();
        for block in blocks {
            if str_field(block, "type") != Some("tool_result") {
                continue;
            }
            let Some(id) = str_field(block, "tool_use_id") else {
                continue;
            };
            let Some(mut action) = self.pending.remove(id) else {
                debug!(tool_use_id = id, "tool_result for unknown tool_use");
                continue;
            };
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            action.ok = Some(!is_error);
            events.push(TakopiEvent::ActionCompleted { action });
        }
        events
    }

    fn handle_result(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let resume = match (&self.session, str_field(raw, "session_id")) {
            (Some(token), _) => token.clone(),
            (None, Some(id)) => ResumeToken::new(EngineId::Claude, id),
            (None, None) => {
                warn!("claude result without any session id, dropping");
                return vec![];
            }
        };

        let subtype_ok = str_field(raw, "subtype").is_none_or(|s| s == "success");
        let is_error = raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let errors: Vec<String> = raw
            .get("errors")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        // subtype is authoritative: is_error=true alongside subtype=success
        // with no error messages is a known contradictory combination.
        let has_real_error = is_error && (!subtype_ok || !errors.is_empty());

        let answer = str_field(raw, "result")
            .filter(|s| !s.trim().is_empty())
            .map(String::from)
            .or_else(|| self.last_text.clone());

        let mut events = Vec::new();
        if has_real_error {
            let message = if errors.is_empty() {
                "agent reported an error".to_string()
            } else {
                errors.join("; ")
            };
            events.push(TakopiEvent::Error { message });
        }
        events.push(TakopiEvent::RunCompleted {
            result: RunResult {
                resume,
                answer,
                ok: subtype_ok && !has_real_error,
                usage: extract_usage(raw),
            },
        });
        events
    }
}

impl Translator for ClaudeTranslator {
    fn engine(&self) -> EngineId {
        EngineId::Claude
    }

    fn translate(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        match str_field(raw, "type") {
            Some("system") => self.handle_system(raw),
            Some("assistant") => self.handle_assistant(raw),
            Some("user") => self.handle_user(raw),
            Some("result") => self.handle_result(raw),
            // Partial-message stream events carry no run-level information.
            Some("stream_event") => vec![],
            other => {
                debug!(msg_type = ?other, "unknown claude message type");
                vec![]
            }
        }
    }

    fn fallback_answer(&self) -> Option<String> {
        self.last_text.clone()
    }
}

fn classify_tool(name: &str) -> ActionKind {
    match name {
        "Bash" | "BashOutput" | "KillShell" => ActionKind::Command,
        "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => ActionKind::FileChange,
        "WebSearch" | "WebFetch" => ActionKind::WebSearch,
        "TodoWrite" => ActionKind::Note,
        _ => ActionKind::Tool,
    }
}

/// Human-readable title from tool name and input.
fn tool_title(name: &str, input: &Value) -> String {
    let Some(obj) = input.as_object() else {
        return name.to_string();
    };

    let title = match name {
        "Bash" => obj
            .get("command")
            .and_then(Value::as_str)
            .map(|c| first_line(c, 120)),
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => obj
            .get("file_path")
            .and_then(Value::as_str)
            .map(String::from),
        "Grep" => obj.get("pattern").and_then(Value::as_str).map(|pattern| {
            let path = obj.get("path").and_then(Value::as_str).unwrap_or(".");
            format!("{} in {}", truncate_str(pattern, 60), path)
        }),
        "Glob" => obj.get("pattern").and_then(Value::as_str).map(String::from),
        "WebFetch" | "WebSearch" => obj
            .get("url")
            .or_else(|| obj.get("query"))
            .and_then(Value::as_str)
            .map(|s| truncate_str(s, 120)),
        "TodoWrite" => Some("update todo list".to_string()),
        _ => obj
            .values()
            .find_map(Value::as_str)
            .map(|s| truncate_str(s, 80)),
    };
    title.unwrap_or_else(|| name.to_string())
}

fn extract_usage(raw: &Value) -> Option<Usage> {
    let usage = raw.get("usage");
    let field = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let extracted = Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cached_tokens: field("cache_read_input_tokens"),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
    };
    (!extracted.is_empty()).then_some(extracted)
}
