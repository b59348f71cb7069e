//! Translator for the pi coding agent's JSON mode.
//!
//! `pi --mode json` emits one JSON object per stdout line, discriminated by
//! `type`:
//!
//! ```json
//! {"type":"session","path":"/home/u/.pi/sessions/2025-08-07-a1b2.jsonl"}
//! {"type":"message_start","message":{"role":"assistant"}}
//! {"type":"message_end","message":{"role":"assistant",
//!     "content":[{"type":"text","text":"..."}]}}
//! {"type":"tool_execution_start","toolCallId":"t1","toolName":"bash",
//!     "args":{"command":"ls"}}
//! {"type":"tool_execution_end","toolCallId":"t1","isError":false}
//! {"type":"agent_end","error":null}
//! ```
//!
//! The session value is the session file path exactly as reported on the
//! wire; it is never read back from disk, so concurrent writers to the
//! session file cannot corrupt the token.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::{Translator, first_line, str_field};
use crate::event::{Action, ActionKind, EngineId, ResumeToken, RunResult, TakopiEvent};

/// Stateful translator for one pi run.
pub struct PiTranslator {
    session: Option<ResumeToken>,
    /// Actions started but not yet completed, keyed by tool call id.
    pending: HashMap<String, Action>,
    last_text: Option<String>,
}

impl Default for PiTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl PiTranslator {
    pub fn new() -> Self {
        Self {
            session: None,
            pending: HashMap::new(),
            last_text: None,
        }
    }

    fn handle_session(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let Some(path) = str_field(raw, "path").or_else(|| str_field(raw, "id")) else {
            debug!("pi session event without path or id");
            return vec![];
        };
        let resume = ResumeToken::new(EngineId::Pi, path);
        if self.session.as_ref() == Some(&resume) {
            return vec![];
        }
        self.session = Some(resume.clone());
        vec![TakopiEvent::SessionStarted {
            resume,
            model: str_field(raw, "model").map(String::from),
        }]
    }

    fn handle_message_end(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let Some(message) = raw.get("message") else {
            return vec![];
        };
        if str_field(message, "role") != Some("assistant") {
            return vec![];
        }
        let text: String = message
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| str_field(b, "type") == Some("text"))
                    .filter_map(|b| str_field(b, "text"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        if !text.trim().is_empty() {
            self.last_text = Some(text);
        }
        vec![]
    }

    fn handle_tool_start(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let Some(id) = str_field(raw, "toolCallId") else {
            return vec![];
        };
        let name = str_field(raw, "toolName").unwrap_or("tool");
        let args = raw.get("args").cloned().unwrap_or(Value::Null);
        let action = Action::new(id, classify_tool(name), tool_title(name, &args));
        self.pending.insert(id.to_string(), action.clone());
        vec![TakopiEvent::ActionStarted { action }]
    }

    fn handle_tool_end(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let Some(id) = str_field(raw, "toolCallId") else {
            return vec![];
        };
        let Some(mut action) = self.pending.remove(id) else {
            debug!(tool_call_id = id, "tool_execution_end for unknown start");
            return vec![];
        };
        let is_error = raw
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        action.ok = Some(!is_error);
        vec![TakopiEvent::ActionCompleted { action }]
    }

    fn handle_agent_end(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let Some(resume) = self.session.clone() else {
            debug!("pi agent_end before session event, dropping completion");
            return vec![];
        };
        let error = raw.get("error").filter(|e| !e.is_null());
        let mut events = Vec::new();
        if let Some(error) = error {
            let message = error
                .as_str()
                .or_else(|| str_field(error, "message"))
                .unwrap_or("agent error")
                .to_string();
            events.push(TakopiEvent::Error { message });
        }
        events.push(TakopiEvent::RunCompleted {
            result: RunResult {
                resume,
                answer: self.last_text.clone(),
                ok: error.is_none(),
                usage: None,
            },
        });
        events
    }
}

impl Translator for PiTranslator {
    fn engine(&self) -> EngineId {
        EngineId::Pi
    }

    fn translate(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        match str_field(raw, "type") {
            Some("session") => self.handle_session(raw),
            Some("message_end") => self.handle_message_end(raw),
            Some("tool_execution_start") => self.handle_tool_start(raw),
            Some("tool_execution_end") => self.handle_tool_end(raw),
            Some("agent_end") => self.handle_agent_end(raw),
            // Deltas and lifecycle chatter carry no run-level information.
            Some("agent_start" | "message_start" | "message_update") => vec![],
            other => {
                debug!(msg_type = ?other, "unknown pi message type");
                vec![]
            }
        }
    }

    fn fallback_answer(&self) -> Option<String> {
        self.last_text.clone()
    }
}

fn classify_tool(name: &str) -> ActionKind {
    match name.to_ascii_lowercase().as_str() {
        "bash" | "shell" | "exec" => ActionKind::Command,
        "edit" | "write" | "multi-edit" | "multi_edit" | "patch" => ActionKind::FileChange,
        "fetch" | "web-search" | "web_search" | "browse" => ActionKind::WebSearch,
        _ => ActionKind::Tool,
    }
}

fn tool_title(name: &str, args: &Value) -> String {
    let Some(obj) = args.as_object() else {
        return name.to_string();
    };
    obj.get("command")
        .or_else(|| obj.get("path"))
        .or_else(|| obj.get("file_path"))
        .or_else(|| obj.get("query"))
        .and_then(Value::as_str)
        .map_or_else(|| name.to_string(), |s| first_line(s, 120))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn translate_line(translator: &mut PiTranslator, line: &str) -> Vec<TakopiEvent> {
        translator.translate(&serde_json::from_str(line).unwrap())
    }

    #[test]
    fn session_path_is_the_resume_value() {
        let mut tr = PiTranslator::new();
        let events = translate_line(
            &mut tr,
            r#"{"type":"session","path":"/home/u/.pi/sessions/abc.jsonl"}"#,
        );
        match &events[0] {
            TakopiEvent::SessionStarted { resume, .. } => {
                assert_eq!(resume.engine, EngineId::Pi);
                assert_eq!(resume.value, "/home/u/.pi/sessions/abc.jsonl");
            }
            other => panic!("expected SessionStarted, got {other:?}"),
        }
    }

    #[test]
    fn tool_lifecycle_correlates_by_call_id() {
        let mut tr = PiTranslator::new();
        translate_line(&mut tr, r#"{"type":"session","path":"/s.jsonl"}"#);

        let events = translate_line(
            &mut tr,
            r#"{"type":"tool_execution_start","toolCallId":"t1","toolName":"bash",
                "args":{"command":"make check"}}"#,
        );
        match &events[0] {
            TakopiEvent::ActionStarted { action } => {
                assert_eq!(action.kind, ActionKind::Command);
                assert_eq!(action.title, "make check");
            }
            other => panic!("expected ActionStarted, got {other:?}"),
        }

        let events = translate_line(
            &mut tr,
            r#"{"type":"tool_execution_end","toolCallId":"t1","isError":true}"#,
        );
        match &events[0] {
            TakopiEvent::ActionCompleted { action } => {
                assert_eq!(action.id, "t1");
                assert_eq!(action.ok, Some(false));
            }
            other => panic!("expected ActionCompleted, got {other:?}"),
        }
    }

    #[test]
    fn assistant_text_collected_for_answer() {
        let mut tr = PiTranslator::new();
        translate_line(&mut tr, r#"{"type":"session","path":"/s.jsonl"}"#);
        translate_line(
            &mut tr,
            r#"{"type":"message_end","message":{"role":"assistant",
                "content":[{"type":"text","text":"first"},{"type":"text","text":"second"}]}}"#,
        );
        let events = translate_line(&mut tr, r#"{"type":"agent_end","error":null}"#);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TakopiEvent::RunCompleted { result } => {
                assert!(result.ok);
                assert_eq!(result.answer.as_deref(), Some("first\nsecond"));
            }
            other => panic!("expected RunCompleted, got {other:?}"),
        }
    }

    #[test]
    fn user_messages_do_not_become_answers() {
        let mut tr = PiTranslator::new();
        translate_line(
            &mut tr,
            r#"{"type":"message_end","message":{"role":"user",
                "content":[{"type":"text","text":"the prompt"}]}}"#,
        );
        assert!(tr.fallback_answer().is_none());
    }

    #[test]
    fn agent_end_with_error_fails_the_run() {
        let mut tr = PiTranslator::new();
        translate_line(&mut tr, r#"{"type":"session","path":"/s.jsonl"}"#);
        let events = translate_line(
            &mut tr,
            r#"{"type":"agent_end","error":{"message":"context exhausted"}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[0], TakopiEvent::Error { message } if message == "context exhausted")
        );
        match &events[1] {
            TakopiEvent::RunCompleted { result } => assert!(!result.ok),
            other => panic!("expected RunCompleted, got {other:?}"),
        }
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify_tool("bash"), ActionKind::Command);
        assert_eq!(classify_tool("Edit"), ActionKind::FileChange);
        assert_eq!(classify_tool("web-search"), ActionKind::WebSearch);
        assert_eq!(classify_tool("read"), ActionKind::Tool);
    }

    #[test]
    fn unknown_shapes_are_tolerated() {
        let mut tr = PiTranslator::new();
        assert!(translate_line(&mut tr, r#"{"type":"auto_compaction_start"}"#).is_empty());
        assert!(translate_line(&mut tr, r#"{"weird":1}"#).is_empty());
    }
}
