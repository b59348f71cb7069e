//! Translator for the Codex CLI experimental JSON protocol.
//!
//! `codex exec --experimental-json` emits one JSON object per stdout line,
//! discriminated by `type`:
//!
//! ```json
//! {"type":"thread.started","thread_id":"..."}
//! {"type":"turn.started"}
//! {"type":"item.started","item":{"id":"item_0","item_type":"command_execution",
//!     "command":"ls -la","status":"in_progress"}}
//! {"type":"item.completed","item":{"id":"item_0","item_type":"command_execution",
//!     "command":"ls -la","exit_code":0,"aggregated_output":"..."}}
//! {"type":"item.completed","item":{"id":"item_1","item_type":"agent_message",
//!     "text":"final answer"}}
//! {"type":"turn.completed","usage":{"input_tokens":10,"cached_input_tokens":2,
//!     "output_tokens":5}}
//! {"type":"turn.failed","error":{"message":"..."}}
//! {"type":"error","message":"..."}
//! ```
//!
//! Item types map onto the unified action kinds; `agent_message` text is the
//! answer; `reasoning` and `todo_list` items surface as notes.

use serde_json::Value;
use tracing::debug;

use super::{Translator, first_line, str_field, truncate_str};
use crate::event::{Action, ActionKind, EngineId, ResumeToken, RunResult, TakopiEvent, Usage};

/// Stateful translator for one Codex run.
pub struct CodexTranslator {
    session: Option<ResumeToken>,
    last_message: Option<String>,
    usage: Option<Usage>,
}

impl Default for CodexTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexTranslator {
    pub fn new() -> Self {
        Self {
            session: None,
            last_message: None,
            usage: None,
        }
    }

    fn handle_thread_started(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let Some(thread_id) = str_field(raw, "thread_id") else {
            debug!("codex thread.started without thread_id");
            return vec![];
        };
        let resume = ResumeToken::new(EngineId::Codex, thread_id);
        if self.session.as_ref() == Some(&resume) {
            return vec![];
        }
        self.session = Some(resume.clone());
        vec![TakopiEvent::SessionStarted {
            resume,
            model: str_field(raw, "model").map(String::from),
        }]
    }

    fn handle_item(&mut self, raw: &Value, completed: bool) -> Vec<TakopiEvent> {
        let Some(item) = raw.get("item") else {
            return vec![];
        };
        let id = str_field(item, "id").unwrap_or("item").to_string();
        let item_type = str_field(item, "item_type").unwrap_or_default();

        match item_type {
            "agent_message" => {
                if completed && let Some(text) = str_field(item, "text") {
                    self.last_message = Some(text.to_string());
                }
                vec![]
            }
            "reasoning" => {
                // Reasoning summaries arrive complete; show the headline once.
                if !completed {
                    return vec![];
                }
                let Some(text) = str_field(item, "text") else {
                    return vec![];
                };
                let action = Action::new(id, ActionKind::Note, first_line(text, 100));
                vec![TakopiEvent::ActionCompleted { action }]
            }
            "todo_list" => {
                if !completed {
                    return vec![];
                }
                let action = Action::new(id, ActionKind::Note, "update plan");
                vec![TakopiEvent::ActionCompleted { action }]
            }
            "error" => {
                let message = str_field(item, "message").unwrap_or("agent error").to_string();
                vec![TakopiEvent::Error { message }]
            }
            "command_execution" | "file_change" | "mcp_tool_call" | "web_search" => {
                let mut action = item_action(item_type, &id, item);
                if completed {
                    action.ok = Some(item_ok(item_type, item));
                    vec![TakopiEvent::ActionCompleted { action }]
                } else {
                    vec![TakopiEvent::ActionStarted { action }]
                }
            }
            other => {
                debug!(item_type = other, "unknown codex item type");
                vec![]
            }
        }
    }

    fn handle_turn_completed(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        self.usage = extract_usage(raw.get("usage"));
        self.complete(true)
    }

    fn handle_turn_failed(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        let message = raw
            .get("error")
            .and_then(|e| str_field(e, "message"))
            .unwrap_or("turn failed")
            .to_string();
        let mut events = vec![TakopiEvent::Error { message }];
        events.extend(self.complete(false));
        events
    }

    fn complete(&mut self, ok: bool) -> Vec<TakopiEvent> {
        let Some(resume) = self.session.clone() else {
            debug!("codex turn ended before thread.started, dropping completion");
            return vec![];
        };
        vec![TakopiEvent::RunCompleted {
            result: RunResult {
                resume,
                answer: self.last_message.clone(),
                ok,
                usage: self.usage.take(),
            },
        }]
    }
}

impl Translator for CodexTranslator {
    fn engine(&self) -> EngineId {
        EngineId::Codex
    }

    fn translate(&mut self, raw: &Value) -> Vec<TakopiEvent> {
        match str_field(raw, "type") {
            Some("thread.started") => self.handle_thread_started(raw),
            Some("item.started") => self.handle_item(raw, false),
            // Updates restate in-progress state; the completed item is what
            // carries the outcome.
            Some("item.updated") => vec![],
            Some("item.completed") => self.handle_item(raw, true),
            Some("turn.completed") => self.handle_turn_completed(raw),
            Some("turn.failed") => self.handle_turn_failed(raw),
            Some("error") => {
                let message = str_field(raw, "message").unwrap_or("agent error").to_string();
                vec![TakopiEvent::Error { message }]
            }
            Some("turn.started") => vec![],
            other => {
                debug!(msg_type = ?other, "unknown codex message type");
                vec![]
            }
        }
    }

    fn fallback_answer(&self) -> Option<String> {
        self.last_message.clone()
    }
}

fn item_action(item_type: &str, id: &str, item: &Value) -> Action {
    match item_type {
        "command_execution" => {
            let command = str_field(item, "command").unwrap_or("shell");
            Action::new(id, ActionKind::Command, first_line(command, 120))
        }
        "file_change" => {
            let title = item
                .get("changes")
                .and_then(Value::as_array)
                .map_or_else(
                    || "apply changes".to_string(),
                    |changes| {
                        let paths: Vec<&str> = changes
                            .iter()
                            .filter_map(|c| str_field(c, "path"))
                            .collect();
                        match paths.as_slice() {
                            [] => "apply changes".to_string(),
                            [only] => (*only).to_string(),
                            [first, rest @ ..] => format!("{} (+{} more)", first, rest.len()),
                        }
                    },
                );
            Action::new(id, ActionKind::FileChange, title)
        }
        "web_search" => {
            let query = str_field(item, "query").unwrap_or("web search");
            Action::new(id, ActionKind::WebSearch, truncate_str(query, 120))
        }
        _ => {
            // mcp_tool_call
            let title = match (str_field(item, "server"), str_field(item, "tool")) {
                (Some(server), Some(tool)) => format!("{server}:{tool}"),
                (_, Some(tool)) => tool.to_string(),
                _ => "tool call".to_string(),
            };
            Action::new(id, ActionKind::Tool, title)
        }
    }
}

fn item_ok(item_type: &str, item: &Value) -> bool {
    match item_type {
        "command_execution" => item
            .get("exit_code")
            .and_then(Value::as_i64)
            .is_none_or(|code| code == 0),
        _ => str_field(item, "status").is_none_or(|s| s != "failed"),
    }
}

fn extract_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    let extracted = Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cached_tokens: field("cached_input_tokens"),
        cost_usd: None,
    };
    (!extracted.is_empty()).then_some(extracted)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn translate_line(translator: &mut CodexTranslator, line: &str) -> Vec<TakopiEvent> {
        translator.translate(&serde_json::from_str(line).unwrap())
    }

    fn started(tr: &mut CodexTranslator) {
        let events = translate_line(tr, r#"{"type":"thread.started","thread_id":"th-1"}"#);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn thread_started_mints_token_once() {
        let mut tr = CodexTranslator::new();
        let events = translate_line(&mut tr, r#"{"type":"thread.started","thread_id":"th-1"}"#);
        match &events[0] {
            TakopiEvent::SessionStarted { resume, .. } => {
                assert_eq!(resume, &ResumeToken::new(EngineId::Codex, "th-1"));
            }
            other => panic!("expected SessionStarted, got {other:?}"),
        }
        assert!(
            translate_line(&mut tr, r#"{"type":"thread.started","thread_id":"th-1"}"#).is_empty()
        );
    }

    #[test]
    fn command_item_lifecycle() {
        let mut tr = CodexTranslator::new();
        started(&mut tr);

        let events = translate_line(
            &mut tr,
            r#"{"type":"item.started","item":{"id":"item_0","item_type":"command_execution",
                "command":"cargo build\n"}}"#,
        );
        match &events[0] {
            TakopiEvent::ActionStarted { action } => {
                assert_eq!(action.kind, ActionKind::Command);
                assert_eq!(action.title, "cargo build");
            }
            other => panic!("expected ActionStarted, got {other:?}"),
        }

        let events = translate_line(
            &mut tr,
            r#"{"type":"item.completed","item":{"id":"item_0","item_type":"command_execution",
                "command":"cargo build","exit_code":1}}"#,
        );
        match &events[0] {
            TakopiEvent::ActionCompleted { action } => {
                assert_eq!(action.id, "item_0");
                assert_eq!(action.ok, Some(false));
            }
            other => panic!("expected ActionCompleted, got {other:?}"),
        }
    }

    #[test]
    fn file_change_titles_summarize_paths() {
        let mut tr = CodexTranslator::new();
        started(&mut tr);
        let events = translate_line(
            &mut tr,
            r#"{"type":"item.completed","item":{"id":"i","item_type":"file_change",
                "changes":[{"path":"src/lib.rs","kind":"update"},{"path":"src/main.rs","kind":"update"}]}}"#,
        );
        match &events[0] {
            TakopiEvent::ActionCompleted { action } => {
                assert_eq!(action.kind, ActionKind::FileChange);
                assert_eq!(action.title, "src/lib.rs (+1 more)");
            }
            other => panic!("expected ActionCompleted, got {other:?}"),
        }
    }

    #[test]
    fn agent_message_becomes_the_answer() {
        let mut tr = CodexTranslator::new();
        started(&mut tr);
        translate_line(
            &mut tr,
            r#"{"type":"item.completed","item":{"id":"i","item_type":"agent_message","text":"all done"}}"#,
        );
        let events = translate_line(
            &mut tr,
            r#"{"type":"turn.completed","usage":{"input_tokens":7,"cached_input_tokens":3,"output_tokens":2}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            TakopiEvent::RunCompleted { result } => {
                assert!(result.ok);
                assert_eq!(result.answer.as_deref(), Some("all done"));
                let usage = result.usage.as_ref().unwrap();
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.cached_tokens, 3);
            }
            other => panic!("expected RunCompleted, got {other:?}"),
        }
    }

    #[test]
    fn turn_failed_emits_error_then_failed_completion() {
        let mut tr = CodexTranslator::new();
        started(&mut tr);
        let events = translate_line(
            &mut tr,
            r#"{"type":"turn.failed","error":{"message":"model overloaded"}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[0], TakopiEvent::Error { message } if message == "model overloaded")
        );
        match &events[1] {
            TakopiEvent::RunCompleted { result } => {
                assert!(!result.ok);
                assert_eq!(result.resume.value, "th-1");
            }
            other => panic!("expected RunCompleted, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_surfaces_as_completed_note() {
        let mut tr = CodexTranslator::new();
        started(&mut tr);
        let events = translate_line(
            &mut tr,
            r#"{"type":"item.completed","item":{"id":"r1","item_type":"reasoning",
                "text":"Inspecting the build script\nmore detail"}}"#,
        );
        match &events[0] {
            TakopiEvent::ActionCompleted { action } => {
                assert_eq!(action.kind, ActionKind::Note);
                assert_eq!(action.title, "Inspecting the build script");
            }
            other => panic!("expected ActionCompleted, got {other:?}"),
        }
    }

    #[test]
    fn mcp_tool_call_titles_server_and_tool() {
        let mut tr = CodexTranslator::new();
        started(&mut tr);
        let events = translate_line(
            &mut tr,
            r#"{"type":"item.started","item":{"id":"m1","item_type":"mcp_tool_call",
                "server":"github","tool":"create_issue"}}"#,
        );
        match &events[0] {
            TakopiEvent::ActionStarted { action } => {
                assert_eq!(action.kind, ActionKind::Tool);
                assert_eq!(action.title, "github:create_issue");
            }
            other => panic!("expected ActionStarted, got {other:?}"),
        }
    }

    #[test]
    fn completion_without_thread_is_dropped() {
        let mut tr = CodexTranslator::new();
        assert!(translate_line(&mut tr, r#"{"type":"turn.completed"}"#).is_empty());
    }

    #[test]
    fn unknown_shapes_are_tolerated() {
        let mut tr = CodexTranslator::new();
        assert!(translate_line(&mut tr, r#"{"type":"future.event"}"#).is_empty());
        assert!(
            translate_line(
                &mut tr,
                r#"{"type":"item.completed","item":{"id":"x","item_type":"hologram"}}"#
            )
            .is_empty()
        );
    }
}
