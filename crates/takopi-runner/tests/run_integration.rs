#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end runner tests against fake agents.
//!
//! The fake agent is a `sh -c` script speaking the Claude stream-json
//! protocol on stdout, so the full pipeline is exercised: spawn, prompt on
//! stdin, line decoding, translation, session locking, exit classification
//! and teardown. No real agent CLI is involved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use takopi_core::config::Config;
use takopi_core::event::{EngineId, ResumeToken, TakopiEvent};
use takopi_core::protocol::{ClaudeTranslator, Translator};
use takopi_runner::locks::SessionLockRegistry;
use takopi_runner::runner::{Engine, Runner, RunnerError};
use takopi_runner::subprocess::SpawnSpec;
use tokio::sync::Semaphore;

/// Fake agent: a shell script that speaks the Claude stream-json protocol.
struct ScriptEngine {
    script: String,
}

impl ScriptEngine {
    fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Engine for ScriptEngine {
    fn id(&self) -> EngineId {
        EngineId::Claude
    }

    fn spawn_spec(&self, _resume: Option<&ResumeToken>) -> SpawnSpec {
        SpawnSpec::new("sh").args(["-c", &self.script])
    }

    fn translator(&self) -> Box<dyn Translator> {
        Box::new(ClaudeTranslator::new())
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.runner.idle_timeout_secs = 1;
    config.runner.terminate_grace_secs = 1;
    config
}

fn runner_for(script: &str, config: &Config) -> Runner {
    Runner::new(
        Arc::new(ScriptEngine::new(script)),
        SessionLockRegistry::new(),
        Arc::new(Semaphore::new(4)),
        config,
    )
}

async fn collect_events(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<TakopiEvent>,
) -> Vec<TakopiEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn streams_actions_then_completes() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"it-1","model":"claude-sonnet-4"}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","is_error":false}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"done"}'
"#;
    let runner = runner_for(script, &test_config());
    assert_eq!(runner.engine_id(), EngineId::Claude);
    let mut handle = runner.start("list the files", None).unwrap();
    let rx = handle.take_events();
    let (events, result) = tokio::join!(collect_events(rx), handle.join());

    assert_eq!(events.len(), 4);
    assert!(matches!(
        &events[0],
        TakopiEvent::SessionStarted { resume, .. } if resume.value == "it-1"
    ));
    assert!(matches!(
        &events[1],
        TakopiEvent::ActionStarted { action } if action.id == "t1"
    ));
    assert!(matches!(
        &events[2],
        TakopiEvent::ActionCompleted { action } if action.ok == Some(true)
    ));
    assert!(events[3].is_terminal());

    let result = result.unwrap();
    assert!(result.ok);
    assert_eq!(result.answer.as_deref(), Some("done"));
    assert_eq!(result.resume, ResumeToken::new(EngineId::Claude, "it-1"));
}

// =========================================================================
// Exit classification
// =========================================================================

#[tokio::test]
async fn nonzero_exit_with_answer_is_a_soft_failure() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"soft-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"half an answer"}]}}'
exit 3
"#;
    let runner = runner_for(script, &test_config());
    let mut handle = runner.start("try", None).unwrap();
    let rx = handle.take_events();
    let (events, result) = tokio::join!(collect_events(rx), handle.join());

    let result = result.unwrap();
    assert!(!result.ok);
    assert_eq!(result.answer.as_deref(), Some("half an answer"));
    assert_eq!(result.resume.value, "soft-1");

    // A synthesized error plus the terminal event reach the consumer.
    assert!(events.iter().any(|e| matches!(e, TakopiEvent::Error { .. })));
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn nonzero_exit_without_answer_fails() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"hard-1"}'
echo 'fatal: credentials missing' >&2
exit 2
"#;
    let runner = runner_for(script, &test_config());
    let handle = runner.start("try", None).unwrap();
    let err = handle.join().await.unwrap_err();
    match err {
        RunnerError::AgentFailed { code, stderr } => {
            assert_eq!(code, Some(2));
            assert!(stderr.contains("credentials missing"));
        }
        other => panic!("expected AgentFailed, got {other}"),
    }
}

#[tokio::test]
async fn exit_without_session_fails() {
    let script = r#"read prompt
echo 'not even json' >&2
exit 1
"#;
    let runner = runner_for(script, &test_config());
    let handle = runner.start("try", None).unwrap();
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, RunnerError::NoSession { .. }));
}

#[tokio::test]
async fn undecodable_lines_are_skipped_not_fatal() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"junk-1"}'
echo 'this is not json'
echo '{"type":"result","subtype":"success","result":"survived"}'
"#;
    let runner = runner_for(script, &test_config());
    let handle = runner.start("go", None).unwrap();
    let result = handle.join().await.unwrap();
    assert!(result.ok);
    assert_eq!(result.answer.as_deref(), Some("survived"));
}

// =========================================================================
// Idle timeout
// =========================================================================

#[tokio::test]
async fn idle_timeout_after_session_aborts_with_token() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"idle-1"}'
sleep 30
"#;
    let runner = runner_for(script, &test_config());
    let started = Instant::now();
    let mut handle = runner.start("stall", None).unwrap();
    let rx = handle.take_events();
    let (events, result) = tokio::join!(collect_events(rx), handle.join());

    // Aborted by the 1s idle bound, not the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(15));

    let result = result.unwrap();
    assert!(!result.ok);
    assert_eq!(result.resume.value, "idle-1");

    let error_pos = events
        .iter()
        .position(|e| matches!(e, TakopiEvent::Error { .. }))
        .unwrap();
    assert!(events[error_pos + 1].is_terminal());
}

#[tokio::test]
async fn slow_start_is_not_an_idle_timeout() {
    // Silence before the session event must not trip the idle bound.
    let script = r#"read prompt
sleep 2
echo '{"type":"system","subtype":"init","session_id":"slow-1"}'
echo '{"type":"result","subtype":"success","result":"warmed up"}'
"#;
    let runner = runner_for(script, &test_config());
    let handle = runner.start("warm up", None).unwrap();
    let result = handle.join().await.unwrap();
    assert!(result.ok);
    assert_eq!(result.answer.as_deref(), Some("warmed up"));
}

// =========================================================================
// Session locking
// =========================================================================

#[tokio::test]
async fn runs_sharing_a_token_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order.log");
    let script = format!(
        r#"read prompt
echo "start $prompt" >> {log}
echo '{{"type":"system","subtype":"init","session_id":"shared"}}'
sleep 0.3
echo "end $prompt" >> {log}
echo '{{"type":"result","subtype":"success","result":"ok"}}'
"#,
        log = log.display()
    );

    let locks = SessionLockRegistry::new();
    let permits = Arc::new(Semaphore::new(4));
    let config = test_config();
    let runner = Runner::new(
        Arc::new(ScriptEngine::new(script)),
        locks.clone(),
        permits,
        &config,
    );

    let token = ResumeToken::new(EngineId::Claude, "shared");
    let first = runner.start("one", Some(token.clone())).unwrap();
    let second = runner.start("two", Some(token)).unwrap();

    let (r1, r2) = tokio::join!(first.join(), second.join());
    r1.unwrap();
    r2.unwrap();

    let order: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(String::from)
        .collect();
    assert_eq!(order, ["start one", "end one", "start two", "end two"]);
    // Both guards released: the registry swept its entries.
    assert!(locks.is_empty());
}

#[tokio::test]
async fn conflicting_session_ids_are_fatal() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"first"}'
echo '{"type":"system","subtype":"init","session_id":"second"}'
sleep 5
"#;
    let runner = runner_for(script, &test_config());
    let handle = runner.start("conflict", None).unwrap();
    let err = handle.join().await.unwrap_err();
    assert!(matches!(
        err,
        RunnerError::SessionConflict { previous, current }
            if previous == "first" && current == "second"
    ));
}

// =========================================================================
// Cancellation
// =========================================================================

#[tokio::test]
async fn cancel_mid_stream_tears_down_quickly() {
    let script = r#"read prompt
echo '{"type":"system","subtype":"init","session_id":"cancel-1"}'
sleep 30
"#;
    let mut config = test_config();
    config.runner.idle_timeout_secs = 60; // only cancellation may end this run
    let runner = runner_for(script, &config);
    let mut handle = runner.start("long task", None).unwrap();

    // Wait until the run is streaming.
    let first = handle.events().recv().await.unwrap();
    assert!(matches!(first, TakopiEvent::SessionStarted { .. }));

    let started = Instant::now();
    handle.cancel();
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, RunnerError::Cancelled));
    // SIGTERM ends sh well inside the grace period.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn cancel_escalates_to_sigkill_for_stubborn_agents() {
    // Ignored TERM survives the exec, so only SIGKILL can end the sleep.
    let script = r#"trap '' TERM
read prompt
echo '{"type":"system","subtype":"init","session_id":"stubborn-1"}'
exec sleep 30
"#;
    let mut config = test_config();
    config.runner.idle_timeout_secs = 60;
    let runner = runner_for(script, &config);
    let mut handle = runner.start("long task", None).unwrap();
    handle.events().recv().await.unwrap();

    let started = Instant::now();
    handle.cancel();
    let err = handle.join().await.unwrap_err();
    assert!(matches!(err, RunnerError::Cancelled));
    // Waited out the 1s grace, then SIGKILL; nowhere near the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(15));
}

// =========================================================================
// Concurrency bound
// =========================================================================

#[tokio::test]
async fn global_semaphore_bounds_concurrent_runs() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("events.log");
    let script = format!(
        r#"read prompt
echo "+" >> {log}
echo "{{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"bound-$prompt\"}}"
sleep 0.3
echo "-" >> {log}
echo '{{"type":"result","subtype":"success","result":"ok"}}'
"#,
        log = log.display()
    );

    let config = test_config();
    let runner = Runner::new(
        Arc::new(ScriptEngine::new(script)),
        SessionLockRegistry::new(),
        Arc::new(Semaphore::new(1)),
        &config,
    );

    let a = runner.start("a", None).unwrap();
    let b = runner.start("b", None).unwrap();
    let (ra, rb) = tokio::join!(a.join(), b.join());
    ra.unwrap();
    rb.unwrap();

    // With one permit the +/- markers never interleave.
    let marks: String = std::fs::read_to_string(&log).unwrap().replace('\n', "");
    assert_eq!(marks, "+-+-");
}
