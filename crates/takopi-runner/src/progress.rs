//! Debounced progress publishing.
//!
//! Accumulates run events into a compact progress rendering and pushes it
//! through the request pump at most once per interval. Identical re-renders
//! are suppressed before they reach the pump, and a newer edit supersedes an
//! unconfirmed older one via the pump's coalescing. Dropped intermediate
//! edits are acceptable; the terminal message is sent by the transport
//! outside this publisher.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use takopi_core::config::ProgressConfig;
use takopi_core::event::{EngineId, ResumeToken, TakopiEvent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::pump::{Priority, PumpError, PumpRequest, RequestPump};

/// Delivery seam the transport implements: push rendered progress text.
pub trait ProgressSink<R>: Send + Sync + 'static {
    fn deliver(&self, text: String) -> Pin<Box<dyn Future<Output = Result<R, PumpError>> + Send>>;
}

impl<R, F> ProgressSink<R> for F
where
    F: Fn(String) -> Pin<Box<dyn Future<Output = Result<R, PumpError>> + Send>>
        + Send
        + Sync
        + 'static,
{
    fn deliver(&self, text: String) -> Pin<Box<dyn Future<Output = Result<R, PumpError>> + Send>> {
        self(text)
    }
}

struct Line {
    action_id: Option<String>,
    text: String,
}

struct ProgressState {
    steps: u64,
    lines: VecDeque<Line>,
    resume: Option<ResumeToken>,
    /// Bumped by every state change; the publish loop chases it.
    version: u64,
    published_version: u64,
    last_published: Option<String>,
    last_publish_at: Option<Instant>,
    stopped: bool,
}

struct Shared {
    state: Mutex<ProgressState>,
    dirty: Notify,
    engine: EngineId,
    max_lines: usize,
}

impl Shared {
    fn render(&self) -> String {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
        let state = self.state.lock().unwrap();
        let mut out = format!("{} working · {} steps", self.engine, state.steps);
        for line in &state.lines {
            out.push('\n');
            out.push_str(&line.text);
        }
        out
    }
}

/// Debounced, deduplicated progress pusher for one run.
pub struct ProgressPublisher<R: Send + 'static> {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R: Send + 'static> ProgressPublisher<R> {
    /// Start the publish loop. `scope` is the pump's rate-limit domain and
    /// `coalesce_key` identifies this run's progress message within it.
    pub fn start(
        engine: EngineId,
        pump: Arc<RequestPump<R>>,
        sink: Arc<dyn ProgressSink<R>>,
        scope: impl Into<String>,
        coalesce_key: impl Into<String>,
        config: &ProgressConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ProgressState {
                steps: 0,
                lines: VecDeque::new(),
                resume: None,
                version: 0,
                published_version: 0,
                last_published: None,
                last_publish_at: None,
                stopped: false,
            }),
            dirty: Notify::new(),
            engine,
            max_lines: config.max_action_lines.max(1),
        });

        let task = tokio::spawn(publish_loop(
            Arc::clone(&shared),
            pump,
            sink,
            scope.into(),
            coalesce_key.into(),
            config.publish_interval(),
        ));

        Self {
            shared,
            task,
            _marker: std::marker::PhantomData,
        }
    }

    /// Fold one run event into the progress state. Returns whether the event
    /// is visible in the rendered progress; invisible events neither dirty
    /// the state nor wake the publish loop.
    pub fn note_event(&self, event: &TakopiEvent) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut state = self.shared.state.lock().unwrap();
        let visible = match event {
            TakopiEvent::SessionStarted { resume, .. } => {
                state.resume = Some(resume.clone());
                false
            }
            TakopiEvent::ActionStarted { action } => {
                state.steps += 1;
                let text = format!("… {}", action.title);
                push_line(&mut state, self.shared.max_lines, Some(&action.id), text);
                true
            }
            TakopiEvent::ActionCompleted { action } => {
                let glyph = if action.ok.unwrap_or(true) { "✓" } else { "✗" };
                let text = format!("{glyph} {}", action.title);
                let existing = state
                    .lines
                    .iter()
                    .rposition(|l| l.action_id.as_deref() == Some(action.id.as_str()));
                if let Some(pos) = existing {
                    state.lines[pos].text = text;
                } else {
                    // Completed without a visible start (scrolled off or
                    // emitted complete-only, like reasoning notes).
                    state.steps += 1;
                    push_line(&mut state, self.shared.max_lines, Some(&action.id), text);
                }
                true
            }
            TakopiEvent::Log { text } => {
                let text = format!("· {text}");
                push_line(&mut state, self.shared.max_lines, None, text);
                true
            }
            TakopiEvent::Error { message } => {
                let text = format!("! {message}");
                push_line(&mut state, self.shared.max_lines, None, text);
                true
            }
            // The terminal message is the transport's to send; the progress
            // rendering does not change.
            TakopiEvent::RunCompleted { .. } => false,
        };
        if visible {
            state.version += 1;
            drop(state);
            self.shared.dirty.notify_one();
        }
        visible
    }

    /// Resume token observed so far, for transports composing the final
    /// message while the run is still streaming.
    pub fn resume(&self) -> Option<ResumeToken> {
        #[allow(clippy::unwrap_used)]
        let state = self.shared.state.lock().unwrap();
        state.resume.clone()
    }

    /// Current rendering, as the publish loop would push it.
    pub fn rendered(&self) -> String {
        self.shared.render()
    }

    /// Stop the publish loop. Unpublished intermediate state is dropped.
    pub async fn finish(self) {
        {
            #[allow(clippy::unwrap_used)]
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
        }
        self.shared.dirty.notify_one();
        let _ = self.task.await;
    }
}

fn push_line(state: &mut ProgressState, max_lines: usize, action_id: Option<&str>, text: String) {
    if state.lines.len() == max_lines {
        state.lines.pop_front();
    }
    state.lines.push_back(Line {
        action_id: action_id.map(String::from),
        text,
    });
}

#[allow(clippy::significant_drop_tightening)]
async fn publish_loop<R: Send + 'static>(
    shared: Arc<Shared>,
    pump: Arc<RequestPump<R>>,
    sink: Arc<dyn ProgressSink<R>>,
    scope: String,
    coalesce_key: String,
    interval: Duration,
) {
    loop {
        shared.dirty.notified().await;
        loop {
            let (version, earliest) = {
                #[allow(clippy::unwrap_used)]
                let state = shared.state.lock().unwrap();
                if state.stopped {
                    return;
                }
                if state.version == state.published_version {
                    break;
                }
                (
                    state.version,
                    state.last_publish_at.map(|at| at + interval),
                )
            };

            // Never publish more often than the interval.
            if let Some(earliest) = earliest {
                tokio::time::sleep_until(earliest).await;
            }

            let text = shared.render();
            let unchanged = {
                #[allow(clippy::unwrap_used)]
                let mut state = shared.state.lock().unwrap();
                if state.stopped {
                    return;
                }
                if state.last_published.as_deref() == Some(text.as_str()) {
                    // Identical re-render: suppressed before the pump.
                    state.published_version = state.published_version.max(version);
                    true
                } else {
                    false
                }
            };
            if unchanged {
                continue;
            }

            let request = {
                let sink = Arc::clone(&sink);
                let text = text.clone();
                PumpRequest::new(scope.clone(), Priority::Low, move || {
                    sink.deliver(text.clone())
                })
                .coalesce_key(coalesce_key.clone())
            };

            let outcome = pump.enqueue(request, true).await;
            #[allow(clippy::unwrap_used)]
            let mut state = shared.state.lock().unwrap();
            match outcome {
                Ok(Some(_)) => {
                    state.last_published = Some(text);
                    state.last_publish_at = Some(Instant::now());
                }
                Ok(None) => {
                    // Superseded or pump closing; this edit is expendable.
                    debug!("progress edit dropped");
                }
                Err(err) => {
                    debug!(error = %err, "progress publish failed, dropping edit");
                }
            }
            state.published_version = state.published_version.max(version);
        }
    }
}
