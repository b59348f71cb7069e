//! Priority-ordered, coalescing work queue with a single worker.
//!
//! Requests carry a scope key (the rate-limit domain, e.g. one chat), a
//! priority, an optional earliest-dispatch instant and an optional coalesce
//! key. The worker repeatedly peeks the head of the highest-priority
//! non-empty queue, waits for the limiter to clear it, re-validates that the
//! head was not superseded while sleeping, commits the limiter, and executes.
//! A `RetryAfter` from execution is absorbed by the limiter and the request
//! is retried rather than failed; every request resolves exactly once.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::limiter::RateLimiter;

/// Priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Terminal messages and interactive replies.
    High,
    /// Ordinary outbound messages.
    Normal,
    /// Progress edits; safe to delay or supersede.
    Low,
}

impl Priority {
    const COUNT: usize = 3;

    const fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Errors surfaced by request execution or the pump itself.
#[derive(Debug, Error)]
pub enum PumpError {
    /// External throttling signal; absorbed by the limiter, never surfaced
    /// to waiters.
    #[error("rate limited, retry after {0:?}")]
    RetryAfter(Duration),

    /// Delivery failed for a non-throttling reason.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Resolution of one request: `Ok(None)` means superseded, dropped or
/// drained at close; `Ok(Some(_))` is the execution result.
pub type PumpResult<R> = Result<Option<R>, PumpError>;

type ExecuteFuture<R> = Pin<Box<dyn Future<Output = Result<R, PumpError>> + Send>>;
type ExecuteFn<R> = Box<dyn FnMut() -> ExecuteFuture<R> + Send>;

/// One unit of outbound work.
pub struct PumpRequest<R> {
    execute: ExecuteFn<R>,
    priority: Priority,
    scope: String,
    not_before: Option<Instant>,
    coalesce_key: Option<String>,
}

impl<R> PumpRequest<R> {
    /// Build a request around an execute closure. The closure may be called
    /// again after a retry-after backoff, so it is `FnMut` over owned state.
    pub fn new<F, Fut>(scope: impl Into<String>, priority: Priority, mut execute: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, PumpError>> + Send + 'static,
    {
        Self {
            execute: Box::new(move || Box::pin(execute())),
            priority,
            scope: scope.into(),
            not_before: None,
            coalesce_key: None,
        }
    }

    /// Delay dispatch until at least `instant`.
    #[must_use]
    pub fn not_before(mut self, instant: Instant) -> Self {
        self.not_before = Some(instant);
        self
    }

    /// Mark this request as superseding any pending request with the same key.
    #[must_use]
    pub fn coalesce_key(mut self, key: impl Into<String>) -> Self {
        self.coalesce_key = Some(key.into());
        self
    }
}

struct Entry<R> {
    id: u64,
    request: PumpRequest<R>,
    resolve: Option<oneshot::Sender<PumpResult<R>>>,
}

impl<R> Entry<R> {
    fn resolve(&mut self, result: PumpResult<R>) {
        if let Some(tx) = self.resolve.take() {
            // Fire-and-forget callers drop the receiver; that is fine.
            let _ = tx.send(result);
        }
    }
}

struct State<R> {
    queues: [VecDeque<Entry<R>>; Priority::COUNT],
    next_id: u64,
    closed: bool,
}

impl<R> State<R> {
    /// Head of the highest-priority non-empty queue.
    fn peek_head(&self) -> Option<(usize, u64, String, Option<Instant>)> {
        self.queues.iter().enumerate().find_map(|(idx, queue)| {
            queue.front().map(|entry| {
                (
                    idx,
                    entry.id,
                    entry.request.scope.clone(),
                    entry.request.not_before,
                )
            })
        })
    }

    /// Queue and position of the pending entry under `key`, if any.
    fn find_coalesced(&self, key: &str) -> Option<(usize, usize)> {
        self.queues.iter().enumerate().find_map(|(qi, queue)| {
            queue
                .iter()
                .position(|e| e.request.coalesce_key.as_deref() == Some(key))
                .map(|pos| (qi, pos))
        })
    }

    fn drain(&mut self) {
        for queue in &mut self.queues {
            for mut entry in queue.drain(..) {
                entry.resolve(Ok(None));
            }
        }
    }
}

/// Single-worker delivery pump over a [`RateLimiter`].
pub struct RequestPump<R> {
    state: Arc<Mutex<State<R>>>,
    changed: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Send + 'static> RequestPump<R> {
    /// Start a pump whose scopes are spaced by `interval` (zero = unlimited).
    pub fn new(interval: Duration) -> Self {
        let limiter = Arc::new(RateLimiter::new(interval));
        let state = Arc::new(Mutex::new(State {
            queues: std::array::from_fn(|_| VecDeque::new()),
            next_id: 0,
            closed: false,
        }));
        let changed = Arc::new(Notify::new());

        let worker = tokio::spawn(worker_loop(
            limiter,
            Arc::clone(&state),
            Arc::clone(&changed),
        ));

        Self {
            state,
            changed,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a request. With `wait`, blocks until the request resolves and
    /// returns its result; otherwise returns `Ok(None)` immediately and the
    /// request runs fire-and-forget.
    pub async fn enqueue(&self, request: PumpRequest<R>, wait: bool) -> PumpResult<R> {
        let (tx, rx) = oneshot::channel();
        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(None);
            }
            state.next_id += 1;
            let entry = Entry {
                id: state.next_id,
                request,
                resolve: Some(tx),
            };

            let coalesced = entry
                .request
                .coalesce_key
                .as_deref()
                .and_then(|key| state.find_coalesced(key));
            match coalesced {
                Some((qi, pos)) => {
                    trace!(
                        coalesce_key = ?entry.request.coalesce_key,
                        "superseding pending request"
                    );
                    // Replace in place: the newer request inherits the queue
                    // position of the one it supersedes.
                    let mut replaced = std::mem::replace(&mut state.queues[qi][pos], entry);
                    replaced.resolve(Ok(None));
                }
                None => {
                    let idx = entry.request.priority.index();
                    state.queues[idx].push_back(entry);
                }
            }
        }
        self.changed.notify_one();

        if wait {
            // An error here means the pump vanished before resolving, which
            // callers treat like a drained request.
            rx.await.unwrap_or(Ok(None))
        } else {
            Ok(None)
        }
    }

    /// Cancel any pending request under `coalesce_key`, resolving it with
    /// `Ok(None)`. Used when a newer update supersedes an unconfirmed one.
    pub fn drop_pending(&self, coalesce_key: &str) {
        let removed = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            state
                .find_coalesced(coalesce_key)
                .and_then(|(qi, pos)| state.queues[qi].remove(pos))
        };
        if let Some(mut entry) = removed {
            entry.resolve(Ok(None));
            self.changed.notify_one();
        }
    }

    /// Stop the worker and resolve everything still queued with `Ok(None)`.
    /// An in-flight request finishes executing first.
    pub async fn close(&self) {
        let handle = {
            #[allow(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.drain();
            #[allow(clippy::unwrap_used)]
            self.worker.lock().unwrap().take()
        };
        self.changed.notify_one();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn worker_loop<R: Send + 'static>(
    limiter: Arc<RateLimiter>,
    state: Arc<Mutex<State<R>>>,
    changed: Arc<Notify>,
) {
    loop {
        let head = {
            #[allow(clippy::unwrap_used)]
            let state = state.lock().unwrap();
            if state.closed {
                break;
            }
            state.peek_head()
        };

        let Some((queue_idx, id, scope, not_before)) = head else {
            changed.notified().await;
            continue;
        };

        let ready_at = limiter.peek_ready_at(&scope, not_before);
        tokio::select! {
            () = tokio::time::sleep_until(ready_at) => {}
            // State changed while waiting: the head may have been superseded,
            // dropped, or outranked by a higher-priority arrival.
            () = changed.notified() => continue,
        }

        let entry = {
            #[allow(clippy::unwrap_used)]
            let mut state = state.lock().unwrap();
            if state.closed {
                break;
            }
            match state.peek_head() {
                Some((idx, head_id, ..)) if idx == queue_idx && head_id == id => {
                    limiter.commit(&scope, ready_at);
                    state.queues[queue_idx].pop_front()
                }
                _ => continue,
            }
        };
        let Some(mut entry) = entry else { continue };

        debug!(scope = %scope, "dispatching pump request");
        loop {
            match (entry.request.execute)().await {
                Ok(result) => {
                    entry.resolve(Ok(Some(result)));
                    break;
                }
                Err(PumpError::RetryAfter(delay)) => {
                    // Backoff is the limiter's job; the request itself is
                    // retried, never failed.
                    limiter.apply_retry_after(&scope, delay).await;
                }
                Err(err) => {
                    entry.resolve(Err(err));
                    break;
                }
            }
        }
    }

    // Late drain: anything enqueued between the close flag and our exit.
    #[allow(clippy::unwrap_used)]
    state.lock().unwrap().drain();
}
