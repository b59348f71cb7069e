//! Ordered single-consumer event delivery.
//!
//! Decouples the runner's subprocess read loop from a slower consumer: the
//! producer emits without blocking while a single drain task feeds events to
//! the consumer one at a time, in order. A consumer failure stops draining
//! and is re-raised from `close()`, so the run learns about it without any
//! already-delivered event being reordered or lost.

use std::future::Future;
use std::pin::Pin;

use takopi_core::TakopiEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

type ConsumerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Single-consumer event queue with its own drain task.
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<TakopiEvent>,
    drain: JoinHandle<anyhow::Result<()>>,
}

impl EventDispatcher {
    /// Start a dispatcher draining into `consumer`.
    pub fn spawn<F>(mut consumer: F) -> Self
    where
        F: FnMut(TakopiEvent) -> ConsumerFuture + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<TakopiEvent>();
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                consumer(event).await?;
            }
            Ok(())
        });
        Self { tx, drain }
    }

    /// Append an event for delivery. Non-blocking; events emitted after the
    /// drain stopped (consumer failure or close) are silently dropped.
    pub fn emit(&self, event: TakopiEvent) {
        if self.tx.send(event).is_err() {
            debug!("event emitted after dispatcher stopped, dropping");
        }
    }

    /// Wait for all queued events to be delivered, re-raising any consumer
    /// failure.
    pub async fn close(self) -> anyhow::Result<()> {
        drop(self.tx);
        match self.drain.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::anyhow!("event drain task failed: {join_err}")),
        }
    }

    /// Wrap a plain async closure as a boxed consumer.
    pub fn consumer<F, Fut>(mut f: F) -> impl FnMut(TakopiEvent) -> ConsumerFuture + Send + 'static
    where
        F: FnMut(TakopiEvent) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        move |event| Box::pin(f(event)) as ConsumerFuture
    }
}
