//! Bounded-concurrency map over a sequence.
//!
//! A feeder task pulls the source and starts one worker per item. Each
//! worker holds a slot (a semaphore permit) from the moment it starts until
//! its result is handed to the consumer, so at most `concurrency` workers
//! are ever outstanding, and a slot is refilled as soon as its result is
//! delivered. The source is pulled only when a slot is free.
//!
//! ```text
//!   source ──▶ feeder ──▶ [slot][slot][slot] ──▶ consumer
//!                            │     │     │
//!                          worker worker worker   (≤ concurrency tasks)
//! ```
//!
//! The ordered variant queues workers in input order and delivers the head
//! once it completes. The unordered variant delivers whichever worker
//! finishes first. Delivery never waits on the source. Either way, the first
//! failure (from a worker or from the source) ends the sequence: the feeder
//! stops, outstanding workers run on unobserved and their results are
//! discarded. Dropping the sequence cancels outstanding work.

use std::any::Any;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{stream, FutureExt, StreamExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};

use pipewright_types::{PipelineError, Result};

use crate::config::{default_concurrency, RuntimeConfig};
use crate::seq::Enumerable;

/// Options for [`Enumerable::concurrent_map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyOptions {
    /// Maximum workers in flight.
    pub concurrency: NonZeroUsize,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl ConcurrencyOptions {
    /// At most `n` workers in flight. Zero is clamped to 1.
    pub fn new(n: usize) -> Self {
        Self {
            concurrency: NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Use the configured default.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            concurrency: config.concurrency,
        }
    }
}

impl From<usize> for ConcurrencyOptions {
    fn from(n: usize) -> Self {
        Self::new(n)
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> PipelineError {
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    PipelineError::message(format!("worker panicked: {msg}"))
}

fn cancelled() -> PipelineError {
    PipelineError::message("worker cancelled")
}

/// Drive one worker future. `None` if the map was abandoned first.
async fn run_worker<U, Fut>(fut: Fut, abandon: CancellationToken) -> Option<Result<U>>
where
    Fut: Future<Output = Result<U>>,
{
    tokio::select! {
        biased;
        _ = abandon.cancelled() => None,
        outcome = AssertUnwindSafe(fut).catch_unwind() => Some(outcome.unwrap_or_else(|p| Err(panicked(p)))),
    }
}

fn joined<U>(outcome: std::result::Result<Option<Result<U>>, JoinError>) -> Result<U> {
    match outcome {
        Ok(Some(result)) => result,
        Ok(None) => Err(cancelled()),
        Err(e) if e.is_panic() => Err(PipelineError::message(format!("worker panicked: {e}"))),
        Err(_) => Err(cancelled()),
    }
}

/// Wait for a free slot, then pull the next source item into it.
async fn next_input<T: Send + 'static>(
    source: &mut Enumerable<T>,
    slots: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, Result<T>)> {
    let permit = slots.clone().acquire_owned().await.ok()?;
    let item = source.next().await?;
    Some((permit, item))
}

/// The feeder task and the cancellation shared with its workers.
struct Run {
    feeder: JoinHandle<()>,
    abandon: Option<DropGuard>,
}

impl Run {
    fn new(feeder: JoinHandle<()>, abandon: CancellationToken) -> Self {
        Self {
            feeder,
            abandon: Some(abandon.drop_guard()),
        }
    }

    /// Stop feeding; let running workers finish unobserved.
    fn fail(&mut self) {
        self.feeder.abort();
        if let Some(guard) = self.abandon.take() {
            guard.disarm();
        }
    }

    /// Called once every slot has been delivered.
    async fn finished(&mut self) -> Option<PipelineError> {
        match (&mut self.feeder).await {
            Err(e) if e.is_panic() => Some(PipelineError::message(format!("concurrent map source panicked: {e}"))),
            _ => None,
        }
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        // The guard field cancels the workers after this.
        self.feeder.abort();
    }
}

enum Slot<U> {
    Running(JoinHandle<Option<Result<U>>>),
    Failed(PipelineError),
}

struct Queued<U> {
    slot: Slot<U>,
    permit: OwnedSemaphorePermit,
}

struct Ordered<U> {
    queue: mpsc::UnboundedReceiver<Queued<U>>,
    run: Run,
}

impl<U: Send + 'static> Ordered<U> {
    fn start<T, F, Fut>(mut source: Enumerable<T>, mut worker: F, limit: usize) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let slots = Arc::new(Semaphore::new(limit));
        let abandon = CancellationToken::new();
        let token = abandon.clone();
        let (tx, queue) = mpsc::unbounded_channel();

        let feeder = tokio::spawn(async move {
            while let Some((permit, item)) = next_input(&mut source, &slots).await {
                let (slot, last) = match item {
                    Ok(value) => (Slot::Running(tokio::spawn(run_worker(worker(value), token.clone()))), false),
                    // The source failure waits its turn behind earlier items.
                    Err(e) => (Slot::Failed(e), true),
                };
                if tx.send(Queued { slot, permit }).is_err() || last {
                    break;
                }
            }
        });

        Self {
            queue,
            run: Run::new(feeder, abandon),
        }
    }

    async fn pull(&mut self) -> Option<Result<U>> {
        let Some(Queued { slot, permit }) = self.queue.recv().await else {
            return self.run.finished().await.map(Err);
        };
        let result = match slot {
            Slot::Running(task) => joined(task.await),
            Slot::Failed(e) => Err(e),
        };
        drop(permit);

        if let Err(e) = &result {
            self.run.fail();
            self.queue.close();
            let mut detached = 0;
            // Dropping a JoinHandle leaves its worker running.
            while self.queue.try_recv().is_ok() {
                detached += 1;
            }
            tracing::debug!(error = %e, detached, "concurrent map failed");
        }
        Some(result)
    }
}

struct Delivery<U> {
    result: Result<U>,
    permit: OwnedSemaphorePermit,
}

struct Unordered<U> {
    results: mpsc::UnboundedReceiver<Delivery<U>>,
    run: Run,
}

impl<U: Send + 'static> Unordered<U> {
    fn start<T, F, Fut>(mut source: Enumerable<T>, mut worker: F, limit: usize) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let slots = Arc::new(Semaphore::new(limit));
        let abandon = CancellationToken::new();
        let token = abandon.clone();
        let (tx, results) = mpsc::unbounded_channel();

        let feeder = tokio::spawn(async move {
            while let Some((permit, item)) = next_input(&mut source, &slots).await {
                match item {
                    Ok(value) => {
                        let fut = worker(value);
                        let tx = tx.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            if let Some(result) = run_worker(fut, token).await {
                                let _ = tx.send(Delivery { result, permit });
                            }
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(Delivery { result: Err(e), permit });
                        break;
                    }
                }
            }
        });

        Self {
            results,
            run: Run::new(feeder, abandon),
        }
    }

    async fn pull(&mut self) -> Option<Result<U>> {
        let Some(Delivery { result, permit }) = self.results.recv().await else {
            return self.run.finished().await.map(Err);
        };
        drop(permit);

        if let Err(e) = &result {
            tracing::debug!(error = %e, "concurrent map failed");
            self.run.fail();
            self.results.close();
        }
        Some(result)
    }
}

impl<T: Send + 'static> Enumerable<T> {
    /// Map with up to `options.concurrency` workers in flight; results keep
    /// input order.
    pub fn concurrent_map<U, F, Fut>(self, options: impl Into<ConcurrencyOptions>, worker: F) -> Enumerable<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let limit = options.into().concurrency.get();
        let started = stream::once(async move {
            Enumerable::unfold(Ordered::start(self, worker, limit), |mut state| async move {
                let item = state.pull().await?;
                Some((item, state))
            })
        });
        Enumerable::from_try_stream(StreamExt::flatten(started))
    }

    /// Map with up to `options.concurrency` workers in flight; results are
    /// delivered in completion order.
    pub fn concurrent_unordered_map<U, F, Fut>(
        self,
        options: impl Into<ConcurrencyOptions>,
        worker: F,
    ) -> Enumerable<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        let limit = options.into().concurrency.get();
        let started = stream::once(async move {
            Enumerable::unfold(Unordered::start(self, worker, limit), |mut state| async move {
                let item = state.pull().await?;
                Some((item, state))
            })
        });
        Enumerable::from_try_stream(StreamExt::flatten(started))
    }
}
