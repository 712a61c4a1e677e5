//! Replayable sequences.
//!
//! The first replay to reach an item pulls it from the upstream and appends
//! it to a shared log; every later replay reads the log. The upstream is
//! pulled at most once per item however many replays run, concurrently or
//! one after another. A terminal error is logged too, so every replay ends
//! with the same error.

use std::sync::{Arc, Mutex, MutexGuard};

use pipewright_types::{PipelineError, Result};

use crate::seq::Enumerable;

enum End {
    Done,
    Failed(PipelineError),
}

struct Log<T> {
    items: Vec<T>,
    end: Option<End>,
}

struct CacheShared<T> {
    upstream: tokio::sync::Mutex<Option<Enumerable<T>>>,
    log: Mutex<Log<T>>,
}

/// A sequence that can be replayed any number of times.
pub struct Cached<T> {
    shared: Arc<CacheShared<T>>,
}

impl<T> Clone for Cached<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> CacheShared<T> {
    fn log(&self) -> MutexGuard<'_, Log<T>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The item at `index` if it is already known: `Some(None)` means the
    /// sequence ended before it.
    fn lookup(&self, index: usize) -> Option<Option<Result<T>>> {
        let log = self.log();
        if let Some(item) = log.items.get(index) {
            return Some(Some(Ok(item.clone())));
        }
        match &log.end {
            Some(End::Done) => Some(None),
            Some(End::Failed(e)) => Some(Some(Err(e.clone()))),
            None => None,
        }
    }

    async fn get(&self, index: usize) -> Option<Result<T>> {
        if let Some(known) = self.lookup(index) {
            return known;
        }
        let mut upstream = self.upstream.lock().await;
        if let Some(known) = self.lookup(index) {
            return known;
        }
        let next = match upstream.as_mut() {
            Some(up) => up.next().await,
            None => None,
        };

        let mut log = self.log();
        match next {
            Some(Ok(item)) => {
                log.items.push(item.clone());
                Some(Ok(item))
            }
            Some(Err(e)) => {
                log.end = Some(End::Failed(e.clone()));
                *upstream = None;
                Some(Err(e))
            }
            None => {
                log.end = Some(End::Done);
                *upstream = None;
                None
            }
        }
    }
}

impl<T: Clone + Send + 'static> Cached<T> {
    /// A fresh replay from the first item.
    pub fn replay(&self) -> Enumerable<T> {
        Enumerable::unfold((self.shared.clone(), 0usize), |(shared, index)| async move {
            let item = shared.get(index).await?;
            Some((item, (shared, index + 1)))
        })
    }

    /// Items pulled from the upstream so far.
    pub fn materialized(&self) -> usize {
        self.shared.log().items.len()
    }

    /// True once the upstream has ended (cleanly or with an error).
    pub fn is_complete(&self) -> bool {
        self.shared.log().end.is_some()
    }
}

impl<T: Clone + Send + 'static> Enumerable<T> {
    /// Make the sequence replayable. Nothing is pulled until a replay is.
    pub fn cache(self) -> Cached<T> {
        Cached {
            shared: Arc::new(CacheShared {
                upstream: tokio::sync::Mutex::new(Some(self)),
                log: Mutex::new(Log {
                    items: Vec::new(),
                    end: None,
                }),
            }),
        }
    }
}

impl<T> std::fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.shared.log.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Cached")
            .field("items", &log.items.len())
            .field("complete", &log.end.is_some())
            .finish()
    }
}
