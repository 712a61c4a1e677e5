//! Enumerable — a lazy, pull-based async sequence.
//!
//! An `Enumerable<T>` yields `Result<T>` items. Nothing runs until the first
//! pull, and every operator pulls its upstream only when it is pulled
//! itself. The first error ends the sequence: it is delivered once, the
//! upstream (and any process or pipe it owns) is dropped on the spot, and
//! every later pull returns `None`.
//!
//! ```text
//!   source ──▶ map ──▶ filter ──▶ take(n) ──▶ consumer
//!     ▲                                        │
//!     └────────────── one pull per item ◀──────┘
//! ```
//!
//! Only `tee` (one queue per branch), `cache` (the replay log) and the
//! concurrent operators (up to their limit) hold more than one item.

use std::future::{ready, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, FusedStream};
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;

use pipewright_types::{BoxError, PipelineError, Result};

use crate::handle::{ScopedReader, ScopedWriter};
use crate::pipe::{byte_pipe, PipeSource};

/// A lazy sequence of `T`, ending on exhaustion or the first error.
#[must_use = "sequences do nothing unless pulled"]
pub struct Enumerable<T> {
    inner: Option<BoxStream<'static, Result<T>>>,
}

impl<T: Send + 'static> Enumerable<T> {
    // --- Constructors ---

    /// Wrap a stream of results.
    pub fn from_try_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self {
            inner: Some(stream.boxed()),
        }
    }

    /// Wrap a stream of plain values.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_try_stream(stream.map(Ok))
    }

    /// Yield the items of an iterator.
    pub fn from_iterator<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(iter))
    }

    /// A sequence with no items.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// A sequence of exactly one item.
    pub fn once(value: T) -> Self {
        Self::from_try_stream(stream::once(ready(Ok(value))))
    }

    /// A sequence that fails on its first pull.
    pub fn failed(err: PipelineError) -> Self {
        Self::from_try_stream(stream::once(ready(Err(err))))
    }

    /// Build a sequence from a state machine.
    ///
    /// `f` receives the state and returns the next item with the new state,
    /// or `None` to end. Dropping the sequence drops the state.
    pub fn unfold<S, F, Fut>(init: S, f: F) -> Self
    where
        S: Send + 'static,
        F: FnMut(S) -> Fut + Send + 'static,
        Fut: Future<Output = Option<(Result<T>, S)>> + Send + 'static,
    {
        Self::from_try_stream(stream::unfold(init, f))
    }

    // --- Pulling ---

    /// Pull the next item. `None` after exhaustion or a delivered error.
    pub async fn next(&mut self) -> Option<Result<T>> {
        StreamExt::next(self).await
    }

    /// True once the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    /// Drop the upstream now; later pulls return `None`.
    pub fn close(&mut self) {
        self.inner = None;
    }

    // --- Operators ---

    /// Transform each item.
    pub fn map<U, F>(self, f: F) -> Enumerable<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Enumerable::from_try_stream(TryStreamExt::map_ok(self, f))
    }

    /// Transform each item with a fallible function.
    ///
    /// The first `Err` ends the sequence as a `TransformError`.
    pub fn try_map<U, E, F>(self, mut f: F) -> Enumerable<U>
    where
        U: Send + 'static,
        E: Into<BoxError>,
        F: FnMut(T) -> std::result::Result<U, E> + Send + 'static,
    {
        Enumerable::from_try_stream(TryStreamExt::and_then(self, move |v| {
            ready(f(v).map_err(PipelineError::transform))
        }))
    }

    /// Transform each item asynchronously, one at a time.
    pub fn then<U, F, Fut>(self, f: F) -> Enumerable<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        Enumerable::from_try_stream(TryStreamExt::and_then(self, f))
    }

    /// Keep items matching `pred`.
    pub fn filter<F>(self, mut pred: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        Self::from_try_stream(TryStreamExt::try_filter(self, move |v| ready(pred(v))))
    }

    /// Keep items matching a fallible predicate.
    pub fn try_filter<E, F>(self, mut pred: F) -> Self
    where
        E: Into<BoxError>,
        F: FnMut(&T) -> std::result::Result<bool, E> + Send + 'static,
    {
        Self::from_try_stream(TryStreamExt::try_filter_map(self, move |v| {
            ready(match pred(&v) {
                Ok(true) => Ok(Some(v)),
                Ok(false) => Ok(None),
                Err(e) => Err(PipelineError::transform(e)),
            })
        }))
    }

    /// Transform and filter in one step.
    pub fn filter_map<U, F>(self, mut f: F) -> Enumerable<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        Enumerable::from_try_stream(TryStreamExt::try_filter_map(self, move |v| ready(Ok(f(v)))))
    }

    /// Expand each item into zero or more items.
    pub fn flat_map<U, I, F>(self, mut f: F) -> Enumerable<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: FnMut(T) -> I + Send + 'static,
    {
        let expanded = TryStreamExt::map_ok(self, move |v| stream::iter(f(v).into_iter().map(Ok)));
        Enumerable::from_try_stream(TryStreamExt::try_flatten(expanded))
    }

    /// Yield the first `n` items, then stop pulling and drop the upstream.
    pub fn take(self, n: usize) -> Self {
        Self::unfold((Some(self), n), |(upstream, left)| async move {
            let mut upstream = upstream.filter(|_| left > 0)?;
            let item = upstream.next().await?;
            let left = left - 1;
            // Release the upstream as soon as the last wanted item is out.
            let upstream = (left > 0).then_some(upstream);
            Some((item, (upstream, left)))
        })
    }

    /// Discard the first `n` items. Errors among them are not discarded.
    #[doc(alias = "drop")]
    pub fn skip(self, n: usize) -> Self {
        Self::unfold((self, n), |(mut upstream, mut to_skip)| async move {
            while to_skip > 0 {
                match upstream.next().await? {
                    Ok(_) => to_skip -= 1,
                    Err(e) => return Some((Err(e), (upstream, 0))),
                }
            }
            let item = upstream.next().await?;
            Some((item, (upstream, 0)))
        })
    }

    /// Yield items while `pred` holds; drop the upstream at the first miss.
    pub fn take_while<F>(self, pred: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        Self::unfold((Some(self), pred), |(upstream, mut pred)| async move {
            let mut upstream = upstream?;
            match upstream.next().await? {
                Ok(v) if pred(&v) => Some((Ok(v), (Some(upstream), pred))),
                Ok(_) => None,
                Err(e) => Some((Err(e), (None, pred))),
            }
        })
    }

    /// Discard items while `pred` holds, then yield the rest.
    pub fn skip_while<F>(self, pred: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        Self::unfold((self, Some(pred)), |(mut upstream, mut pred)| async move {
            loop {
                let item = upstream.next().await?;
                let skip = match (&item, pred.as_mut()) {
                    (Ok(v), Some(p)) => p(v),
                    _ => false,
                };
                if !skip {
                    return Some((item, (upstream, None)));
                }
            }
        })
    }

    /// Pair each item with its position.
    pub fn enumerate(self) -> Enumerable<(usize, T)> {
        let mut index = 0;
        self.map(move |v| {
            let pair = (index, v);
            index += 1;
            pair
        })
    }

    /// Group items into vectors of up to `size`.
    ///
    /// A pending partial chunk is delivered before an upstream error.
    pub fn chunks(self, size: usize) -> Enumerable<Vec<T>> {
        let size = size.max(1);
        Enumerable::unfold((Some(self), None::<PipelineError>), move |(upstream, pending)| async move {
            if let Some(err) = pending {
                return Some((Err(err), (None, None)));
            }
            let mut upstream = upstream?;
            let mut chunk = Vec::with_capacity(size);
            while chunk.len() < size {
                match upstream.next().await {
                    Some(Ok(v)) => chunk.push(v),
                    Some(Err(e)) if chunk.is_empty() => return Some((Err(e), (None, None))),
                    Some(Err(e)) => return Some((Ok(chunk), (None, Some(e)))),
                    None if chunk.is_empty() => return None,
                    None => return Some((Ok(chunk), (None, None))),
                }
            }
            Some((Ok(chunk), (Some(upstream), None)))
        })
    }

    /// Yield all of `self`, then all of `other`.
    pub fn chain(self, other: Enumerable<T>) -> Self {
        Self::from_try_stream(StreamExt::chain(self, other))
    }

    /// Observe each item without changing it.
    pub fn inspect<F>(self, f: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        Self::from_try_stream(TryStreamExt::inspect_ok(self, f))
    }

    /// Opt-in error override for this stage.
    ///
    /// `f` sees the error and decides: `Ok(Some(v))` replaces it with a final
    /// value, `Ok(None)` suppresses it (the sequence ends cleanly), `Err(e)`
    /// raises `e` instead. Without `recover` every error is raised.
    pub fn recover<F>(self, mut f: F) -> Self
    where
        F: FnMut(PipelineError) -> Result<Option<T>> + Send + 'static,
    {
        Self::from_try_stream(StreamExt::filter_map(self, move |item| {
            ready(match item {
                Ok(v) => Some(Ok(v)),
                Err(e) => f(e).transpose(),
            })
        }))
    }

    // --- Terminals ---

    /// Pull everything into a vector.
    pub async fn collect(self) -> Result<Vec<T>> {
        TryStreamExt::try_collect(self).await
    }

    /// Fold items into an accumulator.
    pub async fn fold<A, F>(self, init: A, mut f: F) -> Result<A>
    where
        F: FnMut(A, T) -> A,
    {
        TryStreamExt::try_fold(self, init, |acc, v| ready(Ok(f(acc, v)))).await
    }

    /// Combine items pairwise; `None` for an empty sequence.
    pub async fn reduce<F>(self, mut f: F) -> Result<Option<T>>
    where
        F: FnMut(T, T) -> T,
    {
        self.fold(None, |acc, v| {
            Some(match acc {
                Some(a) => f(a, v),
                None => v,
            })
        })
        .await
    }

    /// Run `f` on every item.
    pub async fn for_each<F>(self, mut f: F) -> Result<()>
    where
        F: FnMut(T),
    {
        TryStreamExt::try_for_each(self, |v| {
            f(v);
            ready(Ok(()))
        })
        .await
    }

    /// Count the items.
    pub async fn count(self) -> Result<usize> {
        self.fold(0, |n, _| n + 1).await
    }

    /// The first item; the rest of the sequence is dropped unpulled.
    pub async fn first(mut self) -> Result<Option<T>> {
        self.next().await.transpose()
    }

    /// The last item.
    pub async fn last(self) -> Result<Option<T>> {
        self.fold(None, |_, v| Some(v)).await
    }
}

impl<T: Send + 'static> Enumerable<Enumerable<T>> {
    /// Concatenate a sequence of sequences.
    pub fn flatten(self) -> Enumerable<T> {
        Enumerable::from_try_stream(TryStreamExt::try_flatten(self))
    }
}

impl Enumerable<Vec<u8>> {
    /// Read chunks from any async reader.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, chunk_size: usize) -> Self {
        Self::from_scoped(Arc::new(ScopedReader::new("reader", reader)), chunk_size)
    }

    /// Read chunks from a scoped handle until end-of-data or close.
    ///
    /// Dropping the sequence closes the handle.
    pub fn from_scoped(reader: Arc<ScopedReader>, chunk_size: usize) -> Self {
        let guard = CloseOnDrop(reader);
        Self::unfold(guard, move |guard| async move {
            match guard.0.read_chunk(chunk_size).await {
                Ok(Some(chunk)) => Some((Ok(chunk), guard)),
                Ok(None) => None,
                Err(e) => Some((Err(e), guard)),
            }
        })
    }

    /// Expose the sequence as an `AsyncRead` through a bounded byte pipe.
    ///
    /// A feeder task drives the sequence; its result reports upstream
    /// failure. Dropping the reader stops the feeder at its next write.
    pub fn into_reader(self, capacity: usize) -> (PipeSource, JoinHandle<Result<()>>) {
        let (sink, source) = byte_pipe(capacity);
        let writer = ScopedWriter::new("pipe", sink);
        let feeder = tokio::spawn(async move {
            let mut chunks = self;
            let result = async {
                while let Some(chunk) = chunks.next().await {
                    writer.write_all(&chunk?).await?;
                }
                Ok::<(), PipelineError>(())
            }
            .await;
            writer.close();
            match result {
                Err(e) if e.is_broken_pipe() => Ok(()),
                other => other,
            }
        });
        (source, feeder)
    }
}

struct CloseOnDrop(Arc<ScopedReader>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

impl<T> Stream for Enumerable<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(v))) => Poll::Ready(Some(Ok(v))),
            Poll::Ready(Some(Err(e))) => {
                self.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            Some(inner) => inner.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl<T> FusedStream for Enumerable<T> {
    fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }
}

impl<T: Send + 'static> FromIterator<T> for Enumerable<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_iterator(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<T> std::fmt::Debug for Enumerable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enumerable")
            .field("finished", &self.inner.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A 0..n source that counts how many times it was pulled.
    fn counted(n: usize) -> (Enumerable<usize>, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let seq = Enumerable::unfold(0usize, move |i| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (i < n).then(|| (Ok(i), i + 1))
            }
        });
        (seq, pulls)
    }

    #[tokio::test]
    async fn test_no_work_before_first_pull() {
        let (seq, pulls) = counted(10);
        let mapped = seq.map(|x| x * 2).filter(|x| x % 4 == 0);
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
        assert_eq!(mapped.collect().await.unwrap(), vec![0, 4, 8, 12, 16]);
    }

    #[tokio::test]
    async fn test_take_pulls_at_most_n() {
        let (seq, pulls) = counted(1000);
        let taken = seq.take(3).collect().await.unwrap();
        assert_eq!(taken, vec![0, 1, 2]);
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_take_zero_never_pulls() {
        let (seq, pulls) = counted(5);
        assert!(seq.take(0).collect().await.unwrap().is_empty());
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_take_more_than_available() {
        let seq = Enumerable::from_iterator(vec![1, 2]);
        assert_eq!(seq.take(5).collect().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_skip_keeps_errors() {
        let seq = Enumerable::from_iterator(vec![1])
            .chain(Enumerable::failed(PipelineError::message("early")));
        let err = seq.skip(3).collect().await.unwrap_err();
        assert_eq!(err.to_string(), "transform failed: early");
    }

    #[tokio::test]
    async fn test_skip_and_take_while() {
        let seq = Enumerable::from_iterator(1..=10);
        let out = seq.skip(2).take_while(|x| *x < 6).collect().await.unwrap();
        assert_eq!(out, vec![3, 4, 5]);

        let seq = Enumerable::from_iterator(vec![1, 2, 7, 1]);
        assert_eq!(seq.skip_while(|x| *x < 5).collect().await.unwrap(), vec![7, 1]);
    }

    #[tokio::test]
    async fn test_error_delivered_once() {
        let mut seq = Enumerable::from_iterator(vec![1, 2, 3]).try_map(|x| {
            if x == 2 { Err("two is right out") } else { Ok(x) }
        });
        assert_eq!(seq.next().await.unwrap().unwrap(), 1);
        assert!(matches!(seq.next().await, Some(Err(PipelineError::Transform(_)))));
        assert!(seq.next().await.is_none());
        assert!(seq.next().await.is_none());
        assert!(seq.is_finished());
    }

    #[tokio::test]
    async fn test_recover_replace_suppress_rethrow() {
        let failing = || {
            Enumerable::from_iterator(vec![1]).chain(Enumerable::failed(PipelineError::message("boom")))
        };

        let replaced = failing().recover(|_| Ok(Some(-1))).collect().await.unwrap();
        assert_eq!(replaced, vec![1, -1]);

        let suppressed = failing().recover(|_| Ok(None)).collect().await.unwrap();
        assert_eq!(suppressed, vec![1]);

        let err = failing()
            .recover(|e| Err(e.upstream()))
            .collect()
            .await
            .unwrap_err();
        assert!(err.is_upstream());
    }

    #[tokio::test]
    async fn test_flat_map_and_flatten() {
        let seq = Enumerable::from_iterator(vec![1, 2, 3]);
        let out = seq.flat_map(|x| vec![x; x]).collect().await.unwrap();
        assert_eq!(out, vec![1, 2, 2, 3, 3, 3]);

        let nested = Enumerable::from_iterator(vec![
            Enumerable::from_iterator(vec!["a", "b"]),
            Enumerable::empty(),
            Enumerable::once("c"),
        ]);
        assert_eq!(nested.flatten().collect().await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_chunks_flushes_before_error() {
        let seq = Enumerable::from_iterator(vec![1, 2, 3])
            .chain(Enumerable::failed(PipelineError::message("late")));
        let mut chunks = seq.chunks(2);
        assert_eq!(chunks.next().await.unwrap().unwrap(), vec![1, 2]);
        assert_eq!(chunks.next().await.unwrap().unwrap(), vec![3]);
        assert!(chunks.next().await.unwrap().is_err());
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_terminals() {
        let nums = || Enumerable::from_iterator(1..=5);
        assert_eq!(nums().reduce(|a, b| a + b).await.unwrap(), Some(15));
        assert_eq!(nums().fold(String::new(), |s, n| s + &n.to_string()).await.unwrap(), "12345");
        assert_eq!(nums().count().await.unwrap(), 5);
        assert_eq!(nums().first().await.unwrap(), Some(1));
        assert_eq!(nums().last().await.unwrap(), Some(5));
        assert_eq!(Enumerable::<i32>::empty().reduce(|a, b| a + b).await.unwrap(), None);

        let mut seen = Vec::new();
        nums().enumerate().for_each(|(i, n)| seen.push(i + n)).await.unwrap();
        assert_eq!(seen, vec![1, 3, 5, 7, 9]);
    }

    #[tokio::test]
    async fn test_then_runs_async_transform() {
        let out = Enumerable::from_iterator(vec![1, 2])
            .then(|x| async move { Ok(x * 10) })
            .inspect(|x| assert!(*x >= 10))
            .collect()
            .await
            .unwrap();
        assert_eq!(out, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_reader_round_trip() {
        let chunks = Enumerable::from_iterator(vec![b"hello ".to_vec(), b"world".to_vec()]);
        let (source, feeder) = chunks.into_reader(4);
        let text = Enumerable::from_reader(source, 3).collect().await.unwrap().concat();
        assert_eq!(text, b"hello world");
        feeder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_into_reader_reports_upstream_error() {
        let chunks = Enumerable::from_iterator(vec![b"x".to_vec()])
            .chain(Enumerable::failed(PipelineError::message("source broke")));
        let (source, feeder) = chunks.into_reader(64);
        let bytes = Enumerable::from_reader(source, 64).collect().await.unwrap().concat();
        assert_eq!(bytes, b"x");
        assert!(feeder.await.unwrap().is_err());
    }
}
