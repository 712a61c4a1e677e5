//! In-memory byte pipe.
//!
//! A [`PipeSink`] writes into a fixed-size ring that a [`PipeSource`] reads
//! from. Writes park while the ring is full and reads park while it is
//! empty. Dropping the sink is end of file once the reader has drained what
//! is left; dropping the source makes the next write fail with
//! `BrokenPipe`. In-process stages get the same contract as an OS pipe.
//!
//! The shared state sits behind a `std::sync::Mutex` since Drop has to run
//! without awaiting. Each side stores its waker while holding that lock.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

struct PipeState {
    buffer: VecDeque<u8>,
    capacity: usize,
    sink_closed: bool,
    source_closed: bool,
    /// Parked source, waiting for data or EOF.
    source_waker: Option<Waker>,
    /// Parked sink, waiting for space.
    sink_waker: Option<Waker>,
}

struct PipeShared {
    state: Mutex<PipeState>,
}

impl PipeShared {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writing end of a byte pipe.
pub struct PipeSink {
    shared: Arc<PipeShared>,
}

/// Reading end of a byte pipe.
pub struct PipeSource {
    shared: Arc<PipeShared>,
}

/// Create a pipe holding at most `capacity` unread bytes.
pub fn byte_pipe(capacity: usize) -> (PipeSink, PipeSource) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            buffer: VecDeque::with_capacity(capacity.min(8192)),
            capacity: capacity.max(1),
            sink_closed: false,
            source_closed: false,
            source_waker: None,
            sink_waker: None,
        }),
    });

    (
        PipeSink {
            shared: shared.clone(),
        },
        PipeSource { shared },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe source closed")
}

impl PipeSink {
    fn poll_push(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut state = self.shared.lock();
        if state.source_closed {
            return Poll::Ready(Err(broken_pipe()));
        }

        let room = state.capacity.saturating_sub(state.buffer.len());
        if room == 0 {
            state.sink_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = data.len().min(room);
        state.buffer.extend(&data[..n]);
        if let Some(waker) = state.source_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(n))
    }

    /// Mark EOF without dropping the sink.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.sink_closed = true;
        if let Some(waker) = state.source_waker.take() {
            waker.wake();
        }
    }
}

impl AsyncWrite for PipeSink {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_push(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for PipeSource {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();

        if state.buffer.is_empty() {
            if state.sink_closed {
                return Poll::Ready(Ok(()));
            }
            state.source_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = buf.remaining().min(state.buffer.len());
        let (front, back) = state.buffer.as_slices();
        if n <= front.len() {
            buf.put_slice(&front[..n]);
        } else {
            buf.put_slice(front);
            buf.put_slice(&back[..n - front.len()]);
        }
        state.buffer.drain(..n);

        if let Some(waker) = state.sink_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.source_closed = true;
        state.buffer.clear();
        if let Some(waker) = state.sink_waker.take() {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for PipeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeSink").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PipeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeSource").finish_non_exhaustive()
    }
}
