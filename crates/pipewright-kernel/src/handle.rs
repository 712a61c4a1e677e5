//! Close-idempotent wrappers around one OS stream.
//!
//! A process's stdin/stdout/stderr are each owned by a scoped handle that is
//! shared (via `Arc`) between the process handle and the stage reading or
//! writing it. Whoever closes first wins; every later close is a no-op.
//!
//! `close()` is synchronous so it can run from `Drop` and error paths. If a
//! read or write is in flight when the handle closes, that operation is
//! cancelled and the stream is dropped by the task that held it.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use pipewright_types::{PipelineError, Result};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable side: child stdout/stderr or an in-memory pipe source.
pub struct ScopedReader {
    label: String,
    stream: Mutex<Option<BoxedRead>>,
    closed: CancellationToken,
    drained: watch::Sender<bool>,
}

impl ScopedReader {
    /// Wrap a readable stream.
    pub fn new(label: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            label: label.into(),
            stream: Mutex::new(Some(Box::new(reader))),
            closed: CancellationToken::new(),
            drained: watch::Sender::new(false),
        }
    }

    /// A handle with nothing behind it (the stream was not captured).
    pub fn detached(label: impl Into<String>) -> Self {
        let handle = Self {
            label: label.into(),
            stream: Mutex::new(None),
            closed: CancellationToken::new(),
            drained: watch::Sender::new(false),
        };
        handle.close();
        handle
    }

    /// Read up to `max` bytes. `Ok(None)` means end-of-data or closed.
    pub async fn read_chunk(&self, max: usize) -> Result<Option<Vec<u8>>> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Ok(None),
            guard = self.stream.lock() => guard,
        };

        let mut buf = vec![0u8; max.max(1)];
        let outcome = {
            let Some(stream) = guard.as_mut() else {
                return Ok(None);
            };
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => None,
                res = stream.read(&mut buf) => Some(res),
            }
        };

        match outcome {
            Some(Ok(n)) if n > 0 => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Some(Ok(_)) | None => {
                guard.take();
                drop(guard);
                self.release();
                Ok(None)
            }
            Some(Err(e)) => {
                guard.take();
                drop(guard);
                self.release();
                Err(PipelineError::from(e))
            }
        }
    }

    /// Read everything until end-of-data.
    pub async fn read_to_end(&self, chunk_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk(chunk_size).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Close the stream. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
        self.drained.send_replace(true);
        tracing::trace!(handle = %self.label, "reader closed");
    }

    fn release(&self) {
        self.closed.cancel();
        self.drained.send_replace(true);
    }

    /// True after close or end-of-data.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the stream has produced end-of-data or been closed.
    pub async fn drained(&self) {
        let mut rx = self.drained.subscribe();
        // The sender lives in self, so wait_for cannot fail while we hold &self.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ScopedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedReader")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Writable side: child stdin or an in-memory pipe sink.
pub struct ScopedWriter {
    label: String,
    stream: Mutex<Option<BoxedWrite>>,
    closed: CancellationToken,
    drained: watch::Sender<bool>,
}

impl ScopedWriter {
    /// Wrap a writable stream.
    pub fn new(label: impl Into<String>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            label: label.into(),
            stream: Mutex::new(Some(Box::new(writer))),
            closed: CancellationToken::new(),
            drained: watch::Sender::new(false),
        }
    }

    /// A handle with nothing behind it (stdin was inherited or null).
    pub fn detached(label: impl Into<String>) -> Self {
        let handle = Self {
            label: label.into(),
            stream: Mutex::new(None),
            closed: CancellationToken::new(),
            drained: watch::Sender::new(false),
        };
        handle.close();
        handle
    }

    /// Write all of `data`.
    ///
    /// Fails with a broken-pipe I/O error once the handle is closed.
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_pipe()),
            guard = self.stream.lock() => guard,
        };

        let outcome = {
            let Some(stream) = guard.as_mut() else {
                return Err(closed_pipe());
            };
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => None,
                res = stream.write_all(data) => Some(res),
            }
        };

        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                guard.take();
                drop(guard);
                self.close();
                Err(PipelineError::from(e))
            }
            None => {
                guard.take();
                Err(closed_pipe())
            }
        }
    }

    /// Flush and shut down the stream, then close the handle.
    ///
    /// A reader that already went away is not an error here.
    pub async fn finish(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        let stream = self.stream.lock().await.take();
        let result = match stream {
            Some(mut stream) => match stream.shutdown().await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(PipelineError::from(e)),
                _ => Ok(()),
            },
            None => Ok(()),
        };
        self.close();
        result
    }

    /// Close the stream, signalling EOF to the reader. Idempotent.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Ok(mut guard) = self.stream.try_lock() {
            guard.take();
        }
        self.drained.send_replace(true);
        tracing::trace!(handle = %self.label, "writer closed");
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the handle is closed.
    pub async fn drained(&self) {
        let mut rx = self.drained.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ScopedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedWriter")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_pipe() -> PipelineError {
    PipelineError::from(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "handle closed",
    ))
}
