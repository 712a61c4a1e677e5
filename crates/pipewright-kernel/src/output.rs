//! Output handling for a running process stage.
//!
//! A [`ProcessIo`] bundles everything an output handler needs: the child's
//! stdout, the process handle, the stdin feeder's completion, and the
//! stderr drain. Handlers read stdout however they like, then call
//! [`ProcessIo::finish`] to settle the stage: feeder failure first, then the
//! exit status, classified against the stage's failure policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use pipewright_types::{ExitStatus, PipelineError, Result};

use crate::handle::ScopedReader;
use crate::lines::LineSplitter;
use crate::process::ProcessHandle;

const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// A started process stage, owned by its output handler.
///
/// Dropping it before `finish` closes the process.
pub struct ProcessIo {
    handle: Arc<ProcessHandle>,
    input: Option<JoinHandle<Result<()>>>,
    stderr: Option<JoinHandle<Option<String>>>,
    allow_failure: bool,
    chunk_size: usize,
}

impl ProcessIo {
    pub(crate) fn new(
        handle: Arc<ProcessHandle>,
        input: JoinHandle<Result<()>>,
        stderr: JoinHandle<Option<String>>,
        allow_failure: bool,
        chunk_size: usize,
    ) -> Self {
        Self {
            handle,
            input: Some(input),
            stderr: Some(stderr),
            allow_failure,
            chunk_size,
        }
    }

    /// The process handle.
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    /// The child's stdout.
    pub fn stdout(&self) -> &Arc<ScopedReader> {
        self.handle.stdout()
    }

    /// Configured read size for stdout chunks.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read the next stdout chunk. `Ok(None)` at end-of-data.
    pub async fn read_chunk(&self) -> Result<Option<Vec<u8>>> {
        self.stdout().read_chunk(self.chunk_size).await
    }

    /// A feeder failure that has already happened, if any.
    ///
    /// Lets a stage surface an upstream failure at its next pull instead of
    /// waiting for its own stdout to end.
    pub async fn input_failure(&mut self) -> Option<PipelineError> {
        if !self.input.as_ref().is_some_and(JoinHandle::is_finished) {
            return None;
        }
        let task = self.input.take()?;
        joined_input(task.await).err()
    }

    /// Wait for the feeder, the exit status, and the stderr drain, then
    /// close the process.
    ///
    /// Fails with the feeder's error if it failed, otherwise with
    /// `ExitCode`/`Signal` for an unsuccessful exit unless failure is
    /// allowed.
    pub async fn finish(mut self) -> Result<ExitStatus> {
        let status = self.settle().await?;
        let stderr_tail = self.stderr_tail().await;
        self.handle.close();
        if self.allow_failure || status.success() {
            return Ok(status);
        }
        let command = self.handle.command().to_vec();
        Err(match status.signal {
            Some(signal) => PipelineError::Signal {
                signal,
                command,
                stderr_tail,
            },
            None => PipelineError::ExitCode {
                code: status.code,
                command,
                signal: None,
                stderr_tail,
            },
        })
    }

    /// Like `finish`, but an unsuccessful exit is returned, not raised.
    pub async fn finish_status(mut self) -> Result<ExitStatus> {
        let status = self.settle().await?;
        self.stderr_tail().await;
        self.handle.close();
        Ok(status)
    }

    async fn settle(&mut self) -> Result<ExitStatus> {
        if let Some(task) = self.input.take() {
            if let Err(e) = joined_input(task.await) {
                self.handle.close();
                return Err(e);
            }
        }
        self.handle.wait().await
    }

    async fn stderr_tail(&mut self) -> Option<String> {
        let task = self.stderr.take()?;
        // A grandchild may still hold stderr open; don't wait on it forever.
        match tokio::time::timeout(STDERR_SETTLE, task).await {
            Ok(joined) => joined.ok().flatten(),
            Err(_) => {
                self.handle.stderr().close();
                None
            }
        }
    }
}

impl Drop for ProcessIo {
    fn drop(&mut self) {
        if let Some(task) = self.input.take() {
            task.abort();
        }
        self.handle.close();
    }
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("handle", &self.handle)
            .field("allow_failure", &self.allow_failure)
            .finish()
    }
}

fn joined_input(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(r) => r,
        Err(e) if e.is_panic() => Err(PipelineError::message(format!("stdin feeder panicked: {e}"))),
        Err(_) => Ok(()),
    }
}

/// Turns a started process stage into a value.
#[async_trait]
pub trait OutputHandler: Send + Sized + 'static {
    type Output: Send;

    async fn process_output(self, io: ProcessIo) -> Result<Self::Output>;
}

/// All of stdout as bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureBytes;

#[async_trait]
impl OutputHandler for CaptureBytes {
    type Output = Vec<u8>;

    async fn process_output(self, io: ProcessIo) -> Result<Vec<u8>> {
        let bytes = io.stdout().read_to_end(io.chunk_size()).await?;
        io.finish().await?;
        Ok(bytes)
    }
}

/// All of stdout as UTF-8 text. Invalid UTF-8 is a transform error.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureText;

#[async_trait]
impl OutputHandler for CaptureText {
    type Output = String;

    async fn process_output(self, io: ProcessIo) -> Result<String> {
        let bytes = CaptureBytes.process_output(io).await?;
        String::from_utf8(bytes).map_err(PipelineError::transform)
    }
}

/// Stdout split into lines, terminators removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureLines;

#[async_trait]
impl OutputHandler for CaptureLines {
    type Output = Vec<String>;

    async fn process_output(self, io: ProcessIo) -> Result<Vec<String>> {
        let mut splitter = LineSplitter::new();
        let mut lines = Vec::new();
        while let Some(chunk) = io.read_chunk().await? {
            lines.extend(splitter.push(&chunk));
        }
        lines.extend(splitter.finish());
        io.finish().await?;
        Ok(lines
            .into_iter()
            .map(|l| String::from_utf8_lossy(&l).into_owned())
            .collect())
    }
}

/// Discard stdout and return the exit status, successful or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOnly;

#[async_trait]
impl OutputHandler for StatusOnly {
    type Output = ExitStatus;

    async fn process_output(self, io: ProcessIo) -> Result<ExitStatus> {
        while io.read_chunk().await?.is_some() {}
        io.finish_status().await
    }
}

/// Discard stdout; fail if the process does.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignore;

#[async_trait]
impl OutputHandler for Ignore {
    type Output = ();

    async fn process_output(self, io: ProcessIo) -> Result<()> {
        while io.read_chunk().await?.is_some() {}
        io.finish().await?;
        Ok(())
    }
}
