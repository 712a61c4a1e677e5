//! Stdin feeding for process stages.

use std::fmt;
use std::sync::Arc;

use pipewright_types::{PipelineError, Result};

use crate::handle::ScopedWriter;
use crate::process::StdioMode;
use crate::seq::Enumerable;

/// What a stage writes to its child's stdin.
#[derive(Default)]
pub enum Input {
    /// Stdin is /dev/null.
    #[default]
    Null,
    /// Stdin is shared with the host process.
    Inherit,
    /// Fixed bytes.
    Bytes(Vec<u8>),
    /// Fixed text.
    Text(String),
    /// One line per element, each newline-terminated.
    Lines(Vec<String>),
    /// Chunks pulled from a sequence, typically an upstream stage.
    Stream(Enumerable<Vec<u8>>),
}

impl Input {
    pub(crate) fn stdio_mode(&self) -> StdioMode {
        match self {
            Input::Null => StdioMode::Null,
            Input::Inherit => StdioMode::Inherit,
            _ => StdioMode::Piped,
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Null => write!(f, "Null"),
            Input::Inherit => write!(f, "Inherit"),
            Input::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Input::Text(t) => write!(f, "Text({} bytes)", t.len()),
            Input::Lines(l) => write!(f, "Lines({} lines)", l.len()),
            Input::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Input::Text(s.to_string())
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Input::Text(s)
    }
}

impl From<Vec<u8>> for Input {
    fn from(b: Vec<u8>) -> Self {
        Input::Bytes(b)
    }
}

impl From<&[u8]> for Input {
    fn from(b: &[u8]) -> Self {
        Input::Bytes(b.to_vec())
    }
}

impl From<Vec<String>> for Input {
    fn from(lines: Vec<String>) -> Self {
        Input::Lines(lines)
    }
}

impl From<Enumerable<Vec<u8>>> for Input {
    fn from(seq: Enumerable<Vec<u8>>) -> Self {
        Input::Stream(seq)
    }
}

impl From<Enumerable<String>> for Input {
    fn from(seq: Enumerable<String>) -> Self {
        Input::Stream(seq.join_lines())
    }
}

/// An [`Input`] plus whether empty input is acceptable.
#[derive(Debug, Default)]
pub struct StdinFeed {
    pub input: Input,
    /// When false, an absent or empty input fails with `EmptyInput`.
    pub allow_empty: bool,
}

impl StdinFeed {
    pub fn new(input: impl Into<Input>) -> Self {
        Self {
            input: input.into(),
            allow_empty: true,
        }
    }

    /// Fail with `EmptyInput` unless at least one byte is written.
    pub fn require_input(mut self) -> Self {
        self.allow_empty = false;
        self
    }

    /// Write the input to `writer`, then close it.
    ///
    /// The writer is closed on every path, so the child always sees EOF. A
    /// child that stops reading early (broken pipe) is not an error; the
    /// rest of the input is dropped unpulled. Errors pulled from a
    /// `Stream` input come back wrapped as `Upstream`.
    pub async fn feed(self, writer: Arc<ScopedWriter>, command: Vec<String>) -> Result<()> {
        let allow_empty = self.allow_empty;
        let written = write_input(self.input, &writer).await;
        let finished = writer.finish().await;

        let written = match written {
            Err(e) if e.is_broken_pipe() => {
                tracing::debug!(handle = writer.label(), "child closed stdin early");
                return Ok(());
            }
            other => other?,
        };
        if written == 0 && !allow_empty {
            return Err(PipelineError::EmptyInput { command });
        }
        finished
    }
}

/// Returns the number of bytes written, or `usize::MAX` for inherited stdin.
async fn write_input(input: Input, writer: &ScopedWriter) -> Result<usize> {
    match input {
        Input::Null => Ok(0),
        Input::Inherit => Ok(usize::MAX),
        Input::Bytes(bytes) => {
            writer.write_all(&bytes).await?;
            Ok(bytes.len())
        }
        Input::Text(text) => {
            writer.write_all(text.as_bytes()).await?;
            Ok(text.len())
        }
        Input::Lines(lines) => {
            let mut written = 0;
            for line in &lines {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                written += line.len() + 1;
            }
            Ok(written)
        }
        Input::Stream(mut chunks) => {
            let mut written = 0;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(PipelineError::upstream)?;
                writer.write_all(&chunk).await?;
                written += chunk.len();
            }
            Ok(written)
        }
    }
}
