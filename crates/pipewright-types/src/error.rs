//! Pipeline error taxonomy.
//!
//! Every failure that reaches a consumer is one of these. Errors are
//! `Clone` (heavy payloads sit behind `Arc`) so that a single failure can be
//! delivered to each branch of a tee or each replay of a cache.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from user transforms.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failures surfaced by process stages, sequences, and operators.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A process exited with a non-zero code.
    #[error("`{}` exited with code {code}{}", .command.join(" "), tail_suffix(.stderr_tail))]
    ExitCode {
        code: i32,
        command: Vec<String>,
        signal: Option<i32>,
        /// Last lines of stderr, when the stderr strategy captured them.
        stderr_tail: Option<String>,
    },

    /// A process was terminated by a signal.
    #[error("`{}` killed by signal {signal}{}", .command.join(" "), tail_suffix(.stderr_tail))]
    Signal {
        signal: i32,
        command: Vec<String>,
        stderr_tail: Option<String>,
    },

    /// An earlier stage of the same pipeline failed.
    #[error("upstream stage failed: {0}")]
    Upstream(Arc<PipelineError>),

    /// An in-process operator (map, filter, worker) failed.
    #[error("transform failed: {0}")]
    Transform(Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The executable could not be started.
    #[error("failed to spawn `{}`: {source}", .command.join(" "))]
    Spawn {
        command: Vec<String>,
        source: Arc<io::Error>,
    },

    /// An input handler that requires data was given none.
    #[error("`{}`: empty input", .command.join(" "))]
    EmptyInput { command: Vec<String> },

    /// A handle or group was used after it was closed.
    #[error("handle closed")]
    Closed,

    /// Stream I/O failure.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

fn tail_suffix(tail: &Option<String>) -> String {
    match tail {
        Some(t) if !t.trim().is_empty() => format!("\n{}", t.trim_end()),
        _ => String::new(),
    }
}

impl PipelineError {
    /// Wrap a user error as a transform failure.
    pub fn transform(err: impl Into<BoxError>) -> Self {
        PipelineError::Transform(Arc::from(err.into()))
    }

    /// Transform failure from a plain message.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::transform(msg.into())
    }

    /// Wrap this error as seen from a later stage.
    ///
    /// Already-upstream errors are not wrapped twice.
    pub fn upstream(self) -> Self {
        match self {
            PipelineError::Upstream(_) => self,
            other => PipelineError::Upstream(Arc::new(other)),
        }
    }

    /// The innermost error, following `Upstream` links.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::Upstream(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Exit code carried by a process failure, if this is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::ExitCode { code, .. } => Some(*code),
            PipelineError::Signal { signal, .. } => Some(128 + signal),
            _ => None,
        }
    }

    /// Command vector of the failing process, if any.
    pub fn command(&self) -> Option<&[String]> {
        match self {
            PipelineError::ExitCode { command, .. }
            | PipelineError::Signal { command, .. }
            | PipelineError::Spawn { command, .. }
            | PipelineError::EmptyInput { command } => Some(command),
            _ => None,
        }
    }

    /// True for a write into a pipe whose reader has gone away.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, PipelineError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }

    /// True if this is an `Upstream` wrapper.
    pub fn is_upstream(&self) -> bool {
        matches!(self, PipelineError::Upstream(_))
    }
}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        PipelineError::Io(Arc::new(err))
    }
}
