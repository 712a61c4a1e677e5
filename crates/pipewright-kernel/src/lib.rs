//! pipewright-kernel: process pipelines and lazy async sequences.
//!
//! This crate provides:
//!
//! - **Handles**: Close-idempotent wrappers around child stdin/stdout/stderr
//! - **Processes**: Spawned children with SIGTERM → SIGKILL teardown
//! - **Groups**: Sets of processes closed together, tracked by a teardown arena
//! - **Enumerable**: Lazy pull-based sequences with map/filter/take/tee/cache
//! - **Concurrency**: Bounded ordered and unordered concurrent map
//! - **Stages**: Processes as sequences, piped into each other
//! - **Host**: Configuration, arena, and default group in one owner
//!
//! ```text
//!   Host ─┬─ RuntimeConfig
//!         ├─ TeardownArena ──▶ ProcessGroup* ──▶ ProcessHandle*
//!         └─ default ProcessGroup
//!
//!   Enumerable ──pipe──▶ Exec::stream ──lines──▶ concurrent_map ──▶ collect
//! ```

pub mod arena;
pub mod cache;
pub mod concurrent;
pub mod config;
pub mod exec;
pub mod group;
pub mod handle;
pub mod host;
pub mod input;
pub mod lines;
pub mod output;
pub mod pipe;
pub mod process;
pub mod seq;
pub mod stage;
pub mod stderr;
pub mod tee;

pub use arena::{TeardownArena, TeardownGuard};
pub use cache::Cached;
pub use concurrent::ConcurrencyOptions;
pub use config::RuntimeConfig;
pub use exec::Exec;
pub use group::{GroupId, ProcessGroup};
pub use handle::{ScopedReader, ScopedWriter};
pub use host::Host;
pub use input::{Input, StdinFeed};
pub use lines::LineSplitter;
pub use output::{CaptureBytes, CaptureLines, CaptureText, Ignore, OutputHandler, ProcessIo, StatusOnly};
pub use pipe::{byte_pipe, PipeSink, PipeSource};
pub use process::{ProcessHandle, ProcessInfo, ProcessState, StdioConfig, StdioMode};
pub use seq::Enumerable;
pub use stderr::{stderr_channel, StderrPolicy, StderrReceiver, StderrSink};

// Data types, so most callers need only this crate.
pub use pipewright_types::{BoxError, ExitStatus, PipelineError, ProcessSpec, Program, Result};
