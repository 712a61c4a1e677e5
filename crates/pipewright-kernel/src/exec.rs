//! Exec — builder for one process stage.
//!
//! An `Exec` names a program, its stdin, its stderr strategy and whether a
//! failing exit is an error. It does nothing until it is run (`run_*`,
//! `output`) or pulled (`stream`, `lines`).
//!
//! ```text
//!   ProcessGroup::exec(spec)
//!     .stdin(input)          Input / StdinFeed
//!     .stderr(policy)        StderrPolicy (default: keep a tail)
//!     .allow_failure()
//!     .run_text().await      or .stream() / .lines()
//! ```

use std::sync::Arc;

use pipewright_types::{ExitStatus, ProcessSpec, Result};

use crate::group::{GroupShared, ProcessGroup};
use crate::input::{Input, StdinFeed};
use crate::output::{CaptureBytes, CaptureLines, CaptureText, Ignore, OutputHandler, ProcessIo, StatusOnly};
use crate::process::{StdioConfig, StdioMode};
use crate::seq::Enumerable;
use crate::stage::process_stage;
use crate::stderr::StderrPolicy;

/// A process stage, not yet started.
#[must_use = "an Exec does nothing until it is run or pulled"]
pub struct Exec {
    group: Arc<GroupShared>,
    spec: ProcessSpec,
    stdin: StdinFeed,
    stderr: Option<StderrPolicy>,
    allow_failure: bool,
}

impl ProcessGroup {
    /// Build a stage that will spawn `spec` in this group.
    pub fn exec(&self, spec: ProcessSpec) -> Exec {
        Exec {
            group: self.shared(),
            spec,
            stdin: StdinFeed::default(),
            stderr: None,
            allow_failure: false,
        }
    }
}

impl Exec {
    /// The process this stage will spawn.
    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Feed `input` to the child's stdin. Defaults to /dev/null.
    pub fn stdin(mut self, input: impl Into<Input>) -> Self {
        self.stdin.input = input.into();
        self
    }

    /// Replace the stdin feed wholesale.
    pub fn feed(mut self, feed: StdinFeed) -> Self {
        self.stdin = feed;
        self
    }

    /// Fail with `EmptyInput` if stdin ends up empty.
    pub fn require_input(mut self) -> Self {
        self.stdin.allow_empty = false;
        self
    }

    /// Choose what happens to stderr.
    pub fn stderr(mut self, policy: StderrPolicy) -> Self {
        self.stderr = Some(policy);
        self
    }

    /// Don't raise on a non-zero exit or a signal.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    /// Spawn the process and start its stdin feeder and stderr drain.
    #[tracing::instrument(level = "debug", skip(self), fields(command = %self.spec, group = %self.group.id()))]
    pub fn start(self) -> Result<ProcessIo> {
        let config = self.group.config().clone();
        let stderr = self
            .stderr
            .unwrap_or(StderrPolicy::Tail(config.stderr_tail_lines));
        let stdio = StdioConfig {
            stdin: self.stdin.input.stdio_mode(),
            stdout: StdioMode::Piped,
            stderr: stderr.stdio_mode(),
        };

        let handle = self.group.spawn(&self.spec, stdio)?;
        let input = tokio::spawn(
            self.stdin
                .feed(handle.stdin().clone(), handle.command().to_vec()),
        );
        let stderr = stderr.spawn_drain(handle.stderr().clone(), config.read_chunk_size);

        Ok(ProcessIo::new(
            handle,
            input,
            stderr,
            self.allow_failure,
            config.read_chunk_size,
        ))
    }

    /// Start the process and hand it to `handler`.
    pub async fn output<H: OutputHandler>(self, handler: H) -> Result<H::Output> {
        let io = self.start()?;
        handler.process_output(io).await
    }

    /// Run to completion; all of stdout as bytes.
    pub async fn run_bytes(self) -> Result<Vec<u8>> {
        self.output(CaptureBytes).await
    }

    /// Run to completion; all of stdout as UTF-8 text.
    pub async fn run_text(self) -> Result<String> {
        self.output(CaptureText).await
    }

    /// Run to completion; stdout split into lines.
    pub async fn run_lines(self) -> Result<Vec<String>> {
        self.output(CaptureLines).await
    }

    /// Run to completion discarding stdout; a failing exit is returned, not
    /// raised.
    pub async fn status(self) -> Result<ExitStatus> {
        self.output(StatusOnly).await
    }

    /// Run to completion discarding stdout.
    pub async fn run(self) -> Result<()> {
        self.output(Ignore).await
    }

    /// Stdout as a lazy sequence of chunks. The process is spawned on the
    /// first pull and closed when the sequence ends or is dropped.
    pub fn stream(self) -> Enumerable<Vec<u8>> {
        process_stage(self)
    }

    /// Stdout as a lazy sequence of text lines.
    pub fn lines(self) -> Enumerable<String> {
        self.stream().text_lines()
    }
}

impl std::fmt::Debug for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exec")
            .field("spec", &self.spec)
            .field("group", &self.group.id())
            .field("stdin", &self.stdin)
            .field("stderr", &self.stderr)
            .field("allow_failure", &self.allow_failure)
            .finish()
    }
}
