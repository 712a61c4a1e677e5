//! Stderr strategies for process stages.
//!
//! By default a stage keeps the last few lines of its child's stderr and
//! attaches them to the `ExitCode`/`Signal` error if the child fails.
//! Stderr from several stages can also be merged into one channel, drained
//! by whoever owns the receiver:
//!
//! ```text
//!   stage 1 ──┐
//!   stage 2 ──┼──▶ StderrSink (mpsc) ──▶ StderrReceiver::drain / recv
//!   stage 3 ──┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::handle::ScopedReader;
use crate::lines::LineSplitter;
use crate::process::StdioMode;

/// Callback invoked with each stderr line.
pub type StderrCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// What a stage does with its child's stderr.
#[derive(Clone)]
pub enum StderrPolicy {
    /// Share the host's stderr.
    Inherit,
    /// Send to /dev/null.
    Discard,
    /// Keep the last `n` lines for failure messages.
    Tail(usize),
    /// Call back with every line.
    Each(StderrCallback),
    /// Forward every line into a shared channel, keeping no tail.
    Forward(StderrSink),
}

impl StderrPolicy {
    /// Call `f` with each stderr line.
    pub fn each(f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        StderrPolicy::Each(Arc::new(f))
    }

    pub(crate) fn stdio_mode(&self) -> StdioMode {
        match self {
            StderrPolicy::Inherit => StdioMode::Inherit,
            StderrPolicy::Discard => StdioMode::Null,
            _ => StdioMode::Piped,
        }
    }

    /// Drain `reader` on a background task according to this policy.
    ///
    /// The task resolves to the retained tail, if the policy keeps one.
    pub(crate) fn spawn_drain(self, reader: Arc<ScopedReader>, chunk_size: usize) -> JoinHandle<Option<String>> {
        tokio::spawn(async move {
            let mut collector = Collector::new(self);
            let mut splitter = LineSplitter::new();
            loop {
                match reader.read_chunk(chunk_size).await {
                    Ok(Some(chunk)) => {
                        for line in splitter.push(&chunk) {
                            collector.line(&line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(handle = reader.label(), error = %e, "stderr read failed");
                        break;
                    }
                }
            }
            if let Some(rest) = splitter.finish() {
                collector.line(&rest);
            }
            collector.into_tail()
        })
    }
}

impl fmt::Debug for StderrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StderrPolicy::Inherit => write!(f, "Inherit"),
            StderrPolicy::Discard => write!(f, "Discard"),
            StderrPolicy::Tail(n) => write!(f, "Tail({n})"),
            StderrPolicy::Each(_) => write!(f, "Each(..)"),
            StderrPolicy::Forward(_) => write!(f, "Forward(..)"),
        }
    }
}

struct Collector {
    policy: StderrPolicy,
    tail: VecDeque<String>,
}

impl Collector {
    fn new(policy: StderrPolicy) -> Self {
        Self {
            policy,
            tail: VecDeque::new(),
        }
    }

    fn line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        match &self.policy {
            StderrPolicy::Tail(0) | StderrPolicy::Inherit | StderrPolicy::Discard => {}
            StderrPolicy::Tail(n) => {
                if self.tail.len() == *n {
                    self.tail.pop_front();
                }
                self.tail.push_back(line.into_owned());
            }
            StderrPolicy::Each(f) => f(&line),
            StderrPolicy::Forward(sink) => sink.write_line(&line),
        }
    }

    fn into_tail(self) -> Option<String> {
        if self.tail.is_empty() {
            return None;
        }
        Some(Vec::from(self.tail).join("\n"))
    }
}

/// Cloneable sending side of a merged stderr channel.
#[derive(Clone, Debug)]
pub struct StderrSink {
    sender: mpsc::UnboundedSender<String>,
}

/// Receiving side of a merged stderr channel.
#[derive(Debug)]
pub struct StderrReceiver {
    receiver: mpsc::UnboundedReceiver<String>,
}

/// Create a merged stderr channel.
pub fn stderr_channel() -> (StderrSink, StderrReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (StderrSink { sender }, StderrReceiver { receiver })
}

impl StderrSink {
    /// Queue one line. Dropped silently if the receiver is gone.
    pub fn write_line(&self, line: &str) {
        let _ = self.sender.send(line.to_string());
    }
}

impl StderrReceiver {
    /// Next line, waiting for one. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Every line queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.receiver.try_recv() {
            lines.push(line);
        }
        lines
    }
}
