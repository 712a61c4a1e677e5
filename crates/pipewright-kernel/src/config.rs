//! Runtime configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

/// Default read size for process stdout chunks.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default number of stderr lines kept for failure messages.
pub const DEFAULT_STDERR_TAIL_LINES: usize = 20;

/// Default time between SIGTERM and SIGKILL when closing a live process.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Configuration shared by a host, its process groups, and their stages.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default concurrency for `concurrent_map` and friends.
    pub concurrency: NonZeroUsize,

    /// How long a closed process gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,

    /// Stderr lines retained by the default stderr strategy.
    pub stderr_tail_lines: usize,

    /// Maximum bytes read from a process stdout per chunk.
    pub read_chunk_size: usize,
}

/// Logical CPU count, falling back to 1 if the OS won't say.
pub fn default_concurrency() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            kill_grace: DEFAULT_KILL_GRACE,
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `PIPEWRIGHT_*` environment variables.
    ///
    /// Recognised: `PIPEWRIGHT_CONCURRENCY`, `PIPEWRIGHT_KILL_GRACE_MS`,
    /// `PIPEWRIGHT_STDERR_TAIL`. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Short kill grace so tests that abandon processes finish quickly.
    pub fn testing() -> Self {
        Self {
            kill_grace: Duration::from_millis(200),
            ..Self::default()
        }
    }

    /// Set the default concurrency. Zero is clamped to 1.
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Set the kill grace period.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_var::<usize>(&lookup, "PIPEWRIGHT_CONCURRENCY") {
            self = self.with_concurrency(n);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "PIPEWRIGHT_KILL_GRACE_MS") {
            self.kill_grace = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "PIPEWRIGHT_STDERR_TAIL") {
            self.stderr_tail_lines = n;
        }
        self
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}
