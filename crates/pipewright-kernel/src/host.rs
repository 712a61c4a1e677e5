//! Host — the top-level owner of a pipewright runtime.
//!
//! A host carries the configuration, the teardown arena, and a default
//! process group. Dropping the host (or calling `shutdown`) closes every
//! group created through it, including groups the caller forgot about.

use std::sync::Arc;

use pipewright_types::{PipelineError, ProcessSpec, Result};

use crate::arena::TeardownArena;
use crate::concurrent::ConcurrencyOptions;
use crate::config::RuntimeConfig;
use crate::exec::Exec;
use crate::group::ProcessGroup;

/// Configuration, teardown arena, and default process group.
pub struct Host {
    config: RuntimeConfig,
    arena: Arc<TeardownArena>,
    group: ProcessGroup,
}

impl Host {
    pub fn new(config: RuntimeConfig) -> Self {
        let arena = TeardownArena::new();
        let group = ProcessGroup::new(&arena, config.clone());
        tracing::debug!(concurrency = config.concurrency.get(), "host created");
        Self { config, arena, group }
    }

    /// Host configured from `PIPEWRIGHT_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn arena(&self) -> &Arc<TeardownArena> {
        &self.arena
    }

    /// The default process group.
    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    /// A fresh group, closed at the latest when the host shuts down.
    pub fn new_group(&self) -> ProcessGroup {
        ProcessGroup::new(&self.arena, self.config.clone())
    }

    /// Default options for the concurrent operators.
    pub fn concurrency(&self) -> ConcurrencyOptions {
        ConcurrencyOptions::from_config(&self.config)
    }

    /// A stage in the default group.
    pub fn exec(&self, spec: ProcessSpec) -> Exec {
        self.group.exec(spec)
    }

    /// A stage in the default group from an argv vector.
    pub fn cmd<I, S>(&self, argv: I) -> Result<Exec>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let spec = ProcessSpec::from_argv(argv).ok_or_else(|| PipelineError::Spawn {
            command: Vec::new(),
            source: Arc::new(std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")),
        })?;
        Ok(self.exec(spec))
    }

    /// Close every group. Returns how many were still registered.
    pub fn shutdown(&self) -> usize {
        self.arena.close_all()
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("arena", &self.arena)
            .finish()
    }
}
