//! Process groups, the unit of lifetime management for spawned children.
//!
//! A group tracks its live process handles by pid. Closing the group closes
//! every member exactly once; a handle closed on its own removes itself from
//! the group. Every group is registered with a [`TeardownArena`] at
//! construction, so a group that is never closed explicitly is still closed
//! when the host tears down.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 ProcessGroup                  │
//! │  live: HashMap<pid, Arc<ProcessHandle>>       │
//! │  - spawn(spec)   → Arc<ProcessHandle>         │
//! │  - close()       → close each member once     │
//! │  - list()        → Vec<ProcessInfo>           │
//! └───────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use pipewright_types::{PipelineError, ProcessSpec, Result};

use crate::arena::TeardownArena;
use crate::config::RuntimeConfig;
use crate::process::{ProcessHandle, ProcessInfo, StdioConfig};

/// Unique identifier for a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State shared between a group, its handles, and the teardown arena.
pub(crate) struct GroupShared {
    id: GroupId,
    config: RuntimeConfig,
    live: Mutex<HashMap<u32, Arc<ProcessHandle>>>,
    closed: AtomicBool,
    arena: Weak<TeardownArena>,
}

impl GroupShared {
    fn live(&self) -> MutexGuard<'_, HashMap<u32, Arc<ProcessHandle>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn id(&self) -> GroupId {
        self.id
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[tracing::instrument(level = "debug", skip(self, spec), fields(group = %self.id, command = %spec))]
    pub(crate) fn spawn(self: &Arc<Self>, spec: &ProcessSpec, stdio: StdioConfig) -> Result<Arc<ProcessHandle>> {
        if self.is_closed() {
            return Err(PipelineError::Closed);
        }

        let handle = ProcessHandle::spawn(
            spec,
            stdio,
            self.id,
            Arc::downgrade(self),
            self.config.kill_grace,
        )?;

        let displaced = {
            let mut live = self.live();
            // Checked under the lock so a concurrent close() can't miss us.
            if self.is_closed() {
                drop(live);
                handle.close();
                return Err(PipelineError::Closed);
            }
            live.insert(handle.pid(), handle.clone())
        };
        if let Some(old) = displaced {
            // pid reuse: the old child is long gone.
            old.close();
        }

        tracing::debug!(pid = handle.pid(), "spawned");
        Ok(handle)
    }

    /// Drop a member that closed on its own.
    pub(crate) fn forget(&self, handle: &ProcessHandle) {
        let removed = {
            let mut live = self.live();
            match live.get(&handle.pid()) {
                Some(h) if std::ptr::eq(Arc::as_ptr(h), handle) => live.remove(&handle.pid()),
                _ => None,
            }
        };
        drop(removed);
    }

    /// Close every member once. Returns how many were closed by this call.
    pub(crate) fn close(&self) -> usize {
        let members: Vec<Arc<ProcessHandle>> = {
            let mut live = self.live();
            if self.closed.swap(true, Ordering::AcqRel) {
                return 0;
            }
            live.drain().map(|(_, h)| h).collect()
        };

        for handle in &members {
            handle.close();
        }
        if let Some(arena) = self.arena.upgrade() {
            arena.deregister(self.id);
        }
        tracing::debug!(group = %self.id, closed = members.len(), "process group closed");
        members.len()
    }
}

/// A set of live processes closed together.
pub struct ProcessGroup {
    shared: Arc<GroupShared>,
}

impl ProcessGroup {
    /// Create a group registered with `arena`.
    ///
    /// A group created after the arena has torn down starts closed.
    pub fn new(arena: &Arc<TeardownArena>, config: RuntimeConfig) -> Self {
        let shared = Arc::new(GroupShared {
            id: arena.next_group_id(),
            config,
            live: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            arena: Arc::downgrade(arena),
        });
        if !arena.register(&shared) {
            shared.closed.store(true, Ordering::Release);
        }
        Self { shared }
    }

    /// Group identifier.
    pub fn id(&self) -> GroupId {
        self.shared.id
    }

    /// Configuration this group spawns with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Spawn a process with all three streams piped.
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<Arc<ProcessHandle>> {
        self.shared.spawn(spec, StdioConfig::piped())
    }

    /// Spawn a process with explicit stream wiring.
    pub fn spawn_with(&self, spec: &ProcessSpec, stdio: StdioConfig) -> Result<Arc<ProcessHandle>> {
        self.shared.spawn(spec, stdio)
    }

    /// Look up a live member by pid.
    pub fn get(&self, pid: u32) -> Option<Arc<ProcessHandle>> {
        self.shared.live().get(&pid).cloned()
    }

    /// List live members.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self.shared.live().values().map(|h| h.info()).collect();
        infos.sort_by_key(|i| i.pid);
        infos
    }

    /// Number of members not yet closed.
    pub fn live_count(&self) -> usize {
        self.shared.live().len()
    }

    /// Close every member and deregister from the arena. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// True once closed, explicitly or by arena teardown.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub(crate) fn shared(&self) -> Arc<GroupShared> {
        self.shared.clone()
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("id", &self.shared.id)
            .field("live", &self.live_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sleeper() -> ProcessSpec {
        ProcessSpec::new("sleep").arg("30")
    }

    #[tokio::test]
    async fn test_spawn_registers_member() {
        let arena = TeardownArena::new();
        let group = ProcessGroup::new(&arena, RuntimeConfig::testing());

        let handle = group.spawn(&sleeper()).unwrap();
        assert_eq!(group.live_count(), 1);
        assert!(group.get(handle.pid()).is_some());
        assert_eq!(group.list()[0].command, vec!["sleep", "30"]);

        group.close();
        assert_eq!(group.live_count(), 0);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_handle_close_deregisters() {
        let arena = TeardownArena::new();
        let group = ProcessGroup::new(&arena, RuntimeConfig::testing());

        let handle = group.spawn(&sleeper()).unwrap();
        handle.close();
        assert_eq!(group.live_count(), 0);

        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("closed child should exit")
            .unwrap();
        assert_eq!(status.signal, Some(15));
    }

    #[tokio::test]
    async fn test_spawn_after_close_fails() {
        let arena = TeardownArena::new();
        let group = ProcessGroup::new(&arena, RuntimeConfig::testing());
        group.close();

        let err = group.spawn(&sleeper()).unwrap_err();
        assert!(matches!(err, PipelineError::Closed));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let arena = TeardownArena::new();
        let group = ProcessGroup::new(&arena, RuntimeConfig::testing());

        let err = group
            .spawn(&ProcessSpec::new("definitely_not_a_real_command_12345"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
        assert_eq!(group.live_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_closes_group() {
        let arena = TeardownArena::new();
        let handle = {
            let group = ProcessGroup::new(&arena, RuntimeConfig::testing());
            group.spawn(&sleeper()).unwrap()
        };
        assert!(handle.is_closed());
        assert_eq!(arena.live_groups(), 0);
    }
}
