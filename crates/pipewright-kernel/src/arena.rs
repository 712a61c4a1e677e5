//! Teardown arena — closes every process group still open at host shutdown.
//!
//! One arena is built at startup and handed to each `ProcessGroup` as it is
//! constructed. The host's shutdown path calls [`TeardownArena::close_all`]
//! exactly once (directly, through a [`TeardownGuard`], or from the signal
//! task started by [`TeardownArena::close_on_shutdown`]); later calls are
//! no-ops. Groups are held weakly: a group that was dropped has already
//! closed itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::JoinHandle;

use crate::group::{GroupId, GroupShared};

/// Registry of open process groups.
pub struct TeardownArena {
    next_group: AtomicU64,
    groups: Mutex<HashMap<GroupId, Weak<GroupShared>>>,
    torn_down: AtomicBool,
}

impl TeardownArena {
    /// Create an arena.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_group: AtomicU64::new(1),
            groups: Mutex::new(HashMap::new()),
            torn_down: AtomicBool::new(false),
        })
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<GroupId, Weak<GroupShared>>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn next_group_id(&self) -> GroupId {
        GroupId(self.next_group.fetch_add(1, Ordering::SeqCst))
    }

    /// Track a group. Returns false if the arena has already torn down.
    pub(crate) fn register(&self, group: &Arc<GroupShared>) -> bool {
        let mut groups = self.groups();
        if self.torn_down.load(Ordering::Acquire) {
            return false;
        }
        groups.insert(group.id(), Arc::downgrade(group));
        true
    }

    pub(crate) fn deregister(&self, id: GroupId) {
        self.groups().remove(&id);
    }

    /// Close every registered group. Runs once; returns the number of groups
    /// it closed (0 on every later call).
    pub fn close_all(&self) -> usize {
        let groups: Vec<Weak<GroupShared>> = {
            let mut groups = self.groups();
            if self.torn_down.swap(true, Ordering::AcqRel) {
                return 0;
            }
            groups.drain().map(|(_, g)| g).collect()
        };

        let mut closed = 0;
        for group in groups.iter().filter_map(Weak::upgrade) {
            if !group.is_closed() {
                tracing::debug!(group = %group.id(), "closing group left open at teardown");
            }
            group.close();
            closed += 1;
        }
        tracing::debug!(closed, "teardown arena closed");
        closed
    }

    /// True once `close_all` has run.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Number of registered groups that are still open.
    pub fn live_groups(&self) -> usize {
        self.groups()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|g| !g.is_closed())
            .count()
    }

    /// Guard that tears the arena down when dropped.
    pub fn guard(self: &Arc<Self>) -> TeardownGuard {
        TeardownGuard {
            arena: self.clone(),
        }
    }

    /// Spawn a task that tears down on ctrl-c (and SIGTERM on unix).
    pub fn close_on_shutdown(self: &Arc<Self>) -> JoinHandle<()> {
        let arena = Arc::downgrade(self);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            if let Some(arena) = arena.upgrade() {
                tracing::info!("shutdown signal received, closing process groups");
                arena.close_all();
            }
        })
    }
}

impl std::fmt::Debug for TeardownArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownArena")
            .field("groups", &self.groups().len())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Calls [`TeardownArena::close_all`] on drop.
#[must_use = "the arena tears down when the guard is dropped"]
#[derive(Debug)]
pub struct TeardownGuard {
    arena: Arc<TeardownArena>,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.arena.close_all();
    }
}
