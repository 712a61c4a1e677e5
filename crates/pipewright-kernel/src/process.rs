//! Process handles: one spawned child, its three scoped streams, and its exit.
//!
//! Each child is owned by a reaper task that waits for it to exit and
//! publishes the status exactly once. Closing a handle while the child is
//! still running asks the reaper to terminate it: SIGTERM first, SIGKILL
//! after the configured grace period. Children are spawned with
//! `kill_on_drop`, so a reaper dropped by a shutting-down runtime still
//! takes its child down with it.

use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use pipewright_types::{ExitStatus, PipelineError, ProcessSpec, Program, Result};

use crate::group::{GroupId, GroupShared};
use crate::handle::{ScopedReader, ScopedWriter};

/// How one standard stream of a child is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Captured behind a scoped handle.
    #[default]
    Piped,
    /// Shared with the host process.
    Inherit,
    /// Connected to /dev/null.
    Null,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Wiring for all three standard streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioConfig {
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl StdioConfig {
    /// Everything piped.
    pub fn piped() -> Self {
        Self::default()
    }
}

/// Lifecycle state of a process, for listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ProcessState {
    /// Child is still running.
    Running,
    /// Child exited (handle may still be open).
    Exited { status: ExitStatus },
    /// Handle was closed before the child's exit was observed.
    Closed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "Running"),
            ProcessState::Exited { status } => write!(f, "Exited ({})", status),
            ProcessState::Closed => write!(f, "Closed"),
        }
    }
}

/// Information about a process for listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessInfo {
    /// OS process id.
    pub pid: u32,
    /// Command vector.
    pub command: Vec<String>,
    /// Current state.
    pub state: ProcessState,
}

/// A spawned child process.
pub struct ProcessHandle {
    pid: u32,
    group_id: GroupId,
    command: Vec<String>,
    stdin: Arc<ScopedWriter>,
    stdout: Arc<ScopedReader>,
    stderr: Arc<ScopedReader>,
    status: watch::Receiver<Option<ExitStatus>>,
    terminate: CancellationToken,
    closed: AtomicBool,
    group: Weak<GroupShared>,
}

impl ProcessHandle {
    /// Spawn `spec` and start its reaper. Does not wait for the child.
    pub(crate) fn spawn(
        spec: &ProcessSpec,
        stdio: StdioConfig,
        group_id: GroupId,
        group: Weak<GroupShared>,
        kill_grace: Duration,
    ) -> Result<Arc<Self>> {
        let command = spec.argv();

        let mut cmd = match &spec.program {
            Program::Name(name) => Command::new(name),
            Program::Path(path) => Command::new(path),
        };
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env);
        cmd.stdin(stdio.stdin.to_stdio());
        cmd.stdout(stdio.stdout.to_stdio());
        cmd.stderr(stdio.stderr.to_stdio());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PipelineError::Spawn {
            command: command.clone(),
            source: Arc::new(e),
        })?;

        let Some(pid) = child.id() else {
            return Err(PipelineError::Spawn {
                command,
                source: Arc::new(io::Error::other("child exited before its pid was read")),
            });
        };

        let stdin = match child.stdin.take() {
            Some(s) => ScopedWriter::new(format!("{pid}:stdin"), s),
            None => ScopedWriter::detached(format!("{pid}:stdin")),
        };
        let stdout = match child.stdout.take() {
            Some(s) => ScopedReader::new(format!("{pid}:stdout"), s),
            None => ScopedReader::detached(format!("{pid}:stdout")),
        };
        let stderr = match child.stderr.take() {
            Some(s) => ScopedReader::new(format!("{pid}:stderr"), s),
            None => ScopedReader::detached(format!("{pid}:stderr")),
        };

        let (status_tx, status_rx) = watch::channel(None);
        let terminate = CancellationToken::new();
        tokio::spawn(reap(child, pid, status_tx, terminate.clone(), kill_grace));

        Ok(Arc::new(Self {
            pid,
            group_id,
            command,
            stdin: Arc::new(stdin),
            stdout: Arc::new(stdout),
            stderr: Arc::new(stderr),
            status: status_rx,
            terminate,
            closed: AtomicBool::new(false),
            group,
        }))
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Group this process belongs to.
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Command vector the process was spawned with.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Child stdin.
    pub fn stdin(&self) -> &Arc<ScopedWriter> {
        &self.stdin
    }

    /// Child stdout.
    pub fn stdout(&self) -> &Arc<ScopedReader> {
        &self.stdout
    }

    /// Child stderr.
    pub fn stderr(&self) -> &Arc<ScopedReader> {
        &self.stderr
    }

    /// Wait for the child to exit.
    ///
    /// Resolves with the same status on every call.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut rx = self.status.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).ok_or(PipelineError::Closed),
            // Reaper was dropped without publishing (runtime shutting down).
            Err(_) => Err(PipelineError::Closed),
        }
    }

    /// Exit status if the child has already exited.
    pub fn try_status(&self) -> Option<ExitStatus> {
        *self.status.borrow()
    }

    /// True until the child's exit has been observed.
    pub fn is_running(&self) -> bool {
        self.try_status().is_none()
    }

    /// True once `close()` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot for listing.
    pub fn info(&self) -> ProcessInfo {
        let state = match (self.try_status(), self.is_closed()) {
            (Some(status), _) => ProcessState::Exited { status },
            (None, true) => ProcessState::Closed,
            (None, false) => ProcessState::Running,
        };
        ProcessInfo {
            pid: self.pid,
            command: self.command.clone(),
            state,
        }
    }

    /// Close all three streams and terminate the child if it is still running.
    ///
    /// Idempotent and synchronous; safe from Drop and error paths.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
        if self.is_running() {
            self.terminate.cancel();
        }
        if let Some(group) = self.group.upgrade() {
            group.forget(self);
        }
        tracing::debug!(pid = self.pid, group = %self.group_id, "process handle closed");
    }

    /// Send a signal to the child.
    #[cfg(unix)]
    pub fn kill(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let pid = nix::unistd::Pid::from_raw(self.pid as i32);
        match nix::sys::signal::kill(pid, signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(PipelineError::from(io::Error::from(e))),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Own the child until it exits; publish its status once.
async fn reap(
    mut child: Child,
    pid: u32,
    status_tx: watch::Sender<Option<ExitStatus>>,
    terminate: CancellationToken,
    kill_grace: Duration,
) {
    let exited = tokio::select! {
        res = child.wait() => Some(res),
        _ = terminate.cancelled() => None,
    };
    let result = match exited {
        Some(res) => res,
        None => terminate_child(&mut child, pid, kill_grace).await,
    };

    let status = match result {
        Ok(status) => ExitStatus::from(status),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to wait for child");
            ExitStatus::from_code(-1)
        }
    };
    tracing::debug!(pid, %status, "process exited");
    status_tx.send_replace(Some(status));
}

async fn terminate_child(child: &mut Child, pid: u32, grace: Duration) -> io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to send SIGTERM"),
        }
        if let Ok(res) = tokio::time::timeout(grace, child.wait()).await {
            return res;
        }
        tracing::debug!(pid, "grace period elapsed, sending SIGKILL");
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    if let Err(e) = child.start_kill() {
        tracing::warn!(pid, error = %e, "failed to kill child");
    }
    child.wait().await
}
