//! Process stages as lazy sequences, and piping sequences through them.
//!
//! ```text
//!   upstream seq ──▶ feeder task ──▶ child stdin
//!                                      │
//!   consumer ◀── Enumerable ◀── child stdout
//! ```
//!
//! A stage spawns its child on the first pull. Each pull reads one stdout
//! chunk. At end-of-data the stage settles: a failed feeder (an upstream
//! failure) wins over the child's own exit status. Dropping the sequence at
//! any point closes the child and aborts the feeder, which drops the
//! upstream sequence in turn, so abandoning the tail of a pipeline tears
//! down every stage before it.

use pipewright_types::ProcessSpec;

use crate::exec::Exec;
use crate::group::ProcessGroup;
use crate::output::ProcessIo;
use crate::seq::Enumerable;

enum StageState {
    Pending(Exec),
    Running(ProcessIo),
    Done,
}

pub(crate) fn process_stage(exec: Exec) -> Enumerable<Vec<u8>> {
    Enumerable::unfold(StageState::Pending(exec), |state| async move {
        let mut io = match state {
            StageState::Pending(exec) => match exec.start() {
                Ok(io) => io,
                Err(e) => return Some((Err(e), StageState::Done)),
            },
            StageState::Running(io) => io,
            StageState::Done => return None,
        };

        if let Some(e) = io.input_failure().await {
            tracing::debug!(pid = io.handle().pid(), error = %e, "upstream failed");
            return Some((Err(e), StageState::Done));
        }
        match io.read_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), StageState::Running(io))),
            Ok(None) => match io.finish().await {
                Ok(_) => None,
                Err(e) => Some((Err(e), StageState::Done)),
            },
            Err(e) => Some((Err(e), StageState::Done)),
        }
    })
}

impl Enumerable<Vec<u8>> {
    /// Feed this sequence to a new process in `group`; yield its stdout.
    pub fn pipe(self, group: &ProcessGroup, spec: ProcessSpec) -> Enumerable<Vec<u8>> {
        group.exec(spec).stdin(self).stream()
    }

    /// Feed this sequence to a configured stage; yield its stdout.
    pub fn pipe_into(self, exec: Exec) -> Enumerable<Vec<u8>> {
        exec.stdin(self).stream()
    }
}

impl Enumerable<String> {
    /// Feed these lines to a new process in `group`; yield its stdout lines.
    pub fn pipe_lines(self, group: &ProcessGroup, spec: ProcessSpec) -> Enumerable<String> {
        self.join_lines().pipe(group, spec).text_lines()
    }
}
