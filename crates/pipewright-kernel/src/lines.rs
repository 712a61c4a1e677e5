//! Line splitting for byte-chunk sequences.
//!
//! Chunks from a process arrive at arbitrary boundaries. The splitter keeps
//! the unterminated tail between chunks, so a line split across any number
//! of chunks is reassembled, and a CRLF split between two chunks still loses
//! its CR.

use std::collections::VecDeque;

use crate::seq::Enumerable;

/// Incremental `\n` splitter. A trailing `\r` on a completed line is dropped.
#[derive(Debug, Default, Clone)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line it completed, terminators removed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            let mut line = std::mem::take(&mut self.pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Input ended: the unterminated remainder, if there is one.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Bytes seen since the last completed line.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

struct SplitState {
    upstream: Option<Enumerable<Vec<u8>>>,
    splitter: LineSplitter,
    ready: VecDeque<Vec<u8>>,
}

impl Enumerable<Vec<u8>> {
    /// Re-chunk into lines. Pulls upstream only when no split line is queued.
    pub fn lines(self) -> Enumerable<Vec<u8>> {
        let state = SplitState {
            upstream: Some(self),
            splitter: LineSplitter::new(),
            ready: VecDeque::new(),
        };
        Enumerable::unfold(state, |mut st| async move {
            loop {
                if let Some(line) = st.ready.pop_front() {
                    return Some((Ok(line), st));
                }
                let upstream = st.upstream.as_mut()?;
                match upstream.next().await {
                    Some(Ok(chunk)) => {
                        let lines = st.splitter.push(&chunk);
                        st.ready.extend(lines);
                    }
                    Some(Err(e)) => {
                        st.upstream = None;
                        return Some((Err(e), st));
                    }
                    None => {
                        st.upstream = None;
                        let last = st.splitter.finish()?;
                        return Some((Ok(last), st));
                    }
                }
            }
        })
    }

    /// Lines decoded as UTF-8, invalid sequences replaced.
    pub fn text_lines(self) -> Enumerable<String> {
        self.lines().map(|line| String::from_utf8_lossy(&line).into_owned())
    }
}

impl Enumerable<String> {
    /// Newline-terminated byte chunks, one per line, for feeding a process.
    pub fn join_lines(self) -> Enumerable<Vec<u8>> {
        self.map(|mut line| {
            line.push('\n');
            line.into_bytes()
        })
    }
}
