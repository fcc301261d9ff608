//! Scripted in-memory transport.
//!
//! [`MockLink`] replays a queue of lines in place of a real sensor. Handles are
//! cheap clones sharing one script, so a test can keep a handle after moving
//! another into an [`AcquisitionBuffer`](crate::AcquisitionBuffer) and inspect
//! how the buffer used it.

use crate::serial_link::{
    Assembled, LineAssembler, LineTransport, SerialLinkError, DEFAULT_MAX_LINE_LEN,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum Scripted {
    Bytes(Vec<u8>),
    // The board goes quiet until the read times out.
    Stall,
    IoFailure,
}

#[derive(Debug)]
struct MockState {
    // Bytes already sitting in the input buffer, dropped by `discard_pending`.
    pending: VecDeque<Scripted>,
    incoming: VecDeque<Scripted>,
    assembler: LineAssembler,
    discards: usize,
    reads: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            incoming: VecDeque::new(),
            assembler: LineAssembler::new(DEFAULT_MAX_LINE_LEN),
            discards: 0,
            reads: 0,
        }
    }
}

impl MockState {
    fn next(&mut self) -> Option<(Scripted, bool)> {
        if let Some(scripted) = self.pending.pop_front() {
            return Some((scripted, true));
        }
        self.incoming.pop_front().map(|scripted| (scripted, false))
    }

    fn read_line(&mut self) -> Result<Vec<u8>, SerialLinkError> {
        loop {
            let Some((scripted, from_pending)) = self.next() else {
                // A silent device looks like a timeout.
                return Err(self.timeout());
            };

            match scripted {
                Scripted::Bytes(bytes) => {
                    for (i, &byte) in bytes.iter().enumerate() {
                        let done = match self.assembler.push(byte) {
                            Assembled::Pending => continue,
                            Assembled::Line(line) => Ok(line),
                            Assembled::Overrun(partial) => Err(SerialLinkError::Overrun {
                                limit: self.assembler.max_len(),
                                partial,
                            }),
                        };

                        let rest = bytes[i + 1..].to_vec();
                        if !rest.is_empty() {
                            let queue = if from_pending {
                                &mut self.pending
                            } else {
                                &mut self.incoming
                            };
                            queue.push_front(Scripted::Bytes(rest));
                        }
                        return done;
                    }
                }
                Scripted::Stall => return Err(self.timeout()),
                Scripted::IoFailure => {
                    self.assembler.abandon();
                    return Err(SerialLinkError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "mock device disconnected",
                    )));
                }
            }
        }
    }

    fn timeout(&mut self) -> SerialLinkError {
        SerialLinkError::Timeout {
            timeout: Duration::ZERO,
            partial: self.assembler.abandon(),
        }
    }
}

/// Scripted stand-in for a sensor board.
///
/// The script is a byte stream: lines, fragments of lines, stalls and
/// disconnects, replayed in order. Lines are reassembled the same way the
/// serial link does it.
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A link that will deliver `lines` in order.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let link = Self::new();
        for line in lines {
            link.push_line(line);
        }
        link
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a line the device will send after the next read starts.
    pub fn push_line(&self, line: impl AsRef<str>) {
        self.push_bytes(line.as_ref().as_bytes());
    }

    /// Queue a raw line, which need not be valid UTF-8.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut line = bytes.to_vec();
        line.push(b'\n');
        self.state().incoming.push_back(Scripted::Bytes(line));
    }

    /// Queue bytes exactly as given, without a terminator, so a line can
    /// arrive in pieces.
    pub fn push_raw(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.state().incoming.push_back(Scripted::Bytes(bytes.to_vec()));
        }
    }

    /// Queue a pause long enough for the read in progress to time out.
    pub fn push_stall(&self) {
        self.state().incoming.push_back(Scripted::Stall);
    }

    /// Queue the head of a line followed by a stall. Whatever is queued next
    /// continues that same line.
    pub fn push_timeout(&self, partial: impl AsRef<str>) {
        self.push_raw(partial.as_ref().as_bytes());
        self.push_stall();
    }

    /// Queue a read that fails as if the device was unplugged.
    pub fn push_io_failure(&self) {
        self.state().incoming.push_back(Scripted::IoFailure);
    }

    /// Place a line in the input buffer as if it had been received before the
    /// current point started.
    pub fn push_stale(&self, line: impl AsRef<str>) {
        let mut bytes = line.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        self.state().pending.push_back(Scripted::Bytes(bytes));
    }

    /// Place the head of a line in the input buffer. The device is still
    /// sending the rest of it, so the next queued bytes continue that line.
    pub fn push_stale_partial(&self, head: impl AsRef<str>) {
        let head = head.as_ref().as_bytes();
        if !head.is_empty() {
            self.state().pending.push_back(Scripted::Bytes(head.to_vec()));
        }
    }

    /// Number of times the input buffer was flushed.
    pub fn discards(&self) -> usize {
        self.state().discards
    }

    /// Number of `read_line` calls served.
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Scripted chunks not consumed yet.
    pub fn remaining(&self) -> usize {
        let state = self.state();
        state.pending.len() + state.incoming.len()
    }
}

impl LineTransport for MockLink {
    fn discard_pending(&mut self) -> Result<(), SerialLinkError> {
        let mut state = self.state();
        state.discards += 1;

        let cut = state.pending.back().is_some_and(|last| {
            matches!(last, Scripted::Bytes(bytes) if bytes.last() != Some(&b'\n'))
        });
        state.pending.clear();
        if cut {
            state.assembler.resync();
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Vec<u8>, SerialLinkError> {
        let mut state = self.state();
        state.reads += 1;
        state.read_line()
    }
}
