//! Per-sender reassembly of fragmented WebSocket messages.
//!
//! A BEGIN frame opens (or resets) the sender's buffer, CONTINUE frames
//! append, and the END frame's payload completes the message. Size
//! enforcement happens in the engine, which owns the close policy.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::chat::UserId;

#[derive(Default)]
pub struct FrameReassembler {
    buffers: Mutex<HashMap<UserId, Vec<u8>>>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fragmented message, replacing any prior partial buffer.
    pub fn begin(&self, sender: UserId, data: &[u8]) {
        self.lock().insert(sender, data.to_vec());
    }

    /// Append a continuation. Continuations without a prior BEGIN are
    /// silently discarded.
    pub fn append(&self, sender: UserId, data: &[u8]) {
        if let Some(buffer) = self.lock().get_mut(&sender) {
            buffer.extend_from_slice(data);
        }
    }

    /// Complete the message: buffered fragments plus the terminal frame's
    /// payload. The sender's buffer entry is removed.
    pub fn finish(&self, sender: UserId, last: &[u8]) -> Vec<u8> {
        let mut assembled = self.lock().remove(&sender).unwrap_or_default();
        assembled.extend_from_slice(last);
        assembled
    }

    pub fn has_buffer(&self, sender: UserId) -> bool {
        self.lock().contains_key(&sender)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_across_fragments() {
        let reassembler = FrameReassembler::new();
        reassembler.begin(10, b"ab");
        reassembler.append(10, b"cd");
        assert!(reassembler.has_buffer(10));

        assert_eq!(reassembler.finish(10, b"ef"), b"abcdef");
        assert!(!reassembler.has_buffer(10));
    }

    #[test]
    fn begin_resets_a_partial_buffer() {
        let reassembler = FrameReassembler::new();
        reassembler.begin(10, b"stale");
        reassembler.begin(10, b"fresh-");
        assert_eq!(reassembler.finish(10, b"end"), b"fresh-end");
    }

    #[test]
    fn orphan_continuation_is_discarded() {
        let reassembler = FrameReassembler::new();
        reassembler.append(10, b"orphan");
        assert!(!reassembler.has_buffer(10));
        assert_eq!(reassembler.finish(10, b"tail"), b"tail");
    }

    #[test]
    fn senders_are_independent() {
        let reassembler = FrameReassembler::new();
        reassembler.begin(1, b"one-");
        reassembler.begin(2, b"two-");
        assert_eq!(reassembler.finish(1, b"a"), b"one-a");
        assert_eq!(reassembler.finish(2, b"b"), b"two-b");
    }
}
