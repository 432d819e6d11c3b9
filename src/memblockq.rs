//! Per-stream inbound ring queue (§4.4): seek/push semantics for routed
//! media frames.
//!
//! A simplified stand-in for the real `pa_memblockq` (silence generation on
//! underrun, history retention for playback resampling, etc. are all out of
//! scope); this only needs to support what the transport's memblock-received
//! handler does: seek the write pointer, push data aligned to it, or skip
//! over a hole, and report how much contiguous data is available to read.

use std::collections::VecDeque;

use crate::memblock::Memblock;

/// How an `offset` is interpreted when repositioning a queue's write (or
/// read) pointer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SeekMode {
    /// Relative to the current write index.
    Relative,
    /// Relative to index zero.
    Absolute,
    /// Relative to the current read index.
    RelativeOnRead,
    /// Relative to the end of the queue (write index).
    RelativeEnd,
}

/// A segment of data at a known absolute byte offset.
struct Segment {
    start: i64,
    block: Memblock,
}

/// An append-only, seekable byte queue keyed by absolute offsets.
#[derive(Default)]
pub struct MemblockQ {
    read_index: i64,
    write_index: i64,
    segments: VecDeque<Segment>,
}

impl MemblockQ {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reposition the write pointer per `mode`.
    pub fn seek(&mut self, offset: i64, mode: SeekMode) {
        self.write_index = match mode {
            SeekMode::Relative => self.write_index.saturating_add(offset),
            SeekMode::Absolute => offset,
            SeekMode::RelativeOnRead => self.read_index.saturating_add(offset),
            SeekMode::RelativeEnd => self.write_index.saturating_add(offset),
        };
    }

    /// Push `block` at the current write pointer, then advance the write
    /// pointer past it ("push aligned" per §4.4).
    pub fn push(&mut self, block: Memblock) {
        if block.is_empty() {
            return;
        }
        let start = self.write_index;
        self.write_index = self.write_index.saturating_add(block.len() as i64);
        self.segments.push_back(Segment { start, block });
    }

    /// Skip over `amount` bytes of hole without writing any data (§4.4 "if
    /// the block is empty (a hole), advance the queue's write pointer").
    pub fn advance_past_hole(&mut self, amount: i64) {
        self.write_index = self.write_index.saturating_add(amount);
    }

    /// Bytes of contiguous data available to read starting at the current
    /// read index.
    pub fn readable_size(&self) -> usize {
        let mut expect = self.read_index;
        let mut total = 0usize;
        for seg in self.segments.iter() {
            if seg.start != expect {
                break;
            }
            total += seg.block.len();
            expect = expect.saturating_add(seg.block.len() as i64);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.readable_size() == 0
    }

    /// Consume and return up to `max_len` bytes of contiguous readable data,
    /// advancing the read index.
    pub fn discard(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max_len {
            let seg = match self.segments.front() {
                Some(s) if s.start == self.read_index => s,
                _ => break,
            };
            let take = (max_len - out.len()).min(seg.block.len());
            out.extend_from_slice(&seg.block.as_bytes()[..take]);
            self.read_index = self.read_index.saturating_add(take as i64);
            if take == seg.block.len() {
                self.segments.pop_front();
            } else {
                // Partial consume: replace the front segment with the remainder.
                let remainder = seg.block.as_bytes()[take..].to_vec();
                self.segments.pop_front();
                self.segments.push_front(Segment {
                    start: self.read_index,
                    block: Memblock::from_bytes(remainder),
                });
            }
        }
        out
    }

    pub fn read_index(&self) -> i64 {
        self.read_index
    }

    pub fn write_index(&self) -> i64 {
        self.write_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_advances_write_pointer_and_is_readable_in_order() {
        let mut q = MemblockQ::new();
        q.push(Memblock::from_bytes(vec![1, 2, 3]));
        q.push(Memblock::from_bytes(vec![4, 5]));
        assert_eq!(q.write_index(), 5);
        assert_eq!(q.readable_size(), 5);
        assert_eq!(q.discard(5), vec![1, 2, 3, 4, 5]);
        assert_eq!(q.readable_size(), 0);
    }

    #[test]
    fn hole_advances_write_pointer_without_data() {
        let mut q = MemblockQ::new();
        q.seek(0, SeekMode::Absolute);
        q.advance_past_hole(10);
        assert_eq!(q.write_index(), 10);
        assert_eq!(q.readable_size(), 0);

        // Data written right after the hole is not contiguous with index 0,
        // so it isn't reported as readable until the hole itself is
        // accounted for by the stream/application layer.
        q.push(Memblock::from_bytes(vec![9, 9]));
        assert_eq!(q.readable_size(), 0);
    }

    #[test]
    fn absolute_seek_repositions_write_pointer() {
        let mut q = MemblockQ::new();
        q.push(Memblock::from_bytes(vec![1, 2, 3]));
        q.seek(0, SeekMode::Absolute);
        q.push(Memblock::from_bytes(vec![9]));
        assert_eq!(q.readable_size(), 1);
        assert_eq!(q.discard(1), vec![9]);
    }
}
