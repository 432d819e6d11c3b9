//! Minimal playback/record stream handles (§1 external collaborator
//! "per-stream playback/record state machines").
//!
//! The full buffering, flow-control, and latency-reporting state machines
//! those streams run are out of scope; this crate only needs enough of a
//! stream to exist as something `PLAYBACK_STREAM_KILLED`/
//! `RECORD_STREAM_KILLED` and routed memblock frames can act on, and
//! something the context's stream map can look up by channel id (§3).

use crate::memblockq::MemblockQ;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn is_good(self) -> bool {
        matches!(self, StreamState::Creating | StreamState::Ready)
    }
}

pub type ReadCallback = Box<dyn FnMut(usize)>;

pub struct PlaybackStream {
    channel: u32,
    state: StreamState,
}

impl PlaybackStream {
    pub fn new(channel: u32) -> Self {
        Self { channel, state: StreamState::Creating }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn set_ready(&mut self) {
        if self.state.is_good() {
            self.state = StreamState::Ready;
        }
    }

    /// §6.2 `PLAYBACK_STREAM_KILLED`: the daemon unilaterally tore this
    /// stream down (device removed, stream moved away, etc).
    pub fn fail(&mut self) {
        self.state = StreamState::Failed;
    }

    pub fn terminate(&mut self) {
        self.state = StreamState::Terminated;
    }
}

pub struct RecordStream {
    channel: u32,
    state: StreamState,
    queue: MemblockQ,
    read_cb: Option<ReadCallback>,
}

impl RecordStream {
    pub fn new(channel: u32) -> Self {
        Self { channel, state: StreamState::Creating, queue: MemblockQ::new(), read_cb: None }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn set_ready(&mut self) {
        if self.state.is_good() {
            self.state = StreamState::Ready;
        }
    }

    pub fn fail(&mut self) {
        self.state = StreamState::Failed;
    }

    pub fn terminate(&mut self) {
        self.state = StreamState::Terminated;
    }

    pub fn queue_mut(&mut self) -> &mut MemblockQ {
        &mut self.queue
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }

    /// Notify the application that `readable` bytes are newly available,
    /// called after a memblock frame lands in `queue` (§4.4 routing
    /// contract's terminus).
    pub fn notify_readable(&mut self, readable: usize) {
        if let Some(cb) = self.read_cb.as_mut() {
            cb(readable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memblock::Memblock;

    #[test]
    fn playback_stream_kill_is_terminal_and_not_good() {
        let mut s = PlaybackStream::new(3);
        assert!(s.state().is_good());
        s.fail();
        assert_eq!(s.state(), StreamState::Failed);
        assert!(!s.state().is_good());
    }

    #[test]
    fn record_stream_routes_pushed_blocks_through_its_queue() {
        let mut s = RecordStream::new(7);
        s.queue_mut().push(Memblock::from_bytes(vec![1, 2, 3]));
        assert_eq!(s.queue_mut().readable_size(), 3);
    }

    #[test]
    fn notify_readable_invokes_read_callback() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut s = RecordStream::new(1);
        let seen = Rc::new(Cell::new(0usize));
        let seen_cb = seen.clone();
        s.set_read_callback(Box::new(move |n| seen_cb.set(n)));
        s.notify_readable(42);
        assert_eq!(seen.get(), 42);
    }
}
