//! The external main loop abstraction (§1, §9 "Coroutines/async").
//!
//! The main loop API is explicitly an external collaborator: spec.md says it
//! is "specified only by the interfaces the core consumes". This mirrors the
//! teacher's `pa_mainloop_api`/`MainloopApi` function-pointer struct as a set
//! of Rust traits instead, and additionally provides `StdMainloop`, a small
//! `libc::poll`-based reference implementation used by this crate's own
//! tests (the teacher ships three of its own: standard, threaded, glib).

use bitflags::bitflags;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

bitflags! {
    /// Flags describing which readiness events an I/O source should be
    /// watched for.
    pub struct IoEventFlags: u32 {
        const NULL  = 0x00;
        const INPUT = 0x01;
        const OUTPUT = 0x02;
        const HANGUP = 0x04;
        const ERROR  = 0x08;
    }
}

pub type IoCallback = Box<dyn FnMut(IoEventFlags)>;
pub type TimeCallback = Box<dyn FnMut()>;
pub type DeferCallback = Box<dyn FnMut()>;

/// A registered I/O event source. Dropping it unregisters the callback.
pub trait IoEvent {
    fn set_enabled(&mut self, events: IoEventFlags);
}

/// A registered timer event source.
pub trait TimeEvent {
    /// Restart the timer at `deadline`, or disarm it entirely when `None`
    /// (mirrors `usec = USEC_INVALID` meaning "no deadline").
    fn restart(&mut self, deadline: Option<Instant>);
}

/// A registered deferred (run-as-soon-as-possible) event source.
pub trait DeferEvent {
    fn set_enabled(&mut self, enabled: bool);
}

/// The event loop interface the core is driven by.
///
/// Every "suspension point" in the core is a registration against one of
/// these three primitives; there is no internal blocking or threading.
pub trait Mainloop {
    fn io_new(&self, fd: RawFd, events: IoEventFlags, cb: IoCallback) -> Box<dyn IoEvent>;
    fn time_new(&self, deadline: Option<Instant>, cb: TimeCallback) -> Box<dyn TimeEvent>;
    fn defer_new(&self, cb: DeferCallback) -> Box<dyn DeferEvent>;
}

// ---------------------------------------------------------------------
// Reference implementation, `libc::poll`-based, single-threaded.
// ---------------------------------------------------------------------

struct IoSource {
    fd: RawFd,
    events: RefCell<IoEventFlags>,
    cb: RefCell<IoCallback>,
    dead: RefCell<bool>,
}

struct TimerSource {
    deadline: RefCell<Option<Instant>>,
    cb: RefCell<TimeCallback>,
    dead: RefCell<bool>,
}

struct DeferSource {
    enabled: RefCell<bool>,
    cb: RefCell<DeferCallback>,
    dead: RefCell<bool>,
}

#[derive(Default)]
struct Inner {
    io: Vec<Rc<IoSource>>,
    timers: Vec<Rc<TimerSource>>,
    defers: Vec<Rc<DeferSource>>,
}

/// A minimal `poll(2)`-driven main loop, for use in this crate's own tests
/// and as a starting point for an embedding application with no event loop
/// of its own. Not a substitute for a production loop: no deferred-event
/// starvation protection beyond running all of them once per iteration.
#[derive(Default, Clone)]
pub struct StdMainloop {
    inner: Rc<RefCell<Inner>>,
}

impl StdMainloop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one iteration: fire any enabled deferred events, then block in
    /// `poll` until the earliest timer deadline or an I/O source is ready.
    pub fn iterate(&self) {
        // Deferred events fire at most once per iteration, matching
        // `pa_mainloop_api`'s "run as soon as possible" semantics; a defer
        // that re-enables itself keeps firing on *subsequent* `iterate`
        // calls rather than spinning this one forever.
        let defers: Vec<Rc<DeferSource>> = self.inner.borrow().defers.clone();
        for d in defers.iter() {
            if *d.dead.borrow() || !*d.enabled.borrow() {
                continue;
            }
            (d.cb.borrow_mut())();
        }

        self.inner.borrow_mut().io.retain(|s| !*s.dead.borrow());
        self.inner.borrow_mut().timers.retain(|s| !*s.dead.borrow());
        self.inner.borrow_mut().defers.retain(|s| !*s.dead.borrow());

        let now = Instant::now();
        let next_timer = self
            .inner
            .borrow()
            .timers
            .iter()
            .filter_map(|t| *t.deadline.borrow())
            .min();

        let timeout_ms = match next_timer {
            Some(d) if d > now => (d - now).as_millis().min(i32::MAX as u128) as i32,
            Some(_) => 0,
            None => -1,
        };

        let sources: Vec<Rc<IoSource>> = self.inner.borrow().io.clone();
        let mut pollfds: Vec<libc::pollfd> = sources
            .iter()
            .map(|s| libc::pollfd {
                fd: s.fd,
                events: to_poll_events(*s.events.borrow()),
                revents: 0,
            })
            .collect();

        if !pollfds.is_empty() || timeout_ms >= 0 {
            unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms);
            }
        }

        for (source, pfd) in sources.iter().zip(pollfds.iter()) {
            if *source.dead.borrow() {
                continue;
            }
            let flags = from_poll_events(pfd.revents);
            if !flags.is_empty() {
                (source.cb.borrow_mut())(flags);
            }
        }

        let now = Instant::now();
        for t in self.inner.borrow().timers.iter() {
            if *t.dead.borrow() {
                continue;
            }
            let fire = matches!(*t.deadline.borrow(), Some(d) if d <= now);
            if fire {
                *t.deadline.borrow_mut() = None;
                (t.cb.borrow_mut())();
            }
        }
    }
}

fn to_poll_events(flags: IoEventFlags) -> libc::c_short {
    let mut out = 0;
    if flags.contains(IoEventFlags::INPUT) {
        out |= libc::POLLIN;
    }
    if flags.contains(IoEventFlags::OUTPUT) {
        out |= libc::POLLOUT;
    }
    out as libc::c_short
}

fn from_poll_events(revents: libc::c_short) -> IoEventFlags {
    let revents = revents as i32;
    let mut out = IoEventFlags::NULL;
    if revents & libc::POLLIN != 0 {
        out |= IoEventFlags::INPUT;
    }
    if revents & libc::POLLOUT != 0 {
        out |= IoEventFlags::OUTPUT;
    }
    if revents & libc::POLLHUP != 0 {
        out |= IoEventFlags::HANGUP;
    }
    if revents & libc::POLLERR != 0 {
        out |= IoEventFlags::ERROR;
    }
    out
}

struct IoHandle(Rc<IoSource>);
impl IoEvent for IoHandle {
    fn set_enabled(&mut self, events: IoEventFlags) {
        *self.0.events.borrow_mut() = events;
    }
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        *self.0.dead.borrow_mut() = true;
    }
}

struct TimerHandle(Rc<TimerSource>);
impl TimeEvent for TimerHandle {
    fn restart(&mut self, deadline: Option<Instant>) {
        *self.0.deadline.borrow_mut() = deadline;
    }
}
impl Drop for TimerHandle {
    fn drop(&mut self) {
        *self.0.dead.borrow_mut() = true;
    }
}

struct DeferHandle(Rc<DeferSource>);
impl DeferEvent for DeferHandle {
    fn set_enabled(&mut self, enabled: bool) {
        *self.0.enabled.borrow_mut() = enabled;
    }
}
impl Drop for DeferHandle {
    fn drop(&mut self) {
        *self.0.dead.borrow_mut() = true;
    }
}

impl Mainloop for StdMainloop {
    fn io_new(&self, fd: RawFd, events: IoEventFlags, cb: IoCallback) -> Box<dyn IoEvent> {
        let source = Rc::new(IoSource {
            fd,
            events: RefCell::new(events),
            cb: RefCell::new(cb),
            dead: RefCell::new(false),
        });
        self.inner.borrow_mut().io.push(source.clone());
        Box::new(IoHandle(source))
    }

    fn time_new(&self, deadline: Option<Instant>, cb: TimeCallback) -> Box<dyn TimeEvent> {
        let source = Rc::new(TimerSource {
            deadline: RefCell::new(deadline),
            cb: RefCell::new(cb),
            dead: RefCell::new(false),
        });
        self.inner.borrow_mut().timers.push(source.clone());
        Box::new(TimerHandle(source))
    }

    fn defer_new(&self, cb: DeferCallback) -> Box<dyn DeferEvent> {
        let source = Rc::new(DeferSource {
            enabled: RefCell::new(true),
            cb: RefCell::new(cb),
            dead: RefCell::new(false),
        });
        self.inner.borrow_mut().defers.push(source.clone());
        Box::new(DeferHandle(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    #[test]
    fn defer_event_runs_on_iterate_and_can_be_disabled() {
        let ml = StdMainloop::new();
        let calls = StdRc::new(Cell::new(0));
        let calls_cb = calls.clone();
        let mut defer = ml.defer_new(Box::new(move || calls_cb.set(calls_cb.get() + 1)));
        ml.iterate();
        // A still-enabled defer re-fires every iteration until disabled.
        assert!(calls.get() >= 1);
        defer.set_enabled(false);
        let before = calls.get();
        ml.iterate();
        assert_eq!(calls.get(), before);
    }

    #[test]
    fn timer_fires_once_past_deadline() {
        let ml = StdMainloop::new();
        let fired = Rc::new(Cell::new(false));
        let fired_cb = fired.clone();
        let _timer = ml.time_new(Some(Instant::now()), Box::new(move || fired_cb.set(true)));
        ml.iterate();
        assert!(fired.get());
    }
}
