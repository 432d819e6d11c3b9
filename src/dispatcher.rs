//! Tag dispatcher (§4.5): routes inbound packets by tag (replies) or by
//! command (everything else), with per-tag timeouts and drain tracking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::mainloop::{Mainloop, TimeEvent};
use crate::proto::Command;
use crate::tagstruct::TagStructReader;

/// What a registered reply continuation is told happened.
pub enum ReplyOutcome<'a> {
    /// An empty-tail or data-bearing `REPLY`.
    Reply(TagStructReader<'a>),
    /// An `ERROR` reply; the wire error code, not yet normalized.
    Error(u32),
    /// The per-call timeout elapsed with no reply (synthesized `TIMEOUT`).
    Timeout,
}

pub type ReplyContinuation = Box<dyn FnOnce(ReplyOutcome)>;
pub type FreeHook = Box<dyn FnOnce()>;

/// A fixed-table command handler. Returns `Err(())` on protocol violation
/// (§4.4 "if dispatch reports protocol violation, fail the context").
pub type CommandHandler = Box<dyn FnMut(u32, TagStructReader) -> Result<(), ()>>;

struct PendingReply {
    cb: Option<ReplyContinuation>,
    free_hook: Option<FreeHook>,
    _timer: Box<dyn TimeEvent>,
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(hook) = self.free_hook.take() {
            hook();
        }
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<u32, PendingReply>,
    handlers: HashMap<u32, CommandHandler>,
    drain_cb: Option<Box<dyn FnOnce()>>,
}

/// The tag multiplexer. One dispatcher exists for exactly as long as its
/// paired transport (§3 invariant).
pub struct Dispatcher {
    mainloop: Rc<dyn Mainloop>,
    inner: RefCell<Inner>,
    self_weak: RefCell<Weak<Dispatcher>>,
}

impl Dispatcher {
    /// Dispatchers are always reached through an `Rc` so a per-tag timeout
    /// can hold a `Weak` back-reference to fire into `fire_timeout` without
    /// keeping the dispatcher alive past its own teardown.
    pub fn new(mainloop: Rc<dyn Mainloop>) -> Rc<Self> {
        let this = Rc::new(Self {
            mainloop,
            inner: RefCell::new(Inner::default()),
            self_weak: RefCell::new(Weak::new()),
        });
        *this.self_weak.borrow_mut() = Rc::downgrade(&this);
        this
    }

    /// Install (or replace) the fixed handler for a non-reply command.
    pub fn set_command_handler(&self, command: Command, handler: CommandHandler) {
        self.inner.borrow_mut().handlers.insert(command as u32, handler);
    }

    /// Register a pending reply for `tag`, armed with a `timeout`. `free_hook`
    /// runs exactly once, however the entry leaves the table (reply, error,
    /// timeout, or teardown via `cancel_all`).
    pub fn register(&self, tag: u32, timeout: Duration, cb: ReplyContinuation, free_hook: FreeHook) {
        let deadline = Instant::now() + timeout;
        let timer_tag = tag;
        let weak = self.self_weak.borrow().clone();
        let timer = self.mainloop.time_new(
            Some(deadline),
            Box::new(move || {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.fire_timeout(timer_tag);
                }
            }),
        );
        self.inner.borrow_mut().pending.insert(
            tag,
            PendingReply { cb: Some(cb), free_hook: Some(free_hook), _timer: timer },
        );
    }

    fn fire_timeout(&self, tag: u32) {
        if let Some(mut entry) = self.inner.borrow_mut().pending.remove(&tag) {
            if let Some(cb) = entry.cb.take() {
                cb(ReplyOutcome::Timeout);
            }
            drop(entry);
            self.maybe_fire_drain();
        }
    }

    /// Route one inbound packet. `command` is the raw wire command id.
    pub fn dispatch(&self, command: u32, tag: u32, body: &[u8]) -> Result<(), ()> {
        if command == Command::Reply as u32 || command == Command::Error as u32 || command == Command::Timeout as u32
        {
            let entry = self.inner.borrow_mut().pending.remove(&tag);
            let mut entry = match entry {
                Some(e) => e,
                None => return Ok(()), // stale/duplicate reply, ignore
            };
            if let Some(cb) = entry.cb.take() {
                let outcome = if command == Command::Error as u32 {
                    let mut reader = TagStructReader::new(body);
                    let code = reader.get_u32().map_err(|_| ())?;
                    ReplyOutcome::Error(code)
                } else {
                    ReplyOutcome::Reply(TagStructReader::new(body))
                };
                cb(outcome);
            }
            drop(entry);
            self.maybe_fire_drain();
            return Ok(());
        }

        let mut inner = self.inner.borrow_mut();
        match inner.handlers.get_mut(&command) {
            Some(handler) => handler(tag, TagStructReader::new(body)),
            None => Err(()),
        }
    }

    /// True while any tag is outstanding (§4.5 "Drain").
    pub fn is_pending(&self) -> bool {
        !self.inner.borrow().pending.is_empty()
    }

    /// Arm a one-shot callback that fires the next time `is_pending()`
    /// becomes false, then self-clears. If already not pending, fires
    /// immediately (inline, before returning).
    pub fn set_drain_callback(&self, cb: Box<dyn FnOnce()>) {
        if !self.is_pending() {
            cb();
            return;
        }
        self.inner.borrow_mut().drain_cb = Some(cb);
    }

    fn maybe_fire_drain(&self) {
        if self.is_pending() {
            return;
        }
        if let Some(cb) = self.inner.borrow_mut().drain_cb.take() {
            cb();
        }
    }

    /// Cancel every outstanding reply without invoking user callbacks
    /// (§5 "Cancellation" — `disconnect()`/teardown path). Free-hooks still
    /// run via `PendingReply`'s `Drop`.
    pub fn cancel_all(&self) {
        self.inner.borrow_mut().pending.clear();
        self.inner.borrow_mut().drain_cb = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::StdMainloop;
    use std::cell::Cell;

    fn mainloop() -> Rc<dyn Mainloop> {
        Rc::new(StdMainloop::new())
    }

    #[test]
    fn reply_dispatches_to_registered_continuation_and_removes_entry() {
        let d = Dispatcher::new(mainloop());
        let got_reply = Rc::new(Cell::new(false));
        let got_reply_cb = got_reply.clone();
        d.register(
            1,
            Duration::from_secs(5),
            Box::new(move |outcome| {
                assert!(matches!(outcome, ReplyOutcome::Reply(_)));
                got_reply_cb.set(true);
            }),
            Box::new(|| {}),
        );
        assert!(d.is_pending());
        d.dispatch(Command::Reply as u32, 1, &[]).unwrap();
        assert!(got_reply.get());
        assert!(!d.is_pending());
    }

    #[test]
    fn unknown_command_is_a_protocol_violation() {
        let d = Dispatcher::new(mainloop());
        assert!(d.dispatch(9999, 0, &[]).is_err());
    }

    #[test]
    fn drain_fires_once_pending_reaches_zero() {
        let d = Dispatcher::new(mainloop());
        d.register(1, Duration::from_secs(5), Box::new(|_| {}), Box::new(|| {}));
        d.register(2, Duration::from_secs(5), Box::new(|_| {}), Box::new(|| {}));

        let fired = Rc::new(Cell::new(0));
        let fired_cb = fired.clone();
        d.set_drain_callback(Box::new(move || fired_cb.set(fired_cb.get() + 1)));

        d.dispatch(Command::Reply as u32, 1, &[]).unwrap();
        assert_eq!(fired.get(), 0);
        d.dispatch(Command::Reply as u32, 2, &[]).unwrap();
        assert_eq!(fired.get(), 1);

        // Drain self-clears: a further completion does not refire it.
        d.register(3, Duration::from_secs(5), Box::new(|_| {}), Box::new(|| {}));
        d.dispatch(Command::Reply as u32, 3, &[]).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn drain_with_nothing_pending_fires_immediately() {
        let d = Dispatcher::new(mainloop());
        let fired = Rc::new(Cell::new(false));
        let fired_cb = fired.clone();
        d.set_drain_callback(Box::new(move || fired_cb.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn free_hook_runs_exactly_once_on_reply() {
        let d = Dispatcher::new(mainloop());
        let hook_runs = Rc::new(Cell::new(0));
        let hook_runs_cb = hook_runs.clone();
        d.register(
            1,
            Duration::from_secs(5),
            Box::new(|_| {}),
            Box::new(move || hook_runs_cb.set(hook_runs_cb.get() + 1)),
        );
        d.dispatch(Command::Reply as u32, 1, &[]).unwrap();
        assert_eq!(hook_runs.get(), 1);
    }

    #[test]
    fn free_hook_runs_on_cancel_all_without_invoking_user_callback() {
        let d = Dispatcher::new(mainloop());
        let user_cb_ran = Rc::new(Cell::new(false));
        let user_cb_ran_cb = user_cb_ran.clone();
        let hook_ran = Rc::new(Cell::new(false));
        let hook_ran_cb = hook_ran.clone();
        d.register(
            1,
            Duration::from_secs(5),
            Box::new(move |_| user_cb_ran_cb.set(true)),
            Box::new(move || hook_ran_cb.set(true)),
        );
        d.cancel_all();
        assert!(!user_cb_ran.get());
        assert!(hook_ran.get());
    }
}
