//! Connection contexts for asynchronous communication with a local audio
//! server.
//!
//! A [`Context`] multiplexes the candidate-endpoint list builder (§4.1), the
//! socket dialer (§4.2), the autospawner (§4.3), the protocol transport and
//! tag dispatcher (§4.4/§4.5), and the authentication handshake (§4.6) behind
//! the single state machine described by [`State`].
//!
//! # Reference counting
//!
//! [`Context`] is a thin handle around `Rc<RefCell<ContextInner>>`; cloning a
//! `Context` shares the same connection, mirroring the teacher's
//! `pa_context_ref`/`unref` discipline without a manual refcount.
//!
//! # Connecting
//!
//! [`Context::connect`] kicks off the candidate cascade and returns
//! immediately; progress is reported exclusively through the callback
//! installed with [`Context::set_state_callback`]. There is no blocking
//! "wait for ready" call — the embedding application's main loop drives
//! everything (§5).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::config::Config;
use crate::creds::{local_credentials, peer_credentials};
use crate::def::{self, Usecs};
use crate::dialer::{Channel, DialOutcome, Dialer};
use crate::dispatcher::{Dispatcher, ReplyOutcome};
use crate::endpoint::{self, Endpoint};
use crate::error::ErrorCode;
use crate::mainloop::Mainloop;
use crate::memblock::{HeapPool, Memblock, MemblockPool};
use crate::memblockq::SeekMode;
use crate::operation::Operation;
use crate::presence::{NullPresenceWatcher, PresenceWatcher};
use crate::proplist::{Proplist, UpdateMode};
use crate::proto::Command;
use crate::pstream::Pstream;
use crate::sample::Spec;
use crate::spawn::{self, SpawnHooks};
use crate::stream::{PlaybackStream, RecordStream};
use crate::tagstruct::{TagStructReader, TagStructWriter};

bitflags! {
    /// Per-call connect flags (§4.1/§4.6).
    pub struct ConnectFlags: u32 {
        const NOAUTOSPAWN = 0x01;
        const NOFAIL = 0x02;
    }
}

/// The context's state (§4.6 transition table). `Failed`/`Terminated` are
/// terminal: no further transitions occur once either is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

impl State {
    pub fn is_good(self) -> bool {
        !matches!(self, State::Failed | State::Terminated)
    }
}

struct ContextInner {
    state: State,
    last_error: ErrorCode,
    mainloop: Rc<dyn Mainloop>,
    config: Config,
    proplist: Proplist,
    presence_watcher: Rc<dyn PresenceWatcher>,
    spawn_hooks: Option<SpawnHooks>,
    pool: Rc<dyn MemblockPool>,

    tag_counter: u32,
    server_version: Option<u32>,
    do_shm: bool,
    is_local: bool,
    client_index: Option<u32>,
    current_server: Option<String>,

    candidates: Vec<Endpoint>,
    no_fail: bool,
    autospawn_allowed_for_call: bool,
    autospawn_attempted: bool,
    last_dial_errno: Option<i32>,

    dialer: Option<Dialer>,
    pstream: Option<Rc<Pstream>>,
    dispatcher: Option<Rc<Dispatcher>>,

    next_channel: u32,
    playback_streams: HashMap<u32, PlaybackStream>,
    record_streams: HashMap<u32, RecordStream>,

    /// Every still-live `Operation` this context has handed out (§3 data
    /// model "an ordered list of live operations"); drained and cancelled on
    /// teardown (§5 "Cancellation"). Entries that already completed are
    /// pruned lazily rather than removed eagerly, since an `Operation` is
    /// cheap and `cancel()` on an already-`Done` one is a no-op.
    operations: Vec<Operation>,

    state_cb: Option<Box<dyn FnMut(State)>>,
    event_cb: Option<Box<dyn FnMut(&str, &Proplist)>>,
    subscribe_cb: Option<Box<dyn FnMut(u32, u32)>>,
    stream_restore_cb: Option<Box<dyn FnMut(u32, &[u8])>>,
    device_manager_cb: Option<Box<dyn FnMut(u32, &[u8])>>,

    created_pid: libc::pid_t,
    self_weak: Weak<RefCell<ContextInner>>,
}

type Handle = Rc<RefCell<ContextInner>>;

/// A connection to a local audio server (§3 "Data model").
#[derive(Clone)]
pub struct Context {
    inner: Handle,
}

static SIGPIPE_BLOCKED: std::sync::Once = std::sync::Once::new();

fn block_sigpipe_once() {
    SIGPIPE_BLOCKED.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

impl Context {
    pub fn new(mainloop: Rc<dyn Mainloop>, config: Config) -> Self {
        Self::new_with_proplist(mainloop, config, Proplist::new())
    }

    pub fn new_with_proplist(mainloop: Rc<dyn Mainloop>, config: Config, proplist: Proplist) -> Self {
        block_sigpipe_once();
        let inner = Rc::new(RefCell::new(ContextInner {
            state: State::Unconnected,
            last_error: ErrorCode::Ok,
            mainloop,
            config,
            proplist,
            presence_watcher: Rc::new(NullPresenceWatcher),
            spawn_hooks: None,
            pool: Rc::new(HeapPool::default()),
            tag_counter: 0,
            server_version: None,
            do_shm: false,
            is_local: false,
            client_index: None,
            current_server: None,
            candidates: Vec::new(),
            no_fail: false,
            autospawn_allowed_for_call: false,
            autospawn_attempted: false,
            last_dial_errno: None,
            dialer: None,
            pstream: None,
            dispatcher: None,
            next_channel: 0,
            playback_streams: HashMap::new(),
            record_streams: HashMap::new(),
            operations: Vec::new(),
            state_cb: None,
            event_cb: None,
            subscribe_cb: None,
            stream_restore_cb: None,
            device_manager_cb: None,
            created_pid: unsafe { libc::getpid() },
            self_weak: Weak::new(),
        }));
        inner.borrow_mut().self_weak = Rc::downgrade(&inner);
        Context { inner }
    }

    /// Install a watcher used for the `NOFAIL` "subscribe to bus and stay"
    /// path (§4.6). Must be set before [`Context::connect`].
    pub fn set_presence_watcher(&self, watcher: Rc<dyn PresenceWatcher>) {
        self.inner.borrow_mut().presence_watcher = watcher;
    }

    pub fn set_spawn_hooks(&self, hooks: SpawnHooks) {
        self.inner.borrow_mut().spawn_hooks = Some(hooks);
    }

    /// Install the memory-block pool shm eligibility is checked against (§3
    /// invariant "do_shm"). Defaults to a pool reporting no shm support, so a
    /// context that never calls this never attempts shared memory. Must be
    /// set before [`Context::connect`] to take effect on that connection.
    pub fn set_memblock_pool(&self, pool: Rc<dyn MemblockPool>) {
        self.inner.borrow_mut().pool = pool;
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn last_error(&self) -> ErrorCode {
        self.inner.borrow().last_error
    }

    pub fn is_pending(&self) -> bool {
        let inner = self.inner.borrow();
        inner.dispatcher.as_ref().map_or(false, |d| d.is_pending())
            || inner.pstream.as_ref().map_or(false, |p| p.is_pending())
    }

    /// The protocol version this client implements (§6.1 `get_protocol_version`).
    /// Constant for the lifetime of the process; contrast with
    /// [`Context::server_protocol_version`], the version actually negotiated
    /// with the connected peer.
    pub fn protocol_version(&self) -> u32 {
        def::PROTOCOL_VERSION
    }

    /// The negotiated protocol version (§6.1 `get_server_protocol_version`):
    /// `min(our version, server's version)`, valid from `Authorizing` onward.
    pub fn server_protocol_version(&self) -> Option<u32> {
        self.inner.borrow().server_version
    }

    /// Whether shared-memory transfer was negotiated on this link (§3
    /// invariant "do_shm"). Only ever true once `Ready`.
    pub fn is_shm_enabled(&self) -> bool {
        self.inner.borrow().do_shm
    }

    pub fn is_local(&self) -> Option<bool> {
        let inner = self.inner.borrow();
        if inner.pstream.is_some() {
            Some(inner.is_local)
        } else {
            None
        }
    }

    pub fn get_server(&self) -> Option<String> {
        self.inner.borrow().current_server.clone()
    }

    pub fn client_index(&self) -> Option<u32> {
        self.inner.borrow().client_index
    }

    pub fn set_state_callback(&self, cb: Box<dyn FnMut(State)>) {
        self.inner.borrow_mut().state_cb = Some(cb);
    }

    pub fn set_event_callback(&self, cb: Box<dyn FnMut(&str, &Proplist)>) {
        self.inner.borrow_mut().event_cb = Some(cb);
    }

    pub fn set_subscribe_callback(&self, cb: Box<dyn FnMut(u32, u32)>) {
        self.inner.borrow_mut().subscribe_cb = Some(cb);
    }

    /// Register the callback for `EXTENSION` messages from
    /// `"module-stream-restore"` (§6.2, §4.7 two named extensions).
    pub fn set_stream_restore_callback(&self, cb: Box<dyn FnMut(u32, &[u8])>) {
        self.inner.borrow_mut().stream_restore_cb = Some(cb);
    }

    /// Register the callback for `EXTENSION` messages from
    /// `"module-device-manager"` (§6.2, §4.7 two named extensions).
    pub fn set_device_manager_callback(&self, cb: Box<dyn FnMut(u32, &[u8])>) {
        self.inner.borrow_mut().device_manager_cb = Some(cb);
    }

    /// Start connecting (§4.6). Returns `BadState` if not currently
    /// `Unconnected`, and `Forked` if this process is not the one that
    /// created the context (§5).
    pub fn connect(&self, server: Option<&str>, flags: ConnectFlags) -> Result<(), ErrorCode> {
        if let Err(e) = check_fork(&self.inner) {
            return Err(e);
        }
        {
            let inner = self.inner.borrow();
            if inner.state != State::Unconnected {
                return Err(ErrorCode::BadState);
            }
        }

        let (candidates, autospawn_allowed_for_call, no_fail) = {
            let inner = self.inner.borrow();
            let candidates = endpoint::build_candidates(server, &inner.config);
            // §4.3(c): autospawn is never attempted for a uid-0 caller.
            let autospawn_allowed_for_call = server.is_none()
                && inner.config.autospawn_allowed
                && !flags.contains(ConnectFlags::NOAUTOSPAWN)
                && unsafe { libc::getuid() } != 0;
            (candidates, autospawn_allowed_for_call, flags.contains(ConnectFlags::NOFAIL))
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.candidates = candidates;
            inner.autospawn_allowed_for_call = autospawn_allowed_for_call;
            inner.no_fail = no_fail;
            inner.autospawn_attempted = false;
        }

        set_state(&self.inner, State::Connecting);
        try_next_candidate(&self.inner);
        Ok(())
    }

    /// Tear the connection down immediately; always succeeds, always
    /// transitions to `Terminated` (§4.6 "Disconnecting").
    pub fn disconnect(&self) {
        teardown(&self.inner, State::Terminated, ErrorCode::Ok);
    }

    /// Fetch the tile size (max single block, rounded down to a whole frame)
    /// applications should chunk writes/reads to.
    pub fn get_tile_size(&self, spec: &Spec, pool_max_block_size: usize) -> usize {
        let frame = spec.frame_size().max(1);
        ((pool_max_block_size / frame) * frame).max(frame)
    }

    /// Register a one-shot timer (§6.1 `rttime_new`); the returned handle
    /// has no further relationship to the context once created.
    pub fn rttime_new(&self, deadline: Option<Instant>, cb: Box<dyn FnMut()>) -> Box<dyn crate::mainloop::TimeEvent> {
        self.inner.borrow().mainloop.time_new(deadline, cb)
    }

    /// `proplist_update(mode, plist, cb)` (§6.1). Available on protocol ≥ 13
    /// (the only version that speaks `UPDATE_CLIENT_PROPLIST` at all).
    pub fn proplist_update(
        &self,
        mode: UpdateMode,
        update: &Proplist,
        cb: Box<dyn FnOnce(bool)>,
    ) -> Result<Operation, ErrorCode> {
        if !self.supports_named_client() {
            return Err(ErrorCode::NotSupported);
        }
        let mut body = TagStructWriter::new();
        body.put_u32(mode as u32).put_proplist(update);
        self.inner.borrow_mut().proplist.update(mode, update);
        self.send_simple_call(Command::UpdateClientProplist, &body, cb)
    }

    pub fn proplist_remove(&self, keys: &[&str], cb: Box<dyn FnOnce(bool)>) -> Result<Operation, ErrorCode> {
        if !self.supports_named_client() {
            return Err(ErrorCode::NotSupported);
        }
        let mut body = TagStructWriter::new();
        for k in keys {
            body.put_string(Some(k));
        }
        body.put_string(None);
        for k in keys {
            self.inner.borrow_mut().proplist.remove(k);
        }
        self.send_simple_call(Command::RemoveClientProplist, &body, cb)
    }

    pub fn set_default_sink(&self, name: &str, cb: Box<dyn FnOnce(bool)>) -> Result<Operation, ErrorCode> {
        let mut body = TagStructWriter::new();
        body.put_string(Some(name));
        self.send_simple_call(Command::SetDefaultSink, &body, cb)
    }

    pub fn set_default_source(&self, name: &str, cb: Box<dyn FnOnce(bool)>) -> Result<Operation, ErrorCode> {
        let mut body = TagStructWriter::new();
        body.put_string(Some(name));
        self.send_simple_call(Command::SetDefaultSource, &body, cb)
    }

    pub fn exit_daemon(&self, cb: Box<dyn FnOnce(bool)>) -> Result<Operation, ErrorCode> {
        self.send_simple_call(Command::Exit, &TagStructWriter::new(), cb)
    }

    /// `set_name(ctx, name, cb)` (§6.1): a proplist update on protocol ≥ 13,
    /// the legacy bare-name `SET_CLIENT_NAME` otherwise. Only meaningful
    /// post-handshake; the initial name is always sent by `connect()` itself.
    pub fn set_name(&self, name: &str, cb: Box<dyn FnOnce(bool)>) -> Result<Operation, ErrorCode> {
        if self.supports_named_client() {
            let mut plist = Proplist::new();
            plist.set_str("application.name", name);
            self.proplist_update(UpdateMode::Merge, &plist, cb)
        } else {
            let mut body = TagStructWriter::new();
            body.put_string(Some(name));
            self.send_simple_call(Command::SetClientName, &body, cb)
        }
    }

    fn supports_named_client(&self) -> bool {
        self.inner
            .borrow()
            .server_version
            .map_or(false, |v| v >= def::PROTOCOL_VERSION_NAMED_CLIENT)
    }

    /// Wait for every outstanding call to complete (§4.5 "Drain"). Valid
    /// only in `Ready` and only while `is_pending()` is true (§4.7, §8
    /// "Drain soundness").
    pub fn drain(&self, cb: Box<dyn FnOnce()>) -> Result<Operation, ErrorCode> {
        if self.inner.borrow().state != State::Ready || !self.is_pending() {
            return Err(ErrorCode::BadState);
        }

        let op = Operation::new(Box::new(|| {}));
        self.inner.borrow_mut().operations.push(op.clone());
        let op_for_cb = op.clone();
        let dispatcher = self.inner.borrow().dispatcher.clone();
        let pstream = self.inner.borrow().pstream.clone();

        // Both the dispatcher (replies) and the pstream (unflushed sends)
        // must individually report drained before the caller's callback
        // fires; chain through a small shared counter.
        let remaining = Rc::new(std::cell::Cell::new(0u8));
        if dispatcher.as_ref().map_or(false, |d| d.is_pending()) {
            remaining.set(remaining.get() + 1);
        }
        if pstream.as_ref().map_or(false, |p| p.is_pending()) {
            remaining.set(remaining.get() + 1);
        }

        let cb = Rc::new(RefCell::new(Some(cb)));
        let weak = Rc::downgrade(&self.inner);
        let fire = {
            let cb = cb.clone();
            let remaining = remaining.clone();
            let op_for_cb = op_for_cb.clone();
            move || {
                let left = remaining.get().saturating_sub(1);
                remaining.set(left);
                if left == 0 {
                    if let Some(cb) = cb.borrow_mut().take() {
                        cb();
                    }
                    op_for_cb.complete();
                    if let Some(handle) = weak.upgrade() {
                        prune_completed_operations(&handle);
                    }
                }
            }
        };

        if let Some(d) = dispatcher.as_ref() {
            if d.is_pending() {
                let fire = fire.clone();
                d.set_drain_callback(Box::new(move || fire()));
            }
        }
        if let Some(p) = pstream.as_ref() {
            if p.is_pending() {
                let fire = fire.clone();
                p.set_drain_callback(Box::new(move || fire()));
            }
        }

        Ok(op)
    }

    /// A request/ack helper (§4.7 "Simple request/ack helpers"): on a
    /// `REPLY` with an empty tail, reports success; on `ERROR`, records the
    /// extracted code as `last_error` and reports failure; any other command
    /// routed here or a non-empty reply tail is a protocol violation that
    /// fails the whole context, matching §4.7's "malformed tail" clause.
    fn send_simple_call(&self, command: Command, body: &TagStructWriter, cb: Box<dyn FnOnce(bool)>) -> Result<Operation, ErrorCode> {
        if self.inner.borrow().state != State::Ready {
            return Err(ErrorCode::BadState);
        }
        let (tag, dispatcher) = {
            let mut inner = self.inner.borrow_mut();
            let tag = next_tag(&mut inner);
            (tag, inner.dispatcher.clone().expect("Ready implies a dispatcher"))
        };
        self.send_packet_with_header(command, tag, body);

        let op = Operation::new(Box::new(|| {}));
        self.inner.borrow_mut().operations.push(op.clone());
        let op_cancel = op.clone();
        let weak = Rc::downgrade(&self.inner);
        let cb = RefCell::new(Some(cb));
        dispatcher.register(
            tag,
            Duration::from_micros(def::DEFAULT_TIMEOUT_USEC),
            Box::new(move |outcome| {
                let cancelled = op_cancel.state() != crate::operation::OperationState::Running;
                let success = match outcome {
                    ReplyOutcome::Reply(reader) => {
                        if !reader.is_empty() {
                            if let Some(handle) = weak.upgrade() {
                                teardown(&handle, State::Failed, ErrorCode::Protocol);
                            }
                            false
                        } else {
                            true
                        }
                    }
                    ReplyOutcome::Error(code) => {
                        if let Some(handle) = weak.upgrade() {
                            handle.borrow_mut().last_error = ErrorCode::from_wire(code);
                        }
                        false
                    }
                    ReplyOutcome::Timeout => {
                        if let Some(handle) = weak.upgrade() {
                            handle.borrow_mut().last_error = ErrorCode::Timeout;
                        }
                        false
                    }
                };
                if !cancelled {
                    if let Some(cb) = cb.borrow_mut().take() {
                        cb(success);
                    }
                }
                op_cancel.complete();
                if let Some(handle) = weak.upgrade() {
                    prune_completed_operations(&handle);
                }
            }),
            Box::new(|| {}),
        );
        Ok(op)
    }

    fn send_packet_with_header(&self, command: Command, tag: u32, body: &TagStructWriter) {
        let pstream = self.inner.borrow().pstream.clone();
        if let Some(p) = pstream {
            p.send_packet(command as u32, tag, body, None);
        }
    }
}

/// Drop finished entries from the live-operations list (§3 data model); an
/// `Operation` itself stays alive as long as the caller holds a clone, this
/// only stops the context from pinning it forever.
fn prune_completed_operations(handle: &Handle) {
    handle
        .borrow_mut()
        .operations
        .retain(|op| op.state() == crate::operation::OperationState::Running);
}

fn next_tag(inner: &mut ContextInner) -> u32 {
    let tag = inner.tag_counter;
    inner.tag_counter = inner.tag_counter.wrapping_add(1);
    tag
}

fn check_fork(handle: &Handle) -> Result<(), ErrorCode> {
    let created_pid = handle.borrow().created_pid;
    if unsafe { libc::getpid() } != created_pid {
        set_state(handle, State::Failed);
        handle.borrow_mut().last_error = ErrorCode::Forked;
        return Err(ErrorCode::Forked);
    }
    Ok(())
}

/// Update `state` and fire the registered callback, if any, without holding
/// the context's own borrow while the callback runs (the callback may
/// legally call back into the context, e.g. to query `state()`).
fn set_state(handle: &Handle, new_state: State) {
    handle.borrow_mut().state = new_state;
    let cb = handle.borrow_mut().state_cb.take();
    if let Some(mut cb) = cb {
        cb(new_state);
        let mut inner = handle.borrow_mut();
        if inner.state_cb.is_none() {
            inner.state_cb = Some(cb);
        }
    }
}

fn fire_event(handle: &Handle, name: &str, props: &Proplist) {
    let cb = handle.borrow_mut().event_cb.take();
    if let Some(mut cb) = cb {
        cb(name, props);
        let mut inner = handle.borrow_mut();
        if inner.event_cb.is_none() {
            inner.event_cb = Some(cb);
        }
    }
}

/// Tear down any live dialer/pstream/dispatcher/watcher subscription and
/// move to a terminal state. Idempotent: a context already in a terminal
/// state is left alone.
///
/// §4.6 line 121: "Terminal-state entry additionally triggers teardown
/// *after* the callback returns." The state callback fires first, while the
/// context is still fully alive (transport, dispatcher, streams, operations
/// all intact), and only once it returns do we dismantle everything.
fn teardown(handle: &Handle, terminal: State, error: ErrorCode) {
    {
        let inner = handle.borrow();
        if !inner.state.is_good() {
            return;
        }
    }
    handle.borrow_mut().last_error = error;
    set_state(handle, terminal);

    let watcher = {
        let mut inner = handle.borrow_mut();
        // §3 invariant: streams and operations are transitioned to the same
        // terminal state as the context, before the transport/dispatcher are
        // released.
        for stream in inner.playback_streams.values_mut() {
            match terminal {
                State::Terminated => stream.terminate(),
                _ => stream.fail(),
            }
        }
        for stream in inner.record_streams.values_mut() {
            match terminal {
                State::Terminated => stream.terminate(),
                _ => stream.fail(),
            }
        }
        inner.dialer = None;
        inner.pstream = None;
        if let Some(d) = inner.dispatcher.take() {
            d.cancel_all();
        }
        // §5 "Cancellation": every still-live operation is cancelled without
        // its user callback firing (the dispatcher already dropped their
        // reply continuations above via `cancel_all`; this just flips each
        // operation's own visible state).
        for op in inner.operations.drain(..) {
            op.cancel();
        }
        inner.presence_watcher.clone()
    };
    watcher.unsubscribe();
}

fn try_next_candidate(handle: &Handle) {
    // `candidates` is ordered highest-priority-first (§4.1); consume from the
    // front so the cascade tries them in that order, not `Vec::pop`'s
    // back-to-front order.
    let next = {
        let mut inner = handle.borrow_mut();
        if inner.candidates.is_empty() {
            None
        } else {
            Some(inner.candidates.remove(0))
        }
    };
    let candidate = match next {
        Some(c) => c,
        None => {
            handle_candidates_exhausted(handle);
            return;
        }
    };

    let mainloop = handle.borrow().mainloop.clone();
    let weak = handle.borrow().self_weak.clone();
    let candidate_display = candidate.display();
    let dialer = Dialer::start(
        mainloop.as_ref(),
        &candidate,
        Box::new(move |outcome| {
            let handle = match weak.upgrade() {
                Some(h) => h,
                None => return,
            };
            match outcome {
                DialOutcome::Connected { channel, is_local } => {
                    handle.borrow_mut().current_server = Some(candidate_display.clone());
                    on_connected(&handle, channel, is_local);
                }
                DialOutcome::Failed { errno } => {
                    handle.borrow_mut().last_dial_errno = Some(errno);
                    tracing::debug!(errno, candidate = %candidate_display, "dial attempt failed");
                    if crate::dialer::is_retryable(errno) {
                        try_next_candidate(&handle);
                    } else {
                        fail_or_wait(&handle, ErrorCode::ConnectionRefused);
                    }
                }
            }
        }),
    );
    handle.borrow_mut().dialer = Some(dialer);
}

fn handle_candidates_exhausted(handle: &Handle) {
    let should_spawn = {
        let inner = handle.borrow();
        inner.autospawn_allowed_for_call && !inner.autospawn_attempted
    };

    if should_spawn {
        handle.borrow_mut().autospawn_attempted = true;
        let config = handle.borrow().config.clone();
        // `SpawnHooks` holds `Box<dyn Fn()>`s, not `Clone`; pass by
        // reference for the duration of the synchronous fork/exec/waitpid
        // call rather than moving it out of the context.
        let result = {
            let inner = handle.borrow();
            spawn::autospawn(&config, inner.spawn_hooks.as_ref(), 2)
        };
        match result {
            Ok(()) => {
                let mut inner = handle.borrow_mut();
                endpoint::reprepend_after_spawn(&mut inner.candidates, &inner.config);
                drop(inner);
                try_next_candidate(handle);
            }
            Err(e) => fail_or_wait(handle, e),
        }
        return;
    }

    fail_or_wait(handle, ErrorCode::ConnectionRefused);
}

fn fail_or_wait(handle: &Handle, error: ErrorCode) {
    let no_fail = handle.borrow().no_fail;
    if no_fail {
        let (watcher, bus_name, weak) = {
            let inner = handle.borrow();
            (inner.presence_watcher.clone(), inner.config.daemon_bus_name.clone(), inner.self_weak.clone())
        };
        watcher.subscribe(
            &bus_name,
            Box::new(move || {
                if let Some(handle) = weak.upgrade() {
                    // The daemon appeared; retry from the top of the
                    // candidate list exactly as a fresh `connect()` would.
                    let config = handle.borrow().config.clone();
                    let candidates = endpoint::build_candidates(None, &config);
                    handle.borrow_mut().candidates = candidates;
                    handle.borrow_mut().autospawn_attempted = false;
                    try_next_candidate(&handle);
                }
            }),
        );
        return;
    }
    teardown(handle, State::Failed, error);
}

fn on_connected(handle: &Handle, channel: Channel, is_local: bool) {
    let mainloop = handle.borrow().mainloop.clone();
    let fd = channel.as_raw_fd();
    let pstream = Pstream::new(mainloop.as_ref(), channel);
    let dispatcher = Dispatcher::new(mainloop);

    install_command_handlers(handle, &dispatcher);

    {
        let handle_for_packet = handle.clone();
        let dispatcher_for_packet = dispatcher.clone();
        pstream.set_packet_received_callback(Box::new(move |command, tag, body, _creds| {
            if dispatcher_for_packet.dispatch(command, tag, body).is_err() {
                teardown(&handle_for_packet, State::Failed, ErrorCode::Protocol);
            }
        }));
    }
    {
        let handle_for_block = handle.clone();
        pstream.set_memblock_received_callback(Box::new(move |channel_id, offset, mode, block| {
            route_memblock(&handle_for_block, channel_id, offset, mode, block);
        }));
    }
    {
        let handle_for_death = handle.clone();
        pstream.set_link_died_callback(Box::new(move || {
            teardown(&handle_for_death, State::Failed, ErrorCode::ConnectionTerminated);
        }));
    }

    {
        let mut inner = handle.borrow_mut();
        inner.is_local = is_local;
        inner.pstream = Some(pstream);
        inner.dispatcher = Some(dispatcher);
    }

    set_state(handle, State::Authorizing);
    send_auth(handle, fd);
}

fn send_auth(handle: &Handle, fd: std::os::unix::io::RawFd) {
    let (cookie, advertise_shm) = {
        let inner = handle.borrow();
        let advertise_shm = inner.pool.supports_shared_memory() && inner.is_local;
        if inner.config.cookie.is_none() {
            // §4.6 "Cookie": absence is logged but does not abort the handshake.
            tracing::debug!("no authentication cookie configured, sending AUTH without one");
        }
        (inner.config.cookie.clone().unwrap_or_default(), advertise_shm)
    };
    let version = if advertise_shm { def::PROTOCOL_VERSION | def::VERSION_SHM_BIT } else { def::PROTOCOL_VERSION };
    let mut body = TagStructWriter::new();
    body.put_u32(version).put_bytes(&cookie);

    let (tag, dispatcher, creds_to_send) = {
        let mut inner = handle.borrow_mut();
        let tag = next_tag(&mut inner);
        let creds = if inner.is_local { Some(local_credentials()) } else { None };
        (tag, inner.dispatcher.clone().expect("just created"), creds)
    };

    {
        let pstream = handle.borrow().pstream.clone().expect("just created");
        pstream.send_packet(Command::Auth as u32, tag, &body, creds_to_send);
    }

    let weak = handle.borrow().self_weak.clone();
    dispatcher.register(
        tag,
        Duration::from_micros(def::DEFAULT_TIMEOUT_USEC),
        Box::new(move |outcome| {
            let handle = match weak.upgrade() {
                Some(h) => h,
                None => return,
            };
            match outcome {
                ReplyOutcome::Reply(mut reader) => on_auth_reply(&handle, &mut reader, fd),
                ReplyOutcome::Error(code) => teardown(&handle, State::Failed, ErrorCode::from_wire(code)),
                ReplyOutcome::Timeout => teardown(&handle, State::Failed, ErrorCode::Timeout),
            }
        }),
        Box::new(|| {}),
    );
}

fn on_auth_reply(handle: &Handle, reader: &mut TagStructReader, fd: std::os::unix::io::RawFd) {
    let raw_version = match reader.get_u32() {
        Ok(v) => v,
        Err(_) => {
            teardown(handle, State::Failed, ErrorCode::Protocol);
            return;
        }
    };
    let server_version = raw_version & !def::VERSION_SHM_BIT;
    let server_advertises_shm = raw_version & def::VERSION_SHM_BIT != 0;

    if server_version < ErrorCode::MIN_PROTOCOL_VERSION {
        teardown(handle, State::Failed, ErrorCode::Version);
        return;
    }

    let negotiated = server_version.min(def::PROTOCOL_VERSION);
    let (is_local, pool_supports_shm) = {
        let inner = handle.borrow();
        (inner.is_local, inner.pool.supports_shared_memory())
    };

    // Peer credentials are only consulted when observable; their absence
    // does not itself disable shm (§3 invariant "do_shm" clause (e) is
    // conditioned on credentials being observable at all).
    let peer_creds = if is_local { peer_credentials(fd) } else { None };
    let peer_uid_matches = peer_creds.map_or(true, |p| p.uid == local_credentials().uid);

    // Below version 13 the shm-willingness bit is meaningless and must not
    // gate eligibility; at/above 13 the peer must have set it.
    let peer_advertised_shm = negotiated < def::PROTOCOL_VERSION_NAMED_CLIENT || server_advertises_shm;

    let do_shm = pool_supports_shm
        && is_local
        && negotiated >= def::PROTOCOL_VERSION_MASK_SHM
        && peer_advertised_shm
        && peer_uid_matches;

    {
        let mut inner = handle.borrow_mut();
        inner.server_version = Some(negotiated);
        inner.do_shm = do_shm;
    }
    if do_shm {
        if let Some(p) = handle.borrow().pstream.clone() {
            p.enable_shm();
        }
    }

    set_state(handle, State::SettingName);
    send_set_client_name(handle, negotiated);
}

fn send_set_client_name(handle: &Handle, negotiated_version: u32) {
    let use_proplist = negotiated_version >= def::PROTOCOL_VERSION_NAMED_CLIENT;
    let mut body = TagStructWriter::new();
    {
        let inner = handle.borrow();
        if use_proplist {
            body.put_proplist(&inner.proplist);
        } else {
            let name = inner.proplist.get_str("application.name").unwrap_or("audiod-client");
            body.put_string(Some(name));
        }
    }

    let (tag, dispatcher) = {
        let mut inner = handle.borrow_mut();
        let tag = next_tag(&mut inner);
        (tag, inner.dispatcher.clone().expect("set during on_connected"))
    };
    {
        let pstream = handle.borrow().pstream.clone().expect("set during on_connected");
        pstream.send_packet(Command::SetClientName as u32, tag, &body, None);
    }

    let weak = handle.borrow().self_weak.clone();
    dispatcher.register(
        tag,
        Duration::from_micros(def::DEFAULT_TIMEOUT_USEC),
        Box::new(move |outcome| {
            let handle = match weak.upgrade() {
                Some(h) => h,
                None => return,
            };
            match outcome {
                ReplyOutcome::Reply(mut reader) => {
                    let use_proplist = handle
                        .borrow()
                        .server_version
                        .map_or(false, |v| v >= def::PROTOCOL_VERSION_NAMED_CLIENT);
                    if use_proplist {
                        if let Ok(idx) = reader.get_u32() {
                            handle.borrow_mut().client_index = Some(idx);
                        }
                    }
                    set_state(&handle, State::Ready);
                }
                ReplyOutcome::Error(code) => teardown(&handle, State::Failed, ErrorCode::from_wire(code)),
                ReplyOutcome::Timeout => teardown(&handle, State::Failed, ErrorCode::Timeout),
            }
        }),
        Box::new(|| {}),
    );
}

fn route_memblock(handle: &Handle, channel_id: u32, offset: i64, mode: SeekMode, block: Memblock) {
    let mut inner = handle.borrow_mut();
    if let Some(stream) = inner.record_streams.get_mut(&channel_id) {
        let q = stream.queue_mut();
        q.seek(offset, mode);
        if block.is_empty() {
            q.advance_past_hole(0);
        } else {
            let len = block.len();
            q.push(block);
            let readable = q.readable_size();
            drop(inner);
            if let Some(stream) = handle.borrow_mut().record_streams.get_mut(&channel_id) {
                stream.notify_readable(readable);
            }
            let _ = len;
        }
    }
}

fn install_command_handlers(handle: &Handle, dispatcher: &Rc<Dispatcher>) {
    for &(command, kind) in &[
        (Command::PlaybackStreamKilled, StreamKind::Playback),
        (Command::RecordStreamKilled, StreamKind::Record),
    ] {
        let handle = handle.clone();
        dispatcher.set_command_handler(
            command,
            Box::new(move |_tag, mut reader| {
                let channel_id = reader.get_u32().map_err(|_| ())?;
                let mut inner = handle.borrow_mut();
                match kind {
                    StreamKind::Playback => {
                        if let Some(s) = inner.playback_streams.get_mut(&channel_id) {
                            s.fail();
                        }
                    }
                    StreamKind::Record => {
                        if let Some(s) = inner.record_streams.get_mut(&channel_id) {
                            s.fail();
                        }
                    }
                }
                Ok(())
            }),
        );
    }

    {
        let handle = handle.clone();
        dispatcher.set_command_handler(
            Command::SubscribeEvent,
            Box::new(move |_tag, mut reader| {
                let event_type = reader.get_u32().map_err(|_| ())?;
                let index = reader.get_u32().map_err(|_| ())?;
                let mut inner = handle.borrow_mut();
                let cb = inner.subscribe_cb.take();
                drop(inner);
                if let Some(mut cb) = cb {
                    cb(event_type, index);
                    let mut inner = handle.borrow_mut();
                    if inner.subscribe_cb.is_none() {
                        inner.subscribe_cb = Some(cb);
                    }
                }
                Ok(())
            }),
        );
    }

    {
        let handle = handle.clone();
        dispatcher.set_command_handler(
            Command::ClientEvent,
            Box::new(move |_tag, mut reader| {
                let name = reader.get_string().map_err(|_| ())?.ok_or(())?;
                let props = reader.get_proplist().map_err(|_| ())?;
                fire_event(&handle, &name, &props);
                Ok(())
            }),
        );
    }

    {
        let handle = handle.clone();
        dispatcher.set_command_handler(
            Command::Extension,
            Box::new(move |_tag, mut reader| {
                let index = reader.get_u32().map_err(|_| ())?;
                let name = reader.get_string().map_err(|_| ())?.ok_or(())?;
                let rest = reader.remaining_bytes();
                let mut inner = handle.borrow_mut();
                match name.as_str() {
                    crate::proto::EXT_STREAM_RESTORE => {
                        if let Some(mut cb) = inner.stream_restore_cb.take() {
                            drop(inner);
                            cb(index, rest);
                            let mut inner = handle.borrow_mut();
                            if inner.stream_restore_cb.is_none() {
                                inner.stream_restore_cb = Some(cb);
                            }
                        }
                    }
                    crate::proto::EXT_DEVICE_MANAGER => {
                        if let Some(mut cb) = inner.device_manager_cb.take() {
                            drop(inner);
                            cb(index, rest);
                            let mut inner = handle.borrow_mut();
                            if inner.device_manager_cb.is_none() {
                                inner.device_manager_cb = Some(cb);
                            }
                        }
                    }
                    other => {
                        tracing::debug!(extension = other, "unknown extension, discarding");
                    }
                }
                Ok(())
            }),
        );
    }

    // Stream flow-control and housekeeping commands are routed but not
    // acted on beyond not being a protocol violation; the per-stream
    // buffering/latency state machine they drive is an external
    // collaborator (§1).
    for command in [
        Command::Request,
        Command::Overflow,
        Command::Underflow,
        Command::PlaybackStreamMoved,
        Command::RecordStreamMoved,
        Command::PlaybackStreamSuspended,
        Command::RecordStreamSuspended,
        Command::Started,
        Command::PlaybackStreamEvent,
        Command::RecordStreamEvent,
        Command::PlaybackBufferAttrChanged,
        Command::RecordBufferAttrChanged,
    ] {
        dispatcher.set_command_handler(
            command,
            Box::new(move |_tag, _reader| {
                tracing::debug!(?command, "routed stream housekeeping command, no local action taken");
                Ok(())
            }),
        );
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Playback,
    Record,
}

/// Register a new outbound channel id for a playback stream the caller is
/// opening (channel allocation is otherwise entirely the stream's own
/// external state machine's business; the context only needs the id to
/// route `*_STREAM_KILLED` and memblock traffic).
pub fn allocate_playback_channel(ctx: &Context) -> u32 {
    let mut inner = ctx.inner.borrow_mut();
    let id = inner.next_channel;
    inner.next_channel = inner.next_channel.wrapping_add(1);
    inner.playback_streams.insert(id, PlaybackStream::new(id));
    id
}

pub fn allocate_record_channel(ctx: &Context) -> u32 {
    let mut inner = ctx.inner.borrow_mut();
    let id = inner.next_channel;
    inner.next_channel = inner.next_channel.wrapping_add(1);
    inner.record_streams.insert(id, RecordStream::new(id));
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::StdMainloop;
    use std::cell::Cell;
    use std::convert::TryInto;
    use std::os::unix::net::UnixStream;

    fn new_context() -> (Context, Rc<StdMainloop>, UnixStream) {
        new_context_with_pool(Rc::new(crate::memblock::HeapPool::default()))
    }

    fn new_context_with_pool(pool: Rc<dyn crate::memblock::MemblockPool>) -> (Context, Rc<StdMainloop>, UnixStream) {
        let ml = Rc::new(StdMainloop::new());
        let mut config = Config::new("test-app");
        config.autospawn_allowed = false;
        let ctx = Context::new(ml.clone(), config);
        ctx.set_memblock_pool(pool);
        let (a, b) = UnixStream::pair().unwrap();
        // Pretend `a` is what the dialer would have produced; hand it
        // straight to `on_connected` the way a successful dial callback
        // would, bypassing the real endpoint/dialer cascade so the test
        // drives only the authentication handshake.
        on_connected(&ctx.inner, Channel::Unix(a), true);
        (ctx, ml, b)
    }

    fn read_descriptor(server: &mut UnixStream) -> (u32, i64, u32, Vec<u8>) {
        use std::io::Read;
        let mut desc = [0u8; 20];
        server.read_exact(&mut desc).unwrap();
        let length = u32::from_be_bytes(desc[0..4].try_into().unwrap());
        let channel = u32::from_be_bytes(desc[4..8].try_into().unwrap());
        let off_hi = u32::from_be_bytes(desc[8..12].try_into().unwrap()) as i64;
        let off_lo = u32::from_be_bytes(desc[12..16].try_into().unwrap()) as i64;
        let seek_or_flags = u32::from_be_bytes(desc[16..20].try_into().unwrap());
        let mut payload = vec![0u8; length as usize];
        server.read_exact(&mut payload).unwrap();
        (channel, (off_hi << 32) | off_lo, seek_or_flags, payload)
    }

    fn write_control_reply(server: &mut UnixStream, tag: u32, body: &TagStructWriter) {
        use std::io::Write;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(Command::Reply as u32).to_be_bytes());
        payload.extend_from_slice(&tag.to_be_bytes());
        payload.extend_from_slice(body.as_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&payload);
        server.write_all(&frame).unwrap();
    }

    fn write_control_command(server: &mut UnixStream, command: Command, body: &TagStructWriter) {
        use std::io::Write;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(command as u32).to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes()); // tag, unused for server-pushed commands
        payload.extend_from_slice(body.as_bytes());

        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&payload);
        server.write_all(&frame).unwrap();
    }

    #[test]
    fn happy_path_handshake_reaches_ready() {
        let (ctx, ml, mut server) = new_context();
        let states = Rc::new(RefCell::new(Vec::new()));
        let states_cb = states.clone();
        ctx.set_state_callback(Box::new(move |s| states_cb.borrow_mut().push(s)));

        assert_eq!(ctx.state(), State::Authorizing);

        // Read the client's AUTH packet, read its tag, reply with a modern
        // server version and no shm bit.
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());

        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(def::PROTOCOL_VERSION);
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();

        assert_eq!(ctx.state(), State::SettingName);

        let (_ch, _off, _flags, name_payload) = read_descriptor(&mut server);
        let name_tag = u32::from_be_bytes(name_payload[4..8].try_into().unwrap());
        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(7); // client_index
        write_control_reply(&mut server, name_tag, &reply_body);
        ml.iterate();

        assert_eq!(ctx.state(), State::Ready);
        assert_eq!(ctx.client_index(), Some(7));
        assert_eq!(states.borrow().last(), Some(&State::Ready));
    }

    #[test]
    fn shm_enabled_when_pool_supports_it_and_peer_advertises_it() {
        let (ctx, ml, mut server) = new_context_with_pool(Rc::new(crate::memblock::ShmCapablePool::new(65536)));

        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        // The client should have advertised the shm bit since the pool
        // supports it and the peer is local (§4.6 "Version handshake").
        let client_version = u32::from_be_bytes(auth_payload[8..12].try_into().unwrap());
        assert_ne!(client_version & def::VERSION_SHM_BIT, 0);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());

        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(def::PROTOCOL_VERSION | def::VERSION_SHM_BIT);
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();

        assert!(ctx.is_shm_enabled());
    }

    #[test]
    fn shm_disabled_when_peer_does_not_advertise_it_at_version_13_plus() {
        let (ctx, ml, mut server) = new_context_with_pool(Rc::new(crate::memblock::ShmCapablePool::new(65536)));
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());

        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(def::PROTOCOL_VERSION); // bit 31 unset
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();

        assert!(!ctx.is_shm_enabled());
    }

    #[test]
    fn shm_disabled_when_pool_does_not_support_it_even_if_peer_advertises() {
        let (ctx, ml, mut server) = new_context(); // default pool has no shm support
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());

        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(def::PROTOCOL_VERSION | def::VERSION_SHM_BIT);
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();

        assert!(!ctx.is_shm_enabled());
    }

    #[test]
    fn server_version_below_minimum_fails_with_version_error() {
        let (ctx, ml, mut server) = new_context();
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());

        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(7); // below ErrorCode::MIN_PROTOCOL_VERSION (8)
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();

        assert_eq!(ctx.state(), State::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Version);
    }

    #[test]
    fn auth_error_reply_fails_with_normalized_code() {
        let (ctx, ml, mut server) = new_context();
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());

        use std::io::Write;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(Command::Error as u32).to_be_bytes());
        payload.extend_from_slice(&tag.to_be_bytes());
        payload.extend_from_slice(&(ErrorCode::AuthKey as u32).to_be_bytes());
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&payload);
        server.write_all(&frame).unwrap();

        ml.iterate();

        assert_eq!(ctx.state(), State::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::AuthKey);
    }

    #[test]
    fn disconnect_before_any_connect_attempt_is_terminal_and_idempotent() {
        let ml = Rc::new(StdMainloop::new());
        let ctx = Context::new(ml, Config::new("test-app"));
        ctx.disconnect();
        assert_eq!(ctx.state(), State::Terminated);
        ctx.disconnect();
        assert_eq!(ctx.state(), State::Terminated);
    }

    #[test]
    fn fork_detection_fails_connect() {
        let ml = Rc::new(StdMainloop::new());
        let ctx = Context::new(ml, Config::new("test-app"));
        ctx.inner.borrow_mut().created_pid = -1; // pretend we are a forked child
        let result = ctx.connect(None, ConnectFlags::empty());
        assert_eq!(result, Err(ErrorCode::Forked));
        assert_eq!(ctx.state(), State::Failed);
    }

    fn drive_to_ready(ctx: &Context, ml: &Rc<StdMainloop>, server: &mut UnixStream) {
        let (_ch, _off, _flags, auth_payload) = read_descriptor(server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());
        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(def::PROTOCOL_VERSION);
        write_control_reply(server, tag, &reply_body);
        ml.iterate();

        let (_ch, _off, _flags, name_payload) = read_descriptor(server);
        let name_tag = u32::from_be_bytes(name_payload[4..8].try_into().unwrap());
        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(1);
        write_control_reply(server, name_tag, &reply_body);
        ml.iterate();
        assert_eq!(ctx.state(), State::Ready);
    }

    #[test]
    fn drain_before_ready_is_refused_with_bad_state() {
        let (ctx, _ml, _server) = new_context();
        assert_eq!(ctx.state(), State::Authorizing);
        let result = ctx.drain(Box::new(|| {}));
        assert_eq!(result.err(), Some(ErrorCode::BadState));
    }

    #[test]
    fn drain_with_nothing_pending_is_refused_with_bad_state() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);
        assert!(!ctx.is_pending());
        let result = ctx.drain(Box::new(|| {}));
        assert_eq!(result.err(), Some(ErrorCode::BadState));
    }

    #[test]
    fn drain_fires_once_outstanding_call_replies() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let sink_op = ctx.set_default_sink("alsa_output.pci", Box::new(|_| {})).unwrap();
        let _ = sink_op;
        assert!(ctx.is_pending());

        let fired = Rc::new(Cell::new(false));
        let fired_cb = fired.clone();
        let _drain_op = ctx.drain(Box::new(move || fired_cb.set(true))).unwrap();
        assert!(!fired.get());

        let (_ch, _off, _flags, sink_payload) = read_descriptor(&mut server);
        let sink_tag = u32::from_be_bytes(sink_payload[4..8].try_into().unwrap());
        write_control_reply(&mut server, sink_tag, &TagStructWriter::new());
        ml.iterate();

        assert!(fired.get());
        assert!(!ctx.is_pending());
    }

    #[test]
    fn simple_call_reports_success_on_empty_reply() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let result = Rc::new(Cell::new(None));
        let result_cb = result.clone();
        let _op = ctx
            .set_default_sink("alsa_output.pci", Box::new(move |ok| result_cb.set(Some(ok))))
            .unwrap();

        let (_ch, _off, _flags, payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        write_control_reply(&mut server, tag, &TagStructWriter::new());
        ml.iterate();

        assert_eq!(result.get(), Some(true));
    }

    #[test]
    fn simple_call_reports_failure_on_error_reply_and_sets_last_error() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let result = Rc::new(Cell::new(None));
        let result_cb = result.clone();
        let _op = ctx
            .set_default_sink("nonexistent", Box::new(move |ok| result_cb.set(Some(ok))))
            .unwrap();

        let (_ch, _off, _flags, payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(payload[4..8].try_into().unwrap());

        use std::io::Write;
        let mut err_payload = Vec::new();
        err_payload.extend_from_slice(&(Command::Error as u32).to_be_bytes());
        err_payload.extend_from_slice(&tag.to_be_bytes());
        err_payload.extend_from_slice(&(ErrorCode::NoEntity as u32).to_be_bytes());
        let mut frame = Vec::new();
        frame.extend_from_slice(&(err_payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        frame.extend_from_slice(&[0u8; 12]);
        frame.extend_from_slice(&err_payload);
        server.write_all(&frame).unwrap();
        ml.iterate();

        assert_eq!(result.get(), Some(false));
        assert_eq!(ctx.last_error(), ErrorCode::NoEntity);
        assert_eq!(ctx.state(), State::Ready);
    }

    #[test]
    fn simple_call_with_non_empty_reply_tail_fails_the_context() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let _op = ctx.exit_daemon(Box::new(|_| {})).unwrap();

        let (_ch, _off, _flags, payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        let mut malformed = TagStructWriter::new();
        malformed.put_u32(1); // a REPLY to EXIT must have an empty tail
        write_control_reply(&mut server, tag, &malformed);
        ml.iterate();

        assert_eq!(ctx.state(), State::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::Protocol);
    }

    #[test]
    fn set_name_uses_legacy_command_below_named_client_version() {
        let (ctx, ml, mut server) = new_context();
        // Negotiate a pre-named-client version explicitly instead of using
        // `drive_to_ready`, which negotiates the current `PROTOCOL_VERSION`.
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());
        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(9); // below PROTOCOL_VERSION_NAMED_CLIENT (13)
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();

        let (_ch, _off, _flags, name_payload) = read_descriptor(&mut server);
        let name_tag = u32::from_be_bytes(name_payload[4..8].try_into().unwrap());
        write_control_reply(&mut server, name_tag, &TagStructWriter::new());
        ml.iterate();
        assert_eq!(ctx.state(), State::Ready);

        let _op = ctx.set_name("new-name", Box::new(|_| {})).unwrap();
        let (_ch, _off, _flags, payload) = read_descriptor(&mut server);
        let mut reader = TagStructReader::new(&payload[8..]);
        assert_eq!(reader.get_string().unwrap(), Some("new-name".to_owned()));
    }

    #[test]
    fn proplist_update_refused_below_named_client_version() {
        let (ctx, ml, mut server) = new_context();
        let (_ch, _off, _flags, auth_payload) = read_descriptor(&mut server);
        let tag = u32::from_be_bytes(auth_payload[4..8].try_into().unwrap());
        let mut reply_body = TagStructWriter::new();
        reply_body.put_u32(9);
        write_control_reply(&mut server, tag, &reply_body);
        ml.iterate();
        let (_ch, _off, _flags, name_payload) = read_descriptor(&mut server);
        let name_tag = u32::from_be_bytes(name_payload[4..8].try_into().unwrap());
        write_control_reply(&mut server, name_tag, &TagStructWriter::new());
        ml.iterate();

        let result = ctx.proplist_update(UpdateMode::Merge, &Proplist::new(), Box::new(|_| {}));
        assert_eq!(result.err(), Some(ErrorCode::NotSupported));
    }

    #[test]
    fn extension_packet_is_routed_to_the_matching_named_callback() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let seen = Rc::new(RefCell::new(None));
        let seen_cb = seen.clone();
        ctx.set_stream_restore_callback(Box::new(move |index, body| {
            *seen_cb.borrow_mut() = Some((index, body.to_vec()));
        }));

        let mut body = TagStructWriter::new();
        body.put_u32(7); // extension index
        body.put_string(Some(crate::proto::EXT_STREAM_RESTORE));
        body.put_u32(42); // extension-specific payload, opaque to this crate

        write_control_command(&mut server, Command::Extension, &body);
        ml.iterate();

        let (index, rest) = seen.borrow_mut().take().expect("stream-restore callback fired");
        assert_eq!(index, 7);
        let mut reader = TagStructReader::new(&rest);
        assert_eq!(reader.get_u32().unwrap(), 42);
    }

    #[test]
    fn extension_packet_for_unknown_name_is_discarded_without_failing() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let mut body = TagStructWriter::new();
        body.put_u32(1);
        body.put_string(Some("module-some-unknown-thing"));

        write_control_command(&mut server, Command::Extension, &body);
        ml.iterate();

        assert_eq!(ctx.state(), State::Ready);
    }

    #[test]
    fn disconnect_cancels_outstanding_operations_without_firing_their_callback() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let cb_ran = Rc::new(Cell::new(false));
        let cb_ran_cb = cb_ran.clone();
        let op = ctx.set_default_sink("alsa_output.pci", Box::new(move |_| cb_ran_cb.set(true))).unwrap();
        assert_eq!(op.state(), crate::operation::OperationState::Running);

        ctx.disconnect();

        assert_eq!(op.state(), crate::operation::OperationState::Cancelled);
        assert!(!cb_ran.get());
    }

    #[test]
    fn terminal_failure_transitions_live_streams_to_failed() {
        let (ctx, ml, mut server) = new_context();
        drive_to_ready(&ctx, &ml, &mut server);

        let channel = allocate_record_channel(&ctx);

        // Closing the peer socket triggers link-died -> Failed once the
        // main loop notices the hangup.
        drop(server);
        ml.iterate();

        assert_eq!(ctx.state(), State::Failed);
        assert_eq!(ctx.last_error(), ErrorCode::ConnectionTerminated);
        let inner = ctx.inner.borrow();
        let stream = inner.record_streams.get(&channel).unwrap();
        assert_eq!(stream.state(), crate::stream::StreamState::Failed);
    }
}
