//! Per-call continuation objects (§4.7).
//!
//! Every asynchronous call the context issues (`set_default_sink`, `drain`,
//! proplist updates, ...) returns one of these as a handle the caller can
//! cancel; it carries no reply data itself; the caller's own callback,
//! supplied at call time, is what receives the result.

use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Cancelled,
}

struct Inner {
    state: OperationState,
    /// Runs when the operation transitions out of `Running`, whichever way;
    /// used by the dispatcher-registered continuation to know whether its
    /// result is still wanted.
    on_cancel: Option<Box<dyn FnOnce()>>,
}

/// A handle to an in-flight call. Cloning shares the same underlying state
/// (mirrors the teacher's `pa_operation_ref`/`unref` refcounting).
#[derive(Clone)]
pub struct Operation {
    inner: Rc<RefCell<Inner>>,
}

impl Operation {
    pub fn new(on_cancel: Box<dyn FnOnce()>) -> Self {
        Operation { inner: Rc::new(RefCell::new(Inner { state: OperationState::Running, on_cancel: Some(on_cancel) })) }
    }

    pub fn state(&self) -> OperationState {
        self.inner.borrow().state
    }

    /// Mark the operation complete because its reply arrived (or the
    /// context failed out from under it). Idempotent: a second call is a
    /// no-op.
    pub fn complete(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == OperationState::Running {
            inner.state = OperationState::Done;
            inner.on_cancel = None;
        }
    }

    /// Cancel the operation (§4.7 "idempotent cancel"). If still running,
    /// runs the cancellation hook (typically: tell the dispatcher to drop
    /// the pending tag's continuation). A no-op if already done or
    /// cancelled.
    pub fn cancel(&self) {
        let hook = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != OperationState::Running {
                return;
            }
            inner.state = OperationState::Cancelled;
            inner.on_cancel.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn cancel_runs_hook_exactly_once() {
        let runs = Rc::new(Cell::new(0));
        let runs_cb = runs.clone();
        let op = Operation::new(Box::new(move || runs_cb.set(runs_cb.get() + 1)));
        op.cancel();
        op.cancel();
        assert_eq!(runs.get(), 1);
        assert_eq!(op.state(), OperationState::Cancelled);
    }

    #[test]
    fn complete_then_cancel_does_not_run_hook() {
        let runs = Rc::new(Cell::new(0));
        let runs_cb = runs.clone();
        let op = Operation::new(Box::new(move || runs_cb.set(runs_cb.get() + 1)));
        op.complete();
        op.cancel();
        assert_eq!(runs.get(), 0);
        assert_eq!(op.state(), OperationState::Done);
    }

    #[test]
    fn clones_share_state() {
        let op = Operation::new(Box::new(|| {}));
        let clone = op.clone();
        op.complete();
        assert_eq!(clone.state(), OperationState::Done);
    }
}
