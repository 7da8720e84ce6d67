//! In-process fault containment for a single load attempt.
//!
//! [`contain`] runs a closure under a [`FaultGuard`]: a process panic hook is
//! installed on entry and the previous hook is restored on exit, on every
//! path. The guard is reference counted so concurrent attempts on different
//! threads share one installed hook; panics on threads outside an attempt
//! still reach the previous hook unchanged.
//!
//! This is best effort. A panic raised by engine bindings unwinds cleanly,
//! but a native fault that scribbled over memory before surfacing leaves the
//! process in an unspecified state. Treat the process as degraded after a
//! contained fault; [`crate::loader::isolation`] moves the risky call into a
//! worker process when that is not acceptable. Builds with `panic = "abort"`
//! cannot contain anything.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use thiserror::Error;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// A fatal fault intercepted during one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("fault contained: {message}")]
pub struct ContainedFault {
    pub message: String,
}

struct HookState {
    depth: usize,
    previous: Option<Arc<PanicHook>>,
}

static HOOK_STATE: Mutex<HookState> = const_mutex(HookState {
    depth: 0,
    previous: None,
});

thread_local! {
    static IN_ATTEMPT: Cell<bool> = const { Cell::new(false) };
    static LAST_FAULT: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Scoped installation of the containment hook for the current thread.
///
/// Not `Send`: it must be dropped on the thread that created it.
pub struct FaultGuard {
    was_in_attempt: bool,
    _not_send: PhantomData<*const ()>,
}

impl FaultGuard {
    pub fn install() -> Self {
        {
            let mut state = HOOK_STATE.lock();
            if state.depth == 0 {
                let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
                let chained = Arc::clone(&previous);
                panic::set_hook(Box::new(move |info| {
                    let guarded = IN_ATTEMPT.try_with(Cell::get).unwrap_or(false);
                    if guarded {
                        let _ = LAST_FAULT.try_with(|slot| *slot.borrow_mut() = Some(info.to_string()));
                    } else {
                        (**chained)(info);
                    }
                }));
                state.previous = Some(previous);
            }
            state.depth += 1;
        }

        LAST_FAULT.with(|slot| slot.borrow_mut().take());
        let was_in_attempt = IN_ATTEMPT.with(|flag| flag.replace(true));

        Self {
            was_in_attempt,
            _not_send: PhantomData,
        }
    }

    /// Take the message captured by the hook on this thread, if any.
    pub fn take_fault(&self) -> Option<String> {
        LAST_FAULT.with(|slot| slot.borrow_mut().take())
    }
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        IN_ATTEMPT.with(|flag| flag.set(self.was_in_attempt));

        let mut state = HOOK_STATE.lock();
        state.depth = state.depth.saturating_sub(1);

        // The hook cannot be swapped while this thread is unwinding; the
        // installed hook keeps delegating, and the next install re-chains it.
        if state.depth > 0 || std::thread::panicking() {
            return;
        }

        if let Some(previous) = state.previous.take() {
            // Dropping our hook releases its clone of `previous`.
            drop(panic::take_hook());
            match Arc::try_unwrap(previous) {
                Ok(hook) => panic::set_hook(hook),
                Err(shared) => panic::set_hook(Box::new(move |info| (**shared)(info))),
            }
        }
    }
}

/// Run `f`, converting a panic into a [`ContainedFault`].
pub fn contain<R>(f: impl FnOnce() -> R) -> Result<R, ContainedFault> {
    let guard = FaultGuard::install();
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    let captured = guard.take_fault();
    drop(guard);

    outcome.map_err(|payload| ContainedFault {
        message: captured.unwrap_or_else(|| payload_message(payload.as_ref())),
    })
}

pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
