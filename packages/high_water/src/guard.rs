//! Per-thread reentrancy guard.
//!
//! Everything the engine does while handling an allocation event (growing the ledger,
//! interning stacks, resolving symbols, logging) may itself allocate. Those nested
//! allocations arrive back at the hooks on the same thread and must pass straight
//! through, both to avoid recursion and to keep the engine's own memory out of the
//! ledger.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    // No destructor, so this stays accessible during thread teardown.
    static IN_ENGINE: Cell<bool> = const { Cell::new(false) };
}

/// Proof that the current thread has entered the engine. Dropping it leaves the engine.
#[derive(Debug)]
pub(crate) struct ReentrancyGuard {
    _single_threaded: PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Enters the engine on this thread.
    ///
    /// Returns `None` if this thread is already inside the engine, in which case the caller
    /// must behave as if no session were active.
    #[inline]
    pub(crate) fn enter() -> Option<Self> {
        let already_inside = IN_ENGINE.try_with(|flag| flag.replace(true)).unwrap_or(true);

        if already_inside {
            None
        } else {
            Some(Self {
                _single_threaded: PhantomData,
            })
        }
    }
}

impl Drop for ReentrancyGuard {
    #[inline]
    fn drop(&mut self) {
        _ = IN_ENGINE.try_with(|flag| flag.set(false));
    }
}
