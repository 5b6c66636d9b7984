use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::frame::{FunctionId, FunctionTable};
use crate::guard::ReentrancyGuard;
use crate::oom::{AllocationOutcome, AllocationResult};
use crate::tracker::{Status, Tracker};
use crate::{
    AllocationHandle, AllocationKind, Config, DisableReason, ERR_POISONED_LOCK, Error,
    PeakSnapshot, Result, UsageStats, report, shadow_stack,
};

/// The profiling context: owns the tracking state of one session at a time and the
/// registry of interpreter functions.
///
/// Allocation hooks (the [`Allocator`][crate::Allocator] wrapper, the mapping wrappers in
/// [`mapping`][crate::mapping] or a C interposition layer) report every event through the
/// `tracked_*` methods, which run the underlying call and update the ledger as one atomic
/// step. Outside a session, these methods call straight through.
///
/// # Examples
///
/// ```
/// use std::alloc::{Layout, System, GlobalAlloc};
///
/// use high_water::{AllocationHandle, AllocationKind, Config, Profiler};
///
/// static PROFILER: Profiler = Profiler::new();
///
/// PROFILER
///     .start_session(Config::builder().native_stacks(false).build())
///     .unwrap();
///
/// let layout = Layout::from_size_align(4096, 8).unwrap();
/// // SAFETY: The layout has a nonzero size.
/// let ptr = PROFILER.tracked_allocate(AllocationKind::Heap, layout.size(), || unsafe {
///     System.alloc(layout)
/// });
///
/// let snapshot = PROFILER.end_session().unwrap();
/// assert_eq!(snapshot.total_bytes(), 4096);
///
/// // SAFETY: Allocated above with the same layout.
/// unsafe { System.dealloc(ptr, layout) };
/// ```
#[derive(Debug)]
pub struct Profiler {
    // Lets the hooks skip the lock entirely when no session is active.
    active: AtomicBool,

    tracker: Mutex<Option<Tracker>>,

    // Lives across sessions. Only ever locked after `tracker`, never before.
    functions: Mutex<Option<FunctionTable>>,
}

impl Profiler {
    /// Creates a profiler with no active session.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            tracker: Mutex::new(None),
            functions: Mutex::new(None),
        }
    }

    /// Starts a session: from now on every reported allocation is tracked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionAlreadyActive`] if a session is already active.
    pub fn start_session(&self, config: Config) -> Result<()> {
        let _reentrancy = ReentrancyGuard::enter();

        let mut tracker = self.tracker.lock().expect(ERR_POISONED_LOCK);
        if tracker.is_some() {
            return Err(Error::SessionAlreadyActive);
        }

        let new_tracker = Tracker::new(config);
        let native_stacks = new_tracker.config().native_stacks();
        *tracker = Some(new_tracker);
        self.active.store(true, Ordering::Release);
        drop(tracker);

        info!(native_stacks, "memory profiling session started");
        Ok(())
    }

    /// Ends the session and returns its retained snapshot: the out-of-memory state if
    /// the process ran out of memory, otherwise the first state at peak usage. If
    /// nothing was allocated, the snapshot is empty with a total of zero.
    ///
    /// All bookkeeping of the session is released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveSession`] if no session is active.
    pub fn end_session(&self) -> Result<PeakSnapshot> {
        let _reentrancy = ReentrancyGuard::enter();

        let mut slot = self.tracker.lock().expect(ERR_POISONED_LOCK);
        let Some(mut tracker) = slot.take() else {
            return Err(Error::NoActiveSession);
        };
        self.active.store(false, Ordering::Release);
        drop(slot);

        log_status(tracker.status());

        let snapshot = {
            let mut functions = self.functions.lock().expect(ERR_POISONED_LOCK);
            tracker.peak_snapshot(functions.get_or_insert_with(FunctionTable::new))
        };

        info!(
            total_bytes = snapshot.total_bytes(),
            trigger = ?snapshot.trigger(),
            "memory profiling session ended"
        );

        Ok(snapshot)
    }

    /// Whether a session is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Why the active session stopped tracking, if it did.
    #[must_use]
    pub fn disable_reason(&self) -> Option<DisableReason> {
        let _reentrancy = ReentrancyGuard::enter();

        match self.tracker.lock().expect(ERR_POISONED_LOCK).as_ref()?.status() {
            Status::Disabled(reason) => Some(reason),
            Status::Tracking | Status::OutOfMemory => None,
        }
    }

    /// Usage figures of the active session.
    #[must_use]
    pub fn usage(&self) -> Option<UsageStats> {
        let _reentrancy = ReentrancyGuard::enter();

        self.tracker
            .lock()
            .expect(ERR_POISONED_LOCK)
            .as_ref()
            .map(Tracker::stats)
    }

    /// The snapshot the active session would return if it ended now.
    ///
    /// Allocations from other threads wait while the snapshot is built.
    #[must_use]
    pub fn peak_snapshot(&self) -> Option<PeakSnapshot> {
        self.with_tracker_and_functions(|tracker, functions| {
            log_status(tracker.status());
            tracker.peak_snapshot(functions)
        })
    }

    /// A snapshot of what is live right now, attributed to call stacks.
    ///
    /// Allocations from other threads wait while the snapshot is built.
    #[must_use]
    pub fn current_snapshot(&self) -> Option<PeakSnapshot> {
        self.with_tracker_and_functions(Tracker::current_snapshot)
    }

    fn with_tracker_and_functions<R>(
        &self,
        f: impl FnOnce(&mut Tracker, &FunctionTable) -> R,
    ) -> Option<R> {
        let _reentrancy = ReentrancyGuard::enter();

        let mut tracker = self.tracker.lock().expect(ERR_POISONED_LOCK);
        let tracker = tracker.as_mut()?;
        let mut functions = self.functions.lock().expect(ERR_POISONED_LOCK);

        Some(f(tracker, functions.get_or_insert_with(FunctionTable::new)))
    }

    /// Registers an interpreter function, returning its identifier. Registering the same
    /// function (name and file) again returns the same identifier, also across sessions.
    ///
    /// Never fails: if the function cannot be recorded, a placeholder identifier is
    /// returned and frames of the function are reported as unregistered.
    pub fn register_function(&self, name: &str, file: &str) -> FunctionId {
        let _reentrancy = ReentrancyGuard::enter();

        let registered = self
            .functions
            .lock()
            .expect(ERR_POISONED_LOCK)
            .get_or_insert_with(FunctionTable::new)
            .register(name, file);

        registered.unwrap_or_else(|| {
            warn!(name, file, "could not register function; its frames show as unregistered");
            FunctionId::UNREGISTERED
        })
    }

    /// The interpreter on this thread entered `function` and is executing `line` in it.
    ///
    /// A nonzero `parent_line` is the line in the calling function that made the call.
    pub fn start_call(&self, function: FunctionId, parent_line: u32, line: u32) {
        let _reentrancy = ReentrancyGuard::enter();

        // Native code the function calls into runs on the machine stack below this point.
        let marker = 0_u8;
        let entry = hint::black_box(ptr::from_ref(&marker)).addr();

        if shadow_stack::with_current(|s| s.start_call(function, parent_line, line, entry))
            .is_none()
        {
            debug!("call could not be recorded on this thread");
        }
    }

    /// The interpreter on this thread returned from its innermost function.
    pub fn finish_call(&self) {
        let _reentrancy = ReentrancyGuard::enter();

        match shadow_stack::with_current(|s| s.finish_call()) {
            Some(true) => {}
            Some(false) => debug!("return without a matching call on this thread"),
            None => debug!("return could not be recorded on this thread"),
        }
    }

    /// The interpreter on this thread moved on to `line` in its innermost function.
    pub fn new_line_number(&self, line: u32) {
        _ = shadow_stack::with_current(|s| s.set_current_line(line));
    }

    /// Runs an allocation call and tracks the memory it returns, attributed to the current
    /// call stack.
    ///
    /// `size` is the number of bytes requested. For [`AllocationKind::AnonymousMapping`]
    /// the whole range starting at the returned address is tracked. If the call fails
    /// because memory is exhausted, the current state becomes the out-of-memory snapshot
    /// before the failure is returned.
    pub fn tracked_allocate<R: AllocationResult>(
        &self,
        kind: AllocationKind,
        size: usize,
        allocate: impl FnOnce() -> R,
    ) -> R {
        let Some(mut session) = self.enter() else {
            return allocate();
        };

        let result = allocate();
        let tracker = session.tracker();

        let newly_out_of_memory = match result.outcome(size) {
            AllocationOutcome::Allocated(handle) => {
                if let Some(stack) = tracker.current_stack() {
                    if kind == AllocationKind::AnonymousMapping {
                        tracker.record_mapping(handle.address(), size, stack);
                    } else {
                        tracker.record_allocation(handle, size as u64, kind, stack);
                    }
                }
                false
            }
            AllocationOutcome::OutOfMemory => tracker.record_out_of_memory(),
            AllocationOutcome::Failed => false,
        };

        drop(session);
        if newly_out_of_memory {
            self.report_out_of_memory();
        }

        result
    }

    /// Stops tracking `handle`, then runs the call that releases it.
    ///
    /// Handles that are not tracked (allocated before the session started, or never seen)
    /// are passed through without effect on the totals.
    pub fn tracked_free<R>(&self, handle: AllocationHandle, free: impl FnOnce() -> R) -> R {
        let Some(mut session) = self.enter() else {
            return free();
        };

        session.tracker().record_free(handle);
        free()
    }

    /// Runs a call that resizes the allocation at `old` to `new_size` bytes, possibly
    /// moving it. On success the allocation is attributed to the current call stack.
    ///
    /// A failed resize leaves the original allocation in place and tracked.
    pub fn tracked_resize<R: AllocationResult>(
        &self,
        old: AllocationHandle,
        new_size: usize,
        resize: impl FnOnce() -> R,
    ) -> R {
        let Some(mut session) = self.enter() else {
            return resize();
        };

        let result = resize();
        let tracker = session.tracker();

        let newly_out_of_memory = match result.outcome(new_size) {
            AllocationOutcome::Allocated(new_handle) => {
                if let Some(stack) = tracker.current_stack() {
                    tracker.record_resize(old, new_handle, new_size as u64, stack);
                }
                false
            }
            AllocationOutcome::OutOfMemory => tracker.record_out_of_memory(),
            AllocationOutcome::Failed => false,
        };

        drop(session);
        if newly_out_of_memory {
            self.report_out_of_memory();
        }

        result
    }

    /// Stops tracking the mapped bytes in `start..start + len`, then runs the call that
    /// unmaps them. Mappings only partly inside the range stay tracked for the rest.
    pub fn tracked_unmap<R>(&self, start: usize, len: usize, unmap: impl FnOnce() -> R) -> R {
        let Some(mut session) = self.enter() else {
            return unmap();
        };

        session.tracker().record_unmap(start, len);
        unmap()
    }

    /// Reports an object the interpreter allocated from memory it manages itself.
    pub fn track_object_allocation(&self, handle: AllocationHandle, size: usize) {
        let Some(mut session) = self.enter() else {
            return;
        };

        let tracker = session.tracker();
        if let Some(stack) = tracker.current_stack() {
            tracker.record_allocation(
                handle,
                size as u64,
                AllocationKind::InterpreterObject,
                stack,
            );
        }
    }

    /// Reports that the interpreter released an object previously reported through
    /// [`track_object_allocation()`][Self::track_object_allocation].
    pub fn track_object_deallocation(&self, handle: AllocationHandle) {
        if let Some(mut session) = self.enter() {
            session.tracker().record_free(handle);
        }
    }

    /// Reports that an allocation made outside the `tracked_*` methods failed because
    /// memory is exhausted.
    pub fn track_allocation_failure(&self) {
        let Some(mut session) = self.enter() else {
            return;
        };

        let newly_out_of_memory = session.tracker().record_out_of_memory();
        drop(session);

        if newly_out_of_memory {
            self.report_out_of_memory();
        }
    }

    // The process may not survive long enough to end the session, so the out-of-memory
    // state is written out as soon as it is frozen.
    #[cold]
    fn report_out_of_memory(&self) {
        let Some(Some((snapshot, dir))) = self.with_tracker_and_functions(|tracker, functions| {
            if !tracker.config().report_on_out_of_memory() {
                return None;
            }

            let dir = tracker.config().output_dir().to_path_buf();
            Some((tracker.peak_snapshot(functions), dir))
        }) else {
            return;
        };

        let _reentrancy = ReentrancyGuard::enter();

        match report::write(&snapshot, &dir) {
            Ok(paths) => {
                warn!(
                    report = %paths.json().display(),
                    total_bytes = snapshot.total_bytes(),
                    "the process ran out of memory; memory report written"
                );
            }
            Err(e) => {
                error!(
                    error = %e,
                    "the process ran out of memory; memory report could not be written"
                );
            }
        }
    }

    // `None` means: call through, do not track. That is the case outside a session, after
    // the session stopped recording, when the engine itself is allocating on this thread
    // and when a panic poisoned the lock.
    #[inline]
    fn enter(&self) -> Option<ActiveSession<'_>> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }

        let reentrancy = ReentrancyGuard::enter()?;
        let tracker = self.tracker.lock().ok()?;

        if !tracker.as_ref().is_some_and(Tracker::is_recording) {
            return None;
        }

        Some(ActiveSession {
            tracker,
            _reentrancy: reentrancy,
        })
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

// Field order matters: the lock is released before the thread leaves the engine.
struct ActiveSession<'a> {
    tracker: MutexGuard<'a, Option<Tracker>>,
    _reentrancy: ReentrancyGuard,
}

impl ActiveSession<'_> {
    fn tracker(&mut self) -> &mut Tracker {
        self.tracker
            .as_mut()
            .expect("checked when the session was entered")
    }
}

fn log_status(status: Status) {
    match status {
        Status::Tracking => {}
        Status::OutOfMemory => {
            warn!("the process ran out of memory; reporting the state at that moment");
        }
        Status::Disabled(reason) => {
            warn!(
                %reason,
                "tracking stopped partway through the session; reporting the state at that moment"
            );
        }
    }
}
