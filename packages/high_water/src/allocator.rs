//! Global allocator wrapper that reports every heap event to a [`Profiler`].

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::hint::black_box;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{AllocationHandle, AllocationKind, Config, Error, PeakSnapshot, Profiler, Result};

// The alignment every allocator on supported platforms provides without being asked.
const DEFAULT_ALIGNMENT: usize = 2 * mem::size_of::<usize>();

/// A memory allocator that attributes every heap allocation of the process to the call
/// stack that made it, tracking the peak of live heap memory.
///
/// Wraps any [`GlobalAlloc`] implementation. Allocation behavior is that of the wrapped
/// allocator; outside a profiling session the only added cost is one atomic load per call.
///
/// # Examples
///
/// ```
/// use high_water::{Allocator, Config};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// ALLOCATOR
///     .start_session(Config::builder().native_stacks(false).build())
///     .unwrap();
///
/// let data = vec![0_u64; 1000];
/// drop(data);
///
/// let snapshot = ALLOCATOR.end_session().unwrap();
/// assert!(snapshot.total_bytes() >= 8000);
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
    profiler: Profiler,

    // Set by the first call that reaches this allocator. Proves it is the global allocator.
    seen: AtomicBool,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .field("profiler", &self.profiler)
            .field("seen", &self.seen)
            .finish()
    }
}

impl Allocator<System> {
    /// Creates a profiling allocator on top of the system allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self::new(System)
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a profiling allocator on top of `allocator`.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self {
            inner: allocator,
            profiler: Profiler::new(),
            seen: AtomicBool::new(false),
        }
    }

    /// The profiler that receives this allocator's events.
    ///
    /// Use it to report interpreter frames, to take snapshots during the session and to
    /// track memory obtained outside the Rust allocator.
    #[must_use]
    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Starts a profiling session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HooksNotInstalled`] if this allocator is not registered as the
    /// `#[global_allocator]`, which would leave the session blind to every allocation.
    /// Returns [`Error::SessionAlreadyActive`] if a session is already active.
    pub fn start_session(&self, config: Config) -> Result<()> {
        if !self.seen.load(Ordering::Relaxed) {
            // Any allocation at all will do.
            drop(black_box(Box::new(0_u64)));
        }

        if !self.seen.load(Ordering::Relaxed) {
            return Err(Error::HooksNotInstalled {
                hint: "register the allocator with #[global_allocator]",
            });
        }

        self.profiler.start_session(config)
    }

    /// Ends the profiling session, returning its retained snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveSession`] if no session is active.
    pub fn end_session(&self) -> Result<PeakSnapshot> {
        self.profiler.end_session()
    }

    #[inline]
    fn mark_seen(&self) {
        if !self.seen.load(Ordering::Relaxed) {
            self.seen.store(true, Ordering::Relaxed);
        }
    }
}

fn kind_of(layout: Layout) -> AllocationKind {
    if layout.align() > DEFAULT_ALIGNMENT {
        AllocationKind::AlignedHeap
    } else {
        AllocationKind::Heap
    }
}

// SAFETY: All allocation operations are delegated to the underlying allocator, which
// implements GlobalAlloc correctly. Tracking never changes the memory handed out.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.mark_seen();

        self.profiler
            .tracked_allocate(kind_of(layout), layout.size(), || {
                // SAFETY: Forwarding the caller's guarantees to the underlying allocator.
                unsafe { self.inner.alloc(layout) }
            })
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.profiler
            .tracked_free(AllocationHandle::from_ptr(ptr), || {
                // SAFETY: Forwarding the caller's guarantees to the underlying allocator.
                unsafe { self.inner.dealloc(ptr, layout) }
            });
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.mark_seen();

        self.profiler
            .tracked_allocate(kind_of(layout), layout.size(), || {
                // SAFETY: Forwarding the caller's guarantees to the underlying allocator.
                unsafe { self.inner.alloc_zeroed(layout) }
            })
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.mark_seen();

        self.profiler
            .tracked_resize(AllocationHandle::from_ptr(ptr), new_size, || {
                // SAFETY: Forwarding the caller's guarantees to the underlying allocator.
                unsafe { self.inner.realloc(ptr, layout, new_size) }
            })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Allocator<System>: Send, Sync);

    fn config() -> Config {
        Config::builder()
            .native_stacks(false)
            .emergency_reserve_bytes(0)
            .report_on_out_of_memory(false)
            .build()
    }

    #[test]
    fn not_installed_allocator_refuses_session() {
        let allocator = Allocator::system();

        let result = allocator.start_session(config());

        assert!(matches!(result, Err(Error::HooksNotInstalled { .. })));
        assert!(!allocator.profiler().is_active());
    }

    #[test]
    fn direct_calls_are_tracked() {
        let allocator = Allocator::system();
        let layout = Layout::from_size_align(256, 8).unwrap();

        // The allocator is not global here; calling it directly marks it as reachable.
        // SAFETY: Nonzero size.
        let warmup = unsafe { allocator.alloc(layout) };
        // SAFETY: Allocated above with the same layout.
        unsafe { allocator.dealloc(warmup, layout) };

        allocator.start_session(config()).unwrap();

        // SAFETY: Nonzero size.
        let ptr = unsafe { allocator.alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        // SAFETY: Allocated above with the same layout, grown to a nonzero size.
        let grown = unsafe { allocator.realloc(ptr, layout, 1024) };
        assert!(!grown.is_null());

        let usage = allocator.profiler().usage().unwrap();
        assert_eq!(usage.current_bytes(), 1024);
        assert_eq!(usage.live_allocations(), 1);

        let grown_layout = Layout::from_size_align(1024, 8).unwrap();
        // SAFETY: Reallocated above to this layout.
        unsafe { allocator.dealloc(grown, grown_layout) };

        let snapshot = allocator.end_session().unwrap();
        assert_eq!(snapshot.total_bytes(), 1024);
    }

    #[test]
    fn over_aligned_layouts_are_aligned_heap() {
        assert_eq!(
            kind_of(Layout::from_size_align(64, 4096).unwrap()),
            AllocationKind::AlignedHeap
        );
        assert_eq!(
            kind_of(Layout::from_size_align(64, 8).unwrap()),
            AllocationKind::Heap
        );
    }
}
