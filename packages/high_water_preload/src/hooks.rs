//! The C allocation functions, replaced.
//!
//! Each function forwards to the C library and reports the event to the profiler. Until the
//! C library functions are found, heap requests are served from the bootstrap arena and
//! mapping requests go straight to the kernel.

use std::ptr;

use high_water::{AllocationHandle, AllocationKind};
use libc::{c_int, c_void, off_t, size_t};

use crate::PROFILER;
use crate::bootstrap::ARENA;
use crate::outcome::{self, Aligned, Call, Mapping};
use crate::real;

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let Some(real) = real::functions() else {
        return ARENA.allocate(size).cast();
    };

    PROFILER
        .tracked_allocate(AllocationKind::Heap, size, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.malloc)(size) })
        })
        .finish()
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real::functions() else {
        return count
            .checked_mul(size)
            .map_or(ptr::null_mut(), |total| ARENA.allocate(total).cast());
    };

    let Some(total) = count.checked_mul(size) else {
        // The C library rejects this without allocating anything.
        // SAFETY: Forwarding the caller's arguments.
        return unsafe { (real.calloc)(count, size) };
    };

    PROFILER
        .tracked_allocate(AllocationKind::Heap, total, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.calloc)(count, size) })
        })
        .finish()
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(old: *mut c_void, size: size_t) -> *mut c_void {
    if old.is_null() {
        // SAFETY: realloc(NULL, n) is malloc(n).
        return unsafe { malloc(size) };
    }

    if ARENA.contains(old.cast_const().cast()) {
        // SAFETY: The caller passes a live block, so it came from the arena.
        return unsafe { move_out_of_arena(old, size) };
    }

    let Some(real) = real::functions() else {
        // Only arena blocks exist before the C library functions are found.
        return ptr::null_mut();
    };

    let handle = AllocationHandle::from_ptr(old);

    if size == 0 {
        // The C library frees the block and returns null (or a minimal block).
        return PROFILER
            .tracked_free(handle, || {
                // SAFETY: Forwarding the caller's arguments.
                Call::capture(|| unsafe { (real.realloc)(old, 0) })
            })
            .finish();
    }

    PROFILER
        .tracked_resize(handle, size, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.realloc)(old, size) })
        })
        .finish()
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn reallocarray(
    old: *mut c_void,
    count: size_t,
    size: size_t,
) -> *mut c_void {
    let Some(total) = count.checked_mul(size) else {
        // Rejected without touching the block, the way the C library does it.
        outcome::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    };

    // SAFETY: Once the product fits, this is realloc.
    unsafe { realloc(old, total) }
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || ARENA.contains(ptr.cast_const().cast()) {
        return;
    }

    let Some(real) = real::functions() else {
        return;
    };

    PROFILER
        .tracked_free(AllocationHandle::from_ptr(ptr), || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.free)(ptr) })
        })
        .finish();
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let Some(real) = real::functions() else {
        return libc::ENOMEM;
    };

    let aligned = PROFILER
        .tracked_allocate(AllocationKind::AlignedHeap, size, || {
            Call::capture(|| {
                let mut ptr = ptr::null_mut();
                // SAFETY: Forwarding the caller's arguments, with a local out parameter.
                let code = unsafe { (real.posix_memalign)(&raw mut ptr, alignment, size) };
                Aligned { code, ptr }
            })
        })
        .finish();

    if aligned.code == 0 {
        // SAFETY: The caller guarantees `out` is valid for writes.
        unsafe {
            out.write(aligned.ptr);
        }
    }

    aligned.code
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real::functions() else {
        return ptr::null_mut();
    };

    PROFILER
        .tracked_allocate(AllocationKind::AlignedHeap, size, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.aligned_alloc)(alignment, size) })
        })
        .finish()
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    let Some(real) = real::functions() else {
        return ptr::null_mut();
    };

    PROFILER
        .tracked_allocate(AllocationKind::AlignedHeap, size, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.memalign)(alignment, size) })
        })
        .finish()
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    let Some(real) = real::functions() else {
        return ptr::null_mut();
    };

    PROFILER
        .tracked_allocate(AllocationKind::AlignedHeap, size, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.valloc)(size) })
        })
        .finish()
}

/// The requested size is tracked, not the whole pages the C library rounds it up to.
///
/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let Some(real) = real::functions() else {
        return ptr::null_mut();
    };

    PROFILER
        .tracked_allocate(AllocationKind::AlignedHeap, size, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.pvalloc)(size) })
        })
        .finish()
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let Some(real) = real::functions() else {
        // SAFETY: Forwarding the caller's arguments to the kernel.
        return unsafe { raw_mmap(addr, len, prot, flags, fd, offset) };
    };

    if !is_private_anonymous(flags) {
        // SAFETY: Forwarding the caller's arguments.
        return unsafe { (real.mmap)(addr, len, prot, flags, fd, offset) };
    }

    PROFILER
        .tracked_allocate(AllocationKind::AnonymousMapping, len, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| Mapping(unsafe { (real.mmap)(addr, len, prot, flags, fd, offset) }))
        })
        .finish()
        .0
}

/// # Safety
///
/// Same contract as the C library function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: size_t) -> c_int {
    let Some(real) = real::functions() else {
        // SAFETY: Forwarding the caller's arguments to the kernel.
        return unsafe { raw_munmap(addr, len) };
    };

    PROFILER
        .tracked_unmap(addr.addr(), len, || {
            // SAFETY: Forwarding the caller's arguments.
            Call::capture(|| unsafe { (real.munmap)(addr, len) })
        })
        .finish()
}

// Shared and file-backed mappings are not process memory in the sense tracked here.
fn is_private_anonymous(flags: c_int) -> bool {
    let wanted = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
    flags & wanted == wanted
}

// Arena blocks are never freed, but the caller is done with this one. The contents move
// to a block from the C library, which is tracked like any new allocation.
unsafe fn move_out_of_arena(old: *mut c_void, size: size_t) -> *mut c_void {
    // SAFETY: The caller guarantees `old` came from the arena.
    let old_size = unsafe { ARENA.size_of(old.cast_const().cast()) };

    // SAFETY: Plain allocation.
    let new = unsafe { malloc(size) };
    if !new.is_null() {
        // SAFETY: Both blocks are valid for the copied length and do not overlap.
        unsafe {
            ptr::copy_nonoverlapping(old.cast::<u8>(), new.cast::<u8>(), old_size.min(size));
        }
    }

    new
}

unsafe fn raw_mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    // SAFETY: Forwarding the caller's arguments to the kernel.
    let result = unsafe { libc::syscall(libc::SYS_mmap, addr, len, prot, flags, fd, offset) };

    usize::try_from(result).map_or(libc::MAP_FAILED, ptr::with_exposed_provenance_mut)
}

unsafe fn raw_munmap(addr: *mut c_void, len: size_t) -> c_int {
    // SAFETY: Forwarding the caller's arguments to the kernel.
    let result = unsafe { libc::syscall(libc::SYS_munmap, addr, len) };

    if result == -1 { -1 } else { 0 }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::MutexGuard;

    use high_water::{Config, TriggerKind};

    use super::*;
    use crate::serial;

    fn session() -> MutexGuard<'static, ()> {
        let serial = serial();

        PROFILER
            .start_session(
                Config::builder()
                    .native_stacks(false)
                    .emergency_reserve_bytes(0)
                    .report_on_out_of_memory(false)
                    .build(),
            )
            .unwrap();

        serial
    }

    #[test]
    fn heap_functions_are_tracked() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let a = malloc(100);
            let b = calloc(10, 30);
            let a = realloc(a, 1000);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 1300);

            free(a);
            free(b);
        }

        let usage = PROFILER.usage().unwrap();
        assert_eq!(usage.current_bytes(), 0);
        assert_eq!(usage.peak_bytes(), 1300);
        PROFILER.end_session().unwrap();
    }

    #[test]
    fn aligned_functions_are_tracked() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let mut a = ptr::null_mut();
            assert_eq!(posix_memalign(&raw mut a, 64, 128), 0);
            let b = aligned_alloc(64, 256);
            let c = memalign(4096, 512);
            assert_eq!(a as usize % 64, 0);
            assert_eq!(c as usize % 4096, 0);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 896);

            free(a);
            free(b);
            free(c);
        }

        assert_eq!(PROFILER.usage().unwrap().current_bytes(), 0);
        PROFILER.end_session().unwrap();
    }

    #[test]
    fn reallocarray_resizes_like_realloc() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let a = malloc(100);
            let a = reallocarray(a, 10, 40);
            assert!(!a.is_null());
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 400);
            assert_eq!(PROFILER.usage().unwrap().live_allocations(), 1);

            let unchanged = reallocarray(a, usize::MAX, 2);
            assert!(unchanged.is_null());
            assert_eq!(*libc::__errno_location(), libc::ENOMEM);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 400);

            free(a);
        }

        assert_eq!(PROFILER.usage().unwrap().current_bytes(), 0);
        let snapshot = PROFILER.end_session().unwrap();
        assert_eq!(snapshot.trigger(), TriggerKind::Peak);
    }

    #[test]
    fn page_aligned_functions_are_tracked() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let page = usize::try_from(libc::sysconf(libc::_SC_PAGESIZE)).unwrap();
            let a = valloc(100);
            let b = pvalloc(200);
            assert_eq!(a.addr() % page, 0);
            assert_eq!(b.addr() % page, 0);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 300);

            free(a);
            free(b);
        }

        assert_eq!(PROFILER.usage().unwrap().current_bytes(), 0);
        PROFILER.end_session().unwrap();
    }

    #[test]
    fn invalid_alignment_is_not_out_of_memory() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let held = malloc(300);
            let rejected = aligned_alloc(usize::MAX, 64);
            assert!(rejected.is_null());
            assert_ne!(*libc::__errno_location(), libc::ENOMEM);

            let later = malloc(1000);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 1300);

            free(held);
            free(later);
        }

        assert!(PROFILER.disable_reason().is_none());
        let snapshot = PROFILER.end_session().unwrap();
        assert_eq!(snapshot.trigger(), TriggerKind::Peak);
        assert_eq!(snapshot.total_bytes(), 1300);
    }

    #[test]
    fn realloc_to_zero_frees() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let a = malloc(64);
            let rest = realloc(a, 0);
            if !rest.is_null() {
                free(rest);
            }
        }

        assert_eq!(PROFILER.usage().unwrap().current_bytes(), 0);
        PROFILER.end_session().unwrap();
    }

    #[test]
    fn anonymous_mappings_are_tracked_and_partially_unmapped() {
        let _session = session();
        let page = 4096;

        // SAFETY: Mapping fresh memory and unmapping it again.
        unsafe {
            let start = mmap(
                ptr::null_mut(),
                4 * page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(start, libc::MAP_FAILED);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 4 * 4096);

            assert_eq!(munmap(start.cast::<u8>().add(page).cast(), page), 0);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 3 * 4096);

            assert_eq!(munmap(start, 4 * page), 0);
        }

        assert_eq!(PROFILER.usage().unwrap().current_bytes(), 0);
        PROFILER.end_session().unwrap();
    }

    #[test]
    fn shared_mappings_are_not_tracked() {
        let _session = session();

        // SAFETY: Mapping fresh memory and unmapping it again.
        unsafe {
            let start = mmap(
                ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(start, libc::MAP_FAILED);
            assert_eq!(PROFILER.usage().unwrap().current_bytes(), 0);
            assert_eq!(munmap(start, 4096), 0);
        }

        PROFILER.end_session().unwrap();
    }

    #[test]
    fn exhausted_heap_freezes_out_of_memory_state() {
        let _session = session();

        // SAFETY: Plain C allocation calls on blocks we own.
        unsafe {
            let held = malloc(300);
            let impossible = malloc(usize::MAX / 2);
            assert!(impossible.is_null());
            assert_eq!(*libc::__errno_location(), libc::ENOMEM);
            free(held);
        }

        let snapshot = PROFILER.end_session().unwrap();
        assert_eq!(snapshot.trigger(), TriggerKind::OutOfMemory);
        assert_eq!(snapshot.total_bytes(), 300);
    }

    #[test]
    fn private_anonymous_flags() {
        assert!(is_private_anonymous(libc::MAP_PRIVATE | libc::MAP_ANONYMOUS));
        assert!(!is_private_anonymous(libc::MAP_SHARED | libc::MAP_ANONYMOUS));
        assert!(!is_private_anonymous(libc::MAP_PRIVATE));
    }
}
