//! Tracked anonymous memory mappings.
//!
//! Large buffers are often obtained straight from the OS instead of the heap. Mapping them
//! through these functions attributes them to the current call stack like any heap
//! allocation. Unmapping part of a mapping keeps the rest of it tracked.

use std::ptr::NonNull;

#[cfg(unix)]
use crate::AllocationKind;
#[cfg(unix)]
use crate::pal::{Bindings, BindingsFacade};
use crate::{Profiler, Result};

/// Maps `len` bytes of private anonymous read/write memory, tracked by `profiler`.
///
/// If the OS refuses for lack of memory, the out-of-memory snapshot is taken before the
/// error is returned.
///
/// # Errors
///
/// Returns [`Error::Io`][crate::Error::Io] with the OS error if the mapping fails and
/// [`Error::UnsupportedPlatform`][crate::Error::UnsupportedPlatform] on platforms without
/// memory mapping support.
pub fn map_anonymous(profiler: &Profiler, len: usize) -> Result<NonNull<u8>> {
    #[cfg(unix)]
    {
        map_anonymous_with(&BindingsFacade::target(), profiler, len)
    }

    #[cfg(not(unix))]
    {
        _ = (profiler, len);
        Err(unsupported())
    }
}

/// Unmaps `len` bytes starting at `start`, which may cover all or part of one or more
/// mappings created through [`map_anonymous()`].
///
/// # Errors
///
/// Returns [`Error::Io`][crate::Error::Io] with the OS error if unmapping fails and
/// [`Error::UnsupportedPlatform`][crate::Error::UnsupportedPlatform] on platforms without
/// memory mapping support.
///
/// # Safety
///
/// The range must be mapped memory that nothing refers to any more.
pub unsafe fn unmap(profiler: &Profiler, start: NonNull<u8>, len: usize) -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: Forwarding the caller's guarantee.
        unsafe { unmap_with(&BindingsFacade::target(), profiler, start, len) }
    }

    #[cfg(not(unix))]
    {
        _ = (profiler, start, len);
        Err(unsupported())
    }
}

#[cfg(unix)]
fn map_anonymous_with(
    bindings: &BindingsFacade,
    profiler: &Profiler,
    len: usize,
) -> Result<NonNull<u8>> {
    Ok(profiler.tracked_allocate(AllocationKind::AnonymousMapping, len, || {
        bindings.mmap_anonymous(len)
    })?)
}

#[cfg(unix)]
unsafe fn unmap_with(
    bindings: &BindingsFacade,
    profiler: &Profiler,
    start: NonNull<u8>,
    len: usize,
) -> Result<()> {
    // SAFETY: Forwarding the caller's guarantee.
    Ok(profiler.tracked_unmap(start.addr().get(), len, || unsafe {
        bindings.munmap(start, len)
    })?)
}

#[cfg(not(unix))]
fn unsupported() -> crate::Error {
    crate::Error::UnsupportedPlatform {
        feature: "anonymous memory mapping",
    }
}
