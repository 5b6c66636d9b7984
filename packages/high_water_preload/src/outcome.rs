//! Results of C library calls, carried together with the `errno` they left behind.
//!
//! The profiler does its bookkeeping between the C library call and the return to the
//! program, and that bookkeeping may clobber `errno`. Capturing it right after the call
//! and restoring it on the way out keeps the program's view of the call unchanged.

use high_water::{AllocationHandle, AllocationOutcome, AllocationResult};
use libc::{c_int, c_void};

/// The result of a C library call plus the `errno` right after it.
pub(crate) struct Call<T> {
    value: T,
    errno: c_int,
}

impl<T> Call<T> {
    #[inline]
    pub(crate) fn capture(call: impl FnOnce() -> T) -> Self {
        let value = call();

        Self {
            value,
            errno: errno(),
        }
    }

    /// Restores `errno` and hands back the result of the call.
    #[inline]
    pub(crate) fn finish(self) -> T {
        set_errno(self.errno);
        self.value
    }
}

// A null result only means exhaustion if the C library said so. Invalid alignments and
// the like fail with other codes.
impl AllocationResult for Call<*mut c_void> {
    fn outcome(&self, size: usize) -> AllocationOutcome {
        match self.value.outcome(size) {
            AllocationOutcome::OutOfMemory if self.errno != libc::ENOMEM => {
                AllocationOutcome::Failed
            }
            outcome => outcome,
        }
    }
}

/// What `mmap()` returned.
pub(crate) struct Mapping(pub(crate) *mut c_void);

impl AllocationResult for Call<Mapping> {
    fn outcome(&self, _size: usize) -> AllocationOutcome {
        if self.value.0 != libc::MAP_FAILED {
            AllocationOutcome::Allocated(AllocationHandle::from_ptr(self.value.0))
        } else if self.errno == libc::ENOMEM {
            AllocationOutcome::OutOfMemory
        } else {
            AllocationOutcome::Failed
        }
    }
}

/// What `posix_memalign()` returned: an error code, with the memory written through the
/// out parameter on success.
pub(crate) struct Aligned {
    pub(crate) code: c_int,
    pub(crate) ptr: *mut c_void,
}

impl AllocationResult for Call<Aligned> {
    fn outcome(&self, size: usize) -> AllocationOutcome {
        match self.value.code {
            0 => self.value.ptr.outcome(size),
            libc::ENOMEM => AllocationOutcome::OutOfMemory,
            _ => AllocationOutcome::Failed,
        }
    }
}

fn errno() -> c_int {
    // SAFETY: The C library always returns a valid pointer to this thread's errno.
    unsafe { *libc::__errno_location() }
}

pub(crate) fn set_errno(value: c_int) {
    // SAFETY: The C library always returns a valid pointer to this thread's errno.
    unsafe {
        *libc::__errno_location() = value;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr;

    use super::*;

    #[test]
    fn errno_is_restored_on_finish() {
        let call = Call::capture(|| {
            set_errno(libc::ENOMEM);
            ptr::null_mut::<c_void>()
        });

        set_errno(0);
        let value = call.finish();

        assert!(value.is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }

    #[test]
    fn null_heap_pointer_is_out_of_memory_unless_zero_sized() {
        let call = Call::capture(|| {
            set_errno(libc::ENOMEM);
            ptr::null_mut::<c_void>()
        });

        assert_eq!(call.outcome(16), AllocationOutcome::OutOfMemory);
        assert_eq!(call.outcome(0), AllocationOutcome::Failed);
    }

    #[test]
    fn null_heap_pointer_with_invalid_argument_is_plain_failure() {
        let call = Call::capture(|| {
            set_errno(libc::EINVAL);
            ptr::null_mut::<c_void>()
        });

        assert_eq!(call.outcome(64), AllocationOutcome::Failed);
    }

    #[test]
    fn failed_mapping_is_classified_by_errno() {
        let enomem = Call::capture(|| {
            set_errno(libc::ENOMEM);
            Mapping(libc::MAP_FAILED)
        });
        let einval = Call::capture(|| {
            set_errno(libc::EINVAL);
            Mapping(libc::MAP_FAILED)
        });
        let mapped = Call::capture(|| Mapping(ptr::without_provenance_mut(0x7000)));

        assert_eq!(enomem.outcome(4096), AllocationOutcome::OutOfMemory);
        assert_eq!(einval.outcome(4096), AllocationOutcome::Failed);
        assert_eq!(
            mapped.outcome(4096),
            AllocationOutcome::Allocated(AllocationHandle::new(0x7000))
        );
    }

    #[test]
    fn posix_memalign_error_codes() {
        let ok = Call::capture(|| Aligned {
            code: 0,
            ptr: ptr::without_provenance_mut(0x1000),
        });
        let enomem = Call::capture(|| Aligned {
            code: libc::ENOMEM,
            ptr: ptr::null_mut(),
        });
        let einval = Call::capture(|| Aligned {
            code: libc::EINVAL,
            ptr: ptr::null_mut(),
        });

        assert_eq!(
            ok.outcome(64),
            AllocationOutcome::Allocated(AllocationHandle::new(0x1000))
        );
        assert_eq!(enomem.outcome(64), AllocationOutcome::OutOfMemory);
        assert_eq!(einval.outcome(64), AllocationOutcome::Failed);
    }
}
