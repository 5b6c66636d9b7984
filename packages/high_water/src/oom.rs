//! Recognizing allocation failures caused by memory exhaustion.

use std::io;
use std::ptr::{self, NonNull};

use crate::AllocationHandle;

/// How an underlying allocation call ended, from the profiler's point of view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocationOutcome {
    /// Memory was obtained at the given address.
    Allocated(AllocationHandle),

    /// The call failed because memory is exhausted.
    OutOfMemory,

    /// The call failed for another reason (invalid arguments and the like).
    Failed,
}

/// Results of underlying allocation calls that the profiler can interpret.
///
/// Implemented for raw pointers (null means failure) and for the result types of the
/// mapping wrappers. Implement it for your own types to pass them through
/// [`Profiler::tracked_allocate()`][crate::Profiler::tracked_allocate].
pub trait AllocationResult {
    /// Classifies the result of a call that requested `size` bytes.
    fn outcome(&self, size: usize) -> AllocationOutcome;
}

impl<T> AllocationResult for *mut T {
    fn outcome(&self, size: usize) -> AllocationOutcome {
        if !self.is_null() {
            AllocationOutcome::Allocated(AllocationHandle::from_ptr(self.cast_const()))
        } else if size == 0 {
            // Null is a legitimate answer to a zero-byte request.
            AllocationOutcome::Failed
        } else {
            AllocationOutcome::OutOfMemory
        }
    }
}

impl<T> AllocationResult for Option<NonNull<T>> {
    fn outcome(&self, size: usize) -> AllocationOutcome {
        self.map_or(ptr::null_mut(), NonNull::as_ptr).outcome(size)
    }
}

impl<T> AllocationResult for io::Result<NonNull<T>> {
    fn outcome(&self, _size: usize) -> AllocationOutcome {
        match self {
            Ok(ptr) => AllocationOutcome::Allocated(AllocationHandle::from_ptr(ptr.as_ptr())),
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory || is_enomem(e) => {
                AllocationOutcome::OutOfMemory
            }
            Err(_) => AllocationOutcome::Failed,
        }
    }
}

#[cfg(unix)]
fn is_enomem(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ENOMEM)
}

#[cfg(not(unix))]
fn is_enomem(_error: &io::Error) -> bool {
    false
}

/// Memory set aside at session start and given back right before an out-of-memory
/// snapshot is built, so that building and writing the report has room to work.
#[derive(Debug, Default)]
pub(crate) struct EmergencyReserve {
    memory: Vec<u8>,
}

impl EmergencyReserve {
    /// Reserves `bytes`. Reserving less (or nothing) when memory is already scarce is
    /// not an error.
    pub(crate) fn new(bytes: usize) -> Self {
        let mut memory = Vec::new();

        if memory.try_reserve_exact(bytes).is_err() {
            tracing::warn!(bytes, "could not set aside emergency memory reserve");
        }

        Self { memory }
    }

    pub(crate) fn bytes(&self) -> usize {
        self.memory.capacity()
    }

    pub(crate) fn release(&mut self) {
        self.memory = Vec::new();
    }
}
