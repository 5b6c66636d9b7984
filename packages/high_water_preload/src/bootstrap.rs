//! Memory for allocations made before the C library functions are resolved.
//!
//! Looking up the real `malloc` may itself call `malloc` (or `calloc`). Those early
//! requests are served from a fixed static arena that is never reused or returned.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

// Every block starts with a header recording its size, which keeps the payload aligned
// like `malloc` memory is.
const HEADER_BYTES: usize = 16;

pub(crate) const BOOTSTRAP_ARENA_BYTES: usize = 64 * 1024;

pub(crate) static ARENA: Arena<BOOTSTRAP_ARENA_BYTES> = Arena::new();

#[repr(C, align(16))]
pub(crate) struct Arena<const N: usize> {
    memory: UnsafeCell<[u8; N]>,
    used: AtomicUsize,
}

// SAFETY: Blocks are handed out from disjoint ranges claimed through the atomic cursor.
// Each block's header is written once, by the thread that claimed it, before the block
// is published to the caller.
unsafe impl<const N: usize> Sync for Arena<N> {}

impl<const N: usize> Arena<N> {
    pub(crate) const fn new() -> Self {
        Self {
            memory: UnsafeCell::new([0; N]),
            used: AtomicUsize::new(0),
        }
    }

    /// Claims a zeroed block of `size` bytes, or null if the arena is exhausted.
    pub(crate) fn allocate(&self, size: usize) -> *mut u8 {
        let Some(block) = size
            .checked_add(HEADER_BYTES)
            .and_then(|b| b.checked_next_multiple_of(HEADER_BYTES))
        else {
            return ptr::null_mut();
        };

        let claimed = self.used.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
            used.checked_add(block).filter(|end| *end <= N)
        });

        let Ok(offset) = claimed else {
            return ptr::null_mut();
        };

        // SAFETY: `offset..offset + block` lies within the arena and was claimed by us
        // alone, so the header slot at its start is ours to write.
        let header = unsafe { self.memory.get().cast::<u8>().add(offset) };

        // SAFETY: See above. The slot is in bounds and nobody else can observe it yet.
        unsafe {
            header.cast::<usize>().write_unaligned(size);
        }

        // SAFETY: The payload follows the header within the claimed block.
        unsafe { header.add(HEADER_BYTES) }
    }

    /// Whether `ptr` points into this arena.
    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let start = self.memory.get().addr();
        let address = ptr.addr();

        address >= start && address < start.saturating_add(N)
    }

    /// The size originally requested for the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] on this arena.
    pub(crate) unsafe fn size_of(&self, ptr: *const u8) -> usize {
        // SAFETY: The caller guarantees a header precedes `ptr`, written before the block
        // was handed out and never modified afterwards.
        let header = unsafe { ptr.sub(HEADER_BYTES) };

        // SAFETY: See above.
        unsafe { header.cast::<usize>().read_unaligned() }
    }
}

const _: () = assert!(HEADER_BYTES >= mem::size_of::<usize>());
