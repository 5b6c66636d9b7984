//! The set of live allocations and the stacks they are attributed to.

use foldhash::{HashMap, HashMapExt};

use crate::DisableReason;
use crate::interner::StackId;

/// Identifies a live allocation: its address.
///
/// Unique among live allocations. The same value may be reused once the allocation it
/// identified has been released.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AllocationHandle(usize);

impl AllocationHandle {
    /// Creates a handle from an address.
    #[must_use]
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    /// Creates a handle from a pointer.
    #[must_use]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<u8>().addr())
    }

    /// The address this handle stands for.
    #[must_use]
    pub const fn address(self) -> usize {
        self.0
    }
}

/// The allocation API through which memory was obtained.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AllocationKind {
    /// General-purpose heap memory (`malloc`, `calloc`, `realloc`, `GlobalAlloc::alloc`).
    Heap,

    /// Heap memory with stricter alignment than the allocator guarantees by default
    /// (`posix_memalign`, `aligned_alloc`, `memalign`, `valloc`, over-aligned `GlobalAlloc`
    /// layouts).
    AlignedHeap,

    /// Anonymous private memory mappings (`mmap` with `MAP_ANONYMOUS`).
    AnonymousMapping,

    /// Objects allocated by an interpreter's own allocator and reported to the profiler.
    InterpreterObject,
}

/// One live allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LiveAllocation {
    pub(crate) handle: AllocationHandle,
    pub(crate) size: u64,
    pub(crate) stack: StackId,
    pub(crate) kind: AllocationKind,
}

/// The entries a [`Ledger::resize()`] took out of the ledger.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Resized {
    /// The block as it was before the resize, if it was tracked.
    pub(crate) previous: Option<LiveAllocation>,

    /// A different allocation that was recorded at the new address.
    pub(crate) displaced: Option<LiveAllocation>,
}

/// Part of an anonymous mapping. Partial unmapping splits one range into up to two.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct MappedRange {
    start: usize,
    len: usize,
    stack: StackId,
}

impl MappedRange {
    fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }
}

/// Live allocations of a session.
///
/// Every mutating operation either applies completely or, if bookkeeping memory cannot be
/// obtained, leaves the ledger untouched and reports why.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    allocations: HashMap<AllocationHandle, LiveAllocation>,

    // Sorted by start address, never overlapping.
    mappings: Vec<MappedRange>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self {
            allocations: HashMap::new(),
            mappings: Vec::new(),
        }
    }

    /// Records a heap or interpreter object allocation, replacing any entry with the same
    /// handle. The replaced entry is returned.
    pub(crate) fn record(
        &mut self,
        handle: AllocationHandle,
        size: u64,
        stack: StackId,
        kind: AllocationKind,
    ) -> Result<Option<LiveAllocation>, DisableReason> {
        debug_assert!(kind != AllocationKind::AnonymousMapping);

        self.allocations
            .try_reserve(1)
            .map_err(|_| DisableReason::BookkeepingExhausted)?;

        Ok(self.allocations.insert(
            handle,
            LiveAllocation {
                handle,
                size,
                stack,
                kind,
            },
        ))
    }

    /// Forgets an allocation. Unknown handles are ignored.
    pub(crate) fn remove(&mut self, handle: AllocationHandle) -> Option<LiveAllocation> {
        let removed = self.allocations.remove(&handle);
        debug_assert!(removed.is_none_or(|a| a.handle == handle));
        removed
    }

    /// Replaces the allocation at `old` with one at `new_handle` of `new_size`, attributed to
    /// `stack`.
    ///
    /// The kind of the old allocation carries over. An untracked `old` is recorded as a
    /// fresh heap allocation. A stale entry already at `new_handle` (its release was never
    /// observed) is overwritten and reported as displaced.
    pub(crate) fn resize(
        &mut self,
        old: AllocationHandle,
        new_handle: AllocationHandle,
        new_size: u64,
        stack: StackId,
    ) -> Result<Resized, DisableReason> {
        self.allocations
            .try_reserve(1)
            .map_err(|_| DisableReason::BookkeepingExhausted)?;

        let previous = self.allocations.remove(&old);
        let kind = previous.map_or(AllocationKind::Heap, |a| a.kind);

        let displaced = self.allocations.insert(
            new_handle,
            LiveAllocation {
                handle: new_handle,
                size: new_size,
                stack,
                kind,
            },
        );

        Ok(Resized {
            previous,
            displaced,
        })
    }

    pub(crate) fn get(&self, handle: AllocationHandle) -> Option<&LiveAllocation> {
        self.allocations.get(&handle)
    }

    /// Records an anonymous mapping. Any part of an existing mapping it overlaps is
    /// forgotten first, reported through `on_removed` as `(stack, bytes)`.
    pub(crate) fn record_mapping(
        &mut self,
        start: usize,
        len: usize,
        stack: StackId,
        on_removed: impl FnMut(StackId, u64),
    ) -> Result<(), DisableReason> {
        // One slot for a possible split, one for the new range.
        self.mappings
            .try_reserve(2)
            .map_err(|_| DisableReason::BookkeepingExhausted)?;

        self.remove_range_reserved(start, len, on_removed);

        let index = self.mappings.partition_point(|r| r.start < start);
        self.mappings
            .insert(index, MappedRange { start, len, stack });

        Ok(())
    }

    /// Forgets every mapped byte in `start..start + len`, reporting each affected piece
    /// through `on_removed` as `(stack, bytes)`. Ranges only partially covered keep their
    /// remaining bytes and attribution.
    pub(crate) fn remove_range(
        &mut self,
        start: usize,
        len: usize,
        on_removed: impl FnMut(StackId, u64),
    ) -> Result<(), DisableReason> {
        self.mappings
            .try_reserve(1)
            .map_err(|_| DisableReason::BookkeepingExhausted)?;

        self.remove_range_reserved(start, len, on_removed);

        Ok(())
    }

    // Requires spare capacity for one more range.
    fn remove_range_reserved(
        &mut self,
        start: usize,
        len: usize,
        mut on_removed: impl FnMut(StackId, u64),
    ) {
        let end = start.saturating_add(len);
        let mut index = self.mappings.partition_point(|r| r.end() <= start);

        while let Some(range) = self.mappings.get(index).copied() {
            if range.start >= end {
                break;
            }

            let overlap = range.end().min(end).saturating_sub(range.start.max(start));
            on_removed(range.stack, overlap as u64);

            let keeps_head = range.start < start;
            let keeps_tail = range.end() > end;

            match (keeps_head, keeps_tail) {
                (false, false) => {
                    self.mappings.remove(index);
                    continue;
                }
                (true, false) => {
                    if let Some(r) = self.mappings.get_mut(index) {
                        r.len = start.saturating_sub(range.start);
                    }
                }
                (false, true) => {
                    if let Some(r) = self.mappings.get_mut(index) {
                        r.start = end;
                        r.len = range.end().saturating_sub(end);
                    }
                }
                (true, true) => {
                    if let Some(r) = self.mappings.get_mut(index) {
                        r.len = start.saturating_sub(range.start);
                    }

                    index = index.saturating_add(1);
                    self.mappings.insert(
                        index,
                        MappedRange {
                            start: end,
                            len: range.end().saturating_sub(end),
                            stack: range.stack,
                        },
                    );
                }
            }

            index = index.saturating_add(1);
        }
    }

    /// How many mapped bytes lie within `start..start + len`.
    pub(crate) fn mapped_bytes_in(&self, start: usize, len: usize) -> u64 {
        let end = start.saturating_add(len);
        let first = self.mappings.partition_point(|r| r.end() <= start);

        self.mappings
            .get(first..)
            .unwrap_or_default()
            .iter()
            .take_while(|r| r.start < end)
            .map(|r| r.end().min(end).saturating_sub(r.start.max(start)) as u64)
            .sum()
    }

    /// Number of live allocations, counting each mapped range separately.
    pub(crate) fn len(&self) -> usize {
        self.allocations.len().saturating_add(self.mappings.len())
    }

    /// Live bytes per stack, recomputed from scratch.
    #[cfg(test)]
    pub(crate) fn bytes_by_stack(&self) -> HashMap<StackId, u64> {
        let mut totals = HashMap::new();

        for allocation in self.allocations.values() {
            *totals.entry(allocation.stack).or_insert(0) += allocation.size;
        }

        for range in &self.mappings {
            *totals.entry(range.stack).or_insert(0) += range.len as u64;
        }

        totals
    }

    #[cfg(test)]
    pub(crate) fn total_bytes(&self) -> u64 {
        self.bytes_by_stack().values().sum()
    }
}
