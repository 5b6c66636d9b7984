//! Session state: the ledger, per-stack usage and the retained snapshot, kept consistent
//! with each other across every allocation event.

use std::time::SystemTime;

use crate::DisableReason;
use crate::call_tree::CallTreeNode;
use crate::config::Config;
#[cfg(test)]
use crate::frame::Frame;
use crate::frame::FunctionTable;
use crate::interner::{StackId, StackInterner};
use crate::ledger::{AllocationHandle, AllocationKind, Ledger};
use crate::native::Symbolizer;
use crate::oom::EmergencyReserve;
use crate::resolver::{self, Describer};
use crate::snapshot::{Moment, PeakSnapshot, Retained, SnapshotStore, TriggerKind};
use crate::usage::{UsageStats, UsageTracker};

/// Whether a session still records allocation events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Status {
    Tracking,

    /// An allocation failed for lack of memory. The state at that moment is frozen.
    OutOfMemory,

    /// Bookkeeping failed. The state at that moment is frozen.
    Disabled(DisableReason),
}

/// All tracking state of one session.
///
/// Every `record_*` method is one allocation event. Events are ignored unless the status
/// is [`Status::Tracking`].
#[derive(Debug)]
pub(crate) struct Tracker {
    config: Config,
    status: Status,
    ledger: Ledger,
    interner: StackInterner,
    usage: UsageTracker,
    store: SnapshotStore,
    symbolizer: Symbolizer,
    reserve: EmergencyReserve,
}

impl Tracker {
    pub(crate) fn new(config: Config) -> Self {
        let reserve = EmergencyReserve::new(config.emergency_reserve_bytes());

        Self {
            config,
            status: Status::Tracking,
            ledger: Ledger::new(),
            interner: StackInterner::new(),
            usage: UsageTracker::new(),
            store: SnapshotStore::new(),
            symbolizer: Symbolizer::new(),
            reserve,
        }
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.status == Status::Tracking
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Interns the current thread's call stack. `None` if events are not being recorded.
    pub(crate) fn current_stack(&mut self) -> Option<StackId> {
        if !self.is_recording() {
            return None;
        }

        match resolver::current_stack(&mut self.interner, &self.config) {
            Ok(stack) => Some(stack),
            Err(reason) => {
                self.disable(reason);
                None
            }
        }
    }

    pub(crate) fn record_allocation(
        &mut self,
        handle: AllocationHandle,
        size: u64,
        kind: AllocationKind,
        stack: StackId,
    ) {
        let replaced = self.ledger.get(handle).map_or(0, |a| a.size);
        let new_total = self
            .usage
            .current_bytes()
            .saturating_sub(replaced)
            .saturating_add(size);

        self.apply(new_total, |ledger, usage| {
            usage.ensure_stack(stack)?;

            if let Some(replaced) = ledger.record(handle, size, stack, kind)? {
                usage.subtract(replaced.stack, replaced.size);
            }

            usage.add(stack, size);
            Ok(())
        });
    }

    pub(crate) fn record_free(&mut self, handle: AllocationHandle) {
        let Some(size) = self.ledger.get(handle).map(|a| a.size) else {
            return;
        };

        let new_total = self.usage.current_bytes().saturating_sub(size);

        self.apply(new_total, |ledger, usage| {
            if let Some(removed) = ledger.remove(handle) {
                usage.subtract(removed.stack, removed.size);
            }

            Ok(())
        });
    }

    /// The block at `old` now lives at `new_handle` with `new_size` bytes and is
    /// attributed to `stack`, the stack of the resizing call.
    pub(crate) fn record_resize(
        &mut self,
        old: AllocationHandle,
        new_handle: AllocationHandle,
        new_size: u64,
        stack: StackId,
    ) {
        let previous = self.ledger.get(old).map_or(0, |a| a.size);
        let displaced = if new_handle == old {
            0
        } else {
            self.ledger.get(new_handle).map_or(0, |a| a.size)
        };
        let new_total = self
            .usage
            .current_bytes()
            .saturating_sub(previous)
            .saturating_sub(displaced)
            .saturating_add(new_size);

        self.apply(new_total, |ledger, usage| {
            usage.ensure_stack(stack)?;

            let resized = ledger.resize(old, new_handle, new_size, stack)?;
            for removed in resized.previous.into_iter().chain(resized.displaced) {
                usage.subtract(removed.stack, removed.size);
            }

            usage.add(stack, new_size);
            Ok(())
        });
    }

    pub(crate) fn record_mapping(&mut self, start: usize, len: usize, stack: StackId) {
        let replaced = self.ledger.mapped_bytes_in(start, len);
        let new_total = self
            .usage
            .current_bytes()
            .saturating_sub(replaced)
            .saturating_add(len as u64);

        self.apply(new_total, |ledger, usage| {
            usage.ensure_stack(stack)?;
            ledger.record_mapping(start, len, stack, |s, bytes| usage.subtract(s, bytes))?;
            usage.add(stack, len as u64);
            Ok(())
        });
    }

    pub(crate) fn record_unmap(&mut self, start: usize, len: usize) {
        let removed = self.ledger.mapped_bytes_in(start, len);
        if removed == 0 {
            return;
        }

        let new_total = self.usage.current_bytes().saturating_sub(removed);

        self.apply(new_total, |ledger, usage| {
            ledger.remove_range(start, len, |s, bytes| usage.subtract(s, bytes))
        });
    }

    /// An underlying allocation failed for lack of memory. Freezes the current state as
    /// the terminal snapshot. Does not allocate.
    ///
    /// Returns `true` if this event is what froze the session.
    pub(crate) fn record_out_of_memory(&mut self) -> bool {
        if !self.is_recording() {
            return false;
        }

        self.store.mark_out_of_memory(Moment {
            at: SystemTime::now(),
            total_bytes: self.usage.current_bytes(),
        });
        self.status = Status::OutOfMemory;
        true
    }

    // Keeps the snapshot store ahead of the mutation: a pending peak is copied out before
    // the first event that does not exceed it, and a new maximum becomes the pending peak.
    fn apply(
        &mut self,
        new_total: u64,
        mutate: impl FnOnce(&mut Ledger, &mut UsageTracker) -> Result<(), DisableReason>,
    ) {
        if !self.is_recording() {
            return;
        }

        if self.store.has_pending() && new_total <= self.usage.peak_bytes() {
            if let Err(reason) = self.store.capture_pending(&self.usage) {
                self.disable(reason);
                return;
            }
        }

        if let Err(reason) = mutate(&mut self.ledger, &mut self.usage) {
            self.disable(reason);
            return;
        }

        debug_assert_eq!(self.usage.current_bytes(), new_total);

        if self.usage.update_peak() {
            self.store.mark_pending(Moment {
                at: SystemTime::now(),
                total_bytes: self.usage.current_bytes(),
            });
        }
    }

    fn disable(&mut self, reason: DisableReason) {
        if self.is_recording() {
            self.status = Status::Disabled(reason);
        }
    }

    pub(crate) fn stats(&self) -> UsageStats {
        UsageStats {
            current_bytes: self.usage.current_bytes(),
            peak_bytes: self.usage.peak_bytes(),
            live_allocations: self.ledger.len(),
            interned_stacks: self.interner.len(),
        }
    }

    /// Builds the retained snapshot: the out-of-memory state if there was one, otherwise
    /// the first state that reached the peak.
    pub(crate) fn peak_snapshot(&mut self, functions: &FunctionTable) -> PeakSnapshot {
        if self.status == Status::OutOfMemory {
            // Building the tree needs memory we may not have.
            self.reserve.release();
        }

        let (moment, trigger, by_stack) = match self.store.retained() {
            Retained::Nothing => return PeakSnapshot::empty(SystemTime::now()),
            Retained::Current { moment, trigger } => (moment, trigger, self.usage.by_stack()),
            Retained::Captured(captured) => {
                (captured.moment, TriggerKind::Peak, captured.by_stack.as_slice())
            }
        };

        let mut describer = Describer::new(functions, &mut self.symbolizer);
        let root = build_tree(&self.interner, by_stack, &mut describer);

        PeakSnapshot::new(moment.at, trigger, moment.total_bytes, root)
    }

    /// Builds a snapshot of what is live right now (frozen state if no longer recording).
    pub(crate) fn current_snapshot(&mut self, functions: &FunctionTable) -> PeakSnapshot {
        let mut describer = Describer::new(functions, &mut self.symbolizer);
        let root = build_tree(&self.interner, self.usage.by_stack(), &mut describer);

        PeakSnapshot::new(
            SystemTime::now(),
            TriggerKind::Requested,
            self.usage.current_bytes(),
            root,
        )
    }

    #[cfg(test)]
    pub(crate) fn intern(&mut self, frames: &[Frame]) -> StackId {
        self.interner.intern(frames).unwrap()
    }

    #[cfg(test)]
    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[cfg(test)]
    pub(crate) fn reserve_bytes(&self) -> usize {
        self.reserve.bytes()
    }
}

fn build_tree(
    interner: &StackInterner,
    by_stack: &[u64],
    describer: &mut Describer<'_>,
) -> CallTreeNode {
    let mut root = CallTreeNode::root();

    for (frames, bytes) in interner.stacks().into_iter().zip(by_stack) {
        if *bytes > 0 {
            root.add_stack(describer.describe_stack(frames), *bytes);
        }
    }

    root
}
