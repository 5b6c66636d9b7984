use crate::DisableReason;
use crate::interner::StackId;

/// Point-in-time view of a session's memory usage, from
/// [`Profiler::usage()`][crate::Profiler::usage].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UsageStats {
    pub(crate) current_bytes: u64,
    pub(crate) peak_bytes: u64,
    pub(crate) live_allocations: usize,
    pub(crate) interned_stacks: usize,
}

impl UsageStats {
    /// Bytes currently live.
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// The highest number of bytes live at any time during the session.
    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    /// Number of live tracked allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live_allocations
    }

    /// Number of distinct call stacks seen so far.
    #[must_use]
    pub fn interned_stacks(&self) -> usize {
        self.interned_stacks
    }
}

/// Running totals of live bytes: overall, per stack and the highest total seen.
#[derive(Debug, Default)]
pub(crate) struct UsageTracker {
    current_bytes: u64,
    peak_bytes: u64,

    // Indexed by `StackId::index()`.
    by_stack: Vec<u64>,
}

impl UsageTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub(crate) fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    pub(crate) fn by_stack(&self) -> &[u64] {
        &self.by_stack
    }

    /// Makes room for a per-stack counter of `stack`, so [`add()`][Self::add] cannot fail.
    pub(crate) fn ensure_stack(&mut self, stack: StackId) -> Result<(), DisableReason> {
        let needed = stack.index().saturating_add(1);

        if needed > self.by_stack.len() {
            self.by_stack
                .try_reserve(needed.saturating_sub(self.by_stack.len()))
                .map_err(|_| DisableReason::BookkeepingExhausted)?;
            self.by_stack.resize(needed, 0);
        }

        Ok(())
    }

    /// Requires a preceding [`ensure_stack()`][Self::ensure_stack] for the same stack.
    pub(crate) fn add(&mut self, stack: StackId, bytes: u64) {
        let slot = self.by_stack.get_mut(stack.index());
        debug_assert!(slot.is_some(), "counter for {stack:?} was never reserved");

        if let Some(slot) = slot {
            *slot = slot.saturating_add(bytes);
            self.current_bytes = self.current_bytes.saturating_add(bytes);
        }
    }

    pub(crate) fn subtract(&mut self, stack: StackId, bytes: u64) {
        if let Some(slot) = self.by_stack.get_mut(stack.index()) {
            debug_assert!(*slot >= bytes);
            *slot = slot.saturating_sub(bytes);
            self.current_bytes = self.current_bytes.saturating_sub(bytes);
        }
    }

    /// Raises the peak to the current total if the current total exceeds it.
    /// Returns whether a new peak was reached.
    pub(crate) fn update_peak(&mut self) -> bool {
        if self.current_bytes > self.peak_bytes {
            self.peak_bytes = self.current_bytes;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const A: StackId = StackId::from_index(0);
    const C: StackId = StackId::from_index(2);

    #[test]
    fn add_and_subtract_keep_totals() {
        let mut usage = UsageTracker::new();
        usage.ensure_stack(C).unwrap();

        usage.add(A, 100);
        usage.add(C, 300);
        usage.subtract(A, 100);

        assert_eq!(usage.current_bytes(), 300);
        assert_eq!(usage.by_stack(), &[0, 0, 300]);
    }

    #[test]
    fn ensure_stack_only_grows() {
        let mut usage = UsageTracker::new();
        usage.ensure_stack(C).unwrap();
        usage.ensure_stack(A).unwrap();

        assert_eq!(usage.by_stack().len(), 3);
    }

    #[test]
    fn peak_only_moves_up() {
        let mut usage = UsageTracker::new();
        usage.ensure_stack(A).unwrap();

        usage.add(A, 400);
        assert!(usage.update_peak());

        usage.subtract(A, 100);
        assert!(!usage.update_peak());
        assert_eq!(usage.peak_bytes(), 400);

        usage.add(A, 100);
        assert!(!usage.update_peak(), "equal to the peak is not a new peak");

        usage.add(A, 1);
        assert!(usage.update_peak());
        assert_eq!(usage.peak_bytes(), 401);
    }
}
