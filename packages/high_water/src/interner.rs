//! Interning of call stacks into compact identifiers.

use foldhash::{HashMap, HashMapExt};

use crate::DisableReason;
use crate::frame::Frame;

/// Identifies an interned call stack within one session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct StackId(u32);

impl StackId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) const fn from_index(index: u32) -> Self {
        Self(index)
    }
}

/// Assigns each distinct frame sequence a [`StackId`].
///
/// Lookups borrow the caller's frame slice, so memory is only allocated the first time a
/// given stack is seen. All allocation is fallible; running out of memory here is
/// reported to the caller instead of aborting the process.
#[derive(Debug, Default)]
pub(crate) struct StackInterner {
    ids: HashMap<Box<[Frame]>, StackId>,
}

impl StackInterner {
    pub(crate) fn new() -> Self {
        Self {
            ids: HashMap::new(),
        }
    }

    pub(crate) fn intern(&mut self, frames: &[Frame]) -> Result<StackId, DisableReason> {
        if let Some(id) = self.ids.get(frames) {
            return Ok(*id);
        }

        let id = u32::try_from(self.ids.len())
            .map(StackId)
            .map_err(|_| DisableReason::TooManyStacks)?;

        let mut owned = Vec::new();
        owned
            .try_reserve_exact(frames.len())
            .map_err(|_| DisableReason::BookkeepingExhausted)?;
        owned.extend_from_slice(frames);

        self.ids
            .try_reserve(1)
            .map_err(|_| DisableReason::BookkeepingExhausted)?;
        self.ids.insert(owned.into_boxed_slice(), id);

        Ok(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Every interned stack, indexed by [`StackId::index()`].
    pub(crate) fn stacks(&self) -> Vec<&[Frame]> {
        let empty: &[Frame] = &[];
        let mut stacks = vec![empty; self.ids.len()];

        for (frames, id) in &self.ids {
            if let Some(slot) = stacks.get_mut(id.index()) {
                *slot = &**frames;
            }
        }

        stacks
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::frame::FunctionId;

    fn interpreted(function: u32, line: u32) -> Frame {
        Frame::Interpreted {
            function: FunctionId::from_u32(function),
            line,
        }
    }

    #[test]
    fn identical_stacks_share_id() {
        let mut interner = StackInterner::new();
        let stack = [interpreted(1, 2), interpreted(3, 4)];

        let first = interner.intern(&stack).unwrap();
        let second = interner
            .intern(&[interpreted(1, 2), interpreted(3, 4)])
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn different_lines_are_different_stacks() {
        let mut interner = StackInterner::new();

        let a = interner.intern(&[interpreted(1, 2)]).unwrap();
        let b = interner.intern(&[interpreted(1, 3)]).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn order_matters() {
        let mut interner = StackInterner::new();

        let a = interner
            .intern(&[interpreted(1, 1), interpreted(2, 2)])
            .unwrap();
        let b = interner
            .intern(&[interpreted(2, 2), interpreted(1, 1)])
            .unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn empty_stack_is_a_stack() {
        let mut interner = StackInterner::new();

        let empty = interner.intern(&[]).unwrap();

        assert_eq!(interner.intern(&[]).unwrap(), empty);
        assert_eq!(interner.stacks(), vec![&[] as &[Frame]]);
    }

    #[test]
    fn stacks_are_indexed_by_id() {
        let mut interner = StackInterner::new();
        let native = [Frame::Native { address: 0x1000 }];
        let mixed = [interpreted(7, 1), Frame::Native { address: 0x2000 }];

        let native_id = interner.intern(&native).unwrap();
        let mixed_id = interner.intern(&mixed).unwrap();

        let stacks = interner.stacks();
        assert_eq!(stacks[native_id.index()], &native);
        assert_eq!(stacks[mixed_id.index()], &mixed);
    }
}
