//! Per-thread mirror of the interpreter call stack.
//!
//! The interpreter integration reports every call and return; the allocation hooks only
//! ever read the current contents, so attributing an allocation to interpreter frames
//! never requires walking the hardware stack.

use std::cell::RefCell;

use crate::DisableReason;
use crate::frame::{Frame, FunctionId};

thread_local! {
    static SHADOW_STACK: RefCell<ShadowStack> = const { RefCell::new(ShadowStack::new()) };
}

/// Interpreter frames of one thread, outermost first.
#[derive(Debug, Default)]
pub(crate) struct ShadowStack {
    frames: Vec<Frame>,

    // Per frame, the machine stack address at which the interpreter entered it.
    entries: Vec<usize>,
}

impl ShadowStack {
    pub(crate) const fn new() -> Self {
        Self {
            frames: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Enters `function`, currently executing `line`.
    ///
    /// A non-zero `parent_line` is the line of the caller that made the call, which
    /// replaces whatever line the caller last reported. `entry` is the machine stack
    /// address at which the interpreter made the call. Native frames deeper than that
    /// belong to code the function called.
    pub(crate) fn start_call(
        &mut self,
        function: FunctionId,
        parent_line: u32,
        line: u32,
        entry: usize,
    ) {
        if parent_line != 0 {
            self.set_current_line(parent_line);
        }

        self.frames.push(Frame::Interpreted { function, line });
        self.entries.push(entry);
    }

    /// Leaves the innermost frame. Returns whether there was a frame to leave.
    pub(crate) fn finish_call(&mut self) -> bool {
        self.entries.pop();
        self.frames.pop().is_some()
    }

    /// The machine stack address at which the innermost frame was entered.
    pub(crate) fn innermost_entry(&self) -> Option<usize> {
        self.entries.last().copied()
    }

    /// Runs `f` on the interpreter frames followed by `native`, without copying the
    /// interpreter frames.
    pub(crate) fn with_native_frames<R>(
        &mut self,
        native: &[Frame],
        f: impl FnOnce(&[Frame]) -> Result<R, DisableReason>,
    ) -> Result<R, DisableReason> {
        if native.is_empty() {
            return f(&self.frames);
        }

        self.frames
            .try_reserve(native.len())
            .map_err(|_| DisableReason::BookkeepingExhausted)?;

        let interpreted = self.frames.len();
        self.frames.extend_from_slice(native);
        let result = f(&self.frames);
        self.frames.truncate(interpreted);

        result
    }

    /// Updates the line executing in the innermost frame.
    pub(crate) fn set_current_line(&mut self, new_line: u32) {
        if let Some(Frame::Interpreted { line, .. }) = self.frames.last_mut() {
            *line = new_line;
        }
    }

    pub(crate) fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Runs `f` against this thread's shadow stack.
///
/// Returns `None` if the thread-local storage is already torn down or the stack is
/// already borrowed further up the current call chain.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut ShadowStack) -> R) -> Option<R> {
    SHADOW_STACK
        .try_with(|stack| stack.try_borrow_mut().ok().map(|mut stack| f(&mut *stack)))
        .ok()
        .flatten()
}
