//! Determines which call stack an allocation is attributed to, and turns interned stacks
//! back into reportable frames.

use crate::config::Config;
use crate::frame::{Frame, FrameDescriptor, FunctionTable, NativeFrame};
use crate::interner::{StackId, StackInterner};
use crate::native::{NativeCapture, Symbolizer, UNBOUNDED};
use crate::{DisableReason, shadow_stack};

/// Symbol prefixes of the machinery between an allocation call and the stack capture.
/// Native stacks are trimmed of these innermost frames when reported.
const ENGINE_SYMBOL_PREFIXES: &[&str] = &[
    "high_water::",
    "<high_water::",
    "high_water_preload::",
    "backtrace::",
    "__rustc::",
    "__rust_alloc",
    "__rust_dealloc",
    "__rust_realloc",
    "__rdl_",
    "_Unwind_",
    "alloc::alloc::",
    "std::alloc::",
];

/// Interns the call stack of the current thread.
///
/// The stack is the interpreter frames followed, if native capture is enabled, by the
/// native frames entered since the innermost interpreter call. Without interpreter frames
/// on this thread it is the whole native stack.
pub(crate) fn current_stack(
    interner: &mut StackInterner,
    config: &Config,
) -> Result<StackId, DisableReason> {
    let entry = shadow_stack::with_current(|stack| stack.innermost_entry()).flatten();

    let mut capture = NativeCapture::new();
    if config.native_stacks() {
        capture.capture(
            config.skip_native_frames(),
            config.max_native_frames(),
            entry.unwrap_or(UNBOUNDED),
        );
    }

    if entry.is_some() {
        let merged = shadow_stack::with_current(|stack| {
            stack.with_native_frames(capture.frames(), |frames| interner.intern(frames))
        });

        if let Some(result) = merged {
            return result;
        }
    }

    interner.intern(capture.frames())
}

/// Resolves interned frames into reportable frames.
#[derive(Debug)]
pub(crate) struct Describer<'a> {
    functions: &'a FunctionTable,
    symbolizer: &'a mut Symbolizer,
}

impl<'a> Describer<'a> {
    pub(crate) fn new(functions: &'a FunctionTable, symbolizer: &'a mut Symbolizer) -> Self {
        Self {
            functions,
            symbolizer,
        }
    }

    /// Describes a whole stack, outermost frame first.
    pub(crate) fn describe_stack(&mut self, frames: &[Frame]) -> Vec<FrameDescriptor> {
        let mut described = frames.iter().map(|f| self.describe(*f)).collect();
        trim_engine_frames(&mut described);
        described
    }

    fn describe(&mut self, frame: Frame) -> FrameDescriptor {
        match frame {
            Frame::Interpreted { function, line } => self.functions.describe(function, line),
            Frame::Native { address } => self.symbolizer.describe(address),
        }
    }
}

fn trim_engine_frames(frames: &mut Vec<FrameDescriptor>) {
    while frames.last().is_some_and(is_engine_frame) {
        frames.pop();
    }
}

fn is_engine_frame(frame: &FrameDescriptor) -> bool {
    match frame {
        FrameDescriptor::Native(NativeFrame::Resolved { symbol, .. }) => ENGINE_SYMBOL_PREFIXES
            .iter()
            .any(|prefix| symbol.starts_with(prefix)),
        _ => false,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::frame::{FunctionId, NativeLanguage};

    fn native(symbol: &str) -> FrameDescriptor {
        FrameDescriptor::Native(NativeFrame::Resolved {
            symbol: symbol.to_string(),
            file: None,
            line: None,
            language: NativeLanguage::Rust,
        })
    }

    fn stack_within_call(entry: usize, config: &Config) -> Vec<Frame> {
        let mut interner = StackInterner::new();

        shadow_stack::with_current(|s| s.start_call(FunctionId::from_u32(0), 0, 3, entry))
            .unwrap();
        let id = current_stack(&mut interner, config).unwrap();
        shadow_stack::with_current(|s| s.finish_call()).unwrap();

        interner.stacks()[id.index()].to_vec()
    }

    #[test]
    fn interpreter_frames_only_without_native_capture() {
        let config = Config::builder().native_stacks(false).build();

        let frames = stack_within_call(UNBOUNDED, &config);

        assert_eq!(
            frames,
            vec![Frame::Interpreted {
                function: FunctionId::from_u32(0),
                line: 3
            }]
        );
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot walk native stacks")]
    fn native_frames_follow_interpreter_frames() {
        let config = Config::builder()
            .native_stacks(true)
            .max_native_frames(8)
            .build();

        // Every native frame is below an entry at the top of the address space.
        let frames = stack_within_call(UNBOUNDED, &config);

        assert!(frames.len() > 1);
        assert!(matches!(frames[0], Frame::Interpreted { line: 3, .. }));
        assert!(
            frames[1..]
                .iter()
                .all(|f| matches!(f, Frame::Native { .. }))
        );
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot walk native stacks")]
    fn native_frames_outside_the_call_are_left_out() {
        let config = Config::builder().native_stacks(true).build();

        // Nothing on the machine stack is below address zero.
        let frames = stack_within_call(0, &config);

        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Interpreted { .. }));
    }

    #[test]
    fn empty_stack_without_native_capture() {
        let mut interner = StackInterner::new();
        let config = Config::builder().native_stacks(false).build();

        let id = current_stack(&mut interner, &config).unwrap();

        assert!(interner.stacks()[id.index()].is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot walk native stacks")]
    fn native_capture_when_no_interpreter_frames() {
        let mut interner = StackInterner::new();
        let config = Config::builder()
            .native_stacks(true)
            .max_native_frames(8)
            .build();

        let id = current_stack(&mut interner, &config).unwrap();

        let stacks = interner.stacks();
        let frames = stacks[id.index()];
        assert!(!frames.is_empty());
        assert!(frames.len() <= 8);
        assert!(frames.iter().all(|f| matches!(f, Frame::Native { .. })));
    }

    #[test]
    fn engine_frames_are_trimmed_from_the_inner_end_only() {
        let stack = [
            native("backtrace::outer_caller_named_oddly"),
            native("app::main"),
            native("app::load"),
            native("high_water::profiler::Profiler::tracked_allocate"),
            native("backtrace::backtrace::trace"),
        ];

        let mut trimmed = stack.to_vec();
        trim_engine_frames(&mut trimmed);

        assert_eq!(trimmed.len(), 3);
        assert_eq!(trimmed.last(), Some(&native("app::load")));
    }

    #[test]
    fn describe_stack_resolves_interpreted_frames() {
        let mut functions = FunctionTable::new();
        let load = functions.register("load", "etl.py").unwrap();
        let mut symbolizer = Symbolizer::new();
        let mut describer = Describer::new(&functions, &mut symbolizer);

        let described = describer.describe_stack(&[Frame::Interpreted {
            function: load,
            line: 7,
        }]);

        assert_eq!(described.len(), 1);
        assert_eq!(described[0].to_string(), "etl.py:7 (load)");
    }
}
