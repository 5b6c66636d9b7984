//! Native (compiled code) stack capture and symbolization.
//!
//! Capture happens on the allocation path and must not allocate, so return addresses are
//! written into a caller-provided buffer. Symbolization is expensive and only happens when
//! a snapshot is materialized.

use std::path::Path;
use std::ptr;

use foldhash::{HashMap, HashMapExt};

use crate::config::MAX_NATIVE_FRAMES_LIMIT;
use crate::frame::{Frame, FrameDescriptor, NativeFrame, NativeLanguage};

/// Fixed-capacity buffer for captured native frames, outermost first once finished.
#[derive(Debug)]
pub(crate) struct NativeCapture {
    frames: [Frame; MAX_NATIVE_FRAMES_LIMIT],
    len: usize,
}

impl NativeCapture {
    pub(crate) const fn new() -> Self {
        Self {
            frames: [Frame::Native { address: 0 }; MAX_NATIVE_FRAMES_LIMIT],
            len: 0,
        }
    }

    /// Walks the current thread's stack.
    ///
    /// The `skip` innermost frames are dropped and at most `max_frames` are kept. Frames
    /// closest to the allocation are kept when the stack is deeper than that. The walk
    /// stops at the first frame not below the machine stack address `below`; pass
    /// [`UNBOUNDED`] to walk the whole stack.
    pub(crate) fn capture(&mut self, skip: usize, max_frames: usize, below: usize) {
        let max_frames = max_frames.min(MAX_NATIVE_FRAMES_LIMIT);
        let mut skipped = 0_usize;
        self.len = 0;

        backtrace::trace(|frame| {
            if below != UNBOUNDED && !is_below(frame.sp().addr(), below) {
                return false;
            }

            if skipped < skip {
                skipped = skipped.wrapping_add(1);
                return true;
            }

            let Some(slot) = self.frames.get_mut(self.len) else {
                return false;
            };

            *slot = Frame::Native {
                address: frame.ip().addr(),
            };
            self.len = self.len.wrapping_add(1);

            self.len < max_frames
        });

        // The walk yields innermost first; stacks are stored outermost first.
        self.frames_mut().reverse();
    }

    pub(crate) fn frames(&self) -> &[Frame] {
        self.frames.get(..self.len).unwrap_or_default()
    }

    fn frames_mut(&mut self) -> &mut [Frame] {
        self.frames.get_mut(..self.len).unwrap_or_default()
    }
}

/// Stack bound that keeps every frame.
pub(crate) const UNBOUNDED: usize = usize::MAX;

// The stack grows down on every supported target, so deeper frames have lower addresses.
// Without a known stack pointer the frame cannot be placed and the walk stops.
fn is_below(sp: usize, bound: usize) -> bool {
    sp != 0 && sp < bound
}

/// Resolves return addresses to frame descriptors, remembering earlier answers.
#[derive(Debug)]
pub(crate) struct Symbolizer {
    cache: HashMap<usize, FrameDescriptor>,
}

impl Symbolizer {
    pub(crate) fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    pub(crate) fn describe(&mut self, address: usize) -> FrameDescriptor {
        self.cache
            .entry(address)
            .or_insert_with(|| resolve(address))
            .clone()
    }
}

#[cfg_attr(test, mutants::skip)] // Depends on debug info available at test time.
fn resolve(address: usize) -> FrameDescriptor {
    let mut resolved = None;

    backtrace::resolve(ptr::without_provenance_mut(address), |symbol| {
        if resolved.is_some() {
            // Inlined frames report several symbols; the first is the innermost one.
            return;
        }

        let Some(name) = symbol.name() else {
            return;
        };

        let file = symbol.filename().map(|f| f.display().to_string());
        let language = classify(name.as_str(), symbol.filename());

        resolved = Some(NativeFrame::Resolved {
            // The alternate form leaves out the hash suffix of Rust symbols.
            symbol: format!("{name:#}"),
            file,
            line: symbol.lineno(),
            language,
        });
    });

    FrameDescriptor::Native(resolved.unwrap_or(NativeFrame::Unresolved { address }))
}

/// Guesses the source language of a native frame from its raw (mangled) symbol name and,
/// when debug information is available, the source file extension.
pub(crate) fn classify(mangled: Option<&str>, file: Option<&Path>) -> NativeLanguage {
    if let Some(language) = file
        .and_then(Path::extension)
        .and_then(|e| e.to_str())
        .and_then(language_from_extension)
    {
        return language;
    }

    let Some(mangled) = mangled else {
        return NativeLanguage::Native;
    };

    if mangled.starts_with("_R") || is_legacy_rust_mangling(mangled) {
        NativeLanguage::Rust
    } else if mangled.starts_with("_Z") {
        NativeLanguage::Cpp
    } else if is_fortran_style(mangled) {
        NativeLanguage::Fortran
    } else {
        NativeLanguage::Native
    }
}

fn language_from_extension(extension: &str) -> Option<NativeLanguage> {
    match extension.to_ascii_lowercase().as_str() {
        "rs" => Some(NativeLanguage::Rust),
        "c" | "h" => Some(NativeLanguage::C),
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => Some(NativeLanguage::Cpp),
        "f" | "for" | "f77" | "f90" | "f95" | "f03" | "f08" => Some(NativeLanguage::Fortran),
        _ => None,
    }
}

// Legacy Rust symbols are Itanium-mangled with a trailing `17h<16 hex digits>E` hash.
fn is_legacy_rust_mangling(mangled: &str) -> bool {
    let Some(body) = mangled.strip_prefix("_ZN").and_then(|s| s.strip_suffix('E')) else {
        return false;
    };

    body.len() >= 19
        && body
            .get(body.len().saturating_sub(19)..)
            .is_some_and(|hash| {
                hash.starts_with("17h") && hash.chars().skip(3).all(|c| c.is_ascii_hexdigit())
            })
}

// gfortran and most other Fortran compilers emit lowercase names with a trailing
// underscore for external procedures.
fn is_fortran_style(mangled: &str) -> bool {
    mangled.len() > 1
        && mangled.ends_with('_')
        && !mangled.starts_with('_')
        && mangled
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn extension_wins_over_mangling() {
        assert_eq!(
            classify(Some("_Z3foov"), Some(Path::new("/src/kernel.c"))),
            NativeLanguage::C
        );
        assert_eq!(
            classify(None, Some(Path::new("solver.F90"))),
            NativeLanguage::Fortran
        );
        assert_eq!(
            classify(None, Some(Path::new("lib.rs"))),
            NativeLanguage::Rust
        );
    }

    #[test]
    fn mangling_schemes() {
        assert_eq!(
            classify(Some("_RNvCs1234_7mycrate3foo"), None),
            NativeLanguage::Rust
        );
        assert_eq!(
            classify(Some("_ZN4core3fmt5write17h0123456789abcdefE"), None),
            NativeLanguage::Rust
        );
        assert_eq!(classify(Some("_ZN3foo3barEv"), None), NativeLanguage::Cpp);
        assert_eq!(classify(Some("dgemm_"), None), NativeLanguage::Fortran);
        assert_eq!(classify(Some("malloc"), None), NativeLanguage::Native);
        assert_eq!(classify(None, None), NativeLanguage::Native);
    }

    #[test]
    fn underscore_only_is_not_fortran() {
        assert_eq!(classify(Some("_"), None), NativeLanguage::Native);
        assert_eq!(classify(Some("__libc_start_"), None), NativeLanguage::Native);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot walk native stacks")]
    fn capture_respects_limits() {
        let mut capture = NativeCapture::new();

        capture.capture(0, 3, UNBOUNDED);
        assert!(capture.frames().len() <= 3);
        assert!(!capture.frames().is_empty());

        capture.capture(0, 1, UNBOUNDED);
        assert_eq!(capture.frames().len(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot walk native stacks")]
    fn capture_yields_native_frames_only() {
        let mut capture = NativeCapture::new();

        capture.capture(0, 16, UNBOUNDED);

        assert!(
            capture
                .frames()
                .iter()
                .all(|f| matches!(f, Frame::Native { .. }))
        );
    }

    #[test]
    #[cfg_attr(miri, ignore = "Miri cannot walk native stacks")]
    fn capture_stops_at_bound() {
        let mut capture = NativeCapture::new();

        capture.capture(0, 16, 0);

        assert!(capture.frames().is_empty());
    }

    #[test]
    fn stack_bound_comparison() {
        assert!(is_below(0x1000, 0x2000));
        assert!(!is_below(0x2000, 0x2000));
        assert!(!is_below(0x3000, 0x2000));
        assert!(!is_below(0, 0x2000));
    }

    #[test]
    fn symbolizer_never_panics_on_garbage() {
        let mut symbolizer = Symbolizer::new();

        let frame = symbolizer.describe(1);

        assert!(matches!(frame, FrameDescriptor::Native(_)));
    }
}
