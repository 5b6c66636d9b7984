//! Stack frames, in their compact (interned) and resolved (reported) forms.

use std::fmt;

use foldhash::{HashMap, HashMapExt};
use serde::{Deserialize, Serialize};

/// Identifies a function registered by the interpreter integration via
/// [`Profiler::register_function()`][crate::Profiler::register_function].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FunctionId(u32);

impl FunctionId {
    /// Reconstructs an identifier previously obtained from [`FunctionId::as_u32()`].
    ///
    /// An identifier that was never handed out by the profiler resolves to a placeholder
    /// frame when reported.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// Stands in for a function that could not be registered. Frames of it are reported
    /// as unregistered.
    pub(crate) const UNREGISTERED: Self = Self(u32::MAX);

    /// The raw value, for passing across an FFI boundary.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// One entry of an interned call stack.
///
/// This is the form stacks take on the hot path: small, `Copy` and cheap to hash. It is
/// turned into a [`FrameDescriptor`] only when a snapshot is materialized.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Frame {
    Interpreted { function: FunctionId, line: u32 },
    Native { address: usize },
}

/// Source location of a registered function.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct FunctionLocation {
    name: Box<str>,
    file: Box<str>,
}

impl FunctionLocation {
    fn try_new(name: &str, file: &str) -> Option<Self> {
        Some(Self {
            name: try_boxed(name)?,
            file: try_boxed(file)?,
        })
    }
}

fn id_for_index(index: usize) -> Option<FunctionId> {
    u32::try_from(index)
        .ok()
        .map(FunctionId)
        .filter(|id| *id != FunctionId::UNREGISTERED)
}

fn try_boxed(text: &str) -> Option<Box<str>> {
    let mut owned = String::new();
    owned.try_reserve_exact(text.len()).ok()?;
    owned.push_str(text);
    Some(owned.into_boxed_str())
}

/// Maps function locations to compact identifiers and back.
#[derive(Debug, Default)]
pub(crate) struct FunctionTable {
    locations: Vec<FunctionLocation>,
    ids: HashMap<FunctionLocation, FunctionId>,
}

impl FunctionTable {
    pub(crate) fn new() -> Self {
        Self {
            locations: Vec::new(),
            ids: HashMap::new(),
        }
    }

    /// Returns the identifier of the function, registering it on first sight.
    ///
    /// `None` if the table is full or memory for the new entry cannot be obtained.
    pub(crate) fn register(&mut self, name: &str, file: &str) -> Option<FunctionId> {
        let location = FunctionLocation::try_new(name, file)?;

        if let Some(id) = self.ids.get(&location) {
            return Some(*id);
        }

        let id = id_for_index(self.locations.len())?;

        let copy = FunctionLocation::try_new(name, file)?;
        self.locations.try_reserve(1).ok()?;
        self.ids.try_reserve(1).ok()?;

        self.locations.push(copy);
        self.ids.insert(location, id);
        Some(id)
    }

    fn get(&self, id: FunctionId) -> Option<&FunctionLocation> {
        self.locations.get(id.0 as usize)
    }

    /// Turns an interpreter call site into its reportable form.
    pub(crate) fn describe(&self, function: FunctionId, line: u32) -> FrameDescriptor {
        match self.get(function) {
            Some(location) => FrameDescriptor::Interpreted(InterpretedFrame {
                function: location.name.to_string(),
                file: location.file.to_string(),
                line,
            }),
            None => FrameDescriptor::Interpreted(InterpretedFrame {
                function: format!("<unregistered function {}>", function.0),
                file: "<unknown>".to_string(),
                line,
            }),
        }
    }
}

/// A resolved stack frame, as it appears in call trees and exports.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FrameDescriptor {
    /// A frame of the interpreted language.
    Interpreted(InterpretedFrame),

    /// A frame of compiled code.
    Native(NativeFrame),
}

/// A frame of the interpreted language.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[non_exhaustive]
pub struct InterpretedFrame {
    /// Function name.
    pub function: String,

    /// Source file containing the function.
    pub file: String,

    /// The line executing in this frame when the allocation happened, 1-based.
    pub line: u32,
}

/// A frame of compiled code.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NativeFrame {
    /// Symbol information was found for the return address.
    Resolved {
        /// Demangled symbol name.
        symbol: String,

        /// Source file, if debug information was available.
        file: Option<String>,

        /// Source line, if debug information was available.
        line: Option<u32>,

        /// Which language the code was most likely written in.
        language: NativeLanguage,
    },

    /// Nothing is known about the return address beyond its value.
    Unresolved {
        /// The return address.
        address: usize,
    },
}

/// Provenance of a native frame.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NativeLanguage {
    /// Rust code.
    Rust,

    /// C code.
    C,

    /// C++ code.
    Cpp,

    /// Fortran code.
    Fortran,

    /// Native code of undetermined language.
    Native,
}

impl fmt::Display for NativeLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rust => "Rust",
            Self::C => "C",
            Self::Cpp => "C++",
            Self::Fortran => "Fortran",
            Self::Native => "native",
        })
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interpreted(frame) => {
                write!(f, "{}:{} ({})", frame.file, frame.line, frame.function)
            }
            Self::Native(NativeFrame::Resolved {
                symbol,
                file: Some(file),
                line: Some(line),
                language,
            }) => write!(f, "{symbol} ({file}:{line}) [{language}]"),
            Self::Native(NativeFrame::Resolved {
                symbol, language, ..
            }) => write!(f, "{symbol} [{language}]"),
            Self::Native(NativeFrame::Unresolved { address }) => {
                write!(f, "[unresolved native frame {address:#x}]")
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_gives_same_id() {
        let mut table = FunctionTable::new();

        let a = table.register("load", "etl.py").unwrap();
        let b = table.register("transform", "etl.py").unwrap();
        let a_again = table.register("load", "etl.py").unwrap();

        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[test]
    fn same_name_in_different_files_is_distinct() {
        let mut table = FunctionTable::new();

        let a = table.register("main", "a.py").unwrap();
        let b = table.register("main", "b.py").unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn describe_uses_registered_location() {
        let mut table = FunctionTable::new();
        let id = table.register("load", "etl.py").unwrap();

        let frame = table.describe(id, 17);

        assert_eq!(frame.to_string(), "etl.py:17 (load)");
    }

    #[test]
    fn describe_unknown_function_does_not_panic() {
        let table = FunctionTable::new();

        let frame = table.describe(FunctionId::from_u32(99), 1);

        assert!(frame.to_string().contains("unregistered"));
    }

    #[test]
    fn table_runs_out_of_ids_before_the_placeholder() {
        assert_eq!(id_for_index(0), Some(FunctionId::from_u32(0)));
        assert_eq!(
            id_for_index(u32::MAX as usize - 1),
            Some(FunctionId::from_u32(u32::MAX - 1))
        );
        assert_eq!(id_for_index(u32::MAX as usize), None);
        assert_eq!(id_for_index(usize::MAX), None);
    }

    #[test]
    fn placeholder_is_reported_as_unregistered() {
        let mut table = FunctionTable::new();
        table.register("load", "etl.py").unwrap();

        let frame = table.describe(FunctionId::UNREGISTERED, 3);

        assert!(frame.to_string().contains("unregistered"));
    }

    #[test]
    fn native_labels() {
        let with_location = FrameDescriptor::Native(NativeFrame::Resolved {
            symbol: "compute".to_string(),
            file: Some("kernel.c".to_string()),
            line: Some(40),
            language: NativeLanguage::C,
        });
        let bare = FrameDescriptor::Native(NativeFrame::Resolved {
            symbol: "dgemm_".to_string(),
            file: None,
            line: None,
            language: NativeLanguage::Fortran,
        });
        let unresolved = FrameDescriptor::Native(NativeFrame::Unresolved { address: 0xdead });

        assert_eq!(with_location.to_string(), "compute (kernel.c:40) [C]");
        assert_eq!(bare.to_string(), "dgemm_ [Fortran]");
        assert_eq!(unresolved.to_string(), "[unresolved native frame 0xdead]");
    }

    #[test]
    fn function_id_round_trips_through_u32() {
        let id = FunctionId::from_u32(7);

        assert_eq!(FunctionId::from_u32(id.as_u32()), id);
    }
}
