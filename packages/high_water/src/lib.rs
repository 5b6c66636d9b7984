#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Peak memory attribution for long-running programs and interpreters.
//!
//! This package tracks every live allocation of a process together with the call stack that
//! made it, and retains a snapshot of the moment live memory was at its highest. The
//! snapshot is a call tree: each node carries the bytes allocated directly by that frame and
//! the bytes allocated by it and everything it called.
//!
//! The core functionality includes:
//! - [`Allocator`] - A Rust memory allocator wrapper that reports every heap event
//! - [`Profiler`] - Session control and hooks for interpreters and other allocation sources
//! - [`PeakSnapshot`] - The retained state, as a [`CallTreeNode`] tree
//! - [`report::write()`] - Writes a snapshot as JSON and as folded stacks for flame
//!   graph renderers
//!
//! If the process runs out of memory, the state at the failed allocation replaces the peak,
//! since that is the state that needs explaining. By default it is also written to disk
//! immediately, in case the process does not survive.
//!
//! # Simple usage
//!
//! ```
//! use high_water::{Allocator, Config};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     ALLOCATOR.start_session(Config::builder().build()).unwrap();
//!
//!     let buffers: Vec<Vec<u8>> = (0..10).map(|_| vec![0; 4096]).collect();
//!     drop(buffers);
//!
//!     let snapshot = ALLOCATOR.end_session().unwrap();
//!     assert!(snapshot.total_bytes() >= 10 * 4096);
//!
//!     for line in snapshot.folded_lines() {
//!         println!("{line}");
//!     }
//! }
//! ```
//!
//! # Interpreter frames
//!
//! An interpreter embedding this package reports its own call stack, which then takes the
//! place of native stacks in the snapshot:
//!
//! ```
//! use high_water::{AllocationHandle, Config, Profiler};
//!
//! static PROFILER: Profiler = Profiler::new();
//!
//! let main = PROFILER.register_function("main", "job.py");
//! let load = PROFILER.register_function("load", "job.py");
//!
//! PROFILER
//!     .start_session(Config::builder().native_stacks(false).build())
//!     .unwrap();
//!
//! PROFILER.start_call(main, 0, 1);
//! PROFILER.start_call(load, 4, 12);
//! PROFILER.track_object_allocation(AllocationHandle::new(0x1000), 4096);
//! PROFILER.finish_call();
//! PROFILER.finish_call();
//!
//! let snapshot = PROFILER.end_session().unwrap();
//! let node = snapshot
//!     .root()
//!     .find(&["job.py:4 (main)", "job.py:12 (load)"])
//!     .unwrap();
//! assert_eq!(node.direct_bytes(), 4096);
//! ```
//!
//! # Configuration
//!
//! [`Config::from_env()`] reads the `HIGH_WATER_*` environment variables, see [`Config`].
//!
//! # Overhead
//!
//! Outside a session, each allocation pays for one atomic load. During a session, every
//! allocation and free takes a process-wide lock, so allocation-heavy threads are
//! serialized. Capturing native stacks is the largest cost; disable it with
//! [`ConfigBuilder::native_stacks()`] when interpreter frames are all you need.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic and cannot walk native stacks, so
//! sessions that rely on either cannot run under Miri.

mod allocator;
mod call_tree;
mod config;
mod error;
mod frame;
mod guard;
mod interner;
mod ledger;
pub mod mapping;
mod native;
mod oom;
mod pal;
mod profiler;
pub mod report;
mod resolver;
mod shadow_stack;
mod snapshot;
mod tracker;
mod usage;

pub use allocator::*;
pub use call_tree::{CallTreeNode, ExportNode};
pub use config::{Config, ConfigBuilder, MAX_NATIVE_FRAMES_LIMIT};
pub use error::{DisableReason, Error, Result};
pub use frame::{FrameDescriptor, FunctionId, InterpretedFrame, NativeFrame, NativeLanguage};
pub use ledger::{AllocationHandle, AllocationKind};
pub use oom::{AllocationOutcome, AllocationResult};
pub use profiler::*;
pub use snapshot::{PeakSnapshot, SnapshotExport, TriggerKind};
pub use usage::UsageStats;

pub(crate) const ERR_POISONED_LOCK: &str =
    "encountered poisoned lock - program validity cannot be guaranteed";
