#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Profiles the peak memory usage of an unmodified program.
//!
//! Built as a shared library and loaded with `LD_PRELOAD`, this package replaces the C
//! allocation functions of the process (`malloc`, `calloc`, `realloc`, `reallocarray`,
//! `free`, `posix_memalign`, `aligned_alloc`, `memalign`, `valloc`, `pvalloc`, `mmap` and
//! `munmap`) with versions that report every event to a `high_water` profiler before
//! handing it to the C library.
//!
//! An interpreter running in the process drives the session and reports its call stack
//! through the `high_water_*` functions exported alongside:
//!
//! ```c
//! high_water_start_session();
//!
//! uint32_t main_fn = high_water_register_function("main", "job.py");
//! high_water_start_call(main_fn, 0, 1);
//! /* ... */
//! high_water_finish_call();
//!
//! high_water_end_session("/tmp/report");
//! ```
//!
//! Session settings come from the `HIGH_WATER_*` environment variables. The library never
//! installs a `tracing` subscriber; its log output is only visible if the host sets one up.
//!
//! Only Linux is supported.

#[cfg(target_os = "linux")]
mod bootstrap;
#[cfg(target_os = "linux")]
mod control;
#[cfg(target_os = "linux")]
mod hooks;
#[cfg(target_os = "linux")]
mod outcome;
#[cfg(target_os = "linux")]
mod real;

#[cfg(all(test, target_os = "linux"))]
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(target_os = "linux")]
use high_water::Profiler;

/// The profiler that receives every event of the process.
#[cfg(target_os = "linux")]
static PROFILER: Profiler = Profiler::new();

// The tests of every module share the one process-wide profiler and take turns.
#[cfg(all(test, target_os = "linux"))]
fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = Mutex::new(());

    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}
