//! The C interface through which a host program drives the session and an embedded
//! interpreter reports its frames and objects.

use std::borrow::Cow;
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use high_water::{AllocationHandle, Config, FunctionId, report};
use libc::{c_char, c_int, c_void, size_t};
use tracing::error;

use crate::PROFILER;

/// Starts a session configured from the `HIGH_WATER_*` environment variables.
///
/// Returns 0 on success and -1 if the configuration is invalid or a session is already
/// active.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn high_water_start_session() -> c_int {
    status_code(Config::from_env().and_then(|config| PROFILER.start_session(config)))
}

/// Ends the session and writes its report into `dir`, or into the configured output
/// directory if `dir` is null.
///
/// Returns 0 on success and -1 if no session was active or the report could not be
/// written.
///
/// # Safety
///
/// `dir` must be null or a valid NUL-terminated string.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn high_water_end_session(dir: *const c_char) -> c_int {
    let dir = if dir.is_null() {
        None
    } else {
        // SAFETY: The caller guarantees a valid NUL-terminated string.
        let bytes = unsafe { CStr::from_ptr(dir) }.to_bytes();
        Some(PathBuf::from(OsStr::from_bytes(bytes)))
    };

    status_code(PROFILER.end_session().and_then(|snapshot| {
        let dir = match dir {
            Some(dir) => dir,
            None => Config::from_env()?.output_dir().to_path_buf(),
        };

        report::write(&snapshot, dir).map(drop)
    }))
}

/// Registers an interpreter function, returning the identifier to pass to
/// [`high_water_start_call()`].
///
/// # Safety
///
/// `name` and `file` must be valid NUL-terminated strings.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn high_water_register_function(
    name: *const c_char,
    file: *const c_char,
) -> u32 {
    // SAFETY: The caller guarantees a valid NUL-terminated string.
    let name = unsafe { text(name) };
    // SAFETY: The caller guarantees a valid NUL-terminated string.
    let file = unsafe { text(file) };

    PROFILER.register_function(&name, &file).as_u32()
}

/// The interpreter on this thread entered `function` and is executing `line` in it. A
/// nonzero `parent_line` is the line in the calling function that made the call.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn high_water_start_call(function: u32, parent_line: u32, line: u32) {
    PROFILER.start_call(FunctionId::from_u32(function), parent_line, line);
}

/// The interpreter on this thread returned from its innermost function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn high_water_finish_call() {
    PROFILER.finish_call();
}

/// The interpreter on this thread moved on to `line` in its innermost function.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn high_water_new_line_number(line: u32) {
    PROFILER.new_line_number(line);
}

/// The interpreter allocated an object of `size` bytes at `address` from memory it
/// manages itself.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn high_water_object_alloc(address: *const c_void, size: size_t) {
    PROFILER.track_object_allocation(AllocationHandle::from_ptr(address), size);
}

/// The interpreter released the object at `address`.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn high_water_object_free(address: *const c_void) {
    PROFILER.track_object_deallocation(AllocationHandle::from_ptr(address));
}

unsafe fn text<'a>(ptr: *const c_char) -> Cow<'a, str> {
    // SAFETY: Forwarding the caller's guarantee.
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
}

fn status_code(result: high_water::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "memory profiling request failed");
            -1
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ffi::CString;
    use std::fs;
    use std::ptr;

    use super::*;
    use crate::serial;

    fn bytes_under(folded: &str, prefix: &str) -> u64 {
        folded
            .lines()
            .filter_map(|line| line.rsplit_once(' '))
            .filter(|(stack, _)| *stack == prefix || stack.starts_with(&format!("{prefix};")))
            .map(|(_, bytes)| bytes.parse::<u64>().unwrap())
            .sum()
    }

    #[test]
    fn interpreter_session_writes_report() {
        let _serial = serial();
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = CString::new(dir.path().as_os_str().as_bytes()).unwrap();

        // SAFETY: Valid C strings.
        let main = unsafe { high_water_register_function(c"main".as_ptr(), c"job.py".as_ptr()) };
        // SAFETY: Valid C strings.
        let load = unsafe { high_water_register_function(c"load".as_ptr(), c"job.py".as_ptr()) };

        assert_eq!(high_water_start_session(), 0);
        assert_eq!(high_water_start_session(), -1);

        high_water_start_call(main, 0, 1);
        high_water_start_call(load, 3, 8);
        high_water_object_alloc(ptr::without_provenance(0x1000), 2048);
        high_water_new_line_number(9);
        high_water_object_alloc(ptr::without_provenance(0x2000), 512);
        high_water_object_free(ptr::without_provenance(0x1000));
        high_water_finish_call();
        high_water_finish_call();

        // SAFETY: Valid C string.
        assert_eq!(unsafe { high_water_end_session(dir_arg.as_ptr()) }, 0);

        // Native frames may follow the interpreter frames, depending on the environment.
        let folded = fs::read_to_string(dir.path().join("peak-memory.prof")).unwrap();
        assert_eq!(bytes_under(&folded, "job.py:3 (main);job.py:8 (load)"), 2048);
        assert_eq!(bytes_under(&folded, "job.py:3 (main);job.py:9 (load)"), 512);

        let json = fs::read_to_string(dir.path().join("peak-memory.json")).unwrap();
        let export: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(export["total_bytes"], 2560);
        assert_eq!(export["trigger"], "peak");
    }

    #[test]
    fn ending_without_session_fails() {
        let _serial = serial();

        // SAFETY: Null is accepted.
        assert_eq!(unsafe { high_water_end_session(ptr::null()) }, -1);
    }

    #[test]
    fn names_are_read_lossily() {
        let bytes = b"caf\xe9\0";

        // SAFETY: NUL-terminated buffer.
        let name = unsafe { text(bytes.as_ptr().cast()) };

        assert_eq!(name, "caf\u{fffd}");
    }
}
