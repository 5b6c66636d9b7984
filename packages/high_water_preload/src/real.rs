//! The C library functions the hooks stand in for.

use std::ffi::CStr;
use std::mem;
use std::process;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_void, off_t, size_t};

pub(crate) struct RealFunctions {
    pub(crate) malloc: unsafe extern "C" fn(size_t) -> *mut c_void,
    pub(crate) calloc: unsafe extern "C" fn(size_t, size_t) -> *mut c_void,
    pub(crate) realloc: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void,
    pub(crate) free: unsafe extern "C" fn(*mut c_void),
    pub(crate) posix_memalign: unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int,
    pub(crate) aligned_alloc: unsafe extern "C" fn(size_t, size_t) -> *mut c_void,
    pub(crate) memalign: unsafe extern "C" fn(size_t, size_t) -> *mut c_void,
    pub(crate) valloc: unsafe extern "C" fn(size_t) -> *mut c_void,
    pub(crate) pvalloc: unsafe extern "C" fn(size_t) -> *mut c_void,
    pub(crate) mmap:
        unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void,
    pub(crate) munmap: unsafe extern "C" fn(*mut c_void, size_t) -> c_int,
}

static REAL: OnceLock<RealFunctions> = OnceLock::new();

// Set while the lookup runs. Allocations made meanwhile (by the lookup itself or by
// other threads) are served from the bootstrap arena.
static RESOLVING: AtomicBool = AtomicBool::new(false);

/// The real C library functions, or `None` while they are still being looked up.
#[inline]
pub(crate) fn functions() -> Option<&'static RealFunctions> {
    if let Some(real) = REAL.get() {
        return Some(real);
    }

    if RESOLVING.swap(true, Ordering::Acquire) {
        return None;
    }

    let real = REAL.get_or_init(resolve);
    RESOLVING.store(false, Ordering::Release);
    Some(real)
}

macro_rules! next_symbol {
    ($name:literal) => {{
        let name = $name;
        // SAFETY: The name is a valid C string. RTLD_NEXT looks past this library.
        let symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };

        if symbol.is_null() {
            missing(name);
        }

        // SAFETY: The C library exports this symbol with the signature of the field
        // the value is assigned to.
        unsafe { mem::transmute::<*mut c_void, _>(symbol) }
    }};
}

#[cold]
fn resolve() -> RealFunctions {
    RealFunctions {
        malloc: next_symbol!(c"malloc"),
        calloc: next_symbol!(c"calloc"),
        realloc: next_symbol!(c"realloc"),
        free: next_symbol!(c"free"),
        posix_memalign: next_symbol!(c"posix_memalign"),
        aligned_alloc: next_symbol!(c"aligned_alloc"),
        memalign: next_symbol!(c"memalign"),
        valloc: next_symbol!(c"valloc"),
        pvalloc: next_symbol!(c"pvalloc"),
        mmap: next_symbol!(c"mmap"),
        munmap: next_symbol!(c"munmap"),
    }
}

// Without the real allocator the process cannot continue in any form.
#[cold]
fn missing(name: &CStr) -> ! {
    write_stderr(b"high_water_preload: C library function not found: ");
    write_stderr(name.to_bytes());
    write_stderr(b"\n");

    process::abort();
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: Writing from a valid buffer of the given length.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}
