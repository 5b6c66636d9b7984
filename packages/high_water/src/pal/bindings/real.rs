use std::io;
use std::ptr::{self, NonNull};

use crate::pal::Bindings;

/// Bindings that call into the operating system the build is targeting.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

// Thin forwarders to the OS, exercised by the integration tests.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Bindings for BuildTargetBindings {
    fn mmap_anonymous(&self, len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: A new private anonymous mapping placed by the OS cannot alias anything.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if address == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(address.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
    }

    unsafe fn munmap(&self, start: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: Forwarding the caller's guarantee that nothing refers to the range.
        let result = unsafe { libc::munmap(start.as_ptr().cast(), len) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
