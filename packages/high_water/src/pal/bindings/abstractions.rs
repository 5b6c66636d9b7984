use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

/// Memory mapping system calls.
///
/// This trait is automatically mocked by mockall in test builds, generating `MockBindings`.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    /// `mmap()` of `len` bytes of private anonymous read/write memory, placed by the OS.
    fn mmap_anonymous(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// `munmap()`.
    ///
    /// # Safety
    ///
    /// Nothing may refer to memory in the range any more.
    unsafe fn munmap(&self, start: NonNull<u8>, len: usize) -> io::Result<()>;
}
