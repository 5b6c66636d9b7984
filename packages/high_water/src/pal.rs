// Platform abstraction layer.
//
// Memory mapping system calls go through a trait so the tracking logic around them can be
// tested with mocks: abstraction (trait) -> facade (enum) -> real implementation.

#[cfg(unix)]
mod bindings;

#[cfg(unix)]
pub(crate) use bindings::*;
