use std::fmt;
use std::io;
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockBindings;
use crate::pal::{Bindings, BuildTargetBindings};

/// Dispatches to the real bindings or, in tests, to a mock.
#[derive(Clone)]
pub(crate) enum BindingsFacade {
    Target(&'static BuildTargetBindings),

    #[cfg(test)]
    Mock(Arc<MockBindings>),
}

static BUILD_TARGET_BINDINGS: BuildTargetBindings = BuildTargetBindings;

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl BindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BUILD_TARGET_BINDINGS)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Bindings for BindingsFacade {
    fn mmap_anonymous(&self, len: usize) -> io::Result<NonNull<u8>> {
        match self {
            Self::Target(bindings) => bindings.mmap_anonymous(len),
            #[cfg(test)]
            Self::Mock(mock) => mock.mmap_anonymous(len),
        }
    }

    unsafe fn munmap(&self, start: NonNull<u8>, len: usize) -> io::Result<()> {
        match self {
            // SAFETY: Forwarding the caller's guarantee.
            Self::Target(bindings) => unsafe { bindings.munmap(start, len) },
            #[cfg(test)]
            // SAFETY: Forwarding the caller's guarantee.
            Self::Mock(mock) => unsafe { mock.munmap(start, len) },
        }
    }
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl fmt::Debug for BindingsFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target(_) => f.debug_struct("BindingsFacade::Target").finish(),
            #[cfg(test)]
            Self::Mock(_) => f.debug_struct("BindingsFacade::Mock").finish(),
        }
    }
}
