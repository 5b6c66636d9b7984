use std::io;

use thiserror::Error;

/// Errors surfaced by the public `high_water` API.
///
/// Failures inside the allocation hooks are never reported through this type. They degrade
/// the session to pass-through instead (see [`DisableReason`][crate::DisableReason]).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The tracking allocator was asked to start a session but it is not the global
    /// allocator of this process, so no allocation would ever be observed.
    #[error("allocation hooks are not installed: {hint}")]
    HooksNotInstalled {
        /// What the caller most likely forgot to do.
        hint: &'static str,
    },

    /// The requested hook cannot be installed on the platform the program was built for.
    #[error("{feature} tracking is not supported on this platform")]
    UnsupportedPlatform {
        /// The hook that could not be installed.
        feature: &'static str,
    },

    /// A session was started while another one was still active on the same profiler.
    #[error("a profiling session is already active")]
    SessionAlreadyActive,

    /// A session operation was requested but no session is active.
    #[error("no profiling session is active")]
    NoActiveSession,

    /// A configuration value could not be parsed.
    #[error("invalid value '{value}' for {variable}: {problem}")]
    InvalidConfig {
        /// The configuration variable (environment variable name) that was invalid.
        variable: String,

        /// The value that was rejected.
        value: String,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// An operating system call failed: writing a report or mapping memory.
    #[error("I/O operation failed: {0}")]
    Io(#[from] io::Error),

    /// Serializing a snapshot failed.
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why a session stopped tracking before it was ended.
///
/// A disabled session passes every allocation straight through. The snapshot retained up
/// to that point remains available.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum DisableReason {
    /// Memory for the engine's own bookkeeping could not be allocated.
    #[error("bookkeeping memory could not be allocated")]
    BookkeepingExhausted,

    /// More distinct call stacks were seen than can be numbered.
    #[error("too many distinct call stacks")]
    TooManyStacks,
}

/// A specialized `Result` type for `high_water` operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(DisableReason: Send, Sync, Copy);

    #[test]
    fn invalid_config_mentions_variable_and_value() {
        let error = Error::InvalidConfig {
            variable: "HIGH_WATER_MAX_NATIVE_FRAMES".to_string(),
            value: "lots".to_string(),
            problem: "not a number".to_string(),
        };

        let message = error.to_string();
        assert!(message.contains("HIGH_WATER_MAX_NATIVE_FRAMES"));
        assert!(message.contains("lots"));
    }

    #[test]
    fn io_errors_convert() {
        let error: Error = io::Error::other("disk on fire").into();

        assert!(matches!(error, Error::Io(_)));
    }
}
