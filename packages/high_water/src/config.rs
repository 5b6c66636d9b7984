//! Session configuration.

use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Error, Result};

/// Upper bound on captured native frames. The capture buffer lives on the stack of the
/// allocating thread, so this stays small.
pub const MAX_NATIVE_FRAMES_LIMIT: usize = 128;

const DEFAULT_MAX_NATIVE_FRAMES: usize = 64;
const DEFAULT_EMERGENCY_RESERVE_BYTES: usize = 16 * 1024 * 1024;

const ENV_NATIVE_STACKS: &str = "HIGH_WATER_NATIVE_STACKS";
const ENV_MAX_NATIVE_FRAMES: &str = "HIGH_WATER_MAX_NATIVE_FRAMES";
const ENV_SKIP_NATIVE_FRAMES: &str = "HIGH_WATER_SKIP_NATIVE_FRAMES";
const ENV_EMERGENCY_RESERVE_BYTES: &str = "HIGH_WATER_EMERGENCY_RESERVE_BYTES";
const ENV_OUTPUT_DIR: &str = "HIGH_WATER_OUTPUT_DIR";
const ENV_REPORT_ON_OOM: &str = "HIGH_WATER_REPORT_ON_OOM";

/// Configuration of a profiling session.
///
/// # Examples
///
/// ```
/// use high_water::Config;
///
/// let config = Config::builder()
///     .native_stacks(false)
///     .emergency_reserve_bytes(0)
///     .build();
///
/// assert!(!config.native_stacks());
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    native_stacks: bool,
    max_native_frames: usize,
    skip_native_frames: usize,
    emergency_reserve_bytes: usize,
    output_dir: PathBuf,
    report_on_out_of_memory: bool,
}

impl Config {
    /// Starts building a configuration from the defaults.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Gets replaced with itself by different name, bad mutation.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Reads the configuration from `HIGH_WATER_*` environment variables, using defaults
    /// for anything not set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set to a value that cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup function.
    ///
    /// This is what [`from_env()`][Self::from_env] uses under the hood.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a variable is set to a value that cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();

        if let Some(value) = lookup(ENV_NATIVE_STACKS) {
            builder = builder.native_stacks(parse_bool(ENV_NATIVE_STACKS, &value)?);
        }

        if let Some(value) = lookup(ENV_MAX_NATIVE_FRAMES) {
            let frames: usize = parse_number(ENV_MAX_NATIVE_FRAMES, &value)?;

            if frames == 0 || frames > MAX_NATIVE_FRAMES_LIMIT {
                return Err(invalid(
                    ENV_MAX_NATIVE_FRAMES,
                    &value,
                    &format!("must be between 1 and {MAX_NATIVE_FRAMES_LIMIT}"),
                ));
            }

            builder = builder.max_native_frames(frames);
        }

        if let Some(value) = lookup(ENV_SKIP_NATIVE_FRAMES) {
            builder = builder.skip_native_frames(parse_number(ENV_SKIP_NATIVE_FRAMES, &value)?);
        }

        if let Some(value) = lookup(ENV_EMERGENCY_RESERVE_BYTES) {
            builder = builder
                .emergency_reserve_bytes(parse_number(ENV_EMERGENCY_RESERVE_BYTES, &value)?);
        }

        if let Some(value) = lookup(ENV_OUTPUT_DIR) {
            if value.is_empty() {
                return Err(invalid(ENV_OUTPUT_DIR, &value, "must not be empty"));
            }

            builder = builder.output_dir(value);
        }

        if let Some(value) = lookup(ENV_REPORT_ON_OOM) {
            builder = builder.report_on_out_of_memory(parse_bool(ENV_REPORT_ON_OOM, &value)?);
        }

        Ok(builder.build())
    }

    /// Whether native frames are captured: the whole native stack when no interpreter
    /// frame is on the thread, otherwise the native frames below the innermost one.
    #[must_use]
    pub fn native_stacks(&self) -> bool {
        self.native_stacks
    }

    /// The maximum number of native frames captured per allocation.
    #[must_use]
    pub fn max_native_frames(&self) -> usize {
        self.max_native_frames
    }

    /// How many innermost native frames (the hook machinery itself) are dropped.
    #[must_use]
    pub fn skip_native_frames(&self) -> usize {
        self.skip_native_frames
    }

    /// How many bytes are reserved at session start and released before an
    /// out-of-memory snapshot is materialized.
    #[must_use]
    pub fn emergency_reserve_bytes(&self) -> usize {
        self.emergency_reserve_bytes
    }

    /// Where reports are written by default.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Whether the out-of-memory report is written to [`output_dir()`][Self::output_dir]
    /// as soon as an allocation fails for lack of memory. The process is likely to die
    /// shortly after, so waiting for the session to end may mean no report at all.
    #[must_use]
    pub fn report_on_out_of_memory(&self) -> bool {
        self.report_on_out_of_memory
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builds a [`Config`]. Obtain one via [`Config::builder()`].
#[derive(Debug)]
#[must_use]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    fn new() -> Self {
        Self {
            config: Config {
                native_stacks: true,
                max_native_frames: DEFAULT_MAX_NATIVE_FRAMES,
                skip_native_frames: 0,
                emergency_reserve_bytes: DEFAULT_EMERGENCY_RESERVE_BYTES,
                output_dir: env::temp_dir(),
                report_on_out_of_memory: true,
            },
        }
    }

    /// Enables or disables native stack capture.
    pub fn native_stacks(mut self, enabled: bool) -> Self {
        self.config.native_stacks = enabled;
        self
    }

    /// Sets the maximum number of captured native frames.
    ///
    /// Values above [`MAX_NATIVE_FRAMES_LIMIT`] are clamped to it.
    ///
    /// # Panics
    ///
    /// Panics if `frames` is zero.
    pub fn max_native_frames(mut self, frames: usize) -> Self {
        assert!(frames != 0, "at least one native frame must be captured");
        self.config.max_native_frames = frames.min(MAX_NATIVE_FRAMES_LIMIT);
        self
    }

    /// Sets how many innermost native frames are skipped.
    pub fn skip_native_frames(mut self, frames: usize) -> Self {
        self.config.skip_native_frames = frames;
        self
    }

    /// Sets the size of the emergency reserve. Zero disables it.
    pub fn emergency_reserve_bytes(mut self, bytes: usize) -> Self {
        self.config.emergency_reserve_bytes = bytes;
        self
    }

    /// Sets the default report directory.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// Enables or disables writing a report as soon as memory runs out.
    pub fn report_on_out_of_memory(mut self, enabled: bool) -> Self {
        self.config.report_on_out_of_memory = enabled;
        self
    }

    /// Finishes building.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}

fn parse_bool(variable: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(variable, value, "expected a boolean such as 1 or 0")),
    }
}

fn parse_number<T: FromStr>(variable: &str, value: &str) -> Result<T>
where
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(variable, value, &e.to_string()))
}

fn invalid(variable: &str, value: &str, problem: &str) -> Error {
    Error::InvalidConfig {
        variable: variable.to_string(),
        value: value.to_string(),
        problem: problem.to_string(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use foldhash::{HashMap, HashMapExt};

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let mut map = HashMap::new();
        for (k, v) in pairs {
            map.insert((*k).to_string(), (*v).to_string());
        }

        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();

        assert!(config.native_stacks());
        assert_eq!(config.max_native_frames(), 64);
        assert_eq!(config.skip_native_frames(), 0);
        assert_eq!(config.emergency_reserve_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.output_dir(), env::temp_dir());
        assert!(config.report_on_out_of_memory());
    }

    #[test]
    fn empty_lookup_gives_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn lookup_overrides_everything() {
        let config = Config::from_lookup(lookup_from(&[
            ("HIGH_WATER_NATIVE_STACKS", "off"),
            ("HIGH_WATER_MAX_NATIVE_FRAMES", "12"),
            ("HIGH_WATER_SKIP_NATIVE_FRAMES", "3"),
            ("HIGH_WATER_EMERGENCY_RESERVE_BYTES", "0"),
            ("HIGH_WATER_OUTPUT_DIR", "/var/tmp/reports"),
            ("HIGH_WATER_REPORT_ON_OOM", "no"),
        ]))
        .unwrap();

        assert!(!config.native_stacks());
        assert_eq!(config.max_native_frames(), 12);
        assert_eq!(config.skip_native_frames(), 3);
        assert_eq!(config.emergency_reserve_bytes(), 0);
        assert_eq!(config.output_dir(), Path::new("/var/tmp/reports"));
        assert!(!config.report_on_out_of_memory());
    }

    #[test]
    fn garbage_boolean_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("HIGH_WATER_NATIVE_STACKS", "maybe")]));

        assert!(matches!(
            result,
            Err(Error::InvalidConfig { variable, .. }) if variable == "HIGH_WATER_NATIVE_STACKS"
        ));
    }

    #[test]
    fn frame_count_out_of_range_is_rejected() {
        for value in ["0", "100000", "many"] {
            let result =
                Config::from_lookup(lookup_from(&[("HIGH_WATER_MAX_NATIVE_FRAMES", value)]));

            assert!(result.is_err(), "{value} was accepted");
        }
    }

    #[test]
    fn empty_output_dir_is_rejected() {
        let result = Config::from_lookup(lookup_from(&[("HIGH_WATER_OUTPUT_DIR", "")]));

        assert!(result.is_err());
    }

    #[test]
    fn builder_clamps_native_frames() {
        let config = Config::builder().max_native_frames(10_000).build();

        assert_eq!(config.max_native_frames(), MAX_NATIVE_FRAMES_LIMIT);
    }

    #[test]
    #[should_panic]
    fn builder_rejects_zero_native_frames() {
        drop(Config::builder().max_native_frames(0));
    }
}
