//! Writing snapshots to disk for report renderers.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::{PeakSnapshot, Result, TriggerKind};

/// Where [`write()`] put its files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputFiles {
    json: PathBuf,
    folded: PathBuf,
}

impl OutputFiles {
    /// The snapshot as JSON, see [`SnapshotExport`][crate::SnapshotExport].
    #[must_use]
    pub fn json(&self) -> &Path {
        &self.json
    }

    /// The call tree in folded stack format, ready for a flame graph renderer.
    #[must_use]
    pub fn folded(&self) -> &Path {
        &self.folded
    }
}

/// Writes `snapshot` into `dir`, creating the directory if needed.
///
/// Two files are written, named after the trigger: `peak-memory.json` and
/// `peak-memory.prof` for a peak, `out-of-memory.json` and `out-of-memory.prof` when the
/// process ran out of memory, `current-memory.*` for a snapshot of the live state.
/// Existing files are replaced.
///
/// # Examples
///
/// ```no_run
/// use high_water::{Allocator, Config, report};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// # fn main() -> high_water::Result<()> {
/// ALLOCATOR.start_session(Config::from_env()?)?;
///
/// let data = vec![0_u8; 1024 * 1024];
/// drop(data);
///
/// let snapshot = ALLOCATOR.profiler().end_session()?;
/// let paths = report::write(&snapshot, "target/memory-report")?;
/// println!("flame graph input: {}", paths.folded().display());
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns [`Error::Io`][crate::Error::Io] if the directory or files cannot be written and
/// [`Error::Serialize`][crate::Error::Serialize] if the snapshot cannot be serialized.
pub fn write(snapshot: &PeakSnapshot, dir: impl AsRef<Path>) -> Result<OutputFiles> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let base = match snapshot.trigger() {
        TriggerKind::Peak => "peak-memory",
        TriggerKind::OutOfMemory => "out-of-memory",
        TriggerKind::Requested => "current-memory",
    };

    let paths = OutputFiles {
        json: dir.join(format!("{base}.json")),
        folded: dir.join(format!("{base}.prof")),
    };

    snapshot.write_json(BufWriter::new(File::create(&paths.json)?))?;

    let mut folded = BufWriter::new(File::create(&paths.folded)?);
    for line in snapshot.folded_lines() {
        writeln!(folded, "{line}")?;
    }
    folded.flush()?;

    info!(
        json = %paths.json.display(),
        folded = %paths.folded.display(),
        total_bytes = snapshot.total_bytes(),
        "memory report written"
    );

    Ok(paths)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::SnapshotExport;
    use crate::call_tree::CallTreeNode;
    use crate::frame::{FrameDescriptor, InterpretedFrame};

    fn snapshot(trigger: TriggerKind) -> PeakSnapshot {
        let mut root = CallTreeNode::root();
        root.add_stack(
            [FrameDescriptor::Interpreted(InterpretedFrame {
                function: "load".to_string(),
                file: "etl.py".to_string(),
                line: 3,
            })],
            51_000,
        );

        PeakSnapshot::new(UNIX_EPOCH, trigger, 51_000, root)
    }

    #[test]
    fn writes_peak_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("reports");

        let paths = write(&snapshot(TriggerKind::Peak), &target).unwrap();

        assert_eq!(paths.json(), target.join("peak-memory.json"));
        assert_eq!(paths.folded(), target.join("peak-memory.prof"));

        let folded = fs::read_to_string(paths.folded()).unwrap();
        assert_eq!(folded, "etl.py:3 (load) 51000\n");

        let export: SnapshotExport =
            serde_json::from_str(&fs::read_to_string(paths.json()).unwrap()).unwrap();
        assert_eq!(export.total_bytes, 51_000);
        assert_eq!(export.root.children[0].label, "etl.py:3 (load)");
    }

    #[test]
    fn out_of_memory_files_are_named_accordingly() {
        let dir = tempfile::tempdir().unwrap();

        let paths = write(&snapshot(TriggerKind::OutOfMemory), dir.path()).unwrap();

        assert!(paths.json().ends_with("out-of-memory.json"));
        assert!(paths.folded().exists());
    }

    #[test]
    fn unwritable_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"not a directory").unwrap();

        let result = write(&snapshot(TriggerKind::Peak), &file);

        assert!(matches!(result, Err(crate::Error::Io(_))));
    }
}
