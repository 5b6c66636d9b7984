//! Retained peak snapshots and their serializable form.

use std::io::Write;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::DisableReason;
use crate::call_tree::{CallTreeNode, ExportNode};
use crate::usage::UsageTracker;

/// What caused a snapshot to be taken.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TriggerKind {
    /// Total live memory reached a new maximum.
    Peak,

    /// An allocation failed because the process ran out of memory.
    OutOfMemory,

    /// Taken on request from whatever was live at the time. See
    /// [`Profiler::current_snapshot()`][crate::Profiler::current_snapshot].
    Requested,
}

/// Where the memory was at its high-water mark (or when it ran out).
///
/// Immutable once produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeakSnapshot {
    timestamp: SystemTime,
    trigger: TriggerKind,
    total_bytes: u64,
    root: CallTreeNode,
    process_id: u32,
}

impl PeakSnapshot {
    pub(crate) fn new(
        timestamp: SystemTime,
        trigger: TriggerKind,
        total_bytes: u64,
        root: CallTreeNode,
    ) -> Self {
        Self {
            timestamp,
            trigger,
            total_bytes,
            root,
            process_id: process::id(),
        }
    }

    /// The snapshot of a session in which nothing was ever allocated.
    pub(crate) fn empty(timestamp: SystemTime) -> Self {
        Self::new(timestamp, TriggerKind::Peak, 0, CallTreeNode::root())
    }

    /// When the state captured in this snapshot was reached.
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Why the snapshot was taken.
    #[must_use]
    pub fn trigger(&self) -> TriggerKind {
        self.trigger
    }

    /// Total live bytes at the time of the snapshot. Equals the root's cumulative bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// The aggregated call tree.
    #[must_use]
    pub fn root(&self) -> &CallTreeNode {
        &self.root
    }

    /// The process the snapshot was taken in.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Converts the snapshot into its serializable form.
    #[must_use]
    pub fn to_export(&self) -> SnapshotExport {
        let timestamp_unix_ms = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

        SnapshotExport {
            process_id: self.process_id,
            timestamp_unix_ms,
            trigger: self.trigger,
            total_bytes: self.total_bytes,
            root: self.root.to_export(),
        }
    }

    /// Serializes the snapshot as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialize`][crate::Error::Serialize] if serialization fails.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_export())?)
    }

    /// Writes the snapshot as JSON to `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write_json(&self, mut writer: impl Write) -> crate::Result<()> {
        serde_json::to_writer_pretty(&mut writer, &self.to_export())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// The call tree in folded stack format. See [`CallTreeNode::folded_lines()`].
    #[must_use]
    pub fn folded_lines(&self) -> Vec<String> {
        self.root.folded_lines()
    }
}

/// Serializable form of a [`PeakSnapshot`], as consumed by report renderers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct SnapshotExport {
    /// The process the snapshot was taken in.
    pub process_id: u32,

    /// When the captured state was reached, in milliseconds since the Unix epoch.
    pub timestamp_unix_ms: u64,

    /// Why the snapshot was taken.
    pub trigger: TriggerKind,

    /// Total live bytes at the time of the snapshot.
    pub total_bytes: u64,

    /// The aggregated call tree.
    pub root: ExportNode,
}

/// A moment at which total usage was recorded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Moment {
    pub(crate) at: SystemTime,
    pub(crate) total_bytes: u64,
}

/// Per-stack usage copied out at the moment of a peak.
#[derive(Debug)]
pub(crate) struct CapturedPeak {
    pub(crate) moment: Moment,
    pub(crate) by_stack: Vec<u64>,
}

/// Which state a peak snapshot is to be built from.
#[derive(Debug)]
pub(crate) enum Retained<'a> {
    /// Nothing was ever allocated.
    Nothing,

    /// The live per-stack usage still is the peak state.
    Current { moment: Moment, trigger: TriggerKind },

    /// The peak state was copied out before usage dropped again.
    Captured(&'a CapturedPeak),
}

/// Remembers which state of the session is the retained snapshot.
///
/// Copying the per-stack usage on every new peak would make a steadily growing program
/// pay for a full copy on every allocation. Instead a new peak is only marked as pending
/// and copied out right before the first mutation that takes usage back to or below it.
/// The retained state is therefore always the first one that reached the maximum.
///
/// An out-of-memory marker is terminal: once set, the usage it refers to is frozen and
/// no other state is retained.
#[derive(Debug, Default)]
pub(crate) struct SnapshotStore {
    pending: Option<Moment>,
    captured: Option<CapturedPeak>,
    out_of_memory: Option<Moment>,
}

impl SnapshotStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn mark_pending(&mut self, moment: Moment) {
        debug_assert!(self.out_of_memory.is_none());
        self.pending = Some(moment);
    }

    /// Copies the pending peak state out of `usage`, reusing the previous buffer.
    pub(crate) fn capture_pending(&mut self, usage: &UsageTracker) -> Result<(), DisableReason> {
        let Some(moment) = self.pending else {
            return Ok(());
        };

        let mut by_stack = self
            .captured
            .take()
            .map(|c| c.by_stack)
            .unwrap_or_default();
        by_stack.clear();

        if by_stack.try_reserve(usage.by_stack().len()).is_err() {
            // Keep the pending marker; the live usage stays frozen at the peak state.
            return Err(DisableReason::BookkeepingExhausted);
        }
        by_stack.extend_from_slice(usage.by_stack());

        self.captured = Some(CapturedPeak { moment, by_stack });
        self.pending = None;

        Ok(())
    }

    /// Marks the current state as the terminal out-of-memory state. Does not allocate.
    pub(crate) fn mark_out_of_memory(&mut self, moment: Moment) {
        self.out_of_memory = Some(moment);
        self.pending = None;
    }

    pub(crate) fn is_out_of_memory(&self) -> bool {
        self.out_of_memory.is_some()
    }

    pub(crate) fn retained(&self) -> Retained<'_> {
        if let Some(moment) = self.out_of_memory {
            Retained::Current {
                moment,
                trigger: TriggerKind::OutOfMemory,
            }
        } else if let Some(moment) = self.pending {
            Retained::Current {
                moment,
                trigger: TriggerKind::Peak,
            }
        } else if let Some(captured) = &self.captured {
            Retained::Captured(captured)
        } else {
            Retained::Nothing
        }
    }
}
