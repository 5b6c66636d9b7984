//! Aggregation of live bytes into a tree of call paths.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::frame::FrameDescriptor;

const ROOT_LABEL: &str = "[program start]";

/// One node of an aggregated call tree.
///
/// The root stands for program start and has no frame. Every other node is one frame of
/// one or more call stacks, reached from the root by following the stack from its
/// outermost frame inwards.
///
/// * `direct_bytes` are live bytes allocated with this node's frame innermost.
/// * `cumulative_bytes` are `direct_bytes` plus the cumulative bytes of all children.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallTreeNode {
    frame: Option<FrameDescriptor>,
    direct_bytes: u64,
    cumulative_bytes: u64,
    children: BTreeMap<FrameDescriptor, CallTreeNode>,
}

impl CallTreeNode {
    pub(crate) fn root() -> Self {
        Self::new(None)
    }

    fn new(frame: Option<FrameDescriptor>) -> Self {
        Self {
            frame,
            direct_bytes: 0,
            cumulative_bytes: 0,
            children: BTreeMap::new(),
        }
    }

    /// Adds `bytes` along `path` (outermost frame first). An empty path attributes the
    /// bytes to this node directly.
    pub(crate) fn add_stack(
        &mut self,
        path: impl IntoIterator<Item = FrameDescriptor>,
        bytes: u64,
    ) {
        let mut node = self;
        node.cumulative_bytes = node.cumulative_bytes.saturating_add(bytes);

        for frame in path {
            node = node
                .children
                .entry(frame)
                .or_insert_with_key(|frame| Self::new(Some(frame.clone())));
            node.cumulative_bytes = node.cumulative_bytes.saturating_add(bytes);
        }

        node.direct_bytes = node.direct_bytes.saturating_add(bytes);
    }

    /// The frame this node represents. `None` for the root.
    #[must_use]
    pub fn frame(&self) -> Option<&FrameDescriptor> {
        self.frame.as_ref()
    }

    /// Human-readable name of the node, as used in folded stacks and exports.
    #[must_use]
    pub fn label(&self) -> String {
        self.frame
            .as_ref()
            .map_or_else(|| ROOT_LABEL.to_string(), ToString::to_string)
    }

    /// Bytes attributed to call stacks ending at this node.
    #[must_use]
    pub fn direct_bytes(&self) -> u64 {
        self.direct_bytes
    }

    /// Bytes attributed to this node and everything beneath it.
    #[must_use]
    pub fn cumulative_bytes(&self) -> u64 {
        self.cumulative_bytes
    }

    /// Child nodes, largest cumulative size first. Equal sizes are ordered by frame.
    #[must_use]
    pub fn children(&self) -> Vec<&Self> {
        let mut children: Vec<&Self> = self.children.values().collect();
        // The map already orders by frame and the sort is stable.
        children.sort_by_key(|c| Reverse(c.cumulative_bytes));
        children
    }

    /// The child for `frame`, if any bytes were attributed through it.
    #[must_use]
    pub fn child(&self, frame: &FrameDescriptor) -> Option<&Self> {
        self.children.get(frame)
    }

    /// Follows a path of node labels downwards from this node.
    ///
    /// # Examples
    ///
    /// ```
    /// # use high_water::PeakSnapshot;
    /// # fn inspect(snapshot: &PeakSnapshot) {
    /// if let Some(node) = snapshot.root().find(&["etl.py:10 (main)", "etl.py:22 (load)"]) {
    ///     println!("load() held {} bytes at peak", node.cumulative_bytes());
    /// }
    /// # }
    /// ```
    #[must_use]
    pub fn find(&self, labels: &[&str]) -> Option<&Self> {
        labels.iter().try_fold(self, |node, label| {
            node.children.values().find(|c| c.label() == *label)
        })
    }

    /// Renders the tree in the folded stack format consumed by flame graph renderers:
    /// one `frame;frame;frame bytes` line per node with direct bytes.
    #[must_use]
    pub fn folded_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if self.frame.is_none() && self.direct_bytes > 0 {
            lines.push(format!("{ROOT_LABEL} {}", self.direct_bytes));
        }

        let mut path = Vec::new();
        for child in self.children.values() {
            child.fold_into(&mut path, &mut lines);
        }

        lines
    }

    fn fold_into(&self, path: &mut Vec<String>, lines: &mut Vec<String>) {
        // Semicolons separate frames in this format.
        path.push(self.label().replace(';', ","));

        if self.direct_bytes > 0 {
            lines.push(format!("{} {}", path.join(";"), self.direct_bytes));
        }

        for child in self.children.values() {
            child.fold_into(path, lines);
        }

        path.pop();
    }

    pub(crate) fn to_export(&self) -> ExportNode {
        ExportNode {
            label: self.label(),
            frame: self.frame.clone(),
            direct_bytes: self.direct_bytes,
            cumulative_bytes: self.cumulative_bytes,
            children: self.children().into_iter().map(Self::to_export).collect(),
        }
    }
}

/// Serializable form of a [`CallTreeNode`], produced by
/// [`PeakSnapshot::to_export()`][crate::PeakSnapshot::to_export].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ExportNode {
    /// Human-readable name of the node.
    pub label: String,

    /// The frame the node represents. Absent for the root.
    pub frame: Option<FrameDescriptor>,

    /// Bytes attributed to call stacks ending at this node.
    pub direct_bytes: u64,

    /// Bytes attributed to this node and everything beneath it.
    pub cumulative_bytes: u64,

    /// Child nodes, largest cumulative size first.
    pub children: Vec<ExportNode>,
}
