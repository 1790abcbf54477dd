//! In-memory representation of a materialized scan.
//!
//! A [`Snapshot`] is the immutable result of one scan: one [`Node`] row per
//! encountered entry, sorted by `(depth, uri)` so that all rows up to a given
//! depth form a leading run. The sort order is what lets the columnar blob
//! format serve depth-bounded reads without decoding the whole file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DuvizError, DuvizResult, ErrorKind},
    uri::Uri,
};

/// Kind of a snapshot row.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NodeKind {
    /// A regular file (or any non-directory entry)
    File,
    /// A directory
    Dir,
}

impl NodeKind {
    /// Stable single-byte encoding used by the blob format.
    #[must_use]
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::File => 0,
            Self::Dir => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> DuvizResult<Self> {
        match v {
            0 => Ok(Self::File),
            1 => Ok(Self::Dir),
            _ => Err(DuvizError::new(
                ErrorKind::BlobCorrupt,
                "Unknown node kind byte in snapshot blob.",
            )
            .attach_context("value", v.to_string())),
        }
    }
}

/// One row of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Canonical URI of the entry
    pub uri: String,
    /// Entry kind
    pub kind: NodeKind,
    /// Allocated size in bytes; for directories the rollup over all children
    pub size: u64,
    /// Modification time in epoch seconds; for directories the maximum over children
    pub mtime: i64,
    /// URI of the parent row; `None` only for the snapshot root
    pub parent: Option<String>,
    /// Distance from the snapshot root
    pub depth: u32,
    /// Number of direct children (0 for files)
    pub n_children: u32,
    /// Number of rows strictly below (0 for files)
    pub n_desc: u64,
}

impl Node {
    /// Whether this row is a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir)
    }
}

/// The immutable, materialized result of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// The scanned root
    pub root_uri: Uri,
    /// When the scan finished
    pub completed_at: DateTime<Utc>,
    /// Number of per-path errors encountered while scanning
    pub error_count: u64,
    /// Sampled paths that produced errors
    pub error_paths: Vec<String>,
    /// Rows, sorted by `(depth, uri)`
    nodes: Vec<Node>,
}

impl Snapshot {
    /// Assemble a snapshot from rows which are already sorted by `(depth, uri)`.
    pub(crate) fn from_sorted_nodes(
        root_uri: Uri,
        completed_at: DateTime<Utc>,
        error_count: u64,
        error_paths: Vec<String>,
        nodes: Vec<Node>,
    ) -> Self {
        debug_assert!(nodes
            .windows(2)
            .all(|w| (w[0].depth, &w[0].uri) < (w[1].depth, &w[1].uri)));
        Self {
            root_uri,
            completed_at,
            error_count,
            error_paths,
            nodes,
        }
    }

    /// All rows, in `(depth, uri)` order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The root row.
    ///
    /// # Panics
    ///
    /// Panics on an empty snapshot, which [`aggregate`](crate::aggregate) never produces.
    #[must_use]
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// The deepest level present.
    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.nodes.last().map_or(0, |n| n.depth)
    }

    /// Find the row with the given URI.
    #[must_use]
    pub fn find(&self, uri: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.uri == uri)
    }

    /// Verify the structural invariants: a single root, closed parent edges,
    /// and per-directory rollups of `size`, `mtime`, `n_children` and `n_desc`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::Internal`] naming the first violated invariant.
    pub fn check_consistency(&self) -> DuvizResult<()> {
        use std::collections::HashMap;

        let fail = |what: &str, uri: &str| {
            Err(DuvizError::new(ErrorKind::Internal, "Snapshot violates a structural invariant.")
                .attach_context("invariant", what.to_string())
                .attach_context("uri", uri.to_string()))
        };

        let Some(root) = self.nodes.first() else {
            return fail("non-empty", self.root_uri.as_str());
        };
        if root.depth != 0 || root.parent.is_some() || root.uri != self.root_uri.as_str() {
            return fail("root row", &root.uri);
        }

        let by_uri: HashMap<&str, &Node> =
            self.nodes.iter().map(|n| (n.uri.as_str(), n)).collect();

        #[derive(Default)]
        struct Roll {
            size: u64,
            mtime: i64,
            n_children: u32,
            n_desc: u64,
        }
        let mut rollups: HashMap<&str, Roll> = HashMap::new();

        for node in &self.nodes[1..] {
            let Some(parent_uri) = node.parent.as_deref() else {
                return fail("single root", &node.uri);
            };
            let Some(parent) = by_uri.get(parent_uri) else {
                return fail("parent exists", &node.uri);
            };
            if parent.depth + 1 != node.depth || !parent.is_dir() {
                return fail("parent edge", &node.uri);
            }
            let roll = rollups.entry(parent_uri).or_default();
            roll.size += node.size;
            roll.mtime = roll.mtime.max(node.mtime);
            roll.n_children += 1;
            roll.n_desc += node.n_desc + 1;
        }

        for node in &self.nodes {
            if !node.is_dir() {
                if node.n_children != 0 || node.n_desc != 0 {
                    return fail("file rollups", &node.uri);
                }
                continue;
            }
            let roll = rollups.remove(node.uri.as_str()).unwrap_or_default();
            if node.size != roll.size
                || node.n_children != roll.n_children
                || node.n_desc != roll.n_desc
            {
                return fail("dir rollups", &node.uri);
            }
            // empty dirs keep their probed mtime
            if roll.n_children > 0 && node.mtime != roll.mtime {
                return fail("dir mtime", &node.uri);
            }
        }

        Ok(())
    }
}
