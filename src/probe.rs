//! Probes produce the raw entry stream a scan is built from.
//!
//! A probe enumerates one source - a local tree or a bucket prefix - and
//! yields one [`RawEntry`] per encountered entry as a finite, non-restartable
//! sequence. Per-path failures below the root are yielded as [`EntryError`]s
//! and never abort the stream; only an unreadable root is fatal.

pub(crate) mod command;
pub(crate) mod local;
#[cfg(feature = "s3")]
pub(crate) mod object;

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    error::{DuvizError, DuvizResult},
    service::command_input::CommandInput,
    snapshot::NodeKind,
    uri::Uri,
};

/// One raw entry reported by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Canonical URI of the entry
    pub uri: Uri,
    /// Entry kind; everything that is not a directory is reported as a file
    pub kind: NodeKind,
    /// Allocated size in bytes (0 for directories)
    pub size: u64,
    /// Modification time in epoch seconds
    pub mtime: i64,
}

/// A per-path failure inside an otherwise healthy probe stream.
#[derive(Debug)]
pub struct EntryError {
    /// The path that could not be read
    pub path: String,
    /// What went wrong
    pub error: Box<DuvizError>,
}

/// Item type of a probe stream.
pub type EntryResult = Result<RawEntry, EntryError>;

/// A source of raw entries.
///
/// The stream is finite and non-restartable; `entries` consumes the probe.
pub trait Probe {
    /// The entry stream.
    type Iter: Iterator<Item = EntryResult>;

    /// The root this probe enumerates.
    fn root(&self) -> &Uri;

    /// Start enumerating.
    ///
    /// # Errors
    ///
    /// * If the root itself cannot be read; per-path failures below the root
    ///   are reported in-stream instead.
    fn entries(self) -> DuvizResult<Self::Iter>;
}

/// Options controlling how probes enumerate a source.
#[serde_as]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "merge", derive(conflate::Merge))]
#[derive(Deserialize, Serialize, Clone, Default, Debug, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct ProbeOptions {
    /// Glob patterns to exclude from local scans (can be specified multiple times)
    #[cfg_attr(feature = "clap", clap(long = "exclude-glob", value_name = "GLOB"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::vec::overwrite_empty))]
    pub exclude_globs: Vec<String>,

    /// Follow symlinks instead of recording the link itself
    #[cfg_attr(feature = "clap", clap(long))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::bool::overwrite_false))]
    pub follow_symlinks: bool,

    /// Report each inode only once, even when reachable via several links
    #[cfg_attr(feature = "clap", clap(long))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::bool::overwrite_false))]
    pub dedupe_by_inode: bool,

    /// Don't cross filesystem boundaries
    #[cfg_attr(feature = "clap", clap(long, short = 'x'))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::bool::overwrite_false))]
    pub one_file_system: bool,

    /// Use an external enumerator command instead of the built-in walker.
    ///
    /// The command gets the root path appended and must print one
    /// `<kind> <512-blocks> <mtime> <path>` line per entry, the shape of
    /// `find -printf "%y %b %T@ %p\n"`.
    #[cfg_attr(feature = "clap", clap(long, value_name = "COMMAND"))]
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub enumerator_command: Option<CommandInput>,
}

/// Options for reaching object-store buckets.
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "merge", derive(conflate::Merge))]
#[derive(Deserialize, Serialize, Clone, Default, Debug, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct ObjectStoreOptions {
    /// Buckets this index knows about (can be specified multiple times)
    #[cfg_attr(feature = "clap", clap(long = "bucket", value_name = "BUCKET"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::vec::overwrite_empty))]
    pub buckets: Vec<String>,

    /// Custom endpoint, e.g. for S3-compatible stores
    #[cfg_attr(feature = "clap", clap(long, value_name = "URL"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub endpoint: Option<String>,

    /// Bucket region
    #[cfg_attr(feature = "clap", clap(long, value_name = "REGION"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub region: Option<String>,

    /// Retries for transient listing failures
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub retries: Option<usize>,

    /// Cap on concurrent requests against the store
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub connections: Option<usize>,
}
