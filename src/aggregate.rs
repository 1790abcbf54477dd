//! Fold a probe stream into a [`Snapshot`] with rollups.
//!
//! The stream carries no ordering guarantee (object listings come in key
//! order, local walks in path order), so entries are buffered per URI and the
//! rollups are computed bottom-up once the stream is exhausted. Intermediate
//! directories that the source never reports - object-store prefixes, entries
//! lost to races - are synthesized so every snapshot is a closed tree.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use chrono::Utc;
use log::{debug, warn};

use crate::{
    error::DuvizResult,
    probe::Probe,
    snapshot::{Node, NodeKind, Snapshot},
    uri::Uri,
};

pub(crate) mod constants {
    use std::time::Duration;

    /// Report progress at least every this many stream items
    pub(crate) const PROGRESS_ITEMS: u64 = 10_000;
    /// ... or at least this often
    pub(crate) const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);
}

/// Receives live counters while a scan is running.
pub trait ScanObserver {
    /// Called at a bounded frequency with the running totals.
    fn on_progress(&mut self, items_found: u64, items_per_sec: Option<f64>, error_count: u64);
}

/// An observer that ignores all progress.
#[derive(Debug, Clone, Copy)]
pub struct NoObserver;

impl ScanObserver for NoObserver {
    fn on_progress(&mut self, _: u64, _: Option<f64>, _: u64) {}
}

/// A buffered entry waiting for the stream to close.
struct Pending {
    kind: NodeKind,
    size: u64,
    mtime: i64,
    depth: u32,
    parent: Option<String>,
}

#[derive(Default)]
struct Roll {
    size: u64,
    mtime: i64,
    n_children: u32,
    n_desc: u64,
}

/// Aggregate the probe's entry stream into a snapshot.
///
/// Per-path stream errors are counted, sampled (up to `sample_error_paths`)
/// and never abort the scan.
///
/// # Errors
///
/// * If the probe cannot start enumerating at all (unreadable root).
pub fn aggregate<P: Probe>(
    probe: P,
    sample_error_paths: usize,
    observer: &mut dyn ScanObserver,
) -> DuvizResult<Snapshot> {
    let root = probe.root().clone();
    let root_depth = root.depth();
    let entries = probe.entries()?;

    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut error_count: u64 = 0;
    let mut error_paths: Vec<String> = Vec::new();
    let mut items: u64 = 0;
    let mut tick = ProgressTick::new();

    let ensure_slot = |map: &mut HashMap<String, Pending>, uri: &Uri| {
        if map.contains_key(uri.as_str()) {
            return;
        }
        let parent = uri
            .parent()
            .filter(|_| uri.depth() > root_depth)
            .map(|p| p.to_string());
        _ = map.insert(
            uri.to_string(),
            Pending {
                kind: NodeKind::Dir,
                size: 0,
                mtime: 0,
                depth: (uri.depth() - root_depth) as u32,
                parent,
            },
        );
    };

    for item in entries {
        match item {
            Ok(entry) => {
                if !root.is_ancestor_of(&entry.uri) {
                    warn!("probe reported entry outside the root: {}", entry.uri);
                    continue;
                }
                // close the tree: all ancestors up to the root must have a row
                for anc in entry.uri.self_and_ancestors() {
                    if !root.is_ancestor_of(&anc) {
                        break;
                    }
                    ensure_slot(&mut pending, &anc);
                }
                // the slot exists now; record the probed metadata
                if let Some(slot) = pending.get_mut(entry.uri.as_str()) {
                    slot.kind = entry.kind;
                    slot.size = entry.size;
                    slot.mtime = entry.mtime;
                }
                items += 1;
                tick.maybe_report(observer, items, error_count);
            }
            Err(err) => {
                warn!("scan error at {}: {}", err.path, err.error);
                error_count += 1;
                if error_paths.len() < sample_error_paths {
                    error_paths.push(err.path);
                }
            }
        }
    }

    // a scan of an empty source still has a root row
    ensure_slot(&mut pending, &root);

    observer.on_progress(items, None, error_count);
    debug!("aggregating {} rows for {root}", pending.len());

    let nodes = roll_up(pending);
    Ok(Snapshot::from_sorted_nodes(
        root,
        Utc::now(),
        error_count,
        error_paths,
        nodes,
    ))
}

/// Compute the per-directory rollups bottom-up and emit `(depth, uri)`-sorted rows.
fn roll_up(pending: HashMap<String, Pending>) -> Vec<Node> {
    let mut items: Vec<(String, Pending)> = pending.into_iter().collect();
    items.sort_by(|a, b| b.1.depth.cmp(&a.1.depth).then_with(|| a.0.cmp(&b.0)));

    let mut acc: HashMap<String, Roll> = HashMap::new();
    let mut nodes = Vec::with_capacity(items.len());

    for (uri, entry) in items {
        let roll = acc.remove(&uri).unwrap_or_default();
        // a key can shadow a prefix in object stores; children win
        let kind = if roll.n_children > 0 {
            NodeKind::Dir
        } else {
            entry.kind
        };
        let node = match kind {
            NodeKind::Dir => Node {
                uri,
                kind,
                size: roll.size,
                mtime: if roll.n_children > 0 {
                    roll.mtime
                } else {
                    entry.mtime
                },
                parent: entry.parent,
                depth: entry.depth,
                n_children: roll.n_children,
                n_desc: roll.n_desc,
            },
            NodeKind::File => Node {
                uri,
                kind,
                size: entry.size,
                mtime: entry.mtime,
                parent: entry.parent,
                depth: entry.depth,
                n_children: 0,
                n_desc: 0,
            },
        };
        if let Some(parent) = &node.parent {
            let roll = acc.entry(parent.clone()).or_default();
            roll.size += node.size;
            roll.mtime = roll.mtime.max(node.mtime);
            roll.n_children += 1;
            roll.n_desc += node.n_desc + 1;
        }
        nodes.push(node);
    }

    nodes.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.uri.cmp(&b.uri)));
    nodes
}

struct ProgressTick {
    last_at: Instant,
    last_items: u64,
}

impl ProgressTick {
    fn new() -> Self {
        Self {
            last_at: Instant::now(),
            last_items: 0,
        }
    }

    fn maybe_report(&mut self, observer: &mut dyn ScanObserver, items: u64, errors: u64) {
        let elapsed = self.last_at.elapsed();
        if items - self.last_items < constants::PROGRESS_ITEMS
            && elapsed < constants::PROGRESS_INTERVAL
        {
            return;
        }
        let rate = rate_of(items - self.last_items, elapsed);
        observer.on_progress(items, rate, errors);
        self.last_at = Instant::now();
        self.last_items = items;
    }
}

fn rate_of(items: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.0).then(|| items as f64 / secs)
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::{
        error::{DuvizError, ErrorKind},
        probe::EntryError,
    };

    use super::{testing::*, *};

    #[test]
    fn test_rollups_and_synthesized_dirs() {
        let snap = snapshot_of(
            "/r",
            &[
                ("a/x", 1024, 100),
                ("a/y", 512, 300),
                ("a/deep/z", 512, 200),
                ("top", 2048, 50),
            ],
        );

        snap.check_consistency().unwrap();

        let root = snap.root();
        assert_eq!(root.size, 4096);
        assert_eq!(root.n_children, 2);
        assert_eq!(root.n_desc, 6);
        assert_eq!(root.mtime, 300);

        // `a` and `a/deep` were never reported, only their files
        let a = snap.find("/r/a").unwrap();
        assert_eq!(a.kind, NodeKind::Dir);
        assert_eq!(a.size, 2048);
        assert_eq!(a.n_children, 3);
        assert_eq!(a.n_desc, 4);
        assert_eq!(a.mtime, 300);

        let deep = snap.find("/r/a/deep").unwrap();
        assert_eq!(deep.n_children, 1);
        assert_eq!(deep.mtime, 200);
    }

    #[test]
    fn test_rows_are_depth_sorted() {
        let snap = snapshot_of("/r", &[("b/c/d", 1, 0), ("a", 1, 0)]);
        let depths: Vec<u32> = snap.nodes().iter().map(|n| n.depth).collect();
        let mut sorted = depths.clone();
        sorted.sort_unstable();
        assert_eq!(depths, sorted);
        assert_eq!(snap.root().uri, "/r");
    }

    #[test]
    fn test_errors_are_counted_and_sampled() {
        let root = Uri::parse("/r").unwrap();
        let mut entries: Vec<crate::probe::EntryResult> = (0..5)
            .map(|i| {
                Err(EntryError {
                    path: format!("/r/denied{i}"),
                    error: DuvizError::new(ErrorKind::SourcePermission, "denied"),
                })
            })
            .collect();
        entries.push(Ok(crate::probe::RawEntry {
            uri: root.join("ok").unwrap(),
            kind: NodeKind::File,
            size: 1,
            mtime: 0,
        }));

        let snap = aggregate(VecProbe { root, entries }, 3, &mut NoObserver).unwrap();

        assert_eq!(snap.error_count, 5);
        assert_eq!(snap.error_paths.len(), 3);
        assert_eq!(snap.root().size, 1);
    }

    #[test]
    fn test_empty_source_still_has_a_root() {
        let root = Uri::parse("/r").unwrap();
        let snap = aggregate(
            VecProbe {
                root,
                entries: vec![],
            },
            100,
            &mut NoObserver,
        )
        .unwrap();

        assert_eq!(snap.nodes().len(), 1);
        assert_eq!(snap.root().n_desc, 0);
        snap.check_consistency().unwrap();
    }

    proptest! {
        #[test]
        fn prop_aggregated_snapshots_are_consistent(
            files in prop::collection::vec(
                (
                    prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d"]), 1..4),
                    0u64..10_000,
                    0i64..1_000_000,
                ),
                0..40,
            )
        ) {
            let specs: Vec<(String, u64, i64)> = files
                .into_iter()
                .map(|(segs, size, mtime)| (segs.join("/"), size, mtime))
                .collect();
            let spec_refs: Vec<(&str, u64, i64)> = specs
                .iter()
                .map(|(p, s, m)| (p.as_str(), *s, *m))
                .collect();

            let snap = snapshot_of("/r", &spec_refs);
            prop_assert!(snap.check_consistency().is_ok());

            // rows are depth-sorted so depth-bounded prefixes are leading runs
            let depths: Vec<u32> = snap.nodes().iter().map(|n| n.depth).collect();
            let mut sorted = depths.clone();
            sorted.sort_unstable();
            prop_assert_eq!(depths, sorted);
        }
    }
}
