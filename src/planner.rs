//! Answers "what do I know about URI X?" without rescanning.
//!
//! A view combines the most recent ancestor snapshot with the denormalized
//! aggregates of fresher scans rooted below the target (*fresher-child
//! patching*). Patching is deliberately single-level: a fresher scan of a
//! direct child replaces that child's aggregates; a fresher scan deeper down
//! only marks the enclosing child as partially refreshed. After patching, the
//! target root is re-rolled from its direct children, so the top of the view
//! is consistent with what it displays; deeper rows may be older than their
//! displayed parent by design.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    blob::{store::BlobStore, NodeFilter},
    catalog::{Catalog, ScanRecord},
    error::{DuvizError, DuvizResult, ErrorKind},
    snapshot::{Node, NodeKind},
    uri::Uri,
};

/// How much of the requested tree the catalog could provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ViewStatus {
    /// The target itself was scanned and nothing fresher was mixed in
    Full,
    /// An ancestor scan covers the target, possibly with fresher patches
    Partial,
    /// No scan covers the target
    None,
}

/// Freshness marker of one view row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Patched {
    /// Data comes from the ancestor snapshot
    Inherited,
    /// Aggregates replaced from a fresher scan rooted at this row
    Scanned,
    /// Something below this row is fresher than the view shows
    Partial,
}

/// One row of a [`View`], re-rooted at the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewNode {
    /// Path relative to the target; `"."` for the target itself
    pub path: String,
    /// Relative path of the parent; `None` for the target, `"."` for its children
    pub parent: Option<String>,
    /// Entry kind
    pub kind: NodeKind,
    /// Aggregated size in bytes
    pub size: u64,
    /// Modification time in epoch seconds
    pub mtime: i64,
    /// Depth below the target
    pub depth: u32,
    /// Direct children
    pub n_children: u32,
    /// Total descendants
    pub n_desc: u64,
    /// Where this row's data comes from
    pub scanned: Patched,
    /// Completion time of the fresher scan, for patched rows
    pub scan_time: Option<DateTime<Utc>>,
}

/// The response of [`view`]: a re-rooted, mixed-freshness slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// The queried URI
    pub uri: Uri,
    /// Coverage of the answer
    pub status: ViewStatus,
    /// Catalog id of the ancestor scan the base slice came from
    pub scan_id: Option<i64>,
    /// Completion time of that ancestor scan
    pub completed_at: Option<DateTime<Utc>>,
    /// Rows in `(depth, path)` order; empty when `status` is `none`
    pub nodes: Vec<ViewNode>,
}

impl View {
    fn none(uri: Uri) -> Self {
        Self {
            uri,
            status: ViewStatus::None,
            scan_id: None,
            completed_at: None,
            nodes: Vec::new(),
        }
    }
}

/// Build the smallest correct tree rooted at `uri` down to `depth_limit`,
/// using the freshest data the catalog offers.
///
/// # Errors
///
/// * [`ErrorKind::Aborted`] when the deadline expires; no state is mutated.
/// * [`ErrorKind::BlobCorrupt`] when the chosen ancestor blob cannot be read.
pub(crate) fn view(
    catalog: &Catalog,
    blobs: &BlobStore,
    uri: &Uri,
    depth_limit: u32,
    deadline: Option<Instant>,
) -> DuvizResult<View> {
    check_deadline(deadline)?;

    // 1. + 2. resolve the ancestor scan and read the base slice with depth
    // pushdown; a corrupt blob demotes its row and the next ancestor is tried
    let (anc, target_depth, base) = loop {
        let Some(anc) = catalog.ancestor_for(uri)? else {
            debug!("no scan covers {uri}");
            return Ok(View::none(uri.clone()));
        };
        let target_depth = (uri.depth() - anc.root_uri.depth()) as u32;
        let filter = NodeFilter::uri_prefix(uri.clone())
            .with_min_depth(target_depth)
            .with_max_depth(target_depth.saturating_add(depth_limit));
        let sliced = blobs
            .open_blob(&anc.blob_id)
            .and_then(|reader| reader.scan(&filter).collect::<DuvizResult<Vec<Node>>>());
        match sliced {
            Ok(base) => break (anc, target_depth, base),
            Err(err) if err.kind() == ErrorKind::BlobCorrupt => {
                warn!("scan {} has a corrupt blob, flagging for repair: {err}", anc.id);
                catalog.mark_needs_repair(anc.id)?;
            }
            Err(err) => return Err(err),
        }
    };
    check_deadline(deadline)?;

    // the ancestor may predate the path's creation
    if base.first().map(|n| n.uri.as_str()) != Some(uri.as_str()) {
        debug!("{uri} is absent from the ancestor scan of {}", anc.root_uri);
        return Ok(View::none(uri.clone()));
    }

    // 3. rebase onto the target
    let mut nodes = rebase(&base, uri, target_depth);

    // 4. single-level fresher-child patching
    let fresher = catalog.fresher_children_of(uri, anc.completed_at)?;
    let mut patched = false;
    let mut partial = false;
    {
        let by_path: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.depth == 1)
            .map(|(i, n)| (n.path.clone(), i))
            .collect();

        for scan in &fresher {
            check_deadline(deadline)?;
            let Some(rel) = uri.rel_path_of(&scan.root_uri) else {
                continue;
            };
            let child = rel.split('/').next().unwrap_or_default().to_string();
            let direct = !rel.contains('/');
            match by_path.get(&child) {
                Some(&idx) if direct => {
                    let node = &mut nodes[idx];
                    // newest-per-root ordering makes the first patch the freshest
                    if node.scanned == Patched::Scanned {
                        continue;
                    }
                    node.size = scan.root_size;
                    node.n_children = scan.root_n_children;
                    node.n_desc = scan.root_n_desc;
                    node.scanned = Patched::Scanned;
                    node.scan_time = Some(scan.completed_at);
                    patched = true;
                }
                Some(&idx) => {
                    // fresher data lies below the depth-1 child; mark, don't traverse
                    let node = &mut nodes[idx];
                    if node.scanned == Patched::Inherited {
                        node.scanned = Patched::Partial;
                    }
                    partial = true;
                }
                // the child is absent from the ancestor snapshot; the view
                // reports what it knows rather than fabricating a row
                None => partial = true,
            }
        }
    }

    // 5. re-roll the target root from its (possibly patched) direct children
    if depth_limit >= 1 {
        reroll_root(&mut nodes);
    }

    // 6. status
    let status = if anc.root_uri == *uri && !patched && !partial {
        ViewStatus::Full
    } else {
        ViewStatus::Partial
    };

    Ok(View {
        uri: uri.clone(),
        status,
        scan_id: Some(anc.id),
        completed_at: Some(anc.completed_at),
        nodes,
    })
}

fn rebase(base: &[Node], target: &Uri, target_depth: u32) -> Vec<ViewNode> {
    base.iter()
        .map(|node| {
            let path = rel_of(target.as_str(), &node.uri);
            let depth = node.depth - target_depth;
            let parent = match depth {
                0 => None,
                1 => Some(".".to_string()),
                _ => Some(
                    path.rsplit_once('/')
                        .map(|(prefix, _)| prefix.to_string())
                        .unwrap_or_default(),
                ),
            };
            ViewNode {
                path,
                parent,
                kind: node.kind,
                size: node.size,
                mtime: node.mtime,
                depth,
                n_children: node.n_children,
                n_desc: node.n_desc,
                scanned: Patched::Inherited,
                scan_time: None,
            }
        })
        .collect()
}

/// Path of `uri` relative to `target`, both canonical, `target` covering.
fn rel_of(target: &str, uri: &str) -> String {
    if uri == target {
        ".".to_string()
    } else if target.ends_with('/') {
        uri[target.len()..].to_string()
    } else {
        uri[target.len() + 1..].to_string()
    }
}

/// Recompute the target row from the depth-1 rows so the top of the view
/// reflects the mixed-freshness data.
fn reroll_root(nodes: &mut [ViewNode]) {
    let mut size = 0_u64;
    let mut mtime = i64::MIN;
    let mut n_children = 0_u32;
    let mut n_desc = 0_u64;
    for node in nodes.iter().filter(|n| n.depth == 1) {
        size += node.size;
        mtime = mtime.max(node.mtime);
        n_children += 1;
        n_desc += node.n_desc + 1;
    }
    if n_children == 0 {
        return;
    }
    if let Some(root) = nodes.iter_mut().find(|n| n.depth == 0) {
        root.size = size;
        root.mtime = mtime;
        root.n_children = n_children;
        root.n_desc = n_desc;
    }
}

/// Row status of a child in a scan comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CompareStatus {
    /// Present only in the newer scan
    Added,
    /// Present only in the older scan
    Removed,
    /// Present in both with different aggregates
    Changed,
    /// Present in both with equal size and descendant count
    Unchanged,
}

/// One child row of a [`Comparison`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRow {
    /// Path relative to the compared URI
    pub path: String,
    /// How the child differs between the scans
    pub status: CompareStatus,
    pub size_old: Option<u64>,
    pub size_new: Option<u64>,
    pub size_delta: i64,
    pub n_desc_old: Option<u64>,
    pub n_desc_new: Option<u64>,
    pub n_desc_delta: i64,
}

/// The response of [`compare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    /// The compared URI
    pub uri: Uri,
    /// One row per direct child seen in either scan, sorted by path
    pub rows: Vec<CompareRow>,
    /// Sum of all size deltas
    pub total_delta: i64,
}

/// Compare how the direct children of `uri` changed between two scans.
///
/// Either scan may be rooted at a deeper ancestor; both are sliced the same
/// way [`view`] slices its base.
///
/// # Errors
///
/// * [`ErrorKind::NotFound`] if a scan id is unknown or does not cover `uri`.
/// * [`ErrorKind::Aborted`] when the deadline expires.
pub(crate) fn compare(
    catalog: &Catalog,
    blobs: &BlobStore,
    uri: &Uri,
    scan_a: i64,
    scan_b: i64,
    deadline: Option<Instant>,
) -> DuvizResult<Comparison> {
    check_deadline(deadline)?;
    let old = children_in_scan(catalog, blobs, uri, scan_a)?;
    check_deadline(deadline)?;
    let new = children_in_scan(catalog, blobs, uri, scan_b)?;
    check_deadline(deadline)?;

    let paths: Vec<String> = old
        .keys()
        .chain(new.keys())
        .cloned()
        .sorted_unstable()
        .dedup()
        .collect();

    let mut rows = Vec::with_capacity(paths.len());
    let mut total_delta = 0_i64;
    for path in paths {
        let old = old.get(&path);
        let new = new.get(&path);
        let status = match (old, new) {
            (None, Some(_)) => CompareStatus::Added,
            (Some(_), None) => CompareStatus::Removed,
            (Some(o), Some(n)) if o.size == n.size && o.n_desc == n.n_desc => {
                CompareStatus::Unchanged
            }
            _ => CompareStatus::Changed,
        };
        let size_old = old.map(|n| n.size);
        let size_new = new.map(|n| n.size);
        let n_desc_old = old.map(|n| n.n_desc);
        let n_desc_new = new.map(|n| n.n_desc);
        let size_delta = size_new.unwrap_or(0) as i64 - size_old.unwrap_or(0) as i64;
        total_delta += size_delta;
        rows.push(CompareRow {
            path,
            status,
            size_old,
            size_new,
            size_delta,
            n_desc_old,
            n_desc_new,
            n_desc_delta: n_desc_new.unwrap_or(0) as i64 - n_desc_old.unwrap_or(0) as i64,
        });
    }

    Ok(Comparison {
        uri: uri.clone(),
        rows,
        total_delta,
    })
}

/// The direct children of `uri` inside the given scan, keyed by name.
fn children_in_scan(
    catalog: &Catalog,
    blobs: &BlobStore,
    uri: &Uri,
    scan_id: i64,
) -> DuvizResult<HashMap<String, Node>> {
    let record = catalog.by_id(scan_id)?.ok_or_else(|| {
        DuvizError::new(ErrorKind::NotFound, "No scan with this id exists.")
            .attach_context("scan", scan_id.to_string())
    })?;
    let (_, children) = slice_at(blobs, &record, uri, 1)?.ok_or_else(|| {
        DuvizError::new(
            ErrorKind::NotFound,
            "The scan does not cover the compared URI.",
        )
        .attach_context("scan", scan_id.to_string())
        .attach_context("uri", uri.to_string())
    })?;

    Ok(children
        .into_iter()
        .map(|n| (rel_of(uri.as_str(), &n.uri), n))
        .collect())
}

/// Slice `record`'s blob at `uri`: the target row plus rows down to
/// `depth_limit` below it, or `None` when the scan does not cover the URI.
pub(crate) fn slice_at(
    blobs: &BlobStore,
    record: &ScanRecord,
    uri: &Uri,
    depth_limit: u32,
) -> DuvizResult<Option<(Node, Vec<Node>)>> {
    if !record.root_uri.is_ancestor_of(uri) {
        return Ok(None);
    }
    let target_depth = (uri.depth() - record.root_uri.depth()) as u32;
    let reader = blobs.open_blob(&record.blob_id)?;
    let filter = NodeFilter::uri_prefix(uri.clone())
        .with_min_depth(target_depth)
        .with_max_depth(target_depth.saturating_add(depth_limit));
    let mut rows = reader.scan(&filter).collect::<DuvizResult<Vec<_>>>()?;
    if rows.first().map(|n| n.uri.as_str()) != Some(uri.as_str()) {
        return Ok(None);
    }
    let target = rows.remove(0);
    Ok(Some((target, rows)))
}

fn check_deadline(deadline: Option<Instant>) -> DuvizResult<()> {
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Err(DuvizError::new(
            ErrorKind::Aborted,
            "The request deadline expired.",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::aggregate::testing::snapshot_at;
    use crate::catalog::ScanRecord;
    use crate::snapshot::Snapshot;

    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        catalog: Catalog,
        blobs: BlobStore,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let catalog = Catalog::open(tmp.path().join("catalog.db")).unwrap();
            let blobs = BlobStore::open(tmp.path().join("blobs")).unwrap();
            Self {
                _tmp: tmp,
                catalog,
                blobs,
            }
        }

        fn commit(&self, snapshot: &Snapshot) -> i64 {
            let blob_id = self.blobs.put(snapshot).unwrap();
            self.catalog
                .insert_scan(&ScanRecord::for_snapshot(snapshot, blob_id))
                .unwrap()
        }

        fn view(&self, uri: &str, depth: u32) -> View {
            view(
                &self.catalog,
                &self.blobs,
                &Uri::parse(uri).unwrap(),
                depth,
                None,
            )
            .unwrap()
        }
    }

    fn node<'a>(view: &'a View, path: &str) -> &'a ViewNode {
        view.nodes.iter().find(|n| n.path == path).unwrap()
    }

    #[test]
    fn test_view_with_no_scans_is_none() {
        let fx = Fixture::new();
        let view = fx.view("/", 2);
        assert_eq!(view.status, ViewStatus::None);
        assert!(view.nodes.is_empty());
    }

    #[test]
    fn test_view_of_scanned_root_is_full() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a", &[("x", 10, 5), ("sub/y", 20, 9)], 100));

        let view = fx.view("/a", 2);

        assert_eq!(view.status, ViewStatus::Full);
        assert_eq!(node(&view, ".").size, 30);
        assert_eq!(node(&view, ".").parent, None);
        assert_eq!(node(&view, "x").parent.as_deref(), Some("."));
        assert_eq!(node(&view, "sub/y").parent.as_deref(), Some("sub"));
    }

    #[test]
    fn test_view_depth_limit_truncates() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a", &[("s/t/u/v", 10, 5)], 100));

        let view = fx.view("/a", 2);
        let deepest = view.nodes.iter().map(|n| n.depth).max().unwrap();

        assert_eq!(deepest, 2);
        assert!(view.nodes.iter().all(|n| n.path != "s/t/u"));
    }

    #[test]
    fn test_view_reroots_below_ancestor() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at(
            "/home/u",
            &[("docs/a", 7, 1), ("docs/b", 9, 2), ("other", 100, 3)],
            100,
        ));

        let view = fx.view("/home/u/docs", 2);

        assert_eq!(view.status, ViewStatus::Partial);
        let root = node(&view, ".");
        assert_eq!(root.size, 16);
        assert_eq!(root.n_children, 2);
        assert_eq!(root.n_desc, 2);
        assert_eq!(node(&view, "a").size, 7);
        assert_eq!(node(&view, "b").parent.as_deref(), Some("."));
        assert!(view.nodes.iter().all(|n| n.path != "other"));
    }

    #[test]
    fn test_view_of_uri_absent_from_ancestor_is_none() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a", &[("x", 10, 5)], 100));

        let view = fx.view("/a/created-later", 1);
        assert_eq!(view.status, ViewStatus::None);
    }

    #[test]
    fn test_fresher_child_patch_rewrites_aggregates() {
        let fx = Fixture::new();
        // /a at t=100: b holds 3, c holds 7, so the root holds 10
        _ = fx.commit(&snapshot_at("/a", &[("b/f", 3, 1), ("c/g", 7, 1)], 100));
        // /a/b at t=200: now holds 5
        let b = snapshot_at("/a/b", &[("f", 2, 2), ("f2", 3, 2)], 200);
        let b_n_desc = b.root().n_desc;
        _ = fx.commit(&b);

        let view = fx.view("/a", 1);

        assert_eq!(view.status, ViewStatus::Partial);
        let patched = node(&view, "b");
        assert_eq!(patched.scanned, Patched::Scanned);
        assert_eq!(patched.size, 5);
        assert_eq!(patched.n_desc, b_n_desc);
        assert_eq!(patched.scan_time.unwrap().timestamp(), 200);
        assert_eq!(node(&view, "c").scanned, Patched::Inherited);
        // 10 - 3 + 5
        assert_eq!(node(&view, ".").size, 12);
    }

    #[test]
    fn test_stale_child_scan_does_not_patch() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a/b", &[("f", 99, 1)], 50));
        _ = fx.commit(&snapshot_at("/a", &[("b/f", 3, 1)], 100));

        let view = fx.view("/a", 1);

        assert_eq!(view.status, ViewStatus::Full);
        assert_eq!(node(&view, "b").size, 3);
        assert_eq!(node(&view, "b").scanned, Patched::Inherited);
    }

    #[test]
    fn test_deep_fresher_scan_marks_enclosing_child_partial() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a", &[("b/deep/f", 3, 1)], 100));
        _ = fx.commit(&snapshot_at("/a/b/deep", &[("f", 8, 2)], 200));

        let view = fx.view("/a", 1);

        assert_eq!(view.status, ViewStatus::Partial);
        let b = node(&view, "b");
        assert_eq!(b.scanned, Patched::Partial);
        // aggregates stay inherited; patching does not recurse
        assert_eq!(b.size, 3);
    }

    #[test]
    fn test_view_is_idempotent() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a", &[("b/f", 3, 1), ("c", 7, 1)], 100));
        _ = fx.commit(&snapshot_at("/a/b", &[("f", 5, 2)], 200));

        let first = fx.view("/a", 2);
        let second = fx.view("/a", 2);

        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_blob_is_demoted_and_skipped() {
        let fx = Fixture::new();
        let old = fx.commit(&snapshot_at("/a", &[("x", 9, 1)], 100));
        let broken = fx.commit(&snapshot_at("/a", &[("x", 10, 2)], 200));

        // the newest blob goes missing on disk
        let blob = fx.catalog.by_id(broken).unwrap().unwrap().blob_id;
        fx.blobs.delete(&blob).unwrap();

        let view = fx.view("/a", 1);

        // the older scan answers, the broken row is flagged for repair
        assert_eq!(view.scan_id, Some(old));
        assert_eq!(node(&view, "x").size, 9);
        assert!(fx.catalog.by_id(broken).unwrap().unwrap().needs_repair);
    }

    #[test]
    fn test_view_deadline_aborts() {
        let fx = Fixture::new();
        _ = fx.commit(&snapshot_at("/a", &[("x", 1, 1)], 100));

        let expired = Instant::now() - std::time::Duration::from_secs(1);
        let err = view(
            &fx.catalog,
            &fx.blobs,
            &Uri::parse("/a").unwrap(),
            1,
            Some(expired),
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Aborted);
    }

    #[test]
    fn test_compare_added_removed_changed() {
        let fx = Fixture::new();
        let a = fx.commit(&snapshot_at("/x", &[("a", 10, 1), ("b", 20, 1)], 100));
        let b = fx.commit(&snapshot_at("/x", &[("b", 20, 2), ("c", 5, 2)], 200));

        let cmp = compare(
            &fx.catalog,
            &fx.blobs,
            &Uri::parse("/x").unwrap(),
            a,
            b,
            None,
        )
        .unwrap();

        let by_path: HashMap<&str, &CompareRow> =
            cmp.rows.iter().map(|r| (r.path.as_str(), r)).collect();
        assert_eq!(by_path["a"].status, CompareStatus::Removed);
        assert_eq!(by_path["a"].size_delta, -10);
        assert_eq!(by_path["b"].status, CompareStatus::Unchanged);
        assert_eq!(by_path["c"].status, CompareStatus::Added);
        assert_eq!(by_path["c"].size_delta, 5);
        assert_eq!(cmp.total_delta, -5);
    }

    #[test]
    fn test_compare_slices_through_deeper_ancestor() {
        let fx = Fixture::new();
        let a = fx.commit(&snapshot_at("/x", &[("sub/a", 10, 1)], 100));
        let b = fx.commit(&snapshot_at("/x/sub", &[("a", 12, 2)], 200));

        let cmp = compare(
            &fx.catalog,
            &fx.blobs,
            &Uri::parse("/x/sub").unwrap(),
            a,
            b,
            None,
        )
        .unwrap();

        assert_eq!(cmp.rows.len(), 1);
        assert_eq!(cmp.rows[0].status, CompareStatus::Changed);
        assert_eq!(cmp.rows[0].size_delta, 2);
    }

    #[test]
    fn test_compare_uncovered_uri_is_an_error() {
        let fx = Fixture::new();
        let a = fx.commit(&snapshot_at("/x", &[("a", 10, 1)], 100));

        let err = compare(
            &fx.catalog,
            &fx.blobs,
            &Uri::parse("/elsewhere").unwrap(),
            a,
            a,
            None,
        )
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
