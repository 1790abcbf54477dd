//! Deletes filesystem entries and keeps derived snapshots consistent.
//!
//! Deletion is contents-first and keeps going past per-path failures. After
//! the source mutation every snapshot whose tree contains the deleted path is
//! rewritten: the subtree rows are dropped, the ancestor chain inside the
//! snapshot loses the deleted size and descendant count, and the catalog row
//! swaps to the rewritten blob. Snapshots rooted at or below the deleted
//! path describe a tree that no longer exists and are dropped outright. A
//! snapshot that cannot be rewritten is marked `needs_repair` so planners
//! skip it; the deletion itself still succeeds.

use std::{collections::HashMap, fs};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::{
    blob::{format::uri_has_prefix, store::BlobStore},
    catalog::{Catalog, ScanRecord},
    error::{DuvizError, DuvizResult, ErrorKind},
    planner,
    snapshot::{Node, Snapshot},
    uri::{Scheme, Uri},
};

/// Outcome of a [`delete`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    /// Whether every entry under the path was deleted
    pub ok: bool,
    /// Size of the deleted subtree, from the smallest covering snapshot
    pub deleted_size: u64,
    /// Descendants of the deleted subtree, from the same snapshot
    pub deleted_n_desc: u64,
    /// Paths that could not be deleted
    pub error_paths: Vec<String>,
}

/// Delete `uri` from the local filesystem and repair affected snapshots.
///
/// # Errors
///
/// * [`ErrorKind::InvalidUri`] for scheme roots.
/// * [`ErrorKind::UnsupportedScheme`] for object URIs; object deletes are
///   rejected by policy.
/// * [`ErrorKind::NotFound`] when the path does not exist.
pub(crate) fn delete(
    catalog: &Catalog,
    blobs: &BlobStore,
    uri: &Uri,
) -> DuvizResult<DeleteResult> {
    if uri.is_scheme_root() {
        return Err(DuvizError::new(
            ErrorKind::InvalidUri,
            "Refusing to delete a scheme root.",
        )
        .attach_context("uri", uri.to_string()));
    }
    if uri.scheme() != Scheme::Local {
        return Err(DuvizError::new(
            ErrorKind::UnsupportedScheme,
            "Deleting object-store entries is not supported.",
        )
        .attach_context("uri", uri.to_string()));
    }

    // size bookkeeping comes from the snapshot with the smallest covering tree
    let (deleted_size, deleted_n_desc) = match catalog.smallest_covering(uri)? {
        Some(record) => planner::slice_at(blobs, &record, uri, 0)?
            .map_or((0, 0), |(target, _)| (target.size, target.n_desc)),
        None => (0, 0),
    };

    let error_paths = delete_from_fs(uri)?;
    let ok = error_paths.is_empty();
    info!(
        "deleted {uri} ({deleted_size} bytes, {deleted_n_desc} descendants, {} failures)",
        error_paths.len()
    );

    // snapshots rooted at or below the deleted path have nothing left to describe
    for record in catalog.scans_at_or_under(uri)? {
        debug!("dropping scan {} rooted at deleted path", record.id);
        catalog.delete_scan(record.id)?;
        if catalog.blob_refs(&record.blob_id)? == 0 {
            blobs.delete(&record.blob_id)?;
        }
    }

    // rewrite every snapshot that contains the path below its root
    for record in catalog.history_for(uri)? {
        if record.root_uri == *uri {
            continue;
        }
        if let Err(err) = repair_one(catalog, blobs, &record, uri) {
            warn!(
                "deferring repair of scan {} after deleting {uri}: {err}",
                record.id
            );
            catalog.mark_needs_repair(record.id)?;
        }
    }

    Ok(DeleteResult {
        ok,
        deleted_size,
        deleted_n_desc,
        error_paths,
    })
}

/// Remove the entry contents-first, collecting per-path failures.
fn delete_from_fs(uri: &Uri) -> DuvizResult<Vec<String>> {
    let path = uri
        .to_local_path()
        .ok_or_else(|| DuvizError::new(ErrorKind::Internal, "Local URI without a path."))?;

    let meta = fs::symlink_metadata(&path).map_err(|err| {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::SourcePermission,
            _ => ErrorKind::Internal,
        };
        DuvizError::with_source(kind, "Failed to stat the path to delete.", err)
            .attach_context("path", path.display().to_string())
    })?;

    let mut error_paths = Vec::new();
    if !meta.is_dir() {
        if let Err(err) = fs::remove_file(&path) {
            warn!("failed to delete {}: {err}", path.display());
            error_paths.push(path.display().to_string());
        }
        return Ok(error_paths);
    }

    for entry in WalkDir::new(&path).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("failed to walk during delete: {err}");
                error_paths.push(err.to_string());
                continue;
            }
        };
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        if let Err(err) = result {
            warn!("failed to delete {}: {err}", entry.path().display());
            error_paths.push(entry.path().display().to_string());
        }
    }
    Ok(error_paths)
}

/// Rewrite one covering snapshot without the deleted subtree.
///
/// The subtracted size and descendant count are this snapshot's own values
/// for the path, so the rewritten blob satisfies the rollup invariants again.
fn repair_one(
    catalog: &Catalog,
    blobs: &BlobStore,
    record: &ScanRecord,
    uri: &Uri,
) -> DuvizResult<()> {
    let reader = blobs.open_blob(&record.blob_id)?;
    let snapshot = reader.to_snapshot()?;

    let Some(target) = snapshot.find(uri.as_str()) else {
        // the snapshot predates the path; nothing to rewrite
        return Ok(());
    };
    let removed_size = target.size;
    let removed_rows = target.n_desc + 1;

    let mut nodes: Vec<Node> = snapshot
        .nodes()
        .iter()
        .filter(|n| !uri_has_prefix(&n.uri, uri))
        .cloned()
        .collect();

    let by_uri: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.uri.clone(), i))
        .collect();
    for (step, ancestor) in uri.self_and_ancestors().into_iter().skip(1).enumerate() {
        if !snapshot.root_uri.is_ancestor_of(&ancestor) {
            break;
        }
        let Some(&idx) = by_uri.get(ancestor.as_str()) else {
            break;
        };
        let node = &mut nodes[idx];
        node.size = node.size.saturating_sub(removed_size);
        node.n_desc = node.n_desc.saturating_sub(removed_rows);
        if step == 0 {
            node.n_children = node.n_children.saturating_sub(1);
        }
        if ancestor == snapshot.root_uri {
            break;
        }
    }

    let rewritten = Snapshot::from_sorted_nodes(
        snapshot.root_uri.clone(),
        snapshot.completed_at,
        snapshot.error_count,
        snapshot.error_paths.clone(),
        nodes,
    );

    // write-new, swap, then drop the unreferenced old blob
    let new_blob = blobs.put(&rewritten)?;
    let root = rewritten.root();
    catalog.update_after_repair(record.id, new_blob, root.size, root.n_children, root.n_desc)?;
    if record.blob_id != new_blob && catalog.blob_refs(&record.blob_id)? == 0 {
        blobs.delete(&record.blob_id)?;
    }
    debug!("repaired scan {} into blob {new_blob}", record.id);
    Ok(())
}
