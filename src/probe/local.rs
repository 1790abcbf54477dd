//! The local-native probe: direct directory iteration with allocated-block
//! accounting.

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
use std::{
    collections::HashSet,
    fs::Metadata,
    io,
    path::{Path, PathBuf},
};

use ignore::{overrides::OverrideBuilder, DirEntry, Walk, WalkBuilder};

use crate::{
    error::{DuvizError, DuvizResult, ErrorKind},
    probe::{EntryError, EntryResult, Probe, ProbeOptions, RawEntry},
    snapshot::NodeKind,
    uri::Uri,
};

/// A [`Probe`] over a local filesystem tree.
#[derive(Debug)]
pub struct LocalProbe {
    root: Uri,
    root_path: PathBuf,
    builder: WalkBuilder,
    dedupe_by_inode: bool,
}

impl LocalProbe {
    /// Create a probe for the local tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::UnsupportedScheme`] if `root` is not a local URI.
    /// * [`ErrorKind::NotFound`] / [`ErrorKind::SourcePermission`] if the root
    ///   itself does not exist or cannot be read.
    pub fn new(root: &Uri, opts: &ProbeOptions) -> DuvizResult<Self> {
        let root_path = root.to_local_path().ok_or_else(|| {
            DuvizError::new(
                ErrorKind::UnsupportedScheme,
                "The local probe only enumerates local URIs.",
            )
            .attach_context("uri", root.to_string())
        })?;

        // an unreadable root is fatal, unlike errors below it
        let meta = std::fs::symlink_metadata(&root_path).map_err(|err| {
            DuvizError::with_source(
                classify_io(&err),
                "Failed to read the scan root.",
                err,
            )
            .attach_context("path", root_path.display().to_string())
        })?;
        if meta.is_dir() {
            _ = std::fs::read_dir(&root_path).map_err(|err| {
                DuvizError::with_source(
                    classify_io(&err),
                    "Failed to open the scan root for listing.",
                    err,
                )
                .attach_context("path", root_path.display().to_string())
            })?;
        }

        let mut override_builder = OverrideBuilder::new(&root_path);
        for glob in &opts.exclude_globs {
            // overrides whitelist by default; `!` turns the pattern into an exclusion
            _ = override_builder.add(&format!("!{glob}")).map_err(|err| {
                DuvizError::with_source(
                    ErrorKind::Internal,
                    "Failed to add exclude glob to the override builder.",
                    err,
                )
                .attach_context("glob", glob.to_string())
            })?;
        }
        let overrides = override_builder.build().map_err(|err| {
            DuvizError::with_source(
                ErrorKind::Internal,
                "Failed to build the exclude glob matcher.",
                err,
            )
        })?;

        let mut builder = WalkBuilder::new(&root_path);
        _ = builder
            .follow_links(opts.follow_symlinks)
            .hidden(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .same_file_system(opts.one_file_system)
            .sort_by_file_path(Path::cmp)
            .overrides(overrides);

        Ok(Self {
            root: root.clone(),
            root_path,
            builder,
            dedupe_by_inode: opts.dedupe_by_inode,
        })
    }
}

impl Probe for LocalProbe {
    type Iter = LocalProbeIter;

    fn root(&self) -> &Uri {
        &self.root
    }

    fn entries(self) -> DuvizResult<Self::Iter> {
        Ok(LocalProbeIter {
            walker: self.builder.build(),
            root: self.root,
            root_path: self.root_path,
            dedupe_by_inode: self.dedupe_by_inode,
            seen: HashSet::new(),
        })
    }
}

// Walk doesn't implement Debug
#[allow(missing_debug_implementations)]
pub struct LocalProbeIter {
    walker: Walk,
    root: Uri,
    root_path: PathBuf,
    dedupe_by_inode: bool,
    /// `(device, inode)` pairs already reported
    seen: HashSet<(u64, u64)>,
}

impl LocalProbeIter {
    fn map_entry(&mut self, entry: &DirEntry) -> DuvizResult<Option<RawEntry>> {
        let meta = entry.metadata().map_err(|err| {
            let kind = err
                .io_error()
                .map_or(ErrorKind::SourceTransient, classify_io);
            DuvizError::with_source(kind, "Failed to read metadata for entry.", err)
                .attach_context("path", entry.path().display().to_string())
        })?;

        #[cfg(unix)]
        if self.dedupe_by_inode && !self.seen.insert((meta.dev(), meta.ino())) {
            return Ok(None);
        }

        let uri = uri_for_path(&self.root, &self.root_path, entry.path())?;
        let kind = if meta.is_dir() {
            NodeKind::Dir
        } else {
            NodeKind::File
        };
        let size = if meta.is_dir() { 0 } else { allocated_size(&meta) };

        Ok(Some(RawEntry {
            uri,
            kind,
            size,
            mtime: mtime_epoch(&meta),
        }))
    }
}

impl Iterator for LocalProbeIter {
    type Item = EntryResult;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.walker.next()? {
                Ok(entry) => {
                    let path = entry.path().display().to_string();
                    match self.map_entry(&entry) {
                        Ok(Some(raw)) => return Some(Ok(raw)),
                        // deduplicated hard link, keep walking
                        Ok(None) => {}
                        Err(error) => return Some(Err(EntryError { path, error })),
                    }
                }
                Err(err) => {
                    let kind = err
                        .io_error()
                        .map_or(ErrorKind::SourceTransient, classify_io);
                    let path = err.to_string();
                    let error =
                        DuvizError::with_source(kind, "Failed to read directory entry.", err);
                    return Some(Err(EntryError { path, error }));
                }
            }
        }
    }
}

/// Allocated size of a file: block count times 512, which keeps sparse files
/// accounted by what they actually occupy.
#[cfg(unix)]
fn allocated_size(meta: &Metadata) -> u64 {
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_size(meta: &Metadata) -> u64 {
    meta.len()
}

#[cfg(unix)]
fn mtime_epoch(meta: &Metadata) -> i64 {
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_epoch(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

fn classify_io(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::SourcePermission,
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::SourceTransient,
    }
}

/// Map an absolute path below the walk root onto a URI below the probe root.
fn uri_for_path(root: &Uri, root_path: &Path, path: &Path) -> DuvizResult<Uri> {
    let rel = path.strip_prefix(root_path).map_err(|err| {
        DuvizError::with_source(
            ErrorKind::Internal,
            "Walked entry lies outside the scan root.",
            err,
        )
        .attach_context("path", path.display().to_string())
    })?;
    let mut uri = root.clone();
    for component in rel.components() {
        uri = uri.join(&component.as_os_str().to_string_lossy())?;
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn collect(probe: LocalProbe) -> (Vec<RawEntry>, Vec<EntryError>) {
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for item in probe.entries().unwrap() {
            match item {
                Ok(e) => entries.push(e),
                Err(e) => errors.push(e),
            }
        }
        (entries, errors)
    }

    #[test]
    fn test_walk_reports_all_entries() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/a.txt"), b"hello").unwrap();
        std::fs::write(tmp.path().join("b.txt"), b"world").unwrap();

        let root = Uri::parse(&tmp.path().display().to_string()).unwrap();
        let probe = LocalProbe::new(&root, &ProbeOptions::default()).unwrap();
        let (entries, errors) = collect(probe);

        assert!(errors.is_empty());
        let uris: Vec<&str> = entries.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris.len(), 4);
        assert!(uris.contains(&root.as_str()));
        assert!(uris.contains(&root.join("sub").unwrap().as_str()));
        assert!(uris
            .contains(&root.join("sub").unwrap().join("a.txt").unwrap().as_str()));
    }

    #[test]
    fn test_exclude_globs_elide_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("keep")).unwrap();
        std::fs::create_dir(tmp.path().join("skip")).unwrap();
        std::fs::write(tmp.path().join("skip/x"), b"x").unwrap();

        let root = Uri::parse(&tmp.path().display().to_string()).unwrap();
        let opts = ProbeOptions::default().exclude_globs(vec!["skip".to_string()]);
        let probe = LocalProbe::new(&root, &opts).unwrap();
        let (entries, _) = collect(probe);

        assert!(entries.iter().all(|e| !e.uri.as_str().contains("skip")));
        assert!(entries
            .iter()
            .any(|e| e.uri.as_str().ends_with("/keep")));
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let root = Uri::parse("/definitely/not/here/duviz").unwrap();
        let err = LocalProbe::new(&root, &ProbeOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_size_is_allocated_not_logical() {
        use std::io::{Seek, SeekFrom, Write};

        let tmp = tempfile::tempdir().unwrap();
        let sparse = tmp.path().join("sparse.bin");
        {
            let mut f = std::fs::File::create(&sparse).unwrap();
            // a large hole with a single byte at the end
            _ = f.seek(SeekFrom::Start(1 << 30)).unwrap();
            f.write_all(b"x").unwrap();
            f.sync_all().unwrap();
        }

        let root = Uri::parse(&tmp.path().display().to_string()).unwrap();
        let probe = LocalProbe::new(&root, &ProbeOptions::default()).unwrap();
        let (entries, _) = collect(probe);
        let entry = entries
            .iter()
            .find(|e| e.uri.as_str().ends_with("sparse.bin"))
            .unwrap();

        let meta = std::fs::metadata(&sparse).unwrap();
        assert_eq!(entry.size, meta.blocks() * 512);
        assert!(entry.size < meta.len());
    }
}
