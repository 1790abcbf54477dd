//! Owns the blob bytes on disk, addressed by content.

use std::{fs, io::Write, path::PathBuf};

use bytes::Bytes;
use log::{debug, trace};
use walkdir::WalkDir;

use crate::{
    blob::{
        format::{self, BlobFile, ScanIter},
        NodeFilter,
    },
    error::{DuvizError, DuvizResult, ErrorKind},
    id::{BlobId, Id},
    snapshot::Snapshot,
    uri::Uri,
};

/// Stores snapshot blobs as content-addressed files below one directory.
///
/// Writes are atomic: the encoded bytes land in a temporary file which is
/// renamed into place, so a reader either sees the whole blob or none of it.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (and create if needed) the store below `dir`.
    ///
    /// # Errors
    ///
    /// * If the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> DuvizResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            DuvizError::with_source(
                ErrorKind::Internal,
                "Failed to create the blob directory.",
                err,
            )
            .attach_context("dir", dir.display().to_string())
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &BlobId) -> PathBuf {
        let hex = id.to_hex();
        self.dir.join(&hex[0..2]).join(hex.as_str())
    }

    /// Persist a snapshot and return its content address.
    ///
    /// # Errors
    ///
    /// * If encoding fails or the bytes cannot be written.
    pub fn put(&self, snapshot: &Snapshot) -> DuvizResult<BlobId> {
        let bytes = format::encode(snapshot)?;
        let id = BlobId::from(Id::from_content(&bytes));
        let path = self.path_for(&id);

        if path.exists() {
            trace!("blob {id} already present");
            return Ok(id);
        }

        let io_failed = |err: std::io::Error| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to write snapshot blob.", err)
                .attach_context("blob", id.to_string())
        };

        let parent = path.parent().ok_or_else(|| {
            DuvizError::new(ErrorKind::Internal, "Blob path has no parent directory.")
        })?;
        fs::create_dir_all(parent).map_err(io_failed)?;

        let tmp = self
            .dir
            .join(format!("tmp-{}-{}", std::process::id(), id.to_hex().as_str()));
        {
            let mut file = fs::File::create(&tmp).map_err(io_failed)?;
            file.write_all(&bytes).map_err(io_failed)?;
            file.sync_all().map_err(io_failed)?;
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            _ = fs::remove_file(&tmp);
            return Err(io_failed(err));
        }

        debug!("wrote blob {id} ({} bytes) for {}", bytes.len(), snapshot.root_uri);
        Ok(id)
    }

    /// Open a blob for reading.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::BlobCorrupt`] if the blob is missing, truncated or garbled.
    pub fn open_blob(&self, id: &BlobId) -> DuvizResult<SnapshotReader> {
        let path = self.path_for(id);
        let bytes = fs::read(&path).map_err(|err| {
            DuvizError::with_source(
                ErrorKind::BlobCorrupt,
                "Failed to read snapshot blob from disk.",
                err,
            )
            .attach_context("blob", id.to_string())
        })?;
        Ok(SnapshotReader {
            file: BlobFile::parse(Bytes::from(bytes))?,
        })
    }

    /// Remove a blob. Removing an absent blob is not an error.
    ///
    /// # Errors
    ///
    /// * If the file exists but cannot be removed.
    pub fn delete(&self, id: &BlobId) -> DuvizResult<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DuvizError::with_source(
                ErrorKind::Internal,
                "Failed to remove snapshot blob.",
                err,
            )
            .attach_context("blob", id.to_string())),
        }
    }

    /// Whether the blob exists on disk.
    #[must_use]
    pub fn contains(&self, id: &BlobId) -> bool {
        self.path_for(id).exists()
    }

    /// Enumerate all stored blobs, e.g. for the orphan sweep.
    ///
    /// # Errors
    ///
    /// * If the store directory cannot be walked.
    pub fn list(&self) -> DuvizResult<Vec<BlobId>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|err| {
                DuvizError::with_source(
                    ErrorKind::Internal,
                    "Failed to walk the blob directory.",
                    err,
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<BlobId>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

/// Read access to one stored snapshot.
#[derive(Debug)]
pub struct SnapshotReader {
    file: BlobFile,
}

impl SnapshotReader {
    /// The scanned root this blob describes.
    #[must_use]
    pub fn root_uri(&self) -> &Uri {
        self.file.root_uri()
    }

    /// When the scan finished.
    #[must_use]
    pub fn completed_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.file.completed_at()
    }

    /// Lazily yield the rows matching `filter`.
    #[must_use]
    pub fn scan(&self, filter: &NodeFilter) -> ScanIter<'_> {
        self.file.scan(filter)
    }

    /// Reassemble the whole snapshot.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::BlobCorrupt`] if any column fails to decode.
    pub fn to_snapshot(&self) -> DuvizResult<Snapshot> {
        self.file.to_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::aggregate::testing::snapshot_of;

    use super::*;

    #[test]
    fn test_put_open_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let snapshot = snapshot_of("/r", &[("a/x", 10, 5), ("b", 20, 9)]);

        let id = store.put(&snapshot).unwrap();
        assert!(store.contains(&id));

        let reader = store.open_blob(&id).unwrap();
        assert_eq!(reader.to_snapshot().unwrap(), snapshot);
        assert_eq!(reader.root_uri().as_str(), "/r");
    }

    #[test]
    fn test_content_addressing_dedupes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let snapshot = snapshot_of("/r", &[("a", 1, 1)]);

        let id1 = store.put(&snapshot).unwrap();
        let id2 = store.put(&snapshot).unwrap();

        assert_eq!(id1, id2);
        assert_eq!(store.list().unwrap(), vec![id1]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let id = store.put(&snapshot_of("/r", &[("a", 1, 1)])).unwrap();

        store.delete(&id).unwrap();
        assert!(!store.contains(&id));
        store.delete(&id).unwrap();
    }

    #[test]
    fn test_open_missing_blob_is_corrupt_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let id: BlobId = Id::from_content(b"never stored").into();

        let err = store.open_blob(&id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BlobCorrupt);
    }

    #[test]
    fn test_list_finds_all_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path()).unwrap();
        let a = store.put(&snapshot_of("/r", &[("a", 1, 1)])).unwrap();
        let b = store.put(&snapshot_of("/r", &[("b", 2, 2)])).unwrap();

        let mut listed = store.list().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }
}
