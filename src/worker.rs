//! The scan worker: one probe->aggregate->blob->catalog pipeline.
//!
//! The scheduler launches this as a subprocess (see the `duviz-scan-worker`
//! binary); the same pipeline also runs in-process via
//! [`Service::run_scan_blocking`](crate::service::Service::run_scan_blocking).
//! The worker talks back through its `scan_progress` row: it inserts the row
//! on startup, bumps the counters at a bounded frequency and settles the row
//! when it terminates. The blob is written before the catalog row; a blob
//! orphaned by a late failure is garbage-collectible.

use std::path::Path;

use bytesize::ByteSize;
use chrono::Utc;
use log::{error, info, warn};

use crate::{
    aggregate::{aggregate, ScanObserver},
    blob::store::BlobStore,
    catalog::{Catalog, ScanProgress, ScanRecord, ScanStatus},
    error::{DuvizResult, ErrorKind},
    probe::{command::CommandProbe, local::LocalProbe},
    service::ServiceOptions,
    uri::{Scheme, Uri},
};

/// Exit codes of the worker process, also used by the embedded CLI front-end.
pub mod exit_code {
    /// Scan completed and committed
    pub const SUCCESS: i32 = 0;
    /// Unexpected failure
    pub const INTERNAL: i32 = 1;
    /// Malformed arguments or a nonexistent root
    pub const INVALID_INPUT: i32 = 2;
    /// The URI scheme cannot be scanned by this build
    pub const UNSUPPORTED_SCHEME: i32 = 3;
    /// The scan root was not readable
    pub const ACCESS_DENIED: i32 = 4;
    /// The scan was aborted
    pub const ABORTED: i32 = 5;
}

/// Map an error kind onto the worker exit code.
#[must_use]
pub fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidUri | ErrorKind::NotFound => exit_code::INVALID_INPUT,
        ErrorKind::UnsupportedScheme => exit_code::UNSUPPORTED_SCHEME,
        ErrorKind::SourcePermission => exit_code::ACCESS_DENIED,
        ErrorKind::Aborted => exit_code::ABORTED,
        _ => exit_code::INTERNAL,
    }
}

/// Run one scan and commit it: blob first, catalog row last.
///
/// # Errors
///
/// * Probe construction errors (unreadable root, unsupported scheme).
/// * Blob or catalog write failures; a blob without a row is GC-eligible.
pub(crate) fn scan_once(
    catalog: &Catalog,
    blobs: &BlobStore,
    opts: &ServiceOptions,
    uri: &Uri,
    observer: &mut dyn ScanObserver,
) -> DuvizResult<ScanRecord> {
    let sample = opts.error_sample_size();

    let snapshot = match uri.scheme() {
        Scheme::Local if opts.probe.enumerator_command.is_some() => {
            aggregate(CommandProbe::new(uri, &opts.probe)?, sample, observer)?
        }
        Scheme::Local => aggregate(LocalProbe::new(uri, &opts.probe)?, sample, observer)?,
        #[cfg(feature = "s3")]
        Scheme::S3 => aggregate(
            crate::probe::object::ObjectProbe::new(uri, &opts.object_store)?,
            sample,
            observer,
        )?,
        #[cfg(not(feature = "s3"))]
        Scheme::S3 => {
            return Err(crate::error::DuvizError::new(
                ErrorKind::UnsupportedScheme,
                "This build cannot scan object stores.",
            )
            .attach_context("uri", uri.to_string()));
        }
    };

    let blob_id = blobs.put(&snapshot)?;
    let mut record = ScanRecord::for_snapshot(&snapshot, blob_id);
    record.id = catalog.insert_scan(&record)?;
    info!(
        "scan of {uri} committed: {} in {} entries",
        ByteSize(record.root_size),
        record.root_n_desc
    );
    Ok(record)
}

/// Forwards aggregator progress into the worker's `scan_progress` row.
struct ProgressRow<'a> {
    catalog: &'a Catalog,
    id: i64,
}

impl ScanObserver for ProgressRow<'_> {
    fn on_progress(&mut self, items_found: u64, items_per_sec: Option<f64>, error_count: u64) {
        if let Err(err) =
            self.catalog
                .update_progress_counters(self.id, items_found, items_per_sec, error_count)
        {
            warn!("failed to update the progress row: {err}");
        }
    }
}

/// Entry point of the worker subprocess.
///
/// Loads the persisted service options from `root_dir`, runs the scan for
/// `uri` and settles its `scan_progress` row under `job_id`. Returns the
/// process exit code.
#[must_use]
pub fn run(root_dir: &Path, job_id: i64, uri_str: &str) -> i32 {
    let uri = match Uri::parse(uri_str) {
        Ok(uri) => uri,
        Err(err) => {
            error!("{err}");
            return exit_code_for(err.kind());
        }
    };

    let opts = ServiceOptions::load_or_default(root_dir);
    let catalog = match Catalog::open(opts.catalog_path()) {
        Ok(catalog) => catalog,
        Err(err) => {
            error!("{err}");
            return exit_code::INTERNAL;
        }
    };
    let blobs = match BlobStore::open(opts.blob_path()) {
        Ok(blobs) => blobs,
        Err(err) => {
            error!("{err}");
            return exit_code::INTERNAL;
        }
    };

    let progress = ScanProgress {
        id: job_id,
        root_uri: uri.clone(),
        worker_pid: std::process::id(),
        started_at: Utc::now(),
        items_found: 0,
        items_per_sec: None,
        error_count: 0,
        status: ScanStatus::Running,
    };
    if let Err(err) = catalog.upsert_progress(&progress) {
        error!("{err}");
        return exit_code::INTERNAL;
    }

    let mut observer = ProgressRow {
        catalog: &catalog,
        id: job_id,
    };
    match scan_once(&catalog, &blobs, &opts, &uri, &mut observer) {
        Ok(_) => {
            // the row disappears with the scan; observers learn the outcome
            // from the catalog's new scan row
            if let Err(err) = catalog.remove_progress(job_id) {
                warn!("failed to drop the progress row: {err}");
            }
            exit_code::SUCCESS
        }
        Err(err) => {
            error!("scan of {uri} failed: {err}");
            if let Err(err) = catalog.mark_progress(job_id, ScanStatus::Failed) {
                warn!("failed to settle the progress row: {err}");
            }
            exit_code_for(err.kind())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::aggregate::NoObserver;

    use super::*;

    fn options_for(tmp: &tempfile::TempDir) -> ServiceOptions {
        ServiceOptions::default().root_dir(tmp.path().join("state"))
    }

    #[test]
    fn test_scan_once_commits_row_and_blob() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("tree")).unwrap();
        std::fs::write(tmp.path().join("tree/f"), vec![0u8; 4096]).unwrap();

        let opts = options_for(&tmp);
        std::fs::create_dir_all(&opts.root_dir).unwrap();
        let catalog = Catalog::open(opts.catalog_path()).unwrap();
        let blobs = BlobStore::open(opts.blob_path()).unwrap();
        let uri = Uri::parse(&tmp.path().join("tree").display().to_string()).unwrap();

        let record = scan_once(&catalog, &blobs, &opts, &uri, &mut NoObserver).unwrap();

        assert!(record.id > 0);
        assert_eq!(record.root_uri, uri);
        assert!(blobs.contains(&record.blob_id));

        let snapshot = blobs
            .open_blob(&record.blob_id)
            .unwrap()
            .to_snapshot()
            .unwrap();
        snapshot.check_consistency().unwrap();
        assert_eq!(snapshot.root().size, record.root_size);
    }

    #[test]
    fn test_run_settles_progress_row() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("tree")).unwrap();
        let opts = options_for(&tmp);
        std::fs::create_dir_all(&opts.root_dir).unwrap();

        let uri = tmp.path().join("tree").display().to_string();
        let code = run(&opts.root_dir, 7, &uri);
        assert_eq!(code, exit_code::SUCCESS);

        let catalog = Catalog::open(opts.catalog_path()).unwrap();
        assert!(catalog.progress_by_id(7).unwrap().is_none());
        assert_eq!(catalog.latest_per_root().unwrap().len(), 1);
    }

    #[test]
    fn test_run_with_bad_input() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = options_for(&tmp);
        std::fs::create_dir_all(&opts.root_dir).unwrap();

        assert_eq!(
            run(&opts.root_dir, 1, "not-a-uri"),
            exit_code::INVALID_INPUT
        );
        assert_eq!(
            run(&opts.root_dir, 2, "gs://bucket/x"),
            exit_code::UNSUPPORTED_SCHEME
        );

        let missing = tmp.path().join("missing").display().to_string();
        assert_eq!(run(&opts.root_dir, 3, &missing), exit_code::INVALID_INPUT);

        // the failed scan leaves a terminal progress row for observers
        let catalog = Catalog::open(opts.catalog_path()).unwrap();
        assert_eq!(
            catalog.progress_by_id(3).unwrap().unwrap().status,
            ScanStatus::Failed
        );
    }
}
