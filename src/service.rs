//! The owning handle: configuration, storage, scheduling and the query API.
//!
//! A [`Service`] owns the catalog, the blob store and the scheduler; all
//! state lives below one `root_dir`. The resolved options are persisted to
//! `service.json` inside that directory so worker subprocesses scan with the
//! same configuration.

pub(crate) mod command_input;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use derive_setters::Setters;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    blob::store::BlobStore,
    catalog::{Catalog, ScanProgress, ScanRecord},
    error::{DuvizError, DuvizResult, ErrorKind},
    mutator::{self, DeleteResult},
    planner::{self, Comparison, View},
    probe::{ObjectStoreOptions, ProbeOptions},
    progress::ProgressSubscriber,
    scheduler::{Job, JobId, Scheduler, SchedulerConfig},
    uri::Uri,
};

pub use command_input::CommandInput;

mod constants {
    use std::time::Duration;

    /// File below `root_dir` carrying the resolved options for workers
    pub(super) const OPTIONS_FILE: &str = "service.json";
    /// Default progress publication interval
    pub(super) const DEFAULT_TICK: Duration = Duration::from_secs(2);
    /// Default cap on sampled error paths per scan
    pub(super) const DEFAULT_ERROR_SAMPLE: usize = 100;
}

/// Retention policy for completed scans.
///
/// The newest scan per root always survives; beyond that, the last
/// `keep-last` scans per root and everything younger than `keep-within`.
#[serde_as]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "merge", derive(conflate::Merge))]
#[derive(Deserialize, Serialize, Clone, Default, Debug, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct RetentionOptions {
    /// Keep this many scans per root (default: 1)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub keep_last: Option<u32>,

    /// Keep scans younger than this (e.g. "30d", default: 30 days)
    #[cfg_attr(feature = "clap", clap(long, value_name = "DURATION"))]
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub keep_within: Option<humantime::Duration>,
}

impl RetentionOptions {
    fn keep_last_n(&self) -> usize {
        self.keep_last.unwrap_or(1).max(1) as usize
    }

    fn keep_within_duration(&self) -> Duration {
        self.keep_within
            .map_or(Duration::from_secs(30 * 24 * 3600), Into::into)
    }
}

/// Options for a [`Service`].
///
/// This struct derives [`serde::Deserialize`], allowing to use it in config
/// files; with the `cli` feature it is also a [`clap::Parser`].
#[serde_as]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[cfg_attr(feature = "merge", derive(conflate::Merge))]
#[derive(Deserialize, Serialize, Clone, Debug, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
#[non_exhaustive]
pub struct ServiceOptions {
    /// Directory holding the catalog, the blobs and the persisted options
    #[cfg_attr(feature = "clap", clap(long, value_name = "DIR", default_value = "duviz"))]
    #[cfg_attr(feature = "merge", merge(skip))]
    pub root_dir: PathBuf,

    /// Blob directory (default: `<root-dir>/blobs`)
    #[cfg_attr(feature = "clap", clap(long, value_name = "DIR"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub blob_dir: Option<PathBuf>,

    /// Catalog database file (default: `<root-dir>/catalog.db`)
    #[cfg_attr(feature = "clap", clap(long, value_name = "FILE"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub db_path: Option<PathBuf>,

    /// Cap on concurrently running scans (default: the CPU count)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub max_concurrent_scans: Option<usize>,

    /// How many error paths a scan samples (default: 100)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub sample_error_paths: Option<usize>,

    /// Progress publication interval (e.g. "2s")
    #[cfg_attr(feature = "clap", clap(long, value_name = "DURATION"))]
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub progress_tick: Option<humantime::Duration>,

    /// Run local scan workers under sudo
    #[cfg_attr(feature = "clap", clap(long))]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::bool::overwrite_false))]
    pub sudo_local_probe: bool,

    /// Scan worker command (default: the bundled `duviz-scan-worker` binary)
    #[cfg_attr(feature = "clap", clap(long, value_name = "COMMAND"))]
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[cfg_attr(feature = "merge", merge(strategy = conflate::option::overwrite_none))]
    pub worker_command: Option<CommandInput>,

    /// Probe behavior
    #[cfg_attr(feature = "clap", clap(flatten))]
    pub probe: ProbeOptions,

    /// Object-store access
    #[cfg_attr(feature = "clap", clap(flatten))]
    pub object_store: ObjectStoreOptions,

    /// Scan retention for the garbage collector
    #[cfg_attr(feature = "clap", clap(flatten))]
    pub retention: RetentionOptions,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("duviz"),
            blob_dir: None,
            db_path: None,
            max_concurrent_scans: None,
            sample_error_paths: None,
            progress_tick: None,
            sudo_local_probe: false,
            worker_command: None,
            probe: ProbeOptions::default(),
            object_store: ObjectStoreOptions::default(),
            retention: RetentionOptions::default(),
        }
    }
}

impl ServiceOptions {
    /// The resolved catalog database file.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.root_dir.join("catalog.db"))
    }

    /// The resolved blob directory.
    #[must_use]
    pub fn blob_path(&self) -> PathBuf {
        self.blob_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("blobs"))
    }

    /// The resolved scan concurrency cap.
    #[must_use]
    pub fn concurrency_cap(&self) -> usize {
        self.max_concurrent_scans
            .or_else(|| std::thread::available_parallelism().ok().map(Into::into))
            .unwrap_or(1)
            .max(1)
    }

    /// The resolved error sampling cap.
    #[must_use]
    pub fn error_sample_size(&self) -> usize {
        self.sample_error_paths
            .unwrap_or(constants::DEFAULT_ERROR_SAMPLE)
    }

    /// The resolved progress tick.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.progress_tick
            .map_or(constants::DEFAULT_TICK, Into::into)
    }

    /// Load the options a service persisted below `root_dir`, falling back to
    /// defaults rooted there. This is how worker subprocesses pick up their
    /// configuration.
    #[must_use]
    pub fn load_or_default(root_dir: &Path) -> Self {
        let path = root_dir.join(constants::OPTIONS_FILE);
        let mut opts = fs::read_to_string(&path)
            .ok()
            .and_then(|json| match serde_json::from_str::<Self>(&json) {
                Ok(opts) => Some(opts),
                Err(err) => {
                    warn!("ignoring unreadable options at {}: {err}", path.display());
                    None
                }
            })
            .unwrap_or_default();
        opts.root_dir = root_dir.to_path_buf();
        opts
    }

    fn persist(&self) -> DuvizResult<()> {
        let path = self.root_dir.join(constants::OPTIONS_FILE);
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to encode service options.", err)
        })?;
        fs::write(&path, json).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to persist service options.", err)
                .attach_context("path", path.display().to_string())
        })
    }
}

/// A configured bucket and what the catalog knows about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    /// Bucket name
    pub bucket: String,
    /// The bucket's root URI
    pub uri: Uri,
    /// The newest scan of the bucket root, if any
    pub last_scan: Option<ScanRecord>,
}

/// What one garbage collection pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Catalog rows dropped
    pub scans_removed: usize,
    /// Blob files deleted
    pub blobs_removed: usize,
}

/// The disk-usage index service.
#[derive(Debug)]
pub struct Service {
    opts: ServiceOptions,
    catalog: Arc<Catalog>,
    blobs: BlobStore,
    scheduler: Scheduler,
}

impl Service {
    /// Bring up a service below `opts.root_dir`.
    ///
    /// Creates the directory layout, opens catalog and blob store, persists
    /// the resolved options for workers and starts the scheduler.
    ///
    /// # Errors
    ///
    /// * If the directories cannot be created or the catalog cannot open.
    pub fn new(opts: ServiceOptions) -> DuvizResult<Self> {
        fs::create_dir_all(&opts.root_dir).map_err(|err| {
            DuvizError::with_source(
                ErrorKind::Internal,
                "Failed to create the service root directory.",
                err,
            )
            .attach_context("dir", opts.root_dir.display().to_string())
        })?;
        opts.persist()?;

        let catalog = Arc::new(Catalog::open(opts.catalog_path())?);
        let blobs = BlobStore::open(opts.blob_path())?;
        let scheduler = Scheduler::new(
            Arc::clone(&catalog),
            SchedulerConfig {
                root_dir: opts.root_dir.clone(),
                max_concurrent: opts.concurrency_cap(),
                progress_tick: opts.tick_interval(),
                worker_command: opts.worker_command.clone().unwrap_or_default(),
                sudo_local_probe: opts.sudo_local_probe,
            },
        );

        info!("service up at {}", opts.root_dir.display());
        Ok(Self {
            opts,
            catalog,
            blobs,
            scheduler,
        })
    }

    /// The options this service runs with.
    #[must_use]
    pub fn options(&self) -> &ServiceOptions {
        &self.opts
    }

    /// The newest scan per scanned root.
    pub fn list_scans(&self) -> DuvizResult<Vec<ScanRecord>> {
        self.catalog.latest_per_root()
    }

    /// All scans covering `uri`, newest first.
    pub fn history(&self, uri: &Uri) -> DuvizResult<Vec<ScanRecord>> {
        self.catalog.history_for(uri)
    }

    /// What the index knows about `uri`, down to `depth` levels.
    pub fn view(&self, uri: &Uri, depth: u32) -> DuvizResult<View> {
        planner::view(&self.catalog, &self.blobs, uri, depth, None)
    }

    /// Like [`view`](Self::view), aborting at `deadline`.
    pub fn view_with_deadline(
        &self,
        uri: &Uri,
        depth: u32,
        deadline: Instant,
    ) -> DuvizResult<View> {
        planner::view(&self.catalog, &self.blobs, uri, depth, Some(deadline))
    }

    /// Compare the children of `uri` between two scans.
    pub fn compare(&self, uri: &Uri, scan_a: i64, scan_b: i64) -> DuvizResult<Comparison> {
        planner::compare(&self.catalog, &self.blobs, uri, scan_a, scan_b, None)
    }

    /// Like [`compare`](Self::compare), aborting at `deadline`.
    pub fn compare_with_deadline(
        &self,
        uri: &Uri,
        scan_a: i64,
        scan_b: i64,
        deadline: Instant,
    ) -> DuvizResult<Comparison> {
        planner::compare(&self.catalog, &self.blobs, uri, scan_a, scan_b, Some(deadline))
    }

    /// Start scanning `uri` in a worker subprocess.
    pub fn start_scan(&self, uri: &Uri) -> DuvizResult<JobId> {
        self.scheduler.start(uri)
    }

    /// Current state of a scan job.
    #[must_use]
    pub fn scan_status(&self, id: JobId) -> Option<Job> {
        self.scheduler.status(id)
    }

    /// Cancel a scan job.
    pub fn cancel_scan(&self, id: JobId) -> DuvizResult<()> {
        self.scheduler.cancel(id)
    }

    /// The progress rows of all running scans.
    pub fn running_scans(&self) -> DuvizResult<Vec<ScanProgress>> {
        self.catalog.running_progress()
    }

    /// Attach to the live progress stream.
    #[must_use]
    pub fn progress_stream(&self) -> ProgressSubscriber {
        self.scheduler.subscribe()
    }

    /// Run one scan synchronously in this process.
    ///
    /// The scheduler path is preferred for interactive use; this is for
    /// embedding and tests.
    pub fn run_scan_blocking(&self, uri: &Uri) -> DuvizResult<ScanRecord> {
        crate::worker::scan_once(
            &self.catalog,
            &self.blobs,
            &self.opts,
            uri,
            &mut crate::aggregate::NoObserver,
        )
    }

    /// Delete `uri` from its source and repair affected snapshots.
    ///
    /// Deletion does not race scans: while a scan whose tree overlaps `uri`
    /// is active, the call fails with [`ErrorKind::CatalogConflict`] and the
    /// caller retries once the scan has settled.
    pub fn delete(&self, uri: &Uri) -> DuvizResult<DeleteResult> {
        if let Some(job) = self
            .scheduler
            .active()
            .into_iter()
            .find(|job| job.root_uri.is_ancestor_of(uri) || uri.is_ancestor_of(&job.root_uri))
        {
            return Err(DuvizError::new(
                ErrorKind::CatalogConflict,
                "A scan overlapping this path is active; retry when it settles.",
            )
            .attach_context("job", job.id.to_string())
            .attach_context("scan-root", job.root_uri.to_string()));
        }
        mutator::delete(&self.catalog, &self.blobs, uri)
    }

    /// The configured buckets with their newest scans.
    pub fn list_buckets(&self) -> DuvizResult<Vec<BucketInfo>> {
        self.opts
            .object_store
            .buckets
            .iter()
            .map(|bucket| {
                let uri = Uri::parse(&format!("s3://{bucket}"))?;
                let last_scan = self.catalog.ancestor_for(&uri)?;
                Ok(BucketInfo {
                    bucket: bucket.clone(),
                    uri,
                    last_scan,
                })
            })
            .collect()
    }

    /// Evict scans outside the retention policy and sweep unreferenced blobs.
    ///
    /// Row and blob go together: the blob file is only deleted once no
    /// catalog row references it. The orphan sweep is skipped while scans are
    /// running, because a worker legitimately writes its blob before its row.
    pub fn gc(&self) -> DuvizResult<GcStats> {
        let mut stats = GcStats::default();
        let keep_last = self.opts.retention.keep_last_n();
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.opts.retention.keep_within_duration()).map_err(
                |err| {
                    DuvizError::with_source(
                        ErrorKind::Internal,
                        "Retention window out of range.",
                        err,
                    )
                },
            )?;

        let mut per_root: std::collections::HashMap<Uri, u32> = std::collections::HashMap::new();
        // all_scans is newest-first, so the counter ranks scans per root
        for record in self.catalog.all_scans()? {
            let rank = per_root.entry(record.root_uri.clone()).or_insert(0);
            *rank += 1;
            if *rank <= keep_last as u32 || record.completed_at > cutoff {
                continue;
            }
            debug!("gc: dropping scan {} of {}", record.id, record.root_uri);
            self.catalog.delete_scan(record.id)?;
            stats.scans_removed += 1;
            if self.catalog.blob_refs(&record.blob_id)? == 0 {
                self.blobs.delete(&record.blob_id)?;
                stats.blobs_removed += 1;
            }
        }

        if self.catalog.running_progress()?.is_empty() {
            for blob_id in self.blobs.list()? {
                if self.catalog.blob_refs(&blob_id)? == 0 {
                    debug!("gc: sweeping orphaned blob {blob_id}");
                    self.blobs.delete(&blob_id)?;
                    stats.blobs_removed += 1;
                }
            }
        }

        info!(
            "gc: removed {} scans and {} blobs",
            stats.scans_removed, stats.blobs_removed
        );
        Ok(stats)
    }

    /// Stop the scheduler, cancelling running scans.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::aggregate::testing::snapshot_at;

    use super::*;

    fn service(tmp: &tempfile::TempDir) -> Service {
        let opts = ServiceOptions::default()
            .root_dir(tmp.path().join("state"))
            .worker_command("sh -c 'exit 0'".parse::<CommandInput>().unwrap());
        Service::new(opts).unwrap()
    }

    #[test]
    fn test_options_resolution() {
        let opts = ServiceOptions::default().root_dir("/srv/duviz");

        assert_eq!(opts.catalog_path(), PathBuf::from("/srv/duviz/catalog.db"));
        assert_eq!(opts.blob_path(), PathBuf::from("/srv/duviz/blobs"));
        assert!(opts.concurrency_cap() >= 1);
        assert_eq!(opts.error_sample_size(), 100);
        assert_eq!(opts.tick_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_options_round_trip_through_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let mut service = service(&tmp);

        let loaded = ServiceOptions::load_or_default(&service.options().root_dir);
        assert_eq!(loaded.root_dir, service.options().root_dir);
        assert_eq!(
            loaded.worker_command.as_ref().unwrap().command(),
            "sh"
        );
        service.shutdown();
    }

    #[test]
    fn test_end_to_end_scan_and_view() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("tree/sub")).unwrap();
        std::fs::write(tmp.path().join("tree/sub/f"), vec![0u8; 4096]).unwrap();
        let mut service = service(&tmp);

        let uri = Uri::parse(&tmp.path().join("tree").display().to_string()).unwrap();
        let record = service.run_scan_blocking(&uri).unwrap();

        let scans = service.list_scans().unwrap();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].id, record.id);

        let view = service.view(&uri, 2).unwrap();
        assert_eq!(view.status, crate::planner::ViewStatus::Full);
        assert_eq!(view.nodes[0].size, record.root_size);

        service.shutdown();
    }

    #[test]
    fn test_list_buckets_reports_scan_state() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = ServiceOptions::default()
            .root_dir(tmp.path().join("state"))
            .object_store(ObjectStoreOptions::default().buckets(vec!["pail".to_string()]));
        let mut service = Service::new(opts).unwrap();

        let buckets = service.list_buckets().unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].uri.as_str(), "s3://pail");
        assert!(buckets[0].last_scan.is_none());

        service.shutdown();
    }

    #[test]
    fn test_gc_keeps_newest_per_root() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = ServiceOptions::default()
            .root_dir(tmp.path().join("state"))
            .retention(
                RetentionOptions::default()
                    .keep_last(1_u32)
                    .keep_within("1s".parse::<humantime::Duration>().unwrap()),
            );
        let mut service = Service::new(opts).unwrap();

        for at in [100, 200, 300] {
            let snapshot = snapshot_at("/a", &[("f", at as u64, 1)], at);
            let blob_id = service.blobs.put(&snapshot).unwrap();
            _ = service
                .catalog
                .insert_scan(&ScanRecord::for_snapshot(&snapshot, blob_id))
                .unwrap();
        }

        let stats = service.gc().unwrap();

        assert_eq!(stats.scans_removed, 2);
        assert_eq!(stats.blobs_removed, 2);
        let kept = service.list_scans().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].completed_at.timestamp(), 300);
        assert!(service.blobs.contains(&kept[0].blob_id));

        service.shutdown();
    }

    #[test]
    fn test_delete_refuses_to_race_overlapping_scan() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("tree/sub")).unwrap();
        let opts = ServiceOptions::default()
            .root_dir(tmp.path().join("state"))
            .worker_command("sh -c 'sleep 5'".parse::<CommandInput>().unwrap());
        let mut service = Service::new(opts).unwrap();

        let root = Uri::parse(&tmp.path().join("tree").display().to_string()).unwrap();
        let job = service.start_scan(&root).unwrap();

        let err = service.delete(&root.join("sub").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CatalogConflict);

        service.cancel_scan(job).unwrap();
        service.shutdown();
    }
}
