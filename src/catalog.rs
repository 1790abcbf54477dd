//! The durable index of completed scans and in-flight scan progress.
//!
//! One SQLite database holds the `scan` relation (completed scans with their
//! denormalized root aggregates, so listing and planning never open a blob)
//! and the ephemeral `scan_progress` relation that workers update while they
//! run. Readers are snapshot-isolated via WAL; writers serialize behind the
//! connection lock, and busy conflicts are retried a bounded number of times
//! with jitter.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DuvizError, DuvizResult, ErrorKind},
    id::BlobId,
    snapshot::Snapshot,
    uri::Uri,
};

pub(crate) mod constants {
    use std::time::Duration;

    /// How long SQLite itself waits on a locked database
    pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(2);
    /// Bounded retries on top of the busy timeout
    pub(crate) const MAX_RETRIES: u32 = 5;
    /// Upper bound of the first retry jitter; doubles per attempt
    pub(crate) const JITTER_MS: u64 = 25;
}

/// One completed scan as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Catalog row id
    pub id: i64,
    /// The scanned root
    pub root_uri: Uri,
    /// When the scan finished
    pub completed_at: DateTime<Utc>,
    /// Content address of the snapshot blob
    pub blob_id: BlobId,
    /// Root aggregate: total size in bytes
    pub root_size: u64,
    /// Root aggregate: direct children
    pub root_n_children: u32,
    /// Root aggregate: total descendants
    pub root_n_desc: u64,
    /// Per-path errors encountered by the scan
    pub error_count: u64,
    /// Sampled error paths
    pub error_paths: Vec<String>,
    /// Set when the blob is pending a rewrite; planners skip such rows
    pub needs_repair: bool,
}

impl ScanRecord {
    /// Build the catalog row for a freshly aggregated snapshot.
    ///
    /// The denormalized aggregates are taken from the snapshot root, so row
    /// and blob agree by construction.
    #[must_use]
    pub fn for_snapshot(snapshot: &Snapshot, blob_id: BlobId) -> Self {
        let root = snapshot.root();
        Self {
            id: 0,
            root_uri: snapshot.root_uri.clone(),
            completed_at: snapshot.completed_at,
            blob_id,
            root_size: root.size,
            root_n_children: root.n_children,
            root_n_desc: root.n_desc,
            error_count: snapshot.error_count,
            error_paths: snapshot.error_paths.clone(),
            needs_repair: false,
        }
    }
}

/// Status of an in-flight or just-terminated scan.
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
pub enum ScanStatus {
    /// The worker is running
    Running,
    /// The worker finished and committed its scan
    Completed,
    /// The worker failed or was cancelled
    Failed,
}

/// The ephemeral progress row of one scan job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Job id; chosen by the scheduler, used as the row key
    pub id: i64,
    /// The root being scanned
    pub root_uri: Uri,
    /// PID of the worker subprocess
    pub worker_pid: u32,
    /// When the worker started
    pub started_at: DateTime<Utc>,
    /// Entries seen so far
    pub items_found: u64,
    /// Recent throughput, when known
    pub items_per_sec: Option<f64>,
    /// Per-path errors so far
    pub error_count: u64,
    /// Job status
    pub status: ScanStatus,
}

/// Handle to the catalog database.
///
/// The handle is owned by the service and passed explicitly; tests open one
/// against a temporary directory.
#[derive(Debug)]
pub struct Catalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

const SCAN_COLS: &str = "id, root_uri, completed_at, blob_id, root_size, root_n_children, \
                         root_n_desc, error_count, error_paths, needs_repair";

const PROGRESS_COLS: &str =
    "id, root_uri, worker_pid, started_at, items_found, items_per_sec, error_count, status";

impl Catalog {
    /// Open (and create if needed) the catalog at `path`.
    ///
    /// # Errors
    ///
    /// * If the database cannot be opened or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> DuvizResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to open the catalog database.", err)
                .attach_context("path", path.display().to_string())
        })?;

        conn.busy_timeout(constants::BUSY_TIMEOUT).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to set the busy timeout.", err)
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS scan (
                 id              INTEGER PRIMARY KEY AUTOINCREMENT,
                 root_uri        TEXT NOT NULL,
                 completed_at    TEXT NOT NULL,
                 blob_id         TEXT NOT NULL,
                 root_size       INTEGER NOT NULL,
                 root_n_children INTEGER NOT NULL,
                 root_n_desc     INTEGER NOT NULL,
                 error_count     INTEGER NOT NULL,
                 error_paths     TEXT NOT NULL,
                 needs_repair    INTEGER NOT NULL DEFAULT 0
             );
             CREATE INDEX IF NOT EXISTS idx_scan_root_uri
                 ON scan (root_uri);
             CREATE INDEX IF NOT EXISTS idx_scan_root_completed
                 ON scan (root_uri, completed_at DESC);

             CREATE TABLE IF NOT EXISTS scan_progress (
                 id            INTEGER PRIMARY KEY,
                 root_uri      TEXT NOT NULL,
                 worker_pid    INTEGER NOT NULL,
                 started_at    TEXT NOT NULL,
                 updated_at    TEXT NOT NULL,
                 items_found   INTEGER NOT NULL,
                 items_per_sec REAL,
                 error_count   INTEGER NOT NULL,
                 status        TEXT NOT NULL
             );",
        )
        .map_err(|err| {
            DuvizError::with_source(
                ErrorKind::Internal,
                "Failed to apply the catalog schema.",
                err,
            )
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// The database file this catalog lives in.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection, retrying busy conflicts with jitter.
    fn with_conn<T>(&self, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> DuvizResult<T> {
        let conn = self.conn.lock().unwrap();
        let mut attempt: u32 = 0;
        loop {
            match f(&conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    if attempt >= constants::MAX_RETRIES {
                        return Err(DuvizError::with_source(
                            ErrorKind::CatalogConflict,
                            "The catalog stayed busy after bounded retries.",
                            err,
                        ));
                    }
                    let jitter = jitter_ms(attempt);
                    warn!("catalog busy, retrying in {jitter}ms");
                    std::thread::sleep(Duration::from_millis(jitter));
                    attempt += 1;
                }
                Err(err) => {
                    return Err(DuvizError::with_source(
                        ErrorKind::Internal,
                        "A catalog query failed.",
                        err,
                    ));
                }
            }
        }
    }

    // ---- scan rows ----

    /// Insert a scan row; returns the assigned id.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::CatalogConflict`] when writers stay serialized too long.
    pub fn insert_scan(&self, record: &ScanRecord) -> DuvizResult<i64> {
        let error_paths = serde_json::to_string(&record.error_paths).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to encode error paths.", err)
        })?;
        let id = self.with_conn(|conn| {
            _ = conn.execute(
                "INSERT INTO scan (root_uri, completed_at, blob_id, root_size, root_n_children,
                                   root_n_desc, error_count, error_paths, needs_repair)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.root_uri.as_str(),
                    record.completed_at,
                    record.blob_id.to_hex().as_str(),
                    record.root_size as i64,
                    i64::from(record.root_n_children),
                    record.root_n_desc as i64,
                    record.error_count as i64,
                    error_paths,
                    record.needs_repair,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!("recorded scan {id} of {}", record.root_uri);
        Ok(id)
    }

    /// Fetch one scan row.
    pub fn by_id(&self, id: i64) -> DuvizResult<Option<ScanRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SCAN_COLS} FROM scan WHERE id = ?1"),
                params![id],
                scan_from_row,
            )
            .optional()
        })
    }

    /// Remove one scan row.
    pub fn delete_scan(&self, id: i64) -> DuvizResult<()> {
        _ = self.with_conn(|conn| conn.execute("DELETE FROM scan WHERE id = ?1", params![id]))?;
        Ok(())
    }

    /// All scan rows, newest first.
    pub fn all_scans(&self) -> DuvizResult<Vec<ScanRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCAN_COLS} FROM scan ORDER BY completed_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], scan_from_row)?;
            rows.collect()
        })
    }

    /// The newest scan per distinct root, ordered by root.
    pub fn latest_per_root(&self) -> DuvizResult<Vec<ScanRecord>> {
        let mut out: Vec<ScanRecord> = Vec::new();
        for record in self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCAN_COLS} FROM scan ORDER BY root_uri ASC, completed_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], scan_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })? {
            if out.last().map(|r: &ScanRecord| &r.root_uri) != Some(&record.root_uri) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// All scans whose root is an ancestor of `uri` or equal to it, newest first.
    pub fn history_for(&self, uri: &Uri) -> DuvizResult<Vec<ScanRecord>> {
        let ancestors = uri_strings(&uri.self_and_ancestors());
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SCAN_COLS} FROM scan WHERE root_uri IN ({}) \
                 ORDER BY completed_at DESC, id DESC",
                placeholders(ancestors.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(ancestors.iter()), scan_from_row)?;
            rows.collect()
        })
    }

    /// The most recent usable scan whose root is an ancestor of `uri`.
    ///
    /// Rows marked `needs_repair` are skipped; they are stale by definition.
    pub fn ancestor_for(&self, uri: &Uri) -> DuvizResult<Option<ScanRecord>> {
        let ancestors = uri_strings(&uri.self_and_ancestors());
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SCAN_COLS} FROM scan \
                 WHERE root_uri IN ({}) AND needs_repair = 0 \
                 ORDER BY completed_at DESC, id DESC LIMIT 1",
                placeholders(ancestors.len())
            );
            conn.query_row(&sql, rusqlite::params_from_iter(ancestors.iter()), scan_from_row)
                .optional()
        })
    }

    /// The newest usable scan with the smallest tree still covering `uri`:
    /// ancestors are tried closest-first.
    pub fn smallest_covering(&self, uri: &Uri) -> DuvizResult<Option<ScanRecord>> {
        for ancestor in uri.self_and_ancestors() {
            let found = self.with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {SCAN_COLS} FROM scan \
                         WHERE root_uri = ?1 AND needs_repair = 0 \
                         ORDER BY completed_at DESC, id DESC LIMIT 1"
                    ),
                    params![ancestor.as_str()],
                    scan_from_row,
                )
                .optional()
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Usable scans rooted strictly below `uri` and completed after `since`;
    /// newest first, at most one per root.
    pub fn fresher_children_of(
        &self,
        uri: &Uri,
        since: DateTime<Utc>,
    ) -> DuvizResult<Vec<ScanRecord>> {
        let pattern = like_child_pattern(uri);
        let rows = self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SCAN_COLS} FROM scan \
                 WHERE root_uri LIKE ?1 ESCAPE '\\' AND completed_at > ?2 AND needs_repair = 0 \
                 ORDER BY completed_at DESC, id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![pattern, since], scan_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        // newest per root wins
        let mut seen = std::collections::HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|r| seen.insert(r.root_uri.clone()))
            .collect())
    }

    /// All scans rooted at `uri` or below it, regardless of repair state.
    pub fn scans_at_or_under(&self, uri: &Uri) -> DuvizResult<Vec<ScanRecord>> {
        let pattern = like_child_pattern(uri);
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SCAN_COLS} FROM scan \
                 WHERE root_uri = ?1 OR root_uri LIKE ?2 ESCAPE '\\' \
                 ORDER BY completed_at DESC, id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![uri.as_str(), pattern], scan_from_row)?;
            rows.collect()
        })
    }

    /// Flag a row so planners skip it until its blob is rewritten.
    pub fn mark_needs_repair(&self, id: i64) -> DuvizResult<()> {
        _ = self.with_conn(|conn| {
            conn.execute("UPDATE scan SET needs_repair = 1 WHERE id = ?1", params![id])
        })?;
        Ok(())
    }

    /// Swap in the rewritten blob and its fresh root aggregates.
    pub fn update_after_repair(
        &self,
        id: i64,
        blob_id: BlobId,
        root_size: u64,
        root_n_children: u32,
        root_n_desc: u64,
    ) -> DuvizResult<()> {
        _ = self.with_conn(|conn| {
            conn.execute(
                "UPDATE scan SET blob_id = ?2, root_size = ?3, root_n_children = ?4, \
                 root_n_desc = ?5, needs_repair = 0 WHERE id = ?1",
                params![
                    id,
                    blob_id.to_hex().as_str(),
                    root_size as i64,
                    i64::from(root_n_children),
                    root_n_desc as i64,
                ],
            )
        })?;
        Ok(())
    }

    /// How many scan rows reference the given blob.
    pub fn blob_refs(&self, blob_id: &BlobId) -> DuvizResult<u64> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM scan WHERE blob_id = ?1",
                params![blob_id.to_hex().as_str()],
                |row| row.get(0),
            )
        })?;
        Ok(count as u64)
    }

    // ---- progress rows ----

    /// Create or replace the progress row of a job.
    pub fn upsert_progress(&self, progress: &ScanProgress) -> DuvizResult<()> {
        _ = self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO scan_progress
                     (id, root_uri, worker_pid, started_at, updated_at, items_found,
                      items_per_sec, error_count, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    progress.id,
                    progress.root_uri.as_str(),
                    i64::from(progress.worker_pid),
                    progress.started_at,
                    Utc::now(),
                    progress.items_found as i64,
                    progress.items_per_sec,
                    progress.error_count as i64,
                    progress.status.to_string(),
                ],
            )
        })?;
        Ok(())
    }

    /// Bump the live counters of a running job.
    pub fn update_progress_counters(
        &self,
        id: i64,
        items_found: u64,
        items_per_sec: Option<f64>,
        error_count: u64,
    ) -> DuvizResult<()> {
        _ = self.with_conn(|conn| {
            conn.execute(
                "UPDATE scan_progress SET items_found = ?2, items_per_sec = ?3, \
                 error_count = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    id,
                    items_found as i64,
                    items_per_sec,
                    error_count as i64,
                    Utc::now(),
                ],
            )
        })?;
        Ok(())
    }

    /// Move a progress row to a terminal status.
    pub fn mark_progress(&self, id: i64, status: ScanStatus) -> DuvizResult<()> {
        _ = self.with_conn(|conn| {
            conn.execute(
                "UPDATE scan_progress SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.to_string(), Utc::now()],
            )
        })?;
        Ok(())
    }

    /// Drop the progress row of a job.
    pub fn remove_progress(&self, id: i64) -> DuvizResult<()> {
        _ = self.with_conn(|conn| {
            conn.execute("DELETE FROM scan_progress WHERE id = ?1", params![id])
        })?;
        Ok(())
    }

    /// Fetch one progress row.
    pub fn progress_by_id(&self, id: i64) -> DuvizResult<Option<ScanProgress>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PROGRESS_COLS} FROM scan_progress WHERE id = ?1"),
                params![id],
                progress_from_row,
            )
            .optional()
        })
    }

    /// All rows still marked running, oldest first.
    pub fn running_progress(&self) -> DuvizResult<Vec<ScanProgress>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROGRESS_COLS} FROM scan_progress WHERE status = 'running' \
                 ORDER BY started_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], progress_from_row)?;
            rows.collect()
        })
    }

    /// Drop terminal progress rows that have not been touched since `before`.
    ///
    /// Failed rows are retained briefly so observers can pick up the terminal
    /// state; this is their eviction.
    pub fn purge_stale_progress(&self, before: DateTime<Utc>) -> DuvizResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM scan_progress WHERE status != 'running' AND updated_at < ?1",
                params![before],
            )
        })
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn jitter_ms(attempt: u32) -> u64 {
    use rand::Rng;
    let cap = constants::JITTER_MS << attempt;
    rand::thread_rng().gen_range(1..=cap)
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

fn uri_strings(uris: &[Uri]) -> Vec<String> {
    uris.iter().map(ToString::to_string).collect()
}

/// LIKE pattern matching strict descendants of `uri`, with `\` escaping.
fn like_child_pattern(uri: &Uri) -> String {
    let escaped: String = uri
        .as_str()
        .chars()
        .flat_map(|c| match c {
            '\\' | '%' | '_' => vec!['\\', c],
            c => vec![c],
        })
        .collect();
    if escaped.ends_with('/') {
        // the local scheme root
        format!("{escaped}%")
    } else {
        format!("{escaped}/%")
    }
}

fn parse_failure(
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRecord> {
    let root_uri: String = row.get(1)?;
    let blob_id: String = row.get(3)?;
    let error_paths: String = row.get(8)?;
    Ok(ScanRecord {
        id: row.get(0)?,
        root_uri: Uri::parse(&root_uri).map_err(parse_failure)?,
        completed_at: row.get(2)?,
        blob_id: blob_id.parse().map_err(parse_failure)?,
        root_size: row.get::<_, i64>(4)? as u64,
        root_n_children: row.get::<_, i64>(5)? as u32,
        root_n_desc: row.get::<_, i64>(6)? as u64,
        error_count: row.get::<_, i64>(7)? as u64,
        error_paths: serde_json::from_str(&error_paths).map_err(parse_failure)?,
        needs_repair: row.get(9)?,
    })
}

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<ScanProgress> {
    let root_uri: String = row.get(1)?;
    let status: String = row.get(7)?;
    Ok(ScanProgress {
        id: row.get(0)?,
        root_uri: Uri::parse(&root_uri).map_err(parse_failure)?,
        worker_pid: row.get::<_, i64>(2)? as u32,
        started_at: row.get(3)?,
        items_found: row.get::<_, i64>(4)? as u64,
        items_per_sec: row.get(5)?,
        error_count: row.get::<_, i64>(6)? as u64,
        status: status.parse().map_err(parse_failure)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use crate::id::Id;

    use super::*;

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(tmp.path().join("catalog.db")).unwrap();
        (tmp, catalog)
    }

    fn record(root: &str, at: i64) -> ScanRecord {
        ScanRecord {
            id: 0,
            root_uri: Uri::parse(root).unwrap(),
            completed_at: Utc.timestamp_opt(at, 0).unwrap(),
            blob_id: Id::from_content(format!("{root}@{at}").as_bytes()).into(),
            root_size: 100,
            root_n_children: 2,
            root_n_desc: 5,
            error_count: 0,
            error_paths: vec![],
            needs_repair: false,
        }
    }

    #[test]
    fn test_insert_and_fetch_round_trip() {
        let (_tmp, catalog) = catalog();
        let mut rec = record("/a", 100);
        rec.error_paths = vec!["/a/denied".to_string()];

        let id = catalog.insert_scan(&rec).unwrap();
        let fetched = catalog.by_id(id).unwrap().unwrap();

        rec.id = id;
        assert_eq!(fetched, rec);
    }

    #[test]
    fn test_latest_per_root_picks_newest() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/a", 100)).unwrap();
        _ = catalog.insert_scan(&record("/a", 200)).unwrap();
        _ = catalog.insert_scan(&record("/b", 150)).unwrap();

        let latest = catalog.latest_per_root().unwrap();
        let got: Vec<(String, i64)> = latest
            .iter()
            .map(|r| (r.root_uri.to_string(), r.completed_at.timestamp()))
            .collect();

        assert_eq!(got, [("/a".to_string(), 200), ("/b".to_string(), 150)]);
    }

    #[test]
    fn test_ancestor_lookup_prefers_recency_and_skips_repairs() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/", 100)).unwrap();
        _ = catalog.insert_scan(&record("/a", 300)).unwrap();
        let broken = catalog.insert_scan(&record("/a/b", 400)).unwrap();
        catalog.mark_needs_repair(broken).unwrap();

        let uri = Uri::parse("/a/b/c").unwrap();
        let anc = catalog.ancestor_for(&uri).unwrap().unwrap();

        // the 400 scan is repair-pending, so the /a scan at 300 wins
        assert_eq!(anc.root_uri.as_str(), "/a");
        assert_eq!(anc.completed_at.timestamp(), 300);
    }

    #[test]
    fn test_ancestor_lookup_respects_slash_boundaries() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/ab", 100)).unwrap();

        let uri = Uri::parse("/a").unwrap();
        assert!(catalog.ancestor_for(&uri).unwrap().is_none());
    }

    #[test]
    fn test_smallest_covering_is_closest_first() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/", 900)).unwrap();
        _ = catalog.insert_scan(&record("/a", 100)).unwrap();

        let uri = Uri::parse("/a/x").unwrap();
        let covering = catalog.smallest_covering(&uri).unwrap().unwrap();

        // `/a` is older but covers with the smaller tree
        assert_eq!(covering.root_uri.as_str(), "/a");
    }

    #[test]
    fn test_fresher_children_are_strict_descendants_after_since() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/a", 50)).unwrap();
        _ = catalog.insert_scan(&record("/a/b", 80)).unwrap();
        _ = catalog.insert_scan(&record("/a/b", 200)).unwrap();
        _ = catalog.insert_scan(&record("/a/c/d", 300)).unwrap();
        _ = catalog.insert_scan(&record("/ax", 400)).unwrap();

        let uri = Uri::parse("/a").unwrap();
        let since = Utc.timestamp_opt(100, 0).unwrap();
        let fresher = catalog.fresher_children_of(&uri, since).unwrap();
        let got: Vec<(String, i64)> = fresher
            .iter()
            .map(|r| (r.root_uri.to_string(), r.completed_at.timestamp()))
            .collect();

        // `/a` itself and `/ax` are out; only the newest `/a/b` row counts
        assert_eq!(
            got,
            [
                ("/a/c/d".to_string(), 300),
                ("/a/b".to_string(), 200),
            ]
        );
    }

    #[test]
    fn test_history_covers_all_ancestors_newest_first() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/", 100)).unwrap();
        _ = catalog.insert_scan(&record("/a", 300)).unwrap();
        _ = catalog.insert_scan(&record("/a/b", 200)).unwrap();
        _ = catalog.insert_scan(&record("/other", 500)).unwrap();

        let uri = Uri::parse("/a/b").unwrap();
        let history = catalog.history_for(&uri).unwrap();
        let got: Vec<i64> = history.iter().map(|r| r.completed_at.timestamp()).collect();

        assert_eq!(got, [300, 200, 100]);
    }

    #[test]
    fn test_blob_refs_counts_rows() {
        let (_tmp, catalog) = catalog();
        let rec = record("/a", 100);
        _ = catalog.insert_scan(&rec).unwrap();
        let mut rec2 = record("/b", 100);
        rec2.blob_id = rec.blob_id;
        _ = catalog.insert_scan(&rec2).unwrap();

        assert_eq!(catalog.blob_refs(&rec.blob_id).unwrap(), 2);
        assert_eq!(
            catalog
                .blob_refs(&Id::from_content(b"unused").into())
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_progress_lifecycle() {
        let (_tmp, catalog) = catalog();
        let progress = ScanProgress {
            id: 42,
            root_uri: Uri::parse("/a").unwrap(),
            worker_pid: 4711,
            started_at: Utc.timestamp_opt(1000, 0).unwrap(),
            items_found: 0,
            items_per_sec: None,
            error_count: 0,
            status: ScanStatus::Running,
        };
        catalog.upsert_progress(&progress).unwrap();

        catalog
            .update_progress_counters(42, 10_000, Some(5_000.0), 1)
            .unwrap();
        let running = catalog.running_progress().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].items_found, 10_000);
        assert_eq!(running[0].items_per_sec, Some(5_000.0));

        catalog.mark_progress(42, ScanStatus::Failed).unwrap();
        assert!(catalog.running_progress().unwrap().is_empty());
        assert_eq!(
            catalog.progress_by_id(42).unwrap().unwrap().status,
            ScanStatus::Failed
        );

        // failed rows are retained until purged
        let purged = catalog.purge_stale_progress(Utc::now()).unwrap();
        assert_eq!(purged, 1);
        assert!(catalog.progress_by_id(42).unwrap().is_none());
    }

    #[test]
    fn test_update_after_repair_clears_flag() {
        let (_tmp, catalog) = catalog();
        let id = catalog.insert_scan(&record("/a", 100)).unwrap();
        catalog.mark_needs_repair(id).unwrap();
        assert!(catalog.by_id(id).unwrap().unwrap().needs_repair);

        let new_blob: BlobId = Id::from_content(b"rewritten").into();
        catalog
            .update_after_repair(id, new_blob, 90, 1, 3)
            .unwrap();

        let rec = catalog.by_id(id).unwrap().unwrap();
        assert!(!rec.needs_repair);
        assert_eq!(rec.blob_id, new_blob);
        assert_eq!(rec.root_size, 90);
        assert_eq!(rec.root_n_desc, 3);
    }

    #[test]
    fn test_scans_at_or_under() {
        let (_tmp, catalog) = catalog();
        _ = catalog.insert_scan(&record("/a", 100)).unwrap();
        _ = catalog.insert_scan(&record("/a/b", 200)).unwrap();
        _ = catalog.insert_scan(&record("/ab", 300)).unwrap();
        _ = catalog.insert_scan(&record("/", 400)).unwrap();

        let uri = Uri::parse("/a").unwrap();
        let got: Vec<String> = catalog
            .scans_at_or_under(&uri)
            .unwrap()
            .iter()
            .map(|r| r.root_uri.to_string())
            .collect();

        assert_eq!(got, ["/a/b", "/a"]);
    }
}
