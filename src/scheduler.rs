//! Supervises scan jobs as worker subprocesses.
//!
//! Each job runs the probe->aggregate->blob->catalog pipeline in its own
//! subprocess, which isolates scanner memory and makes cancellation a signal.
//! The scheduler keeps an in-memory job table with a per-root registry (one
//! active scan per root; duplicate starts coalesce onto the running job) and
//! a global concurrency cap; excess jobs wait in `pending`. A ticker thread
//! publishes the running progress rows to subscribers and evicts stale
//! terminal rows.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Catalog, ScanStatus},
    error::{DuvizError, DuvizResult, ErrorKind},
    progress::{ProgressHub, ProgressSubscriber},
    service::command_input::CommandInput,
    uri::{Scheme, Uri},
};

pub(crate) mod constants {
    use std::time::Duration;

    /// Per-subscriber progress buffer
    pub(crate) const SUBSCRIBER_BUFFER: usize = 64;
    /// Time between SIGTERM and SIGKILL on cancellation
    pub(crate) const KILL_GRACE: Duration = Duration::from_secs(5);
    /// Terminal progress rows are evicted after this many ticks
    pub(crate) const PROGRESS_RETAIN_TICKS: u32 = 10;
}

/// Identifies a scan job for its lifetime.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
pub struct JobId(i64);

impl JobId {
    /// The raw id, which is also the key of the job's `scan_progress` row.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

/// Lifecycle state of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    /// Waiting for a free slot under the concurrency cap
    Pending,
    /// The worker subprocess is running
    Running,
    /// The worker exited zero and committed its scan
    Completed,
    /// The worker failed
    Failed,
    /// The job was cancelled; treated as failed by observers
    Cancelled,
}

impl JobState {
    /// Whether the job has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A scan job as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Job id
    pub id: JobId,
    /// The root being scanned
    pub root_uri: Uri,
    /// Current state
    pub state: JobState,
    /// When the job was accepted
    pub started_at: DateTime<Utc>,
    /// PID of the worker, once launched
    pub worker_pid: Option<u32>,
}

/// Everything the scheduler needs to launch workers.
#[derive(Debug, Clone)]
pub(crate) struct SchedulerConfig {
    /// Service root directory, handed to workers as their first argument
    pub(crate) root_dir: PathBuf,
    /// Global cap on concurrently running scans
    pub(crate) max_concurrent: usize,
    /// Progress publication interval
    pub(crate) progress_tick: Duration,
    /// Worker command; the compiled-in worker binary when unset
    pub(crate) worker_command: CommandInput,
    /// Prefix local-scan workers with sudo
    pub(crate) sudo_local_probe: bool,
}

struct JobEntry {
    job: Job,
    cancel_requested: bool,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<i64, JobEntry>,
    /// The scan registry: the one active (pending or running) job per root.
    /// This is the only cross-job lock, held during start and termination.
    by_root: HashMap<String, i64>,
    queue: VecDeque<i64>,
    running: usize,
}

struct Inner {
    catalog: Arc<Catalog>,
    hub: ProgressHub,
    cfg: SchedulerConfig,
    table: Mutex<JobTable>,
}

/// Supervises scan jobs and publishes their progress.
pub struct Scheduler {
    inner: Arc<Inner>,
    shutdown_tx: Option<Sender<()>>,
    ticker: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    pub(crate) fn new(catalog: Arc<Catalog>, cfg: SchedulerConfig) -> Self {
        let inner = Arc::new(Inner {
            catalog,
            hub: ProgressHub::new(constants::SUBSCRIBER_BUFFER),
            cfg,
            table: Mutex::new(JobTable::default()),
        });

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let ticker_inner = Arc::clone(&inner);
        let ticker = std::thread::Builder::new()
            .name("duviz-progress-ticker".to_string())
            .spawn(move || ticker_loop(&ticker_inner, &shutdown_rx))
            .expect("failed to spawn the progress ticker");

        Self {
            inner,
            shutdown_tx: Some(shutdown_tx),
            ticker: Some(ticker),
        }
    }

    /// Start scanning `uri`, or join the already-active scan of the same root.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::Internal`] if the job table is poisoned.
    pub fn start(&self, uri: &Uri) -> DuvizResult<JobId> {
        let mut table = self.inner.table.lock().unwrap();

        // coalesce onto the active job of this root
        if let Some(&id) = table.by_root.get(uri.as_str()) {
            debug!("coalescing scan request for {uri} onto job {id}");
            return Ok(JobId(id));
        }

        let id = fresh_job_id(&table);
        let job = Job {
            id: JobId(id),
            root_uri: uri.clone(),
            state: JobState::Pending,
            started_at: Utc::now(),
            worker_pid: None,
        };
        _ = table.jobs.insert(
            id,
            JobEntry {
                job,
                cancel_requested: false,
            },
        );
        _ = table.by_root.insert(uri.to_string(), id);
        table.queue.push_back(id);
        info!("accepted scan job {id} for {uri}");

        launch_ready(&self.inner, &mut table);
        Ok(JobId(id))
    }

    /// Current state of a job.
    #[must_use]
    pub fn status(&self, id: JobId) -> Option<Job> {
        self.inner
            .table
            .lock()
            .unwrap()
            .jobs
            .get(&id.get())
            .map(|e| e.job.clone())
    }

    /// All jobs that have not terminated yet.
    #[must_use]
    pub fn active(&self) -> Vec<Job> {
        let table = self.inner.table.lock().unwrap();
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|e| !e.job.state.is_terminal())
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// Attach to the progress stream.
    ///
    /// Subscribers may drop out at any time without affecting jobs.
    #[must_use]
    pub fn subscribe(&self) -> ProgressSubscriber {
        self.inner.hub.subscribe()
    }

    /// Cancel a job: pending jobs are dropped, running workers get SIGTERM
    /// and, after a grace period, SIGKILL.
    ///
    /// # Errors
    ///
    /// * [`ErrorKind::NotFound`] for unknown or already-terminated jobs.
    pub fn cancel(&self, id: JobId) -> DuvizResult<()> {
        let pid = {
            let mut table = self.inner.table.lock().unwrap();
            let entry = table.jobs.get_mut(&id.get()).ok_or_else(|| {
                DuvizError::new(ErrorKind::NotFound, "No such scan job.")
                    .attach_context("job", id.to_string())
            })?;
            match entry.job.state {
                JobState::Pending => {
                    entry.job.state = JobState::Cancelled;
                    let root = entry.job.root_uri.to_string();
                    table.queue.retain(|queued| *queued != id.get());
                    _ = table.by_root.remove(&root);
                    self.inner.hub.publish_ended(id.get(), ScanStatus::Failed);
                    info!("cancelled pending job {id}");
                    return Ok(());
                }
                JobState::Running => {
                    entry.cancel_requested = true;
                    entry.job.worker_pid
                }
                _ => {
                    return Err(DuvizError::new(
                        ErrorKind::NotFound,
                        "The job has already terminated.",
                    )
                    .attach_context("job", id.to_string()));
                }
            }
        };

        if let Some(pid) = pid {
            info!("cancelling job {id}: SIGTERM to {pid}");
            signal_worker(pid, Signal::SIGTERM);

            let inner = Arc::clone(&self.inner);
            drop(std::thread::Builder::new()
                .name("duviz-kill-grace".to_string())
                .spawn(move || {
                    std::thread::sleep(constants::KILL_GRACE);
                    let still_running = inner
                        .table
                        .lock()
                        .unwrap()
                        .jobs
                        .get(&id.get())
                        .is_some_and(|e| e.job.state == JobState::Running);
                    if still_running {
                        warn!("job {id} survived SIGTERM, sending SIGKILL");
                        signal_worker(pid, Signal::SIGKILL);
                    }
                }));
        }
        Ok(())
    }

    /// Cancel everything and stop the ticker.
    pub fn shutdown(&mut self) {
        let running: Vec<JobId> = self
            .active()
            .into_iter()
            .map(|j| j.id)
            .collect();
        for id in running {
            if let Err(err) = self.cancel(id) {
                debug!("shutdown cancel of {id}: {err}");
            }
        }
        drop(self.shutdown_tx.take());
        if let Some(ticker) = self.ticker.take() {
            _ = ticker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Promote pending jobs into free slots. Call with the table locked.
fn launch_ready(inner: &Arc<Inner>, table: &mut JobTable) {
    while table.running < inner.cfg.max_concurrent {
        let Some(id) = table.queue.pop_front() else {
            break;
        };
        let Some(entry) = table.jobs.get_mut(&id) else {
            continue;
        };
        if entry.job.state != JobState::Pending {
            continue;
        }
        match inner.spawn_worker(&entry.job) {
            Ok(child) => {
                entry.job.state = JobState::Running;
                entry.job.worker_pid = Some(child.id());
                table.running += 1;
                debug!("job {id} running as pid {}", child.id());

                let monitor_inner = Arc::clone(inner);
                drop(std::thread::Builder::new()
                    .name(format!("duviz-job-{id}"))
                    .spawn(move || monitor_inner.monitor(id, child)));
            }
            Err(err) => {
                error!("failed to launch worker for job {id}: {err}");
                entry.job.state = JobState::Failed;
                let root = entry.job.root_uri.to_string();
                _ = table.by_root.remove(&root);
                inner.hub.publish_ended(id, ScanStatus::Failed);
            }
        }
    }
}

impl Inner {
    fn spawn_worker(&self, job: &Job) -> DuvizResult<Child> {
        let mut argv: Vec<String> = Vec::new();
        if self.cfg.sudo_local_probe && job.root_uri.scheme() == Scheme::Local {
            argv.push("sudo".to_string());
        }
        if self.cfg.worker_command.is_set() {
            argv.push(self.cfg.worker_command.command().to_string());
            argv.extend(self.cfg.worker_command.args().iter().cloned());
        } else {
            argv.push(default_worker_binary());
        }
        argv.push(self.cfg.root_dir.display().to_string());
        argv.push(job.id.to_string());
        argv.push(job.root_uri.to_string());

        debug!("spawning worker: {}", argv.join(" "));
        Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                DuvizError::with_source(
                    ErrorKind::Internal,
                    "Failed to spawn the scan worker subprocess.",
                    err,
                )
                .attach_context("command", argv.join(" "))
            })
    }

    /// Waits for the worker and settles the job.
    fn monitor(self: Arc<Self>, id: i64, mut child: Child) {
        let status = child.wait();

        let mut table = self.table.lock().unwrap();
        table.running = table.running.saturating_sub(1);
        let state = {
            let Some(entry) = table.jobs.get_mut(&id) else {
                return;
            };
            entry.job.state = match &status {
                Ok(st) if st.success() => JobState::Completed,
                _ if entry.cancel_requested => JobState::Cancelled,
                _ => JobState::Failed,
            };
            entry.job.state
        };
        if let Some(entry) = table.jobs.get(&id) {
            let root = entry.job.root_uri.to_string();
            _ = table.by_root.remove(&root);
        }
        launch_ready(&self, &mut table);
        drop(table);

        info!("job {id} terminated: {state}");
        if state == JobState::Completed {
            self.hub.publish_ended(id, ScanStatus::Completed);
        } else {
            // the worker may have died before settling its own row
            if let Err(err) = self.catalog.mark_progress(id, ScanStatus::Failed) {
                warn!("failed to settle progress row of job {id}: {err}");
            }
            self.hub.publish_ended(id, ScanStatus::Failed);
        }
    }
}

fn ticker_loop(inner: &Arc<Inner>, shutdown: &Receiver<()>) {
    let retain = inner
        .cfg
        .progress_tick
        .saturating_mul(constants::PROGRESS_RETAIN_TICKS);
    loop {
        match shutdown.recv_timeout(inner.cfg.progress_tick) {
            Err(RecvTimeoutError::Timeout) => {
                match inner.catalog.running_progress() {
                    Ok(rows) => inner.hub.publish_progress(&rows),
                    Err(err) => warn!("progress tick failed: {err}"),
                }
                if let Ok(retain) = chrono::Duration::from_std(retain) {
                    match inner.catalog.purge_stale_progress(Utc::now() - retain) {
                        Ok(0) => {}
                        Ok(n) => debug!("evicted {n} stale progress rows"),
                        Err(err) => warn!("progress eviction failed: {err}"),
                    }
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn fresh_job_id(table: &JobTable) -> i64 {
    let mut rng = rand::thread_rng();
    loop {
        let id = rng.gen_range(1..i64::MAX);
        if !table.jobs.contains_key(&id) {
            return id;
        }
    }
}

fn signal_worker(pid: u32, signal: Signal) {
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        // the worker usually has exited already
        debug!("signalling pid {pid} failed: {err}");
    }
}

/// The worker binary shipped next to the embedding executable, falling back
/// to a `PATH` lookup.
fn default_worker_binary() -> String {
    const WORKER_BIN: &str = "duviz-scan-worker";

    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN)))
        .filter(|candidate| candidate.exists())
        .map_or_else(
            || WORKER_BIN.to_string(),
            |candidate| candidate.display().to_string(),
        )
}
