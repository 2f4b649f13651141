//! Concurrent migration of stored records from one schema version to another.
//!
//! A job scans the store in id-ordered pages and hands each page to a fixed
//! pool of worker tasks over a bounded channel. Workers remap every record
//! and write it back with a compare-on-version update, so a record that
//! changed underneath the job is left alone. Individual write failures are
//! counted and tolerated; the job only fails when the store is unreachable,
//! too many records fail, or it is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use semconv_store::{Record, RecordFilter, RecordId, RecordStore, SchemaVersion, StoreError, UpdateOutcome};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::audit::{self, AuditEvent, AuditSink};
use crate::catalog::{MappingCatalog, MappingError};
use crate::mapping::AttributeMapping;
use crate::remap::remap_forward;
use crate::retry::{retry, Backoff, Retried};
use crate::version::VersionError;

/// Lifecycle of a migration job: `Idle → Running → Completed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },
    #[error("{failed} of {scanned} records failed, above the {threshold} threshold")]
    FailureRatioExceeded {
        failed: u64,
        scanned: u64,
        threshold: f64,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Counter snapshot. At completion `scanned == migrated + skipped + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub scanned: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub state: JobState,
    #[serde(flatten)]
    pub progress: Progress,
    pub reason: Option<AbortReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary of a job that reached `Completed`.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub job_id: Uuid,
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub progress: Progress,
    pub elapsed: Duration,
}

/// A job ended in `Failed`. Carries the counters reached before it stopped.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("migration {job_id} aborted: {reason}")]
pub struct MigrationAbortError {
    pub job_id: Uuid,
    pub reason: AbortReason,
    pub progress: Progress,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Unsupported(#[from] VersionError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("unknown migration job {0}")]
    UnknownJob(Uuid),
    #[error("migration job {0} is still running")]
    StillRunning(Uuid),
    #[error(transparent)]
    Abort(#[from] MigrationAbortError),
}

/// A record write that kept failing after every retry. Absorbed into the
/// job's `failed` counter; never returned to the caller.
#[derive(Debug, Error)]
#[error("writing {id} failed after {attempts} attempts: {source}")]
struct RecordWriteError {
    id: RecordId,
    attempts: u32,
    source: StoreError,
}

/// Opaque reference to a started job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(Uuid);

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for JobHandle {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Size of the worker pool of each job.
    pub workers: usize,
    pub page_size: usize,
    /// Attempts per record write, including the first.
    pub write_attempts: u32,
    pub write_backoff: Backoff,
    /// Abort once `failed / scanned` exceeds this ratio...
    pub failure_ratio_threshold: f64,
    /// ...and at least this many records have been scanned.
    pub failure_ratio_min_scanned: u64,
    /// Upper bound on any single store call.
    pub operation_timeout: Duration,
    /// On cancel, finish pages already handed to workers instead of stopping
    /// between records.
    pub drain_on_cancel: bool,
    /// Finished jobs kept for status queries. The oldest are dropped first.
    pub retained_jobs: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size: 256,
            write_attempts: 3,
            write_backoff: Backoff::new(Duration::from_millis(100), Duration::from_millis(2_000)),
            failure_ratio_threshold: 0.05,
            failure_ratio_min_scanned: 100,
            operation_timeout: Duration::from_millis(10_000),
            drain_on_cancel: true,
            retained_jobs: 64,
        }
    }
}

#[derive(Default)]
struct Counters {
    scanned: AtomicU64,
    migrated: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Progress {
        Progress {
            scanned: self.scanned.load(Ordering::SeqCst),
            migrated: self.migrated.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

struct Job {
    id: Uuid,
    from: SchemaVersion,
    to: SchemaVersion,
    filter: RecordFilter,
    counters: Counters,
    state: watch::Sender<JobState>,
    aborted: AtomicBool,
    reason: Mutex<Option<AbortReason>>,
    started: Mutex<Option<(DateTime<Utc>, Instant)>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

impl Job {
    fn new(from: SchemaVersion, to: SchemaVersion, filter: RecordFilter) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            id: Uuid::new_v4(),
            filter: filter.with_versions([from.clone(), to.clone()]),
            from,
            to,
            counters: Counters::default(),
            state,
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
            started: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    /// Record an abort reason. The first reason wins.
    fn abort(&self, reason: AbortReason) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        tracing::warn!(job_id = %self.id, %reason, "aborting migration");
        *slot = Some(reason);
        self.aborted.store(true, Ordering::SeqCst);
        true
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether a worker must stop before its next record. Cancellation with
    /// draining lets the current page finish; every other abort stops now.
    fn stop_between_records(&self, drain_on_cancel: bool) -> bool {
        if !self.is_aborted() {
            return false;
        }
        !(drain_on_cancel && matches!(*self.reason.lock(), Some(AbortReason::Cancelled)))
    }

    fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            from: self.from.clone(),
            to: self.to.clone(),
            state: *self.state.borrow(),
            progress: self.counters.snapshot(),
            reason: self.reason.lock().clone(),
            started_at: self.started.lock().map(|(at, _)| at),
            finished_at: *self.finished_at.lock(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .map(|(_, at)| at.elapsed())
            .unwrap_or_default()
    }
}

struct CoordinatorInner {
    store: Arc<dyn RecordStore>,
    catalog: MappingCatalog,
    audit: Arc<dyn AuditSink>,
    config: CoordinatorConfig,
    jobs: RwLock<HashMap<Uuid, Arc<Job>>>,
}

/// Starts, tracks and cancels migration jobs.
#[derive(Clone)]
pub struct MigrationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        catalog: MappingCatalog,
        audit: Arc<dyn AuditSink>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                store,
                catalog,
                audit,
                config,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Validate the version pair, resolve its mapping and start a background
    /// job over every record matching `filter`.
    ///
    /// Version and mapping errors are returned here; everything after the job
    /// starts is reported through [`status`](Self::status) and
    /// [`wait`](Self::wait).
    pub async fn start_migration(
        &self,
        from: &SchemaVersion,
        to: &SchemaVersion,
        filter: RecordFilter,
    ) -> Result<JobHandle, MigrationError> {
        let versions = self.inner.catalog.versions();
        versions.check(from)?;
        versions.check(to)?;
        let mapping = self.inner.catalog.get_mapping(from, to).await?;

        let job = Arc::new(Job::new(from.clone(), to.clone(), filter));
        self.inner.jobs.write().insert(job.id, Arc::clone(&job));

        *job.started.lock() = Some((Utc::now(), Instant::now()));
        job.state.send_replace(JobState::Running);
        tracing::info!(
            job_id = %job.id,
            %from,
            %to,
            workers = self.inner.config.workers,
            page_size = self.inner.config.page_size,
            "migration started"
        );

        let span = tracing::info_span!("migration", job_id = %job.id, %from, %to);
        tokio::spawn(run_job(Arc::clone(&self.inner), Arc::clone(&job), mapping).instrument(span));
        Ok(JobHandle(job.id))
    }

    pub fn status(&self, handle: JobHandle) -> Result<JobStatus, MigrationError> {
        Ok(self.job(handle)?.status())
    }

    /// Status of every job this coordinator has started.
    pub fn jobs(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.inner.jobs.read().values().map(|j| j.status()).collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Stop scheduling new pages. The job ends `Failed` with reason
    /// `Cancelled` once its workers have stopped. Cancelling a finished job
    /// does nothing.
    pub fn cancel(&self, handle: JobHandle) -> Result<(), MigrationError> {
        let job = self.job(handle)?;
        if job.state.borrow().is_terminal() {
            return Ok(());
        }
        if job.abort(AbortReason::Cancelled) {
            tracing::info!(job_id = %job.id, "migration cancellation requested");
        }
        Ok(())
    }

    /// Wait for the job to finish.
    pub async fn wait(&self, handle: JobHandle) -> Result<MigrationReport, MigrationError> {
        let job = self.job(handle)?;
        let mut rx = job.state.subscribe();
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => JobState::Failed,
        };

        let progress = job.counters.snapshot();
        match state {
            JobState::Completed => Ok(MigrationReport {
                job_id: job.id,
                from: job.from.clone(),
                to: job.to.clone(),
                progress,
                elapsed: job.elapsed(),
            }),
            _ => {
                let reason = job.reason.lock().clone().unwrap_or(AbortReason::Internal {
                    message: "job ended without a reason".into(),
                });
                Err(MigrationError::Abort(MigrationAbortError {
                    job_id: job.id,
                    reason,
                    progress,
                }))
            }
        }
    }

    /// Drop a finished job and return its final status.
    pub fn forget(&self, handle: JobHandle) -> Result<JobStatus, MigrationError> {
        let mut jobs = self.inner.jobs.write();
        let job = jobs.get(&handle.0).ok_or(MigrationError::UnknownJob(handle.0))?;
        if !job.state.borrow().is_terminal() {
            return Err(MigrationError::StillRunning(handle.0));
        }
        let status = job.status();
        jobs.remove(&handle.0);
        Ok(status)
    }

    fn job(&self, handle: JobHandle) -> Result<Arc<Job>, MigrationError> {
        self.inner
            .jobs
            .read()
            .get(&handle.0)
            .cloned()
            .ok_or(MigrationError::UnknownJob(handle.0))
    }
}

async fn run_job(inner: Arc<CoordinatorInner>, job: Arc<Job>, mapping: Arc<AttributeMapping>) {
    let config = &inner.config;
    let (tx, rx) = flume::bounded::<Vec<Record>>(config.workers.max(1));

    let mut workers = Vec::with_capacity(config.workers.max(1));
    for worker_id in 0..config.workers.max(1) {
        let rx = rx.clone();
        let inner = Arc::clone(&inner);
        let job = Arc::clone(&job);
        let mapping = Arc::clone(&mapping);
        workers.push(tokio::spawn(
            async move {
                while let Ok(page) = rx.recv_async().await {
                    if job.is_aborted() {
                        // Queued pages were never handed to a worker; drop them.
                        break;
                    }
                    tracing::debug!(worker_id, records = page.len(), "processing page");
                    for record in page {
                        if job.stop_between_records(inner.config.drain_on_cancel) {
                            break;
                        }
                        process_record(&inner, &job, &mapping, record).await;
                    }
                }
                tracing::debug!(worker_id, "migration worker stopped");
            }
            .in_current_span(),
        ));
    }
    drop(rx);

    produce_pages(&inner, &job, tx).await;

    // Completion barrier.
    for handle in workers {
        if let Err(e) = handle.await {
            job.abort(AbortReason::Internal {
                message: format!("worker task failed: {e}"),
            });
        }
    }

    finish(&inner, &job);
}

/// Keyset-paginate the job's filter and feed pages to the workers until the
/// scan is exhausted or the job is aborted.
async fn produce_pages(inner: &CoordinatorInner, job: &Job, tx: flume::Sender<Vec<Record>>) {
    let page_size = inner.config.page_size.max(1);
    let timeout = inner.config.operation_timeout;
    let mut after: Option<RecordId> = None;
    let mut pages = 0u64;

    while !job.is_aborted() {
        let read = tokio::time::timeout(timeout, inner.store.scan(&job.filter, after.as_ref(), page_size))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)));
        let page = match read {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(err = %e, pages, "page read failed");
                job.abort(AbortReason::StoreUnavailable {
                    message: e.to_string(),
                });
                break;
            }
        };
        if page.is_empty() {
            break;
        }
        let exhausted = page.len() < page_size;
        after = page.last().map(|r| r.id.clone());
        pages += 1;
        if tx.send_async(page).await.is_err() {
            break;
        }
        if exhausted {
            break;
        }
    }
    tracing::debug!(pages, "scan finished");
}

async fn process_record(
    inner: &CoordinatorInner,
    job: &Job,
    mapping: &AttributeMapping,
    record: Record,
) {
    let counters = &job.counters;
    counters.scanned.fetch_add(1, Ordering::SeqCst);

    if record.version == job.to {
        counters.skipped.fetch_add(1, Ordering::SeqCst);
        check_failure_ratio(inner, job);
        return;
    }

    let mut migrated = remap_forward(&record, mapping);
    migrated.version = job.to.clone();

    let store = &inner.store;
    let timeout = inner.config.operation_timeout;
    let expected = &job.from;
    let target = &migrated;
    let Retried { result, attempts } = retry(
        inner.config.write_backoff,
        inner.config.write_attempts,
        |e: &StoreError| !matches!(e, StoreError::NotFound(_)),
        move |_| async move {
            tokio::time::timeout(timeout, store.update_if_version(target, expected))
                .await
                .unwrap_or(Err(StoreError::Timeout(timeout)))
        },
    )
    .await;

    match result {
        Ok(UpdateOutcome::Applied) => {
            counters.migrated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(UpdateOutcome::VersionConflict) | Err(StoreError::NotFound(_)) => {
            tracing::debug!(record_id = %record.id, "record changed underneath migration, skipping");
            counters.skipped.fetch_add(1, Ordering::SeqCst);
        }
        Err(source) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            let err = RecordWriteError {
                id: record.id.clone(),
                attempts,
                source,
            };
            tracing::warn!(err = %err, "record counted as failed");
            if err.source.is_unavailable() {
                job.abort(AbortReason::StoreUnavailable {
                    message: err.source.to_string(),
                });
            }
        }
    }
    check_failure_ratio(inner, job);
}

/// Abort early once enough records have been scanned to trust the ratio.
fn check_failure_ratio(inner: &CoordinatorInner, job: &Job) {
    check_failure_ratio_from(inner, job, inner.config.failure_ratio_min_scanned);
}

fn check_failure_ratio_from(inner: &CoordinatorInner, job: &Job, min_scanned: u64) {
    let scanned = job.counters.scanned.load(Ordering::SeqCst);
    let failed = job.counters.failed.load(Ordering::SeqCst);
    let threshold = inner.config.failure_ratio_threshold;
    if failed == 0 || scanned < min_scanned {
        return;
    }
    if failed as f64 / scanned as f64 > threshold {
        job.abort(AbortReason::FailureRatioExceeded {
            failed,
            scanned,
            threshold,
        });
    }
}

fn finish(inner: &CoordinatorInner, job: &Job) {
    // The final ratio applies to jobs of any size.
    if !job.is_aborted() {
        check_failure_ratio_from(inner, job, 0);
    }
    let progress = job.counters.snapshot();
    let reason = job.reason.lock().clone();
    let state = if reason.is_some() {
        JobState::Failed
    } else {
        JobState::Completed
    };
    *job.finished_at.lock() = Some(Utc::now());

    let elapsed_ms = job.elapsed().as_millis() as u64;
    match &reason {
        None => tracing::info!(
            scanned = progress.scanned,
            migrated = progress.migrated,
            skipped = progress.skipped,
            failed = progress.failed,
            elapsed_ms,
            "migration completed"
        ),
        Some(reason) => tracing::error!(
            scanned = progress.scanned,
            migrated = progress.migrated,
            skipped = progress.skipped,
            failed = progress.failed,
            elapsed_ms,
            %reason,
            "migration failed"
        ),
    }

    audit::emit(
        &inner.audit,
        AuditEvent::MigrationFinished {
            job_id: job.id,
            from: job.from.clone(),
            to: job.to.clone(),
            state,
            scanned: progress.scanned,
            migrated: progress.migrated,
            skipped: progress.skipped,
            failed: progress.failed,
            reason,
            at: Utc::now(),
        },
    );
    job.state.send_replace(state);
    evict_finished(inner);
}

/// Keep at most `retained_jobs` finished jobs, dropping the oldest.
fn evict_finished(inner: &CoordinatorInner) {
    let mut jobs = inner.jobs.write();
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|job| job.state.borrow().is_terminal())
        .filter_map(|job| job.finished_at.lock().map(|at| (at, job.id)))
        .collect();
    if finished.len() <= inner.config.retained_jobs {
        return;
    }
    finished.sort();
    let excess = finished.len() - inner.config.retained_jobs;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
        tracing::debug!(job_id = %id, "finished job evicted");
    }
}
