//! Async job manager: submission, bounded execution, cancellation.
//!
//! Submissions run pre-save validation, persist the workbook and enqueue the
//! job onto a bounded worker pool. The manager owns the map from job id to
//! in-flight task; callers poll the progress store, never the task handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{error, info, warn};

use super::circuit::CircuitBreaker;
use super::job_id::next_job_id;
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::pipeline::SheetScheduler;
use crate::progress::{JobStatus, ProgressStore, SheetStatus};
use crate::upload::{validate_workbook, ValidationReport};

struct RunningJob {
    cancel: watch::Sender<bool>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemInfo {
    pub running_jobs: usize,
    pub pool_size: usize,
    pub queue_depth: usize,
    pub circuit_open: bool,
}

/// Result of a submission attempt that did not error.
pub enum SubmitOutcome {
    /// Job accepted; `done` flips to true when the run finishes.
    Accepted {
        job_id: String,
        done: watch::Receiver<bool>,
    },
    /// Pre-save validation failed; nothing was persisted.
    Rejected(ValidationReport),
    /// The requested job id already finished; idempotent replay.
    AlreadyTerminal { job_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyTerminal,
}

pub struct JobManager {
    config: Arc<MigrationConfig>,
    pool: sqlx::PgPool,
    progress: ProgressStore,
    scheduler: Arc<SheetScheduler>,
    running: Arc<Mutex<HashMap<String, RunningJob>>>,
    slots: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    circuit: CircuitBreaker,
    shutdown: watch::Receiver<bool>,
}

impl JobManager {
    pub fn new(
        config: Arc<MigrationConfig>,
        pool: sqlx::PgPool,
        progress: ProgressStore,
        scheduler: Arc<SheetScheduler>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let jobs = &config.jobs;
        let slots = Arc::new(Semaphore::new(jobs.max_pool_size.max(1)));
        let circuit = CircuitBreaker::new(
            jobs.circuit_failure_threshold,
            Duration::from_millis(jobs.circuit_cooldown_ms),
        );
        Self {
            config,
            pool,
            progress,
            scheduler,
            running: Arc::new(Mutex::new(HashMap::new())),
            slots,
            queued: Arc::new(AtomicUsize::new(0)),
            circuit,
            shutdown,
        }
    }

    /// Submit a workbook. Validates, persists, creates the job and progress
    /// rows, and enqueues the run. Idempotent on a client-supplied job id.
    pub async fn submit(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        requested_job_id: Option<String>,
    ) -> Result<SubmitOutcome, MigrationError> {
        if *self.shutdown.borrow() {
            return Err(MigrationError::ShuttingDown);
        }
        self.circuit.check()?;

        // Idempotency on the submitted id: exactly one accepted job.
        if let Some(job_id) = &requested_job_id {
            if let Some(job) = self.progress.get_job(job_id).await? {
                if job.status.is_terminal() {
                    return Ok(SubmitOutcome::AlreadyTerminal {
                        job_id: job_id.clone(),
                    });
                }
                return Err(MigrationError::Conflict(format!(
                    "job {job_id} is already {}",
                    job.status.as_str()
                )));
            }
        }

        if self.slots.available_permits() == 0
            && self.queued.load(Ordering::SeqCst) >= self.config.jobs.queue_capacity
        {
            return Err(MigrationError::PoolExhausted(format!(
                "queue is full ({} waiting)",
                self.config.jobs.queue_capacity
            )));
        }

        // Pre-save validation is pure CPU + decompression; keep it off the
        // runtime threads.
        let config = self.config.clone();
        let name = file_name.to_string();
        let (report, bytes) = tokio::task::spawn_blocking(move || {
            let report = validate_workbook(&config, &name, &bytes);
            (report, bytes)
        })
        .await
        .map_err(|e| MigrationError::Internal(anyhow::anyhow!("validator panicked: {e}")))?;
        if !report.ok {
            info!(file = file_name, errors = report.errors.len(), "upload rejected at pre-save");
            return Ok(SubmitOutcome::Rejected(report));
        }

        match self.enqueue(file_name, bytes, requested_job_id).await {
            Ok(outcome) => {
                self.circuit.record_success();
                Ok(outcome)
            }
            Err(e) => {
                // Infrastructure faults feed the breaker; client conflicts
                // do not.
                if e.http_status() >= 500 {
                    self.circuit.record_failure();
                }
                Err(e)
            }
        }
    }

    async fn enqueue(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        requested_job_id: Option<String>,
    ) -> Result<SubmitOutcome, MigrationError> {
        let job_id = match requested_job_id {
            Some(id) => id,
            None => next_job_id(&self.pool).await?,
        };

        let upload_dir = PathBuf::from(&self.config.upload.dir);
        tokio::fs::create_dir_all(&upload_dir).await?;
        let extension = file_name.rsplit('.').next().unwrap_or("xlsx");
        let path = upload_dir.join(format!("{job_id}.{extension}"));
        tokio::fs::write(&path, &bytes).await?;

        if let Err(e) = self
            .progress
            .create_job(&job_id, &path.to_string_lossy())
            .await
        {
            // A concurrent submission with the same id won the insert.
            let _ = tokio::fs::remove_file(&path).await;
            if let MigrationError::Database(sqlx::Error::Database(db)) = &e {
                if db.code().as_deref() == Some("23505") {
                    return Err(MigrationError::Conflict(format!(
                        "job {job_id} already submitted"
                    )));
                }
            }
            return Err(e);
        }
        let sheets: Vec<(String, i32)> = self
            .config
            .enabled_sheets()
            .iter()
            .map(|s| (s.name.clone(), s.order as i32))
            .collect();
        self.progress.init(&job_id, &sheets).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.running
            .lock()
            .await
            .insert(job_id.clone(), RunningJob { cancel: cancel_tx });

        self.queued.fetch_add(1, Ordering::SeqCst);
        let slots = self.slots.clone();
        let queued = self.queued.clone();
        let running = self.running.clone();
        let scheduler = self.scheduler.clone();
        let progress = self.progress.clone();
        let shutdown = self.shutdown.clone();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            let permit = slots.acquire_owned().await;
            queued.fetch_sub(1, Ordering::SeqCst);
            match permit {
                Ok(_permit) => {
                    scheduler
                        .run_job(&worker_job_id, path, cancel_rx, shutdown)
                        .await;
                }
                Err(e) => {
                    error!(job_id = %worker_job_id, %e, "worker pool closed");
                    if let Err(e) = progress
                        .set_job_status(&worker_job_id, JobStatus::Failed)
                        .await
                    {
                        error!(job_id = %worker_job_id, %e, "could not fail orphaned job");
                    }
                }
            }
            running.lock().await.remove(&worker_job_id);
            let _ = done_tx.send(true);
        });

        info!(job_id = %job_id, "job submitted");
        Ok(SubmitOutcome::Accepted { job_id, done: done_rx })
    }

    /// Cooperative cancel: the running phase finishes its current batch,
    /// then the sheet transitions to CANCELLED. Completed sheets keep their
    /// rows.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, MigrationError> {
        {
            let running = self.running.lock().await;
            if let Some(job) = running.get(job_id) {
                let _ = job.cancel.send(true);
                info!(job_id, "cancellation requested");
                return Ok(CancelOutcome::Cancelled);
            }
        }

        match self.progress.get_job(job_id).await? {
            None => Ok(CancelOutcome::NotFound),
            Some(job) if job.status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            Some(_) => {
                // Known but not running (e.g. process restarted mid-job):
                // close it out directly.
                warn!(job_id, "cancelling job with no live worker");
                for sheet in self.progress.list_sheets(job_id).await? {
                    if !sheet.status.is_terminal() {
                        self.progress
                            .set_status(
                                job_id,
                                &sheet.sheet_name,
                                SheetStatus::Cancelled,
                                Some("cancelled by request"),
                            )
                            .await?;
                    }
                }
                self.progress
                    .set_job_status(job_id, JobStatus::Cancelled)
                    .await?;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    pub async fn system_info(&self) -> SystemInfo {
        SystemInfo {
            running_jobs: self.running.lock().await.len(),
            pool_size: self.config.jobs.max_pool_size,
            queue_depth: self.queued.load(Ordering::SeqCst),
            circuit_open: self.circuit.is_open(),
        }
    }
}
