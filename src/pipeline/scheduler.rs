//! Job-level scheduling of sheet pipelines.
//!
//! Sequential mode walks the enabled sheets in declared order. Parallel mode
//! dispatches parallel-eligible sheets to a bounded pool and runs the rest
//! in order afterwards. Sheets never share transactions: a failure in one
//! can not roll back another.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use super::phases::{SheetOutcome, SheetPipeline};
use crate::config::{MigrationConfig, SheetTypeConfig};
use crate::progress::{JobStatus, ProgressStore, SheetStatus};

/// Aggregated result of one job run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub total_sheets: usize,
    pub success_sheets: usize,
    pub failed_sheets: usize,
    pub sum_ingested: i64,
    pub sum_valid: i64,
    pub sum_errors: i64,
    pub sum_inserted: i64,
    pub per_sheet: Vec<SheetOutcome>,
}

pub struct SheetScheduler {
    config: Arc<MigrationConfig>,
    pipeline: Arc<SheetPipeline>,
    progress: ProgressStore,
}

impl SheetScheduler {
    pub fn new(
        config: Arc<MigrationConfig>,
        pipeline: Arc<SheetPipeline>,
        progress: ProgressStore,
    ) -> Self {
        Self {
            config,
            pipeline,
            progress,
        }
    }

    pub async fn run_job(
        &self,
        job_id: &str,
        workbook_path: PathBuf,
        cancel: watch::Receiver<bool>,
        shutdown: watch::Receiver<bool>,
    ) -> JobSummary {
        let sheets: Vec<SheetTypeConfig> = self
            .config
            .enabled_sheets()
            .into_iter()
            .cloned()
            .collect();

        if let Err(e) = self.progress.set_job_status(job_id, JobStatus::Started).await {
            warn!(job_id, %e, "could not mark job started");
        }

        let mut outcomes = Vec::with_capacity(sheets.len());
        if self.config.pipeline.use_parallel_sheet_processing {
            let (pooled, solo): (Vec<_>, Vec<_>) =
                sheets.into_iter().partition(|s| s.parallel);
            let mut parallel_outcomes = self
                .run_parallel(job_id, &workbook_path, pooled, &cancel, &shutdown)
                .await;
            outcomes.append(&mut parallel_outcomes);
            let mut solo_outcomes = self
                .run_sequential(job_id, &workbook_path, solo, &cancel, &shutdown)
                .await;
            outcomes.append(&mut solo_outcomes);
        } else {
            outcomes = self
                .run_sequential(job_id, &workbook_path, sheets, &cancel, &shutdown)
                .await;
        }

        let summary = self.summarize(job_id, outcomes, &cancel);
        if let Err(e) = self.progress.set_job_status(job_id, summary.status).await {
            warn!(job_id, %e, "could not record job status");
        }
        info!(
            job_id,
            status = summary.status.as_str(),
            success = summary.success_sheets,
            failed = summary.failed_sheets,
            "job finished"
        );
        summary
    }

    async fn run_sequential(
        &self,
        job_id: &str,
        workbook_path: &PathBuf,
        sheets: Vec<SheetTypeConfig>,
        cancel: &watch::Receiver<bool>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<SheetOutcome> {
        let mut outcomes = Vec::with_capacity(sheets.len());
        let mut stop = false;
        for sheet in sheets {
            if stop {
                // Policy said stop: the sheet stays PENDING in the progress
                // store but is still accounted for in the summary.
                outcomes.push(skipped_outcome(&sheet.name));
                continue;
            }
            if *shutdown.borrow() {
                self.mark_failed(job_id, &sheet.name, "shutdown requested").await;
                outcomes.push(failed_outcome(&sheet.name, "shutdown requested"));
                continue;
            }
            if *cancel.borrow() {
                outcomes.push(self.mark_cancelled(job_id, &sheet.name).await);
                continue;
            }
            let outcome = self
                .run_one(job_id, workbook_path.clone(), sheet, cancel.clone())
                .await;
            if outcome.status == SheetStatus::Failed
                && !self.config.pipeline.continue_on_sheet_failure
            {
                stop = true;
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_parallel(
        &self,
        job_id: &str,
        workbook_path: &PathBuf,
        sheets: Vec<SheetTypeConfig>,
        cancel: &watch::Receiver<bool>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<SheetOutcome> {
        let limit = self.config.pipeline.max_concurrent_sheets.max(1);
        let slots = Arc::new(Semaphore::new(limit));
        let grace = Duration::from_millis(self.config.jobs.shutdown_grace_ms);

        let mut handles = Vec::with_capacity(sheets.len());
        for sheet in sheets {
            if *shutdown.borrow() {
                self.mark_failed(job_id, &sheet.name, "shutdown requested").await;
                handles.push(Err(failed_outcome(&sheet.name, "shutdown requested")));
                continue;
            }
            if *cancel.borrow() {
                let outcome = self.mark_cancelled(job_id, &sheet.name).await;
                handles.push(Err(outcome));
                continue;
            }
            let slots = slots.clone();
            let pipeline = self.pipeline.clone();
            let progress = self.progress.clone();
            let job_id = job_id.to_string();
            let path = workbook_path.clone();
            let cancel = cancel.clone();
            let timeout = Duration::from_millis(self.config.pipeline.sheet_timeout_ms);
            let sheet_name = sheet.name.clone();
            let join = tokio::spawn(async move {
                let _permit = slots.acquire_owned().await;
                run_with_timeout(pipeline, progress, &job_id, sheet, path, cancel, timeout).await
            });
            handles.push(Ok((sheet_name, join)));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle {
                Ok((sheet_name, mut join)) => {
                    let abort = join.abort_handle();
                    // Wait for the worker; once shutdown fires, in-flight
                    // sheets get the grace period and are then aborted.
                    let joined = tokio::select! {
                        result = &mut join => Some(result),
                        _ = shutdown_signal(shutdown.clone()) => {
                            match tokio::time::timeout(grace, &mut join).await {
                                Ok(result) => Some(result),
                                Err(_) => {
                                    abort.abort();
                                    None
                                }
                            }
                        }
                    };
                    match joined {
                        Some(Ok(outcome)) => outcomes.push(outcome),
                        Some(Err(join_err)) => {
                            // A panicked sheet worker fails only that sheet.
                            warn!(job_id, sheet = %sheet_name, %join_err, "sheet worker panicked");
                            self.mark_failed(job_id, &sheet_name, "sheet worker panicked")
                                .await;
                            outcomes.push(failed_outcome(&sheet_name, "sheet worker panicked"));
                        }
                        None => {
                            // Grace expired: force-terminated.
                            self.mark_failed(job_id, &sheet_name, "shutdown requested")
                                .await;
                            outcomes.push(failed_outcome(&sheet_name, "shutdown requested"));
                        }
                    }
                }
                Err(outcome) => outcomes.push(outcome),
            }
        }
        outcomes
    }

    async fn run_one(
        &self,
        job_id: &str,
        workbook_path: PathBuf,
        sheet: SheetTypeConfig,
        cancel: watch::Receiver<bool>,
    ) -> SheetOutcome {
        let timeout = Duration::from_millis(self.config.pipeline.sheet_timeout_ms);
        run_with_timeout(
            self.pipeline.clone(),
            self.progress.clone(),
            job_id,
            sheet,
            workbook_path,
            cancel,
            timeout,
        )
        .await
    }

    async fn mark_failed(&self, job_id: &str, sheet_name: &str, message: &str) {
        if let Err(e) = self
            .progress
            .set_status(job_id, sheet_name, SheetStatus::Failed, Some(message))
            .await
        {
            warn!(job_id, sheet = sheet_name, %e, "could not mark sheet failed");
        }
    }

    /// A sheet that never started because the job was cancelled first.
    async fn mark_cancelled(&self, job_id: &str, sheet_name: &str) -> SheetOutcome {
        if let Err(e) = self
            .progress
            .set_status(
                job_id,
                sheet_name,
                SheetStatus::Cancelled,
                Some("cancelled before start"),
            )
            .await
        {
            warn!(job_id, sheet = sheet_name, %e, "could not mark sheet cancelled");
        }
        SheetOutcome {
            sheet_name: sheet_name.to_string(),
            status: SheetStatus::Cancelled,
            counters: Default::default(),
            error_message: Some("cancelled before start".to_string()),
        }
    }

    fn summarize(
        &self,
        job_id: &str,
        outcomes: Vec<SheetOutcome>,
        cancel: &watch::Receiver<bool>,
    ) -> JobSummary {
        let mut summary = JobSummary {
            job_id: job_id.to_string(),
            status: JobStatus::Completed,
            total_sheets: outcomes.len(),
            success_sheets: 0,
            failed_sheets: 0,
            sum_ingested: 0,
            sum_valid: 0,
            sum_errors: 0,
            sum_inserted: 0,
            per_sheet: Vec::new(),
        };
        let mut any_cancelled = false;
        for outcome in &outcomes {
            summary.sum_ingested += outcome.counters.ingested_rows;
            summary.sum_valid += outcome.counters.valid_rows;
            summary.sum_errors += outcome.counters.error_rows;
            summary.sum_inserted += outcome.counters.inserted_rows;
            match outcome.status {
                SheetStatus::Completed => summary.success_sheets += 1,
                SheetStatus::Cancelled => {
                    any_cancelled = true;
                    summary.failed_sheets += 1;
                }
                // Never started (stop-on-failure skip): neither bucket.
                SheetStatus::Pending => {}
                _ => summary.failed_sheets += 1,
            }
        }

        summary.status = if any_cancelled || *cancel.borrow() {
            JobStatus::Cancelled
        } else if summary.failed_sheets == 0 {
            JobStatus::Completed
        } else if self.config.pipeline.continue_on_sheet_failure {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Failed
        };
        summary.per_sheet = outcomes;
        summary
    }
}

/// Run one sheet under the per-sheet timeout. On expiry the pipeline future
/// is dropped (its in-flight batch transaction rolls back) and the sheet is
/// marked FAILED with a timeout message.
async fn run_with_timeout(
    pipeline: Arc<SheetPipeline>,
    progress: ProgressStore,
    job_id: &str,
    sheet: SheetTypeConfig,
    workbook_path: PathBuf,
    cancel: watch::Receiver<bool>,
    timeout: Duration,
) -> SheetOutcome {
    match tokio::time::timeout(
        timeout,
        pipeline.run(job_id, &sheet, &workbook_path, cancel),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            let message = format!("sheet timed out after {} ms", timeout.as_millis());
            if let Err(e) = progress
                .set_status(job_id, &sheet.name, SheetStatus::Failed, Some(&message))
                .await
            {
                warn!(job_id, sheet = %sheet.name, %e, "could not mark timed-out sheet");
            }
            let counters = progress
                .get_sheet(job_id, &sheet.name)
                .await
                .ok()
                .flatten()
                .map(|p| p.counters)
                .unwrap_or_default();
            SheetOutcome {
                sheet_name: sheet.name.clone(),
                status: SheetStatus::Failed,
                counters,
                error_message: Some(message),
            }
        }
    }
}

/// Resolves once shutdown is requested; pends forever if the sender is
/// gone (no shutdown will ever arrive).
async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn failed_outcome(sheet_name: &str, message: &str) -> SheetOutcome {
    SheetOutcome {
        sheet_name: sheet_name.to_string(),
        status: SheetStatus::Failed,
        counters: Default::default(),
        error_message: Some(message.to_string()),
    }
}

fn skipped_outcome(sheet_name: &str) -> SheetOutcome {
    SheetOutcome {
        sheet_name: sheet_name.to_string(),
        status: SheetStatus::Pending,
        counters: Default::default(),
        error_message: Some(
            "skipped: earlier sheet failed and continue_on_sheet_failure is false".to_string(),
        ),
    }
}
