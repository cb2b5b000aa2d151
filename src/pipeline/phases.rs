//! Per-sheet phase orchestration: INGEST -> VALIDATE -> INSERT.
//!
//! Each phase runs to completion before the next starts, commits per batch,
//! and is retried with exponential backoff on transient faults. Cancellation
//! is cooperative and checked at batch boundaries: a cancelled phase commits
//! the batch in flight and stops, so counters always land on a batch
//! boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use workbook_stream::XlsxWorkbook;

use crate::config::{MigrationConfig, SheetTypeConfig};
use crate::error::MigrationError;
use crate::mapping::RowMapper;
use crate::master::MasterWriterRegistry;
use crate::progress::{CounterUpdate, ProgressStore, SheetCounters, SheetStatus};
use crate::staging::StagingStore;
use crate::validation::{JobValidationContext, ValidationEngine};

/// Result of one sheet's pipeline run, aggregated by the scheduler.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SheetOutcome {
    pub sheet_name: String,
    pub status: SheetStatus,
    pub counters: SheetCounters,
    pub error_message: Option<String>,
}

pub struct SheetPipeline {
    config: Arc<MigrationConfig>,
    staging: StagingStore,
    progress: ProgressStore,
    writers: MasterWriterRegistry,
}

impl SheetPipeline {
    pub fn new(
        config: Arc<MigrationConfig>,
        staging: StagingStore,
        progress: ProgressStore,
        writers: MasterWriterRegistry,
    ) -> Self {
        Self {
            config,
            staging,
            progress,
            writers,
        }
    }

    /// Run all phases for one (job, sheet). Never propagates phase faults:
    /// the returned outcome carries the terminal status and the progress
    /// store is updated on the way.
    pub async fn run(
        &self,
        job_id: &str,
        sheet: &SheetTypeConfig,
        workbook_path: &Path,
        cancel: watch::Receiver<bool>,
    ) -> SheetOutcome {
        let result = self.run_phases(job_id, sheet, workbook_path, &cancel).await;

        let (status, message) = match result {
            Ok(status) => (status, None),
            Err(MigrationError::Cancelled) => {
                (SheetStatus::Cancelled, Some("cancelled by request".to_string()))
            }
            Err(e) => (SheetStatus::Failed, Some(e.to_string())),
        };

        // The success path already wrote COMPLETED; only failures and
        // cancellations still need their terminal status recorded.
        if let Some(msg) = &message {
            warn!(job_id, sheet = %sheet.name, status = status.as_str(), msg = %msg, "sheet finished");
            if let Err(e) = self
                .progress
                .set_status(job_id, &sheet.name, status, Some(msg.as_str()))
                .await
            {
                // A conflict means the status landed through another path
                // (e.g. the failure happened after the terminal write).
                if !matches!(e, MigrationError::Conflict(_)) {
                    error!(job_id, sheet = %sheet.name, %e, "failed to record terminal status");
                }
            }
        }

        let counters = self
            .progress
            .get_sheet(job_id, &sheet.name)
            .await
            .ok()
            .flatten()
            .map(|p| p.counters)
            .unwrap_or_default();

        SheetOutcome {
            sheet_name: sheet.name.clone(),
            status,
            counters,
            error_message: message,
        }
    }

    async fn run_phases(
        &self,
        job_id: &str,
        sheet: &SheetTypeConfig,
        workbook_path: &Path,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SheetStatus, MigrationError> {
        let pipeline_cfg = &self.config.pipeline;

        self.progress
            .set_status(job_id, &sheet.name, SheetStatus::Ingesting, None)
            .await?;
        let path = workbook_path.to_path_buf();
        self.retrying_phase("ingest", pipeline_cfg.ingest_timeout_ms, || {
            self.ingest(job_id, sheet, path.clone(), cancel.clone())
        })
        .await?;

        self.progress
            .set_status(job_id, &sheet.name, SheetStatus::Validating, None)
            .await?;
        let valid_rows = self
            .retrying_phase("validate", pipeline_cfg.validation_timeout_ms, || {
                self.validate(job_id, sheet, cancel.clone())
            })
            .await?;

        if valid_rows == 0 {
            // Nothing insertable; the sheet is done.
            self.progress
                .set_status(job_id, &sheet.name, SheetStatus::Completed, None)
                .await?;
            self.progress
                .set_counters(job_id, &sheet.name, CounterUpdate::default())
                .await?;
            return Ok(SheetStatus::Completed);
        }

        self.progress
            .set_status(job_id, &sheet.name, SheetStatus::Inserting, None)
            .await?;
        self.retrying_phase("insert", pipeline_cfg.insert_timeout_ms, || {
            self.insert(job_id, sheet, cancel.clone())
        })
        .await?;

        self.progress
            .set_status(job_id, &sheet.name, SheetStatus::Completed, None)
            .await?;
        self.progress
            .set_counters(job_id, &sheet.name, CounterUpdate::default())
            .await?;
        Ok(SheetStatus::Completed)
    }

    /// Wrap one phase attempt in a timeout and retry transient faults with
    /// exponential backoff. Cancellation and permanent faults pass straight
    /// through.
    async fn retrying_phase<T, F, Fut>(
        &self,
        phase: &str,
        timeout_ms: u64,
        mut attempt: F,
    ) -> Result<T, MigrationError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, MigrationError>>,
    {
        let max_attempts = self.config.pipeline.retry_max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.pipeline.retry_backoff_ms);

        for attempt_no in 1..=max_attempts {
            let outcome =
                match tokio::time::timeout(Duration::from_millis(timeout_ms), attempt()).await {
                    Ok(result) => result,
                    Err(_) => Err(MigrationError::Timeout(timeout_ms)),
                };
            match outcome {
                Ok(value) => return Ok(value),
                Err(MigrationError::Cancelled) => return Err(MigrationError::Cancelled),
                Err(e) if e.is_transient() && attempt_no < max_attempts => {
                    warn!(
                        phase,
                        attempt = attempt_no,
                        backoff_ms = backoff.as_millis() as u64,
                        %e,
                        "transient phase fault, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// INGEST: stream the sheet, map and normalize rows, append raw batches.
    ///
    /// The zip/XML work runs on a blocking thread producing batches into a
    /// bounded channel; this side consumes them synchronously into staging.
    /// Memory stays O(batch) and dropping the receiver stops the producer.
    async fn ingest(
        &self,
        job_id: &str,
        sheet: &SheetTypeConfig,
        workbook_path: PathBuf,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), MigrationError> {
        let batch_size = sheet.effective_batch_size(&self.config.pipeline);

        let total_rows = {
            let path = workbook_path.clone();
            let sheet_name = sheet.name.clone();
            tokio::task::spawn_blocking(move || -> Result<u64, MigrationError> {
                let mut workbook = XlsxWorkbook::open(&path)?;
                Ok(workbook.sheet_dimension(&sheet_name)?.data_rows)
            })
            .await
            .map_err(|e| MigrationError::Internal(anyhow::anyhow!("reader panicked: {e}")))??
        };
        self.progress
            .set_counters(
                job_id,
                &sheet.name,
                CounterUpdate {
                    total_rows: Some(total_rows as i64),
                    ..Default::default()
                },
            )
            .await?;

        let (batch_tx, mut batch_rx) =
            tokio::sync::mpsc::channel::<Result<Vec<crate::mapping::RawRecord>, MigrationError>>(2);
        let reader_job = job_id.to_string();
        let reader_sheet = sheet.clone();
        let reader_path = workbook_path.clone();
        tokio::task::spawn_blocking(move || {
            let produce = || -> Result<(), MigrationError> {
                let mut workbook = XlsxWorkbook::open(&reader_path)?;
                let mut rows = workbook.rows(&reader_sheet.name)?;
                let header_row = match rows.next_row()? {
                    Some((_, headers)) => headers,
                    None => Vec::new(),
                };
                let mapper = RowMapper::from_header_row(&reader_sheet, &header_row);
                if !mapper.missing_headers().is_empty() {
                    warn!(
                        job_id = %reader_job,
                        sheet = %reader_sheet.name,
                        missing = ?mapper.missing_headers(),
                        "header row is missing mapped labels"
                    );
                }
                loop {
                    let mut batch = Vec::with_capacity(batch_size);
                    while batch.len() < batch_size {
                        match rows.next_row()? {
                            Some((idx, cells)) => {
                                batch.push(mapper.map_row(&reader_job, idx as i64, &cells));
                            }
                            None => break,
                        }
                    }
                    if batch.is_empty() {
                        break;
                    }
                    if batch_tx.blocking_send(Ok(batch)).is_err() {
                        // Consumer gone: cancellation or failure downstream.
                        break;
                    }
                }
                Ok(())
            };
            if let Err(e) = produce() {
                let _ = batch_tx.blocking_send(Err(e));
            }
        });

        let mut ingested: i64 = 0;
        while let Some(message) = batch_rx.recv().await {
            let batch = message?;

            let mut tx = self.staging.pool().begin().await?;
            self.staging.append_raw(&mut *tx, sheet, &batch).await?;
            tx.commit().await?;

            ingested += batch.len() as i64;
            self.progress
                .set_counters(
                    job_id,
                    &sheet.name,
                    CounterUpdate {
                        ingested_rows: Some(ingested),
                        ..Default::default()
                    },
                )
                .await?;

            if *cancel.borrow() {
                return Err(MigrationError::Cancelled);
            }
        }

        info!(job_id, sheet = %sheet.name, rows = ingested, "ingest complete");
        Ok(())
    }

    /// VALIDATE: read raw batches back, partition into valid and error.
    /// Returns the number of valid rows.
    async fn validate(
        &self,
        job_id: &str,
        sheet: &SheetTypeConfig,
        cancel: watch::Receiver<bool>,
    ) -> Result<i64, MigrationError> {
        let batch_size = sheet.effective_batch_size(&self.config.pipeline) as i64;
        let engine = ValidationEngine::for_sheet(&self.config, sheet)?;
        let mut ctx = JobValidationContext::new();

        let mut cursor: i64 = 0;
        let mut valid_total: i64 = 0;
        let mut error_total: i64 = 0;

        loop {
            let batch = self
                .staging
                .read_raw(sheet, job_id, cursor, batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().map(|r| r.row_number).unwrap_or(cursor);

            // One grouped lookup per db-backed rule per batch.
            for spec in engine.lookup_specs(&batch) {
                let existing = self
                    .staging
                    .existing_keys(&spec.table, &spec.key, &spec.keys)
                    .await?;
                ctx.set_existing(&spec.rule_id, existing);
            }

            let outcomes = engine.validate_batch(&batch, &mut ctx);
            let mut valid_rows = Vec::new();
            let mut error_rows = Vec::new();
            for (record, outcome) in batch.into_iter().zip(outcomes) {
                if outcome.is_valid() {
                    valid_rows.push(record);
                } else {
                    error_rows.push((record, outcome.errors));
                }
            }

            let mut tx = self.staging.pool().begin().await?;
            self.staging.move_to_valid(&mut *tx, sheet, &valid_rows).await?;
            self.staging.move_to_error(&mut *tx, sheet, &error_rows).await?;
            tx.commit().await?;

            // Count the partition, not rows_affected: a retried phase
            // re-scans rows whose copies already landed (conflict, no-op)
            // and must still account for them.
            valid_total += valid_rows.len() as i64;
            error_total += error_rows.len() as i64;

            self.progress
                .set_counters(
                    job_id,
                    &sheet.name,
                    CounterUpdate {
                        valid_rows: Some(valid_total),
                        error_rows: Some(error_total),
                        ..Default::default()
                    },
                )
                .await?;

            if *cancel.borrow() {
                return Err(MigrationError::Cancelled);
            }
        }

        info!(
            job_id,
            sheet = %sheet.name,
            valid = valid_total,
            errors = error_total,
            "validation complete"
        );
        Ok(valid_total)
    }

    /// INSERT: read valid batches and hand them to the sheet's master
    /// writer. The writer upserts by business key, so retries re-cover
    /// already-written rows instead of duplicating them.
    async fn insert(
        &self,
        job_id: &str,
        sheet: &SheetTypeConfig,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), MigrationError> {
        let batch_size = sheet.effective_batch_size(&self.config.pipeline) as i64;
        let writer = self.writers.writer_for(&sheet.name);

        let mut cursor: i64 = 0;
        let mut inserted: i64 = 0;
        loop {
            let batch = self
                .staging
                .read_valid(sheet, job_id, cursor, batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().map(|r| r.row_number).unwrap_or(cursor);

            inserted += writer
                .write_batch(self.staging.pool(), sheet, &batch)
                .await? as i64;
            self.progress
                .set_counters(
                    job_id,
                    &sheet.name,
                    CounterUpdate {
                        inserted_rows: Some(inserted),
                        ..Default::default()
                    },
                )
                .await?;

            if *cancel.borrow() {
                return Err(MigrationError::Cancelled);
            }
        }

        info!(job_id, sheet = %sheet.name, rows = inserted, "insert complete");
        Ok(())
    }
}
