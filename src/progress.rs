//! Job and sheet progress persistence.
//!
//! One row per (job_id, sheet_name); every phase boundary writes here and
//! polling readers issue a single SELECT. Status transitions are monotonic:
//! the writer checks the state machine and the UPDATE is guarded by the
//! expected current status, so an observer never sees a regression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::MigrationError;

/// Per-sheet lifecycle. Terminals: Completed, Failed, Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SheetStatus {
    Pending,
    Ingesting,
    Validating,
    Inserting,
    Completed,
    Failed,
    Cancelled,
}

impl SheetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ingesting => "INGESTING",
            Self::Validating => "VALIDATING",
            Self::Inserting => "INSERTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Ingesting => 1,
            Self::Validating => 2,
            Self::Inserting => 3,
            Self::Completed | Self::Failed | Self::Cancelled => 4,
        }
    }

    /// Forward-only: any forward jump along the phase chain is legal
    /// (VALIDATING may go straight to COMPLETED when nothing is insertable);
    /// Failed and Cancelled are reachable from every non-terminal state.
    pub fn can_transition_to(&self, to: SheetStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            SheetStatus::Failed | SheetStatus::Cancelled => true,
            SheetStatus::Pending => false,
            _ => to.rank() > self.rank(),
        }
    }
}

impl std::str::FromStr for SheetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "INGESTING" => Ok(Self::Ingesting),
            "VALIDATING" => Ok(Self::Validating),
            "INSERTING" => Ok(Self::Inserting),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown sheet status: {other}")),
        }
    }
}

/// Overall job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Started,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Started)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "STARTED" => Ok(Self::Started),
            "COMPLETED" => Ok(Self::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(Self::CompletedWithErrors),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SheetCounters {
    pub total_rows: i64,
    pub ingested_rows: i64,
    pub valid_rows: i64,
    pub error_rows: i64,
    pub inserted_rows: i64,
}

/// Partial counter update; only the present fields are written.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterUpdate {
    pub total_rows: Option<i64>,
    pub ingested_rows: Option<i64>,
    pub valid_rows: Option<i64>,
    pub error_rows: Option<i64>,
    pub inserted_rows: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetProgress {
    pub job_id: String,
    pub sheet_name: String,
    pub sheet_order: i32,
    pub status: SheetStatus,
    pub current_phase: String,
    pub progress_percent: i32,
    #[serde(flatten)]
    pub counters: SheetCounters,
    pub ingest_started_at: Option<DateTime<Utc>>,
    pub ingest_ended_at: Option<DateTime<Utc>>,
    pub validation_started_at: Option<DateTime<Utc>>,
    pub validation_ended_at: Option<DateTime<Utc>>,
    pub insertion_started_at: Option<DateTime<Utc>>,
    pub insertion_ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub input_path: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate view backing the progress endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job: JobRecord,
    pub total_sheets: i64,
    pub completed_sheets: i64,
    pub failed_sheets: i64,
    pub in_progress_sheets: i64,
    pub pending_sheets: i64,
    pub current_sheet: Option<String>,
    pub overall_percent: i32,
    pub counters: SheetCounters,
    pub sheets: Vec<SheetProgress>,
}

/// Weighted progress: ingest 33%, validation 33%, insertion 34%, each scaled
/// by completion within its own phase.
pub fn weighted_percent(status: SheetStatus, c: &SheetCounters) -> i32 {
    if status == SheetStatus::Completed {
        return 100;
    }
    let fraction = |num: i64, den: i64| -> f64 {
        if den <= 0 {
            0.0
        } else {
            (num as f64 / den as f64).clamp(0.0, 1.0)
        }
    };
    let ingest = if status.rank() >= SheetStatus::Validating.rank() {
        1.0
    } else {
        fraction(c.ingested_rows, c.total_rows)
    };
    let validate = if status.rank() >= SheetStatus::Inserting.rank() {
        1.0
    } else {
        fraction(c.valid_rows + c.error_rows, c.ingested_rows)
    };
    let insert = fraction(c.inserted_rows, c.valid_rows);
    (33.0 * ingest + 33.0 * validate + 34.0 * insert).round() as i32
}

#[derive(Clone)]
pub struct ProgressStore {
    pool: PgPool,
}

impl ProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_job(
        &self,
        job_id: &str,
        input_path: &str,
    ) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            INSERT INTO migration_job (job_id, input_path, status)
            VALUES ($1, $2, 'PENDING')
            "#,
        )
        .bind(job_id)
        .bind(input_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, MigrationError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, input_path, status, created_at, completed_at
            FROM migration_job
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_job_row).transpose()
    }

    pub async fn set_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            UPDATE migration_job
            SET status = $2,
                completed_at = CASE WHEN $3 THEN now() ELSE completed_at END
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create one PENDING progress row per enabled sheet, atomically.
    /// Re-submission of the same job id leaves existing rows untouched.
    pub async fn init(
        &self,
        job_id: &str,
        sheets: &[(String, i32)],
    ) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        for (name, order) in sheets {
            sqlx::query(
                r#"
                INSERT INTO migration_sheet_progress (job_id, sheet_name, sheet_order, status, current_phase)
                VALUES ($1, $2, $3, 'PENDING', 'PENDING')
                ON CONFLICT (job_id, sheet_name) DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(name)
            .bind(order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Transition a sheet's status, stamping the phase timestamps the move
    /// implies. Rejects non-monotonic transitions with a conflict.
    pub async fn set_status(
        &self,
        job_id: &str,
        sheet_name: &str,
        status: SheetStatus,
        error_message: Option<&str>,
    ) -> Result<(), MigrationError> {
        let current = self
            .get_sheet(job_id, sheet_name)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("{job_id}/{sheet_name}")))?;

        if !current.status.can_transition_to(status) {
            return Err(MigrationError::Conflict(format!(
                "illegal status transition {} -> {} for {job_id}/{sheet_name}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        // Timestamp columns this transition stamps (phase starts and ends).
        let stamps: &[&str] = match status {
            SheetStatus::Ingesting => &["ingest_started_at"],
            SheetStatus::Validating => &["ingest_ended_at", "validation_started_at"],
            SheetStatus::Inserting => &["validation_ended_at", "insertion_started_at"],
            SheetStatus::Completed | SheetStatus::Failed | SheetStatus::Cancelled => {
                match current.status {
                    SheetStatus::Ingesting => &["ingest_ended_at"],
                    SheetStatus::Validating => &["validation_ended_at"],
                    SheetStatus::Inserting => &["insertion_ended_at"],
                    _ => &[],
                }
            }
            SheetStatus::Pending => &[],
        };
        let stamp_sql: String = stamps
            .iter()
            .map(|col| format!(", {col} = COALESCE({col}, now())"))
            .collect();

        let result = sqlx::query(&format!(
            r#"
            UPDATE migration_sheet_progress
            SET status = $3,
                current_phase = $3,
                error_message = COALESCE($4, error_message),
                updated_at = now()
                {stamp_sql}
            WHERE job_id = $1 AND sheet_name = $2 AND status = $5
            "#,
        ))
        .bind(job_id)
        .bind(sheet_name)
        .bind(status.as_str())
        .bind(error_message)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MigrationError::Conflict(format!(
                "concurrent status change on {job_id}/{sheet_name}"
            )));
        }
        debug!(job_id, sheet = sheet_name, status = status.as_str(), "sheet status");
        Ok(())
    }

    /// Merge a partial counter update and recompute the weighted percent.
    /// Single writer per sheet, so read-merge-write is race-free.
    pub async fn set_counters(
        &self,
        job_id: &str,
        sheet_name: &str,
        update: CounterUpdate,
    ) -> Result<(), MigrationError> {
        let current = self
            .get_sheet(job_id, sheet_name)
            .await?
            .ok_or_else(|| MigrationError::NotFound(format!("{job_id}/{sheet_name}")))?;

        let merged = SheetCounters {
            total_rows: update.total_rows.unwrap_or(current.counters.total_rows),
            ingested_rows: update
                .ingested_rows
                .unwrap_or(current.counters.ingested_rows),
            valid_rows: update.valid_rows.unwrap_or(current.counters.valid_rows),
            error_rows: update.error_rows.unwrap_or(current.counters.error_rows),
            inserted_rows: update
                .inserted_rows
                .unwrap_or(current.counters.inserted_rows),
        };
        let percent = weighted_percent(current.status, &merged);

        sqlx::query(
            r#"
            UPDATE migration_sheet_progress
            SET total_rows = $3, ingested_rows = $4, valid_rows = $5,
                error_rows = $6, inserted_rows = $7, progress_percent = $8,
                updated_at = now()
            WHERE job_id = $1 AND sheet_name = $2
            "#,
        )
        .bind(job_id)
        .bind(sheet_name)
        .bind(merged.total_rows)
        .bind(merged.ingested_rows)
        .bind(merged.valid_rows)
        .bind(merged.error_rows)
        .bind(merged.inserted_rows)
        .bind(percent)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sheet(
        &self,
        job_id: &str,
        sheet_name: &str,
    ) -> Result<Option<SheetProgress>, MigrationError> {
        let row = sqlx::query(&format!(
            "{SHEET_SELECT} WHERE job_id = $1 AND sheet_name = $2"
        ))
        .bind(job_id)
        .bind(sheet_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_sheet_row).transpose()
    }

    pub async fn list_sheets(&self, job_id: &str) -> Result<Vec<SheetProgress>, MigrationError> {
        let rows = sqlx::query(&format!(
            "{SHEET_SELECT} WHERE job_id = $1 ORDER BY sheet_order"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_sheet_row).collect()
    }

    /// Aggregate snapshot: counter sums, status tallies, first in-progress
    /// sheet as "current".
    pub async fn get_progress(&self, job_id: &str) -> Result<Option<JobProgress>, MigrationError> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(None);
        };
        let sheets = self.list_sheets(job_id).await?;

        let mut counters = SheetCounters::default();
        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut in_progress = 0i64;
        let mut pending = 0i64;
        let mut current_sheet = None;
        let mut percent_sum = 0i64;

        for sheet in &sheets {
            counters.total_rows += sheet.counters.total_rows;
            counters.ingested_rows += sheet.counters.ingested_rows;
            counters.valid_rows += sheet.counters.valid_rows;
            counters.error_rows += sheet.counters.error_rows;
            counters.inserted_rows += sheet.counters.inserted_rows;
            percent_sum += sheet.progress_percent as i64;
            match sheet.status {
                SheetStatus::Completed => completed += 1,
                SheetStatus::Failed | SheetStatus::Cancelled => failed += 1,
                SheetStatus::Pending => pending += 1,
                _ => {
                    in_progress += 1;
                    if current_sheet.is_none() {
                        current_sheet = Some(sheet.sheet_name.clone());
                    }
                }
            }
        }

        let overall_percent = if sheets.is_empty() {
            0
        } else {
            (percent_sum / sheets.len() as i64) as i32
        };

        Ok(Some(JobProgress {
            job,
            total_sheets: sheets.len() as i64,
            completed_sheets: completed,
            failed_sheets: failed,
            in_progress_sheets: in_progress,
            pending_sheets: pending,
            current_sheet,
            overall_percent,
            counters,
            sheets,
        }))
    }
}

const SHEET_SELECT: &str = r#"
    SELECT job_id, sheet_name, sheet_order, status, current_phase,
           progress_percent, total_rows, ingested_rows, valid_rows,
           error_rows, inserted_rows,
           ingest_started_at, ingest_ended_at,
           validation_started_at, validation_ended_at,
           insertion_started_at, insertion_ended_at,
           error_message
    FROM migration_sheet_progress
"#;

fn parse_sheet_row(row: sqlx::postgres::PgRow) -> Result<SheetProgress, MigrationError> {
    let status: String = row.get("status");
    let status: SheetStatus = status
        .parse()
        .map_err(|e: String| MigrationError::Internal(anyhow::anyhow!(e)))?;
    Ok(SheetProgress {
        job_id: row.get("job_id"),
        sheet_name: row.get("sheet_name"),
        sheet_order: row.get("sheet_order"),
        status,
        current_phase: row.get("current_phase"),
        progress_percent: row.get("progress_percent"),
        counters: SheetCounters {
            total_rows: row.get("total_rows"),
            ingested_rows: row.get("ingested_rows"),
            valid_rows: row.get("valid_rows"),
            error_rows: row.get("error_rows"),
            inserted_rows: row.get("inserted_rows"),
        },
        ingest_started_at: row.get("ingest_started_at"),
        ingest_ended_at: row.get("ingest_ended_at"),
        validation_started_at: row.get("validation_started_at"),
        validation_ended_at: row.get("validation_ended_at"),
        insertion_started_at: row.get("insertion_started_at"),
        insertion_ended_at: row.get("insertion_ended_at"),
        error_message: row.get("error_message"),
    })
}

fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<JobRecord, MigrationError> {
    let status: String = row.get("status");
    let status: JobStatus = status
        .parse()
        .map_err(|e: String| MigrationError::Internal(anyhow::anyhow!(e)))?;
    Ok(JobRecord {
        job_id: row.get("job_id"),
        input_path: row.get("input_path"),
        status,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_forward_only() {
        use SheetStatus::*;
        assert!(Pending.can_transition_to(Ingesting));
        assert!(Ingesting.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Inserting));
        assert!(Validating.can_transition_to(Completed)); // nothing to insert
        assert!(Inserting.can_transition_to(Completed));
        assert!(Ingesting.can_transition_to(Failed));
        assert!(Validating.can_transition_to(Cancelled));

        assert!(!Validating.can_transition_to(Ingesting));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Ingesting));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Ingesting.can_transition_to(Pending));
    }

    #[test]
    fn percent_is_zero_before_work() {
        let c = SheetCounters::default();
        assert_eq!(weighted_percent(SheetStatus::Pending, &c), 0);
    }

    #[test]
    fn percent_reaches_33_after_ingest() {
        let c = SheetCounters {
            total_rows: 100,
            ingested_rows: 100,
            ..Default::default()
        };
        assert_eq!(weighted_percent(SheetStatus::Validating, &c), 33);
    }

    #[test]
    fn percent_reaches_66_after_validation() {
        let c = SheetCounters {
            total_rows: 100,
            ingested_rows: 100,
            valid_rows: 90,
            error_rows: 10,
            ..Default::default()
        };
        assert_eq!(weighted_percent(SheetStatus::Inserting, &c), 66);
    }

    #[test]
    fn percent_is_100_on_completion_even_with_zero_rows() {
        let c = SheetCounters::default();
        assert_eq!(weighted_percent(SheetStatus::Completed, &c), 100);
    }

    #[test]
    fn percent_tracks_partial_phases() {
        let c = SheetCounters {
            total_rows: 100,
            ingested_rows: 50,
            ..Default::default()
        };
        // Half-way through ingest: 33 * 0.5.
        assert_eq!(weighted_percent(SheetStatus::Ingesting, &c), 17);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SheetStatus::Pending,
            SheetStatus::Ingesting,
            SheetStatus::Validating,
            SheetStatus::Inserting,
            SheetStatus::Completed,
            SheetStatus::Failed,
            SheetStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SheetStatus>(), Ok(status));
        }
        assert_eq!(
            "COMPLETED_WITH_ERRORS".parse::<JobStatus>(),
            Ok(JobStatus::CompletedWithErrors)
        );
    }
}
