//! Database-backed integration tests for the staging and progress stores.
//!
//! Run with: DATABASE_URL=postgresql://localhost/multisheet_migration \
//!           cargo test --test db_integration -- --ignored
//!
//! Requires the migrations under migrations/ to be applied.

mod common;

use std::collections::BTreeMap;

use multisheet_migration::jobs::next_job_id;
use multisheet_migration::mapping::RawRecord;
use multisheet_migration::progress::{
    CounterUpdate, JobStatus, ProgressStore, SheetStatus,
};
use multisheet_migration::staging::StagingStore;
use multisheet_migration::validation::{ErrorKind, RowError};

async fn get_test_pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/multisheet_migration".to_string());
    sqlx::PgPool::connect(&url)
        .await
        .expect("Failed to connect to database")
}

fn record(job_id: &str, row: i64, key: &str) -> RawRecord {
    let values: BTreeMap<String, Option<String>> = [
        ("contract_number".to_string(), Some(key.to_string())),
        ("contract_type".to_string(), Some("LOAN".to_string())),
        ("org_code".to_string(), Some("ORG1".to_string())),
    ]
    .into();
    RawRecord {
        job_id: job_id.to_string(),
        sheet_name: "Contracts".to_string(),
        row_number: row,
        business_key: format!("{key}_LOAN"),
        values,
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn job_ids_are_unique_and_sequential_per_day() {
    let pool = get_test_pool().await;
    let first = next_job_id(&pool).await.unwrap();
    let second = next_job_id(&pool).await.unwrap();
    assert_ne!(first, second);
    assert!(first.starts_with("JOB-"));
    assert_eq!(first.len(), second.len());
}

#[tokio::test]
#[ignore] // Requires database
async fn append_raw_is_idempotent_per_row() {
    let pool = get_test_pool().await;
    let staging = StagingStore::new(pool.clone());
    let config = common::test_config();
    let sheet = config.sheet("Contracts").unwrap();
    let job_id = format!("TEST-{}", uuid::Uuid::new_v4());

    let batch: Vec<RawRecord> = (1..=5).map(|i| record(&job_id, i, &format!("HD-{i}"))).collect();

    let mut tx = pool.begin().await.unwrap();
    let first = staging.append_raw(&mut *tx, sheet, &batch).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(first, 5);

    // Second run re-inserts nothing.
    let mut tx = pool.begin().await.unwrap();
    let second = staging.append_raw(&mut *tx, sheet, &batch).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(second, 0);

    let counts = staging.counts_by_job(sheet, &job_id).await.unwrap();
    assert_eq!(counts.raw, 5);

    staging.cleanup(sheet, &job_id, false).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires database
async fn partition_moves_rows_and_cleanup_keeps_errors() {
    let pool = get_test_pool().await;
    let staging = StagingStore::new(pool.clone());
    let config = common::test_config();
    let sheet = config.sheet("Contracts").unwrap();
    let job_id = format!("TEST-{}", uuid::Uuid::new_v4());

    let good = record(&job_id, 1, "HD-1");
    let bad = record(&job_id, 2, "HD-2");
    let fault = RowError {
        kind: ErrorKind::RequiredMissing,
        field: "org_code".to_string(),
        value: None,
        message: "org_code is required".to_string(),
        rule_id: "contract-required".to_string(),
    };

    let mut tx = pool.begin().await.unwrap();
    staging
        .append_raw(&mut *tx, sheet, &[good.clone(), bad.clone()])
        .await
        .unwrap();
    staging.move_to_valid(&mut *tx, sheet, &[good]).await.unwrap();
    staging
        .move_to_error(&mut *tx, sheet, &[(bad, vec![fault])])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let counts = staging.counts_by_job(sheet, &job_id).await.unwrap();
    assert_eq!((counts.raw, counts.valid, counts.error), (2, 1, 1));

    let errors = staging.list_row_errors(&job_id, None, 100, 0).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].rule_id, "contract-required");

    // keep_errors leaves the error relations untouched.
    staging.cleanup(sheet, &job_id, true).await.unwrap();
    let counts = staging.counts_by_job(sheet, &job_id).await.unwrap();
    assert_eq!((counts.raw, counts.valid, counts.error), (0, 0, 1));

    staging.cleanup(sheet, &job_id, false).await.unwrap();
    let counts = staging.counts_by_job(sheet, &job_id).await.unwrap();
    assert_eq!(counts.error, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn progress_lifecycle_and_monotonic_guard() {
    let pool = get_test_pool().await;
    let progress = ProgressStore::new(pool.clone());
    let job_id = format!("TEST-{}", uuid::Uuid::new_v4());

    progress.create_job(&job_id, "/tmp/upload.xlsx").await.unwrap();
    progress
        .init(
            &job_id,
            &[("Contracts".to_string(), 1), ("Customers".to_string(), 2)],
        )
        .await
        .unwrap();

    let sheet = progress.get_sheet(&job_id, "Contracts").await.unwrap().unwrap();
    assert_eq!(sheet.status, SheetStatus::Pending);
    assert_eq!(sheet.progress_percent, 0);

    progress
        .set_status(&job_id, "Contracts", SheetStatus::Ingesting, None)
        .await
        .unwrap();
    progress
        .set_counters(
            &job_id,
            "Contracts",
            CounterUpdate {
                total_rows: Some(100),
                ingested_rows: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    progress
        .set_status(&job_id, "Contracts", SheetStatus::Validating, None)
        .await
        .unwrap();

    // Regression must be refused.
    let err = progress
        .set_status(&job_id, "Contracts", SheetStatus::Ingesting, None)
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 409);

    let sheet = progress.get_sheet(&job_id, "Contracts").await.unwrap().unwrap();
    assert!(sheet.ingest_started_at.is_some());
    assert!(sheet.ingest_ended_at.is_some());
    assert!(sheet.validation_started_at.is_some());

    let aggregate = progress.get_progress(&job_id).await.unwrap().unwrap();
    assert_eq!(aggregate.total_sheets, 2);
    assert_eq!(aggregate.in_progress_sheets, 1);
    assert_eq!(aggregate.pending_sheets, 1);
    assert_eq!(aggregate.current_sheet.as_deref(), Some("Contracts"));

    progress.set_job_status(&job_id, JobStatus::Cancelled).await.unwrap();
    let job = progress.get_job(&job_id).await.unwrap().unwrap();
    assert!(job.status.is_terminal());
    assert!(job.completed_at.is_some());
}
