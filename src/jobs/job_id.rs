//! Job id generation: `JOB-YYYYMMDD-NNN`, numbered per day.

use chrono::Utc;
use sqlx::PgPool;

use crate::error::MigrationError;

/// Allocate the next id from the per-day counter. Safe under concurrent
/// submissions: the upsert increments atomically.
pub async fn next_job_id(pool: &PgPool) -> Result<String, MigrationError> {
    let today = Utc::now().date_naive();
    let seq: i32 = sqlx::query_scalar(
        r#"
        INSERT INTO migration_job_seq (day, last_seq)
        VALUES ($1, 1)
        ON CONFLICT (day) DO UPDATE SET last_seq = migration_job_seq.last_seq + 1
        RETURNING last_seq
        "#,
    )
    .bind(today)
    .fetch_one(pool)
    .await?;
    Ok(format_job_id(&today.format("%Y%m%d").to_string(), seq))
}

fn format_job_id(day: &str, seq: i32) -> String {
    format!("JOB-{day}-{seq:03}")
}
