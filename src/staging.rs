//! Staging store: batched access to the raw / valid / error relations.
//!
//! All SQL is runtime-checked (`sqlx::query`, not the compile-time macros)
//! because relation names come from configuration and the tables are created
//! by migrations that may not exist at compile time. Write operations take an
//! open connection so they join the calling phase's transaction; reads go
//! straight to the pool.

use std::collections::{BTreeMap, HashSet};

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};

use crate::config::SheetTypeConfig;
use crate::error::MigrationError;
use crate::mapping::RawRecord;
use crate::validation::{LookupKey, RowError};

/// Cross-sheet error relation, keyed by (job, sheet, row, rule).
const ROW_ERROR_TABLE: &str = "stg_row_error";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingCounts {
    pub raw: i64,
    pub valid: i64,
    pub error: i64,
}

/// One row read back from an error relation, for diagnostics listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorRow {
    pub sheet_name: String,
    pub row_number: i64,
    pub error_type: String,
    pub error_field: String,
    pub error_value: Option<String>,
    pub error_message: String,
    pub rule_id: String,
}

#[derive(Clone)]
pub struct StagingStore {
    pool: PgPool,
}

impl StagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append a batch to the raw relation. Idempotent per
    /// (job_id, sheet_name, row_number): a re-run ingest re-inserts nothing.
    pub async fn append_raw(
        &self,
        conn: &mut PgConnection,
        sheet: &SheetTypeConfig,
        batch: &[RawRecord],
    ) -> Result<u64, MigrationError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (job_id, row_number, sheet_name, business_key, payload) ",
            sheet.raw_table
        ));
        qb.push_values(batch, |mut b, record| {
            b.push_bind(&record.job_id)
                .push_bind(record.row_number)
                .push_bind(&record.sheet_name)
                .push_bind(&record.business_key)
                .push_bind(record.payload_json());
        });
        qb.push(" ON CONFLICT (job_id, sheet_name, row_number) DO NOTHING");
        let result = qb.build().execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    /// Read a raw batch after the given row number, in stable row order.
    pub async fn read_raw(
        &self,
        sheet: &SheetTypeConfig,
        job_id: &str,
        after_row: i64,
        limit: i64,
    ) -> Result<Vec<RawRecord>, MigrationError> {
        self.read_records(&sheet.raw_table, sheet, job_id, after_row, limit)
            .await
    }

    pub async fn read_valid(
        &self,
        sheet: &SheetTypeConfig,
        job_id: &str,
        after_row: i64,
        limit: i64,
    ) -> Result<Vec<RawRecord>, MigrationError> {
        self.read_records(&sheet.valid_table, sheet, job_id, after_row, limit)
            .await
    }

    async fn read_records(
        &self,
        table: &str,
        sheet: &SheetTypeConfig,
        job_id: &str,
        after_row: i64,
        limit: i64,
    ) -> Result<Vec<RawRecord>, MigrationError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT row_number, business_key, payload
            FROM {table}
            WHERE job_id = $1 AND row_number > $2
            ORDER BY row_number
            LIMIT $3
            "#,
        ))
        .bind(job_id)
        .bind(after_row)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload: serde_json::Value = row.get("payload");
                let values: BTreeMap<String, Option<String>> = serde_json::from_value(payload)
                    .map_err(|e| {
                        MigrationError::Internal(anyhow::anyhow!("corrupt staging payload: {e}"))
                    })?;
                Ok(RawRecord {
                    job_id: job_id.to_string(),
                    sheet_name: sheet.name.clone(),
                    row_number: row.get("row_number"),
                    business_key: row.get("business_key"),
                    values,
                })
            })
            .collect()
    }

    /// Copy validated rows into the valid relation.
    pub async fn move_to_valid(
        &self,
        conn: &mut PgConnection,
        sheet: &SheetTypeConfig,
        rows: &[RawRecord],
    ) -> Result<u64, MigrationError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (job_id, row_number, sheet_name, business_key, payload) ",
            sheet.valid_table
        ));
        qb.push_values(rows, |mut b, record| {
            b.push_bind(&record.job_id)
                .push_bind(record.row_number)
                .push_bind(&record.sheet_name)
                .push_bind(&record.business_key)
                .push_bind(record.payload_json());
        });
        qb.push(" ON CONFLICT (job_id, sheet_name, row_number) DO NOTHING");
        let result = qb.build().execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    /// Copy failed rows into the sheet's error relation (first error carried
    /// as the row's primary fault) and every individual failure into the
    /// cross-sheet error relation.
    pub async fn move_to_error(
        &self,
        conn: &mut PgConnection,
        sheet: &SheetTypeConfig,
        rows: &[(RawRecord, Vec<RowError>)],
    ) -> Result<u64, MigrationError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (job_id, row_number, sheet_name, business_key, payload, \
             error_type, error_field, error_value, error_message, rule_id) ",
            sheet.error_table
        ));
        qb.push_values(rows, |mut b, (record, errors)| {
            let first = &errors[0];
            b.push_bind(&record.job_id)
                .push_bind(record.row_number)
                .push_bind(&record.sheet_name)
                .push_bind(&record.business_key)
                .push_bind(record.payload_json())
                .push_bind(first.kind.as_str())
                .push_bind(&first.field)
                .push_bind(&first.value)
                .push_bind(&first.message)
                .push_bind(&first.rule_id);
        });
        qb.push(" ON CONFLICT (job_id, sheet_name, row_number) DO NOTHING");
        let result = qb.build().execute(&mut *conn).await?;

        let mut flat: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {ROW_ERROR_TABLE} (job_id, sheet_name, row_number, rule_id, \
             error_type, error_field, error_value, error_message) ",
        ));
        let all: Vec<(&RawRecord, &RowError)> = rows
            .iter()
            .flat_map(|(record, errors)| errors.iter().map(move |e| (record, e)))
            .collect();
        flat.push_values(&all, |mut b, (record, error)| {
            b.push_bind(&record.job_id)
                .push_bind(&record.sheet_name)
                .push_bind(record.row_number)
                .push_bind(&error.rule_id)
                .push_bind(error.kind.as_str())
                .push_bind(&error.field)
                .push_bind(&error.value)
                .push_bind(&error.message);
        });
        flat.push(" ON CONFLICT (job_id, sheet_name, row_number, rule_id) DO NOTHING");
        flat.build().execute(&mut *conn).await?;

        Ok(result.rows_affected())
    }

    pub async fn counts_by_job(
        &self,
        sheet: &SheetTypeConfig,
        job_id: &str,
    ) -> Result<StagingCounts, MigrationError> {
        let count = |table: &str| {
            let sql = format!("SELECT count(*) FROM {table} WHERE job_id = $1");
            let pool = self.pool.clone();
            let job_id = job_id.to_string();
            async move {
                let n: i64 = sqlx::query_scalar(&sql).bind(&job_id).fetch_one(&pool).await?;
                Ok::<i64, MigrationError>(n)
            }
        };
        Ok(StagingCounts {
            raw: count(&sheet.raw_table).await?,
            valid: count(&sheet.valid_table).await?,
            error: count(&sheet.error_table).await?,
        })
    }

    /// Grouped existence lookup for duplicate-in-db and reference rules:
    /// one query per rule per batch, returning the subset of keys present.
    pub async fn existing_keys(
        &self,
        table: &str,
        key: &LookupKey,
        keys: &[String],
    ) -> Result<HashSet<String>, MigrationError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let expr = match key {
            LookupKey::BusinessKey => "business_key".to_string(),
            LookupKey::PayloadField(field) => format!("payload->>'{field}'"),
            LookupKey::Column(column) => column.clone(),
        };
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {expr} AS k FROM {table} WHERE {expr} = ANY($1)"
        ))
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("k")).collect())
    }

    /// Row errors for diagnostics polling, optionally filtered by sheet.
    pub async fn list_row_errors(
        &self,
        job_id: &str,
        sheet_name: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ErrorRow>, MigrationError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT e.job_id, e.sheet_name, e.row_number, e.rule_id,
                   e.error_type, e.error_field, e.error_value, e.error_message
            FROM {ROW_ERROR_TABLE} e
            WHERE e.job_id = $1 AND ($2::text IS NULL OR e.sheet_name = $2)
            ORDER BY e.sheet_name, e.row_number, e.rule_id
            LIMIT $3 OFFSET $4
            "#,
        ))
        .bind(job_id)
        .bind(sheet_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ErrorRow {
                sheet_name: row.get("sheet_name"),
                row_number: row.get("row_number"),
                error_type: row.get("error_type"),
                error_field: row.get("error_field"),
                error_value: row.get("error_value"),
                error_message: row.get("error_message"),
                rule_id: row.get("rule_id"),
            })
            .collect())
    }

    /// Delete a job's staging rows. Raw and valid always go; errors survive
    /// unless explicitly cleared, so re-run diagnostics stay available.
    pub async fn cleanup(
        &self,
        sheet: &SheetTypeConfig,
        job_id: &str,
        keep_errors: bool,
    ) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        for table in [&sheet.raw_table, &sheet.valid_table] {
            sqlx::query(&format!("DELETE FROM {table} WHERE job_id = $1"))
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }
        if !keep_errors {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE job_id = $1",
                sheet.error_table
            ))
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(&format!(
                "DELETE FROM {ROW_ERROR_TABLE} WHERE job_id = $1 AND sheet_name = $2"
            ))
            .bind(job_id)
            .bind(&sheet.name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
