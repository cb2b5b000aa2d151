//! Final-insert plug point: validated staging rows into master relations.
//!
//! The mapping from a validated row to sheet-specific domain tables is a
//! deployment concern; the default writer upserts by business key into the
//! sheet type's configured master table, which keeps the insert phase
//! idempotent under retry. Register a custom writer per sheet type to fan a
//! row out into multiple domain tables in foreign-key order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::config::SheetTypeConfig;
use crate::error::MigrationError;
use crate::mapping::RawRecord;

#[async_trait]
pub trait MasterWriter: Send + Sync {
    /// Write one batch of validated rows. Runs in its own transaction;
    /// must be idempotent per business key.
    async fn write_batch(
        &self,
        pool: &PgPool,
        sheet: &SheetTypeConfig,
        rows: &[RawRecord],
    ) -> Result<u64, MigrationError>;
}

/// Default writer: `INSERT .. ON CONFLICT (business_key) DO UPDATE` into the
/// configured master table, one transaction per batch.
pub struct UpsertMasterWriter;

#[async_trait]
impl MasterWriter for UpsertMasterWriter {
    async fn write_batch(
        &self,
        pool: &PgPool,
        sheet: &SheetTypeConfig,
        rows: &[RawRecord],
    ) -> Result<u64, MigrationError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = pool.begin().await?;
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (business_key, source_job_id, payload) ",
            sheet.master_table
        ));
        qb.push_values(rows, |mut b, record| {
            b.push_bind(&record.business_key)
                .push_bind(&record.job_id)
                .push_bind(record.payload_json());
        });
        qb.push(
            " ON CONFLICT (business_key) DO UPDATE \
             SET payload = EXCLUDED.payload, \
                 source_job_id = EXCLUDED.source_job_id, \
                 updated_at = now()",
        );
        let result = qb.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

/// Sheet-type name -> writer, with the upsert writer as fallback.
#[derive(Clone)]
pub struct MasterWriterRegistry {
    default: Arc<dyn MasterWriter>,
    by_sheet: HashMap<String, Arc<dyn MasterWriter>>,
}

impl MasterWriterRegistry {
    pub fn new() -> Self {
        Self {
            default: Arc::new(UpsertMasterWriter),
            by_sheet: HashMap::new(),
        }
    }

    pub fn register(&mut self, sheet_name: impl Into<String>, writer: Arc<dyn MasterWriter>) {
        self.by_sheet.insert(sheet_name.into(), writer);
    }

    pub fn writer_for(&self, sheet_name: &str) -> Arc<dyn MasterWriter> {
        self.by_sheet
            .get(sheet_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl Default for MasterWriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
