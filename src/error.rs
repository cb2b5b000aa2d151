//! Service-wide error taxonomy.
//!
//! Data faults (bad rows) never travel through this type; they are written
//! to the error relations and surface only via progress polling. Everything
//! here is either an input fault rejected at submission, a phase fault, or a
//! system fault.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Pre-save validation failed; the upload bytes were discarded.
    #[error("workbook rejected: {0}")]
    UploadRejected(String),

    #[error("job pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("submissions suspended: {0}")]
    CircuitOpen(String),

    #[error("cancelled")]
    Cancelled,

    #[error("phase timed out after {0} ms")]
    Timeout(u64),

    #[error("shutdown requested")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("workbook stream: {0}")]
    Stream(#[from] workbook_stream::StreamError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MigrationError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::InvalidInput(_) | Self::UploadRejected(_) => 400,
            Self::PoolExhausted(_) | Self::CircuitOpen(_) | Self::ShuttingDown => 503,
            Self::Cancelled => 409,
            Self::Timeout(_)
            | Self::Config(_)
            | Self::Stream(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Whether a phase hitting this fault should retry with backoff.
    /// Deadlocks, serialization failures, pool/statement timeouts and broken
    /// connections are expected to clear; everything else fails the phase.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Database(sqlx::Error::Io(_)) => true,
            Self::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some("40001") | Some("40P01") | Some("57014")
            ),
            _ => false,
        }
    }
}
