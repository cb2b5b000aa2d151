//! Row validation: error taxonomy, rule compilation and the batch engine.

mod engine;

pub use engine::{JobValidationContext, RowOutcome, ValidationEngine};

use serde::{Deserialize, Serialize};

/// Data-fault kinds captured per row. These never abort a job; they end up
/// in the error relations and surface through progress polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RequiredMissing,
    InvalidDate,
    InvalidPattern,
    InvalidEnum,
    DupInFile,
    DupInDb,
    RefNotFound,
    BusinessRule,
    FieldValidation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiredMissing => "REQUIRED_MISSING",
            Self::InvalidDate => "INVALID_DATE",
            Self::InvalidPattern => "INVALID_PATTERN",
            Self::InvalidEnum => "INVALID_ENUM",
            Self::DupInFile => "DUP_IN_FILE",
            Self::DupInDb => "DUP_IN_DB",
            Self::RefNotFound => "REF_NOT_FOUND",
            Self::BusinessRule => "BUSINESS_RULE",
            Self::FieldValidation => "FIELD_VALIDATION",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One validation failure on one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub kind: ErrorKind,
    pub field: String,
    pub value: Option<String>,
    pub message: String,
    pub rule_id: String,
}

/// Which stored key a grouped DB lookup compares against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupKey {
    /// The `business_key` column of a staging or master relation.
    BusinessKey,
    /// A field inside the jsonb payload of a staging or master relation.
    PayloadField(String),
    /// A plain column of a reference relation.
    Column(String),
}

/// A grouped existence lookup the engine needs before validating a batch.
#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub rule_id: String,
    pub table: String,
    pub key: LookupKey,
    pub keys: Vec<String>,
}
