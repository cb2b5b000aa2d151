//! Error type for workbook streaming.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The container is not a readable workbook (bad zip, missing index part).
    #[error("invalid workbook: {0}")]
    InvalidWorkbook(String),

    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    /// Malformed XML or inconsistent part content mid-stream. Rows already
    /// emitted before the failure remain valid for the caller.
    #[error("workbook parse error: {0}")]
    Parse(String),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for StreamError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => StreamError::Io(io),
            other => StreamError::InvalidWorkbook(other.to_string()),
        }
    }
}
