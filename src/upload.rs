//! Pre-save workbook validation.
//!
//! Runs before the upload is persisted; a failing workbook is never written
//! to disk. Four phases: basic payload checks, sheet structure, per-sheet
//! dimension caps, and a non-blocking header/template comparison. Only the
//! sheet index, dimension references and header rows are parsed; the
//! workbook body is never fully decompressed.

use std::collections::HashMap;

use serde::Serialize;
use workbook_stream::XlsxWorkbook;

use crate::config::MigrationConfig;
use crate::mapping::RowMapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadFaultKind {
    InvalidWorkbook,
    MissingSheet,
    ExcessiveRows,
    BadExtension,
    OversizePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFault {
    pub kind: UploadFaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<UploadFault>,
    pub warnings: Vec<String>,
    pub row_counts: HashMap<String, u64>,
}

impl ValidationReport {
    fn rejected(kind: UploadFaultKind, message: String) -> Self {
        Self {
            ok: false,
            errors: vec![UploadFault { kind, message }],
            warnings: Vec::new(),
            row_counts: HashMap::new(),
        }
    }

    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validate an upload before anything is persisted.
pub fn validate_workbook(
    config: &MigrationConfig,
    file_name: &str,
    bytes: &[u8],
) -> ValidationReport {
    let upload = &config.upload;

    // Phase 1: basic payload checks.
    if bytes.is_empty() {
        return ValidationReport::rejected(
            UploadFaultKind::OversizePayload,
            "payload is empty".to_string(),
        );
    }
    if bytes.len() as u64 > upload.max_payload_bytes {
        return ValidationReport::rejected(
            UploadFaultKind::OversizePayload,
            format!(
                "payload is {} bytes, limit is {}",
                bytes.len(),
                upload.max_payload_bytes
            ),
        );
    }
    let extension = file_name.rsplit('.').next().unwrap_or("").to_lowercase();
    if !upload
        .allowed_extensions
        .iter()
        .any(|e| e.eq_ignore_ascii_case(&extension))
    {
        return ValidationReport::rejected(
            UploadFaultKind::BadExtension,
            format!(
                "extension {extension:?} not allowed (expected one of {:?})",
                upload.allowed_extensions
            ),
        );
    }

    // Phase 2: structure. The workbook index is enough to list sheets.
    let mut workbook = match XlsxWorkbook::from_bytes(bytes.to_vec()) {
        Ok(wb) => wb,
        Err(e) => {
            return ValidationReport::rejected(UploadFaultKind::InvalidWorkbook, e.to_string())
        }
    };

    let mut report = ValidationReport {
        ok: true,
        errors: Vec::new(),
        warnings: Vec::new(),
        row_counts: HashMap::new(),
    };

    let found: Vec<String> = workbook.sheet_names().to_vec();
    let required: Vec<String> = config
        .enabled_sheets()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    let missing: Vec<&String> = required.iter().filter(|r| !found.contains(r)).collect();
    if !missing.is_empty() {
        report.ok = false;
        report.errors.push(UploadFault {
            kind: UploadFaultKind::MissingSheet,
            message: format!("missing sheets {missing:?}; expected {required:?}, found {found:?}"),
        });
    }
    for extra in found.iter().filter(|f| !required.contains(f)) {
        report.warnings.push(format!("unexpected sheet {extra:?} will be ignored"));
    }

    // Phases 3 and 4 per required sheet that is actually present.
    for sheet in config.enabled_sheets() {
        if !found.contains(&sheet.name) {
            continue;
        }
        let dimension = match workbook.sheet_dimension(&sheet.name) {
            Ok(d) => d,
            Err(e) => {
                report.ok = false;
                report.errors.push(UploadFault {
                    kind: UploadFaultKind::InvalidWorkbook,
                    message: format!("sheet {}: {e}", sheet.name),
                });
                continue;
            }
        };
        report
            .row_counts
            .insert(sheet.name.clone(), dimension.data_rows);

        if upload.max_rows_per_sheet > 0 && dimension.data_rows > upload.max_rows_per_sheet {
            report.ok = false;
            report.errors.push(UploadFault {
                kind: UploadFaultKind::ExcessiveRows,
                message: format!(
                    "sheet {} has {} data rows, cap is {}",
                    sheet.name, dimension.data_rows, upload.max_rows_per_sheet
                ),
            });
        }

        // Template check is advisory only.
        let mapper = RowMapper::from_header_row(sheet, &dimension.headers);
        for header in mapper.missing_headers() {
            report.warnings.push(format!(
                "sheet {}: expected header {header:?} not found",
                sheet.name
            ));
        }
    }

    report
}
