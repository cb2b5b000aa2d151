//! Column mapping: localized header rows to canonical, normalized records.

mod business_key;
mod normalizer;

pub use normalizer::{normalize, parse_date, parse_month, parse_number};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{NormalizeKind, SheetTypeConfig};

/// One normalized data row bound for the raw staging relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub job_id: String,
    pub sheet_name: String,
    /// 1-based within data rows (the header row is row 0 of the sheet).
    pub row_number: i64,
    pub business_key: String,
    /// Canonical column name -> normalized value; empty cells are None.
    pub values: BTreeMap<String, Option<String>>,
}

impl RawRecord {
    pub fn value(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(|v| v.as_deref())
    }

    /// Snapshot of all cell values, stored alongside the record.
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::json!(self.values)
    }
}

/// Maps one sheet's rows using its actual header row.
pub struct RowMapper<'a> {
    sheet: &'a SheetTypeConfig,
    /// Sheet column index -> (canonical name, normalization kind).
    by_index: Vec<Option<(String, NormalizeKind)>>,
    missing_headers: Vec<String>,
}

impl<'a> RowMapper<'a> {
    /// Build the index lookup by matching the configured header labels
    /// against the sheet's real header row (trimmed, case-insensitive).
    pub fn from_header_row(sheet: &'a SheetTypeConfig, headers: &[String]) -> Self {
        let mut by_index: Vec<Option<(String, NormalizeKind)>> = vec![None; headers.len()];
        let mut missing_headers = Vec::new();

        for mapping in &sheet.columns {
            let wanted = mapping.header.trim().to_lowercase();
            let found = headers
                .iter()
                .position(|h| h.trim().to_lowercase() == wanted);
            match found {
                Some(idx) => by_index[idx] = Some((mapping.column.clone(), mapping.kind)),
                None => missing_headers.push(mapping.header.clone()),
            }
        }

        Self {
            sheet,
            by_index,
            missing_headers,
        }
    }

    /// Configured headers absent from the sheet. Reported as template
    /// warnings; their columns stay null on every mapped row.
    pub fn missing_headers(&self) -> &[String] {
        &self.missing_headers
    }

    pub fn map_row(&self, job_id: &str, row_number: i64, cells: &[String]) -> RawRecord {
        let mut values: BTreeMap<String, Option<String>> = self
            .sheet
            .columns
            .iter()
            .map(|c| (c.column.clone(), None))
            .collect();

        for (idx, cell) in cells.iter().enumerate() {
            if let Some(Some((column, kind))) = self.by_index.get(idx) {
                values.insert(column.clone(), normalize(*kind, cell));
            }
        }

        let business_key = business_key::generate(&self.sheet.business_key, &values);
        RawRecord {
            job_id: job_id.to_string(),
            sheet_name: self.sheet.name.clone(),
            row_number,
            business_key,
            values,
        }
    }
}
