//! Streaming reader for zipped-XML workbooks.
//!
//! A workbook handle loads the sheet index and shared-strings table once,
//! then streams individual sheet bodies row by row. Memory stays
//! O(row width + shared strings); a full sheet is never held in memory.
//! One handle iterates sequentially; open independent handles over the same
//! bytes for concurrent sheet access.

mod cell;
mod error;
mod package;
mod sheet;

use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

pub use error::StreamError;
pub use sheet::{RowScan, SheetRows};

use package::Package;

/// Header labels plus a cheap data-row count for one sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetDimension {
    pub headers: Vec<String>,
    pub data_rows: u64,
}

/// An open workbook: validated container, sheet index, shared strings.
pub struct XlsxWorkbook {
    package: Package,
    names: Vec<String>,
}

impl XlsxWorkbook {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let file = File::open(path.as_ref())?;
        Self::from_boxed(Box::new(BufReader::new(file)))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, StreamError> {
        Self::from_boxed(Box::new(Cursor::new(bytes)))
    }

    fn from_boxed(reader: Box<dyn package::ReadSeek>) -> Result<Self, StreamError> {
        let package = Package::open(reader)?;
        let names = package.sheets.iter().map(|s| s.name.clone()).collect();
        Ok(Self { package, names })
    }

    /// Sheet names in document order. No sheet body is parsed.
    pub fn sheet_names(&self) -> &[String] {
        &self.names
    }

    /// Pull iterator over one sheet's rows, header row first.
    pub fn rows(&mut self, sheet: &str) -> Result<SheetRows<'_>, StreamError> {
        let part_path = self
            .package
            .sheets
            .iter()
            .find(|s| s.name == sheet)
            .map(|s| s.part_path.clone())
            .ok_or_else(|| StreamError::SheetNotFound(sheet.to_string()))?;

        let Package {
            archive, shared, ..
        } = &mut self.package;
        let part = archive.by_name(&part_path).map_err(|e| match e {
            zip::result::ZipError::FileNotFound => {
                StreamError::InvalidWorkbook(format!("missing sheet part {part_path}"))
            }
            other => StreamError::from(other),
        })?;
        Ok(SheetRows::new(part, shared))
    }

    /// Push the sheet through `handler` as `(row_index, values)` events,
    /// row 0 (headers) first. The handler may stop iteration early.
    pub fn stream_sheet<F>(&mut self, sheet: &str, mut handler: F) -> Result<(), StreamError>
    where
        F: FnMut(u32, &[String]) -> RowScan,
    {
        let mut rows = self.rows(sheet)?;
        while let Some((idx, values)) = rows.next_row()? {
            if handler(idx, &values) == RowScan::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Header labels and data-row count. Uses the sheet's dimension reference
    /// when declared; otherwise falls back to a streaming pass that counts
    /// row starts without building cell values.
    pub fn sheet_dimension(&mut self, sheet: &str) -> Result<SheetDimension, StreamError> {
        let mut rows = self.rows(sheet)?;
        let headers = match rows.next_row()? {
            Some((_, values)) => values,
            None => {
                return Ok(SheetDimension {
                    headers: Vec::new(),
                    data_rows: 0,
                })
            }
        };
        let data_rows = match rows.declared_total_rows() {
            Some(total) => total.saturating_sub(1),
            None => rows.count_remaining_rows()?,
        };
        Ok(SheetDimension { headers, data_rows })
    }
}
