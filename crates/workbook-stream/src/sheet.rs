//! Event-driven sheet body parsing.
//!
//! One `SheetRows` instance owns the decompression stream for a single sheet
//! part and yields rows in document order. Memory stays bounded by the width
//! of the current row; the sheet is never materialized.

use std::io::BufReader;

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::read::ZipFile;

use crate::cell::{column_index, dimension_rows};
use crate::error::StreamError;
use crate::package::{attr_value, text_of, SharedStrings};

/// Handler verdict for `stream_sheet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowScan {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellType {
    Number,
    Shared,
    InlineStr,
    Bool,
    FormulaStr,
    Error,
}

impl CellType {
    fn from_attr(t: Option<&str>) -> Self {
        match t {
            Some("s") => Self::Shared,
            Some("inlineStr") => Self::InlineStr,
            Some("b") => Self::Bool,
            Some("str") => Self::FormulaStr,
            Some("e") => Self::Error,
            _ => Self::Number,
        }
    }
}

/// Pull iterator over the rows of one sheet.
pub struct SheetRows<'a> {
    reader: Reader<BufReader<ZipFile<'a>>>,
    shared: &'a SharedStrings,
    buf: Vec<u8>,
    /// Total row count declared by the `<dimension>` element, when present.
    declared_rows: Option<u64>,
    next_implicit_row: u32,
    done: bool,
}

impl<'a> SheetRows<'a> {
    pub(crate) fn new(part: ZipFile<'a>, shared: &'a SharedStrings) -> Self {
        Self {
            reader: Reader::from_reader(BufReader::new(part)),
            shared,
            buf: Vec::new(),
            declared_rows: None,
            next_implicit_row: 1,
            done: false,
        }
    }

    /// Row count declared by the sheet's dimension reference. Only populated
    /// once parsing has reached the dimension element, which precedes the
    /// first row in well-formed sheets.
    pub fn declared_total_rows(&self) -> Option<u64> {
        self.declared_rows
    }

    /// Next row as `(zero_based_index, values)`. Values are placed by column
    /// with gaps filled by empty strings so alignment is preserved.
    pub fn next_row(&mut self) -> Result<Option<(u32, Vec<String>)>, StreamError> {
        if self.done {
            return Ok(None);
        }

        let mut row_num: u32 = 0;
        let mut cells: Vec<String> = Vec::new();
        let mut in_row = false;
        let mut cell_type = CellType::Number;
        let mut cell_col: u32 = 0;
        let mut next_col: u32 = 0;
        let mut value = String::new();
        let mut in_value = false;

        loop {
            let event = self.reader.read_event_into(&mut self.buf)?;
            match event {
                Event::Empty(ref e) => match e.local_name().as_ref() {
                    b"dimension" if !in_row => {
                        if let Some(r) = attr_value(e, b"ref") {
                            self.declared_rows = dimension_rows(&r);
                        }
                    }
                    b"row" => {
                        // Attribute-only row with no cells.
                        let num = attr_value(e, b"r")
                            .and_then(|r| r.parse().ok())
                            .filter(|n| *n >= 1)
                            .unwrap_or(self.next_implicit_row);
                        self.next_implicit_row = num + 1;
                        self.buf.clear();
                        return Ok(Some((num - 1, Vec::new())));
                    }
                    b"c" if in_row => {
                        let col = attr_value(e, b"r")
                            .as_deref()
                            .and_then(column_index)
                            .unwrap_or(next_col);
                        place(&mut cells, col, String::new());
                        next_col = col + 1;
                    }
                    _ => {}
                },
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"row" => {
                        in_row = true;
                        row_num = attr_value(e, b"r")
                            .and_then(|r| r.parse().ok())
                            .filter(|n| *n >= 1)
                            .unwrap_or(self.next_implicit_row);
                        self.next_implicit_row = row_num + 1;
                        cells.clear();
                        next_col = 0;
                    }
                    b"c" if in_row => {
                        cell_col = attr_value(e, b"r")
                            .as_deref()
                            .and_then(column_index)
                            .unwrap_or(next_col);
                        cell_type = CellType::from_attr(attr_value(e, b"t").as_deref());
                        value.clear();
                    }
                    b"v" if in_row => in_value = true,
                    b"t" if in_row && cell_type == CellType::InlineStr => in_value = true,
                    _ => {}
                },
                Event::Text(ref e) if in_value => value.push_str(&text_of(e)?),
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"v" | b"t" => in_value = false,
                    b"c" if in_row => {
                        let resolved = resolve(self.shared, cell_type, &value)?;
                        place(&mut cells, cell_col, resolved);
                        next_col = cell_col + 1;
                        value.clear();
                    }
                    b"row" if in_row => {
                        self.buf.clear();
                        return Ok(Some((row_num - 1, cells)));
                    }
                    _ => {}
                },
                Event::Eof => {
                    self.done = true;
                    self.buf.clear();
                    return Ok(None);
                }
                _ => {}
            }
            self.buf.clear();
        }
    }

    /// Consume the rest of the stream counting row starts only, without
    /// building cell values. Used by the cheap-dimension fallback.
    pub fn count_remaining_rows(&mut self) -> Result<u64, StreamError> {
        if self.done {
            return Ok(0);
        }
        let mut count = 0u64;
        loop {
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(ref e) | Event::Empty(ref e)
                    if e.local_name().as_ref() == b"row" =>
                {
                    count += 1;
                }
                Event::Eof => break,
                _ => {}
            }
            self.buf.clear();
        }
        self.done = true;
        Ok(count)
    }
}

fn resolve(
    shared: &SharedStrings,
    cell_type: CellType,
    raw: &str,
) -> Result<String, StreamError> {
    match cell_type {
        CellType::Shared => {
            let idx: usize = raw
                .trim()
                .parse()
                .map_err(|_| StreamError::Parse(format!("bad shared-string index {raw:?}")))?;
            shared.get(idx).map(str::to_string).ok_or_else(|| {
                StreamError::Parse(format!(
                    "shared-string index {idx} out of range ({} entries)",
                    shared.len()
                ))
            })
        }
        CellType::Bool => Ok(if raw.trim() == "1" {
            "TRUE".to_string()
        } else {
            "FALSE".to_string()
        }),
        // Cached formula results, numbers, plain and error values pass
        // through as their stored text. An uncached formula cell has no
        // <v> and stays empty.
        CellType::Number | CellType::InlineStr | CellType::FormulaStr | CellType::Error => {
            Ok(raw.to_string())
        }
    }
}

fn place(cells: &mut Vec<String>, col: u32, value: String) {
    let col = col as usize;
    if cells.len() <= col {
        cells.resize(col, String::new());
        cells.push(value);
    } else {
        cells[col] = value;
    }
}
