//! Zip container access and workbook index parsing.
//!
//! Only three kinds of parts are read: the workbook index (`xl/workbook.xml`),
//! its relationships part (for sheet part paths), and the shared-strings
//! table. Styles, themes and everything else in the container are ignored.

use std::io::{BufReader, Read, Seek};

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use zip::ZipArchive;

use crate::error::StreamError;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

/// Object-safe Read + Seek bound so file- and byte-backed archives share
/// one concrete handle type.
pub(crate) trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A sheet listed in the workbook index, in document order.
#[derive(Debug, Clone)]
pub(crate) struct SheetEntry {
    pub name: String,
    pub part_path: String,
}

/// Shared-strings table, loaded once per open handle.
#[derive(Debug, Default)]
pub(crate) struct SharedStrings(Vec<String>);

impl SharedStrings {
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

pub(crate) struct Package {
    pub archive: ZipArchive<Box<dyn ReadSeek>>,
    pub sheets: Vec<SheetEntry>,
    pub shared: SharedStrings,
}

impl Package {
    pub fn open(reader: Box<dyn ReadSeek>) -> Result<Self, StreamError> {
        let mut archive = ZipArchive::new(reader)
            .map_err(|e| StreamError::InvalidWorkbook(format!("unreadable container: {e}")))?;
        let sheets = read_sheet_index(&mut archive)?;
        let shared = read_shared_strings(&mut archive)?;
        Ok(Self {
            archive,
            sheets,
            shared,
        })
    }
}

/// First attribute whose local name matches, namespace prefix ignored.
pub(crate) fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == name {
            return Some(String::from_utf8_lossy(&attr.value).into_owned());
        }
    }
    None
}

pub(crate) fn text_of(e: &BytesText<'_>) -> Result<String, StreamError> {
    let decoded = e
        .decode()
        .map_err(|err| StreamError::Parse(err.to_string()))?;
    quick_xml::escape::unescape(&decoded)
        .map(|c| c.into_owned())
        .map_err(|err| StreamError::Parse(err.to_string()))
}

fn read_sheet_index(
    archive: &mut ZipArchive<Box<dyn ReadSeek>>,
) -> Result<Vec<SheetEntry>, StreamError> {
    // name -> relationship id, in document order
    let mut declared: Vec<(String, String)> = Vec::new();
    {
        let part = archive
            .by_name(WORKBOOK_PART)
            .map_err(|_| StreamError::InvalidWorkbook("missing workbook index".into()))?;
        let mut reader = Reader::from_reader(BufReader::new(part));
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                    let name = attr_value(&e, b"name").ok_or_else(|| {
                        StreamError::InvalidWorkbook("sheet entry without a name".into())
                    })?;
                    let rid = attr_value(&e, b"id").ok_or_else(|| {
                        StreamError::InvalidWorkbook(format!(
                            "sheet {name} has no relationship id"
                        ))
                    })?;
                    declared.push((name, rid));
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
    }
    if declared.is_empty() {
        return Err(StreamError::InvalidWorkbook(
            "workbook declares no sheets".into(),
        ));
    }

    // rId -> part path
    let mut targets: Vec<(String, String)> = Vec::new();
    {
        let part = archive
            .by_name(WORKBOOK_RELS_PART)
            .map_err(|_| StreamError::InvalidWorkbook("missing workbook relationships".into()))?;
        let mut reader = Reader::from_reader(BufReader::new(part));
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) | Event::Empty(e)
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    if let (Some(id), Some(target)) =
                        (attr_value(&e, b"Id"), attr_value(&e, b"Target"))
                    {
                        targets.push((id, normalize_target(&target)));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
    }

    declared
        .into_iter()
        .map(|(name, rid)| {
            let part_path = targets
                .iter()
                .find(|(id, _)| *id == rid)
                .map(|(_, t)| t.clone())
                .ok_or_else(|| {
                    StreamError::InvalidWorkbook(format!("sheet {name}: unresolved part {rid}"))
                })?;
            Ok(SheetEntry { name, part_path })
        })
        .collect()
}

/// Relationship targets are relative to `xl/` unless absolute.
fn normalize_target(target: &str) -> String {
    let t = target.trim_start_matches('/');
    if t.starts_with("xl/") {
        t.to_string()
    } else {
        format!("xl/{t}")
    }
}

fn read_shared_strings(
    archive: &mut ZipArchive<Box<dyn ReadSeek>>,
) -> Result<SharedStrings, StreamError> {
    let part = match archive.by_name(SHARED_STRINGS_PART) {
        Ok(p) => p,
        // A workbook with no string cells has no shared-strings part.
        Err(zip::result::ZipError::FileNotFound) => return Ok(SharedStrings::default()),
        Err(e) => return Err(e.into()),
    };

    let mut reader = Reader::from_reader(BufReader::new(part));
    let mut buf = Vec::new();
    let mut table = Vec::new();
    let mut current = String::new();
    let mut in_item = false;
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = true;
                    current.clear();
                }
                b"t" if in_item && !in_phonetic => in_text = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => table.push(String::new()),
            Event::Text(e) if in_text => current.push_str(&text_of(&e)?),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => {
                    in_item = false;
                    table.push(std::mem::take(&mut current));
                }
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    tracing::debug!(strings = table.len(), "loaded shared-strings table");
    Ok(SharedStrings(table))
}
