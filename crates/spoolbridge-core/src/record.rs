//! # Catalog Record Codec
//!
//! Parser and serializer for the Device's delimited catalog format.
//!
//! ## Wire Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Catalog Document                                  │
//! │                                                                         │
//! │  tag_id,material,brand,color_name,...          ◄── header names fields  │
//! │  04A3B2C1D5E6F7,PLA,Bambu,Red,...              ◄── one record per line  │
//! │  11FFEEDDCCBBAA,PETG,"Prusa, s.r.o.",Black,...                          │
//! │                                                                         │
//! │  ESCAPE DISCIPLINE                                                      │
//! │  ─────────────────                                                      │
//! │  • Fields containing , " or a newline are wrapped in double quotes      │
//! │  • Embedded quotes are doubled: he said "hi"  →  "he said ""hi"""       │
//! │  • Quoted fields may span lines; line numbers track the record start    │
//! │                                                                         │
//! │  FAILURE ISOLATION                                                      │
//! │  ─────────────────                                                      │
//! │  A malformed record fails with RecordParseError { line, reason } and    │
//! │  the rest of the batch still parses. Header problems abort the whole    │
//! │  document (CodecError).                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Header field names are firmware-defined protocol constants, not
//! configuration. Column order is taken from the header, never assumed.

use std::borrow::Cow;
use std::iter::Peekable;
use std::str::Chars;

use crate::error::{CodecError, RecordParseError};
use crate::types::DeviceRecord;

// =============================================================================
// Protocol Constants
// =============================================================================

pub const FIELD_TAG_ID: &str = "tag_id";
pub const FIELD_MATERIAL: &str = "material";
pub const FIELD_BRAND: &str = "brand";
pub const FIELD_COLOR_NAME: &str = "color_name";
pub const FIELD_COLOR_HEX: &str = "color_hex";
pub const FIELD_NOMINAL_WEIGHT: &str = "nominal_weight_g";
pub const FIELD_EMPTY_WEIGHT: &str = "empty_weight_g";
pub const FIELD_REMAINING: &str = "remaining_g";
pub const FIELD_SPOOL_ID: &str = "spool_id";

/// Canonical column order used when serializing. Parsing does not rely on
/// this order; it maps columns through the header line.
pub const CATALOG_FIELDS: [&str; 9] = [
    FIELD_TAG_ID,
    FIELD_MATERIAL,
    FIELD_BRAND,
    FIELD_COLOR_NAME,
    FIELD_COLOR_HEX,
    FIELD_NOMINAL_WEIGHT,
    FIELD_EMPTY_WEIGHT,
    FIELD_REMAINING,
    FIELD_SPOOL_ID,
];

// =============================================================================
// Scanner
// =============================================================================

/// Tokenizes the document into raw records, honoring the quote discipline.
struct Scanner<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Scanner {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    /// Reads the next raw record, or `None` at end of input.
    ///
    /// Returns the fields plus the 1-based line number the record started on.
    fn next_record(&mut self) -> Result<Option<(Vec<String>, usize)>, RecordParseError> {
        if self.chars.peek().is_none() {
            return Ok(None);
        }
        let start_line = self.line;
        let mut fields = Vec::new();
        let mut field = String::new();

        loop {
            match self.chars.next() {
                None => {
                    fields.push(field);
                    return Ok(Some((fields, start_line)));
                }
                Some('\n') => {
                    self.line += 1;
                    fields.push(field);
                    return Ok(Some((fields, start_line)));
                }
                Some('\r') => {
                    if self.chars.peek() == Some(&'\n') {
                        self.chars.next();
                    }
                    self.line += 1;
                    fields.push(field);
                    return Ok(Some((fields, start_line)));
                }
                Some(',') => fields.push(std::mem::take(&mut field)),
                Some('"') if field.is_empty() => self.read_quoted(&mut field, start_line)?,
                Some(c) => field.push(c),
            }
        }
    }

    /// Consumes a quoted section into `field`, handling doubled quotes.
    fn read_quoted(&mut self, field: &mut String, start_line: usize) -> Result<(), RecordParseError> {
        loop {
            match self.chars.next() {
                None => {
                    return Err(RecordParseError::new(start_line, "unterminated quoted field"))
                }
                Some('"') => {
                    if self.chars.peek() == Some(&'"') {
                        self.chars.next();
                        field.push('"');
                    } else {
                        return Ok(());
                    }
                }
                Some('\n') => {
                    self.line += 1;
                    field.push('\n');
                }
                Some(c) => field.push(c),
            }
        }
    }
}

// =============================================================================
// Column Map
// =============================================================================

/// Column indices resolved from the header line.
#[derive(Debug, Clone, Copy)]
struct Columns {
    tag_id: usize,
    material: usize,
    brand: usize,
    color_name: usize,
    color_hex: usize,
    nominal_weight: usize,
    empty_weight: usize,
    remaining: usize,
    spool_id: usize,
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self, CodecError> {
        let find = |name: &str| {
            header
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| CodecError::MissingColumn(name.to_string()))
        };
        Ok(Columns {
            tag_id: find(FIELD_TAG_ID)?,
            material: find(FIELD_MATERIAL)?,
            brand: find(FIELD_BRAND)?,
            color_name: find(FIELD_COLOR_NAME)?,
            color_hex: find(FIELD_COLOR_HEX)?,
            nominal_weight: find(FIELD_NOMINAL_WEIGHT)?,
            empty_weight: find(FIELD_EMPTY_WEIGHT)?,
            remaining: find(FIELD_REMAINING)?,
            spool_id: find(FIELD_SPOOL_ID)?,
        })
    }
}

// =============================================================================
// Record Reader
// =============================================================================

/// Lazy catalog parser.
///
/// Construction consumes the header line and fails on header problems.
/// Iteration yields one result per record; a malformed record does not
/// abort the batch.
///
/// ## Usage
/// ```rust
/// use spoolbridge_core::record::RecordReader;
///
/// let doc = "tag_id,material,brand,color_name,color_hex,\
///            nominal_weight_g,empty_weight_g,remaining_g,spool_id\n\
///            A1,PLA,Bambu,Red,FF0000,1000,250,800,3\n";
/// let reader = RecordReader::new(doc).unwrap();
/// let records: Vec<_> = reader.filter_map(Result::ok).collect();
/// assert_eq!(records[0].tag_id, "A1");
/// ```
pub struct RecordReader<'a> {
    scanner: Scanner<'a>,
    columns: Columns,
}

impl<'a> RecordReader<'a> {
    /// Creates a reader over a catalog document, consuming the header.
    pub fn new(input: &'a str) -> Result<Self, CodecError> {
        let mut scanner = Scanner::new(input);
        let header = loop {
            match scanner.next_record() {
                Ok(None) => return Err(CodecError::EmptyDocument),
                Ok(Some((fields, _))) if fields.len() == 1 && fields[0].is_empty() => continue,
                Ok(Some((fields, _))) => break fields,
                Err(e) => return Err(CodecError::MalformedHeader(e.reason)),
            }
        };
        let columns = Columns::from_header(&header)?;
        Ok(RecordReader { scanner, columns })
    }

    fn parse_record(
        &self,
        fields: &[String],
        line: usize,
    ) -> Result<DeviceRecord, RecordParseError> {
        let get = |idx: usize, name: &str| -> Result<&str, RecordParseError> {
            fields
                .get(idx)
                .map(String::as_str)
                .ok_or_else(|| RecordParseError::new(line, format!("missing field '{name}'")))
        };

        let cols = self.columns;
        Ok(DeviceRecord {
            tag_id: get(cols.tag_id, FIELD_TAG_ID)?.to_string(),
            material: get(cols.material, FIELD_MATERIAL)?.to_string(),
            brand: get(cols.brand, FIELD_BRAND)?.to_string(),
            color_name: get(cols.color_name, FIELD_COLOR_NAME)?.to_string(),
            color_hex: parse_color_hex(get(cols.color_hex, FIELD_COLOR_HEX)?, line)?,
            nominal_weight_g: parse_weight(
                get(cols.nominal_weight, FIELD_NOMINAL_WEIGHT)?,
                FIELD_NOMINAL_WEIGHT,
                line,
            )?,
            empty_weight_g: parse_weight(
                get(cols.empty_weight, FIELD_EMPTY_WEIGHT)?,
                FIELD_EMPTY_WEIGHT,
                line,
            )?,
            remaining_g: parse_weight(get(cols.remaining, FIELD_REMAINING)?, FIELD_REMAINING, line)?,
            device_spool_id: get(cols.spool_id, FIELD_SPOOL_ID)?
                .parse()
                .map_err(|_| RecordParseError::new(line, format!("invalid {FIELD_SPOOL_ID}")))?,
        })
    }
}

impl Iterator for RecordReader<'_> {
    type Item = Result<DeviceRecord, RecordParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.scanner.next_record() {
                Ok(None) => return None,
                Ok(Some((fields, _))) if fields.len() == 1 && fields[0].is_empty() => continue,
                Ok(Some((fields, line))) => return Some(self.parse_record(&fields, line)),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// =============================================================================
// Field Parsers
// =============================================================================

fn parse_weight(raw: &str, name: &str, line: usize) -> Result<f64, RecordParseError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| RecordParseError::new(line, format!("invalid {name}: '{raw}'")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(RecordParseError::new(
            line,
            format!("{name} must be a non-negative finite number, got '{raw}'"),
        ));
    }
    Ok(value)
}

/// Empty means no color. Older firmware sends 8-hex RGBA; the alpha byte
/// is dropped to the 6-hex RGB the Inventory expects.
fn parse_color_hex(raw: &str, line: usize) -> Result<Option<String>, RecordParseError> {
    if raw.is_empty() {
        return Ok(None);
    }
    if !raw.bytes().all(|b| b.is_ascii_hexdigit()) || !matches!(raw.len(), 6 | 8) {
        return Err(RecordParseError::new(
            line,
            format!("invalid {FIELD_COLOR_HEX}: '{raw}'"),
        ));
    }
    Ok(Some(raw[..6].to_string()))
}

// =============================================================================
// Serializer
// =============================================================================

/// Serializes a full catalog document, header included.
///
/// Inverse of [`RecordReader`]: `parse(write_catalog(&records))` yields the
/// same records.
pub fn write_catalog(records: &[DeviceRecord]) -> String {
    let mut out = String::new();
    out.push_str(&CATALOG_FIELDS.join(","));
    out.push('\n');
    for record in records {
        write_record(&mut out, record);
    }
    out
}

fn write_record(out: &mut String, record: &DeviceRecord) {
    let fields = [
        escape_field(&record.tag_id),
        escape_field(&record.material),
        escape_field(&record.brand),
        escape_field(&record.color_name),
        escape_field(record.color_hex.as_deref().unwrap_or("")),
        Cow::Owned(record.nominal_weight_g.to_string()),
        Cow::Owned(record.empty_weight_g.to_string()),
        Cow::Owned(record.remaining_g.to_string()),
        Cow::Owned(record.device_spool_id.to_string()),
    ];
    out.push_str(&fields.join(","));
    out.push('\n');
}

fn escape_field(raw: &str) -> Cow<'_, str> {
    if raw.contains(['"', ',', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(raw)
    }
}
