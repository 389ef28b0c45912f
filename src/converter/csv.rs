//! Built-in CSV converter.
//!
//! Row encoding and decoding is delegated to the `csv` crate. The stages here
//! only adapt it to chunked streaming:
//!
//! - serializing writes one chunk per record, with the header row prepended to
//!   the first chunk
//! - parsing accepts chunks split anywhere (including inside quoted fields),
//!   holding back the trailing partial row until the next chunk or `end()`

use ::csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use bytes::Bytes;
use serde_json::Value;

use super::{ConvertOptions, Converter, ParseStage, SerializeStage};
use crate::error::StreamError;
use crate::record::{value_to_cell, Record};
use crate::stage::Transform;

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Converter for comma-separated values.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvConverter;

impl Converter for CsvConverter {
    fn serialize(&self, options: &ConvertOptions) -> SerializeStage {
        Box::new(CsvSerializeStage::new(options))
    }

    fn parse(&self, options: &ConvertOptions) -> ParseStage {
        Box::new(CsvParseStage::new(options))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serialize
// ─────────────────────────────────────────────────────────────────────────────

/// Encodes flat records as CSV rows.
///
/// Missing fields encode as empty cells; fields not among the columns are
/// ignored.
pub struct CsvSerializeStage {
    delimiter: Result<u8, String>,
    columns: Option<Vec<String>>,
    header: bool,
    header_written: bool,
}

impl CsvSerializeStage {
    pub fn new(options: &ConvertOptions) -> Self {
        Self {
            delimiter: options.delimiter_byte().map_err(|e| e.to_string()),
            columns: options.columns.clone(),
            header: options.header,
            header_written: false,
        }
    }

    fn delimiter(&self) -> Result<u8, StreamError> {
        self.delimiter.clone().map_err(StreamError::Config)
    }

    fn encode<I, S>(&self, rows: I) -> Result<Bytes, StreamError>
    where
        I: IntoIterator<Item = Vec<S>>,
        S: AsRef<[u8]>,
    {
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter()?)
            .terminator(Terminator::Any(b'\n'))
            .has_headers(false)
            .from_writer(Vec::new());

        for row in rows {
            writer
                .write_record(row)
                .map_err(|e| StreamError::Serialization(e.to_string()))?;
        }

        let buf = writer
            .into_inner()
            .map_err(|e| StreamError::Serialization(e.error().to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn header_row(&mut self) -> Option<Vec<String>> {
        if self.header && !self.header_written {
            self.header_written = true;
            self.columns.clone()
        } else {
            None
        }
    }
}

impl Transform for CsvSerializeStage {
    type Input = Record;
    type Output = Bytes;

    fn write(&mut self, record: Record, out: &mut Vec<Bytes>) -> Result<(), StreamError> {
        if self.columns.is_none() {
            self.columns = Some(record.keys().cloned().collect());
        }

        let mut rows = Vec::with_capacity(2);
        if let Some(header) = self.header_row() {
            rows.push(header);
        }

        let columns = self.columns.as_deref().unwrap_or(&[]);
        let row: Vec<String> = columns
            .iter()
            .map(|column| record.get(column).map(value_to_cell).unwrap_or_default())
            .collect();
        rows.push(row);

        out.push(self.encode(rows)?);
        Ok(())
    }

    fn end(&mut self, out: &mut Vec<Bytes>) -> Result<(), StreamError> {
        // With explicit columns an empty input still yields the header row.
        if let Some(header) = self.header_row() {
            out.push(self.encode(vec![header])?);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "csv-serialize"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Parse
// ─────────────────────────────────────────────────────────────────────────────

/// Decodes CSV chunks into string-valued records keyed by the header row.
pub struct CsvParseStage {
    delimiter: Result<u8, String>,
    header_pending: bool,
    columns: Option<Vec<String>>,
    buffer: Vec<u8>,
    bom_checked: bool,
    in_quotes: bool,
    at_field_start: bool,
    quote_closed: bool,
    scan_pos: usize,
    rows_parsed: u64,
}

impl CsvParseStage {
    pub fn new(options: &ConvertOptions) -> Self {
        Self {
            delimiter: options.delimiter_byte().map_err(|e| e.to_string()),
            header_pending: options.header,
            columns: options.columns.clone(),
            buffer: Vec::new(),
            bom_checked: false,
            in_quotes: false,
            at_field_start: true,
            quote_closed: false,
            scan_pos: 0,
            rows_parsed: 0,
        }
    }

    fn strip_bom(&mut self, at_end: bool) {
        if self.bom_checked {
            return;
        }
        if self.buffer.len() < UTF8_BOM.len() && !at_end {
            return;
        }
        if self.buffer.starts_with(UTF8_BOM) {
            self.buffer.drain(..UTF8_BOM.len());
        }
        self.bom_checked = true;
    }

    /// Scans new bytes and returns the index just past the last row
    /// terminator that is outside quotes.
    ///
    /// A quote opens a quoted field only at the start of a field, or directly
    /// after a closing quote (an escaped `""`). Elsewhere it is literal, as the
    /// `csv` reader treats it.
    fn complete_rows_end(&mut self) -> Option<usize> {
        let delimiter = self.delimiter.as_ref().ok().copied();
        let mut boundary = None;
        for (offset, &byte) in self.buffer[self.scan_pos..].iter().enumerate() {
            if self.in_quotes {
                if byte == b'"' {
                    self.in_quotes = false;
                    self.quote_closed = true;
                }
                continue;
            }

            let opens_quote = byte == b'"' && (self.at_field_start || self.quote_closed);
            self.quote_closed = false;
            self.at_field_start = false;
            if opens_quote {
                self.in_quotes = true;
            } else if byte == b'\n' {
                boundary = Some(self.scan_pos + offset + 1);
                self.at_field_start = true;
            } else if Some(byte) == delimiter {
                self.at_field_start = true;
            }
        }
        self.scan_pos = self.buffer.len();
        boundary
    }

    /// Parses complete rows into `out`. Rows before a bad row are kept.
    fn parse_rows(&mut self, data: &[u8], out: &mut Vec<Record>) -> Result<(), StreamError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter.clone().map_err(StreamError::Config)?)
            .has_headers(false)
            .flexible(true)
            .from_reader(data);

        for row in reader.records() {
            let row = row?;
            if self.header_pending {
                self.header_pending = false;
                if self.columns.is_none() {
                    self.columns = Some(row.iter().map(str::to_string).collect());
                }
                continue;
            }
            if self.columns.is_none() {
                return Err(StreamError::CsvInvalid(
                    "Header row disabled but no columns configured".to_string(),
                ));
            }
            let record = self.to_record(&row)?;
            out.push(record);
        }
        Ok(())
    }

    fn to_record(&mut self, row: &StringRecord) -> Result<Record, StreamError> {
        self.rows_parsed += 1;
        let columns = self.columns.as_deref().unwrap_or(&[]);
        if row.len() != columns.len() {
            return Err(StreamError::CsvInvalid(format!(
                "Row {} has {} fields, expected {}",
                self.rows_parsed,
                row.len(),
                columns.len()
            )));
        }

        Ok(columns
            .iter()
            .zip(row.iter())
            .map(|(column, field)| (column.clone(), Value::String(field.to_string())))
            .collect())
    }
}

impl Transform for CsvParseStage {
    type Input = Bytes;
    type Output = Record;

    fn write(&mut self, chunk: Bytes, out: &mut Vec<Record>) -> Result<(), StreamError> {
        self.buffer.extend_from_slice(&chunk);
        self.strip_bom(false);
        if !self.bom_checked {
            return Ok(());
        }

        if let Some(end) = self.complete_rows_end() {
            let complete: Vec<u8> = self.buffer.drain(..end).collect();
            self.scan_pos -= end;
            self.parse_rows(&complete, out)?;
        }
        Ok(())
    }

    fn end(&mut self, out: &mut Vec<Record>) -> Result<(), StreamError> {
        self.strip_bom(true);
        self.complete_rows_end();
        if self.in_quotes {
            return Err(StreamError::CsvInvalid(
                "Input ended inside a quoted field".to_string(),
            ));
        }

        let remaining = std::mem::take(&mut self.buffer);
        self.scan_pos = 0;
        if remaining.is_empty() {
            return Ok(());
        }
        self.parse_rows(&remaining, out)
    }

    fn name(&self) -> &str {
        "csv-parse"
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
