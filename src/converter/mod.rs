//! Converters between records and serialized bytes.
//!
//! A converter is a named pair of stage factories: `serialize` turns records
//! into byte chunks, `parse` turns byte chunks back into records. Converters
//! are registered by format name in a `ConverterRegistry`; the process-wide
//! registry is built once with the built-in formats and is read-only after.

mod csv;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StreamError;
use crate::record::Record;
use crate::stage::Transform;

pub use self::csv::{CsvConverter, CsvParseStage, CsvSerializeStage};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Format used when the caller does not name one.
pub const DEFAULT_FORMAT: &str = "csv";

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Options shared by the serialize and parse sides of a converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConvertOptions {
    /// Token written in place of fields that are exactly null.
    pub null_value: Option<String>,
    /// Field delimiter. Must be a single ASCII character.
    pub delimiter: char,
    /// Explicit column order. When unset, columns come from the first record
    /// (serialize) or the header row (parse).
    pub columns: Option<Vec<String>>,
    /// Whether a header row is written (serialize) or expected (parse).
    pub header: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            null_value: None,
            delimiter: ',',
            columns: None,
            header: true,
        }
    }
}

impl ConvertOptions {
    /// Sets the null replacement token.
    pub fn null_value(mut self, token: impl Into<String>) -> Self {
        self.null_value = Some(token.into());
        self
    }

    /// Sets the field delimiter.
    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Sets an explicit column order.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Enables or disables the header row.
    pub fn header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    /// Returns the delimiter as a byte.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Config` if the delimiter is not ASCII.
    pub fn delimiter_byte(&self) -> Result<u8, StreamError> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            Err(StreamError::Config(format!(
                "Delimiter must be a single ASCII character, got '{}'",
                self.delimiter
            )))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Converter
// ─────────────────────────────────────────────────────────────────────────────

/// Stage turning records into serialized chunks.
pub type SerializeStage = Box<dyn Transform<Input = Record, Output = Bytes> + Send>;

/// Stage turning serialized chunks into records.
pub type ParseStage = Box<dyn Transform<Input = Bytes, Output = Record> + Send>;

/// A named pair of stage factories for one serialization format.
pub trait Converter: Send + Sync {
    /// Creates a fresh serializing stage.
    fn serialize(&self, options: &ConvertOptions) -> SerializeStage;

    /// Creates a fresh parsing stage.
    fn parse(&self, options: &ConvertOptions) -> ParseStage;
}

// ─────────────────────────────────────────────────────────────────────────────
// ConverterRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// Converters indexed by format name (case-insensitive).
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in converters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_FORMAT, CsvConverter);
        registry
    }

    /// Returns the process-wide registry.
    pub fn global() -> Arc<ConverterRegistry> {
        static GLOBAL: OnceLock<Arc<ConverterRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ConverterRegistry::with_builtins())))
    }

    /// Registers `converter` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, converter: impl Converter + 'static) {
        debug!("[STREAM] registering converter '{}'", name);
        self.converters
            .insert(name.to_ascii_lowercase(), Arc::new(converter));
    }

    /// Looks up the converter registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.converters.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Looks up `name`, failing with a descriptive error when absent.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::UnsupportedFormat` naming the requested format.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Converter>, StreamError> {
        self.lookup(name)
            .ok_or_else(|| StreamError::UnsupportedFormat(name.to_string()))
    }

    /// Registered format names, sorted.
    pub fn formats(&self) -> Vec<String> {
        let mut names: Vec<String> = self.converters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_registry_has_csv() {
        let registry = ConverterRegistry::global();
        assert!(registry.lookup("csv").is_some());
        assert!(registry.lookup("CSV").is_some());
        assert_eq!(registry.formats(), vec!["csv".to_string()]);
    }

    #[test]
    fn lookup_unknown_is_absent() {
        assert!(ConverterRegistry::global().lookup("xml").is_none());
    }

    #[test]
    fn require_unknown_names_format() {
        let err = ConverterRegistry::new().require("xml").err().expect("xml is not registered");
        assert!(matches!(&err, StreamError::UnsupportedFormat(name) if name == "xml"));
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn register_adds_format() {
        let mut registry = ConverterRegistry::new();
        registry.register("tsv", CsvConverter);
        assert!(registry.require("tsv").is_ok());
        assert!(registry.lookup("csv").is_none());
    }

    #[test]
    fn options_builder_and_defaults() {
        let options = ConvertOptions::default()
            .null_value("#N/A")
            .delimiter(';')
            .columns(["Id", "Name"])
            .header(false);

        assert_eq!(options.null_value.as_deref(), Some("#N/A"));
        assert_eq!(options.delimiter_byte().unwrap(), b';');
        assert_eq!(options.columns, Some(vec!["Id".to_string(), "Name".to_string()]));
        assert!(!options.header);
        assert!(ConvertOptions::default().header);
    }

    #[test]
    fn non_ascii_delimiter_is_rejected() {
        let options = ConvertOptions::default().delimiter('§');
        assert!(matches!(options.delimiter_byte(), Err(StreamError::Config(_))));
    }

    #[test]
    fn options_deserialize_camel_case_with_defaults() {
        let options: ConvertOptions =
            serde_json::from_str(r##"{ "nullValue": "#N/A", "delimiter": "\t" }"##).unwrap();
        assert_eq!(options.null_value.as_deref(), Some("#N/A"));
        assert_eq!(options.delimiter, '\t');
        assert!(options.header);
        assert!(options.columns.is_none());
    }
}
