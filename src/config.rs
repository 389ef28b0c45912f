//! Pipeline configuration loaded from a JSON file.
//!
//! ```json
//! {
//!   "format": "csv",
//!   "nullValue": "#N/A",
//!   "delimiter": ";",
//!   "mapping": { "AccountName": "${Name}", "Source": "import" },
//!   "session": { "loginUrl": "https://test.salesforce.com", "clientId": "3MVG9..." },
//!   "credentials": [{ "username": "integration@example.com", "password": "..." }]
//! }
//! ```
//!
//! Every field is optional. Command-line flags override file values.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::converter::{ConvertOptions, ConverterRegistry, DEFAULT_FORMAT};
use crate::error::StreamError;
use crate::record::Record;
use crate::session::{Credential, SessionSettings};

/// Settings for one `recstream` run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Converter format name.
    pub format: String,
    /// Options handed to the converter.
    #[serde(flatten)]
    pub convert: ConvertOptions,
    /// Field mapping template applied to every record.
    pub mapping: Option<Record>,
    /// Copy template values verbatim instead of evaluating placeholders.
    pub raw_mapping: bool,
    pub session: SessionSettings,
    pub credentials: Vec<Credential>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT.to_string(),
            convert: ConvertOptions::default(),
            mapping: None,
            raw_mapping: false,
            session: SessionSettings::default(),
            credentials: Vec::new(),
        }
    }
}

impl StreamConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// - `StreamError::Io` if the file cannot be opened
    /// - `StreamError::Config` if it is not valid configuration JSON
    pub fn from_json_file(path: &Path) -> Result<Self, StreamError> {
        let file = File::open(path)?;
        let config: StreamConfig = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            StreamError::Config(format!("Invalid configuration in {}: {}", path.display(), e))
        })?;

        debug!("[STREAM] loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks that the configured format is registered and the delimiter is
    /// usable.
    pub fn validate(&self, registry: &ConverterRegistry) -> Result<(), StreamError> {
        registry.require(&self.format)?;
        self.convert.delimiter_byte()?;
        Ok(())
    }
}
