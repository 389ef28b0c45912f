//! Record streams between Salesforce record APIs and row formats.
//!
//! - [`RecordStream`]: lazy stream of records with `map` / `filter` stages
//! - [`as_serialized_stream`]: records → bytes through a registered converter
//! - [`ParsableStream`]: bytes → records, with deferred activation
//! - [`session`]: Salesforce login, paged queries, and a session pool

pub mod config;
pub mod converter;
pub mod error;
pub mod parsable;
pub mod record;
pub mod serializable;
pub mod session;
pub mod sink;
pub mod stage;
pub mod stream;

pub use converter::{ConvertOptions, Converter, ConverterRegistry, DEFAULT_FORMAT};
pub use error::{ErrorPresentation, StreamError};
pub use parsable::{as_parsed_stream, ByteSink, ParsableStream};
pub use record::Record;
pub use serializable::{as_serialized_stream, as_serialized_stream_with, SerializedStream};
pub use stage::Transform;
pub use stream::{RecordStream, RecordWriter};
