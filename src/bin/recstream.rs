//! recstream - stream records between CSV files and Salesforce
//!
//! Subcommands:
//! - **convert**: parse a CSV file (or stdin), optionally filter and re-map
//!   each record, and serialize the result
//! - **query**: log in, stream the records of a SOQL query, and serialize them
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Configuration/argument error |
//! | 2 | Salesforce connection/authentication error |
//! | 3 | Input/output or data format error |
//! | 4 | Runtime error |

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use record_stream::config::StreamConfig;
use record_stream::record::value_to_cell;
use record_stream::session::{Credential, Session, SessionPool};
use record_stream::sink::AtomicFileSink;
use record_stream::{
    as_serialized_stream_with, ByteSink, ConvertOptions, ConverterRegistry, ParsableStream, Record,
    RecordStream, StreamError, DEFAULT_FORMAT,
};

/// Exit code for success
const EXIT_SUCCESS: u8 = 0;
/// Exit code for configuration/argument errors
const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection/authentication errors
const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for file I/O and data format errors
const EXIT_IO_ERROR: u8 = 3;
/// Exit code for runtime errors
const EXIT_RUNTIME_ERROR: u8 = 4;

/// Bytes read from the input per chunk.
const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "recstream")]
#[command(about = "Stream records between CSV files and Salesforce")]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse, filter, re-map, and re-serialize a CSV file
    Convert(ConvertArgs),
    /// Stream a SOQL query to CSV
    Query(QueryArgs),
}

/// Output settings shared by both subcommands.
#[derive(Args, Debug, Default)]
struct OutputArgs {
    /// Output file (stdout when omitted). Written atomically.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(long)]
    format: Option<String>,

    /// Token written for null fields
    #[arg(long)]
    null_value: Option<String>,

    /// Field delimiter
    #[arg(long)]
    delimiter: Option<char>,

    /// Map a field from a template, e.g. `--map 'Greeting=Hello ${Name}'`
    #[arg(long = "map", value_name = "FIELD=TEMPLATE")]
    mappings: Vec<String>,

    /// Copy mapping templates verbatim
    #[arg(long)]
    raw: bool,

    /// Keep only records whose field equals the value, e.g. `--where Status=Active`
    #[arg(long = "where", value_name = "FIELD=VALUE")]
    filters: Vec<String>,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input CSV file (stdin when omitted or `-`)
    #[arg(short, long)]
    input: Option<PathBuf>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// SOQL query to run
    #[arg(long)]
    soql: String,

    /// Username (overrides configured credentials)
    #[arg(long)]
    username: Option<String>,

    /// Password for --username
    #[arg(long, env = "SF_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Login endpoint, e.g. https://test.salesforce.com
    #[arg(long)]
    login_url: Option<String>,

    /// Connected app client id
    #[arg(long, env = "SF_CLIENT_ID")]
    client_id: Option<String>,

    #[command(flatten)]
    output: OutputArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            print_error(&e);
            ExitCode::from(error_to_exit_code(&e))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<(), StreamError> {
    let config = match &cli.config {
        Some(path) => StreamConfig::from_json_file(path)?,
        None => StreamConfig::default(),
    };

    match cli.command {
        Command::Convert(args) => run_convert(config, args).await,
        Command::Query(args) => run_query(config, args).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// convert
// ─────────────────────────────────────────────────────────────────────────────

async fn run_convert(config: StreamConfig, args: ConvertArgs) -> Result<(), StreamError> {
    let registry = ConverterRegistry::global();
    let config = apply_output_overrides(config, &args.output)?;
    config.validate(&registry)?;

    let reader: Box<dyn AsyncRead + Unpin + Send> =
        match args.input.filter(|p| p.as_os_str() != "-") {
            Some(path) => Box::new(tokio::fs::File::open(&path).await?),
            None => Box::new(tokio::io::stdin()),
        };

    let parse_options = ConvertOptions::default().delimiter(config.convert.delimiter);
    let mut parsable = ParsableStream::with_registry(Arc::clone(&registry));
    let sink = parsable.as_parsed_stream(DEFAULT_FORMAT, &parse_options)?;
    let records = parsable.subscribe_to_records()?;
    drop(parsable);

    let feeder = tokio::spawn(feed(reader, sink));

    let records = shape_records(records, &config, &args.output)?;
    let written = write_output(&registry, records, &config, args.output.output.as_deref()).await;
    let fed = feeder
        .await
        .map_err(|e| StreamError::Internal(format!("Input task failed: {}", e)))?;

    written?;
    fed
}

/// Copies `reader` into `sink` chunk by chunk, then ends the sink.
async fn feed<R>(mut reader: R, sink: ByteSink) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut total = 0usize;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write(Bytes::copy_from_slice(&buf[..n])).await?;
        total += n;
    }
    sink.end();
    info!("[STREAM] read {} byte(s) of input", total);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// query
// ─────────────────────────────────────────────────────────────────────────────

async fn run_query(config: StreamConfig, args: QueryArgs) -> Result<(), StreamError> {
    let registry = ConverterRegistry::global();
    let mut config = apply_output_overrides(config, &args.output)?;
    config.validate(&registry)?;

    if let Some(login_url) = args.login_url {
        config.session.login_url = login_url;
    }
    if let Some(client_id) = args.client_id {
        config.session.client_id = client_id;
    }
    if let Some(username) = args.username {
        let password = args.password.ok_or_else(|| {
            StreamError::Config("--username requires SF_PASSWORD or --password".to_string())
        })?;
        config.credentials = vec![Credential::new(username, password)];
    }

    let pool = SessionPool::new(config.credentials.clone(), &config.session)?;
    let session = pool.acquire().await?;

    let records = shape_records(session.query(&args.soql), &config, &args.output)?;
    let written = write_output(&registry, records, &config, args.output.output.as_deref()).await;

    if let Err(e) = pool.logout_all().await {
        warn!("[POOL] Logout after query failed: {}", e);
    }
    written
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared pipeline pieces
// ─────────────────────────────────────────────────────────────────────────────

fn apply_output_overrides(
    mut config: StreamConfig,
    args: &OutputArgs,
) -> Result<StreamConfig, StreamError> {
    if let Some(format) = &args.format {
        config.format = format.clone();
    }
    if let Some(token) = &args.null_value {
        config.convert.null_value = Some(token.clone());
    }
    if let Some(delimiter) = args.delimiter {
        config.convert.delimiter = delimiter;
    }
    if !args.mappings.is_empty() {
        let mut template = Record::new();
        for mapping in &args.mappings {
            let (field, value) = parse_assignment(mapping, "--map")?;
            template.insert(field, Value::String(value));
        }
        config.mapping = Some(template);
    }
    if args.raw {
        config.raw_mapping = true;
    }
    Ok(config)
}

/// Attaches the `--where` filters, then the field mapping.
fn shape_records(
    records: RecordStream,
    config: &StreamConfig,
    args: &OutputArgs,
) -> Result<RecordStream, StreamError> {
    let filters = args
        .filters
        .iter()
        .map(|f| parse_assignment(f, "--where"))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = records;
    if !filters.is_empty() {
        records = records.filter(move |record| {
            filters.iter().all(|(field, expected)| {
                value_to_cell(record.get(field).unwrap_or(&Value::Null)) == *expected
            })
        });
    }
    if let Some(template) = &config.mapping {
        records = records.field_map(template.clone(), config.raw_mapping);
    }
    Ok(records)
}

async fn write_output(
    registry: &ConverterRegistry,
    records: RecordStream,
    config: &StreamConfig,
    output: Option<&Path>,
) -> Result<(), StreamError> {
    let serialized = as_serialized_stream_with(registry, records, &config.format, &config.convert)?;

    match output {
        Some(path) => {
            AtomicFileSink::new(path)?.write_stream(serialized).await?;
        }
        None => {
            serialized.write_to(&mut tokio::io::stdout()).await?;
        }
    }
    Ok(())
}

/// Splits `FIELD=VALUE`.
fn parse_assignment(raw: &str, flag: &str) -> Result<(String, String), StreamError> {
    match raw.split_once('=') {
        Some((field, value)) if !field.trim().is_empty() => {
            Ok((field.trim().to_string(), value.to_string()))
        }
        _ => Err(StreamError::Config(format!(
            "{} expects FIELD=VALUE, got '{}'",
            flag, raw
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error reporting
// ─────────────────────────────────────────────────────────────────────────────

fn print_error(error: &StreamError) {
    let presentation = error.to_presentation();
    eprintln!("Error: {}", presentation.title);
    eprintln!("  {}", presentation.message);
    if let Some(action) = presentation.action {
        eprintln!("  Hint: {}", action);
    }
}

fn error_to_exit_code(error: &StreamError) -> u8 {
    match error {
        StreamError::UnsupportedFormat(_) | StreamError::Config(_) | StreamError::NoCredentials => {
            EXIT_CONFIG_ERROR
        }
        StreamError::NotAuthenticated
        | StreamError::SessionExpired
        | StreamError::LoginFailed(_)
        | StreamError::SalesforceError(_)
        | StreamError::RateLimited { .. }
        | StreamError::ConnectionFailed(_) => EXIT_CONNECTION_ERROR,
        StreamError::Io(_) | StreamError::CsvInvalid(_) | StreamError::Serialization(_) => {
            EXIT_IO_ERROR
        }
        StreamError::StageFailed { .. }
        | StreamError::Closed
        | StreamError::AlreadySubscribed
        | StreamError::Cancelled
        | StreamError::Internal(_) => EXIT_RUNTIME_ERROR,
    }
}
