//! Record stream → serialized byte stream.
//!
//! The record stream is piped into one composite stage: a map stage that
//! flattens each record (dropping `attributes`, substituting nulls) followed
//! by the converter's serialize stage.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::converter::{ConvertOptions, ConverterRegistry};
use crate::error::StreamError;
use crate::record::flatten_for_serialization;
use crate::stage::{self, Transform};
use crate::stream::RecordStream;

/// Serialized output of a record stream, as a stream of byte chunks.
pub struct SerializedStream {
    inner: BoxStream<'static, Result<Bytes, StreamError>>,
}

impl SerializedStream {
    /// Drains the stream into one buffer.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, StreamError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.inner.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }

    /// Writes every chunk to `writer`, waiting on the writer between chunks.
    ///
    /// Returns the number of bytes written.
    pub async fn write_to<W>(mut self, writer: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.inner.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(total)
    }
}

impl Stream for SerializedStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Serializes `stream` with the converter registered for `format` in the
/// process-wide registry.
///
/// # Errors
///
/// Returns `StreamError::UnsupportedFormat` if no converter is registered for
/// `format`. No stream is returned in that case.
pub fn as_serialized_stream(
    stream: RecordStream,
    format: &str,
    options: &ConvertOptions,
) -> Result<SerializedStream, StreamError> {
    as_serialized_stream_with(&ConverterRegistry::global(), stream, format, options)
}

/// Same as [`as_serialized_stream`] with an explicit registry.
pub fn as_serialized_stream_with(
    registry: &ConverterRegistry,
    stream: RecordStream,
    format: &str,
    options: &ConvertOptions,
) -> Result<SerializedStream, StreamError> {
    let converter = registry.require(format)?;

    let null_value = options.null_value.clone();
    let prepare = stage::map(move |record| {
        Some(flatten_for_serialization(record, null_value.as_deref()))
    });
    let composite = prepare.pipe(converter.serialize(options));

    info!("[STREAM] serializing records as {} ({})", format, composite.name());

    Ok(SerializedStream {
        inner: stream.pipe(composite),
    })
}

impl RecordStream {
    /// Serializes this stream using the process-wide registry.
    ///
    /// See [`as_serialized_stream`].
    pub fn serialize(
        self,
        format: &str,
        options: &ConvertOptions,
    ) -> Result<SerializedStream, StreamError> {
        as_serialized_stream(self, format, options)
    }
}
