//! Atomic file sink for serialized output.
//!
//! Writes to a temporary file in the same directory as the destination,
//! then atomically replaces the destination on `finish()`. If dropped
//! before finishing, the temporary file is removed.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::serializable::SerializedStream;

/// Serialized bytes gathered before each blocking file write.
const WRITE_BATCH_BYTES: usize = 64 * 1024;

/// A destination file that only appears once fully written.
///
/// `write_chunk` and `finish` do blocking file I/O; from async code prefer
/// `write_stream`, which moves that work onto the blocking pool.
pub struct AtomicFileSink {
    writer: BufWriter<NamedTempFile>,
    final_path: PathBuf,
    bytes_written: u64,
}

impl AtomicFileSink {
    /// Creates a sink targeting `final_path`.
    ///
    /// The temporary file is created in the same directory as `final_path`
    /// so that persisting it is a rename on one filesystem.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Io` if the parent directory cannot be determined
    /// or the temporary file cannot be created.
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let final_path = final_path.as_ref().to_path_buf();

        let parent_dir = match final_path.parent() {
            Some(dir) if dir.as_os_str().is_empty() => Path::new("."),
            Some(dir) => dir,
            None => {
                return Err(StreamError::Io(format!(
                    "Cannot determine parent directory for: {}",
                    final_path.display()
                )))
            }
        };

        let temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|e| StreamError::Io(format!("Failed to create temporary file: {}", e)))?;
        debug!("[STREAM] staging output for {}", final_path.display());

        Ok(Self {
            writer: BufWriter::new(temp_file),
            final_path,
            bytes_written: 0,
        })
    }

    /// Appends one chunk.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
        self.writer.write_all(chunk)?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Drains `stream` into the file and persists it.
    ///
    /// Chunks are gathered into batches of `WRITE_BATCH_BYTES`; file writes,
    /// the final flush and the rename run on the blocking pool. On a stream
    /// error the temporary file is removed and the destination is left
    /// untouched.
    pub async fn write_stream(self, mut stream: SerializedStream) -> Result<PathBuf, StreamError> {
        let mut sink = self;
        let mut batch = Vec::with_capacity(WRITE_BATCH_BYTES);

        while let Some(chunk) = stream.next().await {
            batch.extend_from_slice(&chunk?);
            if batch.len() >= WRITE_BATCH_BYTES {
                sink = sink.write_blocking(std::mem::take(&mut batch)).await?;
            }
        }
        if !batch.is_empty() {
            sink = sink.write_blocking(batch).await?;
        }

        tokio::task::spawn_blocking(move || sink.finish())
            .await
            .map_err(|e| StreamError::Internal(format!("Task join error: {}", e)))?
    }

    async fn write_blocking(mut self, batch: Vec<u8>) -> Result<Self, StreamError> {
        tokio::task::spawn_blocking(move || {
            self.write_chunk(&batch)?;
            Ok(self)
        })
        .await
        .map_err(|e| StreamError::Internal(format!("Task join error: {}", e)))?
    }

    /// Flushes all buffers and atomically persists the file to the final path.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Io` if flushing or persisting fails. The
    /// temporary file is removed in that case.
    pub fn finish(self) -> Result<PathBuf, StreamError> {
        let named_temp = self
            .writer
            .into_inner()
            .map_err(|e| StreamError::Io(format!("Failed to flush buffer: {}", e.error())))?;

        named_temp.persist(&self.final_path).map_err(|e| {
            StreamError::Io(format!(
                "Failed to persist file to {}: {}",
                self.final_path.display(),
                e.error
            ))
        })?;

        info!(
            "[STREAM] wrote {} byte(s) to {}",
            self.bytes_written,
            self.final_path.display()
        );
        Ok(self.final_path)
    }
}
