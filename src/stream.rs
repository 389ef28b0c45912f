//! Record streams.
//!
//! `RecordStream` is the base channel of the pipeline: a lazy, pull-based
//! stream of records that passes records through unchanged until stages are
//! attached. Attaching a stage returns a new chain head, so repeated calls
//! build a linear pipeline. Backpressure is implicit: a stage only runs when
//! the consumer pulls, and the writable side (`RecordWriter`) suspends on a
//! bounded channel when the consumer falls behind.
//!
//! The first error on a stream ends it. Nothing is retried.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StreamError;
use crate::record::Record;
use crate::stage::{self, Transform};

// ─────────────────────────────────────────────────────────────────────────────
// Piping
// ─────────────────────────────────────────────────────────────────────────────

struct PipeState<S, T: Transform> {
    input: Option<S>,
    stage: T,
    pending: VecDeque<T::Output>,
    failure: Option<StreamError>,
}

/// Runs every item of `input` through `stage`, lazily.
///
/// Outputs are yielded in order. When the input or the stage fails, the
/// outputs produced so far are yielded first, then the error once, and the
/// stream ends. The input is dropped at that point. When the input ends the
/// stage is flushed with `end()`.
pub fn pipe_stage<S, T>(input: S, stage: T) -> BoxStream<'static, Result<T::Output, StreamError>>
where
    S: Stream<Item = Result<T::Input, StreamError>> + Send + Unpin + 'static,
    T: Transform + Send + 'static,
    T::Input: Send + 'static,
    T::Output: Send + 'static,
{
    let state = PipeState {
        input: Some(input),
        stage,
        pending: VecDeque::new(),
        failure: None,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(out) = st.pending.pop_front() {
                return Some((Ok(out), st));
            }
            if let Some(e) = st.failure.take() {
                return Some((Err(e), st));
            }
            let input = st.input.as_mut()?;

            let next = input.next().await;
            let mut batch = Vec::new();
            let result = match next {
                Some(Ok(item)) => st.stage.write(item, &mut batch),
                Some(Err(e)) => Err(e),
                None => {
                    st.input = None;
                    st.stage.end(&mut batch)
                }
            };
            st.pending.extend(batch);

            if let Err(e) = result {
                debug!("[STREAM] stage '{}' failed, halting pipeline", st.stage.name());
                st.input = None;
                st.failure = Some(e);
            }
        }
    })
    .boxed()
}

/// Ends the wrapped stream right after its first error, dropping the source
/// so upstream writers observe `Closed` instead of waiting on a consumer
/// that will never pull again.
struct HaltOnError {
    source: Option<BoxStream<'static, Result<Record, StreamError>>>,
}

impl Stream for HaltOnError {
    type Item = Result<Record, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(source) = self.source.as_mut() else {
            return Poll::Ready(None);
        };

        let item = ready!(source.poll_next_unpin(cx));
        if !matches!(item, Some(Ok(_))) {
            self.source = None;
        }
        Poll::Ready(item)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStream
// ─────────────────────────────────────────────────────────────────────────────

/// A stream of records with chainable map/filter stages.
pub struct RecordStream {
    inner: BoxStream<'static, Result<Record, StreamError>>,
}

impl RecordStream {
    /// Wraps any stream of record results. The wrapped stream ends after its
    /// first error.
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Record, StreamError>> + Send + 'static,
    {
        let halting = HaltOnError {
            source: Some(source.boxed()),
        };
        Self {
            inner: halting.boxed(),
        }
    }

    /// A stream yielding the given records, then ending.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: Send + 'static,
    {
        Self {
            inner: stream::iter(records.into_iter().map(Ok)).boxed(),
        }
    }

    /// A stream that ends immediately.
    pub fn empty() -> Self {
        Self {
            inner: stream::empty().boxed(),
        }
    }

    /// Creates a record channel: a writable side and the stream it feeds.
    ///
    /// `write` suspends once `capacity` records are waiting, until the stream
    /// is pulled again. The stream ends when every writer is dropped or ended.
    pub fn channel(capacity: usize) -> (RecordWriter, RecordStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (RecordWriter { tx }, RecordStream::from_receiver(rx))
    }

    /// Wraps the receiving half of a record channel.
    fn from_receiver(rx: mpsc::Receiver<Result<Record, StreamError>>) -> Self {
        let source = stream::unfold(rx, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        });
        RecordStream::new(source)
    }

    /// Attaches `stage` downstream and returns its output stream.
    pub fn pipe<T>(self, stage: T) -> BoxStream<'static, Result<T::Output, StreamError>>
    where
        T: Transform<Input = Record> + Send + 'static,
        T::Output: Send + 'static,
    {
        pipe_stage(self.inner, stage)
    }

    /// Attaches a record-to-record stage and returns the new chain head.
    pub fn through<T>(self, stage: T) -> RecordStream
    where
        T: Transform<Input = Record, Output = Record> + Send + 'static,
    {
        Self {
            inner: pipe_stage(self.inner, stage),
        }
    }

    /// Attaches a map stage. `None` from `f` re-emits the original record.
    pub fn map<F>(self, f: F) -> RecordStream
    where
        F: FnMut(&Record) -> Option<Record> + Send + 'static,
    {
        self.through(stage::map(f))
    }

    /// Attaches a fallible map stage.
    pub fn try_map<F>(self, f: F) -> RecordStream
    where
        F: FnMut(&Record) -> Result<Option<Record>, StreamError> + Send + 'static,
    {
        self.through(stage::try_map(f))
    }

    /// Attaches a filter stage.
    pub fn filter<F>(self, f: F) -> RecordStream
    where
        F: FnMut(&Record) -> bool + Send + 'static,
    {
        self.through(stage::filter(f))
    }

    /// Attaches a fallible filter stage.
    pub fn try_filter<F>(self, f: F) -> RecordStream
    where
        F: FnMut(&Record) -> Result<bool, StreamError> + Send + 'static,
    {
        self.through(stage::try_filter(f))
    }

    /// Attaches a templated field-map stage.
    pub fn field_map(self, template: Record, raw: bool) -> RecordStream {
        self.through(stage::field_map(template, raw))
    }

    /// Pulls the next record.
    pub async fn next_record(&mut self) -> Option<Result<Record, StreamError>> {
        self.inner.next().await
    }

    /// Drains the stream, returning every record or the first error.
    pub async fn collect_records(mut self) -> Result<Vec<Record>, StreamError> {
        let mut records = Vec::new();
        while let Some(item) = self.inner.next().await {
            records.push(item?);
        }
        Ok(records)
    }
}

impl Stream for RecordStream {
    type Item = Result<Record, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream").finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordWriter
// ─────────────────────────────────────────────────────────────────────────────

/// Writable side of a record channel.
#[derive(Clone, Debug)]
pub struct RecordWriter {
    tx: mpsc::Sender<Result<Record, StreamError>>,
}

impl RecordWriter {
    /// Writes one record, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` if the stream has been dropped.
    pub async fn write(&self, record: Record) -> Result<(), StreamError> {
        self.tx.send(Ok(record)).await.map_err(|_| StreamError::Closed)
    }

    /// Delivers `error` to the consumer, which ends the stream.
    pub async fn fail(self, error: StreamError) -> Result<(), StreamError> {
        self.tx.send(Err(error)).await.map_err(|_| StreamError::Closed)
    }

    /// Ends this writer. The stream ends once every writer has ended.
    pub fn end(self) {
        drop(self);
    }

    /// Returns true once the consuming stream has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
