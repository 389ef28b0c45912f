//! Byte sinks → parsed record stream, with deferred activation.
//!
//! A `ParsableStream` hands out writable byte sinks (`as_parsed_stream`) before
//! anyone consumes the parsed records. Until the first call to
//! `subscribe_to_records`, every sink is queued: its writes are buffered and
//! its parse stage is not yet connected. Subscribing activates the stream
//! exactly once, connecting all queued sinks in creation order. Sinks created
//! after activation connect immediately.
//!
//! ```text
//!   Idle { queued sinks }  ──subscribe_to_records()──►  Active
//! ```
//!
//! A single pump task serves every connected sink: bytes → parse stage →
//! record buffer → the subscriber's `RecordStream`. When a sink connects, the
//! chunks it buffered while queued are parsed before the pump moves on, so
//! queued backlogs reach the subscriber in creation order. Live chunks are
//! then taken from the earliest sink that has one. Parse errors are delivered
//! on the record stream after the records parsed before them, and end it.

use std::fmt;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;
use futures_util::stream;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::converter::{ConvertOptions, ConverterRegistry, ParseStage};
use crate::error::StreamError;
use crate::record::Record;
use crate::stream::RecordStream;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed records buffered ahead of the subscriber.
pub const RECORD_BUFFER_CAPACITY: usize = 10_000;

/// Chunks a sink buffers before `write` waits. Applies to queued sinks too.
pub const QUEUED_WRITE_CAPACITY: usize = 1024;

type RecordResult = Result<Record, StreamError>;

// ─────────────────────────────────────────────────────────────────────────────
// ByteSink
// ─────────────────────────────────────────────────────────────────────────────

/// Writable side handed out by [`ParsableStream::as_parsed_stream`].
#[derive(Debug)]
pub struct ByteSink {
    id: usize,
    tx: mpsc::Sender<Bytes>,
}

impl ByteSink {
    /// Writes one chunk, waiting while the sink's buffer is full.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Closed` if the parsable stream was destroyed,
    /// dropped before this sink was connected, or has already failed.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), StreamError> {
        self.tx
            .send(chunk.into())
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Ends the sink. Its parse stage is flushed once connected.
    pub fn end(self) {
        debug!("[PARSE] sink {} ended", self.id);
    }

    /// Returns true once nothing will read from this sink again.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

struct QueuedSink {
    id: usize,
    rx: mpsc::Receiver<Bytes>,
    stage: ParseStage,
}

enum State {
    Idle { queued: Vec<QueuedSink> },
    Active { connect: mpsc::UnboundedSender<QueuedSink> },
    Destroyed,
}

impl State {
    fn label(&self) -> &'static str {
        match self {
            State::Idle { .. } => "idle",
            State::Active { .. } => "active",
            State::Destroyed => "destroyed",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ParsableStream
// ─────────────────────────────────────────────────────────────────────────────

/// A record stream fed by any number of parsed byte sinks.
///
/// The record stream ends once this value is dropped and every connected sink
/// has ended. The pump is spawned on the current tokio runtime, so
/// `subscribe_to_records` must be called from within one.
pub struct ParsableStream {
    registry: Arc<ConverterRegistry>,
    state: State,
    cancel: CancellationToken,
    next_sink_id: usize,
}

impl ParsableStream {
    /// Creates an idle parsable stream using the process-wide registry.
    pub fn new() -> Self {
        Self::with_registry(ConverterRegistry::global())
    }

    /// Creates an idle parsable stream resolving formats in `registry`.
    pub fn with_registry(registry: Arc<ConverterRegistry>) -> Self {
        Self {
            registry,
            state: State::Idle { queued: Vec::new() },
            cancel: CancellationToken::new(),
            next_sink_id: 0,
        }
    }

    /// Returns a writable sink whose bytes are parsed as `format`.
    ///
    /// The sink is usable immediately. While the stream is idle its writes are
    /// buffered; once active it is connected straight away.
    ///
    /// # Errors
    ///
    /// - `StreamError::UnsupportedFormat` if `format` is not registered
    /// - `StreamError::Closed` after `destroy`, or once the pump has stopped
    pub fn as_parsed_stream(
        &mut self,
        format: &str,
        options: &ConvertOptions,
    ) -> Result<ByteSink, StreamError> {
        let converter = self.registry.require(format)?;
        if matches!(self.state, State::Destroyed) {
            return Err(StreamError::Closed);
        }

        let (tx, rx) = mpsc::channel(QUEUED_WRITE_CAPACITY);
        let id = self.next_sink_id;
        self.next_sink_id += 1;
        let sink = QueuedSink {
            id,
            rx,
            stage: converter.parse(options),
        };

        match &mut self.state {
            State::Idle { queued } => {
                debug!("[PARSE] queued sink {} ({}) until a subscriber attaches", id, format);
                queued.push(sink);
            }
            State::Active { connect } => {
                debug!("[PARSE] connecting sink {} ({}) immediately", id, format);
                connect.send(sink).map_err(|_| StreamError::Closed)?;
            }
            State::Destroyed => return Err(StreamError::Closed),
        }

        Ok(ByteSink { id, tx })
    }

    /// Subscribes to parsed records, activating the stream.
    ///
    /// Every queued sink is connected, in creation order.
    ///
    /// # Errors
    ///
    /// - `StreamError::AlreadySubscribed` on a second call
    /// - `StreamError::Closed` after `destroy`
    pub fn subscribe_to_records(&mut self) -> Result<RecordStream, StreamError> {
        let queued = match std::mem::replace(&mut self.state, State::Destroyed) {
            State::Idle { queued } => queued,
            active @ State::Active { .. } => {
                self.state = active;
                return Err(StreamError::AlreadySubscribed);
            }
            State::Destroyed => return Err(StreamError::Closed),
        };

        let (records_tx, records_rx) = mpsc::channel(RECORD_BUFFER_CAPACITY);
        let (connect, connections) = mpsc::unbounded_channel();
        self.state = State::Active { connect };

        info!("[PARSE] subscriber attached, connecting {} queued sink(s)", queued.len());
        let pump = Pump {
            sinks: Vec::new(),
            connections,
            accepting: true,
            records: records_tx,
            cancel: self.cancel.clone(),
        };
        tokio::spawn(pump.run(queued));

        Ok(cancellable_records(records_rx, self.cancel.clone()))
    }

    /// Tears the stream down.
    ///
    /// The pump stops, queued sinks are released without being parsed, and
    /// further writes to any sink fail with `StreamError::Closed`. A
    /// subscriber sees `StreamError::Cancelled` after the records already
    /// buffered.
    pub fn destroy(&mut self) {
        let previous = std::mem::replace(&mut self.state, State::Destroyed);
        if let State::Idle { queued } = &previous {
            debug!("[PARSE] releasing {} queued sink(s)", queued.len());
        }
        self.cancel.cancel();
        info!("[PARSE] destroyed (was {})", previous.label());
    }

    /// Returns true once a subscriber has attached.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    /// Number of sinks waiting for activation.
    pub fn queued_sinks(&self) -> usize {
        match &self.state {
            State::Idle { queued } => queued.len(),
            _ => 0,
        }
    }
}

impl Default for ParsableStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ParsableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsableStream")
            .field("state", &self.state.label())
            .field("queued_sinks", &self.queued_sinks())
            .finish_non_exhaustive()
    }
}

/// Returns a parsed byte sink on `parsable`.
///
/// See [`ParsableStream::as_parsed_stream`].
pub fn as_parsed_stream(
    parsable: &mut ParsableStream,
    format: &str,
    options: &ConvertOptions,
) -> Result<ByteSink, StreamError> {
    parsable.as_parsed_stream(format, options)
}

/// The subscriber's view of the record buffer.
///
/// Once `cancel` fires, records already buffered are still yielded, followed
/// by `StreamError::Cancelled`. The terminal error does not depend on free
/// space in the buffer.
fn cancellable_records(
    rx: mpsc::Receiver<RecordResult>,
    cancel: CancellationToken,
) -> RecordStream {
    let source = stream::unfold(Some((rx, cancel)), |state| async move {
        let (mut rx, cancel) = state?;
        loop {
            if cancel.is_cancelled() {
                return match rx.try_recv() {
                    Ok(item) => Some((item, Some((rx, cancel)))),
                    Err(_) => Some((Err(StreamError::Cancelled), None)),
                };
            }

            tokio::select! {
                biased;
                item = rx.recv() => match item {
                    Some(item) => return Some((item, Some((rx, cancel)))),
                    // The pump exits on cancel too; report that as Cancelled.
                    None if cancel.is_cancelled() => continue,
                    None => return None,
                },
                _ = cancel.cancelled() => continue,
            }
        }
    });
    RecordStream::new(source)
}

// ─────────────────────────────────────────────────────────────────────────────
// Pump
// ─────────────────────────────────────────────────────────────────────────────

struct ConnectedSink {
    id: usize,
    rx: mpsc::Receiver<Bytes>,
    stage: ParseStage,
    emitted: usize,
}

impl From<QueuedSink> for ConnectedSink {
    fn from(sink: QueuedSink) -> Self {
        Self {
            id: sink.id,
            rx: sink.rx,
            stage: sink.stage,
            emitted: 0,
        }
    }
}

enum Flow {
    Continue,
    Finished,
    Stop,
}

enum Event {
    Connect(Option<QueuedSink>),
    Chunk(usize, Option<Bytes>),
    Cancelled,
}

struct Pump {
    /// Connected sinks, in creation order.
    sinks: Vec<ConnectedSink>,
    connections: mpsc::UnboundedReceiver<QueuedSink>,
    accepting: bool,
    records: mpsc::Sender<RecordResult>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(mut self, queued: Vec<QueuedSink>) {
        for sink in queued {
            if !self.connect(sink).await {
                return;
            }
        }

        loop {
            if !self.accepting && self.sinks.is_empty() {
                debug!("[PARSE] every sink finished, closing record stream");
                return;
            }

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                sink = self.connections.recv(), if self.accepting => Event::Connect(sink),
                (index, chunk) = next_chunk(&mut self.sinks), if !self.sinks.is_empty() => {
                    Event::Chunk(index, chunk)
                }
            };

            match event {
                Event::Cancelled => {
                    debug!("[PARSE] pump cancelled with {} connected sink(s)", self.sinks.len());
                    return;
                }
                Event::Connect(Some(sink)) => {
                    if !self.connect(sink).await {
                        return;
                    }
                }
                Event::Connect(None) => self.accepting = false,
                Event::Chunk(index, chunk) => {
                    let sink = &mut self.sinks[index];
                    match process(sink, chunk, &self.records, &self.cancel).await {
                        Flow::Continue => {}
                        Flow::Finished => {
                            self.sinks.remove(index);
                        }
                        Flow::Stop => return,
                    }
                }
            }
        }
    }

    /// Parses everything `sink` buffered while queued, then keeps it for live
    /// chunks unless it already ended. Returns false if the pump should stop.
    async fn connect(&mut self, sink: QueuedSink) -> bool {
        let mut sink = ConnectedSink::from(sink);
        debug!("[PARSE] sink {} connected", sink.id);

        loop {
            let chunk = match sink.rx.try_recv() {
                Ok(bytes) => Some(bytes),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => None,
            };
            match process(&mut sink, chunk, &self.records, &self.cancel).await {
                Flow::Continue => {}
                Flow::Finished => return true,
                Flow::Stop => return false,
            }
        }

        self.sinks.push(sink);
        true
    }
}

/// Waits for the next chunk (or end of input) from the earliest sink that has
/// one.
fn next_chunk(
    sinks: &mut [ConnectedSink],
) -> impl std::future::Future<Output = (usize, Option<Bytes>)> + '_ {
    poll_fn(move |cx| {
        for (index, sink) in sinks.iter_mut().enumerate() {
            if let Poll::Ready(chunk) = sink.rx.poll_recv(cx) {
                return Poll::Ready((index, chunk));
            }
        }
        Poll::Pending
    })
}

/// Feeds one chunk, or end of input when `chunk` is `None`, through the
/// sink's parse stage and delivers the results.
async fn process(
    sink: &mut ConnectedSink,
    chunk: Option<Bytes>,
    records: &mpsc::Sender<RecordResult>,
    cancel: &CancellationToken,
) -> Flow {
    let mut batch = Vec::new();
    let ended = chunk.is_none();
    let result = match chunk {
        Some(bytes) => sink.stage.write(bytes, &mut batch),
        None => sink.stage.end(&mut batch),
    };

    for record in batch {
        if !deliver(records, Ok(record), cancel).await {
            return Flow::Stop;
        }
        sink.emitted += 1;
    }

    if let Err(e) = result {
        warn!("[PARSE] sink {} failed in '{}': {}", sink.id, sink.stage.name(), e);
        deliver(records, Err(e), cancel).await;
        return Flow::Stop;
    }

    if ended {
        debug!("[PARSE] sink {} finished, {} record(s)", sink.id, sink.emitted);
        Flow::Finished
    } else {
        Flow::Continue
    }
}

/// Sends one item to the subscriber. Returns false if the pump should stop.
async fn deliver(
    records: &mpsc::Sender<RecordResult>,
    item: RecordResult,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = records.send(item) => sent.is_ok(),
    }
}
