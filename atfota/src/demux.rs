//! Stream demultiplexer.
//!
//! One byte stream from the modem carries three kinds of data with no framing
//! between them: modem status lines (`OK`, `+CSQ: 17,0`, `CLOSED`), protocol
//! metadata records, and raw chunk payload that may contain any byte value,
//! including line terminators. The demultiplexer splits it into [`StreamEvent`]s:
//!
//! ```text
//!            +----------+  header line   +----------------+
//!  bytes --> | TextLine | -------------> | BinaryCapture  |
//!            |          | <------------- | (size bytes)   |
//!            +----------+  remaining=0   +----------------+
//!                 |                              |
//!   StatusLine / Record / LinkDropped   ChunkComplete(bytes)
//! ```
//!
//! Bytes that arrive in the same read as a header line are payload and go straight
//! into the capture. A server record (descriptor or rejection) does not need a line
//! terminator: it is emitted as soon as its closing brace arrives. Records carry
//! server-chosen text, so they are never scanned for link-loss tokens.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::ProtocolError;
use crate::protocol::{ChunkHeader, ChunkProtocol};

/// Longest partial line kept before the oldest bytes are dropped.
pub const LINE_BUFFER_LIMIT: usize = 1024;
/// How much of an overflowing line survives the trim.
pub const LINE_BUFFER_KEEP: usize = 512;
/// Default ceiling on a declared chunk size.
pub const DEFAULT_MAX_CAPTURE: usize = 64 * 1024;
/// Status text that means the socket or data bearer is gone.
pub const LINK_LOSS_TOKENS: &[&str] = &["CLOSED", "ERROR", "+PDP: DEACT"];

/// Demultiplexer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxMode {
    /// Accumulating a text line.
    TextLine,
    /// Copying payload bytes of a declared length.
    BinaryCapture,
}

/// Read-only snapshot of the demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxState {
    /// Current mode.
    pub mode: DemuxMode,
    /// Payload bytes still expected in `BinaryCapture`.
    pub binary_remaining: usize,
    /// Bytes held in the partial line buffer.
    pub buffered: usize,
}

/// Something the demultiplexer recognised in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A line of modem or server text.
    StatusLine(String),
    /// A chunk header; its payload follows as [`StreamEvent::ChunkComplete`].
    Metadata(ChunkHeader),
    /// A complete descriptor or rejection from the server.
    Record(Vec<u8>),
    /// The full payload announced by the preceding header.
    ChunkComplete(Vec<u8>),
    /// A line carried the header marker but could not be used.
    BadMetadata(ProtocolError),
    /// The modem reported the connection gone.
    LinkDropped,
}

/// Splits the inbound byte stream into events.
pub struct StreamDemux {
    protocol: Arc<dyn ChunkProtocol>,
    mode: DemuxMode,
    binary_remaining: usize,
    line: Vec<u8>,
    chunk: Vec<u8>,
    max_capture: usize,
}

impl StreamDemux {
    /// Create a demultiplexer that recognises `protocol`'s metadata.
    pub fn new(protocol: Arc<dyn ChunkProtocol>) -> Self {
        Self {
            protocol,
            mode: DemuxMode::TextLine,
            binary_remaining: 0,
            line: Vec::with_capacity(LINE_BUFFER_LIMIT),
            chunk: Vec::new(),
            max_capture: DEFAULT_MAX_CAPTURE,
        }
    }

    /// Refuse headers that declare more than `max_capture` payload bytes.
    #[must_use]
    pub fn with_max_capture(mut self, max_capture: usize) -> Self {
        self.max_capture = max_capture;
        self
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> DemuxState {
        DemuxState {
            mode: self.mode,
            binary_remaining: self.binary_remaining,
            buffered: self.line.len(),
        }
    }

    /// Text received since the last line terminator.
    pub fn partial_line(&self) -> &[u8] {
        match self.mode {
            DemuxMode::TextLine => &self.line,
            DemuxMode::BinaryCapture => &[],
        }
    }

    /// Abandon any partial line or capture.
    pub fn reset(&mut self) {
        if self.mode == DemuxMode::BinaryCapture {
            debug!(
                "Discarding partial chunk ({} bytes, {} outstanding)",
                self.chunk.len(),
                self.binary_remaining
            );
        }
        self.mode = DemuxMode::TextLine;
        self.binary_remaining = 0;
        self.line.clear();
        self.chunk = Vec::new();
    }

    /// Consume `bytes` and return the events they complete, in stream order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut rest = bytes;

        while !rest.is_empty() {
            match self.mode {
                DemuxMode::BinaryCapture => {
                    let take = self.binary_remaining.min(rest.len());
                    self.chunk.extend_from_slice(&rest[..take]);
                    self.binary_remaining -= take;
                    rest = &rest[take..];
                    if self.binary_remaining == 0 {
                        self.mode = DemuxMode::TextLine;
                        events.push(StreamEvent::ChunkComplete(std::mem::take(&mut self.chunk)));
                    }
                },
                DemuxMode::TextLine => {
                    let byte = rest[0];
                    rest = &rest[1..];
                    if byte == b'\n' {
                        self.finish_line(&mut events);
                        continue;
                    }
                    self.line.push(byte);
                    if byte == b'}' && self.is_record(&self.line) {
                        self.finish_line(&mut events);
                    } else if self.line.len() > LINE_BUFFER_LIMIT {
                        self.trim_overflow(&mut events);
                    }
                },
            }
        }
        events
    }

    fn finish_line(&mut self, events: &mut Vec<StreamEvent>) {
        let mut line = std::mem::take(&mut self.line);
        while line.last().is_some_and(|&b| b == b'\r') {
            line.pop();
        }
        if line.is_empty() {
            return;
        }

        if self.protocol.is_chunk_header(&line) {
            match self.protocol.parse_chunk_header(&line) {
                Ok(header) => self.start_capture(header, events),
                Err(e) => {
                    warn!("Unusable chunk header: {e}");
                    events.push(StreamEvent::BadMetadata(e));
                },
            }
            return;
        }

        if self.is_record(&line) {
            events.push(StreamEvent::Record(line));
            return;
        }

        let text = String::from_utf8_lossy(&line).into_owned();
        let dropped = contains_link_loss(&text);
        events.push(StreamEvent::StatusLine(text));
        if dropped {
            events.push(StreamEvent::LinkDropped);
        }
    }

    fn is_record(&self, bytes: &[u8]) -> bool {
        self.protocol.descriptor_span(bytes).is_some() || self.protocol.rejection(bytes).is_some()
    }

    fn start_capture(&mut self, header: ChunkHeader, events: &mut Vec<StreamEvent>) {
        let size = match usize::try_from(header.size) {
            Ok(size) if size <= self.max_capture => size,
            _ => {
                events.push(StreamEvent::BadMetadata(ProtocolError::OversizedChunk {
                    requested: self.max_capture as u64,
                    declared: header.size,
                }));
                return;
            },
        };

        events.push(StreamEvent::Metadata(header));
        if size == 0 {
            events.push(StreamEvent::ChunkComplete(Vec::new()));
            return;
        }
        self.mode = DemuxMode::BinaryCapture;
        self.binary_remaining = size;
        self.chunk = Vec::with_capacity(size);
    }

    fn trim_overflow(&mut self, events: &mut Vec<StreamEvent>) {
        if self.protocol.is_chunk_header(&self.line) {
            events.push(StreamEvent::BadMetadata(ProtocolError::MalformedMetadata(
                format!("header line exceeds {LINE_BUFFER_LIMIT} bytes"),
            )));
            self.line.clear();
            return;
        }

        let cut = self.line.len() - LINE_BUFFER_KEEP;
        self.line.drain(..cut);
        debug!("Line buffer overflow, dropped {cut} bytes");

        if contains_link_loss(&String::from_utf8_lossy(&self.line)) {
            self.line.clear();
            events.push(StreamEvent::LinkDropped);
        }
    }
}

fn contains_link_loss(text: &str) -> bool {
    LINK_LOSS_TOKENS
        .iter()
        .any(|token| text.contains(token))
}
