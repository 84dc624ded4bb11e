//! Update session orchestration.
//!
//! An [`Orchestrator`] drives one update attempt at a time: it asks the server
//! for a [`FirmwareDescriptor`], decides whether the offered version is newer,
//! pulls the image chunk by chunk into an [`OtaSink`], verifies the MD5 digest
//! and commits. The link itself is somebody else's problem; the orchestrator
//! talks to the outside world only through a [`TransferIo`].
//!
//! ```text
//! Idle -> Checking -> AwaitingChunk <-> WritingChunk -> Verifying -> Committing -> Completed
//!            \              \                \              \             \
//!             +--------------+----------------+--------------+-------------+--> Failed -> Idle
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use md5::{Digest, Md5};

use crate::demux::{DEFAULT_MAX_CAPTURE, StreamEvent};
use crate::error::{Error, LinkError, ProtocolError, Result, SinkError, TransportError};
use crate::protocol::{
    ChunkHeader, ChunkProtocol, ChunkRequest, FirmwareDescriptor, Request, is_newer,
};
use crate::sink::{OtaSink, to_hex};

/// Default chunk size requested from the server.
pub const DEFAULT_MAX_CHUNK: u64 = 1024;

/// Tunables for one update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Identifier the server knows this device by.
    pub device_id: String,
    /// Version currently running.
    pub current_version: String,
    /// Largest chunk to ask for.
    pub max_chunk: u64,
    /// How long to wait for a descriptor after sending a check.
    pub check_timeout: Duration,
    /// How long to wait for a complete chunk after requesting it.
    pub chunk_timeout: Duration,
    /// Attempts per chunk (and per check) before the session fails.
    pub chunk_retries: usize,
    /// Pause before retry `n`, multiplied by `n`.
    pub retry_backoff: Duration,
    /// Largest chunk payload the demultiplexer will buffer.
    pub max_capture: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            current_version: "0.0.0".into(),
            max_chunk: DEFAULT_MAX_CHUNK,
            check_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(30),
            chunk_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_capture: DEFAULT_MAX_CAPTURE,
        }
    }
}

impl TransferConfig {
    /// Defaults for `device_id` running `current_version`.
    pub fn new(device_id: impl Into<String>, current_version: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            current_version: current_version.into(),
            ..Self::default()
        }
    }

    /// Set the largest chunk to request.
    #[must_use]
    pub fn with_max_chunk(mut self, max_chunk: u64) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    /// Set the check and chunk timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, check: Duration, chunk: Duration) -> Self {
        self.check_timeout = check;
        self.chunk_timeout = chunk;
        self
    }

    /// Set the attempt count and linear backoff step.
    #[must_use]
    pub fn with_retries(mut self, attempts: usize, backoff: Duration) -> Self {
        self.chunk_retries = attempts;
        self.retry_backoff = backoff;
        self
    }
}

/// Where the current session is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session.
    #[default]
    Idle,
    /// Check sent, waiting for a descriptor.
    Checking,
    /// Chunk requested, waiting for header and payload.
    AwaitingChunk,
    /// Handing a chunk to the sink.
    WritingChunk,
    /// All bytes in, comparing digests.
    Verifying,
    /// Asking the sink to commit.
    Committing,
    /// The attempt failed; about to return to idle.
    Failed,
    /// The image is committed.
    Completed,
}

impl SessionStatus {
    /// Whether a session currently owns the orchestrator.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Checking
                | Self::AwaitingChunk
                | Self::WritingChunk
                | Self::Verifying
                | Self::Committing
        )
    }

    /// Lower-case name for logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::AwaitingChunk => "awaiting-chunk",
            Self::WritingChunk => "writing-chunk",
            Self::Verifying => "verifying",
            Self::Committing => "committing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Current status.
    pub status: SessionStatus,
    /// Version being fetched, once a descriptor has been accepted.
    pub version: Option<String>,
    /// Bytes verified and written so far.
    pub bytes_committed: u64,
    /// Image size from the descriptor.
    pub total_size: u64,
    /// Message of the last failure, kept until the next session starts.
    pub last_error: Option<String>,
}

/// Shared, read-only view of an orchestrator's session.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<Mutex<SessionSnapshot>>);

impl SessionHandle {
    /// Copy of the current session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        f(&mut self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner));
    }
}

/// Something the orchestrator can be woken by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Output of the stream demultiplexer.
    Stream(StreamEvent),
    /// The scheduler wants an update check.
    CheckRequested,
    /// The scheduler found the link down.
    ReconnectRequested,
    /// The application is shutting down.
    Shutdown,
}

/// The orchestrator's view of the link.
pub trait TransferIo {
    /// Send one request.
    fn send(&mut self, request: &Request) -> std::result::Result<(), TransportError>;

    /// The next event, or `None` if nothing arrived within `timeout`.
    fn next(&mut self, timeout: Duration) -> Option<Incoming>;

    /// Discard any half-received chunk so the stream is back in line mode.
    fn reset_stream(&mut self);
}

/// Progress notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The session moved to a new status.
    Status(SessionStatus),
    /// The server offered a newer image.
    UpdateAvailable(FirmwareDescriptor),
    /// A chunk was written.
    Progress {
        /// Bytes written so far.
        committed: u64,
        /// Image size.
        total: u64,
    },
    /// A chunk is being requested again.
    ChunkRetry {
        /// Offset of the chunk.
        offset: u64,
        /// Attempt that failed.
        attempt: usize,
        /// Why it failed.
        error: String,
    },
}

/// Result of a completed update cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The server has nothing newer.
    UpToDate,
    /// A new image is committed.
    Installed {
        /// The committed version.
        version: String,
        /// The device should restart into the new image.
        restart_requested: bool,
    },
}

type Observer = Box<dyn FnMut(&TransferEvent) + Send>;

/// Drives update sessions against one sink.
///
/// Both entry points take `&mut self`, so two sessions can never overlap; a
/// `CheckRequested` that arrives during a transfer is consumed and ignored. The
/// status check in front of a new session only fires when a previous session was
/// abandoned mid-flight by unwinding.
pub struct Orchestrator<S> {
    protocol: Arc<dyn ChunkProtocol>,
    sink: S,
    config: TransferConfig,
    session: SessionHandle,
    observer: Option<Observer>,
}

impl<S: OtaSink> Orchestrator<S> {
    /// Create an idle orchestrator.
    pub fn new(protocol: Arc<dyn ChunkProtocol>, sink: S, config: TransferConfig) -> Self {
        Self {
            protocol,
            sink,
            config,
            session: SessionHandle::default(),
            observer: None,
        }
    }

    /// Report progress to `observer`.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&TransferEvent) + Send + 'static,
    {
        self.set_observer(observer);
        self
    }

    /// Replace the progress observer.
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&TransferEvent) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// Handle for reading session state from other threads.
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.session.snapshot().status
    }

    /// Session tunables.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Ask the server what it has without downloading anything.
    ///
    /// Returns the descriptor only if it is newer than the running version.
    pub fn check(&mut self, io: &mut dyn TransferIo) -> Result<Option<FirmwareDescriptor>> {
        self.start_session()?;
        match self.run_check(io) {
            Ok(offer) => {
                self.set_status(SessionStatus::Idle);
                Ok(offer)
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Run one full update cycle: check, download, verify, commit.
    ///
    /// Fails with [`Error::Busy`] if an earlier session was abandoned while active.
    pub fn check_and_update(&mut self, io: &mut dyn TransferIo) -> Result<UpdateOutcome> {
        self.start_session()?;

        let descriptor = match self.run_check(io) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                self.set_status(SessionStatus::Idle);
                return Ok(UpdateOutcome::UpToDate);
            },
            Err(e) => return Err(self.fail(e)),
        };

        match self.transfer(io, &descriptor) {
            Ok(()) => {
                self.set_status(SessionStatus::Completed);
                info!(
                    "Firmware {} committed, restart requested",
                    descriptor.version
                );
                self.set_status(SessionStatus::Idle);
                Ok(UpdateOutcome::Installed {
                    version: descriptor.version,
                    restart_requested: true,
                })
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    fn start_session(&mut self) -> Result<()> {
        if self.status().is_active() {
            return Err(Error::Busy);
        }
        self.session
            .update(|s| *s = SessionSnapshot::default());
        self.set_status(SessionStatus::Checking);
        Ok(())
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!("Update session failed: {error}");
        let message = error.to_string();
        self.session
            .update(|s| s.last_error = Some(message));
        self.set_status(SessionStatus::Failed);
        self.set_status(SessionStatus::Idle);
        error
    }

    fn set_status(&mut self, status: SessionStatus) {
        let mut previous = status;
        self.session.update(|s| {
            previous = s.status;
            s.status = status;
        });
        if previous != status {
            debug!("Session {previous} -> {status}");
            self.emit(&TransferEvent::Status(status));
        }
    }

    fn emit(&mut self, event: &TransferEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }

    fn backoff(&self, attempt: usize) -> Result<()> {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        if crate::pause(self.config.retry_backoff.saturating_mul(factor)) {
            Ok(())
        } else {
            Err(Error::Interrupted)
        }
    }

    // ---- check ----

    fn run_check(&mut self, io: &mut dyn TransferIo) -> Result<Option<FirmwareDescriptor>> {
        let request = self
            .protocol
            .build_check_request(&self.config.device_id, &self.config.current_version)?;
        let attempts = self.config.chunk_retries.max(1);

        let mut attempt = 0;
        let descriptor = loop {
            attempt += 1;
            let result = match io.send(&request) {
                Ok(()) => self.await_descriptor(io),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(descriptor) => break descriptor,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!("Update check failed (attempt {attempt}/{attempts}): {e}");
                    io.reset_stream();
                    self.backoff(attempt)?;
                },
                Err(e) => return Err(e),
            }
        };

        if !is_newer(&descriptor.version, &self.config.current_version) {
            info!(
                "Firmware is up to date (running {}, server offers {})",
                self.config.current_version, descriptor.version
            );
            return Ok(None);
        }

        info!(
            "Update available: {} {} ({} bytes)",
            descriptor.display_name, descriptor.version, descriptor.total_size
        );
        self.emit(&TransferEvent::UpdateAvailable(descriptor.clone()));
        Ok(Some(descriptor))
    }

    fn await_descriptor(&self, io: &mut dyn TransferIo) -> Result<FirmwareDescriptor> {
        let deadline = Instant::now() + self.config.check_timeout;
        while let Some(incoming) = next_before(io, deadline) {
            let bytes = match incoming {
                Incoming::Stream(StreamEvent::Record(record)) => record,
                Incoming::Stream(StreamEvent::StatusLine(line)) => line.into_bytes(),
                // HTTP delivers the descriptor as a response body
                Incoming::Stream(StreamEvent::ChunkComplete(body)) => body,
                Incoming::Stream(StreamEvent::LinkDropped) => {
                    return Err(LinkError::Dropped.into());
                },
                Incoming::Shutdown => return Err(Error::Interrupted),
                Incoming::CheckRequested => {
                    debug!("Check already in progress");
                    continue;
                },
                other => {
                    trace!("Ignoring {other:?} while checking");
                    continue;
                },
            };
            if let Some(reason) = self.protocol.rejection(&bytes) {
                return Err(ProtocolError::Rejected(reason).into());
            }
            if self.protocol.descriptor_span(&bytes).is_some() {
                return Ok(self.protocol.parse_descriptor(&bytes)?);
            }
        }
        Err(TransportError::Timeout {
            command: "update check".into(),
            waited: self.config.check_timeout,
        }
        .into())
    }

    // ---- transfer ----

    fn transfer(&mut self, io: &mut dyn TransferIo, descriptor: &FirmwareDescriptor) -> Result<()> {
        self.session.update(|s| {
            s.version = Some(descriptor.version.clone());
            s.total_size = descriptor.total_size;
        });

        if let Err(e) = self.sink.begin(descriptor.total_size) {
            warn!("Sink refused {} bytes, skipping this update", descriptor.total_size);
            return Err(e.into());
        }
        self.sink
            .set_expected_digest(&descriptor.content_hash);

        let result = self.receive(io, descriptor);
        if result.is_err() {
            self.sink.abort();
            io.reset_stream();
        }
        for request in self.protocol.end_transfer() {
            if let Err(e) = io.send(&request) {
                debug!("Ignoring end-of-transfer failure: {e}");
            }
        }
        result
    }

    fn receive(&mut self, io: &mut dyn TransferIo, descriptor: &FirmwareDescriptor) -> Result<()> {
        for request in self
            .protocol
            .begin_transfer(&self.config.device_id, descriptor)?
        {
            io.send(&request)?;
        }

        let total = descriptor.total_size;
        let mut hasher = Md5::new();
        let mut committed = 0u64;
        let mut milestone = 0u64;
        info!("Downloading {} ({total} bytes)", descriptor.display_name);

        while let Some(request) = ChunkRequest::next(committed, total, self.config.max_chunk) {
            let payload = self.fetch_with_retry(io, descriptor, request)?;
            hasher.update(&payload);
            committed += payload.len() as u64;

            self.session
                .update(|s| s.bytes_committed = committed);
            self.emit(&TransferEvent::Progress { committed, total });

            let percent = committed * 100 / total;
            if percent / 10 > milestone {
                milestone = percent / 10;
                info!("Downloaded {committed}/{total} bytes ({percent}%)");
            }
        }

        self.set_status(SessionStatus::Verifying);
        let actual = to_hex(&hasher.finalize());
        if !actual.eq_ignore_ascii_case(&descriptor.content_hash) {
            return Err(SinkError::DigestMismatch {
                expected: descriptor.content_hash.clone(),
                actual,
            }
            .into());
        }
        debug!("Digest verified: {actual}");

        self.set_status(SessionStatus::Committing);
        self.sink.finalize()?;
        Ok(())
    }

    fn fetch_with_retry(
        &mut self,
        io: &mut dyn TransferIo,
        descriptor: &FirmwareDescriptor,
        request: ChunkRequest,
    ) -> Result<Vec<u8>> {
        let attempts = self.config.chunk_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .fetch_chunk(io, descriptor, request)
                .and_then(|payload| self.write_payload(payload));
            match result {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Chunk at offset {} failed (attempt {attempt}/{attempts}): {e}",
                        request.offset
                    );
                    self.emit(&TransferEvent::ChunkRetry {
                        offset: request.offset,
                        attempt,
                        error: e.to_string(),
                    });
                    io.reset_stream();
                    self.backoff(attempt)?;
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn fetch_chunk(
        &mut self,
        io: &mut dyn TransferIo,
        descriptor: &FirmwareDescriptor,
        request: ChunkRequest,
    ) -> Result<Vec<u8>> {
        let message = self.protocol.build_chunk_request(
            &self.config.device_id,
            request.offset,
            request.requested_size,
        )?;
        self.set_status(SessionStatus::AwaitingChunk);
        trace!(
            "Requesting {} bytes at offset {}",
            request.requested_size, request.offset
        );
        io.send(&message)?;

        let deadline = Instant::now() + self.config.chunk_timeout;
        let mut header = None;
        while let Some(incoming) = next_before(io, deadline) {
            match incoming {
                Incoming::Stream(StreamEvent::Metadata(h)) => {
                    check_header(&h, descriptor, request)?;
                    header = Some(h);
                },
                Incoming::Stream(StreamEvent::ChunkComplete(payload)) => {
                    return match header {
                        Some(_) => Ok(payload),
                        None => Err(ProtocolError::UnexpectedPayload.into()),
                    };
                },
                Incoming::Stream(StreamEvent::BadMetadata(e)) => return Err(e.into()),
                Incoming::Stream(StreamEvent::LinkDropped) => {
                    return Err(LinkError::Dropped.into());
                },
                Incoming::Stream(StreamEvent::Record(record)) => {
                    if let Some(reason) = self.protocol.rejection(&record) {
                        return Err(ProtocolError::Rejected(reason).into());
                    }
                    debug!("Ignoring server record during transfer");
                },
                Incoming::Stream(StreamEvent::StatusLine(line)) => trace!("<< {line}"),
                Incoming::CheckRequested => info!("Update in progress, check request ignored"),
                Incoming::ReconnectRequested => debug!("Reconnect deferred until the session ends"),
                Incoming::Shutdown => return Err(Error::Interrupted),
            }
        }
        Err(TransportError::Timeout {
            command: format!("chunk at offset {}", request.offset),
            waited: self.config.chunk_timeout,
        }
        .into())
    }

    fn write_payload(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.set_status(SessionStatus::WritingChunk);
        let written = self.sink.write(&payload)?;
        if written != payload.len() {
            return Err(SinkError::ShortWrite {
                expected: payload.len(),
                written,
            }
            .into());
        }
        Ok(payload)
    }
}

impl<S> fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("session", &self.session.snapshot())
            .finish_non_exhaustive()
    }
}

fn next_before(io: &mut dyn TransferIo, deadline: Instant) -> Option<Incoming> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return None;
    }
    io.next(remaining)
}

/// Validate a chunk header against the descriptor and the outstanding request.
fn check_header(
    header: &ChunkHeader,
    descriptor: &FirmwareDescriptor,
    request: ChunkRequest,
) -> std::result::Result<(), ProtocolError> {
    if header.total != descriptor.total_size {
        return Err(ProtocolError::TotalMismatch {
            expected: descriptor.total_size,
            actual: header.total,
        });
    }
    if header.offset != request.offset {
        return Err(ProtocolError::OffsetMismatch {
            expected: request.offset,
            actual: header.offset,
        });
    }
    if header.size == 0 {
        return Err(ProtocolError::MalformedMetadata(format!(
            "zero-length chunk at offset {}",
            header.offset
        )));
    }
    if header.size > request.requested_size {
        return Err(ProtocolError::OversizedChunk {
            requested: request.requested_size,
            declared: header.size,
        });
    }
    Ok(())
}
