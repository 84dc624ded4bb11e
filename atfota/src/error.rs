//! Error types for atfota.
//!
//! The four failure families of an update attempt each get their own enum so that
//! the retry policy can be decided by kind: transport hiccups and rejected sink
//! writes are retried per chunk, protocol desynchronisation and digest mismatches
//! fail the whole session.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for atfota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for atfota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, staging files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// AT command exchange failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Network attach or socket bring-up failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Update server sent something the chunk protocol cannot accept.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The OTA sink refused the image.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A session was started while an abandoned one is still marked active.
    #[error("An update session is already in progress")]
    Busy,

    /// The operation was interrupted by the embedding application.
    #[error("Interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a per-chunk retry may clear this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Sink(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Failure of a single command/response exchange.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Neither the expected token nor an error token arrived in time.
    #[error("Timeout after {waited:?} waiting for response to {command:?}")]
    Timeout {
        /// The command line that was sent.
        command: String,
        /// How long the exchange waited.
        waited: Duration,
    },

    /// The modem answered with an error token.
    #[error("Modem rejected {command:?}: {response}")]
    ErrorToken {
        /// The command line that was sent.
        command: String,
        /// Text captured up to and including the error token.
        response: String,
    },

    /// Writing to the port failed.
    #[error("Port write failed: {0}")]
    Io(String),

    /// The stream reader has stopped; no responses can arrive.
    #[error("Stream reader is not running")]
    Closed,
}

/// Failure to bring the packet-data link up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The modem never answered `AT` or the SIM is not ready.
    #[error("Modem not responding: {0}")]
    NotResponding(String),

    /// Network registration did not complete.
    #[error("Network registration failed after {attempts} attempts")]
    RegistrationFailed {
        /// Number of registration polls made.
        attempts: usize,
    },

    /// Packet-data (GPRS) attach did not complete.
    #[error("GPRS attach failed: {0}")]
    AttachFailed(String),

    /// APN/bearer activation did not complete.
    #[error("Bearer activation failed: {0}")]
    ActivationFailed(String),

    /// The socket connect to the update server failed.
    #[error("Connect to {host}:{port} failed: {reason}")]
    ConnectFailed {
        /// Server host.
        host: String,
        /// Server port.
        port: u16,
        /// What the modem reported.
        reason: String,
    },

    /// A bring-up command failed at the transport level.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The modem reported the socket or bearer gone.
    #[error("Link dropped")]
    Dropped,

    /// Bring-up was abandoned on request.
    #[error("Link bring-up interrupted")]
    Interrupted,
}

/// The update server's framing could not be trusted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Metadata was missing a field or had a non-numeric value.
    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    /// A chunk header announced a different offset than requested.
    #[error("Chunk offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch {
        /// Bytes committed so far.
        expected: u64,
        /// Offset from the header.
        actual: u64,
    },

    /// A chunk header announced a different image size than the descriptor.
    #[error("Image size mismatch: expected {expected}, got {actual}")]
    TotalMismatch {
        /// Size from the descriptor.
        expected: u64,
        /// Total from the header.
        actual: u64,
    },

    /// A chunk header declared more bytes than were requested.
    #[error("Chunk size {declared} exceeds requested {requested}")]
    OversizedChunk {
        /// Bytes requested.
        requested: u64,
        /// Bytes declared by the header.
        declared: u64,
    },

    /// The server answered with an explicit error status.
    #[error("Server rejected request: {0}")]
    Rejected(String),

    /// Binary payload arrived without a preceding chunk header.
    #[error("Binary payload without chunk header")]
    UnexpectedPayload,
}

/// The OTA sink refused the image.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The target slot cannot hold the image.
    #[error("Insufficient space: need {required} bytes, have {available}")]
    InsufficientSpace {
        /// Image size.
        required: u64,
        /// Slot capacity.
        available: u64,
    },

    /// A write was rejected or came up short.
    #[error("Write rejected: {0}")]
    WriteRejected(String),

    /// The sink accepted only part of a chunk.
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes offered.
        expected: usize,
        /// Bytes accepted.
        written: usize,
    },

    /// Committing the staged image failed.
    #[error("Finalize failed: {0}")]
    FinalizeFailed(String),

    /// The image digest does not match the descriptor.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest from the descriptor.
        expected: String,
        /// Digest of the received bytes.
        actual: String,
    },

    /// `write` or `finalize` was called before `begin`.
    #[error("Sink has no active update")]
    NotStarted,
}

impl SinkError {
    /// Only rejected writes are worth re-requesting a chunk for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteRejected(_))
    }
}
