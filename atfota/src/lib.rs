//! # atfota
//!
//! Firmware-over-the-air client for cellular modems driven by AT commands
//! (SIM800 and relatives).
//!
//! The modem's single UART carries AT command replies, unsolicited status lines,
//! JSON metadata and raw firmware bytes all interleaved. This crate splits that
//! stream apart and runs a resumable, digest-verified chunked download on top of it:
//!
//! - [`at`]: serialised command/response exchanges and the stream reader thread
//! - [`demux`]: turns the inbound byte stream into status lines, chunk headers and
//!   binary chunks
//! - [`protocol`]: the chunk transfer contract and its MQTT, JSON-line and HTTP-range
//!   wire encodings
//! - [`link`]: modem probe, network registration, bearer activation, socket connect
//! - [`orchestrator`]: the update session state machine
//! - [`sink`]: where verified images go
//! - [`agent`]: wires it all together with a keep-alive/check scheduler
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use atfota::{
//!     Agent, AgentConfig, FileSink, JsonLineEncoding, LinkConfig, TransferConfig, WireEncoding,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use atfota::{NativePort, SerialConfig};
//!
//!         let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!         let config = AgentConfig::new(
//!             LinkConfig::default().with_server("fota.example.com", 5000),
//!             TransferConfig::new("esp32_001", "1.0.0"),
//!         );
//!         let mut agent = Agent::new(
//!             Box::new(port),
//!             Arc::new(WireEncoding::JsonLine(JsonLineEncoding)),
//!             FileSink::new("firmware.bin"),
//!             config,
//!         )?;
//!         println!("{:?}", agent.update_once()?);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

pub mod agent;
pub mod at;
pub mod demux;
pub mod error;
pub mod link;
pub mod orchestrator;
pub mod port;
pub mod protocol;
pub mod sink;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Longest single sleep inside [`pause`].
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Sleep for `delay` in short slices. Returns `false` if interrupted.
pub(crate) fn pause(delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if is_interrupted_requested() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(PAUSE_SLICE));
    }
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    agent::{Agent, AgentConfig, Diagnostics, RunExit},
    at::{AtCommand, CommandTransport},
    demux::{DemuxMode, DemuxState, StreamDemux, StreamEvent},
    error::{Error, LinkError, ProtocolError, Result, SinkError, TransportError},
    link::{ConnectionStatus, LinkConfig, LinkManager, LinkState, SignalQuality},
    orchestrator::{
        Incoming, Orchestrator, SessionSnapshot, SessionStatus, TransferConfig, TransferEvent,
        TransferIo, UpdateOutcome,
    },
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{
        ChunkHeader, ChunkProtocol, FirmwareDescriptor, HttpRangeEncoding, HttpSettings,
        JsonLineEncoding, MqttEncoding, MqttSettings, WireEncoding, compare_versions, is_newer,
    },
    sink::{FileSink, MemorySink, OtaSink},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_pause_waits_out_the_delay() {
        let started = Instant::now();
        assert!(pause(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(pause(Duration::ZERO));
    }
}
