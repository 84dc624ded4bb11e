//! AT command transport.
//!
//! Commands are written through one port handle; responses are never read here.
//! The [`reader`] thread owns the inbound side, feeds every byte through the stream
//! demultiplexer and appends completed status lines to the capture buffer of the
//! exchange in flight. An exchange waits on that buffer until it sees its expected
//! token, an error token or its deadline.
//!
//! Only one exchange may be outstanding: [`CommandTransport::exclusive`] hands out
//! an [`Exchange`] that holds the writer lock until it is dropped, so a keep-alive
//! ping can never land between a `AT+CIPSEND` prompt and its payload.

pub mod reader;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::TransportError;
use crate::port::Port;
use crate::protocol::Request;

pub use reader::{Inbound, StreamReader};

/// Default response timeout for ordinary commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for the `>` prompt after `AT+CIPSEND`.
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for `SEND OK` after a payload.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Token that fails any exchange.
pub const ERROR_TOKEN: &str = "ERROR";

/// One command line and how to judge its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    /// Command text without the trailing carriage return.
    pub line: String,
    /// Substring that marks success.
    pub expect: String,
    /// Substrings that mark failure in addition to `ERROR`.
    pub fail_on: Vec<String>,
    /// How long to wait for either.
    pub timeout: Duration,
    /// Failure is logged and ignored.
    pub optional: bool,
}

impl AtCommand {
    /// A command that expects `OK` within [`DEFAULT_TIMEOUT`].
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            expect: "OK".into(),
            fail_on: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            optional: false,
        }
    }

    /// Set the success token.
    #[must_use]
    pub fn expect(mut self, token: impl Into<String>) -> Self {
        self.expect = token.into();
        self
    }

    /// Add a failure token.
    #[must_use]
    pub fn fail_on(mut self, token: impl Into<String>) -> Self {
        self.fail_on.push(token.into());
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Tolerate failure of this command.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Serialised command/response access to the modem.
pub struct CommandTransport {
    writer: Mutex<Box<dyn Port>>,
    inbound: Arc<Inbound>,
}

impl CommandTransport {
    /// Create a transport writing through `writer` and reading through `inbound`.
    pub fn new(writer: Box<dyn Port>, inbound: Arc<Inbound>) -> Self {
        Self {
            writer: Mutex::new(writer),
            inbound,
        }
    }

    /// Shared inbound state fed by the stream reader.
    pub fn inbound(&self) -> &Arc<Inbound> {
        &self.inbound
    }

    /// Take exclusive use of the transport until the returned exchange is dropped.
    pub fn exclusive(&self) -> Exchange<'_> {
        Exchange {
            port: self
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            inbound: &self.inbound,
        }
    }

    /// Send `command` and wait for `expected_token`.
    ///
    /// Returns the status text captured during the exchange.
    pub fn execute(
        &self,
        command: &str,
        expected_token: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        self.run(
            &AtCommand::new(command)
                .expect(expected_token)
                .timeout(timeout),
        )
    }

    /// Run a single prepared command.
    pub fn run(&self, command: &AtCommand) -> Result<String, TransportError> {
        self.exclusive().run(command)
    }

    /// Put a request on the wire in one exclusive acquisition.
    pub fn send(&self, request: &Request) -> Result<(), TransportError> {
        let mut exchange = self.exclusive();
        match request {
            Request::Payload(bytes) => exchange.send_payload(bytes),
            Request::Commands(commands) => {
                for command in commands {
                    exchange.run(command)?;
                }
                Ok(())
            },
        }
    }
}

/// Exclusive use of the transport.
pub struct Exchange<'a> {
    port: MutexGuard<'a, Box<dyn Port>>,
    inbound: &'a Inbound,
}

impl Exchange<'_> {
    /// Write `command`, then wait for its verdict.
    pub fn run(&mut self, command: &AtCommand) -> Result<String, TransportError> {
        debug!("AT> {}", command.line);
        let mut line = command.line.clone().into_bytes();
        line.push(b'\r');
        let result = self.round_trip(
            &line,
            &command.expect,
            &command.fail_on,
            command.timeout,
            &command.line,
        );

        match result {
            Ok(text) => {
                trace!("AT< {}", text.trim());
                Ok(text)
            },
            Err(e) if command.optional => {
                debug!("Ignoring failure of optional {:?}: {e}", command.line);
                Ok(String::new())
            },
            Err(e) => Err(e),
        }
    }

    /// Send raw bytes through the open socket with `AT+CIPSEND`.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.run(
            &AtCommand::new(format!("AT+CIPSEND={}", payload.len()))
                .expect(">")
                .timeout(PROMPT_TIMEOUT),
        )?;
        debug!("Sending {} payload bytes", payload.len());
        let fail_on = ["SEND FAIL".to_string()];
        self.round_trip(payload, "SEND OK", &fail_on, SEND_TIMEOUT, "<payload>")
            .map(drop)
    }

    fn round_trip(
        &mut self,
        bytes: &[u8],
        expect: &str,
        fail_on: &[String],
        timeout: Duration,
        label: &str,
    ) -> Result<String, TransportError> {
        self.inbound.begin_capture();
        let result = self
            .port
            .write_all_bytes(bytes)
            .map_err(|e| TransportError::Io(e.to_string()))
            .and_then(|()| {
                self.inbound
                    .wait_for(expect, fail_on, Instant::now() + timeout, label)
            });
        self.inbound.end_capture();
        result
    }
}

/// Outcome of scanning captured text for the tokens of an exchange.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Success,
    Failure,
    Pending,
}

/// Judge captured text: whichever token appears first decides.
pub(crate) fn verdict(text: &str, expect: &str, fail_on: &[String]) -> Verdict {
    let success = text.find(expect);
    let failure = fail_on
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(ERROR_TOKEN))
        .filter_map(|token| text.find(token))
        .min();
    match (success, failure) {
        (Some(s), Some(f)) if f <= s => Verdict::Failure,
        (Some(_), _) => Verdict::Success,
        (None, Some(_)) => Verdict::Failure,
        (None, None) => Verdict::Pending,
    }
}
