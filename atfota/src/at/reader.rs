//! The stream reader: sole consumer of inbound modem bytes.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::at::{ERROR_TOKEN, Verdict, verdict};
use crate::demux::{LINK_LOSS_TOKENS, StreamDemux, StreamEvent};
use crate::error::TransportError;
use crate::port::Port;

type EventSink = Box<dyn FnMut(StreamEvent) + Send>;

struct InboundState {
    demux: StreamDemux,
    capture: Option<String>,
    sink: EventSink,
    running: bool,
}

/// Inbound side of the link, shared by the reader thread and command exchanges.
///
/// The demultiplexer lives here so that an exchange can look at the partial line
/// (the `>` send prompt never gets a line terminator) and the orchestrator can
/// reset it after an aborted chunk.
pub struct Inbound {
    state: Mutex<InboundState>,
    arrived: Condvar,
}

impl Inbound {
    /// Create inbound state that publishes every demultiplexed event to `sink`.
    pub fn new<F>(demux: StreamDemux, sink: F) -> Self
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        Self {
            state: Mutex::new(InboundState {
                demux,
                capture: None,
                sink: Box::new(sink),
                running: true,
            }),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed freshly read bytes through the demultiplexer.
    ///
    /// An `ERROR` that answers the command in flight fails that command; it is not
    /// reported as link loss.
    pub fn ingest(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let events = state.demux.feed(bytes);
        let mut answered = false;
        for event in events {
            match (&event, state.capture.as_mut()) {
                (StreamEvent::StatusLine(line), Some(capture)) => {
                    capture.push_str(line);
                    capture.push('\n');
                    answered = is_command_error(line);
                },
                (StreamEvent::LinkDropped, _) if answered => {
                    debug!("Error reply consumed by the command in flight");
                    answered = false;
                    continue;
                },
                _ => answered = false,
            }
            (state.sink)(event);
        }
        drop(state);
        self.arrived.notify_all();
    }

    /// Drop any half-received line or chunk and return to line mode.
    pub fn reset_stream(&self) {
        self.lock().demux.reset();
    }

    /// Whether the reader thread is still delivering bytes.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub(crate) fn begin_capture(&self) {
        self.lock().capture = Some(String::new());
    }

    pub(crate) fn end_capture(&self) {
        self.lock().capture = None;
    }

    pub(crate) fn mark_stopped(&self) {
        self.lock().running = false;
        self.arrived.notify_all();
    }

    /// Block until the capture decides the exchange or `deadline` passes.
    pub(crate) fn wait_for(
        &self,
        expect: &str,
        fail_on: &[String],
        deadline: Instant,
        label: &str,
    ) -> Result<String, TransportError> {
        let started = Instant::now();
        let mut state = self.lock();
        loop {
            let mut text = state.capture.clone().unwrap_or_default();
            text.push_str(&String::from_utf8_lossy(state.demux.partial_line()));

            match verdict(&text, expect, fail_on) {
                Verdict::Success => return Ok(text),
                Verdict::Failure => {
                    return Err(TransportError::ErrorToken {
                        command: label.to_string(),
                        response: text.trim().to_string(),
                    });
                },
                Verdict::Pending => {},
            }

            if !state.running {
                return Err(TransportError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    command: label.to_string(),
                    waited: now - started,
                });
            }
            state = self
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

fn is_command_error(line: &str) -> bool {
    line.contains(ERROR_TOKEN)
        && LINK_LOSS_TOKENS
            .iter()
            .filter(|token| **token != ERROR_TOKEN)
            .all(|token| !line.contains(token))
}

/// Background thread draining the port into an [`Inbound`].
pub struct StreamReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Start draining `port`. The port's read timeout bounds how long a stop request
    /// can go unnoticed.
    pub fn spawn(mut port: Box<dyn Port>, inbound: Arc<Inbound>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        debug!("Stream reader draining {}", port.name());
        let handle = thread::Builder::new()
            .name("atfota-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                while !stop_flag.load(Ordering::Relaxed) {
                    match port.read(&mut buf) {
                        Ok(0) => {},
                        Ok(n) => {
                            trace!("RX {n} bytes: {:?}", String::from_utf8_lossy(&buf[..n]));
                            inbound.ingest(&buf[..n]);
                        },
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut
                                    | io::ErrorKind::WouldBlock
                                    | io::ErrorKind::Interrupted
                            ) => {},
                        Err(e) => {
                            warn!("Stream reader stopping: {e}");
                            break;
                        },
                    }
                }
                debug!("Stream reader exited");
                inbound.mark_stopped();
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedModem;
    use crate::protocol::{JsonLineEncoding, WireEncoding};
    use std::sync::mpsc;
    use std::time::Duration;

    fn inbound() -> (Arc<Inbound>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel();
        let demux = StreamDemux::new(Arc::new(WireEncoding::JsonLine(JsonLineEncoding)));
        let inbound = Inbound::new(demux, move |event| {
            let _ = tx.send(event);
        });
        (Arc::new(inbound), rx)
    }

    #[test]
    fn test_reader_publishes_events_in_stream_order() {
        let (inbound, rx) = inbound();
        let modem = ScriptedModem::new();
        let _reader = StreamReader::spawn(modem.boxed(), Arc::clone(&inbound)).unwrap();

        modem.push_inbound(b"RDY\r\n+CFUN: 1\r\n");
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, StreamEvent::StatusLine("RDY".into()));
        assert_eq!(second, StreamEvent::StatusLine("+CFUN: 1".into()));
    }

    #[test]
    fn test_reader_stops_on_closed_port() {
        let (inbound, _rx) = inbound();
        let mut modem = ScriptedModem::new();
        let mut reader = StreamReader::spawn(modem.boxed(), Arc::clone(&inbound)).unwrap();

        modem.close().unwrap();
        reader.stop();
        assert!(!inbound.is_running());

        let err = inbound
            .wait_for("OK", &[], Instant::now() + Duration::from_secs(1), "AT")
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[test]
    fn test_capture_only_sees_status_lines() {
        let (inbound, _rx) = inbound();
        inbound.begin_capture();
        inbound.ingest(b"{\"offset\":0,\"size\":2,\"total\":2}\nOK\r\nSEND OK\r\n");
        let text = inbound
            .wait_for("SEND OK", &[], Instant::now(), "x")
            .unwrap();
        // The chunk header and its two payload bytes ("OK") never reach the capture
        assert_eq!(text, "SEND OK\n");
        inbound.end_capture();
    }

    #[test]
    fn test_error_reply_is_not_link_loss() {
        let (inbound, rx) = inbound();

        inbound.begin_capture();
        inbound.ingest(b"\r\n+CME ERROR: 58\r\n");
        inbound.end_capture();
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::StatusLine("+CME ERROR: 58".into())
        );
        assert!(rx.try_recv().is_err());

        // Socket closure during a command is still reported
        inbound.begin_capture();
        inbound.ingest(b"CLOSED\r\n");
        inbound.end_capture();
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::StatusLine("CLOSED".into()));
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::LinkDropped);

        // Unsolicited ERROR outside any command is link loss
        inbound.ingest(b"ERROR\r\n");
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::StatusLine("ERROR".into()));
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::LinkDropped);
    }

    #[test]
    fn test_server_record_does_not_fail_the_command() {
        let (inbound, rx) = inbound();
        let record = br#"{"status":"success","version":"1.1.0","name":"ERROR recovery","size":4,"md5":"00112233445566778899aabbccddeeff"}"#;
        let mut stream = record.to_vec();
        stream.extend_from_slice(b"\r\nSEND OK\r\n");

        inbound.begin_capture();
        inbound.ingest(&stream);
        let text = inbound
            .wait_for("SEND OK", &[], Instant::now(), "<payload>")
            .unwrap();
        inbound.end_capture();
        assert_eq!(text, "SEND OK\n");

        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Record(record.to_vec()));
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::StatusLine("SEND OK".into()));
        assert!(rx.try_recv().is_err());
    }
}
