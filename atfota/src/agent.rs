//! Runtime wiring.
//!
//! An [`Agent`] owns one modem port and runs three activities over it:
//!
//! ```text
//!   port --(read clone)--> StreamReader thread --+
//!                                                 |  Incoming::Stream
//!   Scheduler thread --- CheckRequested --------->+--> mpsc --> Agent::run
//!        |               ReconnectRequested       |               |
//!        |                                        |               v
//!        +--- keep-alive / diagnostics ---> CommandTransport <-- Orchestrator
//! ```
//!
//! The orchestrator runs on the caller's thread and is the only consumer of the
//! event channel. The link manager is the only writer of the link state.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::at::{CommandTransport, Inbound, StreamReader};
use crate::demux::{StreamDemux, StreamEvent};
use crate::error::{Error, LinkError, Result, TransportError};
use crate::link::{
    ConnectionStatus, LinkConfig, LinkHandle, LinkManager, LinkState, SignalQuality,
    query_connection_status, query_signal_quality,
};
use crate::orchestrator::{
    Incoming, Orchestrator, SessionHandle, TransferConfig, TransferEvent, TransferIo,
    UpdateOutcome,
};
use crate::port::Port;
use crate::protocol::{Bearer, ChunkProtocol, FirmwareDescriptor, Request};
use crate::sink::OtaSink;

/// Longest a blocking wait goes without looking at the interrupt checker.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Timing of the background activities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Link bring-up settings.
    pub link: LinkConfig,
    /// Update session settings.
    pub transfer: TransferConfig,
    /// Keep-alive period.
    pub ping_interval: Duration,
    /// Update check period.
    pub check_interval: Duration,
    /// Delay before the first check.
    pub initial_check_delay: Duration,
    /// Signal/connection report period.
    pub status_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            transfer: TransferConfig::default(),
            ping_interval: Duration::from_secs(30),
            check_interval: Duration::from_secs(60),
            initial_check_delay: Duration::from_secs(5),
            status_interval: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Defaults around the given link and transfer settings.
    pub fn new(link: LinkConfig, transfer: TransferConfig) -> Self {
        Self {
            link,
            transfer,
            ..Self::default()
        }
    }

    /// Set the keep-alive and check periods.
    #[must_use]
    pub fn with_intervals(mut self, ping: Duration, check: Duration) -> Self {
        self.ping_interval = ping;
        self.check_interval = check;
        self
    }

    /// Set the delay before the first check.
    #[must_use]
    pub fn with_initial_check_delay(mut self, delay: Duration) -> Self {
        self.initial_check_delay = delay;
        self
    }
}

/// Why [`Agent::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// A new image is committed; the device should restart into it.
    RestartRequested {
        /// The committed version.
        version: String,
    },
    /// The interrupt checker fired.
    Interrupted,
}

/// One-shot modem report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// `AT+CSQ` result, `None` if the modem did not report one.
    pub signal: Option<SignalQuality>,
    /// `AT+CIPSTATUS` result.
    pub connection: ConnectionStatus,
    /// The link state as this agent sees it.
    pub link: LinkState,
}

/// A FOTA client bound to one modem.
pub struct Agent<S> {
    protocol: Arc<dyn ChunkProtocol>,
    transport: Arc<CommandTransport>,
    link: LinkManager,
    orchestrator: Orchestrator<S>,
    events: Receiver<Incoming>,
    events_tx: Sender<Incoming>,
    config: AgentConfig,
    _reader: StreamReader,
}

impl<S: OtaSink> Agent<S> {
    /// Start the stream reader on a clone of `port` and wire everything up.
    ///
    /// No AT traffic happens until the first check or [`Agent::run`].
    pub fn new(
        port: Box<dyn Port>,
        protocol: Arc<dyn ChunkProtocol>,
        sink: S,
        config: AgentConfig,
    ) -> Result<Self> {
        let (events_tx, events) = mpsc::channel();
        let stream_tx = events_tx.clone();
        let demux = StreamDemux::new(Arc::clone(&protocol))
            .with_max_capture(config.transfer.max_capture);
        let inbound = Arc::new(Inbound::new(demux, move |event| {
            let _ = stream_tx.send(Incoming::Stream(event));
        }));

        let reader = StreamReader::spawn(port.try_clone_port()?, Arc::clone(&inbound))?;
        let transport = Arc::new(CommandTransport::new(port, inbound));
        let link = LinkManager::new(
            Arc::clone(&transport),
            Arc::clone(&protocol),
            config.link.clone(),
        );
        let orchestrator =
            Orchestrator::new(Arc::clone(&protocol), sink, config.transfer.clone());

        Ok(Self {
            protocol,
            transport,
            link,
            orchestrator,
            events,
            events_tx,
            config,
            _reader: reader,
        })
    }

    /// Report session progress to `observer`.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&TransferEvent) + Send + 'static,
    {
        self.orchestrator.set_observer(observer);
        self
    }

    /// The link manager.
    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    /// Read-only view of the update session.
    pub fn session(&self) -> SessionHandle {
        self.orchestrator.session()
    }

    /// The sink.
    pub fn sink(&self) -> &S {
        self.orchestrator.sink()
    }

    /// Bring the link up if needed and ask the server for an update.
    pub fn check_once(&mut self) -> Result<Option<FirmwareDescriptor>> {
        self.link.ensure_link_up()?;
        self.drain_stale();
        let mut io = AgentIo {
            transport: &self.transport,
            events: &self.events,
        };
        let result = self.orchestrator.check(&mut io);
        self.after_session(&result);
        result
    }

    /// Bring the link up if needed and run one full update cycle.
    pub fn update_once(&mut self) -> Result<UpdateOutcome> {
        self.link.ensure_link_up()?;
        self.drain_stale();
        let mut io = AgentIo {
            transport: &self.transport,
            events: &self.events,
        };
        let result = self.orchestrator.check_and_update(&mut io);
        self.after_session(&result);
        result
    }

    /// Query signal quality and socket state.
    pub fn diagnostics(&self) -> Result<Diagnostics> {
        Ok(Diagnostics {
            signal: self.link.signal_quality()?,
            connection: self.link.connection_status()?,
            link: self.link.state(),
        })
    }

    /// Run until an update is committed or the interrupt checker fires.
    ///
    /// Failed update cycles are logged and retried on the next check tick.
    pub fn run(&mut self) -> Result<RunExit> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let scheduler = Scheduler {
            transport: Arc::clone(&self.transport),
            protocol: Arc::clone(&self.protocol),
            link: self.link.handle(),
            session: self.orchestrator.session(),
            events: self.events_tx.clone(),
            config: self.config.clone(),
        }
        .spawn(stop_rx)?;

        let result = self.event_loop();

        let _ = stop_tx.send(());
        if scheduler.join().is_err() {
            warn!("Scheduler thread panicked");
        }
        result
    }

    fn event_loop(&mut self) -> Result<RunExit> {
        self.bring_up()?;
        loop {
            if crate::is_interrupted_requested() {
                info!("Interrupted, stopping agent");
                return Ok(RunExit::Interrupted);
            }
            let incoming = match self.events.recv_timeout(POLL_SLICE) {
                Ok(incoming) => incoming,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed.into()),
            };

            match incoming {
                Incoming::CheckRequested => match self.update_once() {
                    Ok(UpdateOutcome::Installed { version, .. }) => {
                        return Ok(RunExit::RestartRequested { version });
                    },
                    Ok(UpdateOutcome::UpToDate) => {},
                    Err(Error::Interrupted | Error::Link(LinkError::Interrupted)) => {
                        return Ok(RunExit::Interrupted);
                    },
                    Err(e) => warn!("Update cycle failed: {e}"),
                },
                Incoming::ReconnectRequested => self.bring_up()?,
                Incoming::Stream(StreamEvent::LinkDropped) => {
                    if self.link.handle().is_up() {
                        self.reconnect_after_drop()?;
                    } else {
                        debug!("Link loss reported while already down");
                    }
                },
                Incoming::Stream(StreamEvent::StatusLine(line)) => trace!("Unsolicited: {line}"),
                Incoming::Stream(other) => debug!("Dropping event outside a session: {other:?}"),
                Incoming::Shutdown => return Ok(RunExit::Interrupted),
            }
        }
    }

    fn bring_up(&self) -> Result<()> {
        match self.link.ensure_link_up() {
            Ok(_) => Ok(()),
            Err(LinkError::Interrupted) => Err(Error::Interrupted),
            Err(e) => {
                warn!("Link bring-up failed: {e}");
                Ok(())
            },
        }
    }

    fn reconnect_after_drop(&self) -> Result<()> {
        match self.link.handle_link_dropped() {
            Ok(_) => Ok(()),
            Err(LinkError::Interrupted) => Err(Error::Interrupted),
            Err(e) => {
                warn!("Reconnect failed: {e}");
                Ok(())
            },
        }
    }

    /// The orchestrator consumed any link-loss event, so act on it here.
    fn after_session<T>(&self, result: &Result<T>) {
        if matches!(result, Err(Error::Link(LinkError::Dropped))) {
            if let Err(e) = self.link.handle_link_dropped() {
                warn!("Reconnect failed: {e}");
            }
        }
    }

    fn drain_stale(&self) {
        while let Ok(incoming) = self.events.try_recv() {
            trace!("Discarding stale {incoming:?}");
        }
    }
}

/// [`TransferIo`] over the command transport and the agent's event channel.
struct AgentIo<'a> {
    transport: &'a CommandTransport,
    events: &'a Receiver<Incoming>,
}

impl TransferIo for AgentIo<'_> {
    fn send(&mut self, request: &Request) -> std::result::Result<(), TransportError> {
        self.transport.send(request)
    }

    fn next(&mut self, timeout: Duration) -> Option<Incoming> {
        let deadline = Instant::now() + timeout;
        loop {
            if crate::is_interrupted_requested() {
                return Some(Incoming::Shutdown);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.events.recv_timeout(remaining.min(POLL_SLICE)) {
                Ok(incoming) => return Some(incoming),
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn reset_stream(&mut self) {
        self.transport.inbound().reset_stream();
    }
}

/// Periodic keep-alive, check and status ticks.
struct Scheduler {
    transport: Arc<CommandTransport>,
    protocol: Arc<dyn ChunkProtocol>,
    link: LinkHandle,
    session: SessionHandle,
    events: Sender<Incoming>,
    config: AgentConfig,
}

impl Scheduler {
    fn spawn(self, stop: Receiver<()>) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("atfota-scheduler".into())
            .spawn(move || self.run(&stop))?;
        Ok(handle)
    }

    fn run(&self, stop: &Receiver<()>) {
        let start = Instant::now();
        let mut next_ping = start + self.config.ping_interval;
        let mut next_check = start + self.config.initial_check_delay;
        let mut next_status = start + self.config.status_interval;

        loop {
            let due = next_ping.min(next_check).min(next_status);
            match stop.recv_timeout(due.saturating_duration_since(Instant::now())) {
                Err(RecvTimeoutError::Timeout) => {},
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if now >= next_check {
                debug!("Update check due");
                if self.events.send(Incoming::CheckRequested).is_err() {
                    break;
                }
                next_check = now + self.config.check_interval;
            }
            if now >= next_ping {
                if !self.keep_alive() {
                    break;
                }
                next_ping = now + self.config.ping_interval;
            }
            if now >= next_status {
                if !self.report_status() {
                    break;
                }
                next_status = now + self.config.status_interval;
            }
        }
        debug!("Scheduler exited");
    }

    /// Returns `false` once the agent has gone away.
    fn keep_alive(&self) -> bool {
        if !self.link.is_up() {
            debug!("Keep-alive tick with link down, requesting reconnect");
            return self
                .events
                .send(Incoming::ReconnectRequested)
                .is_ok();
        }
        if self.session.snapshot().status.is_active() {
            trace!("Transfer traffic stands in for the keep-alive");
            return true;
        }
        if let Some(ping) = self.protocol.keep_alive() {
            debug!("Sending keep-alive");
            if let Err(e) = self.transport.send(&ping) {
                warn!("Keep-alive failed: {e}");
            }
        }
        true
    }

    /// Returns `false` once the agent has gone away.
    fn report_status(&self) -> bool {
        if !self.link.is_up() || self.session.snapshot().status.is_active() {
            return true;
        }
        let signal = match query_signal_quality(&self.transport) {
            Ok(Some(signal)) => signal.to_string(),
            Ok(None) => "unknown".into(),
            Err(e) => {
                warn!("Signal query failed: {e}");
                return true;
            },
        };
        let status = match query_connection_status(&self.transport) {
            Ok(status) => status,
            Err(e) => {
                warn!("Connection status query failed: {e}");
                return true;
            },
        };
        info!("Signal {signal}, connection {status}");

        let lost = match status {
            ConnectionStatus::PdpDeact => true,
            ConnectionStatus::TcpClosed | ConnectionStatus::TcpClosing => {
                self.link.bearer() == Bearer::Socket
            },
            _ => false,
        };
        if lost {
            warn!("Modem reports {status}, treating as link loss");
            return self
                .events
                .send(Incoming::Stream(StreamEvent::LinkDropped))
                .is_ok();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::ScriptedModem;
    use crate::protocol::{
        HttpRangeEncoding, HttpSettings, JsonLineEncoding, MqttEncoding, MqttSettings, WireEncoding,
        mqtt,
    };
    use crate::sink::{MemorySink, to_hex};
    use md5::{Digest, Md5};

    fn image() -> Vec<u8> {
        (0..2000u32)
            .map(|i| (i.wrapping_mul(31) % 251) as u8)
            .collect()
    }

    fn chunk_reply(image: &[u8], offset: usize, size: usize) -> Vec<u8> {
        let mut reply = format!(
            "\r\nSEND OK\r\n{{\"status\":\"success\",\"offset\":{offset},\"size\":{size},\"total\":{}}}\n",
            image.len()
        )
        .into_bytes();
        reply.extend_from_slice(&image[offset..offset + size]);
        reply
    }

    fn descriptor_json(image: &[u8], version: &str, extra: &str) -> String {
        format!(
            "{{\"status\":\"success\",\"version\":\"{version}\",\"name\":\"app\",\"size\":{},\"md5\":\"{}\"{extra}}}",
            image.len(),
            to_hex(&Md5::digest(image))
        )
    }

    /// Handshake, registration and attach answered on the first try.
    fn registered(modem: ScriptedModem) -> ScriptedModem {
        modem
            .on("AT\r", "\r\nOK\r\n")
            .on("ATE0", "\r\nOK\r\n")
            .on("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n")
            .on("AT+CREG?", "\r\n+CREG: 0,1\r\n\r\nOK\r\n")
            .on("AT+CGATT?", "\r\n+CGATT: 1\r\n\r\nOK\r\n")
    }

    /// A modem that brings up a GPRS context and a TCP socket.
    fn socket_modem() -> ScriptedModem {
        registered(ScriptedModem::new())
            .on("AT+CIPSHUT", "\r\nSHUT OK\r\n")
            .on("AT+CIPMUX=0", "\r\nOK\r\n")
            .on("AT+CSTT=", "\r\nOK\r\n")
            .on("AT+CIICR", "\r\nOK\r\n")
            .on("AT+CIFSR", "\r\n10.64.12.7\r\n")
            .on("AT+CIPSTART=", "\r\nOK\r\n\r\nCONNECT OK\r\n")
            .on("AT+CIPSEND=", "\r\n> ")
    }

    fn fota_modem(image: &[u8], version: &str) -> ScriptedModem {
        let descriptor = format!("\r\nSEND OK\r\n{}\n", descriptor_json(image, version, ""));
        socket_modem()
            .on("\"action\":\"check\"", descriptor)
            .on("\"offset\":0,", chunk_reply(image, 0, 1024))
            .on("\"offset\":1024,", chunk_reply(image, 1024, 976))
    }

    fn mqtt_modem(image: &[u8], version: &str) -> ScriptedModem {
        let settings = MqttSettings::default();
        let sent = |packet: Vec<u8>| {
            let mut reply = b"\r\nSEND OK\r\n".to_vec();
            reply.extend(packet);
            reply
        };
        let data = |offset: usize, size: usize| {
            let mut body = format!(
                "{{\"offset\":{offset},\"size\":{size},\"total\":{}}}\n",
                image.len()
            )
            .into_bytes();
            body.extend_from_slice(&image[offset..offset + size]);
            sent(mqtt::publish(&settings.data_topic, &body).unwrap())
        };
        let descriptor = descriptor_json(image, version, "");

        socket_modem()
            // CONNACK and SUBACK arrive glued to the SEND OK of their requests
            .on("MQTT", sent(vec![0x20, 0x02, 0x00, 0x00]))
            .on(&settings.info_topic, sent(vec![0x90, 0x03, 0x00, 0x01, 0x00]))
            .on(
                "\"action\":\"check\"",
                sent(mqtt::publish(&settings.info_topic, descriptor.as_bytes()).unwrap()),
            )
            .on("\"offset\":0,", data(0, 1024))
            .on("\"offset\":1024,", data(1024, 976))
    }

    fn http_reply(body: &[u8]) -> Vec<u8> {
        let mut reply = format!("\r\n+HTTPREAD: {}\r\n", body.len()).into_bytes();
        reply.extend_from_slice(body);
        reply.extend_from_slice(b"\r\nOK\r\n");
        reply
    }

    fn http_modem(image: &[u8], version: &str) -> ScriptedModem {
        let descriptor = descriptor_json(image, version, ",\"file\":\"/fw/app-1.1.0.bin\"");
        registered(ScriptedModem::new())
            .on("AT+SAPBR=2,1", "\r\n+SAPBR: 1,1,\"10.1.2.3\"\r\n\r\nOK\r\n")
            .on("AT+SAPBR=", "\r\nOK\r\n")
            .on("AT+HTTPTERM", "\r\nOK\r\n")
            .on("AT+HTTPINIT", "\r\nOK\r\n")
            .on("AT+HTTPPARA=", "\r\nOK\r\n")
            .on(
                "AT+HTTPACTION=0",
                format!("\r\nOK\r\n\r\n+HTTPACTION: 0,200,{}\r\n", image.len()),
            )
            .on("AT+HTTPREAD\r", http_reply(descriptor.as_bytes()))
            .on("AT+HTTPREAD=0,1024\r", http_reply(&image[..1024]))
            .on("AT+HTTPREAD=1024,976\r", http_reply(&image[1024..]))
    }

    fn config() -> AgentConfig {
        let link = LinkConfig::default()
            .with_server("fota.example.com", 5000)
            .with_retry_delay(Duration::ZERO);
        let transfer = TransferConfig::new("esp32_001", "1.0.0")
            .with_retries(2, Duration::ZERO)
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
        AgentConfig::new(link, transfer)
            .with_intervals(Duration::from_secs(3600), Duration::from_secs(3600))
            .with_initial_check_delay(Duration::ZERO)
    }

    fn agent_with(modem: &ScriptedModem, encoding: WireEncoding) -> Agent<MemorySink> {
        let _ = env_logger::builder().is_test(true).try_init();
        Agent::new(
            modem.boxed(),
            Arc::new(encoding),
            MemorySink::default(),
            config(),
        )
        .unwrap()
    }

    fn agent(modem: &ScriptedModem) -> Agent<MemorySink> {
        agent_with(modem, WireEncoding::JsonLine(JsonLineEncoding))
    }

    #[test]
    fn test_update_once_over_scripted_modem() {
        let image = image();
        let modem = fota_modem(&image, "1.1.0");
        let mut agent = agent(&modem);

        let outcome = agent.update_once().unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Installed {
                version: "1.1.0".into(),
                restart_requested: true,
            }
        );
        assert_eq!(agent.sink().data(), image.as_slice());
        assert!(agent.sink().is_committed());
        assert!(agent.link().handle().is_up());
        assert_eq!(modem.count_written("AT+CIPSEND="), 3);
        assert_eq!(modem.count_written("AT+CIPSTART="), 1);
    }

    #[test]
    fn test_check_once_reports_up_to_date() {
        let image = image();
        let modem = fota_modem(&image, "1.0.0");
        let mut agent = agent(&modem);

        assert_eq!(agent.check_once().unwrap(), None);
        assert_eq!(modem.count_written("\"action\":\"download\""), 0);
        assert_eq!(agent.sink().writes(), 0);
    }

    #[test]
    fn test_run_exits_with_restart_request() {
        let image = image();
        let modem = fota_modem(&image, "2.0.0");
        let mut agent = agent(&modem);

        assert_eq!(
            agent.run().unwrap(),
            RunExit::RestartRequested {
                version: "2.0.0".into()
            }
        );
        assert_eq!(agent.sink().data(), image.as_slice());
    }

    #[test]
    fn test_update_once_over_mqtt() {
        let image = image();
        let modem = mqtt_modem(&image, "1.1.0");
        let mut agent = agent_with(&modem, WireEncoding::Mqtt(MqttEncoding::default()));

        let outcome = agent.update_once().unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Installed {
                version: "1.1.0".into(),
                restart_requested: true,
            }
        );
        assert_eq!(agent.sink().data(), image.as_slice());
        assert!(agent.sink().is_committed());
        assert_eq!(modem.count_written("MQTT"), 1);
        // one check and two chunk requests
        assert_eq!(modem.count_written("device/firmware/request"), 3);
    }

    #[test]
    fn test_update_once_over_http_range() {
        let image = image();
        let modem = http_modem(&image, "1.1.0");
        let encoding = HttpRangeEncoding::new(HttpSettings {
            base_url: "http://fota.example.com".into(),
            ..HttpSettings::default()
        });
        let mut agent = agent_with(&modem, WireEncoding::HttpRange(encoding));

        let outcome = agent.update_once().unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Installed {
                version: "1.1.0".into(),
                restart_requested: true,
            }
        );
        assert_eq!(agent.sink().data(), image.as_slice());
        assert!(agent.sink().is_committed());

        let written = modem.written_text();
        assert!(
            written.contains("AT+HTTPPARA=\"URL\",\"http://fota.example.com/fw/app-1.1.0.bin\"\r")
        );
        assert_eq!(modem.count_written("AT+HTTPREAD="), 2);
        assert_eq!(modem.count_written("AT+HTTPACTION=0"), 2);
        assert!(!written.contains("AT+CIPSTART"));
    }

    #[test]
    fn test_diagnostics() {
        let modem = ScriptedModem::new()
            .on("AT+CSQ", "\r\n+CSQ: 18,0\r\n\r\nOK\r\n")
            .on("AT+CIPSTATUS", "\r\nOK\r\n\r\nSTATE: IP INITIAL\r\n");
        let agent = agent(&modem);

        let report = agent.diagnostics().unwrap();
        assert_eq!(report.signal.unwrap().dbm(), Some(-77));
        assert_eq!(report.connection, ConnectionStatus::IpInitial);
        assert_eq!(report.link, LinkState::default());
    }
}
