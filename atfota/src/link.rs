//! Packet-data link management.
//!
//! Brings a SIM800-class modem from power-on to a usable data path:
//!
//! 1. probe with `AT`, disable echo, check the SIM
//! 2. poll network registration (`AT+CREG?`)
//! 3. attach to packet service (`AT+CGATT`)
//! 4. socket bearer: `AT+CIPSHUT`, `AT+CIPMUX=0`, `AT+CSTT`, `AT+CIICR`, `AT+CIFSR`,
//!    then `AT+CIPSTART`; HTTP bearer: `AT+SAPBR` profile 1
//! 5. send the wire encoding's session frames (MQTT CONNECT/SUBSCRIBE)
//!
//! [`LinkManager`] is the only writer of [`LinkState`]; everything else reads it
//! through a [`LinkHandle`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};

use crate::at::{AtCommand, CommandTransport};
use crate::error::{LinkError, TransportError};
use crate::protocol::{Bearer, ChunkProtocol};

/// Link bring-up settings. Defaults follow the SIM800 timing the firmware uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Access point name.
    pub apn: String,
    /// APN user, empty for none.
    pub apn_user: String,
    /// APN password, empty for none.
    pub apn_password: String,
    /// Update server host for the socket bearer.
    pub server_host: String,
    /// Update server port for the socket bearer.
    pub server_port: u16,
    /// `AT` probes before giving up.
    pub probe_attempts: usize,
    /// Pause between `AT` probes.
    pub probe_delay: Duration,
    /// Wait for `READY` after `AT+CPIN?`.
    pub sim_timeout: Duration,
    /// Registration polls.
    pub registration_polls: usize,
    /// Pause between registration polls.
    pub registration_delay: Duration,
    /// Attach attempts.
    pub attach_attempts: usize,
    /// Pause between attach attempts.
    pub attach_delay: Duration,
    /// Wait for `SHUT OK`.
    pub shutdown_timeout: Duration,
    /// `AT+CSTT` attempts.
    pub apn_attempts: usize,
    /// Pause between `AT+CSTT` attempts.
    pub apn_delay: Duration,
    /// Wait for `AT+CIICR`.
    pub activation_timeout: Duration,
    /// `AT+CIICR` attempts.
    pub activation_attempts: usize,
    /// Pause between `AT+CIICR` attempts.
    pub activation_delay: Duration,
    /// Wait for the IP address.
    pub ip_timeout: Duration,
    /// Wait for `CONNECT` after `AT+CIPSTART`, and for `AT+SAPBR=1,1`.
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            apn: "internet".into(),
            apn_user: String::new(),
            apn_password: String::new(),
            server_host: String::new(),
            server_port: 1883,
            probe_attempts: 3,
            probe_delay: Duration::from_secs(1),
            sim_timeout: Duration::from_secs(5),
            registration_polls: 30,
            registration_delay: Duration::from_secs(2),
            attach_attempts: 10,
            attach_delay: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(10),
            apn_attempts: 3,
            apn_delay: Duration::from_secs(2),
            activation_timeout: Duration::from_secs(30),
            activation_attempts: 3,
            activation_delay: Duration::from_secs(5),
            ip_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl LinkConfig {
    /// Set the APN and its credentials.
    #[must_use]
    pub fn with_apn(
        mut self,
        apn: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.apn = apn.into();
        self.apn_user = user.into();
        self.apn_password = password.into();
        self
    }

    /// Set the update server address.
    #[must_use]
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server_host = host.into();
        self.server_port = port;
        self
    }

    /// Use the same pause between every kind of retry.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self.registration_delay = delay;
        self.attach_delay = delay;
        self.apn_delay = delay;
        self.activation_delay = delay;
        self
    }
}

/// What the link manager believes about the modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    /// Attached to packet service.
    pub attached: bool,
    /// Data bearer (PDP context or SAPBR profile) active.
    pub session_active: bool,
    /// TCP socket to the server open.
    pub socket_connected: bool,
}

impl LinkState {
    /// Whether the data path for `bearer` is usable.
    pub fn is_up(&self, bearer: Bearer) -> bool {
        match bearer {
            Bearer::Socket => self.session_active && self.socket_connected,
            Bearer::Http => self.session_active,
        }
    }
}

/// Read-only view of a [`LinkManager`]'s state.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    state: Arc<Mutex<LinkState>>,
    bearer: Bearer,
}

impl LinkHandle {
    /// Current state.
    pub fn snapshot(&self) -> LinkState {
        *self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the data path is usable.
    pub fn is_up(&self) -> bool {
        self.snapshot().is_up(self.bearer)
    }

    /// Data path this link serves.
    pub fn bearer(&self) -> Bearer {
        self.bearer
    }

    fn update(&self, f: impl FnOnce(&mut LinkState)) {
        f(&mut self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner));
    }
}

/// Result of [`LinkManager::ensure_link_up`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    /// Nothing was sent.
    AlreadyUp,
    /// The full bring-up ran.
    Established,
}

/// `+CSQ` reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    /// Received signal strength index, 0-31, 99 unknown.
    pub rssi: u8,
    /// Bit error rate index, 0-7, 99 unknown.
    pub ber: u8,
}

impl SignalQuality {
    /// Signal strength in dBm, if known.
    pub fn dbm(&self) -> Option<i32> {
        (self.rssi <= 31).then(|| -113 + 2 * i32::from(self.rssi))
    }

    fn parse(text: &str) -> Option<Self> {
        let rest = &text[text.find("+CSQ:")? + 5..];
        let line = rest.lines().next()?;
        let (rssi, ber) = line.split_once(',')?;
        Some(Self {
            rssi: rssi.trim().parse().ok()?,
            ber: ber.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dbm() {
            Some(dbm) => write!(f, "{dbm} dBm (rssi {})", self.rssi),
            None => write!(f, "unknown"),
        }
    }
}

/// Socket state reported by `AT+CIPSTATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// `IP INITIAL`
    IpInitial,
    /// `IP START`
    IpStart,
    /// `IP CONFIG`
    IpConfig,
    /// `IP GPRSACT`
    IpGprsAct,
    /// `IP STATUS`: bearer up, IP assigned.
    IpStatus,
    /// `TCP CONNECTING`
    TcpConnecting,
    /// `CONNECT OK`
    ConnectOk,
    /// `TCP CLOSING`
    TcpClosing,
    /// `TCP CLOSED`
    TcpClosed,
    /// `PDP DEACT`: the network dropped the context.
    PdpDeact,
    /// Anything else.
    Unknown,
}

impl ConnectionStatus {
    const TABLE: [(&'static str, Self); 10] = [
        ("IP INITIAL", Self::IpInitial),
        ("IP START", Self::IpStart),
        ("IP CONFIG", Self::IpConfig),
        ("IP GPRSACT", Self::IpGprsAct),
        ("IP STATUS", Self::IpStatus),
        ("TCP CONNECTING", Self::TcpConnecting),
        ("CONNECT OK", Self::ConnectOk),
        ("TCP CLOSING", Self::TcpClosing),
        ("TCP CLOSED", Self::TcpClosed),
        ("PDP DEACT", Self::PdpDeact),
    ];

    /// Find the `STATE:` value in a `AT+CIPSTATUS` reply.
    pub fn parse(text: &str) -> Self {
        let state = text
            .find("STATE:")
            .map_or(text, |at| &text[at + 6..]);
        Self::TABLE
            .iter()
            .find(|(token, _)| state.contains(token))
            .map_or(Self::Unknown, |(_, status)| *status)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::TABLE
            .iter()
            .find(|(_, status)| status == self)
            .map_or("UNKNOWN", |(token, _)| *token);
        f.write_str(name)
    }
}

/// Query signal quality with `AT+CSQ`.
pub fn query_signal_quality(
    transport: &CommandTransport,
) -> Result<Option<SignalQuality>, TransportError> {
    let text = transport.run(&AtCommand::new("AT+CSQ"))?;
    Ok(SignalQuality::parse(&text))
}

/// Query socket state with `AT+CIPSTATUS` without touching any [`LinkState`].
pub fn query_connection_status(
    transport: &CommandTransport,
) -> Result<ConnectionStatus, TransportError> {
    let text = transport.run(&AtCommand::new("AT+CIPSTATUS").expect("STATE:"))?;
    Ok(ConnectionStatus::parse(&text))
}

/// Owns the link bring-up sequence and the [`LinkState`] it produces.
pub struct LinkManager {
    transport: Arc<CommandTransport>,
    protocol: Arc<dyn ChunkProtocol>,
    config: LinkConfig,
    handle: LinkHandle,
}

impl LinkManager {
    /// Create a manager for the data path `protocol` needs.
    pub fn new(
        transport: Arc<CommandTransport>,
        protocol: Arc<dyn ChunkProtocol>,
        config: LinkConfig,
    ) -> Self {
        let handle = LinkHandle {
            state: Arc::new(Mutex::new(LinkState::default())),
            bearer: protocol.bearer(),
        };
        Self {
            transport,
            protocol,
            config,
            handle,
        }
    }

    /// A read-only view of the link state.
    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.handle.snapshot()
    }

    /// Bring the data path up unless it already is.
    pub fn ensure_link_up(&self) -> Result<LinkTransition, LinkError> {
        if self.handle.is_up() {
            return Ok(LinkTransition::AlreadyUp);
        }

        let bearer = self.protocol.bearer();
        info!("Bringing up {bearer:?} link");
        self.handle
            .update(|s| *s = LinkState::default());

        self.probe()?;
        self.wait_for_registration()?;
        self.attach()?;
        self.handle.update(|s| s.attached = true);

        match bearer {
            Bearer::Socket => {
                self.activate_context()?;
                self.handle
                    .update(|s| s.session_active = true);
                self.connect_socket()?;
                self.handle
                    .update(|s| s.socket_connected = true);
            },
            Bearer::Http => {
                self.open_http_bearer()?;
                self.handle
                    .update(|s| s.session_active = true);
            },
        }

        self.start_session()?;
        info!("Link up");
        Ok(LinkTransition::Established)
    }

    /// React to link loss: mark the link down and run the full bring-up again.
    pub fn handle_link_dropped(&self) -> Result<LinkTransition, LinkError> {
        warn!("Link dropped, reconnecting");
        self.handle
            .update(|s| *s = LinkState::default());
        self.ensure_link_up()
    }

    /// Close the TCP socket.
    pub fn close_socket(&self) -> Result<(), LinkError> {
        let result = self.transport.run(
            &AtCommand::new("AT+CIPCLOSE")
                .expect("CLOSE OK")
                .timeout(self.config.ip_timeout),
        );
        self.handle
            .update(|s| s.socket_connected = false);
        result.map(drop).map_err(LinkError::from)
    }

    /// Query signal quality with `AT+CSQ`.
    pub fn signal_quality(&self) -> Result<Option<SignalQuality>, TransportError> {
        query_signal_quality(&self.transport)
    }

    /// Query socket state with `AT+CIPSTATUS` and fold it into the link state.
    pub fn connection_status(&self) -> Result<ConnectionStatus, TransportError> {
        let status = query_connection_status(&self.transport)?;
        match status {
            ConnectionStatus::TcpClosed | ConnectionStatus::TcpClosing => {
                self.handle
                    .update(|s| s.socket_connected = false);
            },
            ConnectionStatus::PdpDeact => {
                self.handle
                    .update(|s| *s = LinkState::default());
            },
            _ => {},
        }
        Ok(status)
    }

    fn pause(&self, delay: Duration) -> Result<(), LinkError> {
        if crate::pause(delay) {
            Ok(())
        } else {
            Err(LinkError::Interrupted)
        }
    }

    fn probe(&self) -> Result<(), LinkError> {
        let attempts = self.config.probe_attempts.max(1);
        let mut answered = false;
        for attempt in 1..=attempts {
            match self.transport.run(&AtCommand::new("AT")) {
                Ok(_) => {
                    answered = true;
                    break;
                },
                Err(e) => debug!("AT probe {attempt}/{attempts}: {e}"),
            }
            if attempt < attempts {
                self.pause(self.config.probe_delay)?;
            }
        }
        if !answered {
            return Err(LinkError::NotResponding(format!(
                "no answer to AT after {attempts} attempts"
            )));
        }

        self.transport
            .run(&AtCommand::new("ATE0").optional())?;
        self.transport
            .run(
                &AtCommand::new("AT+CPIN?")
                    .expect("READY")
                    .timeout(self.config.sim_timeout),
            )
            .map_err(|e| LinkError::NotResponding(format!("SIM not ready: {e}")))?;
        Ok(())
    }

    fn wait_for_registration(&self) -> Result<(), LinkError> {
        let polls = self.config.registration_polls;
        for attempt in 1..=polls {
            match self.transport.run(&AtCommand::new("AT+CREG?")) {
                Ok(text) if text.contains("+CREG: 0,1") || text.contains("+CREG: 0,5") => {
                    info!("Registered on network");
                    return Ok(());
                },
                Ok(text) => debug!("Not registered yet ({attempt}/{polls}): {}", text.trim()),
                Err(e) => debug!("Registration poll {attempt}/{polls}: {e}"),
            }
            if attempt < polls {
                self.pause(self.config.registration_delay)?;
            }
        }
        Err(LinkError::RegistrationFailed { attempts: polls })
    }

    fn attach(&self) -> Result<(), LinkError> {
        let attempts = self.config.attach_attempts;
        for attempt in 1..=attempts {
            match self.transport.run(&AtCommand::new("AT+CGATT?")) {
                Ok(text) if text.contains("+CGATT: 1") => {
                    debug!("Packet service attached");
                    return Ok(());
                },
                Ok(_) => {},
                Err(e) => debug!("Attach query {attempt}/{attempts}: {e}"),
            }
            self.transport
                .run(&AtCommand::new("AT+CGATT=1").optional())?;
            if attempt < attempts {
                self.pause(self.config.attach_delay)?;
            }
        }
        Err(LinkError::AttachFailed(format!(
            "not attached after {attempts} attempts"
        )))
    }

    fn activate_context(&self) -> Result<(), LinkError> {
        let cfg = &self.config;
        self.transport.run(
            &AtCommand::new("AT+CIPSHUT")
                .expect("SHUT OK")
                .timeout(cfg.shutdown_timeout)
                .optional(),
        )?;
        self.transport
            .run(&AtCommand::new("AT+CIPMUX=0"))
            .map_err(|e| LinkError::ActivationFailed(e.to_string()))?;

        let mut apn = format!("AT+CSTT=\"{}\"", cfg.apn);
        if !cfg.apn_user.is_empty() {
            apn.push_str(&format!(",\"{}\"", cfg.apn_user));
            if !cfg.apn_password.is_empty() {
                apn.push_str(&format!(",\"{}\"", cfg.apn_password));
            }
        }
        self.retry(
            &AtCommand::new(apn),
            cfg.apn_attempts,
            cfg.apn_delay,
            "APN",
        )?;
        self.retry(
            &AtCommand::new("AT+CIICR").timeout(cfg.activation_timeout),
            cfg.activation_attempts,
            cfg.activation_delay,
            "GPRS activation",
        )?;

        let ip = self
            .transport
            .run(
                &AtCommand::new("AT+CIFSR")
                    .expect(".")
                    .timeout(cfg.ip_timeout),
            )
            .map_err(|e| LinkError::ActivationFailed(format!("no IP address: {e}")))?;
        info!("IP address {}", ip.trim());
        Ok(())
    }

    fn retry(
        &self,
        command: &AtCommand,
        attempts: usize,
        delay: Duration,
        what: &str,
    ) -> Result<(), LinkError> {
        let attempts = attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.transport.run(command) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("{what} failed (attempt {attempt}/{attempts}): {e}");
                    last = Some(e);
                },
            }
            if attempt < attempts {
                self.pause(delay)?;
            }
        }
        Err(LinkError::ActivationFailed(format!(
            "{what}: {}",
            last.map_or_else(String::new, |e| e.to_string())
        )))
    }

    fn connect_socket(&self) -> Result<(), LinkError> {
        let cfg = &self.config;
        info!("Connecting to {}:{}", cfg.server_host, cfg.server_port);
        self.transport
            .run(
                &AtCommand::new(format!(
                    "AT+CIPSTART=\"TCP\",\"{}\",\"{}\"",
                    cfg.server_host, cfg.server_port
                ))
                .expect("CONNECT")
                .fail_on("CONNECT FAIL")
                .timeout(cfg.connect_timeout),
            )
            .map_err(|e| LinkError::ConnectFailed {
                host: cfg.server_host.clone(),
                port: cfg.server_port,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn open_http_bearer(&self) -> Result<(), LinkError> {
        let cfg = &self.config;
        let mut commands = vec![
            AtCommand::new("AT+SAPBR=3,1,\"CONTYPE\",\"GPRS\""),
            AtCommand::new(format!("AT+SAPBR=3,1,\"APN\",\"{}\"", cfg.apn)),
        ];
        if !cfg.apn_user.is_empty() {
            commands.push(AtCommand::new(format!(
                "AT+SAPBR=3,1,\"USER\",\"{}\"",
                cfg.apn_user
            )));
        }
        if !cfg.apn_password.is_empty() {
            commands.push(AtCommand::new(format!(
                "AT+SAPBR=3,1,\"PWD\",\"{}\"",
                cfg.apn_password
            )));
        }
        // Fails when the profile is already open; the query below decides
        commands.push(
            AtCommand::new("AT+SAPBR=1,1")
                .timeout(cfg.connect_timeout)
                .optional(),
        );
        commands.push(AtCommand::new("AT+SAPBR=2,1").expect("+SAPBR: 1,1"));

        for command in &commands {
            self.transport
                .run(command)
                .map_err(|e| LinkError::ActivationFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn start_session(&self) -> Result<(), LinkError> {
        let frames = self
            .protocol
            .session_start()
            .map_err(|e| LinkError::ConnectFailed {
                host: self.config.server_host.clone(),
                port: self.config.server_port,
                reason: e.to_string(),
            })?;
        for frame in &frames {
            if let Err(e) = self.transport.send(frame) {
                self.handle
                    .update(|s| s.socket_connected = false);
                return Err(e.into());
            }
        }
        if !frames.is_empty() {
            debug!("Sent {} session frames", frames.len());
        }
        Ok(())
    }
}
