//! Byte link to the modem's UART.
//!
//! One device, two handles: the [`CommandTransport`](crate::at::CommandTransport)
//! writes through the original and the [`StreamReader`](crate::at::StreamReader)
//! drains a clone, so every [`Port`] must be able to duplicate itself.
//!
//! ```text
//!   CommandTransport            StreamReader
//!     write_all_bytes             read (poll)
//!          |                          |
//!          +------ Port / clone ------+
//!                       |
//!                 SIM800 UART (8N1)
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// How to open the modem's serial device.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port_name: String,
    /// Line speed. SIM800 modules autobaud up to 115200.
    pub baud_rate: u32,
    /// Read timeout, which doubles as the stream reader's poll interval.
    pub poll_interval: Duration,
    /// RTS/CTS handshaking.
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            poll_interval: Duration::from_millis(100),
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Settings for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the reader poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set RTS/CTS handshaking.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// UART handshaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// Three-wire breakout boards.
    #[default]
    None,
    /// RTS/CTS wired through (`AT+IFC=2,2` on the modem side).
    Hardware,
}

/// A serial device the host can see.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Device path.
    pub name: String,
    /// USB vendor ID of the adapter.
    pub vid: Option<u16>,
    /// USB product ID of the adapter.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
}

/// Byte-level link to the modem.
///
/// Reads are expected to time out rather than block forever; the stream reader
/// treats `TimedOut` and `WouldBlock` as "nothing yet".
pub trait Port: Read + Write + Send {
    /// Device path, for logs.
    fn name(&self) -> &str;

    /// Open a second handle on the same device.
    fn try_clone_port(&self) -> Result<Box<dyn Port>>;

    /// Release the device. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Write every byte and flush.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }
}

impl Port for Box<dyn Port> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        (**self).try_clone_port()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Lists serial devices without opening any of them.
pub trait PortEnumerator {
    /// Every serial device the host reports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
