//! Serial devices through the `serialport` crate.

use std::io::{self, Read, Write};

use log::debug;
use serialport::{SerialPort, SerialPortType};

use crate::error::{Error, Result};
use crate::port::{FlowControl, Port, PortEnumerator, PortInfo, SerialConfig};

/// A modem UART opened on the host.
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open `config.port_name` with 8N1 framing.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud ({:?} flow control)",
            config.port_name, config.baud_rate, config.flow_control
        );
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.poll_interval)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(config.flow_control.into())
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config.port_name.clone(),
        })
    }

    fn device(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        let Some(inner) = self.inner.as_ref() else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{} is closed", self.name),
            )));
        };
        Ok(Box::new(Self {
            inner: Some(inner.try_clone()?),
            name: self.name.clone(),
        }))
    }

    fn close(&mut self) -> Result<()> {
        if self.inner.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.device()?.flush()
    }
}

/// Lists the host's serial devices.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;
        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    name: p.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
                _ => PortInfo {
                    name: p.port_name,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect())
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}
