//! Physical link to the printer
//!
//! [`Transport`] is the byte-stream seam between the protocol and the device.
//! [`SerialTransport`] is the production implementation over `serialport`.

use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use tracing::{debug, info, info_span, warn, Span};

use super::serial::{detect_port, open_port};
use super::TransportError;
use crate::config::{LinkConfig, PortSelection};

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not open
    Closed,
    /// Open and usable
    Open,
    /// A read or write failed, or a reconnect did not succeed
    Faulted,
    /// Reconnect in progress
    Reconnecting,
    /// Reconnect budget spent; the link stays down
    Exhausted,
}

/// Byte stream to the printer
pub trait Transport: Send {
    /// Open the link (no-op when already open)
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the link; safe to call repeatedly
    fn close(&mut self);

    /// Return whatever is available, up to `max_len` bytes, waiting at most
    /// the device read timeout. May return an empty vector.
    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Write all of `data`, returning the number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Close, pause, reopen
    fn reconnect(&mut self) -> Result<(), TransportError>;

    /// Discard bytes the device already sent but nobody read
    fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Current link state
    fn state(&self) -> ConnectionState;

    /// Close for good; later `open` calls fail with [`TransportError::Exhausted`]
    fn exhaust(&mut self);

    /// Human readable link name for logs
    fn describe(&self) -> String;
}

/// Serial port transport
pub struct SerialTransport {
    /// Serial port handle
    port: Option<Box<dyn SerialPort>>,
    /// Port chosen at the last open
    port_name: Option<String>,
    /// Link settings
    config: LinkConfig,
    /// Current state
    state: ConnectionState,
    span: Span,
}

impl SerialTransport {
    /// Create a transport (not yet open)
    pub fn new(config: LinkConfig) -> Self {
        let selection = String::from(config.port.clone());
        Self {
            port: None,
            port_name: None,
            config,
            state: ConnectionState::Closed,
            span: info_span!("serial", port = %selection),
        }
    }

    /// Port opened last, if any
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn resolve(&self) -> Result<String, TransportError> {
        match &self.config.port {
            PortSelection::Explicit(name) => Ok(name.clone()),
            // Re-resolved on every open; the device may re-enumerate under a new name
            PortSelection::Auto => Ok(detect_port()?),
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }

    fn fault(&mut self, err: std::io::Error) -> TransportError {
        warn!(parent: &self.span, "Serial link fault: {}", err);
        self.state = ConnectionState::Faulted;
        TransportError::Io(err)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let _enter = self.span.enter();
        if self.state == ConnectionState::Exhausted {
            return Err(TransportError::Exhausted);
        }
        if self.port.is_some() {
            return Ok(());
        }

        let name = match self.resolve() {
            Ok(name) => name,
            Err(e) => {
                self.state = ConnectionState::Faulted;
                return Err(e);
            }
        };

        match open_port(&name, self.config.baud_rate, self.config.read_timeout()) {
            Ok(port) => {
                info!(port = %name, baud = self.config.baud_rate, "Serial port opened");
                self.port = Some(port);
                self.port_name = Some(name);
                self.state = ConnectionState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Faulted;
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(parent: &self.span, "Serial port closed");
        }
        if self.state != ConnectionState::Exhausted {
            self.state = ConnectionState::Closed;
        }
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len];
        let result = self.port_mut()?.read(&mut buf);
        match result {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        let result = port.write_all(data).and_then(|_| port.flush());
        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(self.fault(e)),
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::Exhausted {
            return Err(TransportError::Exhausted);
        }
        info!(parent: &self.span, "Reconnecting serial link");
        self.close();
        self.state = ConnectionState::Reconnecting;
        std::thread::sleep(self.config.reconnect_delay());
        self.open()
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| TransportError::Io(e.into()))?;
        debug!(parent: &self.span, "Cleared serial input buffer");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn exhaust(&mut self) {
        self.close();
        self.state = ConnectionState::Exhausted;
        warn!(parent: &self.span, "Serial link marked exhausted");
    }

    fn describe(&self) -> String {
        self.port_name
            .clone()
            .unwrap_or_else(|| String::from(self.config.port.clone()))
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_port() -> LinkConfig {
        LinkConfig {
            port: PortSelection::Explicit("/dev/labelprint-does-not-exist".to_string()),
            reconnect_delay_ms: 0,
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_open_missing_port_faults() {
        let mut transport = SerialTransport::new(missing_port());
        assert_eq!(transport.state(), ConnectionState::Closed);

        let err = transport.open().unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
        assert_eq!(transport.state(), ConnectionState::Faulted);
    }

    #[test]
    fn test_io_without_open() {
        let mut transport = SerialTransport::new(missing_port());
        assert!(matches!(transport.read(16), Err(TransportError::NotOpen)));
        assert!(matches!(transport.write(&[1]), Err(TransportError::NotOpen)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut transport = SerialTransport::new(missing_port());
        transport.close();
        transport.close();
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_exhausted_refuses_open() {
        let mut transport = SerialTransport::new(missing_port());
        transport.exhaust();
        assert!(matches!(transport.open(), Err(TransportError::Exhausted)));
        assert!(matches!(transport.reconnect(), Err(TransportError::Exhausted)));
        transport.close();
        assert_eq!(transport.state(), ConnectionState::Exhausted);
    }
}
