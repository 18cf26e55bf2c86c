//! Protocol errors

use thiserror::Error;

use super::serial::PortInfo;

/// Errors raised while resolving which serial port the printer is on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortResolutionError {
    #[error("No serial ports detected")]
    NoPortFound,

    #[error(
        "Found {} serial ports, select one explicitly: {}",
        .candidates.len(),
        describe_candidates(.candidates)
    )]
    AmbiguousPort { candidates: Vec<PortInfo> },

    #[error("Failed to enumerate serial ports: {0}")]
    Enumeration(String),
}

fn describe_candidates(candidates: &[PortInfo]) -> String {
    candidates
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors of the physical byte stream
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Port(#[from] PortResolutionError),

    #[error("Failed to open serial port {port}: {message}")]
    Open { port: String, message: String },

    #[error("Serial port is not open")]
    NotOpen,

    #[error("Serial link exhausted its reconnect budget")]
    Exhausted,

    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors of one request/response exchange
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Printer rejected command {code:#04x}")]
    DeviceRejected { code: u8 },

    #[error("Printer does not implement command {code:#04x}")]
    Unsupported { code: u8 },

    #[error("No response to command {code:#04x} after {rounds} polling rounds")]
    Timeout { code: u8, rounds: u32 },

    #[error("Exchange for command {code:#04x} was cancelled")]
    Cancelled { code: u8 },

    #[error("Payload of {0} bytes exceeds the frame limit of 255 bytes")]
    PayloadTooLarge(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// True when the printer did not answer at all (silence or a dead link),
    /// as opposed to answering with an error frame.
    pub fn is_no_response(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. } | ProtocolError::Transport(_))
    }
}
