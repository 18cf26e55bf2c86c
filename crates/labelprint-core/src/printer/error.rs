//! Printer-level errors

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::{ProtocolError, RequestCode, TransportError};

/// Conditions an operator has to fix at the printer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrinterFault {
    #[error("Printer cover is open")]
    CoverOpen,

    #[error("Printer battery low: level {level}, minimum {minimum}")]
    LowBattery { level: u8, minimum: u8 },

    #[error("Printer is disabled or jammed")]
    Jammed,
}

/// The printer cannot be reached at all
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Printer unreachable after reconnect: {cause}")]
    Unreachable {
        #[source]
        cause: ProtocolError,
    },
}

/// A response payload that does not match the documented layout
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("Empty response to {command:?}")]
    Truncated { command: RequestCode },

    #[error("Malformed {what} at byte {offset}")]
    Malformed { what: &'static str, offset: usize },
}

/// Any failure of a driver operation
#[derive(Error, Debug)]
pub enum PrinterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Fault(#[from] PrinterFault),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Printer refused {0:?}")]
    NotAcknowledged(RequestCode),

    #[error("Page not finished after {waited:?} (last progress {last_progress:?})")]
    ProgressTimeout {
        waited: Duration,
        last_progress: Option<u8>,
    },

    #[error("Image of {width}x{height} does not fit the raster protocol")]
    ImageTooLarge { width: u32, height: u32 },

    #[error("Blocking worker failed: {0}")]
    Worker(String),
}

impl From<TransportError> for PrinterError {
    fn from(err: TransportError) -> Self {
        PrinterError::Protocol(ProtocolError::Transport(err))
    }
}

impl PrinterError {
    /// Operator-actionable fault, if that is what this is
    pub fn fault(&self) -> Option<&PrinterFault> {
        match self {
            PrinterError::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// True for a request that got no answer within its polling bound
    pub fn is_timeout(&self) -> bool {
        matches!(self, PrinterError::Protocol(ProtocolError::Timeout { .. }))
    }
}

/// Steps of a print job, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStep {
    PrepareImage,
    CheckHealth,
    StartPrint,
    AllowClear,
    StartPagePrint,
    SetDimension,
    StreamRasterLines,
    EndPagePrint,
    PollProgress,
    EndPrint,
}

impl fmt::Display for PrintStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrintStep::PrepareImage => "image preparation",
            PrintStep::CheckHealth => "health check",
            PrintStep::StartPrint => "start print",
            PrintStep::AllowClear => "allow clear",
            PrintStep::StartPagePrint => "start page",
            PrintStep::SetDimension => "set dimension",
            PrintStep::StreamRasterLines => "raster streaming",
            PrintStep::EndPagePrint => "end page",
            PrintStep::PollProgress => "progress polling",
            PrintStep::EndPrint => "end print",
        };
        f.write_str(name)
    }
}

/// One failed print job
#[derive(Error, Debug)]
#[error("Print job failed during {step}: {source}")]
pub struct PrintJobError {
    /// Step that failed
    pub step: PrintStep,
    /// Underlying failure
    #[source]
    pub source: PrinterError,
}
