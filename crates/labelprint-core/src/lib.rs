//! # LabelPrint Core Library
//!
//! Driver for thermal label printers that speak the framed serial protocol
//! of the B-series handheld printers.

#![warn(missing_docs)]

//!
//! This library provides:
//! - Frame encoding/decoding and request/response pairing
//! - Serial port discovery and a reconnecting serial transport
//! - Printer commands, status parsing and the print job sequence
//! - Image rasterization for the print head
//! - A background connection monitor with escalation
//!
//! ## Example
//!
//! ```rust,ignore
//! use labelprint_core::prelude::*;
//!
//! let config = PrinterConfig::from_file("labelprint.json")?;
//! let transport = SerialTransport::new(config.link.clone());
//! let mut printer = PrinterDriver::connect(Box::new(transport), config)?;
//!
//! printer.check_printer_status()?;
//! printer.print_image(&image::open("label.png")?)?;
//! ```

use std::sync::{Arc, Mutex};

pub mod config;
pub mod monitor;
pub mod printer;
pub mod protocol;

/// Driver shared between the job path and the connection monitor.
///
/// The lock is held for whole exchanges, and for a whole job on the job path.
pub type SharedPrinter = Arc<Mutex<printer::PrinterDriver>>;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{LabelConfig, LinkConfig, PortSelection, PrinterConfig};
    pub use crate::monitor::{ConnectionMonitor, MonitorConfig, MonitorEvent, MonitorExit};
    pub use crate::printer::{
        HeartbeatStatus, PrintJobError, PrintStatus, PrinterDriver, PrinterError, PrinterFault,
    };
    pub use crate::protocol::{ConnectionState, InfoKey, SerialTransport, Transport};
    pub use crate::SharedPrinter;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
