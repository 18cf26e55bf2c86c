//! Serial port handling
//!
//! Port discovery, "auto" resolution and low-level port setup.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::fmt;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

use super::{PortResolutionError, TransportError};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            product: None,
            serial_number: None,
        }
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(product) = &self.product {
            write!(f, " ({product})")?;
        }
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{vid:04x}:{pid:04x}]")?;
        }
        Ok(())
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
            serial_number,
        }
    }
}

/// Sort key placing ttyACM* first, then ttyUSB*, then everything else
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Result<Vec<PortInfo>, PortResolutionError> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    let available = serialport::available_ports()
        .map_err(|e| PortResolutionError::Enumeration(e.to_string()))?;
    for info in available {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: the enumeration API misses ports without udev metadata
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::named(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    Ok(v)
}

/// Pick the printer port out of the candidates: exactly one must exist
pub fn resolve_port(mut candidates: Vec<PortInfo>) -> Result<String, PortResolutionError> {
    match candidates.len() {
        0 => Err(PortResolutionError::NoPortFound),
        1 => Ok(candidates.remove(0).name),
        _ => Err(PortResolutionError::AmbiguousPort { candidates }),
    }
}

/// Enumerate and resolve in one step
pub fn detect_port() -> Result<String, PortResolutionError> {
    let port = resolve_port(list_ports()?)?;
    debug!(port = %port, "Auto-detected printer port");
    Ok(port)
}

/// Open a serial port at 8N1 with the given read timeout
pub fn open_port(
    name: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn SerialPort>, TransportError> {
    let open_err = |e: serialport::Error| TransportError::Open {
        port: name.to_string(),
        message: e.to_string(),
    };

    let mut port = serialport::new(name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(read_timeout)
        .open()
        .map_err(open_err)?;

    // USB CDC printers ignore DTR, but some adapters only forward data with it raised
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!(port = name, "Failed to raise DTR: {} (continuing)", e);
    }

    port.clear(serialport::ClearBuffer::All).map_err(open_err)?;
    Ok(port)
}
