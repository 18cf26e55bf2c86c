//! Shared test fixtures: an in-memory transport backed by a simulated printer

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use labelprint_core::config::PrinterConfig;
use labelprint_core::protocol::{
    ConnectionState, Packet, PacketCodec, ReceiveBuffer, RequestCode, ResponseOffset, Transport,
    TransportError,
};

pub const HEARTBEAT: u8 = 0xDC;
pub const GET_PRINT_STATUS: u8 = 0xA3;
pub const START_PRINT: u8 = 0x01;
pub const ALLOW_PRINT_CLEAR: u8 = 0x20;
pub const START_PAGE_PRINT: u8 = 0x03;
pub const SET_DIMENSION: u8 = 0x13;
pub const RASTER_LINE: u8 = 0x85;
pub const END_PAGE_PRINT: u8 = 0xE3;
pub const END_PRINT: u8 = 0xF3;
pub const SET_LABEL_DENSITY: u8 = 0x21;
pub const SET_LABEL_TYPE: u8 = 0x23;

/// 13-byte heartbeat: closing state at 9, power at 10
pub fn heartbeat_payload(closing: u8, power: u8) -> Vec<u8> {
    let mut payload = vec![0u8; 13];
    payload[9] = closing;
    payload[10] = power;
    payload
}

/// 10-byte print status
pub fn status_payload(progress: u8, disabled: bool) -> Vec<u8> {
    vec![0x00, 0x01, progress, 0, 0, 0, disabled as u8, 0, 0, 0]
}

pub fn rfid_payload() -> Vec<u8> {
    let mut data = vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
    data.push(4);
    data.extend_from_slice(b"6972");
    data.push(3);
    data.extend_from_slice(b"R01");
    data.extend_from_slice(&[0x00, 0x64, 0x00, 0x05, 0x02]);
    data
}

/// Behaviour of the fake device
#[derive(Debug)]
pub struct SimulatedPrinter {
    pub heartbeat: Vec<u8>,
    /// Print status replies consumed in order; `default_status` afterwards
    pub status_script: VecDeque<Vec<u8>>,
    pub default_status: Vec<u8>,
    pub rfid: Vec<u8>,
    /// Acknowledgement byte for simple commands
    pub ack: bool,
    /// Commands that get no ack even when `ack` is set
    pub refused: Vec<u8>,
    /// Commands answered with the unimplemented frame
    pub unsupported: Vec<u8>,
    /// Commands that never get an answer
    pub ignored: Vec<u8>,
    /// Answer nothing at all
    pub silent: bool,
    /// Heartbeats still to be ignored before answering again
    pub ignore_heartbeats: u32,
}

impl Default for SimulatedPrinter {
    fn default() -> Self {
        Self {
            heartbeat: heartbeat_payload(0, 4),
            status_script: VecDeque::new(),
            default_status: status_payload(100, false),
            rfid: rfid_payload(),
            ack: true,
            refused: Vec::new(),
            unsupported: Vec::new(),
            ignored: Vec::new(),
            silent: false,
            ignore_heartbeats: 0,
        }
    }
}

impl SimulatedPrinter {
    fn respond(&mut self, request: &Packet) -> Option<Packet> {
        if self.silent || self.ignored.contains(&request.kind) {
            return None;
        }
        if request.kind == HEARTBEAT && self.ignore_heartbeats > 0 {
            self.ignore_heartbeats -= 1;
            return None;
        }
        if self.unsupported.contains(&request.kind) {
            return Some(Packet::new(0x00, Vec::new()));
        }

        let command = RequestCode::from_code(request.kind)?;
        let kind = match command.response_offset() {
            ResponseOffset::Fixed(offset) => request.kind.wrapping_add(offset),
            ResponseOffset::Key => request.kind.wrapping_add(request.payload[0]),
            ResponseOffset::None => return None,
        };

        let payload = match command {
            RequestCode::Heartbeat => self.heartbeat.clone(),
            RequestCode::GetPrintStatus => self
                .status_script
                .pop_front()
                .unwrap_or_else(|| self.default_status.clone()),
            RequestCode::GetRfid => self.rfid.clone(),
            RequestCode::GetInfo => match request.payload[0] {
                11 => vec![0xAB, 0xCD, 0x01],
                9 => vec![0x01, 0x2C],
                key => vec![key],
            },
            _ => {
                let ack = self.ack && !self.refused.contains(&request.kind);
                vec![ack as u8]
            }
        };
        Some(Packet::new(kind, payload))
    }
}

/// Everything the mock saw, plus the device behind it
#[derive(Debug)]
pub struct MockState {
    pub printer: SimulatedPrinter,
    pub requests: Vec<Packet>,
    pending: Vec<u8>,
    pub reads: u32,
    pub opens: u32,
    pub reconnects: u32,
    pub input_clears: u32,
    pub fail_open: bool,
    pub fail_write_for: Option<u8>,
    pub state: ConnectionState,
}

impl MockState {
    /// Requests of one type
    pub fn count(&self, kind: u8) -> usize {
        self.requests.iter().filter(|p| p.kind == kind).count()
    }

    /// Request types in order, raster lines included
    pub fn kinds(&self) -> Vec<u8> {
        self.requests.iter().map(|p| p.kind).collect()
    }
}

pub type Shared = Arc<Mutex<MockState>>;

/// In-memory [`Transport`] replying through a [`SimulatedPrinter`]
pub struct MockTransport {
    shared: Shared,
    codec: PacketCodec,
}

/// Route driver logs through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

impl MockTransport {
    pub fn new(printer: SimulatedPrinter) -> (Self, Shared) {
        init_tracing();
        let shared = Arc::new(Mutex::new(MockState {
            printer,
            requests: Vec::new(),
            pending: Vec::new(),
            reads: 0,
            opens: 0,
            reconnects: 0,
            input_clears: 0,
            fail_open: false,
            fail_write_for: None,
            state: ConnectionState::Closed,
        }));
        let transport = Self {
            shared: shared.clone(),
            codec: PacketCodec::default(),
        };
        (transport, shared)
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut s = self.shared.lock().unwrap();
        if s.state == ConnectionState::Exhausted {
            return Err(TransportError::Exhausted);
        }
        s.opens += 1;
        if s.fail_open {
            s.state = ConnectionState::Faulted;
            return Err(TransportError::Open {
                port: "mock".to_string(),
                message: "device gone".to_string(),
            });
        }
        s.state = ConnectionState::Open;
        Ok(())
    }

    fn close(&mut self) {
        let mut s = self.shared.lock().unwrap();
        s.pending.clear();
        if s.state != ConnectionState::Exhausted {
            s.state = ConnectionState::Closed;
        }
    }

    fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut s = self.shared.lock().unwrap();
        if s.state != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }
        s.reads += 1;
        let n = max_len.min(s.pending.len());
        Ok(s.pending.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut s = self.shared.lock().unwrap();
        if s.state != ConnectionState::Open {
            return Err(TransportError::NotOpen);
        }

        let mut buffer = ReceiveBuffer::new();
        buffer.extend(data);
        for request in self.codec.decode_all(&mut buffer) {
            if s.fail_write_for == Some(request.kind) {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write failed",
                )));
            }
            if let Some(reply) = s.printer.respond(&request) {
                let bytes = self.codec.encode(&reply).expect("reply fits a frame");
                s.pending.extend(bytes);
            }
            s.requests.push(request);
        }
        Ok(data.len())
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.shared.lock().unwrap().reconnects += 1;
        self.close();
        self.open()
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let mut s = self.shared.lock().unwrap();
        s.input_clears += 1;
        s.pending.clear();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared.lock().unwrap().state
    }

    fn exhaust(&mut self) {
        let mut s = self.shared.lock().unwrap();
        s.pending.clear();
        s.state = ConnectionState::Exhausted;
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

/// Config with millisecond timings so tests run fast
pub fn fast_config() -> PrinterConfig {
    let mut config = PrinterConfig::default();
    config.link.reconnect_delay_ms = 0;
    config.link.reopen_settle_ms = 0;
    config.timing.round_delay_ms = 1;
    config.timing.progress_timeout_ms = 200;
    config.timing.progress_poll_ms = 1;
    config.timing.health_retry_delay_ms = 0;
    config.monitor.interval_ms = 5;
    config
}
