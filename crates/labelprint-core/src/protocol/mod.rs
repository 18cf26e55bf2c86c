//! Printer Serial Protocol
//!
//! Implements the binary frame protocol spoken by the label printer over a
//! USB serial link.
//!
//! Frame layout: `[0x55 0x55][type][len][payload...][checksum][0xAA 0xAA]`.
//! Every request is answered by a frame whose type is the request code plus
//! a per-command offset (see [`commands`]).

pub mod commands;
mod error;
mod packet;
pub mod serial;
mod transceiver;
mod transport;

pub use commands::{InfoKey, RequestCode, ResponseOffset};
pub use error::{PortResolutionError, ProtocolError, TransportError};
pub use packet::{xor_checksum, ChecksumFn, Packet, PacketBuilder, PacketCodec, ReceiveBuffer};
pub use serial::{list_ports, resolve_port, PortInfo};
pub use transceiver::{Transceiver, TransceiverConfig};
pub use transport::{ConnectionState, SerialTransport, Transport};

/// Default baud rate of the printer link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default per-read timeout in milliseconds.
/// Kept short so the transceiver controls its own polling cadence.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 500;

/// Largest payload a single frame can carry (one length byte)
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Bytes a frame adds around its payload: start(2) + type + len + checksum + end(2)
pub const FRAME_OVERHEAD: usize = 7;

/// Bytes needed before the length byte can be read
pub const FRAME_HEADER_LEN: usize = 4;

/// Frame start marker
pub const START_MARKER: [u8; 2] = [0x55, 0x55];

/// Frame end marker
pub const END_MARKER: [u8; 2] = [0xAA, 0xAA];

/// Maximum bytes pulled from the transport per polling round
pub const READ_CHUNK_SIZE: usize = 1024;
