//! Packet encoding/decoding
//!
//! Frame format:
//! - 2 bytes: start marker `0x55 0x55`
//! - 1 byte: packet type
//! - 1 byte: payload length
//! - N bytes: payload
//! - 1 byte: checksum
//! - 2 bytes: end marker `0xAA 0xAA`
//!
//! The checksum is pluggable. The default XORs the type, the length and every
//! payload byte; it has only been confirmed against the printers we own.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};

use super::{
    ProtocolError, END_MARKER, FRAME_HEADER_LEN, FRAME_OVERHEAD, MAX_PAYLOAD_SIZE, START_MARKER,
};

/// Checksum over `(type, payload)`; the length byte is derived from the payload
pub type ChecksumFn = fn(u8, &[u8]) -> u8;

/// XOR of type, length and payload bytes
pub fn xor_checksum(kind: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(kind ^ payload.len() as u8, |acc, byte| acc ^ byte)
}

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type (request code or response code)
    pub kind: u8,
    /// Packet payload, at most 255 bytes on the wire
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet
    pub fn new(kind: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Encode with the default codec
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        PacketCodec::default().encode(self)
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Acknowledgement flag carried in the first payload byte
    pub fn ack(&self) -> Option<bool> {
        self.payload.first().map(|b| *b != 0)
    }
}

/// Builder for request payloads
pub struct PacketBuilder {
    kind: u8,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Start a packet of the given type
    pub fn new(kind: u8) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (big-endian)
    pub fn u16_be(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        BigEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the packet
    pub fn build(self) -> Packet {
        Packet::new(self.kind, self.payload)
    }
}

/// Append-only accumulator for bytes read off the link.
///
/// After every [`PacketCodec::decode_all`] it holds at most one incomplete
/// trailing frame.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    bytes: Vec<u8>,
}

impl ReceiveBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Bytes still waiting to complete a frame
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drop everything, returning how many bytes were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.bytes.len();
        self.bytes.clear();
        n
    }

    /// Skip leading bytes that cannot begin a frame
    fn skip_to_start_marker(&mut self) -> usize {
        let mut skip = 0;
        while skip < self.bytes.len() {
            let rest = &self.bytes[skip..];
            let candidate = rest.len() < 2 || rest[1] == START_MARKER[1];
            if rest[0] == START_MARKER[0] && candidate {
                break;
            }
            skip += 1;
        }
        self.bytes.drain(..skip);
        skip
    }
}

/// Why a complete-length frame was thrown away
enum FrameDefect {
    /// End marker missing: the length byte was not trustworthy
    Misaligned,
    /// Markers fine but checksum wrong
    Checksum { expected: u8, actual: u8 },
}

/// Frame encoder/decoder with a pluggable checksum
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    checksum: ChecksumFn,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(xor_checksum)
    }
}

impl PacketCodec {
    /// Create a codec using the given checksum function
    pub fn new(checksum: ChecksumFn) -> Self {
        Self { checksum }
    }

    /// Encode a packet into its wire frame
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(packet.payload.len()));
        }

        let mut bytes = Vec::with_capacity(packet.encoded_size());
        bytes.extend_from_slice(&START_MARKER);
        bytes.push(packet.kind);
        bytes.push(packet.payload.len() as u8);
        bytes.extend_from_slice(&packet.payload);
        bytes.push((self.checksum)(packet.kind, &packet.payload));
        bytes.extend_from_slice(&END_MARKER);
        Ok(bytes)
    }

    /// Decode every complete frame in `buffer`, leaving a trailing partial
    /// frame in place for the next read.
    pub fn decode_all(&self, buffer: &mut ReceiveBuffer) -> Vec<Packet> {
        let mut packets = Vec::new();

        loop {
            let skipped = buffer.skip_to_start_marker();
            if skipped > 0 {
                debug!(skipped, "Skipped bytes before frame start marker");
            }

            if buffer.len() < FRAME_HEADER_LEN {
                break;
            }

            let frame_len = buffer.bytes[3] as usize + FRAME_OVERHEAD;
            if buffer.len() < frame_len {
                break;
            }

            match self.check_frame(&buffer.bytes[..frame_len]) {
                Ok(packet) => {
                    buffer.bytes.drain(..frame_len);
                    packets.push(packet);
                }
                Err(FrameDefect::Misaligned) => {
                    // Drop one byte and rescan, a real frame may start inside this one
                    warn!("Frame end marker missing, resynchronizing");
                    buffer.bytes.drain(..1);
                }
                Err(FrameDefect::Checksum { expected, actual }) => {
                    warn!(
                        "Dropping frame type {:#04x}: checksum {:#04x}, expected {:#04x}",
                        buffer.bytes[2], actual, expected
                    );
                    buffer.bytes.drain(..frame_len);
                }
            }
        }

        packets
    }

    fn check_frame(&self, frame: &[u8]) -> Result<Packet, FrameDefect> {
        let n = frame.len();
        if frame[n - 2..] != END_MARKER {
            return Err(FrameDefect::Misaligned);
        }

        let kind = frame[2];
        let payload = &frame[FRAME_HEADER_LEN..n - 3];
        let expected = (self.checksum)(kind, payload);
        let actual = frame[n - 3];
        if expected != actual {
            return Err(FrameDefect::Checksum { expected, actual });
        }

        Ok(Packet::new(kind, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_heartbeat_frame() {
        let frame = Packet::new(0xDC, vec![0x01]).to_bytes().unwrap();
        assert_eq!(frame, vec![0x55, 0x55, 0xDC, 0x01, 0x01, 0xDC, 0xAA, 0xAA]);
    }

    #[test]
    fn test_packet_builder() {
        let packet = PacketBuilder::new(0x13).u16_be(240).u16_be(320).build();
        assert_eq!(packet.kind, 0x13);
        assert_eq!(packet.payload, vec![0x00, 0xF0, 0x01, 0x40]);
    }

    #[test]
    fn test_payload_limit() {
        let packet = Packet::new(0x85, vec![0u8; 256]);
        assert!(matches!(
            packet.to_bytes(),
            Err(ProtocolError::PayloadTooLarge(256))
        ));
        assert!(Packet::new(0x85, vec![0u8; 255]).to_bytes().is_ok());
    }

    #[test]
    fn test_checksum_verification() {
        let mut frame = Packet::new(0x40, vec![1, 2, 3]).to_bytes().unwrap();
        frame[5] ^= 0xFF;

        let mut buffer = ReceiveBuffer::new();
        buffer.extend(&frame);
        let packets = PacketCodec::default().decode_all(&mut buffer);
        assert!(packets.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let frame = Packet::new(0xDD, vec![9]).to_bytes().unwrap();
        let mut buffer = ReceiveBuffer::new();
        buffer.extend(&[0x00, 0x13, 0x55, 0x07]);
        buffer.extend(&frame);

        let packets = PacketCodec::default().decode_all(&mut buffer);
        assert_eq!(packets, vec![Packet::new(0xDD, vec![9])]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_lone_start_byte_is_kept() {
        let mut buffer = ReceiveBuffer::new();
        buffer.extend(&[0x55]);
        assert!(PacketCodec::default().decode_all(&mut buffer).is_empty());
        assert_eq!(buffer.as_slice(), &[0x55]);
    }

    #[test]
    fn test_custom_checksum() {
        fn zero(_: u8, _: &[u8]) -> u8 {
            0
        }
        let codec = PacketCodec::new(zero);
        let frame = codec.encode(&Packet::new(0x01, vec![7])).unwrap();
        assert_eq!(frame[5], 0);

        let mut buffer = ReceiveBuffer::new();
        buffer.extend(&frame);
        assert_eq!(codec.decode_all(&mut buffer).len(), 1);
    }
}
