//! Response payload parsing

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use super::DataError;
use crate::protocol::{InfoKey, RequestCode};

/// Heartbeat fields; which ones are present depends on the printer model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatStatus {
    /// Non-zero when the cover is open
    pub closing_state: Option<u8>,
    /// Battery level (0-4 on models that report it)
    pub power_level: Option<u8>,
    /// Paper state
    pub paper_state: Option<u8>,
    /// RFID read state
    pub rfid_read_state: Option<u8>,
}

type HeartbeatParser = fn(&[u8]) -> HeartbeatStatus;

/// Payload length to layout. Lengths not listed carry no known fields.
const HEARTBEAT_LAYOUTS: [(usize, HeartbeatParser); 5] = [
    (20, heartbeat_20),
    (19, heartbeat_19),
    (13, heartbeat_13),
    (10, heartbeat_10),
    (9, heartbeat_9),
];

fn heartbeat_20(d: &[u8]) -> HeartbeatStatus {
    HeartbeatStatus {
        paper_state: Some(d[18]),
        rfid_read_state: Some(d[19]),
        ..HeartbeatStatus::default()
    }
}

fn heartbeat_19(d: &[u8]) -> HeartbeatStatus {
    HeartbeatStatus {
        closing_state: Some(d[15]),
        power_level: Some(d[16]),
        paper_state: Some(d[17]),
        rfid_read_state: Some(d[18]),
    }
}

fn heartbeat_13(d: &[u8]) -> HeartbeatStatus {
    HeartbeatStatus {
        closing_state: Some(d[9]),
        power_level: Some(d[10]),
        paper_state: Some(d[11]),
        rfid_read_state: Some(d[12]),
    }
}

fn heartbeat_10(d: &[u8]) -> HeartbeatStatus {
    // These models report the RFID state in the closing-state byte
    HeartbeatStatus {
        closing_state: Some(d[8]),
        power_level: Some(d[9]),
        paper_state: None,
        rfid_read_state: Some(d[8]),
    }
}

fn heartbeat_9(d: &[u8]) -> HeartbeatStatus {
    HeartbeatStatus {
        closing_state: Some(d[8]),
        ..HeartbeatStatus::default()
    }
}

impl HeartbeatStatus {
    /// Parse a heartbeat payload
    pub fn from_payload(payload: &[u8]) -> Self {
        HEARTBEAT_LAYOUTS
            .iter()
            .find(|(len, _)| *len == payload.len())
            .map(|(_, parse)| parse(payload))
            .unwrap_or_default()
    }

    /// Cover reported open
    pub fn cover_open(&self) -> bool {
        self.closing_state.is_some_and(|s| s != 0)
    }
}

/// Page progress as reported by `GET_PRINT_STATUS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrintStatus {
    /// Page counter
    pub page: u16,
    /// Page progress in percent
    pub progress1: u8,
    /// Secondary progress
    pub progress2: u8,
    /// Device state byte 1
    pub state1: u8,
    /// Device state byte 2
    pub state2: u8,
    /// False when the printer disabled itself (e.g. jammed)
    pub is_enabled: bool,
    /// Trailing bytes without known meaning
    pub reserved: Vec<u8>,
}

impl PrintStatus {
    /// Length of a well-formed print status payload
    pub const PAYLOAD_LEN: usize = 10;

    /// Parse a print status payload; other lengths are not a status
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        if payload.len() != Self::PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            page: BigEndian::read_u16(&payload[0..2]),
            progress1: payload[2],
            progress2: payload[3],
            state1: payload[4],
            state2: payload[5],
            is_enabled: payload[6] == 0,
            reserved: payload[7..].to_vec(),
        })
    }
}

/// Value returned by `GET_INFO`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceInfo {
    /// Device serial number, hex encoded
    Serial(String),
    /// Firmware or hardware version
    Version(f64),
    /// Any other property, as a big-endian integer
    Value(u64),
}

impl DeviceInfo {
    /// Interpret a `GET_INFO` payload for `key`
    pub fn from_payload(key: InfoKey, payload: &[u8]) -> Result<Self, DataError> {
        Ok(match key {
            InfoKey::DeviceSerial => DeviceInfo::Serial(hex::encode(payload)),
            InfoKey::SoftVersion | InfoKey::HardVersion => {
                DeviceInfo::Version(be_uint(payload)? as f64 / 100.0)
            }
            _ => DeviceInfo::Value(be_uint(payload)?),
        })
    }
}

/// Big-endian integer of up to 8 bytes
fn be_uint(payload: &[u8]) -> Result<u64, DataError> {
    match payload.len() {
        0 => Ok(0),
        len if len <= 8 => Ok(BigEndian::read_uint(payload, len)),
        _ => Err(DataError::Malformed {
            what: "info value",
            offset: 8,
        }),
    }
}

/// RFID tag of the loaded label roll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RfidTag {
    /// Tag id, hex encoded
    pub uuid: String,
    /// Roll barcode
    pub barcode: String,
    /// Roll serial
    pub serial: String,
    /// Labels on a full roll
    pub total_len: u16,
    /// Labels used so far
    pub used_len: u16,
    /// Label kind
    pub kind: u8,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DataError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(DataError::Malformed {
                what,
                offset: self.pos,
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self, what: &'static str) -> Result<String, DataError> {
        let len = self.take(1, what)?[0] as usize;
        let offset = self.pos;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DataError::Malformed { what, offset })
    }
}

/// Fixed trailer: total length (u16), used length (u16), type (u8)
const RFID_TRAILER_LEN: usize = 5;

impl RfidTag {
    /// Parse a `GET_RFID` payload. `Ok(None)` means no tag.
    pub fn from_payload(payload: &[u8]) -> Result<Option<Self>, DataError> {
        match payload.first() {
            None => {
                return Err(DataError::Truncated {
                    command: RequestCode::GetRfid,
                })
            }
            Some(0) => return Ok(None),
            Some(_) => {}
        }

        let mut cursor = Cursor {
            data: payload,
            pos: 0,
        };
        let uuid = hex::encode(cursor.take(8, "rfid uuid")?);
        let barcode = cursor.string("rfid barcode")?;
        let serial = cursor.string("rfid serial")?;

        let trailer_at = cursor.pos;
        let trailer = cursor.take(RFID_TRAILER_LEN, "rfid trailer")?;
        if cursor.pos != payload.len() {
            return Err(DataError::Malformed {
                what: "rfid trailer",
                offset: trailer_at,
            });
        }

        Ok(Some(Self {
            uuid,
            barcode,
            serial,
            total_len: BigEndian::read_u16(&trailer[0..2]),
            used_len: BigEndian::read_u16(&trailer[2..4]),
            kind: trailer[4],
        }))
    }
}
