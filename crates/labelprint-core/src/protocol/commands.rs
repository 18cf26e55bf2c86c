//! Protocol commands
//!
//! Request codes understood by the printer and the offset each one adds to
//! form its response code.

use serde::{Deserialize, Serialize};

/// Reply type the printer uses to reject a request
pub const ERROR_RESPONSE: u8 = 0xDB;

/// Reply type the printer uses for commands it does not implement
pub const UNIMPLEMENTED_RESPONSE: u8 = 0x00;

/// How a command's response type is derived from its request code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOffset {
    /// Response type is `code + offset`
    Fixed(u8),
    /// Response type is `code + key`, the key being the first payload byte
    Key,
    /// Fire-and-forget, no response is sent
    None,
}

/// Protocol commands for printer communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestCode {
    /// Query a device property selected by [`InfoKey`]
    GetInfo,
    /// Read the RFID tag of the loaded label roll
    GetRfid,
    /// Liveness and status query
    Heartbeat,
    /// Select the label type (1-3)
    SetLabelType,
    /// Select the print density (1-5)
    SetLabelDensity,
    /// Begin a print job
    StartPrint,
    /// Finish a print job
    EndPrint,
    /// Begin a page within a job
    StartPagePrint,
    /// Finish the current page
    EndPagePrint,
    /// Allow the printer to clear its page buffer
    AllowPrintClear,
    /// Page height and width in pixels
    SetDimension,
    /// Number of copies
    SetQuantity,
    /// Page progress and enable state
    GetPrintStatus,
    /// One bit-packed raster row
    RasterLine,
}

impl RequestCode {
    /// Wire opcode
    pub fn code(&self) -> u8 {
        match self {
            RequestCode::GetInfo => 0x40,
            RequestCode::GetRfid => 0x1A,
            RequestCode::Heartbeat => 0xDC,
            RequestCode::SetLabelType => 0x23,
            RequestCode::SetLabelDensity => 0x21,
            RequestCode::StartPrint => 0x01,
            RequestCode::EndPrint => 0xF3,
            RequestCode::StartPagePrint => 0x03,
            RequestCode::EndPagePrint => 0xE3,
            RequestCode::AllowPrintClear => 0x20,
            RequestCode::SetDimension => 0x13,
            RequestCode::SetQuantity => 0x15,
            RequestCode::GetPrintStatus => 0xA3,
            RequestCode::RasterLine => 0x85,
        }
    }

    /// Offset between request and response type
    pub fn response_offset(&self) -> ResponseOffset {
        match self {
            RequestCode::GetInfo => ResponseOffset::Key,
            RequestCode::SetLabelType
            | RequestCode::SetLabelDensity
            | RequestCode::AllowPrintClear
            | RequestCode::GetPrintStatus => ResponseOffset::Fixed(16),
            RequestCode::RasterLine => ResponseOffset::None,
            _ => ResponseOffset::Fixed(1),
        }
    }

    /// Look a command up by opcode
    pub fn from_code(code: u8) -> Option<Self> {
        ALL_COMMANDS.iter().copied().find(|c| c.code() == code)
    }
}

const ALL_COMMANDS: [RequestCode; 14] = [
    RequestCode::GetInfo,
    RequestCode::GetRfid,
    RequestCode::Heartbeat,
    RequestCode::SetLabelType,
    RequestCode::SetLabelDensity,
    RequestCode::StartPrint,
    RequestCode::EndPrint,
    RequestCode::StartPagePrint,
    RequestCode::EndPagePrint,
    RequestCode::AllowPrintClear,
    RequestCode::SetDimension,
    RequestCode::SetQuantity,
    RequestCode::GetPrintStatus,
    RequestCode::RasterLine,
];

/// Device properties readable through [`RequestCode::GetInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfoKey {
    Density,
    PrintSpeed,
    LabelType,
    LanguageType,
    AutoShutdownTime,
    DeviceType,
    SoftVersion,
    Battery,
    DeviceSerial,
    HardVersion,
}

impl InfoKey {
    /// Key byte sent as payload (and used as the response offset)
    pub fn code(&self) -> u8 {
        match self {
            InfoKey::Density => 1,
            InfoKey::PrintSpeed => 2,
            InfoKey::LabelType => 3,
            InfoKey::LanguageType => 6,
            InfoKey::AutoShutdownTime => 7,
            InfoKey::DeviceType => 8,
            InfoKey::SoftVersion => 9,
            InfoKey::Battery => 10,
            InfoKey::DeviceSerial => 11,
            InfoKey::HardVersion => 12,
        }
    }
}
