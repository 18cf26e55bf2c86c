//! Image rasterization
//!
//! Turns an image into one-bit rows the print head burns: dark pixels become
//! set bits. Grey areas are Floyd-Steinberg dithered into a halftone.

use image::imageops::{dither, BiLevel};
use image::{DynamicImage, GrayImage};

use super::PrinterError;
use crate::protocol::{Packet, PacketBuilder, RequestCode, MAX_PAYLOAD_SIZE};

/// Luma below this prints as a dot; after dithering every pixel is 0 or 255
const INK_THRESHOLD: u8 = 128;

/// Row header: row index (2) + reserved counts (3) + repeat (1)
const LINE_HEADER_LEN: usize = 6;

/// Widest row a single frame can carry
pub const MAX_RASTER_WIDTH: u32 = ((MAX_PAYLOAD_SIZE - LINE_HEADER_LEN) * 8) as u32;

/// One pixel row ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterLine {
    /// Row number, top row is 0
    pub row: u16,
    /// Run-length counts; the printer accepts zeros
    pub reserved_counts: [u8; 3],
    /// How many times the printer repeats the row
    pub repeat: u8,
    /// Pixels, one bit each, MSB first
    pub packed_bits: Vec<u8>,
}

impl RasterLine {
    /// Frame carrying this row
    pub fn to_packet(&self) -> Packet {
        PacketBuilder::new(RequestCode::RasterLine.code())
            .u16_be(self.row)
            .bytes(&self.reserved_counts)
            .byte(self.repeat)
            .bytes(&self.packed_bits)
            .build()
    }
}

/// Pack one row of ink flags into `ceil(width / 8)` bytes.
///
/// The row's bits sit right-aligned in the byte string, so for widths that
/// are not a multiple of 8 the padding bits lead.
pub fn pack_row(ink: &[bool]) -> Vec<u8> {
    let byte_len = ink.len().div_ceil(8);
    let pad = byte_len * 8 - ink.len();
    let mut bytes = vec![0u8; byte_len];
    for (i, _) in ink.iter().enumerate().filter(|(_, set)| **set) {
        let bit = pad + i;
        bytes[bit / 8] |= 0x80 >> (bit % 8);
    }
    bytes
}

fn ink_rows(gray: &GrayImage) -> impl Iterator<Item = Vec<bool>> + '_ {
    gray.rows()
        .map(|row| row.map(|px| px.0[0] < INK_THRESHOLD).collect())
}

/// Rasterize an image, top row first
pub fn encode_image(image: &DynamicImage) -> Result<Vec<RasterLine>, PrinterError> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || width > MAX_RASTER_WIDTH || height > u16::MAX as u32 {
        return Err(PrinterError::ImageTooLarge { width, height });
    }

    let mut gray = image.to_luma8();
    dither(&mut gray, &BiLevel);
    Ok(ink_rows(&gray)
        .enumerate()
        .map(|(row, ink)| RasterLine {
            row: row as u16,
            reserved_counts: [0; 3],
            repeat: 1,
            packed_bits: pack_row(&ink),
        })
        .collect())
}
