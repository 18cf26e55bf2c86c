//! Label rendering
//!
//! A label is the QR code of its payload with the caption centered below it.

use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{imageops, DynamicImage, GrayImage, Luma};
use imageproc::drawing::draw_text_mut;
use qrcode::types::QrError;
use qrcode::{Color, QrCode};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// White border around the code, in modules
const QUIET_ZONE: u32 = 2;

/// Caption font size in pixels, shrunk when the caption is wider than the label
pub const CAPTION_FONT_SIZE: f32 = 28.0;

/// Blank rows below the caption
const CAPTION_MARGIN: u32 = 4;

/// Rendering failures
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("QR encoding failed: {0}")]
    Qr(#[from] QrError),

    #[error("Failed to read font {path}: {source}")]
    FontIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Font {path} is not a usable TTF/OTF font")]
    Font { path: String },
}

/// Turns a label payload into a printable image
pub trait LabelRenderer: Send + Sync {
    /// Render `payload` (a JSON string) with a human readable `caption`
    fn render(&self, payload: &str, caption: &str) -> Result<DynamicImage, RenderError>;
}

fn text_width(font: &FontVec, scale: PxScale, text: &str) -> u32 {
    let scaled = font.as_scaled(scale);
    let mut width = 0.0f32;
    let mut prev = None;
    for ch in text.chars() {
        let glyph = scaled.glyph_id(ch);
        if let Some(prev) = prev {
            width += scaled.kern(prev, glyph);
        }
        width += scaled.h_advance(glyph);
        prev = Some(glyph);
    }
    width.ceil() as u32
}

fn line_height(font: &FontVec, scale: PxScale) -> u32 {
    let scaled = font.as_scaled(scale);
    (scaled.ascent() - scaled.descent()).ceil() as u32
}

/// QR code of the payload scaled to the label width, caption underneath
pub struct QrLabelRenderer {
    width: u32,
    font: Option<FontVec>,
}

impl QrLabelRenderer {
    /// Renderer without a caption font; captions are only logged
    pub fn new(width: u32) -> Self {
        Self {
            width: width.max(1),
            font: None,
        }
    }

    /// Draw captions with `font`
    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    /// Draw captions with the font stored at `path`
    pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, RenderError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| RenderError::FontIo {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontVec::try_from_vec(data).map_err(|_| RenderError::Font {
            path: path.display().to_string(),
        })?;
        Ok(self.with_font(font))
    }

    fn draw_code(&self, code: &QrCode) -> GrayImage {
        let modules = code.width() as u32;
        let colors = code.to_colors();

        let span = modules + 2 * QUIET_ZONE;
        let scale = (self.width / span).max(1);
        let size = span * scale;
        let canvas_width = self.width.max(size);
        let left = (canvas_width - size) / 2 + QUIET_ZONE * scale;
        let top = QUIET_ZONE * scale;

        let mut img = GrayImage::from_pixel(canvas_width, size, Luma([255u8]));
        for (i, color) in colors.iter().enumerate() {
            if *color != Color::Dark {
                continue;
            }
            let x = (i as u32) % modules;
            let y = (i as u32) / modules;
            for dy in 0..scale {
                for dx in 0..scale {
                    img.put_pixel(left + x * scale + dx, top + y * scale + dy, Luma([0u8]));
                }
            }
        }
        img
    }

    /// Extend `code` downwards with the centered caption
    fn add_caption(&self, code: GrayImage, caption: &str) -> GrayImage {
        let Some(font) = &self.font else {
            debug!(caption, "No caption font configured, caption not drawn");
            return code;
        };
        if caption.trim().is_empty() {
            return code;
        }

        let mut scale = PxScale::from(CAPTION_FONT_SIZE);
        let natural = text_width(font, scale, caption);
        if natural > code.width() {
            scale = PxScale::from(CAPTION_FONT_SIZE * code.width() as f32 / natural as f32);
        }
        let band = line_height(font, scale) + CAPTION_MARGIN;

        let mut label = GrayImage::from_pixel(code.width(), code.height() + band, Luma([255u8]));
        imageops::replace(&mut label, &code, 0, 0);

        let x = (code.width() as i32 - text_width(font, scale, caption) as i32).max(0) / 2;
        draw_text_mut(
            &mut label,
            Luma([0u8]),
            x,
            code.height() as i32,
            scale,
            font,
            caption,
        );
        label
    }
}

impl LabelRenderer for QrLabelRenderer {
    fn render(&self, payload: &str, caption: &str) -> Result<DynamicImage, RenderError> {
        let code = QrCode::new(payload.as_bytes())?;
        let img = self.add_caption(self.draw_code(&code), caption);
        debug!(caption, height = img.height(), "Rendered QR label");
        Ok(DynamicImage::ImageLuma8(img))
    }
}
