//! Frame annotation: timestamp banner compositing and JPEG encoding.

mod font;

use std::io::Cursor;

use chrono::{DateTime, Duration, Local, NaiveDateTime, Utc};
use edgecam_types::{
    config::{AnnotatorConfig, BannerClock},
    vision::ImageFrame,
    EdgecamError, Result,
};
use image::{codecs::jpeg::JpegEncoder, ImageBuffer, Rgb, RgbImage};
use tracing::debug;

pub const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

const BANNER_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const BANNER_TEXT: Rgb<u8> = Rgb([255, 255, 255]);

/// Renders the timestamp banner below captured frames.
#[derive(Debug, Clone)]
pub struct ImageAnnotator {
    banner_height: u32,
    text_origin: (u32, u32),
    font_scale: u32,
    jpeg_quality: u8,
    clock: BannerClock,
}

impl ImageAnnotator {
    pub fn new(config: &AnnotatorConfig) -> Self {
        Self {
            banner_height: config.banner_height,
            text_origin: config.text_origin,
            font_scale: config.font_scale.max(1),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            clock: config.clock,
        }
    }

    pub fn banner_height(&self) -> u32 {
        self.banner_height
    }

    /// Wall-clock time the banner should show for `now`.
    pub fn banner_time(&self, now: DateTime<Utc>, timezone_hours: i32) -> NaiveDateTime {
        match self.clock {
            BannerClock::Local => now.with_timezone(&Local).naive_local(),
            BannerClock::Device => now.naive_utc() + Duration::hours(i64::from(timezone_hours)),
        }
    }

    /// Append a black banner carrying `timestamp` below `frame`.
    pub fn annotate(&self, frame: &ImageFrame, timestamp: NaiveDateTime) -> Result<RgbImage> {
        if !frame.is_consistent() {
            return Err(vision_error(format!(
                "frame buffer holds {} bytes, expected {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let width = frame.width;
        let height = frame.height + self.banner_height;
        let mut canvas: RgbImage = ImageBuffer::from_pixel(width, height, BANNER_BACKGROUND);

        let row_bytes = width as usize * 3;
        if row_bytes > 0 {
            let frame_bytes = frame.height as usize * row_bytes;
            let pixels: &mut [u8] = &mut canvas;
            pixels[..frame_bytes].copy_from_slice(&frame.data);
        }

        let text = timestamp.format(TIMESTAMP_FORMAT).to_string();
        self.draw_text(&mut canvas, frame.height, &text);
        debug!(width, height, text = %text, "Annotated frame");
        Ok(canvas)
    }

    pub fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality)
            .encode_image(image)
            .map_err(|err| vision_error(format!("JPEG encoding failed: {err}")))?;
        Ok(buffer.into_inner())
    }

    fn draw_text(&self, canvas: &mut RgbImage, banner_top: u32, text: &str) {
        let scale = self.font_scale;
        let (origin_x, baseline) = self.text_origin;
        let glyph_top = banner_top + baseline.saturating_sub(font::GLYPH_ROWS * scale);
        let banner_bottom = banner_top + self.banner_height;
        let (canvas_width, _) = canvas.dimensions();

        let mut pen_x = origin_x;
        for ch in text.chars() {
            if pen_x >= canvas_width {
                break;
            }
            if let Some(rows) = font::glyph(ch) {
                for row in 0..font::GLYPH_ROWS {
                    for col in 0..font::GLYPH_WIDTH {
                        if !font::is_lit(&rows, row, col) {
                            continue;
                        }
                        let x0 = pen_x + col * scale;
                        let y0 = glyph_top + row * scale;
                        for y in y0..(y0 + scale).min(banner_bottom) {
                            for x in x0..(x0 + scale).min(canvas_width) {
                                canvas.put_pixel(x, y, BANNER_TEXT);
                            }
                        }
                    }
                }
            }
            pen_x += font::GLYPH_ADVANCE * scale;
        }
    }
}

pub fn vision_error(message: impl Into<String>) -> EdgecamError {
    EdgecamError::Vision(message.into())
}
