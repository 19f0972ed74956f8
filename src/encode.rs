//! JPEG compression of captured images.
//!
//! The acquisition worker compresses every captured `RawImage` before it is
//! published; consumers only ever see compressed bytes. An encode failure is
//! a per-frame event: the frame is dropped and the device is still treated
//! as healthy.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::capture::{rgb_buffer_len, RawImage};
use crate::frame::Frame;

/// Valid JPEG quality range. Out-of-range requests are clamped, not rejected.
pub const MIN_JPEG_QUALITY: u8 = 1;
pub const MAX_JPEG_QUALITY: u8 = 100;

pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_JPEG_QUALITY, MAX_JPEG_QUALITY)
}

/// Compress an RGB image to a JPEG frame at the given quality.
pub fn encode_jpeg(image: &RawImage, quality: u8) -> Result<Frame> {
    let expected = rgb_buffer_len(image.width, image.height)?;
    if image.pixels.len() != expected {
        return Err(anyhow!(
            "pixel buffer is {} bytes, expected {} for {}x{} rgb",
            image.pixels.len(),
            expected,
            image.width,
            image.height
        ));
    }

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, clamp_quality(quality));
    encoder
        .encode(
            &image.pixels,
            image.width,
            image.height,
            ExtendedColorType::Rgb8,
        )
        .context("encode jpeg")?;
    Ok(Frame::new(jpeg))
}

/// Solid mid-gray frame served to stream consumers whose camera never
/// produced a first frame within the initial deadline.
pub fn placeholder_jpeg(width: u32, height: u32) -> Result<Frame> {
    let image = RawImage {
        pixels: vec![0x40u8; rgb_buffer_len(width, height)?],
        width,
        height,
    };
    encode_jpeg(&image, 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RawImage {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push((x % 256) as u8);
                pixels.push((y % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        RawImage {
            pixels,
            width,
            height,
        }
    }

    #[test]
    fn encodes_valid_jpeg() {
        let frame = encode_jpeg(&gradient(64, 48), 85).expect("encode");
        // JPEG SOI marker
        assert_eq!(&frame.as_bytes()[..2], &[0xFF, 0xD8]);
        assert!(!frame.is_empty());
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let image = RawImage {
            pixels: vec![0u8; 10],
            width: 64,
            height: 48,
        };
        assert!(encode_jpeg(&image, 85).is_err());
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(clamp_quality(0), MIN_JPEG_QUALITY);
        assert_eq!(clamp_quality(255), MAX_JPEG_QUALITY);
        assert_eq!(clamp_quality(85), 85);
    }

    #[test]
    fn placeholder_rejects_hostile_dimensions() {
        assert!(placeholder_jpeg(u32::MAX, u32::MAX).is_err());
        assert!(placeholder_jpeg(100_000, 100_000).is_err());
        assert!(placeholder_jpeg(0, 480).is_err());
    }

    #[test]
    fn placeholder_is_decodable() {
        let frame = placeholder_jpeg(64, 48).expect("placeholder");
        let decoded = image::load_from_memory(frame.as_bytes()).expect("decode");
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }
}
