//! Synthetic frame source.
//!
//! Generates a deterministic moving pattern instead of touching hardware.
//! Used for stub cameras (demos, machines with no capture device compiled
//! in) and throughout the test suite.

use anyhow::Result;

use super::{rgb_buffer_len, FrameSource, RawImage};

pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_count: u64,
    /// Simulated scene state; bumped occasionally so consecutive frames
    /// differ the way a live scene would.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn generate_pixels(&mut self) -> Result<Vec<u8>> {
        let buffer_len = rgb_buffer_len(self.width, self.height)?;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; buffer_len];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            // Mix frame count, scene state and position for variation.
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn read(&mut self) -> Result<RawImage> {
        self.frame_count += 1;
        Ok(RawImage {
            pixels: self.generate_pixels()?,
            width: self.width,
            height: self.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_frames_of_requested_size() {
        let mut source = SyntheticSource::new(64, 48);
        let image = source.read().expect("read");
        assert_eq!(image.width, 64);
        assert_eq!(image.height, 48);
        assert_eq!(image.pixels.len(), 64 * 48 * 3);
    }

    #[test]
    fn oversized_dimensions_fail_the_read() {
        let mut source = SyntheticSource::new(100_000, 100_000);
        assert!(source.read().is_err());
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut source = SyntheticSource::new(16, 16);
        let first = source.read().expect("read").pixels;
        let second = source.read().expect("read").pixels;
        assert_ne!(first, second);
    }
}
