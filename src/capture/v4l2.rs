//! V4L2 frame source (feature `capture-v4l2`).
//!
//! Opens `/dev/video<index>`, negotiates an RGB3 format at the requested
//! resolution and captures frames through a memory-mapped buffer stream.
//! The stream borrows from the device, so the pair is held in a
//! self-referencing struct.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::{rgb_buffer_len, DeviceIdentity, FrameSource, RawImage};

pub struct V4l2Source {
    state: V4l2State,
    active_width: u32,
    active_height: u32,
    path: String,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn open(identity: &DeviceIdentity) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = format!("/dev/video{}", identity.index);
        let mut device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = identity.width;
        format.height = identity.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        // The acquisition worker compresses RGB; anything else would produce
        // buffers the encoder cannot interpret.
        if &format.fourcc.repr != b"RGB3" {
            return Err(anyhow!(
                "{} negotiated format {}, need RGB3",
                path,
                format.fourcc
            ));
        }

        let active_width = format.width;
        let active_height = format.height;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Source: opened {} ({}x{})",
            path,
            active_width,
            active_height
        );

        Ok(Self {
            state,
            active_width,
            active_height,
            path,
        })
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn read(&mut self) -> Result<RawImage> {
        use v4l::io::traits::CaptureStream;

        let (buf, _meta) = self
            .state
            .with_mut(|fields| fields.stream.next())
            .map_err(|err| {
                anyhow::Error::new(err).context(format!("capture v4l2 frame from {}", self.path))
            })?;

        let expected = rgb_buffer_len(self.active_width, self.active_height)?;
        if buf.len() < expected {
            return Err(anyhow!(
                "{} returned a short buffer ({} of {} bytes)",
                self.path,
                buf.len(),
                expected
            ));
        }

        Ok(RawImage {
            pixels: buf[..expected].to_vec(),
            width: self.active_width,
            height: self.active_height,
        })
    }
}
