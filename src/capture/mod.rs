//! Camera capture backends.
//!
//! This module provides the hardware seam of the hub:
//! - `DeviceIdentity`: the immutable camera configuration key
//! - `RawImage`: one uncompressed RGB frame as read from a device
//! - `FrameSource`: one open capture handle (one `read()` per frame)
//! - `SourceOpener`: how a session acquires a `FrameSource`
//! - `PlatformOpener`: the production opener, walking an ordered list of
//!   backend candidates until one both opens and survives a test read
//!
//! Sources are exclusively owned by the capture session that opened them and
//! are only ever touched by that session's acquisition worker.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticSource;
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Source;

/// Capture backend selector. Part of the device identity: the same index at
/// the same resolution through a different backend is a different camera as
/// far as the registry is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Platform default: walk the compiled-in candidate list in order.
    Auto,
    /// Linux V4L2 device node (`/dev/video<index>`).
    V4l2,
    /// Synthetic pattern generator. No hardware; used for stub cameras
    /// and tests.
    Synthetic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::V4l2 => "v4l2",
            BackendKind::Synthetic => "synthetic",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "v4l2" => Ok(BackendKind::V4l2),
            "synthetic" | "stub" => Ok(BackendKind::Synthetic),
            other => Err(anyhow!(
                "unknown capture backend '{}'; expected auto, v4l2 or synthetic",
                other
            )),
        }
    }
}

/// Immutable camera configuration. Equality/hash key for the registry: two
/// requests with the same identity share one capture session and one open
/// hardware handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub backend: BackendKind,
}

impl DeviceIdentity {
    pub fn new(index: u32, width: u32, height: u32, backend: BackendKind) -> Self {
        Self {
            index,
            width,
            height,
            backend,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "camera {} ({}x{}, {})",
            self.index, self.width, self.height, self.backend
        )
    }
}

/// Largest frame edge any backend will produce or any endpoint will accept.
pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// RGB buffer size for a frame, with the dimensions validated first. Both
/// edges must be nonzero and at most `MAX_FRAME_DIMENSION`; the multiply is
/// checked so hostile dimensions become an error, never a panic or a
/// multi-gigabyte allocation.
pub fn rgb_buffer_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions {}x{} must be nonzero", width, height));
    }
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(anyhow!(
            "frame dimensions {}x{} exceed the {} pixel edge limit",
            width,
            height,
            MAX_FRAME_DIMENSION
        ));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions {}x{} overflow", width, height))
}

/// One uncompressed RGB frame (3 bytes per pixel, row-major).
#[derive(Clone)]
pub struct RawImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// An open capture handle. One `read()` call per frame.
///
/// Implementations must not block indefinitely on a dead device; a read that
/// cannot produce a frame returns an error and lets the session's retry and
/// reopen policy decide what happens next.
pub trait FrameSource: Send {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Capture the next frame.
    fn read(&mut self) -> Result<RawImage>;
}

/// How a capture session acquires a `FrameSource`.
///
/// The seam exists so tests can inject scripted sources; production code
/// uses `PlatformOpener`.
pub trait SourceOpener: Send + Sync {
    /// Open a source for `identity`, sleeping `warmup` between opening the
    /// device and trusting reads from it.
    fn open(&self, identity: &DeviceIdentity, warmup: Duration)
        -> Result<Box<dyn FrameSource>>;
}

/// Production opener. Resolves `BackendKind::Auto` to the compiled-in
/// candidate list and tries each candidate in order; a candidate counts as
/// open only once a test read returns a real frame.
pub struct PlatformOpener;

impl PlatformOpener {
    fn candidates(backend: BackendKind) -> Vec<BackendKind> {
        match backend {
            #[cfg(feature = "capture-v4l2")]
            BackendKind::Auto => vec![BackendKind::V4l2],
            #[cfg(not(feature = "capture-v4l2"))]
            BackendKind::Auto => vec![BackendKind::Synthetic],
            other => vec![other],
        }
    }

    fn open_candidate(
        candidate: BackendKind,
        identity: &DeviceIdentity,
    ) -> Result<Box<dyn FrameSource>> {
        match candidate {
            BackendKind::Synthetic => Ok(Box::new(SyntheticSource::new(
                identity.width,
                identity.height,
            ))),
            #[cfg(feature = "capture-v4l2")]
            BackendKind::V4l2 => Ok(Box::new(V4l2Source::open(identity)?)),
            #[cfg(not(feature = "capture-v4l2"))]
            BackendKind::V4l2 => Err(anyhow!(
                "v4l2 backend requested but the capture-v4l2 feature is not compiled in"
            )),
            BackendKind::Auto => unreachable!("auto is resolved before opening"),
        }
    }
}

impl SourceOpener for PlatformOpener {
    fn open(
        &self,
        identity: &DeviceIdentity,
        warmup: Duration,
    ) -> Result<Box<dyn FrameSource>> {
        let candidates = Self::candidates(identity.backend);
        let mut last_err = None;

        for candidate in candidates {
            log::info!("{}: trying backend {}", identity, candidate);
            let mut source = match Self::open_candidate(candidate, identity) {
                Ok(source) => source,
                Err(err) => {
                    log::warn!("{}: backend {} failed to open: {}", identity, candidate, err);
                    last_err = Some(err);
                    continue;
                }
            };

            if !warmup.is_zero() {
                std::thread::sleep(warmup);
            }

            // The handle only counts as open once it proves it can deliver.
            match source.read() {
                Ok(_) => {
                    log::info!("{}: opened via {}", identity, source.name());
                    return Ok(source);
                }
                Err(err) => {
                    log::warn!(
                        "{}: backend {} opened but test read failed: {}",
                        identity,
                        candidate,
                        err
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no capture backend available")))
            .map_err(|err| err.context(format!("cannot open {}", identity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses() {
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert_eq!("V4L2".parse::<BackendKind>().unwrap(), BackendKind::V4l2);
        assert_eq!(
            "stub".parse::<BackendKind>().unwrap(),
            BackendKind::Synthetic
        );
        assert!("gstreamer".parse::<BackendKind>().is_err());
    }

    #[test]
    fn identities_key_on_every_field() {
        let base = DeviceIdentity::new(0, 640, 480, BackendKind::Synthetic);
        assert_eq!(base, DeviceIdentity::new(0, 640, 480, BackendKind::Synthetic));
        assert_ne!(base, DeviceIdentity::new(1, 640, 480, BackendKind::Synthetic));
        assert_ne!(base, DeviceIdentity::new(0, 320, 480, BackendKind::Synthetic));
        assert_ne!(base, DeviceIdentity::new(0, 640, 480, BackendKind::Auto));
    }

    #[test]
    fn buffer_len_rejects_hostile_dimensions() {
        assert_eq!(rgb_buffer_len(640, 480).unwrap(), 640 * 480 * 3);
        assert!(rgb_buffer_len(0, 480).is_err());
        assert!(rgb_buffer_len(640, 0).is_err());
        assert!(rgb_buffer_len(100_000, 100_000).is_err());
        assert!(rgb_buffer_len(u32::MAX, u32::MAX).is_err());
    }

    #[test]
    fn platform_opener_serves_synthetic() {
        let identity = DeviceIdentity::new(0, 32, 24, BackendKind::Synthetic);
        let mut source = PlatformOpener
            .open(&identity, Duration::ZERO)
            .expect("open synthetic");
        let image = source.read().expect("read");
        assert_eq!(image.width, 32);
        assert_eq!(image.height, 24);
        assert_eq!(image.pixels.len(), 32 * 24 * 3);
    }
}
