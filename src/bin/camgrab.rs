//! camgrab - grab one frame from a camera and write it to disk.
//!
//! Starts (or joins) the capture session for the requested configuration,
//! waits for a frame up to the timeout, and falls back to a synchronous
//! seed read, the same path in-process single-frame callers use.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use camhub::{
    BackendKind, CaptureSession, DeviceIdentity, PlatformOpener, StreamSettings,
};

#[derive(Parser, Debug)]
#[command(name = "camgrab", about = "Grab one JPEG frame from a camera")]
struct Args {
    /// Camera index (0 = default device).
    #[arg(long, default_value_t = 0)]
    index: u32,

    /// Capture width in pixels.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Capture height in pixels.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Capture backend: auto, v4l2 or synthetic.
    #[arg(long, default_value = "auto", env = "CAMHUB_BACKEND")]
    backend: BackendKind,

    /// JPEG quality (1-100).
    #[arg(long, default_value_t = 85)]
    quality: u8,

    /// How long to wait for a frame before the seed read, in milliseconds.
    #[arg(long, default_value_t = 1500)]
    timeout_ms: u64,

    /// Output file.
    #[arg(long, default_value = "frame.jpg")]
    out: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let identity = DeviceIdentity::new(args.index, args.width, args.height, args.backend);

    let session = CaptureSession::new(identity, Arc::new(PlatformOpener));
    session.start(StreamSettings {
        fps: 15.0,
        quality: args.quality,
    });

    let frame = session
        .await_frame(Duration::from_millis(args.timeout_ms))
        .with_context(|| format!("no frame from {}", identity))?;
    session.stop();

    std::fs::write(&args.out, frame.as_bytes())
        .with_context(|| format!("write {}", args.out.display()))?;
    log::info!(
        "wrote {} ({} bytes) from {}",
        args.out.display(),
        frame.len(),
        identity
    );

    Ok(())
}
