//! Daemon configuration.
//!
//! Loaded from an optional JSON file named by `CAMHUB_CONFIG`, with
//! environment overrides applied on top, then validated.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::capture::{BackendKind, MAX_FRAME_DIMENSION};

const DEFAULT_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f64 = 15.0;
const DEFAULT_QUALITY: u8 = 85;
const DEFAULT_FIRST_FRAME_DEADLINE_SECS: f64 = 3.0;
const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 1500;

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    addr: Option<String>,
    backend: Option<String>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    quality: Option<u8>,
    first_frame_deadline_secs: Option<f64>,
    snapshot_timeout_ms: Option<u64>,
}

/// Defaults applied to requests that omit query parameters.
#[derive(Debug, Clone, Copy)]
pub struct StreamDefaults {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub quality: u8,
    /// How long a stream consumer waits for a first frame before the
    /// placeholder is served.
    pub first_frame_deadline: Duration,
    /// How long a snapshot request waits before the synchronous seed read.
    pub snapshot_timeout: Duration,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            quality: DEFAULT_QUALITY,
            first_frame_deadline: Duration::from_secs_f64(DEFAULT_FIRST_FRAME_DEADLINE_SECS),
            snapshot_timeout: Duration::from_millis(DEFAULT_SNAPSHOT_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub addr: String,
    pub backend: BackendKind,
    pub stream: StreamDefaults,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            backend: BackendKind::Auto,
            stream: StreamDefaults::default(),
        }
    }
}

impl HubConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMHUB_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: HubConfigFile) -> Result<Self> {
        let addr = file.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let backend = match file.backend {
            Some(name) => name.parse()?,
            None => BackendKind::Auto,
        };
        let stream_file = file.stream.unwrap_or_default();
        let deadline_secs = stream_file
            .first_frame_deadline_secs
            .unwrap_or(DEFAULT_FIRST_FRAME_DEADLINE_SECS);
        if !(deadline_secs.is_finite() && deadline_secs > 0.0) {
            return Err(anyhow!("first_frame_deadline_secs must be positive"));
        }
        let stream = StreamDefaults {
            width: stream_file.width.unwrap_or(DEFAULT_WIDTH),
            height: stream_file.height.unwrap_or(DEFAULT_HEIGHT),
            fps: stream_file.fps.unwrap_or(DEFAULT_FPS),
            quality: stream_file.quality.unwrap_or(DEFAULT_QUALITY),
            first_frame_deadline: Duration::from_secs_f64(deadline_secs),
            snapshot_timeout: Duration::from_millis(
                stream_file
                    .snapshot_timeout_ms
                    .unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT_MS),
            ),
        };
        Ok(Self {
            addr,
            backend,
            stream,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMHUB_ADDR") {
            if !addr.trim().is_empty() {
                self.addr = addr;
            }
        }
        if let Ok(backend) = std::env::var("CAMHUB_BACKEND") {
            if !backend.trim().is_empty() {
                self.backend = backend.parse()?;
            }
        }
        if let Ok(fps) = std::env::var("CAMHUB_FPS") {
            self.stream.fps = fps
                .parse()
                .map_err(|_| anyhow!("CAMHUB_FPS must be a number"))?;
        }
        if let Ok(quality) = std::env::var("CAMHUB_QUALITY") {
            self.stream.quality = quality
                .parse()
                .map_err(|_| anyhow!("CAMHUB_QUALITY must be an integer 1-100"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(anyhow!("stream resolution must be non-zero"));
        }
        if self.stream.width > MAX_FRAME_DIMENSION || self.stream.height > MAX_FRAME_DIMENSION {
            return Err(anyhow!(
                "stream resolution must be at most {}x{}",
                MAX_FRAME_DIMENSION,
                MAX_FRAME_DIMENSION
            ));
        }
        if !(self.stream.fps.is_finite() && self.stream.fps > 0.0) {
            return Err(anyhow!("stream fps must be positive"));
        }
        if self.stream.quality == 0 || self.stream.quality > 100 {
            return Err(anyhow!("stream quality must be 1-100"));
        }
        if self.stream.first_frame_deadline.is_zero() {
            return Err(anyhow!("first frame deadline must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<HubConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
