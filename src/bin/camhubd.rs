//! camhubd - camera streaming daemon
//!
//! This daemon:
//! 1. Loads the hub configuration (JSON file + env overrides)
//! 2. Builds the process-wide device registry
//! 3. Serves the HTTP endpoints (MJPEG streams, snapshots, health)
//! 4. Stops all capture sessions on shutdown

use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;

use camhub::{DeviceRegistry, HubConfig, StreamServer};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HubConfig::load()?;
    let registry = Arc::new(DeviceRegistry::new());

    let handle = StreamServer::new(config.clone(), registry.clone()).spawn()?;
    log::info!("camhubd listening on {}", handle.addr);
    log::info!(
        "stream defaults: {}x{} @ {} fps, quality {}, backend {}",
        config.stream.width,
        config.stream.height,
        config.stream.fps,
        config.stream.quality,
        config.backend
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("camhubd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    handle.stop()?;
    registry.stop_all();
    log::info!("camhubd stopped ({} sessions retained)", registry.len());

    Ok(())
}
