use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camhub::{BackendKind, HubConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMHUB_CONFIG",
        "CAMHUB_ADDR",
        "CAMHUB_BACKEND",
        "CAMHUB_FPS",
        "CAMHUB_QUALITY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "addr": "0.0.0.0:9000",
        "backend": "synthetic",
        "stream": {
            "width": 800,
            "height": 600,
            "fps": 12.0,
            "quality": 70,
            "first_frame_deadline_secs": 5.0,
            "snapshot_timeout_ms": 2000
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAMHUB_CONFIG", file.path());
    std::env::set_var("CAMHUB_FPS", "24");

    let cfg = HubConfig::load().expect("load config");
    assert_eq!(cfg.addr, "0.0.0.0:9000");
    assert_eq!(cfg.backend, BackendKind::Synthetic);
    assert_eq!(cfg.stream.width, 800);
    assert_eq!(cfg.stream.height, 600);
    // Env override wins over the file value.
    assert_eq!(cfg.stream.fps, 24.0);
    assert_eq!(cfg.stream.quality, 70);
    assert_eq!(cfg.stream.first_frame_deadline, Duration::from_secs(5));
    assert_eq!(cfg.stream.snapshot_timeout, Duration::from_millis(2000));

    clear_env();
}

#[test]
fn defaults_apply_without_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = HubConfig::load().expect("load config");
    assert_eq!(cfg.addr, "127.0.0.1:8790");
    assert_eq!(cfg.backend, BackendKind::Auto);
    assert_eq!(cfg.stream.width, 640);
    assert_eq!(cfg.stream.height, 480);
    assert_eq!(cfg.stream.fps, 15.0);
    assert_eq!(cfg.stream.quality, 85);
    assert_eq!(cfg.stream.first_frame_deadline, Duration::from_secs(3));
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{"stream": {"fps": 0.0}}"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("CAMHUB_CONFIG", file.path());

    assert!(HubConfig::load().is_err());

    clear_env();
}

#[test]
fn oversized_resolution_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{"stream": {"width": 100000, "height": 100000}}"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("CAMHUB_CONFIG", file.path());

    assert!(HubConfig::load().is_err());

    clear_env();
}
