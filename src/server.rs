//! HTTP face of the hub.
//!
//! A small threaded server over `TcpListener`:
//! - `GET /camera/{index}.mjpg?w=&h=&fps=&q=`: live MJPEG multipart stream,
//!   open until the client disconnects
//! - `GET /camera/{index}.jpg?w=&h=&fps=&q=&timeout_ms=`: single current
//!   frame, with a synchronous seed read as the last resort
//! - `GET /health`: liveness probe
//!
//! The accept loop runs nonblocking on its own thread and spawns one thread
//! per connection; stream connections are long-lived by design.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::capture::{rgb_buffer_len, DeviceIdentity};
use crate::config::{HubConfig, StreamDefaults};
use crate::encode::placeholder_jpeg;
use crate::registry::DeviceRegistry;
use crate::session::{CaptureSession, StreamSettings};
use crate::stream::{multipart_content_type, StreamHandler, MULTIPART_BOUNDARY};

const MAX_REQUEST_BYTES: usize = 8192;

pub struct StreamServer {
    cfg: HubConfig,
    registry: Arc<DeviceRegistry>,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        Ok(())
    }
}

impl StreamServer {
    pub fn new(cfg: HubConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let registry = self.registry.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, cfg, registry, shutdown_thread) {
                log::error!("stream server stopped: {}", err);
            }
        });

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(
    listener: TcpListener,
    cfg: HubConfig,
    registry: Arc<DeviceRegistry>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = cfg.clone();
                let registry = registry.clone();
                // One thread per consumer; stream connections live until the
                // client disconnects.
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &registry) {
                        log::warn!("request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &HubConfig,
    registry: &DeviceRegistry,
) -> Result<()> {
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    if request.path == "/health" {
        write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?;
        return Ok(());
    }

    let Some((index, route)) = camera_route(&request.path) else {
        write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?;
        return Ok(());
    };

    let params = match StreamParams::from_query(&request.query, &cfg.stream) {
        Ok(params) => params,
        Err(err) => {
            log::debug!("bad query on {}: {}", request.path, err);
            write_json_response(&mut stream, 400, r#"{"error":"bad_query_parameter"}"#)?;
            return Ok(());
        }
    };

    let identity = DeviceIdentity::new(index, params.width, params.height, cfg.backend);
    let session = registry.get_or_create(identity);
    session.start(StreamSettings {
        fps: params.fps,
        quality: params.quality,
    });

    match route {
        CameraRoute::Stream => serve_stream(stream, cfg, session, &params),
        CameraRoute::Snapshot => serve_snapshot(stream, session, &params),
    }
}

fn serve_stream(
    mut stream: TcpStream,
    cfg: &HubConfig,
    session: Arc<CaptureSession>,
    params: &StreamParams,
) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        multipart_content_type(MULTIPART_BOUNDARY)
    );
    stream.write_all(header.as_bytes())?;

    let mut handler = StreamHandler::new(session)
        .with_first_frame_deadline(cfg.stream.first_frame_deadline);
    match placeholder_jpeg(params.width, params.height) {
        Ok(placeholder) => handler = handler.with_placeholder(placeholder),
        Err(err) => log::warn!("placeholder generation failed: {:#}", err),
    }
    handler.run(&mut stream)
}

fn serve_snapshot(
    mut stream: TcpStream,
    session: Arc<CaptureSession>,
    params: &StreamParams,
) -> Result<()> {
    match session.await_frame(params.snapshot_timeout) {
        Ok(frame) => write_response(&mut stream, 200, "image/jpeg", frame.as_bytes()),
        Err(err) => {
            log::warn!("snapshot failed: {:#}", err);
            write_json_response(&mut stream, 503, r#"{"error":"camera_timeout"}"#)
        }
    }
}

enum CameraRoute {
    Stream,
    Snapshot,
}

fn camera_route(path: &str) -> Option<(u32, CameraRoute)> {
    let rest = path.strip_prefix("/camera/")?;
    if let Some(index) = rest.strip_suffix(".mjpg") {
        return index.parse().ok().map(|i| (i, CameraRoute::Stream));
    }
    if let Some(index) = rest.strip_suffix(".jpg") {
        return index.parse().ok().map(|i| (i, CameraRoute::Snapshot));
    }
    None
}

/// Effective per-request capture parameters: query values over the
/// configured defaults.
struct StreamParams {
    width: u32,
    height: u32,
    fps: f64,
    quality: u8,
    snapshot_timeout: Duration,
}

impl StreamParams {
    fn from_query(query: &HashMap<String, String>, defaults: &StreamDefaults) -> Result<Self> {
        let width = parse_or(query, "w", defaults.width)?;
        let height = parse_or(query, "h", defaults.height)?;
        // Hostile dimensions must die here with a 400, not in a capture or
        // encode thread.
        rgb_buffer_len(width, height)?;
        Ok(Self {
            width,
            height,
            fps: parse_or(query, "fps", defaults.fps)?,
            quality: parse_or(query, "q", defaults.quality)?,
            snapshot_timeout: Duration::from_millis(parse_or(
                query,
                "timeout_ms",
                defaults.snapshot_timeout.as_millis() as u64,
            )?),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    query: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T> {
    match query.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid value for query parameter '{}'", key)),
        None => Ok(default),
    }
}

struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            params.insert(k.to_string(), v.to_string());
        }
    }
    params
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}
