//! MJPEG multipart framing and the per-consumer stream loop.
//!
//! `encode_part` is the pure framing function: one JPEG buffer in, one
//! `multipart/x-mixed-replace` part out. `StreamHandler` is the per-consumer
//! loop: poll the session's latest frame and emit framed parts into one
//! outbound sink until that sink rejects further writes.
//!
//! Delivery is lossy latest-value-wins: a slow consumer skips frames and may
//! receive the same frame twice; frames carry no sequence numbers.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::frame::Frame;
use crate::session::CaptureSession;

/// Boundary token used by the HTTP streaming endpoint.
pub const MULTIPART_BOUNDARY: &str = "frame";

const DEFAULT_FIRST_FRAME_DEADLINE: Duration = Duration::from_secs(3);
const WAIT_POLL: Duration = Duration::from_millis(30);
const EMIT_POLL: Duration = Duration::from_millis(10);

/// `Content-Type` value for a stream using `boundary`.
pub fn multipart_content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={}", boundary)
}

/// Frame one JPEG buffer as a multipart part:
/// `--<boundary>\r\nContent-Type: image/jpeg\r\nContent-Length: <L>\r\n\r\n<bytes>\r\n`
///
/// Callers must not pass empty bytes; a zero-length part is never emitted
/// (the stream loop skips empty frames).
pub fn encode_part(boundary: &str, jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Per-consumer stream loop over one capture session.
///
/// The loop is lazy, unbounded and non-restartable; it terminates only when
/// the sink rejects a write (consumer disconnected). There is no
/// server-initiated cancellation.
pub struct StreamHandler {
    session: Arc<CaptureSession>,
    boundary: String,
    first_frame_deadline: Duration,
    /// Served once if the camera produces nothing within the deadline, so a
    /// consumer sees a picture instead of a silent hang.
    placeholder: Option<Frame>,
}

impl StreamHandler {
    pub fn new(session: Arc<CaptureSession>) -> Self {
        Self {
            session,
            boundary: MULTIPART_BOUNDARY.to_string(),
            first_frame_deadline: DEFAULT_FIRST_FRAME_DEADLINE,
            placeholder: None,
        }
    }

    pub fn with_first_frame_deadline(mut self, deadline: Duration) -> Self {
        self.first_frame_deadline = deadline;
        self
    }

    pub fn with_placeholder(mut self, placeholder: Frame) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Run the loop against `sink`. Returns `Ok(())` once the consumer
    /// disconnects; errors never propagate from individual frames.
    pub fn run(&self, sink: &mut dyn Write) -> Result<()> {
        // Wait for the first frame, but start emitting the moment one
        // appears rather than sitting out the full deadline.
        let deadline = Instant::now() + self.first_frame_deadline;
        while self.session.get_latest().is_none() && Instant::now() < deadline {
            std::thread::sleep(WAIT_POLL);
        }

        if self.session.get_latest().is_none() {
            log::warn!(
                "{}: first frame deadline {:?} expired with no frame",
                self.session.identity(),
                self.first_frame_deadline
            );
            if let Some(placeholder) = &self.placeholder {
                log::debug!("{}: serving placeholder", self.session.identity());
                if !self.emit(sink, placeholder) {
                    return Ok(());
                }
            }
        }

        loop {
            if let Some(frame) = self.session.get_latest() {
                // Never emit a zero-length part.
                if !frame.is_empty() && !self.emit(sink, &frame) {
                    return Ok(());
                }
            }
            std::thread::sleep(EMIT_POLL);
        }
    }

    /// Write one framed part. Returns false when the sink rejected the
    /// write, i.e. the consumer is gone.
    fn emit(&self, sink: &mut dyn Write, frame: &Frame) -> bool {
        let part = encode_part(&self.boundary, frame.as_bytes());
        if let Err(err) = sink.write_all(&part).and_then(|_| sink.flush()) {
            log::debug!(
                "{}: stream consumer disconnected: {}",
                self.session.identity(),
                err
            );
            return false;
        }
        true
    }
}
