//! camhub: shared camera capture and MJPEG streaming hub.
//!
//! One process-wide registry opens at most one hardware capture handle per
//! distinct camera configuration, grabs and JPEG-compresses frames on a
//! dedicated background worker per camera, and fans the resulting frame
//! stream out to any number of independent consumers: HTTP clients reading
//! a live multipart stream, and in-process callers fetching the current
//! frame. No consumer can block capture; frame delivery is lossy
//! latest-value-wins.
//!
//! # Module structure
//!
//! - `capture`: device identities, capture backends, the hardware seam
//! - `frame`: compressed frames and the single-slot frame cache
//! - `encode`: JPEG compression
//! - `session`: capture sessions and the acquisition loop state machine
//! - `registry`: process-wide identity -> session map
//! - `stream`: multipart framing and the per-consumer stream loop
//! - `server`: the HTTP endpoints
//! - `config`: daemon configuration

pub mod capture;
pub mod config;
pub mod encode;
pub mod frame;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;

pub use capture::{
    rgb_buffer_len, BackendKind, DeviceIdentity, FrameSource, PlatformOpener, SourceOpener,
    MAX_FRAME_DIMENSION,
};
pub use config::{HubConfig, StreamDefaults};
pub use frame::{Frame, FrameCache};
pub use registry::DeviceRegistry;
pub use server::{ServerHandle, StreamServer};
pub use session::{
    CaptureSession, SessionState, SessionStats, SessionTuning, StreamSettings,
};
pub use stream::{encode_part, multipart_content_type, StreamHandler, MULTIPART_BOUNDARY};
