//! Capture sessions and the acquisition loop.
//!
//! A `CaptureSession` is the unit of ownership for one camera: one open
//! hardware handle, one background acquisition worker, one frame cache.
//! Sessions are created Idle by the registry, become Running via `start()`
//! and fall back to Idle when the worker exits, voluntarily on `stop()` or
//! involuntarily when the consecutive-failure budget is exhausted.
//!
//! The acquisition loop moves through
//! `Idle -> Opening -> Running <-> Recovering -> Stopping -> Idle`:
//! - a read failure is retried a few times in place (soft retries);
//! - exhausted soft retries escalate to a full release-and-reopen;
//! - read and reopen failures share one consecutive-failure counter, reset
//!   only by a successfully read frame; when it reaches the budget the loop
//!   exits rather than spinning forever against a dead device;
//! - a JPEG encode failure drops that frame and is logged, but does not
//!   count against the device.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::capture::{DeviceIdentity, FrameSource, RawImage, SourceOpener};
use crate::encode::{clamp_quality, encode_jpeg};
use crate::frame::{Frame, FrameCache};

pub const DEFAULT_FPS: f64 = 15.0;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
const MIN_FPS: f64 = 0.1;
const MAX_FPS: f64 = 120.0;

/// Per-start capture settings. A second `start()` while the worker is alive
/// ignores these (the running settings win).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamSettings {
    pub fps: f64,
    pub quality: u8,
}

impl StreamSettings {
    /// Clamp to sane ranges before deriving the poll interval.
    pub fn clamped(self) -> Self {
        let fps = if self.fps.is_finite() {
            self.fps.clamp(MIN_FPS, MAX_FPS)
        } else {
            DEFAULT_FPS
        };
        Self {
            fps,
            quality: clamp_quality(self.quality),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Failure-recovery and timing policy for one session. Defaults are the
/// production values; tests shorten them.
#[derive(Clone, Copy, Debug)]
pub struct SessionTuning {
    /// Delay between opening a device and trusting reads from it.
    pub warmup: Duration,
    /// Immediate re-reads after a failed read before escalating to a reopen.
    pub soft_retries: u32,
    pub soft_retry_delay: Duration,
    /// Consecutive read/reopen failures tolerated before fail-stop.
    pub max_consecutive_failures: u32,
    /// Pause after a failed reopen before the next attempt.
    pub reopen_delay: Duration,
    /// How long `stop()` waits for the worker before force-releasing the
    /// hardware handle.
    pub join_timeout: Duration,
    /// Poll interval for callers waiting on a first frame.
    pub first_frame_poll: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(150),
            soft_retries: 3,
            soft_retry_delay: Duration::from_millis(50),
            max_consecutive_failures: 10,
            reopen_delay: Duration::from_secs(1),
            join_timeout: Duration::from_millis(1500),
            first_frame_poll: Duration::from_millis(30),
        }
    }
}

/// Observable acquisition-loop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Opening = 1,
    Running = 2,
    Recovering = 3,
    Stopping = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Opening,
            2 => SessionState::Running,
            3 => SessionState::Recovering,
            4 => SessionState::Stopping,
            _ => SessionState::Idle,
        }
    }
}

/// Counters exposed for health logging and tests.
#[derive(Clone, Copy, Debug)]
pub struct SessionStats {
    pub frames_produced: u64,
    pub consecutive_failures: u32,
    pub reopens: u64,
}

/// State shared between the session handle and its acquisition worker.
struct SessionShared {
    identity: DeviceIdentity,
    cache: FrameCache,
    /// The exclusively-owned hardware handle. The worker holds this lock
    /// across each device read; `stop()` takes the slot after its join
    /// timeout to force-release the handle (documented race: the release
    /// can only interleave between reads).
    source: Mutex<Option<Box<dyn FrameSource>>>,
    opener: Arc<dyn SourceOpener>,
    tuning: SessionTuning,
    settings: Mutex<StreamSettings>,
    stop: AtomicBool,
    state: AtomicU8,
    frames_produced: AtomicU64,
    consecutive_failures: AtomicU32,
    reopens: AtomicU64,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Ensure the source slot is populated, opening through the backend
    /// fallback list if needed. Serialized on the slot mutex so the worker
    /// and a synchronous seed read can never double-open the device.
    fn ensure_open(&self) -> Result<()> {
        let mut slot = self.source.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(());
        }
        let source = self.opener.open(&self.identity, self.tuning.warmup)?;
        *slot = Some(source);
        Ok(())
    }

    fn read_frame(&self) -> Result<RawImage> {
        let mut slot = self.source.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(source) => source.read(),
            None => Err(anyhow!("capture source released")),
        }
    }

    fn release_source(&self) {
        let mut slot = self.source.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

/// One camera: identity, hardware handle, acquisition worker, frame cache.
pub struct CaptureSession {
    shared: Arc<SessionShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSession {
    pub fn new(identity: DeviceIdentity, opener: Arc<dyn SourceOpener>) -> Self {
        Self::with_tuning(identity, opener, SessionTuning::default())
    }

    pub fn with_tuning(
        identity: DeviceIdentity,
        opener: Arc<dyn SourceOpener>,
        tuning: SessionTuning,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                identity,
                cache: FrameCache::new(),
                source: Mutex::new(None),
                opener,
                tuning,
                settings: Mutex::new(StreamSettings::default()),
                stop: AtomicBool::new(false),
                state: AtomicU8::new(SessionState::Idle as u8),
                frames_produced: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                reopens: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.shared.identity
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_produced: self.shared.frames_produced.load(Ordering::SeqCst),
            consecutive_failures: self.shared.consecutive_failures.load(Ordering::SeqCst),
            reopens: self.shared.reopens.load(Ordering::SeqCst),
        }
    }

    /// True while the acquisition worker is alive.
    pub fn is_active(&self) -> bool {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Launch the acquisition worker. Idempotent: a no-op while the worker
    /// is alive, including when the new settings differ from the running
    /// ones (the running settings win).
    pub fn start(&self, settings: StreamSettings) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                let running = *self.shared.settings.lock().unwrap_or_else(|e| e.into_inner());
                if settings.clamped() != running {
                    log::debug!(
                        "{}: start() ignored; worker already running with fps={} quality={}",
                        self.shared.identity,
                        running.fps,
                        running.quality
                    );
                }
                return;
            }
            // Reap the finished worker before relaunching.
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }

        let settings = settings.clamped();
        *self.shared.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings;
        self.shared.cache.clear();
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.consecutive_failures.store(0, Ordering::SeqCst);
        self.shared.set_state(SessionState::Opening);

        let shared = self.shared.clone();
        *worker = Some(std::thread::spawn(move || {
            acquisition_loop(shared, settings);
        }));
    }

    /// Signal the worker to exit, wait up to the join timeout, then
    /// force-release the hardware handle regardless.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };

        if let Some(handle) = handle {
            let deadline = Instant::now() + self.shared.tuning.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!(
                    "{}: worker did not stop within {:?}; releasing handle anyway",
                    self.shared.identity,
                    self.shared.tuning.join_timeout
                );
            }
        }

        // Best effort: if the worker is still mid-iteration this waits for
        // its current read, then drops the handle out from under it. The
        // worker then exits through its normal failure path.
        self.shared.release_source();
    }

    /// Non-blocking read of the most recent frame.
    pub fn get_latest(&self) -> Option<Frame> {
        self.shared.cache.latest()
    }

    /// Single-frame caller path: poll for a cached frame until `timeout`,
    /// then fall back to one synchronous seed read against the hardware.
    pub fn await_frame(&self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.get_latest() {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.shared.tuning.first_frame_poll);
        }

        log::info!(
            "{}: no frame within {:?}; attempting synchronous seed read",
            self.shared.identity,
            timeout
        );
        self.seed_frame()
            .with_context(|| format!("{}: camera not ready", self.shared.identity))
    }

    /// One synchronous capture outside the worker. Opens the device if no
    /// handle exists; the slot mutex guarantees at most one open handle even
    /// when this races the worker's own open.
    fn seed_frame(&self) -> Result<Frame> {
        self.shared.ensure_open()?;
        let image = self.shared.read_frame()?;
        let quality = self
            .shared
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .quality;
        let frame = encode_jpeg(&image, quality)?;
        self.shared.cache.store(frame.clone());
        Ok(frame)
    }
}

fn acquisition_loop(shared: Arc<SessionShared>, settings: StreamSettings) {
    log::info!(
        "{}: acquisition worker started (fps={}, quality={})",
        shared.identity,
        settings.fps,
        settings.quality
    );

    // Opening. A failure here is not retried beyond the opener's own backend
    // fallback list; the session simply stays Idle with no frames.
    if let Err(err) = shared.ensure_open() {
        log::error!("{}: open failed: {:#}", shared.identity, err);
        shared.set_state(SessionState::Idle);
        return;
    }
    shared.set_state(SessionState::Running);

    let interval = settings.frame_interval();

    loop {
        if shared.stop_requested() {
            break;
        }

        match read_with_recovery(&shared) {
            ReadOutcome::Frame(image) => {
                shared.consecutive_failures.store(0, Ordering::SeqCst);
                match encode_jpeg(&image, settings.quality) {
                    Ok(frame) => {
                        shared.cache.store(frame);
                        shared.frames_produced.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        // Device is healthy; drop this frame only.
                        log::warn!("{}: encode failed, frame dropped: {:#}", shared.identity, err);
                    }
                }
            }
            ReadOutcome::NoFrame => {
                // Recovery consumed this iteration; the next one reads again.
            }
            ReadOutcome::BudgetExhausted => {
                log::error!(
                    "{}: {} consecutive failures, stopping acquisition",
                    shared.identity,
                    shared.tuning.max_consecutive_failures
                );
                break;
            }
            ReadOutcome::StopRequested => break,
        }

        std::thread::sleep(interval);
    }

    // Stopping: release the handle and return the session to Idle. The cache
    // keeps its last frame (stale-but-available) until the next start().
    shared.set_state(SessionState::Stopping);
    shared.release_source();
    shared.set_state(SessionState::Idle);
    log::info!("{}: acquisition worker exiting", shared.identity);
}

enum ReadOutcome {
    Frame(RawImage),
    /// No frame this iteration; recovery (reopen or back-off) consumed it.
    NoFrame,
    BudgetExhausted,
    StopRequested,
}

/// One read attempt with the full recovery ladder: soft retries in place,
/// then a release-and-reopen, then fail-stop once the shared counter hits
/// the budget. Only a successfully read frame resets the counter.
fn read_with_recovery(shared: &SessionShared) -> ReadOutcome {
    let first_err = match shared.read_frame() {
        Ok(image) => return ReadOutcome::Frame(image),
        Err(err) => err,
    };

    let failures = shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
    log::warn!(
        "{}: read failed (consecutive failure {}): {:#}",
        shared.identity,
        failures,
        first_err
    );

    // Soft retries: a few immediate re-reads before escalating.
    for _ in 0..shared.tuning.soft_retries {
        if shared.stop_requested() {
            return ReadOutcome::StopRequested;
        }
        std::thread::sleep(shared.tuning.soft_retry_delay);
        if let Ok(image) = shared.read_frame() {
            return ReadOutcome::Frame(image);
        }
    }

    if failures >= shared.tuning.max_consecutive_failures {
        return ReadOutcome::BudgetExhausted;
    }

    // Escalate: release the handle and go through a full reopen.
    shared.set_state(SessionState::Recovering);
    shared.release_source();
    match shared.ensure_open() {
        Ok(()) => {
            shared.reopens.fetch_add(1, Ordering::SeqCst);
            shared.set_state(SessionState::Running);
            ReadOutcome::NoFrame
        }
        Err(err) => {
            let failures = shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            log::error!(
                "{}: reopen failed (consecutive failure {}): {:#}",
                shared.identity,
                failures,
                err
            );
            if failures >= shared.tuning.max_consecutive_failures {
                return ReadOutcome::BudgetExhausted;
            }
            std::thread::sleep(shared.tuning.reopen_delay);
            ReadOutcome::NoFrame
        }
    }
}
