//! Process-wide registry of capture sessions.
//!
//! One `CaptureSession` per distinct `DeviceIdentity`, so at most one open
//! hardware handle exists per camera configuration no matter how many
//! consumers ask for it. The map mutex is held only for the lookup-or-insert
//! itself; constructing a session never touches hardware.
//!
//! Sessions are never evicted: a stopped session keeps only its identity,
//! tuning and last cached frame, so retention acts as a bounded warm cache
//! rather than a handle leak.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::capture::{DeviceIdentity, PlatformOpener, SourceOpener};
use crate::session::{CaptureSession, SessionTuning};

pub struct DeviceRegistry {
    sessions: Mutex<HashMap<DeviceIdentity, Arc<CaptureSession>>>,
    opener: Arc<dyn SourceOpener>,
    tuning: SessionTuning,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_opener(Arc::new(PlatformOpener), SessionTuning::default())
    }

    pub fn with_opener(opener: Arc<dyn SourceOpener>, tuning: SessionTuning) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            opener,
            tuning,
        }
    }

    /// Return the session for `identity`, creating an Idle one on first
    /// request. Concurrent calls with the same identity return the same
    /// session; distinct identities only serialize on the brief map lock.
    pub fn get_or_create(&self, identity: DeviceIdentity) -> Arc<CaptureSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(identity)
            .or_insert_with(|| {
                log::info!("registering {}", identity);
                Arc::new(CaptureSession::with_tuning(
                    identity,
                    self.opener.clone(),
                    self.tuning,
                ))
            })
            .clone()
    }

    /// Number of registered sessions (for health logging).
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every session. Called on daemon shutdown.
    pub fn stop_all(&self) {
        let sessions: Vec<_> = {
            let map = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        for session in sessions {
            session.stop();
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{BackendKind, FrameSource, SyntheticSource};
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingOpener {
        opens: AtomicUsize,
    }

    impl SourceOpener for CountingOpener {
        fn open(
            &self,
            identity: &DeviceIdentity,
            _warmup: Duration,
        ) -> Result<Box<dyn FrameSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(SyntheticSource::new(identity.width, identity.height)))
        }
    }

    fn fast_tuning() -> SessionTuning {
        SessionTuning {
            warmup: Duration::ZERO,
            soft_retry_delay: Duration::from_millis(1),
            reopen_delay: Duration::from_millis(1),
            join_timeout: Duration::from_millis(500),
            first_frame_poll: Duration::from_millis(5),
            ..SessionTuning::default()
        }
    }

    #[test]
    fn same_identity_shares_one_session() {
        let registry = DeviceRegistry::with_opener(
            Arc::new(CountingOpener {
                opens: AtomicUsize::new(0),
            }),
            fast_tuning(),
        );
        let identity = DeviceIdentity::new(0, 640, 480, BackendKind::Synthetic);

        let a = registry.get_or_create(identity);
        let b = registry.get_or_create(identity);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_callers_trigger_exactly_one_open() {
        let opener = Arc::new(CountingOpener {
            opens: AtomicUsize::new(0),
        });
        let registry = Arc::new(DeviceRegistry::with_opener(opener.clone(), fast_tuning()));
        let identity = DeviceIdentity::new(0, 16, 12, BackendKind::Synthetic);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let session = registry.get_or_create(identity);
                    session.start(crate::session::StreamSettings::default());
                    session
                })
            })
            .collect();
        let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for pair in sessions.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }

        // Give the single worker a moment to open and produce.
        let session = &sessions[0];
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while session.get_latest().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(session.get_latest().is_some());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);

        registry.stop_all();
    }

    #[test]
    fn different_identities_are_independent() {
        let registry = DeviceRegistry::with_opener(
            Arc::new(CountingOpener {
                opens: AtomicUsize::new(0),
            }),
            fast_tuning(),
        );

        let a = registry.get_or_create(DeviceIdentity::new(0, 640, 480, BackendKind::Synthetic));
        let b = registry.get_or_create(DeviceIdentity::new(0, 320, 240, BackendKind::Synthetic));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sessions_are_retained_after_stop() {
        let registry = DeviceRegistry::with_opener(
            Arc::new(CountingOpener {
                opens: AtomicUsize::new(0),
            }),
            fast_tuning(),
        );
        let identity = DeviceIdentity::new(3, 64, 48, BackendKind::Synthetic);

        let session = registry.get_or_create(identity);
        session.start(crate::session::StreamSettings::default());
        session.stop();

        let again = registry.get_or_create(identity);
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(registry.len(), 1);
    }
}
