//! Compressed frame container and the single-slot frame cache.
//!
//! - `Frame`: immutable JPEG byte buffer, cheap to clone (shared allocation).
//! - `FrameCache`: holds zero or one `Frame`; the acquisition worker is the
//!   only writer, every consumer is a reader.
//!
//! The cache is the one piece of state shared between the producer and an
//! arbitrary number of consumers. Its mutex is held only for the O(1)
//! replace/clone, never across device I/O or compression. A write fully
//! replaces the previous frame; a reader observes either the old frame or
//! the new one, never a mix.

use std::sync::{Arc, Mutex};

/// One compressed (JPEG) frame. Immutable once created.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
}

impl Frame {
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self { data: jpeg.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Single-slot, overwrite-on-write holder for the most recent frame.
///
/// Delivery through the cache is lossy by contract: a slow reader skips
/// frames, a fast reader may see the same frame twice.
pub struct FrameCache {
    slot: Mutex<Option<Frame>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Replace the cached frame. The previous frame (if any) is dropped.
    pub fn store(&self, frame: Frame) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(frame);
    }

    /// Non-blocking read of the latest frame. `None` until the first store.
    pub fn latest(&self) -> Option<Frame> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.clone()
    }

    /// Drop any cached frame. Called on `start()` so a fresh session does
    /// not serve a stale frame from a previous run.
    pub fn clear(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn cache_starts_empty() {
        let cache = FrameCache::new();
        assert!(cache.latest().is_none());
    }

    #[test]
    fn second_write_fully_replaces_first() {
        let cache = FrameCache::new();
        cache.store(Frame::new(vec![1, 1, 1]));
        cache.store(Frame::new(vec![2, 2]));

        let latest = cache.latest().expect("frame present");
        assert_eq!(latest.as_bytes(), &[2, 2]);
    }

    #[test]
    fn clear_drops_cached_frame() {
        let cache = FrameCache::new();
        cache.store(Frame::new(vec![9]));
        cache.clear();
        assert!(cache.latest().is_none());
    }

    #[test]
    fn readers_never_observe_a_torn_frame() {
        // One writer alternating between two distinct payloads, many readers.
        // Every observed frame must be exactly one of the payloads.
        let cache = Arc::new(FrameCache::new());
        let a = vec![0xAAu8; 512];
        let b = vec![0xBBu8; 256];

        let writer = {
            let cache = cache.clone();
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                for i in 0..500 {
                    let payload = if i % 2 == 0 { a.clone() } else { b.clone() };
                    cache.store(Frame::new(payload));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(frame) = cache.latest() {
                            let bytes = frame.as_bytes();
                            assert!(bytes == a.as_slice() || bytes == b.as_slice());
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
