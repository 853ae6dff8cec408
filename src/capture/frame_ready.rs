//! The single signal crossing from camera callbacks to the render thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// Set by capture completion, consumed by the render tick.
///
/// `signal` publishes with release ordering and `take` consumes with
/// acquire ordering, so everything the camera thread wrote before signalling
/// is visible to the render thread once it observes the flag.
#[derive(Debug, Default)]
pub struct FrameReady {
    flag: CachePadded<AtomicBool>,
}

impl FrameReady {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Consume the flag; returns whether a frame was pending
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}
