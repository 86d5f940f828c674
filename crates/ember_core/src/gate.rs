//! Counting gate bounding the number of frames in flight.
//!
//! The producer acquires a [`FramePermit`] before preparing a frame. The
//! permit travels with the frame into the GPU completion callback, whose
//! only job is to release it. Dropping a permit on any early-return path
//! releases it too, so a skipped frame can never starve the gate.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct GateState {
    available: usize,
    acquired: u64,
    released: u64,
}

#[derive(Debug)]
struct GateInner {
    capacity: usize,
    state: Mutex<GateState>,
    signal: Condvar,
}

impl GateInner {
    fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.released < state.acquired, "gate released more than acquired");
        state.available += 1;
        state.released += 1;
        debug_assert!(state.available <= self.capacity);
        drop(state);
        self.signal.notify_all();
    }
}

/// Snapshot of gate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub capacity: usize,
    pub acquired: u64,
    pub released: u64,
}

impl GateStats {
    /// Frames acquired but not yet released.
    pub fn in_flight(&self) -> u64 {
        self.acquired - self.released
    }
}

/// Counting semaphore initialised to the in-flight cap.
#[derive(Debug, Clone)]
pub struct FrameGate {
    inner: Arc<GateInner>,
}

impl FrameGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                capacity,
                state: Mutex::new(GateState {
                    available: capacity,
                    acquired: 0,
                    released: 0,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Block until a slot is free.
    pub fn acquire(&self) -> FramePermit {
        let mut state = self.inner.state.lock();
        while state.available == 0 {
            self.inner.signal.wait(&mut state);
        }
        self.take(&mut state)
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<FramePermit> {
        let mut state = self.inner.state.lock();
        (state.available > 0).then(|| self.take(&mut state))
    }

    /// Block until every acquired permit has been released.
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock();
        while state.acquired != state.released {
            self.inner.signal.wait(&mut state);
        }
    }

    pub fn stats(&self) -> GateStats {
        let state = self.inner.state.lock();
        GateStats {
            capacity: self.inner.capacity,
            acquired: state.acquired,
            released: state.released,
        }
    }

    fn take(&self, state: &mut GateState) -> FramePermit {
        state.available -= 1;
        state.acquired += 1;
        FramePermit {
            inner: Some(Arc::clone(&self.inner)),
        }
    }
}

/// One frame's claim on the gate. Released exactly once: explicitly via
/// [`FramePermit::release`] or implicitly on drop.
#[derive(Debug)]
#[must_use = "dropping a permit releases its gate slot immediately"]
pub struct FramePermit {
    inner: Option<Arc<GateInner>>,
}

impl FramePermit {
    /// Post the release signal. Safe to call from any thread.
    pub fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl Drop for FramePermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}
