//! Process-wide bound on concurrently registered connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct AdmissionController {
    current: AtomicUsize,
    max: usize,
}

impl AdmissionController {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            max,
        })
    }

    /// Reserve a connection slot, or `None` when the relay is full.
    ///
    /// The check and the increment are a single compare-and-swap, so the
    /// count can never pass `max` however many attempts race. The slot is
    /// returned when the permit is dropped.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionPermit {
                controller: Arc::clone(self),
            })
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// One occupied connection slot. Released exactly once, on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.current.fetch_sub(1, Ordering::AcqRel);
    }
}
