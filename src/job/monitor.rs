use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Progress and cancellation channel between a job and whoever is waiting on it
pub trait ProgressMonitor: Send + Sync {
    /// `n` units of work are still ahead
    fn remaining(&self, n: usize);
    fn is_canceled(&self) -> bool;
    fn set_canceled(&self);
}

/// Monitor backed by atomics, safe to cancel from any thread
#[derive(Debug, Default)]
pub struct Monitor {
    remaining: AtomicUsize,
    updates: AtomicUsize,
    canceled: AtomicBool,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// the last reported backlog
    pub fn last_remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// number of progress reports received
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Acquire)
    }
}

impl ProgressMonitor for Monitor {
    fn remaining(&self, n: usize) {
        self.remaining.store(n, Ordering::Release);
        self.updates.fetch_add(1, Ordering::AcqRel);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn set_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

/// ignores progress, and can not be canceled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn remaining(&self, _n: usize) {}

    fn is_canceled(&self) -> bool {
        false
    }

    fn set_canceled(&self) {}
}
