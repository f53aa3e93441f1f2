//! Progress of a batch of engine tasks.
//!
//! Workers bump an atomic counter; an observer polls it at a bounded
//! interval instead of spinning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_secs(1);

/// Completion counter shared between workers and an observer.
#[derive(Debug, Default)]
pub struct Progress {
    done: AtomicUsize,
    total: AtomicUsize,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            done: AtomicUsize::new(0),
            total: AtomicUsize::new(total),
        }
    }

    /// Record one finished task.
    pub fn advance(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Fraction complete in `0.0..=1.0`. An empty batch counts as complete.
    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        (self.done() as f64 / total as f64).min(1.0)
    }

    pub fn is_complete(&self) -> bool {
        self.done() >= self.total()
    }

    /// Block until complete, calling `on_tick` with the fraction at every poll.
    ///
    /// `poll` is clamped to 10ms..=1s. Returns early when `on_tick` returns
    /// `false`.
    pub fn wait(&self, poll: Duration, mut on_tick: impl FnMut(f64) -> bool) {
        let poll = poll.clamp(MIN_POLL, MAX_POLL);
        loop {
            let complete = self.is_complete();
            if !on_tick(self.fraction()) || complete {
                return;
            }
            std::thread::sleep(poll);
        }
    }
}
