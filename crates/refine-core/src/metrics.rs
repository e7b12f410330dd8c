//! Global atomic counters for refinement runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    evaluator_calls: AtomicU64,
    tiebreakers: AtomicU64,
    tasks_executed: AtomicU64,
    patches_accepted: AtomicU64,
    patches_rejected: AtomicU64,
    rollbacks: AtomicU64,
    sections_locked: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            evaluator_calls: AtomicU64::new(0),
            tiebreakers: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            patches_accepted: AtomicU64::new(0),
            patches_rejected: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            sections_locked: AtomicU64::new(0),
        }
    }

    pub fn inc_evaluator_calls(&self) {
        self.evaluator_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evaluator_calls", "counter incremented");
    }

    /// Increment when the third judge had to be consulted.
    pub fn inc_tiebreakers(&self) {
        self.tiebreakers.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tiebreakers", "counter incremented");
    }

    pub fn inc_tasks_executed(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tasks_executed", "counter incremented");
    }

    pub fn inc_patches_accepted(&self) {
        self.patches_accepted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patches_accepted", "counter incremented");
    }

    pub fn inc_patches_rejected(&self) {
        self.patches_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patches_rejected", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks", "counter incremented");
    }

    pub fn inc_sections_locked(&self) {
        self.sections_locked.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sections_locked", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            evaluator_calls = self.evaluator_calls(),
            tiebreakers = self.tiebreakers(),
            tasks_executed = self.tasks_executed(),
            patches_accepted = self.patches_accepted(),
            patches_rejected = self.patches_rejected(),
            rollbacks = self.rollbacks(),
            sections_locked = self.sections_locked(),
        );
    }

    pub fn evaluator_calls(&self) -> u64 {
        self.evaluator_calls.load(Ordering::Relaxed)
    }

    pub fn tiebreakers(&self) -> u64 {
        self.tiebreakers.load(Ordering::Relaxed)
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    pub fn patches_accepted(&self) -> u64 {
        self.patches_accepted.load(Ordering::Relaxed)
    }

    pub fn patches_rejected(&self) -> u64 {
        self.patches_rejected.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn sections_locked(&self) -> u64 {
        self.sections_locked.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.evaluator_calls.store(0, Ordering::Relaxed);
        self.tiebreakers.store(0, Ordering::Relaxed);
        self.tasks_executed.store(0, Ordering::Relaxed);
        self.patches_accepted.store(0, Ordering::Relaxed);
        self.patches_rejected.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.sections_locked.store(0, Ordering::Relaxed);
    }
}
