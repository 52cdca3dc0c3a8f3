//! Global atomic counters for process lifecycle observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    processes_spawned: AtomicU64,
    processes_killed: AtomicU64,
    spawn_failures: AtomicU64,
    unexpected_exits: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            processes_spawned: AtomicU64::new(0),
            processes_killed: AtomicU64::new(0),
            spawn_failures: AtomicU64::new(0),
            unexpected_exits: AtomicU64::new(0),
        }
    }

    pub fn inc_spawned(&self) {
        self.processes_spawned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "processes_spawned", "counter incremented");
    }

    pub fn inc_killed(&self) {
        self.processes_killed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "processes_killed", "counter incremented");
    }

    pub fn inc_spawn_failures(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "spawn_failures", "counter incremented");
    }

    pub fn inc_unexpected_exits(&self) {
        self.unexpected_exits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "unexpected_exits", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (end of start, end of teardown).
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            processes_spawned = self.processes_spawned(),
            processes_killed = self.processes_killed(),
            spawn_failures = self.spawn_failures(),
            unexpected_exits = self.unexpected_exits(),
        );
    }

    pub fn processes_spawned(&self) -> u64 {
        self.processes_spawned.load(Ordering::Relaxed)
    }

    pub fn processes_killed(&self) -> u64 {
        self.processes_killed.load(Ordering::Relaxed)
    }

    pub fn spawn_failures(&self) -> u64 {
        self.spawn_failures.load(Ordering::Relaxed)
    }

    pub fn unexpected_exits(&self) -> u64 {
        self.unexpected_exits.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.processes_spawned.store(0, Ordering::Relaxed);
        self.processes_killed.store(0, Ordering::Relaxed);
        self.spawn_failures.store(0, Ordering::Relaxed);
        self.unexpected_exits.store(0, Ordering::Relaxed);
    }
}
