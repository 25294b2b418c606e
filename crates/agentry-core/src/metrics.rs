//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations, no locking.
pub struct Metrics {
    events_published: AtomicU64,
    agents_spawned: AtomicU64,
    budget_breaches: AtomicU64,
    backend_retries: AtomicU64,
    gate_decisions: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            agents_spawned: AtomicU64::new(0),
            budget_breaches: AtomicU64::new(0),
            backend_retries: AtomicU64::new(0),
            gate_decisions: AtomicU64::new(0),
        }
    }

    pub fn inc_events_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_agents_spawned(&self) {
        self.agents_spawned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agents_spawned", "counter incremented");
    }

    /// Count one `resource.limit.cost` / `resource.limit.time` emission.
    pub fn inc_budget_breaches(&self) {
        self.budget_breaches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "budget_breaches", "counter incremented");
    }

    pub fn inc_backend_retries(&self) {
        self.backend_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backend_retries", "counter incremented");
    }

    pub fn inc_gate_decisions(&self) {
        self.gate_decisions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "gate_decisions", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_published = self.events_published(),
            agents_spawned = self.agents_spawned(),
            budget_breaches = self.budget_breaches(),
            backend_retries = self.backend_retries(),
            gate_decisions = self.gate_decisions(),
        );
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    pub fn agents_spawned(&self) -> u64 {
        self.agents_spawned.load(Ordering::Relaxed)
    }

    pub fn budget_breaches(&self) -> u64 {
        self.budget_breaches.load(Ordering::Relaxed)
    }

    pub fn backend_retries(&self) -> u64 {
        self.backend_retries.load(Ordering::Relaxed)
    }

    pub fn gate_decisions(&self) -> u64 {
        self.gate_decisions.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.events_published.store(0, Ordering::Relaxed);
        self.agents_spawned.store(0, Ordering::Relaxed);
        self.budget_breaches.store(0, Ordering::Relaxed);
        self.backend_retries.store(0, Ordering::Relaxed);
        self.gate_decisions.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.events_published(), 0);
        m.inc_events_published();
        m.inc_events_published();
        assert_eq!(m.events_published(), 2);

        m.inc_agents_spawned();
        assert_eq!(m.agents_spawned(), 1);

        m.inc_budget_breaches();
        m.inc_backend_retries();
        m.inc_gate_decisions();
        assert_eq!(m.budget_breaches(), 1);
        assert_eq!(m.backend_retries(), 1);
        assert_eq!(m.gate_decisions(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_events_published();
        m.inc_agents_spawned();
        m.inc_budget_breaches();
        m.reset();
        assert_eq!(m.events_published(), 0);
        assert_eq!(m.agents_spawned(), 0);
        assert_eq!(m.budget_breaches(), 0);
    }
}
