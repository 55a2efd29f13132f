//! Process-wide registry counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared atomic counters for registry activity
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    connections: AtomicU64,
    publishes: AtomicU64,
    unpublishes: AtomicU64,
    subscribes: AtomicU64,
    pushes: AtomicU64,
    acks: AtomicU64,
    retransmits: AtomicU64,
    stale_drops: AtomicU64,
    dropped_publishes: AtomicU64,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_publishes(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_unpublishes(&self) {
        self.unpublishes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_subscribes(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_pushes(&self) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_acks(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_retransmits(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_stale_drops(&self) {
        self.stale_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_dropped_publishes(&self) {
        self.dropped_publishes.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            unpublishes: self.unpublishes.load(Ordering::Relaxed),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
            dropped_publishes: self.dropped_publishes.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections accepted
    pub connections: u64,
    /// Effective publishes (version bumped)
    pub publishes: u64,
    /// Effective unpublishes (version bumped)
    pub unpublishes: u64,
    /// Subscribe requests handled
    pub subscribes: u64,
    /// Provider-list pushes written (initial and fan-out)
    pub pushes: u64,
    /// ACKs received
    pub acks: u64,
    /// Pushes re-sent after ack timeout
    pub retransmits: u64,
    /// Pending pushes dropped because a newer version existed
    pub stale_drops: u64,
    /// Publishes dropped for lack of a resolvable peer host
    pub dropped_publishes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let metrics = RegistryMetrics::new();
        metrics.incr_publishes();
        metrics.incr_publishes();
        metrics.incr_acks();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.publishes, 2);
        assert_eq!(snapshot.acks, 1);
        assert_eq!(snapshot.retransmits, 0);
    }
}
