//! Tier health snapshots published through a watch channel.

use log::{info, warn};
use mnemos_rs_protocol::{BackendHealth, TierKind};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Per-tier count of `mark_unavailable` transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkCounts([u64; 3]);

impl MarkCounts {
    pub fn get(&self, tier: TierKind) -> u64 {
        self.0[slot(tier)]
    }

    /// Take `tier`'s count from a later reading.
    pub fn advance(&mut self, tier: TierKind, later: &MarkCounts) {
        self.0[slot(tier)] = later.get(tier);
    }
}

fn slot(tier: TierKind) -> usize {
    match tier {
        TierKind::Cache => 0,
        TierKind::Vector => 1,
        TierKind::Durable => 2,
    }
}

/// Health of every tier at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HealthSnapshot {
    pub cache: BackendHealth,
    pub vector: BackendHealth,
    pub durable: BackendHealth,
}

impl HealthSnapshot {
    pub fn get(&self, tier: TierKind) -> BackendHealth {
        match tier {
            TierKind::Cache => self.cache,
            TierKind::Vector => self.vector,
            TierKind::Durable => self.durable,
        }
    }

    pub fn set(&mut self, tier: TierKind, health: BackendHealth) {
        match tier {
            TierKind::Cache => self.cache = health,
            TierKind::Vector => self.vector = health,
            TierKind::Durable => self.durable = health,
        }
    }

    /// Whether the tier currently receives traffic.
    pub fn is_active(&self, tier: TierKind) -> bool {
        self.get(tier).is_active()
    }
}

/// Holds the latest snapshot; readers never wait on a probe in flight.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    sender: Arc<watch::Sender<HealthSnapshot>>,
    marks: Arc<[AtomicU64; 3]>,
}

impl HealthMonitor {
    pub fn new(initial: HealthSnapshot) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
            marks: Arc::new(Default::default()),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        *self.sender.borrow()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.sender.subscribe()
    }

    /// Current mark counts; compare later with [`HealthMonitor::marked_since`].
    pub fn marks(&self) -> MarkCounts {
        let mut counts = [0; 3];
        for tier in TierKind::ALL {
            counts[slot(tier)] = self.marks[slot(tier)].load(Ordering::SeqCst);
        }
        MarkCounts(counts)
    }

    /// Whether `tier` was taken out of routing after `baseline` was read.
    pub fn marked_since(&self, tier: TierKind, baseline: &MarkCounts) -> bool {
        self.marks[slot(tier)].load(Ordering::SeqCst) != baseline.get(tier)
    }

    /// Publish a probe result, logging tier transitions.
    ///
    /// A tier marked unavailable after `baseline` stays `Unavailable` until
    /// the next probe: the failure may be newer than the probe. Returns the
    /// snapshot actually published.
    pub fn publish_probe(&self, mut next: HealthSnapshot, baseline: &MarkCounts) -> HealthSnapshot {
        let mut previous = next;
        self.sender.send_if_modified(|current| {
            previous = *current;
            for tier in TierKind::ALL {
                if self.marked_since(tier, baseline) {
                    next.set(tier, BackendHealth::Unavailable);
                }
            }
            *current = next;
            previous != next
        });
        for tier in TierKind::ALL {
            log_transition(tier, previous.get(tier), next.get(tier));
        }
        next
    }

    /// Take a tier out of routing after a failed call.
    ///
    /// Returns `true` if the tier was active before.
    pub fn mark_unavailable(&self, tier: TierKind, reason: &str) -> bool {
        let changed = self.sender.send_if_modified(|snapshot| {
            if !snapshot.is_active(tier) {
                return false;
            }
            snapshot.set(tier, BackendHealth::Unavailable);
            self.marks[slot(tier)].fetch_add(1, Ordering::SeqCst);
            true
        });
        if changed {
            warn!("tier marked unavailable (tier={tier}, reason={reason})");
        }
        changed
    }
}

fn log_transition(tier: TierKind, from: BackendHealth, to: BackendHealth) {
    if from == to {
        return;
    }
    if to == BackendHealth::Unavailable {
        warn!("tier health changed (tier={tier}, from={from}, to={to})");
    } else {
        info!("tier health changed (tier={tier}, from={from}, to={to})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mark_unavailable_only_transitions_once() {
        let monitor = HealthMonitor::new(HealthSnapshot::default());
        let receiver = monitor.subscribe();
        assert!(monitor.mark_unavailable(TierKind::Cache, "timeout"));
        assert!(!monitor.mark_unavailable(TierKind::Cache, "timeout"));
        assert_eq!(receiver.borrow().cache, BackendHealth::Unavailable);
        assert!(monitor.snapshot().is_active(TierKind::Durable));
    }

    #[test]
    fn publish_replaces_snapshot() {
        let monitor = HealthMonitor::new(HealthSnapshot::default());
        let mut next = HealthSnapshot::default();
        next.set(TierKind::Vector, BackendHealth::Degraded);
        let published = monitor.publish_probe(next, &monitor.marks());
        assert_eq!(published, next);
        assert_eq!(monitor.snapshot().vector, BackendHealth::Degraded);
        assert!(monitor.snapshot().is_active(TierKind::Vector));
    }

    #[test]
    fn mark_after_baseline_survives_publish() {
        let monitor = HealthMonitor::new(HealthSnapshot::default());
        let baseline = monitor.marks();
        assert!(monitor.mark_unavailable(TierKind::Vector, "put failed"));
        assert!(monitor.marked_since(TierKind::Vector, &baseline));
        assert!(!monitor.marked_since(TierKind::Cache, &baseline));

        let published = monitor.publish_probe(HealthSnapshot::default(), &baseline);
        assert_eq!(published.vector, BackendHealth::Unavailable);
        assert_eq!(published.cache, BackendHealth::Healthy);

        let published = monitor.publish_probe(HealthSnapshot::default(), &monitor.marks());
        assert_eq!(published.vector, BackendHealth::Healthy);
    }
}
