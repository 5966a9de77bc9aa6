use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracks admission counters for the admin metrics endpoint
#[derive(Clone, Default)]
pub struct AdmissionMetrics {
    admitted: Arc<AtomicU64>,
    waitlisted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    left: Arc<AtomicU64>,
    holds_issued: Arc<AtomicU64>,
    holds_confirmed: Arc<AtomicU64>,
    holds_expired: Arc<AtomicU64>,
    holds_cancelled: Arc<AtomicU64>,
    promotions: Arc<AtomicU64>,

    /// Waitlist heads dropped because the identity already held or joined
    promotions_skipped: Arc<AtomicU64>,

    rate_limited: Arc<AtomicU64>,

    /// Requests that exhausted their CAS budget
    contention: Arc<AtomicU64>,

    sweeps: Arc<AtomicU64>,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_waitlisted(&self) {
        self.waitlisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_left(&self) {
        self.left.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hold_issued(&self) {
        self.holds_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hold_confirmed(&self) {
        self.holds_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hold_expired(&self) {
        self.holds_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hold_cancelled(&self) {
        self.holds_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_skipped(&self) {
        self.promotions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contention(&self) {
        self.contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            waitlisted: self.waitlisted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            left: self.left.load(Ordering::Relaxed),
            holds_issued: self.holds_issued.load(Ordering::Relaxed),
            holds_confirmed: self.holds_confirmed.load(Ordering::Relaxed),
            holds_expired: self.holds_expired.load(Ordering::Relaxed),
            holds_cancelled: self.holds_cancelled.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            promotions_skipped: self.promotions_skipped.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            contention: self.contention.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub waitlisted: u64,
    pub rejected: u64,
    pub left: u64,
    pub holds_issued: u64,
    pub holds_confirmed: u64,
    pub holds_expired: u64,
    pub holds_cancelled: u64,
    pub promotions: u64,
    pub promotions_skipped: u64,
    pub rate_limited: u64,
    pub contention: u64,
    pub sweeps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = AdmissionMetrics::new();
        let snapshot = metrics.get_snapshot();
        assert_eq!(snapshot.admitted, 0);
        assert_eq!(snapshot.promotions_skipped, 0);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = AdmissionMetrics::new();
        let clone = metrics.clone();

        clone.record_admitted();
        metrics.record_promotion();
        metrics.record_promotion_skipped();

        let snapshot = metrics.get_snapshot();
        assert_eq!(snapshot.admitted, 1);
        assert_eq!(snapshot.promotions, 1);
        assert_eq!(snapshot.promotions_skipped, 1);
    }

    #[test]
    fn test_concurrent_access() {
        let metrics = Arc::new(AdmissionMetrics::new());
        let mut handles = vec![];

        // Spawn 10 threads, each recording 100 admissions
        for _ in 0..10 {
            let metrics_clone = Arc::clone(&metrics);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    metrics_clone.record_admitted();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.get_snapshot().admitted, 1000);
    }
}
