use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of [`KmdStats`], suitable for telemetry or a debug escape.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KmdStatsSnapshot {
    pub submissions: u64,
    pub internal_submissions: u64,
    pub backpressure: u64,
    pub rejected_not_ready: u64,
    pub interrupts_claimed: u64,
    pub interrupts_declined: u64,
    pub spurious_interrupts: u64,
    pub error_interrupts: u64,
    pub error_notifications: u64,
    pub vblanks: u64,
    pub retired: u64,
    pub internal_retired: u64,
    pub invariant_violations: u64,
}

/// Counters for the submission core. Updated from every concurrency domain with relaxed
/// atomics; only the snapshot is meant to be read.
#[derive(Debug, Default)]
pub struct KmdStats {
    submissions: AtomicU64,
    internal_submissions: AtomicU64,
    backpressure: AtomicU64,
    rejected_not_ready: AtomicU64,
    interrupts_claimed: AtomicU64,
    interrupts_declined: AtomicU64,
    spurious_interrupts: AtomicU64,
    error_interrupts: AtomicU64,
    error_notifications: AtomicU64,
    vblanks: AtomicU64,
    retired: AtomicU64,
    internal_retired: AtomicU64,
    invariant_violations: AtomicU64,
}

impl KmdStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_internal_submissions(&self) {
        self.internal_submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backpressure(&self) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_not_ready(&self) {
        self.rejected_not_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_interrupts_claimed(&self) {
        self.interrupts_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_interrupts_declined(&self) {
        self.interrupts_declined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spurious_interrupts(&self) {
        self.spurious_interrupts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new error-interrupt count (1-based).
    pub fn inc_error_interrupts(&self) -> u64 {
        self.error_interrupts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_error_notifications(&self) {
        self.error_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_vblanks(&self) {
        self.vblanks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retired(&self, n: usize) {
        self.retired.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_internal_retired(&self, n: usize) {
        self.internal_retired.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_invariant_violations(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> KmdStatsSnapshot {
        KmdStatsSnapshot {
            submissions: self.submissions.load(Ordering::Relaxed),
            internal_submissions: self.internal_submissions.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            rejected_not_ready: self.rejected_not_ready.load(Ordering::Relaxed),
            interrupts_claimed: self.interrupts_claimed.load(Ordering::Relaxed),
            interrupts_declined: self.interrupts_declined.load(Ordering::Relaxed),
            spurious_interrupts: self.spurious_interrupts.load(Ordering::Relaxed),
            error_interrupts: self.error_interrupts.load(Ordering::Relaxed),
            error_notifications: self.error_notifications.load(Ordering::Relaxed),
            vblanks: self.vblanks.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            internal_retired: self.internal_retired.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = KmdStats::new();
        stats.inc_submissions();
        stats.inc_submissions();
        assert_eq!(stats.inc_error_interrupts(), 1);
        assert_eq!(stats.inc_error_interrupts(), 2);
        stats.add_retired(3);

        let snap = stats.snapshot();
        assert_eq!(snap.submissions, 2);
        assert_eq!(snap.error_interrupts, 2);
        assert_eq!(snap.retired, 3);
        assert_eq!(snap.backpressure, 0);
    }
}
