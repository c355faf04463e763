//! Interrupt classification and the top-half to bottom-half hand-off.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::regs::IrqBits;

/// How the top half should treat one observed status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqClassification {
    /// Causes to service (status ∩ enabled ∩ known).
    pub handled: IrqBits,
    /// Enabled status bits this driver does not understand.
    pub spurious: u32,
    /// Bits to write back to the ack register.
    pub ack: u32,
    pub claim: bool,
}

/// Classify `status` against the enabled and known cause masks.
///
/// When nothing enabled and known is pending the raw status is still acknowledged so a
/// level-triggered line drops, but the interrupt is not claimed (the line may be shared).
pub fn classify(status: u32, enabled: u32, known: IrqBits) -> IrqClassification {
    let acted = status & enabled;
    let handled = IrqBits::from_bits_truncate(acted) & known;
    if handled.is_empty() {
        return IrqClassification {
            handled,
            spurious: 0,
            ack: status,
            claim: false,
        };
    }
    IrqClassification {
        handled,
        spurious: acted & !known.bits(),
        ack: acted,
        claim: true,
    }
}

/// Whether the `count`-th error occurrence should be reported: the first `burst` always are,
/// after that only power-of-two counts.
pub fn should_report_error(count: u64, burst: u64) -> bool {
    count <= burst || count.is_power_of_two()
}

/// Work handed from the top half to the bottom half.
///
/// Fence progress needs no event: the bottom half always re-reads the completed fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferredEvent {
    Faulted { fence: u64, error_code: u32 },
    Vblank { seq: u64 },
}

/// Bounded FIFO between the interrupt top half (producer) and bottom half (consumer).
///
/// Overflow drops the oldest event; the bottom half always re-reads fence state, so a lost event
/// only loses detail, never progress. The producer never blocks: if the consumer holds the queue,
/// the event is dropped and counted.
#[derive(Debug)]
pub struct DeferredQueue {
    inner: Mutex<VecDeque<DeferredEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    dpc_queued: AtomicBool,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            dpc_queued: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeferredEvent>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue `event` from the top half. Returns `false` if it had to be dropped because the
    /// bottom half held the queue.
    pub fn push(&self, event: DeferredEvent) -> bool {
        let mut q = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        while q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(event);
        true
    }

    pub fn drain(&self) -> Vec<DeferredEvent> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Mark the bottom half as requested. Returns `true` if it was not already pending, in which
    /// case the caller must actually schedule it.
    pub fn request_dpc(&self) -> bool {
        !self.dpc_queued.swap(true, Ordering::AcqRel)
    }

    /// Called at the top of the bottom half so later interrupts schedule it again.
    pub fn begin_dpc(&self) {
        self.dpc_queued.store(false, Ordering::Release);
    }
}

/// Latest vertical-blank timing published by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VblankAnchor {
    pub seq: u64,
    pub time_ns: u64,
    pub period_ns: u32,
}

/// Lock-free vblank bookkeeping for consumers that poll scanout position.
#[derive(Debug, Default)]
pub struct VblankState {
    seq: AtomicU64,
    time_ns: AtomicU64,
    period_ns: AtomicU32,
    waiters: AtomicUsize,
}

impl VblankState {
    pub fn record(&self, anchor: VblankAnchor) {
        self.time_ns.store(anchor.time_ns, Ordering::Relaxed);
        self.period_ns.store(anchor.period_ns, Ordering::Relaxed);
        // seq last: readers that see the new seq also see its timestamp.
        self.seq.store(anchor.seq, Ordering::Release);
    }

    pub fn anchor(&self) -> VblankAnchor {
        let seq = self.seq.load(Ordering::Acquire);
        VblankAnchor {
            seq,
            time_ns: self.time_ns.load(Ordering::Relaxed),
            period_ns: self.period_ns.load(Ordering::Relaxed),
        }
    }

    pub fn add_waiter(&self) -> usize {
        self.waiters.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn remove_waiter(&self) -> usize {
        let prev = self
            .waiters
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_only_status_is_acked_but_declined() {
        let c = classify(0x0000_0100, 0xFFFF_FFFF, IrqBits::all());
        assert!(!c.claim);
        assert_eq!(c.ack, 0x100);
        assert!(c.handled.is_empty());
    }

    #[test]
    fn disabled_cause_is_not_claimed() {
        let c = classify(IrqBits::FENCE.bits(), IrqBits::ERROR.bits(), IrqBits::all());
        assert!(!c.claim);
        assert_eq!(c.ack, IrqBits::FENCE.bits());
    }

    #[test]
    fn unknown_enabled_bits_alongside_known_are_spurious_and_acked() {
        let status = IrqBits::FENCE.bits() | 0x40;
        let c = classify(status, 0xFFFF_FFFF, IrqBits::all());
        assert!(c.claim);
        assert_eq!(c.handled, IrqBits::FENCE);
        assert_eq!(c.spurious, 0x40);
        assert_eq!(c.ack, status);
    }

    #[test]
    fn ack_covers_only_enabled_bits() {
        let status = (IrqBits::FENCE | IrqBits::SCANOUT_VBLANK).bits();
        let c = classify(status, IrqBits::FENCE.bits(), IrqBits::all());
        assert_eq!(c.handled, IrqBits::FENCE);
        assert_eq!(c.ack, IrqBits::FENCE.bits());
    }

    #[test]
    fn error_reporting_is_rate_limited() {
        let reported: Vec<u64> = (1..=40).filter(|&n| should_report_error(n, 3)).collect();
        assert_eq!(reported, vec![1, 2, 3, 4, 8, 16, 32]);
    }

    #[test]
    fn deferred_queue_drops_oldest_when_full() {
        let q = DeferredQueue::new(2);
        for seq in 1..=3 {
            q.push(DeferredEvent::Vblank { seq });
        }
        assert_eq!(q.dropped(), 1);
        assert_eq!(
            q.drain(),
            vec![
                DeferredEvent::Vblank { seq: 2 },
                DeferredEvent::Vblank { seq: 3 }
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn push_never_waits_for_the_consumer() {
        let q = DeferredQueue::new(4);
        let held = q.inner.lock().unwrap();
        assert!(!q.push(DeferredEvent::Vblank { seq: 1 }));
        drop(held);

        assert_eq!(q.dropped(), 1);
        assert!(q.push(DeferredEvent::Vblank { seq: 2 }));
        assert_eq!(q.drain(), vec![DeferredEvent::Vblank { seq: 2 }]);
    }

    #[test]
    fn dpc_request_is_coalesced_until_it_runs() {
        let q = DeferredQueue::new(4);
        assert!(q.request_dpc());
        assert!(!q.request_dpc());
        q.begin_dpc();
        assert!(q.request_dpc());
    }

    #[test]
    fn waiter_count_never_underflows() {
        let vblank = VblankState::default();
        assert_eq!(vblank.remove_waiter(), 0);
        assert_eq!(vblank.add_waiter(), 1);
        assert!(vblank.has_waiters());
        assert_eq!(vblank.remove_waiter(), 0);
        assert!(!vblank.has_waiters());
    }
}
