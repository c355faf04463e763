//! Fence bookkeeping: the submitted/completed pair and 32-to-64-bit epoch extension.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::FencePage;
use crate::regs::{self, RegisterBlock};
use crate::shared_mem::SharedMemory;

/// Extends a 32-bit hardware fence into a 64-bit value by counting wraps.
///
/// Only a single wrap between consecutive observations can be detected. Callers must serialize
/// `extend` with the ring push that publishes the result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FenceEpoch {
    epoch: u32,
    last_hw: u32,
}

impl FenceEpoch {
    /// Continue extension after an already-published 64-bit fence, e.g. when the ring is
    /// recreated while the device lifetime's fences keep counting.
    pub fn resume_from(fence: u64) -> Self {
        Self {
            epoch: (fence >> 32) as u32,
            last_hw: fence as u32,
        }
    }

    pub fn extend(&mut self, hw_fence: u32) -> u64 {
        if hw_fence < self.last_hw {
            self.epoch = self.epoch.wrapping_add(1);
        }
        self.last_hw = hw_fence;
        (u64::from(self.epoch) << 32) | u64::from(hw_fence)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }
}

/// Device-lifetime fence counters.
///
/// Both values only move forward and `completed <= submitted` always holds. They are atomics so
/// the interrupt path can read them without the ring lock and never observe a torn value.
#[derive(Debug, Default)]
pub struct FenceDomain {
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl FenceDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Record a newly pushed fence. Called with the ring lock held.
    pub fn publish_submitted(&self, fence: u64) {
        self.submitted.fetch_max(fence, Ordering::AcqRel);
    }

    /// Clamp a device-reported value into `[completed, submitted]`.
    ///
    /// A device that regresses its counter (e.g. across a reset) or reports a fence that was
    /// never submitted is not trusted past the known range.
    pub fn clamp(&self, observed: u64) -> u64 {
        let completed = self.completed();
        let submitted = self.submitted();
        observed.min(submitted).max(completed)
    }

    /// Advance the completed fence to `observed` (clamped) and return the new value.
    pub fn advance_completed(&self, observed: u64) -> u64 {
        let clamped = self.clamp(observed);
        let prev = self.completed.fetch_max(clamped, Ordering::AcqRel);
        prev.max(clamped)
    }

    /// Widen a 32-bit completed value to the newest fence at or below `submitted` that has the
    /// same low word.
    pub fn widen_completed(&self, hw_completed: u32) -> u64 {
        let submitted = self.submitted();
        let behind = (submitted as u32).wrapping_sub(hw_completed);
        submitted.saturating_sub(u64::from(behind))
    }

    /// Treat everything submitted so far as completed. Used by timeout recovery.
    pub fn complete_all(&self) -> u64 {
        let submitted = self.submitted();
        let prev = self.completed.fetch_max(submitted, Ordering::AcqRel);
        prev.max(submitted)
    }
}

/// Where the device publishes its completed fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletedFenceSource {
    /// 32-bit `FENCE_COMPLETED` register (legacy ABI).
    LegacyRegister,
    /// Shared fence page, falling back to the 64-bit register pair if the page looks invalid.
    FencePage { gpa: u64 },
    /// `COMPLETED_FENCE_LO/HI` register pair.
    Registers,
}

impl CompletedFenceSource {
    /// Raw (unclamped) completed fence, or `None` if every register read was torn.
    ///
    /// The legacy register only holds the low word; it is widened against `fences`.
    pub fn read(
        &self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
        fences: &FenceDomain,
        attempts: u32,
    ) -> Option<u64> {
        match *self {
            CompletedFenceSource::LegacyRegister => {
                Some(fences.widen_completed(regs.read_u32(regs::legacy::FENCE_COMPLETED)))
            }
            CompletedFenceSource::FencePage { gpa } => {
                let mut buf = [0u8; FencePage::SIZE_BYTES];
                mem.read_physical(gpa, &mut buf);
                let page = FencePage::decode(&buf);
                if page.is_valid() {
                    Some(page.completed_fence)
                } else {
                    read_completed_registers(regs, attempts)
                }
            }
            CompletedFenceSource::Registers => read_completed_registers(regs, attempts),
        }
    }
}

fn read_completed_registers(regs: &dyn RegisterBlock, attempts: u32) -> Option<u64> {
    regs::read_u64_hi_lo_hi(
        regs,
        regs::versioned::COMPLETED_FENCE_LO,
        regs::versioned::COMPLETED_FENCE_HI,
        attempts,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn epoch_extends_across_a_single_wrap() {
        let mut epoch = FenceEpoch::default();
        assert_eq!(epoch.extend(0xFFFF_FFF0), 0x0000_0000_FFFF_FFF0);
        assert_eq!(epoch.epoch(), 0);
        assert_eq!(epoch.extend(0x0000_0005), 0x0000_0001_0000_0005);
        assert_eq!(epoch.epoch(), 1);
        assert_eq!(epoch.extend(0x0000_0006), 0x0000_0001_0000_0006);
    }

    #[test]
    fn resumed_epoch_continues_past_published_fence() {
        let mut epoch = FenceEpoch::resume_from(0x1_0000_0010);
        assert_eq!(epoch.extend(0x11), 0x1_0000_0011);
        assert_eq!(epoch.extend(0x2), 0x2_0000_0002);
    }

    #[test]
    fn clamp_keeps_completed_within_range() {
        let fences = FenceDomain::new();
        fences.publish_submitted(10);
        assert_eq!(fences.advance_completed(4), 4);
        // Regression is ignored.
        assert_eq!(fences.advance_completed(2), 4);
        // Never beyond what was submitted.
        assert_eq!(fences.advance_completed(99), 10);
        assert_eq!(fences.completed(), 10);
    }

    #[test]
    fn complete_all_catches_up_to_submitted() {
        let fences = FenceDomain::new();
        fences.publish_submitted(7);
        fences.advance_completed(3);
        assert_eq!(fences.complete_all(), 7);
        assert_eq!(fences.completed(), fences.submitted());
    }

    #[test]
    fn widened_completed_follows_submitted_across_a_wrap() {
        let fences = FenceDomain::new();
        fences.publish_submitted(0x1_0000_0002);
        assert_eq!(fences.widen_completed(1), 0x1_0000_0001);
        assert_eq!(fences.widen_completed(0xFFFF_FFFF), 0xFFFF_FFFF);
        assert_eq!(fences.widen_completed(2), 0x1_0000_0002);

        let fresh = FenceDomain::new();
        fresh.publish_submitted(3);
        // A value from before anything was submitted cannot go below zero.
        assert_eq!(fresh.widen_completed(9), 0);
    }

    #[test]
    fn submitted_never_moves_backwards() {
        let fences = FenceDomain::new();
        fences.publish_submitted(9);
        fences.publish_submitted(3);
        assert_eq!(fences.submitted(), 9);
    }

    proptest! {
        #[test]
        fn extension_is_strictly_increasing_with_at_most_one_wrap(
            start in any::<u32>(),
            steps in proptest::collection::vec(1u32..=u32::MAX, 1..64),
        ) {
            let mut epoch = FenceEpoch::default();
            let mut hw = start;
            let mut prev = epoch.extend(hw);
            for step in steps {
                // Each step advances by less than one full wrap.
                hw = hw.wrapping_add(step);
                let next = epoch.extend(hw);
                prop_assert!(next > prev, "{next:#x} <= {prev:#x}");
                prop_assert_eq!(next as u32, hw);
                prev = next;
            }
        }
    }
}
