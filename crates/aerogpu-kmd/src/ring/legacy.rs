use std::sync::atomic::{self, Ordering};

use tracing::debug;

use super::{FenceRequest, PushOutcome, RingPayload, RingSnapshot};
use crate::error::{KmdError, KmdResult, RingError};
use crate::fence::{FenceDomain, FenceEpoch};
use crate::pool::ContigBuffer;
use crate::protocol::{LegacyRingEntry, LEGACY_RING_ENTRY_SIZE_BYTES, LEGACY_RING_ENTRY_SUBMIT};
use crate::regs::{legacy, RegisterBlock};
use crate::shared_mem::SharedMemory;

/// Fixed array of slots addressed by masked indices. The device exposes `head` through a
/// read-only register; software owns `tail`. One slot stays unused so that full and empty can be
/// told apart.
///
/// Entries carry the host's 32-bit fence unchanged; tracking uses the epoch-extended value so a
/// wrapped host fence still advances.
#[derive(Debug)]
pub struct LegacyRing {
    buffer: ContigBuffer,
    entry_count: u32,
    tail: u32,
    epoch: FenceEpoch,
}

impl LegacyRing {
    pub fn new(buffer: ContigBuffer, entry_count: u32, epoch: FenceEpoch) -> Self {
        debug_assert!(
            buffer.capacity as u64
                >= u64::from(entry_count) * u64::from(LEGACY_RING_ENTRY_SIZE_BYTES)
        );
        Self {
            buffer,
            entry_count,
            tail: 0,
            epoch,
        }
    }

    pub fn required_size(entry_count: u32) -> u64 {
        u64::from(entry_count) * u64::from(LEGACY_RING_ENTRY_SIZE_BYTES)
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn buffer(&self) -> ContigBuffer {
        self.buffer
    }

    pub fn validate(&self, regs: &dyn RegisterBlock) -> Result<RingSnapshot, RingError> {
        let base = u64::from(regs.read_u32(legacy::RING_BASE_LO))
            | (u64::from(regs.read_u32(legacy::RING_BASE_HI)) << 32);
        if base != self.buffer.gpa {
            return Err(RingError::BaseMismatch {
                found: base,
                expected: self.buffer.gpa,
            });
        }
        let count = regs.read_u32(legacy::RING_ENTRY_COUNT);
        if count != self.entry_count {
            return Err(RingError::BadEntryCount {
                found: count,
                expected: self.entry_count,
            });
        }
        let tail = regs.read_u32(legacy::RING_TAIL);
        if tail != self.tail {
            return Err(RingError::TailMismatch {
                found: tail,
                expected: self.tail,
            });
        }
        let head = regs.read_u32(legacy::RING_HEAD);
        if head >= self.entry_count {
            return Err(RingError::HeadOutOfRange {
                head,
                tail,
                entry_count: self.entry_count,
            });
        }
        Ok(RingSnapshot { head, tail })
    }

    pub fn push(
        &mut self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
        fences: &FenceDomain,
        fence: FenceRequest,
        payload: RingPayload,
    ) -> KmdResult<PushOutcome> {
        let RingPayload::Legacy {
            kind,
            desc_gpa,
            desc_size,
        } = payload
        else {
            return Err(KmdError::Unsupported("versioned payload on the legacy ring"));
        };
        let FenceRequest::Host(hw_fence) = fence else {
            return Err(KmdError::Unsupported(
                "internal submissions on the legacy ring",
            ));
        };

        let snapshot = self.validate(regs)?;
        let next_tail = (snapshot.tail + 1) % self.entry_count;
        if next_tail == snapshot.head {
            return Err(KmdError::Backpressure);
        }

        let mut epoch = self.epoch;
        let fence = epoch.extend(hw_fence);
        if fence <= fences.submitted() {
            return Err(KmdError::InvalidParameter("fence does not advance"));
        }

        let entry = LegacyRingEntry {
            entry_type: LEGACY_RING_ENTRY_SUBMIT,
            flags: 0,
            fence: hw_fence,
            desc_size,
            desc_gpa,
        };
        let slot_gpa =
            self.buffer.gpa + u64::from(self.tail) * u64::from(LEGACY_RING_ENTRY_SIZE_BYTES);
        mem.write_physical(slot_gpa, &entry.encode());

        atomic::fence(Ordering::Release);
        self.tail = next_tail;
        regs.write_u32(legacy::RING_TAIL, next_tail);
        self.epoch = epoch;
        fences.publish_submitted(fence);
        regs.write_u32(legacy::RING_DOORBELL, 1);

        debug!(fence, ?kind, tail = next_tail, "pushed legacy ring entry");
        Ok(PushOutcome {
            fence,
            ring_position: next_tail,
        })
    }

    pub fn program(&mut self, regs: &dyn RegisterBlock) {
        regs.write_u32(legacy::RING_BASE_LO, self.buffer.gpa as u32);
        regs.write_u32(legacy::RING_BASE_HI, (self.buffer.gpa >> 32) as u32);
        regs.write_u32(legacy::RING_ENTRY_COUNT, self.entry_count);
        self.reset_to_empty(regs);
    }

    pub fn reset_to_empty(&mut self, regs: &dyn RegisterBlock) {
        regs.write_u32(legacy::RING_HEAD, 0);
        regs.write_u32(legacy::RING_TAIL, 0);
        self.tail = 0;
    }

    pub fn disable(&self, regs: &dyn RegisterBlock) {
        regs.write_u32(legacy::RING_ENTRY_COUNT, 0);
        regs.write_u32(legacy::RING_BASE_LO, 0);
        regs.write_u32(legacy::RING_BASE_HI, 0);
    }
}
