use std::sync::atomic::{self, Ordering};

use tracing::debug;

use super::{FenceRequest, PushOutcome, RingPayload, RingSnapshot};
use crate::error::{KmdError, KmdResult, RingError};
use crate::fence::{FenceDomain, FenceEpoch};
use crate::pool::ContigBuffer;
use crate::protocol::{
    RingHeader, SubmitDesc, SubmitFlags, RING_HEAD_OFFSET, RING_HEADER_SIZE_BYTES,
    RING_TAIL_OFFSET, SUBMIT_DESC_SIZE_BYTES,
};
use crate::regs::{self, versioned, RegisterBlock, RingControl};
use crate::shared_mem::SharedMemory;

/// Power-of-two ring with an in-memory header. The device advances `head` in the header;
/// software owns `tail` and keeps a private copy of it to detect scribbles.
#[derive(Debug)]
pub struct VersionedRing {
    buffer: ContigBuffer,
    entry_count: u32,
    tail: u32,
    epoch: FenceEpoch,
}

impl VersionedRing {
    pub fn new(buffer: ContigBuffer, entry_count: u32, epoch: FenceEpoch) -> Self {
        debug_assert!(entry_count.is_power_of_two());
        debug_assert!(buffer.capacity as u64 >= RingHeader::required_size(entry_count));
        Self {
            buffer,
            entry_count,
            tail: 0,
            epoch,
        }
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn buffer(&self) -> ContigBuffer {
        self.buffer
    }

    pub fn epoch(&self) -> FenceEpoch {
        self.epoch
    }

    fn read_header(&self, mem: &dyn SharedMemory) -> RingHeader {
        let mut buf = [0u8; RingHeader::SIZE_BYTES];
        mem.read_physical(self.buffer.gpa, &mut buf);
        RingHeader::decode(&buf)
    }

    pub fn validate(&self, mem: &dyn SharedMemory) -> Result<RingSnapshot, RingError> {
        let hdr = self.read_header(mem);
        hdr.validate(self.entry_count, self.buffer.capacity as u64)?;
        if hdr.tail != self.tail {
            return Err(RingError::TailMismatch {
                found: hdr.tail,
                expected: self.tail,
            });
        }
        if self.tail.wrapping_sub(hdr.head) > self.entry_count {
            return Err(RingError::HeadOutOfRange {
                head: hdr.head,
                tail: self.tail,
                entry_count: self.entry_count,
            });
        }
        Ok(RingSnapshot {
            head: hdr.head,
            tail: self.tail,
        })
    }

    /// Check that the device registers still point at this ring.
    pub fn verify_programming(&self, regs: &dyn RegisterBlock) -> Result<(), RingError> {
        let base = u64::from(regs.read_u32(versioned::RING_GPA_LO))
            | (u64::from(regs.read_u32(versioned::RING_GPA_HI)) << 32);
        if base != self.buffer.gpa {
            return Err(RingError::BaseMismatch {
                found: base,
                expected: self.buffer.gpa,
            });
        }
        let size = regs.read_u32(versioned::RING_SIZE_BYTES);
        let min = RingHeader::required_size(self.entry_count);
        if u64::from(size) < min || u64::from(size) > self.buffer.capacity as u64 {
            return Err(RingError::BadSize {
                found: size,
                min,
                max: self.buffer.capacity as u64,
            });
        }
        Ok(())
    }

    pub fn push(
        &mut self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
        fences: &FenceDomain,
        fence: FenceRequest,
        payload: RingPayload,
    ) -> KmdResult<PushOutcome> {
        let RingPayload::Versioned {
            mut flags,
            context_id,
            engine_id,
            cmd,
            alloc_table,
        } = payload
        else {
            return Err(KmdError::Unsupported(
                "legacy payload on the versioned ring",
            ));
        };

        let (cmd_gpa, cmd_size_bytes) = cmd.unwrap_or((0, 0));
        if (cmd_gpa == 0) != (cmd_size_bytes == 0)
            || cmd_gpa.checked_add(u64::from(cmd_size_bytes)).is_none()
        {
            return Err(KmdError::InvalidParameter("bad command buffer range"));
        }
        let (alloc_table_gpa, alloc_table_size_bytes) = alloc_table.unwrap_or((0, 0));

        let snapshot = self.validate(mem)?;
        if snapshot.tail.wrapping_sub(snapshot.head) >= self.entry_count {
            return Err(KmdError::Backpressure);
        }

        // The epoch is only committed once the entry is published, so a rejected push can be
        // retried with the same host fence.
        let (signal_fence, next_epoch) = match fence {
            FenceRequest::Host(hw_fence) => {
                let mut epoch = self.epoch;
                let fence = epoch.extend(hw_fence);
                if fence <= fences.submitted() {
                    return Err(KmdError::InvalidParameter("fence does not advance"));
                }
                (fence, Some(epoch))
            }
            FenceRequest::Current => {
                flags |= SubmitFlags::NO_IRQ;
                (fences.submitted(), None)
            }
        };

        let desc = SubmitDesc {
            flags: flags.bits(),
            context_id,
            engine_id,
            cmd_gpa,
            cmd_size_bytes,
            alloc_table_gpa,
            alloc_table_size_bytes,
            signal_fence,
            ..SubmitDesc::default()
        };
        let slot = self.tail & (self.entry_count - 1);
        let slot_gpa = self.buffer.gpa
            + RING_HEADER_SIZE_BYTES
            + u64::from(slot) * u64::from(SUBMIT_DESC_SIZE_BYTES);
        mem.write_physical(slot_gpa, &desc.encode());

        // The descriptor must be visible before the device can observe the new tail.
        atomic::fence(Ordering::Release);
        let new_tail = self.tail.wrapping_add(1);
        mem.write_u32(self.buffer.gpa + RING_TAIL_OFFSET as u64, new_tail);
        self.tail = new_tail;

        if let Some(epoch) = next_epoch {
            self.epoch = epoch;
            fences.publish_submitted(signal_fence);
        }
        regs.write_u32(versioned::DOORBELL, 1);

        debug!(fence = signal_fence, slot, tail = new_tail, "pushed ring entry");
        Ok(PushOutcome {
            fence: signal_fence,
            ring_position: new_tail,
        })
    }

    fn write_empty_header(&mut self, mem: &dyn SharedMemory) {
        let hdr = RingHeader::new(self.entry_count);
        mem.write_physical(self.buffer.gpa, &hdr.encode());
        self.tail = 0;
    }

    pub fn program(&mut self, regs: &dyn RegisterBlock, mem: &dyn SharedMemory) {
        self.write_empty_header(mem);
        regs::write_u64_lo_hi(
            regs,
            versioned::RING_GPA_LO,
            versioned::RING_GPA_HI,
            self.buffer.gpa,
        );
        regs.write_u32(versioned::RING_SIZE_BYTES, self.buffer.capacity as u32);
        regs.write_u32(versioned::RING_CONTROL, RingControl::ENABLE.bits());
    }

    /// Reset the device's ring engine and empty the header. The header is only written if it
    /// still validates; otherwise it is left for a reprogram.
    pub fn reset_to_empty(
        &mut self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
    ) -> Result<(), RingError> {
        regs.write_u32(
            versioned::RING_CONTROL,
            (RingControl::RESET | RingControl::ENABLE).bits(),
        );
        self.validate(mem)?;
        mem.write_u32(self.buffer.gpa + RING_HEAD_OFFSET as u64, 0);
        mem.write_u32(self.buffer.gpa + RING_TAIL_OFFSET as u64, 0);
        self.tail = 0;
        Ok(())
    }

    pub fn disable(&self, regs: &dyn RegisterBlock) {
        regs.write_u32(versioned::RING_CONTROL, 0);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::protocol::RING_MAGIC_OFFSET;
    use crate::shared_mem::test_util::VecMemory;

    #[derive(Default)]
    struct RecordingRegs {
        writes: Mutex<Vec<(u32, u32)>>,
    }

    impl RegisterBlock for RecordingRegs {
        fn read_u32(&self, _offset: u32) -> u32 {
            0
        }

        fn write_u32(&self, offset: u32, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    const RING_GPA: u64 = 0x1000;

    fn ring(entry_count: u32) -> (VecMemory, RecordingRegs, VersionedRing) {
        let mem = VecMemory::new(0x10000);
        let regs = RecordingRegs::default();
        let capacity = RingHeader::required_size(entry_count) as usize;
        let mut ring = VersionedRing::new(
            ContigBuffer {
                gpa: RING_GPA,
                len: capacity,
                capacity,
            },
            entry_count,
            FenceEpoch::default(),
        );
        ring.program(&regs, &mem);
        (mem, regs, ring)
    }

    fn payload() -> RingPayload {
        RingPayload::Versioned {
            flags: SubmitFlags::empty(),
            context_id: 1,
            engine_id: 0,
            cmd: Some((0x8000, 16)),
            alloc_table: None,
        }
    }

    fn read_slot(mem: &VecMemory, slot: u64) -> SubmitDesc {
        let mut buf = [0u8; SubmitDesc::SIZE_BYTES];
        mem.read_physical(RING_GPA + 64 + slot * 64, &mut buf);
        SubmitDesc::decode(&buf)
    }

    #[test]
    fn push_writes_slot_then_tail_then_doorbell() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();

        let out = ring
            .push(&regs, &mem, &fences, FenceRequest::Host(10), payload())
            .unwrap();
        assert_eq!(out, PushOutcome { fence: 10, ring_position: 1 });
        assert_eq!(fences.submitted(), 10);
        assert_eq!(read_slot(&mem, 0).signal_fence, 10);
        assert_eq!(mem.read_u32(RING_GPA + RING_TAIL_OFFSET as u64), 1);
        assert_eq!(
            regs.writes.lock().unwrap().last(),
            Some(&(versioned::DOORBELL, 1))
        );
    }

    #[test]
    fn full_ring_applies_backpressure_without_consuming_the_fence() {
        let (mem, regs, mut ring) = ring(4);
        let fences = FenceDomain::new();
        for fence in 1..=4 {
            ring.push(&regs, &mem, &fences, FenceRequest::Host(fence), payload())
                .unwrap();
        }
        assert_eq!(
            ring.push(&regs, &mem, &fences, FenceRequest::Host(5), payload()),
            Err(KmdError::Backpressure)
        );
        assert_eq!(fences.submitted(), 4);

        // Device consumes one entry; the same fence can now be pushed.
        mem.write_u32(RING_GPA + RING_HEAD_OFFSET as u64, 1);
        let out = ring
            .push(&regs, &mem, &fences, FenceRequest::Host(5), payload())
            .unwrap();
        assert_eq!(out.fence, 5);
        assert_eq!(read_slot(&mem, 0).signal_fence, 5);
    }

    #[test]
    fn host_fence_wrap_extends_into_next_epoch() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();
        let a = ring
            .push(&regs, &mem, &fences, FenceRequest::Host(0xFFFF_FFF0), payload())
            .unwrap();
        let b = ring
            .push(&regs, &mem, &fences, FenceRequest::Host(0x5), payload())
            .unwrap();
        assert_eq!(a.fence, 0x0000_0000_FFFF_FFF0);
        assert_eq!(b.fence, 0x0000_0001_0000_0005);
        assert_eq!(ring.epoch().epoch(), 1);
        assert_eq!(read_slot(&mem, 1).signal_fence, 0x1_0000_0005);
    }

    #[test]
    fn current_fence_request_sets_no_irq_and_keeps_submitted() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();
        ring.push(&regs, &mem, &fences, FenceRequest::Host(3), payload())
            .unwrap();
        let out = ring
            .push(&regs, &mem, &fences, FenceRequest::Current, payload())
            .unwrap();
        assert_eq!(out.fence, 3);
        assert_eq!(out.ring_position, 2);
        let desc = read_slot(&mem, 1);
        assert_eq!(desc.flags & SubmitFlags::NO_IRQ.bits(), SubmitFlags::NO_IRQ.bits());
    }

    #[test]
    fn scribbled_tail_is_an_invariant_violation() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();
        mem.write_u32(RING_GPA + RING_TAIL_OFFSET as u64, 5);
        assert_eq!(
            ring.push(&regs, &mem, &fences, FenceRequest::Host(1), payload()),
            Err(KmdError::InvariantViolation(RingError::TailMismatch {
                found: 5,
                expected: 0
            }))
        );
    }

    #[test]
    fn non_advancing_host_fence_is_rejected() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();
        ring.push(&regs, &mem, &fences, FenceRequest::Host(7), payload())
            .unwrap();
        assert!(matches!(
            ring.push(&regs, &mem, &fences, FenceRequest::Host(7), payload()),
            Err(KmdError::InvalidParameter(_))
        ));
        assert_eq!(ring.validate(&mem).unwrap().tail, 1);
    }

    #[test]
    fn reset_to_empty_rewinds_head_and_tail() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();
        for fence in 1..=3 {
            ring.push(&regs, &mem, &fences, FenceRequest::Host(fence), payload())
                .unwrap();
        }
        mem.write_u32(RING_GPA + RING_HEAD_OFFSET as u64, 1);
        ring.reset_to_empty(&regs, &mem).unwrap();
        assert_eq!(ring.validate(&mem), Ok(RingSnapshot { head: 0, tail: 0 }));
    }

    #[test]
    fn reset_leaves_a_corrupted_header_alone() {
        let (mem, regs, mut ring) = ring(8);
        let fences = FenceDomain::new();
        ring.push(&regs, &mem, &fences, FenceRequest::Host(1), payload())
            .unwrap();
        mem.write_u32(RING_GPA + RING_MAGIC_OFFSET as u64, 0xBAD0_BAD0);
        mem.write_u32(RING_GPA + RING_HEAD_OFFSET as u64, 0x1234);

        assert!(ring.reset_to_empty(&regs, &mem).is_err());
        assert_eq!(mem.read_u32(RING_GPA + RING_HEAD_OFFSET as u64), 0x1234);
        assert_eq!(mem.read_u32(RING_GPA + RING_TAIL_OFFSET as u64), 1);
        // The engine reset itself is a register write and still happens.
        assert_eq!(
            regs.writes.lock().unwrap().last(),
            Some(&(
                versioned::RING_CONTROL,
                (RingControl::RESET | RingControl::ENABLE).bits()
            ))
        );
    }
}
