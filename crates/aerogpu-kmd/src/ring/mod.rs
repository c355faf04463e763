//! Ring transport: the shared-memory queue of submission descriptors consumed by the device.
//!
//! Two wire encodings exist. The variant is picked once at device start from the MMIO magic and
//! every push/validate/reset call dispatches through [`RingTransport`].
//!
//! Every method must be called with the device's ring lock held.

mod legacy;
mod versioned;

pub use legacy::LegacyRing;
pub use versioned::VersionedRing;

use crate::error::{KmdResult, RingError};
use crate::fence::FenceDomain;
use crate::host::SubmissionKind;
use crate::pool::ContigBuffer;
use crate::protocol::SubmitFlags;
use crate::regs::{AbiKind, RegisterBlock};
use crate::shared_mem::SharedMemory;

/// What a push should signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceRequest {
    /// Host-assigned 32-bit fence; must advance past everything already submitted.
    Host(u32),
    /// Re-signal the current submitted fence (driver-internal messages).
    Current,
}

/// Payload for one ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingPayload {
    Versioned {
        flags: SubmitFlags,
        context_id: u32,
        engine_id: u32,
        /// Command stream `(gpa, len)`; `None` for an empty submission.
        cmd: Option<(u64, u32)>,
        alloc_table: Option<(u64, u32)>,
    },
    Legacy {
        kind: SubmissionKind,
        desc_gpa: u64,
        desc_size: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushOutcome {
    pub fence: u64,
    /// Ring tail after this push; the device has consumed the entry once its head reaches it.
    pub ring_position: u32,
}

/// Head/tail as observed by a successful validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingSnapshot {
    pub head: u32,
    pub tail: u32,
}

#[derive(Debug)]
pub enum RingTransport {
    Legacy(LegacyRing),
    Versioned(VersionedRing),
}

impl RingTransport {
    pub fn abi(&self) -> AbiKind {
        match self {
            RingTransport::Legacy(_) => AbiKind::Legacy,
            RingTransport::Versioned(_) => AbiKind::Versioned,
        }
    }

    pub fn entry_count(&self) -> u32 {
        match self {
            RingTransport::Legacy(ring) => ring.entry_count(),
            RingTransport::Versioned(ring) => ring.entry_count(),
        }
    }

    pub fn buffer(&self) -> ContigBuffer {
        match self {
            RingTransport::Legacy(ring) => ring.buffer(),
            RingTransport::Versioned(ring) => ring.buffer(),
        }
    }

    /// Re-check ring geometry and return the current head/tail.
    pub fn validate(
        &self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
    ) -> Result<RingSnapshot, RingError> {
        match self {
            RingTransport::Legacy(ring) => ring.validate(regs),
            RingTransport::Versioned(ring) => ring.validate(mem),
        }
    }

    /// Check that the device registers still describe this ring.
    pub fn verify_programming(&self, regs: &dyn RegisterBlock) -> Result<(), RingError> {
        match self {
            RingTransport::Legacy(ring) => ring.validate(regs).map(|_| ()),
            RingTransport::Versioned(ring) => ring.verify_programming(regs),
        }
    }

    pub fn push(
        &mut self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
        fences: &FenceDomain,
        fence: FenceRequest,
        payload: RingPayload,
    ) -> KmdResult<PushOutcome> {
        match self {
            RingTransport::Legacy(ring) => ring.push(regs, mem, fences, fence, payload),
            RingTransport::Versioned(ring) => ring.push(regs, mem, fences, fence, payload),
        }
    }

    /// Write ring geometry into the device registers (and the header for the versioned ring).
    pub fn program(&mut self, regs: &dyn RegisterBlock, mem: &dyn SharedMemory) {
        match self {
            RingTransport::Legacy(ring) => ring.program(regs),
            RingTransport::Versioned(ring) => ring.program(regs, mem),
        }
    }

    /// Force head and tail to an empty, consistent state. Fails without touching shared memory
    /// if the ring no longer validates.
    pub fn reset_to_empty(
        &mut self,
        regs: &dyn RegisterBlock,
        mem: &dyn SharedMemory,
    ) -> Result<(), RingError> {
        match self {
            RingTransport::Legacy(ring) => {
                ring.reset_to_empty(regs);
                Ok(())
            }
            RingTransport::Versioned(ring) => ring.reset_to_empty(regs, mem),
        }
    }

    /// Stop the device from fetching further entries.
    pub fn disable(&self, regs: &dyn RegisterBlock) {
        match self {
            RingTransport::Legacy(ring) => ring.disable(regs),
            RingTransport::Versioned(ring) => ring.disable(regs),
        }
    }
}
