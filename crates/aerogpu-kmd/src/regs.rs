//! BAR0 register map for both device ABIs.

use bitflags::bitflags;

/// 32-bit MMIO access to the device's register BAR.
pub trait RegisterBlock: Send + Sync {
    fn read_u32(&self, offset: u32) -> u32;
    fn write_u32(&self, offset: u32, value: u32);
}

/// Which ring/register ABI the device speaks. Chosen once from the MMIO magic at start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AbiKind {
    Legacy,
    Versioned,
}

impl AbiKind {
    pub fn detect(mmio_magic: u32) -> Option<Self> {
        match mmio_magic {
            legacy::MMIO_MAGIC => Some(AbiKind::Legacy),
            versioned::MMIO_MAGIC => Some(AbiKind::Versioned),
            _ => None,
        }
    }

    pub fn irq_status_offset(self) -> u32 {
        match self {
            AbiKind::Legacy => legacy::INT_STATUS,
            AbiKind::Versioned => versioned::IRQ_STATUS,
        }
    }

    pub fn irq_ack_offset(self) -> u32 {
        match self {
            AbiKind::Legacy => legacy::INT_ACK,
            AbiKind::Versioned => versioned::IRQ_ACK,
        }
    }

    /// Interrupt causes this driver knows how to service on this ABI.
    pub fn known_irq_bits(self) -> IrqBits {
        match self {
            AbiKind::Legacy => IrqBits::FENCE,
            AbiKind::Versioned => IrqBits::all(),
        }
    }
}

/// Versioned ("AGPU") device registers.
pub mod versioned {
    pub const MMIO_MAGIC: u32 = 0x5550_4741;

    pub const ABI_MAJOR: u32 = 1;
    pub const ABI_MINOR: u32 = 4;
    pub const ABI_VERSION_U32: u32 = (ABI_MAJOR << 16) | ABI_MINOR;

    pub const MAGIC: u32 = 0x0000;
    pub const ABI_VERSION: u32 = 0x0004;
    pub const FEATURES_LO: u32 = 0x0008;
    pub const FEATURES_HI: u32 = 0x000C;

    pub const RING_GPA_LO: u32 = 0x0100;
    pub const RING_GPA_HI: u32 = 0x0104;
    pub const RING_SIZE_BYTES: u32 = 0x0108;
    pub const RING_CONTROL: u32 = 0x010C;

    pub const FENCE_GPA_LO: u32 = 0x0120;
    pub const FENCE_GPA_HI: u32 = 0x0124;

    pub const COMPLETED_FENCE_LO: u32 = 0x0130;
    pub const COMPLETED_FENCE_HI: u32 = 0x0134;

    pub const DOORBELL: u32 = 0x0200;

    pub const IRQ_STATUS: u32 = 0x0300;
    pub const IRQ_ENABLE: u32 = 0x0304;
    pub const IRQ_ACK: u32 = 0x0308;

    pub const ERROR_CODE: u32 = 0x0310;
    pub const ERROR_FENCE_LO: u32 = 0x0314;
    pub const ERROR_FENCE_HI: u32 = 0x0318;
    pub const ERROR_COUNT: u32 = 0x031C;

    pub const SCANOUT0_VBLANK_SEQ_LO: u32 = 0x0420;
    pub const SCANOUT0_VBLANK_SEQ_HI: u32 = 0x0424;
    pub const SCANOUT0_VBLANK_TIME_NS_LO: u32 = 0x0428;
    pub const SCANOUT0_VBLANK_TIME_NS_HI: u32 = 0x042C;
    pub const SCANOUT0_VBLANK_PERIOD_NS: u32 = 0x0430;

    pub const fn abi_major(version: u32) -> u32 {
        version >> 16
    }
}

/// Legacy ("ARGP") device registers.
pub mod legacy {
    pub const MMIO_MAGIC: u32 = 0x4152_4750;
    pub const MMIO_VERSION: u32 = 0x0001_0000;

    pub const MAGIC: u32 = 0x0000;
    pub const VERSION: u32 = 0x0004;
    pub const FEATURES_LO: u32 = 0x0008;
    pub const FEATURES_HI: u32 = 0x000C;

    pub const RING_BASE_LO: u32 = 0x0010;
    pub const RING_BASE_HI: u32 = 0x0014;
    pub const RING_ENTRY_COUNT: u32 = 0x0018;
    pub const RING_HEAD: u32 = 0x001C;
    pub const RING_TAIL: u32 = 0x0020;
    pub const RING_DOORBELL: u32 = 0x0024;

    pub const INT_STATUS: u32 = 0x0030;
    pub const INT_ACK: u32 = 0x0034;
    pub const FENCE_COMPLETED: u32 = 0x0038;
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IrqBits: u32 {
        const FENCE = 1 << 0;
        const SCANOUT_VBLANK = 1 << 1;
        const ERROR = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct FeatureBits: u64 {
        const FENCE_PAGE = 1 << 0;
        const CURSOR = 1 << 1;
        const SCANOUT = 1 << 2;
        const VBLANK = 1 << 3;
        const TRANSFER = 1 << 4;
        const ERROR_INFO = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RingControl: u32 {
        const ENABLE = 1 << 0;
        const RESET = 1 << 1;
    }
}

pub fn read_features(regs: &dyn RegisterBlock, lo: u32, hi: u32) -> FeatureBits {
    let value = u64::from(regs.read_u32(lo)) | (u64::from(regs.read_u32(hi)) << 32);
    FeatureBits::from_bits_truncate(value)
}

pub fn write_u64_lo_hi(regs: &dyn RegisterBlock, lo: u32, hi: u32, value: u64) {
    regs.write_u32(lo, value as u32);
    regs.write_u32(hi, (value >> 32) as u32);
}

/// Read a 64-bit counter exposed as two 32-bit registers.
///
/// The high half is sampled before and after the low half; if it moved, the low half may belong
/// to a different value, so the read is retried. Returns `None` if every attempt was torn.
pub fn read_u64_hi_lo_hi(regs: &dyn RegisterBlock, lo: u32, hi: u32, attempts: u32) -> Option<u64> {
    for _ in 0..attempts {
        let hi_before = regs.read_u32(hi);
        let lo_value = regs.read_u32(lo);
        let hi_after = regs.read_u32(hi);
        if hi_before == hi_after {
            return Some((u64::from(hi_after) << 32) | u64::from(lo_value));
        }
    }
    None
}
