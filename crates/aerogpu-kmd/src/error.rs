use thiserror::Error;

/// Ring geometry or ABI mismatch observed while touching shared ring memory.
///
/// Every variant is treated as fatal for the current ring mapping: the caller must close the
/// submission gate rather than keep writing descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring is not mapped")]
    NotMapped,
    #[error("unknown MMIO magic 0x{found:08x}")]
    UnknownDevice { found: u32 },
    #[error("bad ring magic 0x{found:08x}")]
    BadMagic { found: u32 },
    #[error("unsupported ABI major version {found}")]
    UnsupportedMajor { found: u32 },
    #[error("ring entry_count {found} does not match configured {expected}")]
    BadEntryCount { found: u32, expected: u32 },
    #[error("ring entry_stride_bytes {found} does not match descriptor size {expected}")]
    BadStride { found: u32, expected: u32 },
    #[error("ring size_bytes {found} outside [{min}, {max}]")]
    BadSize { found: u32, min: u64, max: u64 },
    #[error("ring tail {found} does not match software tail {expected}")]
    TailMismatch { found: u32, expected: u32 },
    #[error("ring head {head} is not within {entry_count} entries of tail {tail}")]
    HeadOutOfRange {
        head: u32,
        tail: u32,
        entry_count: u32,
    },
    #[error("ring base 0x{found:016x} does not match programmed 0x{expected:016x}")]
    BaseMismatch { found: u64, expected: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KmdError {
    /// Ring full; the caller decides whether to retry or drop.
    #[error("ring is full")]
    Backpressure,
    /// Submission gate closed (powered down, stopped, or recovering).
    #[error("device is not accepting submissions")]
    NotReady,
    /// Error latch set; fatal until a recovery pass clears it.
    #[error("device reported a fatal error")]
    DeviceRemoved,
    #[error("out of contiguous memory")]
    ResourceExhausted,
    #[error("ring invariant violated: {0}")]
    InvariantViolation(#[from] RingError),
    #[error("resource is referenced by in-flight fence {fence}")]
    Busy { fence: u64 },
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

pub type KmdResult<T> = Result<T, KmdError>;

impl KmdError {
    /// Transient failures the caller is expected to retry after the device makes progress.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KmdError::Backpressure | KmdError::NotReady | KmdError::Busy { .. }
        )
    }
}
