//! Command-submission core of the AeroGPU kernel-mode driver.
//!
//! The crate owns everything between the host graphics framework and the virtual device's
//! submission ring: fence bookkeeping, ring transport for both device ABIs, the pending-submission
//! registry, interrupt top/bottom halves, timeout recovery and power gating. Hardware access goes
//! through the [`RegisterBlock`], [`SharedMemory`] and [`ContiguousAllocator`] seams so the core
//! can run against an emulated device in tests.
//!
//! The entry point is [`DeviceCore`].

#![forbid(unsafe_code)]

pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod gate;
pub mod host;
pub mod irq;
pub mod pool;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod regs;
pub mod ring;
pub mod shared_mem;
pub mod stats;
pub mod submission_log;

pub use config::{KmdConfig, PoolConfig};
pub use device::{
    DeviceCore, DeviceInfo, FaultInfo, Platform, ResetSummary, SubmitReceipt, WaitMode,
};
pub use error::{KmdError, KmdResult, RingError};
pub use gate::PowerState;
pub use host::{
    AllocationListClassifier, AllocationRef, CmdStreamClassifier, HostCallbacks,
    HostNotification, SubmissionKind, SubmitArgs,
};
pub use irq::VblankAnchor;
pub use pool::PoolStats;
pub use protocol::SubmitFlags;
pub use recovery::{RecoveryState, RecoveryStats};
pub use regs::{AbiKind, FeatureBits, IrqBits, RegisterBlock};
pub use shared_mem::{ContiguousAllocator, SharedMemory};
pub use stats::KmdStatsSnapshot;
pub use submission_log::SubmissionLogEntry;
