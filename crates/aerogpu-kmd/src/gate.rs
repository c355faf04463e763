use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::error::{KmdError, KmdResult};

/// Device power state as reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PowerState {
    D0 = 0,
    D1 = 1,
    D2 = 2,
    D3 = 3,
}

impl PowerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PowerState::D0,
            1 => PowerState::D1,
            2 => PowerState::D2,
            _ => PowerState::D3,
        }
    }
}

/// Decides whether new work may enter the ring.
///
/// Open only while powered (D0), accepting, and with the error latch clear. The latch dominates:
/// nothing but an explicit recovery pass reopens a latched gate.
#[derive(Debug)]
pub struct SubmissionGate {
    power: AtomicU8,
    accepting: AtomicBool,
    error_latched: AtomicBool,
}

impl Default for SubmissionGate {
    fn default() -> Self {
        Self {
            power: AtomicU8::new(PowerState::D0 as u8),
            accepting: AtomicBool::new(false),
            error_latched: AtomicBool::new(false),
        }
    }
}

impl SubmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self) -> KmdResult<()> {
        if self.error_latched.load(Ordering::Acquire) {
            return Err(KmdError::DeviceRemoved);
        }
        if self.power() != PowerState::D0 || !self.accepting.load(Ordering::Acquire) {
            return Err(KmdError::NotReady);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.check().is_ok()
    }

    pub fn open(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn power(&self) -> PowerState {
        PowerState::from_u8(self.power.load(Ordering::Acquire))
    }

    pub fn set_power(&self, state: PowerState) -> PowerState {
        PowerState::from_u8(self.power.swap(state as u8, Ordering::AcqRel))
    }

    /// Set the error latch. Returns `true` only for the call that actually set it.
    pub fn latch_error(&self) -> bool {
        !self.error_latched.swap(true, Ordering::AcqRel)
    }

    pub fn clear_error_latch(&self) {
        self.error_latched.store(false, Ordering::Release);
    }

    pub fn is_error_latched(&self) -> bool {
        self.error_latched.load(Ordering::Acquire)
    }
}
