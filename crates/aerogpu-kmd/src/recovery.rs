//! Timeout recovery state machine.
//!
//! ```text
//! Stopped -> Running -> ResetRequested -> Quiesced -> Restarting -> Running
//!                                                              \-> Disabled
//! ```
//!
//! A reset may be requested from any started state, including `Quiesced` and `Disabled`, so the
//! host can retry a failed restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecoveryState {
    /// Not started, or stopped.
    Stopped,
    Running,
    ResetRequested,
    Quiesced,
    Restarting,
    /// Ring geometry could not be re-established; the gate stays closed.
    Disabled,
}

impl RecoveryState {
    pub fn can_transition_to(self, next: RecoveryState) -> bool {
        use RecoveryState::*;
        match (self, next) {
            (_, Stopped) => true,
            (Stopped, Running) => true,
            (Running | Quiesced | Disabled | ResetRequested, ResetRequested) => true,
            (ResetRequested, Quiesced) => true,
            (Quiesced, Restarting) => true,
            (Restarting, Running | Disabled) => true,
            // Power transitions may disable a running device whose ring vanished.
            (Running, Disabled) => true,
            _ => false,
        }
    }
}

/// Snapshot of recovery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub resets: u64,
    pub restarts_succeeded: u64,
    pub restarts_failed: u64,
}

#[derive(Debug)]
pub struct RecoveryMachine {
    state: Mutex<RecoveryState>,
    resets: AtomicU64,
    restarts_succeeded: AtomicU64,
    restarts_failed: AtomicU64,
}

impl Default for RecoveryMachine {
    fn default() -> Self {
        Self {
            state: Mutex::new(RecoveryState::Stopped),
            resets: AtomicU64::new(0),
            restarts_succeeded: AtomicU64::new(0),
            restarts_failed: AtomicU64::new(0),
        }
    }
}

impl RecoveryMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RecoveryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        *self.lock()
    }

    /// Move to `next` if the transition is legal. Returns the previous state on success.
    pub fn transition(&self, next: RecoveryState) -> Result<RecoveryState, RecoveryState> {
        let mut state = self.lock();
        let prev = *state;
        if !prev.can_transition_to(next) {
            return Err(prev);
        }
        *state = next;
        drop(state);

        match next {
            RecoveryState::ResetRequested => {
                self.resets.fetch_add(1, Ordering::Relaxed);
            }
            RecoveryState::Running if prev == RecoveryState::Restarting => {
                self.restarts_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            RecoveryState::Disabled if prev == RecoveryState::Restarting => {
                self.restarts_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if prev != next {
            info!(from = ?prev, to = ?next, "recovery state change");
        }
        Ok(prev)
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            resets: self.resets.load(Ordering::Relaxed),
            restarts_succeeded: self.restarts_succeeded.load(Ordering::Relaxed),
            restarts_failed: self.restarts_failed.load(Ordering::Relaxed),
        }
    }
}
