use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::host::SubmissionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmissionLogEntry {
    pub fence: u64,
    pub kind: SubmissionKind,
    pub cmd_bytes: usize,
    /// Time since the device was attached.
    pub at: Duration,
}

/// Ring of the most recent pushes, for post-mortem inspection after a timeout.
#[derive(Debug)]
pub struct SubmissionLog {
    entries: Mutex<VecDeque<SubmissionLogEntry>>,
    capacity: usize,
    epoch: Instant,
}

impl SubmissionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SubmissionLogEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, fence: u64, kind: SubmissionKind, cmd_bytes: usize) {
        if self.capacity == 0 {
            return;
        }
        let entry = SubmissionLogEntry {
            fence,
            kind,
            cmd_bytes,
            at: self.epoch.elapsed(),
        };
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<SubmissionLogEntry> {
        self.lock().iter().copied().collect()
    }
}
