//! In-flight submission tracking.
//!
//! Every accepted push owns its device-visible buffers until the device is known to be done with
//! them. User submissions retire by fence; internal submissions retire by ring position. Retired
//! user submissions are kept for a while for post-mortem inspection.

use std::collections::VecDeque;

use tracing::debug;

use crate::host::SubmissionKind;
use crate::pool::{ContigBuffer, ContigPool};

#[derive(Debug)]
pub struct SubmissionRecord {
    pub fence: u64,
    pub kind: SubmissionKind,
    /// Ring tail after the push that carried this submission.
    pub ring_position: u32,
    /// Allocation ids referenced by the submission's allocation list.
    pub alloc_ids: Vec<u32>,
    /// Command stream copy, legacy descriptor and/or allocation table.
    pub buffers: Vec<ContigBuffer>,
}

impl SubmissionRecord {
    pub fn bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.capacity).sum()
    }

    fn references(&self, alloc_id: u32) -> bool {
        self.alloc_ids.contains(&alloc_id)
    }
}

/// Driver-originated control message, fence-ordered with user work but with no external owner.
#[derive(Debug)]
pub struct InternalRecord {
    pub fence: u64,
    pub ring_position: u32,
    pub buffers: Vec<ContigBuffer>,
}

/// Counts from one retirement or drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetireSummary {
    /// Records moved into the retired list.
    pub retained: usize,
    /// Records whose buffers went straight back to the pool.
    pub freed: usize,
    /// Older retired records evicted to make room.
    pub evicted: usize,
}

impl RetireSummary {
    pub fn total(&self) -> usize {
        self.retained + self.freed
    }
}

#[derive(Debug)]
pub struct PendingRegistry {
    pending: VecDeque<SubmissionRecord>,
    internal: VecDeque<InternalRecord>,
    retired: VecDeque<SubmissionRecord>,
    retired_bytes: usize,
    max_retired_count: usize,
    max_retired_bytes: usize,
}

fn release_all(pool: &ContigPool, buffers: Vec<ContigBuffer>) {
    for buf in buffers {
        pool.release(buf);
    }
}

impl PendingRegistry {
    pub fn new(max_retired_count: usize, max_retired_bytes: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            internal: VecDeque::new(),
            retired: VecDeque::new(),
            retired_bytes: 0,
            max_retired_count,
            max_retired_bytes,
        }
    }

    pub fn insert(&mut self, record: SubmissionRecord) {
        debug_assert!(self
            .pending
            .back()
            .map_or(true, |last| last.fence < record.fence));
        self.pending.push_back(record);
    }

    pub fn insert_internal(&mut self, record: InternalRecord) {
        self.internal.push_back(record);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn internal_len(&self) -> usize {
        self.internal.len()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn retired_bytes(&self) -> usize {
        self.retired_bytes
    }

    pub fn pending_fences(&self) -> Vec<u64> {
        self.pending.iter().map(|r| r.fence).collect()
    }

    pub fn retired_fences(&self) -> Vec<u64> {
        self.retired.iter().map(|r| r.fence).collect()
    }

    /// Oldest in-flight fence past `completed`, if any.
    pub fn next_pending_fence(&self, completed: u64) -> Option<u64> {
        self.pending
            .iter()
            .map(|r| r.fence)
            .find(|&fence| fence > completed)
    }

    /// Retire user submissions in FIFO order while their fence is `<= completed`.
    pub fn retire_up_to(&mut self, completed: u64, pool: &ContigPool) -> RetireSummary {
        let mut summary = RetireSummary::default();
        while self
            .pending
            .front()
            .is_some_and(|record| record.fence <= completed)
        {
            let Some(record) = self.pending.pop_front() else {
                break;
            };
            let bytes = record.bytes();
            if bytes > self.max_retired_bytes || self.max_retired_count == 0 {
                release_all(pool, record.buffers);
                summary.freed += 1;
                continue;
            }

            self.retired_bytes += bytes;
            self.retired.push_back(record);
            summary.retained += 1;

            while self.retired.len() > self.max_retired_count
                || self.retired_bytes > self.max_retired_bytes
            {
                let Some(oldest) = self.retired.pop_front() else {
                    break;
                };
                self.retired_bytes -= oldest.bytes();
                release_all(pool, oldest.buffers);
                summary.evicted += 1;
            }
        }
        if summary.total() != 0 {
            debug!(
                completed,
                retained = summary.retained,
                freed = summary.freed,
                evicted = summary.evicted,
                "retired submissions"
            );
        }
        summary
    }

    /// Retire internal submissions whose ring position the device head has reached.
    ///
    /// Positions are free-running `u32` counters, so the comparison is done on the signed
    /// distance to survive wraparound.
    pub fn retire_internal(&mut self, head: u32, pool: &ContigPool) -> usize {
        let mut retired = 0;
        while self
            .internal
            .front()
            .is_some_and(|record| head.wrapping_sub(record.ring_position) as i32 >= 0)
        {
            let Some(record) = self.internal.pop_front() else {
                break;
            };
            release_all(pool, record.buffers);
            retired += 1;
        }
        retired
    }

    /// Highest in-flight fence (`> completed`) whose submission references `alloc_id`.
    pub fn busy_fence(&self, alloc_id: u32, completed: u64) -> Option<u64> {
        self.pending
            .iter()
            .filter(|record| record.fence > completed && record.references(alloc_id))
            .map(|record| record.fence)
            .max()
    }

    /// Drop every record (pending, internal and retired) and release their buffers.
    pub fn drain_all(&mut self, pool: &ContigPool) -> usize {
        let mut drained = 0;
        for record in self.pending.drain(..).chain(self.retired.drain(..)) {
            release_all(pool, record.buffers);
            drained += 1;
        }
        for record in self.internal.drain(..) {
            release_all(pool, record.buffers);
            drained += 1;
        }
        self.retired_bytes = 0;
        drained
    }
}
