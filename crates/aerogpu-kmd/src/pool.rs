//! Size-classed cache over the backing contiguous allocator.
//!
//! Submission copies every command stream (and allocation table) into device-visible memory; the
//! pool keeps recently released buffers around so the hot path avoids the backing allocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{KmdError, KmdResult};
use crate::shared_mem::{ContiguousAllocator, SharedMemory};

/// A physically-contiguous buffer handed out by [`ContigPool`].
///
/// `capacity` is the page-rounded size actually allocated; `len` is what the caller asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContigBuffer {
    pub gpa: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Snapshot of pool counters, suitable for telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub bytes_saved: u64,
    pub retained_bytes: u64,
    pub retained_buffers: u64,
}

#[derive(Default)]
struct PoolInner {
    /// `classes[n - 1]` holds free buffers of exactly `n` pages.
    classes: Vec<Vec<u64>>,
    retained_bytes: usize,
}

pub struct ContigPool {
    allocator: Arc<dyn ContiguousAllocator>,
    mem: Arc<dyn SharedMemory>,
    cfg: PoolConfig,
    inner: Mutex<PoolInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
}

impl ContigPool {
    pub fn new(
        cfg: PoolConfig,
        allocator: Arc<dyn ContiguousAllocator>,
        mem: Arc<dyn SharedMemory>,
    ) -> Self {
        let inner = PoolInner {
            classes: vec![Vec::new(); cfg.max_class_pages],
            retained_bytes: 0,
        };
        Self {
            allocator,
            mem,
            cfg,
            inner: Mutex::new(inner),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pages_for(&self, size: usize) -> usize {
        size.div_ceil(self.cfg.page_size)
    }

    fn is_pooled(&self, pages: usize) -> bool {
        pages >= 1 && pages <= self.cfg.max_class_pages
    }

    /// Get a buffer of at least `size` bytes.
    ///
    /// Bytes past `size` are always zero. With `zero` set the whole buffer is zeroed; otherwise
    /// the caller is expected to overwrite `[0, size)` itself.
    pub fn acquire(&self, size: usize, zero: bool) -> KmdResult<ContigBuffer> {
        if size == 0 {
            return Err(KmdError::InvalidParameter("zero-sized contiguous buffer"));
        }
        let pages = self.pages_for(size);
        let capacity = pages
            .checked_mul(self.cfg.page_size)
            .ok_or(KmdError::ResourceExhausted)?;

        if self.is_pooled(pages) {
            let hit = {
                let mut inner = self.lock();
                let gpa = inner.classes[pages - 1].pop();
                if gpa.is_some() {
                    inner.retained_bytes -= capacity;
                }
                gpa
            };
            if let Some(gpa) = hit {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.bytes_saved
                    .fetch_add(capacity as u64, Ordering::Relaxed);
                if zero {
                    self.mem.zero(gpa, capacity);
                } else if capacity > size {
                    self.mem.zero(gpa + size as u64, capacity - size);
                }
                return Ok(ContigBuffer {
                    gpa,
                    len: size,
                    capacity,
                });
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        // Fresh allocations come back zeroed from the backing allocator.
        let gpa = self
            .allocator
            .allocate(capacity)
            .ok_or(KmdError::ResourceExhausted)?;
        Ok(ContigBuffer {
            gpa,
            len: size,
            capacity,
        })
    }

    /// Return a buffer to its class free list, or to the backing allocator if the class or the
    /// global retention budget is full.
    pub fn release(&self, buf: ContigBuffer) {
        let pages = buf.capacity / self.cfg.page_size;
        if self.is_pooled(pages) && pages * self.cfg.page_size == buf.capacity {
            let mut inner = self.lock();
            let has_room = inner.classes[pages - 1].len() < self.cfg.max_entries_per_class
                && inner.retained_bytes + buf.capacity <= self.cfg.max_retained_bytes;
            if has_room {
                inner.classes[pages - 1].push(buf.gpa);
                inner.retained_bytes += buf.capacity;
                return;
            }
        }
        self.allocator.free(buf.gpa, buf.capacity);
    }

    /// Hand every retained buffer back to the backing allocator. Returns the bytes released.
    pub fn trim(&self) -> usize {
        let (classes, bytes) = {
            let mut inner = self.lock();
            let bytes = std::mem::take(&mut inner.retained_bytes);
            let classes: Vec<Vec<u64>> = inner.classes.iter_mut().map(std::mem::take).collect();
            (classes, bytes)
        };
        for (idx, list) in classes.into_iter().enumerate() {
            let capacity = (idx + 1) * self.cfg.page_size;
            for gpa in list {
                self.allocator.free(gpa, capacity);
            }
        }
        if bytes != 0 {
            debug!(bytes, "trimmed contiguous pool");
        }
        bytes
    }

    pub fn stats(&self) -> PoolStats {
        let (retained_bytes, retained_buffers) = {
            let inner = self.lock();
            let count: usize = inner.classes.iter().map(Vec::len).sum();
            (inner.retained_bytes, count)
        };
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
            retained_bytes: retained_bytes as u64,
            retained_buffers: retained_buffers as u64,
        }
    }
}
