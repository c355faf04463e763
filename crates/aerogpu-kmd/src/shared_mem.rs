//! Guest-physical memory shared with the device.
//!
//! Unlike an emulator-side bus, the driver touches this memory from the submission thread, the
//! interrupt top half and the deferred bottom half concurrently, so every access goes through
//! `&self`. Implementations provide their own interior synchronization.

/// Byte-granular access to device-visible memory, addressed by guest-physical address.
pub trait SharedMemory: Send + Sync {
    fn read_physical(&self, gpa: u64, buf: &mut [u8]);
    fn write_physical(&self, gpa: u64, buf: &[u8]);

    fn read_u32(&self, gpa: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(gpa, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, gpa: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(gpa, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u32(&self, gpa: u64, value: u32) {
        self.write_physical(gpa, &value.to_le_bytes());
    }

    fn write_u64(&self, gpa: u64, value: u64) {
        self.write_physical(gpa, &value.to_le_bytes());
    }

    /// Zero `len` bytes starting at `gpa`.
    fn zero(&self, gpa: u64, len: usize) {
        const CHUNK: [u8; 4096] = [0u8; 4096];
        let mut done = 0usize;
        while done < len {
            let n = (len - done).min(CHUNK.len());
            let Some(addr) = gpa.checked_add(done as u64) else {
                return;
            };
            self.write_physical(addr, &CHUNK[..n]);
            done += n;
        }
    }
}

/// Backing allocator for physically-contiguous, device-visible memory.
pub trait ContiguousAllocator: Send + Sync {
    /// Allocate `size_bytes` of zeroed contiguous memory, returning its guest-physical address.
    fn allocate(&self, size_bytes: usize) -> Option<u64>;
    fn free(&self, gpa: u64, size_bytes: usize);
}
