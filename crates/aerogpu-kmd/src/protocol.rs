//! Shared-memory wire formats: versioned ring header, submit descriptor, allocation table and
//! fence page, plus the legacy ring entry and submission descriptor.
//!
//! All fields are little-endian. The `#[repr(C)]` structs exist to pin the layout; encoding and
//! decoding go through the `*_OFFSET` constants so no unaligned casts are needed.

use core::mem::{offset_of, size_of};
use std::collections::HashSet;

use bitflags::bitflags;

use crate::error::{KmdError, KmdResult, RingError};
use crate::host::{AllocationRef, SubmissionKind};
use crate::regs::versioned::{abi_major, ABI_MAJOR, ABI_VERSION_U32};

pub const AEROGPU_RING_MAGIC: u32 = 0x474E_5241; // "ARNG"
pub const AEROGPU_ALLOC_TABLE_MAGIC: u32 = 0x434F_4C41; // "ALOC"
pub const AEROGPU_FENCE_PAGE_MAGIC: u32 = 0x434E_4546; // "FENC"

pub const AEROGPU_ALLOC_FLAG_READONLY: u32 = 1 << 0;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct SubmitFlags: u32 {
        const PRESENT = 1 << 0;
        const NO_IRQ = 1 << 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingHeader {
    pub magic: u32,
    pub abi_version: u32,
    pub size_bytes: u32,
    pub entry_count: u32,
    pub entry_stride_bytes: u32,
    pub flags: u32,
    pub head: u32,
    pub tail: u32,
    pub reserved0: u32,
    pub reserved1: u32,
    pub reserved2: [u64; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubmitDesc {
    pub desc_size_bytes: u32,
    pub flags: u32,
    pub context_id: u32,
    pub engine_id: u32,
    pub cmd_gpa: u64,
    pub cmd_size_bytes: u32,
    pub cmd_reserved0: u32,
    pub alloc_table_gpa: u64,
    pub alloc_table_size_bytes: u32,
    pub alloc_table_reserved0: u32,
    pub signal_fence: u64,
    pub reserved0: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocTableHeader {
    pub magic: u32,
    pub abi_version: u32,
    pub size_bytes: u32,
    pub entry_count: u32,
    pub entry_stride_bytes: u32,
    pub reserved0: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocEntry {
    pub alloc_id: u32,
    pub flags: u32,
    pub gpa: u64,
    pub size_bytes: u64,
    pub reserved0: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FencePage {
    pub magic: u32,
    pub abi_version: u32,
    pub completed_fence: u64,
    pub reserved0: [u64; 5],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LegacyRingEntry {
    pub entry_type: u32,
    pub flags: u32,
    pub fence: u32,
    pub desc_size: u32,
    pub desc_gpa: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LegacySubmissionHeader {
    pub version: u32,
    pub submission_type: u32,
    pub fence: u32,
    pub reserved0: u32,
    pub dma_buffer_gpa: u64,
    pub dma_buffer_size: u32,
    pub allocation_count: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LegacyAllocation {
    pub allocation_handle: u64,
    pub gpa: u64,
    pub size_bytes: u32,
    pub reserved0: u32,
}

pub const RING_HEADER_SIZE_BYTES: u64 = size_of::<RingHeader>() as u64;
pub const SUBMIT_DESC_SIZE_BYTES: u32 = size_of::<SubmitDesc>() as u32;
pub const ALLOC_TABLE_HEADER_SIZE_BYTES: u32 = size_of::<AllocTableHeader>() as u32;
pub const ALLOC_ENTRY_SIZE_BYTES: u32 = size_of::<AllocEntry>() as u32;
pub const FENCE_PAGE_SIZE_BYTES: u64 = size_of::<FencePage>() as u64;
pub const LEGACY_RING_ENTRY_SIZE_BYTES: u32 = size_of::<LegacyRingEntry>() as u32;
pub const LEGACY_SUBMISSION_HEADER_SIZE_BYTES: u32 = size_of::<LegacySubmissionHeader>() as u32;
pub const LEGACY_ALLOCATION_SIZE_BYTES: u32 = size_of::<LegacyAllocation>() as u32;

pub const LEGACY_RING_ENTRY_SUBMIT: u32 = 1;
pub const LEGACY_SUBMISSION_VERSION: u32 = 1;

pub const RING_MAGIC_OFFSET: usize = offset_of!(RingHeader, magic);
pub const RING_ABI_VERSION_OFFSET: usize = offset_of!(RingHeader, abi_version);
pub const RING_SIZE_BYTES_OFFSET: usize = offset_of!(RingHeader, size_bytes);
pub const RING_ENTRY_COUNT_OFFSET: usize = offset_of!(RingHeader, entry_count);
pub const RING_ENTRY_STRIDE_BYTES_OFFSET: usize = offset_of!(RingHeader, entry_stride_bytes);
pub const RING_FLAGS_OFFSET: usize = offset_of!(RingHeader, flags);
pub const RING_HEAD_OFFSET: usize = offset_of!(RingHeader, head);
pub const RING_TAIL_OFFSET: usize = offset_of!(RingHeader, tail);

pub const SUBMIT_DESC_SIZE_BYTES_OFFSET: usize = offset_of!(SubmitDesc, desc_size_bytes);
pub const SUBMIT_DESC_FLAGS_OFFSET: usize = offset_of!(SubmitDesc, flags);
pub const SUBMIT_DESC_CONTEXT_ID_OFFSET: usize = offset_of!(SubmitDesc, context_id);
pub const SUBMIT_DESC_ENGINE_ID_OFFSET: usize = offset_of!(SubmitDesc, engine_id);
pub const SUBMIT_DESC_CMD_GPA_OFFSET: usize = offset_of!(SubmitDesc, cmd_gpa);
pub const SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET: usize = offset_of!(SubmitDesc, cmd_size_bytes);
pub const SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET: usize = offset_of!(SubmitDesc, alloc_table_gpa);
pub const SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET: usize =
    offset_of!(SubmitDesc, alloc_table_size_bytes);
pub const SUBMIT_DESC_SIGNAL_FENCE_OFFSET: usize = offset_of!(SubmitDesc, signal_fence);

pub const ALLOC_TABLE_MAGIC_OFFSET: usize = offset_of!(AllocTableHeader, magic);
pub const ALLOC_TABLE_ABI_VERSION_OFFSET: usize = offset_of!(AllocTableHeader, abi_version);
pub const ALLOC_TABLE_SIZE_BYTES_OFFSET: usize = offset_of!(AllocTableHeader, size_bytes);
pub const ALLOC_TABLE_ENTRY_COUNT_OFFSET: usize = offset_of!(AllocTableHeader, entry_count);
pub const ALLOC_TABLE_ENTRY_STRIDE_BYTES_OFFSET: usize =
    offset_of!(AllocTableHeader, entry_stride_bytes);

pub const ALLOC_ENTRY_ALLOC_ID_OFFSET: usize = offset_of!(AllocEntry, alloc_id);
pub const ALLOC_ENTRY_FLAGS_OFFSET: usize = offset_of!(AllocEntry, flags);
pub const ALLOC_ENTRY_GPA_OFFSET: usize = offset_of!(AllocEntry, gpa);
pub const ALLOC_ENTRY_SIZE_BYTES_OFFSET: usize = offset_of!(AllocEntry, size_bytes);

pub const FENCE_PAGE_MAGIC_OFFSET: usize = offset_of!(FencePage, magic);
pub const FENCE_PAGE_ABI_VERSION_OFFSET: usize = offset_of!(FencePage, abi_version);
pub const FENCE_PAGE_COMPLETED_FENCE_OFFSET: usize = offset_of!(FencePage, completed_fence);

pub const LEGACY_ENTRY_TYPE_OFFSET: usize = offset_of!(LegacyRingEntry, entry_type);
pub const LEGACY_ENTRY_FLAGS_OFFSET: usize = offset_of!(LegacyRingEntry, flags);
pub const LEGACY_ENTRY_FENCE_OFFSET: usize = offset_of!(LegacyRingEntry, fence);
pub const LEGACY_ENTRY_DESC_SIZE_OFFSET: usize = offset_of!(LegacyRingEntry, desc_size);
pub const LEGACY_ENTRY_DESC_GPA_OFFSET: usize = offset_of!(LegacyRingEntry, desc_gpa);

pub const LEGACY_DESC_VERSION_OFFSET: usize = offset_of!(LegacySubmissionHeader, version);
pub const LEGACY_DESC_TYPE_OFFSET: usize = offset_of!(LegacySubmissionHeader, submission_type);
pub const LEGACY_DESC_FENCE_OFFSET: usize = offset_of!(LegacySubmissionHeader, fence);
pub const LEGACY_DESC_DMA_GPA_OFFSET: usize = offset_of!(LegacySubmissionHeader, dma_buffer_gpa);
pub const LEGACY_DESC_DMA_SIZE_OFFSET: usize = offset_of!(LegacySubmissionHeader, dma_buffer_size);
pub const LEGACY_DESC_ALLOC_COUNT_OFFSET: usize =
    offset_of!(LegacySubmissionHeader, allocation_count);

pub const LEGACY_ALLOC_HANDLE_OFFSET: usize = offset_of!(LegacyAllocation, allocation_handle);
pub const LEGACY_ALLOC_GPA_OFFSET: usize = offset_of!(LegacyAllocation, gpa);
pub const LEGACY_ALLOC_SIZE_OFFSET: usize = offset_of!(LegacyAllocation, size_bytes);

const _: () = {
    assert!(RING_HEADER_SIZE_BYTES == 64);
    assert!(SUBMIT_DESC_SIZE_BYTES == 64);
    assert!(ALLOC_TABLE_HEADER_SIZE_BYTES == 24);
    assert!(ALLOC_ENTRY_SIZE_BYTES == 32);
    assert!(FENCE_PAGE_SIZE_BYTES == 56);
    assert!(LEGACY_RING_ENTRY_SIZE_BYTES == 24);
    assert!(LEGACY_SUBMISSION_HEADER_SIZE_BYTES == 32);
    assert!(LEGACY_ALLOCATION_SIZE_BYTES == 24);
};

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

impl RingHeader {
    pub const SIZE_BYTES: usize = RING_HEADER_SIZE_BYTES as usize;

    /// Header for a freshly initialized (empty) ring of `entry_count` descriptors.
    pub fn new(entry_count: u32) -> Self {
        Self {
            magic: AEROGPU_RING_MAGIC,
            abi_version: ABI_VERSION_U32,
            size_bytes: Self::required_size(entry_count) as u32,
            entry_count,
            entry_stride_bytes: SUBMIT_DESC_SIZE_BYTES,
            ..Self::default()
        }
    }

    pub fn required_size(entry_count: u32) -> u64 {
        RING_HEADER_SIZE_BYTES + u64::from(entry_count) * u64::from(SUBMIT_DESC_SIZE_BYTES)
    }

    pub fn decode(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            magic: get_u32(buf, RING_MAGIC_OFFSET),
            abi_version: get_u32(buf, RING_ABI_VERSION_OFFSET),
            size_bytes: get_u32(buf, RING_SIZE_BYTES_OFFSET),
            entry_count: get_u32(buf, RING_ENTRY_COUNT_OFFSET),
            entry_stride_bytes: get_u32(buf, RING_ENTRY_STRIDE_BYTES_OFFSET),
            flags: get_u32(buf, RING_FLAGS_OFFSET),
            head: get_u32(buf, RING_HEAD_OFFSET),
            tail: get_u32(buf, RING_TAIL_OFFSET),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        put_u32(&mut buf, RING_MAGIC_OFFSET, self.magic);
        put_u32(&mut buf, RING_ABI_VERSION_OFFSET, self.abi_version);
        put_u32(&mut buf, RING_SIZE_BYTES_OFFSET, self.size_bytes);
        put_u32(&mut buf, RING_ENTRY_COUNT_OFFSET, self.entry_count);
        put_u32(&mut buf, RING_ENTRY_STRIDE_BYTES_OFFSET, self.entry_stride_bytes);
        put_u32(&mut buf, RING_FLAGS_OFFSET, self.flags);
        put_u32(&mut buf, RING_HEAD_OFFSET, self.head);
        put_u32(&mut buf, RING_TAIL_OFFSET, self.tail);
        buf
    }

    /// Geometry check against the configured ring and the size of the mapping backing it.
    ///
    /// An unknown minor version is accepted; the major must match.
    pub fn validate(&self, expected_entry_count: u32, mapped_size: u64) -> Result<(), RingError> {
        if self.magic != AEROGPU_RING_MAGIC {
            return Err(RingError::BadMagic { found: self.magic });
        }
        let major = abi_major(self.abi_version);
        if major != ABI_MAJOR {
            return Err(RingError::UnsupportedMajor { found: major });
        }
        if self.entry_count != expected_entry_count || !self.entry_count.is_power_of_two() {
            return Err(RingError::BadEntryCount {
                found: self.entry_count,
                expected: expected_entry_count,
            });
        }
        if self.entry_stride_bytes != SUBMIT_DESC_SIZE_BYTES {
            return Err(RingError::BadStride {
                found: self.entry_stride_bytes,
                expected: SUBMIT_DESC_SIZE_BYTES,
            });
        }
        let min = Self::required_size(self.entry_count);
        let size = u64::from(self.size_bytes);
        if size < min || size > mapped_size {
            return Err(RingError::BadSize {
                found: self.size_bytes,
                min,
                max: mapped_size,
            });
        }
        Ok(())
    }

    pub fn slot_index(&self, index: u32) -> u32 {
        // entry_count is validated as a power-of-two.
        index & (self.entry_count - 1)
    }
}

impl SubmitDesc {
    pub const SIZE_BYTES: usize = SUBMIT_DESC_SIZE_BYTES as usize;

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        put_u32(&mut buf, SUBMIT_DESC_SIZE_BYTES_OFFSET, SUBMIT_DESC_SIZE_BYTES);
        put_u32(&mut buf, SUBMIT_DESC_FLAGS_OFFSET, self.flags);
        put_u32(&mut buf, SUBMIT_DESC_CONTEXT_ID_OFFSET, self.context_id);
        put_u32(&mut buf, SUBMIT_DESC_ENGINE_ID_OFFSET, self.engine_id);
        put_u64(&mut buf, SUBMIT_DESC_CMD_GPA_OFFSET, self.cmd_gpa);
        put_u32(&mut buf, SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET, self.cmd_size_bytes);
        put_u64(&mut buf, SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET, self.alloc_table_gpa);
        put_u32(
            &mut buf,
            SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET,
            self.alloc_table_size_bytes,
        );
        put_u64(&mut buf, SUBMIT_DESC_SIGNAL_FENCE_OFFSET, self.signal_fence);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            desc_size_bytes: get_u32(buf, SUBMIT_DESC_SIZE_BYTES_OFFSET),
            flags: get_u32(buf, SUBMIT_DESC_FLAGS_OFFSET),
            context_id: get_u32(buf, SUBMIT_DESC_CONTEXT_ID_OFFSET),
            engine_id: get_u32(buf, SUBMIT_DESC_ENGINE_ID_OFFSET),
            cmd_gpa: get_u64(buf, SUBMIT_DESC_CMD_GPA_OFFSET),
            cmd_size_bytes: get_u32(buf, SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET),
            alloc_table_gpa: get_u64(buf, SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET),
            alloc_table_size_bytes: get_u32(buf, SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET),
            signal_fence: get_u64(buf, SUBMIT_DESC_SIGNAL_FENCE_OFFSET),
            ..Self::default()
        }
    }
}

fn check_allocation(alloc: &AllocationRef, seen: &mut HashSet<u32>) -> KmdResult<()> {
    if alloc.alloc_id == 0 {
        return Err(KmdError::InvalidParameter("alloc_id 0 is reserved"));
    }
    if !seen.insert(alloc.alloc_id) {
        return Err(KmdError::InvalidParameter("duplicate alloc_id"));
    }
    if alloc.size_bytes == 0 {
        return Err(KmdError::InvalidParameter("allocation size is zero"));
    }
    if alloc.gpa.checked_add(alloc.size_bytes).is_none() {
        return Err(KmdError::InvalidParameter("allocation range overflows"));
    }
    Ok(())
}

/// Encode a versioned allocation table (header followed by one entry per allocation).
pub fn encode_alloc_table(allocations: &[AllocationRef]) -> KmdResult<Vec<u8>> {
    let mut seen = HashSet::with_capacity(allocations.len());
    for alloc in allocations {
        check_allocation(alloc, &mut seen)?;
    }

    let size = ALLOC_TABLE_HEADER_SIZE_BYTES as usize
        + allocations.len() * ALLOC_ENTRY_SIZE_BYTES as usize;
    let size_u32 =
        u32::try_from(size).map_err(|_| KmdError::InvalidParameter("allocation list too large"))?;

    let mut buf = vec![0u8; size];
    put_u32(&mut buf, ALLOC_TABLE_MAGIC_OFFSET, AEROGPU_ALLOC_TABLE_MAGIC);
    put_u32(&mut buf, ALLOC_TABLE_ABI_VERSION_OFFSET, ABI_VERSION_U32);
    put_u32(&mut buf, ALLOC_TABLE_SIZE_BYTES_OFFSET, size_u32);
    put_u32(
        &mut buf,
        ALLOC_TABLE_ENTRY_COUNT_OFFSET,
        allocations.len() as u32,
    );
    put_u32(
        &mut buf,
        ALLOC_TABLE_ENTRY_STRIDE_BYTES_OFFSET,
        ALLOC_ENTRY_SIZE_BYTES,
    );

    for (i, alloc) in allocations.iter().enumerate() {
        let base = ALLOC_TABLE_HEADER_SIZE_BYTES as usize + i * ALLOC_ENTRY_SIZE_BYTES as usize;
        put_u32(&mut buf, base + ALLOC_ENTRY_ALLOC_ID_OFFSET, alloc.alloc_id);
        put_u32(&mut buf, base + ALLOC_ENTRY_FLAGS_OFFSET, alloc.flags);
        put_u64(&mut buf, base + ALLOC_ENTRY_GPA_OFFSET, alloc.gpa);
        put_u64(&mut buf, base + ALLOC_ENTRY_SIZE_BYTES_OFFSET, alloc.size_bytes);
    }
    Ok(buf)
}

impl FencePage {
    pub const SIZE_BYTES: usize = FENCE_PAGE_SIZE_BYTES as usize;

    pub fn new() -> Self {
        Self {
            magic: AEROGPU_FENCE_PAGE_MAGIC,
            abi_version: ABI_VERSION_U32,
            ..Self::default()
        }
    }

    pub fn decode(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            magic: get_u32(buf, FENCE_PAGE_MAGIC_OFFSET),
            abi_version: get_u32(buf, FENCE_PAGE_ABI_VERSION_OFFSET),
            completed_fence: get_u64(buf, FENCE_PAGE_COMPLETED_FENCE_OFFSET),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        put_u32(&mut buf, FENCE_PAGE_MAGIC_OFFSET, self.magic);
        put_u32(&mut buf, FENCE_PAGE_ABI_VERSION_OFFSET, self.abi_version);
        put_u64(&mut buf, FENCE_PAGE_COMPLETED_FENCE_OFFSET, self.completed_fence);
        buf
    }

    pub fn is_valid(&self) -> bool {
        self.magic == AEROGPU_FENCE_PAGE_MAGIC && abi_major(self.abi_version) == ABI_MAJOR
    }
}

impl LegacyRingEntry {
    pub const SIZE_BYTES: usize = LEGACY_RING_ENTRY_SIZE_BYTES as usize;

    pub fn encode(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        put_u32(&mut buf, LEGACY_ENTRY_TYPE_OFFSET, self.entry_type);
        put_u32(&mut buf, LEGACY_ENTRY_FLAGS_OFFSET, self.flags);
        put_u32(&mut buf, LEGACY_ENTRY_FENCE_OFFSET, self.fence);
        put_u32(&mut buf, LEGACY_ENTRY_DESC_SIZE_OFFSET, self.desc_size);
        put_u64(&mut buf, LEGACY_ENTRY_DESC_GPA_OFFSET, self.desc_gpa);
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            entry_type: get_u32(buf, LEGACY_ENTRY_TYPE_OFFSET),
            flags: get_u32(buf, LEGACY_ENTRY_FLAGS_OFFSET),
            fence: get_u32(buf, LEGACY_ENTRY_FENCE_OFFSET),
            desc_size: get_u32(buf, LEGACY_ENTRY_DESC_SIZE_OFFSET),
            desc_gpa: get_u64(buf, LEGACY_ENTRY_DESC_GPA_OFFSET),
        }
    }
}

/// Encode a legacy submission descriptor: header followed by the allocation records.
pub fn encode_legacy_submission(
    kind: SubmissionKind,
    fence: u32,
    dma_buffer_gpa: u64,
    dma_buffer_size: u32,
    allocations: &[AllocationRef],
) -> KmdResult<Vec<u8>> {
    let mut seen = HashSet::with_capacity(allocations.len());
    for alloc in allocations {
        check_allocation(alloc, &mut seen)?;
        if alloc.size_bytes > u64::from(u32::MAX) {
            return Err(KmdError::InvalidParameter(
                "allocation too large for the legacy descriptor",
            ));
        }
    }

    let size = LEGACY_SUBMISSION_HEADER_SIZE_BYTES as usize
        + allocations.len() * LEGACY_ALLOCATION_SIZE_BYTES as usize;
    let mut buf = vec![0u8; size];
    put_u32(&mut buf, LEGACY_DESC_VERSION_OFFSET, LEGACY_SUBMISSION_VERSION);
    put_u32(&mut buf, LEGACY_DESC_TYPE_OFFSET, kind.legacy_type());
    put_u32(&mut buf, LEGACY_DESC_FENCE_OFFSET, fence);
    put_u64(&mut buf, LEGACY_DESC_DMA_GPA_OFFSET, dma_buffer_gpa);
    put_u32(&mut buf, LEGACY_DESC_DMA_SIZE_OFFSET, dma_buffer_size);
    put_u32(
        &mut buf,
        LEGACY_DESC_ALLOC_COUNT_OFFSET,
        allocations.len() as u32,
    );

    for (i, alloc) in allocations.iter().enumerate() {
        let base = LEGACY_SUBMISSION_HEADER_SIZE_BYTES as usize
            + i * LEGACY_ALLOCATION_SIZE_BYTES as usize;
        put_u64(
            &mut buf,
            base + LEGACY_ALLOC_HANDLE_OFFSET,
            u64::from(alloc.alloc_id),
        );
        put_u64(&mut buf, base + LEGACY_ALLOC_GPA_OFFSET, alloc.gpa);
        put_u32(&mut buf, base + LEGACY_ALLOC_SIZE_OFFSET, alloc.size_bytes as u32);
    }
    Ok(buf)
}
