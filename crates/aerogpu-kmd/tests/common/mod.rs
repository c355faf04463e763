//! Shared fake device for `aerogpu-kmd` integration tests.
//!
//! `FakeGpu` plays every platform role at once: the BAR0 register file, guest memory, the
//! contiguous allocator and the host framework. It consumes ring entries only when a test asks it
//! to (`complete`), so every test controls exactly how far the device has progressed.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use aerogpu_kmd::protocol::{
    self, LegacyRingEntry, SubmitDesc, FENCE_PAGE_COMPLETED_FENCE_OFFSET,
    LEGACY_RING_ENTRY_SIZE_BYTES, RING_ENTRY_COUNT_OFFSET, RING_HEADER_SIZE_BYTES,
    RING_HEAD_OFFSET, RING_TAIL_OFFSET, SUBMIT_DESC_SIZE_BYTES,
};
use aerogpu_kmd::regs::{legacy, versioned};
use aerogpu_kmd::{
    AbiKind, ContiguousAllocator, DeviceCore, FeatureBits, HostCallbacks, HostNotification,
    IrqBits, KmdConfig, Platform, RegisterBlock, SharedMemory, SubmitFlags,
};

pub const MEM_SIZE: usize = 4 * 1024 * 1024;
const ALLOC_BASE: u64 = 0x10_000;
const PAGE: u64 = 4096;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Ring of 8 slots; small enough to hit backpressure quickly.
pub fn small_config() -> KmdConfig {
    KmdConfig {
        ring_entry_count: 8,
        ..KmdConfig::default()
    }
}

pub fn default_features() -> FeatureBits {
    FeatureBits::FENCE_PAGE | FeatureBits::VBLANK | FeatureBits::ERROR_INFO
}

struct FakeState {
    abi: AbiKind,
    regs: HashMap<u32, u32>,
    irq_status: u32,
    completed: u64,
    next_alloc: u64,
    fail_allocations: bool,
    pinned_ring_base: bool,
    frees: Vec<(u64, usize)>,
    doorbells: usize,
    notifications: Vec<HostNotification>,
    dpc_requests: usize,
    dpc_notifies: usize,
}

pub struct FakeGpu {
    state: Mutex<FakeState>,
    mem: Mutex<Vec<u8>>,
}

fn read_u32(mem: &[u8], gpa: u64) -> u32 {
    let start = gpa as usize;
    u32::from_le_bytes(mem[start..start + 4].try_into().unwrap())
}

fn read_u64(mem: &[u8], gpa: u64) -> u64 {
    let start = gpa as usize;
    u64::from_le_bytes(mem[start..start + 8].try_into().unwrap())
}

fn write_u32(mem: &mut [u8], gpa: u64, value: u32) {
    let start = gpa as usize;
    mem[start..start + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(mem: &mut [u8], gpa: u64, value: u64) {
    let start = gpa as usize;
    mem[start..start + 8].copy_from_slice(&value.to_le_bytes());
}

impl FakeGpu {
    fn with_regs(abi: AbiKind, regs: HashMap<u32, u32>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                abi,
                regs,
                irq_status: 0,
                completed: 0,
                next_alloc: ALLOC_BASE,
                fail_allocations: false,
                pinned_ring_base: false,
                frees: Vec::new(),
                doorbells: 0,
                notifications: Vec::new(),
                dpc_requests: 0,
                dpc_notifies: 0,
            }),
            mem: Mutex::new(vec![0; MEM_SIZE]),
        })
    }

    pub fn versioned(features: FeatureBits) -> Arc<Self> {
        let bits = features.bits();
        let regs = HashMap::from([
            (versioned::MAGIC, versioned::MMIO_MAGIC),
            (versioned::ABI_VERSION, versioned::ABI_VERSION_U32),
            (versioned::FEATURES_LO, bits as u32),
            (versioned::FEATURES_HI, (bits >> 32) as u32),
        ]);
        Self::with_regs(AbiKind::Versioned, regs)
    }

    pub fn legacy() -> Arc<Self> {
        let regs = HashMap::from([
            (legacy::MAGIC, legacy::MMIO_MAGIC),
            (legacy::VERSION, legacy::MMIO_VERSION),
        ]);
        Self::with_regs(AbiKind::Legacy, regs)
    }

    /// A device answering with an arbitrary magic/version pair.
    pub fn with_identity(magic: u32, version: u32) -> Arc<Self> {
        let regs = HashMap::from([(0, magic), (4, version)]);
        Self::with_regs(AbiKind::Versioned, regs)
    }

    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform::new(self.clone(), self.clone(), self.clone(), self.clone())
    }

    pub fn started(self: &Arc<Self>, cfg: KmdConfig) -> DeviceCore {
        init_tracing();
        let dev = DeviceCore::new(cfg, self.platform()).unwrap();
        dev.start().unwrap();
        dev
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    // ---------------------------------------------------------------------
    // Device-side behaviour
    // ---------------------------------------------------------------------

    /// Consume up to `n` ring entries, publish the completed fence and raise the fence
    /// interrupt if any consumed entry asked for one. Returns the number consumed.
    pub fn complete(&self, n: u32) -> u32 {
        let mut st = self.state();
        let mut mem = self.mem.lock().unwrap();
        match st.abi {
            AbiKind::Versioned => Self::complete_versioned(&mut st, &mut mem, n),
            AbiKind::Legacy => Self::complete_legacy(&mut st, &mut mem, n),
        }
    }

    fn complete_versioned(st: &mut FakeState, mem: &mut [u8], n: u32) -> u32 {
        let ring_gpa = u64::from(reg(st, versioned::RING_GPA_LO))
            | (u64::from(reg(st, versioned::RING_GPA_HI)) << 32);
        if ring_gpa == 0 {
            return 0;
        }
        let entry_count = read_u32(mem, ring_gpa + RING_ENTRY_COUNT_OFFSET as u64);
        let mut head = read_u32(mem, ring_gpa + RING_HEAD_OFFSET as u64);
        let tail = read_u32(mem, ring_gpa + RING_TAIL_OFFSET as u64);

        let mut consumed = 0;
        let mut raise = false;
        while consumed < n && head != tail {
            let slot = head & (entry_count - 1);
            let desc_gpa = ring_gpa
                + RING_HEADER_SIZE_BYTES
                + u64::from(slot) * u64::from(SUBMIT_DESC_SIZE_BYTES);
            let mut buf = [0u8; SubmitDesc::SIZE_BYTES];
            let start = desc_gpa as usize;
            buf.copy_from_slice(&mem[start..start + SubmitDesc::SIZE_BYTES]);
            let desc = SubmitDesc::decode(&buf);
            st.completed = st.completed.max(desc.signal_fence);
            if !SubmitFlags::from_bits_truncate(desc.flags).contains(SubmitFlags::NO_IRQ) {
                raise = true;
            }
            head = head.wrapping_add(1);
            consumed += 1;
        }
        write_u32(mem, ring_gpa + RING_HEAD_OFFSET as u64, head);

        let completed = st.completed;
        st.regs
            .insert(versioned::COMPLETED_FENCE_LO, completed as u32);
        st.regs
            .insert(versioned::COMPLETED_FENCE_HI, (completed >> 32) as u32);
        let fence_gpa = u64::from(reg(st, versioned::FENCE_GPA_LO))
            | (u64::from(reg(st, versioned::FENCE_GPA_HI)) << 32);
        if fence_gpa != 0 {
            write_u64(
                mem,
                fence_gpa + FENCE_PAGE_COMPLETED_FENCE_OFFSET as u64,
                completed,
            );
        }
        if raise {
            st.irq_status |= IrqBits::FENCE.bits();
        }
        consumed
    }

    fn complete_legacy(st: &mut FakeState, mem: &mut [u8], n: u32) -> u32 {
        let base = u64::from(reg(st, legacy::RING_BASE_LO))
            | (u64::from(reg(st, legacy::RING_BASE_HI)) << 32);
        let entry_count = reg(st, legacy::RING_ENTRY_COUNT);
        if base == 0 || entry_count == 0 {
            return 0;
        }
        let mut head = reg(st, legacy::RING_HEAD);
        let tail = reg(st, legacy::RING_TAIL);

        let mut consumed = 0;
        while consumed < n && head != tail {
            let entry_gpa = base + u64::from(head) * u64::from(LEGACY_RING_ENTRY_SIZE_BYTES);
            let mut buf = [0u8; LegacyRingEntry::SIZE_BYTES];
            let start = entry_gpa as usize;
            buf.copy_from_slice(&mem[start..start + LegacyRingEntry::SIZE_BYTES]);
            let entry = LegacyRingEntry::decode(&buf);
            // The legacy register reports the low word of the last consumed fence.
            st.completed = u64::from(entry.fence);
            head = (head + 1) % entry_count;
            consumed += 1;
        }
        st.regs.insert(legacy::RING_HEAD, head);
        st.regs
            .insert(legacy::FENCE_COMPLETED, st.completed as u32);
        if consumed != 0 {
            st.irq_status |= IrqBits::FENCE.bits();
        }
        consumed
    }

    pub fn raise_irq(&self, bits: IrqBits) {
        self.state().irq_status |= bits.bits();
    }

    pub fn raise_raw_irq(&self, bits: u32) {
        self.state().irq_status |= bits;
    }

    pub fn irq_status(&self) -> u32 {
        self.state().irq_status
    }

    /// Publish error details for the next error interrupt.
    pub fn set_error(&self, code: u32, fence: u64) {
        let mut st = self.state();
        st.regs.insert(versioned::ERROR_CODE, code);
        st.regs.insert(versioned::ERROR_FENCE_LO, fence as u32);
        st.regs.insert(versioned::ERROR_FENCE_HI, (fence >> 32) as u32);
        let count = reg(&st, versioned::ERROR_COUNT) + 1;
        st.regs.insert(versioned::ERROR_COUNT, count);
    }

    pub fn set_vblank(&self, seq: u64, time_ns: u64, period_ns: u32) {
        let mut st = self.state();
        st.regs.insert(versioned::SCANOUT0_VBLANK_SEQ_LO, seq as u32);
        st.regs
            .insert(versioned::SCANOUT0_VBLANK_SEQ_HI, (seq >> 32) as u32);
        st.regs
            .insert(versioned::SCANOUT0_VBLANK_TIME_NS_LO, time_ns as u32);
        st.regs
            .insert(versioned::SCANOUT0_VBLANK_TIME_NS_HI, (time_ns >> 32) as u32);
        st.regs
            .insert(versioned::SCANOUT0_VBLANK_PERIOD_NS, period_ns);
    }

    /// Make the ring base registers read back `base` and ignore further writes, as if the
    /// device lost its programming and refuses to take it again.
    pub fn pin_ring_base(&self, base: u64) {
        let mut st = self.state();
        let (lo, hi) = ring_base_regs(st.abi);
        st.regs.insert(lo, base as u32);
        st.regs.insert(hi, (base >> 32) as u32);
        st.pinned_ring_base = true;
    }

    pub fn unpin_ring_base(&self) {
        self.state().pinned_ring_base = false;
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state().fail_allocations = fail;
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub fn reg(&self, offset: u32) -> u32 {
        reg(&self.state(), offset)
    }

    pub fn set_reg(&self, offset: u32, value: u32) {
        self.state().regs.insert(offset, value);
    }

    pub fn ring_gpa(&self) -> u64 {
        let st = self.state();
        let (lo, hi) = ring_base_regs(st.abi);
        u64::from(reg(&st, lo)) | (u64::from(reg(&st, hi)) << 32)
    }

    pub fn mem_u32(&self, gpa: u64) -> u32 {
        read_u32(&self.mem.lock().unwrap(), gpa)
    }

    pub fn set_mem_u32(&self, gpa: u64, value: u32) {
        write_u32(&mut self.mem.lock().unwrap(), gpa, value);
    }

    pub fn mem_bytes(&self, gpa: u64, len: usize) -> Vec<u8> {
        let start = gpa as usize;
        self.mem.lock().unwrap()[start..start + len].to_vec()
    }

    /// Decode the versioned descriptor in ring slot `slot`.
    pub fn desc(&self, slot: u32) -> SubmitDesc {
        let gpa = self.ring_gpa()
            + RING_HEADER_SIZE_BYTES
            + u64::from(slot) * u64::from(SUBMIT_DESC_SIZE_BYTES);
        let bytes = self.mem_bytes(gpa, SubmitDesc::SIZE_BYTES);
        SubmitDesc::decode(bytes.as_slice().try_into().unwrap())
    }

    /// Decode the legacy ring entry in slot `slot`.
    pub fn legacy_entry(&self, slot: u32) -> LegacyRingEntry {
        let gpa = self.ring_gpa() + u64::from(slot) * u64::from(LEGACY_RING_ENTRY_SIZE_BYTES);
        let bytes = self.mem_bytes(gpa, LegacyRingEntry::SIZE_BYTES);
        LegacyRingEntry::decode(bytes.as_slice().try_into().unwrap())
    }

    pub fn ring_head_tail(&self) -> (u32, u32) {
        let gpa = self.ring_gpa();
        (
            self.mem_u32(gpa + RING_HEAD_OFFSET as u64),
            self.mem_u32(gpa + RING_TAIL_OFFSET as u64),
        )
    }

    pub fn notifications(&self) -> Vec<HostNotification> {
        self.state().notifications.clone()
    }

    pub fn faults(&self) -> Vec<HostNotification> {
        self.notifications()
            .into_iter()
            .filter(|n| matches!(n, HostNotification::DmaFaulted { .. }))
            .collect()
    }

    pub fn dpc_requests(&self) -> usize {
        self.state().dpc_requests
    }

    pub fn dpc_notifies(&self) -> usize {
        self.state().dpc_notifies
    }

    pub fn doorbells(&self) -> usize {
        self.state().doorbells
    }

    pub fn frees(&self) -> Vec<(u64, usize)> {
        self.state().frees.clone()
    }
}

fn reg(st: &FakeState, offset: u32) -> u32 {
    st.regs.get(&offset).copied().unwrap_or(0)
}

fn ring_base_regs(abi: AbiKind) -> (u32, u32) {
    match abi {
        AbiKind::Versioned => (versioned::RING_GPA_LO, versioned::RING_GPA_HI),
        AbiKind::Legacy => (legacy::RING_BASE_LO, legacy::RING_BASE_HI),
    }
}

impl RegisterBlock for FakeGpu {
    fn read_u32(&self, offset: u32) -> u32 {
        let st = self.state();
        if offset == st.abi.irq_status_offset() {
            return st.irq_status;
        }
        reg(&st, offset)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        let mut st = self.state();
        if offset == st.abi.irq_ack_offset() {
            st.irq_status &= !value;
            return;
        }
        let doorbell = match st.abi {
            AbiKind::Versioned => versioned::DOORBELL,
            AbiKind::Legacy => legacy::RING_DOORBELL,
        };
        if offset == doorbell {
            st.doorbells += 1;
            return;
        }
        let (lo, hi) = ring_base_regs(st.abi);
        if st.pinned_ring_base && (offset == lo || offset == hi) {
            return;
        }
        st.regs.insert(offset, value);
    }
}

impl SharedMemory for FakeGpu {
    fn read_physical(&self, gpa: u64, buf: &mut [u8]) {
        let mem = self.mem.lock().unwrap();
        let start = gpa as usize;
        buf.copy_from_slice(&mem[start..start + buf.len()]);
    }

    fn write_physical(&self, gpa: u64, buf: &[u8]) {
        let mut mem = self.mem.lock().unwrap();
        let start = gpa as usize;
        mem[start..start + buf.len()].copy_from_slice(buf);
    }
}

impl ContiguousAllocator for FakeGpu {
    fn allocate(&self, size_bytes: usize) -> Option<u64> {
        let mut st = self.state();
        if st.fail_allocations {
            return None;
        }
        let gpa = st.next_alloc;
        let end = gpa + (size_bytes as u64).div_ceil(PAGE) * PAGE;
        if end as usize > MEM_SIZE {
            return None;
        }
        st.next_alloc = end;
        drop(st);
        // Recycled guest memory is not guaranteed to be clean; the contract is zeroed memory.
        self.zero(gpa, size_bytes);
        Some(gpa)
    }

    fn free(&self, gpa: u64, size_bytes: usize) {
        self.state().frees.push((gpa, size_bytes));
    }
}

impl HostCallbacks for FakeGpu {
    fn notify_interrupt(&self, notification: HostNotification) {
        self.state().notifications.push(notification);
    }

    fn queue_dpc(&self) {
        self.state().dpc_requests += 1;
    }

    fn notify_dpc(&self) {
        self.state().dpc_notifies += 1;
    }
}

/// Run one interrupt through both halves, the way the host would.
pub fn service_interrupt(dev: &DeviceCore) -> bool {
    let claimed = dev.interrupt_routine();
    dev.dpc_routine();
    claimed
}

pub fn alloc(alloc_id: u32) -> aerogpu_kmd::AllocationRef {
    aerogpu_kmd::AllocationRef {
        alloc_id,
        flags: protocol::AEROGPU_ALLOC_FLAG_READONLY,
        gpa: 0x20_0000 + u64::from(alloc_id) * 0x1000,
        size_bytes: 0x1000,
    }
}
