//! `DeviceCore`: the per-device aggregate tying the ring, fences, registry, interrupt handling and
//! recovery together.
//!
//! Three concurrency domains call in:
//! - thread context: [`DeviceCore::submit`], [`DeviceCore::submit_internal`], lifecycle,
//!   recovery and power transitions, [`DeviceCore::wait_for_resource_idle`];
//! - the interrupt top half: [`DeviceCore::interrupt_routine`];
//! - the deferred bottom half: [`DeviceCore::dpc_routine`].
//!
//! Lock order is always registry, then ring. The top half never blocks: it only `try_lock`s the
//! registry to name a faulted fence, the fault slot and the deferred-event queue.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;

use tracing::{debug, error, info, trace, warn};

use crate::config::KmdConfig;
use crate::error::{KmdError, KmdResult, RingError};
use crate::fence::{CompletedFenceSource, FenceDomain, FenceEpoch};
use crate::gate::{PowerState, SubmissionGate};
use crate::host::{
    AllocationListClassifier, CmdStreamClassifier, HostCallbacks, HostNotification, SubmitArgs,
};
use crate::irq::{self, DeferredEvent, DeferredQueue, VblankAnchor, VblankState};
use crate::pool::{ContigBuffer, ContigPool, PoolStats};
use crate::protocol::{self, FencePage, RingHeader, SubmitFlags};
use crate::recovery::{RecoveryMachine, RecoveryState, RecoveryStats};
use crate::registry::{InternalRecord, PendingRegistry, SubmissionRecord};
use crate::regs::{self, legacy, versioned, AbiKind, FeatureBits, IrqBits, RegisterBlock};
use crate::ring::{FenceRequest, LegacyRing, RingPayload, RingTransport, VersionedRing};
use crate::shared_mem::{ContiguousAllocator, SharedMemory};
use crate::stats::{KmdStats, KmdStatsSnapshot};
use crate::submission_log::{SubmissionLog, SubmissionLogEntry};

const ABI_NONE: u8 = 0;
const ABI_LEGACY: u8 = 1;
const ABI_VERSIONED: u8 = 2;

/// Everything the core needs from the outside world.
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterBlock>,
    pub mem: Arc<dyn SharedMemory>,
    pub allocator: Arc<dyn ContiguousAllocator>,
    pub host: Arc<dyn HostCallbacks>,
    pub classifier: Arc<dyn CmdStreamClassifier>,
}

impl Platform {
    pub fn new(
        regs: Arc<dyn RegisterBlock>,
        mem: Arc<dyn SharedMemory>,
        allocator: Arc<dyn ContiguousAllocator>,
        host: Arc<dyn HostCallbacks>,
    ) -> Self {
        Self {
            regs,
            mem,
            allocator,
            host,
            classifier: Arc::new(AllocationListClassifier),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn CmdStreamClassifier>) -> Self {
        self.classifier = classifier;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub fence: u64,
    pub ring_position: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    Blocking,
    NonBlocking,
}

/// Answer to the "query device" escape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub abi: AbiKind,
    pub mmio_version: u32,
    pub features: FeatureBits,
    pub ring_entry_count: u32,
    pub fence_page: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetSummary {
    /// Completed fence after the reset (everything submitted so far).
    pub completed_fence: u64,
    /// Pending, internal and retired records dropped.
    pub drained: usize,
    /// Idle pool bytes returned to the backing allocator.
    pub trimmed_bytes: usize,
}

/// Last fault reported through the error interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    pub fence: u64,
    pub error_code: u32,
}

pub struct DeviceCore {
    cfg: KmdConfig,
    platform: Platform,
    pool: ContigPool,
    gate: SubmissionGate,
    fences: FenceDomain,
    registry: Mutex<PendingRegistry>,
    ring: Mutex<Option<RingTransport>>,
    fence_page: Mutex<Option<ContigBuffer>>,
    info: Mutex<Option<DeviceInfo>>,
    abi: AtomicU8,
    features: AtomicU64,
    fence_page_gpa: AtomicU64,
    irq_enabled: AtomicU32,
    last_fault: Mutex<Option<FaultInfo>>,
    deferred: DeferredQueue,
    vblank: VblankState,
    recovery: RecoveryMachine,
    log: SubmissionLog,
    stats: KmdStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DeviceCore {
    /// Attach: build every component with the gate closed. Nothing touches the device until
    /// [`DeviceCore::start`].
    pub fn new(cfg: KmdConfig, platform: Platform) -> KmdResult<Self> {
        cfg.validate()?;
        let pool = ContigPool::new(
            cfg.pool.clone(),
            platform.allocator.clone(),
            platform.mem.clone(),
        );
        Ok(Self {
            registry: Mutex::new(PendingRegistry::new(
                cfg.retired_max_count,
                cfg.retired_max_bytes,
            )),
            deferred: DeferredQueue::new(cfg.deferred_queue_len),
            log: SubmissionLog::new(cfg.submission_log_len),
            pool,
            gate: SubmissionGate::new(),
            fences: FenceDomain::new(),
            ring: Mutex::new(None),
            fence_page: Mutex::new(None),
            info: Mutex::new(None),
            abi: AtomicU8::new(ABI_NONE),
            features: AtomicU64::new(0),
            fence_page_gpa: AtomicU64::new(0),
            irq_enabled: AtomicU32::new(0),
            last_fault: Mutex::new(None),
            vblank: VblankState::default(),
            recovery: RecoveryMachine::new(),
            stats: KmdStats::new(),
            cfg,
            platform,
        })
    }

    fn regs(&self) -> &dyn RegisterBlock {
        &*self.platform.regs
    }

    fn mem(&self) -> &dyn SharedMemory {
        &*self.platform.mem
    }

    fn abi(&self) -> Option<AbiKind> {
        match self.abi.load(Ordering::Acquire) {
            ABI_LEGACY => Some(AbiKind::Legacy),
            ABI_VERSIONED => Some(AbiKind::Versioned),
            _ => None,
        }
    }

    fn features(&self) -> FeatureBits {
        FeatureBits::from_bits_truncate(self.features.load(Ordering::Acquire))
    }

    fn fence_source(&self) -> Option<CompletedFenceSource> {
        match self.abi()? {
            AbiKind::Legacy => Some(CompletedFenceSource::LegacyRegister),
            AbiKind::Versioned => match self.fence_page_gpa.load(Ordering::Acquire) {
                0 => Some(CompletedFenceSource::Registers),
                gpa => Some(CompletedFenceSource::FencePage { gpa }),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the device: detect the ABI, allocate and program the ring (and fence page), enable
    /// interrupts and open the submission gate.
    pub fn start(&self) -> KmdResult<DeviceInfo> {
        if self.recovery.state() != RecoveryState::Stopped {
            return Err(KmdError::InvalidParameter("device already started"));
        }
        let regs = self.regs();
        let mem = self.mem();

        let magic = regs.read_u32(versioned::MAGIC);
        let abi = AbiKind::detect(magic).ok_or(RingError::UnknownDevice { found: magic })?;
        let (mmio_version, features) = match abi {
            AbiKind::Legacy => (
                regs.read_u32(legacy::VERSION),
                regs::read_features(regs, legacy::FEATURES_LO, legacy::FEATURES_HI),
            ),
            AbiKind::Versioned => {
                let version = regs.read_u32(versioned::ABI_VERSION);
                let major = versioned::abi_major(version);
                if major != versioned::ABI_MAJOR {
                    return Err(RingError::UnsupportedMajor { found: major }.into());
                }
                (
                    version,
                    regs::read_features(regs, versioned::FEATURES_LO, versioned::FEATURES_HI),
                )
            }
        };

        let entry_count = self.cfg.ring_entry_count;
        let epoch = FenceEpoch::resume_from(self.fences.submitted());
        let mut ring = match abi {
            AbiKind::Legacy => {
                let buf = self
                    .pool
                    .acquire(LegacyRing::required_size(entry_count) as usize, true)?;
                RingTransport::Legacy(LegacyRing::new(buf, entry_count, epoch))
            }
            AbiKind::Versioned => {
                let buf = self
                    .pool
                    .acquire(RingHeader::required_size(entry_count) as usize, true)?;
                RingTransport::Versioned(VersionedRing::new(buf, entry_count, epoch))
            }
        };

        let use_fence_page = abi == AbiKind::Versioned
            && self.cfg.prefer_fence_page
            && features.contains(FeatureBits::FENCE_PAGE);
        let fence_page = if use_fence_page {
            match self.pool.acquire(FencePage::SIZE_BYTES, true) {
                Ok(buf) => {
                    let page = FencePage {
                        completed_fence: self.fences.completed(),
                        ..FencePage::new()
                    };
                    mem.write_physical(buf.gpa, &page.encode());
                    regs::write_u64_lo_hi(
                        regs,
                        versioned::FENCE_GPA_LO,
                        versioned::FENCE_GPA_HI,
                        buf.gpa,
                    );
                    Some(buf)
                }
                Err(err) => {
                    self.pool.release(ring.buffer());
                    return Err(err);
                }
            }
        } else {
            None
        };

        {
            let mut guard = lock(&self.ring);
            ring.program(regs, mem);
            let checked = ring
                .validate(regs, mem)
                .and_then(|_| ring.verify_programming(regs));
            if let Err(err) = checked {
                error!(error = %err, "ring failed validation after programming");
                ring.disable(regs);
                self.pool.release(ring.buffer());
                if let Some(buf) = fence_page {
                    self.pool.release(buf);
                }
                return Err(err.into());
            }
            *guard = Some(ring);
        }

        let info = DeviceInfo {
            abi,
            mmio_version,
            features,
            ring_entry_count: entry_count,
            fence_page: fence_page.is_some(),
        };
        *lock(&self.fence_page) = fence_page;
        *lock(&self.info) = Some(info);
        self.fence_page_gpa
            .store(fence_page.map_or(0, |buf| buf.gpa), Ordering::Release);
        self.features.store(features.bits(), Ordering::Release);
        self.abi.store(
            match abi {
                AbiKind::Legacy => ABI_LEGACY,
                AbiKind::Versioned => ABI_VERSIONED,
            },
            Ordering::Release,
        );

        let _ = self.recovery.transition(RecoveryState::Running);
        self.gate.clear_error_latch();
        self.set_irq_enable(self.default_irq_mask());
        self.gate.open();

        info!(
            ?abi,
            mmio_version = format_args!("{mmio_version:#010x}"),
            ?features,
            entry_count,
            "device started"
        );
        Ok(info)
    }

    /// Stop the device and release every device-visible buffer.
    pub fn stop(&self) {
        if self.recovery.state() == RecoveryState::Stopped {
            return;
        }
        self.gate.close();
        self.set_irq_enable(IrqBits::empty());

        let ring = {
            let mut registry = lock(&self.registry);
            let mut guard = lock(&self.ring);
            let ring = guard.take();
            if let Some(ring) = &ring {
                ring.disable(self.regs());
            }
            self.fences.complete_all();
            registry.drain_all(&self.pool);
            ring
        };
        self.abi.store(ABI_NONE, Ordering::Release);
        self.fence_page_gpa.store(0, Ordering::Release);
        self.deferred.drain();

        if let Some(ring) = ring {
            self.pool.release(ring.buffer());
        }
        if let Some(page) = lock(&self.fence_page).take() {
            regs::write_u64_lo_hi(self.regs(), versioned::FENCE_GPA_LO, versioned::FENCE_GPA_HI, 0);
            self.pool.release(page);
        }
        *lock(&self.info) = None;

        let _ = self.recovery.transition(RecoveryState::Stopped);
        let trimmed = self.pool.trim();
        info!(trimmed, "device stopped");
    }

    pub fn query_device(&self) -> KmdResult<DeviceInfo> {
        (*lock(&self.info)).ok_or(KmdError::NotReady)
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    /// Push one host submission onto the ring.
    pub fn submit(&self, args: &SubmitArgs<'_>) -> KmdResult<SubmitReceipt> {
        if let Err(err) = self.gate.check() {
            self.stats.inc_rejected_not_ready();
            return Err(err);
        }
        let abi = self.abi().ok_or(KmdError::NotReady)?;

        let mut buffers = Vec::new();
        let result = self.stage_and_push(abi, args, &mut buffers);
        if let Err(err) = &result {
            for buf in buffers {
                self.pool.release(buf);
            }
            self.note_submit_failure(err);
        }
        result
    }

    fn stage_and_push(
        &self,
        abi: AbiKind,
        args: &SubmitArgs<'_>,
        buffers: &mut Vec<ContigBuffer>,
    ) -> KmdResult<SubmitReceipt> {
        let mem = self.mem();
        let cmd_len = u32::try_from(args.cmd_stream.len())
            .map_err(|_| KmdError::InvalidParameter("command stream too large"))?;
        let cmd = if cmd_len == 0 {
            None
        } else {
            let buf = self.pool.acquire(args.cmd_stream.len(), false)?;
            mem.write_physical(buf.gpa, args.cmd_stream);
            buffers.push(buf);
            Some((buf.gpa, cmd_len))
        };

        let payload = match abi {
            AbiKind::Versioned => {
                let alloc_table = if self
                    .platform
                    .classifier
                    .needs_alloc_table(args.cmd_stream, args.allocations)
                {
                    let table = protocol::encode_alloc_table(args.allocations)?;
                    let buf = self.pool.acquire(table.len(), false)?;
                    mem.write_physical(buf.gpa, &table);
                    buffers.push(buf);
                    Some((buf.gpa, table.len() as u32))
                } else {
                    None
                };
                RingPayload::Versioned {
                    flags: args.flags,
                    context_id: args.context_id,
                    engine_id: args.engine_id,
                    cmd,
                    alloc_table,
                }
            }
            AbiKind::Legacy => {
                let (dma_gpa, dma_size) = cmd.unwrap_or((0, 0));
                let desc = protocol::encode_legacy_submission(
                    args.kind,
                    args.fence,
                    dma_gpa,
                    dma_size,
                    args.allocations,
                )?;
                let buf = self.pool.acquire(desc.len(), false)?;
                mem.write_physical(buf.gpa, &desc);
                buffers.push(buf);
                RingPayload::Legacy {
                    kind: args.kind,
                    desc_gpa: buf.gpa,
                    desc_size: desc.len() as u32,
                }
            }
        };

        // Held across the push so the bottom half cannot look for this record before it exists.
        let mut registry = lock(&self.registry);
        let outcome = {
            let mut guard = lock(&self.ring);
            // The gate may have closed while the buffers were being staged.
            self.gate.check()?;
            let ring = guard.as_mut().ok_or(KmdError::NotReady)?;
            ring.push(
                self.regs(),
                mem,
                &self.fences,
                FenceRequest::Host(args.fence),
                payload,
            )?
        };
        registry.insert(SubmissionRecord {
            fence: outcome.fence,
            kind: args.kind,
            ring_position: outcome.ring_position,
            alloc_ids: args.allocations.iter().map(|a| a.alloc_id).collect(),
            buffers: std::mem::take(buffers),
        });
        drop(registry);

        self.stats.inc_submissions();
        self.log
            .record(outcome.fence, args.kind, args.cmd_stream.len());
        Ok(SubmitReceipt {
            fence: outcome.fence,
            ring_position: outcome.ring_position,
        })
    }

    /// Push a driver-originated message, ordered after everything submitted so far.
    ///
    /// It re-signals the current submitted fence without an interrupt and is retired once the
    /// device head passes it. Only the versioned ring can carry these.
    pub fn submit_internal(&self, cmd_stream: &[u8]) -> KmdResult<SubmitReceipt> {
        if let Err(err) = self.gate.check() {
            self.stats.inc_rejected_not_ready();
            return Err(err);
        }
        match self.abi() {
            None => return Err(KmdError::NotReady),
            Some(AbiKind::Legacy) => {
                return Err(KmdError::Unsupported(
                    "internal submissions on the legacy ring",
                ))
            }
            Some(AbiKind::Versioned) => {}
        }
        if cmd_stream.is_empty() {
            return Err(KmdError::InvalidParameter("empty internal submission"));
        }
        let cmd_len = u32::try_from(cmd_stream.len())
            .map_err(|_| KmdError::InvalidParameter("command stream too large"))?;

        let buf = self.pool.acquire(cmd_stream.len(), false)?;
        self.mem().write_physical(buf.gpa, cmd_stream);

        let mut registry = lock(&self.registry);
        let pushed = {
            let mut guard = lock(&self.ring);
            self.gate.check().and_then(|()| {
                let ring = guard.as_mut().ok_or(KmdError::NotReady)?;
                ring.push(
                    self.regs(),
                    self.mem(),
                    &self.fences,
                    FenceRequest::Current,
                    RingPayload::Versioned {
                        flags: SubmitFlags::empty(),
                        context_id: 0,
                        engine_id: 0,
                        cmd: Some((buf.gpa, cmd_len)),
                        alloc_table: None,
                    },
                )
            })
        };
        let outcome = match pushed {
            Ok(outcome) => outcome,
            Err(err) => {
                drop(registry);
                self.pool.release(buf);
                self.note_submit_failure(&err);
                return Err(err);
            }
        };
        registry.insert_internal(InternalRecord {
            fence: outcome.fence,
            ring_position: outcome.ring_position,
            buffers: vec![buf],
        });
        drop(registry);

        self.stats.inc_internal_submissions();
        Ok(SubmitReceipt {
            fence: outcome.fence,
            ring_position: outcome.ring_position,
        })
    }

    fn note_submit_failure(&self, err: &KmdError) {
        match err {
            KmdError::Backpressure => self.stats.inc_backpressure(),
            KmdError::NotReady | KmdError::DeviceRemoved => self.stats.inc_rejected_not_ready(),
            KmdError::InvariantViolation(ring_err) => self.note_invariant_violation(*ring_err),
            _ => {}
        }
    }

    /// Corrupted ring geometry: stop admitting work and leave the device disabled until the
    /// host runs a reset/restart cycle.
    fn note_invariant_violation(&self, err: RingError) {
        self.stats.inc_invariant_violations();
        self.gate.close();
        if self.recovery.transition(RecoveryState::Disabled).is_ok() {
            error!(error = %err, "ring invariant violated, submissions disabled");
        } else {
            warn!(error = %err, "ring invariant violated");
        }
    }

    // -------------------------------------------------------------------------
    // Interrupts
    // -------------------------------------------------------------------------

    fn default_irq_mask(&self) -> IrqBits {
        match self.abi() {
            None => IrqBits::empty(),
            Some(AbiKind::Legacy) => IrqBits::FENCE,
            Some(AbiKind::Versioned) => {
                let mut mask = IrqBits::FENCE;
                // A latched error stays masked until restart clears the latch.
                if !self.gate.is_error_latched() {
                    mask |= IrqBits::ERROR;
                }
                if self.vblank.has_waiters() && self.features().contains(FeatureBits::VBLANK) {
                    mask |= IrqBits::SCANOUT_VBLANK;
                }
                mask
            }
        }
    }

    fn write_irq_enable(&self) {
        if self.abi() == Some(AbiKind::Versioned) {
            // Always write the latest value so concurrent updaters converge.
            self.regs()
                .write_u32(versioned::IRQ_ENABLE, self.irq_enabled.load(Ordering::Acquire));
        }
    }

    fn set_irq_enable(&self, bits: IrqBits) {
        self.irq_enabled.store(bits.bits(), Ordering::Release);
        self.write_irq_enable();
    }

    fn mask_irq(&self, bits: IrqBits) {
        self.irq_enabled.fetch_and(!bits.bits(), Ordering::AcqRel);
        self.write_irq_enable();
    }

    fn unmask_irq(&self, bits: IrqBits) {
        self.irq_enabled.fetch_or(bits.bits(), Ordering::AcqRel);
        self.write_irq_enable();
    }

    pub fn irq_enabled(&self) -> IrqBits {
        IrqBits::from_bits_retain(self.irq_enabled.load(Ordering::Acquire))
    }

    fn request_dpc(&self) {
        if self.deferred.request_dpc() {
            self.platform.host.queue_dpc();
        }
    }

    /// Interrupt top half. Returns whether the interrupt was claimed.
    pub fn interrupt_routine(&self) -> bool {
        let Some(abi) = self.abi() else {
            return false;
        };
        let regs = self.regs();
        let status = regs.read_u32(abi.irq_status_offset());
        let enabled = self.irq_enabled.load(Ordering::Acquire);
        let class = irq::classify(status, enabled, abi.known_irq_bits());

        if class.ack != 0 {
            regs.write_u32(abi.irq_ack_offset(), class.ack);
        }
        if !class.claim {
            if status != 0 {
                self.stats.inc_interrupts_declined();
                trace!(status, enabled, "declined interrupt");
            }
            return false;
        }
        self.stats.inc_interrupts_claimed();
        if class.spurious != 0 {
            self.stats.inc_spurious_interrupts();
            trace!(bits = class.spurious, "spurious interrupt bits");
        }

        let mut want_dpc = false;
        if class.handled.contains(IrqBits::FENCE) {
            let completed = self.poll_completed_fence();
            self.platform
                .host
                .notify_interrupt(HostNotification::DmaCompleted { fence: completed });
            want_dpc = true;
        }
        if class.handled.contains(IrqBits::ERROR) {
            want_dpc |= self.handle_error_interrupt();
        }
        if class.handled.contains(IrqBits::SCANOUT_VBLANK) {
            let seq = self.record_vblank();
            if self.vblank.has_waiters() {
                self.deferred.push(DeferredEvent::Vblank { seq });
                want_dpc = true;
            }
        }
        if want_dpc {
            self.request_dpc();
        }
        true
    }

    /// Returns whether the bottom half has new work.
    fn handle_error_interrupt(&self) -> bool {
        if !self.gate.latch_error() {
            trace!("error interrupt while already latched");
            return false;
        }
        // Stays masked until a restart re-arms it.
        self.mask_irq(IrqBits::ERROR);

        let fault = self.faulted_fence();
        // The bottom half records the fault from its event if the slot is busy right now.
        match self.last_fault.try_lock() {
            Ok(mut slot) => *slot = Some(fault),
            Err(TryLockError::Poisoned(poisoned)) => *poisoned.into_inner() = Some(fault),
            Err(TryLockError::WouldBlock) => {}
        }

        let count = self.stats.inc_error_interrupts();
        if irq::should_report_error(count, self.cfg.error_notify_burst) {
            self.stats.inc_error_notifications();
            warn!(
                fence = fault.fence,
                error_code = fault.error_code,
                count,
                "device reported an error"
            );
            self.platform
                .host
                .notify_interrupt(HostNotification::DmaFaulted {
                    fence: fault.fence,
                    error_code: fault.error_code,
                });
        }
        self.deferred.push(DeferredEvent::Faulted {
            fence: fault.fence,
            error_code: fault.error_code,
        });
        true
    }

    fn faulted_fence(&self) -> FaultInfo {
        let completed = self.fences.completed();
        let submitted = self.fences.submitted();
        let regs = self.regs();

        let mut error_code = 0;
        if self.features().contains(FeatureBits::ERROR_INFO) {
            error_code = regs.read_u32(versioned::ERROR_CODE);
            let reported = regs::read_u64_hi_lo_hi(
                regs,
                versioned::ERROR_FENCE_LO,
                versioned::ERROR_FENCE_HI,
                self.cfg.fence_read_retries,
            );
            if let Some(fence) = reported.filter(|&f| f > completed && f <= submitted) {
                return FaultInfo { fence, error_code };
            }
        }

        let next_pending = match self.registry.try_lock() {
            Ok(registry) => registry.next_pending_fence(completed),
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().next_pending_fence(completed)
            }
            Err(TryLockError::WouldBlock) => None,
        };
        FaultInfo {
            fence: next_pending.unwrap_or(completed + 1),
            error_code,
        }
    }

    fn record_vblank(&self) -> u64 {
        let regs = self.regs();
        let retries = self.cfg.fence_read_retries;
        let seq = regs::read_u64_hi_lo_hi(
            regs,
            versioned::SCANOUT0_VBLANK_SEQ_LO,
            versioned::SCANOUT0_VBLANK_SEQ_HI,
            retries,
        );
        let time_ns = regs::read_u64_hi_lo_hi(
            regs,
            versioned::SCANOUT0_VBLANK_TIME_NS_LO,
            versioned::SCANOUT0_VBLANK_TIME_NS_HI,
            retries,
        );
        if let (Some(seq), Some(time_ns)) = (seq, time_ns) {
            self.vblank.record(VblankAnchor {
                seq,
                time_ns,
                period_ns: regs.read_u32(versioned::SCANOUT0_VBLANK_PERIOD_NS),
            });
            self.stats.inc_vblanks();
        }
        self.vblank.anchor().seq
    }

    /// Interrupt bottom half: forward deferred events, report progress, retire finished work.
    pub fn dpc_routine(&self) {
        self.deferred.begin_dpc();
        for event in self.deferred.drain() {
            match event {
                DeferredEvent::Vblank { seq } => self
                    .platform
                    .host
                    .notify_interrupt(HostNotification::Vblank { seq }),
                DeferredEvent::Faulted { fence, error_code } => {
                    debug!(fence, error_code, "fault pending recovery");
                    *lock(&self.last_fault) = Some(FaultInfo { fence, error_code });
                }
            }
        }
        self.platform.host.notify_dpc();
        self.retire_completed();
    }

    fn retire_completed(&self) {
        let completed = self.fences.completed();
        let mut registry = lock(&self.registry);
        let summary = registry.retire_up_to(completed, &self.pool);
        self.stats.add_retired(summary.total());

        if registry.internal_len() == 0 {
            return;
        }
        let guard = lock(&self.ring);
        let Some(ring) = guard.as_ref() else {
            return;
        };
        match ring.validate(self.regs(), self.mem()) {
            Ok(snapshot) => {
                let retired = registry.retire_internal(snapshot.head, &self.pool);
                self.stats.add_internal_retired(retired);
            }
            Err(err) => self.note_invariant_violation(err),
        }
    }

    /// Read the device's completed fence, advance the cached value and return it.
    pub fn poll_completed_fence(&self) -> u64 {
        let Some(source) = self.fence_source() else {
            return self.fences.completed();
        };
        match source.read(
            self.regs(),
            self.mem(),
            &self.fences,
            self.cfg.fence_read_retries,
        ) {
            Some(observed) => self.fences.advance_completed(observed),
            None => self.fences.completed(),
        }
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// First half of timeout recovery: close the gate, silence the device, empty the ring and
    /// declare everything submitted as completed. Safe to call repeatedly.
    pub fn reset_from_timeout(&self) -> KmdResult<ResetSummary> {
        self.recovery
            .transition(RecoveryState::ResetRequested)
            .map_err(|_| KmdError::NotReady)?;
        warn!("resetting device after timeout");

        self.gate.close();
        self.set_irq_enable(IrqBits::empty());

        let (completed_fence, drained) = {
            let mut registry = lock(&self.registry);
            let mut guard = lock(&self.ring);
            if let Some(ring) = guard.as_mut() {
                // A ring that fails validation is left untouched; restart reprograms it.
                if let Err(err) = ring.reset_to_empty(self.regs(), self.mem()) {
                    self.stats.inc_invariant_violations();
                    warn!(error = %err, "ring invalid at reset, leaving it for restart");
                }
            }
            let completed = self.fences.complete_all();
            (completed, registry.drain_all(&self.pool))
        };
        self.deferred.drain();
        self.platform
            .host
            .notify_interrupt(HostNotification::DmaCompleted {
                fence: completed_fence,
            });
        self.request_dpc();

        let _ = self.recovery.transition(RecoveryState::Quiesced);
        let trimmed_bytes = self.pool.trim();
        info!(completed_fence, drained, trimmed_bytes, "device quiesced");
        Ok(ResetSummary {
            completed_fence,
            drained,
            trimmed_bytes,
        })
    }

    /// Second half of timeout recovery: re-establish the ring, re-arm interrupts (clearing the
    /// error latch), then reopen the gate. A ring that cannot be re-validated leaves the device
    /// `Disabled`.
    pub fn restart_from_timeout(&self) -> KmdResult<()> {
        match self.recovery.state() {
            RecoveryState::Running => return Ok(()),
            RecoveryState::Quiesced => {}
            _ => return Err(KmdError::NotReady),
        }
        self.recovery
            .transition(RecoveryState::Restarting)
            .map_err(|_| KmdError::NotReady)?;

        if let Err(err) = self.reestablish_ring() {
            self.stats.inc_invariant_violations();
            let _ = self.recovery.transition(RecoveryState::Disabled);
            error!(error = %err, "restart failed, device disabled");
            return Err(err.into());
        }

        self.gate.clear_error_latch();
        self.set_irq_enable(self.default_irq_mask());
        self.gate.open();
        let _ = self.recovery.transition(RecoveryState::Running);
        info!("device restarted");
        Ok(())
    }

    /// Validate the ring; if it fails, reprogram it once and validate again.
    ///
    /// Reprogramming discards every queued entry, so whatever was still in flight is completed
    /// and drained first, exactly as a reset would.
    fn reestablish_ring(&self) -> Result<(), RingError> {
        let regs = self.regs();
        let mem = self.mem();
        let completed_before = self.fences.completed();

        let (outcome, lost) = {
            let mut registry = lock(&self.registry);
            let mut guard = lock(&self.ring);
            let ring = guard.as_mut().ok_or(RingError::NotMapped)?;

            let checked = ring
                .validate(regs, mem)
                .and_then(|_| ring.verify_programming(regs));
            match checked {
                Ok(()) => (Ok(()), None),
                Err(err) => {
                    warn!(error = %err, "ring state lost, reprogramming");
                    let completed = self.fences.complete_all();
                    let drained = registry.drain_all(&self.pool);

                    ring.program(regs, mem);
                    let fence_page_gpa = self.fence_page_gpa.load(Ordering::Acquire);
                    if fence_page_gpa != 0 {
                        regs::write_u64_lo_hi(
                            regs,
                            versioned::FENCE_GPA_LO,
                            versioned::FENCE_GPA_HI,
                            fence_page_gpa,
                        );
                    }
                    let outcome = ring
                        .validate(regs, mem)
                        .and_then(|_| ring.verify_programming(regs));
                    (outcome, Some((completed, drained)))
                }
            }
        };

        if let Some((completed_fence, drained)) = lost {
            if drained != 0 {
                info!(completed_fence, drained, "dropped in-flight work with the lost ring");
            }
            if completed_fence > completed_before {
                self.platform
                    .host
                    .notify_interrupt(HostNotification::DmaCompleted {
                        fence: completed_fence,
                    });
            }
        }
        outcome
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery.stats()
    }

    // -------------------------------------------------------------------------
    // Power
    // -------------------------------------------------------------------------

    /// Apply a host power transition. Returning to D0 re-validates the ring before any new work
    /// is admitted.
    pub fn set_power_state(&self, state: PowerState) -> KmdResult<()> {
        if state != PowerState::D0 {
            let prev = self.gate.set_power(state);
            if prev == PowerState::D0 {
                self.set_irq_enable(IrqBits::empty());
            }
            info!(from = ?prev, to = ?state, "power state change");
            return Ok(());
        }

        let was_accepting = self.gate.is_accepting();
        self.gate.close();
        let prev = self.gate.set_power(PowerState::D0);
        info!(from = ?prev, to = ?state, "power state change");
        if self.recovery.state() != RecoveryState::Running {
            return Ok(());
        }
        if prev != PowerState::D0 {
            if let Err(err) = self.reestablish_ring() {
                self.note_invariant_violation(err);
                return Err(err.into());
            }
            self.set_irq_enable(self.default_irq_mask());
        }
        if was_accepting || prev != PowerState::D0 {
            self.gate.open();
        }
        Ok(())
    }

    pub fn power_state(&self) -> PowerState {
        self.gate.power()
    }

    // -------------------------------------------------------------------------
    // Resource residency
    // -------------------------------------------------------------------------

    /// Highest in-flight fence referencing `alloc_id`, or `None` if it is idle.
    pub fn resource_busy_fence(&self, alloc_id: u32) -> Option<u64> {
        let completed = self.poll_completed_fence();
        lock(&self.registry).busy_fence(alloc_id, completed)
    }

    /// Wait until no in-flight submission references `alloc_id`.
    ///
    /// Non-blocking callers get `Busy` immediately. Blocking callers poll the completed fence at
    /// `idle_poll_interval` and give up if the device faults or leaves its running state.
    pub fn wait_for_resource_idle(&self, alloc_id: u32, mode: WaitMode) -> KmdResult<()> {
        let Some(busy) = self.resource_busy_fence(alloc_id) else {
            return Ok(());
        };
        if mode == WaitMode::NonBlocking {
            return Err(KmdError::Busy { fence: busy });
        }
        loop {
            if self.poll_completed_fence() >= busy {
                return Ok(());
            }
            if self.gate.is_error_latched() {
                return Err(KmdError::DeviceRemoved);
            }
            if self.gate.power() != PowerState::D0
                || self.recovery.state() != RecoveryState::Running
            {
                return Err(KmdError::NotReady);
            }
            thread::sleep(self.cfg.idle_poll_interval);
        }
    }

    // -------------------------------------------------------------------------
    // Vblank
    // -------------------------------------------------------------------------

    pub fn register_vblank_waiter(&self) {
        if self.vblank.add_waiter() == 1
            && self.abi() == Some(AbiKind::Versioned)
            && self.features().contains(FeatureBits::VBLANK)
            && self.recovery.state() == RecoveryState::Running
        {
            self.unmask_irq(IrqBits::SCANOUT_VBLANK);
        }
    }

    pub fn unregister_vblank_waiter(&self) {
        if self.vblank.remove_waiter() == 0 {
            self.mask_irq(IrqBits::SCANOUT_VBLANK);
        }
    }

    pub fn vblank_anchor(&self) -> VblankAnchor {
        self.vblank.anchor()
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn submitted_fence(&self) -> u64 {
        self.fences.submitted()
    }

    pub fn completed_fence(&self) -> u64 {
        self.fences.completed()
    }

    pub fn is_error_latched(&self) -> bool {
        self.gate.is_error_latched()
    }

    pub fn is_accepting_submissions(&self) -> bool {
        self.gate.is_open()
    }

    pub fn last_fault(&self) -> Option<FaultInfo> {
        *lock(&self.last_fault)
    }

    pub fn pending_fences(&self) -> Vec<u64> {
        lock(&self.registry).pending_fences()
    }

    pub fn retired_fences(&self) -> Vec<u64> {
        lock(&self.registry).retired_fences()
    }

    pub fn internal_pending(&self) -> usize {
        lock(&self.registry).internal_len()
    }

    pub fn recent_submissions(&self) -> Vec<SubmissionLogEntry> {
        self.log.snapshot()
    }

    pub fn stats(&self) -> KmdStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn config(&self) -> &KmdConfig {
        &self.cfg
    }
}
