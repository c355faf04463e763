//! Interface to the host graphics framework.

use crate::protocol::SubmitFlags;

/// Interrupt-time notification delivered to the host framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostNotification {
    /// Every submission up to and including `fence` has finished.
    DmaCompleted { fence: u64 },
    /// The device faulted while executing `fence`. Distinct from completion so the host can
    /// surface a device-lost condition instead of waiting forever.
    DmaFaulted { fence: u64, error_code: u32 },
    Vblank { seq: u64 },
}

/// Callbacks into the host framework.
///
/// `notify_interrupt` and `queue_dpc` are invoked from the interrupt top half and must not
/// block; `notify_dpc` is invoked from the bottom half.
pub trait HostCallbacks: Send + Sync {
    fn notify_interrupt(&self, notification: HostNotification);
    /// Schedule the bottom half (`DeviceCore::dpc_routine`).
    fn queue_dpc(&self);
    /// Report forward progress from the bottom half.
    fn notify_dpc(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubmissionKind {
    Render,
    Present,
    Paging,
}

impl SubmissionKind {
    /// Type code carried in legacy submission descriptors.
    pub fn legacy_type(self) -> u32 {
        match self {
            SubmissionKind::Render => 1,
            SubmissionKind::Present => 2,
            SubmissionKind::Paging => 3,
        }
    }
}

/// One entry of the host-provided allocation list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationRef {
    pub alloc_id: u32,
    pub flags: u32,
    pub gpa: u64,
    pub size_bytes: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct SubmitArgs<'a> {
    /// Host-assigned fence; must advance on every submission.
    pub fence: u32,
    pub kind: SubmissionKind,
    pub context_id: u32,
    pub engine_id: u32,
    pub flags: SubmitFlags,
    /// Opaque command stream, copied into device-visible memory before the push.
    pub cmd_stream: &'a [u8],
    pub allocations: &'a [AllocationRef],
}

impl<'a> SubmitArgs<'a> {
    pub fn new(fence: u32, kind: SubmissionKind, cmd_stream: &'a [u8]) -> Self {
        let flags = match kind {
            SubmissionKind::Present => SubmitFlags::PRESENT,
            SubmissionKind::Render | SubmissionKind::Paging => SubmitFlags::empty(),
        };
        Self {
            fence,
            kind,
            context_id: 0,
            engine_id: 0,
            flags,
            cmd_stream,
            allocations: &[],
        }
    }

    pub fn with_allocations(mut self, allocations: &'a [AllocationRef]) -> Self {
        self.allocations = allocations;
        self
    }

    pub fn with_context(mut self, context_id: u32) -> Self {
        self.context_id = context_id;
        self
    }
}

/// Decides whether a command stream references allocations and therefore needs an allocation
/// table attached to its descriptor. The command encoding itself is opaque to this crate.
pub trait CmdStreamClassifier: Send + Sync {
    fn needs_alloc_table(&self, cmd_stream: &[u8], allocations: &[AllocationRef]) -> bool;
}

/// Attaches a table whenever the host supplied an allocation list.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationListClassifier;

impl CmdStreamClassifier for AllocationListClassifier {
    fn needs_alloc_table(&self, _cmd_stream: &[u8], allocations: &[AllocationRef]) -> bool {
        !allocations.is_empty()
    }
}

impl<F> CmdStreamClassifier for F
where
    F: Fn(&[u8], &[AllocationRef]) -> bool + Send + Sync,
{
    fn needs_alloc_table(&self, cmd_stream: &[u8], allocations: &[AllocationRef]) -> bool {
        self(cmd_stream, allocations)
    }
}
