//! Kernel submission interface.

use bitflags::bitflags;
use thiserror::Error;

use crate::bo::{BoEntry, BoHandle};

/// Hardware engine a command stream targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HwIp {
    Gfx,
    Compute,
    Dma,
}

impl HwIp {
    pub const COUNT: usize = 3;

    pub const fn index(self) -> usize {
        match self {
            Self::Gfx => 0,
            Self::Compute => 1,
            Self::Dma => 2,
        }
    }
}

/// Rings per engine addressable by a submit context.
pub const MAX_RINGS_PER_IP: u32 = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContextPriority {
    Low,
    #[default]
    Medium,
    High,
    Realtime,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IbFlags: u32 {
        const PREAMBLE = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IbDesc {
    pub va: u64,
    pub size_dw: u32,
    pub flags: IbFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimelinePoint {
    pub handle: u32,
    pub point: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitChunk {
    Ib { ip: HwIp, ring: u32, ib: IbDesc },
    /// The kernel writes the submission's sequence number here on completion.
    Fence { handle: BoHandle, offset: u64 },
    SyncobjIn(Vec<u32>),
    SyncobjOut(Vec<u32>),
    TimelineWait(Vec<TimelinePoint>),
    TimelineSignal(Vec<TimelinePoint>),
}

/// One kernel submission call.
#[derive(Clone, Copy, Debug)]
pub struct KernelSubmission<'a> {
    pub context: u32,
    pub bo_list: &'a [BoEntry],
    pub chunks: &'a [SubmitChunk],
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("kernel out of memory")]
    OutOfMemory,
    #[error("context cancelled")]
    Cancelled,
    #[error("request rejected (errno {errno})")]
    Rejected { errno: i32 },
}

/// The kernel GPU scheduler as seen by the winsys.
///
/// All calls are synchronous. Implementations must allow concurrent calls from different
/// threads; ordering between submissions to one ring is the kernel's business.
pub trait KernelDevice: Send + Sync {
    fn create_context(&self, priority: ContextPriority) -> Result<u32, KernelError>;
    fn destroy_context(&self, context: u32);

    /// Submits and returns the sequence number assigned on the addressed ring.
    fn submit(&self, submission: &KernelSubmission<'_>) -> Result<u64, KernelError>;

    /// Returns `true` when `seq` on `(ip, ring)` completed within the timeout.
    fn wait_fence(
        &self,
        context: u32,
        ip: HwIp,
        ring: u32,
        seq: u64,
        timeout_ns: u64,
    ) -> Result<bool, KernelError>;

    fn supports_timeline_syncobj(&self) -> bool;
    fn syncobj_create(&self, signaled: bool) -> Result<u32, KernelError>;
    fn syncobj_destroy(&self, handle: u32);
    fn syncobj_reset(&self, handles: &[u32]) -> Result<(), KernelError>;
    /// Copies the fence at `src_point` of `src` into `dst_point` of `dst`.
    fn syncobj_transfer(
        &self,
        dst: u32,
        dst_point: u64,
        src: u32,
        src_point: u64,
    ) -> Result<(), KernelError>;
}
