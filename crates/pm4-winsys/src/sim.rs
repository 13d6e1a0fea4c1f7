//! In-process allocator and kernel.
//!
//! [`SimAllocator`] hands out buffers from a flat address space with an optional byte
//! budget. [`SimKernel`] records every call it receives and completes submissions
//! immediately. Both support failure injection so error paths can be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::bo::{Bo, BoAllocator, BoDesc, BoEntry, BoFlags, BoHandle};
use crate::error::{Result, WinsysError};
use crate::kernel::{ContextPriority, HwIp, KernelDevice, KernelError, KernelSubmission, SubmitChunk};

const VA_BASE: u64 = 0x1_0000_0000;
const VA_32BIT_BASE: u64 = 0x1000_0000;

fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

#[derive(Default)]
struct AllocState {
    next_va: u64,
    next_va_32bit: u64,
    budget: Option<u64>,
}

pub struct SimAllocator {
    next_handle: AtomicU32,
    created: AtomicU64,
    state: Mutex<AllocState>,
}

impl SimAllocator {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU32::new(1),
            created: AtomicU64::new(0),
            state: Mutex::new(AllocState {
                next_va: VA_BASE,
                next_va_32bit: VA_32BIT_BASE,
                budget: None,
            }),
        }
    }

    /// Allocator that fails with [`WinsysError::OutOfDeviceMemory`] once `bytes` are used up.
    pub fn with_budget(bytes: u64) -> Self {
        let alloc = Self::new();
        alloc.set_budget(Some(bytes));
        alloc
    }

    pub fn set_budget(&self, bytes: Option<u64>) {
        self.lock().budget = bytes;
    }

    /// Number of buffers created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BoAllocator for SimAllocator {
    fn create_bo(&self, desc: &BoDesc) -> Result<Arc<Bo>> {
        let va = {
            let mut state = self.lock();
            if !desc.flags.contains(BoFlags::VIRTUAL) {
                if let Some(budget) = state.budget.as_mut() {
                    if *budget < desc.size {
                        return Err(WinsysError::OutOfDeviceMemory);
                    }
                    *budget -= desc.size;
                }
            }
            let cursor = if desc.flags.contains(BoFlags::VA_32BIT) {
                &mut state.next_va_32bit
            } else {
                &mut state.next_va
            };
            let va = align_up(*cursor, desc.alignment.max(4096));
            *cursor = va + desc.size.max(1);
            va
        };
        let handle = BoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(Bo::new(handle, va, desc)))
    }
}

/// A submission as received by [`SimKernel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub context: u32,
    pub seq: u64,
    pub bo_list: Vec<BoEntry>,
    pub chunks: Vec<SubmitChunk>,
}

impl RecordedSubmission {
    pub fn ib_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| matches!(c, SubmitChunk::Ib { .. }))
            .count()
    }

    pub fn bo_handles(&self) -> Vec<BoHandle> {
        self.bo_list.iter().map(|e| e.handle).collect()
    }
}

#[derive(Default)]
struct KernelState {
    next_context: u32,
    live_contexts: Vec<u32>,
    next_syncobj: u32,
    live_syncobjs: Vec<u32>,
    seq: HashMap<(u32, HwIp, u32), u64>,
    submissions: Vec<RecordedSubmission>,
    transfers: Vec<(u32, u64, u32, u64)>,
    failures: VecDeque<KernelError>,
}

pub struct SimKernel {
    timeline: bool,
    state: Mutex<KernelState>,
}

impl SimKernel {
    pub fn new() -> Self {
        Self::with_timeline_support(true)
    }

    pub fn with_timeline_support(timeline: bool) -> Self {
        Self {
            timeline,
            state: Mutex::new(KernelState {
                next_context: 1,
                next_syncobj: 1,
                ..KernelState::default()
            }),
        }
    }

    /// Makes the next `submit` call fail with `err`. Queued failures are consumed in order.
    pub fn fail_next_submit(&self, err: KernelError) {
        self.lock().failures.push_back(err);
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.lock().submissions.clone()
    }

    pub fn last_submission(&self) -> Option<RecordedSubmission> {
        self.lock().submissions.last().cloned()
    }

    /// `(dst, dst_point, src, src_point)` for every transfer performed.
    pub fn transfers(&self) -> Vec<(u32, u64, u32, u64)> {
        self.lock().transfers.clone()
    }

    pub fn live_syncobjs(&self) -> usize {
        self.lock().live_syncobjs.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.lock().live_contexts.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelDevice for SimKernel {
    fn create_context(&self, _priority: ContextPriority) -> std::result::Result<u32, KernelError> {
        let mut state = self.lock();
        let ctx = state.next_context;
        state.next_context += 1;
        state.live_contexts.push(ctx);
        Ok(ctx)
    }

    fn destroy_context(&self, context: u32) {
        self.lock().live_contexts.retain(|&c| c != context);
    }

    fn submit(&self, submission: &KernelSubmission<'_>) -> std::result::Result<u64, KernelError> {
        let mut state = self.lock();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        if !state.live_contexts.contains(&submission.context) {
            return Err(KernelError::Rejected { errno: 22 });
        }
        let (ip, ring) = submission
            .chunks
            .iter()
            .find_map(|c| match c {
                SubmitChunk::Ib { ip, ring, .. } => Some((*ip, *ring)),
                _ => None,
            })
            .ok_or(KernelError::Rejected { errno: 22 })?;
        let seq = {
            let counter = state.seq.entry((submission.context, ip, ring)).or_insert(0);
            *counter += 1;
            *counter
        };
        state.submissions.push(RecordedSubmission {
            context: submission.context,
            seq,
            bo_list: submission.bo_list.to_vec(),
            chunks: submission.chunks.to_vec(),
        });
        Ok(seq)
    }

    fn wait_fence(
        &self,
        context: u32,
        ip: HwIp,
        ring: u32,
        seq: u64,
        _timeout_ns: u64,
    ) -> std::result::Result<bool, KernelError> {
        let state = self.lock();
        let last = state.seq.get(&(context, ip, ring)).copied().unwrap_or(0);
        Ok(seq <= last)
    }

    fn supports_timeline_syncobj(&self) -> bool {
        self.timeline
    }

    fn syncobj_create(&self, _signaled: bool) -> std::result::Result<u32, KernelError> {
        let mut state = self.lock();
        let handle = state.next_syncobj;
        state.next_syncobj += 1;
        state.live_syncobjs.push(handle);
        Ok(handle)
    }

    fn syncobj_destroy(&self, handle: u32) {
        self.lock().live_syncobjs.retain(|&h| h != handle);
    }

    fn syncobj_reset(&self, handles: &[u32]) -> std::result::Result<(), KernelError> {
        let state = self.lock();
        match handles.iter().find(|h| !state.live_syncobjs.contains(h)) {
            Some(_) => Err(KernelError::Rejected { errno: 2 }),
            None => Ok(()),
        }
    }

    fn syncobj_transfer(
        &self,
        dst: u32,
        dst_point: u64,
        src: u32,
        src_point: u64,
    ) -> std::result::Result<(), KernelError> {
        let mut state = self.lock();
        if !state.live_syncobjs.contains(&dst) {
            return Err(KernelError::Rejected { errno: 2 });
        }
        state.transfers.push((dst, dst_point, src, src_point));
        Ok(())
    }
}
