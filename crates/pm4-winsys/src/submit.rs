//! Submission layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::bo::{Bo, BoAllocator, BoDesc, BoEntry, BoFlags, Domain, PRIORITY_CS, PRIORITY_FENCE};
use crate::bo_list::{build_bo_list, GlobalBoList};
use crate::config::WinsysConfig;
use crate::cs::{pad_to_alignment, CmdStream};
use crate::error::{Result, WinsysError};
use crate::kernel::{
    ContextPriority, HwIp, IbDesc, IbFlags, KernelDevice, KernelError, KernelSubmission,
    SubmitChunk, TimelinePoint, MAX_RINGS_PER_IP,
};
use crate::syncobj::SyncobjPool;

/// A wait or signal operation on a kernel syncobj.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncPoint {
    Binary(u32),
    Timeline { handle: u32, point: u64 },
}

pub struct SubmitRequest<'a> {
    pub ip: HwIp,
    pub ring: u32,
    /// Submitted as the first IB, flagged as preamble.
    pub preamble: Option<&'a CmdStream>,
    pub streams: &'a [&'a CmdStream],
    pub waits: &'a [SyncPoint],
    pub signals: &'a [SyncPoint],
}

/// Kernel context plus the bookkeeping the winsys keeps per context.
pub struct SubmitContext {
    id: u32,
    kernel: Arc<dyn KernelDevice>,
    fence_bo: Arc<Bo>,
    last_submission: Mutex<HashMap<(HwIp, u32), u64>>,
    lost: AtomicBool,
}

impl SubmitContext {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True once the kernel reported the context as cancelled. Every later submission fails.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn last_submission(&self, ip: HwIp, ring: u32) -> Option<u64> {
        self.last_submission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(ip, ring))
            .copied()
    }

    pub fn fence_bo(&self) -> &Arc<Bo> {
        &self.fence_bo
    }

    /// Byte offset of the fence slot for `(ip, ring)` inside the fence buffer.
    pub fn fence_offset(ip: HwIp, ring: u32) -> u64 {
        assert!(ring < MAX_RINGS_PER_IP, "ring {ring} out of range");
        ((ip.index() as u64) * u64::from(MAX_RINGS_PER_IP) + u64::from(ring)) * 8
    }

    /// Waits for the last submission on `(ip, ring)`. Returns `true` when it completed.
    pub fn wait_idle(&self, ip: HwIp, ring: u32, timeout_ns: u64) -> Result<bool> {
        let Some(seq) = self.last_submission(ip, ring) else {
            return Ok(true);
        };
        self.kernel
            .wait_fence(self.id, ip, ring, seq, timeout_ns)
            .map_err(WinsysError::from_kernel)
    }

    fn record(&self, ip: HwIp, ring: u32, seq: u64) {
        self.last_submission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((ip, ring), seq);
    }
}

impl Drop for SubmitContext {
    fn drop(&mut self) {
        self.kernel.destroy_context(self.id);
    }
}

impl std::fmt::Debug for SubmitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitContext")
            .field("id", &self.id)
            .field("lost", &self.is_lost())
            .finish()
    }
}

pub struct Winsys {
    config: WinsysConfig,
    allocator: Arc<dyn BoAllocator>,
    kernel: Arc<dyn KernelDevice>,
    global_bos: GlobalBoList,
    syncobjs: SyncobjPool,
}

impl Winsys {
    pub fn new(
        config: WinsysConfig,
        allocator: Arc<dyn BoAllocator>,
        kernel: Arc<dyn KernelDevice>,
    ) -> Self {
        Self {
            config,
            allocator,
            kernel,
            global_bos: GlobalBoList::default(),
            syncobjs: SyncobjPool::default(),
        }
    }

    pub fn config(&self) -> &WinsysConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<dyn BoAllocator> {
        &self.allocator
    }

    pub fn kernel(&self) -> &Arc<dyn KernelDevice> {
        &self.kernel
    }

    pub fn syncobj_pool(&self) -> &SyncobjPool {
        &self.syncobjs
    }

    /// With `debug_all_bos` every buffer created here is also made resident.
    pub fn create_bo(&self, desc: &BoDesc) -> Result<Arc<Bo>> {
        let bo = self.allocator.create_bo(desc)?;
        if self.config.debug_all_bos {
            self.global_bos.set_resident(&bo, true);
        }
        Ok(bo)
    }

    pub fn create_cs(&self, ip: HwIp) -> Result<CmdStream> {
        CmdStream::new(ip, self.allocator.clone(), &self.config)
    }

    pub fn create_context(&self, priority: ContextPriority) -> Result<Arc<SubmitContext>> {
        let fence_bo = self.allocator.create_bo(&BoDesc {
            size: (HwIp::COUNT as u64) * u64::from(MAX_RINGS_PER_IP) * 8,
            alignment: 4096,
            domain: Domain::Gtt,
            flags: BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING,
            priority: PRIORITY_FENCE,
        })?;
        let id = self
            .kernel
            .create_context(priority)
            .map_err(WinsysError::from_kernel)?;
        debug!(context = id, ?priority, "created submit context");
        Ok(Arc::new(SubmitContext {
            id,
            kernel: self.kernel.clone(),
            fence_bo,
            last_submission: Mutex::new(HashMap::new()),
            lost: AtomicBool::new(false),
        }))
    }

    /// Adds or removes `bo` from the list of buffers referenced by every submission.
    pub fn make_resident(&self, bo: &Arc<Bo>, resident: bool) {
        self.global_bos.set_resident(bo, resident);
    }

    pub fn resident_bos(&self) -> Vec<BoEntry> {
        self.global_bos.entries()
    }

    /// Submits `request` on `ctx` and returns the kernel sequence number.
    pub fn submit(&self, ctx: &SubmitContext, request: &SubmitRequest<'_>) -> Result<u64> {
        if ctx.is_lost() {
            return Err(WinsysError::DeviceLost);
        }
        assert!(
            !request.streams.is_empty(),
            "submission without command streams"
        );

        let streams: Vec<&CmdStream> = request
            .preamble
            .into_iter()
            .chain(request.streams.iter().copied())
            .collect();

        let mut ibs = Vec::new();
        let mut sysmem_ibs = Vec::new();
        for (i, cs) in streams.iter().enumerate() {
            let flags = if i == 0 && request.preamble.is_some() {
                IbFlags::PREAMBLE
            } else {
                IbFlags::empty()
            };
            if cs.uses_ib_bos() {
                ibs.push(cs.ib_desc(flags));
                continue;
            }
            for segment in cs.segments() {
                if segment.payload().is_empty() {
                    continue;
                }
                let (bo, size_dw) = self.copy_to_ib(cs.ip(), segment.payload())?;
                ibs.push(IbDesc {
                    va: bo.va(),
                    size_dw,
                    flags,
                });
                sysmem_ibs.push(bo);
            }
        }

        let mut extra: Vec<BoEntry> = sysmem_ibs.iter().map(|bo| bo.entry()).collect();
        extra.extend(self.global_bos.entries());
        let bo_list = build_bo_list(&streams, &extra);

        let mut chunks: Vec<SubmitChunk> = ibs
            .iter()
            .map(|ib| SubmitChunk::Ib {
                ip: request.ip,
                ring: request.ring,
                ib: *ib,
            })
            .collect();
        chunks.push(SubmitChunk::Fence {
            handle: ctx.fence_bo.handle(),
            offset: SubmitContext::fence_offset(request.ip, request.ring),
        });

        let mut borrowed = Vec::new();
        let result = self.submit_with_syncobjs(ctx, request, &bo_list, chunks, &mut borrowed);
        self.syncobjs.release(self.kernel.as_ref(), &borrowed);

        let seq = result?;
        ctx.record(request.ip, request.ring, seq);
        debug!(
            context = ctx.id,
            ip = ?request.ip,
            ring = request.ring,
            seq,
            ibs = ibs.len(),
            bos = bo_list.len(),
            "submitted"
        );
        Ok(seq)
    }

    fn submit_with_syncobjs(
        &self,
        ctx: &SubmitContext,
        request: &SubmitRequest<'_>,
        bo_list: &[BoEntry],
        mut chunks: Vec<SubmitChunk>,
        borrowed: &mut Vec<u32>,
    ) -> Result<u64> {
        let kernel = self.kernel.as_ref();
        let timeline = kernel.supports_timeline_syncobj();

        let mut binary_waits = Vec::new();
        let mut timeline_waits = Vec::new();
        for wait in request.waits {
            match (*wait, timeline) {
                (SyncPoint::Binary(handle), false) => binary_waits.push(handle),
                (SyncPoint::Binary(handle), true) => {
                    timeline_waits.push(TimelinePoint { handle, point: 0 })
                }
                (SyncPoint::Timeline { handle, point }, true) => {
                    timeline_waits.push(TimelinePoint { handle, point })
                }
                (SyncPoint::Timeline { handle, point }, false) => {
                    let tmp = self.syncobjs.acquire(kernel)?;
                    borrowed.push(tmp);
                    kernel
                        .syncobj_transfer(tmp, 0, handle, point)
                        .map_err(WinsysError::from_kernel)?;
                    binary_waits.push(tmp);
                }
            }
        }

        let mut binary_signals = Vec::new();
        let mut timeline_signals = Vec::new();
        // (timeline, point, emulation syncobj) pairs to transfer after the call.
        let mut deferred = Vec::new();
        for signal in request.signals {
            match (*signal, timeline) {
                (SyncPoint::Binary(handle), false) => binary_signals.push(handle),
                (SyncPoint::Binary(handle), true) => {
                    timeline_signals.push(TimelinePoint { handle, point: 0 })
                }
                (SyncPoint::Timeline { handle, point }, true) => {
                    timeline_signals.push(TimelinePoint { handle, point })
                }
                (SyncPoint::Timeline { handle, point }, false) => {
                    let tmp = self.syncobjs.acquire(kernel)?;
                    borrowed.push(tmp);
                    binary_signals.push(tmp);
                    deferred.push((handle, point, tmp));
                }
            }
        }

        if !binary_waits.is_empty() {
            chunks.push(SubmitChunk::SyncobjIn(binary_waits));
        }
        if !timeline_waits.is_empty() {
            chunks.push(SubmitChunk::TimelineWait(timeline_waits));
        }
        if !binary_signals.is_empty() {
            chunks.push(SubmitChunk::SyncobjOut(binary_signals));
        }
        if !timeline_signals.is_empty() {
            chunks.push(SubmitChunk::TimelineSignal(timeline_signals));
        }

        let seq = kernel
            .submit(&KernelSubmission {
                context: ctx.id,
                bo_list,
                chunks: &chunks,
            })
            .map_err(|err| self.classify(ctx, err, &chunks, bo_list.len()))?;

        for (handle, point, tmp) in deferred {
            kernel
                .syncobj_transfer(handle, point, tmp, 0)
                .map_err(WinsysError::from_kernel)?;
        }
        Ok(seq)
    }

    fn classify(
        &self,
        ctx: &SubmitContext,
        err: KernelError,
        chunks: &[SubmitChunk],
        bos: usize,
    ) -> WinsysError {
        match err {
            KernelError::OutOfMemory => WinsysError::OutOfHostMemory,
            KernelError::Cancelled => {
                ctx.lost.store(true, Ordering::Release);
                error!(context = ctx.id, "context cancelled by the kernel, device lost");
                WinsysError::DeviceLost
            }
            KernelError::Rejected { errno } => {
                let ibs = chunks
                    .iter()
                    .filter(|c| matches!(c, SubmitChunk::Ib { .. }))
                    .count();
                error!(context = ctx.id, errno, ibs, bos, "kernel rejected submission");
                WinsysError::SubmissionRejected {
                    detail: format!("errno {errno} with {ibs} IBs and {bos} buffers"),
                }
            }
        }
    }

    /// Copies a sysmem chunk into a fresh IB buffer.
    fn copy_to_ib(&self, ip: HwIp, words: &[u32]) -> Result<(Arc<Bo>, u32)> {
        let mut padded = Vec::new();
        padded
            .try_reserve_exact(words.len() + 8)
            .map_err(|_| WinsysError::OutOfHostMemory)?;
        padded.extend_from_slice(words);
        pad_to_alignment(ip, &mut padded);
        let bo = self.allocator.create_bo(&BoDesc {
            size: (padded.len() * 4) as u64,
            alignment: 4096,
            domain: Domain::Gtt,
            flags: BoFlags::CPU_ACCESS
                | BoFlags::READ_ONLY
                | BoFlags::GTT_WC
                | BoFlags::NO_INTERPROCESS_SHARING,
            priority: PRIORITY_CS,
        })?;
        bo.write_words(0, &padded);
        Ok((bo, padded.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimAllocator, SimKernel};
    use pretty_assertions::assert_eq;

    fn winsys(kernel: Arc<SimKernel>, use_ib_bos: bool) -> Winsys {
        let config = WinsysConfig {
            use_ib_bos,
            initial_ib_dwords: 64,
            ..WinsysConfig::default()
        };
        Winsys::new(config, Arc::new(SimAllocator::new()), kernel)
    }

    #[test]
    fn sequence_numbers_are_recorded_per_ring() {
        let kernel = Arc::new(SimKernel::new());
        let ws = winsys(kernel.clone(), true);
        let ctx = ws.create_context(ContextPriority::Medium).unwrap();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        cs.push(&[0; 4]);
        cs.finalize().unwrap();

        let request = SubmitRequest {
            ip: HwIp::Gfx,
            ring: 0,
            preamble: None,
            streams: &[&cs],
            waits: &[],
            signals: &[],
        };
        assert_eq!(ws.submit(&ctx, &request).unwrap(), 1);
        assert_eq!(ws.submit(&ctx, &request).unwrap(), 2);
        assert_eq!(ctx.last_submission(HwIp::Gfx, 0), Some(2));
        assert_eq!(ctx.last_submission(HwIp::Compute, 0), None);
        assert!(ctx.wait_idle(HwIp::Gfx, 0, 0).unwrap());

        let recorded = kernel.last_submission().unwrap();
        assert_eq!(recorded.ib_count(), 1);
        assert!(recorded.chunks.contains(&SubmitChunk::Fence {
            handle: ctx.fence_bo().handle(),
            offset: 0,
        }));
    }

    #[test]
    fn cancelled_context_poisons_later_submissions() {
        let kernel = Arc::new(SimKernel::new());
        let ws = winsys(kernel.clone(), true);
        let ctx = ws.create_context(ContextPriority::Medium).unwrap();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        cs.finalize().unwrap();
        let request = SubmitRequest {
            ip: HwIp::Gfx,
            ring: 0,
            preamble: None,
            streams: &[&cs],
            waits: &[],
            signals: &[],
        };

        kernel.fail_next_submit(KernelError::Cancelled);
        assert_eq!(ws.submit(&ctx, &request), Err(WinsysError::DeviceLost));
        assert!(ctx.is_lost());
        assert_eq!(ws.submit(&ctx, &request), Err(WinsysError::DeviceLost));
        assert!(kernel.submissions().is_empty());
    }

    #[test]
    fn kernel_errors_are_classified() {
        let kernel = Arc::new(SimKernel::new());
        let ws = winsys(kernel.clone(), true);
        let ctx = ws.create_context(ContextPriority::Medium).unwrap();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        cs.finalize().unwrap();
        let request = SubmitRequest {
            ip: HwIp::Gfx,
            ring: 0,
            preamble: None,
            streams: &[&cs],
            waits: &[],
            signals: &[],
        };

        kernel.fail_next_submit(KernelError::OutOfMemory);
        assert_eq!(ws.submit(&ctx, &request), Err(WinsysError::OutOfHostMemory));
        kernel.fail_next_submit(KernelError::Rejected { errno: 22 });
        assert!(matches!(
            ws.submit(&ctx, &request),
            Err(WinsysError::SubmissionRejected { detail }) if detail.contains("errno 22")
        ));
        assert!(!ctx.is_lost());
        assert_eq!(ws.submit(&ctx, &request), Ok(1));
    }

    #[test]
    fn sysmem_chunks_become_separate_ibs() {
        let kernel = Arc::new(SimKernel::new());
        let ws = winsys(kernel.clone(), false);
        let ctx = ws.create_context(ContextPriority::Medium).unwrap();
        let mut cs = ws.create_cs(HwIp::Compute).unwrap();
        cs.push(&[0xAA; 10]);
        cs.finalize().unwrap();

        ws.submit(
            &ctx,
            &SubmitRequest {
                ip: HwIp::Compute,
                ring: 0,
                preamble: None,
                streams: &[&cs],
                waits: &[],
                signals: &[],
            },
        )
        .unwrap();

        let recorded = kernel.last_submission().unwrap();
        let ib = recorded
            .chunks
            .iter()
            .find_map(|c| match c {
                SubmitChunk::Ib { ib, .. } => Some(*ib),
                _ => None,
            })
            .unwrap();
        assert_eq!(ib.size_dw, 16);
        // The copy buffer is the only referenced buffer.
        assert_eq!(recorded.bo_list.len(), 1);
    }

    #[test]
    fn timeline_points_are_emulated_without_kernel_support() {
        let kernel = Arc::new(SimKernel::with_timeline_support(false));
        let ws = winsys(kernel.clone(), true);
        let ctx = ws.create_context(ContextPriority::Medium).unwrap();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        cs.finalize().unwrap();
        let user_timeline = kernel.syncobj_create(false).unwrap();
        let user_binary = kernel.syncobj_create(false).unwrap();

        ws.submit(
            &ctx,
            &SubmitRequest {
                ip: HwIp::Gfx,
                ring: 0,
                preamble: None,
                streams: &[&cs],
                waits: &[
                    SyncPoint::Timeline {
                        handle: user_timeline,
                        point: 5,
                    },
                    SyncPoint::Binary(user_binary),
                ],
                signals: &[SyncPoint::Timeline {
                    handle: user_timeline,
                    point: 6,
                }],
            },
        )
        .unwrap();

        let transfers = kernel.transfers();
        assert_eq!(transfers.len(), 2);
        let (wait_tmp, _, src, src_point) = transfers[0];
        assert_eq!((src, src_point), (user_timeline, 5));
        let (dst, dst_point, signal_tmp, _) = transfers[1];
        assert_eq!((dst, dst_point), (user_timeline, 6));

        let recorded = kernel.last_submission().unwrap();
        assert!(recorded
            .chunks
            .contains(&SubmitChunk::SyncobjIn(vec![wait_tmp, user_binary])));
        assert!(recorded
            .chunks
            .contains(&SubmitChunk::SyncobjOut(vec![signal_tmp])));
        // Both borrowed syncobjs went back to the free list.
        assert_eq!(ws.syncobj_pool().len(), 2);
    }
}
