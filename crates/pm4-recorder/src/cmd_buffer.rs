//! Command buffers.
//!
//! A [`CommandBuffer`] records into one [`CmdStream`]. Bind and set calls only update the
//! trackers; registers are written lazily right before the next draw or dispatch, and cache
//! flushes accumulate until the next point that needs them.
//!
//! Allocation failures during recording are sticky: recording continues, and [`end`]
//! reports the first failure.
//!
//! [`end`]: CommandBuffer::end

use std::sync::Arc;

use bitflags::bitflags;
use pm4_protocol::packet::{
    event_type, DMA_DATA_CP_SYNC, DMA_DATA_DST_SEL_NOWHERE, DMA_DATA_SRC_SEL_ADDR_TC_L2,
    EOP_DATA_SEL_VALUE_32BIT, EOP_EVENT_INDEX, EVENT_BOTTOM_OF_PIPE_TS, WAIT_REG_MEM_EQUAL,
    WAIT_REG_MEM_MEM_SPACE, WRITE_DATA_DST_SEL_MEM, WRITE_DATA_ENGINE_ME, WRITE_DATA_WR_CONFIRM,
};
use pm4_protocol::{Opcode, Pm4Emit};
use pm4_winsys::{CmdStream, DebugFlags, HwIp};
use tracing::{debug, warn};

use crate::barrier::{stage_flush, DependencyInfo, FlushContext, PipelineStageFlags};
use crate::cache::{VertexInputState, VsProlog};
use crate::caps::{ChipCaps, GfxLevel};
use crate::descriptors::{DescriptorState, MAX_PUSH_CONSTANTS_SIZE};
use crate::device::Device;
use crate::draw::{
    DrawRegCache, IndexBufferBinding, PrefetchMask, VertexBufferBinding, MAX_VERTEX_BUFFERS,
};
use crate::dynamic_state::{DynamicState, DynamicStateBits, DynamicStateTracker};
use crate::error::{Error, Result};
use crate::flush::{emit_cache_flush, FlushBits, CACHE_FLUSH_MAX_DWORDS};
use crate::pipeline::{BindPoint, Pipeline};
use crate::renderpass::RenderPassState;
use crate::resources::Event;
use crate::upload::UploadBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferStatus {
    Initial,
    Recording,
    Executable,
    /// `end()` failed. Only `reset()` or `begin()` make the buffer usable again.
    Invalid,
}

bitflags! {
    /// Non-dynamic state that has to be written before the next draw or dispatch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CmdDirty: u32 {
        const GRAPHICS_PIPELINE = 1 << 0;
        const COMPUTE_PIPELINE = 1 << 1;
        const VERTEX_BUFFERS = 1 << 2;
        const INDEX_BUFFER = 1 << 3;
    }
}

pub struct CommandBuffer {
    pub(crate) device: Arc<Device>,
    pub(crate) caps: ChipCaps,
    pub(crate) level: CommandBufferLevel,
    pub(crate) status: CommandBufferStatus,
    pub(crate) cs: CmdStream,
    pub(crate) upload: UploadBuffer,
    pub(crate) record_result: Result<()>,

    pub(crate) dirty: CmdDirty,
    pub(crate) dynamic: DynamicStateTracker,
    /// Dynamic-state values as last written to registers. Only the fields in
    /// `emitted_dynamic_valid` are meaningful.
    pub(crate) emitted_dynamic: DynamicState,
    pub(crate) emitted_dynamic_valid: DynamicStateBits,
    pub(crate) vertex_input: VertexInputState,

    pub(crate) pipelines: [Option<Arc<Pipeline>>; BindPoint::COUNT],
    pub(crate) emitted_pipelines: [Option<Arc<Pipeline>>; BindPoint::COUNT],
    pub(crate) emitted_context_hash: Option<u64>,
    pub(crate) emitted_vs_prolog: Option<Arc<VsProlog>>,

    pub(crate) descriptors: [DescriptorState; BindPoint::COUNT],
    pub(crate) push_constant_data: [u8; MAX_PUSH_CONSTANTS_SIZE],

    pub(crate) vertex_bindings: [Option<VertexBufferBinding>; MAX_VERTEX_BUFFERS],
    pub(crate) index_buffer: Option<IndexBufferBinding>,
    /// Address and size in bytes of the last uploaded vertex-buffer descriptor table.
    pub(crate) vb_table: Option<(u64, u32)>,
    pub(crate) draw_cache: DrawRegCache,

    pub(crate) pending_flush: FlushBits,
    pub(crate) prefetch: PrefetchMask,
    /// A CP DMA prefetch may still be running.
    pub(crate) cp_dma_busy: bool,

    pub(crate) render: Option<RenderPassState>,
    /// A render target was written in a mode that bypasses L2 coherence.
    pub(crate) rb_noncoherent_dirty: bool,
    /// Context registers changed since scissors were last written.
    pub(crate) context_roll_without_scissor: bool,
    pub(crate) trace_id: u32,
}

impl CommandBuffer {
    pub fn new(device: Arc<Device>, ip: HwIp, level: CommandBufferLevel) -> Result<Self> {
        let caps = *device.caps();
        let cs = device.winsys().create_cs(ip)?;
        Ok(Self {
            caps,
            level,
            status: CommandBufferStatus::Initial,
            cs,
            upload: UploadBuffer::new(caps.scalar_cache_line_bytes),
            record_result: Ok(()),
            dirty: CmdDirty::all(),
            dynamic: DynamicStateTracker::new(),
            emitted_dynamic: DynamicState::default(),
            emitted_dynamic_valid: DynamicStateBits::empty(),
            vertex_input: VertexInputState::default(),
            pipelines: Default::default(),
            emitted_pipelines: Default::default(),
            emitted_context_hash: None,
            emitted_vs_prolog: None,
            descriptors: Default::default(),
            push_constant_data: [0; MAX_PUSH_CONSTANTS_SIZE],
            vertex_bindings: [None; MAX_VERTEX_BUFFERS],
            index_buffer: None,
            vb_table: None,
            draw_cache: DrawRegCache::default(),
            pending_flush: FlushBits::empty(),
            prefetch: PrefetchMask::empty(),
            cp_dma_busy: false,
            render: None,
            rb_noncoherent_dirty: false,
            context_roll_without_scissor: false,
            trace_id: 0,
            device,
        })
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn status(&self) -> CommandBufferStatus {
        self.status
    }

    pub fn ip(&self) -> HwIp {
        self.cs.ip()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn cs(&self) -> &CmdStream {
        &self.cs
    }

    /// Flushes recorded by barriers but not yet written to the stream.
    pub fn pending_flush(&self) -> FlushBits {
        self.pending_flush
    }

    /// Dynamic-state setters. Values reach the stream at the next draw that consumes them.
    pub fn dynamic_state_mut(&mut self) -> &mut DynamicStateTracker {
        &mut self.dynamic
    }

    pub fn dynamic_state(&self) -> &DynamicStateTracker {
        &self.dynamic
    }

    /// Returns the buffer to `Initial`, dropping everything recorded and every retired
    /// upload buffer.
    pub fn reset(&mut self) {
        self.cs.reset();
        self.upload.reset(&mut self.cs);
        self.record_result = Ok(());
        self.status = CommandBufferStatus::Initial;

        self.dirty = CmdDirty::all();
        self.dynamic.reset();
        self.emitted_dynamic_valid = DynamicStateBits::empty();
        self.vertex_input = VertexInputState::default();
        self.pipelines = Default::default();
        self.emitted_pipelines = Default::default();
        self.emitted_context_hash = None;
        self.emitted_vs_prolog = None;
        self.descriptors = Default::default();
        self.push_constant_data = [0; MAX_PUSH_CONSTANTS_SIZE];
        self.vertex_bindings = [None; MAX_VERTEX_BUFFERS];
        self.index_buffer = None;
        self.vb_table = None;
        self.draw_cache = DrawRegCache::default();
        self.pending_flush = FlushBits::empty();
        self.prefetch = PrefetchMask::empty();
        self.cp_dma_busy = false;
        self.render = None;
        self.rb_noncoherent_dirty = false;
        self.context_roll_without_scissor = false;
    }

    /// Starts recording. A buffer that is not `Initial` is reset first.
    pub fn begin(&mut self) {
        if self.status != CommandBufferStatus::Initial {
            self.reset();
        }
        self.status = CommandBufferStatus::Recording;
    }

    /// Finishes recording. Fails with the first error recorded since `begin()`, leaving the
    /// buffer `Invalid`.
    pub fn end(&mut self) -> Result<()> {
        assert_eq!(
            self.status,
            CommandBufferStatus::Recording,
            "end() on a command buffer that is not recording"
        );

        if self.caps.end_of_ib_full_flush && self.cs.ip() != HwIp::Dma {
            self.pending_flush |=
                FlushBits::CS_PARTIAL_FLUSH | FlushBits::PS_PARTIAL_FLUSH | FlushBits::WB_L2;
        }
        if self.cp_dma_busy {
            self.wait_for_cp_dma();
        }
        self.emit_pending_flush();

        if let Err(err) = self.cs.finalize() {
            self.set_error(err);
        }
        match &self.record_result {
            Ok(()) => {
                self.status = CommandBufferStatus::Executable;
                debug!(
                    dwords = self.cs.cdw(),
                    segments = self.cs.num_segments(),
                    "finished command buffer"
                );
                Ok(())
            }
            Err(err) => {
                self.status = CommandBufferStatus::Invalid;
                Err(err.clone())
            }
        }
    }

    /// Records the first failure. Later failures are dropped.
    pub(crate) fn set_error(&mut self, err: impl Into<Error>) {
        if self.record_result.is_ok() {
            let err = err.into();
            warn!(%err, "command buffer recording failed");
            self.record_result = Err(err);
        }
    }

    pub(crate) fn upload_words(&mut self, words: &[u32]) -> Option<u64> {
        match self
            .upload
            .upload_words(self.device.winsys(), &mut self.cs, words)
        {
            Ok(alloc) => {
                self.device.stats().add_upload_bytes(words.len() as u64 * 4);
                Some(alloc.va())
            }
            Err(err) => {
                self.set_error(err);
                None
            }
        }
    }

    pub(crate) fn upload_bytes(&mut self, data: &[u8]) -> Option<u64> {
        match self.upload.upload(self.device.winsys(), &mut self.cs, data) {
            Ok(alloc) => {
                self.device.stats().add_upload_bytes(data.len() as u64);
                Some(alloc.va())
            }
            Err(err) => {
                self.set_error(err);
                None
            }
        }
    }

    pub(crate) fn debug_flags(&self) -> DebugFlags {
        self.device.config().debug
    }

    pub(crate) fn prefetch_enabled(&self) -> bool {
        self.caps.cp_dma_prefetch && !self.debug_flags().contains(DebugFlags::NO_PREFETCH)
    }

    pub(crate) fn flush_context(&self) -> FlushContext {
        FlushContext {
            caps: self.caps,
            use_llvm_ssbo_path: self.device.config().use_llvm_ssbo_path,
            rb_noncoherent_dirty: self.rb_noncoherent_dirty,
        }
    }

    /// Writes out and clears the pending flush bits.
    pub(crate) fn emit_pending_flush(&mut self) {
        let bits = self.pending_flush;
        if bits.is_empty() {
            return;
        }
        let ip = self.cs.ip();
        self.cs.reserve(CACHE_FLUSH_MAX_DWORDS);
        emit_cache_flush(&mut self.cs, &self.caps, ip, bits);
        if bits.intersects(FlushBits::FLUSH_AND_INV_CB | FlushBits::FLUSH_AND_INV_DB) {
            self.rb_noncoherent_dirty = false;
        }
        if bits.contains(FlushBits::CS_PARTIAL_FLUSH) {
            self.cp_dma_busy = false;
        }
        self.pending_flush = FlushBits::empty();
        self.device.stats().inc_cache_flushes();
    }

    /// Waits for outstanding CP DMA with an empty synchronous transfer.
    pub(crate) fn wait_for_cp_dma(&mut self) {
        self.cs.reserve(7);
        self.cs.emit_pkt3(
            Opcode::DmaData,
            &[
                DMA_DATA_CP_SYNC | DMA_DATA_DST_SEL_NOWHERE | DMA_DATA_SRC_SEL_ADDR_TC_L2,
                0,
                0,
                0,
                0,
                0,
            ],
        );
        self.cp_dma_busy = false;
    }

    /// Folds a barrier into the pending flush bits. Nothing is written until the next draw,
    /// dispatch, event or the end of the buffer, except flushes needed before image layout
    /// transitions.
    pub fn pipeline_barrier(&mut self, info: &DependencyInfo) {
        self.pending_flush |= info.src_flush();
        self.pending_flush |= stage_flush(info.src_stages, info.dst_stages);

        for barrier in &info.image_barriers {
            if barrier.old_layout != barrier.new_layout {
                self.transition_image_layout(&barrier.image, barrier.old_layout, barrier.new_layout);
            }
        }

        self.pending_flush |= info.dst_flush(&self.flush_context());
        self.device.stats().inc_barriers();
    }

    fn write_event(&mut self, event: &Event, stages: PipelineStageFlags, value: u32) {
        self.emit_pending_flush();
        self.cs.add_buffer(&event.bo);
        let va = event.va();

        self.cs.reserve(7);
        let top_of_pipe = PipelineStageFlags::TOP_OF_PIPE | PipelineStageFlags::HOST;
        if (stages - top_of_pipe).is_empty() {
            self.cs.emit_pkt3(
                Opcode::WriteData,
                &[
                    WRITE_DATA_DST_SEL_MEM | WRITE_DATA_WR_CONFIRM | WRITE_DATA_ENGINE_ME,
                    va as u32,
                    (va >> 32) as u32,
                    value,
                ],
            );
            return;
        }

        let release_mem = self.caps.gfx_level >= GfxLevel::Gfx9
            || (self.cs.ip() == HwIp::Compute && self.caps.gfx_level >= GfxLevel::Gfx7);
        let event_cntl = event_type(EVENT_BOTTOM_OF_PIPE_TS, EOP_EVENT_INDEX);
        if release_mem {
            self.cs.emit_pkt3(
                Opcode::ReleaseMem,
                &[
                    event_cntl,
                    EOP_DATA_SEL_VALUE_32BIT,
                    va as u32,
                    (va >> 32) as u32,
                    value,
                    0,
                ],
            );
        } else {
            self.cs.emit_pkt3(
                Opcode::EventWriteEop,
                &[
                    event_cntl,
                    va as u32,
                    ((va >> 32) as u32 & 0xFFFF) | EOP_DATA_SEL_VALUE_32BIT,
                    value,
                    0,
                ],
            );
        }
    }

    /// Sets `event` once the work of `stages` recorded so far completed.
    pub fn set_event(&mut self, event: &Event, stages: PipelineStageFlags) {
        self.write_event(event, stages, 1);
    }

    pub fn reset_event(&mut self, event: &Event, stages: PipelineStageFlags) {
        self.write_event(event, stages, 0);
    }

    /// Stalls the front end until every event is set, then applies `info`.
    pub fn wait_events(&mut self, events: &[&Event], info: &DependencyInfo) {
        for event in events {
            self.cs.add_buffer(&event.bo);
            let va = event.va();
            self.cs.reserve(7);
            self.cs.emit_pkt3(
                Opcode::WaitRegMem,
                &[
                    WAIT_REG_MEM_EQUAL | WAIT_REG_MEM_MEM_SPACE,
                    va as u32,
                    (va >> 32) as u32,
                    1,
                    0xFFFF_FFFF,
                    4,
                ],
            );
        }
        self.pipeline_barrier(info);
    }

    pub fn begin_pipeline_statistics(&mut self) {
        self.pending_flush.remove(FlushBits::STOP_PIPELINE_STATS);
        self.pending_flush |= FlushBits::START_PIPELINE_STATS;
    }

    pub fn end_pipeline_statistics(&mut self) {
        self.pending_flush.remove(FlushBits::START_PIPELINE_STATS);
        self.pending_flush |= FlushBits::STOP_PIPELINE_STATS;
    }

    /// Runs `secondaries` from this primary buffer. Their streams are nested or copied in,
    /// and everything they may have changed is considered dirty afterwards.
    pub fn execute_commands(&mut self, secondaries: &[&CommandBuffer]) {
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "secondary command buffers cannot execute other command buffers"
        );
        self.emit_pending_flush();

        let allow_nested = self.device.winsys().config().allow_nested_ib;
        for child in secondaries {
            assert_eq!(
                child.level,
                CommandBufferLevel::Secondary,
                "only secondary command buffers can be executed"
            );
            assert_eq!(
                child.status,
                CommandBufferStatus::Executable,
                "executed command buffer is not executable"
            );
            self.cs.execute_secondary(&child.cs, allow_nested);
            self.rb_noncoherent_dirty |= child.rb_noncoherent_dirty;
            self.trace_id = self.trace_id.max(child.trace_id);
        }
        debug!(count = secondaries.len(), "executed secondary command buffers");

        self.invalidate_emitted_state();
    }

    /// Forgets every register value known to be in hardware, after packets the recorder
    /// did not write itself.
    pub(crate) fn invalidate_emitted_state(&mut self) {
        self.emitted_pipelines = Default::default();
        self.emitted_context_hash = None;
        self.emitted_vs_prolog = None;
        self.dirty |= CmdDirty::all();
        self.dynamic.mark_dirty(DynamicStateBits::ALL);
        self.emitted_dynamic_valid = DynamicStateBits::empty();
        for state in &mut self.descriptors {
            state.invalidate();
        }
        self.draw_cache = DrawRegCache::default();
        if self.caps.has_gfx9_scissor_bug {
            self.context_roll_without_scissor = true;
        }
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("level", &self.level)
            .field("status", &self.status)
            .field("ip", &self.cs.ip())
            .field("cdw", &self.cs.cdw())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{AccessFlags, MemoryBarrier};
    use crate::config::DeviceConfig;
    use crate::test_util::{test_cmd_buffer, test_device, test_device_with_sim};
    use pm4_protocol::walk_packets;
    use pretty_assertions::assert_eq;

    fn opcodes(words: &[u32]) -> Vec<Opcode> {
        walk_packets(words)
            .map(|p| p.unwrap())
            .filter(|p| !p.is_padding())
            .filter_map(|p| p.opcode())
            .collect()
    }

    #[test]
    fn lifecycle() {
        let device = test_device(DeviceConfig::default());
        let mut cb = test_cmd_buffer(&device);
        assert_eq!(cb.status(), CommandBufferStatus::Initial);
        cb.begin();
        assert_eq!(cb.status(), CommandBufferStatus::Recording);
        cb.end().unwrap();
        assert_eq!(cb.status(), CommandBufferStatus::Executable);

        // Beginning again resets implicitly.
        cb.begin();
        assert_eq!(cb.status(), CommandBufferStatus::Recording);
        assert!(cb.cs.payload_words().is_empty());
    }

    #[test]
    fn barriers_are_batched_until_needed() {
        let device = test_device(DeviceConfig::default());
        let mut cb = test_cmd_buffer(&device);
        cb.begin();

        let barrier = DependencyInfo {
            src_stages: PipelineStageFlags::COMPUTE_SHADER,
            dst_stages: PipelineStageFlags::COMPUTE_SHADER,
            memory_barriers: vec![MemoryBarrier {
                src_access: AccessFlags::SHADER_WRITE,
                dst_access: AccessFlags::SHADER_READ,
            }],
            image_barriers: Vec::new(),
        };
        cb.pipeline_barrier(&barrier);
        cb.pipeline_barrier(&barrier);
        assert!(cb.cs.payload_words().is_empty());
        assert!(cb.pending_flush().contains(FlushBits::CS_PARTIAL_FLUSH));

        cb.emit_pending_flush();
        assert!(cb.pending_flush().is_empty());
        assert_eq!(device.stats().snapshot().cache_flushes, 1);
        assert_eq!(device.stats().snapshot().barriers, 2);
    }

    #[test]
    fn event_write_depends_on_stage_and_generation() {
        for (level, stages, expected) in [
            (GfxLevel::Gfx9, PipelineStageFlags::TOP_OF_PIPE, Opcode::WriteData),
            (GfxLevel::Gfx9, PipelineStageFlags::FRAGMENT_SHADER, Opcode::ReleaseMem),
            (GfxLevel::Gfx8, PipelineStageFlags::FRAGMENT_SHADER, Opcode::EventWriteEop),
        ] {
            let device = test_device(DeviceConfig {
                gfx_level: level,
                ..DeviceConfig::default()
            });
            let event = device.create_event().unwrap();
            let mut cb = test_cmd_buffer(&device);
            cb.begin();
            cb.set_event(&event, stages);
            assert_eq!(opcodes(&cb.cs.payload_words()), vec![expected], "{level}");
        }
    }

    #[test]
    fn wait_events_waits_then_flushes_lazily() {
        let device = test_device(DeviceConfig::default());
        let event = device.create_event().unwrap();
        let mut cb = test_cmd_buffer(&device);
        cb.begin();
        let info = DependencyInfo {
            src_stages: PipelineStageFlags::FRAGMENT_SHADER,
            dst_stages: PipelineStageFlags::VERTEX_SHADER,
            ..DependencyInfo::default()
        };
        cb.wait_events(&[&event], &info);
        assert_eq!(opcodes(&cb.cs.payload_words()), vec![Opcode::WaitRegMem]);
        assert!(cb.pending_flush().contains(FlushBits::PS_PARTIAL_FLUSH));
    }

    #[test]
    fn gfx6_end_flushes_everything() {
        let device = test_device(DeviceConfig {
            gfx_level: GfxLevel::Gfx6,
            ..DeviceConfig::default()
        });
        let mut cb = test_cmd_buffer(&device);
        cb.begin();
        cb.end().unwrap();
        let ops = opcodes(&cb.cs.payload_words());
        assert!(ops.contains(&Opcode::EventWrite));
        assert!(ops.contains(&Opcode::SurfaceSync));
    }

    #[test]
    fn allocation_failure_is_reported_at_end() {
        let (device, allocator, _kernel) = test_device_with_sim(DeviceConfig::default());
        let mut cb = test_cmd_buffer(&device);
        cb.begin();
        allocator.set_budget(Some(0));
        assert_eq!(cb.upload_words(&[1, 2, 3]), None);
        // Recording goes on.
        cb.begin_pipeline_statistics();
        assert_eq!(cb.end(), Err(Error::OutOfDeviceMemory));
        assert_eq!(cb.status(), CommandBufferStatus::Invalid);

        allocator.set_budget(None);
        cb.begin();
        cb.end().unwrap();
    }
}
