//! Draw and dispatch emission.
//!
//! Before each draw the emitter picks one of two orders. When the pending flush makes the
//! CP wait for idle, state goes first so it is parsed while earlier work drains, then the
//! flush, then descriptors. Otherwise the flush goes first, followed by an L2 prefetch of
//! the vertex shader, descriptors and state. Remaining shaders are prefetched after the
//! draw packet in both cases.

use pm4_protocol::packet::{
    BASE_INDEX_DRAW_INDIRECT, COPY_DATA_DST_SEL_REG, COPY_DATA_SRC_SEL_MEM, COPY_DATA_WR_CONFIRM,
    COUNT_INDIRECT_ENABLE, DISPATCH_COMPUTE_SHADER_EN, DISPATCH_FORCE_START_AT_000,
    DISPATCH_ORDER_MODE, DI_SRC_SEL_AUTO_INDEX, DI_SRC_SEL_DMA, DMA_DATA_BYTE_COUNT_MASK,
    DMA_DATA_DST_SEL_NOWHERE, DMA_DATA_SRC_SEL_ADDR_TC_L2, DRAW_INDEX_ENABLE, INDEX_TYPE_16,
    INDEX_TYPE_32, INDEX_TYPE_8, TRACE_POINT_MARKER, WRITE_DATA_DST_SEL_MEM,
    WRITE_DATA_ENGINE_ME, WRITE_DATA_WR_CONFIRM,
};
use pm4_protocol::regs::{
    COMPUTE_START_X, SH_REG_OFFSET, VGT_INDEX_TYPE_UCONFIG, VGT_MULTI_PRIM_IB_RESET_INDX,
};
use pm4_protocol::{DwordSink, Opcode, Pkt3Header, Pm4Emit};
use pm4_winsys::{DebugFlags, HwIp};

use bitflags::bitflags;

use crate::cache::VertexInputState;
use crate::caps::GfxLevel;
use crate::cmd_buffer::{CmdDirty, CommandBuffer};
use crate::descriptors::emit_pointer;
use crate::dynamic_state::DynamicStateBits;
use crate::flush::FlushBits;
use crate::pipeline::{BindPoint, Pipeline, ShaderStage};
use crate::resources::Buffer;
use crate::state_emit::{emit_dynamic_state, max_dwords, EmitInputs};

pub const MAX_VERTEX_BUFFERS: usize = 32;

bitflags! {
    /// Pipeline parts still to be prefetched into L2.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PrefetchMask: u32 {
        const VS = 1 << 0;
        const VBO_DESCRIPTORS = 1 << 1;
        const TCS = 1 << 2;
        const TES = 1 << 3;
        const GS = 1 << 4;
        const PS = 1 << 5;
        const CS = 1 << 6;
    }
}

impl PrefetchMask {
    pub const fn for_stage(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => Self::VS,
            ShaderStage::TessCtrl => Self::TCS,
            ShaderStage::TessEval => Self::TES,
            ShaderStage::Geometry => Self::GS,
            ShaderStage::Fragment => Self::PS,
            ShaderStage::Compute => Self::CS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    pub const fn size(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// `VGT_INDEX_TYPE` encoding.
    pub const fn hw_value(self) -> u32 {
        match self {
            Self::U8 => INDEX_TYPE_8,
            Self::U16 => INDEX_TYPE_16,
            Self::U32 => INDEX_TYPE_32,
        }
    }

    pub const fn restart_index(self) -> u32 {
        match self {
            Self::U8 => 0xFF,
            Self::U16 => 0xFFFF,
            Self::U32 => 0xFFFF_FFFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub va: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub va: u64,
    /// Number of whole indices in the bound range.
    pub max_count: u32,
    pub index_type: IndexType,
}

/// Values last written to registers that change per draw. `None` means unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawRegCache {
    pub vertex_offset: Option<u32>,
    pub first_instance: Option<u32>,
    pub draw_id: Option<u32>,
    pub num_instances: Option<u32>,
    pub index_type: Option<IndexType>,
    pub primitive_restart_index: Option<u32>,
}

impl DrawRegCache {
    /// Forgets the values held in vertex-shader SGPRs.
    pub fn reset_user_data(&mut self) {
        self.vertex_offset = None;
        self.first_instance = None;
        self.draw_id = None;
    }
}

/// One draw of a multi-draw. `first` is the first vertex, or the first index for indexed
/// draws. `vertex_offset` only applies to indexed draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MultiDrawInfo {
    pub first: u32,
    pub count: u32,
    pub vertex_offset: i32,
}

#[derive(Clone, Copy, Debug)]
struct IndirectArgs {
    va: u64,
    draw_count: u32,
    stride: u32,
    count_va: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
enum DrawSource<'a> {
    Direct(&'a [MultiDrawInfo]),
    Indirect(IndirectArgs),
}

#[derive(Clone, Copy, Debug)]
struct DrawInfo<'a> {
    indexed: bool,
    instance_count: u32,
    first_instance: u32,
    source: DrawSource<'a>,
}

#[derive(Clone, Copy, Debug)]
struct DispatchInfo {
    base: [u32; 3],
    size: [u32; 3],
    indirect_va: Option<u64>,
}

fn sh_reg_field(reg: u32) -> u32 {
    (reg - SH_REG_OFFSET) >> 2
}

impl CommandBuffer {
    pub fn bind_vertex_buffers(&mut self, first: u32, buffers: &[Buffer]) {
        let mut changed = false;
        for (i, buffer) in buffers.iter().enumerate() {
            let slot = first as usize + i;
            assert!(slot < MAX_VERTEX_BUFFERS, "vertex buffer slot {slot} out of range");
            let binding = Some(VertexBufferBinding {
                va: buffer.va(),
                size: buffer.size,
            });
            changed |= self.vertex_bindings[slot] != binding;
            self.vertex_bindings[slot] = binding;
            self.cs.add_buffer(&buffer.bo);
        }
        if changed {
            self.dirty |= CmdDirty::VERTEX_BUFFERS;
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: IndexType) {
        let binding = IndexBufferBinding {
            va: buffer.va(),
            max_count: (buffer.size / index_type.size()).min(u64::from(u32::MAX)) as u32,
            index_type,
        };
        if self.index_buffer != Some(binding) {
            self.index_buffer = Some(binding);
            self.dirty |= CmdDirty::INDEX_BUFFER;
        }
        self.cs.add_buffer(&buffer.bo);
    }

    /// Sets the dynamic vertex input layout. Binding strides are updated along with it.
    pub fn set_vertex_input(&mut self, state: VertexInputState) {
        for binding in &state.bindings {
            self.dynamic
                .set_vertex_binding_strides(binding.binding, &[binding.stride]);
        }
        if self.vertex_input != state {
            self.vertex_input = state;
            self.dynamic.mark_dirty(DynamicStateBits::VERTEX_INPUT);
        }
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        let draws = [MultiDrawInfo {
            first: first_vertex,
            count: vertex_count,
            vertex_offset: 0,
        }];
        self.draw_common(&DrawInfo {
            indexed: false,
            instance_count,
            first_instance,
            source: DrawSource::Direct(&draws),
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        let draws = [MultiDrawInfo {
            first: first_index,
            count: index_count,
            vertex_offset,
        }];
        self.draw_common(&DrawInfo {
            indexed: true,
            instance_count,
            first_instance,
            source: DrawSource::Direct(&draws),
        });
    }

    pub fn draw_multi(&mut self, draws: &[MultiDrawInfo], instance_count: u32, first_instance: u32) {
        self.draw_common(&DrawInfo {
            indexed: false,
            instance_count,
            first_instance,
            source: DrawSource::Direct(draws),
        });
    }

    pub fn draw_multi_indexed(
        &mut self,
        draws: &[MultiDrawInfo],
        instance_count: u32,
        first_instance: u32,
    ) {
        self.draw_common(&DrawInfo {
            indexed: true,
            instance_count,
            first_instance,
            source: DrawSource::Direct(draws),
        });
    }

    fn indirect_args(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        count: Option<(&Buffer, u64)>,
        draw_count: u32,
        stride: u32,
    ) -> IndirectArgs {
        self.cs.add_buffer(&buffer.bo);
        let count_va = count.map(|(count_buffer, count_offset)| {
            self.cs.add_buffer(&count_buffer.bo);
            count_buffer.va() + count_offset
        });
        IndirectArgs {
            va: buffer.va() + offset,
            draw_count,
            stride,
            count_va,
        }
    }

    pub fn draw_indirect(&mut self, buffer: &Buffer, offset: u64, draw_count: u32, stride: u32) {
        let args = self.indirect_args(buffer, offset, None, draw_count, stride);
        self.draw_common(&DrawInfo {
            indexed: false,
            instance_count: 0,
            first_instance: 0,
            source: DrawSource::Indirect(args),
        });
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let args = self.indirect_args(buffer, offset, None, draw_count, stride);
        self.draw_common(&DrawInfo {
            indexed: true,
            instance_count: 0,
            first_instance: 0,
            source: DrawSource::Indirect(args),
        });
    }

    /// Indirect draw whose count is read from `count_buffer`, clamped to `max_draw_count`.
    pub fn draw_indirect_count(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        count_buffer: &Buffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        let args = self.indirect_args(
            buffer,
            offset,
            Some((count_buffer, count_offset)),
            max_draw_count,
            stride,
        );
        self.draw_common(&DrawInfo {
            indexed: false,
            instance_count: 0,
            first_instance: 0,
            source: DrawSource::Indirect(args),
        });
    }

    pub fn draw_indexed_indirect_count(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        count_buffer: &Buffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        let args = self.indirect_args(
            buffer,
            offset,
            Some((count_buffer, count_offset)),
            max_draw_count,
            stride,
        );
        self.draw_common(&DrawInfo {
            indexed: true,
            instance_count: 0,
            first_instance: 0,
            source: DrawSource::Indirect(args),
        });
    }

    fn draw_common(&mut self, info: &DrawInfo<'_>) {
        assert_eq!(self.cs.ip(), HwIp::Gfx, "draws need a graphics command buffer");
        let pipeline = self.pipelines[BindPoint::Graphics.index()]
            .clone()
            .unwrap_or_else(|| panic!("draw without a bound graphics pipeline"));
        if info.indexed {
            assert!(self.index_buffer.is_some(), "indexed draw without an index buffer");
        }
        let draw_count = match info.source {
            DrawSource::Direct(draws) => {
                let drawn = draws.iter().filter(|d| d.count > 0).count();
                if drawn == 0 || info.instance_count == 0 {
                    return;
                }
                drawn as u64
            }
            DrawSource::Indirect(args) => u64::from(args.draw_count),
        };

        if self.pending_flush.intersects(FlushBits::WAIT_FOR_IDLE) {
            self.emit_graphics_state(&pipeline, info);
            self.emit_pending_flush();
            self.flush_graphics_inputs(&pipeline);
        } else {
            self.emit_pending_flush();
            self.emit_prefetch(&pipeline, PrefetchMask::VS | PrefetchMask::VBO_DESCRIPTORS);
            self.flush_graphics_inputs(&pipeline);
            self.emit_graphics_state(&pipeline, info);
        }

        match info.source {
            DrawSource::Direct(draws) => self.emit_direct_draws(&pipeline, info, draws),
            DrawSource::Indirect(args) => self.emit_indirect_draw(&pipeline, info.indexed, &args),
        }
        self.emit_prefetch(&pipeline, PrefetchMask::all());

        if self.caps.gfx_level >= GfxLevel::Gfx9
            && self.render.as_ref().is_some_and(|r| r.has_noncoherent_targets())
        {
            self.rb_noncoherent_dirty = true;
        }
        self.after_draw_or_dispatch(FlushBits::CS_PARTIAL_FLUSH | FlushBits::PS_PARTIAL_FLUSH);
        self.device.stats().add_draws(draw_count);
    }

    /// Descriptor sets, push constants and the vertex-buffer table.
    fn flush_graphics_inputs(&mut self, pipeline: &Pipeline) {
        self.flush_descriptors(BindPoint::Graphics);
        self.flush_constants(BindPoint::Graphics);
        self.flush_vertex_buffers(pipeline);
    }

    /// Pipeline, prolog, index type and dynamic state.
    fn emit_graphics_state(&mut self, pipeline: &Pipeline, info: &DrawInfo<'_>) {
        self.emit_graphics_pipeline();
        self.emit_vs_prolog();
        if info.indexed {
            self.emit_index_type();
        }

        let needed = pipeline.needed_dynamic_state;
        // Consumed by the prolog and the vertex-buffer table, not by registers.
        let mut bits = (self.dynamic.dirty() & needed)
            - (DynamicStateBits::VERTEX_INPUT | DynamicStateBits::VERTEX_INPUT_BINDING_STRIDE);
        // Scissors go last on chips with the scissor bug, after every context roll.
        let late_scissor = self.caps.has_gfx9_scissor_bug && needed.contains(DynamicStateBits::SCISSOR);
        if late_scissor {
            bits -= DynamicStateBits::SCISSOR;
        }

        let inputs = EmitInputs {
            state: self.dynamic.state(),
            regs: &pipeline.graphics_regs,
            caps: &self.caps,
        };
        self.cs.reserve(max_dwords(bits));
        let emitted = emit_dynamic_state(&mut self.cs, &inputs, bits);
        if emitted.touched_context {
            self.context_roll_without_scissor = true;
        }
        let mut cleared = emitted.cleared;
        if late_scissor
            && (self.dynamic.dirty().contains(DynamicStateBits::SCISSOR)
                || self.context_roll_without_scissor)
        {
            self.cs.reserve(max_dwords(DynamicStateBits::SCISSOR));
            let scissor = emit_dynamic_state(&mut self.cs, &inputs, DynamicStateBits::SCISSOR);
            cleared |= scissor.cleared;
            self.context_roll_without_scissor = false;
        }
        self.dynamic.clear_dirty(cleared);
        self.emitted_dynamic.copy_from(self.dynamic.state(), cleared);
        self.emitted_dynamic_valid |= cleared;
    }

    fn emit_index_type(&mut self) {
        let Some(ib) = self.index_buffer else {
            return;
        };
        let index_type = ib.index_type;
        if self.draw_cache.index_type != Some(index_type) {
            self.cs.reserve(3);
            if self.caps.index_type_in_uconfig {
                self.cs
                    .set_uconfig_reg_idx(VGT_INDEX_TYPE_UCONFIG, 2, index_type.hw_value());
            } else {
                self.cs.emit_pkt3(Opcode::IndexType, &[index_type.hw_value()]);
            }
            self.draw_cache.index_type = Some(index_type);
        }

        if self.dynamic.state().primitive_restart_enable {
            let restart = index_type.restart_index();
            if self.draw_cache.primitive_restart_index != Some(restart) {
                self.cs.reserve(3);
                self.cs.set_context_reg(VGT_MULTI_PRIM_IB_RESET_INDX, restart);
                self.draw_cache.primitive_restart_index = Some(restart);
                self.context_roll_without_scissor = true;
            }
        }
    }

    /// Uploads the vertex-buffer descriptor table when bindings or strides changed.
    fn flush_vertex_buffers(&mut self, pipeline: &Pipeline) {
        let strides_dirty = self
            .dynamic
            .dirty()
            .contains(DynamicStateBits::VERTEX_INPUT_BINDING_STRIDE);
        if !self.dirty.contains(CmdDirty::VERTEX_BUFFERS) && !strides_dirty {
            return;
        }
        let mask = pipeline.vb_desc_usage_mask;
        if mask == 0 {
            self.dirty.remove(CmdDirty::VERTEX_BUFFERS);
            return;
        }

        let count = (u32::BITS - mask.leading_zeros()) as usize;
        let strides = &self.dynamic.state().vertex_binding_strides;
        let mut table = Vec::with_capacity(count * 4);
        for (i, binding) in self.vertex_bindings[..count].iter().enumerate() {
            let binding = binding.filter(|_| mask & (1 << i) != 0);
            let Some(binding) = binding else {
                table.extend_from_slice(&[0; 4]);
                continue;
            };
            let stride = strides[i];
            let mut num_records = binding.size.min(u64::from(u32::MAX)) as u32;
            if self.caps.gfx_level != GfxLevel::Gfx8 && stride != 0 {
                num_records /= stride;
            }
            table.extend_from_slice(&[
                binding.va as u32,
                ((binding.va >> 32) as u32 & 0xFFFF) | (stride << 16),
                num_records,
                pipeline.vb_rsrc_word3,
            ]);
        }

        if let Some(va) = self.upload_words(&table) {
            if let Some(vs) = pipeline.shader(ShaderStage::Vertex) {
                if let Some(loc) = vs.user_data.vertex_buffers {
                    emit_pointer(&mut self.cs, vs, loc, va);
                }
            }
            self.vb_table = Some((va, table.len() as u32 * 4));
            if self.prefetch_enabled() {
                self.prefetch |= PrefetchMask::VBO_DESCRIPTORS;
            }
        }
        self.dirty.remove(CmdDirty::VERTEX_BUFFERS);
        self.dynamic
            .clear_dirty(DynamicStateBits::VERTEX_INPUT_BINDING_STRIDE);
    }

    fn cp_dma_prefetch(&mut self, va: u64, size: u32) {
        if size == 0 {
            return;
        }
        self.cs.reserve(7);
        self.cs.emit_pkt3(
            Opcode::DmaData,
            &[
                DMA_DATA_DST_SEL_NOWHERE | DMA_DATA_SRC_SEL_ADDR_TC_L2,
                va as u32,
                (va >> 32) as u32,
                va as u32,
                (va >> 32) as u32,
                size & DMA_DATA_BYTE_COUNT_MASK,
            ],
        );
        self.cp_dma_busy = true;
    }

    /// Prefetches the parts of `pipeline` in `mask` that are still pending.
    fn emit_prefetch(&mut self, pipeline: &Pipeline, mask: PrefetchMask) {
        let mask = self.prefetch & mask;
        if mask.is_empty() {
            return;
        }
        for shader in &pipeline.shaders {
            if mask.contains(PrefetchMask::for_stage(shader.stage)) {
                self.cp_dma_prefetch(shader.va, shader.code_size);
            }
        }
        if mask.contains(PrefetchMask::VBO_DESCRIPTORS) {
            if let Some((va, size)) = self.vb_table {
                self.cp_dma_prefetch(va, size);
            }
        }
        self.prefetch -= mask;
    }

    fn emit_num_instances(&mut self, count: u32) {
        if self.draw_cache.num_instances != Some(count) {
            self.cs.reserve(2);
            self.cs.emit_pkt3(Opcode::NumInstances, &[count]);
            self.draw_cache.num_instances = Some(count);
        }
    }

    /// Writes the vertex offset, draw id and first instance SGPRs when one of them changed.
    fn emit_draw_user_data(
        &mut self,
        pipeline: &Pipeline,
        vertex_offset: u32,
        draw_id: u32,
        first_instance: u32,
    ) {
        let Some(vs) = pipeline.shader(ShaderStage::Vertex) else {
            return;
        };
        let Some(loc) = vs.user_data.base_vertex else {
            return;
        };
        let cache = &self.draw_cache;
        let changed = cache.vertex_offset != Some(vertex_offset)
            || (pipeline.uses_drawid && cache.draw_id != Some(draw_id))
            || (pipeline.uses_base_instance && cache.first_instance != Some(first_instance));
        if !changed {
            return;
        }

        let count = 1 + u32::from(pipeline.uses_drawid) + u32::from(pipeline.uses_base_instance);
        self.cs.reserve(2 + count as usize);
        self.cs.set_sh_reg_seq(vs.user_data_reg(loc), count);
        self.cs.emit(vertex_offset);
        if pipeline.uses_drawid {
            self.cs.emit(draw_id);
        }
        if pipeline.uses_base_instance {
            self.cs.emit(first_instance);
        }
        self.draw_cache.vertex_offset = Some(vertex_offset);
        self.draw_cache.draw_id = Some(draw_id);
        self.draw_cache.first_instance = Some(first_instance);
    }

    fn emit_direct_draws(
        &mut self,
        pipeline: &Pipeline,
        info: &DrawInfo<'_>,
        draws: &[MultiDrawInfo],
    ) {
        self.emit_num_instances(info.instance_count);
        for (i, draw) in draws.iter().enumerate() {
            if draw.count == 0 {
                continue;
            }
            let draw_id = if pipeline.uses_drawid { i as u32 } else { 0 };
            match (info.indexed, self.index_buffer) {
                (true, Some(ib)) => {
                    self.emit_draw_user_data(
                        pipeline,
                        draw.vertex_offset as u32,
                        draw_id,
                        info.first_instance,
                    );
                    let va = ib.va + u64::from(draw.first) * ib.index_type.size();
                    let max_count = ib.max_count.saturating_sub(draw.first);
                    self.cs.reserve(6);
                    self.cs.emit_pkt3(
                        Opcode::DrawIndex2,
                        &[
                            max_count,
                            va as u32,
                            (va >> 32) as u32,
                            draw.count,
                            DI_SRC_SEL_DMA,
                        ],
                    );
                }
                _ => {
                    self.emit_draw_user_data(pipeline, draw.first, draw_id, info.first_instance);
                    self.cs.reserve(3);
                    self.cs
                        .emit_pkt3(Opcode::DrawIndexAuto, &[draw.count, DI_SRC_SEL_AUTO_INDEX]);
                    if self.caps.draw_auto_clobbers_index_type {
                        self.draw_cache.index_type = None;
                    }
                }
            }
        }
    }

    fn emit_indirect_draw(&mut self, pipeline: &Pipeline, indexed: bool, args: &IndirectArgs) {
        self.cs.reserve(4);
        self.cs.emit_pkt3(
            Opcode::SetBase,
            &[BASE_INDEX_DRAW_INDIRECT, args.va as u32, (args.va >> 32) as u32],
        );

        if indexed && self.dirty.contains(CmdDirty::INDEX_BUFFER) {
            if let Some(ib) = self.index_buffer {
                self.cs.reserve(5);
                self.cs
                    .emit_pkt3(Opcode::IndexBase, &[ib.va as u32, (ib.va >> 32) as u32]);
                self.cs.emit_pkt3(Opcode::IndexBufferSize, &[ib.max_count]);
            }
            self.dirty.remove(CmdDirty::INDEX_BUFFER);
        }

        let base_reg = pipeline
            .shader(ShaderStage::Vertex)
            .and_then(|vs| vs.user_data.base_vertex.map(|loc| vs.user_data_reg(loc)));
        let (vertex_field, instance_field, mut draw_id_word) = match base_reg {
            Some(reg) => {
                let instance_reg = reg + if pipeline.uses_drawid { 8 } else { 4 };
                let draw_id = if pipeline.uses_drawid {
                    sh_reg_field(reg + 4) | DRAW_INDEX_ENABLE
                } else {
                    0
                };
                (sh_reg_field(reg), sh_reg_field(instance_reg), draw_id)
            }
            None => (0, 0, 0),
        };
        if args.count_va.is_some() {
            draw_id_word |= COUNT_INDIRECT_ENABLE;
        }
        let count_va = args.count_va.unwrap_or(0);
        let (opcode, source) = if indexed {
            (Opcode::DrawIndexIndirectMulti, DI_SRC_SEL_DMA)
        } else {
            (Opcode::DrawIndirectMulti, DI_SRC_SEL_AUTO_INDEX)
        };
        self.cs.reserve(10);
        self.cs.emit_pkt3(
            opcode,
            &[
                0,
                vertex_field,
                instance_field,
                draw_id_word,
                args.draw_count,
                count_va as u32,
                (count_va >> 32) as u32,
                args.stride,
                source,
            ],
        );

        // The CP wrote the per-draw SGPRs and the instance count.
        self.draw_cache.reset_user_data();
        self.draw_cache.num_instances = None;
        if !indexed && self.caps.draw_auto_clobbers_index_type {
            self.draw_cache.index_type = None;
        }
    }

    fn emit_trace_point(&mut self) {
        let Some(bo) = self.device.trace_bo().cloned() else {
            return;
        };
        self.trace_id = self.trace_id.wrapping_add(1);
        let va = bo.va();
        self.cs.add_buffer(&bo);
        self.cs.reserve(7);
        self.cs.emit_pkt3(
            Opcode::WriteData,
            &[
                WRITE_DATA_DST_SEL_MEM | WRITE_DATA_WR_CONFIRM | WRITE_DATA_ENGINE_ME,
                va as u32,
                (va >> 32) as u32,
                self.trace_id,
            ],
        );
        self.cs
            .emit_pkt3(Opcode::Nop, &[TRACE_POINT_MARKER | (self.trace_id & 0xFFFF)]);
    }

    fn after_draw_or_dispatch(&mut self, sync_bits: FlushBits) {
        let flags = self.debug_flags();
        if flags.contains(DebugFlags::SYNC_SHADERS) {
            self.pending_flush |= sync_bits;
            self.emit_pending_flush();
        }
        if flags.contains(DebugFlags::TRACE) {
            self.emit_trace_point();
        }
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.dispatch_common(&DispatchInfo {
            base: [0; 3],
            size: [x, y, z],
            indirect_va: None,
        });
    }

    /// Dispatch whose workgroup ids start at `base`.
    pub fn dispatch_base(&mut self, base: [u32; 3], size: [u32; 3]) {
        self.dispatch_common(&DispatchInfo {
            base,
            size,
            indirect_va: None,
        });
    }

    pub fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) {
        self.cs.add_buffer(&buffer.bo);
        self.dispatch_common(&DispatchInfo {
            base: [0; 3],
            size: [0; 3],
            indirect_va: Some(buffer.va() + offset),
        });
    }

    fn dispatch_common(&mut self, info: &DispatchInfo) {
        assert_ne!(self.cs.ip(), HwIp::Dma, "dispatch on a DMA command buffer");
        let pipeline = self.pipelines[BindPoint::Compute.index()]
            .clone()
            .unwrap_or_else(|| panic!("dispatch without a bound compute pipeline"));
        if info.indirect_va.is_none() && info.size.contains(&0) {
            return;
        }

        if self.pending_flush.intersects(FlushBits::WAIT_FOR_IDLE) {
            self.emit_compute_pipeline();
            self.emit_pending_flush();
            self.flush_descriptors(BindPoint::Compute);
            self.flush_constants(BindPoint::Compute);
            self.emit_dispatch_packets(&pipeline, info);
            self.emit_prefetch(&pipeline, PrefetchMask::CS);
        } else {
            self.emit_pending_flush();
            self.emit_compute_pipeline();
            self.emit_prefetch(&pipeline, PrefetchMask::CS);
            self.flush_descriptors(BindPoint::Compute);
            self.flush_constants(BindPoint::Compute);
            self.emit_dispatch_packets(&pipeline, info);
        }

        self.after_draw_or_dispatch(FlushBits::CS_PARTIAL_FLUSH);
        self.device.stats().inc_dispatches();
    }

    fn emit_dispatch_packets(&mut self, pipeline: &Pipeline, info: &DispatchInfo) {
        let shader = pipeline
            .shader(ShaderStage::Compute)
            .unwrap_or_else(|| panic!("compute pipeline without a compute shader"));
        let grid_reg = shader.user_data.grid_size.map(|loc| shader.user_data_reg(loc));
        let mut initiator = DISPATCH_COMPUTE_SHADER_EN | DISPATCH_ORDER_MODE;

        match info.indirect_va {
            Some(va) => {
                if let Some(reg) = grid_reg {
                    for i in 0..3u32 {
                        let src = va + u64::from(i) * 4;
                        self.cs.reserve(6);
                        self.cs.emit_pkt3(
                            Opcode::CopyData,
                            &[
                                COPY_DATA_SRC_SEL_MEM | COPY_DATA_DST_SEL_REG | COPY_DATA_WR_CONFIRM,
                                src as u32,
                                (src >> 32) as u32,
                                (reg >> 2) + i,
                                0,
                            ],
                        );
                    }
                }
                self.cs.reserve(7);
                self.cs.emit_pkt3(
                    Opcode::SetBase,
                    &[BASE_INDEX_DRAW_INDIRECT, va as u32, (va >> 32) as u32],
                );
                self.cs
                    .emit(Pkt3Header::new(Opcode::DispatchIndirect, 2).compute().encode());
                self.cs.emit(0);
                self.cs.emit(initiator);
            }
            None => {
                if let Some(reg) = grid_reg {
                    self.cs.reserve(5);
                    self.cs.set_sh_reg_seq(reg, 3);
                    self.cs.emit_slice(&info.size);
                }
                if info.base != [0; 3] {
                    self.cs.reserve(5);
                    self.cs.set_sh_reg_seq(COMPUTE_START_X, 3);
                    self.cs.emit_slice(&info.base);
                } else {
                    initiator |= DISPATCH_FORCE_START_AT_000;
                }
                self.cs.reserve(5);
                self.cs
                    .emit(Pkt3Header::new(Opcode::DispatchDirect, 4).compute().encode());
                self.cs.emit_slice(&info.size);
                self.cs.emit(initiator);
            }
        }
    }
}
