//! Compiled pipelines as handed over by the shader compiler, and their emission.
//!
//! A pipeline carries its shader binaries, a table telling where each dynamic input lives
//! in user SGPRs, the registers it bakes, and the static values of the dynamic state it does
//! not leave dynamic.

use std::sync::Arc;

use bitflags::bitflags;
use pm4_protocol::regs::{self, RegSpace};
use pm4_protocol::{DwordSink, Pm4Emit};
use pm4_winsys::Bo;
use tracing::debug;

use crate::cache::VsPrologKey;
use crate::cmd_buffer::{CmdDirty, CommandBuffer};
use crate::draw::PrefetchMask;
use crate::dynamic_state::{DynamicState, DynamicStateBits};

pub const MAX_SETS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
}

impl BindPoint {
    pub const COUNT: usize = 2;

    pub const fn index(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const TESS_CTRL = 1 << 1;
        const TESS_EVAL = 1 << 2;
        const GEOMETRY = 1 << 3;
        const FRAGMENT = 1 << 4;
        const COMPUTE = 1 << 5;

        const ALL_GRAPHICS = Self::VERTEX.bits()
            | Self::TESS_CTRL.bits()
            | Self::TESS_EVAL.bits()
            | Self::GEOMETRY.bits()
            | Self::FRAGMENT.bits();
    }
}

impl ShaderStage {
    pub const fn bit(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::TessCtrl => ShaderStages::TESS_CTRL,
            Self::TessEval => ShaderStages::TESS_EVAL,
            Self::Geometry => ShaderStages::GEOMETRY,
            Self::Fragment => ShaderStages::FRAGMENT,
            Self::Compute => ShaderStages::COMPUTE,
        }
    }
}

/// A run of user SGPRs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserSgprLoc {
    pub sgpr: u8,
    pub count: u8,
}

/// Where a shader expects each dynamic input. Absent entries are not consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDataLayout {
    /// One 32-bit set address per bound set.
    pub descriptor_sets: [Option<UserSgprLoc>; MAX_SETS],
    /// Address of an uploaded array holding every set address.
    pub indirect_descriptor_sets: Option<UserSgprLoc>,
    /// Address of the uploaded push-constant block followed by dynamic buffer descriptors.
    pub push_constants: Option<UserSgprLoc>,
    /// Push-constant dwords passed directly in SGPRs, starting at
    /// `inline_push_constant_base`.
    pub inline_push_constants: Option<UserSgprLoc>,
    pub inline_push_constant_base: u32,
    /// Address of the uploaded vertex-buffer descriptor table.
    pub vertex_buffers: Option<UserSgprLoc>,
    /// Vertex offset, then the draw id and first instance when the shader reads them.
    pub base_vertex: Option<UserSgprLoc>,
    pub grid_size: Option<UserSgprLoc>,
}

impl UserDataLayout {
    pub fn descriptor_set_mask(&self) -> u32 {
        self.descriptor_sets
            .iter()
            .enumerate()
            .filter(|(_, loc)| loc.is_some())
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }
}

#[derive(Clone, Debug)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub bo: Arc<Bo>,
    pub va: u64,
    pub code_size: u32,
    /// `SPI_SHADER_PGM_LO_*` of the hardware stage this shader runs on.
    pub pgm_lo_reg: u32,
    /// `*_USER_DATA_0` of the hardware stage.
    pub user_data_base: u32,
    pub user_data: UserDataLayout,
}

impl ShaderBinary {
    pub fn user_data_reg(&self, loc: UserSgprLoc) -> u32 {
        regs::user_data_reg(self.user_data_base, loc.sgpr)
    }
}

/// Registers a pipeline writes verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BakedRegisters {
    pub sh: Vec<(u32, u32)>,
    pub context: Vec<(u32, u32)>,
    /// Hash of `context`; pipelines with equal hashes share their context registers.
    pub context_hash: u64,
}

impl BakedRegisters {
    pub fn new(sh: Vec<(u32, u32)>, context: Vec<(u32, u32)>) -> Self {
        let flat: Vec<u32> = context.iter().flat_map(|&(reg, value)| [reg, value]).collect();
        let context_hash = xxhash_rust::xxh3::xxh3_64(bytemuck::cast_slice(&flat));
        Self {
            sh,
            context,
            context_hash,
        }
    }
}

/// Upper bound of dwords [`emit_register_runs`] writes for `count` registers.
pub const fn register_runs_max_dwords(count: usize) -> usize {
    count * 3
}

/// Writes `writes` to `space`, one packet per run of consecutive registers.
pub fn emit_register_runs(sink: &mut dyn DwordSink, space: RegSpace, writes: &[(u32, u32)]) {
    let mut rest = writes;
    while let Some(&(first, _)) = rest.first() {
        let len = rest
            .iter()
            .enumerate()
            .take_while(|&(i, &(reg, _))| reg == first + (i as u32) * 4)
            .count();
        sink.set_reg_seq(space, first, len as u32);
        for &(_, value) in &rest[..len] {
            sink.emit(value);
        }
        rest = &rest[len..];
    }
}

/// Pipeline-baked values of the registers that are partly driven by dynamic state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsRegs {
    pub pa_su_sc_mode_cntl: u32,
    pub db_depth_control: u32,
    pub cb_color_control: u32,
    pub cb_target_mask: u32,
    pub pa_cl_clip_cntl: u32,
    pub vgt_ls_hs_config: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetLayout {
    pub dynamic_buffer_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineLayout {
    pub sets: Vec<SetLayout>,
    pub push_constant_size: u32,
}

impl PipelineLayout {
    /// Index of the first dynamic buffer of `set` in the command buffer's dynamic buffer
    /// array.
    pub fn dynamic_offset_start(&self, set: usize) -> u32 {
        self.sets
            .iter()
            .take(set)
            .map(|s| s.dynamic_buffer_count)
            .sum()
    }

    pub fn dynamic_buffer_count(&self) -> u32 {
        self.sets.iter().map(|s| s.dynamic_buffer_count).sum()
    }
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    pub bind_point: BindPoint,
    pub shaders: Vec<ShaderBinary>,
    pub layout: Arc<PipelineLayout>,
    /// Dynamic-state fields the pipeline consumes.
    pub needed_dynamic_state: DynamicStateBits,
    /// Fields left to the command buffer; all others come from `static_state`.
    pub dynamic_states: DynamicStateBits,
    pub static_state: DynamicState,
    pub registers: BakedRegisters,
    pub graphics_regs: GraphicsRegs,
    pub need_indirect_descriptor_sets: bool,
    pub uses_drawid: bool,
    pub uses_base_instance: bool,
    /// Vertex bindings the vertex shader fetches from.
    pub vb_desc_usage_mask: u32,
    /// Fourth dword of every vertex-buffer descriptor (format and swizzle).
    pub vb_rsrc_word3: u32,
    /// The vertex input layout is dynamic and fetched by a separately compiled prolog.
    pub dynamic_vertex_input: bool,
}

impl Pipeline {
    pub fn new(
        bind_point: BindPoint,
        shaders: Vec<ShaderBinary>,
        layout: Arc<PipelineLayout>,
    ) -> Self {
        Self {
            bind_point,
            shaders,
            layout,
            needed_dynamic_state: DynamicStateBits::empty(),
            dynamic_states: DynamicStateBits::empty(),
            static_state: DynamicState::default(),
            registers: BakedRegisters::default(),
            graphics_regs: GraphicsRegs::default(),
            need_indirect_descriptor_sets: false,
            uses_drawid: false,
            uses_base_instance: false,
            vb_desc_usage_mask: 0,
            vb_rsrc_word3: 0,
            dynamic_vertex_input: false,
        }
    }

    pub fn active_stages(&self) -> ShaderStages {
        self.shaders
            .iter()
            .fold(ShaderStages::empty(), |stages, s| stages | s.stage.bit())
    }

    pub fn shader(&self, stage: ShaderStage) -> Option<&ShaderBinary> {
        self.shaders.iter().find(|s| s.stage == stage)
    }

    /// Sets consumed by any stage.
    pub fn descriptor_set_mask(&self) -> u32 {
        self.shaders
            .iter()
            .fold(0, |mask, s| mask | s.user_data.descriptor_set_mask())
    }
}

/// Dynamic-state fields whose registers merge bits baked by the pipeline. They have to be
/// rewritten when the baked half changes.
fn redirty_for_baked_change(old: Option<&GraphicsRegs>, new: &GraphicsRegs) -> DynamicStateBits {
    let mode_cntl = DynamicStateBits::CULL_MODE
        | DynamicStateBits::FRONT_FACE
        | DynamicStateBits::DEPTH_BIAS_ENABLE;
    let depth_control = DynamicStateBits::DEPTH_TEST_ENABLE
        | DynamicStateBits::DEPTH_WRITE_ENABLE
        | DynamicStateBits::DEPTH_COMPARE_OP
        | DynamicStateBits::DEPTH_BOUNDS_TEST_ENABLE
        | DynamicStateBits::STENCIL_TEST_ENABLE
        | DynamicStateBits::STENCIL_OP;

    let Some(old) = old else {
        return mode_cntl
            | depth_control
            | DynamicStateBits::LOGIC_OP
            | DynamicStateBits::COLOR_WRITE_ENABLE
            | DynamicStateBits::RASTERIZER_DISCARD_ENABLE
            | DynamicStateBits::PATCH_CONTROL_POINTS;
    };
    let mut bits = DynamicStateBits::empty();
    if old.pa_su_sc_mode_cntl != new.pa_su_sc_mode_cntl {
        bits |= mode_cntl;
    }
    if old.db_depth_control != new.db_depth_control {
        bits |= depth_control;
    }
    if old.cb_color_control != new.cb_color_control {
        bits |= DynamicStateBits::LOGIC_OP;
    }
    if old.cb_target_mask != new.cb_target_mask {
        bits |= DynamicStateBits::COLOR_WRITE_ENABLE;
    }
    if old.pa_cl_clip_cntl != new.pa_cl_clip_cntl {
        bits |= DynamicStateBits::RASTERIZER_DISCARD_ENABLE;
    }
    if old.vgt_ls_hs_config != new.vgt_ls_hs_config {
        bits |= DynamicStateBits::PATCH_CONTROL_POINTS;
    }
    bits
}

impl CommandBuffer {
    /// Binds `pipeline`. Rebinding the bound pipeline does nothing; a switch copies the
    /// pipeline's static state and invalidates everything addressed through user SGPRs.
    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) {
        let bp = pipeline.bind_point.index();
        if self.pipelines[bp]
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, pipeline))
        {
            return;
        }

        match pipeline.bind_point {
            BindPoint::Graphics => {
                let baked = pipeline.needed_dynamic_state - pipeline.dynamic_states;
                self.dynamic.bind(&pipeline.static_state, baked);
                if self.emitted_pipelines[bp]
                    .as_ref()
                    .is_some_and(|emitted| Arc::ptr_eq(emitted, pipeline))
                {
                    self.clear_unchanged_dynamic_state();
                }
                self.dirty |= CmdDirty::GRAPHICS_PIPELINE;
                if pipeline.vb_desc_usage_mask != 0 {
                    self.dirty |= CmdDirty::VERTEX_BUFFERS;
                }
                if pipeline.dynamic_vertex_input {
                    self.dynamic.mark_dirty(DynamicStateBits::VERTEX_INPUT);
                }
                self.draw_cache.reset_user_data();
            }
            BindPoint::Compute => self.dirty |= CmdDirty::COMPUTE_PIPELINE,
        }
        if self.prefetch_enabled() {
            self.prefetch |= pipeline
                .shaders
                .iter()
                .fold(PrefetchMask::empty(), |mask, s| mask | PrefetchMask::for_stage(s.stage));
        }
        self.descriptors[bp].invalidate();
        self.pipelines[bp] = Some(pipeline.clone());
        debug!(
            bind_point = ?pipeline.bind_point,
            stages = ?pipeline.active_stages(),
            "bound pipeline"
        );
    }

    /// Drops dirty bits whose values equal what the registers already hold. Only sound while
    /// the bound graphics pipeline is the one last emitted.
    fn clear_unchanged_dynamic_state(&mut self) {
        // The stipple register also encodes the topology.
        let known = self.emitted_dynamic_valid - DynamicStateBits::LINE_STIPPLE;
        let mut current = self.emitted_dynamic.clone();
        let changed = current.copy_from(self.dynamic.state(), known);
        self.dynamic.clear_dirty(known - changed);
    }

    fn emit_shader_registers(&mut self, pipeline: &Pipeline) {
        for shader in &pipeline.shaders {
            self.cs.add_buffer(&shader.bo);
            self.cs.reserve(4);
            self.cs.set_sh_reg_seq(shader.pgm_lo_reg, 2);
            self.cs.emit((shader.va >> 8) as u32);
            self.cs.emit((shader.va >> 40) as u32);
        }
        let sh = &pipeline.registers.sh;
        self.cs.reserve(register_runs_max_dwords(sh.len()));
        emit_register_runs(&mut self.cs, RegSpace::Sh, sh);
    }

    /// Writes the bound graphics pipeline if it differs from the one last written. Context
    /// registers are skipped when their hash matches what the hardware already holds.
    pub(crate) fn emit_graphics_pipeline(&mut self) {
        if !self.dirty.contains(CmdDirty::GRAPHICS_PIPELINE) {
            return;
        }
        self.dirty.remove(CmdDirty::GRAPHICS_PIPELINE);
        let Some(pipeline) = self.pipelines[BindPoint::Graphics.index()].clone() else {
            return;
        };
        let old = self.emitted_pipelines[BindPoint::Graphics.index()].clone();
        if old.as_ref().is_some_and(|old| Arc::ptr_eq(old, &pipeline)) {
            return;
        }

        let redirty = redirty_for_baked_change(
            old.as_deref().map(|old| &old.graphics_regs),
            &pipeline.graphics_regs,
        );
        self.dynamic.mark_dirty(redirty);
        // Those registers mix in the old pipeline's baked bits.
        self.emitted_dynamic_valid -= redirty;
        self.emit_shader_registers(&pipeline);

        let context = &pipeline.registers;
        if self.emitted_context_hash != Some(context.context_hash) {
            self.cs.reserve(register_runs_max_dwords(context.context.len()));
            emit_register_runs(&mut self.cs, RegSpace::Context, &context.context);
            self.emitted_context_hash = Some(context.context_hash);
            if !context.context.is_empty() {
                self.context_roll_without_scissor = true;
            }
        }
        if pipeline.dynamic_vertex_input {
            self.emitted_vs_prolog = None;
        }
        self.emitted_pipelines[BindPoint::Graphics.index()] = Some(pipeline);
    }

    pub(crate) fn emit_compute_pipeline(&mut self) {
        if !self.dirty.contains(CmdDirty::COMPUTE_PIPELINE) {
            return;
        }
        self.dirty.remove(CmdDirty::COMPUTE_PIPELINE);
        let Some(pipeline) = self.pipelines[BindPoint::Compute.index()].clone() else {
            return;
        };
        let emitted = &self.emitted_pipelines[BindPoint::Compute.index()];
        if emitted.as_ref().is_some_and(|e| Arc::ptr_eq(e, &pipeline)) {
            return;
        }
        self.emit_shader_registers(&pipeline);
        self.emitted_pipelines[BindPoint::Compute.index()] = Some(pipeline);
    }

    /// Looks up the prolog for the current vertex input layout and points the vertex stage
    /// at it when it changed.
    pub(crate) fn emit_vs_prolog(&mut self) {
        let Some(pipeline) = self.pipelines[BindPoint::Graphics.index()].clone() else {
            return;
        };
        if !pipeline.dynamic_vertex_input {
            return;
        }
        if !self.dynamic.dirty().contains(DynamicStateBits::VERTEX_INPUT)
            && self.emitted_vs_prolog.is_some()
        {
            return;
        }

        let key = VsPrologKey::new(&self.vertex_input);
        let prolog = match self.device.vs_prolog(&key) {
            Ok(prolog) => prolog,
            Err(err) => {
                self.set_error(err);
                return;
            }
        };
        self.dynamic.clear_dirty(DynamicStateBits::VERTEX_INPUT);
        if self
            .emitted_vs_prolog
            .as_ref()
            .is_some_and(|emitted| Arc::ptr_eq(emitted, &prolog))
        {
            return;
        }

        let vs = pipeline
            .shader(ShaderStage::Vertex)
            .unwrap_or_else(|| panic!("dynamic vertex input without a vertex shader"));
        self.cs.add_buffer(&prolog.bo);
        self.cs.reserve(4);
        self.cs.set_sh_reg_seq(vs.pgm_lo_reg, 2);
        self.cs.emit((prolog.va >> 8) as u32);
        self.cs.emit((prolog.va >> 40) as u32);
        self.emitted_vs_prolog = Some(prolog);
    }
}
