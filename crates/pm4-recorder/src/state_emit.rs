//! Register emission for dynamic state.
//!
//! One table entry per register group. An entry fires when any of its bits is both dirty
//! and consumed by the bound pipeline; the caller clears the fired bits afterwards.

use pm4_protocol::regs::{
    scissor_xy, CB_BLEND_RED, CB_COLOR_CONTROL, CB_COLOR_CONTROL_ROP3_MASK,
    CB_COLOR_CONTROL_ROP3_SHIFT, CB_TARGET_MASK, DB_DEPTH_BOUNDS_MIN, DB_DEPTH_CONTROL,
    DB_DEPTH_CONTROL_BACKFACE_ENABLE, DB_DEPTH_CONTROL_DEPTH_BOUNDS_ENABLE,
    DB_DEPTH_CONTROL_DYNAMIC_MASK, DB_DEPTH_CONTROL_STENCILFUNC_BF_SHIFT,
    DB_DEPTH_CONTROL_STENCILFUNC_SHIFT, DB_DEPTH_CONTROL_STENCIL_ENABLE,
    DB_DEPTH_CONTROL_ZFUNC_SHIFT, DB_DEPTH_CONTROL_Z_ENABLE, DB_DEPTH_CONTROL_Z_WRITE_ENABLE,
    DB_STENCILREFMASK, DB_STENCILREFMASK_STENCILOPVAL, DB_STENCIL_CONTROL, GE_VRS_RATE,
    PA_CL_CLIP_CNTL, PA_CL_CLIP_CNTL_DX_RASTERIZATION_KILL, PA_CL_VPORT_XSCALE, PA_CL_VRS_CNTL,
    PA_SC_AA_SAMPLE_LOCS_PIXEL_X0Y0_0, PA_SC_CENTROID_PRIORITY_0, PA_SC_CLIPRECT_0_TL,
    PA_SC_LINE_STIPPLE, PA_SC_VPORT_SCISSOR_0_TL, PA_SC_VPORT_SCISSOR_WINDOW_OFFSET_DISABLE,
    PA_SC_VPORT_ZMIN_0, PA_SU_LINE_CNTL, PA_SU_POLY_OFFSET_CLAMP, PA_SU_SC_MODE_CNTL,
    PA_SU_SC_MODE_CNTL_CULL_BACK, PA_SU_SC_MODE_CNTL_CULL_FRONT, PA_SU_SC_MODE_CNTL_DYNAMIC_MASK,
    PA_SU_SC_MODE_CNTL_FACE_CW, PA_SU_SC_MODE_CNTL_POLY_OFFSET_BACK_ENABLE,
    PA_SU_SC_MODE_CNTL_POLY_OFFSET_FRONT_ENABLE, PA_SU_SC_MODE_CNTL_POLY_OFFSET_PARA_ENABLE,
    VGT_LS_HS_CONFIG, VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_MASK,
    VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_SHIFT, VGT_MULTI_PRIM_IB_RESET_EN,
    VGT_MULTI_PRIM_IB_RESET_EN_UCONFIG, VGT_PRIMITIVE_TYPE_CONFIG, VGT_PRIMITIVE_TYPE_UCONFIG,
};
use pm4_protocol::{DwordSink, Pm4Emit};

use crate::caps::{ChipCaps, GfxLevel};
use crate::dynamic_state::{
    CullMode, DynamicState, DynamicStateBits, FrontFace, MAX_DISCARD_RECTANGLES, MAX_SCISSORS,
    MAX_VIEWPORTS,
};
use crate::pipeline::GraphicsRegs;

/// Everything an emit function reads.
#[derive(Clone, Copy)]
pub struct EmitInputs<'a> {
    pub state: &'a DynamicState,
    pub regs: &'a GraphicsRegs,
    pub caps: &'a ChipCaps,
}

pub type EmitFn = fn(&mut dyn DwordSink, &EmitInputs<'_>);

pub struct StateEmitter {
    pub mask: DynamicStateBits,
    pub name: &'static str,
    /// Writes context registers, which rolls the hardware context.
    pub touches_context: bool,
    pub max_dwords: usize,
    pub emit: EmitFn,
}

fn emit_viewports(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let viewports = &inputs.state.viewports[..inputs.state.viewport_count as usize];
    if viewports.is_empty() {
        return;
    }
    sink.set_context_reg_seq(PA_CL_VPORT_XSCALE, viewports.len() as u32 * 6);
    for vp in viewports {
        let half_w = vp.width * 0.5;
        let half_h = vp.height * 0.5;
        sink.emit(half_w.to_bits());
        sink.emit((vp.x + half_w).to_bits());
        sink.emit(half_h.to_bits());
        sink.emit((vp.y + half_h).to_bits());
        sink.emit((vp.max_depth - vp.min_depth).to_bits());
        sink.emit(vp.min_depth.to_bits());
    }
    sink.set_context_reg_seq(PA_SC_VPORT_ZMIN_0, viewports.len() as u32 * 2);
    for vp in viewports {
        sink.emit(vp.min_depth.min(vp.max_depth).to_bits());
        sink.emit(vp.min_depth.max(vp.max_depth).to_bits());
    }
}

fn emit_scissors(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let scissors = &inputs.state.scissors[..inputs.state.scissor_count as usize];
    if scissors.is_empty() {
        return;
    }
    sink.set_context_reg_seq(PA_SC_VPORT_SCISSOR_0_TL, scissors.len() as u32 * 2);
    for rect in scissors {
        let x = rect.x.max(0) as u32;
        let y = rect.y.max(0) as u32;
        let right = (i64::from(rect.x) + i64::from(rect.width)).max(0) as u32;
        let bottom = (i64::from(rect.y) + i64::from(rect.height)).max(0) as u32;
        sink.emit(scissor_xy(x, y) | PA_SC_VPORT_SCISSOR_WINDOW_OFFSET_DISABLE);
        sink.emit(scissor_xy(right, bottom));
    }
}

fn emit_line_width(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let width = (inputs.state.line_width * 8.0).clamp(0.0, 65535.0) as u32;
    sink.set_context_reg(PA_SU_LINE_CNTL, width);
}

fn emit_depth_bias(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let bias = &inputs.state.depth_bias;
    let slope = bias.slope * 16.0;
    sink.set_context_reg_seq(PA_SU_POLY_OFFSET_CLAMP, 5);
    sink.emit(bias.clamp.to_bits());
    sink.emit(slope.to_bits());
    sink.emit(bias.constant.to_bits());
    sink.emit(slope.to_bits());
    sink.emit(bias.constant.to_bits());
}

fn emit_blend_constants(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    sink.set_context_reg_seq(CB_BLEND_RED, 4);
    for c in inputs.state.blend_constants {
        sink.emit(c.to_bits());
    }
}

fn emit_depth_bounds(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    sink.set_context_reg_seq(DB_DEPTH_BOUNDS_MIN, 2);
    sink.emit(inputs.state.depth_bounds.min.to_bits());
    sink.emit(inputs.state.depth_bounds.max.to_bits());
}

fn stencil_ref_mask(reference: u32, compare: u32, write: u32) -> u32 {
    (reference & 0xFF)
        | ((compare & 0xFF) << 8)
        | ((write & 0xFF) << 16)
        | DB_STENCILREFMASK_STENCILOPVAL
}

fn emit_stencil_ref_mask(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let s = inputs.state;
    sink.set_context_reg_seq(DB_STENCILREFMASK, 2);
    sink.emit(stencil_ref_mask(
        s.stencil_reference.front,
        s.stencil_compare_mask.front,
        s.stencil_write_mask.front,
    ));
    sink.emit(stencil_ref_mask(
        s.stencil_reference.back,
        s.stencil_compare_mask.back,
        s.stencil_write_mask.back,
    ));
}

fn emit_stencil_control(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let ops = &inputs.state.stencil_op;
    let value = ops.front.fail_op.hw()
        | (ops.front.pass_op.hw() << 4)
        | (ops.front.depth_fail_op.hw() << 8)
        | (ops.back.fail_op.hw() << 12)
        | (ops.back.pass_op.hw() << 16)
        | (ops.back.depth_fail_op.hw() << 20);
    sink.set_context_reg(DB_STENCIL_CONTROL, value);
}

fn emit_discard_rectangles(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let rects = &inputs.state.discard_rectangles[..inputs.state.discard_rectangle_count as usize];
    if rects.is_empty() {
        return;
    }
    sink.set_context_reg_seq(PA_SC_CLIPRECT_0_TL, rects.len() as u32 * 2);
    for rect in rects {
        let x = rect.x.max(0) as u32;
        let y = rect.y.max(0) as u32;
        sink.emit(scissor_xy(x, y));
        sink.emit(scissor_xy(
            x.saturating_add(rect.width),
            y.saturating_add(rect.height),
        ));
    }
}

/// Signed 4-bit sample offset in 1/16 pixel units.
fn sample_offset(coord: f32) -> u32 {
    (((coord - 0.5) * 16.0).round() as i32).clamp(-8, 7) as u32 & 0xF
}

fn emit_sample_locations(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let locs = &inputs.state.sample_locations;
    let samples = &locs.locations[..locs.count as usize];
    let per_pixel = locs.per_pixel.clamp(1, 4) as usize;

    sink.set_context_reg_seq(PA_SC_AA_SAMPLE_LOCS_PIXEL_X0Y0_0, 4);
    for pixel in 0..4 {
        let mut word = 0;
        for sample in 0..per_pixel {
            if let Some(loc) = samples.get(pixel * per_pixel + sample) {
                let shift = (sample * 8) as u32;
                word |= sample_offset(loc.x) << shift;
                word |= sample_offset(loc.y) << (shift + 4);
            }
        }
        sink.emit(word);
    }

    sink.set_context_reg_seq(PA_SC_CENTROID_PRIORITY_0, 2);
    let mut priority = [0u32; 2];
    for i in 0..16u32 {
        let sample = i % per_pixel as u32;
        priority[(i / 8) as usize] |= sample << ((i % 8) * 4);
    }
    sink.emit(priority[0]);
    sink.emit(priority[1]);
}

fn emit_line_stipple(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let stipple = &inputs.state.line_stipple;
    let auto_reset = if inputs.state.primitive_topology.is_line_strip() {
        2
    } else {
        1
    };
    let value = u32::from(stipple.pattern)
        | ((stipple.factor.saturating_sub(1) & 0xFF) << 16)
        | (auto_reset << 24);
    sink.set_context_reg(PA_SC_LINE_STIPPLE, value);
}

fn emit_mode_cntl(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let s = inputs.state;
    let mut value = inputs.regs.pa_su_sc_mode_cntl & !PA_SU_SC_MODE_CNTL_DYNAMIC_MASK;
    if s.cull_mode.contains(CullMode::FRONT) {
        value |= PA_SU_SC_MODE_CNTL_CULL_FRONT;
    }
    if s.cull_mode.contains(CullMode::BACK) {
        value |= PA_SU_SC_MODE_CNTL_CULL_BACK;
    }
    if s.front_face == FrontFace::Clockwise {
        value |= PA_SU_SC_MODE_CNTL_FACE_CW;
    }
    if s.depth_bias_enable {
        value |= PA_SU_SC_MODE_CNTL_POLY_OFFSET_FRONT_ENABLE
            | PA_SU_SC_MODE_CNTL_POLY_OFFSET_BACK_ENABLE
            | PA_SU_SC_MODE_CNTL_POLY_OFFSET_PARA_ENABLE;
    }
    sink.set_context_reg(PA_SU_SC_MODE_CNTL, value);
}

fn emit_primitive_topology(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let prim = inputs.state.primitive_topology.hw();
    if inputs.caps.gfx_level >= GfxLevel::Gfx9 {
        sink.set_uconfig_reg_idx(VGT_PRIMITIVE_TYPE_UCONFIG, 1, prim);
    } else if inputs.caps.has_uconfig_primitive_type {
        sink.set_uconfig_reg(VGT_PRIMITIVE_TYPE_UCONFIG, prim);
    } else {
        sink.set_config_reg(VGT_PRIMITIVE_TYPE_CONFIG, prim);
    }
}

fn emit_depth_control(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let s = inputs.state;
    let mut value = inputs.regs.db_depth_control & !DB_DEPTH_CONTROL_DYNAMIC_MASK;
    if s.depth_test_enable {
        value |= DB_DEPTH_CONTROL_Z_ENABLE;
    }
    if s.depth_write_enable {
        value |= DB_DEPTH_CONTROL_Z_WRITE_ENABLE;
    }
    if s.depth_bounds_test_enable {
        value |= DB_DEPTH_CONTROL_DEPTH_BOUNDS_ENABLE;
    }
    if s.stencil_test_enable {
        value |= DB_DEPTH_CONTROL_STENCIL_ENABLE | DB_DEPTH_CONTROL_BACKFACE_ENABLE;
    }
    value |= s.depth_compare_op.hw() << DB_DEPTH_CONTROL_ZFUNC_SHIFT;
    value |= s.stencil_op.front.compare_op.hw() << DB_DEPTH_CONTROL_STENCILFUNC_SHIFT;
    value |= s.stencil_op.back.compare_op.hw() << DB_DEPTH_CONTROL_STENCILFUNC_BF_SHIFT;
    sink.set_context_reg(DB_DEPTH_CONTROL, value);
}

fn emit_fragment_shading_rate(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    if !inputs.caps.has_vrs {
        return;
    }
    let rate = &inputs.state.fragment_shading_rate;
    let encoded = rate.width.max(1).trailing_zeros() | (rate.height.max(1).trailing_zeros() << 4);
    sink.set_uconfig_reg(GE_VRS_RATE, encoded);
    sink.set_context_reg(
        PA_CL_VRS_CNTL,
        (rate.combiner_ops[0] & 0x7) | ((rate.combiner_ops[1] & 0x7) << 3),
    );
}

fn emit_patch_control_points(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let points = inputs.state.patch_control_points;
    let value = (inputs.regs.vgt_ls_hs_config & !VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_MASK)
        | ((points << VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_SHIFT) & VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_MASK);
    sink.set_context_reg(VGT_LS_HS_CONFIG, value);
}

fn emit_rasterizer_discard(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let mut value = inputs.regs.pa_cl_clip_cntl & !PA_CL_CLIP_CNTL_DX_RASTERIZATION_KILL;
    if inputs.state.rasterizer_discard_enable {
        value |= PA_CL_CLIP_CNTL_DX_RASTERIZATION_KILL;
    }
    sink.set_context_reg(PA_CL_CLIP_CNTL, value);
}

fn emit_logic_op(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let value = (inputs.regs.cb_color_control & !CB_COLOR_CONTROL_ROP3_MASK)
        | (inputs.state.logic_op.rop3() << CB_COLOR_CONTROL_ROP3_SHIFT);
    sink.set_context_reg(CB_COLOR_CONTROL, value);
}

fn emit_primitive_restart_enable(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    let enable = u32::from(inputs.state.primitive_restart_enable);
    if inputs.caps.gfx_level >= GfxLevel::Gfx9 {
        sink.set_uconfig_reg(VGT_MULTI_PRIM_IB_RESET_EN_UCONFIG, enable);
    } else {
        sink.set_context_reg(VGT_MULTI_PRIM_IB_RESET_EN, enable);
    }
}

fn emit_color_write_enable(sink: &mut dyn DwordSink, inputs: &EmitInputs<'_>) {
    sink.set_context_reg(
        CB_TARGET_MASK,
        inputs.regs.cb_target_mask & inputs.state.color_write_enable,
    );
}

/// Vertex-binding strides and the vertex input layout are consumed by the vertex-buffer
/// upload and the prolog, not by register writes, so they have no entry here.
pub static STATE_EMITTERS: &[StateEmitter] = &[
    StateEmitter {
        mask: DynamicStateBits::VIEWPORT,
        name: "viewport",
        touches_context: true,
        max_dwords: 4 + MAX_VIEWPORTS * 8,
        emit: emit_viewports,
    },
    StateEmitter {
        mask: DynamicStateBits::SCISSOR,
        name: "scissor",
        touches_context: true,
        max_dwords: 2 + MAX_SCISSORS * 2,
        emit: emit_scissors,
    },
    StateEmitter {
        mask: DynamicStateBits::LINE_WIDTH,
        name: "line width",
        touches_context: true,
        max_dwords: 3,
        emit: emit_line_width,
    },
    StateEmitter {
        mask: DynamicStateBits::DEPTH_BIAS,
        name: "depth bias",
        touches_context: true,
        max_dwords: 7,
        emit: emit_depth_bias,
    },
    StateEmitter {
        mask: DynamicStateBits::BLEND_CONSTANTS,
        name: "blend constants",
        touches_context: true,
        max_dwords: 6,
        emit: emit_blend_constants,
    },
    StateEmitter {
        mask: DynamicStateBits::DEPTH_BOUNDS,
        name: "depth bounds",
        touches_context: true,
        max_dwords: 4,
        emit: emit_depth_bounds,
    },
    StateEmitter {
        mask: DynamicStateBits::STENCIL_COMPARE_MASK
            .union(DynamicStateBits::STENCIL_WRITE_MASK)
            .union(DynamicStateBits::STENCIL_REFERENCE),
        name: "stencil reference and masks",
        touches_context: true,
        max_dwords: 4,
        emit: emit_stencil_ref_mask,
    },
    StateEmitter {
        mask: DynamicStateBits::STENCIL_OP,
        name: "stencil op",
        touches_context: true,
        max_dwords: 3,
        emit: emit_stencil_control,
    },
    StateEmitter {
        mask: DynamicStateBits::DISCARD_RECTANGLE,
        name: "discard rectangles",
        touches_context: true,
        max_dwords: 2 + MAX_DISCARD_RECTANGLES * 2,
        emit: emit_discard_rectangles,
    },
    StateEmitter {
        mask: DynamicStateBits::SAMPLE_LOCATIONS,
        name: "sample locations",
        touches_context: true,
        max_dwords: 10,
        emit: emit_sample_locations,
    },
    StateEmitter {
        mask: DynamicStateBits::LINE_STIPPLE,
        name: "line stipple",
        touches_context: true,
        max_dwords: 3,
        emit: emit_line_stipple,
    },
    StateEmitter {
        mask: DynamicStateBits::CULL_MODE
            .union(DynamicStateBits::FRONT_FACE)
            .union(DynamicStateBits::DEPTH_BIAS_ENABLE),
        name: "cull mode, front face and depth bias enable",
        touches_context: true,
        max_dwords: 3,
        emit: emit_mode_cntl,
    },
    StateEmitter {
        mask: DynamicStateBits::PRIMITIVE_TOPOLOGY,
        name: "primitive topology",
        touches_context: false,
        max_dwords: 3,
        emit: emit_primitive_topology,
    },
    StateEmitter {
        mask: DynamicStateBits::DEPTH_TEST_ENABLE
            .union(DynamicStateBits::DEPTH_WRITE_ENABLE)
            .union(DynamicStateBits::DEPTH_COMPARE_OP)
            .union(DynamicStateBits::DEPTH_BOUNDS_TEST_ENABLE)
            .union(DynamicStateBits::STENCIL_TEST_ENABLE)
            .union(DynamicStateBits::STENCIL_OP),
        name: "depth and stencil control",
        touches_context: true,
        max_dwords: 3,
        emit: emit_depth_control,
    },
    StateEmitter {
        mask: DynamicStateBits::FRAGMENT_SHADING_RATE,
        name: "fragment shading rate",
        touches_context: true,
        max_dwords: 6,
        emit: emit_fragment_shading_rate,
    },
    StateEmitter {
        mask: DynamicStateBits::PATCH_CONTROL_POINTS,
        name: "patch control points",
        touches_context: true,
        max_dwords: 3,
        emit: emit_patch_control_points,
    },
    StateEmitter {
        mask: DynamicStateBits::RASTERIZER_DISCARD_ENABLE,
        name: "rasterizer discard",
        touches_context: true,
        max_dwords: 3,
        emit: emit_rasterizer_discard,
    },
    StateEmitter {
        mask: DynamicStateBits::LOGIC_OP,
        name: "logic op",
        touches_context: true,
        max_dwords: 3,
        emit: emit_logic_op,
    },
    StateEmitter {
        mask: DynamicStateBits::PRIMITIVE_RESTART_ENABLE,
        name: "primitive restart enable",
        touches_context: false,
        max_dwords: 3,
        emit: emit_primitive_restart_enable,
    },
    StateEmitter {
        mask: DynamicStateBits::COLOR_WRITE_ENABLE,
        name: "color write enable",
        touches_context: true,
        max_dwords: 3,
        emit: emit_color_write_enable,
    },
];

/// Entries that fire for `bits`.
pub fn emitters_for(bits: DynamicStateBits) -> impl Iterator<Item = &'static StateEmitter> {
    STATE_EMITTERS.iter().filter(move |e| e.mask.intersects(bits))
}

/// Upper bound of dwords [`emit_dynamic_state`] writes for `bits`.
pub fn max_dwords(bits: DynamicStateBits) -> usize {
    emitters_for(bits).map(|e| e.max_dwords).sum()
}

/// Result of one [`emit_dynamic_state`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmittedState {
    /// Every bit owned by a fired entry.
    pub cleared: DynamicStateBits,
    pub touched_context: bool,
}

/// Emits the register groups for `bits` in table order.
pub fn emit_dynamic_state(
    sink: &mut dyn DwordSink,
    inputs: &EmitInputs<'_>,
    bits: DynamicStateBits,
) -> EmittedState {
    let mut out = EmittedState::default();
    for emitter in emitters_for(bits) {
        (emitter.emit)(sink, inputs);
        out.cleared |= emitter.mask;
        out.touched_context |= emitter.touches_context;
    }
    out
}
