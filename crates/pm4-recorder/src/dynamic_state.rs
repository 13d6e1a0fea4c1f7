//! Dynamic state values and their dirty tracking.
//!
//! Every field has one dirty bit. A bit is raised only when a write actually changes the
//! stored value; array-valued fields compare their used prefix bytewise.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

pub const MAX_VIEWPORTS: usize = 16;
pub const MAX_SCISSORS: usize = 16;
pub const MAX_DISCARD_RECTANGLES: usize = 4;
pub const MAX_SAMPLE_LOCATIONS: usize = 32;
pub const MAX_VERTEX_BINDINGS: usize = 32;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DynamicStateBits: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const LINE_WIDTH = 1 << 2;
        const DEPTH_BIAS = 1 << 3;
        const BLEND_CONSTANTS = 1 << 4;
        const DEPTH_BOUNDS = 1 << 5;
        const STENCIL_COMPARE_MASK = 1 << 6;
        const STENCIL_WRITE_MASK = 1 << 7;
        const STENCIL_REFERENCE = 1 << 8;
        const STENCIL_OP = 1 << 9;
        const DISCARD_RECTANGLE = 1 << 10;
        const SAMPLE_LOCATIONS = 1 << 11;
        const LINE_STIPPLE = 1 << 12;
        const CULL_MODE = 1 << 13;
        const FRONT_FACE = 1 << 14;
        const PRIMITIVE_TOPOLOGY = 1 << 15;
        const DEPTH_TEST_ENABLE = 1 << 16;
        const DEPTH_WRITE_ENABLE = 1 << 17;
        const DEPTH_COMPARE_OP = 1 << 18;
        const DEPTH_BOUNDS_TEST_ENABLE = 1 << 19;
        const STENCIL_TEST_ENABLE = 1 << 20;
        const VERTEX_INPUT_BINDING_STRIDE = 1 << 21;
        const FRAGMENT_SHADING_RATE = 1 << 22;
        const PATCH_CONTROL_POINTS = 1 << 23;
        const RASTERIZER_DISCARD_ENABLE = 1 << 24;
        const DEPTH_BIAS_ENABLE = 1 << 25;
        const LOGIC_OP = 1 << 26;
        const PRIMITIVE_RESTART_ENABLE = 1 << 27;
        const COLOR_WRITE_ENABLE = 1 << 28;
        /// The vertex input layout itself lives with the command buffer.
        const VERTEX_INPUT = 1 << 29;

        const ALL = (1 << 30) - 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SampleLocation {
    pub x: f32,
    pub y: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct DepthBias {
    pub constant: f32,
    pub clamp: f32,
    pub slope: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DepthBounds {
    pub min: f32,
    pub max: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilFaces {
    pub front: u32,
    pub back: u32,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StencilFaceFlags: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
        const FRONT_AND_BACK = Self::FRONT.bits() | Self::BACK.bits();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    #[default]
    Always,
}

impl CompareOp {
    pub const fn hw(self) -> u32 {
        self as u32
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

impl StencilOp {
    pub const fn hw(self) -> u32 {
        match self {
            Self::Keep => 0,
            Self::Zero => 1,
            Self::Replace => 5,
            Self::IncrementAndClamp => 2,
            Self::DecrementAndClamp => 3,
            Self::Invert => 4,
            Self::IncrementAndWrap => 6,
            Self::DecrementAndWrap => 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StencilOps {
    pub front: StencilOpState,
    pub back: StencilOpState,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CullMode: u32 {
        const FRONT = 1 << 0;
        const BACK = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
    LineListWithAdjacency,
    LineStripWithAdjacency,
    TriangleListWithAdjacency,
    TriangleStripWithAdjacency,
    PatchList,
}

impl PrimitiveTopology {
    /// `VGT_PRIMITIVE_TYPE` encoding.
    pub const fn hw(self) -> u32 {
        match self {
            Self::PointList => 0x01,
            Self::LineList => 0x02,
            Self::LineStrip => 0x03,
            Self::TriangleList => 0x04,
            Self::TriangleFan => 0x05,
            Self::TriangleStrip => 0x06,
            Self::LineListWithAdjacency => 0x0A,
            Self::LineStripWithAdjacency => 0x0B,
            Self::TriangleListWithAdjacency => 0x0C,
            Self::TriangleStripWithAdjacency => 0x0D,
            Self::PatchList => 0x22,
        }
    }

    pub const fn is_line_strip(self) -> bool {
        matches!(self, Self::LineStrip)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LogicOp {
    Clear,
    And,
    AndReverse,
    #[default]
    Copy,
    AndInverted,
    NoOp,
    Xor,
    Or,
    Nor,
    Equivalent,
    Invert,
    OrReverse,
    CopyInverted,
    OrInverted,
    Nand,
    Set,
}

impl LogicOp {
    /// ROP3 code for `CB_COLOR_CONTROL`.
    pub const fn rop3(self) -> u32 {
        match self {
            Self::Clear => 0x00,
            Self::And => 0x88,
            Self::AndReverse => 0x44,
            Self::Copy => 0xCC,
            Self::AndInverted => 0x22,
            Self::NoOp => 0xAA,
            Self::Xor => 0x66,
            Self::Or => 0xEE,
            Self::Nor => 0x11,
            Self::Equivalent => 0x99,
            Self::Invert => 0x55,
            Self::OrReverse => 0xDD,
            Self::CopyInverted => 0x33,
            Self::OrInverted => 0xBB,
            Self::Nand => 0x77,
            Self::Set => 0xFF,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LineStipple {
    pub factor: u32,
    pub pattern: u16,
}

impl Default for LineStipple {
    fn default() -> Self {
        Self {
            factor: 1,
            pattern: 0xFFFF,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct FragmentShadingRate {
    pub width: u32,
    pub height: u32,
    pub combiner_ops: [u32; 2],
}

impl Default for FragmentShadingRate {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            combiner_ops: [0; 2],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleLocations {
    pub per_pixel: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub count: u32,
    pub locations: [SampleLocation; MAX_SAMPLE_LOCATIONS],
}

impl Default for SampleLocations {
    fn default() -> Self {
        Self {
            per_pixel: 1,
            grid_width: 1,
            grid_height: 1,
            count: 0,
            locations: [SampleLocation::default(); MAX_SAMPLE_LOCATIONS],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DynamicState {
    pub viewport_count: u32,
    pub viewports: [Viewport; MAX_VIEWPORTS],
    pub scissor_count: u32,
    pub scissors: [Rect2D; MAX_SCISSORS],
    pub line_width: f32,
    pub depth_bias: DepthBias,
    pub blend_constants: [f32; 4],
    pub depth_bounds: DepthBounds,
    pub stencil_compare_mask: StencilFaces,
    pub stencil_write_mask: StencilFaces,
    pub stencil_reference: StencilFaces,
    pub stencil_op: StencilOps,
    pub discard_rectangle_count: u32,
    pub discard_rectangles: [Rect2D; MAX_DISCARD_RECTANGLES],
    pub sample_locations: SampleLocations,
    pub line_stipple: LineStipple,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub primitive_topology: PrimitiveTopology,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub vertex_binding_strides: [u32; MAX_VERTEX_BINDINGS],
    pub fragment_shading_rate: FragmentShadingRate,
    pub patch_control_points: u32,
    pub rasterizer_discard_enable: bool,
    pub depth_bias_enable: bool,
    pub logic_op: LogicOp,
    pub primitive_restart_enable: bool,
    /// Four bits per color attachment.
    pub color_write_enable: u32,
}

impl Default for DynamicState {
    fn default() -> Self {
        Self {
            viewport_count: 0,
            viewports: [Viewport::default(); MAX_VIEWPORTS],
            scissor_count: 0,
            scissors: [Rect2D::default(); MAX_SCISSORS],
            line_width: 1.0,
            depth_bias: DepthBias::default(),
            blend_constants: [0.0; 4],
            depth_bounds: DepthBounds { min: 0.0, max: 1.0 },
            stencil_compare_mask: StencilFaces {
                front: !0,
                back: !0,
            },
            stencil_write_mask: StencilFaces {
                front: !0,
                back: !0,
            },
            stencil_reference: StencilFaces::default(),
            stencil_op: StencilOps::default(),
            discard_rectangle_count: 0,
            discard_rectangles: [Rect2D::default(); MAX_DISCARD_RECTANGLES],
            sample_locations: SampleLocations::default(),
            line_stipple: LineStipple::default(),
            cull_mode: CullMode::empty(),
            front_face: FrontFace::default(),
            primitive_topology: PrimitiveTopology::default(),
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: CompareOp::default(),
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            vertex_binding_strides: [0; MAX_VERTEX_BINDINGS],
            fragment_shading_rate: FragmentShadingRate::default(),
            patch_control_points: 0,
            rasterizer_discard_enable: false,
            depth_bias_enable: false,
            logic_op: LogicOp::default(),
            primitive_restart_enable: false,
            color_write_enable: !0,
        }
    }
}

fn update<T: PartialEq>(dst: &mut T, src: T) -> bool {
    if *dst == src {
        return false;
    }
    *dst = src;
    true
}

fn update_pod<T: Pod>(dst: &mut T, src: &T) -> bool {
    if bytemuck::bytes_of(dst) == bytemuck::bytes_of(src) {
        return false;
    }
    *dst = *src;
    true
}

fn update_slice<T: Pod>(dst: &mut [T], src: &[T]) -> bool {
    debug_assert_eq!(dst.len(), src.len());
    if bytemuck::cast_slice::<T, u8>(dst) == bytemuck::cast_slice::<T, u8>(src) {
        return false;
    }
    dst.copy_from_slice(src);
    true
}

impl DynamicState {
    /// Copies the fields selected by `mask` from `src` and returns the bits of the fields
    /// whose value changed.
    pub fn copy_from(&mut self, src: &DynamicState, mask: DynamicStateBits) -> DynamicStateBits {
        let mut changed = DynamicStateBits::empty();
        let mut mark = |bit: DynamicStateBits, differs: bool| {
            if differs {
                changed |= bit;
            }
        };

        if mask.contains(DynamicStateBits::VIEWPORT) {
            let n = src.viewport_count as usize;
            let count = update(&mut self.viewport_count, src.viewport_count);
            let values = update_slice(&mut self.viewports[..n], &src.viewports[..n]);
            mark(DynamicStateBits::VIEWPORT, count | values);
        }
        if mask.contains(DynamicStateBits::SCISSOR) {
            let n = src.scissor_count as usize;
            let count = update(&mut self.scissor_count, src.scissor_count);
            let values = update_slice(&mut self.scissors[..n], &src.scissors[..n]);
            mark(DynamicStateBits::SCISSOR, count | values);
        }
        if mask.contains(DynamicStateBits::DISCARD_RECTANGLE) {
            let n = src.discard_rectangle_count as usize;
            let count = update(&mut self.discard_rectangle_count, src.discard_rectangle_count);
            let values =
                update_slice(&mut self.discard_rectangles[..n], &src.discard_rectangles[..n]);
            mark(DynamicStateBits::DISCARD_RECTANGLE, count | values);
        }
        if mask.contains(DynamicStateBits::SAMPLE_LOCATIONS) {
            let dst = &mut self.sample_locations;
            let other = &src.sample_locations;
            let n = other.count as usize;
            let header = update(&mut dst.per_pixel, other.per_pixel)
                | update(&mut dst.grid_width, other.grid_width)
                | update(&mut dst.grid_height, other.grid_height)
                | update(&mut dst.count, other.count);
            let values = update_slice(&mut dst.locations[..n], &other.locations[..n]);
            mark(DynamicStateBits::SAMPLE_LOCATIONS, header | values);
        }
        if mask.contains(DynamicStateBits::VERTEX_INPUT_BINDING_STRIDE) {
            mark(
                DynamicStateBits::VERTEX_INPUT_BINDING_STRIDE,
                update_slice(&mut self.vertex_binding_strides, &src.vertex_binding_strides),
            );
        }

        if mask.contains(DynamicStateBits::LINE_WIDTH) {
            mark(
                DynamicStateBits::LINE_WIDTH,
                update_pod(&mut self.line_width, &src.line_width),
            );
        }
        if mask.contains(DynamicStateBits::DEPTH_BIAS) {
            mark(
                DynamicStateBits::DEPTH_BIAS,
                update_pod(&mut self.depth_bias, &src.depth_bias),
            );
        }
        if mask.contains(DynamicStateBits::BLEND_CONSTANTS) {
            mark(
                DynamicStateBits::BLEND_CONSTANTS,
                update_pod(&mut self.blend_constants, &src.blend_constants),
            );
        }
        if mask.contains(DynamicStateBits::DEPTH_BOUNDS) {
            mark(
                DynamicStateBits::DEPTH_BOUNDS,
                update_pod(&mut self.depth_bounds, &src.depth_bounds),
            );
        }
        if mask.contains(DynamicStateBits::FRAGMENT_SHADING_RATE) {
            mark(
                DynamicStateBits::FRAGMENT_SHADING_RATE,
                update_pod(&mut self.fragment_shading_rate, &src.fragment_shading_rate),
            );
        }

        if mask.contains(DynamicStateBits::PRIMITIVE_TOPOLOGY) {
            let was_line_strip = self.primitive_topology.is_line_strip();
            if update(&mut self.primitive_topology, src.primitive_topology) {
                mark(DynamicStateBits::PRIMITIVE_TOPOLOGY, true);
                mark(
                    DynamicStateBits::LINE_STIPPLE,
                    was_line_strip != self.primitive_topology.is_line_strip(),
                );
            }
        }

        let scalars: [(DynamicStateBits, bool); 18] = [
            (
                DynamicStateBits::STENCIL_COMPARE_MASK,
                mask.contains(DynamicStateBits::STENCIL_COMPARE_MASK)
                    && update(&mut self.stencil_compare_mask, src.stencil_compare_mask),
            ),
            (
                DynamicStateBits::STENCIL_WRITE_MASK,
                mask.contains(DynamicStateBits::STENCIL_WRITE_MASK)
                    && update(&mut self.stencil_write_mask, src.stencil_write_mask),
            ),
            (
                DynamicStateBits::STENCIL_REFERENCE,
                mask.contains(DynamicStateBits::STENCIL_REFERENCE)
                    && update(&mut self.stencil_reference, src.stencil_reference),
            ),
            (
                DynamicStateBits::STENCIL_OP,
                mask.contains(DynamicStateBits::STENCIL_OP)
                    && update(&mut self.stencil_op, src.stencil_op),
            ),
            (
                DynamicStateBits::LINE_STIPPLE,
                mask.contains(DynamicStateBits::LINE_STIPPLE)
                    && update(&mut self.line_stipple, src.line_stipple),
            ),
            (
                DynamicStateBits::CULL_MODE,
                mask.contains(DynamicStateBits::CULL_MODE)
                    && update(&mut self.cull_mode, src.cull_mode),
            ),
            (
                DynamicStateBits::FRONT_FACE,
                mask.contains(DynamicStateBits::FRONT_FACE)
                    && update(&mut self.front_face, src.front_face),
            ),
            (
                DynamicStateBits::DEPTH_TEST_ENABLE,
                mask.contains(DynamicStateBits::DEPTH_TEST_ENABLE)
                    && update(&mut self.depth_test_enable, src.depth_test_enable),
            ),
            (
                DynamicStateBits::DEPTH_WRITE_ENABLE,
                mask.contains(DynamicStateBits::DEPTH_WRITE_ENABLE)
                    && update(&mut self.depth_write_enable, src.depth_write_enable),
            ),
            (
                DynamicStateBits::DEPTH_COMPARE_OP,
                mask.contains(DynamicStateBits::DEPTH_COMPARE_OP)
                    && update(&mut self.depth_compare_op, src.depth_compare_op),
            ),
            (
                DynamicStateBits::DEPTH_BOUNDS_TEST_ENABLE,
                mask.contains(DynamicStateBits::DEPTH_BOUNDS_TEST_ENABLE)
                    && update(&mut self.depth_bounds_test_enable, src.depth_bounds_test_enable),
            ),
            (
                DynamicStateBits::STENCIL_TEST_ENABLE,
                mask.contains(DynamicStateBits::STENCIL_TEST_ENABLE)
                    && update(&mut self.stencil_test_enable, src.stencil_test_enable),
            ),
            (
                DynamicStateBits::PATCH_CONTROL_POINTS,
                mask.contains(DynamicStateBits::PATCH_CONTROL_POINTS)
                    && update(&mut self.patch_control_points, src.patch_control_points),
            ),
            (
                DynamicStateBits::RASTERIZER_DISCARD_ENABLE,
                mask.contains(DynamicStateBits::RASTERIZER_DISCARD_ENABLE)
                    && update(
                        &mut self.rasterizer_discard_enable,
                        src.rasterizer_discard_enable,
                    ),
            ),
            (
                DynamicStateBits::DEPTH_BIAS_ENABLE,
                mask.contains(DynamicStateBits::DEPTH_BIAS_ENABLE)
                    && update(&mut self.depth_bias_enable, src.depth_bias_enable),
            ),
            (
                DynamicStateBits::LOGIC_OP,
                mask.contains(DynamicStateBits::LOGIC_OP)
                    && update(&mut self.logic_op, src.logic_op),
            ),
            (
                DynamicStateBits::PRIMITIVE_RESTART_ENABLE,
                mask.contains(DynamicStateBits::PRIMITIVE_RESTART_ENABLE)
                    && update(&mut self.primitive_restart_enable, src.primitive_restart_enable),
            ),
            (
                DynamicStateBits::COLOR_WRITE_ENABLE,
                mask.contains(DynamicStateBits::COLOR_WRITE_ENABLE)
                    && update(&mut self.color_write_enable, src.color_write_enable),
            ),
        ];
        for (bit, differs) in scalars {
            mark(bit, differs);
        }
        changed
    }
}

/// Holds the current dynamic state of a command buffer plus the set of fields that have
/// to be re-emitted before the next draw.
#[derive(Clone, Debug, Default)]
pub struct DynamicStateTracker {
    state: DynamicState,
    dirty: DynamicStateBits,
}

impl DynamicStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DynamicState {
        &self.state
    }

    pub fn dirty(&self) -> DynamicStateBits {
        self.dirty
    }

    pub fn mark_dirty(&mut self, bits: DynamicStateBits) {
        self.dirty |= bits;
    }

    pub fn clear_dirty(&mut self, bits: DynamicStateBits) {
        self.dirty &= !bits;
    }

    /// Resets every value to its default and marks everything dirty.
    pub fn reset(&mut self) {
        self.state = DynamicState::default();
        self.dirty = DynamicStateBits::ALL;
    }

    /// Copies the static values a pipeline bakes in for the fields in `mask`. Returns the
    /// bits that were raised.
    pub fn bind(&mut self, src: &DynamicState, mask: DynamicStateBits) -> DynamicStateBits {
        let changed = self.state.copy_from(src, mask);
        self.dirty |= changed;
        changed
    }

    fn raise(&mut self, bit: DynamicStateBits, changed: bool) {
        if changed {
            self.dirty |= bit;
        }
    }

    pub fn set_viewports(&mut self, first: u32, viewports: &[Viewport]) {
        let start = first as usize;
        let end = start + viewports.len();
        assert!(end <= MAX_VIEWPORTS, "viewport range {start}..{end} out of bounds");
        let values = update_slice(&mut self.state.viewports[start..end], viewports);
        let grown = self.state.viewport_count.max(end as u32);
        let count = update(&mut self.state.viewport_count, grown);
        self.raise(DynamicStateBits::VIEWPORT, values | count);
    }

    pub fn set_scissors(&mut self, first: u32, scissors: &[Rect2D]) {
        let start = first as usize;
        let end = start + scissors.len();
        assert!(end <= MAX_SCISSORS, "scissor range {start}..{end} out of bounds");
        let values = update_slice(&mut self.state.scissors[start..end], scissors);
        let grown = self.state.scissor_count.max(end as u32);
        let count = update(&mut self.state.scissor_count, grown);
        self.raise(DynamicStateBits::SCISSOR, values | count);
    }

    pub fn set_discard_rectangles(&mut self, first: u32, rects: &[Rect2D]) {
        let start = first as usize;
        let end = start + rects.len();
        assert!(
            end <= MAX_DISCARD_RECTANGLES,
            "discard rectangle range {start}..{end} out of bounds"
        );
        let values = update_slice(&mut self.state.discard_rectangles[start..end], rects);
        let grown = self.state.discard_rectangle_count.max(end as u32);
        let count = update(&mut self.state.discard_rectangle_count, grown);
        self.raise(DynamicStateBits::DISCARD_RECTANGLE, values | count);
    }

    pub fn set_line_width(&mut self, width: f32) {
        let changed = update_pod(&mut self.state.line_width, &width);
        self.raise(DynamicStateBits::LINE_WIDTH, changed);
    }

    pub fn set_depth_bias(&mut self, constant: f32, clamp: f32, slope: f32) {
        let bias = DepthBias {
            constant,
            clamp,
            slope,
        };
        let changed = update_pod(&mut self.state.depth_bias, &bias);
        self.raise(DynamicStateBits::DEPTH_BIAS, changed);
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        let changed = update_pod(&mut self.state.blend_constants, &constants);
        self.raise(DynamicStateBits::BLEND_CONSTANTS, changed);
    }

    pub fn set_depth_bounds(&mut self, min: f32, max: f32) {
        let changed = update_pod(&mut self.state.depth_bounds, &DepthBounds { min, max });
        self.raise(DynamicStateBits::DEPTH_BOUNDS, changed);
    }

    fn set_faces(faces: &mut StencilFaces, which: StencilFaceFlags, value: u32) -> bool {
        let mut changed = false;
        if which.contains(StencilFaceFlags::FRONT) {
            changed |= update(&mut faces.front, value);
        }
        if which.contains(StencilFaceFlags::BACK) {
            changed |= update(&mut faces.back, value);
        }
        changed
    }

    pub fn set_stencil_compare_mask(&mut self, faces: StencilFaceFlags, mask: u32) {
        let changed = Self::set_faces(&mut self.state.stencil_compare_mask, faces, mask);
        self.raise(DynamicStateBits::STENCIL_COMPARE_MASK, changed);
    }

    pub fn set_stencil_write_mask(&mut self, faces: StencilFaceFlags, mask: u32) {
        let changed = Self::set_faces(&mut self.state.stencil_write_mask, faces, mask);
        self.raise(DynamicStateBits::STENCIL_WRITE_MASK, changed);
    }

    pub fn set_stencil_reference(&mut self, faces: StencilFaceFlags, reference: u32) {
        let changed = Self::set_faces(&mut self.state.stencil_reference, faces, reference);
        self.raise(DynamicStateBits::STENCIL_REFERENCE, changed);
    }

    pub fn set_stencil_op(&mut self, faces: StencilFaceFlags, op: StencilOpState) {
        let mut changed = false;
        if faces.contains(StencilFaceFlags::FRONT) {
            changed |= update(&mut self.state.stencil_op.front, op);
        }
        if faces.contains(StencilFaceFlags::BACK) {
            changed |= update(&mut self.state.stencil_op.back, op);
        }
        self.raise(DynamicStateBits::STENCIL_OP, changed);
    }

    /// Sample locations apply to one sample count; `locations` holds
    /// `per_pixel * grid_width * grid_height` entries.
    pub fn set_sample_locations(
        &mut self,
        per_pixel: u32,
        grid_width: u32,
        grid_height: u32,
        locations: &[SampleLocation],
    ) {
        assert!(locations.len() <= MAX_SAMPLE_LOCATIONS);
        let dst = &mut self.state.sample_locations;
        let n = locations.len();
        let header = update(&mut dst.per_pixel, per_pixel)
            | update(&mut dst.grid_width, grid_width)
            | update(&mut dst.grid_height, grid_height)
            | update(&mut dst.count, n as u32);
        let values = update_slice(&mut dst.locations[..n], locations);
        self.raise(DynamicStateBits::SAMPLE_LOCATIONS, header | values);
    }

    pub fn set_line_stipple(&mut self, factor: u32, pattern: u16) {
        let changed = update(&mut self.state.line_stipple, LineStipple { factor, pattern });
        self.raise(DynamicStateBits::LINE_STIPPLE, changed);
    }

    pub fn set_cull_mode(&mut self, cull_mode: CullMode) {
        let changed = update(&mut self.state.cull_mode, cull_mode);
        self.raise(DynamicStateBits::CULL_MODE, changed);
    }

    pub fn set_front_face(&mut self, front_face: FrontFace) {
        let changed = update(&mut self.state.front_face, front_face);
        self.raise(DynamicStateBits::FRONT_FACE, changed);
    }

    /// Switching to or from line strips also re-dirties the line stipple, whose auto-reset
    /// mode depends on the topology.
    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        let was_line_strip = self.state.primitive_topology.is_line_strip();
        let changed = update(&mut self.state.primitive_topology, topology);
        self.raise(DynamicStateBits::PRIMITIVE_TOPOLOGY, changed);
        self.raise(
            DynamicStateBits::LINE_STIPPLE,
            was_line_strip != topology.is_line_strip(),
        );
    }

    pub fn set_depth_test_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.depth_test_enable, enable);
        self.raise(DynamicStateBits::DEPTH_TEST_ENABLE, changed);
    }

    pub fn set_depth_write_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.depth_write_enable, enable);
        self.raise(DynamicStateBits::DEPTH_WRITE_ENABLE, changed);
    }

    pub fn set_depth_compare_op(&mut self, op: CompareOp) {
        let changed = update(&mut self.state.depth_compare_op, op);
        self.raise(DynamicStateBits::DEPTH_COMPARE_OP, changed);
    }

    pub fn set_depth_bounds_test_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.depth_bounds_test_enable, enable);
        self.raise(DynamicStateBits::DEPTH_BOUNDS_TEST_ENABLE, changed);
    }

    pub fn set_stencil_test_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.stencil_test_enable, enable);
        self.raise(DynamicStateBits::STENCIL_TEST_ENABLE, changed);
    }

    pub fn set_vertex_binding_strides(&mut self, first: u32, strides: &[u32]) {
        let start = first as usize;
        let end = start + strides.len();
        assert!(end <= MAX_VERTEX_BINDINGS, "binding range {start}..{end} out of bounds");
        let changed = update_slice(&mut self.state.vertex_binding_strides[start..end], strides);
        self.raise(DynamicStateBits::VERTEX_INPUT_BINDING_STRIDE, changed);
    }

    pub fn set_fragment_shading_rate(&mut self, rate: FragmentShadingRate) {
        let changed = update_pod(&mut self.state.fragment_shading_rate, &rate);
        self.raise(DynamicStateBits::FRAGMENT_SHADING_RATE, changed);
    }

    pub fn set_patch_control_points(&mut self, points: u32) {
        let changed = update(&mut self.state.patch_control_points, points);
        self.raise(DynamicStateBits::PATCH_CONTROL_POINTS, changed);
    }

    pub fn set_rasterizer_discard_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.rasterizer_discard_enable, enable);
        self.raise(DynamicStateBits::RASTERIZER_DISCARD_ENABLE, changed);
    }

    pub fn set_depth_bias_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.depth_bias_enable, enable);
        self.raise(DynamicStateBits::DEPTH_BIAS_ENABLE, changed);
    }

    pub fn set_logic_op(&mut self, op: LogicOp) {
        let changed = update(&mut self.state.logic_op, op);
        self.raise(DynamicStateBits::LOGIC_OP, changed);
    }

    pub fn set_primitive_restart_enable(&mut self, enable: bool) {
        let changed = update(&mut self.state.primitive_restart_enable, enable);
        self.raise(DynamicStateBits::PRIMITIVE_RESTART_ENABLE, changed);
    }

    /// Each attachment gets four channel bits; attachments beyond `enables` stay disabled.
    pub fn set_color_write_enable(&mut self, enables: &[bool]) {
        let mask = enables
            .iter()
            .take(8)
            .enumerate()
            .filter(|(_, enabled)| **enabled)
            .fold(0u32, |mask, (i, _)| mask | (0xF << (i * 4)));
        let changed = update(&mut self.state.color_write_enable, mask);
        self.raise(DynamicStateBits::COLOR_WRITE_ENABLE, changed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn viewport(w: f32) -> Viewport {
        Viewport {
            width: w,
            height: w,
            max_depth: 1.0,
            ..Viewport::default()
        }
    }

    #[test]
    fn identical_write_does_not_dirty() {
        let mut tracker = DynamicStateTracker::new();
        tracker.set_viewports(0, &[viewport(64.0)]);
        assert_eq!(tracker.dirty(), DynamicStateBits::VIEWPORT);
        tracker.clear_dirty(DynamicStateBits::ALL);

        tracker.set_viewports(0, &[viewport(64.0)]);
        tracker.set_line_width(1.0);
        tracker.set_cull_mode(CullMode::empty());
        assert_eq!(tracker.dirty(), DynamicStateBits::empty());

        tracker.set_viewports(0, &[viewport(32.0)]);
        assert_eq!(tracker.dirty(), DynamicStateBits::VIEWPORT);
    }

    #[test]
    fn viewport_count_grows_with_range() {
        let mut tracker = DynamicStateTracker::new();
        tracker.set_viewports(2, &[viewport(1.0), viewport(2.0)]);
        assert_eq!(tracker.state().viewport_count, 4);
        tracker.set_viewports(0, &[viewport(3.0)]);
        assert_eq!(tracker.state().viewport_count, 4);
    }

    #[test]
    fn bind_only_copies_masked_fields() {
        let mut tracker = DynamicStateTracker::new();
        let mut baked = DynamicState::default();
        baked.line_width = 4.0;
        baked.cull_mode = CullMode::BACK;

        let raised = tracker.bind(&baked, DynamicStateBits::LINE_WIDTH);
        assert_eq!(raised, DynamicStateBits::LINE_WIDTH);
        assert_eq!(tracker.state().line_width, 4.0);
        assert_eq!(tracker.state().cull_mode, CullMode::empty());

        let raised = tracker.bind(&baked, DynamicStateBits::ALL);
        assert_eq!(raised, DynamicStateBits::CULL_MODE);
        assert_eq!(tracker.bind(&baked, DynamicStateBits::ALL), DynamicStateBits::empty());
    }

    #[test]
    fn line_strip_toggle_dirties_stipple() {
        let mut tracker = DynamicStateTracker::new();
        tracker.set_primitive_topology(PrimitiveTopology::LineList);
        assert!(!tracker.dirty().contains(DynamicStateBits::LINE_STIPPLE));

        tracker.set_primitive_topology(PrimitiveTopology::LineStrip);
        assert!(tracker.dirty().contains(DynamicStateBits::LINE_STIPPLE));
        tracker.clear_dirty(DynamicStateBits::ALL);

        tracker.set_primitive_topology(PrimitiveTopology::TriangleStrip);
        assert_eq!(
            tracker.dirty(),
            DynamicStateBits::PRIMITIVE_TOPOLOGY | DynamicStateBits::LINE_STIPPLE
        );

        let mut baked = DynamicState::default();
        baked.primitive_topology = PrimitiveTopology::LineStrip;
        let raised = tracker.bind(&baked, DynamicStateBits::PRIMITIVE_TOPOLOGY);
        assert!(raised.contains(DynamicStateBits::LINE_STIPPLE));
    }

    #[test]
    fn stencil_faces_are_independent() {
        let mut tracker = DynamicStateTracker::new();
        tracker.set_stencil_reference(StencilFaceFlags::BACK, 7);
        assert_eq!(
            tracker.state().stencil_reference,
            StencilFaces { front: 0, back: 7 }
        );
        tracker.clear_dirty(DynamicStateBits::ALL);
        tracker.set_stencil_reference(StencilFaceFlags::BACK, 7);
        assert!(tracker.dirty().is_empty());
    }

    #[test]
    fn color_write_enable_expands_per_attachment() {
        let mut tracker = DynamicStateTracker::new();
        tracker.set_color_write_enable(&[true, false, true]);
        assert_eq!(tracker.state().color_write_enable, 0x0F0F);
    }

    #[derive(Clone, Debug)]
    enum Op {
        LineWidth(f32),
        BlendConstants([f32; 4]),
        DepthBounds(f32, f32),
        StencilReference(StencilFaceFlags, u32),
        CullMode(CullMode),
        DepthTestEnable(bool),
        Viewport(u32, f32),
        Topology(PrimitiveTopology),
        PatchControlPoints(u32),
        Emit,
    }

    impl Op {
        fn apply(&self, tracker: &mut DynamicStateTracker) {
            match *self {
                Op::LineWidth(w) => tracker.set_line_width(w),
                Op::BlendConstants(c) => tracker.set_blend_constants(c),
                Op::DepthBounds(min, max) => tracker.set_depth_bounds(min, max),
                Op::StencilReference(faces, r) => tracker.set_stencil_reference(faces, r),
                Op::CullMode(mode) => tracker.set_cull_mode(mode),
                Op::DepthTestEnable(enable) => tracker.set_depth_test_enable(enable),
                Op::Viewport(i, w) => tracker.set_viewports(i, &[viewport(w)]),
                Op::Topology(t) => tracker.set_primitive_topology(t),
                Op::PatchControlPoints(n) => tracker.set_patch_control_points(n),
                Op::Emit => tracker.clear_dirty(DynamicStateBits::ALL),
            }
        }

        /// Applies the write to a plain copy of the state and returns the bits of the
        /// fields whose value it changed.
        fn model(&self, s: &mut DynamicState) -> DynamicStateBits {
            let before = s.clone();
            match *self {
                Op::LineWidth(w) => s.line_width = w,
                Op::BlendConstants(c) => s.blend_constants = c,
                Op::DepthBounds(min, max) => s.depth_bounds = DepthBounds { min, max },
                Op::StencilReference(faces, r) => {
                    if faces.contains(StencilFaceFlags::FRONT) {
                        s.stencil_reference.front = r;
                    }
                    if faces.contains(StencilFaceFlags::BACK) {
                        s.stencil_reference.back = r;
                    }
                }
                Op::CullMode(mode) => s.cull_mode = mode,
                Op::DepthTestEnable(enable) => s.depth_test_enable = enable,
                Op::Viewport(i, w) => {
                    s.viewports[i as usize] = viewport(w);
                    s.viewport_count = s.viewport_count.max(i + 1);
                }
                Op::Topology(t) => s.primitive_topology = t,
                Op::PatchControlPoints(n) => s.patch_control_points = n,
                Op::Emit => {}
            }
            [
                (DynamicStateBits::LINE_WIDTH, before.line_width != s.line_width),
                (DynamicStateBits::BLEND_CONSTANTS, before.blend_constants != s.blend_constants),
                (DynamicStateBits::DEPTH_BOUNDS, before.depth_bounds != s.depth_bounds),
                (
                    DynamicStateBits::STENCIL_REFERENCE,
                    before.stencil_reference != s.stencil_reference,
                ),
                (DynamicStateBits::CULL_MODE, before.cull_mode != s.cull_mode),
                (
                    DynamicStateBits::DEPTH_TEST_ENABLE,
                    before.depth_test_enable != s.depth_test_enable,
                ),
                (
                    DynamicStateBits::VIEWPORT,
                    before.viewport_count != s.viewport_count || before.viewports != s.viewports,
                ),
                (
                    DynamicStateBits::PRIMITIVE_TOPOLOGY,
                    before.primitive_topology != s.primitive_topology,
                ),
                (
                    DynamicStateBits::LINE_STIPPLE,
                    before.primitive_topology.is_line_strip()
                        != s.primitive_topology.is_line_strip(),
                ),
                (
                    DynamicStateBits::PATCH_CONTROL_POINTS,
                    before.patch_control_points != s.patch_control_points,
                ),
            ]
            .into_iter()
            .filter(|(_, changed)| *changed)
            .fold(DynamicStateBits::empty(), |bits, (bit, _)| bits | bit)
        }
    }

    // Few distinct values so that repeated writes are common.
    fn small_f32() -> impl Strategy<Value = f32> {
        (0u8..3).prop_map(f32::from)
    }

    fn op() -> impl Strategy<Value = Op> {
        let faces = prop_oneof![
            Just(StencilFaceFlags::FRONT),
            Just(StencilFaceFlags::BACK),
            Just(StencilFaceFlags::FRONT_AND_BACK),
        ];
        prop_oneof![
            small_f32().prop_map(Op::LineWidth),
            prop::array::uniform4(small_f32()).prop_map(Op::BlendConstants),
            (small_f32(), small_f32()).prop_map(|(min, max)| Op::DepthBounds(min, max)),
            (faces, 0u32..3).prop_map(|(f, r)| Op::StencilReference(f, r)),
            (0u32..4).prop_map(|b| Op::CullMode(CullMode::from_bits_truncate(b))),
            any::<bool>().prop_map(Op::DepthTestEnable),
            (0u32..3, small_f32()).prop_map(|(i, w)| Op::Viewport(i, w)),
            prop::sample::select(vec![
                PrimitiveTopology::TriangleList,
                PrimitiveTopology::LineList,
                PrimitiveTopology::LineStrip,
                PrimitiveTopology::PointList,
            ])
            .prop_map(Op::Topology),
            (0u32..3).prop_map(Op::PatchControlPoints),
            Just(Op::Emit),
        ]
    }

    proptest! {
        #[test]
        fn dirty_mask_is_union_of_changing_writes(ops in prop::collection::vec(op(), 1..48)) {
            let mut tracker = DynamicStateTracker::new();
            tracker.clear_dirty(DynamicStateBits::ALL);
            let mut model = DynamicState::default();
            let mut expected = DynamicStateBits::empty();

            for op in &ops {
                op.apply(&mut tracker);
                expected |= op.model(&mut model);
                if let Op::Emit = op {
                    expected = DynamicStateBits::empty();
                }
                prop_assert_eq!(tracker.dirty(), expected, "after {:?}", op);
            }
            prop_assert_eq!(tracker.state(), &model);
        }
    }

    #[test]
    fn logic_op_table() {
        assert_eq!(LogicOp::Copy.rop3(), 0xCC);
        assert_eq!(LogicOp::Xor.rop3(), 0x66);
        assert_eq!(LogicOp::Set.rop3(), 0xFF);
    }
}
