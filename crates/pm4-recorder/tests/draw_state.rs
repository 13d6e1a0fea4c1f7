mod common;

use common::{graphics_pipeline, harness, opcodes, packets_starting_at, primary, words_since};
use pm4_protocol::regs::{PA_CL_VPORT_XSCALE, PA_SC_VPORT_SCISSOR_0_TL, PA_SU_LINE_CNTL};
use pm4_protocol::{Opcode, RegSpace};
use pm4_recorder::dynamic_state::{Rect2D, StencilFaceFlags, Viewport};
use pm4_recorder::{CommandBuffer, DeviceConfig, DynamicStateBits, GfxLevel};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn viewport(width: f32) -> Viewport {
    Viewport {
        x: 0.0,
        y: 0.0,
        width,
        height: width,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

#[test]
fn viewport_then_redundant_draw() {
    let h = harness(DeviceConfig::default());
    let pipeline = graphics_pipeline(
        &h.device,
        DynamicStateBits::VIEWPORT | DynamicStateBits::SCISSOR,
    );
    let mut cb = primary(&h.device);
    cb.bind_pipeline(&pipeline);
    cb.dynamic_state_mut().set_viewports(0, &[viewport(256.0)]);

    let start = cb.cs().payload_words().len();
    cb.draw(3, 1, 0, 0);
    let first = words_since(&cb, start);
    assert_eq!(packets_starting_at(&first, RegSpace::Context, PA_CL_VPORT_XSCALE), 1);
    assert_eq!(packets_starting_at(&first, RegSpace::Context, PA_SC_VPORT_SCISSOR_0_TL), 0);
    assert_eq!(opcodes(&first).last(), Some(&Opcode::DrawIndexAuto));

    let start = cb.cs().payload_words().len();
    cb.draw(3, 1, 0, 0);
    assert_eq!(opcodes(&words_since(&cb, start)), vec![Opcode::DrawIndexAuto]);
}

#[test]
fn unconsumed_state_is_neither_emitted_nor_cleared() {
    let h = harness(DeviceConfig::default());
    let pipeline = graphics_pipeline(&h.device, DynamicStateBits::VIEWPORT);
    let mut cb = primary(&h.device);
    cb.bind_pipeline(&pipeline);
    cb.dynamic_state_mut().set_viewports(0, &[viewport(64.0)]);
    cb.dynamic_state_mut().set_line_width(4.0);

    let start = cb.cs().payload_words().len();
    cb.draw(3, 1, 0, 0);
    let words = words_since(&cb, start);
    assert_eq!(packets_starting_at(&words, RegSpace::Context, PA_SU_LINE_CNTL), 0);
    assert!(cb.dynamic_state().dirty().contains(DynamicStateBits::LINE_WIDTH));
    assert!(!cb.dynamic_state().dirty().contains(DynamicStateBits::VIEWPORT));

    let wide = graphics_pipeline(
        &h.device,
        DynamicStateBits::VIEWPORT | DynamicStateBits::LINE_WIDTH,
    );
    cb.bind_pipeline(&wide);
    let start = cb.cs().payload_words().len();
    cb.draw(3, 1, 0, 0);
    let words = words_since(&cb, start);
    assert_eq!(packets_starting_at(&words, RegSpace::Context, PA_SU_LINE_CNTL), 1);
    assert_eq!(packets_starting_at(&words, RegSpace::Context, PA_CL_VPORT_XSCALE), 0);
}

#[test]
fn scissor_follows_context_rolls_on_gfx9() {
    let needed = DynamicStateBits::SCISSOR | DynamicStateBits::LINE_WIDTH;
    for (level, expected) in [(GfxLevel::Gfx9, 1), (GfxLevel::Gfx10, 0)] {
        let h = harness(DeviceConfig {
            gfx_level: level,
            ..DeviceConfig::default()
        });
        let pipeline = graphics_pipeline(&h.device, needed);
        let mut cb = primary(&h.device);
        cb.bind_pipeline(&pipeline);
        cb.dynamic_state_mut().set_scissors(
            0,
            &[Rect2D {
                x: 0,
                y: 0,
                width: 32,
                height: 32,
            }],
        );
        cb.draw(3, 1, 0, 0);

        // Only a context register changes; the scissor is rewritten after it where the
        // chip needs that.
        cb.dynamic_state_mut().set_line_width(2.0);
        let start = cb.cs().payload_words().len();
        cb.draw(3, 1, 0, 0);
        let words = words_since(&cb, start);
        assert_eq!(
            packets_starting_at(&words, RegSpace::Context, PA_SC_VPORT_SCISSOR_0_TL),
            expected,
            "{level}"
        );
    }
}

#[derive(Clone, Debug)]
enum StateCall {
    Viewport(u32),
    Scissor(u32),
    LineWidth(u32),
    BlendConstants(u32),
    StencilReference(u32),
    DepthBounds(u32),
}

impl StateCall {
    fn apply(&self, cb: &mut CommandBuffer) {
        let state = cb.dynamic_state_mut();
        match *self {
            Self::Viewport(w) => state.set_viewports(0, &[viewport(w as f32)]),
            Self::Scissor(w) => state.set_scissors(
                0,
                &[Rect2D {
                    x: 0,
                    y: 0,
                    width: w,
                    height: w,
                }],
            ),
            Self::LineWidth(w) => state.set_line_width(w as f32),
            Self::BlendConstants(c) => state.set_blend_constants([c as f32; 4]),
            Self::StencilReference(r) => state.set_stencil_reference(StencilFaceFlags::FRONT, r),
            Self::DepthBounds(d) => state.set_depth_bounds(0.0, d as f32),
        }
    }
}

fn state_call() -> impl Strategy<Value = StateCall> {
    prop_oneof![
        (1u32..4096).prop_map(StateCall::Viewport),
        (1u32..4096).prop_map(StateCall::Scissor),
        (1u32..16).prop_map(StateCall::LineWidth),
        (0u32..8).prop_map(StateCall::BlendConstants),
        (0u32..256).prop_map(StateCall::StencilReference),
        (1u32..8).prop_map(StateCall::DepthBounds),
    ]
}

proptest! {
    #[test]
    fn draws_consume_exactly_the_needed_dirty_state(
        calls in proptest::collection::vec(state_call(), 1..24),
        gfx10 in any::<bool>(),
    ) {
        let h = harness(DeviceConfig {
            gfx_level: if gfx10 { GfxLevel::Gfx10 } else { GfxLevel::Gfx9 },
            ..DeviceConfig::default()
        });
        let needed = DynamicStateBits::VIEWPORT
            | DynamicStateBits::SCISSOR
            | DynamicStateBits::LINE_WIDTH
            | DynamicStateBits::BLEND_CONSTANTS
            | DynamicStateBits::STENCIL_REFERENCE;
        let pipeline = graphics_pipeline(&h.device, needed);
        let mut cb = primary(&h.device);
        cb.bind_pipeline(&pipeline);

        for call in &calls {
            call.apply(&mut cb);
        }
        cb.draw(3, 1, 0, 0);
        prop_assert!((cb.dynamic_state().dirty() & needed).is_empty());
        prop_assert!(cb.dynamic_state().dirty().contains(DynamicStateBits::DEPTH_BOUNDS));

        // Repeating the last value changes nothing, so the next draw is the bare packet.
        if let Some(last) = calls.last() {
            last.apply(&mut cb);
        }
        prop_assert!((cb.dynamic_state().dirty() & needed).is_empty());
        let start = cb.cs().payload_words().len();
        cb.draw(3, 1, 0, 0);
        prop_assert_eq!(opcodes(&words_since(&cb, start)), vec![Opcode::DrawIndexAuto]);
    }
}
