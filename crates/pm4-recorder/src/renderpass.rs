//! Render passes with resolved subpass layouts.
//!
//! Layout resolution happens before recording: every subpass already knows the layout each
//! attachment must be in and the barrier to apply when it starts. The recorder applies those
//! barriers, hands layout changes to the meta-operation collaborator and writes the
//! framebuffer registers.

use std::sync::Arc;

use pm4_protocol::regs::{
    scissor_xy, CB_COLOR0_BASE, CB_COLOR_STRIDE, DB_Z_INFO, DB_Z_INFO_FORMAT_Z32_FLOAT,
    PA_SC_WINDOW_SCISSOR_TL,
};
use pm4_protocol::{DwordSink, Pm4Emit};
use pm4_winsys::{CmdStream, HwIp};
use tracing::debug;

use crate::barrier::{dst_access_flush, src_access_flush, stage_flush, AccessFlags, PipelineStageFlags};
use crate::cmd_buffer::CommandBuffer;
use crate::flush::FlushBits;
use crate::resources::{Image, ImageLayout};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Helper passes (decompressions, fast-clear eliminations) that run inside the command
/// buffer's own stream.
pub trait MetaOps: Send + Sync {
    /// Appends the packets moving `image` from `old` to `new` and returns the flushes
    /// required before the image is accessed in `new`.
    fn transition_layout(
        &self,
        cs: &mut CmdStream,
        image: &Image,
        old: ImageLayout,
        new: ImageLayout,
    ) -> FlushBits;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubpassBarrier {
    pub src_stages: PipelineStageFlags,
    pub dst_stages: PipelineStageFlags,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: ImageLayout,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubpassDesc {
    pub color_attachments: Vec<AttachmentRef>,
    pub depth_stencil_attachment: Option<AttachmentRef>,
    /// Applied when the subpass begins.
    pub start_barrier: SubpassBarrier,
}

impl SubpassDesc {
    fn attachment_refs(&self) -> impl Iterator<Item = &AttachmentRef> {
        self.color_attachments
            .iter()
            .chain(self.depth_stencil_attachment.iter())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderPass {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    /// Applied after the last subpass.
    pub end_barrier: SubpassBarrier,
}

#[derive(Clone, Debug)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub attachments: Vec<Image>,
}

/// The render pass instance a command buffer is inside of.
#[derive(Clone, Debug)]
pub struct RenderPassState {
    pass: Arc<RenderPass>,
    framebuffer: Arc<Framebuffer>,
    subpass: usize,
    layouts: Vec<ImageLayout>,
}

impl RenderPassState {
    pub fn subpass_index(&self) -> usize {
        self.subpass
    }

    pub fn layout(&self, attachment: u32) -> ImageLayout {
        self.layouts[attachment as usize]
    }

    fn subpass(&self) -> &SubpassDesc {
        &self.pass.subpasses[self.subpass]
    }

    /// The current subpass renders to a target whose writes bypass L2 coherence.
    pub fn has_noncoherent_targets(&self) -> bool {
        self.subpass()
            .attachment_refs()
            .any(|r| !self.framebuffer.attachments[r.attachment as usize].l2_coherent)
    }
}

impl CommandBuffer {
    /// Runs the layout transition of `image` through the meta-operation collaborator.
    /// Without one, transitions are no-ops.
    pub(crate) fn transition_image_layout(
        &mut self,
        image: &Image,
        old: ImageLayout,
        new: ImageLayout,
    ) {
        let Some(meta) = self.device.meta_ops().cloned() else {
            return;
        };
        self.emit_pending_flush();
        self.cs.add_buffer(&image.bo);
        let before = self.cs.cdw();
        let flush = meta.transition_layout(&mut self.cs, image, old, new);
        self.pending_flush |= flush;
        if self.cs.cdw() != before {
            self.invalidate_emitted_state();
        }
    }

    fn apply_subpass_barrier(&mut self, barrier: &SubpassBarrier) {
        self.pending_flush |= src_access_flush(barrier.src_access, None);
        self.pending_flush |= stage_flush(barrier.src_stages, barrier.dst_stages);

        let ctx = self.flush_context();
        let attachments = self
            .render
            .as_ref()
            .map(|r| r.framebuffer.clone())
            .map_or_else(Vec::new, |fb| fb.attachments.clone());
        if attachments.is_empty() {
            self.pending_flush |= dst_access_flush(&ctx, barrier.dst_access, None);
        }
        for image in &attachments {
            self.pending_flush |= dst_access_flush(&ctx, barrier.dst_access, Some(image));
        }
    }

    /// Moves every attachment the current subpass uses into the layout it expects.
    fn subpass_transitions(&mut self) {
        let Some(render) = self.render.as_ref() else {
            return;
        };
        let framebuffer = render.framebuffer.clone();
        let changes: Vec<(u32, ImageLayout, ImageLayout)> = render
            .subpass()
            .attachment_refs()
            .filter(|r| render.layout(r.attachment) != r.layout)
            .map(|r| (r.attachment, render.layout(r.attachment), r.layout))
            .collect();

        for (attachment, old, new) in changes {
            self.transition_image_layout(&framebuffer.attachments[attachment as usize], old, new);
            if let Some(render) = self.render.as_mut() {
                render.layouts[attachment as usize] = new;
            }
        }
    }

    fn emit_framebuffer_state(&mut self) {
        let Some(render) = self.render.as_ref() else {
            return;
        };
        let framebuffer = render.framebuffer.clone();
        let subpass = render.subpass().clone();

        for (slot, color) in subpass.color_attachments.iter().enumerate() {
            let image = &framebuffer.attachments[color.attachment as usize];
            let va = image.va();
            self.cs.reserve(4);
            self.cs
                .set_context_reg_seq(CB_COLOR0_BASE + slot as u32 * CB_COLOR_STRIDE, 2);
            self.cs.emit((va >> 8) as u32);
            self.cs.emit(image.pitch);
        }

        self.cs.reserve(8);
        self.cs.set_context_reg_seq(DB_Z_INFO, 6);
        match subpass.depth_stencil_attachment {
            Some(depth) => {
                let va = framebuffer.attachments[depth.attachment as usize].va();
                let base = (va >> 8) as u32;
                self.cs.emit_slice(&[DB_Z_INFO_FORMAT_Z32_FLOAT, 0, base, base, base, base]);
            }
            None => self.cs.emit_slice(&[0; 6]),
        }

        self.cs.reserve(4);
        self.cs.set_context_reg_seq(PA_SC_WINDOW_SCISSOR_TL, 2);
        self.cs.emit(scissor_xy(0, 0));
        self.cs
            .emit(scissor_xy(framebuffer.width, framebuffer.height));
        self.context_roll_without_scissor = true;
    }

    fn begin_subpass(&mut self) {
        let Some(barrier) = self.render.as_ref().map(|r| r.subpass().start_barrier) else {
            return;
        };
        self.apply_subpass_barrier(&barrier);
        self.subpass_transitions();
        self.emit_framebuffer_state();
    }

    pub fn begin_render_pass(&mut self, pass: &Arc<RenderPass>, framebuffer: &Arc<Framebuffer>) {
        assert_eq!(self.cs.ip(), HwIp::Gfx, "render passes need a graphics command buffer");
        assert!(self.render.is_none(), "render pass already active");
        assert!(!pass.subpasses.is_empty(), "render pass without subpasses");
        assert_eq!(
            pass.attachments.len(),
            framebuffer.attachments.len(),
            "framebuffer does not match the render pass"
        );
        assert!(pass
            .subpasses
            .iter()
            .all(|s| s.color_attachments.len() <= MAX_COLOR_ATTACHMENTS));

        for image in &framebuffer.attachments {
            self.cs.add_buffer(&image.bo);
        }
        self.render = Some(RenderPassState {
            pass: pass.clone(),
            framebuffer: framebuffer.clone(),
            subpass: 0,
            layouts: pass.attachments.iter().map(|a| a.initial_layout).collect(),
        });
        debug!(
            attachments = framebuffer.attachments.len(),
            subpasses = pass.subpasses.len(),
            "began render pass"
        );
        self.begin_subpass();
    }

    pub fn next_subpass(&mut self) {
        let render = self
            .render
            .as_mut()
            .unwrap_or_else(|| panic!("next_subpass outside a render pass"));
        assert!(
            render.subpass + 1 < render.pass.subpasses.len(),
            "no subpass after {}",
            render.subpass
        );
        render.subpass += 1;
        self.begin_subpass();
    }

    pub fn end_render_pass(&mut self) {
        let Some(render) = self.render.as_ref() else {
            panic!("end_render_pass outside a render pass");
        };
        let end_barrier = render.pass.end_barrier;
        let framebuffer = render.framebuffer.clone();
        let changes: Vec<(usize, ImageLayout, ImageLayout)> = render
            .pass
            .attachments
            .iter()
            .enumerate()
            .filter(|(i, a)| render.layouts[*i] != a.final_layout)
            .map(|(i, a)| (i, render.layouts[i], a.final_layout))
            .collect();

        self.apply_subpass_barrier(&end_barrier);
        for (attachment, old, new) in changes {
            self.transition_image_layout(&framebuffer.attachments[attachment], old, new);
        }
        self.render = None;
    }

    pub fn render_pass_state(&self) -> Option<&RenderPassState> {
        self.render.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::Collaborators;
    use crate::pipeline::{BindPoint, UserDataLayout};
    use crate::resources::ImageUsage;
    use crate::test_util::{test_cmd_buffer, test_device_with, test_image, test_pipeline};
    use pm4_protocol::regs::{CB_COLOR0_PITCH, PA_SC_WINDOW_SCISSOR_BR};
    use pm4_protocol::{register_writes, Opcode};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingMeta {
        transitions: Mutex<Vec<(ImageLayout, ImageLayout)>>,
    }

    impl MetaOps for RecordingMeta {
        fn transition_layout(
            &self,
            cs: &mut CmdStream,
            _image: &Image,
            old: ImageLayout,
            new: ImageLayout,
        ) -> FlushBits {
            self.transitions.lock().unwrap().push((old, new));
            cs.reserve(2);
            cs.emit_pkt3(Opcode::Nop, &[0xDEC0]);
            FlushBits::FLUSH_AND_INV_CB
        }
    }

    fn color_pass() -> Arc<RenderPass> {
        Arc::new(RenderPass {
            attachments: vec![AttachmentDesc {
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::ShaderReadOnly,
            }],
            subpasses: vec![
                SubpassDesc {
                    color_attachments: vec![AttachmentRef {
                        attachment: 0,
                        layout: ImageLayout::ColorAttachment,
                    }],
                    ..SubpassDesc::default()
                },
                SubpassDesc {
                    color_attachments: vec![AttachmentRef {
                        attachment: 0,
                        layout: ImageLayout::ColorAttachment,
                    }],
                    start_barrier: SubpassBarrier {
                        src_stages: PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        dst_stages: PipelineStageFlags::FRAGMENT_SHADER,
                        src_access: AccessFlags::COLOR_ATTACHMENT_WRITE,
                        dst_access: AccessFlags::SHADER_READ,
                    },
                    ..SubpassDesc::default()
                },
            ],
            end_barrier: SubpassBarrier::default(),
        })
    }

    #[test]
    fn render_pass_transitions_and_registers() {
        let meta = Arc::new(RecordingMeta::default());
        let device = test_device_with(
            DeviceConfig::default(),
            Collaborators {
                meta_ops: Some(meta.clone()),
                ..Collaborators::default()
            },
        );
        let image = test_image(&device, ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED);
        let framebuffer = Arc::new(Framebuffer {
            width: 640,
            height: 480,
            attachments: vec![image.clone()],
        });
        let pass = color_pass();

        let mut cb = test_cmd_buffer(&device);
        cb.begin();
        cb.begin_render_pass(&pass, &framebuffer);
        assert!(cb.pending_flush().contains(FlushBits::FLUSH_AND_INV_CB));
        assert_eq!(
            cb.render_pass_state().map(|r| r.layout(0)),
            Some(ImageLayout::ColorAttachment)
        );

        let writes = register_writes(&cb.cs().payload_words()).unwrap();
        let find = |reg| writes.iter().find(|w| w.reg == reg).map(|w| w.value);
        assert_eq!(find(CB_COLOR0_BASE), Some((image.va() >> 8) as u32));
        assert_eq!(find(CB_COLOR0_PITCH), Some(image.pitch));
        assert_eq!(find(DB_Z_INFO), Some(0));
        assert_eq!(find(PA_SC_WINDOW_SCISSOR_BR), Some(scissor_xy(640, 480)));

        cb.next_subpass();
        assert_eq!(cb.render_pass_state().map(|r| r.subpass_index()), Some(1));
        assert!(cb.pending_flush().contains(FlushBits::PS_PARTIAL_FLUSH));

        cb.end_render_pass();
        assert!(cb.render_pass_state().is_none());
        assert_eq!(
            *meta.transitions.lock().unwrap(),
            vec![
                (ImageLayout::Undefined, ImageLayout::ColorAttachment),
                (ImageLayout::ColorAttachment, ImageLayout::ShaderReadOnly),
            ]
        );
        assert_eq!(cb.end(), Ok(()));
    }

    #[test]
    fn transitions_without_meta_ops_are_skipped() {
        let device = test_device_with(DeviceConfig::default(), Collaborators::default());
        let image = test_image(&device, ImageUsage::COLOR_ATTACHMENT);
        let framebuffer = Arc::new(Framebuffer {
            width: 16,
            height: 16,
            attachments: vec![image],
        });
        let mut cb = test_cmd_buffer(&device);
        cb.begin();
        cb.begin_render_pass(&color_pass(), &framebuffer);
        assert!(cb.pending_flush().is_empty());
        cb.next_subpass();
        cb.end_render_pass();
        assert_eq!(cb.end(), Ok(()));
    }

    #[test]
    fn noncoherent_targets_mark_render_backend_dirty() {
        for (l2_coherent, expect_dirty) in [(false, true), (true, false)] {
            let device = test_device_with(DeviceConfig::default(), Collaborators::default());
            let mut image = test_image(&device, ImageUsage::COLOR_ATTACHMENT);
            image.l2_coherent = l2_coherent;
            let framebuffer = Arc::new(Framebuffer {
                width: 16,
                height: 16,
                attachments: vec![image],
            });
            let pipeline = test_pipeline(&device, BindPoint::Graphics, UserDataLayout::default());
            let mut cb = test_cmd_buffer(&device);
            cb.begin();
            cb.begin_render_pass(&color_pass(), &framebuffer);
            cb.bind_pipeline(&pipeline);
            cb.draw(3, 1, 0, 0);
            assert_eq!(cb.rb_noncoherent_dirty, expect_dirty);
        }
    }
}
