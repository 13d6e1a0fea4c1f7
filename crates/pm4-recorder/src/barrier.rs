//! Translation of synchronization requests into cache flush bits.
//!
//! Each access bit contributes independently, so the flush for a combined mask is the union
//! of the flushes for its parts.

use bitflags::bitflags;

use crate::caps::ChipCaps;
use crate::flush::FlushBits;
use crate::resources::{Image, ImageLayout, ImageUsage};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const INPUT_ATTACHMENT_READ = 1 << 4;
        const SHADER_READ = 1 << 5;
        const SHADER_WRITE = 1 << 6;
        const COLOR_ATTACHMENT_READ = 1 << 7;
        const COLOR_ATTACHMENT_WRITE = 1 << 8;
        const DEPTH_STENCIL_ATTACHMENT_READ = 1 << 9;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 10;
        const TRANSFER_READ = 1 << 11;
        const TRANSFER_WRITE = 1 << 12;
        const HOST_READ = 1 << 13;
        const HOST_WRITE = 1 << 14;
        const MEMORY_READ = 1 << 15;
        const MEMORY_WRITE = 1 << 16;
        const TRANSFORM_FEEDBACK_WRITE = 1 << 17;
        const TRANSFORM_FEEDBACK_COUNTER_READ = 1 << 18;
        const TRANSFORM_FEEDBACK_COUNTER_WRITE = 1 << 19;
        const CONDITIONAL_RENDERING_READ = 1 << 20;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PipelineStageFlags: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const TESSELLATION_CONTROL_SHADER = 1 << 4;
        const TESSELLATION_EVALUATION_SHADER = 1 << 5;
        const GEOMETRY_SHADER = 1 << 6;
        const FRAGMENT_SHADER = 1 << 7;
        const EARLY_FRAGMENT_TESTS = 1 << 8;
        const LATE_FRAGMENT_TESTS = 1 << 9;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 10;
        const COMPUTE_SHADER = 1 << 11;
        const TRANSFER = 1 << 12;
        const BOTTOM_OF_PIPE = 1 << 13;
        const HOST = 1 << 14;
        const ALL_GRAPHICS = 1 << 15;
        const ALL_COMMANDS = 1 << 16;
        const TRANSFORM_FEEDBACK = 1 << 24;
    }
}

/// Device and command-buffer facts the flush rules depend on.
#[derive(Clone, Copy, Debug)]
pub struct FlushContext {
    pub caps: ChipCaps,
    /// Storage buffers are read through the vector cache only.
    pub use_llvm_ssbo_path: bool,
    /// A render target written in a non-coherent L2 mode may still be dirty.
    pub rb_noncoherent_dirty: bool,
}

fn has_cb_metadata(image: Option<&Image>) -> bool {
    image.map_or(true, |image| image.has_cb_metadata)
}

fn has_db_metadata(image: Option<&Image>) -> bool {
    image.map_or(true, |image| image.has_htile)
}

/// Flushes that make writes covered by `access` visible to other clients.
pub fn src_access_flush(access: AccessFlags, image: Option<&Image>) -> FlushBits {
    let has_cb_meta = has_cb_metadata(image);
    let has_db_meta = has_db_metadata(image);
    let image_is_coherent = image.is_some_and(|image| image.l2_coherent);
    let mut bits = FlushBits::empty();

    for flag in access.iter() {
        match flag {
            AccessFlags::SHADER_WRITE => {
                // Without the storage usage this write came from a meta pass that rendered
                // through CB/DB, which the destination side does not flush.
                if let Some(image) = image.filter(|i| !i.usage.contains(ImageUsage::STORAGE)) {
                    bits |= if image.depth_stencil {
                        FlushBits::FLUSH_AND_INV_DB
                    } else {
                        FlushBits::FLUSH_AND_INV_CB
                    };
                }
                if !image_is_coherent {
                    bits |= FlushBits::WB_L2;
                }
            }
            AccessFlags::TRANSFORM_FEEDBACK_WRITE
            | AccessFlags::TRANSFORM_FEEDBACK_COUNTER_WRITE => {
                if !image_is_coherent {
                    bits |= FlushBits::WB_L2;
                }
            }
            AccessFlags::COLOR_ATTACHMENT_WRITE => {
                bits |= FlushBits::FLUSH_AND_INV_CB;
                if has_cb_meta {
                    bits |= FlushBits::FLUSH_AND_INV_CB_META;
                }
            }
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE => {
                bits |= FlushBits::FLUSH_AND_INV_DB;
                if has_db_meta {
                    bits |= FlushBits::FLUSH_AND_INV_DB_META;
                }
            }
            AccessFlags::TRANSFER_WRITE | AccessFlags::MEMORY_WRITE => {
                bits |= FlushBits::FLUSH_AND_INV_CB | FlushBits::FLUSH_AND_INV_DB;
                if !image_is_coherent {
                    bits |= FlushBits::INV_L2;
                }
                if has_cb_meta {
                    bits |= FlushBits::FLUSH_AND_INV_CB_META;
                }
                if has_db_meta {
                    bits |= FlushBits::FLUSH_AND_INV_DB_META;
                }
            }
            _ => {}
        }
    }
    bits
}

/// Invalidations that make earlier writes visible to the accesses in `access`.
pub fn dst_access_flush(
    ctx: &FlushContext,
    access: AccessFlags,
    image: Option<&Image>,
) -> FlushBits {
    let mut has_cb_meta = true;
    let mut has_db_meta = true;
    let mut flush_cb = true;
    let mut flush_db = true;
    let mut image_is_coherent = image.is_some_and(|image| image.l2_coherent);
    if let Some(image) = image {
        // CB/DB are only read back through the shader path for storage images.
        if !image.usage.contains(ImageUsage::STORAGE) {
            flush_cb = false;
            flush_db = false;
        }
        has_cb_meta = image.has_cb_metadata;
        has_db_meta = image.has_htile;
    }
    image_is_coherent |= ctx.caps.cb_db_l2_coherent && !ctx.rb_noncoherent_dirty;

    let mut bits = FlushBits::empty();
    for flag in access.iter() {
        match flag {
            AccessFlags::UNIFORM_READ => {
                bits |= FlushBits::INV_VCACHE | FlushBits::INV_SCACHE;
            }
            AccessFlags::VERTEX_ATTRIBUTE_READ
            | AccessFlags::INPUT_ATTACHMENT_READ
            | AccessFlags::TRANSFER_READ
            | AccessFlags::TRANSFER_WRITE => {
                bits |= FlushBits::INV_VCACHE;
                if has_cb_meta || has_db_meta {
                    bits |= FlushBits::INV_L2_METADATA;
                }
                if !image_is_coherent {
                    bits |= FlushBits::INV_L2;
                }
            }
            AccessFlags::SHADER_READ => {
                bits |= FlushBits::INV_VCACHE;
                // Storage buffers go through scalar loads unless the LLVM path is used.
                if !ctx.use_llvm_ssbo_path && image.is_none() {
                    bits |= FlushBits::INV_SCACHE;
                }
                if has_cb_meta || has_db_meta {
                    bits |= FlushBits::INV_L2_METADATA;
                }
                if !image_is_coherent {
                    bits |= FlushBits::INV_L2;
                }
            }
            AccessFlags::COLOR_ATTACHMENT_READ | AccessFlags::COLOR_ATTACHMENT_WRITE => {
                if flush_cb {
                    bits |= FlushBits::FLUSH_AND_INV_CB;
                }
                if has_cb_meta {
                    bits |= FlushBits::FLUSH_AND_INV_CB_META;
                }
            }
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE => {
                if flush_db {
                    bits |= FlushBits::FLUSH_AND_INV_DB;
                }
                if has_db_meta {
                    bits |= FlushBits::FLUSH_AND_INV_DB_META;
                }
            }
            AccessFlags::MEMORY_READ | AccessFlags::MEMORY_WRITE => {
                bits |= FlushBits::INV_VCACHE | FlushBits::INV_SCACHE;
                if !image_is_coherent {
                    bits |= FlushBits::INV_L2;
                }
                if flush_cb {
                    bits |= FlushBits::FLUSH_AND_INV_CB;
                }
                if has_cb_meta {
                    bits |= FlushBits::FLUSH_AND_INV_CB_META;
                }
                if flush_db {
                    bits |= FlushBits::FLUSH_AND_INV_DB;
                }
                if has_db_meta {
                    bits |= FlushBits::FLUSH_AND_INV_DB_META;
                }
            }
            _ => {}
        }
    }
    bits
}

/// Partial flushes that wait for the work in `src_stages` to finish.
pub fn stage_flush(src_stages: PipelineStageFlags, dst_stages: PipelineStageFlags) -> FlushBits {
    if dst_stages == PipelineStageFlags::BOTTOM_OF_PIPE {
        return FlushBits::empty();
    }

    let mut bits = FlushBits::empty();
    if src_stages.intersects(
        PipelineStageFlags::COMPUTE_SHADER
            | PipelineStageFlags::TRANSFER
            | PipelineStageFlags::BOTTOM_OF_PIPE
            | PipelineStageFlags::ALL_COMMANDS,
    ) {
        bits |= FlushBits::CS_PARTIAL_FLUSH;
    }

    if src_stages.intersects(
        PipelineStageFlags::FRAGMENT_SHADER
            | PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | PipelineStageFlags::LATE_FRAGMENT_TESTS
            | PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | PipelineStageFlags::TRANSFER
            | PipelineStageFlags::BOTTOM_OF_PIPE
            | PipelineStageFlags::ALL_GRAPHICS
            | PipelineStageFlags::ALL_COMMANDS,
    ) {
        bits |= FlushBits::PS_PARTIAL_FLUSH;
    } else if src_stages.intersects(
        PipelineStageFlags::DRAW_INDIRECT
            | PipelineStageFlags::VERTEX_INPUT
            | PipelineStageFlags::VERTEX_SHADER
            | PipelineStageFlags::TESSELLATION_CONTROL_SHADER
            | PipelineStageFlags::TESSELLATION_EVALUATION_SHADER
            | PipelineStageFlags::GEOMETRY_SHADER
            | PipelineStageFlags::TRANSFORM_FEEDBACK,
    ) {
        bits |= FlushBits::VS_PARTIAL_FLUSH;
    }
    bits
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

#[derive(Clone, Debug)]
pub struct ImageBarrier {
    pub image: Image,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

/// One pipeline barrier. Buffer barriers behave like memory barriers.
#[derive(Clone, Debug, Default)]
pub struct DependencyInfo {
    pub src_stages: PipelineStageFlags,
    pub dst_stages: PipelineStageFlags,
    pub memory_barriers: Vec<MemoryBarrier>,
    pub image_barriers: Vec<ImageBarrier>,
}

impl DependencyInfo {
    pub fn src_flush(&self) -> FlushBits {
        let memory = self
            .memory_barriers
            .iter()
            .fold(FlushBits::empty(), |bits, b| bits | src_access_flush(b.src_access, None));
        self.image_barriers.iter().fold(memory, |bits, b| {
            bits | src_access_flush(b.src_access, Some(&b.image))
        })
    }

    pub fn dst_flush(&self, ctx: &FlushContext) -> FlushBits {
        let memory = self.memory_barriers.iter().fold(FlushBits::empty(), |bits, b| {
            bits | dst_access_flush(ctx, b.dst_access, None)
        });
        self.image_barriers.iter().fold(memory, |bits, b| {
            bits | dst_access_flush(ctx, b.dst_access, Some(&b.image))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::caps::GfxLevel;
    use pm4_winsys::{Bo, BoDesc, BoHandle};
    use pretty_assertions::assert_eq;

    fn image(usage: ImageUsage) -> Image {
        Image {
            bo: Arc::new(Bo::new(BoHandle(1), 0x10_0000, &BoDesc::default())),
            offset: 0,
            usage,
            depth_stencil: false,
            has_cb_metadata: false,
            has_htile: false,
            l2_coherent: false,
            pitch: 64,
        }
    }

    fn ctx(level: GfxLevel) -> FlushContext {
        FlushContext {
            caps: ChipCaps::for_level(level),
            use_llvm_ssbo_path: false,
            rb_noncoherent_dirty: false,
        }
    }

    #[test]
    fn meta_shader_write_flushes_render_target_cache() {
        let sampled = image(ImageUsage::SAMPLED);
        assert_eq!(
            src_access_flush(AccessFlags::SHADER_WRITE, Some(&sampled)),
            FlushBits::FLUSH_AND_INV_CB | FlushBits::WB_L2
        );
        let storage = image(ImageUsage::STORAGE);
        assert_eq!(
            src_access_flush(AccessFlags::SHADER_WRITE, Some(&storage)),
            FlushBits::WB_L2
        );
    }

    #[test]
    fn storage_read_of_non_storage_image_skips_cb() {
        let ctx = ctx(GfxLevel::Gfx8);
        let img = image(ImageUsage::SAMPLED);
        let bits = dst_access_flush(
            &ctx,
            AccessFlags::SHADER_READ | AccessFlags::MEMORY_READ,
            Some(&img),
        );
        assert!(bits.contains(FlushBits::INV_VCACHE));
        assert!(!bits.contains(FlushBits::FLUSH_AND_INV_CB));

        let img = image(ImageUsage::STORAGE);
        let bits = dst_access_flush(&ctx, AccessFlags::MEMORY_READ, Some(&img));
        assert!(bits.contains(FlushBits::FLUSH_AND_INV_CB));
    }

    #[test]
    fn coherent_l2_skips_invalidate_until_rb_dirty() {
        let mut ctx = ctx(GfxLevel::Gfx9);
        let bits = dst_access_flush(&ctx, AccessFlags::TRANSFER_READ, None);
        assert_eq!(bits, FlushBits::INV_VCACHE | FlushBits::INV_L2_METADATA);

        ctx.rb_noncoherent_dirty = true;
        let bits = dst_access_flush(&ctx, AccessFlags::TRANSFER_READ, None);
        assert!(bits.contains(FlushBits::INV_L2));
    }

    #[test]
    fn shader_read_scalar_cache_depends_on_ssbo_path() {
        let mut ctx = ctx(GfxLevel::Gfx9);
        assert!(dst_access_flush(&ctx, AccessFlags::SHADER_READ, None)
            .contains(FlushBits::INV_SCACHE));
        ctx.use_llvm_ssbo_path = true;
        assert!(!dst_access_flush(&ctx, AccessFlags::SHADER_READ, None)
            .contains(FlushBits::INV_SCACHE));
    }

    #[test]
    fn stage_flush_table() {
        assert_eq!(
            stage_flush(
                PipelineStageFlags::COMPUTE_SHADER,
                PipelineStageFlags::FRAGMENT_SHADER
            ),
            FlushBits::CS_PARTIAL_FLUSH
        );
        assert_eq!(
            stage_flush(
                PipelineStageFlags::VERTEX_SHADER,
                PipelineStageFlags::FRAGMENT_SHADER
            ),
            FlushBits::VS_PARTIAL_FLUSH
        );
        assert_eq!(
            stage_flush(
                PipelineStageFlags::TRANSFER,
                PipelineStageFlags::COMPUTE_SHADER
            ),
            FlushBits::CS_PARTIAL_FLUSH | FlushBits::PS_PARTIAL_FLUSH
        );
        assert_eq!(
            stage_flush(
                PipelineStageFlags::ALL_COMMANDS,
                PipelineStageFlags::BOTTOM_OF_PIPE
            ),
            FlushBits::empty()
        );
    }
}
