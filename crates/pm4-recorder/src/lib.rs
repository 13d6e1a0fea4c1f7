//! Command recording for PM4 command processors.
//!
//! A [`CommandBuffer`] turns API-level calls (bind a pipeline, set dynamic state, draw,
//! barrier) into PM4 packets in a [`pm4_winsys::CmdStream`]. Work is deferred where the
//! hardware allows it:
//! - dynamic state is tracked with dirty bits and written right before the draw that needs it
//! - barriers only accumulate flush bits; the flush is emitted once, before the next work
//! - descriptor set addresses and push constants are uploaded per draw, only when changed
//!
//! [`Queue`] submits finished command buffers through the winsys.

pub mod barrier;
pub mod cache;
pub mod caps;
pub mod cmd_buffer;
pub mod config;
pub mod descriptors;
pub mod device;
pub mod draw;
pub mod dynamic_state;
pub mod error;
pub mod flush;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod renderpass;
pub mod resources;
pub mod state_emit;
pub mod stats;
pub mod upload;

#[cfg(test)]
mod test_util;

pub use barrier::{AccessFlags, DependencyInfo, ImageBarrier, MemoryBarrier, PipelineStageFlags};
pub use cache::{PrologCompiler, VertexAttribute, VertexBindingDesc, VertexInputState, VsProlog, VsPrologKey};
pub use caps::{ChipCaps, GfxLevel};
pub use cmd_buffer::{CommandBuffer, CommandBufferLevel, CommandBufferStatus};
pub use config::DeviceConfig;
pub use descriptors::DescriptorSet;
pub use device::{Collaborators, Device};
pub use draw::{IndexType, MultiDrawInfo};
pub use dynamic_state::{DynamicState, DynamicStateBits};
pub use error::{Error, Result};
pub use flush::FlushBits;
pub use pipeline::{BindPoint, Pipeline, PipelineLayout, ShaderBinary, ShaderStage, UserDataLayout, UserSgprLoc};
pub use pool::CommandPool;
pub use queue::{Queue, SubmitInfo};
pub use renderpass::{Framebuffer, MetaOps, RenderPass};
pub use resources::{Buffer, Event, Image, ImageLayout, ImageUsage};
pub use stats::{RecorderStats, RecorderStatsSnapshot};
