//! Buffer, image and event handles as seen by the recorder.
//!
//! Memory itself belongs to the allocator; these types only carry the GPU address and the
//! properties the recorder needs for synchronization decisions.

use std::sync::Arc;

use bitflags::bitflags;
use pm4_winsys::Bo;

/// A range of a buffer object.
#[derive(Clone, Debug)]
pub struct Buffer {
    pub bo: Arc<Bo>,
    pub offset: u64,
    pub size: u64,
}

impl Buffer {
    pub fn new(bo: Arc<Bo>) -> Self {
        let size = bo.size();
        Self { bo, offset: 0, size }
    }

    pub fn va(&self) -> u64 {
        self.bo.va() + self.offset
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const INPUT_ATTACHMENT = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

#[derive(Clone, Debug)]
pub struct Image {
    pub bo: Arc<Bo>,
    pub offset: u64,
    pub usage: ImageUsage,
    pub depth_stencil: bool,
    /// Compression metadata for color targets (DCC, CMASK or FMASK).
    pub has_cb_metadata: bool,
    /// HTILE metadata for depth targets.
    pub has_htile: bool,
    /// Every access to the image goes through L2 in a coherent mode.
    pub l2_coherent: bool,
    /// Pitch in pixels, emitted with color target registers.
    pub pitch: u32,
}

impl Image {
    pub fn va(&self) -> u64 {
        self.bo.va() + self.offset
    }
}

/// A GPU-visible event word. Set events hold 1, reset events 0.
#[derive(Clone, Debug)]
pub struct Event {
    pub bo: Arc<Bo>,
}

impl Event {
    pub fn va(&self) -> u64 {
        self.bo.va()
    }

    /// Host view of the event word.
    pub fn is_set(&self) -> bool {
        self.bo.read_words(0, 1) == [1]
    }
}
