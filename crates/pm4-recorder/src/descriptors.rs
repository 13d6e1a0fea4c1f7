//! Descriptor sets, push descriptors and push constants.
//!
//! Set addresses are handed to shaders as 32-bit user SGPRs. Only sets that are dirty,
//! bound and read by the current pipeline are written, one `SET_SH_REG` packet per run of
//! consecutive set indices living in consecutive SGPRs.

use std::sync::Arc;

use pm4_protocol::{DwordSink, Pm4Emit};
use pm4_winsys::{Bo, CmdStream};

use crate::cmd_buffer::CommandBuffer;
use crate::pipeline::{
    BindPoint, Pipeline, PipelineLayout, ShaderBinary, ShaderStages, UserSgprLoc, MAX_SETS,
};
use crate::resources::Buffer;

pub const MAX_PUSH_CONSTANTS_SIZE: usize = 128;
pub const MAX_DYNAMIC_BUFFERS: usize = 24;

/// Fourth dword of a raw buffer descriptor: identity swizzle, 32-bit float format.
const BUFFER_RSRC_WORD3: u32 = 0x0002_7FAC;

/// A descriptor set allocated by the caller. Several sets usually share one pool buffer.
#[derive(Clone, Debug)]
pub struct DescriptorSet {
    pub bo: Arc<Bo>,
    pub offset: u64,
    pub size: u64,
    /// Ranges of the set's dynamic uniform and storage buffers, in binding order.
    pub dynamic_buffers: Vec<Buffer>,
}

impl DescriptorSet {
    pub fn new(bo: Arc<Bo>, offset: u64, size: u64) -> Self {
        Self {
            bo,
            offset,
            size,
            dynamic_buffers: Vec::new(),
        }
    }

    pub fn va(&self) -> u64 {
        self.bo.va() + self.offset
    }
}

/// Raw buffer descriptor for a dynamic buffer at its bind-time offset.
pub fn buffer_descriptor(va: u64, size: u64) -> [u32; 4] {
    [
        va as u32,
        (va >> 32) as u32 & 0xFFFF,
        size.min(u64::from(u32::MAX)) as u32,
        BUFFER_RSRC_WORD3,
    ]
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PushDescriptorSet {
    pub set: u32,
    pub words: Vec<u32>,
    pub va: u64,
    pub dirty: bool,
}

/// Binding state of one bind point.
#[derive(Clone, Debug)]
pub(crate) struct DescriptorState {
    pub sets: [Option<Arc<DescriptorSet>>; MAX_SETS],
    /// Slots that hold a set.
    pub valid: u32,
    /// Slots changed since their address was last written.
    pub dirty: u32,
    pub push_set: Option<PushDescriptorSet>,
    pub dynamic_buffers: [[u32; 4]; MAX_DYNAMIC_BUFFERS],
    pub push_constants_dirty: bool,
}

impl Default for DescriptorState {
    fn default() -> Self {
        Self {
            sets: Default::default(),
            valid: 0,
            dirty: 0,
            push_set: None,
            dynamic_buffers: [[0; 4]; MAX_DYNAMIC_BUFFERS],
            push_constants_dirty: false,
        }
    }
}

impl DescriptorState {
    fn set_va(&self, index: usize) -> u64 {
        match &self.push_set {
            Some(push) if push.set as usize == index => push.va,
            _ => self.sets[index].as_ref().map_or(0, |set| set.va()),
        }
    }

    /// Marks every bound slot and the push constants dirty, for a pipeline switch or after
    /// secondaries ran.
    pub fn invalidate(&mut self) {
        self.dirty = self.valid;
        self.push_constants_dirty = true;
    }
}

/// Every run of consecutive bits in `mask` whose SGPRs are also consecutive, as
/// `(first set, count)`.
fn set_runs(locs: &[Option<UserSgprLoc>; MAX_SETS], mask: u32) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut remaining = mask;
    while remaining != 0 {
        let start = remaining.trailing_zeros() as usize;
        let mut end = start + 1;
        while end < MAX_SETS && remaining & (1 << end) != 0 {
            match (locs[end - 1], locs[end]) {
                (Some(prev), Some(next)) if next.sgpr == prev.sgpr + prev.count => end += 1,
                _ => break,
            }
        }
        runs.push((start, end - start));
        for bit in start..end {
            remaining &= !(1 << bit);
        }
    }
    runs
}

/// Writes a GPU address into the SGPRs at `loc`. One SGPR holds the low 32 bits; a second
/// one, if present, the high bits.
pub(crate) fn emit_pointer(cs: &mut CmdStream, shader: &ShaderBinary, loc: UserSgprLoc, va: u64) {
    let count = u32::from(loc.count.clamp(1, 2));
    cs.reserve(2 + count as usize);
    cs.set_sh_reg_seq(shader.user_data_reg(loc), count);
    cs.emit(va as u32);
    if count == 2 {
        cs.emit((va >> 32) as u32);
    }
}

impl CommandBuffer {
    fn pipeline_at(&self, bind_point: BindPoint) -> Option<Arc<Pipeline>> {
        self.pipelines[bind_point.index()].clone()
    }

    /// Binds `sets` starting at slot `first_set`. `dynamic_offsets` holds one offset per
    /// dynamic buffer of the bound sets, in order.
    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: BindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) {
        let state = &mut self.descriptors[bind_point.index()];
        let mut offsets = dynamic_offsets.iter();
        for (i, set) in sets.iter().enumerate() {
            let index = first_set as usize + i;
            assert!(index < MAX_SETS, "descriptor set index {index} out of range");

            state.sets[index] = Some(set.clone());
            state.valid |= 1 << index;
            state.dirty |= 1 << index;
            if state.push_set.as_ref().is_some_and(|p| p.set as usize == index) {
                state.push_set = None;
            }
            self.cs.add_buffer(&set.bo);

            let start = layout.dynamic_offset_start(index) as usize;
            for (j, buffer) in set.dynamic_buffers.iter().enumerate() {
                let offset = offsets
                    .next()
                    .copied()
                    .unwrap_or_else(|| panic!("missing dynamic offset for set {index}"));
                let slot = start + j;
                assert!(slot < MAX_DYNAMIC_BUFFERS, "too many dynamic buffers");
                state.dynamic_buffers[slot] = buffer_descriptor(
                    buffer.va() + u64::from(offset),
                    buffer.size.saturating_sub(u64::from(offset)),
                );
                state.push_constants_dirty = true;
                self.cs.add_buffer(&buffer.bo);
            }
        }
    }

    /// Records a push descriptor set for slot `set`. The descriptor words are uploaded when
    /// the next draw or dispatch flushes descriptors.
    pub fn push_descriptor_set(&mut self, bind_point: BindPoint, set: u32, words: &[u32]) {
        assert!((set as usize) < MAX_SETS, "descriptor set index {set} out of range");
        let state = &mut self.descriptors[bind_point.index()];
        state.sets[set as usize] = None;
        state.valid |= 1 << set;
        state.dirty |= 1 << set;
        state.push_set = Some(PushDescriptorSet {
            set,
            words: words.to_vec(),
            va: 0,
            dirty: true,
        });
    }

    pub fn push_constants(&mut self, stages: ShaderStages, offset: u32, data: &[u8]) {
        let start = offset as usize;
        let end = start + data.len();
        assert!(
            end <= MAX_PUSH_CONSTANTS_SIZE,
            "push constant range {start}..{end} out of bounds"
        );
        self.push_constant_data[start..end].copy_from_slice(data);
        if stages.intersects(ShaderStages::ALL_GRAPHICS) {
            self.descriptors[BindPoint::Graphics.index()].push_constants_dirty = true;
        }
        if stages.contains(ShaderStages::COMPUTE) {
            self.descriptors[BindPoint::Compute.index()].push_constants_dirty = true;
        }
    }

    /// Writes the addresses of dirty sets the bound pipeline reads.
    pub(crate) fn flush_descriptors(&mut self, bind_point: BindPoint) {
        let Some(pipeline) = self.pipeline_at(bind_point) else {
            return;
        };
        let bp = bind_point.index();

        let push = self.descriptors[bp]
            .push_set
            .as_ref()
            .filter(|p| p.dirty)
            .map(|p| p.words.clone());
        if let Some(words) = push {
            let va = if words.is_empty() {
                Some(0)
            } else {
                self.upload_words(&words)
            };
            if let Some(push) = self.descriptors[bp].push_set.as_mut() {
                push.va = va.unwrap_or(0);
                push.dirty = false;
            }
        }

        let state = &self.descriptors[bp];
        if state.dirty == 0 {
            return;
        }
        let addresses: Vec<u64> = (0..MAX_SETS).map(|i| state.set_va(i)).collect();
        let mask = state.dirty & state.valid & pipeline.descriptor_set_mask();

        if pipeline.need_indirect_descriptor_sets {
            let table: Vec<u32> = addresses.iter().map(|&va| va as u32).collect();
            if let Some(va) = self.upload_words(&table) {
                for shader in &pipeline.shaders {
                    if let Some(loc) = shader.user_data.indirect_descriptor_sets {
                        emit_pointer(&mut self.cs, shader, loc, va);
                    }
                }
            }
        }

        for shader in &pipeline.shaders {
            let locs = &shader.user_data.descriptor_sets;
            let shader_mask = mask & shader.user_data.descriptor_set_mask();
            for (first, count) in set_runs(locs, shader_mask) {
                let Some(loc) = locs[first] else { continue };
                self.cs.reserve(2 + count);
                self.cs.set_sh_reg_seq(shader.user_data_reg(loc), count as u32);
                for &va in &addresses[first..first + count] {
                    self.cs.emit(va as u32);
                }
            }
        }
        self.descriptors[bp].dirty = 0;
    }

    /// Uploads the push-constant block and dynamic buffer descriptors when a stage reads
    /// them through memory, and writes the inline ranges straight into SGPRs.
    pub(crate) fn flush_constants(&mut self, bind_point: BindPoint) {
        let Some(pipeline) = self.pipeline_at(bind_point) else {
            return;
        };
        let bp = bind_point.index();
        if !self.descriptors[bp].push_constants_dirty {
            return;
        }
        let layout = pipeline.layout.clone();

        if pipeline
            .shaders
            .iter()
            .any(|s| s.user_data.push_constants.is_some())
        {
            let size = (layout.push_constant_size as usize).min(MAX_PUSH_CONSTANTS_SIZE);
            let dynamic_count =
                (layout.dynamic_buffer_count() as usize).min(MAX_DYNAMIC_BUFFERS);
            let mut block = self.push_constant_data[..size].to_vec();
            block.resize(size.next_multiple_of(4), 0);
            block.extend_from_slice(bytemuck::cast_slice(
                &self.descriptors[bp].dynamic_buffers[..dynamic_count],
            ));
            if !block.is_empty() {
                if let Some(va) = self.upload_bytes(&block) {
                    for shader in &pipeline.shaders {
                        if let Some(loc) = shader.user_data.push_constants {
                            emit_pointer(&mut self.cs, shader, loc, va);
                        }
                    }
                }
            }
        }

        for shader in &pipeline.shaders {
            let Some(loc) = shader.user_data.inline_push_constants else {
                continue;
            };
            let base = shader.user_data.inline_push_constant_base as usize * 4;
            let count = usize::from(loc.count);
            if count == 0 {
                continue;
            }
            self.cs.reserve(2 + count);
            self.cs.set_sh_reg_seq(shader.user_data_reg(loc), count as u32);
            for i in 0..count {
                let at = base + i * 4;
                let word = self
                    .push_constant_data
                    .get(at..at + 4)
                    .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                self.cs.emit(word);
            }
        }
        self.descriptors[bp].push_constants_dirty = false;
    }
}
