//! Command streams.
//!
//! A [`CmdStream`] is an ordered list of [`Segment`]s. With IB buffer objects enabled every
//! segment is a GPU buffer and segments are linked by chain packets; the chain packets are
//! only written by [`CmdStream::finalize`], once the size of the following segment is
//! known. On the sysmem path segments are plain host arrays that the submission layer copies
//! into IBs of their own.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use pm4_protocol::packet::{IB_CHAIN, IB_PACKET_DWORDS, IB_SIZE_MASK, IB_VALID};
use pm4_protocol::{pkt3, DwordSink, Opcode, PKT3_NOP_PAD};
use tracing::{debug, error, warn};

use crate::bo::{Bo, BoAllocator, BoDesc, BoEntry, BoFlags, BoHandle, Domain, PRIORITY_CS};
use crate::config::WinsysConfig;
use crate::error::{Result, WinsysError};
use crate::kernel::{HwIp, IbDesc, IbFlags};

/// Largest IB the chain packet's size field can describe.
pub const MAX_IB_DWORDS: usize = 0xFFFFF;
/// Largest host chunk on the sysmem path.
pub const SYSMEM_CHUNK_MAX_DWORDS: usize = 0xFFFF8;
/// IBs are padded to a multiple of this many dwords.
pub const IB_ALIGNMENT_DWORDS: usize = 8;

const PAD_MASK: usize = IB_ALIGNMENT_DWORDS - 1;

pub(crate) fn pad_word(ip: HwIp) -> u32 {
    match ip {
        HwIp::Gfx | HwIp::Compute => PKT3_NOP_PAD,
        HwIp::Dma => 0,
    }
}

/// Pads `words` with `ip`'s filler up to the IB alignment.
pub(crate) fn pad_to_alignment(ip: HwIp, words: &mut Vec<u32>) {
    let pad = pad_word(ip);
    while words.is_empty() || words.len() & PAD_MASK != 0 {
        words.push(pad);
    }
}

#[derive(Debug)]
pub struct Segment {
    bo: Option<Arc<Bo>>,
    words: Vec<u32>,
    /// Writable dwords. On the IB path this excludes the four dwords kept for the link.
    capacity: usize,
    chain_slot: Option<usize>,
    tail_slot: Option<usize>,
}

impl Segment {
    fn new(bo: Option<Arc<Bo>>, capacity: usize) -> Self {
        Self {
            bo,
            words: Vec::with_capacity(capacity),
            capacity,
            chain_slot: None,
            tail_slot: None,
        }
    }

    pub fn bo(&self) -> Option<&Arc<Bo>> {
        self.bo.as_ref()
    }

    pub fn va(&self) -> u64 {
        self.bo.as_ref().map_or(0, |bo| bo.va())
    }

    /// Everything written into the segment, link and tail slots included.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Recorded words, without the chain link or the reserved tail.
    pub fn payload(&self) -> &[u32] {
        let end = self
            .chain_slot
            .or(self.tail_slot)
            .unwrap_or(self.words.len());
        &self.words[..end]
    }

    pub fn is_chained(&self) -> bool {
        self.chain_slot.is_some()
    }
}

pub struct CmdStream {
    ip: HwIp,
    allocator: Arc<dyn BoAllocator>,
    use_ib_bos: bool,
    initial_dwords: usize,
    retired: Vec<Segment>,
    current: Segment,
    handles: Vec<BoEntry>,
    handle_index: HashMap<BoHandle, usize>,
    virtual_bos: Vec<Arc<Bo>>,
    virtual_index: HashSet<BoHandle>,
    error: Option<WinsysError>,
    grow_count: u32,
    finalized: bool,
}

impl CmdStream {
    pub fn new(ip: HwIp, allocator: Arc<dyn BoAllocator>, config: &WinsysConfig) -> Result<Self> {
        let initial_dwords = config
            .initial_ib_dwords
            .clamp(IB_ALIGNMENT_DWORDS * 2, MAX_IB_DWORDS)
            & !PAD_MASK;
        let current = if config.use_ib_bos {
            let bo = alloc_ib_bo(allocator.as_ref(), initial_dwords)?;
            Segment::new(Some(bo), initial_dwords - IB_PACKET_DWORDS)
        } else {
            Segment::new(None, initial_dwords)
        };
        let mut cs = Self {
            ip,
            allocator,
            use_ib_bos: config.use_ib_bos,
            initial_dwords,
            retired: Vec::new(),
            current,
            handles: Vec::new(),
            handle_index: HashMap::new(),
            virtual_bos: Vec::new(),
            virtual_index: HashSet::new(),
            error: None,
            grow_count: 0,
            finalized: false,
        };
        cs.track_current_bo();
        Ok(cs)
    }

    pub fn ip(&self) -> HwIp {
        self.ip
    }

    pub fn uses_ib_bos(&self) -> bool {
        self.use_ib_bos
    }

    /// Dwords written into the current segment.
    pub fn cdw(&self) -> usize {
        self.current.words.len()
    }

    pub fn capacity(&self) -> usize {
        self.current.capacity
    }

    pub fn remaining(&self) -> usize {
        self.current.capacity.saturating_sub(self.current.words.len())
    }

    pub fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.current.payload().is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.retired.iter().chain(std::iter::once(&self.current))
    }

    pub fn num_segments(&self) -> usize {
        self.retired.len() + 1
    }

    /// True once the stream spans more than one segment.
    pub fn has_chain(&self) -> bool {
        !self.retired.is_empty()
    }

    /// Number of times the stream ran out of space.
    pub fn grow_count(&self) -> u32 {
        self.grow_count
    }

    pub fn error(&self) -> Option<&WinsysError> {
        self.error.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn handles(&self) -> &[BoEntry] {
        &self.handles
    }

    pub fn virtual_buffers(&self) -> &[Arc<Bo>] {
        &self.virtual_bos
    }

    /// All recorded words across segments, without links and padding tails.
    pub fn payload_words(&self) -> Vec<u32> {
        self.segments()
            .flat_map(|s| s.payload().iter().copied())
            .collect()
    }

    /// IB descriptor for the first segment. Later segments are reached through chain packets.
    pub fn ib_desc(&self, flags: IbFlags) -> IbDesc {
        assert!(self.use_ib_bos, "sysmem streams have no IB of their own");
        let first = self.retired.first().unwrap_or(&self.current);
        IbDesc {
            va: first.va(),
            size_dw: first.words.len() as u32,
            flags,
        }
    }

    /// Records a reference to `bo` for the submission buffer list.
    pub fn add_buffer(&mut self, bo: &Arc<Bo>) {
        if bo.is_virtual() {
            if self.virtual_index.insert(bo.handle()) {
                self.virtual_bos.push(bo.clone());
            }
            return;
        }
        self.add_entry(bo.entry());
    }

    fn add_entry(&mut self, entry: BoEntry) {
        match self.handle_index.get(&entry.handle) {
            Some(&index) => {
                let existing = &mut self.handles[index];
                existing.priority = existing.priority.max(entry.priority);
            }
            None => {
                self.handle_index.insert(entry.handle, self.handles.len());
                self.handles.push(entry);
            }
        }
    }

    fn track_current_bo(&mut self) {
        if let Some(bo) = self.current.bo.clone() {
            self.add_buffer(&bo);
        }
    }

    fn fail(&mut self, err: WinsysError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// After a failure the stream keeps accepting words but throws them away.
    fn discard(&mut self, min_needed: usize) {
        self.current.words.clear();
        self.current.capacity = self.current.capacity.max(min_needed);
    }

    /// Makes sure the next `dwords` words land contiguously in one segment.
    pub fn reserve(&mut self, dwords: usize) {
        if self.current.words.len() + dwords > self.current.capacity {
            self.grow(dwords);
        }
    }

    /// Appends `words` as one contiguous run.
    pub fn push(&mut self, words: &[u32]) {
        self.reserve(words.len());
        self.emit_slice(words);
    }

    fn grow(&mut self, min_needed: usize) {
        self.grow_count += 1;
        if self.error.is_some() {
            self.discard(min_needed);
        } else if self.use_ib_bos {
            self.grow_chained(min_needed);
        } else {
            self.grow_sysmem(min_needed);
        }
    }

    fn grow_chained(&mut self, min_needed: usize) {
        let pad = pad_word(self.ip);
        while self.current.words.len() & PAD_MASK != IB_ALIGNMENT_DWORDS - IB_PACKET_DWORDS {
            self.current.words.push(pad);
        }

        let current_total = self.current.capacity + IB_PACKET_DWORDS;
        let total = ((min_needed + IB_PACKET_DWORDS + PAD_MASK) & !PAD_MASK)
            .max(current_total * 2)
            .min(MAX_IB_DWORDS & !PAD_MASK);
        assert!(
            min_needed + IB_PACKET_DWORDS <= total,
            "reservation of {min_needed} dwords exceeds the maximum IB size"
        );

        let bo = match alloc_ib_bo(self.allocator.as_ref(), total) {
            Ok(bo) => bo,
            Err(err) => {
                warn!(ip = ?self.ip, dwords = total, %err, "failed to allocate command stream segment");
                self.fail(err);
                self.discard(min_needed);
                return;
            }
        };

        // Placeholder for the chain packet; `finalize` writes the real link.
        let slot = self.current.words.len();
        self.current.words.extend_from_slice(&[pad; IB_PACKET_DWORDS]);
        self.current.chain_slot = Some(slot);

        let next = Segment::new(Some(bo), total - IB_PACKET_DWORDS);
        let old = std::mem::replace(&mut self.current, next);
        self.retired.push(old);
        self.track_current_bo();
        debug!(
            ip = ?self.ip,
            dwords = total,
            segments = self.retired.len() + 1,
            "command stream chained to a new segment"
        );
    }

    fn grow_sysmem(&mut self, min_needed: usize) {
        let limit = SYSMEM_CHUNK_MAX_DWORDS;
        let doubled = (self.current.capacity * 2).min(limit);
        let mut wanted = (self.current.words.len() + min_needed).max(doubled);
        if wanted > limit && !self.current.words.is_empty() {
            let next = Segment::new(None, 0);
            let old = std::mem::replace(&mut self.current, next);
            self.retired.push(old);
            wanted = min_needed.max(doubled);
            debug!(ip = ?self.ip, chunks = self.retired.len() + 1, "sysmem command stream spilled into a new chunk");
        }
        if wanted > limit {
            error!(ip = ?self.ip, dwords = min_needed, "too many dwords requested for one chunk");
            self.fail(WinsysError::OutOfHostMemory);
            self.discard(min_needed);
            return;
        }
        let additional = wanted - self.current.words.len();
        if self.current.words.try_reserve_exact(additional).is_err() {
            warn!(ip = ?self.ip, dwords = wanted, "failed to grow sysmem command stream");
            self.fail(WinsysError::OutOfHostMemory);
            self.discard(min_needed);
            return;
        }
        self.current.capacity = wanted;
    }

    /// Pads the stream, reserves the tail link slot and materializes the chain packets
    /// between segments. Returns the first error recorded on the stream.
    pub fn finalize(&mut self) -> Result<()> {
        if self.use_ib_bos {
            let pad = pad_word(self.ip);
            while self.current.words.is_empty()
                || self.current.words.len() & PAD_MASK != IB_ALIGNMENT_DWORDS - IB_PACKET_DWORDS
            {
                self.current.words.push(pad);
            }
            self.current.tail_slot = Some(self.current.words.len());
            self.current.words.extend_from_slice(&[pad; IB_PACKET_DWORDS]);

            let links: Vec<(u64, usize)> = self
                .retired
                .iter()
                .skip(1)
                .chain(std::iter::once(&self.current))
                .map(|s| (s.va(), s.words.len()))
                .collect();
            for (segment, (va, len)) in self.retired.iter_mut().zip(links) {
                if let Some(slot) = segment.chain_slot {
                    segment.words[slot..slot + IB_PACKET_DWORDS].copy_from_slice(&[
                        pkt3(Opcode::IndirectBuffer, 3, false),
                        va as u32,
                        (va >> 32) as u32,
                        (len as u32 & IB_SIZE_MASK) | IB_CHAIN | IB_VALID,
                    ]);
                }
            }
        }
        self.finalized = true;
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Appends `child` to this stream, either as a nested IB launch or by copying its words.
    pub fn execute_secondary(&mut self, child: &CmdStream, allow_nested: bool) {
        for entry in &child.handles {
            self.add_entry(*entry);
        }
        for bo in &child.virtual_bos {
            self.add_buffer(bo);
        }
        if let Some(err) = &child.error {
            self.fail(err.clone());
        }

        if self.use_ib_bos && child.use_ib_bos && allow_nested && !child.has_chain() {
            let va = child.current.va();
            let size = child.current.words.len() as u32;
            self.push(&[
                pkt3(Opcode::IndirectBuffer, 3, false),
                va as u32,
                (va >> 32) as u32,
                (size & IB_SIZE_MASK) | IB_VALID,
            ]);
        } else {
            for segment in child.segments() {
                let payload = segment.payload();
                if !payload.is_empty() {
                    self.push(payload);
                }
            }
        }
    }

    /// Discards recorded words, drops retired segments and clears the buffer list. The
    /// current segment's buffer is kept for reuse.
    pub fn reset(&mut self) {
        self.retired.clear();
        self.current.words.clear();
        self.current.chain_slot = None;
        self.current.tail_slot = None;
        match &self.current.bo {
            Some(bo) => self.current.capacity = bo.size() as usize / 4 - IB_PACKET_DWORDS,
            None => self.current.capacity = self.current.capacity.max(self.initial_dwords),
        }
        self.handles.clear();
        self.handle_index.clear();
        self.virtual_bos.clear();
        self.virtual_index.clear();
        self.error = None;
        self.grow_count = 0;
        self.finalized = false;
        self.track_current_bo();
    }
}

impl DwordSink for CmdStream {
    fn emit(&mut self, dw: u32) {
        if self.current.words.len() >= self.current.capacity {
            assert!(
                self.error.is_some(),
                "command stream write past capacity ({} dwords)",
                self.current.capacity
            );
            self.discard(1);
        }
        self.current.words.push(dw);
    }

    fn emit_slice(&mut self, dws: &[u32]) {
        if self.current.words.len() + dws.len() > self.current.capacity {
            assert!(
                self.error.is_some(),
                "command stream write of {} dwords past capacity ({} dwords)",
                dws.len(),
                self.current.capacity
            );
            self.discard(dws.len());
        }
        self.current.words.extend_from_slice(dws);
    }
}

impl std::fmt::Debug for CmdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdStream")
            .field("ip", &self.ip)
            .field("use_ib_bos", &self.use_ib_bos)
            .field("segments", &self.num_segments())
            .field("cdw", &self.cdw())
            .field("capacity", &self.capacity())
            .field("handles", &self.handles.len())
            .field("error", &self.error)
            .finish()
    }
}

fn alloc_ib_bo(allocator: &dyn BoAllocator, dwords: usize) -> Result<Arc<Bo>> {
    allocator.create_bo(&BoDesc {
        size: (dwords * 4) as u64,
        alignment: 4096,
        domain: Domain::Gtt,
        flags: BoFlags::CPU_ACCESS
            | BoFlags::READ_ONLY
            | BoFlags::GTT_WC
            | BoFlags::NO_INTERPROCESS_SHARING,
        priority: PRIORITY_CS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimAllocator;
    use pm4_protocol::packet::PKT3_NOP_PAD;
    use pm4_protocol::{walk_packets, PacketHeader};
    use pretty_assertions::assert_eq;

    fn stream(use_ib_bos: bool, initial: usize) -> CmdStream {
        let config = WinsysConfig {
            use_ib_bos,
            initial_ib_dwords: initial,
            ..WinsysConfig::default()
        };
        CmdStream::new(HwIp::Gfx, Arc::new(SimAllocator::new()), &config).unwrap()
    }

    #[test]
    fn new_stream_references_its_first_segment() {
        let cs = stream(true, 64);
        assert_eq!(cs.handles().len(), 1);
        assert_eq!(cs.capacity(), 60);
        assert!(cs.is_empty());
    }

    #[test]
    fn grow_pads_and_reserves_chain_slot() {
        let mut cs = stream(true, 64);
        cs.push(&[1; 59]);
        assert_eq!(cs.grow_count(), 0);
        cs.push(&[2; 3]);
        assert_eq!(cs.grow_count(), 1);
        assert_eq!(cs.num_segments(), 2);
        assert_eq!(cs.handles().len(), 2);

        let first = cs.segments().next().unwrap();
        assert_eq!(first.words().len() % IB_ALIGNMENT_DWORDS, 0);
        assert_eq!(first.payload().len(), 60);
        assert_eq!(first.payload()[59], PKT3_NOP_PAD);
        // Link stays a placeholder until finalize.
        assert!(first.words()[60..].iter().all(|&w| w == PKT3_NOP_PAD));

        // New segment doubles the previous one.
        assert_eq!(cs.capacity(), 124);
        assert_eq!(cs.cdw(), 3);
    }

    #[test]
    fn finalize_materializes_chain_links() {
        let mut cs = stream(true, 64);
        cs.push(&[7; 60]);
        cs.push(&[8; 100]);
        cs.finalize().unwrap();

        let segments: Vec<_> = cs.segments().collect();
        let link = &segments[0].words()[60..64];
        let next = segments[1];
        assert_eq!(link[0], pkt3(Opcode::IndirectBuffer, 3, false));
        assert_eq!(u64::from(link[1]) | (u64::from(link[2]) << 32), next.va());
        assert_eq!(link[3] & IB_SIZE_MASK, next.words().len() as u32);
        assert_ne!(link[3] & IB_CHAIN, 0);

        assert_eq!(next.words().len() % IB_ALIGNMENT_DWORDS, 0);
        assert_eq!(next.payload().len(), 100);
        let desc = cs.ib_desc(IbFlags::empty());
        assert_eq!(desc.va, segments[0].va());
        assert_eq!(desc.size_dw, 64);
    }

    #[test]
    fn finalize_pads_empty_stream() {
        let mut cs = stream(true, 64);
        cs.finalize().unwrap();
        assert_eq!(cs.segments().next().unwrap().words().len(), 8);
        for packet in walk_packets(cs.segments().next().unwrap().words()) {
            assert!(packet.unwrap().is_padding());
        }
    }

    #[test]
    fn allocation_failure_is_sticky_and_discards() {
        let alloc = Arc::new(SimAllocator::with_budget(256));
        let config = WinsysConfig {
            initial_ib_dwords: 64,
            ..WinsysConfig::default()
        };
        let mut cs = CmdStream::new(HwIp::Gfx, alloc, &config).unwrap();
        cs.push(&[1; 60]);
        cs.push(&[2; 10]);
        assert_eq!(cs.error(), Some(&WinsysError::OutOfDeviceMemory));
        // Writes keep succeeding into throw-away space.
        cs.push(&[3; 500]);
        assert_eq!(cs.finalize(), Err(WinsysError::OutOfDeviceMemory));

        cs.reset();
        assert_eq!(cs.error(), None);
        assert_eq!(cs.capacity(), 60);
        cs.push(&[4; 8]);
        assert_eq!(cs.finalize(), Ok(()));
    }

    #[test]
    fn sysmem_chunks_spill_at_the_cap() {
        let mut cs = stream(false, 64);
        cs.push(&vec![1; SYSMEM_CHUNK_MAX_DWORDS - 8]);
        assert_eq!(cs.num_segments(), 1);
        cs.push(&[2; 16]);
        assert_eq!(cs.num_segments(), 2);
        let lens: Vec<_> = cs.segments().map(|s| s.payload().len()).collect();
        assert_eq!(lens, vec![SYSMEM_CHUNK_MAX_DWORDS - 8, 16]);
        assert_eq!(cs.handles().len(), 0);
    }

    #[test]
    fn secondary_with_single_segment_is_nested() {
        let mut parent = stream(true, 64);
        let mut child = stream(true, 64);
        child.push(&[5; 10]);
        child.finalize().unwrap();
        parent.execute_secondary(&child, true);

        let words = parent.payload_words();
        let packets: Vec<_> = walk_packets(&words)
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(packets.len(), 1);
        let PacketHeader::Type3(header) = packets[0].header else {
            panic!("expected PKT3");
        };
        assert_eq!(header.opcode, Opcode::IndirectBuffer);
        assert_eq!(packets[0].body[2] & IB_SIZE_MASK, 16);
        assert_eq!(packets[0].body[2] & IB_CHAIN, 0);
        assert_eq!(parent.handles().len(), 2);
    }

    #[test]
    fn chained_secondary_is_copied_in_order() {
        let mut parent = stream(true, 64);
        let mut child = stream(true, 64);
        child.push(&[5; 60]);
        child.push(&[6; 20]);
        child.finalize().unwrap();
        parent.execute_secondary(&child, true);

        let words = parent.payload_words();
        assert_eq!(&words[..60], &[5; 60]);
        assert_eq!(&words[60..80], &[6; 20]);
        assert_eq!(
            parent.handles().len(),
            parent.num_segments() + child.handles().len()
        );
    }
}
