//! Per-command-buffer bump allocator for transient GPU data.
//!
//! Descriptor-set pointer arrays, push constants and vertex-buffer descriptors are written
//! here and referenced by address from the command stream. Outgrown buffers are retired and
//! stay alive until the command buffer is reset, since submitted work may still read them.

use std::sync::Arc;

use pm4_winsys::bo::PRIORITY_UPLOAD_BUFFER;
use pm4_winsys::{Bo, BoDesc, BoFlags, CmdStream, Domain, Winsys, WinsysError};
use tracing::debug;

pub const MIN_UPLOAD_BUFFER_BYTES: u64 = 16 * 1024;

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

fn lines_spanned(offset: u64, size: u64, line: u64) -> u64 {
    (offset + size - 1) / line - offset / line + 1
}

/// A region handed out by [`UploadBuffer::alloc`].
#[derive(Clone, Debug)]
pub struct UploadAllocation {
    pub bo: Arc<Bo>,
    pub offset: u64,
}

impl UploadAllocation {
    pub fn va(&self) -> u64 {
        self.bo.va() + self.offset
    }

    pub fn write(&self, data: &[u8]) {
        self.bo.write(self.offset, data);
    }

    pub fn write_words(&self, words: &[u32]) {
        self.bo.write_words(self.offset, words);
    }
}

pub struct UploadBuffer {
    bo: Option<Arc<Bo>>,
    size: u64,
    offset: u64,
    retired: Vec<Arc<Bo>>,
    line_bytes: u64,
}

impl UploadBuffer {
    /// `line_bytes` is the scalar cache line size allocations try not to straddle.
    pub fn new(line_bytes: u32) -> Self {
        Self {
            bo: None,
            size: 0,
            offset: 0,
            retired: Vec::new(),
            line_bytes: u64::from(line_bytes),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Bytes handed out from the current buffer, alignment padding included.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn current_bo(&self) -> Option<&Arc<Bo>> {
        self.bo.as_ref()
    }

    pub fn retired(&self) -> &[Arc<Bo>] {
        &self.retired
    }

    /// Drops retired buffers and rewinds the cursor. The current buffer is kept and
    /// re-referenced by `cs`.
    pub fn reset(&mut self, cs: &mut CmdStream) {
        self.retired.clear();
        self.offset = 0;
        if let Some(bo) = &self.bo {
            cs.add_buffer(bo);
        }
    }

    fn resize(
        &mut self,
        winsys: &Winsys,
        cs: &mut CmdStream,
        min_size: u64,
    ) -> Result<Arc<Bo>, WinsysError> {
        let new_size = min_size
            .max(MIN_UPLOAD_BUFFER_BYTES)
            .max(self.size.saturating_mul(2));
        let bo = winsys.create_bo(&BoDesc {
            size: new_size,
            alignment: 4096,
            domain: Domain::Gtt,
            flags: BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING | BoFlags::VA_32BIT,
            priority: PRIORITY_UPLOAD_BUFFER,
        })?;
        debug!(old = self.size, new = new_size, "resized upload buffer");

        cs.add_buffer(&bo);
        if let Some(old) = self.bo.replace(bo.clone()) {
            self.retired.push(old);
        }
        self.size = new_size;
        self.offset = 0;
        Ok(bo)
    }

    /// Reserves `size` bytes. The allocation is aligned to a cache line only when that
    /// makes it span fewer lines.
    pub fn alloc(
        &mut self,
        winsys: &Winsys,
        cs: &mut CmdStream,
        size: u64,
    ) -> Result<UploadAllocation, WinsysError> {
        assert!(size > 0, "empty upload allocation");
        let line = self.line_bytes;
        let mut offset = self.offset;
        let aligned = align_up(offset, line);
        if lines_spanned(aligned, size, line) < lines_spanned(offset, size, line) {
            offset = aligned;
        }

        let bo = match &self.bo {
            Some(bo) if offset + size <= self.size => bo.clone(),
            _ => {
                offset = 0;
                self.resize(winsys, cs, size)?
            }
        };
        self.offset = offset + size;
        Ok(UploadAllocation { bo, offset })
    }

    pub fn upload(
        &mut self,
        winsys: &Winsys,
        cs: &mut CmdStream,
        data: &[u8],
    ) -> Result<UploadAllocation, WinsysError> {
        let alloc = self.alloc(winsys, cs, data.len() as u64)?;
        alloc.write(data);
        Ok(alloc)
    }

    pub fn upload_words(
        &mut self,
        winsys: &Winsys,
        cs: &mut CmdStream,
        words: &[u32],
    ) -> Result<UploadAllocation, WinsysError> {
        self.upload(winsys, cs, bytemuck::cast_slice(words))
    }
}

impl std::fmt::Debug for UploadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBuffer")
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("retired", &self.retired.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm4_winsys::{HwIp, SimAllocator, SimKernel, WinsysConfig};
    use pretty_assertions::assert_eq;

    fn winsys() -> Winsys {
        Winsys::new(
            WinsysConfig::default(),
            Arc::new(SimAllocator::new()),
            Arc::new(SimKernel::new()),
        )
    }

    #[test]
    fn aligns_only_when_it_saves_a_line() {
        let ws = winsys();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        let mut upload = UploadBuffer::new(32);

        assert_eq!(upload.alloc(&ws, &mut cs, 8).unwrap().offset, 0);
        // 8 bytes fit in the 24-byte gap to the next line: packed.
        assert_eq!(upload.alloc(&ws, &mut cs, 8).unwrap().offset, 8);
        // 20 bytes do not fit in the remaining 16-byte gap: aligned to 32.
        assert_eq!(upload.alloc(&ws, &mut cs, 20).unwrap().offset, 32);
        // Two lines at 52 would touch three.
        assert_eq!(upload.alloc(&ws, &mut cs, 64).unwrap().offset, 64);
        // 16 bytes at 128 already sit in one line.
        assert_eq!(upload.alloc(&ws, &mut cs, 16).unwrap().offset, 128);
        // 40 bytes at 144 touch two lines either way: packed.
        assert_eq!(upload.alloc(&ws, &mut cs, 40).unwrap().offset, 144);
    }

    #[test]
    fn overflow_retires_old_buffer() {
        let ws = winsys();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        let mut upload = UploadBuffer::new(64);

        let first = upload.alloc(&ws, &mut cs, 1024).unwrap();
        assert_eq!(upload.capacity(), MIN_UPLOAD_BUFFER_BYTES);
        let big = upload.alloc(&ws, &mut cs, MIN_UPLOAD_BUFFER_BYTES).unwrap();
        assert_eq!(big.offset, 0);
        assert_eq!(upload.capacity(), 2 * MIN_UPLOAD_BUFFER_BYTES);
        assert_eq!(upload.retired().len(), 1);
        assert!(Arc::ptr_eq(&upload.retired()[0], &first.bo));

        let handles: Vec<_> = cs.handles().iter().map(|e| e.handle).collect();
        assert!(handles.contains(&first.bo.handle()));
        assert!(handles.contains(&big.bo.handle()));

        cs.reset();
        upload.reset(&mut cs);
        assert!(upload.retired().is_empty());
        assert_eq!(upload.offset(), 0);
        assert!(cs
            .handles()
            .iter()
            .any(|e| e.handle == big.bo.handle() && e.priority == PRIORITY_UPLOAD_BUFFER));
    }

    #[test]
    fn upload_writes_through() {
        let ws = winsys();
        let mut cs = ws.create_cs(HwIp::Compute).unwrap();
        let mut upload = UploadBuffer::new(32);
        let alloc = upload.upload_words(&ws, &mut cs, &[1, 2, 3]).unwrap();
        assert_eq!(alloc.bo.read_words(alloc.offset, 3), vec![1, 2, 3]);
        assert!(alloc.va() >= alloc.bo.va());
    }

    #[test]
    fn allocation_failure_keeps_previous_buffer() {
        let alloc = Arc::new(SimAllocator::new());
        let ws = Winsys::new(WinsysConfig::default(), alloc.clone(), Arc::new(SimKernel::new()));
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        let mut upload = UploadBuffer::new(32);
        upload.alloc(&ws, &mut cs, 16).unwrap();

        alloc.set_budget(Some(0));
        assert_eq!(
            upload.alloc(&ws, &mut cs, MIN_UPLOAD_BUFFER_BYTES).unwrap_err(),
            WinsysError::OutOfDeviceMemory
        );
        assert_eq!(upload.capacity(), MIN_UPLOAD_BUFFER_BYTES);
        assert!(upload.retired().is_empty());
    }
}
