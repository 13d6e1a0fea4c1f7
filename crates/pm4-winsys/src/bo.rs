//! Buffer objects.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoHandle(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Domain {
    #[default]
    Gtt,
    Vram,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BoFlags: u32 {
        const CPU_ACCESS = 1 << 0;
        const NO_CPU_ACCESS = 1 << 1;
        const READ_ONLY = 1 << 2;
        const GTT_WC = 1 << 3;
        const VIRTUAL = 1 << 4;
        const NO_INTERPROCESS_SHARING = 1 << 5;
        /// Place the buffer in the 32-bit address window so shaders can use 32-bit pointers.
        const VA_32BIT = 1 << 6;
    }
}

// Relocation priorities. Higher values are kept resident more aggressively.
pub const PRIORITY_DEFAULT: u8 = 7;
pub const PRIORITY_FENCE: u8 = 10;
pub const PRIORITY_DESCRIPTOR: u8 = 13;
pub const PRIORITY_SHADER: u8 = 18;
pub const PRIORITY_UPLOAD_BUFFER: u8 = 24;
pub const PRIORITY_APPLICATION_MAX: u8 = 28;
pub const PRIORITY_VIRTUAL: u8 = 29;
pub const PRIORITY_CS: u8 = 30;

/// One entry of a submission's buffer list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoEntry {
    pub handle: BoHandle,
    pub priority: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoDesc {
    pub size: u64,
    pub alignment: u64,
    pub domain: Domain,
    pub flags: BoFlags,
    pub priority: u8,
}

impl Default for BoDesc {
    fn default() -> Self {
        Self {
            size: 0,
            alignment: 4096,
            domain: Domain::Gtt,
            flags: BoFlags::empty(),
            priority: PRIORITY_DEFAULT,
        }
    }
}

#[derive(Clone)]
struct VirtualBinding {
    offset: u64,
    size: u64,
    backing: Arc<Bo>,
}

/// A GPU-addressable allocation.
///
/// Buffers created with [`BoFlags::CPU_ACCESS`] carry a host mapping. Virtual buffers own no
/// memory; ranges of them are bound to physical buffers and resolved at submit time.
pub struct Bo {
    handle: BoHandle,
    va: u64,
    size: u64,
    domain: Domain,
    flags: BoFlags,
    priority: u8,
    map: Option<Mutex<Vec<u8>>>,
    bindings: RwLock<Vec<VirtualBinding>>,
}

impl Bo {
    pub fn new(handle: BoHandle, va: u64, desc: &BoDesc) -> Self {
        let map = (desc.flags.contains(BoFlags::CPU_ACCESS) && !desc.flags.contains(BoFlags::VIRTUAL))
            .then(|| Mutex::new(vec![0u8; desc.size as usize]));
        Self {
            handle,
            va,
            size: desc.size,
            domain: desc.domain,
            flags: desc.flags,
            priority: desc.priority,
            map,
            bindings: RwLock::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> BoHandle {
        self.handle
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn entry(&self) -> BoEntry {
        BoEntry {
            handle: self.handle,
            priority: self.priority,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(BoFlags::VIRTUAL)
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Copies `data` into the host mapping at byte `offset`.
    ///
    /// Panics if the buffer has no mapping or the range is out of bounds.
    pub fn write(&self, offset: u64, data: &[u8]) {
        let map = self.map.as_ref().expect("write to a buffer without CPU access");
        let mut bytes = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn write_words(&self, offset: u64, words: &[u32]) {
        self.write(offset, bytemuck::cast_slice(words));
    }

    pub fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        let map = self.map.as_ref().expect("read from a buffer without CPU access");
        let bytes = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = offset as usize;
        bytes[start..start + len].to_vec()
    }

    pub fn read_words(&self, offset: u64, count: usize) -> Vec<u32> {
        self.read(offset, count * 4)
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Binds `[offset, offset + size)` of a virtual buffer to `backing`, or unbinds it when
    /// `backing` is `None`. Bindings fully covered by the new range are replaced.
    pub fn bind(&self, offset: u64, size: u64, backing: Option<Arc<Bo>>) {
        assert!(self.is_virtual(), "bind on a physical buffer");
        assert!(offset + size <= self.size, "virtual binding out of range");
        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bindings.retain(|b| b.offset < offset || b.offset + b.size > offset + size);
        if let Some(backing) = backing {
            bindings.push(VirtualBinding {
                offset,
                size,
                backing,
            });
        }
    }

    /// Distinct physical buffers currently bound to this virtual buffer, in binding order.
    pub fn backing_bos(&self) -> Vec<Arc<Bo>> {
        let bindings = self
            .bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out: Vec<Arc<Bo>> = Vec::with_capacity(bindings.len());
        for binding in bindings.iter() {
            if !out.iter().any(|b| b.handle == binding.backing.handle) {
                out.push(binding.backing.clone());
            }
        }
        out
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.handle)
            .field("va", &format_args!("{:#x}", self.va))
            .field("size", &self.size)
            .field("domain", &self.domain)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Memory allocator collaborator.
pub trait BoAllocator: Send + Sync {
    fn create_bo(&self, desc: &BoDesc) -> Result<Arc<Bo>>;

    fn create_virtual_bo(&self, size: u64) -> Result<Arc<Bo>> {
        self.create_bo(&BoDesc {
            size,
            flags: BoFlags::VIRTUAL,
            priority: PRIORITY_VIRTUAL,
            ..BoDesc::default()
        })
    }
}
