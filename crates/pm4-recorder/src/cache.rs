//! Device-wide cache of vertex-shader prologs.
//!
//! Pipelines with a dynamic vertex input layout fetch their attributes through a small
//! prolog compiled per layout. Prologs are shared by every command buffer of a device.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use pm4_winsys::Bo;

use crate::error::Result;

/// Concurrency-safe map with insert-on-miss.
///
/// Lookups share a read lock. A miss takes the write lock, looks again in case another
/// thread inserted the key meanwhile, and only then creates the value.
#[derive(Debug)]
pub struct KeyedCache<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    /// Returns the cached value and whether it was already present. `create` runs at most
    /// once per key; a failed creation leaves the cache unchanged.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        create: impl FnOnce(&K) -> std::result::Result<V, E>,
    ) -> std::result::Result<(V, bool), E> {
        if let Some(value) = self.get(&key) {
            return Ok((value, true));
        }

        let mut map = self.map.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(value) = map.get(&key) {
            return Ok((value.clone(), true));
        }
        let value = create(&key)?;
        map.insert(key, value.clone());
        Ok((value, false))
    }

    pub fn clear(&self) {
        self.map
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    /// Opaque format code understood by the prolog compiler.
    pub format: u32,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBindingDesc {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
    pub divisor: u32,
}

/// The dynamic vertex input layout of a command buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VertexInputState {
    pub bindings: Vec<VertexBindingDesc>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputState {
    pub fn binding(&self, binding: u32) -> Option<&VertexBindingDesc> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

/// What a prolog depends on. Strides are not part of it: they reach the shader through the
/// vertex-buffer descriptors.
#[derive(Clone, Debug)]
pub struct VsPrologKey {
    pub attributes: Vec<VertexAttribute>,
    /// Bit per attribute location fetched per instance.
    pub instance_rate_mask: u32,
    /// Divisor per attribute, in `attributes` order. Per-vertex attributes hold 0.
    pub divisors: Vec<u32>,
    hash: u64,
}

impl VsPrologKey {
    pub fn new(state: &VertexInputState) -> Self {
        let mut attributes = state.attributes.clone();
        attributes.sort_by_key(|a| a.location);

        let mut instance_rate_mask = 0u32;
        let mut divisors = Vec::with_capacity(attributes.len());
        for attr in &attributes {
            match state.binding(attr.binding) {
                Some(binding) if binding.per_instance => {
                    instance_rate_mask |= 1 << attr.location;
                    divisors.push(binding.divisor);
                }
                _ => divisors.push(0),
            }
        }

        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        hasher.update(bytemuck::cast_slice(&attributes));
        hasher.update(&instance_rate_mask.to_le_bytes());
        hasher.update(bytemuck::cast_slice(&divisors));
        Self {
            attributes,
            instance_rate_mask,
            divisors,
            hash: hasher.digest(),
        }
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for VsPrologKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.instance_rate_mask == other.instance_rate_mask
            && self.attributes == other.attributes
            && self.divisors == other.divisors
    }
}

impl Eq for VsPrologKey {}

impl Hash for VsPrologKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// A compiled prolog, resident in GPU memory.
#[derive(Clone, Debug)]
pub struct VsProlog {
    pub bo: Arc<Bo>,
    pub va: u64,
}

/// Shader-compiler collaborator producing vertex prologs.
pub trait PrologCompiler: Send + Sync {
    fn compile_vs_prolog(&self, key: &VsPrologKey) -> Result<VsProlog>;
}

pub type PrologCache = KeyedCache<VsPrologKey, Arc<VsProlog>>;

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use pretty_assertions::assert_eq;

    fn layout(per_instance: bool) -> VertexInputState {
        VertexInputState {
            bindings: vec![VertexBindingDesc {
                binding: 0,
                stride: 16,
                per_instance,
                divisor: 1,
            }],
            attributes: vec![
                VertexAttribute {
                    location: 1,
                    binding: 0,
                    format: 7,
                    offset: 8,
                },
                VertexAttribute {
                    location: 0,
                    binding: 0,
                    format: 7,
                    offset: 0,
                },
            ],
        }
    }

    #[test]
    fn key_ignores_attribute_order_and_stride() {
        let a = VsPrologKey::new(&layout(false));
        let mut reordered = layout(false);
        reordered.attributes.reverse();
        reordered.bindings[0].stride = 32;
        let b = VsPrologKey::new(&reordered);
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());

        let c = VsPrologKey::new(&layout(true));
        assert_ne!(a, c);
        assert_eq!(c.instance_rate_mask, 0b11);
    }

    #[test]
    fn concurrent_misses_create_once() {
        let cache: Arc<KeyedCache<u32, u32>> = Arc::new(KeyedCache::new());
        let created = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let created = created.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_try_insert_with(42, |_| {
                            created.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ()>(7)
                        })
                        .unwrap()
                        .0
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), 7);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();
        assert_eq!(cache.get_or_try_insert_with(1, |_| Err("boom")), Err("boom"));
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_try_insert_with(1, |_| Ok::<_, ()>(5)), Ok((5, false)));
        assert_eq!(cache.get_or_try_insert_with(1, |_| Ok::<_, ()>(6)), Ok((5, true)));
    }
}
