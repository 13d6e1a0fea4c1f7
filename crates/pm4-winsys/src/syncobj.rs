use std::sync::RwLock;

use tracing::debug;

use crate::error::{Result, WinsysError};
use crate::kernel::KernelDevice;

/// Process-local free list of binary syncobjs used to emulate timeline points.
#[derive(Debug, Default)]
pub struct SyncobjPool {
    free: RwLock<Vec<u32>>,
}

impl SyncobjPool {
    /// Takes a syncobj from the free list, creating one when the list is empty.
    pub fn acquire(&self, kernel: &dyn KernelDevice) -> Result<u32> {
        let recycled = self
            .free
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match recycled {
            Some(handle) => Ok(handle),
            None => {
                let handle = kernel
                    .syncobj_create(false)
                    .map_err(WinsysError::from_kernel)?;
                debug!(handle, "created emulation syncobj");
                Ok(handle)
            }
        }
    }

    /// Resets `handles` and returns them to the free list. Handles the kernel refuses to
    /// reset are destroyed instead.
    pub fn release(&self, kernel: &dyn KernelDevice, handles: &[u32]) {
        if handles.is_empty() {
            return;
        }
        if kernel.syncobj_reset(handles).is_err() {
            for &handle in handles {
                kernel.syncobj_destroy(handle);
            }
            return;
        }
        self.free
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(handles);
    }

    pub fn len(&self) -> usize {
        self.free
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn destroy_all(&self, kernel: &dyn KernelDevice) {
        let handles = std::mem::take(
            &mut *self
                .free
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in handles {
            kernel.syncobj_destroy(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn released_syncobjs_are_reused() {
        let kernel = SimKernel::new();
        let pool = SyncobjPool::default();
        let a = pool.acquire(&kernel).unwrap();
        let b = pool.acquire(&kernel).unwrap();
        assert_ne!(a, b);
        pool.release(&kernel, &[a, b]);
        assert_eq!(pool.len(), 2);

        let c = pool.acquire(&kernel).unwrap();
        assert!(c == a || c == b);
        assert_eq!(kernel.live_syncobjs(), 2);

        pool.destroy_all(&kernel);
        assert!(pool.is_empty());
        assert_eq!(kernel.live_syncobjs(), 1);
    }
}
