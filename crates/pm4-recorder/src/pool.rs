use std::sync::Arc;

use pm4_winsys::HwIp;
use tracing::debug;

use crate::cmd_buffer::{CommandBuffer, CommandBufferLevel};
use crate::device::Device;
use crate::error::Result;

/// Allocates command buffers for one engine and recycles freed ones.
///
/// Recycled buffers keep their command stream and upload buffer, so steady-state recording
/// allocates nothing.
#[derive(Debug)]
pub struct CommandPool {
    device: Arc<Device>,
    ip: HwIp,
    free: Vec<CommandBuffer>,
}

impl CommandPool {
    pub fn new(device: Arc<Device>, ip: HwIp) -> Self {
        Self {
            device,
            ip,
            free: Vec::new(),
        }
    }

    pub fn ip(&self) -> HwIp {
        self.ip
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn allocate(&mut self, level: CommandBufferLevel) -> Result<CommandBuffer> {
        if let Some(pos) = self.free.iter().position(|cb| cb.level() == level) {
            let mut cb = self.free.swap_remove(pos);
            cb.reset();
            return Ok(cb);
        }
        CommandBuffer::new(self.device.clone(), self.ip, level)
    }

    pub fn free(&mut self, mut cb: CommandBuffer) {
        assert_eq!(cb.ip(), self.ip, "command buffer belongs to another pool");
        cb.reset();
        self.free.push(cb);
    }

    /// Releases every recycled command buffer.
    pub fn trim(&mut self) {
        if !self.free.is_empty() {
            debug!(count = self.free.len(), "trimmed command pool");
        }
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_buffer::CommandBufferStatus;
    use crate::config::DeviceConfig;
    use crate::test_util::test_device_with_sim;
    use pretty_assertions::assert_eq;

    #[test]
    fn freed_buffers_are_recycled_per_level() {
        let (device, allocator, _kernel) = test_device_with_sim(DeviceConfig::default());
        let mut pool = CommandPool::new(device, HwIp::Gfx);

        let mut cb = pool.allocate(CommandBufferLevel::Primary).unwrap();
        cb.begin();
        cb.begin_pipeline_statistics();
        cb.end().unwrap();
        pool.free(cb);
        assert_eq!(pool.free_count(), 1);

        let secondary = pool.allocate(CommandBufferLevel::Secondary).unwrap();
        assert_eq!(secondary.level(), CommandBufferLevel::Secondary);
        assert_eq!(pool.free_count(), 1);

        let created = allocator.created();
        let cb = pool.allocate(CommandBufferLevel::Primary).unwrap();
        assert_eq!(cb.status(), CommandBufferStatus::Initial);
        assert!(cb.cs().is_empty());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(allocator.created(), created);

        pool.free(cb);
        pool.free(secondary);
        assert_eq!(pool.free_count(), 2);
        pool.trim();
        assert_eq!(pool.free_count(), 0);
    }
}
