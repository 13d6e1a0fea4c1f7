//! Fixtures shared by the unit tests.

use std::sync::Arc;

use pm4_protocol::regs::{
    COMPUTE_PGM_LO, COMPUTE_USER_DATA_0, SPI_SHADER_PGM_LO_VS, SPI_SHADER_USER_DATA_VS_0,
};
use pm4_winsys::{BoDesc, HwIp, SimAllocator, SimKernel};

use crate::cmd_buffer::{CommandBuffer, CommandBufferLevel};
use crate::config::DeviceConfig;
use crate::device::{Collaborators, Device};
use crate::pipeline::{BindPoint, Pipeline, PipelineLayout, ShaderBinary, ShaderStage, UserDataLayout, UserSgprLoc};
use crate::resources::{Buffer, Image, ImageUsage};

pub(crate) fn test_device_with(config: DeviceConfig, collaborators: Collaborators) -> Arc<Device> {
    Device::new(
        config,
        Arc::new(SimAllocator::new()),
        Arc::new(SimKernel::new()),
        collaborators,
    )
    .unwrap()
}

pub(crate) fn test_device(config: DeviceConfig) -> Arc<Device> {
    test_device_with(config, Collaborators::default())
}

pub(crate) fn test_device_with_sim(
    config: DeviceConfig,
) -> (Arc<Device>, Arc<SimAllocator>, Arc<SimKernel>) {
    let allocator = Arc::new(SimAllocator::new());
    let kernel = Arc::new(SimKernel::new());
    let device = Device::new(
        config,
        allocator.clone(),
        kernel.clone(),
        Collaborators::default(),
    )
    .unwrap();
    (device, allocator, kernel)
}

pub(crate) fn test_cmd_buffer(device: &Arc<Device>) -> CommandBuffer {
    CommandBuffer::new(device.clone(), HwIp::Gfx, CommandBufferLevel::Primary).unwrap()
}

pub(crate) fn test_buffer(device: &Device, size: u64) -> Buffer {
    let bo = device
        .winsys()
        .create_bo(&BoDesc {
            size,
            ..BoDesc::default()
        })
        .unwrap();
    Buffer::new(bo)
}

pub(crate) fn test_image(device: &Device, usage: ImageUsage) -> Image {
    let bo = device
        .winsys()
        .create_bo(&BoDesc {
            size: 64 * 64 * 4,
            ..BoDesc::default()
        })
        .unwrap();
    Image {
        bo,
        offset: 0,
        usage,
        depth_stencil: false,
        has_cb_metadata: false,
        has_htile: false,
        l2_coherent: true,
        pitch: 64,
    }
}

/// A pipeline with one shader for `bind_point`, reading `user_data` and 16 bytes of push
/// constants.
pub(crate) fn test_pipeline(
    device: &Device,
    bind_point: BindPoint,
    user_data: UserDataLayout,
) -> Arc<Pipeline> {
    let bo = device
        .winsys()
        .create_bo(&BoDesc {
            size: 4096,
            ..BoDesc::default()
        })
        .unwrap();
    let (stage, pgm_lo_reg, user_data_base) = match bind_point {
        BindPoint::Graphics => (ShaderStage::Vertex, SPI_SHADER_PGM_LO_VS, SPI_SHADER_USER_DATA_VS_0),
        BindPoint::Compute => (ShaderStage::Compute, COMPUTE_PGM_LO, COMPUTE_USER_DATA_0),
    };
    let shader = ShaderBinary {
        stage,
        va: bo.va(),
        bo,
        code_size: 256,
        pgm_lo_reg,
        user_data_base,
        user_data,
    };
    let layout = Arc::new(PipelineLayout {
        sets: Vec::new(),
        push_constant_size: 16,
    });
    Arc::new(Pipeline::new(bind_point, vec![shader], layout))
}

pub(crate) fn test_compute_pipeline(device: &Device, grid_size: Option<UserSgprLoc>) -> Arc<Pipeline> {
    let user_data = UserDataLayout {
        grid_size,
        ..UserDataLayout::default()
    };
    test_pipeline(device, BindPoint::Compute, user_data)
}
