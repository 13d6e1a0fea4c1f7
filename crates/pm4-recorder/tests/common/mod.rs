//! Device and pipeline fixtures for the recorder integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pm4_protocol::regs::{SPI_SHADER_PGM_LO_VS, SPI_SHADER_USER_DATA_VS_0};
use pm4_protocol::{walk_packets, Opcode, RegSpace};
use pm4_recorder::{
    BindPoint, Buffer, Collaborators, CommandBuffer, CommandBufferLevel, Device, DeviceConfig,
    DynamicStateBits, Pipeline, PipelineLayout, ShaderBinary, ShaderStage, UserDataLayout,
};
use pm4_winsys::{BoDesc, HwIp, SimAllocator, SimKernel};

pub struct Harness {
    pub device: Arc<Device>,
    pub allocator: Arc<SimAllocator>,
    pub kernel: Arc<SimKernel>,
}

pub fn harness(config: DeviceConfig) -> Harness {
    let allocator = Arc::new(SimAllocator::new());
    let kernel = Arc::new(SimKernel::new());
    let device = Device::new(
        config,
        allocator.clone(),
        kernel.clone(),
        Collaborators::default(),
    )
    .unwrap();
    Harness {
        device,
        allocator,
        kernel,
    }
}

pub fn buffer(device: &Device, size: u64) -> Buffer {
    let bo = device
        .winsys()
        .create_bo(&BoDesc {
            size,
            ..BoDesc::default()
        })
        .unwrap();
    Buffer::new(bo)
}

/// A vertex-only graphics pipeline that leaves `dynamic` to the command buffer.
pub fn graphics_pipeline(device: &Device, dynamic: DynamicStateBits) -> Arc<Pipeline> {
    let bo = device
        .winsys()
        .create_bo(&BoDesc {
            size: 4096,
            ..BoDesc::default()
        })
        .unwrap();
    let shader = ShaderBinary {
        stage: ShaderStage::Vertex,
        va: bo.va(),
        bo,
        code_size: 256,
        pgm_lo_reg: SPI_SHADER_PGM_LO_VS,
        user_data_base: SPI_SHADER_USER_DATA_VS_0,
        user_data: UserDataLayout::default(),
    };
    let mut pipeline = Pipeline::new(
        BindPoint::Graphics,
        vec![shader],
        Arc::new(PipelineLayout::default()),
    );
    pipeline.needed_dynamic_state = dynamic;
    pipeline.dynamic_states = dynamic;
    Arc::new(pipeline)
}

pub fn primary(device: &Arc<Device>) -> CommandBuffer {
    let mut cb = CommandBuffer::new(device.clone(), HwIp::Gfx, CommandBufferLevel::Primary).unwrap();
    cb.begin();
    cb
}

pub fn words_since(cb: &CommandBuffer, start: usize) -> Vec<u32> {
    cb.cs().payload_words()[start..].to_vec()
}

pub fn opcodes(words: &[u32]) -> Vec<Opcode> {
    walk_packets(words)
        .map(|p| p.unwrap())
        .filter(|p| !p.is_padding())
        .filter_map(|p| p.opcode())
        .collect()
}

/// Number of register packets whose first register is `reg`.
pub fn packets_starting_at(words: &[u32], space: RegSpace, reg: u32) -> usize {
    walk_packets(words)
        .map(|p| p.unwrap())
        .filter_map(|p| p.register_range())
        .filter(|&(s, first, _)| s == space && first == reg)
        .count()
}
