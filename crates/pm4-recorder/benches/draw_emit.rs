#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use pm4_protocol::regs::{SPI_SHADER_PGM_LO_VS, SPI_SHADER_USER_DATA_VS_0};
#[cfg(not(target_arch = "wasm32"))]
use pm4_recorder::dynamic_state::{Rect2D, Viewport};
#[cfg(not(target_arch = "wasm32"))]
use pm4_recorder::{
    BindPoint, Collaborators, CommandBuffer, CommandBufferLevel, Device, DeviceConfig,
    DynamicStateBits, Pipeline, PipelineLayout, ShaderBinary, ShaderStage, UserDataLayout,
    UserSgprLoc,
};
#[cfg(not(target_arch = "wasm32"))]
use pm4_winsys::{BoDesc, HwIp, SimAllocator, SimKernel};

#[cfg(not(target_arch = "wasm32"))]
const DRAWS: u32 = 1024;

#[cfg(not(target_arch = "wasm32"))]
fn device() -> Arc<Device> {
    Device::new(
        DeviceConfig::default(),
        Arc::new(SimAllocator::new()),
        Arc::new(SimKernel::new()),
        Collaborators::default(),
    )
    .expect("create device")
}

#[cfg(not(target_arch = "wasm32"))]
fn pipeline(device: &Device) -> Arc<Pipeline> {
    let bo = device
        .winsys()
        .create_bo(&BoDesc {
            size: 4096,
            ..BoDesc::default()
        })
        .expect("create shader bo");
    let user_data = UserDataLayout {
        base_vertex: Some(UserSgprLoc { sgpr: 8, count: 1 }),
        ..UserDataLayout::default()
    };
    let shader = ShaderBinary {
        stage: ShaderStage::Vertex,
        va: bo.va(),
        bo,
        code_size: 256,
        pgm_lo_reg: SPI_SHADER_PGM_LO_VS,
        user_data_base: SPI_SHADER_USER_DATA_VS_0,
        user_data,
    };
    let dynamic = DynamicStateBits::VIEWPORT | DynamicStateBits::SCISSOR | DynamicStateBits::LINE_WIDTH;
    let mut pipeline = Pipeline::new(
        BindPoint::Graphics,
        vec![shader],
        Arc::new(PipelineLayout::default()),
    );
    pipeline.needed_dynamic_state = dynamic;
    pipeline.dynamic_states = dynamic;
    Arc::new(pipeline)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_draws(c: &mut Criterion) {
    let device = device();
    let pipeline = pipeline(&device);
    let mut cb = CommandBuffer::new(device.clone(), HwIp::Gfx, CommandBufferLevel::Primary)
        .expect("create command buffer");

    let mut group = c.benchmark_group("draw_emit");
    group.throughput(Throughput::Elements(u64::from(DRAWS)));

    group.bench_function("redundant_state", |b| {
        b.iter(|| {
            cb.begin();
            cb.bind_pipeline(&pipeline);
            for _ in 0..DRAWS {
                cb.draw(black_box(3), 1, 0, 0);
            }
        })
    });

    group.bench_function("changing_state", |b| {
        b.iter(|| {
            cb.begin();
            cb.bind_pipeline(&pipeline);
            for i in 0..DRAWS {
                let size = (i % 64 + 1) as f32;
                let state = cb.dynamic_state_mut();
                state.set_viewports(
                    0,
                    &[Viewport {
                        width: size,
                        height: size,
                        max_depth: 1.0,
                        ..Viewport::default()
                    }],
                );
                state.set_scissors(
                    0,
                    &[Rect2D {
                        width: i % 64 + 1,
                        height: 64,
                        ..Rect2D::default()
                    }],
                );
                state.set_line_width(black_box(1.0));
                cb.draw(3, 1, i, 0);
            }
        })
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group!(benches, bench_draws);
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
