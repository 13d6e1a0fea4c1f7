mod common;

use std::sync::Arc;

use common::{harness, primary};
use pm4_recorder::{
    AccessFlags, DependencyInfo, Device, DeviceConfig, FlushBits, Image, ImageBarrier,
    ImageLayout, ImageUsage, MemoryBarrier, PipelineStageFlags,
};
use pm4_winsys::BoDesc;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn image(device: &Device, usage: ImageUsage) -> Image {
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

fn image_read_barrier(image: Image, dst_access: AccessFlags) -> DependencyInfo {
    DependencyInfo {
        src_stages: PipelineStageFlags::COMPUTE_SHADER,
        dst_stages: PipelineStageFlags::FRAGMENT_SHADER,
        image_barriers: vec![ImageBarrier {
            image,
            src_access: AccessFlags::empty(),
            dst_access,
            old_layout: ImageLayout::General,
            new_layout: ImageLayout::General,
        }],
        ..DependencyInfo::default()
    }
}

#[test]
fn storage_image_reads_invalidate_the_vector_cache_only() {
    let h = harness(DeviceConfig::default());
    let sampled = image(&h.device, ImageUsage::SAMPLED);
    let mut cb = primary(&h.device);
    cb.pipeline_barrier(&image_read_barrier(sampled.clone(), AccessFlags::SHADER_READ));
    let bits = cb.pending_flush();
    assert!(bits.contains(FlushBits::INV_VCACHE));
    assert!(!bits.contains(FlushBits::FLUSH_AND_INV_CB));

    let mut cb = primary(&h.device);
    cb.pipeline_barrier(&image_read_barrier(sampled, AccessFlags::MEMORY_READ));
    assert!(!cb.pending_flush().contains(FlushBits::FLUSH_AND_INV_CB));

    let storage = image(&h.device, ImageUsage::STORAGE | ImageUsage::SAMPLED);
    let mut cb = primary(&h.device);
    cb.pipeline_barrier(&image_read_barrier(storage, AccessFlags::MEMORY_READ));
    let bits = cb.pending_flush();
    assert!(bits.contains(FlushBits::INV_VCACHE));
    assert!(bits.contains(FlushBits::FLUSH_AND_INV_CB));
}

#[test]
fn barriers_only_record_until_the_next_work() {
    let h = harness(DeviceConfig::default());
    let mut cb = primary(&h.device);
    let start = cb.cs().payload_words().len();
    cb.pipeline_barrier(&DependencyInfo {
        src_stages: PipelineStageFlags::COMPUTE_SHADER,
        dst_stages: PipelineStageFlags::COMPUTE_SHADER,
        memory_barriers: vec![MemoryBarrier {
            src_access: AccessFlags::SHADER_WRITE,
            dst_access: AccessFlags::SHADER_READ,
        }],
        ..DependencyInfo::default()
    });
    assert_eq!(cb.cs().payload_words().len(), start);
    assert!(cb.pending_flush().contains(FlushBits::CS_PARTIAL_FLUSH));

    cb.end().unwrap();
    assert_eq!(cb.pending_flush(), FlushBits::empty());
    assert!(cb.cs().payload_words().len() > start);
    assert_eq!(h.device.stats().snapshot().barriers, 1);
}

fn access() -> impl Strategy<Value = AccessFlags> {
    any::<u32>().prop_map(AccessFlags::from_bits_truncate)
}

fn stages() -> impl Strategy<Value = PipelineStageFlags> {
    any::<u32>().prop_map(PipelineStageFlags::from_bits_truncate)
}

fn barrier() -> impl Strategy<Value = DependencyInfo> {
    (stages(), stages(), access(), access()).prop_map(|(src_stages, dst_stages, src, dst)| {
        DependencyInfo {
            src_stages,
            dst_stages,
            memory_barriers: vec![MemoryBarrier {
                src_access: src,
                dst_access: dst,
            }],
            ..DependencyInfo::default()
        }
    })
}

fn pending_after(device: &Arc<Device>, barriers: &[DependencyInfo]) -> FlushBits {
    let mut cb = primary(device);
    for info in barriers {
        cb.pipeline_barrier(info);
    }
    cb.pending_flush()
}

proptest! {
    #[test]
    fn consecutive_barriers_merge_into_one_flush(
        barriers in proptest::collection::vec(barrier(), 1..8),
    ) {
        let h = harness(DeviceConfig::default());
        let merged = pending_after(&h.device, &barriers);
        let separate = barriers
            .iter()
            .fold(FlushBits::empty(), |bits, info| {
                bits | pending_after(&h.device, std::slice::from_ref(info))
            });
        prop_assert_eq!(merged, separate);
    }
}
