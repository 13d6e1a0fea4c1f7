use std::sync::Arc;

use pm4_recorder::upload::UploadBuffer;
use pm4_winsys::{HwIp, SimAllocator, SimKernel, Winsys, WinsysConfig};
use proptest::prelude::*;

fn winsys() -> Winsys {
    Winsys::new(
        WinsysConfig::default(),
        Arc::new(SimAllocator::new()),
        Arc::new(SimKernel::new()),
    )
}

proptest! {
    #[test]
    fn allocations_are_disjoint_and_touch_as_few_lines_as_possible(
        sizes in proptest::collection::vec(1u64..6000, 1..64),
        line_shift in 5u32..8,
    ) {
        let line = 1u64 << line_shift;
        let ws = winsys();
        let mut cs = ws.create_cs(HwIp::Gfx).unwrap();
        let mut upload = UploadBuffer::new(line as u32);

        let mut live: Vec<(u64, u64, u64)> = Vec::new();
        for &size in &sizes {
            let alloc = upload.alloc(&ws, &mut cs, size).unwrap();
            let handle = u64::from(alloc.bo.handle().0);
            let (start, end) = (alloc.offset, alloc.offset + size);
            prop_assert!(end <= alloc.bo.size());

            let touched = (end - 1) / line - start / line + 1;
            prop_assert!(touched <= size.div_ceil(line), "{} bytes at {}", size, start);
            for &(other, s, e) in &live {
                prop_assert!(other != handle || end <= s || start >= e);
            }
            live.push((handle, start, end));

            // Every buffer an allocation lives in is referenced by the stream.
            prop_assert!(cs.handles().iter().any(|e| e.handle == alloc.bo.handle()));
        }
    }
}
