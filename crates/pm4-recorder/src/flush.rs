//! Cache flush and invalidate encoding.
//!
//! Flushes accumulate in a [`FlushBits`] set on the command buffer and are written out in
//! one batch right before the next draw, dispatch or at the end of recording.

use bitflags::bitflags;
use pm4_protocol::packet::{
    COHER_CB_ACTION_ENA, COHER_DB_ACTION_ENA, COHER_POLL_INTERVAL, COHER_SH_ICACHE_ACTION_ENA,
    COHER_SH_KCACHE_ACTION_ENA, COHER_SIZE_ALL, COHER_TCL1_ACTION_ENA, COHER_TC_ACTION_ENA,
    COHER_TC_WB_ACTION_ENA, EVENT_CACHE_FLUSH_AND_INV, EVENT_CS_PARTIAL_FLUSH,
    EVENT_FLUSH_AND_INV_CB_META, EVENT_FLUSH_AND_INV_DB_META, EVENT_PIPELINESTAT_START,
    EVENT_PIPELINESTAT_STOP, EVENT_PS_PARTIAL_FLUSH, EVENT_VGT_FLUSH, EVENT_VGT_STREAMOUT_SYNC,
    EVENT_VS_PARTIAL_FLUSH, GCR_GL1_INV, GCR_GL2_INV, GCR_GL2_WB, GCR_GLI_INV, GCR_GLK_INV,
    GCR_GLM_INV, GCR_GLM_WB, GCR_GLV_INV,
};
use pm4_protocol::{DwordSink, Opcode, Pm4Emit};
use pm4_winsys::HwIp;

use crate::caps::{CacheFlushStyle, ChipCaps, GfxLevel};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FlushBits: u32 {
        const INV_ICACHE = 1 << 0;
        const INV_SCACHE = 1 << 1;
        const INV_VCACHE = 1 << 2;
        const INV_L2 = 1 << 3;
        const WB_L2 = 1 << 4;
        const INV_L2_METADATA = 1 << 5;
        const FLUSH_AND_INV_CB_META = 1 << 6;
        const FLUSH_AND_INV_DB_META = 1 << 7;
        const FLUSH_AND_INV_DB = 1 << 8;
        const FLUSH_AND_INV_CB = 1 << 9;
        const PS_PARTIAL_FLUSH = 1 << 10;
        const CS_PARTIAL_FLUSH = 1 << 11;
        const VS_PARTIAL_FLUSH = 1 << 12;
        const VGT_FLUSH = 1 << 13;
        const START_PIPELINE_STATS = 1 << 14;
        const STOP_PIPELINE_STATS = 1 << 15;
        const VGT_STREAMOUT_SYNC = 1 << 16;

        /// Flushes that make the CP wait for earlier work, so state can be emitted while
        /// the wait is in progress.
        const WAIT_FOR_IDLE = Self::FLUSH_AND_INV_CB.bits()
            | Self::FLUSH_AND_INV_DB.bits()
            | Self::PS_PARTIAL_FLUSH.bits()
            | Self::CS_PARTIAL_FLUSH.bits();
        const GRAPHICS_ONLY = Self::FLUSH_AND_INV_CB.bits()
            | Self::FLUSH_AND_INV_CB_META.bits()
            | Self::FLUSH_AND_INV_DB.bits()
            | Self::FLUSH_AND_INV_DB_META.bits()
            | Self::PS_PARTIAL_FLUSH.bits()
            | Self::VS_PARTIAL_FLUSH.bits()
            | Self::VGT_FLUSH.bits()
            | Self::VGT_STREAMOUT_SYNC.bits();
    }
}

/// Upper bound of dwords [`emit_cache_flush`] writes.
pub const CACHE_FLUSH_MAX_DWORDS: usize = 64;

const PARTIAL_FLUSH_EVENT_INDEX: u32 = 4;

fn emit_acquire<S: DwordSink + ?Sized>(sink: &mut S, caps: &ChipCaps, cp_coher_cntl: u32) {
    match caps.cache_flush_style {
        CacheFlushStyle::SurfaceSync => sink.emit_pkt3(
            Opcode::SurfaceSync,
            &[cp_coher_cntl, COHER_SIZE_ALL, 0, COHER_POLL_INTERVAL],
        ),
        CacheFlushStyle::AcquireMem | CacheFlushStyle::Gcr => {
            let size_hi = if caps.gfx_level >= GfxLevel::Gfx9 {
                0x00FF_FFFF
            } else {
                0xFF
            };
            sink.emit_pkt3(
                Opcode::AcquireMem,
                &[cp_coher_cntl, COHER_SIZE_ALL, size_hi, 0, 0, COHER_POLL_INTERVAL],
            );
        }
    }
}

fn emit_gcr_acquire<S: DwordSink + ?Sized>(sink: &mut S, gcr_cntl: u32) {
    sink.emit_pkt3(
        Opcode::AcquireMem,
        &[
            0,
            COHER_SIZE_ALL,
            0x01FF_FFFF,
            0,
            0,
            COHER_POLL_INTERVAL,
            gcr_cntl,
        ],
    );
}

fn emit_flush_events<S: DwordSink + ?Sized>(sink: &mut S, caps: &ChipCaps, bits: FlushBits) {
    if bits.contains(FlushBits::FLUSH_AND_INV_CB_META) {
        sink.emit_event(EVENT_FLUSH_AND_INV_CB_META, 0);
    }
    if bits.contains(FlushBits::FLUSH_AND_INV_DB_META) {
        sink.emit_event(EVENT_FLUSH_AND_INV_DB_META, 0);
    }
    if bits.contains(FlushBits::PS_PARTIAL_FLUSH) {
        sink.emit_event(EVENT_PS_PARTIAL_FLUSH, PARTIAL_FLUSH_EVENT_INDEX);
    } else if bits.contains(FlushBits::VS_PARTIAL_FLUSH) {
        sink.emit_event(EVENT_VS_PARTIAL_FLUSH, PARTIAL_FLUSH_EVENT_INDEX);
    }
    if bits.contains(FlushBits::CS_PARTIAL_FLUSH) {
        sink.emit_event(EVENT_CS_PARTIAL_FLUSH, PARTIAL_FLUSH_EVENT_INDEX);
    }
    if !caps.cb_db_flush_via_coher
        && bits.intersects(FlushBits::FLUSH_AND_INV_CB | FlushBits::FLUSH_AND_INV_DB)
    {
        sink.emit_event(EVENT_CACHE_FLUSH_AND_INV, 0);
    }
    if bits.contains(FlushBits::VGT_FLUSH) {
        sink.emit_event(EVENT_VGT_FLUSH, 0);
    }
    if bits.contains(FlushBits::VGT_STREAMOUT_SYNC) {
        sink.emit_event(EVENT_VGT_STREAMOUT_SYNC, 0);
    }
}

fn emit_pipeline_stats_events<S: DwordSink + ?Sized>(sink: &mut S, bits: FlushBits) {
    if bits.contains(FlushBits::START_PIPELINE_STATS) {
        sink.emit_event(EVENT_PIPELINESTAT_START, 0);
    } else if bits.contains(FlushBits::STOP_PIPELINE_STATS) {
        sink.emit_event(EVENT_PIPELINESTAT_STOP, 0);
    }
}

/// Writes the packets for `bits` to `sink`. The caller reserves
/// [`CACHE_FLUSH_MAX_DWORDS`] first.
///
/// Graphics-only flushes are dropped on the compute engine.
pub fn emit_cache_flush<S: DwordSink + ?Sized>(
    sink: &mut S,
    caps: &ChipCaps,
    ip: HwIp,
    mut bits: FlushBits,
) {
    let is_gfx = ip == HwIp::Gfx;
    if !is_gfx {
        bits &= !FlushBits::GRAPHICS_ONLY;
    }
    if bits.is_empty() {
        return;
    }

    if caps.cache_flush_style == CacheFlushStyle::Gcr {
        emit_gcr_flush(sink, caps, is_gfx, bits);
        return;
    }

    let mut cp_coher_cntl = 0;
    if bits.contains(FlushBits::INV_ICACHE) {
        cp_coher_cntl |= COHER_SH_ICACHE_ACTION_ENA;
    }
    if bits.contains(FlushBits::INV_SCACHE) {
        cp_coher_cntl |= COHER_SH_KCACHE_ACTION_ENA;
    }
    if caps.cb_db_flush_via_coher {
        if bits.contains(FlushBits::FLUSH_AND_INV_CB) {
            cp_coher_cntl |= COHER_CB_ACTION_ENA;
        }
        if bits.contains(FlushBits::FLUSH_AND_INV_DB) {
            cp_coher_cntl |= COHER_DB_ACTION_ENA;
        }
    }

    emit_flush_events(sink, caps, bits);

    let waits_for_memory = bits.intersects(
        FlushBits::CS_PARTIAL_FLUSH
            | FlushBits::INV_VCACHE
            | FlushBits::INV_L2
            | FlushBits::WB_L2
            | FlushBits::INV_L2_METADATA,
    );
    if is_gfx && (cp_coher_cntl != 0 || waits_for_memory) {
        sink.emit_pkt3(Opcode::PfpSyncMe, &[0]);
    }

    let gfx8_plus = caps.gfx_level >= GfxLevel::Gfx8;
    if bits.contains(FlushBits::INV_L2) || (!gfx8_plus && bits.contains(FlushBits::WB_L2)) {
        let mut cntl = cp_coher_cntl | COHER_TC_ACTION_ENA | COHER_TCL1_ACTION_ENA;
        if gfx8_plus {
            cntl |= COHER_TC_WB_ACTION_ENA;
        }
        emit_acquire(sink, caps, cntl);
        cp_coher_cntl = 0;
    } else {
        if bits.intersects(FlushBits::WB_L2 | FlushBits::INV_L2_METADATA) {
            emit_acquire(sink, caps, cp_coher_cntl | COHER_TC_WB_ACTION_ENA);
            cp_coher_cntl = 0;
        }
        if bits.contains(FlushBits::INV_VCACHE) {
            cp_coher_cntl |= COHER_TCL1_ACTION_ENA;
        }
    }
    if cp_coher_cntl != 0 {
        emit_acquire(sink, caps, cp_coher_cntl);
    }

    emit_pipeline_stats_events(sink, bits);
}

fn emit_gcr_flush<S: DwordSink + ?Sized>(
    sink: &mut S,
    caps: &ChipCaps,
    is_gfx: bool,
    bits: FlushBits,
) {
    let mut gcr_cntl = 0;
    if bits.contains(FlushBits::INV_ICACHE) {
        gcr_cntl |= GCR_GLI_INV;
    }
    if bits.contains(FlushBits::INV_SCACHE) {
        gcr_cntl |= GCR_GLK_INV;
    }
    if bits.contains(FlushBits::INV_VCACHE) {
        gcr_cntl |= GCR_GL1_INV | GCR_GLV_INV;
    }
    if bits.contains(FlushBits::INV_L2) {
        gcr_cntl |= GCR_GL2_INV | GCR_GL2_WB | GCR_GLM_INV | GCR_GLM_WB;
    } else if bits.contains(FlushBits::WB_L2) {
        gcr_cntl |= GCR_GL2_WB | GCR_GLM_WB;
    }
    if bits.contains(FlushBits::INV_L2_METADATA) {
        gcr_cntl |= GCR_GLM_INV | GCR_GLM_WB;
    }

    emit_flush_events(sink, caps, bits);

    if is_gfx && (gcr_cntl != 0 || bits.contains(FlushBits::CS_PARTIAL_FLUSH)) {
        sink.emit_pkt3(Opcode::PfpSyncMe, &[0]);
    }
    if gcr_cntl != 0 {
        emit_gcr_acquire(sink, gcr_cntl);
    }

    emit_pipeline_stats_events(sink, bits);
}
