//! Per-generation hardware capabilities.
//!
//! Workarounds and encoding differences are looked up here instead of being tested inline
//! against the chip generation. The enable conditions mirror the hardware errata they cover.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GfxLevel {
    Gfx6,
    Gfx7,
    Gfx8,
    Gfx9,
    Gfx10,
    Gfx10_3,
}

impl GfxLevel {
    pub const ALL: [GfxLevel; 6] = [
        GfxLevel::Gfx6,
        GfxLevel::Gfx7,
        GfxLevel::Gfx8,
        GfxLevel::Gfx9,
        GfxLevel::Gfx10,
        GfxLevel::Gfx10_3,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Gfx6 => "gfx6",
            Self::Gfx7 => "gfx7",
            Self::Gfx8 => "gfx8",
            Self::Gfx9 => "gfx9",
            Self::Gfx10 => "gfx10",
            Self::Gfx10_3 => "gfx10.3",
        }
    }
}

impl fmt::Display for GfxLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown gfx level {0:?}")]
pub struct UnknownGfxLevel(pub String);

impl FromStr for GfxLevel {
    type Err = UnknownGfxLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', ".");
        Self::ALL
            .into_iter()
            .find(|level| level.name() == wanted)
            .ok_or_else(|| UnknownGfxLevel(s.to_string()))
    }
}

/// How cache flushes and invalidations are encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheFlushStyle {
    /// `SURFACE_SYNC` with `CP_COHER_CNTL` bits.
    SurfaceSync,
    /// `ACQUIRE_MEM` with `CP_COHER_CNTL` bits.
    AcquireMem,
    /// `ACQUIRE_MEM` with a `GCR_CNTL` word.
    Gcr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChipCaps {
    pub gfx_level: GfxLevel,
    /// Upload allocations are aligned to this when it saves a cache line.
    pub scalar_cache_line_bytes: u32,
    pub has_uconfig_primitive_type: bool,
    /// `VGT_INDEX_TYPE` is written through an indexed uconfig write instead of `INDEX_TYPE`.
    pub index_type_in_uconfig: bool,
    /// Non-indexed draws overwrite `VGT_INDEX_TYPE`.
    pub draw_auto_clobbers_index_type: bool,
    /// Scissors must be rewritten after any context roll.
    pub has_gfx9_scissor_bug: bool,
    /// Shader code and descriptor tables can be prefetched into L2 with CP DMA.
    pub cp_dma_prefetch: bool,
    pub cache_flush_style: CacheFlushStyle,
    /// CB and DB go through L2, so buffer accesses from other clients need no L2 flush.
    pub cb_db_l2_coherent: bool,
    /// CB/DB caches are flushed through `CP_COHER_CNTL` instead of end-of-pipe events.
    pub cb_db_flush_via_coher: bool,
    pub supports_ib_chaining: bool,
    pub has_vrs: bool,
    /// The end of every IB needs a full partial flush plus L2 writeback.
    pub end_of_ib_full_flush: bool,
    pub max_viewports: u32,
}

impl ChipCaps {
    pub const fn for_level(gfx_level: GfxLevel) -> Self {
        let gfx7_plus = !matches!(gfx_level, GfxLevel::Gfx6);
        let gfx9_plus = matches!(
            gfx_level,
            GfxLevel::Gfx9 | GfxLevel::Gfx10 | GfxLevel::Gfx10_3
        );
        let gfx10_plus = matches!(gfx_level, GfxLevel::Gfx10 | GfxLevel::Gfx10_3);
        Self {
            gfx_level,
            scalar_cache_line_bytes: if gfx10_plus { 64 } else { 32 },
            has_uconfig_primitive_type: gfx7_plus,
            index_type_in_uconfig: gfx9_plus,
            draw_auto_clobbers_index_type: matches!(gfx_level, GfxLevel::Gfx7 | GfxLevel::Gfx8),
            has_gfx9_scissor_bug: matches!(gfx_level, GfxLevel::Gfx9),
            cp_dma_prefetch: gfx7_plus,
            cache_flush_style: if gfx10_plus {
                CacheFlushStyle::Gcr
            } else if gfx7_plus {
                CacheFlushStyle::AcquireMem
            } else {
                CacheFlushStyle::SurfaceSync
            },
            cb_db_l2_coherent: gfx9_plus,
            cb_db_flush_via_coher: !gfx9_plus,
            supports_ib_chaining: gfx7_plus,
            has_vrs: matches!(gfx_level, GfxLevel::Gfx10_3),
            end_of_ib_full_flush: matches!(gfx_level, GfxLevel::Gfx6),
            max_viewports: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_both_spellings() {
        assert_eq!("GFX9".parse::<GfxLevel>(), Ok(GfxLevel::Gfx9));
        assert_eq!("gfx10_3".parse::<GfxLevel>(), Ok(GfxLevel::Gfx10_3));
        assert_eq!("gfx10.3".parse::<GfxLevel>(), Ok(GfxLevel::Gfx10_3));
        assert!("gfx11".parse::<GfxLevel>().is_err());
    }

    #[test]
    fn workaround_table() {
        let gfx6 = ChipCaps::for_level(GfxLevel::Gfx6);
        assert_eq!(gfx6.cache_flush_style, CacheFlushStyle::SurfaceSync);
        assert!(gfx6.end_of_ib_full_flush);
        assert!(!gfx6.supports_ib_chaining);
        assert!(!gfx6.cp_dma_prefetch);

        for level in [GfxLevel::Gfx7, GfxLevel::Gfx8] {
            let caps = ChipCaps::for_level(level);
            assert!(caps.draw_auto_clobbers_index_type);
            assert!(!caps.index_type_in_uconfig);
        }

        let gfx9 = ChipCaps::for_level(GfxLevel::Gfx9);
        assert!(gfx9.has_gfx9_scissor_bug);
        assert!(gfx9.cb_db_l2_coherent);
        assert_eq!(gfx9.scalar_cache_line_bytes, 32);

        let gfx103 = ChipCaps::for_level(GfxLevel::Gfx10_3);
        assert_eq!(gfx103.cache_flush_style, CacheFlushStyle::Gcr);
        assert_eq!(gfx103.scalar_cache_line_bytes, 64);
        assert!(gfx103.has_vrs);
        assert!(!gfx103.has_gfx9_scissor_bug);
    }
}
