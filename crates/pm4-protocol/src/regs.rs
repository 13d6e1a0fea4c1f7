//! Register spaces and the register addresses the recorder writes.
//!
//! Addresses are byte addresses. Each `SET_*_REG` packet encodes the first register as a
//! dword offset from the start of its space.

use crate::packet::Opcode;

pub const CONFIG_REG_OFFSET: u32 = 0x0000_8000;
pub const CONFIG_REG_END: u32 = 0x0000_B000;
pub const SH_REG_OFFSET: u32 = 0x0000_B000;
pub const SH_REG_END: u32 = 0x0000_C000;
pub const CONTEXT_REG_OFFSET: u32 = 0x0002_8000;
pub const CONTEXT_REG_END: u32 = 0x0002_9000;
pub const UCONFIG_REG_OFFSET: u32 = 0x0003_0000;
pub const UCONFIG_REG_END: u32 = 0x0003_4000;

/// Register index field inside the first body dword of a `SET_*_REG` packet.
pub const REG_OFFSET_MASK: u32 = 0xFFFF;
pub const REG_INDEX_SHIFT: u32 = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegSpace {
    Config,
    Sh,
    Context,
    Uconfig,
}

impl RegSpace {
    pub const ALL: [RegSpace; 4] = [
        RegSpace::Config,
        RegSpace::Sh,
        RegSpace::Context,
        RegSpace::Uconfig,
    ];

    /// Returns the space containing `reg`, if any.
    pub fn of(reg: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|space| space.contains(reg))
    }

    pub const fn base(self) -> u32 {
        match self {
            Self::Config => CONFIG_REG_OFFSET,
            Self::Sh => SH_REG_OFFSET,
            Self::Context => CONTEXT_REG_OFFSET,
            Self::Uconfig => UCONFIG_REG_OFFSET,
        }
    }

    pub const fn end(self) -> u32 {
        match self {
            Self::Config => CONFIG_REG_END,
            Self::Sh => SH_REG_END,
            Self::Context => CONTEXT_REG_END,
            Self::Uconfig => UCONFIG_REG_END,
        }
    }

    pub const fn contains(self, reg: u32) -> bool {
        reg >= self.base() && reg < self.end()
    }

    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Config => Opcode::SetConfigReg,
            Self::Sh => Opcode::SetShReg,
            Self::Context => Opcode::SetContextReg,
            Self::Uconfig => Opcode::SetUconfigReg,
        }
    }

    pub const fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::SetConfigReg => Some(Self::Config),
            Opcode::SetShReg => Some(Self::Sh),
            Opcode::SetContextReg => Some(Self::Context),
            Opcode::SetUconfigReg => Some(Self::Uconfig),
            _ => None,
        }
    }
}

/* ------------------------------- context --------------------------------- */

pub const DB_DEPTH_BOUNDS_MIN: u32 = 0x0002_8020;
pub const DB_DEPTH_BOUNDS_MAX: u32 = 0x0002_8024;
pub const DB_Z_INFO: u32 = 0x0002_8040;
pub const DB_STENCIL_INFO: u32 = 0x0002_8044;
pub const DB_Z_READ_BASE: u32 = 0x0002_8048;
pub const DB_STENCIL_READ_BASE: u32 = 0x0002_804C;
pub const DB_Z_WRITE_BASE: u32 = 0x0002_8050;
pub const DB_STENCIL_WRITE_BASE: u32 = 0x0002_8054;
pub const PA_SC_CLIPRECT_RULE: u32 = 0x0002_820C;
pub const PA_SC_CLIPRECT_0_TL: u32 = 0x0002_8210;
pub const PA_SC_WINDOW_SCISSOR_TL: u32 = 0x0002_8204;
pub const PA_SC_WINDOW_SCISSOR_BR: u32 = 0x0002_8208;
pub const CB_TARGET_MASK: u32 = 0x0002_8238;
pub const PA_SC_VPORT_SCISSOR_0_TL: u32 = 0x0002_8250;
pub const PA_SC_VPORT_ZMIN_0: u32 = 0x0002_82D0;
pub const VGT_MULTI_PRIM_IB_RESET_INDX: u32 = 0x0002_840C;
pub const CB_BLEND_RED: u32 = 0x0002_8414;
pub const DB_STENCIL_CONTROL: u32 = 0x0002_842C;
pub const DB_STENCILREFMASK: u32 = 0x0002_8430;
pub const DB_STENCILREFMASK_BF: u32 = 0x0002_8434;
pub const PA_CL_VPORT_XSCALE: u32 = 0x0002_843C;
pub const DB_DEPTH_CONTROL: u32 = 0x0002_8800;
pub const CB_COLOR_CONTROL: u32 = 0x0002_8808;
pub const PA_CL_CLIP_CNTL: u32 = 0x0002_8810;
pub const PA_SU_SC_MODE_CNTL: u32 = 0x0002_8814;
pub const PA_CL_VRS_CNTL: u32 = 0x0002_8848;
pub const PA_SU_LINE_CNTL: u32 = 0x0002_8A08;
pub const PA_SC_LINE_STIPPLE: u32 = 0x0002_8A0C;
pub const VGT_MULTI_PRIM_IB_RESET_EN: u32 = 0x0002_8A94;
pub const VGT_LS_HS_CONFIG: u32 = 0x0002_8B58;
pub const PA_SU_POLY_OFFSET_CLAMP: u32 = 0x0002_8B7C;
pub const PA_SC_CENTROID_PRIORITY_0: u32 = 0x0002_8BD4;
pub const PA_CL_GB_VERT_CLIP_ADJ: u32 = 0x0002_8BE8;
pub const PA_SC_AA_SAMPLE_LOCS_PIXEL_X0Y0_0: u32 = 0x0002_8BF8;
pub const CB_COLOR0_BASE: u32 = 0x0002_8C60;
pub const CB_COLOR0_PITCH: u32 = 0x0002_8C64;
/// Distance between consecutive color-target register blocks.
pub const CB_COLOR_STRIDE: u32 = 0x3C;

/* --------------------------------- SH ------------------------------------ */

pub const SPI_SHADER_PGM_LO_PS: u32 = 0x0000_B020;
pub const SPI_SHADER_USER_DATA_PS_0: u32 = 0x0000_B030;
pub const SPI_SHADER_PGM_LO_VS: u32 = 0x0000_B120;
pub const SPI_SHADER_USER_DATA_VS_0: u32 = 0x0000_B130;
pub const SPI_SHADER_USER_DATA_GS_0: u32 = 0x0000_B230;
pub const SPI_SHADER_USER_DATA_ES_0: u32 = 0x0000_B330;
pub const SPI_SHADER_USER_DATA_HS_0: u32 = 0x0000_B430;
pub const SPI_SHADER_PGM_LO_LS: u32 = 0x0000_B520;
pub const SPI_SHADER_USER_DATA_LS_0: u32 = 0x0000_B530;
pub const COMPUTE_START_X: u32 = 0x0000_B810;
pub const COMPUTE_PGM_LO: u32 = 0x0000_B830;
pub const COMPUTE_USER_DATA_0: u32 = 0x0000_B900;

/* ------------------------------- uconfig --------------------------------- */

pub const VGT_PRIMITIVE_TYPE_UCONFIG: u32 = 0x0003_0908;
pub const VGT_INDEX_TYPE_UCONFIG: u32 = 0x0003_090C;
pub const VGT_MULTI_PRIM_IB_RESET_EN_UCONFIG: u32 = 0x0003_092C;
pub const GE_VRS_RATE: u32 = 0x0003_098C;

/* -------------------------------- config --------------------------------- */

pub const VGT_PRIMITIVE_TYPE_CONFIG: u32 = 0x0000_8958;

/* ----------------------------- field helpers ----------------------------- */

pub const PA_SU_SC_MODE_CNTL_CULL_FRONT: u32 = 1 << 0;
pub const PA_SU_SC_MODE_CNTL_CULL_BACK: u32 = 1 << 1;
pub const PA_SU_SC_MODE_CNTL_FACE_CW: u32 = 1 << 2;
pub const PA_SU_SC_MODE_CNTL_POLY_OFFSET_FRONT_ENABLE: u32 = 1 << 11;
pub const PA_SU_SC_MODE_CNTL_POLY_OFFSET_BACK_ENABLE: u32 = 1 << 12;
pub const PA_SU_SC_MODE_CNTL_POLY_OFFSET_PARA_ENABLE: u32 = 1 << 13;
pub const PA_SU_SC_MODE_CNTL_DYNAMIC_MASK: u32 = PA_SU_SC_MODE_CNTL_CULL_FRONT
    | PA_SU_SC_MODE_CNTL_CULL_BACK
    | PA_SU_SC_MODE_CNTL_FACE_CW
    | PA_SU_SC_MODE_CNTL_POLY_OFFSET_FRONT_ENABLE
    | PA_SU_SC_MODE_CNTL_POLY_OFFSET_BACK_ENABLE
    | PA_SU_SC_MODE_CNTL_POLY_OFFSET_PARA_ENABLE;

pub const DB_Z_INFO_FORMAT_Z32_FLOAT: u32 = 3;

pub const DB_DEPTH_CONTROL_STENCIL_ENABLE: u32 = 1 << 0;
pub const DB_DEPTH_CONTROL_Z_ENABLE: u32 = 1 << 1;
pub const DB_DEPTH_CONTROL_Z_WRITE_ENABLE: u32 = 1 << 2;
pub const DB_DEPTH_CONTROL_DEPTH_BOUNDS_ENABLE: u32 = 1 << 3;
pub const DB_DEPTH_CONTROL_ZFUNC_SHIFT: u32 = 4;
pub const DB_DEPTH_CONTROL_ZFUNC_MASK: u32 = 0x7 << DB_DEPTH_CONTROL_ZFUNC_SHIFT;
pub const DB_DEPTH_CONTROL_BACKFACE_ENABLE: u32 = 1 << 7;
pub const DB_DEPTH_CONTROL_STENCILFUNC_SHIFT: u32 = 8;
pub const DB_DEPTH_CONTROL_STENCILFUNC_BF_SHIFT: u32 = 20;
pub const DB_DEPTH_CONTROL_DYNAMIC_MASK: u32 = DB_DEPTH_CONTROL_STENCIL_ENABLE
    | DB_DEPTH_CONTROL_Z_ENABLE
    | DB_DEPTH_CONTROL_Z_WRITE_ENABLE
    | DB_DEPTH_CONTROL_DEPTH_BOUNDS_ENABLE
    | DB_DEPTH_CONTROL_ZFUNC_MASK
    | DB_DEPTH_CONTROL_BACKFACE_ENABLE
    | (0x7 << DB_DEPTH_CONTROL_STENCILFUNC_SHIFT)
    | (0x7 << DB_DEPTH_CONTROL_STENCILFUNC_BF_SHIFT);

pub const VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_SHIFT: u32 = 8;
pub const VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_MASK: u32 = 0x3F << VGT_LS_HS_CONFIG_HS_NUM_INPUT_CP_SHIFT;

pub const DB_STENCILREFMASK_STENCILOPVAL: u32 = 1 << 24;

pub const PA_CL_CLIP_CNTL_DX_RASTERIZATION_KILL: u32 = 1 << 22;

pub const CB_COLOR_CONTROL_ROP3_SHIFT: u32 = 16;
pub const CB_COLOR_CONTROL_ROP3_MASK: u32 = 0xFF << CB_COLOR_CONTROL_ROP3_SHIFT;

pub const PA_SC_VPORT_SCISSOR_WINDOW_OFFSET_DISABLE: u32 = 1 << 31;

/// Packs a scissor corner into the `TL`/`BR` layout (15-bit x, 15-bit y).
pub const fn scissor_xy(x: u32, y: u32) -> u32 {
    (x & 0x7FFF) | ((y & 0x7FFF) << 16)
}

/// User-data SGPR register for `sgpr` relative to a stage's `USER_DATA_0`.
pub const fn user_data_reg(base: u32, sgpr: u8) -> u32 {
    base + (sgpr as u32) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_do_not_overlap() {
        for (i, a) in RegSpace::ALL.iter().enumerate() {
            for b in &RegSpace::ALL[i + 1..] {
                assert!(a.end() <= b.base() || b.end() <= a.base(), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn registers_classify_into_their_space() {
        assert_eq!(RegSpace::of(PA_CL_VPORT_XSCALE), Some(RegSpace::Context));
        assert_eq!(RegSpace::of(SPI_SHADER_USER_DATA_VS_0), Some(RegSpace::Sh));
        assert_eq!(RegSpace::of(VGT_INDEX_TYPE_UCONFIG), Some(RegSpace::Uconfig));
        assert_eq!(RegSpace::of(VGT_PRIMITIVE_TYPE_CONFIG), Some(RegSpace::Config));
        assert_eq!(RegSpace::of(0x100), None);
    }
}
