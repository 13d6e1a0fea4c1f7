//! Packet headers and opcodes.
//!
//! Headers are plain structs; the 32-bit wire word is produced and consumed by
//! [`PacketHeader::encode`] / [`PacketHeader::decode`] using explicit shifts and masks.

use crate::decode::DecodeError;

pub const PKT_TYPE_SHIFT: u32 = 30;
pub const PKT_TYPE_MASK: u32 = 0x3;

pub const PKT_COUNT_SHIFT: u32 = 16;
pub const PKT_COUNT_MASK: u32 = 0x3FFF;

pub const PKT3_OPCODE_SHIFT: u32 = 8;
pub const PKT3_OPCODE_MASK: u32 = 0xFF;
pub const PKT3_SHADER_TYPE_SHIFT: u32 = 1;
pub const PKT3_PREDICATE_MASK: u32 = 0x1;

pub const PKT0_BASE_INDEX_MASK: u32 = 0xFFFF;

/// Largest body a single type-3 packet can carry.
pub const PKT3_MAX_BODY_DWORDS: u32 = PKT_COUNT_MASK + 1;

/// Type-2 filler dword (GFX6 style padding).
pub const PKT2_NOP: u32 = 0x8000_0000;

/// Single-dword type-3 NOP. The command processor treats a NOP with the maximum
/// count field as having no body.
pub const PKT3_NOP_PAD: u32 = 0xFFFF_1000;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Type0 = 0,
    Type2 = 2,
    Type3 = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShaderType {
    #[default]
    Graphics = 0,
    Compute = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    SetBase,
    ClearState,
    IndexBufferSize,
    DispatchDirect,
    DispatchIndirect,
    SetPredication,
    CondExec,
    DrawIndirect,
    DrawIndexIndirect,
    IndexBase,
    DrawIndex2,
    ContextControl,
    IndexType,
    DrawIndirectMulti,
    DrawIndexAuto,
    NumInstances,
    DrawIndexMultiAuto,
    StrmoutBufferUpdate,
    DrawIndexOffset2,
    WriteData,
    DrawIndexIndirectMulti,
    WaitRegMem,
    IndirectBuffer,
    CopyData,
    PfpSyncMe,
    SurfaceSync,
    EventWrite,
    EventWriteEop,
    ReleaseMem,
    DmaData,
    AcquireMem,
    SetConfigReg,
    SetContextReg,
    SetShReg,
    SetShRegOffset,
    SetUconfigReg,
    Unknown(u8),
}

impl Opcode {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Nop => 0x10,
            Self::SetBase => 0x11,
            Self::ClearState => 0x12,
            Self::IndexBufferSize => 0x13,
            Self::DispatchDirect => 0x15,
            Self::DispatchIndirect => 0x16,
            Self::SetPredication => 0x20,
            Self::CondExec => 0x22,
            Self::DrawIndirect => 0x24,
            Self::DrawIndexIndirect => 0x25,
            Self::IndexBase => 0x26,
            Self::DrawIndex2 => 0x27,
            Self::ContextControl => 0x28,
            Self::IndexType => 0x2A,
            Self::DrawIndirectMulti => 0x2C,
            Self::DrawIndexAuto => 0x2D,
            Self::NumInstances => 0x2F,
            Self::DrawIndexMultiAuto => 0x30,
            Self::StrmoutBufferUpdate => 0x34,
            Self::DrawIndexOffset2 => 0x35,
            Self::WriteData => 0x37,
            Self::DrawIndexIndirectMulti => 0x38,
            Self::WaitRegMem => 0x3C,
            Self::IndirectBuffer => 0x3F,
            Self::CopyData => 0x40,
            Self::PfpSyncMe => 0x42,
            Self::SurfaceSync => 0x43,
            Self::EventWrite => 0x46,
            Self::EventWriteEop => 0x47,
            Self::ReleaseMem => 0x49,
            Self::DmaData => 0x50,
            Self::AcquireMem => 0x58,
            Self::SetConfigReg => 0x68,
            Self::SetContextReg => 0x69,
            Self::SetShReg => 0x76,
            Self::SetShRegOffset => 0x77,
            Self::SetUconfigReg => 0x79,
            Self::Unknown(v) => v,
        }
    }

    pub const fn from_u8(v: u8) -> Self {
        match v {
            0x10 => Self::Nop,
            0x11 => Self::SetBase,
            0x12 => Self::ClearState,
            0x13 => Self::IndexBufferSize,
            0x15 => Self::DispatchDirect,
            0x16 => Self::DispatchIndirect,
            0x20 => Self::SetPredication,
            0x22 => Self::CondExec,
            0x24 => Self::DrawIndirect,
            0x25 => Self::DrawIndexIndirect,
            0x26 => Self::IndexBase,
            0x27 => Self::DrawIndex2,
            0x28 => Self::ContextControl,
            0x2A => Self::IndexType,
            0x2C => Self::DrawIndirectMulti,
            0x2D => Self::DrawIndexAuto,
            0x2F => Self::NumInstances,
            0x30 => Self::DrawIndexMultiAuto,
            0x34 => Self::StrmoutBufferUpdate,
            0x35 => Self::DrawIndexOffset2,
            0x37 => Self::WriteData,
            0x38 => Self::DrawIndexIndirectMulti,
            0x3C => Self::WaitRegMem,
            0x3F => Self::IndirectBuffer,
            0x40 => Self::CopyData,
            0x42 => Self::PfpSyncMe,
            0x43 => Self::SurfaceSync,
            0x46 => Self::EventWrite,
            0x47 => Self::EventWriteEop,
            0x49 => Self::ReleaseMem,
            0x50 => Self::DmaData,
            0x58 => Self::AcquireMem,
            0x68 => Self::SetConfigReg,
            0x69 => Self::SetContextReg,
            0x76 => Self::SetShReg,
            0x77 => Self::SetShRegOffset,
            0x79 => Self::SetUconfigReg,
            other => Self::Unknown(other),
        }
    }

    /// True for the opcodes that launch work (draws and dispatches).
    pub const fn is_draw_or_dispatch(self) -> bool {
        matches!(
            self,
            Self::DrawIndirect
                | Self::DrawIndexIndirect
                | Self::DrawIndex2
                | Self::DrawIndirectMulti
                | Self::DrawIndexAuto
                | Self::DrawIndexMultiAuto
                | Self::DrawIndexOffset2
                | Self::DrawIndexIndirectMulti
                | Self::DispatchDirect
                | Self::DispatchIndirect
        )
    }
}

/// Type-3 packet header.
///
/// `body_dwords` is the number of dwords following the header. The wire `count`
/// field stores `body_dwords - 1`; a body-less NOP is encoded with the maximum count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Pkt3Header {
    pub opcode: Opcode,
    pub body_dwords: u32,
    pub shader_type: ShaderType,
    pub predicate: bool,
}

impl Pkt3Header {
    pub const fn new(opcode: Opcode, body_dwords: u32) -> Self {
        Self {
            opcode,
            body_dwords,
            shader_type: ShaderType::Graphics,
            predicate: false,
        }
    }

    pub const fn compute(mut self) -> Self {
        self.shader_type = ShaderType::Compute;
        self
    }

    pub const fn predicated(mut self, predicate: bool) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn encode(self) -> u32 {
        let count = if self.body_dwords == 0 {
            assert!(
                matches!(self.opcode, Opcode::Nop),
                "only NOP packets may have an empty body"
            );
            PKT_COUNT_MASK
        } else {
            assert!(
                self.body_dwords <= PKT3_MAX_BODY_DWORDS,
                "PKT3 body too large: {} dwords",
                self.body_dwords
            );
            self.body_dwords - 1
        };
        ((PacketType::Type3 as u32) << PKT_TYPE_SHIFT)
            | ((count & PKT_COUNT_MASK) << PKT_COUNT_SHIFT)
            | ((u32::from(self.opcode.to_u8()) & PKT3_OPCODE_MASK) << PKT3_OPCODE_SHIFT)
            | ((self.shader_type as u32) << PKT3_SHADER_TYPE_SHIFT)
            | (self.predicate as u32 & PKT3_PREDICATE_MASK)
    }

    fn from_word(word: u32) -> Self {
        let count = (word >> PKT_COUNT_SHIFT) & PKT_COUNT_MASK;
        let opcode = Opcode::from_u8(((word >> PKT3_OPCODE_SHIFT) & PKT3_OPCODE_MASK) as u8);
        let body_dwords = if count == PKT_COUNT_MASK && opcode == Opcode::Nop {
            0
        } else {
            count + 1
        };
        let shader_type = if (word >> PKT3_SHADER_TYPE_SHIFT) & 1 != 0 {
            ShaderType::Compute
        } else {
            ShaderType::Graphics
        };
        Self {
            opcode,
            body_dwords,
            shader_type,
            predicate: word & PKT3_PREDICATE_MASK != 0,
        }
    }
}

/// Any packet header understood by the walker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketHeader {
    /// Direct register write: `count` consecutive registers starting at `base_index` (dword index).
    Type0 { base_index: u16, count: u32 },
    /// Single-dword filler.
    Type2,
    Type3(Pkt3Header),
}

impl PacketHeader {
    pub fn encode(self) -> u32 {
        match self {
            Self::Type0 { base_index, count } => {
                assert!(count >= 1 && count <= PKT3_MAX_BODY_DWORDS);
                ((PacketType::Type0 as u32) << PKT_TYPE_SHIFT)
                    | (((count - 1) & PKT_COUNT_MASK) << PKT_COUNT_SHIFT)
                    | u32::from(base_index)
            }
            Self::Type2 => PKT2_NOP,
            Self::Type3(h) => h.encode(),
        }
    }

    pub fn decode(word: u32) -> Result<Self, DecodeError> {
        match (word >> PKT_TYPE_SHIFT) & PKT_TYPE_MASK {
            0 => Ok(Self::Type0 {
                base_index: (word & PKT0_BASE_INDEX_MASK) as u16,
                count: ((word >> PKT_COUNT_SHIFT) & PKT_COUNT_MASK) + 1,
            }),
            2 => Ok(Self::Type2),
            3 => Ok(Self::Type3(Pkt3Header::from_word(word))),
            other => Err(DecodeError::ReservedPacketType { word, packet_type: other }),
        }
    }

    /// Number of dwords after the header.
    pub fn body_dwords(self) -> u32 {
        match self {
            Self::Type0 { count, .. } => count,
            Self::Type2 => 0,
            Self::Type3(h) => h.body_dwords,
        }
    }
}

/// Encodes a graphics type-3 header.
pub fn pkt3(opcode: Opcode, body_dwords: u32, predicate: bool) -> u32 {
    Pkt3Header::new(opcode, body_dwords)
        .predicated(predicate)
        .encode()
}

/// Encodes a type-0 header writing `count` registers starting at byte address `reg`.
pub fn pkt0(reg: u32, count: u32) -> u32 {
    PacketHeader::Type0 {
        base_index: (reg >> 2) as u16,
        count,
    }
    .encode()
}

/* ---------------------------- INDIRECT_BUFFER ---------------------------- */

pub const IB_SIZE_MASK: u32 = 0xFFFFF;
pub const IB_CHAIN: u32 = 1 << 20;
pub const IB_VALID: u32 = 1 << 23;
/// Dwords taken by an `INDIRECT_BUFFER` packet (header included).
pub const IB_PACKET_DWORDS: usize = 4;

/* -------------------------------- draws ---------------------------------- */

pub const DI_SRC_SEL_DMA: u32 = 0;
pub const DI_SRC_SEL_AUTO_INDEX: u32 = 2;

pub const DRAW_INDEX_ENABLE: u32 = 1 << 31;
pub const COUNT_INDIRECT_ENABLE: u32 = 1 << 30;

pub const INDEX_TYPE_16: u32 = 0;
pub const INDEX_TYPE_32: u32 = 1;
pub const INDEX_TYPE_8: u32 = 2;

/// `SET_BASE` index selecting the draw/dispatch indirect argument base.
pub const BASE_INDEX_DRAW_INDIRECT: u32 = 1;

pub const DISPATCH_COMPUTE_SHADER_EN: u32 = 1 << 0;
pub const DISPATCH_FORCE_START_AT_000: u32 = 1 << 2;
pub const DISPATCH_ORDER_MODE: u32 = 1 << 3;

/* -------------------------------- events --------------------------------- */

pub const EVENT_TYPE_MASK: u32 = 0x3F;
pub const EVENT_INDEX_SHIFT: u32 = 8;

pub const EVENT_CS_PARTIAL_FLUSH: u32 = 0x07;
pub const EVENT_VS_PARTIAL_FLUSH: u32 = 0x0F;
pub const EVENT_PS_PARTIAL_FLUSH: u32 = 0x10;
pub const EVENT_CACHE_FLUSH_AND_INV: u32 = 0x16;
pub const EVENT_PIPELINESTAT_START: u32 = 0x19;
pub const EVENT_PIPELINESTAT_STOP: u32 = 0x1A;
pub const EVENT_VGT_STREAMOUT_SYNC: u32 = 0x1C;
pub const EVENT_VGT_FLUSH: u32 = 0x24;
pub const EVENT_FLUSH_AND_INV_DB_META: u32 = 0x2C;
pub const EVENT_FLUSH_AND_INV_CB_META: u32 = 0x2E;
pub const EVENT_BOTTOM_OF_PIPE_TS: u32 = 0x28;

/// Event index of end-of-pipe events (`EVENT_WRITE_EOP`, `RELEASE_MEM`).
pub const EOP_EVENT_INDEX: u32 = 5;
/// Data select of end-of-pipe writes: store the low 32 bits of the data field.
pub const EOP_DATA_SEL_VALUE_32BIT: u32 = 1 << 29;

pub const fn event_type(event: u32, index: u32) -> u32 {
    (event & EVENT_TYPE_MASK) | (index << EVENT_INDEX_SHIFT)
}

/* ----------------------------- cache control ----------------------------- */

// CP_COHER_CNTL (SURFACE_SYNC / ACQUIRE_MEM before GFX10).
pub const COHER_TC_WB_ACTION_ENA: u32 = 1 << 18;
pub const COHER_TCL1_ACTION_ENA: u32 = 1 << 22;
pub const COHER_TC_ACTION_ENA: u32 = 1 << 23;
pub const COHER_CB_ACTION_ENA: u32 = 1 << 25;
pub const COHER_DB_ACTION_ENA: u32 = 1 << 26;
pub const COHER_SH_KCACHE_ACTION_ENA: u32 = 1 << 27;
pub const COHER_SH_ICACHE_ACTION_ENA: u32 = 1 << 29;
pub const COHER_CB_META_ACTION_ENA: u32 = 1 << 30;

// GCR_CNTL (ACQUIRE_MEM on GFX10+).
pub const GCR_GLI_INV: u32 = 1 << 0;
pub const GCR_GLM_WB: u32 = 1 << 4;
pub const GCR_GLM_INV: u32 = 1 << 5;
pub const GCR_GLK_INV: u32 = 1 << 7;
pub const GCR_GLV_INV: u32 = 1 << 8;
pub const GCR_GL1_INV: u32 = 1 << 9;
pub const GCR_GL2_INV: u32 = 1 << 14;
pub const GCR_GL2_WB: u32 = 1 << 15;

pub const COHER_SIZE_ALL: u32 = 0xFFFF_FFFF;
pub const COHER_POLL_INTERVAL: u32 = 0x0A;

/* ------------------------------ memory ops ------------------------------- */

pub const WAIT_REG_MEM_EQUAL: u32 = 3;
pub const WAIT_REG_MEM_MEM_SPACE: u32 = 1 << 4;

pub const WRITE_DATA_DST_SEL_MEM: u32 = 5 << 8;
pub const WRITE_DATA_WR_CONFIRM: u32 = 1 << 20;
pub const WRITE_DATA_ENGINE_ME: u32 = 0 << 30;

pub const COPY_DATA_SRC_SEL_MEM: u32 = 1;
pub const COPY_DATA_DST_SEL_REG: u32 = 0 << 8;
pub const COPY_DATA_WR_CONFIRM: u32 = 1 << 20;

pub const DMA_DATA_DST_SEL_NOWHERE: u32 = 2 << 20;
pub const DMA_DATA_SRC_SEL_ADDR_TC_L2: u32 = 3 << 29;
pub const DMA_DATA_CP_SYNC: u32 = 1 << 31;
pub const DMA_DATA_BYTE_COUNT_MASK: u32 = 0x1F_FFFF;

/// Trace point marker written into the body of a NOP.
pub const TRACE_POINT_MARKER: u32 = 0xCAFE_0000;

/* CONTEXT_CONTROL */
pub const CONTEXT_CONTROL_LOAD_ENABLE: u32 = 1 << 31;
pub const CONTEXT_CONTROL_SHADOW_ENABLE: u32 = 1 << 31;
