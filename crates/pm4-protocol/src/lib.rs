//! PM4 command-processor packet layouts.
//!
//! This crate only knows about the wire format:
//! - packet headers (`PKT0`, `PKT2`, `PKT3`) with explicit shift/mask encoding
//! - opcodes and the register spaces each `SET_*_REG` packet addresses
//! - a [`DwordSink`] abstraction plus [`Pm4Emit`] helpers that write whole packets
//! - a packet walker ([`walk_packets`]) used by diagnostics and tests

pub mod decode;
pub mod packet;
pub mod regs;
pub mod sink;

pub use decode::{register_writes, walk_packets, DecodeError, Packet, PacketIter, RegisterWrite};
pub use packet::{
    pkt0, pkt3, Opcode, PacketHeader, PacketType, Pkt3Header, ShaderType, PKT2_NOP, PKT3_NOP_PAD,
};
pub use regs::RegSpace;
pub use sink::{DwordSink, Pm4Emit};
