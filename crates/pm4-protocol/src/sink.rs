use crate::packet::{event_type, pkt3, Opcode};
use crate::regs::{RegSpace, REG_INDEX_SHIFT};

/// Destination for raw command-stream dwords.
///
/// Implementors decide where the words land (a `Vec`, a mapped buffer object, ...). Callers
/// that need a packet to stay contiguous must reserve space through the implementor first.
pub trait DwordSink {
    fn emit(&mut self, dw: u32);

    fn emit_slice(&mut self, dws: &[u32]) {
        for &dw in dws {
            self.emit(dw);
        }
    }
}

impl DwordSink for Vec<u32> {
    fn emit(&mut self, dw: u32) {
        self.push(dw);
    }

    fn emit_slice(&mut self, dws: &[u32]) {
        self.extend_from_slice(dws);
    }
}

/// Packet-level helpers available on every [`DwordSink`].
///
/// The `*_seq` helpers write the header and register offset only; the caller follows
/// with exactly `count` value dwords.
pub trait Pm4Emit: DwordSink {
    fn emit_pkt3(&mut self, opcode: Opcode, body: &[u32]) {
        self.emit(pkt3(opcode, body.len() as u32, false));
        self.emit_slice(body);
    }

    fn set_reg_seq(&mut self, space: RegSpace, reg: u32, count: u32) {
        self.set_reg_seq_idx(space, reg, 0, count);
    }

    fn set_reg_seq_idx(&mut self, space: RegSpace, reg: u32, idx: u32, count: u32) {
        assert!(count > 0, "empty register sequence at {reg:#x}");
        assert!(
            space.contains(reg) && reg + count * 4 <= space.end(),
            "register range {reg:#x}+{count} outside {space:?} space"
        );
        assert!(idx < 16);
        self.emit(pkt3(space.opcode(), count + 1, false));
        self.emit(((reg - space.base()) >> 2) | (idx << REG_INDEX_SHIFT));
    }

    fn set_config_reg_seq(&mut self, reg: u32, count: u32) {
        self.set_reg_seq(RegSpace::Config, reg, count);
    }

    fn set_config_reg(&mut self, reg: u32, value: u32) {
        self.set_config_reg_seq(reg, 1);
        self.emit(value);
    }

    fn set_context_reg_seq(&mut self, reg: u32, count: u32) {
        self.set_reg_seq(RegSpace::Context, reg, count);
    }

    fn set_context_reg(&mut self, reg: u32, value: u32) {
        self.set_context_reg_seq(reg, 1);
        self.emit(value);
    }

    fn set_sh_reg_seq(&mut self, reg: u32, count: u32) {
        self.set_reg_seq(RegSpace::Sh, reg, count);
    }

    fn set_sh_reg(&mut self, reg: u32, value: u32) {
        self.set_sh_reg_seq(reg, 1);
        self.emit(value);
    }

    fn set_uconfig_reg_seq(&mut self, reg: u32, count: u32) {
        self.set_reg_seq(RegSpace::Uconfig, reg, count);
    }

    fn set_uconfig_reg(&mut self, reg: u32, value: u32) {
        self.set_uconfig_reg_seq(reg, 1);
        self.emit(value);
    }

    /// GFX9+ indexed uconfig write (the index selects a shadowed copy of the register).
    fn set_uconfig_reg_idx(&mut self, reg: u32, idx: u32, value: u32) {
        self.set_reg_seq_idx(RegSpace::Uconfig, reg, idx, 1);
        self.emit(value);
    }

    fn emit_event(&mut self, event: u32, index: u32) {
        self.emit_pkt3(Opcode::EventWrite, &[event_type(event, index)]);
    }
}

impl<T: DwordSink + ?Sized> Pm4Emit for T {}
