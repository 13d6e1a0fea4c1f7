//! Packet walker.

use thiserror::Error;

use crate::packet::{Opcode, PacketHeader};
use crate::regs::{RegSpace, REG_OFFSET_MASK};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reserved packet type {packet_type} in header {word:#010x}")]
    ReservedPacketType { word: u32, packet_type: u32 },
    #[error("packet at dword {offset} needs {needed} body dwords but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Dword offset of the header inside the walked slice.
    pub offset: usize,
    pub header: PacketHeader,
    pub body: &'a [u32],
}

impl<'a> Packet<'a> {
    pub fn opcode(&self) -> Option<Opcode> {
        match self.header {
            PacketHeader::Type3(h) => Some(h.opcode),
            _ => None,
        }
    }

    /// For register-write packets: the register space, first register address and values.
    pub fn register_range(&self) -> Option<(RegSpace, u32, &'a [u32])> {
        match self.header {
            PacketHeader::Type0 { base_index, .. } => {
                let reg = u32::from(base_index) << 2;
                RegSpace::of(reg).map(|space| (space, reg, self.body))
            }
            PacketHeader::Type3(h) => {
                let space = RegSpace::from_opcode(h.opcode)?;
                let (first, values) = self.body.split_first()?;
                Some((space, space.base() + ((first & REG_OFFSET_MASK) << 2), values))
            }
            PacketHeader::Type2 => None,
        }
    }

    pub fn is_padding(&self) -> bool {
        matches!(self.header, PacketHeader::Type2) || self.opcode() == Some(Opcode::Nop)
    }
}

pub struct PacketIter<'a> {
    words: &'a [u32],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<Packet<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.words.len() {
            return None;
        }
        let offset = self.pos;
        let header = match PacketHeader::decode(self.words[offset]) {
            Ok(h) => h,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        };
        let needed = header.body_dwords() as usize;
        let available = self.words.len() - offset - 1;
        if needed > available {
            self.failed = true;
            return Some(Err(DecodeError::Truncated {
                offset,
                needed,
                available,
            }));
        }
        self.pos = offset + 1 + needed;
        Some(Ok(Packet {
            offset,
            header,
            body: &self.words[offset + 1..self.pos],
        }))
    }
}

/// Iterates over the packets in `words`. Iteration stops after the first error.
pub fn walk_packets(words: &[u32]) -> PacketIter<'_> {
    PacketIter {
        words,
        pos: 0,
        failed: false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterWrite {
    pub space: RegSpace,
    pub reg: u32,
    pub value: u32,
}

/// Flattens every register-write packet in `words` into individual register writes.
pub fn register_writes(words: &[u32]) -> Result<Vec<RegisterWrite>, DecodeError> {
    let mut out = Vec::new();
    for packet in walk_packets(words) {
        let packet = packet?;
        if let Some((space, reg, values)) = packet.register_range() {
            out.extend(values.iter().enumerate().map(|(i, &value)| RegisterWrite {
                space,
                reg: reg + (i as u32) * 4,
                value,
            }));
        }
    }
    Ok(out)
}
