//! Flat instruction streams.
//!
//! Each instruction is a 1-byte opcode followed by a fixed number of
//! little-endian operand bytes (0, 2, 4, or 8). Branch instructions carry a
//! signed 16-bit offset relative to the position immediately after the
//! offset field.
//!
//! Operand order is fixed: binary instructions pop `b`, then `a` (`a` was
//! pushed first) and produce `a OP b`. `Icmp`/`Dcmp` push the sign of
//! `a - b` as -1/0/1; `IfIcmp*` branches when `a CMP b` holds.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Invalid = 0,
    /// Push an inline i64.
    Iload,
    /// Push an inline f64 (bit pattern).
    Dload,
    /// Push a string by constant-pool id.
    Sload,
    Iadd,
    Isub,
    Imul,
    Idiv,
    Imod,
    Ineg,
    Dadd,
    Dsub,
    Dmul,
    Ddiv,
    Dneg,
    I2d,
    /// Truncating double-to-int conversion.
    D2i,
    /// String truthiness: pop a string, push 1 if non-empty, else 0.
    S2i,
    Swap,
    Pop,
    LoadIVar,
    LoadDVar,
    LoadSVar,
    StoreIVar,
    StoreDVar,
    StoreSVar,
    LoadCtxIVar,
    LoadCtxDVar,
    LoadCtxSVar,
    StoreCtxIVar,
    StoreCtxDVar,
    StoreCtxSVar,
    Icmp,
    Dcmp,
    Ja,
    IfIcmpE,
    IfIcmpNe,
    IfIcmpG,
    IfIcmpGe,
    IfIcmpL,
    IfIcmpLe,
    PrintI,
    PrintD,
    PrintS,
    Call,
    CallNative,
    Return,
    Stop,
}

impl Op {
    /// Operand bytes following the opcode.
    pub fn operand_width(self) -> usize {
        match self {
            Op::Iload | Op::Dload => 8,
            Op::LoadCtxIVar
            | Op::LoadCtxDVar
            | Op::LoadCtxSVar
            | Op::StoreCtxIVar
            | Op::StoreCtxDVar
            | Op::StoreCtxSVar => 4,
            Op::Sload
            | Op::LoadIVar
            | Op::LoadDVar
            | Op::LoadSVar
            | Op::StoreIVar
            | Op::StoreDVar
            | Op::StoreSVar
            | Op::Ja
            | Op::IfIcmpE
            | Op::IfIcmpNe
            | Op::IfIcmpG
            | Op::IfIcmpGe
            | Op::IfIcmpL
            | Op::IfIcmpLe
            | Op::Call
            | Op::CallNative => 2,
            _ => 0,
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Ja
                | Op::IfIcmpE
                | Op::IfIcmpNe
                | Op::IfIcmpG
                | Op::IfIcmpGe
                | Op::IfIcmpL
                | Op::IfIcmpLe
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Invalid => "invalid",
            Op::Iload => "iload",
            Op::Dload => "dload",
            Op::Sload => "sload",
            Op::Iadd => "iadd",
            Op::Isub => "isub",
            Op::Imul => "imul",
            Op::Idiv => "idiv",
            Op::Imod => "imod",
            Op::Ineg => "ineg",
            Op::Dadd => "dadd",
            Op::Dsub => "dsub",
            Op::Dmul => "dmul",
            Op::Ddiv => "ddiv",
            Op::Dneg => "dneg",
            Op::I2d => "i2d",
            Op::D2i => "d2i",
            Op::S2i => "s2i",
            Op::Swap => "swap",
            Op::Pop => "pop",
            Op::LoadIVar => "loadivar",
            Op::LoadDVar => "loaddvar",
            Op::LoadSVar => "loadsvar",
            Op::StoreIVar => "storeivar",
            Op::StoreDVar => "storedvar",
            Op::StoreSVar => "storesvar",
            Op::LoadCtxIVar => "loadctxivar",
            Op::LoadCtxDVar => "loadctxdvar",
            Op::LoadCtxSVar => "loadctxsvar",
            Op::StoreCtxIVar => "storectxivar",
            Op::StoreCtxDVar => "storectxdvar",
            Op::StoreCtxSVar => "storectxsvar",
            Op::Icmp => "icmp",
            Op::Dcmp => "dcmp",
            Op::Ja => "ja",
            Op::IfIcmpE => "ificmpe",
            Op::IfIcmpNe => "ificmpne",
            Op::IfIcmpG => "ificmpg",
            Op::IfIcmpGe => "ificmpge",
            Op::IfIcmpL => "ificmpl",
            Op::IfIcmpLe => "ificmple",
            Op::PrintI => "printi",
            Op::PrintD => "printd",
            Op::PrintS => "prints",
            Op::Call => "call",
            Op::CallNative => "callnative",
            Op::Return => "return",
            Op::Stop => "stop",
        }
    }

    pub fn from_byte(byte: u8) -> Option<Op> {
        const TABLE: &[Op] = &[
            Op::Invalid,
            Op::Iload,
            Op::Dload,
            Op::Sload,
            Op::Iadd,
            Op::Isub,
            Op::Imul,
            Op::Idiv,
            Op::Imod,
            Op::Ineg,
            Op::Dadd,
            Op::Dsub,
            Op::Dmul,
            Op::Ddiv,
            Op::Dneg,
            Op::I2d,
            Op::D2i,
            Op::S2i,
            Op::Swap,
            Op::Pop,
            Op::LoadIVar,
            Op::LoadDVar,
            Op::LoadSVar,
            Op::StoreIVar,
            Op::StoreDVar,
            Op::StoreSVar,
            Op::LoadCtxIVar,
            Op::LoadCtxDVar,
            Op::LoadCtxSVar,
            Op::StoreCtxIVar,
            Op::StoreCtxDVar,
            Op::StoreCtxSVar,
            Op::Icmp,
            Op::Dcmp,
            Op::Ja,
            Op::IfIcmpE,
            Op::IfIcmpNe,
            Op::IfIcmpG,
            Op::IfIcmpGe,
            Op::IfIcmpL,
            Op::IfIcmpLe,
            Op::PrintI,
            Op::PrintD,
            Op::PrintS,
            Op::Call,
            Op::CallNative,
            Op::Return,
            Op::Stop,
        ];
        TABLE.get(byte as usize).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("branch target out of signed 16-bit range (distance {distance})")]
pub struct BranchOutOfRange {
    pub distance: i64,
}

/// A forward or backward jump target. Forward targets record relocation
/// positions and are patched when bound.
#[derive(Debug, Default)]
pub struct Label {
    bci: Option<u32>,
    relocations: Vec<u32>,
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bytecode {
    data: Vec<u8>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn add_op(&mut self, op: Op) {
        self.data.push(op as u8);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_f64(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn op_at(&self, index: u32) -> Option<Op> {
        self.data.get(index as usize).copied().and_then(Op::from_byte)
    }

    pub fn byte_at(&self, index: u32) -> Option<u8> {
        self.data.get(index as usize).copied()
    }

    pub fn u16_at(&self, index: u32) -> Option<u16> {
        let bytes = self.data.get(index as usize..index as usize + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn i16_at(&self, index: u32) -> Option<i16> {
        self.u16_at(index).map(|raw| raw as i16)
    }

    pub fn i64_at(&self, index: u32) -> Option<i64> {
        let bytes = self.data.get(index as usize..index as usize + 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Some(i64::from_le_bytes(raw))
    }

    pub fn f64_at(&self, index: u32) -> Option<f64> {
        self.i64_at(index).map(|bits| f64::from_bits(bits as u64))
    }

    /// Emit a branch towards `label`. If the label is not yet bound, the
    /// offset field is left zeroed and patched by `bind`.
    pub fn add_branch(&mut self, op: Op, label: &mut Label) -> Result<(), BranchOutOfRange> {
        self.add_op(op);
        let reloc = self.len();
        match label.bci {
            Some(target) => {
                let offset = branch_offset(reloc, target)?;
                self.add_i16(offset);
            }
            None => {
                label.relocations.push(reloc);
                self.add_i16(0);
            }
        }
        Ok(())
    }

    /// Bind `label` to the current position, patching pending relocations.
    pub fn bind(&mut self, label: &mut Label) -> Result<(), BranchOutOfRange> {
        let target = self.len();
        label.bci = Some(target);
        for reloc in label.relocations.drain(..) {
            let offset = branch_offset(reloc, target)?;
            let bytes = offset.to_le_bytes();
            self.data[reloc as usize] = bytes[0];
            self.data[reloc as usize + 1] = bytes[1];
        }
        Ok(())
    }
}

fn branch_offset(reloc: u32, target: u32) -> Result<i16, BranchOutOfRange> {
    // Offsets are relative to the position just past the 2-byte field.
    let distance = target as i64 - (reloc as i64 + 2);
    i16::try_from(distance).map_err(|_| BranchOutOfRange { distance })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Op::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Op::from_byte(Op::Stop as u8), Some(Op::Stop));
        assert_eq!(Op::from_byte(200), None);
    }

    #[test]
    fn typed_operands_round_trip() {
        let mut code = Bytecode::new();
        code.add_op(Op::Iload);
        code.add_i64(-42);
        code.add_op(Op::Dload);
        code.add_f64(3.5);
        assert_eq!(code.op_at(0), Some(Op::Iload));
        assert_eq!(code.i64_at(1), Some(-42));
        assert_eq!(code.op_at(9), Some(Op::Dload));
        assert_eq!(code.f64_at(10), Some(3.5));
        assert_eq!(code.i64_at(code.len() - 2), None);
    }

    #[test]
    fn forward_branch_is_patched() {
        let mut code = Bytecode::new();
        let mut label = Label::new();
        code.add_branch(Op::Ja, &mut label).unwrap();
        code.add_op(Op::Pop);
        code.bind(&mut label).unwrap();
        code.add_op(Op::Stop);
        // Offset points just past the Pop: target 4, field ends at 3.
        assert_eq!(code.i16_at(1), Some(1));
    }

    #[test]
    fn backward_branch_is_negative() {
        let mut code = Bytecode::new();
        let mut label = Label::new();
        code.bind(&mut label).unwrap();
        code.add_op(Op::Pop);
        code.add_branch(Op::Ja, &mut label).unwrap();
        // Field occupies [2, 4); target is 0.
        assert_eq!(code.i16_at(2), Some(-4));
    }
}
