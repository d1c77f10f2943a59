use num_enum::{IntoPrimitive, TryFromPrimitive};

// =============================================================================
// OPCODE - one byte per instruction, operands follow inline (little-endian)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Invalid = 0,

    // constant loads
    Dload,   // f64
    Iload,   // i64
    Sload,   // u16 string id
    Dload0,
    Iload0,
    Sload0, // ""
    Dload1,
    Iload1,
    DloadM1,
    IloadM1,

    // arithmetic ( a b -- a op b )
    Dadd,
    Iadd,
    Dsub,
    Isub,
    Dmul,
    Imul,
    Ddiv,
    Idiv,
    Imod,
    Dneg,
    Ineg,

    // bitwise
    Iaor,
    Iaand,
    Iaxor,

    // output
    Iprint,
    Dprint,
    Sprint,

    // conversions
    I2d,
    D2i,
    S2i,

    // stack
    Swap,
    Pop,

    // locals of the current frame, u16 slot
    LoadDvar,
    LoadIvar,
    LoadSvar,
    StoreDvar,
    StoreIvar,
    StoreSvar,

    // captured variables, (u16 function id, u16 slot)
    LoadCtxDvar,
    LoadCtxIvar,
    LoadCtxSvar,
    StoreCtxDvar,
    StoreCtxIvar,
    StoreCtxSvar,

    // comparison ( a b -- -1|0|1 )
    Dcmp,
    Icmp,

    // jumps, i16 offset relative to the offset operand
    Ja,
    IfIcmpNe,
    IfIcmpE,
    IfIcmpG,
    IfIcmpGe,
    IfIcmpL,
    IfIcmpLe,

    // control
    Stop,
    Call,       // u16 function id
    CallNative, // u16 native id
    Return,
}

/// Shape of the inline operand following an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int,
    Double,
    /// String id, slot, function id or native id.
    U16,
    /// `(function id, slot)`.
    Ctx,
    Jump,
}

impl OperandKind {
    pub fn size(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Int | OperandKind::Double => 8,
            OperandKind::U16 | OperandKind::Jump => 2,
            OperandKind::Ctx => 4,
        }
    }
}

impl Opcode {
    pub fn operand_kind(self) -> OperandKind {
        use Opcode::*;
        match self {
            Dload => OperandKind::Double,
            Iload => OperandKind::Int,
            Sload | LoadDvar | LoadIvar | LoadSvar | StoreDvar | StoreIvar | StoreSvar | Call
            | CallNative => OperandKind::U16,
            LoadCtxDvar | LoadCtxIvar | LoadCtxSvar | StoreCtxDvar | StoreCtxIvar
            | StoreCtxSvar => OperandKind::Ctx,
            Ja | IfIcmpNe | IfIcmpE | IfIcmpG | IfIcmpGe | IfIcmpL | IfIcmpLe => OperandKind::Jump,
            _ => OperandKind::None,
        }
    }

    /// Encoded width of the instruction including the opcode byte.
    pub fn width(self) -> usize {
        1 + self.operand_kind().size()
    }

    pub fn is_jump(self) -> bool {
        self.operand_kind() == OperandKind::Jump
    }

    /// True when control never falls through to the next instruction.
    pub fn ends_block(self) -> bool {
        matches!(self, Opcode::Ja | Opcode::Stop | Opcode::Return)
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Invalid => "INVALID",
            Dload => "DLOAD",
            Iload => "ILOAD",
            Sload => "SLOAD",
            Dload0 => "DLOAD0",
            Iload0 => "ILOAD0",
            Sload0 => "SLOAD0",
            Dload1 => "DLOAD1",
            Iload1 => "ILOAD1",
            DloadM1 => "DLOADM1",
            IloadM1 => "ILOADM1",
            Dadd => "DADD",
            Iadd => "IADD",
            Dsub => "DSUB",
            Isub => "ISUB",
            Dmul => "DMUL",
            Imul => "IMUL",
            Ddiv => "DDIV",
            Idiv => "IDIV",
            Imod => "IMOD",
            Dneg => "DNEG",
            Ineg => "INEG",
            Iaor => "IAOR",
            Iaand => "IAAND",
            Iaxor => "IAXOR",
            Iprint => "IPRINT",
            Dprint => "DPRINT",
            Sprint => "SPRINT",
            I2d => "I2D",
            D2i => "D2I",
            S2i => "S2I",
            Swap => "SWAP",
            Pop => "POP",
            LoadDvar => "LOADDVAR",
            LoadIvar => "LOADIVAR",
            LoadSvar => "LOADSVAR",
            StoreDvar => "STOREDVAR",
            StoreIvar => "STOREIVAR",
            StoreSvar => "STORESVAR",
            LoadCtxDvar => "LOADCTXDVAR",
            LoadCtxIvar => "LOADCTXIVAR",
            LoadCtxSvar => "LOADCTXSVAR",
            StoreCtxDvar => "STORECTXDVAR",
            StoreCtxIvar => "STORECTXIVAR",
            StoreCtxSvar => "STORECTXSVAR",
            Dcmp => "DCMP",
            Icmp => "ICMP",
            Ja => "JA",
            IfIcmpNe => "IFICMPNE",
            IfIcmpE => "IFICMPE",
            IfIcmpG => "IFICMPG",
            IfIcmpGe => "IFICMPGE",
            IfIcmpL => "IFICMPL",
            IfIcmpLe => "IFICMPLE",
            Stop => "STOP",
            Call => "CALL",
            CallNative => "CALLNATIVE",
            Return => "RETURN",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.mnemonic())
    }
}

/// Decoded inline operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Double(f64),
    U16(u16),
    Ctx { function: u16, slot: u16 },
    /// Absolute target offset, already resolved.
    Jump(usize),
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub offset: usize,
    pub op: Opcode,
    pub operand: Operand,
}

impl Instr {
    pub fn next(&self) -> usize {
        self.offset + self.op.width()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("truncated {op} at offset {offset}")]
    Truncated { offset: usize, op: Opcode },

    #[error("jump at offset {offset} leaves the code ({target})")]
    JumpOutOfRange { offset: usize, target: i64 },
}

fn read_array<const N: usize>(code: &[u8], at: usize) -> Option<[u8; N]> {
    code.get(at..at + N)?.try_into().ok()
}

/// Decodes the instruction starting at `offset`.
///
/// Jump targets are resolved to absolute offsets; a target outside
/// `0..=code.len()` is an error. Whether the target lands on an instruction
/// boundary is checked by the verifier.
pub fn decode(code: &[u8], offset: usize) -> Result<Instr, DecodeError> {
    let byte = *code
        .get(offset)
        .ok_or(DecodeError::UnknownOpcode { offset, byte: 0 })?;
    let op = Opcode::try_from(byte).map_err(|_| DecodeError::UnknownOpcode { offset, byte })?;
    if op == Opcode::Invalid {
        return Err(DecodeError::UnknownOpcode { offset, byte });
    }

    let at = offset + 1;
    let truncated = DecodeError::Truncated { offset, op };
    let operand = match op.operand_kind() {
        OperandKind::None => Operand::None,
        OperandKind::Int => Operand::Int(i64::from_le_bytes(
            read_array(code, at).ok_or(truncated.clone())?,
        )),
        OperandKind::Double => Operand::Double(f64::from_le_bytes(
            read_array(code, at).ok_or(truncated.clone())?,
        )),
        OperandKind::U16 => Operand::U16(u16::from_le_bytes(
            read_array(code, at).ok_or(truncated.clone())?,
        )),
        OperandKind::Ctx => {
            let function = u16::from_le_bytes(read_array(code, at).ok_or(truncated.clone())?);
            let slot = u16::from_le_bytes(read_array(code, at + 2).ok_or(truncated.clone())?);
            Operand::Ctx { function, slot }
        }
        OperandKind::Jump => {
            let rel = i16::from_le_bytes(read_array(code, at).ok_or(truncated.clone())?);
            let target = at as i64 + rel as i64;
            if target < 0 || target > code.len() as i64 {
                return Err(DecodeError::JumpOutOfRange { offset, target });
            }
            Operand::Jump(target as usize)
        }
    };

    Ok(Instr {
        offset,
        op,
        operand,
    })
}

/// Decodes a whole stream linearly.
pub fn decode_all(code: &[u8]) -> Result<Vec<Instr>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instr = decode(code, offset)?;
        offset = instr.next();
        out.push(instr);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trips_through_byte() {
        for byte in 1..=u8::from(Opcode::Return) {
            let op = Opcode::try_from(byte).unwrap();
            assert_eq!(u8::from(op), byte);
        }
        assert!(Opcode::try_from(u8::from(Opcode::Return) + 1).is_err());
    }

    #[test]
    fn test_widths() {
        assert_eq!(Opcode::Iadd.width(), 1);
        assert_eq!(Opcode::Iload.width(), 9);
        assert_eq!(Opcode::Dload.width(), 9);
        assert_eq!(Opcode::LoadIvar.width(), 3);
        assert_eq!(Opcode::LoadCtxIvar.width(), 5);
        assert_eq!(Opcode::Ja.width(), 3);
    }

    #[test]
    fn test_decode_operands() {
        let mut code = vec![u8::from(Opcode::Iload)];
        code.extend_from_slice(&(-5i64).to_le_bytes());
        code.push(u8::from(Opcode::StoreCtxDvar));
        code.extend_from_slice(&3u16.to_le_bytes());
        code.extend_from_slice(&7u16.to_le_bytes());

        let instrs = decode_all(&code).unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].operand, Operand::Int(-5));
        assert_eq!(
            instrs[1].operand,
            Operand::Ctx {
                function: 3,
                slot: 7
            }
        );
        assert_eq!(instrs[1].offset, 9);
    }

    #[test]
    fn test_decode_jump_is_relative_to_operand() {
        // JA +0 jumps to the operand itself (offset 1); -1 back to the opcode.
        let code = [u8::from(Opcode::Ja), 0xff, 0xff];
        let instr = decode(&code, 0).unwrap();
        assert_eq!(instr.operand, Operand::Jump(0));

        let code = [u8::from(Opcode::Ja), 2, 0];
        assert_eq!(decode(&code, 0).unwrap().operand, Operand::Jump(3));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode(&[0], 0),
            Err(DecodeError::UnknownOpcode { byte: 0, .. })
        ));
        assert!(matches!(
            decode(&[250], 0),
            Err(DecodeError::UnknownOpcode { byte: 250, .. })
        ));
        assert!(matches!(
            decode(&[u8::from(Opcode::Iload), 1, 2], 0),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            decode(&[u8::from(Opcode::Ja), 100, 0], 0),
            Err(DecodeError::JumpOutOfRange { .. })
        ));
    }
}
