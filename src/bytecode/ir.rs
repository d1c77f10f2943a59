use crate::analysis::scope::VarRef;
use crate::bytecode::compile_error::TranslationError;
use crate::bytecode::op::Opcode;
use crate::bytecode::verify::{self, VerifyError};
use crate::lang::types::{Signature, VarType};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single function's instruction stream.
///
/// One opcode byte followed by its inline operands, little-endian.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bytecode {
    code: Vec<u8>,
}

/// Jump target that may be referenced before it is bound.
///
/// Every reference emitted before `bind` is recorded and back-patched once
/// the target offset is known.
#[derive(Debug, Default)]
pub struct Label {
    target: Option<usize>,
    patches: Vec<usize>,
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(code: Vec<u8>) -> Self {
        Self { code }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn emit(&mut self, op: Opcode) {
        self.code.push(op.into());
    }

    pub fn emit_u16(&mut self, op: Opcode, value: u16) {
        self.emit(op);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_ctx(&mut self, op: Opcode, function: u16, slot: u16) {
        self.emit(op);
        self.code.extend_from_slice(&function.to_le_bytes());
        self.code.extend_from_slice(&slot.to_le_bytes());
    }

    /// Pushes an int constant, using the one-byte forms where possible.
    pub fn emit_int(&mut self, value: i64) {
        match value {
            0 => self.emit(Opcode::Iload0),
            1 => self.emit(Opcode::Iload1),
            -1 => self.emit(Opcode::IloadM1),
            _ => {
                self.emit(Opcode::Iload);
                self.code.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// Pushes a double constant. `-0.0` and NaN keep the full form.
    pub fn emit_double(&mut self, value: f64) {
        if value.to_bits() == 0.0f64.to_bits() {
            self.emit(Opcode::Dload0);
        } else if value == 1.0 {
            self.emit(Opcode::Dload1);
        } else if value == -1.0 {
            self.emit(Opcode::DloadM1);
        } else {
            self.emit(Opcode::Dload);
            self.code.extend_from_slice(&value.to_le_bytes());
        }
    }

    /// Emits a jump to `label`, patched later if the label is not bound yet.
    pub fn emit_jump(&mut self, op: Opcode, label: &mut Label) -> Result<(), TranslationError> {
        if !op.is_jump() {
            return Err(TranslationError::internal(format!("{} is not a jump", op)));
        }
        self.emit(op);
        let at = self.code.len();
        self.code.extend_from_slice(&[0, 0]);
        match label.target {
            Some(target) => self.patch(at, target),
            None => {
                label.patches.push(at);
                Ok(())
            }
        }
    }

    /// Binds `label` to the current end of the stream and patches every
    /// pending reference.
    pub fn bind(&mut self, label: &mut Label) -> Result<(), TranslationError> {
        if label.target.is_some() {
            return Err(TranslationError::internal("label bound twice"));
        }
        let target = self.code.len();
        label.target = Some(target);
        for at in std::mem::take(&mut label.patches) {
            self.patch(at, target)?;
        }
        Ok(())
    }

    fn patch(&mut self, at: usize, target: usize) -> Result<(), TranslationError> {
        let distance = target as i64 - at as i64;
        let offset = i16::try_from(distance).map_err(|_| {
            TranslationError::internal(format!(
                "jump distance {} at offset {} does not fit in 16 bits",
                distance, at
            ))
        })?;
        self.code[at..at + 2].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }
}

/// Interned string constants. Id 0 is always the empty string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantPool {
    strings: Vec<String>,
    #[serde(skip)]
    index: FxHashMap<String, u16>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ConstantPool {
    fn eq(&self, other: &Self) -> bool {
        self.strings == other.strings
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        let mut index = FxHashMap::default();
        index.insert(String::new(), 0);
        Self {
            strings: vec![String::new()],
            index,
        }
    }

    /// Returns the id of `s`, adding it on first use.
    pub fn intern(&mut self, s: &str) -> Option<u16> {
        if let Some(&id) = self.index.get(s) {
            return Some(id);
        }
        let id = u16::try_from(self.strings.len()).ok()?;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), id);
        Some(id)
    }

    /// Id of `s` if it is already interned.
    pub fn find(&self, s: &str) -> Option<u16> {
        self.index.get(s).copied()
    }

    pub fn get(&self, id: u16) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &str)> {
        self.strings
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u16, s.as_str()))
    }

    /// Restores the lookup index after deserialization.
    fn rebuild_index(&mut self) {
        self.index = self
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u16))
            .collect();
    }
}

/// A translated function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: u16,
    pub name: String,
    pub signature: Signature,
    /// Slot types; parameters come first. The length is the frame size.
    pub locals: Vec<VarType>,
    /// Sorted `(owner, slot)` pairs reached through the context table.
    pub captures: Vec<VarRef>,
    pub scope_id: u32,
    pub code: Bytecode,
    /// Native descriptor id when the body is a host function.
    pub native: Option<u16>,
}

impl Function {
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Position of `(function, slot)` in this function's context table.
    pub fn capture_index(&self, function: u16, slot: u16) -> Option<usize> {
        self.captures
            .binary_search(&VarRef { function, slot })
            .ok()
    }
}

/// Host function reference, resolved by name when first called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeDescriptor {
    pub name: String,
    pub signature: Signature,
}

/// Variable of the outermost block of `<top>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVar {
    pub name: String,
    pub ty: VarType,
    pub slot: u16,
}

/// A translated program. Function 0 is the top-level script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
    pub constants: ConstantPool,
    pub natives: Vec<NativeDescriptor>,
    pub globals: Vec<GlobalVar>,
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("failed to encode program: {0}")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode program: {0}")]
    Decode(#[source] postcard::Error),

    #[error("invalid program: {0}")]
    Verify(#[from] VerifyError),
}

impl Program {
    pub fn function(&self, id: u16) -> Option<&Function> {
        self.functions.get(id as usize)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalVar> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Serializes the program with postcard.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        postcard::to_allocvec(self).map_err(ProgramError::Encode)
    }

    /// Deserializes and verifies a program produced by [`Program::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        let mut program: Program = postcard::from_bytes(bytes).map_err(ProgramError::Decode)?;
        program.constants.rebuild_index();
        verify::verify_program(&program)?;
        Ok(program)
    }
}
