//! Cinder: a small statically typed language translated to bytecode for a
//! stack machine.
//!
//! The pipeline is `source -> tokens -> AST -> (resolve, type check) ->
//! bytecode Program -> Vm`. A [`Program`] is self-contained and can be
//! serialized, disassembled or executed with host globals.

pub mod analysis;
pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;

pub use bytecode::compile::translate;
pub use bytecode::{Program, ProgramError, TranslationError};
pub use lang::types::{Signature, VarType};
pub use lang::value::{Value, Var};
pub use runtime::{ExitStatus, NativeRegistry, RuntimeError, RuntimeErrorKind, Vm, VmConfig};

/// Parses and translates source text in one step.
pub fn translate_source(source: &str) -> Result<Program, TranslationError> {
    let ast = frontend::parse_program(source)?;
    translate(&ast)
}
