pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod verify;

pub use compile::translate;
pub use compile_error::TranslationError;
pub use ir::{Bytecode, Function, Label, Program, ProgramError};
pub use op::Opcode;
