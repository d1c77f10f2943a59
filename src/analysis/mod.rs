//! Front half of translation: name resolution and type checking.
//!
//! Both passes leave the AST untouched and return side tables keyed by
//! node id, consumed by the code generator.

pub mod scope;
pub mod typeck;

pub use scope::{FunctionId, Resolution, VarRef, resolve};
pub use typeck::{Conversion, TypeTable, check};
