pub mod native;
pub mod runtime_error;
pub mod vm;

pub use native::{NativeError, NativeRegistry};
pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use vm::{ExitStatus, Vm, VmConfig, VmStats};
