use thiserror::Error;

/// What went wrong. Every runtime error is fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeErrorKind {
    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("stack size limit exceeded ({0})")]
    StackOverflow(usize),

    #[error("call depth limit exceeded ({0}), possible infinite recursion")]
    CallDepthExceeded(usize),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("jump or instruction pointer out of range ({0})")]
    JumpOutOfRange(i64),

    #[error("invalid operand: {0}")]
    InvalidOperand(String),

    #[error("unresolved native '{0}'")]
    UnresolvedNative(String),

    #[error("native '{name}' is registered as {registered}, program expects {expected}")]
    NativeSignatureMismatch {
        name: String,
        registered: String,
        expected: String,
    },

    #[error("native '{name}' failed: {message}")]
    NativeFailed { name: String, message: String },

    #[error("execution step limit exceeded ({0})")]
    StepLimit(u64),

    #[error("output failed: {0}")]
    Io(String),

    #[error("bad global '{name}': {message}")]
    BadGlobal { name: String, message: String },
}

/// A fatal interpreter error with the location it was raised at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("runtime error: {kind} at {function}+{offset}{}", call_stack_lines(.call_stack))]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// Function executing when the error was raised.
    pub function: String,
    /// Offset of the failing instruction in that function.
    pub offset: usize,
    /// Active functions, outermost first.
    pub call_stack: Vec<String>,
}

/// Innermost frame first.
fn call_stack_lines(call_stack: &[String]) -> String {
    if call_stack.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  call stack:");
    for (i, frame) in call_stack.iter().rev().enumerate() {
        out.push_str(&format!("\n    {}: {}", i, frame));
    }
    out
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        RuntimeError {
            kind,
            function: String::new(),
            offset: 0,
            call_stack: Vec::new(),
        }
    }

    pub fn at(mut self, function: &str, offset: usize) -> Self {
        self.function = function.to_string();
        self.offset = offset;
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.call_stack.push(context.to_string());
        self
    }
}

impl From<RuntimeErrorKind> for RuntimeError {
    fn from(kind: RuntimeErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}
