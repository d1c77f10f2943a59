use std::io::{self, Write};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::bytecode::ir::{Function, Program};
use crate::bytecode::op::Opcode;
use crate::lang::types::VarType;
use crate::lang::value::{Value, Var};
use crate::runtime::native::{NativeId, NativeRegistry};
use crate::runtime::runtime_error::{RuntimeError, RuntimeErrorKind};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    pub max_steps: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_stack_size: 10_000,
            max_call_depth: 1000,
            max_steps: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// `STOP` at the end of the top-level code.
    Stopped,
    /// `RETURN` from the outermost frame.
    Returned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub steps: u64,
    pub calls: u64,
    pub native_calls: u64,
    pub max_depth: usize,
}

/// Untagged 64-bit cell. Its meaning (int, double bits or string id) is
/// fixed by the static type at that program point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot(u64);

impl Slot {
    pub fn from_int(v: i64) -> Self {
        Slot(v as u64)
    }

    pub fn from_double(v: f64) -> Self {
        Slot(v.to_bits())
    }

    pub fn from_string_id(id: u64) -> Self {
        Slot(id)
    }

    pub fn int(self) -> i64 {
        self.0 as i64
    }

    pub fn double(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn string_id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    function: u16,
    return_ip: usize,
    /// Index of slot 0 in `Vm::locals`.
    locals_base: usize,
    /// Index of the first context address in `Vm::contexts`.
    context_base: usize,
}

/// Bytecode interpreter for one program.
///
/// Locals of all active frames share one vector. A frame's context table
/// holds absolute indices into it, one per capture pair of the frame's
/// function, so a nested function reads and writes its enclosing function's
/// slots directly.
pub struct Vm<'p> {
    program: &'p Program,
    natives: NativeRegistry,
    config: VmConfig,

    stack: Vec<Slot>,
    locals: Vec<Slot>,
    contexts: Vec<usize>,
    frames: Vec<Frame>,
    ip: usize,

    /// Registry id per native descriptor, bound on first call
    bound: Vec<Option<NativeId>>,

    /// Strings created at run time; ids continue after the constant pool
    strings: Vec<String>,
    string_ids: FxHashMap<String, u64>,

    stats: VmStats,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p Program, natives: NativeRegistry, config: VmConfig) -> Self {
        Self {
            program,
            natives,
            stack: Vec::with_capacity(config.max_stack_size.min(1024)),
            config,
            locals: Vec::new(),
            contexts: Vec::new(),
            frames: Vec::new(),
            ip: 0,
            bound: vec![None; program.natives.len()],
            strings: Vec::new(),
            string_ids: FxHashMap::default(),
            stats: VmStats::default(),
        }
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    /// Active frames. The top-level frame stays after `STOP`.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn reset_execution_state(&mut self) {
        self.stack.clear();
        self.locals.clear();
        self.contexts.clear();
        self.frames.clear();
        self.ip = 0;
        self.stats = VmStats::default();
    }

    /// Runs the top-level function to `STOP` or an outermost `RETURN`.
    ///
    /// Values in `globals` are stored into the matching top-level variables
    /// first and read back once the run ends. Names without a matching
    /// variable are ignored.
    pub fn run(&mut self, globals: &mut [Var], out: &mut dyn Write) -> Result<ExitStatus, RuntimeError> {
        self.reset_execution_state();

        let program = self.program;
        let top = program.function(0).ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::InvalidOperand("program has no functions".into()))
                .at("<program>", 0)
        })?;
        self.locals.resize(top.local_count(), Slot::default());
        self.frames.push(Frame {
            function: 0,
            return_ip: 0,
            locals_base: 0,
            context_base: 0,
        });
        self.stats.max_depth = 1;

        self.load_globals(globals)
            .map_err(|kind| RuntimeError::new(kind).at(&top.name, 0))?;

        debug!(
            functions = program.functions.len(),
            globals = globals.len(),
            "starting run"
        );

        let status = self.run_loop(out)?;
        self.store_globals(globals);

        debug!(
            steps = self.stats.steps,
            calls = self.stats.calls,
            max_depth = self.stats.max_depth,
            ?status,
            "run finished"
        );
        Ok(status)
    }

    fn load_globals(&mut self, globals: &[Var]) -> Result<(), RuntimeErrorKind> {
        let program = self.program;
        for var in globals {
            let Some(global) = program.global(&var.name) else {
                warn!(name = %var.name, "ignoring value for unknown global");
                continue;
            };
            let slot = match (global.ty, &var.value) {
                (VarType::Int, Value::Int(v)) => Slot::from_int(*v),
                (VarType::Double, Value::Int(v)) => Slot::from_double(*v as f64),
                (VarType::Double, Value::Double(v)) => Slot::from_double(*v),
                (VarType::String, Value::String(s)) => Slot::from_string_id(self.intern(s)),
                (ty, value) => {
                    return Err(RuntimeErrorKind::BadGlobal {
                        name: var.name.clone(),
                        message: format!("{} value for {} variable", value.var_type(), ty),
                    });
                }
            };
            self.locals[global.slot as usize] = slot;
        }
        Ok(())
    }

    fn store_globals(&self, globals: &mut [Var]) {
        for var in globals.iter_mut() {
            let Some(global) = self.program.global(&var.name) else {
                continue;
            };
            let Some(&slot) = self.locals.get(global.slot as usize) else {
                continue;
            };
            if let Ok(value) = self.to_value(global.ty, slot) {
                var.value = value;
            }
        }
    }

    fn run_loop(&mut self, out: &mut dyn Write) -> Result<ExitStatus, RuntimeError> {
        loop {
            let offset = self.ip;
            match self.step(out) {
                Ok(None) => {}
                Ok(Some(status)) => return Ok(status),
                Err(kind) => return Err(self.locate(kind, offset)),
            }
        }
    }

    /// Attaches the failing function, offset and active call chain.
    fn locate(&self, kind: RuntimeErrorKind, offset: usize) -> RuntimeError {
        let name = |id: u16| {
            self.program
                .function(id)
                .map_or_else(|| format!("#{}", id), |f| f.name.clone())
        };
        let function = self.frames.last().map(|f| name(f.function)).unwrap_or_default();
        self.frames.iter().fold(
            RuntimeError::new(kind).at(&function, offset),
            |err, frame| err.with_context(&name(frame.function)),
        )
    }

    fn check_limits(&mut self) -> Result<(), RuntimeErrorKind> {
        self.stats.steps += 1;

        if let Some(max) = self.config.max_steps
            && self.stats.steps > max
        {
            return Err(RuntimeErrorKind::StepLimit(max));
        }
        Ok(())
    }

    // =========================================================================
    // Operand stack
    // =========================================================================

    fn push(&mut self, slot: Slot) -> Result<(), RuntimeErrorKind> {
        if self.stack.len() >= self.config.max_stack_size {
            return Err(RuntimeErrorKind::StackOverflow(self.config.max_stack_size));
        }
        self.stack.push(slot);
        Ok(())
    }

    fn pop(&mut self) -> Result<Slot, RuntimeErrorKind> {
        self.stack.pop().ok_or(RuntimeErrorKind::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64, RuntimeErrorKind> {
        Ok(self.pop()?.int())
    }

    fn pop_double(&mut self) -> Result<f64, RuntimeErrorKind> {
        Ok(self.pop()?.double())
    }

    fn int_binary(&mut self, f: impl FnOnce(i64, i64) -> i64) -> Result<(), RuntimeErrorKind> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Slot::from_int(f(a, b)))
    }

    fn double_binary(&mut self, f: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeErrorKind> {
        let b = self.pop_double()?;
        let a = self.pop_double()?;
        self.push(Slot::from_double(f(a, b)))
    }

    // =========================================================================
    // Strings
    // =========================================================================

    fn intern(&mut self, s: &str) -> u64 {
        if let Some(id) = self.program.constants.find(s) {
            return id as u64;
        }
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = (self.program.constants.len() + self.strings.len()) as u64;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    fn string(&self, id: u64) -> Result<&str, RuntimeErrorKind> {
        let pool = self.program.constants.len() as u64;
        let found = if id < pool {
            self.program.constants.get(id as u16)
        } else {
            self.strings.get((id - pool) as usize).map(String::as_str)
        };
        found.ok_or_else(|| RuntimeErrorKind::InvalidOperand(format!("string id {}", id)))
    }

    fn to_value(&self, ty: VarType, slot: Slot) -> Result<Value, RuntimeErrorKind> {
        Ok(match ty {
            VarType::Int => Value::Int(slot.int()),
            VarType::Double => Value::Double(slot.double()),
            VarType::String => Value::String(self.string(slot.string_id())?.to_string()),
            other => {
                return Err(RuntimeErrorKind::InvalidOperand(format!("{} value", other)));
            }
        })
    }

    fn print(out: &mut dyn Write, text: impl std::fmt::Display) -> Result<(), RuntimeErrorKind> {
        write!(out, "{}", text).map_err(|e| RuntimeErrorKind::Io(e.to_string()))
    }

    // =========================================================================
    // Variables
    // =========================================================================

    fn local_index(&self, frame: &Frame, function: &Function, slot: u16) -> Result<usize, RuntimeErrorKind> {
        if (slot as usize) < function.local_count() {
            Ok(frame.locals_base + slot as usize)
        } else {
            Err(RuntimeErrorKind::InvalidOperand(format!("slot {}", slot)))
        }
    }

    /// Absolute locals index of `(owner, slot)` seen from `frame`.
    fn context_index(
        &self,
        frame: &Frame,
        function: &Function,
        owner: u16,
        slot: u16,
    ) -> Result<usize, RuntimeErrorKind> {
        function
            .capture_index(owner, slot)
            .and_then(|i| self.contexts.get(frame.context_base + i).copied())
            .ok_or_else(|| {
                RuntimeErrorKind::InvalidOperand(format!("context ({}, {})", owner, slot))
            })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn step(&mut self, out: &mut dyn Write) -> Result<Option<ExitStatus>, RuntimeErrorKind> {
        self.check_limits()?;

        let program = self.program;
        let frame = *self.frames.last().ok_or(RuntimeErrorKind::StackUnderflow)?;
        let function = program
            .function(frame.function)
            .ok_or_else(|| RuntimeErrorKind::InvalidOperand(format!("function {}", frame.function)))?;
        let code = function.code.bytes();

        let at = self.ip;
        let byte = *code
            .get(at)
            .ok_or(RuntimeErrorKind::JumpOutOfRange(at as i64))?;
        let op = Opcode::try_from(byte).map_err(|_| RuntimeErrorKind::UnknownOpcode(byte))?;
        self.ip = at + op.width();
        if self.ip > code.len() {
            return Err(RuntimeErrorKind::JumpOutOfRange(self.ip as i64));
        }
        let operand = &code[at + 1..self.ip];

        match op {
            Opcode::Invalid => return Err(RuntimeErrorKind::UnknownOpcode(byte)),

            // constants
            Opcode::Dload => self.push(Slot::from_double(f64::from_le_bytes(array(operand)?)))?,
            Opcode::Iload => self.push(Slot::from_int(i64::from_le_bytes(array(operand)?)))?,
            Opcode::Sload => self.push(Slot::from_string_id(u16_at(operand, 0)? as u64))?,
            Opcode::Sload0 => self.push(Slot::from_string_id(0))?,
            Opcode::Dload0 => self.push(Slot::from_double(0.0))?,
            Opcode::Iload0 => self.push(Slot::from_int(0))?,
            Opcode::Dload1 => self.push(Slot::from_double(1.0))?,
            Opcode::Iload1 => self.push(Slot::from_int(1))?,
            Opcode::DloadM1 => self.push(Slot::from_double(-1.0))?,
            Opcode::IloadM1 => self.push(Slot::from_int(-1))?,

            // arithmetic
            Opcode::Dadd => self.double_binary(|a, b| a + b)?,
            Opcode::Dsub => self.double_binary(|a, b| a - b)?,
            Opcode::Dmul => self.double_binary(|a, b| a * b)?,
            Opcode::Ddiv => self.double_binary(|a, b| a / b)?,
            Opcode::Iadd => self.int_binary(i64::wrapping_add)?,
            Opcode::Isub => self.int_binary(i64::wrapping_sub)?,
            Opcode::Imul => self.int_binary(i64::wrapping_mul)?,
            Opcode::Idiv | Opcode::Imod => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                if b == 0 {
                    return Err(RuntimeErrorKind::DivisionByZero);
                }
                let result = if op == Opcode::Idiv {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                self.push(Slot::from_int(result))?;
            }
            Opcode::Dneg => {
                let v = self.pop_double()?;
                self.push(Slot::from_double(-v))?;
            }
            Opcode::Ineg => {
                let v = self.pop_int()?;
                self.push(Slot::from_int(v.wrapping_neg()))?;
            }

            // bitwise
            Opcode::Iaor => self.int_binary(|a, b| a | b)?,
            Opcode::Iaand => self.int_binary(|a, b| a & b)?,
            Opcode::Iaxor => self.int_binary(|a, b| a ^ b)?,

            // output
            Opcode::Iprint => {
                let v = self.pop_int()?;
                Self::print(out, v)?;
            }
            Opcode::Dprint => {
                let v = self.pop_double()?;
                Self::print(out, v)?;
            }
            Opcode::Sprint => {
                let id = self.pop()?.string_id();
                Self::print(out, self.string(id)?)?;
            }

            // conversions
            Opcode::I2d => {
                let v = self.pop_int()?;
                self.push(Slot::from_double(v as f64))?;
            }
            Opcode::D2i => {
                let v = self.pop_double()?;
                self.push(Slot::from_int(v as i64))?;
            }
            Opcode::S2i => {
                // the string id itself; equal strings share an id
                let id = self.pop()?.string_id();
                self.push(Slot::from_int(id as i64))?;
            }

            // stack
            Opcode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            Opcode::Pop => {
                self.pop()?;
            }

            // locals
            Opcode::LoadDvar | Opcode::LoadIvar | Opcode::LoadSvar => {
                let index = self.local_index(&frame, function, u16_at(operand, 0)?)?;
                self.push(self.locals[index])?;
            }
            Opcode::StoreDvar | Opcode::StoreIvar | Opcode::StoreSvar => {
                let index = self.local_index(&frame, function, u16_at(operand, 0)?)?;
                self.locals[index] = self.pop()?;
            }

            // captured variables
            Opcode::LoadCtxDvar | Opcode::LoadCtxIvar | Opcode::LoadCtxSvar => {
                let index = self.context_index(&frame, function, u16_at(operand, 0)?, u16_at(operand, 2)?)?;
                self.push(self.locals[index])?;
            }
            Opcode::StoreCtxDvar | Opcode::StoreCtxIvar | Opcode::StoreCtxSvar => {
                let index = self.context_index(&frame, function, u16_at(operand, 0)?, u16_at(operand, 2)?)?;
                self.locals[index] = self.pop()?;
            }

            // comparison
            Opcode::Dcmp => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                // unordered compares as greater
                let c = if a < b {
                    -1
                } else if a == b {
                    0
                } else {
                    1
                };
                self.push(Slot::from_int(c))?;
            }
            Opcode::Icmp => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                self.push(Slot::from_int(a.cmp(&b) as i64))?;
            }

            // jumps
            Opcode::Ja => self.jump(at, operand, code.len())?,
            Opcode::IfIcmpNe
            | Opcode::IfIcmpE
            | Opcode::IfIcmpG
            | Opcode::IfIcmpGe
            | Opcode::IfIcmpL
            | Opcode::IfIcmpLe => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let taken = match op {
                    Opcode::IfIcmpNe => a != b,
                    Opcode::IfIcmpE => a == b,
                    Opcode::IfIcmpG => a > b,
                    Opcode::IfIcmpGe => a >= b,
                    Opcode::IfIcmpL => a < b,
                    _ => a <= b,
                };
                if taken {
                    self.jump(at, operand, code.len())?;
                }
            }

            // control
            Opcode::Stop => return Ok(Some(ExitStatus::Stopped)),
            Opcode::Call => self.call(&frame, function, u16_at(operand, 0)?)?,
            Opcode::CallNative => self.call_native(u16_at(operand, 0)?)?,
            Opcode::Return => {
                if self.frames.len() == 1 {
                    // the top-level frame keeps its locals for global write-back
                    return Ok(Some(ExitStatus::Returned));
                }
                self.frames.pop();
                self.locals.truncate(frame.locals_base);
                self.contexts.truncate(frame.context_base);
                self.ip = frame.return_ip;
            }
        }

        Ok(None)
    }

    fn jump(&mut self, at: usize, operand: &[u8], len: usize) -> Result<(), RuntimeErrorKind> {
        let rel = i16::from_le_bytes(array(operand)?);
        let target = at as i64 + 1 + rel as i64;
        if target < 0 || target >= len as i64 {
            return Err(RuntimeErrorKind::JumpOutOfRange(target));
        }
        self.ip = target as usize;
        Ok(())
    }

    fn call(&mut self, caller_frame: &Frame, caller: &Function, id: u16) -> Result<(), RuntimeErrorKind> {
        let program = self.program;
        let callee = program
            .function(id)
            .ok_or_else(|| RuntimeErrorKind::InvalidOperand(format!("function {}", id)))?;
        if let Some(nid) = callee.native {
            return self.call_native(nid);
        }
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeErrorKind::CallDepthExceeded(self.config.max_call_depth));
        }

        // context table: caller-owned pairs point into the caller's frame,
        // the rest are forwarded from the caller's own table
        let context_base = self.contexts.len();
        for capture in &callee.captures {
            let index = if capture.function == caller_frame.function {
                self.local_index(caller_frame, caller, capture.slot)?
            } else {
                self.context_index(caller_frame, caller, capture.function, capture.slot)?
            };
            self.contexts.push(index);
        }

        let argc = callee.signature.params.len();
        if self.stack.len() < argc {
            return Err(RuntimeErrorKind::StackUnderflow);
        }
        let locals_base = self.locals.len();
        self.locals.resize(locals_base + callee.local_count(), Slot::default());
        let args_start = self.stack.len() - argc;
        self.locals[locals_base..locals_base + argc].copy_from_slice(&self.stack[args_start..]);
        self.stack.truncate(args_start);

        self.frames.push(Frame {
            function: id,
            return_ip: self.ip,
            locals_base,
            context_base,
        });
        self.ip = 0;

        self.stats.calls += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.frames.len());
        trace!(function = %callee.name, depth = self.frames.len(), "call");
        Ok(())
    }

    /// Resolves descriptor `nid` against the registry, checking signatures.
    fn bind_native(&mut self, nid: u16) -> Result<NativeId, RuntimeErrorKind> {
        if let Some(Some(id)) = self.bound.get(nid as usize) {
            return Ok(*id);
        }
        let program = self.program;
        let desc = program
            .natives
            .get(nid as usize)
            .ok_or_else(|| RuntimeErrorKind::InvalidOperand(format!("native {}", nid)))?;
        let id = self
            .natives
            .lookup(&desc.name)
            .ok_or_else(|| RuntimeErrorKind::UnresolvedNative(desc.name.clone()))?;
        let entry = self
            .natives
            .get(id)
            .ok_or_else(|| RuntimeErrorKind::UnresolvedNative(desc.name.clone()))?;
        if entry.signature != desc.signature {
            return Err(RuntimeErrorKind::NativeSignatureMismatch {
                name: desc.name.clone(),
                registered: entry.signature.to_string(),
                expected: desc.signature.to_string(),
            });
        }
        debug!(name = %desc.name, "bound native");
        self.bound[nid as usize] = Some(id);
        Ok(id)
    }

    fn call_native(&mut self, nid: u16) -> Result<(), RuntimeErrorKind> {
        let id = self.bind_native(nid)?;
        let program = self.program;
        let desc = &program.natives[nid as usize];

        let mut args = Vec::with_capacity(desc.signature.params.len());
        for ty in desc.signature.params.iter().rev() {
            let slot = self.pop()?;
            args.push(self.to_value(*ty, slot)?);
        }
        args.reverse();

        let entry = self
            .natives
            .get(id)
            .ok_or_else(|| RuntimeErrorKind::UnresolvedNative(desc.name.clone()))?;
        let result = entry.call(&args).map_err(|e| RuntimeErrorKind::NativeFailed {
            name: desc.name.clone(),
            message: e.to_string(),
        })?;
        self.stats.native_calls += 1;
        trace!(name = %desc.name, "native call");

        match result {
            None => Ok(()),
            Some(Value::Int(v)) => self.push(Slot::from_int(v)),
            Some(Value::Double(v)) => self.push(Slot::from_double(v)),
            Some(Value::String(s)) => {
                let id = self.intern(&s);
                self.push(Slot::from_string_id(id))
            }
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RuntimeErrorKind> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| RuntimeErrorKind::InvalidOperand("truncated operand".into()))
}

fn u16_at(operand: &[u8], at: usize) -> Result<u16, RuntimeErrorKind> {
    let bytes = operand.get(at..).unwrap_or_default();
    Ok(u16::from_le_bytes(array(bytes)?))
}

impl Program {
    /// Runs the program on stdout with the standard natives and the default
    /// configuration.
    pub fn execute(&self, globals: &mut [Var]) -> Result<ExitStatus, RuntimeError> {
        let mut vm = Vm::new(self, NativeRegistry::with_std(), VmConfig::default());
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let status = vm.run(globals, &mut out)?;
        out.flush().map_err(|e| {
            RuntimeError::new(RuntimeErrorKind::Io(e.to_string())).at("<top>", 0)
        })?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::{Bytecode, ConstantPool};
    use crate::lang::types::Signature;
    use crate::runtime::native::NativeError;
    use crate::translate_source;

    // ============================================================
    // Test Helpers
    // ============================================================

    fn run_with(
        source: &str,
        natives: NativeRegistry,
        config: VmConfig,
        globals: &mut [Var],
    ) -> (Result<ExitStatus, RuntimeError>, String) {
        let program = translate_source(source).expect("translation should succeed");
        let mut vm = Vm::new(&program, natives, config);
        let mut out = Vec::new();
        let result = vm.run(globals, &mut out);
        (result, String::from_utf8(out).unwrap())
    }

    fn output_of(source: &str) -> String {
        let (result, out) = run_with(source, NativeRegistry::with_std(), VmConfig::default(), &mut []);
        result.expect("execution should succeed");
        out
    }

    fn assert_output(source: &str, expected: &str) {
        assert_eq!(output_of(source), expected, "output mismatch for {}", source);
    }

    fn error_of(source: &str, config: VmConfig) -> RuntimeError {
        let (result, _) = run_with(source, NativeRegistry::with_std(), config, &mut []);
        result.expect_err("expected a runtime error")
    }

    /// Single-function program straight from a stream.
    fn program_from_code(code: Bytecode, locals: Vec<VarType>) -> Program {
        Program {
            functions: vec![Function {
                id: 0,
                name: "<top>".into(),
                signature: Signature::new(VarType::Void, vec![]),
                locals,
                captures: vec![],
                scope_id: 0,
                code,
                native: None,
            }],
            constants: ConstantPool::new(),
            natives: vec![],
            globals: vec![],
        }
    }

    // ============================================================
    // Arithmetic and output
    // ============================================================

    #[test]
    fn test_int_arithmetic() {
        assert_output("print(2 + 3);", "5");
        assert_output("print(7 % 3, ' ', 7 / 2, ' ', -7 / 2, ' ', 10 - 4 * 2);", "1 3 -3 2");
    }

    #[test]
    fn test_double_arithmetic() {
        assert_output("print(1.0 / 2);", "0.5");
        assert_output("print(1 + 2.0);", "3");
        assert_output("print(-2.5 * 2);", "-5");
    }

    #[test]
    fn test_int_overflow_wraps() {
        assert_output("print(9223372036854775807 + 1);", "-9223372036854775808");
    }

    #[test]
    fn test_bitwise() {
        assert_output("print(6 & 3, 6 | 3, 6 ^ 3);", "275");
    }

    #[test]
    fn test_strings() {
        assert_output("string s = 'ab'; print(s, \"cd\", '');", "abcd");
        assert_output("print('x' == 'x', 'x' == 'y', 'x' != 'y');", "101");
    }

    // ============================================================
    // Control flow
    // ============================================================

    #[test]
    fn test_for_is_inclusive() {
        assert_output("for (i in 1..3) print(i);", "123");
        assert_output("for (i in 3..1) print(i);", "");
    }

    #[test]
    fn test_for_reaches_int_max() {
        let (result, out) = run_with(
            "for (i in 9223372036854775806..9223372036854775807) print(i, ' ');",
            NativeRegistry::new(),
            VmConfig {
                max_steps: Some(1000),
                ..VmConfig::default()
            },
            &mut [],
        );
        assert_eq!(result, Ok(ExitStatus::Stopped));
        assert_eq!(out, "9223372036854775806 9223372036854775807 ");
    }

    #[test]
    fn test_for_bound_evaluated_once() {
        assert_output("int n = 3; for (i in 1..n) { n = 10; print(i); }", "123");
    }

    #[test]
    fn test_while_and_if() {
        assert_output(
            "int i = 0; while (i < 5) { if (i % 2 == 0) { print(i); } else print('-'); i += 1; }",
            "0-2-4",
        );
    }

    #[test]
    fn test_short_circuit() {
        assert_output(
            "function int called() { print('called'); return 1; }
             print(0 && called(), 1 || called());",
            "01",
        );
        assert_output("print(1 && 2, 0 || 0, !0, !5);", "1010");
    }

    #[test]
    fn test_nan_comparisons() {
        assert_output(
            "double n = 0.0 / 0.0;
             print(n < 1.0, n <= 1.0, n > 1.0, n >= 1.0, n == n, n != n);",
            "000001",
        );
        assert_output("print(1.0 < 2.0, 2.0 > 1.0, 2.0 >= 2.0, 1.5 <= 1.0);", "1110");
    }

    #[test]
    fn test_outermost_return_ends_run() {
        let (result, out) = run_with(
            "print(1); return; print(2);",
            NativeRegistry::new(),
            VmConfig::default(),
            &mut [],
        );
        assert_eq!(result, Ok(ExitStatus::Returned));
        assert_eq!(out, "1");
    }

    // ============================================================
    // Calls and closures
    // ============================================================

    #[test]
    fn test_recursion() {
        let program = translate_source(
            "function int fact(int n) { if (n <= 1) { return 1; } return n * fact(n - 1); }
             print(fact(10));",
        )
        .unwrap();
        let mut vm = Vm::new(&program, NativeRegistry::new(), VmConfig::default());
        let mut out = Vec::new();
        assert_eq!(vm.run(&mut [], &mut out), Ok(ExitStatus::Stopped));
        assert_eq!(String::from_utf8(out).unwrap(), "3628800");
        assert_eq!(vm.frame_depth(), 1);
        assert_eq!(vm.stack_len(), 0);
        assert_eq!(vm.stats().max_depth, 11);
        assert_eq!(vm.stats().calls, 10);
    }

    #[test]
    fn test_arguments_left_to_right() {
        assert_output(
            "function int f(int x) { print(x); return x; }
             function void g(int a, int b, double c) { print('|', a, b, c); }
             g(f(1), f(2), f(3));",
            "123|123",
        );
    }

    #[test]
    fn test_closure_counter() {
        assert_output(
            "int counter = 0;
             function void bump() { counter += 1; }
             bump(); bump();
             print(counter);",
            "2",
        );
    }

    #[test]
    fn test_nested_function_sees_enclosing_locals() {
        assert_output(
            "function int outer(int base) {
                 int total = 0;
                 function void add(int v) { total += base * v; }
                 function void twice(int v) { add(v); add(v); }
                 twice(2);
                 add(1);
                 return total;
             }
             print(outer(10));",
            "50",
        );
    }

    #[test]
    fn test_recursive_capture_owner() {
        assert_output(
            "function int sum(int n) {
                 int acc = 0;
                 function void step() { acc += n; }
                 step();
                 if (n > 0) { acc += sum(n - 1); }
                 return acc;
             }
             print(sum(4));",
            "10",
        );
    }

    #[test]
    fn test_implicit_default_return() {
        assert_output(
            "function int f() { } function double g() { } function string h() { }
             print(f(), g(), h(), '.');",
            "00.",
        );
    }

    // ============================================================
    // Natives
    // ============================================================

    #[test]
    fn test_std_natives() {
        assert_output(
            "function double sqrt(double x) native 'sqrt';
             function int strlen(string s) native 'strlen';
             print(sqrt(16), ' ', strlen('four'));",
            "4 4",
        );
    }

    #[test]
    fn test_native_string_result_is_interned() {
        let mut natives = NativeRegistry::new();
        natives.register("greet", Signature::new(VarType::String, vec![]), |_| {
            Ok(Some(Value::from("hi")))
        });
        natives.register("shout", Signature::new(VarType::String, vec![]), |_| {
            Ok(Some(Value::from("HEY")))
        });
        let (result, out) = run_with(
            "function string greet() native 'greet';
             function string shout() native 'shout';
             print(greet() == 'hi', shout() == shout(), shout());",
            natives,
            VmConfig::default(),
            &mut [],
        );
        result.unwrap();
        assert_eq!(out, "11HEY");
    }

    #[test]
    fn test_unresolved_native() {
        let (result, _) = run_with(
            "function double nope(double x) native 'nope'; print(nope(1.0));",
            NativeRegistry::with_std(),
            VmConfig::default(),
            &mut [],
        );
        let err = result.unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::UnresolvedNative("nope".into()));
        assert_eq!(err.function, "<top>");
    }

    #[test]
    fn test_native_signature_mismatch() {
        let err = error_of(
            "function int sqrt(int x) native 'sqrt'; print(sqrt(4));",
            VmConfig::default(),
        );
        assert!(matches!(err.kind, RuntimeErrorKind::NativeSignatureMismatch { .. }));
    }

    #[test]
    fn test_native_failure() {
        let mut natives = NativeRegistry::new();
        natives.register("boom", Signature::new(VarType::Void, vec![]), |_| {
            Err(NativeError::Failed("kaboom".into()))
        });
        let (result, _) = run_with(
            "function void boom() native 'boom'; boom();",
            natives,
            VmConfig::default(),
            &mut [],
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("native 'boom' failed: kaboom"));
    }

    // ============================================================
    // Globals
    // ============================================================

    #[test]
    fn test_globals_round_trip() {
        let mut globals = vec![
            Var::new("x", 5i64),
            Var::new("d", 2i64),
            Var::new("s", "in"),
            Var::new("missing", 1i64),
        ];
        let (result, out) = run_with(
            "int x; double d; string s; x = x * 2; d = d / 4; print(s); s = 'out';",
            NativeRegistry::new(),
            VmConfig::default(),
            &mut globals,
        );
        result.unwrap();
        assert_eq!(out, "in");
        assert_eq!(globals[0].value, Value::Int(10));
        assert_eq!(globals[1].value, Value::Double(0.5));
        assert_eq!(globals[2].value, Value::String("out".into()));
        assert_eq!(globals[3].value, Value::Int(1));
    }

    #[test]
    fn test_global_type_mismatch() {
        let mut globals = vec![Var::new("x", 1.5)];
        let (result, _) = run_with("int x;", NativeRegistry::new(), VmConfig::default(), &mut globals);
        assert!(matches!(
            result.unwrap_err().kind,
            RuntimeErrorKind::BadGlobal { .. }
        ));
    }

    // ============================================================
    // Fatal errors
    // ============================================================

    #[test]
    fn test_division_by_zero() {
        let err = error_of(
            "function int div(int a, int b) { return a / b; } print(div(1, 0));",
            VmConfig::default(),
        );
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert_eq!(err.function, "div");
        assert_eq!(err.call_stack, vec!["<top>".to_string(), "div".to_string()]);
        assert!(err.to_string().contains("division by zero at div+"));

        let err = error_of("int z = 0; print(5 % z);", VmConfig::default());
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
    }

    #[test]
    fn test_double_division_by_zero_is_infinite() {
        assert_output("print(1.0 / 0);", "inf");
    }

    #[test]
    fn test_call_depth_limit() {
        let config = VmConfig {
            max_call_depth: 50,
            ..VmConfig::default()
        };
        let err = error_of("function int f(int n) { return f(n + 1); } print(f(0));", config);
        assert_eq!(err.kind, RuntimeErrorKind::CallDepthExceeded(50));
        assert_eq!(err.call_stack.len(), 50);
    }

    #[test]
    fn test_step_limit() {
        let config = VmConfig {
            max_steps: Some(1000),
            ..VmConfig::default()
        };
        let err = error_of("while (1) { }", config);
        assert_eq!(err.kind, RuntimeErrorKind::StepLimit(1000));
    }

    #[test]
    fn test_stack_limit() {
        let config = VmConfig {
            max_stack_size: 2,
            ..VmConfig::default()
        };
        let err = error_of("print(1 + (2 + 3));", config);
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow(2));
    }

    #[test]
    fn test_unverified_stream_errors() {
        let mut bc = Bytecode::new();
        bc.emit(Opcode::Iadd);
        let program = program_from_code(bc, vec![]);
        let mut vm = Vm::new(&program, NativeRegistry::new(), VmConfig::default());
        let err = vm.run(&mut [], &mut Vec::<u8>::new()).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackUnderflow);
        assert_eq!(err.offset, 0);

        let program = program_from_code(Bytecode::from_bytes(vec![0xfe]), vec![]);
        let mut vm = Vm::new(&program, NativeRegistry::new(), VmConfig::default());
        let err = vm.run(&mut [], &mut Vec::<u8>::new()).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::UnknownOpcode(0xfe));
    }

    #[test]
    fn test_conversion_and_compare_opcodes() {
        // D2I truncates toward zero; ICMP pushes -1/0/1
        let mut bc = Bytecode::new();
        bc.emit_double(-2.75);
        bc.emit(Opcode::D2i);
        bc.emit(Opcode::Iprint);
        bc.emit_int(3);
        bc.emit_int(9);
        bc.emit(Opcode::Icmp);
        bc.emit(Opcode::Iprint);
        bc.emit_int(9);
        bc.emit_int(9);
        bc.emit(Opcode::Icmp);
        bc.emit(Opcode::Iprint);
        bc.emit(Opcode::Stop);
        let program = program_from_code(bc, vec![]);

        let mut vm = Vm::new(&program, NativeRegistry::new(), VmConfig::default());
        let mut out = Vec::new();
        vm.run(&mut [], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "-2-10");
    }
}
