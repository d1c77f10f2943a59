use crate::bytecode::ir::{Function, Program};
use crate::bytecode::op::{DecodeError, Instr, Opcode, Operand, decode_all};
use crate::lang::types::VarType;
use thiserror::Error;
use tracing::trace;

/// Static check failure, located at a function and instruction offset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("verify error in {function}+{offset}: {message}")]
pub struct VerifyError {
    pub function: String,
    pub offset: usize,
    pub message: String,
}

impl VerifyError {
    fn new(function: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            function: function.to_string(),
            offset,
            message: message.into(),
        }
    }
}

/// Checks the program tables and every function's stream.
///
/// Streams are checked by abstract interpretation over operand *types*:
/// every reachable instruction gets one entry stack, which must agree at
/// join points. The interpreter relies on these checks and never inspects a
/// cell's type at run time.
pub fn verify_program(program: &Program) -> Result<(), VerifyError> {
    let Some(top) = program.functions.first() else {
        return Err(VerifyError::new("<program>", 0, "program has no functions"));
    };
    if !top.signature.params.is_empty() || top.signature.return_type != VarType::Void {
        return Err(VerifyError::new(&top.name, 0, "top function must be void()"));
    }

    for (i, f) in program.functions.iter().enumerate() {
        if f.id as usize != i {
            return Err(VerifyError::new(&f.name, 0, "function id does not match its index"));
        }
        check_frame_layout(program, f)?;
    }

    for g in &program.globals {
        match top.locals.get(g.slot as usize) {
            Some(ty) if *ty == g.ty => {}
            _ => {
                return Err(VerifyError::new(
                    &top.name,
                    0,
                    format!("global '{}' does not match slot {}", g.name, g.slot),
                ));
            }
        }
    }

    for f in &program.functions {
        verify_function(program, f)?;
    }
    Ok(())
}

fn check_frame_layout(program: &Program, f: &Function) -> Result<(), VerifyError> {
    let n = f.signature.params.len();
    if f.locals.len() < n || f.locals[..n] != f.signature.params[..] {
        return Err(VerifyError::new(&f.name, 0, "parameters do not match leading slots"));
    }
    if f.locals.iter().any(|t| !t.is_value()) {
        return Err(VerifyError::new(&f.name, 0, "slot of non-value type"));
    }
    if !f.captures.windows(2).all(|w| w[0] < w[1]) {
        return Err(VerifyError::new(&f.name, 0, "capture table is not sorted"));
    }
    for c in &f.captures {
        let owner_ok = program
            .function(c.function)
            .is_some_and(|o| (c.slot as usize) < o.locals.len());
        if !owner_ok || c.function == f.id {
            return Err(VerifyError::new(
                &f.name,
                0,
                format!("bad capture ({}, {})", c.function, c.slot),
            ));
        }
    }
    match f.native {
        Some(id) => {
            let desc = program.natives.get(id as usize).ok_or_else(|| {
                VerifyError::new(&f.name, 0, format!("unknown native id {}", id))
            })?;
            if desc.signature != f.signature {
                return Err(VerifyError::new(&f.name, 0, "native descriptor signature differs"));
            }
            if !f.code.is_empty() {
                return Err(VerifyError::new(&f.name, 0, "native function has bytecode"));
            }
        }
        None if f.code.is_empty() => {
            return Err(VerifyError::new(&f.name, 0, "empty function body"));
        }
        None => {}
    }
    Ok(())
}

/// Abstract interpretation of one function.
pub fn verify_function(program: &Program, f: &Function) -> Result<(), VerifyError> {
    if f.native.is_some() {
        return Ok(());
    }

    let code = f.code.bytes();
    let instrs = decode_all(code).map_err(|e| {
        let offset = match &e {
            DecodeError::UnknownOpcode { offset, .. }
            | DecodeError::Truncated { offset, .. }
            | DecodeError::JumpOutOfRange { offset, .. } => *offset,
        };
        VerifyError::new(&f.name, offset, e.to_string())
    })?;

    // offset -> instruction index, None for offsets inside an instruction
    let mut index_of = vec![None; code.len()];
    for (i, instr) in instrs.iter().enumerate() {
        index_of[instr.offset] = Some(i);
    }

    let mut states: Vec<Option<Vec<VarType>>> = vec![None; instrs.len()];
    let mut worklist = vec![0usize];
    states[0] = Some(Vec::new());

    while let Some(i) = worklist.pop() {
        let instr = instrs[i];
        let mut stack = states[i].clone().unwrap_or_default();
        let mut v = Step {
            program,
            f,
            instr,
            stack: &mut stack,
        };
        let flow = v.step()?;

        let mut successors = Vec::with_capacity(2);
        if flow.falls_through {
            successors.push(instr.next());
        }
        if let Some(target) = flow.jump {
            successors.push(target);
        }

        for target in successors {
            let Some(j) = index_of.get(target).copied().flatten() else {
                let what = if target >= code.len() {
                    "control falls off the end of the code"
                } else {
                    "jump into the middle of an instruction"
                };
                return Err(VerifyError::new(&f.name, instr.offset, what));
            };
            match &states[j] {
                Some(existing) if *existing != stack => {
                    return Err(VerifyError::new(
                        &f.name,
                        target,
                        format!(
                            "stack mismatch at join: {} vs {}",
                            describe(existing),
                            describe(&stack)
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    states[j] = Some(stack.clone());
                    worklist.push(j);
                }
            }
        }
    }

    trace!(
        function = %f.name,
        instructions = instrs.len(),
        reachable = states.iter().filter(|s| s.is_some()).count(),
        "verified"
    );
    Ok(())
}

fn describe(stack: &[VarType]) -> String {
    let names: Vec<&str> = stack.iter().map(|t| t.name()).collect();
    format!("[{}]", names.join(", "))
}

struct Flow {
    falls_through: bool,
    jump: Option<usize>,
}

struct Step<'a> {
    program: &'a Program,
    f: &'a Function,
    instr: Instr,
    stack: &'a mut Vec<VarType>,
}

impl Step<'_> {
    fn err(&self, message: impl Into<String>) -> VerifyError {
        VerifyError::new(&self.f.name, self.instr.offset, message)
    }

    fn pop(&mut self, expected: VarType) -> Result<(), VerifyError> {
        match self.stack.pop() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(self.err(format!(
                "{} expects {} on the stack, found {}",
                self.instr.op, expected, t
            ))),
            None => Err(self.err(format!("stack underflow in {}", self.instr.op))),
        }
    }

    fn pop_any(&mut self) -> Result<VarType, VerifyError> {
        self.stack
            .pop()
            .ok_or_else(|| self.err(format!("stack underflow in {}", self.instr.op)))
    }

    fn u16_operand(&self) -> Result<u16, VerifyError> {
        match self.instr.operand {
            Operand::U16(v) => Ok(v),
            _ => Err(self.err("missing u16 operand")),
        }
    }

    fn local(&self, expected: VarType) -> Result<(), VerifyError> {
        let slot = self.u16_operand()?;
        match self.f.locals.get(slot as usize) {
            Some(t) if *t == expected => Ok(()),
            Some(t) => Err(self.err(format!("slot {} holds {}, not {}", slot, t, expected))),
            None => Err(self.err(format!("slot {} out of range", slot))),
        }
    }

    fn context(&self, expected: VarType) -> Result<(), VerifyError> {
        let Operand::Ctx { function, slot } = self.instr.operand else {
            return Err(self.err("missing context operand"));
        };
        if self.f.capture_index(function, slot).is_none() {
            return Err(self.err(format!(
                "({}, {}) is not in the capture table",
                function, slot
            )));
        }
        let ty = self
            .program
            .function(function)
            .and_then(|o| o.locals.get(slot as usize))
            .copied();
        match ty {
            Some(t) if t == expected => Ok(()),
            _ => Err(self.err(format!("context ({}, {}) is not {}", function, slot, expected))),
        }
    }

    fn binary(&mut self, ty: VarType, result: VarType) -> Result<(), VerifyError> {
        self.pop(ty)?;
        self.pop(ty)?;
        self.stack.push(result);
        Ok(())
    }

    fn unary(&mut self, from: VarType, to: VarType) -> Result<(), VerifyError> {
        self.pop(from)?;
        self.stack.push(to);
        Ok(())
    }

    fn step(&mut self) -> Result<Flow, VerifyError> {
        use Opcode::*;
        use VarType::{Double as D, Int as I, String as S};

        let mut flow = Flow {
            falls_through: !self.instr.op.ends_block(),
            jump: None,
        };

        match self.instr.op {
            Invalid => return Err(self.err("invalid opcode")),

            Dload | Dload0 | Dload1 | DloadM1 => self.stack.push(D),
            Iload | Iload0 | Iload1 | IloadM1 => self.stack.push(I),
            Sload => {
                let id = self.u16_operand()?;
                if self.program.constants.get(id).is_none() {
                    return Err(self.err(format!("unknown string constant {}", id)));
                }
                self.stack.push(S);
            }
            Sload0 => self.stack.push(S),

            Dadd | Dsub | Dmul | Ddiv => self.binary(D, D)?,
            Iadd | Isub | Imul | Idiv | Imod | Iaor | Iaand | Iaxor => self.binary(I, I)?,
            Dneg => self.unary(D, D)?,
            Ineg => self.unary(I, I)?,

            Iprint => self.pop(I)?,
            Dprint => self.pop(D)?,
            Sprint => self.pop(S)?,

            I2d => self.unary(I, D)?,
            D2i => self.unary(D, I)?,
            S2i => self.unary(S, I)?,

            Swap => {
                let b = self.pop_any()?;
                let a = self.pop_any()?;
                self.stack.push(b);
                self.stack.push(a);
            }
            Pop => {
                self.pop_any()?;
            }

            LoadDvar => {
                self.local(D)?;
                self.stack.push(D);
            }
            LoadIvar => {
                self.local(I)?;
                self.stack.push(I);
            }
            LoadSvar => {
                self.local(S)?;
                self.stack.push(S);
            }
            StoreDvar => {
                self.local(D)?;
                self.pop(D)?;
            }
            StoreIvar => {
                self.local(I)?;
                self.pop(I)?;
            }
            StoreSvar => {
                self.local(S)?;
                self.pop(S)?;
            }

            LoadCtxDvar => {
                self.context(D)?;
                self.stack.push(D);
            }
            LoadCtxIvar => {
                self.context(I)?;
                self.stack.push(I);
            }
            LoadCtxSvar => {
                self.context(S)?;
                self.stack.push(S);
            }
            StoreCtxDvar => {
                self.context(D)?;
                self.pop(D)?;
            }
            StoreCtxIvar => {
                self.context(I)?;
                self.pop(I)?;
            }
            StoreCtxSvar => {
                self.context(S)?;
                self.pop(S)?;
            }

            Dcmp => self.binary(D, I)?,
            Icmp => self.binary(I, I)?,

            Ja => {
                if let Operand::Jump(target) = self.instr.operand {
                    flow.jump = Some(target);
                }
            }
            IfIcmpNe | IfIcmpE | IfIcmpG | IfIcmpGe | IfIcmpL | IfIcmpLe => {
                self.pop(I)?;
                self.pop(I)?;
                if let Operand::Jump(target) = self.instr.operand {
                    flow.jump = Some(target);
                }
            }

            Stop => {}
            Call => {
                let id = self.u16_operand()?;
                let callee = self
                    .program
                    .function(id)
                    .ok_or_else(|| self.err(format!("unknown function id {}", id)))?;
                for c in &callee.captures {
                    if c.function != self.f.id && self.f.capture_index(c.function, c.slot).is_none()
                    {
                        return Err(self.err(format!(
                            "caller cannot provide context ({}, {}) for '{}'",
                            c.function, c.slot, callee.name
                        )));
                    }
                }
                for ty in callee.signature.params.iter().rev() {
                    self.pop(*ty)?;
                }
                if callee.signature.return_type != VarType::Void {
                    self.stack.push(callee.signature.return_type);
                }
            }
            CallNative => {
                let id = self.u16_operand()?;
                let desc = self
                    .program
                    .natives
                    .get(id as usize)
                    .ok_or_else(|| self.err(format!("unknown native id {}", id)))?;
                for ty in desc.signature.params.iter().rev() {
                    self.pop(*ty)?;
                }
                if desc.signature.return_type != VarType::Void {
                    self.stack.push(desc.signature.return_type);
                }
            }
            Return => {
                let ret = self.f.signature.return_type;
                let ok = if ret == VarType::Void {
                    self.stack.is_empty()
                } else {
                    self.stack.len() == 1 && self.stack[0] == ret
                };
                if !ok {
                    return Err(self.err(format!(
                        "RETURN with stack {} in function returning {}",
                        describe(self.stack),
                        ret
                    )));
                }
            }
        }

        Ok(flow)
    }
}
