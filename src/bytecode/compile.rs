use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::analysis::scope::{FunctionId, Resolution, TOP_FUNCTION, VarRef, resolve};
use crate::analysis::typeck::{Conversion, TypeTable, check};
use crate::bytecode::compile_error::TranslationError;
use crate::bytecode::ir::{
    Bytecode, ConstantPool, Function, GlobalVar, Label, NativeDescriptor, Program,
};
use crate::bytecode::op::Opcode;
use crate::bytecode::verify::verify_program;
use crate::lang::node::{
    AssignOp, BinaryOp, Block, Expr, ExprKind, FunctionBody, FunctionDecl, Stmt, StmtKind,
    UnaryOp,
};
use crate::lang::program::Program as Ast;
use crate::lang::types::{Signature, VarType};

/// Translates a parsed program: resolve, type check, generate, verify.
pub fn translate(ast: &Ast) -> Result<Program, TranslationError> {
    let res = resolve(ast)?;
    let types = check(ast, &res)?;
    Compiler::new(&res, &types).compile(ast)
}

/// Bytecode generator over a resolved and type checked AST.
pub struct Compiler<'a> {
    res: &'a Resolution,
    types: &'a TypeTable,

    /// Interned string literals
    constants: ConstantPool,

    /// Host functions, one descriptor per distinct (symbol, signature)
    natives: Vec<NativeDescriptor>,

    /// Function id -> native descriptor id
    native_ids: FxHashMap<FunctionId, u16>,

    /// Generated streams, indexed by function id
    bodies: Vec<Option<Bytecode>>,
}

impl<'a> Compiler<'a> {
    pub fn new(res: &'a Resolution, types: &'a TypeTable) -> Self {
        Self {
            res,
            types,
            constants: ConstantPool::new(),
            natives: Vec::new(),
            native_ids: FxHashMap::default(),
            bodies: vec![None; res.functions.len()],
        }
    }

    pub fn compile(mut self, ast: &Ast) -> Result<Program, TranslationError> {
        self.register_natives()?;

        let mut top = Bytecode::new();
        self.compile_block(&ast.body, TOP_FUNCTION, &mut top)?;
        top.emit(Opcode::Stop);
        self.bodies[TOP_FUNCTION as usize] = Some(top);

        let functions = self
            .res
            .functions
            .iter()
            .map(|info| {
                let code = self.bodies[info.id as usize].take().unwrap_or_default();
                trace!(function = %info.name, bytes = code.len(), "generated");
                Function {
                    id: info.id,
                    name: info.name.clone(),
                    signature: Signature::new(info.return_type, info.params.clone()),
                    locals: info.locals.clone(),
                    captures: info.captures.clone(),
                    scope_id: info.scope_id,
                    code,
                    native: self.native_ids.get(&info.id).copied(),
                }
            })
            .collect();

        let top_locals = &self.res.function(TOP_FUNCTION).locals;
        let globals = self
            .res
            .globals
            .iter()
            .map(|(name, slot)| GlobalVar {
                name: name.clone(),
                ty: top_locals[*slot as usize],
                slot: *slot,
            })
            .collect();

        let program = Program {
            functions,
            constants: self.constants,
            natives: self.natives,
            globals,
        };

        verify_program(&program)
            .map_err(|e| TranslationError::internal(format!("generated code rejected: {}", e)))?;

        debug!(
            functions = program.functions.len(),
            constants = program.constants.len(),
            natives = program.natives.len(),
            "translated program"
        );
        Ok(program)
    }

    fn register_natives(&mut self) -> Result<(), TranslationError> {
        for info in &self.res.functions {
            let Some(symbol) = &info.native else {
                continue;
            };
            let signature = Signature::new(info.return_type, info.params.clone());
            let existing = self
                .natives
                .iter()
                .position(|d| d.name == *symbol && d.signature == signature);
            let id = match existing {
                Some(i) => i,
                None => {
                    self.natives.push(NativeDescriptor {
                        name: symbol.clone(),
                        signature,
                    });
                    self.natives.len() - 1
                }
            };
            let id = u16::try_from(id)
                .map_err(|_| TranslationError::internal("too many native functions"))?;
            self.native_ids.insert(info.id, id);
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn compile_block(
        &mut self,
        block: &Block,
        fid: FunctionId,
        code: &mut Bytecode,
    ) -> Result<(), TranslationError> {
        for stmt in &block.stmts {
            self.compile_stmt(stmt, fid, code)?;
        }
        Ok(())
    }

    fn compile_stmt(
        &mut self,
        stmt: &Stmt,
        fid: FunctionId,
        code: &mut Bytecode,
    ) -> Result<(), TranslationError> {
        match &stmt.kind {
            StmtKind::VarDecl { init, .. } => {
                if let Some(init) = init {
                    let var = self.var_of(stmt)?;
                    self.compile_expr(init, fid, code)?;
                    self.store_var(var, fid, code)?;
                }
            }

            StmtKind::Function(decl) => self.compile_function(stmt, decl)?,

            StmtKind::Assign { op, value, .. } => {
                let var = self.var_of(stmt)?;
                let ty = self.res.var_type(var);
                match op {
                    AssignOp::Set => self.compile_expr(value, fid, code)?,
                    AssignOp::Add | AssignOp::Sub => {
                        self.load_var(var, fid, code)?;
                        self.compile_expr(value, fid, code)?;
                        code.emit(match (op, ty) {
                            (AssignOp::Add, VarType::Double) => Opcode::Dadd,
                            (AssignOp::Sub, VarType::Double) => Opcode::Dsub,
                            (AssignOp::Add, _) => Opcode::Iadd,
                            _ => Opcode::Isub,
                        });
                    }
                }
                self.store_var(var, fid, code)?;
            }

            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let mut otherwise = Label::new();
                self.compile_expr(cond, fid, code)?;
                code.emit(Opcode::Iload0);
                code.emit_jump(Opcode::IfIcmpE, &mut otherwise)?;
                self.compile_block(then_block, fid, code)?;
                match else_block {
                    Some(else_block) => {
                        let mut end = Label::new();
                        code.emit_jump(Opcode::Ja, &mut end)?;
                        code.bind(&mut otherwise)?;
                        self.compile_block(else_block, fid, code)?;
                        code.bind(&mut end)?;
                    }
                    None => code.bind(&mut otherwise)?,
                }
            }

            StmtKind::While { cond, body } => {
                let mut top = Label::new();
                let mut end = Label::new();
                code.bind(&mut top)?;
                self.compile_expr(cond, fid, code)?;
                code.emit(Opcode::Iload0);
                code.emit_jump(Opcode::IfIcmpE, &mut end)?;
                self.compile_block(body, fid, code)?;
                code.emit_jump(Opcode::Ja, &mut top)?;
                code.bind(&mut end)?;
            }

            StmtKind::For {
                lower, upper, body, ..
            } => {
                let var = self.var_of(stmt)?;
                let bound = self.res.for_bounds.get(&stmt.id).copied().ok_or_else(|| {
                    TranslationError::internal("for statement has no bound slot")
                })?;

                // both bounds are evaluated once, before the first iteration
                self.compile_expr(lower, fid, code)?;
                self.compile_expr(upper, fid, code)?;
                code.emit_u16(Opcode::StoreIvar, bound);
                self.store_var(var, fid, code)?;

                let mut test = Label::new();
                let mut exit = Label::new();
                code.bind(&mut test)?;
                self.load_var(var, fid, code)?;
                code.emit_u16(Opcode::LoadIvar, bound);
                code.emit_jump(Opcode::IfIcmpG, &mut exit)?;
                self.compile_block(body, fid, code)?;
                // leave before incrementing past an upper bound of i64::MAX
                self.load_var(var, fid, code)?;
                code.emit_u16(Opcode::LoadIvar, bound);
                code.emit_jump(Opcode::IfIcmpE, &mut exit)?;
                self.load_var(var, fid, code)?;
                code.emit(Opcode::Iload1);
                code.emit(Opcode::Iadd);
                self.store_var(var, fid, code)?;
                code.emit_jump(Opcode::Ja, &mut test)?;
                code.bind(&mut exit)?;
            }

            StmtKind::Print(args) => {
                for arg in args {
                    self.compile_expr(arg, fid, code)?;
                    code.emit(match self.types.type_of(arg.id) {
                        VarType::Double => Opcode::Dprint,
                        VarType::String => Opcode::Sprint,
                        _ => Opcode::Iprint,
                    });
                }
            }

            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.compile_expr(value, fid, code)?;
                }
                code.emit(Opcode::Return);
            }

            StmtKind::Expr(expr) => {
                self.compile_expr(expr, fid, code)?;
                if self.types.type_of(expr.id).is_value() {
                    code.emit(Opcode::Pop);
                }
            }

            StmtKind::Block(block) => self.compile_block(block, fid, code)?,
        }
        Ok(())
    }

    fn compile_function(&mut self, stmt: &Stmt, decl: &FunctionDecl) -> Result<(), TranslationError> {
        let id = self.res.decls.get(&stmt.id).copied().ok_or_else(|| {
            TranslationError::internal(format!("function '{}' has no id", decl.name))
        })?;
        let FunctionBody::Block(body) = &decl.body else {
            return Ok(());
        };

        let mut code = Bytecode::new();
        self.compile_block(body, id, &mut code)?;

        // falling off the end returns the type's default value
        match decl.return_type {
            VarType::Int => code.emit(Opcode::Iload0),
            VarType::Double => code.emit(Opcode::Dload0),
            VarType::String => code.emit(Opcode::Sload0),
            _ => {}
        }
        code.emit(Opcode::Return);

        self.bodies[id as usize] = Some(code);
        Ok(())
    }

    fn var_of(&self, stmt: &Stmt) -> Result<VarRef, TranslationError> {
        self.res
            .vars
            .get(&stmt.id)
            .copied()
            .ok_or_else(|| TranslationError::internal(format!("statement {} has no variable", stmt.id)))
    }

    fn load_var(&self, var: VarRef, fid: FunctionId, code: &mut Bytecode) -> Result<(), TranslationError> {
        let (local, ctx) = match self.res.var_type(var) {
            VarType::Int => (Opcode::LoadIvar, Opcode::LoadCtxIvar),
            VarType::Double => (Opcode::LoadDvar, Opcode::LoadCtxDvar),
            VarType::String => (Opcode::LoadSvar, Opcode::LoadCtxSvar),
            ty => return Err(TranslationError::internal(format!("load of {} variable", ty))),
        };
        emit_var_access(var, fid, local, ctx, code);
        Ok(())
    }

    fn store_var(&self, var: VarRef, fid: FunctionId, code: &mut Bytecode) -> Result<(), TranslationError> {
        let (local, ctx) = match self.res.var_type(var) {
            VarType::Int => (Opcode::StoreIvar, Opcode::StoreCtxIvar),
            VarType::Double => (Opcode::StoreDvar, Opcode::StoreCtxDvar),
            VarType::String => (Opcode::StoreSvar, Opcode::StoreCtxSvar),
            ty => return Err(TranslationError::internal(format!("store of {} variable", ty))),
        };
        emit_var_access(var, fid, local, ctx, code);
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Generates `expr` followed by its implicit conversion, if any.
    fn compile_expr(&mut self, expr: &Expr, fid: FunctionId, code: &mut Bytecode) -> Result<(), TranslationError> {
        self.compile_value(expr, fid, code)?;
        match self.types.conversion(expr.id) {
            Some(Conversion::IntToDouble) => code.emit(Opcode::I2d),
            Some(Conversion::StringToInt) => code.emit(Opcode::S2i),
            None => {}
        }
        Ok(())
    }

    fn compile_value(&mut self, expr: &Expr, fid: FunctionId, code: &mut Bytecode) -> Result<(), TranslationError> {
        match &expr.kind {
            ExprKind::Int(v) => code.emit_int(*v),
            ExprKind::Double(v) => code.emit_double(*v),
            ExprKind::Str(s) if s.is_empty() => code.emit(Opcode::Sload0),
            ExprKind::Str(s) => {
                let id = self
                    .constants
                    .intern(s)
                    .ok_or_else(|| TranslationError::internal("string constant pool is full"))?;
                code.emit_u16(Opcode::Sload, id);
            }

            ExprKind::Load(name) => {
                let var = self.res.vars.get(&expr.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("load of '{}' is unresolved", name))
                })?;
                self.load_var(var, fid, code)?;
            }

            ExprKind::Call { name, args } => {
                let callee = self.res.calls.get(&expr.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("call of '{}' is unresolved", name))
                })?;
                for arg in args {
                    self.compile_expr(arg, fid, code)?;
                }
                match self.native_ids.get(&callee) {
                    Some(&nid) => code.emit_u16(Opcode::CallNative, nid),
                    None => code.emit_u16(Opcode::Call, callee),
                }
            }

            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand, fid, code)?;
                match op {
                    UnaryOp::Neg if self.types.type_of(operand.id) == VarType::Double => {
                        code.emit(Opcode::Dneg)
                    }
                    UnaryOp::Neg => code.emit(Opcode::Ineg),
                    UnaryOp::Not => {
                        code.emit(Opcode::Iload0);
                        self.emit_branch_value(Opcode::IfIcmpE, code)?;
                    }
                }
            }

            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::And | BinaryOp::Or => self.compile_logical(*op, lhs, rhs, fid, code)?,
                op if op.is_comparison() => {
                    self.compile_expr(lhs, fid, code)?;
                    self.compile_expr(rhs, fid, code)?;
                    if self.types.operand_type(expr.id) == VarType::Double {
                        self.emit_double_comparison(*op, code)?;
                    } else {
                        self.emit_branch_value(int_branch(*op), code)?;
                    }
                }
                op => {
                    self.compile_expr(lhs, fid, code)?;
                    self.compile_expr(rhs, fid, code)?;
                    let double = self.types.operand_type(expr.id) == VarType::Double;
                    code.emit(arithmetic(*op, double));
                }
            },
        }
        Ok(())
    }

    /// `a b IFxx` into an int 0/1:
    /// `IFxx Ltrue; ILOAD0; JA end; Ltrue: ILOAD1; end:`
    fn emit_branch_value(&self, branch: Opcode, code: &mut Bytecode) -> Result<(), TranslationError> {
        let mut truthy = Label::new();
        let mut end = Label::new();
        code.emit_jump(branch, &mut truthy)?;
        code.emit(Opcode::Iload0);
        code.emit_jump(Opcode::Ja, &mut end)?;
        code.bind(&mut truthy)?;
        code.emit(Opcode::Iload1);
        code.bind(&mut end)
    }

    /// DCMP yields -1, 0 or 1, and 1 when either side is NaN. `>` and `>=`
    /// swap their operands into `<` and `<=` so that every ordering test is
    /// false on NaN.
    fn emit_double_comparison(&self, op: BinaryOp, code: &mut Bytecode) -> Result<(), TranslationError> {
        if matches!(op, BinaryOp::Gt | BinaryOp::Ge) {
            code.emit(Opcode::Swap);
        }
        code.emit(Opcode::Dcmp);
        let (expected, branch) = match op {
            BinaryOp::Eq => (0, Opcode::IfIcmpE),
            BinaryOp::Ne => (0, Opcode::IfIcmpNe),
            BinaryOp::Lt | BinaryOp::Gt => (-1, Opcode::IfIcmpE),
            _ => (1, Opcode::IfIcmpNe),
        };
        code.emit_int(expected);
        self.emit_branch_value(branch, code)
    }

    fn compile_logical(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        fid: FunctionId,
        code: &mut Bytecode,
    ) -> Result<(), TranslationError> {
        // && leaves early on a zero operand, || on a non-zero one
        let (branch, early, late) = match op {
            BinaryOp::And => (Opcode::IfIcmpE, Opcode::Iload0, Opcode::Iload1),
            _ => (Opcode::IfIcmpNe, Opcode::Iload1, Opcode::Iload0),
        };
        let mut short = Label::new();
        let mut end = Label::new();

        for operand in [lhs, rhs] {
            self.compile_expr(operand, fid, code)?;
            code.emit(Opcode::Iload0);
            code.emit_jump(branch, &mut short)?;
        }
        code.emit(late);
        code.emit_jump(Opcode::Ja, &mut end)?;
        code.bind(&mut short)?;
        code.emit(early);
        code.bind(&mut end)
    }
}

fn emit_var_access(var: VarRef, fid: FunctionId, local: Opcode, ctx: Opcode, code: &mut Bytecode) {
    if var.function == fid {
        code.emit_u16(local, var.slot);
    } else {
        code.emit_ctx(ctx, var.function, var.slot);
    }
}

fn int_branch(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Eq => Opcode::IfIcmpE,
        BinaryOp::Ne => Opcode::IfIcmpNe,
        BinaryOp::Lt => Opcode::IfIcmpL,
        BinaryOp::Le => Opcode::IfIcmpLe,
        BinaryOp::Gt => Opcode::IfIcmpG,
        _ => Opcode::IfIcmpGe,
    }
}

fn arithmetic(op: BinaryOp, double: bool) -> Opcode {
    match (op, double) {
        (BinaryOp::Add, true) => Opcode::Dadd,
        (BinaryOp::Sub, true) => Opcode::Dsub,
        (BinaryOp::Mul, true) => Opcode::Dmul,
        (BinaryOp::Div, true) => Opcode::Ddiv,
        (BinaryOp::Add, false) => Opcode::Iadd,
        (BinaryOp::Sub, false) => Opcode::Isub,
        (BinaryOp::Mul, false) => Opcode::Imul,
        (BinaryOp::Div, false) => Opcode::Idiv,
        (BinaryOp::Mod, _) => Opcode::Imod,
        (BinaryOp::BitAnd, _) => Opcode::Iaand,
        (BinaryOp::BitOr, _) => Opcode::Iaor,
        _ => Opcode::Iaxor,
    }
}
