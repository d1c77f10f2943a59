//! Static type resolution.
//!
//! Gives every expression node a [`VarType`] and records the implicit
//! conversions the code generator has to insert after evaluating a node.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::analysis::scope::{FunctionId, Resolution, TOP_FUNCTION};
use crate::bytecode::compile_error::TranslationError;
use crate::lang::node::{
    AssignOp, BinaryOp, Block, Expr, ExprKind, FunctionBody, NodeId, Stmt, StmtKind, UnaryOp,
};
use crate::lang::program::Program;
use crate::lang::types::VarType;

/// Conversion applied to a value right after it has been computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    IntToDouble,
    /// Strings compare by interned id.
    StringToInt,
}

#[derive(Debug, Default)]
pub struct TypeTable {
    types: FxHashMap<NodeId, VarType>,
    conversions: FxHashMap<NodeId, Conversion>,
    /// Type both operands of a binary node have after conversion.
    operand_types: FxHashMap<NodeId, VarType>,
}

impl TypeTable {
    pub fn type_of(&self, id: NodeId) -> VarType {
        self.types.get(&id).copied().unwrap_or(VarType::Invalid)
    }

    pub fn conversion(&self, id: NodeId) -> Option<Conversion> {
        self.conversions.get(&id).copied()
    }

    pub fn operand_type(&self, id: NodeId) -> VarType {
        self.operand_types
            .get(&id)
            .copied()
            .unwrap_or(VarType::Invalid)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Type checks `program` against its resolution.
pub fn check(program: &Program, res: &Resolution) -> Result<TypeTable, TranslationError> {
    let mut checker = Checker {
        res,
        table: TypeTable::default(),
    };
    checker.check_block(&program.body, TOP_FUNCTION)?;
    debug!(
        typed = checker.table.types.len(),
        conversions = checker.table.conversions.len(),
        "type check complete"
    );
    Ok(checker.table)
}

struct Checker<'a> {
    res: &'a Resolution,
    table: TypeTable,
}

impl Checker<'_> {
    fn check_block(&mut self, block: &Block, function: FunctionId) -> Result<(), TranslationError> {
        for stmt in &block.stmts {
            self.check_stmt(stmt, function)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt, function: FunctionId) -> Result<(), TranslationError> {
        match &stmt.kind {
            StmtKind::VarDecl { ty, name, init } => {
                if let Some(init) = init {
                    self.check_expr(init)?;
                    self.coerce(init, *ty, &format!("variable '{}'", name))?;
                }
            }
            StmtKind::Function(decl) => {
                let id = self.res.decls.get(&stmt.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("function '{}' has no id", decl.name))
                })?;
                if let FunctionBody::Block(body) = &decl.body {
                    self.check_block(body, id)?;
                }
            }
            StmtKind::Assign { name, op, value } => {
                let var = self.res.vars.get(&stmt.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("assignment to '{}' is unresolved", name))
                })?;
                let target = self.res.var_type(var);
                self.check_expr(value)?;
                if *op != AssignOp::Set && !target.is_numeric() {
                    return Err(TranslationError::type_error(
                        format!(
                            "operator '{}' requires a numeric variable, '{}' is {}",
                            op.symbol(),
                            name,
                            target
                        ),
                        stmt.span,
                    ));
                }
                self.coerce(value, target, &format!("variable '{}'", name))?;
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.check_condition(cond, "if")?;
                self.check_block(then_block, function)?;
                if let Some(else_block) = else_block {
                    self.check_block(else_block, function)?;
                }
            }
            StmtKind::While { cond, body } => {
                self.check_condition(cond, "while")?;
                self.check_block(body, function)?;
            }
            StmtKind::For {
                var,
                lower,
                upper,
                body,
            } => {
                let var_ref = self.res.vars.get(&stmt.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("loop variable '{}' is unresolved", var))
                })?;
                let var_ty = self.res.var_type(var_ref);
                if var_ty != VarType::Int {
                    return Err(TranslationError::type_error(
                        format!("loop variable '{}' must be int, found {}", var, var_ty),
                        stmt.span,
                    ));
                }
                for bound in [lower, upper] {
                    let ty = self.check_expr(bound)?;
                    if ty != VarType::Int {
                        return Err(TranslationError::type_error(
                            format!("range bound must be int, found {}", ty),
                            bound.span,
                        ));
                    }
                }
                self.check_block(body, function)?;
            }
            StmtKind::Print(args) => {
                for arg in args {
                    self.check_value(arg, "print operand")?;
                }
            }
            StmtKind::Return(value) => {
                let f = self.res.function(function);
                let expected = f.return_type;
                match value {
                    None if expected != VarType::Void => {
                        return Err(TranslationError::type_error(
                            format!("function '{}' must return a {} value", f.name, expected),
                            stmt.span,
                        ));
                    }
                    None => {}
                    Some(value) if expected == VarType::Void => {
                        return Err(TranslationError::type_error(
                            format!("void function '{}' cannot return a value", f.name),
                            value.span,
                        ));
                    }
                    Some(value) => {
                        let name = f.name.clone();
                        self.check_expr(value)?;
                        self.coerce(value, expected, &format!("return of '{}'", name))?;
                    }
                }
            }
            StmtKind::Expr(expr) => {
                self.check_expr(expr)?;
            }
            StmtKind::Block(block) => self.check_block(block, function)?,
        }
        Ok(())
    }

    fn check_condition(&mut self, cond: &Expr, what: &str) -> Result<(), TranslationError> {
        let ty = self.check_expr(cond)?;
        if ty != VarType::Int {
            return Err(TranslationError::type_error(
                format!("{} condition must be int, found {}", what, ty),
                cond.span,
            ));
        }
        Ok(())
    }

    /// Checks `expr` and requires it to produce a value.
    fn check_value(&mut self, expr: &Expr, what: &str) -> Result<VarType, TranslationError> {
        let ty = self.check_expr(expr)?;
        if !ty.is_value() {
            return Err(TranslationError::type_error(
                format!("{} has no value (type {})", what, ty),
                expr.span,
            ));
        }
        Ok(ty)
    }

    /// Makes the already checked `expr` fit `target`, flagging an implicit
    /// int to double widening when needed.
    fn coerce(&mut self, expr: &Expr, target: VarType, what: &str) -> Result<(), TranslationError> {
        let ty = self.table.type_of(expr.id);
        if ty == target && ty.is_value() {
            return Ok(());
        }
        if ty == VarType::Int && target == VarType::Double {
            self.table.conversions.insert(expr.id, Conversion::IntToDouble);
            return Ok(());
        }
        Err(TranslationError::type_error(
            format!("cannot use {} value for {} of type {}", ty, what, target),
            expr.span,
        ))
    }

    fn record(&mut self, expr: &Expr, ty: VarType) -> VarType {
        self.table.types.insert(expr.id, ty);
        ty
    }

    fn check_expr(&mut self, expr: &Expr) -> Result<VarType, TranslationError> {
        let ty = match &expr.kind {
            ExprKind::Int(_) => VarType::Int,
            ExprKind::Double(_) => VarType::Double,
            ExprKind::Str(_) => VarType::String,
            ExprKind::Load(name) => {
                let var = self.res.vars.get(&expr.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("load of '{}' is unresolved", name))
                })?;
                self.res.var_type(var)
            }
            ExprKind::Call { name, args } => {
                let callee = self.res.calls.get(&expr.id).copied().ok_or_else(|| {
                    TranslationError::internal(format!("call of '{}' is unresolved", name))
                })?;
                let f = self.res.function(callee);
                if f.params.len() != args.len() {
                    return Err(TranslationError::type_error(
                        format!(
                            "function '{}' expects {} argument(s), got {}",
                            name,
                            f.params.len(),
                            args.len()
                        ),
                        expr.span,
                    ));
                }
                let params = f.params.clone();
                let return_type = f.return_type;
                for (i, (arg, param)) in args.iter().zip(params).enumerate() {
                    self.check_value(arg, &format!("argument {} of '{}'", i + 1, name))?;
                    self.coerce(arg, param, &format!("argument {} of '{}'", i + 1, name))?;
                }
                return_type
            }
            ExprKind::Unary { op, operand } => {
                let ty = self.check_value(operand, &format!("operand of '{}'", op.symbol()))?;
                match (op, ty) {
                    (UnaryOp::Neg, VarType::Int | VarType::Double) => ty,
                    (UnaryOp::Not, VarType::Int) => VarType::Int,
                    _ => {
                        return Err(TranslationError::type_error(
                            format!("operator '{}' cannot be applied to {}", op.symbol(), ty),
                            expr.span,
                        ));
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.check_binary(expr, *op, lhs, rhs)?,
        };
        Ok(self.record(expr, ty))
    }

    fn check_binary(
        &mut self,
        expr: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<VarType, TranslationError> {
        let what = format!("operand of '{}'", op.symbol());
        let l = self.check_value(lhs, &what)?;
        let r = self.check_value(rhs, &what)?;

        let mismatch = || {
            TranslationError::type_error(
                format!(
                    "operator '{}' cannot be applied to {} and {}",
                    op.symbol(),
                    l,
                    r
                ),
                expr.span,
            )
        };

        let operand = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                self.unify_numeric(lhs, rhs, l, r).ok_or_else(mismatch)?
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                // strings compare by identity, so only for equality
                let equality = matches!(op, BinaryOp::Eq | BinaryOp::Ne);
                if equality && l == VarType::String && r == VarType::String {
                    self.table.conversions.insert(lhs.id, Conversion::StringToInt);
                    self.table.conversions.insert(rhs.id, Conversion::StringToInt);
                    VarType::Int
                } else {
                    self.unify_numeric(lhs, rhs, l, r).ok_or_else(mismatch)?
                }
            }
            BinaryOp::Mod
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::And
            | BinaryOp::Or => {
                if l != VarType::Int || r != VarType::Int {
                    return Err(mismatch());
                }
                VarType::Int
            }
        };

        self.table.operand_types.insert(expr.id, operand);
        Ok(if op.is_comparison() {
            VarType::Int
        } else {
            operand
        })
    }

    /// Int/Double unification: the int side of a mixed pair is widened.
    fn unify_numeric(&mut self, lhs: &Expr, rhs: &Expr, l: VarType, r: VarType) -> Option<VarType> {
        match (l, r) {
            (VarType::Int, VarType::Int) => Some(VarType::Int),
            (VarType::Double, VarType::Double) => Some(VarType::Double),
            (VarType::Int, VarType::Double) => {
                self.table.conversions.insert(lhs.id, Conversion::IntToDouble);
                Some(VarType::Double)
            }
            (VarType::Double, VarType::Int) => {
                self.table.conversions.insert(rhs.id, Conversion::IntToDouble);
                Some(VarType::Double)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::scope::resolve;
    use crate::frontend::parse_program;

    fn typed(source: &str) -> (Program, TypeTable) {
        let program = parse_program(source).expect("parse");
        let res = resolve(&program).expect("resolve");
        let table = check(&program, &res).expect("type check");
        (program, table)
    }

    fn type_err(source: &str) -> TranslationError {
        let program = parse_program(source).expect("parse");
        let res = resolve(&program).expect("resolve");
        check(&program, &res).expect_err("expected type error")
    }

    fn print_arg(program: &Program, index: usize) -> &Expr {
        match &program.body.stmts[index].kind {
            StmtKind::Print(args) => &args[0],
            other => panic!("expected print, got {:?}", other),
        }
    }

    #[test]
    fn test_int_plus_double_is_double() {
        let (program, table) = typed("print(1 + 2.0);");
        let e = print_arg(&program, 0);
        assert_eq!(table.type_of(e.id), VarType::Double);
        match &e.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                assert_eq!(table.conversion(lhs.id), Some(Conversion::IntToDouble));
                assert_eq!(table.conversion(rhs.id), None);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_string_plus_string_rejected() {
        let err = type_err("print('a' + 'b');");
        assert_eq!(err.kind(), "type");
        assert!(err.message().contains("'+'"));
        assert!(err.message().contains("string and string"));
    }

    #[test]
    fn test_comparison_is_int() {
        let (program, table) = typed("print(1.5 < 2);");
        let e = print_arg(&program, 0);
        assert_eq!(table.type_of(e.id), VarType::Int);
        assert_eq!(table.operand_type(e.id), VarType::Double);
    }

    #[test]
    fn test_string_equality_by_id() {
        let (program, table) = typed("print('a' == 'a');");
        let e = print_arg(&program, 0);
        assert_eq!(table.type_of(e.id), VarType::Int);
        match &e.kind {
            ExprKind::Binary { lhs, .. } => {
                assert_eq!(table.conversion(lhs.id), Some(Conversion::StringToInt))
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_string_ordering_rejected() {
        for op in ["<", "<=", ">", ">="] {
            let err = type_err(&format!("print('b' {} 'a');", op));
            assert!(err.message().contains("string and string"), "{}", err);
        }
    }

    #[test]
    fn test_string_vs_number_comparison_rejected() {
        assert!(type_err("print('a' == 1);").message().contains("string and int"));
    }

    #[test]
    fn test_int_only_operators() {
        assert!(type_err("print(1.0 % 2);").message().contains("'%'"));
        assert!(type_err("print(1 && 2.0);").message().contains("'&&'"));
        assert!(type_err("print(!1.0);").message().contains("'!'"));
        assert!(type_err("print(1 ^ 'x');").message().contains("'^'"));
    }

    #[test]
    fn test_every_node_gets_a_concrete_type() {
        let (_, table) = typed("int x = 2; double d = x * 1.5; string s = 'q'; print(x, d, s, -d);");
        assert!(!table.is_empty());
        assert!(
            table
                .types
                .values()
                .all(|t| matches!(t, VarType::Int | VarType::Double | VarType::String | VarType::Void))
        );
    }

    #[test]
    fn test_implicit_widening_on_assignment() {
        let (program, table) = typed("double d = 1; d += 2;");
        match &program.body.stmts[0].kind {
            StmtKind::VarDecl { init: Some(e), .. } => {
                assert_eq!(table.conversion(e.id), Some(Conversion::IntToDouble))
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_narrowing_rejected() {
        let err = type_err("int x = 1.5;");
        assert!(err.message().contains("cannot use double value for variable 'x' of type int"));
        assert!(type_err("int x; x += 0.5;").message().contains("double"));
    }

    #[test]
    fn test_compound_assignment_needs_numeric() {
        assert!(type_err("string s; s += 'x';").message().contains("numeric"));
    }

    #[test]
    fn test_condition_must_be_int() {
        assert!(type_err("if (1.0) { }").message().contains("if condition"));
        assert!(type_err("while ('x') { }").message().contains("while condition"));
    }

    #[test]
    fn test_range_bounds_must_be_int() {
        assert!(type_err("for (i in 0..2.5) { }").message().contains("range bound"));
        assert!(type_err("double i; for (i in 0..2) { }").message().contains("loop variable"));
    }

    #[test]
    fn test_return_checks() {
        assert!(
            type_err("function int f() { return; }")
                .message()
                .contains("must return")
        );
        assert!(
            type_err("function void f() { return 1; }")
                .message()
                .contains("cannot return")
        );
        assert!(
            type_err("function int f() { return 'x'; }")
                .message()
                .contains("return of 'f'")
        );
        typed("function double f() { return 1; }");
    }

    #[test]
    fn test_call_arity_and_argument_types() {
        assert!(
            type_err("function int f(int a) { return a; } f(1, 2);")
                .message()
                .contains("expects 1 argument(s), got 2")
        );
        assert!(
            type_err("function int f(int a) { return a; } f('x');")
                .message()
                .contains("argument 1 of 'f'")
        );
        let (program, table) = typed("function double f(double a) { return a; } print(f(3));");
        match &print_arg(&program, 1).kind {
            ExprKind::Call { args, .. } => {
                assert_eq!(table.conversion(args[0].id), Some(Conversion::IntToDouble))
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_void_call_only_as_statement() {
        typed("function void f() { } f();");
        assert!(type_err("function void f() { } print(f());").message().contains("no value"));
        assert!(type_err("function void f() { } int x = f();").message().contains("void"));
    }
}
