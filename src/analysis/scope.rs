//! Scope and symbol resolution.
//!
//! Assigns every function an id and every variable a slot in its owning
//! function's frame, binds every name use to its declaration and computes
//! per-function closure capture sets.
//!
//! Scopes live in an arena and point at their parent by index. Results are
//! returned as an immutable [`Resolution`] keyed by AST node id.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytecode::compile_error::TranslationError;
use crate::frontend::lexer::Span;
use crate::lang::node::{Block, Expr, ExprKind, FunctionBody, FunctionDecl, NodeId, Stmt, StmtKind};
use crate::lang::program::Program;
use crate::lang::types::VarType;

pub type FunctionId = u16;
pub type ScopeId = u32;

/// Id of the implicit top-level function.
pub const TOP_FUNCTION: FunctionId = 0;
pub const TOP_FUNCTION_NAME: &str = "<top>";

/// A variable's home: the function owning the frame and the slot in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarRef {
    pub function: FunctionId,
    pub slot: u16,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub id: FunctionId,
    pub name: String,
    pub params: Vec<VarType>,
    pub return_type: VarType,
    /// Slot types; parameters occupy `0..params.len()`.
    pub locals: Vec<VarType>,
    /// Slot names, parallel to `locals`. Hidden slots are named `$...`.
    pub local_names: Vec<String>,
    /// Transitive capture set, sorted.
    pub captures: Vec<VarRef>,
    /// Host symbol for `native` functions.
    pub native: Option<String>,
    /// Scope holding the parameters (the top-level block for `<top>`).
    pub scope_id: ScopeId,
    pub parent: Option<FunctionId>,
    pub span: Span,
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    function: FunctionId,
    vars: FxHashMap<String, u16>,
    functions: FxHashMap<String, FunctionId>,
}

/// Output of [`resolve`].
#[derive(Debug)]
pub struct Resolution {
    pub functions: Vec<FunctionInfo>,
    /// Variable bound by a `Load` expression, an assignment, a declaration
    /// or a `for` statement (its loop variable).
    pub vars: FxHashMap<NodeId, VarRef>,
    /// Callee of a `Call` expression.
    pub calls: FxHashMap<NodeId, FunctionId>,
    /// Function declared by a `Function` statement.
    pub decls: FxHashMap<NodeId, FunctionId>,
    /// Hidden slot caching the upper bound of a `for` statement.
    pub for_bounds: FxHashMap<NodeId, u16>,
    /// Variables of the outermost block, as `(name, slot)` in slot order.
    pub globals: Vec<(String, u16)>,
}

impl Resolution {
    pub fn function(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id as usize]
    }

    pub fn var_type(&self, var: VarRef) -> VarType {
        self.functions
            .get(var.function as usize)
            .and_then(|f| f.locals.get(var.slot as usize))
            .copied()
            .unwrap_or(VarType::Invalid)
    }
}

/// Resolves all names in `program`.
pub fn resolve(program: &Program) -> Result<Resolution, TranslationError> {
    let mut resolver = Resolver::default();
    resolver.run(program)?;
    Ok(resolver.finish())
}

#[derive(Default)]
struct Resolver {
    scopes: Vec<Scope>,
    functions: Vec<FunctionInfo>,
    direct: Vec<BTreeSet<VarRef>>,
    /// Names captured directly by each function, with the first use site.
    captured_names: Vec<FxHashMap<String, Span>>,
    callees: Vec<BTreeSet<FunctionId>>,
    vars: FxHashMap<NodeId, VarRef>,
    calls: FxHashMap<NodeId, FunctionId>,
    decls: FxHashMap<NodeId, FunctionId>,
    for_bounds: FxHashMap<NodeId, u16>,
}

impl Resolver {
    fn run(&mut self, program: &Program) -> Result<(), TranslationError> {
        let top_scope = self.push_scope(None, TOP_FUNCTION);
        self.add_function(
            TOP_FUNCTION_NAME.to_string(),
            Vec::new(),
            VarType::Void,
            None,
            top_scope,
            None,
            Span::new(1, 1),
        )?;

        self.walk_block_in(top_scope, &program.body)?;
        self.check_capture_conflicts(TOP_FUNCTION)?;
        Ok(())
    }

    fn finish(mut self) -> Resolution {
        self.propagate_captures();

        let mut globals: Vec<(String, u16)> = self
            .scopes
            .first()
            .map(|s| s.vars.iter().map(|(n, slot)| (n.clone(), *slot)).collect())
            .unwrap_or_default();
        globals.sort_by_key(|(_, slot)| *slot);

        for (f, set) in self.functions.iter_mut().zip(self.direct.iter()) {
            f.captures = set.iter().copied().collect();
        }

        debug!(
            functions = self.functions.len(),
            scopes = self.scopes.len(),
            globals = globals.len(),
            "resolved program"
        );

        Resolution {
            functions: self.functions,
            vars: self.vars,
            calls: self.calls,
            decls: self.decls,
            for_bounds: self.for_bounds,
            globals,
        }
    }

    /// Grows each function's capture set with its callees' sets until
    /// nothing changes. Pairs owned by the function itself are dropped.
    fn propagate_captures(&mut self) {
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;
            for f in 0..self.functions.len() {
                let callees: Vec<FunctionId> = self.callees[f].iter().copied().collect();
                for callee in callees {
                    if callee as usize == f {
                        continue;
                    }
                    let inherited: Vec<VarRef> = self.direct[callee as usize]
                        .iter()
                        .filter(|v| v.function as usize != f)
                        .copied()
                        .collect();
                    for v in inherited {
                        changed |= self.direct[f].insert(v);
                    }
                }
            }
            if !changed {
                break;
            }
        }
        debug!(rounds, "capture sets stable");
    }

    fn push_scope(&mut self, parent: Option<ScopeId>, function: FunctionId) -> ScopeId {
        let id = self.scopes.len() as ScopeId;
        self.scopes.push(Scope {
            parent,
            function,
            vars: FxHashMap::default(),
            functions: FxHashMap::default(),
        });
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn add_function(
        &mut self,
        name: String,
        params: Vec<VarType>,
        return_type: VarType,
        native: Option<String>,
        scope_id: ScopeId,
        parent: Option<FunctionId>,
        span: Span,
    ) -> Result<FunctionId, TranslationError> {
        let id = FunctionId::try_from(self.functions.len())
            .map_err(|_| TranslationError::resolution("too many functions", span))?;
        self.functions.push(FunctionInfo {
            id,
            name,
            params,
            return_type,
            locals: Vec::new(),
            local_names: Vec::new(),
            captures: Vec::new(),
            native,
            scope_id,
            parent,
            span,
        });
        self.direct.push(BTreeSet::new());
        self.captured_names.push(FxHashMap::default());
        self.callees.push(BTreeSet::new());
        Ok(id)
    }

    fn alloc_slot(
        &mut self,
        function: FunctionId,
        name: &str,
        ty: VarType,
        span: Span,
    ) -> Result<u16, TranslationError> {
        let f = &mut self.functions[function as usize];
        let slot = u16::try_from(f.locals.len()).map_err(|_| {
            TranslationError::resolution(format!("too many locals in '{}'", f.name), span)
        })?;
        f.locals.push(ty);
        f.local_names.push(name.to_string());
        Ok(slot)
    }

    fn declare_var(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: VarType,
        span: Span,
    ) -> Result<VarRef, TranslationError> {
        if self.scopes[scope as usize].vars.contains_key(name) {
            return Err(TranslationError::resolution(
                format!("variable '{}' is already declared in this scope", name),
                span,
            ));
        }
        let function = self.scopes[scope as usize].function;
        let slot = self.alloc_slot(function, name, ty, span)?;
        self.scopes[scope as usize]
            .vars
            .insert(name.to_string(), slot);
        Ok(VarRef { function, slot })
    }

    fn lookup_var(
        &mut self,
        scope: ScopeId,
        name: &str,
        span: Span,
    ) -> Result<VarRef, TranslationError> {
        let current = self.scopes[scope as usize].function;
        let mut cursor = Some(scope);

        while let Some(id) = cursor {
            let s = &self.scopes[id as usize];
            if let Some(&slot) = s.vars.get(name) {
                let var = VarRef {
                    function: s.function,
                    slot,
                };
                if var.function != current {
                    self.direct[current as usize].insert(var);
                    self.captured_names[current as usize]
                        .entry(name.to_string())
                        .or_insert(span);
                }
                return Ok(var);
            }
            cursor = s.parent;
        }

        Err(TranslationError::resolution(
            format!("undeclared variable '{}'", name),
            span,
        ))
    }

    fn lookup_function(&self, scope: ScopeId, name: &str) -> Option<FunctionId> {
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            let s = &self.scopes[id as usize];
            if let Some(&f) = s.functions.get(name) {
                return Some(f);
            }
            cursor = s.parent;
        }
        None
    }

    /// Walks `block` with its statements living directly in `scope`.
    ///
    /// Functions declared in the block are registered first so that calls
    /// may precede definitions.
    fn walk_block_in(&mut self, scope: ScopeId, block: &Block) -> Result<(), TranslationError> {
        for stmt in &block.stmts {
            if let StmtKind::Function(decl) = &stmt.kind {
                self.hoist_function(scope, stmt, decl)?;
            }
        }
        for stmt in &block.stmts {
            self.walk_stmt(scope, stmt)?;
        }
        Ok(())
    }

    fn walk_nested_block(&mut self, parent: ScopeId, block: &Block) -> Result<(), TranslationError> {
        let function = self.scopes[parent as usize].function;
        let scope = self.push_scope(Some(parent), function);
        self.walk_block_in(scope, block)
    }

    fn hoist_function(
        &mut self,
        scope: ScopeId,
        stmt: &Stmt,
        decl: &FunctionDecl,
    ) -> Result<(), TranslationError> {
        if self.scopes[scope as usize]
            .functions
            .contains_key(&decl.name)
        {
            return Err(TranslationError::resolution(
                format!("function '{}' is already declared in this scope", decl.name),
                stmt.span,
            ));
        }

        let parent = self.scopes[scope as usize].function;
        let native = match &decl.body {
            FunctionBody::Native(symbol) => Some(symbol.clone()),
            FunctionBody::Block(_) => None,
        };
        let fn_scope = self.push_scope(Some(scope), TOP_FUNCTION);
        let id = self.add_function(
            decl.name.clone(),
            decl.params.iter().map(|p| p.ty).collect(),
            decl.return_type,
            native,
            fn_scope,
            Some(parent),
            stmt.span,
        )?;
        self.scopes[fn_scope as usize].function = id;

        self.scopes[scope as usize]
            .functions
            .insert(decl.name.clone(), id);
        self.decls.insert(stmt.id, id);
        Ok(())
    }

    fn walk_function(&mut self, stmt: &Stmt, decl: &FunctionDecl) -> Result<(), TranslationError> {
        let id = self.decls.get(&stmt.id).copied().ok_or_else(|| {
            TranslationError::internal(format!("function '{}' was not hoisted", decl.name))
        })?;
        let fn_scope = self.functions[id as usize].scope_id;

        for param in &decl.params {
            self.declare_var(fn_scope, &param.name, param.ty, param.span)?;
        }

        if let FunctionBody::Block(body) = &decl.body {
            self.walk_block_in(fn_scope, body)?;
        }

        self.check_capture_conflicts(id)
    }

    /// A function may not capture a name it also declares itself.
    fn check_capture_conflicts(&self, id: FunctionId) -> Result<(), TranslationError> {
        let f = &self.functions[id as usize];
        let mut conflicts: Vec<(&String, &Span)> = self.captured_names[id as usize]
            .iter()
            .filter(|(name, _)| f.local_names.iter().any(|l| l == *name))
            .collect();
        conflicts.sort_by_key(|(_, span)| (span.line, span.col));

        match conflicts.first() {
            Some((name, span)) => Err(TranslationError::resolution(
                format!(
                    "'{}' is captured from an enclosing function but also declared in '{}'",
                    name, f.name
                ),
                **span,
            )),
            None => Ok(()),
        }
    }

    fn walk_stmt(&mut self, scope: ScopeId, stmt: &Stmt) -> Result<(), TranslationError> {
        match &stmt.kind {
            StmtKind::VarDecl { ty, name, init } => {
                if let Some(init) = init {
                    self.walk_expr(scope, init)?;
                }
                let var = self.declare_var(scope, name, *ty, stmt.span)?;
                self.vars.insert(stmt.id, var);
            }
            StmtKind::Function(decl) => self.walk_function(stmt, decl)?,
            StmtKind::Assign { name, value, .. } => {
                self.walk_expr(scope, value)?;
                let var = self.lookup_var(scope, name, stmt.span)?;
                self.vars.insert(stmt.id, var);
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.walk_expr(scope, cond)?;
                self.walk_nested_block(scope, then_block)?;
                if let Some(else_block) = else_block {
                    self.walk_nested_block(scope, else_block)?;
                }
            }
            StmtKind::While { cond, body } => {
                self.walk_expr(scope, cond)?;
                self.walk_nested_block(scope, body)?;
            }
            StmtKind::For {
                var,
                lower,
                upper,
                body,
            } => {
                self.walk_expr(scope, lower)?;
                self.walk_expr(scope, upper)?;

                let function = self.scopes[scope as usize].function;
                let loop_scope = self.push_scope(Some(scope), function);
                let var_ref = match self.lookup_var(scope, var, stmt.span) {
                    Ok(v) => v,
                    Err(_) => self.declare_var(loop_scope, var, VarType::Int, stmt.span)?,
                };
                self.vars.insert(stmt.id, var_ref);

                let bound = self.alloc_slot(function, "$bound", VarType::Int, stmt.span)?;
                self.for_bounds.insert(stmt.id, bound);

                self.walk_nested_block(loop_scope, body)?;
            }
            StmtKind::Print(args) => {
                for arg in args {
                    self.walk_expr(scope, arg)?;
                }
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.walk_expr(scope, value)?;
                }
            }
            StmtKind::Expr(expr) => self.walk_expr(scope, expr)?,
            StmtKind::Block(block) => self.walk_nested_block(scope, block)?,
        }
        Ok(())
    }

    fn walk_expr(&mut self, scope: ScopeId, expr: &Expr) -> Result<(), TranslationError> {
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Double(_) | ExprKind::Str(_) => {}
            ExprKind::Load(name) => {
                let var = self.lookup_var(scope, name, expr.span)?;
                self.vars.insert(expr.id, var);
            }
            ExprKind::Call { name, args } => {
                for arg in args {
                    self.walk_expr(scope, arg)?;
                }
                let callee = self.lookup_function(scope, name).ok_or_else(|| {
                    TranslationError::resolution(format!("undeclared function '{}'", name), expr.span)
                })?;
                let caller = self.scopes[scope as usize].function;
                self.callees[caller as usize].insert(callee);
                self.calls.insert(expr.id, callee);
            }
            ExprKind::Unary { operand, .. } => self.walk_expr(scope, operand)?,
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(scope, lhs)?;
                self.walk_expr(scope, rhs)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse_program;

    fn resolve_src(source: &str) -> Resolution {
        let program = parse_program(source).expect("parse");
        resolve(&program).expect("resolve")
    }

    fn resolve_err(source: &str) -> TranslationError {
        let program = parse_program(source).expect("parse");
        resolve(&program).expect_err("expected resolution error")
    }

    fn function_named<'a>(res: &'a Resolution, name: &str) -> &'a FunctionInfo {
        res.functions
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("no function {}", name))
    }

    #[test]
    fn test_top_function_and_globals() {
        let res = resolve_src("int a; double b = 1.0; { int hidden; } string c;");
        assert_eq!(res.functions[0].name, TOP_FUNCTION_NAME);
        let names: Vec<&str> = res.globals.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(res.globals[2].1, 3);
        assert_eq!(
            res.functions[0].locals,
            vec![VarType::Int, VarType::Double, VarType::Int, VarType::String]
        );
    }

    #[test]
    fn test_params_take_first_slots() {
        let res = resolve_src("function int f(int a, double b) { int c; return a; }");
        let f = function_named(&res, "f");
        assert_eq!(f.local_names, vec!["a", "b", "c"]);
        assert_eq!(f.params, vec![VarType::Int, VarType::Double]);
        assert_eq!(f.parent, Some(TOP_FUNCTION));
    }

    #[test]
    fn test_slots_not_reused_across_blocks() {
        let res = resolve_src("{ int x; } { int y; }");
        assert_eq!(res.functions[0].locals.len(), 2);
    }

    #[test]
    fn test_call_before_definition() {
        let res = resolve_src("print(f()); function int f() { return 1; }");
        let f = function_named(&res, "f");
        assert!(res.calls.values().any(|id| *id == f.id));
    }

    #[test]
    fn test_mutual_recursion() {
        let res = resolve_src(
            "function int even(int n) { if (n == 0) { return 1; } return odd(n - 1); }
             function int odd(int n) { if (n == 0) { return 0; } return even(n - 1); }",
        );
        assert_eq!(res.functions.len(), 3);
    }

    #[test]
    fn test_direct_capture() {
        let res = resolve_src("int x; function void inc() { x += 1; }");
        let inc = function_named(&res, "inc");
        assert_eq!(
            inc.captures,
            vec![VarRef {
                function: TOP_FUNCTION,
                slot: 0
            }]
        );
        assert!(res.functions[0].captures.is_empty());
    }

    #[test]
    fn test_capture_propagates_through_callers() {
        // g captures f's local; h is nested in f and only calls g, so h must
        // carry the pair too.
        let res = resolve_src(
            "function void f() {
                int v;
                function void g() { v += 1; }
                function void h() { g(); }
                h();
             }",
        );
        let f = function_named(&res, "f");
        let g = function_named(&res, "g");
        let h = function_named(&res, "h");
        let pair = VarRef {
            function: f.id,
            slot: 0,
        };
        assert_eq!(g.captures, vec![pair]);
        assert_eq!(h.captures, vec![pair]);
        assert!(f.captures.is_empty());
    }

    #[test]
    fn test_capture_propagates_across_levels() {
        let res = resolve_src(
            "int x;
             function void a() { function void b() { function void c() { x = 1; } c(); } b(); }",
        );
        for name in ["a", "b", "c"] {
            assert_eq!(function_named(&res, name).captures.len(), 1, "{}", name);
        }
    }

    #[test]
    fn test_for_declares_loop_var() {
        let res = resolve_src("for (i in 1..3) print(i);");
        let top = &res.functions[0];
        assert_eq!(top.local_names, vec!["i", "$bound"]);
        assert!(res.globals.is_empty());
        assert_eq!(res.for_bounds.len(), 1);
    }

    #[test]
    fn test_for_reuses_existing_var() {
        let res = resolve_src("int i; for (i in 1..3) { }");
        assert_eq!(res.functions[0].local_names, vec!["i", "$bound"]);
    }

    #[test]
    fn test_initializer_sees_outer_binding() {
        let res = resolve_src("int x = 1; { int x = x + 1; }");
        assert_eq!(res.functions[0].locals.len(), 2);
    }

    #[test]
    fn test_undeclared_variable() {
        let err = resolve_err("print(y);");
        assert_eq!(err.kind(), "resolution");
        assert!(err.message().contains("undeclared variable 'y'"));
        assert_eq!(err.span(), Some(Span::new(1, 7)));
    }

    #[test]
    fn test_undeclared_function() {
        let err = resolve_err("nope(1);");
        assert!(err.message().contains("undeclared function 'nope'"));
    }

    #[test]
    fn test_duplicate_variable() {
        let err = resolve_err("int x; double x;");
        assert!(err.message().contains("already declared"));
    }

    #[test]
    fn test_duplicate_function() {
        let err = resolve_err("function void f() { } function void f() { }");
        assert!(err.message().contains("function 'f'"));
    }

    #[test]
    fn test_capture_binding_conflict() {
        let err = resolve_err("int x; function void f() { x = 1; int x; }");
        assert!(err.message().contains("captured"));
        assert!(err.message().contains("'x'"));
    }

    #[test]
    fn test_shadowing_param_is_not_a_capture() {
        let res = resolve_src("int x; function int f(int x) { return x; }");
        assert!(function_named(&res, "f").captures.is_empty());
    }

    #[test]
    fn test_native_function_registered() {
        let res = resolve_src("function double sqrt(double x) native 'sqrt';");
        let f = function_named(&res, "sqrt");
        assert_eq!(f.native.as_deref(), Some("sqrt"));
        assert_eq!(f.locals, vec![VarType::Double]);
    }
}
