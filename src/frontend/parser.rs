use crate::frontend::lexer::{Span, Spanned};
use crate::frontend::parser_error::ParserError;
use crate::frontend::token::Token;
use crate::lang::node::{
    AssignOp, BinaryOp, Block, Expr, ExprKind, FunctionBody, FunctionDecl, NodeId, Param, Stmt,
    StmtKind, UnaryOp,
};
use crate::lang::program::Program;
use crate::lang::types::VarType;

/// Deepest nesting of blocks, bodies, parentheses and operators accepted.
/// Later passes walk the tree recursively, so this also bounds their depth.
pub const MAX_NESTING: usize = 256;

/// Recursive-descent parser for Cinder.
///
/// The parser consumes a stream of lexed `Spanned` tokens and produces a
/// `Program` whose body is the implicit top-level function.
///
/// Notes:
/// - Comments are filtered out in `Parser::new`.
/// - Binary expressions are parsed by precedence climbing; see
///   [`BinaryOp::precedence`].
/// - Every `Expr` and `Stmt` receives a fresh `NodeId` in source order.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Span of the most recently consumed token.
    ///
    /// Used to provide stable source locations for errors that occur after
    /// advancing past the last token or at end-of-file.
    last_span: Option<Span>,
    next_id: NodeId,
    depth: usize,
}

impl Parser {
    /// Creates a new parser from lexer output.
    pub fn new(tokens: Vec<Spanned>) -> Self {
        let tokens: Vec<Spanned> = tokens
            .into_iter()
            .filter(|t| !matches!(t.token, Token::Comment(_)))
            .collect();
        Parser {
            tokens,
            pos: 0,
            last_span: None,
            next_id: 0,
            depth: 0,
        }
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Spanned> {
        let token = self.tokens.get(self.pos);
        if let Some(s) = token {
            self.last_span = Some(s.span);
        }
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|s| &s.token)
    }

    /// Span of the current token, falling back to the last consumed one.
    fn here(&self) -> Span {
        self.current()
            .map(|s| s.span)
            .or(self.last_span)
            .unwrap_or(Span::new(1, 1))
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Constructs a `ParserError` at the most relevant location.
    ///
    /// Priority:
    /// 1. If `current()` exists, use its span.
    /// 2. Else, use `last_span` (e.g. after falling off the end).
    /// 3. Else, default to (1,1) for truly empty input.
    fn error(&self, message: &str) -> ParserError {
        let span = self.here();
        ParserError {
            message: message.to_string(),
            line: span.line,
            col: span.col,
        }
    }

    fn enter(&mut self) -> Result<(), ParserError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error(&format!("nesting too deep (limit {})", MAX_NESTING)));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn unexpected(&self, expected: &str) -> ParserError {
        match self.peek() {
            Some(tok) => self.error(&format!("expected {}, found '{}'", expected, tok)),
            None => self.error(&format!("expected {}, found end of input", expected)),
        }
    }

    /// Consumes `expected` or fails with a positioned error.
    fn expect(&mut self, expected: Token) -> Result<Span, ParserError> {
        match self.current() {
            Some(s) if s.token == expected => {
                let span = s.span;
                self.advance();
                Ok(span)
            }
            _ => Err(self.unexpected(&format!("'{}'", expected))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Span), ParserError> {
        match self.current() {
            Some(Spanned {
                token: Token::Ident(name),
                span,
            }) => {
                let result = (name.clone(), *span);
                self.advance();
                Ok(result)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    /// Parses a complete Cinder program.
    ///
    /// The parser stops when it reaches `Token::Eof`.
    pub fn parse(&mut self) -> Result<Program, ParserError> {
        let mut stmts = Vec::new();

        while let Some(tok) = self.peek() {
            if matches!(tok, Token::Eof) {
                break;
            }
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }

        Ok(Program {
            body: Block { stmts },
            node_count: self.next_id,
        })
    }

    /// Parses `{ stmt* }`.
    fn parse_block(&mut self) -> Result<Block, ParserError> {
        self.expect(Token::LBrace)?;
        self.enter()?;
        let mut stmts = Vec::new();

        loop {
            match self.peek() {
                Some(Token::RBrace) => {
                    self.advance();
                    break;
                }
                Some(Token::Eof) | None => {
                    return Err(self.error("unexpected EOF, expected '}'"));
                }
                _ => {
                    if let Some(stmt) = self.parse_statement()? {
                        stmts.push(stmt);
                    }
                }
            }
        }

        self.leave();
        Ok(Block { stmts })
    }

    /// Parses the body of `if`/`while`/`for`: a block, or a single statement
    /// wrapped into its own block.
    fn parse_body(&mut self) -> Result<Block, ParserError> {
        if self.at(&Token::LBrace) {
            return self.parse_block();
        }
        self.enter()?;
        let stmts = self.parse_statement()?.into_iter().collect();
        self.leave();
        Ok(Block { stmts })
    }

    fn type_keyword(token: &Token) -> Option<VarType> {
        match token {
            Token::KwInt => Some(VarType::Int),
            Token::KwDouble => Some(VarType::Double),
            Token::KwString => Some(VarType::String),
            _ => None,
        }
    }

    /// Parses one statement. Returns `None` for an empty statement (`;`).
    fn parse_statement(&mut self) -> Result<Option<Stmt>, ParserError> {
        let span = self.here();
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of input"));
        };

        let kind = match token {
            Token::Semicolon => {
                self.advance();
                return Ok(None);
            }
            Token::KwInt | Token::KwDouble | Token::KwString => self.parse_var_decl()?,
            Token::Function => StmtKind::Function(self.parse_function()?),
            Token::If => self.parse_if()?,
            Token::While => {
                self.advance();
                self.expect(Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(Token::RParen)?;
                let body = self.parse_body()?;
                StmtKind::While { cond, body }
            }
            Token::For => self.parse_for()?,
            Token::Print => {
                self.advance();
                self.expect(Token::LParen)?;
                let args = self.parse_args()?;
                self.expect(Token::Semicolon)?;
                StmtKind::Print(args)
            }
            Token::Return => {
                self.advance();
                let value = if self.at(&Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(Token::Semicolon)?;
                StmtKind::Return(value)
            }
            Token::LBrace => StmtKind::Block(self.parse_block()?),
            Token::Ident(name)
                if matches!(
                    self.peek_next(),
                    Some(Token::Assign | Token::PlusAssign | Token::MinusAssign)
                ) =>
            {
                self.advance();
                let op = match self.advance().map(|s| &s.token) {
                    Some(Token::PlusAssign) => AssignOp::Add,
                    Some(Token::MinusAssign) => AssignOp::Sub,
                    _ => AssignOp::Set,
                };
                let value = self.parse_expr()?;
                self.expect(Token::Semicolon)?;
                StmtKind::Assign { name, op, value }
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect(Token::Semicolon)?;
                StmtKind::Expr(expr)
            }
        };

        let id = self.fresh_id();
        Ok(Some(Stmt { id, span, kind }))
    }

    /// Parses `type name ('=' expr)? ';'`.
    fn parse_var_decl(&mut self) -> Result<StmtKind, ParserError> {
        let ty = self
            .advance()
            .and_then(|s| Self::type_keyword(&s.token))
            .unwrap_or(VarType::Invalid);
        let (name, _) = self.expect_ident("variable name")?;

        let init = if self.at(&Token::Assign) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(Token::Semicolon)?;

        Ok(StmtKind::VarDecl { ty, name, init })
    }

    /// Parses a function declaration:
    ///
    /// ```text
    /// function <type|void> name(<type> p, ...) { ... }
    /// function <type|void> name(<type> p, ...) native 'symbol';
    /// ```
    fn parse_function(&mut self) -> Result<FunctionDecl, ParserError> {
        self.advance(); // consume 'function'

        let return_type = match self.peek() {
            Some(Token::KwVoid) => VarType::Void,
            Some(tok) => match Self::type_keyword(tok) {
                Some(ty) => ty,
                None => return Err(self.unexpected("return type")),
            },
            None => return Err(self.unexpected("return type")),
        };
        self.advance();

        let (name, _) = self.expect_ident("function name")?;

        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if !self.at(&Token::RParen) {
            loop {
                let span = self.here();
                let ty = match self.peek().and_then(Self::type_keyword) {
                    Some(ty) => ty,
                    None => return Err(self.unexpected("parameter type")),
                };
                self.advance();
                let (pname, _) = self.expect_ident("parameter name")?;
                params.push(Param {
                    ty,
                    name: pname,
                    span,
                });
                if self.at(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        let body = if self.at(&Token::Native) {
            self.advance();
            let symbol = match self.current() {
                Some(Spanned {
                    token: Token::Str(s),
                    ..
                }) => s.clone(),
                _ => return Err(self.unexpected("native symbol string")),
            };
            self.advance();
            self.expect(Token::Semicolon)?;
            FunctionBody::Native(symbol)
        } else {
            FunctionBody::Block(self.parse_block()?)
        };

        Ok(FunctionDecl {
            name,
            return_type,
            params,
            body,
        })
    }

    /// Parses `if (cond) body (else (if ... | body))?`.
    fn parse_if(&mut self) -> Result<StmtKind, ParserError> {
        self.advance(); // consume 'if'
        self.expect(Token::LParen)?;
        let cond = self.parse_expr()?;
        self.expect(Token::RParen)?;
        let then_block = self.parse_body()?;

        let else_block = if self.at(&Token::Else) {
            self.advance();
            Some(self.parse_body()?)
        } else {
            None
        };

        Ok(StmtKind::If {
            cond,
            then_block,
            else_block,
        })
    }

    /// Parses `for (v in lower..upper) body`.
    fn parse_for(&mut self) -> Result<StmtKind, ParserError> {
        self.advance(); // consume 'for'
        self.expect(Token::LParen)?;
        let (var, _) = self.expect_ident("loop variable")?;
        self.expect(Token::In)?;
        let lower = self.parse_expr()?;
        self.expect(Token::DotDot)?;
        let upper = self.parse_expr()?;
        self.expect(Token::RParen)?;
        let body = self.parse_body()?;

        Ok(StmtKind::For {
            var,
            lower,
            upper,
            body,
        })
    }

    /// Parses a comma separated list up to and including `)`.
    /// The opening `(` has already been consumed.
    fn parse_args(&mut self) -> Result<Vec<Expr>, ParserError> {
        let mut args = Vec::new();
        if self.at(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.advance();
                }
                Some(Token::RParen) => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }
    }

    pub fn parse_expr(&mut self) -> Result<Expr, ParserError> {
        self.parse_binary(0)
    }

    fn binary_op(token: &Token) -> Option<BinaryOp> {
        Some(match token {
            Token::OrOr => BinaryOp::Or,
            Token::AndAnd => BinaryOp::And,
            Token::Pipe => BinaryOp::BitOr,
            Token::Caret => BinaryOp::BitXor,
            Token::Amp => BinaryOp::BitAnd,
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::LtEq => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::GtEq => BinaryOp::Ge,
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Mod,
            _ => return None,
        })
    }

    /// Precedence climbing: parses operators binding at least `min_prec`.
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParserError> {
        let outer = self.depth;
        let mut lhs = self.parse_unary()?;

        // every fold deepens the left spine
        while let Some(op) = self.peek().and_then(Self::binary_op) {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            let span = self.here();
            self.advance();
            self.enter()?;
            let rhs = self.parse_binary(prec + 1)?;
            let id = self.fresh_id();
            lhs = Expr {
                id,
                span,
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            };
        }

        self.depth = outer;
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParserError> {
        let span = self.here();
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Bang) => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance();

        // Fold `-<literal>` so constants keep their fast load forms.
        if op == UnaryOp::Neg {
            let folded = match self.peek() {
                Some(Token::Int(n)) => Some(ExprKind::Int(n.wrapping_neg())),
                Some(Token::Double(d)) => Some(ExprKind::Double(-d)),
                _ => None,
            };
            if let Some(kind) = folded {
                self.advance();
                let id = self.fresh_id();
                return Ok(Expr { id, span, kind });
            }
        }

        self.enter()?;
        let operand = self.parse_unary()?;
        self.leave();
        let id = self.fresh_id();
        Ok(Expr {
            id,
            span,
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ParserError> {
        let span = self.here();
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of input, expected expression"));
        };

        let kind = match token {
            Token::Int(n) => {
                self.advance();
                ExprKind::Int(n)
            }
            Token::Double(d) => {
                self.advance();
                ExprKind::Double(d)
            }
            Token::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            Token::Ident(name) => {
                self.advance();
                if self.at(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    ExprKind::Call { name, args }
                } else {
                    ExprKind::Load(name)
                }
            }
            Token::LParen => {
                self.advance();
                self.enter()?;
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                self.leave();
                return Ok(inner);
            }
            _ => return Err(self.unexpected("expression")),
        };

        let id = self.fresh_id();
        Ok(Expr { id, span, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(source: &str) -> Program {
        let mut lexer = Lexer::new(source);
        let tokens = lexer.tokenize().unwrap();
        let mut parser = Parser::new(tokens);
        parser.parse().unwrap()
    }

    fn parse_err(source: &str) -> ParserError {
        let mut lexer = Lexer::new(source);
        let tokens = lexer.tokenize().unwrap();
        let mut parser = Parser::new(tokens);
        parser.parse().unwrap_err()
    }

    fn first_expr(source: &str) -> Expr {
        let program = parse(source);
        match &program.body.stmts[0].kind {
            StmtKind::Expr(e) => e.clone(),
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_print() {
        let program = parse("print(2 + 3);");
        assert_eq!(program.body.stmts.len(), 1);
        assert!(matches!(&program.body.stmts[0].kind, StmtKind::Print(args) if args.len() == 1));
    }

    #[test]
    fn test_precedence() {
        let e = first_expr("1 + 2 * 3;");
        match e.kind {
            ExprKind::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => assert!(matches!(
                rhs.kind,
                ExprKind::Binary {
                    op: BinaryOp::Mul,
                    ..
                }
            )),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_left_associativity() {
        let e = first_expr("8 - 4 - 2;");
        match e.kind {
            ExprKind::Binary {
                op: BinaryOp::Sub,
                lhs,
                rhs,
            } => {
                assert!(matches!(lhs.kind, ExprKind::Binary { .. }));
                assert_eq!(rhs.kind, ExprKind::Int(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_logical_binds_looser_than_comparison() {
        let e = first_expr("a < 1 && b > 2 || c;");
        assert!(matches!(
            e.kind,
            ExprKind::Binary {
                op: BinaryOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn test_negative_literal_folded() {
        assert_eq!(first_expr("-1;").kind, ExprKind::Int(-1));
        assert_eq!(first_expr("-2.5;").kind, ExprKind::Double(-2.5));
        assert!(matches!(
            first_expr("-x;").kind,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn test_var_decl_and_assignments() {
        let program = parse("int x = 1; x += 2; x -= 1; x = 0;");
        let kinds: Vec<_> = program.body.stmts.iter().map(|s| &s.kind).collect();
        assert!(matches!(kinds[0], StmtKind::VarDecl { ty: VarType::Int, init: Some(_), .. }));
        assert!(matches!(kinds[1], StmtKind::Assign { op: AssignOp::Add, .. }));
        assert!(matches!(kinds[2], StmtKind::Assign { op: AssignOp::Sub, .. }));
        assert!(matches!(kinds[3], StmtKind::Assign { op: AssignOp::Set, .. }));
    }

    #[test]
    fn test_function_declaration() {
        let program = parse("function int add(int a, int b) { return a + b; }");
        match &program.body.stmts[0].kind {
            StmtKind::Function(f) => {
                assert_eq!(f.name, "add");
                assert_eq!(f.return_type, VarType::Int);
                assert_eq!(f.params.len(), 2);
                assert!(matches!(&f.body, FunctionBody::Block(b) if b.stmts.len() == 1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_native_function() {
        let program = parse("function double sqrt(double x) native 'sqrt';");
        match &program.body.stmts[0].kind {
            StmtKind::Function(f) => {
                assert_eq!(f.body, FunctionBody::Native("sqrt".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_for_loop() {
        let program = parse("for (i in 1..3) print(i);");
        match &program.body.stmts[0].kind {
            StmtKind::For {
                var, lower, upper, body,
            } => {
                assert_eq!(var, "i");
                assert_eq!(lower.kind, ExprKind::Int(1));
                assert_eq!(upper.kind, ExprKind::Int(3));
                assert_eq!(body.stmts.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_else_if_chain() {
        let program = parse("if (a) { } else if (b) { } else { print(1); }");
        match &program.body.stmts[0].kind {
            StmtKind::If {
                else_block: Some(b),
                ..
            } => assert!(matches!(b.stmts[0].kind, StmtKind::If { .. })),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_node_ids_are_unique() {
        let program = parse("int x = 1 + 2; print(x, f(x));");
        assert!(program.node_count >= 8);
        let mut seen = std::collections::HashSet::new();
        fn walk_expr(e: &Expr, seen: &mut std::collections::HashSet<NodeId>) {
            assert!(seen.insert(e.id));
            match &e.kind {
                ExprKind::Binary { lhs, rhs, .. } => {
                    walk_expr(lhs, seen);
                    walk_expr(rhs, seen);
                }
                ExprKind::Unary { operand, .. } => walk_expr(operand, seen),
                ExprKind::Call { args, .. } => args.iter().for_each(|a| walk_expr(a, seen)),
                _ => {}
            }
        }
        for stmt in &program.body.stmts {
            assert!(seen.insert(stmt.id));
            match &stmt.kind {
                StmtKind::VarDecl { init: Some(e), .. } => walk_expr(e, &mut seen),
                StmtKind::Print(args) => args.iter().for_each(|a| walk_expr(a, &mut seen)),
                _ => {}
            }
        }
        assert!(seen.iter().all(|id| *id < program.node_count));
    }

    #[test]
    fn test_missing_semicolon() {
        let err = parse_err("print(1)");
        assert!(err.message.contains("';'"));
    }

    #[test]
    fn test_missing_closing_brace() {
        let err = parse_err("while (1) { print(1);");
        assert!(err.message.contains("'}'"));
    }

    #[test]
    fn test_error_position() {
        let err = parse_err("int x = 1;\nint = 2;");
        assert_eq!((err.line, err.col), (2, 5));
        assert!(err.message.contains("variable name"));
    }

    #[test]
    fn test_nesting_limit() {
        let ok = format!("print({}1{});", "(".repeat(200), ")".repeat(200));
        parse(&ok);

        let parens = format!("print({}1{});", "(".repeat(2000), ")".repeat(2000));
        let err = parse_err(&parens);
        assert!(err.message.contains("nesting too deep"));
        assert_eq!(err.line, 1);

        let blocks = format!("{}{}", "{".repeat(MAX_NESTING + 1), "}".repeat(MAX_NESTING + 1));
        assert!(parse_err(&blocks).message.contains("nesting too deep"));

        let unary = format!("print({}1);", "!".repeat(5000));
        assert!(parse_err(&unary).message.contains("nesting too deep"));

        let chain = format!("print(1{});", " + 1".repeat(5000));
        assert!(parse_err(&chain).message.contains("nesting too deep"));
    }
}
