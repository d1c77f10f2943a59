use super::types::VarType;
use crate::frontend::lexer::Span;

/// Identity of an AST node within one parsed program.
///
/// Ids are handed out by the parser in source order; analysis results are
/// stored in side tables keyed by them.
pub type NodeId = u32;

/// An expression. Every expression evaluates to exactly one value of its
/// static type (or nothing, for calls to `void` functions).
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: NodeId,
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    // ───────────────────────────── Literals ─────────────────────────────
    /// Integer literal: `42`.
    Int(i64),

    /// Floating-point literal: `1.5`.
    Double(f64),

    /// String literal: `'text'` or `"text"`.
    Str(String),

    // ───────────────────────────── Access ───────────────────────────────
    /// Read a variable by name.
    Load(String),

    /// Call a script or native function: `name(arg, ...)`.
    Call { name: String, args: Vec<Expr> },

    // ───────────────────────────── Operators ────────────────────────────
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Surface spelling of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    /// Binding power used by the precedence-climbing parser.
    /// Higher binds tighter; all binary operators are left-associative.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 4,
            BinaryOp::And => 5,
            BinaryOp::BitOr => 6,
            BinaryOp::BitXor => 7,
            BinaryOp::BitAnd => 8,
            BinaryOp::Eq | BinaryOp::Ne => 9,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 10,
            BinaryOp::Add | BinaryOp::Sub => 12,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 13,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        }
    }
}

/// Assignment flavour: `=`, `+=` or `-=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
        }
    }
}

/// A statement. Statements leave the operand stack unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub id: NodeId,
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `int x;` or `double d = 1.5;`
    VarDecl {
        ty: VarType,
        name: String,
        init: Option<Expr>,
    },

    /// Nested function declaration.
    Function(FunctionDecl),

    /// `x = e;`, `x += e;`, `x -= e;`
    Assign {
        name: String,
        op: AssignOp,
        value: Expr,
    },

    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },

    While {
        cond: Expr,
        body: Block,
    },

    /// `for (v in lower..upper) body`; the upper bound is inclusive.
    For {
        var: String,
        lower: Expr,
        upper: Expr,
        body: Block,
    },

    /// `print(a, b, ...);` prints each operand without separators.
    Print(Vec<Expr>),

    Return(Option<Expr>),

    /// Expression evaluated for its side effects.
    Expr(Expr),

    Block(Block),
}

/// A lexical block. Opens a new scope for variables and functions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: VarType,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Block),
    /// `native 'symbol';` binds the function to a host function by name.
    Native(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub return_type: VarType,
    pub params: Vec<Param>,
    pub body: FunctionBody,
}
