#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Double(f64),
    Str(std::string::String),

    // Identifier
    Ident(std::string::String),

    // Type keywords
    KwInt,
    KwDouble,
    KwString,
    KwVoid,

    // Statement keywords
    Function,
    Native,
    If,
    Else,
    While,
    For,
    In,
    Print,
    Return,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Assignment
    Assign,      // =
    PlusAssign,  // +=
    MinusAssign, // -=

    // Comparison
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    // Logic and bitwise
    AndAnd,
    OrOr,
    Bang,
    Amp,
    Pipe,
    Caret,

    // Delimiters
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    DotDot,

    // Trivia (filtered by the parser)
    Comment(std::string::String),

    Eof,
}

impl std::fmt::Display for Token {
    /// Source spelling of the token, used in parser diagnostics.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Token::Int(n) => return write!(f, "{}", n),
            Token::Double(d) => return write!(f, "{}", d),
            Token::Str(s) => return write!(f, "'{}'", s),
            Token::Ident(name) => return write!(f, "{}", name),
            Token::Comment(_) => "comment",
            Token::KwInt => "int",
            Token::KwDouble => "double",
            Token::KwString => "string",
            Token::KwVoid => "void",
            Token::Function => "function",
            Token::Native => "native",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::For => "for",
            Token::In => "in",
            Token::Print => "print",
            Token::Return => "return",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Assign => "=",
            Token::PlusAssign => "+=",
            Token::MinusAssign => "-=",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::LtEq => "<=",
            Token::Gt => ">",
            Token::GtEq => ">=",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Bang => "!",
            Token::Amp => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::DotDot => "..",
            Token::Eof => "end of input",
        };
        f.write_str(s)
    }
}
