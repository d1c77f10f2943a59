use thiserror::Error;

use crate::frontend::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

impl Span {
    pub fn new(line: usize, col: usize) -> Self {
        Span { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, Error)]
#[error("{line}:{col}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn error_at(&self, span: Span, message: impl Into<String>) -> LexerError {
        LexerError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_line_comment(&mut self) -> Token {
        self.advance(); // '/'
        self.advance(); // '/'
        let mut comment = String::new();
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            comment.push(ch);
            self.advance();
        }
        Token::Comment(comment.trim().to_string())
    }

    fn read_block_comment(&mut self) -> Result<Token, LexerError> {
        let start = self.span();
        self.advance(); // '/'
        self.advance(); // '*'
        let mut comment = String::new();
        loop {
            match (self.current(), self.peek()) {
                (Some('*'), Some('/')) => {
                    self.advance();
                    self.advance();
                    return Ok(Token::Comment(comment.trim().to_string()));
                }
                (Some(ch), _) => {
                    comment.push(ch);
                    self.advance();
                }
                (None, _) => return Err(self.error_at(start, "unterminated block comment")),
            }
        }
    }

    /// Reads a string literal delimited by `quote` (`'` or `"`).
    fn read_string(&mut self, quote: char) -> Result<Token, LexerError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some(ch) if ch == quote => {
                    self.advance();
                    return Ok(Token::Str(string));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('\'') => string.push('\''),
                        Some('"') => string.push('"'),
                        Some('0') => string.push('\0'),
                        Some(ch) => {
                            return Err(self.error_at(
                                self.span(),
                                format!("unknown escape sequence: \\{}", ch),
                            ));
                        }
                        None => {
                            return Err(
                                self.error_at(self.span(), "unexpected EOF in escape sequence")
                            );
                        }
                    }
                    self.advance();
                }
                Some('\n') => {
                    return Err(self.error_at(
                        start,
                        "unterminated string (newline before closing quote)",
                    ));
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => return Err(self.error_at(start, "unterminated string literal")),
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexerError> {
        let start = self.span();

        let mut digits = String::new();
        let mut is_double = false;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        // A '.' is a decimal point only when a digit follows; `1..3` is a range.
        if self.current() == Some('.') && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            is_double = true;
            digits.push('.');
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    digits.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        if matches!(self.current(), Some('e') | Some('E')) {
            let sign = self.peek();
            let has_exponent = match sign {
                Some(c) if c.is_ascii_digit() => true,
                Some('+') | Some('-') => self
                    .source
                    .get(self.pos + 2)
                    .is_some_and(|c| c.is_ascii_digit()),
                _ => false,
            };
            if has_exponent {
                is_double = true;
                digits.push('e');
                self.advance();
                if let Some(c @ ('+' | '-')) = self.current() {
                    digits.push(c);
                    self.advance();
                }
                while let Some(ch) = self.current() {
                    if ch.is_ascii_digit() {
                        digits.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        if is_double {
            let value: f64 = digits
                .parse()
                .map_err(|_| self.error_at(start, format!("invalid double literal: {}", digits)))?;
            Ok(Token::Double(value))
        } else {
            let value: i64 = digits
                .parse()
                .map_err(|_| self.error_at(start, format!("invalid int literal: {}", digits)))?;
            Ok(Token::Int(value))
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match ident.as_str() {
            // Types
            "int" => Token::KwInt,
            "double" => Token::KwDouble,
            "string" => Token::KwString,
            "void" => Token::KwVoid,

            // Statements
            "function" => Token::Function,
            "native" => Token::Native,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "in" => Token::In,
            "print" => Token::Print,
            "return" => Token::Return,

            _ => Token::Ident(ident),
        }
    }

    fn read_operator(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::LtEq, 2),
            ('>', Some('=')) => (Token::GtEq, 2),
            ('+', Some('=')) => (Token::PlusAssign, 2),
            ('-', Some('=')) => (Token::MinusAssign, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('.', Some('.')) => (Token::DotDot, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('=', _) => (Token::Assign, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Bang, 1),
            ('&', _) => (Token::Amp, 1),
            ('|', _) => (Token::Pipe, 1),
            ('^', _) => (Token::Caret, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            (',', _) => (Token::Comma, 1),
            (';', _) => (Token::Semicolon, 1),
            _ => return None,
        };

        for _ in 0..width {
            self.advance();
        }
        Some(token)
    }

    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace();
            let span = self.span();

            match self.current() {
                None => {
                    tokens.push(Spanned {
                        token: Token::Eof,
                        span,
                    });
                    break;
                }
                Some('/') if self.peek() == Some('/') => {
                    let token = self.read_line_comment();
                    tokens.push(Spanned { token, span });
                }
                Some('/') if self.peek() == Some('*') => {
                    let token = self.read_block_comment()?;
                    tokens.push(Spanned { token, span });
                }
                Some(quote @ ('"' | '\'')) => {
                    let token = self.read_string(quote)?;
                    tokens.push(Spanned { token, span });
                }
                Some(ch) if ch.is_ascii_digit() => {
                    let token = self.read_number()?;
                    tokens.push(Spanned { token, span });
                }
                Some(ch) if ch.is_alphabetic() || ch == '_' => {
                    let token = self.read_identifier();
                    tokens.push(Spanned { token, span });
                }
                Some(ch) => {
                    if let Some(token) = self.read_operator() {
                        tokens.push(Spanned { token, span });
                    } else {
                        return Err(self.error_at(span, format!("unexpected character: '{}'", ch)));
                    }
                }
            }
        }

        Ok(tokens)
    }
}
