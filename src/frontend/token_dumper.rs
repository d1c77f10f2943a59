use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;
use std::fmt::Write;

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints source spelling instead of Debug
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const BLU: &'static str = "\x1b[34m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        print!("{}", self.render(tokens));
    }

    /// Renders one line per token: `[line:col] KIND token`.
    pub fn render(&self, tokens: &[Spanned]) -> String {
        let mut out = String::new();
        for s in tokens {
            self.render_one(&mut out, s);
        }
        out
    }

    fn render_one(&self, out: &mut String, s: &Spanned) {
        let line = s.span.line;
        let col = s.span.col;

        let kind = self.kind(&s.token);
        let colr = if self.color { self.color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        // Writing into a String cannot fail.
        let _ = if self.show_debug_repr {
            writeln!(
                out,
                "[{:02}:{:02}] {}{:<8} {:?}{}",
                line, col, colr, kind, s.token, reset
            )
        } else {
            match &s.token {
                Token::Comment(c) => writeln!(
                    out,
                    "[{:02}:{:02}] {}{:<8} {}{}",
                    line, col, colr, kind, c, reset
                ),
                _ => writeln!(
                    out,
                    "[{:02}:{:02}] {}{:<8} {}{}",
                    line, col, colr, kind, s.token, reset
                ),
            }
        };
    }

    fn kind(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Comment(_) => "COMMENT",
            Eof => "EOF",

            // literals
            Int(_) => "INT",
            Double(_) => "DOUBLE",
            Str(_) => "STRING",

            // names
            Ident(_) => "IDENT",
            KwInt | KwDouble | KwString | KwVoid => "TYPE",

            // structure
            LParen | RParen => "PAREN",
            LBrace | RBrace => "BRACE",
            Comma | Semicolon | DotDot => "PUNCT",

            // ops / comparisons
            Plus | Minus | Star | Slash | Percent => "OP",
            Assign | PlusAssign | MinusAssign => "ASSIGN",
            EqEq | NotEq | Lt | LtEq | Gt | GtEq => "CMP",
            AndAnd | OrOr | Bang | Amp | Pipe | Caret => "LOGIC",

            // everything else = keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Comment(_) | Eof => Self::DIM,
            Str(_) => Self::GRN,
            Int(_) | Double(_) => Self::CYN,
            Ident(_) => Self::YEL,
            KwInt | KwDouble | KwString | KwVoid => Self::BLU,
            Plus | Minus | Star | Slash | Percent => Self::MAG,
            EqEq | NotEq | Lt | LtEq | Gt | GtEq => Self::MAG,
            AndAnd | OrOr | Bang | Amp | Pipe | Caret => Self::MAG,
            _ => Self::RESET,
        }
    }
}
