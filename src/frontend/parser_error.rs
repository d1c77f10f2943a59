use thiserror::Error;

use crate::frontend::lexer::{LexerError, Span};

/// A syntax error with source location.
///
/// `line` and `col` are 1-based positions coming from the lexer spans.
/// For EOF-ish errors (e.g. a missing `}` or `;`), the parser uses the last
/// consumed token's span as a fallback so locations are never `0:0`.
/// Displays as `line:col: message`.
#[derive(Debug, Clone, Error)]
#[error("{line}:{col}: {message}")]
pub struct ParserError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl ParserError {
    pub fn span(&self) -> Span {
        Span::new(self.line, self.col)
    }
}

impl From<LexerError> for ParserError {
    fn from(e: LexerError) -> Self {
        ParserError {
            message: e.message,
            line: e.line,
            col: e.col,
        }
    }
}
