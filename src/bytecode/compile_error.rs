use crate::frontend::lexer::Span;
use crate::frontend::parser_error::ParserError;
use thiserror::Error;

/// First error raised while turning source or an AST into a `Program`.
///
/// Passes run in order (parse, resolve, type check, codegen, verify) and the
/// first failure aborts translation.
#[derive(Debug, Clone, Error)]
pub enum TranslationError {
    /// Lexer or parser failure, surfaced verbatim.
    #[error("syntax error at {0}")]
    Syntax(#[from] ParserError),

    /// Undeclared name, duplicate declaration or illegal capture binding.
    #[error("resolution error at {span}: {message}")]
    Resolution { message: String, span: Span },

    /// Operator, assignment, call or return type mismatch.
    #[error("type error at {span}: {message}")]
    Type { message: String, span: Span },

    /// Generator invariant violation. A defect, not a user error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TranslationError {
    pub fn resolution(message: impl Into<String>, span: Span) -> Self {
        TranslationError::Resolution {
            message: message.into(),
            span,
        }
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        TranslationError::Type {
            message: message.into(),
            span,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        TranslationError::Internal(message.into())
    }

    /// Category name as shown to users.
    pub fn kind(&self) -> &'static str {
        match self {
            TranslationError::Syntax(_) => "syntax",
            TranslationError::Resolution { .. } => "resolution",
            TranslationError::Type { .. } => "type",
            TranslationError::Internal(_) => "internal",
        }
    }

    /// Source position, when the error has one.
    pub fn span(&self) -> Option<Span> {
        match self {
            TranslationError::Syntax(e) => Some(e.span()),
            TranslationError::Resolution { span, .. } | TranslationError::Type { span, .. } => {
                Some(*span)
            }
            TranslationError::Internal(_) => None,
        }
    }

    /// Message without the position prefix.
    pub fn message(&self) -> &str {
        match self {
            TranslationError::Syntax(e) => &e.message,
            TranslationError::Resolution { message, .. }
            | TranslationError::Type { message, .. }
            | TranslationError::Internal(message) => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_display() {
        let err = TranslationError::resolution("undeclared variable 'x'", Span::new(3, 5));
        assert_eq!(
            err.to_string(),
            "resolution error at 3:5: undeclared variable 'x'"
        );
        assert_eq!(err.kind(), "resolution");
        assert_eq!(err.span(), Some(Span::new(3, 5)));
    }

    #[test]
    fn test_type_display() {
        let err = TranslationError::type_error("bad operands", Span::new(1, 2));
        assert!(err.to_string().starts_with("type error at 1:2"));
        assert_eq!(err.message(), "bad operands");
    }

    #[test]
    fn test_syntax_from_parser_error() {
        let err: TranslationError = ParserError {
            message: "expected ';'".to_string(),
            line: 4,
            col: 9,
        }
        .into();
        assert_eq!(err.kind(), "syntax");
        assert_eq!(err.span(), Some(Span::new(4, 9)));
        assert_eq!(err.to_string(), "syntax error at 4:9: expected ';'");
    }

    #[test]
    fn test_internal_has_no_span() {
        let err = TranslationError::internal("jump out of range");
        assert_eq!(err.span(), None);
        assert!(err.to_string().contains("jump out of range"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = TranslationError::internal("test");
        let _: &dyn std::error::Error = &err;
    }
}
