pub mod lexer;
pub mod parser;
pub mod parser_error;
pub mod token;
pub mod token_dumper;

use crate::lang::program::Program;
use lexer::Lexer;
use parser::Parser;
use parser_error::ParserError;

/// Lexes and parses `source` into a program AST.
///
/// Lexer errors are reported as `ParserError`s with the lexer's position.
pub fn parse_program(source: &str) -> Result<Program, ParserError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}
