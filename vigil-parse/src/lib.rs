#![forbid(unsafe_code)]

mod error;
mod identity;
mod parser;

use miette::IntoDiagnostic;
use vigil_expr::{ExprId, ExprTree};
use vigil_lex::Lexer;

pub use error::ParseError;
pub use parser::Parser;

/// Parse a C-like snippet (statements and function definitions) into an
/// expression graph with identities assigned.
pub fn parse_unit(src: &str) -> miette::Result<ExprTree> {
    let tokens = Lexer::new(src).lex().into_diagnostic()?;
    let mut parser = Parser::new(&tokens);
    parser.parse_unit().into_diagnostic()
}

/// Parse a single expression into its own graph. Returns the graph and the
/// root node. Used for library return-value templates and for tests.
pub fn parse_expr(src: &str) -> miette::Result<(ExprTree, ExprId)> {
    let tokens = Lexer::new(src).lex().into_diagnostic()?;
    let mut parser = Parser::new(&tokens);
    parser.parse_expr_unit().into_diagnostic()
}
