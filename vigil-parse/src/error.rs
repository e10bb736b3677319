#![forbid(unsafe_code)]

use miette::Diagnostic;
use thiserror::Error;
use vigil_expr::Span;

#[derive(Debug, Error, Diagnostic)]
#[error("parse error: {message}")]
#[diagnostic(code(vigil::parse))]
pub struct ParseError {
    pub message: String,
    #[label]
    pub span: Span,
}
