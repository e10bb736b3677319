#![forbid(unsafe_code)]

mod tree;
mod value;

use miette::SourceSpan;

pub type Span = SourceSpan;

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub use tree::{
    BinOp, ExprId, ExprTree, Function, Identity, Node, NodeKind, Param, Point, Scope, ScopeId,
    ScopeKind, Stmt, StmtKind, UnOp,
};
pub use value::{AbstractValue, Bound, Knowledge, Payload};
