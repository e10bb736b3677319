#![forbid(unsafe_code)]

use vigil_expr::Span;

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Keywords
    KwIf,
    KwElse,
    KwWhile,
    KwFor,
    KwDo,
    KwReturn,

    // Operators / punctuation
    PlusPlus,
    MinusMinus,
    Arrow,

    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    ShlEq,
    ShrEq,

    EqEq,
    Neq,
    Le,
    Ge,
    Lt,
    Gt,

    AndAnd,
    OrOr,
    Bang,
    Tilde,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,

    Question,
    Colon,
    Comma,
    Semi,
    Dot,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    Eof,

    // Literals / identifiers
    Ident(String),
    Int { value: u64, unsigned: bool },
    Float(f64),
    Str(String),
    Char(char),
    Bool(bool),
}
