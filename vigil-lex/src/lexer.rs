#![forbid(unsafe_code)]

use logos::Logos;
use miette::Diagnostic;
use thiserror::Error;
use vigil_expr::{span_between, Span};

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Diagnostic)]
#[error("lex error: {message}")]
#[diagnostic(code(vigil::lex))]
pub struct LexError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
enum RawToken {
    #[token("if")]
    KwIf,
    #[token("else")]
    KwElse,
    #[token("while")]
    KwWhile,
    #[token("for")]
    KwFor,
    #[token("do")]
    KwDo,
    #[token("return")]
    KwReturn,

    #[token("true")]
    True,
    #[token("false")]
    False,

    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("->")]
    Arrow,

    #[token("<<=")]
    ShlEq,
    #[token(">>=")]
    ShrEq,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("%=")]
    PercentEq,
    #[token("&=")]
    AmpEq,
    #[token("|=")]
    PipeEq,
    #[token("^=")]
    CaretEq,

    #[token("==")]
    EqEq,
    #[token("!=")]
    Neq,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,

    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(".")]
    Dot,
    #[token("=")]
    Eq,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    #[regex(r"0[xX][0-9a-fA-F]+[uUlL]*", |lex| parse_int(lex.slice(), 16, 2))]
    #[regex(r"0[bB][01]+[uUlL]*", |lex| parse_int(lex.slice(), 2, 2))]
    #[regex(r"[0-9]+[uUlL]*", |lex| parse_int_decimal(lex.slice()))]
    Int(Option<(u64, bool)>),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?[fFlL]?", |lex| parse_float(lex.slice()))]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fFlL]?", |lex| parse_float(lex.slice()))]
    Float(Option<f64>),

    #[regex(r#""([^"\\]|\\.)*""#, parse_string)]
    Str(Option<String>),

    #[regex(r"'([^'\\]|\\.)'", parse_char)]
    Char(Option<char>),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn split_suffix(s: &str) -> (&str, bool) {
    let digits_end = s
        .bytes()
        .rposition(|b| !matches!(b, b'u' | b'U' | b'l' | b'L'))
        .map(|i| i + 1)
        .unwrap_or(s.len());
    let suffix = &s[digits_end..];
    (
        &s[..digits_end],
        suffix.contains('u') || suffix.contains('U'),
    )
}

fn parse_int_decimal(s: &str) -> Option<(u64, bool)> {
    let (digits, unsigned) = split_suffix(s);
    // A leading zero makes the literal octal, as in C.
    if digits.len() > 1 && digits.starts_with('0') {
        let value = u64::from_str_radix(&digits[1..], 8).ok()?;
        return Some((value, unsigned));
    }
    let value = digits.parse::<u64>().ok()?;
    Some((value, unsigned))
}

fn parse_int(s: &str, radix: u32, prefix_len: usize) -> Option<(u64, bool)> {
    let (digits, unsigned) = split_suffix(s);
    let value = u64::from_str_radix(digits.get(prefix_len..)?, radix).ok()?;
    Some((value, unsigned))
}

fn parse_float(s: &str) -> Option<f64> {
    let trimmed = s.trim_end_matches(['f', 'F', 'l', 'L']);
    trimmed.parse::<f64>().ok()
}

fn unescape(c: char) -> Option<char> {
    Some(match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        '\'' => '\'',
        '"' => '"',
        '\\' => '\\',
        _ => return None,
    })
}

fn parse_string(lex: &mut logos::Lexer<RawToken>) -> Option<String> {
    let s = lex.slice();
    let inner = &s[1..s.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(unescape(chars.next()?)?);
    }
    Some(out)
}

fn parse_char(lex: &mut logos::Lexer<RawToken>) -> Option<char> {
    let s = lex.slice();
    let inner = &s[1..s.len().saturating_sub(1)];
    let mut chars = inner.chars();
    let first = chars.next()?;
    let c = if first == '\\' {
        unescape(chars.next()?)?
    } else {
        first
    };
    if chars.next().is_some() {
        return None;
    }
    Some(c)
}

pub struct Lexer<'a> {
    src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src }
    }

    pub fn lex(&self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        let mut lex = RawToken::lexer(self.src);

        while let Some(raw) = lex.next() {
            let sp = lex.span();
            let span = span_between(sp.start, sp.end);

            let kind = match raw {
                Ok(RawToken::KwIf) => TokenKind::KwIf,
                Ok(RawToken::KwElse) => TokenKind::KwElse,
                Ok(RawToken::KwWhile) => TokenKind::KwWhile,
                Ok(RawToken::KwFor) => TokenKind::KwFor,
                Ok(RawToken::KwDo) => TokenKind::KwDo,
                Ok(RawToken::KwReturn) => TokenKind::KwReturn,

                Ok(RawToken::True) => TokenKind::Bool(true),
                Ok(RawToken::False) => TokenKind::Bool(false),

                Ok(RawToken::PlusPlus) => TokenKind::PlusPlus,
                Ok(RawToken::MinusMinus) => TokenKind::MinusMinus,
                Ok(RawToken::Arrow) => TokenKind::Arrow,

                Ok(RawToken::ShlEq) => TokenKind::ShlEq,
                Ok(RawToken::ShrEq) => TokenKind::ShrEq,
                Ok(RawToken::PlusEq) => TokenKind::PlusEq,
                Ok(RawToken::MinusEq) => TokenKind::MinusEq,
                Ok(RawToken::StarEq) => TokenKind::StarEq,
                Ok(RawToken::SlashEq) => TokenKind::SlashEq,
                Ok(RawToken::PercentEq) => TokenKind::PercentEq,
                Ok(RawToken::AmpEq) => TokenKind::AmpEq,
                Ok(RawToken::PipeEq) => TokenKind::PipeEq,
                Ok(RawToken::CaretEq) => TokenKind::CaretEq,

                Ok(RawToken::EqEq) => TokenKind::EqEq,
                Ok(RawToken::Neq) => TokenKind::Neq,
                Ok(RawToken::Le) => TokenKind::Le,
                Ok(RawToken::Ge) => TokenKind::Ge,
                Ok(RawToken::Shl) => TokenKind::Shl,
                Ok(RawToken::Shr) => TokenKind::Shr,
                Ok(RawToken::Lt) => TokenKind::Lt,
                Ok(RawToken::Gt) => TokenKind::Gt,

                Ok(RawToken::AndAnd) => TokenKind::AndAnd,
                Ok(RawToken::OrOr) => TokenKind::OrOr,
                Ok(RawToken::Bang) => TokenKind::Bang,
                Ok(RawToken::Tilde) => TokenKind::Tilde,

                Ok(RawToken::Plus) => TokenKind::Plus,
                Ok(RawToken::Minus) => TokenKind::Minus,
                Ok(RawToken::Star) => TokenKind::Star,
                Ok(RawToken::Slash) => TokenKind::Slash,
                Ok(RawToken::Percent) => TokenKind::Percent,
                Ok(RawToken::Amp) => TokenKind::Amp,
                Ok(RawToken::Pipe) => TokenKind::Pipe,
                Ok(RawToken::Caret) => TokenKind::Caret,

                Ok(RawToken::Question) => TokenKind::Question,
                Ok(RawToken::Colon) => TokenKind::Colon,
                Ok(RawToken::Comma) => TokenKind::Comma,
                Ok(RawToken::Semi) => TokenKind::Semi,
                Ok(RawToken::Dot) => TokenKind::Dot,
                Ok(RawToken::Eq) => TokenKind::Eq,

                Ok(RawToken::LParen) => TokenKind::LParen,
                Ok(RawToken::RParen) => TokenKind::RParen,
                Ok(RawToken::LBrace) => TokenKind::LBrace,
                Ok(RawToken::RBrace) => TokenKind::RBrace,
                Ok(RawToken::LBracket) => TokenKind::LBracket,
                Ok(RawToken::RBracket) => TokenKind::RBracket,

                Ok(RawToken::Ident(s)) => TokenKind::Ident(s),
                Ok(RawToken::Int(Some((value, unsigned)))) => TokenKind::Int { value, unsigned },
                Ok(RawToken::Int(None)) => {
                    return Err(LexError {
                        message: "invalid integer literal".to_string(),
                        span,
                    });
                }
                Ok(RawToken::Float(Some(v))) => TokenKind::Float(v),
                Ok(RawToken::Float(None)) => {
                    return Err(LexError {
                        message: "invalid float literal".to_string(),
                        span,
                    });
                }
                Ok(RawToken::Str(Some(s))) => TokenKind::Str(s),
                Ok(RawToken::Str(None)) => {
                    return Err(LexError {
                        message: "invalid string literal".to_string(),
                        span,
                    });
                }
                Ok(RawToken::Char(Some(c))) => TokenKind::Char(c),
                Ok(RawToken::Char(None)) => {
                    return Err(LexError {
                        message: "invalid character literal".to_string(),
                        span,
                    });
                }

                Err(_) => {
                    return Err(LexError {
                        message: "unexpected token".to_string(),
                        span,
                    });
                }
            };

            tokens.push(Token { kind, span });
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            span: span_between(self.src.len(), self.src.len()),
        });

        Ok(tokens)
    }
}
