#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::mem;

use vigil_expr::{
    span_between, BinOp, ExprId, ExprTree, Function, Identity, Node, NodeKind, Param, Point,
    Scope, ScopeId, ScopeKind, Span, Stmt, StmtKind, UnOp,
};
use vigil_lex::{Token, TokenKind};

use crate::error::ParseError;
use crate::identity::assign_compound_identities;

const TYPE_WORDS: &[&str] = &[
    "int", "unsigned", "signed", "char", "short", "long", "float", "double", "bool", "void",
    "size_t", "const",
];

fn is_type_word(s: &str) -> bool {
    TYPE_WORDS.contains(&s)
}

fn type_is_unsigned(ty: &str) -> bool {
    ty.split_whitespace()
        .any(|w| w == "unsigned" || w == "size_t")
}

fn join(a: Span, b: Span) -> Span {
    span_between(a.offset(), b.offset() + b.len())
}

#[derive(Clone, Copy)]
struct DeclInfo {
    identity: Identity,
    unsigned: bool,
}

pub struct Parser<'a> {
    tokens: &'a [Token],
    idx: usize,
    tree: ExprTree,
    scope_stack: Vec<ScopeId>,
    decls: HashMap<ScopeId, HashMap<String, DeclInfo>>,
    globals: HashMap<String, DeclInfo>,
    next_identity: u64,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            idx: 0,
            tree: ExprTree::new(),
            scope_stack: Vec::new(),
            decls: HashMap::new(),
            globals: HashMap::new(),
            next_identity: 1,
        }
    }

    /// Parse a whole snippet: function definitions and top-level statements.
    pub fn parse_unit(&mut self) -> Result<ExprTree, ParseError> {
        let global = self.enter_scope(ScopeKind::Global, None, self.cur_span());
        while !self.at(&TokenKind::Eof) {
            if self.at_function_def() {
                self.parse_function()?;
            } else {
                self.parse_stmt()?;
            }
        }
        self.exit_scope(global);
        let mut tree = mem::take(&mut self.tree);
        assign_compound_identities(&mut tree, &mut self.next_identity);
        Ok(tree)
    }

    /// Parse exactly one expression (used for return-value templates).
    pub fn parse_expr_unit(&mut self) -> Result<(ExprTree, ExprId), ParseError> {
        let global = self.enter_scope(ScopeKind::Global, None, self.cur_span());
        let root = self.parse_expr_comma()?;
        self.expect_kind(&TokenKind::Eof, "end of expression")?;
        self.exit_scope(global);
        let mut tree = mem::take(&mut self.tree);
        assign_compound_identities(&mut tree, &mut self.next_identity);
        Ok((tree, root))
    }

    // Token cursor helpers.

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.idx)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.idx + n)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn cur_span(&self) -> Span {
        self.tokens
            .get(self.idx)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_else(|| span_between(0, 0))
    }

    fn at(&self, kind: &TokenKind) -> bool {
        mem::discriminant(self.peek()) == mem::discriminant(kind)
    }

    fn bump(&mut self) -> Token {
        let tok = self
            .tokens
            .get(self.idx)
            .cloned()
            .unwrap_or(Token {
                kind: TokenKind::Eof,
                span: span_between(0, 0),
            });
        if self.idx < self.tokens.len() {
            self.idx += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_kind(&mut self, kind: &TokenKind, what: &str) -> Result<Span, ParseError> {
        if self.at(kind) {
            Ok(self.bump().span)
        } else {
            Err(ParseError {
                message: format!("expected {what}"),
                span: self.cur_span(),
            })
        }
    }

    // Scope and declaration bookkeeping.

    fn enter_scope(
        &mut self,
        kind: ScopeKind,
        condition: Option<ExprId>,
        span: Span,
    ) -> ScopeId {
        let first = self.tree.end_point();
        let parent = self.scope_stack.last().copied();
        let id = self.tree.push_scope(Scope {
            kind,
            parent,
            condition,
            first,
            end: first,
            span,
        });
        self.scope_stack.push(id);
        id
    }

    fn exit_scope(&mut self, id: ScopeId) {
        debug_assert_eq!(self.scope_stack.last(), Some(&id));
        self.scope_stack.pop();
        let end = self.tree.end_point();
        if let Some(scope) = self.tree.scopes.get_mut(id.0 as usize) {
            scope.end = end;
        }
    }

    fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().expect("scope stack never empty")
    }

    fn fresh_identity(&mut self) -> Identity {
        let id = Identity(self.next_identity);
        self.next_identity += 1;
        id
    }

    fn declare(&mut self, name: &str, unsigned: bool) -> Identity {
        let identity = self.fresh_identity();
        let scope = self.current_scope();
        self.decls
            .entry(scope)
            .or_default()
            .insert(name.to_string(), DeclInfo { identity, unsigned });
        identity
    }

    fn resolve(&mut self, name: &str) -> DeclInfo {
        for scope in self.scope_stack.iter().rev() {
            if let Some(info) = self.decls.get(scope).and_then(|m| m.get(name)) {
                return *info;
            }
        }
        if let Some(info) = self.globals.get(name) {
            return *info;
        }
        let info = DeclInfo {
            identity: self.fresh_identity(),
            unsigned: false,
        };
        self.globals.insert(name.to_string(), info);
        info
    }

    fn push_expr_stmt(&mut self, expr: ExprId, span: Span) -> Point {
        let scope = self.current_scope();
        self.tree.push_stmt(Stmt {
            scope,
            kind: StmtKind::Expr(expr),
            span,
        })
    }

    // Type specifiers.

    fn at_type(&self) -> bool {
        matches!(self.peek(), TokenKind::Ident(s) if is_type_word(s))
    }

    /// Consume type words; returns the joined type string.
    fn parse_type_words(&mut self) -> Result<String, ParseError> {
        let mut words = Vec::new();
        while let TokenKind::Ident(s) = self.peek() {
            if !is_type_word(s) {
                break;
            }
            words.push(s.clone());
            self.bump();
        }
        if words.is_empty() {
            return Err(ParseError {
                message: "expected a type name".to_string(),
                span: self.cur_span(),
            });
        }
        Ok(words.join(" "))
    }

    /// Lookahead: `type ... name ( ... ) {` is a function definition.
    fn at_function_def(&self) -> bool {
        if !self.at_type() {
            return false;
        }
        let mut i = 0;
        while matches!(self.peek_at(i), TokenKind::Ident(s) if is_type_word(s)) {
            i += 1;
        }
        while matches!(self.peek_at(i), TokenKind::Star | TokenKind::Amp) {
            i += 1;
        }
        if !matches!(self.peek_at(i), TokenKind::Ident(_)) {
            return false;
        }
        i += 1;
        if !matches!(self.peek_at(i), TokenKind::LParen) {
            return false;
        }
        let mut depth = 0usize;
        loop {
            match self.peek_at(i) {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(self.peek_at(i + 1), TokenKind::LBrace);
                    }
                }
                TokenKind::Eof => return false,
                _ => {}
            }
            i += 1;
        }
    }

    fn parse_function(&mut self) -> Result<(), ParseError> {
        let start = self.cur_span();
        self.parse_type_words()?;
        while self.eat(&TokenKind::Star) || self.eat(&TokenKind::Amp) {}
        let name = match self.bump() {
            Token {
                kind: TokenKind::Ident(s),
                ..
            } => s,
            tok => {
                return Err(ParseError {
                    message: "expected a function name".to_string(),
                    span: tok.span,
                });
            }
        };
        self.expect_kind(&TokenKind::LParen, "'('")?;

        let body = self.enter_scope(ScopeKind::Function, None, start);
        let mut params = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                let ty = self.parse_type_words()?;
                let mut by_ref = false;
                while self.eat(&TokenKind::Star) || self.eat(&TokenKind::Amp) {
                    by_ref = true;
                }
                // `void` parameter lists have no name.
                if let TokenKind::Ident(pname) = self.peek().clone() {
                    if !is_type_word(&pname) {
                        self.bump();
                        let identity = self.declare(&pname, type_is_unsigned(&ty));
                        params.push(Param {
                            name: pname,
                            identity,
                            by_ref,
                        });
                    }
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect_kind(&TokenKind::RParen, "')'")?;
        self.expect_kind(&TokenKind::LBrace, "'{'")?;
        while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
            self.parse_stmt()?;
        }
        let end = self.expect_kind(&TokenKind::RBrace, "'}'")?;
        self.exit_scope(body);

        self.tree.functions.push(Function {
            name,
            params,
            body,
            span: join(start, end),
        });
        Ok(())
    }

    // Statements.

    fn parse_stmt(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::Semi => {
                self.bump();
                Ok(())
            }
            TokenKind::LBrace => self.parse_braced(ScopeKind::Block, None),
            TokenKind::KwIf => self.parse_if(),
            TokenKind::KwWhile => self.parse_while(),
            TokenKind::KwFor => self.parse_for(),
            TokenKind::KwDo => self.parse_do(),
            TokenKind::KwReturn => self.parse_return(),
            _ if self.at_type() => self.parse_decl(),
            _ => {
                let start = self.cur_span();
                let expr = self.parse_expr_comma()?;
                let end = self.expect_kind(&TokenKind::Semi, "';'")?;
                self.push_expr_stmt(expr, join(start, end));
                Ok(())
            }
        }
    }

    fn parse_braced(
        &mut self,
        kind: ScopeKind,
        condition: Option<ExprId>,
    ) -> Result<(), ParseError> {
        let start = self.expect_kind(&TokenKind::LBrace, "'{'")?;
        let scope = self.enter_scope(kind, condition, start);
        while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
            self.parse_stmt()?;
        }
        self.expect_kind(&TokenKind::RBrace, "'}'")?;
        self.exit_scope(scope);
        Ok(())
    }

    /// Body of a control construct: either a braced block or one statement,
    /// always wrapped in its own scope.
    fn parse_scoped_body(
        &mut self,
        kind: ScopeKind,
        condition: Option<ExprId>,
    ) -> Result<ScopeId, ParseError> {
        if self.at(&TokenKind::LBrace) {
            let start = self.expect_kind(&TokenKind::LBrace, "'{'")?;
            let scope = self.enter_scope(kind, condition, start);
            while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
                self.parse_stmt()?;
            }
            self.expect_kind(&TokenKind::RBrace, "'}'")?;
            self.exit_scope(scope);
            Ok(scope)
        } else {
            let scope = self.enter_scope(kind, condition, self.cur_span());
            self.parse_stmt()?;
            self.exit_scope(scope);
            Ok(scope)
        }
    }

    fn parse_if(&mut self) -> Result<(), ParseError> {
        self.expect_kind(&TokenKind::KwIf, "'if'")?;
        self.expect_kind(&TokenKind::LParen, "'('")?;
        let cond = self.parse_expr_comma()?;
        self.expect_kind(&TokenKind::RParen, "')'")?;
        self.parse_scoped_body(ScopeKind::If, Some(cond))?;
        if self.eat(&TokenKind::KwElse) {
            if self.at(&TokenKind::KwIf) {
                // else-if chains: the nested if lives inside the else scope.
                let scope = self.enter_scope(ScopeKind::Else, Some(cond), self.cur_span());
                self.parse_if()?;
                self.exit_scope(scope);
            } else {
                self.parse_scoped_body(ScopeKind::Else, Some(cond))?;
            }
        }
        Ok(())
    }

    fn parse_while(&mut self) -> Result<(), ParseError> {
        self.expect_kind(&TokenKind::KwWhile, "'while'")?;
        self.expect_kind(&TokenKind::LParen, "'('")?;
        let cond = self.parse_expr_comma()?;
        self.expect_kind(&TokenKind::RParen, "')'")?;
        self.parse_scoped_body(ScopeKind::While, Some(cond))?;
        Ok(())
    }

    fn parse_do(&mut self) -> Result<(), ParseError> {
        self.expect_kind(&TokenKind::KwDo, "'do'")?;
        let scope = self.parse_scoped_body(ScopeKind::Do, None)?;
        self.expect_kind(&TokenKind::KwWhile, "'while'")?;
        self.expect_kind(&TokenKind::LParen, "'('")?;
        let cond = self.parse_expr_comma()?;
        self.expect_kind(&TokenKind::RParen, "')'")?;
        self.expect_kind(&TokenKind::Semi, "';'")?;
        if let Some(s) = self.tree.scopes.get_mut(scope.0 as usize) {
            s.condition = Some(cond);
        }
        Ok(())
    }

    fn parse_for(&mut self) -> Result<(), ParseError> {
        let start = self.expect_kind(&TokenKind::KwFor, "'for'")?;
        self.expect_kind(&TokenKind::LParen, "'('")?;
        let scope = self.enter_scope(ScopeKind::For, None, start);

        // Init clause runs inside the loop scope.
        if !self.eat(&TokenKind::Semi) {
            if self.at_type() {
                self.parse_decl()?;
            } else {
                let s = self.cur_span();
                let expr = self.parse_expr_comma()?;
                let e = self.expect_kind(&TokenKind::Semi, "';'")?;
                self.push_expr_stmt(expr, join(s, e));
            }
        }

        let cond = if self.at(&TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr_comma()?)
        };
        self.expect_kind(&TokenKind::Semi, "';'")?;

        let step = if self.at(&TokenKind::RParen) {
            None
        } else {
            let s = self.cur_span();
            let expr = self.parse_expr_comma()?;
            Some((expr, s))
        };
        self.expect_kind(&TokenKind::RParen, "')'")?;

        if self.at(&TokenKind::LBrace) {
            self.expect_kind(&TokenKind::LBrace, "'{'")?;
            while !self.at(&TokenKind::RBrace) && !self.at(&TokenKind::Eof) {
                self.parse_stmt()?;
            }
            self.expect_kind(&TokenKind::RBrace, "'}'")?;
        } else {
            self.parse_stmt()?;
        }

        if let Some((expr, span)) = step {
            self.push_expr_stmt(expr, span);
        }
        self.exit_scope(scope);
        if let Some(s) = self.tree.scopes.get_mut(scope.0 as usize) {
            s.condition = cond;
        }
        Ok(())
    }

    fn parse_return(&mut self) -> Result<(), ParseError> {
        let start = self.expect_kind(&TokenKind::KwReturn, "'return'")?;
        let value = if self.at(&TokenKind::Semi) {
            None
        } else {
            Some(self.parse_expr_comma()?)
        };
        let end = self.expect_kind(&TokenKind::Semi, "';'")?;
        let scope = self.current_scope();
        self.tree.push_stmt(Stmt {
            scope,
            kind: StmtKind::Return(value),
            span: join(start, end),
        });
        Ok(())
    }

    fn parse_decl(&mut self) -> Result<(), ParseError> {
        let start = self.cur_span();
        let ty = self.parse_type_words()?;
        let unsigned = type_is_unsigned(&ty);
        loop {
            while self.eat(&TokenKind::Star) || self.eat(&TokenKind::Amp) {}
            let name = match self.bump() {
                Token {
                    kind: TokenKind::Ident(s),
                    ..
                } => s,
                tok => {
                    return Err(ParseError {
                        message: "expected a variable name".to_string(),
                        span: tok.span,
                    });
                }
            };
            let identity = self.declare(&name, unsigned);
            let init = if self.eat(&TokenKind::Eq) {
                Some(self.parse_expr_assign()?)
            } else {
                None
            };
            let scope = self.current_scope();
            self.tree.push_stmt(Stmt {
                scope,
                kind: StmtKind::Decl {
                    name,
                    identity,
                    init,
                },
                span: start,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect_kind(&TokenKind::Semi, "';'")?;
        Ok(())
    }

    // Expressions, lowest precedence first.

    pub(crate) fn parse_expr_comma(&mut self) -> Result<ExprId, ParseError> {
        let mut lhs = self.parse_expr_assign()?;
        while self.at(&TokenKind::Comma) {
            let span = self.bump().span;
            let rhs = self.parse_expr_assign()?;
            let id = self.mk(NodeKind::Comma, span);
            self.tree.link(id, Some(lhs), Some(rhs));
            lhs = id;
        }
        Ok(lhs)
    }

    fn parse_expr_assign(&mut self) -> Result<ExprId, ParseError> {
        let lhs = self.parse_ternary()?;
        let op = match self.peek() {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::SlashEq => Some(BinOp::Div),
            TokenKind::PercentEq => Some(BinOp::Mod),
            TokenKind::AmpEq => Some(BinOp::BitAnd),
            TokenKind::PipeEq => Some(BinOp::BitOr),
            TokenKind::CaretEq => Some(BinOp::BitXor),
            TokenKind::ShlEq => Some(BinOp::Shl),
            TokenKind::ShrEq => Some(BinOp::Shr),
            _ => return Ok(lhs),
        };
        let span = self.bump().span;
        let rhs = self.parse_expr_assign()?;
        let id = self.mk(NodeKind::Assign(op), span);
        self.tree.link(id, Some(lhs), Some(rhs));
        Ok(id)
    }

    fn parse_ternary(&mut self) -> Result<ExprId, ParseError> {
        let cond = self.parse_binary(0)?;
        if !self.at(&TokenKind::Question) {
            return Ok(cond);
        }
        let qspan = self.bump().span;
        let then_branch = self.parse_expr_assign()?;
        let cspan = self.expect_kind(&TokenKind::Colon, "':'")?;
        let else_branch = self.parse_expr_assign()?;
        let colon = self.mk(NodeKind::Colon, cspan);
        self.tree.link(colon, Some(then_branch), Some(else_branch));
        let question = self.mk(NodeKind::Question, qspan);
        self.tree.link(question, Some(cond), Some(colon));
        Ok(question)
    }

    fn binary_op(&self) -> Option<(BinOp, u8)> {
        Some(match self.peek() {
            TokenKind::OrOr => (BinOp::Or, 1),
            TokenKind::AndAnd => (BinOp::And, 2),
            TokenKind::Pipe => (BinOp::BitOr, 3),
            TokenKind::Caret => (BinOp::BitXor, 4),
            TokenKind::Amp => (BinOp::BitAnd, 5),
            TokenKind::EqEq => (BinOp::Eq, 6),
            TokenKind::Neq => (BinOp::Ne, 6),
            TokenKind::Lt => (BinOp::Lt, 7),
            TokenKind::Le => (BinOp::Le, 7),
            TokenKind::Gt => (BinOp::Gt, 7),
            TokenKind::Ge => (BinOp::Ge, 7),
            TokenKind::Shl => (BinOp::Shl, 8),
            TokenKind::Shr => (BinOp::Shr, 8),
            TokenKind::Plus => (BinOp::Add, 9),
            TokenKind::Minus => (BinOp::Sub, 9),
            TokenKind::Star => (BinOp::Mul, 10),
            TokenKind::Slash => (BinOp::Div, 10),
            TokenKind::Percent => (BinOp::Mod, 10),
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<ExprId, ParseError> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, prec)) = self.binary_op() {
            if prec < min_prec {
                break;
            }
            let span = self.bump().span;
            let rhs = self.parse_binary(prec + 1)?;
            let id = self.mk(NodeKind::Binary(op), span);
            self.tree.link(id, Some(lhs), Some(rhs));
            lhs = id;
        }
        Ok(lhs)
    }

    fn at_cast(&self) -> bool {
        if !matches!(self.peek(), TokenKind::LParen) {
            return false;
        }
        matches!(self.peek_at(1), TokenKind::Ident(s) if is_type_word(s))
    }

    fn parse_unary(&mut self) -> Result<ExprId, ParseError> {
        let (op, span) = match self.peek() {
            TokenKind::Bang => (UnOp::Not, self.bump().span),
            TokenKind::Tilde => (UnOp::BitNot, self.bump().span),
            TokenKind::Minus => (UnOp::Neg, self.bump().span),
            TokenKind::Plus => (UnOp::Plus, self.bump().span),
            TokenKind::Amp => (UnOp::AddrOf, self.bump().span),
            TokenKind::Star => (UnOp::Deref, self.bump().span),
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let inc = matches!(self.peek(), TokenKind::PlusPlus);
                let span = self.bump().span;
                let operand = self.parse_unary()?;
                let id = self.mk(NodeKind::IncDec { inc, prefix: true }, span);
                self.tree.link(id, Some(operand), None);
                return Ok(id);
            }
            _ if self.at_cast() => {
                let span = self.bump().span; // '('
                let mut ty = self.parse_type_words()?;
                while self.eat(&TokenKind::Star) {
                    ty.push('*');
                }
                self.expect_kind(&TokenKind::RParen, "')'")?;
                let operand = self.parse_unary()?;
                let unsigned = type_is_unsigned(&ty);
                let id = self.mk(NodeKind::Cast { ty }, span);
                self.tree.link(id, Some(operand), None);
                if let Some(n) = self.tree.node_mut(id) {
                    n.unsigned = unsigned;
                }
                return Ok(id);
            }
            _ => return self.parse_postfix(),
        };
        let operand = self.parse_unary()?;
        let id = self.mk(NodeKind::Unary(op), span);
        self.tree.link(id, Some(operand), None);
        Ok(id)
    }

    fn parse_postfix(&mut self) -> Result<ExprId, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    let span = self.bump().span;
                    let mut args = Vec::new();
                    if !self.at(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr_assign()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect_kind(&TokenKind::RParen, "')'")?;
                    let id = self.mk(NodeKind::Call { args: args.clone() }, span);
                    self.tree.link(id, Some(expr), None);
                    for arg in args {
                        if let Some(n) = self.tree.node_mut(arg) {
                            n.parent = Some(id);
                        }
                    }
                    expr = id;
                }
                TokenKind::LBracket => {
                    let span = self.bump().span;
                    let index = self.parse_expr_comma()?;
                    self.expect_kind(&TokenKind::RBracket, "']'")?;
                    let id = self.mk(NodeKind::Index, span);
                    self.tree.link(id, Some(expr), Some(index));
                    expr = id;
                }
                TokenKind::Dot | TokenKind::Arrow => {
                    let span = self.bump().span;
                    let name = match self.bump() {
                        Token {
                            kind: TokenKind::Ident(s),
                            ..
                        } => s,
                        tok => {
                            return Err(ParseError {
                                message: "expected a member name".to_string(),
                                span: tok.span,
                            });
                        }
                    };
                    let id = self.mk(NodeKind::Member { name }, span);
                    self.tree.link(id, Some(expr), None);
                    expr = id;
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let inc = matches!(self.peek(), TokenKind::PlusPlus);
                    let span = self.bump().span;
                    let id = self.mk(NodeKind::IncDec { inc, prefix: false }, span);
                    self.tree.link(id, Some(expr), None);
                    expr = id;
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<ExprId, ParseError> {
        let tok = self.bump();
        match tok.kind {
            TokenKind::Int { value, unsigned } => {
                let id = self.mk(NodeKind::Int(value), tok.span);
                if let Some(n) = self.tree.node_mut(id) {
                    n.unsigned = unsigned;
                }
                Ok(id)
            }
            TokenKind::Float(v) => Ok(self.mk(NodeKind::Float(v), tok.span)),
            TokenKind::Str(s) => Ok(self.mk(NodeKind::Str(s), tok.span)),
            TokenKind::Char(c) => Ok(self.mk(NodeKind::Char(c), tok.span)),
            TokenKind::Bool(b) => Ok(self.mk(NodeKind::Bool(b), tok.span)),
            TokenKind::Ident(name) => {
                let info = self.resolve(&name);
                let id = self.mk(NodeKind::Name(name), tok.span);
                if let Some(n) = self.tree.node_mut(id) {
                    n.identity = info.identity;
                    n.unsigned = info.unsigned;
                }
                Ok(id)
            }
            TokenKind::LParen => {
                let inner = self.parse_expr_comma()?;
                self.expect_kind(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(ParseError {
                message: "expected an expression".to_string(),
                span: tok.span,
            }),
        }
    }

    fn mk(&mut self, kind: NodeKind, span: Span) -> ExprId {
        self.tree.push_node(Node::new(kind, span))
    }
}

#[cfg(test)]
mod tests {
    use vigil_expr::{BinOp, ExprTree, Identity, NodeKind, ScopeKind};
    use vigil_lex::Lexer;

    use super::Parser;

    fn unit(src: &str) -> ExprTree {
        let tokens = Lexer::new(src).lex().unwrap();
        Parser::new(&tokens).parse_unit().unwrap()
    }

    fn name_identities(tree: &ExprTree, name: &str) -> Vec<Identity> {
        tree.nodes
            .iter()
            .filter(|n| matches!(&n.kind, NodeKind::Name(s) if s == name))
            .map(|n| n.identity)
            .collect()
    }

    #[test]
    fn variable_reads_share_identity() {
        let tree = unit("int x = 1; x = x + 2;");
        let ids = name_identities(&tree, "x");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
        assert!(ids[0].is_some());
    }

    #[test]
    fn shadowing_declarations_get_fresh_identities() {
        let tree = unit("int x = 1; { int x = 2; x; } x;");
        let ids = name_identities(&tree, "x");
        // Inner read binds to the inner declaration, outer read to the
        // outer one.
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn identical_comparisons_share_identity() {
        let tree = unit("int n; if (n > 0) { n; } if (n > 0) { n; }");
        let cmp_ids: Vec<Identity> = tree
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Binary(BinOp::Gt)))
            .map(|n| n.identity)
            .collect();
        assert_eq!(cmp_ids.len(), 2);
        assert_eq!(cmp_ids[0], cmp_ids[1]);
        assert!(cmp_ids[0].is_some());
    }

    #[test]
    fn commuted_operands_do_not_share_identity() {
        let tree = unit("int a; int b; a + b; b + a;");
        let add_ids: Vec<Identity> = tree
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Binary(BinOp::Add)))
            .map(|n| n.identity)
            .collect();
        assert_eq!(add_ids.len(), 2);
        assert_ne!(add_ids[0], add_ids[1]);
    }

    #[test]
    fn calls_and_assignments_have_no_identity() {
        let tree = unit("int x; f(x); x = 3;");
        for node in &tree.nodes {
            if matches!(node.kind, NodeKind::Call { .. } | NodeKind::Assign(_)) {
                assert!(node.identity.is_none());
            }
        }
    }

    #[test]
    fn unsigned_declaration_marks_reads() {
        let tree = unit("unsigned int u; int s; u; s;");
        let u = tree
            .nodes
            .iter()
            .find(|n| matches!(&n.kind, NodeKind::Name(s) if s == "u"))
            .unwrap();
        let s = tree
            .nodes
            .iter()
            .find(|n| matches!(&n.kind, NodeKind::Name(s) if s == "s"))
            .unwrap();
        assert!(u.unsigned);
        assert!(!s.unsigned);
    }

    #[test]
    fn scopes_nest_with_conditions() {
        let tree = unit("int n; if (n > 0) { n = 1; } else { n = 2; } while (n) { n = 0; }");
        let kinds: Vec<ScopeKind> = tree.scopes.iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&ScopeKind::If));
        assert!(kinds.contains(&ScopeKind::Else));
        assert!(kinds.contains(&ScopeKind::While));
        let if_scope = tree
            .scopes
            .iter()
            .find(|s| s.kind == ScopeKind::If)
            .unwrap();
        let else_scope = tree
            .scopes
            .iter()
            .find(|s| s.kind == ScopeKind::Else)
            .unwrap();
        assert_eq!(if_scope.condition, else_scope.condition);
        assert!(if_scope.condition.is_some());
    }

    #[test]
    fn function_definition_binds_params() {
        let tree = unit("int add(int a, int b) { return a + b; } add(1, 2);");
        let f = tree.function("add").unwrap();
        assert_eq!(f.params.len(), 2);
        assert!(f.params.iter().all(|p| p.identity.is_some()));
        assert!(!f.params[0].by_ref);

        let tree = unit("void inc(int *p) { } int v; inc(&v);");
        let f = tree.function("inc").unwrap();
        assert!(f.params[0].by_ref);
    }

    #[test]
    fn ternary_builds_question_colon_pair() {
        let tree = unit("int a; a ? 1 : 2;");
        let q = tree
            .nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Question))
            .unwrap();
        let colon = tree.node(q.rhs.unwrap()).unwrap();
        assert!(matches!(colon.kind, NodeKind::Colon));
    }

    #[test]
    fn for_loop_keeps_body_contiguous() {
        let tree = unit("for (int i = 0; i < 3; i++) { f(i); } int done;");
        let for_scope = tree
            .scopes
            .iter()
            .find(|s| s.kind == ScopeKind::For)
            .unwrap();
        // init, body statement, step all live inside the loop range.
        assert_eq!(for_scope.end.0 - for_scope.first.0, 3);
        assert!(for_scope.condition.is_some());
    }

    #[test]
    fn parse_error_reports_span() {
        let tokens = Lexer::new("int x = ;").lex().unwrap();
        let err = Parser::new(&tokens).parse_unit().unwrap_err();
        assert!(err.message.contains("expected an expression"));
    }
}
