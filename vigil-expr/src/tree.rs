#![forbid(unsafe_code)]

use crate::value::AbstractValue;
use crate::Span;

/// Index of a node in the expression arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Stable identity of one logical expression occurrence.
///
/// `0` means "no stable identity" and is never used as a state key. Several
/// nodes share an identity when they denote the same runtime entity, e.g.
/// re-reads of the same variable or structurally identical pure
/// expressions over the same operands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub u64);

impl Identity {
    pub const NONE: Identity = Identity(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// A program point: the position just before the statement at this index
/// in the flat, source-ordered statement list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Point(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }

    /// The comparison that holds when the original does not.
    pub fn negated(self) -> Option<BinOp> {
        Some(match self {
            BinOp::Eq => BinOp::Ne,
            BinOp::Ne => BinOp::Eq,
            BinOp::Lt => BinOp::Ge,
            BinOp::Le => BinOp::Gt,
            BinOp::Gt => BinOp::Le,
            BinOp::Ge => BinOp::Lt,
            _ => return None,
        })
    }

    pub fn display(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnOp {
    Not,
    Neg,
    Plus,
    BitNot,
    AddrOf,
    Deref,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// Integer literal, kept unparsed-wide; whether it fits the assumed
    /// signed/unsigned range is decided at evaluation time.
    Int(u64),
    Float(f64),
    Str(String),
    Char(char),
    Bool(bool),
    Name(String),
    Binary(BinOp),
    Unary(UnOp),
    /// `None` is plain `=`; `Some(op)` is the compound `op=` form.
    Assign(Option<BinOp>),
    IncDec { inc: bool, prefix: bool },
    /// `?` node; `lhs` is the condition, `rhs` is the `:` node.
    Question,
    /// `:` node of a ternary; `lhs`/`rhs` are the two branches.
    Colon,
    Comma,
    /// `lhs` is the indexed target, `rhs` the index.
    Index,
    /// Member access; `.` and `->` are normalized to one form.
    Member { name: String },
    Cast { ty: String },
    /// `lhs` is the callee; arguments keep their own links.
    Call { args: Vec<ExprId> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub lhs: Option<ExprId>,
    pub rhs: Option<ExprId>,
    pub parent: Option<ExprId>,
    pub identity: Identity,
    /// Declared or inferred unsignedness of the value this node yields.
    pub unsigned: bool,
    pub span: Span,
    /// Statically-known value annotations from earlier global analysis.
    pub known: Vec<AbstractValue>,
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self {
            kind,
            lhs: None,
            rhs: None,
            parent: None,
            identity: Identity::NONE,
            unsigned: false,
            span,
            known: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    If,
    Else,
    While,
    For,
    Do,
    Block,
}

impl ScopeKind {
    /// Scopes whose body is guarded by a controlling condition.
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            ScopeKind::If | ScopeKind::Else | ScopeKind::While | ScopeKind::For
        )
    }
}

#[derive(Clone, Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    /// Controlling condition for conditional scopes; for `Else` this is
    /// the matching `if` condition (false inside the scope).
    pub condition: Option<ExprId>,
    /// Half-open statement range `[first, end)` covering the scope body,
    /// nested scopes included.
    pub first: Point,
    pub end: Point,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub identity: Identity,
    /// Declared as a pointer or reference.
    pub by_ref: bool,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub body: ScopeId,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Expr(ExprId),
    /// Declaration with optional direct initialization (`init` is the
    /// right-hand side expression).
    Decl {
        name: String,
        identity: Identity,
        init: Option<ExprId>,
    },
    Return(Option<ExprId>),
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub scope: ScopeId,
    pub kind: StmtKind,
    pub span: Span,
}

/// Arena-backed expression graph for one analysis unit.
///
/// Nodes, statements and scopes are all addressed by dense indices; the
/// statement list is flat and source-ordered, so a scope's body is a
/// contiguous range and a `Point` orders against any other `Point`.
#[derive(Clone, Debug, Default)]
pub struct ExprTree {
    pub nodes: Vec<Node>,
    pub stmts: Vec<Stmt>,
    pub scopes: Vec<Scope>,
    pub functions: Vec<Function>,
}

impl ExprTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: ExprId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn node_mut(&mut self, id: ExprId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize)
    }

    pub fn identity(&self, id: ExprId) -> Identity {
        self.node(id).map(|n| n.identity).unwrap_or(Identity::NONE)
    }

    pub fn stmt(&self, p: Point) -> Option<&Stmt> {
        self.stmts.get(p.0 as usize)
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id.0 as usize)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// The scope the statement at `p` belongs to, or the innermost scope
    /// whose range contains `p` when `p` is one past the end.
    pub fn point_scope(&self, p: Point) -> Option<ScopeId> {
        if let Some(stmt) = self.stmt(p) {
            return Some(stmt.scope);
        }
        let mut best: Option<ScopeId> = None;
        for (i, scope) in self.scopes.iter().enumerate() {
            if scope.first <= p && p <= scope.end {
                let id = ScopeId(i as u32);
                match best {
                    Some(b) if self.scope(b).is_some_and(|s| s.first >= scope.first) => {}
                    _ => best = Some(id),
                }
            }
        }
        best
    }

    /// Scope chain from `from` outward to the root, inclusive.
    pub fn scope_chain(&self, from: ScopeId) -> Vec<ScopeId> {
        let mut chain = Vec::new();
        let mut cur = Some(from);
        while let Some(id) = cur {
            chain.push(id);
            cur = self.scope(id).and_then(|s| s.parent);
            if chain.len() > self.scopes.len() {
                break;
            }
        }
        chain
    }

    /// The function whose body contains `p`, if any.
    pub fn function_at(&self, p: Point) -> Option<&Function> {
        let scope = self.point_scope(p)?;
        let chain = self.scope_chain(scope);
        self.functions
            .iter()
            .find(|f| chain.contains(&f.body))
    }

    /// Pre-order walk of the subtree rooted at `id`.
    pub fn subexprs(&self, id: ExprId) -> Vec<ExprId> {
        let mut out = Vec::new();
        let mut work = vec![id];
        while let Some(cur) = work.pop() {
            if out.len() > self.nodes.len() {
                break;
            }
            out.push(cur);
            if let Some(node) = self.node(cur) {
                if let Some(l) = node.lhs {
                    work.push(l);
                }
                if let Some(r) = node.rhs {
                    work.push(r);
                }
                if let NodeKind::Call { args } = &node.kind {
                    work.extend(args.iter().copied());
                }
            }
        }
        out
    }

    /// Any node carrying the given identity, preferring name reads.
    pub fn node_with_identity(&self, identity: Identity) -> Option<ExprId> {
        if identity.is_none() {
            return None;
        }
        let mut fallback = None;
        for (i, node) in self.nodes.iter().enumerate() {
            if node.identity != identity {
                continue;
            }
            if matches!(node.kind, NodeKind::Name(_)) {
                return Some(ExprId(i as u32));
            }
            fallback.get_or_insert(ExprId(i as u32));
        }
        fallback
    }

    /// Identities of every named variable read inside the subtree.
    pub fn variables_in(&self, id: ExprId) -> Vec<Identity> {
        let mut out = Vec::new();
        for sub in self.subexprs(id) {
            if let Some(node) = self.node(sub) {
                if matches!(node.kind, NodeKind::Name(_)) && node.identity.is_some() {
                    if !out.contains(&node.identity) {
                        out.push(node.identity);
                    }
                }
            }
        }
        out
    }

    // Construction API used by the parser and by tests.

    pub fn push_node(&mut self, node: Node) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn link(&mut self, parent: ExprId, lhs: Option<ExprId>, rhs: Option<ExprId>) {
        if let Some(l) = lhs {
            if let Some(n) = self.node_mut(l) {
                n.parent = Some(parent);
            }
        }
        if let Some(r) = rhs {
            if let Some(n) = self.node_mut(r) {
                n.parent = Some(parent);
            }
        }
        if let Some(p) = self.node_mut(parent) {
            p.lhs = lhs;
            p.rhs = rhs;
        }
    }

    pub fn push_stmt(&mut self, stmt: Stmt) -> Point {
        let p = Point(self.stmts.len() as u32);
        self.stmts.push(stmt);
        p
    }

    pub fn push_scope(&mut self, scope: Scope) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope);
        id
    }

    pub fn annotate_known(&mut self, id: ExprId, value: AbstractValue) {
        if let Some(node) = self.node_mut(id) {
            node.known.push(value);
        }
    }

    /// Point one past the last statement (the natural "end of unit" query
    /// point).
    pub fn end_point(&self) -> Point {
        Point(self.stmts.len() as u32)
    }
}
