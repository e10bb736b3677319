#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vigil_expr::{
    AbstractValue, BinOp, ExprId, ExprTree, Identity, NodeKind, Point, ScopeKind, StmtKind, UnOp,
};

/// Answers whether an expression's value may have changed between two
/// program points. The engine treats "yes" as an eviction order.
pub trait MutationOracle {
    fn may_change(&self, tree: &ExprTree, expr: ExprId, from: Point, to: Point) -> bool;

    /// Variant that may consult a partial evaluator to skip statements in
    /// provably dead branches.
    fn may_change_with(
        &self,
        tree: &ExprTree,
        expr: ExprId,
        from: Point,
        to: Point,
        eval: &mut dyn FnMut(ExprId) -> AbstractValue,
    ) -> bool {
        let _ = eval;
        self.may_change(tree, expr, from, to)
    }

    /// Whether a call to `callee` may modify the value of `arg` as passed.
    fn call_may_modify(&self, tree: &ExprTree, callee: &str, arg: ExprId) -> bool;
}

/// Per-function knowledge: purity, a textual return-value expression over
/// `arg0..argN`, and container yield classification for member accesses.
pub trait LibraryModel {
    fn is_pure(&self, name: &str) -> bool;
    fn return_value_template(&self, name: &str) -> Option<String>;
    fn container_yield(&self, member: &str) -> Option<ContainerYield>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerYield {
    Size,
    Empty,
    Item,
    IterBegin,
    IterEnd,
}

/// Resolves a comparison when one side is only known through a bound.
pub trait BoundInference {
    /// `known` is the resolved side; `known_is_lhs` says which side of
    /// `op` it sits on. Returns a Known/Impossible boolean when the
    /// comparison is determined regardless of the other side.
    fn infer_comparison(
        &self,
        op: BinOp,
        known: &AbstractValue,
        known_is_lhs: bool,
    ) -> Option<AbstractValue>;
}

/// The maximally conservative collaborator: everything may change, no
/// function is understood, no bound is inferable.
#[derive(Debug, Default)]
pub struct NoOracle;

impl MutationOracle for NoOracle {
    fn may_change(&self, _tree: &ExprTree, _expr: ExprId, from: Point, to: Point) -> bool {
        from != to
    }

    fn call_may_modify(&self, _tree: &ExprTree, _callee: &str, _arg: ExprId) -> bool {
        true
    }
}

impl LibraryModel for NoOracle {
    fn is_pure(&self, _name: &str) -> bool {
        false
    }

    fn return_value_template(&self, _name: &str) -> Option<String> {
        None
    }

    fn container_yield(&self, _member: &str) -> Option<ContainerYield> {
        None
    }
}

impl BoundInference for NoOracle {
    fn infer_comparison(
        &self,
        _op: BinOp,
        _known: &AbstractValue,
        _known_is_lhs: bool,
    ) -> Option<AbstractValue> {
        None
    }
}

/// Syntactic mutation oracle over the parsed graph: a value may change in
/// a statement range iff some statement assigns to one of its variables,
/// takes a variable's address, or passes it to a call by address.
#[derive(Debug, Default)]
pub struct GraphOracle;

impl GraphOracle {
    fn stmt_modifies(tree: &ExprTree, p: Point, watched: &[Identity]) -> bool {
        let Some(stmt) = tree.stmt(p) else {
            return false;
        };
        let roots: Vec<ExprId> = match &stmt.kind {
            StmtKind::Expr(e) => vec![*e],
            StmtKind::Decl { identity, init, .. } => {
                if watched.contains(identity) {
                    return true;
                }
                init.iter().copied().collect()
            }
            StmtKind::Return(e) => e.iter().copied().collect(),
        };
        for root in roots {
            for sub in tree.subexprs(root) {
                let Some(node) = tree.node(sub) else { continue };
                match &node.kind {
                    NodeKind::Assign(_) | NodeKind::IncDec { .. } => {
                        let target = node.lhs;
                        if let Some(t) = target {
                            // Assignment through a pointer may alias
                            // anything.
                            if matches!(
                                tree.node(t).map(|n| &n.kind),
                                Some(NodeKind::Unary(UnOp::Deref)) | Some(NodeKind::Index)
                            ) {
                                return true;
                            }
                            for var in tree.variables_in(t) {
                                if watched.contains(&var) {
                                    return true;
                                }
                            }
                        }
                    }
                    NodeKind::Unary(UnOp::AddrOf) => {
                        if let Some(inner) = node.lhs {
                            for var in tree.variables_in(inner) {
                                if watched.contains(&var) {
                                    return true;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        false
    }

    /// Innermost dead branch covering `p`, if the partial evaluator can
    /// prove its controlling condition false.
    fn in_dead_branch(
        tree: &ExprTree,
        p: Point,
        to: Point,
        eval: &mut dyn FnMut(ExprId) -> AbstractValue,
    ) -> bool {
        let Some(scope) = tree.point_scope(p) else {
            return false;
        };
        for sid in tree.scope_chain(scope) {
            let Some(s) = tree.scope(sid) else { continue };
            // A scope containing the destination is live by construction.
            if s.first <= to && to <= s.end {
                break;
            }
            if !s.kind.is_conditional() {
                continue;
            }
            let Some(cond) = s.condition else { continue };
            let v = eval(cond);
            let dead = if s.kind == ScopeKind::Else {
                v.is_true()
            } else {
                v.is_false()
            };
            if dead {
                return true;
            }
        }
        false
    }
}

impl MutationOracle for GraphOracle {
    fn may_change(&self, tree: &ExprTree, expr: ExprId, from: Point, to: Point) -> bool {
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        let watched = watched_identities(tree, expr);
        if watched.is_empty() {
            return true;
        }
        (lo.0..hi.0).any(|p| Self::stmt_modifies(tree, Point(p), &watched))
    }

    fn may_change_with(
        &self,
        tree: &ExprTree,
        expr: ExprId,
        from: Point,
        to: Point,
        eval: &mut dyn FnMut(ExprId) -> AbstractValue,
    ) -> bool {
        let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
        let watched = watched_identities(tree, expr);
        if watched.is_empty() {
            return true;
        }
        (lo.0..hi.0).any(|p| {
            Self::stmt_modifies(tree, Point(p), &watched)
                && !Self::in_dead_branch(tree, Point(p), hi, eval)
        })
    }

    fn call_may_modify(&self, tree: &ExprTree, _callee: &str, arg: ExprId) -> bool {
        // By-value scalar arguments cannot be written back; an address
        // (or an array/pointer name) can.
        matches!(
            tree.node(arg).map(|n| &n.kind),
            Some(NodeKind::Unary(UnOp::AddrOf))
        )
    }
}

fn watched_identities(tree: &ExprTree, expr: ExprId) -> Vec<Identity> {
    let mut watched = tree.variables_in(expr);
    let identity = tree.identity(expr);
    if identity.is_some() && !watched.contains(&identity) {
        watched.push(identity);
    }
    watched
}

/// Member-name based container model plus the pure built-ins the
/// evaluator knows natively.
#[derive(Debug, Default)]
pub struct StdLibrary;

impl LibraryModel for StdLibrary {
    fn is_pure(&self, name: &str) -> bool {
        crate::builtins::is_builtin(name)
    }

    fn return_value_template(&self, _name: &str) -> Option<String> {
        None
    }

    fn container_yield(&self, member: &str) -> Option<ContainerYield> {
        Some(match member {
            "size" | "length" | "count" => ContainerYield::Size,
            "empty" => ContainerYield::Empty,
            "at" | "front" | "back" => ContainerYield::Item,
            "begin" | "cbegin" => ContainerYield::IterBegin,
            "end" | "cend" => ContainerYield::IterEnd,
            _ => return None,
        })
    }
}

/// A return-value expression compiled once per distinct template string.
#[derive(Debug)]
pub struct CompiledTemplate {
    pub tree: ExprTree,
    pub root: ExprId,
    /// `(argument index, identity of that name in the template tree)`.
    pub args: Vec<(usize, Identity)>,
}

/// Cache of compiled templates. Population is idempotent; a compiled
/// template is immutable afterwards, so handles may be shared freely
/// across concurrent evaluations.
#[derive(Debug, Default)]
pub struct TemplateCache {
    inner: Mutex<HashMap<String, Option<Arc<CompiledTemplate>>>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, template: &str) -> Option<Arc<CompiledTemplate>> {
        if let Ok(cache) = self.inner.lock() {
            if let Some(hit) = cache.get(template) {
                return hit.clone();
            }
        }
        // Compile outside the lock; a racing duplicate build produces an
        // interchangeable value.
        let compiled = compile_template(template);
        if let Ok(mut cache) = self.inner.lock() {
            return cache
                .entry(template.to_string())
                .or_insert(compiled)
                .clone();
        }
        compiled
    }
}

fn compile_template(template: &str) -> Option<Arc<CompiledTemplate>> {
    let (tree, root) = vigil_parse::parse_expr(template).ok()?;
    let mut args = Vec::new();
    for node in &tree.nodes {
        if let NodeKind::Name(name) = &node.kind {
            if let Some(rest) = name.strip_prefix("arg") {
                if let Ok(index) = rest.parse::<usize>() {
                    if !args.iter().any(|(i, _)| *i == index) {
                        args.push((index, node.identity));
                    }
                }
            }
        }
    }
    Some(Arc::new(CompiledTemplate { tree, root, args }))
}

/// Bundle of collaborator handles passed to the evaluator.
pub struct Services<'a> {
    pub oracle: &'a dyn MutationOracle,
    pub library: &'a dyn LibraryModel,
    pub bounds: &'a dyn BoundInference,
    pub templates: &'a TemplateCache,
}

impl<'a> Services<'a> {
    pub fn new(
        oracle: &'a dyn MutationOracle,
        library: &'a dyn LibraryModel,
        bounds: &'a dyn BoundInference,
        templates: &'a TemplateCache,
    ) -> Self {
        Self {
            oracle,
            library,
            bounds,
            templates,
        }
    }
}
