#![forbid(unsafe_code)]

use std::collections::HashMap;

use vigil_expr::{
    AbstractValue, BinOp, ExprId, ExprTree, Identity, Knowledge, NodeKind, Payload, Point, ScopeId,
    ScopeKind, StmtKind, UnOp,
};

use crate::eval::{Ctx, Evaluator, ExecConfig};
use crate::services::{ContainerYield, Services};
use crate::state::ProgramState;

/// Seed a program state for a query at `query`: fold in preceding
/// assignments, parse the conditions of every enclosing conditional scope
/// on top of them, then evict whatever the mutation oracle distrusts on
/// the `anchor → query` path. `extra` is layered in first and survives
/// eviction.
///
/// Assignments run before conditions so that condition parsing can use
/// assigned constants; temporal guards keep either phase from overwriting
/// the other out of order.
pub fn build_initial_state(
    tree: &ExprTree,
    services: &Services,
    config: &ExecConfig,
    query: Point,
    anchor: Option<Point>,
    extra: &ProgramState,
) -> ProgramState {
    let ev = Evaluator::new(tree, services, config);
    let mut ctx = Ctx::new(config);
    let mut state = ProgramState::new();
    state.replace(extra);

    let chain: Vec<ScopeId> = tree
        .point_scope(query)
        .map(|s| tree.scope_chain(s))
        .unwrap_or_default();

    // Identities written between the query and an enclosing loop's end:
    // their pre-loop values are stale after the first back edge, unless a
    // write between the loop header and the query re-establishes them.
    let mut loop_dirty = loop_carried(tree, query, &chain);
    let mut assigned_at: HashMap<Identity, Point> = HashMap::new();

    fill_from_assignments(
        &ev,
        &mut ctx,
        &mut state,
        query,
        &chain,
        &mut loop_dirty,
        &mut assigned_at,
    );
    fill_from_conditions(&ev, &mut ctx, &mut state, &chain, &loop_dirty, &assigned_at);
    evict_modified(tree, services, &mut state, query, anchor);

    // Caller-supplied bindings describe the query point itself; nothing
    // derived above outranks them.
    state.replace(extra);

    state
}

/// Orders condition facts against the assignment walk: a fact is recorded
/// only when the condition test post-dates the last write, or when a loop
/// back edge re-establishes the test on every path to the query.
pub(crate) struct FactGuard<'s> {
    scope_first: Point,
    assigned_at: &'s HashMap<Identity, Point>,
    loop_dirty: &'s HashMap<Identity, Point>,
}

impl FactGuard<'_> {
    fn allows(&self, identity: Identity) -> bool {
        if identity.is_none() {
            return false;
        }
        if let Some(loop_first) = self.loop_dirty.get(&identity) {
            return self.scope_first >= *loop_first;
        }
        match self.assigned_at.get(&identity) {
            Some(p) => *p < self.scope_first,
            None => true,
        }
    }
}

fn loop_carried(tree: &ExprTree, query: Point, chain: &[ScopeId]) -> HashMap<Identity, Point> {
    let mut out = HashMap::new();
    for sid in chain {
        let Some(scope) = tree.scope(*sid) else { continue };
        if !matches!(scope.kind, ScopeKind::While | ScopeKind::For | ScopeKind::Do) {
            continue;
        }
        for p in query.0..scope.end.0 {
            for identity in stmt_write_targets(tree, Point(p)) {
                // Innermost loop wins; the chain runs innermost-first.
                out.entry(identity).or_insert(scope.first);
            }
        }
    }
    out
}

fn stmt_write_targets(tree: &ExprTree, p: Point) -> Vec<Identity> {
    let mut out = Vec::new();
    let Some(stmt) = tree.stmt(p) else {
        return out;
    };
    let roots: Vec<ExprId> = match &stmt.kind {
        StmtKind::Expr(e) => vec![*e],
        StmtKind::Decl { identity, init, .. } => {
            out.push(*identity);
            init.iter().copied().collect()
        }
        StmtKind::Return(e) => e.iter().copied().collect(),
    };
    for root in roots {
        for sub in tree.subexprs(root) {
            let Some(node) = tree.node(sub) else { continue };
            if matches!(node.kind, NodeKind::Assign(_) | NodeKind::IncDec { .. }) {
                if let Some(target) = node.lhs {
                    let identity = tree.identity(target);
                    if identity.is_some() {
                        out.push(identity);
                    }
                }
            }
        }
    }
    out
}

// Conditions.

fn fill_from_conditions(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    chain: &[ScopeId],
    loop_dirty: &HashMap<Identity, Point>,
    assigned_at: &HashMap<Identity, Point>,
) {
    for sid in chain {
        let Some(scope) = ev.tree.scope(*sid) else {
            continue;
        };
        if !scope.kind.is_conditional() {
            continue;
        }
        let Some(cond) = scope.condition else {
            continue;
        };
        let then_branch = scope.kind != ScopeKind::Else;
        let v = ev.eval(ctx, state, cond);
        if !v.is_true() && !v.is_false() {
            let guard = FactGuard {
                scope_first: scope.first,
                assigned_at,
                loop_dirty,
            };
            parse_condition_guarded(ev, ctx, state, cond, then_branch, Some(&guard));
        }
    }
}

/// Derive facts from one condition assumed true or false, distributing
/// through `!`, `&&` and `||`. Used both by state construction and by the
/// cursor's explicit assumptions.
pub(crate) fn parse_condition(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    expr: ExprId,
    assume_true: bool,
) {
    parse_condition_guarded(ev, ctx, state, expr, assume_true, None);
}

fn parse_condition_guarded(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    expr: ExprId,
    assume_true: bool,
    guard: Option<&FactGuard>,
) {
    let Some(node) = ev.tree.node(expr) else {
        return;
    };
    let allowed = |identity: Identity| {
        identity.is_some() && guard.map_or(true, |g| g.allows(identity))
    };
    match &node.kind {
        NodeKind::Unary(UnOp::Not) => {
            if allowed(node.identity) {
                state.set_value(ev.tree, expr, AbstractValue::known_int(assume_true as i64));
            }
            if let Some(inner) = node.lhs {
                parse_condition_guarded(ev, ctx, state, inner, !assume_true, guard);
            }
        }
        NodeKind::Binary(op @ (BinOp::And | BinOp::Or)) => {
            if allowed(node.identity) {
                state.set_value(ev.tree, expr, AbstractValue::known_int(assume_true as i64));
            }
            // `a && b` true pins both; `a || b` false refutes both. The
            // other polarities determine neither operand.
            let determined = match op {
                BinOp::And => assume_true,
                _ => !assume_true,
            };
            if determined {
                if let Some(lhs) = node.lhs {
                    parse_condition_guarded(ev, ctx, state, lhs, assume_true, guard);
                }
                if let Some(rhs) = node.rhs {
                    parse_condition_guarded(ev, ctx, state, rhs, assume_true, guard);
                }
            }
        }
        NodeKind::Binary(op) if op.is_comparison() => {
            if allowed(node.identity) {
                state.set_value(ev.tree, expr, AbstractValue::known_int(assume_true as i64));
            }
            comparison_facts(ev, ctx, state, node.lhs, node.rhs, *op, assume_true, guard);
        }
        _ => {
            // Any other boolean expression asserts zero/nonzero directly.
            if allowed(node.identity) {
                let value = if assume_true {
                    AbstractValue::impossible_int(0)
                } else {
                    AbstractValue::known_int(0)
                };
                state.set_value(ev.tree, expr, value);
            }
            emptiness_mirror(ev, state, expr, assume_true, guard);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn comparison_facts(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    lhs: Option<ExprId>,
    rhs: Option<ExprId>,
    op: BinOp,
    assume_true: bool,
    guard: Option<&FactGuard>,
) {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return;
    };
    let Some(op) = (if assume_true { Some(op) } else { op.negated() }) else {
        return;
    };

    let lv = ev.eval(ctx, state, lhs);
    let rv = ev.eval(ctx, state, rhs);

    if let Some(k) = rv.positive_int() {
        if lv.positive_int().is_none() {
            record_comparison(ev, state, lhs, op, k, guard);
            return;
        }
    }
    if let Some(k) = lv.positive_int() {
        if rv.positive_int().is_none() {
            record_comparison(ev, state, rhs, flip_comparison(op), k, guard);
            return;
        }
    }

    // No constant side: an equality still links the two expressions
    // symbolically.
    if op == BinOp::Eq {
        let (li, ri) = (ev.tree.identity(lhs), ev.tree.identity(rhs));
        let allowed = |identity: Identity| {
            identity.is_some() && guard.map_or(true, |g| g.allows(identity))
        };
        if li.is_some() && ri.is_some() {
            if allowed(li) {
                state.set_value(
                    ev.tree,
                    lhs,
                    AbstractValue::new(Payload::Symbolic { anchor: ri, delta: 0 }, Knowledge::Known),
                );
            }
            if allowed(ri) {
                state.set_value(
                    ev.tree,
                    rhs,
                    AbstractValue::new(Payload::Symbolic { anchor: li, delta: 0 }, Knowledge::Known),
                );
            }
        }
    }
}

fn flip_comparison(op: BinOp) -> BinOp {
    match op {
        BinOp::Lt => BinOp::Gt,
        BinOp::Le => BinOp::Ge,
        BinOp::Gt => BinOp::Lt,
        BinOp::Ge => BinOp::Le,
        other => other,
    }
}

/// Record `target OP k` as a Known/Impossible fact on the target, with
/// the container-size mirror when the target is a size query.
fn record_comparison(
    ev: &Evaluator,
    state: &mut ProgramState,
    target: ExprId,
    op: BinOp,
    k: i64,
    guard: Option<&FactGuard>,
) {
    let value = match op {
        BinOp::Eq => Some(AbstractValue::known_int(k)),
        BinOp::Ne => Some(AbstractValue::impossible_int(k)),
        BinOp::Gt => Some(AbstractValue::impossible_int_bound(k, vigil_expr::Bound::Lower)),
        BinOp::Ge => k
            .checked_sub(1)
            .map(|k| AbstractValue::impossible_int_bound(k, vigil_expr::Bound::Lower)),
        BinOp::Lt => Some(AbstractValue::impossible_int_bound(k, vigil_expr::Bound::Upper)),
        BinOp::Le => k
            .checked_add(1)
            .map(|k| AbstractValue::impossible_int_bound(k, vigil_expr::Bound::Upper)),
        _ => None,
    };
    let identity = ev.tree.identity(target);
    if identity.is_some() && guard.map_or(true, |g| g.allows(identity)) {
        if let Some(value) = value {
            state.set_value(ev.tree, target, value);
        }
    }

    // Mirror facts about a container's size query onto the container.
    if let Some((container, yield_kind)) = container_query(ev, target) {
        let container_id = ev.tree.identity(container);
        if container_id.is_none() || guard.is_some_and(|g| !g.allows(container_id)) {
            return;
        }
        match yield_kind {
            ContainerYield::Size => match op {
                BinOp::Eq => state.set_container_size(ev.tree, container, k, true),
                BinOp::Ne => state.set_container_size(ev.tree, container, k, false),
                BinOp::Gt if k >= 0 => {
                    // A provably positive size at least rules out empty.
                    state.set_container_size(ev.tree, container, 0, false)
                }
                BinOp::Ge if k >= 1 => {
                    state.set_container_size(ev.tree, container, 0, false)
                }
                _ => {}
            },
            ContainerYield::Empty => match (op, k) {
                (BinOp::Eq, 0) | (BinOp::Ne, 1) => {
                    state.set_container_size(ev.tree, container, 0, false)
                }
                (BinOp::Eq, 1) | (BinOp::Ne, 0) => {
                    state.set_container_size(ev.tree, container, 0, true)
                }
                _ => {}
            },
            _ => {}
        }
    }
}

/// `expr` as a container yield query: `(container, yield kind)`.
fn container_query(ev: &Evaluator, expr: ExprId) -> Option<(ExprId, ContainerYield)> {
    let node = ev.tree.node(expr)?;
    let NodeKind::Call { .. } = node.kind else {
        return None;
    };
    let member = ev.tree.node(node.lhs?)?;
    let NodeKind::Member { name } = &member.kind else {
        return None;
    };
    let yield_kind = ev.services.library.container_yield(name)?;
    Some((member.lhs?, yield_kind))
}

/// Bare boolean use of a container query: `if (c.empty())`, `if (c.size())`.
fn emptiness_mirror(
    ev: &Evaluator,
    state: &mut ProgramState,
    expr: ExprId,
    assume_true: bool,
    guard: Option<&FactGuard>,
) {
    let Some((container, yield_kind)) = container_query(ev, expr) else {
        return;
    };
    let container_id = ev.tree.identity(container);
    if container_id.is_none() || guard.is_some_and(|g| !g.allows(container_id)) {
        return;
    }
    match yield_kind {
        ContainerYield::Empty => {
            state.set_container_size(ev.tree, container, 0, assume_true);
        }
        ContainerYield::Size => {
            state.set_container_size(ev.tree, container, 0, !assume_true);
        }
        _ => {}
    }
}

// Assignments.

/// One surviving assignment, found walking backward but executed forward.
struct PendingAssign {
    point: Point,
    identity: Identity,
    target: Option<ExprId>,
    rhs: ExprId,
}

/// Backward walk over preceding statements: the newest write per identity
/// wins; the survivors are then executed in program order so each right
/// side sees its inputs.
fn fill_from_assignments(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    query: Point,
    chain: &[ScopeId],
    loop_dirty: &mut HashMap<Identity, Point>,
    assigned_at: &mut HashMap<Identity, Point>,
) {
    let tree = ev.tree;
    let floor = tree
        .function_at(query)
        .and_then(|f| tree.scope(f.body))
        .map(|s| s.first.0)
        .unwrap_or(0);

    let mut pending: Vec<PendingAssign> = Vec::new();
    let mut p = query.0;
    while p > floor {
        p -= 1;
        let point = Point(p);
        let Some(stmt) = tree.stmt(point) else {
            continue;
        };

        if chain.contains(&stmt.scope) {
            apply_stmt(ev, state, point, loop_dirty, assigned_at, &mut pending);
            continue;
        }

        // The statement sits in a scope off the query's chain: a branch we
        // may or may not have passed through.
        match classify_branch(ev, ctx, state, chain, stmt.scope) {
            BranchKind::Transparent => {
                apply_stmt(ev, state, point, loop_dirty, assigned_at, &mut pending);
            }
            BranchKind::Dead(first) => {
                // Provably not executed on the way here; skip it whole.
                p = first.0;
            }
            BranchKind::Uncertain => {
                for identity in stmt_write_targets(tree, point) {
                    if !assigned_at.contains_key(&identity) {
                        assigned_at.insert(identity, point);
                        state.set_unknown(identity);
                    }
                }
            }
        }
    }

    pending.sort_by_key(|pa| pa.point);
    for pa in pending {
        let value = {
            let mut scratch = state.clone();
            ev.eval(ctx, &mut scratch, pa.rhs)
        };
        if value.is_unknown() {
            state.set_unknown(pa.identity);
        } else {
            match pa.target {
                Some(target) => state.set_value(ev.tree, target, value),
                None => state.bind(pa.identity, value),
            }
        }
    }
}

enum BranchKind {
    Transparent,
    Dead(Point),
    Uncertain,
}

/// Classify the path of scopes between a statement's scope and the query
/// chain: walked-through, provably skipped, or uncertain.
fn classify_branch(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    chain: &[ScopeId],
    from: ScopeId,
) -> BranchKind {
    let tree = ev.tree;
    let mut transparent = true;
    for sid in tree.scope_chain(from) {
        if chain.contains(&sid) {
            break;
        }
        let Some(scope) = tree.scope(sid) else {
            return BranchKind::Uncertain;
        };
        match scope.kind {
            ScopeKind::Block | ScopeKind::Do => {}
            ScopeKind::If => {
                // The branch not taken when the query sits in the matching
                // else is dead.
                let in_matching_else = chain.iter().any(|c| {
                    tree.scope(*c).is_some_and(|s| {
                        s.kind == ScopeKind::Else && s.condition == scope.condition
                    })
                });
                if in_matching_else {
                    return BranchKind::Dead(scope.first);
                }
                match definite_condition(ev, ctx, state, scope.condition) {
                    Some(true) => {}
                    Some(false) => return BranchKind::Dead(scope.first),
                    None => transparent = false,
                }
            }
            ScopeKind::Else => match definite_condition(ev, ctx, state, scope.condition) {
                Some(false) => {}
                Some(true) => return BranchKind::Dead(scope.first),
                None => transparent = false,
            },
            ScopeKind::While | ScopeKind::For => transparent = false,
            ScopeKind::Function | ScopeKind::Global => return BranchKind::Uncertain,
        }
    }
    if transparent {
        BranchKind::Transparent
    } else {
        BranchKind::Uncertain
    }
}

fn definite_condition(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    cond: Option<ExprId>,
) -> Option<bool> {
    let cond = cond?;
    let v = ev.eval(ctx, state, cond);
    if v.is_true() {
        Some(true)
    } else if v.is_false() {
        Some(false)
    } else {
        None
    }
}

fn apply_stmt(
    ev: &Evaluator,
    state: &mut ProgramState,
    point: Point,
    loop_dirty: &mut HashMap<Identity, Point>,
    assigned_at: &mut HashMap<Identity, Point>,
    pending: &mut Vec<PendingAssign>,
) {
    let tree = ev.tree;
    let Some(stmt) = tree.stmt(point) else {
        return;
    };
    match &stmt.kind {
        StmtKind::Decl { identity, init, .. } => {
            if assigned_at.contains_key(identity) {
                return;
            }
            assigned_at.insert(*identity, point);
            match init {
                Some(init) => collect_assignment(
                    ev, state, point, *identity, None, Some(*init), loop_dirty, assigned_at,
                    pending,
                ),
                None => {
                    // Declared and never since assigned: certainly
                    // uninitialized at the query point.
                    if loop_dirty.contains_key(identity) {
                        state.set_unknown(*identity);
                    } else {
                        state.bind(
                            *identity,
                            AbstractValue::new(Payload::Uninit, Knowledge::Known),
                        );
                    }
                }
            }
        }
        StmtKind::Expr(root) => {
            for sub in tree.subexprs(*root) {
                let Some(node) = tree.node(sub) else { continue };
                match &node.kind {
                    NodeKind::Assign(None) => {
                        let Some(target) = node.lhs else { continue };
                        let identity = tree.identity(target);
                        if identity.is_none() || assigned_at.contains_key(&identity) {
                            continue;
                        }
                        assigned_at.insert(identity, point);
                        collect_assignment(
                            ev,
                            state,
                            point,
                            identity,
                            Some(target),
                            node.rhs,
                            loop_dirty,
                            assigned_at,
                            pending,
                        );
                    }
                    NodeKind::Assign(Some(_)) | NodeKind::IncDec { .. } => {
                        // Compound updates cannot be reconstructed walking
                        // backward; the target is examined-but-unknown.
                        let Some(target) = node.lhs else { continue };
                        let identity = tree.identity(target);
                        if identity.is_some() && !assigned_at.contains_key(&identity) {
                            assigned_at.insert(identity, point);
                            state.set_unknown(identity);
                        }
                    }
                    NodeKind::Call { args } => {
                        let callee = node
                            .lhs
                            .and_then(|c| tree.node(c))
                            .and_then(|n| match &n.kind {
                                NodeKind::Name(s) => Some(s.clone()),
                                _ => None,
                            })
                            .unwrap_or_default();
                        if ev.services.library.is_pure(&callee) {
                            continue;
                        }
                        for arg in args {
                            if ev.services.oracle.call_may_modify(tree, &callee, *arg) {
                                for var in tree.variables_in(*arg) {
                                    if !assigned_at.contains_key(&var) {
                                        assigned_at.insert(var, point);
                                        state.set_unknown(var);
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        StmtKind::Return(_) => {}
    }
}

/// Guard one plain assignment found on the backward walk; survivors are
/// queued for forward execution.
#[allow(clippy::too_many_arguments)]
fn collect_assignment(
    ev: &Evaluator,
    state: &mut ProgramState,
    point: Point,
    identity: Identity,
    target: Option<ExprId>,
    rhs: Option<ExprId>,
    loop_dirty: &mut HashMap<Identity, Point>,
    assigned_at: &HashMap<Identity, Point>,
    pending: &mut Vec<PendingAssign>,
) {
    // A write below an enclosing loop header cannot outlive the loop's
    // own writes; one at or past it re-establishes the value on every
    // iteration path.
    if let Some(loop_first) = loop_dirty.get(&identity).copied() {
        if point < loop_first {
            state.set_unknown(identity);
            return;
        }
        loop_dirty.remove(&identity);
    }

    let Some(rhs) = rhs else {
        state.set_unknown(identity);
        return;
    };

    // The right side will be evaluated at its own program position; later
    // writes to its inputs invalidate that reading. The backward order
    // guarantees every later write is already recorded.
    let rhs_vars = ev.tree.variables_in(rhs);
    if rhs_vars
        .iter()
        .any(|v| assigned_at.get(v).is_some_and(|p| *p > point))
    {
        state.set_unknown(identity);
        return;
    }

    pending.push(PendingAssign {
        point,
        identity,
        target,
        rhs,
    });
}

/// Final phase: drop whatever may have changed on the way from `anchor`
/// to `query`.
fn evict_modified(
    tree: &ExprTree,
    services: &Services,
    state: &mut ProgramState,
    query: Point,
    anchor: Option<Point>,
) {
    let Some(anchor) = anchor else {
        return;
    };
    if anchor == query {
        return;
    }
    let stale: Vec<Identity> = state
        .entries()
        .filter_map(|(ident, entry)| {
            let repr = entry.repr.or_else(|| tree.node_with_identity(ident))?;
            services
                .oracle
                .may_change(tree, repr, anchor, query)
                .then_some(ident)
        })
        .collect();
    state.erase_if(|ident, _| stale.contains(&ident));
}
