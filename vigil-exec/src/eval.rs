#![forbid(unsafe_code)]

use vigil_expr::{
    AbstractValue, BinOp, Bound, ExprId, ExprTree, Knowledge, Node, NodeKind, Payload, Point,
    ScopeId, ScopeKind, StmtKind, UnOp,
};

use crate::builtins;
use crate::cond;
use crate::services::{ContainerYield, Services};
use crate::state::{normalize_impossible_bool, ProgramState};

/// Countdown budgets bounding every evaluation. Exhausting any of them
/// yields Unknown; nothing in the engine loops or recurses past them.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Recursion budget through the expression tree.
    pub max_expr_depth: u32,
    /// Recursion budget through inlined function bodies.
    pub max_inline_depth: u32,
    /// Absolute node-visit budget, for pathological flat trees.
    pub max_node_visits: u32,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_expr_depth: 10,
            max_inline_depth: 4,
            max_node_visits: 10_000,
        }
    }
}

pub(crate) struct Ctx {
    expr_depth: u32,
    inline_depth: u32,
    visits: u32,
}

impl Ctx {
    pub(crate) fn new(config: &ExecConfig) -> Self {
        Self {
            expr_depth: config.max_expr_depth,
            inline_depth: config.max_inline_depth,
            visits: config.max_node_visits,
        }
    }
}

pub(crate) enum Walk {
    Done,
    Returned(AbstractValue),
    Aborted,
}

/// Pure recursive folder of expression nodes into abstract values under a
/// program state. Evaluation never fails; every unsupported or
/// out-of-budget case folds to Unknown.
pub struct Evaluator<'a> {
    pub tree: &'a ExprTree,
    pub services: &'a Services<'a>,
    pub config: &'a ExecConfig,
}

impl<'a> Evaluator<'a> {
    pub fn new(tree: &'a ExprTree, services: &'a Services<'a>, config: &'a ExecConfig) -> Self {
        Self {
            tree,
            services,
            config,
        }
    }

    pub fn evaluate(&self, state: &mut ProgramState, expr: ExprId) -> AbstractValue {
        let mut ctx = Ctx::new(self.config);
        self.eval(&mut ctx, state, expr)
    }

    pub(crate) fn eval(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        expr: ExprId,
    ) -> AbstractValue {
        if ctx.visits == 0 || ctx.expr_depth == 0 {
            return AbstractValue::unknown();
        }
        ctx.visits -= 1;
        ctx.expr_depth -= 1;
        let out = self.eval_inner(ctx, state, expr);
        ctx.expr_depth += 1;
        out
    }

    fn eval_inner(&self, ctx: &mut Ctx, state: &mut ProgramState, expr: ExprId) -> AbstractValue {
        let Some(node) = self.tree.node(expr) else {
            return AbstractValue::unknown();
        };

        // Values pinned by earlier global analysis win outright.
        if let Some(v) = node.known.iter().find(|v| v.is_known()) {
            return v.clone();
        }

        match &node.kind {
            NodeKind::Int(v) => {
                // Literals outside the assumed integer range do not wrap
                // silently.
                match i64::try_from(*v) {
                    Ok(v) => AbstractValue::known_int(v),
                    Err(_) => AbstractValue::unknown(),
                }
            }
            NodeKind::Float(v) => AbstractValue::known_float(*v),
            NodeKind::Char(c) => AbstractValue::known_int(*c as i64),
            NodeKind::Bool(b) => AbstractValue::known_int(*b as i64),
            NodeKind::Str(_) => AbstractValue::known_token(expr),

            NodeKind::Assign(op) => self.eval_assign(ctx, state, node, *op),

            NodeKind::Binary(op) if op.is_logical() => {
                cond::eval_multi_condition(self, ctx, state, expr, *op)
            }

            NodeKind::Comma => {
                let Some((lhs, rhs)) = node.lhs.zip(node.rhs) else {
                    return AbstractValue::unknown();
                };
                self.eval(ctx, state, lhs);
                self.eval(ctx, state, rhs)
            }

            NodeKind::IncDec { inc, prefix } => self.eval_incdec(ctx, state, node, *inc, *prefix),

            NodeKind::Index => self.eval_index(ctx, state, node, expr),

            NodeKind::Binary(op) => self.eval_binary(ctx, state, node, expr, *op),

            NodeKind::Unary(op) => self.eval_unary(ctx, state, node, *op),

            NodeKind::Question => {
                let Some((cond_id, colon)) = node.lhs.zip(node.rhs) else {
                    return AbstractValue::unknown();
                };
                let c = self.eval(ctx, state, cond_id);
                let Some(colon_node) = self.tree.node(colon) else {
                    return AbstractValue::unknown();
                };
                if !matches!(colon_node.kind, NodeKind::Colon) {
                    return AbstractValue::unknown();
                }
                if c.is_true() {
                    colon_node
                        .lhs
                        .map(|b| self.eval(ctx, state, b))
                        .unwrap_or_else(AbstractValue::unknown)
                } else if c.is_false() {
                    colon_node
                        .rhs
                        .map(|b| self.eval(ctx, state, b))
                        .unwrap_or_else(AbstractValue::unknown)
                } else {
                    AbstractValue::unknown()
                }
            }
            NodeKind::Colon => AbstractValue::unknown(),

            NodeKind::Cast { ty } => {
                let Some(inner) = node.lhs else {
                    return AbstractValue::unknown();
                };
                let v = self.eval(ctx, state, inner);
                cast_value(ty, v)
            }

            NodeKind::Call { args } => self.eval_call(ctx, state, expr, node, args),

            NodeKind::Name(_) | NodeKind::Member { .. } => self.lookup(state, node),
        }
    }

    /// A stored fact for this node's identity, impossible facts included
    /// (exclusions carry truth through the duality convention).
    fn lookup(&self, state: &ProgramState, node: &Node) -> AbstractValue {
        if node.identity.is_none() {
            return AbstractValue::unknown();
        }
        match state.entry(node.identity) {
            Some(entry) if !entry.value.is_unknown() => entry.value.clone(),
            _ => AbstractValue::unknown(),
        }
    }

    fn eval_assign(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        node: &Node,
        op: Option<BinOp>,
    ) -> AbstractValue {
        let Some((lhs, rhs)) = node.lhs.zip(node.rhs) else {
            return AbstractValue::unknown();
        };
        let rv = self.eval(ctx, state, rhs);
        let out = match op {
            None => rv,
            Some(op) => {
                let prior = self.eval(ctx, state, lhs);
                self.combine(op, &prior, &rv, self.is_unsigned(lhs), self.is_unsigned(rhs))
            }
        };
        if out.is_unknown() {
            state.set_unknown(self.tree.identity(lhs));
        } else {
            state.set_value(self.tree, lhs, out.clone());
        }
        out
    }

    fn eval_incdec(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        node: &Node,
        inc: bool,
        prefix: bool,
    ) -> AbstractValue {
        let Some(operand) = node.lhs else {
            return AbstractValue::unknown();
        };
        let old = self.eval(ctx, state, operand);
        let Some(v) = old.positive_int() else {
            return AbstractValue::unknown();
        };
        // Unsigned wraparound below zero is refused, not modeled.
        if !inc && v == 0 && self.is_unsigned(operand) {
            return AbstractValue::unknown();
        }
        let adjusted = if inc { v.checked_add(1) } else { v.checked_sub(1) };
        let Some(adjusted) = adjusted else {
            return AbstractValue::unknown();
        };
        let mut new = old.clone();
        new.payload = Payload::Int(adjusted);
        state.set_value(self.tree, operand, new.clone());
        if prefix {
            new
        } else {
            old
        }
    }

    fn eval_index(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        node: &Node,
        expr: ExprId,
    ) -> AbstractValue {
        let Some((target, index)) = node.lhs.zip(node.rhs) else {
            return AbstractValue::unknown();
        };
        let tv = self.eval(ctx, state, target);
        let iv = self.eval(ctx, state, index);

        let literal = match tv.payload {
            Payload::Token(id) => self.tree.node(id),
            _ => self.tree.node(target),
        };
        if let (Some(lit), Some(i)) = (literal, iv.positive_int()) {
            if let NodeKind::Str(s) = &lit.kind {
                let bytes = s.as_bytes();
                if i >= 0 && (i as usize) < bytes.len() {
                    return AbstractValue::known_int(bytes[i as usize] as i64);
                }
                // Exactly one past the end reads the terminator.
                if i as usize == bytes.len() {
                    return AbstractValue::known_int(0);
                }
                return AbstractValue::unknown();
            }
        }

        self.tree
            .node(expr)
            .map(|n| self.lookup(state, n))
            .unwrap_or_else(AbstractValue::unknown)
    }

    fn eval_binary(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        node: &Node,
        expr: ExprId,
        op: BinOp,
    ) -> AbstractValue {
        let Some((lhs, rhs)) = node.lhs.zip(node.rhs) else {
            return AbstractValue::unknown();
        };
        let lv = self.eval(ctx, state, lhs);
        let rv = self.eval(ctx, state, rhs);

        if lv.is_unknown() || rv.is_unknown() {
            // One resolved side may still settle a comparison through a
            // known bound.
            if op.is_comparison() && lv.is_unknown() != rv.is_unknown() {
                let (known, known_is_lhs) = if lv.is_unknown() {
                    (&rv, false)
                } else {
                    (&lv, true)
                };
                if let Some(v) = self.services.bounds.infer_comparison(op, known, known_is_lhs) {
                    return v;
                }
            }
            return self.lookup_node(state, expr);
        }

        // A symbolic value anchored at the other operand compares through
        // its offset alone.
        if op.is_comparison() {
            if let Payload::Symbolic { anchor, delta } = lv.payload {
                if !lv.is_impossible() && anchor.is_some() && anchor == self.tree.identity(rhs) {
                    return combine_positive(
                        op,
                        &AbstractValue::new(Payload::Int(delta), lv.knowledge.unwrap_or(Knowledge::Possible)),
                        &AbstractValue::known_int(0),
                    );
                }
            }
            if let Payload::Symbolic { anchor, delta } = rv.payload {
                if !rv.is_impossible() && anchor.is_some() && anchor == self.tree.identity(lhs) {
                    return combine_positive(
                        op,
                        &AbstractValue::known_int(0),
                        &AbstractValue::new(Payload::Int(delta), rv.knowledge.unwrap_or(Knowledge::Possible)),
                    );
                }
            }
        }

        let out = self.combine(op, &lv, &rv, self.is_unsigned(lhs), self.is_unsigned(rhs));
        if out.is_unknown() {
            return self.lookup_node(state, expr);
        }
        if op.is_comparison() {
            normalize_impossible_bool(out)
        } else {
            out
        }
    }

    fn lookup_node(&self, state: &ProgramState, expr: ExprId) -> AbstractValue {
        self.tree
            .node(expr)
            .map(|n| self.lookup(state, n))
            .unwrap_or_else(AbstractValue::unknown)
    }

    fn eval_unary(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        node: &Node,
        op: UnOp,
    ) -> AbstractValue {
        let Some(operand) = node.lhs else {
            return AbstractValue::unknown();
        };
        match op {
            UnOp::Not => {
                let v = self.eval(ctx, state, operand);
                if v.is_true() {
                    AbstractValue::known_int(0)
                } else if v.is_false() {
                    AbstractValue::known_int(1)
                } else {
                    AbstractValue::unknown()
                }
            }
            UnOp::Neg => {
                let v = self.eval(ctx, state, operand);
                match (&v.payload, v.knowledge) {
                    (Payload::Int(i), Some(_)) => match i.checked_neg() {
                        Some(n) => {
                            let mut out = v.clone();
                            out.payload = Payload::Int(n);
                            out.bound = match v.bound {
                                Bound::Lower => Bound::Upper,
                                Bound::Upper => Bound::Lower,
                                Bound::Point => Bound::Point,
                            };
                            out
                        }
                        None => AbstractValue::unknown(),
                    },
                    (Payload::Float(f), Some(_)) if !v.is_impossible() => {
                        AbstractValue::new(Payload::Float(-f), v.knowledge.unwrap_or(Knowledge::Known))
                    }
                    _ => AbstractValue::unknown(),
                }
            }
            UnOp::Plus => {
                let v = self.eval(ctx, state, operand);
                match v.payload {
                    Payload::Int(_) | Payload::Float(_) => v,
                    _ => AbstractValue::unknown(),
                }
            }
            UnOp::BitNot => {
                let v = self.eval(ctx, state, operand);
                match v.positive_int() {
                    Some(i) => {
                        let mut out = v.clone();
                        out.payload = Payload::Int(!i);
                        out
                    }
                    None => AbstractValue::unknown(),
                }
            }
            UnOp::AddrOf | UnOp::Deref => self.lookup(state, node),
        }
    }

    fn is_unsigned(&self, expr: ExprId) -> bool {
        self.tree.node(expr).is_some_and(|n| n.unsigned)
    }

    // Calls.

    fn eval_call(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        _expr: ExprId,
        node: &Node,
        args: &[ExprId],
    ) -> AbstractValue {
        let callee = node.lhs;

        // Container yield queries rewrite to size facts on the container.
        if let Some(member) = callee.and_then(|c| self.tree.node(c)) {
            if let NodeKind::Member { name } = &member.kind {
                if let Some(yield_kind) = self.services.library.container_yield(name) {
                    if let Some(container) = member.lhs {
                        return self.eval_container_yield(state, container, yield_kind);
                    }
                }
            }
        }

        let arg_values: Vec<AbstractValue> =
            args.iter().map(|a| self.eval(ctx, state, *a)).collect();

        let name = match callee.and_then(|c| self.tree.node(c)) {
            Some(Node {
                kind: NodeKind::Name(name),
                ..
            }) => Some(name.clone()),
            _ => None,
        };

        if let Some(name) = &name {
            if let Some(func) = self.tree.function(name) {
                let out = self.inline_call(ctx, func, &arg_values);
                // By-reference arguments of an inlined call are not modeled;
                // drop whatever we believed about them.
                for (param, arg) in func.params.iter().zip(args) {
                    if param.by_ref {
                        self.invalidate_argument(state, *arg);
                    }
                }
                return out;
            }
        }

        let result = match &name {
            Some(name) => {
                let builtin = builtins::eval_builtin(self.tree, name, &arg_values);
                if !builtin.is_unknown() {
                    builtin
                } else if let Some(template) = self.services.library.return_value_template(name) {
                    self.eval_template(ctx, &template, &arg_values)
                } else {
                    AbstractValue::unknown()
                }
            }
            None => AbstractValue::unknown(),
        };

        // Unresolved call: anything passed in a writable position is gone.
        let pure = name
            .as_deref()
            .is_some_and(|n| self.services.library.is_pure(n));
        if !pure {
            let callee_name = name.as_deref().unwrap_or("");
            for arg in args {
                if self.services.oracle.call_may_modify(self.tree, callee_name, *arg) {
                    self.invalidate_argument(state, *arg);
                }
            }
        }

        result
    }

    fn invalidate_argument(&self, state: &mut ProgramState, arg: ExprId) {
        for var in self.tree.variables_in(arg) {
            if state.is_tracked(var) {
                state.set_unknown(var);
            }
        }
        let identity = self.tree.identity(arg);
        if identity.is_some() && state.is_tracked(identity) {
            state.set_unknown(identity);
        }
    }

    fn eval_container_yield(
        &self,
        state: &ProgramState,
        container: ExprId,
        yield_kind: ContainerYield,
    ) -> AbstractValue {
        let identity = self.tree.identity(container);
        let size = state
            .get_value(identity, true)
            .filter(|v| matches!(v.payload, Payload::ContainerSize(_)))
            .cloned();
        match yield_kind {
            ContainerYield::Size => match size {
                Some(mut v) => {
                    if let Payload::ContainerSize(n) = v.payload {
                        v.payload = Payload::Int(n);
                    }
                    v
                }
                None => AbstractValue::unknown(),
            },
            ContainerYield::Empty => match size {
                Some(v) => match (&v.payload, v.knowledge, v.bound) {
                    (Payload::ContainerSize(0), Some(Knowledge::Impossible), Bound::Point) => {
                        AbstractValue::known_int(0)
                    }
                    (Payload::ContainerSize(n), Some(k), Bound::Point)
                        if k != Knowledge::Impossible =>
                    {
                        AbstractValue::new(Payload::Int((*n == 0) as i64), k)
                    }
                    _ => AbstractValue::unknown(),
                },
                None => AbstractValue::unknown(),
            },
            ContainerYield::IterBegin => {
                AbstractValue::new(Payload::IterStart(0), Knowledge::Known)
            }
            ContainerYield::IterEnd => AbstractValue::new(Payload::IterEnd(0), Knowledge::Known),
            ContainerYield::Item => AbstractValue::unknown(),
        }
    }

    fn inline_call(
        &self,
        ctx: &mut Ctx,
        func: &vigil_expr::Function,
        arg_values: &[AbstractValue],
    ) -> AbstractValue {
        if ctx.inline_depth == 0 {
            return AbstractValue::unknown();
        }
        let mut local = ProgramState::new();
        for (param, value) in func.params.iter().zip(arg_values) {
            if !value.is_unknown() {
                local.bind(param.identity, value.clone());
            }
        }
        ctx.inline_depth -= 1;
        let out = self.walk_scope(ctx, &mut local, func.body);
        ctx.inline_depth += 1;
        match out {
            Walk::Returned(v) => v,
            _ => AbstractValue::unknown(),
        }
    }

    /// Straight-line walk of a function body: sequential statements,
    /// `return`, and `if`/`else` with definite conditions. Anything else
    /// aborts.
    pub(crate) fn walk_scope(
        &self,
        ctx: &mut Ctx,
        state: &mut ProgramState,
        scope_id: ScopeId,
    ) -> Walk {
        let Some(scope) = self.tree.scope(scope_id) else {
            return Walk::Aborted;
        };
        let (first, end) = (scope.first.0, scope.end.0);
        let mut p = first;
        while p < end {
            let Some(stmt) = self.tree.stmt(Point(p)) else {
                return Walk::Aborted;
            };
            if stmt.scope == scope_id {
                match &stmt.kind {
                    StmtKind::Expr(e) => {
                        self.eval(ctx, state, *e);
                    }
                    StmtKind::Decl { identity, init, .. } => match init {
                        Some(init) => {
                            let v = self.eval(ctx, state, *init);
                            if v.is_unknown() {
                                state.set_unknown(*identity);
                            } else {
                                state.bind(*identity, v);
                            }
                        }
                        None => {
                            state.bind(
                                *identity,
                                AbstractValue::new(Payload::Uninit, Knowledge::Known),
                            );
                        }
                    },
                    StmtKind::Return(value) => {
                        let v = value
                            .map(|e| self.eval(ctx, state, e))
                            .unwrap_or_else(AbstractValue::unknown);
                        return Walk::Returned(v);
                    }
                }
                p += 1;
                continue;
            }

            // A nested scope starts here.
            let Some(child_id) = self.child_scope_at(scope_id, Point(p)) else {
                return Walk::Aborted;
            };
            let Some(child) = self.tree.scope(child_id) else {
                return Walk::Aborted;
            };
            match child.kind {
                ScopeKind::Block | ScopeKind::Do => {
                    match self.walk_scope(ctx, state, child_id) {
                        Walk::Done => {}
                        other => return other,
                    }
                    p = child.end.0;
                }
                ScopeKind::If => {
                    let Some(cond_id) = child.condition else {
                        return Walk::Aborted;
                    };
                    let c = self.eval(ctx, state, cond_id);
                    let else_id = self.find_else(scope_id, cond_id, child.end);
                    if c.is_true() {
                        match self.walk_scope(ctx, state, child_id) {
                            Walk::Done => {}
                            other => return other,
                        }
                        p = else_id
                            .and_then(|e| self.tree.scope(e))
                            .map(|s| s.end.0)
                            .unwrap_or(child.end.0);
                    } else if c.is_false() {
                        match else_id {
                            Some(else_id) => {
                                match self.walk_scope(ctx, state, else_id) {
                                    Walk::Done => {}
                                    other => return other,
                                }
                                p = self
                                    .tree
                                    .scope(else_id)
                                    .map(|s| s.end.0)
                                    .unwrap_or(child.end.0);
                            }
                            None => p = child.end.0,
                        }
                    } else {
                        return Walk::Aborted;
                    }
                }
                _ => return Walk::Aborted,
            }
        }
        Walk::Done
    }

    fn child_scope_at(&self, parent: ScopeId, p: Point) -> Option<ScopeId> {
        self.tree
            .scopes
            .iter()
            .enumerate()
            .find(|(_, s)| s.parent == Some(parent) && s.first <= p && p < s.end)
            .map(|(i, _)| ScopeId(i as u32))
    }

    fn find_else(&self, parent: ScopeId, cond: ExprId, at: Point) -> Option<ScopeId> {
        self.tree
            .scopes
            .iter()
            .enumerate()
            .find(|(_, s)| {
                s.kind == ScopeKind::Else
                    && s.parent == Some(parent)
                    && s.condition == Some(cond)
                    && s.first == at
            })
            .map(|(i, _)| ScopeId(i as u32))
    }

    fn eval_template(
        &self,
        ctx: &mut Ctx,
        template: &str,
        arg_values: &[AbstractValue],
    ) -> AbstractValue {
        let Some(compiled) = self.services.templates.get_or_compile(template) else {
            return AbstractValue::unknown();
        };
        let mut local = ProgramState::new();
        for (index, identity) in &compiled.args {
            match arg_values.get(*index) {
                Some(v) if !v.is_unknown() => local.bind(*identity, v.clone()),
                _ => return AbstractValue::unknown(),
            }
        }
        let sub = Evaluator::new(&compiled.tree, self.services, self.config);
        sub.eval(ctx, &mut local, compiled.root)
    }

    // Value combination.

    pub(crate) fn combine(
        &self,
        op: BinOp,
        lhs: &AbstractValue,
        rhs: &AbstractValue,
        lhs_unsigned: bool,
        rhs_unsigned: bool,
    ) -> AbstractValue {
        if lhs.is_unknown() || rhs.is_unknown() {
            return AbstractValue::unknown();
        }

        // Two exclusions say nothing without interval arithmetic.
        if lhs.is_impossible() && rhs.is_impossible() {
            return AbstractValue::unknown();
        }

        if lhs.is_impossible() || rhs.is_impossible() {
            return self.combine_with_exclusion(op, lhs, rhs, lhs_unsigned, rhs_unsigned);
        }

        combine_positive(op, lhs, rhs)
    }

    fn combine_with_exclusion(
        &self,
        op: BinOp,
        lhs: &AbstractValue,
        rhs: &AbstractValue,
        lhs_unsigned: bool,
        rhs_unsigned: bool,
    ) -> AbstractValue {
        let excl_is_lhs = lhs.is_impossible();
        let (excl, excl_unsigned, other) = if excl_is_lhs {
            (lhs, lhs_unsigned, rhs)
        } else {
            (rhs, rhs_unsigned, lhs)
        };
        let (Some(excluded), Some(k)) = (excl.int(), other.positive_int()) else {
            return AbstractValue::unknown();
        };

        if op.is_comparison() {
            return compare_with_exclusion(op, excluded, excl.bound, excl_unsigned, k, excl_is_lhs);
        }

        // Exclusions survive invertible arithmetic only.
        let (solved, bound) = match op {
            BinOp::Add => (excluded.checked_add(k), excl.bound),
            BinOp::Sub => {
                if excl_is_lhs {
                    (excluded.checked_sub(k), excl.bound)
                } else {
                    (k.checked_sub(excluded), flip_bound(excl.bound))
                }
            }
            BinOp::Mul => {
                if k == 0 {
                    // Multiplying by a known zero collapses the exclusion.
                    return AbstractValue::new(
                        Payload::Int(0),
                        other.knowledge.unwrap_or(Knowledge::Known),
                    );
                }
                let bound = if k > 0 { excl.bound } else { flip_bound(excl.bound) };
                (excluded.checked_mul(k), bound)
            }
            BinOp::BitXor if excl.bound == Bound::Point => (Some(excluded ^ k), Bound::Point),
            BinOp::Shl if excl.bound == Bound::Point && excl_is_lhs => {
                let shifted = u32::try_from(k).ok().and_then(|s| {
                    if s < 64 {
                        excluded.checked_shl(s)
                    } else {
                        None
                    }
                });
                (shifted, Bound::Point)
            }
            _ => (None, Bound::Point),
        };
        match solved {
            Some(v) => AbstractValue::impossible_int_bound(v, bound),
            None => AbstractValue::unknown(),
        }
    }
}

fn flip_bound(bound: Bound) -> Bound {
    match bound {
        Bound::Lower => Bound::Upper,
        Bound::Upper => Bound::Lower,
        Bound::Point => Bound::Point,
    }
}

/// Decide `x OP k` (or `k OP x`) from an exclusion on `x`: the excluded
/// value plus its direction give a reachable interval, and the comparison
/// resolves when the whole interval lands on one side.
fn compare_with_exclusion(
    op: BinOp,
    excluded: i64,
    bound: Bound,
    unsigned: bool,
    k: i64,
    excl_is_lhs: bool,
) -> AbstractValue {
    // Normalize so the exclusion side is always the left operand.
    let op = if excl_is_lhs {
        op
    } else {
        match op {
            BinOp::Lt => BinOp::Gt,
            BinOp::Le => BinOp::Ge,
            BinOp::Gt => BinOp::Lt,
            BinOp::Ge => BinOp::Le,
            other => other,
        }
    };

    let mut lo: Option<i64> = None;
    let mut hi: Option<i64> = None;
    let mut point: Option<i64> = None;
    match bound {
        Bound::Lower => lo = excluded.checked_add(1),
        Bound::Upper => hi = excluded.checked_sub(1),
        Bound::Point => point = Some(excluded),
    }
    if unsigned {
        lo = Some(lo.unwrap_or(0).max(0));
        if point == Some(0) {
            lo = Some(lo.unwrap_or(1).max(1));
            point = None;
        }
    }

    let yes = || AbstractValue::known_int(1);
    let no = || AbstractValue::known_int(0);
    match op {
        BinOp::Gt => {
            if lo.is_some_and(|lo| lo > k) {
                yes()
            } else if hi.is_some_and(|hi| hi <= k) {
                no()
            } else {
                AbstractValue::unknown()
            }
        }
        BinOp::Ge => {
            if lo.is_some_and(|lo| lo >= k) {
                yes()
            } else if hi.is_some_and(|hi| hi < k) {
                no()
            } else {
                AbstractValue::unknown()
            }
        }
        BinOp::Lt => {
            if hi.is_some_and(|hi| hi < k) {
                yes()
            } else if lo.is_some_and(|lo| lo >= k) {
                no()
            } else {
                AbstractValue::unknown()
            }
        }
        BinOp::Le => {
            if hi.is_some_and(|hi| hi <= k) {
                yes()
            } else if lo.is_some_and(|lo| lo > k) {
                no()
            } else {
                AbstractValue::unknown()
            }
        }
        BinOp::Eq => {
            if point == Some(k)
                || lo.is_some_and(|lo| lo > k)
                || hi.is_some_and(|hi| hi < k)
            {
                no()
            } else if lo == Some(k) && hi == Some(k) {
                yes()
            } else {
                AbstractValue::unknown()
            }
        }
        BinOp::Ne => {
            if point == Some(k)
                || lo.is_some_and(|lo| lo > k)
                || hi.is_some_and(|hi| hi < k)
            {
                yes()
            } else if lo == Some(k) && hi == Some(k) {
                no()
            } else {
                AbstractValue::unknown()
            }
        }
        _ => AbstractValue::unknown(),
    }
}

/// Combine two positive (Known/Possible) values.
fn combine_positive(op: BinOp, lhs: &AbstractValue, rhs: &AbstractValue) -> AbstractValue {
    let knowledge = match (lhs.knowledge, rhs.knowledge) {
        (Some(Knowledge::Known), Some(Knowledge::Known)) => Knowledge::Known,
        _ => Knowledge::Possible,
    };

    match (&lhs.payload, &rhs.payload) {
        (Payload::Int(a), Payload::Int(b)) => combine_ints(op, *a, *b, knowledge),
        (Payload::Float(_), _) | (_, Payload::Float(_))
            if lhs.float().is_some() && rhs.float().is_some() =>
        {
            combine_floats(op, lhs.float().unwrap_or(0.0), rhs.float().unwrap_or(0.0), knowledge)
        }

        (Payload::Token(a), Payload::Token(b)) => match op {
            BinOp::Eq if a == b => AbstractValue::new(Payload::Int(1), knowledge),
            BinOp::Ne if a == b => AbstractValue::new(Payload::Int(0), knowledge),
            _ => AbstractValue::unknown(),
        },

        (Payload::ContainerSize(a), Payload::ContainerSize(b)) if op.is_comparison() => {
            combine_ints(op, *a, *b, knowledge)
        }

        (Payload::IterStart(a), Payload::IterStart(b))
        | (Payload::IterEnd(a), Payload::IterEnd(b)) => {
            if op.is_comparison() {
                combine_ints(op, *a, *b, knowledge)
            } else {
                AbstractValue::unknown()
            }
        }
        (Payload::IterStart(a), Payload::Int(b)) => {
            iter_offset(op, *a, *b, knowledge, Payload::IterStart)
        }
        (Payload::IterEnd(a), Payload::Int(b)) => {
            iter_offset(op, *a, *b, knowledge, Payload::IterEnd)
        }

        (Payload::Symbolic { anchor, delta }, Payload::Int(b)) => match op {
            BinOp::Add => match delta.checked_add(*b) {
                Some(d) => AbstractValue::new(
                    Payload::Symbolic {
                        anchor: *anchor,
                        delta: d,
                    },
                    knowledge,
                ),
                None => AbstractValue::unknown(),
            },
            BinOp::Sub => match delta.checked_sub(*b) {
                Some(d) => AbstractValue::new(
                    Payload::Symbolic {
                        anchor: *anchor,
                        delta: d,
                    },
                    knowledge,
                ),
                None => AbstractValue::unknown(),
            },
            _ => AbstractValue::unknown(),
        },
        (
            Payload::Symbolic {
                anchor: aa,
                delta: da,
            },
            Payload::Symbolic {
                anchor: ab,
                delta: db,
            },
        ) if aa == ab => {
            if op.is_comparison() {
                combine_ints(op, *da, *db, knowledge)
            } else if op == BinOp::Sub {
                match da.checked_sub(*db) {
                    Some(d) => AbstractValue::new(Payload::Int(d), knowledge),
                    None => AbstractValue::unknown(),
                }
            } else {
                AbstractValue::unknown()
            }
        }

        _ => AbstractValue::unknown(),
    }
}

fn iter_offset(
    op: BinOp,
    position: i64,
    offset: i64,
    knowledge: Knowledge,
    make: fn(i64) -> Payload,
) -> AbstractValue {
    let moved = match op {
        BinOp::Add => position.checked_add(offset),
        BinOp::Sub => position.checked_sub(offset),
        _ => None,
    };
    match moved {
        Some(p) => AbstractValue::new(make(p), knowledge),
        None => AbstractValue::unknown(),
    }
}

fn combine_ints(op: BinOp, a: i64, b: i64, knowledge: Knowledge) -> AbstractValue {
    let out = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                None
            } else {
                a.checked_div(b)
            }
        }
        BinOp::Mod => {
            if b == 0 {
                None
            } else {
                a.checked_rem(b)
            }
        }
        BinOp::Shl => shift(b).and_then(|s| a.checked_shl(s)),
        BinOp::Shr => shift(b).and_then(|s| a.checked_shr(s)),
        BinOp::BitAnd => Some(a & b),
        BinOp::BitOr => Some(a | b),
        BinOp::BitXor => Some(a ^ b),
        BinOp::Eq => Some((a == b) as i64),
        BinOp::Ne => Some((a != b) as i64),
        BinOp::Lt => Some((a < b) as i64),
        BinOp::Le => Some((a <= b) as i64),
        BinOp::Gt => Some((a > b) as i64),
        BinOp::Ge => Some((a >= b) as i64),
        BinOp::And | BinOp::Or => None,
    };
    match out {
        Some(v) => AbstractValue::new(Payload::Int(v), knowledge),
        None => AbstractValue::unknown(),
    }
}

fn shift(amount: i64) -> Option<u32> {
    u32::try_from(amount).ok().filter(|s| *s < 64)
}

fn combine_floats(op: BinOp, a: f64, b: f64, knowledge: Knowledge) -> AbstractValue {
    if op.is_comparison() {
        let out = match op {
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            _ => return AbstractValue::unknown(),
        };
        return AbstractValue::new(Payload::Int(out as i64), knowledge);
    }
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => return AbstractValue::unknown(),
    };
    if out.is_nan() || out.is_infinite() {
        AbstractValue::unknown()
    } else {
        AbstractValue::new(Payload::Float(out), knowledge)
    }
}

fn cast_value(ty: &str, v: AbstractValue) -> AbstractValue {
    if v.is_unknown() || v.is_impossible() {
        return v;
    }
    let float_target = ty.contains("float") || ty.contains("double");
    match (&v.payload, float_target) {
        (Payload::Int(i), true) => {
            let mut out = v.clone();
            out.payload = Payload::Float(*i as f64);
            out
        }
        (Payload::Float(f), false) if !ty.ends_with('*') => {
            if f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                let mut out = v.clone();
                out.payload = Payload::Int(*f as i64);
                out
            } else {
                AbstractValue::unknown()
            }
        }
        _ => v,
    }
}
