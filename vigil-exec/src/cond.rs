#![forbid(unsafe_code)]

use vigil_expr::{AbstractValue, BinOp, ExprId, NodeKind};

use crate::construct::parse_condition;
use crate::eval::{Ctx, Evaluator};
use crate::state::ProgramState;

/// Flattened `&&`/`||` trees larger than this are not reasoned about.
const MAX_LEAVES: usize = 8;

/// Evaluate a logical `&&`/`||` tree against the state, reconciling it
/// with previously recorded conditions instead of naive two-operand
/// short-circuiting.
pub(crate) fn eval_multi_condition(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    expr: ExprId,
    op: BinOp,
) -> AbstractValue {
    let Some(node) = ev.tree.node(expr) else {
        return AbstractValue::unknown();
    };

    // The exact condition may have been recorded wholesale.
    if node.identity.is_some() {
        if let Some(entry) = state.entry(node.identity) {
            if !entry.value.is_unknown() && entry.value.int().is_some() {
                return entry.value.clone();
            }
        }
    }

    let Some((lhs, rhs)) = node.lhs.zip(node.rhs) else {
        return AbstractValue::unknown();
    };

    // Without stable identities on both sides there is nothing to match
    // against; fall back to plain short-circuit evaluation.
    if ev.tree.identity(lhs).is_none() || ev.tree.identity(rhs).is_none() {
        return structural(ev, ctx, state, lhs, rhs, op);
    }

    let mut leaves = Vec::new();
    if !flatten(ev, expr, op, &mut leaves) {
        return AbstractValue::unknown();
    }

    // Evaluate every leaf once, short-circuiting on the determining
    // polarity (any-true for ||, any-false for &&).
    let determining = op == BinOp::Or;
    let mut pinned: Vec<Option<bool>> = vec![None; leaves.len()];
    let mut unresolved = 0usize;
    for (i, leaf) in leaves.iter().enumerate() {
        let v = ev.eval(ctx, state, *leaf);
        if v.is_true() {
            pinned[i] = Some(true);
            if determining {
                return AbstractValue::known_int(1);
            }
        } else if v.is_false() {
            pinned[i] = Some(false);
            if !determining {
                return AbstractValue::known_int(0);
            }
        } else {
            unresolved += 1;
        }
    }
    if unresolved == 0 {
        // Every leaf resolved to the non-determining polarity.
        return AbstractValue::known_int((op == BinOp::And) as i64);
    }

    // Look for a recorded condition with the same operator and leaf count
    // whose unmatched leaves are pairwise equivalent to ours.
    let our_ids: Vec<_> = leaves.iter().map(|l| ev.tree.identity(*l)).collect();
    let candidates: Vec<(ExprId, AbstractValue)> = state
        .entries()
        .filter(|(ident, _)| *ident != node.identity)
        .filter_map(|(_, entry)| {
            let repr = entry.repr?;
            let rnode = ev.tree.node(repr)?;
            if !matches!(rnode.kind, NodeKind::Binary(o) if o == op) {
                return None;
            }
            if !entry.value.is_true() && !entry.value.is_false() {
                return None;
            }
            Some((repr, entry.value.clone()))
        })
        .collect();

    'candidate: for (repr, stored) in candidates {
        let mut their_leaves = Vec::new();
        if !flatten(ev, repr, op, &mut their_leaves) {
            continue;
        }
        if their_leaves.len() != leaves.len() {
            continue;
        }
        let their_ids: Vec<_> = their_leaves.iter().map(|l| ev.tree.identity(*l)).collect();

        let ours_extra: Vec<ExprId> = leaves
            .iter()
            .enumerate()
            .filter(|(i, _)| pinned[*i].is_none())
            .filter(|(i, _)| !their_ids.contains(&our_ids[*i]))
            .map(|(_, l)| *l)
            .collect();
        let theirs_extra: Vec<ExprId> = their_leaves
            .iter()
            .filter(|l| !our_ids.contains(&ev.tree.identity(**l)))
            .copied()
            .collect();
        if ours_extra.len() != theirs_extra.len() {
            continue;
        }

        let mut used = vec![false; theirs_extra.len()];
        for a in &ours_extra {
            let mut matched = false;
            for (j, b) in theirs_extra.iter().enumerate() {
                if used[j] {
                    continue;
                }
                if equivalent(ev, ctx, state, *a, *b) {
                    used[j] = true;
                    matched = true;
                    break;
                }
            }
            if !matched {
                continue 'candidate;
            }
        }
        return stored;
    }

    AbstractValue::unknown()
}

fn structural(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &mut ProgramState,
    lhs: ExprId,
    rhs: ExprId,
    op: BinOp,
) -> AbstractValue {
    let lv = ev.eval(ctx, state, lhs);
    match op {
        BinOp::And => {
            if lv.is_false() {
                return AbstractValue::known_int(0);
            }
            let rv = ev.eval(ctx, state, rhs);
            if rv.is_false() {
                return AbstractValue::known_int(0);
            }
            if lv.is_true() && rv.is_true() {
                return AbstractValue::known_int(1);
            }
            AbstractValue::unknown()
        }
        BinOp::Or => {
            if lv.is_true() {
                return AbstractValue::known_int(1);
            }
            let rv = ev.eval(ctx, state, rhs);
            if rv.is_true() {
                return AbstractValue::known_int(1);
            }
            if lv.is_false() && rv.is_false() {
                return AbstractValue::known_int(0);
            }
            AbstractValue::unknown()
        }
        _ => AbstractValue::unknown(),
    }
}

/// Collect the leaves of a homogeneous `&&`/`||` tree. Fails on oversized
/// trees; a mixed tree simply contributes its mixed node as one leaf.
fn flatten(ev: &Evaluator, expr: ExprId, op: BinOp, out: &mut Vec<ExprId>) -> bool {
    let Some(node) = ev.tree.node(expr) else {
        return false;
    };
    if let NodeKind::Binary(o) = node.kind {
        if o == op {
            let (Some(lhs), Some(rhs)) = (node.lhs, node.rhs) else {
                return false;
            };
            return flatten(ev, lhs, op, out) && flatten(ev, rhs, op, out);
        }
    }
    if out.len() >= MAX_LEAVES {
        return false;
    }
    out.push(expr);
    true
}

/// Two leaves are interchangeable when asserting either one pins the
/// other to true under the current state.
fn equivalent(ev: &Evaluator, ctx: &mut Ctx, state: &ProgramState, a: ExprId, b: ExprId) -> bool {
    implies(ev, ctx, state, a, b) && implies(ev, ctx, state, b, a)
}

fn implies(
    ev: &Evaluator,
    ctx: &mut Ctx,
    state: &ProgramState,
    premise: ExprId,
    conclusion: ExprId,
) -> bool {
    let mut scratch = state.clone();
    parse_condition(ev, ctx, &mut scratch, premise, true);
    ev.eval(ctx, &mut scratch, conclusion).is_true()
}
