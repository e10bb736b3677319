#![forbid(unsafe_code)]

use std::collections::HashMap;

use vigil_expr::{ExprId, ExprTree, Identity, NodeKind, UnOp};

/// Assign shared identities to pure compound expressions.
///
/// Two structurally identical pure expressions over the same operands
/// denote the same runtime entity, so they share one identity (the
/// analogue of variable reads sharing theirs). Side-effecting nodes
/// (assignments, increments, calls, comma, ternary) and bare literals keep
/// identity 0.
///
/// Nodes are created children-first by the parser, so one pass in index
/// order sees every operand's identity before the operator's.
pub(crate) fn assign_compound_identities(tree: &mut ExprTree, next: &mut u64) {
    let mut consed: HashMap<String, Identity> = HashMap::new();

    for i in 0..tree.nodes.len() {
        let id = ExprId(i as u32);
        let (key, unsigned) = match cons_key(tree, id) {
            Some(kv) => kv,
            None => continue,
        };
        let identity = *consed.entry(key).or_insert_with(|| {
            let fresh = Identity(*next);
            *next += 1;
            fresh
        });
        if let Some(node) = tree.node_mut(id) {
            node.identity = identity;
            node.unsigned = unsigned;
        }
    }
}

/// Structural key for one operand: its identity if it has one, the literal
/// value for identity-free literals, `None` for anything else.
fn child_key(tree: &ExprTree, id: Option<ExprId>) -> Option<(String, bool)> {
    let node = tree.node(id?)?;
    if node.identity.is_some() {
        return Some((format!("e{}", node.identity.0), node.unsigned));
    }
    match &node.kind {
        NodeKind::Int(v) => Some((format!("n{v}"), node.unsigned)),
        NodeKind::Char(c) => Some((format!("ch{}", *c as u32), false)),
        NodeKind::Bool(b) => Some((format!("tf{b}"), false)),
        NodeKind::Float(v) => Some((format!("f{}", v.to_bits()), false)),
        NodeKind::Str(s) => Some((format!("s{s}"), false)),
        _ => None,
    }
}

/// Structural key for a consable node, or `None` when the node keeps its
/// current identity (names already have one; impure nodes get none).
fn cons_key(tree: &ExprTree, id: ExprId) -> Option<(String, bool)> {
    let node = tree.node(id)?;
    if node.identity.is_some() {
        return None;
    }
    match &node.kind {
        NodeKind::Binary(op) => {
            let (l, lu) = child_key(tree, node.lhs)?;
            let (r, ru) = child_key(tree, node.rhs)?;
            let unsigned = if op.is_comparison() || op.is_logical() {
                false
            } else {
                lu || ru
            };
            Some((format!("b{}#{l}#{r}", op.display()), unsigned))
        }
        NodeKind::Unary(op) => {
            let (l, lu) = child_key(tree, node.lhs)?;
            let unsigned = matches!(op, UnOp::Neg | UnOp::Plus | UnOp::BitNot) && lu;
            Some((format!("u{op:?}#{l}"), unsigned))
        }
        NodeKind::Index => {
            let (l, _) = child_key(tree, node.lhs)?;
            let (r, _) = child_key(tree, node.rhs)?;
            Some((format!("i#{l}#{r}"), false))
        }
        NodeKind::Member { name } => {
            let (l, _) = child_key(tree, node.lhs)?;
            Some((format!("m{name}#{l}"), false))
        }
        NodeKind::Cast { ty } => {
            let (l, _) = child_key(tree, node.lhs)?;
            Some((format!("c{ty}#{l}"), node.unsigned))
        }
        _ => None,
    }
}
