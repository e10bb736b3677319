#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use vigil_expr::{AbstractValue, Bound, ExprId, ExprTree, Identity, NodeKind, Payload};

/// One tracked fact: the value plus the node that justified it, kept so
/// multi-condition reasoning can re-inspect stored condition structure.
#[derive(Clone, Debug)]
pub struct Entry {
    pub value: AbstractValue,
    pub repr: Option<ExprId>,
}

/// Copy-on-write map from expression identity to abstract value.
///
/// `clone()` is a refcount bump; the backing map is shared until the first
/// mutation, which privatizes this handle's copy. Aliased handles on other
/// threads are safe because the refcount is atomic and a shared map is
/// never written through.
#[derive(Clone, Debug, Default)]
pub struct ProgramState {
    values: Arc<HashMap<Identity, Entry>>,
}

impl ProgramState {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_mut(&mut self) -> &mut HashMap<Identity, Entry> {
        Arc::make_mut(&mut self.values)
    }

    /// Insert or overwrite, then best-effort solve for the constrained
    /// sub-expression: an assignment to `x + 1` also pins `x`, using only
    /// currently-known integer values.
    pub fn set_value(&mut self, tree: &ExprTree, expr: ExprId, value: AbstractValue) {
        let identity = tree.identity(expr);
        if identity.is_some() {
            self.map_mut().insert(
                identity,
                Entry {
                    value: value.clone(),
                    repr: Some(expr),
                },
            );
        }
        self.solve_subexpression(tree, expr, &value);
    }

    /// Insert a fact for an identity with no node in hand (extra bindings).
    pub fn bind(&mut self, identity: Identity, value: AbstractValue) {
        if identity.is_some() {
            self.map_mut().insert(identity, Entry { value, repr: None });
        }
    }

    fn solve_subexpression(&mut self, tree: &ExprTree, expr: ExprId, value: &AbstractValue) {
        let Some(outer) = value.positive_int() else {
            return;
        };
        let Some(node) = tree.node(expr) else {
            return;
        };
        let NodeKind::Binary(op) = node.kind else {
            return;
        };
        let (Some(lhs), Some(rhs)) = (node.lhs, node.rhs) else {
            return;
        };

        // One side must be a known integer; the other inherits the solved
        // value.
        let (target, constant, const_on_left) = match (self.known_int(tree, lhs), self.known_int(tree, rhs))
        {
            (None, Some(c)) => (lhs, c, false),
            (Some(c), None) => (rhs, c, true),
            _ => return,
        };

        use vigil_expr::BinOp;
        let solved = match op {
            BinOp::Add => outer.checked_sub(constant),
            BinOp::Sub => {
                if const_on_left {
                    constant.checked_sub(outer)
                } else {
                    outer.checked_add(constant)
                }
            }
            BinOp::Mul => {
                if constant != 0 && outer % constant == 0 {
                    Some(outer / constant)
                } else {
                    None
                }
            }
            BinOp::BitXor => Some(outer ^ constant),
            _ => None,
        };
        let Some(solved) = solved else {
            return;
        };

        let mut derived = value.clone();
        derived.payload = Payload::Int(solved);
        let identity = tree.identity(target);
        if identity.is_some() {
            self.map_mut().insert(
                identity,
                Entry {
                    value: derived.clone(),
                    repr: Some(target),
                },
            );
        }
        self.solve_subexpression(tree, target, &derived);
    }

    /// A known integer for a node: a literal that fits, or a positive
    /// integer fact already tracked for its identity.
    fn known_int(&self, tree: &ExprTree, expr: ExprId) -> Option<i64> {
        let node = tree.node(expr)?;
        if let NodeKind::Int(v) = node.kind {
            return i64::try_from(v).ok();
        }
        if let NodeKind::Char(c) = node.kind {
            return Some(c as i64);
        }
        self.get_value(node.identity, false)?.positive_int()
    }

    /// The tracked value for an identity. Impossible facts are only
    /// surfaced on request; tracked-but-unknown slots never are.
    pub fn get_value(&self, identity: Identity, include_impossible: bool) -> Option<&AbstractValue> {
        let entry = self.values.get(&identity)?;
        if entry.value.is_unknown() {
            return None;
        }
        if entry.value.is_impossible() && !include_impossible {
            return None;
        }
        Some(&entry.value)
    }

    pub fn entry(&self, identity: Identity) -> Option<&Entry> {
        self.values.get(&identity)
    }

    /// Record that a container's size is exactly `n`, or anything but `n`.
    pub fn set_container_size(&mut self, tree: &ExprTree, expr: ExprId, n: i64, is_equal: bool) {
        let identity = tree.identity(expr);
        if identity.is_none() {
            return;
        }
        let value = if is_equal {
            AbstractValue::container_size(n)
        } else {
            AbstractValue::impossible_container_size(n)
        };
        self.map_mut().insert(
            identity,
            Entry {
                value,
                repr: Some(expr),
            },
        );
    }

    /// Mark an identity as examined-but-unknown, so later merges cannot
    /// resurrect a stale guess for it.
    pub fn set_unknown(&mut self, identity: Identity) {
        if identity.is_some() {
            self.map_mut().insert(
                identity,
                Entry {
                    value: AbstractValue::unknown(),
                    repr: None,
                },
            );
        }
    }

    pub fn is_tracked(&self, identity: Identity) -> bool {
        self.values.contains_key(&identity)
    }

    pub fn erase_if(&mut self, mut pred: impl FnMut(Identity, &Entry) -> bool) {
        if self.values.iter().any(|(k, e)| pred(*k, e)) {
            self.map_mut().retain(|k, e| !pred(*k, e));
        }
    }

    /// Layer another state over this one, overwriting on conflicts.
    pub fn replace(&mut self, other: &ProgramState) {
        if other.values.is_empty() {
            return;
        }
        if self.values.is_empty() {
            self.values = Arc::clone(&other.values);
            return;
        }
        let map = self.map_mut();
        for (k, e) in other.values.iter() {
            map.insert(*k, e.clone());
        }
    }

    pub fn clear(&mut self) {
        if !self.values.is_empty() {
            self.values = Arc::new(HashMap::new());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Identity, &Entry)> {
        self.values.iter().map(|(k, e)| (*k, e))
    }

    /// True when this handle still shares its backing map with another.
    pub fn shares_storage_with(&self, other: &ProgramState) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }
}

/// Normalize an impossible boolean produced by a comparison: a result that
/// necessarily excludes 0 is a known truth, one that excludes every
/// nonzero outcome is a known falsity.
pub(crate) fn normalize_impossible_bool(value: AbstractValue) -> AbstractValue {
    if !value.is_impossible() {
        return value;
    }
    match (&value.payload, value.bound) {
        (Payload::Int(0), Bound::Point) => AbstractValue::known_int(1),
        (Payload::Int(1), Bound::Point) => AbstractValue::known_int(0),
        (Payload::Int(v), Bound::Lower) if *v >= 0 => AbstractValue::known_int(1),
        (Payload::Int(v), Bound::Upper) if *v <= 1 => AbstractValue::known_int(0),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_expr::AbstractValue;

    #[test]
    fn cow_divergence_leaves_original_untouched() {
        let mut a = ProgramState::new();
        a.bind(Identity(1), AbstractValue::known_int(5));
        let mut b = a.clone();
        assert!(a.shares_storage_with(&b));

        b.bind(Identity(1), AbstractValue::known_int(9));
        assert!(!a.shares_storage_with(&b));
        assert_eq!(a.get_value(Identity(1), false), Some(&AbstractValue::known_int(5)));
        assert_eq!(b.get_value(Identity(1), false), Some(&AbstractValue::known_int(9)));

        // Divergence is symmetric: mutating the original must not leak
        // into the earlier clone either.
        a.bind(Identity(2), AbstractValue::known_int(7));
        assert!(b.get_value(Identity(2), false).is_none());
    }

    #[test]
    fn get_value_hides_impossible_unless_requested() {
        let mut state = ProgramState::new();
        state.bind(Identity(3), AbstractValue::impossible_int(0));
        assert!(state.get_value(Identity(3), false).is_none());
        assert!(state.get_value(Identity(3), true).is_some());
    }

    #[test]
    fn unknown_slots_are_tracked_but_valueless() {
        let mut state = ProgramState::new();
        state.set_unknown(Identity(4));
        assert!(state.is_tracked(Identity(4)));
        assert!(state.get_value(Identity(4), true).is_none());

        // A merge of an older snapshot must not resurrect the stale value.
        let mut old = ProgramState::new();
        old.bind(Identity(4), AbstractValue::known_int(1));
        old.replace(&state);
        assert!(old.get_value(Identity(4), true).is_none());
    }

    #[test]
    fn erase_if_removes_matching_entries() {
        let mut state = ProgramState::new();
        state.bind(Identity(1), AbstractValue::known_int(1));
        state.bind(Identity(2), AbstractValue::known_int(2));
        state.erase_if(|id, _| id == Identity(1));
        assert!(!state.is_tracked(Identity(1)));
        assert!(state.is_tracked(Identity(2)));
    }
}
