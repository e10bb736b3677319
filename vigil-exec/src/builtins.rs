#![forbid(unsafe_code)]

use vigil_expr::{AbstractValue, ExprTree, Knowledge, NodeKind, Payload};

const NAMES: &[&str] = &[
    "strlen", "strcmp", "strncmp", "abs", "labs", "llabs", "fabs", "sin", "cos", "tan", "asin",
    "acos", "atan", "exp", "log", "log10", "sqrt", "floor", "ceil", "pow",
];

pub(crate) fn is_builtin(name: &str) -> bool {
    NAMES.contains(&name)
}

/// Weakest qualifier across the arguments; `None` when any argument is not
/// a positive fact.
fn joint_knowledge(args: &[AbstractValue]) -> Option<Knowledge> {
    let mut knowledge = Knowledge::Known;
    for a in args {
        match a.knowledge {
            Some(Knowledge::Known) => {}
            Some(Knowledge::Possible) => knowledge = Knowledge::Possible,
            _ => return None,
        }
    }
    Some(knowledge)
}

fn literal_str<'a>(tree: &'a ExprTree, value: &AbstractValue) -> Option<&'a str> {
    let Payload::Token(id) = value.payload else {
        return None;
    };
    match tree.node(id).map(|n| &n.kind) {
        Some(NodeKind::Str(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn cmp_to_int(ord: std::cmp::Ordering) -> i64 {
    match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Evaluate a call to a known pure function. Every precondition failure
/// (wrong arity, non-literal string, non-numeric operand, domain error)
/// yields Unknown rather than a guess.
pub(crate) fn eval_builtin(tree: &ExprTree, name: &str, args: &[AbstractValue]) -> AbstractValue {
    let Some(knowledge) = joint_knowledge(args) else {
        return AbstractValue::unknown();
    };
    let int = |v: i64| AbstractValue::new(Payload::Int(v), knowledge);
    let float = |v: f64| {
        if v.is_nan() || v.is_infinite() {
            AbstractValue::unknown()
        } else {
            AbstractValue::new(Payload::Float(v), knowledge)
        }
    };

    match (name, args) {
        ("strlen", [s]) => match literal_str(tree, s) {
            Some(s) => int(s.len() as i64),
            None => AbstractValue::unknown(),
        },
        ("strcmp", [a, b]) => match (literal_str(tree, a), literal_str(tree, b)) {
            (Some(a), Some(b)) => int(cmp_to_int(a.cmp(b))),
            _ => AbstractValue::unknown(),
        },
        ("strncmp", [a, b, n]) => {
            let (Some(a), Some(b), Some(n)) =
                (literal_str(tree, a), literal_str(tree, b), n.positive_int())
            else {
                return AbstractValue::unknown();
            };
            if n < 0 {
                return AbstractValue::unknown();
            }
            // Lexicographic byte order also handles a terminator inside
            // the compared window: the shorter prefix sorts first.
            let n = n as usize;
            let (ap, bp) = (&a.as_bytes()[..a.len().min(n)], &b.as_bytes()[..b.len().min(n)]);
            int(cmp_to_int(ap.cmp(bp)))
        }
        ("abs" | "labs" | "llabs", [a]) => match a.positive_int() {
            Some(v) => match v.checked_abs() {
                Some(abs) => int(abs),
                None => AbstractValue::unknown(),
            },
            None => AbstractValue::unknown(),
        },
        ("fabs", [a]) => match a.float() {
            Some(v) => float(v.abs()),
            None => AbstractValue::unknown(),
        },
        ("pow", [a, b]) => match (a.float(), b.float()) {
            (Some(a), Some(b)) => float(a.powf(b)),
            _ => AbstractValue::unknown(),
        },
        (_, [a]) => {
            let Some(v) = a.float() else {
                return AbstractValue::unknown();
            };
            let out = match name {
                "sin" => v.sin(),
                "cos" => v.cos(),
                "tan" => v.tan(),
                "asin" => v.asin(),
                "acos" => v.acos(),
                "atan" => v.atan(),
                "exp" => v.exp(),
                "log" => v.ln(),
                "log10" => v.log10(),
                "sqrt" => v.sqrt(),
                "floor" => v.floor(),
                "ceil" => v.ceil(),
                _ => return AbstractValue::unknown(),
            };
            float(out)
        }
        _ => AbstractValue::unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_expr::Node;

    fn tree_with_str(s: &str) -> (ExprTree, AbstractValue) {
        let mut tree = ExprTree::new();
        let id = tree.push_node(Node::new(NodeKind::Str(s.to_string()), vigil_expr::span(0, 0)));
        (tree, AbstractValue::known_token(id))
    }

    #[test]
    fn strlen_of_literal() {
        let (tree, s) = tree_with_str("abc");
        let out = eval_builtin(&tree, "strlen", &[s]);
        assert_eq!(out, AbstractValue::known_int(3));
    }

    #[test]
    fn strcmp_orders_literals() {
        let (mut tree, a) = tree_with_str("abc");
        let b_id = tree.push_node(Node::new(
            NodeKind::Str("abd".to_string()),
            vigil_expr::span(0, 0),
        ));
        let b = AbstractValue::known_token(b_id);
        assert_eq!(
            eval_builtin(&tree, "strcmp", &[a, b]),
            AbstractValue::known_int(-1)
        );
    }

    #[test]
    fn wrong_arity_is_unknown() {
        let tree = ExprTree::new();
        let out = eval_builtin(&tree, "sin", &[]);
        assert!(out.is_unknown());
    }

    #[test]
    fn domain_error_is_unknown() {
        let tree = ExprTree::new();
        let out = eval_builtin(&tree, "sqrt", &[AbstractValue::known_float(-1.0)]);
        assert!(out.is_unknown());
    }

    #[test]
    fn possible_arguments_stay_possible() {
        let tree = ExprTree::new();
        let out = eval_builtin(&tree, "abs", &[AbstractValue::possible_int(-4)]);
        assert_eq!(out, AbstractValue::possible_int(4));
    }
}
