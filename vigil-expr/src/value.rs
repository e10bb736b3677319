#![forbid(unsafe_code)]

use crate::tree::{ExprId, Identity};

/// Confidence qualifier attached to an abstract value.
///
/// `Known` and `Possible` are positive facts; `Impossible` asserts the
/// exclusion of a value or range and must never be read as a positive
/// answer on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Knowledge {
    Known,
    Possible,
    Impossible,
}

/// Directionality of an `Impossible` fact.
///
/// `Point` excludes exactly the payload value, `Lower` excludes everything
/// less than or equal to it, `Upper` excludes everything greater than or
/// equal to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Bound {
    #[default]
    Point,
    Lower,
    Upper,
}

/// One possible runtime outcome of an expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Int(i64),
    Float(f64),
    /// Equals / points to the literal or object at this node.
    Token(ExprId),
    ContainerSize(i64),
    IterStart(i64),
    IterEnd(i64),
    /// Offset from the value of another expression.
    Symbolic { anchor: Identity, delta: i64 },
    Uninit,
}

/// The tagged result of evaluating an expression.
///
/// `knowledge: None` together with an `Uninit` payload is the single
/// "no information" sentinel; it is returned, never thrown, for every
/// failure mode in the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct AbstractValue {
    pub payload: Payload,
    pub knowledge: Option<Knowledge>,
    pub bound: Bound,
    pub indirection: u8,
}

impl AbstractValue {
    pub fn unknown() -> Self {
        Self {
            payload: Payload::Uninit,
            knowledge: None,
            bound: Bound::Point,
            indirection: 0,
        }
    }

    pub fn new(payload: Payload, knowledge: Knowledge) -> Self {
        Self {
            payload,
            knowledge: Some(knowledge),
            bound: Bound::Point,
            indirection: 0,
        }
    }

    pub fn known_int(v: i64) -> Self {
        Self::new(Payload::Int(v), Knowledge::Known)
    }

    pub fn possible_int(v: i64) -> Self {
        Self::new(Payload::Int(v), Knowledge::Possible)
    }

    pub fn impossible_int(v: i64) -> Self {
        Self::new(Payload::Int(v), Knowledge::Impossible)
    }

    pub fn impossible_int_bound(v: i64, bound: Bound) -> Self {
        let mut value = Self::impossible_int(v);
        value.bound = bound;
        value
    }

    pub fn known_float(v: f64) -> Self {
        Self::new(Payload::Float(v), Knowledge::Known)
    }

    pub fn known_token(node: ExprId) -> Self {
        Self::new(Payload::Token(node), Knowledge::Known)
    }

    pub fn container_size(n: i64) -> Self {
        Self::new(Payload::ContainerSize(n), Knowledge::Known)
    }

    pub fn impossible_container_size(n: i64) -> Self {
        Self::new(Payload::ContainerSize(n), Knowledge::Impossible)
    }

    pub fn is_unknown(&self) -> bool {
        self.knowledge.is_none()
    }

    pub fn is_known(&self) -> bool {
        self.knowledge == Some(Knowledge::Known)
    }

    pub fn is_possible(&self) -> bool {
        self.knowledge == Some(Knowledge::Possible)
    }

    pub fn is_impossible(&self) -> bool {
        self.knowledge == Some(Knowledge::Impossible)
    }

    /// Integer payload, regardless of qualifier.
    pub fn int(&self) -> Option<i64> {
        match self.payload {
            Payload::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn float(&self) -> Option<f64> {
        match self.payload {
            Payload::Float(v) => Some(v),
            Payload::Int(v) => Some(v as f64),
            _ => None,
        }
    }

    /// Integer payload usable as a positive fact (not impossible, not unknown).
    pub fn positive_int(&self) -> Option<i64> {
        if self.is_known() || self.is_possible() {
            self.int()
        } else {
            None
        }
    }

    /// Definitely-true under the Known/Impossible duality: a positive
    /// nonzero integer fact, or an exclusion that rules out zero.
    pub fn is_true(&self) -> bool {
        match self.knowledge {
            Some(Knowledge::Known) | Some(Knowledge::Possible) => match self.payload {
                Payload::Int(v) => v != 0,
                Payload::Float(v) => v != 0.0,
                _ => false,
            },
            Some(Knowledge::Impossible) => match (&self.payload, self.bound) {
                (Payload::Int(0), Bound::Point) => true,
                (Payload::Int(v), Bound::Lower) => *v >= 0,
                (Payload::Int(v), Bound::Upper) => *v <= 0,
                _ => false,
            },
            None => false,
        }
    }

    /// Definitely-false: a positive zero fact. Absence of a value never
    /// counts as falsity.
    pub fn is_false(&self) -> bool {
        match self.knowledge {
            Some(Knowledge::Known) | Some(Knowledge::Possible) => match self.payload {
                Payload::Int(v) => v == 0,
                Payload::Float(v) => v == 0.0,
                _ => false,
            },
            _ => false,
        }
    }

    /// True when the payload kinds match (the only values that may combine
    /// without explicit integer coercion).
    pub fn same_kind(&self, other: &AbstractValue) -> bool {
        matches!(
            (&self.payload, &other.payload),
            (Payload::Int(_), Payload::Int(_))
                | (Payload::Float(_), Payload::Float(_))
                | (Payload::Token(_), Payload::Token(_))
                | (Payload::ContainerSize(_), Payload::ContainerSize(_))
                | (Payload::IterStart(_), Payload::IterStart(_))
                | (Payload::IterEnd(_), Payload::IterEnd(_))
                | (Payload::Symbolic { .. }, Payload::Symbolic { .. })
                | (Payload::Uninit, Payload::Uninit)
        )
    }

    /// Human-readable form, used by diagnostics and the CLI.
    pub fn display(&self) -> String {
        let tag = match self.knowledge {
            None => return "<unknown>".to_string(),
            Some(Knowledge::Known) => "",
            Some(Knowledge::Possible) => "possible ",
            Some(Knowledge::Impossible) => match self.bound {
                Bound::Point => "!= ",
                Bound::Lower => "> ",
                Bound::Upper => "< ",
            },
        };
        let payload = match &self.payload {
            Payload::Int(v) => v.to_string(),
            Payload::Float(v) => v.to_string(),
            Payload::Token(id) => format!("tok#{}", id.0),
            Payload::ContainerSize(n) => format!("size {n}"),
            Payload::IterStart(n) => format!("iter-start {n}"),
            Payload::IterEnd(n) => format!("iter-end {n}"),
            Payload::Symbolic { anchor, delta } => {
                if *delta == 0 {
                    format!("expr#{}", anchor.0)
                } else {
                    format!("expr#{}{:+}", anchor.0, delta)
                }
            }
            Payload::Uninit => "uninit".to_string(),
        };
        format!("{tag}{payload}")
    }
}
