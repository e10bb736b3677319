#![forbid(unsafe_code)]

use std::collections::HashMap;

use vigil_expr::{ExprId, ExprTree, Identity, Point};

use crate::construct::{build_initial_state, parse_condition};
use crate::eval::{Ctx, Evaluator, ExecConfig};
use crate::services::Services;
use crate::state::ProgramState;

/// A reusable, mutable wrapper around one evolving program state, for
/// callers issuing many queries across a traversal. Each tracked identity
/// remembers the point that justified its value, so moving the query
/// point re-validates entries instead of rebuilding from scratch.
#[derive(Clone)]
pub struct StateCursor<'a> {
    tree: &'a ExprTree,
    services: &'a Services<'a>,
    config: &'a ExecConfig,
    state: ProgramState,
    origins: HashMap<Identity, Point>,
}

impl<'a> StateCursor<'a> {
    pub fn new(tree: &'a ExprTree, services: &'a Services<'a>, config: &'a ExecConfig) -> Self {
        Self {
            tree,
            services,
            config,
            state: ProgramState::new(),
            origins: HashMap::new(),
        }
    }

    pub fn state(&self) -> &ProgramState {
        &self.state
    }

    /// Layer fresh condition/assignment facts derived at `point` over the
    /// current state, tagging every (re)derived identity with `point` as
    /// its origin.
    pub fn add_state(&mut self, point: Point, bindings: &ProgramState) {
        let built = build_initial_state(self.tree, self.services, self.config, point, None, bindings);
        for (ident, _) in built.entries() {
            self.origins.insert(ident, point);
        }
        self.state.replace(&built);
    }

    /// Assert one condition's truth or falsity (or, for
    /// `container_emptiness`, that the container expression is/is not
    /// empty), re-anchoring origins past the corresponding control
    /// construct.
    pub fn assume(&mut self, cond: ExprId, truth: bool, container_emptiness: bool) {
        if container_emptiness {
            self.state.set_container_size(self.tree, cond, 0, truth);
        } else {
            let ev = Evaluator::new(self.tree, self.services, self.config);
            let mut ctx = Ctx::new(self.config);
            parse_condition(&ev, &mut ctx, &mut self.state, cond, truth);
        }

        let origin = self
            .tree
            .scopes
            .iter()
            .find(|s| s.kind.is_conditional() && s.condition == Some(cond))
            .map(|s| if truth { s.first } else { s.end });
        let Some(origin) = origin else {
            return;
        };
        for sub in self.tree.subexprs(cond) {
            let identity = self.tree.identity(sub);
            if identity.is_some() && self.state.is_tracked(identity) {
                self.origins.insert(identity, origin);
            }
        }
    }

    /// Re-validate every tracked identity against its origin and drop
    /// whatever the mutation oracle no longer vouches for, resolving
    /// indeterminate oracle answers by re-executing small conditions
    /// against the current state.
    pub fn remove_modified_vars(&mut self, point: Point) {
        let entries: Vec<(Identity, Option<ExprId>)> = self
            .state
            .entries()
            .map(|(ident, entry)| (ident, entry.repr))
            .collect();

        let ev = Evaluator::new(self.tree, self.services, self.config);
        let mut stale: Vec<Identity> = Vec::new();
        for (ident, repr) in entries {
            let origin = self.origins.get(&ident).copied().unwrap_or(point);
            if origin == point {
                continue;
            }
            let Some(repr) = repr.or_else(|| self.tree.node_with_identity(ident)) else {
                continue;
            };
            let snapshot = self.state.clone();
            let mut eval_cb = |expr: ExprId| {
                let mut ctx = Ctx::new(self.config);
                let mut scratch = snapshot.clone();
                ev.eval(&mut ctx, &mut scratch, expr)
            };
            if self
                .services
                .oracle
                .may_change_with(self.tree, repr, origin, point, &mut eval_cb)
            {
                stale.push(ident);
            }
        }
        for ident in &stale {
            self.origins.remove(ident);
        }
        self.state.erase_if(|ident, _| stale.contains(&ident));
    }

    /// Compose a final immutable state for a query at `target`,
    /// optionally layering `context` first. The cursor itself is not
    /// advanced.
    pub fn get(&self, target: Point, context: Option<Point>, bindings: &ProgramState) -> ProgramState {
        let mut cursor = self.clone();
        match context {
            Some(context) => {
                cursor.add_state(context, bindings);
                if context < target {
                    cursor.remove_modified_vars(target);
                    cursor.add_state(target, &ProgramState::new());
                } else {
                    cursor.remove_modified_vars(context);
                }
            }
            None => {
                cursor.remove_modified_vars(target);
                cursor.add_state(target, bindings);
            }
        }
        cursor.state
    }
}
