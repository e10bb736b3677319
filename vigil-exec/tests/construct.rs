use vigil_exec::{
    build_initial_state, Evaluator, ExecConfig, GraphOracle, NoOracle, ProgramState, Services,
    StateCursor, StdLibrary, TemplateCache,
};
use vigil_expr::{
    AbstractValue, ExprId, ExprTree, Identity, Knowledge, NodeKind, Payload, Point, ScopeKind,
    StmtKind,
};
use vigil_parse::parse_unit;

fn ident_of(tree: &ExprTree, name: &str) -> Identity {
    tree.nodes
        .iter()
        .find(|n| matches!(&n.kind, NodeKind::Name(s) if s == name))
        .map(|n| n.identity)
        .expect("variable not found")
}

fn last_expr(tree: &ExprTree) -> (Point, ExprId) {
    for i in (0..tree.stmts.len()).rev() {
        let p = Point(i as u32);
        if let Some(StmtKind::Expr(e)) = tree.stmt(p).map(|s| &s.kind) {
            return (p, *e);
        }
    }
    panic!("no expression statement");
}

fn expr_in_scope(tree: &ExprTree, kind: ScopeKind) -> (Point, ExprId) {
    for (i, stmt) in tree.stmts.iter().enumerate() {
        let scope = tree.scope(stmt.scope).unwrap();
        if scope.kind == kind {
            if let StmtKind::Expr(e) = &stmt.kind {
                return (Point(i as u32), *e);
            }
        }
    }
    panic!("no expression statement in scope");
}

macro_rules! services {
    ($services:ident) => {
        let oracle = GraphOracle;
        let library = StdLibrary;
        let bounds = NoOracle;
        let templates = TemplateCache::new();
        let $services = Services::new(&oracle, &library, &bounds, &templates);
    };
}

fn state_at(tree: &ExprTree, services: &Services, point: Point) -> (ProgramState, ExecConfig) {
    let config = ExecConfig::default();
    let state = build_initial_state(tree, services, &config, point, None, &ProgramState::new());
    (state, config)
}

#[test]
fn enclosing_condition_is_true_inside_then_branch() {
    services!(services);
    let tree = parse_unit("int n; if (n > 0) { n > 0; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::If);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_true());

    // The condition constrains `n` without pinning a concrete value.
    let n = ident_of(&tree, "n");
    let v = state.get_value(n, true).cloned().unwrap();
    assert!(v.positive_int().is_none());
    assert!(v.is_impossible());
}

#[test]
fn else_branch_negates_the_condition() {
    services!(services);
    let tree = parse_unit("int n; if (n > 0) { n; } else { n > 0; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::Else);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_false());
}

#[test]
fn preceding_assignment_reaches_the_query() {
    services!(services);
    let tree = parse_unit("int n = 5; n + 3;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(8)
    );
}

#[test]
fn assignment_chain_resolves_through_variables() {
    services!(services);
    let tree = parse_unit("int a = 2; int b = a + 1; b;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(3)
    );
}

#[test]
fn reassigned_variable_uses_the_latest_value() {
    services!(services);
    let tree = parse_unit("int x = 1; x = 2; x;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(2)
    );
}

#[test]
fn assignment_in_uncertain_branch_invalidates() {
    services!(services);
    let tree = parse_unit("int x = 1; int c; if (c) { x = 2; } x;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_unknown());
}

#[test]
fn untaken_branch_is_skipped_from_the_else_side() {
    services!(services);
    let tree = parse_unit("int x = 1; int c; if (c) { x = 2; } else { x; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::Else);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(1)
    );
}

#[test]
fn provably_taken_branch_is_walked_through() {
    services!(services);
    let tree = parse_unit("int x = 1; if (1) { x = 2; } x;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(2)
    );
}

#[test]
fn anonymous_block_is_transparent() {
    services!(services);
    let tree = parse_unit("int x; { x = 4; } x;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(4)
    );
}

#[test]
fn do_body_is_transparent() {
    services!(services);
    let tree = parse_unit("int x; int c; do { x = 3; } while (c); x;").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(3)
    );
}

#[test]
fn nested_conditions_compose() {
    services!(services);
    let tree = parse_unit("int a; int b; if (a > 0) { if (b == 2) { a > 0 && b == 2; } }").unwrap();
    let (point, root) = last_expr(&tree);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_true());
}

#[test]
fn condition_uses_previously_assigned_constant() {
    services!(services);
    let tree = parse_unit("int n; int k = 5; if (n > k) { n > 4; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::If);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_true());
}

#[test]
fn loop_condition_holds_at_body_start() {
    services!(services);
    let tree = parse_unit("int n; while (n > 0) { n > 0; n--; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::While);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_true());
}

#[test]
fn pre_loop_value_dies_across_the_back_edge() {
    services!(services);
    // `x` is rewritten later in the loop body, so its pre-loop value does
    // not survive into the second iteration.
    let tree = parse_unit("int x = 1; int c; while (c) { x; x = 2; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::While);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert!(evaluator.evaluate(&mut state, root).is_unknown());
}

#[test]
fn in_loop_rewrite_reestablishes_the_value() {
    services!(services);
    let tree = parse_unit("int x; int c; while (c) { x = 7; x; x = 8; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::While);
    let (mut state, config) = state_at(&tree, &services, point);

    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(7)
    );
}

#[test]
fn declaration_without_initializer_is_uninit() {
    services!(services);
    let tree = parse_unit("int x; x;").unwrap();
    let (point, _) = last_expr(&tree);
    let (state, _) = state_at(&tree, &services, point);

    let v = state.get_value(ident_of(&tree, "x"), false).cloned().unwrap();
    assert_eq!(
        v,
        AbstractValue::new(Payload::Uninit, Knowledge::Known)
    );
}

#[test]
fn extra_bindings_survive_construction() {
    services!(services);
    let tree = parse_unit("int x; x + 1;").unwrap();
    let (point, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut extra = ProgramState::new();
    extra.bind(ident_of(&tree, "x"), AbstractValue::known_int(9));

    let mut state = build_initial_state(&tree, &services, &config, point, None, &extra);
    let evaluator = Evaluator::new(&tree, &services, &config);
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(10)
    );
}

#[test]
fn anchor_eviction_asks_the_oracle() {
    services!(services);
    let tree = parse_unit("int x = 5; x = 6; x;").unwrap();
    let (point, _) = last_expr(&tree);
    let config = ExecConfig::default();

    // Anchored before the second assignment, the tracked value for `x`
    // may have changed on the way to the query and must be dropped.
    let anchored = build_initial_state(
        &tree,
        &services,
        &config,
        point,
        Some(Point(1)),
        &ProgramState::new(),
    );
    assert!(anchored.get_value(ident_of(&tree, "x"), true).is_none());
}

// Cursor.

#[test]
fn cursor_assume_and_retract_round_trip() {
    services!(services);
    let tree = parse_unit("int n; if (n > 0) { n; }").unwrap();
    let cond = tree
        .scopes
        .iter()
        .find(|s| s.kind == ScopeKind::If)
        .and_then(|s| s.condition)
        .unwrap();
    let config = ExecConfig::default();
    let evaluator = Evaluator::new(&tree, &services, &config);

    let mut cursor = StateCursor::new(&tree, &services, &config);
    cursor.assume(cond, true, false);
    let mut state = cursor.state().clone();
    assert!(evaluator.evaluate(&mut state, cond).is_true());

    let mut cursor = StateCursor::new(&tree, &services, &config);
    cursor.assume(cond, false, false);
    let mut state = cursor.state().clone();
    assert!(evaluator.evaluate(&mut state, cond).is_false());
}

#[test]
fn cursor_get_revalidates_and_rederives() {
    services!(services);
    let tree = parse_unit("int x = 5; x; x = 6; x;").unwrap();
    let config = ExecConfig::default();
    let evaluator = Evaluator::new(&tree, &services, &config);

    // Prime the cursor at the first read of `x`.
    let first_read = Point(1);
    let mut cursor = StateCursor::new(&tree, &services, &config);
    cursor.add_state(first_read, &ProgramState::new());
    assert_eq!(
        cursor.state().get_value(ident_of(&tree, "x"), false),
        Some(&AbstractValue::known_int(5))
    );

    // Querying past the reassignment drops the stale entry and derives
    // the new one.
    let (last_read, root) = last_expr(&tree);
    let mut state = cursor.get(last_read, None, &ProgramState::new());
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(6)
    );
}

#[test]
fn cursor_remove_modified_vars_keeps_untouched_entries() {
    services!(services);
    let tree = parse_unit("int x = 5; int y = 1; x = 6; x; y;").unwrap();
    let config = ExecConfig::default();

    let mut cursor = StateCursor::new(&tree, &services, &config);
    cursor.add_state(Point(2), &ProgramState::new());
    let (last, _) = last_expr(&tree);
    cursor.remove_modified_vars(last);

    // `x` was reassigned on the way, `y` was not.
    assert!(cursor.state().get_value(ident_of(&tree, "x"), true).is_none());
    assert_eq!(
        cursor.state().get_value(ident_of(&tree, "y"), false),
        Some(&AbstractValue::known_int(1))
    );
}

#[test]
fn cursor_emptiness_assumption() {
    services!(services);
    let tree = parse_unit("c.empty();").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let evaluator = Evaluator::new(&tree, &services, &config);

    let c = tree
        .nodes
        .iter()
        .enumerate()
        .find(|(_, n)| matches!(&n.kind, NodeKind::Name(s) if s == "c"))
        .map(|(i, _)| ExprId(i as u32))
        .unwrap();

    let mut cursor = StateCursor::new(&tree, &services, &config);
    cursor.assume(c, true, true);
    let mut state = cursor.state().clone();
    assert!(evaluator.evaluate(&mut state, root).is_true());
}
