use vigil_exec::{
    build_initial_state, BoundInference, ContainerYield, Evaluator, ExecConfig, GraphOracle,
    LibraryModel, NoOracle, ProgramState, Services, StdLibrary, TemplateCache,
};
use vigil_expr::{
    AbstractValue, BinOp, ExprId, ExprTree, Identity, NodeKind, Point, ScopeKind, StmtKind,
};
use vigil_parse::parse_unit;

fn ident_of(tree: &ExprTree, name: &str) -> Identity {
    tree.nodes
        .iter()
        .find(|n| matches!(&n.kind, NodeKind::Name(s) if s == name))
        .map(|n| n.identity)
        .expect("variable not found")
}

fn node_of(tree: &ExprTree, name: &str) -> ExprId {
    tree.nodes
        .iter()
        .enumerate()
        .find(|(_, n)| matches!(&n.kind, NodeKind::Name(s) if s == name))
        .map(|(i, _)| ExprId(i as u32))
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

/// First expression statement inside a scope of the given kind.
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

#[test]
fn known_binding_feeds_arithmetic() {
    services!(services);
    let tree = parse_unit("int x; x + 3;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "x"), AbstractValue::known_int(5));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(8));
}

#[test]
fn pure_evaluation_has_no_side_effects() {
    services!(services);
    let tree = parse_unit("int x; int y; x * 2 + y;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "x"), AbstractValue::known_int(3));

    let before = state.len();
    let evaluator = Evaluator::new(&tree, &services, &config);
    let first = evaluator.evaluate(&mut state, root);
    assert_eq!(state.len(), before);
    let second = evaluator.evaluate(&mut state, root);
    assert_eq!(first, second);
}

#[test]
fn assignment_updates_only_its_target() {
    services!(services);
    let tree = parse_unit("int x; int y; x = 5;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "y"), AbstractValue::known_int(1));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(5));
    assert_eq!(
        state.get_value(ident_of(&tree, "x"), false),
        Some(&AbstractValue::known_int(5))
    );
    assert_eq!(
        state.get_value(ident_of(&tree, "y"), false),
        Some(&AbstractValue::known_int(1))
    );
}

#[test]
fn compound_assignment_applies_operator() {
    services!(services);
    let tree = parse_unit("int x; x += 3;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "x"), AbstractValue::known_int(5));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(8));
    assert_eq!(
        state.get_value(ident_of(&tree, "x"), false),
        Some(&AbstractValue::known_int(8))
    );
}

#[test]
fn unsigned_decrement_below_zero_is_refused() {
    services!(services);
    let tree = parse_unit("unsigned int u; u--;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "u"), AbstractValue::known_int(0));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
    // The refused update leaves the old value in place.
    assert_eq!(
        state.get_value(ident_of(&tree, "u"), false),
        Some(&AbstractValue::known_int(0))
    );
}

#[test]
fn increment_without_prior_value_is_unknown() {
    services!(services);
    let tree = parse_unit("int x; x++;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
}

#[test]
fn postfix_and_prefix_increment_differ() {
    services!(services);
    let tree = parse_unit("int x; x++; ++x;").unwrap();
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "x"), AbstractValue::known_int(7));
    let evaluator = Evaluator::new(&tree, &services, &config);

    let roots: Vec<ExprId> = tree
        .stmts
        .iter()
        .filter_map(|s| match &s.kind {
            StmtKind::Expr(e) => Some(*e),
            _ => None,
        })
        .collect();
    assert_eq!(
        evaluator.evaluate(&mut state, roots[0]),
        AbstractValue::known_int(7)
    );
    assert_eq!(
        evaluator.evaluate(&mut state, roots[1]),
        AbstractValue::known_int(9)
    );
}

#[test]
fn literal_string_indexing() {
    services!(services);
    let config = ExecConfig::default();

    let cases = [
        ("\"abc\"[1];", Some('b' as i64)),
        ("\"abc\"[3];", Some(0)),
        ("\"abc\"[4];", None),
    ];
    for (src, expected) in cases {
        let tree = parse_unit(src).unwrap();
        let (_, root) = last_expr(&tree);
        let mut state = ProgramState::new();
        let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
        match expected {
            Some(n) => assert_eq!(v, AbstractValue::known_int(n), "case {src}"),
            None => assert!(v.is_unknown(), "case {src}"),
        }
    }
}

#[test]
fn ternary_takes_only_the_resolved_branch() {
    services!(services);
    let tree = parse_unit("int c; c ? 10 : 20;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let evaluator = Evaluator::new(&tree, &services, &config);

    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "c"), AbstractValue::known_int(1));
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(10)
    );

    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "c"), AbstractValue::known_int(0));
    assert_eq!(
        evaluator.evaluate(&mut state, root),
        AbstractValue::known_int(20)
    );

    let mut state = ProgramState::new();
    assert!(evaluator.evaluate(&mut state, root).is_unknown());
}

#[test]
fn comma_discards_the_left_operand() {
    services!(services);
    let tree = parse_unit("int x; x, 2;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(2));
}

#[test]
fn and_with_one_true_leaf_stays_unknown() {
    services!(services);
    let tree = parse_unit("int a; int b; a == 1 && b == 2;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "a"), AbstractValue::known_int(1));

    // One satisfied conjunct must not resolve the conjunction.
    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
}

#[test]
fn and_with_one_false_leaf_is_false() {
    services!(services);
    let tree = parse_unit("int a; int b; a == 1 && b == 2;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "a"), AbstractValue::known_int(7));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(0));
}

#[test]
fn commuted_condition_resolves_from_recorded_leaves() {
    services!(services);
    let tree = parse_unit("int a; int b; if (a && b) { b && a; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::If);
    let config = ExecConfig::default();
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_true());
}

#[test]
fn negated_conjunction_matches_stored_condition() {
    services!(services);
    // `!(a && b)` pins the conjunction itself without pinning any leaf;
    // the commuted form must be recognized as the same condition.
    let tree = parse_unit("int a; int b; if (!(a && b)) { b && a; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::If);
    let config = ExecConfig::default();
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_false());
}

#[test]
fn symbolic_equality_survives_commutation() {
    services!(services);
    let tree = parse_unit("int x; int y; if (x == y) { y == x; }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::If);
    let config = ExecConfig::default();
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_true());
}

#[test]
fn deep_expression_exhausts_budget_to_unknown() {
    services!(services);
    let tree = parse_unit("int x; x+1+1+1+1+1+1+1+1+1+1+1+1;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "x"), AbstractValue::known_int(0));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
}

#[test]
fn recursive_function_terminates_as_unknown() {
    services!(services);
    let tree = parse_unit("int f(int n) { return f(n) + 1; } f(3);").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
}

#[test]
fn straight_line_function_inlines() {
    services!(services);
    let tree = parse_unit("int twice(int n) { return n + n; } twice(4);").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(8));
}

#[test]
fn inlined_branch_with_definite_condition() {
    services!(services);
    let tree = parse_unit(
        "int sign(int n) { if (n > 0) { return 1; } else { return 2; } return 0; } sign(5);",
    )
    .unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(1));
}

#[test]
fn inlined_branch_with_unknown_condition_aborts() {
    services!(services);
    let tree = parse_unit("int pick(int n) { if (n > 0) { return 1; } return 0; } int u; pick(u);")
        .unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
}

#[test]
fn builtin_strlen_on_literal() {
    services!(services);
    let tree = parse_unit("strlen(\"abc\");").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(3));
}

struct NextLibrary;

impl LibraryModel for NextLibrary {
    fn is_pure(&self, name: &str) -> bool {
        name == "next"
    }

    fn return_value_template(&self, name: &str) -> Option<String> {
        (name == "next").then(|| "arg0 + 1".to_string())
    }

    fn container_yield(&self, _member: &str) -> Option<ContainerYield> {
        None
    }
}

#[test]
fn library_template_computes_return_value() {
    let oracle = GraphOracle;
    let library = NextLibrary;
    let bounds = NoOracle;
    let templates = TemplateCache::new();
    let services = Services::new(&oracle, &library, &bounds, &templates);

    let tree = parse_unit("next(4);").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(5));
}

#[test]
fn unresolved_call_invalidates_address_argument() {
    services!(services);
    let config = ExecConfig::default();

    let tree = parse_unit("int x = 5; poke(&x); x;").unwrap();
    let (point, root) = last_expr(&tree);
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());
    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());

    // Passing by value cannot write back.
    let tree = parse_unit("int x = 5; poke(x); x;").unwrap();
    let (point, root) = last_expr(&tree);
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());
    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(5));
}

#[test]
fn impossible_zero_with_unsigned_type_reads_positive() {
    services!(services);
    let tree = parse_unit("unsigned int x; x > 0;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.bind(ident_of(&tree, "x"), AbstractValue::impossible_int(0));

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_true());
}

struct AlwaysLess;

impl BoundInference for AlwaysLess {
    fn infer_comparison(
        &self,
        op: BinOp,
        _known: &AbstractValue,
        _known_is_lhs: bool,
    ) -> Option<AbstractValue> {
        (op == BinOp::Lt).then(|| AbstractValue::known_int(1))
    }
}

#[test]
fn bound_inference_model_is_consulted() {
    let oracle = GraphOracle;
    let library = StdLibrary;
    let bounds = AlwaysLess;
    let templates = TemplateCache::new();
    let services = Services::new(&oracle, &library, &bounds, &templates);

    let tree = parse_unit("int x; int y = 5; x < y;").unwrap();
    let (point, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(1));
}

#[test]
fn container_size_zero_resolves_empty_and_size() {
    services!(services);
    let tree = parse_unit("c.empty(); c.size() == 0;").unwrap();
    let config = ExecConfig::default();
    let mut state = ProgramState::new();
    state.set_container_size(&tree, node_of(&tree, "c"), 0, true);
    let evaluator = Evaluator::new(&tree, &services, &config);

    let roots: Vec<ExprId> = tree
        .stmts
        .iter()
        .filter_map(|s| match &s.kind {
            StmtKind::Expr(e) => Some(*e),
            _ => None,
        })
        .collect();
    assert!(evaluator.evaluate(&mut state, roots[0]).is_true());
    assert!(evaluator.evaluate(&mut state, roots[1]).is_true());
}

#[test]
fn nonempty_condition_refutes_empty() {
    services!(services);
    let tree = parse_unit("if (!c.empty()) { c.empty(); }").unwrap();
    let (point, root) = expr_in_scope(&tree, ScopeKind::If);
    let config = ExecConfig::default();
    let mut state = build_initial_state(&tree, &services, &config, point, None, &ProgramState::new());

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_false());
}

#[test]
fn oversized_integer_literal_does_not_wrap() {
    services!(services);
    let tree = parse_unit("18446744073709551615u;").unwrap();
    let (_, root) = last_expr(&tree);
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert!(v.is_unknown());
}

#[test]
fn statically_annotated_value_wins() {
    services!(services);
    let mut tree = parse_unit("int x; x;").unwrap();
    let (_, root) = last_expr(&tree);
    tree.annotate_known(root, AbstractValue::known_int(42));
    let config = ExecConfig::default();
    let mut state = ProgramState::new();

    let v = Evaluator::new(&tree, &services, &config).evaluate(&mut state, root);
    assert_eq!(v, AbstractValue::known_int(42));
}
