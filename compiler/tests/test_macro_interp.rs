//! Integration tests for the Lumen macro evaluator.
//!
//! Covers the full surface: value store and objects, scope resolution and
//! closures, evaluator control flow, exception handling and unwinding, the
//! native library registry, the host context primitives, and the
//! typed-world bridge with its identity caches and signatures.

use compiler::interp::{Handle, MacroError, MacroInterpreter, Value};
use compiler::tast::{
    ClassDef, ClassRef, EnumCtor, EnumDef, EnumRef, FunArg, TConst, TExpr, TExprKind, Type,
    TypedDecl,
};
use source_map::Pos;
use syntax::{
    AssignOp, BinaryOp, Case, Catch, ClassDecl, ClassField, ClassFieldKind, Decl, Expr, ExprKind,
    FunctionExpr, Modifier, Module, ObjectField, Param, StringPart, UnaryOp,
};

// ================================================================
// HELPERS
// ================================================================

fn e(kind: ExprKind) -> Expr {
    Expr::new(kind, Pos::unknown())
}

fn int(i: i64) -> Expr {
    e(ExprKind::Int(i))
}

fn float(f: f64) -> Expr {
    e(ExprKind::Float(f))
}

fn s(text: &str) -> Expr {
    e(ExprKind::Str(text.to_string()))
}

fn boolean(b: bool) -> Expr {
    e(ExprKind::Bool(b))
}

fn null() -> Expr {
    e(ExprKind::Null)
}

fn ident(name: &str) -> Expr {
    e(ExprKind::Ident(name.to_string()))
}

fn var(name: &str, init: Expr) -> Expr {
    e(ExprKind::Var {
        name: name.to_string(),
        init: Some(Box::new(init)),
    })
}

fn block(items: Vec<Expr>) -> Expr {
    e(ExprKind::Block(items))
}

fn bin(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    e(ExprKind::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

fn assign(left: Expr, right: Expr) -> Expr {
    e(ExprKind::Assign {
        left: Box::new(left),
        op: AssignOp::Assign,
        right: Box::new(right),
    })
}

fn assign_op(op: AssignOp, left: Expr, right: Expr) -> Expr {
    e(ExprKind::Assign {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    e(ExprKind::Call {
        expr: Box::new(callee),
        args,
    })
}

fn calln(name: &str, args: Vec<Expr>) -> Expr {
    call(ident(name), args)
}

fn field(base: Expr, name: &str) -> Expr {
    e(ExprKind::Field {
        expr: Box::new(base),
        field: name.to_string(),
    })
}

fn index(base: Expr, idx: Expr) -> Expr {
    e(ExprKind::Index {
        expr: Box::new(base),
        index: Box::new(idx),
    })
}

fn array(items: Vec<Expr>) -> Expr {
    e(ExprKind::Array(items))
}

fn object(fields: Vec<(&str, Expr)>) -> Expr {
    e(ExprKind::Object(
        fields
            .into_iter()
            .map(|(name, expr)| ObjectField {
                name: name.to_string(),
                expr,
            })
            .collect(),
    ))
}

fn function(name: &str, params: &[&str], body: Expr) -> Expr {
    e(ExprKind::Function(FunctionExpr {
        name: name.to_string(),
        params: params.iter().map(|p| Param::required(*p)).collect(),
        body: Box::new(body),
    }))
}

fn ret(value: Expr) -> Expr {
    e(ExprKind::Return(Some(Box::new(value))))
}

fn iff(cond: Expr, then_branch: Expr, else_branch: Option<Expr>) -> Expr {
    e(ExprKind::If {
        cond: Box::new(cond),
        then_branch: Box::new(then_branch),
        else_branch: else_branch.map(Box::new),
    })
}

fn while_loop(cond: Expr, body: Expr) -> Expr {
    e(ExprKind::While {
        cond: Box::new(cond),
        body: Box::new(body),
    })
}

fn for_in(name: &str, iter: Expr, body: Expr) -> Expr {
    e(ExprKind::For {
        var: name.to_string(),
        iter: Box::new(iter),
        body: Box::new(body),
    })
}

fn switch(subject: Expr, cases: Vec<(Vec<Expr>, Expr)>, default: Option<Expr>) -> Expr {
    e(ExprKind::Switch {
        subject: Box::new(subject),
        cases: cases
            .into_iter()
            .map(|(values, body)| Case { values, body })
            .collect(),
        default: default.map(Box::new),
    })
}

fn throw(value: Expr) -> Expr {
    e(ExprKind::Throw(Box::new(value)))
}

fn try_catch(body: Expr, catches: Vec<(&str, Option<&str>, Expr)>) -> Expr {
    e(ExprKind::Try {
        body: Box::new(body),
        catches: catches
            .into_iter()
            .map(|(name, hint, catch_body)| Catch {
                var: name.to_string(),
                type_hint: hint.map(str::to_string),
                body: catch_body,
            })
            .collect(),
    })
}

fn load_prim(key: &str, arity: i64) -> Expr {
    calln("loadPrimitive", vec![s(key), int(arity)])
}

fn eval(interp: &mut MacroInterpreter, expr: &Expr) -> Value {
    interp.evaluate(expr).expect("evaluation should succeed")
}

fn eval_new(expr: &Expr) -> Value {
    eval(&mut MacroInterpreter::new(), expr)
}

// ================================================================
// VALUES AND OPERATORS
// ================================================================

#[test]
fn test_arithmetic_and_literals() {
    assert_eq!(eval_new(&bin(BinaryOp::Add, int(1), int(2))), Value::Int(3));
    assert_eq!(
        eval_new(&bin(BinaryOp::Mul, int(6), int(7))),
        Value::Int(42)
    );
    assert_eq!(
        eval_new(&bin(BinaryOp::Add, float(1.5), int(2))),
        Value::Float(3.5)
    );
    assert_eq!(eval_new(&null()), Value::Null);
    assert_eq!(eval_new(&boolean(true)), Value::Bool(true));
}

#[test]
fn test_string_concat_coerces() {
    assert_eq!(
        eval_new(&bin(BinaryOp::Add, s("n="), int(4))),
        Value::str("n=4")
    );
    assert_eq!(
        eval_new(&bin(BinaryOp::Add, int(4), s("!"))),
        Value::str("4!")
    );
}

#[test]
fn test_division_by_zero_is_catchable() {
    let program = try_catch(
        bin(BinaryOp::Div, int(1), int(0)),
        vec![("e", None, s("caught"))],
    );
    assert_eq!(eval_new(&program), Value::str("caught"));
}

#[test]
fn test_comparison_between_incompatible_variants_is_undefined() {
    // Undefined order answers false, it never crashes
    assert_eq!(
        eval_new(&bin(BinaryOp::Lt, s("a"), int(1))),
        Value::Bool(false)
    );
    assert_eq!(
        eval_new(&bin(BinaryOp::Ge, null(), int(1))),
        Value::Bool(false)
    );
}

#[test]
fn test_operator_overload_hooks_are_symmetric() {
    // {__add: fn} + 5 resolves through the left operand's hook,
    // 5 + {__radd: fn} through the right operand's
    let program = block(vec![
        var(
            "money",
            object(vec![
                ("amount", int(10)),
                (
                    "__add",
                    function(
                        "",
                        &["other"],
                        ret(bin(
                            BinaryOp::Add,
                            field(e(ExprKind::This), "amount"),
                            ident("other"),
                        )),
                    ),
                ),
                (
                    "__radd",
                    function(
                        "",
                        &["other"],
                        ret(bin(
                            BinaryOp::Add,
                            ident("other"),
                            field(e(ExprKind::This), "amount"),
                        )),
                    ),
                ),
            ]),
        ),
        bin(
            BinaryOp::Add,
            bin(BinaryOp::Add, ident("money"), int(5)),
            bin(BinaryOp::Add, int(100), ident("money")),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::Int(125));
}

#[test]
fn test_short_circuit_skips_right_operand() {
    let program = block(vec![
        var("n", int(0)),
        bin(BinaryOp::And, boolean(false), assign(ident("n"), int(1))),
        bin(BinaryOp::Or, boolean(true), assign(ident("n"), int(2))),
        ident("n"),
    ]);
    assert_eq!(eval_new(&program), Value::Int(0));
}

// ================================================================
// SCOPING, GLOBALS AND CLOSURES
// ================================================================

#[test]
fn test_locals_and_compound_assignment() {
    let program = block(vec![
        var("x", int(1)),
        assign_op(AssignOp::AddAssign, ident("x"), int(4)),
        ident("x"),
    ]);
    assert_eq!(eval_new(&program), Value::Int(5));
}

#[test]
fn test_block_scoping_restores_outer_binding() {
    let program = block(vec![
        var("x", int(1)),
        block(vec![var("x", int(99))]),
        ident("x"),
    ]);
    assert_eq!(eval_new(&program), Value::Int(1));
}

#[test]
fn test_globals_persist_across_evaluations() {
    let mut interp = MacroInterpreter::new();
    eval(&mut interp, &assign(ident("counter"), int(41)));
    let got = eval(
        &mut interp,
        &assign_op(AssignOp::AddAssign, ident("counter"), int(1)),
    );
    assert_eq!(got, Value::Int(42));
    assert_eq!(eval(&mut interp, &ident("counter")), Value::Int(42));
}

#[test]
fn test_unreferenced_global_reads_null() {
    assert_eq!(eval_new(&ident("neverDefined")), Value::Null);
}

#[test]
fn test_closure_captures_by_value_with_private_cells() {
    // The closure's environment is its own storage: writes inside the
    // closure persist across calls but never alias the creator's local
    let program = block(vec![
        var("n", int(0)),
        var(
            "tick",
            function(
                "",
                &[],
                block(vec![
                    assign_op(AssignOp::AddAssign, ident("n"), int(1)),
                    ret(ident("n")),
                ]),
            ),
        ),
        calln("tick", vec![]),
        calln("tick", vec![]),
        bin(
            BinaryOp::Mul,
            calln("tick", vec![]),
            bin(BinaryOp::Add, ident("n"), int(1)),
        ),
    ]);
    // tick() counts 1,2,3 in its own cell; the outer n stays 0
    assert_eq!(eval_new(&program), Value::Int(3));
}

#[test]
fn test_loop_closures_capture_distinct_values() {
    // A closure capturing a loop variable declared fresh per iteration
    // observes that iteration's value, not a shared cell
    let program = block(vec![
        var("fns", array(vec![])),
        for_in(
            "i",
            bin(BinaryOp::Range, int(0), int(3)),
            block(vec![call(
                field(ident("fns"), "push"),
                vec![function("", &[], ret(ident("i")))],
            )]),
        ),
        bin(
            BinaryOp::Add,
            bin(
                BinaryOp::Add,
                bin(
                    BinaryOp::Mul,
                    call(index(ident("fns"), int(0)), vec![]),
                    int(100),
                ),
                bin(
                    BinaryOp::Mul,
                    call(index(ident("fns"), int(1)), vec![]),
                    int(10),
                ),
            ),
            call(index(ident("fns"), int(2)), vec![]),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::Int(12));
}

#[test]
fn test_arrow_function() {
    let program = block(vec![
        var(
            "double",
            e(ExprKind::Arrow {
                params: vec!["x".to_string()],
                body: Box::new(bin(BinaryOp::Mul, ident("x"), int(2))),
            }),
        ),
        calln("double", vec![int(21)]),
    ]);
    assert_eq!(eval_new(&program), Value::Int(42));
}

// ================================================================
// CONTROL FLOW
// ================================================================

#[test]
fn test_if_and_ternary() {
    assert_eq!(
        eval_new(&iff(boolean(true), int(1), Some(int(2)))),
        Value::Int(1)
    );
    assert_eq!(
        eval_new(&iff(boolean(false), int(1), Some(int(2)))),
        Value::Int(2)
    );
    assert_eq!(eval_new(&iff(boolean(false), int(1), None)), Value::Null);
    let ternary = e(ExprKind::Ternary {
        cond: Box::new(bin(BinaryOp::Lt, int(1), int(2))),
        then_expr: Box::new(s("yes")),
        else_expr: Box::new(s("no")),
    });
    assert_eq!(eval_new(&ternary), Value::str("yes"));
}

#[test]
fn test_while_with_break_and_continue() {
    // Sum even numbers below 10, stopping at 8
    let program = block(vec![
        var("total", int(0)),
        var("i", int(0)),
        while_loop(
            boolean(true),
            block(vec![
                assign_op(AssignOp::AddAssign, ident("i"), int(1)),
                iff(
                    bin(BinaryOp::Ge, ident("i"), int(8)),
                    e(ExprKind::Break),
                    None,
                ),
                iff(
                    bin(
                        BinaryOp::NotEq,
                        bin(BinaryOp::Mod, ident("i"), int(2)),
                        int(0),
                    ),
                    e(ExprKind::Continue),
                    None,
                ),
                assign_op(AssignOp::AddAssign, ident("total"), ident("i")),
            ]),
        ),
        ident("total"),
    ]);
    // 2 + 4 + 6
    assert_eq!(eval_new(&program), Value::Int(12));
}

#[test]
fn test_for_over_interval_and_array() {
    let over_range = block(vec![
        var("sum", int(0)),
        for_in(
            "i",
            bin(BinaryOp::Range, int(0), int(5)),
            assign_op(AssignOp::AddAssign, ident("sum"), ident("i")),
        ),
        ident("sum"),
    ]);
    assert_eq!(eval_new(&over_range), Value::Int(10));

    let over_array = block(vec![
        var("sum", int(0)),
        for_in(
            "x",
            array(vec![int(3), int(5), int(7)]),
            assign_op(AssignOp::AddAssign, ident("sum"), ident("x")),
        ),
        ident("sum"),
    ]);
    assert_eq!(eval_new(&over_array), Value::Int(15));
}

#[test]
fn test_loop_does_not_grow_stack_per_iteration() {
    // 1000 iterations each declaring locals; would overflow relative
    // addressing if block locals leaked across iterations
    let program = block(vec![
        var("acc", int(0)),
        for_in(
            "i",
            bin(BinaryOp::Range, int(0), int(1000)),
            block(vec![
                var("a", int(1)),
                var("b", int(2)),
                assign_op(
                    AssignOp::AddAssign,
                    ident("acc"),
                    bin(BinaryOp::Add, ident("a"), ident("b")),
                ),
            ]),
        ),
        ident("acc"),
    ]);
    assert_eq!(eval_new(&program), Value::Int(3000));
}

#[test]
fn test_switch_jump_table_dense_ints() {
    let subject_values = [(0, "zero"), (1, "one"), (2, "two")];
    for (n, expected) in subject_values {
        let program = switch(
            int(n),
            vec![
                (vec![int(0)], s("zero")),
                (vec![int(1)], s("one")),
                (vec![int(2)], s("two")),
            ],
            Some(s("other")),
        );
        assert_eq!(eval_new(&program), Value::str(expected));
    }
    let fallthrough = switch(
        int(9),
        vec![(vec![int(0)], s("zero"))],
        Some(s("other")),
    );
    assert_eq!(eval_new(&fallthrough), Value::str("other"));
}

#[test]
fn test_switch_structural_matching() {
    // Non-integer keys force the sequential path; first match in source
    // order wins, including structural array equality
    let program = switch(
        array(vec![int(1), int(2)]),
        vec![
            (vec![s("nope")], s("wrong")),
            (vec![array(vec![int(1), int(2)])], s("matched")),
            (vec![array(vec![int(1), int(2)])], s("shadowed")),
        ],
        None,
    );
    assert_eq!(eval_new(&program), Value::str("matched"));

    let no_default = switch(int(5), vec![(vec![s("x")], s("no"))], None);
    assert_eq!(eval_new(&no_default), Value::Null);
}

#[test]
fn test_switch_with_multiple_case_values() {
    let program = switch(
        int(4),
        vec![
            (vec![int(1), int(3), int(5)], s("odd")),
            (vec![int(0), int(2), int(4)], s("even")),
        ],
        None,
    );
    assert_eq!(eval_new(&program), Value::str("even"));
}

// ================================================================
// EXCEPTIONS AND UNWINDING
// ================================================================

#[test]
fn test_try_catch_value() {
    let program = try_catch(
        block(vec![throw(s("boom")), int(0)]),
        vec![("err", None, bin(BinaryOp::Add, s("got: "), ident("err")))],
    );
    assert_eq!(eval_new(&program), Value::str("got: boom"));
}

#[test]
fn test_catch_matches_by_declared_type() {
    let program = try_catch(
        throw(int(5)),
        vec![
            ("e", Some("String"), s("string")),
            ("e", Some("Int"), bin(BinaryOp::Add, ident("e"), int(100))),
            ("e", Some("Dynamic"), s("any")),
        ],
    );
    assert_eq!(eval_new(&program), Value::Int(105));
}

#[test]
fn test_unmatched_exception_propagates() {
    let mut interp = MacroInterpreter::new();
    let program = try_catch(throw(int(1)), vec![("e", Some("String"), s("no"))]);
    let err = interp.evaluate(&program).unwrap_err();
    assert!(matches!(err, MacroError::UncaughtException { .. }));
}

#[test]
fn test_stack_depth_restored_across_repeated_throws() {
    // Locals declared between try entry and the throw must unwind every
    // iteration; corrupted slot addressing would wreck the accumulator
    let program = block(vec![
        var("total", int(0)),
        for_in(
            "k",
            bin(BinaryOp::Range, int(0), int(10)),
            block(vec![try_catch(
                block(vec![
                    var("a", bin(BinaryOp::Mul, ident("k"), int(1))),
                    var("b", int(7)),
                    throw(bin(BinaryOp::Add, ident("a"), ident("b"))),
                ]),
                vec![(
                    "e",
                    None,
                    assign_op(AssignOp::AddAssign, ident("total"), ident("e")),
                )],
            )]),
        ),
        ident("total"),
    ]);
    // sum(k + 7 for k in 0..10) = 45 + 70
    assert_eq!(eval_new(&program), Value::Int(115));
}

#[test]
fn test_throw_from_nested_function_carries_to_caller_catch() {
    let program = block(vec![
        var(
            "deep",
            function(
                "deep",
                &[],
                block(vec![var("x", int(1)), throw(s("inner"))]),
            ),
        ),
        try_catch(calln("deep", vec![]), vec![("e", None, ident("e"))]),
    ]);
    assert_eq!(eval_new(&program), Value::str("inner"));
}

#[test]
fn test_uncaught_exception_reports_call_stack() {
    let mut interp = MacroInterpreter::new();
    let program = block(vec![
        var("inner", function("inner", &[], throw(s("lost")))),
        var("outer", function("outer", &[], calln("inner", vec![]))),
        calln("outer", vec![]),
    ]);
    let err = interp.evaluate(&program).unwrap_err();
    match err {
        MacroError::UncaughtException { rendered, stack, .. } => {
            assert_eq!(rendered, "lost");
            let names: Vec<_> = stack.iter().map(|f| f.callee.as_str()).collect();
            assert_eq!(names, vec!["inner", "outer"]);
        }
        other => panic!("expected UncaughtException, got {:?}", other),
    }
}

#[test]
fn test_abort_is_not_catchable_by_scripts() {
    let mut interp = MacroInterpreter::new();
    let program = try_catch(
        call(
            load_prim("compiler@error", 2),
            vec![s("fatal"), call(load_prim("compiler@pos", 0), vec![])],
        ),
        vec![("e", None, s("swallowed"))],
    );
    let err = interp.evaluate(&program).unwrap_err();
    assert!(matches!(err, MacroError::Aborted { .. }));
    // The diagnostic still reached the host sink
    assert_eq!(interp.host_mut().take_diagnostics().len(), 1);
}

#[test]
fn test_recursion_limit_is_catchable() {
    let mut interp = MacroInterpreter::new();
    interp.set_max_call_depth(16);
    let program = block(vec![
        assign(
            ident("spin"),
            function("spin", &[], calln("spin", vec![])),
        ),
        try_catch(calln("spin", vec![]), vec![("e", None, s("depth hit"))]),
    ]);
    assert_eq!(eval(&mut interp, &program), Value::str("depth hit"));
}

// ================================================================
// OBJECTS AND ARRAYS
// ================================================================

#[test]
fn test_object_literal_fields_out_of_hash_order() {
    let program = block(vec![
        var("o", object(vec![("x", int(1)), ("y", int(2))])),
        bin(
            BinaryOp::Add,
            bin(BinaryOp::Mul, field(ident("o"), "x"), int(10)),
            field(ident("o"), "y"),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::Int(12));
}

#[test]
fn test_missing_field_reads_null() {
    let program = block(vec![
        var("o", object(vec![("x", int(1))])),
        field(ident("o"), "missing"),
    ]);
    assert_eq!(eval_new(&program), Value::Null);
}

#[test]
fn test_field_write_and_remove_via_primitives() {
    let program = block(vec![
        var("o", object(vec![("keep", int(1)), ("drop", int(2))])),
        var(
            "removed",
            call(
                load_prim("object@remove", 2),
                vec![ident("o"), s("drop")],
            ),
        ),
        var(
            "again",
            call(
                load_prim("object@remove", 2),
                vec![ident("o"), s("drop")],
            ),
        ),
        iff(
            bin(
                BinaryOp::And,
                ident("removed"),
                bin(BinaryOp::Eq, ident("again"), boolean(false)),
            ),
            field(ident("o"), "keep"),
            Some(int(-1)),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::Int(1));
}

#[test]
fn test_prototype_fallthrough_via_primitives() {
    let program = block(vec![
        var("parent", object(vec![("shared", int(7))])),
        var(
            "child",
            call(load_prim("object@with_proto", 1), vec![ident("parent")]),
        ),
        assign(field(ident("child"), "own"), int(2)),
        bin(
            BinaryOp::Add,
            field(ident("child"), "shared"),
            field(ident("child"), "own"),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::Int(9));
}

#[test]
fn test_arrays_are_shared_mutable_references() {
    let program = block(vec![
        var("a", array(vec![int(1)])),
        var("b", ident("a")),
        call(field(ident("b"), "push"), vec![int(2)]),
        field(ident("a"), "length"),
    ]);
    assert_eq!(eval_new(&program), Value::Int(2));
}

#[test]
fn test_array_methods() {
    let program = block(vec![
        var("a", array(vec![int(3), int(1), int(2)])),
        call(field(ident("a"), "sort"), vec![null()]),
        call(field(ident("a"), "join"), vec![s("-")]),
    ]);
    assert_eq!(eval_new(&program), Value::str("1-2-3"));

    let mapped = block(vec![
        var("a", array(vec![int(1), int(2), int(3)])),
        var(
            "doubled",
            call(
                field(ident("a"), "map"),
                vec![function("", &["x"], ret(bin(BinaryOp::Mul, ident("x"), int(2))))],
            ),
        ),
        index(ident("doubled"), int(2)),
    ]);
    assert_eq!(eval_new(&mapped), Value::Int(6));
}

#[test]
fn test_index_write_pads_with_null() {
    let program = block(vec![
        var("a", array(vec![])),
        assign(index(ident("a"), int(2)), int(9)),
        bin(
            BinaryOp::And,
            bin(BinaryOp::Eq, index(ident("a"), int(0)), null()),
            bin(BinaryOp::Eq, index(ident("a"), int(2)), int(9)),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::Bool(true));
}

#[test]
fn test_string_methods_and_interpolation() {
    let program = block(vec![
        var("name", s("Lumen")),
        e(ExprKind::StringInterp(vec![
            StringPart::Literal("hello ".to_string()),
            StringPart::Interp(call(field(ident("name"), "toUpperCase"), vec![])),
            StringPart::Literal("!".to_string()),
        ])),
    ]);
    assert_eq!(eval_new(&program), Value::str("hello LUMEN!"));

    let program = call(field(s("a,b,c"), "split"), vec![s(",")]);
    let parts = eval_new(&program);
    match parts {
        Value::Array(items) => assert_eq!(items.borrow().len(), 3),
        other => panic!("expected Array, got {:?}", other),
    }
}

#[test]
fn test_increment_and_postfix() {
    let program = block(vec![
        var("i", int(5)),
        var(
            "old",
            e(ExprKind::Unary {
                op: UnaryOp::Incr,
                postfix: true,
                expr: Box::new(ident("i")),
            }),
        ),
        bin(
            BinaryOp::Add,
            bin(BinaryOp::Mul, ident("old"), int(10)),
            ident("i"),
        ),
    ]);
    // old = 5, i = 6
    assert_eq!(eval_new(&program), Value::Int(56));
}

// ================================================================
// NATIVE LIBRARY REGISTRY
// ================================================================

#[test]
fn test_load_primitive_exact_arity() {
    let program = call(
        load_prim("string@uppercase", 1),
        vec![s("quiet")],
    );
    assert_eq!(eval_new(&program), Value::str("QUIET"));
}

#[test]
fn test_unknown_primitive_degrades_gracefully() {
    // A macro can probe for optional capabilities with try/catch
    let program = try_catch(
        load_prim("hypothetical@feature", 2),
        vec![("e", None, s("unavailable"))],
    );
    assert_eq!(eval_new(&program), Value::str("unavailable"));
}

#[test]
fn test_wrong_arity_is_primitive_not_found() {
    let program = try_catch(
        load_prim("string@uppercase", 3),
        vec![("e", None, ident("e"))],
    );
    match eval_new(&program) {
        Value::Str(msg) => assert!(msg.contains("primitive not found")),
        other => panic!("expected Str, got {:?}", other),
    }
}

#[test]
fn test_invalid_call_is_generic_catchable_error() {
    let program = try_catch(
        call(load_prim("math@sqrt", 1), vec![s("not a number")]),
        vec![("e", None, ident("e"))],
    );
    match eval_new(&program) {
        Value::Str(msg) => assert!(msg.contains("invalid call")),
        other => panic!("expected Str, got {:?}", other),
    }
}

#[test]
fn test_math_and_buffer_primitives() {
    let program = block(vec![
        var("b", call(load_prim("buffer@new", 0), vec![])),
        call(
            load_prim("buffer@add", 2),
            vec![ident("b"), s("pi=")],
        ),
        call(
            load_prim("buffer@add", 2),
            vec![
                ident("b"),
                call(load_prim("math@floor", 1), vec![float(3.7)]),
            ],
        ),
        call(load_prim("buffer@string", 1), vec![ident("b")]),
    ]);
    assert_eq!(eval_new(&program), Value::str("pi=3"));
}

#[test]
fn test_regexp_primitives() {
    let program = block(vec![
        var(
            "r",
            call(load_prim("regexp@new", 2), vec![s(r"(\w+)-(\d+)"), s("")]),
        ),
        iff(
            call(
                load_prim("regexp@match", 2),
                vec![ident("r"), s("build-42 done")],
            ),
            call(load_prim("regexp@matched", 2), vec![ident("r"), int(2)]),
            Some(s("no match")),
        ),
    ]);
    assert_eq!(eval_new(&program), Value::str("42"));
}

#[test]
fn test_compress_round_trip() {
    let program = block(vec![
        var(
            "packed",
            call(
                load_prim("compress@compress", 2),
                vec![s("the quick brown fox jumps over the lazy dog"), int(3)],
            ),
        ),
        var(
            "unpacked",
            call(load_prim("compress@decompress", 1), vec![ident("packed")]),
        ),
        call(load_prim("buffer@string", 1), vec![ident("unpacked")]),
    ]);
    assert_eq!(
        eval_new(&program),
        Value::str("the quick brown fox jumps over the lazy dog")
    );
}

#[test]
fn test_trace_accumulates_output() {
    let mut interp = MacroInterpreter::new();
    let program = block(vec![
        calln("trace", vec![s("first"), int(1)]),
        calln("trace", vec![array(vec![int(1), int(2)])]),
    ]);
    eval(&mut interp, &program);
    assert_eq!(interp.take_trace_output(), vec!["first, 1", "[1,2]"]);
    assert!(interp.take_trace_output().is_empty());
}

// ================================================================
// HOST CONTEXT
// ================================================================

#[test]
fn test_flags_visible_to_scripts() {
    let mut interp = MacroInterpreter::new();
    interp.host_mut().define_flag("debug");
    interp
        .host_mut()
        .define_flag_value("target", Some("js".to_string()));

    let program = iff(
        call(load_prim("compiler@defined", 1), vec![s("debug")]),
        call(load_prim("compiler@defined_value", 1), vec![s("target")]),
        Some(s("no")),
    );
    assert_eq!(eval(&mut interp, &program), Value::str("js"));

    let missing = call(load_prim("compiler@defined_value", 1), vec![s("nope")]);
    assert_eq!(eval(&mut interp, &missing), Value::Null);
}

#[test]
fn test_warning_reaches_host_sink() {
    let mut interp = MacroInterpreter::new();
    let program = call(
        load_prim("compiler@warning", 2),
        vec![s("deprecated"), call(load_prim("compiler@pos", 0), vec![])],
    );
    eval(&mut interp, &program);
    let diags = interp.host_mut().take_diagnostics();
    assert_eq!(diags.len(), 1);
    assert!(diags[0].message.contains("deprecated"));
}

#[test]
fn test_pos_infos_and_make_pos_round_trip() {
    let mut interp = MacroInterpreter::new();
    interp
        .context_mut()
        .sources
        .add_file("macros/Build.lm", "var x = 1;\n");

    let program = block(vec![
        var(
            "p",
            call(
                load_prim("compiler@make_pos", 3),
                vec![s("macros/Build.lm"), int(4), int(9)],
            ),
        ),
        var(
            "info",
            call(load_prim("compiler@pos_infos", 1), vec![ident("p")]),
        ),
        bin(
            BinaryOp::Add,
            bin(BinaryOp::Add, field(ident("info"), "file"), s(":")),
            field(ident("info"), "min"),
        ),
    ]);
    assert_eq!(eval(&mut interp, &program), Value::str("macros/Build.lm:4"));
}

#[test]
fn test_resolve_file_hook() {
    let mut interp = MacroInterpreter::new();
    interp
        .host_mut()
        .set_file_resolver(Box::new(|p| Some(format!("proj/{}", p))));
    let program = call(load_prim("compiler@resolve_file", 1), vec![s("a.txt")]);
    assert_eq!(eval(&mut interp, &program), Value::str("proj/a.txt"));
}

#[test]
fn test_parse_string_hook_returns_expr_handle() {
    let mut interp = MacroInterpreter::new();
    interp
        .host_mut()
        .set_parse_string(Box::new(|text, pos| match text {
            "1 + 2" => Ok(Expr::new(
                ExprKind::Binary {
                    left: Box::new(Expr::new(ExprKind::Int(1), pos)),
                    op: BinaryOp::Add,
                    right: Box::new(Expr::new(ExprKind::Int(2), pos)),
                },
                pos,
            )),
            _ => Err("syntax error".to_string()),
        }));

    let program = call(
        load_prim("compiler@parse", 2),
        vec![s("1 + 2"), call(load_prim("compiler@pos", 0), vec![])],
    );
    match eval(&mut interp, &program) {
        Value::Abstract(Handle::Expr(expr)) => {
            assert!(matches!(expr.kind, ExprKind::Binary { .. }));
        }
        other => panic!("expected expr handle, got {:?}", other),
    }

    let bad = try_catch(
        call(
            load_prim("compiler@parse", 2),
            vec![s("%%%"), call(load_prim("compiler@pos", 0), vec![])],
        ),
        vec![("e", None, ident("e"))],
    );
    match eval(&mut interp, &bad) {
        Value::Str(msg) => assert!(msg.contains("parse error")),
        other => panic!("expected Str, got {:?}", other),
    }
}

// ================================================================
// MODULES, MACROS AND TYPES
// ================================================================

fn build_module() -> Module {
    let add = FunctionExpr {
        name: "add".to_string(),
        params: vec![Param::required("a"), Param::required("b")],
        body: Box::new(ret(bin(BinaryOp::Add, ident("a"), ident("b")))),
    };
    // fact(n) recurses through the registry
    let fact = FunctionExpr {
        name: "fact".to_string(),
        params: vec![Param::required("n")],
        body: Box::new(iff(
            bin(BinaryOp::Le, ident("n"), int(1)),
            ret(int(1)),
            Some(ret(bin(
                BinaryOp::Mul,
                ident("n"),
                calln("fact", vec![bin(BinaryOp::Sub, ident("n"), int(1))]),
            ))),
        )),
    };
    Module {
        path: "tools".to_string(),
        decls: vec![Decl::Class(ClassDecl {
            name: "Build".to_string(),
            fields: vec![
                ClassField {
                    name: "add".to_string(),
                    modifiers: vec![Modifier::Public, Modifier::Static, Modifier::Macro],
                    kind: ClassFieldKind::Method(add),
                    pos: Pos::unknown(),
                },
                ClassField {
                    name: "fact".to_string(),
                    modifiers: vec![Modifier::Public, Modifier::Static, Modifier::Macro],
                    kind: ClassFieldKind::Method(fact),
                    pos: Pos::unknown(),
                },
                ClassField {
                    name: "VERSION".to_string(),
                    modifiers: vec![Modifier::Public, Modifier::Static],
                    kind: ClassFieldKind::Var(Some(s("1.4.0"))),
                    pos: Pos::unknown(),
                },
            ],
            pos: Pos::unknown(),
        })],
    }
}

#[test]
fn test_invoke_registered_macro() {
    let mut interp = MacroInterpreter::new();
    interp.register_module(&build_module()).unwrap();
    let result = interp
        .invoke(
            "tools.Build",
            "add",
            &[Value::Int(40), Value::Int(2)],
            Pos::unknown(),
        )
        .unwrap();
    assert_eq!(result, Value::Int(42));
}

#[test]
fn test_invoke_unknown_path_is_not_found_error() {
    let mut interp = MacroInterpreter::new();
    let err = interp
        .invoke("somePath", "someMethod", &[], Pos::unknown())
        .unwrap_err();
    match err {
        MacroError::NotFound { path, method, .. } => {
            assert_eq!(path, "somePath");
            assert_eq!(method, "someMethod");
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn test_macro_recursion_through_registry() {
    let mut interp = MacroInterpreter::new();
    interp.register_module(&build_module()).unwrap();
    let result = interp
        .invoke("tools.Build", "fact", &[Value::Int(5)], Pos::unknown())
        .unwrap();
    assert_eq!(result, Value::Int(120));
}

#[test]
fn test_module_class_surfaces_as_global_object() {
    let mut interp = MacroInterpreter::new();
    interp.register_module(&build_module()).unwrap();
    // Static values and methods are reachable from scripts
    let version = field(ident("Build"), "VERSION");
    assert_eq!(eval(&mut interp, &version), Value::str("1.4.0"));
    let sum = call(field(ident("Build"), "add"), vec![int(2), int(3)]);
    assert_eq!(eval(&mut interp, &sum), Value::Int(5));
}

fn color_enum() -> EnumRef {
    EnumRef::new(EnumDef {
        pack: vec!["ui".to_string()],
        name: "Color".to_string(),
        params: Vec::new(),
        ctors: vec![
            EnumCtor {
                name: "Red".to_string(),
                index: 0,
                args: Vec::new(),
            },
            EnumCtor {
                name: "Rgb".to_string(),
                index: 1,
                args: vec![("value".to_string(), Type::Dynamic)],
            },
        ],
        pos: Pos::unknown(),
    })
}

fn widget_class() -> ClassRef {
    ClassRef::new(ClassDef {
        pack: vec!["ui".to_string()],
        name: "Widget".to_string(),
        params: Vec::new(),
        superclass: None,
        is_interface: false,
        fields: Vec::new(),
        statics: vec![compiler::tast::ClassField {
            name: "MAX_DEPTH".to_string(),
            ty: Type::Dynamic,
            public: true,
            kind: compiler::tast::FieldKind::Var,
            constant: Some(TConst::Int(8)),
            pos: Pos::unknown(),
        }],
        pos: Pos::unknown(),
    })
}

#[test]
fn test_add_types_registers_enum_namespace() {
    let mut interp = MacroInterpreter::new();
    let color = color_enum();
    interp.add_types(&[TypedDecl::Enum(color.clone())]).unwrap();
    // Registration is idempotent per declaration identity
    interp.add_types(&[TypedDecl::Enum(color)]).unwrap();

    let red_index = field(field(ident("Color"), "Red"), "index");
    assert_eq!(eval(&mut interp, &red_index), Value::Int(0));

    let rgb = block(vec![
        var("c", call(field(ident("Color"), "Rgb"), vec![int(7)])),
        bin(
            BinaryOp::Add,
            field(ident("c"), "tag"),
            index(field(ident("c"), "args"), int(0)),
        ),
    ]);
    assert_eq!(eval(&mut interp, &rgb), Value::str("Rgb7"));
}

#[test]
fn test_add_types_exposes_class_constants() {
    let mut interp = MacroInterpreter::new();
    interp
        .add_types(&[TypedDecl::Class(widget_class())])
        .unwrap();
    let program = bin(
        BinaryOp::Add,
        field(ident("Widget"), "__name"),
        field(ident("Widget"), "MAX_DEPTH"),
    );
    assert_eq!(eval(&mut interp, &program), Value::str("ui.Widget8"));
}

// ================================================================
// TYPED-WORLD BRIDGE
// ================================================================

fn texpr(kind: TExprKind) -> TExpr {
    TExpr::new(kind, Type::Dynamic, Pos::unknown())
}

#[test]
fn test_texpr_round_trip() {
    let mut interp = MacroInterpreter::new();
    // { var n = 1; if (n < 2) n else n + 1 }
    let expr = texpr(TExprKind::Block(vec![
        texpr(TExprKind::Var(
            "n".to_string(),
            Some(Box::new(texpr(TExprKind::Const(TConst::Int(1))))),
        )),
        texpr(TExprKind::If(
            Box::new(texpr(TExprKind::Binop(
                BinaryOp::Lt,
                Box::new(texpr(TExprKind::Local("n".to_string()))),
                Box::new(texpr(TExprKind::Const(TConst::Int(2)))),
            ))),
            Box::new(texpr(TExprKind::Local("n".to_string()))),
            Some(Box::new(texpr(TExprKind::Binop(
                BinaryOp::Add,
                Box::new(texpr(TExprKind::Local("n".to_string()))),
                Box::new(texpr(TExprKind::Const(TConst::Int(1)))),
            )))),
        )),
    ]));

    let encoded = interp.encode_expr(&expr).unwrap();
    let decoded = interp.decode_expr(&encoded).unwrap();
    assert_eq!(decoded, expr);
}

#[test]
fn test_texpr_encoding_shape() {
    let mut interp = MacroInterpreter::new();
    let expr = texpr(TExprKind::Const(TConst::Str("hi".to_string())));
    let encoded = interp.encode_expr(&expr).unwrap();

    // Constructors cross the bridge as {tag, index, args} objects; bind
    // the encoded value to a global and inspect it from script
    interp.context_mut().set_global("probe", encoded);
    let rendered = eval(
        &mut interp,
        &bin(
            BinaryOp::Add,
            bin(BinaryOp::Add, field(ident("probe"), "tag"), s("/")),
            field(ident("probe"), "index"),
        ),
    );
    assert_eq!(rendered, Value::str("TConst/0"));
}

#[test]
fn test_decode_rejects_unknown_index() {
    let mut interp = MacroInterpreter::new();
    let bogus = eval(
        &mut interp,
        &object(vec![
            ("tag", s("TNothing")),
            ("index", int(99)),
            ("args", array(vec![])),
        ]),
    );
    let err = interp.decode_expr(&bogus).unwrap_err();
    assert!(matches!(err, MacroError::InvalidExpression { .. }));

    let not_an_object = interp.decode_expr(&Value::Int(3)).unwrap_err();
    assert!(matches!(not_an_object, MacroError::InvalidExpression { .. }));
}

#[test]
fn test_type_round_trip() {
    let mut interp = MacroInterpreter::new();
    let widget = widget_class();
    interp
        .add_types(&[TypedDecl::Class(widget.clone())])
        .unwrap();

    let ty = Type::Fun(
        vec![FunArg {
            name: "w".to_string(),
            opt: false,
            ty: Type::Inst(widget.clone(), Vec::new()),
        }],
        Box::new(Type::Dynamic),
    );
    let encoded = interp.encode_type(&ty).unwrap();
    let decoded = interp.decode_type(&encoded).unwrap();
    // Registered class references decode to the same declaration cell
    assert_eq!(decoded, ty);
}

#[test]
fn test_cyclic_class_encoding_terminates_and_aliases() {
    let mut interp = MacroInterpreter::new();
    // Node extends Container<Node>: the class graph points back at itself
    // through a type parameter
    let node = widget_class();
    let container = ClassRef::new(ClassDef {
        pack: vec!["ui".to_string()],
        name: "Container".to_string(),
        params: vec!["T".to_string()],
        superclass: None,
        is_interface: false,
        fields: Vec::new(),
        statics: Vec::new(),
        pos: Pos::unknown(),
    });
    node.borrow_mut().superclass = Some((
        container.clone(),
        vec![Type::Inst(node.clone(), Vec::new())],
    ));

    let encoded = interp.encode_type(&Type::Inst(node.clone(), Vec::new())).unwrap();
    // Encoding the same declaration again returns the identical cached
    // object, not a second copy
    let again = interp.encode_type(&Type::Inst(node, Vec::new())).unwrap();
    match (&encoded, &again) {
        (Value::Object(_), Value::Object(_)) => {}
        other => panic!("expected objects, got {:?}", other),
    }

    // The encoded graph holds a true aliasing cycle: class == class.super
    // .params[0].args[0] (TInst -> class -> super -> params -> TInst)
    interp.context_mut().set_global("t", encoded.clone());
    let class_obj = eval(&mut interp, &index(field(ident("t"), "args"), int(0)));
    let inner_inst = eval(
        &mut interp,
        &index(
            field(
                index(
                    field(field(index(field(ident("t"), "args"), int(0)), "super"), "params"),
                    int(0),
                ),
                "args",
            ),
            int(0),
        ),
    );
    assert_eq!(class_obj, inner_inst);

    // And the signature walk over the cyclic graph terminates
    assert_eq!(
        compiler::interp::signature(&encoded),
        compiler::interp::signature(&again)
    );
}

#[test]
fn test_signature_structural_equality() {
    let mut a = MacroInterpreter::new();
    let mut b = MacroInterpreter::new();

    let build = block(vec![
        var("o", object(vec![("x", int(1)), ("items", array(vec![int(1), int(2)]))])),
        // Close a cycle: o.me = o
        assign(field(ident("o"), "me"), ident("o")),
        ident("o"),
    ]);
    let first = eval(&mut a, &build);
    let second = eval(&mut b, &build);

    // Independently built, structurally identical, both cyclic
    assert_eq!(
        compiler::interp::signature(&first),
        compiler::interp::signature(&second)
    );

    let different = eval_new(&object(vec![("x", int(2))]));
    assert_ne!(
        compiler::interp::signature(&first),
        compiler::interp::signature(&different)
    );
}

#[test]
fn test_define_type_queues_declaration_for_host() {
    let mut interp = MacroInterpreter::new();
    let program = call(
        load_prim("compiler@define_type", 1),
        vec![object(vec![
            ("pack", array(vec![s("gen")])),
            ("name", s("Generated")),
            ("fields", array(vec![])),
            ("statics", array(vec![])),
        ])],
    );
    eval(&mut interp, &program);
    let defined = interp.host_mut().take_defined_types();
    assert_eq!(defined.len(), 1);
    assert_eq!(defined[0].path(), "gen.Generated");
}

#[test]
fn test_get_type_primitive() {
    let mut interp = MacroInterpreter::new();
    interp
        .add_types(&[TypedDecl::Class(widget_class())])
        .unwrap();
    let program = block(vec![
        var("t", call(load_prim("compiler@get_type", 1), vec![s("ui.Widget")])),
        bin(
            BinaryOp::Add,
            bin(BinaryOp::Add, field(ident("t"), "tag"), s("/")),
            field(index(field(ident("t"), "args"), int(0)), "name"),
        ),
    ]);
    assert_eq!(eval(&mut interp, &program), Value::str("TInst/Widget"));

    let missing = try_catch(
        call(load_prim("compiler@get_type", 1), vec![s("ui.Ghost")]),
        vec![("e", None, s("unknown"))],
    );
    assert_eq!(eval(&mut interp, &missing), Value::str("unknown"));
}
