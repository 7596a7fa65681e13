use irpass::config::PassConfig;
use irpass::language::literal::prim;
use irpass::language::{Graph, NodeId, ScopeId};

mod common;
use common::{output, simplified};

#[test]
fn reorders_reduction() {
    test_logger::ensure_env_logger_initialized();

    assert_eq!(
        simplified(
            "(addn (make_tuple (mul (all_reduce x) y) z))",
            &PassConfig::all_reduce_reorder()
        ),
        "(mul (all_reduce (addn (make_tuple z x))) y)"
    );
    assert_eq!(
        simplified(
            "(addn (make_tuple (neg z) (mul y (all_reduce (neg x)))))",
            &PassConfig::all_reduce_reorder()
        ),
        "(mul (all_reduce (addn (make_tuple (neg z) (neg x)))) y)"
    );
}

#[test]
fn leaves_other_sums_alone() {
    test_logger::ensure_env_logger_initialized();

    for program in &[
        "(addn (make_tuple (mul x y) z))",
        "(addn (make_tuple x y z))",
        "(addn (make_tuple (mul (all_reduce x) y)))",
        "(addn (make_tuple (mul (all_reduce a) y1) (mul (all_reduce b) y2)))",
    ] {
        assert_eq!(
            &simplified(program, &PassConfig::all_reduce_reorder()),
            program
        );
    }
}

struct Shared {
    graph: Graph,
    main: ScopeId,
    sum_scope: ScopeId,
    mul: NodeId,
    summed: NodeId,
    other: NodeId,
    negated: NodeId,
}

/// `mul` feeds the summed tuple, another tuple and a plain `neg`. The sum and
/// its tuple are built, and output, in `sum_scope`.
fn shared_mul(in_body: bool) -> Shared {
    let mut graph = Graph::new();
    let main = graph.root_scope();
    let sum_scope = if in_body {
        graph.add_scope("body", main)
    } else {
        main
    };
    let x = graph.create_parameter(main, "x", None);
    let y = graph.create_parameter(main, "y", None);
    let v = graph.create_parameter(main, "v", None);
    let w = graph.create_parameter(main, "w", None);

    let reduce = graph.create_op(main, prim::ALL_REDUCE, &[x]).unwrap();
    let mul = graph.create_op(main, prim::MUL, &[reduce, y]).unwrap();
    let z = graph.create_op(sum_scope, "neg", &[w]).unwrap();
    let summed = graph
        .create_op(sum_scope, prim::MAKE_TUPLE, &[mul, z])
        .unwrap();
    let addn = graph.create_op(sum_scope, prim::ADDN, &[summed]).unwrap();
    let other = graph.create_op(main, prim::MAKE_TUPLE, &[mul, v]).unwrap();
    let negated = graph.create_op(main, "neg", &[mul]).unwrap();

    graph.add_output(sum_scope, addn).unwrap();
    graph.add_output(sum_scope, summed).unwrap();
    graph.add_output(main, other).unwrap();
    graph.add_output(main, negated).unwrap();
    Shared {
        graph,
        main,
        sum_scope,
        mul,
        summed,
        other,
        negated,
    }
}

#[test]
fn rewires_other_tuples_only() {
    test_logger::ensure_env_logger_initialized();

    let Shared {
        mut graph,
        main,
        mul,
        summed,
        other,
        negated,
        ..
    } = shared_mul(false);
    let report = PassConfig::all_reduce_reorder()
        .build()
        .run(&mut graph)
        .unwrap();
    assert_eq!(report.rewrites, 1);

    let scaled = output(&graph);
    assert_eq!(
        graph.to_sexpr(scaled),
        "(mul (all_reduce (addn (make_tuple (neg w) x))) y)"
    );
    let new_reduce = graph.args(scaled)[0];
    assert_eq!(graph.args(other)[0], new_reduce);
    assert_eq!(graph.args(negated)[0], mul);
    assert_eq!(graph.args(summed)[0], mul);
    assert_eq!(&graph.outputs(main)[1..], &[summed, other, negated]);
}

#[test]
fn pulls_the_sum_out_of_a_nested_scope() {
    test_logger::ensure_env_logger_initialized();

    let Shared {
        mut graph,
        main,
        sum_scope: body,
        other,
        ..
    } = shared_mul(true);
    let report = PassConfig::all_reduce_reorder()
        .build()
        .run(&mut graph)
        .unwrap();
    assert_eq!(report.rewrites, 1);

    let scaled = graph.outputs(body)[0];
    assert_eq!(graph.scope_of(scaled), main);
    assert_eq!(
        graph.to_sexpr(scaled),
        "(mul (all_reduce (addn (make_tuple (neg w) x))) y)"
    );
    let new_tuple = graph.args(graph.args(graph.args(scaled)[0])[0])[0];
    for node in graph.args(new_tuple) {
        assert_eq!(graph.scope_of(*node), main);
    }
    assert_eq!(graph.args(other)[0], graph.args(scaled)[0]);
}

#[test]
fn inner_parameters_block_the_rewrite() {
    test_logger::ensure_env_logger_initialized();

    let mut graph = Graph::new();
    let main = graph.root_scope();
    let body = graph.add_scope("body", main);
    let x = graph.create_parameter(main, "x", None);
    let y = graph.create_parameter(main, "y", None);
    let z = graph.create_parameter(body, "z", None);
    let reduce = graph.create_op(main, prim::ALL_REDUCE, &[x]).unwrap();
    let mul = graph.create_op(main, prim::MUL, &[reduce, y]).unwrap();
    let tuple = graph.create_op(body, prim::MAKE_TUPLE, &[mul, z]).unwrap();
    let addn = graph.create_op(body, prim::ADDN, &[tuple]).unwrap();
    graph.add_output(body, addn).unwrap();

    let report = PassConfig::all_reduce_reorder()
        .build()
        .run(&mut graph)
        .unwrap();
    assert_eq!(report.rewrites, 0);
    assert_eq!(graph.outputs(body), &[addn]);
    assert_eq!(
        graph.to_sexpr(addn),
        "(addn (make_tuple (mul (all_reduce x) y) z))"
    );
}
