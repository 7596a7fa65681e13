#![allow(dead_code)]

use irpass::config::PassConfig;
use irpass::language::interpreter::{interpret, Environment, Value};
use irpass::language::{Graph, NodeId};
use irpass::optimizer::PassReport;

/// The root scope's (first) output.
pub fn output(graph: &Graph) -> NodeId {
    graph.outputs(graph.root_scope())[0]
}

pub fn simplify(program: &str, config: &PassConfig) -> (Graph, PassReport) {
    let (mut graph, _) = Graph::from_sexpr(program).unwrap();
    let report = config.build().run(&mut graph).unwrap();
    (graph, report)
}

/// The simplified program, printed.
pub fn simplified(program: &str, config: &PassConfig) -> String {
    let (graph, _) = simplify(program, config);
    graph.to_sexpr(output(&graph))
}

pub fn evaluate(graph: &Graph, env: &Environment) -> Value {
    interpret(graph, output(graph), env).unwrap()
}
