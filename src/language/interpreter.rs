use std::collections::HashMap;

use approx::AbsDiffEq;
use ndarray::ArrayD;

use super::literal::{prim, Literal};
use super::{Graph, Node, NodeId};
use crate::error::{EvaluationSnafu, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(f64),
    Tensor(ArrayD<f64>),
    Tuple(Vec<Value>),
}

impl AbsDiffEq for Value {
    type Epsilon = f64;

    fn default_epsilon() -> f64 {
        f64::EPSILON
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f64) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a.abs_diff_eq(b, epsilon),
            (Value::Tensor(a), Value::Tensor(b)) => a.abs_diff_eq(b, epsilon),
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.abs_diff_eq(b, epsilon))
            }
            _ => false,
        }
    }
}

/// Parameter values, by parameter name.
pub type Environment<'a> = HashMap<&'a str, Value>;

fn fail<T>(message: String) -> Result<T> {
    EvaluationSnafu { message }.fail()
}

fn elementwise(a: Value, b: Value, op: impl Fn(f64, f64) -> f64) -> Result<Value> {
    match (a, b) {
        (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(op(a, b))),
        (Value::Scalar(a), Value::Tensor(b)) => Ok(Value::Tensor(b.mapv(|b| op(a, b)))),
        (Value::Tensor(a), Value::Scalar(b)) => Ok(Value::Tensor(a.mapv(|a| op(a, b)))),
        (Value::Tensor(mut a), Value::Tensor(b)) => {
            if let Some(b) = b.broadcast(a.shape()) {
                a.zip_mut_with(&b, |a, b| *a = op(*a, *b));
                return Ok(Value::Tensor(a));
            }
            let mut out = b.clone();
            match a.broadcast(b.shape()) {
                Some(a) => {
                    out.zip_mut_with(&a, |b, a| *b = op(*a, *b));
                    Ok(Value::Tensor(out))
                }
                None => fail(format!(
                    "cannot broadcast {:?} against {:?}",
                    a.shape(),
                    b.shape()
                )),
            }
        }
        (a, b) => fail(format!("no elementwise operation on {:?} and {:?}", a, b)),
    }
}

fn binary(args: Vec<Value>, op: impl Fn(f64, f64) -> f64) -> Result<Value> {
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(a), Some(b)) => elementwise(a, b, op),
        _ => fail("expected two arguments".to_string()),
    }
}

fn literal_value(literal: &Literal) -> Result<Value> {
    match literal {
        Literal::Bool(b) => Ok(Value::Scalar(if *b { 1.0 } else { 0.0 })),
        Literal::Int(i) => Ok(Value::Scalar(*i as f64)),
        Literal::Float(f) => Ok(Value::Scalar(f.into_inner())),
        Literal::Tensor(tensor) => match tensor.to_f64_vec() {
            Some(values) => match ArrayD::from_shape_vec(tensor.shape(), values) {
                Ok(array) => Ok(Value::Tensor(array)),
                Err(e) => fail(e.to_string()),
            },
            None => fail(format!("cannot compute with {} tensors", tensor.dtype())),
        },
        Literal::Primitive(p) => fail(format!("primitive {} is not a value", p)),
    }
}

/// Evaluate `node`, binding parameters from `env`.
///
/// `all_reduce` is evaluated as on a single device, i.e. as the identity.
/// Shared subterms are evaluated once.
pub fn interpret(graph: &Graph, node: NodeId, env: &Environment) -> Result<Value> {
    evaluate(graph, node, env, &mut HashMap::new())
}

fn evaluate(
    graph: &Graph,
    node: NodeId,
    env: &Environment,
    values: &mut HashMap<NodeId, Value>,
) -> Result<Value> {
    if let Some(value) = values.get(&node) {
        return Ok(value.clone());
    }
    let value = compute(graph, node, env, values)?;
    values.insert(node, value.clone());
    Ok(value)
}

fn compute(
    graph: &Graph,
    node: NodeId,
    env: &Environment,
    values: &mut HashMap<NodeId, Value>,
) -> Result<Value> {
    match graph.node(node) {
        Node::Constant(literal) => literal_value(literal),
        Node::Parameter(name) => match env.get(name.as_str()) {
            Some(value) => Ok(value.clone()),
            None => fail(format!("no value bound to {}", name)),
        },
        Node::Call(_) => {
            let operator = match graph.operator(node) {
                Some(operator) => operator,
                None => return fail(format!("{} does not apply a primitive", node)),
            };
            let mut args = graph
                .args(node)
                .iter()
                .map(|arg| evaluate(graph, *arg, env, values))
                .collect::<Result<Vec<_>>>()?;

            match (operator.as_str(), args.len()) {
                (prim::SCALAR_MUL, 2) | (prim::MUL, 2) => binary(args, |a, b| a * b),
                (prim::SCALAR_ADD, 2) | (prim::TENSOR_ADD, 2) => binary(args, |a, b| a + b),
                (prim::POW, 2) => binary(args, f64::powf),
                (prim::ZEROS_LIKE, 1) => match args.remove(0) {
                    Value::Scalar(_) => Ok(Value::Scalar(0.0)),
                    Value::Tensor(t) => Ok(Value::Tensor(ArrayD::zeros(t.raw_dim()))),
                    Value::Tuple(_) => fail("zeros_like of a tuple".to_string()),
                },
                (prim::MAKE_TUPLE, _) => Ok(Value::Tuple(args)),
                (prim::ADDN, 1) => match args.remove(0) {
                    Value::Tuple(values) => {
                        let mut values = values.into_iter();
                        let first = match values.next() {
                            Some(first) => first,
                            None => return fail("addn of an empty tuple".to_string()),
                        };
                        values.try_fold(first, |sum, v| elementwise(sum, v, |a, b| a + b))
                    }
                    other => Ok(other),
                },
                (prim::ALL_REDUCE, 1) => Ok(args.remove(0)),
                (name, arity) => fail(format!("cannot evaluate {} with {} arguments", name, arity)),
            }
        }
    }
}
