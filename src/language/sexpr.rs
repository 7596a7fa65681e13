//! A small textual form for graphs, mostly for tests.
//!
//! ```text
//! 0  2.5  true               scalar constants
//! x                          a parameter (one node per name)
//! (param x f32 2 2)          a parameter with a tensor type
//! (tensor f32 (shape 2 2) 3) a tensor constant; one value fills it
//! (: f32 2 2 (mul a b))      a tensor type annotation on an expression
//! (mul a b)                  a call to a primitive
//! ```

use std::collections::HashMap;

use egg::{Id, RecExpr, SymbolLang};
use itertools::Itertools;

use super::literal::{DType, Literal, Tensor, TensorType};
use super::{Graph, Node, NodeId, ScopeId};
use crate::error::{ParseSnafu, Result};

struct Reader<'a> {
    nodes: &'a [SymbolLang],
    parameters: HashMap<String, NodeId>,
    scope: ScopeId,
}

fn parse_error<T>(message: String) -> Result<T> {
    ParseSnafu { message }.fail()
}

impl<'a> Reader<'a> {
    fn get(&self, id: Id) -> &'a SymbolLang {
        &self.nodes[usize::from(id)]
    }

    fn atom(&self, id: Id) -> Result<&'a str> {
        let node = self.get(id);
        if !node.children.is_empty() {
            return parse_error(format!("expected an atom, found ({} ...)", node.op));
        }
        Ok(node.op.as_str())
    }

    fn dtype(&self, id: Id) -> Result<DType> {
        self.atom(id)?.parse().or_else(parse_error)
    }

    fn dims(&self, ids: &[Id]) -> Result<Vec<usize>> {
        ids.iter()
            .map(|id| {
                let atom = self.atom(*id)?;
                match atom.parse::<usize>() {
                    Ok(dim) => Ok(dim),
                    Err(_) => parse_error(format!("bad dimension {}", atom)),
                }
            })
            .collect()
    }

    fn number(&self, id: Id) -> Result<f64> {
        let atom = self.atom(id)?;
        match atom.parse::<f64>() {
            Ok(value) => Ok(value),
            Err(_) => parse_error(format!("bad number {}", atom)),
        }
    }

    fn read(&mut self, graph: &mut Graph, id: Id) -> Result<NodeId> {
        let node = self.get(id);
        let children = node.children.as_slice();
        let op = node.op.as_str();
        if children.is_empty() {
            return self.leaf(graph, op);
        }
        match op {
            "param" => {
                if children.len() < 2 {
                    return parse_error("(param NAME DTYPE DIM...)".to_string());
                }
                let name = self.atom(children[0])?;
                let ty = TensorType::new(self.dtype(children[1])?, &self.dims(&children[2..])?);
                let parameter = self.parameter(graph, name);
                graph.set_type(parameter, ty);
                Ok(parameter)
            }
            "tensor" => {
                if children.len() < 3 || self.get(children[1]).op.as_str() != "shape" {
                    return parse_error("(tensor DTYPE (shape DIM...) VALUE...)".to_string());
                }
                let dtype = self.dtype(children[0])?;
                let shape = self.dims(&self.get(children[1]).children)?;
                let ty = TensorType::new(dtype, &shape);
                let mut values = children[2..]
                    .iter()
                    .map(|id| self.number(*id))
                    .collect::<Result<Vec<_>>>()?;
                if values.len() == 1 {
                    values = vec![values[0]; ty.element_count()];
                }
                let tensor = Tensor::from_values(&ty, &values)?;
                Ok(graph.create_constant(self.scope, tensor.into()))
            }
            ":" => {
                if children.len() < 2 {
                    return parse_error("(: DTYPE DIM... EXPR)".to_string());
                }
                let last = children.len() - 1;
                let ty = TensorType::new(
                    self.dtype(children[0])?,
                    &self.dims(&children[1..last])?,
                );
                let annotated = self.read(graph, children[last])?;
                graph.set_type(annotated, ty);
                Ok(annotated)
            }
            "apply" => {
                let operator = self.read(graph, children[0])?;
                let args = self.read_all(graph, &children[1..])?;
                graph.create_call(self.scope, operator, &args)
            }
            _ => {
                let args = self.read_all(graph, children)?;
                graph.create_op(self.scope, op, &args)
            }
        }
    }

    fn read_all(&mut self, graph: &mut Graph, ids: &[Id]) -> Result<Vec<NodeId>> {
        ids.iter().map(|id| self.read(graph, *id)).collect()
    }

    fn leaf(&mut self, graph: &mut Graph, atom: &str) -> Result<NodeId> {
        let literal = match atom {
            "true" => Some(Literal::Bool(true)),
            "false" => Some(Literal::Bool(false)),
            _ if atom.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') => {
                if let Ok(int) = atom.parse::<i64>() {
                    Some(Literal::Int(int))
                } else {
                    match atom.parse::<f64>().ok().and_then(Literal::float) {
                        Some(float) => Some(float),
                        None => return parse_error(format!("bad number {}", atom)),
                    }
                }
            }
            _ => None,
        };
        Ok(match literal {
            Some(literal) => graph.create_constant(self.scope, literal),
            None => self.parameter(graph, atom),
        })
    }

    fn parameter(&mut self, graph: &mut Graph, name: &str) -> NodeId {
        let scope = self.scope;
        *self
            .parameters
            .entry(name.to_string())
            .or_insert_with(|| graph.create_parameter(scope, name, None))
    }
}

/// Row-major element values of a tensor for printing.
fn element_values(tensor: &Tensor) -> Vec<String> {
    if let Some(values) = tensor.to_f64_vec() {
        return values.iter().map(|v| v.to_string()).collect();
    }
    match tensor {
        Tensor::Raw { dtype, data, .. } => match dtype {
            DType::Bool | DType::I8 => data.iter().map(|b| (*b as i8).to_string()).collect(),
            DType::I64 => data
                .chunks(8)
                .map(|chunk| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    i64::from_le_bytes(bytes).to_string()
                })
                .collect(),
            _ => data
                .chunks(dtype.byte_width())
                .map(|chunk| format!("0x{}", chunk.iter().rev().map(|b| format!("{:02x}", b)).join("")))
                .collect(),
        },
        _ => Vec::new(),
    }
}

impl Graph {
    /// Build a single-scope graph from its textual form. The expression
    /// becomes the root scope's only output and is returned.
    pub fn from_sexpr(text: &str) -> Result<(Graph, NodeId)> {
        let expr: RecExpr<SymbolLang> = match text.parse() {
            Ok(expr) => expr,
            Err(e) => return parse_error(format!("{}", e)),
        };
        let nodes = expr.as_ref();
        if nodes.is_empty() {
            return parse_error("empty program".to_string());
        }
        let mut graph = Graph::new();
        let scope = graph.root_scope();
        let mut reader = Reader {
            nodes,
            parameters: HashMap::new(),
            scope,
        };
        let root = reader.read(&mut graph, Id::from(nodes.len() - 1))?;
        graph.add_output(scope, root)?;
        Ok((graph, root))
    }

    /// Print `node` in the form [`Graph::from_sexpr`] reads. Shared nodes are
    /// printed once per use.
    pub fn to_sexpr(&self, node: NodeId) -> String {
        match self.node(node) {
            Node::Constant(literal) => match literal {
                Literal::Bool(b) => b.to_string(),
                Literal::Int(i) => i.to_string(),
                Literal::Float(f) => format!("{:?}", f.into_inner()),
                Literal::Primitive(p) => p.to_string(),
                Literal::Tensor(tensor) => {
                    let values = element_values(tensor);
                    let values = if values.len() > 1 && values.iter().all_equal() {
                        values[..1].to_vec()
                    } else {
                        values
                    };
                    format!(
                        "(tensor {} (shape {}) {})",
                        tensor.dtype(),
                        tensor.shape().iter().join(" "),
                        values.join(" ")
                    )
                }
            },
            Node::Parameter(name) => match self.ty(node) {
                Some(ty) if ty.shape.is_empty() => format!("(param {} {})", name, ty.dtype),
                Some(ty) => format!(
                    "(param {} {} {})",
                    name,
                    ty.dtype,
                    ty.shape.iter().join(" ")
                ),
                None => name.clone(),
            },
            Node::Call(operands) => {
                let args = operands[1..].iter().map(|arg| self.to_sexpr(*arg));
                let call = match self.operator(node) {
                    Some(primitive) if operands.len() == 1 => format!("({})", primitive),
                    Some(primitive) => format!("({} {})", primitive, args.format(" ")),
                    None => format!(
                        "(apply {})",
                        std::iter::once(self.to_sexpr(operands[0])).chain(args).format(" ")
                    ),
                };
                match self.ty(node) {
                    Some(ty) => format!(
                        "(: {} {})",
                        std::iter::once(ty.dtype.to_string())
                            .chain(ty.shape.iter().map(|d| d.to_string()))
                            .format(" "),
                        call
                    ),
                    None => call,
                }
            }
        }
    }
}
