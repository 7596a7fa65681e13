//! Structural patterns and the visitor protocol rules match with.
//!
//! A [`Pattern`] only answers "does this call have the right operator and
//! arity". Everything else (which operand is the constant, which one is the
//! captured `X`) is decided by the rule's [`Visitor`] as the pattern walks the
//! operands in order, so a visitor can let an earlier operand change how it
//! treats a later one.

use super::literal::{Literal, Primitive};
use super::{Graph, NodeId};

/// Where a visited operand sits relative to the anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Site {
    /// 1 for the anchor's own arguments, 2 for theirs, and so on.
    pub depth: usize,
    /// Argument index within the call that holds the operand.
    pub position: usize,
}

/// Per-rule match state.
///
/// [`Pattern::run`] calls [`Visitor::reset`] before anything else, so
/// captures from an earlier attempt can never leak into the next one.
pub trait Visitor {
    fn reset(&mut self);

    fn visit(&mut self, graph: &Graph, node: NodeId, site: Site);

    /// Called for an operand matched against a nested pattern, after the
    /// nested operands (if it fitted) have been visited. By default an operand
    /// that does not fit is visited like any other.
    fn nested(&mut self, graph: &Graph, node: NodeId, site: Site, fitted: bool) {
        if !fitted {
            self.visit(graph, node, site);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperandPattern {
    /// Hand the operand to the visitor.
    Visit,
    /// Check the operand against a sub-pattern and walk into it when it fits.
    Nested(Pattern),
    /// The operand must be a constant holding this primitive.
    Literal(Primitive),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    operator: Primitive,
    /// `None` accepts any number of arguments and visits each of them.
    operands: Option<Vec<OperandPattern>>,
}

impl Pattern {
    /// A call to `operator` with any arguments.
    pub fn call(operator: &str) -> Self {
        Pattern {
            operator: Primitive::new(operator),
            operands: None,
        }
    }

    /// A call to `operator` with exactly two visited arguments.
    pub fn binary(operator: &str) -> Self {
        Pattern::with_operands(operator, vec![OperandPattern::Visit, OperandPattern::Visit])
    }

    pub fn with_operands(operator: &str, operands: Vec<OperandPattern>) -> Self {
        Pattern {
            operator: Primitive::new(operator),
            operands: Some(operands),
        }
    }

    pub fn operator(&self) -> Primitive {
        self.operator
    }

    /// Operator and arity check. Nested patterns are not looked at.
    pub fn fits(&self, graph: &Graph, node: NodeId) -> bool {
        if graph.operator(node) != Some(self.operator) {
            return false;
        }
        let args = graph.args(node);
        match &self.operands {
            None => true,
            Some(operands) => {
                operands.len() == args.len()
                    && operands.iter().zip(args).all(|(operand, arg)| match operand {
                        OperandPattern::Literal(p) => {
                            graph.literal(*arg) == Some(&Literal::Primitive(*p))
                        }
                        OperandPattern::Visit | OperandPattern::Nested(_) => true,
                    })
            }
        }
    }

    /// Reset `visitor`, then walk `anchor` if it fits. Returns whether it did.
    ///
    /// The graph is only read; every capture ends up in the visitor.
    pub fn run<V: Visitor + ?Sized>(&self, graph: &Graph, anchor: NodeId, visitor: &mut V) -> bool {
        visitor.reset();
        if !self.fits(graph, anchor) {
            return false;
        }
        self.walk(graph, anchor, visitor, 1);
        true
    }

    fn walk<V: Visitor + ?Sized>(&self, graph: &Graph, node: NodeId, visitor: &mut V, depth: usize) {
        for (position, arg) in graph.args(node).iter().enumerate() {
            let site = Site { depth, position };
            match self.operands.as_ref().map(|operands| &operands[position]) {
                None | Some(OperandPattern::Visit) => visitor.visit(graph, *arg, site),
                Some(OperandPattern::Nested(pattern)) => {
                    let fitted = pattern.fits(graph, *arg);
                    if fitted {
                        pattern.walk(graph, *arg, visitor, depth + 1);
                    }
                    visitor.nested(graph, *arg, site, fitted);
                }
                Some(OperandPattern::Literal(_)) => (),
            }
        }
    }
}
