use snafu::Snafu;

use crate::language::literal::DType;
use crate::language::{NodeId, ScopeId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A constant does not have an element count the operation can use.
    #[snafu(display("shape mismatch: expected {expected} elements, found {actual}"))]
    ShapeMismatch { expected: usize, actual: usize },

    /// The constant algebra only computes with f32, f64 and i32 elements.
    #[snafu(display("unsupported element type {dtype}"))]
    UnsupportedType { dtype: DType },

    /// A literal element has no exact representation in its element type.
    #[snafu(display("{value} is not a valid {dtype} element"))]
    InvalidElement { value: f64, dtype: DType },

    /// A node was about to be referenced from a scope it is not visible in.
    #[snafu(display("node {node} cannot be referenced from scope {scope}"))]
    IllegalCrossGraphReference { node: NodeId, scope: ScopeId },

    #[snafu(display("no fixed point after {iterations} iterations ({rewrites} rewrites)"))]
    IterationCapExceeded { iterations: usize, rewrites: usize },

    #[snafu(display("node {node} is not a call"))]
    NotACall { node: NodeId },

    #[snafu(display("unknown node {node}"))]
    UnknownNode { node: NodeId },

    #[snafu(display("could not parse program: {message}"))]
    Parse { message: String },

    #[snafu(display("invalid pass configuration: {source}"))]
    Config { source: serde_json::Error },

    #[snafu(display("evaluation failed: {message}"))]
    Evaluation { message: String },
}
