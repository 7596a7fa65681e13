//! Constant values and the arithmetic the rewrites perform on them.
//!
//! Only three element types are understood by the algebra: `f32`, `f64` and
//! `i32`. Tensors of any other element type are carried around as raw bytes
//! ([`Tensor::Raw`]); every query about their contents answers "not provably
//! that value" rather than failing.

use std::fmt;
use std::ops::Mul;
use std::str::FromStr;

use approx::AbsDiffEq;
use ndarray::{ArrayD, Dimension, IxDyn};
use num_traits::{NumCast, ToPrimitive};
use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::{Graph, NodeId};
use crate::error::{InvalidElementSnafu, Result, ShapeMismatchSnafu, UnsupportedTypeSnafu};

/// Operator names used by the built-in rewrites.
pub mod prim {
    pub const SCALAR_MUL: &str = "scalar_mul";
    pub const SCALAR_ADD: &str = "scalar_add";
    pub const MUL: &str = "mul";
    pub const TENSOR_ADD: &str = "tensor_add";
    pub const ZEROS_LIKE: &str = "zeros_like";
    pub const POW: &str = "pow";
    pub const MAKE_TUPLE: &str = "make_tuple";
    pub const ADDN: &str = "addn";
    pub const ALL_REDUCE: &str = "all_reduce";
    pub const MOMENTUM: &str = "momentum";
}

/// An operator identity. Interned, so comparing two primitives is cheap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Primitive(egg::Symbol);

impl Primitive {
    pub fn new(name: &str) -> Self {
        Primitive(egg::Symbol::from(name))
    }

    pub fn as_str(&self) -> &'static str {
        self.0.as_str()
    }

    pub fn is(&self, name: &str) -> bool {
        self.as_str() == name
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    I8,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn byte_width(self) -> usize {
        match self {
            DType::Bool | DType::I8 => 1,
            DType::F16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bool" => Ok(DType::Bool),
            "i8" => Ok(DType::I8),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            "f16" => Ok(DType::F16),
            "f32" => Ok(DType::F32),
            "f64" => Ok(DType::F64),
            _ => Err(format!("unknown element type {}", s)),
        }
    }
}

/// Inferred element type and shape of a node, as handed to us by the front
/// end. We read these, we never compute them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        TensorType {
            dtype,
            shape: shape.to_vec(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.dtype, itertools::join(&self.shape, ", "))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    /// Element types we don't compute with. `data` holds
    /// `element_count * dtype.byte_width()` bytes.
    Raw {
        dtype: DType,
        shape: Vec<usize>,
        data: Vec<u8>,
    },
}

impl Tensor {
    pub fn dtype(&self) -> DType {
        match self {
            Tensor::F32(_) => DType::F32,
            Tensor::F64(_) => DType::F64,
            Tensor::I32(_) => DType::I32,
            Tensor::Raw { dtype, .. } => *dtype,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::F64(a) => a.shape(),
            Tensor::I32(a) => a.shape(),
            Tensor::Raw { shape, .. } => shape,
        }
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.dtype(), self.shape())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A tensor of type `ty` with every element set to `value`.
    pub fn filled(ty: &TensorType, value: f64) -> Result<Tensor> {
        let shape = IxDyn(&ty.shape);
        match ty.dtype {
            DType::F32 => Ok(Tensor::F32(ArrayD::from_elem(shape, value as f32))),
            DType::F64 => Ok(Tensor::F64(ArrayD::from_elem(shape, value))),
            DType::I32 => Ok(Tensor::I32(ArrayD::from_elem(
                shape,
                exact::<i32>(value, ty.dtype)?,
            ))),
            dtype => UnsupportedTypeSnafu { dtype }.fail(),
        }
    }

    /// Build a tensor from row-major values. The values are converted to the
    /// element type and must be exactly representable in it; a count other
    /// than the shape's element count fails.
    pub fn from_values(ty: &TensorType, values: &[f64]) -> Result<Tensor> {
        ensure!(
            values.len() == ty.element_count(),
            ShapeMismatchSnafu {
                expected: ty.element_count(),
                actual: values.len(),
            }
        );
        let shape = IxDyn(&ty.shape);
        let tensor = match ty.dtype {
            DType::F32 => Tensor::F32(from_shape_vec(
                shape,
                values.iter().map(|v| *v as f32).collect(),
            )?),
            DType::F64 => Tensor::F64(from_shape_vec(shape, values.to_vec())?),
            DType::I32 => Tensor::I32(from_shape_vec(
                shape,
                values
                    .iter()
                    .map(|v| exact::<i32>(*v, ty.dtype))
                    .collect::<Result<_>>()?,
            )?),
            DType::Bool => Tensor::Raw {
                dtype: ty.dtype,
                shape: ty.shape.clone(),
                data: values
                    .iter()
                    .map(|v| match exact::<u8>(*v, ty.dtype)? {
                        b @ 0..=1 => Ok(b),
                        _ => InvalidElementSnafu {
                            value: *v,
                            dtype: ty.dtype,
                        }
                        .fail(),
                    })
                    .collect::<Result<_>>()?,
            },
            DType::I8 => Tensor::Raw {
                dtype: ty.dtype,
                shape: ty.shape.clone(),
                data: values
                    .iter()
                    .map(|v| exact::<i8>(*v, ty.dtype).map(|b| b.to_le_bytes()[0]))
                    .collect::<Result<_>>()?,
            },
            DType::I64 => Tensor::Raw {
                dtype: ty.dtype,
                shape: ty.shape.clone(),
                data: values
                    .iter()
                    .map(|v| exact::<i64>(*v, ty.dtype))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .flat_map(|v| v.to_le_bytes().to_vec())
                    .collect(),
            },
            DType::F16 => return UnsupportedTypeSnafu { dtype: ty.dtype }.fail(),
        };
        Ok(tensor)
    }

    /// Every element equals `expected`: within epsilon of the element type for
    /// floats, exactly for ints. Always false for raw tensors.
    pub fn is_uniform(&self, expected: f64) -> bool {
        match self {
            Tensor::F32(a) => {
                let expected = expected as f32;
                a.iter().all(|x| x.abs_diff_eq(&expected, f32::EPSILON))
            }
            Tensor::F64(a) => a.iter().all(|x| x.abs_diff_eq(&expected, f64::EPSILON)),
            Tensor::I32(a) => match <i32 as NumCast>::from(expected) {
                Some(expected_int) if expected_int.to_f64() == Some(expected) => {
                    a.iter().all(|x| *x == expected_int)
                }
                _ => false,
            },
            Tensor::Raw { .. } => false,
        }
    }

    /// Contents as `f64`s in row-major order, when the algebra understands
    /// the element type.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            Tensor::F32(a) => Some(a.iter().map(|x| *x as f64).collect()),
            Tensor::F64(a) => Some(a.iter().copied().collect()),
            Tensor::I32(a) => Some(a.iter().map(|x| *x as f64).collect()),
            Tensor::Raw { .. } => None,
        }
    }
}

/// `value` as a `T`, if it converts without rounding or overflow.
fn exact<T: NumCast + ToPrimitive>(value: f64, dtype: DType) -> Result<T> {
    match <T as NumCast>::from(value) {
        Some(v) if v.to_f64() == Some(value) => Ok(v),
        _ => InvalidElementSnafu { value, dtype }.fail(),
    }
}

fn from_shape_vec<T>(shape: IxDyn, values: Vec<T>) -> Result<ArrayD<T>> {
    let actual = values.len();
    let expected = shape.size();
    ArrayD::from_shape_vec(shape, values)
        .ok()
        .ok_or_else(|| ShapeMismatchSnafu { expected, actual }.build())
}

/// The value held by a constant node.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(NotNan<f64>),
    Tensor(Tensor),
    /// The operator slot of a call.
    Primitive(Primitive),
}

impl Literal {
    pub fn float(value: f64) -> Option<Literal> {
        NotNan::new(value).ok().map(Literal::Float)
    }

    pub fn primitive(&self) -> Option<Primitive> {
        match self {
            Literal::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Literal::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Scalar literals compare by numeric value; float scalars within
    /// `f64::EPSILON`.
    pub fn is_scalar_number(&self, expected: f64) -> bool {
        match self {
            Literal::Int(i) => *i as f64 == expected,
            Literal::Float(f) => f.into_inner().abs_diff_eq(&expected, f64::EPSILON),
            Literal::Bool(_) | Literal::Tensor(_) | Literal::Primitive(_) => false,
        }
    }

    /// A scalar, or a single-element tensor, equal to `expected`.
    pub fn is_scalar_value(&self, expected: f64) -> bool {
        match self {
            Literal::Tensor(t) => t.len() == 1 && t.is_uniform(expected),
            other => other.is_scalar_number(expected),
        }
    }

    /// A scalar equal to `expected`, or a tensor of any size whose elements
    /// all are.
    pub fn is_uniform(&self, expected: f64) -> bool {
        match self {
            Literal::Tensor(t) => t.is_uniform(expected),
            other => other.is_scalar_number(expected),
        }
    }
}

impl From<Tensor> for Literal {
    fn from(t: Tensor) -> Self {
        Literal::Tensor(t)
    }
}

/// `node` is a constant that, read as a scalar or single-element tensor,
/// equals `expected`.
pub fn is_scalar_constant(graph: &Graph, node: NodeId, expected: f64) -> bool {
    graph
        .literal(node)
        .map_or(false, |literal| literal.is_scalar_value(expected))
}

/// `node` is a constant whose every element equals `expected`.
pub fn is_uniform_constant(graph: &Graph, node: NodeId, expected: f64) -> bool {
    graph
        .literal(node)
        .map_or(false, |literal| literal.is_uniform(expected))
}

fn multiply<T: Copy>(
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    shape: &[usize],
    op: impl Fn(T, T) -> T,
) -> Result<ArrayD<T>> {
    let count: usize = shape.iter().product();
    for operand in &[a, b] {
        ensure!(
            operand.len() == 1 || operand.len() == count,
            ShapeMismatchSnafu {
                expected: count,
                actual: operand.len(),
            }
        );
    }
    let lhs: Vec<T> = a.iter().copied().collect();
    let rhs: Vec<T> = b.iter().copied().collect();
    let at = |values: &[T], i: usize| if values.len() == 1 { values[0] } else { values[i] };
    let out = (0..count).map(|i| op(at(&lhs, i), at(&rhs, i))).collect();
    from_shape_vec(IxDyn(shape), out)
}

/// Elementwise product of two constants into a tensor of type `output`.
///
/// A single-element operand is broadcast against the other; any other operand
/// must have exactly `output`'s element count. Both operands must already have
/// `output`'s element type.
pub fn elementwise_multiply(a: &Tensor, b: &Tensor, output: &TensorType) -> Result<Tensor> {
    for operand in &[a, b] {
        ensure!(
            operand.dtype() == output.dtype,
            UnsupportedTypeSnafu {
                dtype: operand.dtype()
            }
        );
    }
    let shape = &output.shape;
    match (a, b) {
        (Tensor::F32(a), Tensor::F32(b)) => Ok(Tensor::F32(multiply(a, b, shape, f32::mul)?)),
        (Tensor::F64(a), Tensor::F64(b)) => Ok(Tensor::F64(multiply(a, b, shape, f64::mul)?)),
        (Tensor::I32(a), Tensor::I32(b)) => {
            Ok(Tensor::I32(multiply(a, b, shape, i32::wrapping_mul)?))
        }
        _ => UnsupportedTypeSnafu {
            dtype: output.dtype,
        }
        .fail(),
    }
}

/// A zero-filled tensor of type `ty`. Works for every element type.
pub fn zero_filled_like(ty: &TensorType) -> Result<Tensor> {
    match ty.dtype {
        DType::F32 | DType::F64 | DType::I32 => Tensor::filled(ty, 0.0),
        dtype => Ok(Tensor::Raw {
            dtype,
            shape: ty.shape.clone(),
            data: vec![0; ty.element_count() * dtype.byte_width()],
        }),
    }
}

/// A tensor of type `ty` whose contents come from `source`: replicated when
/// `source` has one element, copied when it has exactly as many elements as
/// `ty`.
pub fn broadcast_filled_like(ty: &TensorType, source: &Tensor) -> Result<Tensor> {
    let count = ty.element_count();
    ensure!(
        source.len() == 1 || source.len() == count,
        ShapeMismatchSnafu {
            expected: count,
            actual: source.len(),
        }
    );
    ensure!(
        source.dtype() == ty.dtype,
        UnsupportedTypeSnafu {
            dtype: source.dtype()
        }
    );
    let shape = IxDyn(&ty.shape);
    match source {
        Tensor::F32(a) => Ok(Tensor::F32(from_shape_vec(shape, replicate(a, count))?)),
        Tensor::F64(a) => Ok(Tensor::F64(from_shape_vec(shape, replicate(a, count))?)),
        Tensor::I32(a) => Ok(Tensor::I32(from_shape_vec(shape, replicate(a, count))?)),
        Tensor::Raw { dtype, data, .. } => {
            let data = if source.len() == 1 {
                data.iter()
                    .copied()
                    .cycle()
                    .take(count * dtype.byte_width())
                    .collect()
            } else {
                data.clone()
            };
            Ok(Tensor::Raw {
                dtype: *dtype,
                shape: ty.shape.clone(),
                data,
            })
        }
    }
}

fn replicate<T: Copy>(source: &ArrayD<T>, count: usize) -> Vec<T> {
    let values: Vec<T> = source.iter().copied().collect();
    values.iter().copied().cycle().take(count).collect()
}
