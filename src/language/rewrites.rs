use super::literal::{
    broadcast_filled_like, elementwise_multiply, is_scalar_constant, is_uniform_constant, prim,
    zero_filled_like, Literal,
};
use super::pattern::{OperandPattern, Pattern, Site, Visitor};
use super::{Builder, Graph, Node, NodeId};
use crate::error::Result;

/// An edge change the driver commits after the replacement itself.
#[derive(Clone, Debug, PartialEq)]
pub enum EdgePatch {
    /// See [`Graph::rewire_consumers_except`].
    RewireConsumersExcept {
        source: NodeId,
        target: NodeId,
        exempt: NodeId,
    },
}

/// What a rule produced for an anchor: the node that should take the anchor's
/// place, plus any extra edge changes.
#[derive(Clone, Debug, PartialEq)]
pub struct Rewrite {
    pub replacement: NodeId,
    pub patches: Vec<EdgePatch>,
}

impl Rewrite {
    pub fn to(replacement: NodeId) -> Self {
        Rewrite {
            replacement,
            patches: Vec::new(),
        }
    }
}

/// A local rewrite queried against a single anchor node.
///
/// `Ok(None)` means the rule does not fire, whether because the anchor did
/// not fit or because a side condition failed. A rule may allocate nodes
/// through the builder but never moves existing edges.
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>>;
}

fn is_call(graph: &Graph, node: NodeId) -> bool {
    graph.node(node).is_call()
}

fn is_parameter(graph: &Graph, node: NodeId) -> bool {
    match graph.node(node) {
        Node::Parameter(_) => true,
        _ => false,
    }
}

fn is_zeros_like(graph: &Graph, node: NodeId) -> bool {
    graph.is_call_to(node, prim::ZEROS_LIKE)
}

// (scalar_mul 0 x), (scalar_mul x 0) => 0
// (scalar_mul 1 x), (scalar_mul x 1) => x
pub struct MultiplyByZeroOrOne {
    pattern: Pattern,
}

#[derive(Default)]
struct ZeroOrOne {
    x: Option<NodeId>,
    zero: Option<Literal>,
    is_one: bool,
}

impl Visitor for ZeroOrOne {
    fn reset(&mut self) {
        *self = ZeroOrOne::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, _site: Site) {
        if self.is_one || is_call(graph, node) {
            self.x = Some(node);
            return;
        }
        if let Some(literal) = graph.literal(node) {
            if literal.is_scalar_number(0.0) {
                self.zero = Some(literal.clone());
            } else if literal.is_scalar_number(1.0) {
                self.is_one = true;
            }
        }
        if !self.is_one {
            self.x = Some(node);
        }
    }
}

impl MultiplyByZeroOrOne {
    pub fn new() -> Self {
        MultiplyByZeroOrOne {
            pattern: Pattern::binary(prim::SCALAR_MUL),
        }
    }
}

impl Rule for MultiplyByZeroOrOne {
    fn name(&self) -> &'static str {
        "multiply_by_zero_or_one"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = ZeroOrOne::default();
        if !self.pattern.run(builder, anchor, &mut state) {
            return Ok(None);
        }
        if let Some(zero) = state.zero {
            let scope = builder.scope_of(anchor);
            return Ok(Some(Rewrite::to(builder.constant(scope, zero))));
        }
        if state.is_one {
            return Ok(state.x.map(Rewrite::to));
        }
        Ok(None)
    }
}

// (mul 0 x), (mul x 0), (mul (zeros_like y) x) => zeros of the anchor's type
pub struct TensorMultiplyByZero {
    pattern: Pattern,
}

#[derive(Default)]
struct TensorZero {
    x: Option<NodeId>,
    is_zero: bool,
}

impl Visitor for TensorZero {
    fn reset(&mut self) {
        *self = TensorZero::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, _site: Site) {
        if self.is_zero {
            self.x = Some(node);
            return;
        }
        let zero = match graph.node(node) {
            Node::Parameter(_) => false,
            Node::Call(_) => is_zeros_like(graph, node),
            Node::Constant(_) => is_uniform_constant(graph, node, 0.0),
        };
        if zero {
            self.is_zero = true;
        } else {
            self.x = Some(node);
        }
    }
}

impl TensorMultiplyByZero {
    pub fn new() -> Self {
        TensorMultiplyByZero {
            pattern: Pattern::binary(prim::MUL),
        }
    }
}

impl Rule for TensorMultiplyByZero {
    fn name(&self) -> &'static str {
        "tensor_multiply_by_zero"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = TensorZero::default();
        if !self.pattern.run(builder, anchor, &mut state) || !state.is_zero {
            return Ok(None);
        }
        let scope = builder.scope_of(anchor);
        // Folding would hoist x's scope away.
        if let Some(x) = state.x {
            if builder.literal(x).is_none() && builder.scope_of(x) != scope {
                return Ok(None);
            }
        }
        let ty = match builder.ty(anchor) {
            Some(ty) => ty.clone(),
            None => return Ok(None),
        };
        let zeros = match zero_filled_like(&ty) {
            Ok(zeros) => zeros,
            Err(_) => return Ok(None),
        };
        let constant = builder.constant(scope, zeros.into());
        Ok(Some(Rewrite::to(builder.typed(constant, Some(ty)))))
    }
}

// (mul 1 x), (mul x 1) => x, when the shapes agree
pub struct TensorMultiplyByOne {
    pattern: Pattern,
}

#[derive(Default)]
struct TensorOne {
    x: Option<NodeId>,
    one: Option<NodeId>,
}

impl Visitor for TensorOne {
    fn reset(&mut self) {
        *self = TensorOne::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, _site: Site) {
        if self.one.is_none()
            && graph.literal(node).is_some()
            && is_uniform_constant(graph, node, 1.0)
        {
            self.one = Some(node);
        } else {
            self.x = Some(node);
        }
    }
}

impl TensorMultiplyByOne {
    pub fn new() -> Self {
        TensorMultiplyByOne {
            pattern: Pattern::binary(prim::MUL),
        }
    }
}

impl Rule for TensorMultiplyByOne {
    fn name(&self) -> &'static str {
        "tensor_multiply_by_one"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = TensorOne::default();
        if !self.pattern.run(builder, anchor, &mut state) {
            return Ok(None);
        }
        let (one, x) = match (state.one, state.x) {
            (Some(one), Some(x)) => (one, x),
            _ => return Ok(None),
        };
        let ty = match builder.ty(anchor) {
            Some(ty) => ty.clone(),
            None => return Ok(None),
        };

        // A one of some other shape would broadcast x to a shape we'd lose.
        let singleton = match builder.literal(one).and_then(Literal::tensor) {
            Some(tensor) => tensor.len() == 1 || tensor.shape() == ty.shape.as_slice(),
            None => true,
        };
        if !singleton {
            return Ok(None);
        }

        if is_call(builder, x) || is_parameter(builder, x) {
            return Ok(match builder.ty(x) {
                Some(x_ty) if x_ty.shape == ty.shape => Some(Rewrite::to(x)),
                _ => None,
            });
        }
        let source = match builder.literal(x).and_then(Literal::tensor) {
            Some(tensor) => tensor.clone(),
            None => return Ok(None),
        };
        let filled = match broadcast_filled_like(&ty, &source) {
            Ok(filled) => filled,
            Err(_) => return Ok(None),
        };
        let scope = builder.scope_of(anchor);
        let constant = builder.constant(scope, filled.into());
        Ok(Some(Rewrite::to(builder.typed(constant, Some(ty)))))
    }
}

// (scalar_add 0 x), (scalar_add x 0) => x
pub struct AddByZero {
    pattern: Pattern,
}

#[derive(Default)]
struct AddZero {
    x: Option<NodeId>,
    is_zero: bool,
}

impl Visitor for AddZero {
    fn reset(&mut self) {
        *self = AddZero::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, site: Site) {
        // Arguments of a nested zeros_like are not operands of the add.
        if site.depth != 1 {
            return;
        }
        let zero = is_scalar_constant(graph, node, 0.0);
        if zero && !self.is_zero {
            self.is_zero = true;
        } else {
            self.x = Some(node);
        }
    }

    fn nested(&mut self, graph: &Graph, node: NodeId, site: Site, fitted: bool) {
        if fitted && !self.is_zero {
            self.is_zero = true;
        } else if fitted {
            self.x = Some(node);
        } else {
            self.visit(graph, node, site);
        }
    }
}

impl AddByZero {
    pub fn new() -> Self {
        AddByZero {
            pattern: Pattern::binary(prim::SCALAR_ADD),
        }
    }
}

impl Rule for AddByZero {
    fn name(&self) -> &'static str {
        "add_by_zero"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = AddZero::default();
        if !self.pattern.run(builder, anchor, &mut state) || !state.is_zero {
            return Ok(None);
        }
        Ok(state.x.map(Rewrite::to))
    }
}

// (tensor_add (zeros_like y) x), (tensor_add x (zeros_like y)) => x
pub struct TensorAddByZero {
    pattern: Pattern,
}

impl TensorAddByZero {
    pub fn new() -> Self {
        let zeros_like = Pattern::with_operands(prim::ZEROS_LIKE, vec![OperandPattern::Visit]);
        TensorAddByZero {
            pattern: Pattern::with_operands(
                prim::TENSOR_ADD,
                vec![
                    OperandPattern::Nested(zeros_like.clone()),
                    OperandPattern::Nested(zeros_like),
                ],
            ),
        }
    }
}

impl Rule for TensorAddByZero {
    fn name(&self) -> &'static str {
        "tensor_add_by_zero"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = AddZero::default();
        if !self.pattern.run(builder, anchor, &mut state) || !state.is_zero {
            return Ok(None);
        }
        let x = match state.x {
            Some(x) => x,
            None => return Ok(None),
        };
        if let (Some(anchor_ty), Some(x_ty)) = (builder.ty(anchor), builder.ty(x)) {
            if anchor_ty.shape != x_ty.shape {
                return Ok(None);
            }
        }
        Ok(Some(Rewrite::to(x)))
    }
}

// (momentum (zeros_like x) y z ...) => (make_tuple z y)
pub struct OptUpdateZeroTensor {
    pattern: Pattern,
}

#[derive(Default)]
struct ZeroGradient {
    zeroed: bool,
    y: Option<NodeId>,
    z: Option<NodeId>,
}

impl Visitor for ZeroGradient {
    fn reset(&mut self) {
        *self = ZeroGradient::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, site: Site) {
        match site.position {
            0 => self.zeroed = is_zeros_like(graph, node) && graph.args(node).len() == 1,
            1 => self.y = Some(node),
            2 => self.z = Some(node),
            _ => (),
        }
    }
}

impl OptUpdateZeroTensor {
    pub fn new() -> Self {
        OptUpdateZeroTensor {
            pattern: Pattern::call(prim::MOMENTUM),
        }
    }
}

impl Rule for OptUpdateZeroTensor {
    fn name(&self) -> &'static str {
        "opt_update_zero_tensor"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = ZeroGradient::default();
        if !self.pattern.run(builder, anchor, &mut state) || !state.zeroed {
            return Ok(None);
        }
        let (y, z) = match (state.y, state.z) {
            (Some(y), Some(z)) => (y, z),
            _ => return Ok(None),
        };
        let scope = builder.scope_of(anchor);
        let tuple = builder.op(scope, prim::MAKE_TUPLE, &[z, y])?;
        Ok(Some(Rewrite::to(tuple)))
    }
}

// (mul c1 (mul c2 e)) => (mul e c) where c = c1 * c2 folded, or
//                     => (mul e (mul c1 c2)) when the constants can't be folded
pub struct ConstantDuplicateMul {
    pattern: Pattern,
}

#[derive(Default)]
struct ConstantAndOperand {
    constant: Option<NodeId>,
    operand: Option<NodeId>,
}

impl Visitor for ConstantAndOperand {
    fn reset(&mut self) {
        *self = ConstantAndOperand::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, _site: Site) {
        match graph.node(node) {
            Node::Constant(Literal::Tensor(_)) => self.constant = Some(node),
            Node::Call(_) | Node::Parameter(_) => self.operand = Some(node),
            Node::Constant(_) => (),
        }
    }
}

impl ConstantAndOperand {
    fn both(&self) -> Option<(NodeId, NodeId)> {
        Some((self.constant?, self.operand?))
    }
}

impl ConstantDuplicateMul {
    pub fn new() -> Self {
        ConstantDuplicateMul {
            pattern: Pattern::binary(prim::MUL),
        }
    }

    /// `c1 * c2` as a constant of `e`'s type, if `e` is annotated and the
    /// algebra can compute it.
    fn fold(graph: &Graph, c1: NodeId, c2: NodeId, e: NodeId) -> Option<Literal> {
        let output = graph.ty(e)?;
        let a = graph.literal(c1)?.tensor()?;
        let b = graph.literal(c2)?.tensor()?;
        elementwise_multiply(a, b, output).ok().map(Literal::Tensor)
    }
}

impl Rule for ConstantDuplicateMul {
    fn name(&self) -> &'static str {
        "constant_duplicate_mul"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = ConstantAndOperand::default();
        if !self.pattern.run(builder, anchor, &mut state) {
            return Ok(None);
        }
        let (c1, inner) = match state.both() {
            Some(found) if is_call(builder, found.1) => found,
            _ => return Ok(None),
        };
        if !self.pattern.run(builder, inner, &mut state) {
            return Ok(None);
        }
        let (c2, e) = match state.both() {
            Some(found) => found,
            None => return Ok(None),
        };

        let scope = builder.scope_of(anchor);
        let constant = match Self::fold(builder, c1, c2, e) {
            Some(folded) => {
                let ty = folded.tensor().map(|t| t.ty());
                let constant = builder.constant(scope, folded);
                builder.typed(constant, ty)
            }
            None => builder.op(scope, prim::MUL, &[c1, c2])?,
        };
        let product = builder.op(scope, prim::MUL, &[e, constant])?;
        let ty = builder.ty(anchor).cloned();
        Ok(Some(Rewrite::to(builder.typed(product, ty))))
    }
}

// (pow x 1), (pow x 1.0) => x
pub struct PowerOneEliminate {
    pattern: Pattern,
}

impl PowerOneEliminate {
    pub fn new() -> Self {
        PowerOneEliminate {
            pattern: Pattern::binary(prim::POW),
        }
    }
}

impl Rule for PowerOneEliminate {
    fn name(&self) -> &'static str {
        "power_one_eliminate"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        if !self.pattern.fits(builder, anchor) {
            return Ok(None);
        }
        let args = builder.args(anchor);
        let one = match builder.literal(args[1]) {
            Some(Literal::Int(i)) => *i == 1,
            Some(Literal::Float(f)) => f.into_inner() == 1.0,
            _ => false,
        };
        Ok(if one { Some(Rewrite::to(args[0])) } else { None })
    }
}

// (addn (make_tuple (mul (all_reduce x) y) z))
//   => (mul (all_reduce (addn (make_tuple z x))) y)
//
// Other tuples holding the old mul are pointed at the new all_reduce.
pub struct AdjustAllReduceMulAdd {
    pattern: Pattern,
}

#[derive(Default)]
struct AllReduceMulAdd {
    // Operands of the mul being walked.
    pending_reduce: Option<NodeId>,
    pending_other: Option<NodeId>,

    mul: Option<NodeId>,
    all_reduce: Option<NodeId>,
    y: Option<NodeId>,
    z: Option<NodeId>,
}

impl Visitor for AllReduceMulAdd {
    fn reset(&mut self) {
        *self = AllReduceMulAdd::default();
    }

    fn visit(&mut self, graph: &Graph, node: NodeId, site: Site) {
        match site.depth {
            // A tuple element that is not a mul at all.
            2 => self.z = Some(node),
            3 => {
                if self.pending_reduce.is_none()
                    && graph.is_call_to(node, prim::ALL_REDUCE)
                    && !graph.args(node).is_empty()
                {
                    self.pending_reduce = Some(node);
                } else {
                    self.pending_other = Some(node);
                }
            }
            _ => (),
        }
    }

    fn nested(&mut self, graph: &Graph, node: NodeId, site: Site, fitted: bool) {
        if site.depth != 2 {
            return;
        }
        if !fitted {
            self.visit(graph, node, site);
            return;
        }
        let reduce = self.pending_reduce.take();
        let other = self.pending_other.take();
        match (reduce, self.mul) {
            // Both elements scale an all_reduce: no single z to pull in.
            (Some(_), Some(_)) => self.reset(),
            (Some(_), None) => {
                self.mul = Some(node);
                self.all_reduce = reduce;
                self.y = other;
            }
            (None, _) => self.z = Some(node),
        }
    }
}

impl AdjustAllReduceMulAdd {
    pub fn new() -> Self {
        let mul = Pattern::binary(prim::MUL);
        let tuple = Pattern::with_operands(
            prim::MAKE_TUPLE,
            vec![
                OperandPattern::Nested(mul.clone()),
                OperandPattern::Nested(mul),
            ],
        );
        AdjustAllReduceMulAdd {
            pattern: Pattern::with_operands(prim::ADDN, vec![OperandPattern::Nested(tuple)]),
        }
    }
}

impl Rule for AdjustAllReduceMulAdd {
    fn name(&self) -> &'static str {
        "adjust_all_reduce_mul_add"
    }

    fn try_rewrite(&self, builder: &mut Builder<'_>, anchor: NodeId) -> Result<Option<Rewrite>> {
        let mut state = AllReduceMulAdd::default();
        if !self.pattern.run(builder, anchor, &mut state) {
            return Ok(None);
        }
        let (mul, all_reduce, y, z) = match (state.mul, state.all_reduce, state.y, state.z) {
            (Some(mul), Some(all_reduce), Some(y), Some(z)) => (mul, all_reduce, y, z),
            _ => return Ok(None),
        };
        let x = builder.args(all_reduce)[0];
        let tuple = builder.args(anchor)[0];
        let scope = builder.scope_of(all_reduce);

        // Everything is rebuilt next to the all_reduce, reusing the original
        // operator nodes.
        let z = builder.rehome(z, scope)?;
        let tuple_op = builder.operands(tuple)[0];
        let addn_op = builder.operands(anchor)[0];
        let reduce_op = builder.operands(all_reduce)[0];
        let mul_op = builder.operands(mul)[0];

        let new_tuple = builder.call(scope, tuple_op, &[z, x])?;
        let sum = builder.call(scope, addn_op, &[new_tuple])?;
        let sum_ty = builder.ty(anchor).cloned();
        builder.typed(sum, sum_ty);
        let reduced = builder.call(scope, reduce_op, &[sum])?;
        let reduced_ty = builder.ty(all_reduce).cloned();
        builder.typed(reduced, reduced_ty);
        let scaled = builder.call(scope, mul_op, &[reduced, y])?;
        let scaled_ty = builder.ty(anchor).cloned();
        builder.typed(scaled, scaled_ty);

        Ok(Some(Rewrite {
            replacement: scaled,
            patches: vec![EdgePatch::RewireConsumersExcept {
                source: mul,
                target: reduced,
                exempt: tuple,
            }],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::literal::{DType, Tensor, TensorType};

    fn attempt(rule: &dyn Rule, program: &str) -> (Graph, NodeId, Option<Rewrite>) {
        let (mut graph, root) = Graph::from_sexpr(program).unwrap();
        let rewrite = rule
            .try_rewrite(&mut Builder::new(&mut graph), root)
            .unwrap();
        (graph, root, rewrite)
    }

    fn rewritten_to(rule: &dyn Rule, program: &str) -> Option<String> {
        let (graph, _, rewrite) = attempt(rule, program);
        rewrite.map(|r| graph.to_sexpr(r.replacement))
    }

    #[test]
    fn scalar_multiply_by_zero() {
        let rule = MultiplyByZeroOrOne::new();
        assert_eq!(rewritten_to(&rule, "(scalar_mul 0 x)"), Some("0".to_string()));
        assert_eq!(
            rewritten_to(&rule, "(scalar_mul x 0.0)"),
            Some("0.0".to_string())
        );
        assert_eq!(
            rewritten_to(&rule, "(scalar_mul (scalar_add x y) 0)"),
            Some("0".to_string())
        );
    }

    #[test]
    fn scalar_multiply_by_zero_builds_a_fresh_constant() {
        let (graph, root, rewrite) = attempt(&MultiplyByZeroOrOne::new(), "(scalar_mul 0 x)");
        let replacement = rewrite.unwrap().replacement;
        assert_ne!(replacement, graph.args(root)[0]);
        assert_eq!(graph.literal(replacement), Some(&Literal::Int(0)));
    }

    #[test]
    fn scalar_multiply_by_one() {
        let rule = MultiplyByZeroOrOne::new();
        assert_eq!(rewritten_to(&rule, "(scalar_mul 1 x)"), Some("x".to_string()));
        assert_eq!(rewritten_to(&rule, "(scalar_mul x 1.0)"), Some("x".to_string()));
        assert_eq!(rewritten_to(&rule, "(scalar_mul 2 x)"), None);
        assert_eq!(rewritten_to(&rule, "(mul 1 x)"), None);
    }

    #[test]
    fn scalar_multiply_by_one_keeps_identity() {
        let (graph, root, rewrite) = attempt(&MultiplyByZeroOrOne::new(), "(scalar_mul 1 (neg x))");
        assert_eq!(rewrite.unwrap().replacement, graph.args(root)[1]);
    }

    #[test]
    fn tensor_multiply_by_zero_uses_anchor_type() {
        let (graph, _, rewrite) = attempt(
            &TensorMultiplyByZero::new(),
            "(: f32 2 3 (mul (tensor f32 (shape 1) 0) (param x f32 2 3)))",
        );
        let replacement = rewrite.unwrap().replacement;
        let tensor = graph.literal(replacement).unwrap().tensor().unwrap();
        assert_eq!(tensor.ty(), TensorType::new(DType::F32, &[2, 3]));
        assert!(tensor.is_uniform(0.0));
        assert_eq!(graph.ty(replacement), Some(&tensor.ty()));
    }

    #[test]
    fn tensor_multiply_by_zeros_like() {
        let (graph, _, rewrite) = attempt(
            &TensorMultiplyByZero::new(),
            "(: i32 4 (mul x (zeros_like y)))",
        );
        let replacement = rewrite.unwrap().replacement;
        assert_eq!(
            graph.literal(replacement).unwrap().tensor(),
            Some(&Tensor::filled(&TensorType::new(DType::I32, &[4]), 0.0).unwrap())
        );
    }

    #[test]
    fn tensor_multiply_by_zero_needs_a_type() {
        let rule = TensorMultiplyByZero::new();
        assert_eq!(rewritten_to(&rule, "(mul (tensor f32 (shape 1) 0) x)"), None);
        assert_eq!(
            rewritten_to(&rule, "(: f32 2 (mul (tensor f32 (shape 2) 0 1) x))"),
            None
        );
    }

    #[test]
    fn tensor_multiply_by_zero_stays_in_scope() {
        let mut graph = Graph::new();
        let main = graph.root_scope();
        let inner = graph.add_scope("inner", main);
        let x = graph.create_parameter(main, "x", None);
        let neg = graph.create_op(main, "neg", &[x]).unwrap();
        let zeros = graph.create_op(inner, prim::ZEROS_LIKE, &[x]).unwrap();
        let mul = graph.create_op(inner, prim::MUL, &[zeros, neg]).unwrap();
        graph.set_type(mul, TensorType::new(DType::F32, &[2]));
        let rewrite = TensorMultiplyByZero::new()
            .try_rewrite(&mut Builder::new(&mut graph), mul)
            .unwrap();
        assert_eq!(rewrite, None);
    }

    #[test]
    fn tensor_multiply_by_one_returns_matching_operand() {
        assert_eq!(
            rewritten_to(
                &TensorMultiplyByOne::new(),
                "(: f32 2 2 (mul (tensor f32 (shape 1) 1) (param x f32 2 2)))",
            ),
            Some("(param x f32 2 2)".to_string())
        );
    }

    #[test]
    fn tensor_multiply_by_one_broadcasts_constants() {
        let (graph, _, rewrite) = attempt(
            &TensorMultiplyByOne::new(),
            "(: f64 3 (mul (tensor f64 (shape 3) 1) (tensor f64 (shape 1) 2.5)))",
        );
        let replacement = rewrite.unwrap().replacement;
        let tensor = graph.literal(replacement).unwrap().tensor().unwrap();
        assert_eq!(tensor.shape(), &[3]);
        assert!(tensor.is_uniform(2.5));
    }

    #[test]
    fn tensor_multiply_by_one_declines_on_shape_mismatch() {
        let rule = TensorMultiplyByOne::new();
        // The one is neither a singleton nor of the output shape.
        assert_eq!(
            rewritten_to(
                &rule,
                "(: f32 2 2 (mul (tensor f32 (shape 2) 1) (param x f32 2 2)))",
            ),
            None
        );
        // x would have to be broadcast.
        assert_eq!(
            rewritten_to(&rule, "(: f32 2 2 (mul 1 (param x f32 2)))"),
            None
        );
        assert_eq!(rewritten_to(&rule, "(: f32 2 2 (mul 1 x))"), None);
    }

    #[test]
    fn add_by_zero() {
        let rule = AddByZero::new();
        assert_eq!(rewritten_to(&rule, "(scalar_add 0 x)"), Some("x".to_string()));
        assert_eq!(
            rewritten_to(&rule, "(scalar_add x (tensor f32 (shape 1) 0))"),
            Some("x".to_string())
        );
        assert_eq!(
            rewritten_to(&rule, "(scalar_add x (tensor f32 (shape 2) 0))"),
            None
        );
        assert_eq!(rewritten_to(&rule, "(scalar_add x 1)"), None);
    }

    #[test]
    fn tensor_add_by_zero() {
        let rule = TensorAddByZero::new();
        assert_eq!(
            rewritten_to(&rule, "(tensor_add (zeros_like y) x)"),
            Some("x".to_string())
        );
        assert_eq!(
            rewritten_to(&rule, "(tensor_add x (tensor i32 (shape 1) 0))"),
            Some("x".to_string())
        );
        assert_eq!(rewritten_to(&rule, "(tensor_add x y)"), None);
        assert_eq!(
            rewritten_to(
                &rule,
                "(: f32 2 2 (tensor_add (zeros_like y) (param x f32 2)))",
            ),
            None
        );
    }

    #[test]
    fn opt_update_zero_tensor() {
        let rule = OptUpdateZeroTensor::new();
        assert_eq!(
            rewritten_to(&rule, "(momentum (zeros_like x) y z w)"),
            Some("(make_tuple z y)".to_string())
        );
        assert_eq!(rewritten_to(&rule, "(momentum (zeros_like x) y)"), None);
        assert_eq!(rewritten_to(&rule, "(momentum (zeros_like x w) y z)"), None);
        assert_eq!(rewritten_to(&rule, "(momentum x y z)"), None);
    }

    #[test]
    fn constant_duplicate_mul_folds() {
        let (graph, _, rewrite) = attempt(
            &ConstantDuplicateMul::new(),
            "(mul (tensor f32 (shape 1) 2) (mul (param e f32 2 2) (tensor f32 (shape 2 2) 3)))",
        );
        let replacement = rewrite.unwrap().replacement;
        let args = graph.args(replacement);
        assert_eq!(graph.to_sexpr(args[0]), "(param e f32 2 2)");
        let folded = graph.literal(args[1]).unwrap().tensor().unwrap();
        assert_eq!(folded.shape(), &[2, 2]);
        assert!(folded.is_uniform(6.0));
    }

    #[test]
    fn constant_duplicate_mul_regroups_without_folding() {
        // e is untyped, so the product's type is unknown.
        assert_eq!(
            rewritten_to(
                &ConstantDuplicateMul::new(),
                "(mul (mul (tensor f32 (shape 1) 3) e) (tensor f32 (shape 1) 2))",
            ),
            Some("(mul e (mul (tensor f32 (shape 1) 2) (tensor f32 (shape 1) 3)))".to_string())
        );
        // Element types differ.
        assert_eq!(
            rewritten_to(
                &ConstantDuplicateMul::new(),
                "(mul (tensor i32 (shape 1) 2) (mul (tensor f32 (shape 1) 3) (param e f32 1)))",
            ),
            Some(
                "(mul (param e f32 1) (mul (tensor i32 (shape 1) 2) (tensor f32 (shape 1) 3)))"
                    .to_string()
            )
        );
    }

    #[test]
    fn constant_duplicate_mul_needs_two_constants() {
        let rule = ConstantDuplicateMul::new();
        assert_eq!(rewritten_to(&rule, "(mul (tensor f32 (shape 1) 2) (mul e f))"), None);
        assert_eq!(rewritten_to(&rule, "(mul (tensor f32 (shape 1) 2) e)"), None);
        assert_eq!(rewritten_to(&rule, "(mul e (mul (tensor f32 (shape 1) 2) f))"), None);
    }

    #[test]
    fn power_one() {
        let rule = PowerOneEliminate::new();
        assert_eq!(rewritten_to(&rule, "(pow x 1)"), Some("x".to_string()));
        assert_eq!(rewritten_to(&rule, "(pow x 1.0)"), Some("x".to_string()));
        assert_eq!(rewritten_to(&rule, "(pow x 2)"), None);
        assert_eq!(rewritten_to(&rule, "(pow 1 x)"), None);
    }

    #[test]
    fn adjust_all_reduce_mul_add() {
        let rule = AdjustAllReduceMulAdd::new();
        assert_eq!(
            rewritten_to(&rule, "(addn (make_tuple (mul (all_reduce x) y) z))"),
            Some("(mul (all_reduce (addn (make_tuple z x))) y)".to_string())
        );
        assert_eq!(
            rewritten_to(&rule, "(addn (make_tuple z (mul y (all_reduce x))))"),
            Some("(mul (all_reduce (addn (make_tuple z x))) y)".to_string())
        );
        assert_eq!(
            rewritten_to(&rule, "(addn (make_tuple (mul x y) z))"),
            None
        );
        assert_eq!(rewritten_to(&rule, "(addn (make_tuple z w))"), None);
        assert_eq!(
            rewritten_to(
                &rule,
                "(addn (make_tuple (mul (all_reduce a) y1) (mul y2 (all_reduce b))))"
            ),
            None
        );
    }

    #[test]
    fn adjust_all_reduce_mul_add_patches_the_old_mul() {
        let (graph, root, rewrite) = attempt(
            &AdjustAllReduceMulAdd::new(),
            "(addn (make_tuple (mul (all_reduce x) y) z))",
        );
        let rewrite = rewrite.unwrap();
        let tuple = graph.args(root)[0];
        let old_mul = graph.args(tuple)[0];
        let new_reduce = graph.args(rewrite.replacement)[0];
        assert_eq!(
            rewrite.patches,
            vec![EdgePatch::RewireConsumersExcept {
                source: old_mul,
                target: new_reduce,
                exempt: tuple,
            }]
        );
    }

    #[test]
    fn adjust_all_reduce_mul_add_builds_next_to_the_reduce() {
        let mut graph = Graph::new();
        let main = graph.root_scope();
        let body = graph.add_scope("body", main);
        let x = graph.create_parameter(main, "x", None);
        let y = graph.create_parameter(main, "y", None);
        let w = graph.create_parameter(main, "w", None);
        let reduce = graph.create_op(main, prim::ALL_REDUCE, &[x]).unwrap();
        let mul = graph.create_op(main, prim::MUL, &[reduce, y]).unwrap();
        let z = graph.create_op(body, "neg", &[w]).unwrap();
        let tuple = graph.create_op(body, prim::MAKE_TUPLE, &[mul, z]).unwrap();
        let addn = graph.create_op(body, prim::ADDN, &[tuple]).unwrap();

        let rewrite = AdjustAllReduceMulAdd::new()
            .try_rewrite(&mut Builder::new(&mut graph), addn)
            .unwrap()
            .unwrap();
        let scaled = rewrite.replacement;
        assert_eq!(graph.scope_of(scaled), main);
        assert_eq!(
            graph.to_sexpr(scaled),
            "(mul (all_reduce (addn (make_tuple (neg w) x))) y)"
        );
        // z was copied out of the body.
        let new_tuple = graph.args(graph.args(graph.args(scaled)[0])[0])[0];
        let moved_z = graph.args(new_tuple)[0];
        assert_ne!(moved_z, z);
        assert_eq!(graph.scope_of(moved_z), main);
    }

    #[test]
    fn adjust_all_reduce_mul_add_cannot_move_parameters() {
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

        let result = AdjustAllReduceMulAdd::new().try_rewrite(&mut Builder::new(&mut graph), addn);
        match result {
            Err(crate::Error::IllegalCrossGraphReference { node, .. }) => assert_eq!(node, z),
            other => panic!("{:?}", other),
        }
    }
}
