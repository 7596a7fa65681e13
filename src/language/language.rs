use std::collections::{HashMap, HashSet};
use std::ops::Deref;

use cranelift_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};
use log::debug;
use smallvec::SmallVec;
use snafu::ensure;

use super::literal::{prim, Literal, Primitive, TensorType};
use crate::error::{IllegalCrossGraphReferenceSnafu, NotACallSnafu, Result, UnknownNodeSnafu};

/// Handle of a node in a [`Graph`]. Stable for the graph's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
entity_impl!(NodeId, "%");

/// Handle of a (possibly nested) sub-graph scope.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);
entity_impl!(ScopeId, "@");

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// `operands[0]` is the operator, `operands[1..]` the arguments.
    Call(Vec<NodeId>),
    Constant(Literal),
    Parameter(String),
}

impl Node {
    pub fn is_call(&self) -> bool {
        match self {
            Node::Call(_) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeData {
    pub node: Node,
    pub scope: ScopeId,
    /// Inferred type, if the front end provided one.
    pub ty: Option<TensorType>,
}

#[derive(Clone, Debug)]
pub struct ScopeData {
    pub name: String,
    pub parent: Option<ScopeId>,
    pub outputs: Vec<NodeId>,
}

/// One edge of the use-def index: `user`'s operand at `position` is the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: NodeId,
    pub position: usize,
}

/// Arena of IR nodes, grouped into scopes, with a use-def index.
///
/// Nodes are never mutated once created except for their operand edges, and
/// every edge change goes through a method that keeps the use-def index in
/// sync. A node whose last use goes away, and which is no scope output, is
/// detached on the spot together with whatever it alone kept alive;
/// [`Graph::collect_garbage`] catches the rest. A detached node that gets
/// referenced again is re-attached transparently.
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: PrimaryMap<NodeId, NodeData>,
    /// Use-chain: for each node, the attached calls that use it.
    uses: SecondaryMap<NodeId, SmallVec<[Use; 2]>>,
    detached: SecondaryMap<NodeId, bool>,
    scopes: PrimaryMap<ScopeId, ScopeData>,
    primitives: HashMap<Primitive, NodeId>,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    /// An empty graph with a single root scope.
    pub fn new() -> Self {
        let mut scopes = PrimaryMap::new();
        scopes.push(ScopeData {
            name: "main".to_string(),
            parent: None,
            outputs: Vec::new(),
        });
        Graph {
            nodes: PrimaryMap::new(),
            uses: SecondaryMap::new(),
            detached: SecondaryMap::new(),
            scopes,
            primitives: HashMap::new(),
        }
    }

    pub fn root_scope(&self) -> ScopeId {
        ScopeId::new(0)
    }

    /// Add a scope nested inside `parent`. Nodes of the new scope may refer
    /// to nodes of `parent` and its ancestors, but not the other way round.
    pub fn add_scope(&mut self, name: &str, parent: ScopeId) -> ScopeId {
        self.scopes.push(ScopeData {
            name: name.to_string(),
            parent: Some(parent),
            outputs: Vec::new(),
        })
    }

    pub fn scope(&self, scope: ScopeId) -> &ScopeData {
        &self.scopes[scope]
    }

    pub fn scopes(&self) -> impl Iterator<Item = ScopeId> + '_ {
        self.scopes.keys()
    }

    pub fn outputs(&self, scope: ScopeId) -> &[NodeId] {
        &self.scope(scope).outputs
    }

    pub fn add_output(&mut self, scope: ScopeId, node: NodeId) -> Result<()> {
        self.check_known(node)?;
        ensure!(
            self.is_visible(node, scope),
            IllegalCrossGraphReferenceSnafu { node, scope }
        );
        self.revive(node);
        self.scopes[scope].outputs.push(node);
        Ok(())
    }

    /// Number of nodes ever allocated, live or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.is_valid(node)
    }

    fn check_known(&self, node: NodeId) -> Result<()> {
        ensure!(self.contains(node), UnknownNodeSnafu { node });
        Ok(())
    }

    pub fn data(&self, node: NodeId) -> &NodeData {
        &self.nodes[node]
    }

    pub fn node(&self, node: NodeId) -> &Node {
        &self.data(node).node
    }

    pub fn scope_of(&self, node: NodeId) -> ScopeId {
        self.data(node).scope
    }

    pub fn ty(&self, node: NodeId) -> Option<&TensorType> {
        self.data(node).ty.as_ref()
    }

    /// Attach an inferred type to a node.
    pub fn set_type(&mut self, node: NodeId, ty: TensorType) {
        self.nodes[node].ty = Some(ty);
    }

    /// All operands of a call, operator included. Empty for leaves.
    pub fn operands(&self, node: NodeId) -> &[NodeId] {
        match self.node(node) {
            Node::Call(operands) => operands,
            _ => &[],
        }
    }

    /// The arguments of a call, i.e. its operands without the operator.
    pub fn args(&self, node: NodeId) -> &[NodeId] {
        match self.node(node) {
            Node::Call(operands) => &operands[1..],
            _ => &[],
        }
    }

    pub fn literal(&self, node: NodeId) -> Option<&Literal> {
        match self.node(node) {
            Node::Constant(literal) => Some(literal),
            _ => None,
        }
    }

    /// The primitive a call applies, when its operator is a primitive constant.
    pub fn operator(&self, node: NodeId) -> Option<Primitive> {
        match self.node(node) {
            Node::Call(operands) => self.literal(operands[0]).and_then(Literal::primitive),
            _ => None,
        }
    }

    pub fn is_call_to(&self, node: NodeId, name: &str) -> bool {
        self.operator(node).map_or(false, |p| p.is(name))
    }

    pub fn uses(&self, node: NodeId) -> &[Use] {
        &self.uses[node]
    }

    pub fn users(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.uses(node).iter().map(|u| u.user)
    }

    pub fn is_output(&self, node: NodeId) -> bool {
        self.scopes.values().any(|s| s.outputs.contains(&node))
    }

    /// False once the node has been detached as garbage, until something
    /// references it again.
    pub fn is_attached(&self, node: NodeId) -> bool {
        !self.detached[node]
    }

    /// `inner` is `outer` or nested somewhere inside it.
    pub fn scope_within(&self, inner: ScopeId, outer: ScopeId) -> bool {
        let mut current = Some(inner);
        while let Some(scope) = current {
            if scope == outer {
                return true;
            }
            current = self.scope(scope).parent;
        }
        false
    }

    /// Whether nodes of `scope` may reference `node`. Constants are visible
    /// everywhere; calls and parameters only from their own scope and the
    /// scopes nested inside it.
    pub fn is_visible(&self, node: NodeId, scope: ScopeId) -> bool {
        match self.node(node) {
            Node::Constant(_) => true,
            Node::Call(_) | Node::Parameter(_) => self.scope_within(scope, self.scope_of(node)),
        }
    }

    fn push(&mut self, node: Node, scope: ScopeId) -> NodeId {
        self.nodes.push(NodeData {
            node,
            scope,
            ty: None,
        })
    }

    pub fn create_constant(&mut self, scope: ScopeId, literal: Literal) -> NodeId {
        self.push(Node::Constant(literal), scope)
    }

    pub fn create_parameter(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: Option<TensorType>,
    ) -> NodeId {
        let id = self.push(Node::Parameter(name.to_string()), scope);
        self.nodes[id].ty = ty;
        id
    }

    /// The shared constant node holding primitive `name`.
    pub fn primitive(&mut self, name: &str) -> NodeId {
        let primitive = Primitive::new(name);
        if let Some(id) = self.primitives.get(&primitive) {
            return *id;
        }
        let root = self.root_scope();
        let id = self.create_constant(root, Literal::Primitive(primitive));
        self.primitives.insert(primitive, id);
        id
    }

    /// Create the call `operator(args...)` in `scope`. Every operand must be
    /// visible from `scope`.
    pub fn create_call(
        &mut self,
        scope: ScopeId,
        operator: NodeId,
        args: &[NodeId],
    ) -> Result<NodeId> {
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(operator);
        operands.extend_from_slice(args);
        for operand in &operands {
            self.check_known(*operand)?;
            ensure!(
                self.is_visible(*operand, scope),
                IllegalCrossGraphReferenceSnafu {
                    node: *operand,
                    scope
                }
            );
        }
        let id = self.push(Node::Call(operands.clone()), scope);
        for (position, operand) in operands.into_iter().enumerate() {
            self.add_use(operand, Use { user: id, position });
        }
        Ok(id)
    }

    /// Shorthand for [`Graph::create_call`] with a primitive operator.
    pub fn create_op(&mut self, scope: ScopeId, name: &str, args: &[NodeId]) -> Result<NodeId> {
        let operator = self.primitive(name);
        self.create_call(scope, operator, args)
    }

    fn add_use(&mut self, operand: NodeId, edge: Use) {
        if self.detached[edge.user] {
            return;
        }
        self.revive(operand);
        self.uses[operand].push(edge);
    }

    fn remove_use(&mut self, operand: NodeId, edge: Use) {
        self.uses[operand].retain(|u| *u != edge);
    }

    fn detach(&mut self, node: NodeId) {
        self.detached[node] = true;
        for (position, operand) in self.operands(node).to_vec().into_iter().enumerate() {
            self.remove_use(
                operand,
                Use {
                    user: node,
                    position,
                },
            );
        }
    }

    /// Detach `node` if nothing uses it and it is no output, then do the same
    /// for its operands.
    fn release(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if self.detached[node] || !self.uses[node].is_empty() || self.is_output(node) {
                continue;
            }
            self.detach(node);
            stack.extend_from_slice(self.operands(node));
        }
    }

    /// Detach the nodes allocated at or after `watermark` that nothing uses,
    /// newest first, along with anything only they kept alive.
    pub fn release_unused_since(&mut self, watermark: usize) {
        for index in (watermark..self.nodes.len()).rev() {
            self.release(NodeId::new(index));
        }
    }

    /// Re-attach a detached node and, transitively, its operands.
    fn revive(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            if !self.detached[node] {
                continue;
            }
            self.detached[node] = false;
            for (position, operand) in self.operands(node).to_vec().into_iter().enumerate() {
                self.uses[operand].push(Use {
                    user: node,
                    position,
                });
                stack.push(operand);
            }
        }
    }

    /// Check that [`Graph::replace_uses`] would succeed, without changing
    /// anything.
    pub fn check_replace_uses(&self, old: NodeId, new: NodeId) -> Result<()> {
        self.check_known(old)?;
        self.check_known(new)?;
        for edge in self.uses(old).iter().filter(|u| u.user != new) {
            let scope = self.scope_of(edge.user);
            ensure!(
                self.is_visible(new, scope),
                IllegalCrossGraphReferenceSnafu { node: new, scope }
            );
        }
        for scope in self.scopes() {
            if self.outputs(scope).contains(&old) {
                ensure!(
                    self.is_visible(new, scope),
                    IllegalCrossGraphReferenceSnafu { node: new, scope }
                );
            }
        }
        Ok(())
    }

    /// Point every use of `old` (operand edges and scope outputs) at `new`.
    ///
    /// Either every edge moves or, when `new` is not visible from one of the
    /// users, none does. Uses held by `new` itself are left alone. `old` is
    /// detached afterwards unless `new` still uses it.
    pub fn replace_uses(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        self.check_replace_uses(old, new)?;
        if old == new {
            return Ok(());
        }
        let edges: Vec<Use> = self
            .uses(old)
            .iter()
            .copied()
            .filter(|u| u.user != new)
            .collect();
        for edge in edges {
            self.remove_use(old, edge);
            self.write_operand(edge.user, edge.position, new);
            self.add_use(new, edge);
        }
        let mut moved_output = false;
        for scope in self.scopes.values_mut() {
            for output in scope.outputs.iter_mut() {
                if *output == old {
                    *output = new;
                    moved_output = true;
                }
            }
        }
        if moved_output {
            self.revive(new);
        }
        self.release(old);
        Ok(())
    }

    fn write_operand(&mut self, user: NodeId, position: usize, new: NodeId) {
        if let Node::Call(operands) = &mut self.nodes[user].node {
            operands[position] = new;
        }
    }

    /// Point operand `position` of `user` at `new`. The previous operand is
    /// detached if that was its last use.
    pub fn set_edge(&mut self, user: NodeId, position: usize, new: NodeId) -> Result<()> {
        self.check_known(user)?;
        self.check_known(new)?;
        let old = match self.operands(user).get(position) {
            Some(old) => *old,
            None => return NotACallSnafu { node: user }.fail(),
        };
        let scope = self.scope_of(user);
        ensure!(
            self.is_visible(new, scope),
            IllegalCrossGraphReferenceSnafu { node: new, scope }
        );
        let edge = Use { user, position };
        self.remove_use(old, edge);
        self.write_operand(user, position, new);
        self.add_use(new, edge);
        self.release(old);
        Ok(())
    }

    fn tuple_consumers_except(&self, source: NodeId, target: NodeId, exempt: NodeId) -> Vec<Use> {
        self.uses(source)
            .iter()
            .copied()
            .filter(|u| u.user != exempt && u.user != target)
            .filter(|u| self.is_call_to(u.user, prim::MAKE_TUPLE))
            .collect()
    }

    /// Check that [`Graph::rewire_consumers_except`] would succeed, without
    /// changing anything.
    pub fn check_rewire(&self, source: NodeId, target: NodeId, exempt: NodeId) -> Result<()> {
        self.check_known(source)?;
        self.check_known(target)?;
        for edge in self.tuple_consumers_except(source, target, exempt) {
            let scope = self.scope_of(edge.user);
            ensure!(
                self.is_visible(target, scope),
                IllegalCrossGraphReferenceSnafu {
                    node: target,
                    scope
                }
            );
        }
        Ok(())
    }

    /// Point every tuple-forming consumer of `source`, except `exempt`, at
    /// `target` instead. Other consumers keep referencing `source`. Returns
    /// the number of edges moved.
    pub fn rewire_consumers_except(
        &mut self,
        source: NodeId,
        target: NodeId,
        exempt: NodeId,
    ) -> Result<usize> {
        self.check_rewire(source, target, exempt)?;
        let edges = self.tuple_consumers_except(source, target, exempt);
        for edge in &edges {
            debug!(
                "rewiring {} operand {} from {} to {}",
                edge.user, edge.position, source, target
            );
            self.set_edge(edge.user, edge.position, target)?;
        }
        Ok(edges.len())
    }

    /// Make `node` usable from `target`.
    ///
    /// Constants, and nodes already living in `target`, are returned as is.
    /// A call from another scope is copied into `target`; its operands are
    /// kept when `target` can see them and re-homed recursively otherwise. A
    /// parameter that `target` cannot see cannot be moved and fails the whole
    /// operation. On failure the copies made so far are left unreferenced.
    pub fn rehome(&mut self, node: NodeId, target: ScopeId) -> Result<NodeId> {
        self.check_known(node)?;
        if self.scope_of(node) == target {
            return Ok(node);
        }
        match self.node(node) {
            Node::Constant(_) => Ok(node),
            Node::Parameter(_) => {
                ensure!(
                    self.is_visible(node, target),
                    IllegalCrossGraphReferenceSnafu {
                        node,
                        scope: target
                    }
                );
                Ok(node)
            }
            Node::Call(operands) => {
                let operands = operands.clone();
                let mut moved = Vec::with_capacity(operands.len());
                for operand in operands {
                    if self.is_visible(operand, target) {
                        moved.push(operand);
                    } else {
                        moved.push(self.rehome(operand, target)?);
                    }
                }
                let copy = self.create_call(target, moved[0], &moved[1..])?;
                if let Some(ty) = self.ty(node).cloned() {
                    self.set_type(copy, ty);
                }
                debug!("rehomed {} into {} as {}", node, target, copy);
                Ok(copy)
            }
        }
    }

    /// Every node reachable from a scope output, operands before users.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for scope in self.scopes.values() {
            for output in &scope.outputs {
                // (node, operands already pushed)
                let mut stack = vec![(*output, false)];
                while let Some((node, expanded)) = stack.pop() {
                    if expanded {
                        order.push(node);
                        continue;
                    }
                    if !seen.insert(node) {
                        continue;
                    }
                    stack.push((node, true));
                    for operand in self.operands(node).iter().rev() {
                        if !seen.contains(operand) {
                            stack.push((*operand, false));
                        }
                    }
                }
            }
        }
        order
    }

    /// Detach every node not reachable from a scope output: its operand edges
    /// are dropped from the use-def index, so consumer queries only report
    /// live consumers. Returns the live nodes in post-order.
    ///
    /// This walks the whole arena. Rewrites already detach what they orphan,
    /// so this only has to pick up nodes built and never used.
    pub fn collect_garbage(&mut self) -> Vec<NodeId> {
        let order = self.live_nodes();
        let live: HashSet<NodeId> = order.iter().copied().collect();
        for index in 0..self.nodes.len() {
            let node = NodeId::new(index);
            if !self.detached[node] && !live.contains(&node) {
                self.detach(node);
            }
        }
        order
    }
}

/// Restricted view of a [`Graph`] handed to rewrite rules.
///
/// A rule may read anything and allocate new nodes, but it cannot move edges
/// of nodes that already exist; committing a rewrite is the driver's job.
pub struct Builder<'g> {
    graph: &'g mut Graph,
    watermark: usize,
}

impl<'g> Builder<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        let watermark = graph.len();
        Builder { graph, watermark }
    }

    pub fn call(&mut self, scope: ScopeId, operator: NodeId, args: &[NodeId]) -> Result<NodeId> {
        self.graph.create_call(scope, operator, args)
    }

    pub fn op(&mut self, scope: ScopeId, name: &str, args: &[NodeId]) -> Result<NodeId> {
        self.graph.create_op(scope, name, args)
    }

    pub fn constant(&mut self, scope: ScopeId, literal: Literal) -> NodeId {
        self.graph.create_constant(scope, literal)
    }

    pub fn rehome(&mut self, node: NodeId, target: ScopeId) -> Result<NodeId> {
        self.graph.rehome(node, target)
    }

    /// Annotate a node created through this builder. Annotations of older
    /// nodes are left untouched.
    pub fn typed(&mut self, node: NodeId, ty: Option<TensorType>) -> NodeId {
        if let Some(ty) = ty {
            if node.index() >= self.watermark {
                self.graph.set_type(node, ty);
            }
        }
        node
    }
}

impl Deref for Builder<'_> {
    type Target = Graph;

    fn deref(&self) -> &Graph {
        self.graph
    }
}
