use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;
use std::fmt;

// Hash keys in this module are NodeIds we allocate ourselves, so the DOS
// resistance of the std hasher buys nothing over faster hashing.
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ops::{DataType, Input, Operator};
use crate::tensor::Tensor;

/// ID of a node in a [`Graph`].
///
/// IDs are stable while nodes are only added. [`Graph::cleanup`] compacts
/// node storage and invalidates IDs obtained before the call.
pub type NodeId = usize;

/// Size of one dimension of a value, either known when the graph is built or
/// determined at runtime.
#[derive(Clone, PartialEq)]
pub enum Dimension {
    /// A dimension with a fixed size declared as part of the graph.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The symbol identifies
    /// values that share a size.
    Symbolic(String),
}

impl From<usize> for Dimension {
    fn from(size: usize) -> Dimension {
        Dimension::Fixed(size)
    }
}

impl From<&str> for Dimension {
    fn from(name: &str) -> Dimension {
        Dimension::Symbolic(name.to_string())
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(size) => write!(f, "{}", size),
            Dimension::Symbolic(name) => write!(f, "\"{}\"", name),
        }
    }
}

/// An operator node: a computation step applied to value or constant nodes.
pub struct OperatorNode {
    name: Option<String>,
    inputs: Vec<Option<NodeId>>,
    outputs: Vec<Option<NodeId>>,
    operator: Box<dyn Operator + Send + Sync>,
}

impl OperatorNode {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn input_ids(&self) -> &[Option<NodeId>] {
        &self.inputs
    }

    pub fn output_ids(&self) -> &[Option<NodeId>] {
        &self.outputs
    }

    pub fn operator(&self) -> &dyn Operator {
        self.operator.as_ref()
    }

    pub(crate) fn replace_input(&mut self, old_id: NodeId, new_id: NodeId) {
        for input_id in self.inputs.iter_mut() {
            if *input_id == Some(old_id) {
                *input_id = Some(new_id);
            }
        }
    }
}

/// A constant tensor node, such as a weight baked into the graph or a value
/// produced by constant folding.
pub struct ConstantNode<T> {
    name: Option<String>,
    data: Tensor<T>,
}

impl<T: Copy> ConstantNode<T> {
    pub fn data(&self) -> &Tensor<T> {
        &self.data
    }
}

pub enum Constant {
    Float(ConstantNode<f32>),
    Int(ConstantNode<i32>),
}

impl Constant {
    pub fn name(&self) -> Option<&str> {
        match self {
            Constant::Float(node) => node.name.as_deref(),
            Constant::Int(node) => node.name.as_deref(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Constant::Float(node) => node.data.shape(),
            Constant::Int(node) => node.data.shape(),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Constant::Float(_) => DataType::Float,
            Constant::Int(_) => DataType::Int32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Constant::Float(node) => node.data.len(),
            Constant::Int(node) => node.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the constant's data as an operator input.
    pub fn as_input(&self) -> Input<'_> {
        match self {
            Constant::Float(node) => Input::FloatTensor(&node.data),
            Constant::Int(node) => Input::IntTensor(&node.data),
        }
    }
}

impl From<ConstantNode<f32>> for Constant {
    fn from(node: ConstantNode<f32>) -> Constant {
        Constant::Float(node)
    }
}

impl From<ConstantNode<i32>> for Constant {
    fn from(node: ConstantNode<i32>) -> Constant {
        Constant::Int(node)
    }
}

/// A placeholder for a tensor that exists only when the graph runs, such as
/// a graph input or an operator output.
pub struct ValueNode {
    name: Option<String>,
    shape: Option<Vec<Dimension>>,
    dtype: Option<DataType>,
}

impl ValueNode {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn shape(&self) -> Option<&[Dimension]> {
        self.shape.as_deref()
    }
}

pub enum Node {
    Operator(OperatorNode),
    Constant(Constant),
    Value(ValueNode),
}

impl Node {
    /// Return the debug name of this node.
    pub fn name(&self) -> Option<&str> {
        match self {
            Node::Operator(node) => node.name(),
            Node::Constant(constant) => constant.name(),
            Node::Value(node) => node.name(),
        }
    }

    /// Return the tensor shape associated with this node.
    ///
    /// For constants this is the shape of the tensor. Operator nodes have no
    /// shape. For values this is the expected shape, if known.
    pub fn shape(&self) -> Option<Vec<Dimension>> {
        match self {
            Node::Operator(_) => None,
            Node::Constant(constant) => Some(
                constant
                    .shape()
                    .iter()
                    .copied()
                    .map(Dimension::Fixed)
                    .collect(),
            ),
            Node::Value(node) => node.shape.clone(),
        }
    }

    /// Return the element type associated with this node, if known.
    pub fn dtype(&self) -> Option<DataType> {
        match self {
            Node::Operator(_) => None,
            Node::Constant(constant) => Some(constant.dtype()),
            Node::Value(node) => node.dtype,
        }
    }

    pub fn as_operator(&self) -> Option<&OperatorNode> {
        match self {
            Node::Operator(op) => Some(op),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Node::Constant(constant) => Some(constant),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&ValueNode> {
        match self {
            Node::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// Errors from structural graph operations.
#[derive(Debug, PartialEq)]
pub enum GraphError {
    /// The graph's operators cannot be put into a valid execution order.
    CyclicGraph,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::CyclicGraph => write!(f, "graph contains a cycle"),
        }
    }
}

impl Error for GraphError {}

/// A computation graph of operator nodes connected through value and
/// constant nodes.
///
/// Execution and serialization order is always derived from the
/// producer/consumer relation (see [`Graph::execution_order`]), so the order
/// in which nodes are added does not matter. The graph must remain acyclic;
/// [`Graph::toposort`] checks this invariant after a mutation.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
    input_ids: Vec<NodeId>,
    output_ids: Vec<NodeId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Add an operator node.
    ///
    /// `inputs` and `outputs` reference the value or constant nodes the
    /// operator reads and writes. `None` entries are omitted optional inputs.
    ///
    /// Returns the ID of the operator node.
    pub fn add_op(
        &mut self,
        name: Option<&str>,
        op: Box<dyn Operator + Send + Sync>,
        inputs: &[Option<NodeId>],
        outputs: &[Option<NodeId>],
    ) -> NodeId {
        self.nodes.push(Node::Operator(OperatorNode {
            name: name.map(|s| s.to_owned()),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            operator: op,
        }));
        self.nodes.len() - 1
    }

    /// Add a constant node holding `value`.
    ///
    /// Returns the ID of the added node.
    pub fn add_constant<T>(&mut self, name: Option<&str>, value: Tensor<T>) -> NodeId
    where
        ConstantNode<T>: Into<Constant>,
    {
        let node = ConstantNode {
            name: name.map(|s| s.to_owned()),
            data: value,
        };
        self.nodes.push(Node::Constant(node.into()));
        self.nodes.len() - 1
    }

    /// Add a value node with optional shape and dtype metadata.
    ///
    /// Returns the ID of the added node.
    pub fn add_value(
        &mut self,
        name: Option<&str>,
        shape: Option<Vec<Dimension>>,
        dtype: Option<DataType>,
    ) -> NodeId {
        self.nodes.push(Node::Value(ValueNode {
            name: name.map(|s| s.to_owned()),
            shape,
            dtype,
        }));
        self.nodes.len() - 1
    }

    /// Retrieve a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Return the ID of the first node with a given name.
    pub fn get_node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|node| node.name() == Some(name))
    }

    /// Return the debug name for a node.
    pub fn node_name(&self, id: NodeId) -> String {
        self.get_node(id)
            .and_then(|node| node.name())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    /// Iterate over nodes and their IDs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Return the total number of nodes of all kinds.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Return the number of operator nodes.
    ///
    /// This is the count the refinement fixpoint test observes; value and
    /// constant nodes are bookkeeping, not computation steps.
    pub fn operator_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, Node::Operator(_)))
            .count()
    }

    /// Return the total number of elements in all constant nodes.
    pub fn total_params(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match node {
                Node::Constant(constant) => constant.len(),
                _ => 0,
            })
            .sum()
    }

    /// IDs of the graph's declared input values.
    pub fn input_ids(&self) -> &[NodeId] {
        &self.input_ids
    }

    pub fn set_input_ids(&mut self, ids: &[NodeId]) {
        self.input_ids = ids.to_vec();
    }

    /// IDs of the graph's declared output values.
    pub fn output_ids(&self) -> &[NodeId] {
        &self.output_ids
    }

    pub fn set_output_ids(&mut self, ids: &[NodeId]) {
        self.output_ids = ids.to_vec();
    }

    /// Map of value/constant node ID to the ID of the operator producing it.
    fn producers(&self) -> FxHashMap<NodeId, NodeId> {
        let mut producers = FxHashMap::default();
        for (op_id, node) in self.iter() {
            if let Node::Operator(op_node) = node {
                for output_id in op_node.outputs.iter().flatten() {
                    producers.insert(*output_id, op_id);
                }
            }
        }
        producers
    }

    /// Compute a topological execution order of the operator nodes.
    ///
    /// Ties are broken by node ID, so the order is deterministic. Fails if
    /// the operators form a cycle.
    pub fn execution_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let producers = self.producers();

        let mut pending: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut consumers: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        let mut op_count = 0;

        for (op_id, node) in self.iter() {
            let Node::Operator(op_node) = node else {
                continue;
            };
            op_count += 1;

            let deps: FxHashSet<NodeId> = op_node
                .inputs
                .iter()
                .flatten()
                .filter_map(|input_id| producers.get(input_id).copied())
                .collect();
            pending.insert(op_id, deps.len());
            for dep in deps {
                consumers.entry(dep).or_default().push(op_id);
            }
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(op_id, _)| Reverse(*op_id))
            .collect();

        let mut order = Vec::with_capacity(op_count);
        while let Some(Reverse(op_id)) = ready.pop() {
            order.push(op_id);
            for consumer in consumers.get(&op_id).map(|c| c.as_slice()).unwrap_or(&[]) {
                let count = pending
                    .get_mut(consumer)
                    .expect("consumer should be a known operator");
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse(*consumer));
                }
            }
        }

        if order.len() == op_count {
            Ok(order)
        } else {
            Err(GraphError::CyclicGraph)
        }
    }

    /// Check that the graph's operators admit a topological order.
    ///
    /// Stitching and folding rely on this invariant; call after mutations
    /// that rewire connectivity.
    pub fn toposort(&self) -> Result<(), GraphError> {
        self.execution_order().map(|_| ())
    }

    /// Remove nodes that do not contribute to the declared outputs.
    ///
    /// Declared inputs are always retained. Returns the number of nodes
    /// removed. Storage is compacted, so NodeIds obtained before the call
    /// are invalidated.
    pub fn cleanup(&mut self) -> usize {
        let producers = self.producers();

        let mut retained = FxHashSet::default();
        let mut stack: Vec<NodeId> = Vec::new();
        stack.extend(self.output_ids.iter().copied());
        stack.extend(self.input_ids.iter().copied());

        while let Some(id) = stack.pop() {
            if id >= self.nodes.len() || !retained.insert(id) {
                continue;
            }
            match &self.nodes[id] {
                Node::Operator(op_node) => {
                    stack.extend(op_node.inputs.iter().flatten());
                    stack.extend(op_node.outputs.iter().flatten());
                }
                _ => {
                    if let Some(producer_id) = producers.get(&id) {
                        stack.push(*producer_id);
                    }
                }
            }
        }

        self.retain_nodes(&retained)
    }

    /// Remove specific nodes from the graph.
    ///
    /// Like [`Graph::cleanup`], this compacts node storage and invalidates
    /// previously-obtained NodeIds.
    pub fn remove_nodes(&mut self, ids: &[NodeId]) {
        let removed: FxHashSet<NodeId> = ids.iter().copied().collect();
        let retained: FxHashSet<NodeId> = (0..self.nodes.len())
            .filter(|id| !removed.contains(id))
            .collect();
        self.retain_nodes(&retained);
    }

    /// Drop all nodes not in `retained`, compacting storage and remapping
    /// IDs. Returns the number of nodes removed.
    fn retain_nodes(&mut self, retained: &FxHashSet<NodeId>) -> usize {
        let removed = self.nodes.len() - retained.len();
        if removed == 0 {
            return 0;
        }

        let mut remap: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        let mut new_nodes = Vec::with_capacity(retained.len());
        for (id, node) in self.nodes.drain(..).enumerate() {
            if retained.contains(&id) {
                remap.insert(id, new_nodes.len());
                new_nodes.push(node);
            }
        }

        let remap_slot =
            |slot: &mut Option<NodeId>| *slot = slot.and_then(|id| remap.get(&id).copied());
        for node in new_nodes.iter_mut() {
            if let Node::Operator(op_node) = node {
                op_node.inputs.iter_mut().for_each(remap_slot);
                op_node.outputs.iter_mut().for_each(remap_slot);
            }
        }

        let remap_ids = |ids: &mut Vec<NodeId>| {
            ids.retain(|id| remap.contains_key(id));
            for id in ids.iter_mut() {
                *id = remap[id];
            }
        };
        remap_ids(&mut self.input_ids);
        remap_ids(&mut self.output_ids);

        self.nodes = new_nodes;
        removed
    }

    /// Replace `old_id` with `new_id` in operator inputs and declared
    /// outputs.
    ///
    /// Used by constant folding to point consumers of a computed value at
    /// its folded constant.
    pub fn replace_value(&mut self, old_id: NodeId, new_id: NodeId) {
        for node in self.nodes.iter_mut() {
            if let Node::Operator(op_node) = node {
                op_node.replace_input(old_id, new_id);
            }
        }
        for output_id in self.output_ids.iter_mut() {
            if *output_id == old_id {
                *output_id = new_id;
            }
        }
    }

    /// Move all nodes of `other` into this graph, returning the offset that
    /// was added to `other`'s node IDs.
    pub(crate) fn absorb(&mut self, other: Graph) -> usize {
        let offset = self.nodes.len();
        for mut node in other.nodes {
            if let Node::Operator(op_node) = &mut node {
                for slot in op_node
                    .inputs
                    .iter_mut()
                    .chain(op_node.outputs.iter_mut())
                {
                    *slot = slot.map(|id| id + offset);
                }
            }
            self.nodes.push(node);
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::{Dimension, Graph, GraphError, Node};
    use crate::ops::{Add, DataType, Identity};
    use crate::tensor::Tensor;

    #[test]
    fn test_graph_node_debug_names() {
        let mut g = Graph::new();
        let weights_id = g.add_constant(Some("weights"), Tensor::from_vec(vec![0.5f32]));
        let input_id = g.add_value(Some("input"), None, None);
        let out_id = g.add_value(None, None, None);
        let op_id = g.add_op(
            Some("id"),
            Box::new(Identity {}),
            &[Some(input_id)],
            &[Some(out_id)],
        );

        assert_eq!(g.node_name(weights_id), "weights");
        assert_eq!(g.node_name(input_id), "input");
        assert_eq!(g.node_name(op_id), "id");
        assert_eq!(g.node_name(out_id), format!("[ID: {}]", out_id));
        assert_eq!(g.get_node_id("weights"), Some(weights_id));
        assert_eq!(g.get_node_id("nope"), None);
    }

    #[test]
    fn test_node_shapes() {
        let mut g = Graph::new();
        let const_id = g.add_constant(Some("c"), Tensor::from_data(&[1, 2], vec![1.0f32, 2.0]));
        let val_id = g.add_value(
            Some("v"),
            Some(vec![Dimension::Symbolic("batch".to_string()), 3.into()]),
            Some(DataType::Float),
        );

        assert_eq!(
            g.get_node(const_id).and_then(|n| n.shape()),
            Some(vec![Dimension::Fixed(1), Dimension::Fixed(2)])
        );
        assert_eq!(
            g.get_node(val_id).and_then(|n| n.shape()),
            Some(vec![
                Dimension::Symbolic("batch".to_string()),
                Dimension::Fixed(3)
            ])
        );
        assert_eq!(g.get_node(val_id).and_then(|n| n.dtype()), Some(DataType::Float));
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let mut g = Graph::new();
        let input_id = g.add_value(Some("input"), None, None);
        let mid_id = g.add_value(Some("mid"), None, None);
        let out_id = g.add_value(Some("out"), None, None);

        // Add the downstream operator first so insertion order and execution
        // order differ.
        let second = g.add_op(
            Some("second"),
            Box::new(Identity {}),
            &[Some(mid_id)],
            &[Some(out_id)],
        );
        let first = g.add_op(
            Some("first"),
            Box::new(Identity {}),
            &[Some(input_id)],
            &[Some(mid_id)],
        );
        g.set_input_ids(&[input_id]);
        g.set_output_ids(&[out_id]);

        assert_eq!(g.execution_order().unwrap(), vec![first, second]);
        assert!(g.toposort().is_ok());
    }

    #[test]
    fn test_toposort_detects_cycle() {
        let mut g = Graph::new();
        let a = g.add_value(Some("a"), None, None);
        let b = g.add_value(Some("b"), None, None);
        g.add_op(Some("fwd"), Box::new(Identity {}), &[Some(a)], &[Some(b)]);
        g.add_op(Some("back"), Box::new(Identity {}), &[Some(b)], &[Some(a)]);

        assert_eq!(g.toposort(), Err(GraphError::CyclicGraph));
    }

    #[test]
    fn test_cleanup_removes_disconnected_nodes() {
        let mut g = Graph::new();
        let input_id = g.add_value(Some("input"), None, None);
        let out_id = g.add_value(Some("out"), None, None);
        g.add_op(
            Some("keep"),
            Box::new(Identity {}),
            &[Some(input_id)],
            &[Some(out_id)],
        );

        // Dead subgraph: not on any path to the declared outputs.
        let dead_in = g.add_constant(Some("dead_in"), Tensor::from_vec(vec![1.0f32]));
        let dead_out = g.add_value(Some("dead_out"), None, None);
        g.add_op(
            Some("dead"),
            Box::new(Identity {}),
            &[Some(dead_in)],
            &[Some(dead_out)],
        );

        g.set_input_ids(&[input_id]);
        g.set_output_ids(&[out_id]);

        let removed = g.cleanup();
        assert_eq!(removed, 3);
        assert_eq!(g.operator_count(), 1);
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.get_node_id("dead"), None);

        // Remapped IDs stay consistent.
        let keep_id = g.get_node_id("keep").unwrap();
        let op = g.get_node(keep_id).and_then(Node::as_operator).unwrap();
        assert_eq!(op.input_ids(), &[g.get_node_id("input")]);
        assert_eq!(op.output_ids(), &[g.get_node_id("out")]);
        assert_eq!(g.output_ids(), &[g.get_node_id("out").unwrap()]);

        // A second cleanup is a no-op.
        assert_eq!(g.cleanup(), 0);
    }

    #[test]
    fn test_cleanup_retains_declared_inputs() {
        let mut g = Graph::new();
        let used = g.add_value(Some("used"), None, None);
        let unused = g.add_value(Some("unused"), None, None);
        let out = g.add_value(Some("out"), None, None);
        g.add_op(Some("op"), Box::new(Identity {}), &[Some(used)], &[Some(out)]);
        g.set_input_ids(&[used, unused]);
        g.set_output_ids(&[out]);

        g.cleanup();
        assert!(g.get_node_id("unused").is_some());
        assert_eq!(g.input_ids().len(), 2);
    }

    #[test]
    fn test_replace_value() {
        let mut g = Graph::new();
        let a = g.add_value(Some("a"), None, None);
        let b = g.add_value(Some("b"), None, None);
        let sum = g.add_value(Some("sum"), None, None);
        let op = g.add_op(
            Some("add"),
            Box::new(Add {}),
            &[Some(a), Some(b)],
            &[Some(sum)],
        );
        g.set_output_ids(&[sum]);

        let c = g.add_constant(Some("c"), Tensor::from_vec(vec![1.0f32]));
        g.replace_value(sum, c);
        g.replace_value(a, c);

        let op_node = g.get_node(op).and_then(Node::as_operator).unwrap();
        assert_eq!(op_node.input_ids(), &[Some(c), Some(b)]);
        assert_eq!(g.output_ids(), &[c]);
    }
}
