//! The host computation graph.
//!
//! A DAG whose nodes are operators and whose edges are named values.
//! Constant values carry an [`Initializer`] payload. The graph is built once
//! (programmatically or by [`crate::onnx::import`]) and then only read.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::arena::Arena;
use crate::error::GraphError;
use crate::node::{Node, NodeId, ValueId};
use crate::types::{element_count, DataType, TensorType};

/// A named tensor edge.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    pub name: String,
    /// Declared type; `None` when the producer left it to run-time inference.
    pub ty: Option<TensorType>,
}

/// A constant tensor: element type, dims and row-major little-endian bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Initializer {
    pub data_type: DataType,
    pub dims: Vec<i64>,
    pub raw: Vec<u8>,
}

impl Initializer {
    /// Checks that `raw` holds exactly `product(dims)` elements of `data_type`.
    pub fn new(data_type: DataType, dims: Vec<i64>, raw: Vec<u8>) -> Result<Self, String> {
        let width = data_type
            .size_in_bytes()
            .ok_or_else(|| format!("element type {data_type} has no fixed width"))?;
        let count = element_count(&dims).ok_or_else(|| format!("invalid dims {dims:?}"))?;
        let expected = count
            .checked_mul(width)
            .ok_or_else(|| format!("dims {dims:?} overflow"))?;
        if raw.len() != expected {
            return Err(format!(
                "expected {expected} bytes for {data_type} {dims:?}, found {}",
                raw.len()
            ));
        }
        Ok(Self {
            data_type,
            dims,
            raw,
        })
    }

    pub fn from_f32(dims: &[i64], values: &[f32]) -> Self {
        Self::from_le(DataType::Float, dims, values.iter().flat_map(|v| v.to_le_bytes()))
    }

    pub fn from_i32(dims: &[i64], values: &[i32]) -> Self {
        Self::from_le(DataType::Int32, dims, values.iter().flat_map(|v| v.to_le_bytes()))
    }

    pub fn from_i64(dims: &[i64], values: &[i64]) -> Self {
        Self::from_le(DataType::Int64, dims, values.iter().flat_map(|v| v.to_le_bytes()))
    }

    fn from_le(data_type: DataType, dims: &[i64], bytes: impl Iterator<Item = u8>) -> Self {
        Self {
            data_type,
            dims: dims.to_vec(),
            raw: bytes.collect(),
        }
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.dims).unwrap_or(0)
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::new(self.data_type, &self.dims)
    }

    /// Elements as `i64`, for integer tensors used as operator parameters.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self.data_type {
            DataType::Int64 => Some(
                self.raw
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DataType::Int32 => Some(
                self.raw
                    .chunks_exact(4)
                    .map(|c| i64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Arena-backed host graph.
#[derive(Clone, Debug, Default)]
pub struct HostGraph {
    values: Arena<Value>,
    nodes: Arena<Node>,
    names: HashMap<String, ValueId>,
    initializers: HashMap<ValueId, Initializer>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    producers: HashMap<ValueId, NodeId>,
    consumers: HashMap<ValueId, Vec<NodeId>>,
    opset_imports: BTreeMap<String, i64>,
}

fn canonical_domain(domain: &str) -> &str {
    if domain == "ai.onnx" {
        ""
    } else {
        domain
    }
}

impl HostGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- construction ----

    /// Declares the operator-set version for `domain` (`""` is the default domain).
    pub fn set_opset(&mut self, domain: &str, version: i64) {
        self.opset_imports
            .insert(canonical_domain(domain).to_string(), version);
    }

    /// Declares a value. Names are unique across the graph.
    pub fn add_value(
        &mut self,
        name: impl Into<String>,
        ty: Option<TensorType>,
    ) -> Result<ValueId, GraphError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(GraphError::DuplicateValue(name));
        }
        let id = self.values.append(Value {
            name: name.clone(),
            ty,
        });
        self.names.insert(name, id);
        Ok(id)
    }

    /// Declares a graph-level input fed at inference time.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        ty: Option<TensorType>,
    ) -> Result<ValueId, GraphError> {
        let id = self.add_value(name, ty)?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Declares a constant value; its type comes from the payload.
    pub fn add_initializer(
        &mut self,
        name: impl Into<String>,
        tensor: Initializer,
    ) -> Result<ValueId, GraphError> {
        let id = self.add_value(name, Some(tensor.tensor_type()))?;
        self.initializers.insert(id, tensor);
        Ok(id)
    }

    /// Marks an existing value as a graph-level output.
    pub fn add_output(&mut self, value: ValueId) -> Result<(), GraphError> {
        if self.values.get(value).is_none() {
            return Err(GraphError::UnknownValue(format!("#{value}")));
        }
        if !self.outputs.contains(&value) {
            self.outputs.push(value);
        }
        Ok(())
    }

    /// Appends a node.
    ///
    /// Every referenced value must already be declared, and each output may
    /// have only one producer. Initializers and graph inputs cannot be produced.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId, GraphError> {
        for &v in node.inputs.iter().flatten().chain(node.outputs.iter()) {
            if self.values.get(v).is_none() {
                return Err(GraphError::UnknownValue(format!("#{v} (used by {node})")));
            }
        }
        for &out in &node.outputs {
            if self.producers.contains_key(&out)
                || self.initializers.contains_key(&out)
                || self.inputs.contains(&out)
            {
                return Err(GraphError::InvalidModel(format!(
                    "value '{}' already has a producer (redefined by {node})",
                    self.values[out].name
                )));
            }
        }

        let id = self.nodes.next_handle();
        for &out in &node.outputs {
            self.producers.insert(out, id);
        }
        for &inp in node.inputs.iter().flatten() {
            let list = self.consumers.entry(inp).or_default();
            if !list.contains(&id) {
                list.push(id);
            }
        }
        Ok(self.nodes.append(node))
    }

    // ---- queries ----

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id].name
    }

    pub fn value_by_name(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn initializer(&self, id: ValueId) -> Option<&Initializer> {
        self.initializers.get(&id)
    }

    pub fn is_initializer(&self, id: ValueId) -> bool {
        self.initializers.contains_key(&id)
    }

    pub fn is_graph_input(&self, id: ValueId) -> bool {
        self.inputs.contains(&id)
    }

    pub fn is_graph_output(&self, id: ValueId) -> bool {
        self.outputs.contains(&id)
    }

    pub fn producer(&self, id: ValueId) -> Option<NodeId> {
        self.producers.get(&id).copied()
    }

    pub fn consumers(&self, id: ValueId) -> &[NodeId] {
        self.consumers.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Operator-set version imported for `domain`, if any.
    pub fn opset(&self, domain: &str) -> Option<i64> {
        self.opset_imports.get(canonical_domain(domain)).copied()
    }

    pub fn opset_imports(&self) -> &BTreeMap<String, i64> {
        &self.opset_imports
    }

    /// Nodes in topological order.
    ///
    /// Kahn's algorithm; among ready nodes the smallest [`NodeId`] goes
    /// first, so a graph already in topological order keeps its order.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let total = self.nodes.len();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::with_capacity(total);
        for (id, node) in self.nodes.iter() {
            let deg = node
                .inputs
                .iter()
                .flatten()
                .filter(|v| self.producers.contains_key(v))
                .count();
            in_degree.insert(id, deg);
        }

        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(total);

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &out in &self.nodes[id].outputs {
                for &consumer in self.consumers(out) {
                    // One decrement per input slot holding `out`.
                    let uses = self.nodes[consumer]
                        .inputs
                        .iter()
                        .filter(|v| **v == Some(out))
                        .count();
                    if let Some(d) = in_degree.get_mut(&consumer) {
                        *d -= uses;
                        if *d == 0 {
                            ready.insert(consumer);
                        }
                    }
                }
            }
        }

        if order.len() != total {
            return Err(GraphError::Cycle {
                visited: order.len(),
                total,
            });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Attribute;

    fn f32_value(dims: &[i64]) -> Option<TensorType> {
        Some(TensorType::new(DataType::Float, dims))
    }

    fn node(op: &str, name: &str, inputs: &[ValueId], outputs: &[ValueId]) -> Node {
        let mut n = Node::new(op, name);
        n.inputs = inputs.iter().copied().map(Some).collect();
        n.outputs = outputs.to_vec();
        n
    }

    #[test]
    fn build_add_mul_chain() {
        let mut g = HostGraph::new();
        g.set_opset("", 13);
        let a = g.add_input("a", f32_value(&[2, 3])).unwrap();
        let b = g.add_input("b", f32_value(&[2, 3])).unwrap();
        let s = g.add_value("sum", None).unwrap();
        let p = g.add_value("prod", f32_value(&[2, 3])).unwrap();
        let add = g.add_node(node("Add", "add", &[a, b], &[s])).unwrap();
        let mul = g.add_node(node("Mul", "mul", &[s, b], &[p])).unwrap();
        g.add_output(p).unwrap();

        assert_eq!(g.node_count(), 2);
        assert_eq!(g.value_count(), 4);
        assert_eq!(g.producer(s), Some(add));
        assert_eq!(g.consumers(b), &[add, mul]);
        assert_eq!(g.producer(a), None);
        assert!(g.is_graph_input(a));
        assert!(g.is_graph_output(p));
        assert_eq!(g.value_by_name("sum"), Some(s));
        assert_eq!(g.opset("ai.onnx"), Some(13));
        assert_eq!(g.topological_order().unwrap(), vec![add, mul]);
    }

    #[test]
    fn duplicate_value_names_are_rejected() {
        let mut g = HostGraph::new();
        g.add_input("x", None).unwrap();
        let err = g.add_value("x", None).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateValue(ref n) if n == "x"));
    }

    #[test]
    fn second_producer_is_rejected() {
        let mut g = HostGraph::new();
        let a = g.add_input("a", None).unwrap();
        let b = g.add_value("b", None).unwrap();
        g.add_node(node("Relu", "r0", &[a], &[b])).unwrap();
        let err = g.add_node(node("Relu", "r1", &[a], &[b])).unwrap_err();
        assert!(err.to_string().contains("already has a producer"));
    }

    #[test]
    fn initializer_cannot_be_produced() {
        let mut g = HostGraph::new();
        let a = g.add_input("a", None).unwrap();
        let w = g
            .add_initializer("w", Initializer::from_f32(&[1], &[1.0]))
            .unwrap();
        assert!(g.add_node(node("Relu", "r", &[a], &[w])).is_err());
        assert_eq!(g.value(w).ty, f32_value(&[1]));
    }

    #[test]
    fn topological_order_reorders_out_of_order_nodes() {
        let mut g = HostGraph::new();
        let x = g.add_input("x", None).unwrap();
        let y = g.add_value("y", None).unwrap();
        let z = g.add_value("z", None).unwrap();
        // Consumer inserted before producer.
        let second = g.add_node(node("Relu", "second", &[y], &[z])).unwrap();
        let first = g.add_node(node("Relu", "first", &[x], &[y])).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec![first, second]);
    }

    #[test]
    fn topological_order_diamond_is_deterministic() {
        let mut g = HostGraph::new();
        let x = g.add_input("x", None).unwrap();
        let l = g.add_value("l", None).unwrap();
        let r = g.add_value("r", None).unwrap();
        let o = g.add_value("o", None).unwrap();
        let n_l = g.add_node(node("Relu", "l", &[x], &[l])).unwrap();
        let n_r = g.add_node(node("Sigmoid", "r", &[x], &[r])).unwrap();
        let n_o = g.add_node(node("Add", "o", &[l, r], &[o])).unwrap();
        for _ in 0..3 {
            assert_eq!(g.topological_order().unwrap(), vec![n_l, n_r, n_o]);
        }
    }

    #[test]
    fn same_value_twice_counts_both_slots() {
        let mut g = HostGraph::new();
        let x = g.add_input("x", None).unwrap();
        let y = g.add_value("y", None).unwrap();
        let z = g.add_value("z", None).unwrap();
        let r = g.add_node(node("Relu", "r", &[x], &[y])).unwrap();
        let m = g.add_node(node("Mul", "sq", &[y, y], &[z])).unwrap();
        assert_eq!(g.topological_order().unwrap(), vec![r, m]);
    }

    #[test]
    fn initializer_validation_and_int_view() {
        assert!(Initializer::new(DataType::Float, vec![2], vec![0; 8]).is_ok());
        assert!(Initializer::new(DataType::Float, vec![2], vec![0; 7]).is_err());
        assert!(Initializer::new(DataType::String, vec![1], vec![]).is_err());

        let shape = Initializer::from_i64(&[3], &[1, -1, 4]);
        assert_eq!(shape.to_i64_vec(), Some(vec![1, -1, 4]));
        assert_eq!(Initializer::from_i32(&[2], &[7, -2]).to_i64_vec(), Some(vec![7, -2]));
        assert_eq!(Initializer::from_f32(&[1], &[1.0]).to_i64_vec(), None);
        assert_eq!(shape.element_count(), 3);
    }

    #[test]
    fn attribute_tensor_holds_initializer() {
        let t = Initializer::from_f32(&[], &[2.5]);
        let attr = Attribute::Tensor(t.clone());
        assert_eq!(attr.kind(), "tensor");
        assert_eq!(t.element_count(), 1);
    }
}
