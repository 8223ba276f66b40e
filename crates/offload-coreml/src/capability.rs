//! Capability evaluation: partitions a host graph into convertible
//! subgraphs and rejected nodes.
//!
//! One pass in topological order decides acceptance per node. A node whose
//! non-constant input comes from a rejected node is rejected as well, so
//! every group is closed under its own data flow. Accepted nodes are then
//! grouped along producer-to-consumer edges; groups are ordered by their
//! first node. The result depends only on the graph and the registry.

use std::collections::{HashMap, HashSet};
use std::fmt;

use offload_graph::{GraphError, HostGraph, NodeId, ValueId};

use crate::registry::OpRegistry;

/// Why a node stays on the fallback path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// No lowering unit is registered for the operator kind.
    UnsupportedOperator,
    /// A unit exists but rejects this opset, attribute or type combination.
    UnsupportedVariant(String),
    /// An input has no resolvable element type.
    UnresolvedType { value: String },
    /// An input is produced by a rejected node.
    DependsOnRejected { value: String },
    /// The node's group is smaller than the configured minimum.
    BelowMinimumSize { subgraph_nodes: usize },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOperator => f.write_str("unsupported operator"),
            Self::UnsupportedVariant(reason) => write!(f, "unsupported variant: {reason}"),
            Self::UnresolvedType { value } => write!(f, "unresolved type for '{value}'"),
            Self::DependsOnRejected { value } => {
                write!(f, "input '{value}' is produced by a rejected node")
            }
            Self::BelowMinimumSize { subgraph_nodes } => {
                write!(f, "subgraph of {subgraph_nodes} node(s) is below the minimum size")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedNode {
    pub node: NodeId,
    pub name: String,
    pub op_type: String,
    pub reason: Rejection,
}

impl fmt::Display for RejectedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.op_type, self.name, self.reason)
    }
}

/// A maximal connected group of convertible nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvertibleSubgraph {
    /// Position in [`Partition::subgraphs`].
    pub index: usize,
    /// Member nodes in topological order.
    pub nodes: Vec<NodeId>,
    /// Non-initializer values entering from outside, in first-use order.
    pub inputs: Vec<ValueId>,
    /// Initializers consumed by members, in first-use order.
    pub initializers: Vec<ValueId>,
    /// Values produced here and needed outside, in production order.
    pub outputs: Vec<ValueId>,
}

impl ConvertibleSubgraph {
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Result of one evaluation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub subgraphs: Vec<ConvertibleSubgraph>,
    /// Rejected nodes in topological order.
    pub rejected: Vec<RejectedNode>,
}

impl Partition {
    /// Index of the subgraph holding `node`.
    pub fn subgraph_of(&self, node: NodeId) -> Option<usize> {
        self.subgraphs.iter().position(|s| s.contains(node))
    }

    pub fn rejection(&self, node: NodeId) -> Option<&Rejection> {
        self.rejected
            .iter()
            .find(|r| r.node == node)
            .map(|r| &r.reason)
    }

    pub fn offloaded_node_count(&self) -> usize {
        self.subgraphs.iter().map(ConvertibleSubgraph::len).sum()
    }

    /// Rejection counts per operator kind: registered kinds in registration
    /// order, then unregistered kinds in first-seen order.
    pub fn rejected_summary(&self, registry: &OpRegistry) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut unknown: Vec<&str> = Vec::new();
        for r in &self.rejected {
            let op = r.op_type.as_str();
            *counts.entry(op).or_default() += 1;
            if registry.lookup(op).is_none() && !unknown.contains(&op) {
                unknown.push(op);
            }
        }
        let mut summary: Vec<(String, usize)> = registry
            .op_types()
            .filter_map(|op| counts.get(op).map(|&n| (op.to_string(), n)))
            .collect();
        summary.extend(unknown.into_iter().map(|op| (op.to_string(), counts[op])));
        summary
    }
}

/// Disjoint sets over topological positions.
struct Groups {
    parent: Vec<usize>,
}

impl Groups {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// The smaller position becomes the root.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Partitions `graph` using `registry`.
///
/// Groups with fewer than `min_subgraph_nodes` nodes are rejected with
/// [`Rejection::BelowMinimumSize`]. Fails only when the graph has a cycle.
pub fn evaluate(
    graph: &HostGraph,
    registry: &OpRegistry,
    min_subgraph_nodes: usize,
) -> Result<Partition, GraphError> {
    let order = graph.topological_order()?;
    let position: HashMap<NodeId, usize> =
        order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut accepted = vec![false; order.len()];
    let mut rejected: Vec<(usize, RejectedNode)> = Vec::new();

    for (pos, &id) in order.iter().enumerate() {
        let node = graph.node(id);
        let verdict = match registry.lookup_node(graph, id) {
            None => Err(Rejection::UnsupportedOperator),
            Some(unit) => unit
                .check_support(graph, id)
                .and_then(|()| check_inputs(graph, id, &position, &accepted)),
        };
        match verdict {
            Ok(()) => {
                log::debug!("accept {node}");
                accepted[pos] = true;
            }
            Err(reason) => {
                log::debug!("reject {node}: {reason}");
                rejected.push((pos, rejected_node(graph, id, reason)));
            }
        }
    }

    let mut groups = Groups::new(order.len());
    for (pos, &id) in order.iter().enumerate() {
        if !accepted[pos] {
            continue;
        }
        for value in graph.node(id).inputs.iter().flatten() {
            if let Some(p) = graph.producer(*value).map(|p| position[&p]) {
                if accepted[p] {
                    groups.union(p, pos);
                }
            }
        }
    }

    let mut members: Vec<Vec<NodeId>> = Vec::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
    for (pos, &id) in order.iter().enumerate() {
        if !accepted[pos] {
            continue;
        }
        let root = groups.find(pos);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            members.push(Vec::new());
            members.len() - 1
        });
        members[slot].push(id);
    }

    let mut subgraphs = Vec::new();
    for nodes in members {
        if nodes.len() < min_subgraph_nodes {
            let size = nodes.len();
            for id in nodes {
                log::debug!("reject {}: group of {size} below minimum", graph.node(id));
                rejected.push((
                    position[&id],
                    rejected_node(
                        graph,
                        id,
                        Rejection::BelowMinimumSize {
                            subgraph_nodes: size,
                        },
                    ),
                ));
            }
            continue;
        }
        subgraphs.push(describe(graph, subgraphs.len(), nodes));
    }
    rejected.sort_by_key(|(pos, _)| *pos);

    let partition = Partition {
        subgraphs,
        rejected: rejected.into_iter().map(|(_, r)| r).collect(),
    };
    log::info!(
        "{} of {} node(s) offloaded in {} subgraph(s), {} rejected",
        partition.offloaded_node_count(),
        order.len(),
        partition.subgraphs.len(),
        partition.rejected.len()
    );
    Ok(partition)
}

/// Every non-constant input must come from an accepted node or from the
/// graph's inputs.
fn check_inputs(
    graph: &HostGraph,
    id: NodeId,
    position: &HashMap<NodeId, usize>,
    accepted: &[bool],
) -> Result<(), Rejection> {
    for &value in graph.node(id).inputs.iter().flatten() {
        if graph.is_initializer(value) {
            continue;
        }
        match graph.producer(value) {
            Some(p) if !accepted[position[&p]] => {
                return Err(Rejection::DependsOnRejected {
                    value: graph.value_name(value).to_string(),
                });
            }
            Some(_) => {}
            None if graph.is_graph_input(value) => {}
            None => {
                return Err(Rejection::UnsupportedVariant(format!(
                    "input '{}' is neither produced nor a graph input",
                    graph.value_name(value)
                )));
            }
        }
    }
    Ok(())
}

fn rejected_node(graph: &HostGraph, id: NodeId, reason: Rejection) -> RejectedNode {
    let node = graph.node(id);
    RejectedNode {
        node: id,
        name: node.name.clone(),
        op_type: node.op_type.clone(),
        reason,
    }
}

fn describe(graph: &HostGraph, index: usize, nodes: Vec<NodeId>) -> ConvertibleSubgraph {
    let set: HashSet<NodeId> = nodes.iter().copied().collect();
    let mut inputs = Vec::new();
    let mut initializers = Vec::new();
    let mut outputs = Vec::new();

    for &id in &nodes {
        let node = graph.node(id);
        for &value in node.inputs.iter().flatten() {
            let internal = graph.producer(value).is_some_and(|p| set.contains(&p));
            if graph.is_initializer(value) {
                if !initializers.contains(&value) {
                    initializers.push(value);
                }
            } else if !internal && !inputs.contains(&value) {
                inputs.push(value);
            }
        }
        for &value in &node.outputs {
            let escapes = graph
                .consumers(value)
                .iter()
                .any(|c| !set.contains(c));
            if escapes || graph.is_graph_output(value) {
                outputs.push(value);
            }
        }
    }

    ConvertibleSubgraph {
        index,
        nodes,
        inputs,
        initializers,
        outputs,
    }
}
