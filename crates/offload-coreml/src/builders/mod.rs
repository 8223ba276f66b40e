//! Per-operator lowering units.
//!
//! A [`LoweringUnit`] is a plain descriptor: operator kind, minimum opset,
//! arity, supported element types, the input positions it consumes as
//! constants, a structural predicate and a conversion function. The
//! [`crate::registry::OpRegistry`] holds them in registration order.

mod activation;
mod binary;
mod concat;
mod conv;
mod gemm;
mod pool;
mod reshape;
mod softmax;
mod transpose;

use std::collections::HashSet;
use std::fmt;

use offload_graph::{DataType, Dim, HostGraph, Initializer, Node, NodeId};

use crate::error::LoweringError;
use crate::helper;
use crate::options::PrecisionPolicy;
use crate::proto::{neural_network_layer::Layer, NeuralNetworkLayer, WeightParams};
use crate::type_control::TypeSet;
use crate::weights;

/// Float element types accepted by most units.
pub const FLOAT_TYPES: TypeSet = TypeSet::from_types(&[DataType::Float, DataType::Float16]);

/// Highest rank the rank-N layers (`softmaxND`, `transpose`,
/// `reshapeStatic`) accept.
pub(crate) const MAX_ND_RANK: usize = 5;

/// Structural predicate: `Err` carries the human-readable reason.
pub type CheckFn = fn(&NodeContext<'_>) -> Result<(), String>;

/// Conversion into a private layer batch.
pub type LowerFn = fn(&NodeContext<'_>, &mut LayerBatch<'_>) -> Result<(), LoweringError>;

/// Descriptor of one operator kind's lowering.
#[derive(Clone, Copy)]
pub struct LoweringUnit {
    pub op_type: &'static str,
    pub min_opset: i64,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub min_outputs: usize,
    pub max_outputs: usize,
    /// Element types accepted for tensor inputs before configured narrowing.
    pub supported_types: TypeSet,
    /// Input positions read directly as constants instead of as tensor inputs.
    pub initializer_inputs: &'static [usize],
    pub check: CheckFn,
    pub lower: LowerFn,
}

impl LoweringUnit {
    /// Whether input slot `index` is consumed as a constant.
    pub fn consumes_in_place(&self, index: usize) -> bool {
        self.initializer_inputs.contains(&index)
    }
}

impl fmt::Debug for LoweringUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoweringUnit")
            .field("op_type", &self.op_type)
            .field("min_opset", &self.min_opset)
            .field("inputs", &(self.min_inputs..=self.max_inputs))
            .field("outputs", &(self.min_outputs..=self.max_outputs))
            .field("supported_types", &self.supported_types)
            .field("initializer_inputs", &self.initializer_inputs)
            .finish()
    }
}

/// All built-in units, in registration order.
pub fn builtin_units() -> Vec<LoweringUnit> {
    [
        binary::UNITS,
        activation::UNITS,
        gemm::UNITS,
        conv::UNITS,
        pool::UNITS,
        softmax::UNITS,
        transpose::UNITS,
        reshape::UNITS,
        concat::UNITS,
    ]
    .concat()
}

/// Read-only view of one node during support checks and conversion.
pub struct NodeContext<'a> {
    pub graph: &'a HostGraph,
    pub id: NodeId,
    pub node: &'a Node,
    /// Opset of the node's domain; 0 when the graph imports none.
    pub opset: i64,
    pub precision: PrecisionPolicy,
}

impl<'a> NodeContext<'a> {
    pub fn new(graph: &'a HostGraph, id: NodeId, precision: PrecisionPolicy) -> Self {
        let node = graph.node(id);
        Self {
            graph,
            id,
            node,
            opset: graph.opset(&node.domain).unwrap_or(0),
            precision,
        }
    }

    pub fn input_name(&self, index: usize) -> Result<&'a str, LoweringError> {
        self.node
            .input(index)
            .map(|v| self.graph.value_name(v))
            .ok_or_else(|| LoweringError::MissingInput(format!("{} input {index}", self.node)))
    }

    pub fn output_name(&self, index: usize) -> Result<&'a str, LoweringError> {
        self.node
            .outputs
            .get(index)
            .map(|&v| self.graph.value_name(v))
            .ok_or_else(|| LoweringError::MissingInput(format!("{} output {index}", self.node)))
    }

    /// Declared shape of input `index`, if ranked.
    pub fn input_shape(&self, index: usize) -> Option<&'a [Dim]> {
        helper::get_shape(self.graph, self.node.input(index)?)
    }

    pub fn input_rank(&self, index: usize) -> Option<usize> {
        self.input_shape(index).map(<[Dim]>::len)
    }

    /// The initializer bound to input `index`.
    pub fn initializer(&self, index: usize) -> Option<&'a Initializer> {
        self.graph.initializer(self.node.input(index)?)
    }

    pub fn require_initializer(&self, index: usize) -> Result<&'a Initializer, LoweringError> {
        self.initializer(index).ok_or_else(|| {
            let name = self
                .node
                .input(index)
                .map(|v| self.graph.value_name(v).to_string())
                .unwrap_or_else(|| format!("{} input {index}", self.node));
            LoweringError::ExpectedInitializer(name)
        })
    }

    /// Initializer `index` read as float32 values.
    pub fn weight_values(&self, index: usize) -> Result<Vec<f32>, LoweringError> {
        Ok(weights::initializer_to_f32(self.require_initializer(index)?)?)
    }

    /// Encodes float32 values under the configured precision.
    pub fn weight(&self, values: &[f32]) -> WeightParams {
        weights::weight_from_f32(values, self.precision)
    }

    /// Name hint for layers emitted for this node.
    pub fn layer_hint(&self) -> &'a str {
        if !self.node.name.is_empty() {
            return &self.node.name;
        }
        self.node
            .outputs
            .first()
            .map_or(self.node.op_type.as_str(), |&v| self.graph.value_name(v))
    }
}

/// Names already used in the model under construction.
///
/// Blob names share a namespace with every value of the host graph; layer
/// names have their own namespace.
pub(crate) struct ModelNames<'a> {
    graph: &'a HostGraph,
    blobs: HashSet<String>,
    layers: HashSet<String>,
}

impl<'a> ModelNames<'a> {
    pub(crate) fn new(graph: &'a HostGraph) -> Self {
        Self {
            graph,
            blobs: HashSet::new(),
            layers: HashSet::new(),
        }
    }

    fn blob_taken(&self, name: &str) -> bool {
        self.blobs.contains(name) || self.graph.value_by_name(name).is_some()
    }

    fn layer_taken(&self, name: &str) -> bool {
        self.layers.contains(name)
    }

    pub(crate) fn claim_layer(&mut self, hint: &str) -> String {
        let name = unique(hint, |n| self.layer_taken(n));
        self.layers.insert(name.clone());
        name
    }
}

/// Layers emitted for one node, appended to the model only on success.
pub struct LayerBatch<'a> {
    names: &'a ModelNames<'a>,
    layers: Vec<NeuralNetworkLayer>,
    new_blobs: HashSet<String>,
    new_layers: HashSet<String>,
}

impl<'a> LayerBatch<'a> {
    pub(crate) fn new(names: &'a ModelNames<'a>) -> Self {
        Self {
            names,
            layers: Vec::new(),
            new_blobs: HashSet::new(),
            new_layers: HashSet::new(),
        }
    }

    /// A fresh intermediate blob name derived from `base`.
    ///
    /// `base` itself if unused, else `base_1`, `base_2`, ...
    pub fn intermediate(&mut self, base: &str) -> String {
        let name = unique(base, |n| {
            self.names.blob_taken(n) || self.new_blobs.contains(n)
        });
        self.new_blobs.insert(name.clone());
        name
    }

    /// Appends a layer; its name is made unique from `hint`.
    pub fn push(&mut self, hint: &str, input: Vec<String>, output: Vec<String>, layer: Layer) {
        let name = unique(hint, |n| {
            self.names.layer_taken(n) || self.new_layers.contains(n)
        });
        self.new_layers.insert(name.clone());
        self.layers
            .push(NeuralNetworkLayer::new(name, input, output, layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<NeuralNetworkLayer>, HashSet<String>, HashSet<String>) {
        (self.layers, self.new_blobs, self.new_layers)
    }
}

impl ModelNames<'_> {
    pub(crate) fn commit(&mut self, blobs: HashSet<String>, layers: HashSet<String>) {
        self.blobs.extend(blobs);
        self.layers.extend(layers);
    }
}

fn unique(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|n| !taken(n))
        .unwrap_or_else(|| base.to_string())
}

// ---- shared structural checks ----

pub(crate) fn no_structural_check(_: &NodeContext<'_>) -> Result<(), String> {
    Ok(())
}

/// Requires input `index` to have a known rank equal to `rank`.
pub(crate) fn require_rank(ctx: &NodeContext<'_>, index: usize, rank: usize) -> Result<(), String> {
    match ctx.input_rank(index) {
        Some(r) if r == rank => Ok(()),
        Some(r) => Err(format!("input {index} has rank {r}, expected {rank}")),
        None => Err(format!("input {index} has unknown rank")),
    }
}

/// Product of `dims`; `Err` when it does not fit in an `i64`.
pub(crate) fn checked_volume(dims: impl IntoIterator<Item = i64>) -> Result<i64, String> {
    dims.into_iter()
        .try_fold(1i64, |acc, d| acc.checked_mul(d))
        .ok_or_else(|| "shape overflows".to_string())
}

/// Requires input `index` to be a floating-point initializer of `rank`.
pub(crate) fn require_float_initializer<'a>(
    ctx: &NodeContext<'a>,
    index: usize,
    rank: usize,
) -> Result<&'a Initializer, String> {
    let init = ctx
        .initializer(index)
        .ok_or_else(|| format!("input {index} must be a constant initializer"))?;
    if init.dims.len() != rank {
        return Err(format!(
            "initializer input {index} has rank {}, expected {rank}",
            init.dims.len()
        ));
    }
    if !FLOAT_TYPES.contains(init.data_type) {
        return Err(format!(
            "initializer input {index} has type {}, expected float",
            init.data_type
        ));
    }
    Ok(init)
}

/// Requires an optional ints attribute to have `len` entries when present.
pub(crate) fn ints_of_len(node: &Node, key: &str, len: usize) -> Result<Option<Vec<i64>>, String> {
    match node.attr_ints(key) {
        Some(v) if v.len() == len => Ok(Some(v.to_vec())),
        Some(v) => Err(format!("'{key}' has {} entries, expected {len}", v.len())),
        None => Ok(None),
    }
}

/// Converts non-negative attribute values for the backend.
pub(crate) fn to_u64(values: &[i64], key: &str) -> Result<Vec<u64>, LoweringError> {
    values
        .iter()
        .map(|&v| {
            u64::try_from(v).map_err(|_| LoweringError::InvalidAttribute {
                name: key.to_string(),
                reason: format!("negative value {v}"),
            })
        })
        .collect()
}
