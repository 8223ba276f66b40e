//! Builds one CoreML NeuralNetwork model from a convertible subgraph.
//!
//! The builder walks a fixed sequence of states (see [`BuildState`]). Any
//! failure consumes the builder, so no partially built model is observable.

use std::collections::HashSet;
use std::fmt;

use offload_graph::{DataType, HostGraph, ValueId};
use prost::Message;

use crate::builders::{LayerBatch, ModelNames, NodeContext};
use crate::capability::ConvertibleSubgraph;
use crate::error::{BuildError, EncodeError};
use crate::helper;
use crate::options::PrecisionPolicy;
use crate::proto::{
    model, neural_network_layer::Layer, ArrayDataType, FeatureDescription,
    LoadConstantLayerParams, Metadata, Model, ModelDescription, NeuralNetwork,
    NeuralNetworkLayer, NeuralNetworkMultiArrayShapeMapping, SPECIFICATION_VERSION,
};
use crate::registry::OpRegistry;
use crate::weights;

/// Progress of a [`ModelBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildState {
    Initialized,
    /// The skip set of in-place initializers is known.
    InitializersPreprocessed,
    InitializersRegistered,
    InputsRegistered,
    OperatorsAdded,
    OutputsRegistered,
    Compiled,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Name, element type and shape of a model input or output.
///
/// `-1` marks a dimension fixed only at run time; `None` an unknown rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub name: String,
    pub data_type: DataType,
    pub shape: Option<Vec<i64>>,
}

/// A finished, frozen backend model.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledModel {
    /// Index of the subgraph this model was built from.
    pub index: usize,
    pub document: Model,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    /// Initializers consumed in place rather than declared as constants.
    pub skipped_initializers: Vec<String>,
}

impl CompiledModel {
    /// Serialized protobuf document.
    pub fn encode(&self) -> Vec<u8> {
        self.document.encode_to_vec()
    }

    /// Layer kinds in model order.
    pub fn layer_types(&self) -> Vec<&'static str> {
        self.document.layers().iter().map(NeuralNetworkLayer::kind).collect()
    }

    pub fn input(&self, name: &str) -> Option<&TensorDesc> {
        self.inputs.iter().find(|d| d.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorDesc> {
        self.outputs.iter().find(|d| d.name == name)
    }
}

/// Backend array type for a declared input or output.
fn array_type(data_type: DataType) -> Option<ArrayDataType> {
    match data_type {
        DataType::Float => Some(ArrayDataType::Float32),
        DataType::Float16 => Some(ArrayDataType::Float16),
        DataType::Double => Some(ArrayDataType::Double),
        DataType::Int32 => Some(ArrayDataType::Int32),
        _ => None,
    }
}

pub struct ModelBuilder<'a> {
    graph: &'a HostGraph,
    subgraph: &'a ConvertibleSubgraph,
    registry: &'a OpRegistry,
    precision: PrecisionPolicy,
    state: BuildState,
    skipped: HashSet<ValueId>,
    names: ModelNames<'a>,
    layers: Vec<NeuralNetworkLayer>,
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(
        graph: &'a HostGraph,
        subgraph: &'a ConvertibleSubgraph,
        registry: &'a OpRegistry,
        precision: PrecisionPolicy,
    ) -> Self {
        Self {
            graph,
            subgraph,
            registry,
            precision,
            state: BuildState::Initialized,
            skipped: HashSet::new(),
            names: ModelNames::new(graph),
            layers: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Runs every step and freezes the model.
    pub fn build(mut self) -> Result<CompiledModel, BuildError> {
        self.preprocess_initializers();
        self.register_initializers()?;
        self.register_inputs()?;
        self.add_operators()?;
        self.register_outputs()?;
        Ok(self.finish())
    }

    fn advance(&mut self, next: BuildState) {
        log::debug!("subgraph {}: {} -> {next}", self.subgraph.index, self.state);
        self.state = next;
    }

    /// An initializer is skipped when every use inside the subgraph reads it
    /// in place.
    fn preprocess_initializers(&mut self) {
        for &value in &self.subgraph.initializers {
            let mut uses = self.subgraph.nodes.iter().flat_map(|&id| {
                let node = self.graph.node(id);
                let unit = self.registry.lookup_node(self.graph, id);
                node.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, v)| **v == Some(value))
                    .map(move |(i, _)| unit.is_some_and(|u| u.unit().consumes_in_place(i)))
            });
            if uses.all(|in_place| in_place) {
                self.skipped.insert(value);
            }
        }
        self.advance(BuildState::InitializersPreprocessed);
    }

    fn register_initializers(&mut self) -> Result<(), BuildError> {
        for &value in &self.subgraph.initializers {
            if self.skipped.contains(&value) {
                continue;
            }
            let name = self.graph.value_name(value);
            let Some(tensor) = self.graph.initializer(value) else {
                continue;
            };
            let wrap = |source: EncodeError| BuildError::WeightEncoding {
                name: name.to_string(),
                source,
            };
            let data = weights::encode_weight(tensor, self.precision).map_err(wrap)?;
            let shape = tensor
                .dims
                .iter()
                .map(|&d| u64::try_from(d))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| wrap(EncodeError::InvalidTensorData(format!("dims {:?}", tensor.dims))))?;

            let layer_name = self.names.claim_layer(name);
            self.layers.push(NeuralNetworkLayer::new(
                layer_name,
                vec![],
                vec![name.to_string()],
                Layer::LoadConstant(LoadConstantLayerParams {
                    shape,
                    data: Some(data),
                }),
            ));
        }
        self.advance(BuildState::InitializersRegistered);
        Ok(())
    }

    fn describe(&self, value: ValueId) -> Result<TensorDesc, BuildError> {
        let name = self.graph.value_name(value).to_string();
        let (data_type, ok) = helper::get_type(self.graph, value);
        if !ok {
            return Err(BuildError::UnresolvedType(name));
        }
        if array_type(data_type).is_none() {
            return Err(BuildError::UnsupportedInputType { name, data_type });
        }
        let shape = helper::get_shape(self.graph, value).map(helper::shape_or_dynamic);
        Ok(TensorDesc {
            name,
            data_type,
            shape,
        })
    }

    fn register_inputs(&mut self) -> Result<(), BuildError> {
        for &value in &self.subgraph.inputs {
            if self.graph.is_initializer(value) {
                continue;
            }
            let desc = self.describe(value)?;
            self.inputs.push(desc);
        }
        self.advance(BuildState::InputsRegistered);
        Ok(())
    }

    fn add_operators(&mut self) -> Result<(), BuildError> {
        for &id in &self.subgraph.nodes {
            let node = self.graph.node(id);
            let unit = self.registry.lookup_node(self.graph, id).ok_or_else(|| {
                BuildError::MissingLoweringUnit {
                    node: node.name.clone(),
                    op_type: node.op_type.clone(),
                }
            })?;
            let ctx = NodeContext::new(self.graph, id, self.precision);
            let mut batch = LayerBatch::new(&self.names);
            unit.add_to_model(&ctx, &mut batch)
                .map_err(|source| BuildError::InternalConsistency {
                    node: node.name.clone(),
                    op_type: node.op_type.clone(),
                    source,
                })?;
            log::debug!("lowered {node} into {} layer(s)", batch.len());
            let (layers, blobs, layer_names) = batch.into_parts();
            self.names.commit(blobs, layer_names);
            self.layers.extend(layers);
        }
        self.advance(BuildState::OperatorsAdded);
        Ok(())
    }

    fn register_outputs(&mut self) -> Result<(), BuildError> {
        for &value in &self.subgraph.outputs {
            let desc = self.describe(value)?;
            self.outputs.push(desc);
        }
        self.advance(BuildState::OutputsRegistered);
        Ok(())
    }

    fn finish(mut self) -> CompiledModel {
        let feature = |d: &TensorDesc| {
            FeatureDescription::multi_array(
                d.name.clone(),
                array_type(d.data_type).unwrap_or(ArrayDataType::InvalidArrayDataType),
                d.shape.as_deref().unwrap_or(&[]),
            )
        };
        let document = Model {
            specification_version: SPECIFICATION_VERSION,
            description: Some(ModelDescription {
                input: self.inputs.iter().map(feature).collect(),
                output: self.outputs.iter().map(feature).collect(),
                metadata: Some(Metadata {
                    short_description: format!("offloaded subgraph {}", self.subgraph.index),
                    version_string: env!("CARGO_PKG_VERSION").into(),
                    author: "offload".into(),
                    license: String::new(),
                }),
            }),
            is_updatable: false,
            r#type: Some(model::Type::NeuralNetwork(NeuralNetwork {
                layers: std::mem::take(&mut self.layers),
                array_input_shape_mapping: NeuralNetworkMultiArrayShapeMapping::ExactArrayMapping
                    as i32,
            })),
        };
        self.advance(BuildState::Compiled);

        let mut skipped_initializers: Vec<String> = self
            .subgraph
            .initializers
            .iter()
            .filter(|v| self.skipped.contains(v))
            .map(|&v| self.graph.value_name(v).to_string())
            .collect();
        skipped_initializers.dedup();
        CompiledModel {
            index: self.subgraph.index,
            document,
            inputs: self.inputs,
            outputs: self.outputs,
            skipped_initializers,
        }
    }
}
