//! Offloads host-graph subgraphs to a CoreML NeuralNetwork backend.
//!
//! The pipeline is: [`evaluate`] partitions a [`HostGraph`] into
//! [`ConvertibleSubgraph`]s, a [`ModelBuilder`] lowers each one into a
//! [`CompiledModel`], and [`OffloadedModel`] loads it into a [`Runtime`] for
//! inference. [`ExecutionProvider`] wires the three together.
//!
//! [`HostGraph`]: offload_graph::HostGraph

pub mod builders;
pub mod capability;
mod error;
pub mod helper;
pub mod model;
pub mod model_builder;
pub mod options;
pub mod proto;
mod provider;
pub mod registry;
pub mod type_control;
pub mod weights;

pub use builders::{builtin_units, LayerBatch, LoweringUnit, NodeContext};
pub use capability::{evaluate, ConvertibleSubgraph, Partition, RejectedNode, Rejection};
pub use error::{BuildError, EncodeError, LoadError, LoweringError, PredictError, RuntimeError};
pub use model::{Execution, OffloadedModel, Runtime, TensorData, TensorDataMut};
pub use model_builder::{BuildState, CompiledModel, ModelBuilder, TensorDesc};
pub use options::{ComputeOptions, PrecisionPolicy, ProviderOptions};
pub use provider::ExecutionProvider;
pub use registry::{OpRegistry, RegisteredUnit};
pub use type_control::{TypeRestrictions, TypeSet};
