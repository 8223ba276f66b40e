//! Error types for lowering, model building and execution.

use offload_graph::DataType;

/// Errors from converting a host tensor into backend weight encoding.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The backend weight schema cannot hold this element type.
    #[error("unsupported data type {0} for weight encoding")]
    UnsupportedDataType(DataType),
    /// The payload does not match its declared type and shape.
    #[error("invalid tensor data: {0}")]
    InvalidTensorData(String),
}

/// Errors returned by a lowering unit's conversion function.
#[derive(Debug, thiserror::Error)]
pub enum LoweringError {
    /// An input the unit relies on is missing or has no usable type.
    #[error("missing or untyped input '{0}'")]
    MissingInput(String),
    /// A required constant operand is not an initializer.
    #[error("expected initializer for '{0}'")]
    ExpectedInitializer(String),
    /// An attribute value cannot be represented in the backend layer.
    #[error("attribute '{name}': {reason}")]
    InvalidAttribute { name: String, reason: String },
    /// A weight failed to encode.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Any other conversion failure.
    #[error("{0}")]
    Other(String),
}

/// Errors that abort the build of one subgraph.
///
/// No partial model is observable after any of these.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// An initializer could not be encoded as a backend weight.
    #[error("initializer '{name}': {source}")]
    WeightEncoding {
        name: String,
        #[source]
        source: EncodeError,
    },
    /// A subgraph input or output has no resolvable element type.
    #[error("value '{0}' has no resolvable element type")]
    UnresolvedType(String),
    /// A subgraph input or output has a type the backend cannot declare.
    #[error("value '{name}' has unsupported element type {data_type}")]
    UnsupportedInputType { name: String, data_type: DataType },
    /// A unit reported the node as supported but failed to convert it.
    #[error("internal consistency error lowering {op_type} node '{node}': {source}")]
    InternalConsistency {
        node: String,
        op_type: String,
        #[source]
        source: LoweringError,
    },
    /// A node in the subgraph has no registered lowering unit.
    #[error("no lowering unit registered for {op_type} (node '{node}')")]
    MissingLoweringUnit { node: String, op_type: String },
    /// The host graph itself is malformed.
    #[error(transparent)]
    Graph(#[from] offload_graph::GraphError),
}

/// Errors reported by the native backend runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The loader rejected the compiled document.
    #[error("model rejected by runtime: {0}")]
    Rejected(String),
    /// Inference failed inside the runtime.
    #[error("execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from loading a compiled model into the runtime.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Writing the staged document failed.
    #[error("staging compiled model: {0}")]
    Staging(#[from] std::io::Error),
    /// The runtime rejected the document.
    #[error("loading subgraph {subgraph}: {source}")]
    Runtime {
        subgraph: usize,
        #[source]
        source: RuntimeError,
    },
}

/// Errors from a predict call. Buffers are untouched when validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    /// An input name the model does not declare.
    #[error("unknown input '{0}'")]
    UnknownInput(String),
    /// A declared input was not supplied.
    #[error("missing input '{0}'")]
    MissingInput(String),
    /// An output name the model does not declare.
    #[error("unknown output '{0}'")]
    UnknownOutput(String),
    /// A declared output has no buffer.
    #[error("missing output buffer '{0}'")]
    MissingOutput(String),
    #[error("'{name}': expected element type {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: DataType,
        found: DataType,
    },
    #[error("'{name}': shape {found:?} is incompatible with declared {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
    #[error("'{name}': buffer holds {found} bytes, expected {expected}")]
    BufferSize {
        name: String,
        expected: usize,
        found: usize,
    },
    /// The runtime failed; carries the runtime's message verbatim.
    #[error("predict failed: {0}")]
    Runtime(#[from] RuntimeError),
    /// A previous predict panicked while holding the execution lock.
    #[error("execution lock poisoned")]
    Poisoned,
}
