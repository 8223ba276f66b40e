//! Error types for host graph construction and import.

/// Errors raised while building or importing a [`HostGraph`](crate::HostGraph).
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Two values were declared with the same name.
    #[error("value name '{0}' is declared more than once")]
    DuplicateValue(String),

    /// A node or graph I/O list refers to a value that was never declared.
    #[error("unknown value '{0}'")]
    UnknownValue(String),

    /// The node list does not form a DAG.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// The ONNX protobuf could not be decoded.
    #[error("failed to decode ONNX model: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The model decoded but is not a usable graph.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// An initializer payload is inconsistent with its declared type and dims.
    #[error("initializer '{name}': {reason}")]
    InvalidTensor { name: String, reason: String },
}
