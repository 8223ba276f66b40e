//! Host computation graph for the offload pipeline.
//!
//! An arena-based, read-mostly DAG of operator [`Node`]s connected by named
//! [`Value`]s, with constant [`Initializer`] payloads and per-domain
//! operator-set versions. Graphs are built programmatically or imported from
//! ONNX with [`onnx::import`].

pub mod arena;
mod error;
mod graph;
mod node;
pub mod onnx;
mod types;

pub use arena::{Arena, Handle};
pub use error::GraphError;
pub use graph::{HostGraph, Initializer, Value};
pub use node::{Attribute, Node, NodeId, ValueId};
pub use types::{element_count, DataType, Dim, TensorType};
