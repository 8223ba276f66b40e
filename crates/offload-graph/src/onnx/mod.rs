//! ONNX model import.
//!
//! Decodes an `.onnx` protobuf into a [`HostGraph`]. Initializer payloads
//! are normalized to raw little-endian bytes whichever typed field the
//! producer used.

pub mod proto;

use std::collections::HashMap;

use prost::Message;

use crate::error::GraphError;
use crate::graph::{HostGraph, Initializer};
use crate::node::{Attribute, Node};
use crate::types::{DataType, Dim, TensorType};

use self::proto::{attribute_type, tensor_shape_dimension, type_proto};

/// `TensorProto.DataLocation.EXTERNAL`.
const EXTERNAL_DATA: i32 = 1;

/// Decodes ONNX model bytes into a host graph.
pub fn import(bytes: &[u8]) -> Result<HostGraph, GraphError> {
    let model = proto::ModelProto::decode(bytes)?;
    import_model(&model)
}

/// Builds a host graph from an already decoded model.
pub fn import_model(model: &proto::ModelProto) -> Result<HostGraph, GraphError> {
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| GraphError::InvalidModel("model has no graph".into()))?;

    let mut host = HostGraph::new();
    for opset in &model.opset_import {
        host.set_opset(&opset.domain, opset.version);
    }

    for tensor in &graph.initializer {
        let init = convert_tensor(tensor)?;
        host.add_initializer(tensor.name.clone(), init)?;
    }

    for input in &graph.input {
        // Older exporters list initializers among the inputs as well.
        if host.value_by_name(&input.name).is_some() {
            continue;
        }
        host.add_input(input.name.clone(), convert_type(input.r#type.as_ref()))?;
    }

    let declared: HashMap<&str, &proto::ValueInfoProto> = graph
        .value_info
        .iter()
        .chain(graph.output.iter())
        .map(|vi| (vi.name.as_str(), vi))
        .collect();

    // Declare every node output first so the node list may arrive in any order.
    for node in &graph.node {
        for out in node.output.iter().filter(|o| !o.is_empty()) {
            let ty = declared
                .get(out.as_str())
                .and_then(|vi| convert_type(vi.r#type.as_ref()));
            host.add_value(out.clone(), ty)?;
        }
    }

    for (i, proto_node) in graph.node.iter().enumerate() {
        let mut node = Node::new(proto_node.op_type.clone(), proto_node.name.clone());
        if node.name.is_empty() {
            node.name = format!("{}_{i}", proto_node.op_type);
        }
        node.domain = proto_node.domain.clone();
        node.inputs = proto_node
            .input
            .iter()
            .map(|name| {
                if name.is_empty() {
                    Ok(None)
                } else {
                    host.value_by_name(name)
                        .map(Some)
                        .ok_or_else(|| GraphError::UnknownValue(name.clone()))
                }
            })
            .collect::<Result<_, _>>()?;
        node.outputs = proto_node
            .output
            .iter()
            .filter(|o| !o.is_empty())
            .map(|name| {
                host.value_by_name(name)
                    .ok_or_else(|| GraphError::UnknownValue(name.clone()))
            })
            .collect::<Result<_, _>>()?;
        for attr in &proto_node.attribute {
            if let Some(value) = convert_attribute(attr)? {
                node.attributes.insert(attr.name.clone(), value);
            }
        }
        host.add_node(node)?;
    }

    for output in &graph.output {
        let id = host
            .value_by_name(&output.name)
            .ok_or_else(|| GraphError::UnknownValue(output.name.clone()))?;
        host.add_output(id)?;
    }

    host.topological_order()?;
    log::debug!(
        "imported ONNX graph '{}': {} nodes, {} values",
        graph.name,
        host.node_count(),
        host.value_count()
    );
    Ok(host)
}

fn convert_type(ty: Option<&proto::TypeProto>) -> Option<TensorType> {
    let type_proto::Value::TensorType(tensor) = ty?.value.as_ref()?;
    let elem_type = match tensor.elem_type {
        0 => None,
        code => {
            let dt = DataType::from_i32(code);
            if dt.is_none() {
                log::debug!("unrecognized ONNX element type code {code}");
            }
            dt
        }
    };
    let shape = tensor.shape.as_ref().map(|s| {
        s.dim
            .iter()
            .map(|d| match &d.value {
                Some(tensor_shape_dimension::Value::DimValue(v)) => Dim::Fixed(*v),
                Some(tensor_shape_dimension::Value::DimParam(p)) if !p.is_empty() => {
                    Dim::Symbolic(p.clone())
                }
                _ => Dim::Unknown,
            })
            .collect()
    });
    Some(TensorType { elem_type, shape })
}

fn convert_tensor(tensor: &proto::TensorProto) -> Result<Initializer, GraphError> {
    let invalid = |reason: String| GraphError::InvalidTensor {
        name: tensor.name.clone(),
        reason,
    };
    if tensor.data_location == EXTERNAL_DATA {
        return Err(invalid("external tensor data is not supported".into()));
    }
    let data_type = DataType::from_i32(tensor.data_type)
        .ok_or_else(|| invalid(format!("unsupported element type code {}", tensor.data_type)))?;
    let width = data_type
        .size_in_bytes()
        .ok_or_else(|| invalid(format!("element type {data_type} cannot be an initializer")))?;

    let raw = if !tensor.raw_data.is_empty() {
        tensor.raw_data.clone()
    } else {
        match data_type {
            DataType::Float => le_bytes(&tensor.float_data, |v| v.to_le_bytes()),
            DataType::Double => le_bytes(&tensor.double_data, |v| v.to_le_bytes()),
            DataType::Int64 => le_bytes(&tensor.int64_data, |v| v.to_le_bytes()),
            DataType::Uint64 => le_bytes(&tensor.uint64_data, |v| v.to_le_bytes()),
            DataType::Uint32 => le_bytes(&tensor.uint64_data, |v| (*v as u32).to_le_bytes()),
            // Narrow types (and float16 bit patterns) travel in int32_data.
            _ => tensor
                .int32_data
                .iter()
                .flat_map(|v| v.to_le_bytes().into_iter().take(width))
                .collect(),
        }
    };

    Initializer::new(data_type, tensor.dims.clone(), raw).map_err(invalid)
}

fn le_bytes<T, const N: usize>(values: &[T], f: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
    values.iter().flat_map(f).collect()
}

fn convert_attribute(attr: &proto::AttributeProto) -> Result<Option<Attribute>, GraphError> {
    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
    let value = match attr.r#type {
        attribute_type::FLOAT => Attribute::Float(attr.f),
        attribute_type::INT => Attribute::Int(attr.i),
        attribute_type::STRING => Attribute::String(text(&attr.s)),
        attribute_type::FLOATS => Attribute::Floats(attr.floats.clone()),
        attribute_type::INTS => Attribute::Ints(attr.ints.clone()),
        attribute_type::STRINGS => Attribute::Strings(attr.strings.iter().map(|s| text(s)).collect()),
        attribute_type::TENSOR => match &attr.t {
            Some(t) => Attribute::Tensor(convert_tensor(t)?),
            None => return Ok(None),
        },
        other => {
            log::debug!("skipping attribute '{}' of type {other}", attr.name);
            return Ok(None);
        }
    };
    Ok(Some(value))
}
