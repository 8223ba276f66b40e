use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use offload_coreml::proto::{
    activation_params::NonlinearityType, neural_network_layer::Layer, Model, NeuralNetworkLayer,
    WeightParams, SPECIFICATION_VERSION,
};
use offload_coreml::{
    CompiledModel, ComputeOptions, Execution, ExecutionProvider, Runtime, RuntimeError,
    TensorData, TensorDataMut,
};
use offload_graph::onnx::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    ValueInfoProto,
};
use offload_graph::{DataType, HostGraph};
use prost::Message;

/// ONNX element type code for float32.
pub const FLOAT: i32 = 1;
#[allow(dead_code)]
pub const INT64: i32 = 7;

/// Builder for small ONNX models.
#[derive(Clone)]
pub struct OnnxModel {
    graph: GraphProto,
    opsets: Vec<OperatorSetIdProto>,
}

#[allow(dead_code)]
impl OnnxModel {
    pub fn new(opset: i64) -> Self {
        Self {
            graph: GraphProto {
                name: "test".into(),
                ..Default::default()
            },
            opsets: vec![OperatorSetIdProto {
                domain: String::new(),
                version: opset,
            }],
        }
    }

    pub fn opset(mut self, domain: &str, version: i64) -> Self {
        self.opsets.push(OperatorSetIdProto {
            domain: domain.into(),
            version,
        });
        self
    }

    /// Float32 graph input.
    pub fn input(self, name: &str, dims: &[i64]) -> Self {
        self.typed_input(name, FLOAT, dims)
    }

    pub fn typed_input(mut self, name: &str, elem_type: i32, dims: &[i64]) -> Self {
        self.graph
            .input
            .push(ValueInfoProto::tensor(name, elem_type, dims));
        self
    }

    /// Graph input without any type information.
    pub fn untyped_input(mut self, name: &str) -> Self {
        self.graph.input.push(ValueInfoProto {
            name: name.into(),
            r#type: None,
        });
        self
    }

    /// Float32 graph output.
    pub fn output(mut self, name: &str, dims: &[i64]) -> Self {
        self.graph
            .output
            .push(ValueInfoProto::tensor(name, FLOAT, dims));
        self
    }

    /// Float32 type annotation for an intermediate value.
    pub fn value(mut self, name: &str, dims: &[i64]) -> Self {
        self.graph
            .value_info
            .push(ValueInfoProto::tensor(name, FLOAT, dims));
        self
    }

    pub fn init_f32(mut self, name: &str, dims: &[i64], values: &[f32]) -> Self {
        self.graph.initializer.push(TensorProto {
            name: name.into(),
            dims: dims.to_vec(),
            data_type: FLOAT,
            float_data: values.to_vec(),
            ..Default::default()
        });
        self
    }

    pub fn init_i64(mut self, name: &str, dims: &[i64], values: &[i64]) -> Self {
        self.graph.initializer.push(TensorProto {
            name: name.into(),
            dims: dims.to_vec(),
            data_type: INT64,
            int64_data: values.to_vec(),
            ..Default::default()
        });
        self
    }

    pub fn node(self, op: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        self.node_with(op, name, inputs, outputs, vec![])
    }

    pub fn node_with(
        mut self,
        op: &str,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
        attrs: Vec<AttributeProto>,
    ) -> Self {
        let mut node = NodeProto::simple(
            op,
            name,
            inputs.iter().map(|s| s.to_string()).collect(),
            outputs.iter().map(|s| s.to_string()).collect(),
        );
        node.attribute = attrs;
        self.graph.node.push(node);
        self
    }

    /// Marks the most recently added node with `domain`.
    pub fn in_domain(mut self, domain: &str) -> Self {
        if let Some(node) = self.graph.node.last_mut() {
            node.domain = domain.into();
        }
        self
    }

    pub fn proto(&self) -> ModelProto {
        ModelProto {
            ir_version: 8,
            producer_name: "offload-e2e".into(),
            producer_version: String::new(),
            graph: Some(self.graph.clone()),
            opset_import: self.opsets.clone(),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.proto().encode_to_vec()
    }

    pub fn import(&self) -> HostGraph {
        offload_graph::onnx::import(&self.bytes()).expect("ONNX import failed")
    }
}

/// x[1,4] -> Gemm(W1[3,4], b1) -> Relu -> Gemm(W2[2,3], b2) -> y[1,2]
#[allow(dead_code)]
pub fn mlp() -> OnnxModel {
    OnnxModel::new(13)
        .input("x", &[1, 4])
        .init_f32(
            "w1",
            &[3, 4],
            &[
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                -1.0, -1.0, -1.0, -1.0,
            ],
        )
        .init_f32("b1", &[3], &[0.5, -0.5, 0.0])
        .init_f32("w2", &[2, 3], &[1.0, 1.0, 1.0, 2.0, 0.0, -1.0])
        .init_f32("b2", &[2], &[0.0, 1.0])
        .node_with(
            "Gemm",
            "fc1",
            &["x", "w1", "b1"],
            &["h"],
            vec![AttributeProto::int("transB", 1)],
        )
        .value("h", &[1, 3])
        .node("Relu", "relu", &["h"], &["a"])
        .value("a", &[1, 3])
        .node_with(
            "Gemm",
            "fc2",
            &["a", "w2", "b2"],
            &["y"],
            vec![AttributeProto::int("transB", 1)],
        )
        .output("y", &[1, 2])
}

/// Builds every subgraph and panics on the first failure.
#[allow(dead_code)]
pub fn compile_all(provider: &ExecutionProvider, graph: &HostGraph) -> Vec<CompiledModel> {
    let partition = provider.get_capability(graph).expect("partition failed");
    provider
        .compile(graph, &partition)
        .into_iter()
        .collect::<Result<_, _>>()
        .expect("build failed")
}

#[allow(dead_code)]
pub fn decode(model: &CompiledModel) -> Model {
    Model::decode(model.encode().as_slice()).expect("failed to decode CoreML model")
}

#[allow(dead_code)]
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[allow(dead_code)]
pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Weights as float32, from either float or half storage.
#[allow(dead_code)]
pub fn weight_values(w: &WeightParams) -> Vec<f32> {
    if !w.float16_value.is_empty() {
        w.float16_value
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect()
    } else {
        w.float_value.clone()
    }
}

/// Interprets a float32 NeuralNetwork model directly.
///
/// Covers constants, activations, add, multiply and inner product; any other
/// layer makes `load` fail the way a native loader would.
#[derive(Default)]
pub struct ReferenceRuntime {
    pub loads: Arc<Mutex<Vec<(PathBuf, ComputeOptions)>>>,
}

struct ReferenceExecution {
    layers: Vec<NeuralNetworkLayer>,
}

impl Runtime for ReferenceRuntime {
    fn load(
        &self,
        path: &Path,
        options: &ComputeOptions,
    ) -> Result<Box<dyn Execution>, RuntimeError> {
        let bytes = std::fs::read(path)?;
        let model =
            Model::decode(bytes.as_slice()).map_err(|e| RuntimeError::Rejected(e.to_string()))?;
        if model.specification_version > SPECIFICATION_VERSION {
            return Err(RuntimeError::Rejected(format!(
                "specification version {} is too new",
                model.specification_version
            )));
        }
        let layers = model.layers().to_vec();
        for layer in &layers {
            match layer.kind() {
                "loadConstant" | "activation" | "add" | "multiply" | "innerProduct" => {}
                other => {
                    return Err(RuntimeError::Rejected(format!(
                        "layer '{}' of kind {other} is not implemented",
                        layer.name
                    )))
                }
            }
        }
        self.loads
            .lock()
            .unwrap()
            .push((path.to_path_buf(), *options));
        Ok(Box::new(ReferenceExecution { layers }))
    }
}

fn elementwise(a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) -> Result<Vec<f32>, RuntimeError> {
    match (a.len(), b.len()) {
        (n, m) if n == m => Ok(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()),
        (_, 1) => Ok(a.iter().map(|&x| f(x, b[0])).collect()),
        (1, _) => Ok(b.iter().map(|&y| f(a[0], y)).collect()),
        (n, m) => Err(RuntimeError::Execution(format!(
            "cannot broadcast {n} and {m} elements"
        ))),
    }
}

impl ReferenceExecution {
    fn run_layer(
        layer: &NeuralNetworkLayer,
        blobs: &HashMap<String, Vec<f32>>,
    ) -> Result<Vec<f32>, RuntimeError> {
        let input = |i: usize| -> Result<&Vec<f32>, RuntimeError> {
            let name = layer.input.get(i).ok_or_else(|| {
                RuntimeError::Execution(format!("layer '{}' lacks input {i}", layer.name))
            })?;
            blobs
                .get(name)
                .ok_or_else(|| RuntimeError::Execution(format!("blob '{name}' not computed")))
        };
        let out = match layer.layer.as_ref() {
            Some(Layer::LoadConstant(c)) => {
                weight_values(c.data.as_ref().unwrap_or(&WeightParams::default()))
            }
            Some(Layer::Activation(a)) => {
                let x = input(0)?;
                match a.nonlinearity_type.as_ref() {
                    Some(NonlinearityType::ReLu(_)) => x.iter().map(|v| v.max(0.0)).collect(),
                    Some(NonlinearityType::Sigmoid(_)) => {
                        x.iter().map(|v| 1.0 / (1.0 + (-v).exp())).collect()
                    }
                    Some(NonlinearityType::Tanh(_)) => x.iter().map(|v| v.tanh()).collect(),
                    Some(NonlinearityType::LeakyReLu(p)) => x
                        .iter()
                        .map(|&v| if v < 0.0 { p.alpha * v } else { v })
                        .collect(),
                    Some(NonlinearityType::Linear(p)) => {
                        x.iter().map(|&v| p.alpha * v + p.beta).collect()
                    }
                    None => return Err(RuntimeError::Execution("empty activation".into())),
                }
            }
            Some(Layer::Add(p)) => match layer.input.len() {
                1 => input(0)?.iter().map(|v| v + p.alpha).collect(),
                _ => elementwise(input(0)?, input(1)?, |a, b| a + b)?,
            },
            Some(Layer::Multiply(p)) => match layer.input.len() {
                1 => input(0)?.iter().map(|v| v * p.alpha).collect(),
                _ => elementwise(input(0)?, input(1)?, |a, b| a * b)?,
            },
            Some(Layer::InnerProduct(p)) => {
                let x = input(0)?;
                let k = p.input_channels as usize;
                let n = p.output_channels as usize;
                let w = weight_values(p.weights.as_ref().unwrap_or(&WeightParams::default()));
                let bias = p
                    .bias
                    .as_ref()
                    .map(weight_values)
                    .unwrap_or_else(|| vec![0.0; n]);
                if k == 0 || x.len() % k != 0 || w.len() != n * k {
                    return Err(RuntimeError::Execution(format!(
                        "innerProduct '{}' shape mismatch",
                        layer.name
                    )));
                }
                x.chunks_exact(k)
                    .flat_map(|row| {
                        (0..n).map(|j| {
                            let weights = &w[j * k..(j + 1) * k];
                            let dot: f32 = row.iter().zip(weights).map(|(a, b)| a * b).sum();
                            dot + if p.has_bias { bias[j] } else { 0.0 }
                        })
                        .collect::<Vec<_>>()
                    })
                    .collect()
            }
            _ => {
                return Err(RuntimeError::Execution(format!(
                    "layer kind {} not implemented",
                    layer.kind()
                )))
            }
        };
        Ok(out)
    }
}

impl Execution for ReferenceExecution {
    fn predict(
        &mut self,
        inputs: &HashMap<String, TensorData<'_>>,
        outputs: &mut HashMap<String, TensorDataMut<'_>>,
    ) -> Result<(), RuntimeError> {
        let mut blobs: HashMap<String, Vec<f32>> = HashMap::new();
        for (name, tensor) in inputs {
            if tensor.data_type != DataType::Float {
                return Err(RuntimeError::Execution(format!("{name}: float32 only")));
            }
            blobs.insert(name.clone(), f32_values(tensor.buffer));
        }
        for layer in &self.layers {
            let value = Self::run_layer(layer, &blobs)?;
            for out in &layer.output {
                blobs.insert(out.clone(), value.clone());
            }
        }
        for (name, tensor) in outputs.iter_mut() {
            let value = blobs
                .get(name)
                .ok_or_else(|| RuntimeError::Execution(format!("output '{name}' not computed")))?;
            let bytes = f32_bytes(value);
            if bytes.len() != tensor.buffer.len() {
                return Err(RuntimeError::Execution(format!(
                    "output '{name}' holds {} bytes, computed {}",
                    tensor.buffer.len(),
                    bytes.len()
                )));
            }
            tensor.buffer.copy_from_slice(&bytes);
        }
        Ok(())
    }
}

/// Runs `model` on a single float32 input and returns its single output.
#[allow(dead_code)]
pub fn run_single(
    model: &offload_coreml::OffloadedModel,
    input: &str,
    input_shape: &[i64],
    values: &[f32],
) -> Vec<f32> {
    let desc = &model.outputs()[0];
    let out_shape = desc.shape.clone().expect("output shape");
    let count: usize = out_shape.iter().map(|&d| d as usize).product();
    let x = f32_bytes(values);
    let mut y = vec![0u8; count * 4];
    let inputs = HashMap::from([(
        input.to_string(),
        TensorData::new(DataType::Float, input_shape, &x),
    )]);
    let mut outputs = HashMap::from([(
        desc.name.clone(),
        TensorDataMut::new(DataType::Float, &out_shape, &mut y),
    )]);
    model.predict(&inputs, &mut outputs).expect("predict failed");
    drop(outputs);
    f32_values(&y)
}

#[allow(dead_code)]
pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-3, "{actual:?} vs {expected:?}");
    }
}
