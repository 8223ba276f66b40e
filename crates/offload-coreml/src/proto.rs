//! CoreML protobuf types via prost derive.
//!
//! Hand-defined subset of CoreML's `Model.proto` / `NeuralNetwork.proto`
//! covering the NeuralNetwork model type and the layers the lowering units
//! emit. Field tags match the published specification.

use prost::Message;

/// CoreML specification version emitted for NeuralNetwork models (iOS 13).
pub const SPECIFICATION_VERSION: i32 = 4;

/// Top-level CoreML model.
#[derive(Clone, PartialEq, Message)]
pub struct Model {
    #[prost(int32, tag = "1")]
    pub specification_version: i32,
    #[prost(message, optional, tag = "2")]
    pub description: Option<ModelDescription>,
    #[prost(bool, tag = "10")]
    pub is_updatable: bool,
    #[prost(oneof = "model::Type", tags = "500")]
    pub r#type: Option<model::Type>,
}

pub mod model {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "500")]
        NeuralNetwork(super::NeuralNetwork),
    }
}

impl Model {
    /// The layer list of a NeuralNetwork model.
    pub fn layers(&self) -> &[NeuralNetworkLayer] {
        match &self.r#type {
            Some(model::Type::NeuralNetwork(nn)) => &nn.layers,
            None => &[],
        }
    }
}

/// Model I/O descriptions and metadata.
#[derive(Clone, PartialEq, Message)]
pub struct ModelDescription {
    #[prost(message, repeated, tag = "1")]
    pub input: Vec<FeatureDescription>,
    #[prost(message, repeated, tag = "10")]
    pub output: Vec<FeatureDescription>,
    #[prost(message, optional, tag = "100")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub short_description: String,
    #[prost(string, tag = "2")]
    pub version_string: String,
    #[prost(string, tag = "3")]
    pub author: String,
    #[prost(string, tag = "4")]
    pub license: String,
}

/// A named model input or output.
#[derive(Clone, PartialEq, Message)]
pub struct FeatureDescription {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub short_description: String,
    #[prost(message, optional, tag = "3")]
    pub r#type: Option<FeatureType>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FeatureType {
    #[prost(oneof = "feature_type::Type", tags = "5")]
    pub r#type: Option<feature_type::Type>,
    #[prost(bool, tag = "1000")]
    pub is_optional: bool,
}

pub mod feature_type {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "5")]
        MultiArrayType(super::ArrayFeatureType),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ArrayFeatureType {
    #[prost(int64, repeated, tag = "1")]
    pub shape: Vec<i64>,
    #[prost(enumeration = "ArrayDataType", tag = "2")]
    pub data_type: i32,
}

/// Multi-array element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ArrayDataType {
    InvalidArrayDataType = 0,
    Float32 = 65568,
    Double = 65600,
    Int32 = 131104,
    Float16 = 65552,
}

impl FeatureDescription {
    /// Multi-array feature description.
    pub fn multi_array(name: impl Into<String>, data_type: ArrayDataType, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            short_description: String::new(),
            r#type: Some(FeatureType {
                r#type: Some(feature_type::Type::MultiArrayType(ArrayFeatureType {
                    shape: shape.to_vec(),
                    data_type: data_type as i32,
                })),
                is_optional: false,
            }),
        }
    }

    /// The multi-array type, if this feature is one.
    pub fn array_type(&self) -> Option<&ArrayFeatureType> {
        match self.r#type.as_ref()?.r#type.as_ref()? {
            feature_type::Type::MultiArrayType(a) => Some(a),
        }
    }
}

/// How multi-array inputs map onto the network's internal blob shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum NeuralNetworkMultiArrayShapeMapping {
    Rank5ArrayMapping = 0,
    ExactArrayMapping = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct NeuralNetwork {
    #[prost(message, repeated, tag = "1")]
    pub layers: Vec<NeuralNetworkLayer>,
    #[prost(enumeration = "NeuralNetworkMultiArrayShapeMapping", tag = "5")]
    pub array_input_shape_mapping: i32,
}

/// One layer: named blobs in, named blobs out, and its parameters.
#[derive(Clone, PartialEq, Message)]
pub struct NeuralNetworkLayer {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub output: Vec<String>,
    #[prost(
        oneof = "neural_network_layer::Layer",
        tags = "100, 120, 130, 140, 230, 231, 290, 320, 1120, 1160, 1365"
    )]
    pub layer: Option<neural_network_layer::Layer>,
}

pub mod neural_network_layer {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Layer {
        #[prost(message, tag = "100")]
        Convolution(super::ConvolutionLayerParams),
        #[prost(message, tag = "120")]
        Pooling(super::PoolingLayerParams),
        #[prost(message, tag = "130")]
        Activation(super::ActivationParams),
        #[prost(message, tag = "140")]
        InnerProduct(super::InnerProductLayerParams),
        #[prost(message, tag = "230")]
        Add(super::AddLayerParams),
        #[prost(message, tag = "231")]
        Multiply(super::MultiplyLayerParams),
        #[prost(message, tag = "290")]
        LoadConstant(super::LoadConstantLayerParams),
        #[prost(message, tag = "320")]
        Concat(super::ConcatLayerParams),
        #[prost(message, tag = "1120")]
        SoftmaxNd(super::SoftmaxNdLayerParams),
        #[prost(message, tag = "1160")]
        Transpose(super::TransposeLayerParams),
        #[prost(message, tag = "1365")]
        ReshapeStatic(super::ReshapeStaticLayerParams),
    }
}

impl NeuralNetworkLayer {
    pub fn new(
        name: impl Into<String>,
        input: Vec<String>,
        output: Vec<String>,
        layer: neural_network_layer::Layer,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            output,
            layer: Some(layer),
        }
    }

    /// Short layer kind, e.g. `"add"` or `"innerProduct"`.
    pub fn kind(&self) -> &'static str {
        use neural_network_layer::Layer;
        match &self.layer {
            Some(Layer::Convolution(_)) => "convolution",
            Some(Layer::Pooling(_)) => "pooling",
            Some(Layer::Activation(_)) => "activation",
            Some(Layer::InnerProduct(_)) => "innerProduct",
            Some(Layer::Add(_)) => "add",
            Some(Layer::Multiply(_)) => "multiply",
            Some(Layer::LoadConstant(_)) => "loadConstant",
            Some(Layer::Concat(_)) => "concat",
            Some(Layer::SoftmaxNd(_)) => "softmaxND",
            Some(Layer::Transpose(_)) => "transpose",
            Some(Layer::ReshapeStatic(_)) => "reshapeStatic",
            None => "none",
        }
    }
}

/// Weight storage. Exactly one of the value fields is populated.
#[derive(Clone, PartialEq, Message)]
pub struct WeightParams {
    #[prost(float, repeated, tag = "1")]
    pub float_value: Vec<f32>,
    #[prost(bytes = "vec", tag = "2")]
    pub float16_value: Vec<u8>,
    #[prost(bytes = "vec", tag = "30")]
    pub raw_value: Vec<u8>,
}

// ---- activations ----

#[derive(Clone, PartialEq, Message)]
pub struct ActivationParams {
    #[prost(oneof = "activation_params::NonlinearityType", tags = "5, 10, 15, 30, 40")]
    pub nonlinearity_type: Option<activation_params::NonlinearityType>,
}

pub mod activation_params {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum NonlinearityType {
        #[prost(message, tag = "5")]
        Linear(super::ActivationLinear),
        #[prost(message, tag = "10")]
        ReLu(super::ActivationReLu),
        #[prost(message, tag = "15")]
        LeakyReLu(super::ActivationLeakyReLu),
        #[prost(message, tag = "30")]
        Tanh(super::ActivationTanh),
        #[prost(message, tag = "40")]
        Sigmoid(super::ActivationSigmoid),
    }
}

/// `alpha * x + beta`.
#[derive(Clone, PartialEq, Message)]
pub struct ActivationLinear {
    #[prost(float, tag = "1")]
    pub alpha: f32,
    #[prost(float, tag = "2")]
    pub beta: f32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ActivationReLu {}

#[derive(Clone, PartialEq, Message)]
pub struct ActivationLeakyReLu {
    #[prost(float, tag = "1")]
    pub alpha: f32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ActivationTanh {}

#[derive(Clone, PartialEq, Message)]
pub struct ActivationSigmoid {}

// ---- element-wise ----

#[derive(Clone, PartialEq, Message)]
pub struct AddLayerParams {
    #[prost(float, tag = "1")]
    pub alpha: f32,
}

#[derive(Clone, PartialEq, Message)]
pub struct MultiplyLayerParams {
    #[prost(float, tag = "1")]
    pub alpha: f32,
}

// ---- linear algebra ----

#[derive(Clone, PartialEq, Message)]
pub struct InnerProductLayerParams {
    #[prost(uint64, tag = "1")]
    pub input_channels: u64,
    #[prost(uint64, tag = "2")]
    pub output_channels: u64,
    #[prost(bool, tag = "10")]
    pub has_bias: bool,
    /// `[output_channels, input_channels]`, row-major.
    #[prost(message, optional, tag = "20")]
    pub weights: Option<WeightParams>,
    #[prost(message, optional, tag = "21")]
    pub bias: Option<WeightParams>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConvolutionLayerParams {
    #[prost(uint64, tag = "1")]
    pub output_channels: u64,
    #[prost(uint64, tag = "2")]
    pub kernel_channels: u64,
    #[prost(uint64, tag = "10")]
    pub n_groups: u64,
    #[prost(uint64, repeated, tag = "20")]
    pub kernel_size: Vec<u64>,
    #[prost(uint64, repeated, tag = "30")]
    pub stride: Vec<u64>,
    #[prost(uint64, repeated, tag = "40")]
    pub dilation_factor: Vec<u64>,
    #[prost(oneof = "convolution_layer_params::ConvolutionPaddingType", tags = "50, 51")]
    pub convolution_padding_type: Option<convolution_layer_params::ConvolutionPaddingType>,
    #[prost(bool, tag = "60")]
    pub is_deconvolution: bool,
    #[prost(bool, tag = "70")]
    pub has_bias: bool,
    /// `[output_channels, kernel_channels, kernel_h, kernel_w]`, row-major.
    #[prost(message, optional, tag = "90")]
    pub weights: Option<WeightParams>,
    #[prost(message, optional, tag = "91")]
    pub bias: Option<WeightParams>,
}

pub mod convolution_layer_params {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum ConvolutionPaddingType {
        #[prost(message, tag = "50")]
        Valid(super::ValidPadding),
        #[prost(message, tag = "51")]
        Same(super::SamePadding),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ValidPadding {
    #[prost(message, optional, tag = "1")]
    pub padding_amounts: Option<BorderAmounts>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BorderAmounts {
    /// One entry per spatial axis: height first, then width.
    #[prost(message, repeated, tag = "10")]
    pub border_amounts: Vec<EdgeSizes>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EdgeSizes {
    #[prost(uint64, tag = "1")]
    pub start_edge_size: u64,
    #[prost(uint64, tag = "2")]
    pub end_edge_size: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SamePadding {
    #[prost(enumeration = "SamePaddingMode", tag = "1")]
    pub asymmetry_mode: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum SamePaddingMode {
    BottomRightHeavy = 0,
    TopLeftHeavy = 1,
}

impl ValidPadding {
    /// Explicit `[top, bottom]` / `[left, right]` padding.
    pub fn with_borders(top: u64, bottom: u64, left: u64, right: u64) -> Self {
        Self {
            padding_amounts: Some(BorderAmounts {
                border_amounts: vec![
                    EdgeSizes {
                        start_edge_size: top,
                        end_edge_size: bottom,
                    },
                    EdgeSizes {
                        start_edge_size: left,
                        end_edge_size: right,
                    },
                ],
            }),
        }
    }
}

// ---- pooling ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum PoolingType {
    Max = 0,
    Average = 1,
    L2 = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct PoolingLayerParams {
    #[prost(enumeration = "PoolingType", tag = "1")]
    pub r#type: i32,
    #[prost(uint64, repeated, tag = "10")]
    pub kernel_size: Vec<u64>,
    #[prost(uint64, repeated, tag = "20")]
    pub stride: Vec<u64>,
    #[prost(oneof = "pooling_layer_params::PoolingPaddingType", tags = "30, 31")]
    pub pooling_padding_type: Option<pooling_layer_params::PoolingPaddingType>,
    #[prost(bool, tag = "50")]
    pub avg_pool_exclude_padding: bool,
    #[prost(bool, tag = "60")]
    pub global_pooling: bool,
}

pub mod pooling_layer_params {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PoolingPaddingType {
        #[prost(message, tag = "30")]
        Valid(super::ValidPadding),
        #[prost(message, tag = "31")]
        Same(super::SamePadding),
    }
}

// ---- constants and concatenation ----

#[derive(Clone, PartialEq, Message)]
pub struct LoadConstantLayerParams {
    #[prost(uint64, repeated, tag = "1")]
    pub shape: Vec<u64>,
    #[prost(message, optional, tag = "10")]
    pub data: Option<WeightParams>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConcatLayerParams {
    #[prost(bool, tag = "100")]
    pub sequence_concat: bool,
}

// ---- rank-N layers (specification version 4) ----

/// Softmax along a single axis of a rank-N tensor.
#[derive(Clone, PartialEq, Message)]
pub struct SoftmaxNdLayerParams {
    #[prost(int64, tag = "1")]
    pub axis: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TransposeLayerParams {
    #[prost(uint64, repeated, tag = "1")]
    pub axes: Vec<u64>,
}

/// Reshape to a fixed shape of the same element count, batch included.
#[derive(Clone, PartialEq, Message)]
pub struct ReshapeStaticLayerParams {
    #[prost(int64, repeated, tag = "1")]
    pub target_shape: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn model_roundtrip() {
        let model = Model {
            specification_version: SPECIFICATION_VERSION,
            description: Some(ModelDescription {
                input: vec![FeatureDescription::multi_array(
                    "x",
                    ArrayDataType::Float32,
                    &[1, 3],
                )],
                output: vec![FeatureDescription::multi_array(
                    "y",
                    ArrayDataType::Float32,
                    &[1, 3],
                )],
                metadata: Some(Metadata {
                    short_description: "test".into(),
                    author: "offload".into(),
                    ..Default::default()
                }),
            }),
            is_updatable: false,
            r#type: Some(model::Type::NeuralNetwork(NeuralNetwork {
                layers: vec![NeuralNetworkLayer::new(
                    "relu",
                    vec!["x".into()],
                    vec!["y".into()],
                    neural_network_layer::Layer::Activation(ActivationParams {
                        nonlinearity_type: Some(activation_params::NonlinearityType::ReLu(
                            ActivationReLu {},
                        )),
                    }),
                )],
                array_input_shape_mapping: NeuralNetworkMultiArrayShapeMapping::ExactArrayMapping
                    as i32,
            })),
        };

        let bytes = model.encode_to_vec();
        let decoded = Model::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, model);
        assert_eq!(decoded.layers().len(), 1);
        assert_eq!(decoded.layers()[0].kind(), "activation");
    }

    #[test]
    fn feature_description_array_type() {
        let f = FeatureDescription::multi_array("in", ArrayDataType::Float16, &[-1, 4]);
        let a = f.array_type().unwrap();
        assert_eq!(a.shape, vec![-1, 4]);
        assert_eq!(a.data_type, ArrayDataType::Float16 as i32);
    }

    #[test]
    fn valid_padding_borders_are_height_then_width() {
        let p = ValidPadding::with_borders(1, 2, 3, 4);
        let b = p.padding_amounts.unwrap().border_amounts;
        assert_eq!((b[0].start_edge_size, b[0].end_edge_size), (1, 2));
        assert_eq!((b[1].start_edge_size, b[1].end_edge_size), (3, 4));
    }

    #[test]
    fn empty_model_has_no_layers() {
        assert!(Model::default().layers().is_empty());
    }
}
