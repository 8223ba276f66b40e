//! Unary activations mapped onto the `activation` layer.

use super::{LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES};
use crate::error::LoweringError;
use crate::proto::{
    activation_params::NonlinearityType, neural_network_layer::Layer, ActivationLeakyReLu,
    ActivationParams, ActivationReLu, ActivationSigmoid, ActivationTanh,
};

/// ONNX default for `LeakyRelu.alpha`.
const LEAKY_RELU_ALPHA: f32 = 0.01;

const fn activation(op_type: &'static str) -> LoweringUnit {
    LoweringUnit {
        op_type,
        // Opset 6 dropped the legacy `consumed_inputs` attribute.
        min_opset: 6,
        min_inputs: 1,
        max_inputs: 1,
        min_outputs: 1,
        max_outputs: 1,
        supported_types: FLOAT_TYPES,
        initializer_inputs: &[],
        check: super::no_structural_check,
        lower: lower_activation,
    }
}

pub(super) const UNITS: &[LoweringUnit] = &[
    activation("Relu"),
    activation("Sigmoid"),
    activation("Tanh"),
    activation("LeakyRelu"),
];

fn nonlinearity(ctx: &NodeContext<'_>) -> Result<NonlinearityType, LoweringError> {
    Ok(match ctx.node.op_type.as_str() {
        "Relu" => NonlinearityType::ReLu(ActivationReLu {}),
        "Sigmoid" => NonlinearityType::Sigmoid(ActivationSigmoid {}),
        "Tanh" => NonlinearityType::Tanh(ActivationTanh {}),
        "LeakyRelu" => NonlinearityType::LeakyReLu(ActivationLeakyReLu {
            alpha: ctx.node.attr_float("alpha", LEAKY_RELU_ALPHA),
        }),
        other => return Err(LoweringError::Other(format!("not an activation: {other}"))),
    })
}

fn lower_activation(
    ctx: &NodeContext<'_>,
    batch: &mut LayerBatch<'_>,
) -> Result<(), LoweringError> {
    let params = ActivationParams {
        nonlinearity_type: Some(nonlinearity(ctx)?),
    };
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Activation(params),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use offload_graph::{Attribute, Node};

    use super::super::test_util::*;
    use super::*;

    fn lowered(node: Node) -> NonlinearityType {
        let mut g = graph(13);
        let x = f32_input(&mut g, "x", &[1, 8]);
        let y = f32_value(&mut g, "y", &[1, 8]);
        let op = node.op_type.clone();
        let id = add(&mut g, node.with_io(&[x], &[y]));
        let layers = lower(&unit(&op), &g, id);
        assert_eq!(layers.len(), 1);
        match layers[0].layer.clone() {
            Some(Layer::Activation(p)) => p.nonlinearity_type.unwrap(),
            other => panic!("expected activation, got {other:?}"),
        }
    }

    #[test]
    fn each_kind_maps_to_its_nonlinearity() {
        assert!(matches!(lowered(Node::new("Relu", "r")), NonlinearityType::ReLu(_)));
        assert!(matches!(lowered(Node::new("Sigmoid", "s")), NonlinearityType::Sigmoid(_)));
        assert!(matches!(lowered(Node::new("Tanh", "t")), NonlinearityType::Tanh(_)));
    }

    #[test]
    fn leaky_relu_alpha() {
        match lowered(Node::new("LeakyRelu", "l")) {
            NonlinearityType::LeakyReLu(p) => assert_eq!(p.alpha, 0.01),
            other => panic!("{other:?}"),
        }
        let node = Node::new("LeakyRelu", "l").with_attr("alpha", Attribute::Float(0.2));
        match lowered(node) {
            NonlinearityType::LeakyReLu(p) => assert_eq!(p.alpha, 0.2),
            other => panic!("{other:?}"),
        }
    }
}
