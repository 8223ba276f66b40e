//! Channel-axis concatenation.

use super::{require_rank, LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES};
use crate::error::LoweringError;
use crate::proto::{neural_network_layer::Layer, ConcatLayerParams};

pub(super) const UNITS: &[LoweringUnit] = &[LoweringUnit {
    op_type: "Concat",
    // `axis` became required in opset 4.
    min_opset: 4,
    min_inputs: 2,
    max_inputs: usize::MAX,
    min_outputs: 1,
    max_outputs: 1,
    supported_types: FLOAT_TYPES,
    initializer_inputs: &[],
    check: check_concat,
    lower: lower_concat,
}];

fn check_concat(ctx: &NodeContext<'_>) -> Result<(), String> {
    for i in 0..ctx.node.inputs.len() {
        require_rank(ctx, i, 4)?;
    }
    match ctx.node.attr_int("axis", i64::MIN) {
        1 | -3 => Ok(()),
        i64::MIN => Err("axis is required".into()),
        axis => Err(format!("concat along axis {axis} is not supported")),
    }
}

fn lower_concat(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let inputs = (0..ctx.node.inputs.len())
        .map(|i| ctx.input_name(i).map(String::from))
        .collect::<Result<Vec<_>, _>>()?;
    batch.push(
        ctx.layer_hint(),
        inputs,
        vec![ctx.output_name(0)?.into()],
        Layer::Concat(ConcatLayerParams {
            sequence_concat: false,
        }),
    );
    Ok(())
}
