//! Reshape with a constant target shape, lowered to `reshapeStatic`.

use offload_graph::{DataType, Dim};

use super::{checked_volume, LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES, MAX_ND_RANK};
use crate::error::LoweringError;
use crate::proto::{neural_network_layer::Layer, ReshapeStaticLayerParams};

pub(super) const UNITS: &[LoweringUnit] = &[LoweringUnit {
    op_type: "Reshape",
    // The shape moved from an attribute to an input in opset 5.
    min_opset: 5,
    min_inputs: 2,
    max_inputs: 2,
    min_outputs: 1,
    max_outputs: 1,
    supported_types: FLOAT_TYPES,
    initializer_inputs: &[1],
    check: check_reshape,
    lower: lower_reshape,
}];

/// The concrete output shape: `0` entries copy the input dimension and a
/// `-1` is inferred from the input's element count.
fn target_shape(ctx: &NodeContext<'_>) -> Result<Vec<i64>, String> {
    let init = ctx
        .initializer(1)
        .ok_or("shape must be a constant initializer")?;
    if init.data_type != DataType::Int64 || init.dims.len() != 1 {
        return Err(format!(
            "shape must be a 1-D int64 tensor, found {} {:?}",
            init.data_type, init.dims
        ));
    }
    let mut shape = init.to_i64_vec().ok_or("unreadable shape tensor")?;
    if shape.is_empty() || shape.len() > MAX_ND_RANK {
        return Err(format!(
            "target rank {} is outside 1..={MAX_ND_RANK}",
            shape.len()
        ));
    }
    let input: Vec<i64> = ctx
        .input_shape(0)
        .and_then(|s| s.iter().map(Dim::fixed).collect())
        .ok_or("input shape must be static")?;
    let total = checked_volume(input.iter().copied())?;
    let allow_zero = ctx.node.attr_int("allowzero", 0) != 0;

    for (i, d) in shape.iter_mut().enumerate() {
        if *d == 0 {
            if allow_zero {
                return Err("zero-sized dimensions are not supported".into());
            }
            *d = *input
                .get(i)
                .ok_or_else(|| format!("dimension {i} copies past input rank {}", input.len()))?;
        } else if *d < -1 {
            return Err(format!("invalid dimension {d}"));
        }
    }

    let inferred: Vec<usize> = (0..shape.len()).filter(|&i| shape[i] == -1).collect();
    match inferred.as_slice() {
        [] => {}
        [at] => {
            let known = checked_volume(shape.iter().copied().filter(|&d| d != -1))?;
            if known == 0 || total % known != 0 {
                return Err(format!("cannot infer -1 from {total} elements"));
            }
            shape[*at] = total / known;
        }
        _ => return Err("at most one dimension may be -1".into()),
    }

    if checked_volume(shape.iter().copied())? != total {
        return Err(format!("target shape {shape:?} does not hold {total} elements"));
    }
    Ok(shape)
}

fn check_reshape(ctx: &NodeContext<'_>) -> Result<(), String> {
    target_shape(ctx).map(|_| ())
}

fn lower_reshape(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let target_shape = target_shape(ctx).map_err(|reason| LoweringError::InvalidAttribute {
        name: "shape".into(),
        reason,
    })?;
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::ReshapeStatic(ReshapeStaticLayerParams { target_shape }),
    );
    Ok(())
}
