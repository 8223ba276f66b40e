//! Max/average pooling, windowed and global.

use super::conv::{strides, Padding};
use super::{ints_of_len, require_rank, to_u64, LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES};
use crate::error::LoweringError;
use crate::proto::{
    neural_network_layer::Layer, pooling_layer_params::PoolingPaddingType, PoolingLayerParams,
    PoolingType, ValidPadding,
};

const fn pooling(op_type: &'static str, check: super::CheckFn, lower: super::LowerFn) -> LoweringUnit {
    LoweringUnit {
        op_type,
        min_opset: 1,
        min_inputs: 1,
        max_inputs: 1,
        min_outputs: 1,
        // MaxPool's optional `Indices` output has no backend counterpart.
        max_outputs: 1,
        supported_types: FLOAT_TYPES,
        initializer_inputs: &[],
        check,
        lower,
    }
}

pub(super) const UNITS: &[LoweringUnit] = &[
    pooling("MaxPool", check_pool, lower_pool),
    pooling("AveragePool", check_pool, lower_pool),
    pooling("GlobalAveragePool", check_global, lower_global),
    pooling("GlobalMaxPool", check_global, lower_global),
];

fn pool_type(op_type: &str) -> PoolingType {
    if op_type.contains("Max") {
        PoolingType::Max
    } else {
        PoolingType::Average
    }
}

fn check_pool(ctx: &NodeContext<'_>) -> Result<(), String> {
    let node = ctx.node;
    require_rank(ctx, 0, 4)?;
    let kernel = ints_of_len(node, "kernel_shape", 2)?
        .ok_or("kernel_shape must be a 2-D window")?;
    if kernel.iter().any(|&k| k < 1) {
        return Err(format!("kernel_shape {kernel:?} must be positive"));
    }
    strides(node)?;
    Padding::from_node(node)?;
    if node.attr_int("ceil_mode", 0) != 0 {
        return Err("ceil_mode is not supported".into());
    }
    if node.attr_int("storage_order", 0) != 0 {
        return Err("column-major storage_order is not supported".into());
    }
    if let Some(d) = node.attr_ints("dilations") {
        if d.iter().any(|&d| d != 1) {
            return Err(format!("dilations {d:?} are not supported"));
        }
    }
    Ok(())
}

fn lower_pool(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let node = ctx.node;
    let invalid = |name: &str, reason: String| LoweringError::InvalidAttribute {
        name: name.into(),
        reason,
    };
    let padding = Padding::from_node(node).map_err(|r| invalid("auto_pad", r))?;
    let strides = strides(node).map_err(|r| invalid("strides", r))?;
    let kernel = node
        .attr_ints("kernel_shape")
        .ok_or_else(|| invalid("kernel_shape", "missing".into()))?;
    let kind = pool_type(&node.op_type);

    let params = PoolingLayerParams {
        r#type: kind as i32,
        kernel_size: to_u64(kernel, "kernel_shape")?,
        stride: to_u64(&strides, "strides")?,
        pooling_padding_type: Some(match padding.valid() {
            Some(valid) => PoolingPaddingType::Valid(valid),
            None => PoolingPaddingType::Same(padding.same().unwrap_or_default()),
        }),
        avg_pool_exclude_padding: kind == PoolingType::Average
            && node.attr_int("count_include_pad", 0) == 0,
        global_pooling: false,
    };
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Pooling(params),
    );
    Ok(())
}

fn check_global(ctx: &NodeContext<'_>) -> Result<(), String> {
    require_rank(ctx, 0, 4)
}

fn lower_global(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let params = PoolingLayerParams {
        r#type: pool_type(&ctx.node.op_type) as i32,
        kernel_size: vec![1, 1],
        stride: vec![1, 1],
        pooling_padding_type: Some(PoolingPaddingType::Valid(ValidPadding::default())),
        avg_pool_exclude_padding: false,
        global_pooling: true,
    };
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Pooling(params),
    );
    Ok(())
}
