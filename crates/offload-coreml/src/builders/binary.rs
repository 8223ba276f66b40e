//! Element-wise binary operators: Add, Mul, Sub.
//!
//! Opsets before 7 carry the legacy `broadcast`/`axis` attributes, which the
//! backend layers cannot express, so the minimum opset is 7. Under
//! numpy-style broadcasting only identical shapes and scalar operands are
//! accepted.

use offload_graph::Dim;

use super::{LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES};
use crate::error::LoweringError;
use crate::helper::is_scalar_like;
use crate::proto::{
    activation_params::NonlinearityType, neural_network_layer::Layer, ActivationLinear,
    ActivationParams, AddLayerParams, MultiplyLayerParams,
};

const fn binary(op_type: &'static str, lower: super::LowerFn) -> LoweringUnit {
    LoweringUnit {
        op_type,
        min_opset: 7,
        min_inputs: 2,
        max_inputs: 2,
        min_outputs: 1,
        max_outputs: 1,
        supported_types: FLOAT_TYPES,
        initializer_inputs: &[],
        check: check_broadcast,
        lower,
    }
}

pub(super) const UNITS: &[LoweringUnit] = &[
    binary("Add", lower_add),
    binary("Mul", lower_mul),
    binary("Sub", lower_sub),
];

fn check_broadcast(ctx: &NodeContext<'_>) -> Result<(), String> {
    let (Some(a), Some(b)) = (ctx.input_shape(0), ctx.input_shape(1)) else {
        return Ok(());
    };
    if is_scalar_like(a) || is_scalar_like(b) || same_shape(a, b) {
        Ok(())
    } else {
        Err(format!(
            "broadcast between {} and {} is not supported",
            fmt_shape(a),
            fmt_shape(b)
        ))
    }
}

/// Equal rank, and equal wherever both dims are fixed.
fn same_shape(a: &[Dim], b: &[Dim]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x.fixed(), y.fixed()) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        })
}

fn fmt_shape(dims: &[Dim]) -> String {
    let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

fn lower_add(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into(), ctx.input_name(1)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Add(AddLayerParams::default()),
    );
    Ok(())
}

fn lower_mul(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into(), ctx.input_name(1)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Multiply(MultiplyLayerParams::default()),
    );
    Ok(())
}

/// `a - b` as `a + (-1 * b)`.
fn lower_sub(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let a = ctx.input_name(0)?;
    let b = ctx.input_name(1)?;
    let y = ctx.output_name(0)?;
    let negated = batch.intermediate(&format!("{y}_neg"));
    batch.push(
        &format!("{}_neg", ctx.layer_hint()),
        vec![b.into()],
        vec![negated.clone()],
        Layer::Activation(ActivationParams {
            nonlinearity_type: Some(NonlinearityType::Linear(ActivationLinear {
                alpha: -1.0,
                beta: 0.0,
            })),
        }),
    );
    batch.push(
        ctx.layer_hint(),
        vec![a.into(), negated],
        vec![y.into()],
        Layer::Add(AddLayerParams::default()),
    );
    Ok(())
}
