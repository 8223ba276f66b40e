//! Transpose, lowered to the rank-N `transpose` layer.

use super::{LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES, MAX_ND_RANK};
use crate::error::LoweringError;
use crate::proto::{neural_network_layer::Layer, TransposeLayerParams};

pub(super) const UNITS: &[LoweringUnit] = &[LoweringUnit {
    op_type: "Transpose",
    min_opset: 1,
    min_inputs: 1,
    max_inputs: 1,
    min_outputs: 1,
    max_outputs: 1,
    supported_types: FLOAT_TYPES,
    initializer_inputs: &[],
    check: check_transpose,
    lower: lower_transpose,
}];

/// The node's permutation, defaulting to reversed axes.
fn permutation(ctx: &NodeContext<'_>) -> Result<Vec<usize>, String> {
    let rank = ctx.input_rank(0).ok_or("input rank must be known")?;
    let perm: Vec<usize> = match ctx.node.attr_ints("perm") {
        Some(p) => p
            .iter()
            .map(|&a| usize::try_from(a).map_err(|_| format!("negative axis {a} in perm")))
            .collect::<Result<_, _>>()?,
        None => (0..rank).rev().collect(),
    };
    let mut seen = vec![false; rank];
    if perm.len() != rank {
        return Err(format!("perm {perm:?} does not match rank {rank}"));
    }
    for &a in &perm {
        if a >= rank || std::mem::replace(&mut seen[a], true) {
            return Err(format!("perm {perm:?} is not a permutation"));
        }
    }
    Ok(perm)
}

fn check_transpose(ctx: &NodeContext<'_>) -> Result<(), String> {
    let perm = permutation(ctx)?;
    if perm.len() > MAX_ND_RANK {
        return Err(format!("rank {} exceeds {MAX_ND_RANK}", perm.len()));
    }
    Ok(())
}

fn lower_transpose(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let perm = permutation(ctx).map_err(|reason| LoweringError::InvalidAttribute {
        name: "perm".into(),
        reason,
    })?;
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Transpose(TransposeLayerParams {
            axes: perm.iter().map(|&a| a as u64).collect(),
        }),
    );
    Ok(())
}
