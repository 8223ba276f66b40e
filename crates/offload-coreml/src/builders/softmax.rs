//! Softmax along one axis, lowered to `softmaxND`.

use super::{LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES, MAX_ND_RANK};
use crate::error::LoweringError;
use crate::proto::{neural_network_layer::Layer, SoftmaxNdLayerParams};

pub(super) const UNITS: &[LoweringUnit] = &[LoweringUnit {
    op_type: "Softmax",
    min_opset: 1,
    min_inputs: 1,
    max_inputs: 1,
    min_outputs: 1,
    max_outputs: 1,
    supported_types: FLOAT_TYPES,
    initializer_inputs: &[],
    check: check_softmax,
    lower: lower_softmax,
}];

/// Opset 13 changed the default axis from 1 to -1.
fn default_axis(opset: i64) -> i64 {
    if opset >= 13 {
        -1
    } else {
        1
    }
}

/// The softmax axis as a non-negative index into the input shape.
fn softmax_axis(ctx: &NodeContext<'_>) -> Result<i64, String> {
    let rank = ctx.input_rank(0).ok_or("input rank must be known")?;
    if rank == 0 || rank > MAX_ND_RANK {
        return Err(format!("rank {rank} is outside 1..={MAX_ND_RANK}"));
    }
    let rank = rank as i64;
    let axis = ctx.node.attr_int("axis", default_axis(ctx.opset));
    if axis < -rank || axis >= rank {
        return Err(format!("axis {axis} is out of range for rank {rank}"));
    }
    let normalized = if axis < 0 { axis + rank } else { axis };
    // Before opset 13 the input is coerced to 2-D at `axis`; that equals a
    // single-axis softmax only when `axis` is the last dimension.
    if ctx.opset < 13 && normalized != rank - 1 {
        return Err(format!(
            "axis {axis} is not the last of {rank} dimensions (opset {})",
            ctx.opset
        ));
    }
    Ok(normalized)
}

fn check_softmax(ctx: &NodeContext<'_>) -> Result<(), String> {
    softmax_axis(ctx).map(|_| ())
}

fn lower_softmax(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let axis = softmax_axis(ctx).map_err(|reason| LoweringError::InvalidAttribute {
        name: "axis".into(),
        reason,
    })?;
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::SoftmaxNd(SoftmaxNdLayerParams { axis }),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use offload_graph::{Attribute, HostGraph, Node, NodeId};

    use super::super::test_util::*;
    use super::*;

    fn softmax_graph(opset: i64, dims: &[i64], axis: Option<i64>) -> (HostGraph, NodeId) {
        let mut g = graph(opset);
        let x = f32_input(&mut g, "x", dims);
        let y = f32_value(&mut g, "y", dims);
        let mut node = Node::new("Softmax", "sm").with_io(&[x], &[y]);
        if let Some(a) = axis {
            node = node.with_attr("axis", Attribute::Int(a));
        }
        let id = add(&mut g, node);
        (g, id)
    }

    fn check_axis(opset: i64, dims: &[i64], axis: Option<i64>) -> Result<(), String> {
        let (g, id) = softmax_graph(opset, dims, axis);
        check(&unit("Softmax"), &g, id)
    }

    fn lowered_axis(opset: i64, dims: &[i64], axis: Option<i64>) -> i64 {
        let (g, id) = softmax_graph(opset, dims, axis);
        match lower(&unit("Softmax"), &g, id).remove(0).layer {
            Some(Layer::SoftmaxNd(p)) => p.axis,
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn default_axis_depends_on_opset() {
        assert!(check_axis(13, &[2, 3, 4], None).is_ok());
        assert!(check_axis(11, &[2, 3, 4], None).is_err());
        assert!(check_axis(11, &[2, 10], None).is_ok());
    }

    #[test]
    fn any_axis_from_opset_13() {
        assert!(check_axis(13, &[2, 3, 4], Some(2)).is_ok());
        assert!(check_axis(13, &[2, 3, 4], Some(-1)).is_ok());
        assert!(check_axis(13, &[2, 3, 4], Some(1)).is_ok());
        assert!(check_axis(12, &[2, 3, 4], Some(1)).is_err());
        assert!(check_axis(13, &[2, 3, 4], Some(3)).is_err());
        assert!(check_axis(13, &[2, 3, 4], Some(-4)).is_err());
    }

    #[test]
    fn rank_limits() {
        assert!(check_axis(13, &[], None).is_err());
        assert!(check_axis(13, &[1, 1, 1, 1, 1, 2], None).is_err());
    }

    #[test]
    fn last_axis_of_nchw_is_width() {
        assert_eq!(lowered_axis(13, &[1, 3, 4, 4], Some(-1)), 3);
        assert_eq!(lowered_axis(13, &[1, 3, 4, 4], Some(1)), 1);
        assert_eq!(lowered_axis(11, &[1, 5], None), 1);
    }

    #[test]
    fn lowers_to_softmax_nd_layer() {
        let (g, id) = softmax_graph(13, &[1, 5], None);
        assert_eq!(lower(&unit("Softmax"), &g, id)[0].kind(), "softmaxND");
    }
}
