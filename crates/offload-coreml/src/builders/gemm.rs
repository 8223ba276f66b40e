//! Gemm and MatMul lowered to `innerProduct`.
//!
//! The weight operand must be a constant initializer; it is consumed in
//! place and emitted as `[N, K]` row-major.

use super::{
    require_float_initializer, require_rank, LayerBatch, LoweringUnit, NodeContext, FLOAT_TYPES,
};
use crate::error::LoweringError;
use crate::proto::{neural_network_layer::Layer, InnerProductLayerParams};

pub(super) const UNITS: &[LoweringUnit] = &[
    LoweringUnit {
        op_type: "Gemm",
        // Opset 6 and earlier carry a `broadcast` attribute.
        min_opset: 7,
        min_inputs: 2,
        max_inputs: 3,
        min_outputs: 1,
        max_outputs: 1,
        supported_types: FLOAT_TYPES,
        initializer_inputs: &[1, 2],
        check: check_gemm,
        lower: lower_gemm,
    },
    LoweringUnit {
        op_type: "MatMul",
        min_opset: 1,
        min_inputs: 2,
        max_inputs: 2,
        min_outputs: 1,
        max_outputs: 1,
        supported_types: FLOAT_TYPES,
        initializer_inputs: &[1],
        check: check_matmul,
        lower: lower_matmul,
    },
];

/// `(K, N)` of the weight operand.
fn weight_dims(dims: &[i64], transposed: bool) -> (i64, i64) {
    if transposed {
        (dims[1], dims[0])
    } else {
        (dims[0], dims[1])
    }
}

fn check_inner_dim(ctx: &NodeContext<'_>, k: i64) -> Result<(), String> {
    let last = ctx
        .input_shape(0)
        .and_then(|s| s.last())
        .and_then(|d| d.fixed());
    match last {
        Some(a) if a != k => Err(format!("inner dimension mismatch: A has {a}, B has {k}")),
        _ => Ok(()),
    }
}

fn check_gemm(ctx: &NodeContext<'_>) -> Result<(), String> {
    let node = ctx.node;
    require_rank(ctx, 0, 2)?;
    let b = require_float_initializer(ctx, 1, 2)?;
    if node.attr_int("transA", 0) != 0 {
        return Err("transA is not supported".into());
    }
    let alpha = node.attr_float("alpha", 1.0);
    if alpha != 1.0 {
        return Err(format!("alpha {alpha} is not supported"));
    }
    let (k, n) = weight_dims(&b.dims, node.attr_int("transB", 0) != 0);
    check_inner_dim(ctx, k)?;

    if node.input(2).is_some() {
        let beta = node.attr_float("beta", 1.0);
        if beta != 1.0 {
            return Err(format!("beta {beta} is not supported"));
        }
        let c = ctx
            .initializer(2)
            .ok_or("bias C must be a constant initializer")?;
        if c.dims != [n] && c.dims != [1, n] {
            return Err(format!("bias shape {:?} is not [{n}] or [1, {n}]", c.dims));
        }
        if !FLOAT_TYPES.contains(c.data_type) {
            return Err(format!("bias has type {}, expected float", c.data_type));
        }
    }
    Ok(())
}

fn check_matmul(ctx: &NodeContext<'_>) -> Result<(), String> {
    require_rank(ctx, 0, 2)?;
    let b = require_float_initializer(ctx, 1, 2)?;
    check_inner_dim(ctx, b.dims[0])
}

/// Row-major `[rows, cols]` to `[cols, rows]`.
fn transpose(values: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; values.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = values[r * cols + c];
        }
    }
    out
}

fn inner_product(
    ctx: &NodeContext<'_>,
    batch: &mut LayerBatch<'_>,
    transposed: bool,
    bias: Option<Vec<f32>>,
) -> Result<(), LoweringError> {
    let b = ctx.require_initializer(1)?;
    let (k, n) = weight_dims(&b.dims, transposed);
    let values = ctx.weight_values(1)?;
    let weights = if transposed {
        values
    } else {
        transpose(&values, k as usize, n as usize)
    };
    let params = InnerProductLayerParams {
        input_channels: k as u64,
        output_channels: n as u64,
        has_bias: bias.is_some(),
        weights: Some(ctx.weight(&weights)),
        bias: bias.map(|v| ctx.weight(&v)),
    };
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::InnerProduct(params),
    );
    Ok(())
}

fn lower_gemm(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let bias = match ctx.node.input(2) {
        Some(_) => Some(ctx.weight_values(2)?),
        None => None,
    };
    inner_product(ctx, batch, ctx.node.attr_int("transB", 0) != 0, bias)
}

fn lower_matmul(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    inner_product(ctx, batch, false, None)
}

#[cfg(test)]
mod tests {
    use offload_graph::{Attribute, HostGraph, Initializer, Node, NodeId};

    use super::super::test_util::*;
    use super::*;
    use crate::options::PrecisionPolicy;

    /// `x[2, 3] @ w` with `w` stored as given.
    fn gemm_graph(w_dims: &[i64], w: &[f32], bias: Option<&[f32]>, attrs: &[(&str, Attribute)]) -> (HostGraph, NodeId) {
        let mut g = graph(13);
        let x = f32_input(&mut g, "x", &[2, 3]);
        let w = g.add_initializer("w", Initializer::from_f32(w_dims, w)).unwrap();
        let mut inputs = vec![x, w];
        if let Some(c) = bias {
            inputs.push(
                g.add_initializer("c", Initializer::from_f32(&[c.len() as i64], c))
                    .unwrap(),
            );
        }
        let y = f32_value(&mut g, "y", &[2, 2]);
        let mut node = Node::new("Gemm", "fc").with_io(&inputs, &[y]);
        for (k, v) in attrs {
            node = node.with_attr(*k, v.clone());
        }
        let id = add(&mut g, node);
        (g, id)
    }

    fn params(g: &HostGraph, id: NodeId, op: &str) -> InnerProductLayerParams {
        match lower(&unit(op), g, id).remove(0).layer {
            Some(Layer::InnerProduct(p)) => p,
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn gemm_transposes_b_into_n_by_k() {
        // B is [K=3, N=2].
        let (g, id) = gemm_graph(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Some(&[0.5, -0.5]), &[]);
        assert!(check(&unit("Gemm"), &g, id).is_ok());
        let p = params(&g, id, "Gemm");
        assert_eq!((p.input_channels, p.output_channels), (3, 2));
        assert!(p.has_bias);
        assert_eq!(
            p.weights.unwrap().float_value,
            vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]
        );
        assert_eq!(p.bias.unwrap().float_value, vec![0.5, -0.5]);
    }

    #[test]
    fn gemm_trans_b_keeps_layout() {
        let (g, id) = gemm_graph(
            &[2, 3],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            None,
            &[("transB", Attribute::Int(1))],
        );
        assert!(check(&unit("Gemm"), &g, id).is_ok());
        let p = params(&g, id, "Gemm");
        assert!(!p.has_bias);
        assert_eq!(
            p.weights.unwrap().float_value,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
    }

    #[test]
    fn gemm_float16_policy() {
        let (g, id) = gemm_graph(&[3, 2], &[1.0; 6], None, &[]);
        let layers = lower_with(&unit("Gemm"), &g, id, PrecisionPolicy::Float16);
        match &layers[0].layer {
            Some(Layer::InnerProduct(p)) => {
                let w = p.weights.as_ref().unwrap();
                assert!(w.float_value.is_empty());
                assert_eq!(w.float16_value.len(), 12);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn gemm_rejects_unsupported_attributes() {
        let w = [0.0; 6];
        for (attr, value) in [
            ("transA", Attribute::Int(1)),
            ("alpha", Attribute::Float(2.0)),
        ] {
            let (g, id) = gemm_graph(&[3, 2], &w, None, &[(attr, value)]);
            assert!(check(&unit("Gemm"), &g, id).is_err(), "{attr}");
        }
        let (g, id) = gemm_graph(&[3, 2], &w, Some(&[0.0, 0.0]), &[("beta", Attribute::Float(0.5))]);
        assert!(check(&unit("Gemm"), &g, id).unwrap_err().contains("beta"));
    }

    #[test]
    fn gemm_rejects_mismatched_bias_and_inner_dim() {
        let (g, id) = gemm_graph(&[3, 2], &[0.0; 6], Some(&[0.0, 0.0, 0.0]), &[]);
        assert!(check(&unit("Gemm"), &g, id).unwrap_err().contains("bias"));
        let (g, id) = gemm_graph(&[4, 2], &[0.0; 8], None, &[]);
        assert!(check(&unit("Gemm"), &g, id).unwrap_err().contains("inner"));
    }

    #[test]
    fn matmul_requires_constant_b() {
        let mut g = graph(13);
        let x = f32_input(&mut g, "x", &[2, 3]);
        let w = f32_input(&mut g, "w", &[3, 2]);
        let y = f32_value(&mut g, "y", &[2, 2]);
        let id = add(&mut g, Node::new("MatMul", "mm").with_io(&[x, w], &[y]));
        let err = check(&unit("MatMul"), &g, id).unwrap_err();
        assert!(err.contains("initializer"), "{err}");
    }

    #[test]
    fn matmul_lowers_without_bias() {
        let mut g = graph(13);
        let x = f32_input(&mut g, "x", &[1, 2]);
        let w = g
            .add_initializer("w", Initializer::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let y = f32_value(&mut g, "y", &[1, 2]);
        let id = add(&mut g, Node::new("MatMul", "mm").with_io(&[x, w], &[y]));
        assert!(check(&unit("MatMul"), &g, id).is_ok());
        let p = params(&g, id, "MatMul");
        assert!(!p.has_bias && p.bias.is_none());
        assert_eq!(p.weights.unwrap().float_value, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn transpose_helper() {
        assert_eq!(transpose(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }
}
