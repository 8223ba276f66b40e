//! 2-D convolution, and the spatial padding rules shared with pooling.

use offload_graph::Node;

use super::{
    ints_of_len, require_float_initializer, require_rank, to_u64, LayerBatch, LoweringUnit,
    NodeContext, FLOAT_TYPES,
};
use crate::error::LoweringError;
use crate::proto::{
    convolution_layer_params::ConvolutionPaddingType, neural_network_layer::Layer,
    ConvolutionLayerParams, SamePadding, SamePaddingMode, ValidPadding,
};

pub(super) const UNITS: &[LoweringUnit] = &[LoweringUnit {
    op_type: "Conv",
    min_opset: 1,
    min_inputs: 2,
    max_inputs: 3,
    min_outputs: 1,
    max_outputs: 1,
    supported_types: FLOAT_TYPES,
    initializer_inputs: &[1, 2],
    check: check_conv,
    lower: lower_conv,
}];

/// Resolved spatial padding for a 2-D window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Padding {
    /// Explicit `[top, left, bottom, right]` amounts.
    Explicit([u64; 4]),
    SameUpper,
    SameLower,
}

impl Padding {
    /// Reads `auto_pad` and `pads`.
    pub(super) fn from_node(node: &Node) -> Result<Self, String> {
        let pads = ints_of_len(node, "pads", 4)?;
        match node.attr_string("auto_pad").unwrap_or("NOTSET") {
            "NOTSET" => {
                let pads = pads.unwrap_or_else(|| vec![0; 4]);
                let mut out = [0u64; 4];
                for (slot, &p) in out.iter_mut().zip(&pads) {
                    *slot = u64::try_from(p).map_err(|_| format!("negative pad {p}"))?;
                }
                Ok(Self::Explicit(out))
            }
            "VALID" => Ok(Self::Explicit([0; 4])),
            "SAME_UPPER" => Ok(Self::SameUpper),
            "SAME_LOWER" => Ok(Self::SameLower),
            other => Err(format!("auto_pad '{other}' is not supported")),
        }
    }

    pub(super) fn valid(self) -> Option<ValidPadding> {
        match self {
            Self::Explicit([top, left, bottom, right]) => {
                Some(ValidPadding::with_borders(top, bottom, left, right))
            }
            _ => None,
        }
    }

    pub(super) fn same(self) -> Option<SamePadding> {
        let mode = match self {
            Self::SameUpper => SamePaddingMode::BottomRightHeavy,
            Self::SameLower => SamePaddingMode::TopLeftHeavy,
            Self::Explicit(_) => return None,
        };
        Some(SamePadding {
            asymmetry_mode: mode as i32,
        })
    }
}

/// `[h, w]` strides, defaulting to 1.
pub(super) fn strides(node: &Node) -> Result<Vec<i64>, String> {
    let strides = ints_of_len(node, "strides", 2)?.unwrap_or_else(|| vec![1, 1]);
    if strides.iter().any(|&s| s < 1) {
        return Err(format!("strides {strides:?} must be positive"));
    }
    Ok(strides)
}

fn check_conv(ctx: &NodeContext<'_>) -> Result<(), String> {
    let node = ctx.node;
    require_rank(ctx, 0, 4)?;
    let w = require_float_initializer(ctx, 1, 4)?;
    if let Some(kernel) = ints_of_len(node, "kernel_shape", 2)? {
        if kernel[..] != w.dims[2..] {
            return Err(format!(
                "kernel_shape {kernel:?} disagrees with weight dims {:?}",
                w.dims
            ));
        }
    } else if node.has_attr("kernel_shape") {
        return Err("only 2-D kernels are supported".into());
    }
    strides(node)?;
    let dilations = ints_of_len(node, "dilations", 2)?.unwrap_or_else(|| vec![1, 1]);
    if dilations.iter().any(|&d| d < 1) {
        return Err(format!("dilations {dilations:?} must be positive"));
    }
    Padding::from_node(node)?;

    let group = node.attr_int("group", 1);
    if group < 1 || w.dims[0] % group != 0 {
        return Err(format!(
            "group {group} does not divide {} output channels",
            w.dims[0]
        ));
    }
    let expected = w.dims[1]
        .checked_mul(group)
        .ok_or_else(|| format!("group {group} overflows the channel count"))?;
    let channels = ctx.input_shape(0).and_then(|s| s[1].fixed());
    if let Some(c) = channels {
        if c != expected {
            return Err(format!("input has {c} channels, weights expect {expected}"));
        }
    }

    if node.input(2).is_some() {
        let b = require_float_initializer(ctx, 2, 1)?;
        if b.dims[0] != w.dims[0] {
            return Err(format!(
                "bias has {} entries, expected {}",
                b.dims[0], w.dims[0]
            ));
        }
    }
    Ok(())
}

fn lower_conv(ctx: &NodeContext<'_>, batch: &mut LayerBatch<'_>) -> Result<(), LoweringError> {
    let node = ctx.node;
    let w = ctx.require_initializer(1)?;
    let invalid = |name: &str, reason: String| LoweringError::InvalidAttribute {
        name: name.into(),
        reason,
    };
    let padding = Padding::from_node(node).map_err(|r| invalid("auto_pad", r))?;
    let strides = strides(node).map_err(|r| invalid("strides", r))?;
    let dilations = node.attr_ints("dilations").unwrap_or(&[1, 1]);

    let bias = match node.input(2) {
        Some(_) => Some(ctx.weight(&ctx.weight_values(2)?)),
        None => None,
    };
    let dims = to_u64(&w.dims, "W")?;
    let params = ConvolutionLayerParams {
        output_channels: dims[0],
        kernel_channels: dims[1],
        n_groups: u64::try_from(node.attr_int("group", 1))
            .map_err(|_| invalid("group", "must be positive".into()))?,
        kernel_size: dims[2..].to_vec(),
        stride: to_u64(&strides, "strides")?,
        dilation_factor: to_u64(dilations, "dilations")?,
        convolution_padding_type: Some(match padding.valid() {
            Some(valid) => ConvolutionPaddingType::Valid(valid),
            None => ConvolutionPaddingType::Same(padding.same().unwrap_or_default()),
        }),
        is_deconvolution: false,
        has_bias: bias.is_some(),
        // ONNX `[M, C/group, kH, kW]` matches the backend layout.
        weights: Some(ctx.weight(&ctx.weight_values(1)?)),
        bias,
    };
    batch.push(
        ctx.layer_hint(),
        vec![ctx.input_name(0)?.into()],
        vec![ctx.output_name(0)?.into()],
        Layer::Convolution(params),
    );
    Ok(())
}
