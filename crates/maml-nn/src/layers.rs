//! Functional layers that draw their weights from a [`ParamSource`].
//!
//! Each layer takes its weight first and its bias second, so a model's
//! parameter list reads "weights then biases per layer" in traversal order.

use candle_core::Tensor;
use maml_core::{MamlError, Result};
use serde::{Deserialize, Serialize};

use crate::params::{Init, ParamSource};

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// `max(x, 0)`.
    #[default]
    Relu,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Applies the nonlinearity elementwise.
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Tanh => x.tanh(),
        }
    }
}

/// Convolution padding mode, with TensorFlow semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Output spatial size is `ceil(in / stride)`; any odd pixel of
    /// padding goes at the end.
    Same,
    /// No padding.
    Valid,
}

impl Padding {
    /// Returns `(before, after)` padding for one spatial dimension.
    ///
    /// # Example
    ///
    /// ```
    /// use maml_nn::layers::Padding;
    ///
    /// assert_eq!(Padding::Same.amounts(28, 3, 1), (1, 1));
    /// assert_eq!(Padding::Same.amounts(28, 3, 2), (0, 1));
    /// assert_eq!(Padding::Valid.amounts(28, 3, 2), (0, 0));
    /// ```
    pub fn amounts(&self, input: usize, filter: usize, stride: usize) -> (usize, usize) {
        match self {
            Self::Valid => (0, 0),
            Self::Same => {
                let out = input.div_ceil(stride);
                let needed = ((out.saturating_sub(1)) * stride + filter).saturating_sub(input);
                let before = needed / 2;
                (before, needed - before)
            }
        }
    }
}

/// Fully connected layer `x·W + b`, with `W: [in, out]` and `b: [out]`.
///
/// # Errors
///
/// Returns parameter errors from the source, or [`MamlError::Internal`]
/// if a tensor operation fails.
pub fn dense(
    x: &Tensor,
    out_dim: usize,
    activation: Option<Activation>,
    params: &mut ParamSource<'_>,
) -> Result<Tensor> {
    let map_err = |e: candle_core::Error| MamlError::Internal {
        message: format!("dense: {e}"),
    };
    let (_, in_dim) = x.dims2().map_err(map_err)?;

    params.enter("dense");
    let w = params.take(
        "W",
        &[in_dim, out_dim],
        Init::XavierUniform {
            fan_in: in_dim,
            fan_out: out_dim,
        },
    );
    let b = params.take("b", &[out_dim], Init::Zeros);
    params.exit();
    let (w, b) = (w?, b?);

    let y = x.matmul(&w).and_then(|y| y.broadcast_add(&b)).map_err(map_err)?;
    match activation {
        Some(act) => act.apply(&y).map_err(map_err),
        None => Ok(y),
    }
}

/// Geometry of one convolution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    /// Output channels.
    pub channels: usize,
    /// Square filter size.
    pub filter: usize,
    /// Stride (both spatial dims).
    pub stride: usize,
    /// Padding mode.
    pub padding: Padding,
}

/// 2-D convolution over NCHW input with kernel `[out, in, k, k]` and bias
/// `[out]`.
///
/// Lowered to patch extraction plus one matmul (im2col), so first and
/// second derivatives come from `narrow`, `cat` and `matmul` backward rules
/// rather than candle's conv backward, which is wrong for batches larger
/// than one.
///
/// # Errors
///
/// Returns parameter errors from the source, or [`MamlError::Internal`]
/// if the input is smaller than the filter or a tensor operation fails.
pub fn conv2d(
    x: &Tensor,
    spec: &ConvSpec,
    activation: Option<Activation>,
    params: &mut ParamSource<'_>,
) -> Result<Tensor> {
    let map_err = |e: candle_core::Error| MamlError::Internal {
        message: format!("conv2d: {e}"),
    };
    let (batch, in_c, h, w) = x.dims4().map_err(map_err)?;
    let k = spec.filter;
    let s = spec.stride;

    params.enter("conv2d");
    let kernel = params.take(
        "W",
        &[spec.channels, in_c, k, k],
        Init::XavierUniform {
            fan_in: in_c * k * k,
            fan_out: spec.channels * k * k,
        },
    );
    let bias = params.take("b", &[spec.channels], Init::Zeros);
    params.exit();
    let (kernel, bias) = (kernel?, bias?);

    let (top, bottom) = spec.padding.amounts(h, k, s);
    let (left, right) = spec.padding.amounts(w, k, s);
    if h + top + bottom < k || w + left + right < k {
        return Err(MamlError::Internal {
            message: format!("conv2d: {h}x{w} input is smaller than the {k}x{k} filter"),
        });
    }
    let out_h = (h + top + bottom - k) / s + 1;
    let out_w = (w + left + right - k) / s + 1;
    // Patch slices span `out * stride` pixels; the extra tail is never read.
    let bottom = bottom + (k - 1 + out_h * s).saturating_sub(h + top + bottom);
    let right = right + (k - 1 + out_w * s).saturating_sub(w + left + right);
    let padded = x
        .pad_with_zeros(2, top, bottom)
        .and_then(|t| t.pad_with_zeros(3, left, right))
        .map_err(map_err)?;

    let cols = im2col(&padded, k, s, out_h, out_w).map_err(map_err)?;
    let y = kernel
        .reshape((spec.channels, in_c * k * k))
        .and_then(|kf| kf.broadcast_matmul(&cols))
        .and_then(|y| y.reshape((batch, spec.channels, out_h, out_w)))
        .and_then(|y| {
            let b = bias.reshape((1, spec.channels, 1, 1))?;
            y.broadcast_add(&b)
        })
        .map_err(map_err)?;
    match activation {
        Some(act) => act.apply(&y).map_err(map_err),
        None => Ok(y),
    }
}

/// Unfolds `x: [B, C, H, W]` into `[B, C·k·k, out_h·out_w]`, rows ordered
/// like a flattened `[C, k, k]` kernel.
///
/// `H` must be at least `k - 1 + out_h · stride` (same for `W`).
fn im2col(
    x: &Tensor,
    k: usize,
    stride: usize,
    out_h: usize,
    out_w: usize,
) -> candle_core::Result<Tensor> {
    let (batch, channels, _, _) = x.dims4()?;
    let mut patches = Vec::with_capacity(k * k);
    for i in 0..k {
        for j in 0..k {
            let patch = x.narrow(2, i, out_h * stride)?.narrow(3, j, out_w * stride)?;
            let patch = if stride == 1 {
                patch
            } else {
                patch
                    .reshape((batch, channels, out_h, stride, out_w, stride))?
                    .narrow(3, 0, 1)?
                    .narrow(5, 0, 1)?
                    .reshape((batch, channels, out_h, out_w))?
            };
            patches.push(patch);
        }
    }
    Tensor::stack(&patches, 2)?.reshape((batch, channels * k * k, out_h * out_w))
}
