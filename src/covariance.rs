//! Kronecker factor estimators.
//!
//! For a layer with input activations `a` and pre-activation output gradients `g`, the
//! Fisher block is approximated as `E[g gᵀ] ⊗ E[a aᵀ]`. This module computes the two
//! second-moment matrices for one mini-batch:
//!
//! - A-factor: `(in_dim [+1]) x (in_dim [+1])`, with a constant `1` appended to each
//!   activation when the layer has a bias.
//! - G-factor: `out_dim x out_dim`.
//!
//! Convolutions treat every spatial location as a sample: inputs are unfolded into
//! receptive-field rows and output gradients are flattened to one row per location.
//!
//! Both functions are pure.

use nalgebra::DMatrix;

use crate::conv::extract_patches;
use crate::layer::LayerKind;
use crate::matmul::gram_f32;
use crate::{Error, Result, Tensor};

/// Input-activation covariance (A-factor) for one batch.
pub fn compute_cov_a(input: &Tensor, kind: &LayerKind, has_bias: bool) -> Result<DMatrix<f32>> {
    match kind {
        LayerKind::Linear { in_dim, .. } => {
            input.expect_rank(2, "linear input")?;
            let batch = input.batch();
            if batch == 0 || input.shape()[1] != *in_dim {
                return Err(Error::InvalidShape(format!(
                    "linear A-factor expects (batch > 0, {in_dim}), got {:?}",
                    input.shape()
                )));
            }
            let (rows, cols, a) = augment(input.data(), batch, *in_dim, has_bias);
            Ok(gram(rows, cols, 1.0 / batch as f32, &a))
        }
        LayerKind::Conv2d(geometry) => {
            input.expect_rank(4, "conv input")?;
            if input.shape()[1] != geometry.in_channels {
                return Err(Error::InvalidShape(format!(
                    "conv A-factor expects {} channels, got {:?}",
                    geometry.in_channels,
                    input.shape()
                )));
            }
            let batch = input.batch();
            let patches =
                extract_patches(input, geometry.kernel, geometry.stride, geometry.padding)?;
            let spatial = (patches.shape()[1] * patches.shape()[2]) as f32;
            let rows = patches.len() / geometry.patch_len();
            let (rows, cols, a) = augment(patches.data(), rows, geometry.patch_len(), has_bias);
            // Rows are divided by the spatial size before the outer product, and the
            // product is averaged over images (not locations).
            Ok(gram(rows, cols, 1.0 / (spatial * spatial * batch as f32), &a))
        }
        LayerKind::Other => Err(Error::UnsupportedLayer(
            "A-factor requested for a non-curvature layer".to_owned(),
        )),
    }
}

/// Output-gradient covariance (G-factor) for one batch.
///
/// `batch_averaged` states whether `grad_output` came from a loss averaged over the
/// batch; if so the batch size is multiplied back in.
pub fn compute_cov_g(
    grad_output: &Tensor,
    kind: &LayerKind,
    batch_averaged: bool,
) -> Result<DMatrix<f32>> {
    match kind {
        LayerKind::Linear { out_dim, .. } => {
            grad_output.expect_rank(2, "linear grad_output")?;
            let batch = grad_output.batch();
            if batch == 0 || grad_output.shape()[1] != *out_dim {
                return Err(Error::InvalidShape(format!(
                    "linear G-factor expects (batch > 0, {out_dim}), got {:?}",
                    grad_output.shape()
                )));
            }
            let b = batch as f32;
            let alpha = if batch_averaged { b } else { 1.0 / b };
            Ok(gram(batch, *out_dim, alpha, grad_output.data()))
        }
        LayerKind::Conv2d(geometry) => {
            grad_output.expect_rank(4, "conv grad_output")?;
            let s = grad_output.shape();
            let (batch, channels, spatial) = (s[0], s[1], s[2] * s[3]);
            if batch == 0 || channels != geometry.out_channels {
                return Err(Error::InvalidShape(format!(
                    "conv G-factor expects (batch > 0, {}, h, w), got {s:?}",
                    geometry.out_channels
                )));
            }

            // NCHW -> (batch * h * w, channels)
            let g = grad_output.data();
            let rows = batch * spatial;
            let mut flat = vec![0.0_f32; rows * channels];
            for n in 0..batch {
                for c in 0..channels {
                    for p in 0..spatial {
                        flat[(n * spatial + p) * channels + c] = g[(n * channels + c) * spatial + p];
                    }
                }
            }

            // Rows are scaled by the spatial size (and by the batch size when the loss was
            // batch-averaged), then the outer product is averaged over all rows.
            let (b, sp) = (batch as f32, spatial as f32);
            let alpha = if batch_averaged { b * sp } else { sp / b };
            Ok(gram(rows, channels, alpha, &flat))
        }
        LayerKind::Other => Err(Error::UnsupportedLayer(
            "G-factor requested for a non-curvature layer".to_owned(),
        )),
    }
}

/// Append a column of ones when the layer has a bias.
fn augment(data: &[f32], rows: usize, cols: usize, has_bias: bool) -> (usize, usize, Vec<f32>) {
    if !has_bias {
        return (rows, cols, data.to_vec());
    }
    let mut out = Vec::with_capacity(rows * (cols + 1));
    for row in data.chunks_exact(cols) {
        out.extend_from_slice(row);
        out.push(1.0);
    }
    (rows, cols + 1, out)
}

fn gram(rows: usize, cols: usize, alpha: f32, a: &[f32]) -> DMatrix<f32> {
    let mut out = vec![0.0_f32; cols * cols];
    gram_f32(rows, cols, alpha, a, &mut out);
    DMatrix::from_row_slice(cols, cols, &out)
}
