//! 2D convolution via patch extraction (im2col).
//!
//! Inputs are NCHW. `extract_patches` unfolds every receptive field into a row of length
//! `in_channels * kh * kw`, ordered `(channel, ky, kx)`, which matches the row-major
//! layout of a conv weight viewed as `(out_channels, in_channels * kh * kw)`. The same
//! rows feed both the convolution itself and the K-FAC input covariance.

use rand::Rng;

use crate::layer::{Init, LayerKind, Module, Parameter};
use crate::matmul::{accumulate_tn, matmul_nn, matmul_nt};
use crate::{Error, Result, Tensor};

/// Static shape of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    /// `(kh, kw)`
    pub kernel: (usize, usize),
    /// `(sh, sw)`
    pub stride: (usize, usize),
    /// Zero padding `(ph, pw)` applied to both sides.
    pub padding: (usize, usize),
}

impl Conv2dGeometry {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(Error::InvalidConfig(
                "conv2d channel counts must be > 0".to_owned(),
            ));
        }
        if kernel.0 == 0 || kernel.1 == 0 {
            return Err(Error::InvalidConfig("conv2d kernel must be > 0".to_owned()));
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(Error::InvalidConfig("conv2d stride must be > 0".to_owned()));
        }
        Ok(Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
        })
    }

    /// Length of one unfolded receptive field.
    #[inline]
    pub fn patch_len(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    #[inline]
    pub fn weight_len(&self) -> usize {
        self.out_channels * self.patch_len()
    }

    /// Spatial output size for an `h x w` input.
    pub fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        output_hw(h, w, self.kernel, self.stride, self.padding)
    }
}

fn output_hw(
    h: usize,
    w: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<(usize, usize)> {
    let padded_h = h + 2 * padding.0;
    let padded_w = w + 2 * padding.1;
    if padded_h < kernel.0 || padded_w < kernel.1 {
        return Err(Error::InvalidShape(format!(
            "kernel {kernel:?} does not fit a padded input of {padded_h}x{padded_w}"
        )));
    }
    Ok((
        (padded_h - kernel.0) / stride.0 + 1,
        (padded_w - kernel.1) / stride.1 + 1,
    ))
}

fn nchw(input: &Tensor, what: &str) -> Result<(usize, usize, usize, usize)> {
    input.expect_rank(4, what)?;
    let s = input.shape();
    if s[0] == 0 {
        return Err(Error::InvalidShape(format!("{what} batch must be > 0")));
    }
    Ok((s[0], s[1], s[2], s[3]))
}

/// Unfold an NCHW input into receptive-field rows.
///
/// Returns shape `(batch, out_h, out_w, channels * kh * kw)`. Positions that fall into
/// the zero padding contribute zeros.
pub fn extract_patches(
    input: &Tensor,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Tensor> {
    let (batch, channels, h, w) = nchw(input, "conv input")?;
    let (oh, ow) = output_hw(h, w, kernel, stride, padding)?;
    let (kh, kw) = kernel;
    let patch = channels * kh * kw;

    let x = input.data();
    let mut out = vec![0.0_f32; batch * oh * ow * patch];
    for n in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let base = ((n * oh + oy) * ow + ox) * patch;
                for c in 0..channels {
                    for ky in 0..kh {
                        let Some(iy) = (oy * stride.0 + ky).checked_sub(padding.0) else {
                            continue;
                        };
                        if iy >= h {
                            continue;
                        }
                        for kx in 0..kw {
                            let Some(ix) = (ox * stride.1 + kx).checked_sub(padding.1) else {
                                continue;
                            };
                            if ix >= w {
                                continue;
                            }
                            out[base + (c * kh + ky) * kw + kx] = x[((n * channels + c) * h + iy) * w + ix];
                        }
                    }
                }
            }
        }
    }

    Tensor::from_vec(&[batch, oh, ow, patch], out)
}

/// Inverse of [`extract_patches`] for gradients: scatter-add rows back into NCHW.
fn fold_patches(
    patches: &[f32],
    input_shape: (usize, usize, usize, usize),
    geometry: &Conv2dGeometry,
    (oh, ow): (usize, usize),
) -> Tensor {
    let (batch, channels, h, w) = input_shape;
    let (kh, kw) = geometry.kernel;
    let (sh, sw) = geometry.stride;
    let (ph, pw) = geometry.padding;
    let patch = channels * kh * kw;

    let mut out = Tensor::zeros(&[batch, channels, h, w]);
    let dx = out.data_mut();
    for n in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let base = ((n * oh + oy) * ow + ox) * patch;
                for c in 0..channels {
                    for ky in 0..kh {
                        let Some(iy) = (oy * sh + ky).checked_sub(ph) else {
                            continue;
                        };
                        if iy >= h {
                            continue;
                        }
                        for kx in 0..kw {
                            let Some(ix) = (ox * sw + kx).checked_sub(pw) else {
                                continue;
                            };
                            if ix >= w {
                                continue;
                            }
                            dx[((n * channels + c) * h + iy) * w + ix] +=
                                patches[base + (c * kh + ky) * kw + kx];
                        }
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
struct ConvCache {
    input_shape: (usize, usize, usize, usize),
    out_hw: (usize, usize),
    /// Flattened patches, `(batch * out_h * out_w, patch_len)`.
    patches: Vec<f32>,
}

/// 2D convolution layer (cross-correlation, like most frameworks).
#[derive(Debug, Clone)]
pub struct Conv2d {
    geometry: Conv2dGeometry,
    /// Row-major `(out_channels, in_channels, kh, kw)`.
    weight: Parameter,
    bias: Option<Parameter>,
    cache: Option<ConvCache>,
}

impl Conv2d {
    /// Zero-initialized layer.
    pub fn new(geometry: Conv2dGeometry, bias: bool) -> Self {
        Self {
            geometry,
            weight: Parameter::new(vec![0.0; geometry.weight_len()]),
            bias: bias.then(|| Parameter::new(vec![0.0; geometry.out_channels])),
            cache: None,
        }
    }

    pub fn new_with_rng<R: Rng + ?Sized>(
        geometry: Conv2dGeometry,
        bias: bool,
        init: Init,
        rng: &mut R,
    ) -> Result<Self> {
        let mut layer = Self::new(geometry, bias);
        let receptive = geometry.kernel.0 * geometry.kernel.1;
        init.sample_into(
            geometry.in_channels * receptive,
            geometry.out_channels * receptive,
            rng,
            layer.weight.value_mut(),
        );
        Ok(layer)
    }

    pub fn from_parts(
        geometry: Conv2dGeometry,
        weights: Vec<f32>,
        biases: Option<Vec<f32>>,
    ) -> Result<Self> {
        if weights.len() != geometry.weight_len() {
            return Err(Error::InvalidShape(format!(
                "conv weights length {} does not match {}",
                weights.len(),
                geometry.weight_len()
            )));
        }
        if let Some(b) = &biases
            && b.len() != geometry.out_channels
        {
            return Err(Error::InvalidShape(format!(
                "conv biases length {} does not match out_channels {}",
                b.len(),
                geometry.out_channels
            )));
        }
        Ok(Self {
            geometry,
            weight: Parameter::new(weights),
            bias: biases.map(Parameter::new),
            cache: None,
        })
    }

    #[inline]
    pub fn geometry(&self) -> &Conv2dGeometry {
        &self.geometry
    }
}

impl Module for Conv2d {
    fn kind(&self) -> LayerKind {
        LayerKind::Conv2d(self.geometry)
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let (batch, channels, h, w) = nchw(input, "conv input")?;
        if channels != self.geometry.in_channels {
            return Err(Error::InvalidShape(format!(
                "conv expects {} input channels, got {channels}",
                self.geometry.in_channels
            )));
        }
        let g = self.geometry;
        let patches = extract_patches(input, g.kernel, g.stride, g.padding)?;
        let (oh, ow) = (patches.shape()[1], patches.shape()[2]);
        let rows = batch * oh * ow;
        let spatial = oh * ow;
        let out_c = g.out_channels;

        let mut y_rows = vec![0.0_f32; rows * out_c];
        matmul_nt(
            rows,
            g.patch_len(),
            out_c,
            patches.data(),
            self.weight.value(),
            &mut y_rows,
        );

        let mut out = Tensor::zeros(&[batch, out_c, oh, ow]);
        let y = out.data_mut();
        for n in 0..batch {
            for o in 0..out_c {
                let b = self.bias.as_ref().map_or(0.0, |b| b.value()[o]);
                for s in 0..spatial {
                    y[(n * out_c + o) * spatial + s] = y_rows[(n * spatial + s) * out_c + o] + b;
                }
            }
        }

        self.cache = Some(ConvCache {
            input_shape: (batch, channels, h, w),
            out_hw: (oh, ow),
            patches: patches.into_vec(),
        });
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            Error::InvalidData("conv backward called before forward".to_owned())
        })?;
        let g = self.geometry;
        let batch = cache.input_shape.0;
        let (oh, ow) = cache.out_hw;
        let out_c = g.out_channels;
        if grad_output.shape() != [batch, out_c, oh, ow] {
            return Err(Error::InvalidShape(format!(
                "conv grad_output must be ({batch}, {out_c}, {oh}, {ow}), got {:?}",
                grad_output.shape()
            )));
        }

        let spatial = oh * ow;
        let rows = batch * spatial;
        let gy = grad_output.data();
        let mut g_rows = vec![0.0_f32; rows * out_c];
        for n in 0..batch {
            for o in 0..out_c {
                for s in 0..spatial {
                    g_rows[(n * spatial + s) * out_c + o] = gy[(n * out_c + o) * spatial + s];
                }
            }
        }

        accumulate_tn(
            rows,
            out_c,
            g.patch_len(),
            &g_rows,
            &cache.patches,
            self.weight.grad_mut(),
        );
        if let Some(bias) = &mut self.bias {
            let db = bias.grad_mut();
            for row in g_rows.chunks_exact(out_c) {
                for (d, &v) in db.iter_mut().zip(row) {
                    *d += v;
                }
            }
        }

        let mut d_patches = vec![0.0_f32; rows * g.patch_len()];
        matmul_nn(
            rows,
            out_c,
            g.patch_len(),
            &g_rows,
            self.weight.value(),
            &mut d_patches,
        );
        Ok(fold_patches(&d_patches, cache.input_shape, &g, (oh, ow)))
    }

    fn weight(&self) -> Option<&Parameter> {
        Some(&self.weight)
    }

    fn weight_mut(&mut self) -> Option<&mut Parameter> {
        Some(&mut self.weight)
    }

    fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    fn bias_mut(&mut self) -> Option<&mut Parameter> {
        self.bias.as_mut()
    }
}
