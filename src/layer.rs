use std::fmt;

use rand::Rng;
use rand::distributions::{Distribution, Uniform};

use crate::conv::Conv2dGeometry;
use crate::matmul::{accumulate_tn, matmul_nn, matmul_nt};
use crate::{Error, Result, Tensor};

/// What a module looks like to the curvature estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Fully-connected layer with weight shape `(out_dim, in_dim)`.
    Linear { in_dim: usize, out_dim: usize },
    /// 2D convolution with weight shape `(out_channels, in_channels, kh, kw)`.
    Conv2d(Conv2dGeometry),
    /// Anything else. Never tracked by K-FAC.
    Other,
}

impl LayerKind {
    #[inline]
    pub fn is_supported(&self) -> bool {
        !matches!(self, LayerKind::Other)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Linear { .. } => "linear",
            LayerKind::Conv2d(_) => "conv2d",
            LayerKind::Other => "other",
        }
    }

    /// Shape `(rows, cols)` of the weight gradient in matrix form (without the bias column).
    pub fn weight_matrix_dims(&self) -> Option<(usize, usize)> {
        match self {
            LayerKind::Linear { in_dim, out_dim } => Some((*out_dim, *in_dim)),
            LayerKind::Conv2d(g) => Some((g.out_channels, g.patch_len())),
            LayerKind::Other => None,
        }
    }
}

/// A trainable tensor together with its gradient buffer.
///
/// Gradients accumulate across backward passes until [`Parameter::zero_grad`].
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    value: Vec<f32>,
    grad: Vec<f32>,
}

impl Parameter {
    pub fn new(value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self { value, grad }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    #[inline]
    pub fn value(&self) -> &[f32] {
        &self.value
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut [f32] {
        &mut self.value
    }

    #[inline]
    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    #[inline]
    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Split borrow: `(value, grad)`.
    #[inline]
    pub fn value_and_grad_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.value, &mut self.grad)
    }

    #[inline]
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// A differentiable building block of a [`crate::Sequential`] network.
///
/// Modules cache whatever they need during `forward` so that `backward` can be called
/// (possibly more than once) afterwards. Parameter gradients accumulate.
pub trait Module: fmt::Debug + Send {
    fn kind(&self) -> LayerKind {
        LayerKind::Other
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Accumulates parameter gradients and returns `dL/d(input)`.
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor>;

    fn weight(&self) -> Option<&Parameter> {
        None
    }

    fn weight_mut(&mut self) -> Option<&mut Parameter> {
        None
    }

    fn bias(&self) -> Option<&Parameter> {
        None
    }

    fn bias_mut(&mut self) -> Option<&mut Parameter> {
        None
    }

    fn zero_grad(&mut self) {
        if let Some(w) = self.weight_mut() {
            w.zero_grad();
        }
        if let Some(b) = self.bias_mut() {
            b.zero_grad();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Weight initialization scheme (uniform variants).
pub enum Init {
    /// Xavier/Glorot: `U(-sqrt(6/(fan_in+fan_out)), +...)`.
    Xavier,
    /// He/Kaiming: `U(-sqrt(6/fan_in), +...)`.
    He,
}

impl Init {
    pub(crate) fn sample_into<R: Rng + ?Sized>(
        self,
        fan_in: usize,
        fan_out: usize,
        rng: &mut R,
        out: &mut [f32],
    ) {
        let limit = match self {
            Init::Xavier => (6.0 / (fan_in + fan_out) as f32).sqrt(),
            Init::He => (6.0 / fan_in as f32).sqrt(),
        };
        let dist = Uniform::new_inclusive(-limit, limit);
        for w in out.iter_mut() {
            *w = dist.sample(rng);
        }
    }
}

/// Fully-connected layer: `y = x Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    in_dim: usize,
    out_dim: usize,
    /// Row-major matrix with shape (out_dim, in_dim).
    weight: Parameter,
    bias: Option<Parameter>,
    input: Option<Tensor>,
}

impl Linear {
    /// Zero-initialized layer.
    pub fn new(in_dim: usize, out_dim: usize, bias: bool) -> Self {
        Self {
            in_dim,
            out_dim,
            weight: Parameter::new(vec![0.0; in_dim * out_dim]),
            bias: bias.then(|| Parameter::new(vec![0.0; out_dim])),
            input: None,
        }
    }

    pub fn new_with_rng<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        init: Init,
        rng: &mut R,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::InvalidConfig(
                "linear in_dim and out_dim must be > 0".to_owned(),
            ));
        }
        let mut layer = Self::new(in_dim, out_dim, bias);
        init.sample_into(in_dim, out_dim, rng, layer.weight.value_mut());
        Ok(layer)
    }

    /// Build a layer from explicit parameters.
    pub fn from_parts(
        in_dim: usize,
        out_dim: usize,
        weights: Vec<f32>,
        biases: Option<Vec<f32>>,
    ) -> Result<Self> {
        if weights.len() != in_dim * out_dim {
            return Err(Error::InvalidShape(format!(
                "weights length {} does not match out_dim * in_dim ({})",
                weights.len(),
                in_dim * out_dim
            )));
        }
        if let Some(b) = &biases
            && b.len() != out_dim
        {
            return Err(Error::InvalidShape(format!(
                "biases length {} does not match out_dim {out_dim}",
                b.len()
            )));
        }
        Ok(Self {
            in_dim,
            out_dim,
            weight: Parameter::new(weights),
            bias: biases.map(Parameter::new),
            input: None,
        })
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl Module for Linear {
    fn kind(&self) -> LayerKind {
        LayerKind::Linear {
            in_dim: self.in_dim,
            out_dim: self.out_dim,
        }
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        input.expect_rank(2, "linear input")?;
        let batch = input.batch();
        if batch == 0 || input.shape()[1] != self.in_dim {
            return Err(Error::InvalidShape(format!(
                "linear expects (batch > 0, {}), got {:?}",
                self.in_dim,
                input.shape()
            )));
        }

        let mut out = Tensor::zeros(&[batch, self.out_dim]);
        matmul_nt(
            batch,
            self.in_dim,
            self.out_dim,
            input.data(),
            self.weight.value(),
            out.data_mut(),
        );
        if let Some(bias) = &self.bias {
            for row in out.data_mut().chunks_exact_mut(self.out_dim) {
                for (y, &b) in row.iter_mut().zip(bias.value()) {
                    *y += b;
                }
            }
        }

        self.input = Some(input.clone());
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let input = self.input.as_ref().ok_or_else(|| {
            Error::InvalidData("linear backward called before forward".to_owned())
        })?;
        let batch = input.batch();
        if grad_output.shape() != [batch, self.out_dim] {
            return Err(Error::InvalidShape(format!(
                "linear grad_output must be ({batch}, {}), got {:?}",
                self.out_dim,
                grad_output.shape()
            )));
        }

        let g = grad_output.data();
        accumulate_tn(
            batch,
            self.out_dim,
            self.in_dim,
            g,
            input.data(),
            self.weight.grad_mut(),
        );
        if let Some(bias) = &mut self.bias {
            let db = bias.grad_mut();
            for row in g.chunks_exact(self.out_dim) {
                for (d, &v) in db.iter_mut().zip(row) {
                    *d += v;
                }
            }
        }

        let mut d_input = Tensor::zeros(&[batch, self.in_dim]);
        matmul_nn(
            batch,
            self.out_dim,
            self.in_dim,
            g,
            self.weight.value(),
            d_input.data_mut(),
        );
        Ok(d_input)
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

/// Collapses every dimension after the batch dimension: `(B, ...) -> (B, prod(...))`.
#[derive(Debug, Clone, Default)]
pub struct Flatten {
    input_shape: Option<Vec<usize>>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Flatten {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let batch = input.batch();
        let rest = input.shape()[1..].iter().product();
        self.input_shape = Some(input.shape().to_vec());
        input.clone().reshape(&[batch, rest])
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let shape = self.input_shape.as_ref().ok_or_else(|| {
            Error::InvalidData("flatten backward called before forward".to_owned())
        })?;
        grad_output.clone().reshape(shape)
    }
}
