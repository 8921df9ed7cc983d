//! Model builder.
//!
//! `SequentialBuilder` is the recommended way to define a network.
//!
//! It tracks the activation shape layer by layer, so shape errors surface while the
//! model is being described rather than during the first forward pass. Each parametric
//! layer gets a default initializer based on the activation that follows it:
//!
//! - `relu` / `leaky relu`: He/Kaiming
//! - anything else (or nothing): Xavier/Glorot

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::conv::{Conv2d, Conv2dGeometry};
use crate::layer::{Flatten, Init, Linear};
use crate::{Activation, ActivationLayer, Error, Result, Sequential};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Flat(usize),
    Image { c: usize, h: usize, w: usize },
}

#[derive(Debug, Clone, Copy)]
enum ModuleSpec {
    Linear {
        in_dim: usize,
        out_dim: usize,
        bias: bool,
    },
    Conv2d {
        geometry: Conv2dGeometry,
        bias: bool,
    },
    Activation(Activation),
    Flatten,
}

#[derive(Debug, Clone)]
/// Builder for a [`Sequential`] network.
///
/// Example:
///
/// ```rust
/// use rust_kfac::{Activation, SequentialBuilder};
///
/// # fn main() -> rust_kfac::Result<()> {
/// let net = SequentialBuilder::new_image(1, 8, 8)?
///     .conv2d(4, (3, 3), (1, 1), (1, 1), true)?
///     .activation(Activation::ReLU)?
///     .flatten()
///     .linear(3, true)?
///     .build_with_seed(0)?;
/// assert_eq!(net.len(), 4);
/// # Ok(())
/// # }
/// ```
pub struct SequentialBuilder {
    current: Shape,
    specs: Vec<ModuleSpec>,
}

impl SequentialBuilder {
    /// Start a network that accepts `(batch, input_dim)` inputs.
    pub fn new(input_dim: usize) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidConfig("input_dim must be > 0".to_owned()));
        }
        Ok(Self {
            current: Shape::Flat(input_dim),
            specs: Vec::new(),
        })
    }

    /// Start a network that accepts NCHW `(batch, channels, height, width)` inputs.
    pub fn new_image(channels: usize, height: usize, width: usize) -> Result<Self> {
        if channels == 0 || height == 0 || width == 0 {
            return Err(Error::InvalidConfig(
                "image channels, height and width must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            current: Shape::Image {
                c: channels,
                h: height,
                w: width,
            },
            specs: Vec::new(),
        })
    }

    /// Add a fully-connected layer. The current shape must be flat.
    pub fn linear(mut self, out_dim: usize, bias: bool) -> Result<Self> {
        if out_dim == 0 {
            return Err(Error::InvalidConfig("linear out_dim must be > 0".to_owned()));
        }
        let Shape::Flat(in_dim) = self.current else {
            return Err(Error::InvalidConfig(
                "linear layer needs a flat input; add `flatten()` first".to_owned(),
            ));
        };
        self.specs.push(ModuleSpec::Linear {
            in_dim,
            out_dim,
            bias,
        });
        self.current = Shape::Flat(out_dim);
        Ok(self)
    }

    /// Add a 2D convolution. The current shape must be an image.
    pub fn conv2d(
        mut self,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        bias: bool,
    ) -> Result<Self> {
        let Shape::Image { c, h, w } = self.current else {
            return Err(Error::InvalidConfig(
                "conv2d layer needs an image input".to_owned(),
            ));
        };
        let geometry = Conv2dGeometry::new(c, out_channels, kernel, stride, padding)?;
        let (oh, ow) = geometry.output_hw(h, w)?;
        self.specs.push(ModuleSpec::Conv2d { geometry, bias });
        self.current = Shape::Image {
            c: out_channels,
            h: oh,
            w: ow,
        };
        Ok(self)
    }

    pub fn activation(mut self, activation: Activation) -> Result<Self> {
        activation.validate()?;
        self.specs.push(ModuleSpec::Activation(activation));
        Ok(self)
    }

    /// Collapse an image into a flat feature vector. No-op shape-wise on flat inputs.
    pub fn flatten(mut self) -> Self {
        if let Shape::Image { c, h, w } = self.current {
            self.current = Shape::Flat(c * h * w);
        }
        self.specs.push(ModuleSpec::Flatten);
        self
    }

    /// Flat output size, if the last module produces a flat shape.
    pub fn output_dim(&self) -> Option<usize> {
        match self.current {
            Shape::Flat(d) => Some(d),
            Shape::Image { .. } => None,
        }
    }

    /// Build using a deterministic seed.
    pub fn build_with_seed(self, seed: u64) -> Result<Sequential> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build_with_rng(&mut rng)
    }

    /// Build using the provided RNG.
    pub fn build_with_rng<R: Rng + ?Sized>(self, rng: &mut R) -> Result<Sequential> {
        if self.specs.is_empty() {
            return Err(Error::InvalidConfig(
                "network must have at least one module".to_owned(),
            ));
        }

        let mut net = Sequential::new();
        for (idx, spec) in self.specs.iter().enumerate() {
            let init = default_init_for_next(self.specs.get(idx + 1));
            match *spec {
                ModuleSpec::Linear {
                    in_dim,
                    out_dim,
                    bias,
                } => net.push(Linear::new_with_rng(in_dim, out_dim, bias, init, rng)?),
                ModuleSpec::Conv2d { geometry, bias } => {
                    net.push(Conv2d::new_with_rng(geometry, bias, init, rng)?)
                }
                ModuleSpec::Activation(act) => net.push(ActivationLayer::new(act)?),
                ModuleSpec::Flatten => net.push(Flatten::new()),
            }
        }
        Ok(net)
    }
}

#[inline]
fn default_init_for_next(next: Option<&ModuleSpec>) -> Init {
    match next {
        Some(ModuleSpec::Activation(Activation::ReLU | Activation::LeakyReLU { .. })) => Init::He,
        _ => Init::Xavier,
    }
}
