//! Element-wise activation modules.
//!
//! Activations carry no parameters, so K-FAC never registers them: gradients simply
//! flow through. The post-activation output is cached during forward and reused to
//! compute the local derivative during backward.

use crate::layer::Module;
use crate::{Error, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
/// Element-wise activation function.
pub enum Activation {
    Tanh,
    ReLU,
    LeakyReLU { alpha: f32 },
    Sigmoid,
    Identity,
}

impl Activation {
    /// Validate activation parameters.
    pub fn validate(self) -> Result<()> {
        if let Activation::LeakyReLU { alpha } = self
            && !(alpha.is_finite() && alpha >= 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "leaky ReLU alpha must be finite and >= 0, got {alpha}"
            )));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn forward(self, x: f32) -> f32 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::ReLU => x.max(0.0),
            Activation::LeakyReLU { alpha } => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activation::Sigmoid => sigmoid(x),
            Activation::Identity => x,
        }
    }

    /// Derivative with respect to the input, expressed through the cached output `y`.
    #[inline]
    pub(crate) fn grad_from_output(self, y: f32) -> f32 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::ReLU => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU { alpha } => {
                if y > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Identity => 1.0,
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    // Numerically stable sigmoid.
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// [`Activation`] applied to every element of a tensor of any shape.
#[derive(Debug, Clone)]
pub struct ActivationLayer {
    activation: Activation,
    output: Option<Tensor>,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Result<Self> {
        activation.validate()?;
        Ok(Self {
            activation,
            output: None,
        })
    }

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Module for ActivationLayer {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let mut out = input.clone();
        for v in out.data_mut() {
            *v = self.activation.forward(*v);
        }
        self.output = Some(out.clone());
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let y = self.output.as_ref().ok_or_else(|| {
            Error::InvalidData("activation backward called before forward".to_owned())
        })?;
        if y.shape() != grad_output.shape() {
            return Err(Error::InvalidShape(format!(
                "activation grad_output shape {:?} does not match output {:?}",
                grad_output.shape(),
                y.shape()
            )));
        }
        let mut d_input = grad_output.clone();
        for (d, &out) in d_input.data_mut().iter_mut().zip(y.data()) {
            *d *= self.activation.grad_from_output(out);
        }
        Ok(d_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::LayerKind;

    #[test]
    fn leaky_relu_alpha_must_be_finite_and_non_negative() {
        assert!(
            Activation::LeakyReLU { alpha: f32::NAN }
                .validate()
                .is_err()
        );
        assert!(Activation::LeakyReLU { alpha: -0.1 }.validate().is_err());
        assert!(Activation::LeakyReLU { alpha: 0.1 }.validate().is_ok());
    }

    #[test]
    fn sigmoid_basic_values() {
        let y0 = Activation::Sigmoid.forward(0.0);
        assert!((y0 - 0.5).abs() < 1e-6);
        assert!(Activation::Sigmoid.forward(10.0) > 0.999);
        assert!(Activation::Sigmoid.forward(-10.0) < 0.001);
    }

    #[test]
    fn relu_layer_masks_gradient() {
        let mut layer = ActivationLayer::new(Activation::ReLU).unwrap();
        let x = Tensor::from_vec(&[1, 4], vec![-1.0, 2.0, -3.0, 4.0]).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.data(), &[0.0, 2.0, 0.0, 4.0]);

        let g = Tensor::from_vec(&[1, 4], vec![1.0; 4]).unwrap();
        let dx = layer.backward(&g).unwrap();
        assert_eq!(dx.data(), &[0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn activation_is_not_a_curvature_layer() {
        let layer = ActivationLayer::new(Activation::Tanh).unwrap();
        assert_eq!(layer.kind(), LayerKind::Other);
        assert!(layer.weight().is_none());
    }
}
