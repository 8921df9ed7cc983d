//! Networks as seen by the optimizer.
//!
//! [`Network`] exposes a model's modules in a stable order; the module index is the
//! layer identity. [`Sequential`] is the provided implementation. Its `forward_with`
//! and `backward_with` passes report module inputs and output gradients to
//! [`CurvatureHooks`].

use crate::layer::Module;
use crate::registry::CurvatureHooks;
use crate::{Error, Result, Tensor};

/// A model whose modules can be enumerated in a stable order.
///
/// The module index is the identity K-FAC uses when registering layers and when the
/// host reports forward inputs and backward gradients through [`CurvatureHooks`].
pub trait Network {
    fn modules(&self) -> &[Box<dyn Module>];

    fn modules_mut(&mut self) -> &mut [Box<dyn Module>];

    fn zero_grad(&mut self) {
        for module in self.modules_mut() {
            module.zero_grad();
        }
    }
}

/// Modules applied one after another.
///
/// `forward`/`backward` are the plain passes. `forward_with`/`backward_with` additionally
/// report every module input and every module output gradient to a [`CurvatureHooks`]
/// implementation (typically [`crate::Kfac`]), in traversal order: inputs before the
/// module consuming them, gradients in reverse module order.
#[derive(Debug, Default)]
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<M: Module + 'static>(&mut self, module: M) {
        self.modules.push(Box::new(module));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Forward pass without curvature hooks (inference, or training without K-FAC).
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.run_forward(input, None)
    }

    /// Forward pass that reports each module's input to `hooks` before the module runs.
    pub fn forward_with(&mut self, input: &Tensor, hooks: &mut dyn CurvatureHooks) -> Result<Tensor> {
        self.run_forward(input, Some(hooks))
    }

    /// Backward pass from `dL/d(output)`; returns `dL/d(input)`.
    ///
    /// Parameter gradients accumulate into the modules.
    pub fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        self.run_backward(grad_output, None, false)
    }

    /// Backward pass that reports each module's output gradient to `hooks` after the
    /// module ran. `accumulate` is forwarded verbatim: it is `true` only for the
    /// sampled-label pass used to estimate the true Fisher.
    pub fn backward_with(
        &mut self,
        grad_output: &Tensor,
        hooks: &mut dyn CurvatureHooks,
        accumulate: bool,
    ) -> Result<Tensor> {
        self.run_backward(grad_output, Some(hooks), accumulate)
    }

    fn run_forward(
        &mut self,
        input: &Tensor,
        mut hooks: Option<&mut dyn CurvatureHooks>,
    ) -> Result<Tensor> {
        if self.modules.is_empty() {
            return Err(Error::InvalidConfig("network has no modules".to_owned()));
        }

        let mut x = input.clone();
        for (idx, module) in self.modules.iter_mut().enumerate() {
            if let Some(h) = hooks.as_deref_mut() {
                h.on_forward(idx, &x)?;
            }
            x = module.forward(&x)?;
        }
        Ok(x)
    }

    fn run_backward(
        &mut self,
        grad_output: &Tensor,
        mut hooks: Option<&mut dyn CurvatureHooks>,
        accumulate: bool,
    ) -> Result<Tensor> {
        if self.modules.is_empty() {
            return Err(Error::InvalidConfig("network has no modules".to_owned()));
        }

        let mut g = grad_output.clone();
        for (idx, module) in self.modules.iter_mut().enumerate().rev() {
            let d_input = module.backward(&g)?;
            if let Some(h) = hooks.as_deref_mut() {
                h.on_backward(idx, &g, accumulate)?;
            }
            g = d_input;
        }
        Ok(g)
    }
}

impl Network for Sequential {
    fn modules(&self) -> &[Box<dyn Module>] {
        &self.modules
    }

    fn modules_mut(&mut self) -> &mut [Box<dyn Module>] {
        &mut self.modules
    }
}
