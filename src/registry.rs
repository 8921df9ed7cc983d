//! Layer registry and curvature hooks.
//!
//! K-FAC needs to observe every tracked layer's input during forward and its output
//! gradient during backward. Instead of hooking into an autograd engine, the host calls
//! [`CurvatureHooks`] at exactly those points (see [`crate::Sequential::forward_with`]
//! and [`crate::Sequential::backward_with`]).
//!
//! All per-layer optimizer state lives in one [`LayerState`] record per registered
//! layer, stored in registration order and addressed by a dense [`LayerId`].

use nalgebra::DMatrix;
use tracing::{debug, trace};

use crate::inverse::Decomposition;
use crate::layer::LayerKind;
use crate::model::Network;
use crate::Tensor;
use crate::Result;

/// Callbacks a host network invokes during its forward and backward passes.
///
/// `module` is the index of the module in the network's [`Network::modules`] order.
pub trait CurvatureHooks {
    /// Called with a module's input, before the module runs.
    fn on_forward(&mut self, module: usize, input: &Tensor) -> Result<()>;

    /// Called with the gradient w.r.t. a module's output, after the module ran its
    /// backward. `accumulate` is set by the host only for the sampled-label pass whose
    /// gradients estimate the true Fisher.
    fn on_backward(&mut self, module: usize, grad_output: &Tensor, accumulate: bool) -> Result<()>;
}

/// Dense index of a registered layer, assigned in module order.
pub type LayerId = usize;

/// Everything K-FAC keeps for one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerState {
    pub(crate) a: Option<DMatrix<f32>>,
    pub(crate) g: Option<DMatrix<f32>>,
    pub(crate) decomposition: Option<Decomposition>,
    pub(crate) weight_momentum: Option<Vec<f32>>,
    pub(crate) bias_momentum: Option<Vec<f32>>,
}

impl LayerState {
    /// Running input-activation factor.
    pub fn a_factor(&self) -> Option<&DMatrix<f32>> {
        self.a.as_ref()
    }

    /// Running output-gradient factor.
    pub fn g_factor(&self) -> Option<&DMatrix<f32>> {
        self.g.as_ref()
    }

    /// Preconditioner computed at the last `t_inv` boundary.
    pub fn decomposition(&self) -> Option<&Decomposition> {
        self.decomposition.as_ref()
    }

    pub fn weight_momentum(&self) -> Option<&[f32]> {
        self.weight_momentum.as_deref()
    }

    pub fn bias_momentum(&self) -> Option<&[f32]> {
        self.bias_momentum.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredLayer {
    id: LayerId,
    module_index: usize,
    kind: LayerKind,
    has_bias: bool,
    pub(crate) state: LayerState,
}

impl RegisteredLayer {
    #[inline]
    pub fn id(&self) -> LayerId {
        self.id
    }

    #[inline]
    pub fn module_index(&self) -> usize {
        self.module_index
    }

    #[inline]
    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    #[inline]
    pub fn has_bias(&self) -> bool {
        self.has_bias
    }

    #[inline]
    pub fn state(&self) -> &LayerState {
        &self.state
    }
}

/// The layers K-FAC tracks, in network order.
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: Vec<RegisteredLayer>,
    by_module: Vec<Option<LayerId>>,
}

impl LayerRegistry {
    /// Walk `net` and keep every linear and conv2d module. Other modules are skipped.
    pub fn register<N: Network + ?Sized>(net: &N) -> Self {
        let modules = net.modules();
        let mut layers = Vec::new();
        let mut by_module = vec![None; modules.len()];

        for (module_index, module) in modules.iter().enumerate() {
            let kind = module.kind();
            if !kind.is_supported() || module.weight().is_none() {
                trace!(module_index, "skipping module without curvature support");
                continue;
            }
            let id = layers.len();
            let has_bias = module.bias().is_some();
            debug!(id, module_index, kind = kind.name(), has_bias, "registered layer");
            layers.push(RegisteredLayer {
                id,
                module_index,
                kind,
                has_bias,
                state: LayerState::default(),
            });
            by_module[module_index] = Some(id);
        }

        Self { layers, by_module }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer id for a module index, if that module is tracked.
    #[inline]
    pub fn lookup(&self, module_index: usize) -> Option<LayerId> {
        self.by_module.get(module_index).copied().flatten()
    }

    #[inline]
    pub fn get(&self, id: LayerId) -> Option<&RegisteredLayer> {
        self.layers.get(id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: LayerId) -> Option<&mut RegisteredLayer> {
        self.layers.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredLayer> {
        self.layers.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisteredLayer> {
        self.layers.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{Activation, SequentialBuilder};

    #[test]
    fn keeps_supported_layers_in_order() {
        let net = SequentialBuilder::new_image(1, 6, 6)
            .unwrap()
            .conv2d(2, (3, 3), (1, 1), (0, 0), true)
            .unwrap()
            .activation(Activation::ReLU)
            .unwrap()
            .flatten()
            .linear(3, false)
            .unwrap()
            .build_with_seed(0)
            .unwrap();

        let reg = LayerRegistry::register(&net);
        assert_eq!(reg.len(), 2);

        let ids: Vec<(LayerId, usize)> = reg.iter().map(|l| (l.id(), l.module_index())).collect();
        assert_eq!(ids, vec![(0, 0), (1, 3)]);
        assert!(reg.get(0).unwrap().has_bias());
        assert!(!reg.get(1).unwrap().has_bias());

        assert_eq!(reg.lookup(0), Some(0));
        assert_eq!(reg.lookup(1), None);
        assert_eq!(reg.lookup(2), None);
        assert_eq!(reg.lookup(3), Some(1));
        assert_eq!(reg.lookup(99), None);
    }

    #[test]
    fn new_layers_have_no_state() {
        let net = SequentialBuilder::new(2)
            .unwrap()
            .linear(2, true)
            .unwrap()
            .build_with_seed(0)
            .unwrap();
        let reg = LayerRegistry::register(&net);
        let state = reg.get(0).unwrap().state();
        assert!(state.a_factor().is_none());
        assert!(state.g_factor().is_none());
        assert!(state.decomposition().is_none());
        assert!(state.weight_momentum().is_none());
    }
}
