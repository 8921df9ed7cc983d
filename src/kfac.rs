//! The K-FAC optimizer.
//!
//! Per step:
//!
//! 1. (hooks, during the host's passes) on `t_cov` steps, fold the batch's A and G
//!    factors into the running statistics;
//! 2. on `t_inv` steps, recompute every layer's decomposition;
//! 3. precondition each layer's gradient with its (possibly stale) decomposition;
//! 4. rescale all natural gradients by one KL-clip factor and write them into the
//!    gradient buffers;
//! 5. weight decay, momentum, parameter update.
//!
//! Only registered layers are touched. Parameters of other modules must be updated by
//! the host, e.g. with a first-order optimizer.

use tracing::{debug, trace};

use crate::config::KfacConfig;
use crate::covariance::{compute_cov_a, compute_cov_g};
use crate::inverse::Decomposition;
use crate::layer::Parameter;
use crate::model::Network;
use crate::natural::{NaturalGradient, matrix_form_grad, natural_gradient, split_natural_gradient};
use crate::registry::{CurvatureHooks, LayerId, LayerRegistry, LayerState};
use crate::stats::{stat_decay, update_running_stat};
use crate::trust_region::{kl_clip_scale, layer_vg};
use crate::{Error, Result, Tensor};

/// What one call to [`Kfac::step`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Step counter value the step ran at (before incrementing).
    pub step: u64,
    /// Predicted quadratic change `Σ v · g · lr²` before clipping.
    pub vg_sum: f32,
    /// KL-clip scale applied to every natural gradient.
    pub nu: f32,
    /// Whether the decompositions were recomputed during this step.
    pub inverted: bool,
}

#[derive(Debug, Clone)]
pub struct Kfac {
    config: KfacConfig,
    registry: LayerRegistry,
    steps: u64,
    stat_decay: f32,
}

impl Kfac {
    /// Validate `config` and register every linear and conv2d module of `net`.
    pub fn new<N: Network + ?Sized>(net: &N, config: KfacConfig) -> Result<Self> {
        config.validate()?;
        let registry = LayerRegistry::register(net);
        if registry.is_empty() {
            return Err(Error::InvalidConfig(
                "network has no linear or conv2d layers for K-FAC to track".to_owned(),
            ));
        }
        debug!(layers = registry.len(), solver = ?config.solver, "created K-FAC optimizer");
        Ok(Self {
            config,
            registry,
            steps: 0,
            stat_decay: 0.0,
        })
    }

    #[inline]
    pub fn config(&self) -> &KfacConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    pub fn layer_state(&self, id: LayerId) -> Option<&LayerState> {
        self.registry.get(id).map(|l| l.state())
    }

    /// Number of completed steps.
    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[inline]
    pub fn t_cov(&self) -> u64 {
        self.config.t_cov
    }

    #[inline]
    pub fn t_inv(&self) -> u64 {
        self.config.t_inv
    }

    /// Whether the current step accumulates statistics. The host runs the extra
    /// sampled-label backward pass exactly on these steps.
    #[inline]
    pub fn is_stats_step(&self) -> bool {
        self.steps % self.config.t_cov == 0
    }

    #[inline]
    pub fn is_inverse_step(&self) -> bool {
        self.steps % self.config.t_inv == 0
    }

    /// Decay that statistics gathered in the current step are blended with.
    ///
    /// Computed at the end of the previous step.
    #[inline]
    pub fn stat_decay(&self) -> f32 {
        self.stat_decay
    }

    #[inline]
    pub fn lr(&self) -> f32 {
        self.config.lr
    }

    /// Change the learning rate (for host-side schedules).
    pub fn set_lr(&mut self, lr: f32) -> Result<()> {
        if !(lr.is_finite() && lr >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate must be finite and >= 0, got {lr}"
            )));
        }
        self.config.lr = lr;
        Ok(())
    }

    /// Recompute every layer's decomposition if the current step is a `t_inv` boundary.
    ///
    /// Returns whether anything was recomputed. Off-boundary this is a no-op. On failure
    /// no layer's decomposition is replaced.
    pub fn update_inverses(&mut self) -> Result<bool> {
        let Some(fresh) = self.fresh_decompositions()? else {
            return Ok(false);
        };
        self.commit_decompositions(fresh);
        Ok(true)
    }

    /// Natural gradient of every registered layer, in registration order.
    pub fn natural_gradients<N: Network + ?Sized>(&self, net: &N) -> Result<Vec<NaturalGradient>> {
        self.natural_gradients_with(net, None)
    }

    /// Decompositions of the current factors, or `None` off a `t_inv` boundary.
    fn fresh_decompositions(&self) -> Result<Option<Vec<Decomposition>>> {
        if !self.is_inverse_step() {
            return Ok(None);
        }

        let solver = self.config.solver;
        let damping = self.config.damping;
        let mut fresh = Vec::with_capacity(self.registry.len());
        for layer in self.registry.iter() {
            let state = layer.state();
            let a = state.a_factor().ok_or(Error::MissingStatistics {
                layer: layer.id(),
                factor: "A",
            })?;
            let g = state.g_factor().ok_or(Error::MissingStatistics {
                layer: layer.id(),
                factor: "G",
            })?;
            fresh.push(Decomposition::compute(a, g, solver, damping)?);
        }
        Ok(Some(fresh))
    }

    fn commit_decompositions(&mut self, fresh: Vec<Decomposition>) {
        for (layer, decomposition) in self.registry.iter_mut().zip(fresh) {
            layer.state.decomposition = Some(decomposition);
        }
        let solver = self.config.solver;
        debug!(step = self.steps, ?solver, "recomputed curvature decompositions");
    }

    /// Like [`Kfac::natural_gradients`], preferring `fresh` (indexed by layer id) over
    /// the cached decompositions.
    fn natural_gradients_with<N: Network + ?Sized>(
        &self,
        net: &N,
        fresh: Option<&[Decomposition]>,
    ) -> Result<Vec<NaturalGradient>> {
        let modules = net.modules();
        let mut out = Vec::with_capacity(self.registry.len());
        for (i, layer) in self.registry.iter().enumerate() {
            let module = modules.get(layer.module_index()).ok_or_else(|| {
                Error::InvalidShape(format!(
                    "network has no module {} (registered as layer {})",
                    layer.module_index(),
                    layer.id()
                ))
            })?;
            let decomposition = match fresh {
                Some(fresh) => fresh.get(i),
                None => layer.state().decomposition(),
            }
            .ok_or(Error::MissingStatistics {
                layer: layer.id(),
                factor: "decomposition",
            })?;
            let (rows, cols) = layer.kind().weight_matrix_dims().ok_or_else(|| {
                Error::UnsupportedLayer(format!("layer {} has no weight matrix", layer.id()))
            })?;

            let grad = matrix_form_grad(module.as_ref(), rows, cols)?;
            let v = natural_gradient(decomposition, &grad, self.config.damping)?;
            out.push(split_natural_gradient(&v, layer.has_bias()));
        }
        Ok(out)
    }

    /// Run one optimizer step on `net`, whose gradient buffers hold the loss gradient.
    ///
    /// Errors are fatal for the step. They are raised before any gradient, parameter,
    /// momentum buffer or the step counter is modified.
    pub fn step<N: Network + ?Sized>(&mut self, net: &mut N) -> Result<StepReport> {
        let step = self.steps;
        let fresh = self.fresh_decompositions()?;
        let updates = self.natural_gradients_with(net, fresh.as_deref())?;

        let lr = self.config.lr;
        let modules = net.modules_mut();
        let mut vg_sum = 0.0_f32;
        for (layer, natural) in self.registry.iter().zip(&updates) {
            let module = &modules[layer.module_index()];
            let weight = module.weight().map_or(&[][..], Parameter::grad);
            vg_sum += layer_vg(natural, weight, module.bias().map(Parameter::grad), lr);
        }
        let nu = kl_clip_scale(vg_sum, self.config.kl_clip)?;

        let inverted = fresh.is_some();
        if let Some(fresh) = fresh {
            self.commit_decompositions(fresh);
        }
        let KfacConfig {
            momentum,
            weight_decay,
            ..
        } = self.config;
        for (layer, natural) in self.registry.iter_mut().zip(updates) {
            let module = &mut modules[layer.module_index()];
            if let Some(w) = module.weight_mut() {
                apply_update(
                    w,
                    &natural.weight,
                    nu,
                    lr,
                    momentum,
                    weight_decay,
                    &mut layer.state.weight_momentum,
                );
            }
            if let (Some(b), Some(nb)) = (module.bias_mut(), natural.bias.as_deref()) {
                apply_update(
                    b,
                    nb,
                    nu,
                    lr,
                    momentum,
                    weight_decay,
                    &mut layer.state.bias_momentum,
                );
            }
        }

        self.steps += 1;
        self.stat_decay = stat_decay(self.steps, self.config.t_cov);
        debug!(step, vg_sum, nu, inverted, "kfac step");
        Ok(StepReport {
            step,
            vg_sum,
            nu,
            inverted,
        })
    }
}

/// Overwrite the gradient with the clipped natural gradient, then apply weight decay,
/// momentum and the parameter update (no Nesterov, no dampening).
fn apply_update(
    param: &mut Parameter,
    natural: &[f32],
    nu: f32,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    buf: &mut Option<Vec<f32>>,
) {
    let (value, grad) = param.value_and_grad_mut();
    debug_assert_eq!(grad.len(), natural.len());

    for (g, &v) in grad.iter_mut().zip(natural) {
        *g = v * nu;
    }
    if weight_decay != 0.0 {
        for (g, &p) in grad.iter_mut().zip(value.iter()) {
            *g = weight_decay.mul_add(p, *g);
        }
    }

    let direction: &[f32] = if momentum != 0.0 {
        if let Some(b) = buf.as_mut() {
            for (b, &g) in b.iter_mut().zip(grad.iter()) {
                *b = momentum.mul_add(*b, g);
            }
        } else {
            *buf = Some(grad.to_vec());
        }
        buf.as_deref().unwrap_or(grad)
    } else {
        grad
    };

    for (p, &d) in value.iter_mut().zip(direction) {
        *p -= lr * d;
    }
}

impl CurvatureHooks for Kfac {
    fn on_forward(&mut self, module: usize, input: &Tensor) -> Result<()> {
        if !self.is_stats_step() {
            return Ok(());
        }
        let Some(id) = self.registry.lookup(module) else {
            return Ok(());
        };
        let decay = self.stat_decay;
        let Some(layer) = self.registry.get_mut(id) else {
            return Ok(());
        };

        let aa = compute_cov_a(input, layer.kind(), layer.has_bias())?;
        update_running_stat(&mut layer.state.a, &aa, decay)?;
        trace!(layer = id, decay, "updated A-factor");
        Ok(())
    }

    fn on_backward(&mut self, module: usize, grad_output: &Tensor, accumulate: bool) -> Result<()> {
        if !accumulate || !self.is_stats_step() {
            return Ok(());
        }
        let Some(id) = self.registry.lookup(module) else {
            return Ok(());
        };
        let decay = self.stat_decay;
        let batch_averaged = self.config.batch_averaged;
        let Some(layer) = self.registry.get_mut(id) else {
            return Ok(());
        };

        let gg = compute_cov_g(grad_output, layer.kind(), batch_averaged)?;
        update_running_stat(&mut layer.state.g, &gg, decay)?;
        trace!(layer = id, decay, "updated G-factor");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::config::Solver;
    use crate::{Linear, Sequential, SequentialBuilder};

    fn single_linear(weights: Vec<f32>, bias: Option<Vec<f32>>, in_dim: usize) -> Sequential {
        let out_dim = weights.len() / in_dim;
        let mut net = Sequential::new();
        net.push(Linear::from_parts(in_dim, out_dim, weights, bias).unwrap());
        net
    }

    /// One forward, one sampled-style backward with `accumulate`, one real backward.
    fn pass(kfac: &mut Kfac, net: &mut Sequential, x: &Tensor, g: &Tensor) {
        net.zero_grad();
        net.forward_with(x, kfac).unwrap();
        if kfac.is_stats_step() {
            net.backward_with(g, kfac, true).unwrap();
            net.zero_grad();
        }
        net.backward_with(g, kfac, false).unwrap();
    }

    #[test]
    fn rejects_invalid_config_and_empty_networks() {
        let net = single_linear(vec![1.0], None, 1);
        let cfg = KfacConfig {
            lr: -1.0,
            ..KfacConfig::default()
        };
        assert!(matches!(Kfac::new(&net, cfg), Err(Error::InvalidConfig(_))));

        let empty = Sequential::new();
        assert!(Kfac::new(&empty, KfacConfig::default()).is_err());
    }

    #[test]
    fn hooks_only_accumulate_on_stats_steps() {
        let mut net = single_linear(vec![1.0, 0.0], None, 2);
        let cfg = KfacConfig {
            t_cov: 2,
            t_inv: 2,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[1, 2], vec![1.0, 2.0]).unwrap();
        let g = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();

        // Real backward only: G must not be touched.
        net.forward_with(&x, &mut kfac).unwrap();
        net.backward_with(&g, &mut kfac, false).unwrap();
        let state = kfac.layer_state(0).unwrap();
        assert!(state.a_factor().is_some());
        assert!(state.g_factor().is_none());

        net.backward_with(&g, &mut kfac, true).unwrap();
        assert!(kfac.layer_state(0).unwrap().g_factor().is_some());
    }

    #[test]
    fn step_without_statistics_reports_missing_factor() {
        let mut net = single_linear(vec![1.0], None, 1);
        let mut kfac = Kfac::new(&net, KfacConfig::default()).unwrap();
        let err = kfac.step(&mut net).unwrap_err();
        assert!(matches!(err, Error::MissingStatistics { layer: 0, .. }));
        assert_eq!(kfac.steps(), 0);
    }

    #[test]
    fn first_step_matches_hand_computation() {
        // 1x1 layer, no bias. A = x² = 4, G = g² * batch = 1 (batch-averaged, batch 1).
        let mut net = single_linear(vec![1.0], None, 1);
        let cfg = KfacConfig {
            lr: 0.1,
            momentum: 0.0,
            damping: 0.0,
            kl_clip: 1.0,
            solver: Solver::Eigen,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[1, 1], vec![2.0]).unwrap();
        let g = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        pass(&mut kfac, &mut net, &x, &g);

        // raw grad dW = g * x = 2; natural = 2 / (1 * 4) = 0.5
        let report = kfac.step(&mut net).unwrap();
        assert!(report.inverted);
        assert_abs_diff_eq!(report.vg_sum, 0.5 * 2.0 * 0.01, epsilon = 1e-7);
        assert_eq!(report.nu, 1.0);

        let w = net.modules()[0].weight().unwrap();
        assert_abs_diff_eq!(w.grad()[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(w.value()[0], 1.0 - 0.1 * 0.5, epsilon = 1e-6);
        assert_eq!(kfac.steps(), 1);
        assert_eq!(kfac.stat_decay(), 0.0);
    }

    #[test]
    fn momentum_buffer_starts_as_first_gradient() {
        let mut net = single_linear(vec![1.0], Some(vec![0.0]), 1);
        let cfg = KfacConfig {
            lr: 0.1,
            momentum: 0.9,
            damping: 1e-3,
            kl_clip: 1.0,
            t_cov: 1,
            t_inv: 1,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[2, 1], vec![1.0, -1.0]).unwrap();
        let g = Tensor::from_vec(&[2, 1], vec![0.5, 0.25]).unwrap();

        pass(&mut kfac, &mut net, &x, &g);
        kfac.step(&mut net).unwrap();
        let first = kfac.layer_state(0).unwrap().weight_momentum().unwrap().to_vec();
        let grad_after_first = net.modules()[0].weight().unwrap().grad().to_vec();
        assert_eq!(first, grad_after_first);
        assert!(kfac.layer_state(0).unwrap().bias_momentum().is_some());

        pass(&mut kfac, &mut net, &x, &g);
        kfac.step(&mut net).unwrap();
        let second = kfac.layer_state(0).unwrap().weight_momentum().unwrap()[0];
        let grad = net.modules()[0].weight().unwrap().grad()[0];
        assert_abs_diff_eq!(second, 0.9 * first[0] + grad, epsilon = 1e-6);
    }

    #[test]
    fn weight_decay_is_added_to_the_gradient() {
        let mut net = single_linear(vec![2.0], None, 1);
        let cfg = KfacConfig {
            lr: 0.1,
            momentum: 0.0,
            damping: 0.0,
            kl_clip: 1.0,
            weight_decay: 0.5,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        let g = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        pass(&mut kfac, &mut net, &x, &g);
        kfac.step(&mut net).unwrap();

        // natural = 1 / (1 * 1) = 1; grad = 1 + 0.5 * 2 = 2; w = 2 - 0.1 * 2
        let w = net.modules()[0].weight().unwrap();
        assert_abs_diff_eq!(w.grad()[0], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w.value()[0], 1.8, epsilon = 1e-6);
    }

    #[test]
    fn large_updates_are_clipped() {
        let mut net = single_linear(vec![1.0], None, 1);
        let cfg = KfacConfig {
            lr: 1.0,
            momentum: 0.0,
            damping: 0.0,
            kl_clip: 0.25,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        let g = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        pass(&mut kfac, &mut net, &x, &g);

        // natural = 1, raw = 1, vg_sum = 1 = 4 * kl_clip -> nu = 0.5
        let report = kfac.step(&mut net).unwrap();
        assert_abs_diff_eq!(report.nu, 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(net.modules()[0].weight().unwrap().grad()[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn damped_inverse_with_zero_input_is_degenerate_and_leaves_state_untouched() {
        let mut net = single_linear(vec![1.0], None, 1);
        let cfg = KfacConfig {
            solver: Solver::DampedInverse,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[1, 1], vec![0.0]).unwrap();
        let g = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        pass(&mut kfac, &mut net, &x, &g);

        let before = net.modules()[0].weight().unwrap().clone();
        let err = kfac.step(&mut net).unwrap_err();
        assert!(matches!(err, Error::DegenerateCurvature(_)));
        assert_eq!(net.modules()[0].weight().unwrap(), &before);
        assert!(kfac.layer_state(0).unwrap().decomposition().is_none());
        assert_eq!(kfac.steps(), 0);
    }

    #[test]
    fn rejected_trust_region_does_not_commit_decompositions() {
        let mut net = single_linear(vec![1.0], None, 1);
        let cfg = KfacConfig {
            lr: 0.0,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        let g = Tensor::from_vec(&[1, 1], vec![1.0]).unwrap();
        pass(&mut kfac, &mut net, &x, &g);

        // The factors are fine; lr = 0 zeroes vg_sum.
        let err = kfac.step(&mut net).unwrap_err();
        assert!(matches!(err, Error::DegenerateCurvature(_)));
        assert!(kfac.layer_state(0).unwrap().decomposition().is_none());
        assert_eq!(net.modules()[0].weight().unwrap().grad(), &[1.0]);
    }

    #[test]
    fn decompositions_are_stale_between_boundaries() {
        let mut net = SequentialBuilder::new(3)
            .unwrap()
            .linear(2, true)
            .unwrap()
            .build_with_seed(1)
            .unwrap();
        let cfg = KfacConfig {
            t_cov: 1,
            t_inv: 3,
            kl_clip: 1e6,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&net, cfg).unwrap();
        let x = Tensor::from_vec(&[2, 3], vec![0.1, 0.2, 0.3, -0.4, 0.5, 0.6]).unwrap();
        let g = Tensor::from_vec(&[2, 2], vec![0.3, -0.1, 0.2, 0.4]).unwrap();

        pass(&mut kfac, &mut net, &x, &g);
        assert!(kfac.step(&mut net).unwrap().inverted);
        let snapshot = kfac.layer_state(0).unwrap().decomposition().cloned();

        pass(&mut kfac, &mut net, &x, &g);
        assert!(!kfac.step(&mut net).unwrap().inverted);
        assert_eq!(kfac.layer_state(0).unwrap().decomposition().cloned(), snapshot);

        // Off-boundary inversion requests are no-ops.
        assert!(!kfac.update_inverses().unwrap());
        assert!(!kfac.update_inverses().unwrap());
        assert_eq!(kfac.layer_state(0).unwrap().decomposition().cloned(), snapshot);
    }

    #[test]
    fn set_lr_validates() {
        let net = single_linear(vec![1.0], None, 1);
        let mut kfac = Kfac::new(&net, KfacConfig::default()).unwrap();
        assert!(kfac.set_lr(-0.1).is_err());
        kfac.set_lr(0.5).unwrap();
        assert_eq!(kfac.lr(), 0.5);
    }
}
