//! Reference training loop.
//!
//! [`train_step`] is the per-step protocol every host has to follow for K-FAC's
//! statistics to be meaningful:
//!
//! 1. zero gradients, forward with hooks (A-factors are gathered on `t_cov` steps);
//! 2. compute the loss;
//! 3. on `t_cov` steps only: sample labels from the model's softmax, backward with
//!    `accumulate = true` (G-factors), then zero gradients again;
//! 4. backward the real loss with `accumulate = false`;
//! 5. `kfac.step`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::kfac::{Kfac, StepReport};
use crate::loss::{sample_labels, softmax_cross_entropy};
use crate::model::{Network, Sequential};
use crate::{Dataset, Error, Result, Tensor};

/// Loss of the batch and what the optimizer did with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStep {
    pub loss: f32,
    pub report: StepReport,
}

/// Run one full K-FAC training step on a batch.
pub fn train_step<R: Rng + ?Sized>(
    model: &mut Sequential,
    kfac: &mut Kfac,
    inputs: &Tensor,
    labels: &[usize],
    rng: &mut R,
) -> Result<TrainStep> {
    model.zero_grad();
    let logits = model.forward_with(inputs, kfac)?;
    let (loss, d_logits) = softmax_cross_entropy(&logits, labels)?;

    if kfac.is_stats_step() {
        let sampled = sample_labels(&logits, rng)?;
        let (_, d_sampled) = softmax_cross_entropy(&logits, &sampled)?;
        model.backward_with(&d_sampled, kfac, true)?;
        model.zero_grad();
    }

    model.backward_with(&d_logits, kfac, false)?;
    let report = kfac.step(model)?;
    Ok(TrainStep { loss, report })
}

#[derive(Debug, Clone, Copy)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Seed for batch shuffling and label sampling.
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            seed: 0,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be > 0".to_owned()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FitReport {
    /// Mean batch loss per epoch.
    pub epoch_losses: Vec<f32>,
    /// Optimizer steps taken.
    pub steps: u64,
}

impl FitReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Train `model` on `train` with K-FAC, shuffling every epoch.
///
/// Stops at the first error; the model keeps the updates of all earlier steps.
pub fn fit(
    model: &mut Sequential,
    kfac: &mut Kfac,
    train: &Dataset,
    cfg: FitConfig,
) -> Result<FitReport> {
    cfg.validate()?;
    if train.is_empty() {
        return Err(Error::InvalidData(
            "train dataset must not be empty".to_owned(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut epoch_losses = Vec::with_capacity(cfg.epochs);

    for epoch in 0..cfg.epochs {
        let batches = train.shuffled_batches(cfg.batch_size, &mut rng)?;
        let mut total = 0.0_f32;
        for indices in &batches {
            let (x, y) = train.batch(indices)?;
            let step = train_step(model, kfac, &x, &y, &mut rng)?;
            debug!(
                step = step.report.step,
                loss = step.loss,
                nu = step.report.nu,
                "train step"
            );
            total += step.loss;
        }
        let mean = total / batches.len() as f32;
        info!(epoch, loss = mean, steps = kfac.steps(), "epoch finished");
        epoch_losses.push(mean);
    }

    Ok(FitReport {
        epoch_losses,
        steps: kfac.steps(),
    })
}
