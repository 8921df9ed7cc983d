//! Softmax cross-entropy over integer class labels.
//!
//! Intended to be used like:
//!
//! - run `model.forward_with(...)` to get `(batch, classes)` logits
//! - compute the loss and `d_logits` with [`softmax_cross_entropy`]
//! - run `model.backward_with(...)`
//!
//! For the curvature pass, [`sample_labels`] draws one label per row from the model's
//! own predictive distribution, so that the gradients fed to the G-factor estimate the
//! true Fisher rather than the empirical one.

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

use crate::{Error, Result, Tensor};

/// Mean softmax cross-entropy over the batch and its gradient w.r.t. the logits.
///
/// `logits` has shape `(batch, classes)`. Returns `(loss, d_logits)` with
/// `d_logits = (softmax(logits) - onehot(labels)) / batch`.
pub fn softmax_cross_entropy(logits: &Tensor, labels: &[usize]) -> Result<(f32, Tensor)> {
    let (batch, classes) = logit_dims(logits)?;
    if labels.len() != batch {
        return Err(Error::InvalidData(format!(
            "got {} labels for a batch of {batch}",
            labels.len()
        )));
    }

    let inv_b = 1.0 / batch as f32;
    let mut loss = 0.0_f32;
    let mut d_logits = Tensor::zeros(&[batch, classes]);
    let rows = logits.data().chunks_exact(classes);
    let d_rows = d_logits.data_mut().chunks_exact_mut(classes);

    for ((i, (row, d_row)), &label) in rows.zip(d_rows).enumerate().zip(labels) {
        if label >= classes {
            return Err(Error::InvalidData(format!(
                "label {label} of sample {i} is out of range for {classes} classes"
            )));
        }
        let (log_sum_exp, _max) = log_sum_exp_and_max(row);
        loss -= row[label] - log_sum_exp;

        for (d, &x) in d_row.iter_mut().zip(row) {
            *d = (x - log_sum_exp).exp() * inv_b;
        }
        d_row[label] -= inv_b;
    }

    Ok((loss * inv_b, d_logits))
}

/// Row-wise softmax of `(batch, classes)` logits.
pub fn softmax(logits: &Tensor) -> Result<Tensor> {
    let (batch, classes) = logit_dims(logits)?;
    let mut out = Tensor::zeros(&[batch, classes]);
    for (row, p_row) in logits
        .data()
        .chunks_exact(classes)
        .zip(out.data_mut().chunks_exact_mut(classes))
    {
        let (log_sum_exp, _max) = log_sum_exp_and_max(row);
        for (p, &x) in p_row.iter_mut().zip(row) {
            *p = (x - log_sum_exp).exp();
        }
    }
    Ok(out)
}

/// Draw one class per row from `softmax(logits)`.
pub fn sample_labels<R: Rng + ?Sized>(logits: &Tensor, rng: &mut R) -> Result<Vec<usize>> {
    let probs = softmax(logits)?;
    let classes = probs.shape()[1];
    probs
        .data()
        .chunks_exact(classes)
        .map(|row| {
            let dist = WeightedIndex::new(row).map_err(|e| {
                Error::InvalidData(format!("cannot sample from predicted distribution: {e}"))
            })?;
            Ok(dist.sample(rng))
        })
        .collect()
}

fn logit_dims(logits: &Tensor) -> Result<(usize, usize)> {
    logits.expect_rank(2, "logits")?;
    let (batch, classes) = (logits.shape()[0], logits.shape()[1]);
    if batch == 0 || classes == 0 {
        return Err(Error::InvalidShape(format!(
            "logits must be (batch > 0, classes > 0), got {:?}",
            logits.shape()
        )));
    }
    Ok((batch, classes))
}

#[inline]
fn log_sum_exp_and_max(xs: &[f32]) -> (f32, f32) {
    let mut max_x = xs[0];
    for &x in xs.iter().skip(1) {
        if x > max_x {
            max_x = x;
        }
    }
    let mut sum_exp = 0.0_f32;
    for &x in xs {
        sum_exp += (x - max_x).exp();
    }
    (max_x + sum_exp.ln(), max_x)
}
