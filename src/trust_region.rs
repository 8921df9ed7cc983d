//! KL-clipping.
//!
//! Under the quadratic model, applying the natural gradient `v` with learning rate `lr`
//! changes the loss by roughly `lr² · vᵀ F v = lr² · vᵀ g`. The sum over all layers is
//! bounded by the `kl_clip` budget with a single global scale `nu`.

use crate::natural::NaturalGradient;
use crate::{Error, Result};

/// `Σ v · g · lr²` for one layer (weight and optional bias).
pub fn layer_vg(
    natural: &NaturalGradient,
    weight_grad: &[f32],
    bias_grad: Option<&[f32]>,
    lr: f32,
) -> f32 {
    debug_assert_eq!(natural.weight.len(), weight_grad.len());
    let lr2 = lr * lr;
    let mut sum = dot(&natural.weight, weight_grad) * lr2;
    if let (Some(v), Some(g)) = (&natural.bias, bias_grad) {
        debug_assert_eq!(v.len(), g.len());
        sum += dot(v, g) * lr2;
    }
    sum
}

/// `nu = min(1, sqrt(kl_clip / vg_sum))`.
///
/// A non-positive (or NaN) `vg_sum` means the curvature estimate and the gradient
/// disagree; that is fatal for the step.
pub fn kl_clip_scale(vg_sum: f32, kl_clip: f32) -> Result<f32> {
    if vg_sum == 0.0 {
        return Err(Error::DegenerateCurvature(
            "trust-region sum vg_sum must be non-zero".to_owned(),
        ));
    }
    if !(vg_sum > 0.0) {
        return Err(Error::DegenerateCurvature(format!(
            "trust-region sum vg_sum must be positive, got {vg_sum}"
        )));
    }
    Ok((kl_clip / vg_sum).sqrt().min(1.0))
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0, |acc, (&x, &y)| x.mul_add(y, acc))
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    fn nat(weight: Vec<f32>, bias: Option<Vec<f32>>) -> NaturalGradient {
        NaturalGradient { weight, bias }
    }

    #[test]
    fn sum_at_budget_is_not_clipped() {
        let lr = 0.5;
        let kl_clip = 0.5;
        // Each layer contributes v·g·lr² = 1.0 * 0.25, exact in binary.
        let l1 = layer_vg(&nat(vec![1.0], None), &[1.0], None, lr);
        let l2 = layer_vg(&nat(vec![0.5], Some(vec![0.5])), &[1.0], Some(&[1.0]), lr);
        let total = l1 + l2;
        assert_eq!(total, kl_clip);
        assert_eq!(kl_clip_scale(total, kl_clip).unwrap(), 1.0);
    }

    #[test]
    fn four_times_the_budget_halves_the_step() {
        let kl_clip = 1e-3;
        assert_abs_diff_eq!(kl_clip_scale(4.0 * kl_clip, kl_clip).unwrap(), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn small_sums_are_never_scaled_up() {
        assert_eq!(kl_clip_scale(1e-9, 1e-3).unwrap(), 1.0);
    }

    #[test]
    fn non_positive_sum_is_degenerate() {
        assert!(matches!(
            kl_clip_scale(0.0, 1e-3),
            Err(Error::DegenerateCurvature(_))
        ));
        assert!(matches!(
            kl_clip_scale(-1.0, 1e-3),
            Err(Error::DegenerateCurvature(_))
        ));
        assert!(kl_clip_scale(f32::NAN, 1e-3).is_err());
    }
}
