//! Running (exponential moving average) curvature statistics.

use nalgebra::DMatrix;

use crate::{Error, Result};

/// Upper bound of the moving-average decay.
pub const MAX_STAT_DECAY: f32 = 0.95;

/// Decay used for the statistics gathered after `steps` optimizer steps.
///
/// `min(1 - 1 / (steps / t_cov + 1), 0.95)`: zero at the start (the first observation
/// replaces the zero-initialized store), then approaching `0.95` as more statistics
/// windows have been observed.
///
/// # Panics
///
/// Panics if `t_cov == 0`. [`crate::KfacConfig::validate`] rejects such configs.
#[inline]
pub fn stat_decay(steps: u64, t_cov: u64) -> f32 {
    assert!(t_cov > 0, "t_cov must be > 0");
    let windows = (steps / t_cov + 1) as f32;
    (1.0 - 1.0 / windows).min(MAX_STAT_DECAY)
}

/// `store = decay * store + (1 - decay) * new_stat`.
///
/// The store is created as a zero matrix shaped like `new_stat` on first use. Its shape is
/// fixed afterwards; a statistic of a different shape is rejected.
pub fn update_running_stat(
    store: &mut Option<DMatrix<f32>>,
    new_stat: &DMatrix<f32>,
    decay: f32,
) -> Result<()> {
    let current = store.get_or_insert_with(|| DMatrix::zeros(new_stat.nrows(), new_stat.ncols()));
    if current.shape() != new_stat.shape() {
        return Err(Error::InvalidShape(format!(
            "running statistic is {:?}, new statistic is {:?}",
            current.shape(),
            new_stat.shape()
        )));
    }
    *current *= decay;
    *current += new_stat * (1.0 - decay);
    Ok(())
}
