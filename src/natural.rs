//! Natural gradient transform.
//!
//! With `F ≈ G ⊗ A`, the preconditioned gradient of a layer is `G⁻¹ ∇W A⁻¹`, where `∇W`
//! is the weight gradient in matrix form `(out, in)` with the bias gradient appended as
//! an extra column. The full Fisher block is never materialized.

use nalgebra::DMatrix;

use crate::inverse::Decomposition;
use crate::layer::Module;
use crate::{Error, Result};

/// Natural gradient split back into parameter layouts.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalGradient {
    /// Same layout as the weight (`(out, in)` or `(out_c, in_c, kh, kw)`, row-major).
    pub weight: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

/// Gather `[∇W | ∇b]` as a `(rows, cols [+1])` matrix.
///
/// `rows x cols` is the weight's matrix view: `(out_dim, in_dim)` for linear layers,
/// `(out_channels, in_channels * kh * kw)` for convolutions.
pub fn matrix_form_grad(module: &dyn Module, rows: usize, cols: usize) -> Result<DMatrix<f32>> {
    let weight = module
        .weight()
        .ok_or_else(|| Error::UnsupportedLayer("module has no weight".to_owned()))?;
    if weight.len() != rows * cols {
        return Err(Error::InvalidShape(format!(
            "weight has {} elements, expected {rows} x {cols}",
            weight.len()
        )));
    }

    let bias = module.bias();
    if let Some(b) = bias
        && b.len() != rows
    {
        return Err(Error::InvalidShape(format!(
            "bias has {} elements, expected {rows}",
            b.len()
        )));
    }

    let total_cols = cols + usize::from(bias.is_some());
    let dw = weight.grad();
    Ok(DMatrix::from_fn(rows, total_cols, |r, c| {
        if c < cols {
            dw[r * cols + c]
        } else {
            bias.map_or(0.0, |b| b.grad()[r])
        }
    }))
}

/// Precondition a gradient matrix with one layer's decomposition.
///
/// - eigen: `Q_g ((Q_gᵀ M Q_a) ⊘ (d_g d_aᵀ + damping)) Q_aᵀ`
/// - inverse: `G⁻¹ M A⁻¹`
pub fn natural_gradient(
    decomposition: &Decomposition,
    grad: &DMatrix<f32>,
    damping: f32,
) -> Result<DMatrix<f32>> {
    let (a_dim, g_dim) = match decomposition {
        Decomposition::Eigen { a, g } => (a.dim(), g.dim()),
        Decomposition::Inverse { inv_a, inv_g } => (inv_a.nrows(), inv_g.nrows()),
    };
    if grad.shape() != (g_dim, a_dim) {
        return Err(Error::InvalidShape(format!(
            "gradient matrix is {:?}, factors expect ({g_dim}, {a_dim})",
            grad.shape()
        )));
    }

    let v = match decomposition {
        Decomposition::Eigen { a, g } => {
            let mut v1 = g.q.transpose() * grad * &a.q;
            for j in 0..a_dim {
                for i in 0..g_dim {
                    v1[(i, j)] /= g.d[i] * a.d[j] + damping;
                }
            }
            &g.q * v1 * a.q.transpose()
        }
        Decomposition::Inverse { inv_a, inv_g } => inv_g * grad * inv_a,
    };
    Ok(v)
}

/// Split `[V_w | v_b]` back into the row-major weight layout and the bias vector.
pub fn split_natural_gradient(v: &DMatrix<f32>, has_bias: bool) -> NaturalGradient {
    let rows = v.nrows();
    let cols = v.ncols() - usize::from(has_bias);
    let mut weight = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            weight.push(v[(r, c)]);
        }
    }
    let bias = has_bias.then(|| (0..rows).map(|r| v[(r, cols)]).collect());
    NaturalGradient { weight, bias }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    use crate::inverse::EigenFactor;
    use crate::{Linear, Module, Tensor};

    #[test]
    fn matrix_form_appends_bias_column() {
        let mut layer = Linear::from_parts(2, 2, vec![0.0; 4], Some(vec![0.0; 2])).unwrap();
        layer.weight_mut().unwrap().grad_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.bias_mut().unwrap().grad_mut().copy_from_slice(&[5.0, 6.0]);

        let m = matrix_form_grad(&layer, 2, 2).unwrap();
        let expected = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
        assert_eq!(m, expected);

        let split = split_natural_gradient(&m, true);
        assert_eq!(split.weight, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(split.bias, Some(vec![5.0, 6.0]));
    }

    #[test]
    fn matrix_form_checks_dims() {
        let layer = Linear::new(3, 2, false);
        assert!(matrix_form_grad(&layer, 2, 2).is_err());
        assert_eq!(matrix_form_grad(&layer, 2, 3).unwrap().shape(), (2, 3));
    }

    #[test]
    fn eigen_mode_without_damping_matches_explicit_inverse() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0_f32, 0.5, 0.5, 1.0]);
        let g = DMatrix::from_row_slice(3, 3, &[3.0_f32, 0.2, 0.0, 0.2, 2.0, 0.1, 0.0, 0.1, 1.5]);
        let grad = DMatrix::from_row_slice(3, 2, &[1.0_f32, -1.0, 0.5, 2.0, -0.3, 0.7]);

        let eig = Decomposition::Eigen {
            a: EigenFactor::new(&a),
            g: EigenFactor::new(&g),
        };
        let v = natural_gradient(&eig, &grad, 0.0).unwrap();

        let explicit = Decomposition::Inverse {
            inv_a: a.clone().try_inverse().unwrap(),
            inv_g: g.clone().try_inverse().unwrap(),
        };
        let expected = natural_gradient(&explicit, &grad, 0.0).unwrap();
        assert_abs_diff_eq!(v, expected, epsilon = 1e-4);
    }

    #[test]
    fn identity_factors_shrink_by_damping() {
        let eig = Decomposition::Eigen {
            a: EigenFactor::new(&DMatrix::identity(2, 2)),
            g: EigenFactor::new(&DMatrix::identity(1, 1)),
        };
        let grad = DMatrix::from_row_slice(1, 2, &[2.0_f32, 4.0]);
        let v = natural_gradient(&eig, &grad, 1.0).unwrap();
        assert_abs_diff_eq!(v, DMatrix::from_row_slice(1, 2, &[1.0, 2.0]), epsilon = 1e-6);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let eig = Decomposition::Eigen {
            a: EigenFactor::new(&DMatrix::identity(2, 2)),
            g: EigenFactor::new(&DMatrix::identity(2, 2)),
        };
        let grad = DMatrix::<f32>::zeros(2, 3);
        assert!(natural_gradient(&eig, &grad, 0.0).is_err());
    }

    #[test]
    fn conv_weight_is_viewed_as_out_by_patch() {
        use crate::{Conv2d, Conv2dGeometry};
        let geom = Conv2dGeometry::new(2, 3, (2, 2), (1, 1), (0, 0)).unwrap();
        let mut conv = Conv2d::new(geom, false);
        let x = Tensor::from_vec(&[1, 2, 2, 2], vec![1.0; 8]).unwrap();
        let y = conv.forward(&x).unwrap();
        conv.backward(&Tensor::from_vec(y.shape(), vec![1.0; y.len()]).unwrap())
            .unwrap();
        let m = matrix_form_grad(&conv, 3, geom.patch_len()).unwrap();
        assert_eq!(m.shape(), (3, 8));
        assert!(m.iter().all(|&v| v == 1.0));
    }
}
