//! Factor inversion.
//!
//! The expensive part of K-FAC. Each registered layer's A and G factors are turned into
//! a preconditioner either by a symmetric eigendecomposition or by factored Tikhonov
//! damping followed by an explicit inverse. The result is cached by the optimizer and
//! reused until the next `t_inv` boundary.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::config::Solver;
use crate::{Error, Result};

/// Eigenvalues at or below this value are zeroed.
pub const EIGENVALUE_FLOOR: f32 = 1e-10;

/// `m = q diag(d) qᵀ`, with `q` orthonormal (one eigenvector per column).
#[derive(Debug, Clone, PartialEq)]
pub struct EigenFactor {
    pub q: DMatrix<f32>,
    pub d: DVector<f32>,
}

impl EigenFactor {
    /// Decompose a symmetric matrix, zeroing near-singular directions.
    ///
    /// Zeroed eigenvalues keep their eigenvector: the factor keeps its dimension.
    pub fn new(m: &DMatrix<f32>) -> Self {
        let eig = SymmetricEigen::new(m.clone());
        let d = eig
            .eigenvalues
            .map(|v| if v > EIGENVALUE_FLOOR { v } else { 0.0 });
        Self {
            q: eig.eigenvectors,
            d,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.d.len()
    }

    /// `q diag(d) qᵀ`.
    pub fn reconstruct(&self) -> DMatrix<f32> {
        &self.q * DMatrix::from_diagonal(&self.d) * self.q.transpose()
    }
}

/// Per-layer preconditioner state.
#[derive(Debug, Clone, PartialEq)]
pub enum Decomposition {
    Eigen { a: EigenFactor, g: EigenFactor },
    Inverse { inv_a: DMatrix<f32>, inv_g: DMatrix<f32> },
}

impl Decomposition {
    /// Build the preconditioner for one layer from its running factors.
    pub fn compute(
        a: &DMatrix<f32>,
        g: &DMatrix<f32>,
        solver: Solver,
        damping: f32,
    ) -> Result<Self> {
        match solver {
            Solver::Eigen => Ok(Decomposition::Eigen {
                a: EigenFactor::new(a),
                g: EigenFactor::new(g),
            }),
            Solver::DampedInverse => {
                let (inv_a, inv_g) = damped_inverse(a, g, damping)?;
                Ok(Decomposition::Inverse { inv_a, inv_g })
            }
        }
    }

    pub fn solver(&self) -> Solver {
        match self {
            Decomposition::Eigen { .. } => Solver::Eigen,
            Decomposition::Inverse { .. } => Solver::DampedInverse,
        }
    }
}

/// `pi = (tr(A) * dim(G)) / (tr(G) * dim(A))`, the ratio of average eigenvalues used to
/// split the damping between the two factors.
pub fn pi_correction(a: &DMatrix<f32>, g: &DMatrix<f32>) -> Result<f32> {
    let numer = a.trace() * g.nrows() as f32;
    let denom = g.trace() * a.nrows() as f32;
    if !(numer > 0.0) {
        return Err(Error::DegenerateCurvature(format!(
            "trace(A) must be positive, got {}",
            a.trace()
        )));
    }
    if !(denom > 0.0) {
        return Err(Error::DegenerateCurvature(format!(
            "trace(G) must be positive, got {}",
            g.trace()
        )));
    }
    Ok(numer / denom)
}

/// `((A + sqrt(damping * pi) I)⁻¹, (G + sqrt(damping / pi) I)⁻¹)`.
pub fn damped_inverse(
    a: &DMatrix<f32>,
    g: &DMatrix<f32>,
    damping: f32,
) -> Result<(DMatrix<f32>, DMatrix<f32>)> {
    let pi = pi_correction(a, g)?;
    let inv_a = add_diagonal(a, (damping * pi).sqrt())
        .try_inverse()
        .ok_or_else(|| Error::DegenerateCurvature("damped A-factor is singular".to_owned()))?;
    let inv_g = add_diagonal(g, (damping / pi).sqrt())
        .try_inverse()
        .ok_or_else(|| Error::DegenerateCurvature("damped G-factor is singular".to_owned()))?;
    Ok((inv_a, inv_g))
}

fn add_diagonal(m: &DMatrix<f32>, value: f32) -> DMatrix<f32> {
    let mut out = m.clone();
    for i in 0..out.nrows() {
        out[(i, i)] += value;
    }
    out
}
