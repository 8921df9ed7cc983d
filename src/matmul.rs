//! Small GEMM wrapper used by the batched layers and the covariance estimators.
//!
//! This module provides a single abstraction over matrix multiplication:
//! - default: a simple, safe triple-loop implementation
//! - optional: a faster backend via the `matrixmultiply` feature
//!
//! All matrices are addressed through explicit row/column strides so transposed
//! operands never need to be materialized.

#[allow(clippy::too_many_arguments)]
#[inline]
pub(crate) fn gemm_f32(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    rsa: usize,
    csa: usize,
    b: &[f32],
    rsb: usize,
    csb: usize,
    beta: f32,
    c: &mut [f32],
    rsc: usize,
    csc: usize,
) {
    debug_assert!(m > 0 && n > 0 && k > 0);
    debug_assert!(rsa > 0 || m <= 1);
    debug_assert!(csa > 0 || k <= 1);
    debug_assert!(rsb > 0 || k <= 1);
    debug_assert!(csb > 0 || n <= 1);
    debug_assert!(rsc > 0 || m <= 1);
    debug_assert!(csc > 0 || n <= 1);

    #[cfg(feature = "matrixmultiply")]
    {
        // matrixmultiply supports arbitrary strides.
        unsafe {
            matrixmultiply::sgemm(
                m,
                k,
                n,
                alpha,
                a.as_ptr(),
                rsa as isize,
                csa as isize,
                b.as_ptr(),
                rsb as isize,
                csb as isize,
                beta,
                c.as_mut_ptr(),
                rsc as isize,
                csc as isize,
            );
        }
    }

    #[cfg(not(feature = "matrixmultiply"))]
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0_f32;
            let a0 = i * rsa;
            let b0 = j * csb;

            for p in 0..k {
                let av = a[a0 + p * csa];
                let bv = b[p * rsb + b0];
                acc = av.mul_add(bv, acc);
            }

            let idx = i * rsc + j * csc;
            c[idx] = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * c[idx]
            };
        }
    }
}

/// `out = alpha * Aᵀ A` for a row-major `A` with shape `(rows, cols)`.
///
/// `out` is row-major `(cols, cols)` and is overwritten.
#[inline]
pub(crate) fn gram_f32(rows: usize, cols: usize, alpha: f32, a: &[f32], out: &mut [f32]) {
    assert_eq!(a.len(), rows * cols, "gram input has wrong length");
    assert_eq!(out.len(), cols * cols, "gram output has wrong length");
    gemm_f32(cols, cols, rows, alpha, a, 1, cols, a, cols, 1, 0.0, out, cols, 1);
}

/// `out = x Wᵀ` with `x: (batch, in_dim)` and `W: (out_dim, in_dim)`, both row-major.
#[inline]
pub(crate) fn matmul_nt(
    batch: usize,
    in_dim: usize,
    out_dim: usize,
    x: &[f32],
    w: &[f32],
    out: &mut [f32],
) {
    gemm_f32(
        batch, out_dim, in_dim, 1.0, x, in_dim, 1, w, 1, in_dim, 0.0, out, out_dim, 1,
    );
}

/// `out = g W` with `g: (batch, out_dim)` and `W: (out_dim, in_dim)`, both row-major.
#[inline]
pub(crate) fn matmul_nn(
    batch: usize,
    out_dim: usize,
    in_dim: usize,
    g: &[f32],
    w: &[f32],
    out: &mut [f32],
) {
    gemm_f32(
        batch, in_dim, out_dim, 1.0, g, out_dim, 1, w, in_dim, 1, 0.0, out, in_dim, 1,
    );
}

/// `dw += gᵀ x` with `g: (batch, out_dim)` and `x: (batch, in_dim)`; `dw` is `(out_dim, in_dim)`.
#[inline]
pub(crate) fn accumulate_tn(
    batch: usize,
    out_dim: usize,
    in_dim: usize,
    g: &[f32],
    x: &[f32],
    dw: &mut [f32],
) {
    gemm_f32(
        out_dim, in_dim, batch, 1.0, g, 1, out_dim, x, in_dim, 1, 1.0, dw, in_dim, 1,
    );
}
