//! Linear algebra helpers for covariance factors and log-space arithmetic.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn cholesky_factor(cov: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!     pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!     pub fn log_det_from_cholesky(l: &DMatrix<f64>) -> f64
//!     pub fn logsumexp(values: impl IntoIterator<Item = f64>) -> f64
//!
//! Strategy for factorizing a covariance:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Diagonal P with non-negative entries → element-wise square root of the diagonal
//! 4) Anything else is a numerical error; covariances are expected to be valid on input.

use log::warn;
use nalgebra::DMatrix;
use nalgebra::linalg::Cholesky;

use crate::error::{RbpfError, Result};

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Lower-triangular factor `L` with `cov ≈ L Lᵀ`.
///
/// Positive definite matrices go through a plain Cholesky decomposition. Diagonal matrices
/// with zero entries (e.g. a process noise that only excites some state components) are
/// positive semi-definite and cannot be Cholesky-factorized, but their square-root factor is
/// just the square root of the diagonal.
///
/// # Errors
/// `RbpfError::Configuration` for a non-square input, `RbpfError::Numerical` when the matrix is
/// neither positive definite nor diagonal with non-negative entries.
pub fn cholesky_factor(cov: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if !cov.is_square() {
        return Err(RbpfError::config(format!(
            "covariance must be square, got {}x{}",
            cov.nrows(),
            cov.ncols()
        )));
    }
    let p = symmetrize(cov);
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Ok(ch.l());
    }
    if is_diagonal(&p) && p.diagonal().iter().all(|v| *v >= 0.0) {
        warn!("covariance is only positive semi-definite, using diagonal square root");
        return Ok(DMatrix::from_diagonal(&p.diagonal().map(f64::sqrt)));
    }
    Err(RbpfError::numerical(
        "covariance is not positive definite and not diagonal",
    ))
}

/// True when every off-diagonal entry is exactly zero.
pub fn is_diagonal(m: &DMatrix<f64>) -> bool {
    for j in 0..m.ncols() {
        for i in 0..m.nrows() {
            if i != j && m[(i, j)] != 0.0 {
                return false;
            }
        }
    }
    true
}

/// Diagonal loads tried, in order, when `spd_solve` meets a matrix that is not numerically
/// positive definite.
const SOLVE_JITTER: [f64; 8] = [0.0, 1e-12, 1e-11, 1e-10, 1e-9, 1e-8, 1e-7, 1e-6];

/// Solve `A X = B` for a symmetric positive definite `A` through its Cholesky factor.
///
/// An innovation covariance can lose definiteness to round-off when the measurement noise is
/// tiny. The diagonal is then loaded with an increasing jitter, from 1e-12 up to 1e-6, before
/// giving up. [`crate::kalman::update_with_predictive`] skips this ramp because it reuses the
/// factor of an already validated predictive distribution.
///
/// # Errors
/// `RbpfError::Configuration` when the shapes do not match, `RbpfError::Numerical` when `a`
/// stays indefinite under the largest jitter.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return Err(RbpfError::config(format!(
            "cannot solve a {:?} system for a {:?} right-hand side",
            a.shape(),
            b.shape()
        )));
    }
    let a = symmetrize(a);
    let identity = DMatrix::<f64>::identity(a.nrows(), a.ncols());
    for jitter in SOLVE_JITTER {
        if let Some(ch) = Cholesky::new(&a + &identity * jitter) {
            if jitter > 0.0 {
                warn!("SPD solve needed a diagonal jitter of {jitter:e}");
            }
            return Ok(ch.solve(b));
        }
    }
    Err(RbpfError::numerical("innovation covariance is not positive definite"))
}

/// log |L Lᵀ| = 2 Σ ln L_ii
pub fn log_det_from_cholesky(l: &DMatrix<f64>) -> f64 {
    2.0 * l.diagonal().iter().map(|v| v.ln()).sum::<f64>()
}

/// Numerically stable log Σ exp(v).
///
/// Returns `-inf` for an empty input or when every value is `-inf`.
pub fn logsumexp(values: impl IntoIterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.into_iter().collect();
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/* =============================== Tests ==================================== */
