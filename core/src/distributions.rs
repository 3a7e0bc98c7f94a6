//! Multivariate normal densities in square-root form.
//!
//! A [`MultivariateNormal`] carries its lower-triangular scale factor instead of the full
//! covariance, so sampling and density evaluation never re-decompose the covariance. The
//! factor is computed once at construction (see [`crate::linalg::cholesky_factor`]).
//!
//! [`fuse_densities`] implements the precision-weighted product of Gaussian experts used to
//! build the switch proposal from the switch-model density and the encoder density.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{RbpfError, Result};
use crate::linalg::{cholesky_factor, log_det_from_cholesky, symmetrize};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Gaussian N(loc, L Lᵀ) stored with its scale factor `L`.
#[derive(Clone, Debug, PartialEq)]
pub struct MultivariateNormal {
    loc: DVector<f64>,
    scale_tril: DMatrix<f64>,
}

impl MultivariateNormal {
    /// Build from a mean and a full covariance, factorizing the covariance once.
    pub fn new(loc: DVector<f64>, covariance: &DMatrix<f64>) -> Result<Self> {
        if covariance.nrows() != loc.len() {
            return Err(RbpfError::config(format!(
                "covariance of size {} does not match mean of size {}",
                covariance.nrows(),
                loc.len()
            )));
        }
        let scale_tril = cholesky_factor(covariance)?;
        Ok(Self { loc, scale_tril })
    }

    /// Build from a mean and an already computed lower-triangular factor.
    pub fn from_scale_tril(loc: DVector<f64>, scale_tril: DMatrix<f64>) -> Result<Self> {
        if !scale_tril.is_square() || scale_tril.nrows() != loc.len() {
            return Err(RbpfError::config(format!(
                "scale factor of shape {:?} does not match mean of size {}",
                scale_tril.shape(),
                loc.len()
            )));
        }
        Ok(Self { loc, scale_tril })
    }

    /// Standard normal of the given dimension.
    pub fn standard(dim: usize) -> Self {
        Self {
            loc: DVector::zeros(dim),
            scale_tril: DMatrix::identity(dim, dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.loc.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.loc
    }

    pub fn scale_tril(&self) -> &DMatrix<f64> {
        &self.scale_tril
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        &self.scale_tril * self.scale_tril.transpose()
    }

    /// Reparameterized draw: loc + L ε with ε ~ N(0, I).
    pub fn rsample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let eps =
            DVector::<f64>::from_fn(self.dim(), |_, _| StandardNormal.sample(&mut *rng));
        &self.loc + &self.scale_tril * eps
    }

    /// Log-density at `value`.
    ///
    /// A degenerate factor (zero on the diagonal) has no density and gives `-inf`.
    pub fn log_prob(&self, value: &DVector<f64>) -> f64 {
        let k = self.dim();
        if k == 0 {
            return 0.0;
        }
        if self.scale_tril.diagonal().iter().any(|v| *v <= 0.0) {
            return f64::NEG_INFINITY;
        }
        let residual = value - &self.loc;
        let Some(z) = self.scale_tril.solve_lower_triangular(&residual) else {
            return f64::NEG_INFINITY;
        };
        -0.5 * (k as f64 * LN_2PI + log_det_from_cholesky(&self.scale_tril) + z.norm_squared())
    }

    /// Precision matrix (L Lᵀ)⁻¹.
    pub fn precision(&self) -> Result<DMatrix<f64>> {
        let identity = DMatrix::<f64>::identity(self.dim(), self.dim());
        let l_inv = self
            .scale_tril
            .solve_lower_triangular(&identity)
            .ok_or_else(|| RbpfError::numerical("singular scale factor has no precision"))?;
        Ok(l_inv.transpose() * l_inv)
    }
}

/// Product of Gaussian experts, renormalized.
///
/// Precisions add, and the fused mean is the precision-weighted average of the expert means:
/// Λ = Σ Λ_i, μ = Λ⁻¹ Σ Λ_i μ_i.
pub fn fuse_densities(dists: &[&MultivariateNormal]) -> Result<MultivariateNormal> {
    let Some(first) = dists.first() else {
        return Err(RbpfError::config("cannot fuse an empty set of densities"));
    };
    let dim = first.dim();
    if dists.iter().any(|d| d.dim() != dim) {
        return Err(RbpfError::config("fused densities must share one dimension"));
    }
    if dim == 0 {
        return Ok(MultivariateNormal::standard(0));
    }
    let mut precision = DMatrix::<f64>::zeros(dim, dim);
    let mut information = DVector::<f64>::zeros(dim);
    for dist in dists {
        let lambda = dist.precision()?;
        information += &lambda * dist.mean();
        precision += lambda;
    }
    let precision = symmetrize(&precision);
    let chol = precision
        .clone()
        .cholesky()
        .ok_or_else(|| RbpfError::numerical("fused precision is not positive definite"))?;
    let covariance = symmetrize(&chol.inverse());
    let loc = chol.solve(&information);
    MultivariateNormal::new(loc, &covariance)
}
