//! Importance-weight bookkeeping and resampling.
//!
//! Log-weights are `(n_particle, n_batch)` matrices: column `b` holds the particles of batch
//! element `b`. Three pieces make up a resampling pass:
//!
//! - a *criterion* deciding, per batch element, **whether** to resample
//!   ([`ResampleCriterion`], reference policy [`EssCriterion`]);
//! - an *index scheme* deciding **which** ancestors survive ([`ResamplingScheme`]);
//! - the generic [`resample`] that applies both to any [`Resample`] value and resets the
//!   weights of resampled batch elements to uniform.

use log::debug;
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::linalg::logsumexp;
use crate::particles::{AncestorIndices, ParticleArray, Resample};

/// Normalize each column so that Σ_p exp(w[p, b]) = 1.
pub fn normalize_log_weights(log_weights: &DMatrix<f64>) -> DMatrix<f64> {
    let mut normalized = log_weights.clone();
    for mut column in normalized.column_iter_mut() {
        let log_norm = logsumexp(column.iter().copied());
        column.add_scalar_mut(-log_norm);
    }
    normalized
}

/// Effective sample size 1 / Σ_p w_p² for every batch element.
///
/// Expects normalized log-weights.
pub fn effective_sample_size(log_norm_weights: &DMatrix<f64>) -> Vec<f64> {
    log_norm_weights
        .column_iter()
        .map(|column| {
            let sum_sq: f64 = column.iter().map(|lw| (2.0 * lw).exp()).sum();
            if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
        })
        .collect()
}

/// Log-weights that put all mass on the arg-max particle of every batch element.
///
/// Resampling from these copies the best particle into every slot, independent of the
/// random offset drawn by the index scheme.
pub fn argmax_log_weights(log_weights: &DMatrix<f64>) -> DMatrix<f64> {
    let (n_particle, n_batch) = log_weights.shape();
    let mut out = DMatrix::from_element(n_particle, n_batch, f64::NEG_INFINITY);
    for (b, column) in log_weights.column_iter().enumerate() {
        let mut best = 0;
        for (p, lw) in column.iter().enumerate() {
            if *lw > column[best] {
                best = p;
            }
        }
        out[(best, b)] = 0.0;
    }
    out
}

/// Decides per batch element whether the particle set should be resampled.
pub trait ResampleCriterion {
    fn needs_resampling(&self, log_norm_weights: &DMatrix<f64>) -> Vec<bool>;
}

/// Resample when ESS / n_particle < `min_ess_ratio`.
///
/// `min_ess_ratio <= 0` never resamples; `min_ess_ratio >= 1` always resamples, including the
/// uniform-weight case where the ratio is exactly one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EssCriterion {
    pub min_ess_ratio: f64,
}

impl EssCriterion {
    pub fn new(min_ess_ratio: f64) -> Self {
        Self { min_ess_ratio }
    }

    pub fn never() -> Self {
        Self::new(0.0)
    }

    pub fn always() -> Self {
        Self::new(1.0)
    }
}

impl Default for EssCriterion {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl ResampleCriterion for EssCriterion {
    fn needs_resampling(&self, log_norm_weights: &DMatrix<f64>) -> Vec<bool> {
        let n_batch = log_norm_weights.ncols();
        if self.min_ess_ratio <= 0.0 {
            return vec![false; n_batch];
        }
        if self.min_ess_ratio >= 1.0 {
            return vec![true; n_batch];
        }
        let n_particle = log_norm_weights.nrows() as f64;
        effective_sample_size(log_norm_weights)
            .into_iter()
            .map(|ess| ess / n_particle < self.min_ess_ratio)
            .collect()
    }
}

/// Ancestor index schemes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingScheme {
    /// One offset u ~ U[0, 1/n), points u + k/n.
    #[default]
    Systematic,
    /// One uniform per stratum, points (k + u_k)/n.
    Stratified,
    /// n independent uniforms, sorted.
    Multinomial,
}

impl ResamplingScheme {
    /// Draw `n_particle` ancestor indices per batch element from normalized log-weights.
    pub fn indices<R: Rng + ?Sized>(
        &self,
        log_norm_weights: &DMatrix<f64>,
        n_particle: usize,
        rng: &mut R,
    ) -> AncestorIndices {
        match self {
            ResamplingScheme::Systematic => {
                systematic_resampling_indices(log_norm_weights, n_particle, rng)
            }
            ResamplingScheme::Stratified => {
                stratified_resampling_indices(log_norm_weights, n_particle, rng)
            }
            ResamplingScheme::Multinomial => {
                multinomial_resampling_indices(log_norm_weights, n_particle, rng)
            }
        }
    }
}

/// Systematic resampling: a single uniform offset per batch element.
///
/// With `n_particle == 1` no draw is made and index 0 is returned.
pub fn systematic_resampling_indices<R: Rng + ?Sized>(
    log_norm_weights: &DMatrix<f64>,
    n_particle: usize,
    rng: &mut R,
) -> AncestorIndices {
    let n_batch = log_norm_weights.ncols();
    if n_particle == 1 {
        return AncestorIndices::identity(1, n_batch);
    }
    let step = 1.0 / n_particle as f64;
    let per_batch: Vec<Vec<usize>> = (0..n_batch)
        .map(|b| {
            let u = rng.random::<f64>() * step;
            let positions: Vec<f64> = (0..n_particle).map(|k| u + k as f64 * step).collect();
            inverse_cdf_indices(log_norm_weights, b, &positions)
        })
        .collect();
    transpose_indices(per_batch, n_particle)
}

/// Stratified resampling: an independent uniform inside every stratum.
pub fn stratified_resampling_indices<R: Rng + ?Sized>(
    log_norm_weights: &DMatrix<f64>,
    n_particle: usize,
    rng: &mut R,
) -> AncestorIndices {
    let n_batch = log_norm_weights.ncols();
    if n_particle == 1 {
        return AncestorIndices::identity(1, n_batch);
    }
    let step = 1.0 / n_particle as f64;
    let per_batch: Vec<Vec<usize>> = (0..n_batch)
        .map(|b| {
            let positions: Vec<f64> = (0..n_particle)
                .map(|k| (k as f64 + rng.random::<f64>()) * step)
                .collect();
            inverse_cdf_indices(log_norm_weights, b, &positions)
        })
        .collect();
    transpose_indices(per_batch, n_particle)
}

/// Multinomial resampling: i.i.d. draws from the categorical over particles.
pub fn multinomial_resampling_indices<R: Rng + ?Sized>(
    log_norm_weights: &DMatrix<f64>,
    n_particle: usize,
    rng: &mut R,
) -> AncestorIndices {
    let n_batch = log_norm_weights.ncols();
    if n_particle == 1 {
        return AncestorIndices::identity(1, n_batch);
    }
    let per_batch: Vec<Vec<usize>> = (0..n_batch)
        .map(|b| {
            let mut positions: Vec<f64> = (0..n_particle).map(|_| rng.random::<f64>()).collect();
            positions.sort_by(|a, b| a.total_cmp(b));
            inverse_cdf_indices(log_norm_weights, b, &positions)
        })
        .collect();
    transpose_indices(per_batch, n_particle)
}

/// Map ascending points in [0, 1) through the inverse CDF of one batch element's weights.
///
/// The CDF is scaled to its own total so round-off in the normalization cannot push a point
/// past the last particle. A particle with zero weight is never selected.
fn inverse_cdf_indices(
    log_norm_weights: &DMatrix<f64>,
    batch: usize,
    positions: &[f64],
) -> Vec<usize> {
    let weights: Vec<f64> = log_norm_weights.column(batch).iter().map(|lw| lw.exp()).collect();
    let n = weights.len();
    let mut cdf = Vec::with_capacity(n);
    let mut cumsum = 0.0;
    for w in &weights {
        cumsum += w;
        cdf.push(cumsum);
    }
    let total = cumsum;

    let mut indices = Vec::with_capacity(positions.len());
    let mut i = 0;
    for &position in positions {
        let target = position * total;
        while i < n - 1 && cdf[i] <= target {
            i += 1;
        }
        indices.push(i);
    }
    indices
}

fn transpose_indices(per_batch: Vec<Vec<usize>>, n_particle: usize) -> AncestorIndices {
    let n_batch = per_batch.len();
    ParticleArray::from_fn(n_particle, n_batch, |p, b| per_batch[b][p])
}

/// Resample `tensors` where the criterion asks for it.
///
/// Returns the new normalized log-weights and the resampled value. Batch elements that are
/// resampled get uniform weights `ln(1/n_particle)`; the others keep their weights and
/// particle order. When no batch element needs resampling, no random draw is made.
pub fn resample<T, C, R>(
    n_particle: usize,
    log_norm_weights: &DMatrix<f64>,
    tensors: &T,
    scheme: ResamplingScheme,
    criterion: &C,
    rng: &mut R,
) -> (DMatrix<f64>, T)
where
    T: Resample,
    C: ResampleCriterion + ?Sized,
    R: Rng + ?Sized,
{
    let n_batch = log_norm_weights.ncols();
    let mask = criterion.needs_resampling(log_norm_weights);
    let n_resampled = mask.iter().filter(|m| **m).count();
    debug!(
        "resampling {}/{} batch elements (ESS: {:?})",
        n_resampled,
        n_batch,
        effective_sample_size(log_norm_weights)
    );

    let ancestors = if n_resampled > 0 {
        scheme.indices(log_norm_weights, n_particle, rng)
    } else {
        AncestorIndices::identity(n_particle, n_batch)
    };
    let resampled = tensors.resample(&ancestors, &mask);

    let uniform = -(n_particle as f64).ln();
    let mut new_log_weights = log_norm_weights.clone();
    for (b, resampled_batch) in mask.iter().enumerate() {
        if *resampled_batch {
            new_log_weights.column_mut(b).fill(uniform);
        }
    }
    (new_log_weights, resampled)
}
