//! Per-timestep latent records.
//!
//! A [`Latents`] value is produced fresh by every filter or forecast step and never mutated
//! afterwards. Filtered latents carry the Rao-Blackwellized statistics `(m, V)`; forecast
//! latents carry a sampled state `x`. The switch is populated in both phases.

use nalgebra::{DMatrix, DVector};

use crate::error::{RbpfError, Result};
use crate::gls::GlsParams;
use crate::particles::{AncestorIndices, ParticleArray, Resample};
use crate::resampling::normalize_log_weights;

/// Per-particle random variables of one timestep.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RandomVariables {
    /// Filtered state mean.
    pub m: Option<ParticleArray<DVector<f64>>>,
    /// Filtered state covariance.
    pub v: Option<ParticleArray<DMatrix<f64>>>,
    /// Sampled state.
    pub x: Option<ParticleArray<DVector<f64>>>,
    pub switch: Option<ParticleArray<DVector<f64>>>,
}

impl RandomVariables {
    pub fn filtered(
        m: ParticleArray<DVector<f64>>,
        v: ParticleArray<DMatrix<f64>>,
        switch: Option<ParticleArray<DVector<f64>>>,
    ) -> Self {
        Self {
            m: Some(m),
            v: Some(v),
            x: None,
            switch,
        }
    }

    pub fn sampled(
        x: ParticleArray<DVector<f64>>,
        switch: Option<ParticleArray<DVector<f64>>>,
    ) -> Self {
        Self {
            m: None,
            v: None,
            x: Some(x),
            switch,
        }
    }

    /// The same variables with the state sample dropped.
    ///
    /// A sample is regenerated by the next step and is not carried through resampling.
    pub fn without_sample(&self) -> Self {
        Self {
            x: None,
            ..self.clone()
        }
    }

    /// `(n_particle, n_batch)` of the first populated field.
    pub fn shape(&self) -> Option<(usize, usize)> {
        self.m
            .as_ref()
            .map(|a| (a.n_particle(), a.n_batch()))
            .or_else(|| self.x.as_ref().map(|a| (a.n_particle(), a.n_batch())))
            .or_else(|| self.switch.as_ref().map(|a| (a.n_particle(), a.n_batch())))
    }
}

impl Resample for RandomVariables {
    fn resample(&self, ancestors: &AncestorIndices, resample_mask: &[bool]) -> Self {
        Self {
            m: self.m.resample(ancestors, resample_mask),
            v: self.v.resample(ancestors, resample_mask),
            x: self.x.resample(ancestors, resample_mask),
            switch: self.switch.resample(ancestors, resample_mask),
        }
    }
}

/// Weighted particle set of one timestep.
#[derive(Clone, Debug, PartialEq)]
pub struct Latents {
    /// Unnormalized log importance weights, `(n_particle, n_batch)`.
    pub log_weights: DMatrix<f64>,
    pub variables: RandomVariables,
    /// System matrices used to produce this step, when kept.
    pub gls_params: Option<ParticleArray<GlsParams>>,
}

impl Latents {
    pub fn n_particle(&self) -> usize {
        self.log_weights.nrows()
    }

    pub fn n_batch(&self) -> usize {
        self.log_weights.ncols()
    }

    pub fn log_norm_weights(&self) -> DMatrix<f64> {
        normalize_log_weights(&self.log_weights)
    }

    /// Importance-weighted mean of the state (`m` when filtered, `x` when sampled) for every
    /// batch element.
    pub fn state_estimate(&self) -> Result<Vec<DVector<f64>>> {
        let states = self
            .variables
            .m
            .as_ref()
            .or(self.variables.x.as_ref())
            .ok_or_else(|| RbpfError::config("latents carry neither a state mean nor a sample"))?;
        let weights = self.log_norm_weights().map(f64::exp);
        Ok((0..self.n_batch())
            .map(|b| {
                states
                    .batch(b)
                    .zip(weights.column(b).iter())
                    .fold(DVector::zeros(states.get(0, b).len()), |acc, (s, w)| acc + s * *w)
            })
            .collect())
    }
}

/// One timestep of a prediction: the latents and a per-particle emission.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub latents: Latents,
    pub emissions: ParticleArray<DVector<f64>>,
}
