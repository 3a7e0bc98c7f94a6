//! Switch-model collaborators.
//!
//! The filter consumes four densities, each described by a trait so that learned models can be
//! plugged in:
//!
//! - [`StatePrior`]: initial continuous state `z_0`;
//! - [`SwitchPrior`]: initial switch `s_1`;
//! - [`SwitchTransition`]: `s_t | s_{t-1}`;
//! - [`SwitchEncoder`]: the observation-driven expert `s_t | y_t`, fused with the switch model
//!   to form the proposal.
//!
//! All densities are [`MultivariateNormal`]. The `Linear*`/`Gaussian*` types are affine
//! reference implementations.

use nalgebra::{DMatrix, DVector};

use crate::distributions::MultivariateNormal;
use crate::error::{RbpfError, Result};
use crate::gls::ControlInputs;

pub trait StatePrior {
    fn state_prior(&self, controls: &ControlInputs) -> Result<MultivariateNormal>;
}

pub trait SwitchPrior {
    fn switch_prior(&self, controls: &ControlInputs) -> Result<MultivariateNormal>;
}

pub trait SwitchTransition {
    fn transition(
        &self,
        previous: &DVector<f64>,
        controls: &ControlInputs,
    ) -> Result<MultivariateNormal>;
}

pub trait SwitchEncoder {
    fn encode(&self, observation: &DVector<f64>, controls: &ControlInputs)
    -> Result<MultivariateNormal>;
}

/// Fixed Gaussian over the initial state.
#[derive(Clone, Debug)]
pub struct GaussianStatePrior {
    dist: MultivariateNormal,
}

impl GaussianStatePrior {
    pub fn new(loc: DVector<f64>, covariance: &DMatrix<f64>) -> Result<Self> {
        Ok(Self {
            dist: MultivariateNormal::new(loc, covariance)?,
        })
    }
}

impl StatePrior for GaussianStatePrior {
    fn state_prior(&self, _controls: &ControlInputs) -> Result<MultivariateNormal> {
        Ok(self.dist.clone())
    }
}

/// Fixed Gaussian over the first switch.
#[derive(Clone, Debug)]
pub struct GaussianSwitchPrior {
    dist: MultivariateNormal,
}

impl GaussianSwitchPrior {
    pub fn new(loc: DVector<f64>, covariance: &DMatrix<f64>) -> Result<Self> {
        Ok(Self {
            dist: MultivariateNormal::new(loc, covariance)?,
        })
    }
}

impl SwitchPrior for GaussianSwitchPrior {
    fn switch_prior(&self, _controls: &ControlInputs) -> Result<MultivariateNormal> {
        Ok(self.dist.clone())
    }
}

/// `s_t = F s_{t-1} + G u_switch + e`, `e ~ N(0, Σ)`.
#[derive(Clone, Debug)]
pub struct LinearGaussianSwitchTransition {
    f: DMatrix<f64>,
    g: Option<DMatrix<f64>>,
    scale_tril: DMatrix<f64>,
}

impl LinearGaussianSwitchTransition {
    pub fn new(
        f: DMatrix<f64>,
        g: Option<DMatrix<f64>>,
        covariance: &DMatrix<f64>,
    ) -> Result<Self> {
        let n_switch = f.nrows();
        if !f.is_square() || covariance.shape() != (n_switch, n_switch) {
            return Err(RbpfError::config(format!(
                "switch transition {:?} and noise {:?} must both be {n_switch}x{n_switch}",
                f.shape(),
                covariance.shape()
            )));
        }
        if let Some(g) = &g {
            if g.nrows() != n_switch {
                return Err(RbpfError::config("switch control matrix has the wrong row count"));
            }
        }
        let scale_tril = MultivariateNormal::new(DVector::zeros(n_switch), covariance)?
            .scale_tril()
            .clone();
        Ok(Self { f, g, scale_tril })
    }

    pub fn n_switch(&self) -> usize {
        self.f.nrows()
    }
}

impl SwitchTransition for LinearGaussianSwitchTransition {
    fn transition(
        &self,
        previous: &DVector<f64>,
        controls: &ControlInputs,
    ) -> Result<MultivariateNormal> {
        if previous.len() != self.n_switch() {
            return Err(RbpfError::config(format!(
                "previous switch has size {}, expected {}",
                previous.len(),
                self.n_switch()
            )));
        }
        let mut loc = &self.f * previous;
        if let (Some(g), Some(u)) = (&self.g, controls.switch.as_ref()) {
            if g.ncols() != u.len() {
                return Err(RbpfError::config("switch control has the wrong size"));
            }
            loc += g * u;
        }
        MultivariateNormal::from_scale_tril(loc, self.scale_tril.clone())
    }
}

/// `s_t | y_t ~ N(H [y_t; u_encoder] + h, Σ)`.
#[derive(Clone, Debug)]
pub struct LinearGaussianEncoder {
    h: DMatrix<f64>,
    bias: DVector<f64>,
    scale_tril: DMatrix<f64>,
}

impl LinearGaussianEncoder {
    pub fn new(h: DMatrix<f64>, bias: DVector<f64>, covariance: &DMatrix<f64>) -> Result<Self> {
        if bias.len() != h.nrows() {
            return Err(RbpfError::config(format!(
                "encoder matrix has {} rows but bias has {} entries",
                h.nrows(),
                bias.len()
            )));
        }
        let scale_tril = MultivariateNormal::new(bias.clone(), covariance)?
            .scale_tril()
            .clone();
        Ok(Self { h, bias, scale_tril })
    }
}

impl SwitchEncoder for LinearGaussianEncoder {
    fn encode(
        &self,
        observation: &DVector<f64>,
        controls: &ControlInputs,
    ) -> Result<MultivariateNormal> {
        let features = match &controls.encoder {
            Some(u) => {
                let mut f = DVector::zeros(observation.len() + u.len());
                f.rows_mut(0, observation.len()).copy_from(observation);
                f.rows_mut(observation.len(), u.len()).copy_from(u);
                f
            }
            None => observation.clone(),
        };
        if features.len() != self.h.ncols() {
            return Err(RbpfError::config(format!(
                "encoder input has size {}, expected {}",
                features.len(),
                self.h.ncols()
            )));
        }
        let loc = &self.h * features + &self.bias;
        MultivariateNormal::from_scale_tril(loc, self.scale_tril.clone())
    }
}
