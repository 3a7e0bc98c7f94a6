//! Synthetic data from a switching linear-Gaussian system.
//!
//! [`simulate`] draws one ground-truth series from the same collaborators a filter uses:
//!
//! ```text
//! z_0 ~ state prior
//! s_1 ~ switch prior,           s_t ~ transition(s_{t-1})
//! z_t ~ N(A z_{t-1} + b, R),    y_t ~ N(C z_t + d, Q)     under gls_params(s_t)
//! ```
//!
//! [`to_observations`] stacks several series into the time-major layout the filters consume.

use log::debug;
use nalgebra::DVector;
use rand::Rng;

use crate::error::{RbpfError, Result};
use crate::gls::{ControlInputs, GlsParameterProvider, NO_CONTROLS};
use crate::model::{Observations, sampled_emission, state_transition};
use crate::switch::{StatePrior, SwitchPrior, SwitchTransition};

/// One simulated series.
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    pub switches: Vec<DVector<f64>>,
    pub states: Vec<DVector<f64>>,
    pub observations: Vec<DVector<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Draw `n_steps` timesteps. `controls`, when given, holds one entry per timestep.
pub fn simulate<R: Rng + ?Sized>(
    n_steps: usize,
    state_prior: &dyn StatePrior,
    switch_prior: &dyn SwitchPrior,
    switch_transition: &dyn SwitchTransition,
    gls_parameters: &dyn GlsParameterProvider,
    controls: Option<&[ControlInputs]>,
    rng: &mut R,
) -> Result<Trajectory> {
    if let Some(c) = controls {
        if c.len() != n_steps {
            return Err(RbpfError::config(format!(
                "got controls for {} timesteps, expected {n_steps}",
                c.len()
            )));
        }
    }
    let ctrl_at = |t: usize| controls.map_or(&NO_CONTROLS, |c| &c[t]);

    let mut z = state_prior.state_prior(ctrl_at(0))?.rsample(rng);
    let mut switches = Vec::with_capacity(n_steps);
    let mut states = Vec::with_capacity(n_steps);
    let mut observations = Vec::with_capacity(n_steps);
    for t in 0..n_steps {
        let ctrl = ctrl_at(t);
        let switch_dist = match switches.last() {
            None => switch_prior.switch_prior(ctrl)?,
            Some(prev) => switch_transition.transition(prev, ctrl)?,
        };
        let s = switch_dist.rsample(rng);
        let params = gls_parameters.gls_params(&s, ctrl)?;
        let b = params.transition_bias(ctrl.state.as_ref())?;
        let d = params.emission_bias(ctrl.target.as_ref())?;
        z = state_transition(&params, &z, &b)?.rsample(rng);
        let y = sampled_emission(&params, &z, &d)?.rsample(rng);
        switches.push(s);
        states.push(z.clone());
        observations.push(y);
    }
    debug!("simulated {n_steps} steps");
    Ok(Trajectory {
        switches,
        states,
        observations,
    })
}

/// Time-major observations of a batch of equally long series, all observed.
pub fn to_observations(batch: &[Trajectory]) -> Result<Vec<Observations>> {
    let n_steps = batch.first().map_or(0, Trajectory::len);
    if batch.iter().any(|tr| tr.len() != n_steps) {
        return Err(RbpfError::config("trajectories in a batch must have equal length"));
    }
    Ok((0..n_steps)
        .map(|t| batch.iter().map(|tr| Some(tr.observations[t].clone())).collect())
        .collect())
}
