//! Non-switching linear-Gaussian system.
//!
//! The same capability set as [`crate::rbpf::SwitchingGaussianLinearSystem`] with one fixed
//! regime. Every particle runs the same exact Kalman recursion, the weight increment is the
//! predictive log-density alone, and the loss is the exact negative log-marginal likelihood.

use nalgebra::DVector;
use rand::Rng;

use crate::config::RbpfConfig;
use crate::distributions::MultivariateNormal;
use crate::error::{RbpfError, Result};
use crate::gls::{ControlInputs, GlsParams, controls_for};
use crate::kalman;
use crate::latents::{Latents, Prediction, RandomVariables};
use crate::model::{
    ModelFamily, StateSpaceModel, check_batch_controls, check_observations, check_particle_count,
    check_state_prior, check_system_dims, initial_state, resample_previous, rollout_start,
    sample_or_mean, sampled_emission, state_transition, uniform_log_weights,
};
use crate::particles::ParticleArray;
use crate::switch::StatePrior;

pub struct LinearGaussianSystem {
    config: RbpfConfig,
    state_prior: Box<dyn StatePrior>,
    params: GlsParams,
}

impl LinearGaussianSystem {
    pub fn new(
        config: RbpfConfig,
        state_prior: Box<dyn StatePrior>,
        params: GlsParams,
    ) -> Result<Self> {
        config.validate()?;
        if params.n_state() != config.n_state || params.n_obs() != config.n_obs {
            return Err(RbpfError::config(format!(
                "system is {}-state/{}-obs, config says {}/{}",
                params.n_state(),
                params.n_obs(),
                config.n_state,
                config.n_obs
            )));
        }
        check_state_prior(&config, state_prior.as_ref())?;
        Ok(Self {
            config,
            state_prior,
            params,
        })
    }

    pub fn params(&self) -> &GlsParams {
        &self.params
    }
}

impl StateSpaceModel for LinearGaussianSystem {
    fn config(&self) -> &RbpfConfig {
        &self.config
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::LinearGaussian
    }

    fn filter_step<R: Rng + ?Sized>(
        &self,
        previous: Option<&Latents>,
        observations: &[Option<DVector<f64>>],
        controls: Option<&[ControlInputs]>,
        rng: &mut R,
    ) -> Result<Latents> {
        check_observations(&self.config, observations)?;
        let n_particle = self.config.n_particle;
        let n_batch = observations.len();
        check_batch_controls(controls, n_batch)?;

        let (log_norm_weights, m_prev, v_prev) = match previous {
            None => {
                let prior = self.state_prior.as_ref();
                let (m0, v0) = initial_state(prior, n_particle, observations, controls)?;
                (uniform_log_weights(n_particle, n_batch), m0, v0)
            }
            Some(previous) => {
                let (log_norm_weights, variables) = resample_previous(&self.config, previous, rng)?;
                let (Some(m), Some(v)) = (variables.m, variables.v) else {
                    return Err(RbpfError::config(
                        "filtering continues from latents without (m, V)",
                    ));
                };
                if m.n_batch() != n_batch {
                    return Err(RbpfError::config(
                        "observations and previous latents differ in batch size",
                    ));
                }
                (log_norm_weights, m, v)
            }
        };

        let steps = ParticleArray::try_from_fn(n_particle, n_batch, |p, b| {
            let ctrl = controls_for(controls, b);
            let bias = self.params.transition_bias(ctrl.state.as_ref())?;
            let d = self.params.emission_bias(ctrl.target.as_ref())?;
            let y = observations[b].as_ref();
            let (m_last, v_last) = (&m_prev[(p, b)], &v_prev[(p, b)]);
            check_system_dims(&self.config, &self.params, m_last)?;
            let (m, v, predictive) =
                kalman::filter_step(m_last, v_last, &self.params, &bias, &d, y)?;
            let log_update = y.map_or(0.0, |y| predictive.log_prob(y));
            Ok::<_, RbpfError>((m, v, log_update))
        })?;

        let mut log_weights = log_norm_weights;
        for p in 0..n_particle {
            for b in 0..n_batch {
                log_weights[(p, b)] += steps[(p, b)].2;
            }
        }
        Ok(Latents {
            log_weights,
            variables: RandomVariables::filtered(
                steps.map(|s| s.0.clone()),
                steps.map(|s| s.1.clone()),
                None,
            ),
            gls_params: None,
        })
    }

    fn forecast_sample_step<R: Rng + ?Sized>(
        &self,
        previous: &Latents,
        controls: Option<&[ControlInputs]>,
        deterministic: bool,
        rng: &mut R,
    ) -> Result<Prediction> {
        check_particle_count(&self.config, previous)?;
        check_batch_controls(controls, previous.n_batch())?;
        let params = &self.params;
        let step = ParticleArray::try_from_fn(previous.n_particle(), previous.n_batch(), |p, b| {
            let ctrl = controls_for(controls, b);
            let x_prev = rollout_start(&previous.variables, p, b, deterministic, &mut *rng)?;
            check_system_dims(&self.config, params, &x_prev)?;
            let bias = params.transition_bias(ctrl.state.as_ref())?;
            let transition = state_transition(params, &x_prev, &bias)?;
            let x = sample_or_mean(&transition, deterministic, &mut *rng);
            let d = params.emission_bias(ctrl.target.as_ref())?;
            let emission = sampled_emission(params, &x, &d)?;
            let y = sample_or_mean(&emission, deterministic, &mut *rng);
            Ok::<_, RbpfError>((x, y))
        })?;
        Ok(Prediction {
            latents: Latents {
                log_weights: previous.log_weights.clone(),
                variables: RandomVariables::sampled(step.map(|s| s.0.clone()), None),
                gls_params: None,
            },
            emissions: step.map(|s| s.1.clone()),
        })
    }

    fn emit(
        &self,
        latents: &Latents,
        controls: Option<&[ControlInputs]>,
    ) -> Result<ParticleArray<MultivariateNormal>> {
        check_batch_controls(controls, latents.n_batch())?;
        let vars = &latents.variables;
        let params = &self.params;
        ParticleArray::try_from_fn(latents.n_particle(), latents.n_batch(), |p, b| {
            let d = params.emission_bias(controls_for(controls, b).target.as_ref())?;
            match (&vars.x, &vars.m, &vars.v) {
                (Some(x), _, _) => {
                    check_system_dims(&self.config, params, &x[(p, b)])?;
                    sampled_emission(params, &x[(p, b)], &d)
                }
                (None, Some(m), Some(v)) => {
                    let (m, v) = (&m[(p, b)], &v[(p, b)]);
                    check_system_dims(&self.config, params, m)?;
                    kalman::predictive_distribution(m, v, &params.c, &d, &params.q)
                }
                _ => Err(RbpfError::config("latents carry no state to emit from")),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gls::LinearTerm;
    use crate::switch::GaussianStatePrior;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn s(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    fn sv(v: f64) -> DVector<f64> {
        DVector::from_element(1, v)
    }

    fn system(n_particle: usize) -> LinearGaussianSystem {
        let config = RbpfConfig {
            n_particle,
            ..Default::default()
        };
        let params = GlsParams::new(
            LinearTerm::Matrix(s(0.9)),
            LinearTerm::Matrix(s(1.0)),
            s(1.0),
            LinearTerm::Zero,
            s(0.1),
            s(0.1),
        )
        .unwrap();
        LinearGaussianSystem::new(
            config,
            Box::new(GaussianStatePrior::new(sv(0.0), &s(1.0)).unwrap()),
            params,
        )
        .unwrap()
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let config = RbpfConfig {
            n_state: 2,
            ..Default::default()
        };
        let params = system(1).params().clone();
        let prior = GaussianStatePrior::new(sv(0.0), &s(1.0)).unwrap();
        assert!(LinearGaussianSystem::new(config, Box::new(prior), params).is_err());
    }

    #[test]
    fn state_prior_of_the_wrong_size_is_rejected() {
        let params = system(1).params().clone();
        let prior = GaussianStatePrior::new(DVector::zeros(2), &DMatrix::identity(2, 2)).unwrap();
        let res = LinearGaussianSystem::new(RbpfConfig::default(), Box::new(prior), params);
        assert!(matches!(res, Err(RbpfError::Configuration(_))));
    }

    #[test]
    fn short_batch_controls_are_rejected() {
        let sys = system(1);
        let mut rng = StdRng::seed_from_u64(0);
        let controls = vec![ControlInputs {
            state: Some(sv(2.0)),
            ..Default::default()
        }];
        let res = sys.filter_step(None, &[None, None], Some(&controls), &mut rng);
        assert!(matches!(res, Err(RbpfError::Configuration(_))));
    }

    #[test]
    fn state_control_shifts_the_prediction() {
        let sys = system(1);
        let mut rng = StdRng::seed_from_u64(0);
        let controls = vec![ControlInputs {
            state: Some(sv(2.0)),
            ..Default::default()
        }];
        let lats = sys.filter_step(None, &[None], Some(&controls), &mut rng).unwrap();
        assert_approx_eq!(lats.variables.m.as_ref().unwrap()[(0, 0)][0], 2.0, 1e-15);
    }

    #[test]
    fn deterministic_rollout_follows_the_mean_dynamics() {
        let sys = system(2);
        let mut rng = StdRng::seed_from_u64(3);
        let lats = sys.filter_step(None, &[Some(sv(1.0))], None, &mut rng).unwrap();
        let m = lats.variables.m.as_ref().unwrap()[(0, 0)][0];
        let start = sys.prepare_forecast(&lats, true, &mut rng).unwrap();
        let pred = sys.forecast_sample_step(&start, None, true, &mut rng).unwrap();
        assert_approx_eq!(pred.emissions[(1, 0)][0], 0.9 * m, 1e-12);
    }
}
