//! Rao-Blackwellized particle filter for switching linear-Gaussian systems.
//!
//! Each particle carries a sampled switch `s_t` and the exact Gaussian posterior `(m_t, V_t)` of
//! the continuous state given that particle's switch history. One filtering step:
//!
//! 1. initial step: state prior `(m_0, V_0)`, uniform weights, switch prior;
//!    later steps: normalize, resample (the state sample `x` is never carried), switch
//!    transition conditioned on the resampled previous switch;
//! 2. encoder density from the observation, fused with the switch-model density into the
//!    proposal;
//! 3. `s_t ~ proposal`, GLS parameters from `s_t`, Kalman predict + update;
//! 4. `log w_t = log w̃_{t-1} + log p(y_t | ...) + log p(s_t | s_{t-1}) - log q(s_t)`.
//!
//! A batch element without an observation uses the switch model as proposal and skips the
//! update, so its weight increment is zero.

use log::trace;
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::config::RbpfConfig;
use crate::distributions::{MultivariateNormal, fuse_densities};
use crate::error::{RbpfError, Result};
use crate::gls::{ControlInputs, GlsParameterProvider, GlsParams, controls_for};
use crate::kalman;
use crate::latents::{Latents, Prediction, RandomVariables};
use crate::model::{
    ModelFamily, StateSpaceModel, check_batch_controls, check_observations, check_particle_count,
    check_state_prior, check_system_dims, initial_state, resample_previous, rollout_start,
    sample_or_mean, sampled_emission, state_transition, uniform_log_weights,
};
use crate::particles::ParticleArray;
use crate::switch::{StatePrior, SwitchEncoder, SwitchPrior, SwitchTransition};

/// Switching linear-Gaussian system filtered with an RBPF.
pub struct SwitchingGaussianLinearSystem {
    config: RbpfConfig,
    state_prior: Box<dyn StatePrior>,
    switch_prior: Box<dyn SwitchPrior>,
    switch_transition: Box<dyn SwitchTransition>,
    encoder: Box<dyn SwitchEncoder>,
    gls_parameters: Box<dyn GlsParameterProvider>,
}

/// Per-particle quantities of one filtering step.
struct ParticleStep {
    m: DVector<f64>,
    v: DMatrix<f64>,
    switch: DVector<f64>,
    params: GlsParams,
    log_update: f64,
}

impl SwitchingGaussianLinearSystem {
    pub fn new(
        config: RbpfConfig,
        state_prior: Box<dyn StatePrior>,
        switch_prior: Box<dyn SwitchPrior>,
        switch_transition: Box<dyn SwitchTransition>,
        encoder: Box<dyn SwitchEncoder>,
        gls_parameters: Box<dyn GlsParameterProvider>,
    ) -> Result<Self> {
        config.validate()?;
        if config.n_switch == 0 {
            return Err(RbpfError::config("a switching model needs n_switch >= 1"));
        }
        check_state_prior(&config, state_prior.as_ref())?;
        let switch_dim = switch_prior.switch_prior(&ControlInputs::default())?.dim();
        if switch_dim != config.n_switch {
            return Err(RbpfError::config(format!(
                "switch prior has dimension {switch_dim}, config says n_switch = {}",
                config.n_switch
            )));
        }
        Ok(Self {
            config,
            state_prior,
            switch_prior,
            switch_transition,
            encoder,
            gls_parameters,
        })
    }

    /// Proposal `q(s_t)`: the switch model fused with the encoder when an observation exists.
    fn proposal(
        &self,
        switch_model: &MultivariateNormal,
        observation: Option<&DVector<f64>>,
        controls: &ControlInputs,
    ) -> Result<MultivariateNormal> {
        match observation {
            Some(y) => {
                let encoded = self.encoder.encode(y, controls)?;
                fuse_densities(&[switch_model, &encoded])
            }
            None => Ok(switch_model.clone()),
        }
    }

    fn step_particle<R: Rng + ?Sized>(
        &self,
        m_prev: &DVector<f64>,
        v_prev: &DMatrix<f64>,
        switch_model: &MultivariateNormal,
        observation: Option<&DVector<f64>>,
        controls: &ControlInputs,
        rng: &mut R,
    ) -> Result<ParticleStep> {
        let proposal = self.proposal(switch_model, observation, controls)?;
        let switch = proposal.rsample(rng);
        let params = self.gls_parameters.gls_params(&switch, controls)?;
        check_system_dims(&self.config, &params, m_prev)?;
        let b = params.transition_bias(controls.state.as_ref())?;
        let d = params.emission_bias(controls.target.as_ref())?;
        let (m, v, predictive) = kalman::filter_step(m_prev, v_prev, &params, &b, &d, observation)?;
        let log_update = match observation {
            Some(y) => {
                predictive.log_prob(y) + switch_model.log_prob(&switch) - proposal.log_prob(&switch)
            }
            None => 0.0,
        };
        Ok(ParticleStep {
            m,
            v,
            switch,
            params,
            log_update,
        })
    }

    fn params_for(
        &self,
        latents: &Latents,
        p: usize,
        b: usize,
        controls: &ControlInputs,
    ) -> Result<GlsParams> {
        if let Some(params) = &latents.gls_params {
            return Ok(params[(p, b)].clone());
        }
        let switch = latents
            .variables
            .switch
            .as_ref()
            .ok_or_else(|| RbpfError::config("latents carry no switch"))?;
        self.gls_parameters.gls_params(&switch[(p, b)], controls)
    }
}

impl StateSpaceModel for SwitchingGaussianLinearSystem {
    fn config(&self) -> &RbpfConfig {
        &self.config
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::SwitchingRbpf
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

        let (log_norm_weights, m_prev, v_prev, switch_model) = match previous {
            None => {
                let prior = self.state_prior.as_ref();
                let (m0, v0) = initial_state(prior, n_particle, observations, controls)?;
                let priors = (0..n_batch)
                    .map(|b| self.switch_prior.switch_prior(controls_for(controls, b)))
                    .collect::<Result<Vec<_>>>()?;
                let switch_model = ParticleArray::broadcast(n_particle, &priors);
                (uniform_log_weights(n_particle, n_batch), m0, v0, switch_model)
            }
            Some(previous) => {
                if previous.n_batch() != n_batch {
                    return Err(RbpfError::config(format!(
                        "previous latents have {} batch elements, observations {}",
                        previous.n_batch(),
                        n_batch
                    )));
                }
                let (log_norm_weights, variables) = resample_previous(&self.config, previous, rng)?;
                let (Some(m), Some(v), Some(switch)) = (variables.m, variables.v, variables.switch)
                else {
                    return Err(RbpfError::config(
                        "filtering continues from latents without (m, V, switch)",
                    ));
                };
                let switch_model = ParticleArray::try_from_fn(n_particle, n_batch, |p, b| {
                    self.switch_transition
                        .transition(&switch[(p, b)], controls_for(controls, b))
                })?;
                (log_norm_weights, m, v, switch_model)
            }
        };

        let steps = ParticleArray::try_from_fn(n_particle, n_batch, |p, b| {
            self.step_particle(
                &m_prev[(p, b)],
                &v_prev[(p, b)],
                &switch_model[(p, b)],
                observations[b].as_ref(),
                controls_for(controls, b),
                &mut *rng,
            )
        })?;

        let mut log_weights = log_norm_weights;
        for p in 0..n_particle {
            for b in 0..n_batch {
                log_weights[(p, b)] += steps[(p, b)].log_update;
            }
        }
        trace!("filtered {n_batch} batch elements with {n_particle} particles");

        Ok(Latents {
            log_weights,
            variables: RandomVariables::filtered(
                steps.map(|s| s.m.clone()),
                steps.map(|s| s.v.clone()),
                Some(steps.map(|s| s.switch.clone())),
            ),
            gls_params: Some(steps.map(|s| s.params.clone())),
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
        let n_particle = previous.n_particle();
        let n_batch = previous.n_batch();
        check_batch_controls(controls, n_batch)?;
        let switch_prev = previous
            .variables
            .switch
            .as_ref()
            .ok_or_else(|| RbpfError::config("forecast needs a switch on every particle"))?;

        let step = ParticleArray::try_from_fn(n_particle, n_batch, |p, b| {
            let ctrl = controls_for(controls, b);
            let switch_dist = self.switch_transition.transition(&switch_prev[(p, b)], ctrl)?;
            let switch = sample_or_mean(&switch_dist, deterministic, &mut *rng);
            let params = self.gls_parameters.gls_params(&switch, ctrl)?;
            let x_prev = rollout_start(&previous.variables, p, b, deterministic, &mut *rng)?;
            check_system_dims(&self.config, &params, &x_prev)?;
            let bias = params.transition_bias(ctrl.state.as_ref())?;
            let transition = state_transition(&params, &x_prev, &bias)?;
            let x = sample_or_mean(&transition, deterministic, &mut *rng);
            let d = params.emission_bias(ctrl.target.as_ref())?;
            let emission = sampled_emission(&params, &x, &d)?;
            let y = sample_or_mean(&emission, deterministic, &mut *rng);
            Ok::<_, RbpfError>((x, switch, params, y))
        })?;

        let latents = Latents {
            log_weights: previous.log_weights.clone(),
            variables: RandomVariables::sampled(
                step.map(|s| s.0.clone()),
                Some(step.map(|s| s.1.clone())),
            ),
            gls_params: Some(step.map(|s| s.2.clone())),
        };
        Ok(Prediction {
            latents,
            emissions: step.map(|s| s.3.clone()),
        })
    }

    fn emit(
        &self,
        latents: &Latents,
        controls: Option<&[ControlInputs]>,
    ) -> Result<ParticleArray<MultivariateNormal>> {
        check_batch_controls(controls, latents.n_batch())?;
        let vars = &latents.variables;
        ParticleArray::try_from_fn(latents.n_particle(), latents.n_batch(), |p, b| {
            let ctrl = controls_for(controls, b);
            let params = self.params_for(latents, p, b, ctrl)?;
            let d = params.emission_bias(ctrl.target.as_ref())?;
            match (&vars.x, &vars.m, &vars.v) {
                (Some(x), _, _) => {
                    check_system_dims(&self.config, &params, &x[(p, b)])?;
                    sampled_emission(&params, &x[(p, b)], &d)
                }
                (None, Some(m), Some(v)) => {
                    let (m, v) = (&m[(p, b)], &v[(p, b)]);
                    check_system_dims(&self.config, &params, m)?;
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
    use crate::gls::{LinearTerm, StaticGlsParameters};
    use crate::resampling::ResamplingScheme;
    use crate::switch::{
        GaussianStatePrior, GaussianSwitchPrior, LinearGaussianEncoder,
        LinearGaussianSwitchTransition,
    };
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn s(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    fn sv(v: f64) -> DVector<f64> {
        DVector::from_element(1, v)
    }

    fn model(n_particle: usize, min_ess_ratio: f64) -> SwitchingGaussianLinearSystem {
        let mut config = RbpfConfig {
            n_state: 1,
            n_obs: 1,
            n_switch: 1,
            n_particle,
            ..Default::default()
        };
        config.resampling.min_ess_ratio = min_ess_ratio;
        config.resampling.scheme = ResamplingScheme::Systematic;
        let params = GlsParams::new(
            LinearTerm::Matrix(s(0.9)),
            LinearTerm::Zero,
            s(1.0),
            LinearTerm::Zero,
            s(0.1),
            s(0.1),
        )
        .unwrap();
        SwitchingGaussianLinearSystem::new(
            config,
            Box::new(GaussianStatePrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(GaussianSwitchPrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(LinearGaussianSwitchTransition::new(s(0.8), None, &s(0.5)).unwrap()),
            Box::new(LinearGaussianEncoder::new(s(0.5), sv(0.0), &s(2.0)).unwrap()),
            Box::new(StaticGlsParameters::new(params)),
        )
        .unwrap()
    }

    #[test]
    fn zero_switch_dimension_is_rejected() {
        let mut config = RbpfConfig::default();
        config.n_switch = 0;
        let params = GlsParams::new(
            LinearTerm::Identity,
            LinearTerm::Zero,
            s(1.0),
            LinearTerm::Zero,
            s(0.1),
            s(0.1),
        )
        .unwrap();
        let res = SwitchingGaussianLinearSystem::new(
            config,
            Box::new(GaussianStatePrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(GaussianSwitchPrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(LinearGaussianSwitchTransition::new(s(0.8), None, &s(0.5)).unwrap()),
            Box::new(LinearGaussianEncoder::new(s(0.5), sv(0.0), &s(2.0)).unwrap()),
            Box::new(StaticGlsParameters::new(params)),
        );
        assert!(res.is_err());
    }

    #[test]
    fn first_step_weight_is_predictive_plus_switch_ratio() {
        let model = model(1, 0.0);
        let mut rng = StdRng::seed_from_u64(4);
        let lats = model.filter_step(None, &[Some(sv(1.0))], None, &mut rng).unwrap();

        // the switch does not enter the system, so the state follows a scalar Kalman filter
        let k = 0.91 / 1.01;
        assert_approx_eq!(lats.variables.m.as_ref().unwrap()[(0, 0)][0], k, 1e-12);

        let s1 = &lats.variables.switch.as_ref().unwrap()[(0, 0)];
        let prior = MultivariateNormal::new(sv(0.0), &s(1.0)).unwrap();
        let encoded = MultivariateNormal::new(sv(0.5), &s(2.0)).unwrap();
        let proposal = fuse_densities(&[&prior, &encoded]).unwrap();
        let predictive = MultivariateNormal::new(sv(0.0), &s(1.01)).unwrap();
        let expected = predictive.log_prob(&sv(1.0)) + prior.log_prob(s1) - proposal.log_prob(s1);
        assert_approx_eq!(lats.log_weights[(0, 0)], expected, 1e-10);
    }

    #[test]
    fn later_step_weight_uses_transition_of_resampled_switch() {
        let model = model(1, 1.0);
        let mut rng = StdRng::seed_from_u64(6);
        let first = model.filter_step(None, &[Some(sv(1.0))], None, &mut rng).unwrap();
        let second = model
            .filter_step(Some(&first), &[Some(sv(0.5))], None, &mut rng)
            .unwrap();

        let no_controls = ControlInputs::default();
        let s1 = &first.variables.switch.as_ref().unwrap()[(0, 0)];
        let s2 = &second.variables.switch.as_ref().unwrap()[(0, 0)];
        let transition = LinearGaussianSwitchTransition::new(s(0.8), None, &s(0.5))
            .unwrap()
            .transition(s1, &no_controls)
            .unwrap();
        let encoded = LinearGaussianEncoder::new(s(0.5), sv(0.0), &s(2.0))
            .unwrap()
            .encode(&sv(0.5), &no_controls)
            .unwrap();
        let proposal = fuse_densities(&[&transition, &encoded]).unwrap();

        let m1 = first.variables.m.as_ref().unwrap()[(0, 0)][0];
        let v1 = first.variables.v.as_ref().unwrap()[(0, 0)][(0, 0)];
        let predictive = MultivariateNormal::new(sv(0.9 * m1), &s(0.81 * v1 + 0.1 + 0.1)).unwrap();

        // a single particle has normalized log-weight zero before the increment
        let expected =
            predictive.log_prob(&sv(0.5)) + transition.log_prob(s2) - proposal.log_prob(s2);
        assert_approx_eq!(second.log_weights[(0, 0)], expected, 1e-10);
    }

    #[test]
    fn state_prior_of_the_wrong_size_is_rejected() {
        let config = RbpfConfig::default();
        let params = GlsParams::new(
            LinearTerm::Identity,
            LinearTerm::Zero,
            s(1.0),
            LinearTerm::Zero,
            s(0.1),
            s(0.1),
        )
        .unwrap();
        let res = SwitchingGaussianLinearSystem::new(
            config,
            Box::new(GaussianStatePrior::new(DVector::zeros(2), &DMatrix::identity(2, 2)).unwrap()),
            Box::new(GaussianSwitchPrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(LinearGaussianSwitchTransition::new(s(0.8), None, &s(0.5)).unwrap()),
            Box::new(LinearGaussianEncoder::new(s(0.5), sv(0.0), &s(2.0)).unwrap()),
            Box::new(StaticGlsParameters::new(params)),
        );
        assert!(matches!(res, Err(RbpfError::Configuration(_))));
    }

    #[test]
    fn provider_of_the_wrong_size_fails_the_step() {
        let two_state = GlsParams::new(
            LinearTerm::Identity,
            LinearTerm::Zero,
            DMatrix::from_element(1, 2, 1.0),
            LinearTerm::Zero,
            s(0.1),
            DMatrix::identity(2, 2),
        )
        .unwrap();
        let model = SwitchingGaussianLinearSystem::new(
            RbpfConfig::default(),
            Box::new(GaussianStatePrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(GaussianSwitchPrior::new(sv(0.0), &s(1.0)).unwrap()),
            Box::new(LinearGaussianSwitchTransition::new(s(0.8), None, &s(0.5)).unwrap()),
            Box::new(LinearGaussianEncoder::new(s(0.5), sv(0.0), &s(2.0)).unwrap()),
            Box::new(StaticGlsParameters::new(two_state)),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for y in [Some(sv(1.0)), None] {
            let res = model.filter_step(None, &[y], None, &mut rng);
            assert!(matches!(res, Err(RbpfError::Configuration(_))));
        }
    }

    #[test]
    fn controls_must_cover_every_batch_element() {
        let model = model(2, 0.5);
        let mut rng = StdRng::seed_from_u64(0);
        let controls = vec![ControlInputs::default()];
        let observations = [Some(sv(1.0)), Some(sv(0.0))];
        assert!(matches!(
            model.filter_step(None, &observations, Some(&controls), &mut rng),
            Err(RbpfError::Configuration(_))
        ));

        let lats = model.filter_step(None, &observations, None, &mut rng).unwrap();
        assert!(model.emit(&lats, Some(&controls)).is_err());
        let start = model.prepare_forecast(&lats, false, &mut rng).unwrap();
        assert!(
            model
                .forecast_sample_step(&start, Some(&controls), false, &mut rng)
                .is_err()
        );
    }

    #[test]
    fn missing_observation_leaves_weights_unchanged() {
        let model = model(4, 0.0);
        let mut rng = StdRng::seed_from_u64(0);
        let lats = model.filter_step(None, &[None], None, &mut rng).unwrap();
        for lw in lats.log_weights.iter() {
            assert_approx_eq!(*lw, -(4.0_f64).ln(), 1e-15);
        }
        // posterior is the prediction
        assert_approx_eq!(lats.variables.v.as_ref().unwrap()[(0, 0)][(0, 0)], 0.91, 1e-12);
    }

    #[test]
    fn wrong_observation_size_is_rejected() {
        let model = model(2, 0.5);
        let mut rng = StdRng::seed_from_u64(0);
        let y = DVector::from_vec(vec![1.0, 2.0]);
        assert!(matches!(
            model.filter_step(None, &[Some(y)], None, &mut rng),
            Err(RbpfError::Configuration(_))
        ));
    }

    #[test]
    fn forecast_step_samples_state_and_keeps_weights() {
        let model = model(3, 0.5);
        let mut rng = StdRng::seed_from_u64(8);
        let lats = model
            .filter_step(None, &[Some(sv(1.0)), Some(sv(-1.0))], None, &mut rng)
            .unwrap();
        let start = model.prepare_forecast(&lats, false, &mut rng).unwrap();
        let pred = model.forecast_sample_step(&start, None, false, &mut rng).unwrap();
        assert!(pred.latents.variables.x.is_some());
        assert!(pred.latents.variables.m.is_none());
        assert_eq!(pred.latents.log_weights, start.log_weights);
        assert_eq!(pred.emissions.n_batch(), 2);
    }

    #[test]
    fn emit_uses_filtered_moments() {
        let model = model(1, 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let lats = model.filter_step(None, &[Some(sv(1.0))], None, &mut rng).unwrap();
        let dist = &model.emit(&lats, None).unwrap()[(0, 0)];
        let m = lats.variables.m.as_ref().unwrap()[(0, 0)][0];
        let v = lats.variables.v.as_ref().unwrap()[(0, 0)][(0, 0)];
        assert_approx_eq!(dist.mean()[0], m, 1e-15);
        assert_approx_eq!(dist.covariance()[(0, 0)], v + 0.1, 1e-12);
    }

    #[test]
    fn batch_mismatch_with_previous_latents_is_rejected() {
        let model = model(2, 0.5);
        let mut rng = StdRng::seed_from_u64(0);
        let lats = model.filter_step(None, &[Some(sv(1.0))], None, &mut rng).unwrap();
        let res = model.filter_step(Some(&lats), &[Some(sv(1.0)), None], None, &mut rng);
        assert!(res.is_err());
    }
}
