//! The capability set shared by every model family.
//!
//! A model implements three per-step operations ([`StateSpaceModel::filter_step`],
//! [`StateSpaceModel::forecast_sample_step`], [`StateSpaceModel::emit`]); everything that runs
//! over a whole sequence (filtering, the FIVO-type loss, forecasting and prediction) is
//! provided on top of them.
//!
//! Sequences are time-major: `past_targets[t][b]` is the observation of batch element `b` at
//! timestep `t`, `None` when unobserved. Controls follow the same layout.

use log::{info, trace};
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::config::RbpfConfig;
use crate::distributions::MultivariateNormal;
use crate::error::{RbpfError, Result};
use crate::gls::{ControlInputs, GlsParams, controls_for};
use crate::latents::{Latents, Prediction, RandomVariables};
use crate::linalg::logsumexp;
use crate::particles::ParticleArray;
use crate::resampling::{EssCriterion, argmax_log_weights, normalize_log_weights, resample};
use crate::switch::StatePrior;

/// Observations of all batch elements at one timestep.
pub type Observations = Vec<Option<DVector<f64>>>;

/// Controls of all batch elements at one timestep.
pub type StepControls = Vec<ControlInputs>;

/// Model families and the capabilities they provide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFamily {
    /// Sampled continuous switch, Rao-Blackwellized linear-Gaussian state.
    SwitchingRbpf,
    /// A single linear-Gaussian regime; the filter is the exact Kalman filter.
    LinearGaussian,
}

impl ModelFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ModelFamily::SwitchingRbpf => "switching RBPF",
            ModelFamily::LinearGaussian => "linear Gaussian",
        }
    }

    /// Neither family implements [`Smoother`].
    pub fn supports_smoothing(&self) -> bool {
        match self {
            ModelFamily::SwitchingRbpf | ModelFamily::LinearGaussian => false,
        }
    }

    pub fn require_smoothing(&self) -> Result<()> {
        if self.supports_smoothing() {
            Ok(())
        } else {
            Err(RbpfError::Unsupported(format!(
                "smoothing is not available for the {} family",
                self.name()
            )))
        }
    }
}

/// Backward smoothing over filtered latents.
///
/// Particle-filter families do not implement this trait; use
/// [`ModelFamily::require_smoothing`] to check at run time.
pub trait Smoother {
    fn smooth_step(&self, smoothed_next: Option<&Latents>, filtered: &Latents) -> Result<Latents>;
}

pub trait StateSpaceModel {
    fn config(&self) -> &RbpfConfig;

    fn family(&self) -> ModelFamily;

    /// One filtering step. `previous == None` initializes from the priors.
    fn filter_step<R: Rng + ?Sized>(
        &self,
        previous: Option<&Latents>,
        observations: &[Option<DVector<f64>>],
        controls: Option<&[ControlInputs]>,
        rng: &mut R,
    ) -> Result<Latents>;

    /// One rollout step without evidence. Log-weights are carried unchanged.
    fn forecast_sample_step<R: Rng + ?Sized>(
        &self,
        previous: &Latents,
        controls: Option<&[ControlInputs]>,
        deterministic: bool,
        rng: &mut R,
    ) -> Result<Prediction>;

    /// Per-particle emission distribution of a timestep.
    ///
    /// Filtered latents give `N(C m + d, C V Cᵀ + Q)`, sampled latents `N(C x + d, Q)`.
    fn emit(
        &self,
        latents: &Latents,
        controls: Option<&[ControlInputs]>,
    ) -> Result<ParticleArray<MultivariateNormal>>;

    /// Filter a whole sequence. The first failing step aborts the sequence.
    fn filter<R: Rng + ?Sized>(
        &self,
        past_targets: &[Observations],
        past_controls: Option<&[StepControls]>,
        rng: &mut R,
    ) -> Result<Vec<Latents>> {
        check_controls_len(past_targets.len(), past_controls)?;
        let mut filtered: Vec<Latents> = Vec::with_capacity(past_targets.len());
        for (t, observations) in past_targets.iter().enumerate() {
            let latents = self.filter_step(
                filtered.last(),
                observations,
                step_controls(past_controls, t),
                rng,
            )?;
            trace!(
                "filter step {t}: log-weights in [{:.3}, {:.3}]",
                latents.log_weights.min(),
                latents.log_weights.max()
            );
            filtered.push(latents);
        }
        Ok(filtered)
    }

    /// Negative FIVO-type log-evidence estimate, one value per batch element:
    /// `-Σ_t logsumexp_p log_weights[t][p, b]`.
    fn loss_filter<R: Rng + ?Sized>(
        &self,
        past_targets: &[Observations],
        past_controls: Option<&[StepControls]>,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        let filtered = self.filter(past_targets, past_controls, rng)?;
        let n_batch = past_targets.first().map_or(0, Vec::len);
        let mut log_marginal = vec![0.0; n_batch];
        for latents in &filtered {
            for (b, column) in latents.log_weights.column_iter().enumerate() {
                log_marginal[b] += logsumexp(column.iter().copied());
            }
        }
        Ok(log_marginal.into_iter().map(|l| -l).collect())
    }

    fn loss<R: Rng + ?Sized>(
        &self,
        past_targets: &[Observations],
        past_controls: Option<&[StepControls]>,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        self.loss_filter(past_targets, past_controls, rng)
    }

    /// [`StateSpaceModel::loss`] for a training run, which must use the configured particle
    /// count.
    fn training_loss<R: Rng + ?Sized>(
        &self,
        n_particle_train: usize,
        past_targets: &[Observations],
        past_controls: Option<&[StepControls]>,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        self.config().check_particle_count(n_particle_train)?;
        self.loss(past_targets, past_controls, rng)
    }

    /// Collapse terminal latents to an unweighted particle set.
    ///
    /// Every batch element is resampled. In deterministic mode all mass is first put on the
    /// arg-max particle so every slot copies it.
    fn prepare_forecast<R: Rng + ?Sized>(
        &self,
        initial: &Latents,
        deterministic: bool,
        rng: &mut R,
    ) -> Result<Latents> {
        let config = self.config();
        check_particle_count(config, initial)?;
        let log_weights = if deterministic {
            argmax_log_weights(&initial.log_weights)
        } else {
            initial.log_weights.clone()
        };
        let (log_weights, variables) = resample(
            config.n_particle,
            &normalize_log_weights(&log_weights),
            &initial.variables,
            config.resampling.scheme,
            &EssCriterion::always(),
            rng,
        );
        Ok(Latents {
            log_weights,
            variables,
            gls_params: None,
        })
    }

    /// Roll out `n_steps_forecast` steps from terminal latents.
    fn forecast<R: Rng + ?Sized>(
        &self,
        initial: &Latents,
        n_steps_forecast: usize,
        future_controls: Option<&[StepControls]>,
        deterministic: bool,
        rng: &mut R,
    ) -> Result<Vec<Prediction>> {
        check_controls_len(n_steps_forecast, future_controls)?;
        info!(
            "forecasting {} steps for {} batch elements ({})",
            n_steps_forecast,
            initial.n_batch(),
            if deterministic { "deterministic" } else { "sampled" }
        );
        let mut latents = self.prepare_forecast(initial, deterministic, rng)?;
        let mut predictions = Vec::with_capacity(n_steps_forecast);
        for t in 0..n_steps_forecast {
            let prediction = self.forecast_sample_step(
                &latents,
                step_controls(future_controls, t),
                deterministic,
                rng,
            )?;
            latents = prediction.latents.clone();
            predictions.push(prediction);
        }
        Ok(predictions)
    }

    /// Filter the past, then forecast the future.
    ///
    /// Returns `(inferred, forecast)`. Inferred emissions are drawn from (or, when
    /// deterministic, the mean of) the filtered emission distribution of every past step.
    /// `deterministic == None` uses the configured default.
    fn predict<R: Rng + ?Sized>(
        &self,
        n_steps_forecast: usize,
        past_targets: &[Observations],
        past_controls: Option<&[StepControls]>,
        future_controls: Option<&[StepControls]>,
        deterministic: Option<bool>,
        rng: &mut R,
    ) -> Result<(Vec<Prediction>, Vec<Prediction>)> {
        let deterministic = deterministic.unwrap_or(self.config().deterministic_forecast);
        let filtered = self.filter(past_targets, past_controls, rng)?;
        let Some(last) = filtered.last() else {
            return Err(RbpfError::config("prediction needs at least one past timestep"));
        };
        let forecast = self.forecast(last, n_steps_forecast, future_controls, deterministic, rng)?;

        let mut inferred = Vec::with_capacity(filtered.len());
        for (t, latents) in filtered.into_iter().enumerate() {
            let dists = self.emit(&latents, step_controls(past_controls, t))?;
            let emissions = sample_emissions(&dists, deterministic, rng);
            inferred.push(Prediction { latents, emissions });
        }
        Ok((inferred, forecast))
    }
}

pub(crate) fn step_controls(
    controls: Option<&[StepControls]>,
    t: usize,
) -> Option<&[ControlInputs]> {
    controls.and_then(|c| c.get(t)).map(Vec::as_slice)
}

fn check_controls_len(n_steps: usize, controls: Option<&[StepControls]>) -> Result<()> {
    match controls {
        Some(c) if c.len() != n_steps => Err(RbpfError::config(format!(
            "got controls for {} timesteps, expected {}",
            c.len(),
            n_steps
        ))),
        _ => Ok(()),
    }
}

/// Per-batch controls, when given, must cover every batch element.
pub(crate) fn check_batch_controls(
    controls: Option<&[ControlInputs]>,
    n_batch: usize,
) -> Result<()> {
    match controls {
        Some(c) if c.len() != n_batch => Err(RbpfError::config(format!(
            "got controls for {} batch elements, expected {}",
            c.len(),
            n_batch
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn check_state_prior(config: &RbpfConfig, prior: &dyn StatePrior) -> Result<()> {
    let dim = prior.state_prior(&ControlInputs::default())?.dim();
    if dim != config.n_state {
        return Err(RbpfError::config(format!(
            "state prior has dimension {dim}, config says n_state = {}",
            config.n_state
        )));
    }
    Ok(())
}

/// The parameters must act on `state` and emit `config.n_obs`-sized observations.
pub(crate) fn check_system_dims(
    config: &RbpfConfig,
    params: &GlsParams,
    state: &DVector<f64>,
) -> Result<()> {
    if params.n_state() != state.len() || params.n_obs() != config.n_obs {
        return Err(RbpfError::config(format!(
            "system is {}-state/{}-obs, particle state has size {} and n_obs = {}",
            params.n_state(),
            params.n_obs(),
            state.len(),
            config.n_obs
        )));
    }
    Ok(())
}

pub(crate) fn check_particle_count(config: &RbpfConfig, latents: &Latents) -> Result<()> {
    if latents.n_particle() != config.n_particle {
        return Err(RbpfError::config(format!(
            "latents carry {} particles, model is configured for {}",
            latents.n_particle(),
            config.n_particle
        )));
    }
    Ok(())
}

pub(crate) fn check_observations(
    config: &RbpfConfig,
    observations: &[Option<DVector<f64>>],
) -> Result<()> {
    for (b, y) in observations.iter().enumerate() {
        if let Some(y) = y {
            if y.len() != config.n_obs {
                return Err(RbpfError::config(format!(
                    "observation of batch element {b} has size {}, expected {}",
                    y.len(),
                    config.n_obs
                )));
            }
        }
    }
    Ok(())
}

/// The mean when deterministic, a reparameterized draw otherwise.
pub(crate) fn sample_or_mean<R: Rng + ?Sized>(
    dist: &MultivariateNormal,
    deterministic: bool,
    rng: &mut R,
) -> DVector<f64> {
    if deterministic {
        dist.mean().clone()
    } else {
        dist.rsample(rng)
    }
}

fn sample_emissions<R: Rng + ?Sized>(
    dists: &ParticleArray<MultivariateNormal>,
    deterministic: bool,
    rng: &mut R,
) -> ParticleArray<DVector<f64>> {
    dists.map(|d| sample_or_mean(d, deterministic, &mut *rng))
}

/// Prior `(m_0, V_0)` of every batch element, repeated across particles.
pub(crate) fn initial_state(
    prior: &dyn StatePrior,
    n_particle: usize,
    observations: &[Option<DVector<f64>>],
    controls: Option<&[ControlInputs]>,
) -> Result<(ParticleArray<DVector<f64>>, ParticleArray<DMatrix<f64>>)> {
    let priors = (0..observations.len())
        .map(|b| prior.state_prior(controls_for(controls, b)))
        .collect::<Result<Vec<_>>>()?;
    let means: Vec<DVector<f64>> = priors.iter().map(|d| d.mean().clone()).collect();
    let covs: Vec<DMatrix<f64>> = priors.iter().map(MultivariateNormal::covariance).collect();
    Ok((
        ParticleArray::broadcast(n_particle, &means),
        ParticleArray::broadcast(n_particle, &covs),
    ))
}

/// Uniform normalized log-weights.
pub(crate) fn uniform_log_weights(n_particle: usize, n_batch: usize) -> DMatrix<f64> {
    DMatrix::from_element(n_particle, n_batch, -(n_particle as f64).ln())
}

/// Normalize and resample the previous step, dropping any state sample first.
pub(crate) fn resample_previous<R: Rng + ?Sized>(
    config: &RbpfConfig,
    previous: &Latents,
    rng: &mut R,
) -> Result<(DMatrix<f64>, RandomVariables)> {
    check_particle_count(config, previous)?;
    Ok(resample(
        config.n_particle,
        &previous.log_norm_weights(),
        &previous.variables.without_sample(),
        config.resampling.scheme,
        &config.resampling.criterion(),
        rng,
    ))
}

/// The state particle `(p, b)` starts a rollout step from: the sample when present, otherwise
/// a draw from (or the mean of) `N(m, V)`.
pub(crate) fn rollout_start<R: Rng + ?Sized>(
    variables: &RandomVariables,
    p: usize,
    b: usize,
    deterministic: bool,
    rng: &mut R,
) -> Result<DVector<f64>> {
    if let Some(x) = &variables.x {
        return Ok(x[(p, b)].clone());
    }
    match (&variables.m, &variables.v) {
        (Some(m), Some(v)) => {
            if deterministic {
                Ok(m[(p, b)].clone())
            } else {
                Ok(MultivariateNormal::new(m[(p, b)].clone(), &v[(p, b)])?.rsample(rng))
            }
        }
        _ => Err(RbpfError::config("latents carry no state to roll out from")),
    }
}

/// `x_t ~ N(A x + b, R)` using the factor carried by the parameters.
pub(crate) fn state_transition(
    params: &GlsParams,
    x: &DVector<f64>,
    bias: &DVector<f64>,
) -> Result<MultivariateNormal> {
    let loc = params.a.mul_vec(x, params.n_state()) + bias;
    MultivariateNormal::from_scale_tril(loc, params.lr.clone())
}

/// `y_t ~ N(C x + d, Q)`.
pub(crate) fn sampled_emission(
    params: &GlsParams,
    x: &DVector<f64>,
    bias: &DVector<f64>,
) -> Result<MultivariateNormal> {
    MultivariateNormal::from_scale_tril(&params.c * x + bias, params.lq.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn no_family_supports_smoothing() {
        for family in [ModelFamily::SwitchingRbpf, ModelFamily::LinearGaussian] {
            assert!(!family.supports_smoothing());
            assert!(matches!(family.require_smoothing(), Err(RbpfError::Unsupported(_))));
        }
    }

    #[test]
    fn controls_length_is_checked() {
        let controls = vec![StepControls::new(); 2];
        assert!(check_controls_len(2, Some(&controls)).is_ok());
        assert!(check_controls_len(3, Some(&controls)).is_err());
        assert!(check_controls_len(3, None).is_ok());
        assert!(step_controls(Some(&controls), 1).is_some());
        assert!(step_controls(None, 1).is_none());
    }

    #[test]
    fn batch_controls_must_cover_the_batch() {
        let controls = vec![ControlInputs::default(); 2];
        assert!(check_batch_controls(Some(&controls), 2).is_ok());
        assert!(check_batch_controls(None, 5).is_ok());
        assert!(matches!(
            check_batch_controls(Some(&controls[..1]), 2),
            Err(RbpfError::Configuration(_))
        ));
    }

    #[test]
    fn system_dims_are_checked_against_the_state() {
        use crate::gls::LinearTerm;
        let params = GlsParams::new(
            LinearTerm::Identity,
            LinearTerm::Zero,
            DMatrix::from_element(1, 2, 1.0),
            LinearTerm::Zero,
            DMatrix::from_element(1, 1, 0.1),
            DMatrix::identity(2, 2),
        )
        .unwrap();
        let config = RbpfConfig {
            n_state: 2,
            ..Default::default()
        };
        assert!(check_system_dims(&config, &params, &DVector::zeros(2)).is_ok());
        assert!(check_system_dims(&config, &params, &DVector::zeros(1)).is_err());
        let wide = RbpfConfig {
            n_obs: 3,
            ..config
        };
        assert!(check_system_dims(&wide, &params, &DVector::zeros(2)).is_err());
    }

    #[test]
    fn deterministic_rollout_start_takes_the_mean() {
        let vars = RandomVariables::filtered(
            ParticleArray::from_fn(1, 1, |_, _| DVector::from_element(1, 2.0)),
            ParticleArray::from_fn(1, 1, |_, _| DMatrix::from_element(1, 1, 1.0)),
            None,
        );
        let mut a = StdRng::seed_from_u64(0);
        let mut b = StdRng::seed_from_u64(0);
        let x = rollout_start(&vars, 0, 0, true, &mut a).unwrap();
        assert_eq!(x[0], 2.0);
        // no draw was made
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }
}
