//! Rao-Blackwellized particle filtering for switching linear-Gaussian state-space models
//!
//! This crate filters and forecasts time series whose continuous latent state follows
//! linear-Gaussian dynamics that are modulated at every step by a continuous "switch" variable.
//! Particles sample the switch; conditioned on a particle's switch history, the continuous state is
//! handled exactly by a Kalman recursion. Importance weights combine the Kalman predictive
//! likelihood with the ratio of the switch model to the proposal, and particles are resampled when
//! the effective sample size drops.
//!
//! This crate is primarily built off of:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): vectors, matrices and Cholesky
//!   decompositions.
//! - [`rand`](https://crates.io/crates/rand) and
//!   [`rand_distr`](https://crates.io/crates/rand_distr): every random draw. Operations that draw
//!   take a caller-provided `&mut impl Rng`, so a seeded `StdRng` reproduces a run exactly.
//! - [`serde`](https://crates.io/crates/serde): configuration files in JSON, YAML or TOML.
//!
//! ## Crate overview
//!
//! - [config]: filter configuration and file I/O.
//! - [distributions]: multivariate normal densities in square-root form and density fusion.
//! - [error]: the error taxonomy.
//! - [gls]: linear-Gaussian system parameters and the providers that resolve them from a switch.
//! - [kalman]: prediction, measurement update and predictive distribution.
//! - [latents]: the immutable per-timestep particle records.
//! - [linalg]: covariance factors and log-space helpers.
//! - [linear]: the non-switching model family.
//! - [model]: the capability trait shared by all model families.
//! - [particles]: particle-by-batch storage and gathering.
//! - [rbpf]: the switching model family.
//! - [resampling]: effective sample size, index schemes and the generic resampler.
//! - [sim]: synthetic trajectories.
//! - [switch]: switch prior, transition and encoder collaborators.
//!
//! ## Layout conventions
//!
//! Particles and batch elements are two axes of every per-particle quantity. Log-weights are
//! `(n_particle, n_batch)` matrices; other quantities are [`particles::ParticleArray`]s of vectors
//! or matrices. Sequences are time-major.
//!
//! ## Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use rbpf::config::RbpfConfig;
//! use rbpf::gls::{GlsParams, LinearTerm};
//! use rbpf::linear::LinearGaussianSystem;
//! use rbpf::model::StateSpaceModel;
//! use rbpf::switch::GaussianStatePrior;
//!
//! let s = |v: f64| DMatrix::from_element(1, 1, v);
//! let params = GlsParams::new(
//!     LinearTerm::Matrix(s(0.9)),
//!     LinearTerm::Zero,
//!     s(1.0),
//!     LinearTerm::Zero,
//!     s(0.1),
//!     s(0.1),
//! )
//! .unwrap();
//! let prior = GaussianStatePrior::new(DVector::zeros(1), &s(1.0)).unwrap();
//! let config = RbpfConfig { n_particle: 1, seed: Some(0), ..Default::default() };
//! let mut rng = config.rng();
//! let model = LinearGaussianSystem::new(config, Box::new(prior), params).unwrap();
//!
//! let targets: Vec<_> = [1.0, 0.9, 0.8]
//!     .iter()
//!     .map(|y| vec![Some(DVector::from_element(1, *y))])
//!     .collect();
//! let loss = model.loss(&targets, None, &mut rng).unwrap();
//! assert!(loss[0].is_finite());
//! ```

pub mod config;
pub mod distributions;
pub mod error;
pub mod gls;
pub mod kalman;
pub mod latents;
pub mod linalg;
pub mod linear;
pub mod model;
pub mod particles;
pub mod rbpf;
pub mod resampling;
pub mod sim;
pub mod switch;

pub use config::{RbpfConfig, ResamplingConfig};
pub use error::{RbpfError, Result};
pub use latents::{Latents, Prediction, RandomVariables};
pub use linear::LinearGaussianSystem;
pub use model::{ModelFamily, Smoother, StateSpaceModel};
pub use rbpf::SwitchingGaussianLinearSystem;
pub use resampling::ResamplingScheme;
