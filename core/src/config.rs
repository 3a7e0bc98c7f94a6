//! Filter configuration.
//!
//! [`RbpfConfig`] collects the dimensions, particle count, resampling policy and seeding of a
//! filter. It is plain serde data so that experiments can be described in JSON, YAML or TOML
//! files and loaded with [`RbpfConfig::from_file`].
//!
//! ```
//! use rbpf::config::{RbpfConfig, ResamplingConfig};
//! use rbpf::resampling::ResamplingScheme;
//!
//! let cfg = RbpfConfig {
//!     n_state: 2,
//!     n_obs: 1,
//!     n_switch: 3,
//!     n_particle: 64,
//!     resampling: ResamplingConfig {
//!         min_ess_ratio: 0.5,
//!         scheme: ResamplingScheme::Stratified,
//!     },
//!     seed: Some(7),
//!     deterministic_forecast: false,
//! };
//! assert!(cfg.validate().is_ok());
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{RbpfError, Result};
use crate::resampling::{EssCriterion, ResamplingScheme};

/// When and how to resample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResamplingConfig {
    /// Resample a batch element when ESS / n_particle falls below this ratio.
    /// `0.0` never resamples, `1.0` resamples every step.
    #[serde(default = "default_min_ess_ratio")]
    pub min_ess_ratio: f64,
    #[serde(default)]
    pub scheme: ResamplingScheme,
}

fn default_min_ess_ratio() -> f64 {
    0.5
}

impl Default for ResamplingConfig {
    fn default() -> Self {
        Self {
            min_ess_ratio: default_min_ess_ratio(),
            scheme: ResamplingScheme::default(),
        }
    }
}

impl ResamplingConfig {
    pub fn criterion(&self) -> EssCriterion {
        EssCriterion::new(self.min_ess_ratio)
    }
}

/// Dimensions and run-time settings of a filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RbpfConfig {
    /// Dimension of the linear-Gaussian state `z`.
    pub n_state: usize,
    /// Dimension of the observation `y`.
    pub n_obs: usize,
    /// Dimension of the continuous switch `s`.
    pub n_switch: usize,
    /// Particles per batch element.
    pub n_particle: usize,
    /// Seed for the filter's random source. `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Default for [`crate::rbpf::SwitchingGaussianLinearSystem::predict`] when the caller
    /// does not override it.
    #[serde(default)]
    pub deterministic_forecast: bool,
    #[serde(default)]
    pub resampling: ResamplingConfig,
}

impl Default for RbpfConfig {
    fn default() -> Self {
        Self {
            n_state: 1,
            n_obs: 1,
            n_switch: 1,
            n_particle: 100,
            resampling: ResamplingConfig::default(),
            seed: None,
            deterministic_forecast: false,
        }
    }
}

impl RbpfConfig {
    /// Reject configurations that can never produce a valid filter.
    pub fn validate(&self) -> Result<()> {
        if self.n_state == 0 {
            return Err(RbpfError::config("n_state must be at least 1"));
        }
        if self.n_obs == 0 {
            return Err(RbpfError::config("n_obs must be at least 1"));
        }
        if self.n_particle == 0 {
            return Err(RbpfError::config("n_particle must be at least 1"));
        }
        let ratio = self.resampling.min_ess_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(RbpfError::config(format!(
                "min_ess_ratio must lie in [0, 1], got {ratio}"
            )));
        }
        Ok(())
    }

    /// A model is trained for one particle count; training with another is an error.
    pub fn check_particle_count(&self, n_particle_train: usize) -> Result<()> {
        if n_particle_train != self.n_particle {
            return Err(RbpfError::config(format!(
                "model is configured for {} particles, training requested {}",
                self.n_particle, n_particle_train
            )));
        }
        Ok(())
    }

    /// Random source for the filter, seeded when a seed is configured.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(serialization)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(serialization)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(serialization)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(serialization)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(serialization)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(serialization)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let cfg = match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension(p)),
        }?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> RbpfError {
    RbpfError::config(format!(
        "unsupported config file extension: {}",
        path.display()
    ))
}

fn serialization(e: impl std::fmt::Display) -> RbpfError {
    RbpfError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config() -> RbpfConfig {
        RbpfConfig {
            n_state: 3,
            n_obs: 2,
            n_switch: 4,
            n_particle: 32,
            resampling: ResamplingConfig {
                min_ess_ratio: 0.25,
                scheme: ResamplingScheme::Multinomial,
            },
            seed: Some(42),
            deterministic_forecast: true,
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RbpfConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = sample_config();
        cfg.n_particle = 0;
        assert!(matches!(cfg.validate(), Err(RbpfError::Configuration(_))));

        let mut cfg = sample_config();
        cfg.resampling.min_ess_ratio = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = sample_config();
        cfg.n_state = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn particle_count_mismatch_is_an_error() {
        let cfg = sample_config();
        assert!(cfg.check_particle_count(32).is_ok());
        assert!(matches!(
            cfg.check_particle_count(16),
            Err(RbpfError::Configuration(_))
        ));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        use rand::Rng;
        let cfg = sample_config();
        let a: f64 = cfg.rng().random();
        let b: f64 = cfg.rng().random();
        assert_eq!(a, b);
    }

    #[test]
    fn file_round_trip_all_formats() {
        let dir = tempdir().unwrap();
        let cfg = sample_config();
        for name in ["cfg.json", "cfg.yaml", "cfg.yml", "cfg.toml"] {
            let path = dir.path().join(name);
            cfg.to_file(&path).unwrap();
            let read = RbpfConfig::from_file(&path).unwrap();
            assert_eq!(read, cfg, "round trip through {name}");
        }
    }

    #[test]
    fn missing_sections_take_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("minimal.toml");
        std::fs::write(&path, "n_state = 2\nn_obs = 1\nn_switch = 2\nn_particle = 10\n").unwrap();
        let cfg = RbpfConfig::from_file(&path).unwrap();
        assert_eq!(cfg.resampling, ResamplingConfig::default());
        assert_eq!(cfg.seed, None);
        assert!(!cfg.deterministic_forecast);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.ini");
        assert!(sample_config().to_file(&path).is_err());
        assert!(RbpfConfig::from_file(&path).is_err());
    }
}
