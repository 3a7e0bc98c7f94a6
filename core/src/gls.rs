//! Gaussian linear system parameters.
//!
//! One [`GlsParams`] bundle describes the linear-Gaussian transition and emission valid for a
//! single particle at a single timestep:
//!
//! ```text
//! z_t = A z_{t-1} + B u_state + w,   w ~ N(0, R)
//! y_t = C z_t     + D u_target + v,  v ~ N(0, Q)
//! ```
//!
//! `A`, `B` and `D` are [`LinearTerm`]s so that the identity transition and absent control
//! terms are explicit branches rather than materialized matrices. The noise covariances carry
//! their lower-triangular factors `LR`, `LQ`, computed once when the bundle is built.
//!
//! A [`GlsParameterProvider`] resolves a bundle from a switch sample and the controls of the
//! timestep. [`StaticGlsParameters`] ignores the switch; [`BaseMatrixMixture`] blends a set of
//! base matrices with weights `softmax(W s + c)`.

use nalgebra::{DMatrix, DVector};

use crate::error::{RbpfError, Result};
use crate::linalg::{cholesky_factor, symmetrize};

/// A linear map that may be the identity or absent altogether.
#[derive(Clone, Debug, PartialEq)]
pub enum LinearTerm {
    Identity,
    Zero,
    Matrix(DMatrix<f64>),
}

impl LinearTerm {
    pub fn is_identity(&self) -> bool {
        matches!(self, LinearTerm::Identity)
    }

    /// `M v`, with `out_dim` giving the length of the zero vector for [`LinearTerm::Zero`].
    pub fn mul_vec(&self, v: &DVector<f64>, out_dim: usize) -> DVector<f64> {
        match self {
            LinearTerm::Identity => v.clone(),
            LinearTerm::Zero => DVector::zeros(out_dim),
            LinearTerm::Matrix(m) => m * v,
        }
    }

    /// `M P Mᵀ`.
    pub fn sandwich(&self, p: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            LinearTerm::Identity => p.clone(),
            LinearTerm::Zero => DMatrix::zeros(p.nrows(), p.ncols()),
            LinearTerm::Matrix(m) => m * p * m.transpose(),
        }
    }

    fn check_shape(&self, name: &str, rows: usize, cols: Option<usize>) -> Result<()> {
        match self {
            LinearTerm::Matrix(m) => {
                let cols_ok = cols.is_none_or(|c| m.ncols() == c);
                if m.nrows() != rows || !cols_ok {
                    return Err(RbpfError::config(format!(
                        "{name} has shape {:?}, expected {} rows{}",
                        m.shape(),
                        rows,
                        cols.map(|c| format!(" and {c} columns")).unwrap_or_default()
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Per-batch-element exogenous inputs of one timestep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlInputs {
    /// Input to the state transition bias `B u`.
    pub state: Option<DVector<f64>>,
    /// Input to the emission bias `D u`.
    pub target: Option<DVector<f64>>,
    /// Input to the switch prior and transition.
    pub switch: Option<DVector<f64>>,
    /// Extra features appended to the observation before encoding.
    pub encoder: Option<DVector<f64>>,
}

pub(crate) static NO_CONTROLS: ControlInputs = ControlInputs {
    state: None,
    target: None,
    switch: None,
    encoder: None,
};

/// Controls of batch element `b`, or empty controls when none were given.
pub fn controls_for(controls: Option<&[ControlInputs]>, b: usize) -> &ControlInputs {
    controls.and_then(|c| c.get(b)).unwrap_or(&NO_CONTROLS)
}

/// Linear-Gaussian system matrices for one particle and one timestep.
#[derive(Clone, Debug, PartialEq)]
pub struct GlsParams {
    pub a: LinearTerm,
    pub b: LinearTerm,
    pub c: DMatrix<f64>,
    pub d: LinearTerm,
    /// Observation noise covariance.
    pub q: DMatrix<f64>,
    /// State noise covariance.
    pub r: DMatrix<f64>,
    pub lq: DMatrix<f64>,
    pub lr: DMatrix<f64>,
}

impl GlsParams {
    /// Validate dimensions and factorize both noise covariances.
    pub fn new(
        a: LinearTerm,
        b: LinearTerm,
        c: DMatrix<f64>,
        d: LinearTerm,
        q: DMatrix<f64>,
        r: DMatrix<f64>,
    ) -> Result<Self> {
        let n_state = r.nrows();
        let n_obs = q.nrows();
        if c.shape() != (n_obs, n_state) {
            return Err(RbpfError::config(format!(
                "emission matrix has shape {:?}, expected ({n_obs}, {n_state})",
                c.shape()
            )));
        }
        a.check_shape("transition matrix", n_state, Some(n_state))?;
        b.check_shape("state control matrix", n_state, None)?;
        d.check_shape("target control matrix", n_obs, None)?;
        if matches!(a, LinearTerm::Zero) {
            return Err(RbpfError::config("transition matrix cannot be absent"));
        }
        let q = symmetrize(&q);
        let r = symmetrize(&r);
        let lq = cholesky_factor(&q)?;
        let lr = cholesky_factor(&r)?;
        Ok(Self {
            a,
            b,
            c,
            d,
            q,
            r,
            lq,
            lr,
        })
    }

    pub fn n_state(&self) -> usize {
        self.r.nrows()
    }

    pub fn n_obs(&self) -> usize {
        self.q.nrows()
    }

    /// Transition bias `B u_state`; zero when either the term or the input is absent.
    pub fn transition_bias(&self, u_state: Option<&DVector<f64>>) -> Result<DVector<f64>> {
        bias(&self.b, u_state, self.n_state(), "state")
    }

    /// Emission bias `D u_target`; zero when either the term or the input is absent.
    pub fn emission_bias(&self, u_target: Option<&DVector<f64>>) -> Result<DVector<f64>> {
        bias(&self.d, u_target, self.n_obs(), "target")
    }
}

fn bias(
    term: &LinearTerm,
    input: Option<&DVector<f64>>,
    out_dim: usize,
    name: &str,
) -> Result<DVector<f64>> {
    let Some(u) = input else {
        return Ok(DVector::zeros(out_dim));
    };
    match term {
        LinearTerm::Matrix(m) if m.ncols() != u.len() => Err(RbpfError::config(format!(
            "{name} control of size {} does not match control matrix with {} columns",
            u.len(),
            m.ncols()
        ))),
        LinearTerm::Identity if u.len() != out_dim => Err(RbpfError::config(format!(
            "{name} control of size {} cannot pass through an identity term of size {out_dim}",
            u.len()
        ))),
        _ => Ok(term.mul_vec(u, out_dim)),
    }
}

/// Resolves the system matrices for one particle from its switch and the timestep's controls.
pub trait GlsParameterProvider {
    fn gls_params(&self, switch: &DVector<f64>, controls: &ControlInputs) -> Result<GlsParams>;
}

/// The same system regardless of the switch.
#[derive(Clone, Debug)]
pub struct StaticGlsParameters {
    params: GlsParams,
}

impl StaticGlsParameters {
    pub fn new(params: GlsParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &GlsParams {
        &self.params
    }
}

impl GlsParameterProvider for StaticGlsParameters {
    fn gls_params(&self, _switch: &DVector<f64>, _controls: &ControlInputs) -> Result<GlsParams> {
        Ok(self.params.clone())
    }
}

/// How base noise covariances are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CovarianceMixing {
    /// Σ = Σ_k w_k Σ_k, then factorized.
    #[default]
    Variances,
    /// L = Σ_k w_k L_k, Σ = L Lᵀ.
    Scales,
}

/// Switch-dependent system built from `K` base matrices per term.
///
/// The mixture weights are `softmax(W s + c)` with `W` of shape `(K, n_switch)`. A term given as
/// `None` is [`LinearTerm::Identity`] for `A` and [`LinearTerm::Zero`] for `B`, `D`.
#[derive(Clone, Debug)]
pub struct BaseMatrixMixture {
    link_weight: DMatrix<f64>,
    link_bias: DVector<f64>,
    a: Option<Vec<DMatrix<f64>>>,
    b: Option<Vec<DMatrix<f64>>>,
    c: Vec<DMatrix<f64>>,
    d: Option<Vec<DMatrix<f64>>>,
    q: Vec<DMatrix<f64>>,
    r: Vec<DMatrix<f64>>,
    lq: Vec<DMatrix<f64>>,
    lr: Vec<DMatrix<f64>>,
    mixing: CovarianceMixing,
}

impl BaseMatrixMixture {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link_weight: DMatrix<f64>,
        link_bias: DVector<f64>,
        a: Option<Vec<DMatrix<f64>>>,
        b: Option<Vec<DMatrix<f64>>>,
        c: Vec<DMatrix<f64>>,
        d: Option<Vec<DMatrix<f64>>>,
        q: Vec<DMatrix<f64>>,
        r: Vec<DMatrix<f64>>,
    ) -> Result<Self> {
        let n_base = link_weight.nrows();
        if n_base == 0 || link_bias.len() != n_base {
            return Err(RbpfError::config(format!(
                "link has {} weight rows and {} biases; need the same non-zero count",
                n_base,
                link_bias.len()
            )));
        }
        let check = |name: &str, mats: &[DMatrix<f64>]| -> Result<()> {
            if mats.len() != n_base {
                return Err(RbpfError::config(format!(
                    "{name}: expected {n_base} base matrices, got {}",
                    mats.len()
                )));
            }
            if mats.windows(2).any(|w| w[0].shape() != w[1].shape()) {
                return Err(RbpfError::config(format!(
                    "{name}: base matrices differ in shape"
                )));
            }
            Ok(())
        };
        check("C", &c)?;
        check("Q", &q)?;
        check("R", &r)?;
        for (name, term) in [("A", &a), ("B", &b), ("D", &d)] {
            if let Some(mats) = term {
                check(name, mats)?;
            }
        }
        let lq = q.iter().map(cholesky_factor).collect::<Result<Vec<_>>>()?;
        let lr = r.iter().map(cholesky_factor).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            link_weight,
            link_bias,
            a,
            b,
            c,
            d,
            q,
            r,
            lq,
            lr,
            mixing: CovarianceMixing::default(),
        })
    }

    pub fn with_mixing(mut self, mixing: CovarianceMixing) -> Self {
        self.mixing = mixing;
        self
    }

    pub fn n_base(&self) -> usize {
        self.link_weight.nrows()
    }

    /// Mixture weights `softmax(W s + c)`.
    pub fn weights(&self, switch: &DVector<f64>) -> Result<DVector<f64>> {
        if switch.len() != self.link_weight.ncols() {
            return Err(RbpfError::config(format!(
                "switch of size {} does not match link with {} inputs",
                switch.len(),
                self.link_weight.ncols()
            )));
        }
        let logits = &self.link_weight * switch + &self.link_bias;
        let max = logits.max();
        let exp = logits.map(|l| (l - max).exp());
        let total = exp.sum();
        Ok(exp / total)
    }

    fn noise(
        &self,
        weights: &DVector<f64>,
        covs: &[DMatrix<f64>],
        factors: &[DMatrix<f64>],
    ) -> DMatrix<f64> {
        match self.mixing {
            CovarianceMixing::Variances => weighted_sum(weights, covs),
            CovarianceMixing::Scales => {
                let l = weighted_sum(weights, factors);
                &l * l.transpose()
            }
        }
    }
}

fn weighted_sum(weights: &DVector<f64>, mats: &[DMatrix<f64>]) -> DMatrix<f64> {
    let (rows, cols) = mats[0].shape();
    mats.iter()
        .zip(weights.iter())
        .fold(DMatrix::zeros(rows, cols), |acc, (m, w)| acc + m * *w)
}

impl GlsParameterProvider for BaseMatrixMixture {
    fn gls_params(&self, switch: &DVector<f64>, _controls: &ControlInputs) -> Result<GlsParams> {
        let w = self.weights(switch)?;
        let term = |mats: &Option<Vec<DMatrix<f64>>>, absent: LinearTerm| match mats {
            Some(m) => LinearTerm::Matrix(weighted_sum(&w, m)),
            None => absent,
        };
        GlsParams::new(
            term(&self.a, LinearTerm::Identity),
            term(&self.b, LinearTerm::Zero),
            weighted_sum(&w, &self.c),
            term(&self.d, LinearTerm::Zero),
            self.noise(&w, &self.q, &self.lq),
            self.noise(&w, &self.r, &self.lr),
        )
    }
}
