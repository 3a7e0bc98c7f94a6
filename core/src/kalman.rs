//! Kalman recursion primitives for one particle.
//!
//! ```text
//! predict:     m' = A m + b                 V' = A V Aᵀ + R
//! predictive:  y  ~ N(C m' + d, C V' Cᵀ + Q)
//! update:      K  = V' Cᵀ S⁻¹               m  = m' + K (y - C m' - d)
//!              V  = (I - K C) V' (I - K C)ᵀ + K Q Kᵀ
//! ```
//!
//! The covariance update uses the Joseph form and every returned covariance is symmetrized.
//! [`update_with_predictive`] factorizes the innovation covariance `S` once and uses the same
//! factor for the gain and for the predictive density.

use nalgebra::{DMatrix, DVector};

use crate::distributions::MultivariateNormal;
use crate::error::{RbpfError, Result};
use crate::gls::{GlsParams, LinearTerm};
use crate::linalg::{spd_solve, symmetrize};

/// Transition step. `A = Identity` skips both products.
pub fn predict(
    m: &DVector<f64>,
    v: &DMatrix<f64>,
    a: &LinearTerm,
    b: &DVector<f64>,
    r: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let m_pred = a.mul_vec(m, m.len()) + b;
    let v_pred = symmetrize(&(a.sandwich(v) + r));
    (m_pred, v_pred)
}

/// Marginal distribution of the observation under the predicted state.
pub fn predictive_distribution(
    m: &DVector<f64>,
    v: &DMatrix<f64>,
    c: &DMatrix<f64>,
    d: &DVector<f64>,
    q: &DMatrix<f64>,
) -> Result<MultivariateNormal> {
    let loc = c * m + d;
    let s = symmetrize(&(c * v * c.transpose() + q));
    MultivariateNormal::new(loc, &s)
}

/// Measurement update with a standalone SPD solve for the gain.
pub fn measurement_update(
    m: &DVector<f64>,
    v: &DMatrix<f64>,
    y: &DVector<f64>,
    c: &DMatrix<f64>,
    d: &DVector<f64>,
    q: &DMatrix<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let s = symmetrize(&(c * v * c.transpose() + q));
    // Kᵀ = S⁻¹ C V
    let k = spd_solve(&s, &(c * v))?.transpose();
    let innovation = y - (c * m + d);
    Ok(joseph_update(m, v, &k, &innovation, c, q))
}

/// Measurement update that also returns the predictive density `N(C m + d, S)`.
///
/// The gain is solved against the predictive density's scale factor, so `S` is decomposed
/// exactly once.
pub fn update_with_predictive(
    m: &DVector<f64>,
    v: &DMatrix<f64>,
    y: &DVector<f64>,
    c: &DMatrix<f64>,
    d: &DVector<f64>,
    q: &DMatrix<f64>,
) -> Result<(DVector<f64>, DMatrix<f64>, MultivariateNormal)> {
    let predictive = predictive_distribution(m, v, c, d, q)?;
    let l = predictive.scale_tril();
    let cv = c * v;
    let k = l
        .solve_lower_triangular(&cv)
        .and_then(|x| l.tr_solve_lower_triangular(&x))
        .ok_or_else(|| RbpfError::numerical("innovation covariance is singular"))?
        .transpose();
    let innovation = y - predictive.mean();
    let (m_post, v_post) = joseph_update(m, v, &k, &innovation, c, q);
    Ok((m_post, v_post, predictive))
}

fn joseph_update(
    m: &DVector<f64>,
    v: &DMatrix<f64>,
    k: &DMatrix<f64>,
    innovation: &DVector<f64>,
    c: &DMatrix<f64>,
    q: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let m_post = m + k * innovation;
    let i_kc = DMatrix::<f64>::identity(m.len(), m.len()) - k * c;
    let v_post = &i_kc * v * i_kc.transpose() + k * q * k.transpose();
    (m_post, symmetrize(&v_post))
}

/// One full predict-then-update step under a parameter bundle.
///
/// Without an observation the update is skipped, the posterior is the prediction, and the
/// returned predictive density is still the marginal of the (unseen) observation.
pub fn filter_step(
    m: &DVector<f64>,
    v: &DMatrix<f64>,
    params: &GlsParams,
    b: &DVector<f64>,
    d: &DVector<f64>,
    y: Option<&DVector<f64>>,
) -> Result<(DVector<f64>, DMatrix<f64>, MultivariateNormal)> {
    let (m_pred, v_pred) = predict(m, v, &params.a, b, &params.r);
    match y {
        Some(y) => update_with_predictive(&m_pred, &v_pred, y, &params.c, d, &params.q),
        None => {
            let predictive = predictive_distribution(&m_pred, &v_pred, &params.c, d, &params.q)?;
            Ok((m_pred, v_pred, predictive))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn s(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    fn sv(v: f64) -> DVector<f64> {
        DVector::from_element(1, v)
    }

    #[test]
    fn identity_prediction_adds_noise() {
        let m = DVector::from_vec(vec![1.0, 2.0]);
        let v = DMatrix::identity(2, 2);
        let r = DMatrix::from_diagonal_element(2, 2, 0.5);
        let b = DVector::from_vec(vec![0.1, 0.0]);
        let (m1, v1) = predict(&m, &v, &LinearTerm::Identity, &b, &r);
        assert_approx_eq!(m1[0], 1.1, 1e-15);
        assert_eq!(m1[1], 2.0);
        assert_eq!(v1, DMatrix::from_diagonal_element(2, 2, 1.5));
    }

    #[test]
    fn noiseless_identity_update_recovers_observation() {
        let m = DVector::from_vec(vec![0.3, -0.7]);
        let v = DMatrix::identity(2, 2);
        let zero = DMatrix::zeros(2, 2);
        let (m_pred, v_pred) = predict(&m, &v, &LinearTerm::Identity, &DVector::zeros(2), &zero);
        let y = DVector::from_vec(vec![1.5, 2.5]);
        let c = DMatrix::identity(2, 2);
        let (m_post, v_post) =
            measurement_update(&m_pred, &v_pred, &y, &c, &DVector::zeros(2), &zero).unwrap();
        assert_approx_eq!(m_post[0], 1.5, 1e-12);
        assert_approx_eq!(m_post[1], 2.5, 1e-12);
        assert!(v_post.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn scalar_update_matches_hand_computation() {
        // prior N(0, 1), A = 0.9, R = 0.1 → N(0, 0.91); C = 1, Q = 0.1, y = 1
        let (m_pred, v_pred) =
            predict(&sv(0.0), &s(1.0), &LinearTerm::Matrix(s(0.9)), &sv(0.0), &s(0.1));
        assert_approx_eq!(v_pred[(0, 0)], 0.91, 1e-15);
        let (m_post, v_post) =
            measurement_update(&m_pred, &v_pred, &sv(1.0), &s(1.0), &sv(0.0), &s(0.1)).unwrap();
        let k = 0.91 / 1.01;
        assert_approx_eq!(m_post[0], k, 1e-12);
        assert_approx_eq!(v_post[(0, 0)], (1.0 - k) * 0.91, 1e-12);
    }

    #[test]
    fn shared_factor_update_agrees_with_standalone_update() {
        let m = DVector::from_vec(vec![0.2, -0.1, 0.4]);
        let v = DMatrix::from_row_slice(3, 3, &[1.0, 0.2, 0.0, 0.2, 0.8, 0.1, 0.0, 0.1, 0.5]);
        let c = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 0.5, 0.0, 1.0, -0.3]);
        let d = DVector::from_vec(vec![0.1, 0.2]);
        let q = DMatrix::from_row_slice(2, 2, &[0.3, 0.05, 0.05, 0.2]);
        let y = DVector::from_vec(vec![1.0, -1.0]);
        let (m1, v1) = measurement_update(&m, &v, &y, &c, &d, &q).unwrap();
        let (m2, v2, pred) = update_with_predictive(&m, &v, &y, &c, &d, &q).unwrap();
        assert!((m1 - m2).amax() < 1e-12);
        assert!((v1 - v2).amax() < 1e-12);
        assert!((pred.mean() - (&c * &m + &d)).amax() < 1e-15);
    }

    #[test]
    fn predictive_density_matches_scalar_normal() {
        let pred = predictive_distribution(&sv(0.5), &s(0.91), &s(1.0), &sv(0.0), &s(0.1)).unwrap();
        let var: f64 = 1.01;
        let expected = -0.5 * ((2.0 * std::f64::consts::PI * var).ln() + 0.25 / var);
        assert_approx_eq!(pred.log_prob(&sv(1.0)), expected, 1e-12);
    }

    #[test]
    fn missing_observation_skips_update() {
        let params = GlsParams::new(
            LinearTerm::Matrix(s(0.9)),
            LinearTerm::Zero,
            s(1.0),
            LinearTerm::Zero,
            s(0.1),
            s(0.1),
        )
        .unwrap();
        let (m, v, pred) =
            filter_step(&sv(1.0), &s(1.0), &params, &sv(0.0), &sv(0.0), None).unwrap();
        assert_approx_eq!(m[0], 0.9, 1e-15);
        assert_approx_eq!(v[(0, 0)], 0.91, 1e-15);
        assert_approx_eq!(pred.covariance()[(0, 0)], 1.01, 1e-12);
    }
}
