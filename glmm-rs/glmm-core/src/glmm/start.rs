//! Heuristic starting values for the outer optimizer.
//!
//! The conditional fixed effects start at a GLM fit by iteratively
//! reweighted least squares (no random effects, no zero-inflation).
//! Zero-inflation coefficients and covariance parameters start at 0; the
//! dispersion intercept starts at the log residual variance for the
//! Gaussian family and at 0 otherwise.

use tracing::debug;

use glmm_linalg::decomposition::CholeskyDecomp;
use glmm_linalg::DenseMatrix;

use super::family::Family;
use super::link::Link;
use crate::error::FitResult;
use crate::model::parameters::{Block, ParameterLayout};
use crate::model::spec::ModelSpec;
use crate::util::math::weighted_mean;

/// IRLS iteration cap for starting values.
const IRLS_MAX_ITER: usize = 25;

/// Starting outer parameter vector for `spec`.
pub fn start_values(spec: &ModelSpec, layout: &ParameterLayout) -> FitResult<Vec<f64>> {
    let mut phi = vec![0.0; layout.len()];
    let glm = fit_glm_irls(
        &spec.y,
        &spec.cond.x,
        &spec.cond.offset,
        &spec.weights,
        spec.family,
        spec.link,
        IRLS_MAX_ITER,
    )?;
    phi[layout.range(Block::Beta)].copy_from_slice(&glm.beta);

    if spec.family == Family::Gaussian {
        if let Some(k) = layout.find(Block::BetaDisp, "(Intercept)") {
            let resid2: Vec<f64> = spec.y.iter().zip(&glm.mu).map(|(y, m)| (y - m).powi(2)).collect();
            let var = weighted_mean(&resid2, &spec.weights);
            phi[k] = var.max(1e-8).ln();
        }
    }
    debug!("Starting values: {:?}", phi);
    Ok(phi)
}

/// Result of an IRLS GLM fit.
#[derive(Debug, Clone)]
pub struct GlmFit {
    pub beta: Vec<f64>,
    pub mu: Vec<f64>,
    pub iterations: usize,
}

/// Fit a GLM by IRLS with the family's unit variance function.
///
/// Binomial-type families take `weights` as trials; for the others they
/// are prior weights. Non-finite updates stop the iteration at the last
/// finite estimate.
pub fn fit_glm_irls(
    y: &[f64],
    x: &DenseMatrix,
    offset: &[f64],
    weights: &[f64],
    family: Family,
    link: Link,
    max_iter: usize,
) -> FitResult<GlmFit> {
    let n = y.len();
    let p = x.ncols();

    let mut mu: Vec<f64> = y
        .iter()
        .zip(weights)
        .map(|(&yi, &wi)| initial_mu(family, yi, wi, y))
        .collect();
    let mut eta: Vec<f64> = mu.iter().map(|&m| link.link(m)).collect();
    let mut beta = vec![0.0; p];
    let mut iterations = 0;
    if p == 0 {
        return Ok(GlmFit { beta, mu, iterations });
    }

    for iter in 0..max_iter {
        iterations = iter + 1;
        let mut w = vec![0.0; n];
        let mut z = vec![0.0; n];
        for i in 0..n {
            let d = link.mu_eta(eta[i]);
            let v = unit_variance(family, mu[i]).max(1e-10);
            w[i] = weights[i] * d * d / v;
            z[i] = eta[i] - offset[i] + (y[i] - mu[i]) / if d.abs() > 1e-30 { d } else { 1e-30 };
        }

        // Weighted least squares: (X'WX)^{-1} X'Wz
        let xtwx = x.xtwx(&w);
        let xtwz = x.xtwv(&w, &z);
        let beta_new = match CholeskyDecomp::new(&xtwx) {
            Ok(chol) => chol.solve(&xtwz),
            Err(_) => CholeskyDecomp::new(&xtwx.shifted_diag(1e-6))?.solve(&xtwz),
        };
        if beta_new.iter().any(|b| !b.is_finite()) {
            break;
        }

        let eta_new: Vec<f64> = x
            .mat_vec(&beta_new)
            .iter()
            .zip(offset)
            .map(|(e, o)| e + o)
            .collect();
        let mu_new: Vec<f64> = eta_new.iter().map(|&e| link.inverse(e)).collect();
        if mu_new.iter().any(|m| !m.is_finite()) {
            break;
        }

        let change: f64 = beta_new.iter().zip(&beta).map(|(a, b)| (a - b).abs()).sum();
        beta = beta_new;
        eta = eta_new;
        mu = mu_new;
        if change < 1e-8 {
            break;
        }
    }
    Ok(GlmFit { beta, mu, iterations })
}

/// Starting mean for one observation, kept inside the family's mean domain.
fn initial_mu(family: Family, y: f64, w: f64, all: &[f64]) -> f64 {
    match family {
        Family::Gaussian => y,
        Family::Binomial | Family::BetaBinomial => (w * y + 0.5) / (w + 1.0),
        Family::Beta => y.clamp(0.01, 0.99),
        Family::Gamma => {
            if y > 0.0 {
                y
            } else {
                let mean = all.iter().sum::<f64>() / all.len() as f64;
                (0.1 * mean).max(1e-3)
            }
        }
        _ => y + 0.1,
    }
}

/// Variance function V(mu) without dispersion.
fn unit_variance(family: Family, mu: f64) -> f64 {
    match family {
        Family::Gaussian => 1.0,
        Family::Binomial | Family::BetaBinomial | Family::Beta => mu * (1.0 - mu),
        Family::Gamma => mu * mu,
        Family::Tweedie => mu.powf(1.5),
        _ => mu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glm_irls_gaussian_is_least_squares() {
        // y = 1 + 2x exactly
        let n = 50;
        let xs: Vec<f64> = (0..n).map(|i| i as f64 / n as f64).collect();
        let y: Vec<f64> = xs.iter().map(|x| 1.0 + 2.0 * x).collect();
        let x = DenseMatrix::from_columns(n, &[vec![1.0; n], xs]);
        let fit = fit_glm_irls(&y, &x, &vec![0.0; n], &vec![1.0; n], Family::Gaussian, Link::Identity, 25).unwrap();
        assert!((fit.beta[0] - 1.0).abs() < 1e-8, "intercept: {}", fit.beta[0]);
        assert!((fit.beta[1] - 2.0).abs() < 1e-8, "slope: {}", fit.beta[1]);
    }

    #[test]
    fn test_glm_irls_poisson_intercept_is_log_mean() {
        let y = vec![0.0, 1.0, 4.0, 2.0, 3.0, 2.0];
        let n = y.len();
        let x = DenseMatrix::from_columns(n, &[vec![1.0; n]]);
        let fit = fit_glm_irls(&y, &x, &vec![0.0; n], &vec![1.0; n], Family::Poisson, Link::Log, 25).unwrap();
        assert!((fit.beta[0] - 2.0f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_glm_irls_binomial_with_trials() {
        // Proportions 0.25 and 0.75 with 4 trials each.
        let y = vec![0.25, 0.75];
        let x = DenseMatrix::from_columns(2, &[vec![1.0, 1.0], vec![0.0, 1.0]]);
        let fit = fit_glm_irls(&y, &x, &[0.0, 0.0], &[4.0, 4.0], Family::Binomial, Link::Logit, 25).unwrap();
        assert!((fit.beta[0] - (1.0f64 / 3.0).ln()).abs() < 1e-6);
        assert!((fit.beta[1] - 9.0f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_gaussian_start_uses_residual_variance() {
        let spec = ModelSpec::builder()
            .response(vec![1.0, 3.0, 1.0, 3.0])
            .family(Family::Gaussian)
            .conditional(crate::model::spec::LinearPredictor::intercept(4))
            .build()
            .unwrap();
        let layout = spec.layout();
        let phi = start_values(&spec, &layout).unwrap();
        assert!((phi[0] - 2.0).abs() < 1e-8);
        assert!(phi[1].abs() < 1e-8);
    }
}
