//! Fitting entry points.
//!
//! `fit` validates the ModelSpec, picks starting values, minimizes the Laplace
//! objective, estimates the outer Hessian and freezes everything into a
//! [`FittedModel`]. Numerical trouble ends up as [`FitWarning`]s on the
//! result; only malformed input is an error.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use glmm_linalg::decomposition::{inverse_spd, symmetric_eigenvalues};

use super::laplace::{Laplace, LaplaceConfig};
use super::objective::JointObjective;
use super::outer::{fd_hessian, minimize};
use super::start::start_values;
use crate::error::FitResult;
use crate::model::fitted::{FitStatistics, FitWarning, FittedModel};
use crate::model::parameters::ParameterVector;
use crate::model::spec::ModelSpec;
use crate::util::math::max_abs;

/// Gradient max-abs above which a converged fit is still flagged.
const LARGE_GRADIENT: f64 = 1e-3;

/// Line search used by L-BFGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineSearch {
    MoreThuente,
    HagerZhang,
}

impl LineSearch {
    pub fn parse(name: &str) -> Option<LineSearch> {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "morethuente" => Some(LineSearch::MoreThuente),
            "hagerzhang" => Some(LineSearch::HagerZhang),
            _ => None,
        }
    }
}

/// Outer optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerChoice {
    Lbfgs { memory: usize, line_search: LineSearch },
}

/// Fit options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitControl {
    /// Maximum outer iterations.
    pub max_outer_iter: usize,
    /// Outer gradient tolerance.
    pub grad_tol: f64,
    /// Optional tolerance on the change in objective between iterations.
    pub cost_tol: Option<f64>,
    pub optimizer: OptimizerChoice,
    /// Inner (Laplace mode search) settings.
    pub inner: LaplaceConfig,
    /// Relative step of the finite-difference outer Hessian.
    pub hessian_step: f64,
    /// Whether to compute the outer Hessian and standard errors.
    pub compute_se: bool,
}

impl Default for FitControl {
    fn default() -> Self {
        Self {
            max_outer_iter: 300,
            grad_tol: 1e-6,
            cost_tol: None,
            optimizer: OptimizerChoice::Lbfgs {
                memory: 10,
                line_search: LineSearch::MoreThuente,
            },
            inner: LaplaceConfig::default(),
            hessian_step: 1e-4,
            compute_se: true,
        }
    }
}

/// Fit `spec` from heuristic starting values.
pub fn fit(spec: &ModelSpec, control: &FitControl) -> FitResult<FittedModel> {
    fit_with_start(spec, control, None)
}

/// Fit `spec`, starting from `start` for every parameter whose block and
/// name it shares with the new layout.
pub fn fit_with_start(
    spec: &ModelSpec,
    control: &FitControl,
    start: Option<&ParameterVector>,
) -> FitResult<FittedModel> {
    spec.validate()?;
    let layout = spec.layout();
    let mut phi0 = start_values(spec, &layout)?;
    if let Some(previous) = start {
        let mut warm = ParameterVector::new(layout.clone(), phi0);
        let matched = warm.warm_start_from(previous);
        info!("Warm start: {} of {} parameters taken from the previous fit", matched, layout.len());
        phi0 = warm.values;
    }

    info!(
        "Fitting {} ({} link) model: n = {}, {} outer parameters, {} random effects",
        spec.family.name(),
        spec.link.name(),
        spec.nobs(),
        layout.len(),
        layout.n_b
    );

    let objective = JointObjective::new(spec)?;
    let laplace = Laplace::new(objective, control.inner.clone());
    let (outcome, mut laplace) = minimize(laplace, phi0, control)?;

    let (hessian, covariance) = if control.compute_se {
        match fd_hessian(&mut laplace, &outcome.phi, control.hessian_step) {
            Some(h) => {
                let cov = inverse_spd(&h)
                    .ok()
                    .filter(|c| c.diag().iter().all(|v| v.is_finite() && *v > 0.0));
                if cov.is_none() {
                    if let Some(min) = symmetric_eigenvalues(&h).ok().and_then(|ev| ev.last().copied()) {
                        debug!("Outer Hessian smallest eigenvalue: {:.3e}", min);
                    }
                }
                (Some(h), cov)
            }
            None => (None, None),
        }
    } else {
        (None, None)
    };

    let max_grad = max_abs(&outcome.eval.gradient);
    let mut warnings = Vec::new();
    if !outcome.converged {
        warnings.push(FitWarning::OuterNotConverged);
    }
    if control.compute_se && covariance.is_none() {
        warnings.push(FitWarning::NonPositiveDefiniteHessian);
    }
    if outcome.inner_failures > 0 {
        warnings.push(FitWarning::InnerFailures(outcome.inner_failures));
    }
    for re in &layout.re {
        if re.structure.is_near_singular(re.dim, &outcome.phi[re.theta_range()]) {
            warnings.push(FitWarning::SingularCovariance {
                term: re.label.clone(),
            });
        }
    }
    if outcome.converged && max_grad > LARGE_GRADIENT {
        warnings.push(FitWarning::LargeGradient);
    }
    for w in &warnings {
        warn!("{}", w);
    }

    let stats = FitStatistics {
        objective: outcome.eval.value,
        penalty: outcome.eval.penalty,
        max_grad,
        iterations: outcome.iterations,
        evaluations: outcome.evaluations,
        converged: outcome.converged,
    };
    let model = FittedModel::new(
        spec.clone(),
        ParameterVector::new(layout, outcome.phi),
        outcome.eval.b,
        hessian,
        covariance,
        stats,
        warnings,
    );
    info!(
        "Fit finished after {} iterations: logLik = {:.4}, AIC = {:.4}{}",
        model.iterations,
        model.log_lik,
        model.aic,
        if model.converged { "" } else { " (not converged)" }
    );
    Ok(model)
}

/// Fit independent models in parallel. Results are sorted by AIC
/// (ascending); failed fits come last.
pub fn fit_many(models: &[(&str, ModelSpec)], control: &FitControl) -> Vec<(String, FitResult<FittedModel>)> {
    let mut results: Vec<(String, FitResult<FittedModel>)> = models
        .par_iter()
        .map(|(name, spec)| (name.to_string(), fit(spec, control)))
        .collect();
    results.sort_by(|a, b| {
        let key = |r: &FitResult<FittedModel>| r.as_ref().map_or(f64::INFINITY, |m| m.aic);
        key(&a.1).total_cmp(&key(&b.1))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::family::Family;
    use crate::model::spec::LinearPredictor;
    use glmm_linalg::DenseMatrix;

    #[test]
    fn test_gaussian_fixed_effects_match_least_squares() {
        let n = 10;
        let x1: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let y: Vec<f64> = x1
            .iter()
            .enumerate()
            .map(|(i, x)| 0.5 + 1.5 * x + if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        let x = DenseMatrix::from_columns(n, &[vec![1.0; n], x1.clone()]);
        let spec = ModelSpec::builder()
            .response(y.clone())
            .family(Family::Gaussian)
            .conditional(LinearPredictor::new(x, vec!["(Intercept)".into(), "x".into()]))
            .build()
            .unwrap();
        let model = fit(&spec, &FitControl::default()).unwrap();
        assert!(model.converged);

        let xm = x1.iter().sum::<f64>() / n as f64;
        let ym = y.iter().sum::<f64>() / n as f64;
        let sxy: f64 = x1.iter().zip(&y).map(|(a, b)| (a - xm) * (b - ym)).sum();
        let sxx: f64 = x1.iter().map(|a| (a - xm).powi(2)).sum();
        let slope = sxy / sxx;
        let intercept = ym - slope * xm;
        let beta = model.parameters.block(crate::model::parameters::Block::Beta);
        assert!((beta[0] - intercept).abs() < 1e-4, "{} vs {}", beta[0], intercept);
        assert!((beta[1] - slope).abs() < 1e-5, "{} vs {}", beta[1], slope);
    }

    #[test]
    fn test_line_search_parse() {
        assert_eq!(LineSearch::parse("more-thuente"), Some(LineSearch::MoreThuente));
        assert_eq!(LineSearch::parse("HagerZhang"), Some(LineSearch::HagerZhang));
        assert_eq!(LineSearch::parse("armijo"), None);
    }

    #[test]
    fn test_fit_many_sorts_by_aic() {
        let y = vec![0.0, 1.0, 3.0, 2.0, 5.0, 4.0, 7.0, 6.0];
        let n = y.len();
        let x1: Vec<f64> = (0..n).map(|i| i as f64 / 4.0).collect();
        let with_x = ModelSpec::builder()
            .response(y.clone())
            .family(Family::Poisson)
            .conditional(LinearPredictor::new(
                DenseMatrix::from_columns(n, &[vec![1.0; n], x1]),
                vec!["(Intercept)".into(), "x".into()],
            ))
            .build()
            .unwrap();
        let null = ModelSpec::builder()
            .response(y)
            .family(Family::Poisson)
            .conditional(LinearPredictor::intercept(n))
            .build()
            .unwrap();
        let results = fit_many(&[("null", null), ("trend", with_x)], &FitControl::default());
        assert_eq!(results[0].0, "trend");
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
