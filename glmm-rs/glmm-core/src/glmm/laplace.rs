//! Laplace approximation of the marginal likelihood.
//!
//! For fixed outer parameters phi the random effects are integrated out
//! around the mode b* of the joint objective:
//!
//!   L(phi) = J(phi, b*) + log|H(phi, b*)| / 2,   H = d^2 J / db db'
//!
//! The mode is found by Levenberg-Marquardt damped Newton steps. The
//! gradient of L differentiates through b*(phi) implicitly:
//!
//!   dL/dphi = dJ/dphi + tr(H^-1 dH/dphi) / 2 - r' d^2J/(db dphi) / 2
//!
//! with `r = H^-1 s` and `s_j = tr(H^-1 dH/db_j)`. Per observation the
//! trace terms reduce to third-derivative contractions in the eta
//! coordinates; covariance-parameter terms collapse into one
//! [`CovarianceTrace`] per random-effect term.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use glmm_linalg::{CholeskyDecomp, DenseMatrix};

use super::covariance::CovarianceTrace;
use super::objective::{Eta, JointObjective, Precisions};
use crate::util::ad;
use crate::util::math::max_abs;

/// Configuration of the inner mode search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaplaceConfig {
    /// Maximum Newton iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the max-abs gradient in b.
    pub grad_tol: f64,
    /// Maximum damping increases within one Newton iteration.
    pub max_damping_steps: usize,
    /// Objective value reported when the mode search fails.
    pub failure_penalty: f64,
}

impl Default for LaplaceConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            grad_tol: 1e-8,
            max_damping_steps: 30,
            failure_penalty: 1e10,
        }
    }
}

/// Result of one Laplace evaluation.
#[derive(Debug, Clone)]
pub struct LaplaceEval {
    /// Penalized Laplace objective, or the failure penalty.
    pub value: f64,
    /// Prior penalty included in `value`.
    pub penalty: f64,
    /// Gradient of `value` (zeros on failure).
    pub gradient: Vec<f64>,
    /// Conditional modes.
    pub b: Vec<f64>,
    pub inner_iterations: usize,
    pub failed: bool,
}

/// Objective, gradient and Hessian in b at one point.
struct InnerState {
    value: f64,
    grad: Vec<f64>,
    hess: DenseMatrix,
}

pub struct Laplace<'a> {
    objective: JointObjective<'a>,
    config: LaplaceConfig,
    /// Warm start for the next mode search.
    b: Vec<f64>,
    pub failures: usize,
}

impl<'a> Laplace<'a> {
    pub fn new(objective: JointObjective<'a>, config: LaplaceConfig) -> Self {
        let b = vec![0.0; objective.n_b()];
        Laplace {
            objective,
            config,
            b,
            failures: 0,
        }
    }

    pub fn objective(&self) -> &JointObjective<'a> {
        &self.objective
    }

    /// Replace the warm start (e.g. with modes of an earlier fit).
    pub fn set_modes(&mut self, b: &[f64]) {
        if b.len() == self.b.len() {
            self.b.copy_from_slice(b);
        }
    }

    pub fn modes(&self) -> &[f64] {
        &self.b
    }

    fn failure(&mut self, phi: &[f64], iterations: usize) -> LaplaceEval {
        self.failures += 1;
        debug!("Inner mode search failed ({} failures so far)", self.failures);
        LaplaceEval {
            value: self.config.failure_penalty,
            penalty: 0.0,
            gradient: vec![0.0; phi.len()],
            b: self.b.clone(),
            inner_iterations: iterations,
            failed: true,
        }
    }

    /// Evaluate the Laplace objective at phi, with its exact gradient
    /// when `with_gradient` is set.
    pub fn evaluate(&mut self, phi: &[f64], with_gradient: bool) -> LaplaceEval {
        let obj = &self.objective;
        let fixed = obj.fixed_eta(phi);
        let penalty = obj.penalty_value(phi);

        if obj.n_b() == 0 {
            let etas = obj.eta(&fixed, &[]);
            let value = obj.data_nll(&etas) + penalty;
            if !value.is_finite() {
                return self.failure(phi, 0);
            }
            let gradient = if with_gradient {
                self.fixed_only_gradient(phi, &etas)
            } else {
                Vec::new()
            };
            return LaplaceEval {
                value,
                penalty,
                gradient,
                b: Vec::new(),
                inner_iterations: 0,
                failed: false,
            };
        }

        let Ok(precisions) = obj.precisions(phi) else {
            return self.failure(phi, 0);
        };
        let start = self.b.clone();
        let Some((b, iterations)) = self.find_mode(&fixed, &precisions, start) else {
            return self.failure(phi, self.config.max_iter);
        };
        let state = self.inner_state(&fixed, &b, &precisions);
        let Ok(chol) = CholeskyDecomp::new(&state.hess) else {
            return self.failure(phi, iterations);
        };
        let value = state.value + 0.5 * chol.log_det() + penalty;
        if !value.is_finite() {
            return self.failure(phi, iterations);
        }
        self.b.copy_from_slice(&b);

        let gradient = if with_gradient {
            self.laplace_gradient(phi, &fixed, &b, &chol)
        } else {
            Vec::new()
        };
        LaplaceEval {
            value,
            penalty,
            gradient,
            b,
            inner_iterations: iterations,
            failed: false,
        }
    }

    /// `J(phi, b)` without the penalty, its gradient and Hessian in b.
    fn inner_state(&self, fixed: &[Eta], b: &[f64], precisions: &Precisions) -> InnerState {
        let obj = &self.objective;
        let q = obj.n_b();
        let etas = obj.eta(fixed, b);
        let b_coords = obj.b_coords();
        let mut value = obj.re_nll(b, precisions);
        let mut grad = vec![0.0; q];
        let mut hess = DenseMatrix::zeros(q, q);

        for (i, eta) in etas.iter().enumerate() {
            let d = obj.obs_derivatives(i, eta, b_coords);
            value += d.value;
            for &ca in b_coords {
                let (cols_a, vals_a) = obj.b_row(i, ca);
                for (&j, &za) in cols_a.iter().zip(vals_a) {
                    grad[j] += d.grad[ca] * za;
                    for &cb in b_coords {
                        let dab = d.hess[ca][cb];
                        if dab == 0.0 {
                            continue;
                        }
                        let (cols_b, vals_b) = obj.b_row(i, cb);
                        for (&k, &zb) in cols_b.iter().zip(vals_b) {
                            hess.add_to(j, k, dab * za * zb);
                        }
                    }
                }
            }
        }

        for (re, (prec, _)) in obj.layout.re.iter().zip(precisions) {
            for l in 0..re.n_levels {
                let r = re.level_range(l);
                let u = &b[r.clone()];
                let pu = prec.mat_vec(u);
                for (a, ja) in r.clone().enumerate() {
                    grad[ja] += pu[a];
                    for (c, jc) in r.clone().enumerate() {
                        hess.add_to(ja, jc, prec.get(a, c));
                    }
                }
            }
        }
        InnerState { value, grad, hess }
    }

    /// Value of `J(phi, b)` without the penalty.
    fn inner_value(&self, fixed: &[Eta], b: &[f64], precisions: &Precisions) -> f64 {
        let obj = &self.objective;
        obj.data_nll(&obj.eta(fixed, b)) + obj.re_nll(b, precisions)
    }

    /// Damped Newton search for b*. `None` when it does not converge.
    fn find_mode(&self, fixed: &[Eta], precisions: &Precisions, mut b: Vec<f64>) -> Option<(Vec<f64>, usize)> {
        let mut lambda = 0.0_f64;
        for iter in 0..self.config.max_iter {
            let state = self.inner_state(fixed, &b, precisions);
            if !state.value.is_finite() {
                return None;
            }
            let gmax = max_abs(&state.grad);
            trace!("inner iter {}: J = {:.8}, |grad| = {:.3e}", iter, state.value, gmax);
            if gmax < self.config.grad_tol {
                return Some((b, iter));
            }

            let mut accepted = false;
            for _ in 0..self.config.max_damping_steps {
                if let Ok(chol) = CholeskyDecomp::new(&state.hess.shifted_diag(lambda)) {
                    let step = chol.solve(&state.grad);
                    let trial: Vec<f64> = b.iter().zip(&step).map(|(x, s)| x - s).collect();
                    let value = self.inner_value(fixed, &trial, precisions);
                    if value.is_finite() && value <= state.value + 1e-12 * (1.0 + state.value.abs()) {
                        b = trial;
                        lambda *= 0.3;
                        if lambda < 1e-10 {
                            lambda = 0.0;
                        }
                        accepted = true;
                        break;
                    }
                }
                lambda = (lambda * 10.0).max(1e-4);
            }
            if !accepted {
                return None;
            }
        }
        None
    }

    fn fixed_only_gradient(&self, phi: &[f64], etas: &[Eta]) -> Vec<f64> {
        let obj = &self.objective;
        let mut grad = obj.penalty_gradient(phi);
        for (i, eta) in etas.iter().enumerate() {
            let d = obj.obs_derivatives(i, eta, obj.coords());
            obj.scatter_outer(i, &d.grad, &mut grad);
        }
        grad
    }

    /// Exact gradient of the Laplace objective at the mode b.
    fn laplace_gradient(&self, phi: &[f64], fixed: &[Eta], b: &[f64], chol: &CholeskyDecomp) -> Vec<f64> {
        let obj = &self.objective;
        let q = obj.n_b();
        let s_inv = chol.inverse();
        let etas = obj.eta(fixed, b);
        let b_coords = obj.b_coords();

        // First pass: per-observation derivatives, third-order traces and
        // s = sum_i B_i' t_i.
        let mut derivs = Vec::with_capacity(etas.len());
        let mut traces = Vec::with_capacity(etas.len());
        let mut s = vec![0.0; q];
        for (i, eta) in etas.iter().enumerate() {
            let d = obj.obs_derivatives(i, eta, obj.coords());
            let mut v = [[0.0; 4]; 4];
            for &ca in b_coords {
                let (cols_a, vals_a) = obj.b_row(i, ca);
                for &cb in b_coords {
                    let (cols_b, vals_b) = obj.b_row(i, cb);
                    let mut acc = 0.0;
                    for (&j, &za) in cols_a.iter().zip(vals_a) {
                        for (&k, &zb) in cols_b.iter().zip(vals_b) {
                            acc += za * zb * s_inv.get(j, k);
                        }
                    }
                    v[ca][cb] = acc;
                }
            }
            let t = obj.obs_third(i, eta, &v);
            for &ca in b_coords {
                let (cols, vals) = obj.b_row(i, ca);
                for (&j, &z) in cols.iter().zip(vals) {
                    s[j] += z * t[ca];
                }
            }
            derivs.push(d);
            traces.push(t);
        }
        let r = chol.solve(&s);

        // Second pass: envelope, trace and implicit terms of the data.
        let mut grad = obj.penalty_gradient(phi);
        for (i, (d, t)) in derivs.iter().zip(&traces).enumerate() {
            let mut rho = [0.0; 4];
            for &ca in b_coords {
                let (cols, vals) = obj.b_row(i, ca);
                rho[ca] = cols.iter().zip(vals).map(|(&j, &z)| z * r[j]).sum();
            }
            let mut e = [0.0; 4];
            for c in 0..4 {
                let implicit: f64 = b_coords.iter().map(|&a| rho[a] * d.hess[a][c]).sum();
                e[c] = d.grad[c] + 0.5 * t[c] - 0.5 * implicit;
            }
            obj.scatter_outer(i, &e, &mut grad);
        }

        // Covariance parameters: K = (U + W - M) / 2 per term, with
        // U = sum u u', W = sum of diagonal blocks of H^-1, M = sum u r'.
        for re in &obj.layout.re {
            let d = re.dim;
            let mut k = vec![0.0; d * d];
            for l in 0..re.n_levels {
                let range = re.level_range(l);
                let u = &b[range.clone()];
                let rl = &r[range.clone()];
                for a in 0..d {
                    for c in 0..d {
                        let w = s_inv.get(range.start + a, range.start + c);
                        k[a * d + c] += 0.5 * (u[a] * u[c] + w - u[a] * rl[c]);
                    }
                }
            }
            let f = CovarianceTrace {
                structure: re.structure,
                dim: d,
                k: &k,
                scale_trace: 1.0,
                scale_logdet: 0.5 * re.n_levels as f64,
            };
            let (_, g) = ad::gradient(&f, &phi[re.theta_range()]);
            for (gi, idx) in g.iter().zip(re.theta_range()) {
                grad[idx] += gi;
            }
        }
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glmm::family::Family;
    use crate::model::spec::{LinearPredictor, ModelSpec, ReTerm};

    fn grouped_spec(family: Family, y: Vec<f64>, zi: bool) -> ModelSpec {
        let n = y.len();
        let groups: Vec<String> = (0..n).map(|i| format!("g{}", i % 4)).collect();
        let x1: Vec<f64> = (0..n).map(|i| ((i * 7) % 5) as f64 / 4.0 - 0.5).collect();
        let x = DenseMatrix::from_columns(n, &[vec![1.0; n], x1]);
        let cond = LinearPredictor::new(x, vec!["(Intercept)".into(), "x".into()])
            .with_re_term(ReTerm::intercept("g", &groups));
        let mut builder = ModelSpec::builder().response(y).family(family).conditional(cond);
        if zi {
            builder = builder.zero_inflation(LinearPredictor::intercept(n));
        }
        builder.build().unwrap()
    }

    fn fd_gradient(laplace: &mut Laplace, phi: &[f64]) -> Vec<f64> {
        let h = 1e-5;
        (0..phi.len())
            .map(|k| {
                let mut up = phi.to_vec();
                up[k] += h;
                let mut dn = phi.to_vec();
                dn[k] -= h;
                (laplace.evaluate(&up, false).value - laplace.evaluate(&dn, false).value) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_gaussian_laplace_is_exact_marginal() {
        // y = mu + b_g + e: the marginal is multivariate normal.
        let y = vec![1.2, 0.4, 2.2, 1.9, 0.8, 1.1, 2.5, 1.4];
        let spec = grouped_spec(Family::Gaussian, y.clone(), false);
        let obj = JointObjective::new(&spec).unwrap();
        let mut laplace = Laplace::new(obj, LaplaceConfig::default());
        let (beta0, beta1, log_sigma2, log_tau): (f64, f64, f64, f64) = (1.0, 0.3, -0.4, -0.2);
        let eval = laplace.evaluate(&[beta0, beta1, log_sigma2, log_tau], false);
        assert!(!eval.failed);

        let sigma2 = log_sigma2.exp();
        let tau2 = (2.0 * log_tau).exp();
        let n = y.len();
        let mut v = DenseMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                let mut c = if i % 4 == j % 4 { tau2 } else { 0.0 };
                if i == j {
                    c += sigma2;
                }
                v.set(i, j, c);
            }
        }
        let resid: Vec<f64> = (0..n)
            .map(|i| y[i] - beta0 - beta1 * spec.cond.x.get(i, 1))
            .collect();
        let chol = CholeskyDecomp::new(&v).unwrap();
        let quad = DenseMatrix::dot(&resid, &chol.solve(&resid));
        let exact = 0.5 * quad + 0.5 * chol.log_det() + 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();
        assert!((eval.value - exact).abs() < 1e-6, "{} vs {}", eval.value, exact);
    }

    #[test]
    fn test_gradient_matches_finite_differences_poisson() {
        let y = vec![0.0, 3.0, 1.0, 5.0, 2.0, 0.0, 4.0, 1.0, 2.0, 6.0, 0.0, 1.0];
        let spec = grouped_spec(Family::Poisson, y, false);
        let obj = JointObjective::new(&spec).unwrap();
        let mut laplace = Laplace::new(obj, LaplaceConfig::default());
        let phi = vec![0.4, 0.5, -0.3];
        let eval = laplace.evaluate(&phi, true);
        let fd = fd_gradient(&mut laplace, &phi);
        for (a, b) in eval.gradient.iter().zip(&fd) {
            assert!((a - b).abs() < 1e-5 * (1.0 + b.abs()), "{:?} vs {:?}", eval.gradient, fd);
        }
    }

    #[test]
    fn test_gradient_matches_finite_differences_zero_inflated_nbinom() {
        let y = vec![0.0, 3.0, 0.0, 5.0, 2.0, 0.0, 4.0, 0.0, 2.0, 6.0, 0.0, 1.0];
        let spec = grouped_spec(Family::NBinom2, y, true);
        let obj = JointObjective::new(&spec).unwrap();
        let mut laplace = Laplace::new(obj, LaplaceConfig::default());
        // beta(2) | beta_zi | beta_disp | theta
        let phi = vec![0.8, 0.2, -1.0, 0.5, -0.6];
        let eval = laplace.evaluate(&phi, true);
        assert!(!eval.failed);
        let fd = fd_gradient(&mut laplace, &phi);
        for (a, b) in eval.gradient.iter().zip(&fd) {
            assert!((a - b).abs() < 1e-5 * (1.0 + b.abs()), "{:?} vs {:?}", eval.gradient, fd);
        }
    }

    #[test]
    fn test_failed_mode_search_returns_penalty() {
        let y = vec![0.0, 3.0, 1.0, 5.0, 2.0, 0.0, 4.0, 1.0];
        let spec = grouped_spec(Family::Poisson, y, false);
        let obj = JointObjective::new(&spec).unwrap();
        let config = LaplaceConfig {
            max_iter: 1,
            ..LaplaceConfig::default()
        };
        let mut laplace = Laplace::new(obj, config);
        let eval = laplace.evaluate(&[0.5, 0.0, 0.0], true);
        assert!(eval.failed);
        assert_eq!(eval.value, 1e10);
        assert!(eval.gradient.iter().all(|g| *g == 0.0));
        assert_eq!(laplace.failures, 1);
    }
}
