//! Random-effect covariance structures.
//!
//! Each structure maps an unconstrained parameter vector theta to a
//! symmetric positive-definite d x d covariance matrix, for every real
//! theta. Matrices are small (d is the number of columns of one
//! random-effect term), so they are handled as row-major `Vec<T>` and the
//! maps stay generic over [`Real`] for differentiation.
//!
//! | structure | params | map |
//! |---|---|---|
//! | `us` | d(d+1)/2 | log-Cholesky: theta[0..d] log diagonal, rest strictly lower, column-major |
//! | `diag` | d | diag(exp(2 theta)) |
//! | `homdiag` | 1 | exp(2 theta) I |
//! | `cs` | d + 1 (d = 1: 1) | sds exp(theta_j), common correlation from theta_d |
//! | `ar1` | 2 (d = 1: 1) | sd exp(theta_0), rho = theta_1 / sqrt(1 + theta_1^2) |

use serde::{Deserialize, Serialize};

use glmm_linalg::{CholeskyDecomp, DenseMatrix, LinalgError};

use crate::util::ad::{Real, ScalarFn};
use crate::util::math::logistic;

/// Standard deviations below this, or correlations beyond it in absolute
/// value, flag a term as near-singular.
const SINGULAR_SD: f64 = 1e-4;
const SINGULAR_CORR: f64 = 0.9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CovStructure {
    Unstructured,
    Diagonal,
    HomDiagonal,
    CompoundSymmetry,
    Ar1,
}

impl CovStructure {
    pub fn name(self) -> &'static str {
        match self {
            CovStructure::Unstructured => "us",
            CovStructure::Diagonal => "diag",
            CovStructure::HomDiagonal => "homdiag",
            CovStructure::CompoundSymmetry => "cs",
            CovStructure::Ar1 => "ar1",
        }
    }

    pub fn parse(name: &str) -> Option<CovStructure> {
        match name.trim() {
            "us" => Some(CovStructure::Unstructured),
            "diag" => Some(CovStructure::Diagonal),
            "homdiag" => Some(CovStructure::HomDiagonal),
            "cs" => Some(CovStructure::CompoundSymmetry),
            "ar1" => Some(CovStructure::Ar1),
            _ => None,
        }
    }

    /// Length of theta for a d-dimensional term.
    pub fn n_params(self, d: usize) -> usize {
        match self {
            CovStructure::Unstructured => d * (d + 1) / 2,
            CovStructure::Diagonal => d,
            CovStructure::HomDiagonal => 1,
            CovStructure::CompoundSymmetry => {
                if d > 1 {
                    d + 1
                } else {
                    1
                }
            }
            CovStructure::Ar1 => {
                if d > 1 {
                    2
                } else {
                    1
                }
            }
        }
    }

    /// Whether the structure has free correlation parameters.
    pub fn has_correlation(self, d: usize) -> bool {
        d > 1
            && matches!(
                self,
                CovStructure::Unstructured | CovStructure::CompoundSymmetry | CovStructure::Ar1
            )
    }

    /// Covariance matrix (row-major d x d) implied by theta.
    pub fn covariance<T: Real>(self, d: usize, theta: &[T]) -> Vec<T> {
        debug_assert_eq!(theta.len(), self.n_params(d));
        let mut sigma = vec![T::zero(); d * d];
        match self {
            CovStructure::Unstructured => {
                let l = log_cholesky_factor(d, theta);
                for i in 0..d {
                    for j in 0..=i {
                        let mut s = T::zero();
                        for k in 0..=j {
                            s += l[i * d + k] * l[j * d + k];
                        }
                        sigma[i * d + j] = s;
                        sigma[j * d + i] = s;
                    }
                }
            }
            CovStructure::Diagonal => {
                for j in 0..d {
                    sigma[j * d + j] = (T::cst(2.0) * theta[j]).exp();
                }
            }
            CovStructure::HomDiagonal => {
                let v = (T::cst(2.0) * theta[0]).exp();
                for j in 0..d {
                    sigma[j * d + j] = v;
                }
            }
            CovStructure::CompoundSymmetry => {
                let rho = if d > 1 {
                    cs_correlation(d, theta[d])
                } else {
                    T::zero()
                };
                for i in 0..d {
                    for j in 0..d {
                        let s = (theta[i] + theta[j]).exp();
                        sigma[i * d + j] = if i == j { s } else { rho * s };
                    }
                }
            }
            CovStructure::Ar1 => {
                let var = (T::cst(2.0) * theta[0]).exp();
                let rho = if d > 1 {
                    theta[1] / (T::one() + theta[1] * theta[1]).sqrt()
                } else {
                    T::zero()
                };
                for i in 0..d {
                    for j in 0..d {
                        let lag = i.abs_diff(j) as i32;
                        sigma[i * d + j] = var * rho.powi(lag);
                    }
                }
            }
        }
        sigma
    }

    /// Standard deviations and correlation matrix (row-major) implied by theta.
    pub fn sd_and_correlation<T: Real>(self, d: usize, theta: &[T]) -> (Vec<T>, Vec<T>) {
        let sigma = self.covariance(d, theta);
        let sds: Vec<T> = (0..d).map(|j| sigma[j * d + j].sqrt()).collect();
        let mut corr = vec![T::zero(); d * d];
        for i in 0..d {
            for j in 0..d {
                corr[i * d + j] = if i == j {
                    T::one()
                } else {
                    sigma[i * d + j] / (sds[i] * sds[j])
                };
            }
        }
        (sds, corr)
    }

    /// Inverse covariance (row-major) and log-determinant of the covariance.
    /// `None` when the implied matrix is numerically singular.
    pub fn precision_and_logdet<T: Real>(self, d: usize, theta: &[T]) -> Option<(Vec<T>, T)> {
        let sigma = self.covariance(d, theta);
        let l = match self {
            CovStructure::Unstructured => log_cholesky_factor(d, theta),
            _ => cholesky(d, &sigma)?,
        };
        let mut logdet = T::zero();
        for j in 0..d {
            logdet += T::cst(2.0) * l[j * d + j].ln();
        }
        Some((cholesky_inverse(d, &l), logdet))
    }

    /// f64 precision matrix and log-determinant via the linalg Cholesky.
    pub fn precision_matrix(self, d: usize, theta: &[f64]) -> Result<(DenseMatrix, f64), LinalgError> {
        let sigma = DenseMatrix::from_row_major(d, d, &self.covariance(d, theta));
        let chol = CholeskyDecomp::new(&sigma)?;
        Ok((chol.inverse(), chol.log_det()))
    }

    /// Lower factor L with covariance L L', used to draw new levels.
    /// Built from theta without forming the covariance, so a variance
    /// that underflows to zero gives a zero row instead of an error.
    pub fn cholesky_factor(self, d: usize, theta: &[f64]) -> Result<DenseMatrix, LinalgError> {
        if self == CovStructure::Unstructured {
            return Ok(DenseMatrix::from_row_major(d, d, &log_cholesky_factor(d, theta)));
        }
        let n_sd = self.n_log_sd(d);
        let mut unit = theta.to_vec();
        unit[..n_sd].fill(0.0);
        let corr = CholeskyDecomp::new(&DenseMatrix::from_row_major(d, d, &self.covariance(d, &unit)))?;
        let sd = |i: usize| theta[if n_sd == 1 { 0 } else { i }].exp();
        Ok(DenseMatrix::from_fn(d, d, |i, j| if j <= i { sd(i) * corr.l.get(i, j) } else { 0.0 }))
    }

    /// Number of leading theta entries that are log standard deviations.
    fn n_log_sd(self, d: usize) -> usize {
        match self {
            CovStructure::Unstructured | CovStructure::Diagonal | CovStructure::CompoundSymmetry => d,
            CovStructure::HomDiagonal | CovStructure::Ar1 => 1,
        }
    }

    /// Parameters whose covariance best matches `sigma` (row-major). Exact
    /// for `us`; the reduced structures project onto their family (mean
    /// variance for homdiag, mean correlation for cs, mean lag-1
    /// correlation for ar1).
    pub fn from_covariance(self, d: usize, sigma: &[f64]) -> Result<Vec<f64>, LinalgError> {
        let sd: Vec<f64> = (0..d).map(|j| sigma[j * d + j].sqrt()).collect();
        let corr = |i: usize, j: usize| sigma[i * d + j] / (sd[i] * sd[j]);
        let theta = match self {
            CovStructure::Unstructured => {
                let chol = CholeskyDecomp::new(&DenseMatrix::from_row_major(d, d, sigma))?;
                let mut theta: Vec<f64> = (0..d).map(|j| chol.l.get(j, j).ln()).collect();
                for j in 0..d {
                    for i in (j + 1)..d {
                        theta.push(chol.l.get(i, j));
                    }
                }
                theta
            }
            CovStructure::Diagonal => sd.iter().map(|s| s.ln()).collect(),
            CovStructure::HomDiagonal => {
                let mean_var = (0..d).map(|j| sigma[j * d + j]).sum::<f64>() / d as f64;
                vec![0.5 * mean_var.ln()]
            }
            CovStructure::CompoundSymmetry => {
                let mut theta: Vec<f64> = sd.iter().map(|s| s.ln()).collect();
                if d > 1 {
                    let mut total = 0.0;
                    for i in 0..d {
                        for j in 0..i {
                            total += corr(i, j);
                        }
                    }
                    let rho = total / (d * (d - 1) / 2) as f64;
                    let lower = -1.0 / (d as f64 - 1.0);
                    let s = ((rho - lower) / (1.0 - lower)).clamp(1e-8, 1.0 - 1e-8);
                    theta.push((s / (1.0 - s)).ln());
                }
                theta
            }
            CovStructure::Ar1 => {
                let mean_var = (0..d).map(|j| sigma[j * d + j]).sum::<f64>() / d as f64;
                let mut theta = vec![0.5 * mean_var.ln()];
                if d > 1 {
                    let rho = ((0..d - 1).map(|j| corr(j + 1, j)).sum::<f64>() / (d - 1) as f64)
                        .clamp(-0.999_999, 0.999_999);
                    theta.push(rho / (1.0 - rho * rho).sqrt());
                }
                theta
            }
        };
        Ok(theta)
    }

    /// Names of the theta entries, e.g. `sd.(Intercept)|site` or
    /// `chol.2.1|site`.
    pub fn param_names(self, columns: &[String], group: &str) -> Vec<String> {
        let d = columns.len();
        let sd = |c: &str| format!("sd.{}|{}", c, group);
        match self {
            CovStructure::Unstructured => {
                let mut names: Vec<String> = columns.iter().map(|c| sd(c)).collect();
                for j in 0..d {
                    for i in (j + 1)..d {
                        names.push(format!("chol.{}.{}|{}", i + 1, j + 1, group));
                    }
                }
                names
            }
            CovStructure::Diagonal => columns.iter().map(|c| sd(c)).collect(),
            CovStructure::HomDiagonal => vec![format!("sd|{}", group)],
            CovStructure::CompoundSymmetry => {
                let mut names: Vec<String> = columns.iter().map(|c| sd(c)).collect();
                if d > 1 {
                    names.push(format!("rho|{}", group));
                }
                names
            }
            CovStructure::Ar1 => {
                let mut names = vec![format!("sd|{}", group)];
                if d > 1 {
                    names.push(format!("rho|{}", group));
                }
                names
            }
        }
    }

    /// Whether theta sits at a near-singular covariance (a variance
    /// collapsing to zero or a correlation reaching +-1).
    pub fn is_near_singular(self, d: usize, theta: &[f64]) -> bool {
        let (sds, corr) = self.sd_and_correlation(d, theta);
        let max_sd = sds.iter().cloned().fold(0.0_f64, f64::max);
        if sds.iter().any(|&s| !(s > SINGULAR_SD * max_sd.max(1.0))) {
            return true;
        }
        (0..d).any(|i| (0..i).any(|j| corr[i * d + j].abs() > SINGULAR_CORR))
    }
}

fn cs_correlation<T: Real>(d: usize, raw: T) -> T {
    let lower = -1.0 / (d as f64 - 1.0);
    T::cst(lower) + T::cst(1.0 - lower) * logistic(raw)
}

/// Lower-triangular factor of the `us` parameterization (row-major).
fn log_cholesky_factor<T: Real>(d: usize, theta: &[T]) -> Vec<T> {
    let mut l = vec![T::zero(); d * d];
    for j in 0..d {
        l[j * d + j] = theta[j].exp();
    }
    let mut k = d;
    for j in 0..d {
        for i in (j + 1)..d {
            l[i * d + j] = theta[k];
            k += 1;
        }
    }
    l
}

/// Generic Cholesky of a small SPD matrix (row-major, lower factor).
fn cholesky<T: Real>(d: usize, a: &[T]) -> Option<Vec<T>> {
    let mut l = vec![T::zero(); d * d];
    for j in 0..d {
        let mut diag = a[j * d + j];
        for k in 0..j {
            diag -= l[j * d + k] * l[j * d + k];
        }
        if !(diag.re() > 0.0) {
            return None;
        }
        let ljj = diag.sqrt();
        l[j * d + j] = ljj;
        for i in (j + 1)..d {
            let mut s = a[i * d + j];
            for k in 0..j {
                s -= l[i * d + k] * l[j * d + k];
            }
            l[i * d + j] = s / ljj;
        }
    }
    Some(l)
}

/// (L L')^{-1} from the lower factor L.
fn cholesky_inverse<T: Real>(d: usize, l: &[T]) -> Vec<T> {
    // Invert L by forward substitution, then form L^{-T} L^{-1}.
    let mut linv = vec![T::zero(); d * d];
    for j in 0..d {
        linv[j * d + j] = l[j * d + j].recip();
        for i in (j + 1)..d {
            let mut s = T::zero();
            for k in j..i {
                s -= l[i * d + k] * linv[k * d + j];
            }
            linv[i * d + j] = s / l[i * d + i];
        }
    }
    let mut inv = vec![T::zero(); d * d];
    for i in 0..d {
        for j in 0..=i {
            let mut s = T::zero();
            for k in i..d {
                s += linv[k * d + i] * linv[k * d + j];
            }
            inv[i * d + j] = s;
            inv[j * d + i] = s;
        }
    }
    inv
}

/// `scale_trace * tr(Sigma(theta)^{-1} K) + scale_logdet * log|Sigma(theta)|`
/// as a function of theta, with `K` fixed (row-major d x d).
///
/// Every covariance-parameter derivative the fitter needs has this form:
/// the random-effect density summed over levels (`K = sum_l u_l u_l'`),
/// the trace correction of the log-determinant, and the implicit term of
/// the outer gradient.
pub struct CovarianceTrace<'a> {
    pub structure: CovStructure,
    pub dim: usize,
    pub k: &'a [f64],
    pub scale_trace: f64,
    pub scale_logdet: f64,
}

impl ScalarFn for CovarianceTrace<'_> {
    fn eval<T: Real>(&self, theta: &[T]) -> T {
        let d = self.dim;
        let Some((prec, logdet)) = self.structure.precision_and_logdet(d, theta) else {
            return T::cst(f64::NAN);
        };
        let mut tr = T::zero();
        for i in 0..d {
            for j in 0..d {
                let kij = self.k[j * d + i];
                if kij != 0.0 {
                    tr += prec[i * d + j] * T::cst(kij);
                }
            }
        }
        T::cst(self.scale_trace) * tr + T::cst(self.scale_logdet) * logdet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ad;

    const ALL: [CovStructure; 5] = [
        CovStructure::Unstructured,
        CovStructure::Diagonal,
        CovStructure::HomDiagonal,
        CovStructure::CompoundSymmetry,
        CovStructure::Ar1,
    ];

    #[test]
    fn test_us_round_trip() {
        let sigma = [4.0, 1.2, -0.4, 1.2, 2.0, 0.3, -0.4, 0.3, 1.5];
        let theta = CovStructure::Unstructured.from_covariance(3, &sigma).unwrap();
        assert_eq!(theta.len(), 6);
        let back = CovStructure::Unstructured.covariance(3, &theta);
        for (a, b) in sigma.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_extreme_theta_is_positive_definite() {
        for s in ALL {
            let d = 3;
            let theta: Vec<f64> = (0..s.n_params(d)).map(|k| if k % 2 == 0 { 4.0 } else { -6.0 }).collect();
            assert!(s.precision_and_logdet(d, &theta).is_some(), "{}", s.name());
            assert!(s.precision_matrix(d, &theta).is_ok(), "{}", s.name());
        }
    }

    #[test]
    fn test_precision_is_inverse() {
        let theta = [0.2, -0.1, 0.5, 0.4, -0.3, 0.1];
        let d = 3;
        let sigma = CovStructure::Unstructured.covariance(d, &theta);
        let (prec, logdet) = CovStructure::Unstructured.precision_and_logdet(d, &theta).unwrap();
        for i in 0..d {
            for j in 0..d {
                let v: f64 = (0..d).map(|k| sigma[i * d + k] * prec[k * d + j]).sum();
                let target = if i == j { 1.0 } else { 0.0 };
                assert!((v - target).abs() < 1e-10);
            }
        }
        let (_, logdet_ref) = CovStructure::Unstructured.precision_matrix(d, &theta).unwrap();
        assert!((logdet - logdet_ref).abs() < 1e-10);
    }

    #[test]
    fn test_cholesky_factor_reproduces_covariance() {
        for s in ALL {
            let d = 3;
            let theta: Vec<f64> = (0..s.n_params(d)).map(|k| 0.3 - 0.25 * k as f64).collect();
            let l = s.cholesky_factor(d, &theta).unwrap();
            let sigma = s.covariance(d, &theta);
            for i in 0..d {
                for j in 0..d {
                    let v: f64 = (0..d).map(|k| l.get(i, k) * l.get(j, k)).sum();
                    assert!((v - sigma[i * d + j]).abs() < 1e-12, "{} ({}, {})", s.name(), i, j);
                }
            }
        }
    }

    #[test]
    fn test_cholesky_factor_with_collapsed_variance() {
        for s in ALL {
            let d = 2;
            let theta: Vec<f64> = (0..s.n_params(d))
                .map(|k| if k < s.n_log_sd(d) { -400.0 } else { 0.3 })
                .collect();
            let l = s.cholesky_factor(d, &theta).unwrap();
            assert!(l.diag().iter().all(|v| v.is_finite() && *v >= 0.0), "{}", s.name());
        }
    }

    #[test]
    fn test_cs_and_ar1_correlations() {
        let (_, corr) = CovStructure::CompoundSymmetry.sd_and_correlation(3, &[0.0_f64, 0.0, 0.0, 0.0]);
        // logistic(0) = 0.5 on (-1/2, 1) gives 0.25
        assert!((corr[1] - 0.25).abs() < 1e-12);
        let (_, corr) = CovStructure::Ar1.sd_and_correlation(3, &[0.0_f64, 1.0]);
        let rho = 1.0 / 2.0_f64.sqrt();
        assert!((corr[1] - rho).abs() < 1e-12);
        assert!((corr[2] - rho * rho).abs() < 1e-12);
    }

    #[test]
    fn test_reduced_structure_round_trips() {
        for s in [CovStructure::Diagonal, CovStructure::CompoundSymmetry, CovStructure::Ar1] {
            let theta: Vec<f64> = (0..s.n_params(3)).map(|k| 0.1 * k as f64 - 0.2).collect();
            let sigma = s.covariance(3, &theta);
            let back = s.from_covariance(3, &sigma).unwrap();
            for (a, b) in theta.iter().zip(back.iter()) {
                assert!((a - b).abs() < 1e-8, "{}: {:?} vs {:?}", s.name(), theta, back);
            }
        }
    }

    #[test]
    fn test_trace_gradient_matches_finite_difference() {
        let k = [2.0, 0.5, 0.5, 1.0];
        let f = CovarianceTrace {
            structure: CovStructure::Unstructured,
            dim: 2,
            k: &k,
            scale_trace: 0.5,
            scale_logdet: 3.0,
        };
        let theta = [0.3, -0.2, 0.4];
        let (_, g) = ad::gradient(&f, &theta);
        let h = 1e-6;
        for i in 0..3 {
            let mut tp = theta;
            let mut tm = theta;
            tp[i] += h;
            tm[i] -= h;
            let fd = (ad::value(&f, &tp) - ad::value(&f, &tm)) / (2.0 * h);
            assert!((g[i] - fd).abs() < 1e-6, "coord {}: {} vs {}", i, g[i], fd);
        }
    }

    #[test]
    fn test_param_names() {
        let cols = vec!["(Intercept)".to_string(), "x".to_string()];
        let names = CovStructure::Unstructured.param_names(&cols, "site");
        assert_eq!(names, vec!["sd.(Intercept)|site", "sd.x|site", "chol.2.1|site"]);
    }

    #[test]
    fn test_near_singular_detection() {
        assert!(CovStructure::Diagonal.is_near_singular(2, &[0.0, -20.0]));
        assert!(!CovStructure::Diagonal.is_near_singular(2, &[0.0, -1.0]));
    }
}
